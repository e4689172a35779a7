//! Observation surface: `bot.*` and `world.*`
//!
//! Read-only views of the agent and its surroundings. Observations are not
//! capability gated; they only require the agent to be bound.

use mineflare_core::{
    geometry,
    value::{Position, WorldTime},
};

use super::{Ctx, ctx_native, map_arg, ok_json, ok_map, position_from, position_value};
use crate::script::{Env, Value, value::Interrupt};

pub const SEA_LEVEL: f64 = 63.0;

/// Block kinds treated as passable when ray-marching line of sight.
fn is_empty_kind(kind: Option<&str>) -> bool {
    matches!(kind, None | Some("air") | Some("cave_air") | Some("void_air"))
}

pub(super) fn install(ctx: &Ctx, env: &Env) {
    env.define(
        "bot.getState",
        ctx_native("bot.getState", ctx, |ctx, _interp, _args| async move {
            let agent = ctx.agent()?;
            let state = agent.state().await?;
            Ok(ok_json(&serde_json::to_value(&state).map_err(|err| {
                Interrupt::runtime(format!("state snapshot failed to serialize: {err}"))
            })?))
        }),
    );

    env.define(
        "world.scan.blocks",
        ctx_native("world.scan.blocks", ctx, |ctx, _interp, args| async move {
            let opts = map_arg(&args, 0, "options")?;
            let radius = match opts.get("radius") {
                Some(Value::Num(r)) if *r >= 0.0 => *r as i64,
                _ => {
                    return Err(Interrupt::invalid_argument(
                        "scan requires a non-negative :radius",
                    ));
                }
            };
            let max = match opts.get("max") {
                Some(Value::Num(m)) if *m >= 0.0 => *m as usize,
                _ => 100,
            };
            let kinds: Vec<String> = match opts.get("kinds") {
                Some(Value::Vector(items)) => items
                    .iter()
                    .filter_map(|v| v.as_key().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };

            let agent = ctx.agent()?;
            let state = agent.state().await?;
            let (cx, cy, cz) = state.position.block();

            // Deterministic traversal: x outer, y middle, z inner, ascending.
            let mut matches = Vec::new();
            'scan: for dx in -radius..=radius {
                for dy in -radius..=radius {
                    for dz in -radius..=radius {
                        if dx * dx + dy * dy + dz * dz > radius * radius {
                            continue;
                        }
                        let at = Position::new(
                            (cx + dx) as f64,
                            (cy + dy) as f64,
                            (cz + dz) as f64,
                        );
                        let Some(kind) = agent.block_at(at).await? else {
                            continue;
                        };
                        if !kinds.is_empty() && !kinds.iter().any(|k| kind.contains(k.as_str())) {
                            continue;
                        }
                        let mut hit = std::collections::BTreeMap::new();
                        hit.insert("position".to_string(), position_value(&at));
                        hit.insert("kind".to_string(), Value::string(&kind));
                        matches.push(Value::map(hit));
                        if matches.len() >= max {
                            break 'scan;
                        }
                    }
                }
            }
            Ok(ok_map(Value::vector(matches)))
        }),
    );

    env.define(
        "world.scan.lineOfSight",
        ctx_native(
            "world.scan.lineOfSight",
            ctx,
            |ctx, _interp, args| async move {
                let opts = map_arg(&args, 0, "options")?;
                let target = position_from(opts.get("target").ok_or_else(|| {
                    Interrupt::invalid_argument("lineOfSight requires a :target position")
                })?)?;
                let max_steps = match opts.get("maxSteps") {
                    Some(Value::Num(n)) if *n >= 0.0 => *n as usize,
                    _ => 64,
                };

                let agent = ctx.agent()?;
                let state = agent.state().await?;
                let origin = state.position;
                let total = origin.distance_to(&target);
                let steps = (total.ceil() as usize).min(max_steps);
                let dir = geometry::normalize(&geometry::sub(&target, &origin));

                let mut clear = true;
                for i in 1..=steps {
                    let probe = geometry::add(&origin, &geometry::scale(&dir, i as f64));
                    if probe.distance_to(&origin) >= total {
                        break;
                    }
                    let kind = agent.block_at(geometry::floor_pos(&probe)).await?;
                    if !is_empty_kind(kind.as_deref()) {
                        clear = false;
                        break;
                    }
                }
                Ok(ok_map(Value::Bool(clear)))
            },
        ),
    );

    env.define(
        "world.time",
        ctx_native("world.time", ctx, |ctx, _interp, _args| async move {
            let agent = ctx.agent()?;
            let ticks = agent.world_time().await?;
            let time = WorldTime::from_ticks(ticks);
            Ok(ok_json(&serde_json::to_value(time).map_err(|err| {
                Interrupt::runtime(format!("world time failed to serialize: {err}"))
            })?))
        }),
    );

    env.define(
        "world.seaLevel",
        Value::native_pure("world.seaLevel", |_args| Ok(Value::Num(SEA_LEVEL))),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::eval_in_context;
    use crate::testing::MockAgent;
    use mineflare_core::error::ErrorKind;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn scan_blocks_filters_kinds_in_deterministic_order() {
        let agent = Arc::new(MockAgent::new());
        agent.set_block(1, 64, 0, "stone");
        agent.set_block(0, 64, 1, "stone");
        agent.set_block(0, 65, 0, "oak_log");
        agent.set_block(4, 64, 0, "stone"); // outside radius 2

        let out = eval_in_context(
            agent.clone(),
            &[],
            r#"(world.scan.blocks {:radius 2 :kinds ["stone"]})"#,
        )
        .await
        .unwrap();
        // x outer, y middle, z inner, ascending: dx=0 hits come before dx=1.
        assert_eq!(
            out.to_json(),
            json!({"ok": true, "value": [
                {"kind": "stone", "position": {"x": 0.0, "y": 64.0, "z": 1.0}},
                {"kind": "stone", "position": {"x": 1.0, "y": 64.0, "z": 0.0}},
            ]})
        );

        let capped = eval_in_context(
            agent.clone(),
            &[],
            r#"(world.scan.blocks {:radius 2 :kinds ["stone"] :max 1})"#,
        )
        .await
        .unwrap();
        assert_eq!(capped.to_json()["value"].as_array().unwrap().len(), 1);

        // Kind filters are substring matches.
        let logs = eval_in_context(
            agent,
            &[],
            r#"(world.scan.blocks {:radius 2 :kinds ["log"]})"#,
        )
        .await
        .unwrap();
        assert_eq!(
            logs.to_json()["value"],
            json!([{"kind": "oak_log", "position": {"x": 0.0, "y": 65.0, "z": 0.0}}])
        );
    }

    #[tokio::test]
    async fn line_of_sight_marches_from_current_position() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"(world.scan.lineOfSight {:target {:x 0 :y 64 :z 4}})"#;

        let clear = eval_in_context(agent.clone(), &[], source).await.unwrap();
        assert_eq!(clear.to_json(), json!({"ok": true, "value": true}));

        // A block on the foot-level ray obstructs it.
        agent.set_block(0, 64, 2, "stone");
        let blocked = eval_in_context(agent, &[], source).await.unwrap();
        assert_eq!(blocked.to_json(), json!({"ok": true, "value": false}));
    }

    #[tokio::test]
    async fn world_time_reports_day_boundary() {
        let agent = Arc::new(MockAgent::new());
        agent.set_ticks(13_000);
        let night = eval_in_context(agent.clone(), &[], "(world.time)")
            .await
            .unwrap();
        assert_eq!(
            night.to_json(),
            json!({"ok": true, "value": {"dayTime": 13000.0, "isDay": false}})
        );

        agent.set_ticks(1_000);
        let day = eval_in_context(agent, &[], "(world.time)").await.unwrap();
        assert_eq!(day.to_json()["value"]["isDay"], true);
    }

    #[tokio::test]
    async fn sea_level_is_constant() {
        let agent = Arc::new(MockAgent::new());
        let out = eval_in_context(agent, &[], "(world.seaLevel)").await.unwrap();
        assert_eq!(out, Value::Num(63.0));
    }

    #[tokio::test]
    async fn get_state_reflects_the_agent_snapshot() {
        let agent = Arc::new(MockAgent::new());
        let out = eval_in_context(agent, &[], "(bot.getState)").await.unwrap();
        let state = out.to_json()["value"].clone();
        assert_eq!(state["position"], json!({"x": 0.0, "y": 64.0, "z": 0.0}));
        assert_eq!(state["health"], 20.0);
        assert_eq!(state["onGround"], true);
    }

    #[tokio::test]
    async fn observations_require_a_bound_agent() {
        let agent = Arc::new(MockAgent::new());
        agent.set_connected(false);
        let err = eval_in_context(agent, &[], "(bot.getState)")
            .await
            .unwrap_err();
        let Interrupt::Error(err) = err else {
            panic!("expected typed error");
        };
        assert_eq!(err.kind, ErrorKind::ExternalDisconnected);
    }
}
