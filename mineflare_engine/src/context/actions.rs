//! Side-effecting surface: `actions.*`
//!
//! Every operation here admits through the budget (capability membership
//! first, then quotas) before anything reaches the external agent, so a
//! denied operation never produces an instruction. Operation-level
//! failures come back as fail-maps; a disconnected agent raises.

use std::sync::Arc;

use mineflare_core::{
    agent::{AgentHandle, Instruction},
    capability::Capability,
    error::{ErrorKind, ProgramError},
    geometry,
    value::Position,
};

use super::{
    Ctx, agent_failure, ctx_native, fail_map, map_arg, ok_json, ok_map, opt_arg, position_from,
    position_value, str_arg,
};
use crate::script::{Env, Value, value::Interrupt, value::result_ok};

/// Item names that count as building blocks for `requireBlocks`.
const BUILDING_BLOCKS: [&str; 8] = [
    "dirt",
    "cobblestone",
    "stone",
    "netherrack",
    "planks",
    "sand",
    "gravel",
    "deepslate",
];

fn is_building_block(name: &str) -> bool {
    BUILDING_BLOCKS.iter().any(|b| name.contains(b))
}

fn is_gatherable(kind: &str) -> bool {
    ["dirt", "grass_block", "stone", "cobblestone", "netherrack"]
        .iter()
        .any(|b| kind.contains(b))
}

fn is_crafting_table(kind: &str) -> bool {
    kind == "crafting_table"
}

pub(super) fn install(ctx: &Ctx, env: &Env) {
    install_navigate(ctx, env);
    install_gather(ctx, env);
    install_craft(ctx, env);
    install_inventory(ctx, env);
    install_build_combat(ctx, env);
    install_chat(ctx, env);
    install_search(ctx, env);
}

/// Forwards one instruction, mapping generic agent failures to
/// `failure_kind`. Disconnection bubbles unchanged as a raised error.
async fn forward(
    ctx: &Ctx,
    failure_kind: ErrorKind,
    instruction: Instruction,
) -> Result<Value, Interrupt> {
    let agent = ctx.agent()?;
    match agent.execute(instruction).await {
        Ok(outcome) => Ok(ok_json(&outcome)),
        Err(err) if err.kind == ErrorKind::ExternalDisconnected => Err(err.into()),
        Err(err) => Ok(agent_failure(failure_kind, err)),
    }
}

/// Navigation admission: requires `move` or `pathfind`, accounted against
/// whichever is effective (`move` carries the quota rows).
fn admit_navigation(ctx: &Ctx) -> Result<(), ProgramError> {
    ctx.require_any(&[Capability::Move, Capability::Pathfind])?;
    let account = if ctx.capabilities().contains(Capability::Move) {
        Capability::Move
    } else {
        Capability::Pathfind
    };
    ctx.admit(account, 1)
}

async fn goto(ctx: &Ctx, target: Position, timeout_ms: Option<u64>) -> Result<Value, Interrupt> {
    admit_navigation(ctx)?;
    forward(ctx, ErrorKind::Pathfind, Instruction::Goto { target, timeout_ms }).await
}

fn install_navigate(ctx: &Ctx, env: &Env) {
    env.define(
        "actions.navigate.goto",
        ctx_native("actions.navigate.goto", ctx, |ctx, _interp, args| async move {
            let target = position_from(&args.first().cloned().ok_or_else(|| {
                Interrupt::invalid_argument("goto requires a target position")
            })?)?;
            let timeout_ms = match opt_arg(&args, 1) {
                Some(Value::Map(opts)) => match opts.get("timeoutMs") {
                    Some(Value::Num(ms)) if *ms > 0.0 => Some(*ms as u64),
                    _ => None,
                },
                _ => None,
            };
            goto(&ctx, target, timeout_ms).await
        }),
    );

    env.define(
        "actions.navigate.stop",
        ctx_native("actions.navigate.stop", ctx, |ctx, _interp, _args| async move {
            ctx.require_any(&[Capability::Move, Capability::Pathfind])?;
            forward(&ctx, ErrorKind::Pathfind, Instruction::Stop).await
        }),
    );
}

fn install_gather(ctx: &Ctx, env: &Env) {
    env.define(
        "actions.gather.mineBlock",
        ctx_native("actions.gather.mineBlock", ctx, |ctx, _interp, args| async move {
            let opts = map_arg(&args, 0, "options")?;
            let position = position_from(opts.get("position").ok_or_else(|| {
                Interrupt::invalid_argument("mineBlock requires a :position")
            })?)?;
            ctx.admit(Capability::Dig, 1)?;

            if let Some(Value::Str(expect)) = opts.get("expect") {
                let agent = ctx.agent()?;
                let found = agent.block_at(geometry::floor_pos(&position)).await?;
                let matches = found.as_deref().is_some_and(|kind| kind.contains(&**expect));
                if !matches {
                    return Ok(fail_map(
                        ErrorKind::Precondition,
                        format!(
                            "expected block matching {:?} at {position}, found {}",
                            &**expect,
                            found.as_deref().unwrap_or("nothing")
                        ),
                        None,
                    ));
                }
            }
            forward(&ctx, ErrorKind::OperationFailed, Instruction::Dig { position }).await
        }),
    );
}

fn install_craft(ctx: &Ctx, env: &Env) {
    env.define(
        "actions.craft.craft",
        ctx_native("actions.craft.craft", ctx, |ctx, _interp, args| async move {
            let recipe = str_arg(&args, 0, "recipe")?;
            let count = match opt_arg(&args, 1) {
                Some(Value::Num(n)) if n >= 1.0 => n as u32,
                _ => 1,
            };
            ctx.admit(Capability::Craft, 1)?;
            forward(
                &ctx,
                ErrorKind::OperationFailed,
                Instruction::Craft { recipe, count },
            )
            .await
        }),
    );

    env.define(
        "actions.craft.ensureCraftingTable",
        ctx_native(
            "actions.craft.ensureCraftingTable",
            ctx,
            |ctx, _interp, _args| async move {
                ctx.admit(Capability::Craft, 1)?;
                let agent = ctx.agent()?;
                let state = agent.state().await?;

                // A table within reach is good enough.
                if let Some((at, _)) =
                    nearby_block(&agent, &state.position, 4, is_crafting_table).await?
                {
                    let mut found = std::collections::BTreeMap::new();
                    found.insert("position".to_string(), position_value(&at));
                    found.insert("placed".to_string(), Value::Bool(false));
                    return Ok(ok_map(Value::map(found)));
                }

                let holding = agent
                    .inventory()
                    .await?
                    .iter()
                    .any(|item| item.name == "crafting_table" && item.count > 0);
                if !holding {
                    let crafted = forward(
                        &ctx,
                        ErrorKind::OperationFailed,
                        Instruction::Craft {
                            recipe: "crafting_table".to_string(),
                            count: 1,
                        },
                    )
                    .await?;
                    if result_ok(&crafted) == Some(false) {
                        return Ok(crafted);
                    }
                }

                let spot = geometry::floor_pos(&state.position.offset(1.0, 0.0, 0.0));
                let placed = forward(
                    &ctx,
                    ErrorKind::OperationFailed,
                    Instruction::Place {
                        position: spot,
                        item: Some("crafting_table".to_string()),
                    },
                )
                .await?;
                if result_ok(&placed) == Some(false) {
                    return Ok(placed);
                }
                let mut out = std::collections::BTreeMap::new();
                out.insert("position".to_string(), position_value(&spot));
                out.insert("placed".to_string(), Value::Bool(true));
                Ok(ok_map(Value::map(out)))
            },
        ),
    );
}

fn install_inventory(ctx: &Ctx, env: &Env) {
    env.define(
        "actions.inventory.get",
        ctx_native("actions.inventory.get", ctx, |ctx, _interp, _args| async move {
            ctx.admit(Capability::Inventory, 1)?;
            let agent = ctx.agent()?;
            let items = agent.inventory().await?;
            Ok(ok_json(&serde_json::to_value(&items).map_err(|err| {
                Interrupt::runtime(format!("inventory failed to serialize: {err}"))
            })?))
        }),
    );

    env.define(
        "actions.inventory.equip",
        ctx_native("actions.inventory.equip", ctx, |ctx, _interp, args| async move {
            let opts = map_arg(&args, 0, "options")?;
            let item = match opts.get("item") {
                Some(Value::Str(s)) => s.to_string(),
                _ => return Err(Interrupt::invalid_argument("equip requires an :item name")),
            };
            let destination = match opts.get("destination") {
                Some(Value::Str(s)) => Some(s.to_string()),
                _ => None,
            };
            ctx.admit(Capability::Inventory, 1)?;
            forward(
                &ctx,
                ErrorKind::OperationFailed,
                Instruction::Equip { item, destination },
            )
            .await
        }),
    );

    env.define(
        "actions.inventory.requireBlocks",
        ctx_native(
            "actions.inventory.requireBlocks",
            ctx,
            |ctx, _interp, args| async move {
                let opts = map_arg(&args, 0, "options")?;
                let needed = match opts.get("count") {
                    Some(Value::Num(n)) if *n >= 1.0 => *n as u64,
                    _ => {
                        return Err(Interrupt::invalid_argument(
                            "requireBlocks requires a positive :count",
                        ));
                    }
                };
                let allow_gather = opts
                    .get("allowGather")
                    .is_some_and(Value::truthy);

                ctx.admit(Capability::Inventory, 1)?;
                let agent = ctx.agent()?;
                let mut have = count_building_blocks(&agent).await?;
                if have >= needed {
                    return Ok(ok_map(count_value(have)));
                }
                if !allow_gather {
                    return Ok(fail_map(
                        ErrorKind::Precondition,
                        format!("need {needed} building blocks, have {have}"),
                        None,
                    ));
                }

                // Gather until satisfied: navigate to the nearest gatherable
                // block and dig it. Each round consumes move and dig budget,
                // which bounds the loop.
                while have < needed {
                    let state = agent.state().await?;
                    let Some((target, _)) =
                        nearby_block(&agent, &state.position, 6, is_gatherable).await?
                    else {
                        return Ok(fail_map(
                            ErrorKind::Precondition,
                            format!(
                                "no gatherable blocks nearby; need {needed}, have {have}"
                            ),
                            None,
                        ));
                    };
                    let moved = goto(&ctx, target.offset(1.0, 0.0, 0.0), None).await?;
                    if result_ok(&moved) == Some(false) {
                        return Ok(moved);
                    }
                    ctx.admit(Capability::Dig, 1)?;
                    let dug = forward(
                        &ctx,
                        ErrorKind::OperationFailed,
                        Instruction::Dig { position: target },
                    )
                    .await?;
                    if result_ok(&dug) == Some(false) {
                        return Ok(dug);
                    }
                    have = count_building_blocks(&agent).await?;
                }
                Ok(ok_map(count_value(have)))
            },
        ),
    );
}

fn install_build_combat(ctx: &Ctx, env: &Env) {
    env.define(
        "actions.build.placeBlock",
        ctx_native("actions.build.placeBlock", ctx, |ctx, _interp, args| async move {
            let opts = map_arg(&args, 0, "options")?;
            let position = position_from(opts.get("position").ok_or_else(|| {
                Interrupt::invalid_argument("placeBlock requires a :position")
            })?)?;
            let item = match opts.get("item") {
                Some(Value::Str(s)) => Some(s.to_string()),
                _ => None,
            };
            ctx.admit(Capability::Place, 1)?;
            forward(
                &ctx,
                ErrorKind::OperationFailed,
                Instruction::Place { position, item },
            )
            .await
        }),
    );

    env.define(
        "actions.combat.attack",
        ctx_native("actions.combat.attack", ctx, |ctx, _interp, args| async move {
            let entity_id = match opt_arg(&args, 0) {
                Some(Value::Map(opts)) => match opts.get("entityId") {
                    Some(Value::Num(id)) => Some(*id as i64),
                    _ => None,
                },
                _ => None,
            };
            ctx.admit(Capability::Attack, 1)?;
            forward(
                &ctx,
                ErrorKind::OperationFailed,
                Instruction::Attack { entity_id },
            )
            .await
        }),
    );

    env.define(
        "actions.look.at",
        ctx_native("actions.look.at", ctx, |ctx, _interp, args| async move {
            let target = position_from(&args.first().cloned().ok_or_else(|| {
                Interrupt::invalid_argument("look requires a target position")
            })?)?;
            ctx.admit(Capability::Look, 1)?;
            forward(&ctx, ErrorKind::OperationFailed, Instruction::Look { target }).await
        }),
    );
}

fn install_chat(ctx: &Ctx, env: &Env) {
    // Chat has no capability token; it is gated only on connectivity.
    env.define(
        "actions.chat.say",
        ctx_native("actions.chat.say", ctx, |ctx, _interp, args| async move {
            let message = str_arg(&args, 0, "message")?;
            forward(&ctx, ErrorKind::OperationFailed, Instruction::Chat { message }).await
        }),
    );
}

fn install_search(ctx: &Ctx, env: &Env) {
    env.define(
        "actions.search.expandSquare",
        ctx_native(
            "actions.search.expandSquare",
            ctx,
            |ctx, interp, args| async move {
                let opts = map_arg(&args, 0, "options")?;
                let radius = match opts.get("radius") {
                    Some(Value::Num(r)) if *r >= 0.0 => *r as i64,
                    _ => {
                        return Err(Interrupt::invalid_argument(
                            "expandSquare requires a non-negative :radius",
                        ));
                    }
                };
                let predicate = match opts.get("predicate") {
                    Some(p) if p.is_callable() => p.clone(),
                    _ => {
                        return Err(Interrupt::invalid_argument(
                            "expandSquare requires a callable :predicate",
                        ));
                    }
                };
                let ring_callback = opts
                    .get("ringCallback")
                    .filter(|v| v.is_callable())
                    .cloned();

                ctx.require_any(&[Capability::Pathfind])?;
                let agent = ctx.agent()?;
                let origin = geometry::floor_pos(&agent.state().await?.position);

                for r in 0..=radius {
                    if let Some(cb) = &ring_callback {
                        interp.apply(cb.clone(), vec![Value::Num(r as f64)]).await?;
                    }
                    for target in geometry::square_ring(&origin, r) {
                        let moved = goto(&ctx, target, None).await?;
                        if result_ok(&moved) == Some(false) {
                            // Unreachable ring position; keep searching.
                            continue;
                        }
                        let verdict = interp
                            .apply(predicate.clone(), vec![position_value(&target)])
                            .await?;
                        if result_ok(&verdict) == Some(true) {
                            return Ok(verdict);
                        }
                    }
                }
                Ok(fail_map(
                    ErrorKind::OperationFailed,
                    format!("expanding search exhausted radius {radius} without a match"),
                    None,
                ))
            },
        ),
    );
}

/// Finds the nearest block within `radius` of `center` whose kind matches
/// `pred`. Ties break lexicographically by position so the choice is
/// deterministic.
async fn nearby_block(
    agent: &Arc<dyn AgentHandle>,
    center: &Position,
    radius: i64,
    pred: fn(&str) -> bool,
) -> Result<Option<(Position, String)>, ProgramError> {
    let (cx, cy, cz) = center.block();
    let mut hits: Vec<(Position, String)> = Vec::new();
    for dx in -radius..=radius {
        for dy in -radius..=radius {
            for dz in -radius..=radius {
                if dx * dx + dy * dy + dz * dz > radius * radius {
                    continue;
                }
                let at = Position::new((cx + dx) as f64, (cy + dy) as f64, (cz + dz) as f64);
                if let Some(kind) = agent.block_at(at).await?
                    && pred(&kind)
                {
                    hits.push((at, kind));
                }
            }
        }
    }
    let reference = Position::new(cx as f64, cy as f64, cz as f64);
    hits.sort_by(|(a, _), (b, _)| {
        a.distance_to(&reference)
            .total_cmp(&b.distance_to(&reference))
            .then_with(|| a.x.total_cmp(&b.x))
            .then_with(|| a.y.total_cmp(&b.y))
            .then_with(|| a.z.total_cmp(&b.z))
    });
    Ok(hits.into_iter().next())
}

async fn count_building_blocks(agent: &Arc<dyn AgentHandle>) -> Result<u64, ProgramError> {
    Ok(agent
        .inventory()
        .await?
        .iter()
        .filter(|item| is_building_block(&item.name))
        .map(|item| item.count as u64)
        .sum())
}

fn count_value(count: u64) -> Value {
    let mut map = std::collections::BTreeMap::new();
    map.insert("count".to_string(), Value::Num(count as f64));
    Value::map(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::eval_in_context;
    use crate::script::value::result_error;
    use crate::testing::MockAgent;
    use mineflare_core::value::ItemStack;
    use serde_json::json;

    fn kinds(agent: &MockAgent) -> Vec<&'static str> {
        agent.instructions().iter().map(Instruction::kind).collect()
    }

    #[tokio::test]
    async fn mine_block_checks_the_expect_precondition() {
        let agent = Arc::new(MockAgent::new());
        agent.set_block(1, 64, 0, "oak_log");

        let wrong = eval_in_context(
            agent.clone(),
            &["dig"],
            r#"(actions.gather.mineBlock {:position {:x 1 :y 64 :z 0} :expect "stone"})"#,
        )
        .await
        .unwrap();
        let err = result_error(&wrong).unwrap();
        assert_eq!(err.kind, ErrorKind::Precondition);
        assert_eq!(agent.instruction_count(), 0);

        let right = eval_in_context(
            agent.clone(),
            &["dig"],
            r#"(actions.gather.mineBlock {:position {:x 1 :y 64 :z 0} :expect "log"})"#,
        )
        .await
        .unwrap();
        assert_eq!(result_ok(&right), Some(true));
        assert_eq!(kinds(&agent), vec!["dig"]);
    }

    #[tokio::test]
    async fn ensure_crafting_table_prefers_a_nearby_table() {
        let agent = Arc::new(MockAgent::new());
        agent.set_block(2, 64, 0, "crafting_table");
        let out = eval_in_context(agent.clone(), &["craft"], "(actions.craft.ensureCraftingTable)")
            .await
            .unwrap();
        assert_eq!(
            out.to_json(),
            json!({"ok": true, "value": {
                "placed": false,
                "position": {"x": 2.0, "y": 64.0, "z": 0.0},
            }})
        );
        assert_eq!(agent.instruction_count(), 0);
    }

    #[tokio::test]
    async fn ensure_crafting_table_crafts_then_places_when_missing() {
        let agent = Arc::new(MockAgent::new());
        let out = eval_in_context(agent.clone(), &["craft"], "(actions.craft.ensureCraftingTable)")
            .await
            .unwrap();
        assert_eq!(out.to_json()["value"]["placed"], true);
        assert_eq!(kinds(&agent), vec!["craft", "place"]);
    }

    #[tokio::test]
    async fn ensure_crafting_table_places_from_inventory_without_crafting() {
        let agent = Arc::new(MockAgent::new());
        agent.set_inventory(vec![ItemStack {
            name: "crafting_table".to_string(),
            count: 1,
        }]);
        let out = eval_in_context(agent.clone(), &["craft"], "(actions.craft.ensureCraftingTable)")
            .await
            .unwrap();
        assert_eq!(result_ok(&out), Some(true));
        assert_eq!(kinds(&agent), vec!["place"]);
    }

    #[tokio::test]
    async fn require_blocks_gathers_until_satisfied() {
        let agent = Arc::new(MockAgent::new());
        agent.set_block(3, 64, 0, "dirt");
        agent.set_block(3, 64, 1, "dirt");

        // Without gathering the shortfall is a precondition failure.
        let short = eval_in_context(
            agent.clone(),
            &["inventory", "move", "dig"],
            "(actions.inventory.requireBlocks {:count 2})",
        )
        .await
        .unwrap();
        assert_eq!(result_error(&short).unwrap().kind, ErrorKind::Precondition);
        assert_eq!(agent.instruction_count(), 0);

        let out = eval_in_context(
            agent.clone(),
            &["inventory", "move", "dig"],
            "(actions.inventory.requireBlocks {:count 2 :allowGather true})",
        )
        .await
        .unwrap();
        assert_eq!(out.to_json()["value"]["count"], 2.0);
        // Nearest block first, one navigate per dig.
        assert_eq!(kinds(&agent), vec!["goto", "dig", "goto", "dig"]);
    }

    #[tokio::test]
    async fn expand_square_walks_rings_in_order() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"
            (def rings [])
            (def visited [])
            (def found (actions.search.expandSquare
              {:radius 1
               :ringCallback (fn [r] (set! rings (push rings r)))
               :predicate (fn [p]
                 (set! visited (push visited [(get p :x) (get p :z)]))
                 (if (and (= (get p :x) 1) (= (get p :z) -1))
                   (ok p)
                   (fail "keep looking")))}))
            [rings visited found]
        "#;
        let out = eval_in_context(agent.clone(), &["pathfind"], source)
            .await
            .unwrap();
        assert_eq!(
            out.to_json(),
            json!([
                [0.0, 1.0],
                // Ring 0 is the center; ring 1 starts on the top edge,
                // west to east, and stops at the match.
                [[0.0, 0.0], [-1.0, -1.0], [0.0, -1.0], [1.0, -1.0]],
                {"ok": true, "value": {"x": 1.0, "y": 64.0, "z": -1.0}},
            ])
        );
        assert_eq!(kinds(&agent), vec!["goto", "goto", "goto", "goto"]);
    }

    #[tokio::test]
    async fn expand_square_exhaustion_is_an_operation_failure() {
        let agent = Arc::new(MockAgent::new());
        let out = eval_in_context(
            agent,
            &["pathfind"],
            r#"(actions.search.expandSquare {:radius 1 :predicate (fn [p] (fail "no"))})"#,
        )
        .await
        .unwrap();
        let err = result_error(&out).unwrap();
        assert_eq!(err.kind, ErrorKind::OperationFailed);
        assert!(err.message.contains("radius 1"));
    }

    #[tokio::test]
    async fn place_attack_look_and_equip_forward_instructions() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"
            (actions.build.placeBlock {:position {:x 0 :y 63 :z 0} :item "stone"})
            (actions.combat.attack {:entityId 9})
            (actions.look.at {:x 5 :y 64 :z 5})
            (actions.inventory.equip {:item "stone_pickaxe"})
        "#;
        let out = eval_in_context(
            agent.clone(),
            &["place", "attack", "look", "inventory"],
            source,
        )
        .await
        .unwrap();
        assert_eq!(result_ok(&out), Some(true));
        assert_eq!(kinds(&agent), vec!["place", "attack", "look", "equip"]);
        assert_eq!(
            agent.instructions()[1],
            Instruction::Attack { entity_id: Some(9) }
        );
    }

    #[tokio::test]
    async fn chat_is_gated_only_on_connectivity() {
        let agent = Arc::new(MockAgent::new());
        let out = eval_in_context(agent.clone(), &[], r#"(actions.chat.say "hello world")"#)
            .await
            .unwrap();
        assert_eq!(result_ok(&out), Some(true));
        assert_eq!(
            agent.instructions()[0],
            Instruction::Chat {
                message: "hello world".to_string()
            }
        );
    }

    #[tokio::test]
    async fn denied_capabilities_never_reach_the_agent() {
        let agent = Arc::new(MockAgent::new());
        for source in [
            r#"(actions.build.placeBlock {:position {:x 0 :y 64 :z 0}})"#,
            r#"(actions.combat.attack {:entityId 1})"#,
            r#"(actions.inventory.requireBlocks {:count 1})"#,
            r#"(actions.search.expandSquare {:radius 1 :predicate (fn [p] (ok p))})"#,
        ] {
            let err = eval_in_context(agent.clone(), &[], source).await.unwrap_err();
            let Interrupt::Error(err) = err else {
                panic!("expected typed error for {source}");
            };
            assert_eq!(err.kind, ErrorKind::Capability);
        }
        assert_eq!(agent.instruction_count(), 0);
    }
}
