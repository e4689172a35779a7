//! Event surface: `events.*`
//!
//! Handler registration and invocation-scoped emission. Agent events reach
//! these handlers through the context's event pump when the `events`
//! capability is effective; `events.emit` never crosses invocation
//! boundaries.

use mineflare_core::capability::Capability;

use super::{Ctx, ctx_native, opt_arg, str_arg};
use crate::script::{Env, Value, value::callable_arg};

pub(super) fn install(ctx: &Ctx, env: &Env) {
    env.define(
        "events.on",
        ctx_native("events.on", ctx, |ctx, _interp, args| async move {
            ctx.require_any(&[Capability::Events])?;
            let name = str_arg(&args, 0, "event name")?;
            let handler = callable_arg(&args, 1, "handler")?;

            let id = {
                let mut registry = ctx.handlers().lock();
                registry.next_id += 1;
                let id = registry.next_id;
                registry
                    .by_name
                    .entry(name.clone())
                    .or_default()
                    .push((id, handler));
                id
            };

            // The disposer unregisters exactly this handler.
            let disposer_ctx = ctx.clone();
            Ok(Value::native("events.dispose", move |_interp, _args| {
                let ctx = disposer_ctx.clone();
                let name = name.clone();
                Box::pin(async move {
                    let mut registry = ctx.handlers().lock();
                    if let Some(handlers) = registry.by_name.get_mut(&name) {
                        handlers.retain(|(hid, _)| *hid != id);
                    }
                    Ok(Value::Nil)
                })
            }))
        }),
    );

    env.define(
        "events.emit",
        ctx_native("events.emit", ctx, |ctx, interp, args| async move {
            ctx.require_any(&[Capability::Events])?;
            let name = str_arg(&args, 0, "event name")?;
            let payload = opt_arg(&args, 1).unwrap_or(Value::Nil);
            let delivered = ctx.dispatch_event(&interp, &name, payload).await?;
            Ok(Value::Num(delivered as f64))
        }),
    );
}

#[cfg(test)]
mod tests {
    use crate::context::eval_in_context;
    use crate::script::value::Interrupt;
    use crate::testing::MockAgent;
    use mineflare_core::error::ErrorKind;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn emit_returns_the_delivered_handler_count() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"
            (def seen [])
            (events.on "ping" (fn [p] (set! seen (push seen p))))
            (events.on "ping" (fn [p] (set! seen (push seen p))))
            (def delivered (events.emit "ping" 7))
            (def missed (events.emit "pong" 1))
            [delivered missed seen]
        "#;
        let out = eval_in_context(agent, &["events"], source).await.unwrap();
        assert_eq!(out.to_json(), json!([2.0, 0.0, [7.0, 7.0]]));
    }

    #[tokio::test]
    async fn disposers_unregister_exactly_their_handler() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"
            (def seen [])
            (def dispose (events.on "ping" (fn [p] (set! seen (push seen :a)))))
            (events.on "ping" (fn [p] (set! seen (push seen :b))))
            (dispose)
            (def delivered (events.emit "ping" nil))
            [delivered seen]
        "#;
        let out = eval_in_context(agent, &["events"], source).await.unwrap();
        assert_eq!(out.to_json(), json!([1.0, ["b"]]));
    }

    #[tokio::test]
    async fn event_surface_requires_the_events_capability() {
        let agent = Arc::new(MockAgent::new());
        for source in [
            r#"(events.on "ping" (fn [p] p))"#,
            r#"(events.emit "ping" 1)"#,
        ] {
            let err = eval_in_context(agent.clone(), &[], source).await.unwrap_err();
            let Interrupt::Error(err) = err else {
                panic!("expected typed error for {source}");
            };
            assert_eq!(err.kind, ErrorKind::Capability);
            assert!(err.message.contains("events"));
        }
    }
}
