//! Flow surface: `flow.*`
//!
//! Thin bindings from script values onto the combinators in
//! [`crate::flow`]. Operations are zero-argument script functions; the
//! per-operation timeout runs on the sandbox clock and drops the losing
//! future at its next suspension point.

use super::{Ctx, ctx_native, num_arg, opt_arg, vector_arg};
use crate::{
    flow,
    script::{Env, Value, value::Interrupt, value::callable_arg},
};

pub(super) fn install(ctx: &Ctx, env: &Env) {
    env.define(
        "flow.withTimeout",
        ctx_native("flow.withTimeout", ctx, |_ctx, interp, args| async move {
            let op = callable_arg(&args, 0, "operation")?;
            let ms = num_arg(&args, 1, "ms")?;
            let label = match opt_arg(&args, 2) {
                Some(Value::Str(s)) => s.to_string(),
                _ => "operation".to_string(),
            };
            flow::with_timeout(interp.call_value(&op, Vec::new()), ms, &label).await
        }),
    );

    env.define(
        "flow.retryBudget",
        ctx_native("flow.retryBudget", ctx, |_ctx, interp, args| async move {
            let op = callable_arg(&args, 0, "operation")?;
            let opts = match opt_arg(&args, 1) {
                Some(Value::Map(map)) => map.as_ref().clone(),
                _ => Default::default(),
            };
            flow::retry_budget(&interp, op, &opts).await
        }),
    );

    env.define(
        "flow.transaction",
        ctx_native("flow.transaction", ctx, |_ctx, interp, args| async move {
            let steps = vector_arg(&args, 0, "steps")?;
            flow::transaction(&interp, &steps).await
        }),
    );

    env.define(
        "flow.parallel",
        ctx_native("flow.parallel", ctx, |_ctx, interp, args| async move {
            let ops = vector_arg(&args, 0, "operations")?;
            for op in ops.iter() {
                if !op.is_callable() {
                    return Err(Interrupt::invalid_argument(
                        "parallel operations must be functions",
                    ));
                }
            }
            let concurrency = match opt_arg(&args, 1) {
                Some(Value::Num(n)) if n >= 1.0 => n as usize,
                _ => 4,
            };
            flow::parallel(&interp, &ops, concurrency).await
        }),
    );

    let sleep_ctx = ctx.clone();
    env.define(
        "flow.sleep",
        Value::native("flow.sleep", move |_interp, args| {
            let ctx = sleep_ctx.clone();
            Box::pin(async move {
                let ms = num_arg(&args, 0, "ms")?;
                flow::sleep_for(ms, ctx.cancellation()).await
            })
        }),
    );
}
