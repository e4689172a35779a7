//! Flow combinators
//!
//! Timeout, retry, transaction and bounded-parallel composition over script
//! operations, plus the cancellable sleep every suspension goes through.
//! Combinators speak the result-map currency: operation failures come back
//! as fail-maps, while sentinels (`control.success` / `control.fail`) and
//! cancellation pass through untouched.

use std::{collections::BTreeMap, time::Duration};

use futures::{StreamExt, future::BoxFuture, stream};
use tokio_util::sync::CancellationToken;

use mineflare_core::error::{ErrorKind, ProgramError};

use crate::script::{
    Interp, Value,
    value::{Interrupt, error_value, fail_value, ok_value, result_error, result_ok},
};

/// Suspends for at least `ms`, resolving early only on cancellation.
pub async fn sleep_for(ms: f64, cancellation: &CancellationToken) -> Result<Value, Interrupt> {
    let duration = Duration::from_millis(ms.max(0.0) as u64);
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(Interrupt::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(Value::Nil),
    }
}

/// Races `op` against a deadline. The operation's own outcome is forwarded
/// when it finishes first; otherwise the operation is dropped at its next
/// suspension point and a TIMEOUT fail-map is returned.
pub async fn with_timeout(
    op: BoxFuture<'static, Result<Value, Interrupt>>,
    ms: f64,
    label: &str,
) -> Result<Value, Interrupt> {
    let duration = Duration::from_millis(ms.max(0.0) as u64);
    match tokio::time::timeout(duration, op).await {
        Ok(outcome) => outcome,
        Err(_) => Ok(fail_value(
            ErrorKind::Timeout,
            format!("{label} timed out after {ms}ms"),
            None,
        )),
    }
}

/// Default retry policy: capability violations never retry; quota
/// exhaustion retries only when the per-minute window can advance past it.
pub fn default_retryable(err: &ProgramError) -> bool {
    match err.kind {
        ErrorKind::Capability => false,
        ErrorKind::ResourceLimit => err
            .detail
            .as_ref()
            .and_then(|d| d.get("scope"))
            .and_then(|s| s.as_str())
            == Some("perMinute"),
        _ => true,
    }
}

/// Retries `op` up to `tries` attempts with exponential backoff between
/// failed attempts. `shouldRetry` and `onRetry` callbacks receive the error
/// map of the last failure.
pub async fn retry_budget(
    interp: &Interp,
    op: Value,
    opts: &BTreeMap<String, Value>,
) -> Result<Value, Interrupt> {
    let tries = (opt_num(opts, "tries").unwrap_or(3.0).max(1.0)) as u32;
    let base_delay = opt_num(opts, "baseDelayMs").unwrap_or(1000.0).max(0.0);
    let max_delay = opt_num(opts, "maxDelayMs").unwrap_or(30_000.0).max(0.0);
    let should_retry = opt_callable(opts, "shouldRetry");
    let on_retry = opt_callable(opts, "onRetry");

    let mut last_error = ProgramError::operation_failed("operation failed");
    let mut attempts = 0u32;
    for attempt in 1..=tries {
        attempts = attempt;
        match interp.apply(op.clone(), Vec::new()).await {
            Ok(value) => {
                if result_ok(&value) != Some(false) {
                    return Ok(with_attempts(value, attempt));
                }
                last_error = result_error(&value)
                    .unwrap_or_else(|| ProgramError::operation_failed("operation failed"));
            }
            Err(Interrupt::Error(err)) => last_error = err,
            Err(other) => return Err(other),
        }

        if attempt == tries {
            break;
        }
        let proceed = match &should_retry {
            Some(f) => {
                interp
                    .apply(f.clone(), vec![error_value(&last_error)])
                    .await?
                    .truthy()
            }
            None => default_retryable(&last_error),
        };
        if !proceed {
            break;
        }
        if let Some(f) = &on_retry {
            interp
                .apply(
                    f.clone(),
                    vec![error_value(&last_error), Value::Num(attempt as f64)],
                )
                .await?;
        }
        let delay = (base_delay * 2f64.powi(attempt as i32 - 1)).min(max_delay);
        sleep_for(delay, interp.cancellation()).await?;
    }

    let mut detail = BTreeMap::new();
    detail.insert("attempts".to_string(), Value::Num(attempts as f64));
    detail.insert("lastError".to_string(), error_value(&last_error));
    Ok(fail_value(
        last_error.kind,
        format!("Failed after {attempts} attempts: {}", last_error.message),
        Some(Value::map(detail)),
    ))
}

/// Applies steps in order; on the first failure, runs the rollbacks of the
/// completed steps in reverse. A failing rollback is logged and skipped so
/// it never masks the original failure.
pub async fn transaction(interp: &Interp, steps: &[Value]) -> Result<Value, Interrupt> {
    let mut completed: Vec<(String, Option<Value>)> = Vec::new();
    for (i, step) in steps.iter().enumerate() {
        let Value::Map(step) = step else {
            return Err(Interrupt::invalid_argument(
                "transaction steps must be maps with :operation",
            ));
        };
        let name = step
            .get("name")
            .and_then(|v| v.as_key().map(str::to_string))
            .unwrap_or_else(|| format!("step-{i}"));
        let operation = match step.get("operation") {
            Some(op) if op.is_callable() => op.clone(),
            _ => {
                return Err(Interrupt::invalid_argument(format!(
                    "transaction step {name} is missing a callable :operation"
                )));
            }
        };
        let rollback = step
            .get("rollback")
            .filter(|v| v.is_callable())
            .cloned();

        let failure = match interp.apply(operation, Vec::new()).await {
            Ok(value) if result_ok(&value) == Some(false) => Some(
                result_error(&value)
                    .unwrap_or_else(|| ProgramError::operation_failed("step failed")),
            ),
            Ok(_) => None,
            Err(Interrupt::Error(err)) => Some(err),
            Err(other) => return Err(other),
        };

        match failure {
            None => completed.push((name, rollback)),
            Some(err) => {
                for (done, rb) in completed.iter().rev() {
                    let Some(rb) = rb else { continue };
                    match interp.apply(rb.clone(), Vec::new()).await {
                        Ok(value) if result_ok(&value) == Some(false) => {
                            log::warn!(
                                "transaction rollback of step {done} failed: {:?}",
                                result_error(&value)
                            );
                        }
                        Ok(_) => {}
                        Err(Interrupt::Error(rb_err)) => {
                            log::warn!("transaction rollback of step {done} failed: {rb_err}");
                        }
                        Err(other) => return Err(other),
                    }
                }
                let mut detail = BTreeMap::new();
                detail.insert(
                    "completedSteps".to_string(),
                    Value::vector(
                        completed
                            .iter()
                            .map(|(n, _)| Value::string(n))
                            .collect(),
                    ),
                );
                detail.insert("failedStep".to_string(), Value::string(&name));
                return Ok(fail_value(
                    err.kind,
                    format!("Transaction failed at step {name}: {}", err.message),
                    Some(Value::map(detail)),
                ));
            }
        }
    }

    let mut summary = BTreeMap::new();
    summary.insert(
        "completedSteps".to_string(),
        Value::vector(completed.iter().map(|(n, _)| Value::string(n)).collect()),
    );
    Ok(ok_value(Value::map(summary)))
}

/// Runs operations with at most `concurrency` in flight. Results keep the
/// input order regardless of completion order; the overall result is ok iff
/// every operation succeeded.
pub async fn parallel(
    interp: &Interp,
    ops: &[Value],
    concurrency: usize,
) -> Result<Value, Interrupt> {
    let concurrency = concurrency.max(1);
    let futures: Vec<BoxFuture<'static, Result<Value, Interrupt>>> =
        ops.iter().map(|op| interp.call_value(op, Vec::new())).collect();
    let settled: Vec<Result<Value, Interrupt>> =
        stream::iter(futures).buffered(concurrency).collect().await;

    let mut results = Vec::with_capacity(settled.len());
    let mut failures = 0usize;
    for outcome in settled {
        match outcome {
            Ok(value) => {
                if result_ok(&value) == Some(false) {
                    failures += 1;
                }
                results.push(value);
            }
            Err(Interrupt::Error(err)) => {
                failures += 1;
                results.push(error_value(&err));
            }
            Err(other) => return Err(other),
        }
    }

    if failures == 0 {
        Ok(ok_value(Value::vector(results)))
    } else {
        Ok(fail_value(
            ErrorKind::OperationFailed,
            format!("{failures} of {} operations failed", results.len()),
            Some(Value::vector(results)),
        ))
    }
}

fn with_attempts(value: Value, attempts: u32) -> Value {
    match value {
        Value::Map(map) => {
            let mut out = map.as_ref().clone();
            out.insert("attempts".to_string(), Value::Num(attempts as f64));
            Value::map(out)
        }
        other => other,
    }
}

fn opt_num(opts: &BTreeMap<String, Value>, key: &str) -> Option<f64> {
    match opts.get(key) {
        Some(Value::Num(n)) => Some(*n),
        _ => None,
    }
}

fn opt_callable(opts: &BTreeMap<String, Value>, key: &str) -> Option<Value> {
    opts.get(key).filter(|v| v.is_callable()).cloned()
}
