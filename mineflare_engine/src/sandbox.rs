//! The sandbox: isolated program evaluation
//!
//! A [`Sandbox`] owns the global environment a program can see, the
//! whole-invocation timeout, the cancellation token and the controlled
//! timer. The base global set is fixed here: the pure builtin library,
//! `defineProgram`, `pos`, `sleep` and the `setTimeout`/`clearTimeout`
//! pair. Context-bound surfaces are installed on top by the context
//! builder before execution.
//!
//! The controlled timer is the only route by which callbacks re-enter user
//! code: scheduled callbacks are pumped on the same logical thread as the
//! program body, so they interleave with it only at suspension points.
//! Pending timers are discarded when the body finishes; the sandbox is
//! destroyed with the invocation.

use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use mineflare_core::{
    Json,
    capability::CapabilitySet,
    error::ProgramError,
    program::ProgramDefinition,
};

use crate::{
    flow,
    script::{
        Env, Interp, Value, builtins, parse,
        value::{self, Interrupt},
    },
};

/// Default whole-invocation timeout: fifteen minutes.
pub const DEFAULT_TIMEOUT_MS: u64 = 900_000;
/// Budget for the throwaway evaluation used by [`Sandbox::validate`].
pub const VALIDATE_TIMEOUT_MS: u64 = 5_000;
/// Upper bound on program source size.
pub const MAX_SOURCE_BYTES: usize = 256 * 1024;

struct TimerEntry {
    id: u64,
    due: tokio::time::Instant,
    callback: Value,
}

#[derive(Default)]
struct TimerQueue {
    next_id: u64,
    entries: Vec<TimerEntry>,
}

pub struct Sandbox {
    globals: Env,
    timeout: Duration,
    cancellation: CancellationToken,
    timers: Arc<Mutex<TimerQueue>>,
    timer_signal: Arc<Notify>,
    used: AtomicBool,
}

impl Sandbox {
    pub fn new(timeout_ms: Option<u64>, cancellation: CancellationToken) -> Self {
        let globals = Env::root();
        builtins::install(&globals);

        let timers = Arc::new(Mutex::new(TimerQueue::default()));
        let timer_signal = Arc::new(Notify::new());
        install_base_globals(&globals, &timers, &timer_signal);

        Self {
            globals,
            timeout: Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
            cancellation,
            timers,
            timer_signal,
            used: AtomicBool::new(false),
        }
    }

    /// The global environment; the context builder installs the per-
    /// invocation API surface here before execution.
    pub fn globals(&self) -> &Env {
        &self.globals
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// An interpreter bound to this sandbox's globals and token.
    pub fn interp(&self) -> Interp {
        Interp::new(self.globals.clone(), self.cancellation.clone())
    }

    /// Aborts any in-flight execution.
    pub fn abort(&self) {
        self.cancellation.cancel();
    }

    /// Evaluates the source and invokes its run handler with `ctx_value`.
    pub async fn execute(&self, source: &str, ctx_value: Value) -> Result<Value, Interrupt> {
        self.execute_with(source, ctx_value, None).await
    }

    /// As [`Sandbox::execute`], with an optional auxiliary pump (the agent
    /// event bridge) raced alongside the body and the timer pump.
    pub async fn execute_with(
        &self,
        source: &str,
        ctx_value: Value,
        aux_pump: Option<futures::future::BoxFuture<'static, Interrupt>>,
    ) -> Result<Value, Interrupt> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(ProgramError::operation_failed(
                "sandbox has already executed a program",
            )
            .into());
        }

        let forms = parse(source)?;
        let interp = self.interp();

        let body = async {
            let env = self.globals.child();
            let evaluated = interp.eval_forms(&forms, &env).await?;
            let handler = run_handler(&evaluated)?;
            interp.apply(handler, vec![ctx_value]).await
        };

        let timer_pump = self.timer_pump(interp.clone());
        let pumps: futures::future::BoxFuture<'_, Interrupt> = match aux_pump {
            None => Box::pin(timer_pump),
            Some(aux) => Box::pin(async move {
                match futures::future::select(Box::pin(timer_pump), aux).await {
                    futures::future::Either::Left((interrupt, _)) => interrupt,
                    futures::future::Either::Right((interrupt, _)) => interrupt,
                }
            }),
        };

        let raced = async {
            match futures::future::select(Box::pin(body), pumps).await {
                futures::future::Either::Left((outcome, _)) => outcome,
                futures::future::Either::Right((interrupt, _)) => Err(interrupt),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(Interrupt::Cancelled),
            outcome = tokio::time::timeout(self.timeout, raced) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(ProgramError::timeout(format!(
                    "program timed out after {}ms",
                    self.timeout.as_millis()
                ))
                .into()),
            },
        }
    }

    /// Compiles without running, then evaluates in a throwaway sandbox with
    /// a short budget to extract the definition metadata. Sources whose
    /// evaluation needs the context surface are invalid by construction:
    /// the throwaway environment has no context installed.
    pub async fn validate(source: &str) -> Result<ProgramDefinition, ProgramError> {
        if source.len() > MAX_SOURCE_BYTES {
            return Err(ProgramError::invalid_argument(format!(
                "program source exceeds {MAX_SOURCE_BYTES} bytes"
            )));
        }
        let forms = parse(source)?;
        let sandbox = Sandbox::new(Some(VALIDATE_TIMEOUT_MS), CancellationToken::new());
        let interp = sandbox.interp();
        let env = sandbox.globals.child();
        let evaluated = tokio::time::timeout(sandbox.timeout, interp.eval_forms(&forms, &env))
            .await
            .map_err(|_| ProgramError::timeout("program validation timed out"))?
            .map_err(|interrupt| match interrupt {
                Interrupt::Error(err) => err,
                Interrupt::Success(_) | Interrupt::Fail { .. } => ProgramError::invalid_argument(
                    "program signalled a terminal outcome while evaluating its definition",
                ),
                Interrupt::Cancelled => ProgramError::operation_failed("validation cancelled"),
            })?;
        extract_definition(&evaluated)
    }

    /// Waits for due timers and runs their callbacks inside the sandbox.
    /// Only resolves when a callback interrupts (error or sentinel).
    async fn timer_pump(&self, interp: Interp) -> Interrupt {
        loop {
            let next_due = {
                let timers = self.timers.lock();
                timers.entries.iter().map(|e| e.due).min()
            };
            match next_due {
                None => self.timer_signal.notified().await,
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {
                            let ready = self.take_due_timers();
                            for callback in ready {
                                if let Err(interrupt) = interp.apply(callback, Vec::new()).await {
                                    return interrupt;
                                }
                            }
                        }
                        // A timer was added or cleared; re-evaluate the queue.
                        _ = self.timer_signal.notified() => {}
                    }
                }
            }
        }
    }

    fn take_due_timers(&self) -> Vec<Value> {
        let now = tokio::time::Instant::now();
        let mut timers = self.timers.lock();
        let mut due: Vec<TimerEntry> = Vec::new();
        let mut keep: Vec<TimerEntry> = Vec::new();
        for entry in timers.entries.drain(..) {
            if entry.due <= now {
                due.push(entry);
            } else {
                keep.push(entry);
            }
        }
        timers.entries = keep;
        due.sort_by_key(|e| (e.due, e.id));
        due.into_iter().map(|e| e.callback).collect()
    }
}

fn install_base_globals(globals: &Env, timers: &Arc<Mutex<TimerQueue>>, signal: &Arc<Notify>) {
    globals.define(
        "pos",
        Value::native_pure("pos", |args| {
            let x = value::num_arg(&args, 0, "x")?;
            let y = value::num_arg(&args, 1, "y")?;
            let z = value::num_arg(&args, 2, "z")?;
            Ok(value::position_value(&mineflare_core::value::Position::new(
                x, y, z,
            )))
        }),
    );

    globals.define(
        "defineProgram",
        Value::native_pure("defineProgram", |args| {
            let spec = value::map_arg(&args, 0, "spec")?;
            normalize_definition(spec.as_ref())
        }),
    );

    globals.define(
        "sleep",
        Value::native("sleep", |interp, args| {
            Box::pin(async move {
                let ms = value::num_arg(&args, 0, "ms")?;
                flow::sleep_for(ms, interp.cancellation()).await
            })
        }),
    );

    let q = timers.clone();
    let s = signal.clone();
    globals.define(
        "setTimeout",
        Value::native("setTimeout", move |_interp, args| {
            let q = q.clone();
            let s = s.clone();
            Box::pin(async move {
                let callback = value::callable_arg(&args, 0, "callback")?;
                let ms = value::num_arg(&args, 1, "ms")?.max(0.0);
                let id = {
                    let mut timers = q.lock();
                    timers.next_id += 1;
                    let id = timers.next_id;
                    timers.entries.push(TimerEntry {
                        id,
                        due: tokio::time::Instant::now() + Duration::from_millis(ms as u64),
                        callback,
                    });
                    id
                };
                s.notify_one();
                Ok(Value::Num(id as f64))
            })
        }),
    );

    let q = timers.clone();
    let s = signal.clone();
    globals.define(
        "clearTimeout",
        Value::native("clearTimeout", move |_interp, args| {
            let q = q.clone();
            let s = s.clone();
            Box::pin(async move {
                let id = value::num_arg(&args, 0, "id")? as u64;
                let removed = {
                    let mut timers = q.lock();
                    let before = timers.entries.len();
                    timers.entries.retain(|e| e.id != id);
                    timers.entries.len() != before
                };
                s.notify_one();
                Ok(Value::Bool(removed))
            })
        }),
    );
}

/// Normalizes a `defineProgram` spec map: name and run are mandatory,
/// version / capabilities / defaults are filled with their defaults. The
/// capability list is validated against the closed set.
fn normalize_definition(
    spec: &std::collections::BTreeMap<String, Value>,
) -> Result<Value, Interrupt> {
    match spec.get("name") {
        Some(Value::Str(s)) if !s.is_empty() => {}
        _ => {
            return Err(Interrupt::invalid_argument(
                "program definition requires a non-empty :name",
            ));
        }
    }
    match spec.get("run") {
        Some(run) if run.is_callable() => {}
        _ => {
            return Err(Interrupt::invalid_argument(
                "program definition requires a callable :run handler",
            ));
        }
    }
    if let Some(caps) = spec.get("capabilities") {
        parse_capabilities(caps)?;
    }
    if let Some(defaults) = spec.get("defaults")
        && !matches!(defaults, Value::Map(_))
    {
        return Err(Interrupt::invalid_argument(":defaults must be a map"));
    }

    let mut out = spec.clone();
    out.entry("version".to_string())
        .or_insert_with(|| Value::string("1.0.0"));
    out.entry("capabilities".to_string())
        .or_insert_with(|| Value::vector(Vec::new()));
    out.entry("defaults".to_string())
        .or_insert_with(|| Value::map(Default::default()));
    Ok(Value::map(out))
}

fn parse_capabilities(value: &Value) -> Result<CapabilitySet, Interrupt> {
    let Value::Vector(items) = value else {
        return Err(Interrupt::invalid_argument(
            ":capabilities must be a vector of capability names",
        ));
    };
    let mut names = Vec::with_capacity(items.len());
    for item in items.iter() {
        match item.as_key() {
            Some(name) => names.push(name.to_string()),
            None => {
                return Err(Interrupt::invalid_argument(
                    "capability names must be strings or keywords",
                ));
            }
        }
    }
    CapabilitySet::parse(&names).map_err(Interrupt::from)
}

/// The callable to invoke with the context: a definition map's `:run`
/// entry, or the evaluated value itself in the legacy bare-handler form.
fn run_handler(evaluated: &Value) -> Result<Value, Interrupt> {
    if evaluated.is_callable() {
        return Ok(evaluated.clone());
    }
    if let Value::Map(map) = evaluated
        && let Some(run) = map.get("run")
        && run.is_callable()
    {
        return Ok(run.clone());
    }
    Err(Interrupt::invalid_argument(
        "program source must evaluate to a program definition or a run handler",
    ))
}

/// Extracts the metadata half of an evaluated definition value.
pub fn extract_definition(evaluated: &Value) -> Result<ProgramDefinition, ProgramError> {
    let invalid = |msg: &str| ProgramError::invalid_argument(msg.to_string());
    if evaluated.is_callable() {
        // Legacy form: a bare run handler with empty metadata.
        return Ok(ProgramDefinition {
            name: None,
            version: "1.0.0".to_string(),
            capabilities: CapabilitySet::new(),
            defaults: Json::Object(Default::default()),
        });
    }
    let Value::Map(map) = evaluated else {
        return Err(invalid(
            "program source must evaluate to a program definition or a run handler",
        ));
    };
    let name = match map.get("name") {
        Some(Value::Str(s)) if !s.is_empty() => s.to_string(),
        _ => return Err(invalid("program definition requires a non-empty :name")),
    };
    match map.get("run") {
        Some(run) if run.is_callable() => {}
        _ => return Err(invalid("program definition requires a callable :run handler")),
    }
    let version = match map.get("version") {
        Some(Value::Str(s)) => s.to_string(),
        _ => "1.0.0".to_string(),
    };
    let capabilities = match map.get("capabilities") {
        Some(caps) => parse_capabilities(caps).map_err(|interrupt| match interrupt {
            Interrupt::Error(err) => err,
            _ => ProgramError::invalid_argument("invalid capability list"),
        })?,
        None => CapabilitySet::new(),
    };
    let defaults = match map.get("defaults") {
        Some(defaults @ Value::Map(_)) => defaults.to_json(),
        None => Json::Object(Default::default()),
        Some(_) => return Err(invalid(":defaults must be a map")),
    };
    Ok(ProgramDefinition {
        name: Some(name),
        version,
        capabilities,
        defaults,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mineflare_core::capability::Capability;
    use mineflare_core::error::ErrorKind;

    const MODERN: &str = r#"
        (defineProgram {:name "probe"
                        :version "2.1.0"
                        :capabilities ["move" "dig"]
                        :defaults {:radius 8}
                        :run (fn [ctx] (ok 1))})
    "#;

    #[tokio::test]
    async fn validate_extracts_modern_metadata() {
        let def = Sandbox::validate(MODERN).await.unwrap();
        assert_eq!(def.name.as_deref(), Some("probe"));
        assert_eq!(def.version, "2.1.0");
        assert!(def.capabilities.contains(Capability::Move));
        assert!(def.capabilities.contains(Capability::Dig));
        assert_eq!(def.defaults["radius"], 8.0);
    }

    #[tokio::test]
    async fn validate_accepts_legacy_bare_handlers() {
        let def = Sandbox::validate("(fn [ctx] 42)").await.unwrap();
        assert_eq!(def.name, None);
        assert_eq!(def.version, "1.0.0");
        assert!(def.capabilities.is_empty());
    }

    #[tokio::test]
    async fn validate_rejects_bad_definitions() {
        // Missing name.
        let err = Sandbox::validate(r#"(defineProgram {:run (fn [ctx] 1)})"#)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        // Missing run handler.
        assert!(Sandbox::validate(r#"(defineProgram {:name "x"})"#).await.is_err());
        // Non-callable run built without defineProgram.
        assert!(Sandbox::validate(r#"{:name "x" :run 5}"#).await.is_err());
        // Unknown capability.
        assert!(
            Sandbox::validate(r#"(defineProgram {:name "x" :capabilities ["fly"] :run (fn [c] 1)})"#)
                .await
                .is_err()
        );
        // Not a definition at all.
        assert!(Sandbox::validate("(+ 1 2)").await.is_err());
    }

    #[tokio::test]
    async fn execute_runs_the_handler_with_the_context_value() {
        let sandbox = Sandbox::new(None, CancellationToken::new());
        let out = sandbox
            .execute("(fn [ctx] (get ctx :answer))", {
                let mut map = std::collections::BTreeMap::new();
                map.insert("answer".to_string(), Value::Num(42.0));
                Value::map(map)
            })
            .await
            .unwrap();
        assert_eq!(out, Value::Num(42.0));
    }

    #[tokio::test]
    async fn sandbox_is_single_use() {
        let sandbox = Sandbox::new(None, CancellationToken::new());
        sandbox.execute("(fn [ctx] 1)", Value::Nil).await.unwrap();
        let err = sandbox
            .execute("(fn [ctx] 2)", Value::Nil)
            .await
            .unwrap_err();
        let Interrupt::Error(err) = err else {
            panic!("expected typed error");
        };
        assert_eq!(err.kind, ErrorKind::OperationFailed);
    }

    #[tokio::test]
    async fn whole_invocation_timeout_fires() {
        let sandbox = Sandbox::new(Some(50), CancellationToken::new());
        let err = sandbox
            .execute("(fn [ctx] (sleep 5000))", Value::Nil)
            .await
            .unwrap_err();
        let Interrupt::Error(err) = err else {
            panic!("expected typed error");
        };
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.message.contains("50ms"));
    }

    #[tokio::test]
    async fn abort_cancels_a_sleeping_program() {
        let token = CancellationToken::new();
        let sandbox = Arc::new(Sandbox::new(None, token.clone()));
        let sb = sandbox.clone();
        let handle = tokio::spawn(async move {
            sb.execute("(fn [ctx] (sleep 60000))", Value::Nil).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sandbox.abort();
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, Err(Interrupt::Cancelled)));
    }

    #[tokio::test]
    async fn timers_fire_while_the_body_is_suspended() {
        let sandbox = Sandbox::new(None, CancellationToken::new());
        let source = r#"
            (fn [ctx]
              (def fired [])
              (setTimeout (fn [] (set! fired (push fired :first))) 10)
              (setTimeout (fn [] (set! fired (push fired :late))) 5000)
              (def cleared (setTimeout (fn [] (set! fired (push fired :cleared))) 20))
              (clearTimeout cleared)
              (sleep 120)
              fired)
        "#;
        let out = sandbox.execute(source, Value::Nil).await.unwrap();
        assert_eq!(out, Value::vector(vec![Value::keyword("first")]));
    }

    #[tokio::test]
    async fn timer_callbacks_can_signal_interrupts() {
        let sandbox = Sandbox::new(None, CancellationToken::new());
        let source = r#"
            (fn [ctx]
              (setTimeout (fn [] (undefined-symbol)) 10)
              (sleep 5000)
              :unreachable)
        "#;
        let err = sandbox.execute(source, Value::Nil).await.unwrap_err();
        let Interrupt::Error(err) = err else {
            panic!("expected typed error");
        };
        assert_eq!(err.kind, ErrorKind::Runtime);
    }
}
