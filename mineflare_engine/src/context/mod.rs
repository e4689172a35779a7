//! The context: the API surface a program sees
//!
//! A fresh [`Ctx`] is built per invocation and never shared between
//! invocations. It binds the external agent handle, the effective
//! capability set, the operation budget, the merged arguments, the seeded
//! RNG, the bounded log buffer and the cancellation token, then installs
//! the whole dotted API surface (`bot.*`, `world.*`, `actions.*`,
//! `events.*`, `control.*`, `log.*`, `clock.*`, `flow.*`, `rng.*`,
//! `geo.*`) into a sandbox's global environment.
//!
//! Capability gating happens at admission time: every action passes the
//! budget's capability check before any quota is consumed or any
//! instruction reaches the agent.

mod actions;
mod events;
mod flow_api;
mod prim;
mod world;

use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use mineflare_core::{
    Json,
    agent::AgentHandle,
    capability::{Capability, CapabilitySet},
    error::ProgramError,
    rng::SeededRng,
};

use crate::{
    budget::{BudgetUsage, OperationBudget, QuotaTable},
    script::{
        Env, Interp, Value,
        value::{Interrupt, error_value, ok_value},
    },
};

/// Log entries kept per invocation; older entries drop oldest-first.
pub const LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One buffered program log line. `at_ms` is invocation-relative.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Json>,
    pub at_ms: u64,
}

#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) next_id: u64,
    pub(crate) by_name: HashMap<String, Vec<(u64, Value)>>,
}

struct CtxInner {
    agent: Arc<dyn AgentHandle>,
    capabilities: CapabilitySet,
    budget: OperationBudget,
    args: Json,
    rng: Mutex<SeededRng>,
    logs: Mutex<VecDeque<LogEntry>>,
    handlers: Mutex<EventHandlers>,
    started: Instant,
    cancellation: CancellationToken,
}

/// Per-invocation context. Cloning shares the same invocation state.
#[derive(Clone)]
pub struct Ctx {
    inner: Arc<CtxInner>,
}

/// Builder for a per-invocation context, mirroring the engine's other
/// builder surfaces.
pub struct ContextBuilder {
    agent: Arc<dyn AgentHandle>,
    capabilities: CapabilitySet,
    args: Json,
    seed: u64,
    quotas: QuotaTable,
    cancellation: CancellationToken,
}

impl ContextBuilder {
    pub fn new(agent: Arc<dyn AgentHandle>) -> Self {
        Self {
            agent,
            capabilities: CapabilitySet::new(),
            args: Json::Object(Default::default()),
            seed: 1,
            quotas: QuotaTable::default(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_args(mut self, args: Json) -> Self {
        self.args = args;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_quotas(mut self, quotas: QuotaTable) -> Self {
        self.quotas = quotas;
        self
    }

    pub fn with_cancellation_token(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn build(self) -> Ctx {
        Ctx {
            inner: Arc::new(CtxInner {
                agent: self.agent,
                budget: OperationBudget::new(self.capabilities.clone(), self.quotas),
                capabilities: self.capabilities,
                args: self.args,
                rng: Mutex::new(SeededRng::new(self.seed)),
                logs: Mutex::new(VecDeque::new()),
                handlers: Mutex::new(EventHandlers::default()),
                started: Instant::now(),
                cancellation: self.cancellation,
            }),
        }
    }
}

impl Ctx {
    /// Installs the full context surface into a sandbox environment and
    /// returns the context map handed to the run handler.
    pub fn install(&self, env: &Env) -> Value {
        env.define("args", Value::from_json(&self.inner.args));
        env.define(
            "capabilities",
            Value::vector(
                self.inner
                    .capabilities
                    .iter()
                    .map(|c| Value::string(c.as_str()))
                    .collect(),
            ),
        );
        self.install_control(env);
        self.install_log(env);
        self.install_clock(env);
        world::install(self, env);
        actions::install(self, env);
        events::install(self, env);
        flow_api::install(self, env);
        prim::install(self, env);
        self.ctx_value()
    }

    /// The context map passed as the run handler's argument.
    pub fn ctx_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("args".to_string(), Value::from_json(&self.inner.args));
        map.insert(
            "capabilities".to_string(),
            Value::vector(
                self.inner
                    .capabilities
                    .iter()
                    .map(|c| Value::string(c.as_str()))
                    .collect(),
            ),
        );
        Value::map(map)
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.inner.capabilities
    }

    pub fn usage(&self) -> BudgetUsage {
        self.inner.budget.usage()
    }

    pub fn take_logs(&self) -> Vec<LogEntry> {
        self.inner.logs.lock().drain(..).collect()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.inner.started.elapsed().as_millis() as u64
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// The agent handle, provided it is currently connected.
    pub(crate) fn agent(&self) -> Result<Arc<dyn AgentHandle>, ProgramError> {
        if !self.inner.agent.is_connected() {
            return Err(ProgramError::disconnected("agent is not connected"));
        }
        Ok(self.inner.agent.clone())
    }

    /// Rejects unless at least one of `caps` is in the effective set. The
    /// error names the first capability, which is the one the operation is
    /// accounted against.
    pub(crate) fn require_any(&self, caps: &[Capability]) -> Result<(), ProgramError> {
        if self.inner.capabilities.contains_any(caps) {
            Ok(())
        } else {
            Err(ProgramError::capability(format!(
                "operation requires capability {}",
                caps[0]
            ))
            .with_detail(serde_json::json!({"capability": caps[0].as_str()})))
        }
    }

    /// Budget admission for one operation.
    pub(crate) fn admit(&self, cap: Capability, count: u64) -> Result<(), ProgramError> {
        self.inner.budget.check(cap, count)
    }

    pub(crate) fn budget(&self) -> &OperationBudget {
        &self.inner.budget
    }

    pub(crate) fn rng(&self) -> &Mutex<SeededRng> {
        &self.inner.rng
    }

    pub(crate) fn handlers(&self) -> &Mutex<EventHandlers> {
        &self.inner.handlers
    }

    pub(crate) fn push_log(&self, level: LogLevel, message: String, meta: Option<Json>) {
        let entry = LogEntry {
            level,
            message,
            meta,
            at_ms: self.elapsed_ms(),
        };
        let mut logs = self.inner.logs.lock();
        if logs.len() == LOG_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(entry);
    }

    fn install_control(&self, env: &Env) {
        env.define(
            "control.success",
            Value::native_pure("control.success", |args| {
                let data = args.first().map(Value::to_json).unwrap_or(Json::Null);
                Err(Interrupt::Success(data))
            }),
        );
        env.define(
            "control.fail",
            Value::native_pure("control.fail", |args| {
                let message = match args.first() {
                    Some(Value::Str(s)) => s.to_string(),
                    Some(other) => other.to_string(),
                    None => "program failed".to_string(),
                };
                Err(Interrupt::Fail {
                    message,
                    detail: args.get(1).map(Value::to_json),
                })
            }),
        );
    }

    fn install_log(&self, env: &Env) {
        for (name, level) in [
            ("log.info", LogLevel::Info),
            ("log.warn", LogLevel::Warn),
            ("log.error", LogLevel::Error),
        ] {
            let ctx = self.clone();
            env.define(
                name,
                Value::native_pure(name, move |args| {
                    let message = match args.first() {
                        Some(Value::Str(s)) => s.to_string(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    let meta = args.get(1).map(Value::to_json).filter(|m| !m.is_null());
                    log::debug!(target: "program", "{message}");
                    ctx.push_log(level, message, meta);
                    Ok(Value::Nil)
                }),
            );
        }
    }

    fn install_clock(&self, env: &Env) {
        let ctx = self.clone();
        env.define(
            "clock.now",
            Value::native_pure("clock.now", move |_args| {
                Ok(Value::Num(ctx.elapsed_ms() as f64))
            }),
        );
        let ctx = self.clone();
        env.define(
            "clock.sleep",
            Value::native("clock.sleep", move |_interp, args| {
                let ctx = ctx.clone();
                Box::pin(async move {
                    let ms = crate::script::value::num_arg(&args, 0, "ms")?;
                    crate::flow::sleep_for(ms, ctx.cancellation()).await
                })
            }),
        );
    }

    /// Dispatches an event to the handlers registered under its name.
    /// Emission is scoped to this invocation.
    pub(crate) async fn dispatch_event(
        &self,
        interp: &Interp,
        name: &str,
        payload: Value,
    ) -> Result<u64, Interrupt> {
        let handlers: Vec<Value> = {
            let registry = self.inner.handlers.lock();
            registry
                .by_name
                .get(name)
                .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        let delivered = handlers.len() as u64;
        for handler in handlers {
            interp.apply(handler, vec![payload.clone()]).await?;
        }
        Ok(delivered)
    }

    /// Bridges the agent's asynchronous event stream into registered
    /// handlers, cooperatively on the sandbox's logical thread. Only
    /// resolves when a handler interrupts.
    pub(crate) fn event_pump(&self, interp: Interp) -> futures::future::BoxFuture<'static, Interrupt> {
        let ctx = self.clone();
        let mut rx = self.inner.agent.events();
        Box::pin(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let payload = Value::from_json(&event.payload);
                        if let Err(interrupt) =
                            ctx.dispatch_event(&interp, &event.name, payload).await
                        {
                            return interrupt;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("agent event stream lagged, skipped {skipped} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        // No more agent events; stay pending so the body
                        // keeps running.
                        futures::future::pending::<()>().await;
                    }
                }
            }
        })
    }
}

// ---- shared helpers for the surface submodules -----------------------------

/// Wraps an async context operation as a script-callable native.
pub(crate) fn ctx_native<F, Fut>(name: &'static str, ctx: &Ctx, f: F) -> Value
where
    F: Fn(Ctx, Interp, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, Interrupt>> + Send + 'static,
{
    let ctx = ctx.clone();
    Value::native(name, move |interp, args| Box::pin(f(ctx.clone(), interp, args)))
}

/// Converts an agent-side failure into a fail-map, remapping generic
/// operation failures to `kind` while preserving more specific kinds.
pub(crate) fn agent_failure(kind: mineflare_core::error::ErrorKind, err: ProgramError) -> Value {
    use mineflare_core::error::ErrorKind;
    let mapped = match err.kind {
        ErrorKind::OperationFailed => kind,
        other => other,
    };
    let remapped = ProgramError {
        kind: mapped,
        message: err.message,
        detail: err.detail,
    };
    error_value(&remapped)
}

pub(crate) use crate::script::value::{
    fail_value as fail_map, map_arg, num_arg, ok_value as ok_map, opt_arg, position_from,
    position_value, str_arg, vector_arg,
};

/// Shorthand for `ok_value` over a JSON payload.
pub(crate) fn ok_json(json: &Json) -> Value {
    ok_value(Value::from_json(json))
}

/// Evaluates a source snippet against a fresh context bound to a mock
/// agent, with the given effective capabilities. Shared by the surface
/// submodules' tests.
#[cfg(test)]
pub(crate) async fn eval_in_context(
    agent: Arc<crate::testing::MockAgent>,
    caps: &[&str],
    source: &str,
) -> Result<Value, Interrupt> {
    let env = Env::root();
    crate::script::builtins::install(&env);
    let ctx = ContextBuilder::new(agent)
        .with_capabilities(CapabilitySet::parse(caps).expect("valid capabilities"))
        .build();
    ctx.install(&env);
    let interp = Interp::new(env.clone(), ctx.cancellation().clone());
    let forms = crate::script::parse(source).expect("valid source");
    interp.eval_forms(&forms, &env.child()).await
}
