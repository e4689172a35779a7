//! Per-invocation orchestration
//!
//! A [`Runner`] owns exactly one invocation: it merges arguments, computes
//! the effective capability set, builds the sandbox and the context, drives
//! execution, and maps the outcome onto the invocation record. The record
//! moves through `PENDING → RUNNING → terminal` and never changes after a
//! terminal transition.

use parking_lot::RwLock;
use std::sync::Arc;
use structured_logger::unix_ms;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mineflare_core::{
    Json,
    agent::AgentHandle,
    capability::{Capability, CapabilitySet},
    error::ErrorKind,
    program::{InvocationRecord, InvocationStatus, ProgramMetadata, RunOptions, merge_args},
};

use crate::{
    budget::BudgetUsage,
    context::{ContextBuilder, LogEntry},
    sandbox::Sandbox,
    script::value::Interrupt,
};

/// Everything a finished invocation leaves behind: the terminal record, the
/// program's buffered logs, and the final budget snapshot.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub record: InvocationRecord,
    pub logs: Vec<LogEntry>,
    pub usage: BudgetUsage,
}

pub struct Runner {
    record: RwLock<InvocationRecord>,
    cancellation: CancellationToken,
}

impl Runner {
    pub fn new(program_name: &str, args: Json) -> Self {
        Self {
            record: RwLock::new(InvocationRecord {
                invocation_id: Uuid::new_v4().to_string(),
                program_name: program_name.to_string(),
                args,
                status: InvocationStatus::Pending,
                start_time: 0,
                end_time: None,
                result: None,
                error_kind: None,
                error_message: None,
            }),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn invocation_id(&self) -> String {
        self.record.read().invocation_id.clone()
    }

    /// Snapshot of the invocation record.
    pub fn record(&self) -> InvocationRecord {
        self.record.read().clone()
    }

    /// Sets the cancellation token; the sandbox aborts at its next
    /// suspension point and no further action call will resolve.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Runs the program to a terminal outcome. Consumes this runner's one
    /// invocation; the returned report's record is terminal.
    pub async fn run(
        &self,
        agent: Arc<dyn AgentHandle>,
        source: &str,
        metadata: &ProgramMetadata,
        options: RunOptions,
    ) -> RunReport {
        let merged = {
            let mut record = self.record.write();
            record.args = merge_args(&metadata.defaults, &record.args);
            record.args.clone()
        };

        if !agent.is_connected() {
            self.finish(
                InvocationStatus::Failed,
                None,
                Some(ErrorKind::ExternalDisconnected),
                Some("agent is not connected".to_string()),
            );
            return RunReport {
                record: self.record(),
                logs: Vec::new(),
                usage: BudgetUsage::default(),
            };
        }

        let effective =
            effective_capabilities(&metadata.capabilities, options.capabilities.as_ref());

        let sandbox = Sandbox::new(options.timeout_ms, self.cancellation.clone());
        let ctx = ContextBuilder::new(agent)
            .with_capabilities(effective.clone())
            .with_args(merged)
            .with_seed(options.seed.unwrap_or(1))
            .with_cancellation_token(self.cancellation.clone())
            .build();
        let ctx_value = ctx.install(sandbox.globals());

        {
            let mut record = self.record.write();
            record.status = InvocationStatus::Running;
            record.start_time = unix_ms();
        }

        let event_pump = effective
            .contains(Capability::Events)
            .then(|| ctx.event_pump(sandbox.interp()));
        let outcome = sandbox.execute_with(source, ctx_value, event_pump).await;

        match outcome {
            Ok(value) => self.finish(
                InvocationStatus::Succeeded,
                Some(value.to_json()),
                None,
                None,
            ),
            Err(Interrupt::Success(data)) => {
                self.finish(InvocationStatus::Succeeded, Some(data), None, None)
            }
            Err(Interrupt::Fail { message, detail }) => {
                let mut record = self.record.write();
                if !record.status.is_terminal() {
                    record.status = InvocationStatus::Failed;
                    record.end_time = Some(unix_ms());
                    record.error_kind = Some(ErrorKind::OperationFailed);
                    record.error_message = Some(message);
                    record.result = detail;
                }
            }
            Err(Interrupt::Error(err)) => self.finish(
                InvocationStatus::Failed,
                err.detail.clone(),
                Some(err.kind),
                Some(err.message),
            ),
            Err(Interrupt::Cancelled) => self.finish(
                InvocationStatus::Cancelled,
                None,
                None,
                Some("invocation cancelled".to_string()),
            ),
        }

        let report = RunReport {
            record: self.record(),
            logs: ctx.take_logs(),
            usage: ctx.usage(),
        };
        log::info!(
            invocation_id = report.record.invocation_id.as_str(),
            program = report.record.program_name.as_str(),
            status = format!("{:?}", report.record.status).as_str();
            "invocation finished"
        );
        report
    }

    fn finish(
        &self,
        status: InvocationStatus,
        result: Option<Json>,
        error_kind: Option<ErrorKind>,
        error_message: Option<String>,
    ) {
        let mut record = self.record.write();
        if record.status.is_terminal() {
            return;
        }
        record.status = status;
        record.end_time = Some(unix_ms());
        record.result = result;
        record.error_kind = error_kind;
        record.error_message = error_message;
    }
}

/// The effective capability set of an invocation: declared ∩ requested.
pub fn effective_capabilities(
    declared: &CapabilitySet,
    requested: Option<&CapabilitySet>,
) -> CapabilitySet {
    match requested {
        Some(requested) => declared.intersect(requested),
        None => declared.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAgent;
    use mineflare_core::program::RunOptions;
    use serde_json::json;

    fn metadata(caps: &[&str], defaults: Json) -> ProgramMetadata {
        ProgramMetadata {
            name: "under-test".to_string(),
            version: "1.0.0".to_string(),
            capabilities: CapabilitySet::parse(caps).unwrap(),
            defaults,
            created: 0,
            updated: 0,
        }
    }

    async fn run_program(
        agent: Arc<MockAgent>,
        source: &str,
        caps: &[&str],
        args: Json,
        options: RunOptions,
    ) -> RunReport {
        let runner = Runner::new("under-test", args);
        runner
            .run(agent, source, &metadata(caps, json!({})), options)
            .await
    }

    #[tokio::test]
    async fn capability_denied_before_any_instruction() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"(fn [ctx] (actions.navigate.goto (pos 0 64 0) nil))"#;
        let report = run_program(
            agent.clone(),
            source,
            &[],
            json!({}),
            RunOptions::default(),
        )
        .await;

        assert_eq!(report.record.status, InvocationStatus::Failed);
        assert_eq!(report.record.error_kind, Some(ErrorKind::Capability));
        assert!(report.record.error_message.as_ref().unwrap().contains("move"));
        assert_eq!(agent.instruction_count(), 0);
    }

    #[tokio::test]
    async fn rate_limit_admits_sixty_then_rejects() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"
            (fn [ctx]
              (def i 0)
              (while (< i 61)
                (actions.navigate.goto (pos i 64 0) nil)
                (set! i (+ i 1)))
              :done)
        "#;
        let report = run_program(
            agent.clone(),
            source,
            &["move"],
            json!({}),
            RunOptions::default(),
        )
        .await;

        assert_eq!(report.record.status, InvocationStatus::Failed);
        assert_eq!(report.record.error_kind, Some(ErrorKind::ResourceLimit));
        assert_eq!(agent.instruction_count(), 60);
        assert_eq!(report.usage.per_minute.get("move"), Some(&60));
    }

    #[tokio::test]
    async fn seeded_rng_is_reproducible_across_invocations() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"
            (fn [ctx]
              [(rng.next) (rng.next) (rng.next) (rng.next) (rng.next)])
        "#;
        let opts = RunOptions {
            seed: Some(42),
            ..RunOptions::default()
        };
        let first = run_program(agent.clone(), source, &[], json!({}), opts.clone()).await;
        let second = run_program(agent.clone(), source, &[], json!({}), opts).await;
        assert_eq!(first.record.status, InvocationStatus::Succeeded);
        assert_eq!(first.record.result, second.record.result);

        let other_seed = run_program(
            agent,
            source,
            &[],
            json!({}),
            RunOptions {
                seed: Some(43),
                ..RunOptions::default()
            },
        )
        .await;
        assert_ne!(first.record.result, other_seed.record.result);
    }

    #[tokio::test]
    async fn per_operation_timeout_leaves_invocation_alive() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"
            (fn [ctx]
              (flow.withTimeout (fn [] (flow.sleep 2000)) 500 "slow op"))
        "#;
        let report =
            run_program(agent, source, &[], json!({}), RunOptions::default()).await;

        // The op timed out but the invocation itself succeeded, returning
        // the fail-map as its value.
        assert_eq!(report.record.status, InvocationStatus::Succeeded);
        let result = report.record.result.unwrap();
        assert_eq!(result["ok"], false);
        assert_eq!(result["error"]["kind"], "TIMEOUT");
        assert!(
            result["error"]["message"]
                .as_str()
                .unwrap()
                .contains("500ms")
        );
    }

    #[tokio::test]
    async fn control_sentinels_map_to_terminal_outcomes() {
        let agent = Arc::new(MockAgent::new());
        let success = r#"(fn [ctx] (control.success {:mined 7}) :unreachable)"#;
        let report = run_program(
            agent.clone(),
            success,
            &[],
            json!({}),
            RunOptions::default(),
        )
        .await;
        assert_eq!(report.record.status, InvocationStatus::Succeeded);
        assert_eq!(report.record.result.unwrap()["mined"], 7.0);

        let failure = r#"(fn [ctx] (control.fail "gave up" {:reason "bedrock"}))"#;
        let report = run_program(agent, failure, &[], json!({}), RunOptions::default()).await;
        assert_eq!(report.record.status, InvocationStatus::Failed);
        assert_eq!(report.record.error_kind, Some(ErrorKind::OperationFailed));
        assert_eq!(report.record.error_message.as_deref(), Some("gave up"));
        assert_eq!(report.record.result.unwrap()["reason"], "bedrock");
    }

    #[tokio::test]
    async fn defaults_merge_under_invocation_args() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"(fn [ctx] (get ctx :args))"#;
        let runner = Runner::new("under-test", json!({"radius": 16}));
        let report = runner
            .run(
                agent,
                source,
                &metadata(&[], json!({"radius": 8, "block": "oak_log"})),
                RunOptions::default(),
            )
            .await;
        let result = report.record.result.unwrap();
        assert_eq!(result["radius"], 16.0);
        assert_eq!(result["block"], "oak_log");
        assert_eq!(report.record.args["radius"], 16);
    }

    #[tokio::test]
    async fn capability_narrowing_intersects_declared() {
        let agent = Arc::new(MockAgent::new());
        agent.set_block(1, 64, 0, "stone");
        let source = r#"
            (fn [ctx]
              (actions.gather.mineBlock {:position (pos 1 64 0)}))
        "#;
        // Declared dig, but the invocation narrows to move only: the
        // intersection is empty, so dig is denied.
        let report = run_program(
            agent.clone(),
            source,
            &["dig"],
            json!({}),
            RunOptions {
                capabilities: Some(CapabilitySet::parse(&["move"]).unwrap()),
                ..RunOptions::default()
            },
        )
        .await;
        assert_eq!(report.record.status, InvocationStatus::Failed);
        assert_eq!(report.record.error_kind, Some(ErrorKind::Capability));
        assert_eq!(agent.instruction_count(), 0);
    }

    #[tokio::test]
    async fn disconnected_agent_fails_fast() {
        let agent = Arc::new(MockAgent::new());
        agent.set_connected(false);
        let report = run_program(
            agent,
            "(fn [ctx] 1)",
            &[],
            json!({}),
            RunOptions::default(),
        )
        .await;
        assert_eq!(report.record.status, InvocationStatus::Failed);
        assert_eq!(
            report.record.error_kind,
            Some(ErrorKind::ExternalDisconnected)
        );
    }

    #[tokio::test]
    async fn cancellation_yields_cancelled_status() {
        let agent = Arc::new(MockAgent::new());
        let runner = Arc::new(Runner::new("under-test", json!({})));
        let meta = metadata(&[], json!({}));
        let r = runner.clone();
        let handle = tokio::spawn(async move {
            r.run(
                agent,
                "(fn [ctx] (clock.sleep 60000))",
                &meta,
                RunOptions::default(),
            )
            .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        runner.cancel();
        let report = handle.await.unwrap();
        assert_eq!(report.record.status, InvocationStatus::Cancelled);
        // Terminal records never change.
        runner.cancel();
        assert_eq!(runner.record().status, InvocationStatus::Cancelled);
    }

    #[tokio::test]
    async fn whole_invocation_timeout_fails_with_timeout_kind() {
        let agent = Arc::new(MockAgent::new());
        let report = run_program(
            agent,
            "(fn [ctx] (clock.sleep 60000))",
            &[],
            json!({}),
            RunOptions {
                timeout_ms: Some(50),
                ..RunOptions::default()
            },
        )
        .await;
        assert_eq!(report.record.status, InvocationStatus::Failed);
        assert_eq!(report.record.error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn agent_events_reach_registered_handlers() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"
            (fn [ctx]
              (def seen [])
              (events.on "chat" (fn [payload] (set! seen (push seen (get payload :text)))))
              (clock.sleep 150)
              seen)
        "#;
        let a = agent.clone();
        let pusher = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(40)).await;
            a.push_event("chat", json!({"text": "hello"}));
            a.push_event("death", json!({}));
        });
        let report = run_program(
            agent,
            source,
            &["events"],
            json!({}),
            RunOptions::default(),
        )
        .await;
        pusher.await.unwrap();
        assert_eq!(report.record.status, InvocationStatus::Succeeded);
        assert_eq!(report.record.result.unwrap(), json!(["hello"]));
    }

    #[tokio::test]
    async fn logs_are_captured_and_bounded() {
        let agent = Arc::new(MockAgent::new());
        let source = r#"
            (fn [ctx]
              (log.info "starting" {:radius 8})
              (log.warn "low on food")
              (log.error "aborting")
              :done)
        "#;
        let report =
            run_program(agent, source, &[], json!({}), RunOptions::default()).await;
        assert_eq!(report.logs.len(), 3);
        assert_eq!(report.logs[0].message, "starting");
        assert_eq!(report.logs[0].meta.as_ref().unwrap()["radius"], 8.0);
        assert_eq!(report.logs[2].level, crate::context::LogLevel::Error);
    }
}
