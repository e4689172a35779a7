//! Operation budget: capability admission and quota accounting
//!
//! Every side-effecting context call admits through a per-invocation
//! [`OperationBudget`] before it reaches the external agent. Admission
//! checks, in order: capability membership, the 60-second sliding window
//! quota, then the whole-invocation total quota. Violations are typed:
//! `CAPABILITY` for membership, `RESOURCE_LIMIT` for quota exhaustion (with
//! the scope in the detail payload so retry policies can distinguish a
//! window that will advance from a total that will not).

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use structured_logger::unix_ms;

use mineflare_core::{
    capability::{Capability, CapabilitySet},
    error::ProgramError,
};

/// Length of the sliding window in milliseconds.
const WINDOW_MS: u64 = 60_000;

/// Per-capability quota tables. A capability missing from a table has no
/// quota of that kind.
#[derive(Debug, Clone)]
pub struct QuotaTable {
    per_minute: BTreeMap<Capability, u64>,
    per_invocation: BTreeMap<Capability, u64>,
}

impl Default for QuotaTable {
    fn default() -> Self {
        let per_minute = BTreeMap::from([
            (Capability::Move, 60),
            (Capability::Dig, 20),
            (Capability::Place, 20),
            (Capability::Craft, 10),
            (Capability::Attack, 30),
            (Capability::Screenshot, 5),
            (Capability::Inventory, 30),
        ]);
        let per_invocation = BTreeMap::from([
            (Capability::Move, 1000),
            (Capability::Dig, 500),
            (Capability::Place, 500),
            (Capability::Craft, 100),
            (Capability::Attack, 300),
            (Capability::Screenshot, 50),
            (Capability::Inventory, 500),
        ]);
        Self {
            per_minute,
            per_invocation,
        }
    }
}

impl QuotaTable {
    pub fn with_per_minute(mut self, cap: Capability, limit: u64) -> Self {
        self.per_minute.insert(cap, limit);
        self
    }

    pub fn with_per_invocation(mut self, cap: Capability, limit: u64) -> Self {
        self.per_invocation.insert(cap, limit);
        self
    }
}

#[derive(Debug)]
struct WindowEntry {
    at_ms: u64,
    op: Capability,
    count: u64,
}

#[derive(Debug, Default)]
struct BudgetState {
    totals: BTreeMap<Capability, u64>,
    window: VecDeque<WindowEntry>,
}

/// Usage snapshot returned to the runner and to programs via `getUsage`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetUsage {
    pub total: BTreeMap<String, u64>,
    pub per_minute: BTreeMap<String, u64>,
    pub limits: BudgetLimits,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLimits {
    pub per_minute: BTreeMap<String, u64>,
    pub per_invocation: BTreeMap<String, u64>,
}

/// Remaining headroom for one capability. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remaining {
    pub per_minute: Option<u64>,
    pub per_invocation: Option<u64>,
}

pub struct OperationBudget {
    capabilities: CapabilitySet,
    quotas: QuotaTable,
    state: Mutex<BudgetState>,
}

impl OperationBudget {
    pub fn new(capabilities: CapabilitySet, quotas: QuotaTable) -> Self {
        Self {
            capabilities,
            quotas,
            state: Mutex::new(BudgetState::default()),
        }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Admits `count` operations of kind `op`, recording them on success.
    pub fn check(&self, op: Capability, count: u64) -> Result<(), ProgramError> {
        self.check_at(op, count, unix_ms())
    }

    /// Membership is checked before any quota so capability violations never
    /// consume budget.
    pub fn check_at(&self, op: Capability, count: u64, now_ms: u64) -> Result<(), ProgramError> {
        if !self.capabilities.contains(op) {
            return Err(ProgramError::capability(format!(
                "operation requires capability {op}"
            ))
            .with_detail(serde_json::json!({"capability": op.as_str()})));
        }

        let mut state = self.state.lock();
        sweep(&mut state.window, now_ms);

        if let Some(&limit) = self.quotas.per_minute.get(&op) {
            let recent: u64 = state
                .window
                .iter()
                .filter(|e| e.op == op)
                .map(|e| e.count)
                .sum();
            if recent + count > limit {
                return Err(ProgramError::resource_limit(format!(
                    "per-minute limit of {limit} reached for {op}"
                ))
                .with_detail(serde_json::json!({
                    "capability": op.as_str(),
                    "scope": "perMinute",
                    "limit": limit,
                    "used": recent,
                })));
            }
        }

        if let Some(&limit) = self.quotas.per_invocation.get(&op) {
            let total = state.totals.get(&op).copied().unwrap_or(0);
            if total + count > limit {
                return Err(ProgramError::resource_limit(format!(
                    "per-invocation limit of {limit} reached for {op}"
                ))
                .with_detail(serde_json::json!({
                    "capability": op.as_str(),
                    "scope": "perInvocation",
                    "limit": limit,
                    "used": total,
                })));
            }
        }

        state.window.push_back(WindowEntry {
            at_ms: now_ms,
            op,
            count,
        });
        *state.totals.entry(op).or_insert(0) += count;
        Ok(())
    }

    pub fn usage(&self) -> BudgetUsage {
        self.usage_at(unix_ms())
    }

    pub fn usage_at(&self, now_ms: u64) -> BudgetUsage {
        let mut state = self.state.lock();
        sweep(&mut state.window, now_ms);

        let mut per_minute: BTreeMap<String, u64> = BTreeMap::new();
        for entry in &state.window {
            *per_minute.entry(entry.op.as_str().to_string()).or_insert(0) += entry.count;
        }
        BudgetUsage {
            total: state
                .totals
                .iter()
                .map(|(cap, n)| (cap.as_str().to_string(), *n))
                .collect(),
            per_minute,
            limits: BudgetLimits {
                per_minute: self
                    .quotas
                    .per_minute
                    .iter()
                    .map(|(cap, n)| (cap.as_str().to_string(), *n))
                    .collect(),
                per_invocation: self
                    .quotas
                    .per_invocation
                    .iter()
                    .map(|(cap, n)| (cap.as_str().to_string(), *n))
                    .collect(),
            },
        }
    }

    /// Residual headroom. A capability outside the effective set has zero
    /// headroom; an unset quota is unlimited.
    pub fn remaining(&self, op: Capability) -> Remaining {
        self.remaining_at(op, unix_ms())
    }

    pub fn remaining_at(&self, op: Capability, now_ms: u64) -> Remaining {
        if !self.capabilities.contains(op) {
            return Remaining {
                per_minute: Some(0),
                per_invocation: Some(0),
            };
        }
        let mut state = self.state.lock();
        sweep(&mut state.window, now_ms);
        let recent: u64 = state
            .window
            .iter()
            .filter(|e| e.op == op)
            .map(|e| e.count)
            .sum();
        let total = state.totals.get(&op).copied().unwrap_or(0);
        Remaining {
            per_minute: self
                .quotas
                .per_minute
                .get(&op)
                .map(|limit| limit.saturating_sub(recent)),
            per_invocation: self
                .quotas
                .per_invocation
                .get(&op)
                .map(|limit| limit.saturating_sub(total)),
        }
    }
}

fn sweep(window: &mut VecDeque<WindowEntry>, now_ms: u64) {
    let cutoff = now_ms.saturating_sub(WINDOW_MS);
    while window.front().is_some_and(|e| e.at_ms < cutoff) {
        window.pop_front();
    }
}
