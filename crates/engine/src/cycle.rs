use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::{ProcessId, TenantId, WorkerId};

use crate::process::ActiveProcessCounts;

/// Why a cycle started no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    NoDeficit,
    ConfigUnavailable,
    RegistryUnavailable,
    BudgetExhausted,
    NoEligibleWork,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::NoDeficit => "no_deficit",
            SkipReason::ConfigUnavailable => "config_unavailable",
            SkipReason::RegistryUnavailable => "registry_unavailable",
            SkipReason::BudgetExhausted => "budget_exhausted",
            SkipReason::NoEligibleWork => "no_eligible_work",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt started by a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnedWork {
    pub work_catalog_id: String,
    pub process_id: ProcessId,
    pub tenant_id: Option<TenantId>,
    pub duration_ms: u64,
    pub cost_cents: u32,
    pub success: bool,
    pub error: Option<String>,
}

/// Report of one `run_cycle` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductorCycleResult {
    pub worker_id: WorkerId,
    pub started_at: DateTime<Utc>,
    pub expired: u64,
    pub active_processes: ActiveProcessCounts,
    pub deficit: u32,
    /// Slots of the deficit this cycle did not fill.
    pub remaining_deficit: u32,
    pub work_spawned: Vec<SpawnedWork>,
    /// Claims lost to a concurrent holder of the same slot.
    pub claim_conflicts: u32,
    pub budget_spent_cents: u64,
    pub budget_remaining_cents: i64,
    pub duration_ms: u64,
    pub skipped_reason: Option<SkipReason>,
}

impl ConductorCycleResult {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            started_at: Utc::now(),
            expired: 0,
            active_processes: ActiveProcessCounts::default(),
            deficit: 0,
            remaining_deficit: 0,
            work_spawned: Vec::new(),
            claim_conflicts: 0,
            budget_spent_cents: 0,
            budget_remaining_cents: 0,
            duration_ms: 0,
            skipped_reason: None,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.work_spawned.iter().filter(|w| w.success).count()
    }

    pub fn failed(&self) -> usize {
        self.work_spawned.len() - self.succeeded()
    }
}
