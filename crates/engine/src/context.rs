use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use conductor_core::{ProcessId, TenantId, WorkerId};

/// Everything a worker may use to decide its behavior.
///
/// Built per attempt (eligibility check or execution) and never persisted.
/// Workers read budget and time from here only.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub worker_id: WorkerId,
    /// `None` while checking eligibility, set once the attempt is claimed.
    pub process_id: Option<ProcessId>,
    pub tenant_id: Option<TenantId>,
    pub params: JsonValue,
    pub budget_remaining_cents: i64,
    pub time_remaining: Duration,
    pub start_time: DateTime<Utc>,
    started: Instant,
}

impl WorkContext {
    pub fn new(
        worker_id: WorkerId,
        tenant_id: Option<TenantId>,
        budget_remaining_cents: i64,
        time_remaining: Duration,
    ) -> Self {
        Self {
            worker_id,
            process_id: None,
            tenant_id,
            params: JsonValue::Null,
            budget_remaining_cents,
            time_remaining,
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn with_process_id(mut self, process_id: ProcessId) -> Self {
        self.process_id = Some(process_id);
        self
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }

    /// Time left before this attempt's deadline.
    pub fn remaining(&self) -> Duration {
        self.time_remaining.saturating_sub(self.started.elapsed())
    }

    pub fn is_past_deadline(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Tenant this attempt is scoped to, or a validation error for tenant-less
    /// contexts handed to a per-tenant worker.
    pub fn require_tenant(&self) -> Result<TenantId, WorkError> {
        self.tenant_id
            .ok_or_else(|| WorkError::InvalidContext("tenant_id is required".to_string()))
    }
}

/// Outcome a worker reports back to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub success: bool,
    pub cost_cents: u32,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

impl WorkResult {
    pub fn succeeded(cost_cents: u32) -> Self {
        Self {
            success: true,
            cost_cents,
            result: None,
            error: None,
        }
    }

    /// A failure that still incurred `cost_cents` (billed as partial cost).
    pub fn failed(cost_cents: u32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            cost_cents,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn with_result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }
}

/// Error raised by `is_eligible` or `execute`.
///
/// Returned from `execute` it is recorded as a failed completion with zero cost.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkError {
    #[error("invalid work context: {0}")]
    InvalidContext(String),

    #[error("signal lookup failed: {0}")]
    Signal(String),

    #[error("work service failed: {0}")]
    Service(String),

    #[error("internal error: {0}")]
    Internal(String),
}
