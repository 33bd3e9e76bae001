//! Activity signals read by eligibility checks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use conductor_core::TenantId;
use conductor_engine::WorkError;

/// What is being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    PendingInterventions,
    OverdueTasks,
    UndeliveredInsights,
    /// Async tasks queued or failed (awaiting retry).
    QueuedAsyncTasks,
    DocumentChunks,
    DailySummaries,
    ActiveGoals,
    AnalyzedEmails,
    InboundMessages,
    Messages,
    MemoryHighlights,
    /// Completed silver/gold ETL runs.
    CompletedEtlRuns,
    QueuedLoopItems,
    ActiveGeneratedApps,
    CompletedInterventions,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::PendingInterventions => "pending_interventions",
            SignalKind::OverdueTasks => "overdue_tasks",
            SignalKind::UndeliveredInsights => "undelivered_insights",
            SignalKind::QueuedAsyncTasks => "queued_async_tasks",
            SignalKind::DocumentChunks => "document_chunks",
            SignalKind::DailySummaries => "daily_summaries",
            SignalKind::ActiveGoals => "active_goals",
            SignalKind::AnalyzedEmails => "analyzed_emails",
            SignalKind::InboundMessages => "inbound_messages",
            SignalKind::Messages => "messages",
            SignalKind::MemoryHighlights => "memory_highlights",
            SignalKind::CompletedEtlRuns => "completed_etl_runs",
            SignalKind::QueuedLoopItems => "queued_loop_items",
            SignalKind::ActiveGeneratedApps => "active_generated_apps",
            SignalKind::CompletedInterventions => "completed_interventions",
        }
    }
}

/// A count over `kind`, optionally restricted to the trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal {
    pub kind: SignalKind,
    pub window: Option<Duration>,
}

impl Signal {
    pub const fn total(kind: SignalKind) -> Self {
        Self { kind, window: None }
    }

    pub const fn within_hours(kind: SignalKind, hours: u64) -> Self {
        Self {
            kind,
            window: Some(Duration::from_secs(hours * 3_600)),
        }
    }

    pub const fn within_days(kind: SignalKind, days: u64) -> Self {
        Self::within_hours(kind, days * 24)
    }
}

/// How active a tenant has been recently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityClass {
    Active,
    Normal,
    Quiet,
    Dormant,
}

impl ActivityClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ActivityClass::Active),
            "normal" => Some(ActivityClass::Normal),
            "quiet" => Some(ActivityClass::Quiet),
            "dormant" => Some(ActivityClass::Dormant),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal source unavailable: {0}")]
    Unavailable(String),

    #[error("signal {0} is not supported by this reader")]
    Unsupported(&'static str),
}

impl From<SignalError> for WorkError {
    fn from(e: SignalError) -> Self {
        WorkError::Signal(e.to_string())
    }
}

/// Read-only access to activity counts.
pub trait SignalReader: Send + Sync {
    /// Count for `signal`, scoped to `tenant_id` when given.
    fn count(&self, signal: Signal, tenant_id: Option<TenantId>) -> Result<u64, SignalError>;

    fn activity_class(&self, tenant_id: TenantId) -> Result<Option<ActivityClass>, SignalError>;
}

impl<S> SignalReader for Arc<S>
where
    S: SignalReader + ?Sized,
{
    fn count(&self, signal: Signal, tenant_id: Option<TenantId>) -> Result<u64, SignalError> {
        (**self).count(signal, tenant_id)
    }

    fn activity_class(&self, tenant_id: TenantId) -> Result<Option<ActivityClass>, SignalError> {
        (**self).activity_class(tenant_id)
    }
}

/// Settable signal values (tests/dev). Windows are ignored; unset counts are 0.
#[derive(Debug, Default)]
pub struct InMemorySignalReader {
    counts: RwLock<HashMap<(SignalKind, Option<TenantId>), u64>>,
    activity: RwLock<HashMap<TenantId, ActivityClass>>,
}

impl InMemorySignalReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, kind: SignalKind, tenant_id: Option<TenantId>, count: u64) {
        if let Ok(mut counts) = self.counts.write() {
            counts.insert((kind, tenant_id), count);
        }
    }

    pub fn set_activity(&self, tenant_id: TenantId, class: ActivityClass) {
        if let Ok(mut activity) = self.activity.write() {
            activity.insert(tenant_id, class);
        }
    }
}

impl SignalReader for InMemorySignalReader {
    fn count(&self, signal: Signal, tenant_id: Option<TenantId>) -> Result<u64, SignalError> {
        let counts = self
            .counts
            .read()
            .map_err(|_| SignalError::Unavailable("signal lock poisoned".to_string()))?;
        Ok(counts.get(&(signal.kind, tenant_id)).copied().unwrap_or(0))
    }

    fn activity_class(&self, tenant_id: TenantId) -> Result<Option<ActivityClass>, SignalError> {
        let activity = self
            .activity
            .read()
            .map_err(|_| SignalError::Unavailable("signal lock poisoned".to_string()))?;
        Ok(activity.get(&tenant_id).copied())
    }
}
