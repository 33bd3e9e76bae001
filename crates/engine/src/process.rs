//! Process records and the requests the registry accepts.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use conductor_core::{ProcessId, TenantId, WorkerId};

/// Default time-to-live assigned at claim time.
pub const DEFAULT_TTL_SECONDS: u32 = 65;

/// Kind of in-flight process tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    ScheduledTrigger,
    ConductorWork,
    AsyncTask,
    EventHandler,
}

impl ProcessType {
    pub const ALL: [ProcessType; 4] = [
        ProcessType::ScheduledTrigger,
        ProcessType::ConductorWork,
        ProcessType::AsyncTask,
        ProcessType::EventHandler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::ScheduledTrigger => "scheduled_trigger",
            ProcessType::ConductorWork => "conductor_work",
            ProcessType::AsyncTask => "async_task",
            ProcessType::EventHandler => "event_handler",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

/// Lifecycle status of a process record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Expired,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ProcessStatus::Running),
            "completed" => Some(ProcessStatus::Completed),
            "failed" => Some(ProcessStatus::Failed),
            "expired" => Some(ProcessStatus::Expired),
            _ => None,
        }
    }
}

/// One row per in-flight or finished unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub process_type: ProcessType,
    pub process_name: String,
    pub worker_id: WorkerId,
    pub tenant_id: Option<TenantId>,
    /// Set only for `ConductorWork`.
    pub work_catalog_id: Option<String>,
    pub params: JsonValue,
    pub ttl_seconds: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub status: ProcessStatus,
    pub cost_cents: u32,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessRecord {
    /// Build a fresh `running` record.
    pub fn running(
        process_type: ProcessType,
        process_name: impl Into<String>,
        worker_id: WorkerId,
        tenant_id: Option<TenantId>,
        params: JsonValue,
        ttl_seconds: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ProcessId::new(),
            process_type,
            process_name: process_name.into(),
            worker_id,
            tenant_id,
            work_catalog_id: None,
            params,
            ttl_seconds,
            started_at: now,
            last_heartbeat_at: None,
            status: ProcessStatus::Running,
            cost_cents: 0,
            result: None,
            error: None,
            completed_at: None,
        }
    }

    /// Build the record a successful claim inserts.
    pub fn from_claim(request: &ClaimRequest, now: DateTime<Utc>) -> Self {
        let mut record = Self::running(
            ProcessType::ConductorWork,
            request.process_name.clone(),
            request.worker_id.clone(),
            request.tenant_id,
            request.params.clone(),
            request.ttl_seconds,
            now,
        );
        record.work_catalog_id = Some(request.work_catalog_id.clone());
        record
    }

    /// Instant after which a running record without a newer heartbeat is stale.
    pub fn deadline(&self) -> DateTime<Utc> {
        let anchor = self.last_heartbeat_at.unwrap_or(self.started_at);
        anchor + chrono::Duration::seconds(i64::from(self.ttl_seconds))
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == ProcessStatus::Running && now > self.deadline()
    }

    /// Whether this record occupies the dedup slot `(work_catalog_id, tenant_id)`.
    pub fn holds_slot(&self, work_catalog_id: &str, tenant_id: Option<TenantId>) -> bool {
        self.status == ProcessStatus::Running
            && self.process_type == ProcessType::ConductorWork
            && self.work_catalog_id.as_deref() == Some(work_catalog_id)
            && self.tenant_id == tenant_id
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) {
        self.status = ProcessStatus::Expired;
        self.completed_at = Some(now);
        self.error = Some(format!("ttl of {}s elapsed without heartbeat", self.ttl_seconds));
    }

    pub fn apply_completion(&mut self, completion: &Completion, now: DateTime<Utc>) {
        self.status = completion.status;
        self.result = completion.result.clone();
        self.error = completion.error.clone();
        self.cost_cents = completion.cost_cents;
        self.completed_at = Some(now);
    }
}

/// Atomic claim request for one unit of catalog work.
///
/// `tenant_id` is `Some` exactly when the catalog entry is per-tenant, so the
/// dedup key is always `(work_catalog_id, tenant_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: WorkerId,
    pub work_catalog_id: String,
    pub process_name: String,
    pub tenant_id: Option<TenantId>,
    pub params: JsonValue,
    pub ttl_seconds: u32,
}

impl ClaimRequest {
    pub fn new(
        worker_id: WorkerId,
        work_catalog_id: impl Into<String>,
        tenant_id: Option<TenantId>,
    ) -> Self {
        let work_catalog_id = work_catalog_id.into();
        Self {
            worker_id,
            process_name: work_catalog_id.clone(),
            work_catalog_id,
            tenant_id,
            params: JsonValue::Null,
            ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }

    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = name.into();
        self
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_seconds = u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX);
        self
    }
}

/// Registration of a non-conductor process (no dedup check).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub process_type: ProcessType,
    pub process_name: String,
    pub worker_id: WorkerId,
    pub tenant_id: Option<TenantId>,
    pub params: JsonValue,
    pub ttl_seconds: u32,
}

impl Registration {
    pub fn new(process_type: ProcessType, process_name: impl Into<String>, worker_id: WorkerId) -> Self {
        Self {
            process_type,
            process_name: process_name.into(),
            worker_id,
            tenant_id: None,
            params: JsonValue::Null,
            ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: u32) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }
}

/// Terminal transition applied by `complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub status: ProcessStatus,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub cost_cents: u32,
}

impl Completion {
    pub fn completed(cost_cents: u32) -> Self {
        Self {
            status: ProcessStatus::Completed,
            result: None,
            error: None,
            cost_cents,
        }
    }

    pub fn failed(cost_cents: u32, error: impl Into<String>) -> Self {
        Self {
            status: ProcessStatus::Failed,
            result: None,
            error: Some(error.into()),
            cost_cents,
        }
    }

    pub fn with_result(mut self, result: Option<JsonValue>) -> Self {
        self.result = result;
        self
    }
}

/// Snapshot count of running records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProcessCounts {
    pub total: u32,
    pub by_type: BTreeMap<ProcessType, u32>,
}

impl ActiveProcessCounts {
    pub fn from_types<I: IntoIterator<Item = ProcessType>>(types: I) -> Self {
        let mut counts = Self::default();
        for t in types {
            counts.add(t, 1);
        }
        counts
    }

    pub fn add(&mut self, process_type: ProcessType, n: u32) {
        *self.by_type.entry(process_type).or_insert(0) += n;
        self.total += n;
    }

    pub fn of(&self, process_type: ProcessType) -> u32 {
        self.by_type.get(&process_type).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> WorkerId {
        WorkerId::generate("test")
    }

    #[test]
    fn heartbeat_moves_the_deadline() {
        let start = Utc::now() - chrono::Duration::seconds(120);
        let mut record = ProcessRecord::running(
            ProcessType::AsyncTask,
            "task",
            worker(),
            None,
            JsonValue::Null,
            65,
            start,
        );
        assert!(record.is_stale(Utc::now()));

        record.last_heartbeat_at = Some(Utc::now() - chrono::Duration::seconds(10));
        assert!(!record.is_stale(Utc::now()));
    }

    #[test]
    fn terminal_records_are_never_stale() {
        let start = Utc::now() - chrono::Duration::seconds(600);
        let mut record = ProcessRecord::running(
            ProcessType::EventHandler,
            "handler",
            worker(),
            None,
            JsonValue::Null,
            65,
            start,
        );
        record.apply_completion(&Completion::completed(0), start);
        assert!(!record.is_stale(Utc::now()));
    }

    #[test]
    fn claim_record_holds_its_slot_only() {
        let tenant = TenantId::new();
        let request = ClaimRequest::new(worker(), "trend_detection", Some(tenant));
        let record = ProcessRecord::from_claim(&request, Utc::now());

        assert!(record.holds_slot("trend_detection", Some(tenant)));
        assert!(!record.holds_slot("trend_detection", Some(TenantId::new())));
        assert!(!record.holds_slot("trend_detection", None));
        assert!(!record.holds_slot("etl_catchup", Some(tenant)));
    }

    #[test]
    fn active_counts_group_by_type() {
        let counts = ActiveProcessCounts::from_types([
            ProcessType::ConductorWork,
            ProcessType::ConductorWork,
            ProcessType::AsyncTask,
        ]);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.of(ProcessType::ConductorWork), 2);
        assert_eq!(counts.of(ProcessType::EventHandler), 0);
    }

    #[test]
    fn process_type_names_parse_back() {
        for t in ProcessType::ALL {
            assert_eq!(ProcessType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ProcessStatus::parse("expired"), Some(ProcessStatus::Expired));
        assert_eq!(ProcessStatus::parse("cancelled"), None);
    }
}
