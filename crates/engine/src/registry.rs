//! Process registry contract and the in-memory implementation.
//!
//! The registry is the single source of truth for "what is running". Every
//! operation must be atomic with respect to concurrent callers, because more
//! than one conductor instance may tick at the same time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveTime, TimeZone, Utc};

use conductor_core::{ProcessId, TenantId};

use crate::process::{
    ActiveProcessCounts, ClaimRequest, Completion, ProcessRecord, ProcessStatus, Registration,
};

/// Durable record of in-flight work with atomic claim-or-reject semantics.
pub trait ProcessRegistry: Send + Sync {
    /// Insert a running record for a non-conductor process (no dedup check).
    fn register(&self, registration: Registration) -> Result<ProcessId, RegistryError>;

    /// Refresh `last_heartbeat_at` of a running record.
    ///
    /// Returns `false` when the record is no longer running.
    fn heartbeat(&self, process_id: ProcessId) -> Result<bool, RegistryError>;

    /// Terminal transition to `completed` or `failed`.
    ///
    /// Idempotent when repeated with the same terminal status.
    fn complete(&self, process_id: ProcessId, completion: Completion) -> Result<(), RegistryError>;

    /// Transition every running record past its TTL to `expired`.
    fn expire_stale(&self) -> Result<u64, RegistryError>;

    /// Count running records grouped by process type.
    fn count_active(&self) -> Result<ActiveProcessCounts, RegistryError>;

    /// Atomically check the dedup invariant and insert a running record.
    ///
    /// Returns `None` (and changes nothing) when the slot
    /// `(work_catalog_id, tenant_id)` is already held by a running record.
    fn claim(&self, request: ClaimRequest) -> Result<Option<ProcessId>, RegistryError>;

    /// Sum of `cost_cents` for records completed since the start of the UTC day.
    fn daily_spend(&self) -> Result<u64, RegistryError>;

    /// Most recent completion of a catalog entry (for cooldown checks).
    fn last_completed(
        &self,
        work_catalog_id: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<Option<DateTime<Utc>>, RegistryError>;

    fn get(&self, process_id: ProcessId) -> Result<Option<ProcessRecord>, RegistryError>;

    fn list_running(&self) -> Result<Vec<ProcessRecord>, RegistryError>;
}

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("process not found: {0}")]
    NotFound(ProcessId),
    #[error("process {id} is already {status:?}")]
    AlreadyTerminal { id: ProcessId, status: ProcessStatus },
    #[error("invalid completion: {0}")]
    InvalidCompletion(String),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<R> ProcessRegistry for Arc<R>
where
    R: ProcessRegistry + ?Sized,
{
    fn register(&self, registration: Registration) -> Result<ProcessId, RegistryError> {
        (**self).register(registration)
    }

    fn heartbeat(&self, process_id: ProcessId) -> Result<bool, RegistryError> {
        (**self).heartbeat(process_id)
    }

    fn complete(&self, process_id: ProcessId, completion: Completion) -> Result<(), RegistryError> {
        (**self).complete(process_id, completion)
    }

    fn expire_stale(&self) -> Result<u64, RegistryError> {
        (**self).expire_stale()
    }

    fn count_active(&self) -> Result<ActiveProcessCounts, RegistryError> {
        (**self).count_active()
    }

    fn claim(&self, request: ClaimRequest) -> Result<Option<ProcessId>, RegistryError> {
        (**self).claim(request)
    }

    fn daily_spend(&self) -> Result<u64, RegistryError> {
        (**self).daily_spend()
    }

    fn last_completed(
        &self,
        work_catalog_id: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<Option<DateTime<Utc>>, RegistryError> {
        (**self).last_completed(work_catalog_id, tenant_id)
    }

    fn get(&self, process_id: ProcessId) -> Result<Option<ProcessRecord>, RegistryError> {
        (**self).get(process_id)
    }

    fn list_running(&self) -> Result<Vec<ProcessRecord>, RegistryError> {
        (**self).list_running()
    }
}

/// Start of the UTC day containing `now`.
pub fn utc_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN))
}

/// Reject completions that are not a `completed`/`failed` transition.
pub fn validate_completion(completion: &Completion) -> Result<(), RegistryError> {
    match completion.status {
        ProcessStatus::Completed | ProcessStatus::Failed => Ok(()),
        other => Err(RegistryError::InvalidCompletion(format!(
            "status must be completed or failed, got {other:?}"
        ))),
    }
}

/// In-memory registry for tests/dev.
///
/// A single write lock makes `claim` a true check-and-insert.
#[derive(Debug, Default)]
pub struct InMemoryProcessRegistry {
    records: RwLock<HashMap<ProcessId, ProcessRecord>>,
}

impl InMemoryProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a record as-is (history backfill, fixtures).
    pub fn insert(&self, record: ProcessRecord) -> Result<(), RegistryError> {
        self.write()?.insert(record.id, record);
        Ok(())
    }

    /// Every record, oldest first.
    pub fn all(&self) -> Result<Vec<ProcessRecord>, RegistryError> {
        let mut records: Vec<_> = self.read()?.values().cloned().collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ProcessId, ProcessRecord>>, RegistryError> {
        self.records
            .read()
            .map_err(|_| RegistryError::Storage("registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ProcessId, ProcessRecord>>, RegistryError> {
        self.records
            .write()
            .map_err(|_| RegistryError::Storage("registry lock poisoned".to_string()))
    }
}

impl ProcessRegistry for InMemoryProcessRegistry {
    fn register(&self, registration: Registration) -> Result<ProcessId, RegistryError> {
        let record = ProcessRecord::running(
            registration.process_type,
            registration.process_name,
            registration.worker_id,
            registration.tenant_id,
            registration.params,
            registration.ttl_seconds,
            Utc::now(),
        );
        let id = record.id;
        self.write()?.insert(id, record);
        Ok(id)
    }

    fn heartbeat(&self, process_id: ProcessId) -> Result<bool, RegistryError> {
        let mut records = self.write()?;
        let record = records
            .get_mut(&process_id)
            .ok_or(RegistryError::NotFound(process_id))?;
        if record.status != ProcessStatus::Running {
            return Ok(false);
        }
        record.last_heartbeat_at = Some(Utc::now());
        Ok(true)
    }

    fn complete(&self, process_id: ProcessId, completion: Completion) -> Result<(), RegistryError> {
        validate_completion(&completion)?;

        let mut records = self.write()?;
        let record = records
            .get_mut(&process_id)
            .ok_or(RegistryError::NotFound(process_id))?;

        match record.status {
            ProcessStatus::Running => {
                record.apply_completion(&completion, Utc::now());
                Ok(())
            }
            status if status == completion.status => Ok(()),
            status => Err(RegistryError::AlreadyTerminal {
                id: process_id,
                status,
            }),
        }
    }

    fn expire_stale(&self) -> Result<u64, RegistryError> {
        let now = Utc::now();
        let mut records = self.write()?;
        let mut expired = 0;
        for record in records.values_mut().filter(|r| r.is_stale(now)) {
            record.mark_expired(now);
            expired += 1;
        }
        Ok(expired)
    }

    fn count_active(&self) -> Result<ActiveProcessCounts, RegistryError> {
        let records = self.read()?;
        Ok(ActiveProcessCounts::from_types(
            records
                .values()
                .filter(|r| r.status == ProcessStatus::Running)
                .map(|r| r.process_type),
        ))
    }

    fn claim(&self, request: ClaimRequest) -> Result<Option<ProcessId>, RegistryError> {
        let now = Utc::now();
        let mut records = self.write()?;

        // A stale holder would be reaped by the next sweep anyway; release it
        // here so the slot is not blocked until then.
        for record in records.values_mut() {
            if record.holds_slot(&request.work_catalog_id, request.tenant_id) && record.is_stale(now) {
                record.mark_expired(now);
            }
        }

        if records
            .values()
            .any(|r| r.holds_slot(&request.work_catalog_id, request.tenant_id))
        {
            return Ok(None);
        }

        let record = ProcessRecord::from_claim(&request, now);
        let id = record.id;
        records.insert(id, record);
        Ok(Some(id))
    }

    fn daily_spend(&self) -> Result<u64, RegistryError> {
        let since = utc_day_start(Utc::now());
        let records = self.read()?;
        Ok(records
            .values()
            .filter(|r| matches!(r.status, ProcessStatus::Completed | ProcessStatus::Failed))
            .filter(|r| r.completed_at.is_some_and(|at| at >= since))
            .map(|r| u64::from(r.cost_cents))
            .sum())
    }

    fn last_completed(
        &self,
        work_catalog_id: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<Option<DateTime<Utc>>, RegistryError> {
        let records = self.read()?;
        Ok(records
            .values()
            .filter(|r| r.work_catalog_id.as_deref() == Some(work_catalog_id) && r.tenant_id == tenant_id)
            .filter(|r| matches!(r.status, ProcessStatus::Completed | ProcessStatus::Failed))
            .filter_map(|r| r.completed_at)
            .max())
    }

    fn get(&self, process_id: ProcessId) -> Result<Option<ProcessRecord>, RegistryError> {
        Ok(self.read()?.get(&process_id).cloned())
    }

    fn list_running(&self) -> Result<Vec<ProcessRecord>, RegistryError> {
        let mut running: Vec<_> = self
            .read()?
            .values()
            .filter(|r| r.status == ProcessStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|r| r.started_at);
        Ok(running)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use conductor_core::WorkerId;
    use serde_json::json;

    use super::*;
    use crate::process::ProcessType;

    fn worker() -> WorkerId {
        WorkerId::generate("test")
    }

    fn claim(registry: &InMemoryProcessRegistry, id: &str, tenant: Option<TenantId>) -> Option<ProcessId> {
        registry
            .claim(ClaimRequest::new(worker(), id, tenant))
            .unwrap()
    }

    fn backdate(registry: &InMemoryProcessRegistry, id: ProcessId, by: chrono::Duration) {
        let mut records = registry.records.write().unwrap();
        let record = records.get_mut(&id).unwrap();
        record.started_at = record.started_at - by;
    }

    #[test]
    fn second_claim_for_same_slot_is_rejected() {
        let registry = InMemoryProcessRegistry::new();
        let tenant = TenantId::new();

        assert!(claim(&registry, "trend_detection", Some(tenant)).is_some());
        assert!(claim(&registry, "trend_detection", Some(tenant)).is_none());

        // Other tenant and tenant-less slots are independent.
        assert!(claim(&registry, "trend_detection", Some(TenantId::new())).is_some());
        assert!(claim(&registry, "trend_detection", None).is_some());
        assert_eq!(registry.count_active().unwrap().total, 3);
    }

    #[test]
    fn concurrent_claims_yield_exactly_one_winner() {
        let registry = InMemoryProcessRegistry::arc();
        let tenant = TenantId::new();
        let contenders = 16;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry
                        .claim(ClaimRequest::new(worker(), "memory_consolidation", Some(tenant)))
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn stale_records_expire_and_free_their_slot() {
        let registry = InMemoryProcessRegistry::new();
        let tenant = TenantId::new();
        let id = claim(&registry, "context_enrichment", Some(tenant)).unwrap();
        backdate(&registry, id, chrono::Duration::seconds(120));

        assert_eq!(registry.expire_stale().unwrap(), 1);
        assert_eq!(registry.get(id).unwrap().unwrap().status, ProcessStatus::Expired);
        assert_eq!(registry.count_active().unwrap().total, 0);
        assert!(claim(&registry, "context_enrichment", Some(tenant)).is_some());
    }

    #[test]
    fn claim_releases_a_stale_holder_before_the_sweep() {
        let registry = InMemoryProcessRegistry::new();
        let id = claim(&registry, "etl_catchup", None).unwrap();
        backdate(&registry, id, chrono::Duration::seconds(300));

        assert!(claim(&registry, "etl_catchup", None).is_some());
        assert_eq!(registry.get(id).unwrap().unwrap().status, ProcessStatus::Expired);
    }

    #[test]
    fn heartbeat_keeps_a_record_alive() {
        let registry = InMemoryProcessRegistry::new();
        let id = registry
            .register(Registration::new(ProcessType::AsyncTask, "async", worker()))
            .unwrap();
        backdate(&registry, id, chrono::Duration::seconds(120));

        assert!(registry.heartbeat(id).unwrap());
        assert_eq!(registry.expire_stale().unwrap(), 0);
        assert_eq!(registry.count_active().unwrap().of(ProcessType::AsyncTask), 1);
    }

    #[test]
    fn complete_is_idempotent_for_same_status_only() {
        let registry = InMemoryProcessRegistry::new();
        let id = claim(&registry, "outcome_analysis", Some(TenantId::new())).unwrap();

        let done = Completion::completed(2).with_result(Some(json!({"processed": 4})));
        registry.complete(id, done.clone()).unwrap();
        registry.complete(id, done).unwrap();

        let err = registry.complete(id, Completion::failed(0, "late")).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyTerminal { status: ProcessStatus::Completed, .. }));

        let record = registry.get(id).unwrap().unwrap();
        assert_eq!(record.cost_cents, 2);
        assert_eq!(record.result, Some(json!({"processed": 4})));
    }

    #[test]
    fn complete_rejects_non_terminal_status_and_unknown_ids() {
        let registry = InMemoryProcessRegistry::new();
        let id = claim(&registry, "data_quality_audit", None).unwrap();

        let mut bogus = Completion::completed(0);
        bogus.status = ProcessStatus::Expired;
        assert!(matches!(
            registry.complete(id, bogus),
            Err(RegistryError::InvalidCompletion(_))
        ));
        assert!(matches!(
            registry.complete(ProcessId::new(), Completion::completed(0)),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn daily_spend_and_last_completed_track_terminal_records() {
        let registry = InMemoryProcessRegistry::new();
        let tenant = TenantId::new();

        let a = claim(&registry, "deep_knowledge_analysis", Some(tenant)).unwrap();
        registry.complete(a, Completion::completed(3)).unwrap();
        let b = claim(&registry, "deep_knowledge_analysis", Some(tenant)).unwrap();
        registry.complete(b, Completion::failed(1, "model timeout")).unwrap();
        let _running = claim(&registry, "trend_detection", Some(tenant)).unwrap();

        assert_eq!(registry.daily_spend().unwrap(), 4);

        let last = registry
            .last_completed("deep_knowledge_analysis", Some(tenant))
            .unwrap()
            .unwrap();
        assert_eq!(Some(last), registry.get(b).unwrap().unwrap().completed_at);
        assert!(registry.last_completed("deep_knowledge_analysis", None).unwrap().is_none());
        assert!(registry.last_completed("trend_detection", Some(tenant)).unwrap().is_none());
    }

    #[test]
    fn day_start_is_midnight_utc() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(utc_day_start(now), Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap());
    }
}
