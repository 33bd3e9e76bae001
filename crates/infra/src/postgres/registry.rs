//! Postgres-backed process registry.
//!
//! `claim` runs in one transaction: release a stale holder of the slot, then
//! `INSERT ... ON CONFLICT DO NOTHING` against the partial unique index. Two
//! concurrent claimers serialize on the index; the loser gets no row back.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use conductor_core::{ProcessId, TenantId, WorkerId};
use conductor_engine::registry::{utc_day_start, validate_completion};
use conductor_engine::{
    ActiveProcessCounts, ClaimRequest, Completion, ProcessRecord, ProcessRegistry, ProcessStatus, ProcessType,
    RegistryError, Registration,
};

use super::{PgBridge, is_unique_violation, map_sqlx_error};

const RECORD_COLUMNS: &str = r#"
    id, process_type, process_name, worker_id, tenant_id, work_catalog_id, params,
    ttl_seconds, started_at, last_heartbeat_at, status, cost_cents, result, error, completed_at
"#;

const STALE: &str = "COALESCE(last_heartbeat_at, started_at) + ttl_seconds * interval '1 second' < now()";

#[derive(Debug, Clone)]
pub struct PostgresProcessRegistry {
    db: PgBridge,
}

impl PostgresProcessRegistry {
    pub fn new(db: PgBridge) -> Self {
        Self { db }
    }

    fn status_of(&self, process_id: ProcessId) -> Result<Option<ProcessStatus>, RegistryError> {
        let row = self
            .db
            .run(|pool| async move {
                sqlx::query("SELECT status FROM conductor_processes WHERE id = $1")
                    .bind(Uuid::from(process_id))
                    .fetch_optional(pool)
                    .await
            })
            .map_err(|e| map_sqlx_error("status_of", e))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| map_sqlx_error("status_of", e))?;
                ProcessStatus::parse(&status)
                    .map(Some)
                    .ok_or_else(|| RegistryError::Storage(format!("unknown process status '{status}'")))
            }
        }
    }
}

impl ProcessRegistry for PostgresProcessRegistry {
    #[instrument(skip(self, registration), fields(process_name = %registration.process_name), err)]
    fn register(&self, registration: Registration) -> Result<ProcessId, RegistryError> {
        let id = ProcessId::new();
        self.db
            .run(|pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO conductor_processes (
                        id, process_type, process_name, worker_id, tenant_id, params, ttl_seconds
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(Uuid::from(id))
                .bind(registration.process_type.as_str())
                .bind(&registration.process_name)
                .bind(registration.worker_id.as_str())
                .bind(registration.tenant_id.map(Uuid::from))
                .bind(&registration.params)
                .bind(ttl(registration.ttl_seconds))
                .execute(pool)
                .await
            })
            .map_err(|e| map_sqlx_error("register", e))?;
        Ok(id)
    }

    fn heartbeat(&self, process_id: ProcessId) -> Result<bool, RegistryError> {
        let touched = self
            .db
            .run(|pool| async move {
                sqlx::query(
                    r#"
                    UPDATE conductor_processes
                    SET last_heartbeat_at = now()
                    WHERE id = $1 AND status = 'running'
                    "#,
                )
                .bind(Uuid::from(process_id))
                .execute(pool)
                .await
            })
            .map_err(|e| map_sqlx_error("heartbeat", e))?
            .rows_affected();

        if touched > 0 {
            return Ok(true);
        }
        match self.status_of(process_id)? {
            Some(_) => Ok(false),
            None => Err(RegistryError::NotFound(process_id)),
        }
    }

    #[instrument(skip(self, completion), fields(process_id = %process_id, status = completion.status.as_str()), err)]
    fn complete(&self, process_id: ProcessId, completion: Completion) -> Result<(), RegistryError> {
        validate_completion(&completion)?;

        let status = completion.status;
        let updated = self
            .db
            .run(|pool| async move {
                sqlx::query(
                    r#"
                    UPDATE conductor_processes
                    SET status = $2, result = $3, error = $4, cost_cents = $5, completed_at = now()
                    WHERE id = $1 AND status = 'running'
                    "#,
                )
                .bind(Uuid::from(process_id))
                .bind(completion.status.as_str())
                .bind(&completion.result)
                .bind(&completion.error)
                .bind(cents(completion.cost_cents))
                .execute(pool)
                .await
            })
            .map_err(|e| map_sqlx_error("complete", e))?
            .rows_affected();

        if updated > 0 {
            return Ok(());
        }
        match self.status_of(process_id)? {
            None => Err(RegistryError::NotFound(process_id)),
            Some(current) if current == status => Ok(()),
            Some(current) => Err(RegistryError::AlreadyTerminal {
                id: process_id,
                status: current,
            }),
        }
    }

    #[instrument(skip(self), err)]
    fn expire_stale(&self) -> Result<u64, RegistryError> {
        let sql = format!(
            r#"
            UPDATE conductor_processes
            SET status = 'expired',
                completed_at = now(),
                error = 'ttl of ' || ttl_seconds || 's elapsed without heartbeat'
            WHERE status = 'running' AND {STALE}
            "#
        );
        let result = self
            .db
            .run(|pool| async move { sqlx::query(&sql).execute(pool).await })
            .map_err(|e| map_sqlx_error("expire_stale", e))?;
        Ok(result.rows_affected())
    }

    fn count_active(&self) -> Result<ActiveProcessCounts, RegistryError> {
        let rows = self
            .db
            .run(|pool| async move {
                sqlx::query(
                    r#"
                    SELECT process_type, COUNT(*) AS total
                    FROM conductor_processes
                    WHERE status = 'running'
                    GROUP BY process_type
                    "#,
                )
                .fetch_all(pool)
                .await
            })
            .map_err(|e| map_sqlx_error("count_active", e))?;

        let mut counts = ActiveProcessCounts::default();
        for row in rows {
            let process_type: String = row
                .try_get("process_type")
                .map_err(|e| map_sqlx_error("count_active", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("count_active", e))?;
            match ProcessType::parse(&process_type) {
                Some(t) => counts.add(t, u32::try_from(total).unwrap_or(u32::MAX)),
                None => warn!(process_type = %process_type, "ignoring running records of unknown type"),
            }
        }
        Ok(counts)
    }

    #[instrument(
        skip(self, request),
        fields(work_id = %request.work_catalog_id, tenant = ?request.tenant_id),
        err
    )]
    fn claim(&self, request: ClaimRequest) -> Result<Option<ProcessId>, RegistryError> {
        let id = ProcessId::new();
        let release_stale = format!(
            r#"
            UPDATE conductor_processes
            SET status = 'expired',
                completed_at = now(),
                error = 'ttl of ' || ttl_seconds || 's elapsed without heartbeat'
            WHERE status = 'running'
                AND process_type = 'conductor_work'
                AND work_catalog_id = $1
                AND tenant_id IS NOT DISTINCT FROM $2
                AND {STALE}
            "#
        );

        let inserted = self.db.run(|pool| async move {
            let mut tx = pool.begin().await?;
            sqlx::query(&release_stale)
                .bind(&request.work_catalog_id)
                .bind(request.tenant_id.map(Uuid::from))
                .execute(&mut *tx)
                .await?;

            let row = sqlx::query(
                r#"
                INSERT INTO conductor_processes (
                    id, process_type, process_name, worker_id, tenant_id, work_catalog_id,
                    params, ttl_seconds
                )
                VALUES ($1, 'conductor_work', $2, $3, $4, $5, $6, $7)
                ON CONFLICT DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::from(id))
            .bind(&request.process_name)
            .bind(request.worker_id.as_str())
            .bind(request.tenant_id.map(Uuid::from))
            .bind(&request.work_catalog_id)
            .bind(&request.params)
            .bind(ttl(request.ttl_seconds))
            .fetch_optional(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok::<_, sqlx::Error>(row.is_some())
        });

        match inserted {
            Ok(true) => Ok(Some(id)),
            Ok(false) => Ok(None),
            // The conflict can also surface as an error when the competing
            // transaction commits between our check and insert.
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(map_sqlx_error("claim", e)),
        }
    }

    fn daily_spend(&self) -> Result<u64, RegistryError> {
        let since = utc_day_start(Utc::now());
        let total: i64 = self
            .db
            .run(|pool| async move {
                sqlx::query_scalar(
                    r#"
                    SELECT COALESCE(SUM(cost_cents), 0)::bigint
                    FROM conductor_processes
                    WHERE status IN ('completed', 'failed') AND completed_at >= $1
                    "#,
                )
                .bind(since)
                .fetch_one(pool)
                .await
            })
            .map_err(|e| map_sqlx_error("daily_spend", e))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    fn last_completed(
        &self,
        work_catalog_id: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<Option<DateTime<Utc>>, RegistryError> {
        self.db
            .run(|pool| async move {
                sqlx::query_scalar(
                    r#"
                    SELECT MAX(completed_at)
                    FROM conductor_processes
                    WHERE work_catalog_id = $1
                        AND tenant_id IS NOT DISTINCT FROM $2
                        AND status IN ('completed', 'failed')
                    "#,
                )
                .bind(work_catalog_id)
                .bind(tenant_id.map(Uuid::from))
                .fetch_one(pool)
                .await
            })
            .map_err(|e| map_sqlx_error("last_completed", e))
    }

    fn get(&self, process_id: ProcessId) -> Result<Option<ProcessRecord>, RegistryError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM conductor_processes WHERE id = $1");
        let row = self
            .db
            .run(|pool| async move {
                sqlx::query(&sql)
                    .bind(Uuid::from(process_id))
                    .fetch_optional(pool)
                    .await
            })
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_record(&row)).transpose()
    }

    fn list_running(&self) -> Result<Vec<ProcessRecord>, RegistryError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM conductor_processes WHERE status = 'running' ORDER BY started_at ASC"
        );
        let rows = self
            .db
            .run(|pool| async move { sqlx::query(&sql).fetch_all(pool).await })
            .map_err(|e| map_sqlx_error("list_running", e))?;

        rows.iter().map(decode_record).collect()
    }
}

fn ttl(seconds: u32) -> i32 {
    i32::try_from(seconds).unwrap_or(i32::MAX)
}

fn cents(cents: u32) -> i32 {
    i32::try_from(cents).unwrap_or(i32::MAX)
}

fn decode_record(row: &sqlx::postgres::PgRow) -> Result<ProcessRecord, RegistryError> {
    let row = ProcessRow::from_row(row)
        .map_err(|e| RegistryError::Storage(format!("failed to deserialize process row: {}", e)))?;
    row.try_into()
}

// SQLx row types

#[derive(Debug)]
struct ProcessRow {
    id: Uuid,
    process_type: String,
    process_name: String,
    worker_id: String,
    tenant_id: Option<Uuid>,
    work_catalog_id: Option<String>,
    params: serde_json::Value,
    ttl_seconds: i32,
    started_at: DateTime<Utc>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    status: String,
    cost_cents: i32,
    result: Option<serde_json::Value>,
    error: Option<String>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ProcessRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProcessRow {
            id: row.try_get("id")?,
            process_type: row.try_get("process_type")?,
            process_name: row.try_get("process_name")?,
            worker_id: row.try_get("worker_id")?,
            tenant_id: row.try_get("tenant_id")?,
            work_catalog_id: row.try_get("work_catalog_id")?,
            params: row.try_get("params")?,
            ttl_seconds: row.try_get("ttl_seconds")?,
            started_at: row.try_get("started_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            status: row.try_get("status")?,
            cost_cents: row.try_get("cost_cents")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<ProcessRow> for ProcessRecord {
    type Error = RegistryError;

    fn try_from(row: ProcessRow) -> Result<Self, Self::Error> {
        let process_type = ProcessType::parse(&row.process_type)
            .ok_or_else(|| RegistryError::Storage(format!("unknown process type '{}'", row.process_type)))?;
        let status = ProcessStatus::parse(&row.status)
            .ok_or_else(|| RegistryError::Storage(format!("unknown process status '{}'", row.status)))?;
        let worker_id = WorkerId::parse(row.worker_id).map_err(|e| RegistryError::Storage(e.to_string()))?;

        Ok(ProcessRecord {
            id: ProcessId::from_uuid(row.id),
            process_type,
            process_name: row.process_name,
            worker_id,
            tenant_id: row.tenant_id.map(TenantId::from_uuid),
            work_catalog_id: row.work_catalog_id,
            params: row.params,
            ttl_seconds: u32::try_from(row.ttl_seconds).unwrap_or(0),
            started_at: row.started_at,
            last_heartbeat_at: row.last_heartbeat_at,
            status,
            cost_cents: u32::try_from(row.cost_cents).unwrap_or(0),
            result: row.result,
            error: row.error,
            completed_at: row.completed_at,
        })
    }
}

/// These run only when `DATABASE_URL` points at a disposable database.
#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use serde_json::json;

    use super::*;
    use crate::postgres::test_support::connect;

    fn request(work_id: &str, tenant: Option<TenantId>) -> ClaimRequest {
        ClaimRequest::new(WorkerId::generate("pg-test"), work_id, tenant)
    }

    fn unique_work_id(prefix: &str) -> String {
        format!("{prefix}_{}", Uuid::now_v7().simple())
    }

    #[test]
    fn concurrent_claims_admit_exactly_one() {
        let Some((_rt, db)) = connect() else { return };
        let registry = Arc::new(PostgresProcessRegistry::new(db));
        let work_id = unique_work_id("race");
        let tenant = Some(TenantId::new());

        let claimers = 8;
        let barrier = Arc::new(Barrier::new(claimers));
        let handles: Vec<_> = (0..claimers)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                let work_id = work_id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.claim(request(&work_id, tenant)).unwrap()
                })
            })
            .collect();

        let won = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Option::is_some)
            .count();
        assert_eq!(won, 1);
    }

    #[test]
    fn tenantless_slots_are_deduplicated_too() {
        let Some((_rt, db)) = connect() else { return };
        let registry = PostgresProcessRegistry::new(db);
        let work_id = unique_work_id("global");

        assert!(registry.claim(request(&work_id, None)).unwrap().is_some());
        assert!(registry.claim(request(&work_id, None)).unwrap().is_none());
        assert!(registry.claim(request(&work_id, Some(TenantId::new()))).unwrap().is_some());
    }

    #[test]
    fn completion_frees_the_slot_and_counts_toward_spend() {
        let Some((_rt, db)) = connect() else { return };
        let registry = PostgresProcessRegistry::new(db);
        let work_id = unique_work_id("spend");
        let tenant = Some(TenantId::new());

        let before = registry.daily_spend().unwrap();
        let id = registry.claim(request(&work_id, tenant)).unwrap().unwrap();
        registry
            .complete(id, Completion::completed(3).with_result(Some(json!({"ok": true}))))
            .unwrap();
        registry.complete(id, Completion::completed(3)).unwrap();

        assert!(registry.daily_spend().unwrap() >= before + 3);
        assert!(registry.last_completed(&work_id, tenant).unwrap().is_some());
        assert!(registry.claim(request(&work_id, tenant)).unwrap().is_some());

        let record = registry.get(id).unwrap().unwrap();
        assert_eq!(record.status, ProcessStatus::Completed);
        assert_eq!(record.cost_cents, 3);
        assert!(matches!(
            registry.complete(id, Completion::failed(0, "late")),
            Err(RegistryError::AlreadyTerminal { .. })
        ));
    }

    #[test]
    fn stale_holder_is_released_on_claim() {
        let Some((_rt, db)) = connect() else { return };
        let registry = PostgresProcessRegistry::new(db.clone());
        let work_id = unique_work_id("stale");

        let stale = registry.claim(request(&work_id, None)).unwrap().unwrap();
        db.run(|pool| async move {
            sqlx::query("UPDATE conductor_processes SET started_at = now() - interval '10 minutes' WHERE id = $1")
                .bind(Uuid::from(stale))
                .execute(pool)
                .await
        })
        .unwrap();

        assert!(registry.claim(request(&work_id, None)).unwrap().is_some());
        assert_eq!(registry.get(stale).unwrap().unwrap().status, ProcessStatus::Expired);
    }

    #[test]
    fn heartbeat_reports_whether_the_record_still_runs() {
        let Some((_rt, db)) = connect() else { return };
        let registry = PostgresProcessRegistry::new(db);

        let id = registry
            .register(Registration::new(ProcessType::AsyncTask, "pg-heartbeat", WorkerId::generate("t")))
            .unwrap();
        assert!(registry.heartbeat(id).unwrap());
        assert!(registry.count_active().unwrap().of(ProcessType::AsyncTask) >= 1);

        registry.complete(id, Completion::failed(0, "boom")).unwrap();
        assert!(!registry.heartbeat(id).unwrap());
        assert!(matches!(registry.heartbeat(ProcessId::new()), Err(RegistryError::NotFound(_))));
    }
}
