//! Signal counts over the application's activity tables.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use conductor_core::TenantId;
use conductor_workers::{ActivityClass, Signal, SignalError, SignalKind, SignalReader};

use super::PgBridge;

/// Where a signal is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CountQuery {
    table: &'static str,
    filter: &'static str,
    /// Column compared against the window start.
    time_column: &'static str,
    /// `false` for system-wide tables.
    tenant_scoped: bool,
}

const fn tenant_table(table: &'static str, filter: &'static str) -> CountQuery {
    CountQuery {
        table,
        filter,
        time_column: "created_at",
        tenant_scoped: true,
    }
}

fn count_query(kind: SignalKind) -> CountQuery {
    match kind {
        SignalKind::PendingInterventions => tenant_table("exo_autonomy_interventions", "status = 'proposed'"),
        SignalKind::OverdueTasks => tenant_table("exo_tasks", "status = 'active' AND due_date <= now()"),
        SignalKind::UndeliveredInsights => tenant_table("exo_insight_deliveries", "delivered_at IS NULL"),
        SignalKind::QueuedAsyncTasks => tenant_table("exo_async_tasks", "status IN ('queued', 'failed')"),
        SignalKind::DocumentChunks => tenant_table("exo_document_chunks", "TRUE"),
        SignalKind::DailySummaries => tenant_table("exo_daily_summaries", "TRUE"),
        SignalKind::ActiveGoals => tenant_table("user_quests", "status IN ('active', 'pending')"),
        SignalKind::AnalyzedEmails => tenant_table("exo_analyzed_emails", "TRUE"),
        SignalKind::InboundMessages => tenant_table("exo_unified_messages", "direction = 'inbound'"),
        SignalKind::Messages => tenant_table("exo_unified_messages", "TRUE"),
        SignalKind::MemoryHighlights => tenant_table("exo_memory_highlights", "TRUE"),
        SignalKind::CompletedEtlRuns => CountQuery {
            table: "admin_cron_runs",
            filter: "cron_name IN ('silver-etl', 'gold-etl') AND status = 'completed'",
            time_column: "completed_at",
            tenant_scoped: false,
        },
        SignalKind::QueuedLoopItems => tenant_table("exo_petla_queue", "status = 'queued'"),
        SignalKind::ActiveGeneratedApps => tenant_table("exo_generated_apps", "status = 'active'"),
        SignalKind::CompletedInterventions => CountQuery {
            time_column: "executed_at",
            ..tenant_table("exo_interventions", "status = 'completed'")
        },
    }
}

impl CountQuery {
    /// SQL with `$1` = tenant (nullable) and `$2` = window start (nullable).
    fn sql(&self) -> String {
        let tenant = if self.tenant_scoped {
            "($1::uuid IS NULL OR tenant_id = $1)"
        } else {
            "($1::uuid IS NULL OR TRUE)"
        };
        format!(
            "SELECT COUNT(*) FROM {table} WHERE {filter} AND {tenant} AND ($2::timestamptz IS NULL OR {time} >= $2)",
            table = self.table,
            filter = self.filter,
            time = self.time_column,
        )
    }
}

#[derive(Debug, Clone)]
pub struct PostgresSignalReader {
    db: PgBridge,
}

impl PostgresSignalReader {
    pub fn new(db: PgBridge) -> Self {
        Self { db }
    }
}

impl SignalReader for PostgresSignalReader {
    fn count(&self, signal: Signal, tenant_id: Option<TenantId>) -> Result<u64, SignalError> {
        let sql = count_query(signal.kind).sql();
        let since = signal
            .window
            .and_then(|w| chrono::Duration::from_std(w).ok())
            .map(|w| Utc::now() - w);

        let total: i64 = self
            .db
            .run(|pool| async move {
                sqlx::query_scalar(&sql)
                    .bind(tenant_id.map(Uuid::from))
                    .bind(since)
                    .fetch_one(pool)
                    .await
            })
            .map_err(|e| SignalError::Unavailable(format!("{}: {}", signal.kind.as_str(), e)))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    fn activity_class(&self, tenant_id: TenantId) -> Result<Option<ActivityClass>, SignalError> {
        let row = self
            .db
            .run(|pool| async move {
                sqlx::query("SELECT activity_class FROM exo_tenant_loop_config WHERE tenant_id = $1")
                    .bind(Uuid::from(tenant_id))
                    .fetch_optional(pool)
                    .await
            })
            .map_err(|e| SignalError::Unavailable(format!("activity_class: {e}")))?;

        let Some(row) = row else { return Ok(None) };
        let class: Option<String> = row
            .try_get("activity_class")
            .map_err(|e| SignalError::Unavailable(format!("activity_class: {e}")))?;
        Ok(class.as_deref().and_then(ActivityClass::parse))
    }
}
