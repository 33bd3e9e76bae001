//! Postgres adapters for the conductor ports.
//!
//! The engine's ports are synchronous and are called from plain threads (the
//! periodic runner, the work pool, `spawn_blocking` in the API). Each adapter
//! keeps the pool together with a [`tokio::runtime::Handle`] and drives its
//! queries with `Handle::block_on`, so it never needs an ambient runtime.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RegistryError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation) | `23505` | `Storage` | Raced insert outside the claim path |
//! | Database (check violation) | `23514` | `InvalidCompletion` | Negative cost or unknown status |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` | Database not reachable |
//! | Other | N/A | `Storage` | Decoding errors etc. |

use std::future::Future;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::runtime::Handle;

use conductor_engine::RegistryError;

pub mod config;
pub mod registry;
pub mod signals;
pub mod tenants;

pub use config::PostgresConfigSource;
pub use registry::PostgresProcessRegistry;
pub use signals::PostgresSignalReader;
pub use tenants::PostgresTenantSource;

/// Tables owned by the conductor.
///
/// The partial unique index is the claim primitive: at most one running
/// conductor record per `(work_catalog_id, tenant_id)`, with tenant-less work
/// keyed on the nil uuid.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS conductor_processes (
        id uuid PRIMARY KEY,
        process_type text NOT NULL,
        process_name text NOT NULL,
        worker_id text NOT NULL,
        tenant_id uuid,
        work_catalog_id text,
        params jsonb NOT NULL DEFAULT 'null'::jsonb,
        ttl_seconds integer NOT NULL CHECK (ttl_seconds > 0),
        started_at timestamptz NOT NULL DEFAULT now(),
        last_heartbeat_at timestamptz,
        status text NOT NULL DEFAULT 'running'
            CHECK (status IN ('running', 'completed', 'failed', 'expired')),
        cost_cents integer NOT NULL DEFAULT 0 CHECK (cost_cents >= 0),
        result jsonb,
        error text,
        completed_at timestamptz
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS conductor_processes_running_slot
        ON conductor_processes (
            work_catalog_id,
            COALESCE(tenant_id, '00000000-0000-0000-0000-000000000000'::uuid)
        )
        WHERE status = 'running' AND process_type = 'conductor_work'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS conductor_processes_running
        ON conductor_processes (started_at)
        WHERE status = 'running'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS conductor_processes_completions
        ON conductor_processes (work_catalog_id, tenant_id, completed_at DESC)
        WHERE status IN ('completed', 'failed')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conductor_config (
        key text PRIMARY KEY,
        value jsonb NOT NULL,
        updated_at timestamptz NOT NULL DEFAULT now()
    )
    "#,
];

/// Create the conductor tables and indexes if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Pool plus the runtime that drives it.
#[derive(Debug, Clone)]
pub struct PgBridge {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PgBridge {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `f` against the pool to completion on the stored runtime.
    ///
    /// Must not be called from inside an async task.
    pub(crate) fn run<'a, F, Fut, T>(&'a self, f: F) -> T
    where
        F: FnOnce(&'a PgPool) -> Fut,
        Fut: Future<Output = T>,
    {
        self.runtime.block_on(f(&self.pool))
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RegistryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => RegistryError::InvalidCompletion(msg),
                _ => RegistryError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            RegistryError::Unavailable(format!("{} in {}", err, operation))
        }
        _ => RegistryError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}
