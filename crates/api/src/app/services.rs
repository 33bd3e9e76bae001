use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;
use tracing::{info, warn};

use conductor_core::TenantId;
use conductor_engine::{
    CatalogError, Conductor, ConductorEngine, ConfigSource, InMemoryProcessRegistry, ProcessRegistry,
    StaticConfigSource, StaticTenantSource,
};
use conductor_infra::{
    EnvConfigSource, HttpWorkServices, LastCycle, PgBridge, PostgresConfigSource, PostgresProcessRegistry,
    PostgresSignalReader, PostgresTenantSource, ensure_schema,
};
use conductor_workers::{InMemorySignalReader, StaticWorkServices, WorkServices, WorkerDeps, standard_catalog};

/// Everything the handlers need.
pub struct AppServices {
    pub conductor: Arc<dyn Conductor>,
    pub registry: Arc<dyn ProcessRegistry>,
    pub last_cycle: LastCycle,
}

impl AppServices {
    pub fn new(conductor: Arc<dyn Conductor>, registry: Arc<dyn ProcessRegistry>) -> Self {
        Self {
            conductor,
            registry,
            last_cycle: LastCycle::new(),
        }
    }

    /// Engine over in-memory adapters (dev mode and tests).
    pub fn in_memory(parts: &InMemoryParts) -> Result<Self, CatalogError> {
        let deps = WorkerDeps::new(parts.signals.clone(), parts.services.clone());
        let engine = ConductorEngine::new(
            parts.registry.clone(),
            StaticTenantSource::new(parts.tenants.clone()),
            parts.config.clone(),
            standard_catalog(&deps)?,
        );
        Ok(Self::new(Arc::new(engine), parts.registry.clone()))
    }

    /// Engine over Postgres; work services over HTTP when configured.
    ///
    /// Must be called from inside the runtime that will drive the pool.
    pub async fn postgres(settings: &ApiSettings, database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_db_connections)
            .connect(database_url)
            .await
            .context("failed to connect to DATABASE_URL")?;
        ensure_schema(&pool).await.context("failed to create conductor schema")?;

        let db = PgBridge::new(pool, Handle::current());
        let registry = Arc::new(PostgresProcessRegistry::new(db.clone()));
        let deps = WorkerDeps::new(
            Arc::new(PostgresSignalReader::new(db.clone())),
            work_services(settings),
        );
        let engine = ConductorEngine::new(
            registry.clone(),
            PostgresTenantSource::new(db.clone()),
            PostgresConfigSource::new(db),
            standard_catalog(&deps)?,
        );
        Ok(Self::new(Arc::new(engine), registry))
    }
}

/// In-memory adapters, kept by the caller to seed and inspect state.
#[derive(Clone)]
pub struct InMemoryParts {
    pub registry: Arc<InMemoryProcessRegistry>,
    pub signals: Arc<InMemorySignalReader>,
    pub services: Arc<StaticWorkServices>,
    pub config: Arc<dyn ConfigSource>,
    pub tenants: Vec<TenantId>,
}

impl Default for InMemoryParts {
    fn default() -> Self {
        Self {
            registry: InMemoryProcessRegistry::arc(),
            signals: Arc::new(InMemorySignalReader::new()),
            services: Arc::new(StaticWorkServices::new()),
            config: Arc::new(StaticConfigSource::default()),
            tenants: Vec::new(),
        }
    }
}

fn work_services(settings: &ApiSettings) -> Arc<dyn WorkServices> {
    match &settings.work_services_url {
        Some(url) => {
            let mut client = HttpWorkServices::new(url.clone(), Handle::current());
            if let Some(token) = &settings.work_services_token {
                client = client.with_token(token.clone());
            }
            Arc::new(client)
        }
        None => {
            warn!("WORK_SERVICES_URL not set; work services answer with empty results");
            Arc::new(StaticWorkServices::new())
        }
    }
}

/// Pick the backend from `settings` (public entrypoint used by `main.rs`).
pub async fn build_services(settings: &ApiSettings) -> anyhow::Result<AppServices> {
    match &settings.database_url {
        Some(url) => {
            info!("using postgres-backed conductor");
            AppServices::postgres(settings, url).await
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory registry (state is lost on restart)");
            let parts = InMemoryParts {
                config: Arc::new(EnvConfigSource::new()),
                tenants: settings.tenants.clone(),
                ..InMemoryParts::default()
            };
            Ok(AppServices::in_memory(&parts)?)
        }
    }
}

/// Process settings read once at startup.
///
/// | variable | default |
/// |---|---|
/// | `BIND_ADDR` | `0.0.0.0:8080` |
/// | `DATABASE_URL` | unset: in-memory registry |
/// | `DATABASE_MAX_CONNECTIONS` | `10` |
/// | `CONDUCTOR_TICK_SECS` | `60`; `0` disables the periodic runner |
/// | `CONDUCTOR_TENANTS` | comma-separated ids, in-memory mode only |
/// | `WORK_SERVICES_URL` | unset: empty results |
/// | `WORK_SERVICES_TOKEN` | unset |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub max_db_connections: u32,
    pub tick_interval: Option<Duration>,
    pub tenants: Vec<TenantId>,
    pub work_services_url: Option<String>,
    pub work_services_token: Option<String>,
}

impl ApiSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_db_connections = match var("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw.parse().with_context(|| format!("DATABASE_MAX_CONNECTIONS={raw}"))?,
            None => 10,
        };

        let tick_secs: u64 = match var("CONDUCTOR_TICK_SECS") {
            Some(raw) => raw.parse().with_context(|| format!("CONDUCTOR_TICK_SECS={raw}"))?,
            None => 60,
        };

        let tenants = match var("CONDUCTOR_TENANTS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<TenantId>().with_context(|| format!("invalid tenant id in CONDUCTOR_TENANTS: {s}")))
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: var("DATABASE_URL"),
            max_db_connections,
            tick_interval: (tick_secs > 0).then(|| Duration::from_secs(tick_secs)),
            tenants,
            work_services_url: var("WORK_SERVICES_URL"),
            work_services_token: var("WORK_SERVICES_TOKEN"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> anyhow::Result<ApiSettings> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ApiSettings::from_lookup(move |key| env.get(key).cloned())
    }

    #[test]
    fn defaults_run_in_memory_every_minute() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.bind_addr, "0.0.0.0:8080");
        assert_eq!(s.database_url, None);
        assert_eq!(s.tick_interval, Some(Duration::from_secs(60)));
        assert!(s.tenants.is_empty());
    }

    #[test]
    fn zero_tick_disables_the_runner() {
        let s = settings(&[("CONDUCTOR_TICK_SECS", "0")]).unwrap();
        assert_eq!(s.tick_interval, None);
    }

    #[test]
    fn tenants_are_parsed_from_a_comma_list() {
        let a = TenantId::new();
        let b = TenantId::new();
        let s = settings(&[("CONDUCTOR_TENANTS", &format!("{a}, {b},"))]).unwrap();
        assert_eq!(s.tenants, vec![a, b]);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(settings(&[("CONDUCTOR_TICK_SECS", "soon")]).is_err());
        assert!(settings(&[("CONDUCTOR_TENANTS", "not-a-uuid")]).is_err());
    }

    #[test]
    fn in_memory_services_wire_the_standard_catalog() {
        let parts = InMemoryParts::default();
        let services = AppServices::in_memory(&parts).unwrap();
        assert!(services.last_cycle.get().is_none());
        assert_eq!(services.registry.count_active().unwrap().total, 0);
    }
}
