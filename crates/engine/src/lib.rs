//! `conductor-engine`
//!
//! **Responsibility:** the control loop that keeps a target number of
//! catalog-defined background jobs running across tenants.
//!
//! - The process registry is the only source of truth for what is running.
//! - Claims are atomic per `(work_catalog_id, tenant_id)`; a lost claim is a
//!   normal outcome, not an error.
//! - Worker failures, panics and timeouts are recorded, never propagated.

pub mod catalog;
pub mod config;
pub mod context;
pub mod cycle;
pub mod engine;
pub mod execution;
pub mod process;
pub mod registry;
pub mod tenants;

pub use catalog::{CatalogError, CostTier, WorkCatalog, WorkCatalogEntry, WorkCategory, WorkProfile};
pub use config::{ConductorConfig, ConfigError, ConfigSource, StaticConfigSource};
pub use context::{WorkContext, WorkError, WorkResult};
pub use cycle::{ConductorCycleResult, SkipReason, SpawnedWork};
pub use engine::{Conductor, ConductorEngine, EngineOptions};
pub use execution::{ExecutionOutcome, LateHandler, WorkPool};
pub use process::{
    ActiveProcessCounts, ClaimRequest, Completion, DEFAULT_TTL_SECONDS, ProcessRecord, ProcessStatus, ProcessType,
    Registration,
};
pub use registry::{InMemoryProcessRegistry, ProcessRegistry, RegistryError};
pub use tenants::{StaticTenantSource, TenantPage, TenantSource, TenantSourceError};
