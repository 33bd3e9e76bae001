//! Infrastructure layer: Postgres adapters, environment config, the HTTP
//! work-services client and the periodic runner.

pub mod config;
pub mod postgres;
pub mod runner;
pub mod services;

pub use config::EnvConfigSource;
pub use postgres::{
    PgBridge, PostgresConfigSource, PostgresProcessRegistry, PostgresSignalReader, PostgresTenantSource,
    ensure_schema,
};
pub use runner::{ConductorRunner, ConductorRunnerHandle, LastCycle};
pub use services::HttpWorkServices;
