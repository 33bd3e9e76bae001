use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use conductor_core::DomainError;

use crate::catalog::WorkCategory;

/// Operator-tunable knobs, read fresh at the start of every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub enabled: bool,
    pub min_concurrent: u32,
    pub max_concurrent: u32,
    /// Upper bound on units started by a single cycle.
    ///
    /// This is a per-cycle cap; it equals a per-minute rate only while the
    /// periodic runner is the sole trigger. Extra triggers (`POST
    /// /conductor/run`, a manual runner tick) each start up to this many
    /// more units within the same minute.
    pub max_work_per_minute: u32,
    pub daily_budget_cents: u64,
    /// Overrides for category default weights.
    pub work_priorities: BTreeMap<WorkCategory, u32>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_concurrent: 2,
            max_concurrent: 5,
            max_work_per_minute: 2,
            daily_budget_cents: 100,
            work_priorities: BTreeMap::new(),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.min_concurrent > self.max_concurrent {
            return Err(DomainError::validation(format!(
                "min_concurrent ({}) must not exceed max_concurrent ({})",
                self.min_concurrent, self.max_concurrent
            )));
        }
        Ok(())
    }

    /// Units to start this cycle given `active` running records.
    pub fn deficit(&self, active: u32) -> u32 {
        let below_min = self.min_concurrent.saturating_sub(active);
        let headroom = self.max_concurrent.saturating_sub(active);
        below_min.min(headroom).min(self.max_work_per_minute)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid config value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error(transparent)]
    Invalid(#[from] DomainError),
}

/// Where the engine reads its config from each cycle.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<ConductorConfig, ConfigError>;
}

impl<S> ConfigSource for Arc<S>
where
    S: ConfigSource + ?Sized,
{
    fn load(&self) -> Result<ConductorConfig, ConfigError> {
        (**self).load()
    }
}

/// Fixed config that can be swapped at runtime (tests/dev).
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    config: RwLock<ConductorConfig>,
}

impl StaticConfigSource {
    pub fn new(config: ConductorConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn set(&self, config: ConductorConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<ConductorConfig, ConfigError> {
        let config = self
            .config
            .read()
            .map_err(|_| ConfigError::Unavailable("config lock poisoned".to_string()))?
            .clone();
        config.validate()?;
        Ok(config)
    }
}
