//! Config sources backed by the process environment.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use conductor_engine::{ConductorConfig, ConfigError, ConfigSource, WorkCategory};

type Lookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Reads `CONDUCTOR_*` variables on every load; unset variables keep their
/// defaults.
///
/// | variable | field |
/// |---|---|
/// | `CONDUCTOR_ENABLED` | `enabled` |
/// | `CONDUCTOR_MIN_CONCURRENT` | `min_concurrent` |
/// | `CONDUCTOR_MAX_CONCURRENT` | `max_concurrent` |
/// | `CONDUCTOR_MAX_WORK_PER_MINUTE` | `max_work_per_minute` |
/// | `CONDUCTOR_DAILY_BUDGET_CENTS` | `daily_budget_cents` |
/// | `CONDUCTOR_WORK_PRIORITIES` | `work_priorities` (JSON object) |
#[derive(Clone)]
pub struct EnvConfigSource {
    lookup: Arc<Lookup>,
}

impl EnvConfigSource {
    pub fn new() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn var(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }
}

impl Default for EnvConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EnvConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvConfigSource").finish_non_exhaustive()
    }
}

impl ConfigSource for EnvConfigSource {
    fn load(&self) -> Result<ConductorConfig, ConfigError> {
        let mut config = ConductorConfig::default();

        if let Some(v) = self.var("CONDUCTOR_ENABLED") {
            config.enabled = parse_bool("CONDUCTOR_ENABLED", &v)?;
        }
        if let Some(v) = self.var("CONDUCTOR_MIN_CONCURRENT") {
            config.min_concurrent = parse_number("CONDUCTOR_MIN_CONCURRENT", &v)?;
        }
        if let Some(v) = self.var("CONDUCTOR_MAX_CONCURRENT") {
            config.max_concurrent = parse_number("CONDUCTOR_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = self.var("CONDUCTOR_MAX_WORK_PER_MINUTE") {
            config.max_work_per_minute = parse_number("CONDUCTOR_MAX_WORK_PER_MINUTE", &v)?;
        }
        if let Some(v) = self.var("CONDUCTOR_DAILY_BUDGET_CENTS") {
            config.daily_budget_cents = parse_number("CONDUCTOR_DAILY_BUDGET_CENTS", &v)?;
        }
        if let Some(v) = self.var("CONDUCTOR_WORK_PRIORITIES") {
            let value: JsonValue = serde_json::from_str(&v).map_err(|e| invalid("CONDUCTOR_WORK_PRIORITIES", e))?;
            config.work_priorities = parse_priorities("CONDUCTOR_WORK_PRIORITIES", &value)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn invalid(key: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(invalid(key, format!("expected a boolean, got '{other}'"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| invalid(key, e))
}

/// Category weight overrides from a JSON object.
///
/// Keys may be camelCase (`userFacing`) or snake_case (`user_facing`).
pub(crate) fn parse_priorities(key: &str, value: &JsonValue) -> Result<BTreeMap<WorkCategory, u32>, ConfigError> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid(key, "expected a JSON object"))?;

    let mut priorities = BTreeMap::new();
    for (name, weight) in object {
        let category: WorkCategory = serde_json::from_value(JsonValue::String(camel_case(name)))
            .map_err(|_| invalid(key, format!("unknown work category '{name}'")))?;
        let weight = weight
            .as_u64()
            .and_then(|w| u32::try_from(w).ok())
            .ok_or_else(|| invalid(key, format!("weight for '{name}' must be a non-negative integer")))?;
        priorities.insert(category, weight);
    }
    Ok(priorities)
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn source(vars: &[(&str, &str)]) -> EnvConfigSource {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EnvConfigSource::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn unset_variables_keep_defaults() {
        assert_eq!(source(&[]).load().unwrap(), ConductorConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = source(&[
            ("CONDUCTOR_ENABLED", "false"),
            ("CONDUCTOR_MIN_CONCURRENT", "3"),
            ("CONDUCTOR_MAX_CONCURRENT", "8"),
            ("CONDUCTOR_MAX_WORK_PER_MINUTE", "4"),
            ("CONDUCTOR_DAILY_BUDGET_CENTS", "250"),
            ("CONDUCTOR_WORK_PRIORITIES", r#"{"speculative": 90, "system_maintenance": 5}"#),
        ])
        .load()
        .unwrap();

        assert!(!config.enabled);
        assert_eq!((config.min_concurrent, config.max_concurrent), (3, 8));
        assert_eq!(config.max_work_per_minute, 4);
        assert_eq!(config.daily_budget_cents, 250);
        assert_eq!(config.work_priorities.get(&WorkCategory::Speculative), Some(&90));
        assert_eq!(config.work_priorities.get(&WorkCategory::SystemMaintenance), Some(&5));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = source(&[("CONDUCTOR_MIN_CONCURRENT", "two")]).load().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CONDUCTOR_MIN_CONCURRENT"));

        let err = source(&[("CONDUCTOR_WORK_PRIORITIES", r#"{"chores": 1}"#)]).load().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn inconsistent_bounds_are_rejected() {
        let err = source(&[("CONDUCTOR_MIN_CONCURRENT", "6"), ("CONDUCTOR_MAX_CONCURRENT", "2")])
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn category_keys_accept_both_spellings() {
        assert_eq!(camel_case("user_facing"), "userFacing");
        assert_eq!(camel_case("userFacing"), "userFacing");
        let parsed = parse_priorities("k", &serde_json::json!({"userFacing": 1, "user_facing": 2})).unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
