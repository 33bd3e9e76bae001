//! Config source over the `conductor_config` key/value table.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use sqlx::Row;

use conductor_engine::{ConductorConfig, ConfigError, ConfigSource};

use super::PgBridge;
use crate::config::parse_priorities;

/// Reads every key on each load; missing keys keep their defaults.
///
/// Keys: `enabled`, `min_concurrent`, `max_concurrent`,
/// `max_conductor_work_per_minute`, `daily_system_budget_cents`,
/// `work_priorities`.
#[derive(Debug, Clone)]
pub struct PostgresConfigSource {
    db: PgBridge,
}

impl PostgresConfigSource {
    pub fn new(db: PgBridge) -> Self {
        Self { db }
    }

    /// Upsert one key (operator tooling, tests).
    pub fn set(&self, key: &str, value: JsonValue) -> Result<(), ConfigError> {
        self.db
            .run(|pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO conductor_config (key, value)
                    VALUES ($1, $2)
                    ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
                    "#,
                )
                .bind(key)
                .bind(&value)
                .execute(pool)
                .await
            })
            .map(|_| ())
            .map_err(|e| ConfigError::Unavailable(format!("failed to write config key {key}: {e}")))
    }
}

impl ConfigSource for PostgresConfigSource {
    fn load(&self) -> Result<ConductorConfig, ConfigError> {
        let rows = self
            .db
            .run(|pool| async move { sqlx::query("SELECT key, value FROM conductor_config").fetch_all(pool).await })
            .map_err(|e| ConfigError::Unavailable(e.to_string()))?;

        let mut values = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key").map_err(|e| ConfigError::Unavailable(e.to_string()))?;
            let value: JsonValue = row.try_get("value").map_err(|e| ConfigError::Unavailable(e.to_string()))?;
            values.insert(key, value);
        }
        from_values(&values)
    }
}

fn from_values(values: &HashMap<String, JsonValue>) -> Result<ConductorConfig, ConfigError> {
    let mut config = ConductorConfig::default();

    if let Some(v) = values.get("enabled") {
        config.enabled = v.as_bool().ok_or_else(|| invalid("enabled", "expected a boolean"))?;
    }
    if let Some(v) = values.get("min_concurrent") {
        config.min_concurrent = number("min_concurrent", v)?;
    }
    if let Some(v) = values.get("max_concurrent") {
        config.max_concurrent = number("max_concurrent", v)?;
    }
    if let Some(v) = values.get("max_conductor_work_per_minute") {
        config.max_work_per_minute = number("max_conductor_work_per_minute", v)?;
    }
    if let Some(v) = values.get("daily_system_budget_cents") {
        config.daily_budget_cents = number("daily_system_budget_cents", v)?;
    }
    if let Some(v) = values.get("work_priorities") {
        config.work_priorities = parse_priorities("work_priorities", v)?;
    }

    config.validate()?;
    Ok(config)
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Numbers may be stored as JSON numbers or numeric strings.
fn number<T: TryFrom<u64>>(key: &str, value: &JsonValue) -> Result<T, ConfigError> {
    let raw = match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    raw.and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| invalid(key, "expected a non-negative integer"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::postgres::test_support::connect;
    use conductor_engine::WorkCategory;

    fn values(pairs: &[(&str, JsonValue)]) -> HashMap<String, JsonValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        assert_eq!(from_values(&HashMap::new()).unwrap(), ConductorConfig::default());
    }

    #[test]
    fn stored_keys_override_defaults() {
        let config = from_values(&values(&[
            ("enabled", json!(false)),
            ("min_concurrent", json!(1)),
            ("max_concurrent", json!("4")),
            ("max_conductor_work_per_minute", json!(3)),
            ("daily_system_budget_cents", json!(500)),
            ("work_priorities", json!({"optimization": 95})),
        ]))
        .unwrap();

        assert!(!config.enabled);
        assert_eq!((config.min_concurrent, config.max_concurrent), (1, 4));
        assert_eq!(config.max_work_per_minute, 3);
        assert_eq!(config.daily_budget_cents, 500);
        assert_eq!(config.work_priorities.get(&WorkCategory::Optimization), Some(&95));
    }

    #[test]
    fn wrong_types_are_rejected() {
        let err = from_values(&values(&[("enabled", json!("sometimes"))])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "enabled"));

        let err = from_values(&values(&[("min_concurrent", json!(-1))])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn round_trips_through_the_table() {
        let Some((_rt, db)) = connect() else { return };
        let source = PostgresConfigSource::new(db);

        source.set("daily_system_budget_cents", json!(321)).unwrap();
        assert_eq!(source.load().unwrap().daily_budget_cents, 321);
    }
}
