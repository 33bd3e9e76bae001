//! Work catalog: the static table of work the conductor can start.
//!
//! Each entry couples a cost/priority profile with eligibility and execution
//! logic. The catalog is built once at startup and never mutated.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use conductor_core::TenantId;

use crate::context::{WorkContext, WorkError, WorkResult};

/// Category of work; the numeric weight is the default priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkCategory {
    UserFacing,
    Intelligence,
    #[serde(rename = "systemMaintenance", alias = "sysMaint")]
    SystemMaintenance,
    Optimization,
    Speculative,
}

impl WorkCategory {
    pub const ALL: [WorkCategory; 5] = [
        WorkCategory::UserFacing,
        WorkCategory::Intelligence,
        WorkCategory::SystemMaintenance,
        WorkCategory::Optimization,
        WorkCategory::Speculative,
    ];

    pub fn default_weight(&self) -> u32 {
        match self {
            WorkCategory::UserFacing => 100,
            WorkCategory::Intelligence => 80,
            WorkCategory::SystemMaintenance => 50,
            WorkCategory::Optimization => 30,
            WorkCategory::Speculative => 10,
        }
    }
}

/// Cost tier; only `Free` work runs once the daily budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Free,
    Cheap,
    Moderate,
    Expensive,
}

/// Static cost, priority and scheduling metadata of a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: WorkCategory,
    pub cost_tier: CostTier,
    pub estimated_cost_cents: u32,
    pub max_duration_ms: u64,
    pub cooldown_minutes: u32,
    pub per_tenant: bool,
}

impl WorkProfile {
    pub fn new(id: impl Into<String>, category: WorkCategory, cost_tier: CostTier) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            category,
            cost_tier,
            estimated_cost_cents: 0,
            max_duration_ms: 30_000,
            cooldown_minutes: 0,
            per_tenant: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.name = name.into();
        self.description = description.into();
        self
    }

    pub fn estimated_cost(mut self, cents: u32) -> Self {
        self.estimated_cost_cents = cents;
        self
    }

    pub fn max_duration_ms(mut self, ms: u64) -> Self {
        self.max_duration_ms = ms;
        self
    }

    pub fn cooldown_minutes(mut self, minutes: u32) -> Self {
        self.cooldown_minutes = minutes;
        self
    }

    pub fn per_tenant(mut self) -> Self {
        self.per_tenant = true;
        self
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(u64::from(self.cooldown_minutes) * 60)
    }

    pub fn is_free(&self) -> bool {
        self.cost_tier == CostTier::Free
    }

    /// Priority weight after applying `overrides` to the category default.
    pub fn effective_weight(&self, overrides: &BTreeMap<WorkCategory, u32>) -> u32 {
        overrides
            .get(&self.category)
            .copied()
            .unwrap_or_else(|| self.category.default_weight())
    }
}

/// One unit of catalog work: profile plus eligibility/execution logic.
pub trait WorkCatalogEntry: Send + Sync + 'static {
    fn profile(&self) -> &WorkProfile;

    /// Cheap check (typically a few counts) whether running now is useful.
    fn is_eligible(&self, ctx: &WorkContext) -> Result<bool, WorkError>;

    /// Perform the work. Must tolerate being re-run after a crash mid-way.
    fn execute(&self, ctx: &WorkContext) -> Result<WorkResult, WorkError>;

    /// Parameters stored on the claimed record and handed to `execute`.
    fn params(&self, _tenant_id: Option<TenantId>) -> JsonValue {
        JsonValue::Null
    }

    fn id(&self) -> &str {
        &self.profile().id
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate catalog entry id: {0}")]
    DuplicateId(String),

    #[error("invalid catalog entry {id}: {reason}")]
    InvalidEntry { id: String, reason: String },
}

/// Immutable registration table of catalog entries.
#[derive(Clone, Default)]
pub struct WorkCatalog {
    entries: Vec<Arc<dyn WorkCatalogEntry>>,
}

impl std::fmt::Debug for WorkCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|e| e.id())).finish()
    }
}

impl WorkCatalog {
    pub fn new(entries: Vec<Arc<dyn WorkCatalogEntry>>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            let profile = entry.profile();
            if profile.id.trim().is_empty() {
                return Err(CatalogError::InvalidEntry {
                    id: profile.id.clone(),
                    reason: "id must not be empty".to_string(),
                });
            }
            if profile.max_duration_ms == 0 {
                return Err(CatalogError::InvalidEntry {
                    id: profile.id.clone(),
                    reason: "max_duration_ms must be > 0".to_string(),
                });
            }
            if !seen.insert(profile.id.clone()) {
                return Err(CatalogError::DuplicateId(profile.id.clone()));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn WorkCatalogEntry>> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn entries(&self) -> &[Arc<dyn WorkCatalogEntry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by effective weight (descending), then estimated cost
    /// (ascending). The sort is stable, so registration order breaks
    /// remaining ties.
    pub fn sorted_by_priority(&self, overrides: &BTreeMap<WorkCategory, u32>) -> Vec<Arc<dyn WorkCatalogEntry>> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| {
            let (a, b) = (a.profile(), b.profile());
            b.effective_weight(overrides)
                .cmp(&a.effective_weight(overrides))
                .then(a.estimated_cost_cents.cmp(&b.estimated_cost_cents))
        });
        sorted
    }
}


#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::test_support::FakeEntry;
    use super::*;

    fn entry(id: &str, category: WorkCategory, cost: u32) -> Arc<dyn WorkCatalogEntry> {
        let tier = if cost == 0 { CostTier::Free } else { CostTier::Cheap };
        FakeEntry::new(WorkProfile::new(id, category, tier).estimated_cost(cost)).arc()
    }

    fn ids(entries: &[Arc<dyn WorkCatalogEntry>]) -> Vec<&str> {
        entries.iter().map(|e| e.id()).collect()
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = WorkCatalog::new(vec![
            entry("a", WorkCategory::UserFacing, 0),
            entry("a", WorkCategory::Speculative, 1),
        ])
        .unwrap_err();
        assert_eq!(err, CatalogError::DuplicateId("a".to_string()));
    }

    #[test]
    fn zero_duration_entries_are_rejected() {
        let bad = FakeEntry::new(WorkProfile::new("a", WorkCategory::UserFacing, CostTier::Free).max_duration_ms(0));
        assert!(matches!(
            WorkCatalog::new(vec![bad.arc()]),
            Err(CatalogError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn priority_orders_by_weight_then_cost() {
        let catalog = WorkCatalog::new(vec![
            entry("speculate", WorkCategory::Speculative, 1),
            entry("insight_pricey", WorkCategory::Intelligence, 3),
            entry("insight_cheap", WorkCategory::Intelligence, 1),
            entry("message", WorkCategory::UserFacing, 0),
            entry("audit", WorkCategory::SystemMaintenance, 0),
        ])
        .unwrap();

        let sorted = catalog.sorted_by_priority(&BTreeMap::new());
        assert_eq!(
            ids(&sorted),
            vec!["message", "insight_cheap", "insight_pricey", "audit", "speculate"]
        );
    }

    #[test]
    fn overrides_replace_category_defaults() {
        let catalog = WorkCatalog::new(vec![
            entry("message", WorkCategory::UserFacing, 0),
            entry("speculate", WorkCategory::Speculative, 1),
        ])
        .unwrap();

        let overrides = BTreeMap::from([(WorkCategory::Speculative, 200)]);
        assert_eq!(ids(&catalog.sorted_by_priority(&overrides)), vec!["speculate", "message"]);
    }

    #[test]
    fn category_names_accept_short_maintenance_alias() {
        let parsed: WorkCategory = serde_json::from_str("\"sysMaint\"").unwrap();
        assert_eq!(parsed, WorkCategory::SystemMaintenance);
        assert_eq!(serde_json::to_string(&WorkCategory::UserFacing).unwrap(), "\"userFacing\"");
    }

    fn arb_category() -> impl Strategy<Value = WorkCategory> {
        prop::sample::select(WorkCategory::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn sorted_catalog_is_non_increasing_in_weight(
            specs in prop::collection::vec((arb_category(), 0u32..5), 1..20),
            boost in prop::option::of((arb_category(), 0u32..300)),
        ) {
            let entries = specs
                .iter()
                .enumerate()
                .map(|(i, (category, cost))| entry(&format!("e{i}"), *category, *cost))
                .collect();
            let catalog = WorkCatalog::new(entries).unwrap();
            let overrides: BTreeMap<_, _> = boost.into_iter().collect();

            let sorted = catalog.sorted_by_priority(&overrides);
            prop_assert_eq!(sorted.len(), catalog.len());

            for pair in sorted.windows(2) {
                let (a, b) = (pair[0].profile(), pair[1].profile());
                let (wa, wb) = (a.effective_weight(&overrides), b.effective_weight(&overrides));
                prop_assert!(wa >= wb);
                if wa == wb {
                    prop_assert!(a.estimated_cost_cents <= b.estimated_cost_cents);
                }
            }
        }
    }
}
