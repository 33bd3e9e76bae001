//! Exploratory work with uncertain payoff.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use conductor_engine::{CostTier, WorkCategory, WorkContext, WorkError, WorkProfile};

use crate::services::ServiceCall;
use crate::signals::ActivityClass;
use crate::worker::{CatalogWorker, Eligibility, Report, WorkerDeps, decode};

pub const AUTONOMY_MICRO_CYCLE: &str = "autonomy_micro_cycle";

/// Time kept back from the micro-cycle for reporting.
const MICRO_CYCLE_RESERVE: Duration = Duration::from_secs(5);
const MICRO_CYCLE_MAX: Duration = Duration::from_secs(35);

/// One observe/decide/act pass of the autonomy loop for an active tenant.
pub fn autonomy_micro_cycle(deps: &WorkerDeps) -> CatalogWorker {
    let profile = WorkProfile::new(AUTONOMY_MICRO_CYCLE, WorkCategory::Speculative, CostTier::Cheap)
        .named("Autonomy Micro-Cycle", "Short observe-decide-act pass for an active tenant")
        .estimated_cost(1)
        .max_duration_ms(45_000)
        .cooldown_minutes(30)
        .per_tenant();

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::ActivityIn(vec![ActivityClass::Active, ActivityClass::Normal]),
        micro_cycle_request,
    )
    .billing(1, 1)
    .report(report_micro_cycle)
}

fn micro_cycle_request(ctx: &WorkContext) -> Result<ServiceCall, WorkError> {
    let tenant_id = ctx.require_tenant()?;
    let budget = ctx.remaining().saturating_sub(MICRO_CYCLE_RESERVE).min(MICRO_CYCLE_MAX);
    if budget.is_zero() {
        return Err(WorkError::InvalidContext(
            "not enough time left for a micro-cycle".to_string(),
        ));
    }
    Ok(ServiceCall::AutonomyMicroCycle {
        tenant_id,
        time_budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MicroCycleOutput {
    outcome: String,
    action: Option<String>,
}

fn report_micro_cycle(output: &JsonValue) -> Report {
    let out: MicroCycleOutput = decode(output);
    let summary = json!({ "outcome": out.outcome, "action": out.action });
    if out.outcome == "failed" {
        Report::failed(summary, "micro-cycle reported failure")
    } else {
        Report::ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use conductor_core::{TenantId, WorkerId};
    use conductor_engine::WorkCatalogEntry;
    use serde_json::json;

    use super::*;
    use crate::worker::test_support::{ctx, fixture};

    #[test]
    fn runs_for_active_and_normal_tenants_only() {
        let f = fixture();
        let worker = autonomy_micro_cycle(&f.deps);
        let (active, quiet, unknown) = (TenantId::new(), TenantId::new(), TenantId::new());
        f.signals.set_activity(active, ActivityClass::Active);
        f.signals.set_activity(quiet, ActivityClass::Quiet);

        assert!(worker.is_eligible(&ctx(Some(active))).unwrap());
        assert!(!worker.is_eligible(&ctx(Some(quiet))).unwrap());
        assert!(!worker.is_eligible(&ctx(Some(unknown))).unwrap());
    }

    #[test]
    fn time_budget_keeps_a_reserve_and_is_capped() {
        let tenant = TenantId::new();
        let long = WorkContext::new(WorkerId::generate("t"), Some(tenant), 10, Duration::from_secs(45));
        match micro_cycle_request(&long).unwrap() {
            ServiceCall::AutonomyMicroCycle { time_budget_ms, .. } => assert_eq!(time_budget_ms, 35_000),
            other => panic!("unexpected call {other:?}"),
        }

        let short = WorkContext::new(WorkerId::generate("t"), Some(tenant), 10, Duration::from_secs(20));
        match micro_cycle_request(&short).unwrap() {
            ServiceCall::AutonomyMicroCycle { time_budget_ms, .. } => {
                assert!(time_budget_ms <= 15_000 && time_budget_ms > 14_000)
            }
            other => panic!("unexpected call {other:?}"),
        }

        let exhausted = WorkContext::new(WorkerId::generate("t"), Some(tenant), 10, Duration::from_secs(4));
        assert!(micro_cycle_request(&exhausted).is_err());
    }

    #[test]
    fn failed_outcome_still_bills_the_model_call() {
        let f = fixture();
        f.services
            .respond("autonomy_micro_cycle", Ok(json!({"outcome": "failed", "action": null})));

        let result = autonomy_micro_cycle(&f.deps).execute(&ctx(Some(TenantId::new()))).unwrap();
        assert!(!result.success);
        assert_eq!(result.cost_cents, 1);
    }

    proptest::proptest! {
        #[test]
        fn time_budget_never_exceeds_cap_or_remaining(secs in 0u64..120) {
            let remaining = Duration::from_secs(secs);
            let ctx = WorkContext::new(WorkerId::generate("t"), Some(TenantId::new()), 10, remaining);
            match micro_cycle_request(&ctx) {
                Ok(ServiceCall::AutonomyMicroCycle { time_budget_ms, .. }) => {
                    proptest::prop_assert!(time_budget_ms <= 35_000);
                    proptest::prop_assert!(Duration::from_millis(time_budget_ms) + MICRO_CYCLE_RESERVE <= remaining);
                }
                Ok(other) => proptest::prop_assert!(false, "unexpected call {:?}", other),
                Err(_) => proptest::prop_assert!(secs <= 5),
            }
        }
    }
}
