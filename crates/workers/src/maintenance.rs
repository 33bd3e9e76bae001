//! System-wide housekeeping: ETL, data quality, queue draining.

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use conductor_engine::{CostTier, WorkCategory, WorkProfile};

use crate::services::ServiceCall;
use crate::signals::{Signal, SignalKind};
use crate::worker::{CatalogWorker, Eligibility, Report, WorkerDeps, decode};

pub const ETL_CATCHUP: &str = "etl_catchup";
pub const DATA_QUALITY_AUDIT: &str = "data_quality_audit";
pub const LOOP_QUEUE_DRAIN: &str = "loop_queue_drain";

/// Loop handlers the queue drain may dispatch to.
pub const DRAINABLE_HANDLERS: [&str; 4] = ["proactive", "observation", "optimization", "maintenance"];

fn profile(id: &str, max_ms: u64, cooldown: u32) -> WorkProfile {
    WorkProfile::new(id, WorkCategory::SystemMaintenance, CostTier::Free)
        .max_duration_ms(max_ms)
        .cooldown_minutes(cooldown)
}

/// Run the silver ETL when no scheduled ETL has completed for four hours.
pub fn etl_catchup(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(ETL_CATCHUP, 45_000, 120).named("ETL Catch-Up", "Runs the silver ETL if the schedule fell behind");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::Absent(Signal::within_hours(SignalKind::CompletedEtlRuns, 4)),
        |_| Ok(ServiceCall::SilverEtl),
    )
    .report(report_etl)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EtlOutput {
    total_records: u64,
    total_errors: u64,
}

fn report_etl(output: &JsonValue) -> Report {
    let out: EtlOutput = decode(output);
    Report::ok(json!({ "records": out.total_records, "errors": out.total_errors }))
}

pub fn data_quality_audit(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(DATA_QUALITY_AUDIT, 30_000, 720)
        .named("Data Quality Audit", "Checks stored data for gaps and inconsistencies");

    CatalogWorker::new(profile, deps.clone(), Eligibility::Always, |_| {
        Ok(ServiceCall::DataQualityAudit)
    })
}

/// Claim and dispatch one queued loop item.
pub fn loop_queue_drain(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(LOOP_QUEUE_DRAIN, 40_000, 5).named("Loop Queue Drain", "Dispatches one queued loop item");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::total(SignalKind::QueuedLoopItems), 1),
        |ctx| {
            let params: DrainParams = decode(&ctx.params);
            let handlers = if params.handlers.is_empty() {
                DRAINABLE_HANDLERS.iter().map(|h| h.to_string()).collect()
            } else {
                params.handlers
            };
            Ok(ServiceCall::DrainLoopQueue {
                worker_id: ctx.worker_id.clone(),
                handlers,
            })
        },
    )
    .with_params(json!({ "handlers": DRAINABLE_HANDLERS }))
    .report(report_drain)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DrainParams {
    handlers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DrainOutput {
    handler: Option<String>,
}

fn report_drain(output: &JsonValue) -> Report {
    let out: DrainOutput = decode(output);
    match out.handler {
        Some(handler) => Report::ok(json!({ "drained": 1, "handler": handler })),
        // Someone else took the item first.
        None => Report::ok(json!({ "drained": 0 })),
    }
}

#[cfg(test)]
mod tests {
    use conductor_core::TenantId;
    use conductor_engine::WorkCatalogEntry;
    use serde_json::json;

    use super::*;
    use crate::worker::test_support::{ctx, fixture};

    #[test]
    fn etl_catchup_runs_only_when_no_recent_run_completed() {
        let f = fixture();
        let worker = etl_catchup(&f.deps);
        assert!(worker.is_eligible(&ctx(None)).unwrap());

        f.signals.set(SignalKind::CompletedEtlRuns, None, 1);
        assert!(!worker.is_eligible(&ctx(None)).unwrap());
    }

    #[test]
    fn maintenance_work_ignores_tenant_scope() {
        let f = fixture();
        f.signals.set(SignalKind::QueuedLoopItems, None, 2);
        // Per-tenant counts do not make a global worker eligible.
        f.signals.set(SignalKind::QueuedLoopItems, Some(TenantId::new()), 0);
        assert!(loop_queue_drain(&f.deps).is_eligible(&ctx(None)).unwrap());
        assert!(data_quality_audit(&f.deps).is_eligible(&ctx(None)).unwrap());
    }

    #[test]
    fn drain_reports_whether_an_item_was_taken() {
        let f = fixture();
        let worker = loop_queue_drain(&f.deps);

        let empty = worker.execute(&ctx(None)).unwrap();
        assert_eq!(empty.result, Some(json!({"drained": 0})));

        f.services.respond("drain_loop_queue", Ok(json!({"handler": "observation"})));
        let drained = worker.execute(&ctx(None)).unwrap();
        assert!(drained.success);
        assert_eq!(drained.cost_cents, 0);
        assert_eq!(drained.result, Some(json!({"drained": 1, "handler": "observation"})));

        match &f.services.calls()[0] {
            ServiceCall::DrainLoopQueue { handlers, .. } => assert_eq!(handlers.len(), 4),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn drain_claims_carry_the_handler_list() {
        let f = fixture();
        let worker = loop_queue_drain(&f.deps);
        assert_eq!(
            worker.params(None),
            json!({"handlers": ["proactive", "observation", "optimization", "maintenance"]})
        );

        let narrowed = ctx(None).with_params(json!({"handlers": ["observation"]}));
        worker.execute(&narrowed).unwrap();
        match &f.services.calls()[0] {
            ServiceCall::DrainLoopQueue { handlers, .. } => assert_eq!(handlers, &vec!["observation".to_string()]),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn etl_report_renames_totals() {
        let f = fixture();
        f.services
            .respond("silver_etl", Ok(json!({"total_records": 120, "total_errors": 3})));
        let result = etl_catchup(&f.deps).execute(&ctx(None)).unwrap();
        assert_eq!(result.result, Some(json!({"records": 120, "errors": 3})));
    }
}
