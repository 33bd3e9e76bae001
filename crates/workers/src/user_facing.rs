//! Work that directly benefits a user right now.

use serde::Deserialize;
use serde_json::json;

use conductor_engine::{CostTier, WorkCategory, WorkContext, WorkError, WorkProfile};

use crate::services::ServiceCall;
use crate::signals::{Signal, SignalKind};
use crate::worker::{CatalogWorker, Eligibility, Report, WorkerDeps, decode};

pub const PROACTIVE_MESSAGE_CHECK: &str = "proactive_message_check";
pub const PENDING_ASYNC_TASK: &str = "pending_async_task";

/// Deliver pending interventions, overdue-task nudges and insights.
pub fn proactive_message_check(deps: &WorkerDeps) -> CatalogWorker {
    let profile = WorkProfile::new(PROACTIVE_MESSAGE_CHECK, WorkCategory::UserFacing, CostTier::Free)
        .named(
            "Proactive Message Check",
            "Sends due interventions, overdue-task nudges and undelivered insights",
        )
        .max_duration_ms(15_000)
        .cooldown_minutes(5)
        .per_tenant();

    let pending = vec![
        Signal::total(SignalKind::PendingInterventions),
        Signal::total(SignalKind::OverdueTasks),
        Signal::total(SignalKind::UndeliveredInsights),
    ];

    CatalogWorker::new(profile, deps.clone(), Eligibility::AnyPending(pending), |ctx| {
        Ok(ServiceCall::ProactiveCheck {
            tenant_id: ctx.require_tenant()?,
        })
    })
    .report(report_proactive)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProactiveOutput {
    messages_sent: u32,
    interventions_delivered: u32,
}

fn report_proactive(output: &serde_json::Value) -> Report {
    let out: ProactiveOutput = decode(output);
    Report::ok(json!({
        "messages_sent": out.messages_sent,
        "interventions_delivered": out.interventions_delivered,
    }))
}

/// Pick up one queued (or failed, awaiting retry) async task.
pub fn pending_async_task(deps: &WorkerDeps) -> CatalogWorker {
    let profile = WorkProfile::new(PENDING_ASYNC_TASK, WorkCategory::UserFacing, CostTier::Moderate)
        .named("Process Async Task", "Runs one queued user request in the background")
        .estimated_cost(3)
        .max_duration_ms(50_000);

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::total(SignalKind::QueuedAsyncTasks), 1),
        async_task_request,
    )
    .report(report_async_task)
}

fn async_task_request(ctx: &WorkContext) -> Result<ServiceCall, WorkError> {
    Ok(ServiceCall::ProcessAsyncTask {
        worker_id: ctx.worker_id.clone(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AsyncTaskOutput {
    task_id: Option<String>,
    status: Option<String>,
    error: Option<String>,
}

fn report_async_task(output: &serde_json::Value) -> Report {
    let out: AsyncTaskOutput = decode(output);
    let summary = json!({ "task_id": out.task_id, "status": out.status });
    match out.status.as_deref() {
        Some("failed") => Report::failed(summary, out.error.unwrap_or_else(|| "async task failed".to_string())),
        _ => Report::ok(summary),
    }
}
