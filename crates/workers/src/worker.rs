//! The shape every standard worker shares: an eligibility rule over signals,
//! one service call, and a report that turns the service output into a
//! result summary.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::warn;

use conductor_core::TenantId;
use conductor_engine::{WorkCatalogEntry, WorkContext, WorkError, WorkProfile, WorkResult};

use crate::services::{ServiceCall, WorkServices};
use crate::signals::{ActivityClass, Signal, SignalReader};

/// Ports shared by every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub signals: Arc<dyn SignalReader>,
    pub services: Arc<dyn WorkServices>,
}

impl WorkerDeps {
    pub fn new(signals: Arc<dyn SignalReader>, services: Arc<dyn WorkServices>) -> Self {
        Self { signals, services }
    }
}

/// When a worker is worth running.
#[derive(Debug, Clone, PartialEq)]
pub enum Eligibility {
    Always,
    AtLeast(Signal, u64),
    /// Any of the signals is non-zero.
    AnyPending(Vec<Signal>),
    /// The signal is zero (nothing recent happened).
    Absent(Signal),
    ActivityIn(Vec<ActivityClass>),
}

/// Cents billed depending on how the service call went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Billing {
    pub on_success: u32,
    pub on_failure: u32,
}

/// What a report made of the service output.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub success: bool,
    pub summary: JsonValue,
    pub error: Option<String>,
}

impl Report {
    pub fn ok(summary: JsonValue) -> Self {
        Self {
            success: true,
            summary,
            error: None,
        }
    }

    pub fn failed(summary: JsonValue, error: impl Into<String>) -> Self {
        Self {
            success: false,
            summary,
            error: Some(error.into()),
        }
    }
}

pub type RequestFn = fn(&WorkContext) -> Result<ServiceCall, WorkError>;
pub type ReportFn = fn(&JsonValue) -> Report;

/// Data-driven catalog entry.
pub struct CatalogWorker {
    profile: WorkProfile,
    eligibility: Eligibility,
    billing: Billing,
    request: RequestFn,
    report: ReportFn,
    params: JsonValue,
    deps: WorkerDeps,
}

impl CatalogWorker {
    /// Bills the estimated cost on success and nothing on failure unless
    /// overridden with [`CatalogWorker::billing`].
    pub fn new(profile: WorkProfile, deps: WorkerDeps, eligibility: Eligibility, request: RequestFn) -> Self {
        let billing = Billing {
            on_success: profile.estimated_cost_cents,
            on_failure: 0,
        };
        Self {
            profile,
            eligibility,
            billing,
            request,
            report: |output| Report::ok(output.clone()),
            params: JsonValue::Null,
            deps,
        }
    }

    pub fn billing(mut self, on_success: u32, on_failure: u32) -> Self {
        self.billing = Billing { on_success, on_failure };
        self
    }

    pub fn report(mut self, report: ReportFn) -> Self {
        self.report = report;
        self
    }

    /// Stored on every claimed record and readable as `ctx.params`.
    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }

    pub fn eligibility(&self) -> &Eligibility {
        &self.eligibility
    }

    pub fn into_entry(self) -> Arc<dyn WorkCatalogEntry> {
        Arc::new(self)
    }

    fn scope(&self, ctx: &WorkContext) -> Result<Option<TenantId>, WorkError> {
        if self.profile.per_tenant {
            ctx.require_tenant().map(Some)
        } else {
            Ok(None)
        }
    }
}

impl WorkCatalogEntry for CatalogWorker {
    fn profile(&self) -> &WorkProfile {
        &self.profile
    }

    fn is_eligible(&self, ctx: &WorkContext) -> Result<bool, WorkError> {
        let tenant_id = self.scope(ctx)?;
        let signals = &self.deps.signals;

        let eligible = match &self.eligibility {
            Eligibility::Always => true,
            Eligibility::AtLeast(signal, min) => signals.count(*signal, tenant_id)? >= *min,
            Eligibility::AnyPending(pending) => {
                let mut any = false;
                for signal in pending {
                    if signals.count(*signal, tenant_id)? > 0 {
                        any = true;
                        break;
                    }
                }
                any
            }
            Eligibility::Absent(signal) => signals.count(*signal, tenant_id)? == 0,
            Eligibility::ActivityIn(classes) => signals
                .activity_class(ctx.require_tenant()?)?
                .is_some_and(|class| classes.contains(&class)),
        };
        Ok(eligible)
    }

    fn params(&self, _tenant_id: Option<TenantId>) -> JsonValue {
        self.params.clone()
    }

    fn execute(&self, ctx: &WorkContext) -> Result<WorkResult, WorkError> {
        self.scope(ctx)?;
        let call = (self.request)(ctx)?;

        match self.deps.services.invoke(&call, ctx.remaining()) {
            Ok(output) => {
                let report = (self.report)(&output);
                let billed = if report.success {
                    self.billing.on_success
                } else {
                    self.billing.on_failure
                };
                let cost = reported_cost(&output).unwrap_or(billed);
                let result = if report.success {
                    WorkResult::succeeded(cost)
                } else {
                    WorkResult::failed(cost, report.error.unwrap_or_else(|| "work reported failure".to_string()))
                };
                Ok(result.with_result(report.summary))
            }
            Err(e) => {
                warn!(work_id = %self.profile.id, call = call.name(), error = %e, "work service call failed");
                Ok(WorkResult::failed(self.billing.on_failure, e.to_string()))
            }
        }
    }
}

/// `cost_cents` reported by the service itself, if any.
fn reported_cost(output: &JsonValue) -> Option<u32> {
    output
        .get("cost_cents")
        .and_then(JsonValue::as_u64)
        .map(|c| u32::try_from(c).unwrap_or(u32::MAX))
}

/// Decode a service output leniently; missing fields take their defaults.
pub(crate) fn decode<T: DeserializeOwned + Default>(output: &JsonValue) -> T {
    serde_json::from_value(output.clone()).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use conductor_core::WorkerId;

    use super::*;
    use crate::services::StaticWorkServices;
    use crate::signals::InMemorySignalReader;

    pub struct Fixture {
        pub signals: Arc<InMemorySignalReader>,
        pub services: Arc<StaticWorkServices>,
        pub deps: WorkerDeps,
    }

    pub fn fixture() -> Fixture {
        let signals = Arc::new(InMemorySignalReader::new());
        let services = Arc::new(StaticWorkServices::new());
        let deps = WorkerDeps::new(signals.clone(), services.clone());
        Fixture { signals, services, deps }
    }

    pub fn ctx(tenant_id: Option<TenantId>) -> WorkContext {
        WorkContext::new(WorkerId::generate("test"), tenant_id, 100, Duration::from_secs(30))
    }
}
