//! Port to the business logic each worker triggers.
//!
//! Workers only decide *that* something runs; the analysis, ETL and messaging
//! code lives behind [`WorkServices`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use conductor_core::{TenantId, WorkerId};

/// Depth of a knowledge analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    Light,
    Deep,
}

/// One request to the work services, with its typed parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum ServiceCall {
    ProactiveCheck { tenant_id: TenantId },
    ProcessAsyncTask { worker_id: WorkerId },
    KnowledgeAnalysis { tenant_id: TenantId, depth: AnalysisDepth },
    CrossDomainInsights { tenant_id: TenantId },
    HealthTrends { tenant_id: TenantId },
    GoalEffectiveness { tenant_id: TenantId },
    EmailDeepAnalysis { tenant_id: TenantId },
    ContextEnrichment { tenant_id: TenantId },
    MemoryConsolidation { tenant_id: TenantId },
    SilverEtl,
    DataQualityAudit,
    DrainLoopQueue { worker_id: WorkerId, handlers: Vec<String> },
    AppOptimization { tenant_id: TenantId },
    SkillRecommendations { tenant_id: TenantId },
    OutcomeAnalysis { tenant_id: TenantId },
    AutonomyMicroCycle { tenant_id: TenantId, time_budget_ms: u64 },
}

impl ServiceCall {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceCall::ProactiveCheck { .. } => "proactive_check",
            ServiceCall::ProcessAsyncTask { .. } => "process_async_task",
            ServiceCall::KnowledgeAnalysis { .. } => "knowledge_analysis",
            ServiceCall::CrossDomainInsights { .. } => "cross_domain_insights",
            ServiceCall::HealthTrends { .. } => "health_trends",
            ServiceCall::GoalEffectiveness { .. } => "goal_effectiveness",
            ServiceCall::EmailDeepAnalysis { .. } => "email_deep_analysis",
            ServiceCall::ContextEnrichment { .. } => "context_enrichment",
            ServiceCall::MemoryConsolidation { .. } => "memory_consolidation",
            ServiceCall::SilverEtl => "silver_etl",
            ServiceCall::DataQualityAudit => "data_quality_audit",
            ServiceCall::DrainLoopQueue { .. } => "drain_loop_queue",
            ServiceCall::AppOptimization { .. } => "app_optimization",
            ServiceCall::SkillRecommendations { .. } => "skill_recommendations",
            ServiceCall::OutcomeAnalysis { .. } => "outcome_analysis",
            ServiceCall::AutonomyMicroCycle { .. } => "autonomy_micro_cycle",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("work service unavailable: {0}")]
    Unavailable(String),

    #[error("work service failed: {0}")]
    Failed(String),

    #[error("invalid work service response: {0}")]
    InvalidResponse(String),
}

/// Executes business logic on behalf of a worker.
pub trait WorkServices: Send + Sync {
    /// Run `call`, giving up after `deadline`. Returns the service's JSON output.
    fn invoke(&self, call: &ServiceCall, deadline: Duration) -> Result<JsonValue, ServiceError>;
}

impl<S> WorkServices for Arc<S>
where
    S: WorkServices + ?Sized,
{
    fn invoke(&self, call: &ServiceCall, deadline: Duration) -> Result<JsonValue, ServiceError> {
        (**self).invoke(call, deadline)
    }
}

/// Canned responses keyed by call name; records every call (tests/dev).
///
/// Calls without a canned response return `{}`.
#[derive(Debug, Default)]
pub struct StaticWorkServices {
    responses: Mutex<HashMap<&'static str, Result<JsonValue, ServiceError>>>,
    calls: Mutex<Vec<ServiceCall>>,
}

impl StaticWorkServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, call_name: &'static str, response: Result<JsonValue, ServiceError>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(call_name, response);
        }
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl WorkServices for StaticWorkServices {
    fn invoke(&self, call: &ServiceCall, _deadline: Duration) -> Result<JsonValue, ServiceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.clone());
        }
        let responses = self
            .responses
            .lock()
            .map_err(|_| ServiceError::Unavailable("responses lock poisoned".to_string()))?;
        responses
            .get(call.name())
            .cloned()
            .unwrap_or_else(|| Ok(JsonValue::Object(Default::default())))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn calls_serialize_with_a_tag() {
        let tenant = TenantId::new();
        let call = ServiceCall::KnowledgeAnalysis {
            tenant_id: tenant,
            depth: AnalysisDepth::Deep,
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["call"], "knowledge_analysis");
        assert_eq!(value["depth"], "deep");
        assert_eq!(value["tenant_id"], tenant.to_string());
        assert_eq!(call.name(), "knowledge_analysis");
    }

    #[test]
    fn static_services_replay_canned_responses() {
        let services = StaticWorkServices::new();
        services.respond("silver_etl", Ok(json!({"records": 10})));
        services.respond("data_quality_audit", Err(ServiceError::Failed("db".to_string())));

        let timeout = Duration::from_secs(1);
        assert_eq!(services.invoke(&ServiceCall::SilverEtl, timeout).unwrap(), json!({"records": 10}));
        assert!(services.invoke(&ServiceCall::DataQualityAudit, timeout).is_err());
        assert_eq!(
            services
                .invoke(&ServiceCall::ProcessAsyncTask { worker_id: WorkerId::generate("w") }, timeout)
                .unwrap(),
            json!({})
        );
        assert_eq!(services.calls().len(), 3);
    }
}
