//! Analysis, insight and pattern work.

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use conductor_engine::{CostTier, WorkCategory, WorkProfile};

use crate::services::{AnalysisDepth, ServiceCall};
use crate::signals::{Signal, SignalKind};
use crate::worker::{CatalogWorker, Eligibility, Report, WorkerDeps, decode};

pub const DEEP_KNOWLEDGE_ANALYSIS: &str = "deep_knowledge_analysis";
pub const CROSS_DOMAIN_INSIGHTS: &str = "cross_domain_insights";
pub const TREND_DETECTION: &str = "trend_detection";
pub const GOAL_STRATEGY_REFINEMENT: &str = "goal_strategy_refinement";
pub const EMAIL_DEEP_ANALYSIS: &str = "email_deep_analysis";
pub const CONTEXT_ENRICHMENT: &str = "context_enrichment";
pub const MEMORY_CONSOLIDATION: &str = "memory_consolidation";

fn profile(id: &str, tier: CostTier, cost: u32, max_ms: u64, cooldown: u32) -> WorkProfile {
    WorkProfile::new(id, WorkCategory::Intelligence, tier)
        .estimated_cost(cost)
        .max_duration_ms(max_ms)
        .cooldown_minutes(cooldown)
        .per_tenant()
}

pub fn deep_knowledge_analysis(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(DEEP_KNOWLEDGE_ANALYSIS, CostTier::Moderate, 3, 45_000, 120)
        .named("Deep Knowledge Analysis", "Deep pass over the tenant's document knowledge");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::total(SignalKind::DocumentChunks), 5),
        |ctx| {
            Ok(ServiceCall::KnowledgeAnalysis {
                tenant_id: ctx.require_tenant()?,
                depth: AnalysisDepth::Deep,
            })
        },
    )
    // The model call is billed even when the analysis fails afterwards.
    .billing(3, 1)
}

pub fn cross_domain_insights(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(CROSS_DOMAIN_INSIGHTS, CostTier::Cheap, 1, 30_000, 360)
        .named("Cross-Domain Pattern Detection", "Correlates activity across life domains");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::within_days(SignalKind::DailySummaries, 14), 7),
        |ctx| {
            Ok(ServiceCall::CrossDomainInsights {
                tenant_id: ctx.require_tenant()?,
            })
        },
    )
    .report(report_cross_domain)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CrossDomainOutput {
    top_insight: Option<String>,
}

fn report_cross_domain(output: &JsonValue) -> Report {
    let out: CrossDomainOutput = decode(output);
    Report::ok(json!({ "top_insight": out.top_insight }))
}

pub fn trend_detection(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(TREND_DETECTION, CostTier::Cheap, 1, 25_000, 360)
        .named("Behavioral Trend Detection", "Looks for health and behavior trends");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::within_days(SignalKind::DailySummaries, 30), 14),
        |ctx| {
            Ok(ServiceCall::HealthTrends {
                tenant_id: ctx.require_tenant()?,
            })
        },
    )
    .report(report_trends)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TrendOutput {
    alerts: Vec<JsonValue>,
}

fn report_trends(output: &JsonValue) -> Report {
    let out: TrendOutput = decode(output);
    Report::ok(json!({ "alerts": out.alerts.len() }))
}

pub fn goal_strategy_refinement(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(GOAL_STRATEGY_REFINEMENT, CostTier::Cheap, 1, 25_000, 720)
        .named("Goal Strategy Refinement", "Measures goal progress and suggests strategy changes");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::total(SignalKind::ActiveGoals), 1),
        |ctx| {
            Ok(ServiceCall::GoalEffectiveness {
                tenant_id: ctx.require_tenant()?,
            })
        },
    )
    .report(report_goals)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GoalOutput {
    recommendations: Vec<JsonValue>,
}

fn report_goals(output: &JsonValue) -> Report {
    let out: GoalOutput = decode(output);
    Report::ok(json!({ "recommendations": out.recommendations.len() }))
}

pub fn email_deep_analysis(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(EMAIL_DEEP_ANALYSIS, CostTier::Cheap, 1, 40_000, 180)
        .named("Email Deep Analysis", "Extracts commitments and follow-ups from recent email");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::within_hours(SignalKind::AnalyzedEmails, 48), 3),
        |ctx| {
            Ok(ServiceCall::EmailDeepAnalysis {
                tenant_id: ctx.require_tenant()?,
            })
        },
    )
}

pub fn context_enrichment(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(CONTEXT_ENRICHMENT, CostTier::Cheap, 1, 30_000, 360)
        .named("Context Enrichment", "Enriches the tenant profile from recent inbound messages");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::within_hours(SignalKind::InboundMessages, 24), 5),
        |ctx| {
            Ok(ServiceCall::ContextEnrichment {
                tenant_id: ctx.require_tenant()?,
            })
        },
    )
}

pub fn memory_consolidation(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(MEMORY_CONSOLIDATION, CostTier::Free, 0, 25_000, 360)
        .named("Memory Consolidation", "Merges recent memory highlights into long-term memory");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::within_hours(SignalKind::MemoryHighlights, 24), 3),
        |ctx| {
            Ok(ServiceCall::MemoryConsolidation {
                tenant_id: ctx.require_tenant()?,
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use conductor_core::TenantId;
    use conductor_engine::WorkCatalogEntry;
    use serde_json::json;

    use super::*;
    use crate::services::ServiceError;
    use crate::worker::test_support::{ctx, fixture};

    #[test]
    fn deep_analysis_needs_five_chunks() {
        let f = fixture();
        let tenant = TenantId::new();
        let worker = deep_knowledge_analysis(&f.deps);

        f.signals.set(SignalKind::DocumentChunks, Some(tenant), 4);
        assert!(!worker.is_eligible(&ctx(Some(tenant))).unwrap());
        f.signals.set(SignalKind::DocumentChunks, Some(tenant), 5);
        assert!(worker.is_eligible(&ctx(Some(tenant))).unwrap());
    }

    #[test]
    fn deep_analysis_bills_partial_cost_on_failure() {
        let f = fixture();
        f.services
            .respond("knowledge_analysis", Err(ServiceError::Failed("context too long".to_string())));

        let result = deep_knowledge_analysis(&f.deps)
            .execute(&ctx(Some(TenantId::new())))
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.cost_cents, 1);
    }

    #[test]
    fn trend_detection_summarizes_alert_count() {
        let f = fixture();
        f.services.respond(
            "health_trends",
            Ok(json!({"alerts": [{"metric": "sleep"}, {"metric": "steps"}]})),
        );

        let result = trend_detection(&f.deps).execute(&ctx(Some(TenantId::new()))).unwrap();
        assert!(result.success);
        assert_eq!(result.cost_cents, 1);
        assert_eq!(result.result, Some(json!({"alerts": 2})));
    }

    #[test]
    fn failed_cheap_analysis_bills_nothing() {
        let f = fixture();
        f.services
            .respond("cross_domain_insights", Err(ServiceError::Unavailable("503".to_string())));

        let result = cross_domain_insights(&f.deps)
            .execute(&ctx(Some(TenantId::new())))
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.cost_cents, 0);
    }

    #[test]
    fn signal_outage_surfaces_as_an_eligibility_error() {
        use std::sync::Arc;

        use crate::signals::{ActivityClass, SignalError, SignalReader};
        use crate::worker::WorkerDeps;

        struct Down;
        impl SignalReader for Down {
            fn count(&self, _signal: Signal, _tenant: Option<TenantId>) -> Result<u64, SignalError> {
                Err(SignalError::Unavailable("connection reset".to_string()))
            }
            fn activity_class(&self, _tenant: TenantId) -> Result<Option<ActivityClass>, SignalError> {
                Err(SignalError::Unavailable("connection reset".to_string()))
            }
        }

        let f = fixture();
        let deps = WorkerDeps::new(Arc::new(Down), f.services.clone());
        let err = memory_consolidation(&deps)
            .is_eligible(&ctx(Some(TenantId::new())))
            .unwrap_err();
        assert!(matches!(err, conductor_engine::WorkError::Signal(_)));
    }
}
