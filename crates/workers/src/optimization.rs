//! Quality and performance improvements for a tenant.

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use conductor_engine::{CostTier, WorkCategory, WorkProfile};

use crate::services::ServiceCall;
use crate::signals::{Signal, SignalKind};
use crate::worker::{CatalogWorker, Eligibility, Report, WorkerDeps, decode};

pub const APP_OPTIMIZATION: &str = "app_optimization";
pub const SKILL_RECOMMENDATIONS: &str = "skill_recommendations";
pub const OUTCOME_ANALYSIS: &str = "outcome_analysis";

fn profile(id: &str, tier: CostTier, cost: u32, max_ms: u64, cooldown: u32) -> WorkProfile {
    WorkProfile::new(id, WorkCategory::Optimization, tier)
        .estimated_cost(cost)
        .max_duration_ms(max_ms)
        .cooldown_minutes(cooldown)
        .per_tenant()
}

pub fn app_optimization(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(APP_OPTIMIZATION, CostTier::Cheap, 1, 30_000, 720)
        .named("App Optimization", "Reviews usage of generated apps and tunes them");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::total(SignalKind::ActiveGeneratedApps), 1),
        |ctx| {
            Ok(ServiceCall::AppOptimization {
                tenant_id: ctx.require_tenant()?,
            })
        },
    )
}

pub fn skill_recommendations(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(SKILL_RECOMMENDATIONS, CostTier::Cheap, 1, 25_000, 1_440)
        .named("Skill Recommendations", "Suggests new skills from a week of conversations");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::within_days(SignalKind::Messages, 7), 10),
        |ctx| {
            Ok(ServiceCall::SkillRecommendations {
                tenant_id: ctx.require_tenant()?,
            })
        },
    )
    .report(report_skills)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SkillOutput {
    suggestions: Vec<JsonValue>,
}

fn report_skills(output: &JsonValue) -> Report {
    let out: SkillOutput = decode(output);
    Report::ok(json!({ "suggestions": out.suggestions.len() }))
}

/// Score how recent interventions turned out.
pub fn outcome_analysis(deps: &WorkerDeps) -> CatalogWorker {
    let profile = profile(OUTCOME_ANALYSIS, CostTier::Free, 0, 15_000, 360)
        .named("Intervention Outcome Analysis", "Scores the outcome of interventions from the last two days");

    CatalogWorker::new(
        profile,
        deps.clone(),
        Eligibility::AtLeast(Signal::within_hours(SignalKind::CompletedInterventions, 48), 1),
        |ctx| {
            Ok(ServiceCall::OutcomeAnalysis {
                tenant_id: ctx.require_tenant()?,
            })
        },
    )
    .report(report_outcomes)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OutcomeOutput {
    processed: u64,
    outcomes: Vec<JsonValue>,
}

fn report_outcomes(output: &JsonValue) -> Report {
    let out: OutcomeOutput = decode(output);
    Report::ok(json!({ "processed": out.processed, "outcomes": out.outcomes.len() }))
}
