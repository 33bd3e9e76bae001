//! `conductor-workers`
//!
//! **Responsibility:** the standard work catalog. Each worker decides from
//! cheap signal counts whether it is worth running, then triggers one call
//! on the [`WorkServices`] port.

pub mod intelligence;
pub mod maintenance;
pub mod optimization;
pub mod services;
pub mod signals;
pub mod speculative;
pub mod user_facing;
pub mod worker;

use conductor_engine::{CatalogError, WorkCatalog};

pub use services::{AnalysisDepth, ServiceCall, ServiceError, StaticWorkServices, WorkServices};
pub use signals::{ActivityClass, InMemorySignalReader, Signal, SignalError, SignalKind, SignalReader};
pub use worker::{CatalogWorker, Eligibility, Report, WorkerDeps};

/// All sixteen standard workers, wired to `deps`.
pub fn standard_catalog(deps: &WorkerDeps) -> Result<WorkCatalog, CatalogError> {
    let workers = [
        user_facing::proactive_message_check(deps),
        user_facing::pending_async_task(deps),
        intelligence::deep_knowledge_analysis(deps),
        intelligence::cross_domain_insights(deps),
        intelligence::trend_detection(deps),
        intelligence::goal_strategy_refinement(deps),
        intelligence::email_deep_analysis(deps),
        intelligence::context_enrichment(deps),
        intelligence::memory_consolidation(deps),
        maintenance::etl_catchup(deps),
        maintenance::data_quality_audit(deps),
        maintenance::loop_queue_drain(deps),
        optimization::app_optimization(deps),
        optimization::skill_recommendations(deps),
        optimization::outcome_analysis(deps),
        speculative::autonomy_micro_cycle(deps),
    ];
    WorkCatalog::new(workers.into_iter().map(CatalogWorker::into_entry).collect())
}
