//! The conductor control loop.
//!
//! One call to [`Conductor::run_cycle`] is one tick: reap stale records,
//! measure the deficit, then select, claim and execute catalog work until the
//! deficit is covered or the tick runs out of time. The engine keeps no state
//! about what is running; the registry is asked every time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use conductor_core::{ProcessId, TenantId, WorkerId};

use crate::catalog::{WorkCatalog, WorkCatalogEntry};
use crate::config::{ConductorConfig, ConfigSource};
use crate::context::WorkContext;
use crate::cycle::{ConductorCycleResult, SkipReason, SpawnedWork};
use crate::execution::{ExecutionOutcome, Finished, LateHandler, WorkPool, check_eligibility};
use crate::process::{ClaimRequest, Completion, DEFAULT_TTL_SECONDS, ProcessStatus};
use crate::registry::ProcessRegistry;
use crate::tenants::{TenantSource, collect_tenants};

/// Trigger surface: one cycle per call, no parameters.
pub trait Conductor: Send + Sync {
    fn run_cycle(&self) -> ConductorCycleResult;
}

impl<C> Conductor for Arc<C>
where
    C: Conductor + ?Sized,
{
    fn run_cycle(&self) -> ConductorCycleResult {
        (**self).run_cycle()
    }
}

/// Code-level tuning of the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Hard wall-clock ceiling of one cycle.
    pub cycle_timeout: Duration,
    /// No new attempt starts with less time than this left in the cycle.
    pub min_slot_time: Duration,
    pub eligibility_concurrency: usize,
    /// Attempts allowed to execute at once within a cycle.
    pub execution_concurrency: usize,
    pub tenant_page_size: usize,
    pub max_tenants: usize,
    /// TTL assigned to claimed records.
    pub process_ttl: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cycle_timeout: Duration::from_millis(55_000),
            min_slot_time: Duration::from_millis(10_000),
            eligibility_concurrency: 4,
            execution_concurrency: 4,
            tenant_page_size: 100,
            max_tenants: 1_000,
            process_ttl: Duration::from_secs(u64::from(DEFAULT_TTL_SECONDS)),
        }
    }
}

/// Control loop over a registry, a tenant source, a config source and a catalog.
pub struct ConductorEngine<R, T, C> {
    /// Shared with workers that outlive their deadline.
    registry: Arc<R>,
    tenants: T,
    config: C,
    catalog: WorkCatalog,
    options: EngineOptions,
    worker_id: WorkerId,
    /// Rotates the first tenant visited so no tenant is always served first.
    cursor: AtomicUsize,
}

impl<R, T, C> ConductorEngine<R, T, C>
where
    R: ProcessRegistry + 'static,
    T: TenantSource,
    C: ConfigSource,
{
    pub fn new(registry: R, tenants: T, config: C, catalog: WorkCatalog) -> Self {
        Self {
            registry: Arc::new(registry),
            tenants,
            config,
            catalog,
            options: EngineOptions::default(),
            worker_id: WorkerId::generate("conductor"),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn registry(&self) -> &R {
        self.registry.as_ref()
    }

    pub fn catalog(&self) -> &WorkCatalog {
        &self.catalog
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Run one cycle against an explicit config snapshot.
    pub fn run_cycle_with(&self, config: &ConductorConfig) -> ConductorCycleResult {
        self.cycle(config, Instant::now(), ConductorCycleResult::new(self.worker_id.clone()))
    }

    fn cycle(
        &self,
        config: &ConductorConfig,
        started: Instant,
        mut result: ConductorCycleResult,
    ) -> ConductorCycleResult {
        if !config.enabled {
            debug!("conductor disabled");
            return self.report(result, Some(SkipReason::Disabled), started);
        }

        match self.registry.expire_stale() {
            Ok(expired) => {
                result.expired = expired;
                if expired > 0 {
                    info!(expired, "expired stale processes");
                }
            }
            Err(e) => warn!(error = %e, "expire_stale failed; continuing"),
        }

        let active = match self.registry.count_active() {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "count_active failed; skipping cycle");
                return self.report(result, Some(SkipReason::RegistryUnavailable), started);
            }
        };
        let deficit = config.deficit(active.total);
        result.active_processes = active;
        result.deficit = deficit;
        result.remaining_deficit = deficit;
        if deficit == 0 {
            return self.report(result, Some(SkipReason::NoDeficit), started);
        }

        let spent_today = match self.registry.daily_spend() {
            Ok(spent) => Some(spent),
            Err(e) => {
                warn!(error = %e, "daily_spend failed; restricting to free work");
                None
            }
        };
        let budget = Budget::new(config.daily_budget_cents, spent_today);
        if budget.free_only() {
            info!(
                daily_budget_cents = config.daily_budget_cents,
                "daily budget exhausted; only free work is eligible"
            );
        }

        let tenants = match collect_tenants(&self.tenants, self.options.tenant_page_size, self.options.max_tenants) {
            Ok(tenants) => tenants,
            Err(e) => {
                warn!(error = %e, "tenant source failed; continuing with tenant-less work");
                Vec::new()
            }
        };
        let rotation = match tenants.len() {
            0 => 0,
            n => self.cursor.fetch_add(1, Ordering::Relaxed) % n,
        };

        let mut tick = Tick {
            started,
            timeout: self.options.cycle_timeout,
            order: self.catalog.sorted_by_priority(&config.work_priorities),
            tenants,
            rotation,
            decided: HashMap::new(),
            budget,
            budget_limited: false,
        };

        let mut pool: WorkPool<Claimed> = WorkPool::new("conductor-work");
        let mut spawned: Vec<Option<SpawnedWork>> = Vec::new();
        let mut remaining = deficit;

        while remaining > 0 {
            if tick.time_left() < self.options.min_slot_time {
                debug!(remaining, "cycle time budget exhausted");
                break;
            }

            while pool.len() >= self.options.execution_concurrency.max(1) {
                match pool.next() {
                    Some(done) => self.record(done, &mut tick.budget, &mut spawned),
                    None => break,
                }
            }
            if tick.time_left() < self.options.min_slot_time {
                debug!(remaining, "cycle time budget exhausted while waiting for a free slot");
                break;
            }

            let Some(candidate) = self.next_candidate(&mut tick) else {
                debug!(remaining, "no further eligible work");
                break;
            };
            tick.decided
                .insert((candidate.entry.id().to_string(), candidate.tenant_id), Decision::Skip);

            let profile = candidate.entry.profile();
            let params = candidate.entry.params(candidate.tenant_id);
            let request = ClaimRequest::new(self.worker_id.clone(), profile.id.clone(), candidate.tenant_id)
                .with_process_name(profile.name.clone())
                .with_params(params.clone())
                .with_ttl(self.options.process_ttl);

            match self.registry.claim(request) {
                Ok(Some(process_id)) => {
                    let deadline = profile.max_duration().min(tick.time_left());
                    let ctx = WorkContext::new(
                        self.worker_id.clone(),
                        candidate.tenant_id,
                        tick.budget.remaining(),
                        deadline,
                    )
                    .with_process_id(process_id)
                    .with_params(params);

                    info!(
                        work_id = %profile.id,
                        tenant = ?candidate.tenant_id.map(|t| t.short()),
                        process_id = %process_id,
                        deadline_ms = deadline.as_millis() as u64,
                        "claimed work"
                    );

                    tick.budget.reserve(profile.estimated_cost_cents);
                    tick.advance_past(candidate.tenant_id);
                    let claimed = Claimed {
                        index: spawned.len(),
                        work_catalog_id: profile.id.clone(),
                        process_id,
                        tenant_id: candidate.tenant_id,
                        estimated_cost_cents: profile.estimated_cost_cents,
                    };
                    let late = self.late_completion(&claimed, deadline);
                    spawned.push(None);
                    pool.spawn_with_late_handler(claimed, candidate.entry.clone(), ctx, deadline, late);
                    remaining -= 1;
                }
                Ok(None) => {
                    result.claim_conflicts += 1;
                    debug!(
                        work_id = %profile.id,
                        tenant = ?candidate.tenant_id.map(|t| t.short()),
                        "slot already held; trying next candidate"
                    );
                }
                Err(e) => {
                    warn!(work_id = %profile.id, error = %e, "claim failed; treating as not claimed");
                }
            }
        }

        for done in pool.drain() {
            self.record(done, &mut tick.budget, &mut spawned);
        }

        result.work_spawned = spawned.into_iter().flatten().collect();
        result.remaining_deficit = remaining;
        result.budget_spent_cents = tick.budget.spent;
        result.budget_remaining_cents = tick.budget.remaining();

        let skipped = if !result.work_spawned.is_empty() {
            None
        } else if tick.budget_limited {
            Some(SkipReason::BudgetExhausted)
        } else {
            Some(SkipReason::NoEligibleWork)
        };
        self.report(result, skipped, started)
    }

    /// First eligible, admissible, non-cooling-down `(entry, tenant)` pair in
    /// priority order. Eligibility is checked lazily in small parallel batches.
    fn next_candidate(&self, tick: &mut Tick) -> Option<Candidate> {
        let mut batch: Vec<(Arc<dyn WorkCatalogEntry>, WorkContext)> = Vec::new();

        for (entry, tenant_id) in tick.pairs() {
            let key = (entry.id().to_string(), tenant_id);
            if !tick.budget.admits(entry.as_ref()) {
                tick.budget_limited = true;
                continue;
            }

            match tick.decided.get(&key).copied() {
                Some(Decision::Skip) => continue,
                Some(Decision::Eligible) => {
                    // Anything batched so far ranks higher.
                    if let Some(found) = self.flush(&mut batch, tick) {
                        return Some(found);
                    }
                    return Some(Candidate { entry, tenant_id });
                }
                None => {}
            }

            if self.in_cooldown(entry.as_ref(), tenant_id) {
                tick.decided.insert(key, Decision::Skip);
                continue;
            }

            let ctx = WorkContext::new(
                self.worker_id.clone(),
                tenant_id,
                tick.budget.remaining(),
                tick.time_left(),
            );
            batch.push((entry, ctx));
            if batch.len() >= self.options.eligibility_concurrency.max(1) {
                if let Some(found) = self.flush(&mut batch, tick) {
                    return Some(found);
                }
            }
        }

        self.flush(&mut batch, tick)
    }

    fn flush(
        &self,
        batch: &mut Vec<(Arc<dyn WorkCatalogEntry>, WorkContext)>,
        tick: &mut Tick,
    ) -> Option<Candidate> {
        if batch.is_empty() {
            return None;
        }

        let results = check_eligibility(batch, self.options.eligibility_concurrency);
        let mut found = None;
        for ((entry, ctx), eligible) in batch.drain(..).zip(results) {
            let key = (entry.id().to_string(), ctx.tenant_id);
            let decision = match eligible {
                Ok(true) => Decision::Eligible,
                Ok(false) => Decision::Skip,
                Err(e) => {
                    warn!(
                        work_id = %entry.id(),
                        tenant = ?ctx.tenant_id.map(|t| t.short()),
                        error = %e,
                        "eligibility check failed; treating as ineligible"
                    );
                    Decision::Skip
                }
            };
            if decision == Decision::Eligible && found.is_none() {
                found = Some(Candidate {
                    entry: entry.clone(),
                    tenant_id: ctx.tenant_id,
                });
            }
            tick.decided.insert(key, decision);
        }
        found
    }

    fn in_cooldown(&self, entry: &dyn WorkCatalogEntry, tenant_id: Option<TenantId>) -> bool {
        let profile = entry.profile();
        if profile.cooldown_minutes == 0 {
            return false;
        }

        match self.registry.last_completed(&profile.id, tenant_id) {
            Ok(Some(last)) => {
                let cooldown = chrono::Duration::minutes(i64::from(profile.cooldown_minutes));
                Utc::now() < last + cooldown
            }
            Ok(None) => false,
            Err(e) => {
                warn!(work_id = %profile.id, error = %e, "last_completed failed; assuming cooldown");
                true
            }
        }
    }

    fn record(&self, done: Finished<Claimed>, budget: &mut Budget, spawned: &mut [Option<SpawnedWork>]) {
        let claimed = done.tag;
        let completion = completion_for(&done.outcome, claimed.estimated_cost_cents);
        let success = completion.status == ProcessStatus::Completed;
        let cost_cents = completion.cost_cents;
        let error = completion.error.clone();

        if matches!(done.outcome, ExecutionOutcome::TimedOut(_)) {
            // The worker is still running; its record stays the slot holder
            // until the late completion lands or the ttl expires it.
            debug!(
                process_id = %claimed.process_id,
                "record left running until the worker returns"
            );
        } else if let Err(e) = self.registry.complete(claimed.process_id, completion) {
            warn!(
                process_id = %claimed.process_id,
                error = %e,
                "complete failed; record will expire by ttl"
            );
        }
        budget.settle(claimed.estimated_cost_cents, cost_cents);

        let duration_ms = u64::try_from(done.elapsed.as_millis()).unwrap_or(u64::MAX);
        if success {
            info!(
                work_id = %claimed.work_catalog_id,
                process_id = %claimed.process_id,
                cost_cents,
                duration_ms,
                "work completed"
            );
        } else {
            warn!(
                work_id = %claimed.work_catalog_id,
                process_id = %claimed.process_id,
                cost_cents,
                duration_ms,
                error = error.as_deref().unwrap_or_default(),
                "work failed"
            );
        }

        if let Some(slot) = spawned.get_mut(claimed.index) {
            *slot = Some(SpawnedWork {
                work_catalog_id: claimed.work_catalog_id,
                process_id: claimed.process_id,
                tenant_id: claimed.tenant_id,
                duration_ms,
                cost_cents,
                success,
                error,
            });
        }
    }

    /// Completes a timed-out attempt's record once its worker returns.
    fn late_completion(&self, claimed: &Claimed, deadline: Duration) -> LateHandler {
        let registry = self.registry.clone();
        let process_id = claimed.process_id;
        let work_id = claimed.work_catalog_id.clone();
        let estimated_cost_cents = claimed.estimated_cost_cents;

        Box::new(move |outcome, elapsed| {
            let error = format!(
                "timed out after {}ms; worker returned after {}ms",
                deadline.as_millis(),
                elapsed.as_millis()
            );
            let result = match outcome {
                ExecutionOutcome::Finished(r) => r.result,
                _ => None,
            };
            let completion = Completion::failed(estimated_cost_cents, error).with_result(result);
            match registry.complete(process_id, completion) {
                Ok(()) => info!(
                    work_id = %work_id,
                    process_id = %process_id,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "late worker returned; slot released"
                ),
                Err(e) => warn!(
                    work_id = %work_id,
                    process_id = %process_id,
                    error = %e,
                    "late completion failed; record will expire by ttl"
                ),
            }
        })
    }

    fn report(
        &self,
        mut result: ConductorCycleResult,
        skipped: Option<SkipReason>,
        started: Instant,
    ) -> ConductorCycleResult {
        result.skipped_reason = skipped;
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            worker_id = %result.worker_id,
            expired = result.expired,
            active = result.active_processes.total,
            deficit = result.deficit,
            spawned = result.work_spawned.len(),
            failed = result.failed(),
            claim_conflicts = result.claim_conflicts,
            budget_spent_cents = result.budget_spent_cents,
            duration_ms = result.duration_ms,
            skipped = skipped.map(|s| s.as_str()).unwrap_or("none"),
            "conductor cycle finished"
        );
        result
    }
}

impl<R, T, C> Conductor for ConductorEngine<R, T, C>
where
    R: ProcessRegistry + 'static,
    T: TenantSource,
    C: ConfigSource,
{
    fn run_cycle(&self) -> ConductorCycleResult {
        let started = Instant::now();
        let result = ConductorCycleResult::new(self.worker_id.clone());
        match self.config.load() {
            Ok(config) => self.cycle(&config, started, result),
            Err(e) => {
                warn!(error = %e, "config load failed; skipping cycle");
                self.report(result, Some(SkipReason::ConfigUnavailable), started)
            }
        }
    }
}

/// Map how an attempt ended to the registry completion and its billed cost.
///
/// Timeouts bill the estimated cost; errors and panics bill nothing.
fn completion_for(outcome: &ExecutionOutcome, estimated_cost_cents: u32) -> Completion {
    match outcome {
        ExecutionOutcome::Finished(r) if r.success => {
            Completion::completed(r.cost_cents).with_result(r.result.clone())
        }
        ExecutionOutcome::Finished(r) => Completion::failed(
            r.cost_cents,
            r.error.clone().unwrap_or_else(|| "work reported failure".to_string()),
        )
        .with_result(r.result.clone()),
        ExecutionOutcome::Errored(e) => Completion::failed(0, e.to_string()),
        ExecutionOutcome::Panicked(msg) => Completion::failed(0, format!("worker panicked: {msg}")),
        ExecutionOutcome::TimedOut(elapsed) => Completion::failed(
            estimated_cost_cents,
            format!("timed out after {}ms", elapsed.as_millis()),
        ),
        ExecutionOutcome::NotStarted(msg) => Completion::failed(0, format!("worker not started: {msg}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Eligible,
    Skip,
}

struct Candidate {
    entry: Arc<dyn WorkCatalogEntry>,
    tenant_id: Option<TenantId>,
}

struct Claimed {
    index: usize,
    work_catalog_id: String,
    process_id: ProcessId,
    tenant_id: Option<TenantId>,
    estimated_cost_cents: u32,
}

/// Daily budget as seen by one cycle.
///
/// An unknown spend counts as exhausted.
struct Budget {
    daily_cents: u64,
    spent_before: u64,
    /// Billed by attempts finished this cycle.
    spent: u64,
    /// Estimated cost of attempts still executing.
    reserved: u64,
}

impl Budget {
    fn new(daily_cents: u64, spent_today: Option<u64>) -> Self {
        Self {
            daily_cents,
            spent_before: spent_today.unwrap_or(daily_cents),
            spent: 0,
            reserved: 0,
        }
    }

    fn remaining(&self) -> i64 {
        let used = self.spent_before.saturating_add(self.spent).saturating_add(self.reserved);
        saturating_i64(self.daily_cents) - saturating_i64(used)
    }

    fn free_only(&self) -> bool {
        self.remaining() <= 0
    }

    fn admits(&self, entry: &dyn WorkCatalogEntry) -> bool {
        let profile = entry.profile();
        profile.is_free() || (!self.free_only() && i64::from(profile.estimated_cost_cents) <= self.remaining())
    }

    fn reserve(&mut self, estimated_cents: u32) {
        self.reserved += u64::from(estimated_cents);
    }

    fn settle(&mut self, estimated_cents: u32, billed_cents: u32) {
        self.reserved = self.reserved.saturating_sub(u64::from(estimated_cents));
        self.spent += u64::from(billed_cents);
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Per-cycle selection state.
struct Tick {
    started: Instant,
    timeout: Duration,
    order: Vec<Arc<dyn WorkCatalogEntry>>,
    tenants: Vec<TenantId>,
    rotation: usize,
    decided: HashMap<(String, Option<TenantId>), Decision>,
    budget: Budget,
    /// Some candidate was passed over because of the budget.
    budget_limited: bool,
}

impl Tick {
    fn time_left(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    /// `(entry, tenant)` pairs in visit order: entries by priority, tenants
    /// rotated so the last served tenant goes to the back.
    fn pairs(&self) -> Vec<(Arc<dyn WorkCatalogEntry>, Option<TenantId>)> {
        let n = self.tenants.len();
        let mut pairs = Vec::new();
        for entry in &self.order {
            if entry.profile().per_tenant {
                for i in 0..n {
                    let tenant = self.tenants[(self.rotation + i) % n];
                    pairs.push((entry.clone(), Some(tenant)));
                }
            } else {
                pairs.push((entry.clone(), None));
            }
        }
        pairs
    }

    fn advance_past(&mut self, tenant_id: Option<TenantId>) {
        let Some(tenant_id) = tenant_id else { return };
        if let Some(pos) = self.tenants.iter().position(|t| *t == tenant_id) {
            self.rotation = (pos + 1) % self.tenants.len();
        }
    }
}
