//! Bounded execution of claimed work under per-attempt deadlines.
//!
//! Workers run on their own named threads. The pool never cancels a worker:
//! once an attempt's deadline passes it is reported as timed out, and the
//! result the worker eventually returns goes to the attempt's late handler.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::catalog::WorkCatalogEntry;
use crate::context::{WorkContext, WorkError, WorkResult};

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// `execute` returned a result (which may itself report failure).
    Finished(WorkResult),
    /// `execute` returned an error.
    Errored(WorkError),
    Panicked(String),
    TimedOut(Duration),
    /// The worker thread could not be started.
    NotStarted(String),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Finished(r) if r.success)
    }
}

/// A finished attempt together with the caller's tag.
#[derive(Debug)]
pub struct Finished<T> {
    pub tag: T,
    pub outcome: ExecutionOutcome,
    pub elapsed: Duration,
}

/// Receives the outcome of an attempt the pool already reported as timed out,
/// with the time the worker actually took.
pub type LateHandler = Box<dyn FnOnce(ExecutionOutcome, Duration) + Send>;

/// Who gets an attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Pending,
    /// Queued on the pool channel.
    Sent,
    /// The pool timed the attempt out; the late handler owns the outcome.
    Abandoned,
}

struct InFlight<T> {
    tag: T,
    started: Instant,
    deadline: Instant,
    delivery: Arc<Mutex<Delivery>>,
}

/// Set of attempts running on worker threads.
pub struct WorkPool<T> {
    name: String,
    tx: mpsc::Sender<(u64, ExecutionOutcome)>,
    rx: mpsc::Receiver<(u64, ExecutionOutcome)>,
    next_key: u64,
    in_flight: HashMap<u64, InFlight<T>>,
    ready: VecDeque<Finished<T>>,
}

impl<T> WorkPool<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            name: name.into(),
            tx,
            rx,
            next_key: 0,
            in_flight: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// Attempts started and not yet returned by [`WorkPool::next`].
    pub fn len(&self) -> usize {
        self.in_flight.len() + self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start `entry.execute(ctx)` on a new thread, due within `timeout`.
    ///
    /// A result returned after the deadline is dropped.
    pub fn spawn(&mut self, tag: T, entry: Arc<dyn WorkCatalogEntry>, ctx: WorkContext, timeout: Duration) {
        self.start(tag, entry, ctx, timeout, None);
    }

    /// Like [`WorkPool::spawn`], but a result returned after the deadline is
    /// passed to `late` on the worker thread.
    pub fn spawn_with_late_handler(
        &mut self,
        tag: T,
        entry: Arc<dyn WorkCatalogEntry>,
        ctx: WorkContext,
        timeout: Duration,
        late: LateHandler,
    ) {
        self.start(tag, entry, ctx, timeout, Some(late));
    }

    fn start(
        &mut self,
        tag: T,
        entry: Arc<dyn WorkCatalogEntry>,
        ctx: WorkContext,
        timeout: Duration,
        late: Option<LateHandler>,
    ) {
        let key = self.next_key;
        self.next_key += 1;

        let tx = self.tx.clone();
        let delivery = Arc::new(Mutex::new(Delivery::Pending));
        let worker_delivery = delivery.clone();
        let started = Instant::now();
        let thread_name = format!("{}-{}", self.name, entry.id());
        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| entry.execute(&ctx))) {
                Ok(Ok(result)) => ExecutionOutcome::Finished(result),
                Ok(Err(e)) => ExecutionOutcome::Errored(e),
                Err(payload) => ExecutionOutcome::Panicked(panic_message(payload.as_ref())),
            };

            let mut state = worker_delivery.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == Delivery::Abandoned {
                drop(state);
                if let Some(late) = late {
                    late(outcome, started.elapsed());
                }
                return;
            }
            *state = Delivery::Sent;
            let _ = tx.send((key, outcome));
        });

        match spawned {
            Ok(_) => {
                self.in_flight.insert(
                    key,
                    InFlight {
                        tag,
                        started,
                        deadline: started + timeout,
                        delivery,
                    },
                );
            }
            Err(e) => {
                warn!(pool = %self.name, error = %e, "failed to spawn worker thread");
                self.ready.push_back(Finished {
                    tag,
                    outcome: ExecutionOutcome::NotStarted(e.to_string()),
                    elapsed: Duration::ZERO,
                });
            }
        }
    }

    /// Block until the next attempt finishes or hits its deadline.
    ///
    /// Returns `None` once nothing is in flight.
    pub fn next(&mut self) -> Option<Finished<T>> {
        if let Some(done) = self.ready.pop_front() {
            return Some(done);
        }

        loop {
            let (key, deadline) = self
                .in_flight
                .iter()
                .min_by_key(|(_, f)| f.deadline)
                .map(|(key, f)| (*key, f.deadline))?;
            let now = Instant::now();
            let received = if deadline <= now {
                if self.abandon(key) {
                    let timed_out = self.in_flight.remove(&key)?;
                    let elapsed = timed_out.started.elapsed();
                    return Some(Finished {
                        tag: timed_out.tag,
                        outcome: ExecutionOutcome::TimedOut(elapsed),
                        elapsed,
                    });
                }
                // Returned right at the deadline; its result is already queued.
                self.rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected)
            } else {
                self.rx.recv_timeout(deadline - now)
            };

            match received {
                Ok((key, outcome)) => {
                    if let Some(done) = self.in_flight.remove(&key) {
                        return Some(Finished {
                            tag: done.tag,
                            outcome,
                            elapsed: done.started.elapsed(),
                        });
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                // Unreachable while `self.tx` is alive.
                Err(mpsc::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Hand the attempt's outcome to its late handler unless the worker
    /// already sent it. Returns whether the attempt was abandoned.
    fn abandon(&self, key: u64) -> bool {
        let Some(in_flight) = self.in_flight.get(&key) else {
            return false;
        };
        let mut state = in_flight.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == Delivery::Pending {
            *state = Delivery::Abandoned;
            true
        } else {
            false
        }
    }

    /// Wait for every attempt still in flight.
    pub fn drain(&mut self) -> Vec<Finished<T>> {
        let mut finished = Vec::with_capacity(self.len());
        while let Some(done) = self.next() {
            finished.push(done);
        }
        finished
    }
}

/// Evaluate `is_eligible` for a batch of candidates on up to `concurrency`
/// scoped threads. Results keep the input order.
pub fn check_eligibility(
    candidates: &[(Arc<dyn WorkCatalogEntry>, WorkContext)],
    concurrency: usize,
) -> Vec<Result<bool, WorkError>> {
    if concurrency <= 1 || candidates.len() <= 1 {
        return candidates.iter().map(|(entry, ctx)| evaluate(entry, ctx)).collect();
    }

    let mut results = Vec::with_capacity(candidates.len());
    for chunk in candidates.chunks(concurrency) {
        thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|(entry, ctx)| {
                    let spawned = thread::Builder::new()
                        .name(format!("eligibility-{}", entry.id()))
                        .spawn_scoped(scope, move || evaluate(entry, ctx));
                    (entry, ctx, spawned)
                })
                .collect();

            for (entry, ctx, spawned) in handles {
                let result = match spawned {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|_| Err(WorkError::Internal("eligibility thread died".to_string()))),
                    // Fall back to evaluating inline.
                    Err(_) => evaluate(entry, ctx),
                };
                results.push(result);
            }
        });
    }
    results
}

fn evaluate(entry: &Arc<dyn WorkCatalogEntry>, ctx: &WorkContext) -> Result<bool, WorkError> {
    panic::catch_unwind(AssertUnwindSafe(|| entry.is_eligible(ctx))).unwrap_or_else(|payload| {
        Err(WorkError::Internal(format!(
            "eligibility check panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use conductor_core::WorkerId;

    use super::*;
    use crate::catalog::test_support::FakeEntry;
    use crate::catalog::{CostTier, WorkCategory, WorkProfile};

    fn profile(id: &str) -> WorkProfile {
        WorkProfile::new(id, WorkCategory::Intelligence, CostTier::Cheap).estimated_cost(1)
    }

    fn ctx() -> WorkContext {
        WorkContext::new(WorkerId::generate("test"), None, 100, Duration::from_secs(5))
    }

    #[test]
    fn results_panics_and_errors_are_reported() {
        let ok = FakeEntry::new(profile("ok")).arc();
        let failing = FakeEntry::new(profile("failing"))
            .executing(|_| Err(WorkError::Service("upstream 500".to_string())))
            .arc();
        let panicking = FakeEntry::new(profile("panicking"))
            .executing(|_| panic!("boom"))
            .arc();

        let mut pool = WorkPool::new("test");
        pool.spawn("ok", ok, ctx(), Duration::from_secs(5));
        pool.spawn("failing", failing, ctx(), Duration::from_secs(5));
        pool.spawn("panicking", panicking, ctx(), Duration::from_secs(5));
        assert_eq!(pool.len(), 3);

        let mut finished = pool.drain();
        finished.sort_by_key(|f| f.tag);
        assert!(pool.is_empty());

        assert!(matches!(finished[0].outcome, ExecutionOutcome::Errored(WorkError::Service(_))));
        assert!(finished[1].outcome.is_success());
        assert_eq!(finished[2].outcome, ExecutionOutcome::Panicked("boom".to_string()));
    }

    #[test]
    fn slow_worker_times_out_without_blocking_the_pool() {
        let slow = FakeEntry::new(profile("slow"))
            .executing(|_| {
                thread::sleep(Duration::from_millis(500));
                Ok(WorkResult::succeeded(1))
            })
            .arc();
        let fast = FakeEntry::new(profile("fast")).arc();

        let mut pool = WorkPool::new("test");
        let started = Instant::now();
        pool.spawn("slow", slow, ctx(), Duration::from_millis(50));
        pool.spawn("fast", fast, ctx(), Duration::from_secs(5));

        let first = pool.next().unwrap();
        assert_eq!(first.tag, "fast");
        let second = pool.next().unwrap();
        assert_eq!(second.tag, "slow");
        assert!(matches!(second.outcome, ExecutionOutcome::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(pool.next().is_none());
    }

    #[test]
    fn late_result_goes_to_the_late_handler() {
        let slow = FakeEntry::new(profile("slow"))
            .executing(|_| {
                thread::sleep(Duration::from_millis(200));
                Ok(WorkResult::succeeded(3))
            })
            .arc();

        let (late_tx, late_rx) = mpsc::channel();
        let mut pool = WorkPool::new("test");
        pool.spawn_with_late_handler(
            "slow",
            slow,
            ctx(),
            Duration::from_millis(20),
            Box::new(move |outcome, elapsed| {
                let _ = late_tx.send((outcome, elapsed));
            }),
        );

        let timed_out = pool.next().unwrap();
        assert!(matches!(timed_out.outcome, ExecutionOutcome::TimedOut(_)));
        assert!(pool.is_empty());

        let (outcome, elapsed) = late_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Finished(WorkResult::succeeded(3)));
        assert!(elapsed >= Duration::from_millis(200));
    }

    #[test]
    fn attempt_finishing_in_time_never_reaches_the_late_handler() {
        let fast = FakeEntry::new(profile("fast")).arc();
        let called = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkPool::new("test");
        let late_calls = called.clone();
        pool.spawn_with_late_handler(
            "fast",
            fast,
            ctx(),
            Duration::from_secs(5),
            Box::new(move |_, _| {
                late_calls.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(pool.next().unwrap().outcome.is_success());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn eligibility_results_keep_input_order() {
        let entries: Vec<(Arc<dyn WorkCatalogEntry>, WorkContext)> = (0..7)
            .map(|i| {
                let entry = FakeEntry::new(profile(&format!("e{i}")));
                let entry = if i % 2 == 0 { entry } else { entry.ineligible() };
                (entry.arc() as Arc<dyn WorkCatalogEntry>, ctx())
            })
            .collect();

        let results = check_eligibility(&entries, 3);
        let flags: Vec<bool> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(flags, vec![true, false, true, false, true, false, true]);
    }

    #[test]
    fn panicking_eligibility_check_is_an_error() {
        struct Exploding {
            profile: WorkProfile,
            calls: AtomicUsize,
        }
        impl WorkCatalogEntry for Exploding {
            fn profile(&self) -> &WorkProfile {
                &self.profile
            }
            fn is_eligible(&self, _ctx: &WorkContext) -> Result<bool, WorkError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                panic!("signal table missing")
            }
            fn execute(&self, _ctx: &WorkContext) -> Result<WorkResult, WorkError> {
                Ok(WorkResult::succeeded(0))
            }
        }

        let entry: Arc<dyn WorkCatalogEntry> = Arc::new(Exploding {
            profile: profile("exploding"),
            calls: AtomicUsize::new(0),
        });
        let results = check_eligibility(&[(entry.clone(), ctx()), (entry, ctx())], 2);
        assert!(results.iter().all(|r| matches!(r, Err(WorkError::Internal(_)))));
    }
}
