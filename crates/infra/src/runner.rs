use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use conductor_engine::{Conductor, ConductorCycleResult};

/// Most recent cycle result, shared between the runner and the API.
#[derive(Debug, Clone, Default)]
pub struct LastCycle {
    inner: Arc<RwLock<Option<ConductorCycleResult>>>,
}

impl LastCycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<ConductorCycleResult> {
        self.inner.read().ok().and_then(|r| r.clone())
    }

    pub fn set(&self, result: ConductorCycleResult) {
        match self.inner.write() {
            Ok(mut guard) => *guard = Some(result),
            Err(poisoned) => *poisoned.into_inner() = Some(result),
        }
    }
}

/// Config for the periodic conductor runner.
#[derive(Debug, Clone)]
pub struct ConductorRunner {
    pub interval: Duration,
    /// Run one cycle immediately instead of waiting a full interval.
    pub run_on_start: bool,
}

impl Default for ConductorRunner {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            run_on_start: true,
        }
    }
}

/// Handle for the running conductor thread (shutdown + trigger hook).
#[derive(Debug)]
pub struct ConductorRunnerHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    last: LastCycle,
    join: Option<thread::JoinHandle<()>>,
}

impl ConductorRunnerHandle {
    /// Request an out-of-band cycle.
    ///
    /// Triggers are coalesced: while one is pending, further calls are no-ops.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    pub fn last_result(&self) -> Option<ConductorCycleResult> {
        self.last.get()
    }

    /// Stop the runner and wait for an in-progress cycle to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl ConductorRunner {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Spawn the runner thread.
    ///
    /// - Schedule: one cycle every `interval`, on a stable cadence
    /// - Trigger: `handle.trigger()` runs a cycle as soon as the current one ends
    /// - Failures: a panicking cycle is logged and the loop keeps going
    pub fn spawn<C>(&self, name: &'static str, conductor: Arc<C>, last: LastCycle) -> io::Result<ConductorRunnerHandle>
    where
        C: Conductor + ?Sized + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);

        let cfg = self.clone();
        let shared = last.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runner_loop(name, cfg, shutdown_rx, trigger_rx, conductor, shared))?;

        Ok(ConductorRunnerHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            last,
            join: Some(join),
        })
    }
}

fn runner_loop<C>(
    name: &'static str,
    cfg: ConductorRunner,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    conductor: Arc<C>,
    last: LastCycle,
) where
    C: Conductor + ?Sized,
{
    info!(runner = name, interval_ms = cfg.interval.as_millis() as u64, "conductor runner started");

    let mut next_tick = Instant::now() + cfg.interval;
    let mut pending = cfg.run_on_start;

    loop {
        // Shutdown has priority; a dropped handle also stops the runner.
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            // Keep a stable cadence even if a cycle overran.
            while next_tick <= now {
                next_tick += cfg.interval;
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if !pending {
            let sleep_for = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(250));
            thread::sleep(sleep_for);
            continue;
        }

        pending = false;

        match panic::catch_unwind(AssertUnwindSafe(|| conductor.run_cycle())) {
            Ok(result) => last.set(result),
            Err(_) => error!(runner = name, "conductor cycle panicked"),
        }
    }

    info!(runner = name, "conductor runner stopped");
}
