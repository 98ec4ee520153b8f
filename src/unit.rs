//! Unit scheduler — process-wide admission of message work.
//!
//! Every message in the fabric carries a [`Unit`]: a monotonically numbered
//! token issued by the [`Scheduler`]. The scheduler counts issued-but-
//! unfinished units and cooperatively slows producers down once the count
//! exceeds the high-water mark. Nothing is ever dropped or force-finished;
//! backpressure is the only mechanism.
//!
//! The scheduler is an explicitly constructed object handed to crane and
//! terminal constructors. It is cheap to clone (one `Arc`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::UNITS_IN_FLIGHT;

/// Tuning knobs for unit admission and leak diagnostics.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Issued-but-unfinished units above which producers are slowed.
    pub high_water: i64,
    /// Base delay applied per unit of overload once above the mark.
    pub slowdown_step: Duration,
    /// How often the leak sweeper reports.
    pub sweep_interval: Duration,
    /// Age at which an unfinished unit counts as a suspected leak.
    pub leak_age: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            high_water: 10_000,
            slowdown_step: Duration::from_millis(1),
            sweep_interval: Duration::from_secs(60),
            leak_age: Duration::from_secs(120),
        }
    }
}

/// Slowdown is proportional to overload but bounded, so a burst cannot turn
/// admission into a stall.
const MAX_SLOWDOWN_FACTOR: u32 = 50;

#[derive(Debug)]
struct Origin {
    source: String,
    issued_at: std::time::Instant,
}

#[derive(Debug)]
struct Shared {
    next_id: AtomicU64,
    in_flight: AtomicI64,
    tracking: AtomicBool,
    origins: Mutex<HashMap<u64, Origin>>,
    cfg: SchedulerConfig,
}

/// Issues and accounts [`Unit`]s. Clone freely; all clones share state.
#[derive(Debug, Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                in_flight: AtomicI64::new(0),
                tracking: AtomicBool::new(false),
                origins: Mutex::new(HashMap::new()),
                cfg,
            }),
        }
    }

    /// Allocate a work token.
    ///
    /// Never fails and never drops. Under steady state this returns
    /// immediately; above the high-water mark the caller is held back for a
    /// delay proportional to the overload.
    pub async fn new_unit(&self) -> Unit {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let in_flight = shared.in_flight.fetch_add(1, Ordering::AcqRel) + 1;

        let excess = in_flight - shared.cfg.high_water;
        if excess > 0 {
            let high_water = shared.cfg.high_water.max(1);
            let factor = ((excess / high_water) as u32 + 1).min(MAX_SLOWDOWN_FACTOR);
            tokio::time::sleep(shared.cfg.slowdown_step * factor).await;
        }

        Unit {
            id,
            high_priority: false,
            finished: false,
            shared: Arc::clone(shared),
        }
    }

    /// Allocate a work token without the cooperative slowdown. Teardown and
    /// control messages must not be throttled by the very pressure they are
    /// trying to resolve.
    pub fn new_unit_now(&self) -> Unit {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        Unit {
            id,
            high_priority: false,
            finished: false,
            shared: Arc::clone(shared),
        }
    }

    /// Turn on origin recording for leak diagnostics.
    pub fn enable_leak_tracking(&self) {
        self.shared.tracking.store(true, Ordering::Release);
    }

    /// Currently issued-but-unfinished units.
    pub fn outstanding(&self) -> i64 {
        self.shared.in_flight.load(Ordering::Acquire).max(0)
    }

    /// Tracked units older than `age`, with their recorded sources.
    /// Only units registered via [`Unit::debug`] appear here.
    pub fn outstanding_older_than(&self, age: Duration) -> Vec<(u64, String)> {
        let origins = self.shared.origins.lock().expect("origins lock poisoned");
        origins
            .iter()
            .filter(|(_, o)| o.issued_at.elapsed() >= age)
            .map(|(id, o)| (*id, o.source.clone()))
            .collect()
    }

    /// Spawn the leak sweeper: periodically reports suspected leaks and the
    /// in-flight gauge. Never force-finishes a unit.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let interval = scheduler.shared.cfg.sweep_interval;
            let leak_age = scheduler.shared.cfg.leak_age;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                metrics::gauge!(UNITS_IN_FLIGHT).set(scheduler.outstanding() as f64);

                let stale = scheduler.outstanding_older_than(leak_age);
                if stale.is_empty() {
                    debug!(
                        in_flight = scheduler.outstanding(),
                        "unit sweeper: no suspected leaks"
                    );
                    continue;
                }
                for (id, source) in stale {
                    warn!(unit = id, %source, "unit sweeper: unit outstanding past leak age");
                }
            }
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// A single admitted piece of work. Finished exactly once: `finish` consumes
/// the token, so a second finish does not compile. A unit dropped without
/// `finish` is reclaimed for accounting and flagged in debug builds.
#[derive(Debug)]
pub struct Unit {
    id: u64,
    high_priority: bool,
    finished: bool,
    shared: Arc<Shared>,
}

impl Unit {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn make_high_priority(&mut self) {
        self.high_priority = true;
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    /// Record where this unit came from, for the leak sweeper. No-op unless
    /// [`Scheduler::enable_leak_tracking`] was called. Repeated calls update
    /// the source.
    pub fn debug(&self, source: impl Into<String>) {
        if !self.shared.tracking.load(Ordering::Acquire) {
            return;
        }
        let mut origins = self.shared.origins.lock().expect("origins lock poisoned");
        origins.insert(
            self.id,
            Origin {
                source: source.into(),
                issued_at: std::time::Instant::now(),
            },
        );
    }

    /// Signal the scheduler that this unit's processing is complete.
    pub fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        if self.shared.tracking.load(Ordering::Acquire) {
            let mut origins = self.shared.origins.lock().expect("origins lock poisoned");
            origins.remove(&self.id);
        }
    }
}

impl Drop for Unit {
    fn drop(&mut self) {
        if !self.finished {
            #[cfg(debug_assertions)]
            warn!(unit = self.id, "unit dropped without finish");
            self.complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> SchedulerConfig {
        SchedulerConfig {
            high_water: 4,
            slowdown_step: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(50),
            leak_age: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn units_are_monotonically_numbered() {
        let sched = Scheduler::default();
        let a = sched.new_unit().await;
        let b = sched.new_unit().await;
        assert!(b.id() > a.id());
        a.finish();
        b.finish();
    }

    #[tokio::test]
    async fn finish_returns_counter_to_zero() {
        let sched = Scheduler::default();
        let a = sched.new_unit().await;
        let b = sched.new_unit().await;
        assert_eq!(sched.outstanding(), 2);
        a.finish();
        b.finish();
        assert_eq!(sched.outstanding(), 0);
    }

    #[tokio::test]
    async fn drop_without_finish_still_reclaims_accounting() {
        let sched = Scheduler::default();
        {
            let _leaked = sched.new_unit().await;
        }
        assert_eq!(sched.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn admission_slows_under_pressure() {
        let sched = Scheduler::new(quick_config());
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(sched.new_unit().await);
        }

        // Above the mark: the next admission must take at least one step.
        let before = tokio::time::Instant::now();
        held.push(sched.new_unit().await);
        assert!(before.elapsed() >= Duration::from_millis(10));

        for unit in held {
            unit.finish();
        }
    }

    #[tokio::test]
    async fn steady_state_admission_is_immediate() {
        let sched = Scheduler::new(quick_config());
        let unit = sched.new_unit().await;
        assert_eq!(sched.outstanding(), 1);
        unit.finish();
    }

    #[tokio::test]
    async fn leak_tracking_reports_sources() {
        let sched = Scheduler::new(quick_config());
        sched.enable_leak_tracking();

        let unit = sched.new_unit().await;
        unit.debug("crane test rig");

        let stale = sched.outstanding_older_than(Duration::ZERO);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].1, "crane test rig");

        unit.finish();
        assert!(sched.outstanding_older_than(Duration::ZERO).is_empty());
    }

    #[tokio::test]
    async fn priority_mark_is_per_unit() {
        let sched = Scheduler::default();
        let mut a = sched.new_unit().await;
        let b = sched.new_unit().await;
        a.make_high_priority();
        assert!(a.is_high_priority());
        assert!(!b.is_high_priority());
        a.finish();
        b.finish();
    }
}
