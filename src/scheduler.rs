// Scheduler module - owns the recurring timers
//
// One Tokio task per scheduled entity drives a fixed-rate interval timer.
// Every tick's work is spawned as its own task, so a slow provider call
// never delays the next tick of this or any other entity.
//
// # Architecture
// - At most one live timer per entity ID; re-scheduling replaces it
// - Stopping cancels future ticks only, an in-flight tick runs to completion
// - A panicking tick is logged and the timer keeps firing

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::BridgeError;

/// Work performed on every tick; owns its own error handling
pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a `TickFn`
pub fn tick_fn<F, Fut>(f: F) -> TickFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

const UNSET: i64 = i64::MIN;

/// Wall-clock bookkeeping shared with the timer task
#[derive(Debug)]
struct Timing {
    next_run_millis: AtomicI64,
    last_run_millis: AtomicI64,
}

impl Timing {
    fn new(first_run: DateTime<Utc>) -> Self {
        Timing {
            next_run_millis: AtomicI64::new(first_run.timestamp_millis()),
            last_run_millis: AtomicI64::new(UNSET),
        }
    }

    fn record_tick(&self, interval: Duration) {
        let now = Utc::now();
        let next = chrono::Duration::from_std(interval)
            .map(|interval| (now + interval).timestamp_millis())
            .unwrap_or(UNSET);

        self.last_run_millis.store(now.timestamp_millis(), Ordering::Relaxed);
        self.next_run_millis.store(next, Ordering::Relaxed);
    }

    fn load(value: &AtomicI64) -> Option<DateTime<Utc>> {
        match value.load(Ordering::Relaxed) {
            UNSET => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }
}

/// Add a wall-clock offset, tolerating durations chrono cannot represent
fn after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}

struct ScheduleEntry {
    initial_delay: Duration,
    interval: Duration,
    cancel: CancellationToken,
    timing: Arc<Timing>,
}

/// Snapshot of one entity's timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleInfo {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
}

/// Recurring timers keyed by entity ID
///
/// Must be used from within a Tokio runtime: `schedule` spawns the timer
/// task on the current runtime. Dropping the scheduler cancels every timer.
pub struct Scheduler {
    name: String,
    entries: DashMap<String, ScheduleEntry>,
    root: CancellationToken,
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Scheduler {
            name: name.into(),
            entries: DashMap::new(),
            root: CancellationToken::new(),
        }
    }

    /// Registers and starts a fixed-rate timer for `entity_id`
    ///
    /// An existing timer for the same entity is cancelled first, so the
    /// latest call's delay and interval win.
    ///
    /// # Errors
    /// * `BridgeError::Configuration` - `interval` is zero
    pub fn schedule(
        &self,
        entity_id: &str,
        initial_delay: Duration,
        interval: Duration,
        tick: TickFn,
    ) -> Result<(), BridgeError> {
        if interval.is_zero() {
            return Err(BridgeError::config(format!(
                "Interval for '{}' must be positive",
                entity_id
            )));
        }

        // The first deadline and the one after it must be representable
        let start = Instant::now()
            .checked_add(initial_delay)
            .filter(|start| start.checked_add(interval).is_some())
            .ok_or_else(|| {
                BridgeError::config(format!(
                    "Schedule for '{}' is out of range (delay {:?}, interval {:?})",
                    entity_id, initial_delay, interval
                ))
            })?;

        let cancel = self.root.child_token();
        let timing = Arc::new(Timing::new(after(initial_delay)));

        let entry = ScheduleEntry {
            initial_delay,
            interval,
            cancel: cancel.clone(),
            timing: Arc::clone(&timing),
        };

        if let Some(previous) = self.entries.insert(entity_id.to_string(), entry) {
            previous.cancel.cancel();
            debug!("[{}] Replaced existing timer for '{}'", self.name, entity_id);
        }

        info!(
            "[{}] Scheduling '{}' every {:?} (first run in {:?})",
            self.name, entity_id, interval, initial_delay
        );

        tokio::spawn(Self::run_timer(
            entity_id.to_string(),
            start,
            interval,
            cancel,
            timing,
            tick,
        ));

        Ok(())
    }

    /// Timer loop for one entity
    ///
    /// `MissedTickBehavior::Burst` keeps the cadence anchored to the first
    /// tick: the next tick is due at `last_due + interval` no matter how long
    /// the previous tick took.
    async fn run_timer(
        entity_id: String,
        start: Instant,
        interval: Duration,
        cancel: CancellationToken,
        timing: Arc<Timing>,
        tick: TickFn,
    ) {
        let mut timer = interval_at(start, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Timer for '{}' cancelled", entity_id);
                    break;
                }

                _ = timer.tick() => {
                    timing.record_tick(interval);

                    let tick = Arc::clone(&tick);
                    let entity_id = entity_id.clone();
                    tokio::spawn(async move {
                        let run = AssertUnwindSafe(async move { tick().await });
                        if run.catch_unwind().await.is_err() {
                            error!("Scheduled tick for '{}' panicked", entity_id);
                        }
                    });
                }
            }
        }
    }

    /// Cancels and removes the entity's timer; false if none was active
    pub fn stop(&self, entity_id: &str) -> bool {
        match self.entries.remove(entity_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                info!("[{}] Stopped schedule for '{}'", self.name, entity_id);
                true
            }
            None => {
                debug!("[{}] No schedule for '{}' to stop", self.name, entity_id);
                false
            }
        }
    }

    /// Cancels every timer; returns how many were stopped
    pub fn stop_all(&self) -> usize {
        let ids = self.scheduled_ids();
        let stopped = ids.iter().filter(|id| self.stop(id)).count();
        if stopped > 0 {
            info!("[{}] Stopped {} schedule(s)", self.name, stopped);
        }
        stopped
    }

    pub fn is_scheduled(&self, entity_id: &str) -> bool {
        self.entries.contains_key(entity_id)
    }

    pub fn schedule_info(&self, entity_id: &str) -> Option<ScheduleInfo> {
        self.entries.get(entity_id).map(|entry| ScheduleInfo {
            initial_delay: entry.initial_delay,
            interval: entry.interval,
            next_run: Timing::load(&entry.timing.next_run_millis),
            last_run: Timing::load(&entry.timing.last_run_millis),
        })
    }

    /// Scheduled entity IDs in sorted order
    pub fn scheduled_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::time::sleep;

    fn counting_tick(counter: &Arc<AtomicUsize>) -> TickFn {
        let counter = Arc::clone(counter);
        tick_fn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay_then_fixed_rate() {
        let scheduler = Scheduler::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule("p1", Duration::from_secs(10), Duration::from_secs(5), counting_tick(&count))
            .unwrap();

        sleep(Duration::from_secs(9)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // ticks at 10s, 15s, 20s
        sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        let info = scheduler.schedule_info("p1").unwrap();
        assert_eq!(info.interval, Duration::from_secs(5));
        assert!(info.last_run.is_some());
        assert!(info.next_run.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_timer() {
        let scheduler = Scheduler::new("test");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule("p1", Duration::from_secs(5), Duration::from_secs(5), counting_tick(&first))
            .unwrap();
        scheduler
            .schedule("p1", Duration::from_secs(20), Duration::from_secs(20), counting_tick(&second))
            .unwrap();

        sleep(Duration::from_secs(21)).await;

        assert_eq!(scheduler.len(), 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(
            scheduler.schedule_info("p1").unwrap().interval,
            Duration::from_secs(20)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_future_ticks() {
        let scheduler = Scheduler::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        assert!(!scheduler.stop("unknown-id"));

        scheduler
            .schedule("p1", Duration::ZERO, Duration::from_secs(5), counting_tick(&count))
            .unwrap();
        sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(scheduler.stop("p1"));
        assert!(!scheduler.is_scheduled("p1"));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_interrupt_in_flight_tick() {
        let scheduler = Scheduler::new("test");
        let finished = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        let tick = tick_fn(move || {
            let flag = Arc::clone(&flag);
            async move {
                sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
            }
        });

        scheduler
            .schedule("slow", Duration::from_secs(1), Duration::from_secs(60), tick)
            .unwrap();
        sleep(Duration::from_secs(2)).await;
        scheduler.stop("slow");

        sleep(Duration::from_secs(20)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_keeps_timer_alive() {
        let scheduler = Scheduler::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let tick = tick_fn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("provider blew up");
            }
        });

        scheduler
            .schedule("p1", Duration::ZERO, Duration::from_secs(5), tick)
            .unwrap();
        sleep(Duration::from_secs(11)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_scheduled("p1"));
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let scheduler = Scheduler::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        let err = scheduler
            .schedule("p1", Duration::ZERO, Duration::ZERO, counting_tick(&count))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_unrepresentable_delay_rejected() {
        let scheduler = Scheduler::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        let err = scheduler
            .schedule(
                "p1",
                Duration::from_secs(u64::MAX),
                Duration::from_secs(10),
                counting_tick(&count),
            )
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(!scheduler.is_scheduled("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all() {
        let scheduler = Scheduler::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        for id in ["a", "b", "c"] {
            scheduler
                .schedule(id, Duration::from_secs(1), Duration::from_secs(1), counting_tick(&count))
                .unwrap();
        }
        assert_eq!(scheduler.scheduled_ids(), vec!["a", "b", "c"]);

        assert_eq!(scheduler.stop_all(), 3);
        assert!(scheduler.is_empty());

        sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
