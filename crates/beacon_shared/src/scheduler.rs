//! Tick-basierte Ablaufsteuerung und eine manuell vorgestellte Uhr.
//!
//! Negotiation hooks that want to answer "later" register a closure with the
//! [`TickScheduler`]; the closure runs in the `run_due` phase of the tick it
//! was scheduled for. [`ManualClock`] lets tests advance time deterministically.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send>;

struct Scheduled {
    due: u64,
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct SchedulerState {
    current: u64,
    next_seq: u64,
    tasks: Vec<Scheduled>,
}

/// Shared queue of closures keyed by tick number.
#[derive(Clone, Default)]
pub struct TickScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl fmt::Debug for TickScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TickScheduler")
            .field("current", &state.current)
            .field("pending", &state.tasks.len())
            .finish()
    }
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advances the tick counter. Called once at the start of every tick.
    pub fn begin_tick(&self) -> u64 {
        let mut state = self.lock();
        state.current += 1;
        state.current
    }

    pub fn current_tick(&self) -> u64 {
        self.lock().current
    }

    /// Runs `task` during the `run_due` phase `ticks` ticks from now.
    /// `ticks == 0` runs it in the current tick's `run_due` phase.
    pub fn defer(&self, ticks: u64, task: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        let due = state.current + ticks;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.push(Scheduled {
            due,
            seq,
            task: Box::new(task),
        });
    }

    /// Shorthand for `defer(1, task)`.
    pub fn next_tick(&self, task: impl FnOnce() + Send + 'static) {
        self.defer(1, task);
    }

    pub fn pending(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Runs every task whose tick has come, in scheduling order.
    ///
    /// Tasks run without the internal lock held, so they may schedule more work.
    pub fn run_due(&self) -> usize {
        let mut due = {
            let mut state = self.lock();
            let current = state.current;
            let (ready, waiting): (Vec<_>, Vec<_>) =
                state.tasks.drain(..).partition(|task| task.due <= current);
            state.tasks = waiting;
            ready
        };
        due.sort_by_key(|task| (task.due, task.seq));
        let count = due.len();
        for scheduled in due {
            (scheduled.task)();
        }
        count
    }
}

/// Clock whose time only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset_ms: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::Relaxed))
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.offset_ms.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_tasks_run_on_their_tick_in_order() {
        let scheduler = TickScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.begin_tick();
        for (ticks, label) in [(2, "b"), (1, "a"), (2, "c")] {
            let log = Arc::clone(&log);
            scheduler.defer(ticks, move || log.lock().unwrap().push(label));
        }
        assert_eq!(scheduler.run_due(), 0);

        scheduler.begin_tick();
        assert_eq!(scheduler.run_due(), 1);
        scheduler.begin_tick();
        assert_eq!(scheduler.run_due(), 2);

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn task_may_schedule_more_work() {
        let scheduler = TickScheduler::new();
        let hits = Arc::new(AtomicU64::new(0));

        let inner = scheduler.clone();
        let counter = Arc::clone(&hits);
        scheduler.defer(0, move || {
            counter.fetch_add(1, Ordering::Relaxed);
            let counter = Arc::clone(&counter);
            inner.next_tick(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        });

        scheduler.run_due();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        scheduler.begin_tick();
        scheduler.run_due();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.clone().advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }
}
