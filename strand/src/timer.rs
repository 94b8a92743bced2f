//! Deadline timers.
//!
//! A [`TimerManager`] keeps timers ordered by absolute deadline (milliseconds on its
//! [`Clock`]), ties broken by timer id. The reactor bounds its wait with
//! [`TimerManager::next_timeout`] and drains due callbacks with
//! [`TimerManager::collect_expired`]; the callbacks themselves run as ordinary scheduled tasks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;
use metrics::counter;
use parking_lot::{Mutex, RwLock};

/// A backwards clock jump larger than this is treated as a rollback.
const ROLLOVER_TOLERANCE_MS: u64 = 60 * 60 * 1000;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Millisecond time source for a [`TimerManager`].
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;

    /// Base for new deadlines. Rounding up keeps a timer from firing before its full delay
    /// has passed on a clock finer than a millisecond.
    fn now_ms_ceil(&self) -> u64 {
        self.now_ms()
    }
}

/// Wall-clock milliseconds since the Unix epoch. It can jump backwards, which the manager
/// detects and recovers from.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn now_ms_ceil(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().div_ceil(1_000_000) as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct TimerState {
    next: u64,
    period: u64,
    recurring: bool,
    /// `None` once the timer fired for the last time or was cancelled.
    callback: Option<TimerCallback>,
}

struct TimerEntry {
    id: u64,
    // Only locked while holding the manager's write lock.
    state: Mutex<TimerState>,
}

struct TimerSet {
    queue: BTreeMap<(u64, u64), Arc<TimerEntry>>,
    /// Set once the front hook fired, cleared when the reactor asks for the next deadline.
    tickled: bool,
    previous: u64,
}

struct Inner {
    clock: Arc<dyn Clock>,
    timers: RwLock<TimerSet>,
    front_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

pub struct TimerManager {
    inner: Arc<Inner>,
}

/// Handle to a scheduled timer.
#[derive(Clone)]
pub struct Timer {
    entry: Arc<TimerEntry>,
    manager: Weak<Inner>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let previous = clock.now_ms();
        Self {
            inner: Arc::new(Inner {
                clock,
                timers: RwLock::new(TimerSet {
                    queue: BTreeMap::new(),
                    tickled: false,
                    previous,
                }),
                front_hook: OnceLock::new(),
            }),
        }
    }

    /// Installs the callback run when a timer becomes the earliest deadline, so a blocked
    /// wait can be cut short. Only the first installation takes effect.
    pub fn on_timer_inserted_at_front<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let _ = self.inner.front_hook.set(Box::new(hook));
    }

    pub fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    pub fn add_timer<F>(&self, delay: Duration, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let period = millis(delay);
        let entry = Arc::new(TimerEntry {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TimerState {
                next: self.inner.clock.now_ms_ceil().saturating_add(period),
                period,
                recurring,
                callback: Some(Arc::new(callback)),
            }),
        });
        self.inner.insert(entry.clone());
        Timer {
            entry,
            manager: Arc::downgrade(&self.inner),
        }
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs while `condition` can
    /// still be upgraded.
    pub fn add_condition_timer<F, T>(
        &self,
        delay: Duration,
        callback: F,
        condition: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            delay,
            move || {
                if condition.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Absolute deadline of the earliest pending timer, `None` when there is none.
    pub fn next_deadline(&self) -> Option<u64> {
        let mut set = self.inner.timers.write();
        set.tickled = false;
        set.queue.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Time left until the earliest deadline (zero if overdue), `None` when nothing is pending.
    pub fn next_timeout(&self) -> Option<Duration> {
        let deadline = self.next_deadline()?;
        let now = self.now_ms();
        Some(Duration::from_millis(deadline.saturating_sub(now)))
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.timers.read().queue.is_empty()
    }

    /// Moves every due callback into `out`. Recurring timers are re-armed one period after
    /// their previous deadline. If the clock jumped backwards past the tolerance, every timer
    /// counts as due and recurring ones are re-armed from the new time.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = self.now_ms();
        {
            let set = self.inner.timers.read();
            if set.queue.is_empty() {
                return;
            }
        }

        let mut set = self.inner.timers.write();
        let rollover = now < set.previous.saturating_sub(ROLLOVER_TOLERANCE_MS);
        set.previous = now;
        if rollover {
            warn!("clock moved backwards; firing all {} timers", set.queue.len());
        }

        let due = match set.queue.keys().next() {
            Some(&(deadline, _)) => rollover || deadline <= now,
            None => false,
        };
        if !due {
            return;
        }

        let expired = if rollover {
            std::mem::take(&mut set.queue)
        } else {
            let later = set.queue.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut set.queue, later)
        };

        out.reserve(expired.len());
        let mut fired = 0;
        for (_, entry) in expired {
            let mut state = entry.state.lock();
            let Some(callback) = state.callback.clone() else {
                continue;
            };
            out.push(callback);
            fired += 1;
            if state.recurring {
                state.next = if rollover {
                    now.saturating_add(state.period)
                } else {
                    state.next.saturating_add(state.period)
                };
                let key = (state.next, entry.id);
                drop(state);
                set.queue.insert(key, entry);
            } else {
                state.callback = None;
            }
        }
        counter!("strand_timers_fired_total").increment(fired);
    }
}

/// Whole milliseconds of `d`, saturating at `u64::MAX`.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.inner.timers.read().queue.len())
            .finish()
    }
}

impl Inner {
    fn insert(&self, entry: Arc<TimerEntry>) {
        let at_front = {
            let mut set = self.timers.write();
            let key = (entry.state.lock().next, entry.id);
            set.queue.insert(key, entry);
            let first = set.queue.keys().next() == Some(&key);
            let at_front = first && !set.tickled;
            if at_front {
                set.tickled = true;
            }
            at_front
        };
        if at_front {
            if let Some(hook) = self.front_hook.get() {
                hook();
            }
        }
    }
}

impl Timer {
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    /// Removes the timer; `false` if it already fired for good or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.timers.write();
        let mut state = self.entry.state.lock();
        if state.callback.take().is_none() {
            return false;
        }
        set.queue.remove(&(state.next, self.entry.id));
        true
    }

    /// Re-arms the timer one period from now.
    pub fn refresh(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.timers.write();
        let mut state = self.entry.state.lock();
        if state.callback.is_none() {
            return false;
        }
        if set.queue.remove(&(state.next, self.entry.id)).is_none() {
            return false;
        }
        state.next = manager.clock.now_ms_ceil().saturating_add(state.period);
        set.queue.insert((state.next, self.entry.id), self.entry.clone());
        true
    }

    /// Changes the period. With `from_now` the new period counts from now, otherwise from the
    /// timer's previous start.
    pub fn reset(&self, period: Duration, from_now: bool) -> bool {
        let period = millis(period);
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        {
            let mut set = manager.timers.write();
            let mut state = self.entry.state.lock();
            if state.callback.is_none() {
                return false;
            }
            if period == state.period && !from_now {
                return true;
            }
            if set.queue.remove(&(state.next, self.entry.id)).is_none() {
                return false;
            }
            let start = if from_now {
                manager.clock.now_ms_ceil()
            } else {
                state.next.saturating_sub(state.period)
            };
            state.period = period;
            state.next = start.saturating_add(period);
        }
        manager.insert(self.entry.clone());
        true
    }

    /// Absolute deadline, `None` once the timer is spent or cancelled.
    pub fn deadline(&self) -> Option<u64> {
        let state = self.entry.state.lock();
        state.callback.as_ref().map(|_| state.next)
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.entry.id)
            .field("deadline", &self.deadline())
            .finish()
    }
}
