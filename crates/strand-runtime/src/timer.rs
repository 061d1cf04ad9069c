//! Deadline-ordered timers
//!
//! A [`TimerManager`] keeps pending timers in a set ordered by absolute
//! deadline (ties broken by a unique id, so no two timers compare equal).
//! Deadlines use the wall clock; a backward jump of more than an hour is
//! treated as clock rollover and flushes every pending timer.
//!
//! Whenever an insertion lands at the head of the set, the manager invokes
//! its front-insert notifier exactly once until the next
//! [`next_timeout_ms`](TimerManager::next_timeout_ms) call re-arms the
//! latch. [`IoManager`](crate::io::IoManager) uses this to tickle a worker
//! blocked in epoll with a stale timeout.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, SystemTime};

/// Callback fired on expiry. Shared so a recurring timer fires repeatedly.
pub type TimerFn = Arc<dyn Fn() + Send + Sync + 'static>;

type ClockFn = Box<dyn Fn() -> SystemTime + Send + Sync>;
type NotifyFn = Box<dyn Fn() + Send + Sync>;

/// Backward clock jump beyond this window counts as rollover.
const ROLLOVER_WINDOW: Duration = Duration::from_secs(60 * 60);

struct TimerSlot {
    period_ms: u64,
    recurring: bool,
    cb: TimerFn,
}

struct TimerTable {
    /// Pending timers, ordered by (deadline, id).
    queue: BTreeMap<(SystemTime, u64), TimerSlot>,
    /// Current deadline of every live timer, keyed by id.
    deadlines: HashMap<u64, SystemTime>,
    /// Wall-clock reading of the previous rollover check.
    prev_now: SystemTime,
}

/// Manager of pending timers.
pub struct TimerManager {
    table: RwLock<TimerTable>,
    /// Front-insert wakeup latch: set when the notifier has fired and no
    /// `next_timeout_ms` has run since.
    tickled: AtomicBool,
    next_id: AtomicU64,
    notify: Option<NotifyFn>,
    clock: ClockFn,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager::with_hooks(None, Box::new(SystemTime::now))
    }

    /// Manager whose front-insertions invoke `notify`.
    pub(crate) fn with_notifier(notify: NotifyFn) -> TimerManager {
        TimerManager::with_hooks(Some(notify), Box::new(SystemTime::now))
    }

    /// Manager reading time from `clock` (used to test rollover).
    #[cfg(test)]
    fn with_clock(clock: ClockFn) -> TimerManager {
        TimerManager::with_hooks(None, clock)
    }

    fn with_hooks(notify: Option<NotifyFn>, clock: ClockFn) -> TimerManager {
        let now = clock();
        TimerManager {
            table: RwLock::new(TimerTable {
                queue: BTreeMap::new(),
                deadlines: HashMap::new(),
                prev_now: now,
            }),
            tickled: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            notify,
            clock,
        }
    }

    /// Add a timer firing `ms` milliseconds from now.
    pub fn add_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.add_timer_shared(ms, Arc::new(cb), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only fires
    /// while `cond` is still alive.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: &Arc<T>,
        recurring: bool,
    ) -> Timer {
        let cond = Arc::downgrade(cond);
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn add_timer_shared(self: &Arc<Self>, ms: u64, cb: TimerFn, recurring: bool) -> Timer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = (self.clock)() + Duration::from_millis(ms);
        let at_front = {
            let mut table = self.table.write().unwrap();
            table.deadlines.insert(id, deadline);
            table.queue.insert(
                (deadline, id),
                TimerSlot {
                    period_ms: ms,
                    recurring,
                    cb,
                },
            );
            self.landed_at_front(&table, (deadline, id))
        };
        if at_front {
            self.notify_front();
        }
        Timer {
            id,
            manager: Arc::downgrade(self),
        }
    }

    /// Milliseconds until the earliest deadline: `None` when no timer is
    /// pending, `Some(0)` when the head is overdue. Also re-arms the
    /// front-insert wakeup latch.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        self.tickled.store(false, Ordering::Release);
        let table = self.table.read().unwrap();
        let (deadline, _) = table.queue.keys().next()?;
        let now = (self.clock)();
        Some(match deadline.duration_since(now) {
            Ok(left) => left.as_millis() as u64,
            Err(_) => 0,
        })
    }

    /// Append the callbacks of every expired timer to `out` (every pending
    /// timer, if the clock rolled back). Recurring timers re-arm at
    /// `now + period`; one-shot timers are dropped.
    pub fn list_expired(&self, out: &mut Vec<TimerFn>) {
        let now = (self.clock)();
        let mut table = self.table.write().unwrap();

        let rollover = table
            .prev_now
            .checked_sub(ROLLOVER_WINDOW)
            .is_some_and(|edge| now < edge);
        table.prev_now = now;

        // Drain first, re-arm after: a recurring timer re-inserted mid-drain
        // would be popped again under rollover.
        let mut fired = Vec::new();
        while let Some((&(deadline, id), _)) = table.queue.first_key_value() {
            if !rollover && deadline > now {
                break;
            }
            let (_, slot) = table.queue.pop_first().unwrap();
            table.deadlines.remove(&id);
            fired.push((id, slot));
        }

        for (id, slot) in fired {
            out.push(slot.cb.clone());
            if slot.recurring {
                let next = now + Duration::from_millis(slot.period_ms);
                table.deadlines.insert(id, next);
                table.queue.insert((next, id), slot);
            }
        }
    }

    /// True while any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.table.read().unwrap().queue.is_empty()
    }

    /// True if `key` is the head of the queue and the wakeup latch was not
    /// already set; latches in that case. Caller holds the write lock.
    fn landed_at_front(&self, table: &TimerTable, key: (SystemTime, u64)) -> bool {
        table.queue.keys().next() == Some(&key) && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn notify_front(&self) {
        if let Some(notify) = &self.notify {
            notify();
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

/// Handle to a pending timer.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    manager: Weak<TimerManager>,
}

impl Timer {
    /// Remove the timer without firing it. False if it already fired, was
    /// cancelled, or the manager is gone.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut table = manager.table.write().unwrap();
        match table.deadlines.remove(&self.id) {
            Some(deadline) => {
                table.queue.remove(&(deadline, self.id));
                true
            }
            None => false,
        }
    }

    /// Push the deadline out to `now + period`. Never moves it earlier.
    pub fn refresh(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let now = (manager.clock)();
        let mut table = manager.table.write().unwrap();
        let Some(&deadline) = table.deadlines.get(&self.id) else {
            return false;
        };
        let slot = table
            .queue
            .remove(&(deadline, self.id))
            .expect("timer table out of sync");
        let next = (now + Duration::from_millis(slot.period_ms)).max(deadline);
        table.deadlines.insert(self.id, next);
        table.queue.insert((next, self.id), slot);
        true
    }

    /// Re-deadline with period `ms`, measured from now or from the timer's
    /// original start. False if the timer already fired or was cancelled.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let now = (manager.clock)();
        let at_front = {
            let mut table = manager.table.write().unwrap();
            let Some(&deadline) = table.deadlines.get(&self.id) else {
                return false;
            };
            let period = table.queue[&(deadline, self.id)].period_ms;
            if period == ms && !from_now {
                return true;
            }
            let mut slot = table
                .queue
                .remove(&(deadline, self.id))
                .expect("timer table out of sync");
            let start = if from_now {
                now
            } else {
                deadline - Duration::from_millis(slot.period_ms)
            };
            slot.period_ms = ms;
            let next = start + Duration::from_millis(ms);
            table.deadlines.insert(self.id, next);
            table.queue.insert((next, self.id), slot);
            manager.landed_at_front(&table, (next, self.id))
        };
        if at_front {
            manager.notify_front();
        }
        true
    }
}
