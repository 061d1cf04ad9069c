//! I/O manager: readiness-driven scheduling
//!
//! [`IoManager`] is a [`Scheduler`] whose idle loop blocks on an
//! edge-triggered epoll instance with a timeout bounded by the earliest
//! pending timer (and 5 seconds). Readiness and timer expiry both turn into
//! task submissions, so parked fibers and callbacks resume on whichever
//! worker dequeues them.
//!
//! Registrations are one-shot: when a direction fires, the runtime
//! deregisters it (reprogramming the other direction if still armed) and
//! schedules the stored fiber or callback. Re-arming takes a fresh
//! [`add_event`](IoManager::add_event).

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use strand_core::error::{RuntimeError, RuntimeResult};
use strand_core::event::Event;
use strand_core::state::FiberState;

use crate::fiber::{Fiber, FiberFn};
use crate::poller::{Poller, MAX_EVENTS};
use crate::scheduler::{self, Schedule, Scheduler, Task};
use crate::timer::{Timer, TimerManager};
use crate::tls;

/// Upper bound on one idle wait, so stop requests and freshly added timers
/// are observed even without a tickle.
const MAX_TIMEOUT_MS: u64 = 5000;

/// Resumption target for one direction of one fd: the scheduler to wake on,
/// and exactly one of a parked fiber or a callback.
#[derive(Default)]
struct EventContext {
    scheduler: Option<Weak<dyn Schedule>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

impl EventContext {
    fn reset(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

#[derive(Default)]
struct FdState {
    /// Directions currently registered with the kernel.
    events: Event,
    read: EventContext,
    write: EventContext,
}

/// Per-fd runtime state; lives at index `fd` of the context table.
struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    /// Fire one registered direction: clear its bit, schedule the stored
    /// fiber or callback on the stored scheduler, reset the slot.
    fn trigger(state: &mut FdState, event: Event) {
        debug_assert!(state.events.contains(event), "triggering unregistered event");
        state.events.remove(event);
        let slot = if event == Event::READ {
            &mut state.read
        } else {
            &mut state.write
        };
        let target = slot.scheduler.take().and_then(|weak| weak.upgrade());
        let fiber = slot.fiber.take();
        let cb = slot.cb.take();
        slot.reset();

        let Some(target) = target else {
            tracing::warn!(event = %event, "readiness target scheduler is gone");
            return;
        };
        if let Some(cb) = cb {
            target.submit(Task::call_boxed(cb));
        } else if let Some(fiber) = fiber {
            target.submit(Task::fiber(fiber));
        }
    }
}

/// A scheduler that also parks fibers on fd readiness and timers.
pub struct IoManager {
    sched: Scheduler,
    timers: Arc<TimerManager>,
    poller: Poller,
    /// Dense fd-indexed table, grown to ⌈fd·1.5⌉ on demand.
    contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Number of registered (fd, direction) pairs.
    pending: AtomicUsize,
}

impl IoManager {
    /// Build the manager and start its workers.
    ///
    /// Multiplexer setup failures abort; there is no runtime without one.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        let manager = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let loop_weak = weak.clone();
            let sched = Scheduler::build(
                threads,
                use_caller,
                name,
                Box::new(move || {
                    if let Some(m) = loop_weak.upgrade() {
                        scheduler::run(m, 0);
                    }
                }),
            );

            let timer_weak = weak.clone();
            let timers = Arc::new(TimerManager::with_notifier(Box::new(move || {
                if let Some(m) = timer_weak.upgrade() {
                    m.tickle();
                }
            })));

            let manager = IoManager {
                sched,
                timers,
                poller: Poller::new().expect("io manager: epoll setup failed"),
                contexts: RwLock::new(Vec::new()),
                pending: AtomicUsize::new(0),
            };
            manager.grow_contexts(32);
            tls::set_current_scheduler(weak.clone());
            manager
        });
        manager.start();
        manager
    }

    /// Register interest in one readiness direction of `fd`.
    ///
    /// With a callback, the callback is scheduled when the direction fires;
    /// without one, the calling fiber is parked and rescheduled instead.
    /// The registration is one-shot and edge-triggered. Fails without
    /// mutating state if the direction is already registered or the kernel
    /// refuses it.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberFn>) -> RuntimeResult<()> {
        assert!(fd >= 0, "add_event requires a valid fd");
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes exactly one direction"
        );
        let target = scheduler::current_scheduler()
            .expect("add_event requires a scheduler on this thread");

        let ctx = self.context_for(fd);
        let mut state = ctx.state.lock().unwrap();
        if state.events.contains(event) {
            tracing::error!(fd, event = %event, "direction already registered");
            return Err(RuntimeError::AlreadyRegistered { fd });
        }

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let interest = libc::EPOLLET as u32 | (state.events | event).bits();
        if let Err(err) = self.poller.ctl(op, fd, interest) {
            tracing::error!(fd, error = %err, "epoll_ctl failed in add_event");
            return Err(RuntimeError::os("epoll_ctl", err));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        state.events.insert(event);

        let slot = if event == Event::READ {
            &mut state.read
        } else {
            &mut state.write
        };
        debug_assert!(slot.scheduler.is_none() && slot.fiber.is_none() && slot.cb.is_none());
        slot.scheduler = Some(Arc::downgrade(&target));
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    FiberState::Running,
                    "a parked fiber must be running"
                );
                slot.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Remove a registration without firing it. False if absent.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut state = ctx.state.lock().unwrap();
        if !state.events.contains(event) {
            return false;
        }

        let left = state.events & !event;
        if !self.reprogram(fd, left) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        state.events = left;
        let slot = if event == Event::READ {
            &mut state.read
        } else {
            &mut state.write
        };
        slot.reset();
        true
    }

    /// Remove a registration and fire its stored resumption. False if
    /// absent.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut state = ctx.state.lock().unwrap();
        if !state.events.contains(event) {
            return false;
        }

        let left = state.events & !event;
        if !self.reprogram(fd, left) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        FdContext::trigger(&mut state, event);
        true
    }

    /// Deregister the fd entirely, firing both directions if present.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut state = ctx.state.lock().unwrap();
        if state.events.is_empty() {
            return false;
        }

        if let Err(err) = self.poller.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            tracing::error!(fd, error = %err, "epoll_ctl failed in cancel_all");
            return false;
        }
        if state.events.contains(Event::READ) {
            FdContext::trigger(&mut state, Event::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if state.events.contains(Event::WRITE) {
            FdContext::trigger(&mut state, Event::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(state.events.is_empty());
        true
    }

    /// Add a timer firing `ms` milliseconds from now.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only fires
    /// while `cond` is still alive.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: &Arc<T>,
        recurring: bool,
    ) -> Timer {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    /// True while any timer is pending.
    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    /// Number of registered (fd, direction) pairs.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Reprogram the kernel registration after removing a direction: MOD
    /// with the remaining interest, or DEL when none is left.
    fn reprogram(&self, fd: RawFd, left: Event) -> bool {
        let result = if left.is_empty() {
            self.poller.ctl(libc::EPOLL_CTL_DEL, fd, 0)
        } else {
            self.poller
                .ctl(libc::EPOLL_CTL_MOD, fd, libc::EPOLLET as u32 | left.bits())
        };
        if let Err(err) = result {
            tracing::error!(fd, error = %err, "epoll_ctl failed while deregistering");
            return false;
        }
        true
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().unwrap().get(fd as usize).cloned()
    }

    /// Slot for `fd`, growing the table to ⌈fd·1.5⌉ on a miss.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let contexts = self.contexts.read().unwrap();
            if let Some(ctx) = contexts.get(fd as usize) {
                return ctx.clone();
            }
        }
        let target = std::cmp::max(fd as usize + 1, fd as usize * 3 / 2);
        self.grow_contexts(target);
        self.contexts.read().unwrap()[fd as usize].clone()
    }

    fn grow_contexts(&self, len: usize) {
        let mut contexts = self.contexts.write().unwrap();
        while contexts.len() < len {
            let next_fd = contexts.len() as RawFd;
            contexts.push(Arc::new(FdContext {
                fd: next_fd,
                state: Mutex::new(FdState::default()),
            }));
        }
    }
}

impl Schedule for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Wake a worker blocked in epoll. A pool with no idle worker needs no
    /// wakeup: somebody will see the queue before blocking.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        self.poller.notify();
    }

    fn stopping(&self) -> bool {
        self.timers.next_timeout_ms().is_none()
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.work_drained()
    }

    /// Idle body: wait for readiness or the next timer deadline, convert
    /// both into task submissions, then yield back to the worker loop.
    fn idle(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            if self.stopping() {
                tracing::debug!(scheduler = %self.sched.name(), "idle fiber exiting");
                break;
            }

            let timeout = self
                .timers
                .next_timeout_ms()
                .unwrap_or(MAX_TIMEOUT_MS)
                .min(MAX_TIMEOUT_MS);
            let ready = loop {
                match self.poller.wait(&mut events, timeout as i32) {
                    Ok(n) => break n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::error!(error = %err, "epoll_wait failed");
                        break 0;
                    }
                }
            };

            let mut expired = Vec::new();
            self.timers.list_expired(&mut expired);
            for cb in expired {
                self.submit(Task::call(move || cb()));
            }

            for ev in &events[..ready] {
                let fd = ev.u64 as RawFd;
                if fd == self.poller.wakeup_fd() {
                    self.poller.drain();
                    continue;
                }
                let Some(ctx) = self.lookup(fd) else {
                    continue;
                };
                let mut state = ctx.state.lock().unwrap();

                let mut bits = ev.events;
                if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Surface errors and hangups on whichever directions are
                    // armed, so their consumers run and observe the failure.
                    bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.events.bits();
                }
                let real = Event::from_bits(bits) & state.events;
                if real.is_empty() {
                    continue;
                }

                let left = state.events & !real;
                if !self.reprogram(ctx.fd, left) {
                    continue;
                }
                if real.contains(Event::READ) {
                    FdContext::trigger(&mut state, Event::READ);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if real.contains(Event::WRITE) {
                    FdContext::trigger(&mut state, Event::WRITE);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Hand control back to the worker loop; it resumes us on the
            // next empty pass over the queue.
            Fiber::yield_current();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_nonblock() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_context_table_growth() {
        let io = IoManager::new(1, false, "grow-test");
        assert_eq!(io.contexts.read().unwrap().len(), 32);

        let ctx = io.context_for(100);
        assert_eq!(ctx.fd, 100);
        assert_eq!(io.contexts.read().unwrap().len(), 150);
        io.stop();
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let io = IoManager::new(1, false, "dup-test");
        let (read_fd, write_fd) = pipe_nonblock();

        io.add_event(read_fd, Event::READ, Some(Box::new(|| {}))).unwrap();
        let err = io
            .add_event(read_fd, Event::READ, Some(Box::new(|| {})))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyRegistered { .. }));
        assert_eq!(io.pending_events(), 1);

        assert!(io.del_event(read_fd, Event::READ));
        assert_eq!(io.pending_events(), 0);
        io.stop();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn test_del_event_absent_is_false() {
        let io = IoManager::new(1, false, "del-test");
        let (read_fd, write_fd) = pipe_nonblock();
        assert!(!io.del_event(read_fd, Event::READ));
        assert!(!io.cancel_event(read_fd, Event::WRITE));
        assert!(!io.cancel_all(read_fd));
        assert_eq!(io.pending_events(), 0);
        io.stop();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
