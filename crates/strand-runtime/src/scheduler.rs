//! Cooperative task scheduler
//!
//! A [`Scheduler`] owns a FIFO task queue and a fixed pool of worker
//! threads. Tasks are either fiber handles to resume or bare callbacks that
//! get wrapped in a fresh fiber. A task may be pinned to one worker; every
//! other worker skips it.
//!
//! With `use_caller` the constructing thread counts as worker 0: its main
//! fiber is materialized and a dedicated *scheduler fiber* is installed
//! whose body is the worker loop. That fiber is resumed by [`Schedule::stop`],
//! so the caller drains remaining work before the pool joins.
//!
//! [`IoManager`](crate::io::IoManager) specializes the scheduler through the
//! [`Schedule`] trait: `tickle`, `idle` and `stopping` are its hook points,
//! the way the worker bodies themselves are closures handed to the pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use strand_core::state::FiberState;

use crate::fiber::{Fiber, FiberFn};
use crate::tls;

/// Nap length of the default idle loop between stop checks.
const IDLE_NAP: Duration = Duration::from_millis(10);

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

/// A unit of work: a fiber to resume or a callback to run on a fresh fiber,
/// optionally pinned to one worker.
pub struct Task {
    kind: TaskKind,
    pin: Option<usize>,
}

impl Task {
    /// A task that resumes `fiber`.
    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
            pin: None,
        }
    }

    /// A task that runs `f` on a fresh fiber.
    pub fn call(f: impl FnOnce() + Send + 'static) -> Task {
        Task::call_boxed(Box::new(f))
    }

    /// Like [`Task::call`] for an already-boxed body.
    pub fn call_boxed(f: FiberFn) -> Task {
        Task {
            kind: TaskKind::Call(f),
            pin: None,
        }
    }

    /// Restrict the task to one worker index.
    pub fn pin_to(mut self, worker: usize) -> Task {
        self.pin = Some(worker);
        self
    }
}

struct SchedState {
    tasks: VecDeque<Task>,
    threads: Vec<JoinHandle<()>>,
    stopping: bool,
    started: bool,
}

/// Scheduler core state, shared by the plain scheduler and specializations
/// such as [`IoManager`](crate::io::IoManager).
pub struct Scheduler {
    name: String,
    state: Mutex<SchedState>,
    /// Workers currently executing a non-idle task.
    active_workers: AtomicUsize,
    /// Workers currently inside their idle fiber.
    idle_workers: AtomicUsize,
    /// Worker threads to spawn (excludes the caller when `use_caller`).
    spawned: usize,
    /// Total workers including the caller.
    workers: usize,
    use_caller: bool,
    root_thread: Option<ThreadId>,
    /// Worker index of the caller thread, when it participates.
    root_worker: Option<usize>,
    /// The caller thread's scheduler fiber; its body is the worker loop.
    caller_fiber: Option<Arc<Fiber>>,
}

impl Scheduler {
    /// Standalone scheduler with the default (nap-and-yield) idle loop.
    ///
    /// `threads` is the total worker count; with `use_caller` the
    /// constructing thread is one of them. At most one scheduler may be
    /// active per constructing thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let loop_weak = weak.clone();
            let sched = Scheduler::build(
                threads,
                use_caller,
                name,
                Box::new(move || {
                    if let Some(s) = loop_weak.upgrade() {
                        run(s, 0);
                    }
                }),
            );
            tls::set_current_scheduler(weak.clone());
            sched
        })
    }

    /// Build the core. `caller_loop` becomes the body of the caller-thread
    /// scheduler fiber when `use_caller` is set, and is dropped otherwise.
    pub(crate) fn build(
        threads: usize,
        use_caller: bool,
        name: &str,
        caller_loop: FiberFn,
    ) -> Scheduler {
        assert!(threads > 0, "scheduler needs at least one worker");
        assert!(
            tls::current_scheduler().is_none(),
            "a scheduler is already active on this thread"
        );

        let (spawned, root_worker, root_thread, caller_fiber) = if use_caller {
            // The caller becomes worker 0: materialize its main fiber and
            // install a dedicated scheduler fiber running the worker loop.
            let _ = Fiber::current();
            let scheduler_fiber = Fiber::new(caller_loop, 0, false)
                .expect("scheduler fiber allocation failed");
            Fiber::set_scheduler_fiber(&scheduler_fiber);
            (
                threads - 1,
                Some(0),
                Some(thread::current().id()),
                Some(scheduler_fiber),
            )
        } else {
            (threads, None, None, None)
        };

        tracing::debug!(scheduler = name, threads, use_caller, "scheduler created");
        Scheduler {
            name: name.to_string(),
            state: Mutex::new(SchedState {
                tasks: VecDeque::new(),
                threads: Vec::new(),
                stopping: false,
                started: false,
            }),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            spawned,
            workers: threads,
            use_caller,
            root_thread,
            root_worker,
            caller_fiber,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total worker count, including the caller when it participates.
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// True while at least one worker sits in its idle fiber.
    pub fn has_idle_threads(&self) -> bool {
        self.idle_workers.load(Ordering::SeqCst) > 0
    }

    /// Enqueue one task; true if the queue was empty (the caller should
    /// tickle).
    pub(crate) fn enqueue(&self, task: Task) -> bool {
        let mut state = self.state.lock().unwrap();
        let was_empty = state.tasks.is_empty();
        state.tasks.push_back(task);
        was_empty
    }

    /// Enqueue several tasks preserving their order; true if the queue was
    /// empty.
    pub(crate) fn enqueue_batch(&self, tasks: Vec<Task>) -> bool {
        let mut state = self.state.lock().unwrap();
        let was_empty = state.tasks.is_empty();
        state.tasks.extend(tasks);
        was_empty && !state.tasks.is_empty()
    }

    /// Base shutdown condition: stop requested, queue drained, no worker
    /// running a task.
    pub(crate) fn work_drained(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.stopping
            && state.tasks.is_empty()
            && self.active_workers.load(Ordering::SeqCst) == 0
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if state.started && !state.stopping {
                tracing::error!(scheduler = %self.name, "dropped without stop()");
            }
        }
    }
}

impl Schedule for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }
}

/// The scheduling surface, with the hook points a specialization overrides.
///
/// The provided `start`/`stop`/`submit` drive the shared worker machinery;
/// `tickle`, `idle` and `stopping` are the base implementations a subtype
/// like [`IoManager`](crate::io::IoManager) replaces.
pub trait Schedule: Send + Sync + 'static {
    /// The scheduler core this instance drives.
    fn scheduler(&self) -> &Scheduler;

    /// Enqueue one task, waking an idle worker if the queue was empty.
    fn submit(&self, task: Task) {
        if self.scheduler().enqueue(task) {
            self.tickle();
        }
    }

    /// Enqueue several tasks preserving their order.
    fn submit_batch(&self, tasks: Vec<Task>) {
        if self.scheduler().enqueue_batch(tasks) {
            self.tickle();
        }
    }

    /// Convenience: submit a callback task.
    fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.submit(Task::call(f));
    }

    /// Wake a blocked idle worker. The base idle loop polls and needs no
    /// wakeup.
    fn tickle(&self) {}

    /// Body of the per-worker idle fiber: nap and yield until stopping.
    fn idle(&self) {
        while !self.stopping() {
            thread::sleep(IDLE_NAP);
            Fiber::yield_current();
        }
    }

    /// Whether the scheduler may shut down.
    fn stopping(&self) -> bool {
        self.scheduler().work_drained()
    }

    /// Spawn the worker threads. Tasks may be submitted before or after.
    fn start(self: &Arc<Self>)
    where
        Self: Sized,
    {
        start_workers(self.clone());
    }

    /// Request shutdown, drain on the caller thread when it participates,
    /// then join every worker.
    ///
    /// With `use_caller` this must run on the constructing thread.
    fn stop(self: &Arc<Self>)
    where
        Self: Sized,
    {
        stop_workers(self.clone());
    }
}

/// The scheduler driving the calling thread, if any.
pub fn current_scheduler() -> Option<Arc<dyn Schedule>> {
    tls::current_scheduler()
}

/// Worker index of the calling thread, if it is a worker.
pub fn current_worker() -> Option<usize> {
    tls::worker_index()
}

fn start_workers(this: Arc<dyn Schedule>) {
    let core = this.scheduler();
    let mut state = core.state.lock().unwrap();
    if state.stopping {
        tracing::error!(scheduler = %core.name, "start() after stop()");
        return;
    }
    if state.started {
        return;
    }
    state.started = true;

    assert!(state.threads.is_empty());
    let first = if core.use_caller { 1 } else { 0 };
    for i in 0..core.spawned {
        let worker = first + i;
        let this = this.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{}", core.name, worker))
            .spawn(move || run(this, worker))
            .expect("failed to spawn worker thread");
        state.threads.push(handle);
    }
    tracing::debug!(scheduler = %core.name, workers = core.spawned, "workers started");
}

fn stop_workers(this: Arc<dyn Schedule>) {
    let core = this.scheduler();
    if this.stopping() {
        return;
    }
    {
        let mut state = core.state.lock().unwrap();
        state.stopping = true;
    }

    if core.use_caller {
        assert_eq!(
            thread::current().id(),
            core.root_thread.expect("use_caller scheduler has a root thread"),
            "stop() must run on the thread that built this scheduler"
        );
    }

    for _ in 0..core.spawned {
        this.tickle();
    }
    if core.caller_fiber.is_some() {
        this.tickle();
    }

    // Drain remaining work on the caller thread.
    if let Some(scheduler_fiber) = &core.caller_fiber {
        scheduler_fiber.resume();
        tracing::debug!(scheduler = %core.name, "caller worker drained");
    }

    let handles = {
        let mut state = core.state.lock().unwrap();
        std::mem::take(&mut state.threads)
    };
    for handle in handles {
        let _ = handle.join();
    }

    // Restore this thread's fiber targets for any later scheduler.
    if core.use_caller {
        if let Some(main) = tls::main_fiber() {
            Fiber::set_scheduler_fiber(&main);
        }
    }
    if let Some(installed) = tls::current_scheduler() {
        // Compare data pointers only: vtable addresses are not stable.
        if std::ptr::addr_eq(Arc::as_ptr(&installed), Arc::as_ptr(&this)) {
            tls::clear_current_scheduler();
        }
    }
    tracing::debug!(scheduler = %core.name, "stopped");
}

/// Worker loop. Runs on every spawned worker thread, and inside the caller
/// thread's scheduler fiber when `use_caller` is set.
pub(crate) fn run(this: Arc<dyn Schedule>, worker: usize) {
    let core = this.scheduler();
    tracing::debug!(scheduler = %core.name, worker, "worker loop running");
    tls::set_worker_index(worker);
    tls::set_current_scheduler(Arc::downgrade(&this));
    if core.root_worker != Some(worker) {
        // Spawned worker thread: materialize its main fiber (which doubles
        // as its scheduler fiber).
        let _ = Fiber::current();
    }

    let idle_fiber = {
        let this = this.clone();
        Fiber::new(move || this.idle(), 0, true).expect("idle fiber allocation failed")
    };

    loop {
        let mut tickle_me = false;
        let mut task = None;
        {
            let mut state = core.state.lock().unwrap();
            let mut i = 0;
            while i < state.tasks.len() {
                match state.tasks[i].pin {
                    Some(pin) if pin != worker => {
                        // Pinned elsewhere: leave it and wake the others.
                        tickle_me = true;
                        i += 1;
                    }
                    _ => {
                        task = state.tasks.remove(i);
                        core.active_workers.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                }
            }
            tickle_me = tickle_me || !state.tasks.is_empty();
        }
        if tickle_me {
            this.tickle();
        }

        match task {
            Some(Task {
                kind: TaskKind::Fiber(fiber),
                ..
            }) => {
                {
                    let _guard = fiber.lock.lock().unwrap();
                    if fiber.state() != FiberState::Term {
                        fiber.resume();
                    }
                }
                core.active_workers.fetch_sub(1, Ordering::SeqCst);
            }
            Some(Task {
                kind: TaskKind::Call(body),
                ..
            }) => {
                match Fiber::new(body, 0, true) {
                    Ok(fiber) => {
                        let _guard = fiber.lock.lock().unwrap();
                        fiber.resume();
                    }
                    Err(e) => tracing::error!(error = %e, "could not allocate a task fiber"),
                }
                core.active_workers.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if idle_fiber.state() == FiberState::Term {
                    tracing::debug!(scheduler = %core.name, worker, "worker loop exiting");
                    break;
                }
                core.idle_workers.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                core.idle_workers.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_queue_reports_empty_transitions() {
        let sched = Scheduler::new(1, false, "queue-test");
        assert!(sched.enqueue(Task::call(|| {})));
        assert!(!sched.enqueue(Task::call(|| {})));
        // never started: nothing to join, but mark it stopped for Drop
        sched.state.lock().unwrap().tasks.clear();
        sched.stop();
    }

    #[test]
    fn test_spawned_workers_run_tasks() {
        let sched = Scheduler::new(2, false, "pool-test");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let hits = hits.clone();
            sched.schedule(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) < 8 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 8);
        sched.stop();
    }

    #[test]
    fn test_pinned_task_runs_on_its_worker() {
        let sched = Scheduler::new(2, false, "pin-test");
        sched.start();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..4 {
            let seen = seen.clone();
            sched.submit(
                Task::call(move || {
                    seen.lock().unwrap().push(current_worker());
                })
                .pin_to(1),
            );
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() < 4 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        sched.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|w| *w == Some(1)));
    }

    #[test]
    fn test_task_panic_does_not_kill_worker() {
        let sched = Scheduler::new(1, false, "panic-test");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        sched.schedule(|| panic!("task failure"));
        let hits2 = hits.clone();
        sched.schedule(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) < 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        sched.stop();
    }
}
