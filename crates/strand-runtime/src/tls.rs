//! Thread-local fiber and scheduler context
//!
//! Each thread that runs fibers knows at most three of them directly: the
//! fiber currently executing, the main fiber standing in for the native
//! stack, and the scheduler fiber that yields return to. A worker thread
//! additionally knows its worker index and the scheduler driving it.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::scheduler::Schedule;

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// The fiber representing this thread's native stack
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Default yield target for fibers that run in a scheduler
    static SCHEDULER_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Index of the worker loop running on this thread
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };

    /// Scheduler driving this thread
    static CURRENT_SCHEDULER: RefCell<Option<Weak<dyn Schedule>>> = const { RefCell::new(None) };
}

#[inline]
pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_current_fiber(f: Arc<Fiber>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(f));
}

#[inline]
pub(crate) fn main_fiber() -> Option<Arc<Fiber>> {
    MAIN_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_main_fiber(f: Arc<Fiber>) {
    MAIN_FIBER.with(|c| *c.borrow_mut() = Some(f));
}

#[inline]
pub(crate) fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHEDULER_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_scheduler_fiber(f: Arc<Fiber>) {
    SCHEDULER_FIBER.with(|c| *c.borrow_mut() = Some(f));
}

#[inline]
pub(crate) fn worker_index() -> Option<usize> {
    WORKER_INDEX.with(|c| c.get())
}

#[inline]
pub(crate) fn set_worker_index(i: usize) {
    WORKER_INDEX.with(|c| c.set(Some(i)));
}

#[inline]
pub(crate) fn current_scheduler() -> Option<Arc<dyn Schedule>> {
    CURRENT_SCHEDULER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

#[inline]
pub(crate) fn set_current_scheduler(s: Weak<dyn Schedule>) {
    CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(s));
}

#[inline]
pub(crate) fn clear_current_scheduler() {
    CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = None);
}
