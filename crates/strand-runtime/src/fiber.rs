//! Stackful fibers
//!
//! A [`Fiber`] owns a stack and a saved machine context. `resume` swaps
//! execution into the fiber; `yield` swaps back out to a designated
//! *return-to* fiber on the same thread.
//!
//! Each thread that touches fibers lazily owns a **main fiber** standing in
//! for its native stack (created on the first [`Fiber::current`] call, born
//! `Running`, never allocating a stack), and may designate a **scheduler
//! fiber** as the default yield target. A fiber built with
//! `run_in_scheduler = true` swaps against the scheduler fiber; otherwise it
//! swaps against the main fiber.
//!
//! Resuming a fiber that is not `Ready`, or resetting one that is not
//! `Term`, is a programmer error and panics.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use strand_core::error::RuntimeResult;
use strand_core::state::FiberState;

use crate::arch::{self, Context};
use crate::stack::Stack;
use crate::tls;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

/// A boxed fiber or task body.
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// A stackful cooperative coroutine.
///
/// Shared through `Arc` handles; the runtime keeps handles in the task queue
/// and in fd event slots, and each thread tracks its current/main/scheduler
/// fibers in thread-local storage.
pub struct Fiber {
    id: u64,
    /// `None` for a main fiber (it runs on the thread's native stack).
    stack: Option<Stack>,
    ctx: UnsafeCell<Context>,
    body: UnsafeCell<Option<FiberFn>>,
    state: AtomicU8,
    /// Yield to the scheduler fiber instead of the main fiber.
    run_in_scheduler: bool,
    /// Serializes resume against a concurrent resume of the same fiber.
    pub(crate) lock: Mutex<()>,
}

// Safety: `ctx` is only written by the thread performing a switch on this
// fiber, and resumes are serialized by `lock` plus the Ready/Running state
// machine. `body` is taken exactly once by the trampoline (or replaced by
// `reset` while the fiber is Term and cannot run).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber around `body`.
    ///
    /// `stack_size = 0` selects the 128 KiB default. Fails only if the stack
    /// mapping fails; the error propagates to the caller.
    pub fn new(
        body: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> RuntimeResult<Arc<Fiber>> {
        let stack = Stack::new(stack_size)?;
        tracing::trace!(stack_bytes = stack.len(), "fiber stack mapped");
        let fiber = Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            ctx: UnsafeCell::new(Context::new()),
            body: UnsafeCell::new(Some(Box::new(body))),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            lock: Mutex::new(()),
            stack: Some(stack),
        };
        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_entry,
            );
        }
        tracing::trace!(fiber = fiber.id, "fiber created");
        Ok(Arc::new(fiber))
    }

    /// The main fiber for the calling thread, born Running on the native
    /// stack.
    fn new_main() -> Arc<Fiber> {
        let fiber = Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack: None,
            ctx: UnsafeCell::new(Context::new()),
            body: UnsafeCell::new(None),
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            lock: Mutex::new(()),
        };
        tracing::trace!(fiber = fiber.id, "main fiber created");
        Arc::new(fiber)
    }

    /// The fiber currently executing on this thread.
    ///
    /// The first call on a thread creates its main fiber and installs it as
    /// current, main and scheduler fiber.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        let main = Fiber::new_main();
        tls::set_current_fiber(main.clone());
        tls::set_main_fiber(main.clone());
        tls::set_scheduler_fiber(main.clone());
        main
    }

    /// Id of the current fiber, if the thread has one.
    pub fn current_id() -> Option<u64> {
        tls::current_fiber().map(|f| f.id())
    }

    /// Override the calling thread's scheduler fiber (the default yield
    /// target for in-scheduler fibers).
    pub fn set_scheduler_fiber(f: &Arc<Fiber>) {
        tls::set_scheduler_fiber(f.clone());
    }

    /// Yield the thread's current fiber back to its return-to fiber.
    pub fn yield_current() {
        Fiber::current().yield_fiber();
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Switch execution into this fiber.
    ///
    /// Requires state `Ready`. Control comes back when the fiber yields or
    /// its body returns. The caller's handle stays borrowed for the whole
    /// suspension, which keeps the fiber alive across its terminal yield.
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume() requires a Ready fiber"
        );
        // Make sure this thread has a main fiber to swap out of.
        if tls::main_fiber().is_none() {
            let _ = Fiber::current();
        }
        self.set_state(FiberState::Running);

        let back = self.return_to();
        debug_assert!(!Arc::ptr_eq(self, &back), "fiber cannot resume itself");
        tls::set_current_fiber(self.clone());
        unsafe { arch::context_switch(back.ctx.get(), self.ctx.get()) }
    }

    /// Give up execution and switch back to the return-to fiber.
    ///
    /// Must be called from inside the fiber (it is the thread's current
    /// fiber). A `Term` fiber yields exactly once more, out of the
    /// trampoline; anything else becomes `Ready` again.
    pub fn yield_fiber(&self) {
        let state = self.state();
        assert!(
            state == FiberState::Running || state == FiberState::Term,
            "yield requires a Running or Term fiber"
        );
        if state != FiberState::Term {
            self.set_state(FiberState::Ready);
        }

        let back = self.return_to();
        tls::set_current_fiber(back.clone());
        unsafe { arch::context_switch(self.ctx.get(), back.ctx.get()) }
    }

    /// Rebind a finished fiber to a new body, reusing its stack.
    pub fn reset(&self, body: impl FnOnce() + Send + 'static) {
        let _guard = self.lock.lock().unwrap();
        assert_eq!(
            self.state(),
            FiberState::Term,
            "reset() requires a Term fiber"
        );
        let stack = self
            .stack
            .as_ref()
            .expect("reset() requires a stack-owning fiber");
        unsafe {
            *self.body.get() = Some(Box::new(body));
            arch::init_context(self.ctx.get(), stack.top(), fiber_entry);
        }
        self.set_state(FiberState::Ready);
    }

    /// The fiber a switch pairs with, per `run_in_scheduler`.
    fn return_to(&self) -> Arc<Fiber> {
        let target = if self.run_in_scheduler {
            tls::scheduler_fiber()
        } else {
            tls::main_fiber()
        };
        target.expect("no return-to fiber installed on this thread")
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        tracing::trace!(fiber = self.id, state = %self.state(), "fiber dropped");
    }
}

/// First frame of every stack-owning fiber.
///
/// Runs the body, marks the fiber Term and yields out one final time. The
/// local handle is released before that yield: the resumer still holds one,
/// and a strong reference kept here would outlive this stack.
extern "C" fn fiber_entry() {
    let current = tls::current_fiber().expect("fiber entry without a current fiber");
    let body = unsafe { (*current.body.get()).take() };
    if let Some(body) = body {
        if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
            tracing::error!(fiber = current.id, "fiber body panicked");
        }
    }
    current.set_state(FiberState::Term);

    let raw = Arc::as_ptr(&current);
    drop(current);
    // Safety: the worker that resumed us still borrows its own handle until
    // resume() returns, so the fiber outlives this call.
    unsafe { (*raw).yield_fiber() };
    unreachable!("terminal yield returned");
}
