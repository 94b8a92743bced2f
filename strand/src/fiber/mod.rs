//! Stackful fibers.
//!
//! A [`Fiber`] is a callable bound to its own stack. Switching into it transfers the OS thread
//! to that stack until the fiber yields or finishes, at which point control returns to the
//! context that resumed it. Each OS thread tracks three things:
//!
//! - the *current* fiber (whatever is executing right now),
//! - the *thread fiber*, a stackless fiber standing for the thread's original context, created
//!   on first use by [`Fiber::current`],
//! - the *scheduling fiber*, the context task fibers return to when they yield. On worker
//!   threads this is the thread fiber; a scheduler running on the caller's thread installs its
//!   root fiber here instead.

mod context;
mod stack;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use log::{debug, error, warn};
use metrics::{counter, gauge};

use self::context::Context;
use self::stack::Stack;
use crate::config;
use crate::error::{Error, Result};

/// The body of a fiber or of a scheduled callable.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

const INIT: u8 = 0;
const HOLD: u8 = 1;
const EXEC: u8 = 2;
const TERM: u8 = 3;
const READY: u8 = 4;
const EXCEPT: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created or reset, not yet started.
    Init,
    /// Suspended, waiting for something to schedule it again.
    Hold,
    /// Running on some thread.
    Exec,
    /// The callable returned.
    Term,
    /// Suspended and asking to be rescheduled right away.
    Ready,
    /// The callable panicked.
    Except,
}

impl FiberState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            INIT => Self::Init,
            HOLD => Self::Hold,
            EXEC => Self::Exec,
            TERM => Self::Term,
            READY => Self::Ready,
            _ => Self::Except,
        }
    }

    /// `Term` or `Except`.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Term | Self::Except)
    }
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBERS_ALIVE: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULER_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
}

// A fiber may resume on a different thread than the one it yielded on, so code running on a
// fiber stack must never reuse a thread-local address computed before a switch. Every access
// goes through these out-of-line accessors, which look the slot up on the calling thread.

#[inline(never)]
fn current_ptr() -> *const Fiber {
    CURRENT.get()
}

#[inline(never)]
fn set_current_ptr(fiber: *const Fiber) {
    CURRENT.set(fiber);
}

#[inline(never)]
fn scheduler_ptr() -> *const Fiber {
    SCHEDULER_FIBER.get()
}

#[inline(never)]
fn set_scheduler_ptr(fiber: *const Fiber) {
    SCHEDULER_FIBER.set(fiber);
}

pub struct Fiber {
    id: u64,
    state: AtomicU8,
    ctx: UnsafeCell<Context>,
    /// `None` for thread fibers, which run on the thread's own stack.
    stack: Option<Stack>,
    callback: UnsafeCell<Option<Callback>>,
    /// Task fibers return to the scheduling fiber; the scheduler's root fiber returns to the
    /// thread fiber.
    run_in_scheduler: bool,
}

// `ctx` and `callback` are only touched by the thread that is switching the fiber in or out,
// and a fiber is `EXEC` on at most one thread at a time.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a task fiber with the configured default stack size.
    pub fn new<F>(f: F) -> Result<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(f, 0)
    }

    /// Creates a task fiber; `stack_size == 0` selects `fiber.stack_size` from the configuration.
    pub fn with_stack_size<F>(f: F, stack_size: usize) -> Result<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(f), stack_size, true)
    }

    pub(crate) fn from_callback(f: Callback) -> Result<Arc<Self>> {
        Self::build(f, 0, true)
    }

    pub(crate) fn new_root(f: Callback) -> Result<Arc<Self>> {
        Self::build(f, 0, false)
    }

    fn build(f: Callback, stack_size: usize, run_in_scheduler: bool) -> Result<Arc<Self>> {
        let size = match stack_size {
            0 => config::get().fiber.stack_size,
            n => n.max(config::MIN_STACK_SIZE),
        };
        let stack = Stack::new(size).map_err(Error::StackAlloc)?;

        let mut ctx = Context::default();
        unsafe { ctx.prepare(stack.top(), fiber_entry) };

        let fiber = Arc::new(Self {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(INIT),
            ctx: UnsafeCell::new(ctx),
            stack: Some(stack),
            callback: UnsafeCell::new(Some(f)),
            run_in_scheduler,
        });
        FIBERS_ALIVE.fetch_add(1, Ordering::Relaxed);
        counter!("strand_fibers_created_total").increment(1);
        gauge!("strand_fibers_alive").increment(1.0);
        debug!("fiber {} created ({} byte stack)", fiber.id, size);
        Ok(fiber)
    }

    fn thread_fiber() -> Arc<Self> {
        FIBERS_ALIVE.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id: 0,
            state: AtomicU8::new(EXEC),
            ctx: UnsafeCell::new(Context::default()),
            stack: None,
            callback: UnsafeCell::new(None),
            run_in_scheduler: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Lowest usable address of the fiber's stack, `None` for thread fibers.
    pub fn stack_base(&self) -> Option<*const u8> {
        self.stack.as_ref().map(|s| s.bottom() as *const u8)
    }

    /// Rebinds a finished (or never started) fiber to a new callable, reusing its stack.
    ///
    /// # Panics
    ///
    /// Panics for thread fibers and for fibers that are not `Init`, `Term` or `Except`.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f));
    }

    pub(crate) fn reset_boxed(&self, f: Callback) {
        let stack = self
            .stack
            .as_ref()
            .expect("cannot reset a thread fiber: it has no stack");
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "cannot reset fiber {} while {:?}",
            self.id,
            state
        );
        // Not running anywhere, so nothing else reads these cells.
        unsafe {
            *self.callback.get() = Some(f);
            (*self.ctx.get()).prepare(stack.top(), fiber_entry);
        }
        self.state.store(INIT, Ordering::Release);
    }

    /// Runs this fiber on the calling thread until it yields or finishes.
    ///
    /// Must be called from the context the fiber returns to: the scheduling fiber for task
    /// fibers (the thread fiber when no scheduler runs on this thread).
    ///
    /// # Panics
    ///
    /// Panics if the fiber is already executing or has finished.
    pub fn switch_in(&self) {
        let back = self.return_target();
        assert!(
            !ptr::eq(back, self),
            "fiber {} cannot switch into itself",
            self.id
        );
        debug_assert!(ptr::eq(current_ptr(), back), "switch_in from a foreign context");

        let prev = self.state.swap(EXEC, Ordering::AcqRel);
        if matches!(prev, EXEC | TERM | EXCEPT) {
            if prev != EXEC {
                self.state.store(prev, Ordering::Release);
            }
            panic!(
                "cannot switch into fiber {} while {:?}",
                self.id,
                FiberState::from_raw(prev)
            );
        }

        set_current_ptr(self);
        unsafe { Context::switch((*back).ctx.get(), self.ctx.get()) };

        // Back in the resumer with the fiber's context fully saved. A fiber that yielded
        // without choosing a state is parked now; from here on other workers may resume it.
        let _ = self
            .state
            .compare_exchange(EXEC, HOLD, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Suspends this fiber and returns control to the context that resumed it. Must be called
    /// from inside the fiber.
    pub fn switch_out(&self) {
        debug_assert!(ptr::eq(current_ptr(), self), "switch_out of a fiber that is not running");
        let back = self.return_target();
        set_current_ptr(back);
        unsafe { Context::switch(self.ctx.get(), (*back).ctx.get()) };
    }

    fn return_target(&self) -> *const Fiber {
        if self.run_in_scheduler {
            let sched = scheduler_ptr();
            if !sched.is_null() {
                return sched;
            }
        }
        ensure_thread_fiber()
    }

    /// Returns the fiber running on this thread, creating the thread fiber on first use.
    pub fn current() -> Arc<Self> {
        let ptr = current_ptr();
        let ptr = if ptr.is_null() { ensure_thread_fiber() } else { ptr };
        // Every fiber lives in an Arc and `CURRENT` only points at fibers kept alive by
        // whoever switched them in.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Id of the running fiber; 0 on a thread that is not inside a task fiber.
    pub fn current_id() -> u64 {
        let ptr = current_ptr();
        if ptr.is_null() { 0 } else { unsafe { (*ptr).id } }
    }

    /// Whether the code running on this thread is inside a task fiber, i.e. may yield.
    pub(crate) fn in_task() -> bool {
        let ptr = current_ptr();
        !ptr.is_null() && unsafe { (*ptr).run_in_scheduler }
    }

    /// Marks the running fiber `Ready` and yields; the scheduler requeues it immediately.
    pub fn yield_to_ready() {
        let cur = running_task_fiber();
        cur.state.store(READY, Ordering::Release);
        cur.switch_out();
    }

    /// Yields the running fiber. It is `Hold` once the resumer is back in control and stays
    /// parked until something schedules it again.
    pub fn yield_to_hold() {
        running_task_fiber().switch_out();
    }

    /// Number of fibers alive in the process, thread fibers included.
    pub fn total() -> u64 {
        FIBERS_ALIVE.load(Ordering::Relaxed)
    }

    pub(crate) fn set_scheduler_fiber(fiber: *const Fiber) {
        set_scheduler_ptr(fiber);
    }

    pub(crate) fn scheduler_fiber() -> *const Fiber {
        scheduler_ptr()
    }

    fn run_callback(&self) {
        let callback = unsafe { (*self.callback.get()).take() };
        let outcome = match callback {
            Some(f) => panic::catch_unwind(AssertUnwindSafe(f)),
            None => Ok(()),
        };
        match outcome {
            Ok(()) => self.state.store(TERM, Ordering::Release),
            Err(payload) => {
                self.state.store(EXCEPT, Ordering::Release);
                error!("fiber {} panicked: {}", self.id, panic_message(payload.as_ref()));
            }
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack", &self.stack.as_ref().map(|s| s.size()))
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBERS_ALIVE.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_none() {
            return;
        }
        gauge!("strand_fibers_alive").decrement(1.0);
        let state = self.state();
        if !matches!(state, FiberState::Init | FiberState::Term | FiberState::Except) {
            warn!("fiber {} dropped while {:?}, its frames are discarded", self.id, state);
        }
    }
}

#[inline(never)]
fn ensure_thread_fiber() -> *const Fiber {
    THREAD_FIBER.with(|slot| {
        let mut slot = slot.borrow_mut();
        let fiber = slot.get_or_insert_with(|| {
            let fiber = Fiber::thread_fiber();
            set_current_ptr(Arc::as_ptr(&fiber));
            fiber
        });
        Arc::as_ptr(fiber)
    })
}

fn running_task_fiber() -> &'static Fiber {
    let ptr = current_ptr();
    assert!(!ptr.is_null(), "yield called outside of a fiber");
    // The running fiber outlives this call: it is kept alive by whoever switched it in.
    let fiber = unsafe { &*ptr };
    assert!(fiber.stack.is_some(), "the thread fiber cannot yield");
    fiber
}

extern "C" fn fiber_entry() -> ! {
    let fiber = current_ptr();
    unsafe {
        (*fiber).run_callback();
        (*fiber).switch_out();
    }
    // A finished fiber is only switched into again after `reset` rebuilt its frame.
    std::process::abort()
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
