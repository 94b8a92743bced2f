//! A cooperative fiber runtime.
//!
//! Blocking-style code runs on stackful fibers scheduled across a pool of worker threads.
//! When such code would block on a socket or a sleep, the [`hook`] layer parks the fiber with
//! the reactor instead and the worker moves on. The pieces, bottom up:
//!
//! - [`fiber`]: stackful execution contexts and the switch between them
//! - [`timer`]: deadline timers ordered by expiry
//! - [`scheduler`]: worker threads sharing a run queue of fibers and callables
//! - [`reactor`]: the [`IoManager`], a scheduler whose idle workers wait for readiness
//! - [`hook`]: blocking calls rewritten as suspend-and-resume sequences
//! - [`net`]: TCP sockets over the hook
//! - [`runtime`]: a configured `IoManager` plus the `#[strand::main]` entry point
//!
//! Linux on x86_64 and aarch64 only.

pub mod config;
pub mod error;
pub mod fiber;
pub mod hook;
pub mod net;
pub mod reactor;
pub mod runtime;
pub mod scheduler;
pub mod timer;

pub use error::{Error, Result};
pub use fiber::{Fiber, FiberState};
pub use reactor::{Event, IoHandle, IoManager};
pub use runtime::{Runtime, spawn};
pub use scheduler::{Handle, Scheduler, Task};
pub use strand_macros::main;
pub use timer::{Timer, TimerManager};
