//! Event-driven I/O reactor.
//!
//! An [`IoManager`] is a [`Scheduler`] whose idle workers wait on an edge-triggered epoll
//! instance (through `mio`) instead of parking, plus a [`TimerManager`] bounding that wait.
//! Interest is registered per descriptor and per [`Event`] kind; when a descriptor becomes
//! ready, the registered fiber or callback is scheduled and the interest is dropped.

mod fd_context;
#[allow(clippy::module_inception)]
mod reactor;

use std::io;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::atomic::AtomicI32;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bitflags::bitflags;

pub(crate) use self::reactor::Reactor;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fiber::Callback;
use crate::scheduler::{Driver, Handle, Scheduler};
use crate::timer::{Timer, TimerManager};

bitflags! {
    /// Readiness kinds a descriptor can be watched for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Event: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

/// Cloneable reference to a running [`IoManager`].
#[derive(Clone)]
pub struct IoHandle {
    handle: Handle,
    reactor: Arc<Reactor>,
}

impl IoHandle {
    /// The `IoManager` whose worker runs on this thread.
    pub fn current() -> Option<IoHandle> {
        let handle = Handle::current()?;
        let reactor = handle.reactor()?.clone();
        Some(IoHandle { handle, reactor })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Registers interest in `event` (exactly one kind) on `fd`. When it fires, `callback` is
    /// scheduled; without one, the running fiber is captured and resumed, so the caller is
    /// expected to yield right after.
    ///
    /// # Panics
    ///
    /// Panics if `event` is already registered on `fd`, or if no callback is given outside a
    /// task fiber.
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<Callback>) -> io::Result<()> {
        match callback {
            Some(cb) => self.reactor.add_callback(&self.handle, fd, event, cb),
            None => self.wait_event(fd, event, Arc::new(AtomicI32::new(0))),
        }
    }

    pub(crate) fn wait_event(&self, fd: RawFd, event: Event, status: Arc<AtomicI32>) -> io::Result<()> {
        self.reactor.wait_event(&self.handle, fd, event, status)
    }

    /// Drops interest in `event` without running its target. Returns `false` if it was not
    /// registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.del_event(fd, event)
    }

    /// Drops interest in `event` and runs its target once, as if it had fired.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.cancel_event(fd, event)
    }

    /// Cancels every event registered on `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor.cancel_all(fd)
    }

    /// Event kinds currently registered on `fd`.
    pub fn registered(&self, fd: RawFd) -> Event {
        self.reactor.registered(fd)
    }

    /// Number of registered, not yet fired events across all descriptors.
    pub fn pending_events(&self) -> usize {
        self.reactor.pending_events()
    }

    pub fn timers(&self) -> &TimerManager {
        &self.reactor.timers
    }

    pub fn add_timer<F>(&self, delay: Duration, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.timers.add_timer(delay, callback, recurring)
    }

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
        self.reactor
            .timers
            .add_condition_timer(delay, callback, condition, recurring)
    }

    pub(crate) fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }
}

impl Deref for IoHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

/// A started scheduler whose idle workers drive the reactor.
pub struct IoManager {
    scheduler: Scheduler,
    io: IoHandle,
}

impl IoManager {
    /// Creates and starts an `IoManager` with `threads` workers (see [`Scheduler::new`] for
    /// `use_caller`).
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Self> {
        let reactor = Arc::new(Reactor::new().map_err(Error::Reactor)?);
        let scheduler = Scheduler::build(threads, use_caller, name, Driver::Reactor(reactor.clone()))?;
        let io = IoHandle {
            handle: scheduler.handle().clone(),
            reactor,
        };
        scheduler.start()?;
        Ok(Self { scheduler, io })
    }

    pub fn with_config(config: &Config) -> Result<Self> {
        let s = &config.scheduler;
        Self::new(s.threads, s.use_caller, &s.name)
    }

    /// Same as [`IoHandle::current`].
    pub fn current() -> Option<IoHandle> {
        IoHandle::current()
    }

    pub fn io_handle(&self) -> &IoHandle {
        &self.io
    }

    /// Waits until every queued task, registered event and timer is done, then joins the
    /// workers.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl Deref for IoManager {
    type Target = IoHandle;

    fn deref(&self) -> &IoHandle {
        &self.io
    }
}
