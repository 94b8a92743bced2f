use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::{Mutex, MutexGuard};

use super::Event;
use crate::fiber::{Callback, Fiber};
use crate::scheduler::{Handle, Task};

/// What to run when an event fires.
pub(crate) enum Target {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

pub(crate) struct EventContext {
    /// Scheduler the target is resumed on.
    pub scheduler: Handle,
    pub target: Target,
    /// Outcome slot of a waiting hook call: 0 while undecided, otherwise the errno it fails
    /// with. A forced cancellation writes `ECANCELED` unless something got there first.
    pub status: Option<Arc<AtomicI32>>,
}

#[derive(Default)]
pub(crate) struct FdState {
    pub events: Event,
    read: Option<EventContext>,
    write: Option<EventContext>,
}

impl FdState {
    pub fn slot(&mut self, event: Event) -> &mut Option<EventContext> {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    /// Drops interest in `event` and schedules its target; with `cancelled` the waiter's status
    /// records the cancellation.
    pub fn trigger(&mut self, event: Event, cancelled: bool) {
        self.events.remove(event);
        let Some(ctx) = self.slot(event).take() else {
            return;
        };
        if cancelled {
            if let Some(status) = &ctx.status {
                let _ = status.compare_exchange(0, libc::ECANCELED, Ordering::AcqRel, Ordering::Acquire);
            }
        }
        let task = match ctx.target {
            Target::Fiber(fiber) => Task::Fiber(fiber),
            Target::Call(cb) => Task::Call(cb),
        };
        ctx.scheduler.schedule(task, None);
    }

    /// Drops interest in `event` without running anything.
    pub fn clear(&mut self, event: Event) {
        self.events.remove(event);
        self.slot(event).take();
    }
}

/// Per-descriptor record of registered interest.
pub(crate) struct FdContext {
    pub fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    pub fn new(fd: RawFd) -> Arc<Self> {
        Arc::new(Self {
            fd,
            state: Mutex::new(FdState::default()),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, FdState> {
        self.state.lock()
    }
}
