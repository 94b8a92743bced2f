//! Worker threads of the scheduler.
//!
//! Every worker runs the same loop: take the first queue entry it may run, switch into it,
//! and put it back if it yielded as ready. Callables run on a fiber the worker keeps for
//! reuse, so a callable that never blocks costs no stack allocation. With nothing to run the
//! worker switches into its idle fiber.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, Thread};

use log::{debug, error, info};

use super::{Driver, Entry, Handle, Shared, Task, enter};
use crate::fiber::{Callback, Fiber, FiberState};
use crate::hook;

/// A handle to a worker thread that allows other threads to wake it.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    /// Worker index, also the value entries use to pin themselves to it.
    pub id: usize,
    /// Set while the worker is parked (or about to park).
    pub idle: AtomicBool,
    thread: Thread,
}

impl WorkerHandle {
    /// Wakes up the worker from its parked state.
    pub fn wake(&self) {
        self.thread.unpark();
    }
}

pub(crate) struct Worker {
    id: usize,
    shared: Arc<Shared>,
    handle: Arc<WorkerHandle>,
    /// Finished fiber kept to run the next callable on.
    cb_fiber: Option<Arc<Fiber>>,
}

impl Worker {
    /// Spawns a worker thread with interception enabled.
    ///
    /// # Arguments
    ///
    /// * `id` - Index of this worker within the scheduler
    /// * `shared` - Scheduler state shared by all workers
    pub fn start(id: usize, shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("{}_{id}", shared.name()))
            .spawn(move || {
                hook::set_enabled(true);
                Worker::new(id, shared).run();
            })
    }

    /// Registers the calling thread as worker `id`.
    pub fn new(id: usize, shared: Arc<Shared>) -> Self {
        let handle = Arc::new(WorkerHandle {
            id,
            idle: AtomicBool::new(false),
            thread: thread::current(),
        });
        shared.register_worker(handle.clone());
        Self {
            id,
            shared,
            handle,
            cb_fiber: None,
        }
    }

    /// The scheduling loop. Returns once the idle fiber observed that the scheduler is
    /// stopping.
    pub fn run(&mut self) {
        let _enter = enter(
            Handle {
                shared: self.shared.clone(),
            },
            self.id,
        );

        let shared = self.shared.clone();
        let me = self.handle.clone();
        let idle = match Fiber::new(move || idle_loop(&shared, &me)) {
            Ok(fiber) => fiber,
            Err(e) => {
                error!("scheduler {}: worker {} has no idle fiber: {e}", self.shared.name(), self.id);
                return;
            }
        };
        debug!("scheduler {}: worker {} running", self.shared.name(), self.id);

        loop {
            let (entry, tickle_me, pinned) = self.next_entry();
            if let Some(id) = pinned {
                self.shared.unpark(id);
            }
            if tickle_me {
                self.shared.tickle();
            }

            match entry {
                Some(Task::Fiber(fiber)) => {
                    self.run_fiber(fiber);
                    self.finish_task();
                }
                Some(Task::Call(cb)) => {
                    self.run_callable(cb);
                    self.finish_task();
                }
                None => {
                    if idle.state().is_finished() {
                        break;
                    }
                    idle.switch_in();
                }
            }
        }

        self.shared.wake_all();
        debug!("scheduler {}: worker {} exiting", self.shared.name(), self.id);
    }

    /// Pops the first entry this worker may run. The first entry pinned to another worker is
    /// reported so that worker can be woken; fibers still executing on another thread are
    /// skipped until they have switched out.
    fn next_entry(&self) -> (Option<Task>, bool, Option<usize>) {
        let mut queue = self.shared.queue.lock();
        let mut pinned = None;
        let mut i = 0;
        while i < queue.len() {
            let entry: &Entry = &queue[i];
            if let Some(t) = entry.thread.filter(|&t| t != self.id) {
                pinned.get_or_insert(t);
                i += 1;
                continue;
            }
            if let Task::Fiber(fiber) = &entry.task {
                if fiber.state() == FiberState::Exec {
                    i += 1;
                    continue;
                }
            }
            let entry = queue.remove(i);
            self.shared.active.fetch_add(1, Ordering::SeqCst);
            let tickle_me = i < queue.len();
            return (entry.map(|e| e.task), tickle_me, pinned);
        }
        (None, false, pinned)
    }

    fn run_fiber(&self, fiber: Arc<Fiber>) {
        if fiber.state().is_finished() {
            return;
        }
        fiber.switch_in();
        if fiber.state() == FiberState::Ready {
            self.shared.schedule(Task::Fiber(fiber), None);
        }
    }

    fn run_callable(&mut self, cb: Callback) {
        let fiber = match self.cb_fiber.take() {
            Some(fiber) => {
                fiber.reset_boxed(cb);
                fiber
            }
            None => match Fiber::from_callback(cb) {
                Ok(fiber) => fiber,
                Err(e) => {
                    error!("scheduler {}: dropping callable: {e}", self.shared.name());
                    return;
                }
            },
        };

        fiber.switch_in();
        match fiber.state() {
            FiberState::Ready => self.shared.schedule(Task::Fiber(fiber), None),
            state if state.is_finished() => self.cb_fiber = Some(fiber),
            // Parked: whoever resumes it holds its own reference.
            _ => {}
        }
    }

    fn finish_task(&self) {
        let was = self.shared.active.fetch_sub(1, Ordering::SeqCst);
        if was == 1 && self.shared.stop_requested.load(Ordering::SeqCst) {
            self.shared.wake_all();
        }
    }
}

/// Body of every worker's idle fiber.
fn idle_loop(shared: &Shared, me: &WorkerHandle) {
    loop {
        if shared.stopping() {
            info!("scheduler {}: worker {} leaving idle loop", shared.name(), me.id);
            return;
        }
        match &shared.driver {
            Driver::Park => shared.park(me),
            Driver::Reactor(reactor) => reactor.idle(shared, me),
        }
        Fiber::yield_to_hold();
    }
}
