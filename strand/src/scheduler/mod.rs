//! The fiber scheduler.
//!
//! A [`Scheduler`] runs fibers and plain callables on a pool of worker threads that share one
//! FIFO run queue. Entries may be pinned to a worker; unpinned entries go to whichever worker
//! looks first. A worker with nothing to do switches into its idle fiber, which either parks
//! the thread or, under an [`IoManager`](crate::reactor::IoManager), waits on the reactor.
//!
//! With `use_caller` the constructing thread counts as one of the workers: instead of spawning
//! a thread for it, [`Scheduler::stop`] runs the scheduling loop on a root fiber until the
//! scheduler drains.

mod worker;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use log::{debug, error, info, warn};
use metrics::counter;
use parking_lot::{Mutex, RwLock};

pub(crate) use self::worker::WorkerHandle;
use self::worker::Worker;
use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::fiber::{Callback, Fiber};
use crate::hook;
use crate::reactor::Reactor;

/// A unit of work on the run queue.
pub enum Task {
    /// Resume (or start) a fiber.
    Fiber(Arc<Fiber>),
    /// Run a callable on one of the worker's pooled fibers.
    Call(Callback),
}

impl Task {
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Call(_) => f.write_str("Call"),
        }
    }
}

struct Entry {
    task: Task,
    /// Worker the entry is pinned to, `None` for any.
    thread: Option<usize>,
}

/// What a worker does when the run queue has nothing for it.
pub(crate) enum Driver {
    Park,
    Reactor(Arc<Reactor>),
}

pub(crate) struct Shared {
    name: String,
    queue: Mutex<VecDeque<Entry>>,
    workers: RwLock<Vec<Arc<WorkerHandle>>>,
    /// Workers currently running a task.
    active: AtomicUsize,
    stop_requested: AtomicBool,
    max_wait: Duration,
    driver: Driver,
    /// Worker indices run `0..threads`.
    threads: usize,
}

impl Shared {
    pub(crate) fn schedule(&self, task: Task, thread: Option<usize>) {
        let thread = thread.filter(|&id| {
            if id >= self.threads {
                warn!(
                    "scheduler {}: no worker {id} (have {}), task runs on any worker",
                    self.name, self.threads
                );
                return false;
            }
            true
        });
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(Entry { task, thread });
            was_empty
        };
        counter!("strand_tasks_scheduled_total").increment(1);
        match thread {
            Some(id) => {
                if !self.unpark(id) {
                    self.wake_poller();
                }
            }
            None if was_empty => self.tickle(),
            None => {}
        }
    }

    pub(crate) fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let (was_empty, added) = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(tasks.into_iter().map(|task| Entry { task, thread: None }));
            (was_empty, queue.len() - before)
        };
        counter!("strand_tasks_scheduled_total").increment(added as u64);
        if was_empty && added > 0 {
            self.tickle();
        }
    }

    /// Tells the workers there is work: unparks an idle one, or interrupts the reactor wait
    /// when every idle worker is inside it.
    pub(crate) fn tickle(&self) {
        if !self.try_unpark_one() {
            self.wake_poller();
        }
    }

    /// Interrupts the reactor wait, if a worker is in it.
    pub(crate) fn wake_poller(&self) {
        if let Driver::Reactor(reactor) = &self.driver {
            reactor.wake_if_polling();
        }
    }

    pub(crate) fn try_unpark_one(&self) -> bool {
        let workers = self.workers.read();
        if workers.is_empty() {
            return false;
        }
        let start = rand::random::<u32>() as usize % workers.len();
        for i in 0..workers.len() {
            let w = &workers[(start + i) % workers.len()];
            if w.idle.swap(false, Ordering::SeqCst) {
                w.wake();
                return true;
            }
        }
        false
    }

    /// Unparks worker `id` if it is idle.
    pub(crate) fn unpark(&self, id: usize) -> bool {
        let workers = self.workers.read();
        match workers.iter().find(|w| w.id == id) {
            Some(w) if w.idle.swap(false, Ordering::SeqCst) => {
                w.wake();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn wake_all(&self) {
        for w in self.workers.read().iter() {
            w.idle.store(false, Ordering::SeqCst);
            w.wake();
        }
        if let Driver::Reactor(reactor) = &self.driver {
            reactor.wake();
        }
    }

    /// Whether the queue holds an entry worker `id` may take.
    pub(crate) fn has_work_for(&self, id: usize) -> bool {
        self.queue
            .lock()
            .iter()
            .any(|e| e.thread.is_none_or(|t| t == id))
    }

    /// Parks worker `me` until tickled or `max_wait` passes.
    pub(crate) fn park(&self, me: &WorkerHandle) {
        me.idle.store(true, Ordering::SeqCst);
        // Recheck to avoid a lost wakeup.
        if self.has_work_for(me.id) || self.stopping() {
            me.idle.store(false, Ordering::SeqCst);
            return;
        }
        thread::park_timeout(self.max_wait);
        me.idle.store(false, Ordering::SeqCst);
    }

    /// True once a stop was requested and nothing is left to run or wait for.
    pub(crate) fn stopping(&self) -> bool {
        let drained = self.stop_requested.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) == 0
            && self.queue.lock().is_empty();
        match &self.driver {
            Driver::Park => drained,
            Driver::Reactor(reactor) => drained && reactor.is_quiescent(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn max_wait(&self) -> Duration {
        self.max_wait
    }

    fn register_worker(&self, handle: Arc<WorkerHandle>) {
        self.workers.write().push(handle);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
    static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Cloneable reference to a running scheduler.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// The scheduler whose worker is running on this thread.
    // Out of line: tasks migrate between workers, see `fiber::current_ptr`.
    #[inline(never)]
    pub fn current() -> Option<Handle> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Index of the worker running on this thread; the key accepted as thread affinity.
    #[inline(never)]
    pub fn current_worker() -> Option<usize> {
        WORKER_ID.get()
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Queues `task`, pinned to worker `thread` if given. Workers are tickled when the queue
    /// was empty. A pin past the last worker index is dropped with a warning and the task runs
    /// on whichever worker takes it.
    pub fn schedule(&self, task: Task, thread: Option<usize>) {
        self.shared.schedule(task, thread);
    }

    /// Queues several unpinned tasks with a single tickle.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        self.shared.schedule_batch(tasks);
    }

    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::call(f), None);
    }

    /// True once the scheduler was asked to stop and has nothing left to do.
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping()
    }

    pub(crate) fn reactor(&self) -> Option<&Arc<Reactor>> {
        match &self.shared.driver {
            Driver::Reactor(reactor) => Some(reactor),
            Driver::Park => None,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("name", &self.shared.name).finish()
    }
}

/// Makes `handle` and `worker` the thread's current scheduler until the guard drops.
pub(crate) struct Enter {
    prev_handle: Option<Handle>,
    prev_worker: Option<usize>,
}

pub(crate) fn enter(handle: Handle, worker: usize) -> Enter {
    Enter {
        prev_handle: CURRENT.with(|c| c.replace(Some(handle))),
        prev_worker: WORKER_ID.replace(Some(worker)),
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = self.prev_handle.take());
        WORKER_ID.set(self.prev_worker);
    }
}

pub struct Scheduler {
    handle: Handle,
    /// Threads to spawn in `start`, the caller not included.
    spawn: usize,
    use_caller: bool,
    caller: ThreadId,
    root: Mutex<Option<Arc<Fiber>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers. With `use_caller`, the calling thread is
    /// one of them and runs its share of the work inside [`stop`](Self::stop).
    ///
    /// # Panics
    ///
    /// Panics if `threads` is zero.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Self> {
        Self::build(threads, use_caller, name, Driver::Park)
    }

    /// Creates a scheduler sized by the `scheduler.*` keys of `config`.
    pub fn with_config(config: &Config) -> Result<Self> {
        let s = &config.scheduler;
        Self::new(s.threads, s.use_caller, &s.name)
    }

    pub(crate) fn build(threads: usize, use_caller: bool, name: &str, driver: Driver) -> Result<Self> {
        assert!(threads > 0, "a scheduler needs at least one thread");
        let shared = Arc::new(Shared {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            workers: RwLock::new(Vec::with_capacity(threads)),
            active: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            max_wait: config::get().max_wait(),
            driver,
            threads,
        });

        let root = if use_caller {
            let shared = shared.clone();
            Some(Fiber::new_root(Box::new(move || Worker::new(0, shared).run()))?)
        } else {
            None
        };

        Ok(Self {
            handle: Handle { shared },
            spawn: threads - use_caller as usize,
            use_caller,
            caller: thread::current().id(),
            root: Mutex::new(root),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Same as [`Handle::current`].
    pub fn current() -> Option<Handle> {
        Handle::current()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawns the worker threads, named `<name>_<index>`. Calling it again does nothing.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let first = self.use_caller as usize;
        let mut threads = self.threads.lock();
        for id in first..first + self.spawn {
            let thread = Worker::start(id, self.handle.shared.clone()).map_err(Error::Spawn)?;
            threads.push(thread);
        }
        debug!(
            "scheduler {} started {} worker threads{}",
            self.handle.name(),
            self.spawn,
            if self.use_caller { " plus the caller" } else { "" }
        );
        Ok(())
    }

    /// Requests shutdown and waits for it: workers finish everything queued (and, under a
    /// reactor, every pending event and timer) before they exit. In caller mode this runs the
    /// caller's share of the work first, so it must be called on the creating thread.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = &self.handle.shared;
        shared.stop_requested.store(true, Ordering::SeqCst);
        shared.wake_all();

        if let Some(root) = self.root.lock().take() {
            if thread::current().id() != self.caller {
                error!(
                    "scheduler {}: stop() called off the creating thread, caller share not run",
                    shared.name
                );
            } else if !root.state().is_finished() {
                let prev = Fiber::scheduler_fiber();
                let hooked = hook::is_enabled();
                Fiber::set_scheduler_fiber(Arc::as_ptr(&root));
                hook::set_enabled(true);
                root.switch_in();
                hook::set_enabled(hooked);
                Fiber::set_scheduler_fiber(prev);
            }
        }

        for thread in self.threads.lock().drain(..) {
            if thread.join().is_err() {
                error!("scheduler {}: a worker thread panicked", shared.name);
            }
        }
        info!("scheduler {} stopped", shared.name);
    }
}

impl Deref for Scheduler {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.handle.name())
            .field("threads", &(self.spawn + self.use_caller as usize))
            .field("use_caller", &self.use_caller)
            .finish()
    }
}
