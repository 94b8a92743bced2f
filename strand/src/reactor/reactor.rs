use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use log::{error, trace};
use metrics::counter;
use mio::event::Event as MioEvent;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Mutex, RwLock};

use super::Event;
use super::fd_context::{EventContext, FdContext, Target};
use crate::fiber::{Callback, Fiber, FiberState};
use crate::scheduler::{Handle, Shared, Task, WorkerHandle};
use crate::timer::TimerManager;

const WAKER_TOKEN: Token = Token(usize::MAX);
const INITIAL_FDS: usize = 32;
const EVENTS_CAPACITY: usize = 256;

struct PollState {
    poll: Poll,
    events: Events,
}

/// Readiness multiplexing and timers shared by the workers of one `IoManager`.
///
/// One worker at a time owns the poll and blocks in it; the rest park. Registration goes
/// through a cloned [`Registry`] so it never waits for the poller.
pub(crate) struct Reactor {
    state: Mutex<PollState>,
    registry: Registry,
    waker: Arc<Waker>,
    polling: AtomicBool,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    pending: AtomicUsize,
    pub timers: TimerManager,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let timers = TimerManager::new();
        let front = waker.clone();
        timers.on_timer_inserted_at_front(move || {
            let _ = front.wake();
        });

        Ok(Self {
            state: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
            }),
            registry,
            waker,
            polling: AtomicBool::new(false),
            contexts: RwLock::new((0..INITIAL_FDS as RawFd).map(FdContext::new).collect()),
            pending: AtomicUsize::new(0),
            timers,
        })
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            error!("reactor wake failed: {e}");
        }
    }

    pub fn wake_if_polling(&self) {
        if self.polling.load(Ordering::SeqCst) {
            self.wake();
        }
    }

    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// No registered event and no timer left.
    pub fn is_quiescent(&self) -> bool {
        self.pending_events() == 0 && !self.timers.has_timer()
    }

    fn context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().get(fd as usize).cloned()
    }

    fn context_or_grow(&self, fd: RawFd) -> Arc<FdContext> {
        if let Some(ctx) = self.context(fd) {
            return ctx;
        }
        let mut contexts = self.contexts.write();
        let idx = fd as usize;
        if contexts.len() <= idx {
            let len = (idx + 1).max(contexts.len() * 3 / 2);
            let start = contexts.len();
            contexts.extend((start..len).map(|fd| FdContext::new(fd as RawFd)));
        }
        contexts[idx].clone()
    }

    pub fn registered(&self, fd: RawFd) -> Event {
        self.context(fd).map(|ctx| ctx.lock().events).unwrap_or_default()
    }

    /// Moves the kernel registration of `fd` from `old` to `new` interest.
    fn update_interest(&self, fd: RawFd, old: Event, new: Event) -> io::Result<()> {
        let mut source = SourceFd(&fd);
        let token = Token(fd as usize);
        match (old.is_empty(), interest(new)) {
            (true, Some(interest)) => self.registry.register(&mut source, token, interest),
            (false, Some(interest)) => self.registry.reregister(&mut source, token, interest),
            (false, None) => self.registry.deregister(&mut source),
            (true, None) => Ok(()),
        }
    }

    /// Registers interest in one event kind of `fd`.
    ///
    /// # Panics
    ///
    /// Panics if `event` is not exactly one kind, or if that kind is already registered.
    pub fn add_event(
        &self,
        owner: &Handle,
        fd: RawFd,
        event: Event,
        target: Target,
        status: Option<Arc<AtomicI32>>,
    ) -> io::Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes exactly one event kind, got {event:?}"
        );
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let ctx = self.context_or_grow(fd);
        let mut state = ctx.lock();
        if state.events.intersects(event) {
            error!(
                "add_event: fd={fd} already has {event:?} registered (registered={:?})",
                state.events
            );
            panic!("duplicate registration of {event:?} on fd {fd}");
        }

        let new = state.events | event;
        if let Err(e) = self.update_interest(fd, state.events, new) {
            error!("add_event: registering fd={fd} for {new:?} failed: {e}");
            return Err(e);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        state.events = new;
        *state.slot(event) = Some(EventContext {
            scheduler: Handle::current().unwrap_or_else(|| owner.clone()),
            target,
            status,
        });
        Ok(())
    }

    /// Captures the running fiber as the target of `event`; the caller yields afterwards.
    pub fn wait_event(&self, owner: &Handle, fd: RawFd, event: Event, status: Arc<AtomicI32>) -> io::Result<()> {
        let fiber = Fiber::current();
        assert_eq!(fiber.state(), FiberState::Exec, "only a running fiber can wait for an event");
        self.add_event(owner, fd, event, Target::Fiber(fiber), Some(status))
    }

    pub fn add_callback(&self, owner: &Handle, fd: RawFd, event: Event, cb: Callback) -> io::Result<()> {
        self.add_event(owner, fd, event, Target::Call(cb), None)
    }

    /// Removes interest in `event`; the registered target is dropped without running.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.remove_event(fd, event, false)
    }

    /// Removes interest in `event` and runs its target once, marking a waiting hook call
    /// as cancelled.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.remove_event(fd, event, true)
    }

    fn remove_event(&self, fd: RawFd, event: Event, fire: bool) -> bool {
        let Some(ctx) = self.context(fd) else {
            return false;
        };
        let mut state = ctx.lock();
        if !state.events.contains(event) || event.is_empty() {
            return false;
        }

        let left = state.events - event;
        if let Err(e) = self.update_interest(fd, state.events, left) {
            error!("removing {event:?} from fd={fd} failed: {e}");
            return false;
        }

        for kind in [Event::READ, Event::WRITE] {
            if event.contains(kind) {
                if fire {
                    state.trigger(kind, true);
                } else {
                    state.clear(kind);
                }
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        true
    }

    /// Cancels every event registered on `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.context(fd) else {
            return false;
        };
        let events = ctx.lock().events;
        if events.is_empty() {
            return false;
        }
        self.cancel_event(fd, events)
    }

    /// One idle round of worker `me`: wait for readiness bounded by the next timer deadline
    /// and the configured maximum, queue expired timers, then trigger ready descriptors. A
    /// worker that finds another one already polling parks instead.
    pub fn idle(&self, shared: &Shared, me: &WorkerHandle) {
        let Some(mut state) = self.state.try_lock() else {
            shared.park(me);
            return;
        };

        let mut timeout = shared.max_wait();
        if let Some(next) = self.timers.next_timeout() {
            timeout = timeout.min(next);
        }
        self.polling.store(true, Ordering::SeqCst);
        if shared.has_work_for(me.id) {
            timeout = Duration::ZERO;
        }

        let PollState { poll, events } = &mut *state;
        let polled = loop {
            match poll.poll(events, Some(timeout)) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        self.polling.store(false, Ordering::SeqCst);
        if let Err(e) = polled {
            error!("reactor poll failed: {e}");
            events.clear();
        }

        let mut expired = Vec::new();
        self.timers.collect_expired(&mut expired);
        let mut dispatched = expired.len();
        if !expired.is_empty() {
            shared.schedule_batch(expired.into_iter().map(|cb| Task::call(move || cb())));
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            dispatched += self.dispatch(event);
        }
        drop(state);

        if dispatched > 0 {
            trace!("reactor dispatched {dispatched} timers and events");
            counter!("strand_reactor_events_total").increment(dispatched as u64);
            // Hand the poll over while this worker runs what it just queued.
            shared.try_unpark_one();
        }
    }

    fn dispatch(&self, event: &MioEvent) -> usize {
        let fd = event.token().0 as RawFd;
        let Some(ctx) = self.context(fd) else {
            return 0;
        };

        let mut ready = Event::empty();
        if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
            ready = Event::READ | Event::WRITE;
        } else {
            if event.is_readable() || event.is_read_closed() {
                ready |= Event::READ;
            }
            if event.is_writable() || event.is_write_closed() {
                ready |= Event::WRITE;
            }
        }

        let mut state = ctx.lock();
        let ready = ready & state.events;
        if ready.is_empty() {
            return 0;
        }

        let left = state.events - ready;
        if let Err(e) = self.update_interest(fd, state.events, left) {
            error!("reactor: updating fd={} to {left:?} failed: {e}", ctx.fd);
            return 0;
        }

        let mut fired = 0;
        for kind in [Event::READ, Event::WRITE] {
            if ready.contains(kind) {
                state.trigger(kind, false);
                self.pending.fetch_sub(1, Ordering::SeqCst);
                fired += 1;
            }
        }
        fired
    }
}

fn interest(event: Event) -> Option<Interest> {
    match (event.contains(Event::READ), event.contains(Event::WRITE)) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}
