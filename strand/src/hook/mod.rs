//! Cooperative versions of blocking calls.
//!
//! Inside a task fiber of an [`IoManager`](crate::reactor::IoManager) worker, the functions
//! here look and behave like their blocking libc namesakes but never block the OS thread:
//! sleeps become timers, and socket I/O that would block registers interest with the reactor
//! and yields until the descriptor is ready, its timeout expires, or it is closed.
//!
//! Interception is a per-thread switch ([`set_enabled`]): on for runtime workers, off for
//! every other thread, where these functions simply make the real call. The hook tracks the
//! sockets it knows about in the [`FdManager`] and keeps them non-blocking underneath,
//! while [`fcntl`] and [`ioctl`] report the mode the application asked for.
//!
//! With the `interpose` feature the same logic is also exported under the C symbol names, so
//! code that calls libc directly is intercepted as well.

pub(crate) mod addr;
mod fd_manager;
#[cfg(feature = "interpose")]
mod interpose;
mod sys;

use std::cell::Cell;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem::{self, size_of};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use libc::{c_int, c_void, sockaddr, sockaddr_storage, socklen_t};
use log::{info, trace};
use metrics::counter;

pub use self::fd_manager::{Direction, FdCtx, FdManager};
use crate::config;
use crate::fiber::Fiber;
use crate::reactor::{Event, IoHandle};
use crate::scheduler::Task;

thread_local! {
    static ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether interception is on for the calling thread.
// Out of line so a fiber that moved to another worker reads that worker's switch.
#[inline(never)]
pub fn is_enabled() -> bool {
    ENABLED.get()
}

#[inline(never)]
pub fn set_enabled(on: bool) {
    ENABLED.set(on);
}

/// The `IoManager` a blocking call can suspend on: interception is on and the caller is a task
/// fiber on one of its workers.
pub(crate) fn suspend_target() -> Option<IoHandle> {
    if !is_enabled() || !Fiber::in_task() {
        return None;
    }
    IoHandle::current()
}

fn cvt(n: isize) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn cvt_int(n: c_int) -> io::Result<c_int> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n)
    }
}

/// Starts tracking `fd` (switching sockets to non-blocking underneath). Descriptors created
/// through [`socket`] and [`accept`] on a hooked thread are tracked already.
pub fn register_fd(fd: RawFd) -> bool {
    FdManager::global().get(fd, true).is_some()
}

fn tracked_socket(fd: RawFd) -> Option<Arc<FdCtx>> {
    FdManager::global()
        .get(fd, false)
        .filter(|ctx| ctx.is_socket() && !ctx.is_closed())
}

/// Logs changes of `tcp.connect.timeout`, the hook's one tunable. Installed once.
pub(crate) fn watch_config() {
    static WATCH: Once = Once::new();
    WATCH.call_once(|| {
        config::on_change(|old, new| {
            if old.tcp.connect.timeout != new.tcp.connect.timeout {
                info!(
                    "tcp connect timeout changed from {}ms to {}ms",
                    old.tcp.connect.timeout, new.tcp.connect.timeout
                );
            }
        })
    });
}

// Sleeps.

/// Suspends the calling fiber for `duration`; blocks the thread when it cannot suspend.
pub fn sleep_for(duration: Duration) {
    let Some(iom) = suspend_target() else {
        block_sleep(duration);
        return;
    };
    let fiber = Fiber::current();
    let scheduler = iom.handle().clone();
    iom.add_timer(
        duration,
        move || scheduler.schedule(Task::Fiber(fiber.clone()), None),
        false,
    );
    Fiber::yield_to_hold();
}

pub fn sleep(seconds: u64) {
    sleep_for(Duration::from_secs(seconds));
}

pub fn usleep(micros: u64) {
    sleep_for(Duration::from_micros(micros));
}

pub fn nanosleep(duration: Duration) {
    sleep_for(duration);
}

fn block_sleep(duration: Duration) {
    let mut req = libc::timespec {
        tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };
    let mut rem = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    while unsafe { sys::nanosleep(&req, &mut rem) } != 0 {
        if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            break;
        }
        req = rem;
    }
}

// Waiting for readiness.

/// Waits until `fd` is ready for `event`, at most `timeout`. Suspends the calling fiber when
/// possible, otherwise blocks in poll(2).
fn wait_ready(fd: RawFd, event: Event, timeout: Option<Duration>) -> io::Result<()> {
    let Some(iom) = suspend_target() else {
        return poll_blocking(fd, event, timeout);
    };

    let status = Arc::new(AtomicI32::new(0));
    let timer = timeout.map(|timeout| {
        let slot = Arc::downgrade(&status);
        let reactor = Arc::downgrade(iom.reactor());
        iom.add_condition_timer(
            timeout,
            move || {
                let (Some(status), Some(reactor)) = (slot.upgrade(), reactor.upgrade()) else {
                    return;
                };
                if status
                    .compare_exchange(0, libc::ETIMEDOUT, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    reactor.cancel_event(fd, event);
                }
            },
            Arc::downgrade(&status),
            false,
        )
    });

    if let Err(e) = iom.wait_event(fd, event, status.clone()) {
        if let Some(timer) = timer {
            timer.cancel();
        }
        return Err(e);
    }
    counter!("strand_hook_suspensions_total").increment(1);
    Fiber::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }
    match status.load(Ordering::Acquire) {
        0 => Ok(()),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}

fn poll_blocking(fd: RawFd, event: Event, timeout: Option<Duration>) -> io::Result<()> {
    let events = if event == Event::READ { libc::POLLIN } else { libc::POLLOUT };
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    // A timeout past what `Instant` can represent waits forever.
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    loop {
        let ms = match deadline {
            None => -1,
            Some(deadline) => {
                // Round up so the wait never ends before the deadline.
                let left = deadline.saturating_duration_since(Instant::now());
                left.as_nanos().div_ceil(1_000_000).min(c_int::MAX as u128) as c_int
            }
        };
        match unsafe { libc::poll(&mut pfd, 1, ms) } {
            n if n > 0 => return Ok(()),
            0 => return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT)),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}

/// Runs `op` with the would-block protocol: interrupted calls are retried, would-block ones
/// wait for `event` (bounded by the descriptor's `dir` timeout) and try again.
pub(crate) fn do_io<F>(fd: RawFd, name: &str, event: Event, dir: Direction, mut op: F) -> io::Result<usize>
where
    F: FnMut() -> isize,
{
    if !is_enabled() {
        return cvt(op());
    }
    let Some(ctx) = FdManager::global().get(fd, false) else {
        return cvt(op());
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return cvt(op());
    }

    let timeout = ctx.timeout(dir);
    loop {
        let n = op();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {}
            _ => return Err(err),
        }
        trace!("{name}: fd {fd} would block, waiting for {event:?}");
        wait_ready(fd, event, timeout)?;
    }
}

// Sockets.

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd> {
    let fd = cvt_int(unsafe { sys::socket(domain, ty, protocol) })?;
    if is_enabled() {
        FdManager::global().get(fd, true);
    }
    Ok(fd)
}

/// Connects with the configured default timeout (`tcp.connect.timeout`).
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_with_timeout(fd, addr, Some(config::get().connect_timeout()))
}

/// Connects, failing with `TimedOut` if the handshake takes longer than `timeout`.
pub fn connect_with_timeout(fd: RawFd, addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
    let (storage, len) = addr::to_raw(addr);
    connect_raw(fd, (&raw const storage).cast(), len, timeout)
}

pub(crate) fn connect_raw(
    fd: RawFd,
    addr: *const sockaddr,
    len: socklen_t,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let passthrough = || cvt_int(unsafe { sys::connect(fd, addr, len) }).map(drop);
    if !is_enabled() {
        return passthrough();
    }
    let Some(ctx) = FdManager::global().get(fd, false) else {
        return passthrough();
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return passthrough();
    }

    if unsafe { sys::connect(fd, addr, len) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    wait_ready(fd, Event::WRITE, timeout)?;

    let mut so_error: c_int = 0;
    let mut optlen = size_of::<c_int>() as socklen_t;
    cvt_int(unsafe {
        sys::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut so_error).cast(),
            &mut optlen,
        )
    })?;
    match so_error {
        0 => Ok(()),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}

/// Accepts a connection; the new descriptor is tracked like the listening one.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, Option<SocketAddr>)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = size_of::<sockaddr_storage>() as socklen_t;
    let conn = accept_raw(fd, (&raw mut storage).cast(), &mut len)?;
    Ok((conn, addr::from_raw(&storage, len)))
}

pub(crate) fn accept_raw(fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> io::Result<RawFd> {
    let conn = do_io(fd, "accept", Event::READ, Direction::Recv, || unsafe {
        sys::accept(fd, addr, len) as isize
    })? as RawFd;
    if is_enabled() {
        FdManager::global().get(conn, true);
    }
    Ok(conn)
}

// Reads.

/// Reads into `buf`. On a tracked blocking-mode socket inside a runtime task, a read that
/// would block suspends the fiber until the socket is readable or its receive timeout
/// (`SO_RCVTIMEO`) passes.
///
/// # Arguments
///
/// * `fd` - Descriptor to read from
/// * `buf` - Destination; at most `buf.len()` bytes are read
///
/// # Returns
///
/// The byte count, `0` at end of stream. [`TimedOut`](io::ErrorKind::TimedOut) when the receive
/// timeout passes, `ECANCELED` when the descriptor is closed while waiting.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", Event::READ, Direction::Recv, || unsafe {
        sys::read(fd, buf.as_mut_ptr().cast(), buf.len())
    })
}

/// Scatter form of [`read`].
///
/// # Arguments
///
/// * `fd` - Descriptor to read from
/// * `bufs` - Filled in order
pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    let count = bufs.len().min(c_int::MAX as usize) as c_int;
    do_io(fd, "readv", Event::READ, Direction::Recv, || unsafe {
        sys::readv(fd, bufs.as_ptr().cast(), count)
    })
}

/// [`read`] with `recv(2)` flags.
///
/// # Arguments
///
/// * `fd` - Socket to read from
/// * `buf` - Destination
/// * `flags` - `MSG_*` flags passed through unchanged
pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, "recv", Event::READ, Direction::Recv, || unsafe {
        sys::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags)
    })
}

/// [`recv`] that also reports the sender, when the socket has one.
pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = size_of::<sockaddr_storage>() as socklen_t;
    let n = do_io(fd, "recvfrom", Event::READ, Direction::Recv, || unsafe {
        sys::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            flags,
            (&raw mut storage).cast(),
            &mut len,
        )
    })?;
    Ok((n, addr::from_raw(&storage, len)))
}

/// `recvmsg(2)` with the same waiting as [`read`].
///
/// # Safety
///
/// `msg` must describe valid, writable buffers for the duration of the call.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: c_int) -> io::Result<usize> {
    do_io(fd, "recvmsg", Event::READ, Direction::Recv, || unsafe {
        sys::recvmsg(fd, msg, flags)
    })
}

// Writes.

/// Writes from `buf`. Waits like [`read`], for writability and up to the send timeout
/// (`SO_SNDTIMEO`).
///
/// # Arguments
///
/// * `fd` - Descriptor to write to
/// * `buf` - Bytes to write; a short write is returned as is
///
/// # Returns
///
/// The byte count written. [`TimedOut`](io::ErrorKind::TimedOut) when the send timeout passes,
/// `ECANCELED` when the descriptor is closed while waiting.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", Event::WRITE, Direction::Send, || unsafe {
        sys::write(fd, buf.as_ptr().cast(), buf.len())
    })
}

/// Gather form of [`write`].
pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let count = bufs.len().min(c_int::MAX as usize) as c_int;
    do_io(fd, "writev", Event::WRITE, Direction::Send, || unsafe {
        sys::writev(fd, bufs.as_ptr().cast(), count)
    })
}

/// [`write`] with `send(2)` flags.
///
/// # Arguments
///
/// * `fd` - Socket to write to
/// * `buf` - Bytes to send
/// * `flags` - `MSG_*` flags passed through unchanged
pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, "send", Event::WRITE, Direction::Send, || unsafe {
        sys::send(fd, buf.as_ptr().cast(), buf.len(), flags)
    })
}

/// [`send`] to an explicit destination.
///
/// # Arguments
///
/// * `fd` - Socket to write to
/// * `buf` - Bytes to send
/// * `flags` - `MSG_*` flags passed through unchanged
/// * `addr` - Destination address
pub fn sendto(fd: RawFd, buf: &[u8], flags: c_int, addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = addr::to_raw(addr);
    do_io(fd, "sendto", Event::WRITE, Direction::Send, || unsafe {
        sys::sendto(
            fd,
            buf.as_ptr().cast(),
            buf.len(),
            flags,
            (&raw const storage).cast(),
            len,
        )
    })
}

/// `sendmsg(2)` with the same waiting as [`write`].
///
/// # Safety
///
/// `msg` must describe valid buffers for the duration of the call.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: c_int) -> io::Result<usize> {
    do_io(fd, "sendmsg", Event::WRITE, Direction::Send, || unsafe {
        sys::sendmsg(fd, msg, flags)
    })
}

// Descriptor control.

/// Closes `fd`. Waiters blocked on it are resumed first and fail with `ECANCELED`.
pub fn close(fd: RawFd) -> io::Result<()> {
    let manager = FdManager::global();
    if let Some(ctx) = manager.get(fd, false) {
        ctx.mark_closed();
        if is_enabled() {
            if let Some(iom) = IoHandle::current() {
                iom.cancel_all(fd);
            }
        }
        manager.remove(fd);
    }
    cvt_int(unsafe { sys::close(fd) }).map(drop)
}

/// `fcntl` with an integer argument. For tracked sockets `F_SETFL` records the application's
/// `O_NONBLOCK` choice while keeping the descriptor non-blocking, and `F_GETFL` reports that
/// choice back.
pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> io::Result<c_int> {
    match cmd {
        libc::F_SETFL => {
            let arg = match tracked_socket(fd) {
                Some(ctx) => {
                    ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        arg | libc::O_NONBLOCK
                    } else {
                        arg & !libc::O_NONBLOCK
                    }
                }
                None => arg,
            };
            cvt_int(unsafe { sys::fcntl(fd, cmd, arg) })
        }
        libc::F_GETFL => {
            let flags = cvt_int(unsafe { sys::fcntl(fd, cmd, 0) })?;
            Ok(match tracked_socket(fd) {
                Some(ctx) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            })
        }
        _ => cvt_int(unsafe { sys::fcntl(fd, cmd, arg) }),
    }
}

/// # Safety
///
/// `arg` must be what `request` expects.
pub unsafe fn ioctl(fd: RawFd, request: libc::Ioctl, arg: *mut c_void) -> io::Result<c_int> {
    if request == libc::FIONBIO {
        let on = unsafe { *arg.cast::<c_int>() } != 0;
        if let Some(ctx) = tracked_socket(fd) {
            ctx.set_user_nonblock(on);
            return Ok(0);
        }
    }
    cvt_int(unsafe { sys::ioctl(fd, request, arg) })
}

/// `ioctl(FIONBIO)`.
pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    let mut value = on as c_int;
    unsafe { ioctl(fd, libc::FIONBIO, (&raw mut value).cast()) }.map(drop)
}

/// # Safety
///
/// `value` and `len` must be valid for writes as `getsockopt(2)` requires.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *mut c_void,
    len: *mut socklen_t,
) -> io::Result<()> {
    cvt_int(unsafe { sys::getsockopt(fd, level, name, value, len) }).map(drop)
}

/// `setsockopt`. Receive and send timeouts set on a tracked descriptor also bound how long
/// hooked calls wait for it.
///
/// # Safety
///
/// `value` must point to `len` readable bytes.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> io::Result<()> {
    if level == libc::SOL_SOCKET
        && (name == libc::SO_RCVTIMEO || name == libc::SO_SNDTIMEO)
        && len as usize >= size_of::<libc::timeval>()
        && !value.is_null()
    {
        if let Some(ctx) = FdManager::global().get(fd, false) {
            let tv = unsafe { &*value.cast::<libc::timeval>() };
            let timeout = Duration::from_secs(tv.tv_sec.max(0) as u64)
                + Duration::from_micros(tv.tv_usec.max(0) as u64);
            let dir = if name == libc::SO_RCVTIMEO { Direction::Recv } else { Direction::Send };
            // A zero timeval means no timeout.
            ctx.set_timeout(dir, (!timeout.is_zero()).then_some(timeout));
        }
    }
    cvt_int(unsafe { sys::setsockopt(fd, level, name, value, len) }).map(drop)
}

fn set_timeout_opt(fd: RawFd, name: c_int, timeout: Option<Duration>) -> io::Result<()> {
    let timeout = timeout.unwrap_or_default();
    let tv = libc::timeval {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    unsafe {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            (&raw const tv).cast(),
            size_of::<libc::timeval>() as socklen_t,
        )
    }
}

/// `SO_RCVTIMEO`; `None` waits forever.
pub fn set_recv_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    set_timeout_opt(fd, libc::SO_RCVTIMEO, timeout)
}

/// `SO_SNDTIMEO`; `None` waits forever.
pub fn set_send_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    set_timeout_opt(fd, libc::SO_SNDTIMEO, timeout)
}
