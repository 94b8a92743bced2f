use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use log::debug;
use parking_lot::RwLock;

use super::sys;

const NO_TIMEOUT: u64 = u64::MAX;

/// Which of a descriptor's timeouts applies to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `SO_RCVTIMEO`: reads, receives, accept.
    Recv,
    /// `SO_SNDTIMEO`: writes, sends.
    Send,
}

/// What the hook knows about a descriptor.
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    /// The hook switched the descriptor to non-blocking.
    sys_nonblock: bool,
    /// The application asked for non-blocking mode and wants `EAGAIN` back.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> Option<Self> {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            return None;
        }
        let stat = unsafe { stat.assume_init() };
        let is_socket = stat.st_mode & libc::S_IFMT == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { sys::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 {
                if flags & libc::O_NONBLOCK == 0 {
                    unsafe { sys::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                }
                sys_nonblock = true;
            }
        }

        Some(Self {
            fd,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn timeout(&self, dir: Direction) -> Option<Duration> {
        let ms = match dir {
            Direction::Recv => self.recv_timeout.load(Ordering::Acquire),
            Direction::Send => self.send_timeout.load(Ordering::Acquire),
        };
        (ms != NO_TIMEOUT).then(|| Duration::from_millis(ms))
    }

    pub fn set_timeout(&self, dir: Direction, timeout: Option<Duration>) {
        let ms = timeout.map_or(NO_TIMEOUT, |d| d.as_millis().min(NO_TIMEOUT as u128 - 1) as u64);
        match dir {
            Direction::Recv => self.recv_timeout.store(ms, Ordering::Release),
            Direction::Send => self.send_timeout.store(ms, Ordering::Release),
        }
    }
}

/// Registry of [`FdCtx`] records indexed by descriptor number.
pub struct FdManager {
    contexts: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static FD_MANAGER: LazyLock<FdManager> = LazyLock::new(|| FdManager {
    contexts: RwLock::new(vec![None; 64]),
});

impl FdManager {
    /// The process-wide registry.
    pub fn global() -> &'static FdManager {
        &FD_MANAGER
    }

    /// Looks up `fd`, creating its record when `auto_create` is set. Returns `None` for
    /// negative or invalid descriptors.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let contexts = self.contexts.read();
            match contexts.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let ctx = Arc::new(FdCtx::new(fd)?);
        let mut contexts = self.contexts.write();
        if contexts.len() <= idx {
            let len = (idx + 1).max(contexts.len() * 3 / 2);
            contexts.resize(len, None);
        }
        if let Some(existing) = &contexts[idx] {
            return Some(existing.clone());
        }
        debug!("tracking fd {fd} (socket: {})", ctx.is_socket);
        contexts[idx] = Some(ctx.clone());
        Some(ctx)
    }

    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        if let Some(slot) = self.contexts.write().get_mut(fd as usize) {
            slot.take();
        }
    }
}
