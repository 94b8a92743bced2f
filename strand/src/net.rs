//! TCP sockets over the hook.
//!
//! These read like `std::net` but every potentially blocking call goes through
//! [`hook`](crate::hook), so inside a runtime task they suspend the fiber instead of the
//! worker thread. [`TcpServer`] builds an accept loop on top of them.

use std::io::{self, Read, Write};
use std::mem::{self, size_of};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use libc::{c_int, sockaddr_storage, socklen_t};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::config;
use crate::hook;
use crate::reactor::IoHandle;

const BACKLOG: c_int = 1024;

fn domain(addr: &SocketAddr) -> c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

fn new_stream_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    hook::socket(domain(addr), libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
}

fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    sock_name(fd, libc::getsockname)
}

fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    sock_name(fd, libc::getpeername)
}

fn sock_name(
    fd: RawFd,
    f: unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut socklen_t) -> c_int,
) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = size_of::<sockaddr_storage>() as socklen_t;
    if unsafe { f(fd, (&raw mut storage).cast(), &mut len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    hook::addr::from_raw(&storage, len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"))
}

/// A listening TCP socket. The descriptor is closed on drop.
pub struct TcpListener {
    fd: RawFd,
}

impl TcpListener {
    /// Creates a socket with `SO_REUSEADDR`, binds it and starts listening.
    ///
    /// # Arguments
    ///
    /// * `addr` - Local address; port `0` picks a free one, see [`local_addr`](Self::local_addr)
    ///
    /// # Returns
    ///
    /// The listener, or the error of whichever of socket, bind or listen failed.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let fd = new_stream_socket(&addr)?;
        // Owns the descriptor from here, so errors below close it.
        let listener = Self { fd };

        let on: c_int = 1;
        unsafe {
            hook::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&raw const on).cast(),
                size_of::<c_int>() as socklen_t,
            )?;
        }
        let (storage, len) = hook::addr::to_raw(&addr);
        if unsafe { libc::bind(fd, (&raw const storage).cast(), len) } < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::listen(fd, BACKLOG) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(listener)
    }

    /// Waits for the next connection. Inside a runtime task only the fiber waits.
    ///
    /// # Returns
    ///
    /// The connected stream and the peer's address.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (fd, addr) = hook::accept(self.fd)?;
        let stream = TcpStream { fd };
        let addr = match addr {
            Some(addr) => addr,
            None => stream.peer_addr()?,
        };
        Ok((stream, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr(self.fd)
    }

    /// Stops listening. Pending and later accepts fail instead of waiting.
    fn shut_down(&self) -> io::Result<()> {
        if unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let _ = hook::close(self.fd);
    }
}

/// A connected TCP socket. The descriptor is closed on drop.
pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    /// Connects within the configured `tcp.connect.timeout`.
    ///
    /// # Arguments
    ///
    /// * `addr` - Remote address to connect to
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let fd = new_stream_socket(&addr)?;
        let stream = Self { fd };
        hook::connect(fd, &addr)?;
        Ok(stream)
    }

    /// Connects, failing with [`TimedOut`](io::ErrorKind::TimedOut) when the handshake takes
    /// longer than `timeout`.
    ///
    /// # Arguments
    ///
    /// * `addr` - Remote address to connect to
    /// * `timeout` - Upper bound on the handshake
    pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let fd = new_stream_socket(&addr)?;
        let stream = Self { fd };
        hook::connect_with_timeout(fd, &addr, Some(timeout))?;
        Ok(stream)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        peer_addr(self.fd)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr(self.fd)
    }

    /// Bounds every later read; a read that waits longer fails with
    /// [`TimedOut`](io::ErrorKind::TimedOut).
    ///
    /// # Arguments
    ///
    /// * `timeout` - The bound, `None` to wait forever
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::set_recv_timeout(self.fd, timeout)
    }

    /// Same as [`set_read_timeout`](Self::set_read_timeout) for writes.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::set_send_timeout(self.fd, timeout)
    }

    /// Sets `TCP_NODELAY`.
    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        let value = on as c_int;
        unsafe {
            hook::setsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                (&raw const value).cast(),
                size_of::<c_int>() as socklen_t,
            )
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        if unsafe { libc::shutdown(self.fd, how) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        hook::read(self.fd, buf)
    }
}

impl Read for &TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        hook::read(self.fd, buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        hook::write(self.fd, buf)
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        hook::writev(self.fd, bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        hook::write(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let _ = hook::close(self.fd);
    }
}

type Handler = dyn Fn(TcpStream, SocketAddr) + Send + Sync;

/// Accepts connections on one or more listeners and hands each to a handler.
///
/// Accept loops run as tasks on one [`IoManager`](crate::IoManager) and every accepted
/// connection is handled by a task on another (or the same) one. Each connection gets the
/// server's read timeout, which starts out as `tcp_server.read_timeout`.
///
/// ```no_run
/// use std::io::{Read, Write};
/// use strand::IoManager;
/// use strand::net::TcpServer;
///
/// let io = IoManager::new(4, false, "io").unwrap();
/// let accept = IoManager::new(1, false, "accept").unwrap();
/// let server = TcpServer::new(&io, &accept, |mut stream, _peer| {
///     let mut buf = [0u8; 1024];
///     while let Ok(n @ 1..) = stream.read(&mut buf) {
///         let _ = stream.write_all(&buf[..n]);
///     }
/// });
/// server.bind(&["127.0.0.1:8080".parse().unwrap()]).unwrap();
/// server.start();
/// ```
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    io: IoHandle,
    accept: IoHandle,
    handler: Box<Handler>,
    listeners: Mutex<Vec<Arc<TcpListener>>>,
    /// Milliseconds, `0` for none.
    read_timeout: AtomicU64,
    stopped: AtomicBool,
}

impl TcpServer {
    /// Creates a stopped server with no listeners.
    ///
    /// # Arguments
    ///
    /// * `io` - Runs one `handler` task per accepted connection
    /// * `accept` - Runs the accept loops
    /// * `handler` - Called with each connection and its peer address
    pub fn new<F>(io: &IoHandle, accept: &IoHandle, handler: F) -> Self
    where
        F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ServerInner {
                io: io.clone(),
                accept: accept.clone(),
                handler: Box::new(handler),
                listeners: Mutex::new(Vec::new()),
                read_timeout: AtomicU64::new(config::get().tcp_server.read_timeout),
                stopped: AtomicBool::new(true),
            }),
        }
    }

    /// Binds a listener on every address in `addrs`.
    ///
    /// # Arguments
    ///
    /// * `addrs` - Local addresses; port `0` picks a free one
    ///
    /// # Returns
    ///
    /// `Ok` when all of them bound. Otherwise every address that failed with its error, and
    /// none of the listeners from this call are kept.
    pub fn bind(&self, addrs: &[SocketAddr]) -> Result<(), Vec<(SocketAddr, io::Error)>> {
        let mut bound = Vec::with_capacity(addrs.len());
        let mut failed = Vec::new();
        for &addr in addrs {
            match TcpListener::bind(addr) {
                Ok(listener) => bound.push(listener),
                Err(e) => {
                    error!("tcp server: bind {addr} failed: {e}");
                    failed.push((addr, e));
                }
            }
        }
        if !failed.is_empty() {
            return Err(failed);
        }

        let mut listeners = self.inner.listeners.lock();
        for listener in bound {
            // Accept loops must suspend even when the listener was created off the runtime.
            hook::register_fd(listener.fd);
            match listener.local_addr() {
                Ok(addr) => info!("tcp server: listening on {addr}"),
                Err(e) => warn!("tcp server: listening on fd {}: {e}", listener.fd),
            }
            listeners.push(Arc::new(listener));
        }
        Ok(())
    }

    /// Addresses of the current listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        match self.inner.read_timeout.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Read timeout for connections accepted from now on, `None` for none.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX).max(1));
        self.inner.read_timeout.store(ms, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Starts one accept loop per listener. Does nothing if already running.
    pub fn start(&self) {
        if !self.inner.stopped.swap(false, Ordering::AcqRel) {
            return;
        }
        for listener in self.inner.listeners.lock().iter() {
            let inner = self.inner.clone();
            let listener = listener.clone();
            self.inner.accept.spawn(move || inner.accept_loop(&listener));
        }
    }

    /// Stops accepting and releases the listeners. Connections already handed out keep
    /// running. Binding again is needed before another [`start`](Self::start).
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        for listener in self.inner.listeners.lock().drain(..) {
            if let Err(e) = listener.shut_down() {
                debug!("tcp server: shutdown fd {}: {e}", listener.fd);
            }
            self.inner.accept.cancel_all(listener.fd);
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerInner {
    fn accept_loop(self: Arc<Self>, listener: &TcpListener) {
        while !self.stopped.load(Ordering::Acquire) {
            let (stream, peer) = match listener.accept() {
                Ok(conn) => conn,
                Err(_) if self.stopped.load(Ordering::Acquire) => break,
                Err(e) => {
                    error!("tcp server: accept on fd {}: {e}", listener.fd);
                    continue;
                }
            };
            let timeout = match self.read_timeout.load(Ordering::Relaxed) {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            };
            if let Err(e) = stream.set_read_timeout(timeout) {
                warn!("tcp server: read timeout for {peer}: {e}");
            }
            debug!("tcp server: accepted {peer}");
            let this = self.clone();
            self.io.spawn(move || (this.handler)(stream, peer));
        }
        debug!("tcp server: accept loop on fd {} finished", listener.fd);
    }
}
