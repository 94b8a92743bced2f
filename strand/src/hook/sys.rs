//! The real, blocking libc calls behind the hook.
//!
//! With the `interpose` feature the crate exports symbols of the same names, so the originals
//! are looked up with `dlsym(RTLD_NEXT)` once and called through the resolved pointer.
//! Otherwise these call straight into libc.

#![allow(clippy::missing_safety_doc)]

use libc::{c_int, c_uint, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, useconds_t};

#[cfg(feature = "interpose")]
fn resolve(name: &'static str) -> usize {
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast()) };
    if addr.is_null() {
        // Nothing sensible can run without the real function, and logging would recurse.
        std::process::abort();
    }
    addr as usize
}

macro_rules! real {
    ($( fn $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty; )*) => {
        $(
            #[cfg(not(feature = "interpose"))]
            #[inline]
            pub unsafe fn $name($($arg: $ty),*) -> $ret {
                unsafe { libc::$name($($arg),*) }
            }

            #[cfg(feature = "interpose")]
            pub unsafe fn $name($($arg: $ty),*) -> $ret {
                static REAL: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
                let addr = *REAL.get_or_init(|| resolve(concat!(stringify!($name), "\0")));
                let real: unsafe extern "C" fn($($ty),*) -> $ret = unsafe { std::mem::transmute(addr) };
                unsafe { real($($arg),*) }
            }
        )*
    };
}

real! {
    fn sleep(seconds: c_uint) -> c_uint;
    fn usleep(usec: useconds_t) -> c_int;
    fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int;
    fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int;
    fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int;
    fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int;
    fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t;
    fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t;
    fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t;
    fn recvfrom(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> ssize_t;
    fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t;
    fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t;
    fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t;
    fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t;
    fn sendto(fd: c_int, buf: *const c_void, len: size_t, flags: c_int, addr: *const sockaddr, addrlen: socklen_t) -> ssize_t;
    fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t;
    fn close(fd: c_int) -> c_int;
    fn setsockopt(fd: c_int, level: c_int, name: c_int, value: *const c_void, len: socklen_t) -> c_int;
}

// Never exported, so libc's own definitions are always the real ones.

pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    unsafe { libc::fcntl(fd, cmd, arg) }
}

pub unsafe fn ioctl(fd: c_int, request: libc::Ioctl, arg: *mut c_void) -> c_int {
    unsafe { libc::ioctl(fd, request, arg) }
}

pub unsafe fn getsockopt(fd: c_int, level: c_int, name: c_int, value: *mut c_void, len: *mut socklen_t) -> c_int {
    unsafe { libc::getsockopt(fd, level, name, value, len) }
}
