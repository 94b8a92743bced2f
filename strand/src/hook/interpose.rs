//! C symbols shadowing libc's blocking calls for the whole process.
//!
//! Each export either forwards to the real function (interception off, or nothing to suspend
//! on) or runs the hooked version and translates its `io::Result` back to the C convention of
//! `-1` plus `errno`. `fcntl` and `ioctl` are variadic and stay facade-only.

use std::io;
use std::time::Duration;

use libc::{c_int, c_uint, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, useconds_t};

use super::{Direction, do_io, suspend_target, sys};
use crate::config;
use crate::reactor::Event;

fn set_errno(err: &io::Error) {
    unsafe { *libc::__errno_location() = err.raw_os_error().unwrap_or(libc::EIO) };
}

fn ret_len(result: io::Result<usize>) -> ssize_t {
    match result {
        Ok(n) => n as ssize_t,
        Err(e) => {
            set_errno(&e);
            -1
        }
    }
}

fn ret_int(result: io::Result<c_int>) -> c_int {
    match result {
        Ok(n) => n,
        Err(e) => {
            set_errno(&e);
            -1
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if suspend_target().is_none() {
        return unsafe { sys::sleep(seconds) };
    }
    super::sleep_for(Duration::from_secs(seconds.into()));
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn usleep(usec: useconds_t) -> c_int {
    if suspend_target().is_none() {
        return unsafe { sys::usleep(usec) };
    }
    super::sleep_for(Duration::from_micros(usec.into()));
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if suspend_target().is_none() || req.is_null() {
        return unsafe { sys::nanosleep(req, rem) };
    }
    let req = unsafe { &*req };
    if req.tv_sec < 0 || !(0..1_000_000_000).contains(&req.tv_nsec) {
        set_errno(&io::Error::from_raw_os_error(libc::EINVAL));
        return -1;
    }
    super::sleep_for(Duration::new(req.tv_sec as u64, req.tv_nsec as u32));
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    ret_int(super::socket(domain, ty, protocol))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let timeout = config::get().connect_timeout();
    ret_int(super::connect_raw(fd, addr, len, Some(timeout)).map(|()| 0))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    ret_int(super::accept_raw(fd, addr, len))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    ret_len(do_io(fd, "read", Event::READ, Direction::Recv, || unsafe {
        sys::read(fd, buf, count)
    }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    ret_len(do_io(fd, "readv", Event::READ, Direction::Recv, || unsafe {
        sys::readv(fd, iov, iovcnt)
    }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    ret_len(do_io(fd, "recv", Event::READ, Direction::Recv, || unsafe {
        sys::recv(fd, buf, len, flags)
    }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    ret_len(do_io(fd, "recvfrom", Event::READ, Direction::Recv, || unsafe {
        sys::recvfrom(fd, buf, len, flags, addr, addrlen)
    }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    ret_len(do_io(fd, "recvmsg", Event::READ, Direction::Recv, || unsafe {
        sys::recvmsg(fd, msg, flags)
    }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    ret_len(do_io(fd, "write", Event::WRITE, Direction::Send, || unsafe {
        sys::write(fd, buf, count)
    }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    ret_len(do_io(fd, "writev", Event::WRITE, Direction::Send, || unsafe {
        sys::writev(fd, iov, iovcnt)
    }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    ret_len(do_io(fd, "send", Event::WRITE, Direction::Send, || unsafe {
        sys::send(fd, buf, len, flags)
    }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    ret_len(do_io(fd, "sendto", Event::WRITE, Direction::Send, || unsafe {
        sys::sendto(fd, buf, len, flags, addr, addrlen)
    }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    ret_len(do_io(fd, "sendmsg", Event::WRITE, Direction::Send, || unsafe {
        sys::sendmsg(fd, msg, flags)
    }))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    ret_int(super::close(fd).map(|()| 0))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> c_int {
    ret_int(unsafe { super::setsockopt(fd, level, name, value, len) }.map(|()| 0))
}
