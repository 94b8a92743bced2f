//! Readiness registration on an `IoManager`.

use std::io::{ErrorKind, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use strand::{Event, Fiber, IoManager};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn nonblocking_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

/// Writes into `stream` until its send buffer is full.
fn fill(stream: &mut UnixStream) {
    let chunk = [0u8; 4096];
    loop {
        match stream.write(&chunk) {
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => panic!("fill: {e}"),
        }
    }
}

fn counter(count: &Arc<AtomicUsize>) -> Box<dyn FnOnce() + Send> {
    let count = count.clone();
    Box::new(move || {
        count.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn read_callback_runs_once_data_arrives() {
    init();
    let iom = IoManager::new(2, false, "readable").unwrap();
    let (a, mut b) = nonblocking_pair();
    let fd = a.as_raw_fd();

    let (tx, rx) = mpsc::channel();
    iom.add_event(fd, Event::READ, Some(Box::new(move || tx.send(()).unwrap())))
        .unwrap();
    assert_eq!(iom.registered(fd), Event::READ);
    assert_eq!(iom.pending_events(), 1);

    // Nothing to read yet.
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    b.write_all(b"ping").unwrap();
    rx.recv_timeout(Duration::from_secs(2)).expect("read callback never ran");
    assert_eq!(iom.registered(fd), Event::empty());
    assert_eq!(iom.pending_events(), 0);
    iom.stop();
}

#[test]
fn duplicate_registration_panics_and_keeps_the_first() {
    init();
    let iom = IoManager::new(1, false, "duplicate").unwrap();
    let (a, _b) = nonblocking_pair();
    let fd = a.as_raw_fd();

    let first = Arc::new(AtomicUsize::new(0));
    iom.add_event(fd, Event::READ, Some(counter(&first))).unwrap();

    let second = Arc::new(AtomicUsize::new(0));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        iom.add_event(fd, Event::READ, Some(counter(&second)))
    }));
    assert!(outcome.is_err());
    assert_eq!(iom.registered(fd), Event::READ);
    assert_eq!(iom.pending_events(), 1);

    assert!(iom.cancel_event(fd, Event::READ));
    iom.stop();
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_event_fires_that_kind_only() {
    init();
    let iom = IoManager::new(2, false, "cancel-one").unwrap();
    let (mut a, _b) = nonblocking_pair();
    fill(&mut a);
    let fd = a.as_raw_fd();

    let reads = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));
    iom.add_event(fd, Event::READ, Some(counter(&reads))).unwrap();
    iom.add_event(fd, Event::WRITE, Some(counter(&writes))).unwrap();
    assert_eq!(iom.registered(fd), Event::READ | Event::WRITE);

    assert!(iom.cancel_event(fd, Event::READ));
    assert!(!iom.cancel_event(fd, Event::READ));
    assert_eq!(iom.registered(fd), Event::WRITE);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert_eq!(writes.load(Ordering::SeqCst), 0);

    assert!(iom.del_event(fd, Event::WRITE));
    assert_eq!(iom.pending_events(), 0);
    iom.stop();
    assert_eq!(writes.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_all_fires_every_registered_kind() {
    init();
    let iom = IoManager::new(2, false, "cancel-all").unwrap();
    let (mut a, _b) = nonblocking_pair();
    fill(&mut a);
    let fd = a.as_raw_fd();

    let fired = Arc::new(AtomicUsize::new(0));
    iom.add_event(fd, Event::READ, Some(counter(&fired))).unwrap();
    iom.add_event(fd, Event::WRITE, Some(counter(&fired))).unwrap();

    assert!(iom.cancel_all(fd));
    assert!(!iom.cancel_all(fd));
    assert_eq!(iom.registered(fd), Event::empty());
    iom.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn deleted_event_never_fires() {
    init();
    let iom = IoManager::new(1, false, "delete").unwrap();
    let (a, mut b) = nonblocking_pair();
    let fd = a.as_raw_fd();

    let fired = Arc::new(AtomicUsize::new(0));
    iom.add_event(fd, Event::READ, Some(counter(&fired))).unwrap();
    assert!(iom.del_event(fd, Event::READ));
    assert!(!iom.del_event(fd, Event::READ));

    b.write_all(b"late").unwrap();
    thread::sleep(Duration::from_millis(50));
    iom.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn waiting_fiber_resumes_on_readiness() {
    init();
    let iom = IoManager::new(2, false, "fiber-wait").unwrap();
    let (a, mut b) = nonblocking_pair();
    let fd = a.as_raw_fd();

    let (tx, rx) = mpsc::channel();
    let io = iom.io_handle().clone();
    iom.spawn(move || {
        io.add_event(fd, Event::READ, None).unwrap();
        tx.send("waiting").unwrap();
        Fiber::yield_to_hold();
        tx.send("resumed").unwrap();
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("waiting"));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    b.write_all(b"x").unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("resumed"));
    iom.stop();
}

#[test]
fn stop_waits_for_pending_events() {
    init();
    let iom = IoManager::new(2, false, "drain-events").unwrap();
    let (a, mut b) = nonblocking_pair();
    let fd = a.as_raw_fd();

    let fired = Arc::new(AtomicUsize::new(0));
    iom.add_event(fd, Event::READ, Some(counter(&fired))).unwrap();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        b.write_all(b"done").unwrap();
        b
    });
    iom.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(iom.pending_events(), 0);
    drop(writer.join().unwrap());
}

#[test]
fn io_manager_is_current_inside_its_tasks() {
    init();
    assert!(IoManager::current().is_none());

    let iom = IoManager::new(2, true, "current").unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let seen = seen.clone();
        iom.spawn(move || {
            if IoManager::current().is_some() && strand::hook::is_enabled() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    iom.stop();
    assert_eq!(seen.load(Ordering::SeqCst), 8);
    assert_eq!(iom.registered(900_000), Event::empty());
}
