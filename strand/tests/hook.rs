//! Blocking calls made from runtime tasks.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdListener};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use strand::net::{TcpListener, TcpStream};
use strand::{Event, IoManager, Scheduler, hook};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

#[test]
fn interception_is_off_outside_workers() {
    init();
    assert!(!hook::is_enabled());

    let iom = IoManager::new(1, false, "switch").unwrap();
    let (tx, rx) = mpsc::channel();
    iom.spawn(move || tx.send(hook::is_enabled()).unwrap());
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));
    iom.stop();
}

#[test]
fn read_times_out_after_the_receive_timeout() {
    init();
    let iom = IoManager::new(2, false, "recv-timeout").unwrap();
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    assert!(hook::register_fd(fd));
    hook::set_recv_timeout(fd, Some(Duration::from_millis(100))).unwrap();

    let (tx, rx) = mpsc::channel();
    iom.spawn(move || {
        let start = Instant::now();
        let mut buf = [0u8; 16];
        let outcome = hook::read(fd, &mut buf).map_err(|e| e.kind());
        tx.send((outcome, start.elapsed())).unwrap();
    });

    let (outcome, elapsed) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(outcome, Err(ErrorKind::TimedOut));
    assert!(elapsed >= Duration::from_millis(100), "timed out early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(150), "timed out late: {elapsed:?}");
    assert_eq!(iom.registered(fd), Event::empty());
    iom.stop();
    hook::close(a.into_raw_fd()).unwrap();
}

#[test]
fn read_resumes_when_data_arrives() {
    init();
    let iom = IoManager::new(2, false, "recv-data").unwrap();
    let (a, mut b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    assert!(hook::register_fd(fd));

    let (tx, rx) = mpsc::channel();
    iom.spawn(move || {
        let mut buf = [0u8; 16];
        let n = hook::read(fd, &mut buf).unwrap();
        tx.send(buf[..n].to_vec()).unwrap();
    });

    // The reader is parked on the reactor, not blocking a worker.
    while iom.registered(fd) != Event::READ {
        thread::sleep(Duration::from_millis(1));
    }
    b.write_all(b"hello").unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"hello");
    iom.stop();
    hook::close(a.into_raw_fd()).unwrap();
}

#[test]
fn close_cancels_both_waiters() {
    init();
    let iom = IoManager::new(3, false, "close").unwrap();
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.into_raw_fd();
    assert!(hook::register_fd(fd));

    // Interception is off on this thread, so the write fails fast once the buffer is full.
    let chunk = [0u8; 4096];
    loop {
        match hook::write(fd, &chunk) {
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => panic!("fill: {e}"),
        }
    }

    let (tx, rx) = mpsc::channel();
    {
        let tx = tx.clone();
        iom.spawn(move || {
            let mut buf = [0u8; 8];
            let err = hook::read(fd, &mut buf).unwrap_err();
            tx.send(("read", err.raw_os_error())).unwrap();
        });
    }
    iom.spawn(move || {
        let err = hook::write(fd, b"more").unwrap_err();
        tx.send(("write", err.raw_os_error())).unwrap();
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while iom.registered(fd) != Event::READ | Event::WRITE {
        assert!(Instant::now() < deadline, "waiters never registered");
        thread::sleep(Duration::from_millis(1));
    }
    iom.spawn(move || hook::close(fd).unwrap());

    let mut results = vec![
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
    ];
    results.sort();
    assert_eq!(
        results,
        [("read", Some(libc::ECANCELED)), ("write", Some(libc::ECANCELED))]
    );
    assert_eq!(iom.pending_events(), 0);
    iom.stop();
}

#[test]
fn sleep_does_not_block_the_worker() {
    init();
    let iom = IoManager::new(1, false, "sleepers").unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    for _ in 0..10 {
        let done = done.clone();
        iom.spawn(move || {
            hook::sleep_for(Duration::from_millis(100));
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    iom.stop();

    let elapsed = start.elapsed();
    assert_eq!(done.load(Ordering::SeqCst), 10);
    assert!(elapsed >= Duration::from_millis(100));
    // Ten sleeps back to back on the only worker would take a second.
    assert!(elapsed < Duration::from_millis(500), "sleeps serialized: {elapsed:?}");
}

#[test]
fn sleep_blocks_outside_the_runtime() {
    init();
    let start = Instant::now();
    hook::usleep(20_000);
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[test]
fn fcntl_reports_the_mode_the_application_chose() {
    init();
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    assert!(hook::register_fd(fd));

    let real = |fd| unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert_ne!(real(fd) & libc::O_NONBLOCK, 0);
    assert_eq!(hook::fcntl(fd, libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK, 0);

    let flags = hook::fcntl(fd, libc::F_GETFL, 0).unwrap();
    hook::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK).unwrap();
    assert_ne!(hook::fcntl(fd, libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK, 0);

    hook::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK).unwrap();
    assert_eq!(hook::fcntl(fd, libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK, 0);
    assert_ne!(real(fd) & libc::O_NONBLOCK, 0);

    hook::set_nonblocking(fd, true).unwrap();
    assert_ne!(hook::fcntl(fd, libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK, 0);

    hook::close(a.into_raw_fd()).unwrap();
}

#[test]
fn user_nonblocking_socket_is_not_suspended() {
    init();
    let iom = IoManager::new(1, false, "user-nonblock").unwrap();
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    assert!(hook::register_fd(fd));
    hook::set_nonblocking(fd, true).unwrap();

    let (tx, rx) = mpsc::channel();
    iom.spawn(move || {
        let mut buf = [0u8; 8];
        tx.send(hook::read(fd, &mut buf).map_err(|e| e.kind())).unwrap();
    });
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        Err(ErrorKind::WouldBlock)
    );
    iom.stop();
    hook::close(a.into_raw_fd()).unwrap();
}

#[test]
fn regular_files_pass_straight_through() {
    init();
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"contents").unwrap();
    let fd = file.as_raw_fd();
    assert!(hook::register_fd(fd));
    assert_eq!(unsafe { libc::fcntl(fd, libc::F_GETFL) } & libc::O_NONBLOCK, 0);

    let iom = IoManager::new(1, false, "file").unwrap();
    let (tx, rx) = mpsc::channel();
    iom.spawn(move || {
        let mut buf = [0u8; 16];
        let n = unsafe { libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        tx.send((n, hook::write(fd, b"!").unwrap())).unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), (8, 1));
    iom.stop();
    hook::close(file.into_raw_fd()).unwrap();
}

#[test]
fn tcp_echo_round_trip() {
    init();
    let iom = IoManager::new(2, false, "echo").unwrap();

    let (addr_tx, addr_rx) = mpsc::channel();
    iom.spawn(move || {
        let listener = TcpListener::bind(loopback()).unwrap();
        addr_tx.send(listener.local_addr().unwrap()).unwrap();
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        stream.write_all(&buf[..n]).unwrap();
    });
    let addr = addr_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let (tx, rx) = mpsc::channel();
    iom.spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_nodelay(true).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        stream.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        tx.send(buf).unwrap();
    });

    assert_eq!(&rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"ping");
    iom.stop();
}

#[test]
fn connect_to_a_closed_port_is_refused() {
    init();
    let addr = {
        let unused = StdListener::bind(loopback()).unwrap();
        unused.local_addr().unwrap()
    };

    let iom = IoManager::new(1, false, "refused").unwrap();
    let (tx, rx) = mpsc::channel();
    iom.spawn(move || {
        let outcome = TcpStream::connect_timeout(addr, Duration::from_secs(1)).map(drop);
        tx.send(outcome.map_err(|e| e.kind())).unwrap();
    });
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(3)).unwrap(),
        Err(ErrorKind::ConnectionRefused)
    );
    iom.stop();
}

#[test]
fn blocking_wait_never_ends_before_the_timeout() {
    init();
    // Plain workers intercept calls but have no reactor, so the wait happens in poll(2).
    let sched = Scheduler::new(1, false, "poll-timeout").unwrap();
    sched.start().unwrap();
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    assert!(hook::register_fd(fd));
    let timeout = Duration::from_micros(30_700);
    hook::set_recv_timeout(fd, Some(timeout)).unwrap();

    let (tx, rx) = mpsc::channel();
    sched.spawn(move || {
        let start = Instant::now();
        let mut buf = [0u8; 8];
        let outcome = hook::read(fd, &mut buf).map_err(|e| e.kind());
        tx.send((outcome, start.elapsed())).unwrap();
    });

    let (outcome, elapsed) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(outcome, Err(ErrorKind::TimedOut));
    assert!(elapsed >= timeout, "timed out early: {elapsed:?}");
    sched.stop();
    hook::close(a.into_raw_fd()).unwrap();
}

#[test]
fn unbounded_receive_timeout_waits_for_data() {
    init();
    let iom = IoManager::new(2, false, "recv-max").unwrap();
    let sched = Scheduler::new(1, false, "poll-max").unwrap();
    sched.start().unwrap();

    let (a, mut b) = UnixStream::pair().unwrap();
    let (c, mut d) = UnixStream::pair().unwrap();
    let (reactor_fd, poll_fd) = (a.as_raw_fd(), c.as_raw_fd());
    for fd in [reactor_fd, poll_fd] {
        assert!(hook::register_fd(fd));
        hook::set_recv_timeout(fd, Some(Duration::MAX)).unwrap();
    }

    let (tx, rx) = mpsc::channel();
    let reader = |fd, tx: mpsc::Sender<_>| {
        move || {
            let mut buf = [0u8; 8];
            let n = hook::read(fd, &mut buf).unwrap();
            tx.send((fd, buf[..n].to_vec())).unwrap();
        }
    };
    iom.spawn(reader(reactor_fd, tx.clone()));
    sched.spawn(reader(poll_fd, tx));

    while iom.registered(reactor_fd) != Event::READ {
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err(), "a huge timeout expired immediately");

    b.write_all(b"one").unwrap();
    d.write_all(b"two").unwrap();
    let mut got = vec![
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
    ];
    got.sort();
    let mut want = vec![(reactor_fd, b"one".to_vec()), (poll_fd, b"two".to_vec())];
    want.sort();
    assert_eq!(got, want);

    iom.stop();
    sched.stop();
    hook::close(a.into_raw_fd()).unwrap();
    hook::close(c.into_raw_fd()).unwrap();
}
