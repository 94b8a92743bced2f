//! Scheduler behaviour without a reactor: distribution, affinity, caller mode and fiber
//! requeueing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strand::{Fiber, FiberState, Handle, Scheduler, Task};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

#[test]
fn every_callable_runs_exactly_once() {
    init();
    let sched = Scheduler::new(4, false, "spread").unwrap();
    sched.start().unwrap();

    let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..1000).map(|_| AtomicUsize::new(0)).collect());
    for i in 0..1000 {
        let hits = hits.clone();
        sched.schedule(
            Task::call(move || {
                hits[i].fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
    }
    sched.stop();

    for (i, hit) in hits.iter().enumerate() {
        assert_eq!(hit.load(Ordering::SeqCst), 1, "task {i}");
    }
}

#[test]
fn batch_schedule_runs_in_order_on_one_worker() {
    init();
    let sched = Scheduler::new(1, false, "batch").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<Task> = (0..20)
        .map(|i| {
            let seen = seen.clone();
            Task::call(move || seen.lock().push(i))
        })
        .collect();
    sched.schedule_batch(tasks);
    sched.start().unwrap();
    sched.stop();

    assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
}

#[test]
fn caller_mode_runs_on_the_creating_thread() {
    init();
    let me = thread::current().id();
    let sched = Scheduler::new(1, true, "caller-only").unwrap();
    sched.start().unwrap();

    let seen: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..10 {
        let seen = seen.clone();
        sched.spawn(move || seen.lock().push(thread::current().id()));
    }
    // Nothing can run before stop(): the only worker is this thread.
    assert!(seen.lock().is_empty());
    sched.stop();

    let seen = seen.lock();
    assert_eq!(seen.len(), 10);
    assert!(seen.iter().all(|id| *id == me));
    assert!(!strand::hook::is_enabled());
}

#[test]
fn caller_mode_shares_work_with_spawned_workers() {
    init();
    let sched = Scheduler::new(3, true, "caller-mixed").unwrap();
    sched.start().unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let ran = ran.clone();
        sched.spawn(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 200);
}

#[test]
fn pinned_tasks_run_on_their_worker() {
    init();
    let sched = Scheduler::new(3, false, "pinned").unwrap();
    sched.start().unwrap();

    let workers = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..50 {
        let workers = workers.clone();
        sched.schedule(
            Task::call(move || workers.lock().push(Handle::current_worker())),
            Some(1),
        );
    }
    sched.stop();

    let workers = workers.lock();
    assert_eq!(workers.len(), 50);
    assert!(workers.iter().all(|w| *w == Some(1)));
}

#[test]
fn pin_to_a_missing_worker_runs_anywhere() {
    init();
    let sched = Scheduler::new(2, false, "bad-pin").unwrap();
    sched.start().unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    for pin in [2, 7, usize::MAX] {
        let ran = ran.clone();
        sched.schedule(
            Task::call(move || {
                assert!(Handle::current_worker().is_some_and(|w| w < 2));
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            Some(pin),
        );
    }

    let stopper = thread::spawn(move || sched.stop());
    assert!(wait_until(Duration::from_secs(2), || stopper.is_finished()), "stop hung");
    assert_eq!(ran.load(Ordering::SeqCst), 3);
}

#[test]
fn yield_to_ready_requeues_the_fiber() {
    init();
    let sched = Scheduler::new(2, false, "requeue").unwrap();
    sched.start().unwrap();

    let steps = Arc::new(AtomicUsize::new(0));
    let fiber = {
        let steps = steps.clone();
        Fiber::new(move || {
            for _ in 0..5 {
                steps.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready();
            }
            steps.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
    };
    sched.schedule(Task::Fiber(fiber.clone()), None);
    sched.stop();

    assert_eq!(steps.load(Ordering::SeqCst), 6);
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn held_task_resumes_when_rescheduled() {
    init();
    let sched = Scheduler::new(2, false, "hold").unwrap();
    sched.start().unwrap();

    let parked: Arc<Mutex<Option<Arc<Fiber>>>> = Arc::new(Mutex::new(None));
    let done = Arc::new(AtomicBool::new(false));
    {
        let parked = parked.clone();
        let done = done.clone();
        sched.spawn(move || {
            *parked.lock() = Some(Fiber::current());
            Fiber::yield_to_hold();
            done.store(true, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(2), || parked.lock().is_some()));
    let fiber = parked.lock().take().unwrap();
    assert!(wait_until(Duration::from_secs(2), || fiber.state() == FiberState::Hold));
    assert!(!done.load(Ordering::SeqCst));

    sched.schedule(Task::Fiber(fiber), None);
    assert!(wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst)));
    sched.stop();
}

#[test]
fn panicking_task_does_not_take_the_worker_down() {
    init();
    let sched = Scheduler::new(1, false, "panics").unwrap();
    sched.start().unwrap();

    sched.spawn(|| panic!("task failure"));
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let ran = ran.clone();
        sched.spawn(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 5);
}

#[test]
fn current_handle_is_visible_inside_tasks_only() {
    init();
    assert!(Handle::current().is_none());
    assert!(Handle::current_worker().is_none());

    let sched = Scheduler::new(2, false, "visible").unwrap();
    sched.start().unwrap();

    let name = Arc::new(Mutex::new(None));
    {
        let name = name.clone();
        sched.spawn(move || {
            let handle = Handle::current().expect("inside a worker");
            *name.lock() = Some(handle.name().to_string());
            // Tasks spawned from tasks land on the same scheduler.
            handle.spawn(|| assert!(Handle::current().is_some()));
        });
    }
    sched.stop();

    assert_eq!(name.lock().as_deref(), Some("visible"));
    assert!(Handle::current().is_none());
}

#[test]
fn stop_is_idempotent_and_drop_stops() {
    init();
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let sched = Scheduler::new(2, false, "drop").unwrap();
        sched.start().unwrap();
        let ran = ran.clone();
        sched.spawn(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        sched.stop();
    }
    {
        let sched = Scheduler::new(2, false, "drop-only").unwrap();
        sched.start().unwrap();
        let ran = ran.clone();
        sched.spawn(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(ran.load(Ordering::SeqCst), 2);
}
