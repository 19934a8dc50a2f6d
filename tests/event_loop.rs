use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eventide::{EventLoop, LoopThread, LoopThreadPool};

mod util;

use util::{init, TIMEOUT};

#[test]
fn task_posted_from_another_thread_runs_on_loop_thread() {
    init();

    let mut loop_thread = LoopThread::new("affinity-");
    let handle = loop_thread.start(None);

    let (tx, rx) = mpsc::channel();
    handle.run_in_loop(move || {
        tx.send(thread::current().id()).unwrap();
    });
    let loop_tid = rx.recv_timeout(TIMEOUT).unwrap();
    assert_ne!(loop_tid, thread::current().id());

    // Queueing directly lands on the same thread.
    let (tx, rx) = mpsc::channel();
    handle.queue_in_loop(move || {
        tx.send(thread::current().id()).unwrap();
    });
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), loop_tid);
}

#[test]
fn run_in_loop_is_inline_on_the_loop_thread() {
    init();

    let mut loop_thread = LoopThread::new("inline-");
    let handle = loop_thread.start(None);

    let (tx, rx) = mpsc::channel();
    let inner_handle = handle.clone();
    handle.run_in_loop(move || {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_inner = Arc::clone(&ran);
        inner_handle.run_in_loop(move || {
            ran_inner.fetch_add(1, Ordering::SeqCst);
        });
        // Already on the loop thread, so the nested task ran inline.
        tx.send(ran.load(Ordering::SeqCst)).unwrap();
    });
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 1);
}

#[test]
fn task_queued_during_drain_wakes_the_next_iteration() {
    init();

    let mut loop_thread = LoopThread::new("requeue-");
    let handle = loop_thread.start(None);

    let (tx, rx) = mpsc::channel();
    let inner_handle = handle.clone();
    handle.queue_in_loop(move || {
        let started = Instant::now();
        inner_handle.queue_in_loop(move || {
            tx.send(started.elapsed()).unwrap();
        });
    });
    let elapsed = rx.recv_timeout(TIMEOUT).unwrap();
    // Without the drain-time wakeup the follow-up task would sit out the
    // full ten second poll.
    assert!(
        elapsed < Duration::from_secs(2),
        "follow-up task took {:?}",
        elapsed
    );
}

#[test]
#[should_panic(expected = "another event loop already exists")]
fn second_loop_on_one_thread_is_fatal() {
    let _first = EventLoop::new().unwrap();
    let _second = EventLoop::new();
}

#[test]
fn pool_round_robin_alternates_between_loops() {
    init();

    let (tx, rx) = mpsc::channel();
    let base_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let pool = LoopThreadPool::new(event_loop.handle(), "rr-");
        pool.set_num_threads(2);
        pool.start(None);

        let mut tids = Vec::new();
        for _ in 0..6 {
            let io_loop = pool.next_loop();
            let (tid_tx, tid_rx) = mpsc::channel();
            io_loop.run_in_loop(move || {
                tid_tx.send(thread::current().id()).unwrap();
            });
            tids.push(tid_rx.recv_timeout(TIMEOUT).unwrap());
        }
        tx.send(tids).unwrap();
    });

    let tids = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(tids.len(), 6);
    assert_eq!(tids[0], tids[2]);
    assert_eq!(tids[2], tids[4]);
    assert_eq!(tids[1], tids[3]);
    assert_eq!(tids[3], tids[5]);
    assert_ne!(tids[0], tids[1]);
    base_thread.join().unwrap();
}

#[test]
fn thread_init_runs_once_per_io_loop() {
    init();

    let (tx, rx) = mpsc::channel();
    let base_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let pool = LoopThreadPool::new(event_loop.handle(), "init-");
        pool.set_num_threads(3);

        let inits = Arc::new(Mutex::new(Vec::new()));
        let init_log = Arc::clone(&inits);
        pool.start(Some(Arc::new(move |_loop_handle| {
            init_log.lock().unwrap().push(thread::current().id());
        })));

        // start() waits for every handshake, so all init callbacks ran.
        tx.send(inits.lock().unwrap().clone()).unwrap();
    });

    let inits = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(inits.len(), 3);
    // One init per distinct loop thread.
    for (i, tid) in inits.iter().enumerate() {
        for other in &inits[i + 1..] {
            assert_ne!(tid, other);
        }
    }
    base_thread.join().unwrap();
}
