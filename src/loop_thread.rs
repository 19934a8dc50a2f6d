use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;

use crate::event_loop::{EventLoop, LoopHandle};

/// Callback invoked on each I/O loop thread right before the loop starts
/// running; also invoked for the base loop of a pool with no threads.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// Process-wide counter naming loop threads.
static NEXT_THREAD_NUM: AtomicUsize = AtomicUsize::new(1);

/// Owns an OS thread that constructs and runs exactly one [`EventLoop`].
///
/// The constructing thread blocks in [`start`](LoopThread::start) until the
/// child has published its loop's handle. Dropping the `LoopThread` asks the
/// loop to quit and joins the thread.
pub struct LoopThread {
    handle: Option<LoopHandle>,
    thread: Option<thread::JoinHandle<()>>,
    name: String,
}

impl LoopThread {
    /// Prepares a loop thread named `"<name_prefix><n>"` from the
    /// process-wide counter.
    pub fn new(name_prefix: &str) -> LoopThread {
        let num = NEXT_THREAD_NUM.fetch_add(1, Ordering::Relaxed);
        let name = if name_prefix.is_empty() {
            format!("loop-thread-{}", num)
        } else {
            format!("{}{}", name_prefix, num)
        };
        LoopThread {
            handle: None,
            thread: None,
            name,
        }
    }

    /// Spawns the thread and blocks until its loop exists.
    ///
    /// `init` runs on the new thread, after the loop is constructed and
    /// before it starts polling.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> LoopHandle {
        assert!(self.thread.is_none(), "loop thread started twice");

        let ready = Arc::new((Mutex::new(None::<LoopHandle>), Condvar::new()));
        let thread_ready = Arc::clone(&ready);
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                // Creation failure here is fatal; there is nobody to hand an
                // error back to once the thread is running.
                let event_loop = EventLoop::new().expect("failed to set up event loop");
                if let Some(init) = &init {
                    init(&event_loop.handle());
                }
                {
                    let (slot, ready) = &*thread_ready;
                    *slot.lock().unwrap() = Some(event_loop.handle());
                    ready.notify_one();
                }
                event_loop.run();
            })
            .expect("failed to spawn loop thread");

        let (slot, ready_cond) = &*ready;
        let mut slot = slot.lock().unwrap();
        while slot.is_none() {
            slot = ready_cond.wait(slot).unwrap();
        }
        let handle = slot.take().expect("loop handle published");

        debug!("loop thread {} started", self.name);
        self.handle = Some(handle.clone());
        self.thread = Some(thread);
        handle
    }

    /// The thread's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for LoopThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopThread")
            .field("name", &self.name)
            .field("started", &self.thread.is_some())
            .finish()
    }
}

/// Fixed-size pool of I/O loop threads.
///
/// With no threads the base loop doubles as the only I/O loop, making the
/// whole server single-threaded. Otherwise new work is assigned round-robin
/// across the pool.
pub struct LoopThreadPool {
    base: LoopHandle,
    name: String,
    num_threads: AtomicUsize,
    started: AtomicBool,
    threads: Mutex<Vec<LoopThread>>,
    handles: Mutex<Vec<LoopHandle>>,
    next: AtomicUsize,
}

impl LoopThreadPool {
    /// Creates an empty pool around the base loop.
    pub fn new(base: LoopHandle, name: &str) -> LoopThreadPool {
        LoopThreadPool {
            base,
            name: name.to_owned(),
            num_threads: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Sets the number of I/O threads; call before [`start`](Self::start).
    pub fn set_num_threads(&self, num_threads: usize) {
        self.num_threads.store(num_threads, Ordering::Release);
    }

    /// Spawns the configured threads. Must be called once, on the base
    /// loop's thread.
    pub fn start(&self, init: Option<ThreadInitCallback>) {
        self.base.assert_in_loop_thread();
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "loop thread pool started twice"
        );

        let num_threads = self.num_threads.load(Ordering::Acquire);
        let mut threads = self.threads.lock().unwrap();
        let mut handles = self.handles.lock().unwrap();
        for _ in 0..num_threads {
            let mut thread = LoopThread::new(&self.name);
            handles.push(thread.start(init.clone()));
            threads.push(thread);
        }
        if num_threads == 0 {
            if let Some(init) = init {
                init(&self.base);
            }
        }
        debug!("pool {} started with {} loop threads", self.name, num_threads);
    }

    /// The loop for the next piece of work, round-robin; the base loop when
    /// the pool has no threads. Must be called on the base loop's thread.
    pub fn next_loop(&self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        let handles = self.handles.lock().unwrap();
        if handles.is_empty() {
            self.base.clone()
        } else {
            let next = self.next.fetch_add(1, Ordering::Relaxed);
            handles[next % handles.len()].clone()
        }
    }

}

impl std::fmt::Debug for LoopThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopThreadPool")
            .field("name", &self.name)
            .field("num_threads", &self.num_threads.load(Ordering::Relaxed))
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}
