use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::channel::Channel;
use crate::poller::{self, Poller};
use crate::waker::Waker;

/// Poll timeout; bounds how long a quiescent loop sleeps between iterations.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    /// The loop constructed on this thread, if any. One loop per thread.
    static CURRENT_LOOP: RefCell<Option<Rc<LoopCore>>> = const { RefCell::new(None) };
}

/// State reachable from other threads.
struct LoopShared {
    thread: ThreadId,
    quit: AtomicBool,
    waker: Waker,
    pending_tasks: Mutex<Vec<Task>>,
    draining_tasks: AtomicBool,
}

/// State owned by the loop's own thread.
struct LoopCore {
    shared: Arc<LoopShared>,
    poller: RefCell<Box<dyn Poller>>,
    poll_return_time: Cell<Instant>,
    looping: Cell<bool>,
}

/// Cloneable cross-thread handle to an [`EventLoop`].
///
/// This is the only way other threads interact with a loop: they post tasks
/// into its queue (and wake it), ask it to quit, or compare thread
/// identities. Everything else the loop owns is confined to its thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Whether the calling thread is the loop's own thread.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Panics unless called on the loop's own thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop owned by thread {:?} entered from thread {:?}",
                self.shared.thread,
                thread::current().id()
            );
        }
    }

    /// Runs `task` on the loop's thread: immediately when already there,
    /// otherwise via the task queue.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` for the loop's next task drain and wakes the loop when
    /// it could otherwise sleep through the new work.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared
            .pending_tasks
            .lock()
            .unwrap()
            .push(Box::new(task));
        // The drain swaps the queue out before running anything, so a task
        // queued by a draining task needs the wakeup as much as one queued
        // from another thread.
        if !self.is_in_loop_thread() || self.shared.draining_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Makes the loop leave [`EventLoop::run`] after its current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        if let Err(err) = self.shared.waker.wake() {
            error!("loop wakeup failed: {}", err);
        }
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}

/// A per-thread reactor.
///
/// Each loop polls its demultiplexer, dispatches ready channels, then drains
/// its task queue, forever until told to quit. There is exactly one loop per
/// thread; constructing a second on the same thread panics. A loop must be
/// constructed, run and dropped on the same thread.
pub struct EventLoop {
    core: Rc<LoopCore>,
    wake_channel: Arc<Channel>,
}

impl EventLoop {
    /// Creates the loop for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already has an event loop.
    pub fn new() -> io::Result<EventLoop> {
        let waker = Waker::new()?;
        let poller = poller::new_default_poller()?;
        let shared = Arc::new(LoopShared {
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            waker,
            pending_tasks: Mutex::new(Vec::new()),
            draining_tasks: AtomicBool::new(false),
        });
        let core = Rc::new(LoopCore {
            shared: Arc::clone(&shared),
            poller: RefCell::new(poller),
            poll_return_time: Cell::new(Instant::now()),
            looping: Cell::new(false),
        });

        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_some() {
                panic!(
                    "another event loop already exists on thread {:?}",
                    thread::current().id()
                );
            }
            *current = Some(Rc::clone(&core));
        });

        let handle = LoopHandle { shared };
        let wake_channel = Channel::new(handle.clone(), handle.shared.waker.as_raw_fd());
        let wake_shared = Arc::clone(&handle.shared);
        wake_channel.set_read_callback(move |_| wake_shared.waker.drain());
        wake_channel.enable_reading();

        debug!("event loop created on {:?}", thread::current().id());
        Ok(EventLoop { core, wake_channel })
    }

    /// A cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.core.shared),
        }
    }

    /// Runs the loop until [`LoopHandle::quit`].
    ///
    /// Each iteration polls for up to ten seconds, dispatches every ready
    /// channel in report order, then drains the pending tasks.
    pub fn run(&self) {
        self.handle().assert_in_loop_thread();
        self.core.looping.set(true);
        self.core.shared.quit.store(false, Ordering::Release);
        debug!("event loop starts looping");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.core.shared.quit.load(Ordering::Acquire) {
            active.clear();
            let receive_time = self
                .core
                .poller
                .borrow_mut()
                .poll(POLL_TIMEOUT, &mut active);
            self.core.poll_return_time.set(receive_time);
            for channel in &active {
                channel.handle_event(receive_time);
            }
            self.drain_pending_tasks();
        }

        debug!("event loop stops looping");
        self.core.looping.set(false);
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(task);
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().queue_in_loop(task);
    }

    /// See [`LoopHandle::quit`].
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// The timestamp the demultiplexer last returned; usually the arrival
    /// time of whatever is being dispatched.
    pub fn poll_return_time(&self) -> Instant {
        self.core.poll_return_time.get()
    }

    fn drain_pending_tasks(&self) {
        let shared = &self.core.shared;
        shared.draining_tasks.store(true, Ordering::Release);
        // Swap the queue out so tasks run outside the lock; producers keep
        // queueing freely, and anything they add during the drain waits for
        // the wakeup they also wrote.
        let tasks = std::mem::take(&mut *shared.pending_tasks.lock().unwrap());
        for task in tasks {
            task();
        }
        shared.draining_tasks.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wake_channel.disable_all();
        self.wake_channel.remove();
        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = None;
        });
        debug!("event loop destroyed on {:?}", thread::current().id());
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.core.shared.thread)
            .field("looping", &self.core.looping.get())
            .finish()
    }
}

fn with_current_core<R>(handle: &LoopHandle, f: impl FnOnce(&LoopCore) -> R) -> R {
    handle.assert_in_loop_thread();
    CURRENT_LOOP.with(|current| {
        let current = current.borrow();
        let core = current
            .as_ref()
            .expect("no event loop constructed on this thread");
        debug_assert!(Arc::ptr_eq(&core.shared, &handle.shared));
        f(core)
    })
}

/// Reconciles `channel`'s kernel registration on its owning loop.
///
/// Must be called on the owning loop's thread.
pub(crate) fn update_channel(handle: &LoopHandle, channel: &Arc<Channel>) {
    with_current_core(handle, |core| {
        core.poller.borrow_mut().update_channel(channel);
    });
}

/// Removes `channel` from its owning loop's poller.
///
/// Must be called on the owning loop's thread.
pub(crate) fn remove_channel(handle: &LoopHandle, channel: &Channel) {
    with_current_core(handle, |core| {
        core.poller.borrow_mut().remove_channel(channel);
    });
}

/// Whether `channel` is registered with its owning loop's poller.
///
/// Must be called on the owning loop's thread.
pub(crate) fn has_channel(handle: &LoopHandle, channel: &Channel) -> bool {
    with_current_core(handle, |core| core.poller.borrow().has_channel(channel))
}
