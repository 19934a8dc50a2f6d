use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::trace;

use crate::event::Readiness;
use crate::event_loop::{self, LoopHandle};
use crate::interest::Interest;

pub(crate) type ReadCallback = Box<dyn FnMut(Instant) + Send>;
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

/// Registration state of a channel inside its loop's poller.
///
/// Drives the poller's choice between ADD, MOD and DEL: a `New` or `Removed`
/// channel is (re-)added, an `Added` one is modified, or deleted once its
/// interest set empties.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PollerIndex {
    New = 0,
    Added = 1,
    Removed = 2,
}

impl PollerIndex {
    fn from_u8(value: u8) -> PollerIndex {
        match value {
            0 => PollerIndex::New,
            1 => PollerIndex::Added,
            2 => PollerIndex::Removed,
            _ => unreachable!("invalid poller index {}", value),
        }
    }
}

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Binds one file descriptor, its interest set and its event callbacks to
/// the loop that owns it.
///
/// A channel never owns its descriptor. The acceptor, connection or loop
/// that created the channel owns both, and must disable and remove the
/// channel before closing the descriptor.
///
/// All methods that mutate interest or reach the poller must run on the
/// owning loop's thread; they go through the thread-local current-loop slot,
/// which enforces exactly that.
pub(crate) struct Channel {
    owner: LoopHandle,
    fd: RawFd,
    self_ref: Weak<Channel>,
    interest: AtomicU8,
    revents: AtomicU8,
    index: AtomicU8,
    tied: AtomicBool,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub(crate) fn new(owner: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_ref| Channel {
            owner,
            fd,
            self_ref: self_ref.clone(),
            interest: AtomicU8::new(Interest::NONE.bits()),
            revents: AtomicU8::new(Readiness::EMPTY.bits()),
            index: AtomicU8::new(PollerIndex::New as u8),
            tied: AtomicBool::new(false),
            tie: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn interest(&self) -> Interest {
        Interest::from_bits(self.interest.load(Ordering::Acquire))
    }

    pub(crate) fn set_read_callback(&self, callback: impl FnMut(Instant) + Send + 'static) {
        self.callbacks.lock().unwrap().read = Some(Box::new(callback));
    }

    pub(crate) fn set_write_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().write = Some(Box::new(callback));
    }

    pub(crate) fn set_close_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().close = Some(Box::new(callback));
    }

    pub(crate) fn set_error_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().error = Some(Box::new(callback));
    }

    /// Ties this channel to its owning object. Dispatch upgrades the weak
    /// reference and skips entirely when the owner is already gone, so a
    /// close torn down earlier in the same poll batch cannot leave a
    /// dangling dispatch behind.
    pub(crate) fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(Arc::downgrade(owner));
        self.tied.store(true, Ordering::Release);
    }

    pub(crate) fn enable_reading(&self) {
        self.store_interest(self.interest().add(Interest::READABLE));
        self.update();
    }

    pub(crate) fn disable_reading(&self) {
        self.store_interest(self.interest().remove(Interest::READABLE));
        self.update();
    }

    pub(crate) fn enable_writing(&self) {
        self.store_interest(self.interest().add(Interest::WRITABLE));
        self.update();
    }

    pub(crate) fn disable_writing(&self) {
        self.store_interest(self.interest().remove(Interest::WRITABLE));
        self.update();
    }

    pub(crate) fn disable_all(&self) {
        self.store_interest(Interest::NONE);
        self.update();
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    /// Raw interest store without the poller round-trip; interest mutators
    /// and backend tests compose this with an explicit update.
    pub(crate) fn store_interest(&self, interest: Interest) {
        self.interest.store(interest.bits(), Ordering::Release);
    }

    /// Called by the poller right before the channel lands on the active
    /// list.
    pub(crate) fn set_revents(&self, revents: Readiness) {
        self.revents.store(revents.bits(), Ordering::Release);
    }

    pub(crate) fn revents(&self) -> Readiness {
        Readiness::from_bits(self.revents.load(Ordering::Acquire))
    }

    pub(crate) fn index(&self) -> PollerIndex {
        PollerIndex::from_u8(self.index.load(Ordering::Acquire))
    }

    pub(crate) fn set_index(&self, index: PollerIndex) {
        self.index.store(index as u8, Ordering::Release);
    }

    /// Reconciles the kernel registration with the current interest set.
    fn update(&self) {
        let this = self.self_ref.upgrade().expect("channel updated during teardown");
        event_loop::update_channel(&self.owner, &this);
    }

    /// Deregisters from the owning loop's poller.
    pub(crate) fn remove(&self) {
        debug_assert!(
            event_loop::has_channel(&self.owner, self),
            "removing a channel its loop does not know"
        );
        event_loop::remove_channel(&self.owner, self);
    }

    /// Dispatches the callbacks matching the reported readiness.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        if self.tied.load(Ordering::Acquire) {
            let guard = self.tie.lock().unwrap().as_ref().and_then(Weak::upgrade);
            match guard {
                Some(_owner) => self.handle_event_with_guard(receive_time),
                None => trace!("channel fd={} owner gone, dispatch skipped", self.fd),
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let revents = self.revents();
        trace!("channel fd={} handling {:?}", self.fd, revents);
        let mut callbacks = self.callbacks.lock().unwrap();
        if revents.is_hangup() && !revents.is_readable() {
            if let Some(callback) = callbacks.close.as_mut() {
                callback();
            }
        }
        if revents.is_error() {
            if let Some(callback) = callbacks.error.as_mut() {
                callback();
            }
        }
        if revents.is_readable() || revents.is_priority() {
            if let Some(callback) = callbacks.read.as_mut() {
                callback(receive_time);
            }
        }
        if revents.is_writable() {
            if let Some(callback) = callbacks.write.as_mut() {
                callback();
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .field("index", &self.index())
            .finish()
    }
}
