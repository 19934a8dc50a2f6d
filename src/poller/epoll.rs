use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::channel::{Channel, PollerIndex};
use crate::event::Readiness;
use crate::interest::Interest;
use crate::poller::Poller;

/// Initial size of the event-output vector; doubled whenever a poll fills
/// it completely.
const INITIAL_EVENT_CAPACITY: usize = 16;

/// The default demultiplexer: level-triggered epoll.
///
/// Level triggering is load-bearing for the rest of the runtime: the
/// acceptor accepts a single connection per readiness, and a partially
/// drained output buffer relies on the writable event re-firing.
pub(crate) struct EpollPoller {
    ep: OwnedFd,
    channels: HashMap<RawFd, Arc<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(EpollPoller {
            ep,
            channels: HashMap::new(),
            events: Vec::with_capacity(INITIAL_EVENT_CAPACITY),
        })
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: interest_to_epoll(channel.interest()),
            u64: fd as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)) {
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl del fd={} failed: {}", fd, err);
            } else {
                panic!("epoll_ctl add/mod fd={} failed: {}", fd, err);
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Instant {
        trace!("polling {} fds", self.channels.len());
        self.events.clear();
        let result = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout.as_millis() as libc::c_int,
        ));
        let now = Instant::now();
        match result {
            Ok(n_events) => {
                // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
                unsafe { self.events.set_len(n_events as usize) };
                for event in &self.events {
                    let fd = event.u64 as RawFd;
                    if let Some(channel) = self.channels.get(&fd) {
                        channel.set_revents(epoll_to_readiness(event.events));
                        active.push(Arc::clone(channel));
                    }
                }
                if self.events.len() == self.events.capacity() {
                    let grow_by = self.events.len();
                    self.events.reserve(grow_by);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("epoll_wait failed: {}", err),
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        trace!(
            "update channel fd={} interest={:?} index={:?}",
            channel.fd(),
            channel.interest(),
            index
        );
        match index {
            PollerIndex::New | PollerIndex::Removed => {
                if index == PollerIndex::New {
                    self.channels.insert(channel.fd(), Arc::clone(channel));
                }
                channel.set_index(PollerIndex::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            PollerIndex::Added => {
                if channel.interest().is_none() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_index(PollerIndex::Removed);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        debug!("remove channel fd={}", channel.fd());
        self.channels.remove(&channel.fd());
        if channel.index() == PollerIndex::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(PollerIndex::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |registered| std::ptr::eq(Arc::as_ptr(registered), channel))
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    // No EPOLLET; the runtime is level-triggered throughout.
    let mut kind = 0;
    if interest.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLPRI;
    }
    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    kind as u32
}

fn epoll_to_readiness(events: u32) -> Readiness {
    let events = events as libc::c_int;
    let mut readiness = Readiness::EMPTY;
    if events & libc::EPOLLIN != 0 {
        readiness = readiness.add(Readiness::READABLE);
    }
    if events & libc::EPOLLPRI != 0 {
        readiness = readiness.add(Readiness::PRIORITY);
    }
    if events & libc::EPOLLOUT != 0 {
        readiness = readiness.add(Readiness::WRITABLE);
    }
    if events & libc::EPOLLERR != 0 {
        readiness = readiness.add(Readiness::ERROR);
    }
    if events & libc::EPOLLHUP != 0 {
        readiness = readiness.add(Readiness::HANGUP);
    }
    readiness
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use crate::event_loop::EventLoop;

    #[test]
    fn readiness_round_trip() {
        let event_loop = EventLoop::new().unwrap();
        let (mut sender, receiver) = UnixStream::pair().unwrap();

        let mut poller = EpollPoller::new().unwrap();
        let channel = Channel::new(event_loop.handle(), receiver.as_raw_fd());
        channel.store_interest(Interest::READABLE);
        poller.update_channel(&channel);
        assert!(poller.has_channel(&channel));

        let mut active = Vec::new();
        poller.poll(Duration::from_millis(10), &mut active);
        assert!(active.is_empty());

        sender.write_all(b"ready").unwrap();
        poller.poll(Duration::from_millis(100), &mut active);
        assert_eq!(active.len(), 1);
        assert!(active[0].revents().is_readable());

        poller.remove_channel(&channel);
        assert!(!poller.has_channel(&channel));
        assert_eq!(channel.index(), PollerIndex::New);
    }

    #[test]
    fn empty_interest_deregisters() {
        let event_loop = EventLoop::new().unwrap();
        let (mut sender, receiver) = UnixStream::pair().unwrap();

        let mut poller = EpollPoller::new().unwrap();
        let channel = Channel::new(event_loop.handle(), receiver.as_raw_fd());
        channel.store_interest(Interest::READABLE);
        poller.update_channel(&channel);

        channel.store_interest(Interest::NONE);
        poller.update_channel(&channel);
        assert_eq!(channel.index(), PollerIndex::Removed);

        sender.write_all(b"ignored").unwrap();
        let mut active = Vec::new();
        poller.poll(Duration::from_millis(10), &mut active);
        assert!(active.is_empty());

        // Re-registration after a DEL goes back through ADD.
        channel.store_interest(Interest::READABLE);
        poller.update_channel(&channel);
        assert_eq!(channel.index(), PollerIndex::Added);
        poller.poll(Duration::from_millis(100), &mut active);
        assert_eq!(active.len(), 1);

        poller.remove_channel(&channel);
    }
}
