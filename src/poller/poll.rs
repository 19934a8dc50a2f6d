use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::channel::{Channel, PollerIndex};
use crate::event::Readiness;
use crate::interest::Interest;
use crate::poller::Poller;

/// Fallback demultiplexer over `poll(2)`.
///
/// Keeps the same registration contract as the epoll backend but holds no
/// kernel-side state: the pollfd array is rebuilt from current interest on
/// every call, which is exactly what makes it useful for debugging the
/// default backend.
pub(crate) struct PollPoller {
    channels: HashMap<RawFd, Arc<Channel>>,
    pollfds: Vec<libc::pollfd>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            channels: HashMap::new(),
            pollfds: Vec::new(),
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Instant {
        self.pollfds.clear();
        for (fd, channel) in &self.channels {
            if channel.index() == PollerIndex::Added && !channel.interest().is_none() {
                self.pollfds.push(libc::pollfd {
                    fd: *fd,
                    events: interest_to_poll(channel.interest()),
                    revents: 0,
                });
            }
        }
        trace!("polling {} fds", self.pollfds.len());
        let result = syscall!(poll(
            self.pollfds.as_mut_ptr(),
            self.pollfds.len() as libc::nfds_t,
            timeout.as_millis() as libc::c_int,
        ));
        let now = Instant::now();
        match result {
            Ok(_) => {
                for pollfd in &self.pollfds {
                    if pollfd.revents != 0 {
                        if let Some(channel) = self.channels.get(&pollfd.fd) {
                            channel.set_revents(poll_to_readiness(pollfd.revents));
                            active.push(Arc::clone(channel));
                        }
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("poll failed: {}", err),
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
            }
            PollerIndex::Added => {
                if channel.interest().is_none() {
                    channel.set_index(PollerIndex::Removed);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        debug!("remove channel fd={}", channel.fd());
        self.channels.remove(&channel.fd());
        channel.set_index(PollerIndex::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |registered| std::ptr::eq(Arc::as_ptr(registered), channel))
    }
}

fn interest_to_poll(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}

fn poll_to_readiness(revents: libc::c_short) -> Readiness {
    let mut readiness = Readiness::EMPTY;
    if revents & libc::POLLIN != 0 {
        readiness = readiness.add(Readiness::READABLE);
    }
    if revents & libc::POLLPRI != 0 {
        readiness = readiness.add(Readiness::PRIORITY);
    }
    if revents & libc::POLLOUT != 0 {
        readiness = readiness.add(Readiness::WRITABLE);
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        readiness = readiness.add(Readiness::ERROR);
    }
    if revents & libc::POLLHUP != 0 {
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

        let mut poller = PollPoller::new();
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
    }

    #[test]
    fn disabled_channel_is_not_polled() {
        let event_loop = EventLoop::new().unwrap();
        let (mut sender, receiver) = UnixStream::pair().unwrap();

        let mut poller = PollPoller::new();
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
    }
}
