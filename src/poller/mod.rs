use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::Channel;

mod epoll;
mod poll;

pub(crate) use self::epoll::EpollPoller;
pub(crate) use self::poll::PollPoller;

/// Setting this environment variable selects the `poll(2)` backend, mostly
/// useful when debugging the default epoll one.
const USE_POLL_ENV: &str = "EVENTIDE_USE_POLL";

/// Readiness demultiplexer driving one event loop.
///
/// All methods must be invoked on the owning loop's thread; the loop is the
/// only caller.
pub(crate) trait Poller {
    /// Blocks up to `timeout` for readiness, stamps `revents` on each ready
    /// channel and appends it to `active`. Returns the poll-return timestamp.
    ///
    /// Poll failures other than an interruption are logged and leave
    /// `active` empty; an interruption is silent.
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Instant;

    /// Reconciles the kernel registration with the channel's interest set.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Drops the channel's registration entirely.
    fn remove_channel(&mut self, channel: &Channel);

    /// Whether this exact channel is currently registered here.
    fn has_channel(&self, channel: &Channel) -> bool;
}

pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    if std::env::var_os(USE_POLL_ENV).is_some() {
        Ok(Box::new(PollPoller::new()))
    } else {
        EpollPoller::new().map(|poller| Box::new(poller) as Box<dyn Poller>)
    }
}
