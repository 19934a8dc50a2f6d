use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

pub(crate) type NewConnectionCallback = Box<dyn Fn(OwnedFd, SocketAddr) + Send>;

/// The listening-socket channel living on the main loop.
///
/// Accepts one connection per readiness event; the level-triggered poller
/// re-fires while the backlog stays non-empty.
pub(crate) struct Acceptor {
    main_loop: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
}

impl Acceptor {
    /// Creates, configures and binds the listening socket. Listening itself
    /// is deferred to [`listen`](Acceptor::listen).
    pub(crate) fn new(
        main_loop: LoopHandle,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_for(listen_addr)?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr)?;

        let channel = Channel::new(main_loop.clone(), socket.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            main_loop,
            socket,
            channel,
            new_connection_callback: Mutex::new(None),
            listening: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection_callback.lock().unwrap() = Some(callback);
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Starts listening and registers for read readiness. Must run on the
    /// main loop.
    ///
    /// # Panics
    ///
    /// Panics if the kernel refuses to listen; there is no server without a
    /// listening socket.
    pub(crate) fn listen(&self) {
        self.main_loop.assert_in_loop_thread();
        if let Err(err) = self.socket.listen() {
            panic!("listen on fd {} failed: {}", self.socket.as_raw_fd(), err);
        }
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        debug!("acceptor listening on fd {}", self.socket.as_raw_fd());
    }

    fn handle_read(&self) {
        self.main_loop.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((fd, peer_addr)) => {
                let callback = self.new_connection_callback.lock().unwrap();
                match callback.as_ref() {
                    Some(callback) => callback(fd, peer_addr),
                    // Nobody to hand the socket to; dropping it closes it.
                    None => debug!("accepted connection from {} dropped", peer_addr),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                if err.raw_os_error() == Some(libc::EMFILE) {
                    error!("accept: too many open files");
                } else {
                    error!("accept failed: {}", err);
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Runs on the main loop's thread, where the server is dropped.
        self.channel.disable_all();
        self.channel.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;

    use crate::event_loop::EventLoop;

    #[test]
    fn listen_flips_the_listening_flag_and_accepts() {
        let event_loop = EventLoop::new().unwrap();
        let acceptor = Acceptor::new(
            event_loop.handle(),
            "127.0.0.1:0".parse().unwrap(),
            false,
        )
        .unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        acceptor.set_new_connection_callback(Box::new(move |_fd, _peer_addr| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!acceptor.listening());
        acceptor.listen();
        assert!(acceptor.listening());

        // The handshake completes against the backlog, so the listening
        // socket is readable before the loop first polls.
        let client = TcpStream::connect(acceptor.local_addr().unwrap()).unwrap();
        let handle = event_loop.handle();
        let quit_handle = handle.clone();
        handle.queue_in_loop(move || quit_handle.quit());
        event_loop.run();

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        drop(client);
    }
}
