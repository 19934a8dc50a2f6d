use std::any::Any;
use std::fmt;
use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

/// Shared handle to a live connection, as passed to every user callback.
pub type ConnectionRef = Arc<TcpConnection>;

/// Invoked after the connection is established and again after it
/// disconnects; distinguish with [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
/// Invoked for every non-empty readable batch; the consumer advances the
/// buffer cursors.
pub type MessageCallback = Arc<dyn Fn(&ConnectionRef, &mut Buffer, Instant) + Send + Sync>;
/// Invoked when the output buffer drains to zero after a send.
pub type WriteCompleteCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
/// Invoked when the output buffer crosses the high-water mark upward.
pub type HighWaterMarkCallback = Arc<dyn Fn(&ConnectionRef, usize) + Send + Sync>;
pub(crate) type CloseCallback = Box<dyn Fn(&ConnectionRef) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            3 => State::Disconnected,
            _ => unreachable!("invalid connection state {}", value),
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One accepted TCP connection, bound for its lifetime to one I/O loop.
///
/// Shared-owned: the server's connection map, the channel's tie and task
/// closures in flight may all hold it at once; the socket closes when the
/// last holder drops. Apart from [`send`](TcpConnection::send),
/// [`shutdown`](TcpConnection::shutdown) and the state accessors, which may
/// be called from anywhere, everything runs on the owning loop's thread.
pub struct TcpConnection {
    io_loop: LoopHandle,
    name: String,
    self_ref: Weak<TcpConnection>,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    callbacks: Mutex<Callbacks>,
    high_water_mark: AtomicUsize,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
}

impl TcpConnection {
    pub(crate) fn new(
        io_loop: LoopHandle,
        name: String,
        fd: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> ConnectionRef {
        let socket = Socket::from_owned(fd);
        let channel = Channel::new(io_loop.clone(), socket.as_raw_fd());
        let connection = Arc::new_cyclic(|self_ref: &Weak<TcpConnection>| TcpConnection {
            io_loop,
            name,
            self_ref: self_ref.clone(),
            state: AtomicU8::new(State::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            callbacks: Mutex::new(Callbacks::default()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
        });
        debug!(
            "connection {} created, fd={}",
            connection.name,
            connection.socket.as_raw_fd()
        );

        if let Err(err) = connection.socket.set_keep_alive(true) {
            warn!("connection {}: keepalive failed: {}", connection.name, err);
        }

        let weak = Arc::downgrade(&connection);
        connection.channel.set_read_callback({
            let weak = weak.clone();
            move |receive_time| {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_read(receive_time);
                }
            }
        });
        connection.channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_write();
                }
            }
        });
        connection.channel.set_close_callback({
            let weak = weak.clone();
            move || {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_close();
                }
            }
        });
        connection.channel.set_error_callback(move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_error();
            }
        });
        connection
    }

    /// The unique name the server minted for this connection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local address of the accepted socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Handle of the I/O loop owning this connection.
    pub fn io_loop(&self) -> &LoopHandle {
        &self.io_loop
    }

    /// Whether the connection is currently established.
    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Whether the connection has fully disconnected.
    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Whether the connection is currently interested in incoming data.
    pub fn is_reading(&self) -> bool {
        self.channel.is_reading()
    }

    /// Enables or disables `TCP_NODELAY`.
    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    /// Enables or disables `SO_KEEPALIVE`; on by default.
    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.socket.set_keep_alive(on)
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn shared_from_this(&self) -> ConnectionRef {
        self.self_ref
            .upgrade()
            .expect("connection used during teardown")
    }

    pub(crate) fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(callback);
    }

    pub(crate) fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(callback);
    }

    pub(crate) fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(callback);
    }

    pub(crate) fn set_high_water_mark_callback(
        &self,
        callback: HighWaterMarkCallback,
        mark: usize,
    ) {
        self.callbacks.lock().unwrap().high_water_mark = Some(callback);
        self.high_water_mark.store(mark, Ordering::Release);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(callback);
    }

    /// Sends `data`, copying it over to the owning loop when called from
    /// another thread. There is no error return: the output buffer absorbs
    /// what the kernel will not take, or the connection closes.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            warn!(
                "connection {} is not connected, dropping {} bytes",
                self.name,
                data.len()
            );
            return;
        }
        if self.io_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let connection = self.shared_from_this();
            let data = data.to_vec();
            self.io_loop
                .queue_in_loop(move || connection.send_in_loop(&data));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.io_loop.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("connection {} disconnected, giving up writing", self.name);
            return;
        }

        let mut output = self.output.lock().unwrap();
        let mut written = 0;
        let mut fault = false;

        // Direct write when nothing is queued ahead of this data.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match syscall!(write(
                self.socket.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )) {
                Ok(n) => {
                    written = n as usize;
                    if written == data.len() {
                        drop(output);
                        self.queue_write_complete();
                        return;
                    }
                    trace!(
                        "connection {}: short write, {} of {} bytes",
                        self.name,
                        written,
                        data.len()
                    );
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!("connection {} write failed: {}", self.name, err);
                    if err.raw_os_error() == Some(libc::EPIPE)
                        || err.raw_os_error() == Some(libc::ECONNRESET)
                    {
                        fault = true;
                    }
                }
            }
        }

        let remaining = data.len() - written;
        if remaining > 0 && !fault {
            let old_len = output.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                let callback = self.callbacks.lock().unwrap().high_water_mark.clone();
                if let Some(callback) = callback {
                    let connection = self.shared_from_this();
                    let backlog = old_len + remaining;
                    self.io_loop
                        .queue_in_loop(move || callback(&connection, backlog));
                }
            }
            output.append(&data[written..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-closes the write side once the output buffer drains.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let connection = self.shared_from_this();
            self.io_loop.run_in_loop(move || connection.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.io_loop.assert_in_loop_thread();
        // With writes still pending, handle_write finishes the half-close
        // after the final drain.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    /// Resumes read interest after [`stop_read`](TcpConnection::stop_read);
    /// a connection starts out reading.
    pub fn start_read(&self) {
        let connection = self.shared_from_this();
        self.io_loop.run_in_loop(move || {
            if !connection.channel.is_reading() {
                connection.channel.enable_reading();
            }
        });
    }

    /// Pauses read interest, leaving inbound data in the kernel as a crude
    /// form of backpressure on the peer.
    pub fn stop_read(&self) {
        let connection = self.shared_from_this();
        self.io_loop.run_in_loop(move || {
            if connection.channel.is_reading() {
                connection.channel.disable_reading();
            }
        });
    }

    /// Drops the connection without waiting for pending output.
    pub fn force_close(&self) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let connection = self.shared_from_this();
            self.io_loop.queue_in_loop(move || connection.handle_close());
        }
    }

    /// Called exactly once, on the owning I/O loop, after the server has
    /// registered the connection.
    pub(crate) fn connect_established(&self) {
        self.io_loop.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);

        let tie: Arc<dyn Any + Send + Sync> = self.shared_from_this();
        self.channel.tie(&tie);
        self.channel.enable_reading();

        debug!("connection {} established", self.name);
        self.run_connection_callback();
    }

    /// Called exactly once, on the owning I/O loop, after the server has
    /// dropped the connection from its map.
    pub(crate) fn connect_destroyed(&self) {
        self.io_loop.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            self.run_connection_callback();
        }
        self.channel.remove();
        debug!("connection {} destroyed", self.name);
    }

    fn run_connection_callback(&self) {
        let callback = self.callbacks.lock().unwrap().connection.clone();
        if let Some(callback) = callback {
            callback(&self.shared_from_this());
        }
    }

    fn handle_read(&self, receive_time: Instant) {
        self.io_loop.assert_in_loop_thread();
        let mut input = self.input.lock().unwrap();
        match input.read_from_fd(self.socket.as_raw_fd()) {
            Ok(0) => {
                drop(input);
                trace!("connection {}: peer closed", self.name);
                self.handle_close();
            }
            Ok(n) => {
                trace!("connection {}: {} bytes in", self.name, n);
                let callback = self.callbacks.lock().unwrap().message.clone();
                if let Some(callback) = callback {
                    callback(&self.shared_from_this(), &mut input, receive_time);
                }
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                drop(input);
                error!("connection {} read failed: {}", self.name, err);
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(&self) {
        self.io_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("connection {} is down, no more writing", self.name);
            return;
        }
        let mut output = self.output.lock().unwrap();
        match output.write_to_fd(self.socket.as_raw_fd()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    drop(output);
                    self.queue_write_complete();
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                // Keep the buffered bytes; write-complete never fires for
                // them. The read path notices the broken transport.
                error!("connection {} write failed: {}", self.name, err);
            }
        }
    }

    /// Safe against re-entry: a second close, whether from a HUP event or
    /// from the teardown the first close triggered, is a no-op.
    fn handle_close(&self) {
        self.io_loop.assert_in_loop_thread();
        let state = self.state();
        if state == State::Disconnected {
            return;
        }
        debug!("connection {} closing, state {:?}", self.name, state);
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        let (connection_callback, close_callback) = {
            let mut callbacks = self.callbacks.lock().unwrap();
            (callbacks.connection.clone(), callbacks.close.take())
        };
        let connection = self.shared_from_this();
        if let Some(callback) = connection_callback {
            callback(&connection);
        }
        if let Some(callback) = close_callback {
            callback(&connection);
        }
    }

    fn handle_error(&self) {
        let mut optval: libc::c_int = 0;
        let mut optlen = size_of::<libc::c_int>() as libc::socklen_t;
        let errno = match syscall!(getsockopt(
            self.socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut libc::c_int as *mut libc::c_void,
            &mut optlen,
        )) {
            Ok(_) => optval,
            Err(err) => err.raw_os_error().unwrap_or(0),
        };
        error!(
            "connection {} error: {}",
            self.name,
            io::Error::from_raw_os_error(errno)
        );
    }

    fn queue_write_complete(&self) {
        let callback = self.callbacks.lock().unwrap().write_complete.clone();
        if let Some(callback) = callback {
            let connection = self.shared_from_this();
            self.io_loop.queue_in_loop(move || callback(&connection));
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("fd", &self.socket.as_raw_fd())
            .field("state", &self.state())
            .field("peer", &self.peer_addr)
            .finish()
    }
}
