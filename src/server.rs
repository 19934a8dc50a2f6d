use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, error, info};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    ConnectionCallback, ConnectionRef, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
use crate::event_loop::LoopHandle;
use crate::loop_thread::{LoopThreadPool, ThreadInitCallback};
use crate::net;

#[derive(Default)]
struct UserCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<(HighWaterMarkCallback, usize)>,
    thread_init: Option<ThreadInitCallback>,
}

struct ServerInner {
    main_loop: LoopHandle,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: LoopThreadPool,
    connections: Mutex<HashMap<String, ConnectionRef>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    callbacks: Mutex<UserCallbacks>,
}

/// Multi-reactor TCP server.
///
/// The main loop accepts; every accepted connection is handed to one I/O
/// loop from the pool, round-robin, and stays there for its lifetime. User
/// callbacks run on the loop owning the connection they concern.
///
/// Construct the server, install callbacks and call
/// [`start`](TcpServer::start) on the main loop's thread, then run the main
/// loop. The server must also be dropped on that thread; its destructor
/// tears down every live connection and joins the I/O threads.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    /// Creates a server bound to `listen_addr` without `SO_REUSEPORT`.
    pub fn new(
        main_loop: &LoopHandle,
        listen_addr: SocketAddr,
        name: &str,
    ) -> io::Result<TcpServer> {
        TcpServer::with_reuse_port(main_loop, listen_addr, name, false)
    }

    /// Creates a server bound to `listen_addr`, optionally sharing the port
    /// with other listening sockets via `SO_REUSEPORT`.
    pub fn with_reuse_port(
        main_loop: &LoopHandle,
        listen_addr: SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<TcpServer> {
        let acceptor = Acceptor::new(main_loop.clone(), listen_addr, reuse_port)?;
        let ip_port = acceptor.local_addr()?.to_string();
        let inner = Arc::new(ServerInner {
            main_loop: main_loop.clone(),
            name: name.to_owned(),
            ip_port,
            acceptor,
            pool: LoopThreadPool::new(main_loop.clone(), name),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            callbacks: Mutex::new(UserCallbacks::default()),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(Box::new(move |fd, peer_addr| {
                if let Some(inner) = weak.upgrade() {
                    inner.new_connection(fd, peer_addr);
                }
            }));
        Ok(TcpServer { inner })
    }

    /// The server's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound listening address; useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    /// Number of currently established connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    /// Sets the number of I/O loop threads; call before
    /// [`start`](TcpServer::start). Zero (the default) makes the main loop
    /// serve connections itself.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.set_num_threads(num_threads);
    }

    /// Installs the connect/disconnect callback.
    pub fn set_connection_callback(&self, callback: impl Fn(&ConnectionRef) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().connection = Some(Arc::new(callback));
    }

    /// Installs the incoming-data callback.
    pub fn set_message_callback(
        &self,
        callback: impl Fn(&ConnectionRef, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().message = Some(Arc::new(callback));
    }

    /// Installs the output-buffer-drained callback.
    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&ConnectionRef) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().write_complete = Some(Arc::new(callback));
    }

    /// Installs the backpressure callback, fired when a connection's output
    /// buffer first grows past `mark` bytes.
    pub fn set_high_water_mark_callback(
        &self,
        callback: impl Fn(&ConnectionRef, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.inner.callbacks.lock().unwrap().high_water_mark = Some((Arc::new(callback), mark));
    }

    /// Installs a callback run once on each I/O loop thread before it starts
    /// serving.
    pub fn set_thread_init_callback(
        &self,
        callback: impl Fn(&LoopHandle) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().thread_init = Some(Arc::new(callback));
    }

    /// Starts the pool and the acceptor. Idempotent; must be called on the
    /// main loop's thread.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let thread_init = self.inner.callbacks.lock().unwrap().thread_init.clone();
        self.inner.pool.start(thread_init);

        info!(
            "server {} starts listening on {}",
            self.inner.name, self.inner.ip_port
        );
        let acceptor = Arc::clone(&self.inner.acceptor);
        self.inner.main_loop.run_in_loop(move || acceptor.listen());
    }
}

impl ServerInner {
    /// Runs on the main loop when the acceptor hands over a new socket.
    fn new_connection(self: Arc<Self>, fd: OwnedFd, peer_addr: SocketAddr) {
        self.main_loop.assert_in_loop_thread();
        let io_loop = self.pool.next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        info!(
            "server {}: new connection {} from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match net::local_addr(fd.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("getsockname failed: {}", err);
                SocketAddr::from(([0, 0, 0, 0], 0))
            }
        };

        let connection =
            TcpConnection::new(io_loop.clone(), conn_name.clone(), fd, local_addr, peer_addr);
        {
            let callbacks = self.callbacks.lock().unwrap();
            if let Some(callback) = &callbacks.connection {
                connection.set_connection_callback(Arc::clone(callback));
            }
            if let Some(callback) = &callbacks.message {
                connection.set_message_callback(Arc::clone(callback));
            }
            if let Some(callback) = &callbacks.write_complete {
                connection.set_write_complete_callback(Arc::clone(callback));
            }
            if let Some((callback, mark)) = &callbacks.high_water_mark {
                connection.set_high_water_mark_callback(Arc::clone(callback), *mark);
            }
        }
        let weak = Arc::downgrade(&self);
        connection.set_close_callback(Box::new(move |connection| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_connection(connection);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, Arc::clone(&connection));
        io_loop.run_in_loop(move || connection.connect_established());
    }

    /// The connection's close path; may fire on any I/O loop.
    fn remove_connection(self: Arc<Self>, connection: &ConnectionRef) {
        let connection = Arc::clone(connection);
        let main_loop = self.main_loop.clone();
        main_loop.run_in_loop(move || self.remove_connection_in_loop(&connection));
    }

    fn remove_connection_in_loop(&self, connection: &ConnectionRef) {
        self.main_loop.assert_in_loop_thread();
        info!(
            "server {}: removing connection {}",
            self.name,
            connection.name()
        );
        self.connections.lock().unwrap().remove(connection.name());
        let io_loop = connection.io_loop().clone();
        let connection = Arc::clone(connection);
        io_loop.queue_in_loop(move || connection.connect_destroyed());
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        debug!("server {} shutting down", self.name);
        // Post teardown for every live connection before the pool's drop
        // joins the I/O threads; the strong captures keep each connection
        // alive through its final callback.
        for (_, connection) in self.connections.lock().unwrap().drain() {
            let io_loop = connection.io_loop().clone();
            io_loop.queue_in_loop(move || connection.connect_destroyed());
        }
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.inner.name)
            .field("addr", &self.inner.ip_port)
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .finish()
    }
}
