// Not all helpers are used by every test binary.
#![allow(dead_code)]

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Once};
use std::time::{Duration, Instant};

use eventide::{EventLoop, LoopHandle, TcpServer};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Spins until `condition` holds, failing the test after [`TIMEOUT`].
pub fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn any_local_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Connects a blocking client with a read timeout, so a stuck test fails
/// instead of hanging.
pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("unable to connect");
    stream
        .set_read_timeout(Some(TIMEOUT))
        .expect("unable to set read timeout");
    stream
}

/// Shared counter for callback assertions.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Counter {
        Counter::default()
    }

    pub fn add(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A server plus the main-loop thread driving it.
///
/// The main loop runs on a dedicated thread; the server is constructed
/// there too and must be dropped there, which [`drop_server`] does through
/// a posted task.
///
/// [`drop_server`]: ServerRig::drop_server
pub struct ServerRig {
    pub main_loop: LoopHandle,
    pub addr: SocketAddr,
    server: Arc<Mutex<Option<TcpServer>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ServerRig {
    /// Builds and starts a server on a fresh main-loop thread. `configure`
    /// runs on that thread with the freshly constructed server, before
    /// `start`.
    pub fn start(configure: impl FnOnce(&TcpServer) + Send + 'static) -> ServerRig {
        init();

        let server_slot = Arc::new(Mutex::new(None::<TcpServer>));
        let slot = Arc::clone(&server_slot);
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread = std::thread::spawn(move || {
            let event_loop = EventLoop::new().expect("unable to create event loop");
            let server = TcpServer::new(&event_loop.handle(), any_local_addr(), "test")
                .expect("unable to create server");
            configure(&server);
            server.start();
            let addr = server.local_addr().expect("unable to read bound address");
            *slot.lock().unwrap() = Some(server);
            ready_tx
                .send((event_loop.handle(), addr))
                .expect("unable to publish rig");
            event_loop.run();
            // Whatever is still in the slot is dropped here, on the loop's
            // own thread.
            slot.lock().unwrap().take();
        });

        let (main_loop, addr) = ready_rx.recv().expect("main loop never came up");
        ServerRig {
            main_loop,
            addr,
            server: server_slot,
            thread: Some(thread),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.server
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |server| server.connection_count())
    }

    /// Drops the server on the main loop's thread and waits for the drop
    /// (including the teardown of every live connection) to finish.
    pub fn drop_server(&self) {
        let slot = Arc::clone(&self.server);
        let (done_tx, done_rx) = mpsc::channel();
        self.main_loop.run_in_loop(move || {
            drop(slot.lock().unwrap().take());
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(TIMEOUT)
            .expect("server was never dropped");
    }
}

impl Drop for ServerRig {
    fn drop(&mut self) {
        self.drop_server();
        self.main_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
