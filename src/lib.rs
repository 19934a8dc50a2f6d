//! A multi-reactor, non-blocking TCP server runtime.
//!
//! Eventide follows the "one loop per thread, plus a pool of I/O loops"
//! pattern: a single *main loop* accepts TCP connections and a fixed-size
//! pool of *I/O loops* serves them, each connection bound for its lifetime
//! to exactly one loop chosen round-robin. Within a loop everything is
//! cooperative and single-threaded; the only cross-thread primitives are a
//! per-loop task queue and an eventfd wakeup.
//!
//! Readiness is level-triggered throughout. Each connection exposes a
//! byte-stream interface through growable input/output buffers, with
//! write-complete and high-water-mark notifications for backpressure and a
//! half-close that waits for pending output to drain.
//!
//! # Example
//!
//! An echo server on four I/O threads:
//!
//! ```no_run
//! use eventide::{EventLoop, TcpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let server = TcpServer::new(
//!         &event_loop.handle(),
//!         "127.0.0.1:7000".parse().unwrap(),
//!         "echo",
//!     )?;
//!     server.set_thread_num(4);
//!     server.set_message_callback(|conn, buf, _receive_time| {
//!         let data = buf.retrieve_all_as_bytes();
//!         conn.send(&data);
//!     });
//!     server.start();
//!     event_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! # Threading rules
//!
//! * An [`EventLoop`] must be constructed, run and dropped on one thread,
//!   and there can be only one per thread.
//! * [`TcpServer`] must be constructed, started and dropped on the main
//!   loop's thread.
//! * User callbacks run on the loop owning the connection; touch a
//!   connection from elsewhere only through its thread-safe surface
//!   ([`TcpConnection::send`], [`TcpConnection::shutdown`], state
//!   accessors) or by posting a task to its loop.
//!
//! Setting the `EVENTIDE_USE_POLL` environment variable swaps the epoll
//! demultiplexer for a `poll(2)`-based one, which can help when debugging.

#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
mod macros;

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod event;
mod event_loop;
mod interest;
mod loop_thread;
mod net;
mod poller;
mod server;
mod socket;
mod waker;

pub use crate::buffer::Buffer;
pub use crate::connection::{
    ConnectionCallback, ConnectionRef, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use crate::event_loop::{EventLoop, LoopHandle};
pub use crate::loop_thread::{LoopThread, LoopThreadPool, ThreadInitCallback};
pub use crate::server::TcpServer;
