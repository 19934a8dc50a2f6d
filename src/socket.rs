use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::error;

use crate::net::{self, socket_addr, to_socket_addr};

/// Listen backlog for all listening sockets.
const LISTEN_BACKLOG: libc::c_int = 1024;

/// An owned, non-blocking TCP socket descriptor.
///
/// Closing is by drop; the owning acceptor or connection must have
/// deregistered the descriptor from its loop first.
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a fresh non-blocking, close-on-exec socket for `addr`'s family.
    pub(crate) fn new_for(addr: SocketAddr) -> io::Result<Socket> {
        net::new_tcp_socket(addr).map(|fd| Socket { fd })
    }

    /// Wraps a descriptor accepted elsewhere; it must already be
    /// non-blocking and close-on-exec.
    pub(crate) fn from_owned(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub(crate) fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let (raw_addr, raw_addr_length) = socket_addr(&addr);
        syscall!(bind(self.fd.as_raw_fd(), raw_addr.as_ptr(), raw_addr_length)).map(|_| ())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd.as_raw_fd(), LISTEN_BACKLOG)).map(|_| ())
    }

    /// Accepts one pending connection; the returned descriptor is atomically
    /// non-blocking and close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd.as_raw_fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut length,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        // SAFETY: `accept4(2)` returned a valid, owned descriptor and
        // initialised the address storage.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let peer_addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((fd, peer_addr))
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        net::local_addr(self.fd.as_raw_fd())
    }

    /// Half-closes the write side, letting the peer finish reading.
    pub(crate) fn shutdown_write(&self) {
        if let Err(err) = syscall!(shutdown(self.fd.as_raw_fd(), libc::SHUT_WR)) {
            error!("shutdown write on fd {} failed: {}", self.fd.as_raw_fd(), err);
        }
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.set_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    fn set_option(&self, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
        let optval: libc::c_int = on as libc::c_int;
        syscall!(setsockopt(
            self.fd.as_raw_fd(),
            level,
            name,
            &optval as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
