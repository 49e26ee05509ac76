//! Thin owned wrapper over a non-blocking stream socket.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, SockAddr, Type};

use crate::addr::Address;

/// An owned, move-only socket handle.
///
/// The descriptor is closed exactly once, when the handle drops. Hand a
/// socket to a [`Channel`](crate::Channel) only after switching it to
/// non-blocking mode.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a new IPv4 stream socket.
    pub fn stream() -> io::Result<Socket> {
        let inner = socket2::Socket::new(Domain::IPV4, Type::STREAM, None)?;
        Ok(Socket { inner })
    }

    pub fn bind(&self, addr: &Address) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(addr.to_socket_addr()))
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accept one pending connection.
    ///
    /// The returned peer socket is already non-blocking. A `WouldBlock`
    /// error means the backlog is drained.
    pub fn accept(&self) -> io::Result<(Socket, Address)> {
        let (peer, peer_addr) = self.inner.accept()?;
        peer.set_nonblocking(true)?;

        let peer_addr = sockaddr_to_v4(&peer_addr)?;
        Ok((Socket { inner: peer }, peer_addr))
    }

    /// Start a non-blocking connect.
    ///
    /// An in-progress connect is not an error: completion is reported
    /// through writability of the descriptor.
    pub fn connect(&self, addr: &Address) -> io::Result<()> {
        match self.inner.connect(&SockAddr::from(addr.to_socket_addr())) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Shut down the write half, leaving reads open.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.send(buf)
    }

    /// Read into `buf`. `Ok(0)` means the peer performed an orderly
    /// shutdown; `WouldBlock` means no data is available right now.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(read(
            self.inner.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        ))?;
        Ok(n as usize)
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        self.inner.set_nonblocking(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    pub fn set_no_delay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub fn local_addr(&self) -> io::Result<Address> {
        sockaddr_to_v4(&self.inner.local_addr()?)
    }

    pub fn peer_addr(&self) -> io::Result<Address> {
        sockaddr_to_v4(&self.inner.peer_addr()?)
    }

    /// The pending socket error, if any (`SO_ERROR`).
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn sockaddr_to_v4(addr: &SockAddr) -> io::Result<Address> {
    match addr.as_socket() {
        Some(SocketAddr::V4(v4)) => Ok(v4.into()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not an IPv4 address",
        )),
    }
}
