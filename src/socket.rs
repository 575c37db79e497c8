//! Move-only, non-blocking IPv4 TCP socket handle.
//!
//! A `NonBlockingSocket` owns at most one OS descriptor. The type is not
//! `Clone`; ownership moves with the value, and `take()` moves it out of a
//! place explicitly, leaving the invalid sentinel behind. A live descriptor
//! is released exactly once: by `close()` or, failing that, on drop.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::SocketError;

/// Raw OS descriptor used as the key for reactor registrations and the
/// connection table.
pub type Handle = RawFd;

/// Sentinel returned by [`NonBlockingSocket::handle`] once the socket is
/// closed or moved out.
pub const INVALID_HANDLE: Handle = -1;

#[derive(Debug, Default)]
pub struct NonBlockingSocket {
    inner: Option<Socket>,
}

impl NonBlockingSocket {
    /// New IPv4 stream socket, non-blocking, with `SO_REUSEADDR` set.
    pub fn create() -> Result<Self, SocketError> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(SocketError::Create)?;
        socket.set_nonblocking(true).map_err(SocketError::Create)?;
        socket
            .set_reuse_address(true)
            .map_err(SocketError::Create)?;
        Ok(Self {
            inner: Some(socket),
        })
    }

    /// A socket that owns nothing.
    pub fn invalid() -> Self {
        Self { inner: None }
    }

    /// Adopt a descriptor created elsewhere. Negative values give the
    /// invalid sentinel.
    ///
    /// # Safety
    /// `handle` must be an open socket descriptor that nothing else will
    /// close; the returned value becomes its only owner.
    pub unsafe fn from_raw(handle: Handle) -> Self {
        if handle < 0 {
            return Self::invalid();
        }
        // SAFETY: ownership of an open descriptor is guaranteed by the caller.
        let socket = unsafe { Socket::from_raw_fd(handle) };
        Self {
            inner: Some(socket),
        }
    }

    pub fn handle(&self) -> Handle {
        self.inner
            .as_ref()
            .map_or(INVALID_HANDLE, |s| s.as_raw_fd())
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    /// Move the descriptor out, leaving `self` invalid.
    pub fn take(&mut self) -> NonBlockingSocket {
        std::mem::take(self)
    }

    fn socket(&self) -> Result<&Socket, SocketError> {
        self.inner.as_ref().ok_or(SocketError::InvalidHandle)
    }

    pub fn bind(&self, ip: &str, port: u16) -> Result<(), SocketError> {
        let socket = self.socket()?;
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| SocketError::InvalidAddress(ip.to_string()))?;
        let addr = SocketAddrV4::new(ip, port);
        socket.bind(&addr.into()).map_err(SocketError::Bind)
    }

    pub fn listen(&self, backlog: i32) -> Result<(), SocketError> {
        self.socket()?.listen(backlog).map_err(SocketError::Listen)
    }

    /// Accept one pending connection. `WouldBlock` means nothing is pending.
    /// The accepted socket is switched to non-blocking mode before return.
    pub fn accept(&self) -> Result<NonBlockingSocket, SocketError> {
        let (socket, _) = self.socket()?.accept().map_err(SocketError::from_io)?;
        socket.set_nonblocking(true).map_err(SocketError::Io)?;
        Ok(Self {
            inner: Some(socket),
        })
    }

    /// Single `send(2)`; may write fewer bytes than given.
    pub fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
        self.socket()?
            .send_with_flags(buf, libc::MSG_NOSIGNAL)
            .map_err(SocketError::from_io)
    }

    /// Write all of `buf`, retrying partial writes and transient outcomes.
    pub fn send_all(&self, buf: &[u8]) -> Result<(), SocketError> {
        let mut sent = 0;
        while sent < buf.len() {
            match self.send(&buf[sent..]) {
                Ok(0) => {
                    return Err(SocketError::Io(std::io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => sent += n,
                Err(SocketError::Interrupted) => {}
                Err(SocketError::WouldBlock) => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Single `recv(2)`. `Ok(0)` means the peer closed its side.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let mut socket = self.socket()?;
        socket.read(buf).map_err(SocketError::from_io)
    }

    /// Release the descriptor. Closing an invalid socket is a no-op. The
    /// sentinel is set even when the OS reports an error, so the descriptor
    /// is never released twice.
    pub fn close(&mut self) -> Result<(), SocketError> {
        let Some(socket) = self.inner.take() else {
            return Ok(());
        };
        let fd = socket.into_raw_fd();
        // SAFETY: `fd` came from `into_raw_fd`, so nothing else owns it.
        let ret = unsafe { libc::close(fd) };
        if ret != 0 {
            return Err(SocketError::Close(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        let addr = self.socket()?.local_addr().map_err(SocketError::Io)?;
        addr.as_socket().ok_or(SocketError::InvalidHandle)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, SocketError> {
        let addr = self.socket()?.peer_addr().map_err(SocketError::Io)?;
        addr.as_socket().ok_or(SocketError::InvalidHandle)
    }
}
