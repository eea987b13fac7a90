//! The byte-stream surface the peer engine drives.
//!
//! The connection manager that multiplexes sockets and delivers readiness
//! events is outside this crate; the engine only needs a non-blocking duplex
//! byte stream. `read` and `write` follow `std::io` semantics:
//! `Ok(0)` from `read` means the remote closed the stream, and
//! `ErrorKind::WouldBlock` means the stream is drained (or full) for now.

use std::io;
use std::net::{SocketAddr, TcpStream};

/// A non-blocking duplex byte stream to one remote peer.
pub trait Connection {
    /// Reads available bytes. `Ok(0)` signals end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes as many bytes as the stream will accept.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// The remote peer's socket address.
    fn remote_socket_address(&self) -> SocketAddr;

    /// Closes the stream. Idempotent.
    fn close(&mut self) -> io::Result<()>;
}

/// [`Connection`] over a non-blocking [`TcpStream`].
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    remote: SocketAddr,
}

impl TcpConnection {
    /// Wraps a connected stream, switching it to non-blocking mode.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        Ok(Self { stream, remote })
    }
}

impl Connection for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.stream, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut self.stream, buf)
    }

    fn remote_socket_address(&self) -> SocketAddr {
        self.remote
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(std::net::Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}
