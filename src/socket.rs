//! Datagram socket abstraction.
//!
//! Out of scope per the core spec except at this interface: the engine only
//! needs something that delivers `(Address, bytes)` and accepts gather
//! writes. A `std::net::UdpSocket`-backed implementation is provided for
//! real use and for the crate's own integration tests; anything socket-like
//! (an in-memory pair, a simulator) can implement the trait instead.

use std::io;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use crate::address::Address;

/// Result of a non-blocking receive attempt.
pub enum RecvOutcome {
    /// A complete datagram, the sender's address, and its length.
    Datagram(Address, usize),
    /// Nothing available right now.
    WouldBlock,
    /// A datagram arrived but didn't fit in the caller's buffer
    /// (`MSG_TRUNC`/`MSG_PARTIAL` equivalent) — the source treats this as
    /// "skip, not fatal".
    Truncated,
}

pub trait Socket {
    /// Non-blocking receive into `buf`. Never blocks; `RecvOutcome::WouldBlock`
    /// signals "no datagram available this call".
    fn recv(&self, buf: &mut [u8]) -> io::Result<RecvOutcome>;

    /// Gather-send: `buffers` are concatenated on the wire in order.
    fn send(&self, to: Address, buffers: &[&[u8]]) -> io::Result<usize>;

    /// Block until a datagram is readable or `timeout_ms` elapses (0 means
    /// "return immediately"). Returns `true` if data became available.
    fn wait_readable(&self, timeout_ms: u32) -> io::Result<bool>;

    fn local_address(&self) -> io::Result<Address>;
}

/// Default [`Socket`] implementation over `std::net::UdpSocket`.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(address: Address) -> io::Result<UdpTransport> {
        let socket = UdpSocket::bind(std::net::SocketAddr::from(address))?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        Ok(UdpTransport { socket })
    }
}

impl Socket for UdpTransport {
    fn recv(&self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => {
                if len > buf.len() {
                    Ok(RecvOutcome::Truncated)
                } else {
                    Ok(RecvOutcome::Datagram(Address::from(from), len))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn send(&self, to: Address, buffers: &[&[u8]]) -> io::Result<usize> {
        let total: usize = buffers.iter().map(|b| b.len()).sum();
        let mut scratch = Vec::with_capacity(total);
        for b in buffers {
            scratch.extend_from_slice(b);
        }
        self.socket.send_to(&scratch, std::net::SocketAddr::from(to))
    }

    /// Polls `peek` in a short sleep loop. `std::net::UdpSocket` exposes no
    /// portable readiness wait, and standing up a platform-specific selector
    /// is out of scope for a crate that treats sockets as an external
    /// collaborator — this keeps `wait_readable` correct, if coarse.
    fn wait_readable(&self, timeout_ms: u32) -> io::Result<bool> {
        let deadline = (timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        loop {
            let mut probe = [0u8; 0];
            match self.socket.peek(&mut probe) {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(false),
                Some(_) => std::thread::sleep(Duration::from_millis(1)),
                None => return Ok(false),
            }
        }
    }

    fn local_address(&self) -> io::Result<Address> {
        self.socket.local_addr().map(Address::from)
    }
}
