//! Shared in-memory transport for integration tests: swaps the real UDP
//! socket for a direct byte-queue pair so tests run deterministically, with
//! hooks to drop or duplicate specific sends, and a clock a test can drive
//! from outside without needing the two `Host`s to share wall-clock time.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::rc::Rc;

use relay_transport::socket::RecvOutcome;
use relay_transport::{Address, Clock, Event, Host, HostConfig, PeerHandle, Socket};

type Queue = Rc<RefCell<VecDeque<(Address, Vec<u8>)>>>;

/// A handle kept by a test after the matching [`LoopbackSocket`] has been
/// moved into a `Host`, for injecting drops and duplicate deliveries.
#[derive(Clone)]
pub struct SocketControl {
    drop_next_sends: Rc<Cell<usize>>,
    outbox: Queue,
}

impl SocketControl {
    /// The next `count` datagrams this socket tries to send vanish instead
    /// of reaching the peer.
    pub fn drop_next_sends(&self, count: usize) {
        self.drop_next_sends.set(count);
    }

    /// Re-delivers the most recently sent, not-yet-read datagram a second
    /// time, simulating a duplicate arriving on the wire.
    pub fn duplicate_last_sent(&self) {
        let mut outbox = self.outbox.borrow_mut();
        if let Some(last) = outbox.back().cloned() {
            outbox.push_back(last);
        }
    }
}

/// One end of an in-memory socket pair. `send` pushes straight onto the
/// peer's inbox; nothing touches the OS network stack.
pub struct LoopbackSocket {
    local: Address,
    inbox: Queue,
    outbox: Queue,
    drop_next_sends: Rc<Cell<usize>>,
}

impl LoopbackSocket {
    pub fn control(&self) -> SocketControl {
        SocketControl {
            drop_next_sends: self.drop_next_sends.clone(),
            outbox: self.outbox.clone(),
        }
    }
}

/// Builds a connected pair of loopback sockets.
pub fn loopback_pair() -> (LoopbackSocket, LoopbackSocket) {
    let a_to_b: Queue = Rc::new(RefCell::new(VecDeque::new()));
    let b_to_a: Queue = Rc::new(RefCell::new(VecDeque::new()));
    let a = LoopbackSocket {
        local: Address::from_ipv4(Ipv4Addr::LOCALHOST, 4000),
        inbox: b_to_a.clone(),
        outbox: a_to_b.clone(),
        drop_next_sends: Rc::new(Cell::new(0)),
    };
    let b = LoopbackSocket {
        local: Address::from_ipv4(Ipv4Addr::LOCALHOST, 4001),
        inbox: a_to_b,
        outbox: b_to_a,
        drop_next_sends: Rc::new(Cell::new(0)),
    };
    (a, b)
}

impl Socket for LoopbackSocket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        let mut inbox = self.inbox.borrow_mut();
        match inbox.pop_front() {
            Some((from, data)) => {
                if data.len() > buf.len() {
                    Ok(RecvOutcome::Truncated)
                } else {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(RecvOutcome::Datagram(from, data.len()))
                }
            }
            None => Ok(RecvOutcome::WouldBlock),
        }
    }

    fn send(&self, _to: Address, buffers: &[&[u8]]) -> io::Result<usize> {
        let total: usize = buffers.iter().map(|b| b.len()).sum();
        if self.drop_next_sends.get() > 0 {
            self.drop_next_sends.set(self.drop_next_sends.get() - 1);
            return Ok(total);
        }
        let mut data = Vec::with_capacity(total);
        for b in buffers {
            data.extend_from_slice(b);
        }
        self.outbox.borrow_mut().push_back((self.local, data));
        Ok(total)
    }

    fn wait_readable(&self, _timeout_ms: u32) -> io::Result<bool> {
        Ok(!self.inbox.borrow().is_empty())
    }

    fn local_address(&self) -> io::Result<Address> {
        Ok(self.local)
    }
}

/// A clock a test can advance from outside, shared between as many `Host`s
/// as need to stay in lockstep.
#[derive(Clone)]
pub struct SharedClock(Rc<Cell<u32>>);

impl SharedClock {
    pub fn new() -> SharedClock {
        SharedClock(Rc::new(Cell::new(0)))
    }

    pub fn advance(&self, ms: u32) {
        self.0.set(self.0.get().wrapping_add(ms));
    }
}

impl Clock for SharedClock {
    fn now_ms(&self) -> u32 {
        self.0.get()
    }
}

pub type TestHost = Host<(), LoopbackSocket, SharedClock>;

pub fn new_host(socket: LoopbackSocket, clock: SharedClock, peer_count: usize) -> TestHost {
    Host::with_clock(
        HostConfig {
            peer_count,
            ..HostConfig::default()
        },
        socket,
        clock,
    )
}

/// Runs one send/receive pass on `host` and drains every event it
/// produced, without forcing extra network passes once the queue empties.
pub fn drain(host: &mut TestHost) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match host.service(0) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => break,
            Err(e) => panic!("service failed: {e}"),
        }
    }
    events
}

/// Drives the connect handshake to completion, returning each side's peer
/// handle. Panics if it doesn't complete within a generous number of
/// rounds — loopback delivery is instant, so that only happens on a
/// genuine protocol bug.
pub fn handshake(
    host_a: &mut TestHost,
    host_b: &mut TestHost,
    channel_count: usize,
    connect_data: u32,
) -> (PeerHandle, PeerHandle) {
    let addr_b = host_b.local_address().expect("loopback socket always resolves");
    let handle_a = host_a
        .connect(addr_b, channel_count, connect_data)
        .expect("free peer slot");

    let mut handle_b = None;
    let mut connected_a = false;
    for _ in 0..20 {
        for event in drain(host_a) {
            if let Event::Connect { peer, .. } = event {
                assert_eq!(peer, handle_a);
                connected_a = true;
            }
        }
        for event in drain(host_b) {
            if let Event::Connect { peer, data } = event {
                assert_eq!(data, connect_data);
                handle_b = Some(peer);
            }
        }
        if connected_a && handle_b.is_some() {
            break;
        }
    }

    assert!(connected_a, "initiator never saw Connect");
    (handle_a, handle_b.expect("acceptor never saw Connect"))
}
