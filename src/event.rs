//! Events surfaced from [`crate::host::Host::service`].

use crate::packet::Packet;
use crate::peer::PeerHandle;

/// A notification produced by servicing a host: a peer connected or
/// disconnected, data arrived, or a peer timed out.
#[derive(Debug)]
pub enum Event {
    Connect {
        peer: PeerHandle,
        /// The 32-bit value carried in the connect/disconnect handshake.
        data: u32,
    },
    Disconnect {
        peer: PeerHandle,
        data: u32,
    },
    DisconnectTimeout {
        peer: PeerHandle,
    },
    Receive {
        peer: PeerHandle,
        channel_id: u8,
        packet: Packet,
    },
}

impl Event {
    pub fn peer(&self) -> PeerHandle {
        match *self {
            Event::Connect { peer, .. } => peer,
            Event::Disconnect { peer, .. } => peer,
            Event::DisconnectTimeout { peer } => peer,
            Event::Receive { peer, .. } => peer,
        }
    }
}
