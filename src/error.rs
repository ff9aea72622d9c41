//! Plain per-seam error enums.
//!
//! The engine never propagates protocol-format errors (malformed header, bad
//! opcode, command overrun) to the caller — those datagrams are dropped
//! silently. What *does* surface is the handful of policy/allocation/socket
//! failures enumerated here.

/// Rejection reason for a single command handed to a peer.
///
/// Returned from the internal queueing functions; callers outside this
/// crate only see these through `log` output, never as a `Result`, matching
/// the source's "nothing escapes except through the service-call return code
/// and events."
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PeerError {
    /// Command's reliable sequence number fell outside the current reliable window.
    OutOfWindow,
    /// Channel ID named by the command exceeds the peer's channel count.
    ChannelOutOfRange,
    /// `maximumWaitingData` would be exceeded by admitting this command.
    WaitingDataExceeded,
    /// A fragment disagreed with the `(sequence, totalLength, fragmentCount)`
    /// of the reassembly slot it was supposed to join.
    FragmentMismatch,
    /// Packet length exceeded `maximumPacketSize`.
    PacketTooLarge,
}

/// Fatal conditions that end a `Host::service` call early.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The underlying socket reported a fatal error on send or receive.
    Socket,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Socket => write!(f, "socket error"),
        }
    }
}

impl std::error::Error for ServiceError {}
