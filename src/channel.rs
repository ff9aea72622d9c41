//! Per-channel sequencing and reassembly state.
//!
//! One [`Channel`] lives per channel ID per peer. It tracks the reliable
//! and unreliable sequence counters in each direction, the sliding window
//! of acknowledged reliable sequence numbers, and the reassembly queues for
//! commands that haven't been dispatched to the application yet.

use std::collections::VecDeque;

use crate::config::PEER_RELIABLE_WINDOWS;
use crate::packet::Packet;
use crate::protocol::CommandKind;

/// A reliable or unreliable command waiting for missing fragments, or
/// waiting for its turn to be dispatched in sequence order.
pub(crate) struct IncomingCommand {
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub kind: CommandKind,
    pub fragment_count: u32,
    /// One bit per fragment; `None` for commands that were never fragmented.
    pub fragments_remaining: Option<Vec<bool>>,
    pub packet: Option<Packet>,
}

impl IncomingCommand {
    pub fn is_complete(&self) -> bool {
        match &self.fragments_remaining {
            None => true,
            Some(remaining) => remaining.iter().all(|&pending| !pending),
        }
    }
}

pub(crate) struct Channel {
    pub outgoing_reliable_sequence_number: u16,
    pub outgoing_unreliable_sequence_number: u16,
    /// Bit `i` set means `reliable_windows[i]` holds live, unacknowledged
    /// reliable commands sent in that window.
    pub used_reliable_windows: u16,
    pub reliable_windows: [u16; PEER_RELIABLE_WINDOWS],
    pub incoming_reliable_sequence_number: u16,
    pub incoming_unreliable_sequence_number: u16,
    pub incoming_reliable_commands: VecDeque<IncomingCommand>,
    pub incoming_unreliable_commands: VecDeque<IncomingCommand>,
}

impl Channel {
    pub fn new() -> Channel {
        Channel {
            outgoing_reliable_sequence_number: 0,
            outgoing_unreliable_sequence_number: 0,
            used_reliable_windows: 0,
            reliable_windows: [0; PEER_RELIABLE_WINDOWS],
            incoming_reliable_sequence_number: 0,
            incoming_unreliable_sequence_number: 0,
            incoming_reliable_commands: VecDeque::new(),
            incoming_unreliable_commands: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Channel::new();
    }
}

impl Default for Channel {
    fn default() -> Self {
        Channel::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_channel_starts_at_sequence_zero() {
        let channel = Channel::new();
        assert_eq!(channel.outgoing_reliable_sequence_number, 0);
        assert_eq!(channel.used_reliable_windows, 0);
        assert!(channel.incoming_reliable_commands.is_empty());
    }

    #[test]
    fn incoming_command_completeness_tracks_fragment_bitfield() {
        let mut command = IncomingCommand {
            reliable_sequence_number: 1,
            unreliable_sequence_number: 0,
            kind: CommandKind::SendFragment,
            fragment_count: 2,
            fragments_remaining: Some(vec![true, true]),
            packet: None,
        };
        assert!(!command.is_complete());
        command.fragments_remaining.as_mut().unwrap()[0] = false;
        assert!(!command.is_complete());
        command.fragments_remaining.as_mut().unwrap()[1] = false;
        assert!(command.is_complete());
    }
}
