//! Peer session state machine, send/receive queues, RTT and throttle.

use std::collections::VecDeque;

use crate::address::Address;
use crate::channel::{Channel, IncomingCommand};
use crate::config::{
    self, HostConfig, PeerThrottleConfig, PEER_FREE_RELIABLE_WINDOWS,
    PEER_FREE_UNSEQUENCED_WINDOWS, PEER_PACKET_THROTTLE_SCALE, PEER_PACKET_THROTTLE_THRESHOLD,
    PEER_RELIABLE_WINDOW_SIZE, PEER_RELIABLE_WINDOWS, PEER_UNSEQUENCED_WINDOW_SIZE,
};
use crate::error::PeerError;
use crate::packet::{Packet, PacketFlags};
use crate::protocol::{Command, CommandBody, CommandHeader, CommandKind};
use crate::sequence::time_difference;

/// Index of a peer slot in a [`crate::host::Host`]'s peer pool. Stable for
/// the lifetime of a session; reused once the slot returns to
/// [`PeerState::Disconnected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub(crate) usize);

impl PeerHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    AcknowledgingConnect,
    ConnectionPending,
    ConnectionSucceeded,
    Connected,
    DisconnectLater,
    Disconnecting,
    AcknowledgingDisconnect,
    Zombie,
}

/// A command handed to the socket, still owning (a slice of) the packet it
/// carries so a fragment isn't freed until it's acknowledged or given up on.
pub(crate) struct OutgoingCommand {
    pub header: CommandHeader,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
    pub packet: Option<Packet>,
    pub send_attempts: u32,
    pub sent_time: u32,
    pub round_trip_timeout: u32,
    pub round_trip_timeout_limit: u32,
    /// For control commands (connect/disconnect/ping/ack) that carry no
    /// packet payload of their own.
    pub body: Option<CommandBody>,
}

pub(crate) struct Acknowledgement {
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
    pub command_kind: CommandKind,
    pub sent_time: u16,
}

/// Result of [`Peer::queue_incoming_command`] — preserves the source's
/// tri-state ("queued", "intentionally discarded", "rejected") rather than
/// collapsing discards into errors.
pub(crate) enum QueueIncomingOutcome {
    Queued,
    Discarded,
    Rejected(PeerError),
}

pub struct Peer<U = ()> {
    pub(crate) handle: PeerHandle,
    pub(crate) outgoing_peer_id: u16,
    pub(crate) connect_id: u32,
    pub(crate) incoming_session_id: u8,
    pub(crate) outgoing_session_id: u8,
    pub(crate) address: Address,
    pub(crate) state: PeerState,
    pub(crate) channels: Vec<Channel>,

    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) incoming_data_total: usize,
    pub(crate) outgoing_data_total: usize,
    pub(crate) total_data_sent: u64,
    pub(crate) total_data_received: u64,

    pub(crate) last_send_time: u32,
    pub(crate) last_receive_time: u32,
    pub(crate) earliest_timeout: u32,
    pub(crate) ping_interval: u32,
    pub(crate) timeout_limit: u32,
    pub(crate) timeout_minimum: u32,
    pub(crate) timeout_maximum: u32,

    pub(crate) total_packets_sent: u64,
    pub(crate) total_packets_lost: u64,

    pub(crate) packet_throttle: u32,
    pub(crate) packet_throttle_limit: u32,
    pub(crate) packet_throttle_counter: u32,
    pub(crate) packet_throttle_epoch: u32,
    pub(crate) packet_throttle_acceleration: u32,
    pub(crate) packet_throttle_deceleration: u32,
    pub(crate) packet_throttle_interval: u32,
    pub(crate) packet_throttle_threshold: u32,
    pub(crate) outgoing_bandwidth_throttle_epoch: u32,
    pub(crate) incoming_bandwidth_throttle_epoch: u32,

    pub(crate) last_round_trip_time: u32,
    pub(crate) lowest_round_trip_time: u32,
    pub(crate) last_round_trip_time_variance: u32,
    pub(crate) highest_round_trip_time_variance: u32,
    pub(crate) round_trip_time: u32,
    pub(crate) round_trip_time_variance: u32,

    pub(crate) mtu: u32,
    pub(crate) window_size: u32,
    pub(crate) reliable_data_in_transit: u32,

    pub(crate) outgoing_reliable_sequence_number: u16,
    pub(crate) incoming_unsequenced_group: u16,
    pub(crate) outgoing_unsequenced_group: u16,
    pub(crate) unsequenced_window: [u32; (PEER_UNSEQUENCED_WINDOW_SIZE / 32) as usize],

    pub(crate) acknowledgements: VecDeque<Acknowledgement>,
    pub(crate) sent_reliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) sent_unreliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) outgoing_commands: VecDeque<OutgoingCommand>,
    pub(crate) dispatched_commands: VecDeque<(u8, Packet)>,

    pub(crate) needs_dispatch: bool,
    pub(crate) event_data: u32,
    pub(crate) total_waiting_data: usize,

    pub user_data: Option<U>,
}

impl<U> Peer<U> {
    pub(crate) fn new(handle: PeerHandle, config: &HostConfig) -> Peer<U> {
        Peer {
            handle,
            outgoing_peer_id: config::MAXIMUM_PEER_ID,
            connect_id: 0,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            address: Address::from_ipv4(std::net::Ipv4Addr::UNSPECIFIED, 0),
            state: PeerState::Disconnected,
            channels: Vec::new(),
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            total_data_sent: 0,
            total_data_received: 0,
            last_send_time: 0,
            last_receive_time: 0,
            earliest_timeout: 0,
            ping_interval: config::PEER_PING_INTERVAL_MS,
            timeout_limit: config::PEER_TIMEOUT_LIMIT,
            timeout_minimum: config::PEER_TIMEOUT_MINIMUM_MS,
            timeout_maximum: config::PEER_TIMEOUT_MAXIMUM_MS,
            total_packets_sent: 0,
            total_packets_lost: 0,
            packet_throttle: config::PEER_DEFAULT_PACKET_THROTTLE,
            packet_throttle_limit: PEER_PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_acceleration: config::PEER_PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: config::PEER_PACKET_THROTTLE_DECELERATION,
            packet_throttle_interval: config::PEER_PACKET_THROTTLE_INTERVAL_MS,
            packet_throttle_threshold: PEER_PACKET_THROTTLE_THRESHOLD,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_bandwidth_throttle_epoch: 0,
            last_round_trip_time: config::PEER_DEFAULT_ROUND_TRIP_TIME,
            lowest_round_trip_time: config::PEER_DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,
            round_trip_time: config::PEER_DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            mtu: config.mtu as u32,
            window_size: config::MAXIMUM_WINDOW_SIZE,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; (PEER_UNSEQUENCED_WINDOW_SIZE / 32) as usize],
            acknowledgements: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            sent_unreliable_commands: VecDeque::new(),
            outgoing_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
            needs_dispatch: false,
            event_data: 0,
            total_waiting_data: 0,
            user_data: None,
        }
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }

    /// Shorthand for [`Peer::round_trip_time`].
    pub fn rtt(&self) -> u32 {
        self.round_trip_time
    }

    pub fn last_round_trip_time(&self) -> u32 {
        self.last_round_trip_time
    }

    pub fn last_send_time(&self) -> u32 {
        self.last_send_time
    }

    pub fn last_receive_time(&self) -> u32 {
        self.last_receive_time
    }

    pub fn packets_sent(&self) -> u64 {
        self.total_packets_sent
    }

    pub fn packets_lost(&self) -> u64 {
        self.total_packets_lost
    }

    pub fn packet_throttle(&self) -> u32 {
        self.packet_throttle
    }

    pub fn bytes_sent(&self) -> u64 {
        self.total_data_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.total_data_received
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            PeerState::Connected | PeerState::DisconnectLater
        )
    }

    /// Resets every piece of per-session state and returns the slot to
    /// `Disconnected`, ready for a new CONNECT. Mirrors `enet_peer_reset`.
    pub(crate) fn reset(&mut self) {
        let handle = self.handle;
        let mtu = self.mtu;
        *self = Peer::new(
            handle,
            &HostConfig {
                mtu: mtu as usize,
                ..HostConfig::default()
            },
        );
    }

    /// Drops every queued command without touching connection state.
    /// Mirrors `enet_peer_reset_queues`.
    pub(crate) fn reset_queues(&mut self) {
        self.acknowledgements.clear();
        self.sent_reliable_commands.clear();
        self.sent_unreliable_commands.clear();
        self.outgoing_commands.clear();
        self.dispatched_commands.clear();
        for channel in &mut self.channels {
            channel.reset();
        }
        self.needs_dispatch = false;
        self.total_waiting_data = 0;
    }

    pub(crate) fn allocate_channels(&mut self, count: usize) {
        self.channels = (0..count).map(|_| Channel::new()).collect();
    }

    pub(crate) fn on_connect(&mut self) {
        self.total_data_sent = 0;
        self.total_data_received = 0;
        self.total_packets_sent = 0;
        self.total_packets_lost = 0;
    }

    pub(crate) fn on_disconnect(&mut self) {
        self.reliable_data_in_transit = 0;
    }

    /// Queues an application packet for transmission on `channel_id`,
    /// splitting it into `SEND_FRAGMENT`/`SEND_UNRELIABLE_FRAGMENT`
    /// commands when it's larger than one MTU's worth of payload.
    pub fn send(&mut self, channel_id: u8, packet: Packet) -> Result<(), PeerError> {
        if channel_id as usize >= self.channels.len() {
            return Err(PeerError::ChannelOutOfRange);
        }
        if self.total_waiting_data + packet.len() > config::HOST_DEFAULT_MAXIMUM_WAITING_DATA {
            return Err(PeerError::WaitingDataExceeded);
        }

        let reliable = packet.flags().contains(PacketFlags::RELIABLE);
        let fragment_budget = (self.mtu as usize).saturating_sub(28);

        if packet.len() > fragment_budget
            && (reliable || packet.flags().contains(PacketFlags::UNRELIABLE_FRAGMENTED))
        {
            self.queue_fragmented(channel_id, packet, fragment_budget, reliable)
        } else if packet.flags().contains(PacketFlags::UNSEQUENCED) {
            self.queue_unsequenced(channel_id, packet)
        } else {
            self.queue_whole(channel_id, packet, reliable)
        }
    }

    fn queue_whole(
        &mut self,
        channel_id: u8,
        packet: Packet,
        reliable: bool,
    ) -> Result<(), PeerError> {
        let channel = &mut self.channels[channel_id as usize];
        let (kind, reliable_sequence_number, unreliable_sequence_number, body) = if reliable {
            channel.outgoing_reliable_sequence_number =
                channel.outgoing_reliable_sequence_number.wrapping_add(1);
            (
                CommandKind::SendReliable,
                channel.outgoing_reliable_sequence_number,
                0,
                CommandBody::SendReliable {
                    data: packet.data().to_vec(),
                },
            )
        } else {
            channel.outgoing_unreliable_sequence_number =
                channel.outgoing_unreliable_sequence_number.wrapping_add(1);
            (
                CommandKind::SendUnreliable,
                channel.outgoing_reliable_sequence_number,
                channel.outgoing_unreliable_sequence_number,
                CommandBody::SendUnreliable {
                    unreliable_sequence_number: channel.outgoing_unreliable_sequence_number,
                    data: packet.data().to_vec(),
                },
            )
        };

        self.total_waiting_data += packet.len();
        self.outgoing_commands.push_back(OutgoingCommand {
            header: CommandHeader {
                kind,
                acknowledge: reliable,
                unsequenced: false,
                channel_id,
                reliable_sequence_number,
            },
            reliable_sequence_number,
            unreliable_sequence_number,
            fragment_offset: 0,
            fragment_length: packet.len() as u32,
            packet: Some(packet),
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            body: Some(body),
        });
        Ok(())
    }

    fn queue_unsequenced(&mut self, channel_id: u8, packet: Packet) -> Result<(), PeerError> {
        self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
        let group = self.outgoing_unsequenced_group;
        self.total_waiting_data += packet.len();
        self.outgoing_commands.push_back(OutgoingCommand {
            header: CommandHeader {
                kind: CommandKind::SendUnsequenced,
                acknowledge: false,
                unsequenced: true,
                channel_id,
                reliable_sequence_number: 0,
            },
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            fragment_offset: 0,
            fragment_length: packet.len() as u32,
            packet: Some(packet.clone()),
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            body: Some(CommandBody::SendUnsequenced {
                unsequenced_group: group,
                data: packet.data().to_vec(),
            }),
        });
        Ok(())
    }

    fn queue_fragmented(
        &mut self,
        channel_id: u8,
        packet: Packet,
        fragment_budget: usize,
        reliable: bool,
    ) -> Result<(), PeerError> {
        let total_length = packet.len();
        let fragment_count = (total_length + fragment_budget - 1) / fragment_budget;
        if fragment_count as u32 > config::MAXIMUM_FRAGMENT_COUNT {
            return Err(PeerError::PacketTooLarge);
        }

        let channel = &mut self.channels[channel_id as usize];
        let start_sequence_number = if reliable {
            channel.outgoing_reliable_sequence_number.wrapping_add(1)
        } else {
            channel.outgoing_unreliable_sequence_number.wrapping_add(1)
        };

        self.total_waiting_data += total_length;

        for fragment_number in 0..fragment_count {
            let offset = fragment_number * fragment_budget;
            let length = fragment_budget.min(total_length - offset);
            let channel = &mut self.channels[channel_id as usize];
            let reliable_sequence_number = if reliable {
                channel.outgoing_reliable_sequence_number =
                    channel.outgoing_reliable_sequence_number.wrapping_add(1);
                channel.outgoing_reliable_sequence_number
            } else {
                channel.outgoing_reliable_sequence_number
            };
            let kind = if reliable {
                CommandKind::SendFragment
            } else {
                CommandKind::SendUnreliableFragment
            };

            let data = packet.data()[offset..offset + length].to_vec();
            self.outgoing_commands.push_back(OutgoingCommand {
                header: CommandHeader {
                    kind,
                    acknowledge: reliable,
                    unsequenced: false,
                    channel_id,
                    reliable_sequence_number,
                },
                reliable_sequence_number,
                unreliable_sequence_number: 0,
                fragment_offset: offset as u32,
                fragment_length: length as u32,
                packet: Some(packet.clone()),
                send_attempts: 0,
                sent_time: 0,
                round_trip_timeout: 0,
                round_trip_timeout_limit: 0,
                body: Some(CommandBody::SendFragment {
                    start_sequence_number,
                    fragment_count: fragment_count as u32,
                    fragment_number: fragment_number as u32,
                    total_length: total_length as u32,
                    fragment_offset: offset as u32,
                    data,
                }),
            });
        }
        Ok(())
    }

    /// Pops the next fully-dispatched `(channel_id, packet)` pair ready for
    /// delivery to the application. Mirrors `enet_peer_receive`.
    pub(crate) fn receive(&mut self) -> Option<(u8, Packet)> {
        self.dispatched_commands.pop_front()
    }

    pub(crate) fn queue_acknowledgement(&mut self, header: &CommandHeader, sent_time: u16) {
        if self.state == PeerState::Disconnected || self.state == PeerState::Zombie {
            return;
        }
        self.acknowledgements.push_back(Acknowledgement {
            channel_id: header.channel_id,
            reliable_sequence_number: header.reliable_sequence_number,
            command_kind: header.kind,
            sent_time,
        });
    }

    /// Queues an incoming command into the right channel list, tracking
    /// fragment reassembly state. Returns the source's tri-state result so
    /// callers can distinguish "intentionally discarded" from "rejected".
    ///
    /// `reliable_sequence_number` is the *logical* ordering key: for a whole
    /// `SendReliable` command it's the command header's own sequence number,
    /// but for a `SendFragment` it's the fragmented packet's
    /// `start_sequence_number` — every fragment of one packet shares this
    /// value even though each fragment is its own reliably-acked command on
    /// the wire with its own header sequence number.
    pub(crate) fn queue_incoming_command(
        &mut self,
        channel_id: u8,
        kind: CommandKind,
        reliable_sequence_number: u16,
        unreliable_sequence_number: u16,
        fragment_count: u32,
        fragment_number: u32,
        fragment_offset: u32,
        total_length: u32,
        data: &[u8],
    ) -> QueueIncomingOutcome {
        if channel_id as usize >= self.channels.len() {
            return QueueIncomingOutcome::Rejected(PeerError::ChannelOutOfRange);
        }
        if self.total_waiting_data + data.len() > config::HOST_DEFAULT_MAXIMUM_WAITING_DATA {
            return QueueIncomingOutcome::Rejected(PeerError::WaitingDataExceeded);
        }

        let reliable = matches!(
            kind,
            CommandKind::SendReliable | CommandKind::SendFragment
        );

        if reliable {
            let channel = &mut self.channels[channel_id as usize];
            if !reliable_window_accepts(reliable_sequence_number, channel.incoming_reliable_sequence_number) {
                return QueueIncomingOutcome::Rejected(PeerError::OutOfWindow);
            }
            if reliable_sequence_number == channel.incoming_reliable_sequence_number {
                return QueueIncomingOutcome::Discarded;
            }

            let fragmented = fragment_count > 1;
            if fragmented {
                if let Some(existing) = channel
                    .incoming_reliable_commands
                    .iter_mut()
                    .find(|c| c.reliable_sequence_number == reliable_sequence_number)
                {
                    if existing.fragment_count != fragment_count {
                        return QueueIncomingOutcome::Rejected(PeerError::FragmentMismatch);
                    }
                    let remaining = existing.fragments_remaining.as_mut().unwrap();
                    if fragment_number as usize >= remaining.len() {
                        return QueueIncomingOutcome::Rejected(PeerError::FragmentMismatch);
                    }
                    if !remaining[fragment_number as usize] {
                        return QueueIncomingOutcome::Discarded;
                    }
                    remaining[fragment_number as usize] = false;
                    if let Some(packet) = &mut existing.packet {
                        write_fragment_into(packet, fragment_offset, data);
                    }
                    return QueueIncomingOutcome::Queued;
                }

                let mut remaining = vec![true; fragment_count as usize];
                remaining[fragment_number as usize] = false;
                let mut buffer = vec![0u8; total_length as usize];
                let offset = fragment_offset as usize;
                buffer[offset..offset + data.len()].copy_from_slice(data);
                self.total_waiting_data += data.len();
                channel.incoming_reliable_commands.push_back(IncomingCommand {
                    reliable_sequence_number,
                    unreliable_sequence_number,
                    kind,
                    fragment_count,
                    fragments_remaining: Some(remaining),
                    packet: Some(Packet::new(buffer, PacketFlags::RELIABLE)),
                });
            } else {
                self.total_waiting_data += data.len();
                channel.incoming_reliable_commands.push_back(IncomingCommand {
                    reliable_sequence_number,
                    unreliable_sequence_number,
                    kind,
                    fragment_count: 1,
                    fragments_remaining: None,
                    packet: Some(Packet::new(data.to_vec(), PacketFlags::RELIABLE)),
                });
            }

            sort_by_sequence(&mut channel.incoming_reliable_commands);
            self.dispatch_incoming_reliable_commands(channel_id);
        } else if kind == CommandKind::SendUnsequenced {
            let index = unreliable_sequence_number as u32 % PEER_UNSEQUENCED_WINDOW_SIZE;
            let mut group = unreliable_sequence_number as u32;
            if group < self.incoming_unsequenced_group as u32 {
                group += 0x10000;
            }
            if group >= self.incoming_unsequenced_group as u32 + PEER_FREE_UNSEQUENCED_WINDOWS as u32 * PEER_UNSEQUENCED_WINDOW_SIZE
            {
                return QueueIncomingOutcome::Discarded;
            }

            let group = (group & 0xFFFF) as u16;
            let word = (index / 32) as usize;
            let bit = 1u32 << (index % 32);
            let window_base = group.wrapping_sub(index as u16);
            if window_base != self.incoming_unsequenced_group {
                self.incoming_unsequenced_group = window_base;
                self.unsequenced_window = [0; (PEER_UNSEQUENCED_WINDOW_SIZE / 32) as usize];
            } else if self.unsequenced_window[word] & bit != 0 {
                return QueueIncomingOutcome::Discarded;
            }

            self.dispatched_commands
                .push_back((channel_id, Packet::new(data.to_vec(), PacketFlags::UNSEQUENCED)));
            self.needs_dispatch = true;
            self.unsequenced_window[word] |= bit;
        } else {
            let channel = &mut self.channels[channel_id as usize];
            self.total_waiting_data += data.len();
            channel.incoming_unreliable_commands.push_back(IncomingCommand {
                reliable_sequence_number,
                unreliable_sequence_number,
                kind,
                fragment_count: fragment_count.max(1),
                fragments_remaining: None,
                packet: Some(Packet::new(data.to_vec(), PacketFlags::NONE)),
            });
            sort_by_unreliable_sequence(&mut channel.incoming_unreliable_commands);
            self.dispatch_incoming_unreliable_commands(channel_id);
        }

        QueueIncomingOutcome::Queued
    }

    fn dispatch_incoming_reliable_commands(&mut self, channel_id: u8) {
        let channel = &mut self.channels[channel_id as usize];
        while let Some(front) = channel.incoming_reliable_commands.front() {
            if !front.is_complete() {
                break;
            }
            let expected = channel.incoming_reliable_sequence_number.wrapping_add(1);
            if front.reliable_sequence_number != expected {
                break;
            }
            let command = channel.incoming_reliable_commands.pop_front().unwrap();
            channel.incoming_reliable_sequence_number = command.reliable_sequence_number;
            if let Some(packet) = command.packet {
                self.total_waiting_data = self.total_waiting_data.saturating_sub(packet.len());
                self.dispatched_commands.push_back((channel_id, packet));
                self.needs_dispatch = true;
            }
        }
    }

    fn dispatch_incoming_unreliable_commands(&mut self, channel_id: u8) {
        let channel = &mut self.channels[channel_id as usize];
        while let Some(front) = channel.incoming_unreliable_commands.front() {
            if front.reliable_sequence_number != channel.incoming_reliable_sequence_number {
                break;
            }
            let command = channel.incoming_unreliable_commands.pop_front().unwrap();
            if let Some(packet) = command.packet {
                self.total_waiting_data = self.total_waiting_data.saturating_sub(packet.len());
                self.dispatched_commands.push_back((channel_id, packet));
                self.needs_dispatch = true;
            }
        }
    }

    /// Adjusts `packet_throttle` from a fresh RTT sample. Mirrors
    /// `enet_peer_throttle`; returns +1/0/-1 the way the source does for
    /// diagnostics, though callers currently ignore it.
    pub(crate) fn throttle(&mut self, rtt: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if rtt < self.last_round_trip_time + (self.last_round_trip_time_variance + 1) / 2 {
            self.packet_throttle = (self.packet_throttle + self.packet_throttle_acceleration)
                .min(self.packet_throttle_limit);
            return 1;
        } else if rtt
            > self.last_round_trip_time
                + self.packet_throttle_threshold
                + 2 * self.last_round_trip_time_variance
        {
            self.packet_throttle = self
                .packet_throttle
                .saturating_sub(self.packet_throttle_deceleration);
            return -1;
        }
        0
    }

    pub fn throttle_configure(&mut self, config: PeerThrottleConfig) {
        self.packet_throttle_interval = config.interval_ms;
        self.packet_throttle_acceleration = config.acceleration;
        self.packet_throttle_deceleration = config.deceleration;
    }

    pub fn ping_interval(&mut self, interval_ms: u32) {
        self.ping_interval = if interval_ms == 0 {
            config::PEER_PING_INTERVAL_MS
        } else {
            interval_ms
        };
    }

    pub fn timeout(&mut self, limit: u32, minimum_ms: u32, maximum_ms: u32) {
        self.timeout_limit = limit;
        self.timeout_minimum = minimum_ms;
        self.timeout_maximum = maximum_ms;
    }

    /// Queues a reliable PING command; the send pipeline folds this into
    /// the idle-ping check too, this is the explicit caller-invoked form.
    /// Queues a handshake or housekeeping command (CONNECT, VERIFY_CONNECT,
    /// DISCONNECT, BANDWIDTH_LIMIT, THROTTLE_CONFIGURE) on the reserved
    /// control channel `0xFF`. `Ping` and application sends go through
    /// [`Peer::queue_ping`] / [`Peer::send`] instead.
    pub(crate) fn queue_control_command(&mut self, body: CommandBody) {
        let kind = match &body {
            CommandBody::Connect { .. } => CommandKind::Connect,
            CommandBody::VerifyConnect { .. } => CommandKind::VerifyConnect,
            CommandBody::Disconnect { .. } => CommandKind::Disconnect,
            CommandBody::BandwidthLimit { .. } => CommandKind::BandwidthLimit,
            CommandBody::ThrottleConfigure { .. } => CommandKind::ThrottleConfigure,
            _ => return,
        };
        let acknowledge = kind != CommandKind::Connect;
        self.outgoing_reliable_sequence_number = self.outgoing_reliable_sequence_number.wrapping_add(1);
        self.outgoing_commands.push_back(OutgoingCommand {
            header: CommandHeader {
                kind,
                acknowledge,
                unsequenced: false,
                channel_id: 0xFF,
                reliable_sequence_number: self.outgoing_reliable_sequence_number,
            },
            reliable_sequence_number: self.outgoing_reliable_sequence_number,
            unreliable_sequence_number: 0,
            fragment_offset: 0,
            fragment_length: 0,
            packet: None,
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            body: Some(body),
        });
    }

    pub(crate) fn queue_ping(&mut self) {
        self.outgoing_commands.push_back(OutgoingCommand {
            header: CommandHeader {
                kind: CommandKind::Ping,
                acknowledge: true,
                unsequenced: false,
                channel_id: 0xFF,
                reliable_sequence_number: 0,
            },
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            fragment_offset: 0,
            fragment_length: 0,
            packet: None,
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            body: Some(CommandBody::Ping),
        });
    }

    pub fn ping(&mut self) {
        if self.state == PeerState::Connected {
            self.queue_ping();
        }
    }

    /// Initiates a graceful disconnect: queues a reliable DISCONNECT and
    /// waits for its acknowledgement before the slot becomes reusable.
    pub fn disconnect(&mut self, data: u32) {
        if matches!(self.state, PeerState::Disconnected | PeerState::Zombie) {
            return;
        }
        self.reset_queues();
        self.outgoing_commands.push_back(OutgoingCommand {
            header: CommandHeader {
                kind: CommandKind::Disconnect,
                acknowledge: true,
                unsequenced: false,
                channel_id: 0xFF,
                reliable_sequence_number: 0,
            },
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            fragment_offset: 0,
            fragment_length: 0,
            packet: None,
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            body: Some(CommandBody::Disconnect { data }),
        });
        self.state = PeerState::Disconnecting;
    }

    /// Skips the handshake entirely: immediately zombies the peer so the
    /// next dispatch pass resets it to `Disconnected`.
    pub fn disconnect_now(&mut self, data: u32) {
        if matches!(self.state, PeerState::Disconnected | PeerState::Zombie) {
            return;
        }
        self.reset_queues();
        self.event_data = data;
        self.state = PeerState::Zombie;
    }

    /// Requests a disconnect that only takes effect once the outgoing
    /// queues fully drain — used so in-flight reliable sends aren't lost.
    pub fn disconnect_later(&mut self, data: u32) {
        if matches!(
            self.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) && !(self.outgoing_commands.is_empty() && self.sent_reliable_commands.is_empty())
        {
            self.event_data = data;
            self.state = PeerState::DisconnectLater;
        } else {
            self.disconnect(data);
        }
    }

    /// Checks whether any `sentReliableCommands` entry has exceeded its RTO,
    /// escalating to a timeout decision. Returns `true` if the peer should
    /// raise `DisconnectTimeout` and move to `Zombie`.
    pub(crate) fn check_timeouts(&mut self, service_time: u32) -> bool {
        self.earliest_timeout = 0;
        let mut expired = Vec::new();
        for (i, command) in self.sent_reliable_commands.iter().enumerate() {
            if time_difference(service_time, command.sent_time) >= command.round_trip_timeout {
                expired.push(i);
            }
        }
        if expired.is_empty() {
            return false;
        }

        for &i in expired.iter().rev() {
            let command = &self.sent_reliable_commands[i];
            if self.earliest_timeout == 0
                || crate::sequence::time_difference(command.sent_time, self.earliest_timeout) > 0
            {
                self.earliest_timeout = command.sent_time;
            }
        }

        if self.earliest_timeout != 0
            && (time_difference(service_time, self.earliest_timeout) >= self.timeout_maximum
                || (self.sent_reliable_commands[expired[0]].round_trip_timeout
                    >= self.sent_reliable_commands[expired[0]].round_trip_timeout_limit
                    && time_difference(service_time, self.earliest_timeout) >= self.timeout_minimum))
        {
            return true;
        }

        for &i in expired.iter().rev() {
            let mut command = self.sent_reliable_commands.remove(i).unwrap();
            self.total_packets_lost += 1;
            self.reliable_data_in_transit = self
                .reliable_data_in_transit
                .saturating_sub(command.fragment_length);
            command.round_trip_timeout = self.round_trip_time + 4 * self.round_trip_time_variance;
            command.round_trip_timeout_limit = self.timeout_limit * command.round_trip_timeout;
            self.outgoing_commands.push_front(command);
        }
        false
    }

    pub(crate) fn update_round_trip_time(&mut self, rtt: u32, service_time: u32) {
        self.throttle(rtt);

        if self.last_receive_time > 0 {
            if rtt >= self.round_trip_time {
                let diff = rtt - self.round_trip_time;
                self.round_trip_time_variance -= self.round_trip_time_variance / 4;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time += diff / 8;
            } else {
                let diff = self.round_trip_time - rtt;
                if diff <= self.round_trip_time_variance {
                    self.round_trip_time_variance -= self.round_trip_time_variance / 4;
                    self.round_trip_time_variance += diff / 4;
                } else {
                    self.round_trip_time_variance -= self.round_trip_time_variance / 32;
                    self.round_trip_time_variance += diff / 32;
                }
                self.round_trip_time -= diff / 8;
            }
        } else {
            self.round_trip_time = rtt;
            self.round_trip_time_variance = rtt / 2;
        }

        if self.round_trip_time < self.lowest_round_trip_time {
            self.lowest_round_trip_time = self.round_trip_time;
        }
        if self.round_trip_time_variance > self.highest_round_trip_time_variance {
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
        }

        if self.packet_throttle_epoch == 0
            || time_difference(service_time, self.packet_throttle_epoch) >= self.packet_throttle_interval
        {
            self.last_round_trip_time = self.lowest_round_trip_time;
            self.last_round_trip_time_variance = self.highest_round_trip_time_variance.max(1);
            self.lowest_round_trip_time = self.round_trip_time;
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
            self.packet_throttle_epoch = service_time;
        }
    }

    /// Removes the outstanding send matching `(channel_id, reliable_sequence_number)`
    /// from `sentReliableCommands`, returning the kind of command it was so
    /// state-machine callers (VERIFY_CONNECT/DISCONNECT acks) can validate it.
    pub(crate) fn remove_sent_reliable_command(
        &mut self,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> Option<CommandKind> {
        if let Some(pos) = self.sent_reliable_commands.iter().position(|c| {
            c.reliable_sequence_number == reliable_sequence_number && c.header.channel_id == channel_id
        }) {
            let command = self.sent_reliable_commands.remove(pos).unwrap();
            self.reliable_data_in_transit = self
                .reliable_data_in_transit
                .saturating_sub(command.fragment_length);
            return Some(command.header.kind);
        }
        None
    }
}

fn write_fragment_into(packet: &mut Packet, fragment_offset: u32, data: &[u8]) {
    packet.write_fragment(fragment_offset as usize, data);
}

fn sort_by_sequence(commands: &mut VecDeque<IncomingCommand>) {
    let mut items: Vec<_> = commands.drain(..).collect();
    items.sort_by_key(|c| c.reliable_sequence_number);
    commands.extend(items);
}

fn sort_by_unreliable_sequence(commands: &mut VecDeque<IncomingCommand>) {
    let mut items: Vec<_> = commands.drain(..).collect();
    items.sort_by_key(|c| (c.reliable_sequence_number, c.unreliable_sequence_number));
    commands.extend(items);
}

/// Whether `reliable_sequence_number` falls inside the sliding window of
/// sequence numbers this channel is still willing to accept, given the
/// window it's already delivered up through. Sequence numbers past the
/// window (too far ahead) or stale (wrapped around behind the current
/// window) are rejected rather than queued.
fn reliable_window_accepts(reliable_sequence_number: u16, incoming_reliable_sequence_number: u16) -> bool {
    let window_size = PEER_RELIABLE_WINDOW_SIZE as u32;
    let mut reliable_window = reliable_sequence_number as u32 / window_size;
    let current_window = incoming_reliable_sequence_number as u32 / window_size;
    if reliable_sequence_number < incoming_reliable_sequence_number {
        reliable_window += PEER_RELIABLE_WINDOWS as u32;
    }
    reliable_window >= current_window && reliable_window < current_window + PEER_FREE_RELIABLE_WINDOWS as u32 - 1
}

/// Whether sending a first attempt at the given reliable window would wrap
/// past windows the peer hasn't finished acknowledging yet: either the
/// previous window is still saturated, or the free-window bitmask this
/// window would roll into is still in use.
pub(crate) fn reliable_window_wrap_blocked(channel: &Channel, reliable_window: u16) -> bool {
    let reliable_window = reliable_window as u32;
    let windows = PEER_RELIABLE_WINDOWS as u32;
    let previous = (reliable_window + windows - 1) % windows;
    if channel.reliable_windows[previous as usize] >= PEER_RELIABLE_WINDOW_SIZE {
        return true;
    }
    let mask = (1u32 << (PEER_FREE_RELIABLE_WINDOWS + 2)) - 1;
    let bits = (mask << reliable_window) | (mask >> (windows - reliable_window));
    channel.used_reliable_windows as u32 & bits != 0
}
