//! The host: a peer pool driven by a single `service` loop that runs the
//! send pipeline, the receive pipeline, and periodic bandwidth throttling.

use std::collections::VecDeque;
use std::io::Cursor;

use log::{debug, trace, warn};

use crate::address::Address;
use crate::config::{self, HostConfig, PeerThrottleConfig};
use crate::error::ServiceError;
use crate::event::Event;
use crate::packet::{Packet, PacketFlags};
use crate::peer::{Peer, PeerHandle, PeerState, QueueIncomingOutcome};
use crate::protocol::{Command, CommandBody, CommandHeader, CommandKind, DatagramHeader};
use crate::sequence::time_difference;
use crate::socket::{RecvOutcome, Socket};
use crate::time::{Clock, SystemClock};

/// Matches `ENET_PROTOCOL_MAXIMUM_PACKET_COMMANDS`: the receive pipeline
/// gives up on a single datagram rather than loop forever on a corrupt one.
const MAX_COMMANDS_PER_DATAGRAM: usize = config::MAXIMUM_PACKET_COMMANDS;
/// Caps how many datagrams one `service()` call drains before returning
/// control to the caller, so a flood can't starve the event loop.
const MAX_DATAGRAMS_PER_SERVICE: usize = 256;

/// Reliable, sequenced, multi-channel transport over a [`Socket`].
///
/// `U` is an opaque per-peer user data slot (the source's untyped `void*
/// data`, rendered here as a generic field since Rust has no untyped
/// pointer idiom); `S` is the datagram transport; `C` is the clock driving
/// every timing decision, defaulted to wall-clock time.
pub struct Host<U, S: Socket, C: Clock = SystemClock> {
    config: HostConfig,
    socket: S,
    clock: C,
    peers: Vec<Peer<U>>,
    service_time: u32,
    bandwidth_throttle_epoch: u32,
    total_sent_data: u64,
    total_received_data: u64,
    pending_events: VecDeque<Event>,
    recv_buf: Vec<u8>,
    prevent_connections: bool,
    next_session_id: u8,
    recalculate_bandwidth_limits: bool,
}

impl<U, S: Socket> Host<U, S, SystemClock> {
    pub fn new(config: HostConfig, socket: S) -> Host<U, S, SystemClock> {
        Host::with_clock(config, socket, SystemClock::new())
    }
}

impl<U, S: Socket, C: Clock> Host<U, S, C> {
    pub fn with_clock(config: HostConfig, socket: S, clock: C) -> Host<U, S, C> {
        let config = config.sanitized();
        let peers = (0..config.peer_count)
            .map(|i| Peer::new(PeerHandle(i), &config))
            .collect();
        Host {
            recv_buf: vec![0u8; config.mtu.max(config::MAX_MTU)],
            config,
            socket,
            clock,
            peers,
            service_time: 0,
            bandwidth_throttle_epoch: 0,
            total_sent_data: 0,
            total_received_data: 0,
            pending_events: VecDeque::new(),
            prevent_connections: false,
            next_session_id: 0,
            recalculate_bandwidth_limits: false,
        }
    }

    pub fn peer(&self, handle: PeerHandle) -> &Peer<U> {
        &self.peers[handle.index()]
    }

    pub fn peer_mut(&mut self, handle: PeerHandle) -> &mut Peer<U> {
        &mut self.peers[handle.index()]
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer<U>> {
        self.peers.iter()
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut Peer<U>> {
        self.peers.iter_mut()
    }

    pub fn local_address(&self) -> std::io::Result<Address> {
        self.socket.local_address()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers.iter().filter(|p| p.is_connected()).count()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.total_sent_data
    }

    pub fn bytes_received(&self) -> u64 {
        self.total_received_data
    }

    /// Clamps future-negotiated channel counts; mirrors `enet_host_channel_limit`.
    pub fn channel_limit(&mut self, limit: usize) {
        self.config.channel_limit = limit.clamp(
            config::MINIMUM_CHANNEL_COUNT,
            config::MAXIMUM_CHANNEL_COUNT,
        );
    }

    /// Sets the host-wide bandwidth budget and immediately notifies every
    /// connected peer with a `BANDWIDTH_LIMIT` command so they recompute
    /// their fair share. Mirrors `enet_host_bandwidth_limit`.
    pub fn bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.config.incoming_bandwidth = incoming;
        self.config.outgoing_bandwidth = outgoing;
        self.bandwidth_throttle_epoch = 0;
        for peer in &mut self.peers {
            if peer.is_connected() {
                peer.queue_control_command(CommandBody::BandwidthLimit {
                    incoming_bandwidth: incoming,
                    outgoing_bandwidth: outgoing,
                });
            }
        }
    }

    /// When set, incoming `CONNECT` commands are silently ignored instead of
    /// allocating a peer slot. Mirrors `enet_host_prevent_connections`.
    pub fn prevent_connections(&mut self, prevent: bool) {
        self.prevent_connections = prevent;
    }

    fn allocate_session_id(&mut self) -> u8 {
        let id = self.next_session_id & 0x3;
        self.next_session_id = self.next_session_id.wrapping_add(1);
        id
    }

    /// Begins connecting to `address`, allocating the first free peer slot.
    /// Returns `None` if every slot is in use (mirrors `enet_host_connect`
    /// returning `NULL`).
    pub fn connect(&mut self, address: Address, channel_count: usize, data: u32) -> Option<PeerHandle> {
        let slot = self
            .peers
            .iter()
            .position(|p| p.state() == PeerState::Disconnected)?;
        let channel_count = channel_count
            .clamp(config::MINIMUM_CHANNEL_COUNT, config::MAXIMUM_CHANNEL_COUNT)
            .min(self.config.channel_limit);

        let session_id = self.allocate_session_id();
        let peer = &mut self.peers[slot];
        peer.reset();
        peer.address = address;
        peer.allocate_channels(channel_count);
        peer.connect_id = rand::random();
        peer.outgoing_session_id = session_id;
        peer.mtu = self.config.mtu as u32;
        peer.event_data = data;
        peer.state = PeerState::Connecting;

        let body = CommandBody::Connect {
            outgoing_peer_id: slot as u16,
            incoming_session_id: 0xFF,
            outgoing_session_id: session_id,
            mtu: peer.mtu,
            window_size: peer.window_size,
            channel_count: channel_count as u32,
            incoming_bandwidth: self.config.incoming_bandwidth,
            outgoing_bandwidth: self.config.outgoing_bandwidth,
            packet_throttle_interval: peer.packet_throttle_interval,
            packet_throttle_acceleration: peer.packet_throttle_acceleration,
            packet_throttle_deceleration: peer.packet_throttle_deceleration,
            connect_id: peer.connect_id,
            data,
        };
        peer.queue_control_command(body);

        Some(PeerHandle(slot))
    }

    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        for peer in &mut self.peers {
            if peer.is_connected() {
                let _ = peer.send(channel_id, packet.clone());
            }
        }
    }

    pub fn broadcast_excluding(&mut self, exclude: PeerHandle, channel_id: u8, packet: Packet) {
        for peer in &mut self.peers {
            if peer.handle() != exclude && peer.is_connected() {
                let _ = peer.send(channel_id, packet.clone());
            }
        }
    }

    /// Sends `packet` only to the listed peers, skipping anyone not
    /// currently connected rather than failing the whole call.
    pub fn broadcast_selective(&mut self, handles: &[PeerHandle], channel_id: u8, packet: Packet) {
        for &handle in handles {
            if handle.index() >= self.peers.len() {
                continue;
            }
            let peer = &mut self.peers[handle.index()];
            if peer.is_connected() {
                let _ = peer.send(channel_id, packet.clone());
            }
        }
    }

    /// Pops one already-queued event without touching the network. Mirrors
    /// `enet_host_check_events`.
    pub fn check_events(&mut self) -> Option<Event> {
        self.pending_events.pop_front()
    }

    /// Runs one full send/receive pass and returns the next event, if any.
    /// `timeout_ms` bounds how long to wait for incoming data when nothing
    /// is immediately ready; 0 never blocks. Mirrors `enet_host_service`.
    pub fn service(&mut self, timeout_ms: u32) -> Result<Option<Event>, ServiceError> {
        if let Some(event) = self.check_events() {
            return Ok(Some(event));
        }

        self.service_time = self.clock.now_ms();
        self.bandwidth_throttle();
        self.send_outgoing_commands()?;
        self.receive_incoming_datagrams()?;

        if let Some(event) = self.check_events() {
            return Ok(Some(event));
        }

        if timeout_ms > 0 {
            match self.socket.wait_readable(timeout_ms) {
                Ok(true) => {
                    self.service_time = self.clock.now_ms();
                    self.receive_incoming_datagrams()?;
                }
                Ok(false) => {}
                Err(_) => return Err(ServiceError::Socket),
            }
        }

        Ok(self.check_events())
    }

    /// Forces every peer's outgoing queue to flush without waiting for the
    /// next `service` call or producing events. Mirrors `enet_host_flush`.
    pub fn flush(&mut self) -> Result<(), ServiceError> {
        self.service_time = self.clock.now_ms();
        self.send_outgoing_commands()
    }

    /// Redistributes the host's outgoing bandwidth budget across connected
    /// peers and, when a connect/disconnect has invalidated the previous
    /// split, pushes each peer a fresh incoming-bandwidth share. Mirrors
    /// `enet_host_bandwidth_throttle`'s two-phase iterative redistribution.
    fn bandwidth_throttle(&mut self) {
        let elapsed = time_difference(self.service_time, self.bandwidth_throttle_epoch);
        if self.bandwidth_throttle_epoch != 0 && elapsed < config::HOST_BANDWIDTH_THROTTLE_INTERVAL_MS {
            return;
        }
        if self.config.outgoing_bandwidth == 0 && self.config.incoming_bandwidth == 0 {
            return;
        }
        self.bandwidth_throttle_epoch = self.service_time;

        let time_current = self.service_time;
        let connected_count = self.peers.iter().filter(|p| p.is_connected()).count() as u32;
        if connected_count == 0 {
            return;
        }

        let scale = config::PEER_PACKET_THROTTLE_SCALE;
        let (mut data_total, mut bandwidth): (u32, u32) = if self.config.outgoing_bandwidth != 0 {
            let bandwidth = (self.config.outgoing_bandwidth as u64 * elapsed as u64 / 1000) as u32;
            let data_total = self
                .peers
                .iter()
                .filter(|p| p.is_connected())
                .fold(0u32, |acc, p| acc.saturating_add(p.outgoing_data_total as u32));
            (data_total, bandwidth)
        } else {
            (u32::MAX, u32::MAX)
        };

        let mut peers_remaining = connected_count;
        let mut needs_adjustment = true;
        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;
            let throttle = if data_total <= bandwidth {
                scale
            } else {
                (bandwidth as u64 * scale as u64 / data_total as u64) as u32
            };

            for peer in &mut self.peers {
                if !peer.is_connected()
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }
                let peer_bandwidth = (peer.incoming_bandwidth as u64 * elapsed as u64 / 1000) as u32;
                if (throttle as u64 * peer.outgoing_data_total as u64 / scale as u64) as u32 <= peer_bandwidth {
                    continue;
                }

                let mut limit = (peer_bandwidth as u64 * scale as u64 / peer.outgoing_data_total as u64) as u32;
                if limit == 0 {
                    limit = 1;
                }
                peer.packet_throttle_limit = limit;
                if peer.packet_throttle > limit {
                    peer.packet_throttle = limit;
                }
                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            let throttle = if data_total <= bandwidth {
                scale
            } else {
                (bandwidth as u64 * scale as u64 / data_total as u64) as u32
            };
            for peer in &mut self.peers {
                if !peer.is_connected() || peer.outgoing_bandwidth_throttle_epoch == time_current {
                    continue;
                }
                peer.packet_throttle_limit = throttle;
                if peer.packet_throttle > throttle {
                    peer.packet_throttle = throttle;
                }
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;
            let mut peers_remaining = connected_count;
            let mut bandwidth = self.config.incoming_bandwidth;
            let mut needs_adjustment = true;
            let mut bandwidth_limit = 0u32;

            if bandwidth != 0 {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;
                    for peer in &mut self.peers {
                        if !peer.is_connected() || peer.incoming_bandwidth_throttle_epoch == time_current {
                            continue;
                        }
                        if peer.outgoing_bandwidth > 0 && peer.outgoing_bandwidth >= bandwidth_limit {
                            continue;
                        }
                        peer.incoming_bandwidth_throttle_epoch = time_current;
                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth = bandwidth.saturating_sub(peer.outgoing_bandwidth);
                    }
                }
            }

            for peer in &mut self.peers {
                if !peer.is_connected() {
                    continue;
                }
                let incoming_bandwidth = if peer.incoming_bandwidth_throttle_epoch == time_current {
                    peer.outgoing_bandwidth
                } else {
                    bandwidth_limit
                };
                peer.queue_control_command(CommandBody::BandwidthLimit {
                    incoming_bandwidth,
                    outgoing_bandwidth: self.config.outgoing_bandwidth,
                });
            }
        }
    }

    fn send_outgoing_commands(&mut self) -> Result<(), ServiceError> {
        for slot in 0..self.peers.len() {
            self.send_to_peer(PeerHandle(slot))?;
        }
        Ok(())
    }

    fn send_to_peer(&mut self, handle: PeerHandle) -> Result<(), ServiceError> {
        let service_time = self.service_time;
        {
            let peer = &mut self.peers[handle.index()];
            if peer.state() == PeerState::Disconnected {
                return Ok(());
            }
            if peer.check_timeouts(service_time) {
                let data = peer.event_data;
                peer.reset();
                self.pending_events
                    .push_back(Event::DisconnectTimeout { peer: handle });
                let _ = data;
                return Ok(());
            }
        }

        {
            let peer = &mut self.peers[handle.index()];
            if peer.state() == PeerState::DisconnectLater
                && peer.outgoing_commands.is_empty()
                && peer.sent_reliable_commands.is_empty()
            {
                let data = peer.event_data;
                peer.disconnect(data);
            }
        }

        {
            let peer = &mut self.peers[handle.index()];
            if peer.state() == PeerState::Connected
                && peer.sent_reliable_commands.is_empty()
                && time_difference(service_time, peer.last_send_time) >= peer.ping_interval
            {
                peer.queue_ping();
            }
        }

        let mut body_buf = Vec::with_capacity(self.peers[handle.index()].mtu as usize);
        let mut wire_commands: Vec<Command> = Vec::new();
        let mut zombie_data: Option<u32> = None;

        {
            let peer = &mut self.peers[handle.index()];
            while let Some(ack) = peer.acknowledgements.pop_front() {
                if ack.command_kind == CommandKind::Disconnect {
                    peer.state = PeerState::Zombie;
                    zombie_data = Some(peer.event_data);
                }
                wire_commands.push(Command {
                    header: CommandHeader {
                        kind: CommandKind::Acknowledge,
                        acknowledge: false,
                        unsequenced: false,
                        channel_id: ack.channel_id,
                        reliable_sequence_number: ack.reliable_sequence_number,
                    },
                    body: CommandBody::Acknowledge {
                        received_reliable_sequence_number: ack.reliable_sequence_number,
                        received_sent_time: ack.sent_time,
                    },
                });
                if wire_commands.len() >= MAX_COMMANDS_PER_DATAGRAM {
                    break;
                }
            }
        }
        if let Some(data) = zombie_data {
            self.pending_events.push_back(Event::Disconnect { peer: handle, data });
        }

        let mtu_budget = self.peers[handle.index()].mtu as usize;
        let mut pending = std::mem::take(&mut self.peers[handle.index()].outgoing_commands);
        let mut deferred = VecDeque::new();
        let mut window_wrap = false;
        let mut window_exceeded = false;

        while let Some(command) = pending.pop_front() {
            if wire_commands.len() >= MAX_COMMANDS_PER_DATAGRAM {
                deferred.push_back(command);
                continue;
            }

            let peer = &mut self.peers[handle.index()];
            let reliable = command.header.acknowledge;
            let channel_id = command.header.channel_id as usize;
            let has_channel = channel_id < peer.channels.len();
            let reliable_window = command.reliable_sequence_number / config::PEER_RELIABLE_WINDOW_SIZE;

            if reliable {
                if has_channel
                    && !window_wrap
                    && command.send_attempts < 1
                    && command.reliable_sequence_number % config::PEER_RELIABLE_WINDOW_SIZE == 0
                    && crate::peer::reliable_window_wrap_blocked(&peer.channels[channel_id], reliable_window)
                {
                    window_wrap = true;
                }
                if window_wrap {
                    deferred.push_back(command);
                    continue;
                }

                if command.packet.is_some() {
                    if !window_exceeded {
                        let window_size = peer.packet_throttle * peer.window_size / config::PEER_PACKET_THROTTLE_SCALE;
                        if peer.reliable_data_in_transit + command.fragment_length > window_size.max(peer.mtu) {
                            window_exceeded = true;
                        }
                    }
                    if window_exceeded {
                        deferred.push_back(command);
                        continue;
                    }
                }
            } else if let Some(packet) = &command.packet {
                if command.fragment_offset == 0 && !packet.flags().contains(PacketFlags::UNTHROTTLED) {
                    peer.packet_throttle_counter = (peer.packet_throttle_counter
                        + config::PEER_PACKET_THROTTLE_COUNTER)
                        % config::PEER_PACKET_THROTTLE_SCALE;
                    if peer.packet_throttle_counter > peer.packet_throttle {
                        let reliable_sequence_number = command.reliable_sequence_number;
                        let unreliable_sequence_number = command.unreliable_sequence_number;
                        while let Some(next) = pending.front() {
                            if next.reliable_sequence_number == reliable_sequence_number
                                && next.unreliable_sequence_number == unreliable_sequence_number
                            {
                                pending.pop_front();
                            } else {
                                break;
                            }
                        }
                        continue;
                    }
                }
            }

            let mut command = command;
            let encoded_len = command
                .body
                .as_ref()
                .map(|b| {
                    Command {
                        header: command.header,
                        body: b.clone(),
                    }
                    .encoded_len()
                })
                .unwrap_or(4);
            if wire_commands.iter().map(|c| c.encoded_len()).sum::<usize>() + encoded_len
                > mtu_budget.saturating_sub(4)
                && !wire_commands.is_empty()
            {
                deferred.push_back(command);
                deferred.extend(pending.drain(..));
                break;
            }

            command.sent_time = service_time;
            if reliable {
                if command.round_trip_timeout == 0 {
                    command.round_trip_timeout = peer.round_trip_time + 4 * peer.round_trip_time_variance;
                    command.round_trip_timeout_limit = peer.timeout_limit * command.round_trip_timeout;
                }
                peer.reliable_data_in_transit += command.fragment_length;
                if has_channel && command.send_attempts < 1 {
                    let channel = &mut peer.channels[channel_id];
                    channel.used_reliable_windows |= 1 << reliable_window;
                    channel.reliable_windows[reliable_window as usize] += 1;
                }
                command.send_attempts += 1;
            }
            peer.total_packets_sent += 1;

            if let Some(body) = command.body.clone() {
                wire_commands.push(Command {
                    header: command.header,
                    body,
                });
            }

            if reliable {
                peer.sent_reliable_commands.push_back(command);
            }
        }

        deferred.extend(pending);
        self.peers[handle.index()].outgoing_commands = deferred;

        if wire_commands.is_empty() {
            return Ok(());
        }

        let peer = &mut self.peers[handle.index()];
        let header = DatagramHeader {
            peer_id: peer.outgoing_peer_id,
            session_id: peer.outgoing_session_id as u16,
            sent_time: Some(service_time as u16),
        };
        let mut header_buf = Vec::with_capacity(4);
        header
            .write(&mut header_buf)
            .map_err(|_| ServiceError::Socket)?;

        body_buf.clear();
        for command in &wire_commands {
            command.write(&mut body_buf).map_err(|_| ServiceError::Socket)?;
        }

        let sent = self
            .socket
            .send(peer.address, &[&header_buf, &body_buf])
            .map_err(|_| ServiceError::Socket)?;
        peer.last_send_time = service_time;
        peer.outgoing_data_total += sent;
        self.total_sent_data += sent as u64;

        if peer.state() == PeerState::Zombie {
            peer.reset();
        }

        Ok(())
    }

    fn receive_incoming_datagrams(&mut self) -> Result<(), ServiceError> {
        for _ in 0..MAX_DATAGRAMS_PER_SERVICE {
            let outcome = {
                let buf = &mut self.recv_buf;
                self.socket.recv(buf).map_err(|_| ServiceError::Socket)?
            };
            match outcome {
                RecvOutcome::WouldBlock => return Ok(()),
                RecvOutcome::Truncated => continue,
                RecvOutcome::Datagram(from, len) => {
                    self.total_received_data += len as u64;
                    let buf = self.recv_buf[..len].to_vec();
                    self.handle_datagram(from, &buf);
                }
            }
        }
        Ok(())
    }

    fn handle_datagram(&mut self, from: Address, buf: &[u8]) {
        let (header, offset) = match DatagramHeader::read(buf) {
            Ok(ok) => ok,
            Err(e) => {
                trace!("dropping malformed datagram from {from}: {e}");
                return;
            }
        };

        let handle = if header.peer_id == DatagramHeader::PEER_ID_NONE {
            None
        } else if (header.peer_id as usize) < self.peers.len() {
            Some(PeerHandle(header.peer_id as usize))
        } else {
            trace!("dropping datagram addressed to out-of-range peer id {}", header.peer_id);
            return;
        };

        if let Some(handle) = handle {
            if self.peers[handle.index()].address != from && self.peers[handle.index()].state() != PeerState::Disconnected
            {
                trace!("dropping datagram with mismatched source address");
                return;
            }
        }

        let mut cursor = Cursor::new(&buf[offset..]);
        let mut commands = Vec::new();
        while (cursor.position() as usize) < cursor.get_ref().len() {
            match Command::read(&mut cursor) {
                Ok(command) => commands.push(command),
                Err(_) => break,
            }
            if commands.len() >= MAX_COMMANDS_PER_DATAGRAM {
                break;
            }
        }

        for command in commands {
            self.handle_command(handle, from, &header, command);
        }
    }

    fn handle_command(
        &mut self,
        handle: Option<PeerHandle>,
        from: Address,
        datagram_header: &DatagramHeader,
        command: Command,
    ) {
        if command.header.kind == CommandKind::Connect {
            self.handle_connect(from, datagram_header, command);
            return;
        }

        let Some(handle) = handle else {
            trace!("dropping non-connect command with no peer id");
            return;
        };

        if self.peers[handle.index()].state() == PeerState::Disconnected {
            return;
        }

        let header = command.header;
        self.peers[handle.index()].last_receive_time = self.service_time;

        match command.body {
            CommandBody::Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => self.handle_acknowledge(
                handle,
                command.header.channel_id,
                received_reliable_sequence_number,
                received_sent_time,
            ),
            CommandBody::VerifyConnect {
                outgoing_peer_id,
                incoming_session_id,
                outgoing_session_id,
                mtu,
                window_size,
                channel_count,
                incoming_bandwidth,
                outgoing_bandwidth,
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
                connect_id,
            } => self.handle_verify_connect(
                handle,
                CommandBody::VerifyConnect {
                    outgoing_peer_id,
                    incoming_session_id,
                    outgoing_session_id,
                    mtu,
                    window_size,
                    channel_count,
                    incoming_bandwidth,
                    outgoing_bandwidth,
                    packet_throttle_interval,
                    packet_throttle_acceleration,
                    packet_throttle_deceleration,
                    connect_id,
                },
            ),
            CommandBody::Disconnect { data } => self.handle_disconnect(handle, header.acknowledge, data),
            CommandBody::Ping => {}
            CommandBody::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                let peer = &mut self.peers[handle.index()];
                peer.incoming_bandwidth = incoming_bandwidth;
                peer.outgoing_bandwidth = outgoing_bandwidth;
            }
            CommandBody::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                self.peers[handle.index()].throttle_configure(PeerThrottleConfig {
                    interval_ms: packet_throttle_interval,
                    acceleration: packet_throttle_acceleration,
                    deceleration: packet_throttle_deceleration,
                });
            }
            CommandBody::SendReliable { data } => {
                let seq = command.header.reliable_sequence_number;
                self.queue_incoming(handle, command.header, seq, 1, 0, 0, data.len() as u32, &data);
            }
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                data,
            } => {
                self.queue_incoming_unreliable(handle, command.header, unreliable_sequence_number, &data);
            }
            CommandBody::SendUnsequenced {
                unsequenced_group,
                data,
            } => {
                self.queue_incoming_unsequenced(handle, command.header, unsequenced_group, &data);
            }
            CommandBody::SendFragment {
                start_sequence_number,
                fragment_count,
                fragment_number,
                total_length,
                fragment_offset,
                data,
            } => {
                self.queue_incoming(
                    handle,
                    command.header,
                    start_sequence_number,
                    fragment_count,
                    fragment_number,
                    fragment_offset,
                    total_length,
                    &data,
                );
            }
            CommandBody::Connect { .. } => {}
        }

        if header.acknowledge {
            let should_ack = match self.peers[handle.index()].state() {
                PeerState::Disconnecting
                | PeerState::AcknowledgingConnect
                | PeerState::Disconnected
                | PeerState::Zombie => false,
                PeerState::AcknowledgingDisconnect => header.kind == CommandKind::Disconnect,
                _ => true,
            };
            if should_ack {
                let sent_time = datagram_header.sent_time.unwrap_or(0);
                self.peers[handle.index()].queue_acknowledgement(&header, sent_time);
            }
        }
    }

    fn queue_incoming(
        &mut self,
        handle: PeerHandle,
        header: CommandHeader,
        logical_sequence_number: u16,
        fragment_count: u32,
        fragment_number: u32,
        fragment_offset: u32,
        total_length: u32,
        data: &[u8],
    ) {
        let peer = &mut self.peers[handle.index()];
        let outcome = peer.queue_incoming_command(
            header.channel_id,
            header.kind,
            logical_sequence_number,
            0,
            fragment_count,
            fragment_number,
            fragment_offset,
            total_length,
            data,
        );
        self.finish_queue(handle, outcome);
    }

    fn queue_incoming_unreliable(
        &mut self,
        handle: PeerHandle,
        header: CommandHeader,
        unreliable_sequence_number: u16,
        data: &[u8],
    ) {
        let peer = &mut self.peers[handle.index()];
        let outcome = peer.queue_incoming_command(
            header.channel_id,
            header.kind,
            header.reliable_sequence_number,
            unreliable_sequence_number,
            1,
            0,
            0,
            data.len() as u32,
            data,
        );
        self.finish_queue(handle, outcome);
    }

    fn queue_incoming_unsequenced(
        &mut self,
        handle: PeerHandle,
        header: CommandHeader,
        unsequenced_group: u16,
        data: &[u8],
    ) {
        let peer = &mut self.peers[handle.index()];
        let outcome = peer.queue_incoming_command(
            header.channel_id,
            header.kind,
            0,
            unsequenced_group,
            1,
            0,
            0,
            data.len() as u32,
            data,
        );
        self.finish_queue(handle, outcome);
    }

    fn finish_queue(&mut self, handle: PeerHandle, outcome: QueueIncomingOutcome) {
        match outcome {
            QueueIncomingOutcome::Queued => {
                let peer = &mut self.peers[handle.index()];
                while let Some((channel_id, packet)) = peer.receive() {
                    self.pending_events.push_back(Event::Receive {
                        peer: handle,
                        channel_id,
                        packet,
                    });
                }
            }
            QueueIncomingOutcome::Discarded => {}
            QueueIncomingOutcome::Rejected(reason) => {
                warn!("rejecting incoming command from peer {}: {reason:?}", handle.index());
            }
        }
    }

    fn handle_connect(&mut self, from: Address, datagram_header: &DatagramHeader, command: Command) {
        let CommandBody::Connect {
            outgoing_peer_id,
            outgoing_session_id,
            mtu,
            window_size,
            channel_count,
            connect_id,
            data,
            ..
        } = command.body
        else {
            return;
        };

        if self.prevent_connections {
            return;
        }
        if !crate::protocol::channel_count_in_range(channel_count) {
            return;
        }

        let Some(slot) = self
            .peers
            .iter()
            .position(|p| p.state() == PeerState::Disconnected)
        else {
            debug!("rejecting connect from {from}: no free peer slots");
            return;
        };

        let channel_count = (channel_count as usize)
            .clamp(config::MINIMUM_CHANNEL_COUNT, config::MAXIMUM_CHANNEL_COUNT)
            .min(self.config.channel_limit);
        let incoming_session_id = self.allocate_session_id();

        let peer = &mut self.peers[slot];
        peer.reset();
        peer.address = from;
        peer.outgoing_peer_id = outgoing_peer_id;
        peer.incoming_session_id = incoming_session_id;
        peer.outgoing_session_id = outgoing_session_id;
        peer.connect_id = connect_id;
        peer.allocate_channels(channel_count);
        peer.mtu = mtu.clamp(config::MIN_MTU as u32, self.config.mtu as u32);
        peer.window_size = window_size.clamp(config::MINIMUM_WINDOW_SIZE, config::MAXIMUM_WINDOW_SIZE);
        peer.event_data = data;
        peer.state = PeerState::AcknowledgingConnect;
        peer.last_receive_time = self.service_time;

        let body = CommandBody::VerifyConnect {
            outgoing_peer_id: slot as u16,
            incoming_session_id,
            outgoing_session_id,
            mtu: peer.mtu,
            window_size: peer.window_size,
            channel_count: channel_count as u32,
            incoming_bandwidth: self.config.incoming_bandwidth,
            outgoing_bandwidth: self.config.outgoing_bandwidth,
            packet_throttle_interval: peer.packet_throttle_interval,
            packet_throttle_acceleration: peer.packet_throttle_acceleration,
            packet_throttle_deceleration: peer.packet_throttle_deceleration,
            connect_id,
        };
        peer.queue_control_command(body);
        let _ = datagram_header;
    }

    fn handle_verify_connect(&mut self, handle: PeerHandle, body: CommandBody) {
        let CommandBody::VerifyConnect {
            outgoing_peer_id,
            incoming_session_id,
            outgoing_session_id,
            mtu,
            window_size,
            channel_count,
            connect_id,
            ..
        } = body
        else {
            return;
        };

        let peer = &mut self.peers[handle.index()];
        if peer.state() != PeerState::Connecting || connect_id != peer.connect_id {
            return;
        }

        let channel_count = (channel_count as usize).min(peer.channel_count()).max(1);
        peer.channels.truncate(channel_count);
        peer.outgoing_peer_id = outgoing_peer_id;
        peer.incoming_session_id = incoming_session_id;
        peer.outgoing_session_id = outgoing_session_id;
        peer.mtu = mtu.min(peer.mtu);
        peer.window_size = window_size;

        self.notify_connect(handle);
    }

    /// Promotes a peer to `Connected` and fires `Event::Connect`. The only
    /// path that legitimizes the promotion is the client seeing its own
    /// `VERIFY_CONNECT` acknowledged, or the server seeing the client's
    /// acknowledgement of `VERIFY_CONNECT` itself — never the raw `CONNECT`.
    fn notify_connect(&mut self, handle: PeerHandle) {
        let peer = &mut self.peers[handle.index()];
        peer.state = PeerState::Connected;
        peer.on_connect();
        self.recalculate_bandwidth_limits = true;

        let data = peer.event_data;
        self.pending_events.push_back(Event::Connect { peer: handle, data });
    }

    /// Mirrors `enet_protocol_handle_disconnect`: queues are always reset
    /// first, then the peer either zombies immediately, resets silently (if
    /// the handshake hadn't fully landed), acks and waits in
    /// `AcknowledgingDisconnect`, or zombies outright.
    fn handle_disconnect(&mut self, handle: PeerHandle, acknowledge: bool, data: u32) {
        let peer = &mut self.peers[handle.index()];
        let state = peer.state();
        if matches!(
            state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return;
        }

        peer.reset_queues();
        peer.event_data = data;

        if matches!(
            state,
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting
        ) {
            self.dispatch_zombie(handle);
        } else if !matches!(state, PeerState::Connected | PeerState::DisconnectLater) {
            if state == PeerState::ConnectionPending {
                self.recalculate_bandwidth_limits = true;
            }
            self.peers[handle.index()].reset();
        } else if acknowledge {
            peer.state = PeerState::AcknowledgingDisconnect;
        } else {
            self.dispatch_zombie(handle);
        }
    }

    /// Fires `Event::Disconnect` carrying the peer's own `event_data` and
    /// resets it. Mirrors the `ZOMBIE` case of
    /// `enet_protocol_dispatch_incoming_commands` — the immediate-dispatch
    /// counterpart of queuing a peer for the next event drain.
    fn dispatch_zombie(&mut self, handle: PeerHandle) {
        self.recalculate_bandwidth_limits = true;
        let data = self.peers[handle.index()].event_data;
        self.pending_events.push_back(Event::Disconnect { peer: handle, data });
        self.peers[handle.index()].reset();
    }

    /// Mirrors `enet_protocol_dispatch_state`'s `notify_disconnect`: a peer
    /// that never finished connecting is reset silently; one that was
    /// already live fires `Event::Disconnect` with the *wire* disconnect
    /// data, not whatever `event_data` carried, before resetting.
    fn notify_disconnect(&mut self, handle: PeerHandle, previous_state: PeerState, _data: u32) {
        if matches!(
            previous_state,
            PeerState::ConnectionPending
                | PeerState::ConnectionSucceeded
                | PeerState::Connected
                | PeerState::DisconnectLater
                | PeerState::Disconnecting
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            self.recalculate_bandwidth_limits = true;
        }

        if matches!(
            previous_state,
            PeerState::Disconnected | PeerState::AcknowledgingConnect | PeerState::ConnectionPending
        ) {
            self.peers[handle.index()].reset();
        } else {
            self.pending_events.push_back(Event::Disconnect { peer: handle, data: 0 });
            self.peers[handle.index()].reset();
        }
    }

    fn handle_acknowledge(
        &mut self,
        handle: PeerHandle,
        channel_id: u8,
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
    ) {
        let service_time = self.service_time;
        if matches!(self.peers[handle.index()].state(), PeerState::Disconnected | PeerState::Zombie) {
            return;
        }

        let peer = &mut self.peers[handle.index()];
        let Some(kind) = peer.remove_sent_reliable_command(received_reliable_sequence_number, channel_id)
        else {
            return;
        };

        if let Some(rtt) = reconstruct_round_trip_time(service_time, received_sent_time) {
            peer.update_round_trip_time(rtt, service_time);
        }

        let state = peer.state();
        match state {
            PeerState::AcknowledgingConnect => {
                if kind == CommandKind::VerifyConnect {
                    self.notify_connect(handle);
                }
            }
            PeerState::Disconnecting => {
                if kind == CommandKind::Disconnect {
                    self.notify_disconnect(handle, state, 0);
                }
            }
            PeerState::DisconnectLater => {
                let peer = &mut self.peers[handle.index()];
                if peer.outgoing_commands.is_empty() && peer.sent_reliable_commands.is_empty() {
                    let data = peer.event_data;
                    peer.disconnect(data);
                }
            }
            _ => {}
        }
    }
}

/// Reconstructs a full 32-bit RTT sample from the 16-bit echoed send time,
/// correcting for the one wraparound the 16-bit truncation can introduce.
/// Kept bit-for-bit faithful to the source's sign-bit correction rather than
/// a "cleaner" modular reimplementation.
fn reconstruct_round_trip_time(service_time: u32, received_sent_time: u16) -> Option<u32> {
    let mut sent_time = (service_time & 0xFFFF_0000) | received_sent_time as u32;
    if (sent_time & 0x8000) > (service_time & 0x8000) {
        sent_time = sent_time.wrapping_sub(0x10000);
    }
    if crate::sequence::time_less(service_time, sent_time) {
        return None;
    }
    Some(time_difference(service_time, sent_time))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::socket::UdpTransport;

    #[test]
    fn fresh_host_has_all_peers_disconnected() {
        let socket = UdpTransport::bind(Address::from_ipv4(std::net::Ipv4Addr::LOCALHOST, 0)).unwrap();
        let host: Host<(), UdpTransport> = Host::new(
            HostConfig {
                peer_count: 4,
                ..HostConfig::default()
            },
            socket,
        );
        assert_eq!(host.peers().count(), 4);
        assert!(host.peers().all(|p| p.state() == PeerState::Disconnected));
    }
}
