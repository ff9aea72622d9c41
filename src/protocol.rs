//! Wire format: command opcodes, the per-datagram header, and per-command
//! encode/decode. Multi-byte fields are big-endian (network byte order),
//! matching the source's `ENET_HOST_TO_NET_16/32` conversions — this is a
//! wire format, not a local in-memory layout, so it follows the source
//! exactly rather than the little-endian convention used elsewhere in this
//! codebase's ancestry.

use std::io::{self, Cursor};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::config::{MAXIMUM_CHANNEL_COUNT, MAXIMUM_FRAGMENT_COUNT, MAXIMUM_PEER_ID};

pub const COMMAND_MASK: u8 = 0x0F;
pub const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
pub const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;

pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 14;
pub const HEADER_SESSION_MASK: u16 = 3 << 12;
pub const HEADER_SESSION_SHIFT: u16 = 12;

#[cfg(feature = "serialize_check")]
pub const SERIALIZE_CHECK_VALUE: u32 = 0x1234_5678;

/// Opcode carried in the low nibble of every command header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Acknowledge = 1,
    Connect = 2,
    VerifyConnect = 3,
    Disconnect = 4,
    Ping = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    SendFragment = 8,
    SendUnsequenced = 9,
    BandwidthLimit = 10,
    ThrottleConfigure = 11,
    SendUnreliableFragment = 12,
}

impl CommandKind {
    pub fn from_opcode(opcode: u8) -> Option<CommandKind> {
        use CommandKind::*;
        Some(match opcode & COMMAND_MASK {
            1 => Acknowledge,
            2 => Connect,
            3 => VerifyConnect,
            4 => Disconnect,
            5 => Ping,
            6 => SendReliable,
            7 => SendUnreliable,
            8 => SendFragment,
            9 => SendUnsequenced,
            10 => BandwidthLimit,
            11 => ThrottleConfigure,
            12 => SendUnreliableFragment,
            _ => return None,
        })
    }
}

/// Common prefix of every command: opcode (with the acknowledge/unsequenced
/// flag bits folded in), the channel it belongs to, and the sender's
/// reliable sequence number as of the send.
#[derive(Debug, Clone, Copy)]
pub struct CommandHeader {
    pub kind: CommandKind,
    pub acknowledge: bool,
    pub unsequenced: bool,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
}

impl CommandHeader {
    pub fn opcode_byte(&self) -> u8 {
        (self.kind as u8)
            | if self.acknowledge {
                COMMAND_FLAG_ACKNOWLEDGE
            } else {
                0
            }
            | if self.unsequenced {
                COMMAND_FLAG_UNSEQUENCED
            } else {
                0
            }
    }

    fn write(&self, w: &mut impl io::Write) -> io::Result<()> {
        w.write_u8(self.opcode_byte())?;
        w.write_u8(self.channel_id)?;
        w.write_u16::<BigEndian>(self.reliable_sequence_number)
    }

    fn read(r: &mut impl io::Read) -> io::Result<CommandHeader> {
        let opcode = r.read_u8()?;
        let kind = CommandKind::from_opcode(opcode)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown command opcode"))?;
        let channel_id = r.read_u8()?;
        let reliable_sequence_number = r.read_u16::<BigEndian>()?;
        Ok(CommandHeader {
            kind,
            acknowledge: opcode & COMMAND_FLAG_ACKNOWLEDGE != 0,
            unsequenced: opcode & COMMAND_FLAG_UNSEQUENCED != 0,
            channel_id,
            reliable_sequence_number,
        })
    }
}

/// Per-datagram header: which peer slot this is addressed to (or
/// `MAXIMUM_PEER_ID` during the connect handshake, before a slot exists),
/// the session ID folded into its high bits, and an optional echoed send
/// timestamp used for RTT sampling.
#[derive(Debug, Clone, Copy)]
pub struct DatagramHeader {
    pub peer_id: u16,
    pub session_id: u16,
    pub sent_time: Option<u16>,
}

impl DatagramHeader {
    pub const PEER_ID_NONE: u16 = MAXIMUM_PEER_ID;

    pub fn encoded_len(&self) -> usize {
        if self.sent_time.is_some() {
            4
        } else {
            2
        }
    }

    pub fn write(&self, w: &mut impl io::Write) -> io::Result<()> {
        let mut field = self.peer_id & !(HEADER_SESSION_MASK | HEADER_FLAG_SENT_TIME);
        field |= (self.session_id << HEADER_SESSION_SHIFT) & HEADER_SESSION_MASK;
        if self.sent_time.is_some() {
            field |= HEADER_FLAG_SENT_TIME;
        }
        w.write_u16::<BigEndian>(field)?;
        if let Some(sent_time) = self.sent_time {
            w.write_u16::<BigEndian>(sent_time)?;
        }
        Ok(())
    }

    /// `buf` is the full received datagram; only the header is consumed.
    /// Returns the header plus the byte offset where commands begin.
    pub fn read(buf: &[u8]) -> io::Result<(DatagramHeader, usize)> {
        if buf.len() < 2 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short datagram"));
        }
        let mut cursor = Cursor::new(buf);
        let field = cursor.read_u16::<BigEndian>()?;
        let session_id = (field & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT;
        let has_sent_time = field & HEADER_FLAG_SENT_TIME != 0;
        let peer_id = field & !(HEADER_SESSION_MASK | HEADER_FLAG_SENT_TIME);
        let sent_time = if has_sent_time {
            Some(cursor.read_u16::<BigEndian>()?)
        } else {
            None
        };
        Ok((
            DatagramHeader {
                peer_id,
                session_id,
                sent_time,
            },
            cursor.position() as usize,
        ))
    }
}

/// Payload bodies carried after a [`CommandHeader`]. Unlike the source's
/// tagged union over a fixed-size buffer, each variant owns only the bytes
/// it needs; `CommandHeader::kind` and this enum's variant are kept in sync
/// by construction rather than by a shared discriminant.
#[derive(Debug, Clone)]
pub enum CommandBody {
    Acknowledge {
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
    },
    Connect {
        outgoing_peer_id: u16,
        incoming_session_id: u8,
        outgoing_session_id: u8,
        mtu: u32,
        window_size: u32,
        channel_count: u32,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
        connect_id: u32,
        data: u32,
    },
    VerifyConnect {
        outgoing_peer_id: u16,
        incoming_session_id: u8,
        outgoing_session_id: u8,
        mtu: u32,
        window_size: u32,
        channel_count: u32,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
        connect_id: u32,
    },
    BandwidthLimit {
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    ThrottleConfigure {
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
    },
    Disconnect {
        data: u32,
    },
    Ping,
    SendReliable {
        data: Vec<u8>,
    },
    SendUnreliable {
        unreliable_sequence_number: u16,
        data: Vec<u8>,
    },
    SendUnsequenced {
        unsequenced_group: u16,
        data: Vec<u8>,
    },
    SendFragment {
        start_sequence_number: u16,
        fragment_count: u32,
        fragment_number: u32,
        total_length: u32,
        fragment_offset: u32,
        data: Vec<u8>,
    },
}

/// A full command: header plus body, ready to append to an outgoing
/// datagram or as decoded from an incoming one.
#[derive(Debug, Clone)]
pub struct Command {
    pub header: CommandHeader,
    pub body: CommandBody,
}

impl Command {
    pub fn encoded_len(&self) -> usize {
        4 + match &self.body {
            CommandBody::Acknowledge { .. } => 4,
            CommandBody::Connect { .. } => 48,
            CommandBody::VerifyConnect { .. } => 44,
            CommandBody::BandwidthLimit { .. } => 8,
            CommandBody::ThrottleConfigure { .. } => 12,
            CommandBody::Disconnect { .. } => 4,
            CommandBody::Ping => 0,
            CommandBody::SendReliable { data } => 2 + data.len(),
            CommandBody::SendUnreliable { data, .. } => 4 + data.len(),
            CommandBody::SendUnsequenced { data, .. } => 4 + data.len(),
            CommandBody::SendFragment { data, .. } => 18 + data.len(),
        }
    }

    pub fn write(&self, w: &mut impl io::Write) -> io::Result<()> {
        self.header.write(w)?;
        match &self.body {
            CommandBody::Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => {
                w.write_u16::<BigEndian>(*received_reliable_sequence_number)?;
                w.write_u16::<BigEndian>(*received_sent_time)?;
            }
            CommandBody::Connect {
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
                data,
            } => {
                w.write_u16::<BigEndian>(*outgoing_peer_id)?;
                w.write_u8(*incoming_session_id)?;
                w.write_u8(*outgoing_session_id)?;
                w.write_u32::<BigEndian>(*mtu)?;
                w.write_u32::<BigEndian>(*window_size)?;
                w.write_u32::<BigEndian>(*channel_count)?;
                w.write_u32::<BigEndian>(*incoming_bandwidth)?;
                w.write_u32::<BigEndian>(*outgoing_bandwidth)?;
                w.write_u32::<BigEndian>(*packet_throttle_interval)?;
                w.write_u32::<BigEndian>(*packet_throttle_acceleration)?;
                w.write_u32::<BigEndian>(*packet_throttle_deceleration)?;
                w.write_u32::<BigEndian>(*connect_id)?;
                w.write_u32::<BigEndian>(*data)?;
            }
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
            } => {
                w.write_u16::<BigEndian>(*outgoing_peer_id)?;
                w.write_u8(*incoming_session_id)?;
                w.write_u8(*outgoing_session_id)?;
                w.write_u32::<BigEndian>(*mtu)?;
                w.write_u32::<BigEndian>(*window_size)?;
                w.write_u32::<BigEndian>(*channel_count)?;
                w.write_u32::<BigEndian>(*incoming_bandwidth)?;
                w.write_u32::<BigEndian>(*outgoing_bandwidth)?;
                w.write_u32::<BigEndian>(*packet_throttle_interval)?;
                w.write_u32::<BigEndian>(*packet_throttle_acceleration)?;
                w.write_u32::<BigEndian>(*packet_throttle_deceleration)?;
                w.write_u32::<BigEndian>(*connect_id)?;
            }
            CommandBody::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                w.write_u32::<BigEndian>(*incoming_bandwidth)?;
                w.write_u32::<BigEndian>(*outgoing_bandwidth)?;
            }
            CommandBody::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                w.write_u32::<BigEndian>(*packet_throttle_interval)?;
                w.write_u32::<BigEndian>(*packet_throttle_acceleration)?;
                w.write_u32::<BigEndian>(*packet_throttle_deceleration)?;
            }
            CommandBody::Disconnect { data } => {
                w.write_u32::<BigEndian>(*data)?;
            }
            CommandBody::Ping => {}
            CommandBody::SendReliable { data } => {
                w.write_u16::<BigEndian>(data.len() as u16)?;
                w.write_all(data)?;
            }
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                data,
            } => {
                w.write_u16::<BigEndian>(*unreliable_sequence_number)?;
                w.write_u16::<BigEndian>(data.len() as u16)?;
                w.write_all(data)?;
            }
            CommandBody::SendUnsequenced {
                unsequenced_group,
                data,
            } => {
                w.write_u16::<BigEndian>(*unsequenced_group)?;
                w.write_u16::<BigEndian>(data.len() as u16)?;
                w.write_all(data)?;
            }
            CommandBody::SendFragment {
                start_sequence_number,
                fragment_count,
                fragment_number,
                total_length,
                fragment_offset,
                data,
            } => {
                w.write_u16::<BigEndian>(*start_sequence_number)?;
                w.write_u16::<BigEndian>(data.len() as u16)?;
                w.write_u32::<BigEndian>(*fragment_count)?;
                w.write_u32::<BigEndian>(*fragment_number)?;
                w.write_u32::<BigEndian>(*total_length)?;
                w.write_u32::<BigEndian>(*fragment_offset)?;
                w.write_all(data)?;
            }
        }

        #[cfg(feature = "serialize_check")]
        w.write_u32::<BigEndian>(SERIALIZE_CHECK_VALUE)?;

        Ok(())
    }

    /// Decodes one command starting at the cursor's current position,
    /// advancing it past the command (and its payload, for send commands).
    pub fn read(cursor: &mut Cursor<&[u8]>) -> io::Result<Command> {
        let header = CommandHeader::read(cursor)?;
        let body = match header.kind {
            CommandKind::Acknowledge => CommandBody::Acknowledge {
                received_reliable_sequence_number: cursor.read_u16::<BigEndian>()?,
                received_sent_time: cursor.read_u16::<BigEndian>()?,
            },
            CommandKind::Connect => CommandBody::Connect {
                outgoing_peer_id: cursor.read_u16::<BigEndian>()?,
                incoming_session_id: cursor.read_u8()?,
                outgoing_session_id: cursor.read_u8()?,
                mtu: cursor.read_u32::<BigEndian>()?,
                window_size: cursor.read_u32::<BigEndian>()?,
                channel_count: cursor.read_u32::<BigEndian>()?,
                incoming_bandwidth: cursor.read_u32::<BigEndian>()?,
                outgoing_bandwidth: cursor.read_u32::<BigEndian>()?,
                packet_throttle_interval: cursor.read_u32::<BigEndian>()?,
                packet_throttle_acceleration: cursor.read_u32::<BigEndian>()?,
                packet_throttle_deceleration: cursor.read_u32::<BigEndian>()?,
                connect_id: cursor.read_u32::<BigEndian>()?,
                data: cursor.read_u32::<BigEndian>()?,
            },
            CommandKind::VerifyConnect => CommandBody::VerifyConnect {
                outgoing_peer_id: cursor.read_u16::<BigEndian>()?,
                incoming_session_id: cursor.read_u8()?,
                outgoing_session_id: cursor.read_u8()?,
                mtu: cursor.read_u32::<BigEndian>()?,
                window_size: cursor.read_u32::<BigEndian>()?,
                channel_count: cursor.read_u32::<BigEndian>()?,
                incoming_bandwidth: cursor.read_u32::<BigEndian>()?,
                outgoing_bandwidth: cursor.read_u32::<BigEndian>()?,
                packet_throttle_interval: cursor.read_u32::<BigEndian>()?,
                packet_throttle_acceleration: cursor.read_u32::<BigEndian>()?,
                packet_throttle_deceleration: cursor.read_u32::<BigEndian>()?,
                connect_id: cursor.read_u32::<BigEndian>()?,
            },
            CommandKind::BandwidthLimit => CommandBody::BandwidthLimit {
                incoming_bandwidth: cursor.read_u32::<BigEndian>()?,
                outgoing_bandwidth: cursor.read_u32::<BigEndian>()?,
            },
            CommandKind::ThrottleConfigure => CommandBody::ThrottleConfigure {
                packet_throttle_interval: cursor.read_u32::<BigEndian>()?,
                packet_throttle_acceleration: cursor.read_u32::<BigEndian>()?,
                packet_throttle_deceleration: cursor.read_u32::<BigEndian>()?,
            },
            CommandKind::Disconnect => CommandBody::Disconnect {
                data: cursor.read_u32::<BigEndian>()?,
            },
            CommandKind::Ping => CommandBody::Ping,
            CommandKind::SendReliable => {
                let len = cursor.read_u16::<BigEndian>()? as usize;
                CommandBody::SendReliable {
                    data: read_payload(cursor, len)?,
                }
            }
            CommandKind::SendUnreliable => {
                let unreliable_sequence_number = cursor.read_u16::<BigEndian>()?;
                let len = cursor.read_u16::<BigEndian>()? as usize;
                CommandBody::SendUnreliable {
                    unreliable_sequence_number,
                    data: read_payload(cursor, len)?,
                }
            }
            CommandKind::SendUnsequenced => {
                let unsequenced_group = cursor.read_u16::<BigEndian>()?;
                let len = cursor.read_u16::<BigEndian>()? as usize;
                CommandBody::SendUnsequenced {
                    unsequenced_group,
                    data: read_payload(cursor, len)?,
                }
            }
            CommandKind::SendFragment | CommandKind::SendUnreliableFragment => {
                let start_sequence_number = cursor.read_u16::<BigEndian>()?;
                let len = cursor.read_u16::<BigEndian>()? as usize;
                let fragment_count = cursor.read_u32::<BigEndian>()?;
                let fragment_number = cursor.read_u32::<BigEndian>()?;
                let total_length = cursor.read_u32::<BigEndian>()?;
                let fragment_offset = cursor.read_u32::<BigEndian>()?;
                if fragment_count > MAXIMUM_FRAGMENT_COUNT || fragment_number >= fragment_count {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "fragment count/number out of range",
                    ));
                }
                CommandBody::SendFragment {
                    start_sequence_number,
                    fragment_count,
                    fragment_number,
                    total_length,
                    fragment_offset,
                    data: read_payload(cursor, len)?,
                }
            }
        };

        #[cfg(feature = "serialize_check")]
        {
            let check_value = cursor.read_u32::<BigEndian>()?;
            if check_value != SERIALIZE_CHECK_VALUE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "serialize_check sentinel mismatch",
                ));
            }
        }

        Ok(Command { header, body })
    }
}

fn read_payload(cursor: &mut Cursor<&[u8]>, len: usize) -> io::Result<Vec<u8>> {
    let pos = cursor.position() as usize;
    let buf = *cursor.get_ref();
    if pos + len > buf.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short payload"));
    }
    let data = buf[pos..pos + len].to_vec();
    cursor.set_position((pos + len) as u64);
    Ok(data)
}

pub fn channel_count_in_range(count: u32) -> bool {
    (1..=MAXIMUM_CHANNEL_COUNT as u32).contains(&count)
}

#[cfg(test)]
mod test {
    use super::*;

    fn header(kind: CommandKind) -> CommandHeader {
        CommandHeader {
            kind,
            acknowledge: false,
            unsequenced: false,
            channel_id: 2,
            reliable_sequence_number: 7,
        }
    }

    #[test]
    fn round_trips_send_reliable() {
        let command = Command {
            header: header(CommandKind::SendReliable),
            body: CommandBody::SendReliable {
                data: vec![1, 2, 3, 4, 5],
            },
        };
        let mut buf = Vec::new();
        command.write(&mut buf).unwrap();
        assert_eq!(buf.len(), command.encoded_len());

        let mut cursor = Cursor::new(buf.as_slice());
        let decoded = Command::read(&mut cursor).unwrap();
        assert_eq!(decoded.header.channel_id, 2);
        assert_eq!(decoded.header.reliable_sequence_number, 7);
        match decoded.body {
            CommandBody::SendReliable { data } => assert_eq!(data, vec![1, 2, 3, 4, 5]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn round_trips_datagram_header_with_sent_time() {
        let header = DatagramHeader {
            peer_id: 12,
            session_id: 3,
            sent_time: Some(0xBEEF),
        };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        let (decoded, consumed) = DatagramHeader::read(&buf).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(decoded.peer_id, 12);
        assert_eq!(decoded.session_id, 3);
        assert_eq!(decoded.sent_time, Some(0xBEEF));
    }

    #[test]
    fn rejects_oversized_fragment_count() {
        let mut buf = Vec::new();
        header(CommandKind::SendFragment).write(&mut buf).unwrap();
        buf.write_u16::<BigEndian>(0).unwrap(); // start_sequence_number
        buf.write_u16::<BigEndian>(0).unwrap(); // dataLength
        buf.write_u32::<BigEndian>(MAXIMUM_FRAGMENT_COUNT + 1).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        let mut cursor = Cursor::new(buf.as_slice());
        assert!(Command::read(&mut cursor).is_err());
    }
}
