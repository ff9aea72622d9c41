use std::rc::Rc;

/// Packet flags. Bits mirror the wire-adjacent source, not the wire itself —
/// these never travel over the network, they drive local send-path behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Retransmitted until acknowledged, delivered exactly once, in order.
    pub const RELIABLE: PacketFlags = PacketFlags(1 << 0);
    /// Bit-windowed, out-of-order delivery allowed, never retransmitted.
    pub const UNSEQUENCED: PacketFlags = PacketFlags(1 << 1);
    /// Caller retains ownership of the backing buffer (see [`Packet::new_borrowed`]).
    pub const NO_ALLOCATE: PacketFlags = PacketFlags(1 << 2);
    /// Unreliable, but may be split into fragments when oversized.
    pub const UNRELIABLE_FRAGMENTED: PacketFlags = PacketFlags(1 << 3);
    /// Send triggers an immediate flush rather than waiting for the next service pass.
    pub const INSTANT: PacketFlags = PacketFlags(1 << 4);
    /// Bypasses the packet throttle on unreliable sends.
    pub const UNTHROTTLED: PacketFlags = PacketFlags(1 << 5);
    /// Set by the engine after the packet has been handed to the socket at least once.
    pub const SENT: PacketFlags = PacketFlags(1 << 6);

    pub const NONE: PacketFlags = PacketFlags(0);

    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn union(self, other: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | other.0)
    }

    fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;
    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        self.union(rhs)
    }
}

/// Backing storage for a packet's payload: either owned by the engine, or
/// borrowed from the caller under [`PacketFlags::NO_ALLOCATE`].
///
/// Modeled as the two-variant split suggested for `NO_ALLOCATE`: the engine
/// must not memcpy a borrowed buffer, so `Owned` and `Borrowed` carry
/// different storage, unified behind `as_bytes`.
enum Storage {
    Owned(Box<[u8]>),
    /// Caller-supplied buffer. The `Rc` lets many outgoing fragments and one
    /// reassembly slot share it the same way reference counting shares an
    /// owned buffer; the crate never mutates through it.
    Borrowed(Rc<[u8]>),
}

/// A reference-counted payload buffer.
///
/// A packet may be referenced from many outgoing command fragments and one
/// incoming reassembly slot at once; [`Packet::clone`] bumps the shared
/// count rather than copying bytes, and the backing storage is dropped when
/// the last clone goes away — Rust's ownership model gives us this for
/// free in place of the source's manual `referenceCount`/`enet_packet_destroy`
/// pair, while [`Packet::reference_count`] still exposes the count so the
/// testable property "referenceCount >= 0 always, 0 means unreachable" holds
/// trivially (a dropped `Packet` cannot be observed at all).
#[derive(Clone)]
pub struct Packet {
    storage: Rc<Storage>,
    len: usize,
    flags: PacketFlags,
}

impl Packet {
    pub fn new(data: impl Into<Box<[u8]>>, flags: PacketFlags) -> Packet {
        let data = data.into();
        let len = data.len();
        Packet {
            storage: Rc::new(Storage::Owned(data)),
            len,
            flags,
        }
    }

    /// Build a packet over caller-owned storage. The flags are forced to
    /// include [`PacketFlags::NO_ALLOCATE`] — the engine reads through `data`
    /// but never copies or frees it itself.
    pub fn new_borrowed(data: Rc<[u8]>, flags: PacketFlags) -> Packet {
        let len = data.len();
        Packet {
            storage: Rc::new(Storage::Borrowed(data)),
            len,
            flags: flags.insert_no_allocate(),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &*self.storage {
            Storage::Owned(b) => b,
            Storage::Borrowed(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub(crate) fn mark_sent(&mut self) {
        self.flags.insert(PacketFlags::SENT);
    }

    /// Writes `data` at `offset` into the backing buffer. Used only while a
    /// packet is still exclusively owned by a reassembly slot, before it's
    /// ever cloned out to a dispatched command.
    pub(crate) fn write_fragment(&mut self, offset: usize, data: &[u8]) {
        let storage = Rc::get_mut(&mut self.storage)
            .expect("fragment reassembly buffer must not be shared yet");
        match storage {
            Storage::Owned(buf) => buf[offset..offset + data.len()].copy_from_slice(data),
            Storage::Borrowed(_) => unreachable!("reassembly buffers are always owned"),
        }
    }

    /// Number of live clones of this packet (outgoing fragments + reassembly
    /// slot). Exposed for the reference-count-non-negativity testable
    /// property; this is `Rc::strong_count`, never mutated directly.
    pub fn reference_count(&self) -> usize {
        Rc::strong_count(&self.storage)
    }
}

impl PacketFlags {
    fn insert_no_allocate(mut self) -> PacketFlags {
        self.insert(PacketFlags::NO_ALLOCATE);
        self
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("flags", &self.flags)
            .field("refs", &self.reference_count())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn owned_packet_reports_length_and_flags() {
        let packet = Packet::new(vec![1, 2, 3], PacketFlags::RELIABLE);
        assert_eq!(packet.len(), 3);
        assert!(packet.flags().contains(PacketFlags::RELIABLE));
        assert!(!packet.flags().contains(PacketFlags::UNSEQUENCED));
    }

    #[test]
    fn clone_shares_storage_and_bumps_refcount() {
        let packet = Packet::new(vec![9, 9], PacketFlags::NONE);
        assert_eq!(packet.reference_count(), 1);
        let clone = packet.clone();
        assert_eq!(packet.reference_count(), 2);
        assert_eq!(clone.data(), packet.data());
        drop(clone);
        assert_eq!(packet.reference_count(), 1);
    }

    #[test]
    fn borrowed_packet_forces_no_allocate() {
        let buf: Rc<[u8]> = Rc::from(vec![5u8; 4]);
        let packet = Packet::new_borrowed(buf, PacketFlags::UNRELIABLE_FRAGMENTED);
        assert!(packet.flags().contains(PacketFlags::NO_ALLOCATE));
        assert!(packet.flags().contains(PacketFlags::UNRELIABLE_FRAGMENTED));
    }
}
