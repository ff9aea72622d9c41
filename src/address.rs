use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// A 128-bit address with an IPv4-mapped form, plus a port.
///
/// Mirrors the wire representation: a plain IPv6 address, where an IPv4
/// peer is carried as `::ffff:a.b.c.d` (10 zero bytes, `0xFFFF`, the 32-bit
/// v4 address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    ip: Ipv6Addr,
    pub port: u16,
}

impl Address {
    pub fn from_ipv4(ip: Ipv4Addr, port: u16) -> Address {
        Address {
            ip: ip.to_ipv6_mapped(),
            port,
        }
    }

    pub fn from_ipv6(ip: Ipv6Addr, port: u16) -> Address {
        Address { ip, port }
    }

    pub fn is_ipv4_mapped(&self) -> bool {
        self.ip.to_ipv4_mapped().is_some()
    }

    pub fn to_ipv4(&self) -> Option<Ipv4Addr> {
        self.ip.to_ipv4_mapped()
    }

    pub fn ip(&self) -> Ipv6Addr {
        self.ip
    }

    /// True if this is the IPv4 limited-broadcast address `255.255.255.255`,
    /// the one exception the receive pipeline makes when matching a
    /// datagram's source address against a resolved peer's address.
    pub(crate) fn is_ipv4_broadcast(&self) -> bool {
        self.to_ipv4() == Some(Ipv4Addr::BROADCAST)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        match addr {
            SocketAddr::V4(a) => Address::from_ipv4(*a.ip(), a.port()),
            SocketAddr::V6(a) => Address::from_ipv6(*a.ip(), a.port()),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> SocketAddr {
        match addr.to_ipv4() {
            Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, addr.port)),
            None => SocketAddr::V6(SocketAddrV6::new(addr.ip, addr.port, 0, 0)),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_ipv4() {
            Some(v4) => write!(f, "{}:{}", v4, self.port),
            None => write!(f, "[{}]:{}", self.ip, self.port),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ipv4_mapped_round_trips() {
        let addr = Address::from_ipv4(Ipv4Addr::new(127, 0, 0, 1), 4000);
        assert!(addr.is_ipv4_mapped());
        assert_eq!(addr.to_ipv4(), Some(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(addr.port, 4000);
    }

    #[test]
    fn broadcast_detected() {
        let addr = Address::from_ipv4(Ipv4Addr::BROADCAST, 0);
        assert!(addr.is_ipv4_broadcast());
        let addr = Address::from_ipv4(Ipv4Addr::new(10, 0, 0, 1), 0);
        assert!(!addr.is_ipv4_broadcast());
    }
}
