//! Tunable limits and defaults for a [`crate::host::Host`] and its peers.

pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 4096;
pub const DEFAULT_MTU: usize = 1280;

pub const MAXIMUM_PACKET_COMMANDS: usize = 32;

pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;

pub const MINIMUM_CHANNEL_COUNT: usize = 1;
pub const MAXIMUM_CHANNEL_COUNT: usize = 255;

pub const MAXIMUM_PEER_ID: u16 = 0xFFF;
pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1 << 20;

pub const HOST_BANDWIDTH_THROTTLE_INTERVAL_MS: u32 = 1000;
pub const HOST_DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
pub const HOST_DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;

pub const PEER_DEFAULT_ROUND_TRIP_TIME: u32 = 1;
pub const PEER_DEFAULT_PACKET_THROTTLE: u32 = 32;
pub const PEER_PACKET_THROTTLE_SCALE: u32 = 32;
pub const PEER_PACKET_THROTTLE_THRESHOLD: u32 = 40;
pub const PEER_PACKET_THROTTLE_COUNTER: u32 = 7;
pub const PEER_PACKET_THROTTLE_ACCELERATION: u32 = 2;
pub const PEER_PACKET_THROTTLE_DECELERATION: u32 = 2;
pub const PEER_PACKET_THROTTLE_INTERVAL_MS: u32 = 5000;
pub const PEER_WINDOW_SIZE_SCALE: u32 = 64 * 1024;

pub const PEER_TIMEOUT_LIMIT: u32 = 32;
pub const PEER_TIMEOUT_MINIMUM_MS: u32 = 5000;
pub const PEER_TIMEOUT_MAXIMUM_MS: u32 = 30000;
pub const PEER_PING_INTERVAL_MS: u32 = 250;

pub const PEER_UNSEQUENCED_WINDOWS: usize = 64;
pub const PEER_UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
pub const PEER_FREE_UNSEQUENCED_WINDOWS: usize = 32;

pub const PEER_RELIABLE_WINDOWS: usize = 16;
pub const PEER_RELIABLE_WINDOW_SIZE: u16 = 0x1000;
pub const PEER_FREE_RELIABLE_WINDOWS: usize = 8;

/// Host-wide limits: how many peers it serves, how many channels each peer
/// may open, and the bandwidth/memory ceilings the send and receive
/// pipelines enforce.
#[derive(Clone, Copy)]
pub struct HostConfig {
    pub peer_count: usize,
    pub channel_limit: usize,
    /// Outgoing bytes/sec budget, 0 means unlimited.
    pub outgoing_bandwidth: u32,
    /// Incoming bytes/sec budget, 0 means unlimited.
    pub incoming_bandwidth: u32,
    pub maximum_packet_size: usize,
    pub maximum_waiting_data: usize,
    pub mtu: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            peer_count: 32,
            channel_limit: MAXIMUM_CHANNEL_COUNT,
            outgoing_bandwidth: 0,
            incoming_bandwidth: 0,
            maximum_packet_size: HOST_DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: HOST_DEFAULT_MAXIMUM_WAITING_DATA,
            mtu: DEFAULT_MTU,
        }
    }
}

impl HostConfig {
    /// Clamps `channel_limit` into `[MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT]`
    /// and `mtu` into `[MIN_MTU, MAX_MTU]`, the way `enet_host_channel_limit`
    /// and the MTU setter sanitize caller-supplied values rather than reject
    /// them outright.
    pub(crate) fn sanitized(mut self) -> HostConfig {
        self.channel_limit = self
            .channel_limit
            .clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT);
        self.mtu = self.mtu.clamp(MIN_MTU, MAX_MTU);
        self
    }
}

/// Packet-loss throttle tuning for a single peer, mirroring
/// `enet_peer_throttle_configure`'s three knobs.
#[derive(Clone, Copy)]
pub struct PeerThrottleConfig {
    pub interval_ms: u32,
    pub acceleration: u32,
    pub deceleration: u32,
}

impl Default for PeerThrottleConfig {
    fn default() -> Self {
        PeerThrottleConfig {
            interval_ms: PEER_PACKET_THROTTLE_INTERVAL_MS,
            acceleration: PEER_PACKET_THROTTLE_ACCELERATION,
            deceleration: PEER_PACKET_THROTTLE_DECELERATION,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_config_sanitizes_out_of_range_values() {
        let config = HostConfig {
            channel_limit: 0,
            mtu: 10,
            ..HostConfig::default()
        }
        .sanitized();
        assert_eq!(config.channel_limit, MINIMUM_CHANNEL_COUNT);
        assert_eq!(config.mtu, MIN_MTU);

        let config = HostConfig {
            channel_limit: 1000,
            mtu: 100_000,
            ..HostConfig::default()
        }
        .sanitized();
        assert_eq!(config.channel_limit, MAXIMUM_CHANNEL_COUNT);
        assert_eq!(config.mtu, MAX_MTU);
    }
}
