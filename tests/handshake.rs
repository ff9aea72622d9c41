mod common;

use common::*;

#[test]
fn connect_handshake_delivers_matching_data_both_sides() {
    let (socket_a, socket_b) = loopback_pair();
    let clock = SharedClock::new();
    let mut host_a = new_host(socket_a, clock.clone(), 4);
    let mut host_b = new_host(socket_b, clock, 4);

    let (handle_a, handle_b) = handshake(&mut host_a, &mut host_b, 2, 0xDEADBEEF);

    assert!(host_a.peer(handle_a).is_connected());
    assert!(host_b.peer(handle_b).is_connected());
    assert_eq!(host_a.peer(handle_a).channel_count(), 2);
    assert_eq!(host_b.peer(handle_b).channel_count(), 2);
}

#[test]
fn full_peer_pool_rejects_further_connects() {
    let (socket_a, socket_b) = loopback_pair();
    let clock = SharedClock::new();
    let mut host_a = new_host(socket_a, clock.clone(), 1);
    let mut host_b = new_host(socket_b, clock, 1);

    let (handle_a, _handle_b) = handshake(&mut host_a, &mut host_b, 1, 0);
    assert!(host_a.peer(handle_a).is_connected());

    let addr_b = host_b.local_address().unwrap();
    assert!(host_a.connect(addr_b, 1, 0).is_none());
}
