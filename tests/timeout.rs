mod common;

use common::*;
use relay_transport::Event;

#[test]
fn unresponsive_peer_triggers_disconnect_timeout() {
    let (socket_a, socket_b) = loopback_pair();
    let clock = SharedClock::new();
    let mut host_a = new_host(socket_a, clock.clone(), 4);
    let mut host_b = new_host(socket_b, clock.clone(), 4);

    let (handle_a, _handle_b) = handshake(&mut host_a, &mut host_b, 1, 0);
    assert!(host_a.peer(handle_a).is_connected());

    // host_b goes silent from here on; host_a keeps servicing alone.
    for _ in drain(&mut host_a) {}

    // Past the idle-ping interval: host_a queues and sends a reliable
    // PING that will never be acknowledged.
    clock.advance(300);
    for _ in drain(&mut host_a) {}

    // Past the maximum timeout since that ping was sent.
    clock.advance(31_000);
    let events = drain(&mut host_a);

    let timed_out = events
        .iter()
        .any(|event| matches!(event, Event::DisconnectTimeout { peer } if *peer == handle_a));
    assert!(timed_out, "expected a DisconnectTimeout after sustained silence");
}
