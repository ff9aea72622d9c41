mod common;

use common::*;
use relay_transport::{Event, Packet, PacketFlags};

#[test]
fn duplicate_unsequenced_datagram_is_not_delivered_twice() {
    let (socket_a, socket_b) = loopback_pair();
    let dup_ctl = socket_a.control();
    let clock = SharedClock::new();
    let mut host_a = new_host(socket_a, clock.clone(), 4);
    let mut host_b = new_host(socket_b, clock, 4);

    let (handle_a, _handle_b) = handshake(&mut host_a, &mut host_b, 1, 0);

    host_a
        .peer_mut(handle_a)
        .send(0, Packet::new(b"ping".to_vec(), PacketFlags::UNSEQUENCED))
        .expect("queued for send");

    // Let host_a's service() push the one datagram carrying this send,
    // then duplicate it before host_b ever reads it, so the same
    // unsequenced group arrives on the wire twice.
    for _ in drain(&mut host_a) {}
    dup_ctl.duplicate_last_sent();

    let mut received = Vec::new();
    for _ in 0..10 {
        for event in drain(&mut host_b) {
            if let Event::Receive { packet, .. } = event {
                received.push(packet.data().to_vec());
            }
        }
    }

    assert_eq!(
        received,
        vec![b"ping".to_vec()],
        "a replayed unsequenced datagram must be discarded, not delivered twice"
    );
}
