mod common;

use common::*;
use relay_transport::{Event, Packet, PacketFlags};

#[test]
fn large_reliable_packet_is_fragmented_and_reassembled() {
    let (socket_a, socket_b) = loopback_pair();
    let clock = SharedClock::new();
    let mut host_a = new_host(socket_a, clock.clone(), 4);
    let mut host_b = new_host(socket_b, clock.clone(), 4);

    let (handle_a, _handle_b) = handshake(&mut host_a, &mut host_b, 2, 0);

    let payload: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
    host_a
        .peer_mut(handle_a)
        .send(0, Packet::new(payload.clone(), PacketFlags::RELIABLE))
        .expect("queued for send");

    let mut received = None;
    for _ in 0..500 {
        for _ in drain(&mut host_a) {}
        for event in drain(&mut host_b) {
            if let Event::Receive { channel_id, packet, .. } = event {
                assert_eq!(channel_id, 0);
                received = Some(packet.data().to_vec());
            }
        }
        if received.is_some() {
            break;
        }
        clock.advance(1);
    }

    assert_eq!(received.expect("packet was never received"), payload);
}
