mod common;

use common::*;
use relay_transport::{Event, Packet, PacketFlags};

/// Larger than `PEER_RELIABLE_WINDOW_SIZE` (0x1000), so this run crosses a
/// full reliable-window's worth of unacknowledged sequence numbers.
const SEND_COUNT: usize = 0x1100;

#[test]
fn high_volume_reliable_sequence_is_delivered_in_order() {
    let (socket_a, socket_b) = loopback_pair();
    let clock = SharedClock::new();
    let mut host_a = new_host(socket_a, clock.clone(), 2);
    let mut host_b = new_host(socket_b, clock.clone(), 2);

    let (handle_a, _handle_b) = handshake(&mut host_a, &mut host_b, 1, 0);

    for i in 0..SEND_COUNT {
        host_a
            .peer_mut(handle_a)
            .send(0, Packet::new(vec![(i % 256) as u8], PacketFlags::RELIABLE))
            .expect("queued for send");
    }

    let mut received = Vec::new();
    for _ in 0..(SEND_COUNT * 4) {
        for _ in drain(&mut host_a) {}
        for event in drain(&mut host_b) {
            if let Event::Receive { packet, .. } = event {
                received.push(packet.data()[0]);
            }
        }
        if received.len() == SEND_COUNT {
            break;
        }
        clock.advance(1);
    }

    assert_eq!(received.len(), SEND_COUNT, "not every send was delivered");
    let expected: Vec<u8> = (0..SEND_COUNT).map(|i| (i % 256) as u8).collect();
    assert_eq!(
        received, expected,
        "sends must be delivered in order even across a run larger than one reliable window"
    );
}
