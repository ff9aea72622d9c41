mod common;

use common::*;
use relay_transport::{Event, Packet, PacketFlags};

#[test]
fn dropped_first_transmission_is_retransmitted_and_delivered() {
    let (socket_a, socket_b) = loopback_pair();
    let drop_ctl = socket_a.control();
    let clock = SharedClock::new();
    let mut host_a = new_host(socket_a, clock.clone(), 4);
    let mut host_b = new_host(socket_b, clock.clone(), 4);

    let (handle_a, _handle_b) = handshake(&mut host_a, &mut host_b, 1, 0);

    let payload = vec![0x42u8; 2048];
    host_a
        .peer_mut(handle_a)
        .send(0, Packet::new(payload.clone(), PacketFlags::RELIABLE))
        .expect("queued for send");

    // Lose the datagrams carrying the first attempt at every fragment of
    // this send (a 2KiB reliable payload splits across a couple of
    // SEND_FRAGMENT commands, each its own datagram).
    drop_ctl.drop_next_sends(4);

    let mut received = None;
    for _ in 0..2000 {
        for _ in drain(&mut host_a) {}
        for event in drain(&mut host_b) {
            if let Event::Receive { packet, .. } = event {
                received = Some(packet.data().to_vec());
            }
        }
        if received.is_some() {
            break;
        }
        clock.advance(50);
    }

    assert_eq!(
        received.expect("packet never arrived after retransmission"),
        payload
    );
    assert!(
        host_a.peer(handle_a).packets_lost() > 0,
        "the dropped transmission should have been recorded as loss"
    );
}
