//! Data plane: packetization round trips, ordering recovery, gap flushes,
//! and delivery over real sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use fathom_core::config::TargetSpeed;
use fathom_core::message::{monotonic_micros, DataMessage};
use fathom_core::wire::{encode_packet, message_parts, PACKET_MAX_SIZE};
use fathom_net::queue::{PacketQueue, Pick, QueuedPacket};
use fathom_net::reassembly::Reassembler;
use fathom_net::SonarClient;

use crate::infra::{client_config, start_server, wait_until};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

fn message(id: u32, time: i64, len: usize) -> DataMessage {
    DataMessage { time, id, type_tag: 4, rate: 240_000.0, data: Bytes::from(payload(len)) }
}

fn packets_of(msg: &DataMessage, first_index: u32) -> Vec<Vec<u8>> {
    message_parts(msg.data.len())
        .enumerate()
        .map(|(i, (offset, part))| {
            let mut buf = vec![0u8; PACKET_MAX_SIZE];
            let n = encode_packet(&mut buf, first_index + i as u32, msg, offset, part);
            buf.truncate(n);
            buf
        })
        .collect()
}

fn queued(packet: &[u8], index: u32) -> QueuedPacket {
    let mut slab = vec![0u8; PACKET_MAX_SIZE].into_boxed_slice();
    slab[..packet.len()].copy_from_slice(packet);
    QueuedPacket { slab, len: packet.len(), index }
}

/// Drain the queue through the reassembler the way the emitter does,
/// collecting emissions. Stops when the policy says wait or empty.
fn drain(
    queue: &PacketQueue,
    reasm: &mut Reassembler,
    wait_threshold: usize,
    emitted: &mut Vec<(u32, i64, Vec<u8>)>,
) {
    loop {
        match queue.pick(reasm.next_index(), wait_threshold) {
            Pick::InOrder(p) | Pick::Skipped(p) => {
                reasm.process(&p.slab[..p.len], &mut |m| {
                    emitted.push((m.id, m.time, m.data.to_vec()));
                });
            }
            Pick::Wait | Pick::Empty => return,
        }
    }
}

#[tokio::test]
async fn slicing_and_in_order_reassembly_round_trips_many_sizes() {
    for size in [0usize, 1, 4_096, 31_999, 32_000, 32_001, 64_000, 70_000] {
        let msg = message(9, 50_000, size);
        let packets = packets_of(&msg, 0);
        assert_eq!(packets.len(), size.div_ceil(32_000));

        let mut reasm = Reassembler::new();
        let mut emitted: Vec<(u32, i64, Vec<u8>)> = Vec::new();
        for packet in &packets {
            reasm.process(packet, &mut |m| emitted.push((m.id, m.time, m.data.to_vec())));
        }

        if size == 0 {
            assert!(emitted.is_empty(), "empty messages produce no packets");
        } else {
            assert_eq!(emitted.len(), 1, "size {size}");
            assert_eq!(emitted[0].0, 9);
            assert_eq!(emitted[0].1, 50_000);
            assert_eq!(emitted[0].2.as_slice(), &msg.data[..], "size {size}");
        }
    }
}

#[tokio::test]
async fn out_of_order_arrival_is_reordered_before_reassembly() {
    // One 70 000-byte message as three packets, delivered 2, 0, 1.
    let msg = message(1, 7_000, 70_000);
    let packets = packets_of(&msg, 0);

    let queue = PacketQueue::new();
    for i in [2usize, 0, 1] {
        queue.push(queued(&packets[i], i as u32));
    }

    let mut reasm = Reassembler::new();
    let mut emitted = Vec::new();
    drain(&queue, &mut reasm, 64, &mut emitted);

    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].2.as_slice(), &msg.data[..]);
    assert!(queue.is_empty());
    assert_eq!(reasm.next_index(), 3);
}

#[tokio::test(start_paused = true)]
async fn a_lost_middle_packet_flushes_the_partial_after_a_second() {
    let msg = message(1, 7_000, 70_000);
    let packets = packets_of(&msg, 0);

    let queue = PacketQueue::new();
    queue.push(queued(&packets[0], 0));
    queue.push(queued(&packets[2], 2));

    let mut reasm = Reassembler::new();
    let mut emitted = Vec::new();

    // Packet 0 processes; packet 2 makes the policy wait for index 1.
    drain(&queue, &mut reasm, 64, &mut emitted);
    assert!(emitted.is_empty());
    assert_eq!(queue.len(), 1);

    tokio::time::advance(Duration::from_millis(1_100)).await;
    reasm.flush_expired(&mut |m| emitted.push((m.id, m.time, m.data.to_vec())));

    assert_eq!(emitted.len(), 1);
    let (_, time, data) = &emitted[0];
    assert_eq!(*time, 7_000);
    assert_eq!(data.len(), 70_000);
    assert_eq!(&data[..32_000], &msg.data[..32_000]);
    assert!(data[32_000..].iter().all(|&b| b == 0), "unreceived range must stay zeroed");
}

#[tokio::test]
async fn occupancy_pressure_skips_the_gap_and_later_messages_flow() {
    // Two messages on one stream; the second packet of the first message is
    // withheld entirely.
    let first = message(1, 1_000, 64_000); // packets 0, 1
    let second = message(1, 2_000, 64_000); // packets 2, 3

    let first_packets = packets_of(&first, 0);
    let second_packets = packets_of(&second, 2);

    let queue = PacketQueue::new();
    queue.push(queued(&first_packets[0], 0));
    queue.push(queued(&second_packets[0], 2));
    queue.push(queued(&second_packets[1], 3));

    let mut reasm = Reassembler::new();
    let mut emitted = Vec::new();
    // Threshold 1: any occupancy forces reselection instead of waiting.
    drain(&queue, &mut reasm, 1, &mut emitted);

    // The new time on packet 2 flushed the partial first message, then the
    // second message completed.
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0].1, 1_000);
    assert_eq!(&emitted[0].2[..32_000], &first.data[..32_000]);
    assert!(emitted[0].2[32_000..].iter().all(|&b| b == 0));
    assert_eq!(emitted[1].1, 2_000);
    assert_eq!(emitted[1].2.as_slice(), &second.data[..]);
    assert_eq!(reasm.next_index(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_stream_end_to_end_to_the_master() {
    let server = start_server(TargetSpeed::Local).await;
    let client = SonarClient::connect(&client_config(&server)).await.expect("connect");

    let received: Arc<Mutex<Vec<(u32, i64, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        client.subscribe(move |m| {
            received.lock().unwrap().push((m.id, m.time, m.data.to_vec()));
        });
    }

    assert!(client.set_master().await);

    let first = message(3, monotonic_micros(), 70_000);
    server.send_data(&first).await;
    let second = message(3, monotonic_micros(), 1_024);
    server.send_data(&second).await;

    assert!(
        wait_until(Duration::from_secs(3), || received.lock().unwrap().len() >= 2).await,
        "messages did not arrive"
    );

    let received = received.lock().unwrap().clone();
    assert_eq!(received[0].0, 3);
    assert_eq!(received[0].2.as_slice(), &first.data[..]);
    assert_eq!(received[1].2.as_slice(), &second.data[..]);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn clients_without_the_master_role_receive_nothing() {
    let server = start_server(TargetSpeed::Local).await;
    let config = client_config(&server);

    let master = SonarClient::connect(&config).await.expect("master connect");
    let bystander = SonarClient::connect(&config).await.expect("bystander connect");

    let master_got = Arc::new(Mutex::new(0usize));
    let bystander_got = Arc::new(Mutex::new(0usize));
    {
        let count = master_got.clone();
        master.subscribe(move |_| *count.lock().unwrap() += 1);
        let count = bystander_got.clone();
        bystander.subscribe(move |_| *count.lock().unwrap() += 1);
    }

    assert!(master.set_master().await);
    server.send_data(&message(1, monotonic_micros(), 2_048)).await;

    assert!(
        wait_until(Duration::from_secs(3), || *master_got.lock().unwrap() >= 1).await,
        "master never received data"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*bystander_got.lock().unwrap(), 0);

    master.shutdown().await;
    bystander.shutdown().await;
    server.shutdown().await;
}
