//! End-to-end scenarios straight out of the protocol's testable-properties
//! list: packet decode edge cases and a loopback ingest liveness check.
use std::net::UdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spead_rx::{Heap, ItemPointer, Packet, Receiver, ReceiverConfig, ReceiverState};

#[test]
fn minimal_valid_packet() {
    let header = [0x53, 0x04, 0x05, 0x03, 0x00, 0x00, 0x00, 0x00];
    let mut pkt = Packet::new();
    let n = pkt.unpack(&header).unwrap();
    assert_eq!(n, 8);
    assert_eq!(pkt.items().len(), 0);
    assert_eq!(pkt.heap_cnt(), -1);
    assert!(!pkt.is_stream_ctrl_term());
}

#[test]
fn immediate_item_sets_heap_cnt() {
    let mut data = vec![0x53, 0x04, 0x05, 0x03, 0x00, 0x00, 0x00, 0x01];
    data.extend_from_slice(&[0x80, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x07]);
    let mut pkt = Packet::new();
    pkt.unpack(&data).unwrap();
    assert_eq!(pkt.heap_cnt(), 7);
}

#[test]
fn stream_term_sets_flag() {
    let mut data = vec![0x53, 0x04, 0x05, 0x03, 0x00, 0x00, 0x00, 0x01];
    data.extend_from_slice(&[0x80, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x02]);
    let mut pkt = Packet::new();
    pkt.unpack(&data).unwrap();
    assert!(pkt.is_stream_ctrl_term());
}

fn packet_for_heap(heap_cnt: i64, payload_off: i64, payload_len: i64, heap_len: Option<i64>, direct_item: Option<(u64, i64)>, payload: Vec<u8>) -> Packet {
    let mut items = vec![
        ItemPointer { immediate: true, id: spead_rx::HEAP_CNT_ID, address: heap_cnt as u64 },
        ItemPointer { immediate: true, id: spead_rx::PAYLOAD_OFF_ID, address: payload_off as u64 },
        ItemPointer { immediate: true, id: spead_rx::PAYLOAD_LEN_ID, address: payload_len as u64 },
    ];
    if let Some(hl) = heap_len {
        items.push(ItemPointer { immediate: true, id: spead_rx::HEAP_LEN_ID, address: hl as u64 });
    }
    if let Some((id, addr)) = direct_item {
        items.push(ItemPointer { immediate: false, id, address: addr as u64 });
    }
    Packet::from_parts(items, payload)
}

#[test]
fn two_packet_heap_finalizes_valid() {
    let a = packet_for_heap(9, 0, 16, Some(32), Some((0x10, 0)), (0x00..0x10).collect());
    let b = packet_for_heap(9, 16, 16, None, None, (0x10..0x20).collect());

    let mut heap = Heap::new();
    heap.add_packet(a).unwrap();
    let complete = heap.add_packet(b).unwrap();
    assert_eq!(complete, Some(true));

    heap.finalize().unwrap();
    assert!(heap.is_valid());
    let items = heap.get_items().unwrap();
    let item = items.get(&0x10).unwrap().first().unwrap();
    assert!(item.is_valid);
    let expected: Vec<u8> = (0x00..0x20).collect();
    assert_eq!(item.value, expected);
}

#[test]
fn missing_middle_packet_invalidates_item() {
    let a = packet_for_heap(9, 0, 16, Some(32), Some((0x10, 0)), (0x00..0x10).collect());

    let mut heap = Heap::new();
    heap.add_packet(a).unwrap();
    heap.finalize().unwrap();

    assert!(!heap.is_valid());
    let items = heap.get_items().unwrap();
    let item = items.get(&0x10).unwrap().first().unwrap();
    assert!(!item.is_valid);
    assert_eq!(&item.value[16..32], &[0u8; 16]);
}

#[test]
fn mismatched_heap_cnt_rejected() {
    let a = packet_for_heap(9, 0, 16, Some(32), None, vec![0u8; 16]);
    let b = packet_for_heap(10, 16, 16, None, None, vec![0u8; 16]);

    let mut heap = Heap::new();
    heap.add_packet(a).unwrap();
    let err = heap.add_packet(b).unwrap_err();
    assert!(matches!(err, spead_rx::Error::HeapCountMismatch));
}

#[test]
fn round_trip_pack_unpack_byte_for_byte() {
    let items = vec![
        ItemPointer { immediate: true, id: spead_rx::HEAP_CNT_ID, address: 3 },
        ItemPointer { immediate: true, id: spead_rx::PAYLOAD_OFF_ID, address: 0 },
        ItemPointer { immediate: true, id: spead_rx::PAYLOAD_LEN_ID, address: 3 },
    ];
    let original = Packet::from_parts(items, vec![0xAA, 0xBB, 0xCC]);
    let bytes = original.pack().unwrap();

    let mut roundtripped = Packet::new();
    roundtripped.unpack(&bytes).unwrap();
    let rebytes = roundtripped.pack().unwrap();
    assert_eq!(bytes, rebytes);
}

#[test]
fn loopback_pipeline_liveness_and_fifo() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let order_cb = Arc::clone(&order);
    let count = Arc::new(AtomicUsize::new(0));
    let count_cb = Arc::clone(&count);

    let mut receiver = Receiver::new();
    receiver.set_callback(move |pkt| {
        order_cb.lock().unwrap().push(pkt.heap_cnt());
        count_cb.fetch_add(1, Ordering::SeqCst);
        0
    });

    // A fixed, unusual high port rather than 0, since Receiver has no
    // accessor for an OS-assigned ephemeral port and the sender below
    // needs a known destination.
    let cfg = ReceiverConfig { port: 17148, ..ReceiverConfig::default() };
    receiver.start(&cfg).unwrap();
    assert_eq!(receiver.state(), ReceiverState::Running);

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for i in 0..3i64 {
        let mut data = vec![0x53, 0x04, 0x05, 0x03, 0x00, 0x00, 0x00, 0x01];
        let word: u64 =
            (spead_rx::IMMEDIATEADDR as u64) << 63 | (spead_rx::HEAP_CNT_ID << 40) | (i as u64);
        data.extend_from_slice(&word.to_be_bytes());
        sender.send_to(&data, "127.0.0.1:17148").unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if count.load(Ordering::SeqCst) == 3 || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let stop_started = Instant::now();
    receiver.stop().unwrap();
    assert!(stop_started.elapsed() < Duration::from_millis(500));

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}
