/*! Heap assembler: aggregates the packets belonging to one SPEAD heap,
keeps them ordered by payload offset, and finalizes them into an item
dictionary once the heap is judged complete (or abandoned).
*/
use std::collections::HashMap;

use crate::packet::{ItemPointer, Packet};
use crate::{Error, Result};

/// Whether a heap's `heap_len` came from an explicit `HEAP_LEN` item or
/// was inferred from the last packet's extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapLenSource {
    /// An explicit `HEAP_LEN` item was observed.
    Explicit,
    /// No `HEAP_LEN` item was observed; `last.payload_off + last.payload_len`
    /// was used as a fallback estimate.
    Inferred,
}

/// One assembled item: its protocol id, whether every byte of its value
/// was actually covered by a received packet, and the value bytes
/// themselves (zero-filled wherever coverage was missing).
#[derive(Debug, Clone)]
pub struct Item {
    /// Protocol item id.
    pub id: u64,
    /// `false` if any byte of this item's value could not be located in
    /// a received packet (missing data is zero-filled).
    pub is_valid: bool,
    /// Value bytes.
    pub value: Vec<u8>,
}

/// Multiple instances of the same item id collapse into a list, mirroring
/// the descriptor id's "appears as a list" rule in the reserved-item
/// table — applied uniformly to any repeated id, not just the descriptor.
#[derive(Debug, Clone, Default)]
pub struct ItemValues(pub Vec<Item>);

impl ItemValues {
    /// Single-item convenience accessor (first value, if any).
    pub fn first(&self) -> Option<&Item> {
        self.0.first()
    }
}

/// A heap under assembly: an ordered run of packets sharing a heap
/// counter, plus the item list materialized by [`Heap::finalize`].
#[derive(Debug, Default)]
pub struct Heap {
    heap_cnt: i64,
    heap_len: i64,
    heap_len_source: Option<HeapLenSource>,
    packets: Vec<Packet>,
    items: Option<Vec<Item>>,
    got_all_cache: Option<bool>,
    is_valid: bool,
}

impl Heap {
    /// A fresh, empty heap.
    pub fn new() -> Self {
        Self {
            heap_cnt: -1,
            heap_len: -1,
            ..Default::default()
        }
    }

    /// Heap counter (`-1` if no packet has been added yet).
    pub fn heap_cnt(&self) -> i64 {
        self.heap_cnt
    }

    /// Declared or inferred heap length (`-1` if still unknown).
    pub fn heap_len(&self) -> i64 {
        self.heap_len
    }

    /// How `heap_len` was determined, once known.
    pub fn heap_len_source(&self) -> Option<HeapLenSource> {
        self.heap_len_source
    }

    /// Number of packets currently held.
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Insert a decoded packet into this heap, ordered by `payload_off`.
    pub fn add_packet(&mut self, pkt: Packet) -> Result<Option<bool>> {
        if !pkt.is_decoded() {
            return Err(Error::WrongFormat);
        }
        if self.packets.is_empty() {
            self.heap_cnt = pkt.heap_cnt();
        } else if pkt.heap_cnt() != self.heap_cnt {
            return Err(Error::HeapCountMismatch);
        }
        if pkt.heap_len() >= 0 {
            self.heap_len = pkt.heap_len();
            self.heap_len_source = Some(HeapLenSource::Explicit);
        }
        // Insert after the last packet with the same or smaller
        // payload_off, so ties land after the existing one (spec: "ties
        // ... accepted and placed after the existing packet at that
        // offset").
        let pos = self
            .packets
            .partition_point(|p| p.payload_off() <= pkt.payload_off());
        self.packets.insert(pos, pkt);
        self.got_all_cache = None;
        self.items = None;
        Ok(self.got_all_packets())
    }

    /// Whether the received packets' payload intervals exactly tile
    /// `[0, heap_len)`. Returns `None` if `heap_len` is still unknown.
    pub fn got_all_packets(&mut self) -> Option<bool> {
        if let Some(cached) = self.got_all_cache {
            return Some(cached);
        }
        if self.heap_len < 0 {
            return None;
        }
        let mut expect = 0i64;
        for p in &self.packets {
            if p.payload_off() != expect {
                self.got_all_cache = Some(false);
                return Some(false);
            }
            expect += p.payload_len();
        }
        let complete = expect == self.heap_len;
        self.got_all_cache = Some(complete);
        Some(complete)
    }

    /// `true` once [`Heap::finalize`] has run.
    pub fn is_finalized(&self) -> bool {
        self.items.is_some()
    }

    /// Overall validity; only meaningful after [`Heap::finalize`].
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn infer_heap_len_if_needed(&mut self) {
        if self.heap_len < 0 {
            if let Some(last) = self.packets.last() {
                self.heap_len = last.payload_off() + last.payload_len();
                self.heap_len_source = Some(HeapLenSource::Inferred);
            } else {
                self.heap_len = 0;
                self.heap_len_source = Some(HeapLenSource::Inferred);
            }
        }
    }

    /// Materialize the item list from the packets held so far.
    pub fn finalize(&mut self) -> Result<()> {
        self.infer_heap_len_if_needed();
        let heap_len = self.heap_len;

        // Flatten (pointer, byte offset of packet start in heap) pairs in
        // traversal order, tagging which are direct-mode, to find each
        // direct item's "next direct pointer" per the spec's tie-break
        // (scan starts at the following pointer in the current packet and
        // walks forward across subsequent packets).
        struct Entry {
            item: ItemPointer,
            packet_idx: usize,
        }
        let mut entries: Vec<Entry> = Vec::new();
        for (pi, pkt) in self.packets.iter().enumerate() {
            for item in pkt.items() {
                if matches!(
                    item.id,
                    crate::HEAP_CNT_ID
                        | crate::HEAP_LEN_ID
                        | crate::PAYLOAD_OFF_ID
                        | crate::PAYLOAD_LEN_ID
                        | crate::STREAM_CTRL_ID
                ) {
                    continue;
                }
                entries.push(Entry { item: *item, packet_idx: pi });
            }
        }

        let mut items = Vec::with_capacity(entries.len());
        let mut all_valid = true;

        for (i, e) in entries.iter().enumerate() {
            if e.item.immediate {
                let value = (e.item.address & 0x0000_00FF_FFFF_FFFF)
                    .to_be_bytes()[3..]
                    .to_vec();
                items.push(Item { id: e.item.id, is_valid: true, value });
                continue;
            }
            let start = e.item.address as i64;
            let next_direct_addr = entries[i + 1..]
                .iter()
                .find(|e2| !e2.item.immediate)
                .map(|e2| e2.item.address as i64);
            let end = next_direct_addr.unwrap_or(heap_len);
            let length = end - start;
            if length < 0 {
                items.push(Item { id: e.item.id, is_valid: false, value: Vec::new() });
                all_valid = false;
                continue;
            }
            let length = length as usize;
            let mut value = vec![0u8; length];
            let mut valid = true;
            for (o, slot) in value.iter_mut().enumerate() {
                let abs = start + o as i64;
                if let Some(byte) = self.byte_at(abs, e.packet_idx) {
                    *slot = byte;
                } else {
                    valid = false;
                }
            }
            if !valid {
                all_valid = false;
            }
            items.push(Item { id: e.item.id, is_valid: valid, value });
        }

        self.is_valid = all_valid;
        self.items = Some(items);
        log::info!(
            "heap {} finalized: {} items, valid={}, heap_len={} ({:?})",
            self.heap_cnt,
            self.items.as_ref().map(Vec::len).unwrap_or(0),
            self.is_valid,
            self.heap_len,
            self.heap_len_source,
        );
        Ok(())
    }

    /// Locate the payload byte at absolute heap offset `abs`, walking
    /// forward from `from_idx` (the spec's "walk forward from the
    /// current head" search).
    fn byte_at(&self, abs: i64, from_idx: usize) -> Option<u8> {
        for p in &self.packets[from_idx.min(self.packets.len())..] {
            let off = p.payload_off();
            let len = p.payload_len();
            if abs >= off && abs < off + len {
                return p.payload().get((abs - off) as usize).copied();
            }
        }
        // Packets are ordered by payload_off but a covering packet might
        // sit earlier than `from_idx` if a duplicate/out-of-order insert
        // placed later-arriving data before it; fall back to a full scan.
        for p in &self.packets {
            let off = p.payload_off();
            let len = p.payload_len();
            if abs >= off && abs < off + len {
                return p.payload().get((abs - off) as usize).copied();
            }
        }
        None
    }

    /// Item dictionary, grouped by id (the descriptor id and any other
    /// repeated id both collapse into a multi-valued list). Returns
    /// `NotFinalized` if [`Heap::finalize`] has not run.
    pub fn get_items(&self) -> Result<HashMap<u64, ItemValues>> {
        let items = self.items.as_ref().ok_or(Error::NotFinalized)?;
        let mut map: HashMap<u64, ItemValues> = HashMap::new();
        for item in items {
            map.entry(item.id).or_default().0.push(item.clone());
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ItemPointer, Packet};

    fn pkt_with(heap_cnt: i64, payload_off: i64, payload_len: i64, payload: Vec<u8>) -> Packet {
        let items = vec![
            ItemPointer { immediate: true, id: crate::HEAP_CNT_ID, address: heap_cnt as u64 },
            ItemPointer { immediate: true, id: crate::PAYLOAD_OFF_ID, address: payload_off as u64 },
            ItemPointer { immediate: true, id: crate::PAYLOAD_LEN_ID, address: payload_len as u64 },
        ];
        Packet::from_parts(items, payload)
    }

    #[test]
    fn rejects_undecoded_packet() {
        let mut heap = Heap::new();
        assert!(matches!(heap.add_packet(Packet::new()), Err(Error::WrongFormat)));
    }

    #[test]
    fn mismatched_heap_cnt_rejected() {
        let mut heap = Heap::new();
        heap.add_packet(pkt_with(9, 0, 16, vec![0u8; 16])).unwrap();
        let b = pkt_with(10, 16, 16, vec![0u8; 16]);
        assert!(matches!(heap.add_packet(b), Err(Error::HeapCountMismatch)));
    }

    #[test]
    fn insertion_ordered_by_payload_off() {
        let mut heap = Heap::new();
        heap.add_packet(pkt_with(1, 16, 8, vec![2u8; 8])).unwrap();
        heap.add_packet(pkt_with(1, 0, 8, vec![1u8; 8])).unwrap();
        assert_eq!(heap.packets[0].payload_off(), 0);
        assert_eq!(heap.packets[1].payload_off(), 16);
    }

    #[test]
    fn duplicate_payload_off_placed_after_existing() {
        let mut heap = Heap::new();
        heap.add_packet(pkt_with(1, 0, 8, vec![1u8; 8])).unwrap();
        heap.add_packet(pkt_with(1, 0, 8, vec![9u8; 8])).unwrap();
        assert_eq!(heap.packets.len(), 2);
        assert_eq!(heap.packets[0].payload(), &[1u8; 8]);
        assert_eq!(heap.packets[1].payload(), &[9u8; 8]);
    }

    #[test]
    fn got_all_packets_unknown_until_heap_len_known() {
        let mut heap = Heap::new();
        let mut pkt = pkt_with(1, 0, 8, vec![0u8; 8]);
        // Strip the explicit heap_len item effect by not adding one; this
        // packet never carries HEAP_LEN so got_all_packets should be None.
        pkt.payload();
        assert_eq!(heap.add_packet(pkt).unwrap(), None);
    }

    #[test]
    fn two_packet_heap_finalizes_with_direct_item() {
        let mut heap = Heap::new();
        let mut data_a: Vec<u8> = (0x00..0x10).collect();
        let mut data_b: Vec<u8> = (0x10..0x20).collect();

        let mut items_a = vec![
            ItemPointer { immediate: true, id: crate::HEAP_CNT_ID, address: 9 },
            ItemPointer { immediate: true, id: crate::PAYLOAD_OFF_ID, address: 0 },
            ItemPointer { immediate: true, id: crate::PAYLOAD_LEN_ID, address: 16 },
            ItemPointer { immediate: true, id: crate::HEAP_LEN_ID, address: 32 },
            ItemPointer { immediate: false, id: 0x10, address: 0 },
        ];
        let pkt_a = Packet::from_parts(std::mem::take(&mut items_a), std::mem::take(&mut data_a));

        let items_b = vec![
            ItemPointer { immediate: true, id: crate::HEAP_CNT_ID, address: 9 },
            ItemPointer { immediate: true, id: crate::PAYLOAD_OFF_ID, address: 16 },
            ItemPointer { immediate: true, id: crate::PAYLOAD_LEN_ID, address: 16 },
        ];
        let pkt_b = Packet::from_parts(items_b, std::mem::take(&mut data_b));

        heap.add_packet(pkt_a).unwrap();
        let all = heap.add_packet(pkt_b).unwrap();
        assert_eq!(all, Some(true));

        heap.finalize().unwrap();
        assert!(heap.is_valid());
        let map = heap.get_items().unwrap();
        let item = map.get(&0x10).unwrap().first().unwrap();
        assert!(item.is_valid);
        let expected: Vec<u8> = (0x00..0x20).collect();
        assert_eq!(item.value, expected);
    }

    #[test]
    fn missing_middle_packet_marks_item_invalid() {
        let mut heap = Heap::new();
        let data_a: Vec<u8> = (0x00..0x10).collect();
        let items_a = vec![
            ItemPointer { immediate: true, id: crate::HEAP_CNT_ID, address: 9 },
            ItemPointer { immediate: true, id: crate::PAYLOAD_OFF_ID, address: 0 },
            ItemPointer { immediate: true, id: crate::PAYLOAD_LEN_ID, address: 16 },
            ItemPointer { immediate: true, id: crate::HEAP_LEN_ID, address: 32 },
            ItemPointer { immediate: false, id: 0x10, address: 0 },
        ];
        let pkt_a = Packet::from_parts(items_a, data_a);
        heap.add_packet(pkt_a).unwrap();
        heap.finalize().unwrap();
        assert!(!heap.is_valid());
        let map = heap.get_items().unwrap();
        let item = map.get(&0x10).unwrap().first().unwrap();
        assert!(!item.is_valid);
        assert_eq!(&item.value[16..32], &[0u8; 16]);
    }

    #[test]
    fn finalize_without_heap_len_infers_from_last_packet() {
        let mut heap = Heap::new();
        let items = vec![
            ItemPointer { immediate: true, id: crate::HEAP_CNT_ID, address: 1 },
            ItemPointer { immediate: true, id: crate::PAYLOAD_OFF_ID, address: 0 },
            ItemPointer { immediate: true, id: crate::PAYLOAD_LEN_ID, address: 4 },
        ];
        let pkt = Packet::from_parts(items, vec![1, 2, 3, 4]);
        heap.add_packet(pkt).unwrap();
        heap.finalize().unwrap();
        assert_eq!(heap.heap_len(), 4);
        assert_eq!(heap.heap_len_source(), Some(HeapLenSource::Inferred));
    }

    #[test]
    fn get_items_before_finalize_fails() {
        let heap = Heap::new();
        assert!(matches!(heap.get_items(), Err(Error::NotFinalized)));
    }
}
