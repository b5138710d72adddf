/*! SPEAD packet codec: decodes and encodes a single UDP datagram's worth
of SPEAD wire format — the fixed 8-byte header, the item-pointer table,
and the payload.

Only the v4 flavor is recognized (magic `0x53`, version `4`, a 40-bit
heap address and 23-bit item identifier packed alongside a 1-bit mode
into one 64-bit item-pointer word). Anything else is rejected at the
header stage with
[`crate::Error::UnrecognizedFormat`], per this crate's choice to target
a single flavor rather than negotiate between them.
*/
use crate::{
    ADDR_LEN, DIRECTADDR, Error, HEADER_LEN, IMMEDIATEADDR, ITEM_LEN, MAGIC, MAX_PACKET_LEN,
    Result, VERSION,
};

/// Largest `n_items` that still leaves the item-pointer table within
/// `MAX_PACKET_LEN`, per the data-model invariant `0 ≤ n_items ≤
/// (MAX_PACKET_LEN − HEADER_LEN) / ITEM_LEN`.
const MAX_ITEMS: usize = (MAX_PACKET_LEN - HEADER_LEN) / ITEM_LEN;

/// One decoded item-pointer: whether its value is the address of the
/// item's data elsewhere in the payload (direct addressing) or the
/// value itself (immediate addressing), the item id, and the address
/// or immediate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPointer {
    /// `true` for immediate addressing, `false` for direct addressing.
    pub immediate: bool,
    /// Item identifier (23 bits on the wire, alongside the 1-bit mode in
    /// the same 24-bit field implied by the item-pointer id width).
    pub id: u64,
    /// Direct mode: byte offset into the payload. Immediate mode: the
    /// value itself.
    pub address: u64,
}

impl ItemPointer {
    fn decode(word: u64) -> Self {
        let mode = (word >> 63) & 1;
        // Bit 63 is mode; the remaining 23 bits of this 24-bit window are
        // id, so the id mask must exclude the mode bit (0x7FFFFF, not
        // 0xFFFFFF) or an immediate (mode=1) pointer's id decodes with a
        // spurious high bit set.
        let id = (word >> 40) & 0x007F_FFFF;
        let address = word & 0x0000_00FF_FFFF_FFFF;
        Self {
            immediate: mode == IMMEDIATEADDR as u64,
            id,
            address,
        }
    }

    fn encode(&self) -> u64 {
        let mode = if self.immediate { IMMEDIATEADDR } else { DIRECTADDR } as u64;
        (mode << 63) | ((self.id & 0x007F_FFFF) << 40) | (self.address & 0x0000_00FF_FFFF_FFFF)
    }
}

/// A decoded (or to-be-encoded) SPEAD packet: its item-pointer table and
/// payload bytes, plus the reserved fields lifted out of that table for
/// convenient access.
#[derive(Clone, Default)]
pub struct Packet {
    items: Vec<ItemPointer>,
    payload: Vec<u8>,
    heap_cnt: i64,
    heap_len: i64,
    payload_off: i64,
    payload_len: i64,
    stream_ctrl: Option<u64>,
    decoded: bool,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let preview_len = self.payload.len().min(16);
        f.debug_struct("Packet")
            .field("heap_cnt", &self.heap_cnt)
            .field("heap_len", &self.heap_len)
            .field("payload_off", &self.payload_off)
            .field("payload_len", &self.payload_len)
            .field("n_items", &self.items.len())
            .field("payload_preview", &&self.payload[..preview_len])
            .field("payload_total", &self.payload.len())
            .finish()
    }
}

impl Packet {
    /// An empty, not-yet-decoded packet.
    pub fn new() -> Self {
        Self {
            heap_cnt: -1,
            heap_len: -1,
            payload_off: -1,
            payload_len: -1,
            ..Default::default()
        }
    }

    /// Heap counter (`-1` if not present in this packet).
    pub fn heap_cnt(&self) -> i64 {
        self.heap_cnt
    }

    /// Declared heap length, if an explicit `HEAP_LEN` item was present
    /// (`-1` otherwise).
    pub fn heap_len(&self) -> i64 {
        self.heap_len
    }

    /// This packet's payload offset within its heap.
    pub fn payload_off(&self) -> i64 {
        self.payload_off
    }

    /// This packet's payload length.
    pub fn payload_len(&self) -> i64 {
        self.payload_len
    }

    /// Decoded item-pointer table, in wire order.
    pub fn items(&self) -> &[ItemPointer] {
        &self.items
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replace the payload bytes, syncing `payload_len` (and any
    /// immediate `PAYLOAD_LEN_ID` item-pointer, so a later `pack()`
    /// advertises the right length on the wire) to match. Lets a caller
    /// modify a decoded (or `from_parts`-built) packet in place before
    /// re-`pack`ing it, matching the façade's paired payload get/set
    /// operation.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        let len = payload.len() as i64;
        self.payload_len = len;
        for item in &mut self.items {
            if item.immediate && item.id == crate::PAYLOAD_LEN_ID {
                item.address = len as u64;
            }
        }
        self.payload = payload;
    }

    /// `true` if this packet carries a `STREAM_CTRL` item with the
    /// "end of stream" value.
    pub fn is_stream_ctrl_term(&self) -> bool {
        self.stream_ctrl == Some(crate::STREAM_CTRL_TERM)
    }

    fn parse_header(data: &[u8]) -> Result<usize> {
        if data.len() < HEADER_LEN {
            return Err(Error::InsufficientData);
        }
        if data[0] != MAGIC || data[1] != VERSION {
            return Err(Error::UnrecognizedFormat);
        }
        let heap_addr_width = data[2];
        let item_id_width = data[3];
        if heap_addr_width as usize != ADDR_LEN || item_id_width as usize != ITEM_LEN - ADDR_LEN {
            return Err(Error::UnrecognizedFormat);
        }
        // data[4..6] reserved, must be zero in this flavor.
        if data[4] != 0 || data[5] != 0 {
            return Err(Error::UnrecognizedFormat);
        }
        let n_items = u16::from_be_bytes([data[6], data[7]]) as usize;
        if n_items > MAX_ITEMS {
            return Err(Error::UnrecognizedFormat);
        }
        Ok(n_items)
    }

    fn parse_items(data: &[u8], n_items: usize) -> Result<Vec<ItemPointer>> {
        let start = HEADER_LEN;
        let end = start
            .checked_add(n_items.checked_mul(ITEM_LEN).ok_or(Error::InsufficientData)?)
            .ok_or(Error::InsufficientData)?;
        if data.len() < end {
            return Err(Error::InsufficientData);
        }
        let mut items = Vec::with_capacity(n_items);
        for chunk in data[start..end].chunks_exact(ITEM_LEN) {
            let word = u64::from_be_bytes(chunk.try_into().unwrap());
            items.push(ItemPointer::decode(word));
        }
        Ok(items)
    }

    fn apply_reserved(&mut self, items_end: usize, data: &[u8]) -> Result<()> {
        for item in &self.items {
            if !item.immediate {
                continue;
            }
            match item.id {
                crate::HEAP_CNT_ID => self.heap_cnt = item.address as i64,
                crate::HEAP_LEN_ID => self.heap_len = item.address as i64,
                crate::PAYLOAD_OFF_ID => self.payload_off = item.address as i64,
                crate::PAYLOAD_LEN_ID => self.payload_len = item.address as i64,
                crate::STREAM_CTRL_ID => self.stream_ctrl = Some(item.address),
                _ => {}
            }
        }
        if self.payload_len >= 0 {
            let want = items_end
                .checked_add(self.payload_len as usize)
                .ok_or(Error::InsufficientData)?;
            // Data-model invariant: "the payload region fits in the
            // buffer", sized to the wire maximum of MAX_PACKET_LEN bytes.
            if want > MAX_PACKET_LEN {
                return Err(Error::UnrecognizedFormat);
            }
            if data.len() < want {
                return Err(Error::InsufficientData);
            }
            self.payload = data[items_end..want].to_vec();
        } else {
            if data.len() > MAX_PACKET_LEN {
                return Err(Error::UnrecognizedFormat);
            }
            self.payload = data[items_end..].to_vec();
            self.payload_len = self.payload.len() as i64;
        }
        Ok(())
    }

    /// Decode `data` in place, returning the number of bytes consumed
    /// (header + item-pointer table + payload).
    pub fn unpack(&mut self, data: &[u8]) -> Result<usize> {
        let n_items = match Self::parse_header(data) {
            Ok(n) => n,
            Err(e) => {
                log::debug!("packet rejected at header stage: {e}");
                return Err(e);
            }
        };
        let items = Self::parse_items(data, n_items)?;
        let items_end = HEADER_LEN + n_items * ITEM_LEN;
        self.items = items;
        self.heap_cnt = -1;
        self.heap_len = -1;
        self.payload_off = -1;
        self.payload_len = -1;
        self.stream_ctrl = None;
        self.apply_reserved(items_end, data)?;
        self.decoded = true;
        log::trace!(
            "decoded packet: heap_cnt={} payload_off={} payload_len={} n_items={}",
            self.heap_cnt,
            self.payload_off,
            self.payload_len,
            self.items.len()
        );
        Ok(items_end + self.payload.len())
    }

    /// `true` once this packet has been successfully decoded via
    /// [`Packet::unpack`] (or built directly for packing).
    pub fn is_decoded(&self) -> bool {
        self.decoded
    }

    /// Build a packet from explicit item pointers and a payload, ready
    /// for [`Packet::pack`]. Reserved fields are derived from any
    /// matching immediate items in `items`, mirroring what `unpack`
    /// would extract.
    pub fn from_parts(items: Vec<ItemPointer>, payload: Vec<u8>) -> Self {
        let mut pkt = Self::new();
        pkt.items = items;
        let len = payload.len();
        pkt.payload = payload;
        for item in &pkt.items {
            if !item.immediate {
                continue;
            }
            match item.id {
                crate::HEAP_CNT_ID => pkt.heap_cnt = item.address as i64,
                crate::HEAP_LEN_ID => pkt.heap_len = item.address as i64,
                crate::PAYLOAD_OFF_ID => pkt.payload_off = item.address as i64,
                crate::PAYLOAD_LEN_ID => pkt.payload_len = item.address as i64,
                crate::STREAM_CTRL_ID => pkt.stream_ctrl = Some(item.address),
                _ => {}
            }
        }
        if pkt.payload_len < 0 {
            pkt.payload_len = len as i64;
        }
        pkt.decoded = true;
        pkt
    }

    /// Serialize this packet to wire bytes.
    pub fn pack(&self) -> Result<Vec<u8>> {
        if !self.decoded {
            return Err(Error::UninitializedPacket);
        }
        if self.items.len() > u16::MAX as usize {
            return Err(Error::BufferTooSmall);
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.items.len() * ITEM_LEN + self.payload.len());
        out.push(MAGIC);
        out.push(VERSION);
        out.push(ADDR_LEN as u8);
        out.push((ITEM_LEN - ADDR_LEN) as u8);
        out.push(0);
        out.push(0);
        out.extend_from_slice(&(self.items.len() as u16).to_be_bytes());
        for item in &self.items {
            out.extend_from_slice(&item.encode().to_be_bytes());
        }
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}
