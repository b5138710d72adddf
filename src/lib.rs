#![warn(missing_docs)]
/*! This crate implements the receiving side of SPEAD (Streaming Protocol
for Exchanging Astronomical Data), a UDP-based protocol that carries
self-describing numeric/scientific data as sequences of packets that
aggregate into heaps.

# Architecture overview

A SPEAD datagram is decoded by the [`packet`] module into a [`Packet`].
Packets that share a heap counter are handed to a [`heap::Heap`], which
orders them by payload offset and, once complete, finalizes them into a
dictionary of item id to byte-string value ([`heap::Item`]).

For continuous network ingest, a [`Receiver`] owns a UDP socket and a
fixed-capacity [`ring::SlotRing`]: a producer thread reads datagrams off
the wire into ring slots, and a consumer thread drains the ring, decodes
each packet, and invokes a user callback.

```text
  UDP datagram -> [ producer ] -> ring slot -> [ consumer ] -> decoded Packet -> callback
                                                                      |
                                                                      v
                                                              Heap::add_packet
                                                              Heap::finalize
```

# Example

```
use spead_rx::Packet;

let mut pkt = Packet::new();
// Minimal valid packet: 0 items, empty payload.
let header = [0x53, 0x04, 0x05, 0x03, 0x00, 0x00, 0x00, 0x00];
let n = pkt.unpack(&header).unwrap();
assert_eq!(n, 8);
assert_eq!(pkt.heap_cnt(), -1);
assert!(!pkt.is_stream_ctrl_term());
```
*/

pub mod bits;
pub mod heap;
pub mod ingest;
pub mod packet;
pub mod receiver;
pub mod ring;

pub use bits::{FormatEntry, Value, pack, parse_format, unpack};
pub use heap::{Heap, HeapLenSource, Item, ItemValues};
pub use packet::{ItemPointer, Packet};
pub use receiver::{Receiver, ReceiverConfig, ReceiverState, Stats};
pub use ring::SlotRing;

/// Header magic byte for the supported ("v4") wire flavor.
pub const MAGIC: u8 = 0x53;
/// Header version byte for the supported wire flavor.
pub const VERSION: u8 = 4;
/// Bytes per item-pointer word.
pub const ITEM_LEN: usize = 8;
/// Bytes in the fixed packet header.
pub const HEADER_LEN: usize = 8;
/// Default heap-address width, in bytes (40-bit address).
pub const ADDR_LEN: usize = 5;
/// Maximum datagram size in bytes (jumbo-frame friendly).
pub const MAX_PACKET_LEN: usize = 9200;

/// Reserved item id: sets `heap_cnt`.
pub const HEAP_CNT_ID: u64 = 0x01;
/// Reserved item id: sets `heap_len`.
pub const HEAP_LEN_ID: u64 = 0x02;
/// Reserved item id: sets `payload_off`.
pub const PAYLOAD_OFF_ID: u64 = 0x03;
/// Reserved item id: sets `payload_len`.
pub const PAYLOAD_LEN_ID: u64 = 0x04;
/// Reserved item id: descriptor, preserved as an ordinary (multi-valued) item.
pub const DESCRIPTOR_ID: u64 = 0x05;
/// Reserved item id: stream control.
pub const STREAM_CTRL_ID: u64 = 0x06;
/// `STREAM_CTRL` value meaning "end of stream".
pub const STREAM_CTRL_TERM: u64 = 0x02;

/// Item-pointer mode: direct (payload-offset) addressing.
pub const DIRECTADDR: u8 = 0;
/// Item-pointer mode: immediate (in-pointer) addressing.
pub const IMMEDIATEADDR: u8 = 1;

/// Default SPEAD UDP port.
pub const DEFAULT_PORT: u16 = 7148;
/// Default slot-ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 128;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the codec, heap assembler, and ingest pipeline.
///
/// Every kind named here is surfaced to direct callers; the ingest
/// pipeline additionally treats a handful of these as fatal to the
/// session (see [`ingest`] module docs) while per-packet decode errors
/// are swallowed, since packet loss is expected on UDP.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Header magic/version/width did not match the supported wire flavor.
    #[error("unrecognized packet format")]
    UnrecognizedFormat,
    /// Caller-supplied bytes were shorter than the currently known
    /// `n_items`/`payload_len` require.
    #[error("insufficient data for decode")]
    InsufficientData,
    /// `pack()` was called before the packet's header/items were set.
    #[error("packet not initialized for packing")]
    UninitializedPacket,
    /// Malformed format-string in `pack`/`unpack`.
    #[error("malformed format string")]
    FormatInvalid,
    /// A value did not match its format slot's type.
    #[error("value type mismatch for format slot")]
    ValueTypeMismatch,
    /// Insufficient bytes for a requested pack/unpack.
    #[error("buffer too small for requested operation")]
    BufferTooSmall,
    /// A packet belongs to a different heap than the one it was added to.
    #[error("packet heap_cnt does not match heap")]
    HeapCountMismatch,
    /// A packet was added to a heap before being decoded.
    #[error("packet was not decoded before heap insertion")]
    WrongFormat,
    /// `get_items()` was called before `finalize()`.
    #[error("heap has not been finalized")]
    NotFinalized,
    /// `start()` was called while the receiver was already running.
    #[error("receiver is already running")]
    AlreadyRunning,
    /// `stop()` was called while the receiver was not running.
    #[error("receiver is not running")]
    NotRunning,
    /// Socket bind/setsockopt failure.
    #[error("socket error: {0}")]
    SocketError(String),
    /// Allocation failure during finalize or decode.
    #[error("out of memory")]
    OutOfMemory,
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
