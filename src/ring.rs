/*! Fixed-capacity ring of packet slots, shared between exactly one
producer thread and one consumer thread. Each slot carries its payload
plus two binary handoff tokens so that a slot is never read while being
written and never recycled while still being read.

The tokens are modeled as bounded channels of capacity one, used purely
as single-permit gates rather than as data pipes — the same idiom the
rest of this crate's ingest pipeline uses for thread coordination.
*/
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// A single-permit handoff gate: `release` grants a permit, `acquire`
/// (blocking or non-blocking) consumes one.
struct SlotGate {
    tx: mpsc::SyncSender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl SlotGate {
    fn new(available: bool) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        if available {
            tx.send(()).expect("fresh channel accepts one permit");
        }
        Self { tx, rx: Mutex::new(rx) }
    }

    fn acquire_blocking(&self) {
        self.rx
            .lock()
            .expect("slot gate mutex poisoned")
            .recv()
            .expect("slot gate sender half never dropped while ring is alive");
    }

    fn try_acquire(&self) -> bool {
        self.rx.lock().expect("slot gate mutex poisoned").try_recv().is_ok()
    }

    fn release(&self) {
        // The receiving half lives as long as the ring; a full channel
        // here would mean a double release, which the handoff protocol
        // never does.
        let _ = self.tx.try_send(());
    }
}

struct Slot<T> {
    data: Mutex<Option<T>>,
    write_gate: SlotGate,
    read_gate: SlotGate,
}

/// A fixed-size cyclic ring of packet slots with single-producer,
/// single-consumer handoff semantics.
pub struct SlotRing<T> {
    slots: Vec<Slot<T>>,
    write_index: AtomicUsize,
    read_index: AtomicUsize,
}

impl<T> SlotRing<T> {
    /// Build a ring with `capacity` slots. All write-tokens start
    /// available (slots empty, ready for the producer); all read-tokens
    /// start unavailable.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be nonzero");
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                data: Mutex::new(None),
                write_gate: SlotGate::new(true),
                read_gate: SlotGate::new(false),
            });
        }
        Self {
            slots,
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Block until the current write slot's write-token is available,
    /// returning the slot index the producer now has exclusive access
    /// to.
    pub fn claim_write(&self) -> usize {
        let idx = self.write_index.load(Ordering::Relaxed) % self.slots.len();
        self.slots[idx].write_gate.acquire_blocking();
        idx
    }

    /// Store `item` into the claimed slot.
    pub fn store(&self, idx: usize, item: T) {
        *self.slots[idx].data.lock().expect("slot data mutex poisoned") = Some(item);
    }

    /// Advance `write_index` past `idx` and grant the consumer's
    /// read-token for that slot.
    pub fn publish_write(&self, idx: usize) {
        self.write_index.fetch_add(1, Ordering::Relaxed);
        self.slots[idx].read_gate.release();
    }

    /// Non-blocking attempt to acquire the current read slot's
    /// read-token. Returns the slot index on success.
    pub fn try_claim_read(&self) -> Option<usize> {
        let idx = self.read_index.load(Ordering::Relaxed) % self.slots.len();
        if self.slots[idx].read_gate.try_acquire() {
            Some(idx)
        } else {
            None
        }
    }

    /// Poll for a readable slot, sleeping `poll_interval` between
    /// attempts and checking `should_continue` after each failed
    /// attempt so shutdown latency stays bounded. Returns `None` once
    /// `should_continue` returns `false`.
    pub fn claim_read_poll(
        &self,
        poll_interval: Duration,
        mut should_continue: impl FnMut() -> bool,
    ) -> Option<usize> {
        loop {
            if let Some(idx) = self.try_claim_read() {
                return Some(idx);
            }
            if !should_continue() {
                return None;
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// Take ownership of the claimed slot's payload.
    pub fn take(&self, idx: usize) -> Option<T> {
        self.slots[idx].data.lock().expect("slot data mutex poisoned").take()
    }

    /// Advance `read_index` past `idx` and grant the producer's
    /// write-token for that slot.
    pub fn publish_read(&self, idx: usize) {
        self.read_index.fetch_add(1, Ordering::Relaxed);
        self.slots[idx].write_gate.release();
    }
}
