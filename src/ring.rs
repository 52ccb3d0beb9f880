use crate::subscriber::{Event, EventKind};
use crate::value::Value;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of slots; must be a power of two.
pub const RING_CAPACITY: usize = 1024;
/// Fixed per-slot path buffer.
const PATH_CAPACITY: usize = 256;
/// Linear arena for value payloads.
const ARENA_CAPACITY: usize = 1 << 20;

const KIND_CHANGED: u8 = 0;
const KIND_DELETED: u8 = 1;

/// Returned by [`EventRing::push`] when the consumer has fallen a full
/// ring behind. The write path never blocks on this; the event is
/// dropped and counted.
#[derive(Debug, Eq, PartialEq)]
pub struct RingFull;

#[repr(C)]
struct Slot {
    kind: u8,
    path_len: u16,
    path: [u8; PATH_CAPACITY],
    timestamp_ms: i64,
    sequence: u64,
    value_offset: u32,
    value_len: u32,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            kind: KIND_CHANGED,
            path_len: 0,
            path: [0; PATH_CAPACITY],
            timestamp_ms: 0,
            sequence: 0,
            value_offset: 0,
            value_len: 0,
        }
    }
}

struct ProducerState {
    arena_pos: usize,
}

/// Single-producer single-consumer event ring for out-of-process
/// consumers.
///
/// Slots are deep copies: path bytes live in the slot, value payloads
/// in a shared linear arena with simple wrap-around. Delivery is
/// at-most-once; the consumer detects drops through gaps in the
/// sequence numbers and treats malformed payloads as missed.
///
/// The producer side is serialized by a mutex since the engine may be
/// written from many threads; `read_pos` is only advanced by the
/// single [`RingConsumer`].
pub struct EventRing {
    slots: Box<[UnsafeCell<Slot>]>,
    arena: Box<[UnsafeCell<u8>]>,
    write_pos: AtomicU64,
    read_pos: AtomicU64,
    dropped: AtomicU64,
    producer: Mutex<ProducerState>,
}

// safe: slot i is written only by the producer (under the mutex) while
// i is outside [read_pos, write_pos), and read only by the consumer
// while inside it; the acquire/release pair on write_pos/read_pos
// publishes the contents
unsafe impl Send for EventRing {}
unsafe impl Sync for EventRing {}

impl EventRing {
    pub fn new() -> Arc<Self> {
        assert!(RING_CAPACITY.is_power_of_two());
        Arc::new(Self {
            slots: (0..RING_CAPACITY)
                .map(|_| UnsafeCell::new(Slot::empty()))
                .collect(),
            arena: (0..ARENA_CAPACITY).map(|_| UnsafeCell::new(0)).collect(),
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            producer: Mutex::new(ProducerState { arena_pos: 0 }),
        })
    }

    /// Copies `event` into the ring. Never blocks: a full ring, an
    /// unrepresentable path or a value too large for the arena drops
    /// the event instead, counted by [`EventRing::dropped`].
    pub fn push(&self, event: &Event) -> Result<(), RingFull> {
        let mut state = self.producer.lock();
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let path = event.path.as_str().as_bytes();
        let body = event.value.as_ref().map(Value::to_json);
        let oversized = body.as_ref().map_or(false, |body| body.len() > ARENA_CAPACITY);
        if write - read >= RING_CAPACITY as u64 || path.len() > PATH_CAPACITY || oversized {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(RingFull);
        }

        let (value_offset, value_len) = match body {
            Some(body) => {
                let mut pos = state.arena_pos;
                if pos + body.len() > ARENA_CAPACITY {
                    // wrap to the start; unread values there are
                    // overwritten and will surface as missed
                    pos = 0;
                }
                for (i, b) in body.iter().enumerate() {
                    unsafe { *self.arena[pos + i].get() = *b };
                }
                state.arena_pos = pos + body.len();
                (pos as u32, body.len() as u32)
            }
            None => (0, 0),
        };

        let idx = (write as usize) & (RING_CAPACITY - 1);
        // safe: this slot is outside the consumer's window, see above
        let slot = unsafe { &mut *self.slots[idx].get() };
        slot.kind = match event.kind {
            EventKind::Changed => KIND_CHANGED,
            EventKind::Deleted => KIND_DELETED,
        };
        slot.path_len = path.len() as u16;
        slot.path[..path.len()].copy_from_slice(path);
        slot.timestamp_ms = event.timestamp_ms;
        slot.sequence = event.sequence;
        slot.value_offset = value_offset;
        slot.value_len = value_len;

        self.write_pos.store(write + 1, Ordering::Release);
        Ok(())
    }

    /// Events dropped by the producer so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// An event read back out of the ring.
#[derive(Clone, Debug, PartialEq)]
pub struct RingEvent {
    pub kind: EventKind,
    pub path: String,
    /// `None` for deletes and for payloads lost to arena wrap-around.
    pub value: Option<Value>,
    pub sequence: u64,
    pub timestamp_ms: i64,
}

/// The consuming side of an [`EventRing`]; there is exactly one.
pub struct RingConsumer {
    ring: Arc<EventRing>,
    last_sequence: Option<u64>,
    missed: u64,
}

impl RingConsumer {
    pub(crate) fn new(ring: Arc<EventRing>) -> Self {
        Self {
            ring,
            last_sequence: None,
            missed: 0,
        }
    }

    /// Pops the next event, or `None` when the ring is empty.
    pub fn try_pop(&mut self) -> Option<RingEvent> {
        let read = self.ring.read_pos.load(Ordering::Relaxed);
        let write = self.ring.write_pos.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let idx = (read as usize) & (RING_CAPACITY - 1);
        // safe: the slot is inside [read_pos, write_pos), which the
        // producer will not touch until read_pos moves past it
        let slot = unsafe { &*self.ring.slots[idx].get() };
        let kind = if slot.kind == KIND_DELETED {
            EventKind::Deleted
        } else {
            EventKind::Changed
        };
        let path = String::from_utf8_lossy(&slot.path[..slot.path_len as usize]).into_owned();
        let value = if slot.value_len == 0 {
            None
        } else {
            let start = slot.value_offset as usize;
            let end = start + slot.value_len as usize;
            let bytes: Vec<u8> = self.ring.arena[start..end]
                .iter()
                .map(|b| unsafe { *b.get() })
                .collect();
            match Value::from_json(&bytes) {
                Ok(value) => Some(value),
                Err(_) => {
                    // the arena wrapped over this payload
                    self.missed += 1;
                    None
                }
            }
        };
        let sequence = slot.sequence;
        let timestamp_ms = slot.timestamp_ms;
        self.ring.read_pos.store(read + 1, Ordering::Release);

        if let Some(last) = self.last_sequence {
            self.missed += sequence.saturating_sub(last + 1);
        }
        self.last_sequence = Some(sequence);
        Some(RingEvent {
            kind,
            path,
            value,
            sequence,
            timestamp_ms,
        })
    }

    /// Events known to be lost: sequence gaps plus overwritten
    /// payloads.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathBuf;
    use crate::subscriber::EventBus;

    fn event(bus: &EventBus, seq_path: &str, value: Value) -> Event {
        bus.emit(
            EventKind::Changed,
            PathBuf::parse(seq_path).unwrap(),
            Some(value),
            None,
        )
    }

    #[test]
    fn round_trip() {
        let bus = EventBus::new();
        let ring = EventRing::new();
        let mut consumer = RingConsumer::new(ring.clone());

        ring.push(&event(&bus, "/users/alice", "x@y".into())).unwrap();
        let got = consumer.try_pop().unwrap();
        assert_eq!(got.path, "/users/alice");
        assert_eq!(got.kind, EventKind::Changed);
        assert_eq!(got.value, Some("x@y".into()));
        assert!(consumer.try_pop().is_none());
    }

    #[test]
    fn full_ring_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let ring = EventRing::new();
        let mut consumer = RingConsumer::new(ring.clone());
        for i in 0..RING_CAPACITY + 10 {
            let _ = ring.push(&event(&bus, "/k", Value::Number(i as f64)));
        }
        assert_eq!(ring.dropped(), 10);
        let mut received = 0;
        while consumer.try_pop().is_some() {
            received += 1;
        }
        assert_eq!(received, RING_CAPACITY);
    }

    #[test]
    fn sequences_reveal_drops() {
        let bus = EventBus::new();
        let ring = EventRing::new();
        let mut consumer = RingConsumer::new(ring.clone());

        let total = 100_000u64;
        let mut produced = 0u64;
        let mut got = Vec::new();
        for i in 0..total {
            if ring.push(&event(&bus, "/load", Value::Number(i as f64))).is_ok() {
                produced += 1;
            }
            // a slow consumer: one drain for every ten writes
            if i % 10 == 0 {
                got.extend(consumer.try_pop());
            }
        }
        while let Some(ev) = consumer.try_pop() {
            got.push(ev);
        }
        for pair in got.windows(2) {
            assert!(pair[1].sequence > pair[0].sequence);
        }
        assert_eq!(ring.dropped(), total - produced);
        assert_eq!(got.len() as u64, produced);
        // the received count is exactly the writes minus the gaps
        let last = got.last().unwrap().sequence;
        assert_eq!(got.len() as u64, last + 1 - consumer.missed());
    }

    #[test]
    fn oversized_path_is_dropped() {
        let bus = EventBus::new();
        let ring = EventRing::new();
        let long = format!("/{}", "x".repeat(300));
        assert_eq!(
            ring.push(&event(&bus, &long, Value::Null)),
            Err(RingFull)
        );
        assert_eq!(ring.dropped(), 1);
    }

    #[test]
    fn oversized_value_is_dropped_and_detectable() {
        let bus = EventBus::new();
        let ring = EventRing::new();
        let mut consumer = RingConsumer::new(ring.clone());
        ring.push(&event(&bus, "/small", Value::Null)).unwrap();
        assert!(consumer.try_pop().is_some());

        let big = Value::String("x".repeat(ARENA_CAPACITY));
        assert_eq!(ring.push(&event(&bus, "/big", big)), Err(RingFull));
        assert_eq!(ring.dropped(), 1);

        ring.push(&event(&bus, "/after", Value::Null)).unwrap();
        let ev = consumer.try_pop().unwrap();
        assert_eq!(ev.path, "/after");
        // the dropped event surfaces as a sequence gap
        assert_eq!(consumer.missed(), 1);
    }

    #[test]
    fn cross_thread_delivery() {
        let bus = EventBus::new();
        let ring = EventRing::new();
        let mut consumer = RingConsumer::new(ring.clone());
        let events: Vec<Event> = (0..500)
            .map(|i| event(&bus, "/t", Value::Number(i as f64)))
            .collect();
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for ev in &events {
                    while ring.push(ev).is_err() {
                        std::thread::yield_now();
                    }
                }
            })
        };
        let mut got = Vec::new();
        while got.len() < 500 {
            if let Some(ev) = consumer.try_pop() {
                got.push(ev.value.unwrap());
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(got.len(), 500);
        for (i, v) in got.iter().enumerate() {
            assert_eq!(v, &Value::Number(i as f64));
        }
    }
}
