use crate::path::{Path, PathBuf};
use crate::value::Value;
use futures::channel::mpsc;
use futures::Stream;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

/// What happened at a path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// A value was written.
    Changed,
    /// A subtree was removed.
    Deleted,
}

/// A change notification.
///
/// In-process callbacks receive events by reference and must not
/// retain them past the callback; clone for anything longer lived.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub path: PathBuf,
    /// The value written; `None` for deletes.
    pub value: Option<Value>,
    /// Prior value, when the write path had read it.
    pub old_value: Option<Value>,
    /// Global emission order; strictly increasing.
    pub sequence: u64,
    pub timestamp_ms: i64,
}

/// Identifier of a registered subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SubId(u64);

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: SubId,
    pattern: PathBuf,
    include_descendants: bool,
    callback: Callback,
}

impl Subscription {
    fn matches(&self, path: Path) -> bool {
        let pattern = self.pattern.as_path();
        path == pattern
            || (self.include_descendants && pattern.is_ancestor_of(path))
    }
}

/// Subscription registry with synchronous fan-out.
///
/// Emission snapshots the matching callbacks under the read lock and
/// invokes them after releasing it, so callbacks may subscribe or
/// unsubscribe freely. A panicking callback is counted and skipped,
/// never propagated to the writer.
pub struct EventBus {
    subs: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    sequence: AtomicU64,
    panics: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        }
    }

    /// Registers a callback for `pattern`.
    pub fn subscribe(
        &self,
        pattern: PathBuf,
        include_descendants: bool,
        callback: Callback,
    ) -> SubId {
        let id = SubId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subs.write().push(Subscription {
            id,
            pattern,
            include_descendants,
            callback,
        });
        id
    }

    /// Removes a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubId) {
        self.subs.write().retain(|sub| sub.id != id);
    }

    /// Stamps `kind/path/value` with the next sequence number and
    /// delivers it to every matching subscriber, in subscription order.
    pub fn emit(
        &self,
        kind: EventKind,
        path: PathBuf,
        value: Option<Value>,
        old_value: Option<Value>,
    ) -> Event {
        let event = Event {
            kind,
            path,
            value,
            old_value,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: now_ms(),
        };
        let matching: Vec<Callback> = {
            let subs = self.subs.read();
            subs.iter()
                .filter(|sub| sub.matches(event.path.as_path()))
                .map(|sub| sub.callback.clone())
                .collect()
        };
        for callback in matching {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                self.panics.fetch_add(1, Ordering::Relaxed);
                tracing::error!("subscriber panicked for {}", event.path);
            }
        }
        event
    }

    /// Number of subscriber panics swallowed so far.
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Stream of events for one pattern; unsubscribes on drop.
///
/// Backed by an unbounded channel, so a slow consumer buffers rather
/// than blocking the write path.
pub struct EventStream {
    bus: Arc<EventBus>,
    id: SubId,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub(crate) fn new(bus: Arc<EventBus>, pattern: PathBuf, include_descendants: bool) -> Self {
        let (tx, rx) = mpsc::unbounded();
        let id = bus.subscribe(
            pattern,
            include_descendants,
            Arc::new(move |event: &Event| {
                tx.unbounded_send(event.clone()).ok();
            }),
        );
        Self { bus, id, rx }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Event>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
