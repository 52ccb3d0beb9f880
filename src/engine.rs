use crate::auth::Auth;
use crate::error::{Error, Result};
use crate::eval::{self, AuthContext};
use crate::kv::{self, Kv};
use crate::path::{Path, PathBuf};
use crate::queue::{OpId, QueuedWrite, WriteQueue};
use crate::ring::{EventRing, RingConsumer};
use crate::rules::{RuleKind, Rules};
use crate::subscriber::{Event, EventBus, EventKind, EventStream, SubId};
use crate::tree::TreeStore;
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// The storage engine: path-decomposed tree store, rule evaluation and
/// event fan-out behind one handle.
///
/// Safe to share across threads behind a reference; writes serialize
/// through the backend's single write transaction, reads run
/// concurrently.
pub struct Engine {
    inner: Arc<Inner>,
    queue: OnceLock<WriteQueue>,
}

struct Inner {
    store: TreeStore,
    bus: Arc<EventBus>,
    ring: Arc<EventRing>,
    consumer_taken: AtomicBool,
    rules: RwLock<Option<Rules>>,
    auth: RwLock<Option<Auth>>,
    /// Spans commit and emission, so subscribers observe events in
    /// backend commit order.
    write_order: Mutex<()>,
}

impl Engine {
    /// Opens (or creates) the database in `data_dir`.
    pub fn open(data_dir: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(data_dir)?;
        Self::with_db(db)
    }

    /// An in-memory engine for tests and experiments.
    pub fn memory() -> Result<Self> {
        Self::with_db(sled::Config::new().temporary(true).open()?)
    }

    fn with_db(db: sled::Db) -> Result<Self> {
        let store = TreeStore::new(Kv::new(db.open_tree("state")?));
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                bus: Arc::new(EventBus::new()),
                ring: EventRing::new(),
                consumer_taken: AtomicBool::new(false),
                rules: RwLock::new(None),
                auth: RwLock::new(None),
                write_order: Mutex::new(()),
            }),
            queue: OnceLock::new(),
        })
    }

    /// Enables token minting and validation with an HS256 secret.
    pub fn enable_auth(&self, secret: &[u8]) {
        *self.inner.auth.write() = Some(Auth::new(secret));
    }

    /// Mints a token; requires [`Engine::enable_auth`].
    pub fn create_token(&self, uid: &str, email: Option<&str>) -> Result<String> {
        match self.inner.auth.read().as_ref() {
            Some(auth) => auth.create_token(uid, email),
            None => Err(Error::AuthDisabled),
        }
    }

    /// Validates a token into the context the rule evaluator consumes.
    pub fn validate_token(&self, token: &str) -> Result<AuthContext> {
        match self.inner.auth.read().as_ref() {
            Some(auth) => auth.validate_token(token),
            None => Err(Error::AuthDisabled),
        }
    }

    /// Loads a rule document. Atomic: on a parse error the previously
    /// loaded document stays authoritative.
    pub fn load_rules(&self, document: &str) -> Result<()> {
        let rules = Rules::parse(document)?;
        *self.inner.rules.write() = Some(rules);
        tracing::info!("rules loaded");
        Ok(())
    }

    /// Reads the value at `path`.
    pub fn get(&self, path: &str, auth: Option<&AuthContext>) -> Result<Value> {
        let path = Path::normalize(path)?;
        self.inner.authorize(RuleKind::Read, path, auth, None)?;
        self.inner.store.get(path)
    }

    /// Writes `value` at `path`, replacing the subtree below it.
    pub fn set(&self, path: &str, value: Value, auth: Option<&AuthContext>) -> Result<()> {
        let path = Path::normalize(path)?;
        self.inner.authorize(RuleKind::Write, path, auth, Some(&value))?;
        self.inner
            .authorize(RuleKind::Validate, path, auth, Some(&value))?;
        self.inner.apply_set(path, &value)
    }

    /// Removes `path` and its subtree.
    pub fn delete(&self, path: &str, auth: Option<&AuthContext>) -> Result<()> {
        let path = Path::normalize(path)?;
        self.inner.authorize(RuleKind::Write, path, auth, None)?;
        self.inner.apply_delete(path)
    }

    /// Registers `callback` for events at `pattern` (and below, when
    /// `include_descendants` is set).
    ///
    /// Callbacks run synchronously on the writing thread while the
    /// write path is still serialized; a callback that needs to write
    /// back must use [`Engine::set_async`]/[`Engine::delete_async`].
    pub fn subscribe(
        &self,
        pattern: &str,
        include_descendants: bool,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<SubId> {
        let pattern = PathBuf::parse(pattern)?;
        Ok(self
            .inner
            .bus
            .subscribe(pattern, include_descendants, Arc::new(callback)))
    }

    /// Drops a subscription.
    pub fn unsubscribe(&self, id: SubId) {
        self.inner.bus.unsubscribe(id);
    }

    /// Subscribes as a `futures::Stream` of owned events; the
    /// subscription ends when the stream is dropped.
    pub fn watch(&self, pattern: &str, include_descendants: bool) -> Result<EventStream> {
        let pattern = PathBuf::parse(pattern)?;
        Ok(EventStream::new(
            self.inner.bus.clone(),
            pattern,
            include_descendants,
        ))
    }

    /// Takes the consuming end of the out-of-process event ring.
    /// There is exactly one; later calls return `None`.
    pub fn ring_consumer(&self) -> Option<RingConsumer> {
        if self.inner.consumer_taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(RingConsumer::new(self.inner.ring.clone()))
    }

    /// Enqueues a write and returns immediately with its operation id.
    /// Authorization happens here, not in the worker.
    pub fn set_async(
        &self,
        path: &str,
        value: Value,
        auth: Option<&AuthContext>,
    ) -> Result<OpId> {
        let path = Path::normalize(path)?;
        self.inner.authorize(RuleKind::Write, path, auth, Some(&value))?;
        self.inner
            .authorize(RuleKind::Validate, path, auth, Some(&value))?;
        self.write_queue().submit(QueuedWrite::Set {
            path: path.to_owned(),
            value,
        })
    }

    /// Enqueues a delete and returns immediately with its operation id.
    pub fn delete_async(&self, path: &str, auth: Option<&AuthContext>) -> Result<OpId> {
        let path = Path::normalize(path)?;
        self.inner.authorize(RuleKind::Write, path, auth, None)?;
        self.write_queue().submit(QueuedWrite::Delete {
            path: path.to_owned(),
        })
    }

    /// Blocks until the enqueued operation completed, consuming and
    /// returning its outcome.
    pub fn wait_for_write(&self, id: OpId) -> Result<()> {
        match self.queue.get() {
            Some(queue) => queue.wait(id),
            None => Err(Error::QueueClosed),
        }
    }

    /// Flushes the backend to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.inner.store.kv().flush()
    }

    /// Subscriber panics swallowed so far.
    pub fn subscriber_panics(&self) -> u64 {
        self.inner.bus.panic_count()
    }

    /// Events dropped at the ring producer so far.
    pub fn ring_dropped(&self) -> u64 {
        self.inner.ring.dropped()
    }

    fn write_queue(&self) -> &WriteQueue {
        self.queue.get_or_init(|| {
            let inner = self.inner.clone();
            WriteQueue::new(move |op| match op {
                QueuedWrite::Set { path, value } => inner.apply_set(path.as_path(), value),
                QueuedWrite::Delete { path } => inner.apply_delete(path.as_path()),
            })
        })
    }
}

impl Inner {
    /// Evaluates `kind` at `path`. Absent read/write rules deny,
    /// absent validate rules pass; an engine without a loaded document
    /// performs no authorization at all.
    fn authorize(
        &self,
        kind: RuleKind,
        path: Path,
        auth: Option<&AuthContext>,
        new_data: Option<&Value>,
    ) -> Result<()> {
        let rules = self.rules.read();
        let rules = match rules.as_ref() {
            Some(rules) => rules,
            None => return Ok(()),
        };
        let anonymous = AuthContext::anonymous();
        let auth = auth.unwrap_or(&anonymous);
        let verdict = eval::check(rules, kind, path, auth, new_data);
        let allowed = match kind {
            RuleKind::Read | RuleKind::Write => verdict.unwrap_or(false),
            RuleKind::Validate => verdict.unwrap_or(true),
        };
        if allowed {
            Ok(())
        } else {
            tracing::debug!("{:?} denied at {}", kind, path);
            Err(Error::Forbidden)
        }
    }

    /// The synchronous write path: storage mutation first, then event
    /// emission; a failed transaction emits nothing. The write-order
    /// lock is held across both, so callbacks that want to write back
    /// must go through the async queue.
    fn apply_set(&self, path: Path, value: &Value) -> Result<()> {
        let _order = self.write_order.lock();
        let old_value = self.store.get_opt(path)?;
        kv::with_conflict_retry(|| self.store.set(path, value))?;
        tracing::debug!("set {}", path);
        self.emit(EventKind::Changed, path, Some(value.clone()), old_value);
        Ok(())
    }

    fn apply_delete(&self, path: Path) -> Result<()> {
        let _order = self.write_order.lock();
        let old_value = self.store.get_opt(path)?;
        kv::with_conflict_retry(|| self.store.delete(path))?;
        tracing::debug!("delete {}", path);
        self.emit(EventKind::Deleted, path, None, old_value);
        Ok(())
    }

    fn emit(&self, kind: EventKind, path: Path, value: Option<Value>, old_value: Option<Value>) {
        let event = self.bus.emit(kind, path.to_owned(), value, old_value);
        if self.ring.push(&event).is_err() {
            tracing::trace!("event ring full, dropped {}", event.sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;
    use parking_lot::Mutex;

    fn memory() -> Engine {
        init_tracing();
        Engine::memory().unwrap()
    }

    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    }

    #[test]
    fn set_get_round_trip() {
        let engine = memory();
        let alice = object! { "name" => "Alice", "age" => 30.0, "active" => true };
        engine.set("/users/alice", alice.clone(), None).unwrap();
        assert_eq!(engine.get("/users/alice", None).unwrap(), alice);
        assert_eq!(
            engine.get("/users/alice/name", None).unwrap(),
            "Alice".into()
        );
    }

    #[test]
    fn not_found_and_forbidden_are_distinct() {
        let engine = memory();
        engine
            .load_rules(r#"{ "open": { ".read": "true", ".write": "true" } }"#)
            .unwrap();
        assert!(matches!(
            engine.get("/open/missing", None),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            engine.get("/closed", None),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn rules_gate_by_uid() {
        let engine = memory();
        engine
            .load_rules(
                r#"{ "users": { "$uid": { ".read": "$uid === auth.uid",
                                          ".write": "$uid === auth.uid" } } }"#,
            )
            .unwrap();
        let alice = AuthContext::for_uid("alice");
        engine
            .set("/users/alice", object! { "x" => 1.0 }, Some(&alice))
            .unwrap();
        assert!(engine.get("/users/alice", Some(&alice)).is_ok());
        assert!(matches!(
            engine.get("/users/bob", Some(&alice)),
            Err(Error::Forbidden)
        ));
        assert!(matches!(
            engine.set("/users/bob", Value::Null, Some(&alice)),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn failed_rule_load_keeps_previous_document() {
        let engine = memory();
        engine
            .load_rules(r#"{ ".read": "true", ".write": "true" }"#)
            .unwrap();
        assert!(matches!(
            engine.load_rules("{broken"),
            Err(Error::RuleParse(_))
        ));
        engine.set("/a", 1.0.into(), None).unwrap();
        assert_eq!(engine.get("/a", None).unwrap(), 1.0.into());
    }

    #[test]
    fn validation_rejects_bad_writes() {
        let engine = memory();
        engine
            .load_rules(
                r#"{ ".read": "true", ".write": "true",
                     "users": { "$uid": { ".validate": "newData.uid === $uid" } } }"#,
            )
            .unwrap();
        engine
            .set("/users/alice", object! { "uid" => "alice" }, None)
            .unwrap();
        assert!(matches!(
            engine.set("/users/alice", object! { "uid" => "bob" }, None),
            Err(Error::Forbidden)
        ));
        // paths without a validate rule are unaffected
        engine.set("/misc", 1.0.into(), None).unwrap();
    }

    #[test]
    fn subscription_sees_one_event_per_write() {
        let engine = memory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine
            .subscribe("/users", true, move |event: &Event| {
                sink.lock().push(event.clone());
            })
            .unwrap();
        engine.set("/users/alice/email", "x@y".into(), None).unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path.as_str(), "/users/alice/email");
        assert_eq!(seen[0].kind, EventKind::Changed);
        assert_eq!(seen[0].value, Some("x@y".into()));
    }

    #[test]
    fn delete_emits_with_old_value() {
        let engine = memory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.set("/k", 7.0.into(), None).unwrap();
        engine
            .subscribe("/k", false, move |event: &Event| {
                sink.lock().push(event.clone());
            })
            .unwrap();
        engine.delete("/k", None).unwrap();
        let seen = seen.lock();
        assert_eq!(seen[0].kind, EventKind::Deleted);
        assert_eq!(seen[0].old_value, Some(7.0.into()));
        assert!(matches!(engine.get("/k", None), Err(Error::NotFound)));
    }

    #[test]
    fn failed_writes_emit_nothing() {
        let engine = memory();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        engine
            .subscribe("/", true, move |_: &Event| *sink.lock() += 1)
            .unwrap();
        assert!(engine.delete("/missing", None).is_err());
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn ring_receives_committed_writes() {
        let engine = memory();
        let mut consumer = engine.ring_consumer().unwrap();
        assert!(engine.ring_consumer().is_none());
        engine.set("/a", 1.0.into(), None).unwrap();
        engine.delete("/a", None).unwrap();
        let first = consumer.try_pop().unwrap();
        assert_eq!(first.path, "/a");
        assert_eq!(first.value, Some(1.0.into()));
        let second = consumer.try_pop().unwrap();
        assert_eq!(second.kind, EventKind::Deleted);
        assert!(second.value.is_none());
        assert!(second.sequence > first.sequence);
    }

    #[test]
    fn async_writes_complete_in_order() {
        let engine = memory();
        let ids: Vec<OpId> = (0..20)
            .map(|i| {
                engine
                    .set_async("/counter", Value::Number(i as f64), None)
                    .unwrap()
            })
            .collect();
        for id in ids {
            engine.wait_for_write(id).unwrap();
        }
        assert_eq!(engine.get("/counter", None).unwrap(), 19.0.into());
    }

    #[test]
    fn async_delete_reports_not_found() {
        let engine = memory();
        let id = engine.delete_async("/missing", None).unwrap();
        assert!(matches!(engine.wait_for_write(id), Err(Error::NotFound)));
    }

    #[test]
    fn async_write_is_authorized_at_submission() {
        let engine = memory();
        engine
            .load_rules(r#"{ "users": { "$uid": { ".write": "$uid === auth.uid" } } }"#)
            .unwrap();
        let alice = AuthContext::for_uid("alice");
        assert!(matches!(
            engine.set_async("/users/bob", Value::Null, Some(&alice)),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn token_round_trip_feeds_rules() {
        let engine = memory();
        engine.enable_auth(b"test-secret");
        engine
            .load_rules(r#"{ "users": { "$uid": { ".read": "$uid === auth.uid",
                                                  ".write": "$uid === auth.uid" } } }"#)
            .unwrap();
        let token = engine.create_token("alice", Some("a@x")).unwrap();
        let ctx = engine.validate_token(&token).unwrap();
        engine.set("/users/alice", 1.0.into(), Some(&ctx)).unwrap();
        assert!(matches!(
            engine.get("/users/bob", Some(&ctx)),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn tokens_require_enable_auth() {
        let engine = memory();
        assert!(matches!(
            engine.create_token("alice", None),
            Err(Error::AuthDisabled)
        ));
        assert!(matches!(
            engine.validate_token("x.y.z"),
            Err(Error::AuthDisabled)
        ));
    }

    #[async_std::test]
    async fn watch_streams_events() {
        use futures::StreamExt;
        let engine = memory();
        let mut stream = engine.watch("/feed", true).unwrap();
        engine.set("/feed/1", "hello".into(), None).unwrap();
        engine.set("/other", "ignored".into(), None).unwrap();
        engine.set("/feed/2", "world".into(), None).unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.path.as_str(), "/feed/1");
        let second = stream.next().await.unwrap();
        assert_eq!(second.path.as_str(), "/feed/2");
        // dropping the stream tears the subscription down
        drop(stream);
        engine.set("/feed/3", "gone".into(), None).unwrap();
    }

    #[test]
    fn persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("elkyn-test-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        {
            let engine = Engine::open(&dir).unwrap();
            engine.set("/k", "v".into(), None).unwrap();
            engine.flush().unwrap();
        }
        {
            let engine = Engine::open(&dir).unwrap();
            assert_eq!(engine.get("/k", None).unwrap(), "v".into());
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn concurrent_writers_serialize() {
        let engine = Arc::new(memory());
        let mut handles = Vec::new();
        for t in 0..4 {
            let engine = engine.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    engine
                        .set(
                            &format!("/t{}/i{}", t, i),
                            Value::Number((t * 100 + i) as f64),
                            None,
                        )
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        for t in 0..4 {
            for i in 0..50 {
                assert_eq!(
                    engine.get(&format!("/t{}/i{}", t, i), None).unwrap(),
                    Value::Number((t * 100 + i) as f64)
                );
            }
        }
    }
}
