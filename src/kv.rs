use crate::error::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Thin adapter over the ordered key-value backend.
///
/// sled applies a [`sled::Batch`] atomically but has no multi-key read
/// snapshots and no single-writer discipline of its own, so the adapter
/// adds both: writers serialize through the write half of an `RwLock`
/// and stage their mutations in a batch that is applied on commit,
/// while readers share the read half for the lifetime of their
/// transaction and therefore observe a consistent keyspace.
#[derive(Clone)]
pub struct Kv {
    tree: sled::Tree,
    lock: Arc<RwLock<()>>,
}

impl Kv {
    pub fn new(tree: sled::Tree) -> Self {
        Self {
            tree,
            lock: Arc::new(RwLock::new(())),
        }
    }

    /// Starts a snapshot read transaction.
    pub fn begin_read(&self) -> ReadTxn<'_> {
        ReadTxn {
            tree: &self.tree,
            _guard: self.lock.read(),
        }
    }

    /// Starts the single write transaction. Blocks while another write
    /// transaction is open.
    pub fn begin_write(&self) -> WriteTxn<'_> {
        WriteTxn {
            tree: &self.tree,
            _guard: self.lock.write(),
            batch: sled::Batch::default(),
        }
    }

    /// Flushes the backend to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }
}

/// A consistent read snapshot.
pub struct ReadTxn<'a> {
    tree: &'a sled::Tree,
    _guard: RwLockReadGuard<'a, ()>,
}

impl ReadTxn<'_> {
    /// Point lookup. The returned buffer is cheaply cloneable and does
    /// not copy the stored bytes.
    pub fn get(&self, key: &str) -> Result<Option<sled::IVec>> {
        Ok(self.tree.get(key)?)
    }

    /// Ascending scan of every key starting with `prefix`.
    pub fn range(&self, prefix: &str) -> impl Iterator<Item = Result<(sled::IVec, sled::IVec)>> {
        self.tree.scan_prefix(prefix).map(|res| res.map_err(Error::from))
    }
}

/// The write transaction: reads observe the committed state, mutations
/// are staged and applied atomically by [`WriteTxn::commit`]. Dropping
/// the transaction without committing discards the staged mutations.
pub struct WriteTxn<'a> {
    tree: &'a sled::Tree,
    _guard: RwLockWriteGuard<'a, ()>,
    batch: sled::Batch,
}

impl WriteTxn<'_> {
    /// Point lookup against the committed state.
    pub fn get(&self, key: &str) -> Result<Option<sled::IVec>> {
        Ok(self.tree.get(key)?)
    }

    /// Ascending scan of the committed state under `prefix`.
    pub fn range(&self, prefix: &str) -> impl Iterator<Item = Result<(sled::IVec, sled::IVec)>> {
        self.tree.scan_prefix(prefix).map(|res| res.map_err(Error::from))
    }

    /// Stages a put.
    pub fn put(&mut self, key: &str, value: &[u8]) {
        self.batch.insert(key.as_bytes(), value);
    }

    /// Stages a delete.
    pub fn del(&mut self, key: &str) {
        self.batch.remove(key.as_bytes());
    }

    /// Atomically applies every staged mutation.
    pub fn commit(self) -> Result<()> {
        self.tree.apply_batch(self.batch)?;
        Ok(())
    }
}

/// Retries `op` on transaction conflicts, up to three attempts.
///
/// The RwLock discipline above never produces conflicts, but backends
/// with optimistic write transactions do; every write path funnels
/// through here so the retry contract holds regardless of backend.
pub fn with_conflict_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    const ATTEMPTS: usize = 3;
    let mut last = None;
    for _ in 0..ATTEMPTS {
        match op() {
            Err(Error::Conflict) => {
                tracing::debug!("write conflict, retrying");
                last = Some(Error::Conflict);
            }
            other => return other,
        }
    }
    Err(last.unwrap_or(Error::Conflict))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Kv {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Kv::new(db.open_tree("state").unwrap())
    }

    #[test]
    fn staged_writes_are_invisible_until_commit() {
        let kv = memory();
        let mut txn = kv.begin_write();
        txn.put("/a", b"z");
        assert_eq!(txn.get("/a").unwrap(), None);
        txn.commit().unwrap();
        let txn = kv.begin_read();
        assert_eq!(txn.get("/a").unwrap().unwrap().as_ref(), b"z");
    }

    #[test]
    fn dropped_txn_discards() {
        let kv = memory();
        {
            let mut txn = kv.begin_write();
            txn.put("/a", b"z");
        }
        assert_eq!(kv.begin_read().get("/a").unwrap(), None);
    }

    #[test]
    fn range_is_ordered() {
        let kv = memory();
        let mut txn = kv.begin_write();
        txn.put("/a/b", b"z");
        txn.put("/a/a", b"z");
        txn.put("/b", b"z");
        txn.commit().unwrap();
        let txn = kv.begin_read();
        let keys: Vec<String> = txn
            .range("/a/")
            .map(|res| String::from_utf8(res.unwrap().0.to_vec()).unwrap())
            .collect();
        assert_eq!(keys, vec!["/a/a", "/a/b"]);
    }

    #[test]
    fn conflict_retry_is_bounded() {
        let mut calls = 0;
        let res: Result<()> = with_conflict_retry(|| {
            calls += 1;
            Err(Error::Conflict)
        });
        assert!(matches!(res, Err(Error::Conflict)));
        assert_eq!(calls, 3);

        let mut calls = 0;
        let res = with_conflict_retry(|| {
            calls += 1;
            if calls < 2 {
                Err(Error::Conflict)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(res.unwrap(), 2);
    }
}
