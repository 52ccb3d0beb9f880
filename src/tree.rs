use crate::error::{Error, Result};
use crate::kv::{Kv, WriteTxn};
use crate::path::{self, Path};
use crate::value::{branch_kind, BranchKind, Value, BRANCH_ARRAY, BRANCH_OBJECT};
use std::collections::BTreeMap;

/// Path-decomposed tree store.
///
/// Every primitive leaf of a compound value lands under its own key so
/// that it is independently readable and writable; compound shape is
/// recorded in a two-byte branch marker at the compound's own key.
/// Reads at a branch reconstruct the compound from a single ordered
/// prefix scan.
#[derive(Clone)]
pub struct TreeStore {
    kv: Kv,
}

impl TreeStore {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    /// Replaces the subtree at `path` with the decomposition of `value`.
    pub fn set(&self, path: Path, value: &Value) -> Result<()> {
        let key = path::encode_key(path);
        let mut txn = self.kv.begin_write();
        clear_subtree(&mut txn, path, &key)?;
        write_value(&mut txn, &key, value);
        for ancestor in Ancestors::of(path) {
            let akey = path::encode_key(ancestor);
            match txn.get(&akey)? {
                Some(bytes) if branch_kind(&bytes).is_some() => {}
                // absent or a primitive leaf: the write turns it into a branch
                _ => txn.put(&akey, &BRANCH_OBJECT),
            }
        }
        txn.commit()
    }

    /// Reads the value at `path`, reconstructing compounds.
    pub fn get(&self, path: Path) -> Result<Value> {
        match self.get_opt(path)? {
            Some(value) => Ok(value),
            None => Err(Error::NotFound),
        }
    }

    /// Like [`TreeStore::get`] but reports absence as `None`.
    pub fn get_opt(&self, path: Path) -> Result<Option<Value>> {
        let key = path::encode_key(path);
        let txn = self.kv.begin_read();
        let own = txn.get(&key)?;
        let kind = match own.as_deref() {
            Some(bytes) => match branch_kind(bytes) {
                Some(kind) => Some(kind),
                None => return Value::decode_leaf(bytes).map(Some),
            },
            None => None,
        };
        let prefix = child_prefix_key(path, &key);
        let mut entries = Vec::new();
        for res in txn.range(&prefix) {
            let (k, v) = res?;
            let k = std::str::from_utf8(&k)
                .map_err(|_| Error::BackendCorruption("non-utf8 key".into()))?;
            if k == key {
                continue;
            }
            let segments: Vec<String> = k[prefix.len()..].split('/').map(String::from).collect();
            entries.push((segments, v));
        }
        if entries.is_empty() {
            return Ok(kind.map(empty_compound));
        }
        // raw key order interleaves a node with siblings whose segment
        // extends it past a byte below '/'; segment-wise order restores
        // subtree grouping
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assemble(&entries, 0, kind).map(Some)
    }

    /// Removes `path` and its whole subtree. Branch markers on strict
    /// ancestors stay behind; an ancestor read range-scans anyway, so
    /// the stale marker never affects correctness.
    pub fn delete(&self, path: Path) -> Result<()> {
        let key = path::encode_key(path);
        let mut txn = self.kv.begin_write();
        let existed = txn.get(&key)?.is_some();
        let removed = clear_subtree(&mut txn, path, &key)?;
        if !existed && removed == 0 {
            return Err(Error::NotFound);
        }
        txn.del(&key);
        txn.commit()
    }
}

/// Storage-key prefix of the children of `path`.
fn child_prefix_key(path: Path, key: &str) -> String {
    if path.is_root() {
        "/".into()
    } else {
        format!("{}/", key)
    }
}

/// Stages deletion of every key strictly below `path`, returning how
/// many keys were staged.
fn clear_subtree(txn: &mut WriteTxn, path: Path, key: &str) -> Result<usize> {
    let prefix = child_prefix_key(path, key);
    let mut removed = 0;
    let children: Vec<sled::IVec> = txn
        .range(&prefix)
        .map(|res| res.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    for k in children {
        let k = std::str::from_utf8(&k)
            .map_err(|_| Error::BackendCorruption("non-utf8 key".into()))?;
        if k == key {
            continue;
        }
        txn.del(k);
        removed += 1;
    }
    Ok(removed)
}

/// Stages the decomposition of `value` rooted at `key`.
fn write_value(txn: &mut WriteTxn, key: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            txn.put(key, &BRANCH_OBJECT);
            for (k, v) in map {
                let child = format!("{}/{}", child_base(key), storage_segment(k));
                write_value(txn, &child, v);
            }
        }
        Value::Array(items) => {
            txn.put(key, &BRANCH_ARRAY);
            for (i, v) in items.iter().enumerate() {
                let child = format!("{}/{}", child_base(key), path::index_segment(i));
                write_value(txn, &child, v);
            }
        }
        primitive => txn.put(key, &primitive.encode_leaf()),
    }
}

fn child_base(key: &str) -> &str {
    if key == "/" {
        ""
    } else {
        key
    }
}

fn storage_segment(seg: &str) -> String {
    if path::is_index_segment(seg) {
        path::index_segment(seg.parse().expect("index segment parses"))
    } else {
        seg.to_string()
    }
}

fn empty_compound(kind: BranchKind) -> Value {
    match kind {
        BranchKind::Object => Value::Object(BTreeMap::new()),
        BranchKind::Array => Value::Array(Vec::new()),
    }
}

/// Rebuilds a compound from its subtree scan.
///
/// `entries` are the decoded relative segment lists with their stored
/// bytes, in ascending key order; `depth` is how many segments have
/// been consumed; `kind` is the shape recorded in the branch marker,
/// if one was present.
fn assemble(entries: &[(Vec<String>, sled::IVec)], depth: usize, kind: Option<BranchKind>) -> Result<Value> {
    let mut children: Vec<(String, Value)> = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let seg = entries[i].0[depth].clone();
        let mut j = i;
        while j < entries.len() && entries[j].0[depth] == seg {
            j += 1;
        }
        let group = &entries[i..j];
        let own = group.iter().find(|(segs, _)| segs.len() == depth + 1);
        let deeper_start = own.map(|_| 1).unwrap_or(0);
        let deeper = &group[deeper_start..];
        let value = if deeper.is_empty() {
            let (_, bytes) = own.expect("group is non-empty");
            match branch_kind(bytes) {
                Some(kind) => empty_compound(kind),
                None => Value::decode_leaf(bytes)?,
            }
        } else {
            let kind = own.and_then(|(_, bytes)| branch_kind(bytes));
            assemble(deeper, depth + 1, kind)?
        };
        children.push((path::decode_key_segment(&seg).to_string(), value));
        i = j;
    }
    Ok(shape(children, kind))
}

/// Decides object vs array. A marker tag is authoritative when the
/// index set is sound; untagged subtrees fall back to the segment
/// shape heuristic.
fn shape(children: Vec<(String, Value)>, kind: Option<BranchKind>) -> Value {
    let contiguous = children
        .iter()
        .enumerate()
        .all(|(i, (seg, _))| seg == &i.to_string());
    match kind {
        Some(BranchKind::Array) | None if contiguous && !children.is_empty() => {
            Value::Array(children.into_iter().map(|(_, v)| v).collect())
        }
        _ => Value::Object(children.into_iter().collect()),
    }
}

/// Iterates the strict ancestors of a path, nearest first, root last.
struct Ancestors<'a>(Option<Path<'a>>);

impl<'a> Ancestors<'a> {
    fn of(path: Path<'a>) -> Self {
        Self(path.parent())
    }
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = Path<'a>;

    fn next(&mut self) -> Option<Path<'a>> {
        let current = self.0.take()?;
        self.0 = current.parent();
        Some(current)
    }
}
