//! # Elkyn
//!
//! An embedded, tree-structured key-value store with live
//! subscriptions and declarative path-based authorization.
//!
//! ## Paths and decomposition
//! Data is addressed by filesystem-like paths (`/users/alice/email`).
//! A written value is decomposed into the ordered keyspace of the
//! backend: every primitive leaf lands under its own key in the
//! type-prefixed leaf encoding, and every compound node is recorded as
//! a two-byte branch marker carrying its shape (object or array).
//! Because the keyspace is ordered and array indices are stored with a
//! fixed width, a subtree is a single contiguous key range: reads at a
//! branch reconstruct the compound from one ascending prefix scan, and
//! recursive deletes clear one range.
//!
//! ```bnf
//! leaf   := 's' utf8 | 'n' le64 | 'b' byte | 'z' | 'm' cbor
//! branch := 't' ('o' | 'a')
//! ```
//!
//! ## Events
//! Every committed write emits exactly one event, after the backend
//! transaction commits. In-process subscribers register a callback for
//! a path pattern (optionally covering descendants) and are invoked
//! synchronously; out-of-process consumers drain a lock-free
//! single-producer/single-consumer ring that deep-copies path and
//! payload. Ring delivery is at-most-once: a full ring drops events,
//! and consumers detect the gaps through the sequence numbers.
//!
//! ## Rules
//! Authorization is a nested rule document. Reserved keys `.read`,
//! `.write` and `.validate` hold predicates; other keys are literal
//! path segments or `$var` patterns that bind the matched segment.
//! Evaluation walks the document along the path and applies the
//! deepest rule of the requested kind, falling back to the nearest
//! ancestor's rule, and denies when nothing governs the path. The
//! predicate language is a two-tier split (`||` over `&&`) of
//! `===`/`==` comparisons over `auth.*`, `$var`, `newData.*` and
//! literals.
//!
//! ## Writes
//! `set`/`delete` run synchronously inside the backend's single write
//! transaction. The optional async queue (`set_async`, `delete_async`,
//! `wait_for_write`) pushes operations through one worker thread,
//! which preserves per-path submission order, and records per-op
//! outcomes for later pickup.
//!
//! ```
//! use elkyn::{Engine, Value};
//!
//! let engine = Engine::memory()?;
//! engine.set("/users/alice", Value::from_json(br#"{"name":"Alice","age":30}"#)?, None)?;
//! assert_eq!(engine.get("/users/alice/name", None)?, Value::String("Alice".into()));
//! # Ok::<(), elkyn::Error>(())
//! ```

mod auth;
mod engine;
mod error;
mod eval;
mod kv;
mod path;
#[cfg(test)]
mod props;
mod queue;
mod ring;
mod rules;
mod subscriber;
mod tree;
mod value;

pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::eval::{AuthContext, Expr};
pub use crate::path::{Path, PathBuf};
pub use crate::queue::OpId;
pub use crate::ring::{RingConsumer, RingEvent, RING_CAPACITY};
pub use crate::rules::{ChildKey, PathRules, RuleKind, Rules};
pub use crate::subscriber::{Event, EventKind, EventStream, SubId};
pub use crate::tree::TreeStore;
pub use crate::value::{BranchKind, Value};
