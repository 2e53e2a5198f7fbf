//! Storage abstraction for the Darwin pipeline.
//!
//! The [`Store`] trait covers the three shapes of state the pipeline needs:
//! flat field-map **records**, durable FIFO **queues**, and flat cosine
//! **vector indices**. Two backends implement it:
//!
//! - [`memory::MemoryStore`] — in-process, for tests and the `memory` URL.
//! - [`sqlite::SqliteStore`] — durable, WAL-mode SQLite via `sqlx`.
//!
//! Queues are backed by the store (not in-process channels) so in-flight
//! work survives a restart. Vector search is brute-force cosine over the
//! index's rows; indices are rebuildable from records, so dropping one is
//! safe.
//!
//! # Atomicity
//!
//! Two compound operations carry the pipeline's correctness invariants:
//!
//! - [`create_record_and_enqueue`](Store::create_record_and_enqueue) —
//!   set-if-absent plus queue append in one transaction. Concurrent ingests
//!   of the same content hash produce exactly one queued entry.
//! - [`update_guarded`](Store::update_guarded) — a multi-record conditional
//!   write: all writes apply only if a guard field still holds its expected
//!   value. This backs optimistic centroid updates (guarded on
//!   `signal_count`) and `fix_status` compare-and-set transitions.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

// Queue names (FIFO lists).
pub const QUEUE_EMBED: &str = "queue:to-embed";
pub const QUEUE_CLASSIFY: &str = "queue:to-classify";
pub const QUEUE_TRIAGE: &str = "queue:triage";
pub const QUEUE_EMBED_DEAD: &str = "queue:to-embed:dead";
pub const QUEUE_CLASSIFY_DEAD: &str = "queue:to-classify:dead";

// Vector indices.
pub const IDX_TOPICS: &str = "idx:topics";
pub const IDX_FIXES: &str = "idx:successful_fixes";

/// A single hit from a vector-index search.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub key: String,
    pub similarity: f32,
}

/// One record write inside an [`update_guarded`](Store::update_guarded)
/// transaction. Fields are merged into the existing record (created if
/// absent); untouched fields keep their values.
#[derive(Debug, Clone)]
pub struct RecordWrite {
    pub key: String,
    pub fields: BTreeMap<String, String>,
}

impl RecordWrite {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn set_all(mut self, fields: BTreeMap<String, String>) -> Self {
        self.fields.extend(fields);
        self
    }
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put_record`](Store::put_record) | Write a full record (replace) |
/// | [`get_record`](Store::get_record) | Read a record's field map |
/// | [`set_field`](Store::set_field) | Update a single field |
/// | [`incr_field`](Store::incr_field) | Atomic integer increment |
/// | [`delete_record`](Store::delete_record) | Remove a record |
/// | [`scan_records`](Store::scan_records) | List records by key prefix |
/// | [`create_record_and_enqueue`](Store::create_record_and_enqueue) | Dedup write + enqueue |
/// | [`update_guarded`](Store::update_guarded) | Conditional multi-record write |
/// | [`queue_push`](Store::queue_push) / [`queue_pop`](Store::queue_pop) / [`queue_len`](Store::queue_len) | FIFO queues |
/// | [`declare_index`](Store::declare_index) | Declare a vector index (flat, cosine, fixed dim) |
/// | [`index_upsert`](Store::index_upsert) / [`index_search`](Store::index_search) / [`index_remove`](Store::index_remove) | Vector ops |
#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap connectivity check for `/health`.
    async fn ping(&self) -> Result<()>;

    async fn put_record(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<()>;

    async fn get_record(&self, key: &str) -> Result<Option<BTreeMap<String, String>>>;

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Atomically add `delta` to an integer field (missing counts as 0).
    /// Returns the new value.
    async fn incr_field(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn delete_record(&self, key: &str) -> Result<bool>;

    /// All records whose key starts with `prefix`, in key order.
    async fn scan_records(&self, prefix: &str)
        -> Result<Vec<(String, BTreeMap<String, String>)>>;

    /// Write `fields` under `key` only if no record exists, and append
    /// `item` to `queue` in the same transaction. Returns `true` when the
    /// record was created (and enqueued), `false` when it already existed.
    async fn create_record_and_enqueue(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        queue: &str,
        item: &str,
    ) -> Result<bool>;

    /// Apply every write in `writes` only if `guard_key`'s `guard_field`
    /// currently equals `expected` (a missing record or field compares as
    /// the empty string). Returns whether the writes were applied.
    async fn update_guarded(
        &self,
        guard_key: &str,
        guard_field: &str,
        expected: &str,
        writes: &[RecordWrite],
    ) -> Result<bool>;

    async fn queue_push(&self, queue: &str, item: &str) -> Result<()>;

    async fn queue_pop(&self, queue: &str) -> Result<Option<String>>;

    async fn queue_len(&self, queue: &str) -> Result<u64>;

    /// Declare a flat cosine index of fixed width. Idempotent; declaring
    /// an existing index with a different width is an invariant violation.
    async fn declare_index(&self, index: &str, dim: usize) -> Result<()>;

    async fn index_upsert(
        &self,
        index: &str,
        key: &str,
        vector: &[f32],
        filters: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// K-nearest-neighbor search by cosine similarity, restricted to
    /// entries whose filter fields exactly match every `(field, value)`
    /// pair. Results are ordered by similarity descending, ties broken by
    /// key ascending so searches are deterministic.
    async fn index_search(
        &self,
        index: &str,
        query: &[f32],
        k: usize,
        filters: &[(&str, &str)],
    ) -> Result<Vec<VectorHit>>;

    async fn index_remove(&self, index: &str, key: &str) -> Result<bool>;
}

/// Shared handle used across services and workers.
pub type SharedStore = Arc<dyn Store>;

/// Open a store from a connection URL: `memory` or `sqlite:<path>`.
pub async fn connect(url: &str) -> Result<SharedStore> {
    if url == "memory" {
        return Ok(Arc::new(memory::MemoryStore::new()));
    }
    if let Some(path) = url.strip_prefix("sqlite:") {
        let store = sqlite::SqliteStore::connect(path).await?;
        return Ok(Arc::new(store));
    }
    bail!("Unknown store URL: '{}'. Use 'memory' or 'sqlite:<path>'.", url)
}
