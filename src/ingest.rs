//! Signal ingestion: normalization, content-hash dedup, and enqueueing.
//!
//! The first stage of the pipeline:
//!
//! 1. Normalize text (lowercase → trim → collapse whitespace).
//! 2. Reject signals that are too short or missing a product.
//! 3. Compute the SHA-256 identity hash of the normalized text.
//! 4. Atomically store new signals and append them to `queue:to-embed`;
//!    duplicates only bump `last_seen`.
//!
//! Concurrent ingests of the same text produce exactly one `queued`
//! outcome — the set-if-absent write and the queue append happen in a
//! single store transaction. A store failure on one item is reported in
//! that item's outcome; the batch carries on.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::models::{now_epoch, short_hash, signal_key, Signal, SignalIn};
use crate::store::{SharedStore, QUEUE_EMBED};

/// Minimum normalized length for a signal to be processable.
pub const MIN_NORMALIZED_LEN: usize = 3;

/// Normalize text for deduplication: lowercase, strip leading/trailing
/// whitespace, collapse internal whitespace runs to single spaces.
pub fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex-encoded SHA-256 of (already normalized) text.
pub fn compute_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Outcome for a single ingested signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestOutcome {
    Queued,
    Duplicate,
    Invalid,
    Error,
}

/// Per-item result within a [`BatchResult`].
#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    /// Caller-supplied id, echoed back for correlation.
    pub id: Option<String>,
    /// Content hash; empty for invalid items.
    pub hash: String,
    pub outcome: IngestOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated result of `POST /ingest`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub queued: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub errors: usize,
    /// Backpressure hint: the embed queue is past its configured bound.
    /// Nothing was dropped; operators should scale workers.
    pub delayed: bool,
    pub results: Vec<ItemResult>,
}

/// Service for ingesting signals into the pipeline.
pub struct IngestService {
    store: SharedStore,
    backpressure: u64,
}

impl IngestService {
    pub fn new(store: SharedStore, backpressure: u64) -> Self {
        Self { store, backpressure }
    }

    /// Ingest a batch of signals, one outcome per item.
    pub async fn ingest_batch(&self, signals: Vec<SignalIn>) -> BatchResult {
        let total = signals.len();
        let mut results = Vec::with_capacity(total);
        let (mut queued, mut duplicates, mut invalid, mut errors) = (0usize, 0usize, 0usize, 0usize);

        for signal in signals {
            let item = self.ingest_one(signal).await;
            match item.outcome {
                IngestOutcome::Queued => queued += 1,
                IngestOutcome::Duplicate => duplicates += 1,
                IngestOutcome::Invalid => invalid += 1,
                IngestOutcome::Error => errors += 1,
            }
            results.push(item);
        }

        let delayed = match self.store.queue_len(QUEUE_EMBED).await {
            Ok(len) => len > self.backpressure,
            Err(e) => {
                warn!(error = %e, "failed to read embed queue length");
                false
            }
        };

        info!(total, queued, duplicates, invalid, errors, "batch ingest complete");

        BatchResult {
            total,
            queued,
            duplicates,
            invalid,
            errors,
            delayed,
            results,
        }
    }

    async fn ingest_one(&self, signal: SignalIn) -> ItemResult {
        let normalized = normalize(&signal.text);

        if normalized.len() < MIN_NORMALIZED_LEN || signal.product.trim().is_empty() {
            debug!(id = ?signal.id, "signal invalid after normalization");
            return ItemResult {
                id: signal.id,
                hash: String::new(),
                outcome: IngestOutcome::Invalid,
                error: None,
            };
        }

        let hash = compute_hash(&normalized);
        let key = signal_key(&hash);
        let now = now_epoch();

        let record = Signal {
            hash: hash.clone(),
            text: signal.text.clone(),
            normalized,
            source: signal.source.clone(),
            url: signal.url.clone(),
            title: signal.title.clone(),
            author: signal.author.clone(),
            product: signal.product.clone(),
            topic_id: None,
            first_seen: now,
            last_seen: now,
        };

        let created = match self
            .store
            .create_record_and_enqueue(&key, &record.to_fields(), QUEUE_EMBED, &hash)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                warn!(hash = short_hash(&hash), error = %e, "store write failed during ingest");
                return ItemResult {
                    id: signal.id,
                    hash,
                    outcome: IngestOutcome::Error,
                    error: Some("store write failed".to_string()),
                };
            }
        };

        if created {
            debug!(hash = short_hash(&hash), "new signal stored and queued for embedding");
            return ItemResult {
                id: signal.id,
                hash,
                outcome: IngestOutcome::Queued,
                error: None,
            };
        }

        // Duplicate: bump last_seen only, never overwrite the original fields.
        if let Err(e) = self.store.set_field(&key, "last_seen", &now.to_string()).await {
            warn!(hash = short_hash(&hash), error = %e, "failed to bump last_seen on duplicate");
        }
        debug!(hash = short_hash(&hash), "duplicate signal");
        ItemResult {
            id: signal.id,
            hash,
            outcome: IngestOutcome::Duplicate,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;

    fn signal(text: &str, product: &str) -> SignalIn {
        SignalIn {
            text: text.to_string(),
            source: "forum".to_string(),
            product: product.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize("  Sync   FAILS\n\ton iOS  "), "sync fails on ios");
    }

    #[test]
    fn test_normalize_stable_hash() {
        let a = compute_hash(&normalize("Sync fails"));
        let b = compute_hash(&normalize("  sync   FAILS "));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_duplicate_ingestion() {
        let store = Arc::new(MemoryStore::new());
        let service = IngestService::new(store.clone(), 10_000);

        let result = service
            .ingest_batch(vec![signal("Sync fails", "joplin"), signal("Sync fails", "joplin")])
            .await;

        assert_eq!(result.total, 2);
        assert_eq!(result.queued, 1);
        assert_eq!(result.duplicates, 1);
        assert_eq!(result.invalid, 0);
        assert_eq!(store.queue_len(QUEUE_EMBED).await.unwrap(), 1);

        let records = store.scan_records("signal:").await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_bumps_last_seen_only() {
        let store = Arc::new(MemoryStore::new());
        let service = IngestService::new(store.clone(), 10_000);

        let first = service.ingest_batch(vec![signal("Sync fails", "joplin")]).await;
        let hash = first.results[0].hash.clone();
        let key = signal_key(&hash);

        // Tamper first_seen so we can verify it is left alone.
        store.set_field(&key, "first_seen", "100").await.unwrap();
        store.set_field(&key, "last_seen", "100").await.unwrap();

        service.ingest_batch(vec![signal("sync   FAILS", "joplin")]).await;

        let record = store.get_record(&key).await.unwrap().unwrap();
        assert_eq!(record.get("first_seen").unwrap(), "100");
        assert!(record.get("last_seen").unwrap().parse::<i64>().unwrap() > 100);
    }

    #[tokio::test]
    async fn test_invalid_signals() {
        let store = Arc::new(MemoryStore::new());
        let service = IngestService::new(store.clone(), 10_000);

        let result = service
            .ingest_batch(vec![signal("ab", "joplin"), signal("long enough text", "")])
            .await;

        assert_eq!(result.invalid, 2);
        assert_eq!(result.queued, 0);
        assert_eq!(store.queue_len(QUEUE_EMBED).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_hint() {
        let store = Arc::new(MemoryStore::new());
        let service = IngestService::new(store.clone(), 1);

        let result = service
            .ingest_batch(vec![
                signal("first unique signal", "joplin"),
                signal("second unique signal", "joplin"),
            ])
            .await;

        assert_eq!(result.queued, 2);
        assert!(result.delayed);
    }

    #[tokio::test]
    async fn test_concurrent_ingest_single_queued() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(IngestService::new(store.clone(), 10_000));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.ingest_batch(vec![signal("same exact text", "joplin")]).await
            }));
        }

        let mut queued = 0;
        let mut duplicates = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            queued += result.queued;
            duplicates += result.duplicates;
        }

        assert_eq!(queued, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(store.queue_len(QUEUE_EMBED).await.unwrap(), 1);
    }
}
