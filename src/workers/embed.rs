//! The embed worker: drains `queue:to-embed`, embeds signals, and applies
//! cluster decisions.
//!
//! Per item:
//! 1. Pop a signal hash (sleep on an empty queue).
//! 2. Load the signal; skip if it is already attached (idempotent
//!    re-processing) or missing.
//! 3. Embed the normalized text, retrying with exponential backoff; after
//!    the retry budget the hash moves to `queue:to-embed:dead` with a
//!    reason.
//! 4. Hand the vector to the clusterer; a promoted topic is pushed to
//!    `queue:to-classify`.
//!
//! Store errors never dead-letter — they are retried indefinitely with
//! capped backoff, pausing the loop until the store recovers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cluster::{ClusterDecision, Clusterer};
use crate::config::WorkerConfig;
use crate::embedding::Embedder;
use crate::models::{short_hash, signal_key, Signal};
use crate::store::{SharedStore, QUEUE_CLASSIFY, QUEUE_EMBED, QUEUE_EMBED_DEAD};
use crate::workers::{backoff_delay, dead_letter_entry, sleep_or_shutdown};

pub struct EmbedWorker {
    pub store: SharedStore,
    pub embedder: Arc<dyn Embedder>,
    pub clusterer: Arc<Clusterer>,
    pub config: WorkerConfig,
}

impl EmbedWorker {
    /// Worker loop; returns `Ok(())` on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let store = &self.store;
            let popped = self
                .with_store_retry(&mut shutdown, move || async move {
                    store.queue_pop(QUEUE_EMBED).await
                })
                .await;
            let hash = match popped {
                Some(Some(hash)) => hash,
                Some(None) => {
                    if sleep_or_shutdown(&mut shutdown, poll).await {
                        return Ok(());
                    }
                    continue;
                }
                None => return Ok(()), // shutdown while store was down
            };

            self.process_one(&hash, &mut shutdown).await;
        }
    }

    /// Process a single queue item. Public so operators and tests can
    /// drive the pipeline one step at a time.
    pub async fn process_one(&self, hash: &str, shutdown: &mut watch::Receiver<bool>) {
        let key = signal_key(hash);
        let record = {
            let store = &self.store;
            let key = key.as_str();
            self.with_store_retry(shutdown, move || async move { store.get_record(key).await })
                .await
        };
        let record = match record {
            Some(record) => record,
            None => return,
        };

        let fields = match record {
            Some(fields) => fields,
            None => {
                // The enqueue happens in the same transaction as the
                // write, so a missing record means it was deleted.
                warn!(hash = short_hash(hash), "queued signal missing from store, dropped");
                return;
            }
        };
        let signal = match Signal::from_fields(&fields) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(hash = short_hash(hash), error = %e, "corrupt signal record dead-lettered");
                self.dead_letter(hash, &format!("corrupt record: {}", e), shutdown)
                    .await;
                return;
            }
        };

        if signal.topic_id.is_some() {
            debug!(hash = short_hash(hash), "signal already clustered, skipping");
            return;
        }

        let vector = match self.embed_with_retry(&signal, shutdown).await {
            Some(vector) => vector,
            None => return,
        };

        // Clustering only touches the store; failures here are store
        // failures and get the indefinite-retry treatment.
        let decision = {
            let clusterer = &self.clusterer;
            let signal = &signal;
            let vector = vector.as_slice();
            self.with_store_retry(shutdown, move || async move {
                clusterer.assign_signal(signal, vector).await
            })
            .await
        };

        if let Some(ClusterDecision::Created { topic_id }) = decision {
            let store = &self.store;
            let topic_id = topic_id.as_str();
            self.with_store_retry(shutdown, move || async move {
                store.queue_push(QUEUE_CLASSIFY, topic_id).await
            })
            .await;
        }
    }

    /// Embed with the bounded retry schedule; dead-letter on exhaustion.
    async fn embed_with_retry(
        &self,
        signal: &Signal,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Vec<f32>> {
        let mut last_err = String::new();
        for attempt in 0..=self.config.embed_max_retries {
            if attempt > 0 {
                let delay = backoff_delay(
                    attempt - 1,
                    self.config.backoff_base_ms,
                    self.config.backoff_cap_ms,
                );
                if sleep_or_shutdown(shutdown, delay).await {
                    // Not yet committed anywhere; the hash was already
                    // popped, so requeue it for the next run.
                    let _ = self.store.queue_push(QUEUE_EMBED, &signal.hash).await;
                    return None;
                }
            }
            match self.embedder.embed(&signal.normalized).await {
                Ok(vector) => return Some(vector),
                Err(e) => {
                    last_err = e.to_string();
                    warn!(
                        hash = short_hash(&signal.hash),
                        attempt,
                        error = %e,
                        "embedding attempt failed"
                    );
                }
            }
        }

        self.dead_letter(
            &signal.hash,
            &format!("embedding failed after retries: {}", last_err),
            shutdown,
        )
        .await;
        None
    }

    async fn dead_letter(&self, hash: &str, reason: &str, shutdown: &mut watch::Receiver<bool>) {
        let entry = dead_letter_entry(hash, reason);
        let store = &self.store;
        let entry = entry.as_str();
        self.with_store_retry(shutdown, move || async move {
            store.queue_push(QUEUE_EMBED_DEAD, entry).await
        })
        .await;
        warn!(hash = short_hash(hash), reason, "signal dead-lettered");
    }

    /// Run a store operation, retrying indefinitely with capped backoff.
    /// Returns `None` only when shutdown interrupts the retry loop.
    async fn with_store_retry<T, F, Fut>(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        op: F,
    ) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(attempt, error = %e, "store operation failed, backing off");
                    let delay = backoff_delay(
                        attempt,
                        self.config.backoff_base_ms,
                        self.config.backoff_cap_ms,
                    );
                    attempt = attempt.saturating_add(1);
                    if sleep_or_shutdown(shutdown, delay).await {
                        return None;
                    }
                }
            }
        }
    }
}
