//! Online nearest-neighbor clustering of signals into topics.
//!
//! For each embedded signal the clusterer runs a KNN query over open
//! topics for the signal's product and decides:
//!
//! - similarity ≥ `threshold_high` → **attach** to the best topic
//! - `threshold_low` ≤ similarity < `threshold_high` → **triage** (the
//!   signal hash goes to `queue:triage`, `topic_id` stays unset)
//! - otherwise → **new topic** seeded with this signal's embedding
//!
//! # Centroid discipline
//!
//! A topic's centroid is the unit-normalized running mean of its signals'
//! embeddings. Updates are optimistic: `signal_count` doubles as the
//! version token, and the conditional write that bumps it also sets the
//! signal's `topic_id` — a signal therefore contributes to exactly one
//! centroid exactly once, no matter how many workers race, and the mean
//! stays order-independent.
//!
//! # Determinism
//!
//! Topics tying on similarity within 1e-6 are broken by `(created_at asc,
//! id asc)`, so replaying a fixed signal sequence reproduces the same
//! clustering regardless of how the queue was drained.

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::embedding::{unit_normalize, vec_to_hex};
use crate::models::{now_epoch, short_hash, signal_key, topic_key, Signal, Topic, TopicStatus};
use crate::store::{RecordWrite, SharedStore, IDX_TOPICS, QUEUE_TRIAGE};

/// Similarity window within which topics are considered tied.
const TIE_EPSILON: f32 = 1e-6;

/// Maximum length of an auto-generated topic title.
const TITLE_MAX_CHARS: usize = 120;

/// Outcome of clustering one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterDecision {
    /// Signal joined an existing topic.
    Attached { topic_id: String, similarity: f32 },
    /// Best neighbor fell in the ambiguous band; parked for human triage.
    Triaged { best_similarity: Option<f32> },
    /// No topic was close enough; a new one was promoted.
    Created { topic_id: String },
    /// Another worker assigned this signal first; nothing to do.
    AlreadyAssigned { topic_id: String },
}

pub struct Clusterer {
    store: SharedStore,
    threshold_high: f32,
    threshold_low: f32,
}

impl Clusterer {
    pub fn new(store: SharedStore, config: &ClusterConfig) -> Self {
        Self {
            store,
            threshold_high: config.threshold_high,
            threshold_low: config.threshold_low,
        }
    }

    /// Cluster one embedded signal. `vector` must be unit-normalized.
    pub async fn assign_signal(
        &self,
        signal: &Signal,
        vector: &[f32],
    ) -> Result<ClusterDecision> {
        let hits = self
            .store
            .index_search(
                IDX_TOPICS,
                vector,
                5,
                &[("status", "open"), ("product", signal.product.as_str())],
            )
            .await?;

        let best = match hits.first() {
            Some(hit) => hit.clone(),
            None => return self.create_topic(signal, vector).await,
        };

        if best.similarity >= self.threshold_high {
            let topic_id = self.break_ties(&hits, best.similarity).await?;
            return self.attach(signal, &topic_id, vector, best.similarity).await;
        }

        if best.similarity >= self.threshold_low {
            self.store.queue_push(QUEUE_TRIAGE, &signal.hash).await?;
            debug!(
                hash = short_hash(&signal.hash),
                similarity = best.similarity,
                "signal parked for triage"
            );
            return Ok(ClusterDecision::Triaged {
                best_similarity: Some(best.similarity),
            });
        }

        self.create_topic(signal, vector).await
    }

    /// Among hits tying with the best similarity (within 1e-6), pick the
    /// topic with the earliest `created_at`, then the smallest id.
    async fn break_ties(
        &self,
        hits: &[crate::store::VectorHit],
        best_similarity: f32,
    ) -> Result<String> {
        let tied: Vec<&crate::store::VectorHit> = hits
            .iter()
            .filter(|h| best_similarity - h.similarity <= TIE_EPSILON)
            .collect();
        if tied.len() == 1 {
            return Ok(tied[0].key.clone());
        }

        let mut winner: Option<(i64, String)> = None;
        for hit in tied {
            let created_at = match self.store.get_record(&topic_key(&hit.key)).await? {
                Some(fields) => fields
                    .get("created_at")
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(i64::MAX),
                None => continue,
            };
            let candidate = (created_at, hit.key.clone());
            winner = Some(match winner {
                Some(current) if current <= candidate => current,
                _ => candidate,
            });
        }
        winner
            .map(|(_, id)| id)
            .ok_or_else(|| anyhow!("tie-break candidates vanished from the store"))
    }

    async fn attach(
        &self,
        signal: &Signal,
        topic_id: &str,
        vector: &[f32],
        similarity: f32,
    ) -> Result<ClusterDecision> {
        let tkey = topic_key(topic_id);
        let skey = signal_key(&signal.hash);

        loop {
            // Re-check assignment each round: a concurrent worker may have
            // finished this signal while we were losing the version race.
            let current = self
                .store
                .get_record(&skey)
                .await?
                .ok_or_else(|| anyhow!("signal {} disappeared during attach", signal.hash))?;
            if let Some(existing) = current.get("topic_id").filter(|v| !v.is_empty()) {
                return Ok(ClusterDecision::AlreadyAssigned {
                    topic_id: existing.clone(),
                });
            }

            let topic_fields = self
                .store
                .get_record(&tkey)
                .await?
                .ok_or_else(|| anyhow!("topic {} disappeared during attach", topic_id))?;
            let topic = Topic::from_fields(&topic_fields)?;
            if vector.len() != topic.centroid.len() {
                return Err(anyhow!(
                    "centroid width mismatch on topic {}: {} vs {}",
                    topic_id,
                    topic.centroid.len(),
                    vector.len()
                ));
            }

            let n = topic.signal_count;
            let merged: Vec<f32> = topic
                .centroid
                .iter()
                .zip(vector.iter())
                .map(|(c, v)| (c * n as f32 + v) / (n as f32 + 1.0))
                .collect();
            let new_centroid = unit_normalize(&merged);
            let now = now_epoch();

            let applied = self
                .store
                .update_guarded(
                    &tkey,
                    "signal_count",
                    &n.to_string(),
                    &[
                        RecordWrite::new(tkey.clone())
                            .set("centroid", vec_to_hex(&new_centroid))
                            .set("signal_count", (n + 1).to_string())
                            .set("updated_at", now.to_string()),
                        RecordWrite::new(skey.clone()).set("topic_id", topic_id),
                    ],
                )
                .await?;

            if applied {
                // Refresh the index copy; records stay the source of truth,
                // so a crash here only leaves a stale (rebuildable) index.
                self.store
                    .index_upsert(
                        IDX_TOPICS,
                        topic_id,
                        &new_centroid,
                        &index_filters(topic.status, &topic.product),
                    )
                    .await?;
                info!(
                    hash = short_hash(&signal.hash),
                    topic_id,
                    similarity,
                    signal_count = n + 1,
                    "signal attached to topic"
                );
                return Ok(ClusterDecision::Attached {
                    topic_id: topic_id.to_string(),
                    similarity,
                });
            }

            debug!(topic_id, "centroid version conflict, retrying attach");
        }
    }

    async fn create_topic(&self, signal: &Signal, vector: &[f32]) -> Result<ClusterDecision> {
        let topic_id = Uuid::new_v4().to_string();
        let now = now_epoch();
        let topic = Topic {
            id: topic_id.clone(),
            title: derive_title(&signal.text),
            summary: String::new(),
            status: TopicStatus::Open,
            product: signal.product.clone(),
            category: None,
            signal_count: 1,
            centroid: vector.to_vec(),
            created_at: now,
            updated_at: now,
        };

        let skey = signal_key(&signal.hash);
        // The guard on the signal's empty topic_id makes promotion
        // exactly-once under duplicate queue delivery.
        let applied = self
            .store
            .update_guarded(
                &skey,
                "topic_id",
                "",
                &[
                    RecordWrite::new(topic_key(&topic_id)).set_all(topic.to_fields()),
                    RecordWrite::new(skey.clone()).set("topic_id", topic_id.clone()),
                ],
            )
            .await?;

        if !applied {
            let assigned = self
                .store
                .get_record(&skey)
                .await?
                .and_then(|f| f.get("topic_id").cloned())
                .unwrap_or_default();
            warn!(hash = short_hash(&signal.hash), "signal already assigned while promoting topic");
            return Ok(ClusterDecision::AlreadyAssigned { topic_id: assigned });
        }

        self.store
            .index_upsert(
                IDX_TOPICS,
                &topic_id,
                vector,
                &index_filters(TopicStatus::Open, &signal.product),
            )
            .await?;

        info!(hash = short_hash(&signal.hash), topic_id, "promoted new topic");
        Ok(ClusterDecision::Created { topic_id })
    }
}

/// Filter fields stored alongside a topic's centroid in `idx:topics`.
pub fn index_filters(
    status: TopicStatus,
    product: &str,
) -> std::collections::BTreeMap<String, String> {
    let mut filters = std::collections::BTreeMap::new();
    filters.insert("status".to_string(), status.as_str().to_string());
    filters.insert("product".to_string(), product.to_string());
    filters
}

/// Topic title for a freshly promoted cluster: the first line of the
/// seeding signal's raw text, truncated to 120 characters.
fn derive_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    first_line.chars().take(TITLE_MAX_CHARS).collect()
}
