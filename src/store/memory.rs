//! In-memory [`Store`] implementation for tests and the `memory` URL.
//!
//! All state lives behind a single `std::sync::Mutex`, which makes the
//! compound operations trivially atomic. Vector search is brute-force
//! cosine over the index's entries.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;

use super::{RecordWrite, Store, VectorHit};

#[derive(Default)]
struct IndexData {
    dim: usize,
    entries: HashMap<String, IndexEntry>,
}

struct IndexEntry {
    vector: Vec<f32>,
    filters: BTreeMap<String, String>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, BTreeMap<String, String>>,
    queues: HashMap<String, VecDeque<String>>,
    indices: HashMap<String, IndexData>,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn guard_matches(inner: &Inner, key: &str, field: &str, expected: &str) -> bool {
    let current = inner
        .records
        .get(key)
        .and_then(|r| r.get(field))
        .map(|v| v.as_str())
        .unwrap_or("");
    current == expected
}

fn apply_writes(inner: &mut Inner, writes: &[RecordWrite]) {
    for write in writes {
        let record = inner.records.entry(write.key.clone()).or_default();
        for (field, value) in &write.fields {
            record.insert(field.clone(), value.clone());
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn put_record(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.records.insert(key.to_string(), fields.clone());
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.get(key).cloned())
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .records
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn incr_field(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.records.entry(key.to_string()).or_default();
        let current: i64 = record
            .get(field)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + delta;
        record.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn delete_record(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.records.remove(key).is_some())
    }

    async fn scan_records(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, BTreeMap<String, String>)>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<(String, BTreeMap<String, String>)> = inner
            .records
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn create_record_and_enqueue(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        queue: &str,
        item: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.records.contains_key(key) {
            return Ok(false);
        }
        inner.records.insert(key.to_string(), fields.clone());
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(item.to_string());
        Ok(true)
    }

    async fn update_guarded(
        &self,
        guard_key: &str,
        guard_field: &str,
        expected: &str,
        writes: &[RecordWrite],
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if !guard_matches(&inner, guard_key, guard_field, expected) {
            return Ok(false);
        }
        apply_writes(&mut inner, writes);
        Ok(true)
    }

    async fn queue_push(&self, queue: &str, item: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(item.to_string());
        Ok(())
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .queues
            .get_mut(queue)
            .and_then(|q| q.pop_front()))
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.queues.get(queue).map(|q| q.len() as u64).unwrap_or(0))
    }

    async fn declare_index(&self, index: &str, dim: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.indices.get(index) {
            Some(existing) if existing.dim != dim => bail!(
                "index '{}' already declared with dim {}, requested {}",
                index,
                existing.dim,
                dim
            ),
            Some(_) => Ok(()),
            None => {
                inner.indices.insert(
                    index.to_string(),
                    IndexData {
                        dim,
                        entries: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn index_upsert(
        &self,
        index: &str,
        key: &str,
        vector: &[f32],
        filters: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let data = inner
            .indices
            .get_mut(index)
            .ok_or_else(|| anyhow::anyhow!("index '{}' not declared", index))?;
        if vector.len() != data.dim {
            bail!(
                "vector width mismatch for index '{}': got {}, expected {}",
                index,
                vector.len(),
                data.dim
            );
        }
        data.entries.insert(
            key.to_string(),
            IndexEntry {
                vector: vector.to_vec(),
                filters: filters.clone(),
            },
        );
        Ok(())
    }

    async fn index_search(
        &self,
        index: &str,
        query: &[f32],
        k: usize,
        filters: &[(&str, &str)],
    ) -> Result<Vec<VectorHit>> {
        let inner = self.inner.lock().unwrap();
        let data = match inner.indices.get(index) {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };
        if query.len() != data.dim {
            bail!(
                "query width mismatch for index '{}': got {}, expected {}",
                index,
                query.len(),
                data.dim
            );
        }
        let mut hits: Vec<VectorHit> = data
            .entries
            .iter()
            .filter(|(_, entry)| {
                filters.iter().all(|(field, value)| {
                    entry.filters.get(*field).map(|v| v.as_str()) == Some(*value)
                })
            })
            .map(|(key, entry)| VectorHit {
                key: key.clone(),
                similarity: cosine_similarity(query, &entry.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.key.cmp(&b.key))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn index_remove(&self, index: &str, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .indices
            .get_mut(index)
            .map(|d| d.entries.remove(key).is_some())
            .unwrap_or(false))
    }
}
