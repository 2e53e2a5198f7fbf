//! Durable [`Store`] backend on SQLite (WAL mode) via `sqlx`.
//!
//! # Schema
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `records` | `(key, fields)` — field maps serialized as JSON |
//! | `queues` | FIFO lists, ordered by rowid |
//! | `vector_indices` | Declared index widths |
//! | `vectors` | `(index_name, key, embedding BLOB, filters JSON)` |
//!
//! All migrations use `CREATE ... IF NOT EXISTS` and are safe to re-run.
//! Compound operations run inside transactions; SQLite's writer lock makes
//! the read-modify-write sequences atomic with respect to other
//! connections.
//!
//! Vector search loads the index's rows and ranks by cosine in Rust — a
//! flat index, which is what the record counts here call for.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};

use super::{RecordWrite, Store, VectorHit};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and run the
    /// idempotent migrations.
    pub async fn connect(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // A single connection serializes the guarded read-modify-write
        // transactions; with a larger pool two deferred transactions can
        // both pass a guard before either write lands.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open sqlite store")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                fields TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                item TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queues_queue ON queues(queue, id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_indices (
                index_name TEXT PRIMARY KEY,
                dim INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                index_name TEXT NOT NULL,
                key TEXT NOT NULL,
                embedding BLOB NOT NULL,
                filters TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (index_name, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn encode_fields(fields: &BTreeMap<String, String>) -> Result<String> {
    serde_json::to_string(fields).context("failed to serialize record fields")
}

fn decode_fields(raw: &str) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(raw).context("failed to parse record fields")
}

async fn read_fields_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &str,
) -> Result<Option<BTreeMap<String, String>>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT fields FROM records WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
    raw.map(|r| decode_fields(&r)).transpose()
}

async fn write_fields_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &str,
    fields: &BTreeMap<String, String>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO records (key, fields) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET fields = excluded.fields
        "#,
    )
    .bind(key)
    .bind(encode_fields(fields)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_record(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO records (key, fields) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET fields = excluded.fields
            "#,
        )
        .bind(key)
        .bind(encode_fields(fields)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT fields FROM records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        raw.map(|r| decode_fields(&r)).transpose()
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut fields = read_fields_tx(&mut tx, key).await?.unwrap_or_default();
        fields.insert(field.to_string(), value.to_string());
        write_fields_tx(&mut tx, key, &fields).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn incr_field(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let mut fields = read_fields_tx(&mut tx, key).await?.unwrap_or_default();
        let current: i64 = fields.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + delta;
        fields.insert(field.to_string(), next.to_string());
        write_fields_tx(&mut tx, key, &fields).await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn delete_record(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan_records(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, BTreeMap<String, String>)>> {
        // LIKE with escaped wildcards so prefixes containing '_' or '%'
        // (key separators never do, but rule products might) match exactly.
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let rows = sqlx::query(
            "SELECT key, fields FROM records WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let raw: String = row.get("fields");
            out.push((key, decode_fields(&raw)?));
        }
        Ok(out)
    }

    async fn create_record_and_enqueue(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        queue: &str,
        item: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query("INSERT OR IGNORE INTO records (key, fields) VALUES (?, ?)")
            .bind(key)
            .bind(encode_fields(fields)?)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if inserted == 0 {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query("INSERT INTO queues (queue, item) VALUES (?, ?)")
            .bind(queue)
            .bind(item)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn update_guarded(
        &self,
        guard_key: &str,
        guard_field: &str,
        expected: &str,
        writes: &[RecordWrite],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let guard = read_fields_tx(&mut tx, guard_key).await?;
        let current = guard
            .as_ref()
            .and_then(|r| r.get(guard_field))
            .map(|v| v.as_str())
            .unwrap_or("");
        if current != expected {
            tx.commit().await?;
            return Ok(false);
        }

        for write in writes {
            let mut fields = read_fields_tx(&mut tx, &write.key).await?.unwrap_or_default();
            for (field, value) in &write.fields {
                fields.insert(field.clone(), value.clone());
            }
            write_fields_tx(&mut tx, &write.key, &fields).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn queue_push(&self, queue: &str, item: &str) -> Result<()> {
        sqlx::query("INSERT INTO queues (queue, item) VALUES (?, ?)")
            .bind(queue)
            .bind(item)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<String>> {
        // Single-statement pop keeps concurrent poppers from claiming the
        // same row.
        let row = sqlx::query(
            r#"
            DELETE FROM queues
            WHERE id = (SELECT id FROM queues WHERE queue = ? ORDER BY id LIMIT 1)
            RETURNING item
            "#,
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("item")))
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queues WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn declare_index(&self, index: &str, dim: usize) -> Result<()> {
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT dim FROM vector_indices WHERE index_name = ?")
                .bind(index)
                .fetch_optional(&self.pool)
                .await?;
        match existing {
            Some(d) if d as usize != dim => bail!(
                "index '{}' already declared with dim {}, requested {}",
                index,
                d,
                dim
            ),
            Some(_) => Ok(()),
            None => {
                sqlx::query("INSERT INTO vector_indices (index_name, dim) VALUES (?, ?)")
                    .bind(index)
                    .bind(dim as i64)
                    .execute(&self.pool)
                    .await?;
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
        let dim: i64 = sqlx::query_scalar("SELECT dim FROM vector_indices WHERE index_name = ?")
            .bind(index)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("index '{}' not declared", index))?;
        if vector.len() != dim as usize {
            bail!(
                "vector width mismatch for index '{}': got {}, expected {}",
                index,
                vector.len(),
                dim
            );
        }

        sqlx::query(
            r#"
            INSERT INTO vectors (index_name, key, embedding, filters) VALUES (?, ?, ?, ?)
            ON CONFLICT(index_name, key) DO UPDATE SET
                embedding = excluded.embedding,
                filters = excluded.filters
            "#,
        )
        .bind(index)
        .bind(key)
        .bind(vec_to_blob(vector))
        .bind(serde_json::to_string(filters)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn index_search(
        &self,
        index: &str,
        query: &[f32],
        k: usize,
        filters: &[(&str, &str)],
    ) -> Result<Vec<VectorHit>> {
        let dim: Option<i64> =
            sqlx::query_scalar("SELECT dim FROM vector_indices WHERE index_name = ?")
                .bind(index)
                .fetch_optional(&self.pool)
                .await?;
        let dim = match dim {
            Some(d) => d as usize,
            None => return Ok(Vec::new()),
        };
        if query.len() != dim {
            bail!(
                "query width mismatch for index '{}': got {}, expected {}",
                index,
                query.len(),
                dim
            );
        }

        let rows = sqlx::query("SELECT key, embedding, filters FROM vectors WHERE index_name = ?")
            .bind(index)
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::new();
        for row in rows {
            let entry_filters: BTreeMap<String, String> =
                serde_json::from_str(row.get::<String, _>("filters").as_str())
                    .unwrap_or_default();
            let matches = filters.iter().all(|(field, value)| {
                entry_filters.get(*field).map(|v| v.as_str()) == Some(*value)
            });
            if !matches {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            hits.push(VectorHit {
                key: row.get("key"),
                similarity: cosine_similarity(query, &vector),
            });
        }

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
        let result = sqlx::query("DELETE FROM vectors WHERE index_name = ? AND key = ?")
            .bind(index)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
