//! Core record types flowing through the Darwin pipeline.
//!
//! Every record is persisted as a flat `field → string` map so it can live
//! in the in-memory store or a durable backend interchangeably. The typed
//! structs here own the conversion in both directions; parsing from the
//! store validates enumerations and numeric fields, so a corrupt record
//! surfaces as an error instead of a silently wrong state.
//!
//! ```text
//! SignalIn → normalize() → Signal → cluster() → Topic
//!                                        ↓
//!                                   classify() → Task → fix() → PR
//!                                                          ↓
//!                                       SuccessfulFix / Rule (learning)
//! ```
//!
//! Timestamps are Unix epoch seconds (`i64`). Vectors embedded in records
//! use the canonical little-endian f32 hex encoding from
//! [`crate::embedding::vec_to_hex`], decoded on read.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::embedding::{hex_to_vec, vec_to_hex};

// ============ Keys ============

/// Key for a signal record: `signal:{sha256(normalized_text)}`.
pub fn signal_key(hash: &str) -> String {
    format!("signal:{}", hash)
}

/// Key for a topic record: `topic:{uuid}`.
pub fn topic_key(id: &str) -> String {
    format!("topic:{}", id)
}

/// Key for a task record: `task:{uuid}`.
pub fn task_key(id: &str) -> String {
    format!("task:{}", id)
}

/// Key for a successful-fix record: `fix:success:{task_id}`.
pub fn fix_success_key(task_id: &str) -> String {
    format!("fix:success:{}", task_id)
}

/// Key for a rule record: `rule:{product}:{uuid}`.
pub fn rule_key(product: &str, id: &str) -> String {
    format!("rule:{}:{}", product, id)
}

// ============ Enumerations ============

/// Classification outcome for a topic / task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskCategory {
    Bug,
    Feature,
    Ux,
    Other,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Bug => "BUG",
            TaskCategory::Feature => "FEATURE",
            TaskCategory::Ux => "UX",
            TaskCategory::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUG" => Ok(TaskCategory::Bug),
            "FEATURE" => Ok(TaskCategory::Feature),
            "UX" => Ok(TaskCategory::Ux),
            "OTHER" => Ok(TaskCategory::Other),
            other => bail!("unknown task category: '{}'", other),
        }
    }

    /// Actionable categories produce tasks; `OTHER` only annotates the topic.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, TaskCategory::Other)
    }
}

/// Lifecycle of a topic cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    Open,
    Closed,
}

impl TopicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicStatus::Open => "open",
            TopicStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(TopicStatus::Open),
            "closed" => Ok(TopicStatus::Closed),
            other => bail!("unknown topic status: '{}'", other),
        }
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(TaskStatus::Open),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            other => bail!("unknown task status: '{}'", other),
        }
    }
}

/// Fix-execution state, guarded by compare-and-set transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    None,
    Running,
    Completed,
    Failed,
}

impl FixStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixStatus::None => "none",
            FixStatus::Running => "running",
            FixStatus::Completed => "completed",
            FixStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(FixStatus::None),
            "running" => Ok(FixStatus::Running),
            "completed" => Ok(FixStatus::Completed),
            "failed" => Ok(FixStatus::Failed),
            other => bail!("unknown fix status: '{}'", other),
        }
    }
}

/// What kind of guidance a rule captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Style,
    Convention,
    Workflow,
    Constraint,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::Style => "style",
            RuleCategory::Convention => "convention",
            RuleCategory::Workflow => "workflow",
            RuleCategory::Constraint => "constraint",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "style" => Ok(RuleCategory::Style),
            "convention" => Ok(RuleCategory::Convention),
            "workflow" => Ok(RuleCategory::Workflow),
            "constraint" => Ok(RuleCategory::Constraint),
            other => bail!("unknown rule category: '{}'", other),
        }
    }
}

/// Where a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Manual,
    ReviewFeedback,
}

impl RuleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSource::Manual => "manual",
            RuleSource::ReviewFeedback => "review_feedback",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(RuleSource::Manual),
            "review_feedback" => Ok(RuleSource::ReviewFeedback),
            other => bail!("unknown rule source: '{}'", other),
        }
    }
}

// ============ Wire format ============

/// Inbound signal as delivered by scraper adapters (`POST /ingest`).
///
/// `text`, `source`, and `product` are required by the wire contract, but
/// they default to empty so a malformed item yields a per-item `invalid`
/// outcome instead of failing the whole batch. Fields beyond this set are
/// ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalIn {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

// ============ Records ============

/// A single deduplicated piece of user feedback.
///
/// Identity is exactly `sha256(normalize(text))`; two ingests of the same
/// normalized text share one record, with `last_seen` bumped on the
/// duplicate.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    /// Content hash, also embedded in the record key.
    pub hash: String,
    /// Raw text as received.
    pub text: String,
    /// Normalized text used for hashing and embedding.
    pub normalized: String,
    /// Scraper adapter name (e.g. `"reddit"`, `"forum"`).
    pub source: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub product: String,
    /// Set once the signal is attached to a topic; `None` while queued or
    /// in triage.
    pub topic_id: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl Signal {
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("hash".into(), self.hash.clone());
        m.insert("text".into(), self.text.clone());
        m.insert("normalized".into(), self.normalized.clone());
        m.insert("source".into(), self.source.clone());
        m.insert("url".into(), self.url.clone().unwrap_or_default());
        m.insert("title".into(), self.title.clone().unwrap_or_default());
        m.insert("author".into(), self.author.clone().unwrap_or_default());
        m.insert("product".into(), self.product.clone());
        m.insert("topic_id".into(), self.topic_id.clone().unwrap_or_default());
        m.insert("first_seen".into(), self.first_seen.to_string());
        m.insert("last_seen".into(), self.last_seen.to_string());
        m
    }

    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Signal {
            hash: req(fields, "hash")?,
            text: req(fields, "text")?,
            normalized: req(fields, "normalized")?,
            source: req(fields, "source")?,
            url: opt(fields, "url"),
            title: opt(fields, "title"),
            author: opt(fields, "author"),
            product: req(fields, "product")?,
            topic_id: opt(fields, "topic_id"),
            first_seen: req_i64(fields, "first_seen")?,
            last_seen: req_i64(fields, "last_seen")?,
        })
    }
}

/// An online cluster of semantically similar signals.
///
/// The centroid is the unit-normalized running mean of the embeddings of
/// all attached signals; `signal_count` doubles as the version token for
/// optimistic centroid updates.
#[derive(Debug, Clone, Serialize)]
pub struct Topic {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub status: TopicStatus,
    pub product: String,
    /// Empty until the classify worker has run.
    pub category: Option<TaskCategory>,
    pub signal_count: u64,
    #[serde(skip)]
    pub centroid: Vec<f32>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Topic {
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("id".into(), self.id.clone());
        m.insert("title".into(), self.title.clone());
        m.insert("summary".into(), self.summary.clone());
        m.insert("status".into(), self.status.as_str().into());
        m.insert("product".into(), self.product.clone());
        m.insert(
            "category".into(),
            self.category.map(|c| c.as_str().to_string()).unwrap_or_default(),
        );
        m.insert("signal_count".into(), self.signal_count.to_string());
        m.insert("centroid".into(), vec_to_hex(&self.centroid));
        m.insert("created_at".into(), self.created_at.to_string());
        m.insert("updated_at".into(), self.updated_at.to_string());
        m
    }

    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        let category = match opt(fields, "category") {
            Some(s) => Some(TaskCategory::parse(&s)?),
            None => None,
        };
        Ok(Topic {
            id: req(fields, "id")?,
            title: req(fields, "title")?,
            summary: fields.get("summary").cloned().unwrap_or_default(),
            status: TopicStatus::parse(&req(fields, "status")?)?,
            product: req(fields, "product")?,
            category,
            signal_count: req_i64(fields, "signal_count")? as u64,
            centroid: hex_to_vec(&req(fields, "centroid")?)?,
            created_at: req_i64(fields, "created_at")?,
            updated_at: req_i64(fields, "updated_at")?,
        })
    }
}

/// A classified, actionable topic targeted for a code change.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub topic_id: String,
    pub category: TaskCategory,
    pub title: String,
    pub summary: String,
    pub severity: String,
    pub suggested_action: String,
    pub confidence: f32,
    pub product: String,
    pub status: TaskStatus,
    pub issue_url: Option<String>,
    pub issue_number: Option<i64>,
    pub fix_status: FixStatus,
    /// Failure reason recorded when `fix_status` is `failed`.
    pub fix_error: Option<String>,
    pub pr_url: Option<String>,
    pub branch: Option<String>,
    /// Files touched by the most recent fix run, recorded for the
    /// `SuccessfulFix` written at merge time.
    pub files_changed: Vec<String>,
    /// How many auto-iterate rounds have run for this task.
    pub iteration_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("id".into(), self.id.clone());
        m.insert("topic_id".into(), self.topic_id.clone());
        m.insert("category".into(), self.category.as_str().into());
        m.insert("title".into(), self.title.clone());
        m.insert("summary".into(), self.summary.clone());
        m.insert("severity".into(), self.severity.clone());
        m.insert("suggested_action".into(), self.suggested_action.clone());
        m.insert("confidence".into(), format!("{:.4}", self.confidence));
        m.insert("product".into(), self.product.clone());
        m.insert("status".into(), self.status.as_str().into());
        m.insert("issue_url".into(), self.issue_url.clone().unwrap_or_default());
        m.insert(
            "issue_number".into(),
            self.issue_number.map(|n| n.to_string()).unwrap_or_default(),
        );
        m.insert("fix_status".into(), self.fix_status.as_str().into());
        m.insert("fix_error".into(), self.fix_error.clone().unwrap_or_default());
        m.insert("pr_url".into(), self.pr_url.clone().unwrap_or_default());
        m.insert("branch".into(), self.branch.clone().unwrap_or_default());
        m.insert("files_changed".into(), self.files_changed.join("\n"));
        m.insert("iteration_count".into(), self.iteration_count.to_string());
        m.insert("created_at".into(), self.created_at.to_string());
        m.insert("updated_at".into(), self.updated_at.to_string());
        m
    }

    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        let issue_number = match opt(fields, "issue_number") {
            Some(s) => Some(s.parse::<i64>().context("issue_number")?),
            None => None,
        };
        Ok(Task {
            id: req(fields, "id")?,
            topic_id: req(fields, "topic_id")?,
            category: TaskCategory::parse(&req(fields, "category")?)?,
            title: req(fields, "title")?,
            summary: fields.get("summary").cloned().unwrap_or_default(),
            severity: fields.get("severity").cloned().unwrap_or_default(),
            suggested_action: fields.get("suggested_action").cloned().unwrap_or_default(),
            confidence: req_f32(fields, "confidence")?,
            product: req(fields, "product")?,
            status: TaskStatus::parse(&req(fields, "status")?)?,
            issue_url: opt(fields, "issue_url"),
            issue_number,
            fix_status: FixStatus::parse(&req(fields, "fix_status")?)?,
            fix_error: opt(fields, "fix_error"),
            pr_url: opt(fields, "pr_url"),
            branch: opt(fields, "branch"),
            files_changed: opt(fields, "files_changed")
                .map(|s| s.lines().map(|l| l.to_string()).collect())
                .unwrap_or_default(),
            iteration_count: req_i64(fields, "iteration_count")? as u32,
            created_at: req_i64(fields, "created_at")?,
            updated_at: req_i64(fields, "updated_at")?,
        })
    }
}

/// Immutable record of a merged pull request produced by the fix runner.
///
/// Written once when the merge webhook lands; indexed by embedding so
/// future fixes can retrieve similar past work.
#[derive(Debug, Clone, Serialize)]
pub struct SuccessfulFix {
    pub task_id: String,
    pub topic_id: String,
    pub category: TaskCategory,
    pub title: String,
    pub summary: String,
    pub product: String,
    pub pr_url: String,
    pub pr_title: String,
    pub branch: String,
    pub merged_at: i64,
    pub files_changed: Vec<String>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

impl SuccessfulFix {
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("task_id".into(), self.task_id.clone());
        m.insert("topic_id".into(), self.topic_id.clone());
        m.insert("category".into(), self.category.as_str().into());
        m.insert("title".into(), self.title.clone());
        m.insert("summary".into(), self.summary.clone());
        m.insert("product".into(), self.product.clone());
        m.insert("pr_url".into(), self.pr_url.clone());
        m.insert("pr_title".into(), self.pr_title.clone());
        m.insert("branch".into(), self.branch.clone());
        m.insert("merged_at".into(), self.merged_at.to_string());
        m.insert("files_changed".into(), self.files_changed.join("\n"));
        m.insert("embedding".into(), vec_to_hex(&self.embedding));
        m
    }

    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        let files_changed = match opt(fields, "files_changed") {
            Some(s) => s.lines().map(|l| l.to_string()).collect(),
            None => Vec::new(),
        };
        Ok(SuccessfulFix {
            task_id: req(fields, "task_id")?,
            topic_id: req(fields, "topic_id")?,
            category: TaskCategory::parse(&req(fields, "category")?)?,
            title: req(fields, "title")?,
            summary: fields.get("summary").cloned().unwrap_or_default(),
            product: req(fields, "product")?,
            pr_url: req(fields, "pr_url")?,
            pr_title: fields.get("pr_title").cloned().unwrap_or_default(),
            branch: fields.get("branch").cloned().unwrap_or_default(),
            merged_at: req_i64(fields, "merged_at")?,
            files_changed,
            embedding: hex_to_vec(&req(fields, "embedding")?)?,
        })
    }
}

/// A short, reusable instruction included in future fix prompts.
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub id: String,
    pub product: String,
    pub content: String,
    pub category: RuleCategory,
    pub source: RuleSource,
    pub source_task_id: Option<String>,
    pub reviewer: Option<String>,
    pub times_applied: u64,
    /// Zero until the rule has been included in a fix prompt.
    pub last_applied_at: i64,
    pub created_at: i64,
}

impl Rule {
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("id".into(), self.id.clone());
        m.insert("product".into(), self.product.clone());
        m.insert("content".into(), self.content.clone());
        m.insert("category".into(), self.category.as_str().into());
        m.insert("source".into(), self.source.as_str().into());
        m.insert(
            "source_task_id".into(),
            self.source_task_id.clone().unwrap_or_default(),
        );
        m.insert("reviewer".into(), self.reviewer.clone().unwrap_or_default());
        m.insert("times_applied".into(), self.times_applied.to_string());
        m.insert("last_applied_at".into(), self.last_applied_at.to_string());
        m.insert("created_at".into(), self.created_at.to_string());
        m
    }

    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Rule {
            id: req(fields, "id")?,
            product: req(fields, "product")?,
            content: req(fields, "content")?,
            category: RuleCategory::parse(&req(fields, "category")?)?,
            source: RuleSource::parse(&req(fields, "source")?)?,
            source_task_id: opt(fields, "source_task_id"),
            reviewer: opt(fields, "reviewer"),
            times_applied: req_i64(fields, "times_applied")? as u64,
            last_applied_at: req_i64(fields, "last_applied_at")?,
            created_at: req_i64(fields, "created_at")?,
        })
    }
}

// ============ Field helpers ============

fn req(fields: &BTreeMap<String, String>, name: &str) -> Result<String> {
    fields
        .get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| anyhow!("missing required field '{}'", name))
}

fn opt(fields: &BTreeMap<String, String>, name: &str) -> Option<String> {
    fields.get(name).filter(|v| !v.is_empty()).cloned()
}

fn req_i64(fields: &BTreeMap<String, String>, name: &str) -> Result<i64> {
    req(fields, name)?
        .parse::<i64>()
        .with_context(|| format!("field '{}' is not an integer", name))
}

fn req_f32(fields: &BTreeMap<String, String>, name: &str) -> Result<f32> {
    req(fields, name)?
        .parse::<f32>()
        .with_context(|| format!("field '{}' is not a float", name))
}

pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Abbreviate a content hash for log lines.
pub fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(16)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parse_roundtrip() {
        for c in [
            TaskCategory::Bug,
            TaskCategory::Feature,
            TaskCategory::Ux,
            TaskCategory::Other,
        ] {
            assert_eq!(TaskCategory::parse(c.as_str()).unwrap(), c);
        }
        assert!(TaskCategory::parse("QUESTION").is_err());
    }

    #[test]
    fn test_category_parse_case_insensitive() {
        assert_eq!(TaskCategory::parse("bug").unwrap(), TaskCategory::Bug);
    }

    #[test]
    fn test_fix_status_roundtrip() {
        for s in [
            FixStatus::None,
            FixStatus::Running,
            FixStatus::Completed,
            FixStatus::Failed,
        ] {
            assert_eq!(FixStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn test_signal_field_roundtrip() {
        let signal = Signal {
            hash: "abc123".into(),
            text: "Sync fails on iOS".into(),
            normalized: "sync fails on ios".into(),
            source: "forum".into(),
            url: Some("https://example.com/t/1".into()),
            title: None,
            author: Some("alice".into()),
            product: "joplin".into(),
            topic_id: None,
            first_seen: 1700000000,
            last_seen: 1700000100,
        };
        let restored = Signal::from_fields(&signal.to_fields()).unwrap();
        assert_eq!(restored.hash, signal.hash);
        assert_eq!(restored.url, signal.url);
        assert_eq!(restored.title, None);
        assert_eq!(restored.topic_id, None);
        assert_eq!(restored.last_seen, signal.last_seen);
    }

    #[test]
    fn test_topic_field_roundtrip_vector_tolerance() {
        let topic = Topic {
            id: "t1".into(),
            title: "Sync issues".into(),
            summary: String::new(),
            status: TopicStatus::Open,
            product: "joplin".into(),
            category: None,
            signal_count: 3,
            centroid: vec![0.6, 0.8, 0.0],
            created_at: 1700000000,
            updated_at: 1700000500,
        };
        let restored = Topic::from_fields(&topic.to_fields()).unwrap();
        assert_eq!(restored.signal_count, 3);
        assert_eq!(restored.category, None);
        for (a, b) in restored.centroid.iter().zip(topic.centroid.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_task_field_roundtrip() {
        let task = Task {
            id: "task1".into(),
            topic_id: "t1".into(),
            category: TaskCategory::Bug,
            title: "Fix sync".into(),
            summary: "Sync fails".into(),
            severity: "high".into(),
            suggested_action: "Investigate the sync lock".into(),
            confidence: 0.9,
            product: "joplin".into(),
            status: TaskStatus::Open,
            issue_url: None,
            issue_number: None,
            fix_status: FixStatus::None,
            fix_error: None,
            pr_url: None,
            branch: None,
            files_changed: Vec::new(),
            iteration_count: 0,
            created_at: 1700000000,
            updated_at: 1700000000,
        };
        let restored = Task::from_fields(&task.to_fields()).unwrap();
        assert_eq!(restored.category, TaskCategory::Bug);
        assert_eq!(restored.fix_status, FixStatus::None);
        assert!((restored.confidence - 0.9).abs() < 1e-3);
        assert_eq!(restored.issue_number, None);
    }

    #[test]
    fn test_corrupt_enum_rejected_on_read() {
        let task = Task {
            id: "task1".into(),
            topic_id: "t1".into(),
            category: TaskCategory::Bug,
            title: "x".into(),
            summary: String::new(),
            severity: String::new(),
            suggested_action: String::new(),
            confidence: 0.5,
            product: "p".into(),
            status: TaskStatus::Open,
            issue_url: None,
            issue_number: None,
            fix_status: FixStatus::None,
            fix_error: None,
            pr_url: None,
            branch: None,
            files_changed: Vec::new(),
            iteration_count: 0,
            created_at: 0,
            updated_at: 0,
        };
        let mut fields = task.to_fields();
        fields.insert("status".into(), "exploded".into());
        assert!(Task::from_fields(&fields).is_err());
    }
}
