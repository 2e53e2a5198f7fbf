//! Topic classification: prompt assembly and task materialization.
//!
//! The classify worker composes three steps, kept separate so failure
//! classes stay distinguishable: load the topic bundle, call the LLM
//! (transport errors retry), validate the structured result (schema errors
//! dead-letter after one retry), then [`materialize`] the outcome.

use anyhow::{anyhow, Result};
use tracing::info;
use uuid::Uuid;

use crate::llm::Classification;
use crate::models::{
    now_epoch, task_key, topic_key, Signal, Task, TaskStatus, FixStatus, Topic,
};
use crate::store::{RecordWrite, SharedStore};

/// Per-signal excerpt cap in the classification prompt.
pub const EXCERPT_MAX_CHARS: usize = 500;
/// Total excerpt budget across all signals.
pub const EXCERPTS_TOTAL_CHARS: usize = 4000;
/// How many recent signals are shown to the LLM.
pub const MAX_PROMPT_SIGNALS: usize = 10;

/// A topic plus the recent signals that will ground its classification.
pub struct TopicBundle {
    pub topic: Topic,
    pub signals: Vec<Signal>,
}

/// Load a topic and its most recently seen signals (newest first).
pub async fn load_topic_bundle(store: &SharedStore, topic_id: &str) -> Result<TopicBundle> {
    let fields = store
        .get_record(&topic_key(topic_id))
        .await?
        .ok_or_else(|| anyhow!("topic {} not found", topic_id))?;
    let topic = Topic::from_fields(&fields)?;

    let mut signals: Vec<Signal> = Vec::new();
    for (_, record) in store.scan_records("signal:").await? {
        if record.get("topic_id").map(|t| t.as_str()) == Some(topic_id) {
            signals.push(Signal::from_fields(&record)?);
        }
    }
    signals.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.hash.cmp(&b.hash)));
    signals.truncate(MAX_PROMPT_SIGNALS);

    Ok(TopicBundle { topic, signals })
}

/// Build the classification prompt. Each excerpt is truncated to 500
/// characters and the combined excerpt section to 4,000.
pub fn build_prompt(bundle: &TopicBundle) -> String {
    let mut excerpts = String::new();
    for (i, signal) in bundle.signals.iter().enumerate() {
        let excerpt: String = signal.text.chars().take(EXCERPT_MAX_CHARS).collect();
        let entry = format!("{}. [{}] {}\n", i + 1, signal.source, excerpt);
        if excerpts.len() + entry.len() > EXCERPTS_TOTAL_CHARS {
            break;
        }
        excerpts.push_str(&entry);
    }
    if excerpts.is_empty() {
        excerpts.push_str("(no signal excerpts available)\n");
    }

    format!(
        r#"You are triaging user feedback for the product "{product}".

A cluster of similar feedback has formed under the working title:
"{title}"

Representative feedback excerpts:
{excerpts}
Classify this cluster. Respond with ONLY a JSON object of this shape:
{{"category": "BUG|FEATURE|UX|OTHER", "title": "short imperative title", "summary": "2-3 sentence summary of the underlying issue", "severity": "low|medium|high|critical", "suggested_action": "what a developer should do", "confidence": 0.0}}

Rules:
- category BUG for defects, FEATURE for requests, UX for friction that is not a defect, OTHER for anything not actionable by a code change.
- confidence is your certainty in the category, between 0 and 1.
- Return only the JSON object, no additional text."#,
        product = bundle.topic.product,
        title = bundle.topic.title,
        excerpts = excerpts,
    )
}

/// What materialization did with a validated classification.
#[derive(Debug, Clone)]
pub enum ClassifyOutcome {
    /// Actionable: a fresh task was created.
    TaskCreated(Task),
    /// Actionable, but a live task for this topic already existed and was
    /// refreshed instead of duplicated.
    TaskUpdated(Task),
    /// Non-actionable (OTHER, or confidence below the floor): only the
    /// topic was annotated.
    TopicAnnotated,
}

/// Apply a classification: annotate the topic, and create or refresh the
/// task when the outcome is actionable.
///
/// Task creation is idempotent per topic — at most one non-`done` task
/// exists for a topic at any time.
pub async fn materialize(
    store: &SharedStore,
    bundle: &TopicBundle,
    classification: &Classification,
    confidence_min: f32,
) -> Result<ClassifyOutcome> {
    let topic = &bundle.topic;
    let now = now_epoch();

    store
        .update_guarded(
            &topic_key(&topic.id),
            "id",
            &topic.id,
            &[RecordWrite::new(topic_key(&topic.id))
                .set("title", classification.title.clone())
                .set("summary", classification.summary.clone())
                .set("category", classification.category.as_str())
                .set("updated_at", now.to_string())],
        )
        .await?;

    let actionable =
        classification.category.is_actionable() && classification.confidence >= confidence_min;
    if !actionable {
        info!(
            topic_id = %topic.id,
            category = classification.category.as_str(),
            confidence = classification.confidence,
            "topic annotated, no task created"
        );
        return Ok(ClassifyOutcome::TopicAnnotated);
    }

    // Reuse a live task for this topic if one exists.
    let mut existing: Option<Task> = None;
    for (_, record) in store.scan_records("task:").await? {
        let task = Task::from_fields(&record)?;
        if task.topic_id == topic.id && task.status != TaskStatus::Done {
            existing = Some(task);
            break;
        }
    }

    if let Some(mut task) = existing {
        task.category = classification.category;
        task.title = classification.title.clone();
        task.summary = classification.summary.clone();
        task.severity = classification.severity.clone();
        task.suggested_action = classification.suggested_action.clone();
        task.confidence = classification.confidence;
        task.updated_at = now;
        store.put_record(&task_key(&task.id), &task.to_fields()).await?;
        info!(task_id = %task.id, topic_id = %topic.id, "refreshed existing task");
        return Ok(ClassifyOutcome::TaskUpdated(task));
    }

    let task = Task {
        id: Uuid::new_v4().to_string(),
        topic_id: topic.id.clone(),
        category: classification.category,
        title: classification.title.clone(),
        summary: classification.summary.clone(),
        severity: classification.severity.clone(),
        suggested_action: classification.suggested_action.clone(),
        confidence: classification.confidence,
        product: topic.product.clone(),
        status: TaskStatus::Open,
        issue_url: None,
        issue_number: None,
        fix_status: FixStatus::None,
        fix_error: None,
        pr_url: None,
        branch: None,
        files_changed: Vec::new(),
        iteration_count: 0,
        created_at: now,
        updated_at: now,
    };
    store.put_record(&task_key(&task.id), &task.to_fields()).await?;
    info!(
        task_id = %task.id,
        topic_id = %topic.id,
        category = task.category.as_str(),
        "task created from classification"
    );
    Ok(ClassifyOutcome::TaskCreated(task))
}
