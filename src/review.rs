//! Webhook verification and the review state machine.
//!
//! Forge webhooks close the self-improvement loop:
//!
//! | Task state | Event | Action |
//! |---|---|---|
//! | `open`/`in_progress`, fix running | PR opened | `status = in_progress` |
//! | `in_progress`, fix running | PR merged | `status = done`, `fix_status = completed`, record `SuccessfulFix` |
//! | `in_progress` | PR closed (not merged) | `fix_status = failed`, `status = open` |
//! | `in_progress` | changes requested | extract rules; optionally re-enter the fix runner |
//! | `in_progress` | approved / commented | no change |
//!
//! The fix runner marks `fix_status = completed` when the agent reports
//! success, which can land before the PR webhooks arrive; the opened and
//! merged rows therefore accept `running` or `completed`. Duplicate merged
//! deliveries are no-ops because the `SuccessfulFix` record is write-once.
//!
//! Signatures are verified against the raw body (HMAC-SHA256, constant
//! time) before any payload is parsed or state read; a mismatch is a 401
//! with no side effects. Events that cannot be resolved to a task are
//! logged and discarded — the PR may simply be human-authored.

use std::sync::Arc;

use anyhow::Result;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::learning::{extract_rules_from_feedback, LearningStore};
use crate::llm::LlmProvider;
use crate::models::{now_epoch, task_key, FixStatus, RuleSource, Task, TaskStatus};
use crate::store::{RecordWrite, SharedStore};

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook signature header (`sha256=<hex>`) against the raw
/// request body. Comparison is constant-time via `Mac::verify_slice`.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let hex = match header.strip_prefix("sha256=") {
        Some(hex) => hex,
        None => return false,
    };
    let expected = match decode_hex(hex) {
        Some(bytes) => bytes,
        None => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature header value for a body (used by tests and any
/// internal redelivery tooling).
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("sha256={}", hex)
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

/// A forge event the state machine cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewEvent {
    PrOpened {
        pr_url: String,
        branch: String,
    },
    PrMerged {
        pr_url: String,
        branch: String,
        pr_title: String,
    },
    PrClosed {
        pr_url: String,
        branch: String,
    },
    ChangesRequested {
        pr_url: String,
        branch: String,
        reviewer: String,
        feedback: String,
    },
    /// Approved or plain comment: acknowledged, no state change.
    NoAction,
}

/// Parse a forge webhook payload into a [`ReviewEvent`].
///
/// Returns `None` for event shapes the pipeline does not consume.
pub fn parse_event(payload: &serde_json::Value) -> Option<ReviewEvent> {
    let pr = payload.get("pull_request")?;
    let pr_url = pr.get("html_url")?.as_str()?.to_string();
    let branch = pr
        .get("head")
        .and_then(|h| h.get("ref"))
        .and_then(|r| r.as_str())
        .unwrap_or("")
        .to_string();
    let action = payload.get("action").and_then(|a| a.as_str()).unwrap_or("");

    if let Some(review) = payload.get("review") {
        if action != "submitted" {
            return None;
        }
        let state = review.get("state").and_then(|s| s.as_str()).unwrap_or("");
        return match state {
            "changes_requested" => Some(ReviewEvent::ChangesRequested {
                pr_url,
                branch,
                reviewer: review
                    .get("user")
                    .and_then(|u| u.get("login"))
                    .and_then(|l| l.as_str())
                    .unwrap_or("")
                    .to_string(),
                feedback: review
                    .get("body")
                    .and_then(|b| b.as_str())
                    .unwrap_or("")
                    .to_string(),
            }),
            "approved" | "commented" => Some(ReviewEvent::NoAction),
            _ => None,
        };
    }

    match action {
        "opened" | "reopened" | "ready_for_review" => {
            Some(ReviewEvent::PrOpened { pr_url, branch })
        }
        "closed" => {
            let merged = pr.get("merged").and_then(|m| m.as_bool()).unwrap_or(false);
            if merged {
                Some(ReviewEvent::PrMerged {
                    pr_url,
                    branch,
                    pr_title: pr
                        .get("title")
                        .and_then(|t| t.as_str())
                        .unwrap_or("")
                        .to_string(),
                })
            } else {
                Some(ReviewEvent::PrClosed { pr_url, branch })
            }
        }
        _ => None,
    }
}

/// What the handler decided; `Reiterate` asks the caller to re-enter the
/// fix runner (spawned, so webhook delivery is never blocked on an agent).
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewAction {
    /// Event did not resolve to a known task, or required no change.
    Discarded,
    Applied,
    Reiterate { task_id: String, feedback: String },
}

pub struct ReviewHandler {
    store: SharedStore,
    learning: Arc<LearningStore>,
    llm: Arc<dyn LlmProvider>,
    embedder: Arc<dyn Embedder>,
    auto_iterate: bool,
    auto_iter_max: u32,
}

impl ReviewHandler {
    pub fn new(
        store: SharedStore,
        learning: Arc<LearningStore>,
        llm: Arc<dyn LlmProvider>,
        embedder: Arc<dyn Embedder>,
        auto_iterate: bool,
        auto_iter_max: u32,
    ) -> Self {
        Self {
            store,
            learning,
            llm,
            embedder,
            auto_iterate,
            auto_iter_max,
        }
    }

    /// Run the state machine for one verified event.
    pub async fn handle_event(&self, event: ReviewEvent) -> Result<ReviewAction> {
        let (pr_url, branch) = match &event {
            ReviewEvent::PrOpened { pr_url, branch }
            | ReviewEvent::PrClosed { pr_url, branch }
            | ReviewEvent::PrMerged { pr_url, branch, .. }
            | ReviewEvent::ChangesRequested { pr_url, branch, .. } => {
                (pr_url.clone(), branch.clone())
            }
            ReviewEvent::NoAction => return Ok(ReviewAction::Discarded),
        };

        let task = match self.resolve_task(&pr_url, &branch).await? {
            Some(task) => task,
            None => {
                info!(pr_url = %pr_url, "webhook for unknown task discarded");
                return Ok(ReviewAction::Discarded);
            }
        };
        let key = task_key(&task.id);

        match event {
            ReviewEvent::PrOpened { .. } => {
                let eligible = matches!(task.status, TaskStatus::Open | TaskStatus::InProgress)
                    && matches!(task.fix_status, FixStatus::Running | FixStatus::Completed);
                if !eligible {
                    debug!(task_id = %task.id, "PR opened event ignored in current state");
                    return Ok(ReviewAction::Discarded);
                }
                self.store
                    .update_guarded(
                        &key,
                        "status",
                        task.status.as_str(),
                        &[RecordWrite::new(key.clone())
                            .set("status", TaskStatus::InProgress.as_str())
                            .set("pr_url", pr_url)
                            .set("updated_at", now_epoch().to_string())],
                    )
                    .await?;
                info!(task_id = %task.id, "task moved to in_progress on PR open");
                Ok(ReviewAction::Applied)
            }

            ReviewEvent::PrMerged { pr_title, .. } => {
                let now = now_epoch().to_string();
                let mut merged_task = task.clone();
                merged_task.pr_url = Some(pr_url.clone());

                self.store
                    .update_guarded(
                        &key,
                        "id",
                        &task.id,
                        &[RecordWrite::new(key.clone())
                            .set("status", TaskStatus::Done.as_str())
                            .set("fix_status", FixStatus::Completed.as_str())
                            .set("pr_url", pr_url)
                            .set("updated_at", now)],
                    )
                    .await?;

                // Write-once: a redelivered merge event changes nothing.
                let recorded = self
                    .learning
                    .store_success(
                        &merged_task,
                        &pr_title,
                        &merged_task.files_changed,
                        self.embedder.as_ref(),
                    )
                    .await?;
                if recorded {
                    info!(task_id = %task.id, "merge recorded as successful fix");
                } else {
                    debug!(task_id = %task.id, "duplicate merge event ignored");
                }
                Ok(ReviewAction::Applied)
            }

            ReviewEvent::PrClosed { .. } => {
                if task.status != TaskStatus::InProgress {
                    debug!(task_id = %task.id, "PR closed event ignored in current state");
                    return Ok(ReviewAction::Discarded);
                }
                self.store
                    .update_guarded(
                        &key,
                        "status",
                        task.status.as_str(),
                        &[RecordWrite::new(key.clone())
                            .set("status", TaskStatus::Open.as_str())
                            .set("fix_status", FixStatus::Failed.as_str())
                            .set("fix_error", "pull request closed without merging")
                            .set("updated_at", now_epoch().to_string())],
                    )
                    .await?;
                info!(task_id = %task.id, "PR closed without merge, task reopened");
                Ok(ReviewAction::Applied)
            }

            ReviewEvent::ChangesRequested {
                reviewer, feedback, ..
            } => {
                if task.status != TaskStatus::InProgress {
                    debug!(task_id = %task.id, "review event ignored in current state");
                    return Ok(ReviewAction::Discarded);
                }

                let extracted = extract_rules_from_feedback(self.llm.as_ref(), &feedback).await?;
                for (content, category) in &extracted {
                    self.learning
                        .upsert_rule(
                            &task.product,
                            content,
                            *category,
                            RuleSource::ReviewFeedback,
                            Some(&task.id),
                            Some(&reviewer),
                        )
                        .await?;
                }

                if !self.auto_iterate {
                    return Ok(ReviewAction::Applied);
                }
                if task.iteration_count >= self.auto_iter_max {
                    warn!(
                        task_id = %task.id,
                        iterations = task.iteration_count,
                        "auto-iterate cap reached; leaving task to operators"
                    );
                    return Ok(ReviewAction::Applied);
                }

                // Claim the iteration slot before the caller spawns the
                // runner, so redelivered events cannot exceed the cap.
                let claimed = self
                    .store
                    .update_guarded(
                        &key,
                        "iteration_count",
                        &task.iteration_count.to_string(),
                        &[RecordWrite::new(key.clone())
                            .set("iteration_count", (task.iteration_count + 1).to_string())
                            .set("updated_at", now_epoch().to_string())],
                    )
                    .await?;
                if !claimed {
                    debug!(task_id = %task.id, "iteration slot already claimed");
                    return Ok(ReviewAction::Applied);
                }

                Ok(ReviewAction::Reiterate {
                    task_id: task.id,
                    feedback,
                })
            }

            ReviewEvent::NoAction => Ok(ReviewAction::Discarded),
        }
    }

    /// Resolve a webhook to its task: exact `pr_url` match first, then the
    /// `darwin/{task_id}` branch convention.
    async fn resolve_task(&self, pr_url: &str, branch: &str) -> Result<Option<Task>> {
        for (_, record) in self.store.scan_records("task:").await? {
            let task = Task::from_fields(&record)?;
            if task.pr_url.as_deref() == Some(pr_url) {
                return Ok(Some(task));
            }
        }

        if let Some(task_id) = branch.strip_prefix("darwin/") {
            if let Some(record) = self.store.get_record(&task_key(task_id)).await? {
                return Ok(Some(Task::from_fields(&record)?));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::LocalEmbedder;
    use crate::models::{fix_success_key, TaskCategory};
    use crate::store::memory::MemoryStore;
    use crate::store::{Store, IDX_FIXES};

    struct RuleLlm;

    #[async_trait]
    impl LlmProvider for RuleLlm {
        fn model_name(&self) -> &str {
            "stub"
        }
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(r#"{"rules": [{"content": "Use early returns", "category": "style"}]}"#.to_string())
        }
    }

    fn make_task(status: TaskStatus, fix_status: FixStatus) -> Task {
        Task {
            id: "task1".to_string(),
            topic_id: "t1".to_string(),
            category: TaskCategory::Bug,
            title: "Fix sync".to_string(),
            summary: "Sync fails".to_string(),
            severity: "high".to_string(),
            suggested_action: String::new(),
            confidence: 0.9,
            product: "joplin".to_string(),
            status,
            issue_url: None,
            issue_number: None,
            fix_status,
            fix_error: None,
            pr_url: Some("https://forge/pr/1".to_string()),
            branch: Some("darwin/task1".to_string()),
            files_changed: vec!["src/sync.rs".to_string()],
            iteration_count: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    async fn setup(
        task: Task,
        auto_iterate: bool,
    ) -> (Arc<MemoryStore>, ReviewHandler) {
        let store = Arc::new(MemoryStore::new());
        store.declare_index(IDX_FIXES, 8).await.unwrap();
        store
            .put_record(&task_key(&task.id), &task.to_fields())
            .await
            .unwrap();
        let learning = Arc::new(LearningStore::new(store.clone()));
        let embedder = Arc::new(LocalEmbedder::new(&EmbeddingConfig {
            dim: 8,
            ..Default::default()
        }));
        let handler = ReviewHandler::new(
            store.clone(),
            learning,
            Arc::new(RuleLlm),
            embedder,
            auto_iterate,
            3,
        );
        (store, handler)
    }

    #[test]
    fn test_signature_roundtrip() {
        let body = br#"{"action":"closed"}"#;
        let header = sign_body("s3cret", body);
        assert!(verify_signature("s3cret", body, &header));
        assert!(!verify_signature("wrong", body, &header));
        assert!(!verify_signature("s3cret", b"tampered", &header));
        assert!(!verify_signature("s3cret", body, "sha256=zz"));
        assert!(!verify_signature("s3cret", body, "md5=abcd"));
    }

    #[test]
    fn test_parse_merged_event() {
        let payload = serde_json::json!({
            "action": "closed",
            "pull_request": {
                "html_url": "https://forge/pr/1",
                "title": "Fix sync",
                "merged": true,
                "head": {"ref": "darwin/task1"},
            },
        });
        assert_eq!(
            parse_event(&payload),
            Some(ReviewEvent::PrMerged {
                pr_url: "https://forge/pr/1".to_string(),
                branch: "darwin/task1".to_string(),
                pr_title: "Fix sync".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_review_events() {
        let payload = serde_json::json!({
            "action": "submitted",
            "review": {
                "state": "changes_requested",
                "body": "use early returns",
                "user": {"login": "alice"},
            },
            "pull_request": {
                "html_url": "https://forge/pr/1",
                "head": {"ref": "darwin/task1"},
            },
        });
        match parse_event(&payload) {
            Some(ReviewEvent::ChangesRequested {
                reviewer, feedback, ..
            }) => {
                assert_eq!(reviewer, "alice");
                assert_eq!(feedback, "use early returns");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let approved = serde_json::json!({
            "action": "submitted",
            "review": {"state": "approved", "user": {"login": "alice"}},
            "pull_request": {"html_url": "https://forge/pr/1", "head": {"ref": "x"}},
        });
        assert_eq!(parse_event(&approved), Some(ReviewEvent::NoAction));
    }

    #[tokio::test]
    async fn test_merge_records_successful_fix_once() {
        let (store, handler) = setup(make_task(TaskStatus::InProgress, FixStatus::Running), false).await;

        let event = ReviewEvent::PrMerged {
            pr_url: "https://forge/pr/1".to_string(),
            branch: "darwin/task1".to_string(),
            pr_title: "Fix sync".to_string(),
        };
        assert_eq!(
            handler.handle_event(event.clone()).await.unwrap(),
            ReviewAction::Applied
        );

        let task =
            Task::from_fields(&store.get_record(&task_key("task1")).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.fix_status, FixStatus::Completed);

        let fix = store
            .get_record(&fix_success_key("task1"))
            .await
            .unwrap()
            .unwrap();
        let merged_at = fix.get("merged_at").unwrap().clone();

        // Redelivery: still Applied, but nothing mutates.
        handler.handle_event(event).await.unwrap();
        let fix_after = store
            .get_record(&fix_success_key("task1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fix_after.get("merged_at").unwrap(), &merged_at);
    }

    #[tokio::test]
    async fn test_pr_opened_moves_task_in_progress() {
        let (store, handler) = setup(make_task(TaskStatus::Open, FixStatus::Running), false).await;
        let action = handler
            .handle_event(ReviewEvent::PrOpened {
                pr_url: "https://forge/pr/1".to_string(),
                branch: "darwin/task1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(action, ReviewAction::Applied);

        let task =
            Task::from_fields(&store.get_record(&task_key("task1")).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_pr_closed_reopens_task() {
        let (store, handler) = setup(make_task(TaskStatus::InProgress, FixStatus::Running), false).await;
        handler
            .handle_event(ReviewEvent::PrClosed {
                pr_url: "https://forge/pr/1".to_string(),
                branch: "darwin/task1".to_string(),
            })
            .await
            .unwrap();

        let task =
            Task::from_fields(&store.get_record(&task_key("task1")).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.fix_status, FixStatus::Failed);
        // No learning action on an unmerged close.
        assert!(store
            .get_record(&fix_success_key("task1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_changes_requested_extracts_and_dedups_rules() {
        let (store, handler) = setup(make_task(TaskStatus::InProgress, FixStatus::Running), false).await;
        let event = ReviewEvent::ChangesRequested {
            pr_url: "https://forge/pr/1".to_string(),
            branch: "darwin/task1".to_string(),
            reviewer: "alice".to_string(),
            feedback: "please use early returns everywhere".to_string(),
        };

        handler.handle_event(event.clone()).await.unwrap();
        let rules = store.scan_records("rule:joplin:").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].1.get("content").unwrap(), "Use early returns");
        assert_eq!(rules[0].1.get("source").unwrap(), "review_feedback");
        assert_eq!(rules[0].1.get("reviewer").unwrap(), "alice");

        // Identical second event strengthens rather than duplicates.
        handler.handle_event(event).await.unwrap();
        let rules = store.scan_records("rule:joplin:").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].1.get("times_applied").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_auto_iterate_respects_cap() {
        let mut task = make_task(TaskStatus::InProgress, FixStatus::Running);
        task.iteration_count = 3;
        let (_store, handler) = setup(task, true).await;

        let action = handler
            .handle_event(ReviewEvent::ChangesRequested {
                pr_url: "https://forge/pr/1".to_string(),
                branch: "darwin/task1".to_string(),
                reviewer: "alice".to_string(),
                feedback: "more changes needed here".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(action, ReviewAction::Applied);
    }

    #[tokio::test]
    async fn test_auto_iterate_requests_rerun() {
        let (store, handler) = setup(make_task(TaskStatus::InProgress, FixStatus::Failed), true).await;

        let action = handler
            .handle_event(ReviewEvent::ChangesRequested {
                pr_url: "https://forge/pr/1".to_string(),
                branch: "darwin/task1".to_string(),
                reviewer: "alice".to_string(),
                feedback: "more changes needed here".to_string(),
            })
            .await
            .unwrap();
        match action {
            ReviewAction::Reiterate { task_id, feedback } => {
                assert_eq!(task_id, "task1");
                assert!(feedback.contains("more changes"));
            }
            other => panic!("expected Reiterate, got {:?}", other),
        }

        let task =
            Task::from_fields(&store.get_record(&task_key("task1")).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(task.iteration_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_task_discarded() {
        let (_store, handler) = setup(make_task(TaskStatus::InProgress, FixStatus::Running), false).await;
        let action = handler
            .handle_event(ReviewEvent::PrOpened {
                pr_url: "https://forge/pr/other".to_string(),
                branch: "feature/human-work".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(action, ReviewAction::Discarded);
    }
}
