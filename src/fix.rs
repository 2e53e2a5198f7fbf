//! The fix runner: transition guards and the coding-agent boundary.
//!
//! The agent itself — sandbox, tool use, commit/push — is external. This
//! module owns what the pipeline is responsible for:
//!
//! 1. At-most-one concurrent fix per task, enforced by compare-and-set on
//!    `fix_status` (`none|failed → running → completed|failed`).
//! 2. Assembling the fix context from the learning store: the top similar
//!    past fixes and the product's top-ranked style rules, plus reviewer
//!    feedback on auto-iterate rounds.
//! 3. Recording the outcome and bumping usage counters for every rule that
//!    went into the prompt.
//!
//! Failures are terminal for the run (`fix_status = failed` with a
//! reason); there is no automatic retry — operators decide.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::FixConfig;
use crate::embedding::Embedder;
use crate::learning::{format_rules_for_prompt, LearningStore, SIMILAR_FIXES_K, TOP_RULES_K};
use crate::models::{now_epoch, task_key, FixStatus, Rule, SuccessfulFix, Task};
use crate::store::{RecordWrite, SharedStore};

/// What the coding agent must hand back on success.
#[derive(Debug, Clone, Deserialize)]
pub struct FixResult {
    pub branch: String,
    pub pr_url: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

/// Context assembled for one fix run.
#[derive(Debug, Clone)]
pub struct FixContext {
    pub rules: Vec<Rule>,
    pub similar_fixes: Vec<SuccessfulFix>,
    /// Reviewer feedback, present on auto-iterate rounds.
    pub feedback: Option<String>,
    /// Branch the agent should create, derived from the task id so the
    /// review handler can resolve webhooks back to the task.
    pub suggested_branch: String,
}

/// Boundary to the external coding agent.
#[async_trait]
pub trait CodingAgent: Send + Sync {
    async fn run_fix(&self, task: &Task, context: &FixContext) -> Result<FixResult>;
}

/// Create the configured [`CodingAgent`].
pub fn create_agent(config: &FixConfig) -> Result<Arc<dyn CodingAgent>> {
    match config.agent.as_str() {
        "disabled" => Ok(Arc::new(DisabledAgent)),
        "command" => Ok(Arc::new(CommandAgent {
            command: config.agent_command.clone(),
        })),
        other => bail!("Unknown fix agent: '{}'", other),
    }
}

/// Placeholder agent that always fails; used until an executor is wired.
pub struct DisabledAgent;

#[async_trait]
impl CodingAgent for DisabledAgent {
    async fn run_fix(&self, _task: &Task, _context: &FixContext) -> Result<FixResult> {
        bail!("coding agent is disabled")
    }
}

/// Agent executor that shells out to a configured command.
///
/// The command receives `{task, prompt, suggested_branch}` as JSON on
/// stdin and must print `{branch, pr_url, files_changed}` on stdout.
pub struct CommandAgent {
    command: String,
}

#[derive(Serialize)]
struct CommandPayload<'a> {
    task: &'a Task,
    prompt: String,
    suggested_branch: &'a str,
}

#[async_trait]
impl CodingAgent for CommandAgent {
    async fn run_fix(&self, task: &Task, context: &FixContext) -> Result<FixResult> {
        let payload = CommandPayload {
            task,
            prompt: render_fix_prompt(task, context),
            suggested_branch: &context.suggested_branch,
        };
        let input = serde_json::to_vec(&payload)?;

        let mut child = tokio::process::Command::new(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn fix agent '{}'", self.command))?;

        child
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("agent stdin unavailable"))?
            .write_all(&input)
            .await?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "fix agent exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        serde_json::from_slice(&output.stdout).context("fix agent printed invalid JSON")
    }
}

/// The prompt handed to the agent: task details, learned style rules,
/// similar past fixes, and any reviewer feedback to address.
pub fn render_fix_prompt(task: &Task, context: &FixContext) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "You are a skilled software engineer fixing an issue in the product \"{}\".\n\n\
         ## Task\n- Category: {}\n- Title: {}\n- Summary: {}\n- Suggested action: {}",
        task.product,
        task.category.as_str(),
        task.title,
        task.summary,
        task.suggested_action,
    ));

    sections.push(format!(
        "## Coding style rules for {}\nThese were learned from past code reviews. Follow them:\n\n{}",
        task.product,
        format_rules_for_prompt(&context.rules),
    ));

    if context.similar_fixes.is_empty() {
        sections.push("## Similar past fixes\nNone recorded yet.".to_string());
    } else {
        let fixes = context
            .similar_fixes
            .iter()
            .map(|f| {
                format!(
                    "- {} ({}): {} — files: {}",
                    f.title,
                    f.pr_url,
                    f.summary,
                    if f.files_changed.is_empty() {
                        "unknown".to_string()
                    } else {
                        f.files_changed.join(", ")
                    }
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!(
            "## Similar past fixes (learn from these)\n{}",
            fixes
        ));
    }

    if let Some(feedback) = &context.feedback {
        sections.push(format!(
            "## Review feedback to address\nA reviewer requested changes. Address ALL of it:\n\n{}",
            feedback
        ));
    }

    sections.push(
        "## Guidelines\n- Make minimal, targeted changes.\n- Follow the existing code style.\n\
         - Do not run tests or commit; only change files."
            .to_string(),
    );

    sections.join("\n\n")
}

/// Outcome of a fix run, as reported to the HTTP caller.
#[derive(Debug, Clone)]
pub enum FixOutcome {
    Completed {
        pr_url: String,
        branch: String,
        files_changed: Vec<String>,
    },
    Failed {
        reason: String,
    },
    /// A run is already in flight (or the task is already fixed).
    Conflict {
        fix_status: FixStatus,
    },
}

pub struct FixRunner {
    store: SharedStore,
    learning: Arc<LearningStore>,
    embedder: Arc<dyn Embedder>,
    agent: Arc<dyn CodingAgent>,
    agent_timeout: Duration,
}

impl FixRunner {
    pub fn new(
        store: SharedStore,
        learning: Arc<LearningStore>,
        embedder: Arc<dyn Embedder>,
        agent: Arc<dyn CodingAgent>,
        agent_timeout: Duration,
    ) -> Self {
        Self {
            store,
            learning,
            embedder,
            agent,
            agent_timeout,
        }
    }

    /// Execute one fix run for `task_id`. `feedback` carries reviewer
    /// comments on auto-iterate rounds and is appended to the context.
    pub async fn run(&self, task_id: &str, feedback: Option<&str>) -> Result<FixOutcome> {
        let key = task_key(task_id);
        let fields = self
            .store
            .get_record(&key)
            .await?
            .ok_or_else(|| anyhow!("task {} not found", task_id))?;
        let task = Task::from_fields(&fields)?;

        // Only none → running and failed → running are legal entries.
        match task.fix_status {
            FixStatus::None | FixStatus::Failed => {}
            status @ (FixStatus::Running | FixStatus::Completed) => {
                return Ok(FixOutcome::Conflict { fix_status: status });
            }
        }

        let claimed = self
            .store
            .update_guarded(
                &key,
                "fix_status",
                task.fix_status.as_str(),
                &[RecordWrite::new(key.clone())
                    .set("fix_status", FixStatus::Running.as_str())
                    .set("fix_error", "")
                    .set("updated_at", now_epoch().to_string())],
            )
            .await?;
        if !claimed {
            // Lost the race: someone else moved fix_status first.
            let status = self
                .store
                .get_record(&key)
                .await?
                .and_then(|f| f.get("fix_status").cloned())
                .map(|s| FixStatus::parse(&s))
                .transpose()?
                .unwrap_or(FixStatus::Running);
            return Ok(FixOutcome::Conflict { fix_status: status });
        }

        info!(task_id, "fix run started");

        let context = match self.build_context(&task, feedback).await {
            Ok(context) => context,
            Err(e) => {
                self.mark_failed(&key, &format!("context assembly failed: {}", e))
                    .await?;
                return Ok(FixOutcome::Failed {
                    reason: "context assembly failed".to_string(),
                });
            }
        };

        let result = tokio::time::timeout(
            self.agent_timeout,
            self.agent.run_fix(&task, &context),
        )
        .await;

        match result {
            Ok(Ok(fix)) => {
                let now = now_epoch().to_string();
                self.store
                    .update_guarded(
                        &key,
                        "fix_status",
                        FixStatus::Running.as_str(),
                        &[RecordWrite::new(key.clone())
                            .set("fix_status", FixStatus::Completed.as_str())
                            .set("pr_url", fix.pr_url.clone())
                            .set("branch", fix.branch.clone())
                            .set("files_changed", fix.files_changed.join("\n"))
                            .set("updated_at", now)],
                    )
                    .await?;
                self.learning.record_rules_applied(&context.rules).await?;
                info!(task_id, pr_url = %fix.pr_url, "fix run completed");
                Ok(FixOutcome::Completed {
                    pr_url: fix.pr_url,
                    branch: fix.branch,
                    files_changed: fix.files_changed,
                })
            }
            Ok(Err(e)) => {
                warn!(task_id, error = %e, "fix agent failed");
                self.mark_failed(&key, &e.to_string()).await?;
                Ok(FixOutcome::Failed {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(task_id, "fix agent timed out");
                self.mark_failed(&key, "agent execution timed out").await?;
                Ok(FixOutcome::Failed {
                    reason: "agent execution timed out".to_string(),
                })
            }
        }
    }

    async fn build_context(&self, task: &Task, feedback: Option<&str>) -> Result<FixContext> {
        let embedding = self
            .embedder
            .embed(&format!("{}\n{}", task.title, task.summary))
            .await?;
        let similar_fixes = self
            .learning
            .similar_fixes(&embedding, &task.product, SIMILAR_FIXES_K)
            .await?;
        let rules = self.learning.top_rules(&task.product, TOP_RULES_K).await?;

        Ok(FixContext {
            rules,
            similar_fixes,
            feedback: feedback.map(|f| f.to_string()),
            suggested_branch: format!("darwin/{}", task.id),
        })
    }

    async fn mark_failed(&self, key: &str, reason: &str) -> Result<()> {
        let reason: String = reason.chars().take(500).collect();
        self.store
            .update_guarded(
                key,
                "fix_status",
                FixStatus::Running.as_str(),
                &[RecordWrite::new(key.to_string())
                    .set("fix_status", FixStatus::Failed.as_str())
                    .set("fix_error", reason)
                    .set("updated_at", now_epoch().to_string())],
            )
            .await?;
        Ok(())
    }
}
