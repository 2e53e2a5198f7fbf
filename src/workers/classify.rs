//! The classify worker: drains `queue:to-classify` and turns topics into
//! tasks.
//!
//! Per topic id:
//! 1. Load the topic and its most recent signals.
//! 2. Call the LLM with the structured classification prompt. Transport
//!    errors retry on the embed schedule; after the budget the topic id
//!    moves to `queue:to-classify:dead`.
//! 3. Validate the completion against the schema. A schema failure gets
//!    exactly one fresh completion before dead-lettering.
//! 4. Materialize: annotate the topic and create/refresh the task for
//!    actionable outcomes.
//! 5. When auto-fix is on, a created task immediately enters the fix
//!    runner (spawned; classification never blocks on an agent).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::classify::{build_prompt, load_topic_bundle, materialize, ClassifyOutcome};
use crate::config::WorkerConfig;
use crate::fix::FixRunner;
use crate::llm::{extract_json, Classification, LlmProvider};
use crate::store::{SharedStore, QUEUE_CLASSIFY, QUEUE_CLASSIFY_DEAD};
use crate::workers::{backoff_delay, dead_letter_entry, sleep_or_shutdown};

pub struct ClassifyWorker {
    pub store: SharedStore,
    pub llm: Arc<dyn LlmProvider>,
    pub confidence_min: f32,
    /// Present when `classify.auto_fix` is enabled.
    pub fix_runner: Option<Arc<FixRunner>>,
    pub config: WorkerConfig,
}

impl ClassifyWorker {
    /// Worker loop; returns `Ok(())` on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let topic_id = match self.store.queue_pop(QUEUE_CLASSIFY).await {
                Ok(Some(topic_id)) => topic_id,
                Ok(None) => {
                    if sleep_or_shutdown(&mut shutdown, poll).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "classify queue pop failed, backing off");
                    if sleep_or_shutdown(
                        &mut shutdown,
                        Duration::from_millis(self.config.backoff_cap_ms),
                    )
                    .await
                    {
                        return Ok(());
                    }
                    continue;
                }
            };

            self.process_one(&topic_id, &mut shutdown).await;
        }
    }

    /// Process a single queue item. Public so operators and tests can
    /// drive the pipeline one step at a time.
    pub async fn process_one(&self, topic_id: &str, shutdown: &mut watch::Receiver<bool>) {
        let bundle = match load_topic_bundle(&self.store, topic_id).await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(topic_id, error = %e, "topic unavailable for classification, dropped");
                return;
            }
        };
        let prompt = build_prompt(&bundle);

        // One schema retry: a fresh completion sometimes fixes a malformed
        // one, but a model that keeps returning junk goes to dead letters.
        let mut classification = None;
        for schema_attempt in 0..2 {
            let completion = match self.complete_with_retry(&prompt, shutdown).await {
                Some(completion) => completion,
                None => {
                    self.dead_letter(topic_id, "llm transport failed after retries")
                        .await;
                    return;
                }
            };

            match extract_json(&completion).and_then(|v| Classification::from_json(&v)) {
                Ok(parsed) => {
                    classification = Some(parsed);
                    break;
                }
                Err(e) => {
                    warn!(
                        topic_id,
                        schema_attempt,
                        error = %e,
                        "classification failed schema validation"
                    );
                }
            }
        }

        let classification = match classification {
            Some(classification) => classification,
            None => {
                self.dead_letter(topic_id, "classification failed schema validation")
                    .await;
                return;
            }
        };

        let outcome = match materialize(&self.store, &bundle, &classification, self.confidence_min)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(topic_id, error = %e, "failed to materialize classification, requeued");
                let _ = self.store.queue_push(QUEUE_CLASSIFY, topic_id).await;
                return;
            }
        };

        if let (ClassifyOutcome::TaskCreated(task), Some(runner)) =
            (&outcome, self.fix_runner.as_ref())
        {
            let runner = runner.clone();
            let task_id = task.id.clone();
            info!(task_id = %task_id, "auto-fix launching for new task");
            tokio::spawn(async move {
                if let Err(e) = runner.run(&task_id, None).await {
                    warn!(task_id = %task_id, error = %e, "auto-fix run errored");
                }
            });
        }
    }

    /// LLM call with the bounded transport-retry schedule.
    async fn complete_with_retry(
        &self,
        prompt: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<String> {
        for attempt in 0..=self.config.embed_max_retries {
            if attempt > 0 {
                let delay = backoff_delay(
                    attempt - 1,
                    self.config.backoff_base_ms,
                    self.config.backoff_cap_ms,
                );
                if sleep_or_shutdown(shutdown, delay).await {
                    return None;
                }
            }
            match self.llm.complete(prompt).await {
                Ok(completion) => return Some(completion),
                Err(e) => {
                    warn!(attempt, error = %e, "classification LLM call failed");
                }
            }
        }
        None
    }

    async fn dead_letter(&self, topic_id: &str, reason: &str) {
        let entry = dead_letter_entry(topic_id, reason);
        if let Err(e) = self.store.queue_push(QUEUE_CLASSIFY_DEAD, &entry).await {
            warn!(topic_id, error = %e, "failed to dead-letter topic");
        }
        warn!(topic_id, reason, "topic dead-lettered");
    }
}
