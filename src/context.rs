//! Explicit application wiring.
//!
//! Everything the HTTP handlers and workers need hangs off one
//! [`AppContext`] built at startup and passed around by `Arc` — no
//! process-wide singletons. Construction is split so the CLI can map
//! failure phases to exit codes: the store is connected first (store
//! unavailable), then providers are created (provider failure), then
//! [`AppContext::new`] wires the services, which cannot fail.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::cluster::Clusterer;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::fix::{CodingAgent, FixRunner};
use crate::forge::ForgeClient;
use crate::ingest::IngestService;
use crate::learning::LearningStore;
use crate::llm::LlmProvider;
use crate::review::ReviewHandler;
use crate::store::{SharedStore, IDX_FIXES, IDX_TOPICS};
use crate::workers::classify::ClassifyWorker;
use crate::workers::embed::EmbedWorker;
use crate::workers::{spawn_supervised, WorkerHandle};

pub struct AppContext {
    pub config: Arc<Config>,
    pub store: SharedStore,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn LlmProvider>,
    pub forge: Arc<dyn ForgeClient>,
    pub ingest: Arc<IngestService>,
    pub learning: Arc<LearningStore>,
    pub fix_runner: Arc<FixRunner>,
    pub review: Arc<ReviewHandler>,
    clusterer: Arc<Clusterer>,
}

impl AppContext {
    /// Declare the vector indices the pipeline relies on. Run by `init`
    /// and again at `serve` startup (idempotent; width drift errors out).
    pub async fn declare_indices(store: &SharedStore, config: &Config) -> Result<()> {
        store.declare_index(IDX_TOPICS, config.embedding.dim).await?;
        store.declare_index(IDX_FIXES, config.embedding.dim).await?;
        Ok(())
    }

    pub fn new(
        config: Config,
        store: SharedStore,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmProvider>,
        agent: Arc<dyn CodingAgent>,
        forge: Arc<dyn ForgeClient>,
    ) -> Self {
        let config = Arc::new(config);
        let ingest = Arc::new(IngestService::new(
            store.clone(),
            config.worker.embed_backpressure,
        ));
        let learning = Arc::new(LearningStore::new(store.clone()));
        let clusterer = Arc::new(Clusterer::new(store.clone(), &config.cluster));
        let fix_runner = Arc::new(FixRunner::new(
            store.clone(),
            learning.clone(),
            embedder.clone(),
            agent,
            Duration::from_secs(config.fix.agent_timeout_secs),
        ));
        let review = Arc::new(ReviewHandler::new(
            store.clone(),
            learning.clone(),
            llm.clone(),
            embedder.clone(),
            config.fix.auto_iterate,
            config.fix.auto_iter_max,
        ));

        Self {
            config,
            store,
            embedder,
            llm,
            forge,
            ingest,
            learning,
            fix_runner,
            review,
            clusterer,
        }
    }

    /// Spawn the per-process background workers (one embed, one classify).
    pub fn spawn_workers(&self) -> Vec<WorkerHandle> {
        let embed = Arc::new(EmbedWorker {
            store: self.store.clone(),
            embedder: self.embedder.clone(),
            clusterer: self.clusterer.clone(),
            config: self.config.worker.clone(),
        });
        let classify = Arc::new(ClassifyWorker {
            store: self.store.clone(),
            llm: self.llm.clone(),
            confidence_min: self.config.classify.confidence_min,
            fix_runner: if self.config.classify.auto_fix {
                Some(self.fix_runner.clone())
            } else {
                None
            },
            config: self.config.worker.clone(),
        });

        vec![
            spawn_supervised("embed", move |shutdown| {
                let worker = embed.clone();
                async move { worker.run(shutdown).await }
            }),
            spawn_supervised("classify", move |shutdown| {
                let worker = classify.clone();
                async move { worker.run(shutdown).await }
            }),
        ]
    }

    /// Drain and stop a set of workers within the configured deadline.
    pub async fn shutdown_workers(&self, handles: Vec<WorkerHandle>) {
        let drain = Duration::from_secs(self.config.worker.drain_timeout_secs);
        for handle in handles {
            handle.shutdown(drain).await;
        }
    }
}
