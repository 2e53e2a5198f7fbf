//! # Darwin
//!
//! **An autonomous pipeline that turns raw user feedback into code-change
//! proposals.**
//!
//! Darwin ingests signals (forum posts, web pages, Reddit threads), embeds
//! and clusters them online into topics, classifies topics into actionable
//! tasks with an LLM, hands tasks to an external coding agent, and folds
//! pull-request review outcomes back into a learning store of successful
//! fixes and style rules.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌─────────────┐   ┌───────────────┐
//! │ Scrapers │──▶│ Ingest  │──▶│ queue:      │──▶│  EmbedWorker  │
//! │ (extern) │   │ (dedup) │   │  to-embed   │   │  + Clusterer  │
//! └──────────┘   └─────────┘   └─────────────┘   └──────┬────────┘
//!                                                       ▼
//!                                                ┌──────────────┐
//!                                                │    Topic     │
//!                                                └──────┬───────┘
//!                                                       ▼
//!   ┌───────────────┐   ┌──────────┐   ┌───────────────────────┐
//!   │ LearningStore │◀──│ Review   │◀──│ ClassifyWorker → Task │
//!   │ fixes + rules │   │ webhook  │   │     → FixRunner → PR  │
//!   └───────────────┘   └──────────┘   └───────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. Scraper adapters POST batches of raw signals to `/ingest`.
//! 2. [`ingest`] normalizes each signal, computes its SHA-256 content hash,
//!    stores new ones, and enqueues them for embedding. Duplicates only
//!    bump `last_seen`.
//! 3. The embed worker ([`workers::embed`]) drains the queue, embeds the
//!    normalized text ([`embedding`]), and asks the [`cluster`] module to
//!    attach the signal to an open topic, send it to triage, or promote a
//!    new topic.
//! 4. New topics flow through the classify worker ([`workers::classify`]),
//!    which calls the LLM ([`llm`]) with a structured schema and
//!    materializes a [`models::Task`] for actionable outcomes.
//! 5. The fix runner ([`fix`]) guards at-most-one concurrent fix per task,
//!    assembles context from the [`learning`] store (similar past fixes +
//!    style rules), and invokes the external coding agent.
//! 6. Forge webhooks land on `/webhooks/forge` ([`review`]): merges create
//!    a `SuccessfulFix`, change requests extract new rules and optionally
//!    re-enter the fix runner.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Record types: `Signal`, `Topic`, `Task`, `SuccessfulFix`, `Rule` |
//! | [`store`] | Storage abstraction: records, durable queues, vector indices |
//! | [`embedding`] | Embedder trait, local + remote providers, vector helpers |
//! | [`ingest`] | Normalization, dedup, and enqueue-for-embedding |
//! | [`cluster`] | Online nearest-neighbor clustering with triage band |
//! | [`llm`] | LLM provider trait and OpenAI-compatible client |
//! | [`classify`] | Topic classification prompts and task materialization |
//! | [`learning`] | Successful-fix retrieval, style rules, rule extraction |
//! | [`fix`] | Fix runner transition guards and coding-agent boundary |
//! | [`forge`] | Code-forge client (issues) |
//! | [`review`] | Webhook verification and the review state machine |
//! | [`workers`] | Background worker loops and supervision |
//! | [`server`] | HTTP API (axum) |
//! | [`context`] | Explicit application wiring (no globals) |

pub mod classify;
pub mod cluster;
pub mod config;
pub mod context;
pub mod embedding;
pub mod fix;
pub mod forge;
pub mod ingest;
pub mod learning;
pub mod llm;
pub mod models;
pub mod review;
pub mod server;
pub mod store;
pub mod workers;
