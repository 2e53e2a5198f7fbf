//! LLM provider abstraction and the OpenAI-compatible client.
//!
//! The pipeline uses the LLM for two jobs: classifying topics into tasks
//! ([`crate::classify`]) and extracting rules from review feedback
//! ([`crate::learning`]). Both expect a JSON object back; models sometimes
//! wrap it in prose, so [`extract_json`] scans for the outermost braces
//! before parsing.
//!
//! Transport failures (timeouts, 429, 5xx) surface from
//! [`LlmProvider::complete`] and are retried by the caller's schedule.
//! A successful completion that fails schema validation is a different
//! failure class — callers get at most one retry before dead-lettering.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::config::LlmConfig;
use crate::models::TaskCategory;

/// Trait for LLM completion providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;
    /// Run a completion and return the raw text of the first choice.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Create the configured [`LlmProvider`].
pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledLlm)),
        "openai" => Ok(Box::new(OpenAiLlm::new(config)?)),
        other => bail!("Unknown llm provider: '{}'", other),
    }
}

/// A no-op provider that always errors; used when classification is not
/// configured.
pub struct DisabledLlm;

#[async_trait]
impl LlmProvider for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        bail!("LLM provider is disabled")
    }
}

/// OpenAI-compatible chat-completions client.
///
/// Requires `OPENAI_API_KEY`. Retries 429 and 5xx with exponential
/// backoff; other 4xx fail immediately.
pub struct OpenAiLlm {
    model: String,
    endpoint: String,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            model: config.model.clone(),
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        })
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[async_trait]
impl LlmProvider for OpenAiLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let body = serde_json::json!({
            "model": self.model,
            "messages": [ChatMessage { role: "user", content: prompt }],
            "temperature": 0.0,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let content = json
                            .get("choices")
                            .and_then(|c| c.as_array())
                            .and_then(|c| c.first())
                            .and_then(|c| c.get("message"))
                            .and_then(|m| m.get("content"))
                            .and_then(|c| c.as_str())
                            .ok_or_else(|| anyhow!("invalid completion response shape"))?;
                        return Ok(content.to_string());
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("LLM API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("LLM API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("LLM call failed after retries")))
    }
}

/// Find and parse the outermost JSON object in a completion.
///
/// Models occasionally wrap the requested JSON in explanation text or a
/// code fence; scanning from the first `{` to the last `}` recovers it.
pub fn extract_json(text: &str) -> Result<serde_json::Value> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow!("no JSON object found in LLM response"))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| anyhow!("no JSON object found in LLM response"))?;
    if end < start {
        bail!("no JSON object found in LLM response");
    }
    serde_json::from_str(&text[start..=end]).map_err(|e| anyhow!("invalid JSON in LLM response: {}", e))
}

/// The structured result a topic classification must produce.
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: TaskCategory,
    pub title: String,
    pub summary: String,
    pub severity: String,
    pub suggested_action: String,
    pub confidence: f32,
}

impl Classification {
    /// Validate a parsed completion against the classification schema.
    /// Any value outside the §3 enumerations is a schema failure.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let category_raw = value
            .get("category")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("classification missing 'category'"))?;
        let category = TaskCategory::parse(category_raw)?;

        let confidence = value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow!("classification missing 'confidence'"))?
            as f32;
        if !(0.0..=1.0).contains(&confidence) {
            bail!("classification confidence {} out of [0, 1]", confidence);
        }

        let field = |name: &str| -> String {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string()
        };

        let title = field("title");
        if title.is_empty() {
            bail!("classification missing 'title'");
        }

        Ok(Classification {
            category,
            title,
            summary: field("summary"),
            severity: field("severity"),
            suggested_action: field("suggested_action"),
            confidence,
        })
    }
}
