//! Code-forge client: issue creation for classified tasks.
//!
//! The forge (GitHub or compatible) is an external collaborator; the
//! pipeline only needs one call — create an issue for a task — plus the
//! webhook delivery handled in [`crate::review`]. Authentication comes
//! from `FORGE_TOKEN` (or `GITHUB_TOKEN`); without a token the client is
//! disabled and issue creation reports a provider failure.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;

/// A created issue.
#[derive(Debug, Clone, Serialize)]
pub struct IssueRef {
    pub issue_url: String,
    pub issue_number: i64,
}

#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Create an issue in `repo` (`owner/repo`).
    async fn create_issue(&self, repo: &str, title: &str, body: &str) -> Result<IssueRef>;
}

/// Pick a forge client from the environment: a token enables the GitHub
/// client, otherwise issue creation is disabled.
pub fn create_forge() -> std::sync::Arc<dyn ForgeClient> {
    match forge_token() {
        Some(token) => std::sync::Arc::new(GitHubForge::new(token)),
        None => std::sync::Arc::new(DisabledForge),
    }
}

fn forge_token() -> Option<String> {
    std::env::var("FORGE_TOKEN")
        .or_else(|_| std::env::var("GITHUB_TOKEN"))
        .ok()
        .filter(|t| !t.is_empty())
}

pub struct DisabledForge;

#[async_trait]
impl ForgeClient for DisabledForge {
    async fn create_issue(&self, _repo: &str, _title: &str, _body: &str) -> Result<IssueRef> {
        bail!("forge client is disabled: set FORGE_TOKEN to enable issue creation")
    }
}

/// GitHub REST client (`POST /repos/{repo}/issues`).
pub struct GitHubForge {
    token: String,
    api_base: String,
}

impl GitHubForge {
    pub fn new(token: String) -> Self {
        Self {
            token,
            api_base: std::env::var("FORGE_API_BASE")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
        }
    }
}

#[async_trait]
impl ForgeClient for GitHubForge {
    async fn create_issue(&self, repo: &str, title: &str, body: &str) -> Result<IssueRef> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let url = format!("{}/repos/{}/issues", self.api_base, repo);
        let response = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "darwin-pipeline")
            .json(&serde_json::json!({ "title": title, "body": body }))
            .send()
            .await
            .context("forge request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("forge returned {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let issue_url = json
            .get("html_url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| anyhow!("forge response missing html_url"))?
            .to_string();
        let issue_number = json
            .get("number")
            .and_then(|n| n.as_i64())
            .ok_or_else(|| anyhow!("forge response missing issue number"))?;

        Ok(IssueRef {
            issue_url,
            issue_number,
        })
    }
}
