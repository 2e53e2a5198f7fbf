//! The learning store: successful fixes and style rules.
//!
//! Two retrieval surfaces feed the fix runner's context:
//!
//! - **Similar fixes** — merged PRs indexed by the embedding of their
//!   task's `title + "\n" + summary`, retrieved by cosine similarity.
//! - **Top rules** — short reusable instructions per product, ranked by
//!   how often they have been applied and how recently.
//!
//! Rules come from two sources: manual entry and LLM extraction from
//! "changes requested" review feedback. Upserts deduplicate by normalized
//! content per product, so a repeated piece of feedback strengthens an
//! existing rule instead of duplicating it.

use anyhow::{anyhow, bail, Result};
use tracing::{debug, info};
use uuid::Uuid;

use crate::embedding::Embedder;
use crate::ingest::normalize;
use crate::llm::{extract_json, LlmProvider};
use crate::models::{
    fix_success_key, now_epoch, rule_key, Rule, RuleCategory, RuleSource, SuccessfulFix, Task,
};
use crate::store::{SharedStore, IDX_FIXES};

/// Default number of similar fixes retrieved for a fix prompt.
pub const SIMILAR_FIXES_K: usize = 3;
/// Similarity floor below which a past fix is not considered relevant.
pub const SIMILAR_FIXES_MIN_SIM: f32 = 0.5;
/// Default number of rules included in a fix prompt.
pub const TOP_RULES_K: usize = 20;
/// Maximum rule content length after trimming.
pub const RULE_MAX_CHARS: usize = 500;

pub struct LearningStore {
    store: SharedStore,
}

impl LearningStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Top-k past fixes for `product` by cosine similarity to
    /// `embedding`, dropping anything below the 0.5 floor.
    pub async fn similar_fixes(
        &self,
        embedding: &[f32],
        product: &str,
        k: usize,
    ) -> Result<Vec<SuccessfulFix>> {
        let hits = self
            .store
            .index_search(IDX_FIXES, embedding, k, &[("product", product)])
            .await?;

        let mut fixes = Vec::new();
        for hit in hits {
            if hit.similarity < SIMILAR_FIXES_MIN_SIM {
                continue;
            }
            if let Some(fields) = self.store.get_record(&fix_success_key(&hit.key)).await? {
                fixes.push(SuccessfulFix::from_fields(&fields)?);
            }
        }
        Ok(fixes)
    }

    /// All rules for `product` ranked by
    /// (`times_applied` desc, `last_applied_at` desc, `created_at` asc),
    /// truncated to `k`.
    pub async fn top_rules(&self, product: &str, k: usize) -> Result<Vec<Rule>> {
        let mut rules = self.load_rules(product).await?;
        rules.sort_by(|a, b| {
            b.times_applied
                .cmp(&a.times_applied)
                .then(b.last_applied_at.cmp(&a.last_applied_at))
                .then(a.created_at.cmp(&b.created_at))
        });
        rules.truncate(k);
        Ok(rules)
    }

    /// All rules for a product, newest first (admin listing).
    pub async fn list_rules(&self, product: &str) -> Result<Vec<Rule>> {
        let mut rules = self.load_rules(product).await?;
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn load_rules(&self, product: &str) -> Result<Vec<Rule>> {
        let prefix = format!("rule:{}:", product);
        let mut rules = Vec::new();
        for (_, record) in self.store.scan_records(&prefix).await? {
            rules.push(Rule::from_fields(&record)?);
        }
        Ok(rules)
    }

    /// Record a merged PR as a successful fix and index its embedding.
    ///
    /// Write-once per task: returns `false` without touching anything if
    /// the record already exists, which makes duplicate merge webhooks
    /// no-ops.
    pub async fn store_success(
        &self,
        task: &Task,
        pr_title: &str,
        files_changed: &[String],
        embedder: &dyn Embedder,
    ) -> Result<bool> {
        let key = fix_success_key(&task.id);
        if self.store.get_record(&key).await?.is_some() {
            debug!(task_id = %task.id, "successful fix already recorded");
            return Ok(false);
        }

        let pr_url = task
            .pr_url
            .clone()
            .ok_or_else(|| anyhow!("task {} has no pr_url to record", task.id))?;
        let text = format!("{}\n{}", task.title, task.summary);
        let embedding = embedder.embed(&text).await?;

        let fix = SuccessfulFix {
            task_id: task.id.clone(),
            topic_id: task.topic_id.clone(),
            category: task.category,
            title: task.title.clone(),
            summary: task.summary.clone(),
            product: task.product.clone(),
            pr_url,
            pr_title: pr_title.to_string(),
            branch: task.branch.clone().unwrap_or_default(),
            merged_at: now_epoch(),
            files_changed: files_changed.to_vec(),
            embedding: embedding.clone(),
        };

        self.store.put_record(&key, &fix.to_fields()).await?;

        let mut filters = std::collections::BTreeMap::new();
        filters.insert("product".to_string(), fix.product.clone());
        filters.insert("category".to_string(), fix.category.as_str().to_string());
        self.store
            .index_upsert(IDX_FIXES, &task.id, &embedding, &filters)
            .await?;

        info!(task_id = %task.id, product = %fix.product, "successful fix recorded");
        Ok(true)
    }

    /// Create a rule, or — when a rule with the same normalized content
    /// already exists for the product — strengthen it by bumping
    /// `times_applied` and `last_applied_at`.
    pub async fn upsert_rule(
        &self,
        product: &str,
        content: &str,
        category: RuleCategory,
        source: RuleSource,
        source_task_id: Option<&str>,
        reviewer: Option<&str>,
    ) -> Result<Rule> {
        let content = content.trim();
        if content.is_empty() {
            bail!("rule content must not be empty");
        }
        if content.chars().count() > RULE_MAX_CHARS {
            bail!("rule content exceeds {} characters", RULE_MAX_CHARS);
        }

        let normalized = normalize(content);
        for rule in self.load_rules(product).await? {
            if normalize(&rule.content) == normalized {
                let key = rule_key(product, &rule.id);
                self.store.incr_field(&key, "times_applied", 1).await?;
                self.store
                    .set_field(&key, "last_applied_at", &now_epoch().to_string())
                    .await?;
                let fields = self
                    .store
                    .get_record(&key)
                    .await?
                    .ok_or_else(|| anyhow!("rule {} vanished during upsert", rule.id))?;
                let updated = Rule::from_fields(&fields)?;
                debug!(rule_id = %updated.id, product, "duplicate rule strengthened");
                return Ok(updated);
            }
        }

        let rule = Rule {
            id: Uuid::new_v4().to_string(),
            product: product.to_string(),
            content: content.to_string(),
            category,
            source,
            source_task_id: source_task_id.map(|s| s.to_string()),
            reviewer: reviewer.map(|s| s.to_string()),
            times_applied: 0,
            last_applied_at: 0,
            created_at: now_epoch(),
        };
        self.store
            .put_record(&rule_key(product, &rule.id), &rule.to_fields())
            .await?;
        info!(rule_id = %rule.id, product, category = category.as_str(), "rule created");
        Ok(rule)
    }

    pub async fn delete_rule(&self, product: &str, rule_id: &str) -> Result<bool> {
        self.store.delete_record(&rule_key(product, rule_id)).await
    }

    /// Bump usage counters for every rule that went into a fix prompt.
    pub async fn record_rules_applied(&self, rules: &[Rule]) -> Result<()> {
        let now = now_epoch().to_string();
        for rule in rules {
            let key = rule_key(&rule.product, &rule.id);
            self.store.incr_field(&key, "times_applied", 1).await?;
            self.store.set_field(&key, "last_applied_at", &now).await?;
        }
        Ok(())
    }
}

/// Render rules for inclusion in an agent prompt:
/// `1. Use early returns (style) [applied 3x]`.
pub fn format_rules_for_prompt(rules: &[Rule]) -> String {
    if rules.is_empty() {
        return "No style rules learned yet for this product.".to_string();
    }
    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let usage = if rule.times_applied > 0 {
                format!("[applied {}x]", rule.times_applied)
            } else {
                "[new]".to_string()
            };
            format!(
                "{}. {} ({}) {}",
                i + 1,
                rule.content,
                rule.category.as_str(),
                usage
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

const RULE_EXTRACTION_PROMPT: &str = r#"You are analyzing code review feedback to extract generalizable coding rules.

Given this code review feedback:
"{feedback}"

Extract actionable coding style rules that should be remembered for future fixes on this codebase.

Only extract rules that are:
1. Generalizable - apply broadly, not just to this specific change
2. Actionable - clear what the developer should do
3. About code quality - style, conventions, patterns, or constraints

Categories: style, convention, workflow, constraint.

Return a JSON object of this shape:
{"rules": [{"content": "rule description", "category": "style|convention|workflow|constraint"}]}

If the feedback is too specific to extract generalizable rules, return {"rules": []}.
Return ONLY the JSON object, no additional text."#;

/// Ask the LLM to distill review feedback into zero or more rules.
///
/// Invalid categories fall back to `convention`; over-long or empty
/// contents are dropped. Transport errors propagate to the caller's retry
/// schedule; an unparseable completion yields an empty list.
pub async fn extract_rules_from_feedback(
    llm: &dyn LlmProvider,
    feedback: &str,
) -> Result<Vec<(String, RuleCategory)>> {
    let feedback = feedback.trim();
    if feedback.len() < 10 {
        debug!("feedback too short to extract rules");
        return Ok(Vec::new());
    }

    let excerpt: String = feedback.chars().take(2000).collect();
    let prompt = RULE_EXTRACTION_PROMPT.replace("{feedback}", &excerpt);
    let completion = llm.complete(&prompt).await?;

    let value = match extract_json(&completion) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "no usable JSON in rule extraction response");
            return Ok(Vec::new());
        }
    };

    let mut rules = Vec::new();
    for item in value
        .get("rules")
        .and_then(|r| r.as_array())
        .into_iter()
        .flatten()
    {
        let content = item
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() || content.chars().count() > RULE_MAX_CHARS {
            continue;
        }
        let category = item
            .get("category")
            .and_then(|c| c.as_str())
            .and_then(|c| RuleCategory::parse(c).ok())
            .unwrap_or(RuleCategory::Convention);
        rules.push((content, category));
    }

    info!(count = rules.len(), "rules extracted from review feedback");
    Ok(rules)
}
