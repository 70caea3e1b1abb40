//! Relevance scoring and summarization of newly seen group items.
//!
//! Both steps are capability traits held by `EvaluationService`, so an
//! LLM-backed strategy can replace the keyword and placeholder ones without
//! touching the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::EvaluationConfig;
use crate::db::Database;
use crate::error::EvaluationError;
use crate::models::{Decision, ItemEvaluation, ItemSummary};

#[derive(Debug, Clone, PartialEq)]
pub struct Relevance {
    pub score: f64,
    pub decision: Decision,
    pub reason: String,
}

#[async_trait]
pub trait RelevanceEvaluator: Send + Sync {
    async fn evaluate(&self, url: &str) -> anyhow::Result<Relevance>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Markdown summary of the article at `url`.
    async fn summarize(&self, url: &str) -> anyhow::Result<String>;
}

/// Includes any URL containing one of the keywords, ignoring case.
pub struct KeywordEvaluator {
    keywords: Vec<String>,
    include_score: f64,
    exclude_score: f64,
}

impl KeywordEvaluator {
    pub fn new(keywords: &[String]) -> Self {
        Self::from_config(&EvaluationConfig {
            keywords: keywords.to_vec(),
            ..EvaluationConfig::default()
        })
    }

    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self {
            keywords: config
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            include_score: config.include_score,
            exclude_score: config.exclude_score,
        }
    }
}

#[async_trait]
impl RelevanceEvaluator for KeywordEvaluator {
    async fn evaluate(&self, url: &str) -> anyhow::Result<Relevance> {
        let lowered = url.to_lowercase();
        let relevance = if self.keywords.iter().any(|k| lowered.contains(k.as_str())) {
            Relevance {
                score: self.include_score,
                decision: Decision::Include,
                reason: "keyword".to_string(),
            }
        } else {
            Relevance {
                score: self.exclude_score,
                decision: Decision::Exclude,
                reason: "no_keyword".to_string(),
            }
        };
        Ok(relevance)
    }
}

pub struct PlaceholderSummarizer;

#[async_trait]
impl Summarizer for PlaceholderSummarizer {
    async fn summarize(&self, url: &str) -> anyhow::Result<String> {
        Ok(format!("Summary for {}", url))
    }
}

/// Evaluations and summaries produced by one `evaluate_since` call.
#[derive(Debug, Default)]
pub struct EvaluationRun {
    pub evaluations: Vec<ItemEvaluation>,
    pub summaries: Vec<ItemSummary>,
}

pub struct EvaluationService {
    db: Arc<Database>,
    evaluator: Arc<dyn RelevanceEvaluator>,
    summarizer: Arc<dyn Summarizer>,
}

impl EvaluationService {
    pub fn new(
        db: Arc<Database>,
        evaluator: Arc<dyn RelevanceEvaluator>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            db,
            evaluator,
            summarizer,
        }
    }

    /// Evaluate every group item first seen at or after `since` that has no
    /// evaluation yet, and summarize the included ones. Included items whose
    /// summary is still missing are summarized again and reported in the run.
    pub async fn evaluate_since(
        &self,
        group_id: i64,
        since: DateTime<Utc>,
    ) -> Result<EvaluationRun, EvaluationError> {
        let mut run = EvaluationRun::default();

        for group_item in self.db.list_group_items_since(group_id, since).await? {
            let existing = self.db.find_evaluation(group_id, group_item.item_id).await?;
            if matches!(&existing, Some(e) if e.decision == Decision::Exclude) {
                continue;
            }
            let Some(item) = self.db.get_item(group_item.item_id).await? else {
                continue;
            };

            let evaluation = match existing {
                // Included earlier but the summary never landed
                Some(evaluation) => {
                    if self.db.find_summary(group_id, item.id).await?.is_some() {
                        continue;
                    }
                    debug!(
                        "Resuming summary of {} for group {}",
                        item.canonical_url, group_id
                    );
                    evaluation
                }
                None => {
                    let relevance = self
                        .evaluator
                        .evaluate(&item.canonical_url)
                        .await
                        .map_err(|source| EvaluationError::Evaluator {
                            url: item.canonical_url.clone(),
                            source,
                        })?;

                    let Some(evaluation) = self
                        .db
                        .insert_evaluation(
                            group_id,
                            item.id,
                            relevance.score,
                            relevance.decision,
                            &relevance.reason,
                        )
                        .await?
                    else {
                        // Evaluated concurrently by another run
                        continue;
                    };
                    debug!(
                        "Item {} {:?} for group {} ({})",
                        item.canonical_url, evaluation.decision, group_id, evaluation.reason
                    );
                    evaluation
                }
            };

            if evaluation.decision == Decision::Include
                && self.db.find_summary(group_id, item.id).await?.is_none()
            {
                let summary_md = self
                    .summarizer
                    .summarize(&item.canonical_url)
                    .await
                    .map_err(|source| EvaluationError::Summarizer {
                        url: item.canonical_url.clone(),
                        source,
                    })?;
                if let Some(summary) = self.db.insert_summary(group_id, item.id, &summary_md).await? {
                    run.summaries.push(summary);
                }
            }

            run.evaluations.push(evaluation);
        }

        info!(
            "Evaluated {} items for group {} ({} summarized)",
            run.evaluations.len(),
            group_id,
            run.summaries.len()
        );
        Ok(run)
    }
}
