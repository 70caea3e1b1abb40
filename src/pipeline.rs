use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::delivery::{DigestMessage, Dispatcher};
use crate::digest::{self, DigestEntry, DigestStorage};
use crate::error::{FetchError, PipelineError};
use crate::evaluation::{EvaluationRun, EvaluationService, KeywordEvaluator, PlaceholderSummarizer};
use crate::fetcher::{Fetcher, HttpTransport};
use crate::materialize::Materializer;
use crate::models::{Decision, Delivery, Digest};

#[derive(Debug)]
pub struct PipelineRun {
    pub digest: Digest,
    pub deliveries: Vec<Delivery>,
    /// Items seen for the first time anywhere in the system
    pub new_items: usize,
    /// Items that made it into the digest
    pub included: usize,
    pub failed_sources: Vec<i64>,
}

/// Runs one group from fetch to delivery.
pub struct Pipeline {
    db: Arc<Database>,
    fetcher: Fetcher,
    materializer: Materializer,
    evaluation: EvaluationService,
    storage: DigestStorage,
    dispatcher: Dispatcher,
    lookback_hours: i64,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Pipeline {
    pub fn new(
        db: Arc<Database>,
        fetcher: Fetcher,
        evaluation: EvaluationService,
        storage: DigestStorage,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            materializer: Materializer::new(db.clone()),
            db,
            fetcher,
            evaluation,
            storage,
            dispatcher,
            lookback_hours: 24,
            shutdown: None,
        }
    }

    /// Wire the HTTP transport, keyword evaluator, placeholder summarizer
    /// and SMTP/webhook senders from configuration.
    pub fn from_config(db: Arc<Database>, config: &Config) -> anyhow::Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config.fetch));
        let fetcher = Fetcher::with_config(db.clone(), transport, &config.fetch);
        let evaluation = EvaluationService::new(
            db.clone(),
            Arc::new(KeywordEvaluator::from_config(&config.evaluation)),
            Arc::new(PlaceholderSummarizer),
        );
        let storage = DigestStorage::new(config.storage_dir.clone());
        let dispatcher = Dispatcher::from_config(db.clone(), &config.delivery)?;

        Ok(Self::new(db, fetcher, evaluation, storage, dispatcher)
            .with_lookback_hours(config.pipeline.lookback_hours))
    }

    pub fn with_lookback_hours(mut self, hours: i64) -> Self {
        self.lookback_hours = hours;
        self
    }

    /// Abort between steps once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn ensure_running(&self, step: &'static str) -> Result<(), PipelineError> {
        match &self.shutdown {
            Some(rx) if *rx.borrow() => {
                warn!("Shutdown requested, stopping pipeline before {}", step);
                Err(PipelineError::Cancelled { step })
            }
            _ => Ok(()),
        }
    }

    pub async fn run(
        &self,
        group_id: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<PipelineRun, PipelineError> {
        let group = self
            .db
            .get_group(group_id)
            .await?
            .filter(|g| g.is_enabled)
            .ok_or(PipelineError::GroupNotFound(group_id))?;

        let started_at = Utc::now();
        let since = group
            .last_run_started_at
            .unwrap_or(scheduled_at - TimeDelta::hours(self.lookback_hours));
        info!(
            "Running pipeline for group '{}' scheduled at {} (items since {})",
            group.name, scheduled_at, since
        );

        self.ensure_running("fetch")?;
        let sources = self.db.list_enabled_feed_sources(group_id).await?;
        let fetched = self.fetcher.fetch_group(&sources).await;

        let mut failed_sources = Vec::new();
        for failure in fetched.failures {
            match failure.error {
                FetchError::Repository(e) => return Err(e.into()),
                error => {
                    warn!(
                        "Group '{}': skipping feed {} this run: {}",
                        group.name, failure.url, error
                    );
                    failed_sources.push(failure.feed_source_id);
                }
            }
        }

        self.ensure_running("materialize")?;
        let materialized = self.materializer.materialize(group_id, &fetched.items).await?;

        self.ensure_running("evaluate")?;
        let evaluated = self.evaluation.evaluate_since(group_id, since).await?;

        self.ensure_running("compose")?;
        let entries = self.digest_entries(group_id, &evaluated).await?;
        let markdown = digest::compose(&group.name, scheduled_at, &entries);

        let digest = self
            .db
            .insert_digest(group_id, scheduled_at, &markdown)
            .await?;
        let path = self
            .storage
            .save_digest(group_id, scheduled_at, &markdown)
            .await?;
        let digest = self
            .db
            .set_digest_storage_path(digest.id, &path.to_string_lossy())
            .await?;

        let destinations = self.db.list_enabled_destinations(group_id).await?;
        let message = DigestMessage::new(&group.name, scheduled_at, markdown);
        let deliveries = self
            .dispatcher
            .deliver(digest.id, &destinations, &message)
            .await?;

        self.db
            .update_group_run_times(group_id, started_at, Utc::now())
            .await?;

        info!(
            "Group '{}' digest {} done: {} included, {} deliveries, {} failed feeds",
            group.name,
            digest.id,
            entries.len(),
            deliveries.len(),
            failed_sources.len()
        );

        Ok(PipelineRun {
            digest,
            deliveries,
            new_items: materialized.items.len(),
            included: entries.len(),
            failed_sources,
        })
    }

    async fn digest_entries(
        &self,
        group_id: i64,
        evaluated: &EvaluationRun,
    ) -> Result<Vec<DigestEntry>, PipelineError> {
        let mut entries = Vec::new();
        for evaluation in &evaluated.evaluations {
            if evaluation.decision != Decision::Include {
                continue;
            }
            let Some(item) = self.db.get_item(evaluation.item_id).await? else {
                continue;
            };
            let summary = match evaluated
                .summaries
                .iter()
                .find(|s| s.item_id == item.id)
            {
                Some(summary) => Some(summary.summary_md.clone()),
                None => self
                    .db
                    .find_summary(group_id, item.id)
                    .await?
                    .map(|s| s.summary_md),
            };
            entries.push(DigestEntry {
                canonical_url: item.canonical_url,
                first_seen_at: item.first_seen_at,
                summary,
            });
        }
        Ok(entries)
    }
}
