use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::canonical::{canonical_hash, sha256_hex};
use crate::config::FetchConfig;
use crate::db::Database;
use crate::error::FetchError;
use crate::models::{FeedItem, FeedSource, HealthStatus, NewFeedItem};

/// One entry as delivered by a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub guid: Option<String>,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub entries: Vec<FeedEntry>,
}

impl FetchResponse {
    pub fn not_modified(source: &FeedSource) -> Self {
        Self {
            status: StatusCode::NOT_MODIFIED.as_u16(),
            etag: source.etag.clone(),
            last_modified: source.last_modified.clone(),
            entries: Vec::new(),
        }
    }
}

/// Retrieves the current content of a feed source.
///
/// Implementations report HTTP-level outcomes through `FetchResponse::status`
/// and reserve `Err` for faults where no response was obtained at all.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn fetch(&self, source: &FeedSource) -> Result<FetchResponse, FetchError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }

    fn parse_entries(bytes: &[u8]) -> Result<Vec<FeedEntry>, FetchError> {
        // Leave missing ids empty instead of synthesizing one from link and title
        let parsed = parser::Builder::new()
            .id_generator(|_links, _title, _uri| String::new())
            .build()
            .parse(bytes)
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let mut entries = Vec::with_capacity(parsed.entries.len());
        for entry in parsed.entries {
            let Some(url) = entry.links.first().map(|l| l.href.clone()) else {
                debug!("Skipping entry with no link: {}", entry.id);
                continue;
            };
            let guid = Some(entry.id.clone()).filter(|id| !id.is_empty());
            let published_at: Option<DateTime<Utc>> =
                entry.published.or(entry.updated).map(|dt| dt.into());

            entries.push(FeedEntry {
                guid,
                url,
                published_at,
            });
        }
        Ok(entries)
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.to_string())
    }
}

#[async_trait]
impl FeedTransport for HttpTransport {
    async fn fetch(&self, source: &FeedSource) -> Result<FetchResponse, FetchError> {
        let mut request = self.client.get(&source.url);
        if let Some(etag) = &source.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &source.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse::not_modified(source));
        }
        if !status.is_success() {
            return Ok(FetchResponse {
                status: status.as_u16(),
                ..Default::default()
            });
        }

        let etag = header_value(&response, ETAG);
        let last_modified = header_value(&response, LAST_MODIFIED);
        let bytes = response.bytes().await.map_err(transport_error)?;
        let entries = Self::parse_entries(&bytes)?;

        Ok(FetchResponse {
            status: status.as_u16(),
            etag,
            last_modified,
            entries,
        })
    }
}

#[derive(Debug)]
pub struct SourceFailure {
    pub feed_source_id: i64,
    pub url: String,
    pub error: FetchError,
}

/// Outcome of fetching every source of one group.
#[derive(Debug, Default)]
pub struct GroupFetch {
    pub items: Vec<FeedItem>,
    pub failures: Vec<SourceFailure>,
}

pub struct Fetcher {
    db: Arc<Database>,
    transport: Arc<dyn FeedTransport>,
    dead_after_failures: i64,
    concurrency: usize,
}

impl Fetcher {
    pub fn new(db: Arc<Database>, transport: Arc<dyn FeedTransport>) -> Self {
        Self::with_config(db, transport, &FetchConfig::default())
    }

    pub fn with_config(
        db: Arc<Database>,
        transport: Arc<dyn FeedTransport>,
        config: &FetchConfig,
    ) -> Self {
        Self {
            db,
            transport,
            dead_after_failures: config.dead_after_failures,
            concurrency: config.concurrency.max(1),
        }
    }

    /// Fetch one source and store the entries it has not delivered before.
    ///
    /// Health bookkeeping happens before returning, so a failed fetch is
    /// already recorded when the error reaches the caller.
    pub async fn fetch(&self, source: &FeedSource) -> Result<Vec<FeedItem>, FetchError> {
        let fetched_at = Utc::now();

        let response = match self.transport.fetch(source).await {
            Ok(response) => response,
            Err(e) => {
                self.record_failure(source, fetched_at, &e).await?;
                return Err(e);
            }
        };

        if response.status == StatusCode::NOT_MODIFIED.as_u16() {
            self.db
                .record_fetch_not_modified(source.id, fetched_at)
                .await?;
            debug!("Feed {} not modified", source.url);
            return Ok(Vec::new());
        }

        if !(200..300).contains(&response.status) {
            let error = FetchError::Status(response.status);
            self.record_failure(source, fetched_at, &error).await?;
            return Err(error);
        }

        let mut new_items = Vec::new();
        for entry in &response.entries {
            let guid_hash = sha256_hex(entry.guid.as_deref().unwrap_or(&entry.url));
            let item = NewFeedItem {
                feed_source_id: source.id,
                guid_hash,
                url: entry.url.clone(),
                published_at: entry.published_at,
                canonical_url_hash: canonical_hash(&entry.url),
            };
            if let Some(stored) = self.db.insert_feed_item(&item).await? {
                new_items.push(stored);
            }
        }

        self.db
            .record_fetch_success(
                source.id,
                response.etag.as_deref(),
                response.last_modified.as_deref(),
                fetched_at,
            )
            .await?;

        info!(
            "Fetched {} new items from {} ({} entries)",
            new_items.len(),
            source.url,
            response.entries.len()
        );
        Ok(new_items)
    }

    async fn record_failure(
        &self,
        source: &FeedSource,
        fetched_at: DateTime<Utc>,
        error: &FetchError,
    ) -> Result<(), FetchError> {
        let updated = self
            .db
            .record_fetch_failure(source.id, fetched_at, self.dead_after_failures)
            .await?;

        if updated.health_status == HealthStatus::Dead {
            warn!(
                "Feed {} is dead after {} consecutive failures: {}",
                source.url, updated.consecutive_failures, error
            );
        } else {
            warn!(
                "Feed {} failed ({} consecutive): {}",
                source.url, updated.consecutive_failures, error
            );
        }
        Ok(())
    }

    /// Fetch every source, a bounded number at a time. A failing source is
    /// reported in `failures` and never stops the others.
    pub async fn fetch_group(&self, sources: &[FeedSource]) -> GroupFetch {
        let fetches: Vec<_> = sources
            .iter()
            .map(|source| async move { (source, self.fetch(source).await) }.boxed())
            .collect();
        let results: Vec<(&FeedSource, Result<Vec<FeedItem>, FetchError>)> =
            stream::iter(fetches)
                .buffered(self.concurrency)
                .collect()
                .await;

        let mut outcome = GroupFetch::default();
        for (source, result) in results {
            match result {
                Ok(items) => outcome.items.extend(items),
                Err(error) => outcome.failures.push(SourceFailure {
                    feed_source_id: source.id,
                    url: source.url.clone(),
                    error,
                }),
            }
        }
        outcome
    }
}
