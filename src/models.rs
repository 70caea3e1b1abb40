use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Decision {
    Include,
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DestinationKind {
    Email,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    /// IANA timezone name, e.g. `Europe/Berlin`
    pub timezone: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Group {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: String,
    pub is_enabled: bool,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct GroupSchedule {
    pub id: i64,
    pub group_id: i64,
    pub time_hhmm: String,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct GroupDestination {
    pub id: i64,
    pub group_id: i64,
    pub kind: DestinationKind,
    /// Email address or webhook URL
    pub target: String,
    pub token: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct FeedSource {
    pub id: i64,
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub consecutive_failures: i64,
    pub fetch_count: i64,
    pub not_modified_count: i64,
    pub failure_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct GroupFeed {
    pub id: i64,
    pub group_id: i64,
    pub feed_source_id: i64,
    pub enabled: bool,
}

/// A raw entry as seen in one feed, deduplicated by its GUID hash.
#[derive(Debug, Clone, FromRow)]
pub struct FeedItem {
    pub id: i64,
    pub feed_source_id: i64,
    pub guid_hash: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub canonical_url_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewFeedItem {
    pub feed_source_id: i64,
    pub guid_hash: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub canonical_url_hash: String,
}

/// One real-world article, however many feeds carry it.
#[derive(Debug, Clone, FromRow)]
pub struct Item {
    pub id: i64,
    pub canonical_url: String,
    pub canonical_url_hash: String,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct GroupItem {
    pub id: i64,
    pub group_id: i64,
    pub item_id: i64,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ItemEvaluation {
    pub id: i64,
    pub group_id: i64,
    pub item_id: i64,
    pub relevance_score: f64,
    pub decision: Decision,
    pub reason: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct ItemSummary {
    pub id: i64,
    pub group_id: i64,
    pub item_id: i64,
    pub summary_md: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Digest {
    pub id: i64,
    pub group_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub markdown_body: String,
    pub storage_path: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Delivery {
    pub id: i64,
    pub digest_id: i64,
    pub destination_id: i64,
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRun {
    pub id: i64,
    pub group_id: i64,
    pub job_type: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
