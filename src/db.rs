use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::config::Config;
use crate::error::{RepositoryError, ValidationError};
use crate::models::{
    Decision, Delivery, DeliveryStatus, DestinationKind, Digest, FeedItem, FeedSource, Group,
    GroupDestination, GroupFeed, GroupItem, GroupSchedule, Item, ItemEvaluation, ItemSummary, JobRun,
    JobStatus, NewFeedItem, User,
};
use crate::scheduler::ScheduleTime;

pub type DbResult<T> = Result<T, RepositoryError>;

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> DbResult<Self> {
        // Every connection to an in-memory database is a separate database
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(database_url).await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> DbResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT '',
                timezone TEXT NOT NULL DEFAULT 'UTC'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                is_enabled INTEGER NOT NULL DEFAULT 1,
                last_run_started_at TEXT,
                last_run_completed_at TEXT,
                UNIQUE(user_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_schedules (
                id INTEGER PRIMARY KEY,
                group_id INTEGER NOT NULL REFERENCES groups(id),
                time_hhmm TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_fired_at TEXT,
                UNIQUE(group_id, time_hhmm)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_destinations (
                id INTEGER PRIMARY KEY,
                group_id INTEGER NOT NULL REFERENCES groups(id),
                kind TEXT NOT NULL,
                target TEXT NOT NULL,
                token TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                UNIQUE(group_id, kind, target)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_sources (
                id INTEGER PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                etag TEXT,
                last_modified TEXT,
                last_fetch_at TEXT,
                health_status TEXT NOT NULL DEFAULT 'healthy',
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                fetch_count INTEGER NOT NULL DEFAULT 0,
                not_modified_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_feeds (
                id INTEGER PRIMARY KEY,
                group_id INTEGER NOT NULL REFERENCES groups(id),
                feed_source_id INTEGER NOT NULL REFERENCES feed_sources(id),
                enabled INTEGER NOT NULL DEFAULT 1,
                UNIQUE(group_id, feed_source_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_items (
                id INTEGER PRIMARY KEY,
                feed_source_id INTEGER NOT NULL REFERENCES feed_sources(id),
                guid_hash TEXT NOT NULL,
                url TEXT NOT NULL,
                published_at TEXT,
                canonical_url_hash TEXT NOT NULL,
                UNIQUE(feed_source_id, guid_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                canonical_url TEXT NOT NULL,
                canonical_url_hash TEXT NOT NULL UNIQUE,
                first_seen_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_items (
                id INTEGER PRIMARY KEY,
                group_id INTEGER NOT NULL REFERENCES groups(id),
                item_id INTEGER NOT NULL REFERENCES items(id),
                first_seen_at TEXT NOT NULL,
                UNIQUE(group_id, item_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_group_items_first_seen
            ON group_items(group_id, first_seen_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS item_evaluations (
                id INTEGER PRIMARY KEY,
                group_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL REFERENCES items(id),
                relevance_score REAL NOT NULL,
                decision TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                UNIQUE(group_id, item_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS item_summaries (
                id INTEGER PRIMARY KEY,
                group_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL REFERENCES items(id),
                summary_md TEXT NOT NULL,
                UNIQUE(group_id, item_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS digests (
                id INTEGER PRIMARY KEY,
                group_id INTEGER NOT NULL REFERENCES groups(id),
                scheduled_at TEXT NOT NULL,
                markdown_body TEXT NOT NULL,
                storage_path TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deliveries (
                id INTEGER PRIMARY KEY,
                digest_id INTEGER NOT NULL REFERENCES digests(id),
                destination_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_runs (
                id INTEGER PRIMARY KEY,
                group_id INTEGER NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mirror the configured users, groups, feeds, schedules and
    /// destinations into the database. Safe to run on every startup.
    pub async fn sync_config(&self, config: &Config) -> anyhow::Result<()> {
        for user in &config.users {
            user.timezone
                .parse::<Tz>()
                .map_err(|_| ValidationError::UnknownTimezone(user.timezone.clone()))?;
            self.upsert_user(&user.email, &user.name, &user.timezone)
                .await?;
        }

        for group in &config.groups {
            let owner = self.find_user_by_email(&group.owner).await?.ok_or_else(|| {
                anyhow::anyhow!(
                    "group '{}' references unknown owner '{}'",
                    group.name,
                    group.owner
                )
            })?;
            let record = self
                .upsert_group(owner.id, &group.name, &group.description, group.enabled)
                .await?;

            for url in &group.feeds {
                let source = self.get_or_create_feed_source(url).await?;
                self.link_group_feed(record.id, source.id, true).await?;
            }

            for time in &group.schedules {
                let time: ScheduleTime = time.parse()?;
                self.upsert_schedule(record.id, time, true).await?;
            }

            for destination in &group.destinations {
                self.upsert_destination(
                    record.id,
                    destination.kind,
                    &destination.target,
                    destination.token.as_deref(),
                    destination.enabled,
                )
                .await?;
            }
        }

        Ok(())
    }

    // Users

    pub async fn upsert_user(&self, email: &str, name: &str, timezone: &str) -> DbResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, name, timezone)
            VALUES (?, ?, ?)
            ON CONFLICT(email) DO UPDATE SET
                name = excluded.name,
                timezone = excluded.timezone
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(name)
        .bind(timezone)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: i64) -> DbResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn find_user_by_email(&self, email: &str) -> DbResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    // Groups

    pub async fn upsert_group(
        &self,
        user_id: i64,
        name: &str,
        description: &str,
        is_enabled: bool,
    ) -> DbResult<Group> {
        let group = sqlx::query_as::<_, Group>(
            r#"
            INSERT INTO groups (user_id, name, description, is_enabled)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, name) DO UPDATE SET
                description = excluded.description,
                is_enabled = excluded.is_enabled
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(description)
        .bind(is_enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(group)
    }

    pub async fn get_group(&self, group_id: i64) -> DbResult<Option<Group>> {
        let group = sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(group)
    }

    pub async fn list_groups(&self) -> DbResult<Vec<Group>> {
        let groups = sqlx::query_as::<_, Group>("SELECT * FROM groups ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(groups)
    }

    pub async fn update_group_run_times(
        &self,
        group_id: i64,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE groups
            SET last_run_started_at = ?, last_run_completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(started_at)
        .bind(completed_at)
        .bind(group_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("group", group_id));
        }
        Ok(())
    }

    // Schedules

    pub async fn upsert_schedule(
        &self,
        group_id: i64,
        time: ScheduleTime,
        enabled: bool,
    ) -> DbResult<GroupSchedule> {
        let schedule = sqlx::query_as::<_, GroupSchedule>(
            r#"
            INSERT INTO group_schedules (group_id, time_hhmm, enabled)
            VALUES (?, ?, ?)
            ON CONFLICT(group_id, time_hhmm) DO UPDATE SET
                enabled = excluded.enabled
            RETURNING *
            "#,
        )
        .bind(group_id)
        .bind(time.to_string())
        .bind(enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(schedule)
    }

    pub async fn get_schedule(&self, schedule_id: i64) -> DbResult<Option<GroupSchedule>> {
        let schedule =
            sqlx::query_as::<_, GroupSchedule>("SELECT * FROM group_schedules WHERE id = ?")
                .bind(schedule_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(schedule)
    }

    pub async fn list_enabled_schedules(&self) -> DbResult<Vec<GroupSchedule>> {
        let schedules = sqlx::query_as::<_, GroupSchedule>(
            "SELECT * FROM group_schedules WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    /// Set `last_fired_at` unless the schedule already fired at `fired_at`.
    ///
    /// Returns `true` for exactly one caller per schedule and minute, also
    /// when several schedulers race on the same database.
    pub async fn mark_schedule_fired(
        &self,
        schedule_id: i64,
        fired_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE group_schedules
            SET last_fired_at = ?1
            WHERE id = ?2 AND (last_fired_at IS NULL OR last_fired_at <> ?1)
            "#,
        )
        .bind(fired_at)
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // Destinations

    pub async fn upsert_destination(
        &self,
        group_id: i64,
        kind: DestinationKind,
        target: &str,
        token: Option<&str>,
        enabled: bool,
    ) -> DbResult<GroupDestination> {
        let destination = sqlx::query_as::<_, GroupDestination>(
            r#"
            INSERT INTO group_destinations (group_id, kind, target, token, enabled)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(group_id, kind, target) DO UPDATE SET
                token = excluded.token,
                enabled = excluded.enabled
            RETURNING *
            "#,
        )
        .bind(group_id)
        .bind(kind)
        .bind(target)
        .bind(token)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(destination)
    }

    pub async fn list_enabled_destinations(&self, group_id: i64) -> DbResult<Vec<GroupDestination>> {
        let destinations = sqlx::query_as::<_, GroupDestination>(
            "SELECT * FROM group_destinations WHERE group_id = ? AND enabled = 1 ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(destinations)
    }

    // Feed sources

    /// Feed sources are created on first reference by URL.
    pub async fn get_or_create_feed_source(&self, url: &str) -> DbResult<FeedSource> {
        sqlx::query("INSERT INTO feed_sources (url) VALUES (?) ON CONFLICT(url) DO NOTHING")
            .bind(url)
            .execute(&self.pool)
            .await?;

        let source = sqlx::query_as::<_, FeedSource>("SELECT * FROM feed_sources WHERE url = ?")
            .bind(url)
            .fetch_one(&self.pool)
            .await?;
        Ok(source)
    }

    pub async fn find_feed_source_by_url(&self, url: &str) -> DbResult<Option<FeedSource>> {
        let source = sqlx::query_as::<_, FeedSource>("SELECT * FROM feed_sources WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    pub async fn get_feed_source(&self, feed_source_id: i64) -> DbResult<Option<FeedSource>> {
        let source = sqlx::query_as::<_, FeedSource>("SELECT * FROM feed_sources WHERE id = ?")
            .bind(feed_source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    pub async fn list_feed_sources(&self) -> DbResult<Vec<FeedSource>> {
        let sources = sqlx::query_as::<_, FeedSource>("SELECT * FROM feed_sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    pub async fn link_group_feed(
        &self,
        group_id: i64,
        feed_source_id: i64,
        enabled: bool,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO group_feeds (group_id, feed_source_id, enabled)
            VALUES (?, ?, ?)
            ON CONFLICT(group_id, feed_source_id) DO UPDATE SET
                enabled = excluded.enabled
            "#,
        )
        .bind(group_id)
        .bind(feed_source_id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_group_feeds(&self, group_id: i64) -> DbResult<Vec<GroupFeed>> {
        let links = sqlx::query_as::<_, GroupFeed>(
            "SELECT * FROM group_feeds WHERE group_id = ? ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    pub async fn list_enabled_feed_sources(&self, group_id: i64) -> DbResult<Vec<FeedSource>> {
        let sources = sqlx::query_as::<_, FeedSource>(
            r#"
            SELECT fs.* FROM feed_sources fs
            JOIN group_feeds gf ON gf.feed_source_id = fs.id
            WHERE gf.group_id = ? AND gf.enabled = 1
            ORDER BY fs.id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    pub async fn record_fetch_success(
        &self,
        feed_source_id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
        fetched_at: DateTime<Utc>,
    ) -> DbResult<FeedSource> {
        let source = sqlx::query_as::<_, FeedSource>(
            r#"
            UPDATE feed_sources
            SET etag = ?, last_modified = ?, last_fetch_at = ?,
                health_status = 'healthy', consecutive_failures = 0,
                fetch_count = fetch_count + 1
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(etag)
        .bind(last_modified)
        .bind(fetched_at)
        .bind(feed_source_id)
        .fetch_optional(&self.pool)
        .await?;
        source.ok_or_else(|| RepositoryError::not_found("feed source", feed_source_id))
    }

    pub async fn record_fetch_not_modified(
        &self,
        feed_source_id: i64,
        fetched_at: DateTime<Utc>,
    ) -> DbResult<FeedSource> {
        let source = sqlx::query_as::<_, FeedSource>(
            r#"
            UPDATE feed_sources
            SET last_fetch_at = ?, health_status = 'healthy', consecutive_failures = 0,
                fetch_count = fetch_count + 1, not_modified_count = not_modified_count + 1
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(fetched_at)
        .bind(feed_source_id)
        .fetch_optional(&self.pool)
        .await?;
        source.ok_or_else(|| RepositoryError::not_found("feed source", feed_source_id))
    }

    /// Count a failed attempt. The source turns `dead` once its consecutive
    /// failures reach `dead_after`, `degraded` before that.
    pub async fn record_fetch_failure(
        &self,
        feed_source_id: i64,
        fetched_at: DateTime<Utc>,
        dead_after: i64,
    ) -> DbResult<FeedSource> {
        let source = sqlx::query_as::<_, FeedSource>(
            r#"
            UPDATE feed_sources
            SET last_fetch_at = ?,
                consecutive_failures = consecutive_failures + 1,
                health_status = CASE
                    WHEN consecutive_failures + 1 >= ? THEN 'dead'
                    ELSE 'degraded'
                END,
                fetch_count = fetch_count + 1,
                failure_count = failure_count + 1
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(fetched_at)
        .bind(dead_after)
        .bind(feed_source_id)
        .fetch_optional(&self.pool)
        .await?;
        source.ok_or_else(|| RepositoryError::not_found("feed source", feed_source_id))
    }

    // Feed items

    /// Insert a feed item unless its `(feed_source_id, guid_hash)` exists.
    pub async fn insert_feed_item(&self, item: &NewFeedItem) -> DbResult<Option<FeedItem>> {
        let inserted = sqlx::query_as::<_, FeedItem>(
            r#"
            INSERT INTO feed_items (feed_source_id, guid_hash, url, published_at, canonical_url_hash)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(feed_source_id, guid_hash) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(item.feed_source_id)
        .bind(&item.guid_hash)
        .bind(&item.url)
        .bind(item.published_at)
        .bind(&item.canonical_url_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted)
    }

    pub async fn feed_item_exists(&self, feed_source_id: i64, guid_hash: &str) -> DbResult<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM feed_items WHERE feed_source_id = ? AND guid_hash = ?",
        )
        .bind(feed_source_id)
        .bind(guid_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 > 0)
    }

    pub async fn count_feed_items(&self, feed_source_id: i64) -> DbResult<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feed_items WHERE feed_source_id = ?")
            .bind(feed_source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    // Items

    /// Return the item for `canonical_url_hash`, creating it on first
    /// sighting. The flag is `true` when this call created it.
    pub async fn get_or_create_item(
        &self,
        canonical_url: &str,
        canonical_url_hash: &str,
        first_seen_at: DateTime<Utc>,
    ) -> DbResult<(Item, bool)> {
        let inserted = sqlx::query_as::<_, Item>(
            r#"
            INSERT INTO items (canonical_url, canonical_url_hash, first_seen_at)
            VALUES (?, ?, ?)
            ON CONFLICT(canonical_url_hash) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(canonical_url)
        .bind(canonical_url_hash)
        .bind(first_seen_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(item) = inserted {
            return Ok((item, true));
        }

        let existing = sqlx::query_as::<_, Item>("SELECT * FROM items WHERE canonical_url_hash = ?")
            .bind(canonical_url_hash)
            .fetch_one(&self.pool)
            .await?;
        Ok((existing, false))
    }

    pub async fn find_item_by_hash(&self, canonical_url_hash: &str) -> DbResult<Option<Item>> {
        let item = sqlx::query_as::<_, Item>("SELECT * FROM items WHERE canonical_url_hash = ?")
            .bind(canonical_url_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    pub async fn get_item(&self, item_id: i64) -> DbResult<Option<Item>> {
        let item = sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    pub async fn count_items(&self) -> DbResult<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    // Group items

    /// Associate an item with a group. `None` when the pair already exists,
    /// in which case the original `first_seen_at` is kept.
    pub async fn insert_group_item(
        &self,
        group_id: i64,
        item_id: i64,
        first_seen_at: DateTime<Utc>,
    ) -> DbResult<Option<GroupItem>> {
        let inserted = sqlx::query_as::<_, GroupItem>(
            r#"
            INSERT INTO group_items (group_id, item_id, first_seen_at)
            VALUES (?, ?, ?)
            ON CONFLICT(group_id, item_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(group_id)
        .bind(item_id)
        .bind(first_seen_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted)
    }

    pub async fn list_group_items_since(
        &self,
        group_id: i64,
        since: DateTime<Utc>,
    ) -> DbResult<Vec<GroupItem>> {
        let items = sqlx::query_as::<_, GroupItem>(
            r#"
            SELECT * FROM group_items
            WHERE group_id = ? AND first_seen_at >= ?
            ORDER BY first_seen_at, id
            "#,
        )
        .bind(group_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn count_group_items(&self, group_id: i64) -> DbResult<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM group_items WHERE group_id = ?")
            .bind(group_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    // Evaluations and summaries

    pub async fn find_evaluation(
        &self,
        group_id: i64,
        item_id: i64,
    ) -> DbResult<Option<ItemEvaluation>> {
        let evaluation = sqlx::query_as::<_, ItemEvaluation>(
            "SELECT * FROM item_evaluations WHERE group_id = ? AND item_id = ?",
        )
        .bind(group_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(evaluation)
    }

    /// Record an evaluation. Existing evaluations are never overwritten.
    pub async fn insert_evaluation(
        &self,
        group_id: i64,
        item_id: i64,
        relevance_score: f64,
        decision: Decision,
        reason: &str,
    ) -> DbResult<Option<ItemEvaluation>> {
        let inserted = sqlx::query_as::<_, ItemEvaluation>(
            r#"
            INSERT INTO item_evaluations (group_id, item_id, relevance_score, decision, reason)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(group_id, item_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(group_id)
        .bind(item_id)
        .bind(relevance_score)
        .bind(decision)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted)
    }

    pub async fn count_evaluations(&self, group_id: i64) -> DbResult<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM item_evaluations WHERE group_id = ?")
                .bind(group_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    pub async fn find_summary(&self, group_id: i64, item_id: i64) -> DbResult<Option<ItemSummary>> {
        let summary = sqlx::query_as::<_, ItemSummary>(
            "SELECT * FROM item_summaries WHERE group_id = ? AND item_id = ?",
        )
        .bind(group_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(summary)
    }

    pub async fn insert_summary(
        &self,
        group_id: i64,
        item_id: i64,
        summary_md: &str,
    ) -> DbResult<Option<ItemSummary>> {
        let inserted = sqlx::query_as::<_, ItemSummary>(
            r#"
            INSERT INTO item_summaries (group_id, item_id, summary_md)
            VALUES (?, ?, ?)
            ON CONFLICT(group_id, item_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(group_id)
        .bind(item_id)
        .bind(summary_md)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted)
    }

    // Digests

    pub async fn insert_digest(
        &self,
        group_id: i64,
        scheduled_at: DateTime<Utc>,
        markdown_body: &str,
    ) -> DbResult<Digest> {
        let digest = sqlx::query_as::<_, Digest>(
            r#"
            INSERT INTO digests (group_id, scheduled_at, markdown_body)
            VALUES (?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(group_id)
        .bind(scheduled_at)
        .bind(markdown_body)
        .fetch_one(&self.pool)
        .await?;
        Ok(digest)
    }

    pub async fn set_digest_storage_path(&self, digest_id: i64, path: &str) -> DbResult<Digest> {
        let digest = sqlx::query_as::<_, Digest>(
            "UPDATE digests SET storage_path = ? WHERE id = ? RETURNING *",
        )
        .bind(path)
        .bind(digest_id)
        .fetch_optional(&self.pool)
        .await?;
        digest.ok_or_else(|| RepositoryError::not_found("digest", digest_id))
    }

    pub async fn get_digest(&self, digest_id: i64) -> DbResult<Option<Digest>> {
        let digest = sqlx::query_as::<_, Digest>("SELECT * FROM digests WHERE id = ?")
            .bind(digest_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(digest)
    }

    pub async fn list_digests(&self, group_id: i64) -> DbResult<Vec<Digest>> {
        let digests = sqlx::query_as::<_, Digest>(
            "SELECT * FROM digests WHERE group_id = ? ORDER BY scheduled_at DESC, id DESC",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(digests)
    }

    // Deliveries

    pub async fn insert_delivery(&self, digest_id: i64, destination_id: i64) -> DbResult<Delivery> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r#"
            INSERT INTO deliveries (digest_id, destination_id, status)
            VALUES (?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(digest_id)
        .bind(destination_id)
        .bind(DeliveryStatus::Pending)
        .fetch_one(&self.pool)
        .await?;
        Ok(delivery)
    }

    pub async fn finish_delivery(
        &self,
        delivery_id: i64,
        status: DeliveryStatus,
        error_message: Option<&str>,
    ) -> DbResult<Delivery> {
        let delivery = sqlx::query_as::<_, Delivery>(
            "UPDATE deliveries SET status = ?, error_message = ? WHERE id = ? RETURNING *",
        )
        .bind(status)
        .bind(error_message)
        .bind(delivery_id)
        .fetch_optional(&self.pool)
        .await?;
        delivery.ok_or_else(|| RepositoryError::not_found("delivery", delivery_id))
    }

    pub async fn list_deliveries(&self, digest_id: i64) -> DbResult<Vec<Delivery>> {
        let deliveries =
            sqlx::query_as::<_, Delivery>("SELECT * FROM deliveries WHERE digest_id = ? ORDER BY id")
                .bind(digest_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(deliveries)
    }

    // Job runs

    pub async fn start_job_run(
        &self,
        group_id: i64,
        job_type: &str,
        started_at: DateTime<Utc>,
    ) -> DbResult<JobRun> {
        let job = sqlx::query_as::<_, JobRun>(
            r#"
            INSERT INTO job_runs (group_id, job_type, status, started_at)
            VALUES (?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(group_id)
        .bind(job_type)
        .bind(JobStatus::Running)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn finish_job_run(
        &self,
        job_id: i64,
        status: JobStatus,
        finished_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> DbResult<JobRun> {
        let job = sqlx::query_as::<_, JobRun>(
            r#"
            UPDATE job_runs
            SET status = ?, finished_at = ?, error_message = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(status)
        .bind(finished_at)
        .bind(error_message)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        job.ok_or_else(|| RepositoryError::not_found("job run", job_id))
    }

    pub async fn list_job_runs(&self, group_id: i64) -> DbResult<Vec<JobRun>> {
        let jobs =
            sqlx::query_as::<_, JobRun>("SELECT * FROM job_runs WHERE group_id = ? ORDER BY id")
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HealthStatus;
    use chrono::TimeZone;

    async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    async fn create_group(db: &Database) -> Group {
        let user = db
            .upsert_user("owner@example.com", "Owner", "UTC")
            .await
            .unwrap();
        db.upsert_group(user.id, "Tech", "", true).await.unwrap()
    }

    fn new_feed_item(feed_source_id: i64, guid_hash: &str) -> NewFeedItem {
        NewFeedItem {
            feed_source_id,
            guid_hash: guid_hash.to_string(),
            url: "https://example.com/post".to_string(),
            published_at: None,
            canonical_url_hash: "hash".to_string(),
        }
    }

    mod initialization_tests {
        use super::*;

        #[tokio::test]
        async fn test_database_initialization() {
            let db = create_test_db().await;
            let sources = db.list_feed_sources().await.unwrap();
            assert!(sources.is_empty());
        }

        #[tokio::test]
        async fn test_double_initialization_is_safe() {
            let db = create_test_db().await;
            let result = db.initialize().await;
            assert!(result.is_ok());
        }
    }

    mod sync_config_tests {
        use super::*;

        const CONFIG: &str = r#"
            [[users]]
            email = "ada@example.com"
            timezone = "America/New_York"

            [[groups]]
            name = "Systems"
            owner = "ada@example.com"
            feeds = ["https://example.com/rss", "https://example.org/atom"]
            schedules = ["08:30"]

            [[groups.destinations]]
            type = "email"
            target = "ada@example.com"
        "#;

        #[tokio::test]
        async fn test_sync_creates_everything() {
            let db = create_test_db().await;
            let config = Config::from_str(CONFIG).unwrap();

            db.sync_config(&config).await.unwrap();

            let groups = db.list_groups().await.unwrap();
            assert_eq!(groups.len(), 1);
            let sources = db.list_enabled_feed_sources(groups[0].id).await.unwrap();
            assert_eq!(sources.len(), 2);
            let links = db.list_group_feeds(groups[0].id).await.unwrap();
            assert!(links.iter().all(|l| l.enabled));
            let schedules = db.list_enabled_schedules().await.unwrap();
            assert_eq!(schedules[0].time_hhmm, "08:30");
            let destinations = db.list_enabled_destinations(groups[0].id).await.unwrap();
            assert_eq!(destinations.len(), 1);
            assert_eq!(destinations[0].kind, DestinationKind::Email);
        }

        #[tokio::test]
        async fn test_sync_twice_is_idempotent() {
            let db = create_test_db().await;
            let config = Config::from_str(CONFIG).unwrap();

            db.sync_config(&config).await.unwrap();
            db.sync_config(&config).await.unwrap();

            assert_eq!(db.list_groups().await.unwrap().len(), 1);
            assert_eq!(db.list_feed_sources().await.unwrap().len(), 2);
            assert_eq!(db.list_enabled_schedules().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_sync_rejects_invalid_schedule_time() {
            let db = create_test_db().await;
            let config = Config::from_str(
                r#"
                [[users]]
                email = "ada@example.com"

                [[groups]]
                name = "Broken"
                owner = "ada@example.com"
                schedules = ["25:00"]
            "#,
            )
            .unwrap();

            assert!(db.sync_config(&config).await.is_err());
            assert!(db.list_enabled_schedules().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_sync_rejects_unknown_timezone() {
            let db = create_test_db().await;
            let config = Config::from_str(
                r#"
                [[users]]
                email = "ada@example.com"
                timezone = "Mars/Olympus_Mons"
            "#,
            )
            .unwrap();

            assert!(db.sync_config(&config).await.is_err());
            assert!(db.find_user_by_email("ada@example.com").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_sync_rejects_unknown_owner() {
            let db = create_test_db().await;
            let config = Config::from_str(
                r#"
                [[groups]]
                name = "Orphan"
                owner = "nobody@example.com"
            "#,
            )
            .unwrap();

            assert!(db.sync_config(&config).await.is_err());
        }
    }

    mod feed_source_tests {
        use super::*;

        #[tokio::test]
        async fn test_get_or_create_is_unique_by_url() {
            let db = create_test_db().await;
            let first = db.get_or_create_feed_source("https://a.com/rss").await.unwrap();
            let second = db.get_or_create_feed_source("https://a.com/rss").await.unwrap();

            assert_eq!(first.id, second.id);
            assert_eq!(first.health_status, HealthStatus::Healthy);
            assert_eq!(first.fetch_count, 0);
            assert_eq!(db.list_feed_sources().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_failure_escalates_to_dead() {
            let db = create_test_db().await;
            let source = db.get_or_create_feed_source("https://a.com/rss").await.unwrap();
            let now = Utc::now();

            let mut updated = source.clone();
            for _ in 0..4 {
                updated = db.record_fetch_failure(source.id, now, 5).await.unwrap();
                assert_eq!(updated.health_status, HealthStatus::Degraded);
            }
            updated = db.record_fetch_failure(source.id, now, 5).await.unwrap();

            assert_eq!(updated.health_status, HealthStatus::Dead);
            assert_eq!(updated.consecutive_failures, 5);
            assert_eq!(updated.failure_count, 5);
        }

        #[tokio::test]
        async fn test_success_resets_failures_and_stores_validators() {
            let db = create_test_db().await;
            let source = db.get_or_create_feed_source("https://a.com/rss").await.unwrap();
            let now = Utc::now();

            db.record_fetch_failure(source.id, now, 5).await.unwrap();
            let updated = db
                .record_fetch_success(source.id, Some("\"v1\""), Some("Mon, 01 Jan 2024 00:00:00 GMT"), now)
                .await
                .unwrap();

            assert_eq!(updated.health_status, HealthStatus::Healthy);
            assert_eq!(updated.consecutive_failures, 0);
            assert_eq!(updated.failure_count, 1);
            assert_eq!(updated.fetch_count, 2);
            assert_eq!(updated.etag.as_deref(), Some("\"v1\""));
            assert!(updated.last_fetch_at.is_some());
        }

        #[tokio::test]
        async fn test_update_unknown_source_is_not_found() {
            let db = create_test_db().await;
            let result = db.record_fetch_not_modified(999, Utc::now()).await;
            assert!(matches!(result, Err(RepositoryError::NotFound { .. })));
        }
    }

    mod feed_item_tests {
        use super::*;

        #[tokio::test]
        async fn test_same_guid_is_stored_once_per_feed() {
            let db = create_test_db().await;
            let source = db.get_or_create_feed_source("https://a.com/rss").await.unwrap();

            let first = db.insert_feed_item(&new_feed_item(source.id, "g1")).await.unwrap();
            let second = db.insert_feed_item(&new_feed_item(source.id, "g1")).await.unwrap();

            assert!(first.is_some());
            assert!(second.is_none());
            assert_eq!(db.count_feed_items(source.id).await.unwrap(), 1);
            assert!(db.feed_item_exists(source.id, "g1").await.unwrap());
        }

        #[tokio::test]
        async fn test_same_guid_different_feeds() {
            let db = create_test_db().await;
            let a = db.get_or_create_feed_source("https://a.com/rss").await.unwrap();
            let b = db.get_or_create_feed_source("https://b.com/rss").await.unwrap();

            assert!(db.insert_feed_item(&new_feed_item(a.id, "g1")).await.unwrap().is_some());
            assert!(db.insert_feed_item(&new_feed_item(b.id, "g1")).await.unwrap().is_some());
        }
    }

    mod item_tests {
        use super::*;

        #[tokio::test]
        async fn test_get_or_create_item_keeps_first_sighting() {
            let db = create_test_db().await;
            let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
            let later = Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).unwrap();

            let (first, created) = db
                .get_or_create_item("https://example.com/a", "h1", earlier)
                .await
                .unwrap();
            let (second, created_again) = db
                .get_or_create_item("https://example.com/a", "h1", later)
                .await
                .unwrap();

            assert!(created);
            assert!(!created_again);
            assert_eq!(first.id, second.id);
            assert_eq!(second.first_seen_at, earlier);
            assert_eq!(db.count_items().await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_find_item_by_hash() {
            let db = create_test_db().await;
            let (item, _) = db
                .get_or_create_item("https://example.com/a", "h1", Utc::now())
                .await
                .unwrap();

            let found = db.find_item_by_hash("h1").await.unwrap().unwrap();
            assert_eq!(found.id, item.id);
            assert_eq!(found.canonical_url, "https://example.com/a");
            assert!(db.find_item_by_hash("h2").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_group_items_since_filters_and_orders() {
            let db = create_test_db().await;
            let group = create_group(&db).await;
            let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let mid = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
            let new = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();

            for (hash, at) in [("h-new", new), ("h-old", old), ("h-mid", mid)] {
                let (item, _) = db.get_or_create_item(hash, hash, at).await.unwrap();
                db.insert_group_item(group.id, item.id, at).await.unwrap();
            }

            let since = db.list_group_items_since(group.id, mid).await.unwrap();
            assert_eq!(since.len(), 2);
            assert_eq!(since[0].first_seen_at, mid);
            assert_eq!(since[1].first_seen_at, new);
        }

        #[tokio::test]
        async fn test_group_item_is_unique_per_group() {
            let db = create_test_db().await;
            let group = create_group(&db).await;
            let (item, _) = db
                .get_or_create_item("https://example.com/a", "h1", Utc::now())
                .await
                .unwrap();

            assert!(db.insert_group_item(group.id, item.id, Utc::now()).await.unwrap().is_some());
            assert!(db.insert_group_item(group.id, item.id, Utc::now()).await.unwrap().is_none());
            assert_eq!(db.count_group_items(group.id).await.unwrap(), 1);
        }
    }

    mod evaluation_tests {
        use super::*;

        #[tokio::test]
        async fn test_evaluation_is_never_overwritten() {
            let db = create_test_db().await;
            let group = create_group(&db).await;
            let (item, _) = db
                .get_or_create_item("https://example.com/a", "h1", Utc::now())
                .await
                .unwrap();

            let first = db
                .insert_evaluation(group.id, item.id, 0.9, Decision::Include, "keyword")
                .await
                .unwrap();
            let second = db
                .insert_evaluation(group.id, item.id, 0.1, Decision::Exclude, "no_keyword")
                .await
                .unwrap();

            assert!(first.is_some());
            assert!(second.is_none());
            let stored = db.find_evaluation(group.id, item.id).await.unwrap().unwrap();
            assert_eq!(stored.decision, Decision::Include);
            assert_eq!(stored.relevance_score, 0.9);
        }

        #[tokio::test]
        async fn test_summary_is_unique_per_group_item() {
            let db = create_test_db().await;
            let group = create_group(&db).await;
            let (item, _) = db
                .get_or_create_item("https://example.com/a", "h1", Utc::now())
                .await
                .unwrap();

            assert!(db.insert_summary(group.id, item.id, "one").await.unwrap().is_some());
            assert!(db.insert_summary(group.id, item.id, "two").await.unwrap().is_none());
            let stored = db.find_summary(group.id, item.id).await.unwrap().unwrap();
            assert_eq!(stored.summary_md, "one");
        }
    }

    mod schedule_tests {
        use super::*;

        #[tokio::test]
        async fn test_mark_fired_once_per_minute() {
            let db = create_test_db().await;
            let group = create_group(&db).await;
            let schedule = db
                .upsert_schedule(group.id, "08:30".parse().unwrap(), true)
                .await
                .unwrap();
            let minute = Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 0).unwrap();
            let next_day = Utc.with_ymd_and_hms(2024, 1, 2, 8, 30, 0).unwrap();

            assert!(db.mark_schedule_fired(schedule.id, minute).await.unwrap());
            assert!(!db.mark_schedule_fired(schedule.id, minute).await.unwrap());
            assert!(db.mark_schedule_fired(schedule.id, next_day).await.unwrap());

            let stored = db.get_schedule(schedule.id).await.unwrap().unwrap();
            assert_eq!(stored.last_fired_at, Some(next_day));
        }

        #[tokio::test]
        async fn test_disabled_schedules_are_not_listed() {
            let db = create_test_db().await;
            let group = create_group(&db).await;
            db.upsert_schedule(group.id, "08:30".parse().unwrap(), true)
                .await
                .unwrap();
            db.upsert_schedule(group.id, "09:00".parse().unwrap(), false)
                .await
                .unwrap();

            let enabled = db.list_enabled_schedules().await.unwrap();
            assert_eq!(enabled.len(), 1);
            assert_eq!(enabled[0].time_hhmm, "08:30");
        }
    }

    mod digest_and_delivery_tests {
        use super::*;

        #[tokio::test]
        async fn test_digest_storage_path_and_deliveries() {
            let db = create_test_db().await;
            let group = create_group(&db).await;
            let destination = db
                .upsert_destination(group.id, DestinationKind::Email, "a@example.com", None, true)
                .await
                .unwrap();
            let scheduled_at = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();

            let digest = db.insert_digest(group.id, scheduled_at, "# Digest").await.unwrap();
            assert!(digest.storage_path.is_none());
            let digest = db
                .set_digest_storage_path(digest.id, "/tmp/1/202401010900.md")
                .await
                .unwrap();
            assert_eq!(digest.storage_path.as_deref(), Some("/tmp/1/202401010900.md"));

            let delivery = db.insert_delivery(digest.id, destination.id).await.unwrap();
            assert_eq!(delivery.status, DeliveryStatus::Pending);
            let delivery = db
                .finish_delivery(delivery.id, DeliveryStatus::Failed, Some("smtp down"))
                .await
                .unwrap();
            assert_eq!(delivery.status, DeliveryStatus::Failed);

            let listed = db.list_deliveries(digest.id).await.unwrap();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].error_message.as_deref(), Some("smtp down"));
            assert_eq!(db.list_digests(group.id).await.unwrap().len(), 1);

            let stored = db.get_digest(digest.id).await.unwrap().unwrap();
            assert_eq!(stored.markdown_body, "# Digest");
            assert_eq!(stored.scheduled_at, scheduled_at);
            assert_eq!(stored.storage_path.as_deref(), Some("/tmp/1/202401010900.md"));
            assert!(db.get_digest(digest.id + 1).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_job_run_lifecycle() {
            let db = create_test_db().await;
            let started = Utc::now();

            let job = db.start_job_run(7, "pipeline", started).await.unwrap();
            assert_eq!(job.status, JobStatus::Running);
            let job = db
                .finish_job_run(job.id, JobStatus::Failed, Utc::now(), Some("boom"))
                .await
                .unwrap();

            assert_eq!(job.status, JobStatus::Failed);
            assert!(job.finished_at.is_some());
            assert_eq!(db.list_job_runs(7).await.unwrap().len(), 1);
        }
    }
}
