use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::canonical::{canonical_hash, normalize};
use crate::db::Database;
use crate::error::RepositoryError;
use crate::models::{FeedItem, GroupItem, Item};

/// What a single materialization pass created.
#[derive(Debug, Default)]
pub struct Materialized {
    pub items: Vec<Item>,
    pub group_items: Vec<GroupItem>,
}

/// Folds per-feed items into system-wide items and group associations.
pub struct Materializer {
    db: Arc<Database>,
}

impl Materializer {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn materialize(
        &self,
        group_id: i64,
        feed_items: &[FeedItem],
    ) -> Result<Materialized, RepositoryError> {
        let mut result = Materialized::default();

        for feed_item in feed_items {
            let canonical_url = normalize(&feed_item.url);
            let url_hash = canonical_hash(&canonical_url);
            let now = Utc::now();

            let (item, created) = self
                .db
                .get_or_create_item(&canonical_url, &url_hash, now)
                .await?;
            if created {
                result.items.push(item.clone());
            }

            match self.db.insert_group_item(group_id, item.id, now).await? {
                Some(group_item) => result.group_items.push(group_item),
                None => debug!(
                    "Group {} already has item {} ({})",
                    group_id, item.id, canonical_url
                ),
            }
        }

        Ok(result)
    }
}
