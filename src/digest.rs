use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;

/// One accepted item as it appears in a digest.
#[derive(Debug, Clone)]
pub struct DigestEntry {
    pub canonical_url: String,
    pub first_seen_at: DateTime<Utc>,
    pub summary: Option<String>,
}

/// Render a digest as markdown. Entries are ordered by first sighting,
/// then canonical URL, whatever order they arrive in.
pub fn compose(group_name: &str, scheduled_at: DateTime<Utc>, entries: &[DigestEntry]) -> String {
    let mut sorted: Vec<&DigestEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        a.first_seen_at
            .cmp(&b.first_seen_at)
            .then_with(|| a.canonical_url.cmp(&b.canonical_url))
    });

    let mut markdown = format!(
        "# {} digest\n\n_Scheduled for {}_\n",
        group_name,
        scheduled_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );

    if sorted.is_empty() {
        markdown.push_str("\nNo new items.\n");
        return markdown;
    }

    for entry in sorted {
        markdown.push_str(&format!("\n## {}\n", entry.canonical_url));
        if let Some(summary) = &entry.summary {
            markdown.push_str(&format!("\n{}\n", summary.trim_end()));
        }
    }
    markdown
}

/// Writes digest bodies under `<base_dir>/<group_id>/<YYYYMMDDHHMM>.md`.
#[derive(Debug, Clone)]
pub struct DigestStorage {
    base_dir: PathBuf,
}

impl DigestStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, group_id: i64, scheduled_at: DateTime<Utc>) -> PathBuf {
        self.base_dir
            .join(group_id.to_string())
            .join(format!("{}.md", scheduled_at.format("%Y%m%d%H%M")))
    }

    /// Write the digest, replacing any earlier file for the same minute.
    pub async fn save_digest(
        &self,
        group_id: i64,
        scheduled_at: DateTime<Utc>,
        markdown: &str,
    ) -> std::io::Result<PathBuf> {
        let path = self.path_for(group_id, scheduled_at);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, markdown).await?;
        info!("Stored digest for group {} at {}", group_id, path.display());
        Ok(path)
    }
}
