//! Captured commit records and the per-session dedup set.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The captured metadata + diff payload for one commit inside a session window.
///
/// Immutable once constructed. Field names serialize in the upload wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub hash: String,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    pub body: String,
    /// Decorations as git prints them, e.g. "HEAD -> main, origin/main".
    pub refs: String,
    /// Author date.
    pub date: DateTime<Utc>,
    /// Seconds from session start to the moment the commit was captured.
    pub video_timestamp: i64,
    /// Short unified diff (`git diff <hash>^!`).
    #[serde(rename = "rawCommit")]
    pub diff: String,
    /// Full-context unified diff.
    #[serde(rename = "rawCommitFull")]
    pub diff_full: String,
}

/// Commit records accumulated for one session, in discovery order,
/// deduplicated by hash.
#[derive(Debug, Default)]
pub struct SessionCommits {
    records: Vec<CommitRecord>,
    seen: HashSet<String>,
}

impl SessionCommits {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a record for this hash has already been captured.
    pub fn contains(&self, hash: &str) -> bool {
        self.seen.contains(hash)
    }

    /// Insert a record. Returns false (and drops the record) if the hash was
    /// already captured.
    pub fn insert(&mut self, record: CommitRecord) -> bool {
        if !self.seen.insert(record.hash.clone()) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn records(&self) -> &[CommitRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.seen.clear();
    }
}
