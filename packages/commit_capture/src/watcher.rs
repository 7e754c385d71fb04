//! Commit watcher: filesystem-triggered capture of commits made during a
//! session window.
//!
//! One watcher instance covers one session. Each workspace root is resolved to
//! its repository root (deduplicated, so several workspace folders inside the
//! same repository are tracked once), and the repository's commit log file is
//! watched for changes. Every change notification triggers a re-scan of the
//! session window; records are deduplicated by hash, so over-broad scans and
//! repeated notifications are harmless.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::git::{commit_diff, commits_since, resolve_repo_root};
use crate::records::{CommitRecord, SessionCommits};

/// Watches repositories for commits made after the session start time and
/// assembles one [`CommitRecord`] per commit.
pub struct CommitWatcher {
    session_start: DateTime<Utc>,
    commits: Arc<Mutex<SessionCommits>>,
    watchers: std::sync::Mutex<HashMap<PathBuf, RecommendedWatcher>>,
    scan_tx: mpsc::UnboundedSender<PathBuf>,
    cancel: CancellationToken,
}

impl CommitWatcher {
    /// Create a watcher for a session that started at `session_start`.
    ///
    /// Spawns the scan task; must be called from within a tokio runtime.
    pub fn new(session_start: DateTime<Utc>) -> Arc<Self> {
        let commits = Arc::new(Mutex::new(SessionCommits::new()));
        let (scan_tx, mut scan_rx) = mpsc::unbounded_channel::<PathBuf>();
        let cancel = CancellationToken::new();

        // Single scan task: change notifications from all repositories are
        // serialized here, so concurrent notifications cannot race the
        // seen-hash check.
        let task_commits = commits.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    root = scan_rx.recv() => {
                        match root {
                            Some(root) => {
                                scan(&task_commits, session_start, &root).await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            session_start,
            commits,
            watchers: std::sync::Mutex::new(HashMap::new()),
            scan_tx,
            cancel,
        })
    }

    /// Start watching the repositories enclosing the given workspace roots.
    ///
    /// Roots that do not resolve to a repository, or whose commit log is not
    /// yet readable, are skipped silently; calling this again (e.g. when the
    /// workspace set changes) retries them. Roots already tracked are ignored.
    pub async fn watch_workspace(&self, roots: &[PathBuf]) {
        for root in roots {
            let repo_root = match resolve_repo_root(root).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(path = %root.display(), error = %e, "workspace root skipped");
                    continue;
                }
            };

            if self
                .watchers
                .lock()
                .expect("watcher map lock poisoned")
                .contains_key(&repo_root)
            {
                debug!(repo = %repo_root.display(), "repository already tracked");
                continue;
            }

            match self.spawn_log_watcher(&repo_root) {
                Ok(watcher) => {
                    info!(repo = %repo_root.display(), "tracking commit log");
                    self.watchers
                        .lock()
                        .expect("watcher map lock poisoned")
                        .insert(repo_root, watcher);
                }
                // Not readable yet (fresh repository, no commits): skip
                // silently, the next workspace change retries it.
                Err(e @ CaptureError::LogUnreadable(_)) => {
                    debug!(repo = %repo_root.display(), error = %e, "skipping repository for now");
                }
                Err(e) => {
                    warn!(repo = %repo_root.display(), error = %e, "failed to watch commit log");
                }
            }
        }
    }

    fn spawn_log_watcher(&self, repo_root: &Path) -> Result<RecommendedWatcher, CaptureError> {
        let log_path = repo_root.join(".git").join("logs").join("HEAD");
        if std::fs::File::open(&log_path).is_err() {
            return Err(CaptureError::LogUnreadable(log_path));
        }

        let tx = self.scan_tx.clone();
        let root = repo_root.to_path_buf();
        let mut watcher = notify::recommended_watcher(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        let _ = tx.send(root.clone());
                    }
                }
                Err(e) => {
                    warn!(repo = %root.display(), error = %e, "commit log watcher error");
                }
            },
        )?;
        watcher.watch(&log_path, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    /// Re-scan one repository immediately, as if a change notification fired.
    pub async fn scan_repository(&self, repo_root: &Path) {
        scan(&self.commits, self.session_start, repo_root).await;
    }

    /// Repository roots currently tracked.
    pub fn watched_roots(&self) -> Vec<PathBuf> {
        self.watchers
            .lock()
            .expect("watcher map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of the records captured so far, in discovery order.
    pub async fn records(&self) -> Vec<CommitRecord> {
        self.commits.lock().await.records().to_vec()
    }

    /// Stop all watchers and discard accumulated records.
    pub async fn cleanup(&self) {
        self.cancel.cancel();
        self.watchers
            .lock()
            .expect("watcher map lock poisoned")
            .clear();
        self.commits.lock().await.clear();
        debug!("commit watcher cleaned up");
    }
}

/// List the session window and capture every commit not seen before.
///
/// A failure for one commit (diff extraction, for example) is logged and
/// skipped; sibling commits still get captured. A failure to list the log at
/// all skips this scan; the next change notification retries.
async fn scan(commits: &Mutex<SessionCommits>, session_start: DateTime<Utc>, repo_root: &Path) {
    let summaries = match commits_since(repo_root, session_start).await {
        Ok(s) => s,
        Err(e) => {
            warn!(repo = %repo_root.display(), error = %e, "failed to list session commits");
            return;
        }
    };

    for summary in summaries {
        if commits.lock().await.contains(&summary.hash) {
            continue;
        }

        let (diff, diff_full) = match tokio::join!(
            commit_diff(repo_root, &summary.hash, false),
            commit_diff(repo_root, &summary.hash, true),
        ) {
            (Ok(short), Ok(full)) => (short, full),
            (Err(e), _) | (_, Err(e)) => {
                warn!(hash = %summary.hash, error = %e, "failed to extract diff, skipping commit");
                continue;
            }
        };

        let video_timestamp = (Utc::now() - session_start).num_seconds().max(0);
        let record = CommitRecord {
            hash: summary.hash.clone(),
            author_name: summary.author_name,
            author_email: summary.author_email,
            message: summary.message,
            body: summary.body,
            refs: summary.refs,
            date: summary.date,
            video_timestamp,
            diff,
            diff_full,
        };

        if commits.lock().await.insert(record) {
            info!(hash = %summary.hash, "captured commit");
        }
    }
}
