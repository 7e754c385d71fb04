//! Commit capture - session-window git commit tracking library
//!
//! Given a session start time and a set of workspace roots, this crate watches
//! each repository's commit log (`.git/logs/HEAD`) and captures every commit
//! made during the session: author metadata, message, and a short + full-context
//! diff pair. Commits are deduplicated by hash, so repeated or out-of-order
//! change notifications never produce duplicate records.
//!
//! It has no network dependencies and no knowledge of the surrounding agent.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use commit_capture::CommitWatcher;
//!
//! #[tokio::main]
//! async fn main() {
//!     let watcher = CommitWatcher::new(chrono::Utc::now());
//!     watcher.watch_workspace(&[PathBuf::from("/home/me/project")]).await;
//!
//!     // ... session runs, commits land ...
//!
//!     for record in watcher.records().await {
//!         println!("{} {}", record.hash, record.message);
//!     }
//!     watcher.cleanup().await;
//! }
//! ```

mod error;
mod git;
mod records;
mod watcher;

pub use error::CaptureError;
pub use git::{CommitSummary, commit_diff, commits_since, resolve_repo_root};
pub use records::{CommitRecord, SessionCommits};
pub use watcher::CommitWatcher;
