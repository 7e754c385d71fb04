use std::path::PathBuf;

/// Errors from repository access and watch registration.
///
/// Failures scoped to a single commit (diff extraction, log parsing) are
/// logged and skipped inside the watcher; they never abort sibling commits.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {args}: {stderr}")]
    Git { args: String, stderr: String },

    #[error("not inside a git repository: {}", .0.display())]
    NotARepository(PathBuf),

    #[error("commit log not readable: {}", .0.display())]
    LogUnreadable(PathBuf),

    #[error("filesystem watch failed: {0}")]
    Watch(#[from] notify::Error),
}
