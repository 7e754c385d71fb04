//! Thin git CLI wrappers: repository root resolution, session-window log
//! listing, and per-commit diff extraction.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::CaptureError;

/// One commit as reported by `git log`, before diffs are attached.
#[derive(Debug, Clone)]
pub struct CommitSummary {
    pub hash: String,
    pub author_name: String,
    pub author_email: String,
    /// Author date.
    pub date: DateTime<Utc>,
    pub message: String,
    pub body: String,
    /// Decorations as git prints them, e.g. "HEAD -> main, origin/main".
    pub refs: String,
}

/// Run a git command in the given working directory, returning stdout on success.
pub async fn run_git(working_dir: &Path, args: &[&str]) -> Result<String, CaptureError> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(working_dir)
        .output()
        .await?;
    if !output.status.success() {
        return Err(CaptureError::Git {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Resolve the enclosing repository root for a workspace path.
///
/// File paths fall back to their parent directory before asking git.
pub async fn resolve_repo_root(path: &Path) -> Result<PathBuf, CaptureError> {
    let dir = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => path.parent().unwrap_or(path),
        Ok(_) => path,
        Err(_) => return Err(CaptureError::NotARepository(path.to_path_buf())),
    };

    let output = run_git(dir, &["rev-parse", "--show-toplevel"])
        .await
        .map_err(|_| CaptureError::NotARepository(path.to_path_buf()))?;
    Ok(PathBuf::from(output.trim()))
}

// NUL as field separator, \x1e between body and refs, \x1f after each record
const LOG_FORMAT: &str = "%H%x00%an%x00%ae%x00%at%x00%s%x00%b%x1e%D%x1f";

/// List commits reachable from local branches but absent from any remote,
/// restricted to the session window.
///
/// The query is deliberately broader than the session invariant needs
/// (`--since` filters loosely under clock skew); the caller's dedup by hash
/// is what guarantees exactly-once capture.
pub async fn commits_since(
    repo_root: &Path,
    since: DateTime<Utc>,
) -> Result<Vec<CommitSummary>, CaptureError> {
    let format_arg = format!("--format={}", LOG_FORMAT);
    let since_arg = format!("--since={}", since.to_rfc3339());
    let args = [
        "log",
        "--branches",
        "--not",
        "--remotes",
        format_arg.as_str(),
        since_arg.as_str(),
    ];

    let output = run_git(repo_root, &args).await?;
    Ok(parse_log_output(&output))
}

/// Parse the custom-formatted log output into commit summaries.
///
/// Format per commit: `%H\0%an\0%ae\0%at\0%s\0%b\x1e%D\x1f`.
fn parse_log_output(output: &str) -> Vec<CommitSummary> {
    let mut commits = Vec::new();
    for record in output.split('\x1f') {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }

        let parts: Vec<&str> = record.splitn(2, '\x1e').collect();
        let fields_part = parts[0];
        let refs = parts.get(1).map(|s| s.trim()).unwrap_or("");

        let fields: Vec<&str> = fields_part.splitn(6, '\0').collect();
        if fields.len() < 5 {
            continue;
        }

        let date = fields[3]
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        commits.push(CommitSummary {
            hash: fields[0].to_string(),
            author_name: fields[1].to_string(),
            author_email: fields[2].to_string(),
            date,
            message: fields[4].to_string(),
            body: fields.get(5).unwrap_or(&"").trim().to_string(),
            refs: refs.to_string(),
        });
    }
    commits
}

/// Fetch the diff introduced by a single commit.
///
/// `full` widens the unified context so the surrounding code is included.
pub async fn commit_diff(
    repo_root: &Path,
    hash: &str,
    full: bool,
) -> Result<String, CaptureError> {
    let range = format!("{}^!", hash);
    let mut args = vec!["diff", range.as_str()];
    if full {
        args.push("-U5000");
    }
    run_git(repo_root, &args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(
        hash: &str,
        name: &str,
        email: &str,
        ts: &str,
        msg: &str,
        body: &str,
        refs: &str,
    ) -> String {
        format!(
            "{}\0{}\0{}\0{}\0{}\0{}\x1e{}\x1f",
            hash, name, email, ts, msg, body, refs
        )
    }

    #[test]
    fn parse_empty_output() {
        assert!(parse_log_output("").is_empty());
    }

    #[test]
    fn parse_single_commit() {
        let output = make_record(
            "abc123def456",
            "Alice",
            "alice@example.com",
            "1700000000",
            "Fix the thing",
            "Detailed body here",
            "HEAD -> main",
        );
        let commits = parse_log_output(&output);
        assert_eq!(commits.len(), 1);
        let c = &commits[0];
        assert_eq!(c.hash, "abc123def456");
        assert_eq!(c.author_name, "Alice");
        assert_eq!(c.author_email, "alice@example.com");
        assert_eq!(c.date.timestamp(), 1700000000);
        assert_eq!(c.message, "Fix the thing");
        assert_eq!(c.body, "Detailed body here");
        assert_eq!(c.refs, "HEAD -> main");
    }

    #[test]
    fn parse_multiple_commits() {
        let mut output = make_record("aaa", "Alice", "a@x", "100", "First", "", "");
        output += &make_record("bbb", "Bob", "b@x", "200", "Second", "", "");
        output += &make_record("ccc", "Carol", "c@x", "300", "Third", "", "");

        let commits = parse_log_output(&output);
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[0].message, "First");
        assert_eq!(commits[2].message, "Third");
    }

    #[test]
    fn parse_multiline_body() {
        let output = make_record(
            "aaa",
            "Alice",
            "a@x",
            "100",
            "Commit",
            "Line 1\nLine 2\nLine 3",
            "",
        );
        let commits = parse_log_output(&output);
        assert!(commits[0].body.contains("Line 1"));
        assert!(commits[0].body.contains("Line 3"));
    }

    #[test]
    fn parse_invalid_date_falls_back_to_epoch() {
        let output = make_record("aaa", "Alice", "a@x", "not_a_number", "Commit", "", "");
        let commits = parse_log_output(&output);
        assert_eq!(commits[0].date, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn skips_malformed_records() {
        // Too few NUL-separated fields
        let bad = "aaa\0bb\x1erefs\x1f";
        let good = make_record("ddd", "Dave", "d@x", "100", "Good", "", "");
        let output = format!("{bad}{good}");
        let commits = parse_log_output(&output);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].hash, "ddd");
    }

    #[tokio::test]
    async fn resolve_root_of_non_repository_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_repo_root(tmp.path()).await;
        assert!(matches!(err, Err(CaptureError::NotARepository(_))));
    }
}
