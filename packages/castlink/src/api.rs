//! REST client for the session backend: session creation/completion and the
//! end-of-session commit upload.

use std::sync::Arc;

use commit_capture::CommitRecord;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{AppContext, Snippet};

/// Errors from the REST surface. Upload failures are surfaced to the user and
/// not retried indefinitely; losing a batch after repeated failure is accepted.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {path} returned {status}")]
    Status {
        method: &'static str,
        path: String,
        status: StatusCode,
    },
}

/// A session created server-side.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedSession {
    #[serde(rename = "_id")]
    pub id: String,
}

#[derive(Serialize)]
struct CommitsBody<'a> {
    commits: &'a [CommitRecord],
    snippets: &'a [Snippet],
}

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    ctx: Arc<AppContext>,
}

impl ApiClient {
    pub fn new(base: String, ctx: Arc<AppContext>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Agent-Version",
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        headers.insert(
            "X-Agent-OS",
            HeaderValue::from_static(std::env::consts::OS),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build HTTP client");

        Self { http, base, ctx }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.post(format!("{}{}", self.base, path));
        if let Some(token) = self.ctx.credentials().token() {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }
        request
    }

    async fn check(
        response: reqwest::Response,
        method: &'static str,
        path: String,
    ) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                method,
                path,
                status,
            });
        }
        Ok(response)
    }

    /// Create a coding session server-side (local start).
    pub async fn create_session(&self) -> Result<CreatedSession, ApiError> {
        let path = "/coding-sessions";
        let response = self.post(path).send().await?;
        let response = Self::check(response, "POST", path.to_string()).await?;
        Ok(response.json().await?)
    }

    /// Mark a session complete.
    pub async fn complete_session(&self, session_id: &str) -> Result<(), ApiError> {
        let path = format!("/coding-sessions/{}/complete", session_id);
        let response = self.post(&path).send().await?;
        Self::check(response, "POST", path).await?;
        Ok(())
    }

    /// Flush the session's captured commits and snippets in one batch.
    pub async fn upload_commits(
        &self,
        session_id: &str,
        commits: &[CommitRecord],
        snippets: &[Snippet],
    ) -> Result<(), ApiError> {
        debug!(
            session = %session_id,
            commits = commits.len(),
            snippets = snippets.len(),
            "uploading session batch"
        );
        let path = format!("/coding-sessions/{}/commits", session_id);
        let body = CommitsBody { commits, snippets };
        let response = self.post(&path).json(&body).send().await?;
        Self::check(response, "POST", path).await?;
        Ok(())
    }
}
