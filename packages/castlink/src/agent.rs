//! Session orchestrator: reacts to session lifecycle events by arming the
//! commit watcher, and flushes captured commits and snippets to the backend
//! when the session ends.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use commit_capture::CommitWatcher;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::config::ServiceFileConfig;
use crate::context::{AppContext, AppEvent, CodingSession};
use crate::link::SessionRouter;
use crate::status::StatusSink;

pub struct Agent {
    ctx: Arc<AppContext>,
    router: Arc<SessionRouter>,
    api: ApiClient,
    sink: Arc<dyn StatusSink>,
    service: ServiceFileConfig,
    capture_roots: Vec<PathBuf>,
    watcher: Mutex<Option<Arc<CommitWatcher>>>,
}

impl Agent {
    pub fn new(
        ctx: Arc<AppContext>,
        router: Arc<SessionRouter>,
        api: ApiClient,
        sink: Arc<dyn StatusSink>,
        service: ServiceFileConfig,
        capture_roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            router,
            api,
            sink,
            service,
            capture_roots,
            watcher: Mutex::new(None),
        }
    }

    /// Run until shutdown. Brings the link up for an already-authenticated
    /// user, optionally starts a session locally, then follows the event bus.
    pub async fn run(&self, record: bool, shutdown: CancellationToken) -> Result<()> {
        let mut events = self.ctx.subscribe();

        self.router.start().await;

        if record {
            self.start_local_session().await?;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.force_stop().await;
                    break;
                }
                event = events.recv() => match event {
                    Ok(AppEvent::SessionStarted { session_id, created_at }) => {
                        self.on_session_started(&session_id, created_at).await;
                    }
                    Ok(AppEvent::SessionEnded { session_id }) => {
                        self.on_session_ended(&session_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    /// Create a session server-side and run it as if the peer announced it.
    async fn start_local_session(&self) -> Result<()> {
        let created = self.api.create_session().await?;
        self.sink.info(&format!(
            "Live coding session created: {}",
            self.service.watch_url(&created.id)
        ));
        self.on_session_started(&created.id, None).await;
        Ok(())
    }

    pub(crate) async fn on_session_started(
        &self,
        session_id: &str,
        created_at: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        if !self.ctx.begin_session(session_id, created_at) {
            debug!(session = %session_id, "ignoring session start while one is active");
            return;
        }

        // begin_session stamped the tracking start; the watcher's window and
        // all video timestamps count from it.
        let started_at = self
            .ctx
            .active_session()
            .map(|s| s.started_at)
            .unwrap_or_else(chrono::Utc::now);

        let watcher = CommitWatcher::new(started_at);
        watcher.watch_workspace(&self.capture_roots).await;
        *self.watcher.lock().await = Some(watcher);

        self.sink
            .info(&format!("Recording session {}", session_id));
    }

    pub(crate) async fn on_session_ended(&self, session_id: &str) {
        let Some(session) = self.ctx.end_session(session_id) else {
            debug!(session = %session_id, "ignoring end for inactive session");
            return;
        };
        self.flush(&session).await;
    }

    /// End the active session regardless of id (shutdown, local stop).
    pub async fn force_stop(&self) {
        if let Some(session) = self.ctx.take_session() {
            self.flush(&session).await;
        }
    }

    /// Upload whatever the session captured, then mark it complete. Upload
    /// failure is reported and the batch is dropped; there is no retry loop.
    async fn flush(&self, session: &CodingSession) {
        let watcher = self.watcher.lock().await.take();
        let commits = match &watcher {
            Some(w) => w.records().await,
            None => Vec::new(),
        };
        let snippets = self.ctx.snippets();

        if !commits.is_empty() || !snippets.is_empty() {
            if let Err(e) = self
                .api
                .upload_commits(&session.id, &commits, &snippets)
                .await
            {
                warn!(error = %e, session = %session.id, "commit upload failed");
                self.sink.error("Error uploading your commits");
            }
        }

        if let Err(e) = self.api.complete_session(&session.id).await {
            warn!(error = %e, session = %session.id, "failed to complete session");
            self.sink
                .error("Something went wrong while completing your session");
        } else {
            self.sink.info(&format!(
                "Uploading coding session to {}",
                self.service.watch_url(&session.id)
            ));
        }

        if let Some(watcher) = watcher {
            watcher.cleanup().await;
        }
        self.ctx.cleanup_session();
    }
}
