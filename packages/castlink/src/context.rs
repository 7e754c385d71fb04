//! Process-wide auth and session state.
//!
//! One explicitly-constructed [`AppContext`] is built at startup and shared by
//! every component; there are no module-level globals. It owns the credential
//! store, the active coding session, the snippet buffer, and the typed event
//! bus that fans login/logout and session lifecycle changes out to the link
//! and the agent.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::credentials::CredentialStore;

/// Application events fanned out to all subscribers.
#[derive(Debug, Clone)]
pub enum AppEvent {
    UserLoggedIn,
    UserLoggedOut,
    SessionStarted {
        session_id: String,
        /// Server-side creation time, when the event carried one.
        created_at: Option<DateTime<Utc>>,
    },
    SessionEnded {
        session_id: String,
    },
}

/// The active coding session.
#[derive(Debug, Clone)]
pub struct CodingSession {
    pub id: String,
    /// Server-side creation time, when known.
    pub created_at: Option<DateTime<Utc>>,
    /// Local time tracking started; video-relative timestamps count from here.
    pub started_at: DateTime<Utc>,
}

/// A code excerpt captured during a session, uploaded with the commit batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub code: String,
    pub path: String,
    pub from_line: u32,
    pub to_line: u32,
    pub timestamp: DateTime<Utc>,
    pub video_timestamp: i64,
}

pub struct AppContext {
    credentials: CredentialStore,
    session: Mutex<Option<CodingSession>>,
    snippets: Mutex<Vec<Snippet>>,
    events: broadcast::Sender<AppEvent>,
}

impl AppContext {
    pub fn new(credentials: CredentialStore) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            credentials,
            session: Mutex::new(None),
            snippets: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.token().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: AppEvent) {
        // No receivers is fine (e.g. before the router spawns).
        let _ = self.events.send(event);
    }

    /// Store the credential and announce the login.
    pub fn login(&self, token: &str) -> anyhow::Result<()> {
        self.credentials.set_token(token)?;
        self.emit(AppEvent::UserLoggedIn);
        Ok(())
    }

    /// Clear the credential and announce the logout.
    pub fn logout(&self) -> anyhow::Result<()> {
        self.credentials.clear_token()?;
        self.emit(AppEvent::UserLoggedOut);
        Ok(())
    }

    /// Activate a session. Returns false (and changes nothing) when one is
    /// already active: concurrent start events are ignored, the first wins.
    pub fn begin_session(&self, id: &str, created_at: Option<DateTime<Utc>>) -> bool {
        let mut session = self.session.lock().expect("session lock poisoned");
        if let Some(active) = session.as_ref() {
            debug!(active = %active.id, ignored = %id, "session already active");
            return false;
        }
        *session = Some(CodingSession {
            id: id.to_string(),
            created_at,
            started_at: Utc::now(),
        });
        true
    }

    pub fn active_session(&self) -> Option<CodingSession> {
        self.session.lock().expect("session lock poisoned").clone()
    }

    /// End the session if `id` matches the active one, returning it.
    /// A mismatched or missing session returns None and changes nothing.
    pub fn end_session(&self, id: &str) -> Option<CodingSession> {
        let mut session = self.session.lock().expect("session lock poisoned");
        match session.as_ref() {
            Some(active) if active.id == id => session.take(),
            _ => None,
        }
    }

    /// End whatever session is active (local force-stop).
    pub fn take_session(&self) -> Option<CodingSession> {
        self.session.lock().expect("session lock poisoned").take()
    }

    /// Seconds since tracking started, while a session is active.
    /// Front-ends use this to stamp snippets with a video-relative time.
    #[allow(dead_code)]
    pub fn session_elapsed_secs(&self) -> Option<i64> {
        self.active_session()
            .map(|s| (Utc::now() - s.started_at).num_seconds().max(0))
    }

    /// Buffer a snippet for the end-of-session upload. Snippet capture is
    /// driven by the hosting surface, not the daemon itself.
    #[allow(dead_code)]
    pub fn add_snippet(&self, snippet: Snippet) {
        self.snippets
            .lock()
            .expect("snippet lock poisoned")
            .push(snippet);
    }

    pub fn snippets(&self) -> Vec<Snippet> {
        self.snippets.lock().expect("snippet lock poisoned").clone()
    }

    /// Drop per-session state (snippet buffer) after a flush or on abort.
    pub fn cleanup_session(&self) {
        self.session.lock().expect("session lock poisoned").take();
        self.snippets.lock().expect("snippet lock poisoned").clear();
    }
}

/// Build a context backed by a temp-dir credential store, optionally already
/// logged in. Returns the temp dir so it outlives the context.
#[cfg(test)]
pub fn test_context(token: Option<&str>) -> (Arc<AppContext>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let credentials = CredentialStore::load_or_init(tmp.path()).expect("credential store");
    if let Some(token) = token {
        credentials.set_token(token).expect("set token");
    }
    (AppContext::new(credentials), tmp)
}
