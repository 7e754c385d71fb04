//! Session event router: inbound frames become typed application events,
//! outbound control messages go through the managed link.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::LinkError;
use super::manager::SessionLink;
use super::protocol::{ClientMessage, ServerMessage, parse_server_message};
use crate::context::{AppContext, AppEvent};

/// Decodes inbound event service messages and dispatches session lifecycle
/// events onto the context's event bus. Also reacts to login/logout: a login
/// brings the link up and subscribes, a logout tears it down.
pub struct SessionRouter {
    ctx: Arc<AppContext>,
    link: Arc<SessionLink>,
}

impl SessionRouter {
    pub fn new(ctx: Arc<AppContext>, link: Arc<SessionLink>) -> Arc<Self> {
        Arc::new(Self { ctx, link })
    }

    /// Spawn the inbound decode loop and the auth-state reaction loop.
    pub fn spawn(self: &Arc<Self>, mut inbound_rx: mpsc::Receiver<String>) {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some(text) = inbound_rx.recv().await {
                router.route_text(&text);
            }
        });

        let router = self.clone();
        tokio::spawn(async move {
            let mut events = router.ctx.subscribe();
            loop {
                match events.recv().await {
                    Ok(AppEvent::UserLoggedIn) => router.start().await,
                    Ok(AppEvent::UserLoggedOut) => router.link.disconnect().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Bring the link up for an authenticated user and subscribe to session
    /// lifecycle events. A no-op while logged out.
    pub async fn start(&self) {
        if !self.ctx.is_authenticated() {
            return;
        }
        match self.link.connect().await {
            Ok(()) => {
                if let Err(e) = self.subscribe_sessions().await {
                    warn!(error = %e, "failed to subscribe to session events");
                }
            }
            Err(e) => {
                warn!(error = %e, "event service authentication failed");
            }
        }
    }

    /// Send a control message over the link (establishing it if necessary).
    pub async fn send(&self, message: ClientMessage) -> Result<(), LinkError> {
        self.link.send(message).await
    }

    /// Subscribe to created/stopped session events, now and after every
    /// reconnect.
    pub async fn subscribe_sessions(&self) -> Result<(), LinkError> {
        self.link
            .register_replay(ClientMessage::SubscribeCreatedOrStoppedSessions);
        self.send(ClientMessage::SubscribeCreatedOrStoppedSessions)
            .await
    }

    fn route_text(&self, text: &str) {
        match parse_server_message(text) {
            Ok(message) => self.route(message),
            Err(e) => {
                // Malformed inbound frames are logged and dropped; the
                // connection stays open.
                warn!(error = %e, "ignoring malformed event service message");
            }
        }
    }

    fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::CodingSessionCreated {
                coding_session_id,
                created_date_time,
            } => {
                info!(session = %coding_session_id, "coding session started");
                self.ctx.emit(AppEvent::SessionStarted {
                    session_id: coding_session_id,
                    created_at: created_date_time,
                });
            }
            ServerMessage::CodingSessionEnded { coding_session_id } => {
                info!(session = %coding_session_id, "coding session ended");
                self.ctx.emit(AppEvent::SessionEnded {
                    session_id: coding_session_id,
                });
            }
            ServerMessage::AuthenticationOk | ServerMessage::Error { .. } => {
                // Handshake replies are consumed by the manager; a stray one
                // here is harmless.
                debug!("ignoring authentication reply outside handshake");
            }
            ServerMessage::Unknown => {
                debug!("ignoring unknown event service message type");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    fn router(ctx: &Arc<AppContext>) -> Arc<SessionRouter> {
        let config = super::super::manager::LinkConfig {
            endpoint: "ws://127.0.0.1:0".to_string(),
            heartbeat_timeout: std::time::Duration::from_secs(31),
            retry_delay: std::time::Duration::from_secs(1),
            connect_jitter: (
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(2),
            ),
        };
        let (link, _inbound) = SessionLink::new(config, ctx.clone());
        SessionRouter::new(ctx.clone(), link)
    }

    #[tokio::test]
    async fn session_created_is_dispatched() {
        let (ctx, _tmp) = test_context(None);
        let router = router(&ctx);
        let mut events = ctx.subscribe();

        router.route_text(
            r#"{"type": "coding_session_created", "codingSessionId": "sess-1", "createdDateTime": "2024-01-01T00:00:00.000Z"}"#,
        );

        match events.recv().await.unwrap() {
            AppEvent::SessionStarted {
                session_id,
                created_at,
            } => {
                assert_eq!(session_id, "sess-1");
                assert!(created_at.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_ended_is_dispatched() {
        let (ctx, _tmp) = test_context(None);
        let router = router(&ctx);
        let mut events = ctx.subscribe();

        router.route_text(r#"{"type": "coding_session_ended", "codingSessionId": "sess-1"}"#);

        match events.recv().await.unwrap() {
            AppEvent::SessionEnded { session_id } => assert_eq!(session_id, "sess-1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_and_malformed_messages_are_ignored() {
        let (ctx, _tmp) = test_context(None);
        let router = router(&ctx);
        let mut events = ctx.subscribe();

        router.route_text(r#"{"type": "something_new"}"#);
        router.route_text("not json");

        // Nothing must reach the bus.
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
