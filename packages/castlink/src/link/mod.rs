//! Session link: the authenticated WebSocket connection to the event service.
//!
//! Split the way the runtime works: [`manager`] owns the socket and its
//! lifecycle (connect, authenticate, heartbeat, reconnect with backoff),
//! [`router`] turns inbound frames into typed application events and carries
//! outbound control messages, [`protocol`] holds the wire types.

pub mod manager;
pub mod protocol;
pub mod router;

#[cfg(test)]
mod e2e_tests;

pub use manager::{LinkConfig, LinkState, SessionLink};
pub use protocol::{ClientMessage, ServerMessage};
pub use router::SessionRouter;

/// Errors surfaced by the session link.
///
/// Transport failures are retried internally for as long as the user stays
/// authenticated; authentication rejections are surfaced once and left to the
/// caller.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("event service rejected the credential")]
    Authentication,

    #[error("an authentication attempt is already in progress")]
    AuthenticationPending,

    #[error("malformed event service message: {0}")]
    Protocol(String),

    #[error("not logged in")]
    LoggedOut,
}
