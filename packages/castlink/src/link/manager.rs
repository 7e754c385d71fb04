//! SessionLink: the single managed connection to the session event service.
//!
//! One supervisor task owns the socket. It dials, authenticates, keeps the
//! heartbeat deadline honest, and reconnects with a jittered backoff for as
//! long as the user stays authenticated. Callers never dial themselves: they
//! await the shared state channel until the link is open (single-flight), and
//! sending while disconnected establishes the connection as a side effect.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LinkError;
use super::protocol::{ClientMessage, ServerMessage, parse_server_message};
use crate::context::AppContext;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Tunables for the event service link. The defaults are the production
/// values; tests compress them.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// WebSocket endpoint of the event service.
    pub endpoint: String,
    /// Terminate the connection when no ping arrives for this long.
    pub heartbeat_timeout: Duration,
    /// Baseline delay before any reconnect attempt.
    pub retry_delay: Duration,
    /// Extra randomized delay range `[min, max)` added when establishing the
    /// transport failed, to avoid thundering-herd reconnects.
    pub connect_jitter: (Duration, Duration),
}

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection and nobody trying: logged out, or authentication was
    /// rejected.
    Absent,
    Connecting,
    Open,
    Closing,
    Closed,
}

struct Supervisor {
    cancel: CancellationToken,
    outbound_tx: mpsc::Sender<ClientMessage>,
}

struct Inner {
    supervisor: Option<Supervisor>,
    /// At most one caller may be waiting on an authentication handshake.
    auth_waiter: Option<oneshot::Sender<Result<(), LinkError>>>,
    /// Bumped on every supervisor spawn so a stale task never tears down its
    /// successor's state.
    generation: u64,
}

/// Owns the connection to the event service. Exactly one per process.
pub struct SessionLink {
    config: LinkConfig,
    ctx: Arc<AppContext>,
    state_tx: watch::Sender<LinkState>,
    inbound_tx: mpsc::Sender<String>,
    subscriptions: Mutex<Vec<ClientMessage>>,
    inner: Mutex<Inner>,
}

enum ConnectionExit {
    AuthRejected,
    Cancelled,
    Dropped,
}

impl SessionLink {
    /// Create the link. The returned receiver carries raw inbound frames for
    /// the router to decode.
    pub fn new(config: LinkConfig, ctx: Arc<AppContext>) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (state_tx, _) = watch::channel(LinkState::Absent);
        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        let link = Arc::new(Self {
            config,
            ctx,
            state_tx,
            inbound_tx,
            subscriptions: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                supervisor: None,
                auth_waiter: None,
                generation: 0,
            }),
        });
        (link, inbound_rx)
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Watch connection state changes (used by tests and the status surface).
    #[allow(dead_code)]
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Establish the connection and complete the authentication handshake.
    ///
    /// Single-flight: while an attempt is in progress every caller awaits the
    /// same outcome, but only one caller may hold the authentication wait;
    /// a second `connect` while one is pending is rejected. Authentication
    /// rejection is surfaced here exactly once and not retried internally.
    pub async fn connect(self: &Arc<Self>) -> Result<(), LinkError> {
        let token = self.ctx.credentials().token().ok_or(LinkError::LoggedOut)?;

        if self.state() == LinkState::Open {
            return Ok(());
        }

        let rx = {
            let mut inner = self.inner.lock().expect("link state lock poisoned");
            if inner.auth_waiter.is_some() {
                return Err(LinkError::AuthenticationPending);
            }
            let (tx, rx) = oneshot::channel();
            inner.auth_waiter = Some(tx);
            rx
        };
        self.ensure_supervisor(token);

        // The handshake may have finished between the fast path and the
        // waiter registration; resolve immediately in that case.
        if self.state() == LinkState::Open {
            self.resolve_auth_waiter(Ok(()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(LinkError::LoggedOut),
        }
    }

    /// Send a control message over the link, establishing the connection
    /// first if none exists. Waits for the link to open, so the message is
    /// never silently dropped while a connection attempt is in flight.
    pub async fn send(self: &Arc<Self>, message: ClientMessage) -> Result<(), LinkError> {
        let token = self.ctx.credentials().token().ok_or(LinkError::LoggedOut)?;
        let outbound = self.ensure_supervisor(token);
        self.wait_until_open().await?;
        outbound
            .send(message)
            .await
            .map_err(|_| LinkError::Transport("connection supervisor stopped".to_string()))
    }

    /// Register a message to replay after every successful authentication.
    /// Subscription state does not survive reconnects on the peer side.
    pub fn register_replay(&self, message: ClientMessage) {
        let mut subs = self
            .subscriptions
            .lock()
            .expect("subscription lock poisoned");
        if !subs
            .iter()
            .any(|m| std::mem::discriminant(m) == std::mem::discriminant(&message))
        {
            subs.push(message);
        }
    }

    /// Tear the link down and stop reconnecting. Any pending authentication
    /// wait resolves with an error instead of hanging.
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut inner = self.inner.lock().expect("link state lock poisoned");
            if let Some(waiter) = inner.auth_waiter.take() {
                let _ = waiter.send(Err(LinkError::LoggedOut));
            }
            inner.supervisor.take()
        };
        match supervisor {
            Some(s) => s.cancel.cancel(),
            None => {
                self.state_tx.send_replace(LinkState::Absent);
            }
        }
    }

    /// Spawn the supervisor if none is running; return its outbound queue.
    fn ensure_supervisor(self: &Arc<Self>, token: String) -> mpsc::Sender<ClientMessage> {
        let mut inner = self.inner.lock().expect("link state lock poisoned");
        if let Some(supervisor) = &inner.supervisor {
            return supervisor.outbound_tx.clone();
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(100);
        let cancel = CancellationToken::new();
        inner.generation += 1;
        let generation = inner.generation;
        inner.supervisor = Some(Supervisor {
            cancel: cancel.clone(),
            outbound_tx: outbound_tx.clone(),
        });
        self.state_tx.send_replace(LinkState::Connecting);

        let link = self.clone();
        tokio::spawn(async move {
            link.run_supervisor(token, generation, cancel, outbound_rx)
                .await;
        });
        outbound_tx
    }

    async fn wait_until_open(&self) -> Result<(), LinkError> {
        let mut state_rx = self.state_tx.subscribe();
        let state = state_rx
            .wait_for(|s| matches!(*s, LinkState::Open | LinkState::Absent))
            .await
            .map_err(|_| LinkError::Transport("connection manager gone".to_string()))?;
        match *state {
            LinkState::Open => Ok(()),
            _ => Err(LinkError::LoggedOut),
        }
    }

    fn resolve_auth_waiter(&self, result: Result<(), LinkError>) {
        let waiter = self
            .inner
            .lock()
            .expect("link state lock poisoned")
            .auth_waiter
            .take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(result);
        }
    }

    fn replay_messages(&self) -> Vec<ClientMessage> {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .clone()
    }

    /// The retry state machine: dial, run the connection, classify the exit,
    /// sleep, repeat. Runs until logout or an authentication rejection.
    async fn run_supervisor(
        self: Arc<Self>,
        token: String,
        generation: u64,
        cancel: CancellationToken,
        mut outbound_rx: mpsc::Receiver<ClientMessage>,
    ) {
        loop {
            self.state_tx.send_replace(LinkState::Connecting);
            debug!(endpoint = %self.config.endpoint, "connecting to event service");

            let ws = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(self.config.endpoint.as_str()) => match result {
                    Ok((ws, _response)) => ws,
                    Err(e) => {
                        warn!(error = %e, "event service connect failed");
                        self.state_tx.send_replace(LinkState::Closed);
                        let delay = retry_delay(&self.config, true);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                },
            };

            match self
                .run_connection(ws, &token, &cancel, &mut outbound_rx)
                .await
            {
                ConnectionExit::AuthRejected => {
                    // Surfaced once to whoever initiated the login; the
                    // caller decides whether to retry.
                    self.resolve_auth_waiter(Err(LinkError::Authentication));
                    warn!("event service rejected the credential, closing the link");
                    break;
                }
                ConnectionExit::Cancelled => break,
                ConnectionExit::Dropped => {
                    self.state_tx.send_replace(LinkState::Closed);
                    let delay = retry_delay(&self.config, false);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let mut inner = self.inner.lock().expect("link state lock poisoned");
        if inner.generation == generation {
            inner.supervisor = None;
            if let Some(waiter) = inner.auth_waiter.take() {
                let _ = waiter.send(Err(LinkError::LoggedOut));
            }
            self.state_tx.send_replace(LinkState::Absent);
        }
    }

    /// Drive one established socket: authenticate, then pump frames until the
    /// connection dies, the heartbeat lapses, or we are cancelled.
    async fn run_connection(
        &self,
        ws: WsStream,
        token: &str,
        cancel: &CancellationToken,
        outbound_rx: &mut mpsc::Receiver<ClientMessage>,
    ) -> ConnectionExit {
        let (mut sink, mut stream) = ws.split();

        // Armed at socket open, re-armed by every transport ping.
        let heartbeat = tokio::time::sleep(self.config.heartbeat_timeout);
        tokio::pin!(heartbeat);

        let auth = ClientMessage::Authenticate {
            auth_token: token.to_string(),
        };
        if send_json(&mut sink, &auth).await.is_err() {
            return ConnectionExit::Dropped;
        }

        // Handshake: nothing else flows until the service's verdict arrives.
        // Outbound messages queue on the channel until the link opens.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return ConnectionExit::Cancelled;
                }
                () = &mut heartbeat => {
                    warn!("heartbeat timed out during authentication");
                    return ConnectionExit::Dropped;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match parse_server_message(text.as_str()) {
                        Ok(ServerMessage::AuthenticationOk) => break,
                        Ok(ServerMessage::Error { message }) => {
                            debug!(message = ?message, "authentication rejected");
                            let _ = sink.send(Message::Close(None)).await;
                            return ConnectionExit::AuthRejected;
                        }
                        Ok(other) => debug!(?other, "ignoring message during handshake"),
                        Err(e) => warn!(error = %e, "ignoring malformed handshake frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        heartbeat.as_mut().reset(
                            tokio::time::Instant::now() + self.config.heartbeat_timeout,
                        );
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return ConnectionExit::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "event service read failed");
                        return ConnectionExit::Dropped;
                    }
                },
            }
        }

        info!("event service link open");
        self.state_tx.send_replace(LinkState::Open);
        self.resolve_auth_waiter(Ok(()));

        for message in self.replay_messages() {
            if send_json(&mut sink, &message).await.is_err() {
                return ConnectionExit::Dropped;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.state_tx.send_replace(LinkState::Closing);
                    let _ = sink.send(Message::Close(None)).await;
                    return ConnectionExit::Cancelled;
                }
                () = &mut heartbeat => {
                    warn!("no heartbeat within the timeout, terminating connection");
                    return ConnectionExit::Dropped;
                }
                outbound = outbound_rx.recv() => match outbound {
                    Some(message) => {
                        if send_json(&mut sink, &message).await.is_err() {
                            return ConnectionExit::Dropped;
                        }
                    }
                    None => return ConnectionExit::Cancelled,
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Ping(payload))) => {
                        heartbeat.as_mut().reset(
                            tokio::time::Instant::now() + self.config.heartbeat_timeout,
                        );
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if self.inbound_tx.send(text.to_string()).await.is_err() {
                            debug!("inbound consumer gone, closing link");
                            return ConnectionExit::Cancelled;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("event service closed the connection");
                        return ConnectionExit::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "event service read failed");
                        return ConnectionExit::Dropped;
                    }
                    None => return ConnectionExit::Dropped,
                },
            }
        }
    }
}

async fn send_json(sink: &mut WsSink, message: &ClientMessage) -> Result<(), LinkError> {
    let json = serde_json::to_string(message).map_err(|e| LinkError::Protocol(e.to_string()))?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| LinkError::Transport(e.to_string()))
}

/// Delay before the next connection attempt. A plain baseline after a dropped
/// connection; baseline plus an independent random value from the configured
/// range after a transport-establishment failure.
fn retry_delay(config: &LinkConfig, establishment_error: bool) -> Duration {
    if !establishment_error {
        return config.retry_delay;
    }
    let (min, max) = config.connect_jitter;
    let extra = if max > min {
        let span = (max - min).as_millis().max(1) as u64;
        min + Duration::from_millis(rand::rng().random_range(0..span))
    } else {
        min
    };
    config.retry_delay + extra
}
