//! End-to-end link tests: a real WebSocket service on localhost, with the
//! link's timers compressed so heartbeat and reconnect behavior is observable
//! in test time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use super::LinkError;
use super::manager::{LinkConfig, LinkState, SessionLink};
use super::protocol::ClientMessage;
use super::router::SessionRouter;
use crate::context::{AppEvent, test_context};

/// Timeout for each async operation in tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

fn test_link_config(endpoint: String) -> LinkConfig {
    LinkConfig {
        endpoint,
        heartbeat_timeout: Duration::from_millis(300),
        retry_delay: Duration::from_millis(50),
        connect_jitter: (Duration::from_millis(10), Duration::from_millis(30)),
    }
}

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("addr"));
    (listener, url)
}

type ServerWs = WebSocketStream<TcpStream>;

async fn accept_ws(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.expect("accept");
    tokio_tungstenite::accept_async(stream)
        .await
        .expect("ws accept")
}

/// Read the next JSON text frame from the client.
async fn next_json(ws: &mut ServerWs) -> serde_json::Value {
    loop {
        let frame = timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("read failed");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("invalid json");
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send failed");
}

/// Service side of the handshake: expect `authenticate`, reply ok.
async fn accept_and_authenticate(listener: &TcpListener) -> ServerWs {
    let mut ws = accept_ws(listener).await;
    let auth = next_json(&mut ws).await;
    assert_eq!(auth["type"], "authenticate");
    send_json(&mut ws, json!({"type": "authentication_ok"})).await;
    ws
}

async fn wait_for_state(link: &SessionLink, want: LinkState) {
    let mut rx = link.state_watch();
    timeout(TEST_TIMEOUT, rx.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for link state")
        .expect("state channel closed");
}

#[tokio::test]
async fn connect_authenticates_and_subscribes() {
    let (listener, url) = bind_server().await;
    let (ctx, _tmp) = test_context(Some("tok-1"));
    let (link, _inbound) = SessionLink::new(test_link_config(url), ctx.clone());
    let router = SessionRouter::new(ctx.clone(), link.clone());

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let auth = next_json(&mut ws).await;
        assert_eq!(auth["type"], "authenticate");
        assert_eq!(auth["authToken"], "tok-1");
        send_json(&mut ws, json!({"type": "authentication_ok"})).await;
        let sub = next_json(&mut ws).await;
        assert_eq!(sub["type"], "subscribe_created_or_stopped_sessions");
        ws
    });

    link.connect().await.expect("connect");
    assert_eq!(link.state(), LinkState::Open);
    router.subscribe_sessions().await.expect("subscribe");

    let _ws = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    link.disconnect().await;
    wait_for_state(&link, LinkState::Absent).await;
}

#[tokio::test]
async fn authentication_failure_is_surfaced_once_and_not_retried() {
    let (listener, url) = bind_server().await;
    let (ctx, _tmp) = test_context(Some("bad-token"));
    let (link, _inbound) = SessionLink::new(test_link_config(url), ctx.clone());

    let connections = Arc::new(AtomicUsize::new(0));
    let server_connections = connections.clone();
    tokio::spawn(async move {
        loop {
            let mut ws = accept_ws(&listener).await;
            server_connections.fetch_add(1, Ordering::SeqCst);
            let _auth = next_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "error"})).await;
        }
    });

    let err = link.connect().await.unwrap_err();
    assert!(matches!(err, LinkError::Authentication));
    wait_for_state(&link, LinkState::Absent).await;

    // The manager must not quietly retry a rejected credential.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn heartbeat_timeout_triggers_reconnect_with_fresh_authenticate() {
    let (listener, url) = bind_server().await;
    let (ctx, _tmp) = test_context(Some("tok-1"));
    let (link, _inbound) = SessionLink::new(test_link_config(url), ctx.clone());

    let server = tokio::spawn(async move {
        // First connection authenticates but never pings; hold it open so the
        // only way out is the client's heartbeat timer.
        let first = accept_and_authenticate(&listener).await;
        let second = accept_and_authenticate(&listener).await;
        drop(first);
        second
    });

    link.connect().await.expect("connect");

    // The client must come back on its own with a fresh handshake.
    let _second = timeout(TEST_TIMEOUT, server)
        .await
        .expect("client never reconnected")
        .unwrap();
    link.disconnect().await;
}

#[tokio::test]
async fn pings_keep_the_connection_alive() {
    let (listener, url) = bind_server().await;
    let (ctx, _tmp) = test_context(Some("tok-1"));
    let (link, _inbound) = SessionLink::new(test_link_config(url), ctx.clone());

    let server = tokio::spawn(async move {
        let mut ws = accept_and_authenticate(&listener).await;
        // Ping well inside the 300ms heartbeat for ~800ms.
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ws.send(Message::Ping(Vec::new().into())).await.expect("ping");
        }
        // A reconnect attempt here would mean the heartbeat lapsed.
        let second = timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(second.is_err(), "client reconnected despite pings");
        ws
    });

    link.connect().await.expect("connect");
    let _ws = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    assert_eq!(link.state(), LinkState::Open);
    link.disconnect().await;
}

#[tokio::test]
async fn logout_during_connect_goes_absent_and_stops_retrying() {
    let (listener, url) = bind_server().await;
    let (ctx, _tmp) = test_context(Some("tok-1"));
    let (link, _inbound) = SessionLink::new(test_link_config(url), ctx.clone());

    let attempts = Arc::new(AtomicUsize::new(0));
    let server_attempts = attempts.clone();
    tokio::spawn(async move {
        // Accept TCP but never answer the WebSocket handshake, pinning the
        // client in Connecting.
        let mut held = Vec::new();
        loop {
            let (stream, _) = listener.accept().await.expect("accept");
            server_attempts.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });

    let connect_task = {
        let link = link.clone();
        tokio::spawn(async move { link.connect().await })
    };
    wait_for_state(&link, LinkState::Connecting).await;

    link.disconnect().await;
    wait_for_state(&link, LinkState::Absent).await;

    // The abandoned authentication wait resolves with an error, not a hang.
    let result = timeout(TEST_TIMEOUT, connect_task).await.unwrap().unwrap();
    assert!(result.is_err());

    // And no further attempts happen until a subsequent login.
    let before = attempts.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn transport_failures_are_retried_while_authenticated() {
    let (listener, url) = bind_server().await;
    let (ctx, _tmp) = test_context(Some("tok-1"));
    let (link, _inbound) = SessionLink::new(test_link_config(url), ctx.clone());

    let attempts = Arc::new(AtomicUsize::new(0));
    let server_attempts = attempts.clone();
    let server = tokio::spawn(async move {
        // Kill the first three attempts at the TCP level, then let one through.
        for _ in 0..3 {
            let (stream, _) = listener.accept().await.expect("accept");
            server_attempts.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
        accept_and_authenticate(&listener).await
    });

    link.connect().await.expect("connect should eventually succeed");
    assert_eq!(link.state(), LinkState::Open);
    assert!(attempts.load(Ordering::SeqCst) >= 3);

    let _ws = timeout(TEST_TIMEOUT, server).await.unwrap();
    link.disconnect().await;
}

#[tokio::test]
async fn send_establishes_the_connection_first() {
    let (listener, url) = bind_server().await;
    let (ctx, _tmp) = test_context(Some("tok-1"));
    let (link, _inbound) = SessionLink::new(test_link_config(url), ctx.clone());

    let server = tokio::spawn(async move {
        let mut ws = accept_and_authenticate(&listener).await;
        let msg = next_json(&mut ws).await;
        assert_eq!(msg["type"], "subscribe_created_or_stopped_sessions");
        ws
    });

    // No explicit connect: sending dials and authenticates as a side effect.
    link.send(ClientMessage::SubscribeCreatedOrStoppedSessions)
        .await
        .expect("send");

    let _ws = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    link.disconnect().await;
}

#[tokio::test]
async fn subscription_replays_after_reconnect() {
    let (listener, url) = bind_server().await;
    let (ctx, _tmp) = test_context(Some("tok-1"));
    let (link, _inbound) = SessionLink::new(test_link_config(url), ctx.clone());
    let router = SessionRouter::new(ctx.clone(), link.clone());

    let server = tokio::spawn(async move {
        let mut first = accept_and_authenticate(&listener).await;
        let sub = next_json(&mut first).await;
        assert_eq!(sub["type"], "subscribe_created_or_stopped_sessions");
        drop(first);

        // After the drop the client reconnects and must replay the
        // subscription without anyone asking again.
        let mut second = accept_and_authenticate(&listener).await;
        let sub = next_json(&mut second).await;
        assert_eq!(sub["type"], "subscribe_created_or_stopped_sessions");
        second
    });

    link.connect().await.expect("connect");
    router.subscribe_sessions().await.expect("subscribe");

    let _ws = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    link.disconnect().await;
}

#[tokio::test]
async fn session_lifecycle_events_reach_the_bus() {
    let (listener, url) = bind_server().await;
    let (ctx, _tmp) = test_context(Some("tok-1"));
    let (link, inbound_rx) = SessionLink::new(test_link_config(url), ctx.clone());
    let router = SessionRouter::new(ctx.clone(), link.clone());
    router.spawn(inbound_rx);
    let mut events = ctx.subscribe();

    let server = tokio::spawn(async move {
        let mut ws = accept_and_authenticate(&listener).await;
        send_json(
            &mut ws,
            json!({
                "type": "coding_session_created",
                "codingSessionId": "sess-1",
                "createdDateTime": "2024-01-01T00:00:00.000Z",
            }),
        )
        .await;
        // Unknown types must be skipped without disturbing the stream.
        send_json(&mut ws, json!({"type": "unrelated_future_thing"})).await;
        send_json(
            &mut ws,
            json!({"type": "coding_session_ended", "codingSessionId": "sess-1"}),
        )
        .await;
        ws
    });

    link.connect().await.expect("connect");

    match timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap() {
        AppEvent::SessionStarted {
            session_id,
            created_at,
        } => {
            assert_eq!(session_id, "sess-1");
            assert!(created_at.is_some());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap() {
        AppEvent::SessionEnded { session_id } => assert_eq!(session_id, "sess-1"),
        other => panic!("unexpected event: {other:?}"),
    }

    let _ws = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    link.disconnect().await;
}
