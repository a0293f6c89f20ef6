// End-to-end tests for `SubscriptionChannel` against a local
// graphql-transport-ws server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use dealflow_api::{
    GraphqlRequest, MemoryTokenStore, ReconnectConfig, SubscriptionChannel, TokenStore,
};

// ── Server helpers ──────────────────────────────────────────────────

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.expect("tcp accept");
    accept_hdr_async(stream, |req: &Request, mut resp: Response| {
        // Echo the requested subprotocol back, as a real server would.
        if let Some(proto) = req.headers().get("Sec-WebSocket-Protocol") {
            resp.headers_mut()
                .insert("Sec-WebSocket-Protocol", proto.clone());
        }
        Ok(resp)
    })
    .await
    .expect("ws handshake")
}

async fn read_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let frame = ws.next().await.expect("frame").expect("frame ok");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, frame: Value) {
    ws.send(Message::text(frame.to_string()))
        .await
        .expect("send frame");
}

/// Handshake + subscription intake for one connection: captures the
/// `connection_init` payload, acks, and returns the subscribe frame.
async fn serve_handshake(
    ws: &mut WebSocketStream<TcpStream>,
    seen_init: &mpsc::UnboundedSender<Value>,
) -> Value {
    let init = read_json(ws).await;
    assert_eq!(init["type"], "connection_init");
    seen_init.send(init["payload"].clone()).expect("test alive");

    send_json(ws, json!({ "type": "connection_ack" })).await;

    let subscribe = read_json(ws).await;
    assert_eq!(subscribe["type"], "subscribe");
    subscribe
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_carries_the_live_token_and_events_flow() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Value>();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let subscribe = serve_handshake(&mut ws, &seen_tx).await;
        assert_eq!(
            subscribe["payload"]["query"],
            "subscription { taskUpdated { id } }"
        );

        let id = subscribe["id"].as_str().expect("operation id").to_owned();
        send_json(
            &mut ws,
            json!({
                "type": "next",
                "id": id,
                "payload": { "data": { "taskUpdated": { "id": "t-7" } } }
            }),
        )
        .await;

        // Hold the connection open until the client tears down.
        while let Some(frame) = ws.next().await {
            if frame.is_err() {
                break;
            }
        }
    });

    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::with_token("T1"));
    let cancel = CancellationToken::new();
    let channel = SubscriptionChannel::new(
        Url::parse(&format!("ws://{addr}")).expect("ws url"),
        tokens,
        ReconnectConfig::default(),
        cancel.clone(),
    );

    let mut events =
        channel.subscribe(GraphqlRequest::new("subscription { taskUpdated { id } }"));

    let payload = events.next().await.expect("published event");
    assert_eq!(payload["data"]["taskUpdated"]["id"], "t-7");

    let init_payload = seen_rx.recv().await.expect("captured init");
    assert_eq!(init_payload["headers"]["Authorization"], "Bearer T1");

    cancel.cancel();
    server.abort();
}

#[tokio::test]
async fn reconnect_recomputes_connection_params_from_the_store() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Value>();
    let (proceed_tx, proceed_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        // First connection: accept the subscription, then close once the
        // test has rotated the token.
        {
            let mut ws = accept(&listener).await;
            let _subscribe = serve_handshake(&mut ws, &seen_tx).await;
            proceed_rx.await.expect("test alive");
            ws.close(None).await.ok();
        }

        // Second connection: the client re-issues the operation.
        let mut ws = accept(&listener).await;
        let subscribe = serve_handshake(&mut ws, &seen_tx).await;
        let id = subscribe["id"].as_str().expect("operation id").to_owned();
        send_json(
            &mut ws,
            json!({ "type": "next", "id": id, "payload": { "data": { "ok": true } } }),
        )
        .await;

        while let Some(frame) = ws.next().await {
            if frame.is_err() {
                break;
            }
        }
    });

    let store = Arc::new(MemoryTokenStore::with_token("T1"));
    let tokens: Arc<dyn TokenStore> = Arc::clone(&store) as Arc<dyn TokenStore>;
    let cancel = CancellationToken::new();
    let channel = SubscriptionChannel::new(
        Url::parse(&format!("ws://{addr}")).expect("ws url"),
        tokens,
        ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            ..ReconnectConfig::default()
        },
        cancel.clone(),
    );

    let mut events =
        channel.subscribe(GraphqlRequest::new("subscription { taskUpdated { id } }"));

    let first_init = seen_rx.recv().await.expect("first init");
    assert_eq!(first_init["headers"]["Authorization"], "Bearer T1");

    // Rotate the token, then let the server drop the connection. The
    // next handshake must carry the new value, not the one seen at
    // channel construction.
    store
        .set(SecretString::from("T2".to_owned()))
        .expect("rotate token");
    proceed_tx.send(()).expect("server alive");

    let second_init = seen_rx.recv().await.expect("second init");
    assert_eq!(second_init["headers"]["Authorization"], "Bearer T2");

    // The original stream survives the reconnect.
    let payload = events.next().await.expect("event after reconnect");
    assert_eq!(payload["data"]["ok"], true);

    cancel.cancel();
    server.abort();
}
