//! Realtime subscription channel with auto-reconnect.
//!
//! Speaks the graphql-transport-ws protocol over a single WebSocket
//! connection and multiplexes any number of subscription operations over
//! it. The socket dials lazily on first demand, reconnects with
//! exponential backoff + jitter, and re-issues every active operation
//! after a reconnect.
//!
//! Connection parameters are recomputed at each (re)connection attempt by
//! reading the token store at that moment, so a rotated token propagates
//! to the next reconnect without tearing the channel down.
//!
//! # Example
//!
//! ```rust,ignore
//! use dealflow_api::{GraphqlRequest, MemoryTokenStore, ReconnectConfig, SubscriptionChannel};
//! use futures_util::StreamExt;
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let cancel = CancellationToken::new();
//! let ws_url = Url::parse("wss://api.crm.dealflow.dev/graphql")?;
//! let channel = SubscriptionChannel::new(ws_url, tokens, ReconnectConfig::default(), cancel.clone());
//!
//! let mut events = channel.subscribe(
//!     GraphqlRequest::new("subscription { taskUpdated { id title } }"),
//! );
//! while let Some(payload) = events.next().await {
//!     println!("{payload}");
//! }
//!
//! channel.shutdown();
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{Stream, StreamExt};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::error::Error;
use crate::graphql::GraphqlRequest;
use crate::token::TokenStore;

/// Subprotocol name the server must accept during the upgrade.
const GRAPHQL_WS_PROTOCOL: &str = "graphql-transport-ws";

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── Channel handle ───────────────────────────────────────────────────

/// Handle to the running realtime channel.
///
/// One socket per channel; all subscriptions share it. Dropping the
/// handle (or calling [`shutdown`](Self::shutdown)) tears down the
/// background task and ends every stream it feeds.
pub struct SubscriptionChannel {
    cmd_tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl SubscriptionChannel {
    /// Spawn the channel's background task. The socket is not dialed
    /// until the first [`subscribe`](Self::subscribe) call.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        ws_url: Url,
        tokens: Arc<dyn TokenStore>,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            ws_loop(ws_url, tokens, reconnect, cmd_rx, task_cancel).await;
        });

        Self { cmd_tx, cancel }
    }

    /// Register a subscription operation and stream its published events.
    ///
    /// The stream is infinite and survives reconnects; it ends only when
    /// the server completes the operation or the channel shuts down.
    pub fn subscribe(&self, request: GraphqlRequest) -> SubscriptionStream {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // If the background task is already gone the stream simply ends.
        let _ = self.cmd_tx.send(Command::Subscribe {
            request,
            events: events_tx,
        });

        SubscriptionStream { events: events_rx }
    }

    /// Signal the background task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Published events for one subscription operation.
pub struct SubscriptionStream {
    events: mpsc::UnboundedReceiver<Value>,
}

impl Stream for SubscriptionStream {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.get_mut().events.poll_recv(cx)
    }
}

enum Command {
    Subscribe {
        request: GraphqlRequest,
        events: mpsc::UnboundedSender<Value>,
    },
}

struct Subscription {
    request: GraphqlRequest,
    events: mpsc::UnboundedSender<Value>,
}

// ── Background reconnection loop ─────────────────────────────────────

/// Main loop: wait for demand → connect → serve → on error, backoff →
/// reconnect. The socket only exists while at least one subscription is
/// active.
async fn ws_loop(
    ws_url: Url,
    tokens: Arc<dyn TokenStore>,
    reconnect: ReconnectConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    let mut subs: HashMap<String, Subscription> = HashMap::new();
    let mut attempt: u32 = 0;

    loop {
        // Register queued demand, drop consumers that went away.
        let commands_closed = drain_commands(&mut cmd_rx, &mut subs);
        subs.retain(|_, sub| !sub.events.is_closed());

        if commands_closed || cancel.is_cancelled() {
            break;
        }

        if subs.is_empty() {
            // Lazy: no socket without demand.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        register(cmd, &mut subs);
                        continue;
                    }
                    None => break,
                },
            }
        }

        match connect_and_serve(&ws_url, &tokens, &mut subs, &mut cmd_rx, &cancel).await {
            // Clean close, idle teardown, or cancellation.
            Ok(()) => {
                if cancel.is_cancelled() {
                    break;
                }
                attempt = 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "realtime channel error");

                if let Some(max) = reconnect.max_retries {
                    if attempt >= max {
                        tracing::error!(
                            max_retries = max,
                            "realtime reconnection limit reached, giving up"
                        );
                        break;
                    }
                }

                let delay = calculate_backoff(attempt, &reconnect);
                tracing::info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt,
                    "waiting before reconnect"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
        }
    }

    tracing::debug!("realtime channel loop exiting");
}

fn register(cmd: Command, subs: &mut HashMap<String, Subscription>) {
    let Command::Subscribe { request, events } = cmd;
    subs.insert(
        Uuid::new_v4().to_string(),
        Subscription { request, events },
    );
}

/// Pull every queued command without blocking. Returns `true` once the
/// channel handle has been dropped.
fn drain_commands(
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    subs: &mut HashMap<String, Subscription>,
) -> bool {
    loop {
        match cmd_rx.try_recv() {
            Ok(cmd) => register(cmd, subs),
            Err(mpsc::error::TryRecvError::Empty) => return false,
            Err(mpsc::error::TryRecvError::Disconnected) => return true,
        }
    }
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Dial the socket, run the graphql-transport-ws handshake, re-issue all
/// active operations, then serve frames until the connection drops or
/// the last subscription ends.
async fn connect_and_serve(
    url: &Url,
    tokens: &Arc<dyn TokenStore>,
    subs: &mut HashMap<String, Subscription>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    tracing::info!(url = %url, "connecting realtime channel");

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let request = ClientRequestBuilder::new(uri).with_sub_protocol(GRAPHQL_WS_PROTOCOL);

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    let (mut write, mut read) = ws_stream.split();

    // Connection params come from the token store *now*, not from channel
    // construction time. A token rotated since the last connect rides
    // this handshake.
    send_text(&mut write, init_frame(connection_params(tokens.as_ref()))).await?;
    wait_for_ack(&mut read).await?;

    tracing::info!("realtime channel connected");

    // Re-issue every active operation on the fresh socket.
    for (id, sub) in subs.iter() {
        send_text(&mut write, subscribe_frame(id, &sub.request)).await?;
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Subscribe { request, events }) => {
                    let id = Uuid::new_v4().to_string();
                    send_text(&mut write, subscribe_frame(&id, &request)).await?;
                    subs.insert(id, Subscription { request, events });
                }
                None => return Ok(()),
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_server_message(&text, subs) {
                        send_text(&mut write, reply).await?;
                    }
                    if subs.is_empty() {
                        // Last subscription ended; drop the socket until
                        // there is demand again.
                        return Ok(());
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite replies with a pong frame automatically
                    tracing::trace!("websocket ping");
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(ref cf) = frame {
                        tracing::info!(code = %cf.code, reason = %cf.reason, "close frame received");
                    } else {
                        tracing::info!("close frame received (no payload)");
                    }
                    return Ok(());
                }
                Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
                None => {
                    tracing::info!("realtime stream ended");
                    return Ok(());
                }
                _ => {
                    // Binary, Pong, Frame -- ignore
                }
            }
        }
    }
}

async fn send_text<W>(write: &mut W, frame: String) -> Result<(), Error>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    write
        .send(Message::text(frame))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))
}

/// Read frames until the server acknowledges the handshake.
async fn wait_for_ack<S>(read: &mut S) -> Result<(), Error>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::ConnectionAck { .. }) => return Ok(()),
                Ok(ServerMessage::Ping { .. } | ServerMessage::Pong { .. }) => {}
                Ok(_) => {
                    return Err(Error::WebSocketConnect(
                        "expected connection_ack during handshake".into(),
                    ));
                }
                Err(e) => {
                    return Err(Error::WebSocketConnect(format!(
                        "unparseable handshake frame: {e}"
                    )));
                }
            },
            Ok(Message::Close(_)) => {
                return Err(Error::WebSocketConnect(
                    "connection closed during handshake".into(),
                ));
            }
            Ok(_) => {}
            Err(e) => return Err(Error::WebSocketConnect(e.to_string())),
        }
    }
    Err(Error::WebSocketConnect(
        "connection ended during handshake".into(),
    ))
}

// ── Protocol frames ──────────────────────────────────────────────────

/// graphql-transport-ws messages the server sends. Unknown fields are
/// ignored; only the routing-relevant shape is modeled.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    ConnectionAck {
        #[serde(default)]
        payload: Option<Value>,
    },
    Next {
        id: String,
        payload: Value,
    },
    Error {
        id: String,
        payload: Value,
    },
    Complete {
        id: String,
    },
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<Value>,
    },
}

/// The handshake payload: the bearer value is interpolated from the live
/// token, and omitted entirely for anonymous sessions.
fn connection_params(tokens: &dyn TokenStore) -> Value {
    match tokens.get() {
        Some(token) => json!({
            "headers": {
                "Authorization": format!("Bearer {}", token.expose_secret()),
            }
        }),
        None => json!({}),
    }
}

fn init_frame(params: Value) -> String {
    json!({ "type": "connection_init", "payload": params }).to_string()
}

fn subscribe_frame(id: &str, request: &GraphqlRequest) -> String {
    json!({ "id": id, "type": "subscribe", "payload": request }).to_string()
}

fn complete_frame(id: &str) -> String {
    json!({ "id": id, "type": "complete" }).to_string()
}

fn pong_frame() -> String {
    json!({ "type": "pong" }).to_string()
}

/// Route one server frame. Returns a frame to send back, if any.
fn handle_server_message(text: &str, subs: &mut HashMap<String, Subscription>) -> Option<String> {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable realtime frame");
            return None;
        }
    };

    match message {
        ServerMessage::Next { id, payload } => {
            if let Some(sub) = subs.get(&id) {
                if sub.events.send(payload).is_err() {
                    // Consumer dropped its stream; stop the operation.
                    subs.remove(&id);
                    return Some(complete_frame(&id));
                }
            }
            None
        }
        ServerMessage::Error { id, payload } => {
            tracing::warn!(%id, %payload, "subscription failed");
            subs.remove(&id);
            None
        }
        ServerMessage::Complete { id } => {
            subs.remove(&id);
            None
        }
        ServerMessage::Ping { .. } => Some(pong_frame()),
        ServerMessage::ConnectionAck { .. } | ServerMessage::Pong { .. } => None,
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from multiple clients.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    // Not cryptographically random, but good enough for backoff spread.
    let jitter_factor = 1.0 + 0.25 * ((attempt as f64 * 7.3).sin());
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::MemoryTokenStore;
    use secrecy::SecretString;

    fn sub(events: mpsc::UnboundedSender<Value>) -> Subscription {
        Subscription {
            request: GraphqlRequest::new("subscription { taskUpdated { id } }"),
            events,
        }
    }

    #[test]
    fn connection_params_interpolate_the_live_token() {
        let store = MemoryTokenStore::with_token("T1");
        assert_eq!(
            connection_params(&store),
            json!({ "headers": { "Authorization": "Bearer T1" } })
        );

        // A rotated token shows up on the next computation.
        store.set(SecretString::from("T2".to_owned())).unwrap();
        assert_eq!(
            connection_params(&store),
            json!({ "headers": { "Authorization": "Bearer T2" } })
        );
    }

    #[test]
    fn connection_params_omit_auth_when_anonymous() {
        let store = MemoryTokenStore::new();
        assert_eq!(connection_params(&store), json!({}));
    }

    #[test]
    fn subscribe_frame_carries_operation_and_variables() {
        let request = GraphqlRequest::new("subscription Tasks { taskUpdated { id } }")
            .variable("companyId", "42");
        let frame: Value = serde_json::from_str(&subscribe_frame("op-1", &request)).unwrap();

        assert_eq!(frame["type"], "subscribe");
        assert_eq!(frame["id"], "op-1");
        assert_eq!(
            frame["payload"]["query"],
            "subscription Tasks { taskUpdated { id } }"
        );
        assert_eq!(frame["payload"]["variables"]["companyId"], "42");
    }

    #[test]
    fn next_frames_route_to_their_subscription() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subs = HashMap::from([("op-1".to_owned(), sub(tx))]);

        let frame = json!({
            "type": "next",
            "id": "op-1",
            "payload": { "data": { "taskUpdated": { "id": "7" } } }
        });
        let reply = handle_server_message(&frame.to_string(), &mut subs);

        assert!(reply.is_none());
        let payload = rx.try_recv().unwrap();
        assert_eq!(payload["data"]["taskUpdated"]["id"], "7");
    }

    #[test]
    fn dropped_consumer_stops_the_operation() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut subs = HashMap::from([("op-1".to_owned(), sub(tx))]);

        let frame = json!({ "type": "next", "id": "op-1", "payload": {} });
        let reply = handle_server_message(&frame.to_string(), &mut subs);

        assert!(subs.is_empty());
        let reply: Value = serde_json::from_str(&reply.expect("complete frame")).unwrap();
        assert_eq!(reply, json!({ "id": "op-1", "type": "complete" }));
    }

    #[test]
    fn complete_removes_the_subscription() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut subs = HashMap::from([("op-1".to_owned(), sub(tx))]);

        let frame = json!({ "type": "complete", "id": "op-1" });
        assert!(handle_server_message(&frame.to_string(), &mut subs).is_none());
        assert!(subs.is_empty());
    }

    #[test]
    fn server_ping_gets_a_pong() {
        let mut subs = HashMap::new();
        let reply = handle_server_message(&json!({ "type": "ping" }).to_string(), &mut subs);
        let reply: Value = serde_json::from_str(&reply.expect("pong frame")).unwrap();
        assert_eq!(reply, json!({ "type": "pong" }));
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let mut subs = HashMap::new();
        assert!(handle_server_message("not json at all", &mut subs).is_none());
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);

        // Each step should roughly double (within jitter bounds)
        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };

        let d10 = calculate_backoff(10, &config);
        // With jitter factor up to 1.25, max effective is 12.5s
        assert!(
            d10 <= Duration::from_secs(13),
            "delay at attempt 10 ({d10:?}) should be capped near max_delay"
        );
    }
}
