//! Websocket transport speaking the hosted backend's Phoenix channel
//! protocol.
//!
//! The socket event loop runs in a dedicated tokio task. Callers talk to it
//! through a typed command channel; change records flow out through the
//! per-subscription sinks. There is no reconnection: when the socket dies
//! every sink is dropped and consumers observe end-of-stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use sanctuary_shared::constants::{DEFAULT_HEARTBEAT_SECS, DEFAULT_JOIN_TIMEOUT_SECS};
use sanctuary_shared::room::parse_timestamp;
use sanctuary_shared::{ChangeKind, ChangeRecord, ConnectionError, TopicFilter};

use crate::transport::{RealtimeTransport, SubscriptionHandle};

const EVENT_JOIN: &str = "phx_join";
const EVENT_LEAVE: &str = "phx_leave";
const EVENT_REPLY: &str = "phx_reply";
const EVENT_ERROR: &str = "phx_error";
const EVENT_CLOSE: &str = "phx_close";
const EVENT_HEARTBEAT: &str = "heartbeat";
const EVENT_SYSTEM: &str = "system";
const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
const PHOENIX_TOPIC: &str = "phoenix";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection settings for the realtime socket.
#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// Backend base URL (`http(s)://` or `ws(s)://`).
    pub endpoint: String,
    /// Project API key, sent as the `apikey` query parameter.
    pub api_key: String,
    /// User access token forwarded on every join, if signed in.
    pub access_token: Option<String>,
    pub heartbeat: Duration,
    pub join_timeout: Duration,
}

impl PhoenixConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            access_token: None,
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECS),
        }
    }

    /// Websocket URL for the realtime endpoint.
    pub fn socket_url(&self) -> Result<String, ConnectionError> {
        let base = self.endpoint.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(ConnectionError::Unreachable(format!(
                "endpoint must start with http(s):// or ws(s)://, got {base}"
            )));
        };

        Ok(format!(
            "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.api_key
        ))
    }
}

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// One Phoenix channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

fn join_payload(filter: &TopicFilter, access_token: Option<&str>) -> Value {
    let mut change = json!({
        "event": filter.event_name(),
        "schema": filter.schema,
        "table": filter.table,
    });
    if let Some(ref row_filter) = filter.filter {
        change["filter"] = Value::String(row_filter.clone());
    }

    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [change],
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    payload
}

/// Extract the change record carried by a `postgres_changes` payload.
fn decode_postgres_change(payload: &Value) -> Option<ChangeRecord> {
    let data = payload.get("data")?;
    let kind: ChangeKind = serde_json::from_value(data.get("type")?.clone()).ok()?;

    Some(ChangeRecord {
        kind,
        schema: data.get("schema")?.as_str()?.to_string(),
        table: data.get("table")?.as_str()?.to_string(),
        record: data.get("record").cloned().unwrap_or(Value::Null),
        old_record: data.get("old_record").cloned().unwrap_or(Value::Null),
        commit_timestamp: data
            .get("commit_timestamp")
            .and_then(|ts| parse_timestamp("commit_timestamp", ts).ok()),
    })
}

// ---------------------------------------------------------------------------
// Socket task
// ---------------------------------------------------------------------------

/// Commands sent *into* the socket task.
enum SocketCommand {
    Join {
        id: u64,
        filter: TopicFilter,
        sink: mpsc::Sender<ChangeRecord>,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Leave {
        id: u64,
    },
    Shutdown,
}

struct JoinedChannel {
    topic: String,
    join_ref: String,
    sink: mpsc::Sender<ChangeRecord>,
    /// Outstanding join reply, until the backend answers.
    pending: Option<oneshot::Sender<Result<(), ConnectionError>>>,
}

/// Realtime transport over a single shared websocket.
pub struct PhoenixTransport {
    cmd_tx: mpsc::Sender<SocketCommand>,
    next_id: AtomicU64,
    join_timeout: Duration,
}

impl PhoenixTransport {
    /// Open the websocket and spawn its event loop.
    pub async fn connect(config: PhoenixConfig) -> Result<Self, ConnectionError> {
        let url = config.socket_url()?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectionError::Unreachable(e.to_string()))?;

        info!(endpoint = %config.endpoint, "Realtime socket connected");

        let (cmd_tx, cmd_rx) = mpsc::channel::<SocketCommand>(64);
        tokio::spawn(run_socket(
            stream,
            cmd_rx,
            config.access_token.clone(),
            config.heartbeat,
        ));

        Ok(Self {
            cmd_tx,
            next_id: AtomicU64::new(1),
            join_timeout: config.join_timeout,
        })
    }

    /// Whether the socket task is still running.
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Close the socket. Every open subscription ends.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SocketCommand::Shutdown).await;
    }
}

#[async_trait]
impl RealtimeTransport for PhoenixTransport {
    async fn subscribe(
        &self,
        filter: TopicFilter,
        sink: mpsc::Sender<ChangeRecord>,
    ) -> Result<SubscriptionHandle, ConnectionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topic = filter.topic.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.cmd_tx
            .send(SocketCommand::Join {
                id,
                filter,
                sink,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ConnectionError::Closed)?;

        match tokio::time::timeout(self.join_timeout, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(SubscriptionHandle { id, topic }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                warn!(topic = %topic, "Join timed out");
                let _ = self.cmd_tx.send(SocketCommand::Leave { id }).await;
                Err(ConnectionError::Timeout)
            }
        }
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self
            .cmd_tx
            .send(SocketCommand::Leave { id: handle.id })
            .await
            .is_err()
        {
            debug!(topic = %handle.topic, "Socket already closed, nothing to leave");
        }
    }
}

async fn send_frame(writer: &mut WsWriter, frame: &Frame) -> Result<(), String> {
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    writer
        .send(WsMessage::Text(text))
        .await
        .map_err(|e| e.to_string())
}

async fn run_socket(
    stream: WsStream,
    mut cmd_rx: mpsc::Receiver<SocketCommand>,
    access_token: Option<String>,
    heartbeat: Duration,
) {
    let (mut writer, mut reader) = stream.split();
    let mut channels: HashMap<u64, JoinedChannel> = HashMap::new();
    let mut next_ref: u64 = 1;
    let mut pending_heartbeat: Option<String> = None;

    let mut ticker = tokio::time::interval(heartbeat);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            // --- Commands ---
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SocketCommand::Join { id, filter, sink, reply }) => {
                        let reference = next_ref.to_string();
                        next_ref += 1;

                        let frame = Frame {
                            topic: filter.topic.to_topic(),
                            event: EVENT_JOIN.to_string(),
                            payload: join_payload(&filter, access_token.as_deref()),
                            reference: Some(reference.clone()),
                            join_ref: Some(reference.clone()),
                        };
                        if let Err(e) = send_frame(&mut writer, &frame).await {
                            error!(topic = %frame.topic, error = %e, "Join send failed");
                            let _ = reply.send(Err(ConnectionError::Unreachable(e)));
                            break;
                        }

                        debug!(topic = %frame.topic, reference = %reference, "Join sent");
                        channels.insert(id, JoinedChannel {
                            topic: frame.topic,
                            join_ref: reference,
                            sink,
                            pending: Some(reply),
                        });
                    }
                    Some(SocketCommand::Leave { id }) => {
                        let Some(channel) = channels.remove(&id) else {
                            continue;
                        };
                        let reference = next_ref.to_string();
                        next_ref += 1;

                        let frame = Frame {
                            topic: channel.topic,
                            event: EVENT_LEAVE.to_string(),
                            payload: json!({}),
                            reference: Some(reference),
                            join_ref: Some(channel.join_ref),
                        };
                        if let Err(e) = send_frame(&mut writer, &frame).await {
                            error!(topic = %frame.topic, error = %e, "Leave send failed");
                            break;
                        }
                        debug!(topic = %frame.topic, "Left channel");
                    }
                    Some(SocketCommand::Shutdown) => {
                        info!("Realtime socket shutdown requested");
                        let _ = writer.send(WsMessage::Close(None)).await;
                        break;
                    }
                    None => {
                        info!("Transport dropped, closing realtime socket");
                        let _ = writer.close().await;
                        break;
                    }
                }
            }

            // --- Incoming frames ---
            incoming = reader.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => handle_frame(frame, &mut channels, &mut pending_heartbeat),
                        Err(e) => warn!(error = %e, "Ignoring malformed frame"),
                    },
                    Some(Ok(WsMessage::Close(reason))) => {
                        info!(reason = ?reason, "Realtime socket closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Realtime socket error");
                        break;
                    }
                    None => {
                        info!("Realtime socket stream ended");
                        break;
                    }
                }
            }

            // --- Heartbeat ---
            _ = ticker.tick() => {
                if let Some(ref missed) = pending_heartbeat {
                    warn!(reference = %missed, "Heartbeat unanswered, closing socket");
                    break;
                }

                let reference = next_ref.to_string();
                next_ref += 1;
                let frame = Frame {
                    topic: PHOENIX_TOPIC.to_string(),
                    event: EVENT_HEARTBEAT.to_string(),
                    payload: json!({}),
                    reference: Some(reference.clone()),
                    join_ref: None,
                };
                if let Err(e) = send_frame(&mut writer, &frame).await {
                    error!(error = %e, "Heartbeat send failed");
                    break;
                }
                pending_heartbeat = Some(reference);
            }
        }
    }

    // Dropping the channels drops every sink and every outstanding join reply.
    info!(channels = channels.len(), "Realtime socket loop terminated");
}

fn handle_frame(
    frame: Frame,
    channels: &mut HashMap<u64, JoinedChannel>,
    pending_heartbeat: &mut Option<String>,
) {
    match frame.event.as_str() {
        EVENT_REPLY if frame.topic == PHOENIX_TOPIC => {
            if frame.reference.is_some() && frame.reference == *pending_heartbeat {
                *pending_heartbeat = None;
            }
        }

        EVENT_REPLY => {
            let status = frame.payload.get("status").and_then(Value::as_str);
            let Some(reference) = frame.reference.as_deref() else {
                return;
            };
            let Some((&id, channel)) = channels
                .iter_mut()
                .find(|(_, c)| c.topic == frame.topic && c.join_ref == reference)
            else {
                return;
            };
            let Some(reply) = channel.pending.take() else {
                return;
            };

            if status == Some("ok") {
                info!(topic = %frame.topic, "Channel joined");
                let _ = reply.send(Ok(()));
            } else {
                let reason = frame
                    .payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("join refused")
                    .to_string();
                warn!(topic = %frame.topic, reason = %reason, "Channel join rejected");
                let _ = reply.send(Err(ConnectionError::Rejected(reason)));
                channels.remove(&id);
            }
        }

        EVENT_POSTGRES_CHANGES => {
            let Some(change) = decode_postgres_change(&frame.payload) else {
                warn!(topic = %frame.topic, "Ignoring undecodable postgres change");
                return;
            };
            for channel in channels.values().filter(|c| c.topic == frame.topic) {
                if let Err(e) = channel.sink.try_send(change.clone()) {
                    warn!(topic = %frame.topic, error = %e, "Change not delivered");
                }
            }
        }

        EVENT_SYSTEM if frame.payload.get("status").and_then(Value::as_str) == Some("error") => {
            let message = frame
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("subscription error");
            warn!(topic = %frame.topic, message = %message, "Backend reported subscription error");
            drop_topic(channels, &frame.topic, message);
        }

        EVENT_ERROR | EVENT_CLOSE => {
            warn!(topic = %frame.topic, event = %frame.event, "Channel closed by backend");
            drop_topic(channels, &frame.topic, &frame.event);
        }

        other => {
            debug!(topic = %frame.topic, event = %other, "Unhandled frame");
        }
    }
}

/// Remove every channel on `topic`, failing any outstanding join.
fn drop_topic(channels: &mut HashMap<u64, JoinedChannel>, topic: &str, reason: &str) {
    channels.retain(|_, channel| {
        if channel.topic != topic {
            return true;
        }
        if let Some(reply) = channel.pending.take() {
            let _ = reply.send(Err(ConnectionError::Rejected(reason.to_string())));
        }
        false
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use sanctuary_shared::RoomSpec;
    use tokio::net::TcpListener;

    #[test]
    fn test_socket_url() {
        let config = PhoenixConfig::new("https://abc.example.co/", "key123");
        assert_eq!(
            config.socket_url().unwrap(),
            "wss://abc.example.co/realtime/v1/websocket?apikey=key123&vsn=1.0.0"
        );

        let local = PhoenixConfig::new("http://localhost:54321", "k");
        assert!(local.socket_url().unwrap().starts_with("ws://localhost:54321/"));

        assert!(PhoenixConfig::new("ftp://nope", "k").socket_url().is_err());
    }

    #[test]
    fn test_join_payload_shape() {
        let filter = RoomSpec::stream_chat("s1").topic_filter();
        let payload = join_payload(&filter, Some("jwt"));

        let change = &payload["config"]["postgres_changes"][0];
        assert_eq!(change["event"], "INSERT");
        assert_eq!(change["table"], "stream_chat");
        assert_eq!(change["filter"], "stream_id=eq.s1");
        assert_eq!(payload["access_token"], "jwt");

        let wall = join_payload(&RoomSpec::prayer_wall().topic_filter(), None);
        assert_eq!(wall["config"]["postgres_changes"][0]["event"], "*");
        assert!(wall["config"]["postgres_changes"][0].get("filter").is_none());
        assert!(wall.get("access_token").is_none());
    }

    #[test]
    fn test_decode_postgres_change() {
        let payload = json!({
            "data": {
                "type": "UPDATE",
                "schema": "public",
                "table": "prayer_requests",
                "commit_timestamp": "2024-03-10T18:00:00Z",
                "record": {"id": "p1", "content": "edited"},
                "old_record": {"id": "p1"}
            },
            "ids": [1]
        });

        let change = decode_postgres_change(&payload).unwrap();
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.table, "prayer_requests");
        assert_eq!(change.record["content"], "edited");
        assert!(change.commit_timestamp.is_some());

        assert!(decode_postgres_change(&json!({"data": {"type": "TRUNCATE"}})).is_none());
    }

    /// Minimal realtime server: answers the first join with `status`, then
    /// pushes one insert on the joined topic when accepted.
    async fn spawn_server(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                let WsMessage::Text(text) = msg else { continue };
                let frame: Frame = serde_json::from_str(&text).unwrap();
                if frame.event != EVENT_JOIN {
                    continue;
                }

                let reply = json!({
                    "topic": frame.topic,
                    "event": "phx_reply",
                    "payload": {"status": status, "response": {"reason": "not allowed"}},
                    "ref": frame.reference,
                });
                ws.send(WsMessage::Text(reply.to_string())).await.unwrap();

                if status == "ok" {
                    let change = json!({
                        "topic": frame.topic,
                        "event": "postgres_changes",
                        "payload": {"data": {
                            "type": "INSERT",
                            "schema": "public",
                            "table": "stream_chat",
                            "commit_timestamp": "2024-03-10T18:00:00Z",
                            "record": {"id": "m1", "stream_id": "s1", "message": "hello"}
                        }},
                        "ref": null,
                    });
                    ws.send(WsMessage::Text(change.to_string())).await.unwrap();
                }
            }
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_join_and_receive_change() {
        let endpoint = spawn_server("ok").await;
        let transport = PhoenixTransport::connect(PhoenixConfig::new(endpoint, "anon"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let handle = transport
            .subscribe(RoomSpec::stream_chat("s1").topic_filter(), tx)
            .await
            .unwrap();
        assert_eq!(handle.topic.as_str(), "stream_chat:s1");

        let change = rx.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Insert);
        assert_eq!(change.record["message"], "hello");

        transport.unsubscribe(handle).await;
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_join() {
        let endpoint = spawn_server("error").await;
        let transport = PhoenixTransport::connect(PhoenixConfig::new(endpoint, "anon"))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let result = transport
            .subscribe(RoomSpec::stream_chat("s1").topic_filter(), tx)
            .await;
        assert_eq!(result, Err(ConnectionError::Rejected("not allowed".into())));
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result =
            PhoenixTransport::connect(PhoenixConfig::new(format!("http://{addr}"), "anon")).await;
        assert!(matches!(result, Err(ConnectionError::Unreachable(_))));
    }
}
