//! Websocket transport speaking the Phoenix channels protocol used by the
//! hosted realtime service.
//!
//! All channels share one websocket. Each channel is joined on its own topic
//! with a single `postgres_changes` binding for `*` events on its table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::{ChannelId, ConnectionStatus, EventSender, RealtimeTransport};
use crate::config::RealtimeConfig;
use crate::descriptor::ChannelKey;
use crate::error::RealtimeError;
use crate::event::ChangeEvent;

const VSN: &str = "1.0.0";
const PHOENIX_TOPIC: &str = "phoenix";

mod events {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const CLOSE: &str = "phx_close";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    pub const SYSTEM: &str = "system";
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

#[derive(Clone)]
pub struct PhoenixSettings {
    /// Project base url, `https://<project>.example.co`.
    pub url: String,
    pub api_key: String,
    pub schema: String,
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl PhoenixSettings {
    pub fn from_config(config: &RealtimeConfig, tls: Option<Arc<rustls::ClientConfig>>) -> Self {
        Self {
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            schema: config.schema.clone(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_secs),
            join_timeout: Duration::from_secs(config.join_timeout_secs),
            tls,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
    #[serde(default)]
    join_ref: Option<String>,
}

struct Joined {
    id: ChannelId,
    key: ChannelKey,
    join_ref: String,
    events: EventSender,
}

struct Inner {
    settings: PhoenixSettings,
    ws_url: String,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    channels: Mutex<HashMap<String, Joined>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    status: Mutex<ConnectionStatus>,
    access_token: RwLock<String>,
    refs: AtomicU64,
    next_channel: AtomicU64,
    // Bumped on every (re)connect; background tasks of older connections exit.
    generation: AtomicU64,
}

/// Cheaply cloneable handle; clones share the connection.
#[derive(Clone)]
pub struct PhoenixTransport {
    inner: Arc<Inner>,
}

/// Convert the project url to the realtime websocket endpoint.
pub(crate) fn build_ws_url(base_url: &str, api_key: &str) -> Result<String, RealtimeError> {
    let mut parsed = url::Url::parse(base_url)?;
    let scheme = match parsed.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(RealtimeError::Transport(format!("Unsupported url scheme: {}", other))),
    };
    parsed
        .set_scheme(scheme)
        .map_err(|_| RealtimeError::Transport("Failed to set websocket scheme".to_string()))?;

    let mut path = parsed.path().to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    path.push_str("realtime/v1/websocket");
    parsed.set_path(&path);
    parsed
        .query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", VSN);
    Ok(parsed.to_string())
}

fn join_payload(key: &ChannelKey, schema: &str, access_token: &str) -> Value {
    let mut binding = json!({ "event": "*", "schema": schema, "table": key.table });
    if let Some(filter) = &key.filter {
        binding["filter"] = Value::String(filter.clone());
    }
    json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": [binding],
            "private": false
        },
        "access_token": access_token
    })
}

/// Map a refused join to the error taxonomy; token problems are auth errors.
fn join_error(key: &ChannelKey, payload: &Value) -> RealtimeError {
    let reason = payload
        .get("response")
        .and_then(|r| r.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let lowered = reason.to_lowercase();
    if lowered.contains("expired") {
        RealtimeError::TokenExpired
    } else if lowered.contains("jwt") || lowered.contains("unauthorized") || lowered.contains("token") {
        RealtimeError::Auth(reason)
    } else {
        RealtimeError::ChannelOpen { key: key.to_string(), reason }
    }
}

fn heartbeat_acknowledged(reply: &mut oneshot::Receiver<Value>) -> bool {
    reply.try_recv().is_ok()
}

fn handshake_error(e: tokio_tungstenite::tungstenite::Error) -> RealtimeError {
    match e {
        tokio_tungstenite::tungstenite::Error::Http(response) => RealtimeError::Http {
            status: response.status().as_u16(),
            message: response.status().canonical_reason().unwrap_or("handshake refused").to_string(),
        },
        other => RealtimeError::WebSocket(other),
    }
}

impl PhoenixTransport {
    pub fn new(settings: PhoenixSettings) -> Result<Self, RealtimeError> {
        if settings.api_key.is_empty() {
            return Err(RealtimeError::Transport("API key must not be empty".to_string()));
        }
        let ws_url = build_ws_url(&settings.url, &settings.api_key)?;
        let access_token = settings.api_key.clone();
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                ws_url,
                writer: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                status: Mutex::new(ConnectionStatus::Disconnected),
                access_token: RwLock::new(access_token),
                refs: AtomicU64::new(1),
                next_channel: AtomicU64::new(1),
                generation: AtomicU64::new(0),
            }),
        })
    }

    /// Open the websocket and start the reader and heartbeat tasks.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        Inner::connect(&self.inner).await
    }

    pub fn joined_channels(&self) -> usize {
        self.inner.channels.lock().len()
    }
}

impl Inner {
    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    async fn connect(inner: &Arc<Inner>) -> Result<(), RealtimeError> {
        inner.set_status(ConnectionStatus::Connecting);
        let connector = inner.settings.tls.clone().map(Connector::Rustls);
        info!("Connecting to realtime endpoint {}", inner.settings.url);

        let ws = match connect_async_tls_with_config(inner.ws_url.as_str(), None, false, connector).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                inner.set_status(ConnectionStatus::Disconnected);
                return Err(handshake_error(e));
            }
        };
        let (write, read) = ws.split();
        *inner.writer.lock().await = Some(write);

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.set_status(ConnectionStatus::Connected);

        let reader = Arc::clone(inner);
        let read_task = tokio::spawn(async move { reader.read_loop(read, generation).await });
        *inner.reader.lock() = Some(read_task);
        let heartbeat = Arc::clone(inner);
        tokio::spawn(async move { heartbeat.heartbeat_loop(generation).await });

        info!("Realtime connection established");
        Ok(())
    }

    async fn send(&self, msg: PhoenixMessage) -> Result<(), RealtimeError> {
        let text = serde_json::to_string(&msg)?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(RealtimeError::ConnectionClosed)?;
        trace!("Sending {} on {}", msg.event, msg.topic);
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut read: WsRead, generation: u64) {
        while let Some(msg) = read.next().await {
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match msg {
                Ok(Message::Text(txt)) => self.handle_text(txt.as_str()),
                Ok(Message::Close(_)) => {
                    info!("Realtime connection closed by server");
                    break;
                }
                Ok(_) => {} // ping/pong/binary
                Err(e) => {
                    warn!("Realtime websocket error: {}", e);
                    break;
                }
            }
        }

        if self.generation.load(Ordering::SeqCst) == generation {
            self.set_status(ConnectionStatus::Disconnected);
            // Waiting joins fail fast instead of running into their timeout.
            self.pending.lock().clear();
        }
    }

    /// Each heartbeat must be answered before the next one is due. A silent
    /// server (half-open socket) otherwise keeps the connection looking alive.
    async fn heartbeat_loop(self: Arc<Self>, generation: u64) {
        let mut interval = tokio::time::interval(self.settings.heartbeat_interval);
        interval.tick().await;
        let mut awaiting: Option<oneshot::Receiver<Value>> = None;
        loop {
            interval.tick().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                break;
            }
            if let Some(mut reply) = awaiting.take() {
                if !heartbeat_acknowledged(&mut reply) {
                    warn!("Heartbeat unanswered for {:?}, dropping connection", self.settings.heartbeat_interval);
                    self.connection_lost(generation).await;
                    break;
                }
            }
            let (beat, reply) = self.begin_heartbeat();
            if let Err(e) = self.send(beat).await {
                warn!("Heartbeat failed: {}", e);
                self.connection_lost(generation).await;
                break;
            }
            awaiting = Some(reply);
        }
    }

    fn begin_heartbeat(&self) -> (PhoenixMessage, oneshot::Receiver<Value>) {
        let msg_ref = self.next_ref();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(msg_ref.clone(), tx);
        let beat = PhoenixMessage {
            topic: PHOENIX_TOPIC.to_string(),
            event: events::HEARTBEAT.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref),
            join_ref: None,
        };
        (beat, rx)
    }

    /// Tear down connection `generation` unless a newer one replaced it. The
    /// channels go with it; their forwarders see the senders dropped.
    async fn connection_lost(&self, generation: u64) {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.set_status(ConnectionStatus::Disconnected);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.writer.lock().await.take();
        self.pending.lock().clear();
        self.channels.lock().clear();
    }

    fn handle_text(&self, text: &str) {
        let msg: PhoenixMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Realtime: failed to parse message: {}", e);
                return;
            }
        };

        match msg.event.as_str() {
            events::REPLY => {
                let waiter = msg.msg_ref.as_ref().and_then(|r| self.pending.lock().remove(r));
                if let Some(tx) = waiter {
                    let _ = tx.send(msg.payload);
                }
            }
            events::POSTGRES_CHANGES => {
                let data = msg.payload.get("data").cloned().unwrap_or(Value::Null);
                let event: ChangeEvent = match serde_json::from_value(data) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Realtime: malformed change on {}: {}", msg.topic, e);
                        return;
                    }
                };
                let channels = self.channels.lock();
                if let Some(joined) = channels.get(&msg.topic) {
                    if joined.events.send(event).is_err() {
                        debug!("Channel {} has no listener", joined.id);
                    }
                }
            }
            events::ERROR | events::CLOSE => {
                // Dropping the sender ends the channel's forwarder.
                if let Some(joined) = self.channels.lock().remove(&msg.topic) {
                    warn!("Channel {} for {} closed by server ({})", joined.id, joined.key, msg.event);
                }
            }
            events::SYSTEM => debug!("System message on {}: {}", msg.topic, msg.payload),
            other => trace!("Ignoring {} on {}", other, msg.topic),
        }
    }

    fn topic_of(&self, id: ChannelId) -> Option<String> {
        self.channels
            .lock()
            .iter()
            .find(|(_, joined)| joined.id == id)
            .map(|(topic, _)| topic.clone())
    }
}

#[async_trait]
impl RealtimeTransport for PhoenixTransport {
    async fn open(&self, key: &ChannelKey, events: EventSender) -> Result<ChannelId, RealtimeError> {
        let inner = &self.inner;
        if inner.writer.lock().await.is_none() {
            Inner::connect(inner).await?;
        }

        let id = ChannelId(inner.next_channel.fetch_add(1, Ordering::Relaxed));
        let topic = format!("realtime:{}:{}", key.table, id.0);
        let join_ref = inner.next_ref();
        let token = inner.access_token.read().clone();

        let (reply_tx, reply_rx) = oneshot::channel();
        inner.pending.lock().insert(join_ref.clone(), reply_tx);
        inner.channels.lock().insert(
            topic.clone(),
            Joined { id, key: key.clone(), join_ref: join_ref.clone(), events },
        );

        let join = PhoenixMessage {
            topic: topic.clone(),
            event: events::JOIN.to_string(),
            payload: join_payload(key, &inner.settings.schema, &token),
            msg_ref: Some(join_ref.clone()),
            join_ref: Some(join_ref.clone()),
        };
        if let Err(e) = inner.send(join).await {
            inner.pending.lock().remove(&join_ref);
            inner.channels.lock().remove(&topic);
            return Err(e);
        }

        let outcome = tokio::time::timeout(inner.settings.join_timeout, reply_rx).await;
        let failure = match outcome {
            Ok(Ok(payload)) => {
                if payload.get("status").and_then(Value::as_str) == Some("ok") {
                    info!("Joined {} as channel {}", key, id);
                    return Ok(id);
                }
                join_error(key, &payload)
            }
            Ok(Err(_)) => RealtimeError::ConnectionClosed,
            Err(_) => {
                inner.pending.lock().remove(&join_ref);
                RealtimeError::Timeout(inner.settings.join_timeout)
            }
        };
        inner.channels.lock().remove(&topic);
        Err(failure)
    }

    async fn close(&self, id: ChannelId) -> Result<(), RealtimeError> {
        let inner = &self.inner;
        let Some(topic) = inner.topic_of(id) else {
            return Ok(());
        };
        let Some(joined) = inner.channels.lock().remove(&topic) else {
            return Ok(());
        };
        let leave = PhoenixMessage {
            topic,
            event: events::LEAVE.to_string(),
            payload: json!({}),
            msg_ref: Some(inner.next_ref()),
            join_ref: Some(joined.join_ref),
        };
        match inner.send(leave).await {
            Ok(()) => {
                info!("Left channel {} for {}", id, joined.key);
                Ok(())
            }
            // Nothing to leave once the socket is gone.
            Err(RealtimeError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.inner.status.lock()
    }

    async fn reconnect(&self) -> Result<(), RealtimeError> {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = inner.reader.lock().take() {
            reader.abort();
        }
        if let Some(mut old) = inner.writer.lock().await.take() {
            let _ = old.send(Message::Close(None)).await;
        }
        inner.channels.lock().clear();
        inner.pending.lock().clear();
        Inner::connect(inner).await
    }

    async fn set_access_token(&self, token: &str) -> Result<(), RealtimeError> {
        let inner = &self.inner;
        *inner.access_token.write() = token.to_string();

        let joined: Vec<(String, String)> = inner
            .channels
            .lock()
            .iter()
            .map(|(topic, j)| (topic.clone(), j.join_ref.clone()))
            .collect();
        for (topic, join_ref) in joined {
            let msg = PhoenixMessage {
                topic,
                event: events::ACCESS_TOKEN.to_string(),
                payload: json!({ "access_token": token }),
                msg_ref: Some(inner.next_ref()),
                join_ref: Some(join_ref),
            };
            inner.send(msg).await?;
        }
        Ok(())
    }
}
