//! Primary transport: schema-id subscriptions over JSON-RPC on a WebSocket.
//!
//! `streams_subscribe` takes `{ schemaId, filters }` and answers with a
//! server subscription id. Deliveries arrive as `streams_subscription`
//! notifications carrying that id and either hex ABI data or a JSON object.

use crate::decode::RawPayload;
use crate::events::EventCategory;
use crate::transport::{Transport, TransportEvent};
use crate::ws::{self, Session, TransportError, WsReader};
use alloy::primitives::hex;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const SUBSCRIBE_METHOD: &str = "streams_subscribe";
pub const UNSUBSCRIBE_METHOD: &str = "streams_unsubscribe";
pub const NOTIFICATION_METHOD: &str = "streams_subscription";

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RpcMessage {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcError>,
    method: Option<String>,
    params: Option<NotificationParams>,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    subscription: String,
    result: Value,
}

struct PendingRequest {
    category: EventCategory,
    reply: oneshot::Sender<Result<Value, RpcError>>,
}

/// State the reader task shares with the client.
#[derive(Default)]
struct Routing {
    requests: DashMap<u64, PendingRequest>,
    /// Server subscription id to category.
    by_sub_id: DashMap<String, EventCategory>,
}

pub struct StreamClient {
    url: String,
    connect_timeout: Duration,
    subscribe_timeout: Duration,
    ping_interval: Duration,
    session: Mutex<Option<Session>>,
    routing: Arc<Routing>,
    by_category: DashMap<EventCategory, String>,
    next_id: AtomicU64,
}

impl StreamClient {
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Duration,
        subscribe_timeout: Duration,
        ping_interval: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            subscribe_timeout,
            ping_interval,
            session: Mutex::new(None),
            routing: Arc::new(Routing::default()),
            by_category: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        match self.session.lock().as_ref() {
            Some(session) => session.send(text),
            None => Err(TransportError::NotConnected),
        }
    }

    async fn subscribe_one(&self, category: EventCategory) -> Result<(), TransportError> {
        if self.by_category.contains_key(&category) {
            debug!(category = %category, "already subscribed on primary stream");
            return Ok(());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.routing
            .requests
            .insert(id, PendingRequest { category, reply });

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": SUBSCRIBE_METHOD,
            "params": { "schemaId": category.schema_id(), "filters": [] },
        });
        if let Err(e) = self.send(request.to_string()) {
            self.routing.requests.remove(&id);
            return Err(e);
        }

        let outcome = match tokio::time::timeout(self.subscribe_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(TransportError::Closed(
                    "connection dropped while subscribing".into(),
                ))
            }
            Err(_) => {
                self.routing.requests.remove(&id);
                return Err(TransportError::Timeout("subscribe", self.subscribe_timeout));
            }
        };

        match outcome {
            Ok(Value::String(sub_id)) => {
                debug!(category = %category, subscription = %sub_id, "primary subscription established");
                self.by_category.insert(category, sub_id);
                Ok(())
            }
            Ok(other) => Err(TransportError::SubscribeRejected {
                category,
                message: format!("unexpected subscribe result: {other}"),
            }),
            Err(e) => Err(TransportError::SubscribeRejected {
                category,
                message: format!("{} (code {})", e.message, e.code),
            }),
        }
    }
}

#[async_trait]
impl Transport for StreamClient {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        info!(url = %self.url, "connecting to primary event stream");
        let routing = self.routing.clone();
        let session = ws::open(&self.url, self.connect_timeout, self.ping_interval, |read| {
            tokio::spawn(run_reader(read, routing, events))
        })
        .await?;

        self.routing.requests.clear();
        self.routing.by_sub_id.clear();
        self.by_category.clear();
        if let Some(stale) = self.session.lock().replace(session) {
            stale.close();
        }
        info!("primary event stream connected");
        Ok(())
    }

    async fn subscribe(&self, categories: &[EventCategory]) -> Result<(), TransportError> {
        try_join_all(categories.iter().map(|c| self.subscribe_one(*c))).await?;
        Ok(())
    }

    fn unsubscribe(&self, category: EventCategory) {
        let Some((_, sub_id)) = self.by_category.remove(&category) else {
            return;
        };
        self.routing.by_sub_id.remove(&sub_id);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": UNSUBSCRIBE_METHOD,
            "params": [sub_id],
        });
        match self.send(request.to_string()) {
            Ok(()) => debug!(category = %category, subscription = %sub_id, "unsubscribed"),
            Err(e) => debug!(category = %category, error = %e, "unsubscribe not sent"),
        }
    }

    async fn disconnect(&self) {
        if let Some(session) = self.session.lock().take() {
            session.close();
            info!("primary event stream disconnected");
        }
        self.routing.requests.clear();
        self.routing.by_sub_id.clear();
        self.by_category.clear();
    }
}

async fn run_reader(
    mut read: WsReader,
    routing: Arc<Routing>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => handle_text(&text, &routing, &events),
            other => {
                if let Some(reason) = ws::close_reason(other) {
                    break reason;
                }
            }
        }
    };

    // Dropping the reply senders fails every in-flight subscribe.
    routing.requests.clear();
    warn!(reason = %reason, "primary event stream closed");
    let _ = events.send(TransportEvent::Closed { reason });
}

fn handle_text(text: &str, routing: &Routing, events: &mpsc::UnboundedSender<TransportEvent>) {
    let msg: RpcMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "unparseable frame on primary stream");
            return;
        }
    };

    if let Some(id) = msg.id {
        let Some((_, pending)) = routing.requests.remove(&id) else {
            debug!(id, "response for unknown or expired request");
            return;
        };
        let outcome = match (msg.error, msg.result) {
            (Some(e), _) => Err(e),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        };
        // Record the route before the caller wakes so an immediate
        // notification is not dropped.
        if let Ok(Value::String(sub_id)) = &outcome {
            routing.by_sub_id.insert(sub_id.clone(), pending.category);
        }
        let _ = pending.reply.send(outcome);
        return;
    }

    match (msg.method.as_deref(), msg.params) {
        (Some(NOTIFICATION_METHOD), Some(params)) => {
            let category = routing.by_sub_id.get(&params.subscription).map(|c| *c);
            match category {
                Some(category) => {
                    let payload = notification_payload(params.result);
                    let _ = events.send(TransportEvent::Data { category, payload });
                }
                None => debug!(subscription = %params.subscription, "notification for unknown subscription"),
            }
        }
        (method, _) => debug!(method = ?method, "ignoring frame on primary stream"),
    }
}

/// Hex strings become raw ABI bytes; anything else is passed through as JSON.
fn notification_payload(result: Value) -> RawPayload {
    if let Value::String(s) = &result {
        if let Some(digits) = s.strip_prefix("0x") {
            if let Ok(bytes) = hex::decode(digits) {
                return RawPayload::from(bytes);
            }
        }
    }
    RawPayload::Object(result)
}
