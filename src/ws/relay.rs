//! Fallback transport: the channel relay.
//!
//! Clients send `{"type":"subscribe","channel":..}` per category and receive
//! `{"type":"update","channel":..,"data":{..}}` frames. Data is always JSON
//! and is handed to the decoder's tolerant path.
//!
//! Pool progress is published per pool on `pool:<id>:progress`. While any
//! pool is watched the client subscribes to those channels; with none
//! watched it takes the aggregate progress channel instead.

use crate::decode::RawPayload;
use crate::events::EventCategory;
use crate::transport::{Transport, TransportEvent};
use crate::ws::{self, Session, TransportError, WsReader};
use async_trait::async_trait;
use dashmap::DashSet;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame<'a> {
    Subscribe { channel: &'a str },
    Unsubscribe { channel: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Update {
        channel: String,
        #[serde(default)]
        data: Value,
    },
    Subscribed {
        #[serde(default)]
        channel: Option<String>,
    },
    Error {
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        message: String,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

pub struct RelayClient {
    url: String,
    connect_timeout: Duration,
    ping_interval: Duration,
    session: Mutex<Option<Session>>,
    subscribed: Arc<DashSet<EventCategory>>,
    /// Watched pools. Survives reconnects.
    pools: DashSet<String>,
}

impl RelayClient {
    pub fn new(url: impl Into<String>, connect_timeout: Duration, ping_interval: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            ping_interval,
            session: Mutex::new(None),
            subscribed: Arc::new(DashSet::new()),
            pools: DashSet::new(),
        }
    }

    /// Best-effort frame for changes outside a subscribe call.
    fn send_or_log(&self, frame: &ClientFrame<'_>) {
        if let Err(e) = self.send_frame(frame) {
            debug!(frame = ?frame, error = %e, "relay frame not sent");
        }
    }

    fn progress_live(&self) -> bool {
        self.subscribed.contains(&EventCategory::PoolProgress)
    }

    fn send_frame(&self, frame: &ClientFrame<'_>) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        match self.session.lock().as_ref() {
            Some(session) => session.send(text),
            None => Err(TransportError::NotConnected),
        }
    }
}

#[async_trait]
impl Transport for RelayClient {
    fn name(&self) -> &'static str {
        "relay"
    }

    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        info!(url = %self.url, "connecting to relay");
        let subscribed = self.subscribed.clone();
        let session = ws::open(&self.url, self.connect_timeout, self.ping_interval, |read| {
            tokio::spawn(run_reader(read, subscribed, events))
        })
        .await?;

        self.subscribed.clear();
        if let Some(stale) = self.session.lock().replace(session) {
            stale.close();
        }
        info!("relay connected");
        Ok(())
    }

    async fn subscribe(&self, categories: &[EventCategory]) -> Result<(), TransportError> {
        for category in categories {
            for channel in channels_for(*category, &self.pools) {
                self.send_frame(&ClientFrame::Subscribe { channel: &channel })?;
            }
            self.subscribed.insert(*category);
        }
        info!(channels = categories.len(), "subscribed to relay channels");
        Ok(())
    }

    fn unsubscribe(&self, category: EventCategory) {
        if self.subscribed.remove(&category).is_none() {
            return;
        }
        for channel in channels_for(category, &self.pools) {
            self.send_or_log(&ClientFrame::Unsubscribe { channel: &channel });
        }
    }

    fn watch_pool(&self, pool_id: &str) {
        let was_empty = self.pools.is_empty();
        if !self.pools.insert(pool_id.to_string()) || !self.progress_live() {
            return;
        }
        let channel = EventCategory::pool_progress_channel(pool_id);
        self.send_or_log(&ClientFrame::Subscribe { channel: &channel });
        if was_empty {
            self.send_or_log(&ClientFrame::Unsubscribe {
                channel: EventCategory::PoolProgress.relay_channel(),
            });
        }
    }

    fn unwatch_pool(&self, pool_id: &str) {
        if self.pools.remove(pool_id).is_none() || !self.progress_live() {
            return;
        }
        let channel = EventCategory::pool_progress_channel(pool_id);
        self.send_or_log(&ClientFrame::Unsubscribe { channel: &channel });
        if self.pools.is_empty() {
            self.send_or_log(&ClientFrame::Subscribe {
                channel: EventCategory::PoolProgress.relay_channel(),
            });
        }
    }

    async fn disconnect(&self) {
        if let Some(session) = self.session.lock().take() {
            session.close();
            info!("relay disconnected");
        }
        self.subscribed.clear();
    }
}

/// Relay channels carrying `category`, given the watched pools.
fn channels_for(category: EventCategory, pools: &DashSet<String>) -> Vec<String> {
    if category == EventCategory::PoolProgress && !pools.is_empty() {
        let mut channels: Vec<String> = pools
            .iter()
            .map(|id| EventCategory::pool_progress_channel(id.key()))
            .collect();
        channels.sort();
        return channels;
    }
    vec![category.relay_channel().to_string()]
}

async fn run_reader(
    mut read: WsReader,
    subscribed: Arc<DashSet<EventCategory>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => handle_text(&text, &subscribed, &events),
            other => {
                if let Some(reason) = ws::close_reason(other) {
                    break reason;
                }
            }
        }
    };

    warn!(reason = %reason, "relay closed");
    let _ = events.send(TransportEvent::Closed { reason });
}

fn handle_text(
    text: &str,
    subscribed: &DashSet<EventCategory>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "unparseable relay frame");
            return;
        }
    };

    match frame {
        ServerFrame::Update { channel, data } => {
            let Some(category) = EventCategory::from_channel(&channel) else {
                debug!(channel = %channel, "update on unknown channel");
                return;
            };
            if !subscribed.contains(&category) {
                debug!(channel = %channel, "update on channel we are not subscribed to");
                return;
            }
            let _ = events.send(TransportEvent::Data {
                category,
                payload: RawPayload::Object(data),
            });
        }
        ServerFrame::Error { channel, message } => {
            match channel.as_deref().and_then(EventCategory::from_channel) {
                Some(category) => {
                    let _ = events.send(TransportEvent::Error { category, message });
                }
                None => warn!(channel = ?channel, message = %message, "relay error"),
            }
        }
        ServerFrame::Subscribed { channel } => debug!(channel = ?channel, "relay confirmed subscription"),
        ServerFrame::Pong => {}
        ServerFrame::Unknown => debug!("unhandled relay frame"),
    }
}
