//! WebSocket transports: the JSON-RPC schema stream and the channel relay.
//!
//! Both clients share the connection plumbing here: a split socket, a
//! writer task that owns the sink and keeps the connection alive with
//! pings, and an outbound queue callers push frames into.

pub mod relay;
pub mod stream;

pub use relay::RelayClient;
pub use stream::StreamClient;

use crate::events::EventCategory;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("websocket connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("transport is not connected")]
    NotConnected,
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("subscription to {category} rejected: {message}")]
    SubscribeRejected {
        category: EventCategory,
        message: String,
    },
    #[error("no fallback transport is configured")]
    FallbackUnavailable,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsReader = SplitStream<Socket>;
type WsWriter = SplitSink<Socket, Message>;

/// One open connection: the outbound queue plus the two tasks serving it.
pub(crate) struct Session {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    pub(crate) fn send(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed("writer task has exited".into()))
    }

    /// Stop reading and let the writer flush its queue and close the socket.
    pub(crate) fn close(self) {
        self.reader.abort();
        drop(self.outbound);
        // The writer exits on its own once the last sender is gone.
        drop(self.writer);
    }
}

/// Connect to `url` within `connect_timeout`, start the writer task and
/// hand the read half to `spawn_reader`.
pub(crate) async fn open<F>(
    url: &str,
    connect_timeout: Duration,
    ping_interval: Duration,
    spawn_reader: F,
) -> Result<Session, TransportError>
where
    F: FnOnce(WsReader) -> JoinHandle<()>,
{
    url::Url::parse(url)?;
    let (socket, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| TransportError::Timeout("connect", connect_timeout))??;
    let (write, read) = socket.split();

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(run_writer(write, outbound_rx, ping_interval));
    let reader = spawn_reader(read);

    Ok(Session {
        outbound,
        reader,
        writer,
    })
}

async fn run_writer(
    mut write: WsWriter,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    ping_every: Duration,
) {
    let mut ping = interval(ping_every);
    // The first tick completes immediately.
    ping.tick().await;

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write.send(msg).await {
                    warn!(error = %e, "websocket write failed");
                    return;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![])).await {
                    warn!(error = %e, "failed to send ping");
                    return;
                }
            }
        }
    }

    debug!("outbound queue closed, closing socket");
    let _ = write.close().await;
}

/// Reader loops stop on the first frame this maps to `Some`; the string
/// becomes the `Closed` reason. Pongs are answered by tungstenite itself.
pub(crate) fn close_reason(
    msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Option<String> {
    match msg {
        None => Some("stream ended".into()),
        Some(Err(e)) => Some(e.to_string()),
        Some(Ok(Message::Close(frame))) => Some(match frame {
            Some(f) => format!("close frame {}: {}", u16::from(f.code), f.reason),
            None => "close frame".into(),
        }),
        Some(Ok(_)) => None,
    }
}
