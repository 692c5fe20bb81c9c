/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Native STOMP client over `tokio-tungstenite`.
//!
//! Performs the WebSocket upgrade and the STOMP `CONNECT`/`CONNECTED`
//! handshake, then routes inbound `MESSAGE` frames to per-subscription
//! channels.
//!
//! # Example
//!
//! ```no_run
//! use roomcall_transport::native_stomp::StompClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StompClient::connect("ws://localhost:8080/ws", "localhost").await?;
//! let (_id, mut room) = client.subscribe("/topic/room/lobby").await?;
//!
//! client.send("/app/signal", r#"{"type":"JOIN_ROOM","roomId":"lobby","userId":"u1"}"#).await?;
//!
//! while let Some(body) = room.recv().await {
//!     println!("{body}");
//! }
//! # Ok(())
//! # }
//! ```

use crate::stomp::{StompCommand, StompFrame};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use url::Url;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type Subscriptions = Arc<std::sync::Mutex<HashMap<String, mpsc::Sender<String>>>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIPTION_BUFFER: usize = 100;

/// Error type for STOMP connection attempts.
#[derive(Debug, thiserror::Error)]
pub enum StompConnectError {
    #[error("invalid signaling URL '{0}'")]
    InvalidUrl(String),
    /// The server rejected the WebSocket upgrade with an HTTP error status.
    #[error("HTTP {status}: WebSocket upgrade rejected")]
    HttpError { status: u16 },
    /// The broker answered `CONNECT` with an `ERROR` frame.
    #[error("STOMP broker refused connection: {0}")]
    Rejected(String),
    #[error("timed out waiting for CONNECTED")]
    Timeout,
    #[error("STOMP connection failed: {0}")]
    Other(String),
}

impl StompConnectError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpError { status } => Some(*status),
            _ => None,
        }
    }
}

/// Error type for frames sent on an established connection.
#[derive(Debug, thiserror::Error)]
pub enum StompSendError {
    #[error("STOMP connection is closed")]
    Closed,
    #[error("WebSocket send error: {0}")]
    WebSocket(String),
}

/// Derives the STOMP `host` header from a signaling URL.
pub fn host_header(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// A STOMP 1.2 client over a native WebSocket.
///
/// Cloning is cheap; clones share the connection and its subscriptions.
#[derive(Clone)]
pub struct StompClient {
    writer: Arc<Mutex<SplitSink<WsStream, Message>>>,
    closed: Arc<AtomicBool>,
    subscriptions: Subscriptions,
    next_subscription: Arc<AtomicU64>,
}

impl std::fmt::Debug for StompClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompClient")
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl StompClient {
    /// Connects to `url` (`ws://` or `wss://`) and completes the STOMP handshake.
    pub async fn connect(url: &str, host: &str) -> Result<Self, StompConnectError> {
        let parsed = Url::parse(url).map_err(|_| StompConnectError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(StompConnectError::InvalidUrl(url.to_string()));
        }

        info!("STOMP connecting to {url}");
        let (mut ws_stream, response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| match e {
                    tokio_tungstenite::tungstenite::Error::Http(resp) => {
                        StompConnectError::HttpError {
                            status: resp.status().as_u16(),
                        }
                    }
                    other => StompConnectError::Other(format!(
                        "WebSocket connection to '{url}' failed: {other}"
                    )),
                })?;
        debug!("WebSocket connected to {url} (HTTP {})", response.status());

        ws_stream
            .send(Message::Text(StompFrame::connect(host).encode()))
            .await
            .map_err(|e| StompConnectError::Other(e.to_string()))?;

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, await_connected(&mut ws_stream)).await {
            Ok(Ok(version)) => info!("STOMP session established (version {version})"),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(StompConnectError::Timeout),
        }

        Ok(Self::setup_streams(ws_stream))
    }

    fn setup_streams(ws_stream: WsStream) -> Self {
        let (writer, reader) = ws_stream.split();
        let client = Self {
            writer: Arc::new(Mutex::new(writer)),
            closed: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_subscription: Arc::new(AtomicU64::new(0)),
        };
        tokio::spawn(read_loop(
            reader,
            client.closed.clone(),
            client.subscriptions.clone(),
        ));
        client
    }

    /// Subscribes to `destination`. Bodies of matching `MESSAGE` frames arrive
    /// on the returned receiver in broker order. The receiver ends when the
    /// connection is lost.
    pub async fn subscribe(
        &self,
        destination: &str,
    ) -> Result<(String, mpsc::Receiver<String>), StompSendError> {
        let id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        lock(&self.subscriptions).insert(id.clone(), tx);

        if let Err(e) = self
            .write(StompFrame::subscribe(&id, destination))
            .await
        {
            lock(&self.subscriptions).remove(&id);
            return Err(e);
        }
        debug!("Subscribed to {destination} as {id}");
        Ok((id, rx))
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<(), StompSendError> {
        if lock(&self.subscriptions).remove(id).is_none() {
            return Ok(());
        }
        self.write(StompFrame::unsubscribe(id)).await
    }

    /// Publishes `body` to `destination`.
    pub async fn send(&self, destination: &str, body: &str) -> Result<(), StompSendError> {
        self.write(StompFrame::send(destination, body)).await
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    /// Sends `DISCONNECT` and closes the socket. Idempotent.
    pub async fn disconnect(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        lock(&self.subscriptions).clear();

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer
            .send(Message::Text(StompFrame::disconnect().encode()))
            .await
        {
            debug!("Error sending DISCONNECT: {e}");
        }
        if let Err(e) = writer.send(Message::Close(None)).await {
            warn!("Error sending WebSocket close frame: {e}");
        }
    }

    async fn write(&self, frame: StompFrame) -> Result<(), StompSendError> {
        if !self.is_connected() {
            return Err(StompSendError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(frame.encode()))
            .await
            .map_err(|e| StompSendError::WebSocket(e.to_string()))
    }
}

fn lock(
    subscriptions: &Subscriptions,
) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<String>>> {
    subscriptions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn await_connected(ws_stream: &mut WsStream) -> Result<String, StompConnectError> {
    while let Some(msg) = ws_stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(StompConnectError::Other(e.to_string())),
        };
        let frame = match StompFrame::decode(&text) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => return Err(StompConnectError::Other(e.to_string())),
        };
        match frame.command {
            StompCommand::Connected => {
                return Ok(frame.get("version").unwrap_or("1.0").to_string());
            }
            StompCommand::Error => {
                let reason = frame
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or(frame.body);
                return Err(StompConnectError::Rejected(reason));
            }
            other => debug!("Ignoring {other} before CONNECTED"),
        }
    }
    Err(StompConnectError::Other(
        "connection closed during STOMP handshake".to_string(),
    ))
}

async fn read_loop(
    mut reader: SplitStream<WsStream>,
    closed: Arc<AtomicBool>,
    subscriptions: Subscriptions,
) {
    while let Some(msg_result) = reader.next().await {
        if closed.load(Ordering::Acquire) {
            break;
        }
        let text = match msg_result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("WebSocket received close frame");
                break;
            }
            Ok(Message::Binary(data)) => {
                debug!("Binary frame ignored ({} bytes)", data.len());
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                if !closed.load(Ordering::Acquire) {
                    error!("WebSocket read error: {e}");
                }
                break;
            }
        };

        let frame = match StompFrame::decode(&text) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                warn!("Dropping undecodable STOMP frame: {e}");
                continue;
            }
        };

        match frame.command {
            StompCommand::Message => {
                let Some(id) = frame.get("subscription").map(str::to_string) else {
                    warn!("MESSAGE frame without subscription header");
                    continue;
                };
                let sender = lock(&subscriptions).get(&id).cloned();
                match sender {
                    Some(tx) => {
                        if tx.send(frame.body).await.is_err() {
                            debug!("Subscriber for {id} went away");
                            lock(&subscriptions).remove(&id);
                        }
                    }
                    None => debug!("MESSAGE for unknown subscription {id}"),
                }
            }
            StompCommand::Error => {
                error!(
                    "STOMP broker error: {}",
                    frame.get("message").unwrap_or(frame.body.as_str())
                );
                break;
            }
            StompCommand::Receipt => debug!("RECEIPT {:?}", frame.get("receipt-id")),
            other => debug!("Ignoring unexpected {other} frame"),
        }
    }

    closed.store(true, Ordering::Release);
    lock(&subscriptions).clear();
    debug!("STOMP inbound reader loop ended");
}
