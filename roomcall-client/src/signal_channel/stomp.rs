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

use super::SignalChannel;
use crate::config::CallConfig;
use crate::error::SignalChannelError;
use async_trait::async_trait;
use log::{debug, info, warn};
use roomcall_transport::{host_header, StompClient, StompSendError};
use roomcall_types::{RoomId, SignalMessage};
use tokio::sync::{mpsc, Mutex};

/// [`SignalChannel`] over a STOMP relay.
///
/// Publishes JSON signals to the configured destination and subscribes to
/// [`CallConfig::room_topic`].
pub struct StompSignalChannel {
    config: CallConfig,
    connection: Mutex<Option<Connection>>,
}

struct Connection {
    client: StompClient,
    subscriptions: Vec<String>,
}

impl StompSignalChannel {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            config: config.clone(),
            connection: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<StompClient, SignalChannelError> {
        match self.connection.lock().await.as_ref() {
            Some(conn) if conn.client.is_connected() => Ok(conn.client.clone()),
            Some(_) => Err(SignalChannelError::Closed),
            None => Err(SignalChannelError::NotConnected),
        }
    }

    fn topic(&self, room: &RoomId) -> String {
        self.config.room_topic(room)
    }
}

fn send_error(e: StompSendError) -> SignalChannelError {
    match e {
        StompSendError::Closed => SignalChannelError::Closed,
        other => SignalChannelError::Publish(other.to_string()),
    }
}

#[async_trait]
impl SignalChannel for StompSignalChannel {
    async fn connect(&self) -> Result<(), SignalChannelError> {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|conn| conn.client.is_connected()) {
            return Ok(());
        }
        let url = &self.config.signaling_url;
        let host = host_header(url).unwrap_or_else(|| "localhost".to_string());
        let client = StompClient::connect(url, &host)
            .await
            .map_err(|e| SignalChannelError::Connect(e.to_string()))?;
        info!("Signal channel connected to {url}");
        *slot = Some(Connection {
            client,
            subscriptions: Vec::new(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        room: &RoomId,
    ) -> Result<mpsc::Receiver<SignalMessage>, SignalChannelError> {
        let client = self.client().await?;
        let topic = self.topic(room);
        let (id, mut bodies) = client
            .subscribe(&topic)
            .await
            .map_err(|e| SignalChannelError::Subscribe(e.to_string()))?;
        if let Some(conn) = self.connection.lock().await.as_mut() {
            conn.subscriptions.push(id);
        }

        let (tx, rx) = mpsc::channel(self.config.inbound_buffer.max(1));
        tokio::spawn(async move {
            while let Some(body) = bodies.recv().await {
                match SignalMessage::from_json(&body) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed signal on {topic}: {e}"),
                }
            }
            debug!("Inbound signal pump for {topic} ended");
        });
        Ok(rx)
    }

    async fn publish(&self, message: &SignalMessage) -> Result<(), SignalChannelError> {
        let client = self.client().await?;
        let body = message
            .to_json()
            .map_err(|e| SignalChannelError::Publish(e.to_string()))?;
        client
            .send(&self.config.publish_destination, &body)
            .await
            .map_err(send_error)
    }

    async fn disconnect(&self) {
        let Some(conn) = self.connection.lock().await.take() else {
            return;
        };
        for id in &conn.subscriptions {
            if let Err(e) = conn.client.unsubscribe(id).await {
                debug!("UNSUBSCRIBE {id} not delivered: {e}");
                break;
            }
        }
        conn.client.disconnect().await;
        info!("Signal channel disconnected from {}", self.config.signaling_url);
    }
}
