//! Signalling server connection
//!
//! A WebSocket client speaking the JSON signalling protocol. `identify` and
//! `ping` are answered here; every other server message is handed to the
//! streamer. The connection is closed when the streamer drops its
//! [`SignallingConnection`] or the server goes away.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::signaling::{ClientMessage, ServerMessage};
use crate::config::SignallingConfig;
use crate::error::{AppError, Result};

/// Buffered server messages before the reader waits for the streamer
const INBOUND_CAPACITY: usize = 64;

/// Handle for sending to the signalling server
#[derive(Debug, Clone)]
pub struct SignallingSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignallingSender {
    /// Queue a message. Sends after the connection is gone are dropped.
    pub fn send(&self, message: ClientMessage) {
        if self.tx.send(message).is_err() {
            debug!("Signalling connection closed, dropping outgoing message");
        }
    }

    /// Sender whose messages land in a test channel
    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// A live signalling connection
pub struct SignallingConnection {
    sender: SignallingSender,
    inbound: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
}

impl SignallingConnection {
    /// Connect and start the reader and writer tasks on the current runtime
    pub async fn connect(config: &SignallingConfig) -> Result<Self> {
        info!("Connecting to signalling server {}", config.url);
        let (stream, _) = tokio_tungstenite::connect_async(config.url.as_str())
            .await
            .map_err(|e| AppError::Signalling(format!("connect to {} failed: {}", config.url, e)))?;
        info!("Connected to signalling server {}", config.url);

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        let keepalive = (config.keepalive_interval_secs > 0)
            .then(|| Duration::from_secs(config.keepalive_interval_secs));

        // Writer: outgoing queue plus keep-alive pings
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ping = tokio::time::interval(keepalive.unwrap_or(Duration::from_secs(3600)));
            ping.tick().await;
            loop {
                let message = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    _ = ping.tick(), if keepalive.is_some() => ClientMessage::Ping {
                        time: chrono::Utc::now().timestamp(),
                    },
                    msg = out_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize signalling message: {}", e);
                        continue;
                    }
                };
                trace!("-> signalling: {}", text);
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Signalling send failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
            writer_cancel.cancel();
            debug!("Signalling writer stopped");
        });

        // Reader: parse, answer identify/ping, forward the rest
        let reader_cancel = cancel.clone();
        let reply = out_tx.clone();
        let streamer_id = config.streamer_id.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = source.next() => frame,
                };
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Ignoring non-UTF-8 signalling frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("Signalling server closed the connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Signalling connection error: {}", e);
                        break;
                    }
                    None => break,
                };

                trace!("<- signalling: {}", text);
                let message: ServerMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Failed to parse signalling message: {} ({})", e, text);
                        continue;
                    }
                };

                match message {
                    ServerMessage::Identify => {
                        debug!("Identifying as {}", streamer_id);
                        let _ = reply.send(ClientMessage::EndpointId {
                            id: streamer_id.clone(),
                        });
                    }
                    ServerMessage::Ping { time } => {
                        let _ = reply.send(ClientMessage::Pong {
                            time: time.unwrap_or_else(|| chrono::Utc::now().timestamp()),
                        });
                    }
                    ServerMessage::Pong { .. } | ServerMessage::Unknown => {}
                    other => {
                        if in_tx.send(other).await.is_err() {
                            break;
                        }
                    }
                }
            }
            reader_cancel.cancel();
            debug!("Signalling reader stopped");
        });

        Ok(Self {
            sender: SignallingSender { tx: out_tx },
            inbound: in_rx,
            cancel,
        })
    }

    pub fn sender(&self) -> SignallingSender {
        self.sender.clone()
    }

    /// Next server message; `None` once the connection is lost
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SignallingConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
