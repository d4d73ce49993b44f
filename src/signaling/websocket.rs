//! WebSocket signaling transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::SignalMessage;
use super::SignalingTransport;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Capacity of the inbound message channel handed to the manager.
const INBOUND_CAPACITY: usize = 256;

/// Signaling bus over a WebSocket relay.
///
/// The relay is assumed to route messages by peer identity; this client only
/// frames [`SignalMessage`] values as JSON text in both directions.
pub struct WsSignaling {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
}

impl WsSignaling {
    /// Connect to the signaling relay.
    ///
    /// Returns the transport handle plus the receiver of inbound messages.
    /// Both background tasks stop and `is_connected` flips false when the
    /// socket errors or closes.
    pub async fn connect(url: &str) -> Result<(Arc<Self>, mpsc::Receiver<SignalMessage>)> {
        info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling relay");

        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::sender_task(write, outbound_rx, connected.clone()));
        tokio::spawn(Self::receiver_task(read, inbound_tx, connected.clone()));

        let transport = Arc::new(Self {
            url: url.to_string(),
            outbound: outbound_tx,
            connected,
        });

        Ok((transport, inbound_rx))
    }

    /// Relay URL this transport was connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sender task: drains queued frames into the WebSocket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        connected: Arc<AtomicBool>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket frame: {}", e);
                break;
            }
        }

        connected.store(false, Ordering::SeqCst);
        debug!("Signaling sender task terminated");
    }

    /// Receiver task: decodes inbound frames and forwards them to the manager
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        inbound: mpsc::Sender<SignalMessage>,
        connected: Arc<AtomicBool>,
    ) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                    Ok(message) => {
                        if inbound.send(message).await.is_err() {
                            debug!("Inbound receiver dropped, stopping signaling reads");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Ignoring malformed signaling frame: {}", e);
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("Signaling connection closed by relay");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        connected.store(false, Ordering::SeqCst);
        debug!("Signaling receiver task terminated");
    }
}

#[async_trait]
impl SignalingTransport for WsSignaling {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: SignalMessage) -> Result<()> {
        let json = message.to_json()?;
        debug!(kind = message.kind_name(), "Sending signaling message");

        self.outbound
            .send(Message::Text(json))
            .map_err(|e| Error::SignalingError(format!("Failed to queue message: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens on this port; connect must fail cleanly.
        let result = WsSignaling::connect("ws://127.0.0.1:1").await;
        assert!(matches!(result, Err(Error::WebSocketError(_))));
    }
}
