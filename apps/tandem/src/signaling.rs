use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use tandem_proto::{ClientEnvelope, ServerEnvelope};

use crate::error::SignalError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget outbound side of the signaling channel. Dropping the
/// last handle closes the channel (the writer task sends a Close frame and
/// exits, which removes any queue entry server-side).
#[derive(Clone)]
pub struct SignalingHandle {
    tx: mpsc::UnboundedSender<ClientEnvelope>,
}

impl SignalingHandle {
    pub fn send(&self, envelope: ClientEnvelope) -> Result<(), SignalError> {
        self.tx.send(envelope).map_err(|_| SignalError::Closed)
    }
}

/// Both ends of an open, handshake-complete signaling channel.
pub struct ChannelPair {
    pub handle: SignalingHandle,
    pub inbound: mpsc::UnboundedReceiver<ServerEnvelope>,
}

#[cfg(test)]
impl ChannelPair {
    /// In-memory channel: returns the pair plus the far ends, so tests can
    /// observe outbound envelopes and inject inbound ones.
    pub fn in_memory() -> (
        Self,
        mpsc::UnboundedReceiver<ClientEnvelope>,
        mpsc::UnboundedSender<ServerEnvelope>,
    ) {
        let (tx_client, rx_client) = mpsc::unbounded_channel();
        let (tx_server, rx_server) = mpsc::unbounded_channel();
        (
            Self {
                handle: SignalingHandle { tx: tx_client },
                inbound: rx_server,
            },
            rx_client,
            tx_server,
        )
    }
}

/// Seam for opening the signaling channel, so the session controller can be
/// exercised against an in-memory channel.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<ChannelPair, SignalError>;
}

/// WebSocket connector against the lobby, identity token as a query
/// credential.
pub struct WsConnector {
    pub url: String,
    pub token: String,
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<ChannelPair, SignalError> {
        let ws_url = format!("{}/ws?token={}", self.url.trim_end_matches('/'), self.token);
        let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(&ws_url)).await {
            Ok(result) => result?,
            Err(_) => return Err(SignalError::HandshakeTimeout),
        };
        let (mut sink, mut stream) = ws_stream.split();

        let (tx_client, mut rx_client) = mpsc::unbounded_channel::<ClientEnvelope>();
        let (tx_server, mut rx_server) = mpsc::unbounded_channel::<ServerEnvelope>();

        // Writer: envelopes out, then a Close frame when the handle goes.
        tokio::spawn(async move {
            while let Some(envelope) = rx_client.recv().await {
                match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        if sink.send(Message::Text(json)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!("failed to encode envelope: {err}"),
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        // Reader: decoded envelopes in, in arrival order.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerEnvelope>(text.as_str()) {
                            Ok(envelope) => {
                                if tx_server.send(envelope).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!("unparseable envelope: {err}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            debug!("signaling reader task ended");
        });

        // The server acknowledges a valid token with `connected` before
        // anything else; without it there is no channel.
        match timeout(HANDSHAKE_TIMEOUT, rx_server.recv()).await {
            Ok(Some(ServerEnvelope::Connected)) => {}
            Ok(Some(other)) => return Err(SignalError::Handshake(format!("{other:?}"))),
            Ok(None) => return Err(SignalError::ClosedDuringHandshake),
            Err(_) => return Err(SignalError::HandshakeTimeout),
        }

        Ok(ChannelPair {
            handle: SignalingHandle { tx: tx_client },
            inbound: rx_server,
        })
    }
}
