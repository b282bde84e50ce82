//! Transport seam between relay connections and the network.
//!
//! A transport turns a relay URL into a [`RelayLink`]: a pair of text-frame channels.
//! The link is lost when `incoming` yields `None`. [`WebSocketTransport`] is the real
//! implementation; tests plug in scripted transports.

use crate::error::RelayError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// An established link to one relay.
#[derive(Debug)]
pub struct RelayLink {
    /// Frames to send to the relay
    pub outgoing: mpsc::UnboundedSender<String>,
    /// Frames received from the relay; `None` means the link is gone
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Opens links to relays.
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<RelayLink, RelayError>;
}

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl RelayTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<RelayLink, RelayError> {
        info!("Connecting to relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let url = url.to_string();

        // Pump frames both ways until either side goes away
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        let Some(text) = outgoing else {
                            let _ = sink.close().await;
                            break;
                        };
                        debug!("Sending to {}: {}", url, text);
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            warn!("WebSocket send error for {}: {}", url, e);
                            break;
                        }
                    }
                    incoming = stream.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if in_tx.send(text.as_str().to_owned()).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = sink.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) => {
                                info!("Relay {} closed connection", url);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("WebSocket error from {}: {}", url, e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("Link to {} closed", url);
        });

        Ok(RelayLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
