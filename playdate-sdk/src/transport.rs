//! Socket transport behind the connection manager.
//!
//! A [`Connector`] turns an endpoint URL into a [`Link`]: a pair of channels
//! carrying text frames out and [`LinkEvent`]s in. The inbound channel ending
//! means the socket is closed. Keeping the socket behind channels lets the
//! connection manager own the lifecycle without ever exposing the raw handle,
//! and lets tests substitute an in-process server.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Something that happened on the inbound side of a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Text(String),
    /// Transport error; the link closes right after.
    Error(String),
}

/// Channel pair bridging one live socket.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, anyhow::Result<Link>>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, anyhow::Result<Link>> {
        let url = url.to_string();
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            tracing::debug!("Connecting to {url}...");
            let (stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| anyhow::anyhow!("websocket connect to {url} timed out"))?
                .map_err(|e| anyhow::anyhow!("websocket connect to {url} failed: {e}"))?;
            tracing::debug!("WebSocket connected to {url}");

            let (mut sink, mut source) = stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel();

            // Outbound: frames from the manager -> socket. Ends when the
            // manager drops its sender, which closes the socket.
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::warn!("websocket write failed: {e}");
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            // Inbound: socket -> manager. Pongs are answered by tungstenite
            // while reading.
            tokio::spawn(async move {
                while let Some(msg) = source.next().await {
                    let event = match msg {
                        Ok(Message::Text(text)) => LinkEvent::Text(text),
                        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                            Ok(text) => LinkEvent::Text(text),
                            Err(_) => {
                                tracing::warn!("dropping non-UTF-8 binary frame");
                                continue;
                            }
                        },
                        Ok(Message::Close(frame)) => {
                            tracing::debug!(?frame, "websocket closed by server");
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            let _ = in_tx.send(LinkEvent::Error(e.to_string()));
                            break;
                        }
                    };
                    if in_tx.send(event).is_err() {
                        break;
                    }
                }
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
