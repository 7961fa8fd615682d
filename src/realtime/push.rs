//! Push channel seam and its WebSocket implementation.
//!
//! DESIGN
//! ======
//! A connected channel is a pair of text-frame queues. [`WsConnector`] spawns
//! one pump task per socket that forwards outbound directives to the sink and
//! inbound text frames to the transport. The pump ends when either side goes
//! away: dropping the outbound sender closes the socket, and a socket close
//! drops the inbound sender so the transport's reader observes `None`.

#[cfg(test)]
#[path = "push_test.rs"]
mod push_test;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::types::TransportError;

/// Both directions of an established push connection.
#[derive(Debug)]
pub struct PushChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens push connections for a session.
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TransportError`] when the connection cannot be established.
    async fn connect(&self, session_id: &str) -> Result<PushChannel, TransportError>;
}

/// [`PushConnector`] for `{apiBase}/widget/ws`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    api_base: String,
}

impl WsConnector {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self { api_base: api_base.into() }
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, session_id: &str) -> Result<PushChannel, TransportError> {
        let url = ws_url(&self.api_base, session_id)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(Box::new(e)))?;
        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = outbound_rx.recv() => {
                        let Some(text) = outgoing else {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        };
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            warn!(error = %e, "push send failed");
                            break;
                        }
                    }
                    incoming = source.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "push channel closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "push receive failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(PushChannel { outbound: outbound_tx, inbound: inbound_rx })
    }
}

/// `{apiBase}/widget/ws?session={id}` with the scheme switched to ws/wss.
///
/// # Errors
///
/// Returns [`TransportError::InvalidUrl`] for a non-http(s) base.
pub fn ws_url(api_base: &str, session_id: &str) -> Result<reqwest::Url, TransportError> {
    let base = api_base.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        return Err(TransportError::InvalidUrl(api_base.to_owned()));
    };
    let mut url = reqwest::Url::parse(&format!("{ws_base}/widget/ws"))
        .map_err(|e| TransportError::InvalidUrl(format!("{api_base}: {e}")))?;
    url.query_pairs_mut().append_pair("session", session_id);
    Ok(url)
}
