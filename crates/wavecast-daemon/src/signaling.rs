//! Signaling client
//!
//! Owns one WebSocket to the signaling server. Inbound envelopes are parsed on
//! a reader task and posted to the orchestrator tagged with the connection's
//! epoch, so events from a replaced connection can be told apart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use wavecast_core::SessionError;
use wavecast_signal::SignalMessage;

#[derive(Debug)]
pub enum SignalingEvent {
    Message(SignalMessage),
    /// Socket closed or failed after the handshake
    Closed,
}

#[derive(Debug)]
pub struct SignalingEnvelope {
    pub epoch: u64,
    pub event: SignalingEvent,
}

pub type SignalingEvents = mpsc::UnboundedSender<SignalingEnvelope>;

fn unreachable(url: &str) -> SessionError {
    SessionError::SignalingUnavailable(format!("Unable to reach signaling server at {}.", url))
}

fn refused(url: &str) -> SessionError {
    SessionError::SignalingUnavailable(format!(
        "Signaling server at {} closed the socket.",
        url
    ))
}

/// One open signaling connection
pub struct SignalingClient {
    url: String,
    epoch: u64,
    outbox: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    /// Open the socket, failing if it does not complete the handshake in time
    pub async fn connect(
        url: &str,
        epoch: u64,
        connect_timeout: Duration,
        events: SignalingEvents,
    ) -> Result<Self, SessionError> {
        let parsed = Url::parse(url).map_err(|_| unreachable(url))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(unreachable(url));
        }

        debug!("Connecting to signaling server: {}", parsed);

        let ws = match timeout(connect_timeout, connect_async(parsed.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(
                tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(_),
            )) => return Err(refused(url)),
            Ok(Err(e)) => {
                debug!("Signaling connect failed: {}", e);
                return Err(unreachable(url));
            }
            Err(_) => return Err(unreachable(url)),
        };

        info!("Connected to signaling server {}", url);

        let (mut sink, mut stream) = ws.split();
        let (outbox, mut outgoing) = mpsc::unbounded_channel::<Message>();
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(msg) = outgoing.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!("Signaling send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_open = open.clone();
        let reader = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match SignalMessage::parse(&text) {
                        Ok(msg) => {
                            let _ = events.send(SignalingEnvelope {
                                epoch,
                                event: SignalingEvent::Message(msg),
                            });
                        }
                        Err(e) => debug!("Ignoring signaling frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Signaling socket error: {}", e);
                        break;
                    }
                    // Ping/pong is answered by tungstenite
                    Some(Ok(_)) => continue,
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = events.send(SignalingEnvelope {
                epoch,
                event: SignalingEvent::Closed,
            });
        });

        Ok(Self {
            url: url.to_string(),
            epoch,
            outbox,
            open,
            reader,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queue a message; dropped with a debug log if the socket is gone
    pub fn send(&self, msg: &SignalMessage) {
        if !self.is_open() {
            debug!("Signaling closed, dropping {}", msg.kind());
            return;
        }
        match msg.to_json() {
            Ok(json) => {
                let _ = self.outbox.send(Message::Text(json));
            }
            Err(e) => warn!("Failed to encode {}: {}", msg.kind(), e),
        }
    }

    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbox.send(Message::Close(None));
        }
        self.reader.abort();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}
