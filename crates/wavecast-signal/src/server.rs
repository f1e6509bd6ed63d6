//! WebSocket signal server implementation
//!
//! One hub task owns the [`PeerRegistry`]. Connection tasks only move frames:
//! inbound text and pongs become [`HubEvent`]s, outbound messages arrive on a
//! per-connection channel drained by a writer task.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use wavecast_core::{now_ms, SignalConfig};

use crate::registry::{Delivery, PeerRegistry};

/// Largest request head inspected before choosing HTTP or WebSocket
const MAX_REQUEST_HEAD: usize = 4096;

/// Events consumed by the hub task
#[derive(Debug)]
pub enum HubEvent {
    Connected {
        peer_id: String,
        remote_address: String,
        outbox: mpsc::UnboundedSender<Outgoing>,
    },
    Text {
        peer_id: String,
        text: String,
    },
    Pong {
        peer_id: String,
    },
    Disconnected {
        peer_id: String,
    },
    Health {
        reply: oneshot::Sender<HealthSnapshot>,
    },
    Shutdown,
}

/// Frames queued for one connection's writer
#[derive(Debug)]
pub enum Outgoing {
    Text(String),
    Ping,
    Pong(Vec<u8>),
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub connected_peers: usize,
    pub host_count: usize,
}

/// Signal server bound to a listening socket
pub struct SignalServer {
    listener: TcpListener,
    heartbeat: Duration,
}

impl SignalServer {
    /// Bind to `addr`; port 0 picks a free port
    pub async fn bind(addr: SocketAddr, heartbeat: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            heartbeat,
        })
    }

    pub async fn from_config(config: &SignalConfig) -> io::Result<Self> {
        Self::bind(
            SocketAddr::new(config.bind, config.port),
            config.heartbeat_interval(),
        )
        .await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the listener fails
    pub async fn serve(self) -> io::Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves; the registry is cleared on the way out
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let addr = self.local_addr()?;
        info!("Signal server listening on {}", addr);

        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let hub = tokio::spawn(run_hub(hub_rx, self.heartbeat));

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => break Err(e),
                    };
                    let hub_tx = hub_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, hub_tx).await {
                            debug!("Connection error from {}: {:?}", peer_addr, e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("Signal server shutting down");
                    break Ok(());
                }
            }
        };

        let _ = hub_tx.send(HubEvent::Shutdown);
        let _ = hub.await;
        result
    }
}

/// Hub loop: the only place the registry is touched
async fn run_hub(mut events: mpsc::UnboundedReceiver<HubEvent>, heartbeat: Duration) {
    let mut registry = PeerRegistry::new();
    let mut outboxes: HashMap<String, mpsc::UnboundedSender<Outgoing>> = HashMap::new();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    HubEvent::Connected { peer_id, remote_address, outbox } => {
                        outboxes.insert(peer_id.clone(), outbox);
                        let out = registry.connect(&peer_id, &remote_address, now_ms());
                        deliver(&outboxes, out);
                    }
                    HubEvent::Text { peer_id, text } => {
                        let out = registry.handle_text(&peer_id, &text, now_ms());
                        deliver(&outboxes, out);
                    }
                    HubEvent::Pong { peer_id } => registry.pong(&peer_id, now_ms()),
                    HubEvent::Disconnected { peer_id } => {
                        outboxes.remove(&peer_id);
                        let out = registry.disconnect(&peer_id, now_ms());
                        deliver(&outboxes, out);
                    }
                    HubEvent::Health { reply } => {
                        let _ = reply.send(HealthSnapshot {
                            connected_peers: registry.len(),
                            host_count: registry.host_count(),
                        });
                    }
                    HubEvent::Shutdown => break,
                }
            }
            _ = ticker.tick() => {
                let sweep = registry.sweep(now_ms());
                for peer_id in &sweep.expired {
                    warn!("Terminating unresponsive peer {}", peer_id);
                    if let Some(outbox) = outboxes.remove(peer_id) {
                        let _ = outbox.send(Outgoing::Close);
                    }
                }
                for peer_id in &sweep.ping {
                    if let Some(outbox) = outboxes.get(peer_id) {
                        let _ = outbox.send(Outgoing::Ping);
                    }
                }
                deliver(&outboxes, sweep.deliveries);
            }
        }
    }

    registry.clear();
    for (_, outbox) in outboxes.drain() {
        let _ = outbox.send(Outgoing::Close);
    }
    debug!("Signal hub stopped");
}

fn deliver(outboxes: &HashMap<String, mpsc::UnboundedSender<Outgoing>>, out: Vec<Delivery>) {
    for delivery in out {
        let Some(outbox) = outboxes.get(&delivery.to) else {
            continue;
        };
        match delivery.message.to_json() {
            Ok(json) => {
                let _ = outbox.send(Outgoing::Text(json));
            }
            Err(e) => warn!("Failed to encode {}: {}", delivery.message.kind(), e),
        }
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    hub: mpsc::UnboundedSender<HubEvent>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let head = peek_request_head(&stream).await?;
    if head.starts_with("GET ") && !is_websocket_upgrade(&head) {
        return handle_http_request(&mut stream, hub).await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let peer_id = generate_peer_id()?;
    let remote_address = display_address(peer_addr.ip());
    debug!("New connection from {} as {}", peer_addr, peer_id);

    let (outbox, mut outgoing) = mpsc::unbounded_channel();
    hub.send(HubEvent::Connected {
        peer_id: peer_id.clone(),
        remote_address,
        outbox: outbox.clone(),
    })?;

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            let result = match frame {
                Outgoing::Text(text) => ws_sender.send(Message::Text(text)).await,
                Outgoing::Ping => ws_sender.send(Message::Ping(Vec::new())).await,
                Outgoing::Pong(data) => ws_sender.send(Message::Pong(data)).await,
                Outgoing::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });
    let mut writer_done = false;

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            // Writer exits on Close (heartbeat timeout) or a dead socket
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        };
        let event = match msg {
            Some(Ok(Message::Text(text))) => HubEvent::Text {
                peer_id: peer_id.clone(),
                text,
            },
            Some(Ok(Message::Binary(data))) => HubEvent::Text {
                peer_id: peer_id.clone(),
                text: String::from_utf8_lossy(&data).into_owned(),
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = outbox.send(Outgoing::Pong(data));
                continue;
            }
            Some(Ok(Message::Pong(_))) => HubEvent::Pong {
                peer_id: peer_id.clone(),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("WebSocket error: {:?}", e);
                break;
            }
        };
        if hub.send(event).is_err() {
            break;
        }
    }

    let _ = hub.send(HubEvent::Disconnected {
        peer_id: peer_id.clone(),
    });
    drop(outbox);
    if !writer_done {
        let _ = writer.await;
    }

    debug!("Connection closed: {}", peer_id);
    Ok(())
}

/// Peek until the request head is complete (or the buffer is full)
async fn peek_request_head(stream: &TcpStream) -> io::Result<String> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    for _ in 0..200 {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(String::new());
        }
        let head = &buf[..n];
        let complete = n == buf.len() || head.windows(4).any(|w| w == b"\r\n\r\n");
        let not_http = n >= 4 && !head.starts_with(b"GET ");
        if complete || not_http {
            return Ok(String::from_utf8_lossy(head).into_owned());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let n = stream.peek(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

fn is_websocket_upgrade(head: &str) -> bool {
    head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

/// Handle an HTTP request (health check or banner)
async fn handle_http_request(
    stream: &mut TcpStream,
    hub: mpsc::UnboundedSender<HubEvent>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (content_type, body) = if path == "/health" {
        let (reply, snapshot) = oneshot::channel();
        hub.send(HubEvent::Health { reply })?;
        let snapshot = snapshot.await?;
        let body = json!({
            "status": "ok",
            "connectedPeers": snapshot.connected_peers,
            "hostCount": snapshot.host_count,
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });
        ("application/json", body.to_string())
    } else {
        (
            "text/plain; charset=utf-8",
            "Wavecast signaling server is running.\n".to_string(),
        )
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn display_address(ip: IpAddr) -> String {
    if ip.is_loopback() {
        return Ipv4Addr::LOCALHOST.to_string();
    }
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(|v4| v4.to_string())
            .unwrap_or_else(|| v6.to_string()),
        IpAddr::V4(v4) => v4.to_string(),
    }
}

/// Generate a unique peer ID
pub fn generate_peer_id() -> io::Result<String> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio_tungstenite::connect_async;

    async fn start_server(heartbeat: Duration) -> (SocketAddr, oneshot::Sender<()>) {
        let server = SignalServer::bind("127.0.0.1:0".parse().unwrap(), heartbeat)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(server.serve_until(async {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx)
    }

    type Ws = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn recv_json(ws: &mut Ws) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for message")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn recv_type(ws: &mut Ws, kind: &str) -> Value {
        loop {
            let value = recv_json(ws).await;
            if value["type"] == kind {
                return value;
            }
        }
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn test_peer_id_generation() {
        let id1 = generate_peer_id().unwrap();
        let id2 = generate_peer_id().unwrap();

        assert_eq!(id1.len(), 16); // 8 bytes = 16 hex chars
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_display_address() {
        assert_eq!(display_address("::1".parse().unwrap()), "127.0.0.1");
        assert_eq!(
            display_address("::ffff:192.168.1.20".parse().unwrap()),
            "192.168.1.20"
        );
        assert_eq!(display_address("10.0.0.3".parse().unwrap()), "10.0.0.3");
    }

    #[test]
    fn test_upgrade_detection() {
        let head = "GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(is_websocket_upgrade(head));
        assert!(!is_websocket_upgrade("GET /health HTTP/1.1\r\nHost: x\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (addr, _stop) = start_server(Duration::from_secs(30)).await;
        let url = format!("ws://{}", addr);
        let (mut host, _) = connect_async(url.as_str()).await.unwrap();
        recv_type(&mut host, "hosts-state").await;
        host.send(Message::Text(r#"{"type":"hello","role":"host"}"#.into()))
            .await
            .unwrap();
        recv_type(&mut host, "hello-ack").await;

        let response = http_get(addr, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let value: Value = serde_json::from_str(body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["connectedPeers"], 1);
        assert_eq!(value["hostCount"], 1);
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));

        let banner = http_get(addr, "/").await;
        assert!(banner.contains("signaling server is running"));
    }

    #[tokio::test]
    async fn test_end_to_end_relay() {
        let (addr, stop) = start_server(Duration::from_secs(30)).await;
        let url = format!("ws://{}", addr);

        let (mut host, _) = connect_async(url.as_str()).await.unwrap();
        let welcome = recv_type(&mut host, "welcome").await;
        let host_id = welcome["clientId"].as_str().unwrap().to_string();
        assert_eq!(welcome["remoteAddress"], "127.0.0.1");
        host.send(Message::Text(
            r#"{"type":"hello","role":"host","roomId":"lounge","name":"Speaker"}"#.into(),
        ))
        .await
        .unwrap();
        recv_type(&mut host, "hello-ack").await;

        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        let welcome = recv_type(&mut client, "welcome").await;
        let client_id = welcome["clientId"].as_str().unwrap().to_string();
        let snapshot = recv_type(&mut client, "hosts-state").await;
        assert_eq!(snapshot["hosts"][0]["id"], host_id.as_str());
        assert_eq!(snapshot["hosts"][0]["name"], "Speaker");

        let hello = format!(
            r#"{{"type":"hello","role":"client","roomId":"lounge","targetHostId":"{}"}}"#,
            host_id
        );
        client.send(Message::Text(hello)).await.unwrap();

        let joined = recv_type(&mut host, "peer-joined").await;
        assert_eq!(joined["peerId"], client_id.as_str());

        let offer = format!(
            r#"{{"type":"offer","to":"{}","sdp":{{"type":"offer","sdp":"v=0"}}}}"#,
            client_id
        );
        host.send(Message::Text(offer)).await.unwrap();
        let relayed = recv_type(&mut client, "offer").await;
        assert_eq!(relayed["from"], host_id.as_str());
        assert_eq!(relayed["sdp"]["sdp"], "v=0");

        client
            .send(Message::Text(r#"{"type":"answer","to":"nobody"}"#.into()))
            .await
            .unwrap();
        let error = recv_type(&mut client, "error").await;
        assert_eq!(error["message"], "Target \"nobody\" is not connected.");

        client.close(None).await.unwrap();
        let left = recv_type(&mut host, "peer-left").await;
        assert_eq!(left["peerId"], client_id.as_str());

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn test_silent_peer_is_dropped() {
        let (addr, _stop) = start_server(Duration::from_millis(100)).await;
        let url = format!("ws://{}", addr);

        // A raw socket that never reads never answers pings
        let (silent, _) = connect_async(url.as_str()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let response = http_get(addr, "/health").await;
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let value: Value = serde_json::from_str(body).unwrap();
        assert_eq!(value["connectedPeers"], 0);
        drop(silent);
    }
}
