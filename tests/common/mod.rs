//! Shared mock servers for integration testing.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

/// Reserve a local port that nothing listens on (connections are refused).
#[allow(dead_code)]
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Start a mock backend that returns a fixed JSON body.
#[allow(dead_code)]
pub async fn start_mock_backend(addr: SocketAddr, response: &'static str) -> SocketAddr {
    start_programmable_backend(addr, move || async move { (200, response.to_string()) }).await
}

/// Start a programmable mock backend. `f` is invoked once per request and
/// answers with a status and a body. Returns the bound address.
#[allow(dead_code)]
pub async fn start_programmable_backend<F, Fut>(addr: SocketAddr, f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await.unwrap();
    let bound = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        if read_request(&mut socket).await.is_none() {
                            return;
                        }
                        let (status, body) = f().await;
                        let status_text = match status {
                            200 => "200 OK",
                            201 => "201 Created",
                            404 => "404 Not Found",
                            422 => "422 Unprocessable Entity",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response_str = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    bound
}

/// Consume one HTTP request (headers and `Content-Length` body). Returns the
/// request line.
async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    head.lines().next().map(str::to_string)
}

/// Mock realtime server speaking the `auth` / `ping` envelope protocol.
#[allow(dead_code)]
pub struct MockRealtimeServer {
    pub addr: SocketAddr,
    /// Application frames received from clients, in arrival order.
    pub received: mpsc::UnboundedReceiver<String>,
    push: broadcast::Sender<ServerCommand>,
    accepting: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

#[derive(Clone, Debug)]
enum ServerCommand {
    Push(String),
    DropAll,
}

#[allow(dead_code)]
impl MockRealtimeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel(64);
        let accepting = Arc::new(AtomicBool::new(true));
        let connections = Arc::new(AtomicUsize::new(0));

        let push_tx = push.clone();
        let accepting_flag = accepting.clone();
        let counter = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                if !accepting_flag.load(Ordering::SeqCst) {
                    drop(socket);
                    continue;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(socket, received_tx.clone(), push_tx.subscribe()));
            }
        });

        Self {
            addr,
            received,
            push,
            accepting,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send an application frame to every authenticated client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.push.send(ServerCommand::Push(text.into()));
    }

    /// Close every open connection.
    pub fn drop_connections(&self) {
        let _ = self.push.send(ServerCommand::DropAll);
    }

    /// While false, new TCP connections are closed before the upgrade.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Authenticated-or-not connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Next received application frame, or `None` after `limit`.
    pub async fn next_received(&mut self, limit: Duration) -> Option<String> {
        tokio::time::timeout(limit, self.received.recv()).await.ok().flatten()
    }
}

async fn serve_connection(
    socket: TcpStream,
    received: mpsc::UnboundedSender<String>,
    mut commands: broadcast::Receiver<ServerCommand>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else { return };

    // Handshake: first frame must be an auth envelope with a token
    let authed = match ws.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<serde_json::Value>(text.as_str())
            .ok()
            .filter(|v| v["type"] == "auth")
            .and_then(|v| v["payload"]["token"].as_str().map(|t| !t.is_empty()))
            .unwrap_or(false),
        _ => false,
    };
    let reply = if authed {
        r#"{"type":"auth_ok","payload":null}"#
    } else {
        r#"{"type":"auth_error","payload":{"reason":"invalid token"}}"#
    };
    if ws.send(Message::text(reply)).await.is_err() || !authed {
        let _ = ws.close(None).await;
        return;
    }

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str().to_owned();
                    let kind = serde_json::from_str::<serde_json::Value>(&text)
                        .ok()
                        .and_then(|v| v["type"].as_str().map(str::to_string));
                    match kind.as_deref() {
                        Some("ping") => {
                            if ws.send(Message::text(r#"{"type":"pong","payload":null}"#)).await.is_err() {
                                break;
                            }
                        }
                        Some("pong") => {}
                        _ => {
                            let _ = received.send(text);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(ServerCommand::Push(text)) => {
                    if ws.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(ServerCommand::DropAll) | Err(broadcast::error::RecvError::Closed) => {
                    let _ = ws.close(None).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}
