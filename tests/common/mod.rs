//! Shared fixtures: a scriptable fake realtime upstream and an in-process relay.

#![allow(dead_code)]

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use chief_voice_relay::config::AppConfig;
use chief_voice_relay::relay;
use chief_voice_relay::state::AppState;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const WAIT: Duration = Duration::from_secs(5);

pub type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub enum Command {
    Send(String),
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct HandshakeHeaders {
    pub authorization: Option<String>,
    pub protocol: Option<String>,
    pub path: String,
}

/// Accepts a single upstream connection and lets the test drive it.
pub struct FakeUpstream {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
    pub headers: mpsc::UnboundedReceiver<HandshakeHeaders>,
    pub received: mpsc::UnboundedReceiver<Message>,
    pub commands: mpsc::UnboundedSender<Command>,
}

impl FakeUpstream {
    pub async fn start() -> Self {
        Self::start_with_delay(Duration::ZERO).await
    }

    /// Holds the TCP connection for `delay` before answering the handshake.
    pub async fn start_with_delay(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/v1/realtime", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let (header_tx, header_rx) = mpsc::unbounded_channel();
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();

        let counter = connections.clone();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else { return };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;

            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok()).map(String::from);
                let _ = header_tx.send(HandshakeHeaders {
                    authorization: header("authorization"),
                    protocol: header("openai-beta"),
                    path: req.uri().to_string(),
                });
                Ok(resp)
            };
            let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else { return };
            let (mut sink, mut source) = socket.split();

            loop {
                tokio::select! {
                    incoming = source.next() => match incoming {
                        Some(Ok(message)) => {
                            let closing = message.is_close();
                            let _ = received_tx.send(message);
                            if closing {
                                break;
                            }
                        }
                        _ => break,
                    },
                    command = command_rx.recv() => match command {
                        Some(Command::Send(text)) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Command::Close) => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Away,
                                    reason: "upstream going away".into(),
                                })))
                                .await;
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            url,
            connections,
            headers: header_rx,
            received: received_rx,
            commands: command_tx,
        }
    }

    pub fn send(&self, text: &str) {
        self.commands.send(Command::Send(text.to_string())).unwrap();
    }

    pub fn close(&self) {
        self.commands.send(Command::Close).unwrap();
    }

    pub async fn handshake(&mut self) -> HandshakeHeaders {
        tokio::time::timeout(WAIT, self.headers.recv())
            .await
            .expect("upstream handshake timed out")
            .expect("upstream never connected")
    }

    /// Next message the relay sent upstream.
    pub async fn next_message(&mut self) -> Message {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("timed out waiting for upstream message")
            .expect("upstream connection ended")
    }

    pub async fn next_text(&mut self) -> String {
        match self.next_message().await {
            Message::Text(text) => text,
            other => panic!("expected text upstream, got {:?}", other),
        }
    }

    /// Nothing arrives upstream within `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        if let Ok(Some(message)) = tokio::time::timeout(window, self.received.recv()).await {
            panic!("unexpected upstream message: {:?}", message);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Relay config pointed at `upstream_url`, without a default credential.
pub fn relay_config(upstream_url: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.upstream.url = upstream_url.to_string();
    config.upstream.api_key = None;
    config.upstream.connect_timeout_secs = 2;
    config
}

/// Run the relay WebSocket server on an ephemeral port.
pub async fn start_relay(config: AppConfig) -> (SocketAddr, ServerHandle, AppState) {
    let state = AppState::new(config);
    let server_state = state.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .configure(relay::manager::configure)
    })
    .workers(1)
    .disable_signals()
    .bind(("127.0.0.1", 0))
    .unwrap();

    let addr = server.addrs()[0];
    let server = server.run();
    let handle = server.handle();
    actix_web::rt::spawn(server);
    (addr, handle, state)
}

pub async fn connect_client(addr: SocketAddr, query: &str) -> ClientSocket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/{}", addr, query))
        .await
        .unwrap();
    socket
}

/// Next text frame from the relay, skipping control frames.
pub async fn next_text(socket: &mut ClientSocket) -> String {
    loop {
        let message = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for relay message")
            .expect("relay socket ended")
            .expect("relay socket error");
        match message {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text from relay, got {:?}", other),
        }
    }
}

/// The relay closes the socket without sending any more text.
pub async fn expect_close(socket: &mut ClientSocket) {
    loop {
        match tokio::time::timeout(WAIT, socket.next()).await.expect("relay never closed") {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(Message::Text(text))) => panic!("unexpected text before close: {}", text),
            Some(Ok(_)) => continue,
        }
    }
}

pub fn json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap()
}
