//! Connection supervisor: keeps the outward tunnel connection up.
//!
//! The run loop is the only place a reconnect is scheduled, so at most one retry is ever
//! pending. Retries are unbounded with a fixed delay. Shutdown is sticky: once requested,
//! the active connection is closed and no further attempt is made.

use crate::client::engine::ProxyEngine;
use crate::client::executor::Executor;
use crate::protocol::{Message, CLIENT_MARKER, CLIENT_MARKER_HEADER, MAX_REQUEST_MESSAGE_SIZE};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

/// Requests supervisor shutdown. Clones share the same flag; calling it twice is a no-op.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if !self.tx.send_replace(true) {
            log::info!("shutdown requested");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

enum SessionEnd {
    Closed(String),
    Shutdown,
}

pub struct Supervisor {
    connect_url: String,
    reconnect_delay: Duration,
    executor: Arc<dyn Executor>,
    state: watch::Sender<SupervisorState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Supervisor {
    pub fn new(
        connect_url: impl Into<String>,
        reconnect_delay: Duration,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            connect_url: connect_url.into(),
            reconnect_delay,
            executor,
            state,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Connect, serve, and reconnect until shutdown is requested.
    pub async fn run(self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(SupervisorState::Connecting);
            let attempt = tokio::select! {
                res = connect(&self.connect_url) => res,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };
            match attempt {
                Ok(ws) => {
                    self.set_state(SupervisorState::Connected);
                    log::info!("connected to {}", self.connect_url);
                    match self.serve(ws, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed(reason) => log::warn!(
                            "connection lost ({}); reconnecting in {:?}",
                            reason,
                            self.reconnect_delay
                        ),
                    }
                }
                Err(e) => log::warn!(
                    "connect to {} failed: {}; retrying in {:?}",
                    self.connect_url,
                    e,
                    self.reconnect_delay
                ),
            }
            self.set_state(SupervisorState::Disconnected);
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        self.set_state(SupervisorState::ShuttingDown);
        log::info!("supervisor stopped");
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    /// Serve one connection until it closes or shutdown is requested.
    async fn serve(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let engine = ProxyEngine::new(self.executor.clone(), outbound_tx);

        loop {
            tokio::select! {
                Some(message) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(WsMessage::Text(message.to_text())).await {
                        return SessionEnd::Closed(e.to_string());
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        engine.handle_frame(&text);
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = match frame {
                            Some(f) => format!("closed by gateway: {} {}", u16::from(f.code), f.reason),
                            None => "closed by gateway".to_string(),
                        };
                        return SessionEnd::Closed(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Closed(e.to_string()),
                    None => return SessionEnd::Closed("stream ended".to_string()),
                },
                _ = wait_for_shutdown(shutdown) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client shutting down".into(),
                    };
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also ends the wait.
    let _ = rx.wait_for(|requested| *requested).await;
}

async fn connect(url: &str) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert(CLIENT_MARKER_HEADER, HeaderValue::from_static(CLIENT_MARKER));
    let (ws, _) =
        tokio_tungstenite::connect_async_with_config(request, Some(ws_config()), false).await?;
    Ok(ws)
}

/// Accept any request the gateway is willing to forward.
fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_REQUEST_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_REQUEST_MESSAGE_SIZE);
    config
}
