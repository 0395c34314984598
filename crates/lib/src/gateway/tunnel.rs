//! Per-tunnel actor.
//!
//! One task per tunnel owns the tunnel's single client connection and the table of
//! in-flight requests. Everything that touches that state arrives as a [`TunnelEvent`]
//! and is handled one event at a time, so no locking is needed and each pending request
//! reaches exactly one terminal state: the first of response-end, response-error,
//! header timeout, connection loss or caller cancellation removes it from the table and
//! every later event for the same id finds nothing.

use crate::gateway::error::GatewayError;
use crate::protocol::{self, Headers, Message, CLOSE_SUPERSEDED};
use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Identifies one attached connection; frames and detach signals from a superseded
/// connection carry a stale id and are ignored.
pub type ConnectionId = u64;

/// Close code sent to the client when the gateway shuts down.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Instruction for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(Message),
    Close { code: u16, reason: String },
}

/// Inbound HTTP request ready to forward: prefix stripped, hop-by-hop headers removed.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

/// Snapshot reported by `GET /api/tunnels/{name}`.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub name: String,
    pub connected: bool,
    pub pending: usize,
}

type HeadResult = Result<ResponseHead, GatewayError>;
type BodyItem = Result<Bytes, GatewayError>;

enum TunnelEvent {
    Attach {
        outbound: mpsc::UnboundedSender<Outbound>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Frame {
        conn: ConnectionId,
        text: String,
    },
    Detach {
        conn: ConnectionId,
        reason: String,
    },
    Dispatch {
        request: ProxiedRequest,
        reply: oneshot::Sender<Result<Dispatched, GatewayError>>,
    },
    Timeout {
        id: String,
    },
    Cancel {
        id: String,
    },
    Status {
        reply: oneshot::Sender<TunnelStatus>,
    },
    Shutdown,
}

struct Dispatched {
    id: String,
    head: oneshot::Receiver<HeadResult>,
    body: mpsc::UnboundedReceiver<BodyItem>,
}

/// Cheap handle to a tunnel actor.
#[derive(Clone)]
pub struct TunnelHandle {
    name: String,
    events: mpsc::UnboundedSender<TunnelEvent>,
}

impl TunnelHandle {
    /// Start the actor for `name`. It lives as long as the process.
    pub fn spawn(name: impl Into<String>, response_timeout: Duration) -> Self {
        let name = name.into();
        let (events, rx) = mpsc::unbounded_channel();
        let actor = TunnelActor {
            name: name.clone(),
            response_timeout,
            events: events.clone(),
            next_conn: 1,
            connection: None,
            pending: HashMap::new(),
        };
        tokio::spawn(actor.run(rx));
        Self { name, events }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adopt a new connection, closing and replacing any existing one.
    pub async fn attach(
        &self,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<ConnectionId, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(TunnelEvent::Attach { outbound, reply })?;
        rx.await.map_err(|_| GatewayError::ActorGone)
    }

    /// Feed one text frame received on connection `conn`.
    pub fn frame(&self, conn: ConnectionId, text: String) {
        let _ = self.send(TunnelEvent::Frame { conn, text });
    }

    /// Signal that connection `conn` closed or failed.
    pub fn detach(&self, conn: ConnectionId, reason: impl Into<String>) {
        let _ = self.send(TunnelEvent::Detach {
            conn,
            reason: reason.into(),
        });
    }

    /// Forward a request over the tunnel. Fails immediately with
    /// [`GatewayError::ConnectionUnavailable`] when no client is attached.
    pub async fn dispatch(&self, request: ProxiedRequest) -> Result<PendingResponse, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(TunnelEvent::Dispatch { request, reply })?;
        let dispatched = rx.await.map_err(|_| GatewayError::ActorGone)??;
        Ok(PendingResponse {
            head: dispatched.head,
            body: dispatched.body,
            guard: CancelGuard {
                id: dispatched.id,
                events: self.events.clone(),
            },
        })
    }

    pub async fn status(&self) -> Result<TunnelStatus, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(TunnelEvent::Status { reply })?;
        rx.await.map_err(|_| GatewayError::ActorGone)
    }

    /// Close the connection (if any) and fail every pending request.
    pub fn shutdown(&self) {
        let _ = self.send(TunnelEvent::Shutdown);
    }

    fn send(&self, event: TunnelEvent) -> Result<(), GatewayError> {
        self.events.send(event).map_err(|_| GatewayError::ActorGone)
    }
}

/// The caller's side of one in-flight request.
///
/// Dropping it (or the body stream it turns into) before the exchange finished releases
/// the pending entry in the actor. The remote client is not told.
pub struct PendingResponse {
    head: oneshot::Receiver<HeadResult>,
    body: mpsc::UnboundedReceiver<BodyItem>,
    guard: CancelGuard,
}

impl PendingResponse {
    pub fn id(&self) -> &str {
        &self.guard.id
    }

    /// Wait for the response head, then hand back the live body stream.
    pub async fn start(self) -> Result<(ResponseHead, BodyStream), GatewayError> {
        let PendingResponse { head, body, guard } = self;
        let head = head.await.map_err(|_| GatewayError::ConnectionClosed)??;
        Ok((
            head,
            BodyStream {
                rx: body,
                _guard: guard,
            },
        ))
    }
}

/// Response body fed by `response-chunk` messages as they arrive.
pub struct BodyStream {
    rx: mpsc::UnboundedReceiver<BodyItem>,
    _guard: CancelGuard,
}

impl Stream for BodyStream {
    type Item = BodyItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct CancelGuard {
    id: String,
    events: mpsc::UnboundedSender<TunnelEvent>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let id = std::mem::take(&mut self.id);
        let _ = self.events.send(TunnelEvent::Cancel { id });
    }
}

struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

struct PendingRequest {
    /// Present until `response-start` arrives.
    head: Option<oneshot::Sender<HeadResult>>,
    body: mpsc::UnboundedSender<BodyItem>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn fail(mut self, err: GatewayError) {
        match self.head.take() {
            Some(head) => {
                let _ = head.send(Err(err));
            }
            None => {
                let _ = self.body.send(Err(err));
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.clear_timer();
    }
}

struct TunnelActor {
    name: String,
    response_timeout: Duration,
    events: mpsc::UnboundedSender<TunnelEvent>,
    next_conn: ConnectionId,
    connection: Option<Connection>,
    pending: HashMap<String, PendingRequest>,
}

impl TunnelActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TunnelEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
    }

    fn handle(&mut self, event: TunnelEvent) {
        match event {
            TunnelEvent::Attach { outbound, reply } => {
                let id = self.attach(outbound);
                let _ = reply.send(id);
            }
            TunnelEvent::Frame { conn, text } => self.on_frame(conn, &text),
            TunnelEvent::Detach { conn, reason } => self.on_detach(conn, &reason),
            TunnelEvent::Dispatch { request, reply } => self.dispatch(request, reply),
            TunnelEvent::Timeout { id } => self.on_timeout(&id),
            TunnelEvent::Cancel { id } => {
                if self.pending.remove(&id).is_some() {
                    log::debug!("tunnel {}: request {} cancelled by caller", self.name, id);
                }
            }
            TunnelEvent::Status { reply } => {
                let _ = reply.send(TunnelStatus {
                    name: self.name.clone(),
                    connected: self.connection.is_some(),
                    pending: self.pending.len(),
                });
            }
            TunnelEvent::Shutdown => {
                if let Some(old) = self.connection.take() {
                    let _ = old.outbound.send(Outbound::Close {
                        code: CLOSE_GOING_AWAY,
                        reason: "gateway shutting down".to_string(),
                    });
                }
                self.fail_all();
            }
        }
    }

    fn attach(&mut self, outbound: mpsc::UnboundedSender<Outbound>) -> ConnectionId {
        let id = self.next_conn;
        self.next_conn += 1;
        if let Some(old) = self.connection.take() {
            log::info!(
                "tunnel {}: connection {} superseded by {}",
                self.name,
                old.id,
                id
            );
            let _ = old.outbound.send(Outbound::Close {
                code: CLOSE_SUPERSEDED,
                reason: "superseded by a new connection".to_string(),
            });
            self.fail_all();
        }
        self.connection = Some(Connection { id, outbound });
        id
    }

    fn on_detach(&mut self, conn: ConnectionId, reason: &str) {
        if self.connection.as_ref().map(|c| c.id) != Some(conn) {
            return;
        }
        log::info!("tunnel {}: connection {} closed ({})", self.name, conn, reason);
        self.connection = None;
        self.fail_all();
    }

    /// Fail every pending request with "connection closed" and clear the table.
    fn fail_all(&mut self) {
        if !self.pending.is_empty() {
            log::debug!(
                "tunnel {}: failing {} pending request(s)",
                self.name,
                self.pending.len()
            );
        }
        for (_, pending) in self.pending.drain() {
            pending.fail(GatewayError::ConnectionClosed);
        }
    }

    fn dispatch(
        &mut self,
        request: ProxiedRequest,
        reply: oneshot::Sender<Result<Dispatched, GatewayError>>,
    ) {
        let Some(conn) = self.connection.as_ref() else {
            let _ = reply.send(Err(GatewayError::ConnectionUnavailable(self.name.clone())));
            return;
        };

        let id = uuid::Uuid::new_v4().to_string();
        let message = Message::Request {
            id: id.clone(),
            method: request.method,
            url: request.url,
            headers: request.headers,
            body: if request.body.is_empty() {
                None
            } else {
                Some(protocol::encode(&request.body))
            },
        };
        if conn.outbound.send(Outbound::Message(message)).is_err() {
            // Writer already gone; the detach signal is on its way.
            let conn_id = conn.id;
            self.on_detach(conn_id, "writer stopped");
            let _ = reply.send(Err(GatewayError::ConnectionClosed));
            return;
        }

        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let timer = {
            let events = self.events.clone();
            let id = id.clone();
            let timeout = self.response_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(TunnelEvent::Timeout { id });
            })
        };
        self.pending.insert(
            id.clone(),
            PendingRequest {
                head: Some(head_tx),
                body: body_tx,
                timer: Some(timer),
            },
        );
        let dispatched = Dispatched {
            id: id.clone(),
            head: head_rx,
            body: body_rx,
        };
        if reply.send(Ok(dispatched)).is_err() {
            self.pending.remove(&id);
        }
    }

    fn on_timeout(&mut self, id: &str) {
        let awaiting_head = self.pending.get(id).is_some_and(|p| p.head.is_some());
        if !awaiting_head {
            return;
        }
        if let Some(pending) = self.pending.remove(id) {
            log::warn!("tunnel {}: request {} timed out waiting for headers", self.name, id);
            pending.fail(GatewayError::Timeout);
        }
    }

    fn on_frame(&mut self, conn: ConnectionId, text: &str) {
        if self.connection.as_ref().map(|c| c.id) != Some(conn) {
            log::debug!("tunnel {}: ignoring frame from stale connection {}", self.name, conn);
            return;
        }
        match Message::parse(text) {
            Ok(message) => self.on_message(message),
            Err(e) => log::warn!("tunnel {}: dropping frame: {}", self.name, e),
        }
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Request { id, .. } => {
                log::warn!("tunnel {}: client sent a request message ({}), ignoring", self.name, id);
            }
            Message::ResponseStart {
                id,
                status,
                headers,
            } => {
                let Some(pending) = self.pending.get_mut(&id) else {
                    log::debug!("tunnel {}: response-start for unknown id {}", self.name, id);
                    return;
                };
                let Some(head) = pending.head.take() else {
                    log::debug!("tunnel {}: duplicate response-start for {}", self.name, id);
                    return;
                };
                pending.clear_timer();
                if head.send(Ok(ResponseHead { status, headers })).is_err() {
                    self.pending.remove(&id);
                }
            }
            Message::ResponseChunk { id, chunk } => {
                let awaiting_head = match self.pending.get(&id) {
                    Some(pending) => pending.head.is_some(),
                    None => {
                        log::debug!("tunnel {}: chunk for unknown id {}", self.name, id);
                        return;
                    }
                };
                if awaiting_head {
                    self.fail(&id, GatewayError::Malformed("chunk before response-start".into()));
                    return;
                }
                let bytes = match protocol::decode(&chunk) {
                    Ok(b) => b,
                    Err(e) => {
                        self.fail(&id, GatewayError::Malformed(e.to_string()));
                        return;
                    }
                };
                if bytes.is_empty() {
                    return;
                }
                let delivered = self
                    .pending
                    .get(&id)
                    .is_some_and(|p| p.body.send(Ok(Bytes::from(bytes))).is_ok());
                if !delivered {
                    self.pending.remove(&id);
                }
            }
            Message::ResponseEnd { id } => {
                let Some(pending) = self.pending.remove(&id) else {
                    return;
                };
                if pending.head.is_some() {
                    pending.fail(GatewayError::Malformed("response-end before response-start".into()));
                }
            }
            Message::ResponseError { id, error } => {
                log::debug!("tunnel {}: request {} failed remotely: {}", self.name, id, error);
                self.fail(&id, GatewayError::Remote(error));
            }
        }
    }

    fn fail(&mut self, id: &str, err: GatewayError) {
        if let Some(pending) = self.pending.remove(id) {
            pending.fail(err);
        }
    }
}
