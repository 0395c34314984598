//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config, GatewayConfig};
use crate::gateway::error::GatewayError;
use crate::gateway::registry::TunnelRegistry;
use crate::gateway::tunnel::{Outbound, ProxiedRequest, TunnelHandle, TunnelStatus};
use crate::protocol::{
    is_hop_by_hop, is_request_only, TunnelInfo, CLIENT_MARKER, CLIENT_MARKER_HEADER, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION,
};
use crate::routing::{self, Route};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Request, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use http_body_util::LengthLimitError;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct GatewayState {
    config: Arc<GatewayConfig>,
    prefix: Arc<str>,
    tunnels: Arc<TunnelRegistry>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Self {
        let prefix: Arc<str> = config.normalized_prefix().into();
        let tunnels = Arc::new(TunnelRegistry::new(config.response_timeout()));
        Self {
            config: Arc::new(config),
            prefix,
            tunnels,
        }
    }

    pub fn tunnels(&self) -> &Arc<TunnelRegistry> {
        &self.tunnels
    }
}

/// Build the gateway router.
///
/// `/api/...` and `{prefix}/...` take precedence over host routing, so a tunnel served on
/// `name.{baseDomain}` cannot use those paths.
pub fn router(state: GatewayState) -> Router {
    let proxy_route = format!("{}/*rest", state.prefix);
    Router::new()
        .route("/", any(root))
        .route("/api/tunnels", post(create_tunnel))
        .route("/api/tunnels/:name", get(tunnel_status))
        .route("/api/tunnels/:name/connect", get(ws_handler))
        .route(&proxy_route, any(proxy_by_path))
        .fallback(proxy_by_host)
        .with_state(state)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config) -> Result<()> {
    let gateway = config.gateway;
    let bind_addr = format!("{}:{}", gateway.bind.trim(), gateway.port);
    let state = GatewayState::new(gateway);
    let tunnels = state.tunnels.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(tunnels))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Closes every tunnel connection so in-flight requests fail instead of hanging.
async fn shutdown_signal(tunnels: Arc<TunnelRegistry>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing tunnel connections");
    tunnels.shutdown_all().await;
}

/// `/` is either a host-routed tunnel root or the health check (GET only).
async fn root(State(state): State<GatewayState>, req: Request) -> Response {
    if let Some(route) = host_route(&state, &req) {
        return forward(&state, route, req).await;
    }
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET, HEAD")],
            "method not allowed",
        )
            .into_response();
    }
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.port,
        "tunnels": state.tunnels.len().await,
    }))
    .into_response()
}

/// POST /api/tunnels: allocate a fresh tunnel name. Nothing is persisted.
async fn create_tunnel(State(state): State<GatewayState>) -> Json<TunnelInfo> {
    let name = routing::generate_tunnel_name();
    state.tunnels.get_or_create(&name).await;
    let base = state.config.public_base_url();
    let url = match state.config.base_domain.as_deref().map(str::trim) {
        Some(domain) if !domain.is_empty() => {
            let scheme = if base.starts_with("https://") { "https" } else { "http" };
            format!("{}://{}.{}/", scheme, name, domain)
        }
        _ => format!("{}{}/{}/", base, state.prefix, name),
    };
    log::info!("allocated tunnel {}", name);
    Json(TunnelInfo {
        connect_url: config::connect_url(&base, &name),
        name,
        url,
    })
}

/// GET /api/tunnels/{name}: whether a client is attached and how many requests are in flight.
async fn tunnel_status(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Result<Json<TunnelStatus>, GatewayError> {
    match state.tunnels.get(&name).await {
        Some(tunnel) => Ok(Json(tunnel.status().await?)),
        None => Ok(Json(TunnelStatus {
            name,
            connected: false,
            pending: 0,
        })),
    }
}

/// GET /api/tunnels/{name}/connect upgrades to WebSocket. The client must carry the marker header.
async fn ws_handler(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !routing::is_valid_tunnel_name(&name) {
        return (StatusCode::BAD_REQUEST, "invalid tunnel name").into_response();
    }
    let marker_ok = headers
        .get(CLIENT_MARKER_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == CLIENT_MARKER);
    if !marker_ok {
        return (StatusCode::BAD_REQUEST, "missing tunnel client marker").into_response();
    }
    let tunnel = state.tunnels.get_or_create(&name).await;
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, tunnel))
}

/// Pump one client connection: a writer task drains the actor's outbound queue, this task
/// feeds inbound frames to the actor until the socket closes.
async fn handle_socket(socket: WebSocket, tunnel: TunnelHandle) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let conn = match tunnel.attach(outbound_tx).await {
        Ok(id) => id,
        Err(e) => {
            log::warn!("tunnel {}: attach failed: {}", tunnel.name(), e);
            return;
        }
    };
    log::info!("tunnel {}: client connected (connection {})", tunnel.name(), conn);

    let mut writer = tokio::spawn(async move {
        while let Some(out) = outbound_rx.recv().await {
            match out {
                Outbound::Message(msg) => {
                    if sink.send(Message::Text(msg.to_text())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let reason = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => tunnel.frame(conn, text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => tunnel.frame(conn, text),
                    Err(_) => log::warn!("tunnel {}: dropping non-utf8 binary frame", tunnel.name()),
                },
                Some(Ok(Message::Close(_))) | None => break "closed by client".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("transport error: {}", e),
            },
            _ = &mut writer => break "connection closed by gateway".to_string(),
        }
    };
    tunnel.detach(conn, reason);
    writer.abort();
}

/// `{prefix}/{name}/...`: forward the rest of the path to tunnel `name`.
async fn proxy_by_path(State(state): State<GatewayState>, req: Request) -> Response {
    if let Some(route) = host_route(&state, &req) {
        return forward(&state, route, req).await;
    }
    match routing::route_by_path(&state.prefix, req.uri().path(), req.uri().query()) {
        Some(route) => forward(&state, route, req).await,
        None => (StatusCode::NOT_FOUND, "unknown tunnel").into_response(),
    }
}

/// Anything else: host routing when a base domain is configured, otherwise 404.
async fn proxy_by_host(State(state): State<GatewayState>, req: Request) -> Response {
    match host_route(&state, &req) {
        Some(route) => forward(&state, route, req).await,
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

fn host_route(state: &GatewayState, req: &Request) -> Option<Route> {
    let domain = state.config.base_domain.as_deref()?;
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())?;
    routing::route_by_host(domain, host, req.uri().path(), req.uri().query())
}

async fn forward(state: &GatewayState, route: Route, req: Request) -> Response {
    // Only allocation and connect start actors; unknown names are simply unavailable.
    let Some(tunnel) = state.tunnels.get(&route.tunnel).await else {
        return GatewayError::ConnectionUnavailable(route.tunnel).into_response();
    };
    match tunnel.status().await {
        Ok(status) if !status.connected => {
            return GatewayError::ConnectionUnavailable(route.tunnel).into_response();
        }
        Err(e) => return e.into_response(),
        Ok(_) => {}
    }

    let limit = state.config.max_request_body();
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return body_too_large(limit);
    }
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, limit).await {
        Ok(b) => b,
        Err(e) => {
            let inner = e.into_inner();
            if inner.downcast_ref::<LengthLimitError>().is_some() {
                return body_too_large(limit);
            }
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {}", inner),
            )
                .into_response();
        }
    };
    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| !is_request_only(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let request = ProxiedRequest {
        method: parts.method.to_string(),
        url: route.path,
        headers,
        body,
    };

    let pending = match tunnel.dispatch(request).await {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let id = pending.id().to_string();
    let (head, body) = match pending.start().await {
        Ok(started) => started,
        Err(e) => {
            log::debug!("tunnel {}: request {} failed before headers: {}", tunnel.name(), id, e);
            return e.into_response();
        }
    };

    let Ok(status) = StatusCode::from_u16(head.status) else {
        return GatewayError::Malformed(format!("invalid status {}", head.status)).into_response();
    };
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    for (name, value) in head.headers {
        if is_hop_by_hop(&name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response_headers.append(name, value);
            }
            _ => log::debug!("tunnel {}: dropping invalid response header {}", tunnel.name(), name),
        }
    }
    response
}

fn body_too_large(limit: usize) -> Response {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        format!("request body exceeds the tunnel limit of {} bytes", limit),
    )
        .into_response()
}
