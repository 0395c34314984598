//! End-to-end: public HTTP request -> gateway -> tunnel connection -> client -> local target
//! and back. Uses a real gateway, a real local axum server and the reconnecting client.
//! Raw WebSocket clients stand in for a misbehaving or competing tunnel client.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path},
    http::{HeaderMap, Method, StatusCode, Uri},
    routing::{any, get, post},
    Router,
};
use backhaul::client::{HttpExecutor, ShutdownHandle, Supervisor, SupervisorState};
use backhaul::config::{self, Config, GatewayConfig};
use backhaul::gateway;
use backhaul::protocol::{
    Message, CLIENT_MARKER, CLIENT_MARKER_HEADER, CLOSE_SUPERSEDED, MAX_REQUEST_BODY_SIZE,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const BIG_LEN: usize = 1536 * 1024;
const TEXT: &str = "smart “quotes” — emoji 🎉🚀 — CJK 中文字符 — accents àéîõü";

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

fn big_body() -> Vec<u8> {
    (0..BIG_LEN).map(|i| (i * 7 % 256) as u8).collect()
}

async fn start_gateway(response_timeout_secs: u64) -> (u16, String) {
    start_gateway_with(|g| g.response_timeout_secs = response_timeout_secs).await
}

async fn start_gateway_with(configure: impl FnOnce(&mut GatewayConfig)) -> (u16, String) {
    let port = free_port();
    let mut config = Config::default();
    configure(&mut config.gateway);
    config.gateway.port = port;
    tokio::spawn(async move {
        let _ = gateway::run_gateway(config).await;
    });

    let base = format!("http://127.0.0.1:{}", port);
    for _ in 0..100 {
        if let Ok(resp) = reqwest::get(format!("{}/", base)).await {
            if resp.status().is_success() {
                return (port, base);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("gateway on port {} did not come up", port);
}

/// Local server the client forwards to.
async fn start_target() -> String {
    let app = Router::new()
        .route(
            "/hello",
            get(|| async {
                (
                    StatusCode::CREATED,
                    [("content-type", "text/plain"), ("x-custom", "1")],
                    "hi",
                )
            }),
        )
        .route("/big", get(|| async { big_body() }))
        .route(
            "/text",
            get(|| async { ([("content-type", "text/plain; charset=utf-8")], TEXT) }),
        )
        .route(
            "/echo",
            any(|method: Method, uri: Uri, headers: HeaderMap, body: Bytes| async move {
                let tag = headers
                    .get("x-tag")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                (
                    [
                        ("x-method", method.to_string()),
                        ("x-url", uri.to_string()),
                        ("x-tag", tag),
                    ],
                    body,
                )
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                "slow done"
            }),
        )
        .route(
            "/upload",
            post(|body: Bytes| async move { body.len().to_string() }),
        )
        .route(
            "/id/:n",
            get(|Path(n): Path<u64>| async move {
                tokio::time::sleep(Duration::from_millis((n % 5) * 30)).await;
                ([("x-id", n.to_string())], format!("response {}", n))
            }),
        )
        .layer(DefaultBodyLimit::disable());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

async fn tunnel_connected(base: &str, name: &str) -> bool {
    let Ok(resp) = reqwest::get(format!("{}/api/tunnels/{}", base, name)).await else {
        return false;
    };
    let json: serde_json::Value = resp.json().await.unwrap_or_default();
    json["connected"] == true
}

async fn wait_until_connected(base: &str, name: &str) {
    for _ in 0..100 {
        if tunnel_connected(base, name).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("tunnel {} never became connected", name);
}

async fn start_client(
    base: &str,
    name: &str,
    target: &str,
    reconnect_delay: Duration,
) -> (watch::Receiver<SupervisorState>, ShutdownHandle) {
    let executor = HttpExecutor::new(target).expect("executor");
    let supervisor = Supervisor::new(
        config::connect_url(base, name),
        reconnect_delay,
        Arc::new(executor),
    );
    let state = supervisor.state();
    let shutdown = supervisor.shutdown_handle();
    tokio::spawn(supervisor.run());
    wait_until_connected(base, name).await;
    (state, shutdown)
}

async fn raw_client(port: u16, name: &str) -> RawClient {
    let url = format!("ws://127.0.0.1:{}/api/tunnels/{}/connect", port, name);
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert(CLIENT_MARKER_HEADER, HeaderValue::from_static(CLIENT_MARKER));
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

/// Next request frame delivered to a raw client: (id, method, url).
async fn next_request(ws: &mut RawClient) -> (String, String, String) {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame within 5s")
            .expect("stream ended")
            .expect("transport error");
        if let WsMessage::Text(text) = frame {
            match Message::parse(&text).expect("valid message") {
                Message::Request { id, method, url, .. } => return (id, method, url),
                other => panic!("unexpected message {:?}", other),
            }
        }
    }
}

async fn send(ws: &mut RawClient, message: Message) {
    ws.send(WsMessage::Text(message.to_text())).await.unwrap();
}

#[tokio::test]
async fn status_headers_and_body_pass_through() {
    let (_, base) = start_gateway(30).await;
    let target = start_target().await;
    let (_state, shutdown) = start_client(&base, "basic", &target, Duration::from_millis(200)).await;

    let resp = reqwest::get(format!("{}/t/basic/hello", base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    assert_eq!(resp.headers()["x-custom"], "1");
    assert_eq!(resp.headers()["content-type"], "text/plain");
    assert_eq!(resp.content_length(), Some(2));
    assert_eq!(resp.text().await.unwrap(), "hi");

    let resp = reqwest::get(format!("{}/t/basic/text", base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), TEXT);

    shutdown.shutdown();
}

#[tokio::test]
async fn large_body_spans_many_chunks() {
    let (_, base) = start_gateway(30).await;
    let target = start_target().await;
    let (_state, shutdown) = start_client(&base, "large", &target, Duration::from_millis(200)).await;

    let resp = reqwest::get(format!("{}/t/large/big", base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.content_length(), Some(BIG_LEN as u64));
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), BIG_LEN);
    assert!(body.as_ref() == big_body().as_slice());

    shutdown.shutdown();
}

#[tokio::test]
async fn request_method_query_headers_and_body_reach_target() {
    let (_, base) = start_gateway(30).await;
    let target = start_target().await;
    let (_state, shutdown) = start_client(&base, "echo", &target, Duration::from_millis(200)).await;

    let payload: Vec<u8> = TEXT.as_bytes().iter().copied().chain([0u8, 0xff, 0x80]).collect();
    let resp = reqwest::Client::new()
        .put(format!("{}/t/echo/echo?page=2&q=a%20b", base))
        .header("x-tag", "t-1")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["x-method"], "PUT");
    assert_eq!(resp.headers()["x-url"], "/echo?page=2&q=a%20b");
    assert_eq!(resp.headers()["x-tag"], "t-1");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), payload.as_slice());

    shutdown.shutdown();
}

fn assert_refused(resp: reqwest::Result<reqwest::Response>) {
    if let Ok(resp) = resp {
        assert_eq!(resp.status().as_u16(), 413);
    }
}

#[tokio::test]
async fn oversized_upload_fails_alone() {
    let (_, base) = start_gateway(30).await;
    let target = start_target().await;
    let (_state, shutdown) = start_client(&base, "uploads", &target, Duration::from_millis(200)).await;
    let client = reqwest::Client::new();

    let slow = tokio::spawn({
        let client = client.clone();
        let url = format!("{}/t/uploads/slow", base);
        async move { client.get(url).send().await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Declared length over the limit. The gateway answers without reading the body, so the
    // upload may also be cut off while still being written.
    let resp = client
        .post(format!("{}/t/uploads/upload", base))
        .body(vec![1u8; 13 * 1024 * 1024])
        .send()
        .await;
    assert_refused(resp);

    // Chunked upload that only turns out too large while reading.
    let pieces: Vec<Result<Bytes, std::io::Error>> = (0..9)
        .map(|_| Ok(Bytes::from(vec![2u8; 1024 * 1024])))
        .collect();
    let resp = client
        .post(format!("{}/t/uploads/upload", base))
        .body(reqwest::Body::wrap_stream(futures_util::stream::iter(pieces)))
        .send()
        .await;
    assert_refused(resp);

    // The concurrent request on the same tunnel is unaffected.
    let resp = slow.await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "slow done");
    assert!(tunnel_connected(&base, "uploads").await);

    // An upload at the limit still goes through.
    let resp = client
        .post(format!("{}/t/uploads/upload", base))
        .body(vec![3u8; MAX_REQUEST_BODY_SIZE])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), MAX_REQUEST_BODY_SIZE.to_string());

    shutdown.shutdown();
}

#[tokio::test]
async fn upload_limit_is_configurable() {
    let (_, base) = start_gateway_with(|g| g.max_request_body_bytes = 1024).await;
    let target = start_target().await;
    let (_state, shutdown) = start_client(&base, "small", &target, Duration::from_millis(200)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/t/small/upload", base))
        .body(vec![0u8; 1025])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 413);
    let resp = client
        .post(format!("{}/t/small/upload", base))
        .body(vec![0u8; 1024])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "1024");

    shutdown.shutdown();
}

#[tokio::test]
async fn concurrent_requests_are_not_mixed_up() {
    let (_, base) = start_gateway(30).await;
    let target = start_target().await;
    let (_state, shutdown) = start_client(&base, "many", &target, Duration::from_millis(200)).await;

    let client = reqwest::Client::new();
    let tasks: Vec<_> = (0..20u64)
        .map(|n| {
            let client = client.clone();
            let url = format!("{}/t/many/id/{}", base, n);
            tokio::spawn(async move {
                let resp = client.get(url).send().await.unwrap();
                let id = resp.headers()["x-id"].to_str().unwrap().to_string();
                let body = resp.text().await.unwrap();
                (n, id, body)
            })
        })
        .collect();
    for task in tasks {
        let (n, id, body) = task.await.unwrap();
        assert_eq!(id, n.to_string());
        assert_eq!(body, format!("response {}", n));
    }

    let status: serde_json::Value = reqwest::get(format!("{}/api/tunnels/many", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["pending"], 0);

    shutdown.shutdown();
}

#[tokio::test]
async fn silent_client_times_out_with_504() {
    let (port, base) = start_gateway(1).await;
    let mut raw = raw_client(port, "silent").await;
    wait_until_connected(&base, "silent").await;

    let resp = reqwest::get(format!("{}/t/silent/anything", base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 504);

    // The request itself did reach the client.
    let (_, method, url) = next_request(&mut raw).await;
    assert_eq!(method, "GET");
    assert_eq!(url, "/anything");
}

#[tokio::test]
async fn remote_error_before_headers_is_502() {
    let (port, base) = start_gateway(30).await;
    let mut raw = raw_client(port, "failing").await;
    wait_until_connected(&base, "failing").await;

    let pending = tokio::spawn(reqwest::get(format!("{}/t/failing/x", base)));
    let (id, _, _) = next_request(&mut raw).await;
    send(&mut raw, Message::error(&id, "target refused connection")).await;

    let resp = pending.await.unwrap().unwrap();
    assert_eq!(resp.status().as_u16(), 502);
    assert!(resp.text().await.unwrap().contains("target refused connection"));
}

#[tokio::test]
async fn newer_connection_supersedes_older() {
    let (port, base) = start_gateway(30).await;
    let mut first = raw_client(port, "dup").await;
    wait_until_connected(&base, "dup").await;

    let orphaned = tokio::spawn(reqwest::get(format!("{}/t/dup/one", base)));
    let _ = next_request(&mut first).await;

    let mut second = raw_client(port, "dup").await;

    // The older connection is closed with the superseded code.
    let code = loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), first.next())
            .await
            .expect("no close frame within 5s");
        match frame {
            Some(Ok(WsMessage::Close(Some(frame)))) => break u16::from(frame.code),
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {:?}", other),
        }
    };
    assert_eq!(code, CLOSE_SUPERSEDED);

    // Its in-flight request fails once, as a connection failure.
    let resp = orphaned.await.unwrap().unwrap();
    assert_eq!(resp.status().as_u16(), 502);

    // The newer connection serves subsequent traffic.
    let served = tokio::spawn(reqwest::get(format!("{}/t/dup/two", base)));
    let (id, _, url) = next_request(&mut second).await;
    assert_eq!(url, "/two");
    send(
        &mut second,
        Message::ResponseStart {
            id: id.clone(),
            status: 200,
            headers: vec![("x-from".into(), "second".into())],
        },
    )
    .await;
    send(&mut second, Message::chunk(&id, b"from second")).await;
    send(&mut second, Message::ResponseEnd { id }).await;

    let resp = served.await.unwrap().unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["x-from"], "second");
    assert_eq!(resp.text().await.unwrap(), "from second");
}

#[tokio::test]
async fn client_reconnects_after_connection_loss() {
    let (port, base) = start_gateway(30).await;
    let target = start_target().await;
    let (mut state, shutdown) =
        start_client(&base, "flaky", &target, Duration::from_secs(1)).await;

    // An intruder takes over the tunnel, then leaves: the client is now disconnected.
    let mut intruder = raw_client(port, "flaky").await;
    state
        .wait_for(|s| *s == SupervisorState::Disconnected)
        .await
        .unwrap();
    intruder.close(None).await.unwrap();

    let mut saw_unavailable = false;
    for _ in 0..20 {
        let resp = reqwest::get(format!("{}/t/flaky/hello", base)).await.unwrap();
        if resp.status().as_u16() == 503 {
            saw_unavailable = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(saw_unavailable, "no 503 while the client was away");

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SupervisorState::Connected),
    )
    .await
    .expect("client did not reconnect")
    .unwrap();
    wait_until_connected(&base, "flaky").await;

    let resp = reqwest::get(format!("{}/t/flaky/hello", base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    assert_eq!(resp.text().await.unwrap(), "hi");

    shutdown.shutdown();
}

#[tokio::test]
async fn client_shutdown_detaches_tunnel() {
    let (_, base) = start_gateway(30).await;
    let target = start_target().await;
    let (mut state, shutdown) =
        start_client(&base, "leaving", &target, Duration::from_millis(200)).await;

    shutdown.shutdown();
    state
        .wait_for(|s| *s == SupervisorState::ShuttingDown)
        .await
        .unwrap();

    let mut detached = false;
    for _ in 0..100 {
        if !tunnel_connected(&base, "leaving").await {
            detached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(detached, "gateway still reports the tunnel as connected");

    let resp = reqwest::get(format!("{}/t/leaving/hello", base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 503);
}
