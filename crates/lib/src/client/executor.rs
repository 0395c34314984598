//! Downstream executor: performs the real HTTP call against the local target.
//!
//! The proxy engine only sees the [`Executor`] trait, so tests can answer with canned
//! responses instead of a live server.

use crate::protocol::{is_request_only, Headers, ProtocolError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;

/// Response body as it arrives from the target.
pub type ByteStream = BoxStream<'static, Result<Bytes, ExecutorError>>;

/// A decoded request from the gateway.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub method: String,
    /// Path and query, e.g. `/api/items?page=2`.
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

pub struct ExecResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: ByteStream,
}

impl ExecResponse {
    /// Response whose whole body is known up front.
    pub fn full(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers,
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("request to local target failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Other(String),
}

/// Performs one HTTP exchange against the real local target.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecRequest) -> Result<ExecResponse, ExecutorError>;
}

/// [`Executor`] backed by `reqwest`. Redirects are returned to the caller, not followed.
#[derive(Clone)]
pub struct HttpExecutor {
    base_url: String,
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ExecutorError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, request: ExecRequest) -> Result<ExecResponse, ExecutorError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ExecutorError::InvalidRequest(format!("bad method {}", request.method)))?;
        let path = if request.url.starts_with('/') {
            request.url
        } else {
            format!("/{}", request.url)
        };
        let url = format!("{}{}", self.base_url, path);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if is_request_only(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let res = builder.send().await?;

        let status = res.status().as_u16();
        let headers = res
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = res
            .bytes_stream()
            .map(|chunk| chunk.map_err(ExecutorError::from))
            .boxed();
        Ok(ExecResponse {
            status,
            headers,
            body,
        })
    }
}
