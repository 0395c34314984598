//! Proxy engine: executes requests received from the gateway and streams the results back.
//!
//! Every request runs on its own task, so a slow target response never delays another
//! exchange sharing the connection. Each exchange ends with exactly one of
//! `response-end` or `response-error`.

use crate::client::executor::{ExecRequest, Executor, ExecutorError};
use crate::protocol::{self, is_hop_by_hop, Headers, Message, CHUNK_SIZE};
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct ProxyEngine {
    executor: Arc<dyn Executor>,
    outbound: mpsc::UnboundedSender<Message>,
    chunk_size: usize,
}

impl ProxyEngine {
    /// Messages produced by the engine are pushed to `outbound`, in order per exchange.
    pub fn new(executor: Arc<dyn Executor>, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            executor,
            outbound,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Handle one text frame from the gateway. Requests are spawned and their task returned;
    /// anything else is logged and dropped.
    pub fn handle_frame(&self, text: &str) -> Option<JoinHandle<()>> {
        match Message::parse(text) {
            Ok(Message::Request {
                id,
                method,
                url,
                headers,
                body,
            }) => {
                let engine = self.clone();
                Some(tokio::spawn(async move {
                    engine.exchange(id, method, url, headers, body).await;
                }))
            }
            Ok(other) => {
                log::warn!("ignoring unexpected message for {} from gateway", other.id());
                None
            }
            Err(e) => {
                log::warn!("dropping frame from gateway: {}", e);
                None
            }
        }
    }

    async fn exchange(
        self,
        id: String,
        method: String,
        url: String,
        headers: Headers,
        body: Option<String>,
    ) {
        log::debug!("request {}: {} {}", id, method, url);
        if let Err(e) = self.forward(&id, method, url, headers, body).await {
            log::debug!("request {} failed: {}", id, e);
            self.emit(Message::error(&id, e.to_string()));
        }
    }

    async fn forward(
        &self,
        id: &str,
        method: String,
        url: String,
        headers: Headers,
        body: Option<String>,
    ) -> Result<(), ExecutorError> {
        let body = match body {
            Some(encoded) => Some(Bytes::from(protocol::decode(&encoded)?)),
            None => None,
        };
        let response = self
            .executor
            .execute(ExecRequest {
                method,
                url,
                headers,
                body,
            })
            .await?;

        self.emit(Message::ResponseStart {
            id: id.to_string(),
            status: response.status,
            headers: response
                .headers
                .into_iter()
                .filter(|(name, _)| !is_hop_by_hop(name))
                .collect(),
        });

        let mut body = response.body;
        while let Some(next) = body.next().await {
            let bytes = next?;
            for piece in protocol::chunk(&bytes, self.chunk_size) {
                self.emit(Message::chunk(id, piece));
            }
        }
        self.emit(Message::ResponseEnd { id: id.to_string() });
        Ok(())
    }

    fn emit(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            log::debug!("connection gone, dropping outbound message");
        }
    }
}
