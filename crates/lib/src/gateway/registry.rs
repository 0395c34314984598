//! Tunnel registry: lookup or lazily start the actor for a tunnel name.

use crate::gateway::tunnel::TunnelHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Registry of tunnel names to actor handles. Shared across the gateway.
pub struct TunnelRegistry {
    inner: Arc<RwLock<HashMap<String, TunnelHandle>>>,
    response_timeout: Duration,
}

impl TunnelRegistry {
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            response_timeout,
        }
    }

    /// Handle for `name`, starting its actor on first use.
    pub async fn get_or_create(&self, name: &str) -> TunnelHandle {
        if let Some(handle) = self.inner.read().await.get(name) {
            return handle.clone();
        }
        let mut g = self.inner.write().await;
        g.entry(name.to_string())
            .or_insert_with(|| {
                log::debug!("starting actor for tunnel {}", name);
                TunnelHandle::spawn(name, self.response_timeout)
            })
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<TunnelHandle> {
        self.inner.read().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Close every tunnel's connection (used on gateway shutdown).
    pub async fn shutdown_all(&self) {
        for handle in self.inner.read().await.values() {
            handle.shutdown();
        }
    }
}
