//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.backhaul/config.json`) and environment.
//! The gateway reads the `gateway` section, the client reads the `client` section.

use crate::protocol::MAX_REQUEST_BODY_SIZE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Relay (public side) settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Client (private side) settings.
    #[serde(default)]
    pub client: ClientConfig,
}

/// Gateway bind, port, routing and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Administrative path prefix for path-routed tunnels: `{pathPrefix}/{name}/...` (default "/t").
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// When set, `{name}.{baseDomain}` hosts are routed to tunnel `name`.
    #[serde(default)]
    pub base_domain: Option<String>,

    /// Externally visible base URL used in tunnel allocation responses. Defaults to `http://{bind}:{port}`.
    #[serde(default)]
    pub public_url: Option<String>,

    /// How long a proxied request waits for response headers (default 30).
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,

    /// Largest request body forwarded to a client; larger uploads get 413 (default and maximum 8 MiB).
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_path_prefix() -> String {
    "/t".to_string()
}

fn default_response_timeout_secs() -> u64 {
    30
}

fn default_max_request_body_bytes() -> usize {
    MAX_REQUEST_BODY_SIZE
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            path_prefix: default_path_prefix(),
            base_domain: None,
            public_url: None,
            response_timeout_secs: default_response_timeout_secs(),
            max_request_body_bytes: default_max_request_body_bytes(),
        }
    }
}

impl GatewayConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    /// Request body limit, capped so the encoded request always fits the client's message ceiling.
    pub fn max_request_body(&self) -> usize {
        self.max_request_body_bytes.min(MAX_REQUEST_BODY_SIZE)
    }

    /// Path prefix normalized to a leading slash and no trailing slash.
    pub fn normalized_prefix(&self) -> String {
        let p = self.path_prefix.trim().trim_end_matches('/');
        if p.is_empty() {
            default_path_prefix()
        } else if p.starts_with('/') {
            p.to_string()
        } else {
            format!("/{}", p)
        }
    }

    /// Base URL advertised to clients.
    pub fn public_base_url(&self) -> String {
        self.public_url
            .as_ref()
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("http://{}:{}", self.bind.trim(), self.port))
    }
}

/// Client settings: which gateway to dial, which tunnel to claim, where to forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Gateway base URL (default "http://127.0.0.1:15151"). Overridden by BACKHAUL_SERVER env.
    #[serde(default = "default_server")]
    pub server: String,

    /// Tunnel name. When absent a fresh one is requested from the gateway. Overridden by BACKHAUL_TUNNEL env.
    #[serde(default)]
    pub tunnel: Option<String>,

    /// Local target base URL requests are executed against (default "http://127.0.0.1:3000").
    #[serde(default = "default_target")]
    pub target: String,

    /// Fixed delay between reconnect attempts in milliseconds (default 3000).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_server() -> String {
    "http://127.0.0.1:15151".to_string()
}

fn default_target() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            tunnel: None,
            target: default_target(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl ClientConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the gateway URL: env BACKHAUL_SERVER overrides config.
pub fn resolve_server(config: &Config) -> String {
    non_empty_env("BACKHAUL_SERVER")
        .unwrap_or_else(|| config.client.server.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve the tunnel name: env BACKHAUL_TUNNEL overrides config.
pub fn resolve_tunnel(config: &Config) -> Option<String> {
    non_empty_env("BACKHAUL_TUNNEL").or_else(|| {
        config
            .client
            .tunnel
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// WebSocket URL the client dials for `tunnel`: http(s) becomes ws(s).
pub fn connect_url(server: &str, tunnel: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    let ws = if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        server.to_string()
    };
    format!("{}/api/tunnels/{}/connect", ws, tunnel)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("BACKHAUL_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".backhaul").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
