//! Inbound routing: which tunnel a public request belongs to, and the path forwarded to it.
//!
//! Path routing: `{prefix}/{name}/rest?q` goes to tunnel `name` as `/rest?q`.
//! Host routing: `name.{base_domain}` goes to tunnel `name` with the path unchanged.

/// A resolved inbound request: tunnel name and the path+query to forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub tunnel: String,
    pub path: String,
}

/// Tunnel names are single DNS-label-like tokens so they work in both routing modes.
pub fn is_valid_tunnel_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Resolve `{prefix}/{name}/...`; the prefix must already be normalized (leading slash, no trailing slash).
pub fn route_by_path(prefix: &str, path: &str, query: Option<&str>) -> Option<Route> {
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
    let (name, tail) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if !is_valid_tunnel_name(name) {
        return None;
    }
    Some(Route {
        tunnel: name.to_string(),
        path: with_query(tail, query),
    })
}

/// Resolve `name.{base_domain}` from a Host header value (port ignored).
pub fn route_by_host(base_domain: &str, host: &str, path: &str, query: Option<&str>) -> Option<Route> {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let base = base_domain.trim().trim_start_matches('.').to_ascii_lowercase();
    let name = host.strip_suffix(&base)?.strip_suffix('.')?;
    if !is_valid_tunnel_name(name) {
        return None;
    }
    Some(Route {
        tunnel: name.to_string(),
        path: with_query(if path.is_empty() { "/" } else { path }, query),
    })
}

fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    }
}

/// Fresh tunnel name: 12 lowercase hex characters from a v4 UUID.
pub fn generate_tunnel_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}
