use std::borrow::Cow;

use axum::http::HeaderMap;

/// Expands the `:PORT` shorthand (all interfaces) to `0.0.0.0:PORT`, which
/// `TcpListener::bind` accepts; anything else is only trimmed.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    match addr.trim() {
        port_only if port_only.starts_with(':') => Cow::Owned(format!("0.0.0.0{port_only}")),
        other => Cow::Borrowed(other),
    }
}

/// First `X-Forwarded-For` value, when the responder sits behind a proxy.
pub fn forwarded_for(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
