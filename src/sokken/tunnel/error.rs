use std::time::Duration;

use thiserror::Error;

/// Failures of a single tunnel session (or of binding a route at startup).
///
/// Only `Listen` is fatal; everything else is contained in the session task that
/// produced it and ends up in a log line.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("listen {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dial {addr}: {reason}")]
    Dial {
        addr: String,
        reason: String,
        /// HTTP status returned by the peer when it refused the upgrade.
        status: Option<u16>,
    },
    #[error("dial {addr}: timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("peer not using sokken subprotocol (selected {selected:?})")]
    UnsupportedProtocol { selected: Option<String> },
    #[error("target address not allowed: {0}")]
    Authorization(String),
    #[error("relay io: {0}")]
    RelayIo(#[from] std::io::Error),
}

impl TunnelError {
    /// True when the remote responder refused the upgrade because it is at capacity.
    pub fn is_capacity_rejection(&self) -> bool {
        matches!(self, TunnelError::Dial { status: Some(429), .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rejection_is_recognized() {
        let e = TunnelError::Dial {
            addr: "ws://127.0.0.1:1/tunnel/x".into(),
            reason: "HTTP error: 429 Too Many Requests".into(),
            status: Some(429),
        };
        assert!(e.is_capacity_rejection());

        let e = TunnelError::Dial {
            addr: "ws://127.0.0.1:1/tunnel/x".into(),
            reason: "connection refused".into(),
            status: None,
        };
        assert!(!e.is_capacity_rejection());
    }

    #[test]
    fn dial_timeout_message_is_human_readable() {
        let e = TunnelError::DialTimeout {
            addr: "ws://example.invalid/tunnel/a:1".into(),
            timeout: Duration::from_secs(3),
        };
        assert_eq!(
            e.to_string(),
            "dial ws://example.invalid/tunnel/a:1: timed out after 3s"
        );
    }
}
