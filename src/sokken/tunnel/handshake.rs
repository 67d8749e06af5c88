use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        self,
        client::IntoClientRequest,
        error::ProtocolError,
        http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
    },
};

use crate::sokken::tunnel::{error::TunnelError, stream::WsByteStream};

/// Sub-protocol both ends must agree on; anything else is not tunnel traffic.
pub const SUBPROTOCOL: &str = "sokken";

const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub type ClientStream = WsByteStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
pub type ServerStream = WsByteStream<WebSocket>;

/// Opens the tunnel transport towards a responder (`ws://host:port/tunnel/<destination>`).
///
/// A zero `timeout` disables the deadline.
pub async fn dial(url: &str, timeout: Duration) -> Result<ClientStream, TunnelError> {
    let mut req = url
        .into_client_request()
        .map_err(|err| dial_error(url, err))?;
    req.headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

    let connect = tokio_tungstenite::connect_async(req);
    let res = if timeout > Duration::from_millis(0) {
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TunnelError::DialTimeout {
                addr: url.to_string(),
                timeout,
            })?
    } else {
        connect.await
    };
    let (mut ws, resp) = res.map_err(|err| dial_error(url, err))?;

    let selected = resp
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if selected.as_deref() != Some(SUBPROTOCOL) {
        let _ = ws.close(None).await;
        return Err(TunnelError::UnsupportedProtocol { selected });
    }

    Ok(WsByteStream::new(ws))
}

fn dial_error(url: &str, err: tungstenite::Error) -> TunnelError {
    match err {
        tungstenite::Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(_)) => {
            TunnelError::UnsupportedProtocol { selected: None }
        }
        tungstenite::Error::Http(resp) => TunnelError::Dial {
            addr: url.to_string(),
            reason: format!("upgrade refused with HTTP {}", resp.status()),
            status: Some(resp.status().as_u16()),
        },
        other => TunnelError::Dial {
            addr: url.to_string(),
            reason: other.to_string(),
            status: None,
        },
    }
}

/// Checks the sub-protocol the responder selected during the upgrade.
///
/// The upgrade only ever offers [`SUBPROTOCOL`], so no selection means the peer did
/// not ask for it.
pub fn negotiate(ws: &WebSocket) -> Result<(), TunnelError> {
    let selected = ws.protocol().and_then(|v| v.to_str().ok());
    match selected {
        Some(p) if p == SUBPROTOCOL => Ok(()),
        other => Err(TunnelError::UnsupportedProtocol {
            selected: other.map(str::to_string),
        }),
    }
}

/// Closes an upgraded connection with a status and a reason the peer can read.
///
/// Waits briefly for the peer's close reply so the frame is not lost to a reset.
pub async fn close_with(mut ws: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    if ws.send(Message::Close(Some(frame))).await.is_err() {
        return;
    }
    let drain = async {
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await;
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };
    use tokio_tungstenite::tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    };

    use super::*;

    /// Accepts one upgrade and answers with `protocol` (or refuses with `refuse`).
    async fn one_shot_server(
        protocol: Option<&'static str>,
        refuse: Option<StatusCode>,
    ) -> (String, tokio::task::JoinHandle<()>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (s, _) = ln.accept().await.unwrap();
            let cb = move |_req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                if let Some(status) = refuse {
                    let mut err = ErrorResponse::new(Some("refused".to_string()));
                    *err.status_mut() = status;
                    return Err(err);
                }
                if let Some(p) = protocol {
                    resp.headers_mut()
                        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(p));
                }
                Ok(resp)
            };
            let Ok(ws) = tokio_tungstenite::accept_hdr_async(s, cb).await else {
                return;
            };
            // Echo bytes back until the client goes away.
            let mut st = WsByteStream::new(ws);
            let mut buf = [0u8; 64];
            while let Ok(n) = st.read(&mut buf).await {
                if n == 0 || st.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                let _ = st.flush().await;
            }
        });
        (format!("ws://{addr}/tunnel/127.0.0.1:9000"), task)
    }

    #[tokio::test]
    async fn dial_negotiates_subprotocol_and_carries_bytes() {
        let (url, server) = one_shot_server(Some(SUBPROTOCOL), None).await;
        let mut st = dial(&url, Duration::from_secs(2)).await.expect("dial");

        st.write_all(b"ping").await.unwrap();
        st.flush().await.unwrap();
        let mut got = [0u8; 4];
        st.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        st.shutdown().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_rejects_missing_subprotocol() {
        let (url, _server) = one_shot_server(None, None).await;
        let err = dial(&url, Duration::from_secs(2)).await.err().expect("must fail");
        assert!(
            matches!(err, TunnelError::UnsupportedProtocol { .. }),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn dial_rejects_other_subprotocol() {
        let (url, _server) = one_shot_server(Some("chat"), None).await;
        let err = dial(&url, Duration::from_secs(2)).await.err().expect("must fail");
        assert!(
            matches!(err, TunnelError::UnsupportedProtocol { .. }),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn dial_reports_http_refusal_status() {
        let (url, _server) = one_shot_server(None, Some(StatusCode::TOO_MANY_REQUESTS)).await;
        let err = dial(&url, Duration::from_secs(2)).await.err().expect("must fail");
        assert!(err.is_capacity_rejection(), "got {err:?}");
    }

    #[tokio::test]
    async fn dial_times_out_on_silent_peer() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (s, _) = ln.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(s);
        });

        let url = format!("ws://{addr}/tunnel/x:1");
        let err = dial(&url, Duration::from_millis(200)).await.err().expect("must fail");
        assert!(matches!(err, TunnelError::DialTimeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn dial_unreachable_is_dial_error() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);

        let url = format!("ws://{addr}/tunnel/x:1");
        let err = dial(&url, Duration::from_secs(2)).await.err().expect("must fail");
        assert!(
            matches!(err, TunnelError::Dial { status: None, .. }),
            "got {err:?}"
        );
    }
}
