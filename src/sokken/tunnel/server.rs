use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{
        ConnectInfo, Path, State,
        ws::{WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpStream;

use crate::sokken::{
    config::RoleKind,
    net,
    telemetry::{self, SharedSessions},
    tunnel::{
        admission::{Admission, AdmissionPermit},
        allowlist::Allowlist,
        error::TunnelError,
        handshake::{self, SUBPROTOCOL, ServerStream},
        session::Session,
        stream::WsByteStream,
    },
};

/// Everything the responder needs per inbound tunnel request.
pub struct ServerState {
    pub admission: Arc<Admission>,
    pub allowlist: Arc<Allowlist>,
    pub sessions: SharedSessions,
    pub dial_timeout: Duration,
}

/// Routes served by the responder on the API address, next to the API itself.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/tunnel/{*destination}", get(tunnel))
        .with_state(Arc::new(state))
}

async fn tunnel(
    State(st): State<Arc<ServerState>>,
    Path(destination): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let forwarded_for = net::forwarded_for(&headers).map(str::to_string);

    let Some(permit) = st.admission.try_admit() else {
        tracing::warn!(
            client = %peer,
            forwarded_for = ?forwarded_for,
            target = %destination,
            max_connections = st.admission.max(),
            "tunnel: rejecting, too many proxied connections"
        );
        return (StatusCode::TOO_MANY_REQUESTS, "too many proxied connections").into_response();
    };

    let sid = telemetry::new_session_id();
    tracing::debug!(
        sid = %sid,
        client = %peer,
        forwarded_for = ?forwarded_for,
        target = %destination,
        "tunnel: upgrading"
    );

    let failed_sid = sid.clone();
    ws.protocols([SUBPROTOCOL])
        .on_failed_upgrade(move |err: axum::Error| {
            let err = TunnelError::Handshake(err.to_string());
            tracing::warn!(sid = %failed_sid, client = %peer, err = %err, "tunnel: upgrade failed");
        })
        .on_upgrade(move |socket| async move {
            let res = accept(&st, socket, permit, &sid, peer.to_string(), &destination).await;
            if let Err(err) = res {
                tracing::warn!(sid = %sid, client = %peer, target = %destination, err = %err, "tunnel: session failed");
            }
        })
}

/// Drives one upgraded request: sub-protocol check, authorization, dial, relay.
///
/// Rejections are reported to the peer with a close frame before returning.
async fn accept(
    st: &ServerState,
    ws: WebSocket,
    permit: AdmissionPermit,
    sid: &str,
    client: String,
    destination: &str,
) -> Result<(), TunnelError> {
    if let Err(err) = handshake::negotiate(&ws) {
        handshake::close_with(ws, close_code::POLICY, "client not using sokken subprotocol").await;
        return Err(err);
    }

    if !st.allowlist.is_allowed(destination) {
        handshake::close_with(ws, close_code::ERROR, "target address not allowed").await;
        return Err(TunnelError::Authorization(destination.to_string()));
    }

    let target = match dial_target(destination, st.dial_timeout).await {
        Ok(c) => c,
        Err(err) => {
            handshake::close_with(ws, close_code::ERROR, "failed to dial target").await;
            return Err(err);
        }
    };

    let session = Session::start(
        st.sessions.clone(),
        permit,
        sid.to_string(),
        RoleKind::Server.as_str(),
        client,
        destination.to_string(),
    );
    let near: ServerStream = WsByteStream::new(ws);
    session.relay(near, target).await;
    Ok(())
}

async fn dial_target(addr: &str, timeout: Duration) -> Result<TcpStream, TunnelError> {
    let connect = TcpStream::connect(addr);
    let res = if timeout > Duration::from_millis(0) {
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TunnelError::DialTimeout {
                addr: addr.to_string(),
                timeout,
            })?
    } else {
        connect.await
    };
    let c = res.map_err(|err| TunnelError::Dial {
        addr: addr.to_string(),
        reason: err.to_string(),
        status: None,
    })?;
    let _ = c.set_nodelay(true);
    Ok(c)
}
