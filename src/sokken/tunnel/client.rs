use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::{TcpListener, TcpStream};

use crate::sokken::{
    config::{RoleKind, TunnelRoute},
    net,
    telemetry::{self, SharedSessions},
    tunnel::{admission::Admission, error::TunnelError, handshake, session::Session},
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Shared by every route of the initiator.
pub struct ClientState {
    pub admission: Arc<Admission>,
    pub sessions: SharedSessions,
    pub dial_timeout: Duration,
}

/// A route whose local listener is already bound.
pub struct BoundRoute {
    pub route: TunnelRoute,
    pub listener: TcpListener,
}

impl BoundRoute {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Binds every route's local listener before anything is served, so a bad
/// address fails startup instead of a single route.
pub async fn bind_routes(routes: &[TunnelRoute]) -> Result<Vec<BoundRoute>, TunnelError> {
    let mut out = Vec::with_capacity(routes.len());
    for route in routes {
        let bind_addr = net::normalize_bind_addr(&route.local_addr);
        let listener = TcpListener::bind(bind_addr.as_ref())
            .await
            .map_err(|source| TunnelError::Listen {
                addr: route.local_addr.clone(),
                source,
            })?;
        let bound = BoundRoute {
            route: route.clone(),
            listener,
        };
        if let Ok(addr) = bound.local_addr() {
            tracing::info!(local_addr = %addr, remote = %route.remote_url, "client: listening");
        }
        out.push(bound);
    }
    Ok(out)
}

/// Accept loop of one route. Runs until the process exits.
pub async fn serve_route(bound: BoundRoute, state: Arc<ClientState>) -> anyhow::Result<()> {
    let BoundRoute { route, listener } = bound;
    let route = Arc::new(route);

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(local_addr = %route.local_addr, err = %err, "client: accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let st = state.clone();
        let route = route.clone();
        tokio::spawn(async move {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(client = %peer, local_addr = %route.local_addr, "client: accepted");
            }
            st.handle(conn, peer, &route).await;
        });
    }
}

impl ClientState {
    async fn handle(&self, conn: TcpStream, peer: SocketAddr, route: &TunnelRoute) {
        let Some(permit) = self.admission.try_admit() else {
            tracing::warn!(
                client = %peer,
                local_addr = %route.local_addr,
                max_connections = self.admission.max(),
                "client: rejecting, too many proxied connections"
            );
            return;
        };

        let sid = telemetry::new_session_id();
        let remote = match handshake::dial(&route.remote_url, self.dial_timeout).await {
            Ok(st) => st,
            Err(err) if err.is_capacity_rejection() => {
                tracing::warn!(sid = %sid, client = %peer, remote = %route.remote_url, "client: remote is at capacity");
                return;
            }
            Err(err) => {
                tracing::warn!(sid = %sid, client = %peer, remote = %route.remote_url, err = %err, "client: dial failed");
                return;
            }
        };

        let _ = conn.set_nodelay(true);
        let session = Session::start(
            self.sessions.clone(),
            permit,
            sid,
            RoleKind::Client.as_str(),
            peer.to_string(),
            route.remote_url.clone(),
        );
        session.relay(conn, remote).await;
    }
}
