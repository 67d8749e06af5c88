use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::sokken::{
    config::RoleKind,
    telemetry,
    tunnel::admission::Admission,
};

#[derive(Clone)]
pub struct ApiState {
    pub role: RoleKind,
    pub admission: Arc<Admission>,
    pub sessions: telemetry::SharedSessions,
    pub prometheus: Option<telemetry::SharedPrometheusHandle>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .with_state(Arc::new(state))
}

/// Serves `app` on an already bound listener until the process exits.
pub async fn serve(listener: TcpListener, app: Router) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("api: local addr")?;
    tracing::info!(api_addr = %addr, "api: listening");

    let app = app.layer(TraceLayer::new_for_http());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("api: serve")?;

    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum HealthInfo {
    Server {
        connections: usize,
        #[serde(rename = "max-connections")]
        max_connections: usize,
        #[serde(rename = "connections-capacity-percent")]
        capacity_percent: usize,
    },
    Client {
        connections: usize,
        #[serde(rename = "max-connections")]
        max_connections: usize,
        #[serde(rename = "connections-used-percent")]
        used_percent: f64,
    },
}

impl HealthInfo {
    fn new(role: RoleKind, connections: usize, max_connections: usize) -> Self {
        match role {
            RoleKind::Server => HealthInfo::Server {
                connections,
                max_connections,
                capacity_percent: (connections as u128 * 100)
                    .checked_div(max_connections as u128)
                    .unwrap_or(0) as usize,
            },
            RoleKind::Client => HealthInfo::Client {
                connections,
                max_connections,
                used_percent: if max_connections == 0 {
                    0.0
                } else {
                    connections as f64 / max_connections as f64
                },
            },
        }
    }
}

fn health_body(info: &HealthInfo) -> serde_json::Result<String> {
    let mut body = serde_json::to_string_pretty(info)?;
    body.push('\n');
    Ok(body)
}

async fn health(State(st): State<Arc<ApiState>>) -> Response {
    let (active, max) = st.admission.snapshot();
    match health_body(&HealthInfo::new(st.role, active, max)) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            tracing::error!(err = %err, "api: marshal health info");
            (StatusCode::INTERNAL_SERVER_ERROR, "unable to marshal health info").into_response()
        }
    }
}

async fn metrics(State(st): State<Arc<ApiState>>) -> Response {
    match &st.prometheus {
        Some(h) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            h.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn sessions(State(st): State<Arc<ApiState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.sessions.snapshot()))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::sokken::telemetry::SessionRegistry;

    #[test]
    fn server_health_reports_integer_capacity() {
        let body = health_body(&HealthInfo::new(RoleKind::Server, 1, 3)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["connections"], 1);
        assert_eq!(v["max-connections"], 3);
        assert_eq!(v["connections-capacity-percent"], 33);
        assert!(v.get("connections-used-percent").is_none());
        assert!(body.ends_with("}\n"));
        assert!(body.contains("\n  \"connections\": 1"));
    }

    #[test]
    fn client_health_reports_fractional_usage() {
        let body = health_body(&HealthInfo::new(RoleKind::Client, 1, 4)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["connections"], 1);
        assert_eq!(v["max-connections"], 4);
        assert_eq!(v["connections-used-percent"], 0.25);
        assert!(v.get("connections-capacity-percent").is_none());
    }

    #[test]
    fn huge_budget_does_not_overflow() {
        let body =
            health_body(&HealthInfo::new(RoleKind::Server, usize::MAX / 2, usize::MAX)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["connections-capacity-percent"], 49);

        let body = health_body(&HealthInfo::new(RoleKind::Client, 0, usize::MAX)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["connections-used-percent"], 0.0);
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        conn.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        conn.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn endpoints_over_http() {
        let admission = Admission::new(2);
        let _held = admission.try_admit().unwrap();
        let state = ApiState {
            role: RoleKind::Server,
            admission: admission.clone(),
            sessions: Arc::new(SessionRegistry::new()),
            prometheus: None,
        };
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(serve(ln, router(state)));

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"), "{health}");
        assert!(health.contains("\"connections-capacity-percent\": 50"), "{health}");

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 404"), "{metrics}");

        let sessions = get(addr, "/sessions").await;
        assert!(sessions.starts_with("HTTP/1.1 200"), "{sessions}");
        assert!(sessions.ends_with("[]"), "{sessions}");
    }
}
