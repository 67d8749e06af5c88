use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, task::JoinSet};

use crate::sokken::{
    api,
    config::{self, Role},
    logging, net, telemetry,
    tunnel::{
        admission::Admission,
        allowlist::Allowlist,
        client::{self, ClientState},
        server::{self, ServerState},
    },
};

pub async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::info!(
        role = cfg.role.name(),
        api_addr = %cfg.api_addr,
        max_connections = cfg.max_connections,
        dial_timeout = %humantime::format_duration(cfg.dial_timeout),
        "sokken: starting"
    );

    let prometheus = match telemetry::init_prometheus() {
        Ok(h) => Some(Arc::new(h)),
        Err(err) => {
            tracing::warn!(err = %err, "metrics: recorder unavailable, /metrics disabled");
            None
        }
    };

    let admission = Admission::new(cfg.max_connections);
    let sessions = Arc::new(telemetry::SessionRegistry::new());

    let mut app = api::router(api::ApiState {
        role: cfg.role.kind(),
        admission: admission.clone(),
        sessions: sessions.clone(),
        prometheus,
    });

    let mut tasks = JoinSet::new();

    match &cfg.role {
        Role::Server { targets } => {
            let allowlist = Allowlist::new(targets.iter().cloned());
            tracing::info!(count = allowlist.len(), targets = ?allowlist.sorted(), "server: allowed targets");
            app = app.merge(server::router(ServerState {
                admission: admission.clone(),
                allowlist: Arc::new(allowlist),
                sessions: sessions.clone(),
                dial_timeout: cfg.dial_timeout,
            }));
        }
        Role::Client { routes } => {
            let bound = client::bind_routes(routes).await?;
            let state = Arc::new(ClientState {
                admission: admission.clone(),
                sessions: sessions.clone(),
                dial_timeout: cfg.dial_timeout,
            });
            for b in bound {
                tasks.spawn(client::serve_route(b, state.clone()));
            }
        }
    }

    let bind_addr = net::normalize_bind_addr(&cfg.api_addr);
    let listener = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind api {}", cfg.api_addr))?;
    tasks.spawn(api::serve(listener, app));

    // No drain: open sessions are dropped with the runtime.
    tokio::select! {
        sig = shutdown_signal() => {
            let sig = sig?;
            tracing::warn!(signal = sig, "shutdown: got signal, exiting");
            anyhow::bail!("got signal {sig}, exiting")
        }
        res = tasks.join_next() => match res {
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
            Some(Ok(Ok(()))) | None => anyhow::bail!("sokken: server task stopped unexpectedly"),
        },
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut hup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("install SIGINT handler")?;
            Ok("interrupt")
        }
        _ = term.recv() => Ok("terminated"),
        _ = hup.recv() => Ok("hangup"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("install ctrl-c handler")?;
    Ok("interrupt")
}
