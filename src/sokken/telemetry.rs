use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs the process-wide recorder behind every `sokken_*` metric; the handle
/// renders `/metrics`. A second install fails.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// A relay session that is currently moving bytes.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub role: &'static str,
    pub client: String,
    pub destination: String,
    pub started_at_unix_ms: u64,
}

/// Live relays keyed by session id, listed by `/sessions`.
///
/// A [`Session`](crate::sokken::tunnel::session::Session) adds itself once its
/// transport is up and removes itself when dropped.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn add(&self, s: SessionInfo) {
        self.sessions.insert(s.id.clone(), s);
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Oldest session first.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self.sessions.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|s| s.started_at_unix_ms);
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Process-unique id for log correlation: `s1`, `s2`, ...
pub fn new_session_id() -> String {
    static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);
    format!("s{}", NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
}

pub type SharedSessions = Arc<SessionRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
