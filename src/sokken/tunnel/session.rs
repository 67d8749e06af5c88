use tokio::io::{AsyncRead, AsyncWrite};

use crate::sokken::{
    telemetry::{self, SessionInfo, SharedSessions},
    tunnel::{
        admission::AdmissionPermit,
        relay::{self, RelayStats},
    },
};

/// An admitted session from the moment its transport is established.
///
/// Holds the admission slot and the registry entry; both are released when the
/// session is dropped, whichever way it ends.
pub struct Session {
    info: SessionInfo,
    sessions: SharedSessions,
    permit: AdmissionPermit,
}

impl Session {
    pub fn start(
        sessions: SharedSessions,
        permit: AdmissionPermit,
        id: String,
        role: &'static str,
        client: String,
        destination: String,
    ) -> Self {
        let info = SessionInfo {
            id,
            role,
            client,
            destination,
            started_at_unix_ms: telemetry::now_unix_ms(),
        };
        sessions.add(info.clone());
        Self {
            info,
            sessions,
            permit,
        }
    }

    /// Relays between the side the connection came from (`near`) and the side it
    /// is going to (`far`), then logs how it went.
    pub async fn relay<A, B>(self, near: A, far: B) -> RelayStats
    where
        A: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        tracing::info!(
            sid = %self.info.id,
            client = %self.info.client,
            target = %self.info.destination,
            active_connections = self.permit.active(),
            "relay: start"
        );

        let stats = relay::relay(near, far).await;

        if let Some(err) = &stats.error {
            tracing::info!(sid = %self.info.id, err = %err, "relay: connection closed");
        }

        metrics::counter!("sokken_bytes_up_total").increment(stats.a_to_b);
        metrics::counter!("sokken_bytes_down_total").increment(stats.b_to_a);
        metrics::histogram!("sokken_relay_duration_seconds").record(stats.elapsed.as_secs_f64());

        let sid = self.info.id.clone();
        drop(self);

        tracing::info!(
            sid = %sid,
            bytes_up = stats.a_to_b,
            bytes_down = stats.b_to_a,
            ended_by = %stats.ended_by,
            duration_ms = stats.elapsed.as_millis() as u64,
            "relay: end, lasted {}",
            humantime::format_duration(stats.elapsed)
        );
        stats
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.sessions.remove(&self.info.id);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::sokken::{telemetry::SessionRegistry, tunnel::admission::Admission};

    #[tokio::test]
    async fn session_releases_slot_and_registry_entry() {
        let adm = Admission::new(1);
        let sessions = Arc::new(SessionRegistry::new());

        let permit = adm.try_admit().unwrap();
        let sess = Session::start(
            sessions.clone(),
            permit,
            "s-test".into(),
            "client",
            "127.0.0.1:1".into(),
            "ws://x/tunnel/y:1".into(),
        );
        assert_eq!(sessions.len(), 1);
        assert!(adm.try_admit().is_none());

        let (mut near_peer, near) = tokio::io::duplex(64);
        let (far, mut far_peer) = tokio::io::duplex(64);
        let task = tokio::spawn(sess.relay(near, far));

        near_peer.write_all(b"abc").await.unwrap();
        let mut got = [0u8; 3];
        far_peer.read_exact(&mut got).await.unwrap();
        drop(near_peer);

        let stats = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.a_to_b, 3);
        assert_eq!(sessions.len(), 0);
        assert_eq!(adm.active(), 0);
    }

    #[test]
    fn dropping_unstarted_session_cleans_up() {
        let adm = Admission::new(1);
        let sessions = Arc::new(SessionRegistry::new());
        let sess = Session::start(
            sessions.clone(),
            adm.try_admit().unwrap(),
            "s-drop".into(),
            "server",
            "peer".into(),
            "127.0.0.1:9000".into(),
        );
        drop(sess);
        assert_eq!(sessions.len(), 0);
        assert_eq!(adm.active(), 0);
    }
}
