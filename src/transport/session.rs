//! Connection status and the per-client session record.

use tokio::time::{Duration, Instant};

/// State of the transport session.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Disconnected
///      ^              |
///      +--------------+  (attempt failed)
///
/// Disconnected -> Error  (reconnect budget exhausted, until reset)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    /// No connection; automatic reconnection may be pending.
    #[default]
    Disconnected,
    /// An attempt is in progress.
    Connecting,
    /// Upgraded and identified.
    Connected,
    /// The reconnect budget is exhausted. Only `reset()` leaves this state.
    Error,
}

/// Snapshot of the transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSession {
    /// Current status.
    pub status: ConnectionStatus,
    /// Server host used by the next attempt.
    pub host: String,
    /// Server port used by the next attempt.
    pub port: u16,
    /// Identifier sent in every outbound message.
    pub client_id: String,
    /// Consecutive failed automatic attempts since the last success.
    pub reconnect_attempts: u32,
    /// Time of the last successful send or receive.
    pub last_activity: Option<Instant>,
}

/// Mutable session record guarded by the client's state lock.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub status: ConnectionStatus,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub auto_reconnect: bool,
    pub reconnect_attempts: u32,
    pub last_activity: Option<Instant>,
    pub last_attempt: Option<Instant>,
    pub last_heartbeat: Option<Instant>,
    /// Bumped on every connect and disconnect so stale readers can tell.
    pub generation: u64,
}

impl SessionState {
    pub fn new(host: String, port: u16, client_id: String, auto_reconnect: bool) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            host,
            port,
            client_id,
            auto_reconnect,
            reconnect_attempts: 0,
            last_activity: None,
            last_attempt: None,
            last_heartbeat: None,
            generation: 0,
        }
    }

    pub fn snapshot(&self) -> TransportSession {
        TransportSession {
            status: self.status,
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            reconnect_attempts: self.reconnect_attempts,
            last_activity: self.last_activity,
        }
    }

    /// Whether an automatic attempt may start at `now`.
    pub fn reconnect_due(&self, now: Instant, interval: Duration) -> bool {
        self.status == ConnectionStatus::Disconnected
            && self.auto_reconnect
            && self
                .last_attempt
                .map_or(true, |t| now.duration_since(t) >= interval)
    }

    /// Whether a heartbeat should be sent at `now`.
    pub fn heartbeat_due(&self, now: Instant, interval: Duration) -> bool {
        self.status == ConnectionStatus::Connected
            && self
                .last_heartbeat
                .map_or(true, |t| now.duration_since(t) >= interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new("host".into(), 8080, "echo".into(), true)
    }

    #[test]
    fn test_initial_state() {
        let s = state();
        assert_eq!(s.status, ConnectionStatus::Disconnected);
        assert_eq!(s.reconnect_attempts, 0);
        let snap = s.snapshot();
        assert_eq!(snap.host, "host");
        assert_eq!(snap.port, 8080);
        assert_eq!(snap.last_activity, None);
    }

    #[test]
    fn test_reconnect_due_respects_interval() {
        let mut s = state();
        let now = Instant::now();
        let interval = Duration::from_secs(5);
        assert!(s.reconnect_due(now, interval));

        s.last_attempt = Some(now);
        assert!(!s.reconnect_due(now + Duration::from_secs(4), interval));
        assert!(s.reconnect_due(now + Duration::from_secs(5), interval));

        s.auto_reconnect = false;
        assert!(!s.reconnect_due(now + Duration::from_secs(60), interval));
    }

    #[test]
    fn test_no_reconnect_in_error() {
        let mut s = state();
        s.status = ConnectionStatus::Error;
        assert!(!s.reconnect_due(Instant::now(), Duration::ZERO));
    }

    #[test]
    fn test_heartbeat_due_only_when_connected() {
        let mut s = state();
        let now = Instant::now();
        let interval = Duration::from_secs(30);
        assert!(!s.heartbeat_due(now, interval));

        s.status = ConnectionStatus::Connected;
        s.last_heartbeat = Some(now);
        assert!(!s.heartbeat_due(now + Duration::from_secs(29), interval));
        assert!(s.heartbeat_due(now + Duration::from_secs(30), interval));
    }
}
