//! Relay Session

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use serde::{Deserialize, Serialize};
use tracing::{info, debug};

/// Which endpoint of a session is being read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// The accepted (or, for the agent, freshly dialed) plain connection
    Local,
    /// The far side: a plain connection or the framed control channel
    Remote,
}

impl Side {
    /// The opposite side
    pub fn other(self) -> Self {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// Half-close flags and read direction of a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub local_closed: bool,
    pub remote_closed: bool,
    pub direction: Side,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            local_closed: false,
            remote_closed: false,
            direction: Side::Local,
        }
    }

    pub fn is_closed(&self, side: Side) -> bool {
        match side {
            Side::Local => self.local_closed,
            Side::Remote => self.remote_closed,
        }
    }

    pub fn mark_closed(&mut self, side: Side) {
        match side {
            Side::Local => self.local_closed = true,
            Side::Remote => self.remote_closed = true,
        }
    }

    pub fn flip(&mut self) {
        self.direction = self.direction.other();
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents one forwarded connection
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub start_time: Instant,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
}

/// Statistics for a completed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub session_id: String,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub start_time: std::time::SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
}

impl RelaySession {
    /// Create a new relay session with a random id
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), local_addr, remote_addr)
    }

    /// Create a new relay session with a given id
    pub fn with_id(session_id: String, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        debug!("Creating new relay session: {} ({} <-> {})",
               session_id, local_addr, remote_addr);

        Self {
            session_id,
            local_addr,
            remote_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Bytes moved from the local side to the remote side
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes moved from the remote side to the local side
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Count bytes read from `from` and delivered to the other side
    pub fn record_transfer(&self, from: Side, bytes: usize) {
        let counter = match from {
            Side::Local => &self.bytes_up,
            Side::Remote => &self.bytes_down,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Generate connection statistics
    pub fn to_stats(&self) -> ConnectionStats {
        let duration = self.duration();
        let start_time = std::time::SystemTime::now() - duration;

        ConnectionStats {
            session_id: self.session_id.clone(),
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            start_time,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
        }
    }

    /// Log session statistics
    pub fn log_stats(&self, reason: &str) {
        info!(
            session_id = %self.session_id,
            local_addr = %self.local_addr,
            remote_addr = %self.remote_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            reason = reason,
            "Relay session completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let mut state = SessionState::new();
        assert_eq!(state.direction, Side::Local);
        assert!(!state.is_closed(Side::Local));

        state.mark_closed(Side::Local);
        state.flip();
        assert!(state.local_closed);
        assert!(!state.remote_closed);
        assert_eq!(state.direction, Side::Remote);
    }

    #[test]
    fn test_transfer_counters() {
        let session = RelaySession::new(
            "127.0.0.1:1000".parse().unwrap(),
            "127.0.0.1:2000".parse().unwrap(),
        );
        session.record_transfer(Side::Local, 10);
        session.record_transfer(Side::Remote, 5);
        session.record_transfer(Side::Local, 1);

        let stats = session.to_stats();
        assert_eq!(stats.bytes_up, 11);
        assert_eq!(stats.bytes_down, 5);
        assert_eq!(stats.total_bytes, 16);
        assert_eq!(stats.session_id.len(), 36);
    }
}
