//! Relay Error Types

use std::io;

use thiserror::Error;

/// Malformed or truncated control channel traffic.
///
/// Every variant is handled as if the peer had sent CLOSE and ends the current session.
/// Recoverable variants leave the channel on a frame boundary, so it keeps carrying
/// later sessions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown frame command: {0:#04x}")]
    UnknownCommand(u8),
    #[error("frame payload too large: {0} bytes")]
    PayloadTooLarge(u32),
    #[error("{command} frame carries unexpected payload of {len} bytes")]
    UnexpectedPayload { command: &'static str, len: u32 },
    #[error("truncated frame: expected {expected} bytes, stream ended after {received}")]
    Truncated { expected: usize, received: usize },
}

impl ProtocolError {
    /// Whether the offending frame was consumed whole and the channel is still aligned
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownCommand(_) | ProtocolError::UnexpectedPayload { .. }
        )
    }
}

/// Errors raised by the relay roles and the duplex pump
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("control channel closed by peer")]
    ChannelClosed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Build a bind error for the given address
    pub fn bind(addr: impl ToString, source: io::Error) -> Self {
        RelayError::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Build a connect error for the given address
    pub fn connect(addr: impl ToString, source: io::Error) -> Self {
        RelayError::Connect {
            addr: addr.to_string(),
            source,
        }
    }

    /// "No data yet" conditions that only flip the pump's read direction
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }

    /// Errors after which the peer is considered gone, as if it had sent CLOSE
    pub fn is_close_equivalent(&self) -> bool {
        matches!(self, RelayError::Protocol(_) | RelayError::ChannelClosed)
    }
}

/// Classify an I/O error as transient (would block) rather than hard
pub fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
