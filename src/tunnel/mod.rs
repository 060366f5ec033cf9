//! Reverse Tunnel Module
//!
//! The agent runs next to the destination and dials out to the front-listener. The
//! front-listener turns every local connection into a CONNECT on that single control
//! connection and relays the session over it.

pub mod agent;
pub mod listener;

pub use agent::ReverseAgent;
pub use listener::FrontListener;

use crate::error::RelayError;
use crate::relay::TerminationReason;

/// The error that ends a tunneled role after a session, if the control channel is gone
pub(crate) fn channel_failure(reason: &TerminationReason) -> Option<RelayError> {
    match reason {
        TerminationReason::Protocol(e) if !e.is_recoverable() => Some(RelayError::Protocol(e.clone())),
        TerminationReason::ChannelLost => Some(RelayError::ChannelClosed),
        _ => None,
    }
}
