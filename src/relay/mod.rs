//! Data Relay Module
//! 
//! Handles bidirectional data relay between a local connection and its remote counterpart.

pub mod endpoint;
pub mod pump;
pub mod session;

pub use endpoint::{Endpoint, Inbound};
pub use pump::{DuplexPump, PumpOutcome, TerminationReason, DEFAULT_POLL_INTERVAL};
pub use session::{ConnectionStats, RelaySession, SessionState, Side};
