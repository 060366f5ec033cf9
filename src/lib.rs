//! tunrelay Library
//!
//! TCP relays in two shapes: a bind relay that forwards every accepted connection to a
//! fixed target, and a reverse tunnel in which an agent without inbound reachability dials
//! out to a front-listener and carries forwarded sessions over one framed control
//! connection.

/// Log a lifecycle notice at info level when verbose, debug otherwise
#[macro_export]
macro_rules! lifecycle {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            ::tracing::info!($($arg)+);
        } else {
            ::tracing::debug!($($arg)+);
        }
    };
}

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod net;
pub mod protocol;
pub mod relay;
pub mod shutdown;
pub mod tunnel;

pub use config::Config;
pub use connection::BindRelay;
pub use error::{ProtocolError, RelayError};
pub use shutdown::ShutdownCoordinator;
pub use tunnel::{FrontListener, ReverseAgent};

/// Common error type for process-level operations
pub type Result<T> = anyhow::Result<T>;
