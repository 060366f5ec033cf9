//! Metrics Module
//! 
//! Handles metrics collection and export.

pub mod collector;
pub mod server;

pub use collector::{Metrics, SessionGuard};
pub use server::MetricsServer;
