//! Configuration Module
//! 
//! Handles configuration loading, validation, and management.

pub mod manager;
pub mod types;

pub use manager::{validate_host_port, ConfigManager};
pub use types::*;
