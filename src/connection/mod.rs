//! Bind Relay Module
//!
//! Accepts local TCP connections and forwards each one to a fixed target.

pub mod bind;

pub use bind::BindRelay;
