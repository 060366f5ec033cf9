//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub bind: BindConfig,
    pub agent: AgentConfig,
    pub listener: ListenerConfig,
    pub monitoring: MonitoringConfig,
}

/// Settings shared by every role
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Largest chunk moved per read
    pub buffer_size: usize,
    /// How long one direction waits for data before the turn passes to the other
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub listen_backlog: u32,
    /// Upper bound on concurrent sessions when the bind relay runs concurrently
    pub max_sessions: usize,
}

/// Bind relay: listen locally, forward every connection to a fixed target
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BindConfig {
    pub listen_addr: String,
    pub target_addr: String,
    /// Serve accepted connections concurrently instead of one at a time
    pub concurrent: bool,
}

/// Reverse agent: dial out to the front-listener, forward to the destination on CONNECT
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub control_addr: String,
    pub destination_addr: String,
}

/// Front-listener: accept the agent on the control address, operators on the local address
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub control_addr: String,
    pub local_addr: String,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// Lifecycle notices at info level; otherwise they are logged at debug
    pub verbose: bool,
    pub metrics_addr: Option<SocketAddr>,
}

/// The relay roles a process can run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Bind,
    Agent,
    Listener,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Bind => write!(f, "bind"),
            Role::Agent => write!(f, "agent"),
            Role::Listener => write!(f, "listener"),
        }
    }
}

/// Values supplied on the command line; `None` keeps the configured value
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_listen: Option<String>,
    pub bind_target: Option<String>,
    pub bind_concurrent: bool,
    pub agent_control: Option<String>,
    pub agent_destination: Option<String>,
    pub listener_control: Option<String>,
    pub listener_local: Option<String>,
    pub buffer_size: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            bind: BindConfig::default(),
            agent: AgentConfig::default(),
            listener: ListenerConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            poll_interval: Duration::from_millis(5),
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            listen_backlog: 25,
            max_sessions: 64,
        }
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            target_addr: "127.0.0.1:80".to_string(),
            concurrent: false,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_addr: "127.0.0.1:4444".to_string(),
            destination_addr: "127.0.0.1:80".to_string(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            control_addr: "0.0.0.0:4444".to_string(),
            local_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            verbose: true,
            metrics_addr: None,
        }
    }
}
