//! Configuration Manager

use super::{CliOverrides, Config, Role};
use crate::net::normalize_bind_addr;
use crate::Result;
use anyhow::{Context, bail};
use std::path::Path;
use std::net::SocketAddr;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config.validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(addr) = std::env::var("TUNRELAY_BIND_LISTEN") {
            config.bind.listen_addr = addr;
        }

        if let Ok(addr) = std::env::var("TUNRELAY_BIND_TARGET") {
            config.bind.target_addr = addr;
        }

        if let Ok(concurrent) = std::env::var("TUNRELAY_BIND_CONCURRENT") {
            config.bind.concurrent = concurrent.parse::<bool>()
                .with_context(|| format!("Invalid TUNRELAY_BIND_CONCURRENT: {}", concurrent))?;
        }

        if let Ok(addr) = std::env::var("TUNRELAY_AGENT_CONTROL") {
            config.agent.control_addr = addr;
        }

        if let Ok(addr) = std::env::var("TUNRELAY_AGENT_DESTINATION") {
            config.agent.destination_addr = addr;
        }

        if let Ok(addr) = std::env::var("TUNRELAY_LISTENER_CONTROL") {
            config.listener.control_addr = addr;
        }

        if let Ok(addr) = std::env::var("TUNRELAY_LISTENER_LOCAL") {
            config.listener.local_addr = addr;
        }

        if let Ok(buffer_size) = std::env::var("TUNRELAY_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size.parse::<usize>()
                .with_context(|| format!("Invalid TUNRELAY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(interval) = std::env::var("TUNRELAY_POLL_INTERVAL") {
            config.server.poll_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid TUNRELAY_POLL_INTERVAL: {}", interval))?;
        }

        if let Ok(timeout) = std::env::var("TUNRELAY_CONNECT_TIMEOUT") {
            config.server.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TUNRELAY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_level) = std::env::var("TUNRELAY_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        if let Ok(verbose) = std::env::var("TUNRELAY_VERBOSE") {
            config.monitoring.verbose = verbose.parse::<bool>()
                .with_context(|| format!("Invalid TUNRELAY_VERBOSE: {}", verbose))?;
        }

        if let Ok(metrics_addr) = std::env::var("TUNRELAY_METRICS_ADDR") {
            config.monitoring.metrics_addr = Some(metrics_addr.parse::<SocketAddr>()
                .with_context(|| format!("Invalid TUNRELAY_METRICS_ADDR: {}", metrics_addr))?);
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_addresses()
            .with_context(|| "Address configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    /// Validate the configuration a single role needs
    pub fn validate_for(&self, role: Role) -> Result<()> {
        self.validate()?;

        let (first, second) = match role {
            Role::Bind => (&self.bind.listen_addr, &self.bind.target_addr),
            Role::Agent => (&self.agent.control_addr, &self.agent.destination_addr),
            Role::Listener => (&self.listener.control_addr, &self.listener.local_addr),
        };
        if role == Role::Listener && first == second {
            bail!("listener.control_addr and listener.local_addr must differ");
        }
        if role == Role::Bind && first == second {
            bail!("bind.listen_addr and bind.target_addr must differ");
        }

        Ok(())
    }

    /// Validate server configuration
    fn validate_server_config(&self) -> Result<()> {
        if self.server.buffer_size < 512 {
            bail!("buffer_size must be at least 512 bytes");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.server.poll_interval > Duration::from_secs(1) {
            bail!("poll_interval cannot exceed 1 second");
        }

        if self.server.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.server.connect_timeout.as_secs() > 3600 {
            bail!("connect_timeout cannot exceed 1 hour");
        }

        if self.server.listen_backlog == 0 {
            bail!("listen_backlog must be greater than 0");
        }

        if self.server.max_sessions == 0 {
            bail!("max_sessions must be greater than 0");
        }

        Ok(())
    }

    /// Validate every configured host:port pair
    fn validate_addresses(&self) -> Result<()> {
        // Listen addresses accept the ":PORT" shorthand
        let addresses = [
            ("bind.listen_addr", normalize_bind_addr(&self.bind.listen_addr)),
            ("bind.target_addr", self.bind.target_addr.as_str().into()),
            ("agent.control_addr", self.agent.control_addr.as_str().into()),
            ("agent.destination_addr", self.agent.destination_addr.as_str().into()),
            ("listener.control_addr", normalize_bind_addr(&self.listener.control_addr)),
            ("listener.local_addr", normalize_bind_addr(&self.listener.local_addr)),
        ];

        for (name, addr) in addresses {
            validate_host_port(&addr)
                .with_context(|| format!("{} is invalid: '{}'", name, addr))?;
        }

        Ok(())
    }

    /// Validate monitoring configuration
    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) {
        if let Some(addr) = &overrides.bind_listen {
            self.bind.listen_addr = addr.clone();
            tracing::info!("CLI override: bind listen address set to {}", addr);
        }

        if let Some(addr) = &overrides.bind_target {
            self.bind.target_addr = addr.clone();
            tracing::info!("CLI override: bind target address set to {}", addr);
        }

        if overrides.bind_concurrent {
            self.bind.concurrent = true;
            tracing::info!("CLI override: concurrent bind sessions enabled");
        }

        if let Some(addr) = &overrides.agent_control {
            self.agent.control_addr = addr.clone();
            tracing::info!("CLI override: agent control address set to {}", addr);
        }

        if let Some(addr) = &overrides.agent_destination {
            self.agent.destination_addr = addr.clone();
            tracing::info!("CLI override: agent destination address set to {}", addr);
        }

        if let Some(addr) = &overrides.listener_control {
            self.listener.control_addr = addr.clone();
            tracing::info!("CLI override: listener control address set to {}", addr);
        }

        if let Some(addr) = &overrides.listener_local {
            self.listener.local_addr = addr.clone();
            tracing::info!("CLI override: listener local address set to {}", addr);
        }

        if let Some(buffer_size) = overrides.buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(ms) = overrides.poll_interval_ms {
            self.server.poll_interval = Duration::from_millis(ms);
            tracing::info!("CLI override: poll interval set to {}ms", ms);
        }

        if let Some(secs) = overrides.connect_timeout_secs {
            self.server.connect_timeout = Duration::from_secs(secs);
            tracing::info!("CLI override: connect timeout set to {}s", secs);
        }

        if overrides.quiet {
            self.monitoring.verbose = false;
        }
    }
}

/// Check that `addr` looks like `host:port` with a usable port
pub fn validate_host_port(addr: &str) -> Result<()> {
    if addr.parse::<SocketAddr>().is_ok() {
        return Ok(());
    }

    let (host, port) = addr.rsplit_once(':')
        .with_context(|| "expected host:port")?;

    if host.is_empty() {
        bail!("host is empty");
    }

    if host.contains(char::is_whitespace) {
        bail!("host contains whitespace");
    }

    let port = port.parse::<u16>()
        .with_context(|| format!("invalid port '{}'", port))?;

    if port == 0 {
        bail!("port 0 is only allowed with a literal IP address");
    }

    Ok(())
}
