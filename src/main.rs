//! tunrelay - TCP bind relay and reverse tunnel
//!
//! Thin launcher: configuration, logging and signal handling around one relay role.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunrelay::{
    config::{CliOverrides, ConfigManager, Role},
    metrics::{Metrics, MetricsServer},
    BindRelay, Config, FrontListener, ReverseAgent, ShutdownCoordinator,
};

/// CLI arguments for tunrelay
#[derive(Parser, Debug)]
#[command(name = "tunrelay")]
#[command(about = "TCP bind relay and reverse tunnel")]
#[command(version)]
#[command(long_about = "
tunrelay - TCP bind relay and reverse tunnel

Roles:
  bind      Listen locally and forward every connection to a fixed target
  agent     Dial out to a front-listener and forward tunneled sessions to a destination
  listener  Accept one agent, then tunnel every local connection through it

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TUNRELAY_BIND_LISTEN         - Bind relay listen address
  TUNRELAY_BIND_TARGET         - Bind relay target address
  TUNRELAY_AGENT_CONTROL       - Front-listener control address the agent dials
  TUNRELAY_AGENT_DESTINATION   - Destination the agent forwards to
  TUNRELAY_LISTENER_CONTROL    - Control address the front-listener binds
  TUNRELAY_LISTENER_LOCAL      - Local address the front-listener binds
  TUNRELAY_POLL_INTERVAL       - Pump poll interval (e.g., 5ms)
  TUNRELAY_CONNECT_TIMEOUT     - Outbound connect timeout (e.g., 10s)
  TUNRELAY_LOG_LEVEL           - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        default_value = "tunrelay.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Log lifecycle notices at debug level only
    #[arg(short, long, global = true, help = "Suppress lifecycle notices")]
    pub quiet: bool,

    /// Largest chunk moved per read
    #[arg(long, global = true, help = "Buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Pump poll interval in milliseconds
    #[arg(long, global = true, help = "Poll interval in milliseconds")]
    pub poll_interval: Option<u64>,

    /// Connect timeout in seconds
    #[arg(long, global = true, help = "Connect timeout in seconds")]
    pub timeout: Option<u64>,

    /// Validate configuration and exit
    #[arg(long, global = true, help = "Validate configuration and exit")]
    pub validate_config: bool,

    #[command(subcommand)]
    pub role: RoleCommand,
}

#[derive(Subcommand, Debug)]
pub enum RoleCommand {
    /// Forward every accepted connection to a fixed target
    Bind {
        /// Listen address (e.g., 0.0.0.0:8080 or :8080)
        #[arg(short, long)]
        listen: Option<String>,
        /// Target address (e.g., 10.0.0.5:80)
        #[arg(short, long)]
        target: Option<String>,
        /// Serve connections concurrently
        #[arg(long)]
        concurrent: bool,
    },
    /// Dial the front-listener and forward tunneled sessions
    Agent {
        /// Front-listener control address
        #[arg(long)]
        control: Option<String>,
        /// Destination address
        #[arg(short, long)]
        destination: Option<String>,
    },
    /// Accept the agent and tunnel local connections through it
    Listener {
        /// Control address the agent connects to
        #[arg(long)]
        control: Option<String>,
        /// Local address operators connect to
        #[arg(short, long)]
        local: Option<String>,
    },
}

impl CliArgs {
    fn role(&self) -> Role {
        match self.role {
            RoleCommand::Bind { .. } => Role::Bind,
            RoleCommand::Agent { .. } => Role::Agent,
            RoleCommand::Listener { .. } => Role::Listener,
        }
    }

    fn overrides(&self) -> CliOverrides {
        let mut overrides = CliOverrides {
            buffer_size: self.buffer_size,
            poll_interval_ms: self.poll_interval,
            connect_timeout_secs: self.timeout,
            quiet: self.quiet,
            ..CliOverrides::default()
        };

        match &self.role {
            RoleCommand::Bind { listen, target, concurrent } => {
                overrides.bind_listen = listen.clone();
                overrides.bind_target = target.clone();
                overrides.bind_concurrent = *concurrent;
            }
            RoleCommand::Agent { control, destination } => {
                overrides.agent_control = control.clone();
                overrides.agent_destination = destination.clone();
            }
            RoleCommand::Listener { control, local } => {
                overrides.listener_control = control.clone();
                overrides.listener_local = local.clone();
            }
        }

        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let role = args.role();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    init_tracing(&args, &config)?;

    info!("Starting tunrelay v{} ({} role)", env!("CARGO_PKG_VERSION"), role);

    // Apply CLI argument overrides (highest priority)
    config.merge_with_cli_args(&args.overrides());

    // Final validation after all overrides
    config
        .validate_for(role)
        .context("Final configuration validation failed")?;

    if args.validate_config {
        print_summary(&config, role);
        return Ok(());
    }

    let config = Arc::new(config);
    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);

    let metrics = Arc::new(Metrics::new()?);
    let metrics_handle = match config.monitoring.metrics_addr {
        Some(addr) => {
            let server = MetricsServer::bind(metrics.clone(), &addr.to_string()).await?;
            Some(tokio::spawn(async move {
                if let Err(e) = server.serve().await {
                    error!("Metrics server error: {}", e);
                }
            }))
        }
        None => None,
    };

    let shutdown_rx = shutdown_coordinator.subscribe();
    let role_config = config.clone();
    let role_metrics = metrics.clone();
    let mut role_handle = tokio::spawn(async move {
        match role {
            Role::Bind => {
                let mut relay = BindRelay::new(role_config).with_metrics(role_metrics);
                relay.start(shutdown_rx).await
            }
            Role::Agent => {
                let agent = ReverseAgent::new(role_config).with_metrics(role_metrics);
                agent.run(shutdown_rx).await
            }
            Role::Listener => {
                let mut listener = FrontListener::new(role_config).with_metrics(role_metrics);
                listener.run(shutdown_rx).await
            }
        }
    });

    info!("Press Ctrl+C or send SIGTERM/SIGINT to stop");

    // The role may end on its own (fatal error, lost control channel) or on interrupt
    let role_result = tokio::select! {
        result = &mut role_handle => Some(result),
        signal_result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = signal_result {
                error!("Error setting up signal handlers: {}", e);
                shutdown_coordinator.trigger();
            }
            None
        }
    };

    let role_result = match role_result {
        Some(joined) => joined.context("Role task panicked")?,
        None => {
            info!("Initiating shutdown...");
            shutdown_coordinator
                .wait_for_task(role_handle)
                .await
                .unwrap_or(Ok(()))
        }
    };

    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    match role_result {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("{} role stopped: {}", role, e);
            Err(e.into())
        }
    }
}

fn print_summary(config: &Config, role: Role) {
    info!("Configuration is valid");
    info!("Configuration summary:");
    info!("  Role: {}", role);
    match role {
        Role::Bind => {
            info!("  Listen address: {}", config.bind.listen_addr);
            info!("  Target address: {}", config.bind.target_addr);
            info!("  Concurrent sessions: {}", config.bind.concurrent);
        }
        Role::Agent => {
            info!("  Control address: {}", config.agent.control_addr);
            info!("  Destination address: {}", config.agent.destination_addr);
        }
        Role::Listener => {
            info!("  Control address: {}", config.listener.control_addr);
            info!("  Local address: {}", config.listener.local_addr);
        }
    }
    info!("  Buffer size: {} bytes", config.server.buffer_size);
    info!("  Poll interval: {:?}", config.server.poll_interval);
    info!("  Connect timeout: {:?}", config.server.connect_timeout);
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level
            .as_deref()
            .unwrap_or(&config.monitoring.log_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
