//! Front Listener
//!
//! Holds the single control connection accepted from the agent and serves local
//! connections one at a time over it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::channel_failure;
use crate::config::Config;
use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::net;
use crate::protocol::{Command, FramedChannel};
use crate::relay::{DuplexPump, Endpoint, RelaySession};

/// Operator-side end of the reverse tunnel
pub struct FrontListener {
    config: Arc<Config>,
    pump: DuplexPump,
    metrics: Option<Arc<Metrics>>,
    verbose: bool,
    control_listener: Option<TcpListener>,
    channel: Option<FramedChannel<TcpStream>>,
    agent_addr: Option<SocketAddr>,
    local_listener: Option<TcpListener>,
}

impl FrontListener {
    pub fn new(config: Arc<Config>) -> Self {
        let pump = DuplexPump::from_config(&config.server);
        let verbose = config.monitoring.verbose;

        Self {
            config,
            pump,
            metrics: None,
            verbose,
            control_listener: None,
            channel: None,
            agent_addr: None,
            local_listener: None,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bind the control address the agent dials
    pub async fn bind(&mut self) -> Result<SocketAddr, RelayError> {
        let listener = net::bind_listener(
            &self.config.listener.control_addr,
            self.config.server.listen_backlog,
        )
        .await?;
        let addr = listener.local_addr()?;

        lifecycle!(self.verbose, "Waiting for agent on {}", addr);
        self.control_listener = Some(listener);
        Ok(addr)
    }

    /// Accept exactly one agent; the control listener is closed afterwards
    pub async fn accept_agent(&mut self) -> Result<SocketAddr, RelayError> {
        let listener = self.control_listener.take().ok_or_else(|| {
            RelayError::bind(&self.config.listener.control_addr, io::Error::from(io::ErrorKind::NotConnected))
        })?;

        let (stream, addr) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on control connection: {}", e);
        }

        lifecycle!(self.verbose, "Agent connected from {}", addr);
        self.channel = Some(FramedChannel::new(stream));
        self.agent_addr = Some(addr);
        Ok(addr)
    }

    /// Bind the local address operators connect to
    pub async fn bind_local(&mut self) -> Result<SocketAddr, RelayError> {
        let listener = net::bind_listener(
            &self.config.listener.local_addr,
            self.config.server.listen_backlog,
        )
        .await?;
        let addr = listener.local_addr()?;

        lifecycle!(self.verbose, "Listening on {}", addr);
        self.local_listener = Some(listener);
        Ok(addr)
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn agent_addr(&self) -> Option<SocketAddr> {
        self.agent_addr
    }

    /// Run every step: bind, wait for the agent, bind locally, serve
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), RelayError> {
        if self.control_listener.is_none() && self.channel.is_none() {
            self.bind().await?;
        }

        if self.channel.is_none() {
            tokio::select! {
                accepted = self.accept_agent() => { accepted?; }
                _ = shutdown.recv() => {
                    info!("Received shutdown signal while waiting for the agent");
                    return Ok(());
                }
            }
        }

        if self.local_listener.is_none() {
            self.bind_local().await?;
        }

        self.serve(shutdown).await
    }

    /// Serve local connections sequentially over the control channel.
    ///
    /// Returns `Ok(())` on shutdown and an error once the control channel is lost.
    pub async fn serve(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), RelayError> {
        let not_ready = || RelayError::Io(io::Error::from(io::ErrorKind::NotConnected));
        let listener = self.local_listener.as_ref().ok_or_else(not_ready)?;
        let channel = self.channel.as_mut().ok_or_else(not_ready)?;
        let agent_addr = self.agent_addr.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let pump = &self.pump;
        let metrics = self.metrics.as_ref();
        let verbose = self.verbose;

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            };

            lifecycle!(verbose, "Connection received from {}", addr);

            // Frames left over from the previous session must not leak into this one
            let stale = channel.discard_pending().await?;
            if stale > 0 {
                debug!(stale, "Discarded stale frames before CONNECT");
            }
            channel.send_control(Command::Connect).await?;

            let session = RelaySession::new(addr, agent_addr);
            let tracked = metrics.map(|metrics| metrics.track(&session));

            let outcome = tokio::select! {
                outcome = pump.run(&session, stream, Endpoint::Framed(&mut *channel)) => outcome,
                _ = shutdown.recv() => {
                    info!("Received shutdown signal, closing active session");
                    break;
                }
            };

            session.log_stats(&outcome.reason.to_string());
            if let Some(tracked) = tracked {
                tracked.finish(&session, &outcome);
            }
            lifecycle!(verbose, "Proxied connection closed ({})", outcome.reason);

            if let Some(e) = channel_failure(&outcome.reason) {
                error!("Control channel unusable after session: {}", e);
                return Err(e);
            }
        }

        info!("Front-listener stopped");
        Ok(())
    }
}
