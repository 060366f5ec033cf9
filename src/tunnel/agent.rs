//! Reverse Agent
//!
//! Dials the front-listener's control port once, then waits for CONNECT. Every CONNECT
//! opens a fresh connection to the destination and relays it over the control channel.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::channel_failure;
use crate::config::Config;
use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::net;
use crate::protocol::{Command, FramedChannel};
use crate::relay::{DuplexPump, Endpoint, RelaySession};

pub struct ReverseAgent {
    config: Arc<Config>,
    pump: DuplexPump,
    metrics: Option<Arc<Metrics>>,
    verbose: bool,
}

impl ReverseAgent {
    pub fn new(config: Arc<Config>) -> Self {
        let pump = DuplexPump::from_config(&config.server);
        let verbose = config.monitoring.verbose;

        Self {
            config,
            pump,
            metrics: None,
            verbose,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Open the control connection
    pub async fn connect(&self) -> Result<FramedChannel<TcpStream>, RelayError> {
        let control_addr = &self.config.agent.control_addr;
        let stream = net::connect(control_addr, self.config.server.connect_timeout).await?;

        lifecycle!(self.verbose, "Connected to front-listener at {}", control_addr);
        Ok(FramedChannel::new(stream))
    }

    /// Connect and serve until shutdown or until the control channel is lost
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), RelayError> {
        let mut channel = tokio::select! {
            channel = self.connect() => channel?,
            _ = shutdown.recv() => {
                info!("Received shutdown signal before the control channel was up");
                return Ok(());
            }
        };
        self.serve(&mut channel, shutdown).await
    }

    /// Wait for CONNECT requests on an established control channel.
    ///
    /// Returns `Ok(())` only on shutdown. A peer close, a read failure or a truncated or
    /// oversized frame is returned as an error; frames with an unknown command are skipped.
    pub async fn serve(
        &self,
        channel: &mut FramedChannel<TcpStream>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        let control_peer = peer_or_unspecified(channel.get_ref());

        loop {
            let frame = tokio::select! {
                frame = channel.recv_frame() => frame,
                _ = shutdown.recv() => {
                    info!("Received shutdown signal, closing control channel");
                    return Ok(());
                }
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(RelayError::Protocol(e)) if e.is_recoverable() => {
                    warn!("Skipping malformed frame while idle: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!("Control channel failed while idle: {}", e);
                    return Err(e);
                }
            };

            if frame.command != Command::Connect {
                debug!(command = %frame.command, len = frame.payload.len(), "Ignoring frame while idle");
                continue;
            }

            tokio::select! {
                result = self.handle_connect(channel, control_peer) => result?,
                _ = shutdown.recv() => {
                    info!("Received shutdown signal, closing active session");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connect(
        &self,
        channel: &mut FramedChannel<TcpStream>,
        control_peer: SocketAddr,
    ) -> Result<(), RelayError> {
        let destination_addr = &self.config.agent.destination_addr;
        debug!("CONNECT received, dialing {}", destination_addr);

        let destination = match net::connect(destination_addr, self.config.server.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Destination unreachable, answering with CLOSE: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.connect_failed();
                }
                channel.send_control(Command::Close).await?;
                return Ok(());
            }
        };

        let destination_peer = peer_or_unspecified(&destination);
        lifecycle!(self.verbose, "Connection opened to {}", destination_peer);

        let session = RelaySession::new(destination_peer, control_peer);
        let tracked = self.metrics.as_ref().map(|metrics| metrics.track(&session));

        let outcome = self.pump.run(&session, destination, Endpoint::Framed(channel)).await;

        session.log_stats(&outcome.reason.to_string());
        if let Some(tracked) = tracked {
            tracked.finish(&session, &outcome);
        }
        lifecycle!(self.verbose, "Proxied connection closed ({})", outcome.reason);

        match channel_failure(&outcome.reason) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn peer_or_unspecified(stream: &TcpStream) -> SocketAddr {
    stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
}
