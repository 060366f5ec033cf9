//! Bind Relay
//!
//! Listens on a local address and forwards every accepted connection to one fixed target.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn, instrument};

use crate::config::Config;
use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::net;
use crate::relay::{DuplexPump, Endpoint, PumpOutcome, RelaySession};

/// Everything a single bind session needs, cheap to clone into a task
#[derive(Clone)]
struct SessionContext {
    target_addr: String,
    connect_timeout: std::time::Duration,
    pump: DuplexPump,
    metrics: Option<Arc<Metrics>>,
    verbose: bool,
}

/// Accepts local connections and relays each one to the configured target
pub struct BindRelay {
    config: Arc<Config>,
    listener: Option<TcpListener>,
    context: SessionContext,
    session_slots: Arc<Semaphore>,
}

impl BindRelay {
    /// Create a new bind relay
    pub fn new(config: Arc<Config>) -> Self {
        let context = SessionContext {
            target_addr: config.bind.target_addr.clone(),
            connect_timeout: config.server.connect_timeout,
            pump: DuplexPump::from_config(&config.server),
            metrics: None,
            verbose: config.monitoring.verbose,
        };
        let session_slots = Arc::new(Semaphore::new(config.server.max_sessions));

        Self {
            config,
            listener: None,
            context,
            session_slots,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.context.metrics = Some(metrics);
        self
    }

    /// Bind the listening socket
    pub async fn bind(&mut self) -> Result<SocketAddr, RelayError> {
        let listen_addr = &self.config.bind.listen_addr;
        let listener = net::bind_listener(listen_addr, self.config.server.listen_backlog).await?;
        let local_addr = listener.local_addr()?;

        lifecycle!(self.context.verbose, "Listening on {}", local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Address the relay listens on, once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind and serve until shutdown
    pub async fn start(&mut self, shutdown: broadcast::Receiver<()>) -> Result<(), RelayError> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        self.serve(shutdown).await
    }

    /// Accept loop
    pub async fn serve(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), RelayError> {
        let listener = self.listener.as_ref()
            .ok_or_else(|| RelayError::bind(&self.config.bind.listen_addr, std::io::Error::from(std::io::ErrorKind::NotConnected)))?;

        info!(
            target_addr = %self.context.target_addr,
            concurrent = self.config.bind.concurrent,
            "Bind relay accepting connections"
        );

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            continue;
                        }
                    };

                    lifecycle!(self.context.verbose, "Connection received from {}", addr);

                    if self.config.bind.concurrent {
                        self.spawn_session(stream, addr, shutdown.resubscribe()).await;
                        continue;
                    }

                    // Sequential: the next accept waits until this session is torn down
                    tokio::select! {
                        _ = relay_connection(stream, addr, &self.context) => {}
                        _ = shutdown.recv() => {
                            info!("Received shutdown signal, closing active session");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!("Bind relay stopped");
        Ok(())
    }

    async fn spawn_session(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let permit = match Arc::clone(&self.session_slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Session limit closed, rejecting connection from {}", addr);
                return;
            }
        };

        let context = self.context.clone();
        tokio::spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = relay_connection(stream, addr, &context) => {}
                _ = shutdown.recv() => {
                    debug!("Session from {} closed by shutdown", addr);
                }
            }
        });
    }
}

/// Dial the target and pump until the session ends. Dial failures only affect this
/// connection; the accepted stream is dropped (closed).
#[instrument(skip(client, context), fields(client_addr = %addr))]
async fn relay_connection(
    client: TcpStream,
    addr: SocketAddr,
    context: &SessionContext,
) -> Option<PumpOutcome> {
    let target = match net::connect(&context.target_addr, context.connect_timeout).await {
        Ok(target) => target,
        Err(e) => {
            warn!("Dropping connection from {}: {}", addr, e);
            if let Some(metrics) = &context.metrics {
                metrics.connect_failed();
            }
            return None;
        }
    };

    let target_addr = target
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    lifecycle!(context.verbose, "Connected to remote host on {}", target_addr);

    let session = RelaySession::new(addr, target_addr);
    let tracked = context.metrics.as_ref().map(|metrics| metrics.track(&session));

    let outcome = context.pump.run(&session, client, Endpoint::Plain(target)).await;

    session.log_stats(&outcome.reason.to_string());
    if let Some(tracked) = tracked {
        tracked.finish(&session, &outcome);
    }
    lifecycle!(context.verbose, "Proxied connection closed ({})", outcome.reason);

    Some(outcome)
}
