//! Graceful Shutdown Handling
//!
//! This module provides utilities for handling process interrupts. It supports SIGTERM and
//! SIGINT and lets every relay role close its endpoints before the process exits.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn, error, debug};
use crate::Result;

/// Shutdown coordinator that manages the interrupt path
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// How long a role may take to close its endpoints
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast shutdown to every subscriber
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No shutdown subscribers left: {}", e);
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, shutting down");
        }

        self.trigger();
        Ok(())
    }

    /// Wait for a role task that has been told to stop, aborting it after the timeout
    pub async fn wait_for_task<T>(&self, mut handle: JoinHandle<T>) -> Option<T> {
        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                if !e.is_cancelled() {
                    error!("Task failed during shutdown: {}", e);
                }
                None
            }
            Err(_) => {
                warn!("Task did not stop within {:?}, aborting", self.timeout);
                handle.abort();
                None
            }
        }
    }
}
