//! Metrics Collector

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::{debug, error};

use crate::relay::{PumpOutcome, RelaySession};
use crate::Result;

/// Collects relay metrics and exports them in Prometheus text format
pub struct Metrics {
    prometheus_registry: Registry,

    sessions_total: IntCounter,
    sessions_ended_total: IntCounterVec,
    active_sessions: IntGauge,
    bytes_relayed_total: IntCounterVec,
    session_duration: Histogram,
    connect_failures_total: IntCounter,

    total_sessions: AtomicU64,
    total_bytes: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let prometheus_registry = Registry::new();

        let sessions_total = IntCounter::new(
            "tunrelay_sessions_total",
            "Total number of relay sessions started",
        )?;

        let sessions_ended_total = IntCounterVec::new(
            Opts::new("tunrelay_sessions_ended_total", "Relay sessions ended, by termination reason"),
            &["reason"],
        )?;

        let active_sessions = IntGauge::new(
            "tunrelay_active_sessions",
            "Number of relay sessions currently running",
        )?;

        let bytes_relayed_total = IntCounterVec::new(
            Opts::new("tunrelay_bytes_relayed_total", "Bytes relayed, by direction"),
            &["direction"],
        )?;

        let session_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tunrelay_session_duration_seconds",
                "Duration of relay sessions in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 3600.0]),
        )?;

        let connect_failures_total = IntCounter::new(
            "tunrelay_connect_failures_total",
            "Outbound connection attempts that failed",
        )?;

        prometheus_registry.register(Box::new(sessions_total.clone()))?;
        prometheus_registry.register(Box::new(sessions_ended_total.clone()))?;
        prometheus_registry.register(Box::new(active_sessions.clone()))?;
        prometheus_registry.register(Box::new(bytes_relayed_total.clone()))?;
        prometheus_registry.register(Box::new(session_duration.clone()))?;
        prometheus_registry.register(Box::new(connect_failures_total.clone()))?;

        Ok(Self {
            prometheus_registry,
            sessions_total,
            sessions_ended_total,
            active_sessions,
            bytes_relayed_total,
            session_duration,
            connect_failures_total,
            total_sessions: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        })
    }

    /// Record a session start
    pub fn session_started(&self, session: &RelaySession) {
        self.sessions_total.inc();
        self.active_sessions.inc();
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %session.session_id, "Session metrics started");
    }

    /// Record a session end together with its outcome
    pub fn session_ended(&self, session: &RelaySession, outcome: &PumpOutcome) {
        self.active_sessions.dec();
        self.session_duration.observe(session.duration().as_secs_f64());
        self.sessions_ended_total
            .with_label_values(&[reason_label(outcome)])
            .inc();
        self.bytes_relayed_total
            .with_label_values(&["up"])
            .inc_by(outcome.bytes_up);
        self.bytes_relayed_total
            .with_label_values(&["down"])
            .inc_by(outcome.bytes_down);
        self.total_bytes
            .fetch_add(outcome.bytes_up + outcome.bytes_down, Ordering::Relaxed);
    }

    /// Start tracking a session; the returned guard records its end
    pub fn track(self: &Arc<Self>, session: &RelaySession) -> SessionGuard {
        self.session_started(session);
        SessionGuard {
            metrics: Arc::clone(self),
            started: session.start_time,
            finished: false,
        }
    }

    /// Record a session torn down before the pump returned
    fn session_cancelled(&self, duration: Duration) {
        self.active_sessions.dec();
        self.session_duration.observe(duration.as_secs_f64());
        self.sessions_ended_total.with_label_values(&["cancelled"]).inc();
    }

    /// Record a failed outbound dial
    pub fn connect_failed(&self) {
        self.connect_failures_total.inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.prometheus_registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }

    pub fn total_sessions(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn connect_failures(&self) -> u64 {
        self.connect_failures_total.get()
    }
}

/// Keeps the active session gauge balanced when a session future is dropped mid-flight
pub struct SessionGuard {
    metrics: Arc<Metrics>,
    started: Instant,
    finished: bool,
}

impl SessionGuard {
    /// Record a session that ran to completion
    pub fn finish(mut self, session: &RelaySession, outcome: &PumpOutcome) {
        self.finished = true;
        self.metrics.session_ended(session, outcome);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.session_cancelled(self.started.elapsed());
        }
    }
}

fn reason_label(outcome: &PumpOutcome) -> &'static str {
    use crate::relay::TerminationReason::*;
    match outcome.reason {
        LocalClosed => "local_closed",
        RemoteClosed => "remote_closed",
        PeerClose => "peer_close",
        Protocol(_) => "protocol_error",
        LocalError(_) => "local_error",
        RemoteError(_) => "remote_error",
        ChannelLost => "channel_lost",
    }
}
