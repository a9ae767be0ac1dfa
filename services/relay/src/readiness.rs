//! Readiness probing for freshly started instances.
//!
//! An instance is ready once the runtime reports it running, its internal port
//! is published on the host, and a TCP connection to that host port succeeds.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::DeploymentConfig;
use crate::context::CallContext;
use crate::driver::DriverError;
use crate::keys::Key;
use crate::runtime::{ContainerRuntime, RuntimeError};

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Accepting TCP connections on the host port.
    Ready,
    /// Inspected, but not running yet.
    NotRunning,
    /// Running, but the internal port has no host binding.
    NoPort,
    /// Running with a host port that refused or timed out.
    Unreachable,
}

/// Polls an instance until it accepts connections or the ready timeout passes.
pub struct ReadinessProber {
    runtime: Arc<dyn ContainerRuntime>,
    internal_port: String,
    ready_timeout: Duration,
    retry_interval: Duration,
    connection_timeout: Duration,
}

impl ReadinessProber {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &DeploymentConfig) -> Self {
        Self {
            runtime,
            internal_port: config.internal_port.clone(),
            ready_timeout: config.ready_timeout,
            retry_interval: config.retry_interval,
            connection_timeout: config.connection_timeout,
        }
    }

    /// Wait until `key` is reachable.
    ///
    /// At least one probe is always made. Each probe may run until the ready
    /// deadline, or for `connection_timeout` once that has passed. Inspection
    /// errors and probes that overrun count as a failed attempt and are retried. Cancellation and the call deadline interrupt both
    /// probes and sleeps.
    pub async fn wait_ready(&self, key: &Key, ctx: &CallContext) -> Result<(), DriverError> {
        let started = Instant::now();
        let deadline = started + self.ready_timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let budget = deadline
                .saturating_duration_since(Instant::now())
                .max(self.connection_timeout);

            match ctx.run(timeout(budget, self.probe_once(key))).await? {
                Ok(Ok(ProbeStatus::Ready)) => {
                    info!(
                        key = %key,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Instance ready"
                    );
                    return Ok(());
                }
                Ok(Ok(status)) => {
                    debug!(key = %key, attempt = attempts, status = ?status, "Instance not ready");
                }
                Ok(Err(e)) => {
                    warn!(key = %key, attempt = attempts, error = %e, "Readiness inspection failed");
                }
                Err(_) => {
                    warn!(
                        key = %key,
                        attempt = attempts,
                        budget_ms = budget.as_millis() as u64,
                        "Readiness probe timed out"
                    );
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    key = %key,
                    attempts,
                    ready_timeout_ms = self.ready_timeout.as_millis() as u64,
                    "Instance did not become ready"
                );
                return Err(DriverError::ReadinessTimeout { key: key.clone() });
            }

            ctx.sleep(self.retry_interval.min(remaining)).await?;
        }
    }

    /// One inspection plus, if running, one TCP connect attempt.
    pub async fn probe_once(&self, key: &Key) -> Result<ProbeStatus, RuntimeError> {
        let info = self.runtime.inspect(key.as_str()).await?;
        if !info.is_running() {
            return Ok(ProbeStatus::NotRunning);
        }

        let Some(port) = info.host_port(&self.internal_port) else {
            return Ok(ProbeStatus::NoPort);
        };

        if check_tcp(port, self.connection_timeout).await {
            Ok(ProbeStatus::Ready)
        } else {
            Ok(ProbeStatus::Unreachable)
        }
    }
}

/// Whether `127.0.0.1:port` accepts a TCP connection within `connect_timeout`.
pub async fn check_tcp(port: u16, connect_timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(port, error = %e, "TCP probe failed");
            false
        }
        Err(_) => {
            debug!(port, "TCP probe timed out");
            false
        }
    }
}
