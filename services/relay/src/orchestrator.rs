//! Execute orchestration.
//!
//! One `execute` call walks a fixed sequence:
//!
//! ```text
//! Idle -> ResolvingKey -> CheckingRunning -> [Starting] -> ResolvingPort -> Invoking -> Done
//!                                                                          (any) -> Failed
//! ```
//!
//! Concurrent calls for a key whose instance is not running share a single
//! start flight: the first caller spawns it, later callers await the same
//! outcome. The flight runs detached from any caller, so one caller giving up
//! does not abort the start for the others. It has its own deadline (the start
//! timeout) and stops on shutdown, so it always ends and leaves the map.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DeploymentConfig;
use crate::context::{CallContext, Interrupted};
use crate::driver::{DriverError, InstanceStatus, Instances};
use crate::invoker::{InvokeError, Invoker};
use crate::keys::{Key, KeyError, KeyResolver};

/// Errors from one `execute` call.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("failed to resolve key for action {action:?}: {source}")]
    KeyResolution {
        action: String,
        #[source]
        source: KeyError,
    },

    #[error("failed to start instance {key}: {source}")]
    Start {
        key: Key,
        #[source]
        source: Arc<DriverError>,
    },

    #[error("instance {key} has no host port bound")]
    PortUnavailable { key: Key },

    #[error("invocation of instance {key} failed: {source}")]
    Invocation {
        key: Key,
        #[source]
        source: InvokeError,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl ExecuteError {
    /// Stable name of the error kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecuteError::KeyResolution { .. } => "key_resolution",
            ExecuteError::Start { .. } => "start",
            ExecuteError::PortUnavailable { .. } => "port_unavailable",
            ExecuteError::Invocation { .. } => "invocation",
            ExecuteError::Cancelled => "cancelled",
            ExecuteError::DeadlineExceeded => "deadline_exceeded",
        }
    }

    /// Kind of the underlying layer error, if any.
    pub fn source_kind(&self) -> Option<&'static str> {
        match self {
            ExecuteError::KeyResolution { source, .. } => Some(source.kind()),
            ExecuteError::Start { source, .. } => Some(source.kind()),
            ExecuteError::Invocation { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

impl From<Interrupted> for ExecuteError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::Cancelled => ExecuteError::Cancelled,
            Interrupted::DeadlineExceeded => ExecuteError::DeadlineExceeded,
        }
    }
}

/// Where an `execute` call is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    ResolvingKey,
    CheckingRunning,
    Starting,
    ResolvingPort,
    Invoking,
    Done,
    Failed,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::ResolvingKey => "resolving_key",
            CallPhase::CheckingRunning => "checking_running",
            CallPhase::Starting => "starting",
            CallPhase::ResolvingPort => "resolving_port",
            CallPhase::Invoking => "invoking",
            CallPhase::Done => "done",
            CallPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type StartFlight = Shared<BoxFuture<'static, Result<(), Arc<DriverError>>>>;

/// Routes actions to function instances, starting them on demand.
pub struct Orchestrator {
    keys: Arc<dyn KeyResolver>,
    instances: Arc<dyn Instances>,
    invoker: Arc<dyn Invoker>,
    invocation_timeout: Duration,
    start_timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
    flights: Arc<Mutex<HashMap<Key, StartFlight>>>,
}

impl Orchestrator {
    pub fn new(
        keys: Arc<dyn KeyResolver>,
        instances: Arc<dyn Instances>,
        invoker: Arc<dyn Invoker>,
        invocation_timeout: Duration,
    ) -> Self {
        Self {
            keys,
            instances,
            invoker,
            invocation_timeout,
            start_timeout: DeploymentConfig::default().start_budget(),
            shutdown: None,
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Upper bound on one start flight, whoever is waiting on it.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Abort start flights once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Run `action` with `body` as payload and return the function's output.
    pub async fn execute(
        &self,
        action: &str,
        body: &str,
        ctx: &CallContext,
    ) -> Result<String, ExecuteError> {
        let invocation_id = Uuid::new_v4();
        let span = info_span!("execute", %invocation_id, action);

        async {
            let started = Instant::now();
            debug!(phase = %CallPhase::Idle, body_bytes = body.len(), "Execute received");

            match self.run_phases(action, body, ctx).await {
                Ok(output) => {
                    info!(
                        phase = %CallPhase::Done,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Execute completed"
                    );
                    Ok(output)
                }
                Err(e) => {
                    warn!(
                        phase = %CallPhase::Failed,
                        kind = e.kind(),
                        source_kind = e.source_kind().unwrap_or("none"),
                        error = %e,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Execute failed"
                    );
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_phases(
        &self,
        action: &str,
        body: &str,
        ctx: &CallContext,
    ) -> Result<String, ExecuteError> {
        debug!(phase = %CallPhase::ResolvingKey, "Resolving key");
        let key = ctx
            .run(self.keys.resolve(action))
            .await?
            .map_err(|source| ExecuteError::KeyResolution {
                action: action.to_string(),
                source,
            })?;

        debug!(phase = %CallPhase::CheckingRunning, key = %key, "Checking instance");
        match ctx.run(self.instances.status(&key)).await? {
            Ok(InstanceStatus::Running) => {
                debug!(key = %key, "Instance already running");
            }
            Ok(status) => {
                debug!(phase = %CallPhase::Starting, key = %key, status = ?status, "Instance not running");
                self.ensure_started(&key, ctx).await?;
            }
            Err(source) => {
                return Err(ExecuteError::Start {
                    key,
                    source: Arc::new(source),
                })
            }
        }

        debug!(phase = %CallPhase::ResolvingPort, key = %key, "Resolving host port");
        let port = ctx.run(self.instances.get_port(&key)).await?;
        if port == 0 {
            return Err(ExecuteError::PortUnavailable { key });
        }

        let address = format!("127.0.0.1:{port}");
        let timeout = match ctx.remaining() {
            Some(remaining) => remaining.min(self.invocation_timeout),
            None => self.invocation_timeout,
        };

        debug!(phase = %CallPhase::Invoking, key = %key, address = %address, "Invoking instance");
        ctx.run(self.invoker.invoke(&address, body, timeout))
            .await?
            .map_err(|source| ExecuteError::Invocation { key, source })
    }

    /// Join the start flight for `key`, spawning one if none is in progress.
    async fn ensure_started(&self, key: &Key, ctx: &CallContext) -> Result<(), ExecuteError> {
        let flight = {
            let mut flights = self.flights.lock().await;
            match flights.get(key) {
                Some(flight) => {
                    debug!(key = %key, "Joining in-flight start");
                    flight.clone()
                }
                None => {
                    let flight = self.spawn_flight(key.clone());
                    flights.insert(key.clone(), flight.clone());
                    flight
                }
            }
        };

        ctx.run(flight)
            .await?
            .map_err(|source| ExecuteError::Start {
                key: key.clone(),
                source,
            })
    }

    fn spawn_flight(&self, key: Key) -> StartFlight {
        let instances = Arc::clone(&self.instances);
        let flights = Arc::clone(&self.flights);
        let start_timeout = self.start_timeout;

        let mut ctx = CallContext::with_timeout(start_timeout);
        if let Some(shutdown) = &self.shutdown {
            ctx = ctx.with_cancellation(shutdown.clone());
        }

        let task = tokio::spawn(async move {
            info!(key = %key, "Starting instance");
            let result = instances.start(&key, &ctx).await;
            if let Err(e) = &result {
                warn!(
                    key = %key,
                    kind = e.kind(),
                    start_timeout_ms = start_timeout.as_millis() as u64,
                    error = %e,
                    "Start flight failed"
                );
            }
            flights.lock().await.remove(&key);
            result.map_err(Arc::new)
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Start task ended abnormally");
                    Err(Arc::new(DriverError::Cancelled))
                }
            }
        }
        .boxed()
        .shared()
    }
}
