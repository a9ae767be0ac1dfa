//! Instance driver.
//!
//! Maps a key to exactly one container named after it. The driver never keeps
//! its own view of what exists: every status, start and port lookup begins with
//! a fresh runtime inspection.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use ignite_networking::{NetworkError, PortAllocator};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DeploymentConfig;
use crate::context::{CallContext, Interrupted};
use crate::keys::Key;
use crate::readiness::ReadinessProber;
use crate::runtime::{BindMount, ContainerRuntime, CreateSpec, RuntimeError};

/// Errors from driving an instance.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to inspect instance {key}: {source}")]
    InstanceInspect {
        key: Key,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to create instance {key}: {source}")]
    InstanceCreate {
        key: Key,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to start instance {key}: {source}")]
    InstanceStart {
        key: Key,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to allocate host port: {0}")]
    PortAllocation(#[from] NetworkError),

    #[error("instance {key} did not become ready in time")]
    ReadinessTimeout { key: Key },

    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl DriverError {
    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::InstanceInspect { .. } => "instance_inspect",
            DriverError::InstanceCreate { .. } => "instance_create",
            DriverError::InstanceStart { .. } => "instance_start",
            DriverError::PortAllocation(_) => "port_allocation",
            DriverError::ReadinessTimeout { .. } => "readiness_timeout",
            DriverError::Cancelled => "cancelled",
            DriverError::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl From<Interrupted> for DriverError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::Cancelled => DriverError::Cancelled,
            Interrupted::DeadlineExceeded => DriverError::DeadlineExceeded,
        }
    }
}

/// What an inspection says about the instance for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    /// Exists in some other lifecycle state (created, exited, ...).
    NotRunning,
    /// The runtime has no container with that name.
    Absent,
}

/// Instance operations the orchestrator depends on.
#[async_trait]
pub trait Instances: Send + Sync {
    /// Inspect the instance for `key`. Inspection failures other than
    /// "not found" are errors, never `Absent`.
    async fn status(&self, key: &Key) -> Result<InstanceStatus, DriverError>;

    /// `true` only when the instance is known to be running.
    ///
    /// Inspection failures read as `false`; `status` tells them apart from an
    /// absent instance.
    async fn is_running(&self, key: &Key) -> bool {
        match self.status(key).await {
            Ok(status) => status == InstanceStatus::Running,
            Err(e) => {
                warn!(key = %key, error = %e, "Instance status unknown, treating as not running");
                false
            }
        }
    }

    /// Ensure the instance exists, is started and accepts connections.
    async fn start(&self, key: &Key, ctx: &CallContext) -> Result<(), DriverError>;

    /// Host port bound to the internal port, or `0` if there is none.
    async fn get_port(&self, key: &Key) -> u16;
}

/// Drives containers through a `ContainerRuntime`.
pub struct InstanceDriver {
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<dyn PortAllocator>,
    prober: ReadinessProber,
    config: DeploymentConfig,
}

impl InstanceDriver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<dyn PortAllocator>,
        config: DeploymentConfig,
    ) -> Self {
        let prober = ReadinessProber::new(Arc::clone(&runtime), &config);
        Self {
            runtime,
            ports,
            prober,
            config,
        }
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    /// Bound one runtime call by `runtime_timeout`.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, RuntimeError> {
        let after = self.config.runtime_timeout;
        timeout(after, call)
            .await
            .unwrap_or_else(|_| Err(RuntimeError::Timeout { operation, after }))
    }

    fn create_spec(&self, key: &Key, host_port: Option<u16>) -> CreateSpec {
        CreateSpec {
            name: key.as_str().to_string(),
            image: self.config.image.clone(),
            command: self.config.command.clone(),
            internal_port: self.config.internal_port.clone(),
            host_port,
            mount: BindMount {
                source: self.config.mount_source(key).to_string_lossy().to_string(),
                target: self.config.mount_target.clone(),
                read_only: true,
            },
        }
    }

    /// Create the container for `key`; returns its runtime id.
    ///
    /// The host port stays reserved until the create request is about to be
    /// sent. Losing a create race to a concurrent caller is not an error: the
    /// winner's container is reused.
    async fn create(&self, key: &Key, ctx: &CallContext) -> Result<String, DriverError> {
        let reservation = if self.config.runtime_assigned_ports {
            None
        } else {
            Some(self.ports.reserve()?)
        };

        let spec = self.create_spec(key, reservation.as_ref().map(|r| r.port()));
        if let Some(reservation) = reservation {
            let port = reservation.release();
            debug!(key = %key, host_port = port, "Released port reservation");
        }

        match ctx
            .run(self.bounded("create", self.runtime.create(&spec)))
            .await?
        {
            Ok(id) => {
                info!(key = %key, id = %id, host_port = ?spec.host_port, "Created instance");
                Ok(id)
            }
            Err(RuntimeError::Conflict(_)) => {
                info!(key = %key, "Instance created concurrently, reusing it");
                let info = ctx
                    .run(self.bounded("inspect", self.runtime.inspect(key.as_str())))
                    .await?
                    .map_err(|source| DriverError::InstanceInspect {
                        key: key.clone(),
                        source,
                    })?;
                Ok(info.id)
            }
            Err(source) => Err(DriverError::InstanceCreate {
                key: key.clone(),
                source,
            }),
        }
    }
}

#[async_trait]
impl Instances for InstanceDriver {
    async fn status(&self, key: &Key) -> Result<InstanceStatus, DriverError> {
        match self
            .bounded("inspect", self.runtime.inspect(key.as_str()))
            .await
        {
            Ok(info) if info.is_running() => Ok(InstanceStatus::Running),
            Ok(info) => {
                debug!(key = %key, state = ?info.state, "Instance exists but is not running");
                Ok(InstanceStatus::NotRunning)
            }
            Err(e) if e.is_not_found() => Ok(InstanceStatus::Absent),
            Err(source) => Err(DriverError::InstanceInspect {
                key: key.clone(),
                source,
            }),
        }
    }

    async fn start(&self, key: &Key, ctx: &CallContext) -> Result<(), DriverError> {
        let id = match ctx
            .run(self.bounded("inspect", self.runtime.inspect(key.as_str())))
            .await?
        {
            Ok(info) => {
                debug!(key = %key, id = %info.id, state = ?info.state, "Reusing existing instance");
                info.id
            }
            Err(e) if e.is_not_found() => self.create(key, ctx).await?,
            Err(source) => {
                return Err(DriverError::InstanceInspect {
                    key: key.clone(),
                    source,
                })
            }
        };

        ctx.run(self.bounded("start", self.runtime.start(&id)))
            .await?
            .map_err(|source| DriverError::InstanceStart {
                key: key.clone(),
                source,
            })?;
        debug!(key = %key, id = %id, "Instance started, waiting for readiness");

        self.prober.wait_ready(key, ctx).await
    }

    async fn get_port(&self, key: &Key) -> u16 {
        match self
            .bounded("inspect", self.runtime.inspect(key.as_str()))
            .await
        {
            Ok(info) => match info.host_port(&self.config.internal_port) {
                Some(port) => port,
                None => {
                    debug!(key = %key, internal_port = %self.config.internal_port, "No host port binding");
                    0
                }
            },
            Err(e) => {
                debug!(key = %key, error = %e, "Port lookup inspection failed");
                0
            }
        }
    }
}
