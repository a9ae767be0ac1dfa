//! Docker runtime implementation.
//!
//! Implements `ContainerRuntime` on top of the Docker Engine API. Names passed
//! to `inspect` and `create` are keys; ids returned by `create` are the
//! engine's container ids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, CreateSpec, InstanceInfo, RuntimeError};

use super::api::{ApiError, DockerClient};
use super::types::{ContainerCreate, ContainerInspect};

/// Docker runtime for production use.
pub struct DockerRuntime {
    client: DockerClient,
}

impl DockerRuntime {
    /// Create a runtime talking to the engine socket at `client`.
    pub fn new(client: DockerClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &DockerClient {
        &self.client
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<InstanceInfo, RuntimeError> {
        let inspect = self
            .client
            .inspect_container(name)
            .await
            .map_err(|e| map_api_error(name, e))?;
        Ok(instance_info(inspect))
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError> {
        info!(
            name = %spec.name,
            image = %spec.image,
            host_port = ?spec.host_port,
            source = %spec.mount.source,
            "Creating container"
        );

        let body = ContainerCreate::from(spec);
        let created = self
            .client
            .create_container(&spec.name, &body)
            .await
            .map_err(|e| map_api_error(&spec.name, e))?;

        for warning in created.warnings.iter().flatten() {
            warn!(name = %spec.name, warning = %warning, "Docker create warning");
        }

        debug!(name = %spec.name, id = %created.id, "Container created");
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(id)
            .await
            .map_err(|e| map_api_error(id, e))?;
        debug!(id, "Container started");
        Ok(())
    }
}

fn instance_info(inspect: ContainerInspect) -> InstanceInfo {
    let created_at = inspect.created.as_deref().and_then(|created| {
        DateTime::parse_from_rfc3339(created)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    });

    InstanceInfo {
        state: inspect.lifecycle(),
        ports: inspect.port_bindings(),
        name: inspect.short_name().to_string(),
        id: inspect.id,
        created_at,
    }
}

fn map_api_error(name: &str, err: ApiError) -> RuntimeError {
    match err {
        ApiError::Api { status: 404, .. } => RuntimeError::NotFound(name.to_string()),
        ApiError::Api { status: 409, .. } => RuntimeError::Conflict(name.to_string()),
        ApiError::Api { status, message } => RuntimeError::Api { status, message },
        ApiError::Json(e) => RuntimeError::Json(e),
        ApiError::Http(e) => RuntimeError::Transport(e.to_string()),
        ApiError::Request(message) => RuntimeError::Transport(message),
    }
}
