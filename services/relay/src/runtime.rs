//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the three container operations the relay needs:
//! - Inspecting a container by name
//! - Creating a container from a `CreateSpec`
//! - Starting a created container
//!
//! The relay never caches what the runtime reports; it inspects again whenever it
//! needs to know. A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

/// Errors reported by a container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No container with that name or id.
    #[error("no such container: {0}")]
    NotFound(String),

    /// A container with that name already exists.
    #[error("container name conflict: {0}")]
    Conflict(String),

    /// The runtime answered with an error status.
    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The runtime could not be reached.
    #[error("runtime transport error: {0}")]
    Transport(String),

    /// The runtime did not answer within the call's time bound.
    #[error("runtime {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The runtime answered with a body we could not decode.
    #[error("runtime JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Lifecycle state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl LifecycleState {
    pub fn parse(status: &str) -> Self {
        match status {
            "created" => LifecycleState::Created,
            "running" => LifecycleState::Running,
            "paused" => LifecycleState::Paused,
            "restarting" => LifecycleState::Restarting,
            "removing" => LifecycleState::Removing,
            "exited" => LifecycleState::Exited,
            "dead" => LifecycleState::Dead,
            _ => LifecycleState::Unknown,
        }
    }
}

/// One host side of a port mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// What an inspection tells us about a container.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    /// Runtime identifier.
    pub id: String,

    /// Container name (the key).
    pub name: String,

    pub state: LifecycleState,

    pub created_at: Option<DateTime<Utc>>,

    /// Port bindings keyed by container port (`"8080/tcp"`).
    pub ports: HashMap<String, Vec<PortBinding>>,
}

impl InstanceInfo {
    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }

    /// First host port bound to `internal_port`, if any.
    ///
    /// Only TCP mappings count; bindings with an empty or non-numeric host port
    /// are skipped.
    pub fn host_port(&self, internal_port: &str) -> Option<u16> {
        if !internal_port.ends_with("/tcp") {
            return None;
        }
        self.ports
            .get(internal_port)?
            .iter()
            .find_map(|binding| {
                binding
                    .host_port
                    .parse::<u16>()
                    .ok()
                    .filter(|port| *port != 0)
            })
    }
}

/// Read-only bind mount of the artifact directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create a function container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    /// Container name (the key).
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Container port to expose (`"8080/tcp"`).
    pub internal_port: String,
    /// Host port to bind, or `None` to let the runtime choose.
    pub host_port: Option<u16>,
    pub mount: BindMount,
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Inspect a container by name or id.
    async fn inspect(&self, name: &str) -> Result<InstanceInfo, RuntimeError>;

    /// Create a container; returns its runtime id.
    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError>;

    /// Start a created container. Starting a running container is not an error.
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;
}

// =============================================================================
// Mock runtime
// =============================================================================

/// A container held by the mock runtime.
#[derive(Debug, Clone)]
struct MockContainer {
    info: InstanceInfo,
    spec: Option<CreateSpec>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    fail_inspect: bool,
    fail_create: bool,
    fail_start: bool,
    start_makes_running: bool,
    hide_ports: bool,
    publish_port: Option<u16>,
    create_delay: Duration,
    inspect_delay: Duration,
    hang_create: bool,
}

/// Mock runtime for testing and development.
///
/// Containers live in memory. By default `start` marks a container running with
/// the host port it was created with; the knobs below simulate failures and
/// containers that never come up.
#[derive(Debug, Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    id_counter: Arc<AtomicUsize>,
    inspect_calls: Arc<AtomicUsize>,
    create_calls: Arc<AtomicUsize>,
    start_calls: Arc<AtomicUsize>,
}

impl MockRuntime {
    /// Create a new, empty mock runtime.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                start_makes_running: true,
                ..Default::default()
            })),
            id_counter: Arc::new(AtomicUsize::new(0)),
            inspect_calls: Arc::new(AtomicUsize::new(0)),
            create_calls: Arc::new(AtomicUsize::new(0)),
            start_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the assertions.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("mock_{:012x}", counter)
    }

    /// Add a running container named `name` bound to `host_port`.
    pub fn with_running(self, name: &str, internal_port: &str, host_port: u16) -> Self {
        let id = self.next_id();
        let mut ports = HashMap::new();
        ports.insert(
            internal_port.to_string(),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: host_port.to_string(),
            }],
        );
        self.lock().containers.insert(
            name.to_string(),
            MockContainer {
                info: InstanceInfo {
                    id,
                    name: name.to_string(),
                    state: LifecycleState::Running,
                    created_at: Some(Utc::now()),
                    ports,
                },
                spec: None,
            },
        );
        self
    }

    /// Add a created-but-stopped container with no port bindings.
    pub fn with_stopped(self, name: &str) -> Self {
        let id = self.next_id();
        self.lock().containers.insert(
            name.to_string(),
            MockContainer {
                info: InstanceInfo {
                    id,
                    name: name.to_string(),
                    state: LifecycleState::Exited,
                    created_at: Some(Utc::now()),
                    ports: HashMap::new(),
                },
                spec: None,
            },
        );
        self
    }

    /// Containers stay `created` after `start` (they never report running).
    pub fn never_running(self) -> Self {
        self.lock().start_makes_running = false;
        self
    }

    /// Report running containers without any port bindings.
    pub fn without_ports(self) -> Self {
        self.lock().hide_ports = true;
        self
    }

    /// Fail every inspection with a transport error.
    pub fn failing_inspect(self) -> Self {
        self.lock().fail_inspect = true;
        self
    }

    /// Fail every create call.
    pub fn failing_create(self) -> Self {
        self.lock().fail_create = true;
        self
    }

    /// Fail every start call.
    pub fn failing_start(self) -> Self {
        self.lock().fail_start = true;
        self
    }

    /// Publish every created container on `port`, whatever host port was asked for.
    pub fn publishing(self, port: u16) -> Self {
        self.lock().publish_port = Some(port);
        self
    }

    /// Delay create calls, widening the window for concurrent callers.
    pub fn with_create_delay(self, delay: Duration) -> Self {
        self.lock().create_delay = delay;
        self
    }

    /// Delay inspections, simulating a slow runtime.
    pub fn with_inspect_delay(self, delay: Duration) -> Self {
        self.lock().inspect_delay = delay;
        self
    }

    /// Create calls never return.
    pub fn hanging_create(self) -> Self {
        self.lock().hang_create = true;
        self
    }

    /// Toggle hanging creates on a live runtime. Calls already hanging stay hung.
    pub fn set_hang_create(&self, hang: bool) {
        self.lock().hang_create = hang;
    }

    /// Toggle inspection failures on a live runtime.
    pub fn set_fail_inspect(&self, fail: bool) {
        self.lock().fail_inspect = fail;
    }

    pub fn inspect_calls(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Number of containers the runtime holds.
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// The `CreateSpec` a container was created from.
    pub fn created_spec(&self, name: &str) -> Option<CreateSpec> {
        self.lock()
            .containers
            .get(name)
            .and_then(|container| container.spec.clone())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn inspect(&self, name: &str) -> Result<InstanceInfo, RuntimeError> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.lock().inspect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();

        if state.fail_inspect {
            return Err(RuntimeError::Transport(
                "[MOCK] runtime socket unavailable".to_string(),
            ));
        }

        let container = state
            .containers
            .values()
            .find(|c| c.info.name == name || c.info.id == name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;

        let mut info = container.info.clone();
        if state.hide_ports {
            info.ports.clear();
        }
        Ok(info)
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let hang = self.lock().hang_create;
        if hang {
            std::future::pending::<()>().await;
        }

        let delay = self.lock().create_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let id = self.next_id();
        let mut state = self.lock();

        if state.fail_create {
            return Err(RuntimeError::Api {
                status: 500,
                message: "[MOCK] create failed".to_string(),
            });
        }

        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }

        info!(name = %spec.name, image = %spec.image, host_port = ?spec.host_port, "[MOCK] Creating container");

        // Runtime-assigned ports come from the top of the ephemeral range.
        let host_port = state.publish_port.or(spec.host_port).unwrap_or_else(|| {
            let counter = self.id_counter.load(Ordering::SeqCst) % 16_000;
            49_152 + counter as u16
        });
        let mut ports = HashMap::new();
        ports.insert(
            spec.internal_port.clone(),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: host_port.to_string(),
            }],
        );

        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                info: InstanceInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    state: LifecycleState::Created,
                    created_at: Some(Utc::now()),
                    ports,
                },
                spec: Some(spec.clone()),
            },
        );

        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();

        if state.fail_start {
            return Err(RuntimeError::Api {
                status: 500,
                message: "[MOCK] start failed".to_string(),
            });
        }

        let makes_running = state.start_makes_running;
        let container = state
            .containers
            .values_mut()
            .find(|c| c.info.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        if makes_running {
            container.info.state = LifecycleState::Running;
        }
        debug!(id, running = makes_running, "[MOCK] Started container");
        Ok(())
    }
}
