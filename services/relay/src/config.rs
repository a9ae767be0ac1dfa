//! Configuration for the relay.
//!
//! Everything here is fixed at construction time; nothing is configurable per call.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::keys::Key;

/// How every function container is created.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    /// Base image that knows how to load a function artifact.
    pub image: String,

    /// Entrypoint command run inside the container.
    pub command: Vec<String>,

    /// Port the function serves `Invoke` on inside the container (`"8080/tcp"`).
    pub internal_port: String,

    /// Host directory holding one artifact directory per key.
    pub mount_source_prefix: PathBuf,

    /// Where the artifact directory is mounted (read-only) in the container.
    pub mount_target: String,

    /// Upper bound on waiting for a started container to become reachable.
    pub ready_timeout: Duration,

    /// Pause between readiness probes.
    pub retry_interval: Duration,

    /// Per-attempt TCP connect timeout (readiness probes and RPC connects).
    pub connection_timeout: Duration,

    /// Upper bound on a single runtime API call (inspect, create, start).
    pub runtime_timeout: Duration,

    /// Let the runtime pick the host port instead of reserving one locally.
    pub runtime_assigned_ports: bool,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            image: "ignite/base".to_string(),
            command: vec!["/func/main".to_string()],
            internal_port: "8080/tcp".to_string(),
            mount_source_prefix: PathBuf::from("/var/lib/ignite/funcs"),
            mount_target: "/func/".to_string(),
            ready_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(1),
            runtime_timeout: Duration::from_secs(30),
            runtime_assigned_ports: false,
        }
    }
}

impl DeploymentConfig {
    /// Host path of the artifact directory for `key`.
    pub fn mount_source(&self, key: &Key) -> PathBuf {
        self.mount_source_prefix.join(key.as_str())
    }

    /// Longest a start can take: inspect, create, a conflict re-inspect and
    /// start, then the readiness wait plus one last probe.
    pub fn start_budget(&self) -> Duration {
        self.runtime_timeout * 4 + self.ready_timeout + self.connection_timeout
    }
}

/// Relay process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the `CommunicationService` listens on.
    pub listen_addr: SocketAddr,

    /// Container runtime API socket.
    pub docker_socket: PathBuf,

    /// Directory of action -> key mapping files.
    pub action_base_dir: PathBuf,

    /// Deadline for a single `Invoke` call against an instance.
    pub invocation_timeout: Duration,

    /// Optional overall deadline for one `Execute` call.
    pub execute_timeout: Option<Duration>,

    /// Container creation settings.
    pub deployment: DeploymentConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5001)),
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            action_base_dir: PathBuf::from("/var/lib/ignite/actions"),
            invocation_timeout: Duration::from_secs(10),
            execute_timeout: None,
            deployment: DeploymentConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let deployment_defaults = defaults.deployment.clone();

        let listen_addr = lookup("IGNITE_LISTEN_ADDR")
            .map(|v| v.parse::<SocketAddr>())
            .transpose()
            .context("IGNITE_LISTEN_ADDR must be a socket address (e.g. 0.0.0.0:5001).")?
            .unwrap_or(defaults.listen_addr);

        let docker_socket = lookup("IGNITE_DOCKER_SOCKET")
            .map(|v| PathBuf::from(v.trim_start_matches("unix://")))
            .unwrap_or(defaults.docker_socket);

        let action_base_dir = lookup("IGNITE_ACTION_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.action_base_dir);

        let invocation_timeout = millis(&lookup, "IGNITE_INVOCATION_TIMEOUT_MS")?
            .unwrap_or(defaults.invocation_timeout);

        let execute_timeout = millis(&lookup, "IGNITE_EXECUTE_TIMEOUT_MS")?;

        let command = lookup("IGNITE_FUNCTION_COMMAND")
            .map(|v| v.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or(deployment_defaults.command);

        let internal_port = lookup("IGNITE_INTERNAL_PORT")
            .map(|v| if v.contains('/') { v } else { format!("{v}/tcp") })
            .unwrap_or(deployment_defaults.internal_port);

        let runtime_assigned_ports = lookup("IGNITE_RUNTIME_ASSIGNED_PORTS")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(deployment_defaults.runtime_assigned_ports);

        let deployment = DeploymentConfig {
            image: lookup("IGNITE_IMAGE").unwrap_or(deployment_defaults.image),
            command,
            internal_port,
            mount_source_prefix: lookup("IGNITE_FUNCS_DIR")
                .map(PathBuf::from)
                .unwrap_or(deployment_defaults.mount_source_prefix),
            mount_target: lookup("IGNITE_MOUNT_TARGET")
                .unwrap_or(deployment_defaults.mount_target),
            ready_timeout: millis(&lookup, "IGNITE_READY_TIMEOUT_MS")?
                .unwrap_or(deployment_defaults.ready_timeout),
            retry_interval: millis(&lookup, "IGNITE_RETRY_INTERVAL_MS")?
                .unwrap_or(deployment_defaults.retry_interval)
                .max(Duration::from_millis(10)),
            connection_timeout: millis(&lookup, "IGNITE_CONNECT_TIMEOUT_MS")?
                .unwrap_or(deployment_defaults.connection_timeout),
            runtime_timeout: millis(&lookup, "IGNITE_RUNTIME_TIMEOUT_MS")?
                .unwrap_or(deployment_defaults.runtime_timeout),
            runtime_assigned_ports,
        };

        let log_level = lookup("IGNITE_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            listen_addr,
            docker_socket,
            action_base_dir,
            invocation_timeout,
            execute_timeout,
            deployment,
            log_level,
        })
    }
}

fn millis<F>(lookup: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.parse::<u64>())
        .transpose()
        .with_context(|| format!("{name} must be an integer (milliseconds)."))
        .map(|ms| ms.map(Duration::from_millis))
}
