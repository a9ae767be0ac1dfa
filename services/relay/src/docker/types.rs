//! Docker Engine API request and response bodies.
//!
//! Only the fields the relay reads or sets are modelled; everything else in the
//! engine's payloads is ignored on decode.
//!
//! Reference: https://docs.docker.com/engine/api/latest/#tag/Container

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::runtime::{CreateSpec, LifecycleState, PortBinding};

/// `GET /containers/{name}/json` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    /// Engine names carry a leading `/`.
    pub name: String,
    #[serde(default)]
    pub created: Option<String>,
    pub state: ContainerState,
    #[serde(default)]
    pub network_settings: Option<NetworkSettings>,
}

impl ContainerInspect {
    pub fn lifecycle(&self) -> LifecycleState {
        if self.state.running {
            LifecycleState::Running
        } else {
            LifecycleState::parse(&self.state.status)
        }
    }

    /// Container name without the engine's leading `/`.
    pub fn short_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    /// Port bindings keyed by container port. Unbound ports map to an empty list.
    pub fn port_bindings(&self) -> HashMap<String, Vec<PortBinding>> {
        self.network_settings
            .as_ref()
            .and_then(|settings| settings.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|(port, bindings)| {
                        let bindings = bindings
                            .iter()
                            .flatten()
                            .map(|b| PortBinding {
                                host_ip: b.host_ip.clone(),
                                host_port: b.host_port.clone(),
                            })
                            .collect();
                        (port.clone(), bindings)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    /// `null` for a port that is exposed but not published.
    #[serde(default)]
    pub ports: Option<HashMap<String, Option<Vec<HostBinding>>>>,
}

/// Host side of a published port, as the engine spells it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    /// Empty asks the engine to pick a free port.
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

/// `POST /containers/create` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreate {
    pub image: String,
    pub cmd: Vec<String>,
    pub exposed_ports: HashMap<String, EmptyObject>,
    pub host_config: HostConfig,
}

/// Serializes as `{}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub port_bindings: HashMap<String, Vec<HostBinding>>,
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mount {
    #[serde(rename = "Type")]
    pub kind: String,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl From<&CreateSpec> for ContainerCreate {
    fn from(spec: &CreateSpec) -> Self {
        let host_port = spec.host_port.map(|p| p.to_string()).unwrap_or_default();

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(spec.internal_port.clone(), EmptyObject::default());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            spec.internal_port.clone(),
            vec![HostBinding {
                host_ip: String::new(),
                host_port,
            }],
        );

        Self {
            image: spec.image.clone(),
            cmd: spec.command.clone(),
            exposed_ports,
            host_config: HostConfig {
                port_bindings,
                mounts: vec![Mount {
                    kind: "bind".to_string(),
                    source: spec.mount.source.clone(),
                    target: spec.mount.target.clone(),
                    read_only: spec.mount.read_only,
                }],
            },
        }
    }
}

/// `POST /containers/create` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreated {
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::runtime::BindMount;

    #[test]
    fn test_decode_running_inspect() {
        let body = json!({
            "Id": "4f66ad9a0b2e",
            "Name": "/abc123",
            "Created": "2024-05-01T10:00:00.123456789Z",
            "State": { "Status": "running", "Running": true, "Pid": 4242 },
            "NetworkSettings": {
                "Ports": {
                    "8080/tcp": [
                        { "HostIp": "0.0.0.0", "HostPort": "49153" },
                        { "HostIp": "::", "HostPort": "49153" }
                    ],
                    "9000/tcp": null
                }
            }
        });

        let inspect: ContainerInspect = serde_json::from_value(body).unwrap();
        assert_eq!(inspect.short_name(), "abc123");
        assert_eq!(inspect.lifecycle(), LifecycleState::Running);

        let ports = inspect.port_bindings();
        assert_eq!(ports["8080/tcp"].len(), 2);
        assert_eq!(ports["8080/tcp"][0].host_port, "49153");
        assert!(ports["9000/tcp"].is_empty());
    }

    #[test]
    fn test_decode_created_without_network() {
        let body = json!({
            "Id": "4f66ad9a0b2e",
            "Name": "/abc123",
            "State": { "Status": "created", "Running": false }
        });

        let inspect: ContainerInspect = serde_json::from_value(body).unwrap();
        assert_eq!(inspect.lifecycle(), LifecycleState::Created);
        assert!(inspect.port_bindings().is_empty());
    }

    #[test]
    fn test_create_body_shape() {
        let spec = CreateSpec {
            name: "abc123".to_string(),
            image: "ignite/base".to_string(),
            command: vec!["/func/main".to_string()],
            internal_port: "8080/tcp".to_string(),
            host_port: Some(40123),
            mount: BindMount {
                source: "/var/lib/ignite/funcs/abc123".to_string(),
                target: "/func/".to_string(),
                read_only: true,
            },
        };

        let body = serde_json::to_value(ContainerCreate::from(&spec)).unwrap();
        assert_eq!(
            body,
            json!({
                "Image": "ignite/base",
                "Cmd": ["/func/main"],
                "ExposedPorts": { "8080/tcp": {} },
                "HostConfig": {
                    "PortBindings": {
                        "8080/tcp": [{ "HostIp": "", "HostPort": "40123" }]
                    },
                    "Mounts": [{
                        "Type": "bind",
                        "Source": "/var/lib/ignite/funcs/abc123",
                        "Target": "/func/",
                        "ReadOnly": true
                    }]
                }
            })
        );
    }

    #[test]
    fn test_runtime_assigned_port_is_empty() {
        let spec = CreateSpec {
            name: "abc123".to_string(),
            image: "ignite/base".to_string(),
            command: vec![],
            internal_port: "8080/tcp".to_string(),
            host_port: None,
            mount: BindMount {
                source: "/src".to_string(),
                target: "/func/".to_string(),
                read_only: true,
            },
        };

        let body = ContainerCreate::from(&spec);
        assert_eq!(body.host_config.port_bindings["8080/tcp"][0].host_port, "");
    }
}
