//! Docker container runtime implementation.
//!
//! This module provides the production runtime, implementing the
//! `ContainerRuntime` trait defined in the runtime module.
//!
//! ## Components
//!
//! - `api`: HTTP client for the Docker Engine's Unix socket API
//! - `types`: request and response bodies (inspect, create)
//! - `runtime`: `ContainerRuntime` implementation

mod api;
mod runtime;
mod types;

pub use api::{ApiError, DockerClient};
pub use runtime::DockerRuntime;
pub use types::{ContainerCreate, ContainerInspect};
