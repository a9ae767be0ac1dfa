//! Docker Engine HTTP API client.
//!
//! This module provides an HTTP client for the Docker Engine's Unix socket API.
//! Only the container endpoints the relay needs are covered: inspect, create,
//! start, plus `_ping` for startup diagnostics.
//!
//! Reference: https://docs.docker.com/engine/api/latest/

use std::path::Path;

use hyper::body::Bytes;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error};

use super::types::{ContainerCreate, ContainerCreated, ContainerInspect};

/// Errors from the Docker Engine API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid request: {0}")]
    Request(String),
}

impl ApiError {
    /// HTTP status of an API error, if the engine answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<hyper::http::Error> for ApiError {
    fn from(err: hyper::http::Error) -> Self {
        ApiError::Request(err.to_string())
    }
}

/// Engine error body (`{"message": "..."}`).
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Docker Engine API client for Unix socket communication.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerClient {
    /// Create a new client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Check that the engine answers.
    pub async fn ping(&self) -> Result<(), ApiError> {
        self.send(Method::GET, "/_ping", None).await.map(|_| ())
    }

    /// Inspect a container by name or id.
    pub async fn inspect_container(&self, name: &str) -> Result<ContainerInspect, ApiError> {
        let path = format!("/containers/{}/json", name);
        self.get(&path).await
    }

    /// Create a named container.
    pub async fn create_container(
        &self,
        name: &str,
        config: &ContainerCreate,
    ) -> Result<ContainerCreated, ApiError> {
        let path = format!("/containers/create?name={}", name);
        self.post(&path, config).await
    }

    /// Start a container. An already-started container (304) is not an error.
    pub async fn start_container(&self, id: &str) -> Result<(), ApiError> {
        let path = format!("/containers/{}/start", id);
        let (status, _) = self.send(Method::POST, &path, None).await?;
        if status == StatusCode::NOT_MODIFIED {
            debug!(id, "Container already started");
        }
        Ok(())
    }

    /// Perform a GET request and decode the JSON response.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let (_, body) = self.send(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Perform a POST request with a JSON body and decode the JSON response.
    async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body_bytes = serde_json::to_vec(body)?;
        let (_, body) = self.send(Method::POST, path, Some(body_bytes)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Send a request; non-2xx/304 answers become `ApiError::Api`.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), ApiError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "Request to Docker API");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");

        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };

        let request = builder.body(body)?;
        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok((status, body));
        }

        let message = serde_json::from_slice::<ErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).to_string());

        if status != StatusCode::NOT_FOUND {
            error!(status = %status, message = %message, path, "Docker API error");
        }

        Err(ApiError::Api {
            status: status.as_u16(),
            message,
        })
    }
}
