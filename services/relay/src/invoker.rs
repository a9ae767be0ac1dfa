//! Invocation client.
//!
//! One unary `FunctionRunnerService/Invoke` call per invocation. A fresh channel
//! is opened for every call and dropped afterwards; instances are local, so the
//! connect cost is a loopback handshake.

use std::time::Duration;

use async_trait::async_trait;
use ignite_proto::function::v1::{FunctionRunnerServiceClient, InvokeRequest};
use thiserror::Error;
use tonic::transport::Endpoint;
use tonic::Code;
use tracing::debug;

/// Errors from invoking a function instance.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The endpoint was invalid or could not be connected to.
    #[error("failed to reach function at {address}: {source}")]
    InvocationTransport {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// The call reached the function but returned a gRPC error status.
    #[error("function at {address} returned {code:?}: {message}")]
    InvocationRemote {
        address: String,
        code: Code,
        message: String,
    },
}

impl InvokeError {
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::InvocationTransport { .. } => "invocation_transport",
            InvokeError::InvocationRemote { .. } => "invocation_remote",
        }
    }

    /// gRPC status code, if the function answered.
    pub fn code(&self) -> Option<Code> {
        match self {
            InvokeError::InvocationRemote { code, .. } => Some(*code),
            InvokeError::InvocationTransport { .. } => None,
        }
    }
}

/// Calls a function instance at `address` (`host:port`).
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        address: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<String, InvokeError>;
}

/// `Invoker` over a plaintext gRPC channel.
#[derive(Debug, Clone)]
pub struct GrpcInvoker {
    connect_timeout: Duration,
}

impl GrpcInvoker {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Invoker for GrpcInvoker {
    async fn invoke(
        &self,
        address: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<String, InvokeError> {
        let transport = |source| InvokeError::InvocationTransport {
            address: address.to_string(),
            source,
        };

        let channel = Endpoint::from_shared(format!("http://{address}"))
            .map_err(transport)?
            .connect_timeout(self.connect_timeout)
            .timeout(timeout)
            .connect()
            .await
            .map_err(transport)?;

        let mut client = FunctionRunnerServiceClient::new(channel);
        let mut request = tonic::Request::new(InvokeRequest {
            payload: payload.to_string(),
        });
        request.set_timeout(timeout);

        debug!(address, payload_bytes = payload.len(), "Invoking function");

        let response = client
            .invoke(request)
            .await
            .map_err(|status| InvokeError::InvocationRemote {
                address: address.to_string(),
                code: status.code(),
                message: status.message().to_string(),
            })?;

        Ok(response.into_inner().output)
    }
}
