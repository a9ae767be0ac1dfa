//! `CommunicationService` gRPC surface.
//!
//! Callers only ever see `"success"` with the function output or `"error"` with
//! an empty body. The error kind and detail go to the log.

use std::sync::Arc;
use std::time::Duration;

use ignite_proto::relay::v1::{
    CommunicationService, CommunicationServiceServer, ExecuteRequest, ExecuteResponse,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::context::CallContext;
use crate::orchestrator::Orchestrator;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// gRPC handler that forwards `Execute` to the orchestrator.
pub struct RelayService {
    orchestrator: Arc<Orchestrator>,
    shutdown: watch::Receiver<bool>,
    execute_timeout: Option<Duration>,
}

impl RelayService {
    pub fn new(orchestrator: Arc<Orchestrator>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            orchestrator,
            shutdown,
            execute_timeout: None,
        }
    }

    /// Bound every call to `timeout`, even if the caller set no deadline.
    pub fn with_execute_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn into_server(self) -> CommunicationServiceServer<Self> {
        CommunicationServiceServer::new(self)
    }

    fn call_context(&self, metadata: &MetadataMap) -> CallContext {
        let now = Instant::now();
        let mut ctx = CallContext::background().with_cancellation(self.shutdown.clone());

        if let Some(timeout) = self.execute_timeout {
            ctx = ctx.with_deadline(now + timeout);
        }
        if let Some(timeout) = grpc_timeout(metadata) {
            debug!(timeout_ms = timeout.as_millis() as u64, "Caller deadline");
            ctx = ctx.with_deadline(now + timeout);
        }
        ctx
    }
}

#[tonic::async_trait]
impl CommunicationService for RelayService {
    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteResponse>, Status> {
        let ctx = self.call_context(request.metadata());
        let ExecuteRequest { action, body } = request.into_inner();

        // Failures were already logged with their kind by the orchestrator.
        let response = match self.orchestrator.execute(&action, &body, &ctx).await {
            Ok(resp) => ExecuteResponse {
                status: STATUS_SUCCESS.to_string(),
                resp,
            },
            Err(_) => ExecuteResponse {
                status: STATUS_ERROR.to_string(),
                resp: String::new(),
            },
        };

        Ok(Response::new(response))
    }
}

/// Parse the `grpc-timeout` request header (`"<digits><unit>"`, at most 8 digits).
fn grpc_timeout(metadata: &MetadataMap) -> Option<Duration> {
    let value = metadata.get("grpc-timeout")?.to_str().ok()?;
    parse_grpc_timeout(value)
}

fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;

    match unit {
        "H" => Some(Duration::from_secs(amount * 60 * 60)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}
