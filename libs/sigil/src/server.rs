//! `FunctionRunnerService` server.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};

use ignite_proto::function::v1::{
    FunctionRunnerService, FunctionRunnerServiceServer, InvokeRequest, InvokeResponse,
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::handler::{Context, Function, Handler};

/// Port function instances serve `Invoke` on.
pub const DEFAULT_PORT: u16 = 8080;

/// `0.0.0.0:8080`.
pub fn default_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
}

/// gRPC service wrapping one registered function.
#[derive(Debug, Clone)]
pub struct FunctionServer {
    function: Function,
}

impl FunctionServer {
    pub fn new<M, H: Handler<M>>(handler: H) -> Self {
        let function = Function::new(handler);
        debug!(signature = %function.signature(), "Registered function");
        Self { function }
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn into_service(self) -> FunctionRunnerServiceServer<Self> {
        FunctionRunnerServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl FunctionRunnerService for FunctionServer {
    async fn invoke(
        &self,
        request: Request<InvokeRequest>,
    ) -> Result<Response<InvokeResponse>, Status> {
        let ctx = Context::from_parts(request.remote_addr(), request.metadata());
        let payload = request.into_inner().payload;

        match self.function.invoke(ctx, payload).await {
            Ok(output) => Ok(Response::new(InvokeResponse { output })),
            Err(e) => {
                warn!(error = %e, "Function invocation failed");
                Err(e.into())
            }
        }
    }
}

/// Serve `handler` on `addr` until the process exits.
pub async fn serve<M, H: Handler<M>>(
    handler: H,
    addr: SocketAddr,
) -> Result<(), tonic::transport::Error> {
    let server = FunctionServer::new(handler);
    info!(addr = %addr, signature = %server.function().signature(), "Serving function");

    Server::builder()
        .add_service(server.into_service())
        .serve(addr)
        .await
}

/// Serve `handler` on an already bound listener until `shutdown` resolves.
pub async fn serve_with_incoming<M, H, F>(
    handler: H,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), tonic::transport::Error>
where
    H: Handler<M>,
    F: Future<Output = ()>,
{
    let server = FunctionServer::new(handler);
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, signature = %server.function().signature(), "Serving function");
    }

    Server::builder()
        .add_service(server.into_service())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
}
