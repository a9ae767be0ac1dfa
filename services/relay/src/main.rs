//! ignite Relay
//!
//! Serves `CommunicationService/Execute` for the HTTP router. Each call is
//! resolved to a function artifact key, the container for that key is created
//! and started on demand, and the payload is forwarded to it over gRPC.

use std::sync::Arc;

use anyhow::{Context, Result};
use ignite_networking::EphemeralPortAllocator;
use ignite_relay::docker::{DockerClient, DockerRuntime};
use ignite_relay::{Config, FileKeyResolver, GrpcInvoker, InstanceDriver, Orchestrator, RelayService};
use tokio::sync::watch;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to IGNITE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ignite relay");
    info!(
        listen_addr = %config.listen_addr,
        docker_socket = %config.docker_socket.display(),
        action_dir = %config.action_base_dir.display(),
        image = %config.deployment.image,
        internal_port = %config.deployment.internal_port,
        invocation_timeout_ms = config.invocation_timeout.as_millis() as u64,
        runtime_timeout_ms = config.deployment.runtime_timeout.as_millis() as u64,
        runtime_assigned_ports = config.deployment.runtime_assigned_ports,
        "Configuration loaded"
    );

    // Container runtime
    let docker = DockerClient::new(&config.docker_socket);
    if !docker.socket_exists() {
        warn!(socket = %docker.socket_path(), "Docker socket not found");
    } else if let Err(e) = docker.ping().await {
        warn!(error = %e, "Docker engine did not answer ping");
    }
    let runtime = Arc::new(DockerRuntime::new(docker));

    let driver = InstanceDriver::new(
        runtime,
        Arc::new(EphemeralPortAllocator::new()),
        config.deployment.clone(),
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::new(FileKeyResolver::new(&config.action_base_dir)),
            Arc::new(driver),
            Arc::new(GrpcInvoker::new(config.deployment.connection_timeout)),
            config.invocation_timeout,
        )
        .with_start_timeout(config.deployment.start_budget())
        .with_shutdown(shutdown_rx.clone()),
    );

    let service = RelayService::new(orchestrator, shutdown_rx.clone())
        .with_execute_timeout(config.execute_timeout);

    let mut server = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        let listen_addr = config.listen_addr;
        async move {
            Server::builder()
                .add_service(service.into_server())
                .serve_with_shutdown(listen_addr, async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        }
    });

    info!(listen_addr = %config.listen_addr, "Relay listening");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("relay server failed"),
                Err(e) => Err(e).context("relay server task panicked"),
            };
        }
    }

    // Cancels in-flight calls and stops accepting new ones
    let _ = shutdown_tx.send(true);

    match server.await {
        Ok(Ok(())) => info!("Relay shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "Relay server error"),
        Err(e) => error!(error = %e, "Relay server task panicked"),
    }

    Ok(())
}
