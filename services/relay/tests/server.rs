//! Integration tests for the `CommunicationService/Execute` surface.


use std::sync::Arc;
use std::time::Duration;

use harness::{fast_deployment, orchestrator, Actions, FunctionBackend};
use ignite_proto::relay::v1::{CommunicationServiceClient, ExecuteRequest};
use ignite_relay::{MockRuntime, RelayService};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Server};

struct Relay {
    client: CommunicationServiceClient<Channel>,
    shutdown_tx: watch::Sender<bool>,
}

async fn spawn_relay(actions: &Actions, runtime: &MockRuntime) -> Relay {
    let orchestrator = Arc::new(orchestrator(
        actions,
        runtime,
        fast_deployment(),
        Duration::from_secs(5),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = RelayService::new(orchestrator, shutdown_rx.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        Server::builder()
            .add_service(service.into_server())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            })
            .await
            .unwrap();
    });

    let client = CommunicationServiceClient::connect(format!("http://{addr}"))
        .await
        .unwrap();

    Relay {
        client,
        shutdown_tx,
    }
}

#[tokio::test]
async fn test_execute_success() {
    let backend = FunctionBackend::echo().await;
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new().publishing(backend.port);
    let mut relay = spawn_relay(&actions, &runtime).await;

    let response = relay
        .client
        .execute(ExecuteRequest {
            action: "greet".to_string(),
            body: r#"{"name":"ada"}"#.to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.status, "success");
    assert_eq!(response.resp, r#"{"echo":{"name":"ada"}}"#);

    let _ = relay.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_execute_failure_hides_detail() {
    let actions = Actions::new();
    let runtime = MockRuntime::new();
    let mut relay = spawn_relay(&actions, &runtime).await;

    let response = relay
        .client
        .execute(ExecuteRequest {
            action: "missing".to_string(),
            body: "{}".to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.status, "error");
    assert_eq!(response.resp, "");
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_calls() {
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new().never_running();
    let Relay {
        mut client,
        shutdown_tx,
    } = spawn_relay(&actions, &runtime).await;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(true);
    });

    let response = client
        .execute(ExecuteRequest {
            action: "greet".to_string(),
            body: "{}".to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.status, "error");
}
