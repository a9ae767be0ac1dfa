//! Integration tests for `Orchestrator::execute`.
//!
//! The runtime is mocked; function instances are real gRPC servers on
//! loopback, so readiness probing and invocation run for real.


use std::sync::Arc;
use std::time::Duration;

use harness::{fast_deployment, orchestrator, recording_orchestrator, Actions, FunctionBackend};
use ignite_relay::{
    CallContext, DeploymentConfig, DriverError, ExecuteError, InvokeError, KeyError, MockRuntime,
};
use tokio::sync::watch;
use tokio::time::Instant;

const INVOCATION_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_warm_instance_is_invoked_without_start() {
    let backend = FunctionBackend::echo().await;
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new().with_running("k1", "8080/tcp", backend.port);
    let orchestrator = orchestrator(&actions, &runtime, fast_deployment(), INVOCATION_TIMEOUT);

    let output = orchestrator
        .execute("greet", r#"{"name":"ada"}"#, &CallContext::background())
        .await
        .unwrap();

    assert_eq!(output, r#"{"echo":{"name":"ada"}}"#);
    assert_eq!(runtime.create_calls(), 0);
    assert_eq!(runtime.start_calls(), 0);
}

#[tokio::test]
async fn test_cold_start_creates_starts_and_invokes() {
    let backend = FunctionBackend::echo().await;
    let actions = Actions::new().map("user.create", "abc123");
    let runtime = MockRuntime::new().publishing(backend.port);
    let orchestrator = orchestrator(&actions, &runtime, fast_deployment(), INVOCATION_TIMEOUT);

    let output = orchestrator
        .execute("user.create", r#"{"id":7}"#, &CallContext::background())
        .await
        .unwrap();

    assert_eq!(output, r#"{"echo":{"id":7}}"#);
    assert_eq!(runtime.create_calls(), 1);
    assert_eq!(runtime.start_calls(), 1);

    let spec = runtime.created_spec("abc123").unwrap();
    assert_eq!(spec.mount.source, "/var/lib/ignite/funcs/abc123");

    // The second call finds the instance running.
    orchestrator
        .execute("user.create", r#"{"id":8}"#, &CallContext::background())
        .await
        .unwrap();
    assert_eq!(runtime.create_calls(), 1);
    assert_eq!(runtime.start_calls(), 1);
}

#[tokio::test]
async fn test_instance_that_never_becomes_ready() {
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new().never_running();
    let deployment = DeploymentConfig {
        ready_timeout: Duration::from_millis(1),
        ..fast_deployment()
    };
    let (orchestrator, invoker) = recording_orchestrator(&actions, &runtime, deployment);

    let err = orchestrator
        .execute("greet", "{}", &CallContext::background())
        .await
        .unwrap_err();

    match &err {
        ExecuteError::Start { source, .. } => {
            assert!(matches!(**source, DriverError::ReadinessTimeout { .. }), "{source:?}");
        }
        other => panic!("expected start error, got {other:?}"),
    }
    assert_eq!(err.kind(), "start");
    assert_eq!(invoker.calls(), 0);
}

#[tokio::test]
async fn test_running_instance_without_port_binding() {
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new()
        .with_running("k1", "8080/tcp", 9000)
        .without_ports();
    let (orchestrator, invoker) = recording_orchestrator(&actions, &runtime, fast_deployment());

    let err = orchestrator
        .execute("greet", "{}", &CallContext::background())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::PortUnavailable { .. }), "{err:?}");
    assert_eq!(invoker.calls(), 0);
}

#[tokio::test]
async fn test_concurrent_cold_starts_create_once() {
    let backend = FunctionBackend::echo().await;
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new()
        .publishing(backend.port)
        .with_create_delay(Duration::from_millis(100));
    let orchestrator = Arc::new(orchestrator(
        &actions,
        &runtime,
        fast_deployment(),
        INVOCATION_TIMEOUT,
    ));

    let calls: Vec<_> = (0..4)
        .map(|i| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .execute("greet", &format!("{i}"), &CallContext::background())
                    .await
            })
        })
        .collect();

    for (i, call) in calls.into_iter().enumerate() {
        let output = call.await.unwrap().unwrap();
        assert_eq!(output, format!(r#"{{"echo":{i}}}"#));
    }

    assert_eq!(runtime.create_calls(), 1);
    assert_eq!(runtime.container_count(), 1);
}

#[tokio::test]
async fn test_missing_mapping_is_key_resolution_error() {
    let actions = Actions::new();
    let runtime = MockRuntime::new();
    let (orchestrator, invoker) = recording_orchestrator(&actions, &runtime, fast_deployment());

    let err = orchestrator
        .execute("nope", "{}", &CallContext::background())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            ExecuteError::KeyResolution {
                source: KeyError::KeyNotFound { .. },
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(runtime.inspect_calls(), 0);
    assert_eq!(invoker.calls(), 0);
}

#[tokio::test]
async fn test_inspection_failure_is_not_a_cold_start() {
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new().failing_inspect();
    let (orchestrator, invoker) = recording_orchestrator(&actions, &runtime, fast_deployment());

    let err = orchestrator
        .execute("greet", "{}", &CallContext::background())
        .await
        .unwrap_err();

    match &err {
        ExecuteError::Start { source, .. } => {
            assert!(matches!(**source, DriverError::InstanceInspect { .. }), "{source:?}");
        }
        other => panic!("expected start error, got {other:?}"),
    }
    assert_eq!(runtime.create_calls(), 0);
    assert_eq!(invoker.calls(), 0);
}

#[tokio::test]
async fn test_function_error_is_invocation_error() {
    let backend = FunctionBackend::failing().await;
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new().with_running("k1", "8080/tcp", backend.port);
    let orchestrator = orchestrator(&actions, &runtime, fast_deployment(), INVOCATION_TIMEOUT);

    let err = orchestrator
        .execute("greet", "{}", &CallContext::background())
        .await
        .unwrap_err();

    match err {
        ExecuteError::Invocation {
            source: InvokeError::InvocationRemote { code, message, .. },
            ..
        } => {
            assert_eq!(code, tonic::Code::Internal);
            assert_eq!(message, "boom");
        }
        other => panic!("expected remote invocation error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_slow_function_hits_invocation_timeout() {
    let backend = FunctionBackend::slow(Duration::from_secs(5)).await;
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new().with_running("k1", "8080/tcp", backend.port);
    let orchestrator = orchestrator(
        &actions,
        &runtime,
        fast_deployment(),
        Duration::from_millis(200),
    );

    let started = Instant::now();
    let err = orchestrator
        .execute("greet", "{}", &CallContext::background())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::Invocation { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_call_deadline_stops_waiting_for_readiness() {
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new().never_running();
    let deployment = DeploymentConfig {
        ready_timeout: Duration::from_secs(30),
        ..fast_deployment()
    };
    let (orchestrator, _invoker) = recording_orchestrator(&actions, &runtime, deployment);

    let started = Instant::now();
    let err = orchestrator
        .execute(
            "greet",
            "{}",
            &CallContext::with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::DeadlineExceeded), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancelled_caller_does_not_abort_shared_start() {
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new().never_running();
    let (orchestrator, _invoker) = recording_orchestrator(&actions, &runtime, fast_deployment());
    let orchestrator = Arc::new(orchestrator);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancelled = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let ctx = CallContext::background().with_cancellation(cancel_rx);
            orchestrator.execute("greet", "{}", &ctx).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel_tx.send(true).unwrap();

    let err = cancelled.await.unwrap().unwrap_err();
    assert!(matches!(err, ExecuteError::Cancelled), "{err:?}");

    // A second caller joins the same start and sees its real outcome.
    let err = orchestrator
        .execute("greet", "{}", &CallContext::background())
        .await
        .unwrap_err();
    match &err {
        ExecuteError::Start { source, .. } => {
            assert!(matches!(**source, DriverError::ReadinessTimeout { .. }), "{source:?}");
        }
        other => panic!("expected start error, got {other:?}"),
    }
    assert_eq!(runtime.create_calls(), 1);
}

#[tokio::test]
async fn test_wedged_start_is_abandoned_and_retried() {
    let backend = FunctionBackend::echo().await;
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new()
        .publishing(backend.port)
        .hanging_create();
    let deployment = DeploymentConfig {
        runtime_timeout: Duration::from_secs(60),
        ..fast_deployment()
    };
    let orchestrator = orchestrator(&actions, &runtime, deployment, INVOCATION_TIMEOUT)
        .with_start_timeout(Duration::from_millis(200));

    // A caller without a deadline still gets an answer.
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.execute("greet", "{}", &CallContext::background()),
    )
    .await
    .expect("caller should not wait on a wedged start forever")
    .unwrap_err();
    match &err {
        ExecuteError::Start { source, .. } => {
            assert!(matches!(**source, DriverError::DeadlineExceeded), "{source:?}");
        }
        other => panic!("expected start error, got {other:?}"),
    }

    // The abandoned start no longer blocks the key.
    runtime.set_hang_create(false);
    let output = orchestrator
        .execute("greet", r#""again""#, &CallContext::background())
        .await
        .unwrap();
    assert_eq!(output, r#"{"echo":"again"}"#);
    assert_eq!(runtime.create_calls(), 2);
}

#[tokio::test]
async fn test_shutdown_aborts_start_flight() {
    let actions = Actions::new().map("greet", "k1");
    let runtime = MockRuntime::new().never_running();
    let deployment = DeploymentConfig {
        ready_timeout: Duration::from_secs(30),
        ..fast_deployment()
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (orchestrator, invoker) = recording_orchestrator(&actions, &runtime, deployment);
    let orchestrator = orchestrator.with_shutdown(shutdown_rx);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(true);
    });

    let started = Instant::now();
    let err = orchestrator
        .execute("greet", "{}", &CallContext::background())
        .await
        .unwrap_err();
    match &err {
        ExecuteError::Start { source, .. } => {
            assert!(matches!(**source, DriverError::Cancelled), "{source:?}");
        }
        other => panic!("expected start error, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(invoker.calls(), 0);
}
