//! Request dispatch through a connected endpoint: write-and-flush,
//! breaker gating, cancellation, and reconnect behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use meridian_core::testing::{
    wait_until, MemoryPipelineInitializer, SimpleEventBus, StubConnector,
};
use meridian_core::{
    CancellationReason, CircuitBreakerConfig, CoreConfig, CoreContext, Endpoint, EndpointError,
    EndpointState, EventKind, Request, RequestResult, ResponseStatus, ServiceType,
};
use tokio::sync::oneshot;

use common::{harness, harness_with_config};

struct Connected {
    endpoint: Endpoint,
    initializer: Arc<MemoryPipelineInitializer>,
    bus: Arc<SimpleEventBus>,
    core: CoreContext,
}

async fn connected_endpoint(config: CoreConfig) -> Connected {
    let (bus, core) = harness_with_config(config);
    let initializer = MemoryPipelineInitializer::new();
    let endpoint = Endpoint::builder("127.0.0.1", 1234, ServiceType::Kv)
        .context(core.clone())
        .connector(StubConnector::ready(Duration::from_millis(5)))
        .pipeline_initializer(initializer.clone())
        .backoff_seed(1)
        .build()
        .unwrap();

    endpoint.connect();
    wait_until(|| endpoint.state() == EndpointState::ConnectedCircuitClosed).await;

    Connected {
        endpoint,
        initializer,
        bus,
        core,
    }
}

fn new_request(core: &CoreContext) -> (Arc<Request>, oneshot::Receiver<RequestResult>) {
    Request::new(core.clone(), ServiceType::Kv, Duration::from_secs(2))
}

/// Breaker tuned small enough to trip from a handful of requests.
fn small_breaker_config() -> CoreConfig {
    CoreConfig {
        kv_circuit_breaker: CircuitBreakerConfig {
            volume_threshold: 4,
            ..CircuitBreakerConfig::default()
        },
        ..CoreConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn write_and_flush_when_connected() {
    let fixture = connected_endpoint(CoreConfig::default()).await;
    let pipeline = fixture.initializer.latest().unwrap();

    // Give the dispatch latency something to measure.
    let (request, _rx) = new_request(&fixture.core);
    tokio::time::sleep(Duration::from_millis(2)).await;

    fixture.endpoint.send(request.clone()).unwrap();
    wait_until(|| pipeline.pending() == 1).await;

    let outbound = pipeline.read_outbound().unwrap();
    assert_eq!(outbound.id(), request.id());
    assert!(request.context().dispatch_latency().unwrap() >= Duration::from_millis(2));
}

#[tokio::test(start_paused = true)]
async fn send_rejected_while_disconnected() {
    let (_bus, core) = harness();
    let endpoint = Endpoint::builder("127.0.0.1", 1234, ServiceType::Kv)
        .context(core.clone())
        .connector(StubConnector::ready(Duration::from_millis(5)))
        .pipeline_initializer(MemoryPipelineInitializer::new())
        .build()
        .unwrap();

    let (request, _rx) = new_request(&core);
    match endpoint.send(request.clone()) {
        Err(EndpointError::NotAvailable { state }) => {
            assert_eq!(state, EndpointState::Disconnected);
        }
        other => panic!("expected NotAvailable, got {other:?}"),
    }
    // The rejected request is untouched; the router owns the retry.
    assert!(request.is_active());
}

#[tokio::test(start_paused = true)]
async fn response_completes_the_request() {
    let fixture = connected_endpoint(CoreConfig::default()).await;
    let pipeline = fixture.initializer.latest().unwrap();

    let (request, rx) = new_request(&fixture.core);
    fixture.endpoint.send(request).unwrap();
    wait_until(|| pipeline.pending() == 1).await;

    assert!(pipeline.complete_next(ResponseStatus::Success, b"value".to_vec()));

    let response = rx.await.unwrap().unwrap();
    assert_eq!(response.payload(), b"value");
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_gates_and_recovers() {
    let fixture = connected_endpoint(small_breaker_config()).await;
    let pipeline = fixture.initializer.latest().unwrap();

    // Four server failures trip the breaker (volume 4, threshold 50%).
    for _ in 0..4 {
        let (request, rx) = new_request(&fixture.core);
        fixture.endpoint.send(request).unwrap();
        wait_until(|| pipeline.pending() == 1).await;
        assert!(pipeline.complete_next(ResponseStatus::ServerFailure, Vec::new()));
        rx.await.unwrap().unwrap();
    }

    assert_eq!(
        fixture.endpoint.state(),
        EndpointState::ConnectedCircuitOpen
    );
    let (request, _rx) = new_request(&fixture.core);
    assert!(matches!(
        fixture.endpoint.send(request),
        Err(EndpointError::NotAvailable { .. })
    ));

    // After the sleep window one probe is let through.
    tokio::time::advance(Duration::from_secs(10)).await;
    let (probe, probe_rx) = new_request(&fixture.core);
    fixture.endpoint.send(probe).unwrap();
    assert_eq!(
        fixture.endpoint.state(),
        EndpointState::ConnectedCircuitHalfOpen
    );

    // A second dispatch exceeds the probe limit.
    let (extra, _extra_rx) = new_request(&fixture.core);
    assert!(matches!(
        fixture.endpoint.send(extra),
        Err(EndpointError::NotAvailable { .. })
    ));

    // The successful probe closes the circuit again.
    wait_until(|| pipeline.pending() == 1).await;
    assert!(pipeline.complete_next(ResponseStatus::Success, Vec::new()));
    probe_rx.await.unwrap().unwrap();
    assert_eq!(
        fixture.endpoint.state(),
        EndpointState::ConnectedCircuitClosed
    );
}

#[tokio::test(start_paused = true)]
async fn application_errors_do_not_trip_the_breaker() {
    let fixture = connected_endpoint(small_breaker_config()).await;
    let pipeline = fixture.initializer.latest().unwrap();

    for _ in 0..8 {
        let (request, rx) = new_request(&fixture.core);
        fixture.endpoint.send(request).unwrap();
        wait_until(|| pipeline.pending() == 1).await;
        assert!(pipeline.complete_next(ResponseStatus::ApplicationError, Vec::new()));
        rx.await.unwrap().unwrap();
    }

    assert_eq!(
        fixture.endpoint.state(),
        EndpointState::ConnectedCircuitClosed
    );
}

#[tokio::test(start_paused = true)]
async fn in_flight_requests_fail_on_disconnect() {
    let fixture = connected_endpoint(CoreConfig::default()).await;
    let pipeline = fixture.initializer.latest().unwrap();

    let (request, rx) = new_request(&fixture.core);
    fixture.endpoint.send(request).unwrap();
    wait_until(|| pipeline.pending() == 1).await;

    fixture.endpoint.disconnect();
    wait_until(|| fixture.endpoint.state() == EndpointState::Disconnected).await;

    match rx.await.unwrap() {
        Err(EndpointError::RequestCancelled(reason)) => {
            assert_eq!(reason, CancellationReason::ChannelClosedWhileInFlight);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_is_never_written() {
    let fixture = connected_endpoint(CoreConfig::default()).await;
    let pipeline = fixture.initializer.latest().unwrap();

    let (request, rx) = new_request(&fixture.core);
    request.cancel(CancellationReason::StoppedAtSource);
    // Acceptance raced ahead of the cancellation; the driver checks
    // again before writing.
    fixture.endpoint.send(request).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(pipeline.pending(), 0);
    assert!(pipeline.read_outbound().is_none());
    assert!(matches!(
        rx.await.unwrap(),
        Err(EndpointError::RequestCancelled(
            CancellationReason::StoppedAtSource
        ))
    ));
}

#[tokio::test(start_paused = true)]
async fn late_response_after_timeout_is_ignored() {
    let fixture = connected_endpoint(CoreConfig::default()).await;
    let pipeline = fixture.initializer.latest().unwrap();

    let (request, rx) = new_request(&fixture.core);
    fixture.endpoint.send(request.clone()).unwrap();
    wait_until(|| pipeline.pending() == 1).await;

    // The external timer wheel fires the deadline.
    request.cancel(CancellationReason::TimedOut);
    // The remote answers anyway; the completion slot is already taken.
    pipeline.complete_next(ResponseStatus::Success, b"late".to_vec());

    match rx.await.unwrap() {
        Err(EndpointError::RequestCancelled(reason)) => {
            assert_eq!(reason, CancellationReason::TimedOut);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn channel_inactivity_triggers_reconnect() {
    let fixture = connected_endpoint(CoreConfig::default()).await;
    let first = fixture.initializer.latest().unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    first.trigger_inactive();
    wait_until(|| fixture.initializer.installed() == 2).await;
    wait_until(|| fixture.endpoint.state() == EndpointState::ConnectedCircuitClosed).await;

    let kinds = fixture.bus.published_kinds();
    assert_eq!(
        kinds,
        vec![
            EventKind::EndpointConnected,
            EventKind::EndpointDisconnected,
            EventKind::EndpointConnected
        ]
    );
    // The disconnect event carries how long the channel had been up.
    let disconnected = &fixture.bus.published()[1];
    assert!(disconnected.duration.unwrap() >= Duration::from_millis(5));
}

#[tokio::test(start_paused = true)]
async fn idle_watchdog_reports_inactivity() {
    let (bus, core) = harness();
    let initializer = MemoryPipelineInitializer::with_idle_watchdog(Duration::from_millis(100));
    let endpoint = Endpoint::builder("127.0.0.1", 1234, ServiceType::Query)
        .context(core)
        .connector(StubConnector::ready(Duration::from_millis(5)))
        .pipeline_initializer(initializer.clone())
        .backoff_seed(1)
        .build()
        .unwrap();

    endpoint.connect();
    wait_until(|| endpoint.state() == EndpointState::ConnectedCircuitClosed).await;

    // Nothing moves on the channel; the watchdog kills it and the
    // endpoint reconnects.
    wait_until(|| initializer.installed() == 2).await;
    assert_eq!(bus.count(EventKind::EndpointDisconnected), 1);
}

#[tokio::test(start_paused = true)]
async fn free_reflects_pipeline_capacity() {
    let (_bus, core) = harness();
    let initializer = MemoryPipelineInitializer::with_capacity(1);
    let endpoint = Endpoint::builder("127.0.0.1", 1234, ServiceType::Kv)
        .context(core.clone())
        .connector(StubConnector::ready(Duration::from_millis(5)))
        .pipeline_initializer(initializer.clone())
        .build()
        .unwrap();

    assert!(!endpoint.free());
    endpoint.connect();
    wait_until(|| endpoint.state() == EndpointState::ConnectedCircuitClosed).await;
    assert!(endpoint.free());

    let pipeline = initializer.latest().unwrap();
    let (request, _rx) = new_request(&core);
    endpoint.send(request).unwrap();
    wait_until(|| pipeline.pending() == 1).await;
    assert!(!endpoint.free());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_endpoint_fails_in_flight_requests() {
    let fixture = connected_endpoint(CoreConfig::default()).await;
    let pipeline = fixture.initializer.latest().unwrap();

    let (request, rx) = new_request(&fixture.core);
    fixture.endpoint.send(request).unwrap();
    wait_until(|| pipeline.pending() == 1).await;

    drop(fixture.endpoint);

    match rx.await.unwrap() {
        Err(EndpointError::RequestCancelled(reason)) => {
            assert_eq!(reason, CancellationReason::ChannelClosedWhileInFlight);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
}
