#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hello_someip::prelude::*;
use hello_someip::LifecycleState;
use tokio::time::Instant;

pub(crate) fn configure_tracing() {
    use std::sync::OnceLock;
    static TRACING_INIT: OnceLock<()> = OnceLock::new();
    TRACING_INIT.get_or_init(|| {
        // test-log may have installed a subscriber already; either one will do.
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::builder()
                        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                        .from_env_lossy(),
                )
                .with_test_writer()
                .finish(),
        );
    });
}

/// Poll `condition` every millisecond until it holds; panics after `limit`.
pub(crate) async fn wait_until(what: &str, limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Initialize and start a service on `bus` and wait until it is offered.
pub(crate) async fn offered_service(bus: &LoopbackBus, name: &str, config: ServiceConfig) -> ServiceLifecycle {
    let service = ServiceLifecycle::new(config, Arc::new(bus.endpoint(name)));
    service.init().expect("service init");
    service.start();
    wait_until("the service is offered", Duration::from_secs(1), || {
        service.state() == LifecycleState::Offered
    })
    .await;
    service
}

/// Initialize and start a client on `bus` and wait until it latched a service.
pub(crate) async fn connected_client(bus: &LoopbackBus, name: &str, config: ClientConfig) -> HelloClient {
    let client = HelloClient::new(config, Arc::new(bus.endpoint(name)));
    client.init().expect("client init");
    client.start();
    assert!(
        client.correlator().wait_available(Duration::from_secs(1)).await,
        "{name} never saw the service"
    );
    client
}

/// Service config with only the given timers running.
pub(crate) fn service_with_timers(timers: &str) -> ServiceConfig {
    let (timers, errors) = TimerConfig::parse(timers);
    assert!(errors.is_empty(), "bad timer spec {errors:?}");
    ServiceConfig::builder().timers(timers).build()
}
