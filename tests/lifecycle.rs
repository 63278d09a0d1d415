//! Service lifecycle end to end over the in-process bus.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hello_someip::config::{HELLO_EVENTGROUP_ID, HELLO_INSTANCE_ID, HELLO_SERVICE_ID};
use hello_someip::prelude::*;
use hello_someip::transport::Message;
use hello_someip::{validate_request, ClientConfigBuilder, LifecycleState, RequestError};

mod helpers;
use helpers::{configure_tracing, connected_client, offered_service, service_with_timers, wait_until};

const LIMIT: Duration = Duration::from_secs(5);

fn client_config() -> ClientConfigBuilder {
    ClientConfig::builder().request_count(0)
}

#[tokio::test(start_paused = true)]
async fn request_gets_greeting() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(&bus, "service", ServiceConfig::default()).await;
    let client = connected_client(&bus, "client", client_config().build()).await;

    let reply = client.say_hello("World!").await.unwrap();
    assert_eq!(reply.reply, "Hello World!");

    client.stop().await;
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn length_prefixed_profile_end_to_end() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(
        &bus,
        "service",
        ServiceConfig::builder().profile(WireProfile::LengthPrefixed).build(),
    )
    .await;
    let client = connected_client(
        &bus,
        "client",
        client_config().profile(WireProfile::LengthPrefixed).build(),
    )
    .await;

    assert_eq!(client.say_hello("Prefixed").await.unwrap().reply, "Hello Prefixed");
    client.stop().await;
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wrong_method_is_answered_with_error() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(&bus, "service", ServiceConfig::default()).await;
    let client = connected_client(&bus, "client", client_config().method_id(0x8002).build()).await;

    let err = client.say_hello("World").await.unwrap_err();
    assert!(matches!(err, Error::Remote(ReturnCode::UnknownMethod)), "{err}");

    client.stop().await;
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wrong_interface_version_is_answered_with_error() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(&bus, "service", ServiceConfig::default()).await;
    let client = connected_client(&bus, "client", client_config().major(7u8).build()).await;

    let err = client.say_hello("World").await.unwrap_err();
    assert!(matches!(err, Error::Remote(ReturnCode::WrongInterfaceVersion)), "{err}");

    client.stop().await;
    service.stop().await;
}

#[test_log::test]
fn alternate_service_ids_are_accepted() {
    let config = ServiceConfig::builder().alternate_service(0x6001).build();
    let request = |service| Message::request(service, 1, 0x8001, 1, Bytes::from_static(b"World\0"));

    assert_eq!(validate_request(&config, &request(0x6000)).unwrap().message, "World");
    assert_eq!(validate_request(&config, &request(0x6001)).unwrap().message, "World");
    assert_eq!(
        validate_request(&config, &request(0x7000)),
        Err(RequestError::UnknownService(0x7000))
    );
    assert_eq!(
        validate_request(&config, &request(0x7000)).unwrap_err().return_code(),
        ReturnCode::UnknownService
    );
}

#[tokio::test(start_paused = true)]
async fn alternate_service_is_offered_and_answers() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(
        &bus,
        "service",
        ServiceConfig::builder().alternate_service(0x6001).build(),
    )
    .await;
    assert!(bus.is_offered(0x6000, 1));
    assert!(bus.is_offered(0x6001, 1));

    let client = connected_client(&bus, "client", client_config().service(0x6001u16).build()).await;
    assert_eq!(client.correlator().target(), Some((0x6001, 1)));
    assert_eq!(client.say_hello("alt").await.unwrap().reply, "Hello alt");

    client.stop().await;
    service.stop().await;
}

/// No subscriber, no events; with one subscriber events flow.
#[tokio::test(start_paused = true)]
async fn events_are_gated_on_subscribers() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(&bus, "service", service_with_timers("10ms:1")).await;
    assert_eq!(service.subscriber_count(), 0);
    assert!(!service.notify_event(TimerId::TenMillis));

    let client = connected_client(&bus, "client", client_config().subscribe_events(true).build()).await;
    client.correlator().wait_subscribed(LIMIT).await.unwrap();
    assert_eq!(service.subscriber_count(), 1);
    assert!(service.notify_event(TimerId::TenMillis));

    wait_until("ten events arrived", LIMIT, || client.stats().received(TimerId::TenMillis) >= 10).await;
    let stats = client.stats();
    assert_eq!(stats.received(TimerId::OneSecond), 0, "1s timer is disabled");
    assert_eq!(stats.received(TimerId::OneMilli), 0, "1ms timer is disabled");

    client.stop().await;
    wait_until("the subscriber left", LIMIT, || service.subscriber_count() == 0).await;
    assert!(!service.notify_event(TimerId::TenMillis));
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn gate_can_be_disabled() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let config = ServiceConfig::builder()
        .timers(TimerConfig::none())
        .require_subscribers(false)
        .build();
    let service = offered_service(&bus, "service", config).await;
    assert!(service.notify_event(TimerId::OneSecond));
    service.stop().await;
    assert!(!service.notify_event(TimerId::OneSecond), "nothing is sent once stopped");
}

#[tokio::test(start_paused = true)]
async fn every_second_subscription_is_rejected_with_toggle_ack() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let config = ServiceConfig::builder()
        .timers(TimerConfig::none())
        .toggle_ack(true)
        .build();
    let service = offered_service(&bus, "service", config).await;

    let subscribing = || client_config().subscribe_events(true).build();
    let first = connected_client(&bus, "first", subscribing()).await;
    first.correlator().wait_subscribed(LIMIT).await.unwrap();

    let second = connected_client(&bus, "second", subscribing()).await;
    let err = second.correlator().wait_subscribed(LIMIT).await.unwrap_err();
    assert!(matches!(err, Error::SubscriptionRejected), "{err}");

    // The rejected subscription was counted and then taken back.
    wait_until("the count settles", LIMIT, || service.subscriber_count() == 1).await;
    assert_eq!(bus.subscriber_count(HELLO_SERVICE_ID, HELLO_INSTANCE_ID, HELLO_EVENTGROUP_ID), 1);

    second.stop().await;
    first.stop().await;
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn flapping_toggles_the_offer() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let config = ServiceConfig::builder()
        .timers(TimerConfig::none())
        .flapping(Some(Duration::from_secs(10)))
        .build();
    let service = offered_service(&bus, "service", config).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(bus.is_offered(HELLO_SERVICE_ID, HELLO_INSTANCE_ID));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!bus.is_offered(HELLO_SERVICE_ID, HELLO_INSTANCE_ID));
    assert_eq!(service.state(), LifecycleState::Registered);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(bus.is_offered(HELLO_SERVICE_ID, HELLO_INSTANCE_ID));
    assert_eq!(service.state(), LifecycleState::Offered);

    service.stop().await;
    assert!(!bus.is_offered(HELLO_SERVICE_ID, HELLO_INSTANCE_ID));
}

#[tokio::test(start_paused = true)]
async fn stop_withdraws_and_deregisters() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(&bus, "service", ServiceConfig::default()).await;
    assert_eq!(bus.applications(), ["service"]);

    service.stop().await;
    assert_eq!(service.state(), LifecycleState::Stopped);
    assert!(!service.is_offered());
    assert!(!bus.is_offered(HELLO_SERVICE_ID, HELLO_INSTANCE_ID));
    assert!(bus.applications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(&bus, "service", service_with_timers("1ms:1")).await;

    let again = service.clone();
    tokio::join!(service.stop(), again.stop());
    service.stop().await;
    assert_eq!(service.state(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn repeated_shutdown_requests_stop_once() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(&bus, "service", ServiceConfig::default()).await;

    service.shutdown_request();
    service.shutdown_request();
    tokio::time::timeout(LIMIT, service.wait_stopped())
        .await
        .expect("service did not stop");
    service.shutdown_request();
    assert_eq!(service.state(), LifecycleState::Stopped);
    assert!(bus.applications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_registration() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = ServiceLifecycle::new(ServiceConfig::default(), Arc::new(bus.endpoint("service")));
    service.init().unwrap();
    service.shutdown_request();
    tokio::time::timeout(LIMIT, service.wait_stopped())
        .await
        .expect("service did not stop");
    assert!(!bus.is_offered(HELLO_SERVICE_ID, HELLO_INSTANCE_ID));
}

// Real time: the tight loop never lets a paused clock auto-advance.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tight_loop_broadcasts_without_timers() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let config = ServiceConfig::builder().tight_loop(true).build();
    let service = offered_service(&bus, "service", config).await;
    let client = connected_client(&bus, "client", client_config().subscribe_events(true).build()).await;
    client.correlator().wait_subscribed(LIMIT).await.unwrap();

    wait_until("events arrive", LIMIT, || client.stats().received(TimerId::OneMilli) >= 20).await;
    assert_eq!(client.stats().received(TimerId::OneSecond), 0);

    client.stop().await;
    service.stop().await;
}

#[tokio::test]
async fn init_fails_when_transport_refuses() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let first = ServiceLifecycle::new(ServiceConfig::default(), Arc::new(bus.endpoint("hello")));
    let second = ServiceLifecycle::new(ServiceConfig::default(), Arc::new(bus.endpoint("hello")));
    first.init().unwrap();

    let err = second.init().unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err}");
    assert_eq!(second.state(), LifecycleState::Created);
    assert!(first.init().is_err(), "init twice");
    first.stop().await;
}

#[tokio::test]
async fn run_returns_after_shutdown_request() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = ServiceLifecycle::new(ServiceConfig::default(), Arc::new(bus.endpoint("service")));
    let running = tokio::spawn({
        let service = service.clone();
        async move { service.run().await }
    });
    wait_until("the service is offered", LIMIT, || service.state() == LifecycleState::Offered).await;
    service.shutdown_request();
    running.await.unwrap().unwrap();
}
