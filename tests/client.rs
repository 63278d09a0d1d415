//! Client side: target latching, request correlation and the request task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hello_someip::prelude::*;
use hello_someip::transport::{LoopbackEndpoint, Message, TransportHandler};
use hello_someip::wire::{self, MessageType};
use hello_someip::{LifecycleState, RequestCorrelator, SubscriptionState, ANY_METHOD};

mod helpers;
use helpers::{configure_tracing, connected_client, offered_service, wait_until};

const LIMIT: Duration = Duration::from_secs(5);

fn correlator(config: ClientConfig) -> RequestCorrelator {
    let bus = LoopbackBus::new();
    RequestCorrelator::new(config, Arc::new(bus.endpoint("client")))
}

#[test_log::test]
fn any_service_latches_the_first_instance() {
    let correlator = correlator(
        ClientConfig::builder()
            .service(ServiceId::Any)
            .instance(1u16)
            .build(),
    );
    assert_eq!(correlator.target(), None);

    assert!(correlator.on_availability(0x1234, 1, true));
    assert_eq!(correlator.target(), Some((0x1234, 1)));
    assert!(correlator.is_available());

    assert!(!correlator.on_availability(0x5678, 1, true), "second service is ignored");
    assert!(!correlator.on_availability(0x1234, 2, true), "wrong instance is ignored");
    assert_eq!(correlator.target(), Some((0x1234, 1)));

    assert!(correlator.on_availability(0x1234, 1, false));
    assert!(!correlator.is_available());
    assert_eq!(correlator.target(), Some((0x1234, 1)), "the latch survives unavailability");
}

#[test_log::test]
fn unavailable_report_does_not_latch() {
    let correlator = correlator(ClientConfig::builder().instance(InstanceId::Any).build());
    assert!(!correlator.on_availability(0x6000, 3, false));
    assert_eq!(correlator.target(), None);
    assert!(correlator.on_availability(0x6000, 4, true));
    assert_eq!(correlator.target(), Some((0x6000, 4)));
    assert!(!correlator.on_availability(0x6001, 4, true), "service id is exact");
}

#[tokio::test]
async fn send_without_target_fails() {
    let correlator = correlator(ClientConfig::default());
    let err = correlator
        .send(&HelloRequest::new("World"), true, Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceUnavailable), "{err}");
    assert_eq!(correlator.subscription_state(), SubscriptionState::Pending);
}

/// Records requests and answers the ones expecting a response.
#[derive(Default)]
struct Recorder {
    endpoint: Mutex<Option<Arc<LoopbackEndpoint>>>,
    requests: Mutex<Vec<(MessageType, String)>>,
    reply: bool,
}

impl TransportHandler for Recorder {
    fn on_message(&self, message: Message) {
        let text = wire::decode_request(&message.payload, WireProfile::Raw).unwrap().message;
        self.requests.lock().unwrap().push((message.message_type, text.clone()));
        if !self.reply || !message.message_type.expects_response() {
            return;
        }
        let response = Message::response_to(&message)
            .with_payload(wire::encode_response(&HelloResponse::new(format!("ok {text}")), WireProfile::Raw));
        if let Some(endpoint) = self.endpoint.lock().unwrap().as_ref() {
            endpoint.send(response);
        }
    }
}

/// Offer the Hello service from a hand-rolled server.
fn recording_server(bus: &LoopbackBus, reply: bool) -> Arc<Recorder> {
    let endpoint = Arc::new(bus.endpoint("recorder"));
    endpoint.init().unwrap();
    let recorder = Arc::new(Recorder {
        reply,
        ..Recorder::default()
    });
    *recorder.endpoint.lock().unwrap() = Some(Arc::clone(&endpoint));
    endpoint.set_handler(recorder.clone());
    endpoint.register_message_handler(0x6000, 1, ANY_METHOD);
    endpoint.offer_service(0x6000, 1, 1, 0);
    endpoint.start();
    recorder
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let recorder = recording_server(&bus, false);
    let client = connected_client(
        &bus,
        "client",
        ClientConfig::builder()
            .request_count(0)
            .request_timeout(Duration::from_millis(200))
            .build(),
    )
    .await;

    let started = tokio::time::Instant::now();
    let err = client.say_hello("anyone?").await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "{err}");
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(recorder.requests.lock().unwrap().len(), 1);
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn request_task_numbers_messages_and_stops() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let recorder = recording_server(&bus, true);
    let client = HelloClient::new(
        ClientConfig::builder()
            .request_count(3)
            .message("World")
            .request_delay(Duration::from_millis(100))
            .build(),
        Arc::new(bus.endpoint("client")),
    );
    client.init().unwrap();
    client.start();

    tokio::time::timeout(LIMIT, client.wait_stopped())
        .await
        .expect("client did not stop after its requests");
    assert!(client.is_stopped());
    assert_eq!(client.requests_sent(), 3);

    let requests = recorder.requests.lock().unwrap();
    let texts: Vec<&str> = requests.iter().map(|(_, text)| text.as_str()).collect();
    assert_eq!(texts, ["World#1", "World#2", "World#3"]);
    assert!(requests.iter().all(|(kind, _)| *kind == MessageType::Request));
}

/// Stopping the client while a request is outstanding does not wait for
/// the request timeout.
#[tokio::test(start_paused = true)]
async fn stop_does_not_wait_for_an_outstanding_request() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let recorder = recording_server(&bus, false);
    let client = HelloClient::new(
        ClientConfig::builder()
            .request_count(3)
            .request_delay(Duration::ZERO)
            .request_timeout(Duration::from_secs(3600))
            .build(),
        Arc::new(bus.endpoint("client")),
    );
    client.init().unwrap();
    client.start();
    wait_until("the first request arrived", LIMIT, || !recorder.requests.lock().unwrap().is_empty()).await;

    let started = tokio::time::Instant::now();
    tokio::time::timeout(LIMIT, client.stop())
        .await
        .expect("stop waited for the request timeout");
    assert!(started.elapsed() < LIMIT);
    assert!(client.is_stopped());
    assert_eq!(recorder.requests.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn single_request_keeps_the_message() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let recorder = recording_server(&bus, true);
    let client = HelloClient::new(
        ClientConfig::builder().message("Solo").build(),
        Arc::new(bus.endpoint("client")),
    );
    client.init().unwrap();
    client.start();
    tokio::time::timeout(LIMIT, client.wait_stopped()).await.unwrap();

    assert_eq!(recorder.requests.lock().unwrap()[0].1, "Solo");
}

#[tokio::test(start_paused = true)]
async fn fire_and_forget_expects_nothing_back() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let recorder = recording_server(&bus, true);
    let client = connected_client(&bus, "client", ClientConfig::builder().request_count(0).build()).await;

    let response = client
        .correlator()
        .send(&HelloRequest::new("fire"), false, LIMIT)
        .await
        .unwrap();
    assert_eq!(response, None);
    wait_until("the request arrived", LIMIT, || !recorder.requests.lock().unwrap().is_empty()).await;
    assert_eq!(
        recorder.requests.lock().unwrap()[0],
        (MessageType::RequestNoReturn, "fire".to_string())
    );
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn availability_follows_the_service() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(&bus, "service", ServiceConfig::builder().timers(TimerConfig::none()).build()).await;
    let client = connected_client(&bus, "client", ClientConfig::builder().request_count(0).build()).await;
    assert!(client.correlator().is_available());

    service.stop_offer();
    assert_eq!(service.state(), LifecycleState::Registered);
    wait_until("the client saw the withdrawal", LIMIT, || !client.correlator().is_available()).await;

    service.offer();
    assert!(client.correlator().wait_available(LIMIT).await);

    service.stop().await;
    wait_until("the client saw the shutdown", LIMIT, || !client.correlator().is_available()).await;
    client.stop().await;
    client.stop().await;
    assert!(client.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn stopping_the_client_unsubscribes() {
    configure_tracing();
    let bus = LoopbackBus::new();
    let service = offered_service(&bus, "service", ServiceConfig::builder().timers(TimerConfig::none()).build()).await;
    let client = connected_client(
        &bus,
        "client",
        ClientConfig::builder().request_count(0).subscribe_events(true).build(),
    )
    .await;
    client.correlator().wait_subscribed(LIMIT).await.unwrap();
    assert_eq!(client.correlator().subscription_state(), SubscriptionState::Acknowledged);

    client.stop().await;
    wait_until("the service saw the unsubscription", LIMIT, || service.subscriber_count() == 0).await;
    assert!(bus.applications().iter().all(|name| name != "client"));
    service.stop().await;
}
