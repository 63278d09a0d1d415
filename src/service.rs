//! # Hello Service Lifecycle
//!
//! [`ServiceLifecycle`] registers the Hello service with a [`Transport`],
//! offers it, answers `sayHello` requests and broadcasts [`HelloEvent`]s from
//! one periodic timer per enabled [`TimerId`].
//!
//! ## State Machine
//!
//! ```text
//!              on_registered        offer()
//!   Created ───────────────► Registered ◄────► Offered
//!      │                         │   stop_offer()  │
//!      └─────────────────────────┴─────────────────┴──► Stopped (terminal)
//!                                  stop()
//! ```
//!
//! ## Actors
//!
//! `init()` spawns three tasks that coordinate through `watch` channels:
//!
//! | Task | Waits for | Then |
//! |------|-----------|------|
//! | offer | ready, `Registered` | offers once, or flaps offer/stop-offer until stopped |
//! | notify | `Offered` | schedules the enabled timers (or runs the tight loop) |
//! | shutdown | a [`shutdown_request`](ServiceLifecycle::shutdown_request) | runs [`stop`](ServiceLifecycle::stop) |
//!
//! Offering never happens inside a transport callback; `on_registered` only
//! flips the state and the offer task does the work.
//!
//! ## Request Validation
//!
//! Checks run in a fixed order and the first failure decides the return code:
//!
//! | Check | Return code |
//! |-------|-------------|
//! | protocol version | `WrongProtocolVersion` |
//! | service is primary or alternate | `UnknownService` |
//! | interface version is configured major or ANY | `WrongInterfaceVersion` |
//! | instance | `Unknown` |
//! | method | `UnknownMethod` |
//! | payload decodes | `MalformedMessage` |
//!
//! Every request that expects a response gets one, success or not.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::BytesMut;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServiceConfig;
use crate::error::{ConfigError, RequestError, Result};
use crate::gate::SubscriberGate;
use crate::proto::{HelloEvent, HelloRequest, HelloResponse, TimerId};
use crate::timer::PeriodicTimer;
use crate::transport::{AppState, Message, Transport, TransportHandler};
use crate::wire::{self, MessageType, PROTOCOL_VERSION};
use crate::{ANY_INSTANCE, ANY_MAJOR, ANY_METHOD};

/// Lifecycle states, in order of progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Registered,
    Offered,
    Stopped,
}

/// Check `message` against `config` and decode its payload.
///
/// Pure; the returned error carries the return code to answer with.
pub fn validate_request(config: &ServiceConfig, message: &Message) -> std::result::Result<HelloRequest, RequestError> {
    if message.protocol_version != PROTOCOL_VERSION {
        return Err(RequestError::UnknownProtocolVersion(message.protocol_version));
    }
    if !config.serves(message.service) {
        return Err(RequestError::UnknownService(message.service));
    }
    if message.interface_version != config.major && message.interface_version != ANY_MAJOR {
        return Err(RequestError::WrongInterfaceVersion {
            got: message.interface_version,
            expected: config.major,
        });
    }
    if message.instance != config.instance_id {
        return Err(RequestError::UnknownInstance(message.instance));
    }
    if message.method != config.method_id {
        return Err(RequestError::UnknownMethod(message.method));
    }
    wire::decode_request(&message.payload, config.profile).map_err(RequestError::Malformed)
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ServiceConfig,
    state: watch::Sender<LifecycleState>,
    /// Set once `init()` completed; the offer task waits for it
    ready: watch::Sender<bool>,
    /// Set once `stop()` finished tearing down
    finished: watch::Sender<bool>,
    running: AtomicBool,
    shutdown_requested: AtomicBool,
    shutdown: Notify,
    gate: SubscriberGate,
    timer: PeriodicTimer,
    /// One encode buffer per timer so concurrent ticks never share one
    payloads: [Mutex<BytesMut>; 4],
    actors: Mutex<Vec<JoinHandle<()>>>,
    /// Subscriptions seen so far, for ack toggling
    subscriptions_seen: AtomicU32,
}

/// Registration, offering, notification and shutdown of the Hello service.
///
/// Cheap to clone; all clones drive the same service.
#[derive(Clone)]
pub struct ServiceLifecycle {
    inner: Arc<Inner>,
}

impl ServiceLifecycle {
    pub fn new(config: ServiceConfig, transport: Arc<dyn Transport>) -> Self {
        let timer = PeriodicTimer::new().with_callback_budget(config.callback_budget);
        let gate = SubscriberGate::new(config.require_subscribers);
        Self {
            inner: Arc::new(Inner {
                transport,
                state: watch::Sender::new(LifecycleState::Created),
                ready: watch::Sender::new(false),
                finished: watch::Sender::new(false),
                running: AtomicBool::new(true),
                shutdown_requested: AtomicBool::new(false),
                shutdown: Notify::new(),
                gate,
                timer,
                payloads: Default::default(),
                actors: Mutex::new(Vec::new()),
                subscriptions_seen: AtomicU32::new(0),
                config,
            }),
        }
    }

    /// Register with the transport, install routes and start the actors.
    ///
    /// A transport that refuses to initialize is fatal: the error is returned
    /// and nothing else happens. Must be called within a tokio runtime.
    pub fn init(&self) -> Result<()> {
        let inner = &self.inner;
        if *inner.state.borrow() != LifecycleState::Created || *inner.ready.borrow() {
            return Err(ConfigError::new("service already initialized").into());
        }
        if let Err(e) = inner.transport.init() {
            error!(app = inner.transport.name(), "transport init failed: {e}");
            return Err(e);
        }
        let config = &inner.config;
        info!(
            app = inner.transport.name(),
            "initialized, service 0x{:04x}.0x{:04x} v{}.{}, timers {}",
            config.service_id,
            config.instance_id,
            config.major,
            config.minor,
            config.timers
        );

        inner.transport.set_handler(Arc::new(Callbacks {
            inner: Arc::downgrade(inner),
        }));
        for service in config.services() {
            inner.transport.register_message_handler(service, ANY_INSTANCE, ANY_METHOD);
        }
        inner
            .transport
            .register_subscription_handler(config.service_id, config.instance_id, config.eventgroup_id);

        let actors = vec![
            tokio::spawn(offer_actor(Arc::clone(inner))),
            tokio::spawn(notify_actor(Arc::clone(inner))),
            tokio::spawn(shutdown_actor(Arc::clone(inner))),
        ];
        inner
            .actors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(actors);

        inner.ready.send_replace(true);
        Ok(())
    }

    /// Start the transport; registration is reported back asynchronously.
    pub fn start(&self) {
        self.inner.transport.start();
    }

    /// `init()`, `start()`, then wait until stopped.
    pub async fn run(&self) -> Result<()> {
        self.init()?;
        self.start();
        self.wait_stopped().await;
        Ok(())
    }

    /// Registration confirmed by the transport: `Created` → `Registered`.
    pub fn on_registered(&self) {
        self.inner.on_registered();
    }

    /// Offer every configured service and the event; `Registered` → `Offered`.
    pub fn offer(&self) {
        self.inner.offer();
    }

    /// Withdraw all offers; `Offered` → `Registered`.
    pub fn stop_offer(&self) {
        self.inner.stop_offer();
    }

    /// Ask the service to stop, from any context (signal handlers included).
    ///
    /// Never blocks. The check itself is a pair of atomics; waking the
    /// shutdown task goes through [`Notify`](tokio::sync::Notify), whose
    /// internal mutex is only held briefly. The first call wakes the shutdown
    /// task. A further call made before that task got to run starts `stop()`
    /// itself.
    pub fn shutdown_request(&self) {
        let inner = &self.inner;
        if !inner.shutdown_requested.swap(true, Ordering::AcqRel) {
            debug!("shutdown requested");
            inner.shutdown.notify_one();
            return;
        }
        if !inner.running.load(Ordering::Acquire) {
            return;
        }
        debug!("repeated shutdown request, stopping directly");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(inner);
                handle.spawn(async move { inner.stop().await });
            }
            Err(_) => warn!("repeated shutdown request outside of a runtime, ignored"),
        }
    }

    /// Stop everything. Idempotent; later calls return immediately.
    ///
    /// Safe to call from one of the service's own tasks: that task is
    /// detached instead of joined.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Wait until a `stop()` has completed its teardown.
    pub async fn wait_stopped(&self) {
        let mut finished = self.inner.finished.subscribe();
        // Err means the sender is gone, which cannot happen while `self` holds it.
        let _ = finished.wait_for(|f| *f).await;
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    pub fn subscriber_count(&self) -> u32 {
        self.inner.gate.count()
    }

    pub fn is_offered(&self) -> bool {
        self.inner.gate.is_offered()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Try to broadcast one event now; false if gated.
    pub fn notify_event(&self, timer: TimerId) -> bool {
        self.inner.notify_event(timer)
    }
}

impl Inner {
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    fn on_registered(&self) {
        if self.transition(LifecycleState::Created, LifecycleState::Registered) {
            info!(app = self.transport.name(), "registered");
        }
    }

    fn offer(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let config = &self.config;
        for service in config.services() {
            info!("offering service 0x{service:04x}.0x{:04x}", config.instance_id);
            self.transport
                .offer_service(service, config.instance_id, config.major, config.minor);
        }
        self.transport.offer_event(
            config.service_id,
            config.instance_id,
            config.event_id,
            &[config.eventgroup_id],
        );
        self.gate.set_offered(true);
        self.transition(LifecycleState::Registered, LifecycleState::Offered);
    }

    fn withdraw(&self) {
        let config = &self.config;
        self.gate.set_offered(false);
        self.transport
            .stop_offer_event(config.service_id, config.instance_id, config.event_id);
        for service in config.services() {
            info!("withdrawing service 0x{service:04x}.0x{:04x}", config.instance_id);
            self.transport
                .stop_offer_service(service, config.instance_id, config.major, config.minor);
        }
    }

    fn stop_offer(&self) {
        self.withdraw();
        self.transition(LifecycleState::Offered, LifecycleState::Registered);
    }

    fn notify_event(&self, timer: TimerId) -> bool {
        if !self.running.load(Ordering::Acquire) || !self.gate.should_notify() {
            trace!(%timer, "event gated");
            return false;
        }
        let event = HelloEvent::now(timer);
        let payload = {
            let mut buf = self.payloads[timer.slot()]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            buf.clear();
            wire::put_event(&mut *buf, &event);
            buf.split().freeze()
        };
        trace!("{event} [{}]", wire::to_hex_bytes(&payload));
        let config = &self.config;
        self.transport
            .notify(config.service_id, config.instance_id, config.event_id, payload);
        true
    }

    fn on_subscription(&self, client: u16, eventgroup: u16, subscribed: bool) -> bool {
        if !subscribed {
            let count = self.gate.on_unsubscribe();
            info!("client 0x{client:04x} unsubscribed from 0x{eventgroup:04x} ({count} left)");
            return true;
        }
        let count = self.gate.on_subscribe();
        let nth = self.subscriptions_seen.fetch_add(1, Ordering::AcqRel) + 1;
        // A rejection is followed by an unsubscribe callback, which undoes the count above.
        let accept = !(self.config.toggle_ack && nth % 2 == 0);
        if accept {
            info!("client 0x{client:04x} subscribed to 0x{eventgroup:04x} ({count} total)");
        } else {
            info!("rejecting subscription #{nth} of client 0x{client:04x} to 0x{eventgroup:04x}");
        }
        accept
    }

    fn on_message(&self, message: Message) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        match message.message_type {
            MessageType::Request | MessageType::RequestNoReturn => {}
            other => {
                debug!("ignoring {other:?} for 0x{:04x}", message.method);
                return;
            }
        }
        debug!(
            client = message.client,
            session = message.session,
            "request 0x{:04x}.0x{:04x}.0x{:04x} [{}]",
            message.service,
            message.instance,
            message.method,
            wire::to_hex_bytes(&message.payload)
        );

        let response = match validate_request(&self.config, &message) {
            Ok(request) => {
                let reply = HelloResponse::greeting(&request);
                debug!("replying '{}'", reply.reply);
                Message::response_to(&message).with_payload(wire::encode_response(&reply, self.config.profile))
            }
            Err(e) => {
                warn!(client = message.client, "rejecting request: {e}");
                Message::error_to(&message, e.return_code())
            }
        };
        if message.message_type.expects_response() {
            self.transport.send(response);
        }
    }

    async fn stop(&self) {
        if !self.state.send_if_modified(|s| {
            let changed = *s != LifecycleState::Stopped;
            *s = LifecycleState::Stopped;
            changed
        }) {
            return;
        }
        info!(app = self.transport.name(), "stopping");
        self.running.store(false, Ordering::Release);
        self.timer.stop_all();

        let actors = std::mem::take(&mut *self.actors.lock().unwrap_or_else(PoisonError::into_inner));
        let current = tokio::task::try_id();
        for actor in actors {
            if Some(actor.id()) == current {
                debug!("detaching the task running stop()");
                continue;
            }
            if let Err(e) = actor.await {
                if e.is_panic() {
                    error!("service task panicked: {e}");
                }
            }
        }
        self.timer.shutdown().await;

        let config = &self.config;
        self.transport.clear_handler();
        for service in config.services() {
            self.transport
                .unregister_message_handler(service, ANY_INSTANCE, ANY_METHOD);
        }
        self.transport
            .unregister_subscription_handler(config.service_id, config.instance_id, config.eventgroup_id);
        self.withdraw();
        self.transport.stop();
        self.finished.send_replace(true);
        info!(app = self.transport.name(), "stopped");
    }
}

/// Transport callbacks, holding the service weakly so the transport does not
/// keep it alive.
struct Callbacks {
    inner: Weak<Inner>,
}

impl TransportHandler for Callbacks {
    fn on_state(&self, state: AppState) {
        let Some(inner) = self.inner.upgrade() else { return };
        match state {
            AppState::Registered => inner.on_registered(),
            AppState::Deregistered => debug!(app = inner.transport.name(), "deregistered"),
        }
    }

    fn on_message(&self, message: Message) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_message(message);
        }
    }

    fn on_subscription(&self, client: u16, _service: u16, _instance: u16, eventgroup: u16, subscribed: bool) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.on_subscription(client, eventgroup, subscribed))
    }
}

async fn offer_actor(inner: Arc<Inner>) {
    let mut ready = inner.ready.subscribe();
    let mut state = inner.state.subscribe();
    if ready.wait_for(|r| *r).await.is_err() {
        return;
    }
    let registered = match state.wait_for(|s| *s != LifecycleState::Created).await {
        Ok(s) => *s != LifecycleState::Stopped,
        Err(_) => false,
    };
    if !registered {
        return;
    }

    let Some(period) = inner.config.flap_period else {
        inner.offer();
        return;
    };
    info!(?period, "toggling offer");
    loop {
        inner.offer();
        if stopped_within(&mut state, period).await {
            break;
        }
        inner.stop_offer();
        if stopped_within(&mut state, period).await {
            break;
        }
    }
}

/// Wait up to `period`; true if the lifecycle stopped meanwhile.
async fn stopped_within(state: &mut watch::Receiver<LifecycleState>, period: std::time::Duration) -> bool {
    tokio::time::timeout(period, state.wait_for(|s| *s == LifecycleState::Stopped))
        .await
        .is_ok()
}

async fn notify_actor(inner: Arc<Inner>) {
    let mut state = inner.state.subscribe();
    let offered = matches!(
        state
            .wait_for(|s| matches!(s, LifecycleState::Offered | LifecycleState::Stopped))
            .await
            .as_deref(),
        Ok(LifecycleState::Offered)
    );
    if !offered {
        return;
    }

    if inner.config.tight_loop {
        tight_loop(&inner, &mut state).await;
        return;
    }

    for timer in inner.config.timers.enabled() {
        let weak = Arc::downgrade(&inner);
        inner.timer.schedule(
            move |tag| {
                let Some(inner) = weak.upgrade() else { return };
                if let Some(timer) = u8::try_from(tag).ok().and_then(TimerId::from_tag) {
                    inner.notify_event(timer);
                }
            },
            u32::from(timer.tag()),
            timer.interval(),
            true,
        );
    }
    let _ = state.wait_for(|s| *s == LifecycleState::Stopped).await;
}

/// Broadcast 1 ms events back to back while offered.
async fn tight_loop(inner: &Inner, state: &mut watch::Receiver<LifecycleState>) {
    info!("broadcasting without timers");
    loop {
        let current = *state.borrow_and_update();
        match current {
            LifecycleState::Stopped => break,
            LifecycleState::Offered => {
                inner.notify_event(TimerId::OneMilli);
                tokio::task::yield_now().await;
            }
            LifecycleState::Created | LifecycleState::Registered => {
                if state.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn shutdown_actor(inner: Arc<Inner>) {
    let mut state = inner.state.subscribe();
    let requested = tokio::select! {
        () = inner.shutdown.notified() => true,
        _ = state.wait_for(|s| *s == LifecycleState::Stopped) => false,
    };
    if requested {
        inner.stop().await;
    }
}
