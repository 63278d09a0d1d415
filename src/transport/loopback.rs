//! In-process transport.
//!
//! A [`LoopbackBus`] connects any number of [`LoopbackEndpoint`]s living in
//! the same process. It keeps the routing tables a SOME/IP routing manager
//! would keep (offers, events, routes, subscriptions) behind one mutex and
//! delivers callbacks through one dispatcher task per endpoint:
//!
//! ```text
//! endpoint A ──call──► BusState ──Dispatch──► mpsc ──► dispatcher B ──► handler B
//! ```
//!
//! There is no discovery protocol and no serialization; messages are handed
//! over as values.
//!
//! ## Subscription handshake
//!
//! A subscription stays *wanted* until the event's eventgroup is offered. It
//! is then passed to the offering endpoint's handler (if it registered a
//! subscription route, otherwise it is accepted right away):
//!
//! - accepted: the subscriber is recorded and gets
//!   [`SubscriptionStatus::Acknowledged`];
//! - rejected: the subscriber gets [`SubscriptionStatus::Rejected`] and the
//!   intent is dropped. The offering handler then also receives an
//!   unsubscription for it, as real routing managers report a rejected
//!   subscription that way.
//!
//! Withdrawing an offer drops its subscribers (the offering handler sees
//! unsubscriptions) but keeps their intents, so they are re-sent when the
//! service is offered again.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{id_matches, AppState, Message, SubscriptionStatus, Transport, TransportHandler};
use crate::error::{ConfigError, Result};
use crate::wire::MessageType;

/// First client id handed out; lower ids are left to the routing manager.
const FIRST_CLIENT_ID: u16 = 0x0100;

type ServiceKey = (u16, u16);
type EventgroupKey = (u16, u16, u16);
type SharedHandler = Arc<Mutex<Option<Arc<dyn TransportHandler>>>>;

#[derive(Debug)]
enum Dispatch {
    State(AppState),
    Message(Message),
    Availability {
        service: u16,
        instance: u16,
        available: bool,
    },
    Subscription {
        client: u16,
        key: EventgroupKey,
        subscribed: bool,
    },
    SubscriptionStatus {
        key: EventgroupKey,
        status: SubscriptionStatus,
    },
}

struct App {
    name: String,
    tx: mpsc::UnboundedSender<Dispatch>,
    message_routes: HashSet<(u16, u16, u16)>,
    availability_routes: HashSet<ServiceKey>,
    subscription_routes: HashSet<EventgroupKey>,
    requested: HashSet<ServiceKey>,
}

impl App {
    fn routes_message(&self, service: u16, instance: u16, method: u16) -> bool {
        self.message_routes
            .iter()
            .any(|&(s, i, m)| id_matches(s, service) && id_matches(i, instance) && id_matches(m, method))
    }

    fn wants_availability(&self, service: u16, instance: u16) -> bool {
        let matches = |&(s, i): &ServiceKey| id_matches(s, service) && id_matches(i, instance);
        self.availability_routes.iter().any(matches) && self.requested.iter().any(matches)
    }

    fn routes_subscription(&self, (service, instance, eventgroup): EventgroupKey) -> bool {
        self.subscription_routes
            .iter()
            .any(|&(s, i, g)| id_matches(s, service) && id_matches(i, instance) && g == eventgroup)
    }
}

#[derive(Clone, Copy)]
struct Offer {
    owner: u16,
    major: u8,
}

struct OfferedEvent {
    owner: u16,
    eventgroups: Vec<u16>,
}

#[derive(Default)]
struct BusState {
    apps: HashMap<u16, App>,
    offers: HashMap<ServiceKey, Offer>,
    events: HashMap<(u16, u16, u16), OfferedEvent>,
    /// Acknowledged subscribers per eventgroup
    subscribers: HashMap<EventgroupKey, BTreeSet<u16>>,
    /// Subscription intents, acknowledged or not
    wanted: HashMap<EventgroupKey, BTreeSet<u16>>,
    /// Subscriptions waiting for the offering handler's decision
    in_flight: HashSet<(EventgroupKey, u16)>,
    notify_session: u16,
}

impl BusState {
    fn dispatch(&self, client: u16, dispatch: Dispatch) {
        match self.apps.get(&client) {
            Some(app) => {
                if app.tx.send(dispatch).is_err() {
                    debug!(client, "dispatcher gone, dropping callback");
                }
            }
            None => trace!(client, "no such application, dropping callback"),
        }
    }

    fn announce(&self, service: u16, instance: u16, available: bool) {
        for (&client, app) in &self.apps {
            if app.wants_availability(service, instance) {
                self.dispatch(
                    client,
                    Dispatch::Availability {
                        service,
                        instance,
                        available,
                    },
                );
            }
        }
    }

    fn eventgroup_offered(&self, (service, instance, eventgroup): EventgroupKey) -> Option<u16> {
        let offer = self.offers.get(&(service, instance))?;
        self.events
            .iter()
            .any(|(&(s, i, _), e)| {
                s == service && i == instance && e.owner == offer.owner && e.eventgroups.contains(&eventgroup)
            })
            .then_some(offer.owner)
    }

    /// Hand a wanted subscription to the offering application.
    fn start_subscription(&mut self, key: EventgroupKey, subscriber: u16, owner: u16) {
        let asks = self.apps.get(&owner).is_some_and(|app| app.routes_subscription(key));
        if asks {
            if self.in_flight.insert((key, subscriber)) {
                self.dispatch(
                    owner,
                    Dispatch::Subscription {
                        client: subscriber,
                        key,
                        subscribed: true,
                    },
                );
            }
        } else {
            self.accept(key, subscriber);
        }
    }

    fn accept(&mut self, key: EventgroupKey, subscriber: u16) {
        if self.subscribers.entry(key).or_default().insert(subscriber) {
            debug!(subscriber, ?key, "subscription acknowledged");
            self.dispatch(
                subscriber,
                Dispatch::SubscriptionStatus {
                    key,
                    status: SubscriptionStatus::Acknowledged,
                },
            );
        }
    }

    /// Tell the offering application a subscriber left.
    fn report_unsubscribe(&self, key: EventgroupKey, subscriber: u16, owner: u16) {
        if self.apps.get(&owner).is_some_and(|app| app.routes_subscription(key)) {
            self.dispatch(
                owner,
                Dispatch::Subscription {
                    client: subscriber,
                    key,
                    subscribed: false,
                },
            );
        }
    }

    /// Re-send every wanted subscription the offers of `(service, instance)` can now serve.
    fn deliver_wanted(&mut self, service: u16, instance: u16) {
        let pending: Vec<(EventgroupKey, u16)> = self
            .wanted
            .iter()
            .filter(|(key, _)| key.0 == service && key.1 == instance)
            .flat_map(|(&key, subs)| subs.iter().map(move |&sub| (key, sub)))
            .filter(|(key, sub)| {
                !self.subscribers.get(key).is_some_and(|acked| acked.contains(sub))
                    && !self.in_flight.contains(&(*key, *sub))
            })
            .collect();
        for (key, subscriber) in pending {
            if let Some(owner) = self.eventgroup_offered(key) {
                self.start_subscription(key, subscriber, owner);
            }
        }
    }

    /// Drop acknowledged subscribers of `(service, instance)`, keeping their intents.
    fn drop_subscribers(&mut self, service: u16, instance: u16, owner: u16) {
        let keys: Vec<EventgroupKey> = self
            .subscribers
            .keys()
            .filter(|&&(s, i, _)| s == service && i == instance)
            .copied()
            .collect();
        for key in keys {
            for subscriber in self.subscribers.remove(&key).unwrap_or_default() {
                self.report_unsubscribe(key, subscriber, owner);
            }
        }
    }

    /// Withdraw everything `client` holds, as on deregistration.
    fn remove_app(&mut self, client: u16) -> Option<App> {
        let offered: Vec<ServiceKey> = self
            .offers
            .iter()
            .filter(|(_, o)| o.owner == client)
            .map(|(&k, _)| k)
            .collect();
        for (service, instance) in offered {
            self.offers.remove(&(service, instance));
            self.announce(service, instance, false);
            self.drop_subscribers(service, instance, client);
        }
        self.events.retain(|_, e| e.owner != client);

        for subs in self.wanted.values_mut() {
            subs.remove(&client);
        }
        self.in_flight.retain(|(_, sub)| *sub != client);
        let left: Vec<EventgroupKey> = self
            .subscribers
            .iter()
            .filter(|(_, subs)| subs.contains(&client))
            .map(|(&k, _)| k)
            .collect();
        for key in left {
            if let Some(subs) = self.subscribers.get_mut(&key) {
                subs.remove(&client);
            }
            if let Some(offer) = self.offers.get(&(key.0, key.1)).copied() {
                self.report_unsubscribe(key, client, offer.owner);
            }
        }
        self.apps.remove(&client)
    }
}

struct Bus {
    state: Mutex<BusState>,
    next_client: AtomicU16,
}

impl Bus {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by the offering application's dispatcher with its handler's verdict.
    fn complete_subscription(&self, key: EventgroupKey, subscriber: u16, accepted: bool) {
        let mut state = self.lock();
        state.in_flight.remove(&(key, subscriber));
        let Some(owner) = state.offers.get(&(key.0, key.1)).map(|o| o.owner) else {
            debug!(?key, "offer withdrawn while subscription was pending");
            return;
        };
        let still_wanted = state.wanted.get(&key).is_some_and(|subs| subs.contains(&subscriber));
        if !still_wanted {
            if accepted {
                state.report_unsubscribe(key, subscriber, owner);
            }
            return;
        }
        if accepted {
            state.accept(key, subscriber);
        } else {
            debug!(subscriber, ?key, "subscription rejected");
            if let Some(subs) = state.wanted.get_mut(&key) {
                subs.remove(&subscriber);
            }
            state.dispatch(
                subscriber,
                Dispatch::SubscriptionStatus {
                    key,
                    status: SubscriptionStatus::Rejected,
                },
            );
            state.report_unsubscribe(key, subscriber, owner);
        }
    }
}

/// In-process stand-in for a SOME/IP routing manager.
#[derive(Clone)]
pub struct LoopbackBus {
    bus: Arc<Bus>,
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(Bus {
                state: Mutex::new(BusState::default()),
                next_client: AtomicU16::new(FIRST_CLIENT_ID),
            }),
        }
    }

    /// A new, uninitialized application attached to this bus.
    pub fn endpoint(&self, name: impl Into<String>) -> LoopbackEndpoint {
        LoopbackEndpoint {
            bus: Arc::clone(&self.bus),
            name: name.into(),
            client_id: AtomicU16::new(0),
            handler: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_offered(&self, service: u16, instance: u16) -> bool {
        self.bus.lock().offers.contains_key(&(service, instance))
    }

    /// Acknowledged subscribers of an eventgroup.
    pub fn subscriber_count(&self, service: u16, instance: u16, eventgroup: u16) -> usize {
        self.bus
            .lock()
            .subscribers
            .get(&(service, instance, eventgroup))
            .map_or(0, BTreeSet::len)
    }

    /// Names of the registered applications.
    pub fn applications(&self) -> Vec<String> {
        self.bus.lock().apps.values().map(|a| a.name.clone()).collect()
    }
}

/// One application on a [`LoopbackBus`].
pub struct LoopbackEndpoint {
    bus: Arc<Bus>,
    name: String,
    client_id: AtomicU16,
    handler: SharedHandler,
}

impl LoopbackEndpoint {
    fn me(&self) -> Option<u16> {
        match self.client_id.load(Ordering::Acquire) {
            0 => {
                warn!(app = %self.name, "transport used before init or after stop");
                None
            }
            id => Some(id),
        }
    }

    fn with_app(&self, f: impl FnOnce(&mut App)) {
        let Some(me) = self.me() else { return };
        let mut state = self.bus.lock();
        match state.apps.get_mut(&me) {
            Some(app) => f(app),
            None => debug!(app = %self.name, "application not registered"),
        }
    }
}

async fn dispatch_loop(
    bus: Arc<Bus>,
    name: String,
    handler: SharedHandler,
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
) {
    while let Some(dispatch) = rx.recv().await {
        let current = handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(handler) = current else {
            trace!(app = %name, ?dispatch, "no handler installed, dropping");
            continue;
        };
        match dispatch {
            Dispatch::State(state) => handler.on_state(state),
            Dispatch::Message(message) => handler.on_message(message),
            Dispatch::Availability {
                service,
                instance,
                available,
            } => handler.on_availability(service, instance, available),
            Dispatch::Subscription {
                client,
                key: (service, instance, eventgroup),
                subscribed,
            } => {
                let accepted = handler.on_subscription(client, service, instance, eventgroup, subscribed);
                if subscribed {
                    bus.complete_subscription((service, instance, eventgroup), client, accepted);
                }
            }
            Dispatch::SubscriptionStatus {
                key: (service, instance, eventgroup),
                status,
            } => handler.on_subscription_status(service, instance, eventgroup, status),
        }
    }
    trace!(app = %name, "dispatcher finished");
}

impl Transport for LoopbackEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn client_id(&self) -> u16 {
        self.client_id.load(Ordering::Acquire)
    }

    fn init(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::new("application name must not be empty").into());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConfigError::new(format!("no async runtime for '{}': {e}", self.name)))?;

        let mut state = self.bus.lock();
        if self.client_id() != 0 {
            return Err(ConfigError::new(format!("application '{}' already initialized", self.name)).into());
        }
        if state.apps.values().any(|app| app.name == self.name) {
            return Err(ConfigError::new(format!("application name '{}' already in use", self.name)).into());
        }
        let client_id = self.bus.next_client.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = mpsc::unbounded_channel();
        state.apps.insert(
            client_id,
            App {
                name: self.name.clone(),
                tx,
                message_routes: HashSet::new(),
                availability_routes: HashSet::new(),
                subscription_routes: HashSet::new(),
                requested: HashSet::new(),
            },
        );
        self.client_id.store(client_id, Ordering::Release);
        drop(state);

        runtime.spawn(dispatch_loop(
            Arc::clone(&self.bus),
            self.name.clone(),
            Arc::clone(&self.handler),
            rx,
        ));
        debug!(app = %self.name, client = %format!("0x{client_id:04x}"), "application initialized");
        Ok(())
    }

    fn start(&self) {
        let Some(me) = self.me() else { return };
        self.bus.lock().dispatch(me, Dispatch::State(AppState::Registered));
    }

    fn stop(&self) {
        let me = self.client_id.swap(0, Ordering::AcqRel);
        if me == 0 {
            return;
        }
        let mut state = self.bus.lock();
        state.dispatch(me, Dispatch::State(AppState::Deregistered));
        // Dropping the sender lets the dispatcher drain and exit.
        state.remove_app(me);
        debug!(app = %self.name, "application deregistered");
    }

    fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn clear_handler(&self) {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn register_message_handler(&self, service: u16, instance: u16, method: u16) {
        self.with_app(|app| {
            app.message_routes.insert((service, instance, method));
        });
    }

    fn unregister_message_handler(&self, service: u16, instance: u16, method: u16) {
        self.with_app(|app| {
            app.message_routes.remove(&(service, instance, method));
        });
    }

    fn register_availability_handler(&self, service: u16, instance: u16, _major: u8, _minor: u32) {
        let Some(me) = self.me() else { return };
        let mut state = self.bus.lock();
        let Some(app) = state.apps.get_mut(&me) else { return };
        app.availability_routes.insert((service, instance));
        report_current(&state, me, service, instance);
    }

    fn unregister_availability_handler(&self, service: u16, instance: u16) {
        self.with_app(|app| {
            app.availability_routes.remove(&(service, instance));
        });
    }

    fn register_subscription_handler(&self, service: u16, instance: u16, eventgroup: u16) {
        self.with_app(|app| {
            app.subscription_routes.insert((service, instance, eventgroup));
        });
    }

    fn unregister_subscription_handler(&self, service: u16, instance: u16, eventgroup: u16) {
        self.with_app(|app| {
            app.subscription_routes.remove(&(service, instance, eventgroup));
        });
    }

    fn offer_service(&self, service: u16, instance: u16, major: u8, _minor: u32) {
        let Some(me) = self.me() else { return };
        let mut state = self.bus.lock();
        match state.offers.get(&(service, instance)) {
            Some(offer) if offer.owner == me => return,
            Some(offer) => {
                warn!(
                    app = %self.name,
                    owner = offer.owner,
                    "service 0x{service:04x}.0x{instance:04x} already offered by another application"
                );
                return;
            }
            None => {}
        }
        state.offers.insert((service, instance), Offer { owner: me, major });
        debug!(app = %self.name, "offering 0x{service:04x}.0x{instance:04x}");
        state.announce(service, instance, true);
        state.deliver_wanted(service, instance);
    }

    fn stop_offer_service(&self, service: u16, instance: u16, _major: u8, _minor: u32) {
        let Some(me) = self.me() else { return };
        let mut state = self.bus.lock();
        if !state.offers.get(&(service, instance)).is_some_and(|o| o.owner == me) {
            return;
        }
        state.offers.remove(&(service, instance));
        debug!(app = %self.name, "withdrawing 0x{service:04x}.0x{instance:04x}");
        state.announce(service, instance, false);
        state.drop_subscribers(service, instance, me);
    }

    fn offer_event(&self, service: u16, instance: u16, event: u16, eventgroups: &[u16]) {
        let Some(me) = self.me() else { return };
        let mut state = self.bus.lock();
        state.events.insert(
            (service, instance, event),
            OfferedEvent {
                owner: me,
                eventgroups: eventgroups.to_vec(),
            },
        );
        state.deliver_wanted(service, instance);
    }

    fn stop_offer_event(&self, service: u16, instance: u16, event: u16) {
        let Some(me) = self.me() else { return };
        let mut state = self.bus.lock();
        if state.events.get(&(service, instance, event)).is_some_and(|e| e.owner == me) {
            state.events.remove(&(service, instance, event));
        }
    }

    fn notify(&self, service: u16, instance: u16, event: u16, payload: Bytes) {
        let Some(me) = self.me() else { return };
        let mut state = self.bus.lock();
        let Some(offered) = state.events.get(&(service, instance, event)) else {
            trace!(app = %self.name, "event 0x{event:04x} not offered");
            return;
        };
        if offered.owner != me {
            return;
        }
        let mut receivers = BTreeSet::new();
        for group in &offered.eventgroups {
            if let Some(subs) = state.subscribers.get(&(service, instance, *group)) {
                receivers.extend(subs.iter().copied());
            }
        }
        if receivers.is_empty() {
            return;
        }
        let major = state.offers.get(&(service, instance)).map_or(0, |o| o.major);
        state.notify_session = state.notify_session.wrapping_add(1).max(1);
        let mut message = Message::notification(service, instance, event, major, payload);
        message.session = state.notify_session;
        for client in receivers {
            if state.apps.get(&client).is_some_and(|app| app.routes_message(service, instance, event)) {
                state.dispatch(client, Dispatch::Message(message.clone()));
            }
        }
    }

    fn request_service(&self, service: u16, instance: u16, _major: u8, _minor: u32) {
        let Some(me) = self.me() else { return };
        let mut state = self.bus.lock();
        let Some(app) = state.apps.get_mut(&me) else { return };
        app.requested.insert((service, instance));
        report_current(&state, me, service, instance);
    }

    fn release_service(&self, service: u16, instance: u16) {
        self.with_app(|app| {
            app.requested.remove(&(service, instance));
        });
    }

    fn subscribe(&self, service: u16, instance: u16, eventgroup: u16, _major: u8) {
        let Some(me) = self.me() else { return };
        let key = (service, instance, eventgroup);
        let mut state = self.bus.lock();
        state.wanted.entry(key).or_default().insert(me);
        if let Some(owner) = state.eventgroup_offered(key) {
            state.start_subscription(key, me, owner);
        }
    }

    fn unsubscribe(&self, service: u16, instance: u16, eventgroup: u16) {
        let Some(me) = self.me() else { return };
        let key = (service, instance, eventgroup);
        let mut state = self.bus.lock();
        if let Some(subs) = state.wanted.get_mut(&key) {
            subs.remove(&me);
        }
        let was_acked = state.subscribers.get_mut(&key).is_some_and(|subs| subs.remove(&me));
        if was_acked {
            if let Some(offer) = state.offers.get(&(service, instance)).copied() {
                state.report_unsubscribe(key, me, offer.owner);
            }
        }
    }

    fn send(&self, mut message: Message) {
        let Some(me) = self.me() else { return };
        let state = self.bus.lock();
        match message.message_type {
            MessageType::Request | MessageType::RequestNoReturn => {
                message.client = me;
                let target = state.offers.get(&(message.service, message.instance)).map(|o| o.owner);
                match target {
                    Some(owner)
                        if state
                            .apps
                            .get(&owner)
                            .is_some_and(|app| app.routes_message(message.service, message.instance, message.method)) =>
                    {
                        state.dispatch(owner, Dispatch::Message(message));
                    }
                    _ => debug!(
                        app = %self.name,
                        "no route for request to 0x{:04x}.0x{:04x}.0x{:04x}, dropping",
                        message.service, message.instance, message.method
                    ),
                }
            }
            MessageType::Response | MessageType::Error => {
                let client = message.client;
                state.dispatch(client, Dispatch::Message(message));
            }
            MessageType::Notification => {
                warn!(app = %self.name, "notifications must go through notify(), dropping");
            }
        }
    }
}

/// Report offers matching `(service, instance)` that `client` now wants to hear about.
fn report_current(state: &BusState, client: u16, service: u16, instance: u16) {
    let Some(app) = state.apps.get(&client) else { return };
    for &(s, i) in state.offers.keys() {
        if id_matches(service, s) && id_matches(instance, i) && app.wants_availability(s, i) {
            state.dispatch(
                client,
                Dispatch::Availability {
                    service: s,
                    instance: i,
                    available: true,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        availability: StdMutex<Vec<(u16, u16, bool)>>,
        statuses: StdMutex<Vec<SubscriptionStatus>>,
    }

    impl TransportHandler for Recorder {
        fn on_availability(&self, service: u16, instance: u16, available: bool) {
            self.availability.lock().unwrap().push((service, instance, available));
        }

        fn on_subscription_status(&self, _: u16, _: u16, _: u16, status: SubscriptionStatus) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_duplicate_name_fails_init() {
        let bus = LoopbackBus::new();
        let first = bus.endpoint("app");
        let second = bus.endpoint("app");
        first.init().unwrap();
        assert!(matches!(second.init(), Err(crate::Error::Config(_))));
        assert!(matches!(bus.endpoint("").init(), Err(crate::Error::Config(_))));
    }

    #[tokio::test]
    async fn test_availability_needs_route_and_request() {
        let bus = LoopbackBus::new();
        let server = bus.endpoint("server");
        let client = bus.endpoint("client");
        server.init().unwrap();
        client.init().unwrap();
        let recorder = Arc::new(Recorder::default());
        client.set_handler(recorder.clone());

        server.offer_service(0x6000, 1, 1, 0);
        client.register_availability_handler(0x6000, 0xFFFF, 1, 0);
        settle().await;
        assert!(recorder.availability.lock().unwrap().is_empty());

        client.request_service(0x6000, 0xFFFF, 1, 0);
        server.stop_offer_service(0x6000, 1, 1, 0);
        settle().await;
        assert_eq!(*recorder.availability.lock().unwrap(), [(0x6000, 1, true), (0x6000, 1, false)]);
    }

    #[tokio::test]
    async fn test_subscription_waits_for_offer() {
        let bus = LoopbackBus::new();
        let server = bus.endpoint("server");
        let client = bus.endpoint("client");
        server.init().unwrap();
        client.init().unwrap();
        let recorder = Arc::new(Recorder::default());
        client.set_handler(recorder.clone());

        client.subscribe(0x6000, 1, 0x0100, 1);
        assert_eq!(bus.subscriber_count(0x6000, 1, 0x0100), 0);

        server.offer_service(0x6000, 1, 1, 0);
        server.offer_event(0x6000, 1, 0x8005, &[0x0100]);
        assert_eq!(bus.subscriber_count(0x6000, 1, 0x0100), 1);
        settle().await;
        assert_eq!(*recorder.statuses.lock().unwrap(), [SubscriptionStatus::Acknowledged]);

        server.stop();
        assert_eq!(bus.subscriber_count(0x6000, 1, 0x0100), 0);
        assert!(!bus.is_offered(0x6000, 1));
    }
}
