//! # Hello Client
//!
//! [`RequestCorrelator`] pairs outgoing `sayHello` requests with the responses
//! the transport delivers later, by session id. It also decides which service
//! instance the client talks to: with wildcard service or instance ids the
//! first matching instance that becomes available is *latched* and used from
//! then on.
//!
//! [`HelloClient`] drives a correlator from transport callbacks. It sends a
//! configured number of requests, optionally subscribes to the timer events
//! and keeps per-timer [`EventStats`], which it logs when stopped.
//!
//! ## Latching
//!
//! | Service | Instance | Latched on first availability of |
//! |---------|----------|----------------------------------|
//! | exact | exact | that exact pair |
//! | exact | ANY | any instance of the service |
//! | ANY | exact | any service with that instance |
//! | ANY | ANY | anything |
//!
//! Availability reports for other identities after latching are logged and
//! otherwise ignored.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, DELTA_ALWAYS_REPORT};
use crate::error::{Error, Result};
use crate::gate::SubscriptionSet;
use crate::proto::{HelloEvent, HelloRequest, HelloResponse, TimerId};
use crate::transport::{AppState, Message, SubscriptionStatus, Transport, TransportHandler};
use crate::wire::{self, MessageType};
use crate::{ReturnCode, ANY_METHOD};

/// Where our event subscription stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not subscribed, or no answer yet
    Pending,
    Acknowledged,
    Rejected,
}

/// Request/response matching and target latching.
pub struct RequestCorrelator {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    pending: DashMap<u16, oneshot::Sender<Message>>,
    session: AtomicU16,
    target: Mutex<Option<(u16, u16)>>,
    available: watch::Sender<bool>,
    subscription: watch::Sender<SubscriptionState>,
}

impl RequestCorrelator {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config,
            pending: DashMap::new(),
            session: AtomicU16::new(0),
            target: Mutex::new(None),
            available: watch::Sender::new(false),
            subscription: watch::Sender::new(SubscriptionState::Pending),
        }
    }

    /// The latched `(service, instance)`, if any.
    pub fn target(&self) -> Option<(u16, u16)> {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Feed an availability report; true if it concerns the latched target.
    pub fn on_availability(&self, service: u16, instance: u16, available: bool) -> bool {
        if !self.config.service.matches(service) || !self.config.instance.matches(instance) {
            debug!("ignoring availability of unrelated service 0x{service:04x}.0x{instance:04x}");
            return false;
        }
        {
            let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
            match *target {
                None if available => {
                    info!("using service 0x{service:04x}.0x{instance:04x}");
                    *target = Some((service, instance));
                }
                None => return false,
                Some(latched) if latched != (service, instance) => {
                    info!(
                        "ignoring service 0x{service:04x}.0x{instance:04x}, already using 0x{:04x}.0x{:04x}",
                        latched.0, latched.1
                    );
                    return false;
                }
                Some(_) => {}
            }
        }
        info!(
            "service 0x{service:04x}.0x{instance:04x} is {}",
            if available { "available" } else { "NOT available" }
        );
        self.available.send_replace(available);
        true
    }

    /// Wait until the latched target is available; false if `timeout` hit first.
    pub async fn wait_available(&self, timeout: Duration) -> bool {
        let mut available = self.available.subscribe();
        let became_available = matches!(
            tokio::time::timeout(timeout, available.wait_for(|a| *a)).await,
            Ok(Ok(_))
        );
        became_available
    }

    fn next_session(&self) -> u16 {
        loop {
            let session = self.session.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if session != 0 {
                return session;
            }
        }
    }

    /// Send `request` to the latched target.
    ///
    /// With `wait_for_response` the call resolves with the decoded response,
    /// [`Error::Timeout`] after `timeout`, or [`Error::Remote`] if the service
    /// answered with an error code. Without it the request is sent
    /// fire-and-forget and `Ok(None)` is returned.
    pub async fn send(
        &self,
        request: &HelloRequest,
        wait_for_response: bool,
        timeout: Duration,
    ) -> Result<Option<HelloResponse>> {
        let Some((service, instance)) = self.target() else {
            return Err(Error::ServiceUnavailable);
        };
        let payload = wire::encode_request(request, self.config.profile);
        let mut message = Message::request(
            service,
            instance,
            self.config.method_id,
            self.config.major.value(),
            payload,
        );
        message.session = self.next_session();
        let session = message.session;
        debug!(session, "sending '{}' [{}]", request.message, wire::to_hex_bytes(&message.payload));

        if !wait_for_response {
            self.transport
                .send(message.with_message_type(MessageType::RequestNoReturn));
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(session, tx);
        self.transport.send(message);

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(Error::Stopped),
            Err(_) => {
                self.pending.remove(&session);
                warn!(session, ?timeout, "no response");
                return Err(Error::Timeout);
            }
        };
        if response.return_code != ReturnCode::Ok {
            return Err(Error::Remote(response.return_code));
        }
        let decoded = wire::decode_response(&response.payload, self.config.profile)?;
        Ok(Some(decoded))
    }

    /// Hand a response to its waiting caller; false if nobody waits for it.
    pub fn on_response(&self, message: Message) -> bool {
        match self.pending.remove(&message.session) {
            Some((session, tx)) => {
                if tx.send(message).is_err() {
                    debug!(session, "caller gave up before the response arrived");
                }
                true
            }
            None => {
                debug!(session = message.session, "unexpected response");
                false
            }
        }
    }

    pub fn on_subscription_status(&self, status: SubscriptionStatus) {
        let state = match status {
            SubscriptionStatus::Acknowledged => SubscriptionState::Acknowledged,
            SubscriptionStatus::Rejected => SubscriptionState::Rejected,
        };
        self.subscription.send_replace(state);
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        *self.subscription.borrow()
    }

    /// Wait for the server's answer to our subscription.
    ///
    /// A rejection is final: [`Error::SubscriptionRejected`], no retry.
    pub async fn wait_subscribed(&self, timeout: Duration) -> Result<()> {
        let mut state = self.subscription.subscribe();
        let answered = tokio::time::timeout(timeout, state.wait_for(|s| *s != SubscriptionState::Pending)).await;
        match answered {
            Ok(Ok(s)) if *s == SubscriptionState::Acknowledged => Ok(()),
            Ok(Ok(_)) => Err(Error::SubscriptionRejected),
            Ok(Err(_)) => Err(Error::Stopped),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Fail every waiting caller with [`Error::Stopped`].
    pub fn cancel_all(&self) {
        self.pending.clear();
    }
}

// ============================================================================
// EVENT STATISTICS
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct TimerStats {
    received: u64,
    last: Option<Duration>,
    delta_warnings: u64,
}

/// Per-timer event counters and inter-event delta checking.
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    timers: [TimerStats; 4],
    max_delta: Option<Duration>,
    first_event: Option<Instant>,
}

const DAY: Duration = Duration::from_secs(24 * 3600);

impl EventStats {
    pub fn new(max_delta: Option<Duration>) -> Self {
        Self {
            max_delta,
            ..Self::default()
        }
    }

    /// Count `event`. Returns the signed deviation (ms) from the timer interval
    /// when it is large enough to report.
    pub fn record(&mut self, event: &HelloEvent) -> Option<f64> {
        self.first_event.get_or_insert_with(Instant::now);
        let stats = &mut self.timers[event.timer_id.slot()];
        stats.received += 1;
        let now = event.time_of_day.since_midnight();
        let previous = stats.last.replace(now);
        let max_delta = self.max_delta?;
        let previous = previous?;
        // Events straddling midnight wrap around.
        let delta = match now.checked_sub(previous) {
            Some(delta) => delta,
            None => match (now + DAY).checked_sub(previous) {
                Some(delta) => delta,
                None => {
                    warn!(timer = %event.timer_id, "timestamp {} jumps back more than a day, skipping delta", event.time_of_day);
                    return None;
                }
            },
        };
        let interval = event.timer_id.interval();
        let deviation = delta.as_secs_f64() * 1000.0 - interval.as_secs_f64() * 1000.0;
        let abs = Duration::from_secs_f64(deviation.abs() / 1000.0);
        if abs >= max_delta || abs >= DELTA_ALWAYS_REPORT {
            stats.delta_warnings += 1;
            Some(deviation)
        } else {
            None
        }
    }

    pub fn received(&self, timer: TimerId) -> u64 {
        self.timers[timer.slot()].received
    }

    pub fn delta_warnings(&self, timer: TimerId) -> u64 {
        self.timers[timer.slot()].delta_warnings
    }

    pub fn total(&self) -> u64 {
        self.timers.iter().map(|t| t.received).sum()
    }

    /// Events a timer should have produced since the first event arrived.
    pub fn expected(&self, timer: TimerId, until: Instant) -> u64 {
        let Some(first) = self.first_event else { return 0 };
        let window = until.saturating_duration_since(first);
        (window.as_millis() / timer.interval().as_millis()) as u64
    }

    fn log_summary(&self, until: Instant) {
        let Some(first) = self.first_event else { return };
        info!(
            "received HelloEvents for {:.4} ms",
            until.saturating_duration_since(first).as_secs_f64() * 1000.0
        );
        for timer in [TimerId::OneMilli, TimerId::TenMillis, TimerId::OneSecond, TimerId::OneMinute] {
            let received = self.received(timer);
            if received == 0 {
                continue;
            }
            let expected = self.expected(timer, until);
            let percent = if expected > 0 { 100 * received / expected } else { 0 };
            info!("  - Event[{timer}] = {received:<6} (expected: {expected:<6} {percent:>3}%)");
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

struct ClientInner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    correlator: RequestCorrelator,
    subscriptions: SubscriptionSet<(u16, u16, u16)>,
    stats: Mutex<EventStats>,
    ready: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
    actor: Mutex<Option<JoinHandle<()>>>,
    requests_sent: AtomicU64,
    request_time: Mutex<Duration>,
}

/// Hello client: requests, subscriptions and event statistics.
#[derive(Clone)]
pub struct HelloClient {
    inner: Arc<ClientInner>,
}

impl HelloClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                correlator: RequestCorrelator::new(config.clone(), Arc::clone(&transport)),
                stats: Mutex::new(EventStats::new(config.max_delta)),
                transport,
                config,
                subscriptions: SubscriptionSet::new(),
                ready: watch::Sender::new(false),
                stopped: watch::Sender::new(false),
                actor: Mutex::new(None),
                requests_sent: AtomicU64::new(0),
                request_time: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Register with the transport, install routes and start the request task.
    pub fn init(&self) -> Result<()> {
        let inner = &self.inner;
        if *inner.ready.borrow() {
            return Err(crate::error::ConfigError::new("client already initialized").into());
        }
        inner.transport.init()?;
        let config = &inner.config;
        info!(
            app = inner.transport.name(),
            "client for 0x{:04x}.0x{:04x}, {} request(s), events {}",
            config.service.value(),
            config.instance.value(),
            config.request_count,
            if config.subscribe_events { "on" } else { "off" }
        );
        inner.transport.set_handler(Arc::new(ClientCallbacks {
            inner: Arc::downgrade(inner),
        }));
        inner.transport.register_availability_handler(
            config.service.value(),
            config.instance.value(),
            config.major.value(),
            config.minor.value(),
        );
        inner
            .transport
            .register_message_handler(config.service.value(), config.instance.value(), ANY_METHOD);

        if config.request_count > 0 {
            let actor = tokio::spawn(request_actor(Arc::clone(inner)));
            *inner.actor.lock().unwrap_or_else(PoisonError::into_inner) = Some(actor);
        }
        inner.ready.send_replace(true);
        Ok(())
    }

    pub fn start(&self) {
        self.inner.transport.start();
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.inner.correlator
    }

    /// Send one request to the latched service.
    pub async fn say_hello(&self, message: impl Into<String>) -> Result<HelloResponse> {
        let request = HelloRequest::new(message);
        self.inner
            .correlator
            .send(&request, true, self.inner.config.request_timeout)
            .await?
            .ok_or(Error::Stopped)
    }

    /// Snapshot of the event statistics.
    pub fn stats(&self) -> EventStats {
        self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn requests_sent(&self) -> u64 {
        self.inner.requests_sent.load(Ordering::Acquire)
    }

    /// Unsubscribe, release the service and log the summaries. Idempotent.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    pub async fn wait_stopped(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        let _ = stopped.wait_for(|s| *s).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.borrow()
    }
}

impl ClientInner {
    fn on_availability(&self, service: u16, instance: u16, available: bool) {
        if !self.correlator.on_availability(service, instance, available) || !available {
            return;
        }
        if !self.config.subscribe_events {
            return;
        }
        let key = (service, instance, self.config.eventgroup_id);
        if self.subscriptions.insert(key) {
            info!("subscribing to eventgroup 0x{:04x}", key.2);
            self.transport
                .subscribe(service, instance, key.2, self.config.major.value());
        }
    }

    fn on_message(&self, message: Message) {
        match message.message_type {
            MessageType::Notification => self.on_event(&message),
            MessageType::Response | MessageType::Error => {
                self.correlator.on_response(message);
            }
            other => debug!("ignoring {other:?}"),
        }
    }

    fn on_event(&self, message: &Message) {
        if message.method != self.config.event_id {
            debug!("ignoring event 0x{:04x}", message.method);
            return;
        }
        let event = match wire::decode_event(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("failed to parse HelloEvent: {e}");
                return;
            }
        };
        let deviation = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&event);
        if self.config.quiet {
            return;
        }
        match deviation {
            Some(d) => info!("### {event} // Delta: {d:+.3} ms."),
            None => info!("### {event}"),
        }
    }

    async fn stop(&self) {
        if !self.stopped.send_if_modified(|s| !std::mem::replace(s, true)) {
            return;
        }
        info!(app = self.transport.name(), "stopping client");
        self.correlator.cancel_all();

        let actor = self.actor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(actor) = actor {
            if Some(actor.id()) == tokio::task::try_id() {
                debug!("detaching the request task");
            } else if let Err(e) = actor.await {
                if e.is_panic() {
                    warn!("request task panicked: {e}");
                }
            }
        }

        self.transport.clear_handler();
        for (service, instance, eventgroup) in self.subscriptions.drain() {
            self.transport.unsubscribe(service, instance, eventgroup);
        }
        if let Some((service, instance)) = self.correlator.target() {
            self.transport.release_service(service, instance);
        }
        let config = &self.config;
        self.transport
            .unregister_availability_handler(config.service.value(), config.instance.value());
        self.transport
            .unregister_message_handler(config.service.value(), config.instance.value(), ANY_METHOD);
        self.transport.stop();

        self.log_summary();
    }

    fn log_summary(&self) {
        let sent = self.requests_sent.load(Ordering::Acquire);
        if self.config.request_count > 0 {
            let elapsed = *self.request_time.lock().unwrap_or_else(PoisonError::into_inner);
            let ms = elapsed.as_secs_f64() * 1000.0;
            let per_request = if sent > 0 { ms / sent as f64 } else { 0.0 };
            info!("### Sent {sent} requests in {ms:.4} ms ({per_request:.4} ms/req).");
        }
        if self.config.subscribe_events {
            self.stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .log_summary(Instant::now());
        }
    }
}

struct ClientCallbacks {
    inner: Weak<ClientInner>,
}

impl TransportHandler for ClientCallbacks {
    fn on_state(&self, state: AppState) {
        let Some(inner) = self.inner.upgrade() else { return };
        if state == AppState::Registered {
            let config = &inner.config;
            debug!(app = inner.transport.name(), "registered, requesting service");
            inner.transport.request_service(
                config.service.value(),
                config.instance.value(),
                config.major.value(),
                config.minor.value(),
            );
        }
    }

    fn on_message(&self, message: Message) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_message(message);
        }
    }

    fn on_availability(&self, service: u16, instance: u16, available: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_availability(service, instance, available);
        }
    }

    fn on_subscription_status(&self, service: u16, instance: u16, eventgroup: u16, status: SubscriptionStatus) {
        let Some(inner) = self.inner.upgrade() else { return };
        match status {
            SubscriptionStatus::Acknowledged => {
                info!("subscription to 0x{service:04x}.0x{instance:04x}.0x{eventgroup:04x} acknowledged")
            }
            SubscriptionStatus::Rejected => {
                warn!("subscription to 0x{service:04x}.0x{instance:04x}.0x{eventgroup:04x} rejected")
            }
        }
        inner.correlator.on_subscription_status(status);
    }
}

async fn request_actor(inner: Arc<ClientInner>) {
    let mut ready = inner.ready.subscribe();
    let mut available = inner.correlator.available.subscribe();
    let mut stopped = inner.stopped.subscribe();
    if ready.wait_for(|r| *r).await.is_err() {
        return;
    }
    tokio::select! {
        _ = available.wait_for(|a| *a) => {}
        _ = stopped.wait_for(|s| *s) => return,
    }

    let config = &inner.config;
    let started = Instant::now();
    for n in 1..=config.request_count {
        if *inner.stopped.borrow() {
            break;
        }
        let text = if config.request_count > 1 {
            format!("{}#{n}", config.message)
        } else {
            config.message.clone()
        };
        let request = HelloRequest::new(text);
        let result = tokio::select! {
            result = inner.correlator.send(&request, true, config.request_timeout) => result,
            _ = stopped.wait_for(|s| *s) => break,
        };
        inner.requests_sent.fetch_add(1, Ordering::AcqRel);
        match result {
            Ok(Some(response)) if !config.quiet => info!("received '{}'", response.reply),
            Ok(_) => {}
            Err(Error::Stopped) => break,
            Err(e) => warn!("request #{n} failed: {e}"),
        }
        if n < config.request_count && !config.request_delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(config.request_delay) => {}
                _ = stopped.wait_for(|s| *s) => break,
            }
        }
    }
    *inner.request_time.lock().unwrap_or_else(PoisonError::into_inner) = started.elapsed();

    if !config.subscribe_events {
        info!("requests done, stopping");
        inner.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::TimeOfDay;

    fn event_at(millis: u64, timer: TimerId) -> HelloEvent {
        let d = Duration::from_millis(millis);
        let secs = d.as_secs() as i32;
        HelloEvent::new(
            TimeOfDay::new(secs / 3600, (secs / 60) % 60, secs % 60, d.subsec_nanos() as i32),
            timer,
        )
    }

    #[test]
    fn test_stats_without_threshold_only_count() {
        let mut stats = EventStats::new(None);
        assert_eq!(stats.record(&event_at(1000, TimerId::OneSecond)), None);
        assert_eq!(stats.record(&event_at(5000, TimerId::OneSecond)), None);
        assert_eq!(stats.received(TimerId::OneSecond), 2);
        assert_eq!(stats.total(), 2);
    }

    #[test]
    fn test_stats_report_deviation() {
        let mut stats = EventStats::new(Some(Duration::from_millis(5)));
        stats.record(&event_at(1000, TimerId::TenMillis));
        assert_eq!(stats.record(&event_at(1010, TimerId::TenMillis)), None);
        let deviation = stats.record(&event_at(1030, TimerId::TenMillis)).unwrap();
        assert!((deviation - 10.0).abs() < 1e-6);
        assert_eq!(stats.delta_warnings(TimerId::TenMillis), 1);
    }

    #[test]
    fn test_stats_across_midnight() {
        let mut stats = EventStats::new(Some(Duration::from_millis(100)));
        stats.record(&event_at(24 * 3600 * 1000 - 500, TimerId::OneSecond));
        let deviation = stats.record(&event_at(500, TimerId::OneSecond));
        assert_eq!(deviation, None, "1000 ms apart across midnight");
    }

    #[test]
    fn test_stats_survive_out_of_range_hours() {
        let mut stats = EventStats::new(Some(Duration::from_millis(100)));
        stats.record(&HelloEvent::new(TimeOfDay::new(48, 0, 0, 0), TimerId::OneSecond));
        assert_eq!(stats.record(&HelloEvent::new(TimeOfDay::new(0, 0, 1, 0), TimerId::OneSecond)), None);
        assert_eq!(stats.received(TimerId::OneSecond), 2);
        assert_eq!(stats.delta_warnings(TimerId::OneSecond), 0);

        // Later samples are checked against the new baseline.
        let deviation = stats.record(&HelloEvent::new(TimeOfDay::new(0, 0, 3, 0), TimerId::OneSecond));
        assert!(deviation.is_some_and(|d| (d - 1000.0).abs() < 1e-6));
    }
}
