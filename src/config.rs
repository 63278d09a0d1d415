//! # Hello Configuration
//!
//! Explicit configuration for the service and the client. Both are built once
//! at startup (the demo binary fills them from flags and environment
//! variables) and handed to the component that uses them.
//!
//! ## Builder Pattern
//!
//! ```
//! use std::time::Duration;
//! use hello_someip::{ServiceConfig, TimerConfig, TimerId};
//!
//! let config = ServiceConfig::builder()
//!     .service_id(0x6000)
//!     .alternate_service(0x6001)
//!     .timers("1s:1,10ms:1".parse().unwrap())
//!     .flapping(Some(Duration::from_secs(10)))
//!     .build();
//!
//! assert!(config.timers.is_enabled(TimerId::TenMillis));
//! assert!(!config.timers.is_enabled(TimerId::OneMinute));
//! ```
//!
//! ## Service Options Reference
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `service_id` | `0x6000` | Primary service id |
//! | `instance_id` | `0x0001` | Offered instance |
//! | `major` / `minor` | `1` / `0` | Interface version |
//! | `method_id` | `0x8001` | `sayHello` method |
//! | `eventgroup_id` / `event_id` | `0x0100` / `0x8005` | Event placement |
//! | `alternate_services` | empty | Extra service ids offered and accepted |
//! | `timers` | `1m:1,1s:1,10ms:0,1ms:0` | Enabled periodic timers |
//! | `tight_loop` | false | Broadcast 1 ms events back to back instead of using timers |
//! | `flap_period` | None | Toggle offer/stop-offer with this period |
//! | `toggle_ack` | false | Reject every second subscription |
//! | `require_subscribers` | true | Skip broadcasts when nobody subscribed |
//! | `callback_budget` | None | Warn when a timer callback runs longer |
//! | `profile` | raw | Request/response string layout |

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::{ConfigError, TimerSpecError};
use crate::proto::TimerId;
use crate::wire::WireProfile;
use crate::{InstanceId, MajorVersion, MinorVersion, ServiceId};

/// Hello service id
pub const HELLO_SERVICE_ID: u16 = 0x6000;
/// Hello instance id
pub const HELLO_INSTANCE_ID: u16 = 0x0001;
/// `sayHello` method id
pub const HELLO_METHOD_ID: u16 = 0x8001;
/// Eventgroup carrying [`HELLO_EVENT_ID`]
pub const HELLO_EVENTGROUP_ID: u16 = 0x0100;
/// Timer event id
pub const HELLO_EVENT_ID: u16 = 0x8005;
pub const HELLO_MAJOR_VERSION: u8 = 1;
pub const HELLO_MINOR_VERSION: u32 = 0;

/// Default offer toggle period when flapping is enabled without a period.
pub const DEFAULT_FLAP_PERIOD: Duration = Duration::from_secs(10);

/// Default per-request response timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timer specification.
pub const DEFAULT_TIMERS: &str = "1m:1,1s:1,10ms:0,1ms:0";

/// Delta deviations at or above this are always reported, whatever the
/// configured threshold.
pub const DELTA_ALWAYS_REPORT: Duration = Duration::from_millis(50);

/// Parse an unsigned number given as decimal or `0x`-prefixed hex.
pub fn parse_u32(text: &str) -> Result<u32, ConfigError> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| ConfigError::new(format!("invalid number '{text}': {e}")))
}

/// [`parse_u32`] narrowed to 16 bits.
pub fn parse_u16(text: &str) -> Result<u16, ConfigError> {
    let value = parse_u32(text)?;
    u16::try_from(value).map_err(|_| ConfigError::new(format!("value 0x{value:x} exceeds 16 bits")))
}

// ============================================================================
// TIMERS
// ============================================================================

/// Enabled flag per [`TimerId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    enabled: [bool; 4],
}

impl Default for TimerConfig {
    fn default() -> Self {
        let mut config = Self::none();
        config.set(TimerId::OneMinute, true);
        config.set(TimerId::OneSecond, true);
        config
    }
}

impl TimerConfig {
    /// All timers disabled.
    pub const fn none() -> Self {
        Self { enabled: [false; 4] }
    }

    pub fn is_enabled(&self, timer: TimerId) -> bool {
        self.enabled[timer.slot()]
    }

    pub fn set(&mut self, timer: TimerId, enabled: bool) {
        self.enabled[timer.slot()] = enabled;
    }

    /// Enabled timers, in [`TimerId::ALL`] order.
    pub fn enabled(&self) -> impl Iterator<Item = TimerId> + '_ {
        TimerId::ALL.into_iter().filter(|t| self.is_enabled(*t))
    }

    /// Parse `"<id>:<flag>[,<id>:<flag>]*"`, keeping every valid token.
    ///
    /// The result starts with every timer disabled; timers not named stay
    /// disabled. A flag of `1` or `true` enables, anything else disables.
    /// Invalid tokens are returned alongside the result instead of aborting.
    pub fn parse(text: &str) -> (Self, Vec<TimerSpecError>) {
        let mut config = Self::none();
        let mut errors = Vec::new();
        for token in text.split(',') {
            let token = token.trim();
            let reject = |reason| TimerSpecError {
                token: token.to_string(),
                reason,
            };
            if token.is_empty() {
                errors.push(reject("empty token"));
                continue;
            }
            let Some((name, flag)) = token.split_once(':') else {
                errors.push(reject("expected <id>:<flag>"));
                continue;
            };
            let Some(timer) = TimerId::from_short_name(name.trim()) else {
                errors.push(reject("unknown timer id"));
                continue;
            };
            let flag = flag.trim();
            config.set(timer, flag == "1" || flag.eq_ignore_ascii_case("true"));
        }
        (config, errors)
    }

    /// [`parse`](Self::parse), logging each rejected token.
    pub fn parse_lossy(text: &str) -> Self {
        let (config, errors) = Self::parse(text);
        for error in &errors {
            warn!("{error}");
        }
        config
    }
}

impl FromStr for TimerConfig {
    type Err = TimerSpecError;

    /// Strict variant: the first invalid token fails the whole string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (config, mut errors) = Self::parse(s);
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors.swap_remove(0))
        }
    }
}

impl fmt::Display for TimerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for timer in [TimerId::OneMinute, TimerId::OneSecond, TimerId::TenMillis, TimerId::OneMilli] {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}:{}", timer.short_name(), u8::from(self.is_enabled(timer)))?;
        }
        Ok(())
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Hello service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service_id: u16,
    pub instance_id: u16,
    pub major: u8,
    pub minor: u32,
    pub method_id: u16,
    pub eventgroup_id: u16,
    pub event_id: u16,
    /// Further service ids offered next to `service_id` and accepted in requests
    pub alternate_services: BTreeSet<u16>,
    pub profile: WireProfile,
    pub timers: TimerConfig,
    /// Broadcast 1 ms events back to back instead of running timers
    pub tight_loop: bool,
    /// When set, offer and withdraw the service alternately with this period
    pub flap_period: Option<Duration>,
    /// Reject every second subscription
    pub toggle_ack: bool,
    /// Only broadcast while at least one subscriber is known (default: true)
    pub require_subscribers: bool,
    /// Warn when a timer callback takes longer than this
    pub callback_budget: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_id: HELLO_SERVICE_ID,
            instance_id: HELLO_INSTANCE_ID,
            major: HELLO_MAJOR_VERSION,
            minor: HELLO_MINOR_VERSION,
            method_id: HELLO_METHOD_ID,
            eventgroup_id: HELLO_EVENTGROUP_ID,
            event_id: HELLO_EVENT_ID,
            alternate_services: BTreeSet::new(),
            profile: WireProfile::Raw,
            timers: TimerConfig::default(),
            tight_loop: false,
            flap_period: None,
            toggle_ack: false,
            require_subscribers: true,
            callback_budget: None,
        }
    }
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Primary service id followed by the alternates, without duplicates.
    pub fn services(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.service_id)
            .chain(self.alternate_services.iter().copied().filter(move |s| *s != self.service_id))
    }

    /// Whether requests for `service` are served here.
    pub fn serves(&self, service: u16) -> bool {
        service == self.service_id || self.alternate_services.contains(&service)
    }
}

/// Builder for `ServiceConfig`
#[derive(Default)]
#[must_use]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// Default: `0x6000`
    pub fn service_id(mut self, id: u16) -> Self {
        self.config.service_id = id;
        self
    }

    /// Default: `0x0001`
    pub fn instance_id(mut self, id: u16) -> Self {
        self.config.instance_id = id;
        self
    }

    pub fn major(mut self, major: u8) -> Self {
        self.config.major = major;
        self
    }

    pub fn minor(mut self, minor: u32) -> Self {
        self.config.minor = minor;
        self
    }

    pub fn method_id(mut self, id: u16) -> Self {
        self.config.method_id = id;
        self
    }

    pub fn eventgroup_id(mut self, id: u16) -> Self {
        self.config.eventgroup_id = id;
        self
    }

    pub fn event_id(mut self, id: u16) -> Self {
        self.config.event_id = id;
        self
    }

    /// Also offer `id` and accept requests addressed to it.
    pub fn alternate_service(mut self, id: u16) -> Self {
        self.config.alternate_services.insert(id);
        self
    }

    pub fn alternate_services(mut self, ids: impl IntoIterator<Item = u16>) -> Self {
        self.config.alternate_services.extend(ids);
        self
    }

    pub fn profile(mut self, profile: WireProfile) -> Self {
        self.config.profile = profile;
        self
    }

    pub fn timers(mut self, timers: TimerConfig) -> Self {
        self.config.timers = timers;
        self
    }

    pub fn tight_loop(mut self, enabled: bool) -> Self {
        self.config.tight_loop = enabled;
        self
    }

    /// Toggle offering with the given period; `None` offers once.
    ///
    /// A zero period would spin; it is replaced by [`DEFAULT_FLAP_PERIOD`].
    pub fn flapping(mut self, period: Option<Duration>) -> Self {
        self.config.flap_period = period.map(|p| {
            if p.is_zero() {
                warn!("flap period of zero, using {:?}", DEFAULT_FLAP_PERIOD);
                DEFAULT_FLAP_PERIOD
            } else {
                p
            }
        });
        self
    }

    pub fn toggle_ack(mut self, enabled: bool) -> Self {
        self.config.toggle_ack = enabled;
        self
    }

    pub fn require_subscribers(mut self, required: bool) -> Self {
        self.config.require_subscribers = required;
        self
    }

    pub fn callback_budget(mut self, budget: Option<Duration>) -> Self {
        self.config.callback_budget = budget;
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.config
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Hello client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service to use; `Any` latches the first available one
    pub service: ServiceId,
    /// Instance to use; `Any` latches the first available one
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub minor: MinorVersion,
    pub method_id: u16,
    pub eventgroup_id: u16,
    pub event_id: u16,
    pub profile: WireProfile,
    /// Subscribe to the timer events once the service is available
    pub subscribe_events: bool,
    /// Number of `sayHello` requests to send (0 = none)
    pub request_count: u32,
    /// Request text; `#n` is appended when more than one request is sent
    pub message: String,
    /// Pause between consecutive requests
    pub request_delay: Duration,
    pub request_timeout: Duration,
    /// Report inter-event deltas deviating from the timer interval by this much
    pub max_delta: Option<Duration>,
    /// Suppress per-request and per-event logging
    pub quiet: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service: ServiceId::Id(HELLO_SERVICE_ID),
            instance: InstanceId::Id(HELLO_INSTANCE_ID),
            major: MajorVersion::Exact(HELLO_MAJOR_VERSION),
            minor: MinorVersion::ANY,
            method_id: HELLO_METHOD_ID,
            eventgroup_id: HELLO_EVENTGROUP_ID,
            event_id: HELLO_EVENT_ID,
            profile: WireProfile::Raw,
            subscribe_events: false,
            request_count: 1,
            message: "World".to_string(),
            request_delay: Duration::ZERO,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_delta: None,
            quiet: false,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for `ClientConfig`
#[derive(Default)]
#[must_use]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Default: `0x6000`. `0xFFFF` selects any service.
    pub fn service(mut self, service: impl Into<ServiceId>) -> Self {
        self.config.service = service.into();
        self
    }

    /// Default: `0x0001`. `0xFFFF` selects any instance.
    pub fn instance(mut self, instance: impl Into<InstanceId>) -> Self {
        self.config.instance = instance.into();
        self
    }

    pub fn major(mut self, major: impl Into<MajorVersion>) -> Self {
        self.config.major = major.into();
        self
    }

    pub fn minor(mut self, minor: u32) -> Self {
        self.config.minor = MinorVersion::new(minor);
        self
    }

    pub fn method_id(mut self, id: u16) -> Self {
        self.config.method_id = id;
        self
    }

    pub fn eventgroup_id(mut self, id: u16) -> Self {
        self.config.eventgroup_id = id;
        self
    }

    pub fn event_id(mut self, id: u16) -> Self {
        self.config.event_id = id;
        self
    }

    pub fn profile(mut self, profile: WireProfile) -> Self {
        self.config.profile = profile;
        self
    }

    pub fn subscribe_events(mut self, subscribe: bool) -> Self {
        self.config.subscribe_events = subscribe;
        self
    }

    pub fn request_count(mut self, count: u32) -> Self {
        self.config.request_count = count;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.config.message = message.into();
        self
    }

    pub fn request_delay(mut self, delay: Duration) -> Self {
        self.config.request_delay = delay;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_delta(mut self, delta: Option<Duration>) -> Self {
        self.config.max_delta = delta;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.config.quiet = quiet;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
