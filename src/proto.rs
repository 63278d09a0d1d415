//! Hello protocol value types.
//!
//! These are the decoded forms of the payloads the [`wire`](crate::wire)
//! module produces and parses.

use std::fmt;
use std::time::Duration;

use chrono::Timelike;

/// `sayHello` request body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HelloRequest {
    pub message: String,
}

impl HelloRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// `sayHello` response body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HelloResponse {
    pub reply: String,
}

impl HelloResponse {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }

    /// The service's answer to `request`: `"Hello " + message`.
    pub fn greeting(request: &HelloRequest) -> Self {
        Self::new(format!("Hello {}", request.message))
    }
}

/// Local wall-clock time of day with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeOfDay {
    pub hours: i32,
    pub minutes: i32,
    pub seconds: i32,
    pub nanos: i32,
}

impl TimeOfDay {
    pub fn new(hours: i32, minutes: i32, seconds: i32, nanos: i32) -> Self {
        Self {
            hours,
            minutes,
            seconds,
            nanos,
        }
    }

    /// Sample the local clock.
    pub fn now() -> Self {
        let now = chrono::Local::now();
        // Leap seconds are reported as nanos >= 1e9; fold them into the last second.
        let nanos = now.nanosecond().min(999_999_999);
        Self {
            hours: now.hour() as i32,
            minutes: now.minute() as i32,
            seconds: now.second() as i32,
            nanos: nanos as i32,
        }
    }

    /// Offset from local midnight. Negative fields clamp to zero.
    pub fn since_midnight(&self) -> Duration {
        let secs = i64::from(self.hours) * 3600 + i64::from(self.minutes) * 60 + i64::from(self.seconds);
        Duration::from_secs(secs.max(0) as u64) + Duration::from_nanos(self.nanos.max(0) as u64)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}.{:09}",
            self.hours, self.minutes, self.seconds, self.nanos
        )
    }
}

/// Which periodic timer produced an event.
///
/// | Timer | Interval | Tag | Short name |
/// |-------|----------|-----|-----------|
/// | `OneSecond` | 1000 ms | 0 | `1s` |
/// | `OneMinute` | 60000 ms | 1 | `1m` |
/// | `TenMillis` | 10 ms | 8 | `10ms` |
/// | `OneMilli` | 1 ms | 9 | `1ms` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    OneSecond,
    OneMinute,
    TenMillis,
    OneMilli,
}

impl TimerId {
    /// All timers, in slot order.
    pub const ALL: [Self; 4] = [Self::OneSecond, Self::OneMinute, Self::TenMillis, Self::OneMilli];

    /// Tag byte carried in the event payload
    pub const fn tag(self) -> u8 {
        match self {
            Self::OneSecond => 0,
            Self::OneMinute => 1,
            Self::TenMillis => 8,
            Self::OneMilli => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::OneSecond),
            1 => Some(Self::OneMinute),
            8 => Some(Self::TenMillis),
            9 => Some(Self::OneMilli),
            _ => None,
        }
    }

    pub const fn interval(self) -> Duration {
        match self {
            Self::OneSecond => Duration::from_millis(1000),
            Self::OneMinute => Duration::from_millis(60_000),
            Self::TenMillis => Duration::from_millis(10),
            Self::OneMilli => Duration::from_millis(1),
        }
    }

    /// Name used in timer specification strings (`1s`, `1m`, `10ms`, `1ms`)
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::OneSecond => "1s",
            Self::OneMinute => "1m",
            Self::TenMillis => "10ms",
            Self::OneMilli => "1ms",
        }
    }

    pub fn from_short_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.short_name() == name)
    }

    /// Dense index into per-timer arrays.
    pub const fn slot(self) -> usize {
        match self {
            Self::OneSecond => 0,
            Self::OneMinute => 1,
            Self::TenMillis => 2,
            Self::OneMilli => 3,
        }
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T_{}", self.short_name())
    }
}

/// Periodic broadcast payload: a time-of-day sample and its timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloEvent {
    pub time_of_day: TimeOfDay,
    pub timer_id: TimerId,
}

impl HelloEvent {
    pub fn new(time_of_day: TimeOfDay, timer_id: TimerId) -> Self {
        Self {
            time_of_day,
            timer_id,
        }
    }

    /// Event stamped with the current local time.
    pub fn now(timer_id: TimerId) -> Self {
        Self::new(TimeOfDay::now(), timer_id)
    }
}

impl fmt::Display for HelloEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timer = format!("<{}>", self.timer_id);
        write!(f, "HelloEvent {timer:<8} {}", self.time_of_day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_tags_roundtrip() {
        for timer in TimerId::ALL {
            assert_eq!(TimerId::from_tag(timer.tag()), Some(timer));
            assert_eq!(TimerId::from_short_name(timer.short_name()), Some(timer));
        }
        assert_eq!(TimerId::from_tag(2), None);
        assert_eq!(TimerId::from_short_name("5s"), None);
    }

    #[test]
    fn test_event_display() {
        let event = HelloEvent::new(TimeOfDay::new(9, 5, 7, 42), TimerId::TenMillis);
        assert_eq!(event.to_string(), "HelloEvent <T_10ms> 09:05:07.000000042");
    }

    #[test]
    fn test_since_midnight() {
        let t = TimeOfDay::new(1, 2, 3, 500_000_000);
        assert_eq!(t.since_midnight(), Duration::from_millis(3_723_500));
    }
}
