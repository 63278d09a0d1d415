//! Subscriber accounting.
//!
//! [`SubscriberGate`] decides whether broadcasting an event is worth it.
//! [`SubscriptionSet`] remembers which subscriptions a client already made so
//! that each one is requested exactly once.
//!
//! ## Counting accuracy
//!
//! Transports may report a rejected subscription as "subscribed" immediately
//! followed by "unsubscribed". The gate cannot tell such a pair from a real
//! short-lived subscription, so the count is an upper bound on the true number
//! of subscribers. It never goes below zero: an unsubscribe with no matching
//! subscribe is ignored.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

/// Subscriber counter plus the "offered" flag.
///
/// Lock-free; safe to update from transport callbacks while timer tasks call
/// [`should_notify`](Self::should_notify).
#[derive(Debug)]
pub struct SubscriberGate {
    count: AtomicU32,
    offered: AtomicBool,
    require_subscribers: bool,
}

impl SubscriberGate {
    pub fn new(require_subscribers: bool) -> Self {
        Self {
            count: AtomicU32::new(0),
            offered: AtomicBool::new(false),
            require_subscribers,
        }
    }

    /// Record a subscription; returns the new count.
    pub fn on_subscribe(&self) -> u32 {
        let count = self.count.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        debug!(count, "subscriber added");
        count
    }

    /// Record an unsubscription; returns the new count, saturating at zero.
    pub fn on_unsubscribe(&self) -> u32 {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        if previous == 0 {
            debug!("unsubscribe without subscriber, count stays at 0");
        }
        let count = previous.saturating_sub(1);
        debug!(count, "subscriber removed");
        count
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn set_offered(&self, offered: bool) {
        self.offered.store(offered, Ordering::Release);
    }

    pub fn is_offered(&self) -> bool {
        self.offered.load(Ordering::Acquire)
    }

    /// Offered, and (if subscribers are required) at least one is known.
    pub fn should_notify(&self) -> bool {
        self.is_offered() && (!self.require_subscribers || self.count() > 0)
    }
}

/// Set of subscriptions already requested, keyed by subscription identity.
#[derive(Debug)]
pub struct SubscriptionSet<K> {
    active: Mutex<HashSet<K>>,
}

impl<K> Default for SubscriptionSet<K> {
    fn default() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> SubscriptionSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`; true if it was not claimed before.
    pub fn insert(&self, key: K) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).insert(key)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).contains(key)
    }

    /// Remove and return every key.
    pub fn drain(&self) -> Vec<K> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_closed_until_offered_and_subscribed() {
        let gate = SubscriberGate::new(true);
        assert!(!gate.should_notify());
        gate.on_subscribe();
        assert!(!gate.should_notify(), "not offered yet");
        gate.set_offered(true);
        assert!(gate.should_notify());
        gate.on_unsubscribe();
        assert!(!gate.should_notify());
    }

    #[test]
    fn test_count_saturates_at_zero() {
        let gate = SubscriberGate::new(true);
        assert_eq!(gate.on_unsubscribe(), 0);
        assert_eq!(gate.on_unsubscribe(), 0);
        assert_eq!(gate.on_subscribe(), 1);
        gate.set_offered(true);
        assert!(gate.should_notify(), "earlier excess unsubscribes must not be remembered");
    }

    #[test]
    fn test_gate_without_subscriber_requirement() {
        let gate = SubscriberGate::new(false);
        assert!(!gate.should_notify());
        gate.set_offered(true);
        assert!(gate.should_notify());
    }

    #[test]
    fn test_subscription_set_claims_once() {
        let set = SubscriptionSet::new();
        assert!(set.insert((0x6000u16, 1u16, 0x0100u16)));
        assert!(!set.insert((0x6000, 1, 0x0100)));
        assert!(set.contains(&(0x6000, 1, 0x0100)));
        assert_eq!(set.drain().len(), 1);
        assert!(set.insert((0x6000, 1, 0x0100)));
    }
}
