//! # hello-someip
//!
//! A **SOME/IP "Hello" service and client** for [tokio](https://tokio.rs):
//! a service that answers `sayHello` requests and broadcasts time-of-day
//! events at several fixed rates, and a client that calls it and keeps
//! statistics on the events it receives.
//!
//! The SOME/IP stack itself (routing, service discovery, sockets) is not part
//! of this crate. It sits behind the [`Transport`](transport::Transport) trait.
//! [`LoopbackBus`](transport::LoopbackBus) implements that trait in process so
//! service and client can run against each other without a network.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         ServiceLifecycle                         │
//! │  offer actor ── notify actor ── shutdown actor                   │
//! │        │              │                                          │
//! │        │        PeriodicTimer (1 task per TimerId)               │
//! │        │              │                                          │
//! │        └──── SubscriberGate ──► wire::encode_event ─► notify()   │
//! └──────────────────────────────┬───────────────────────────────────┘
//!                                │ Transport / TransportHandler
//! ┌──────────────────────────────┴───────────────────────────────────┐
//! │  HelloClient ── RequestCorrelator (session → oneshot)            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Module | Role |
//! |--------|------|
//! | [`wire`] | Payload codec: int32, strings, requests, responses, 17-byte events |
//! | [`proto`] | Value types: [`HelloRequest`], [`HelloResponse`], [`HelloEvent`], [`TimerId`] |
//! | [`timer`] | [`PeriodicTimer`]: drift-compensated, cancelable periodic callbacks |
//! | [`gate`] | [`SubscriberGate`]: subscriber counting and notification gating |
//! | [`service`] | [`ServiceLifecycle`]: register → offer → notify → stop |
//! | [`client`] | [`HelloClient`] and [`RequestCorrelator`] |
//! | [`transport`] | Transport boundary and the in-process [`LoopbackBus`] |
//! | [`config`] | [`ServiceConfig`], [`ClientConfig`], [`TimerConfig`] |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use hello_someip::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let bus = LoopbackBus::new();
//!     let service = ServiceLifecycle::new(
//!         ServiceConfig::default(),
//!         Arc::new(bus.endpoint("hello_service")),
//!     );
//!     service.init()?;
//!     service.start();
//!
//!     tokio::signal::ctrl_c().await?;
//!     service.shutdown_request();
//!     service.wait_stopped().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Wire Layouts
//!
//! | Payload | Layout |
//! |---------|--------|
//! | Request/response (raw) | UTF-8 bytes, one NUL |
//! | Request/response (length-prefixed) | BE `u32` length (bytes + 1), UTF-8 bytes, one NUL |
//! | Event | `hours` `minutes` `seconds` `nanos` (BE `i32` each), timer tag (1 byte) = 17 bytes |

pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod proto;
pub mod service;
pub mod timer;
pub mod transport;
pub mod wire;

pub use client::{EventStats, HelloClient, RequestCorrelator, SubscriptionState};
pub use config::{ClientConfig, ClientConfigBuilder, ServiceConfig, ServiceConfigBuilder, TimerConfig};
pub use error::*;
pub use gate::{SubscriberGate, SubscriptionSet};
pub use proto::{HelloEvent, HelloRequest, HelloResponse, TimeOfDay, TimerId};
pub use service::{validate_request, LifecycleState, ServiceLifecycle};
pub use timer::{PeriodicTimer, TimerHandle};
pub use transport::{LoopbackBus, LoopbackEndpoint, Message, Transport, TransportHandler};
pub use wire::WireProfile;

// ============================================================================
// PROTOCOL IDENTIFIERS
// ============================================================================

/// Wildcard service id (matches any service)
pub const ANY_SERVICE: u16 = 0xFFFF;

/// Wildcard instance id (matches any instance)
pub const ANY_INSTANCE: u16 = 0xFFFF;

/// Wildcard method id (matches any method or event)
pub const ANY_METHOD: u16 = 0xFFFF;

/// Wildcard major interface version
pub const ANY_MAJOR: u8 = 0xFF;

/// Wildcard minor interface version
pub const ANY_MINOR: u32 = 0xFFFF_FFFF;

/// Service identifier - can be a specific ID or Any (wildcard)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceId {
    /// Match any service (0xFFFF wildcard)
    Any,
    /// Specific service ID
    Id(u16),
}

impl ServiceId {
    /// Build from a raw value; 0xFFFF becomes [`ServiceId::Any`].
    pub const fn new(id: u16) -> Self {
        if id == ANY_SERVICE {
            Self::Any
        } else {
            Self::Id(id)
        }
    }

    /// Get the raw value (0xFFFF for Any)
    pub const fn value(&self) -> u16 {
        match self {
            Self::Any => ANY_SERVICE,
            Self::Id(id) => *id,
        }
    }

    /// Check if this is a wildcard
    pub const fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Whether a concrete service id is selected by this one
    pub const fn matches(&self, service: u16) -> bool {
        match self {
            Self::Any => true,
            Self::Id(id) => *id == service,
        }
    }
}

impl From<u16> for ServiceId {
    fn from(id: u16) -> Self {
        Self::new(id)
    }
}

/// Instance identifier - can be a specific ID or Any (wildcard)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceId {
    /// Match any instance (0xFFFF wildcard)
    Any,
    /// Specific instance ID
    Id(u16),
}

impl InstanceId {
    /// Build from a raw value; 0xFFFF becomes [`InstanceId::Any`].
    pub const fn new(id: u16) -> Self {
        if id == ANY_INSTANCE {
            Self::Any
        } else {
            Self::Id(id)
        }
    }

    /// Get the raw value (0xFFFF for Any)
    pub const fn value(&self) -> u16 {
        match self {
            Self::Any => ANY_INSTANCE,
            Self::Id(id) => *id,
        }
    }

    /// Check if this is a wildcard
    pub const fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Whether a concrete instance id is selected by this one
    pub const fn matches(&self, instance: u16) -> bool {
        match self {
            Self::Any => true,
            Self::Id(id) => *id == instance,
        }
    }
}

impl From<u16> for InstanceId {
    fn from(id: u16) -> Self {
        Self::new(id)
    }
}

/// Major version of a service interface - can be exact or wildcard (Any)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MajorVersion {
    /// Match any major version (0xFF wildcard)
    #[default]
    Any,
    /// Specific major version (0x00-0xFE)
    Exact(u8),
}

impl MajorVersion {
    /// Create a specific major version
    pub const fn new(version: u8) -> Self {
        if version == ANY_MAJOR {
            Self::Any
        } else {
            Self::Exact(version)
        }
    }

    /// Get the raw value (0xFF for Any)
    pub const fn value(&self) -> u8 {
        match self {
            Self::Any => ANY_MAJOR,
            Self::Exact(v) => *v,
        }
    }

    /// Check if this is a wildcard
    pub const fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}

impl From<u8> for MajorVersion {
    fn from(v: u8) -> Self {
        Self::new(v)
    }
}

/// Minor version of a service interface (0xFFFFFFFF = any)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MinorVersion(u32);

impl MinorVersion {
    pub const ANY: Self = Self(ANY_MINOR);

    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}

// ============================================================================
// RETURN CODES
// ============================================================================

/// SOME/IP return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0x00,
    NotOk = 0x01,
    UnknownService = 0x02,
    UnknownMethod = 0x03,
    NotReady = 0x04,
    NotReachable = 0x05,
    Timeout = 0x06,
    WrongProtocolVersion = 0x07,
    WrongInterfaceVersion = 0x08,
    MalformedMessage = 0x09,
    WrongMessageType = 0x0A,
    /// Catch-all for conditions without a dedicated code (e.g. unknown instance)
    Unknown = 0xFF,
}

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub mod prelude {
    pub use crate::{
        ClientConfig, Error, HelloClient, HelloEvent, HelloRequest, HelloResponse, InstanceId,
        LoopbackBus, MajorVersion, MinorVersion, Result, ReturnCode, ServiceConfig, ServiceId,
        ServiceLifecycle, TimerConfig, TimerId, Transport, WireProfile,
    };
}
