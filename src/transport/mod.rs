//! Transport boundary.
//!
//! The SOME/IP stack (routing manager, service discovery, sockets) is an
//! external collaborator. This module defines what the service and client need
//! from it ([`Transport`]) and what it calls back into ([`TransportHandler`]).
//!
//! All [`Transport`] operations are synchronous and must not block: they queue
//! work and return. Callbacks into the [`TransportHandler`] are delivered
//! sequentially per application, never from inside a `Transport` call.
//!
//! [`LoopbackBus`] implements the boundary in process.

use bytes::Bytes;

use crate::error::Result;
use crate::wire::{MessageType, PROTOCOL_VERSION};
use crate::ReturnCode;

mod loopback;

pub use loopback::{LoopbackBus, LoopbackEndpoint};

/// Registration state of an application with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Registered,
    Deregistered,
}

/// Outcome of a subscription as seen by the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Acknowledged,
    Rejected,
}

/// A SOME/IP message as exchanged with the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub service: u16,
    pub instance: u16,
    /// Method ID or Event ID
    pub method: u16,
    pub client: u16,
    pub session: u16,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: ReturnCode,
    pub payload: Bytes,
}

impl Message {
    /// A request expecting a response. The transport fills in `client`.
    pub fn request(service: u16, instance: u16, method: u16, interface_version: u8, payload: Bytes) -> Self {
        Self {
            service,
            instance,
            method,
            client: 0,
            session: 0,
            protocol_version: PROTOCOL_VERSION,
            interface_version,
            message_type: MessageType::Request,
            return_code: ReturnCode::Ok,
            payload,
        }
    }

    /// An event notification.
    pub fn notification(service: u16, instance: u16, event: u16, interface_version: u8, payload: Bytes) -> Self {
        Self {
            message_type: MessageType::Notification,
            ..Self::request(service, instance, event, interface_version, payload)
        }
    }

    /// Empty OK response addressed back to the sender of `request`.
    pub fn response_to(request: &Message) -> Self {
        Self {
            service: request.service,
            instance: request.instance,
            method: request.method,
            client: request.client,
            session: request.session,
            protocol_version: PROTOCOL_VERSION,
            interface_version: request.interface_version,
            message_type: MessageType::Response,
            return_code: ReturnCode::Ok,
            payload: Bytes::new(),
        }
    }

    /// Error response carrying `code` and no payload.
    pub fn error_to(request: &Message, code: ReturnCode) -> Self {
        Self {
            message_type: MessageType::Error,
            return_code: code,
            ..Self::response_to(request)
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }
}

/// Callbacks an application receives from the transport.
///
/// Implemented once per application and injected with
/// [`Transport::set_handler`]. Every method has a no-op default.
pub trait TransportHandler: Send + Sync + 'static {
    fn on_state(&self, _state: AppState) {}

    /// A request, response or notification matching a message route.
    fn on_message(&self, _message: Message) {}

    /// A service instance matching an availability route appeared or vanished.
    fn on_availability(&self, _service: u16, _instance: u16, _available: bool) {}

    /// A remote client (un)subscribed to one of our eventgroups.
    ///
    /// The return value accepts or rejects a subscription; it is ignored for
    /// unsubscriptions.
    fn on_subscription(&self, _client: u16, _service: u16, _instance: u16, _eventgroup: u16, _subscribed: bool) -> bool {
        true
    }

    /// The server's answer to one of our subscriptions.
    fn on_subscription_status(&self, _service: u16, _instance: u16, _eventgroup: u16, _status: SubscriptionStatus) {}
}

/// Operations the service and client need from the SOME/IP stack.
pub trait Transport: Send + Sync + 'static {
    /// Application name, unique per transport.
    fn name(&self) -> &str;

    /// Client ID assigned at [`init`](Self::init), 0 before.
    fn client_id(&self) -> u16;

    /// Register the application. Failing here is fatal for the caller.
    fn init(&self) -> Result<()>;

    /// Start delivering callbacks; reports [`AppState::Registered`].
    fn start(&self);

    /// Deregister and release everything the application still holds.
    fn stop(&self);

    fn set_handler(&self, handler: std::sync::Arc<dyn TransportHandler>);
    fn clear_handler(&self);

    /// Deliver messages for `(service, instance, method)`; wildcards allowed.
    fn register_message_handler(&self, service: u16, instance: u16, method: u16);
    fn unregister_message_handler(&self, service: u16, instance: u16, method: u16);

    /// Report availability of instances matching `(service, instance)`.
    fn register_availability_handler(&self, service: u16, instance: u16, major: u8, minor: u32);
    fn unregister_availability_handler(&self, service: u16, instance: u16);

    /// Ask before accepting subscriptions to `eventgroup`.
    fn register_subscription_handler(&self, service: u16, instance: u16, eventgroup: u16);
    fn unregister_subscription_handler(&self, service: u16, instance: u16, eventgroup: u16);

    fn offer_service(&self, service: u16, instance: u16, major: u8, minor: u32);
    fn stop_offer_service(&self, service: u16, instance: u16, major: u8, minor: u32);

    /// Make `event` available as part of `eventgroups`.
    fn offer_event(&self, service: u16, instance: u16, event: u16, eventgroups: &[u16]);
    fn stop_offer_event(&self, service: u16, instance: u16, event: u16);

    /// Send `payload` to every subscriber of an eventgroup containing `event`.
    fn notify(&self, service: u16, instance: u16, event: u16, payload: Bytes);

    /// Express interest in a service; availability is reported from here on.
    fn request_service(&self, service: u16, instance: u16, major: u8, minor: u32);
    fn release_service(&self, service: u16, instance: u16);

    fn subscribe(&self, service: u16, instance: u16, eventgroup: u16, major: u8);
    fn unsubscribe(&self, service: u16, instance: u16, eventgroup: u16);

    /// Send a request or response. Requests get `client` stamped.
    fn send(&self, message: Message);
}

/// Whether a route id (possibly the 0xFFFF wildcard) selects `value`.
pub(crate) fn id_matches(route: u16, value: u16) -> bool {
    route == 0xFFFF || value == 0xFFFF || route == value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_mirrors_request_addressing() {
        let mut request = Message::request(0x6000, 1, 0x8001, 1, Bytes::from_static(b"x\0"));
        request.client = 0x0102;
        request.session = 7;

        let response = Message::response_to(&request);
        assert_eq!((response.service, response.instance, response.method), (0x6000, 1, 0x8001));
        assert_eq!((response.client, response.session), (0x0102, 7));
        assert_eq!(response.message_type, MessageType::Response);
        assert!(response.payload.is_empty());

        let error = Message::error_to(&request, ReturnCode::UnknownMethod);
        assert_eq!(error.message_type, MessageType::Error);
        assert_eq!(error.return_code, ReturnCode::UnknownMethod);
        assert_eq!(error.session, 7);
    }

    #[test]
    fn test_wildcard_routes() {
        assert!(id_matches(0xFFFF, 0x6000));
        assert!(id_matches(0x6000, 0x6000));
        assert!(!id_matches(0x6000, 0x6001));
    }
}
