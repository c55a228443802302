//! Contract between the client core and a protocol adapter
//!
//! A transport never calls back into the client. Everything it has to report (connection
//! changes, acknowledgements, inbound traffic) is pushed into [`TransportEvents`] from its
//! non-blocking [`Transport::do_work`], and the pump loop drains those events right after.

use serde_json::Value;
use std::collections::VecDeque;

use crate::connection::ConnectionStatusReason;
use crate::message::{DispositionResult, Message};
use crate::registry::{ConfirmationResult, OperationId};
use crate::token::ConnectionDescriptor;

/// Identifies a cloud invoked device method awaiting an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

/// Identifies a received cloud to device message awaiting a disposition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

/// Inbound traffic the client can ask the transport for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// Cloud to device messages
    Messages,
    /// Desired property updates and full twin documents
    DeviceTwin,
    /// Device method invocations
    DeviceMethods,
}

/// Whether a twin payload is the full document or a desired properties patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TwinUpdateState {
    /// The complete twin document
    Complete,
    /// A patch to the desired properties
    Partial,
}

/// Something the transport has to tell the client
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection is established
    Connected,
    /// A connection attempt failed or an established connection broke
    Disconnected(ConnectionStatusReason),
    /// An operation handed to the transport finished
    Completed {
        /// The operation
        id: OperationId,
        /// How it finished
        result: ConfirmationResult,
        /// Status code from the hub, reported for twin updates
        status_code: Option<i32>,
    },
    /// A cloud to device message arrived
    Message {
        /// Tag to settle the message with
        tag: DeliveryTag,
        /// The message
        message: Message,
    },
    /// A twin document or desired properties patch arrived
    Twin {
        /// Full document or patch
        state: TwinUpdateState,
        /// JSON payload
        payload: Vec<u8>,
    },
    /// The cloud invoked a device method
    MethodInvoked {
        /// Id to answer the invocation with
        method_id: MethodId,
        /// Method name
        method_name: String,
        /// Request payload
        payload: Vec<u8>,
    },
}

/// Events collected from one [`Transport::do_work`] call, drained in arrival order
#[derive(Debug, Default)]
pub struct TransportEvents {
    events: VecDeque<TransportEvent>,
}

impl TransportEvents {
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an event to the client
    pub fn push(&mut self, event: TransportEvent) {
        self.events.push_back(event);
    }

    /// Shorthand for reporting an operation outcome
    pub fn complete(&mut self, id: OperationId, result: ConfirmationResult) {
        self.push(TransportEvent::Completed {
            id,
            result,
            status_code: None,
        });
    }

    pub(crate) fn pop(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    ///
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A protocol adapter (MQTT, AMQP, HTTP) the client core drives
///
/// None of the methods may block. Requests return once the work has been queued; failures
/// returned from them are reported to the caller synchronously, everything later goes through
/// [`TransportEvents`].
pub trait Transport {
    /// Bind the device identity, called once when the client is created
    fn register_device(&mut self, descriptor: &ConnectionDescriptor) -> crate::Result<()>;

    /// Start opening the connection
    fn open(&mut self) -> crate::Result<()>;

    /// Tear down the connection
    fn close(&mut self);

    /// Queue a telemetry event
    fn send_event(&mut self, id: OperationId, message: &Message) -> crate::Result<()>;

    /// Queue a reported properties patch
    fn send_reported_state(&mut self, id: OperationId, document: &[u8]) -> crate::Result<()>;

    /// Queue the answer to a device method
    fn send_method_response(
        &mut self,
        id: OperationId,
        method_id: MethodId,
        status: i32,
        payload: &[u8],
    ) -> crate::Result<()>;

    /// Settle a received cloud to device message
    fn send_message_disposition(
        &mut self,
        tag: DeliveryTag,
        disposition: DispositionResult,
    ) -> crate::Result<()>;

    /// Start receiving a kind of inbound traffic
    fn subscribe(&mut self, subscription: Subscription) -> crate::Result<()>;

    /// Stop receiving a kind of inbound traffic
    fn unsubscribe(&mut self, subscription: Subscription);

    /// Transport specific tuning
    fn set_option(&mut self, name: &str, _value: &Value) -> crate::Result<()> {
        Err(crate::IoTHubError::not_supported(format!(
            "option '{}' is not supported by the transport",
            name
        )))
    }

    /// Process pending network I/O without blocking and report what happened
    fn do_work(&mut self, events: &mut TransportEvents);
}
