//! In-process transport for the demos: connects on the first open, acknowledges everything on
//! the next pump and can play back cloud traffic.

use iothub_device_client::{
    ConfirmationResult, ConnectionDescriptor, DeliveryTag, DispositionResult, Message, MethodId,
    OperationId, Subscription, Transport, TransportEvent, TransportEvents,
};
use log::{debug, info};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct LoopbackTransport {
    opening: bool,
    acks: Vec<OperationId>,
    inbound: VecDeque<TransportEvent>,
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

#[allow(dead_code)]
impl LoopbackTransport {
    /// Queue a cloud to device message
    pub fn deliver(&mut self, body: &[u8]) {
        self.next_id += 1;
        self.inbound.push_back(TransportEvent::Message {
            tag: DeliveryTag(self.next_id),
            message: Message::new(body.to_vec()),
        });
    }

    /// Queue a device method invocation
    pub fn invoke(&mut self, method_name: &str, payload: &[u8]) {
        self.next_id += 1;
        self.inbound.push_back(TransportEvent::MethodInvoked {
            method_id: MethodId(self.next_id),
            method_name: method_name.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Queue a desired properties patch
    pub fn patch_desired(&mut self, payload: &[u8]) {
        self.inbound.push_back(TransportEvent::Twin {
            state: iothub_device_client::TwinUpdateState::Partial,
            payload: payload.to_vec(),
        });
    }
}

impl Transport for LoopbackTransport {
    fn register_device(&mut self, descriptor: &ConnectionDescriptor) -> iothub_device_client::Result<()> {
        let token = descriptor.token_source()?.get(&(chrono::Utc::now() + chrono::Duration::hours(1)));
        debug!("Signed token for {}: {} chars", descriptor.device_id, token.len());
        Ok(())
    }

    fn open(&mut self) -> iothub_device_client::Result<()> {
        self.opening = true;
        Ok(())
    }

    fn close(&mut self) {
        info!("Loopback closed");
    }

    fn send_event(&mut self, id: OperationId, message: &Message) -> iothub_device_client::Result<()> {
        info!("-> {}", String::from_utf8_lossy(&message.body));
        self.acks.push(id);
        Ok(())
    }

    fn send_reported_state(&mut self, id: OperationId, document: &[u8]) -> iothub_device_client::Result<()> {
        info!("-> reported {}", String::from_utf8_lossy(document));
        self.acks.push(id);
        Ok(())
    }

    fn send_method_response(
        &mut self,
        id: OperationId,
        method_id: MethodId,
        status: i32,
        payload: &[u8],
    ) -> iothub_device_client::Result<()> {
        info!(
            "-> {:?} answered {} {}",
            method_id,
            status,
            String::from_utf8_lossy(payload)
        );
        self.acks.push(id);
        Ok(())
    }

    fn send_message_disposition(
        &mut self,
        tag: DeliveryTag,
        disposition: DispositionResult,
    ) -> iothub_device_client::Result<()> {
        info!("-> {:?} {:?}", tag, disposition);
        Ok(())
    }

    fn subscribe(&mut self, subscription: Subscription) -> iothub_device_client::Result<()> {
        self.subscriptions.push(subscription);
        Ok(())
    }

    fn unsubscribe(&mut self, subscription: Subscription) {
        self.subscriptions.retain(|s| *s != subscription);
    }

    fn do_work(&mut self, events: &mut TransportEvents) {
        if std::mem::take(&mut self.opening) {
            events.push(TransportEvent::Connected);
        }
        for id in self.acks.drain(..) {
            events.push(TransportEvent::Completed {
                id,
                result: ConfirmationResult::Ok,
                status_code: Some(200),
            });
        }
        while let Some(event) = self.inbound.pop_front() {
            events.push(event);
        }
    }
}
