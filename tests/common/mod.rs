#![allow(dead_code)]

use iothub_device_client::{
    BlobEvent, BlobEvents, BlobTransport, ConfirmationResult, ConnectionDescriptor,
    ConnectionStatusReason, DeliveryTag, DispositionResult, IoTHubClient, IoTHubError, ManualClock,
    Message, MethodId, OperationId, Subscription, Transport, TransportEvent, TransportEvents,
    UploadFinish, UploadSessionId,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

pub const CONNECTION_STRING: &str =
    "HostName=test-hub.azure-devices.net;DeviceId=test-device;SharedAccessKey=c2VjcmV0a2V5";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Shared log the tests use to check ordering across callbacks and transports
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Debug, Default)]
pub struct Script {
    /// Every open attempt is answered with a disconnect
    pub fail_open: bool,
    /// Completed operations are acknowledged with this result on the next `do_work`
    pub auto_ack: Option<ConfirmationResult>,
    pub reject_sends: bool,
    pub supported_options: Vec<String>,
    pub inbound: VecDeque<TransportEvent>,

    pub opens: usize,
    pub closed: bool,
    pub registered: Option<String>,
    pub sent: Vec<(OperationId, Message)>,
    pub reported: Vec<(OperationId, Vec<u8>)>,
    pub method_responses: Vec<(MethodId, i32, Vec<u8>)>,
    pub dispositions: Vec<(DeliveryTag, DispositionResult)>,
    pub subscriptions: Vec<Subscription>,
    pub options: Vec<(String, Value)>,

    pending_open: bool,
    pending_acks: Vec<OperationId>,
}

/// Loopback transport whose behaviour is scripted by the test holding a clone
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<Script>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acking(result: ConfirmationResult) -> Self {
        let mock = Self::new();
        mock.script().auto_ack = Some(result);
        mock
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn push(&self, event: TransportEvent) {
        self.script().inbound.push_back(event);
    }

    fn accept(&self, id: OperationId) -> iothub_device_client::Result<()> {
        let mut script = self.script();
        if script.reject_sends {
            return Err(IoTHubError::Transport("send rejected".to_string()));
        }
        if script.auto_ack.is_some() {
            script.pending_acks.push(id);
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn register_device(&mut self, descriptor: &ConnectionDescriptor) -> iothub_device_client::Result<()> {
        self.script().registered = Some(descriptor.device_id.clone());
        Ok(())
    }

    fn open(&mut self) -> iothub_device_client::Result<()> {
        let mut script = self.script();
        script.opens += 1;
        script.pending_open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.script().closed = true;
    }

    fn send_event(&mut self, id: OperationId, message: &Message) -> iothub_device_client::Result<()> {
        self.accept(id)?;
        self.script().sent.push((id, message.clone()));
        Ok(())
    }

    fn send_reported_state(&mut self, id: OperationId, document: &[u8]) -> iothub_device_client::Result<()> {
        self.accept(id)?;
        self.script().reported.push((id, document.to_vec()));
        Ok(())
    }

    fn send_method_response(
        &mut self,
        id: OperationId,
        method_id: MethodId,
        status: i32,
        payload: &[u8],
    ) -> iothub_device_client::Result<()> {
        self.accept(id)?;
        self.script()
            .method_responses
            .push((method_id, status, payload.to_vec()));
        Ok(())
    }

    fn send_message_disposition(
        &mut self,
        tag: DeliveryTag,
        disposition: DispositionResult,
    ) -> iothub_device_client::Result<()> {
        self.script().dispositions.push((tag, disposition));
        Ok(())
    }

    fn subscribe(&mut self, subscription: Subscription) -> iothub_device_client::Result<()> {
        self.script().subscriptions.push(subscription);
        Ok(())
    }

    fn unsubscribe(&mut self, subscription: Subscription) {
        self.script().subscriptions.retain(|s| *s != subscription);
    }

    fn set_option(&mut self, name: &str, value: &Value) -> iothub_device_client::Result<()> {
        let mut script = self.script();
        if !script.supported_options.iter().any(|o| o == name) {
            return Err(IoTHubError::NotSupported(name.to_string()));
        }
        script.options.push((name.to_string(), value.clone()));
        Ok(())
    }

    fn do_work(&mut self, events: &mut TransportEvents) {
        let mut script = self.script();
        if std::mem::take(&mut script.pending_open) {
            if script.fail_open {
                events.push(TransportEvent::Disconnected(
                    ConnectionStatusReason::CommunicationError,
                ));
            } else {
                events.push(TransportEvent::Connected);
            }
        }
        if let Some(result) = script.auto_ack {
            for id in std::mem::take(&mut script.pending_acks) {
                events.push(TransportEvent::Completed {
                    id,
                    result,
                    status_code: Some(200),
                });
            }
        }
        while let Some(event) = script.inbound.pop_front() {
            events.push(event);
        }
    }
}

/// Blob storage that acknowledges everything on the next `do_work`, unless told otherwise
#[derive(Debug, Clone, Default)]
pub struct MockBlob {
    journal: Journal,
    state: Arc<Mutex<BlobState>>,
}

#[derive(Debug, Default)]
struct BlobState {
    fail_block: Option<u32>,
    queued: VecDeque<BlobEvent>,
}

impl MockBlob {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            state: Default::default(),
        }
    }

    /// Report block `block_number` as failed
    pub fn fail_block(&self, block_number: u32) {
        self.state.lock().unwrap().fail_block = Some(block_number);
    }

    fn queue(&self, event: BlobEvent) {
        self.state.lock().unwrap().queued.push_back(event);
    }
}

impl BlobTransport for MockBlob {
    fn begin_upload(&mut self, session: UploadSessionId, destination: &str) -> iothub_device_client::Result<()> {
        self.journal.record(format!("begin {}", destination));
        self.queue(BlobEvent::Started {
            session,
            result: iothub_device_client::FileUploadResult::Ok,
        });
        Ok(())
    }

    fn put_block(
        &mut self,
        _session: UploadSessionId,
        id: OperationId,
        block_number: u32,
        data: &[u8],
    ) -> iothub_device_client::Result<()> {
        self.journal.record(format!(
            "put {} {}",
            block_number,
            String::from_utf8_lossy(data)
        ));
        let failed = self.state.lock().unwrap().fail_block == Some(block_number);
        self.queue(BlobEvent::BlockCompleted {
            id,
            result: if failed {
                ConfirmationResult::Error
            } else {
                ConfirmationResult::Ok
            },
        });
        Ok(())
    }

    fn finish_upload(&mut self, session: UploadSessionId, finish: UploadFinish) -> iothub_device_client::Result<()> {
        self.journal.record(format!("finish {:?}", finish));
        if finish == UploadFinish::Commit {
            self.queue(BlobEvent::Finished {
                session,
                result: iothub_device_client::FileUploadResult::Ok,
            });
        }
        Ok(())
    }

    fn do_work(&mut self, events: &mut BlobEvents) {
        let mut state = self.state.lock().unwrap();
        while let Some(event) = state.queued.pop_front() {
            events.push(event);
        }
    }
}

pub fn client(transport: MockTransport) -> IoTHubClient<MockTransport> {
    init_logging();
    IoTHubClient::from_connection_string(CONNECTION_STRING, transport).unwrap()
}

pub fn client_with_clock(
    transport: MockTransport,
    clock: &ManualClock,
) -> IoTHubClient<MockTransport> {
    init_logging();
    IoTHubClient::builder(transport)
        .connection_string(CONNECTION_STRING)
        .unwrap()
        .clock(clock.clone())
        .rng_seed(7)
        .build()
        .unwrap()
}

pub fn pump(client: &mut IoTHubClient<MockTransport>, cycles: usize) {
    for _ in 0..cycles {
        client.do_work();
    }
}
