use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use crate::client_builder::ClientConfig;
use crate::clock::{Clock, SystemClock};
use crate::connection::{
    ConnectionState, ConnectionStateMachine, ConnectionStatusReason, Step, Transition,
};
use crate::dtmi::Dtmi;
use crate::error::IoTHubError;
use crate::message::{DirectMethodResponse, DispositionResult, Message};
use crate::registry::{
    ConfirmationResult, OperationId, OperationKind, PendingOperation, PendingOperationRegistry,
};
use crate::retry::{RetryPolicy, RetryPolicyKind};
use crate::token::ConnectionDescriptor;
use crate::transport::{
    MethodId, Subscription, Transport, TransportEvent, TransportEvents, TwinUpdateState,
};
use crate::upload::{BlobEvent, BlobEvents, BlobTransport, UploadCoordinator, UploadSessionId};
#[cfg(feature = "upload-to-blob")]
use crate::upload::{
    BlockBuffer, FileUploadCallback, FileUploadResult, GetDataCallback, GetDataCallbackEx,
    GetDataResult, BLOCK_SIZE,
};

/// Largest device to cloud message the hub accepts
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Longest retry timeout ceiling accepted by [`IoTHubClient::set_retry_policy`]
pub const MAX_RETRY_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Status returned to the cloud when a method arrives and no method callback is registered
const METHOD_NOT_IMPLEMENTED: i32 = 501;

const OPTION_RETRY_INTERVAL_SEC: &str = "retry_interval_sec";
const OPTION_RETRY_MAX_DELAY_SECS: &str = "retry_max_delay_secs";
const OPTION_RETRY_JITTER_FRACTION: &str = "retry_jitter_fraction";
const OPTION_PRODUCT_INFO: &str = "product_info";
const OPTION_MODEL_ID: &str = "model_id";
const OPTION_MAX_PENDING_OPERATIONS: &str = "max_pending_operations";

/// Subscriptions are (re)applied in this order after every connect
const SUBSCRIPTION_ORDER: [Subscription; 3] = [
    Subscription::Messages,
    Subscription::DeviceTwin,
    Subscription::DeviceMethods,
];

/// Called once with the outcome of a telemetry event
pub type EventConfirmationCallback = Box<dyn FnOnce(ConfirmationResult) + Send>;

/// Called once with the outcome of a reported state update and the hub's status code
pub type ReportedStateCallback = Box<dyn FnOnce(ConfirmationResult, Option<i32>) + Send>;

/// Called for every cloud to device message; the answer settles the message
pub type MessageCallback = Box<dyn FnMut(&Message) -> DispositionResult + Send>;

/// Called for every connection state transition
pub type ConnectionStatusCallback =
    Box<dyn FnMut(ConnectionState, ConnectionStatusReason) + Send>;

/// Called with full twin documents and desired property patches
pub type DeviceTwinCallback = Box<dyn FnMut(TwinUpdateState, &[u8]) + Send>;

/// Answers a device method synchronously
pub type DeviceMethodCallback = Box<dyn FnMut(&str, &[u8]) -> DirectMethodResponse + Send>;

/// Accepts a device method to be answered later with [`IoTHubClient::device_method_response`]
pub type DeviceMethodCallbackEx = Box<dyn FnMut(&str, &[u8], MethodId) + Send>;

/// Whether telemetry is still waiting for acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// No telemetry event outstanding
    Idle,
    /// At least one telemetry event outstanding
    Busy,
}

/// What a single [`IoTHubClient::do_work`] call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSummary {
    /// Connection state after the call
    pub state: ConnectionState,
    /// Connection state transitions made during the call
    pub transitions: usize,
    /// User callbacks invoked during the call
    pub callbacks: usize,
    /// Operations still outstanding
    pub pending_operations: usize,
    /// Uploads still in progress
    pub active_uploads: usize,
    /// Reconnect attempts made since the last successful connect
    pub retry_attempt: u32,
}

enum MethodHandler {
    Plain(DeviceMethodCallback),
    Ex(DeviceMethodCallbackEx),
}

/// Payload and callback of an outstanding operation
enum Operation {
    SendEvent {
        message: Message,
        callback: EventConfirmationCallback,
    },
    ReportedState {
        document: Vec<u8>,
        callback: ReportedStateCallback,
    },
    MethodResponse {
        method_id: MethodId,
        status: i32,
        payload: Vec<u8>,
    },
    UploadBlock(UploadSessionId),
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::SendEvent { message, .. } => write!(f, "SendEvent({:?})", message.message_id()),
            Operation::ReportedState { document, .. } => {
                write!(f, "ReportedState({} bytes)", document.len())
            }
            Operation::MethodResponse {
                method_id, status, ..
            } => write!(f, "MethodResponse({:?}, {})", method_id, status),
            Operation::UploadBlock(session) => write!(f, "UploadBlock({})", session),
        }
    }
}

/// Deferred user callback, run once internal state is settled
enum Dispatch {
    Status(Transition),
    Completed {
        op: PendingOperation<Operation>,
        result: ConfirmationResult,
        status_code: Option<i32>,
    },
    Message {
        tag: crate::transport::DeliveryTag,
        message: Message,
    },
    Twin {
        state: TwinUpdateState,
        payload: Vec<u8>,
    },
    Method {
        method_id: MethodId,
        method_name: String,
        payload: Vec<u8>,
    },
}

/// Client for communicating with IoT hub
///
/// The client owns no threads. Every request only queues work; the embedding application
/// calls [`IoTHubClient::do_work`] on a cadence of its choosing, and that call advances the
/// connection, moves bytes through the transport and runs callbacks. Callbacks run only after
/// the client has finished updating its own state for the cycle.
pub struct IoTHubClient<T: Transport> {
    descriptor: ConnectionDescriptor,
    transport: T,
    blob: Option<Box<dyn BlobTransport + Send>>,
    uploads: UploadCoordinator,
    clock: Box<dyn Clock + Send>,
    rng: StdRng,
    connection: ConnectionStateMachine,
    registry: PendingOperationRegistry<Operation>,
    status_callback: Option<ConnectionStatusCallback>,
    message_callback: Option<MessageCallback>,
    twin_callback: Option<DeviceTwinCallback>,
    method_handler: Option<MethodHandler>,
    outstanding_methods: HashSet<MethodId>,
    desired_subscriptions: HashSet<Subscription>,
    active_subscriptions: HashSet<Subscription>,
    last_message_receive_time: Option<DateTime<Utc>>,
    product_info: Option<String>,
    model_id: Option<Dtmi>,
    destroyed: bool,
}

impl<T: Transport> fmt::Debug for IoTHubClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoTHubClient")
            .field("device_id", &self.descriptor.device_id)
            .field("state", &self.connection.state())
            .field("pending_operations", &self.registry.len())
            .field("uploads", &self.uploads)
            .finish()
    }
}

/// Everything a client is made of besides its identity and transport
pub(crate) struct ClientParts {
    pub(crate) blob: Option<Box<dyn BlobTransport + Send>>,
    pub(crate) clock: Box<dyn Clock + Send>,
    pub(crate) rng: StdRng,
    pub(crate) config: ClientConfig,
}

impl Default for ClientParts {
    fn default() -> Self {
        Self {
            blob: None,
            clock: Box::new(SystemClock),
            rng: StdRng::from_entropy(),
            config: ClientConfig::default(),
        }
    }
}

impl<T: Transport> IoTHubClient<T> {
    /// Create a client for the device described by `descriptor`
    ///
    /// The transport is bound to the device identity but no connection is attempted until
    /// something needs one.
    ///
    /// # Example
    /// ```no_run
    /// use iothub_device_client::{ConnectionDescriptor, IoTHubClient, Transport};
    ///
    /// fn connect<T: Transport>(transport: T) -> Result<IoTHubClient<T>, Box<dyn std::error::Error>> {
    ///     let descriptor = ConnectionDescriptor::from_connection_string(
    ///         "HostName=iothubname.azure-devices.net;DeviceId=MyDeviceId;SharedAccessKey=c2VjcmV0",
    ///     )?;
    ///     Ok(IoTHubClient::new(descriptor, transport)?)
    /// }
    /// ```
    pub fn new(descriptor: ConnectionDescriptor, transport: T) -> crate::Result<Self> {
        Self::with_parts(descriptor, transport, ClientParts::default())
    }

    /// Create a client from a device connection string
    pub fn from_connection_string(connection_string: &str, transport: T) -> crate::Result<Self> {
        let descriptor = ConnectionDescriptor::from_connection_string(connection_string)?;
        Self::new(descriptor, transport)
    }

    pub(crate) fn with_parts(
        descriptor: ConnectionDescriptor,
        mut transport: T,
        parts: ClientParts,
    ) -> crate::Result<Self> {
        let ClientParts {
            blob,
            clock,
            rng,
            config,
        } = parts;
        config.retry.validate()?;
        if config.max_pending_operations == 0 {
            return Err(IoTHubError::invalid_argument(
                "max_pending_operations must be at least 1",
            ));
        }
        let model_id = match &config.model_id {
            Some(id) => Some(parse_model_id(id)?),
            None => None,
        };

        transport.register_device(&descriptor)?;
        let announced = [
            (OPTION_PRODUCT_INFO, config.product_info.as_deref()),
            (OPTION_MODEL_ID, model_id.as_ref().map(Dtmi::as_str)),
        ];
        for (name, value) in announced {
            if let Some(value) = value {
                match transport.set_option(name, &Value::from(value)) {
                    Ok(()) | Err(IoTHubError::NotSupported(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        info!(
            "Created client for device '{}' on '{}'",
            descriptor.device_id, descriptor.hostname
        );

        Ok(Self {
            descriptor,
            transport,
            blob,
            uploads: UploadCoordinator::new(),
            clock,
            rng,
            connection: ConnectionStateMachine::new(config.retry_policy, config.retry),
            registry: PendingOperationRegistry::new(config.max_pending_operations),
            status_callback: None,
            message_callback: None,
            twin_callback: None,
            method_handler: None,
            outstanding_methods: HashSet::new(),
            desired_subscriptions: HashSet::new(),
            active_subscriptions: HashSet::new(),
            last_message_receive_time: None,
            product_info: config.product_info,
            model_id,
            destroyed: false,
        })
    }

    /// The device this client talks for
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// The transport provider, e.g. to inspect adapter specific state
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Queue a device to cloud telemetry event
    ///
    /// `callback` runs exactly once: when the hub acknowledges the event, when the transport
    /// reports a failure, or when the client is destroyed first.
    ///
    /// Callbacks run inside [`IoTHubClient::do_work`] and cannot borrow the client. To queue
    /// follow-up work from a callback, send it through a captured channel and issue the request
    /// once `do_work` returns:
    ///
    /// ```no_run
    /// use iothub_device_client::{ConfirmationResult, IoTHubClient, Message, Transport};
    /// use std::sync::mpsc;
    ///
    /// fn send_until_delivered<T: Transport>(client: &mut IoTHubClient<T>, body: &[u8]) {
    ///     let (tx, rx) = mpsc::channel();
    ///     let retry = tx.clone();
    ///     client
    ///         .send_event_async(Message::new(body.to_vec()), move |result| {
    ///             let _ = retry.send(result);
    ///         })
    ///         .ok();
    ///     loop {
    ///         client.do_work();
    ///         match rx.try_recv() {
    ///             Ok(ConfirmationResult::Ok) => break,
    ///             Ok(_) => {
    ///                 let retry = tx.clone();
    ///                 client
    ///                     .send_event_async(Message::new(body.to_vec()), move |result| {
    ///                         let _ = retry.send(result);
    ///                     })
    ///                     .ok();
    ///             }
    ///             Err(_) => {}
    ///         }
    ///     }
    /// }
    /// ```
    pub fn send_event_async<F>(&mut self, message: Message, callback: F) -> crate::Result<OperationId>
    where
        F: FnOnce(ConfirmationResult) + Send + 'static,
    {
        let size = message.body.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(IoTHubError::invalid_argument(format!(
                "message of {} bytes exceeds {} bytes",
                size, MAX_MESSAGE_SIZE
            )));
        }

        let id = self.registry.register(
            OperationKind::SendEvent,
            Operation::SendEvent {
                message,
                callback: Box::new(callback),
            },
            self.clock.now(),
        )?;
        trace!("Queued telemetry event {} ({} bytes)", id, size);
        self.connection.request_connect();
        Ok(id)
    }

    /// Whether telemetry events are still outstanding
    pub fn get_send_status(&self) -> SendStatus {
        if self.registry.count(OperationKind::SendEvent) > 0 {
            SendStatus::Busy
        } else {
            SendStatus::Idle
        }
    }

    /// Register the connection status callback, replacing any previous one
    pub fn set_connection_status_callback<F>(&mut self, callback: F)
    where
        F: FnMut(ConnectionState, ConnectionStatusReason) + Send + 'static,
    {
        self.status_callback = Some(Box::new(callback));
    }

    /// Set the reconnect policy and the ceiling on total retry time (zero retries forever)
    pub fn set_retry_policy(
        &mut self,
        kind: RetryPolicyKind,
        timeout_limit_seconds: u64,
    ) -> crate::Result<()> {
        if timeout_limit_seconds > MAX_RETRY_TIMEOUT_SECS {
            return Err(IoTHubError::invalid_argument(format!(
                "retry timeout of {}s exceeds {}s",
                timeout_limit_seconds, MAX_RETRY_TIMEOUT_SECS
            )));
        }
        self.connection
            .set_policy(RetryPolicy::new(kind, timeout_limit_seconds));
        Ok(())
    }

    /// The reconnect policy and its timeout ceiling
    pub fn get_retry_policy(&self) -> (RetryPolicyKind, u64) {
        let policy = self.connection.policy();
        (policy.kind, policy.timeout_limit_seconds)
    }

    /// When the last cloud to device message arrived, if any has
    pub fn get_last_message_receive_time(&self) -> Option<DateTime<Utc>> {
        self.last_message_receive_time
    }

    /// Ask for a connection without sending anything
    ///
    /// Also leaves [`ConnectionState::Failed`], like [`IoTHubClient::reconnect`].
    pub fn connect(&mut self) {
        debug!("Connect requested while {:?}", self.connection.state());
        self.connection.reconnect();
    }

    /// Start connecting again after the retry policy gave up
    pub fn reconnect(&mut self) {
        info!("Reconnect requested while {:?}", self.connection.state());
        self.connection.reconnect();
    }

    /// Set a client or transport option
    ///
    /// Client options: `retry_interval_sec`, `retry_max_delay_secs`, `retry_jitter_fraction`,
    /// `product_info`, `model_id`, `max_pending_operations`. Any other name goes to the
    /// transport.
    pub fn set_option(&mut self, name: &str, value: Value) -> crate::Result<()> {
        match name {
            OPTION_RETRY_INTERVAL_SEC => {
                let mut config = self.connection.config().clone();
                config.interval_secs = expect_u64(name, &value)?;
                self.connection.set_config(config)?;
            }
            OPTION_RETRY_MAX_DELAY_SECS => {
                let mut config = self.connection.config().clone();
                config.max_delay_secs = expect_u64(name, &value)?;
                self.connection.set_config(config)?;
            }
            OPTION_RETRY_JITTER_FRACTION => {
                let mut config = self.connection.config().clone();
                config.jitter_fraction = value
                    .as_f64()
                    .filter(|f| (0.0..=1.0).contains(f))
                    .ok_or_else(|| invalid_value(name, &value))?;
                self.connection.set_config(config)?;
            }
            OPTION_MAX_PENDING_OPERATIONS => {
                let capacity = usize::try_from(expect_u64(name, &value)?)
                    .map_err(|_| invalid_value(name, &value))?;
                if capacity == 0 {
                    return Err(invalid_value(name, &value));
                }
                if capacity < self.registry.len() {
                    return Err(IoTHubError::invalid_state(format!(
                        "{} operations are already outstanding",
                        self.registry.len()
                    )));
                }
                self.registry.set_capacity(capacity);
            }
            OPTION_PRODUCT_INFO => {
                let info = value
                    .as_str()
                    .ok_or_else(|| invalid_value(name, &value))?
                    .to_string();
                self.forward_option(name, &value)?;
                self.product_info = Some(info);
            }
            OPTION_MODEL_ID => {
                let id = value.as_str().ok_or_else(|| invalid_value(name, &value))?;
                let dtmi = parse_model_id(id)?;
                self.forward_option(name, &value)?;
                self.model_id = Some(dtmi);
            }
            _ => return self.transport.set_option(name, &value),
        }
        debug!("Option {} set to {}", name, value);
        Ok(())
    }

    /// Read back a client option
    pub fn get_option(&self, name: &str) -> Option<Value> {
        let config = self.connection.config();
        match name {
            OPTION_RETRY_INTERVAL_SEC => Some(Value::from(config.interval_secs)),
            OPTION_RETRY_MAX_DELAY_SECS => Some(Value::from(config.max_delay_secs)),
            OPTION_RETRY_JITTER_FRACTION => Some(Value::from(config.jitter_fraction)),
            OPTION_MAX_PENDING_OPERATIONS => Some(Value::from(self.registry.capacity() as u64)),
            OPTION_PRODUCT_INFO => self.product_info.clone().map(Value::from),
            OPTION_MODEL_ID => self.model_id.as_ref().map(|id| Value::from(id.as_str())),
            _ => None,
        }
    }

    /// Client level options are also offered to the transport, which may ignore them
    fn forward_option(&mut self, name: &str, value: &Value) -> crate::Result<()> {
        match self.transport.set_option(name, value) {
            Err(IoTHubError::NotSupported(_)) => Ok(()),
            other => other,
        }
    }

    /// Register the callback for cloud to device messages, replacing any previous one
    ///
    /// The replaced callback is dropped without being told.
    #[cfg(feature = "c2d-messages")]
    pub fn set_message_callback<F>(&mut self, callback: F) -> crate::Result<()>
    where
        F: FnMut(&Message) -> DispositionResult + Send + 'static,
    {
        self.message_callback = Some(Box::new(callback));
        self.want(Subscription::Messages);
        Ok(())
    }

    /// Stop receiving cloud to device messages
    #[cfg(feature = "c2d-messages")]
    pub fn clear_message_callback(&mut self) {
        self.message_callback = None;
        self.desired_subscriptions.remove(&Subscription::Messages);
    }

    /// Register the callback for twin documents and desired property patches
    #[cfg(feature = "twin-properties")]
    pub fn set_device_twin_callback<F>(&mut self, callback: F) -> crate::Result<()>
    where
        F: FnMut(TwinUpdateState, &[u8]) + Send + 'static,
    {
        self.twin_callback = Some(Box::new(callback));
        self.want(Subscription::DeviceTwin);
        Ok(())
    }

    /// Send a reported properties patch
    ///
    /// The document must be a JSON object. `callback` runs exactly once with the outcome and
    /// the status code the hub answered with, if any.
    #[cfg(feature = "twin-properties")]
    pub fn send_reported_state<F>(
        &mut self,
        document: &[u8],
        callback: F,
    ) -> crate::Result<OperationId>
    where
        F: FnOnce(ConfirmationResult, Option<i32>) + Send + 'static,
    {
        match serde_json::from_slice::<Value>(document) {
            Ok(Value::Object(_)) => {}
            Ok(_) => {
                return Err(IoTHubError::invalid_argument(
                    "reported state must be a JSON object",
                ))
            }
            Err(e) => {
                return Err(IoTHubError::invalid_argument(format!(
                    "reported state is not JSON: {}",
                    e
                )))
            }
        }

        let id = self.registry.register(
            OperationKind::ReportedStateUpdate,
            Operation::ReportedState {
                document: document.to_vec(),
                callback: Box::new(callback),
            },
            self.clock.now(),
        )?;
        trace!("Queued reported state {}", id);
        self.connection.request_connect();
        Ok(id)
    }

    /// Register a device method callback that answers synchronously
    ///
    /// Replaces any previous method callback, including one set with
    /// [`IoTHubClient::set_device_method_callback_ex`].
    #[cfg(feature = "direct-methods")]
    pub fn set_device_method_callback<F>(&mut self, callback: F) -> crate::Result<()>
    where
        F: FnMut(&str, &[u8]) -> DirectMethodResponse + Send + 'static,
    {
        self.method_handler = Some(MethodHandler::Plain(Box::new(callback)));
        self.want(Subscription::DeviceMethods);
        Ok(())
    }

    /// Register a device method callback that answers later with
    /// [`IoTHubClient::device_method_response`]
    ///
    /// Replaces any previous method callback.
    #[cfg(feature = "direct-methods")]
    pub fn set_device_method_callback_ex<F>(&mut self, callback: F) -> crate::Result<()>
    where
        F: FnMut(&str, &[u8], MethodId) + Send + 'static,
    {
        self.method_handler = Some(MethodHandler::Ex(Box::new(callback)));
        self.want(Subscription::DeviceMethods);
        Ok(())
    }

    /// Answer a device method accepted by the extended method callback
    ///
    /// Each `method_id` can be answered once.
    #[cfg(feature = "direct-methods")]
    pub fn device_method_response(
        &mut self,
        method_id: MethodId,
        response: &[u8],
        status: i32,
    ) -> crate::Result<()> {
        if !self.outstanding_methods.contains(&method_id) {
            return Err(IoTHubError::invalid_argument(format!(
                "{:?} is not awaiting a response",
                method_id
            )));
        }
        self.queue_method_response(method_id, status, response.to_vec())?;
        self.outstanding_methods.remove(&method_id);
        Ok(())
    }

    /// Upload `data` to `destination_name` as a single block
    ///
    /// `Ok` only means the upload was accepted. The outcome arrives during a later
    /// [`IoTHubClient::do_work`] and is only logged, with failures at warn level; use
    /// [`IoTHubClient::upload_to_blob_async`] when the caller needs to act on it.
    #[cfg(feature = "upload-to-blob")]
    pub fn upload_to_blob(
        &mut self,
        destination_name: &str,
        data: &[u8],
    ) -> crate::Result<UploadSessionId> {
        let destination = destination_name.to_string();
        self.upload_to_blob_async(destination_name, data, move |result| match result {
            FileUploadResult::Ok => debug!("Upload of '{}' finished", destination),
            _ => warn!("Upload of '{}' failed: {:?}", destination, result),
        })
    }

    /// Upload `data` to `destination_name` as a single block and report the outcome
    #[cfg(feature = "upload-to-blob")]
    pub fn upload_to_blob_async<F>(
        &mut self,
        destination_name: &str,
        data: &[u8],
        callback: F,
    ) -> crate::Result<UploadSessionId>
    where
        F: FnOnce(FileUploadResult) + Send + 'static,
    {
        self.check_upload(destination_name)?;
        if data.len() > BLOCK_SIZE {
            return Err(IoTHubError::invalid_argument(format!(
                "{} bytes do not fit a single block, use upload_multiple_blocks_to_blob",
                data.len()
            )));
        }
        let callback: FileUploadCallback = Box::new(callback);
        Ok(self
            .uploads
            .start_single(destination_name, data.to_vec(), callback))
    }

    /// Upload blocks pulled from `get_data` to `destination_name`
    ///
    /// `get_data` is called with the outcome of the previous block (`Ok` the first time) and a
    /// buffer to put the next block in. Leaving the buffer empty ends the upload; `get_data`
    /// is then called once more without a buffer, carrying the outcome of the whole upload.
    #[cfg(feature = "upload-to-blob")]
    pub fn upload_multiple_blocks_to_blob<F>(
        &mut self,
        destination_name: &str,
        get_data: F,
    ) -> crate::Result<UploadSessionId>
    where
        F: FnMut(FileUploadResult, Option<&mut BlockBuffer>) + Send + 'static,
    {
        self.check_upload(destination_name)?;
        let get_data: GetDataCallback = Box::new(get_data);
        Ok(self.uploads.start(destination_name, get_data))
    }

    /// Like [`IoTHubClient::upload_multiple_blocks_to_blob`], but `get_data` can abort the
    /// upload by returning [`GetDataResult::Abort`]
    #[cfg(feature = "upload-to-blob")]
    pub fn upload_multiple_blocks_to_blob_ex<F>(
        &mut self,
        destination_name: &str,
        get_data: F,
    ) -> crate::Result<UploadSessionId>
    where
        F: FnMut(FileUploadResult, Option<&mut BlockBuffer>) -> GetDataResult + Send + 'static,
    {
        self.check_upload(destination_name)?;
        let get_data: GetDataCallbackEx = Box::new(get_data);
        Ok(self.uploads.start_ex(destination_name, get_data))
    }

    #[cfg(feature = "upload-to-blob")]
    fn check_upload(&self, destination_name: &str) -> crate::Result<()> {
        if destination_name.trim().is_empty() {
            return Err(IoTHubError::invalid_argument("empty upload destination"));
        }
        if self.blob.is_none() {
            return Err(IoTHubError::not_supported(
                "no blob transport configured for uploads",
            ));
        }
        Ok(())
    }

    /// Advance the client: connection, transport I/O, completions and uploads
    ///
    /// Never blocks and never sleeps; call it again later to make further progress.
    pub fn do_work(&mut self) -> WorkSummary {
        let now = self.clock.now();
        let mut pending = Vec::new();

        // Connection / retry state machine
        let (transition, step) = self.connection.step(now);
        pending.extend(transition.map(Dispatch::Status));
        if step == Step::Open {
            if let Err(e) = self.transport.open() {
                warn!("Transport refused to open: {}", e);
                let transition = self.connection.on_disconnected(
                    ConnectionStatusReason::CommunicationError,
                    now,
                    &mut self.rng,
                );
                pending.extend(transition.map(Dispatch::Status));
            }
        }
        if self.connection.state() == ConnectionState::Connected {
            self.sync_subscriptions();
            self.submit_held(&mut pending);
        }

        // Transport I/O
        let mut events = TransportEvents::new();
        self.transport.do_work(&mut events);

        // Completions and inbound traffic reported by the transport
        while let Some(event) = events.pop() {
            self.handle_event(event, now, &mut pending);
        }

        let transitions = pending
            .iter()
            .filter(|d| matches!(d, Dispatch::Status(_)))
            .count();
        let mut callbacks = self.dispatch(pending);

        // Upload block alternations
        callbacks += self.pump_uploads(now);

        WorkSummary {
            state: self.connection.state(),
            transitions,
            callbacks,
            pending_operations: self.registry.len(),
            active_uploads: self.uploads.active(),
            retry_attempt: self.connection.attempt(),
        }
    }

    /// Tear the client down
    ///
    /// Every outstanding operation is completed with [`ConfirmationResult::BecauseDestroy`],
    /// oldest first, and every upload still running ends with an error, before this returns.
    /// Dropping the client does the same.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        info!(
            "Destroying client for '{}' with {} operations outstanding",
            self.descriptor.device_id,
            self.registry.len()
        );

        self.transport.close();

        // Each entry is dispatched before the next one is cancelled, so an upload ended by one
        // of its blocks reports in registration order with the other operations.
        for op in self.registry.cancel_all() {
            let mut pending = Vec::new();
            self.finish_operation(op, ConfirmationResult::BecauseDestroy, None, &mut pending);
            self.dispatch(pending);
            self.uploads.dispatch_finished();
        }
        self.uploads.cancel_all(self.blob.as_deref_mut());
        self.uploads.dispatch_finished();
        self.outstanding_methods.clear();

        if let Some(transition) = self.connection.destroy() {
            self.dispatch(vec![Dispatch::Status(transition)]);
        }
    }

    fn want(&mut self, subscription: Subscription) {
        self.desired_subscriptions.insert(subscription);
        self.connection.request_connect();
    }

    fn sync_subscriptions(&mut self) {
        for subscription in SUBSCRIPTION_ORDER {
            let desired = self.desired_subscriptions.contains(&subscription);
            let active = self.active_subscriptions.contains(&subscription);
            if desired && !active {
                match self.transport.subscribe(subscription) {
                    Ok(()) => {
                        debug!("Subscribed to {:?}", subscription);
                        self.active_subscriptions.insert(subscription);
                    }
                    Err(e) => warn!("Subscribing to {:?} failed: {}", subscription, e),
                }
            } else if !desired && active {
                debug!("Unsubscribing from {:?}", subscription);
                self.transport.unsubscribe(subscription);
                self.active_subscriptions.remove(&subscription);
            }
        }
    }

    /// Hand every held operation to the transport, oldest first
    fn submit_held(&mut self, pending: &mut Vec<Dispatch>) {
        for id in self.registry.held() {
            let Some(op) = self.registry.get_mut(id) else {
                continue;
            };
            let submitted = match &op.callback {
                Operation::SendEvent { message, .. } => self.transport.send_event(id, message),
                Operation::ReportedState { document, .. } => {
                    self.transport.send_reported_state(id, document)
                }
                Operation::MethodResponse {
                    method_id,
                    status,
                    payload,
                } => self
                    .transport
                    .send_method_response(id, *method_id, *status, payload),
                Operation::UploadBlock(_) => continue,
            };
            match submitted {
                Ok(()) => {
                    trace!("Submitted {}", id);
                    op.submitted = true;
                }
                Err(e) => {
                    warn!("Transport rejected {}: {}", id, e);
                    if let Some(op) = self.registry.complete(id) {
                        self.finish_operation(op, ConfirmationResult::Error, None, pending);
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent, now: Instant, pending: &mut Vec<Dispatch>) {
        match event {
            TransportEvent::Connected => {
                if let Some(transition) = self.connection.on_connected() {
                    pending.push(Dispatch::Status(transition));
                    self.active_subscriptions.clear();
                    self.sync_subscriptions();
                    self.submit_held(pending);
                }
            }
            TransportEvent::Disconnected(reason) => {
                self.active_subscriptions.clear();
                let transition = self.connection.on_disconnected(reason, now, &mut self.rng);
                pending.extend(transition.map(Dispatch::Status));
            }
            TransportEvent::Completed {
                id,
                result,
                status_code,
            } => {
                if let Some(op) = self.registry.complete(id) {
                    self.finish_operation(op, result, status_code, pending);
                }
            }
            TransportEvent::Message { tag, message } => {
                self.last_message_receive_time = Some(self.clock.wall_clock());
                pending.push(Dispatch::Message { tag, message });
            }
            TransportEvent::Twin { state, payload } => {
                pending.push(Dispatch::Twin { state, payload });
            }
            TransportEvent::MethodInvoked {
                method_id,
                method_name,
                payload,
            } => pending.push(Dispatch::Method {
                method_id,
                method_name,
                payload,
            }),
        }
    }

    /// Route a removed operation to its owner: uploads to the coordinator, the rest to the
    /// caller's callback
    fn finish_operation(
        &mut self,
        op: PendingOperation<Operation>,
        result: ConfirmationResult,
        status_code: Option<i32>,
        pending: &mut Vec<Dispatch>,
    ) {
        trace!(
            "{} finished with {:?} after {:?}",
            op.id,
            result,
            self.clock.now().saturating_duration_since(op.created_at)
        );
        if let Operation::UploadBlock(session) = op.callback {
            match self.blob.as_deref_mut() {
                Some(blob) => self
                    .uploads
                    .on_block_completed(blob, session, op.id, result),
                None => warn!("{} finished without a blob transport", op.id),
            }
            return;
        }
        pending.push(Dispatch::Completed {
            op,
            result,
            status_code,
        });
    }

    /// Run deferred callbacks in order; returns how many user callbacks ran
    fn dispatch(&mut self, pending: Vec<Dispatch>) -> usize {
        let mut invoked = 0;
        for item in pending {
            match item {
                Dispatch::Status(transition) => {
                    if let Some(callback) = self.status_callback.as_mut() {
                        callback(transition.to, transition.reason);
                        invoked += 1;
                    }
                }
                Dispatch::Completed {
                    op,
                    result,
                    status_code,
                } => match op.callback {
                    Operation::SendEvent { callback, .. } => {
                        callback(result);
                        invoked += 1;
                    }
                    Operation::ReportedState { callback, .. } => {
                        callback(result, status_code);
                        invoked += 1;
                    }
                    Operation::MethodResponse { method_id, .. } => {
                        debug!("Response to {:?} finished: {:?}", method_id, result);
                    }
                    Operation::UploadBlock(session) => {
                        warn!("Block of {} reached the callback dispatcher", session);
                    }
                },
                Dispatch::Message { tag, message } => {
                    let disposition = match self.message_callback.as_mut() {
                        Some(callback) => {
                            invoked += 1;
                            callback(&message)
                        }
                        None => {
                            warn!("No message callback registered, abandoning {:?}", tag);
                            DispositionResult::Abandoned
                        }
                    };
                    if let Err(e) = self.transport.send_message_disposition(tag, disposition) {
                        warn!("Could not settle {:?}: {}", tag, e);
                    }
                }
                Dispatch::Twin { state, payload } => match self.twin_callback.as_mut() {
                    Some(callback) => {
                        callback(state, &payload);
                        invoked += 1;
                    }
                    None => debug!("Dropping {:?} twin update, no callback", state),
                },
                Dispatch::Method {
                    method_id,
                    method_name,
                    payload,
                } => {
                    invoked += self.dispatch_method(method_id, &method_name, &payload);
                }
            }
        }
        invoked
    }

    fn dispatch_method(&mut self, method_id: MethodId, method_name: &str, payload: &[u8]) -> usize {
        trace!("Device method '{}' invoked as {:?}", method_name, method_id);
        let (response, invoked) = match self.method_handler.as_mut() {
            Some(MethodHandler::Plain(callback)) => (callback(method_name, payload), 1),
            Some(MethodHandler::Ex(callback)) => {
                self.outstanding_methods.insert(method_id);
                callback(method_name, payload, method_id);
                return 1;
            }
            None => {
                warn!("No method callback registered for '{}'", method_name);
                (DirectMethodResponse::new(METHOD_NOT_IMPLEMENTED, None), 0)
            }
        };
        if let Err(e) = self.queue_method_response(method_id, response.status, response.body) {
            warn!("Could not answer {:?}: {}", method_id, e);
        }
        invoked
    }

    fn queue_method_response(
        &mut self,
        method_id: MethodId,
        status: i32,
        payload: Vec<u8>,
    ) -> crate::Result<()> {
        let id = self.registry.register(
            OperationKind::MethodResponse,
            Operation::MethodResponse {
                method_id,
                status,
                payload,
            },
            self.clock.now(),
        )?;
        trace!("Queued response {} to {:?}", id, method_id);
        self.connection.request_connect();
        Ok(())
    }

    fn pump_uploads(&mut self, now: Instant) -> usize {
        let events = match self.blob.as_deref_mut() {
            Some(blob) => {
                let mut events = BlobEvents::new();
                blob.do_work(&mut events);
                events
            }
            None => return self.uploads.dispatch_finished(),
        };

        let mut events = events;
        let mut pending = Vec::new();
        while let Some(event) = events.pop() {
            match event {
                BlobEvent::Started { session, result } => self.uploads.on_started(session, result),
                BlobEvent::BlockCompleted { id, result } => {
                    if let Some(op) = self.registry.complete(id) {
                        self.finish_operation(op, result, None, &mut pending);
                    }
                }
                BlobEvent::Finished { session, result } => {
                    self.uploads.on_finished(session, result)
                }
            }
        }
        let mut invoked = self.dispatch(pending);

        if let Some(blob) = self.blob.as_deref_mut() {
            self.uploads
                .pump(blob, &mut self.registry, Operation::UploadBlock, now);
        }
        invoked += self.uploads.dispatch_finished();
        invoked
    }
}

impl<T: Transport> Drop for IoTHubClient<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn parse_model_id(id: &str) -> crate::Result<Dtmi> {
    id.parse::<Dtmi>()
        .map_err(|e| IoTHubError::invalid_argument(e.to_string()))
}

fn expect_u64(name: &str, value: &Value) -> crate::Result<u64> {
    value.as_u64().ok_or_else(|| invalid_value(name, value))
}

fn invalid_value(name: &str, value: &Value) -> IoTHubError {
    IoTHubError::invalid_argument(format!("invalid value {} for option '{}'", value, name))
}
