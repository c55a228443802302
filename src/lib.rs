//! Azure IoT Hub device client core for writing iot device code in rust
//!
//! The client runs on the caller's thread. Requests such as sending telemetry only queue work;
//! nothing happens on the network until the application calls
//! [`IoTHubClient::do_work`], which advances the connection (including reconnects governed by
//! the [retry policy](RetryPolicyKind)), drives the [`Transport`] and runs callbacks. Every
//! asynchronous request completes exactly once, even when the client is destroyed first.
//!
//! ## Feature flags
//!
//! SDK client uses [feature
//! flags](https://doc.rust-lang.org/cargo/reference/features.html#the-features-section) to
//! configure capabilities of the client sdk. By default all features are enabled.
//!
//! Device to cloud messaging is always available.
//!
//! - `c2d-messages`: Enables cloud to device messaging
//! - `twin-properties`: Enables device twin property updates
//! - `direct-methods`: Enables listening for direct method invocations
//! - `upload-to-blob`: Enables uploading files to blob storage
//!
//! ### Disabling capabilities
//! If not all features are required, disable the default features and add only desired.
//!
//! ```toml
//! iothub_device_client = { version = "0.1.0", features = [], default-features = false }
//! ```
//!
//! # Examples
//!
//! A simple client, pumped by a tokio interval
//! ```no_run
//! use iothub_device_client::{IoTHubClient, Message, Transport};
//! use tokio::time;
//!
//! async fn run(transport: impl Transport) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IoTHubClient::from_connection_string(
//!         "HostName=iothubname.azure-devices.net;DeviceId=MyDeviceId;SharedAccessKey=c2VjcmV0",
//!         transport,
//!     )?;
//!
//!     let mut interval = time::interval(time::Duration::from_millis(100));
//!     let mut count: u32 = 0;
//!
//!     loop {
//!         interval.tick().await;
//!
//!         if count % 10 == 0 {
//!             let msg = Message::builder()
//!                 .set_body(format!("Message #{}", count).as_bytes().to_vec())
//!                 .set_message_id(format!("{}-t", count))
//!                 .build();
//!
//!             client.send_event_async(msg, |result| println!("Sent: {:?}", result))?;
//!         }
//!
//!         client.do_work();
//!         count += 1;
//!     }
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

#[macro_use]
extern crate log;

/// IoT SDK package version
pub const SDK_VERSION: &str = std::env!("CARGO_PKG_VERSION");

/// The IoT Hub client
pub mod client;
mod client_builder;
/// Time sources
pub mod clock;
/// Connection states and the reconnect state machine
pub mod connection;
/// Digital twin model identifiers
pub mod dtmi;
mod error;
/// Message types for communicating with the IoT Hub
pub mod message;
/// Outstanding operation bookkeeping
pub mod registry;
/// Reconnect policies
pub mod retry;
/// Connection strings and shared access tokens
pub mod token;
/// Transport types
pub mod transport;
/// Blob uploads
pub mod upload;

pub use client::{IoTHubClient, SendStatus, WorkSummary};
pub use client_builder::{
    ClientConfig, IoTHubClientBuilder, IoTHubClientBuilderError,
    IoTHubClientBuilderInitializedHubDetails, IoTHubClientBuilderInitializedTokenSource,
    IoTHubClientBuilderUninitializedHubDetails,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{ConnectionState, ConnectionStatusReason};
pub use error::IoTHubError;
pub use message::{DirectMethodResponse, DispositionResult, Message, MessageBuilder};
pub use registry::{ConfirmationResult, OperationId, OperationKind};
pub use retry::{RetryConfig, RetryPolicy, RetryPolicyKind};
pub use token::{
    parse_connection_string, ConnectionDescriptor, Credential, DeviceKeyTokenSource,
    SasTokenSource, TokenError, TokenSource,
};
pub use transport::{
    DeliveryTag, MethodId, Subscription, Transport, TransportEvent, TransportEvents,
    TwinUpdateState,
};
pub use upload::{
    BlobEvent, BlobEvents, BlobTransport, BlockBuffer, FileUploadResult, GetDataResult,
    UploadFinish, UploadSessionId,
};

/// Result of a synchronous client call
pub type Result<T> = std::result::Result<T, IoTHubError>;
