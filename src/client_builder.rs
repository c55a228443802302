use std::marker::PhantomData;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ClientParts;
use crate::clock::Clock;
use crate::registry::DEFAULT_MAX_PENDING_OPERATIONS;
use crate::retry::{RetryConfig, RetryPolicy, RetryPolicyKind};
use crate::token::{ConnectionDescriptor, Credential, TokenError};
use crate::transport::Transport;
use crate::upload::BlobTransport;
use crate::IoTHubClient;

impl<T: Transport> IoTHubClient<T> {
    /// Get a builder for a client driving `transport`
    pub fn builder(transport: T) -> IoTHubClientBuilder<T, IoTHubClientBuilderUninitializedHubDetails> {
        IoTHubClientBuilder {
            transport,
            iothub_hostname: None,
            device_id: None,
            descriptor: None,
            blob: None,
            clock: None,
            rng_seed: None,
            config: ClientConfig::default(),
            _phantom: PhantomData,
        }
    }
}

/// Client settings that can be loaded from a configuration file
///
/// ```
/// use iothub_device_client::ClientConfig;
///
/// let config: ClientConfig = serde_json::from_str(
///     r#"{ "retry_policy": { "kind": "interval", "timeout_limit_seconds": 120 } }"#,
/// )?;
/// assert_eq!(config.retry_policy.timeout_limit_seconds, 120);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Reconnect policy and ceiling on total retry time
    pub retry_policy: RetryPolicy,
    /// Tuning of the reconnect delays
    pub retry: RetryConfig,
    /// How many operations may be outstanding at once
    pub max_pending_operations: usize,
    /// Appended to the user agent the transport reports
    pub product_info: Option<String>,
    /// Digital twin model the device implements
    pub model_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            retry: RetryConfig::default(),
            max_pending_operations: DEFAULT_MAX_PENDING_OPERATIONS,
            product_info: None,
            model_id: None,
        }
    }
}

/// Error related to building the client
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IoTHubClientBuilderError {
    /// Uninitialized field
    #[error("{0} must be initialized")]
    UninitializedField(&'static str),
    /// Custom validation error
    #[error("{0} failed to validate")]
    ValidationError(&'static str),
    /// Error initializing the hub client
    #[error("An error occurred intializing the IoT Hub Client {0}")]
    ClientError(String),
}

impl From<TokenError> for IoTHubClientBuilderError {
    fn from(e: TokenError) -> Self {
        IoTHubClientBuilderError::ClientError(e.to_string())
    }
}

/// The client builder has no initialized fields and requires the hub name and device id
#[derive(Debug)]
pub struct IoTHubClientBuilderUninitializedHubDetails;
/// The client builder has hub and device details and can have the credential initialized
#[derive(Debug)]
pub struct IoTHubClientBuilderInitializedHubDetails;
/// The client builder has all fields required to be built
#[derive(Debug)]
pub struct IoTHubClientBuilderInitializedTokenSource;

/// Builder object for the IoT Hub Client
pub struct IoTHubClientBuilder<T, S> {
    transport: T,
    iothub_hostname: Option<String>,
    device_id: Option<String>,
    descriptor: Option<ConnectionDescriptor>,
    blob: Option<Box<dyn BlobTransport + Send>>,
    clock: Option<Box<dyn Clock + Send>>,
    rng_seed: Option<u64>,
    config: ClientConfig,
    _phantom: PhantomData<S>,
}

impl<T, S> std::fmt::Debug for IoTHubClientBuilder<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoTHubClientBuilder")
            .field("iothub_hostname", &self.iothub_hostname)
            .field("device_id", &self.device_id)
            .field("has_blob_transport", &self.blob.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl<T, S> IoTHubClientBuilder<T, S> {
    fn into_state<N>(self) -> IoTHubClientBuilder<T, N> {
        IoTHubClientBuilder {
            transport: self.transport,
            iothub_hostname: self.iothub_hostname,
            device_id: self.device_id,
            descriptor: self.descriptor,
            blob: self.blob,
            clock: self.clock,
            rng_seed: self.rng_seed,
            config: self.config,
            _phantom: PhantomData,
        }
    }

    /// Replace all client settings
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the reconnect policy and the ceiling on total retry time (zero retries forever)
    pub fn retry_policy(mut self, kind: RetryPolicyKind, timeout_limit_seconds: u64) -> Self {
        self.config.retry_policy = RetryPolicy::new(kind, timeout_limit_seconds);
        self
    }

    /// Transport used for blob uploads
    pub fn blob_transport<B>(mut self, blob: B) -> Self
    where
        B: BlobTransport + Send + 'static,
    {
        self.blob = Some(Box::new(blob));
        self
    }

    /// Time source, [`crate::SystemClock`] unless set
    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + Send + 'static,
    {
        self.clock = Some(Box::new(clock));
        self
    }

    /// Seed the jitter of the randomized retry policies, for reproducible schedules
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

impl<T: Transport> IoTHubClientBuilder<T, IoTHubClientBuilderInitializedTokenSource> {
    /// Build the IoT hub client
    pub fn build(self) -> Result<IoTHubClient<T>, IoTHubClientBuilderError> {
        let Some(descriptor) = self.descriptor else {
            return Err(IoTHubClientBuilderError::ValidationError(
                "One of `access_key`, `shared_access_signature` or `connection_string` must be provided",
            ));
        };

        let rng = match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut parts = ClientParts {
            blob: self.blob,
            rng,
            config: self.config,
            ..ClientParts::default()
        };
        if let Some(clock) = self.clock {
            parts.clock = clock;
        }

        IoTHubClient::with_parts(descriptor, self.transport, parts)
            .map_err(|e| IoTHubClientBuilderError::ClientError(format!("{e}")))
    }
}

impl<T> IoTHubClientBuilder<T, IoTHubClientBuilderUninitializedHubDetails> {
    /// Set the values for the IoT hub hostname and device id
    pub fn iothub_details<V>(
        self,
        iothub_hostname: V,
        device_id: V,
    ) -> IoTHubClientBuilder<T, IoTHubClientBuilderInitializedHubDetails>
    where
        V: ToString,
    {
        IoTHubClientBuilder {
            iothub_hostname: Some(iothub_hostname.to_string()),
            device_id: Some(device_id.to_string()),
            ..self.into_state()
        }
    }

    /// Set the hub, device and credential from a device connection string
    pub fn connection_string<V>(
        self,
        connection_string: V,
    ) -> Result<IoTHubClientBuilder<T, IoTHubClientBuilderInitializedTokenSource>, TokenError>
    where
        V: AsRef<str>,
    {
        let descriptor = ConnectionDescriptor::from_connection_string(connection_string.as_ref())?;
        Ok(self.descriptor(descriptor))
    }

    /// Use an already validated connection descriptor
    pub fn descriptor(
        self,
        descriptor: ConnectionDescriptor,
    ) -> IoTHubClientBuilder<T, IoTHubClientBuilderInitializedTokenSource> {
        IoTHubClientBuilder {
            iothub_hostname: Some(descriptor.hostname.clone()),
            device_id: Some(descriptor.device_id.clone()),
            descriptor: Some(descriptor),
            ..self.into_state()
        }
    }
}

impl<T> IoTHubClientBuilder<T, IoTHubClientBuilderInitializedHubDetails> {
    fn hub_details(&self) -> Result<(&str, &str), IoTHubClientBuilderError> {
        let hostname = self
            .iothub_hostname
            .as_deref()
            .ok_or(IoTHubClientBuilderError::UninitializedField("iothub_hostname"))?;
        let device_id = self
            .device_id
            .as_deref()
            .ok_or(IoTHubClientBuilderError::UninitializedField("device_id"))?;
        Ok((hostname, device_id))
    }

    /// The the device access key
    pub fn access_key<V>(
        self,
        access_key: V,
    ) -> Result<IoTHubClientBuilder<T, IoTHubClientBuilderInitializedTokenSource>, IoTHubClientBuilderError>
    where
        V: ToString,
    {
        let (hostname, device_id) = self.hub_details()?;
        let descriptor =
            ConnectionDescriptor::with_device_key(hostname, device_id, access_key.to_string())?;

        Ok(IoTHubClientBuilder {
            descriptor: Some(descriptor),
            ..self.into_state()
        })
    }

    /// A pre-computed shared access signature instead of a device key
    pub fn shared_access_signature<V>(
        self,
        sas: V,
    ) -> Result<IoTHubClientBuilder<T, IoTHubClientBuilderInitializedTokenSource>, IoTHubClientBuilderError>
    where
        V: ToString,
    {
        let (hostname, device_id) = self.hub_details()?;
        let descriptor = ConnectionDescriptor {
            hostname: hostname.to_string(),
            device_id: device_id.to_string(),
            module_id: None,
            gateway_hostname: None,
            credential: Credential::SharedAccessSignature(sas.to_string()),
        };

        Ok(IoTHubClientBuilder {
            descriptor: Some(descriptor),
            ..self.into_state()
        })
    }
}
