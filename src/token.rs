use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

const DEVICEID_KEY: &str = "DeviceId";
const HOSTNAME_KEY: &str = "HostName";
const MODULEID_KEY: &str = "ModuleId";
const GATEWAYHOSTNAME_KEY: &str = "GatewayHostName";
const SHAREDACCESSKEY_KEY: &str = "SharedAccessKey";
const SHAREDACCESSSIGNATURE_KEY: &str = "SharedAccessSignature";

/// Errors parsing connection strings or signing tokens
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// A key the connection string must carry is absent
    #[error("connection string is missing required parameter {0}")]
    MissingParameter(&'static str),
    /// A `key=value` segment could not be split
    #[error("connection string segment '{0}' is malformed")]
    MalformedSegment(String),
    /// The device key is not valid base64
    #[error("device key is not valid base64")]
    InvalidKey,
}

/// How the device proves its identity to the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Symmetric device key, used to sign short-lived tokens
    DeviceKey(String),
    /// A pre-computed shared access signature
    SharedAccessSignature(String),
}

/// Validated description of which hub and device to talk to
///
/// The client never interprets the credential itself, it is handed to the transport provider
/// when the client is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Fully qualified hub host name
    pub hostname: String,
    /// Registered device identity
    pub device_id: String,
    /// Optional module identity on the device
    pub module_id: Option<String>,
    /// Optional edge gateway to connect through
    pub gateway_hostname: Option<String>,
    /// Credential for the device
    pub credential: Credential,
}

impl ConnectionDescriptor {
    /// Build a descriptor from a hub host name, device id and device key
    pub fn with_device_key(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self, TokenError> {
        let key = key.into();
        STANDARD
            .decode(&key)
            .map_err(|_| TokenError::InvalidKey)?;

        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            module_id: None,
            gateway_hostname: None,
            credential: Credential::DeviceKey(key),
        }
        .validated()
    }

    /// Parse a connection string of the form
    /// `HostName=<hub>;DeviceId=<device>;SharedAccessKey=<key>`
    pub fn from_connection_string(connection_string: &str) -> Result<Self, TokenError> {
        parse_connection_string(connection_string)
    }

    /// Token source for transports that authenticate with shared access signatures
    pub fn token_source(&self) -> Result<Box<dyn TokenSource + Send>, TokenError> {
        Ok(match &self.credential {
            Credential::DeviceKey(key) => Box::new(DeviceKeyTokenSource::new(
                &self.hostname,
                &self.device_id,
                key,
            )?),
            Credential::SharedAccessSignature(sas) => Box::new(SasTokenSource::new(sas.clone())),
        })
    }

    fn validated(self) -> Result<Self, TokenError> {
        if self.hostname.is_empty() {
            return Err(TokenError::MissingParameter(HOSTNAME_KEY));
        }
        if self.device_id.is_empty() {
            return Err(TokenError::MissingParameter(DEVICEID_KEY));
        }
        Ok(self)
    }
}

/// Parse a device connection string into a validated descriptor
pub fn parse_connection_string(connection_string: &str) -> Result<ConnectionDescriptor, TokenError> {
    let mut hostname = None;
    let mut device_id = None;
    let mut module_id = None;
    let mut gateway_hostname = None;
    let mut key = None;
    let mut sas = None;

    for segment in connection_string.split(';').filter(|s| !s.trim().is_empty()) {
        // Values may contain '=' (base64 padding, signatures) so only split once
        let (name, value) = segment
            .split_once('=')
            .ok_or_else(|| TokenError::MalformedSegment(segment.to_string()))?;
        match name.trim() {
            HOSTNAME_KEY => hostname = Some(value.to_string()),
            DEVICEID_KEY => device_id = Some(value.to_string()),
            MODULEID_KEY => module_id = Some(value.to_string()),
            GATEWAYHOSTNAME_KEY => gateway_hostname = Some(value.to_string()),
            SHAREDACCESSKEY_KEY => key = Some(value.to_string()),
            SHAREDACCESSSIGNATURE_KEY => sas = Some(value.to_string()),
            other => trace!("Ignoring connection string parameter {}", other),
        }
    }

    let hostname = hostname.ok_or(TokenError::MissingParameter(HOSTNAME_KEY))?;
    let device_id = device_id.ok_or(TokenError::MissingParameter(DEVICEID_KEY))?;
    let credential = match (key, sas) {
        (Some(key), _) => {
            STANDARD
                .decode(&key)
                .map_err(|_| TokenError::InvalidKey)?;
            Credential::DeviceKey(key)
        }
        (None, Some(sas)) => Credential::SharedAccessSignature(sas),
        (None, None) => return Err(TokenError::MissingParameter(SHAREDACCESSKEY_KEY)),
    };

    ConnectionDescriptor {
        hostname,
        device_id,
        module_id,
        gateway_hostname,
        credential,
    }
    .validated()
}

/// Produces the password a transport presents to the hub
pub trait TokenSource {
    /// Token valid until `expiry`
    fn get(&self, expiry: &DateTime<Utc>) -> String;
}

impl std::fmt::Debug for dyn TokenSource + Send {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSource")
    }
}

/// Hands out a fixed, externally issued signature
#[derive(Debug, Clone)]
pub struct SasTokenSource {
    sas: String,
}

impl SasTokenSource {
    ///
    pub fn new(sas: String) -> Self {
        SasTokenSource { sas }
    }
}

impl TokenSource for SasTokenSource {
    fn get(&self, _: &DateTime<Utc>) -> String {
        self.sas.clone()
    }
}

/// Signs tokens with the device's symmetric key
#[derive(Debug, Clone)]
pub struct DeviceKeyTokenSource {
    resource_uri: String,
    key: Vec<u8>,
}

impl DeviceKeyTokenSource {
    ///
    pub fn new(hub: &str, device_id: &str, key: &str) -> Result<Self, TokenError> {
        let key = STANDARD.decode(key).map_err(|_| TokenError::InvalidKey)?;
        Ok(DeviceKeyTokenSource {
            resource_uri: format!("{}/devices/{}", hub, device_id),
            key,
        })
    }
}

impl TokenSource for DeviceKeyTokenSource {
    fn get(&self, expiry: &DateTime<Utc>) -> String {
        let expiry_timestamp = expiry.timestamp();

        let resource_uri: String =
            form_urlencoded::byte_serialize(self.resource_uri.as_bytes()).collect();
        let to_sign = format!("{}\n{}", resource_uri, expiry_timestamp);

        let sas = format!(
            "SharedAccessSignature sr={}&{}&se={}",
            resource_uri,
            generate_token(&self.key, &to_sign),
            expiry_timestamp
        );

        trace!("Using device key token: {}", sas);

        sas
    }
}

pub(crate) fn generate_token(key: &[u8], message: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match Hmac::<Sha256>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key of any length is valid"),
    };
    mac.update(message.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    serde_urlencoded::to_string([("sig", signature)]).unwrap_or_default()
}
