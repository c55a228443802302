use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message used in body of communication
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Message {
    /// Contents of body of the message
    pub body: Vec<u8>,
    pub(crate) properties: HashMap<String, String>,
    pub(crate) system_properties: HashMap<String, String>,
}

impl Message {
    /// Create with contents of body as message bytes
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Get a builder instance for building up a message
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Application properties set on the message
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// System properties keyed by their wire id, e.g. `$.mid`
    pub fn system_properties(&self) -> &HashMap<String, String> {
        &self.system_properties
    }

    /// The message identifier, if one was set
    pub fn message_id(&self) -> Option<&str> {
        self.system_properties.get(MESSAGE_ID).map(String::as_str)
    }

    /// The correlation identifier, if one was set
    pub fn correlation_id(&self) -> Option<&str> {
        self.system_properties
            .get(CORRELATION_ID)
            .map(String::as_str)
    }
}

const MESSAGE_ID: &str = "$.mid";
const CORRELATION_ID: &str = "$.cid";
const CONTENT_TYPE: &str = "$.ct";
const CONTENT_ENCODING: &str = "$.ce";

/// Builder for constructing Message instances
#[derive(Debug, Default)]
pub struct MessageBuilder {
    message: Option<Vec<u8>>,
    properties: HashMap<String, String>,
    system_properties: HashMap<String, String>,
}

impl MessageBuilder {
    /// Set the message body
    pub fn set_body(mut self, body: Vec<u8>) -> Self {
        self.message = Some(body);
        self
    }

    /// Set the identifier for this message
    pub fn set_message_id(self, message_id: String) -> Self {
        self.set_system_property(MESSAGE_ID, message_id)
    }

    /// Set the correlation identifier, used to tie a message to a request it answers
    pub fn set_correlation_id(self, correlation_id: String) -> Self {
        self.set_system_property(CORRELATION_ID, correlation_id)
    }

    /// Set the content-type for this message, such as `text/plain`.
    /// To allow routing query on the message body, this value should be set to `application/json`
    pub fn set_content_type(self, content_type: String) -> Self {
        self.set_system_property(CONTENT_TYPE, content_type)
    }

    /// Set the content-encoding for this message.
    /// If the content-type is set to `application/json`, allowed values are `UTF-8`, `UTF-16`, `UTF-32`.
    pub fn set_content_encoding(self, content_encoding: String) -> Self {
        self.set_system_property(CONTENT_ENCODING, content_encoding)
    }

    fn set_system_property(mut self, property_name: &str, value: String) -> Self {
        self.system_properties
            .insert(property_name.to_owned(), value);
        self
    }

    /// Add a message property
    pub fn add_message_property(mut self, key: String, value: String) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Build into a message instance
    pub fn build(self) -> Message {
        Message {
            body: self.message.unwrap_or_default(),
            properties: self.properties,
            system_properties: self.system_properties,
        }
    }
}

/// Answer returned by a synchronous device method callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMethodResponse {
    pub(crate) status: i32,
    pub(crate) body: Vec<u8>,
}

impl DirectMethodResponse {
    /// Make a new direct method response
    pub fn new(status: i32, body: Option<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.unwrap_or_default(),
        }
    }

    /// Status code sent back to the caller of the method
    pub fn status(&self) -> i32 {
        self.status
    }
}

/// How the device settled a cloud to device message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispositionResult {
    /// Message processed, remove it from the device queue
    Accepted,
    /// Message can never be processed, dead-letter it
    Rejected,
    /// Message not processed now, make it available again
    Abandoned,
}
