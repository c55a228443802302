//! Digital Twin Model Identifier
//!
//! Devices announce the model they implement with the `model_id` option. The id is validated
//! before it is handed to the transport so a typo surfaces as an `InvalidArgument` on
//! `set_option` rather than as a rejected connection later.
//!
//! See https://github.com/Azure/digital-twin-model-identifier

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const MAX_VERSION_DIGITS: usize = 9;

/// A validated model identifier of the form `dtmi:<path>;<version>`
///
/// `<path>` is a colon separated list of segments. Each segment starts with a letter, contains
/// only letters, digits and underscores, and does not end with an underscore. The version is
/// one to nine digits without a leading zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dtmi(String);

/// Returned when a given string cannot be validated as a DTMI.
#[derive(Debug, Error)]
#[error("'{0}' is not a valid DTMI")]
pub struct DtmiValidationError(String);

impl Dtmi {
    /// The identifier as it is sent on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Dtmi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Dtmi {
    type Err = DtmiValidationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if is_valid(input) {
            Ok(Dtmi(input.to_string()))
        } else {
            Err(DtmiValidationError(input.to_string()))
        }
    }
}

fn is_valid(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("dtmi:") else {
        return false;
    };
    let Some((path, version)) = rest.split_once(';') else {
        return false;
    };

    path.split(':').all(is_valid_segment) && is_valid_version(version)
}

fn is_valid_segment(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphabetic()
                && *last != b'_'
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || *b == b'_')
        }
        _ => false,
    }
}

fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= MAX_VERSION_DIGITS
        && !version.starts_with('0')
        && version.bytes().all(|b| b.is_ascii_digit())
}
