use serde_json::Value;
use thiserror::Error;

use super::Envelope;

/// Version stamped on envelopes produced by this service.
pub const CURRENT_VERSION: &str = "1.0";

/// Versions this decoder understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["1", "1.0"];

/// Errors returned by [`decode`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Bytes are not a structurally valid envelope
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Well-formed envelope with a version this build does not know
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(String),
}

/// Serialize an envelope to its JSON wire form.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

/// Parse wire bytes into an envelope.
///
/// The version is checked before the remaining structure so that a newer
/// producer's envelope is reported as unsupported rather than malformed.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let mut value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| DecodeError::MalformedPayload("envelope must be a JSON object".into()))?;

    let version = match object.get("version") {
        Some(Value::String(v)) => v.clone(),
        // Some producers emit a bare number
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => {
            return Err(DecodeError::MalformedPayload(
                "version must be a string".into(),
            ))
        }
        None => return Err(DecodeError::MalformedPayload("missing version".into())),
    };

    if !SUPPORTED_VERSIONS.contains(&version.as_str()) {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    object.insert("version".to_string(), Value::String(version));

    serde_json::from_value(value).map_err(|e| DecodeError::MalformedPayload(e.to_string()))
}
