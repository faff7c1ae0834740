//! JSON codec for Rakewire frames.
//!
//! Inbound client text is validated once here: anything that does not decode
//! into a [`ClientFrame`] becomes a [`ProtocolError`] and never reaches the
//! routing layer.

use serde_json::Value;
use thiserror::Error;

use crate::frames::{ClientFrame, FrameType, ServerFrame};

/// Default maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame is not a JSON object with a string `type`.
    #[error("Frame has no type")]
    MissingType,

    /// Frame type is not one the receiver accepts.
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    /// Frame is not valid JSON or its fields do not match its type.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Text sent back to the client inside an error frame.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLarge { .. } => "Message too large",
            ProtocolError::UnknownType(_) => "Unknown message type",
            ProtocolError::MissingType | ProtocolError::Malformed(_) => "Invalid message format",
        }
    }
}

/// Decode a client frame using the default size limit.
///
/// # Errors
///
/// Returns an error if the text is too large, not JSON, carries an unknown
/// type, or its fields do not match the type.
pub fn decode_client(text: &str) -> Result<ClientFrame, ProtocolError> {
    decode_client_with_limit(text, MAX_FRAME_SIZE)
}

/// Decode a client frame, rejecting text longer than `max_size` bytes.
///
/// # Errors
///
/// See [`decode_client`].
pub fn decode_client_with_limit(text: &str, max_size: usize) -> Result<ClientFrame, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    let value: Value = serde_json::from_str(text)?;
    let type_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    match type_name.parse::<FrameType>() {
        Ok(frame_type) if frame_type.is_client_type() => {}
        _ => return Err(ProtocolError::UnknownType(type_name.to_string())),
    }

    Ok(serde_json::from_value(value)?)
}

/// Encode a server frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_server(frame: &ServerFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Encode a client frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_client(frame: &ClientFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a server frame.
///
/// # Errors
///
/// Returns an error if the text is not a known server frame.
pub fn decode_server(text: &str) -> Result<ServerFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let type_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    if type_name.parse::<FrameType>().is_err() {
        return Err(ProtocolError::UnknownType(type_name.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_subscribe() {
        let frame = decode_client(r#"{"type":"subscribe","channel":"tracking"}"#).unwrap();
        assert_eq!(frame, ClientFrame::subscribe("tracking"));
    }

    #[test]
    fn test_decode_unknown_type() {
        match decode_client(r#"{"type":"init","dashboard":"admin"}"#) {
            Err(e @ ProtocolError::UnknownType(_)) => {
                assert_eq!(e.client_message(), "Unknown message type");
            }
            other => panic!("Expected UnknownType error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_server_only_type_from_client() {
        assert!(matches!(
            decode_client(r#"{"type":"subscribed","channel":"x"}"#),
            Err(ProtocolError::UnknownType(_))
        ));
    }

    #[test]
    fn test_decode_malformed() {
        let err = decode_client("{not json").unwrap_err();
        assert_eq!(err.client_message(), "Invalid message format");

        let err = decode_client(r#"{"channel":"tracking"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));

        // Right type, wrong field shape.
        let err = decode_client(r#"{"type":"subscribe","channels":"tracking"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_frame_too_large() {
        let text = format!(r#"{{"type":"message","channel":"a","data":"{}"}}"#, "x".repeat(64));
        match decode_client_with_limit(&text, 32) {
            Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                assert_eq!(e.client_message(), "Message too large");
            }
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_update_matches_wire_shape() {
        let frame = ServerFrame::update("tracking", json!({"rakeId": 1, "lat": 19.07, "lng": 72.87}));
        let text = encode_server(&frame).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type":"update","channel":"tracking","data":{"rakeId":1,"lat":19.07,"lng":72.87}})
        );
        assert_eq!(decode_server(&text).unwrap(), frame);
    }
}
