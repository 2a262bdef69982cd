//! Wire protocol message types.
//!
//! One message shape for every exchange: a flat envelope of
//! `{operator, message: {event, params}}`, serialized once as JSON and
//! framed as: [4-byte BE length][JSON payload]. Every request expects
//! exactly one response with the same operator and event `pong` (or
//! `error`, which the orchestrator maps to a typed failure).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuntimeError;

/// Response event acknowledging a request.
pub const EVENT_PONG: &str = "pong";
/// Response event carrying a failure message as its sole param.
pub const EVENT_ERROR: &str = "error";
/// Handshake request event (operator `Start`).
pub const EVENT_HANDSHAKE: &str = "handshake";
/// Plugin invocation request event (operator `Write`).
pub const EVENT_START: &str = "start";
/// Shutdown request event (operator `Write`); answered by exit, not a reply.
pub const EVENT_DESTROY: &str = "destroy";

/// The category of a protocol exchange.
///
/// Identifies the kind of exchange, not a specific call — handshake and
/// plugin-start share transport discipline under different operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator {
    /// Handshake exchanges.
    Start,
    /// Plugin invocation and shutdown.
    Write,
    /// Result reference resolution.
    Read,
    /// Reserved; a recognized no-op on the worker side.
    Compile,
}

/// Event plus ordered params. Request params are arbitrary
/// JSON-serializable values; response params are always strings (ids or
/// JSON-encoded values), never nested objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub event: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// One protocol frame: the operator and its message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub operator: Operator,
    pub message: Message,
}

impl Frame {
    /// Build a request frame.
    pub fn request(operator: Operator, event: &str, params: Vec<Value>) -> Self {
        Self {
            operator,
            message: Message {
                event: event.to_string(),
                params,
            },
        }
    }

    /// Build a `pong` response for the given operator.
    pub fn pong(operator: Operator, params: Vec<Value>) -> Self {
        Self::request(operator, EVENT_PONG, params)
    }

    /// Build an `error` response carrying a failure message.
    pub fn error(operator: Operator, message: &str) -> Self {
        Self::request(operator, EVENT_ERROR, vec![Value::String(message.to_string())])
    }

    /// Serialize the frame to its wire payload.
    pub fn encode(&self) -> Result<Vec<u8>, RuntimeError> {
        serde_json::to_vec(self).map_err(|e| RuntimeError::codec(&e))
    }

    /// Parse a frame from its wire payload.
    ///
    /// An unrecognized operator (or any other malformed envelope) is a
    /// protocol error, never silently dropped.
    pub fn decode(payload: &[u8]) -> Result<Self, RuntimeError> {
        serde_json::from_slice(payload).map_err(|e| RuntimeError::codec(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_all_operators() {
        for op in [
            Operator::Start,
            Operator::Write,
            Operator::Read,
            Operator::Compile,
        ] {
            let frame = Frame::request(op, "start", vec![json!({"name": "collect"}), json!(1)]);
            let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn operator_wire_names_are_uppercase() {
        let frame = Frame::pong(Operator::Write, vec![]);
        let json = String::from_utf8(frame.encode().unwrap()).unwrap();
        assert!(json.contains("\"operator\":\"WRITE\""));
        assert!(json.contains("\"event\":\"pong\""));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let payload = br#"{"operator":"FROB","message":{"event":"pong","params":[]}}"#;
        let err = Frame::decode(payload).unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(_)));
    }

    #[test]
    fn missing_params_defaults_to_empty() {
        let payload = br#"{"operator":"READ","message":{"event":"pong"}}"#;
        let frame = Frame::decode(payload).unwrap();
        assert!(frame.message.params.is_empty());
    }

    #[test]
    fn error_frame_carries_message() {
        let frame = Frame::error(Operator::Write, "plugin blew up");
        assert_eq!(frame.message.event, EVENT_ERROR);
        assert_eq!(frame.message.params, vec![json!("plugin blew up")]);
    }
}
