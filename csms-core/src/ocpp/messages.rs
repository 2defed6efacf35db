//! OCPP 1.6-J message framing
//!
//! OCPP-J carries RPC frames as JSON arrays over the WebSocket:
//! - CALL:       [2, uniqueId, action, payload]
//! - CALLRESULT: [3, uniqueId, payload]
//! - CALLERROR:  [4, uniqueId, errorCode, errorDescription, errorDetails]
//!
//! Decoding never fails past this boundary: anything that does not parse as
//! one of the three envelopes folds into [`Frame::Malformed`], so the session
//! can answer with a protocol-level error instead of tearing the connection
//! down.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP 1.6 RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    // 1.6 spells this without the double 'r'
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotImplemented" => Ok(ErrorCode::NotImplemented),
            "NotSupported" => Ok(ErrorCode::NotSupported),
            "InternalError" => Ok(ErrorCode::InternalError),
            "ProtocolError" => Ok(ErrorCode::ProtocolError),
            "SecurityError" => Ok(ErrorCode::SecurityError),
            "FormationViolation" => Ok(ErrorCode::FormationViolation),
            "PropertyConstraintViolation" => Ok(ErrorCode::PropertyConstraintViolation),
            "OccurenceConstraintViolation" => Ok(ErrorCode::OccurenceConstraintViolation),
            "TypeConstraintViolation" => Ok(ErrorCode::TypeConstraintViolation),
            "GenericError" => Ok(ErrorCode::GenericError),
            _ => Err(CodecError::UnknownErrorCode(s.to_string())),
        }
    }
}

/// OCPP 1.6 action names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    // CP -> CSMS
    BootNotification,
    Authorize,
    StartTransaction,
    StopTransaction,
    MeterValues,
    StatusNotification,
    Heartbeat,

    // CSMS -> CP
    RemoteStartTransaction,
    RemoteStopTransaction,
}

impl Action {
    /// The actions a charge point may open a CALL with.
    pub const STATION_INITIATED: [Action; 7] = [
        Action::BootNotification,
        Action::Authorize,
        Action::StartTransaction,
        Action::StopTransaction,
        Action::MeterValues,
        Action::StatusNotification,
        Action::Heartbeat,
    ];
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Authorize" => Ok(Action::Authorize),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StopTransaction" => Ok(Action::StopTransaction),
            "MeterValues" => Ok(Action::MeterValues),
            "StatusNotification" => Ok(Action::StatusNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            _ => Err(CodecError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in OCPP frame encoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown error code: {0}")]
    UnknownErrorCode(String),
}

/// CALL frame (request)
///
/// The action is kept as a string: an unrecognized action is not a decode
/// failure, it must still be answered with a NotSupported CALLERROR.
#[derive(Debug, Clone)]
pub struct Call {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Serialize to the wire format: [2, uniqueId, action, payload]
    pub fn to_wire(&self) -> Result<String, CodecError> {
        let array = json!([
            MessageType::Call as i64,
            &self.unique_id,
            &self.action,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// CALLRESULT frame (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub unique_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Serialize to the wire format: [3, uniqueId, payload]
    pub fn to_wire(&self) -> Result<String, CodecError> {
        let array = json!([MessageType::CallResult as i64, &self.unique_id, &self.payload]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// CALLERROR frame (failure response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub unique_id: String,
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl CallError {
    pub fn new(unique_id: impl Into<String>, code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to the wire format: [4, uniqueId, errorCode, errorDescription, errorDetails]
    pub fn to_wire(&self) -> Result<String, CodecError> {
        let array = json!([
            MessageType::CallError as i64,
            &self.unique_id,
            self.code.to_string(),
            &self.description,
            &self.details
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// A frame that did not parse as any of the three envelopes.
///
/// The unique ID is recovered when the envelope got far enough to carry one,
/// so the answering CALLERROR can still be correlated by the peer.
#[derive(Debug, Clone)]
pub struct Malformed {
    pub unique_id: Option<String>,
    pub reason: String,
}

/// Decoded OCPP frame
#[derive(Debug, Clone)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
    Malformed(Malformed),
}

impl Frame {
    /// Decode a frame from wire text. Never fails: malformed input yields
    /// [`Frame::Malformed`].
    pub fn decode(text: &str) -> Frame {
        let array: Vec<Value> = match serde_json::from_str(text) {
            Ok(a) => a,
            Err(e) => return Frame::malformed(None, format!("not a JSON array: {e}")),
        };

        let recovered_id = array.get(1).and_then(Value::as_str).map(String::from);

        let msg_type = match array.first().and_then(Value::as_i64) {
            Some(t) => t,
            None => return Frame::malformed(recovered_id, "missing numeric messageTypeId".into()),
        };

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Frame::malformed(recovered_id, format!("CALL must have 4 elements, got {}", array.len()));
                }
                let unique_id = match array[1].as_str() {
                    Some(id) => id.to_string(),
                    None => return Frame::malformed(None, "CALL uniqueId must be a string".into()),
                };
                let action = match array[2].as_str() {
                    Some(a) => a.to_string(),
                    None => return Frame::malformed(Some(unique_id), "CALL action must be a string".into()),
                };
                Frame::Call(Call {
                    unique_id,
                    action,
                    payload: array[3].clone(),
                })
            }
            3 => {
                if array.len() != 3 {
                    return Frame::malformed(recovered_id, format!("CALLRESULT must have 3 elements, got {}", array.len()));
                }
                let unique_id = match array[1].as_str() {
                    Some(id) => id.to_string(),
                    None => return Frame::malformed(None, "CALLRESULT uniqueId must be a string".into()),
                };
                Frame::CallResult(CallResult {
                    unique_id,
                    payload: array[2].clone(),
                })
            }
            4 => {
                if array.len() != 5 {
                    return Frame::malformed(recovered_id, format!("CALLERROR must have 5 elements, got {}", array.len()));
                }
                let unique_id = match array[1].as_str() {
                    Some(id) => id.to_string(),
                    None => return Frame::malformed(None, "CALLERROR uniqueId must be a string".into()),
                };
                let code = array[2]
                    .as_str()
                    .unwrap_or("GenericError")
                    .parse()
                    .unwrap_or(ErrorCode::GenericError);
                let description = array[3].as_str().unwrap_or("").to_string();
                Frame::CallError(CallError {
                    unique_id,
                    code,
                    description,
                    details: array[4].clone(),
                })
            }
            other => Frame::malformed(recovered_id, format!("unknown messageTypeId {other}")),
        }
    }

    fn malformed(unique_id: Option<String>, reason: String) -> Frame {
        Frame::Malformed(Malformed { unique_id, reason })
    }

    /// The unique ID, when the frame carries one.
    pub fn unique_id(&self) -> Option<&str> {
        match self {
            Frame::Call(c) => Some(&c.unique_id),
            Frame::CallResult(r) => Some(&r.unique_id),
            Frame::CallError(e) => Some(&e.unique_id),
            Frame::Malformed(m) => m.unique_id.as_deref(),
        }
    }
}
