//! OCPP 1.6-J protocol layer
//!
//! - `messages`: RPC envelope framing (CALL / CALLRESULT / CALLERROR)
//! - `types`: typed payloads for the supported action set

pub mod messages;
pub mod types;

pub use messages::{Action, Call, CallError, CallResult, CodecError, ErrorCode, Frame, Malformed, MessageType};
pub use types::*;
