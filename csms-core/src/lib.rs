//! # csms-core
//!
//! OCPP 1.6 central system (CSMS): session management, call correlation and
//! charging state tracking over long-lived WebSocket connections, plus the
//! bridge that lets a control plane address a connected station by ID.
//!
//! ## Architecture
//!
//! ```text
//! Charge Points                         Control plane
//!       │ WebSocket JSON-RPC                  │ deliver(stationId, ...)
//!       ▼                                     ▼
//! ┌───────────────────────────────┐   ┌───────────────┐
//! │  CsmsServer                   │   │ CommandBridge │
//! │  ┌─────────┐   ┌───────────┐  │◄──┤ id → session  │
//! │  │ Session │──►│  Router   │  │   └───────────────┘
//! │  │ + codec │   │ + station │  │
//! │  │ + corr. │   │   state   │  │
//! │  └─────────┘   └───────────┘  │
//! └───────────────┬───────────────┘
//!                 │ lookups / audit entries
//!                 ▼
//!   StationDirectory · AuditLog (external collaborators)
//! ```
//!
//! One session per connection; frames are processed in arrival order while
//! responses correlate by unique ID, so station-initiated calls and answers
//! to CSMS-initiated commands interleave freely on the same socket.

pub mod bridge;
pub mod config;
pub mod correlation;
pub mod directory;
pub mod ocpp;
pub mod router;
pub mod server;
pub mod session;
pub mod station;

pub use bridge::{CommandBridge, DeliveryError, SessionCommand, SessionHandle};
pub use config::CsmsConfig;
pub use correlation::{CallOutcome, CorrelationEngine};
pub use directory::{
    AuditLog, Direction, InMemoryDirectory, MessageLogEntry, StationDirectory, StationRecord,
};
pub use ocpp::{Action, Call, CallError, CallResult, ErrorCode, Frame};
pub use router::{Dispatch, HandlerContext, Router};
pub use server::{CsmsServer, ServerError, OCPP_SUBPROTOCOL};
pub use session::Session;
pub use station::{StationState, TransactionRecord, TransactionStatus, TxIdAllocator};
