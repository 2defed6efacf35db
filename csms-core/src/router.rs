//! Inbound action dispatch
//!
//! Maps action names to handler functions through a table built once at
//! startup and checked for completeness against the station-initiated action
//! set. Handlers receive the validated payload and mutate charging state only
//! through the station state machine handle in [`HandlerContext`].
//!
//! Every CALL gets an answer: unknown actions come back `NotSupported`,
//! payloads missing required fields `FormationViolation` (without the handler
//! body running), handler faults `InternalError`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::ocpp::messages::{Action, ErrorCode};
use crate::ocpp::types::*;
use crate::station::{StartDecision, StationState, StopOutcome, TxIdAllocator};

/// What a handler needs to answer a call.
#[derive(Clone)]
pub struct HandlerContext {
    pub station_id: String,
    pub station: Arc<RwLock<StationState>>,
    pub tx_ids: TxIdAllocator,
    /// Heartbeat cadence answered in BootNotification.conf, seconds.
    pub heartbeat_interval_secs: u32,
}

/// Dispatch outcome, ready to be framed as CALLRESULT or CALLERROR.
#[derive(Debug)]
pub enum Dispatch {
    Result(Value),
    Error {
        code: ErrorCode,
        description: String,
        details: Value,
    },
}

impl Dispatch {
    fn error(code: ErrorCode, description: impl Into<String>) -> Self {
        Dispatch::Error {
            code,
            description: description.into(),
            details: json!({}),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload failed validation: {0}")]
    Formation(String),

    #[error("handler fault: {0}")]
    Internal(String),
}

type HandlerFn = for<'a> fn(&'a HandlerContext, Value) -> BoxFuture<'a, Result<Value, HandlerError>>;

/// Static action-to-handler table.
pub struct Router {
    handlers: HashMap<Action, HandlerFn>,
}

impl Router {
    /// Build the table. Panics at startup if any station-initiated action is
    /// left without a handler.
    pub fn new() -> Self {
        let mut handlers: HashMap<Action, HandlerFn> = HashMap::new();
        handlers.insert(Action::BootNotification, handle_boot_notification);
        handlers.insert(Action::Authorize, handle_authorize);
        handlers.insert(Action::StartTransaction, handle_start_transaction);
        handlers.insert(Action::StopTransaction, handle_stop_transaction);
        handlers.insert(Action::MeterValues, handle_meter_values);
        handlers.insert(Action::StatusNotification, handle_status_notification);
        handlers.insert(Action::Heartbeat, handle_heartbeat);

        let router = Self { handlers };
        for action in Action::STATION_INITIATED {
            assert!(
                router.handlers.contains_key(&action),
                "no handler registered for {action}"
            );
        }
        router
    }

    /// Answer one inbound CALL.
    pub async fn dispatch(&self, action: &str, payload: Value, ctx: &HandlerContext) -> Dispatch {
        let parsed = match action.parse::<Action>() {
            Ok(a) => a,
            Err(_) => {
                warn!(station = %ctx.station_id, %action, "unrecognized action");
                return Dispatch::error(
                    ErrorCode::NotSupported,
                    format!("action {action} is not supported"),
                );
            }
        };
        let handler = match self.handlers.get(&parsed) {
            Some(h) => h,
            None => {
                // A CSMS-initiated action arriving as a station call.
                warn!(station = %ctx.station_id, %action, "action not valid from a station");
                return Dispatch::error(
                    ErrorCode::NotSupported,
                    format!("action {action} is not accepted from a charge point"),
                );
            }
        };

        match handler(ctx, payload).await {
            Ok(result) => Dispatch::Result(result),
            Err(HandlerError::Formation(msg)) => {
                warn!(station = %ctx.station_id, %action, "payload rejected: {msg}");
                Dispatch::error(ErrorCode::FormationViolation, msg)
            }
            Err(HandlerError::Internal(msg)) => {
                warn!(station = %ctx.station_id, %action, "handler fault: {msg}");
                Dispatch::error(ErrorCode::InternalError, msg)
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload).map_err(|e| HandlerError::Formation(e.to_string()))
}

fn to_result<T: Serialize>(response: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(response).map_err(|e| HandlerError::Internal(e.to_string()))
}

fn handle_boot_notification<'a>(
    ctx: &'a HandlerContext,
    payload: Value,
) -> BoxFuture<'a, Result<Value, HandlerError>> {
    async move {
        let req: BootNotificationRequest = parse_payload(payload)?;
        {
            let mut station = ctx.station.write().await;
            station.register_boot(&req);
        }
        to_result(&BootNotificationResponse {
            current_time: Utc::now(),
            interval: ctx.heartbeat_interval_secs as i32,
            status: RegistrationStatus::Accepted,
        })
    }
    .boxed()
}

fn handle_authorize<'a>(
    ctx: &'a HandlerContext,
    payload: Value,
) -> BoxFuture<'a, Result<Value, HandlerError>> {
    async move {
        let req: AuthorizeRequest = parse_payload(payload)?;
        // Operator-side tag vetting lives outside this core; every provisioned
        // station's tags are accepted.
        info!(station = %ctx.station_id, id_tag = %req.id_tag, "authorize");
        to_result(&AuthorizeResponse {
            id_tag_info: IdTagInfo::accepted(),
        })
    }
    .boxed()
}

fn handle_start_transaction<'a>(
    ctx: &'a HandlerContext,
    payload: Value,
) -> BoxFuture<'a, Result<Value, HandlerError>> {
    async move {
        let req: StartTransactionRequest = parse_payload(payload)?;
        let decision = {
            let mut station = ctx.station.write().await;
            station.begin_transaction(
                req.connector_id,
                &req.id_tag,
                req.meter_start,
                req.timestamp,
                &ctx.tx_ids,
            )
        };
        let response = match decision {
            StartDecision::Accepted { transaction_id } => StartTransactionResponse {
                id_tag_info: IdTagInfo::accepted(),
                transaction_id,
            },
            StartDecision::Rejected { reason } => {
                warn!(
                    station = %ctx.station_id,
                    connector = req.connector_id,
                    "start transaction rejected: {reason}"
                );
                StartTransactionResponse {
                    id_tag_info: IdTagInfo::rejected(),
                    transaction_id: 0,
                }
            }
        };
        to_result(&response)
    }
    .boxed()
}

fn handle_stop_transaction<'a>(
    ctx: &'a HandlerContext,
    payload: Value,
) -> BoxFuture<'a, Result<Value, HandlerError>> {
    async move {
        let req: StopTransactionRequest = parse_payload(payload)?;
        let outcome = {
            let mut station = ctx.station.write().await;
            station.finish_transaction(req.transaction_id, req.meter_stop, req.timestamp, req.reason)
        };
        if matches!(outcome, StopOutcome::AlreadyTerminal(_) | StopOutcome::Unknown) {
            info!(
                station = %ctx.station_id,
                transaction = req.transaction_id,
                "stale stop answered from existing record"
            );
        }
        // Idempotent success either way; the call itself never fails for a
        // stale transaction.
        to_result(&StopTransactionResponse {
            id_tag_info: Some(IdTagInfo::accepted()),
        })
    }
    .boxed()
}

fn handle_meter_values<'a>(
    ctx: &'a HandlerContext,
    payload: Value,
) -> BoxFuture<'a, Result<Value, HandlerError>> {
    async move {
        let req: MeterValuesRequest = parse_payload(payload)?;
        {
            let mut station = ctx.station.write().await;
            if let Err(e) =
                station.record_meter_values(req.connector_id, req.transaction_id, &req.meter_value)
            {
                warn!(station = %ctx.station_id, "meter values not recorded: {e}");
            }
        }
        to_result(&MeterValuesResponse {})
    }
    .boxed()
}

fn handle_status_notification<'a>(
    ctx: &'a HandlerContext,
    payload: Value,
) -> BoxFuture<'a, Result<Value, HandlerError>> {
    async move {
        let req: StatusNotificationRequest = parse_payload(payload)?;
        {
            let mut station = ctx.station.write().await;
            if let Err(e) = station.apply_status(req.connector_id, req.status) {
                // The notification is still acknowledged; the state simply
                // does not move.
                warn!(station = %ctx.station_id, "status notification ignored: {e}");
            }
        }
        to_result(&StatusNotificationResponse {})
    }
    .boxed()
}

fn handle_heartbeat<'a>(
    ctx: &'a HandlerContext,
    payload: Value,
) -> BoxFuture<'a, Result<Value, HandlerError>> {
    async move {
        let _: HeartbeatRequest = parse_payload(payload)?;
        let now = Utc::now();
        {
            let mut station = ctx.station.write().await;
            station.touch_heartbeat(now);
        }
        to_result(&HeartbeatResponse { current_time: now })
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StationRecord;

    fn context() -> HandlerContext {
        let station = StationState::new(&StationRecord::new("cp-1", 2));
        HandlerContext {
            station_id: "cp-1".into(),
            station: Arc::new(RwLock::new(station)),
            tx_ids: TxIdAllocator::new(),
            heartbeat_interval_secs: 60,
        }
    }

    #[tokio::test]
    async fn boot_notification_is_accepted_and_registers() {
        let ctx = context();
        let router = Router::new();

        let payload = json!({"chargePointModel": "EVSE-123", "chargePointVendor": "EV-Charger Inc."});
        match router.dispatch("BootNotification", payload, &ctx).await {
            Dispatch::Result(v) => {
                assert_eq!(v["status"], "Accepted");
                assert_eq!(v["interval"], 60);
                assert!(v["currentTime"].is_string());
            }
            other => panic!("expected Result, got {other:?}"),
        }
        assert!(ctx.station.read().await.is_registered());
    }

    #[tokio::test]
    async fn unknown_action_is_not_supported() {
        let ctx = context();
        let router = Router::new();

        match router.dispatch("FlashFirmware", json!({}), &ctx).await {
            Dispatch::Error { code, .. } => assert_eq!(code, ErrorCode::NotSupported),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn csms_action_from_station_is_not_supported() {
        let ctx = context();
        let router = Router::new();

        match router.dispatch("RemoteStartTransaction", json!({"idTag": "T1"}), &ctx).await {
            Dispatch::Error { code, .. } => assert_eq!(code, ErrorCode::NotSupported),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_required_field_is_formation_violation() {
        let ctx = context();
        let router = Router::new();

        // chargePointVendor missing
        let payload = json!({"chargePointModel": "EVSE-123"});
        match router.dispatch("BootNotification", payload, &ctx).await {
            Dispatch::Error { code, .. } => assert_eq!(code, ErrorCode::FormationViolation),
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(!ctx.station.read().await.is_registered());
    }

    #[tokio::test]
    async fn start_on_busy_connector_is_answered_rejected() {
        let ctx = context();
        let router = Router::new();

        let boot = json!({"chargePointModel": "EVSE-123", "chargePointVendor": "EV-Charger Inc."});
        router.dispatch("BootNotification", boot, &ctx).await;

        let start = json!({
            "connectorId": 1,
            "idTag": "T1",
            "meterStart": 0,
            "timestamp": "2026-01-20T12:00:00Z"
        });
        let first = router.dispatch("StartTransaction", start.clone(), &ctx).await;
        let first_tx = match first {
            Dispatch::Result(v) => {
                assert_eq!(v["idTagInfo"]["status"], "Accepted");
                v["transactionId"].as_i64().unwrap()
            }
            other => panic!("expected Result, got {other:?}"),
        };
        assert!(first_tx >= 1);

        match router.dispatch("StartTransaction", start, &ctx).await {
            Dispatch::Result(v) => {
                assert_eq!(v["idTagInfo"]["status"], "Invalid");
                assert_eq!(v["transactionId"], 0);
            }
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_answers_current_time() {
        let ctx = context();
        let router = Router::new();

        match router.dispatch("Heartbeat", json!({}), &ctx).await {
            Dispatch::Result(v) => assert!(v["currentTime"].is_string()),
            other => panic!("expected Result, got {other:?}"),
        }
        assert!(ctx.station.read().await.last_heartbeat().is_some());
    }
}
