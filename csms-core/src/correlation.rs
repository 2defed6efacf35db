//! Outbound call correlation
//!
//! Every CALL the CSMS sends to a station is registered here under a fresh
//! unique ID; the session's receive loop resolves it when the matching
//! CALLRESULT/CALLERROR arrives. Correlation is by unique ID only, never by
//! arrival order. The engine is owned exclusively by its session and is never
//! shared across connections.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ocpp::messages::ErrorCode;

/// How an outstanding call ended.
#[derive(Debug)]
pub enum CallOutcome {
    /// CALLRESULT payload from the station
    Result(Value),
    /// CALLERROR from the station
    Error {
        code: ErrorCode,
        description: String,
        details: Value,
    },
    /// No response within the deadline
    Timeout,
    /// The session went away before a response arrived
    Cancelled,
}

/// An outbound call awaiting its response.
struct PendingCall {
    action: String,
    deadline: Instant,
    slot: oneshot::Sender<CallOutcome>,
}

/// Per-session table of outstanding calls.
pub struct CorrelationEngine {
    pending: HashMap<String, PendingCall>,
}

impl CorrelationEngine {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Register an outbound call and return its unique ID.
    ///
    /// IDs are v4 UUIDs; a collision with a currently-pending ID is re-rolled.
    pub fn register(
        &mut self,
        action: &str,
        timeout: Duration,
        slot: oneshot::Sender<CallOutcome>,
    ) -> String {
        let mut unique_id = Uuid::new_v4().to_string();
        while self.pending.contains_key(&unique_id) {
            unique_id = Uuid::new_v4().to_string();
        }
        self.pending.insert(
            unique_id.clone(),
            PendingCall {
                action: action.to_string(),
                deadline: Instant::now() + timeout,
                slot,
            },
        );
        unique_id
    }

    /// Complete the call registered under `unique_id`.
    ///
    /// An unknown or already-resolved ID is a protocol anomaly, reported and
    /// ignored. Returns whether a call was actually resolved.
    pub fn resolve(&mut self, unique_id: &str, outcome: CallOutcome) -> bool {
        match self.pending.remove(unique_id) {
            Some(call) => {
                debug!(action = %call.action, %unique_id, "resolved outstanding call");
                let _ = call.slot.send(outcome);
                true
            }
            None => {
                warn!(%unique_id, "response for unknown or already-resolved call");
                false
            }
        }
    }

    /// Sweep calls whose deadline has passed, completing them as `Timeout`.
    ///
    /// Run from the session's maintenance tick, so a bridge delivery that
    /// times out on the caller side leaves no dangling entry here.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for unique_id in &expired {
            if let Some(call) = self.pending.remove(unique_id) {
                warn!(action = %call.action, %unique_id, "outstanding call timed out");
                let _ = call.slot.send(CallOutcome::Timeout);
            }
        }
        expired.len()
    }

    /// Fail every outstanding call. Called on session teardown so no caller
    /// blocks forever.
    pub fn fail_all(&mut self) {
        for (unique_id, call) in self.pending.drain() {
            debug!(action = %call.action, %unique_id, "cancelling outstanding call");
            let _ = call.slot.send(CallOutcome::Cancelled);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_completes_the_slot() {
        let mut engine = CorrelationEngine::new();
        let (tx, mut rx) = oneshot::channel();
        let id = engine.register("RemoteStartTransaction", Duration::from_secs(30), tx);

        assert!(engine.resolve(&id, CallOutcome::Result(json!({"status": "Accepted"}))));
        match rx.try_recv().unwrap() {
            CallOutcome::Result(v) => assert_eq!(v["status"], "Accepted"),
            other => panic!("expected Result, got {other:?}"),
        }
        assert_eq!(engine.outstanding(), 0);
    }

    #[test]
    fn resolve_twice_is_a_no_op() {
        let mut engine = CorrelationEngine::new();
        let (tx, _rx) = oneshot::channel();
        let id = engine.register("RemoteStopTransaction", Duration::from_secs(30), tx);

        assert!(engine.resolve(&id, CallOutcome::Result(json!({}))));
        assert!(!engine.resolve(&id, CallOutcome::Result(json!({}))));
        assert!(!engine.resolve("never-issued", CallOutcome::Timeout));
    }

    #[test]
    fn correlation_is_by_id_not_order() {
        let mut engine = CorrelationEngine::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        let first = engine.register("RemoteStartTransaction", Duration::from_secs(30), tx1);
        let second = engine.register("RemoteStopTransaction", Duration::from_secs(30), tx2);
        assert_ne!(first, second);

        // Responses arrive in reverse order of issue.
        engine.resolve(&second, CallOutcome::Result(json!({"n": 2})));
        engine.resolve(&first, CallOutcome::Result(json!({"n": 1})));

        match rx1.try_recv().unwrap() {
            CallOutcome::Result(v) => assert_eq!(v["n"], 1),
            other => panic!("expected Result, got {other:?}"),
        }
        match rx2.try_recv().unwrap() {
            CallOutcome::Result(v) => assert_eq!(v["n"], 2),
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[test]
    fn expire_sweeps_past_deadline_calls() {
        let mut engine = CorrelationEngine::new();
        let (tx_short, mut rx_short) = oneshot::channel();
        let (tx_long, mut rx_long) = oneshot::channel();
        engine.register("RemoteStartTransaction", Duration::from_millis(0), tx_short);
        engine.register("RemoteStartTransaction", Duration::from_secs(60), tx_long);

        let swept = engine.expire(Instant::now() + Duration::from_millis(1));
        assert_eq!(swept, 1);
        assert_eq!(engine.outstanding(), 1);
        assert!(matches!(rx_short.try_recv().unwrap(), CallOutcome::Timeout));
        assert!(rx_long.try_recv().is_err());
    }

    #[test]
    fn teardown_fails_every_outstanding_call() {
        let mut engine = CorrelationEngine::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        engine.register("RemoteStartTransaction", Duration::from_secs(30), tx1);
        engine.register("RemoteStopTransaction", Duration::from_secs(30), tx2);

        engine.fail_all();
        assert_eq!(engine.outstanding(), 0);
        assert!(matches!(rx1.try_recv().unwrap(), CallOutcome::Cancelled));
        assert!(matches!(rx2.try_recv().unwrap(), CallOutcome::Cancelled));
    }
}
