//! Per-station charging state
//!
//! Tracks the registration lifecycle, connector statuses and transaction
//! records for one charge point. All mutation goes through this module so the
//! action handlers stay free of cross-action coupling. The state outlives any
//! single connection: a station may drop and reconnect mid-transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::directory::StationRecord;
use crate::ocpp::types::{BootNotificationRequest, ChargePointStatus, MeterValue, StopReason};

/// Process-wide transaction ID source: atomic, monotonic, never reused.
#[derive(Clone)]
pub struct TxIdAllocator {
    next: Arc<AtomicI32>,
}

impl TxIdAllocator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicI32::new(1)),
        }
    }

    pub fn next(&self) -> i32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for TxIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Stopped,
    Completed,
    Failed,
    Canceled,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Active)
    }
}

/// One charging session bounded by Start/Stop events. Terminal records are
/// never mutated again.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub id: i32,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i32,
    pub meter_stop: Option<i32>,
    pub meter_last: i32,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub reason: Option<StopReason>,
    pub status: TransactionStatus,
}

/// One physical outlet on the station.
#[derive(Debug, Clone)]
pub struct ConnectorState {
    pub id: u32,
    pub connector_type: String,
    pub status: ChargePointStatus,
    pub max_current_a: f64,
    pub max_voltage_v: f64,
    pub last_energy_wh: Option<f64>,
}

/// Outcome of an accepted StartTransaction call.
#[derive(Debug)]
pub enum StartDecision {
    Accepted { transaction_id: i32 },
    Rejected { reason: &'static str },
}

/// Outcome of a StopTransaction call. Stops are idempotent: an
/// already-terminal or unknown transaction is answered from the existing
/// record without mutating it.
#[derive(Debug)]
pub enum StopOutcome {
    Stopped(TransactionRecord),
    AlreadyTerminal(TransactionRecord),
    Unknown,
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("connector {0} does not exist on this station")]
    UnknownConnector(u32),

    #[error("illegal status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ChargePointStatus,
        to: ChargePointStatus,
    },
}

/// Charging state for one station.
#[derive(Debug)]
pub struct StationState {
    station_id: String,
    registered: bool,
    online: bool,
    status: ChargePointStatus,
    vendor: Option<String>,
    model: Option<String>,
    firmware_version: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    connectors: HashMap<u32, ConnectorState>,
    transactions: HashMap<i32, TransactionRecord>,
}

impl StationState {
    /// Build the pre-registration state from a provisioning record.
    /// Connectors start Unavailable until the boot handshake completes.
    pub fn new(record: &StationRecord) -> Self {
        let connectors = (1..=record.connector_count)
            .map(|id| {
                (
                    id,
                    ConnectorState {
                        id,
                        connector_type: record.connector_type.clone(),
                        status: ChargePointStatus::Unavailable,
                        max_current_a: record.max_current_a,
                        max_voltage_v: record.max_voltage_v,
                        last_energy_wh: None,
                    },
                )
            })
            .collect();

        Self {
            station_id: record.station_id.clone(),
            registered: false,
            online: false,
            status: ChargePointStatus::Unavailable,
            vendor: None,
            model: None,
            firmware_version: None,
            last_heartbeat: None,
            connectors,
            transactions: HashMap::new(),
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn status(&self) -> ChargePointStatus {
        self.status
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    pub fn connector_status(&self, connector_id: u32) -> Option<ChargePointStatus> {
        self.connectors.get(&connector_id).map(|c| c.status)
    }

    pub fn transaction(&self, transaction_id: i32) -> Option<&TransactionRecord> {
        self.transactions.get(&transaction_id)
    }

    pub fn active_transactions(&self) -> usize {
        self.transactions
            .values()
            .filter(|t| t.status == TransactionStatus::Active)
            .count()
    }

    /// Whether `from -> to` is a defined edge of the connector status graph.
    /// Staying in place is always allowed.
    pub fn permits(from: ChargePointStatus, to: ChargePointStatus) -> bool {
        use ChargePointStatus::*;

        if from == to {
            return true;
        }
        // A fault can be reported from any state.
        if to == Faulted {
            return true;
        }
        match from {
            Available => matches!(to, Preparing | Charging | Reserved | Unavailable),
            Preparing => matches!(to, Available | Charging),
            Charging => matches!(to, SuspendedEV | SuspendedEVSE | Finishing),
            SuspendedEV => matches!(to, Charging | SuspendedEVSE | Finishing),
            SuspendedEVSE => matches!(to, Charging | SuspendedEV | Finishing),
            Finishing => matches!(to, Available | Preparing),
            Reserved => matches!(to, Available | Preparing | Unavailable),
            Unavailable => matches!(to, Available),
            Faulted => matches!(to, Available | Unavailable),
        }
    }

    /// Registration handshake accepted: record metadata and bring the station
    /// and its connectors into service.
    pub fn register_boot(&mut self, req: &BootNotificationRequest) {
        self.registered = true;
        self.online = true;
        self.vendor = Some(req.charge_point_vendor.clone());
        self.model = Some(req.charge_point_model.clone());
        self.firmware_version = req.firmware_version.clone();

        if Self::permits(self.status, ChargePointStatus::Available) {
            self.status = ChargePointStatus::Available;
        }
        for connector in self.connectors.values_mut() {
            if connector.status == ChargePointStatus::Unavailable {
                connector.status = ChargePointStatus::Available;
            }
        }
        info!(
            station = %self.station_id,
            vendor = %req.charge_point_vendor,
            model = %req.charge_point_model,
            "station registered"
        );
    }

    pub fn touch_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(now);
    }

    pub fn set_online(&mut self) {
        self.online = true;
    }

    /// Connection lost. Connectivity only: charging and transaction state are
    /// left alone, the station may reconnect mid-transaction.
    pub fn set_offline(&mut self) {
        self.online = false;
        debug!(station = %self.station_id, "station marked offline");
    }

    /// Apply a status notification. `connector_id` 0 addresses the station
    /// itself. Illegal transitions are rejected without changing state.
    pub fn apply_status(
        &mut self,
        connector_id: u32,
        status: ChargePointStatus,
    ) -> Result<(), StatusError> {
        if connector_id == 0 {
            if !Self::permits(self.status, status) {
                return Err(StatusError::InvalidTransition {
                    from: self.status,
                    to: status,
                });
            }
            self.status = status;
            return Ok(());
        }

        let connector = self
            .connectors
            .get_mut(&connector_id)
            .ok_or(StatusError::UnknownConnector(connector_id))?;
        if !Self::permits(connector.status, status) {
            return Err(StatusError::InvalidTransition {
                from: connector.status,
                to: status,
            });
        }
        debug!(
            station = %self.station_id,
            connector = connector_id,
            from = ?connector.status,
            to = ?status,
            "connector status changed"
        );
        connector.status = status;
        Ok(())
    }

    /// Try to open a transaction on `connector_id`.
    ///
    /// Accepted only when the connector is Available or Preparing; anything
    /// else yields a Rejected decision so the call can still be answered with
    /// a well-formed result. The transaction ID is allocated only on accept.
    pub fn begin_transaction(
        &mut self,
        connector_id: u32,
        id_tag: &str,
        meter_start: i32,
        timestamp: DateTime<Utc>,
        ids: &TxIdAllocator,
    ) -> StartDecision {
        if !self.registered {
            return StartDecision::Rejected {
                reason: "station has not completed the boot handshake",
            };
        }
        let connector = match self.connectors.get_mut(&connector_id) {
            Some(c) => c,
            None => {
                return StartDecision::Rejected {
                    reason: "unknown connector",
                }
            }
        };
        if !matches!(
            connector.status,
            ChargePointStatus::Available | ChargePointStatus::Preparing
        ) {
            return StartDecision::Rejected {
                reason: "connector is not ready for a new transaction",
            };
        }

        let transaction_id = ids.next();
        connector.status = ChargePointStatus::Charging;
        if Self::permits(self.status, ChargePointStatus::Charging) {
            self.status = ChargePointStatus::Charging;
        }
        self.transactions.insert(
            transaction_id,
            TransactionRecord {
                id: transaction_id,
                connector_id,
                id_tag: id_tag.to_string(),
                meter_start,
                meter_stop: None,
                meter_last: meter_start,
                started_at: timestamp,
                stopped_at: None,
                reason: None,
                status: TransactionStatus::Active,
            },
        );
        info!(
            station = %self.station_id,
            connector = connector_id,
            transaction = transaction_id,
            id_tag = %id_tag,
            "transaction started"
        );
        StartDecision::Accepted { transaction_id }
    }

    /// Close a transaction. Idempotent: a second stop for the same ID returns
    /// the existing terminal record untouched, an unknown ID is benign.
    pub fn finish_transaction(
        &mut self,
        transaction_id: i32,
        meter_stop: i32,
        timestamp: DateTime<Utc>,
        reason: Option<StopReason>,
    ) -> StopOutcome {
        let tx = match self.transactions.get_mut(&transaction_id) {
            Some(tx) => tx,
            None => {
                warn!(
                    station = %self.station_id,
                    transaction = transaction_id,
                    "stop for unknown transaction"
                );
                return StopOutcome::Unknown;
            }
        };
        if tx.status.is_terminal() {
            debug!(
                station = %self.station_id,
                transaction = transaction_id,
                "stop for already-terminal transaction"
            );
            return StopOutcome::AlreadyTerminal(tx.clone());
        }

        tx.meter_stop = Some(meter_stop);
        tx.stopped_at = Some(timestamp);
        tx.reason = reason;
        if meter_stop < tx.meter_start {
            // Energy counters never run backwards; a regressing stop reading
            // closes the record as Failed.
            warn!(
                station = %self.station_id,
                transaction = transaction_id,
                meter_start = tx.meter_start,
                meter_stop,
                "meter regressed on stop"
            );
            tx.status = TransactionStatus::Failed;
        } else {
            tx.status = TransactionStatus::Stopped;
        }
        let record = tx.clone();

        // Wind the connector down through Finishing, never skipping states.
        if let Some(connector) = self.connectors.get_mut(&record.connector_id) {
            if Self::permits(connector.status, ChargePointStatus::Finishing) {
                connector.status = ChargePointStatus::Finishing;
            }
            if Self::permits(connector.status, ChargePointStatus::Available) {
                connector.status = ChargePointStatus::Available;
            }
        }
        if self.active_transactions() == 0 {
            if Self::permits(self.status, ChargePointStatus::Finishing) {
                self.status = ChargePointStatus::Finishing;
            }
            if Self::permits(self.status, ChargePointStatus::Available) {
                self.status = ChargePointStatus::Available;
            }
        }
        info!(
            station = %self.station_id,
            transaction = transaction_id,
            energy_wh = record.meter_stop.unwrap_or(record.meter_start) - record.meter_start,
            "transaction stopped"
        );
        StopOutcome::Stopped(record)
    }

    /// Record a MeterValues batch for a connector (and the transaction it
    /// references, when given). Readings are monotonically non-decreasing;
    /// regressing samples are reported and ignored.
    pub fn record_meter_values(
        &mut self,
        connector_id: u32,
        transaction_id: Option<i32>,
        meter_value: &[MeterValue],
    ) -> Result<(), StatusError> {
        let connector = self
            .connectors
            .get_mut(&connector_id)
            .ok_or(StatusError::UnknownConnector(connector_id))?;

        let latest = meter_value
            .iter()
            .flat_map(|mv| mv.sampled_value.iter())
            .filter_map(|sv| sv.value.parse::<f64>().ok())
            .last();

        if let Some(value) = latest {
            match connector.last_energy_wh {
                Some(previous) if value < previous => {
                    warn!(
                        station = %self.station_id,
                        connector = connector_id,
                        previous,
                        value,
                        "regressing meter sample ignored"
                    );
                }
                _ => connector.last_energy_wh = Some(value),
            }
            if let Some(tx_id) = transaction_id {
                if let Some(tx) = self.transactions.get_mut(&tx_id) {
                    if tx.status == TransactionStatus::Active {
                        let reading = value as i32;
                        if reading >= tx.meter_last {
                            tx.meter_last = reading;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::types::SampledValue;
    use std::collections::HashSet;

    fn boot_request() -> BootNotificationRequest {
        BootNotificationRequest {
            charge_point_model: "EVSE-123".into(),
            charge_point_vendor: "EV-Charger Inc.".into(),
            charge_point_serial_number: None,
            charge_box_serial_number: None,
            firmware_version: Some("1.0.0".into()),
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        }
    }

    fn station() -> StationState {
        let mut state = StationState::new(&StationRecord::new("cp-1", 2));
        state.register_boot(&boot_request());
        state
    }

    #[test]
    fn boot_brings_station_into_service() {
        let record = StationRecord::new("cp-1", 2);
        let mut state = StationState::new(&record);
        assert!(!state.is_registered());
        assert_eq!(state.status(), ChargePointStatus::Unavailable);

        state.register_boot(&boot_request());
        assert!(state.is_registered());
        assert_eq!(state.status(), ChargePointStatus::Available);
        assert_eq!(state.connector_status(1), Some(ChargePointStatus::Available));
        assert_eq!(state.connector_status(2), Some(ChargePointStatus::Available));
    }

    #[test]
    fn start_transaction_accepted_on_available_connector() {
        let mut state = station();
        let ids = TxIdAllocator::new();

        match state.begin_transaction(1, "T1", 100, Utc::now(), &ids) {
            StartDecision::Accepted { transaction_id } => {
                assert_eq!(state.connector_status(1), Some(ChargePointStatus::Charging));
                let tx = state.transaction(transaction_id).unwrap();
                assert_eq!(tx.meter_start, 100);
                assert_eq!(tx.status, TransactionStatus::Active);
            }
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[test]
    fn start_transaction_rejected_on_charging_connector() {
        let mut state = station();
        let ids = TxIdAllocator::new();
        let first = match state.begin_transaction(1, "T1", 0, Utc::now(), &ids) {
            StartDecision::Accepted { transaction_id } => transaction_id,
            other => panic!("expected Accepted, got {other:?}"),
        };

        // Second start on the same connector must not disturb the live one.
        match state.begin_transaction(1, "T2", 0, Utc::now(), &ids) {
            StartDecision::Rejected { .. } => {}
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(state.transaction(first).unwrap().status, TransactionStatus::Active);
        assert_eq!(state.active_transactions(), 1);
    }

    #[test]
    fn start_transaction_rejected_before_boot() {
        let mut state = StationState::new(&StationRecord::new("cp-1", 1));
        let ids = TxIdAllocator::new();
        assert!(matches!(
            state.begin_transaction(1, "T1", 0, Utc::now(), &ids),
            StartDecision::Rejected { .. }
        ));
    }

    #[test]
    fn stop_transaction_is_idempotent() {
        let mut state = station();
        let ids = TxIdAllocator::new();
        let tx_id = match state.begin_transaction(1, "T1", 100, Utc::now(), &ids) {
            StartDecision::Accepted { transaction_id } => transaction_id,
            other => panic!("expected Accepted, got {other:?}"),
        };

        let first = match state.finish_transaction(tx_id, 500, Utc::now(), Some(StopReason::Local)) {
            StopOutcome::Stopped(record) => record,
            other => panic!("expected Stopped, got {other:?}"),
        };
        assert_eq!(first.meter_stop, Some(500));
        assert_eq!(first.status, TransactionStatus::Stopped);
        assert_eq!(state.connector_status(1), Some(ChargePointStatus::Available));

        // Second stop with different readings returns the untouched record.
        let second = match state.finish_transaction(tx_id, 9999, Utc::now(), None) {
            StopOutcome::AlreadyTerminal(record) => record,
            other => panic!("expected AlreadyTerminal, got {other:?}"),
        };
        assert_eq!(second.meter_stop, Some(500));
        assert_eq!(second.stopped_at, first.stopped_at);
    }

    #[test]
    fn stop_for_unknown_transaction_is_benign() {
        let mut state = station();
        assert!(matches!(
            state.finish_transaction(404, 0, Utc::now(), None),
            StopOutcome::Unknown
        ));
    }

    #[test]
    fn regressing_stop_reading_fails_the_transaction() {
        let mut state = station();
        let ids = TxIdAllocator::new();
        let tx_id = match state.begin_transaction(1, "T1", 1000, Utc::now(), &ids) {
            StartDecision::Accepted { transaction_id } => transaction_id,
            other => panic!("expected Accepted, got {other:?}"),
        };
        match state.finish_transaction(tx_id, 10, Utc::now(), None) {
            StopOutcome::Stopped(record) => assert_eq!(record.status, TransactionStatus::Failed),
            other => panic!("expected Stopped, got {other:?}"),
        }
    }

    #[test]
    fn transaction_ids_are_unique_across_threads() {
        let ids = TxIdAllocator::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ids = ids.clone();
            handles.push(std::thread::spawn(move || {
                (0..50).map(|_| ids.next()).collect::<Vec<i32>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "transaction id {id} issued twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn illegal_status_transition_is_rejected() {
        let mut state = station();
        // Available -> Finishing is not a defined edge.
        let err = state
            .apply_status(1, ChargePointStatus::Finishing)
            .unwrap_err();
        assert!(matches!(err, StatusError::InvalidTransition { .. }));
        assert_eq!(state.connector_status(1), Some(ChargePointStatus::Available));

        // Any state may fault.
        state.apply_status(1, ChargePointStatus::Faulted).unwrap();
        assert_eq!(state.connector_status(1), Some(ChargePointStatus::Faulted));

        // Unknown connectors are reported.
        assert!(matches!(
            state.apply_status(9, ChargePointStatus::Available),
            Err(StatusError::UnknownConnector(9))
        ));
    }

    #[test]
    fn disconnect_leaves_charging_state_alone() {
        let mut state = station();
        let ids = TxIdAllocator::new();
        let tx_id = match state.begin_transaction(1, "T1", 0, Utc::now(), &ids) {
            StartDecision::Accepted { transaction_id } => transaction_id,
            other => panic!("expected Accepted, got {other:?}"),
        };

        state.set_offline();
        assert!(!state.is_online());
        assert_eq!(state.connector_status(1), Some(ChargePointStatus::Charging));
        assert_eq!(state.transaction(tx_id).unwrap().status, TransactionStatus::Active);
    }

    #[test]
    fn regressing_meter_sample_is_ignored() {
        let mut state = station();
        let sample = |v: &str| MeterValue {
            timestamp: Utc::now(),
            sampled_value: vec![SampledValue {
                value: v.into(),
                context: None,
                format: None,
                measurand: Some("Energy.Active.Import.Register".into()),
                phase: None,
                location: None,
                unit: Some("Wh".into()),
            }],
        };

        state.record_meter_values(1, None, &[sample("1500")]).unwrap();
        state.record_meter_values(1, None, &[sample("900")]).unwrap();
        state.record_meter_values(1, None, &[sample("1600")]).unwrap();
        // The regressing 900 must not have replaced 1500.
        let connector = state.connectors.get(&1).unwrap();
        assert_eq!(connector.last_energy_wh, Some(1600.0));
    }
}
