//! Collaborator seams: station directory and message audit
//!
//! Both sit at the edge of the core. The directory answers whether a claimed
//! station identity is provisioned; the audit sink receives a copy of every
//! frame for out-of-band storage. Neither is allowed to slow the message path
//! down: directory lookups happen once per connection, audit writes go
//! through a bounded channel with `try_send`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::warn;

/// Provisioning data for one station.
#[derive(Debug, Clone)]
pub struct StationRecord {
    pub station_id: String,
    pub connector_count: u32,
    pub connector_type: String,
    pub max_current_a: f64,
    pub max_voltage_v: f64,
}

impl StationRecord {
    pub fn new(station_id: impl Into<String>, connector_count: u32) -> Self {
        Self {
            station_id: station_id.into(),
            connector_count,
            connector_type: "Type2".to_string(),
            max_current_a: 32.0,
            max_voltage_v: 400.0,
        }
    }
}

/// Lookup-by-ID station directory.
///
/// Returns a future so database-backed implementations stay async; the
/// in-memory implementation below answers immediately.
pub trait StationDirectory: Send + Sync {
    fn lookup<'a>(&'a self, station_id: &'a str) -> BoxFuture<'a, Option<StationRecord>>;
}

/// Directory of pre-provisioned stations, used by the node CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    stations: HashMap<String, StationRecord>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provision(&mut self, record: StationRecord) {
        self.stations.insert(record.station_id.clone(), record);
    }

    pub fn with_station(mut self, record: StationRecord) -> Self {
        self.provision(record);
        self
    }
}

impl StationDirectory for InMemoryDirectory {
    fn lookup<'a>(&'a self, station_id: &'a str) -> BoxFuture<'a, Option<StationRecord>> {
        let found = self.stations.get(station_id).cloned();
        async move { found }.boxed()
    }
}

/// Which way a frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One audited frame, both directions (the original system stored requests
/// and the responses sent back).
#[derive(Debug, Clone)]
pub struct MessageLogEntry {
    pub station_id: String,
    pub direction: Direction,
    pub action: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

/// Clonable handle feeding the external audit sink.
///
/// `record` never blocks: when the sink cannot keep up the entry is dropped
/// and counted, the session keeps going.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<MessageLogEntry>,
}

impl AuditLog {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<MessageLogEntry>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    pub fn record(&self, entry: MessageLogEntry) {
        if self.tx.try_send(entry).is_err() {
            warn!("audit sink is not keeping up, dropping a message log entry");
        }
    }

    pub fn record_frame(&self, station_id: &str, direction: Direction, action: &str, payload: &str) {
        self.record(MessageLogEntry {
            station_id: station_id.to_string(),
            direction,
            action: action.to_string(),
            payload: payload.to_string(),
            timestamp: Utc::now(),
        });
    }
}
