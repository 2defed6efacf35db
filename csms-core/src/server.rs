//! WebSocket server for charge point connections
//!
//! Accepts connections, performs the upgrade (capturing the station identity
//! from the request path, `/ws/evcharger/<id>`), checks the claimed identity
//! against the station directory and spawns a session per accepted
//! connection. Station state is kept across reconnects: a charge point that
//! drops mid-transaction finds its transactions where it left them.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tracing::{info, warn};

use crate::bridge::CommandBridge;
use crate::config::CsmsConfig;
use crate::directory::{AuditLog, StationDirectory};
use crate::session::Session;
use crate::station::{StationState, TxIdAllocator};

/// OCPP 1.6 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The central system server.
pub struct CsmsServer {
    config: Arc<CsmsConfig>,
    directory: Arc<dyn StationDirectory>,
    bridge: Arc<CommandBridge>,
    audit: AuditLog,
    tx_ids: TxIdAllocator,
    // Station state outlives sessions so reconnects resume mid-transaction.
    stations: Arc<parking_lot::RwLock<HashMap<String, Arc<RwLock<StationState>>>>>,
}

impl CsmsServer {
    pub fn new(config: CsmsConfig, directory: Arc<dyn StationDirectory>, audit: AuditLog) -> Self {
        Self {
            config: Arc::new(config),
            directory,
            bridge: Arc::new(CommandBridge::new()),
            audit,
            tx_ids: TxIdAllocator::new(),
            stations: Arc::new(parking_lot::RwLock::new(HashMap::new())),
        }
    }

    /// The bridge through which the control plane addresses live sessions.
    pub fn bridge(&self) -> Arc<CommandBridge> {
        self.bridge.clone()
    }

    /// Charging state for a station, when it has connected at least once.
    pub fn station(&self, station_id: &str) -> Option<Arc<RwLock<StationState>>> {
        self.stations.read().get(station_id).cloned()
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!("CSMS listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let config = self.config.clone();
            let directory = self.directory.clone();
            let bridge = self.bridge.clone();
            let audit = self.audit.clone();
            let tx_ids = self.tx_ids.clone();
            let stations = self.stations.clone();

            tokio::spawn(async move {
                handle_connection(stream, peer, config, directory, bridge, audit, tx_ids, stations)
                    .await;
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    config: Arc<CsmsConfig>,
    directory: Arc<dyn StationDirectory>,
    bridge: Arc<CommandBridge>,
    audit: AuditLog,
    tx_ids: TxIdAllocator,
    stations: Arc<parking_lot::RwLock<HashMap<String, Arc<RwLock<StationState>>>>>,
) {
    let mut path = String::new();
    let callback = |req: &Request, mut resp: Response| {
        path = req.uri().path().to_string();
        let offered = req
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if let Some(protocols) = offered {
            if protocols.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL) {
                resp.headers_mut().insert(
                    header::SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(OCPP_SUBPROTOCOL),
                );
            }
        }
        Ok(resp)
    };

    let mut ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake with {peer} failed: {e}");
            return;
        }
    };

    let station_id = match station_id_from_path(&path) {
        Some(id) => id,
        None => {
            warn!("connection from {peer} carried no station identity in path {path:?}");
            let _ = ws.close(None).await;
            return;
        }
    };

    let record = match directory.lookup(&station_id).await {
        Some(record) => record,
        None => {
            warn!(station = %station_id, "station is not provisioned, rejecting connection");
            let _ = ws.close(None).await;
            return;
        }
    };

    info!(station = %station_id, %peer, "charge point connected");

    let station = {
        let mut map = stations.write();
        map.entry(station_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(StationState::new(&record))))
            .clone()
    };

    let (session, handle) = Session::new(
        station_id.clone(),
        config,
        station,
        tx_ids,
        bridge.clone(),
        audit,
    );
    bridge.register(&station_id, handle);
    session.run(ws).await;
}

/// The station identity is the last non-empty path segment.
fn station_id_from_path(path: &str) -> Option<String> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(String::from)
}
