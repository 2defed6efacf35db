//! Per-connection session
//!
//! One session per open charge point connection. The session owns its codec
//! use, its correlation engine and its handler context; nothing here is
//! shared with other sessions except the bridge registration and the
//! process-wide transaction ID source.
//!
//! The receive loop processes frames in arrival order: CALLs are dispatched
//! through the router and answered inline, CALLRESULT/CALLERROR resolve
//! outstanding calls by unique ID. Bridge deliveries register the caller's
//! completion slot and transmit without ever awaiting the station's answer
//! inside the loop. A one-second maintenance tick sweeps call timeouts and
//! enforces the keepalive window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::{CommandBridge, SessionCommand, SessionHandle};
use crate::config::CsmsConfig;
use crate::correlation::{CallOutcome, CorrelationEngine};
use crate::directory::{AuditLog, Direction};
use crate::ocpp::messages::{Call, CallError, CallResult, ErrorCode, Frame};
use crate::router::{Dispatch, HandlerContext, Router};
use crate::station::{StationState, TxIdAllocator};

/// One iteration's worth of input to the receive loop.
enum Event {
    Socket(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Command(Option<SessionCommand>),
    Tick,
}

pub struct Session {
    station_id: String,
    session_id: Uuid,
    config: Arc<CsmsConfig>,
    router: Router,
    correlation: CorrelationEngine,
    ctx: HandlerContext,
    bridge: Arc<CommandBridge>,
    audit: AuditLog,
    commands: mpsc::Receiver<SessionCommand>,
    last_seen: Instant,
    decode_failures: u32,
}

impl Session {
    /// Build a session and the handle under which the bridge will address it.
    pub fn new(
        station_id: String,
        config: Arc<CsmsConfig>,
        station: Arc<RwLock<StationState>>,
        tx_ids: TxIdAllocator,
        bridge: Arc<CommandBridge>,
        audit: AuditLog,
    ) -> (Self, SessionHandle) {
        let session_id = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_depth);
        let ctx = HandlerContext {
            station_id: station_id.clone(),
            station,
            tx_ids,
            heartbeat_interval_secs: config.heartbeat_interval.as_secs() as u32,
        };
        let session = Self {
            station_id,
            session_id,
            config,
            router: Router::new(),
            correlation: CorrelationEngine::new(),
            ctx,
            bridge,
            audit,
            commands: cmd_rx,
            last_seen: Instant::now(),
            decode_failures: 0,
        };
        let handle = SessionHandle::new(session_id, cmd_tx);
        (session, handle)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Run until the connection drops, the keepalive window closes, or a
    /// newer session supersedes this one.
    pub async fn run(mut self, ws: WebSocketStream<TcpStream>) {
        let (ws_tx, mut ws_rx) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(write_loop(ws_tx, out_rx));

        self.ctx.station.write().await.set_online();
        info!(station = %self.station_id, "session started");

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_ping = Instant::now();

        loop {
            // Resolve the select into an event first so the handlers below
            // are free to borrow the session.
            let event = tokio::select! {
                msg = ws_rx.next() => Event::Socket(msg),
                cmd = self.commands.recv() => Event::Command(cmd),
                _ = tick.tick() => Event::Tick,
            };

            match event {
                Event::Socket(Some(Ok(Message::Text(text)))) => {
                    self.last_seen = Instant::now();
                    if !self.handle_frame(&text, &out_tx).await {
                        break;
                    }
                }
                Event::Socket(Some(Ok(Message::Ping(_))))
                | Event::Socket(Some(Ok(Message::Pong(_)))) => {
                    self.last_seen = Instant::now();
                }
                Event::Socket(Some(Ok(Message::Close(_)))) => {
                    info!(station = %self.station_id, "connection closed by station");
                    break;
                }
                // OCPP-J is text-only; anything else is ignored.
                Event::Socket(Some(Ok(_))) => {}
                Event::Socket(Some(Err(e))) => {
                    warn!(station = %self.station_id, "websocket error: {e}");
                    break;
                }
                Event::Socket(None) => break,
                Event::Command(Some(SessionCommand::Deliver {
                    action,
                    payload,
                    timeout,
                    reply,
                })) => {
                    self.send_remote_call(&action, payload, timeout, reply, &out_tx)
                        .await;
                }
                Event::Command(Some(SessionCommand::Shutdown)) => {
                    info!(station = %self.station_id, "superseded by a newer connection");
                    break;
                }
                Event::Command(None) => break,
                Event::Tick => {
                    let now = Instant::now();
                    self.correlation.expire(now);
                    if now.duration_since(self.last_seen) > self.config.offline_after() {
                        warn!(station = %self.station_id, "keepalive window elapsed, closing session");
                        break;
                    }
                    if now.duration_since(last_ping) >= self.config.heartbeat_interval {
                        last_ping = now;
                        let _ = out_tx.send(Message::Ping(Vec::new())).await;
                    }
                }
            }
        }

        // Teardown: free the directory slot first so a reconnecting station
        // is not bounced off a dead registration. A superseded session is no
        // longer the registered one and must not mark the station offline
        // under its successor.
        let was_registered = self.bridge.deregister(&self.station_id, self.session_id);
        self.correlation.fail_all();
        if was_registered {
            self.ctx.station.write().await.set_offline();
        }
        writer.abort();
        info!(station = %self.station_id, "session ended");
    }

    /// Process one inbound frame. Returns false when the session must close.
    async fn handle_frame(&mut self, text: &str, out_tx: &mpsc::Sender<Message>) -> bool {
        debug!(station = %self.station_id, "recv: {text}");
        match Frame::decode(text) {
            Frame::Call(call) => {
                self.decode_failures = 0;
                self.audit
                    .record_frame(&self.station_id, Direction::Inbound, &call.action, text);

                let outcome = self
                    .router
                    .dispatch(&call.action, call.payload, &self.ctx)
                    .await;
                let reply = match outcome {
                    Dispatch::Result(payload) => CallResult {
                        unique_id: call.unique_id,
                        payload,
                    }
                    .to_wire(),
                    Dispatch::Error {
                        code,
                        description,
                        details,
                    } => CallError {
                        unique_id: call.unique_id,
                        code,
                        description,
                        details,
                    }
                    .to_wire(),
                };
                match reply {
                    Ok(wire) => {
                        self.audit.record_frame(
                            &self.station_id,
                            Direction::Outbound,
                            &call.action,
                            &wire,
                        );
                        if out_tx.send(Message::Text(wire)).await.is_err() {
                            return false;
                        }
                    }
                    Err(e) => {
                        error!(station = %self.station_id, "failed to encode reply: {e}")
                    }
                }
            }
            Frame::CallResult(result) => {
                self.decode_failures = 0;
                self.audit
                    .record_frame(&self.station_id, Direction::Inbound, "CallResult", text);
                self.correlation
                    .resolve(&result.unique_id, CallOutcome::Result(result.payload));
            }
            Frame::CallError(err) => {
                self.decode_failures = 0;
                self.audit
                    .record_frame(&self.station_id, Direction::Inbound, "CallError", text);
                self.correlation.resolve(
                    &err.unique_id,
                    CallOutcome::Error {
                        code: err.code,
                        description: err.description,
                        details: err.details,
                    },
                );
            }
            Frame::Malformed(m) => {
                self.decode_failures += 1;
                self.audit
                    .record_frame(&self.station_id, Direction::Inbound, "Malformed", text);
                warn!(
                    station = %self.station_id,
                    failures = self.decode_failures,
                    "malformed frame: {}",
                    m.reason
                );

                let unique_id = m.unique_id.unwrap_or_else(|| "-1".to_string());
                let answer = CallError {
                    unique_id,
                    code: ErrorCode::GenericError,
                    description: m.reason,
                    details: json!({}),
                };
                if let Ok(wire) = answer.to_wire() {
                    let _ = out_tx.send(Message::Text(wire)).await;
                }

                if self.decode_failures > self.config.decode_failure_tolerance {
                    warn!(station = %self.station_id, "malformed frame tolerance exceeded, closing");
                    return false;
                }
            }
        }
        true
    }

    /// Forward a bridge-delivered command as a new outbound CALL. The
    /// caller's completion slot goes straight into the correlation engine;
    /// the receive loop stays free to process the interleaved traffic.
    async fn send_remote_call(
        &mut self,
        action: &str,
        payload: Value,
        timeout: Duration,
        reply: oneshot::Sender<CallOutcome>,
        out_tx: &mpsc::Sender<Message>,
    ) {
        let timeout = timeout.min(self.config.request_timeout);
        let unique_id = self.correlation.register(action, timeout, reply);
        let call = Call {
            unique_id: unique_id.clone(),
            action: action.to_string(),
            payload,
        };
        match call.to_wire() {
            Ok(wire) => {
                debug!(station = %self.station_id, %action, %unique_id, "forwarding remote command");
                self.audit
                    .record_frame(&self.station_id, Direction::Outbound, action, &wire);
                if out_tx.send(Message::Text(wire)).await.is_err() {
                    self.correlation.resolve(&unique_id, CallOutcome::Cancelled);
                }
            }
            Err(e) => {
                error!(station = %self.station_id, "failed to encode remote command: {e}");
                self.correlation.resolve(&unique_id, CallOutcome::Cancelled);
            }
        }
    }
}

/// Drains the outbound queue into the socket. All frame producers (call
/// answers, remote commands, pings) funnel through here so writes never
/// interleave.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = out_rx.recv().await {
        if let Err(e) = ws_tx.send(msg).await {
            warn!("websocket send failed: {e}");
            break;
        }
    }
    let _ = ws_tx.close().await;
}
