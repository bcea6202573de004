//! # Relay Session
//!
//! One actor per client connection. It owns the client socket (through its
//! actix WebSocket context) and the upstream socket (a read half registered as
//! a second stream, plus a writer task fed by a channel).
//!
//! ## Lifecycle:
//! 1. **Connecting**: actor started, upstream connect in flight. Client
//!    messages are dropped with a warning.
//! 2. **UpstreamOpen**: upstream socket open, client told it is ready,
//!    client → upstream forwarding active.
//! 3. **AwaitingConfigAck**: upstream sent `session.created`; the one
//!    `session.update` has been sent.
//! 4. **Relaying**: upstream acknowledged with `session.updated`.
//! 5. **Closing**: either side went away or errored. Entered once; every
//!    later close path is a no-op.
//!
//! ## Forwarding rules:
//! - Client frames go upstream verbatim (text stays text, binary stays binary).
//! - Upstream frames go to the client verbatim. Text frames are classified on
//!   the way through, but the original string is what gets sent. Text that
//!   does not parse is logged and dropped.
//! - Within one direction order is preserved; the two directions are independent.

use crate::config::{AppConfig, SessionConfig};
use crate::error::RelayError;
use crate::relay::events::{RelayNotice, SessionUpdate, UpstreamEvent};
use crate::relay::upstream::{self, UpstreamSocket, UpstreamTarget};
use crate::state::SessionPermit;

use actix::prelude::*;
use actix_web_actors::ws;
use futures_util::StreamExt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::{Error as UpstreamError, Message as UpstreamMessage};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    UpstreamOpen,
    AwaitingConfigAck,
    Relaying,
    Closing,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Connecting => "connecting",
            SessionPhase::UpstreamOpen => "upstream_open",
            SessionPhase::AwaitingConfigAck => "awaiting_config_ack",
            SessionPhase::Relaying => "relaying",
            SessionPhase::Closing => "closing",
        }
    }

    /// Whether client messages may be forwarded upstream.
    pub fn accepts_client_messages(&self) -> bool {
        matches!(
            self,
            SessionPhase::UpstreamOpen | SessionPhase::AwaitingConfigAck | SessionPhase::Relaying
        )
    }
}

/// Fires the configuration injection at most once per session.
///
/// Only the upstream message handler touches it, and actix hands that handler
/// `&mut self`, so a plain flag is enough.
#[derive(Debug, Default)]
pub struct HandshakeGuard {
    fired: bool,
}

impl HandshakeGuard {
    /// Returns `true` the first time it is called and `false` afterwards.
    pub fn try_fire(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// Per-session counters, logged when the session stops.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub dropped_early: u64,
    pub parse_failures: u64,
}

/// Everything a session needs, snapshotted from config at construction.
#[derive(Debug, Clone)]
pub struct RelaySessionConfig {
    pub target: UpstreamTarget,
    pub session: SessionConfig,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl RelaySessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            target: UpstreamTarget::from_config(&config.upstream),
            session: config.session.clone(),
            heartbeat_interval: Duration::from_secs(config.performance.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.performance.client_timeout_secs),
        }
    }
}

/// Bridges one client socket to one upstream socket.
pub struct RelaySession {
    id: Uuid,
    api_key: String,
    config: RelaySessionConfig,
    phase: SessionPhase,
    handshake: HandshakeGuard,
    upstream_tx: Option<mpsc::UnboundedSender<UpstreamMessage>>,
    last_heartbeat: Instant,
    stats: SessionStats,
    permit: Option<SessionPermit>,
}

impl RelaySession {
    pub fn new(api_key: String, config: RelaySessionConfig, permit: SessionPermit) -> Self {
        Self {
            id: Uuid::new_v4(),
            api_key,
            config,
            phase: SessionPhase::Connecting,
            handshake: HandshakeGuard::default(),
            upstream_tx: None,
            last_heartbeat: Instant::now(),
            stats: SessionStats::default(),
            permit: Some(permit),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Send a client message upstream, or drop it if the upstream is not open.
    ///
    /// There is no buffering: messages that arrive before the upstream is
    /// ready are counted and discarded.
    fn forward_client_to_upstream(&mut self, message: UpstreamMessage) {
        if !self.phase.accepts_client_messages() {
            self.stats.dropped_early += 1;
            warn!(session_id = %self.id, phase = self.phase.as_str(), "Upstream not open, dropping client message");
            return;
        }

        match &self.upstream_tx {
            Some(tx) if tx.send(message).is_ok() => self.stats.client_to_upstream += 1,
            // Writer task is gone; the upstream stream will report the close
            _ => {
                self.stats.dropped_early += 1;
                warn!(session_id = %self.id, "Upstream writer closed, dropping client message");
            }
        }
    }

    /// Inspect one upstream text frame, react to it, and forward it untouched.
    /// Frames that are not valid JSON are logged and dropped.
    fn forward_upstream_to_client(&mut self, text: String, ctx: &mut ws::WebsocketContext<Self>) {
        let mut terminal = None;

        match UpstreamEvent::classify(&text) {
            Ok(UpstreamEvent::SessionCreated) => self.inject_session_config(),
            Ok(UpstreamEvent::SessionUpdated) => {
                if self.phase == SessionPhase::AwaitingConfigAck {
                    self.phase = SessionPhase::Relaying;
                    debug!(session_id = %self.id, "Upstream acknowledged session configuration");
                }
            }
            Ok(UpstreamEvent::Error { message, terminal: is_terminal }) => {
                warn!(session_id = %self.id, terminal = is_terminal, "Upstream error event: {}", message);
                if is_terminal {
                    terminal = Some(message);
                }
            }
            Ok(UpstreamEvent::Passthrough) => {}
            Err(err) => {
                self.stats.parse_failures += 1;
                warn!(session_id = %self.id, "Dropping malformed upstream message: {}", err);
                return;
            }
        }

        ctx.text(text);
        self.stats.upstream_to_client += 1;

        if let Some(message) = terminal {
            self.close_with_error(RelayError::UpstreamClosed(message), ctx);
        }
    }

    /// Send the one `session.update` after the first `session.created`.
    fn inject_session_config(&mut self) {
        if !self.handshake.try_fire() {
            warn!(session_id = %self.id, "Repeated session.created, configuration already sent");
            return;
        }

        let payload = match SessionUpdate::from_config(&self.config.session).to_json() {
            Ok(payload) => payload,
            Err(err) => {
                error!(session_id = %self.id, "Failed to serialize session.update: {}", err);
                return;
            }
        };

        match &self.upstream_tx {
            Some(tx) if tx.send(UpstreamMessage::Text(payload)).is_ok() => {
                self.phase = SessionPhase::AwaitingConfigAck;
                info!(session_id = %self.id, voice = %self.config.session.voice, "Sent session configuration upstream");
            }
            _ => warn!(session_id = %self.id, "Upstream writer closed before session configuration could be sent"),
        }
    }

    fn on_upstream_connected(&mut self, socket: UpstreamSocket, ctx: &mut ws::WebsocketContext<Self>) {
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();

        // Forward drains the channel in order and closes the sink once every sender is dropped
        let session_id = self.id;
        tokio::spawn(async move {
            if let Err(err) = UnboundedReceiverStream::new(rx).map(Ok::<_, UpstreamError>).forward(sink).await {
                debug!(session_id = %session_id, "Upstream writer stopped: {}", err);
            }
        });

        self.upstream_tx = Some(tx);
        ctx.add_stream(stream);
        self.phase = SessionPhase::UpstreamOpen;
        ctx.text(RelayNotice::connected().to_json());
    }

    /// Tell the client why the session is ending, then close both sides.
    fn close_with_error(&mut self, err: RelayError, ctx: &mut ws::WebsocketContext<Self>) {
        if self.phase == SessionPhase::Closing {
            return;
        }
        self.phase = SessionPhase::Closing;
        warn!(session_id = %self.id, "Closing relay session: {}", err);

        self.close_upstream();
        ctx.text(RelayNotice::from(&err).to_json());
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Away,
            description: Some(err.to_string()),
        }));
        ctx.stop();
    }

    /// Close the upstream socket. Safe to call any number of times.
    fn close_upstream(&mut self) {
        if self.upstream_tx.take().is_some() {
            debug!(session_id = %self.id, "Closing upstream connection");
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.config.client_timeout;
        ctx.run_interval(self.config.heartbeat_interval, move |act, ctx| {
            if act.last_heartbeat.elapsed() > timeout {
                warn!(session_id = %act.id, "Client heartbeat timeout, closing session");
                act.phase = SessionPhase::Closing;
                act.close_upstream();
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }
}

impl Actor for RelaySession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.id, "Relay session started");
        self.start_heartbeat(ctx);

        let target = self.config.target.clone();
        let api_key = self.api_key.clone();

        // Cancelled automatically if the client leaves while this is in flight
        ctx.spawn(upstream::connect(target, api_key).into_actor(self).map(|result, act, ctx| {
            if act.phase != SessionPhase::Connecting {
                return;
            }
            match result {
                Ok(socket) => act.on_upstream_connected(socket, ctx),
                Err(err) => act.close_with_error(err, ctx),
            }
        }));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.phase = SessionPhase::Closing;
        self.close_upstream();
        self.permit.take();

        info!(
            session_id = %self.id,
            client_to_upstream = self.stats.client_to_upstream,
            upstream_to_client = self.stats.upstream_to_client,
            dropped_early = self.stats.dropped_early,
            parse_failures = self.stats.parse_failures,
            config_sent = self.handshake.has_fired(),
            "Relay session stopped"
        );
    }
}

/// Messages from the client socket.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward_client_to_upstream(UpstreamMessage::Text(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward_client_to_upstream(UpstreamMessage::Binary(data.to_vec()));
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                // Client leaving is a normal shutdown, not an error
                info!(session_id = %self.id, "Client closed connection: {:?}", reason);
                self.phase = SessionPhase::Closing;
                self.close_upstream();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.id, "Dropping fragmented client frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.id, "Client WebSocket protocol error: {}", err);
                self.phase = SessionPhase::Closing;
                self.close_upstream();
                ctx.stop();
            }
        }
    }
}

/// Messages from the upstream socket.
impl StreamHandler<Result<UpstreamMessage, UpstreamError>> for RelaySession {
    fn handle(&mut self, msg: Result<UpstreamMessage, UpstreamError>, ctx: &mut Self::Context) {
        if self.phase == SessionPhase::Closing {
            return;
        }

        match msg {
            Ok(UpstreamMessage::Text(text)) => self.forward_upstream_to_client(text, ctx),
            Ok(UpstreamMessage::Binary(data)) => {
                ctx.binary(data);
                self.stats.upstream_to_client += 1;
            }
            Ok(UpstreamMessage::Close(frame)) => {
                let detail = match frame {
                    Some(frame) if !frame.reason.is_empty() => {
                        format!("code {}: {}", u16::from(frame.code), frame.reason)
                    }
                    Some(frame) => format!("code {}", u16::from(frame.code)),
                    None => "no close frame".to_string(),
                };
                self.close_with_error(RelayError::UpstreamClosed(detail), ctx);
            }
            // tungstenite answers pings itself
            Ok(UpstreamMessage::Ping(_)) | Ok(UpstreamMessage::Pong(_)) | Ok(UpstreamMessage::Frame(_)) => {}
            Err(err) => self.close_with_error(RelayError::Upstream(err.to_string()), ctx),
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        self.close_with_error(RelayError::UpstreamClosed("connection ended".to_string()), ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_guard_fires_once() {
        let mut guard = HandshakeGuard::default();
        assert!(!guard.has_fired());
        assert!(guard.try_fire());
        assert!(!guard.try_fire());
        assert!(!guard.try_fire());
        assert!(guard.has_fired());
    }

    #[test]
    fn test_phases_accepting_client_messages() {
        assert!(!SessionPhase::Connecting.accepts_client_messages());
        assert!(SessionPhase::UpstreamOpen.accepts_client_messages());
        assert!(SessionPhase::AwaitingConfigAck.accepts_client_messages());
        assert!(SessionPhase::Relaying.accepts_client_messages());
        assert!(!SessionPhase::Closing.accepts_client_messages());
    }

    #[test]
    fn test_session_config_snapshot() {
        let mut config = AppConfig::default();
        config.performance.heartbeat_interval_secs = 5;
        config.performance.client_timeout_secs = 15;
        let snapshot = RelaySessionConfig::from_app_config(&config);

        config.session.voice = "changed".to_string();
        assert_eq!(snapshot.session.voice, "alloy");
        assert_eq!(snapshot.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(snapshot.client_timeout, Duration::from_secs(15));
    }
}
