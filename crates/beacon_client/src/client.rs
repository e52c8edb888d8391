//! Beacon-Client: Clientseite des Handshakes.
//!
//! Mirrors the host sequence: Hello -> [EncryptionAck] -> [Challenge/Login] ->
//! Welcome -> Netspeed/Join -> AssignId -> IdAck -> Connected. Application code
//! sees `Pending` until the host's `Connected` RPC arrives, then `Open`. Every
//! failure path ends in `Invalid` with exactly one `on_failure` per `init`;
//! a local `destroy_beacon` ends in `Closed` and never reports a failure.
//!
//! Logging target: `beacon::client`

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use beacon_shared::config::ClientConfig;
use beacon_shared::error::{BeaconError, DisconnectReason, FailureInfo, NegotiationError};
use beacon_shared::ids::{PlayerId, SessionId};
use beacon_shared::negotiation::{Completion, EncryptionData, EncryptionHooks, NegotiationSide};
use beacon_shared::protocol::{
    ControlMessage, ControlMessageKind, FailureCode, Frame, FrameCodec, FrameDecoder, SessionRpc,
    TransportFrame,
};
use beacon_shared::state::BeaconConnectionState;
use beacon_shared::transport::{LinkEvent, TransportConnection, TransportFactory};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, info, trace, warn};

/// Application hooks of a beacon client. All methods default to no-ops.
pub trait ClientDelegate: Send {
    /// The host confirmed the session; state is `Open`.
    fn on_connected(&mut self, _ctx: &mut ClientContext) {}

    /// The connection attempt or open session failed; state is `Invalid`.
    fn on_failure(&mut self, _ctx: &mut ClientContext, _failure: &FailureInfo) {}

    fn on_message(&mut self, _ctx: &mut ClientContext, _payload: &[u8]) {}
}

/// Handle given to delegate callbacks.
///
/// Requests made through it are applied after the callback returns, so a
/// delegate may tear the beacon down from inside `on_connected`.
#[derive(Debug)]
pub struct ClientContext {
    state: BeaconConnectionState,
    session_id: Option<SessionId>,
    destroy_requested: bool,
    outbound: Vec<Vec<u8>>,
}

impl ClientContext {
    pub fn state(&self) -> BeaconConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn destroy_beacon(&mut self) {
        self.destroy_requested = true;
    }

    pub fn send_message(&mut self, payload: impl Into<Vec<u8>>) {
        self.outbound.push(payload.into());
    }
}

type AckResumption = (u64, Result<EncryptionData, NegotiationError>);

/// Host messages seen during the current handshake.
#[derive(Debug, Clone, Copy, Default)]
struct HandshakeSteps {
    encryption_ack: bool,
    challenge: bool,
    welcome: bool,
    assign_id: bool,
}

impl HandshakeSteps {
    /// Whether a control message of `kind` is the next legal host step.
    /// `announced_key` is set when `Hello` carried an encryption identifier.
    fn admits(&self, kind: ControlMessageKind, announced_key: bool) -> bool {
        let negotiated = !announced_key || self.encryption_ack;
        match kind {
            ControlMessageKind::EncryptionAck => announced_key && !self.encryption_ack,
            ControlMessageKind::Challenge => negotiated && !self.challenge && !self.welcome,
            ControlMessageKind::Welcome => negotiated && !self.welcome,
            ControlMessageKind::AssignId => self.welcome && !self.assign_id,
            ControlMessageKind::Failure => true,
            // client-to-host messages
            ControlMessageKind::Hello
            | ControlMessageKind::Login
            | ControlMessageKind::Netspeed
            | ControlMessageKind::Join
            | ControlMessageKind::IdAck => false,
        }
    }
}

/// Connecting side of the beacon protocol.
pub struct BeaconClient {
    config: ClientConfig,
    transport: Arc<dyn TransportFactory>,
    codec: FrameCodec,
    delegate: Box<dyn ClientDelegate>,
    encryption: EncryptionHooks,
    encryption_data: Option<EncryptionData>,
    /// Identifier announced in `Hello`, kept for the ack hook.
    encryption_identifier: Option<String>,
    link: Option<Box<dyn TransportConnection>>,
    decoder: FrameDecoder,
    state: BeaconConnectionState,
    player_id: PlayerId,
    beacon_type: String,
    session_id: Option<SessionId>,
    sent_hello: bool,
    steps: HandshakeSteps,
    /// Waiting for the encryption ack hook; inbound frames are buffered meanwhile.
    suspended: bool,
    buffered: VecDeque<Frame>,
    /// Bumped on every init/teardown so late completions are recognised as stale.
    generation: u64,
    resume_tx: UnboundedSender<AckResumption>,
    resume_rx: UnboundedReceiver<AckResumption>,
    failure_reported: bool,
    last_received: Option<Instant>,
    next_keep_alive: Option<Instant>,
    ping_seq: u64,
    timeouts_enabled: bool,
    received: Vec<ControlMessageKind>,
}

impl std::fmt::Debug for BeaconClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeaconClient")
            .field("state", &self.state)
            .field("player_id", &self.player_id)
            .field("beacon_type", &self.beacon_type)
            .field("session_id", &self.session_id)
            .field("suspended", &self.suspended)
            .finish()
    }
}

impl BeaconClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn TransportFactory>,
        delegate: impl ClientDelegate + 'static,
    ) -> Self {
        let (resume_tx, resume_rx) = unbounded_channel();
        Self {
            codec: FrameCodec::new(config.max_frame_bytes),
            decoder: FrameDecoder::new(config.max_frame_bytes),
            config,
            transport,
            delegate: Box::new(delegate),
            encryption: EncryptionHooks::new(),
            encryption_data: None,
            encryption_identifier: None,
            link: None,
            state: BeaconConnectionState::Invalid,
            player_id: PlayerId::new(""),
            beacon_type: String::new(),
            session_id: None,
            sent_hello: false,
            steps: HandshakeSteps::default(),
            suspended: false,
            buffered: VecDeque::new(),
            generation: 0,
            resume_tx,
            resume_rx,
            failure_reported: false,
            last_received: None,
            next_keep_alive: None,
            ping_seq: 0,
            timeouts_enabled: true,
            received: Vec::new(),
        }
    }

    pub fn with_encryption(mut self, hooks: EncryptionHooks) -> Self {
        self.encryption = hooks;
        self
    }

    pub fn set_encryption_hooks(&mut self, hooks: EncryptionHooks) {
        self.encryption = hooks;
    }

    /// Key to announce in `Hello` and to use when the host acknowledges it.
    pub fn set_encryption_data(&mut self, data: EncryptionData) {
        self.encryption_data = Some(data);
    }

    /// Forgets the stored key; the ack hook is asked instead.
    pub fn clear_encryption_data(&mut self) {
        self.encryption_data = None;
    }

    pub fn encryption_data(&self) -> Option<&EncryptionData> {
        self.encryption_data.as_ref()
    }

    pub fn set_timeouts_enabled(&mut self, enabled: bool) {
        self.timeouts_enabled = enabled;
    }

    pub fn state(&self) -> BeaconConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn player_id(&self) -> &PlayerId {
        &self.player_id
    }

    /// Transport link id while a link exists.
    pub fn connection_id(&self) -> Option<u64> {
        self.link.as_ref().map(|link| link.id())
    }

    /// Control message kinds received since the last call, in arrival order.
    pub fn take_received_control(&mut self) -> Vec<ControlMessageKind> {
        std::mem::take(&mut self.received)
    }

    /// Opens the link and enters `Pending`. `Hello` goes out on the next dispatch.
    ///
    /// A transport failure is the only synchronous error: the state stays
    /// `Invalid` and `on_failure` fires once.
    pub fn init(&mut self, addr: &str, player_id: PlayerId, beacon_type: impl Into<String>) -> Result<(), BeaconError> {
        if self.state.is_live() {
            return Err(BeaconError::AlreadyInitialized);
        }
        self.config.validate()?;

        self.generation += 1;
        self.failure_reported = false;
        self.player_id = player_id;
        self.beacon_type = beacon_type.into();
        self.session_id = None;
        self.sent_hello = false;
        self.steps = HandshakeSteps::default();
        self.suspended = false;
        self.buffered.clear();
        self.decoder = FrameDecoder::new(self.config.max_frame_bytes);
        self.encryption_identifier = None;
        self.last_received = None;
        self.next_keep_alive = None;

        match self.transport.connect(addr) {
            Ok(link) => {
                info!(target: "beacon::client", addr, link = link.id(), player = %self.player_id, "beacon client connecting");
                self.link = Some(link);
                self.state = BeaconConnectionState::Pending;
                Ok(())
            }
            Err(err) => {
                warn!(target: "beacon::client", addr, %err, "beacon client init failed");
                self.fail(FailureInfo::local(format!("transport init failed: {err}")));
                Err(err.into())
            }
        }
    }

    /// Queues an application payload on an open session.
    pub fn send_message(&mut self, payload: impl Into<Vec<u8>>) -> Result<(), BeaconError> {
        if self.state != BeaconConnectionState::Open {
            return Err(BeaconError::NotOpen);
        }
        self.send(&Frame::Rpc(SessionRpc::Message(payload.into())));
        Ok(())
    }

    /// Local teardown. Idempotent, never fires `on_failure`.
    pub fn destroy_beacon(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close(DisconnectReason::Graceful);
            debug!(target: "beacon::client", link = link.id(), "beacon link closed locally");
        }
        if self.state.is_live() {
            info!(target: "beacon::client", from = %self.state, "beacon client closed");
            self.state = BeaconConnectionState::Closed;
        }
        self.failure_reported = true;
        self.generation += 1;
        self.suspended = false;
        self.buffered.clear();
        self.next_keep_alive = None;
    }

    // ---------------------------------------------------------------------------------------------
    // Tick phases
    // ---------------------------------------------------------------------------------------------

    pub fn dispatch(&mut self, now: Instant) {
        if self.link.is_none() || !self.state.is_live() {
            return;
        }
        if !self.sent_hello {
            self.start_handshake(now);
        }

        let mut events = Vec::new();
        if let Some(link) = self.link.as_mut() {
            link.poll(&mut events);
        }
        for event in events {
            if !self.state.is_live() {
                break;
            }
            match event {
                LinkEvent::Data(bytes) => {
                    self.last_received = Some(now);
                    self.decoder.push_bytes(&bytes);
                    self.decode_frames(now);
                }
                LinkEvent::Closed(reason) => {
                    self.fail(FailureInfo::local(format!("connection closed by host ({reason:?})")));
                }
            }
        }

        self.drain_resumptions(now);
        self.check_timers(now);
    }

    pub fn flush(&mut self, now: Instant) {
        self.drain_resumptions(now);
    }

    // ---------------------------------------------------------------------------------------------
    // Handshake
    // ---------------------------------------------------------------------------------------------

    fn start_handshake(&mut self, now: Instant) {
        self.sent_hello = true;
        self.last_received = Some(now);

        if self.encryption_data.is_none()
            && !self
                .encryption
                .allow_without_encryption(NegotiationSide::Client, &self.config.encryption)
        {
            self.fail(FailureInfo::local("encryption required but no key available"));
            return;
        }

        let identifier = self.encryption_data.as_ref().map(|data| data.identifier.clone());
        self.encryption_identifier = identifier.clone();
        debug!(target: "beacon::client", encrypted = identifier.is_some(), "sending hello");
        self.send(
            &ControlMessage::Hello {
                version: self.config.protocol_version,
                encryption_identifier: identifier,
            }
            .into(),
        );
    }

    fn decode_frames(&mut self, now: Instant) {
        while self.state.is_live() {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Some(kind) = frame.control_kind() {
                        self.received.push(kind);
                    }
                    if self.suspended {
                        self.buffered.push_back(frame);
                    } else {
                        self.handle_frame(frame, now);
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    self.decoder.clear();
                    self.fail(FailureInfo::local(format!("malformed frame: {err}")));
                    return;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        match frame {
            Frame::Control(message) => self.handle_control(message, now),
            Frame::Rpc(SessionRpc::Connected) => self.on_connected_rpc(now),
            Frame::Rpc(SessionRpc::Message(payload)) => {
                if self.state != BeaconConnectionState::Open {
                    trace!(target: "beacon::client", "message before open ignored");
                    return;
                }
                let mut ctx = self.context();
                self.delegate.on_message(&mut ctx, &payload);
                self.apply_context(ctx);
            }
            Frame::Transport(TransportFrame::Ping(value)) => {
                self.send(&Frame::Transport(TransportFrame::Pong(value)));
            }
            Frame::Transport(TransportFrame::Pong(value)) => {
                trace!(target: "beacon::client", value, "pong");
            }
        }
    }

    fn handle_control(&mut self, message: ControlMessage, now: Instant) {
        let kind = message.kind();
        if !self.steps.admits(kind, self.encryption_identifier.is_some()) {
            self.protocol_violation(format!("unexpected {}", kind.label()));
            return;
        }
        match message {
            ControlMessage::EncryptionAck => {
                self.steps.encryption_ack = true;
                self.on_encryption_ack(now);
            }
            ControlMessage::Welcome => {
                self.steps.welcome = true;
                debug!(target: "beacon::client", beacon_type = %self.beacon_type, "welcome received, joining");
                self.send(&ControlMessage::Netspeed { rate: self.config.net_speed }.into());
                self.send(
                    &ControlMessage::Join {
                        beacon_type: self.beacon_type.clone(),
                        player_id: self.player_id.clone(),
                        login_options: self.config.login_options.clone(),
                    }
                    .into(),
                );
            }
            ControlMessage::Challenge { nonce } => {
                self.steps.challenge = true;
                debug!(target: "beacon::client", %nonce, "challenge received, logging in");
                self.send(
                    &ControlMessage::Login {
                        player_id: self.player_id.clone(),
                        login_options: self.config.login_options.clone(),
                        auth_token: self.config.auth_token.clone(),
                    }
                    .into(),
                );
            }
            ControlMessage::AssignId { session_id } => {
                self.steps.assign_id = true;
                self.session_id = Some(session_id);
                self.send(&ControlMessage::IdAck { session_id }.into());
            }
            ControlMessage::Failure { code, reason } => {
                self.fail(FailureInfo::from_message(code, reason));
            }
            other => self.protocol_violation(format!("unexpected {}", other.kind().label())),
        }
    }

    /// Tells the host why the handshake is abandoned, then fails locally.
    fn protocol_violation(&mut self, reason: String) {
        warn!(target: "beacon::client", %reason, "protocol violation");
        self.send(&Frame::failure(FailureCode::ProtocolViolation, reason.clone()));
        self.fail(FailureInfo::local(reason));
    }

    fn on_encryption_ack(&mut self, now: Instant) {
        if self.encryption_data.is_some() {
            debug!(target: "beacon::client", "encryption acknowledged, using supplied key");
            return;
        }
        let Some(identifier) = self.encryption_identifier.clone() else {
            self.protocol_violation("encryption ack without announced key".into());
            return;
        };
        debug!(target: "beacon::client", %identifier, "encryption acknowledged, requesting key");
        self.suspended = true;
        let generation = self.generation;
        let tx = self.resume_tx.clone();
        let done = Completion::new(move |result| {
            let _ = tx.send((generation, result));
        });
        self.encryption.request_client_ack(&identifier, done);
        self.drain_resumptions(now);
    }

    fn on_connected_rpc(&mut self, now: Instant) {
        if self.state != BeaconConnectionState::Pending || !self.steps.assign_id {
            self.protocol_violation("connected before id assignment".into());
            return;
        }
        self.state = BeaconConnectionState::Open;
        self.next_keep_alive = self.config.keep_alive_interval().map(|interval| now + interval);
        info!(target: "beacon::client", session = ?self.session_id, "beacon client open");

        let mut ctx = self.context();
        self.delegate.on_connected(&mut ctx);
        self.apply_context(ctx);
    }

    fn drain_resumptions(&mut self, now: Instant) {
        while let Ok((generation, result)) = self.resume_rx.try_recv() {
            if generation != self.generation || !self.suspended || !self.state.is_live() {
                debug!(target: "beacon::client", "stale encryption ack discarded");
                continue;
            }
            match result {
                Ok(data) => {
                    self.encryption_data = Some(data);
                    self.suspended = false;
                    self.replay_buffered(now);
                }
                Err(err) => {
                    self.fail(FailureInfo::local(format!("encryption ack failed: {err}")));
                }
            }
        }
    }

    fn replay_buffered(&mut self, now: Instant) {
        while !self.suspended && self.state.is_live() {
            let Some(frame) = self.buffered.pop_front() else {
                break;
            };
            self.handle_frame(frame, now);
        }
    }

    fn check_timers(&mut self, now: Instant) {
        if !self.state.is_live() {
            return;
        }
        if self.timeouts_enabled {
            if let (Some(timeout), Some(last)) = (self.config.connection_timeout(), self.last_received) {
                if now.saturating_duration_since(last) >= timeout {
                    warn!(target: "beacon::client", ?timeout, "beacon connection timed out");
                    self.fail(FailureInfo::timeout());
                    return;
                }
            }
        }
        if self.state == BeaconConnectionState::Open {
            if let (Some(interval), Some(next)) = (self.config.keep_alive_interval(), self.next_keep_alive) {
                if now >= next {
                    self.ping_seq += 1;
                    self.send(&Frame::Transport(TransportFrame::Ping(self.ping_seq)));
                    self.next_keep_alive = Some(now + interval);
                }
            }
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------------------------------

    fn send(&mut self, frame: &Frame) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match self.codec.encode_to_bytes(frame) {
            Ok(bytes) => {
                if let Err(err) = link.send(bytes) {
                    // the close event follows on the next poll
                    debug!(target: "beacon::client", %err, "send failed");
                }
            }
            Err(err) => warn!(target: "beacon::client", %err, "encode failed"),
        }
    }

    /// Moves to `Invalid` and reports `info` unless a failure was already reported.
    fn fail(&mut self, info: FailureInfo) {
        if let Some(mut link) = self.link.take() {
            let reason = if info.is_timeout() {
                DisconnectReason::Timeout
            } else {
                DisconnectReason::Graceful
            };
            link.close(reason);
        }
        self.state = BeaconConnectionState::Invalid;
        self.suspended = false;
        self.buffered.clear();
        self.next_keep_alive = None;

        if self.failure_reported {
            return;
        }
        self.failure_reported = true;
        warn!(
            target: "beacon::client",
            code = info.code.map(FailureCode::label),
            reason = %info.reason,
            "beacon client failed"
        );
        let mut ctx = self.context();
        self.delegate.on_failure(&mut ctx, &info);
        self.apply_context(ctx);
    }

    fn context(&self) -> ClientContext {
        ClientContext {
            state: self.state,
            session_id: self.session_id,
            destroy_requested: false,
            outbound: Vec::new(),
        }
    }

    fn apply_context(&mut self, ctx: ClientContext) {
        if self.state == BeaconConnectionState::Open {
            for payload in ctx.outbound {
                self.send(&Frame::Rpc(SessionRpc::Message(payload)));
            }
        }
        if ctx.destroy_requested {
            self.destroy_beacon();
        }
    }
}

impl Drop for BeaconClient {
    fn drop(&mut self) {
        self.destroy_beacon();
    }
}
