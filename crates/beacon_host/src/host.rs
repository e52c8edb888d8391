/*!
Beacon Host (Handshake State Machine, Host Side)

Scope:
- Owns the listening endpoint and one `ConnectionState` per inbound link.
- Drives Hello -> [EncryptionAck] -> [Challenge/Login] -> Welcome -> Netspeed/Join
  -> AssignId -> IdAck -> Connected.
- Suspends on the encryption token and authentication hooks; their completions
  come back through an unbounded channel and are applied during `dispatch`
  (synchronous hooks) or `flush` (hooks completed from the scheduler).
- Spawns `HostSession`s through the registered `BeaconHostObject`s and delivers
  disconnect notifications one dispatch after the link went away.
- Handshake timeout per connection, capacity limit, shutdown / drop teardown.

Tick phases:
- `dispatch(now)`: session commands, pending disconnect notifications, accept,
  inbound frames, synchronous resumptions, timeouts.
- `flush(now)`: deferred resumptions, metrics dump.

Logging Targets:
- beacon::host::handshake (state transitions / failures)
- beacon::host::session   (session lifecycle)
*/

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use beacon_shared::config::HostConfig;
use beacon_shared::error::{BeaconError, DisconnectReason, NegotiationError};
use beacon_shared::ids::{ConnectionId, IdGenerator, PlayerId, SessionId};
use beacon_shared::metrics::{BeaconMetrics, MetricsDumpTimer};
use beacon_shared::negotiation::{
    AuthRequest, AuthResult, AuthVerifier, Completion, EncryptionData, EncryptionHooks, NegotiationSide,
};
use beacon_shared::protocol::{
    ControlMessage, ControlMessageKind, FailureCode, Frame, FrameCodec, FrameDecoder, SUPPORTED_VERSIONS,
    SessionRpc, TransportFrame,
};
use beacon_shared::state::BeaconConnectionState;
use beacon_shared::transport::{LinkEvent, TransportConnection, TransportFactory, TransportListener};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, error, info, trace, warn};

use crate::connection_state::{Awaiting, ConnectionState};
use crate::host_object::{BeaconHostObject, CommandQueue, HostSession, JoinRequest, SessionCommand};
use crate::registry::BeaconRegistry;

/// Notifications for the application owning the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// `init_host` could not create the listener. Emitted at most once.
    InitFailed(String),
    ClientConnected {
        session_id: SessionId,
        player_id: PlayerId,
        beacon_type: String,
    },
    ClientDisconnected {
        session_id: SessionId,
        player_id: PlayerId,
    },
    /// A connection was dropped by the host. `code` is `None` for timeouts.
    ConnectionFailed {
        connection_id: ConnectionId,
        code: Option<FailureCode>,
    },
}

#[derive(Debug)]
enum Resumption {
    EncryptionToken(Result<EncryptionData, NegotiationError>),
    Authentication(Result<AuthResult, NegotiationError>),
}

/// What to do after a resumption updated the connection state.
enum Followup {
    Greet { with_ack: bool },
    Welcome,
    Fail(FailureCode, String),
}

#[derive(Debug)]
struct HostLink {
    link: Box<dyn TransportConnection>,
    decoder: FrameDecoder,
    state: ConnectionState,
    session: Option<Arc<HostSession>>,
}

/// Listening side of the beacon protocol.
pub struct BeaconHost {
    config: HostConfig,
    transport: Arc<dyn TransportFactory>,
    codec: FrameCodec,
    listener: Option<Box<dyn TransportListener>>,
    links: BTreeMap<ConnectionId, HostLink>,
    registry: BeaconRegistry,
    encryption: EncryptionHooks,
    auth: Option<Arc<dyn AuthVerifier>>,
    resume_tx: UnboundedSender<(ConnectionId, Resumption)>,
    resume_rx: UnboundedReceiver<(ConnectionId, Resumption)>,
    commands: Arc<CommandQueue>,
    pending_disconnects: Vec<Arc<HostSession>>,
    event_tx: UnboundedSender<HostEvent>,
    event_rx: Option<UnboundedReceiver<HostEvent>>,
    metrics: BeaconMetrics,
    dump_timer: MetricsDumpTimer,
    connection_ids: IdGenerator,
    session_ids: IdGenerator,
    received: Vec<ControlMessageKind>,
    paused: bool,
    timeouts_enabled: bool,
    init_failure_reported: bool,
    shut_down: bool,
}

impl std::fmt::Debug for BeaconHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeaconHost")
            .field("listen_addr", &self.config.listen_addr)
            .field("listening", &self.listener.is_some())
            .field("links", &self.links.len())
            .field("registry", &self.registry)
            .field("paused", &self.paused)
            .finish()
    }
}

impl BeaconHost {
    pub fn new(config: HostConfig, transport: Arc<dyn TransportFactory>) -> Self {
        let (resume_tx, resume_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded_channel();
        Self {
            codec: FrameCodec::new(config.max_frame_bytes),
            config,
            transport,
            listener: None,
            links: BTreeMap::new(),
            registry: BeaconRegistry::new(),
            encryption: EncryptionHooks::new(),
            auth: None,
            resume_tx,
            resume_rx,
            commands: Arc::new(CommandQueue::default()),
            pending_disconnects: Vec::new(),
            event_tx,
            event_rx: Some(event_rx),
            metrics: BeaconMetrics::default(),
            dump_timer: MetricsDumpTimer::default(),
            connection_ids: IdGenerator::new(1),
            session_ids: IdGenerator::new(1),
            received: Vec::new(),
            paused: false,
            timeouts_enabled: true,
            init_failure_reported: false,
            shut_down: false,
        }
    }

    pub fn with_encryption(mut self, hooks: EncryptionHooks) -> Self {
        self.encryption = hooks;
        self
    }

    pub fn with_auth_verifier(mut self, verifier: Arc<dyn AuthVerifier>) -> Self {
        self.auth = Some(verifier);
        self
    }

    pub fn set_encryption_hooks(&mut self, hooks: EncryptionHooks) {
        self.encryption = hooks;
    }

    pub fn set_auth_verifier(&mut self, verifier: Option<Arc<dyn AuthVerifier>>) {
        self.auth = verifier;
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Binds the listener. On failure `HostEvent::InitFailed` is emitted (once per host).
    pub fn init_host(&mut self) -> Result<(), BeaconError> {
        if self.listener.is_some() {
            return Err(BeaconError::AlreadyInitialized);
        }
        self.config.validate()?;
        match self.transport.listen(&self.config.listen_addr) {
            Ok(listener) => {
                info!(target: "beacon::host::handshake", "Beacon host listening on {}", listener.local_addr());
                self.listener = Some(listener);
                self.shut_down = false;
                Ok(())
            }
            Err(err) => {
                error!(target: "beacon::host::handshake", "Beacon host init failed addr={} err={err}", self.config.listen_addr);
                if !self.init_failure_reported {
                    self.init_failure_reported = true;
                    let _ = self.event_tx.send(HostEvent::InitFailed(err.to_string()));
                }
                Err(err.into())
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// While paused, new inbound links are refused on accept.
    pub fn pause_beacon_requests(&mut self, paused: bool) {
        if self.paused != paused {
            debug!(target: "beacon::host::handshake", paused, "beacon requests pause toggled");
        }
        self.paused = paused;
    }

    pub fn set_timeouts_enabled(&mut self, enabled: bool) {
        self.timeouts_enabled = enabled;
    }

    pub fn register_host(&mut self, object: BeaconHostObject) -> Result<(), BeaconError> {
        self.registry.register(object)
    }

    /// Removes a beacon type. Its sessions are closed and notified before this returns.
    pub fn unregister_host(&mut self, beacon_type: &str) -> Result<BeaconHostObject, BeaconError> {
        let sessions = self
            .registry
            .get(beacon_type)
            .map(|object| object.active_sessions().to_vec())
            .ok_or_else(|| BeaconError::UnknownBeaconType(beacon_type.to_string()))?;
        for session in &sessions {
            self.close_connection(session.connection_id, DisconnectReason::Kicked, BeaconConnectionState::Closed);
        }
        let (ours, others): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_disconnects)
            .into_iter()
            .partition(|session| session.beacon_type == beacon_type);
        self.pending_disconnects = others;
        for session in ours {
            self.finish_session(&session);
        }
        self.registry.unregister(beacon_type)
    }

    pub fn registry(&self) -> &BeaconRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &BeaconMetrics {
        &self.metrics
    }

    /// Hands the event stream to the caller. Returns `None` after the first call.
    pub fn take_event_receiver(&mut self) -> Option<UnboundedReceiver<HostEvent>> {
        self.event_rx.take()
    }

    /// Drains queued events, unless the receiver was taken.
    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        let mut out = Vec::new();
        if let Some(rx) = self.event_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                out.push(event);
            }
        }
        out
    }

    /// Control message kinds received since the last call, in arrival order.
    pub fn take_received_control(&mut self) -> Vec<ControlMessageKind> {
        std::mem::take(&mut self.received)
    }

    /// Inbound links that have not completed the handshake.
    pub fn pending_handshakes(&self) -> usize {
        self.links.values().filter(|link| !link.state.completed_ack).count()
    }

    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    pub fn session_for_player(&self, player_id: &PlayerId) -> Option<Arc<HostSession>> {
        self.registry
            .find_session(|session| &session.player_id == player_id && !session.is_closing())
    }

    /// Closes the session's link now; the host object is notified on the next dispatch.
    pub fn disconnect_client(&mut self, session: &HostSession) -> bool {
        let known = self.links.contains_key(&session.connection_id);
        self.close_connection(session.connection_id, DisconnectReason::Kicked, BeaconConnectionState::Closed);
        known
    }

    /// Sends an application payload on an open session.
    pub fn send_message(&mut self, session: &HostSession, payload: Vec<u8>) -> Result<(), BeaconError> {
        let open = self
            .links
            .get(&session.connection_id)
            .is_some_and(|link| link.session.is_some());
        if !open || session.is_closing() {
            return Err(BeaconError::NotOpen);
        }
        self.send_frame(session.connection_id, &Frame::Rpc(SessionRpc::Message(payload)));
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Tick phases
    // ---------------------------------------------------------------------------------------------

    pub fn dispatch(&mut self, now: Instant) {
        if self.shut_down {
            return;
        }
        self.run_session_commands();
        self.notify_pending_disconnects();
        self.accept_links(now);

        let ids: Vec<ConnectionId> = self.links.keys().copied().collect();
        for id in ids {
            self.poll_link(id, now);
        }

        self.drain_resumptions(now);
        self.check_timeouts(now);
    }

    pub fn flush(&mut self, now: Instant) {
        if self.shut_down {
            return;
        }
        self.drain_resumptions(now);
        self.dump_timer.maybe_dump(&self.metrics, now);
    }

    /// Closes every connection, notifies every active session and releases the listener.
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!(target: "beacon::host::handshake", "Beacon host shutting down links={}", self.links.len());

        let ids: Vec<ConnectionId> = self.links.keys().copied().collect();
        for id in ids {
            self.send_frame(id, &Frame::failure(FailureCode::ShuttingDown, "host shutting down"));
            self.close_connection(id, DisconnectReason::Graceful, BeaconConnectionState::Closed);
        }
        for session in std::mem::take(&mut self.pending_disconnects) {
            self.finish_session(&session);
        }
        // sessions whose link was already gone
        for session in self.registry.all_sessions() {
            session.mark_closing(BeaconConnectionState::Closed);
            self.finish_session(&session);
        }
        if let Some(mut listener) = self.listener.take() {
            listener.close();
        }
        while self.resume_rx.try_recv().is_ok() {}
    }

    // ---------------------------------------------------------------------------------------------
    // Connection bookkeeping
    // ---------------------------------------------------------------------------------------------

    fn run_session_commands(&mut self) {
        for command in self.commands.drain() {
            match command {
                SessionCommand::Disconnect(id) => {
                    self.close_connection(id, DisconnectReason::Kicked, BeaconConnectionState::Closed);
                }
                SessionCommand::Send(id, payload) => {
                    if self.links.get(&id).is_some_and(|link| link.session.is_some()) {
                        self.send_frame(id, &Frame::Rpc(SessionRpc::Message(payload)));
                    }
                }
            }
        }
    }

    fn notify_pending_disconnects(&mut self) {
        for session in std::mem::take(&mut self.pending_disconnects) {
            self.finish_session(&session);
        }
    }

    fn finish_session(&mut self, session: &Arc<HostSession>) {
        if self.registry.remove_session(session) {
            self.metrics.session_closed();
            let _ = self.event_tx.send(HostEvent::ClientDisconnected {
                session_id: session.session_id,
                player_id: session.player_id.clone(),
            });
        }
    }

    fn accept_links(&mut self, now: Instant) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        let mut accepted = Vec::new();
        while let Some(link) = listener.accept() {
            accepted.push(link);
        }
        for mut link in accepted {
            if self.paused {
                debug!(target: "beacon::host::handshake", "Refusing link={} (requests paused)", link.id());
                link.close(DisconnectReason::Kicked);
                continue;
            }
            let id = ConnectionId::new(self.connection_ids.next());
            info!(target: "beacon::host::handshake", "Handshake started conn={} link={}", id, link.id());
            self.links.insert(
                id,
                HostLink {
                    link,
                    decoder: FrameDecoder::new(self.config.max_frame_bytes),
                    state: ConnectionState::new(id, self.config.handshake_timeout(), now),
                    session: None,
                },
            );
        }
    }

    /// Removes the connection, closes its link and queues the session (if any)
    /// for its disconnect notification.
    fn close_connection(&mut self, id: ConnectionId, reason: DisconnectReason, final_state: BeaconConnectionState) {
        let Some(mut link) = self.links.remove(&id) else {
            return;
        };
        link.state.timer.cancel();
        link.link.close(reason);
        if let Some(session) = link.session.take() {
            session.mark_closing(final_state);
            self.pending_disconnects.push(session);
        }
        debug!(target: "beacon::host::handshake", "Connection closed conn={} reason={:?}", id, reason);
    }

    fn fail_connection(&mut self, id: ConnectionId, code: FailureCode, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(target: "beacon::host::handshake", "Handshake failed conn={} code={} reason={}", id, code.label(), reason);
        self.send_frame(id, &Frame::failure(code, reason));
        self.metrics.record_failure(code);
        let _ = self.event_tx.send(HostEvent::ConnectionFailed {
            connection_id: id,
            code: Some(code),
        });
        self.close_connection(id, disconnect_reason_for(code), BeaconConnectionState::Invalid);
    }

    fn check_timeouts(&mut self, now: Instant) {
        if !self.timeouts_enabled {
            return;
        }
        let expired: Vec<ConnectionId> = self
            .links
            .iter()
            .filter(|(_, link)| link.state.timer.expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            warn!(target: "beacon::host::handshake", "Handshake timeout conn={}", id);
            self.metrics.record_timeout();
            let _ = self.event_tx.send(HostEvent::ConnectionFailed {
                connection_id: id,
                code: None,
            });
            self.close_connection(id, DisconnectReason::Timeout, BeaconConnectionState::Invalid);
        }
    }

    fn send_frame(&mut self, id: ConnectionId, frame: &Frame) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        match self.codec.encode_to_bytes(frame) {
            Ok(bytes) => {
                if let Err(err) = link.link.send(bytes) {
                    debug!(target: "beacon::host::handshake", "Send failed conn={} err={err}", id);
                }
            }
            Err(err) => {
                error!(target: "beacon::host::handshake", "Encode failed conn={} err={err}", id);
            }
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------------------------------

    fn poll_link(&mut self, id: ConnectionId, now: Instant) {
        let mut events = Vec::new();
        match self.links.get_mut(&id) {
            Some(link) => link.link.poll(&mut events),
            None => return,
        }
        for event in events {
            if !self.links.contains_key(&id) {
                break;
            }
            match event {
                LinkEvent::Data(bytes) => {
                    if let Some(link) = self.links.get_mut(&id) {
                        link.decoder.push_bytes(&bytes);
                    }
                    self.decode_frames(id, now);
                }
                LinkEvent::Closed(reason) => {
                    debug!(target: "beacon::host::handshake", "Remote closed conn={} reason={:?}", id, reason);
                    self.close_connection(id, reason, BeaconConnectionState::Invalid);
                }
            }
        }
    }

    fn decode_frames(&mut self, id: ConnectionId, now: Instant) {
        loop {
            let Some(link) = self.links.get_mut(&id) else {
                return;
            };
            match link.decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Some(kind) = frame.control_kind() {
                        self.received.push(kind);
                    }
                    self.handle_frame(id, frame, now);
                }
                Ok(None) => return,
                Err(err) => {
                    link.decoder.clear();
                    self.fail_connection(id, FailureCode::Malformed, err.to_string());
                    return;
                }
            }
        }
    }

    fn handle_frame(&mut self, id: ConnectionId, frame: Frame, now: Instant) {
        match frame {
            Frame::Transport(TransportFrame::Ping(value)) => {
                self.send_frame(id, &Frame::Transport(TransportFrame::Pong(value)));
            }
            Frame::Transport(TransportFrame::Pong(_)) => {}
            Frame::Rpc(rpc) => self.handle_rpc(id, rpc),
            Frame::Control(message) => self.handle_control(id, message, now),
        }
    }

    fn handle_rpc(&mut self, id: ConnectionId, rpc: SessionRpc) {
        let Some(session) = self.links.get(&id).and_then(|link| link.session.clone()) else {
            trace!(target: "beacon::host::session", "RPC before open ignored conn={}", id);
            return;
        };
        match rpc {
            SessionRpc::Message(payload) => {
                if let Some(object) = self.registry.get_mut(&session.beacon_type) {
                    object.on_message(&session, &payload);
                }
            }
            SessionRpc::Connected => {
                trace!(target: "beacon::host::session", "Unexpected Connected from client conn={}", id);
            }
        }
    }

    fn handle_control(&mut self, id: ConnectionId, message: ControlMessage, now: Instant) {
        let admitted = match self.links.get(&id) {
            Some(link) => link.state.admits(message.kind()),
            None => return,
        };
        if let Err(violation) = admitted {
            self.fail_connection(id, FailureCode::ProtocolViolation, violation.to_string());
            return;
        }

        match message {
            ControlMessage::Hello {
                version,
                encryption_identifier,
            } => self.on_hello(id, version, encryption_identifier, now),
            ControlMessage::Login {
                player_id,
                login_options,
                auth_token,
            } => self.on_login(id, player_id, login_options, auth_token, now),
            ControlMessage::Netspeed { rate } => {
                if let Some(link) = self.links.get_mut(&id) {
                    link.state.set_netspeed = true;
                    link.state.net_speed = Some(rate);
                    link.state.progress(now);
                }
            }
            ControlMessage::Join {
                beacon_type,
                player_id,
                login_options,
            } => self.on_join(id, beacon_type, player_id, login_options, now),
            ControlMessage::IdAck { session_id } => self.on_id_ack(id, session_id),
            ControlMessage::Failure { code, reason } => {
                info!(target: "beacon::host::handshake", "Client reported failure conn={} code={} reason={}", id, code.label(), reason);
                self.close_connection(id, DisconnectReason::Graceful, BeaconConnectionState::Invalid);
            }
            other => {
                self.fail_connection(
                    id,
                    FailureCode::ProtocolViolation,
                    format!("unexpected {}", other.kind().label()),
                );
            }
        }
    }

    fn on_hello(&mut self, id: ConnectionId, version: u16, encryption_identifier: Option<String>, now: Instant) {
        if !SUPPORTED_VERSIONS.contains(&version) {
            self.fail_connection(id, FailureCode::UnsupportedVersion, format!("version {version}"));
            return;
        }
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        link.state.sent_hello = true;
        link.state.progress(now);

        match encryption_identifier {
            Some(identifier) => {
                link.state.awaiting = Awaiting::EncryptionToken;
                debug!(target: "beacon::host::handshake", "Requesting encryption token conn={} identifier={}", id, identifier);
                let done = self.completion(id, Resumption::EncryptionToken);
                self.encryption.request_host_token(id, &identifier, done);
                self.drain_resumptions(now);
            }
            None => {
                if self
                    .encryption
                    .allow_without_encryption(NegotiationSide::Host, &self.config.encryption)
                {
                    self.greet(id, now);
                } else {
                    self.fail_connection(id, FailureCode::EncryptionFailed, "encryption required");
                }
            }
        }
    }

    fn on_login(
        &mut self,
        id: ConnectionId,
        player_id: PlayerId,
        login_options: String,
        auth_token: Option<String>,
        now: Instant,
    ) {
        let verifier = self.auth.clone();
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        link.state.sent_login = true;
        link.state.player_id = Some(player_id.clone());
        link.state.progress(now);

        let Some(verifier) = verifier else {
            self.fail_connection(id, FailureCode::AuthFailed, "no authentication verifier bound");
            return;
        };
        link.state.awaiting = Awaiting::Authentication;
        debug!(target: "beacon::host::handshake", "Verifying login conn={} player={}", id, player_id);
        let done = self.completion(id, Resumption::Authentication);
        verifier.start_verify_authentication(
            AuthRequest {
                connection: id,
                player_id,
                login_options,
                auth_token,
            },
            done,
        );
        self.drain_resumptions(now);
    }

    fn on_join(
        &mut self,
        id: ConnectionId,
        beacon_type: String,
        player_id: PlayerId,
        login_options: String,
        now: Instant,
    ) {
        if self.config.auth_required {
            let authenticated = self.links.get(&id).is_some_and(|link| {
                link.state.authenticated && link.state.player_id.as_ref() == Some(&player_id)
            });
            if !authenticated {
                self.fail_connection(id, FailureCode::AuthFailed, "join does not match authenticated player");
                return;
            }
        }
        if !self.registry.contains(&beacon_type) {
            self.fail_connection(id, FailureCode::UnknownBeaconType, format!("beacon type '{beacon_type}' not found"));
            return;
        }
        if let Some(max) = self.config.max_connections {
            if self.occupied_slots() >= max as usize {
                self.fail_connection(id, FailureCode::ServerFull, "server full");
                return;
            }
        }
        let request = JoinRequest {
            connection_id: id,
            beacon_type: beacon_type.clone(),
            player_id: player_id.clone(),
            login_options,
        };
        let accepted = self
            .registry
            .get_mut(&beacon_type)
            .is_some_and(|object| object.verify_join(&request));
        if !accepted {
            self.fail_connection(id, FailureCode::JoinRejected, "join rejected");
            return;
        }

        let session_id = SessionId::new(self.session_ids.next());
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        link.state.joined = true;
        link.state.beacon_type = Some(beacon_type);
        link.state.player_id = Some(player_id);
        link.state.assigned_session = Some(session_id);
        link.state.progress(now);
        debug!(target: "beacon::host::handshake", "Join accepted conn={} session={}", id, session_id);
        self.send_frame(id, &ControlMessage::AssignId { session_id }.into());
    }

    /// Open sessions plus joined links still waiting for their `IdAck`.
    fn occupied_slots(&self) -> usize {
        let reserved = self
            .links
            .values()
            .filter(|link| link.state.joined && link.session.is_none())
            .count();
        self.registry.open_session_count() + reserved
    }

    fn on_id_ack(&mut self, id: ConnectionId, session_id: SessionId) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if link.state.assigned_session != Some(session_id) {
            self.fail_connection(id, FailureCode::ProtocolViolation, "session id mismatch");
            return;
        }
        let (Some(player_id), Some(beacon_type)) = (link.state.player_id.clone(), link.state.beacon_type.clone())
        else {
            self.fail_connection(id, FailureCode::ProtocolViolation, "ack before join");
            return;
        };
        link.state.complete();

        let Some(object) = self.registry.get_mut(&beacon_type) else {
            // type unregistered between Join and IdAck
            self.fail_connection(id, FailureCode::UnknownBeaconType, format!("beacon type '{beacon_type}' not found"));
            return;
        };
        let session = object.spawn_session(HostSession::new(
            session_id,
            id,
            player_id.clone(),
            beacon_type.clone(),
            Arc::downgrade(&self.commands),
        ));
        if let Some(link) = self.links.get_mut(&id) {
            link.session = Some(session);
        }
        self.metrics.session_opened();
        info!(target: "beacon::host::handshake", "Handshake success conn={} -> session={}", id, session_id);
        let _ = self.event_tx.send(HostEvent::ClientConnected {
            session_id,
            player_id,
            beacon_type,
        });
        self.send_frame(id, &Frame::Rpc(SessionRpc::Connected));
    }

    /// `Challenge` if logins are required, else `Welcome`.
    fn greet(&mut self, id: ConnectionId, now: Instant) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        link.state.progress(now);
        if self.config.auth_required {
            link.state.sent_challenge = true;
            let nonce = uuid::Uuid::new_v4().to_string();
            self.send_frame(id, &ControlMessage::Challenge { nonce }.into());
        } else {
            link.state.sent_welcome = true;
            self.send_frame(id, &ControlMessage::Welcome.into());
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Negotiation resumptions
    // ---------------------------------------------------------------------------------------------

    fn completion<T: Send + 'static>(
        &self,
        id: ConnectionId,
        wrap: fn(Result<T, NegotiationError>) -> Resumption,
    ) -> Completion<T> {
        let tx = self.resume_tx.clone();
        Completion::new(move |result| {
            // receiver gone means the host is gone
            let _ = tx.send((id, wrap(result)));
        })
    }

    fn drain_resumptions(&mut self, now: Instant) {
        while let Ok((id, resumption)) = self.resume_rx.try_recv() {
            self.resume(id, resumption, now);
        }
    }

    fn resume(&mut self, id: ConnectionId, resumption: Resumption, now: Instant) {
        let Some(link) = self.links.get_mut(&id) else {
            debug!(target: "beacon::host::handshake", "Discarding resumption for closed conn={}", id);
            return;
        };
        let followup = match resumption {
            Resumption::EncryptionToken(result) => {
                if link.state.awaiting != Awaiting::EncryptionToken {
                    return;
                }
                link.state.awaiting = Awaiting::Nothing;
                match result {
                    Ok(data) => {
                        link.state.encryption = Some(data);
                        Followup::Greet { with_ack: true }
                    }
                    Err(err) => Followup::Fail(FailureCode::EncryptionFailed, err.to_string()),
                }
            }
            Resumption::Authentication(result) => {
                if link.state.awaiting != Awaiting::Authentication {
                    return;
                }
                link.state.awaiting = Awaiting::Nothing;
                match result {
                    Ok(AuthResult::Success) => {
                        link.state.authenticated = true;
                        Followup::Welcome
                    }
                    Ok(AuthResult::InvalidCredentials(reason)) => Followup::Fail(FailureCode::AuthFailed, reason),
                    Err(err) => Followup::Fail(FailureCode::AuthFailed, err.to_string()),
                }
            }
        };

        match followup {
            Followup::Greet { with_ack } => {
                if with_ack {
                    self.send_frame(id, &ControlMessage::EncryptionAck.into());
                }
                self.greet(id, now);
            }
            Followup::Welcome => {
                if let Some(link) = self.links.get_mut(&id) {
                    link.state.sent_welcome = true;
                    link.state.progress(now);
                }
                debug!(target: "beacon::host::handshake", "Login verified conn={}", id);
                self.send_frame(id, &ControlMessage::Welcome.into());
            }
            Followup::Fail(code, reason) => self.fail_connection(id, code, reason),
        }
    }
}

impl Drop for BeaconHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn disconnect_reason_for(code: FailureCode) -> DisconnectReason {
    match code {
        FailureCode::UnsupportedVersion | FailureCode::Malformed | FailureCode::ProtocolViolation => {
            DisconnectReason::ProtocolMismatch
        }
        FailureCode::AuthFailed | FailureCode::EncryptionFailed => DisconnectReason::AuthenticationFailed,
        FailureCode::ShuttingDown => DisconnectReason::Graceful,
        FailureCode::JoinRejected | FailureCode::UnknownBeaconType | FailureCode::ServerFull => {
            DisconnectReason::Kicked
        }
    }
}
