//! Beacon-Typ-Controller und hostseitige Sessions.
//!
//! A [`BeaconHostObject`] owns the active sessions of one beacon type. Sessions
//! are shared as `Arc<HostSession>` with application code; each session keeps a
//! weak handle to the host's command queue so it can ask for a disconnect or send
//! a payload without owning the host.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use beacon_shared::error::BeaconError;
use beacon_shared::ids::{ConnectionId, PlayerId, SessionId};
use beacon_shared::state::BeaconConnectionState;

/// Request queued by a session for the owning host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    Disconnect(ConnectionId),
    Send(ConnectionId, Vec<u8>),
}

/// Queue drained by the host at the start of every dispatch.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    commands: Mutex<VecDeque<SessionCommand>>,
}

impl CommandQueue {
    pub(crate) fn push(&self, command: SessionCommand) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(command);
    }

    pub(crate) fn drain(&self) -> Vec<SessionCommand> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

/// Host-side session object, created once a client acknowledged its id.
pub struct HostSession {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub player_id: PlayerId,
    pub beacon_type: String,
    state: Mutex<BeaconConnectionState>,
    closing: AtomicBool,
    commands: Weak<CommandQueue>,
}

impl fmt::Debug for HostSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSession")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .field("player_id", &self.player_id)
            .field("beacon_type", &self.beacon_type)
            .field("state", &self.state())
            .finish()
    }
}

impl HostSession {
    pub(crate) fn new(
        session_id: SessionId,
        connection_id: ConnectionId,
        player_id: PlayerId,
        beacon_type: String,
        commands: Weak<CommandQueue>,
    ) -> Self {
        Self {
            session_id,
            connection_id,
            player_id,
            beacon_type,
            state: Mutex::new(BeaconConnectionState::Open),
            closing: AtomicBool::new(false),
            commands,
        }
    }

    pub fn state(&self) -> BeaconConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once the link is gone but the disconnect notification is still pending.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closing(&self, final_state: BeaconConnectionState) {
        self.closing.store(true, Ordering::Release);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = final_state;
    }

    /// Asks the host to drop this session on its next dispatch.
    /// Returns false if the host is already gone.
    pub fn request_disconnect(&self) -> bool {
        match self.commands.upgrade() {
            Some(queue) if !self.is_closing() => {
                queue.push(SessionCommand::Disconnect(self.connection_id));
                true
            }
            _ => false,
        }
    }

    /// Queues an application payload for the client.
    pub fn send_message(&self, payload: impl Into<Vec<u8>>) -> Result<(), BeaconError> {
        if self.is_closing() {
            return Err(BeaconError::NotOpen);
        }
        let queue = self.commands.upgrade().ok_or(BeaconError::NotOpen)?;
        queue.push(SessionCommand::Send(self.connection_id, payload.into()));
        Ok(())
    }
}

/// A `Join` that passed registry and capacity checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub connection_id: ConnectionId,
    pub beacon_type: String,
    pub player_id: PlayerId,
    pub login_options: String,
}

/// Application hooks of one beacon type.
pub trait HostObjectHandler: Send {
    /// A new session finished its handshake.
    fn on_client_connected(&mut self, session: &Arc<HostSession>);

    /// The session's link is gone. Called exactly once per session.
    fn notify_client_disconnected(&mut self, session: &Arc<HostSession>);

    /// Last chance to refuse a join. Runs after authentication.
    fn verify_join(&mut self, _request: &JoinRequest) -> bool {
        true
    }

    fn on_message(&mut self, _session: &Arc<HostSession>, _payload: &[u8]) {}
}

/// Per beacon type controller registered with a host.
pub struct BeaconHostObject {
    beacon_type: String,
    handler: Box<dyn HostObjectHandler>,
    active: Vec<Arc<HostSession>>,
}

impl fmt::Debug for BeaconHostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeaconHostObject")
            .field("beacon_type", &self.beacon_type)
            .field("active", &self.active.len())
            .finish()
    }
}

impl BeaconHostObject {
    pub fn new(beacon_type: impl Into<String>, handler: impl HostObjectHandler + 'static) -> Self {
        Self {
            beacon_type: beacon_type.into(),
            handler: Box::new(handler),
            active: Vec::new(),
        }
    }

    pub fn beacon_type(&self) -> &str {
        &self.beacon_type
    }

    pub fn active_sessions(&self) -> &[Arc<HostSession>] {
        &self.active
    }

    /// Sessions that are not waiting for their disconnect notification.
    pub fn open_session_count(&self) -> usize {
        self.active.iter().filter(|session| !session.is_closing()).count()
    }

    pub(crate) fn verify_join(&mut self, request: &JoinRequest) -> bool {
        self.handler.verify_join(request)
    }

    pub(crate) fn spawn_session(&mut self, session: HostSession) -> Arc<HostSession> {
        let session = Arc::new(session);
        self.active.push(Arc::clone(&session));
        tracing::info!(
            target: "beacon::host::session",
            session = %session.session_id,
            player = %session.player_id,
            beacon_type = %self.beacon_type,
            "client connected"
        );
        self.handler.on_client_connected(&session);
        session
    }

    /// Removes `session` from the active set and notifies the handler.
    /// Returns false if it was not (or no longer) part of this object.
    pub(crate) fn remove_session(&mut self, session: &Arc<HostSession>) -> bool {
        let Some(index) = self.active.iter().position(|s| Arc::ptr_eq(s, session)) else {
            return false;
        };
        let session = self.active.remove(index);
        tracing::info!(
            target: "beacon::host::session",
            session = %session.session_id,
            player = %session.player_id,
            "client disconnected"
        );
        self.handler.notify_client_disconnected(&session);
        true
    }

    pub(crate) fn on_message(&mut self, session: &Arc<HostSession>, payload: &[u8]) {
        self.handler.on_message(session, payload);
    }
}
