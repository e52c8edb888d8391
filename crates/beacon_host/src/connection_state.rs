//! Handshake-Fortschritt einer eingehenden Verbindung.
//!
//! One [`ConnectionState`] exists per inbound link from accept until the link
//! closes. Progress flags are monotonic; the host consults
//! [`ConnectionState::admits`] before acting on a control message so an
//! out-of-order or repeated step is treated as a protocol violation instead of
//! being silently reordered.

use std::time::{Duration, Instant};

use beacon_shared::ids::{ConnectionId, PlayerId, SessionId};
use beacon_shared::negotiation::EncryptionData;
use beacon_shared::protocol::ControlMessageKind;

/// Callback the handshake is currently suspended on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Awaiting {
    #[default]
    Nothing,
    EncryptionToken,
    Authentication,
}

/// Why a control message was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepViolation {
    /// A negotiation callback is still outstanding.
    Suspended(Awaiting),
    /// The message is out of order, repeated, or never valid from a client.
    OutOfOrder(ControlMessageKind),
}

impl std::fmt::Display for StepViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Suspended(awaiting) => write!(f, "message while awaiting {awaiting:?}"),
            Self::OutOfOrder(kind) => write!(f, "unexpected {}", kind.label()),
        }
    }
}

/// Deadline for the next forward step of a handshake.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeTimer {
    window: Option<Duration>,
    deadline: Option<Instant>,
}

impl HandshakeTimer {
    pub fn new(window: Option<Duration>) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// (Re)starts the window at `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = self.window.map(|window| now + window);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Host-side record of which handshake steps a connection has completed.
#[derive(Debug)]
pub struct ConnectionState {
    pub connection_id: ConnectionId,
    pub sent_hello: bool,
    pub sent_challenge: bool,
    pub sent_login: bool,
    pub sent_welcome: bool,
    pub set_netspeed: bool,
    pub authenticated: bool,
    pub joined: bool,
    pub completed_ack: bool,
    pub awaiting: Awaiting,
    /// Player announced in `Login`, confirmed once `authenticated` is set.
    pub player_id: Option<PlayerId>,
    pub net_speed: Option<u32>,
    pub beacon_type: Option<String>,
    /// Id sent in `AssignId`, expected back in `IdAck`.
    pub assigned_session: Option<SessionId>,
    pub encryption: Option<EncryptionData>,
    pub timer: HandshakeTimer,
}

impl ConnectionState {
    /// Creates the record and starts the handshake timer.
    pub fn new(connection_id: ConnectionId, timeout: Option<Duration>, now: Instant) -> Self {
        let mut timer = HandshakeTimer::new(timeout);
        timer.arm(now);
        Self {
            connection_id,
            sent_hello: false,
            sent_challenge: false,
            sent_login: false,
            sent_welcome: false,
            set_netspeed: false,
            authenticated: false,
            joined: false,
            completed_ack: false,
            awaiting: Awaiting::Nothing,
            player_id: None,
            net_speed: None,
            beacon_type: None,
            assigned_session: None,
            encryption: None,
            timer,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.awaiting != Awaiting::Nothing
    }

    pub fn is_complete(&self) -> bool {
        self.joined && self.completed_ack
    }

    /// Checks whether a control message of `kind` may be handled now.
    ///
    /// `Failure` is always admitted; the host treats it as a close.
    pub fn admits(&self, kind: ControlMessageKind) -> Result<(), StepViolation> {
        if kind == ControlMessageKind::Failure {
            return Ok(());
        }
        if self.is_suspended() {
            return Err(StepViolation::Suspended(self.awaiting));
        }
        let ok = match kind {
            ControlMessageKind::Hello => !self.sent_hello,
            ControlMessageKind::Login => self.sent_challenge && !self.sent_login,
            ControlMessageKind::Netspeed => self.sent_welcome && !self.completed_ack,
            ControlMessageKind::Join => self.sent_welcome && !self.joined,
            ControlMessageKind::IdAck => self.joined && !self.completed_ack,
            // host-to-client messages
            ControlMessageKind::EncryptionAck
            | ControlMessageKind::Welcome
            | ControlMessageKind::Challenge
            | ControlMessageKind::AssignId => false,
            ControlMessageKind::Failure => true,
        };
        if ok {
            Ok(())
        } else {
            Err(StepViolation::OutOfOrder(kind))
        }
    }

    /// Marks forward progress and restarts the timeout window.
    pub fn progress(&mut self, now: Instant) {
        if !self.completed_ack {
            self.timer.arm(now);
        }
    }

    /// Called on `IdAck`; the handshake timer is no longer needed.
    pub fn complete(&mut self) {
        self.completed_ack = true;
        self.timer.cancel();
    }
}
