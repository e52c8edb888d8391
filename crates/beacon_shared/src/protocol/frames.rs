//! Beacon Frame Definitions
//!
//! Scope:
//! - Control messages that drive the beacon handshake (Hello .. IdAck) plus
//!   failure reporting.
//! - Session RPCs that flow once the handshake is complete.
//! - Transport utility frames (Ping / Pong keep-alive).
//!
//! Encoding / Framing:
//! - These logical frames are wrapped by a length-prefix + bincode codec (see `codec.rs`).
//!
//! Separation of Concerns:
//! - This module only declares data structures (no I/O logic).
//! - Host state machine lives in `beacon_host`, the client mirror in `beacon_client`.
//!
//! Versioning Strategy:
//! - `Hello.version` is compared against `SUPPORTED_VERSIONS` by the host.
//! - New variants are only ever appended at the end of each enum.
//!
//! Logging Targets:
//! - beacon::frames (encode/decode events, only enable at trace/debug)

use serde::{Deserialize, Serialize};

use crate::ids::{PlayerId, SessionId};

/// Protocol versions a host accepts in `Hello`.
pub const SUPPORTED_VERSIONS: &[u16] = &[1];

/// Version a client announces by default.
pub const PROTOCOL_VERSION: u16 = 1;

/// Failure categories carried by `ControlMessage::Failure`.
/// Keep codes stable for client-side mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FailureCode {
    UnsupportedVersion = 1,
    EncryptionFailed = 2,
    AuthFailed = 3,
    JoinRejected = 4,
    UnknownBeaconType = 5,
    ServerFull = 6,
    ProtocolViolation = 7,
    Malformed = 8,
    ShuttingDown = 9,
}

impl FailureCode {
    /// Human readable short label (stable).
    pub fn label(self) -> &'static str {
        match self {
            Self::UnsupportedVersion => "unsupported_version",
            Self::EncryptionFailed => "encryption_failed",
            Self::AuthFailed => "auth_failed",
            Self::JoinRejected => "join_rejected",
            Self::UnknownBeaconType => "unknown_beacon_type",
            Self::ServerFull => "server_full",
            Self::ProtocolViolation => "protocol_violation",
            Self::Malformed => "malformed",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Stable one-byte discriminant of a control message, used for traces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlMessageKind {
    Hello = 0,
    EncryptionAck = 1,
    Welcome = 2,
    Challenge = 3,
    Login = 4,
    Netspeed = 5,
    Join = 6,
    AssignId = 7,
    IdAck = 8,
    Failure = 9,
}

impl ControlMessageKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::EncryptionAck => "encryption_ack",
            Self::Welcome => "welcome",
            Self::Challenge => "challenge",
            Self::Login => "login",
            Self::Netspeed => "netspeed",
            Self::Join => "join",
            Self::AssignId => "assign_id",
            Self::IdAck => "id_ack",
            Self::Failure => "failure",
        }
    }
}

/// Messages exchanged while promoting a raw link to an open session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMessage {
    /// First packet from the client.
    Hello {
        version: u16,
        /// Identifier of the encryption key the client wants to use, if any.
        encryption_identifier: Option<String>,
    },
    /// Host accepted the encryption identifier. Always precedes Welcome / Challenge.
    EncryptionAck,
    /// Host is ready for Netspeed + Join.
    Welcome,
    /// Host requires a Login before it sends Welcome.
    Challenge { nonce: String },
    Login {
        player_id: PlayerId,
        login_options: String,
        auth_token: Option<String>,
    },
    /// Bandwidth hint in bytes per second.
    Netspeed { rate: u32 },
    Join {
        beacon_type: String,
        player_id: PlayerId,
        login_options: String,
    },
    AssignId { session_id: SessionId },
    IdAck { session_id: SessionId },
    /// Terminal failure. The sender closes the link right after.
    Failure { code: FailureCode, reason: String },
}

impl ControlMessage {
    pub fn kind(&self) -> ControlMessageKind {
        match self {
            Self::Hello { .. } => ControlMessageKind::Hello,
            Self::EncryptionAck => ControlMessageKind::EncryptionAck,
            Self::Welcome => ControlMessageKind::Welcome,
            Self::Challenge { .. } => ControlMessageKind::Challenge,
            Self::Login { .. } => ControlMessageKind::Login,
            Self::Netspeed { .. } => ControlMessageKind::Netspeed,
            Self::Join { .. } => ControlMessageKind::Join,
            Self::AssignId { .. } => ControlMessageKind::AssignId,
            Self::IdAck { .. } => ControlMessageKind::IdAck,
            Self::Failure { .. } => ControlMessageKind::Failure,
        }
    }
}

/// Calls made on the session object once the handshake has completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionRpc {
    /// Host tells the client session it is connected; completes the handshake.
    Connected,
    /// Opaque application payload.
    Message(Vec<u8>),
}

/// Transport utility frames, valid in any state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportFrame {
    /// Liveness probe – echoes back as Pong with same value.
    Ping(u64),
    /// Response to Ping – same opaque correlation value.
    Pong(u64),
}

/// Envelope for everything on a beacon link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Rpc(SessionRpc),
    Transport(TransportFrame),
}

impl Frame {
    /// Convenience constructor for a failure frame.
    pub fn failure(code: FailureCode, reason: impl Into<String>) -> Self {
        Frame::Control(ControlMessage::Failure {
            code,
            reason: reason.into(),
        })
    }

    pub fn control_kind(&self) -> Option<ControlMessageKind> {
        match self {
            Frame::Control(message) => Some(message.kind()),
            _ => None,
        }
    }
}

impl From<ControlMessage> for Frame {
    fn from(message: ControlMessage) -> Self {
        Frame::Control(message)
    }
}
