//! Shared error types.

use thiserror::Error;

use crate::protocol::frames::FailureCode;

/// Reasons why a transport link went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    AuthenticationFailed,
    ProtocolMismatch,
    TransportError,
}

/// Generic transport level error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not ready")]
    NotReady,
    #[error("transport connection closed")]
    NotConnected,
    #[error("configuration error: {0}")]
    InvalidConfig(&'static str),
    #[error("address {0} already in use")]
    AddressInUse(String),
    #[error("connection to {0} refused")]
    ConnectionRefused(String),
    #[error("other: {0}")]
    Other(String),
}

/// Frame encoding / decoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoded frame exceeds max_frame_bytes ({size} > {max})")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("frame too large: {size} > {max}")]
    IncomingTooLarge { size: u32, max: u32 },
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

/// Outcome of a negotiation round that did not produce a usable result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("negotiation callback dropped without completing")]
    Abandoned,
    #[error("no negotiation hook bound")]
    Unbound,
    #[error("negotiation rejected: {0}")]
    Rejected(String),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors returned synchronously from beacon APIs.
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("transport initialisation failed: {0}")]
    Transport(#[from] TransportError),
    #[error("beacon type '{0}' is already registered")]
    DuplicateBeaconType(String),
    #[error("beacon type '{0}' is not registered")]
    UnknownBeaconType(String),
    #[error("beacon is already initialised")]
    AlreadyInitialized,
    #[error("beacon is not initialised")]
    NotInitialized,
    #[error("session is not open")]
    NotOpen,
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

/// Failure details forwarded to application callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    /// Code carried by a `Failure` control message, if one was received.
    pub code: Option<FailureCode>,
    /// Human readable reason. Empty for timeouts and silent closes.
    pub reason: String,
}

impl FailureInfo {
    pub fn from_message(code: FailureCode, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }

    pub fn local(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            code: None,
            reason: String::new(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.code.is_none() && self.reason.is_empty()
    }
}
