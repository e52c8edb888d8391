//! Gemeinsame Bausteine für Beacon-Host, Beacon-Client und Federation.
//!
//! Beacons are a side channel next to the main game connection: a host listens,
//! clients run a short control handshake and end up with a typed session that can
//! carry opaque request/response payloads.

/// Configuration structs (TOML)
pub mod config;
/// Shared error types
pub mod error;
/// Strongly typed ids
pub mod ids;
/// Metric counters
pub mod metrics;
/// Encryption / authentication hooks
pub mod negotiation;
/// Frames and codec
pub mod protocol;
/// Tick scheduler and manual clock
pub mod scheduler;
/// Connection state exposed to application code
pub mod state;
/// Transport traits and the loopback network
pub mod transport;

pub use config::{ClientConfig, EncryptionConfig, FederationConfig, HostConfig};
pub use error::{BeaconError, ConfigError, DisconnectReason, FailureInfo, NegotiationError, TransportError};
pub use ids::{ConnectionId, IdGenerator, PlayerId, SessionId};
pub use negotiation::{
    AuthRequest, AuthResult, AuthVerifier, Completion, EncryptionData, EncryptionFailureAction,
    EncryptionHooks, NegotiationSide, NetworkEncryption,
};
pub use scheduler::{ManualClock, TickScheduler};
pub use state::BeaconConnectionState;
