//! Application-visible connection status of a beacon session.

use serde::{Deserialize, Serialize};

/// Coarse state exposed to application code.
///
/// `Invalid` is both the initial and the failure-terminal state. `Closed` is only
/// reached through a clean, locally initiated teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BeaconConnectionState {
    #[default]
    Invalid,
    Closed,
    Pending,
    Open,
}

impl BeaconConnectionState {
    /// Returns true while the handshake is running or the session is usable.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Open)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Closed => "closed",
            Self::Pending => "pending",
            Self::Open => "open",
        }
    }
}

impl std::fmt::Display for BeaconConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
