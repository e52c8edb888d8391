/*!
Beacon Metrics

Scope:
- Counters for handshake outcomes and the open-session gauge of one host.
- Periodic dump to the log (trace level recommended), driven by the host's
  `flush` phase instead of a wall-clock system.

Logging Target:
- beacon::metrics
*/

use std::time::{Duration, Instant};

use crate::protocol::FailureCode;

/// Core beacon metric counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BeaconMetrics {
    // Handshake outcomes
    pub handshake_success: u64,
    pub handshake_fail_version: u64,
    pub handshake_fail_encryption: u64,
    pub handshake_fail_auth: u64,
    pub handshake_fail_join: u64,
    pub handshake_fail_capacity: u64,
    pub handshake_fail_protocol: u64,
    pub handshake_timeout: u64,

    // Sessions currently in an active set
    pub active_sessions: u64,
}

impl BeaconMetrics {
    pub fn reset(&mut self) {
        *self = BeaconMetrics::default();
    }

    /// Counts a handshake that ended with `Failure { code }` sent by the host.
    pub fn record_failure(&mut self, code: FailureCode) {
        let counter = match code {
            FailureCode::UnsupportedVersion => &mut self.handshake_fail_version,
            FailureCode::EncryptionFailed => &mut self.handshake_fail_encryption,
            FailureCode::AuthFailed => &mut self.handshake_fail_auth,
            FailureCode::JoinRejected | FailureCode::UnknownBeaconType => &mut self.handshake_fail_join,
            FailureCode::ServerFull => &mut self.handshake_fail_capacity,
            FailureCode::ProtocolViolation | FailureCode::Malformed => &mut self.handshake_fail_protocol,
            // shutdown is not a handshake outcome
            FailureCode::ShuttingDown => return,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn record_timeout(&mut self) {
        self.handshake_timeout = self.handshake_timeout.saturating_add(1);
    }

    pub fn session_opened(&mut self) {
        self.handshake_success = self.handshake_success.saturating_add(1);
        self.active_sessions = self.active_sessions.saturating_add(1);
    }

    pub fn session_closed(&mut self) {
        self.active_sessions = self.active_sessions.saturating_sub(1);
    }

    pub fn total_failures(&self) -> u64 {
        self.handshake_fail_version
            + self.handshake_fail_encryption
            + self.handshake_fail_auth
            + self.handshake_fail_join
            + self.handshake_fail_capacity
            + self.handshake_fail_protocol
            + self.handshake_timeout
    }
}

/// Controls the metrics dump cadence.
#[derive(Debug)]
pub struct MetricsDumpTimer {
    pub interval: Duration,
    pub last: Option<Instant>,
}

impl MetricsDumpTimer {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Logs `metrics` if at least `interval` passed since the previous dump.
    /// Returns true when a dump happened.
    pub fn maybe_dump(&mut self, metrics: &BeaconMetrics, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last = Some(now);

        tracing::trace!(
            target: "beacon::metrics",
            "metrics: hs_ok={} hs_ver={} hs_enc={} hs_auth={} hs_join={} hs_full={} hs_proto={} hs_timeout={} active_sessions={}",
            metrics.handshake_success,
            metrics.handshake_fail_version,
            metrics.handshake_fail_encryption,
            metrics.handshake_fail_auth,
            metrics.handshake_fail_join,
            metrics.handshake_fail_capacity,
            metrics.handshake_fail_protocol,
            metrics.handshake_timeout,
            metrics.active_sessions
        );
        true
    }
}

impl Default for MetricsDumpTimer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
