//! Pluggable negotiation hooks (encryption key exchange, authentication).
//!
//! Every hook receives a [`Completion`] and must resolve it exactly once, either
//! before returning or on a later tick. Dropping an unresolved completion
//! resolves it with [`NegotiationError::Abandoned`], so a forgetful hook can never
//! leave a handshake suspended forever.
//!
//! Logging target: `beacon::negotiation`

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EncryptionConfig;
use crate::error::NegotiationError;
use crate::ids::{ConnectionId, PlayerId};

type CompletionFn<T> = Box<dyn FnOnce(Result<T, NegotiationError>) + Send>;

/// Move-only completion token handed to negotiation hooks.
pub struct Completion<T> {
    deliver: Option<CompletionFn<T>>,
}

impl<T> Completion<T> {
    pub fn new(deliver: impl FnOnce(Result<T, NegotiationError>) + Send + 'static) -> Self {
        Self {
            deliver: Some(Box::new(deliver)),
        }
    }

    /// Resolves the negotiation successfully.
    pub fn complete(self, value: T) {
        self.resolve(Ok(value));
    }

    /// Resolves the negotiation with an error.
    pub fn fail(self, error: NegotiationError) {
        self.resolve(Err(error));
    }

    pub fn resolve(mut self, result: Result<T, NegotiationError>) {
        if let Some(deliver) = self.deliver.take() {
            deliver(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(deliver) = self.deliver.take() {
            debug!(target: "beacon::negotiation", "completion dropped unresolved");
            deliver(Err(NegotiationError::Abandoned));
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("resolved", &self.deliver.is_none())
            .finish()
    }
}

/// Key material for one connection.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionData {
    pub identifier: String,
    pub key: Vec<u8>,
}

impl EncryptionData {
    pub fn new(identifier: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            identifier: identifier.into(),
            key: key.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.identifier.is_empty() && self.key.is_empty()
    }
}

impl fmt::Debug for EncryptionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log key bytes
        f.debug_struct("EncryptionData")
            .field("identifier", &self.identifier)
            .field("key_len", &self.key.len())
            .finish()
    }
}

/// What to do when a connection has no usable encryption data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionFailureAction {
    /// Use the configured default (`EncryptionConfig::default_failure_action`).
    #[default]
    Default,
    AllowConnection,
    RejectConnection,
}

impl EncryptionFailureAction {
    /// Replaces `Default` with `fallback`. A `Default` fallback resolves to reject.
    pub fn resolve(self, fallback: EncryptionFailureAction) -> EncryptionFailureAction {
        match (self, fallback) {
            (Self::Default, Self::Default) => Self::RejectConnection,
            (Self::Default, fallback) => fallback,
            (action, _) => action,
        }
    }
}

/// Side of the handshake a hook is invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationSide {
    Host,
    Client,
}

/// External encryption provider.
pub trait NetworkEncryption: Send + Sync {
    /// Host side: look up the key for `identifier` announced in `Hello`.
    fn host_token(&self, connection: ConnectionId, identifier: &str, done: Completion<EncryptionData>);

    /// Client side: look up the key after the host acknowledged `identifier`.
    fn client_ack(&self, identifier: &str, done: Completion<EncryptionData>);
}

/// Decides how to continue when no encryption data is available.
pub type EncryptionFailureHook = Arc<dyn Fn(NegotiationSide) -> EncryptionFailureAction + Send + Sync>;

/// Encryption hooks bound to one endpoint.
#[derive(Clone, Default)]
pub struct EncryptionHooks {
    provider: Option<Arc<dyn NetworkEncryption>>,
    failure: Option<EncryptionFailureHook>,
}

impl fmt::Debug for EncryptionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionHooks")
            .field("provider", &self.provider.is_some())
            .field("failure_hook", &self.failure.is_some())
            .finish()
    }
}

impl EncryptionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn NetworkEncryption>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_failure_hook(
        mut self,
        hook: impl Fn(NegotiationSide) -> EncryptionFailureAction + Send + Sync + 'static,
    ) -> Self {
        self.failure = Some(Arc::new(hook));
        self
    }

    pub fn unbind(&mut self) {
        self.provider = None;
        self.failure = None;
    }

    /// Asks the provider for the host key. An unbound provider fails immediately.
    pub fn request_host_token(&self, connection: ConnectionId, identifier: &str, done: Completion<EncryptionData>) {
        match &self.provider {
            Some(provider) => provider.host_token(connection, identifier, done),
            None => {
                warn!(target: "beacon::negotiation", %connection, "no encryption provider bound");
                done.fail(NegotiationError::Unbound);
            }
        }
    }

    /// Asks the provider for the client key. An unbound provider fails immediately.
    pub fn request_client_ack(&self, identifier: &str, done: Completion<EncryptionData>) {
        match &self.provider {
            Some(provider) => provider.client_ack(identifier, done),
            None => {
                warn!(target: "beacon::negotiation", "no encryption provider bound");
                done.fail(NegotiationError::Unbound);
            }
        }
    }

    /// Runs the failure hook for a connection without encryption data and
    /// returns whether the handshake may continue.
    ///
    /// The hook fires even when encryption is optional; its answer only
    /// matters when `config.required` is set. An unbound hook rejects.
    pub fn allow_without_encryption(&self, side: NegotiationSide, config: &EncryptionConfig) -> bool {
        let action = match &self.failure {
            Some(hook) => hook(side).resolve(config.default_failure_action),
            None => EncryptionFailureAction::RejectConnection,
        };
        let allowed = !config.required || action == EncryptionFailureAction::AllowConnection;
        debug!(target: "beacon::negotiation", ?side, ?action, required = config.required, allowed, "encryption failure policy");
        allowed
    }
}

/// Credentials presented by a client in `Login`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub connection: ConnectionId,
    pub player_id: PlayerId,
    pub login_options: String,
    pub auth_token: Option<String>,
}

/// Outcome of a credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    InvalidCredentials(String),
}

/// External authentication provider.
pub trait AuthVerifier: Send + Sync {
    fn start_verify_authentication(&self, request: AuthRequest, done: Completion<AuthResult>);
}
