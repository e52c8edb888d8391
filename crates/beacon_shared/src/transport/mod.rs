//! Transport collaborator used by beacon hosts and clients.
//!
//! The beacon layer only needs a reliable, ordered byte stream per peer with a
//! "connection closed" notification. Concrete transports implement the three
//! traits below; the in-process [`loopback`] network is used by tests and the
//! federation node.

use std::fmt::Debug;

use bytes::Bytes;

use crate::error::{DisconnectReason, TransportError};

pub mod loopback;

pub use loopback::{LoopbackNetwork, SocketMode};

pub type TransportResult<T> = Result<T, TransportError>;

/// Something that happened on a single link since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw bytes in send order. One event may carry several encoded frames.
    Data(Bytes),
    /// The remote end closed the link. No further events follow.
    Closed(DisconnectReason),
}

/// Creates listeners and outbound connections.
pub trait TransportFactory: Send + Sync + Debug {
    /// Binds a listener to `addr`.
    fn listen(&self, addr: &str) -> TransportResult<Box<dyn TransportListener>>;

    /// Opens a connection to a listener bound at `addr`.
    fn connect(&self, addr: &str) -> TransportResult<Box<dyn TransportConnection>>;
}

/// Listening endpoint owned by a beacon host.
pub trait TransportListener: Send + Debug {
    fn local_addr(&self) -> &str;

    /// Returns the next inbound connection, if any arrived.
    fn accept(&mut self) -> Option<Box<dyn TransportConnection>>;

    /// Stops accepting. Idempotent.
    fn close(&mut self);
}

/// One end of an established link.
pub trait TransportConnection: Send + Debug {
    /// Transport-level link id, unique per transport instance.
    fn id(&self) -> u64;

    /// Queues bytes for delivery.
    fn send(&mut self, payload: Bytes) -> TransportResult<()>;

    /// Drains received events into `out`.
    fn poll(&mut self, out: &mut Vec<LinkEvent>);

    /// Closes the link. The peer observes `LinkEvent::Closed(reason)`. Idempotent.
    fn close(&mut self, reason: DisconnectReason);

    fn is_open(&self) -> bool;
}
