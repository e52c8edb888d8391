/*!
Federation Crate

Verbindet mehrere Prozesse zu einem Mesh:
- jeder Knoten hört mit einem eigenen `BeaconHost` auf eingehende Peers,
- und hält pro konfiguriertem Peer einen `BeaconClient` mit Back-off.

Driven like the host and client: call `dispatch(now)` and `flush(now)` once per tick.
*/

pub mod backoff;
pub mod node;

pub use backoff::Backoff;
pub use node::{FederationHooks, FederationNode, NodeEvent, PeerState};

pub mod prelude {
    pub use crate::{FederationHooks, FederationNode, NodeEvent, PeerState};
}
