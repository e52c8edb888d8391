/*!
Beacon Host Crate

Hostseite des Beacon-Protokolls:
- `BeaconHost`: Listener + Handshake-State-Machine für eingehende Verbindungen.
- `ConnectionState`: Fortschritt und Timeout einer einzelnen Verbindung.
- `BeaconRegistry` / `BeaconHostObject`: Beacon-Typen und ihre aktiven Sessions.

The host is driven by the caller's tick: `dispatch(now)` then `flush(now)`.
*/

pub mod connection_state;
pub mod host;
pub mod host_object;
pub mod registry;

pub use connection_state::{Awaiting, ConnectionState, HandshakeTimer};
pub use host::{BeaconHost, HostEvent};
pub use host_object::{BeaconHostObject, HostObjectHandler, HostSession, JoinRequest};
pub use registry::BeaconRegistry;

pub mod prelude {
    pub use crate::{BeaconHost, BeaconHostObject, HostEvent, HostObjectHandler, HostSession, JoinRequest};
}
