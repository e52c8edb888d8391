/*!
Beacon Client Crate

Clientseite des Beacon-Protokolls:
- `BeaconClient`: verbindet sich mit einem Host und durchläuft den Handshake.
- `ClientDelegate`: Callbacks der Anwendung (verbunden, fehlgeschlagen, Nachricht).

Like the host, the client is driven by the caller's tick: `dispatch(now)` then `flush(now)`.
*/

pub mod client;

pub use client::{BeaconClient, ClientContext, ClientDelegate};

pub mod prelude {
    pub use crate::{BeaconClient, ClientContext, ClientDelegate};
}
