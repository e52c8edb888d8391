/*!
Federation Node

Scope:
- One `BeaconHost` for inbound peers, one `BeaconClient` per configured outbound peer.
- Peer slots cycle through Idle -> Connecting -> Connected; failures park the slot in
  `Backoff { until }` with an exponentially growing delay. A successful connect resets it.
- Delegates report back through an unbounded channel; the node applies their signals
  in its own `dispatch` / `flush`.

Logging Target:
- beacon::federation
*/

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use beacon_client::{BeaconClient, ClientContext, ClientDelegate};
use beacon_host::{BeaconHost, BeaconHostObject, HostObjectHandler, HostSession};
use beacon_shared::config::FederationConfig;
use beacon_shared::error::{BeaconError, FailureInfo};
use beacon_shared::ids::{PlayerId, SessionId};
use beacon_shared::negotiation::{AuthVerifier, EncryptionHooks};
use beacon_shared::transport::TransportFactory;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;

/// Negotiation hooks shared by the node's host and all of its outbound clients.
#[derive(Clone, Default)]
pub struct FederationHooks {
    pub encryption: EncryptionHooks,
    pub auth: Option<Arc<dyn AuthVerifier>>,
}

impl std::fmt::Debug for FederationHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationHooks")
            .field("encryption", &self.encryption)
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

/// Lifecycle of an outbound peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    Backoff { until: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    PeerConnected { addr: String },
    /// An outbound link that was connected went away.
    PeerDisconnected { addr: String },
    PeerRetryScheduled { addr: String, attempt: u32, delay: Duration },
    InboundPeerConnected { node: PlayerId },
    InboundPeerDisconnected { node: PlayerId },
    /// Payload from an outbound peer (`from` = address) or an inbound one (`from` = node name).
    Message { from: String, payload: Vec<u8> },
}

/// What delegates report back to the node.
#[derive(Debug)]
enum Signal {
    PeerConnected { addr: String, attempt: u64 },
    PeerFailed { addr: String, attempt: u64, failure: FailureInfo },
    PeerMessage { addr: String, payload: Vec<u8> },
    InboundJoined(Arc<HostSession>),
    InboundLeft(Arc<HostSession>),
    InboundMessage { node: PlayerId, payload: Vec<u8> },
}

struct PeerDelegate {
    addr: String,
    attempt: u64,
    signals: UnboundedSender<Signal>,
}

impl ClientDelegate for PeerDelegate {
    fn on_connected(&mut self, _ctx: &mut ClientContext) {
        let _ = self.signals.send(Signal::PeerConnected {
            addr: self.addr.clone(),
            attempt: self.attempt,
        });
    }

    fn on_failure(&mut self, _ctx: &mut ClientContext, failure: &FailureInfo) {
        let _ = self.signals.send(Signal::PeerFailed {
            addr: self.addr.clone(),
            attempt: self.attempt,
            failure: failure.clone(),
        });
    }

    fn on_message(&mut self, _ctx: &mut ClientContext, payload: &[u8]) {
        let _ = self.signals.send(Signal::PeerMessage {
            addr: self.addr.clone(),
            payload: payload.to_vec(),
        });
    }
}

struct InboundHandler {
    signals: UnboundedSender<Signal>,
}

impl HostObjectHandler for InboundHandler {
    fn on_client_connected(&mut self, session: &Arc<HostSession>) {
        let _ = self.signals.send(Signal::InboundJoined(Arc::clone(session)));
    }

    fn notify_client_disconnected(&mut self, session: &Arc<HostSession>) {
        let _ = self.signals.send(Signal::InboundLeft(Arc::clone(session)));
    }

    fn on_message(&mut self, session: &Arc<HostSession>, payload: &[u8]) {
        let _ = self.signals.send(Signal::InboundMessage {
            node: session.player_id.clone(),
            payload: payload.to_vec(),
        });
    }
}

struct PeerSlot {
    state: PeerState,
    consecutive_failures: u32,
    /// Id of the current connect attempt; signals of older attempts are ignored.
    attempt: u64,
    client: Option<BeaconClient>,
}

/// One process in the federation mesh.
pub struct FederationNode {
    config: FederationConfig,
    transport: Arc<dyn TransportFactory>,
    hooks: FederationHooks,
    host: BeaconHost,
    peers: BTreeMap<String, PeerSlot>,
    inbound: BTreeMap<SessionId, Arc<HostSession>>,
    backoff: Backoff,
    next_attempt: u64,
    signal_tx: UnboundedSender<Signal>,
    signal_rx: UnboundedReceiver<Signal>,
    event_tx: UnboundedSender<NodeEvent>,
    event_rx: Option<UnboundedReceiver<NodeEvent>>,
    started: bool,
}

impl std::fmt::Debug for FederationNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationNode")
            .field("node", &self.config.node_name)
            .field("listen_addr", &self.config.listen_addr)
            .field("peers", &self.peers.len())
            .field("inbound", &self.inbound.len())
            .field("started", &self.started)
            .finish()
    }
}

impl FederationNode {
    pub fn new(
        config: FederationConfig,
        transport: Arc<dyn TransportFactory>,
        hooks: FederationHooks,
    ) -> Result<Self, BeaconError> {
        config.validate()?;

        let mut host_config = config.host.clone();
        host_config.listen_addr = config.listen_addr.clone();
        let mut host = BeaconHost::new(host_config, Arc::clone(&transport)).with_encryption(hooks.encryption.clone());
        host.set_auth_verifier(hooks.auth.clone());

        let (signal_tx, signal_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded_channel();
        host.register_host(BeaconHostObject::new(
            config.beacon_type.clone(),
            InboundHandler {
                signals: signal_tx.clone(),
            },
        ))?;

        Ok(Self {
            backoff: Backoff::new(config.retry_base(), config.retry_max()),
            config,
            transport,
            hooks,
            host,
            peers: BTreeMap::new(),
            inbound: BTreeMap::new(),
            next_attempt: 0,
            signal_tx,
            signal_rx,
            event_tx,
            event_rx: Some(event_rx),
            started: false,
        })
    }

    /// Starts listening and queues a connect to every configured peer.
    pub fn start(&mut self) -> Result<(), BeaconError> {
        if self.started {
            return Err(BeaconError::AlreadyInitialized);
        }
        self.host.init_host()?;
        self.started = true;
        for addr in self.config.peers.clone() {
            self.add_peer(addr);
        }
        info!(
            target: "beacon::federation",
            node = %self.config.node_name,
            addr = %self.config.listen_addr,
            peers = self.peers.len(),
            "federation node started"
        );
        Ok(())
    }

    /// Adds an outbound peer; the first attempt happens on the next dispatch.
    /// Returns false for the node's own address or a known peer.
    pub fn add_peer(&mut self, addr: impl Into<String>) -> bool {
        let addr = addr.into();
        if addr == self.config.listen_addr || self.peers.contains_key(&addr) {
            return false;
        }
        debug!(target: "beacon::federation", %addr, "peer added");
        self.peers.insert(
            addr,
            PeerSlot {
                state: PeerState::Idle,
                consecutive_failures: 0,
                attempt: 0,
                client: None,
            },
        );
        true
    }

    /// Drops an outbound peer. Its link is closed without a failure report.
    pub fn remove_peer(&mut self, addr: &str) -> bool {
        let Some(mut slot) = self.peers.remove(addr) else {
            return false;
        };
        if let Some(client) = slot.client.as_mut() {
            client.destroy_beacon();
        }
        if slot.state == PeerState::Connected {
            self.emit(NodeEvent::PeerDisconnected { addr: addr.to_string() });
        }
        debug!(target: "beacon::federation", %addr, "peer removed");
        true
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn host(&self) -> &BeaconHost {
        &self.host
    }

    pub fn peer_state(&self, addr: &str) -> Option<PeerState> {
        self.peers.get(addr).map(|slot| slot.state)
    }

    pub fn consecutive_failures(&self, addr: &str) -> Option<u32> {
        self.peers.get(addr).map(|slot| slot.consecutive_failures)
    }

    /// Addresses of outbound peers with an open session.
    pub fn connected_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, slot)| slot.state == PeerState::Connected)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Node names of peers connected to our host.
    pub fn inbound_peers(&self) -> Vec<PlayerId> {
        self.inbound.values().map(|session| session.player_id.clone()).collect()
    }

    /// Sends `payload` over every open outbound link. Returns the number of peers reached.
    pub fn broadcast(&mut self, payload: &[u8]) -> usize {
        let mut sent = 0;
        for (addr, slot) in &mut self.peers {
            let Some(client) = slot.client.as_mut() else {
                continue;
            };
            match client.send_message(payload.to_vec()) {
                Ok(()) => sent += 1,
                Err(err) => trace!(target: "beacon::federation", %addr, %err, "broadcast skipped"),
            }
        }
        sent
    }

    pub fn take_event_receiver(&mut self) -> Option<UnboundedReceiver<NodeEvent>> {
        self.event_rx.take()
    }

    pub fn drain_events(&mut self) -> Vec<NodeEvent> {
        let mut out = Vec::new();
        if let Some(rx) = self.event_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                out.push(event);
            }
        }
        out
    }

    // ---------------------------------------------------------------------------------------------
    // Tick phases
    // ---------------------------------------------------------------------------------------------

    pub fn dispatch(&mut self, now: Instant) {
        if !self.started {
            return;
        }
        self.host.dispatch(now);

        let due: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, slot)| match slot.state {
                PeerState::Idle => true,
                PeerState::Backoff { until } => now >= until,
                PeerState::Connecting | PeerState::Connected => false,
            })
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in due {
            if let Err(err) = self.open_peer_link(&addr) {
                debug!(target: "beacon::federation", %addr, "{err:#}");
            }
        }

        for slot in self.peers.values_mut() {
            if let Some(client) = slot.client.as_mut() {
                client.dispatch(now);
            }
        }
        self.apply_signals(now);
    }

    pub fn flush(&mut self, now: Instant) {
        if !self.started {
            return;
        }
        self.host.flush(now);
        for slot in self.peers.values_mut() {
            if let Some(client) = slot.client.as_mut() {
                client.flush(now);
            }
        }
        self.apply_signals(now);
        for event in self.host.drain_events() {
            trace!(target: "beacon::federation", ?event, "host event");
        }
    }

    /// Closes every outbound link and shuts the host down. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        info!(target: "beacon::federation", node = %self.config.node_name, "federation node shutting down");

        let mut disconnected = Vec::new();
        for (addr, slot) in &mut self.peers {
            if let Some(mut client) = slot.client.take() {
                client.destroy_beacon();
            }
            if slot.state == PeerState::Connected {
                disconnected.push(addr.clone());
            }
            slot.state = PeerState::Idle;
            slot.consecutive_failures = 0;
        }
        for addr in disconnected {
            self.emit(NodeEvent::PeerDisconnected { addr });
        }

        self.host.shutdown();
        while let Ok(signal) = self.signal_rx.try_recv() {
            if let Signal::InboundLeft(session) = signal {
                if self.inbound.remove(&session.session_id).is_some() {
                    self.emit(NodeEvent::InboundPeerDisconnected {
                        node: session.player_id.clone(),
                    });
                }
            }
        }
        self.inbound.clear();
    }

    // ---------------------------------------------------------------------------------------------
    // Peer bookkeeping
    // ---------------------------------------------------------------------------------------------

    fn open_peer_link(&mut self, addr: &str) -> anyhow::Result<()> {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let slot = self
            .peers
            .get_mut(addr)
            .with_context(|| format!("unknown peer {addr}"))?;

        let delegate = PeerDelegate {
            addr: addr.to_string(),
            attempt,
            signals: self.signal_tx.clone(),
        };
        let mut client = BeaconClient::new(self.config.client.clone(), Arc::clone(&self.transport), delegate)
            .with_encryption(self.hooks.encryption.clone());

        slot.attempt = attempt;
        slot.state = PeerState::Connecting;
        // a failed init still reports through the delegate, which schedules the retry
        let result = client.init(
            addr,
            PlayerId::new(self.config.node_name.clone()),
            self.config.beacon_type.clone(),
        );
        slot.client = Some(client);
        result.with_context(|| format!("connecting to peer {addr} (attempt {attempt})"))?;
        debug!(target: "beacon::federation", %addr, attempt, "peer link opening");
        Ok(())
    }

    fn apply_signals(&mut self, now: Instant) {
        while let Ok(signal) = self.signal_rx.try_recv() {
            match signal {
                Signal::PeerConnected { addr, attempt } => {
                    let Some(slot) = self.peers.get_mut(&addr).filter(|slot| slot.attempt == attempt) else {
                        continue;
                    };
                    slot.state = PeerState::Connected;
                    slot.consecutive_failures = 0;
                    info!(target: "beacon::federation", %addr, "peer connected");
                    self.emit(NodeEvent::PeerConnected { addr });
                }
                Signal::PeerFailed { addr, attempt, failure } => self.on_peer_failed(addr, attempt, &failure, now),
                Signal::PeerMessage { addr, payload } => {
                    self.emit(NodeEvent::Message { from: addr, payload });
                }
                Signal::InboundJoined(session) => {
                    info!(target: "beacon::federation", node = %session.player_id, "inbound peer joined");
                    let node = session.player_id.clone();
                    self.inbound.insert(session.session_id, session);
                    self.emit(NodeEvent::InboundPeerConnected { node });
                }
                Signal::InboundLeft(session) => {
                    if self.inbound.remove(&session.session_id).is_some() {
                        info!(target: "beacon::federation", node = %session.player_id, "inbound peer left");
                        self.emit(NodeEvent::InboundPeerDisconnected {
                            node: session.player_id.clone(),
                        });
                    }
                }
                Signal::InboundMessage { node, payload } => {
                    self.emit(NodeEvent::Message {
                        from: node.as_str().to_string(),
                        payload,
                    });
                }
            }
        }
    }

    fn on_peer_failed(&mut self, addr: String, attempt: u64, failure: &FailureInfo, now: Instant) {
        let Some(slot) = self.peers.get_mut(&addr).filter(|slot| slot.attempt == attempt) else {
            return;
        };
        let was_connected = slot.state == PeerState::Connected;
        if let Some(mut client) = slot.client.take() {
            client.destroy_beacon();
        }

        let delay = self.backoff.delay(slot.consecutive_failures);
        slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
        slot.state = PeerState::Backoff { until: now + delay };
        let failures = slot.consecutive_failures;

        // keep persistently unreachable peers from flooding the log
        if failures <= 3 {
            warn!(target: "beacon::federation", %addr, attempt = failures, ?delay, reason = %failure.reason, "peer link failed, will retry");
        } else if failures % 30 == 0 {
            warn!(target: "beacon::federation", %addr, attempt = failures, ?delay, "peer still unreachable");
        } else {
            debug!(target: "beacon::federation", %addr, attempt = failures, ?delay, "peer link failed");
        }

        if was_connected {
            self.emit(NodeEvent::PeerDisconnected { addr: addr.clone() });
        }
        self.emit(NodeEvent::PeerRetryScheduled {
            addr,
            attempt: failures,
            delay,
        });
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for FederationNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}
