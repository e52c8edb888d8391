//! Loopback transport for in-memory beacon links.
//!
//! Keeps hosts and clients in the same process without touching the network
//! stack. Bytes sent during a tick sit in the sender's pending queue until
//! [`LoopbackNetwork::flush`] moves them to the peer, so a message sent in tick N
//! is observed in tick N+1.
//!
//! Individual link ends can be degraded with [`SocketMode`] to simulate a peer
//! that stops talking (or stops listening) half way through a handshake.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{DisconnectReason, TransportError};

use super::{LinkEvent, TransportConnection, TransportFactory, TransportListener, TransportResult};

/// Degradation applied to one link end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketMode {
    #[default]
    Normal,
    /// Outbound data is silently dropped, inbound still arrives.
    ReceiveOnly,
    /// Outbound data is dropped and inbound events are withheld until the mode changes.
    Disabled,
}

#[derive(Debug, Default)]
struct LinkEnd {
    peer: u64,
    open: bool,
    /// Handle was dropped; removed after its pending queue has been flushed.
    released: bool,
    mode: SocketMode,
    pending: VecDeque<LinkEvent>,
    inbound: VecDeque<LinkEvent>,
}

#[derive(Debug, Default)]
struct ListenerState {
    open: bool,
    backlog: VecDeque<u64>,
}

#[derive(Debug)]
struct NetworkState {
    fail_init: bool,
    next_link: u64,
    listeners: HashMap<String, ListenerState>,
    links: HashMap<u64, LinkEnd>,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            fail_init: false,
            next_link: 1,
            listeners: HashMap::new(),
            links: HashMap::new(),
        }
    }
}

impl NetworkState {
    fn close_end(&mut self, id: u64, reason: DisconnectReason) {
        if let Some(end) = self.links.get_mut(&id) {
            if end.open {
                end.open = false;
                end.pending.push_back(LinkEvent::Closed(reason));
                trace!(target: "beacon::transport::loopback", link = id, ?reason, "link closed");
            }
        }
    }
}

/// Shared in-process network. Clones refer to the same network.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every following `listen` / `connect` fail, as if the socket subsystem were unavailable.
    pub fn set_fail_init(&self, fail: bool) {
        self.lock().fail_init = fail;
    }

    /// Changes the mode of one link end (see [`TransportConnection::id`]).
    pub fn set_socket_mode(&self, link: u64, mode: SocketMode) {
        if let Some(end) = self.lock().links.get_mut(&link) {
            end.mode = mode;
            debug!(target: "beacon::transport::loopback", link, ?mode, "socket mode changed");
        }
    }

    /// Delivers everything queued since the last flush.
    pub fn flush(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.links.keys().copied().collect();
        for id in ids {
            let (peer, batch) = match state.links.get_mut(&id) {
                Some(end) if !end.pending.is_empty() => (end.peer, std::mem::take(&mut end.pending)),
                _ => continue,
            };
            if let Some(target) = state.links.get_mut(&peer) {
                if !target.released {
                    target.inbound.extend(batch);
                }
            }
        }
        state.links.retain(|_, end| !(end.released && end.pending.is_empty()));
    }

    /// Number of link ends whose handle is still alive.
    pub fn live_links(&self) -> usize {
        self.lock().links.values().filter(|end| !end.released).count()
    }
}

impl TransportFactory for LoopbackNetwork {
    fn listen(&self, addr: &str) -> TransportResult<Box<dyn TransportListener>> {
        let mut state = self.lock();
        if state.fail_init {
            return Err(TransportError::InvalidConfig("loopback socket subsystem disabled"));
        }
        if state.listeners.get(addr).is_some_and(|l| l.open) {
            return Err(TransportError::AddressInUse(addr.to_string()));
        }
        state.listeners.insert(
            addr.to_string(),
            ListenerState {
                open: true,
                backlog: VecDeque::new(),
            },
        );
        debug!(target: "beacon::transport::loopback", addr, "listening");
        Ok(Box::new(LoopbackListener {
            network: self.clone(),
            addr: addr.to_string(),
            closed: false,
        }))
    }

    fn connect(&self, addr: &str) -> TransportResult<Box<dyn TransportConnection>> {
        let mut state = self.lock();
        if state.fail_init {
            return Err(TransportError::InvalidConfig("loopback socket subsystem disabled"));
        }
        if !state.listeners.get(addr).is_some_and(|l| l.open) {
            return Err(TransportError::ConnectionRefused(addr.to_string()));
        }
        let client_id = state.next_link;
        let server_id = client_id + 1;
        state.next_link += 2;
        for (id, peer) in [(client_id, server_id), (server_id, client_id)] {
            state.links.insert(
                id,
                LinkEnd {
                    peer,
                    open: true,
                    ..LinkEnd::default()
                },
            );
        }
        if let Some(listener) = state.listeners.get_mut(addr) {
            listener.backlog.push_back(server_id);
        }
        debug!(target: "beacon::transport::loopback", addr, client = client_id, server = server_id, "link established");
        Ok(Box::new(LoopbackConnection {
            network: self.clone(),
            id: client_id,
        }))
    }
}

#[derive(Debug)]
struct LoopbackListener {
    network: LoopbackNetwork,
    addr: String,
    closed: bool,
}

impl TransportListener for LoopbackListener {
    fn local_addr(&self) -> &str {
        &self.addr
    }

    fn accept(&mut self) -> Option<Box<dyn TransportConnection>> {
        if self.closed {
            return None;
        }
        let id = self.network.lock().listeners.get_mut(&self.addr)?.backlog.pop_front()?;
        Some(Box::new(LoopbackConnection {
            network: self.network.clone(),
            id,
        }))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.network.lock();
        if let Some(listener) = state.listeners.remove(&self.addr) {
            // connections nobody accepted are refused
            for id in listener.backlog {
                state.close_end(id, DisconnectReason::Graceful);
                if let Some(end) = state.links.get_mut(&id) {
                    end.released = true;
                }
            }
        }
        debug!(target: "beacon::transport::loopback", addr = %self.addr, "listener closed");
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
struct LoopbackConnection {
    network: LoopbackNetwork,
    id: u64,
}

impl TransportConnection for LoopbackConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&mut self, payload: Bytes) -> TransportResult<()> {
        let mut state = self.network.lock();
        let end = state.links.get_mut(&self.id).ok_or(TransportError::NotConnected)?;
        if !end.open {
            return Err(TransportError::NotConnected);
        }
        match end.mode {
            SocketMode::Normal => end.pending.push_back(LinkEvent::Data(payload)),
            SocketMode::ReceiveOnly | SocketMode::Disabled => {
                trace!(target: "beacon::transport::loopback", link = self.id, bytes = payload.len(), "send dropped");
            }
        }
        Ok(())
    }

    fn poll(&mut self, out: &mut Vec<LinkEvent>) {
        let mut state = self.network.lock();
        let Some(end) = state.links.get_mut(&self.id) else {
            return;
        };
        if end.mode == SocketMode::Disabled {
            return;
        }
        for event in end.inbound.drain(..) {
            if matches!(event, LinkEvent::Closed(_)) {
                end.open = false;
            }
            out.push(event);
        }
    }

    fn close(&mut self, reason: DisconnectReason) {
        self.network.lock().close_end(self.id, reason);
    }

    fn is_open(&self) -> bool {
        self.network.lock().links.get(&self.id).is_some_and(|end| end.open)
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        let mut state = self.network.lock();
        state.close_end(self.id, DisconnectReason::Graceful);
        if let Some(end) = state.links.get_mut(&self.id) {
            end.released = true;
            end.inbound.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(network: &LoopbackNetwork) -> (Box<dyn TransportListener>, Box<dyn TransportConnection>, Box<dyn TransportConnection>) {
        let mut listener = network.listen("beacon://host").unwrap();
        let client = network.connect("beacon://host").unwrap();
        let server = listener.accept().expect("pending connection");
        (listener, client, server)
    }

    fn drain(conn: &mut Box<dyn TransportConnection>) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        conn.poll(&mut out);
        out
    }

    #[test]
    fn data_arrives_after_flush() {
        let network = LoopbackNetwork::new();
        let (_listener, mut client, mut server) = connected(&network);

        client.send(Bytes::from_static(b"hello")).unwrap();
        assert!(drain(&mut server).is_empty(), "nothing before flush");

        network.flush();
        assert_eq!(drain(&mut server), vec![LinkEvent::Data(Bytes::from_static(b"hello"))]);
    }

    #[test]
    fn connect_to_unknown_address_is_refused() {
        let network = LoopbackNetwork::new();
        let err = network.connect("beacon://nowhere").unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused(_)));
    }

    #[test]
    fn fail_init_blocks_listen_and_connect() {
        let network = LoopbackNetwork::new();
        let _listener = network.listen("beacon://host").unwrap();
        network.set_fail_init(true);
        assert!(network.listen("beacon://other").is_err());
        assert!(network.connect("beacon://host").is_err());
    }

    #[test]
    fn duplicate_listen_address_rejected() {
        let network = LoopbackNetwork::new();
        let _listener = network.listen("beacon://host").unwrap();
        assert!(matches!(
            network.listen("beacon://host"),
            Err(TransportError::AddressInUse(_))
        ));
    }

    #[test]
    fn close_is_observed_by_peer() {
        let network = LoopbackNetwork::new();
        let (_listener, mut client, mut server) = connected(&network);

        server.close(DisconnectReason::Kicked);
        assert!(!server.is_open());
        assert!(client.is_open());
        network.flush();
        assert_eq!(drain(&mut client), vec![LinkEvent::Closed(DisconnectReason::Kicked)]);
        assert!(!client.is_open());
        assert!(client.send(Bytes::from_static(b"late")).is_err());
    }

    #[test]
    fn dropping_a_handle_closes_the_link() {
        let network = LoopbackNetwork::new();
        let (_listener, client, mut server) = connected(&network);

        drop(client);
        network.flush();
        assert_eq!(drain(&mut server), vec![LinkEvent::Closed(DisconnectReason::Graceful)]);
        assert_eq!(network.live_links(), 1);
    }

    #[test]
    fn disabled_socket_drops_sends_and_withholds_inbound() {
        let network = LoopbackNetwork::new();
        let (_listener, mut client, mut server) = connected(&network);
        network.set_socket_mode(client.id(), SocketMode::Disabled);

        client.send(Bytes::from_static(b"lost")).unwrap();
        server.send(Bytes::from_static(b"held")).unwrap();
        network.flush();

        assert!(drain(&mut server).is_empty());
        assert!(drain(&mut client).is_empty());

        network.set_socket_mode(client.id(), SocketMode::Normal);
        assert_eq!(drain(&mut client), vec![LinkEvent::Data(Bytes::from_static(b"held"))]);
    }

    #[test]
    fn receive_only_socket_still_receives() {
        let network = LoopbackNetwork::new();
        let (_listener, mut client, mut server) = connected(&network);
        network.set_socket_mode(client.id(), SocketMode::ReceiveOnly);

        client.send(Bytes::from_static(b"lost")).unwrap();
        server.send(Bytes::from_static(b"ok")).unwrap();
        network.flush();

        assert!(drain(&mut server).is_empty());
        assert_eq!(drain(&mut client), vec![LinkEvent::Data(Bytes::from_static(b"ok"))]);
    }

    #[test]
    fn closing_listener_refuses_unaccepted_links() {
        let network = LoopbackNetwork::new();
        let mut listener = network.listen("beacon://host").unwrap();
        let mut client = network.connect("beacon://host").unwrap();

        listener.close();
        assert!(listener.accept().is_none());
        network.flush();
        assert_eq!(drain(&mut client), vec![LinkEvent::Closed(DisconnectReason::Graceful)]);
        assert!(network.connect("beacon://host").is_err());
    }
}
