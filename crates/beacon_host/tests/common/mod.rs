//! Test harness: one host and any number of clients on a loopback network,
//! driven tick by tick with a manual clock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use beacon_client::{BeaconClient, ClientContext, ClientDelegate};
use beacon_host::{BeaconHost, BeaconHostObject, HostObjectHandler, HostSession, JoinRequest};
use beacon_shared::config::{ClientConfig, HostConfig};
use beacon_shared::error::{FailureInfo, NegotiationError};
use beacon_shared::ids::{ConnectionId, PlayerId};
use beacon_shared::negotiation::{
    AuthRequest, AuthResult, AuthVerifier, Completion, EncryptionData, EncryptionFailureAction, EncryptionHooks,
    NetworkEncryption,
};
use beacon_shared::protocol::ControlMessageKind;
use beacon_shared::scheduler::{ManualClock, TickScheduler};
use beacon_shared::state::BeaconConnectionState;
use beacon_shared::transport::{LoopbackNetwork, SocketMode};

pub const HOST_ADDR: &str = "beacon-host";
pub const BEACON_TYPE: &str = "test";
pub const TICK: Duration = Duration::from_millis(100);

static LOGGING: Once = Once::new();

/// `RUST_LOG=beacon=debug cargo test` shows the handshake traces.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// -------------------------------------------------------------------------------------------------
// Recording delegates
// -------------------------------------------------------------------------------------------------

#[derive(Clone)]
pub struct HostRecorder {
    pub connected: Arc<AtomicUsize>,
    pub disconnected: Arc<AtomicUsize>,
    pub accept_joins: Arc<AtomicBool>,
    pub joins: Arc<Mutex<Vec<JoinRequest>>>,
    pub messages: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Default for HostRecorder {
    fn default() -> Self {
        Self {
            connected: Arc::default(),
            disconnected: Arc::default(),
            accept_joins: Arc::new(AtomicBool::new(true)),
            joins: Arc::default(),
            messages: Arc::default(),
        }
    }
}

impl HostRecorder {
    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> usize {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().unwrap().clone()
    }
}

impl HostObjectHandler for HostRecorder {
    fn on_client_connected(&mut self, _session: &Arc<HostSession>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_client_disconnected(&mut self, _session: &Arc<HostSession>) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn verify_join(&mut self, request: &JoinRequest) -> bool {
        self.joins.lock().unwrap().push(request.clone());
        self.accept_joins.load(Ordering::SeqCst)
    }

    fn on_message(&mut self, _session: &Arc<HostSession>, payload: &[u8]) {
        self.messages.lock().unwrap().push(payload.to_vec());
    }
}

#[derive(Clone, Default)]
pub struct ClientRecorder {
    pub connected: Arc<AtomicUsize>,
    pub failures: Arc<Mutex<Vec<FailureInfo>>>,
    pub messages: Arc<Mutex<Vec<Vec<u8>>>>,
    pub destroy_on_connected: Arc<AtomicBool>,
}

impl ClientRecorder {
    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<FailureInfo> {
        self.failures.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().unwrap().clone()
    }
}

impl ClientDelegate for ClientRecorder {
    fn on_connected(&mut self, ctx: &mut ClientContext) {
        self.connected.fetch_add(1, Ordering::SeqCst);
        if self.destroy_on_connected.load(Ordering::SeqCst) {
            ctx.destroy_beacon();
        }
    }

    fn on_failure(&mut self, _ctx: &mut ClientContext, failure: &FailureInfo) {
        self.failures.lock().unwrap().push(failure.clone());
    }

    fn on_message(&mut self, _ctx: &mut ClientContext, payload: &[u8]) {
        self.messages.lock().unwrap().push(payload.to_vec());
    }
}

// -------------------------------------------------------------------------------------------------
// Negotiation providers
// -------------------------------------------------------------------------------------------------

/// When a test provider resolves its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Immediate,
    /// Resolved from the scheduler this many ticks later.
    Deferred(u64),
}

fn deliver<T: Send + 'static>(
    scheduler: &TickScheduler,
    delivery: Delivery,
    done: Completion<T>,
    result: Result<T, NegotiationError>,
) {
    match delivery {
        Delivery::Immediate => done.resolve(result),
        Delivery::Deferred(ticks) => scheduler.defer(ticks, move || done.resolve(result)),
    }
}

pub struct TestEncryption {
    scheduler: TickScheduler,
    delivery: Delivery,
    succeed: bool,
    pub host_calls: AtomicUsize,
    pub client_calls: AtomicUsize,
}

impl TestEncryption {
    pub fn new(scheduler: &TickScheduler, delivery: Delivery, succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            scheduler: scheduler.clone(),
            delivery,
            succeed,
            host_calls: AtomicUsize::new(0),
            client_calls: AtomicUsize::new(0),
        })
    }

    pub fn host_calls(&self) -> usize {
        self.host_calls.load(Ordering::SeqCst)
    }

    pub fn client_calls(&self) -> usize {
        self.client_calls.load(Ordering::SeqCst)
    }

    fn result(&self, identifier: &str) -> Result<EncryptionData, NegotiationError> {
        if self.succeed {
            Ok(EncryptionData::new(identifier, b"shared-test-key".to_vec()))
        } else {
            Err(NegotiationError::Rejected(format!("no key for '{identifier}'")))
        }
    }
}

impl NetworkEncryption for TestEncryption {
    fn host_token(&self, _connection: ConnectionId, identifier: &str, done: Completion<EncryptionData>) {
        self.host_calls.fetch_add(1, Ordering::SeqCst);
        deliver(&self.scheduler, self.delivery, done, self.result(identifier));
    }

    fn client_ack(&self, identifier: &str, done: Completion<EncryptionData>) {
        self.client_calls.fetch_add(1, Ordering::SeqCst);
        deliver(&self.scheduler, self.delivery, done, self.result(identifier));
    }
}

pub struct TestVerifier {
    scheduler: TickScheduler,
    delivery: Delivery,
    outcome: Result<AuthResult, NegotiationError>,
    pub requests: Mutex<Vec<AuthRequest>>,
}

impl TestVerifier {
    pub fn new(
        scheduler: &TickScheduler,
        delivery: Delivery,
        outcome: Result<AuthResult, NegotiationError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler: scheduler.clone(),
            delivery,
            outcome,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<AuthRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl AuthVerifier for TestVerifier {
    fn start_verify_authentication(&self, request: AuthRequest, done: Completion<AuthResult>) {
        self.requests.lock().unwrap().push(request);
        deliver(&self.scheduler, self.delivery, done, self.outcome.clone());
    }
}

/// Encryption hooks whose failure hook answers `action` and counts its calls in `counter`.
pub fn counting_failure_hook(
    hooks: EncryptionHooks,
    action: EncryptionFailureAction,
    counter: &Arc<AtomicUsize>,
) -> EncryptionHooks {
    let counter = Arc::clone(counter);
    hooks.with_failure_hook(move |_side| {
        counter.fetch_add(1, Ordering::SeqCst);
        action
    })
}

// -------------------------------------------------------------------------------------------------
// Harness
// -------------------------------------------------------------------------------------------------

/// Setup of a host and its first client.
pub struct Scenario {
    /// Drives deferred providers; handed to the harness.
    pub scheduler: TickScheduler,
    pub host_config: HostConfig,
    pub client_config: ClientConfig,
    pub host_encryption: EncryptionHooks,
    pub client_encryption: EncryptionHooks,
    pub client_key: Option<EncryptionData>,
    pub verifier: Option<Arc<dyn AuthVerifier>>,
    /// Beacon type registered on the host, if any.
    pub registered_type: Option<String>,
    pub client_beacon_type: String,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            scheduler: TickScheduler::new(),
            host_config: HostConfig {
                listen_addr: HOST_ADDR.into(),
                ..HostConfig::default()
            },
            client_config: ClientConfig {
                login_options: "region=eu".into(),
                auth_token: Some("token-1".into()),
                ..ClientConfig::default()
            },
            host_encryption: EncryptionHooks::new(),
            client_encryption: EncryptionHooks::new(),
            client_key: None,
            verifier: None,
            registered_type: Some(BEACON_TYPE.into()),
            client_beacon_type: BEACON_TYPE.into(),
        }
    }
}

pub struct TestClient {
    pub beacon: Option<BeaconClient>,
    pub recorder: ClientRecorder,
    pub received: Vec<ControlMessageKind>,
}

impl TestClient {
    pub fn state(&self) -> BeaconConnectionState {
        self.beacon
            .as_ref()
            .map_or(BeaconConnectionState::Invalid, BeaconClient::state)
    }

    pub fn beacon(&mut self) -> &mut BeaconClient {
        self.beacon.as_mut().expect("client dropped")
    }
}

pub struct Harness {
    pub network: LoopbackNetwork,
    pub scheduler: TickScheduler,
    pub clock: ManualClock,
    pub host: Option<BeaconHost>,
    pub host_recorder: HostRecorder,
    pub host_received: Vec<ControlMessageKind>,
    pub clients: Vec<TestClient>,
    client_config: ClientConfig,
    client_encryption: EncryptionHooks,
    client_beacon_type: String,
    pub ticks: u64,
}

impl Harness {
    /// Starts host and first client with timeouts disabled on both ends.
    pub fn start(scenario: Scenario) -> Self {
        init_logging();
        let network = LoopbackNetwork::new();
        let host_recorder = HostRecorder::default();

        let mut host = BeaconHost::new(scenario.host_config, Arc::new(network.clone()))
            .with_encryption(scenario.host_encryption);
        host.set_auth_verifier(scenario.verifier);
        if let Some(beacon_type) = scenario.registered_type {
            host.register_host(BeaconHostObject::new(beacon_type, host_recorder.clone()))
                .expect("register beacon type");
        }
        host.init_host().expect("host init");
        host.set_timeouts_enabled(false);

        let mut harness = Self {
            network,
            scheduler: scenario.scheduler,
            clock: ManualClock::new(),
            host: Some(host),
            host_recorder,
            host_received: Vec::new(),
            clients: Vec::new(),
            client_config: scenario.client_config,
            client_encryption: scenario.client_encryption,
            client_beacon_type: scenario.client_beacon_type,
            ticks: 0,
        };
        harness.add_client("player-1", scenario.client_key);
        harness
    }

    /// Connects another client with the scenario's client settings.
    pub fn add_client(&mut self, player: &str, key: Option<EncryptionData>) -> usize {
        let recorder = ClientRecorder::default();
        let mut beacon = BeaconClient::new(
            self.client_config.clone(),
            Arc::new(self.network.clone()),
            recorder.clone(),
        )
        .with_encryption(self.client_encryption.clone());
        if let Some(key) = key {
            beacon.set_encryption_data(key);
        }
        beacon.set_timeouts_enabled(false);
        beacon
            .init(HOST_ADDR, PlayerId::from(player), self.client_beacon_type.clone())
            .expect("client init");
        self.clients.push(TestClient {
            beacon: Some(beacon),
            recorder,
            received: Vec::new(),
        });
        self.clients.len() - 1
    }

    pub fn host(&mut self) -> &mut BeaconHost {
        self.host.as_mut().expect("host dropped")
    }

    pub fn client(&mut self) -> &mut TestClient {
        &mut self.clients[0]
    }

    pub fn client_state(&self) -> BeaconConnectionState {
        self.clients[0].state()
    }

    /// Link id of the first client's end.
    pub fn client_link(&self) -> u64 {
        self.clients[0]
            .beacon
            .as_ref()
            .and_then(BeaconClient::connection_id)
            .expect("client has no link")
    }

    pub fn set_client_socket(&self, mode: SocketMode) {
        self.network.set_socket_mode(self.client_link(), mode);
    }

    /// One full tick: dispatch, scheduled hooks, flush, network delivery.
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.scheduler.begin_tick();
        let now = self.clock.now();

        if let Some(host) = self.host.as_mut() {
            host.dispatch(now);
        }
        for client in &mut self.clients {
            if let Some(beacon) = client.beacon.as_mut() {
                beacon.dispatch(now);
            }
        }
        self.scheduler.run_due();
        if let Some(host) = self.host.as_mut() {
            host.flush(now);
        }
        for client in &mut self.clients {
            if let Some(beacon) = client.beacon.as_mut() {
                beacon.flush(now);
            }
        }
        self.network.flush();

        if let Some(host) = self.host.as_mut() {
            self.host_received.extend(host.take_received_control());
        }
        for client in &mut self.clients {
            if let Some(beacon) = client.beacon.as_mut() {
                client.received.extend(beacon.take_received_control());
            }
        }
        self.clock.advance(TICK);
    }

    pub fn tick_n(&mut self, count: usize) {
        for _ in 0..count {
            self.tick();
        }
    }

    /// Ticks until `done` holds, at most `limit` times. Returns whether it held.
    pub fn tick_until(&mut self, limit: usize, done: impl Fn(&Harness) -> bool) -> bool {
        for _ in 0..limit {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    pub fn run_until_open(&mut self) {
        assert!(
            self.tick_until(50, |h| h.client_state() == BeaconConnectionState::Open),
            "handshake did not complete, client state {}",
            self.client_state()
        );
    }

    pub fn run_until_client_invalid(&mut self) {
        assert!(
            self.tick_until(50, |h| h.client_state() == BeaconConnectionState::Invalid),
            "client did not fail, state {}",
            self.client_state()
        );
    }

    /// Drops the host; teardown runs synchronously in its `Drop`.
    pub fn drop_host(&mut self) {
        self.host = None;
    }

    pub fn host_received_hello(&self) -> bool {
        self.host_received.contains(&ControlMessageKind::Hello)
    }
}
