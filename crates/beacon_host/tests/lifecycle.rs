//! Host lifetime: init failures, registration, capacity, pause and teardown.

mod common;

use std::sync::Arc;

use beacon_client::BeaconClient;
use beacon_host::{BeaconHost, BeaconHostObject, HostEvent};
use beacon_shared::config::{ClientConfig, HostConfig};
use beacon_shared::error::BeaconError;
use beacon_shared::ids::PlayerId;
use beacon_shared::protocol::{ControlMessageKind, FailureCode};
use beacon_shared::state::BeaconConnectionState;
use beacon_shared::transport::LoopbackNetwork;
use common::{BEACON_TYPE, ClientRecorder, HostRecorder, Harness, Scenario};
use pretty_assertions::assert_eq;

#[test]
fn host_init_failure_is_reported_once() {
    common::init_logging();
    let network = LoopbackNetwork::new();
    network.set_fail_init(true);
    let mut host = BeaconHost::new(HostConfig::default(), Arc::new(network.clone()));

    assert!(matches!(host.init_host(), Err(BeaconError::Transport(_))));
    assert!(matches!(host.init_host(), Err(BeaconError::Transport(_))));
    assert!(!host.is_listening());

    let events = host.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], HostEvent::InitFailed(_)));

    network.set_fail_init(false);
    host.init_host().unwrap();
    assert!(host.is_listening());
    assert!(matches!(host.init_host(), Err(BeaconError::AlreadyInitialized)));
}

#[test]
fn client_init_failure_reports_once() {
    common::init_logging();
    let network = LoopbackNetwork::new();
    network.set_fail_init(true);
    let recorder = ClientRecorder::default();
    let mut client = BeaconClient::new(ClientConfig::default(), Arc::new(network), recorder.clone());

    assert!(client.init(common::HOST_ADDR, PlayerId::from("p"), BEACON_TYPE).is_err());
    assert_eq!(client.state(), BeaconConnectionState::Invalid);
    assert_eq!(recorder.failures().len(), 1);

    client.dispatch(std::time::Instant::now());
    drop(client);
    assert_eq!(recorder.failures().len(), 1);
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut h = Harness::start(Scenario::default());
    let err = h
        .host()
        .register_host(BeaconHostObject::new(BEACON_TYPE, HostRecorder::default()))
        .unwrap_err();
    assert!(matches!(err, BeaconError::DuplicateBeaconType(t) if t == BEACON_TYPE));

    // the original registration keeps working
    h.run_until_open();
    assert_eq!(h.host_recorder.connected(), 1);
}

#[test]
fn capacity_limit_refuses_extra_session() {
    let mut scenario = Scenario::default();
    scenario.host_config.max_connections = Some(1);
    let mut h = Harness::start(scenario);
    h.run_until_open();

    let second = h.add_client("player-2", None);
    assert!(h.tick_until(20, |h| h.clients[second].state() == BeaconConnectionState::Invalid));
    assert_eq!(
        h.clients[second].recorder.failures()[0].code,
        Some(FailureCode::ServerFull)
    );
    assert_eq!(h.host().metrics().handshake_fail_capacity, 1);
    assert_eq!(h.client_state(), BeaconConnectionState::Open);

    // a closed session frees the slot
    h.client().beacon().destroy_beacon();
    assert!(h.tick_until(10, |h| h.host_recorder.disconnected() == 1));
    let third = h.add_client("player-3", None);
    assert!(h.tick_until(20, |h| h.clients[third].state() == BeaconConnectionState::Open));
    assert_eq!(h.host_recorder.connected(), 2);
}

#[test]
fn simultaneous_joins_respect_capacity() {
    let mut scenario = Scenario::default();
    scenario.host_config.max_connections = Some(1);
    let mut h = Harness::start(scenario);
    // both Joins reach the host in the same tick
    let second = h.add_client("player-2", None);

    h.tick_n(20);
    assert_eq!(h.client_state(), BeaconConnectionState::Open);
    assert_eq!(h.clients[second].state(), BeaconConnectionState::Invalid);
    let failures = h.clients[second].recorder.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].code, Some(FailureCode::ServerFull));

    assert_eq!(h.host_recorder.connected(), 1);
    assert_eq!(h.host().registry().open_session_count(), 1);
    assert_eq!(h.host().metrics().active_sessions, 1);
    assert_eq!(h.host().metrics().handshake_fail_capacity, 1);
}

#[test]
fn paused_host_refuses_new_links() {
    let mut h = Harness::start(Scenario::default());
    h.host().pause_beacon_requests(true);

    h.run_until_client_invalid();
    assert!(h.host_received.is_empty());
    assert_eq!(h.host().connection_count(), 0);

    h.host().pause_beacon_requests(false);
    let next = h.add_client("player-2", None);
    assert!(h.tick_until(20, |h| h.clients[next].state() == BeaconConnectionState::Open));
}

#[test]
fn dropping_host_notifies_sessions_synchronously() {
    let mut h = Harness::start(Scenario::default());
    h.run_until_open();

    h.drop_host();
    assert_eq!(h.host_recorder.disconnected(), 1);

    // the failure frame is delivered at the end of the next tick
    h.tick();
    assert_eq!(h.client_state(), BeaconConnectionState::Open);
    h.tick();
    assert_eq!(h.client_state(), BeaconConnectionState::Invalid);

    let failures = h.clients[0].recorder.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].code, Some(FailureCode::ShuttingDown));
    assert_eq!(h.host_recorder.disconnected(), 1);
}

#[test]
fn dropping_host_mid_handshake_notifies_nobody() {
    let mut h = Harness::start(Scenario::default());
    assert!(h.tick_until(10, Harness::host_received_hello));

    h.drop_host();
    assert_eq!(h.host_recorder.connected(), 0);
    assert_eq!(h.host_recorder.disconnected(), 0);

    h.run_until_client_invalid();
    assert_eq!(
        h.clients[0].recorder.failures()[0].code,
        Some(FailureCode::ShuttingDown)
    );
    assert_eq!(h.host_recorder.disconnected(), 0);
}

#[test]
fn shutdown_is_idempotent() {
    let mut h = Harness::start(Scenario::default());
    h.run_until_open();

    h.host().shutdown();
    h.host().shutdown();
    assert_eq!(h.host_recorder.disconnected(), 1);
    assert!(!h.host().is_listening());
    assert_eq!(h.host().connection_count(), 0);
    assert_eq!(h.host().metrics().active_sessions, 0);

    h.tick_n(3);
    h.drop_host();
    assert_eq!(h.host_recorder.disconnected(), 1);
    assert_eq!(h.client_state(), BeaconConnectionState::Invalid);
}

#[test]
fn unregistering_a_type_closes_its_sessions() {
    let mut h = Harness::start(Scenario::default());
    h.run_until_open();

    let object = h.host().unregister_host(BEACON_TYPE).unwrap();
    assert_eq!(object.beacon_type(), BEACON_TYPE);
    assert_eq!(h.host_recorder.disconnected(), 1);
    assert!(object.active_sessions().is_empty());

    h.run_until_client_invalid();
    assert!(matches!(
        h.host().unregister_host(BEACON_TYPE),
        Err(BeaconError::UnknownBeaconType(_))
    ));
    let events = h.host().drain_events();
    assert!(events.iter().any(|event| matches!(event, HostEvent::ClientDisconnected { .. })));
}

#[test]
fn failed_client_can_init_again() {
    let mut h = Harness::start(Scenario::default());
    h.run_until_open();
    let session = h
        .host()
        .session_for_player(&PlayerId::from("player-1"))
        .expect("session");
    h.host().disconnect_client(&session);
    h.run_until_client_invalid();

    h.client()
        .beacon()
        .init(common::HOST_ADDR, PlayerId::from("player-1"), BEACON_TYPE)
        .unwrap();
    h.run_until_open();
    assert_eq!(h.host_recorder.connected(), 2);
    assert_eq!(h.clients[0].recorder.connected(), 2);
    assert_eq!(h.clients[0].recorder.failures().len(), 1);
    assert_eq!(
        h.host_received.iter().filter(|kind| **kind == ControlMessageKind::Hello).count(),
        2
    );
}
