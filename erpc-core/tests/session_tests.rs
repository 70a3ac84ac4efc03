//! Session lifecycle tests over the loopback transport.
//!
//! Run with:
//! ```bash
//! RUST_LOG=erpc_core=debug cargo test --package erpc-core --test session_tests -- --nocapture
//! ```

mod common;

use std::time::{Duration, Instant};

use erpc_core::{
    Completion, Error, LoopbackConfig, LoopbackFabric, Nexus, SessionHandle, SessionState,
    SmErrType, SmEventType,
};

use common::{
    LoopRpc, connect, init_tracing, loopback_rpc, pump_one_until, pump_until, record_events,
    test_config,
};

const TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Connect / disconnect
// =============================================================================

#[test]
fn test_connect_disconnect_cycles() {
    init_tracing();
    let nexus = Nexus::new("localhost:31850");
    let fabric = LoopbackFabric::new();
    let server: LoopRpc<()> =
        loopback_rpc(&nexus, &fabric, 0, LoopbackConfig::default(), test_config());
    let client: LoopRpc<()> =
        loopback_rpc(&nexus, &fabric, 1, LoopbackConfig::default(), test_config());
    let events = record_events(&client);

    for cycle in 0..3 {
        let session = client.create_session(nexus.uri(), 0).unwrap();
        assert_eq!(client.session_state(session), Some(SessionState::ConnectInProgress));
        assert!(pump_until(&client, &server, TIMEOUT, || client.is_connected(session)));
        assert_eq!(server.num_active_sessions(), 1);

        client.destroy_session(session).unwrap();
        assert_eq!(
            client.session_state(session),
            Some(SessionState::DisconnectInProgress)
        );
        assert!(pump_until(&client, &server, TIMEOUT, || {
            client.session_state(session).is_none()
        }));
        assert_eq!(server.num_active_sessions(), 0, "cycle {}", cycle);
        assert_eq!(client.num_active_sessions(), 0);

        let log = events.borrow();
        assert_eq!(log.len(), 2 * (cycle + 1));
        assert_eq!(log[2 * cycle], (session, SmEventType::Connected, SmErrType::NoError));
        assert_eq!(
            log[2 * cycle + 1],
            (session, SmEventType::Disconnected, SmErrType::NoError)
        );
    }
    assert_eq!(events.borrow().len(), 6);
}

#[test]
fn test_destroy_rejected_without_events() {
    init_tracing();
    let nexus = Nexus::new("localhost:31850");
    let fabric = LoopbackFabric::new();
    let server: LoopRpc<()> =
        loopback_rpc(&nexus, &fabric, 0, LoopbackConfig::default(), test_config());
    let client: LoopRpc<()> =
        loopback_rpc(&nexus, &fabric, 1, LoopbackConfig::default(), test_config());
    let events = record_events(&client);

    assert!(matches!(
        client.destroy_session(SessionHandle::NULL),
        Err(Error::InvalidSession(_))
    ));

    let session = client.create_session(nexus.uri(), 0).unwrap();
    assert!(matches!(
        client.destroy_session(session),
        Err(Error::SessionNotConnected(_))
    ));
    assert!(events.borrow().is_empty());

    assert!(pump_until(&client, &server, TIMEOUT, || client.is_connected(session)));
    client.destroy_session(session).unwrap();
    assert!(matches!(
        client.destroy_session(session),
        Err(Error::SessionNotConnected(_))
    ));

    assert!(pump_until(&client, &server, TIMEOUT, || {
        client.session_state(session).is_none()
    }));
    assert!(matches!(
        client.destroy_session(session),
        Err(Error::InvalidSession(_))
    ));

    // Connected + Disconnected only.
    client.run_event_loop_timeout(20);
    assert_eq!(events.borrow().len(), 2);
}

#[test]
fn test_stale_handle_after_number_reuse() {
    init_tracing();
    let nexus = Nexus::new("localhost:31850");
    let fabric = LoopbackFabric::new();
    let server: LoopRpc<()> =
        loopback_rpc(&nexus, &fabric, 0, LoopbackConfig::default(), test_config());
    let client: LoopRpc<()> = loopback_rpc(
        &nexus,
        &fabric,
        1,
        LoopbackConfig::default(),
        test_config().with_max_sessions(1),
    );

    let first = connect(&client, &server);
    client.destroy_session(first).unwrap();
    assert!(pump_until(&client, &server, TIMEOUT, || {
        client.session_state(first).is_none()
    }));

    let second = connect(&client, &server);
    assert_eq!(first.session_num(), second.session_num());
    assert_ne!(first, second);
    assert_eq!(client.session_state(first), None);
    assert!(matches!(
        client.destroy_session(first),
        Err(Error::InvalidSession(_))
    ));
    assert!(client.is_connected(second));
}

#[test]
fn test_sessions_across_peer_nexus() {
    init_tracing();
    let server_nexus = Nexus::new("server:31850");
    let client_nexus = Nexus::new("client:31850");
    client_nexus.add_peer(&server_nexus);
    let fabric = LoopbackFabric::new();
    let server: LoopRpc<()> = loopback_rpc(
        &server_nexus,
        &fabric,
        3,
        LoopbackConfig::default(),
        test_config(),
    );
    let client: LoopRpc<()> = loopback_rpc(
        &client_nexus,
        &fabric,
        3,
        LoopbackConfig::default(),
        test_config(),
    );

    let session = connect(&client, &server);
    assert_eq!(server.num_active_sessions(), 1);
    client.destroy_session(session).unwrap();
    assert!(pump_until(&client, &server, TIMEOUT, || {
        server.num_active_sessions() == 0 && client.num_active_sessions() == 0
    }));
}

// =============================================================================
// Connect failures
// =============================================================================

#[test]
fn test_connect_unknown_rpc_id() {
    init_tracing();
    let nexus = Nexus::new("localhost:31850");
    let fabric = LoopbackFabric::new();
    let client: LoopRpc<()> =
        loopback_rpc(&nexus, &fabric, 1, LoopbackConfig::default(), test_config());
    let events = record_events(&client);

    let session = client.create_session(nexus.uri(), 42).unwrap();
    assert!(pump_one_until(&client, TIMEOUT, || !events.borrow().is_empty()));
    assert_eq!(
        events.borrow()[0],
        (session, SmEventType::ConnectFailed, SmErrType::InvalidRemoteRpcId)
    );
    assert_eq!(client.session_state(session), Some(SessionState::Error));

    fn cont(_: &LoopRpc<()>, _: Completion<()>) {}
    let req = client.alloc_msg_buffer(8).unwrap();
    let resp = client.alloc_msg_buffer(8).unwrap();
    let err = client
        .enqueue_request(session, 1, req, resp, cont, ())
        .unwrap_err();
    assert!(matches!(
        err.error,
        Error::HandshakeFailed(SmErrType::InvalidRemoteRpcId)
    ));

    // Freed at once, no disconnect handshake.
    let sm_tx = client.stats().sm_pkts_tx;
    client.destroy_session(session).unwrap();
    assert_eq!(client.session_state(session), None);
    assert_eq!(client.stats().sm_pkts_tx, sm_tx);
    assert_eq!(events.borrow().len(), 2);
    assert_eq!(
        events.borrow()[1],
        (session, SmEventType::Disconnected, SmErrType::NoError)
    );
}

#[test]
fn test_connect_routing_resolution_failure() {
    init_tracing();
    let nexus = Nexus::new("localhost:31850");
    // Endpoints on different fabrics cannot reach each other.
    let server: LoopRpc<()> = loopback_rpc(
        &nexus,
        &LoopbackFabric::new(),
        0,
        LoopbackConfig::default(),
        test_config(),
    );
    let client: LoopRpc<()> = loopback_rpc(
        &nexus,
        &LoopbackFabric::new(),
        1,
        LoopbackConfig::default(),
        test_config(),
    );
    let events = record_events(&client);

    let session = client.create_session(nexus.uri(), 0).unwrap();
    assert!(pump_until(&client, &server, TIMEOUT, || !events.borrow().is_empty()));
    assert_eq!(
        events.borrow()[0],
        (
            session,
            SmEventType::ConnectFailed,
            SmErrType::RoutingResolutionFailure
        )
    );
    assert_eq!(server.num_active_sessions(), 0);

    client.destroy_session(session).unwrap();
    assert_eq!(client.num_active_sessions(), 0);
}

#[test]
fn test_connect_too_many_sessions() {
    init_tracing();
    let nexus = Nexus::new("localhost:31850");
    let fabric = LoopbackFabric::new();
    let server: LoopRpc<()> = loopback_rpc(
        &nexus,
        &fabric,
        0,
        LoopbackConfig::default(),
        test_config().with_max_sessions(1),
    );
    let client: LoopRpc<()> =
        loopback_rpc(&nexus, &fabric, 1, LoopbackConfig::default(), test_config());
    let events = record_events(&client);

    let first = connect(&client, &server);
    let second = client.create_session(nexus.uri(), 0).unwrap();
    assert!(pump_until(&client, &server, TIMEOUT, || events.borrow().len() == 2));
    assert_eq!(
        events.borrow()[1],
        (second, SmEventType::ConnectFailed, SmErrType::TooManySessions)
    );
    assert!(client.is_connected(first));
}

#[test]
fn test_connect_handshake_timeout() {
    init_tracing();
    let nexus = Nexus::new("localhost:31850");
    let fabric = LoopbackFabric::new();
    let config = test_config().with_sm_rto_us(1000).with_sm_max_retries(2);
    let client: LoopRpc<()> = loopback_rpc(&nexus, &fabric, 1, LoopbackConfig::default(), config);
    let events = record_events(&client);

    // No nexus serves this host, so every connect request is lost.
    let start = Instant::now();
    let session = client.create_session("unreachable:31850", 0).unwrap();
    assert!(pump_one_until(&client, TIMEOUT, || !events.borrow().is_empty()));
    // Timeouts double: 1ms, 2ms, 4ms.
    assert!(start.elapsed() >= Duration::from_micros(1000 * (1 + 2 + 4)));
    assert_eq!(
        events.borrow()[0],
        (session, SmEventType::ConnectFailed, SmErrType::HandshakeTimedOut)
    );
    assert_eq!(client.session_state(session), Some(SessionState::Error));
    // Initial request, two retries and the final release.
    assert_eq!(client.stats().sm_pkts_tx, 4);
}

#[test]
fn test_connect_survives_sm_loss() {
    init_tracing();
    let nexus = Nexus::new("localhost:31850");
    let fabric = LoopbackFabric::new();
    let config = test_config().with_sm_rto_us(1000);
    let server: LoopRpc<()> =
        loopback_rpc(&nexus, &fabric, 0, LoopbackConfig::default(), config.clone());
    let client: LoopRpc<()> = loopback_rpc(&nexus, &fabric, 1, LoopbackConfig::default(), config);
    let events = record_events(&client);

    nexus.fault_inject_drop_sm(2);
    let session = client.create_session(nexus.uri(), 0).unwrap();
    assert!(pump_until(&client, &server, TIMEOUT, || client.is_connected(session)));
    assert_eq!(server.num_active_sessions(), 1);

    client.destroy_session(session).unwrap();
    assert!(pump_until(&client, &server, TIMEOUT, || {
        client.session_state(session).is_none()
    }));
    assert_eq!(
        *events.borrow(),
        vec![
            (session, SmEventType::Connected, SmErrType::NoError),
            (session, SmEventType::Disconnected, SmErrType::NoError),
        ]
    );
    assert_eq!(server.num_active_sessions(), 0);
}

#[test]
fn test_connect_timeout_releases_server_session() {
    init_tracing();
    let server_nexus = Nexus::new("server:31850");
    let client_nexus = Nexus::new("client:31850");
    client_nexus.add_peer(&server_nexus);
    let fabric = LoopbackFabric::new();
    let server: LoopRpc<()> = loopback_rpc(
        &server_nexus,
        &fabric,
        0,
        LoopbackConfig::default(),
        test_config(),
    );
    let client: LoopRpc<()> = loopback_rpc(
        &client_nexus,
        &fabric,
        1,
        LoopbackConfig::default(),
        test_config().with_sm_rto_us(1000).with_sm_max_retries(1),
    );
    let events = record_events(&client);

    // The server accepts, but none of its responses reach the client.
    server_nexus.fault_inject_drop_sm(1000);
    let session = client.create_session(server_nexus.uri(), 0).unwrap();
    assert!(pump_until(&client, &server, TIMEOUT, || !events.borrow().is_empty()));
    assert_eq!(
        events.borrow()[0],
        (session, SmEventType::ConnectFailed, SmErrType::HandshakeTimedOut)
    );

    assert!(pump_until(&client, &server, TIMEOUT, || {
        server.num_active_sessions() == 0
    }));
    client.destroy_session(session).unwrap();
    assert_eq!(client.num_active_sessions(), 0);
}

// =============================================================================
// Disconnect failures
// =============================================================================

#[test]
fn test_disconnect_handshake_timeout() {
    init_tracing();
    let nexus = Nexus::new("localhost:31850");
    let fabric = LoopbackFabric::new();
    let config = test_config().with_sm_rto_us(1000).with_sm_max_retries(2);
    let server: LoopRpc<()> =
        loopback_rpc(&nexus, &fabric, 0, LoopbackConfig::default(), config.clone());
    let client: LoopRpc<()> = loopback_rpc(&nexus, &fabric, 1, LoopbackConfig::default(), config);
    let events = record_events(&client);

    let session = connect(&client, &server);
    nexus.fault_inject_drop_sm(1000);
    client.destroy_session(session).unwrap();
    assert!(pump_until(&client, &server, TIMEOUT, || events.borrow().len() == 2));
    assert_eq!(
        events.borrow()[1],
        (session, SmEventType::DisconnectFailed, SmErrType::HandshakeTimedOut)
    );
    assert_eq!(client.session_state(session), Some(SessionState::Error));

    // Only one failure event, however long the loops keep running.
    client.run_event_loop_timeout(20);
    assert_eq!(events.borrow().len(), 2);

    let sm_tx = client.stats().sm_pkts_tx;
    client.destroy_session(session).unwrap();
    assert_eq!(client.session_state(session), None);
    assert_eq!(client.stats().sm_pkts_tx, sm_tx);
    assert_eq!(
        *events.borrow(),
        vec![
            (session, SmEventType::Connected, SmErrType::NoError),
            (session, SmEventType::DisconnectFailed, SmErrType::HandshakeTimedOut),
            (session, SmEventType::Disconnected, SmErrType::NoError),
        ]
    );
}
