//! Common test utilities for erpc-core integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use erpc_core::{
    LoopbackConfig, LoopbackFabric, LoopbackTransport, Nexus, Rpc, RpcConfig, SessionHandle,
    SmErrType, SmEventType,
};

pub type LoopRpc<U> = Rpc<U, LoopbackTransport>;

/// Recorded SM events.
pub type EventLog = Rc<RefCell<Vec<(SessionHandle, SmEventType, SmErrType)>>>;

/// Install a test-writer subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with a small unpinned arena, sized for tests.
pub fn test_config() -> RpcConfig {
    RpcConfig::default()
        .with_arena_size(4 << 20)
        .with_max_msg_size(256 << 10)
        .with_pin_memory(false)
}

pub fn loopback_rpc<U>(
    nexus: &Arc<Nexus>,
    fabric: &Arc<LoopbackFabric>,
    rpc_id: u8,
    transport: LoopbackConfig,
    config: RpcConfig,
) -> LoopRpc<U> {
    let transport = LoopbackTransport::new(fabric, transport).unwrap();
    Rpc::new(nexus, rpc_id, transport, config).unwrap()
}

/// Attach an SM handler that records every event.
pub fn record_events<U: 'static>(rpc: &LoopRpc<U>) -> EventLog {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    rpc.set_sm_handler(move |session, event, err| {
        sink.borrow_mut().push((session, event, err));
    });
    log
}

/// Run both event loops until `done` holds. Returns false on timeout.
pub fn pump_until<A, B>(
    a: &LoopRpc<A>,
    b: &LoopRpc<B>,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > timeout {
            return false;
        }
        a.run_event_loop_once();
        b.run_event_loop_once();
    }
    true
}

/// Run one event loop until `done` holds. Returns false on timeout.
pub fn pump_one_until<U>(rpc: &LoopRpc<U>, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > timeout {
            return false;
        }
        rpc.run_event_loop_once();
    }
    true
}

/// Create a session from `client` to `server` and wait for it to connect.
pub fn connect<A, B>(client: &LoopRpc<A>, server: &LoopRpc<B>) -> SessionHandle {
    let session = client
        .create_session(server.uri(), server.rpc_id())
        .unwrap();
    assert!(
        pump_until(client, server, Duration::from_secs(5), || {
            client.is_connected(session)
        }),
        "session did not connect"
    );
    session
}
