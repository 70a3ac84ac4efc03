//! Loopback ping-pong benchmark.
//!
//! Measures:
//! 1. RPC latency (single request, wait for response)
//! 2. RPC throughput (pipelined requests up to the credit window)
//!
//! The server runs its event loop on its own thread, the client on the
//! benchmark thread; both share one loopback fabric.
//!
//! Run with:
//! ```bash
//! cargo bench --package erpc-core --bench rpc_bench
//! ```

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use erpc_core::{
    Completion, LoopbackConfig, LoopbackFabric, LoopbackTransport, Nexus, Rpc, RpcConfig,
    SessionHandle,
};

// =============================================================================
// Constants
// =============================================================================

const SERVER_RPC_ID: u8 = 0;
const CLIENT_RPC_ID: u8 = 1;
const REQ_ECHO: u8 = 1;

const SMALL_MSG_SIZE: usize = 32;
/// Spans four loopback packets.
const LARGE_MSG_SIZE: usize = 4000;

const REQ_WINDOW: usize = 8;

type ClientRpc = Rpc<Rc<Cell<u64>>, LoopbackTransport>;

// =============================================================================
// Server Thread
// =============================================================================

struct ServerHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn bench_config() -> RpcConfig {
    RpcConfig::default()
        .with_req_window(REQ_WINDOW)
        .with_arena_size(32 << 20)
        .with_max_msg_size(64 << 10)
}

fn spawn_server(nexus: &Arc<Nexus>, fabric: &Arc<LoopbackFabric>) -> ServerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = {
        let nexus = nexus.clone();
        let fabric = fabric.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let transport = LoopbackTransport::new(&fabric, LoopbackConfig::default())
                .expect("server transport");
            let server: Rpc<(), _> = Rpc::new(&nexus, SERVER_RPC_ID, transport, bench_config())
                .expect("server rpc");
            server
                .register_req_func(REQ_ECHO, |rpc, req| {
                    let _ = req.respond(rpc, req.data());
                })
                .expect("register handler");
            ready_tx.send(()).expect("ready");
            while !stop.load(Ordering::Relaxed) {
                server.run_event_loop_once();
            }
        })
    };
    ready_rx.recv().expect("server startup");
    ServerHandle {
        stop,
        handle: Some(handle),
    }
}

struct BenchSetup {
    client: ClientRpc,
    session: SessionHandle,
    // Dropped after the client.
    _server: ServerHandle,
}

fn setup_benchmark() -> BenchSetup {
    let nexus = Nexus::new("localhost:31850");
    let fabric = LoopbackFabric::new();
    let server = spawn_server(&nexus, &fabric);

    let transport =
        LoopbackTransport::new(&fabric, LoopbackConfig::default()).expect("client transport");
    let client: ClientRpc =
        Rpc::new(&nexus, CLIENT_RPC_ID, transport, bench_config()).expect("client rpc");
    let session = client
        .create_session(nexus.uri(), SERVER_RPC_ID)
        .expect("create session");
    let start = Instant::now();
    while !client.is_connected(session) {
        assert!(start.elapsed() < Duration::from_secs(5), "connect timed out");
        client.run_event_loop_once();
    }

    BenchSetup {
        client,
        session,
        _server: server,
    }
}

// =============================================================================
// Benchmark Functions
// =============================================================================

fn on_response(rpc: &ClientRpc, c: Completion<Rc<Cell<u64>>>) {
    c.tag.set(c.tag.get() + 1);
    let _ = rpc.free_msg_buffer(c.req);
    let _ = rpc.free_msg_buffer(c.resp);
}

/// Enqueue one request. Returns false on backpressure.
fn send(client: &ClientRpc, session: SessionHandle, payload: &[u8], completed: &Rc<Cell<u64>>) -> bool {
    let req = client.alloc_msg_buffer(payload.len()).expect("alloc req");
    client.write_msg(&req, payload).expect("write req");
    let resp = client.alloc_msg_buffer(payload.len()).expect("alloc resp");
    match client.enqueue_request(session, REQ_ECHO, req, resp, on_response, completed.clone()) {
        Ok(()) => true,
        Err(e) => {
            let (_, req, resp, _) = e.into_parts();
            let _ = client.free_msg_buffer(req);
            let _ = client.free_msg_buffer(resp);
            false
        }
    }
}

/// Latency benchmark (one request at a time).
fn run_latency_bench(client: &ClientRpc, session: SessionHandle, msg_size: usize, iters: u64) -> Duration {
    let payload = vec![0xAAu8; msg_size];
    let completed = Rc::new(Cell::new(0u64));

    let start = Instant::now();
    for i in 0..iters {
        while !send(client, session, &payload, &completed) {
            client.run_event_loop_once();
        }
        while completed.get() <= i {
            client.run_event_loop_once();
        }
    }
    start.elapsed()
}

/// Throughput benchmark (pipelined requests).
fn run_throughput_bench(
    client: &ClientRpc,
    session: SessionHandle,
    msg_size: usize,
    iters: u64,
) -> Duration {
    let payload = vec![0xAAu8; msg_size];
    let completed = Rc::new(Cell::new(0u64));
    let mut sent = 0u64;

    let start = Instant::now();
    while completed.get() < iters {
        while sent < iters && send(client, session, &payload, &completed) {
            sent += 1;
        }
        client.run_event_loop_once();
    }
    start.elapsed()
}

// =============================================================================
// Criterion Benchmarks
// =============================================================================

fn bench_latency(c: &mut Criterion) {
    let setup = setup_benchmark();

    let mut group = c.benchmark_group("erpc_latency");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(3));
    group.throughput(Throughput::Elements(1));

    for (name, size) in [("32B", SMALL_MSG_SIZE), ("4KB", LARGE_MSG_SIZE)] {
        group.bench_function(BenchmarkId::new("pingpong", name), |b| {
            b.iter_custom(|iters| run_latency_bench(&setup.client, setup.session, size, iters));
        });
    }

    group.finish();
}

fn bench_throughput(c: &mut Criterion) {
    let setup = setup_benchmark();

    let mut group = c.benchmark_group("erpc_throughput");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(3));
    group.throughput(Throughput::Elements(1));

    for (name, size) in [("32B", SMALL_MSG_SIZE), ("4KB", LARGE_MSG_SIZE)] {
        group.bench_function(
            BenchmarkId::new(format!("pipelined_w{}", REQ_WINDOW), name),
            |b| {
                b.iter_custom(|iters| {
                    run_throughput_bench(&setup.client, setup.session, size, iters)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_latency, bench_throughput);
criterion_main!(benches);
