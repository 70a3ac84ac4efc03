//! Main RPC implementation.
//!
//! The [`Rpc`] struct is the per-thread endpoint: it owns the MsgBuffer
//! arena, the sessions, the transport and the timers, and does all its work
//! inside [`Rpc::run_event_loop_once`]. Nothing in here is shared across
//! threads; the only cross-thread path is the [`Nexus`] hook channel that
//! delivers session-management packets.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, trace, warn};

use crate::buffer::{HugeAlloc, MsgBuffer, RxRing};
use crate::config::RpcConfig;
use crate::error::{EnqueueError, Error, Result};
use crate::nexus::Nexus;
use crate::packet::{PKT_HDR_SIZE, PktHdr, PktType, max_msg_size_for};
use crate::reliability::{RetryDecision, backoff_us};
use crate::session::{
    ServerSlotState, Session, SessionHandle, SessionRole, SessionState, SessionTable,
};
use crate::sm::{SmEndpoint, SmErrType, SmEventType, SmPkt, SmPktType};
use crate::stats::{RpcStats, StatsCounters, bump};
use crate::timing::{TimerEntry, TimerKind, TimingWheel, current_time_us};
use crate::transport::{RoutingInfo, Transport, TxBurstItem};

/// Packets handed to the transport per `tx_burst` call.
const TX_BATCH: usize = 16;

/// Number of distinct request types.
const NUM_REQ_TYPES: usize = 256;

/// Continuation invoked exactly once per enqueued request.
///
/// Continuations run inside the event loop; calling
/// [`Rpc::run_event_loop_once`] from one is a no-op.
pub type Continuation<U, Tr> = fn(&Rpc<U, Tr>, Completion<U>);

/// Request handler registered with [`Rpc::register_req_func`].
pub type ReqFunc<U, Tr> = Box<dyn FnMut(&Rpc<U, Tr>, ReqHandle<'_>)>;

/// Session-management event handler.
pub type SmHandler = Box<dyn FnMut(SessionHandle, SmEventType, SmErrType)>;

/// Outcome of a request, handed to its continuation.
///
/// Ownership of both buffers and the tag returns to the application.
#[derive(Debug)]
pub struct Completion<U> {
    pub session: SessionHandle,
    pub req: MsgBuffer,
    /// On success, resized to the response length.
    pub resp: MsgBuffer,
    pub tag: U,
    /// `Err(RequestTimedOut)` once the retry budget is spent,
    /// `Err(BufferTooSmall)` if the response did not fit `resp`.
    pub result: Result<()>,
}

/// Incoming request, passed to a request handler.
///
/// `data` is a view into the receive ring (single-packet requests) or the
/// reassembly buffer and is only valid during the handler call. Respond
/// inline with [`respond`](Self::respond), or keep a [`DeferredReq`] and
/// respond later with [`Rpc::enqueue_response`].
#[derive(Debug)]
pub struct ReqHandle<'a> {
    session: SessionHandle,
    sslot_idx: usize,
    req_num: u64,
    req_type: u8,
    data: &'a [u8],
}

impl<'a> ReqHandle<'a> {
    /// Request payload.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// Server-side session the request arrived on.
    #[inline]
    pub fn session(&self) -> SessionHandle {
        self.session
    }

    /// Send the response now.
    pub fn respond<U, Tr: Transport>(self, rpc: &Rpc<U, Tr>, resp: &[u8]) -> Result<()> {
        rpc.enqueue_response(self, resp)
    }

    /// Keep the request open to respond after the handler returns.
    pub fn defer(self) -> DeferredReq {
        self.into()
    }
}

/// Token for a request whose response has not been sent yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredReq {
    session: SessionHandle,
    sslot_idx: usize,
    req_num: u64,
    req_type: u8,
}

impl DeferredReq {
    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }
}

impl From<ReqHandle<'_>> for DeferredReq {
    fn from(h: ReqHandle<'_>) -> Self {
        Self {
            session: h.session,
            sslot_idx: h.sslot_idx,
            req_num: h.req_num,
            req_type: h.req_type,
        }
    }
}

/// In-flight client request.
struct Pending<U, Tr> {
    cont: Continuation<U, Tr>,
    tag: U,
    req: MsgBuffer,
    resp: MsgBuffer,
}

/// A request taken off its slot, ready for its continuation.
struct Finished<U, Tr> {
    cont: Continuation<U, Tr>,
    completion: Completion<U>,
}

/// One packet waiting for the next flush. Resolved against live session
/// state at flush time, so packets of torn-down sessions or superseded
/// requests are skipped.
#[derive(Debug, Clone, Copy)]
struct TxDesc {
    pkt_type: PktType,
    session_num: u16,
    generation: u32,
    sslot_idx: usize,
    req_num: u64,
    pkt_num: u16,
    drop: bool,
}

#[derive(Debug, Clone, Copy)]
struct SmEvent {
    session: SessionHandle,
    event: SmEventType,
    err: SmErrType,
}

/// Where a request handler's data lives.
enum ReqData {
    /// The packet payload in the receive ring.
    Payload,
    /// Reassembly buffer in the arena.
    Arena(*const u8, usize),
}

enum ReqAction {
    Handle {
        handle: SessionHandle,
        sslot_idx: usize,
        data: ReqData,
    },
    ResendResp {
        handle: SessionHandle,
        sslot_idx: usize,
        num_pkts: u16,
    },
}

/// Return a buffer to the arena. Failure means the handle went stale.
fn release_buffer(arena: &mut HugeAlloc, buf: MsgBuffer) {
    if let Err(e) = arena.free(buf) {
        warn!(error = %e, "cannot free MsgBuffer");
    }
}

enum TimeoutOutcome<U, Tr> {
    Retransmit(SessionHandle, u16),
    GiveUp(Option<Finished<U, Tr>>),
}

/// eRPC endpoint.
///
/// `U` is the tag type attached to client requests and returned in their
/// [`Completion`]; `Tr` is the packet transport.
pub struct Rpc<U, Tr> {
    nexus: Arc<Nexus>,
    rpc_id: u8,
    config: RpcConfig,
    transport: RefCell<Tr>,
    local_routing: RoutingInfo,
    max_data_per_pkt: usize,
    arena: RefCell<HugeAlloc>,
    rx_ring: RefCell<RxRing>,
    sessions: RefCell<SessionTable<Pending<U, Tr>>>,
    /// SM packets routed to this endpoint by the nexus.
    sm_rx: Receiver<SmPkt>,
    sm_handler: RefCell<Option<SmHandler>>,
    sm_events: RefCell<VecDeque<SmEvent>>,
    dispatching_sm: Cell<bool>,
    req_funcs: RefCell<Vec<Option<ReqFunc<U, Tr>>>>,
    tx_queue: RefCell<VecDeque<TxDesc>>,
    timing_wheel: RefCell<TimingWheel>,
    /// Reused buffer for expired timers.
    expired: RefCell<Vec<TimerEntry>>,
    /// Fault injection and handshake tokens.
    rng: RefCell<StdRng>,
    stats: StatsCounters,
    in_event_loop: Cell<bool>,
}

impl<U, Tr: Transport> Rpc<U, Tr> {
    /// Create an endpoint with id `rpc_id` on `nexus`.
    ///
    /// Allocates the MsgBuffer arena and receive ring, registers them with
    /// the transport and registers the endpoint's SM hook.
    pub fn new(nexus: &Arc<Nexus>, rpc_id: u8, mut transport: Tr, config: RpcConfig) -> Result<Self> {
        config.validate()?;
        let max_data_per_pkt = transport.max_data_per_pkt();
        if config.max_msg_size > max_msg_size_for(max_data_per_pkt) {
            return Err(Error::InvalidConfig(format!(
                "max_msg_size {} exceeds {} bytes supported with {} bytes per packet",
                config.max_msg_size,
                max_msg_size_for(max_data_per_pkt),
                max_data_per_pkt
            )));
        }

        let arena = HugeAlloc::new(config.arena_size, max_data_per_pkt, config.pin_memory)?;
        let mut rx_ring = RxRing::new(
            config.num_rx_ring_entries,
            transport.mtu(),
            config.rx_batch,
            config.pin_memory,
        )?;
        transport.init_hugepage_structures(&arena, &mut rx_ring)?;

        let mut local_routing = RoutingInfo::default();
        transport.fill_local_routing_info(&mut local_routing);

        let sm_rx = nexus.register_hook(rpc_id)?;

        let mut timing_wheel = TimingWheel::default_for_rpc();
        timing_wheel.init(current_time_us());

        let rng = match config.fault_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        debug!(
            uri = nexus.uri(),
            rpc_id,
            mtu = transport.mtu(),
            local = %transport.routing_info_str(&local_routing),
            "rpc endpoint created"
        );

        Ok(Self {
            nexus: nexus.clone(),
            rpc_id,
            sessions: RefCell::new(SessionTable::new(config.max_sessions)),
            transport: RefCell::new(transport),
            local_routing,
            max_data_per_pkt,
            arena: RefCell::new(arena),
            rx_ring: RefCell::new(rx_ring),
            sm_rx,
            sm_handler: RefCell::new(None),
            sm_events: RefCell::new(VecDeque::new()),
            dispatching_sm: Cell::new(false),
            req_funcs: RefCell::new((0..NUM_REQ_TYPES).map(|_| None).collect()),
            tx_queue: RefCell::new(VecDeque::new()),
            timing_wheel: RefCell::new(timing_wheel),
            expired: RefCell::new(Vec::new()),
            rng: RefCell::new(rng),
            stats: StatsCounters::default(),
            in_event_loop: Cell::new(false),
            config,
        })
    }

    /// Set the session-management event handler.
    ///
    /// Called once per state transition of a client session.
    pub fn set_sm_handler<F>(&self, handler: F)
    where
        F: FnMut(SessionHandle, SmEventType, SmErrType) + 'static,
    {
        *self.sm_handler.borrow_mut() = Some(Box::new(handler));
    }

    /// Register the handler for requests of type `req_type`.
    pub fn register_req_func<F>(&self, req_type: u8, handler: F) -> Result<()>
    where
        F: FnMut(&Rpc<U, Tr>, ReqHandle<'_>) + 'static,
    {
        let mut funcs = self.req_funcs.borrow_mut();
        let slot = &mut funcs[req_type as usize];
        if slot.is_some() {
            return Err(Error::InvalidConfig(format!(
                "request type {} already has a handler",
                req_type
            )));
        }
        *slot = Some(Box::new(handler));
        Ok(())
    }

    // =========================================================================
    // MsgBuffers
    // =========================================================================

    /// Allocate a MsgBuffer with room for `size` bytes.
    pub fn alloc_msg_buffer(&self, size: usize) -> Result<MsgBuffer> {
        if size > self.config.max_msg_size {
            return Err(Error::MessageTooLarge {
                size,
                max: self.config.max_msg_size,
            });
        }
        self.arena.borrow_mut().alloc(size)
    }

    /// Return a MsgBuffer to the arena.
    pub fn free_msg_buffer(&self, buf: MsgBuffer) -> Result<()> {
        self.arena.borrow_mut().free(buf)
    }

    /// Change a buffer's length within its capacity.
    pub fn resize_msg_buffer(&self, buf: &MsgBuffer, len: usize) -> Result<()> {
        self.arena.borrow_mut().resize(buf, len)
    }

    /// Current length of a buffer.
    pub fn msg_len(&self, buf: &MsgBuffer) -> Result<usize> {
        self.arena.borrow().len(buf)
    }

    /// Borrow a buffer's bytes.
    ///
    /// The arena stays borrowed while the returned guard lives.
    pub fn msg_data(&self, buf: &MsgBuffer) -> Result<Ref<'_, [u8]>> {
        Ref::filter_map(self.arena.borrow(), |a| a.data(buf).ok())
            .map_err(|_| Error::InvalidMsgBuffer)
    }

    /// Borrow a buffer's bytes mutably.
    pub fn msg_data_mut(&self, buf: &MsgBuffer) -> Result<RefMut<'_, [u8]>> {
        RefMut::filter_map(self.arena.borrow_mut(), |a| a.data_mut(buf).ok())
            .map_err(|_| Error::InvalidMsgBuffer)
    }

    /// Resize `buf` to `data.len()` and copy `data` in.
    pub fn write_msg(&self, buf: &MsgBuffer, data: &[u8]) -> Result<()> {
        self.arena.borrow_mut().write(buf, data)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Start connecting to endpoint `remote_rpc_id` on host `remote_uri`.
    ///
    /// Returns immediately; the SM handler reports `Connected` or
    /// `ConnectFailed` from a later event loop iteration.
    pub fn create_session(&self, remote_uri: &str, remote_rpc_id: u8) -> Result<SessionHandle> {
        if remote_uri == self.nexus.uri() && remote_rpc_id == self.rpc_id {
            return Err(Error::InvalidRemote(format!(
                "{}/{} is this endpoint",
                remote_uri, remote_rpc_id
            )));
        }
        let uniq_token = self.rng.borrow_mut().next_u64();
        let session = Session::new(
            SessionRole::Client,
            remote_uri.to_string(),
            remote_rpc_id,
            uniq_token,
            self.config.req_window,
            self.config.max_retries,
            self.config.sm_max_retries,
        );
        let handle = self.sessions.borrow_mut().insert(session)?;
        debug!(
            session = handle.session_num(),
            remote_uri, remote_rpc_id, "connecting session"
        );
        self.send_sm_request(handle);
        Ok(handle)
    }

    /// Start tearing down a client session.
    ///
    /// A connected session moves to `DisconnectInProgress`; the disconnect
    /// request goes out once its outstanding requests have drained. A
    /// session in `Error` is freed at once. Anything else is rejected
    /// without side effects.
    pub fn destroy_session(&self, handle: SessionHandle) -> Result<()> {
        let num = handle.session_num();
        let mut sessions = self.sessions.borrow_mut();
        let Some(session) = sessions.get_mut(handle).filter(|s| s.is_client()) else {
            return Err(Error::InvalidSession(num));
        };

        match session.state {
            SessionState::Connected => {
                session.state = SessionState::DisconnectInProgress;
                let drained = session.credits.is_drained();
                if !drained {
                    debug!(
                        session = num,
                        outstanding = session.credits.outstanding(),
                        "disconnect queued until requests drain"
                    );
                    session.disconnect_queued = true;
                    return Ok(());
                }
                session.sm_retry.reset();
                drop(sessions);
                self.send_sm_request(handle);
                Ok(())
            }
            SessionState::Error => {
                if let Some(session) = sessions.remove(handle) {
                    self.free_session_buffers(session);
                }
                drop(sessions);
                debug!(session = num, "freed session in error state");
                self.push_sm_event(handle, SmEventType::Disconnected, SmErrType::NoError);
                self.dispatch_sm_events();
                Ok(())
            }
            _ => Err(Error::SessionNotConnected(num)),
        }
    }

    fn free_session_buffers(&self, mut session: Session<Pending<U, Tr>>) {
        let mut arena = self.arena.borrow_mut();
        for sslot in session.sslots.iter_mut() {
            for buf in sslot.take_server_buffers() {
                release_buffer(&mut arena, buf);
            }
            if let Some(p) = sslot.client.pending.take() {
                release_buffer(&mut arena, p.req);
                release_buffer(&mut arena, p.resp);
            }
        }
    }

    // =========================================================================
    // Requests and responses
    // =========================================================================

    /// Queue a request on a connected session.
    ///
    /// The request goes out on the next event loop iteration; `cont` runs
    /// exactly once with the response, or with an error if the request
    /// timed out. Fails without I/O if the session is not connected or has
    /// no free slot, handing the buffers and tag back.
    pub fn enqueue_request(
        &self,
        session: SessionHandle,
        req_type: u8,
        req: MsgBuffer,
        resp: MsgBuffer,
        cont: Continuation<U, Tr>,
        tag: U,
    ) -> std::result::Result<(), EnqueueError<U>> {
        let (sslot_idx, req_num, num_pkts) = {
            let mut sessions = self.sessions.borrow_mut();
            let mut arena = self.arena.borrow_mut();
            let admitted = self.admit_request(&mut sessions, &arena, session, &req, &resp);
            let (sess, sslot_idx) = match admitted {
                Ok(v) => v,
                Err(error) => {
                    return Err(EnqueueError {
                        error,
                        req,
                        resp,
                        tag,
                    });
                }
            };

            let remote_session_num = sess.remote_session_num;
            let remote_session_gen = sess.remote_session_gen;
            let window = sess.req_window() as u64;
            let sslot = &mut sess.sslots[sslot_idx];
            sslot.cur_req_num += window;
            sslot.req_type = req_type;
            sslot.client.resp_tracker.clear();
            sslot.client.resp_msg_size = 0;
            sslot.client.retry.reset();
            let req_num = sslot.cur_req_num;

            // Validated by admit_request, so header writes cannot fail.
            let msg_size = arena.len(&req).unwrap_or(0);
            let num_pkts = arena.num_pkts(&req).unwrap_or(1);
            for pkt_num in 0..num_pkts {
                if let Ok(dst) = arena.pkt_hdr_mut(&req, pkt_num) {
                    PktHdr::new(
                        PktType::Req,
                        req_type,
                        remote_session_num,
                        pkt_num,
                        num_pkts,
                        msg_size,
                        req_num,
                    )
                    .with_dest_session_gen(remote_session_gen)
                    .write_to(dst);
                }
            }

            sslot.client.pending = Some(Pending {
                cont,
                tag,
                req,
                resp,
            });
            (sslot_idx, req_num, num_pkts)
        };

        trace!(
            session = session.session_num(),
            sslot_idx, req_num, num_pkts, "request enqueued"
        );
        self.queue_pkts(PktType::Req, session, sslot_idx, req_num, num_pkts);
        self.arm_req_timer(session, sslot_idx, req_num);
        Ok(())
    }

    /// Check a request against session state and take a credit.
    fn admit_request<'s>(
        &self,
        sessions: &'s mut SessionTable<Pending<U, Tr>>,
        arena: &HugeAlloc,
        handle: SessionHandle,
        req: &MsgBuffer,
        resp: &MsgBuffer,
    ) -> Result<(&'s mut Session<Pending<U, Tr>>, usize)> {
        let num = handle.session_num();
        let session = sessions
            .get_mut(handle)
            .filter(|s| s.is_client())
            .ok_or(Error::InvalidSession(num))?;
        match session.state {
            SessionState::Connected => {}
            SessionState::Error => return Err(Error::HandshakeFailed(session.sm_err)),
            _ => return Err(Error::SessionNotConnected(num)),
        }
        if !arena.is_valid(resp) {
            return Err(Error::InvalidMsgBuffer);
        }
        let size = arena.len(req)?;
        if size > self.config.max_msg_size {
            return Err(Error::MessageTooLarge {
                size,
                max: self.config.max_msg_size,
            });
        }
        let sslot_idx = session
            .credits
            .try_acquire()
            .ok_or(Error::CreditExhausted(num))?;
        Ok((session, sslot_idx))
    }

    /// Send the response to a request.
    ///
    /// Responses that fit one packet use the slot's preallocated buffer;
    /// larger ones get a buffer from the arena, kept until the slot's next
    /// request so the response can be retransmitted.
    pub fn enqueue_response(&self, req: impl Into<DeferredReq>, resp: &[u8]) -> Result<()> {
        let req = req.into();
        if resp.len() > self.config.max_msg_size {
            return Err(Error::MessageTooLarge {
                size: resp.len(),
                max: self.config.max_msg_size,
            });
        }
        let stale = Error::StaleRequest {
            session: req.session.session_num(),
            req_num: req.req_num,
        };

        let num_pkts = {
            let mut sessions = self.sessions.borrow_mut();
            let mut arena = self.arena.borrow_mut();
            let session = sessions
                .get_mut(req.session)
                .ok_or(Error::InvalidSession(req.session.session_num()))?;
            let remote_session_num = session.remote_session_num;
            let remote_session_gen = session.remote_session_gen;
            let Some(sslot) = session.sslots.get_mut(req.sslot_idx) else {
                return Err(stale);
            };
            if sslot.cur_req_num != req.req_num || sslot.server.state != ServerSlotState::InHandler
            {
                return Err(stale);
            }

            if let Some(old) = sslot.server.dyn_resp.take() {
                arena.free(old)?;
            }
            let fits_prealloc = sslot
                .server
                .pre_resp
                .as_ref()
                .and_then(|b| arena.capacity(b).ok())
                .is_some_and(|cap| cap >= resp.len());
            if !fits_prealloc {
                sslot.server.dyn_resp = Some(arena.alloc(resp.len())?);
            }

            let buf = sslot.server.resp_buf().ok_or(Error::InvalidMsgBuffer)?;
            arena.write(buf, resp)?;
            let num_pkts = arena.num_pkts(buf)?;
            for pkt_num in 0..num_pkts {
                PktHdr::new(
                    PktType::Resp,
                    req.req_type,
                    remote_session_num,
                    pkt_num,
                    num_pkts,
                    resp.len(),
                    req.req_num,
                )
                .with_dest_session_gen(remote_session_gen)
                .write_to(arena.pkt_hdr_mut(buf, pkt_num)?);
            }
            sslot.server.state = ServerSlotState::Responded;
            num_pkts
        };

        self.queue_pkts(PktType::Resp, req.session, req.sslot_idx, req.req_num, num_pkts);
        Ok(())
    }

    fn queue_pkts(
        &self,
        pkt_type: PktType,
        handle: SessionHandle,
        sslot_idx: usize,
        req_num: u64,
        num_pkts: u16,
    ) {
        let mut queue = self.tx_queue.borrow_mut();
        for pkt_num in 0..num_pkts {
            queue.push_back(TxDesc {
                pkt_type,
                session_num: handle.session_num(),
                generation: handle.generation(),
                sslot_idx,
                req_num,
                pkt_num,
                drop: self.roll_drop(),
            });
        }
    }

    /// Decide whether fault injection drops the next packet.
    fn roll_drop(&self) -> bool {
        let p = self.config.pkt_drop_prob;
        if p <= 0.0 {
            return false;
        }
        let drop = self.rng.borrow_mut().gen_bool(p);
        if drop {
            bump(&self.stats.injected_drops, 1);
        }
        drop
    }

    fn arm_req_timer(&self, handle: SessionHandle, sslot_idx: usize, req_num: u64) {
        self.timing_wheel.borrow_mut().insert(TimerEntry {
            kind: TimerKind::Request,
            session_num: handle.session_num(),
            generation: handle.generation(),
            sslot_idx,
            seq: req_num,
            expires_at: current_time_us() + self.config.rto_us,
        });
    }

    /// Take the pending request off a slot and give its credit back.
    fn take_pending(
        session: &mut Session<Pending<U, Tr>>,
        arena: &mut HugeAlloc,
        sslot_idx: usize,
        result: Result<()>,
    ) -> Option<Finished<U, Tr>> {
        let handle = session.handle();
        let sslot = &mut session.sslots[sslot_idx];
        let pending = sslot.client.pending.take()?;
        if result.is_ok() {
            if let Err(e) = arena.resize(&pending.resp, sslot.client.resp_msg_size) {
                warn!(error = %e, "cannot resize response buffer");
            }
        }
        sslot.client.resp_tracker.clear();
        sslot.client.retry.reset();
        session.credits.release(sslot_idx);
        Some(Finished {
            cont: pending.cont,
            completion: Completion {
                session: handle,
                req: pending.req,
                resp: pending.resp,
                tag: pending.tag,
                result,
            },
        })
    }

    /// Run a continuation, then send a disconnect that was waiting on it.
    fn finish(&self, finished: Finished<U, Tr>) {
        let handle = finished.completion.session;
        (finished.cont)(self, finished.completion);

        let ready = {
            let mut sessions = self.sessions.borrow_mut();
            match sessions.get_mut(handle) {
                Some(s) if s.disconnect_ready() => {
                    s.disconnect_queued = false;
                    s.sm_retry.reset();
                    true
                }
                _ => false,
            }
        };
        if ready {
            debug!(session = handle.session_num(), "requests drained, disconnecting");
            self.send_sm_request(handle);
        }
    }

    fn invoke_req_func(&self, handle: ReqHandle<'_>) {
        let req_type = handle.req_type as usize;
        let Some(mut func) = self.req_funcs.borrow_mut()[req_type].take() else {
            return;
        };
        func(self, handle);
        let mut funcs = self.req_funcs.borrow_mut();
        if funcs[req_type].is_none() {
            funcs[req_type] = Some(func);
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Run one iteration of the event loop.
    ///
    /// Processes SM packets, received packets and expired timers, then
    /// flushes queued packets to the transport. Returns the number of
    /// events processed. Never blocks.
    pub fn run_event_loop_once(&self) -> usize {
        if self.in_event_loop.replace(true) {
            return 0;
        }
        let mut events = self.process_sm_pkts();
        events += self.process_rx();
        events += self.process_timers();
        self.flush_tx();
        self.in_event_loop.set(false);
        self.dispatch_sm_events();
        events
    }

    /// Run the event loop for `timeout_ms` milliseconds.
    pub fn run_event_loop_timeout(&self, timeout_ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            self.run_event_loop_once();
        }
    }

    fn process_rx(&self) -> usize {
        let n = {
            let mut ring = self.rx_ring.borrow_mut();
            self.transport.borrow_mut().rx_burst(&mut ring)
        };
        if n == 0 {
            return 0;
        }
        bump(&self.stats.pkts_rx, n as u64);

        {
            // Only the event loop writes the ring, and it cannot be re-entered
            // from handlers or continuations.
            let ring = self.rx_ring.borrow();
            for k in 0..n {
                self.process_pkt(ring.batch_pkt(k));
            }
        }
        self.rx_ring.borrow_mut().advance(n);
        self.transport.borrow_mut().post_recvs(n);
        n
    }

    fn process_pkt(&self, pkt: &[u8]) {
        let hdr = match PktHdr::from_bytes(pkt) {
            Ok(hdr) => hdr,
            Err(e) => {
                warn!(error = %e, len = pkt.len(), "dropping malformed packet");
                return;
            }
        };
        let payload = &pkt[PKT_HDR_SIZE..];
        if !hdr.check_payload(payload.len(), self.max_data_per_pkt) {
            warn!(?hdr, payload_len = payload.len(), "dropping inconsistent packet");
            return;
        }
        if hdr.msg_size() > self.config.max_msg_size {
            warn!(msg_size = hdr.msg_size(), "dropping packet of oversized message");
            return;
        }
        match hdr.pkt_type {
            PktType::Req => self.process_req_pkt(&hdr, payload),
            PktType::Resp => self.process_resp_pkt(&hdr, payload),
        }
    }

    /// Server side: reassemble requests and run handlers exactly once.
    fn process_req_pkt(&self, hdr: &PktHdr, payload: &[u8]) {
        let action = {
            let mut sessions = self.sessions.borrow_mut();
            let mut arena = self.arena.borrow_mut();
            let Some(session) = sessions.get_by_num_mut(hdr.dest_session_num) else {
                trace!(session = hdr.dest_session_num, "request for unknown session");
                return;
            };
            if session.is_client() || !session.accepts_data() {
                trace!(session = hdr.dest_session_num, "request for non-server session");
                return;
            }
            if hdr.dest_session_gen != session.wire_generation() {
                trace!(session = hdr.dest_session_num, "request for a previous session");
                return;
            }
            let handle = session.handle();
            let sslot_idx = session.sslot_idx(hdr.req_num);
            let sslot = &mut session.sslots[sslot_idx];

            if hdr.req_num < sslot.cur_req_num {
                trace!(req_num = hdr.req_num, cur = sslot.cur_req_num, "stale request packet");
                return;
            }

            if hdr.req_num == sslot.cur_req_num {
                match sslot.server.state {
                    ServerSlotState::Idle | ServerSlotState::InHandler => {
                        bump(&self.stats.dup_pkts_dropped, 1);
                        return;
                    }
                    ServerSlotState::Responded => {
                        // Resend the stored response once per retransmitted request.
                        if hdr.pkt_num != 0 {
                            bump(&self.stats.dup_pkts_dropped, 1);
                            return;
                        }
                        let Some(num_pkts) = sslot
                            .server
                            .resp_buf()
                            .and_then(|b| arena.num_pkts(b).ok())
                        else {
                            return;
                        };
                        trace!(req_num = hdr.req_num, "retransmitting stored response");
                        ReqAction::ResendResp {
                            handle,
                            sslot_idx,
                            num_pkts,
                        }
                    }
                    ServerSlotState::Reassembling => {
                        if hdr.num_pkts != sslot.server.req_tracker.num_pkts() {
                            warn!(req_num = hdr.req_num, "packet count changed mid-request");
                            return;
                        }
                        if sslot.server.req_tracker.has(hdr.pkt_num) {
                            bump(&self.stats.dup_pkts_dropped, 1);
                            return;
                        }
                        let Some(buf) = sslot.server.req_buf.as_ref() else {
                            return;
                        };
                        let offset = hdr.pkt_num as usize * self.max_data_per_pkt;
                        if let Err(e) = arena.write_at(buf, offset, payload) {
                            warn!(error = %e, "cannot write request packet");
                            return;
                        }
                        sslot.server.req_tracker.record(hdr.pkt_num);
                        if !sslot.server.req_tracker.is_complete() {
                            return;
                        }
                        let Ok((ptr, len)) = arena.data_raw(buf) else {
                            return;
                        };
                        sslot.server.state = ServerSlotState::InHandler;
                        ReqAction::Handle {
                            handle,
                            sslot_idx,
                            data: ReqData::Arena(ptr as *const u8, len),
                        }
                    }
                }
            } else {
                if self.req_funcs.borrow()[hdr.req_type as usize].is_none() {
                    warn!(req_type = hdr.req_type, "no handler for request type, dropping");
                    return;
                }
                let req_buf = if hdr.num_pkts > 1 {
                    let buf = match arena.alloc(hdr.msg_size()) {
                        Ok(buf) => buf,
                        Err(e) => {
                            warn!(error = %e, "cannot allocate request reassembly buffer");
                            return;
                        }
                    };
                    let offset = hdr.pkt_num as usize * self.max_data_per_pkt;
                    if let Err(e) = arena.write_at(&buf, offset, payload) {
                        warn!(error = %e, "cannot write request packet");
                        release_buffer(&mut arena, buf);
                        return;
                    }
                    Some(buf)
                } else {
                    None
                };
                for old in [sslot.server.req_buf.take(), sslot.server.dyn_resp.take()]
                    .into_iter()
                    .flatten()
                {
                    release_buffer(&mut arena, old);
                }
                sslot.cur_req_num = hdr.req_num;
                sslot.req_type = hdr.req_type;

                match req_buf {
                    None => {
                        sslot.server.req_tracker.clear();
                        sslot.server.state = ServerSlotState::InHandler;
                        ReqAction::Handle {
                            handle,
                            sslot_idx,
                            data: ReqData::Payload,
                        }
                    }
                    Some(buf) => {
                        sslot.server.req_tracker.reset(hdr.num_pkts);
                        sslot.server.req_tracker.record(hdr.pkt_num);
                        sslot.server.req_buf = Some(buf);
                        sslot.server.state = ServerSlotState::Reassembling;
                        return;
                    }
                }
            }
        };

        match action {
            ReqAction::Handle {
                handle,
                sslot_idx,
                data,
            } => {
                let data = match data {
                    ReqData::Payload => payload,
                    // SAFETY: the reassembly buffer stays allocated until the
                    // slot's next request or the session's teardown, both of
                    // which only happen inside a later event loop iteration.
                    ReqData::Arena(ptr, len) => unsafe { std::slice::from_raw_parts(ptr, len) },
                };
                self.invoke_req_func(ReqHandle {
                    session: handle,
                    sslot_idx,
                    req_num: hdr.req_num,
                    req_type: hdr.req_type,
                    data,
                });
            }
            ReqAction::ResendResp {
                handle,
                sslot_idx,
                num_pkts,
            } => {
                self.queue_pkts(PktType::Resp, handle, sslot_idx, hdr.req_num, num_pkts);
            }
        }
    }

    /// Client side: reassemble responses and complete requests.
    fn process_resp_pkt(&self, hdr: &PktHdr, payload: &[u8]) {
        let finished = {
            let mut sessions = self.sessions.borrow_mut();
            let mut arena = self.arena.borrow_mut();
            let Some(session) = sessions.get_by_num_mut(hdr.dest_session_num) else {
                trace!(session = hdr.dest_session_num, "response for unknown session");
                return;
            };
            if !session.is_client() || !session.accepts_data() {
                trace!(session = hdr.dest_session_num, "response for non-client session");
                return;
            }
            if hdr.dest_session_gen != session.wire_generation() {
                trace!(session = hdr.dest_session_num, "response for a previous session");
                return;
            }
            let sslot_idx = session.sslot_idx(hdr.req_num);
            let sslot = &mut session.sslots[sslot_idx];
            let Some(pending) = sslot.client.pending.as_ref() else {
                trace!(req_num = hdr.req_num, "response for idle slot");
                return;
            };
            if sslot.cur_req_num != hdr.req_num {
                trace!(req_num = hdr.req_num, cur = sslot.cur_req_num, "stale response packet");
                return;
            }

            let mut result = None;
            if !sslot.client.resp_tracker.is_active() {
                let available = arena.capacity(&pending.resp).unwrap_or(0);
                if hdr.msg_size() > available {
                    warn!(
                        req_num = hdr.req_num,
                        required = hdr.msg_size(),
                        available,
                        "response does not fit response buffer"
                    );
                    result = Some(Err(Error::BufferTooSmall {
                        required: hdr.msg_size(),
                        available,
                    }));
                } else {
                    sslot.client.resp_tracker.reset(hdr.num_pkts);
                    sslot.client.resp_msg_size = hdr.msg_size();
                }
            }

            if result.is_none() {
                if hdr.num_pkts != sslot.client.resp_tracker.num_pkts()
                    || hdr.msg_size() != sslot.client.resp_msg_size
                {
                    warn!(req_num = hdr.req_num, "response size changed mid-message");
                    return;
                }
                if sslot.client.resp_tracker.has(hdr.pkt_num) {
                    bump(&self.stats.dup_pkts_dropped, 1);
                    trace!(req_num = hdr.req_num, pkt_num = hdr.pkt_num, "duplicate response packet");
                    return;
                }
                let offset = hdr.pkt_num as usize * self.max_data_per_pkt;
                if let Err(e) = arena.write_at(&pending.resp, offset, payload) {
                    warn!(error = %e, "cannot write response packet");
                    return;
                }
                sslot.client.resp_tracker.record(hdr.pkt_num);
                if !sslot.client.resp_tracker.is_complete() {
                    return;
                }
                result = Some(Ok(()));
            }

            let Some(result) = result else { return };
            Self::take_pending(session, &mut arena, sslot_idx, result)
        };

        if let Some(finished) = finished {
            self.finish(finished);
        }
    }

    fn process_timers(&self) -> usize {
        let now = current_time_us();
        let mut expired = std::mem::take(&mut *self.expired.borrow_mut());
        self.timing_wheel.borrow_mut().advance_into(now, &mut expired);
        let n = expired.len();
        for entry in expired.drain(..) {
            match entry.kind {
                TimerKind::Request => self.handle_req_timeout(entry, now),
                TimerKind::SessionMgmt => self.handle_sm_timeout(entry),
            }
        }
        *self.expired.borrow_mut() = expired;
        n
    }

    fn handle_req_timeout(&self, entry: TimerEntry, now: u64) {
        let outcome = {
            let mut sessions = self.sessions.borrow_mut();
            let mut arena = self.arena.borrow_mut();
            let Some(session) = sessions.get_by_num_mut(entry.session_num) else {
                return;
            };
            if session.generation != entry.generation || !session.is_client() {
                return;
            }
            let handle = session.handle();
            let Some(sslot) = session.sslots.get_mut(entry.sslot_idx) else {
                return;
            };
            let Some(pending) = sslot.client.pending.as_ref() else {
                return;
            };
            if sslot.cur_req_num != entry.seq {
                return;
            }
            match sslot.client.retry.on_timeout() {
                RetryDecision::Retransmit => {
                    let num_pkts = arena.num_pkts(&pending.req).unwrap_or(1);
                    trace!(
                        session = entry.session_num,
                        req_num = entry.seq,
                        retry = sslot.client.retry.retries(),
                        "retransmitting request"
                    );
                    TimeoutOutcome::Retransmit(handle, num_pkts)
                }
                RetryDecision::GiveUp => {
                    warn!(
                        session = entry.session_num,
                        req_num = entry.seq,
                        "request timed out"
                    );
                    let err = Error::RequestTimedOut {
                        session: entry.session_num,
                        req_num: entry.seq,
                    };
                    TimeoutOutcome::GiveUp(Self::take_pending(
                        session,
                        &mut arena,
                        entry.sslot_idx,
                        Err(err),
                    ))
                }
            }
        };

        match outcome {
            TimeoutOutcome::Retransmit(handle, num_pkts) => {
                bump(&self.stats.retransmissions, 1);
                self.queue_pkts(PktType::Req, handle, entry.sslot_idx, entry.seq, num_pkts);
                self.timing_wheel.borrow_mut().insert(TimerEntry {
                    expires_at: now + self.config.rto_us,
                    ..entry
                });
            }
            TimeoutOutcome::GiveUp(finished) => {
                bump(&self.stats.req_timeouts, 1);
                if let Some(finished) = finished {
                    self.finish(finished);
                }
            }
        }
    }

    fn handle_sm_timeout(&self, entry: TimerEntry) {
        let handle = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(session) = sessions.get_by_num_mut(entry.session_num) else {
                return;
            };
            if session.generation != entry.generation || session.sm_seq != entry.seq {
                return;
            }
            let failed_event = match session.state {
                SessionState::ConnectInProgress => SmEventType::ConnectFailed,
                SessionState::DisconnectInProgress if !session.disconnect_queued => {
                    SmEventType::DisconnectFailed
                }
                _ => return,
            };
            let handle = session.handle();
            if session.sm_retry.on_timeout() == RetryDecision::GiveUp {
                warn!(
                    session = entry.session_num,
                    state = ?session.state,
                    "session handshake timed out"
                );
                session.state = SessionState::Error;
                session.sm_err = SmErrType::HandshakeTimedOut;
                session.sm_seq += 1;
                // The server may hold its half even though no response came back.
                let release = self.sm_pkt(session, SmPktType::DisconnectRequest);
                drop(sessions);
                self.send_release(release);
                self.push_sm_event(handle, failed_event, SmErrType::HandshakeTimedOut);
                return;
            }
            debug!(
                session = entry.session_num,
                retry = session.sm_retry.retries(),
                "retransmitting SM request"
            );
            handle
        };
        self.send_sm_request(handle);
    }

    /// Hand queued packets to the transport in bursts.
    fn flush_tx(&self) {
        let mut queue = self.tx_queue.borrow_mut();
        if queue.is_empty() {
            return;
        }
        let sessions = self.sessions.borrow();
        let arena = self.arena.borrow();
        let mut transport = self.transport.borrow_mut();

        let mut burst = [TxBurstItem::empty(); TX_BATCH];
        let mut n = 0;
        let mut sent = 0u64;
        while let Some(desc) = queue.pop_front() {
            let Some(item) = Self::tx_item(&sessions, &arena, &desc) else {
                continue;
            };
            if !item.drop {
                sent += 1;
            }
            burst[n] = item;
            n += 1;
            if n == TX_BATCH {
                transport.tx_burst(&burst[..n]);
                n = 0;
            }
        }
        if n > 0 {
            transport.tx_burst(&burst[..n]);
        }
        transport.tx_flush();
        bump(&self.stats.pkts_tx, sent);
    }

    /// Resolve a queued packet to its header and data in the arena.
    fn tx_item<'a>(
        sessions: &'a SessionTable<Pending<U, Tr>>,
        arena: &'a HugeAlloc,
        desc: &TxDesc,
    ) -> Option<TxBurstItem<'a>> {
        let session = sessions
            .get_by_num(desc.session_num)
            .filter(|s| s.generation == desc.generation)?;
        let sslot = session.sslots.get(desc.sslot_idx)?;
        if sslot.cur_req_num != desc.req_num {
            return None;
        }
        let buf = match desc.pkt_type {
            PktType::Req => &sslot.client.pending.as_ref()?.req,
            PktType::Resp => {
                if sslot.server.state != ServerSlotState::Responded {
                    return None;
                }
                sslot.server.resp_buf()?
            }
        };
        let (hdr, data) = arena.pkt(buf, desc.pkt_num).ok()?;
        Some(TxBurstItem {
            routing_info: &session.remote_routing,
            hdr,
            data,
            drop: desc.drop,
        })
    }

    // =========================================================================
    // Session management
    // =========================================================================

    fn sm_pkt(&self, session: &Session<Pending<U, Tr>>, pkt_type: SmPktType) -> SmPkt {
        SmPkt {
            pkt_type,
            err_type: SmErrType::NoError,
            uniq_token: session.uniq_token,
            req_window: session.req_window(),
            client: SmEndpoint {
                uri: self.nexus.uri().to_string(),
                rpc_id: self.rpc_id,
                session_num: session.local_session_num,
                session_gen: session.wire_generation(),
                routing_info: self.local_routing,
            },
            server: SmEndpoint {
                uri: session.remote_uri.clone(),
                rpc_id: session.remote_rpc_id,
                session_num: session.remote_session_num,
                session_gen: session.remote_session_gen,
                routing_info: RoutingInfo::default(),
            },
        }
    }

    /// Send (or resend) the handshake request for the session's state and
    /// arm its retry timer.
    fn send_sm_request(&self, handle: SessionHandle) {
        let pkt = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(session) = sessions.get_mut(handle) else {
                return;
            };
            let pkt_type = match session.state {
                SessionState::ConnectInProgress => SmPktType::ConnectRequest,
                SessionState::DisconnectInProgress => SmPktType::DisconnectRequest,
                _ => return,
            };
            session.sm_seq += 1;
            let timeout = backoff_us(self.config.sm_rto_us, session.sm_retry.retries());
            self.timing_wheel.borrow_mut().insert(TimerEntry {
                kind: TimerKind::SessionMgmt,
                session_num: handle.session_num(),
                generation: handle.generation(),
                sslot_idx: 0,
                seq: session.sm_seq,
                expires_at: current_time_us() + timeout,
            });
            self.sm_pkt(session, pkt_type)
        };
        trace!(session = handle.session_num(), pkt_type = ?pkt.pkt_type, "sending SM request");
        self.send_sm(pkt);
    }

    /// Send a one-shot DisconnectRequest for a session that failed, so the
    /// server can reclaim its half. Not retried.
    fn send_release(&self, pkt: SmPkt) {
        trace!(token = pkt.uniq_token, "releasing server half of failed session");
        self.send_sm(pkt);
    }

    fn send_sm(&self, pkt: SmPkt) {
        bump(&self.stats.sm_pkts_tx, 1);
        self.nexus.send_sm(pkt);
    }

    fn process_sm_pkts(&self) -> usize {
        let mut n = 0;
        while let Ok(pkt) = self.sm_rx.try_recv() {
            n += 1;
            bump(&self.stats.sm_pkts_rx, 1);
            match pkt.pkt_type {
                SmPktType::ConnectRequest => self.handle_connect_request(pkt),
                SmPktType::ConnectResponse => self.handle_connect_response(pkt),
                SmPktType::DisconnectRequest => self.handle_disconnect_request(pkt),
                SmPktType::DisconnectResponse => self.handle_disconnect_response(pkt),
            }
        }
        n
    }

    fn handle_connect_request(&self, pkt: SmPkt) {
        let mut sessions = self.sessions.borrow_mut();

        // A retransmitted request for a session that already exists.
        let existing = sessions
            .iter()
            .find(|s| {
                !s.is_client()
                    && s.uniq_token == pkt.uniq_token
                    && s.remote_session_num == pkt.client.session_num
                    && s.remote_rpc_id == pkt.client.rpc_id
                    && s.remote_uri == pkt.client.uri
            })
            .map(|s| s.handle());
        if let Some(handle) = existing {
            drop(sessions);
            trace!(session = handle.session_num(), "duplicate connect request");
            self.send_connect_response(&pkt, SmErrType::NoError, Some(handle));
            return;
        }

        let mut routing = pkt.client.routing_info;
        if !self
            .transport
            .borrow_mut()
            .resolve_remote_routing_info(&mut routing)
        {
            drop(sessions);
            warn!(client = %pkt.client.uri, "cannot resolve client routing info");
            self.send_connect_response(&pkt, SmErrType::RoutingResolutionFailure, None);
            return;
        }

        // Sized from the client's window so both sides agree on slot mapping.
        debug_assert!(pkt.req_window > 0);
        let mut session = Session::new(
            SessionRole::Server,
            pkt.client.uri.clone(),
            pkt.client.rpc_id,
            pkt.uniq_token,
            pkt.req_window.max(1),
            self.config.max_retries,
            self.config.sm_max_retries,
        );
        session.remote_session_num = pkt.client.session_num;
        session.remote_session_gen = pkt.client.session_gen;
        session.remote_routing = routing;
        let handle = match sessions.insert(session) {
            Ok(handle) => handle,
            Err(_) => {
                drop(sessions);
                warn!(client = %pkt.client.uri, "session table full, rejecting connect");
                self.send_connect_response(&pkt, SmErrType::TooManySessions, None);
                return;
            }
        };

        let prealloc_ok = {
            let mut arena = self.arena.borrow_mut();
            let mut ok = true;
            if let Some(session) = sessions.get_mut(handle) {
                for sslot in session.sslots.iter_mut() {
                    match arena.alloc(self.max_data_per_pkt) {
                        Ok(buf) => sslot.server.pre_resp = Some(buf),
                        Err(_) => {
                            ok = false;
                            break;
                        }
                    }
                }
            }
            ok
        };
        if !prealloc_ok {
            let removed = sessions.remove(handle);
            drop(sessions);
            if let Some(session) = removed {
                self.free_session_buffers(session);
            }
            warn!(client = %pkt.client.uri, "out of memory for response buffers, rejecting connect");
            self.send_connect_response(&pkt, SmErrType::OutOfMemory, None);
            return;
        }
        drop(sessions);

        debug!(
            session = handle.session_num(),
            client = %pkt.client.uri,
            client_rpc_id = pkt.client.rpc_id,
            req_window = pkt.req_window,
            "accepted session"
        );
        self.send_connect_response(&pkt, SmErrType::NoError, Some(handle));
    }

    fn send_connect_response(&self, req: &SmPkt, err: SmErrType, server: Option<SessionHandle>) {
        let mut resp = req.to_response(err);
        if let Some(handle) = server {
            resp.server.session_num = handle.session_num();
            resp.server.session_gen = handle.generation() as u16;
        }
        resp.server.routing_info = self.local_routing;
        self.send_sm(resp);
    }

    fn handle_connect_response(&self, pkt: SmPkt) {
        let mut sessions = self.sessions.borrow_mut();
        let Some(session) = sessions.get_by_num_mut(pkt.client.session_num) else {
            trace!(session = pkt.client.session_num, "connect response for unknown session");
            return;
        };
        if !session.is_client()
            || session.uniq_token != pkt.uniq_token
            || session.state != SessionState::ConnectInProgress
        {
            trace!(session = pkt.client.session_num, "ignoring stale connect response");
            return;
        }
        // Invalidates the handshake timer.
        session.sm_seq += 1;
        let handle = session.handle();

        if pkt.err_type != SmErrType::NoError {
            warn!(session = handle.session_num(), err = %pkt.err_type, "connect failed");
            session.state = SessionState::Error;
            session.sm_err = pkt.err_type;
            drop(sessions);
            self.push_sm_event(handle, SmEventType::ConnectFailed, pkt.err_type);
            return;
        }

        session.remote_session_num = pkt.server.session_num;
        session.remote_session_gen = pkt.server.session_gen;
        let mut routing = pkt.server.routing_info;
        if !self
            .transport
            .borrow_mut()
            .resolve_remote_routing_info(&mut routing)
        {
            warn!(session = handle.session_num(), "cannot resolve server routing info");
            session.state = SessionState::Error;
            session.sm_err = SmErrType::RoutingResolutionFailure;
            let release = self.sm_pkt(session, SmPktType::DisconnectRequest);
            drop(sessions);
            self.send_release(release);
            self.push_sm_event(
                handle,
                SmEventType::ConnectFailed,
                SmErrType::RoutingResolutionFailure,
            );
            return;
        }

        session.remote_routing = routing;
        session.state = SessionState::Connected;
        drop(sessions);
        debug!(session = handle.session_num(), "session connected");
        self.push_sm_event(handle, SmEventType::Connected, SmErrType::NoError);
    }

    fn handle_disconnect_request(&self, pkt: SmPkt) {
        let removed = {
            let mut sessions = self.sessions.borrow_mut();
            let owns = |s: &Session<Pending<U, Tr>>| {
                !s.is_client()
                    && s.uniq_token == pkt.uniq_token
                    && s.remote_session_num == pkt.client.session_num
                    && s.remote_rpc_id == pkt.client.rpc_id
                    && s.remote_uri == pkt.client.uri
            };
            // A client whose connect failed may not know the server's number.
            let handle = sessions
                .get_by_num(pkt.server.session_num)
                .filter(|s| owns(*s))
                .or_else(|| sessions.iter().find(|s| owns(*s)))
                .map(|s| s.handle());
            handle.and_then(|h| sessions.remove(h))
        };
        if let Some(session) = removed {
            debug!(session = session.local_session_num, client = %pkt.client.uri, "server session closed");
            self.free_session_buffers(session);
        }
        // Always answer, so retransmitted requests complete.
        self.send_sm(pkt.to_response(SmErrType::NoError));
    }

    fn handle_disconnect_response(&self, pkt: SmPkt) {
        let removed = {
            let mut sessions = self.sessions.borrow_mut();
            let handle = match sessions.get_by_num(pkt.client.session_num) {
                Some(s)
                    if s.is_client()
                        && s.uniq_token == pkt.uniq_token
                        && s.state == SessionState::DisconnectInProgress
                        && !s.disconnect_queued =>
                {
                    Some(s.handle())
                }
                _ => None,
            };
            handle.and_then(|h| sessions.remove(h))
        };
        let Some(mut session) = removed else {
            trace!(session = pkt.client.session_num, "ignoring stale disconnect response");
            return;
        };
        session.state = SessionState::Disconnected;
        let handle = session.handle();
        self.free_session_buffers(session);
        debug!(session = handle.session_num(), "session disconnected");
        self.push_sm_event(handle, SmEventType::Disconnected, SmErrType::NoError);
    }

    fn push_sm_event(&self, session: SessionHandle, event: SmEventType, err: SmErrType) {
        debug!(session = session.session_num(), ?event, %err, "SM event");
        self.sm_events.borrow_mut().push_back(SmEvent {
            session,
            event,
            err,
        });
    }

    /// Deliver queued SM events to the handler, one at a time.
    fn dispatch_sm_events(&self) {
        if self.dispatching_sm.replace(true) {
            return;
        }
        loop {
            let Some(ev) = self.sm_events.borrow_mut().pop_front() else {
                break;
            };
            let handler = self.sm_handler.borrow_mut().take();
            let Some(mut handler) = handler else {
                trace!(?ev, "no SM handler registered");
                continue;
            };
            handler(ev.session, ev.event, ev.err);
            let mut slot = self.sm_handler.borrow_mut();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
        self.dispatching_sm.set(false);
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Check if a session is connected.
    pub fn is_connected(&self, handle: SessionHandle) -> bool {
        self.sessions
            .borrow()
            .get(handle)
            .is_some_and(|s| s.is_connected())
    }

    /// State of a session, or `None` once it has been freed.
    pub fn session_state(&self, handle: SessionHandle) -> Option<SessionState> {
        self.sessions.borrow().get(handle).map(|s| s.state)
    }

    /// Number of requests in flight on a session.
    pub fn outstanding_requests(&self, handle: SessionHandle) -> usize {
        self.sessions
            .borrow()
            .get(handle)
            .map_or(0, |s| s.credits.outstanding())
    }

    /// Number of live sessions, client and server.
    pub fn num_active_sessions(&self) -> usize {
        self.sessions.borrow().active_count()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RpcStats {
        self.stats.snapshot()
    }

    #[inline]
    pub fn rpc_id(&self) -> u8 {
        self.rpc_id
    }

    /// URI of the host this endpoint lives on.
    #[inline]
    pub fn uri(&self) -> &str {
        self.nexus.uri()
    }

    /// Payload bytes per packet.
    #[inline]
    pub fn max_data_per_pkt(&self) -> usize {
        self.max_data_per_pkt
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }
}

impl<U, Tr> Drop for Rpc<U, Tr> {
    fn drop(&mut self) {
        self.nexus.unregister_hook(self.rpc_id);
    }
}
