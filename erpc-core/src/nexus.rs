//! In-process session-management control plane.
//!
//! A [`Nexus`] stands for one host. Every [`Rpc`](crate::Rpc) registers a
//! hook with its nexus; SM packets are routed by destination URI to a nexus
//! (the local one or a linked peer) and then by rpc id to the hook's channel.
//! The owning `Rpc` drains that channel from its own event loop, so the only
//! shared state is the hook table behind a short-lived lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::sm::{SmErrType, SmPkt};

/// Control-plane router for one host.
pub struct Nexus {
    uri: String,
    hooks: Mutex<HashMap<u8, Sender<SmPkt>>>,
    peers: Mutex<HashMap<String, Weak<Nexus>>>,
    /// Number of upcoming SM packets to drop.
    drop_budget: AtomicUsize,
}

impl Nexus {
    /// Create a nexus for the host named `uri`.
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.into(),
            hooks: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            drop_budget: AtomicUsize::new(0),
        })
    }

    /// URI of this host.
    #[inline]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Make two nexuses reachable from each other.
    pub fn add_peer(self: &Arc<Self>, other: &Arc<Nexus>) {
        self.peers
            .lock()
            .insert(other.uri.clone(), Arc::downgrade(other));
        other
            .peers
            .lock()
            .insert(self.uri.clone(), Arc::downgrade(self));
    }

    /// Drop the next `n` SM packets routed through this nexus.
    pub fn fault_inject_drop_sm(&self, n: usize) {
        self.drop_budget.store(n, Ordering::Relaxed);
    }

    /// Number of registered endpoints.
    pub fn num_hooks(&self) -> usize {
        self.hooks.lock().len()
    }

    pub(crate) fn register_hook(&self, rpc_id: u8) -> Result<Receiver<SmPkt>> {
        let mut hooks = self.hooks.lock();
        if hooks.contains_key(&rpc_id) {
            return Err(Error::RpcIdInUse(rpc_id));
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        hooks.insert(rpc_id, tx);
        debug!(uri = %self.uri, rpc_id, "registered rpc hook");
        Ok(rx)
    }

    pub(crate) fn unregister_hook(&self, rpc_id: u8) {
        self.hooks.lock().remove(&rpc_id);
        debug!(uri = %self.uri, rpc_id, "unregistered rpc hook");
    }

    /// Route an SM packet towards its destination endpoint.
    pub(crate) fn send_sm(&self, pkt: SmPkt) {
        if self.take_drop() {
            debug!(pkt_type = ?pkt.pkt_type, "dropping SM packet (fault injection)");
            return;
        }

        if pkt.dest_uri() == self.uri {
            self.deliver(pkt);
            return;
        }

        let peer = self
            .peers
            .lock()
            .get(pkt.dest_uri())
            .and_then(Weak::upgrade);
        match peer {
            Some(peer) => peer.deliver(pkt),
            None => {
                debug!(dest = pkt.dest_uri(), pkt_type = ?pkt.pkt_type, "no route for SM packet");
            }
        }
    }

    fn take_drop(&self) -> bool {
        self.drop_budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Hand a packet addressed to this host to the target endpoint.
    fn deliver(&self, pkt: SmPkt) {
        let rpc_id = pkt.dest_rpc_id();
        let hook = self.hooks.lock().get(&rpc_id).cloned();
        match hook {
            Some(tx) => {
                trace!(uri = %self.uri, rpc_id, pkt_type = ?pkt.pkt_type, "delivering SM packet");
                // A closed channel means the endpoint is going away.
                let _ = tx.send(pkt);
            }
            None if pkt.is_request() => {
                debug!(uri = %self.uri, rpc_id, "SM request for unknown rpc id");
                self.send_sm(pkt.to_response(SmErrType::InvalidRemoteRpcId));
            }
            None => {
                trace!(uri = %self.uri, rpc_id, "SM response for unknown rpc id dropped");
            }
        }
    }
}

impl std::fmt::Debug for Nexus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nexus").field("uri", &self.uri).finish()
    }
}
