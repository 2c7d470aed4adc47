//! Data types shared between the core engine and the GRES plugin boundary
//! (`crate::gres`). The engine treats GRES inventory and usage as opaque
//! per-socket counts keyed by a GRES type name — binding logic lives
//! entirely behind the `GresPlugin` trait, per §6.2's external-collaborator
//! boundary.

use std::collections::BTreeMap;

/// A node's configured GRES inventory, per socket.
///
/// `sockets[s][name]` is the count of that GRES type wired to socket `s`.
/// An empty `sockets` vec means the node has no GRES at all.
#[derive(Debug, Clone, Default)]
pub struct GresInventory {
    pub sockets: Vec<BTreeMap<String, u32>>,
}

impl GresInventory {
    pub fn none(socket_count: usize) -> Self {
        Self {
            sockets: vec![BTreeMap::new(); socket_count],
        }
    }

    pub fn total(&self, name: &str) -> u32 {
        self.sockets.iter().filter_map(|s| s.get(name)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.iter().all(|s| s.is_empty())
    }
}

/// Per-node GRES currently allocated to live jobs, mirrored per socket.
#[derive(Debug, Clone, Default)]
pub struct GresUsage {
    pub sockets: Vec<BTreeMap<String, u32>>,
}

impl GresUsage {
    pub fn none(socket_count: usize) -> Self {
        Self {
            sockets: vec![BTreeMap::new(); socket_count],
        }
    }

    pub fn add(&mut self, socket: usize, name: &str, count: u32) {
        if socket >= self.sockets.len() {
            self.sockets.resize(socket + 1, BTreeMap::new());
        }
        *self.sockets[socket].entry(name.to_string()).or_insert(0) += count;
    }

    pub fn remove(&mut self, socket: usize, name: &str, count: u32) {
        if let Some(m) = self.sockets.get_mut(socket) {
            if let Some(v) = m.get_mut(name) {
                *v = v.saturating_sub(count);
            }
        }
    }

    pub fn used(&self, socket: usize, name: &str) -> u32 {
        self.sockets.get(socket).and_then(|m| m.get(name)).copied().unwrap_or(0)
    }
}

/// A job's request for GRES, per §6.2's `job_gres` argument: a named
/// type, a total count across the whole job, and whether binding to the
/// socket of the consuming task is mandatory.
#[derive(Debug, Clone, Default)]
pub struct GresJobRequest {
    pub requests: Vec<GresTypeRequest>,
}

#[derive(Debug, Clone)]
pub struct GresTypeRequest {
    pub name: String,
    pub count_per_node: u32,
    pub enforce_binding: bool,
}

impl GresJobRequest {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Per-socket GRES availability computed by the GRES filter for one node
/// (§4.3 step 10, §6.2 `core_filter_stage2`/`stage3`).
#[derive(Debug, Clone, Default)]
pub struct SocketGres {
    pub socket: usize,
    pub available: BTreeMap<String, u32>,
}
