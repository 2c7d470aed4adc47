//! Node records consumed read-only by the engine, and the mutable
//! per-node usage counters the occupancy model maintains.

use super::gres::GresInventory;
use super::ids::NodeId;

/// A node's scheduling tag, per spec glossary: AVAILABLE nodes are
/// sharable across partitions, ONE_ROW nodes accept only one concurrent
/// row of allocation, RESERVED nodes are exclusive to a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    Available,
    OneRow,
    Reserved,
}

impl NodeState {
    /// Numeric contribution to a node's `node_state` counter (invariant
    /// 5), matching the source's `NODE_CR_AVAILABLE=0 < NODE_CR_ONE_ROW=1
    /// < NODE_CR_RESERVED=2` values.
    #[inline]
    pub fn weight(self) -> u32 {
        match self {
            NodeState::Available => 0,
            NodeState::OneRow => 1,
            NodeState::Reserved => 2,
        }
    }
}

/// Read-only node identity and hardware topology.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub socket_count: u32,
    pub cores_per_socket: u32,
    /// SMT width, aka VPUs (virtual processing units) per core.
    pub threads_per_core: u32,
    pub real_memory_mb: u64,
    /// Memory carved out for node specialization (kernel/daemons), never
    /// offered to jobs.
    pub mem_spec_limit_mb: u64,
    pub gres_inventory: GresInventory,
    /// Scheduling weight; the low byte is reusable as a locality tiebreak
    /// (see `feasibility::apply_gres_locality_bias`).
    pub sched_weight: u64,
}

impl Node {
    #[inline]
    pub fn tot_cores(&self) -> u32 {
        self.socket_count * self.cores_per_socket
    }

    #[inline]
    pub fn tot_cpus(&self) -> u32 {
        self.tot_cores() * self.threads_per_core
    }

    #[inline]
    pub fn usable_memory_mb(&self) -> u64 {
        self.real_memory_mb.saturating_sub(self.mem_spec_limit_mb)
    }
}

/// Mutable per-node occupancy counters (§3.1 "Node usage").
#[derive(Debug, Clone)]
pub struct NodeUsage {
    pub state: NodeState,
    /// Monotonic count of overlay allocations sharing this node.
    pub share_count: u32,
    pub alloc_memory_mb: u64,
    pub gres_in_use: super::gres::GresUsage,
    /// Raw invariant-5 counter backing `state`: the sum of `node_req`
    /// weights over every live job on this node. `state` is always kept
    /// in sync with it via [`NodeUsage::add_node_req`] /
    /// [`NodeUsage::remove_node_req`].
    node_state_counter: u32,
}

impl NodeUsage {
    pub fn new(state: NodeState) -> Self {
        Self {
            state,
            share_count: 0,
            alloc_memory_mb: 0,
            gres_in_use: super::gres::GresUsage::default(),
            node_state_counter: state.weight(),
        }
    }

    /// Subtract `amount` from `alloc_memory_mb`, clamping to zero and
    /// reporting whether an under-run occurred (invariant 4: "Under-run is
    /// logged and the counter is clamped to zero").
    pub fn release_memory(&mut self, amount: u64) -> bool {
        if amount > self.alloc_memory_mb {
            self.alloc_memory_mb = 0;
            true
        } else {
            self.alloc_memory_mb -= amount;
            false
        }
    }

    /// Adds `req`'s weight to the node-state counter on job placement and
    /// resyncs `state` to the resulting tier (invariant 5: `node_state[n]
    /// >= job.node_req` for every live job on `n`).
    pub fn add_node_req(&mut self, req: NodeState) {
        self.node_state_counter += req.weight();
        self.resync_state();
    }

    /// Subtracts `req`'s weight on job removal, clamping to zero
    /// (`Available`) and reporting whether an under-run occurred, the
    /// same clamp-and-log contract as [`NodeUsage::release_memory`].
    pub fn remove_node_req(&mut self, req: NodeState) -> bool {
        let amount = req.weight();
        let underran = amount > self.node_state_counter;
        self.node_state_counter = self.node_state_counter.saturating_sub(amount);
        self.resync_state();
        underran
    }

    fn resync_state(&mut self) {
        self.state = if self.node_state_counter >= NodeState::Reserved.weight() {
            NodeState::Reserved
        } else if self.node_state_counter >= NodeState::OneRow.weight() {
            NodeState::OneRow
        } else {
            NodeState::Available
        };
    }
}
