//! The transient, per-node, per-placement-attempt feasibility summary
//! produced by C3 (`feasibility::feasible`) and consumed by C4
//! (`selector`).

use smallvec::SmallVec;

use super::gres::SocketGres;

/// Small-vec inline capacity for per-socket arrays. Covers everything but
/// exotic many-socket hardware before spilling to the heap (Design Note:
/// "small, stack-friendly... inline arrays with a small upper bound").
pub const INLINE_SOCKETS: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct AvailRes {
    pub avail_cpus: u32,
    pub avail_gpus: u32,
    /// `avail_cpus + avail_gpus`, the unit `choose_nodes`'s knapsack
    /// pruning threshold operates on.
    pub avail_res_cnt: u32,
    pub avail_cores_per_socket: SmallVec<[u16; INLINE_SOCKETS]>,
    pub max_cpus: u32,
    pub min_cpus: u32,
    pub sock_count: u32,
    /// Threads of specialization charged against this node (§4.3 step 8).
    pub spec_threads: u32,
    pub threads_per_core: u32,
    pub sock_gres: Vec<SocketGres>,
}

impl AvailRes {
    /// A zero-CPU result means "infeasible" (§4.3: "a zero-CPU result
    /// means infeasible").
    pub fn infeasible() -> Self {
        Self::default()
    }

    pub fn is_feasible(&self) -> bool {
        self.avail_cpus > 0
    }
}
