//! Job-facing types: the read-only request the policy layer hands the
//! engine, and the `JobResources` record the engine produces on a
//! successful placement.

use tres_bitmap::{CoreBitmap, NodeBitmap};

use super::gres::GresJobRequest;
use super::ids::{JobId, NodeId, PartitionId};
use super::node::NodeState;

/// Per-job preemption policy (glossary: "Governs whether and how the
/// will-run simulator may evict it").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptMode {
    Off,
    Requeue,
    Cancel,
    Checkpoint,
    Suspend,
}

impl PreemptMode {
    /// Requeue/Cancel/Checkpoint/Suspend are all candidates for the
    /// will-run simulator; Off is never evicted.
    pub fn is_preemptable(self) -> bool {
        !matches!(self, PreemptMode::Off)
    }
}

/// How the job's per-task memory requirement is expressed.
#[derive(Debug, Clone, Copy)]
pub enum MemRequirement {
    PerCpuMb(u64),
    PerNodeMb(u64),
    /// Request the entire usable memory of every node it lands on.
    AllNodeMemory,
}

/// Whether nodes must form one contiguous index run (§4.4.1 item 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contiguity {
    Any,
    Contiguous,
}

/// A pending job's resource request, borrowed read-only by the engine for
/// the duration of one placement call.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: JobId,
    pub partition_id: PartitionId,

    pub min_cpus: u32,
    pub cpus_per_task: u32,
    pub num_tasks: u32,

    pub min_nodes: u32,
    pub req_nodes: u32,
    pub max_nodes: u32,

    pub ntasks_per_node: Option<u32>,
    pub ntasks_per_socket: Option<u32>,
    pub ntasks_per_core: Option<u32>,
    pub min_sockets_per_node: Option<u32>,
    pub min_cores_per_socket: Option<u32>,
    pub threads_per_core_cap: Option<u32>,

    /// Per-node minimum CPU count (`pn_min_cpus` in the source).
    pub pn_min_cpus: u32,
    pub pn_min_memory: MemRequirement,

    pub whole_node: bool,
    pub node_req: NodeState,
    pub contiguous: Contiguity,
    /// Allow `num_tasks` below `ntasks_per_node` if resources are tight.
    pub overcommit: bool,

    /// Threads of specialization reserved on the highest-indexed socket
    /// (invariant 7: "always the highest-indexed cores on the
    /// highest-indexed socket").
    pub core_spec_threads: Option<u32>,

    pub req_node_bitmap: Option<NodeBitmap>,
    pub gres_request: Option<GresJobRequest>,
    pub preempt_mode: PreemptMode,

    /// Forbids CPU sharing with other jobs (source: `details->shared == 0`).
    pub no_cpu_sharing: bool,
}

/// Run-length-encoded socket/core geometry for the nodes a job occupies,
/// in node order. A single entry with `rep_count == node_count` is the
/// common case (homogeneous cluster); heterogeneous allocations produce
/// one entry per distinct geometry run.
#[derive(Debug, Clone, Copy)]
pub struct SockCoreRep {
    pub sockets_per_node: u32,
    pub cores_per_socket: u32,
    pub rep_count: u32,
}

/// The result of a successful placement: which nodes, how many CPUs and
/// how much memory on each, and the flat core bitmap the occupancy model
/// uses for the row fit test.
#[derive(Debug, Clone)]
pub struct JobResources {
    pub job_id: JobId,
    pub node_bitmap: NodeBitmap,
    /// Occupied nodes in ascending index order — the order `core_bitmap`,
    /// `cpus_per_node`, and `memory_per_node_mb` are indexed by.
    pub node_ids: Vec<NodeId>,
    pub cpus_per_node: Vec<u32>,
    pub memory_per_node_mb: Vec<u64>,
    /// Flat, concatenated-by-node core bitmap (§3.1).
    pub core_bitmap: CoreBitmap,
    /// Committed core-range width per occupied node, parallel to
    /// `node_ids`; the cumulative sum gives each node's offset into
    /// `core_bitmap`. Precomputed once by [`JobResources::core_ranges`]
    /// at commit time so downstream consumers (the occupancy model)
    /// never need the full cluster topology to split the flat bitmap
    /// back into per-node slices.
    pub cores_per_node: Vec<u32>,
    pub sock_core_rep: Vec<SockCoreRep>,
    pub node_req: NodeState,
    pub whole_node: bool,
    pub total_cpus: u32,
}

impl JobResources {
    /// Splits the flat `core_bitmap` back into one bitmap per occupied
    /// node, using the precomputed `cores_per_node` widths.
    pub fn core_bitmap_per_node(&self) -> Vec<CoreBitmap> {
        let mut out = Vec::with_capacity(self.cores_per_node.len());
        let mut off = 0usize;
        for &width in &self.cores_per_node {
            let width = width as usize;
            let mut bm = CoreBitmap::new(width);
            for local in 0..width {
                if self.core_bitmap.test(off + local) {
                    bm.set(local);
                }
            }
            out.push(bm);
            off += width;
        }
        out
    }

    /// Compute, for every occupied node in `node_ids` order, the
    /// `(offset, width)` bit range it owns within the flat `core_bitmap`.
    /// Mirrors `add_job_res`'s `c_off`/`c_max` walk over
    /// `sock_core_rep_count`, given each node's actual physical core count
    /// (`node_tot_cores`, parallel to `node_ids`).
    ///
    /// DESIGN.md records a deliberate deviation from the source here: a
    /// node's range always advances the running offset by the *committed*
    /// width (`c_max = min(c_job, node_tot_cores))`, never the nominal
    /// geometry width (`c_job`) — so a mismatched node never desyncs every
    /// subsequent node's bit range from the bitmap's actual length (the
    /// source advances by `c_job` unconditionally, which can skip bits;
    /// see Design Note / Open Question 3).
    pub fn core_ranges(&self, node_tot_cores: &[u32]) -> Vec<(usize, usize)> {
        assert_eq!(node_tot_cores.len(), self.node_ids.len());
        let mut ranges = Vec::with_capacity(self.node_ids.len());
        let mut rep_inx = 0usize;
        let mut rep_offset = 0usize;
        let mut c_off = 0usize;

        for &tot_cores in node_tot_cores {
            if self.whole_node {
                ranges.push((c_off, tot_cores as usize));
                c_off += tot_cores as usize;
                continue;
            }
            let rep = self.sock_core_rep[rep_inx];
            let c_job = (rep.sockets_per_node * rep.cores_per_socket) as usize;
            let c_max = c_job.min(tot_cores as usize);
            ranges.push((c_off, c_max));
            c_off += c_max;

            rep_offset += 1;
            if rep_offset >= rep.rep_count as usize {
                rep_offset = 0;
                rep_inx += 1;
            }
        }
        ranges
    }
}
