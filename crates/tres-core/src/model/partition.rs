//! Partition configuration and the mutable per-partition occupancy rows
//! the engine packs job allocations into (C1).

use tres_bitmap::CoreBitmap;

use super::ids::{JobId, PartitionId};
use super::job::PreemptMode;

/// Read-only partition configuration.
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: PartitionId,
    pub name: String,
    /// Higher runs first; compared strictly in the driver's priority
    /// steps (§4.5 Step 2/3).
    pub priority: i64,
    /// Partition-wide preemption policy; `Off` means same-priority rows
    /// of this partition are never collaterally excluded in Step 2.
    pub preempt_mode: PreemptMode,
    pub max_cpus_per_node: Option<u32>,
    /// Whether this partition may run a dedicated "extra row" for QOS
    /// preemption overlays (§3.3, invariant 2's carve-out).
    pub oversubscribable: bool,
}

/// One stripe of a partition's occupancy. Core usage within a row is
/// disjoint per node (invariant 2), except on the oversubscription
/// overlay row of an oversubscribable partition.
#[derive(Debug, Clone)]
pub struct Row {
    /// Per-node core bitmap, indexed by `NodeId`, sized to each node's
    /// `tot_cores()` (zero-length entries for nodes this row has never
    /// touched are valid and treated as "no cores in use").
    pub core_bitmap: Vec<CoreBitmap>,
    pub jobs: Vec<JobId>,
}

impl Row {
    pub fn empty(node_core_counts: &[u32]) -> Self {
        Self {
            core_bitmap: node_core_counts.iter().map(|&c| CoreBitmap::new(c as usize)).collect(),
            jobs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Mutable occupancy state for one partition: `num_rows >= 1` rows, each
/// holding a row bitmap and the jobs packed into it.
#[derive(Debug, Clone)]
pub struct PartitionOccupancy {
    pub partition_id: PartitionId,
    pub rows: Vec<Row>,
    /// Dedicated extra row used by QOS preemption overlays (§3.3); present
    /// only for oversubscribable partitions, and exempt from invariant 2's
    /// disjointness requirement against the other rows.
    pub overlay_row: Option<Row>,
}

impl PartitionOccupancy {
    pub fn new(partition_id: PartitionId, node_core_counts: &[u32]) -> Self {
        Self {
            partition_id,
            rows: vec![Row::empty(node_core_counts)],
            overlay_row: None,
        }
    }
}
