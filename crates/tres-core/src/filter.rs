//! C2 — the node filter: the cheap, per-node exclusion rules applied
//! before the expensive per-node feasibility pass (§4.2).

use tracing::trace;
use tres_bitmap::NodeBitmap;

use crate::error::PlacementError;
use crate::model::{JobRequest, Node, NodeState, NodeUsage, PartitionId, PartitionOccupancy};

/// Why a node was excluded, surfaced only for logging/diagnostics — the
/// caller-visible error is derived separately once every node has been
/// checked (§7: "no single rule's rejection is reported on its own").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    InsufficientMemory,
    WholeNodeReservationConflict,
    GresUnavailable,
    ReservedForOtherJob,
    OneRowBusy,
    SharingRowBusy,
}

/// Runs the six clearing rules against every node and returns the
/// surviving node bitmap plus, for each excluded node, why.
///
/// Rules, in the order the source checks them:
/// 1. Memory insufficiency: `node.usable_memory_mb() - usage.alloc_memory_mb`
///    cannot cover the job's per-node memory requirement.
/// 2. Whole-node jobs may not land on a node carrying a `Reserved`
///    exclusive allocation for another job.
/// 3. A GRES probe that finds zero usable cores excludes the node
///    (delegated to the `GresPlugin`, not duplicated here — this rule
///    is therefore applied by the caller after `filter_nodes`, which
///    only implements the topology-independent five below).
/// 4. `Reserved` nodes may host only a job that itself requests
///    `Reserved` on an idle node; every other job is excluded.
/// 5. `OneRow` nodes reject `Reserved`- or `Available`-tagged jobs
///    outright; a `OneRow`-tagged job may still land there, but only if
///    the node isn't already hosting its one allowed row (a `OneRow`
///    node supports exactly one concurrent row for its entire
///    lifetime, so once `share_count > 0` no further job — same
///    partition or not — is added through this coarse filter) or busy
///    on a sharing row of another partition (rule 6).
/// 6. Cross-partition busy check (`_is_node_busy` in the source): a
///    `Reserved`-tagged job is excluded if the node runs jobs on *any*
///    row of *any* partition; a `OneRow`-tagged job is excluded if the
///    node runs jobs on a *sharing* row (>=2 rows) of an *other*
///    partition.
/// 7. A job forbidding sharing (`no_cpu_sharing`) cannot land on a node
///    another job already shares.
pub fn filter_nodes(
    job: &JobRequest,
    nodes: &[Node],
    usage: &[NodeUsage],
    occupancy: &[PartitionOccupancy],
) -> (NodeBitmap, Vec<(usize, ExclusionReason)>) {
    let mut bitmap = NodeBitmap::new_all_set(nodes.len());
    let mut excluded = Vec::new();

    for (i, (node, u)) in nodes.iter().zip(usage.iter()).enumerate() {
        if let Some(reason) = exclusion_reason(job, node, u, occupancy, i) {
            bitmap.clear(i);
            trace!(node = %node.name, ?reason, "filter_nodes: excluded");
            excluded.push((i, reason));
        }
    }
    (bitmap, excluded)
}

fn exclusion_reason(
    job: &JobRequest,
    node: &Node,
    usage: &NodeUsage,
    occupancy: &[PartitionOccupancy],
    node_idx: usize,
) -> Option<ExclusionReason> {
    let required_mb = match job.pn_min_memory {
        crate::model::MemRequirement::PerCpuMb(per_cpu) => per_cpu.saturating_mul(job.pn_min_cpus as u64),
        crate::model::MemRequirement::PerNodeMb(mb) => mb,
        crate::model::MemRequirement::AllNodeMemory => node.usable_memory_mb(),
    };
    let free_mb = node.usable_memory_mb().saturating_sub(usage.alloc_memory_mb);
    if free_mb < required_mb {
        return Some(ExclusionReason::InsufficientMemory);
    }

    if job.whole_node && usage.state == NodeState::Reserved && usage.share_count > 0 {
        return Some(ExclusionReason::WholeNodeReservationConflict);
    }

    // `_verify_node_state`: branch on the node's actual runtime state
    // first, the job's requested tag is only the secondary gate.
    if usage.state == NodeState::Reserved {
        if !(job.node_req == NodeState::Reserved && usage.share_count == 0) {
            return Some(ExclusionReason::ReservedForOtherJob);
        }
    } else if usage.state == NodeState::OneRow {
        if matches!(job.node_req, NodeState::Reserved | NodeState::Available) {
            return Some(ExclusionReason::OneRowBusy);
        }
        if job.node_req == NodeState::OneRow
            && (usage.share_count > 0 || is_node_busy(occupancy, job.partition_id, node_idx, true))
        {
            return Some(ExclusionReason::SharingRowBusy);
        }
    } else {
        if job.node_req == NodeState::Reserved && is_node_busy(occupancy, job.partition_id, node_idx, false) {
            return Some(ExclusionReason::ReservedForOtherJob);
        }
        if job.node_req == NodeState::OneRow && is_node_busy(occupancy, job.partition_id, node_idx, true) {
            return Some(ExclusionReason::SharingRowBusy);
        }
    }

    if job.no_cpu_sharing && usage.share_count > 0 {
        return Some(ExclusionReason::SharingRowBusy);
    }

    None
}

/// After filtering, checks that every node the job explicitly requires
/// (`req_node_bitmap`) survived. Returns the first unfit required node
/// found, per §7's `RequiredNodeUnfit` error.
pub fn check_required_nodes(job: &JobRequest, surviving: &NodeBitmap) -> Result<(), PlacementError> {
    if let Some(req) = &job.req_node_bitmap {
        for idx in req.iter_set() {
            if !surviving.test(idx) {
                return Err(PlacementError::RequiredNodeUnfit(crate::model::NodeId(idx as u32)));
            }
        }
    }
    Ok(())
}

/// Whether `node_idx` already runs jobs for *other* partitions, mirroring
/// `_is_node_busy`. When `sharing_only` is set, single-row partitions and
/// the job's own partition are skipped — a job submitted to a
/// single-row partition never conflicts with another single-row
/// partition's exclusive use of a node, only with partitions that
/// themselves allow more than one concurrent row.
pub fn is_node_busy(occupancy: &[PartitionOccupancy], own_partition: PartitionId, node_idx: usize, sharing_only: bool) -> bool {
    for occ in occupancy {
        if sharing_only && (occ.rows.len() < 2 || occ.partition_id == own_partition) {
            continue;
        }
        for row in &occ.rows {
            if row.core_bitmap.get(node_idx).map(|b| !b.is_empty()).unwrap_or(false) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Contiguity, GresInventory, GresJobRequest, JobId, MemRequirement, NodeId, PartitionId, PreemptMode};

    fn node(id: u32, mem: u64) -> Node {
        Node {
            id: NodeId(id),
            name: format!("n{id}"),
            socket_count: 2,
            cores_per_socket: 4,
            threads_per_core: 1,
            real_memory_mb: mem,
            mem_spec_limit_mb: 0,
            gres_inventory: GresInventory::none(2),
            sched_weight: 0,
        }
    }

    fn job_req(pn_min_memory: MemRequirement, whole_node: bool, node_req: NodeState, no_cpu_sharing: bool) -> JobRequest {
        JobRequest {
            job_id: JobId(1),
            partition_id: PartitionId(0),
            min_cpus: 1,
            cpus_per_task: 1,
            num_tasks: 1,
            min_nodes: 1,
            req_nodes: 0,
            max_nodes: u32::MAX,
            ntasks_per_node: None,
            ntasks_per_socket: None,
            ntasks_per_core: None,
            min_sockets_per_node: None,
            min_cores_per_socket: None,
            threads_per_core_cap: None,
            pn_min_cpus: 1,
            pn_min_memory,
            whole_node,
            node_req,
            contiguous: Contiguity::Any,
            overcommit: false,
            core_spec_threads: None,
            req_node_bitmap: None,
            gres_request: None::<GresJobRequest>,
            preempt_mode: PreemptMode::Off,
            no_cpu_sharing,
        }
    }

    #[test]
    fn insufficient_memory_excludes_node() {
        let nodes = vec![node(0, 1000)];
        let usage = vec![NodeUsage::new(NodeState::Available)];
        let job = job_req(MemRequirement::PerNodeMb(2000), false, NodeState::Available, false);
        let (bm, excluded) = filter_nodes(&job, &nodes, &usage, &[]);
        assert!(!bm.test(0));
        assert_eq!(excluded[0].1, ExclusionReason::InsufficientMemory);
    }

    #[test]
    fn one_row_node_rejects_second_row() {
        let nodes = vec![node(0, 8000)];
        let mut u = NodeUsage::new(NodeState::OneRow);
        u.share_count = 1;
        let usage = vec![u];
        let job = job_req(MemRequirement::PerNodeMb(100), false, NodeState::OneRow, false);
        let (bm, _) = filter_nodes(&job, &nodes, &usage, &[]);
        assert!(!bm.test(0));
    }

    #[test]
    fn reserved_node_rejects_job_without_matching_reservation() {
        let nodes = vec![node(0, 8000)];
        let usage = vec![NodeUsage::new(NodeState::Available)];
        let job = job_req(MemRequirement::PerNodeMb(100), false, NodeState::Reserved, false);
        let (bm, _) = filter_nodes(&job, &nodes, &usage, &[]);
        assert!(!bm.test(0));
    }

    #[test]
    fn required_node_unfit_surfaces_its_id() {
        let mut req = NodeBitmap::new(2);
        req.set(1);
        let job = JobRequest { req_node_bitmap: Some(req), ..job_req(MemRequirement::PerNodeMb(0), false, NodeState::Available, false) };
        let mut surviving = NodeBitmap::new_all_set(2);
        surviving.clear(1);
        let err = check_required_nodes(&job, &surviving).unwrap_err();
        assert_eq!(err, PlacementError::RequiredNodeUnfit(NodeId(1)));
    }
}
