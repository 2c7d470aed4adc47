//! C5 — the placement driver: the five-step search (§4.5) and the
//! commit that turns a successful search into a [`JobResources`] record.

use tracing::{info, warn};
use tres_bitmap::{CoreBitmap, NodeBitmap};

use crate::config::CrType;
use crate::distribute::TaskDistributor;
use crate::error::{PlacementError, PlacementResult};
use crate::feasibility;
use crate::gres::GresPlugin;
use crate::model::{JobRequest, JobResources, Node, NodeUsage, Partition, PartitionOccupancy, SockCoreRep};
use crate::selector::{self, NodeCandidate};

/// Which of the five source-labeled tests produced the winning search.
/// `PriorityFit`/`SamePriorityFit` name steps 2/3 for diagnostics only —
/// neither ever labels a committed outcome, since both only prove a
/// placement *would* fit if the rows they mask were actually vacated;
/// only `IdleFit` and `RowFit` reflect occupancy as it truly stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStage {
    Probe,
    IdleFit,
    PriorityFit,
    SamePriorityFit,
    RowFit,
}

/// Everything the driver needs that is not already in `JobRequest`,
/// bundled so `search` doesn't take a dozen positional arguments.
pub struct SearchContext<'a> {
    pub nodes: &'a [Node],
    pub node_usage: &'a [NodeUsage],
    pub partitions: &'a [Partition],
    pub occupancy: &'a [PartitionOccupancy],
    pub cr_type: CrType,
    pub gres_plugin: &'a dyn GresPlugin,
    pub max_choose_nodes_retries: u32,
}

struct SearchOutcome {
    stage: SearchStage,
    picked: Vec<usize>,
    candidates: Vec<NodeCandidate>,
}

/// Runs the full five-step search and returns the stage that succeeded
/// plus the chosen node indices (positions into `ctx.nodes`), or the
/// appropriate [`PlacementError`] when every step fails.
fn run_search(job: &JobRequest, ctx: &SearchContext, test_only: bool) -> PlacementResult<Option<SearchOutcome>> {
    let (surviving, _excluded) = crate::filter::filter_nodes(job, ctx.nodes, ctx.node_usage, ctx.occupancy);
    crate::filter::check_required_nodes(job, &surviving)?;

    let own_partition = ctx
        .partitions
        .iter()
        .find(|p| p.id == job.partition_id)
        .ok_or(PlacementError::Invalid)?;

    // Test 0: bare feasibility, no occupancy mask at all.
    let attempt = |exclude: &dyn Fn(usize) -> Option<CoreBitmap>| -> Option<(Vec<usize>, Vec<NodeCandidate>)> {
        let candidates = build_candidates(job, ctx, own_partition, &surviving, exclude);
        selector::choose_nodes(job, &candidates, ctx.gres_plugin, ctx.max_choose_nodes_retries)
            .ok()
            .map(|picked| (picked, candidates))
    };

    let probe = attempt(&|_| None);
    if probe.is_none() {
        return Err(PlacementError::NoFit);
    }
    if test_only {
        return Ok(None);
    }

    // Step 1: idle-fit — subtract every row of every partition.
    let idle_exclude = |node_idx: usize| -> Option<CoreBitmap> { union_all_rows(ctx, node_idx, |_| true) };
    if let Some((picked, candidates)) = attempt(&idle_exclude) {
        return Ok(Some(SearchOutcome { stage: SearchStage::IdleFit, picked, candidates }));
    }
    // A job that forbids sharing, or that demands exclusive use of every
    // core on every node it occupies, can never land anywhere but a
    // completely idle node — the relaxed priority/row-fit steps below all
    // tolerate some form of co-tenancy, which such a job can never accept.
    if job.no_cpu_sharing || job.whole_node {
        return Err(PlacementError::NoFit);
    }

    // Step 2: priority feasibility — strictly higher priority partitions,
    // plus equal-priority partitions with preemption enabled. A pass here
    // only means preemption *could* make the job fit; nothing has
    // actually been evicted, so this can never be a committable result by
    // itself (§4.5: only idle-fit and row-fit are). Its sole job is to
    // decide which error a genuine failure below gets reported as.
    let own_priority = own_partition.priority;
    let priority_exclude = |node_idx: usize| -> Option<CoreBitmap> {
        union_all_rows(ctx, node_idx, |p| {
            p.priority > own_priority || (p.priority == own_priority && p.preempt_mode != crate::model::PreemptMode::Off)
        })
    };
    if attempt(&priority_exclude).is_none() {
        return Err(PlacementError::HigherPriorityBusy);
    }

    // Step 3: same-priority preference — also exclude same-priority rows;
    // fall back to also excluding lower-priority rows if that still
    // doesn't fit, keeping the least aggressive exclusion that succeeds.
    // Like step 2, this only informs which rows a real preemption pass
    // would need to clear — it is never committed directly.
    let same_priority_exclude = |node_idx: usize| -> Option<CoreBitmap> { union_all_rows(ctx, node_idx, |p| p.priority >= own_priority) };
    let _ = attempt(&same_priority_exclude).is_some() || {
        let all_exclude = |node_idx: usize| -> Option<CoreBitmap> { union_all_rows(ctx, node_idx, |_| true) };
        attempt(&all_exclude).is_some()
    };

    // Step 4: row-fit within the job's own partition — the other
    // genuinely committable result, since a row's bitmap reflects actual
    // occupancy rather than a hypothetical preemption mask.
    if let Some(occ) = ctx.occupancy.iter().find(|o| o.partition_id == job.partition_id) {
        for row in &occ.rows {
            let row_exclude = |node_idx: usize| -> Option<CoreBitmap> { row.core_bitmap.get(node_idx).cloned() };
            if let Some((picked, candidates)) = attempt(&row_exclude) {
                return Ok(Some(SearchOutcome { stage: SearchStage::RowFit, picked, candidates }));
            }
        }
        // Otherwise try a fresh, entirely empty row — `add_job` opens one
        // on demand when nothing existing fits (§4.1), so row-fit should
        // too; this is exactly the unmasked test-0 probe re-run within
        // the job's own partition, which already succeeded above.
        if let Some((picked, candidates)) = attempt(&|_| None) {
            return Ok(Some(SearchOutcome { stage: SearchStage::RowFit, picked, candidates }));
        }
    }

    Err(PlacementError::NoFit)
}

fn union_all_rows(ctx: &SearchContext, node_idx: usize, include_partition: impl Fn(&Partition) -> bool) -> Option<CoreBitmap> {
    let node = ctx.nodes.get(node_idx)?;
    let mut out = CoreBitmap::new(node.tot_cores() as usize);
    let mut touched = false;
    for occ in ctx.occupancy {
        let Some(partition) = ctx.partitions.iter().find(|p| p.id == occ.partition_id) else { continue };
        if !include_partition(partition) {
            continue;
        }
        for row in &occ.rows {
            if let Some(bits) = row.core_bitmap.get(node_idx) {
                out.or_assign(bits);
                touched = true;
            }
        }
    }
    touched.then_some(out)
}

fn build_candidates(
    job: &JobRequest,
    ctx: &SearchContext,
    partition: &Partition,
    surviving: &NodeBitmap,
    exclude: &dyn Fn(usize) -> Option<CoreBitmap>,
) -> Vec<NodeCandidate> {
    let required: Vec<usize> = job
        .req_node_bitmap
        .as_ref()
        .map(|bm| bm.iter_set().collect())
        .unwrap_or_default();

    let mut out = Vec::new();
    for idx in surviving.iter_set() {
        let node = &ctx.nodes[idx];
        let mut free = CoreBitmap::new_all_set(node.tot_cores() as usize);
        if let Some(excluded_bits) = exclude(idx) {
            free.and_not_assign(&excluded_bits);
        }
        let part_core_map = own_partition_rows(ctx, job.partition_id, idx);
        let avail = feasibility::feasible(
            job,
            partition,
            node,
            &free,
            part_core_map.as_ref(),
            ctx.cr_type,
            ctx.gres_plugin,
            &ctx.node_usage[idx].gres_in_use,
        );
        if !avail.is_feasible() && !required.contains(&idx) {
            continue;
        }
        out.push(NodeCandidate { idx, avail, weight: node.sched_weight, required: required.contains(&idx) });
    }
    out
}

/// Step 1's `part_core_map`: the union of the job's own partition's rows
/// on `node_idx`, fed to C3 as `partition_row_bitmap` so same-partition
/// co-tenant cores count against `max_cpus_per_node` even though they
/// are never subtracted from `free_cores` (§4.5 step 1, §4.3 step 1).
fn own_partition_rows(ctx: &SearchContext, partition_id: crate::model::PartitionId, node_idx: usize) -> Option<CoreBitmap> {
    let occ = ctx.occupancy.iter().find(|o| o.partition_id == partition_id)?;
    let node = ctx.nodes.get(node_idx)?;
    let mut out = CoreBitmap::new(node.tot_cores() as usize);
    let mut touched = false;
    for row in &occ.rows {
        if let Some(bits) = row.core_bitmap.get(node_idx) {
            out.or_assign(bits);
            touched = true;
        }
    }
    touched.then_some(out)
}

/// Runs the search; on success, builds the committed [`JobResources`]
/// and asks `distributor` to lay tasks onto it. `test_only` short
/// circuits before any commit, matching `test_only`'s no-mutation
/// contract (§6.1).
pub fn place(
    job: &JobRequest,
    ctx: &SearchContext,
    distributor: &dyn TaskDistributor,
    test_only: bool,
) -> PlacementResult<Option<JobResources>> {
    match run_search(job, ctx, test_only)? {
        None => Ok(None),
        Some(outcome) => {
            info!(job_id = %job.job_id, stage = ?outcome.stage, "placement succeeded");
            let resources = commit(job, ctx, &outcome, distributor)?;
            Ok(Some(resources))
        }
    }
}

fn commit(job: &JobRequest, ctx: &SearchContext, outcome: &SearchOutcome, distributor: &dyn TaskDistributor) -> PlacementResult<JobResources> {
    let mut picked_idx = outcome.picked.iter().map(|&p| outcome.candidates[p].idx).collect::<Vec<_>>();
    picked_idx.sort_unstable();

    let mut node_bitmap = NodeBitmap::new(ctx.nodes.len());
    for &i in &picked_idx {
        node_bitmap.set(i);
    }

    let node_ids = picked_idx.iter().map(|&i| ctx.nodes[i].id).collect::<Vec<_>>();
    let node_tot_cores: Vec<u32> = picked_idx.iter().map(|&i| ctx.nodes[i].tot_cores()).collect();

    let cpus_per_node: Vec<u32> = picked_idx
        .iter()
        .map(|&i| outcome.candidates.iter().find(|c| c.idx == i).map(|c| c.avail.avail_cpus).unwrap_or(0))
        .collect();

    // A node's committed core-range width is always its full physical
    // core count, whole-node or not — for a partial job it's just the
    // denominator `core_ranges` walks against, not the count actually
    // used (that's `cpus_per_node`).
    let cores_per_node = node_tot_cores.clone();

    let total_flat_cores: usize = cores_per_node.iter().map(|&c| c as usize).sum();
    let mut core_bitmap = CoreBitmap::new(total_flat_cores);
    let mut off = 0usize;
    for (pos, &i) in picked_idx.iter().enumerate() {
        let width = cores_per_node[pos] as usize;
        if job.whole_node {
            for local in 0..width {
                core_bitmap.set(off + local);
            }
        } else if let Some(candidate) = outcome.candidates.iter().find(|c| c.idx == i) {
            let used_cores = (candidate.avail.avail_cpus / candidate.avail.threads_per_core.max(1)).min(width as u32) as usize;
            for local in 0..used_cores {
                core_bitmap.set(off + local);
            }
        }
        off += width;
    }

    let sock_core_rep = vec![SockCoreRep {
        sockets_per_node: picked_idx.first().map(|&i| ctx.nodes[i].socket_count).unwrap_or(0),
        cores_per_socket: picked_idx.first().map(|&i| ctx.nodes[i].cores_per_socket).unwrap_or(0),
        rep_count: picked_idx.len() as u32,
    }];

    let total_cpus = if job.whole_node {
        picked_idx.iter().map(|&i| ctx.nodes[i].tot_cpus()).sum()
    } else if ctx.cr_type == CrType::Socket {
        picked_idx
            .iter()
            .map(|&i| {
                let node = &ctx.nodes[i];
                outcome
                    .candidates
                    .iter()
                    .find(|c| c.idx == i)
                    .map(|c| c.avail.sock_count * node.cores_per_socket * node.threads_per_core)
                    .unwrap_or(0)
            })
            .sum()
    } else {
        cpus_per_node.iter().sum()
    };

    let memory_per_node_mb = compute_memory_allocation(job, ctx, &picked_idx);

    let resources = JobResources {
        job_id: job.job_id,
        node_bitmap,
        node_ids,
        cpus_per_node: cpus_per_node.clone(),
        memory_per_node_mb,
        core_bitmap,
        cores_per_node,
        sock_core_rep,
        node_req: job.node_req,
        whole_node: job.whole_node,
        total_cpus,
    };

    let task_layout = distributor.distribute(job, &cpus_per_node);
    if task_layout.iter().sum::<u32>() != job.num_tasks && job.num_tasks != 0 {
        warn!(job_id = %job.job_id, "task distributor could not place every task, unwinding commit");
        return Err(PlacementError::NoFit);
    }
    Ok(resources)
}

fn compute_memory_allocation(job: &JobRequest, ctx: &SearchContext, picked_idx: &[usize]) -> Vec<u64> {
    use crate::model::MemRequirement;
    match job.pn_min_memory {
        MemRequirement::PerCpuMb(per_cpu) => picked_idx.iter().map(|&_i| per_cpu * job.pn_min_cpus as u64).collect(),
        MemRequirement::PerNodeMb(mb) => picked_idx.iter().map(|_| mb).collect(),
        MemRequirement::AllNodeMemory => {
            let lowest = picked_idx.iter().map(|&i| ctx.nodes[i].usable_memory_mb()).min().unwrap_or(0);
            picked_idx.iter().map(|_| lowest).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribute::RoundRobinDistributor;
    use crate::gres::NullGresPlugin;
    use crate::model::{
        Contiguity, GresInventory, JobId, MemRequirement, NodeId, NodeState, NodeUsage, PartitionId, PreemptMode, Row,
    };

    fn node(id: u32, sockets: u32, cores_per_socket: u32, threads_per_core: u32) -> Node {
        Node {
            id: NodeId(id),
            name: format!("node{id}"),
            socket_count: sockets,
            cores_per_socket,
            threads_per_core,
            real_memory_mb: 64_000,
            mem_spec_limit_mb: 0,
            gres_inventory: GresInventory::none(sockets as usize),
            sched_weight: 0,
        }
    }

    fn partition(id: u32, priority: i64) -> Partition {
        Partition {
            id: PartitionId(id),
            name: format!("part{id}"),
            priority,
            preempt_mode: PreemptMode::Off,
            max_cpus_per_node: None,
            oversubscribable: false,
        }
    }

    fn job(min_cpus: u32, cpus_per_task: u32, ntasks_per_node: Option<u32>) -> JobRequest {
        JobRequest {
            job_id: JobId(1),
            partition_id: PartitionId(0),
            min_cpus,
            cpus_per_task,
            num_tasks: ntasks_per_node.unwrap_or(1),
            min_nodes: 1,
            req_nodes: 1,
            max_nodes: 1,
            ntasks_per_node,
            ntasks_per_socket: None,
            ntasks_per_core: None,
            min_sockets_per_node: None,
            min_cores_per_socket: None,
            threads_per_core_cap: None,
            pn_min_cpus: min_cpus,
            pn_min_memory: MemRequirement::PerCpuMb(0),
            whole_node: false,
            node_req: NodeState::Available,
            contiguous: Contiguity::Any,
            overcommit: false,
            core_spec_threads: None,
            req_node_bitmap: None,
            gres_request: None,
            preempt_mode: PreemptMode::Off,
            no_cpu_sharing: false,
        }
    }

    /// Seed scenario 1: single empty 4-socket x 4-core x 2-thread node,
    /// `min_cpus=2, cpus_per_task=2, ntasks_per_node=1` succeeds with
    /// `avail_cpus = 2` and `total_cpus = 2`.
    #[test]
    fn seed_scenario_1_single_node_single_core_job() {
        let nodes = vec![node(0, 4, 4, 2)];
        let node_usage = vec![NodeUsage::new(NodeState::Available)];
        let partitions = vec![partition(0, 0)];
        let occupancy = vec![PartitionOccupancy::new(PartitionId(0), &[16])];
        let j = job(2, 2, Some(1));
        let ctx = SearchContext {
            nodes: &nodes,
            node_usage: &node_usage,
            partitions: &partitions,
            occupancy: &occupancy,
            cr_type: CrType::Core,
            gres_plugin: &NullGresPlugin,
            max_choose_nodes_retries: 64,
        };
        let resources = place(&j, &ctx, &RoundRobinDistributor, false).unwrap().expect("non-test_only placement returns resources");
        assert_eq!(resources.total_cpus, 2);
        assert_eq!(resources.node_ids, vec![NodeId(0)]);
    }

    /// Seed scenario 2: whole-node request against a node that already
    /// has one core used in another partition's row must fail — a
    /// whole-node job needs every core free (invariant 5, P5).
    #[test]
    fn seed_scenario_2_whole_node_blocked_by_other_partition_row() {
        let nodes = vec![node(0, 4, 4, 2)];
        let node_usage = vec![NodeUsage::new(NodeState::Available)];
        let partitions = vec![partition(0, 0), partition(1, 0)];

        let mut other_occ = PartitionOccupancy::new(PartitionId(1), &[16]);
        other_occ.rows[0].core_bitmap[0].set(0);
        let occupancy = vec![PartitionOccupancy::new(PartitionId(0), &[16]), other_occ];

        let mut j = job(1, 1, Some(1));
        j.whole_node = true;
        j.min_cpus = 1;

        let ctx = SearchContext {
            nodes: &nodes,
            node_usage: &node_usage,
            partitions: &partitions,
            occupancy: &occupancy,
            cr_type: CrType::Core,
            gres_plugin: &NullGresPlugin,
            max_choose_nodes_retries: 64,
        };
        let err = place(&j, &ctx, &RoundRobinDistributor, false).unwrap_err();
        assert_eq!(err, PlacementError::NoFit);
    }

    #[test]
    fn test_only_never_returns_resources() {
        let nodes = vec![node(0, 2, 4, 1)];
        let node_usage = vec![NodeUsage::new(NodeState::Available)];
        let partitions = vec![partition(0, 0)];
        let occupancy = vec![PartitionOccupancy::new(PartitionId(0), &[8])];
        let j = job(2, 1, Some(2));
        let ctx = SearchContext {
            nodes: &nodes,
            node_usage: &node_usage,
            partitions: &partitions,
            occupancy: &occupancy,
            cr_type: CrType::Core,
            gres_plugin: &NullGresPlugin,
            max_choose_nodes_retries: 64,
        };
        let result = place(&j, &ctx, &RoundRobinDistributor, true).unwrap();
        assert!(result.is_none());
    }

    /// Seed scenario 3: an 8-node cluster where nodes 2 and 5 are down
    /// (`Reserved`, excluded by filter rule 4 for this ordinary job)
    /// leaves three surviving index-contiguous runs of two nodes each —
    /// {0,1}, {3,4}, {6,7} — none of which is the four-node block a
    /// `Contiguity::Contiguous` request needs, so the only correct
    /// outcome is `NoFit` (the scenario's own "or fail if no 4-block
    /// exists" branch).
    #[test]
    fn seed_scenario_3_contiguous_request_fails_without_a_four_block() {
        let nodes: Vec<Node> = (0..8).map(|id| node(id, 1, 1, 1)).collect();
        let mut node_usage: Vec<NodeUsage> = (0..8).map(|_| NodeUsage::new(NodeState::Available)).collect();
        node_usage[2] = NodeUsage::new(NodeState::Reserved);
        node_usage[5] = NodeUsage::new(NodeState::Reserved);
        let partitions = vec![partition(0, 0)];
        let occupancy = vec![PartitionOccupancy::new(PartitionId(0), &vec![1; 8])];

        let mut j = job(4, 1, None);
        j.num_tasks = 4;
        j.min_nodes = 4;
        j.req_nodes = 4;
        j.max_nodes = 4;
        j.pn_min_cpus = 1;
        j.contiguous = Contiguity::Contiguous;

        let ctx = SearchContext {
            nodes: &nodes,
            node_usage: &node_usage,
            partitions: &partitions,
            occupancy: &occupancy,
            cr_type: CrType::Core,
            gres_plugin: &NullGresPlugin,
            max_choose_nodes_retries: 64,
        };
        let err = place(&j, &ctx, &RoundRobinDistributor, false).unwrap_err();
        assert_eq!(err, PlacementError::NoFit);
    }

    /// Step 4 row-fit: the job's own partition has a full first row but
    /// an empty second row, which idle-fit would have excluded (both
    /// rows subtracted) but row-fit (only one row at a time) finds.
    #[test]
    fn row_fit_finds_room_in_second_row_when_first_is_full() {
        let nodes = vec![node(0, 1, 2, 1)];
        let node_usage = vec![NodeUsage::new(NodeState::Available)];
        let partitions = vec![partition(0, 0)];

        let mut occ = PartitionOccupancy::new(PartitionId(0), &[2]);
        occ.rows[0].core_bitmap[0].set(0);
        occ.rows[0].core_bitmap[0].set(1);
        occ.rows.push(Row::empty(&[2]));
        let occupancy = vec![occ];

        let mut j = job(1, 1, Some(1));
        j.pn_min_cpus = 1;
        let ctx = SearchContext {
            nodes: &nodes,
            node_usage: &node_usage,
            partitions: &partitions,
            occupancy: &occupancy,
            cr_type: CrType::Core,
            gres_plugin: &NullGresPlugin,
            max_choose_nodes_retries: 64,
        };
        let resources = place(&j, &ctx, &RoundRobinDistributor, false).unwrap().expect("row-fit should succeed on the empty second row");
        assert_eq!(resources.node_ids, vec![NodeId(0)]);
    }
}
