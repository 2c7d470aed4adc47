//! C3 — per-node feasibility (`allocate_sc` in the source, §4.3). Given
//! one node, a job's multi-core constraints, and the core bitmap
//! currently free to it, computes the maximum [`AvailRes`] the node can
//! offer.

use smallvec::SmallVec;
use tres_bitmap::CoreBitmap;

use crate::config::CrType;
use crate::gres::{GresPlugin, GresScheduleAccumulator};
use crate::model::{AvailRes, JobRequest, MemRequirement, Node, Partition, SocketGres, INLINE_SOCKETS};

/// Per-socket scratch accounting built in step 1 and mutated through the
/// rest of the pipeline.
struct SocketAccount {
    free_cores: u32,
    used_cores: u32,
    cores_per_socket: u32,
}

/// Runs the full ten-step procedure for one node and returns the
/// resulting [`AvailRes`], or `AvailRes::infeasible()` when any gate
/// rejects the node.
#[allow(clippy::too_many_arguments)]
pub fn feasible(
    job: &JobRequest,
    partition: &Partition,
    node: &Node,
    free_core_bitmap: &CoreBitmap,
    partition_row_bitmap: Option<&CoreBitmap>,
    cr_type: CrType,
    gres_plugin: &dyn GresPlugin,
    node_gres_usage: &crate::model::GresUsage,
) -> AvailRes {
    let sockets = node.socket_count as usize;
    let cores_per_socket = node.cores_per_socket as usize;
    let threads_per_core = job
        .threads_per_core_cap
        .map(|cap| cap.min(node.threads_per_core))
        .unwrap_or(node.threads_per_core)
        .max(1);

    // Step 1: per-socket accounting.
    let mut accounts: SmallVec<[SocketAccount; INLINE_SOCKETS]> = SmallVec::with_capacity(sockets);
    for s in 0..sockets {
        let base = s * cores_per_socket;
        let mut free = 0u32;
        let mut used = 0u32;
        for c in base..base + cores_per_socket {
            let is_free = free_core_bitmap.test(c);
            if is_free {
                free += 1;
            } else {
                used += 1;
            }
            if let Some(row) = partition_row_bitmap {
                if row.test(c) {
                    // Same-partition co-tenant: still counts against the
                    // partition's per-node CPU cap even though the core
                    // itself reads "free" in the cluster-wide map.
                    used += 1;
                    if is_free {
                        free = free.saturating_sub(1);
                    }
                }
            }
        }
        accounts.push(SocketAccount { free_cores: free, used_cores: used, cores_per_socket: node.cores_per_socket });
    }

    // A whole-node job occupies every core of every node it lands on
    // (invariant 3) — any core already in use, by any job in any
    // partition, rules the node out entirely regardless of how many
    // cores would otherwise be "enough".
    if job.whole_node && accounts.iter().any(|a| a.used_cores > 0) {
        return AvailRes::infeasible();
    }

    // Step 2: entire-socket mode.
    if cr_type == CrType::Socket {
        for acc in &mut accounts {
            if acc.used_cores > 0 {
                acc.free_cores = 0;
            }
        }
    }

    // Step 3: partition CPU cap.
    if let Some(cap) = partition.max_cpus_per_node {
        let used_cpus: u32 = accounts.iter().map(|a| a.used_cores * threads_per_core).sum();
        let free_cpus: u32 = accounts.iter().map(|a| a.free_cores * threads_per_core).sum();
        if free_cpus + used_cpus > cap {
            let budget_cpus = cap.saturating_sub(used_cpus);
            let mut remaining_cores = budget_cpus / threads_per_core;
            for acc in &mut accounts {
                let take = acc.free_cores.min(remaining_cores);
                acc.free_cores = take;
                remaining_cores -= take;
            }
            let remaining_cpus: u32 = accounts.iter().map(|a| a.free_cores * threads_per_core).sum();
            if remaining_cpus < job.cpus_per_task.max(1) {
                return AvailRes::infeasible();
            }
        }
    }

    // Step 4: minimum-cores-per-socket / minimum-sockets-per-node gates.
    if let Some(min_cores) = job.min_cores_per_socket {
        for acc in &mut accounts {
            if acc.free_cores < min_cores {
                acc.free_cores = 0;
            }
        }
    }
    let usable_sockets = accounts.iter().filter(|a| a.free_cores > 0).count() as u32;
    if let Some(min_sockets) = job.min_sockets_per_node {
        if usable_sockets < min_sockets {
            return AvailRes::infeasible();
        }
    }

    // Step 5: task count.
    let mut cpus_per_task = job.cpus_per_task.max(1);
    if cpus_per_task >= 2 && job.ntasks_per_core == Some(1) && cpus_per_task > threads_per_core {
        // Round up to whole cores per task in the thread-wasteful case.
        cpus_per_task = cpus_per_task.div_ceil(threads_per_core) * threads_per_core;
    }

    let mut avail_cpus: u32 = if let Some(per_socket_cap) = job.ntasks_per_socket {
        accounts
            .iter()
            .map(|a| (a.free_cores * threads_per_core).min(per_socket_cap * cpus_per_task))
            .sum()
    } else {
        accounts.iter().map(|a| a.free_cores * threads_per_core).sum()
    };

    let num_tasks = avail_cpus / cpus_per_task.max(1);

    // Step 6: final gate. These checks use the node's uncapped capacity —
    // a node must be able to host at least this many tasks/CPUs to be
    // feasible at all, independent of how much of that capacity the job
    // will actually end up using.
    if let Some(per_node) = job.ntasks_per_node {
        if num_tasks < per_node && !job.overcommit {
            return AvailRes::infeasible();
        }
    }
    if avail_cpus < job.pn_min_cpus {
        return AvailRes::infeasible();
    }

    // Having confirmed the node is big enough, shrink `avail_cpus` down to
    // what the job actually asked for: no more tasks than `ntasks_per_node`
    // requests, and never more than the job's total `min_cpus` need (a
    // single node should never be handed more than the whole job could
    // ever use). Without this, a node's full capacity leaks into
    // `AvailRes` and `commit` ends up allocating far more cores than the
    // job requested.
    if let Some(per_node) = job.ntasks_per_node {
        let capped_tasks = num_tasks.min(per_node);
        avail_cpus = capped_tasks * cpus_per_task;
    }
    if job.min_cpus > 0 {
        avail_cpus = avail_cpus.min(job.min_cpus);
    }

    // Step 7: core selection walk.
    let cps_cap = job.ntasks_per_socket.map(|n| n * cpus_per_task);
    let mut committed_cores = CoreBitmap::new(free_core_bitmap.len());
    let mut committed_cpus: u32 = 0;
    let mut per_socket_committed_cpus: SmallVec<[u32; INLINE_SOCKETS]> = SmallVec::from_elem(0, sockets);
    'outer: for s in 0..sockets {
        if accounts[s].free_cores == 0 {
            continue;
        }
        let base = s * cores_per_socket;
        for c in base..base + cores_per_socket {
            if !free_core_bitmap.test(c) {
                continue;
            }
            if let Some(cap) = cps_cap {
                if per_socket_committed_cpus[s] >= cap {
                    continue;
                }
            }
            let charge = if cpus_per_task > threads_per_core {
                cpus_per_task.min(threads_per_core)
            } else {
                threads_per_core
            };
            committed_cores.set(c);
            committed_cpus += charge;
            per_socket_committed_cpus[s] += charge;
            if committed_cpus >= avail_cpus {
                break 'outer;
            }
        }
    }

    // Step 8: specialization.
    let mut spec_threads = 0u32;
    if let Some(core_spec) = job.core_spec_threads {
        spec_threads = core_spec.min(committed_cpus);
        committed_cpus -= spec_threads;
    }

    // Step 9: per-CPU memory re-check.
    let mut final_cpus = committed_cpus;
    if let MemRequirement::PerCpuMb(req_mem) = job.pn_min_memory {
        if req_mem > 0 {
            let avail_mem = node.usable_memory_mb();
            while final_cpus > 0 && req_mem.saturating_mul(final_cpus as u64) > avail_mem {
                final_cpus = final_cpus.saturating_sub(1);
            }
            final_cpus -= final_cpus % cpus_per_task.max(1);
        }
    }
    if final_cpus == 0 {
        return AvailRes::infeasible();
    }

    // Step 10: GRES narrowing.
    let mut avail_gpus = 0u32;
    let mut sock_gres: Vec<SocketGres> = Vec::new();
    if let Some(job_gres) = &job.gres_request {
        match gres_plugin.job_test_per_node(job_gres, &node.gres_inventory, node_gres_usage, node.socket_count) {
            Some(per_socket) => {
                let (gpus, near_gpu_count) = gres_plugin.core_filter_stage2(
                    &per_socket,
                    node.usable_memory_mb(),
                    final_cpus,
                    job_gres.requests.iter().any(|r| r.enforce_binding),
                    &mut committed_cores,
                    node.cores_per_socket,
                );
                avail_gpus = gpus;
                sock_gres = per_socket;
                // Rewrite the low byte of the node's scheduling weight to
                // bias future picks toward GRES locality; the driver
                // reads this back off `Node` via the caller, so we only
                // report the computed byte here.
                let _ = near_gpu_count;
            }
            None => return AvailRes::infeasible(),
        }
    }

    let avail_cores_per_socket: SmallVec<[u16; INLINE_SOCKETS]> =
        (0..sockets).map(|s| (per_socket_committed_cpus[s] / threads_per_core) as u16).collect();

    AvailRes {
        avail_cpus: final_cpus,
        avail_gpus,
        avail_res_cnt: final_cpus + avail_gpus,
        avail_cores_per_socket,
        max_cpus: final_cpus,
        min_cpus: job.pn_min_cpus,
        sock_count: usable_sockets,
        spec_threads,
        threads_per_core,
        sock_gres,
    }
}

/// Computes the rewritten low byte of a node's scheduling weight after
/// GRES narrowing (§4.3 step 10: "rewritten to `0xff − near_gpu_count`").
/// Kept as a standalone pure function so the driver can apply it without
/// `feasible` needing mutable access to `Node`.
pub fn gres_locality_bias(sched_weight: u64, near_gpu_count: u32) -> u64 {
    let low_byte = 0xffu64.saturating_sub(near_gpu_count as u64).min(0xff);
    (sched_weight & !0xff) | low_byte
}

/// Whether the accumulator of GRES gathered across a job's tentatively
/// picked nodes now satisfies its per-job quota (thin re-export point
/// so C4 doesn't need to import `crate::gres` directly in most call
/// sites).
pub fn gres_satisfied(job: &JobRequest, acc: &GresScheduleAccumulator, plugin: &dyn GresPlugin) -> bool {
    match &job.gres_request {
        Some(req) => plugin.job_sched_sufficient(req, acc),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gres::NullGresPlugin;
    use crate::model::{Contiguity, GresInventory, JobId, NodeId, NodeState, PartitionId, PreemptMode};

    fn node() -> Node {
        Node {
            id: NodeId(0),
            name: "n0".into(),
            socket_count: 2,
            cores_per_socket: 4,
            threads_per_core: 1,
            real_memory_mb: 16000,
            mem_spec_limit_mb: 0,
            gres_inventory: GresInventory::none(2),
            sched_weight: 0,
        }
    }

    fn job() -> JobRequest {
        JobRequest {
            job_id: JobId(1),
            partition_id: PartitionId(0),
            min_cpus: 4,
            cpus_per_task: 1,
            num_tasks: 4,
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

    fn partition() -> Partition {
        Partition {
            id: PartitionId(0),
            name: "p".into(),
            priority: 0,
            preempt_mode: PreemptMode::Off,
            max_cpus_per_node: None,
            oversubscribable: false,
        }
    }

    #[test]
    fn avail_cpus_is_capped_to_the_jobs_own_need_not_the_nodes_capacity() {
        let n = node();
        let free = CoreBitmap::new_all_set(n.tot_cores() as usize);
        let usage = crate::model::GresUsage::none(2);
        let res = feasible(&job(), &partition(), &n, &free, None, CrType::Core, &NullGresPlugin, &usage);
        // The node has 8 CPUs free but the job only needs `min_cpus = 4`;
        // `avail_cpus` must reflect what the job will use, not the node's
        // raw capacity, or `commit` ends up over-allocating cores.
        assert_eq!(res.avail_cpus, 4);
        assert!(res.is_feasible());
    }

    #[test]
    fn avail_cpus_is_capped_to_ntasks_per_node_when_set() {
        let n = node();
        let free = CoreBitmap::new_all_set(n.tot_cores() as usize);
        let usage = crate::model::GresUsage::none(2);
        let mut j = job();
        j.ntasks_per_node = Some(1);
        j.pn_min_cpus = 1;
        let res = feasible(&j, &partition(), &n, &free, None, CrType::Core, &NullGresPlugin, &usage);
        assert_eq!(res.avail_cpus, 1);
        assert!(res.is_feasible());
    }

    #[test]
    fn partition_cpu_cap_limits_avail_cpus() {
        let n = node();
        let free = CoreBitmap::new_all_set(n.tot_cores() as usize);
        let mut part = partition();
        part.max_cpus_per_node = Some(3);
        let usage = crate::model::GresUsage::none(2);
        let res = feasible(&job(), &part, &n, &free, None, CrType::Core, &NullGresPlugin, &usage);
        assert_eq!(res.avail_cpus, 3);
    }

    #[test]
    fn no_free_cores_is_infeasible() {
        let n = node();
        let free = CoreBitmap::new(n.tot_cores() as usize);
        let usage = crate::model::GresUsage::none(2);
        let res = feasible(&job(), &partition(), &n, &free, None, CrType::Core, &NullGresPlugin, &usage);
        assert!(!res.is_feasible());
    }

    /// Seed scenario 4: a 16-core node in a partition capped at 8 CPUs
    /// per node already has 4 cores claimed by another job in the same
    /// partition. Those cores still read "free" in the cluster-wide map
    /// (no cross-partition row subtracted them) but `partition_row_bitmap`
    /// marks them as co-tenant use, so the cap's budget is 8 - 4 = 4 CPUs
    /// regardless of the 12 cores the cluster-wide map reports free.
    /// Raising `pn_min_cpus` past what the cap leaves must flip the node
    /// to infeasible instead of merely shrinking `avail_cpus`.
    #[test]
    fn seed_scenario_4_partition_cap_accounts_for_same_partition_co_tenants() {
        let mut n = node();
        n.socket_count = 2;
        n.cores_per_socket = 8;
        let free = CoreBitmap::new_all_set(n.tot_cores() as usize);
        let mut co_tenant_row = CoreBitmap::new(n.tot_cores() as usize);
        for c in 0..4 {
            co_tenant_row.set(c);
        }
        let mut part = partition();
        part.max_cpus_per_node = Some(8);
        let usage = crate::model::GresUsage::none(2);

        let mut j = job();
        j.cpus_per_task = 1;
        j.pn_min_cpus = 1;
        let res = feasible(&j, &part, &n, &free, Some(&co_tenant_row), CrType::Core, &NullGresPlugin, &usage);
        assert_eq!(res.avail_cpus, 4);
        assert!(res.is_feasible());

        let mut tight = j.clone();
        tight.pn_min_cpus = 6;
        let res_tight = feasible(&tight, &part, &n, &free, Some(&co_tenant_row), CrType::Core, &NullGresPlugin, &usage);
        assert!(!res_tight.is_feasible());
    }

    #[test]
    fn min_sockets_gate_rejects_when_only_one_socket_usable() {
        let n = node();
        let mut free = CoreBitmap::new(n.tot_cores() as usize);
        for c in 0..4 {
            free.set(c); // only socket 0 has free cores
        }
        let mut j = job();
        j.min_sockets_per_node = Some(2);
        let usage = crate::model::GresUsage::none(2);
        let res = feasible(&j, &partition(), &n, &free, None, CrType::Core, &NullGresPlugin, &usage);
        assert!(!res.is_feasible());
    }
}
