//! C4 — the set selector: an inner consecutive-block picker (`eval_nodes`)
//! wrapped by an outer knapsack-pruning retry loop (`choose_nodes`),
//! §4.4.

use crate::error::{PlacementError, PlacementResult};
use crate::gres::GresScheduleAccumulator;
use crate::model::{AvailRes, Contiguity, JobRequest};

/// One candidate node as the selector sees it: its position in the
/// filtered node list, the feasibility result C3 computed for it, and
/// the scheduling weight used for set grouping and tie-breaking.
#[derive(Debug, Clone)]
pub struct NodeCandidate {
    pub idx: usize,
    pub avail: AvailRes,
    pub weight: u64,
    pub required: bool,
}

/// A maximal run of index-contiguous candidates sharing one weight.
#[derive(Debug, Clone)]
struct ConsecutiveSet {
    start: usize,
    end: usize,
    total_cpus: u32,
    node_count: u32,
    first_required: Option<usize>,
    weight: u64,
    exhausted: bool,
}

impl ConsecutiveSet {
    fn is_sufficient(&self, rem_cpus: u32, rem_nodes: u32) -> bool {
        self.total_cpus >= rem_cpus && self.node_count >= rem_nodes
    }
}

fn build_sets(candidates: &[NodeCandidate]) -> Vec<ConsecutiveSet> {
    let mut sets = Vec::new();
    let mut i = 0usize;
    while i < candidates.len() {
        let mut j = i;
        let weight = candidates[i].weight;
        let mut total_cpus = 0u32;
        let mut first_required = None;
        while j < candidates.len() && candidates[j].weight == weight && candidates[j].idx == candidates[i].idx + (j - i) {
            total_cpus += candidates[j].avail.avail_cpus;
            if candidates[j].required && first_required.is_none() {
                first_required = Some(j);
            }
            j += 1;
        }
        sets.push(ConsecutiveSet {
            start: i,
            end: j - 1,
            total_cpus,
            node_count: (j - i) as u32,
            first_required,
            weight,
            exhausted: false,
        });
        i = j;
    }
    sets
}

/// The inner consecutive-block picker. `candidates` must be in
/// ascending node-index order. Returns the chosen candidate indices
/// (into `candidates`) in the order they should be applied to the job,
/// or an error when no combination satisfies the request.
pub fn eval_nodes(
    job: &JobRequest,
    candidates: &[NodeCandidate],
    gres_plugin: &dyn crate::gres::GresPlugin,
) -> PlacementResult<Vec<usize>> {
    if candidates.is_empty() {
        return Err(PlacementError::NoFit);
    }
    let mut sets = build_sets(candidates);

    let mut rem_cpus = job.min_cpus;
    let mut rem_nodes = job.min_nodes as i64;
    let min_rem_nodes = job.req_nodes.max(job.min_nodes) as i64 - job.min_nodes as i64;
    let mut rem_tasks = job.num_tasks;
    let mut max_nodes = job.max_nodes;

    let mut chosen = Vec::new();
    let mut gres_acc = GresScheduleAccumulator::default();
    let want_gres = job.gres_request.is_some();

    // Pre-claim every required node regardless of set fit.
    for (i, c) in candidates.iter().enumerate() {
        if c.required {
            chosen.push(i);
            rem_cpus = rem_cpus.saturating_sub(c.avail.avail_cpus);
            rem_nodes -= 1;
            max_nodes = max_nodes.saturating_sub(1);
            rem_tasks = rem_tasks.saturating_sub(c.avail.avail_cpus / job.cpus_per_task.max(1));
            if want_gres {
                gres_acc.add(&c.avail.sock_gres);
            }
        }
    }

    let gres_ok = |acc: &GresScheduleAccumulator| -> bool {
        match &job.gres_request {
            Some(req) => gres_plugin.job_sched_sufficient(req, acc),
            None => true,
        }
    };

    while max_nodes > 0 && sets.iter().any(|s| !s.exhausted) {
        if rem_cpus == 0 && rem_nodes <= 0 && gres_ok(&gres_acc) {
            break;
        }

        let required_exists = chosen.iter().any(|&i| candidates[i].required) || sets.iter().any(|s| s.first_required.is_some() && !s.exhausted);
        let best = pick_best_set(&sets, rem_cpus, rem_nodes.max(0) as u32, required_exists, job.contiguous);
        let Some(best_i) = best else { return Err(PlacementError::NoFit) };

        if job.contiguous == Contiguity::Any || sets[best_i].is_sufficient(rem_cpus, rem_nodes.max(0) as u32) || sets[best_i].first_required.is_some() {
            take_from_set(&mut sets, best_i, candidates, &mut chosen, &mut rem_cpus, &mut rem_nodes, &mut max_nodes, &mut rem_tasks, job, &mut gres_acc, want_gres);
        } else {
            return Err(PlacementError::NoFit);
        }
        sets[best_i].exhausted = true;
    }

    let enough_nodes = rem_nodes <= min_rem_nodes.max(0);
    if rem_cpus == 0 && gres_ok(&gres_acc) && enough_nodes {
        let _ = rem_tasks;
        Ok(chosen)
    } else {
        Err(PlacementError::NoFit)
    }
}

#[allow(clippy::too_many_arguments)]
fn take_from_set(
    sets: &mut [ConsecutiveSet],
    set_i: usize,
    candidates: &[NodeCandidate],
    chosen: &mut Vec<usize>,
    rem_cpus: &mut u32,
    rem_nodes: &mut i64,
    max_nodes: &mut u32,
    rem_tasks: &mut u32,
    job: &JobRequest,
    gres_acc: &mut GresScheduleAccumulator,
    want_gres: bool,
) {
    let set = &sets[set_i];
    let (start, end) = (set.start, set.end);

    // Build the walk order: outward from the required node if present,
    // else a single best-fit node first, then index order.
    let mut order: Vec<usize> = Vec::new();
    if let Some(req_pos) = set.first_required {
        let mut hi = req_pos + 1;
        let mut lo = req_pos as i64 - 1;
        while hi <= end || lo >= start as i64 {
            if hi <= end {
                order.push(hi);
                hi += 1;
            }
            if lo >= start as i64 {
                order.push(lo as usize);
                lo -= 1;
            }
        }
    } else {
        let mut best_fit: Option<usize> = None;
        for k in start..=end {
            if candidates[k].avail.avail_cpus >= *rem_cpus {
                if best_fit.map(|b| candidates[k].avail.avail_cpus < candidates[b].avail.avail_cpus).unwrap_or(true) {
                    best_fit = Some(k);
                }
            }
        }
        if let Some(b) = best_fit {
            order.push(b);
        }
        for k in start..=end {
            if Some(k) != best_fit {
                order.push(k);
            }
        }
    }

    for k in order {
        if chosen.contains(&k) {
            continue;
        }
        if *rem_cpus == 0 && *rem_nodes <= 0 && (!want_gres || gres_ok_acc(job, gres_acc)) {
            break;
        }
        chosen.push(k);
        let c = &candidates[k];
        *rem_cpus = rem_cpus.saturating_sub(c.avail.avail_cpus);
        *rem_nodes -= 1;
        *max_nodes = max_nodes.saturating_sub(1);
        *rem_tasks = rem_tasks.saturating_sub(c.avail.avail_cpus / job.cpus_per_task.max(1));
        if want_gres {
            gres_acc.add(&c.avail.sock_gres);
        }
        if *max_nodes == 0 {
            break;
        }
    }
}

fn gres_ok_acc(job: &JobRequest, acc: &GresScheduleAccumulator) -> bool {
    match &job.gres_request {
        Some(req) => req.requests.iter().all(|r| acc.total(&r.name) >= r.count_per_node),
        None => true,
    }
}

fn pick_best_set(sets: &[ConsecutiveSet], rem_cpus: u32, rem_nodes: u32, required_exists: bool, contiguous: Contiguity) -> Option<usize> {
    let candidates: Vec<usize> = (0..sets.len()).filter(|&i| !sets[i].exhausted).collect();
    if candidates.is_empty() {
        return None;
    }

    if required_exists {
        if let Some(&i) = candidates.iter().find(|&&i| sets[i].first_required.is_some()) {
            return Some(i);
        }
    }

    if contiguous == Contiguity::Contiguous {
        return candidates.into_iter().filter(|&i| sets[i].is_sufficient(rem_cpus, rem_nodes)).min_by_key(|&i| sets[i].weight);
    }

    let Some(min_weight) = candidates.iter().map(|&i| sets[i].weight).min() else {
        return None;
    };
    let tied: Vec<usize> = candidates.into_iter().filter(|&i| sets[i].weight == min_weight).collect();

    if let Some(&sufficient) = tied.iter().filter(|&&i| sets[i].is_sufficient(rem_cpus, rem_nodes)).min_by_key(|&&i| sets[i].total_cpus) {
        Some(sufficient)
    } else {
        tied.into_iter().max_by_key(|&i| sets[i].total_cpus)
    }
}

/// The outer knapsack-pruning wrapper. Calls [`eval_nodes`] once; on
/// failure, incrementally raises a threshold `k` and drops every
/// non-required candidate whose `avail_res_cnt <= k`, retrying until
/// success or `rem_nodes <= min_nodes`.
pub fn choose_nodes(
    job: &JobRequest,
    all_candidates: &[NodeCandidate],
    gres_plugin: &dyn crate::gres::GresPlugin,
    max_retries: u32,
) -> PlacementResult<Vec<usize>> {
    match eval_nodes(job, all_candidates, gres_plugin) {
        Ok(picked) => return Ok(picked),
        Err(e) if all_candidates.len() as u32 <= job.min_nodes => return Err(e),
        Err(_) => {}
    }

    let max_res_cnt = all_candidates.iter().map(|c| c.avail.avail_res_cnt).max().unwrap_or(0);
    for k in 1..=max_res_cnt.min(max_retries) {
        let pruned: Vec<NodeCandidate> = all_candidates
            .iter()
            .filter(|c| c.required || c.avail.avail_res_cnt > k)
            .cloned()
            .collect();
        if (pruned.len() as u32) < job.min_nodes {
            break;
        }
        if let Ok(picked_in_pruned) = eval_nodes(job, &pruned, gres_plugin) {
            // Map back to indices in `all_candidates`.
            let mapped: Option<Vec<usize>> = picked_in_pruned
                .into_iter()
                .map(|i| all_candidates.iter().position(|c| c.idx == pruned[i].idx))
                .collect();
            if let Some(mapped) = mapped {
                return Ok(mapped);
            }
        }
    }
    Err(PlacementError::NoFit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gres::NullGresPlugin;
    use crate::model::{Contiguity, JobId, MemRequirement, NodeState, PartitionId, PreemptMode};

    fn avail(cpus: u32) -> AvailRes {
        AvailRes { avail_cpus: cpus, avail_res_cnt: cpus, max_cpus: cpus, min_cpus: 0, ..AvailRes::default() }
    }

    fn cand(idx: usize, cpus: u32, weight: u64, required: bool) -> NodeCandidate {
        NodeCandidate { idx, avail: avail(cpus), weight, required }
    }

    fn job(min_cpus: u32, min_nodes: u32, max_nodes: u32) -> JobRequest {
        JobRequest {
            job_id: JobId(1),
            partition_id: PartitionId(0),
            min_cpus,
            cpus_per_task: 1,
            num_tasks: min_cpus,
            min_nodes,
            req_nodes: min_nodes,
            max_nodes,
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

    #[test]
    fn picks_lowest_weight_set_first() {
        let candidates = vec![cand(0, 4, 10, false), cand(1, 4, 1, false), cand(2, 4, 1, false)];
        let j = job(4, 1, 4);
        let picked = eval_nodes(&j, &candidates, &NullGresPlugin).unwrap();
        assert!(picked.iter().all(|&i| candidates[i].weight == 1));
    }

    #[test]
    fn required_node_is_always_taken() {
        let candidates = vec![cand(0, 2, 5, true), cand(1, 2, 1, false)];
        let j = job(2, 1, 4);
        let picked = eval_nodes(&j, &candidates, &NullGresPlugin).unwrap();
        assert!(picked.contains(&0));
    }

    #[test]
    fn insufficient_total_cpus_fails() {
        let candidates = vec![cand(0, 1, 1, false)];
        let j = job(8, 1, 4);
        assert!(eval_nodes(&j, &candidates, &NullGresPlugin).is_err());
    }

    #[test]
    fn choose_nodes_prunes_low_value_nodes_on_retry() {
        // One well-qualified node plus several barely-qualifying ones
        // that would otherwise fragment the pick.
        let candidates = vec![cand(0, 8, 1, false), cand(1, 1, 1, false), cand(2, 1, 1, false)];
        let j = job(8, 1, 1);
        let picked = choose_nodes(&j, &candidates, &NullGresPlugin, 64).unwrap();
        assert_eq!(picked, vec![0]);
    }
}
