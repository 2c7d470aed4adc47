//! Task-to-node distribution, the step the driver runs after a
//! placement commits to decide how many of the job's tasks land on each
//! occupied node (§5: "task distribution is delegated to an external
//! collaborator").

use crate::model::JobRequest;

/// Spreads a job's tasks across the nodes it was placed on.
pub trait TaskDistributor: Send + Sync {
    /// `cpus_per_node` and the returned vec are both in the placement's
    /// node order. The sum of the result must equal `job.num_tasks` when
    /// `job.num_tasks` is nonzero, and never exceed the per-node CPU
    /// capacity offered.
    fn distribute(&self, job: &JobRequest, cpus_per_node: &[u32]) -> Vec<u32>;
}

/// Fills nodes in order up to `ntasks_per_node` (or the node's CPU count
/// when unset), wrapping back over the node list until every task is
/// placed. Matches the common case in the source's `_cr_job_list_sort`-
/// agnostic task layout: round-robin by node index bounded by per-node
/// CPU availability.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinDistributor;

impl TaskDistributor for RoundRobinDistributor {
    fn distribute(&self, job: &JobRequest, cpus_per_node: &[u32]) -> Vec<u32> {
        let n = cpus_per_node.len();
        if n == 0 {
            return Vec::new();
        }
        let mut tasks = vec![0u32; n];
        if job.num_tasks == 0 {
            return tasks;
        }
        let per_node_cap: Vec<u32> = cpus_per_node
            .iter()
            .map(|&cpus| job.ntasks_per_node.unwrap_or(cpus).min(cpus.max(1)))
            .collect();

        let mut remaining = job.num_tasks;
        let mut idx = 0usize;
        let mut stalled_pass = 0usize;
        while remaining > 0 && stalled_pass < n {
            if tasks[idx] < per_node_cap[idx] {
                tasks[idx] += 1;
                remaining -= 1;
                stalled_pass = 0;
            } else {
                stalled_pass += 1;
            }
            idx = (idx + 1) % n;
        }
        // Whatever the caps could not absorb still lands somewhere so the
        // task count invariant holds; pile it onto the last node rather
        // than silently dropping tasks.
        if remaining > 0 {
            tasks[n - 1] += remaining;
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Contiguity, GresJobRequest, JobId, MemRequirement, NodeState, PartitionId, PreemptMode};

    fn job(num_tasks: u32, ntasks_per_node: Option<u32>) -> JobRequest {
        JobRequest {
            job_id: JobId(1),
            partition_id: PartitionId(0),
            min_cpus: 1,
            cpus_per_task: 1,
            num_tasks,
            min_nodes: 1,
            req_nodes: 0,
            max_nodes: u32::MAX,
            ntasks_per_node,
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
            gres_request: None::<GresJobRequest>,
            preempt_mode: PreemptMode::Off,
            no_cpu_sharing: false,
        }
    }

    #[test]
    fn splits_tasks_evenly_round_robin() {
        let j = job(6, None);
        let result = RoundRobinDistributor.distribute(&j, &[4, 4, 4]);
        assert_eq!(result.iter().sum::<u32>(), 6);
        assert_eq!(result, vec![2, 2, 2]);
    }

    #[test]
    fn respects_per_node_cap_then_overflows_last_node() {
        let j = job(5, Some(1));
        let result = RoundRobinDistributor.distribute(&j, &[2, 2]);
        assert_eq!(result.iter().sum::<u32>(), 5);
        assert_eq!(result[0], 1);
    }

    #[test]
    fn zero_tasks_means_zero_everywhere() {
        let j = job(0, None);
        let result = RoundRobinDistributor.distribute(&j, &[4, 4]);
        assert_eq!(result, vec![0, 0]);
    }
}
