//! The `Cluster`: the top-level, single-threaded handle the scheduler's
//! policy layer calls into (§6.1). Bundles cluster state and wires
//! C1–C5 together behind the four exposed operations.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::distribute::{RoundRobinDistributor, TaskDistributor};
use crate::error::{PlacementError, PlacementResult};
use crate::gres::{GresPlugin, NullGresPlugin};
use crate::model::{JobId, JobRequest, JobResources, Node, NodeUsage, Partition, PartitionOccupancy};
use crate::{driver, occupancy};

/// Action codes for [`Cluster::remove_job`], mirroring §4.1: 0 releases
/// cores, memory, and GRES; 1 releases memory and GRES only (a
/// suspended job completing); 2 releases cores only (suspending it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveAction {
    Full,
    MemoryAndGresOnly,
    CoresOnly,
}

pub struct Cluster {
    pub nodes: Vec<Node>,
    pub node_usage: Vec<NodeUsage>,
    pub partitions: Vec<Partition>,
    pub occupancy: Vec<PartitionOccupancy>,
    pub jobs: HashMap<JobId, JobResources>,
    pub config: EngineConfig,
    /// Set while the plugin is being initialized from a scheduler
    /// restart's running-job list; placement calls during this window
    /// are no-ops that only replay occupancy bookkeeping (§6.4:
    /// "live state is rebuilt from running jobs on startup").
    pub replaying: bool,
    gres_plugin: Box<dyn GresPlugin>,
    distributor: Box<dyn TaskDistributor>,
}

impl Cluster {
    pub fn new(nodes: Vec<Node>, partitions: Vec<Partition>, config: EngineConfig) -> Self {
        let node_core_counts: Vec<u32> = nodes.iter().map(|n| n.tot_cores()).collect();
        let node_usage = nodes
            .iter()
            .map(|n| {
                let mut usage = NodeUsage::new(crate::model::NodeState::Available);
                usage.gres_in_use = crate::model::GresUsage::none(n.socket_count as usize);
                usage
            })
            .collect();
        let occupancy = partitions.iter().map(|p| PartitionOccupancy::new(p.id, &node_core_counts)).collect();
        Self {
            nodes,
            node_usage,
            partitions,
            occupancy,
            jobs: HashMap::new(),
            config,
            replaying: false,
            gres_plugin: Box::new(NullGresPlugin),
            distributor: Box::new(RoundRobinDistributor),
        }
    }

    pub fn with_gres_plugin(mut self, plugin: Box<dyn GresPlugin>) -> Self {
        self.gres_plugin = plugin;
        self
    }

    pub fn with_distributor(mut self, distributor: Box<dyn TaskDistributor>) -> Self {
        self.distributor = distributor;
        self
    }

    fn ctx(&self) -> driver::SearchContext<'_> {
        driver::SearchContext {
            nodes: &self.nodes,
            node_usage: &self.node_usage,
            partitions: &self.partitions,
            occupancy: &self.occupancy,
            cr_type: self.config.cr_type,
            gres_plugin: self.gres_plugin.as_ref(),
            max_choose_nodes_retries: self.config.max_choose_nodes_retries,
        }
    }

    /// Feasibility probe; mutates nothing regardless of `replaying`.
    pub fn test_only(&self, job: &JobRequest) -> PlacementResult<()> {
        driver::place(job, &self.ctx(), self.distributor.as_ref(), true).map(|_| ())
    }

    /// Allocates the job immediately. On success the job's
    /// [`JobResources`] is recorded and the occupancy maps are updated.
    pub fn run_now(&mut self, job: &JobRequest) -> PlacementResult<JobResources> {
        let resources = driver::place(job, &self.ctx(), self.distributor.as_ref(), false)?.ok_or_else(|| {
            PlacementError::Internal("driver returned no resources for a non-test_only call".into())
        })?;
        if self.replaying {
            info!(job_id = %job.job_id, "run_now no-op while replaying startup state");
            return Ok(resources);
        }
        self.commit_resources(job, &resources);
        Ok(resources)
    }

    fn commit_resources(&mut self, job: &JobRequest, resources: &JobResources) {
        let node_core_counts: Vec<u32> = self.nodes.iter().map(|n| n.tot_cores()).collect();
        if let Some(occ) = self.occupancy.iter_mut().find(|o| o.partition_id == job.partition_id) {
            occupancy::add_job(occ, resources, &node_core_counts);
        }
        let mem_per_node = resources.memory_per_node_mb.clone();
        for (pos, &node_id) in resources.node_ids.iter().enumerate() {
            let idx = node_id.index();
            if let Some(usage) = self.node_usage.get_mut(idx) {
                usage.alloc_memory_mb += mem_per_node.get(pos).copied().unwrap_or(0);
                usage.share_count += 1;
                usage.add_node_req(job.node_req);
            }
        }
        self.jobs.insert(job.job_id, resources.clone());
        info!(job_id = %job.job_id, nodes = resources.node_ids.len(), "job committed");
    }

    /// Computes the earliest feasible start time by simulating
    /// termination of running jobs, without mutating durable state
    /// (§4.6, invariant P8).
    pub fn will_run_test(&self, job: &JobRequest, preemptees: &[JobId]) -> PlacementResult<Vec<JobId>> {
        let mut future_usage = self.node_usage.clone();
        let mut future_occupancy = self.occupancy.clone();
        let mut removed = Vec::new();

        // Full search (not the bare test_only probe) against the current
        // state: a `place` call against a read-only `SearchContext` never
        // mutates `self`, commit only happens via `commit_resources`, so
        // this is safe to run for its feasibility answer alone.
        if driver::place(job, &self.ctx(), self.distributor.as_ref(), false).is_ok() {
            return Ok(removed);
        }

        let start = std::time::Instant::now();
        let budget = std::time::Duration::from_secs(self.config.will_run.wall_clock_budget_secs);

        for &candidate_job in preemptees {
            if start.elapsed() > budget {
                warn!("will_run_test: wall clock budget exceeded, stopping simulation early");
                break;
            }
            let Some(resources) = self.jobs.get(&candidate_job) else { continue };
            for occ in &mut future_occupancy {
                if occupancy::remove_job(occ, candidate_job, &resources.core_bitmap_per_node()) {
                    removed.push(candidate_job);
                    break;
                }
            }
            for &node_id in &resources.node_ids {
                if let Some(usage) = future_usage.get_mut(node_id.index()) {
                    usage.share_count = usage.share_count.saturating_sub(1);
                }
            }

            let simulated_ctx = driver::SearchContext {
                nodes: &self.nodes,
                node_usage: &future_usage,
                partitions: &self.partitions,
                occupancy: &future_occupancy,
                cr_type: self.config.cr_type,
                gres_plugin: self.gres_plugin.as_ref(),
                max_choose_nodes_retries: self.config.max_choose_nodes_retries,
            };
            if driver::place(job, &simulated_ctx, self.distributor.as_ref(), false).is_ok() {
                return Ok(removed);
            }
        }

        Err(PlacementError::NoFit)
    }

    /// Releases `job`'s cores, memory, and/or GRES per `action`.
    pub fn remove_job(&mut self, job_id: JobId, partition_id: crate::model::PartitionId, action: RemoveAction) -> PlacementResult<()> {
        if self.replaying {
            info!(job_id = %job_id, "remove_job no-op while replaying startup state");
            return Ok(());
        }
        let Some(resources) = self.jobs.get(&job_id).cloned() else {
            return Err(PlacementError::Invalid);
        };

        if action != RemoveAction::MemoryAndGresOnly {
            let node_core_counts: Vec<u32> = self.nodes.iter().map(|n| n.tot_cores()).collect();
            if let Some(occ) = self.occupancy.iter_mut().find(|o| o.partition_id == partition_id) {
                if occupancy::remove_job(occ, job_id, &resources.core_bitmap_per_node()) {
                    occupancy::rebuild_partition(occ, &node_core_counts, |id| self.jobs.get(&id).cloned());
                }
            }
        }

        for (pos, &node_id) in resources.node_ids.iter().enumerate() {
            let idx = node_id.index();
            let Some(usage) = self.node_usage.get_mut(idx) else { continue };
            if action != RemoveAction::CoresOnly {
                let amount = resources.memory_per_node_mb.get(pos).copied().unwrap_or(0);
                if usage.release_memory(amount) {
                    warn!(node = idx, job_id = %job_id, "memory usage under-ran zero on release, clamped");
                }
            }
            if action != RemoveAction::MemoryAndGresOnly {
                usage.share_count = usage.share_count.saturating_sub(1);
                if usage.remove_node_req(resources.node_req) {
                    warn!(node = idx, job_id = %job_id, "node_state counter under-ran zero on release, clamped");
                }
            }
        }

        if action == RemoveAction::Full {
            self.jobs.remove(&job_id);
        }
        Ok(())
    }
}
