//! The generic-resources (GRES) plugin boundary (§6.2). This crate never
//! implements a real GRES plugin — accelerator binding, topology and
//! inventory bookkeeping are an external collaborator's job — it only
//! defines the trait the rest of the engine calls through, plus two
//! reference implementations used by tests and the CLI demo.

use std::collections::BTreeMap;

use tres_bitmap::CoreBitmap;

use crate::model::{GresInventory, GresJobRequest, GresUsage, SocketGres};

/// Accumulates GRES availability across the nodes C4 has tentatively
/// picked for a job, so the selector can ask "have we satisfied the
/// job's GRES quota yet" without re-deriving it from scratch each time
/// (source: the `job_sched_*` family operating on a running `List`).
#[derive(Debug, Clone, Default)]
pub struct GresScheduleAccumulator {
    totals: BTreeMap<String, u32>,
}

impl GresScheduleAccumulator {
    pub fn add(&mut self, sock_gres: &[SocketGres]) {
        for sg in sock_gres {
            for (name, &count) in &sg.available {
                *self.totals.entry(name.clone()).or_insert(0) += count;
            }
        }
    }

    pub fn total(&self, name: &str) -> u32 {
        self.totals.get(name).copied().unwrap_or(0)
    }
}

/// The GRES plugin operations the placement engine calls through.
///
/// Method names mirror the source's operation list (`job_test_per_node`,
/// `core_filter_stage2`/`stage3`, the `job_sched_*` accumulator family,
/// `job_dealloc`, `node_state_dup`) with Rust-shaped signatures: no
/// output pointers, `Option`/`Result` instead of sentinel return codes.
pub trait GresPlugin: Send + Sync {
    /// Returns `None` when the node cannot satisfy the job's GRES request
    /// at all (§4.2 rule 3: "node-level GRES feasibility probe returns
    /// zero usable cores").
    fn job_test_per_node(
        &self,
        job_gres: &GresJobRequest,
        node_gres: &GresInventory,
        node_usage: &GresUsage,
        sockets: u32,
    ) -> Option<Vec<SocketGres>>;

    /// Narrows `core_bitmap` to cores that can satisfy GRES binding and
    /// reports `(gpu_count, near_gpu_count)` (§4.3 step 10).
    fn core_filter_stage2(
        &self,
        sock_gres: &[SocketGres],
        avail_mem_mb: u64,
        max_cpus: u32,
        enforce_binding: bool,
        core_bitmap: &mut CoreBitmap,
        cores_per_socket: u32,
    ) -> (u32, u32);

    /// Bounds the feasible task count given GRES availability.
    fn core_filter_stage3(
        &self,
        sock_gres: &[SocketGres],
        avail_cores_per_socket: &[u16],
        min_tasks: u32,
        max_tasks: u32,
        enforce_binding: bool,
    ) -> u32;

    /// Whether the job declares any per-job GRES quota at all (source:
    /// `gres_plugin_job_sched_init`'s boolean return).
    fn job_sched_init(&self, job_gres: &GresJobRequest) -> bool {
        !job_gres.is_empty()
    }

    /// Whether the accumulator so far satisfies the job's per-job GRES
    /// quota.
    fn job_sched_sufficient(&self, job_gres: &GresJobRequest, acc: &GresScheduleAccumulator) -> bool {
        job_gres
            .requests
            .iter()
            .all(|r| acc.total(&r.name) >= r.count_per_node)
    }

    /// Release a job's GRES usage from a node on removal.
    fn job_dealloc(&self, job_gres: &GresJobRequest, node_usage: &mut GresUsage, node_sock_gres: &[SocketGres]) {
        let _ = job_gres;
        for sg in node_sock_gres {
            for (name, &count) in &sg.available {
                node_usage.remove(sg.socket, name, count);
            }
        }
    }

    /// Clone node-owned GRES usage for a will-run/preemption simulation
    /// (§5: "GRES state owned by nodes is cloned on-write via the GRES
    /// plugin's duplicate operation").
    fn node_state_dup(&self, usage: &GresUsage) -> GresUsage {
        usage.clone()
    }
}

/// No accelerators configured anywhere: every probe trivially succeeds
/// with an empty per-socket list, and the engine behaves as if GRES does
/// not exist. This is `tres-core`'s default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGresPlugin;

impl GresPlugin for NullGresPlugin {
    fn job_test_per_node(
        &self,
        job_gres: &GresJobRequest,
        _node_gres: &GresInventory,
        _node_usage: &GresUsage,
        sockets: u32,
    ) -> Option<Vec<SocketGres>> {
        if job_gres.is_empty() {
            Some((0..sockets as usize).map(|s| SocketGres { socket: s, available: BTreeMap::new() }).collect())
        } else {
            // A job that actually wants GRES cannot be satisfied when no
            // plugin backs any accelerators.
            None
        }
    }

    fn core_filter_stage2(
        &self,
        _sock_gres: &[SocketGres],
        _avail_mem_mb: u64,
        _max_cpus: u32,
        _enforce_binding: bool,
        _core_bitmap: &mut CoreBitmap,
        _cores_per_socket: u32,
    ) -> (u32, u32) {
        (0, 0)
    }

    fn core_filter_stage3(
        &self,
        _sock_gres: &[SocketGres],
        _avail_cores_per_socket: &[u16],
        _min_tasks: u32,
        max_tasks: u32,
        _enforce_binding: bool,
    ) -> u32 {
        max_tasks
    }
}

/// A fixed, in-memory GRES inventory with simple per-socket binding,
/// used by tests and the `tres-cli` demo. Narrowing is intentionally
/// naive (a socket is usable if it has at least the requested count of
/// the named GRES free) — the real binding/topology logic is the
/// external plugin's job, not this crate's.
#[derive(Debug, Default, Clone)]
pub struct StaticGresPlugin;

impl GresPlugin for StaticGresPlugin {
    fn job_test_per_node(
        &self,
        job_gres: &GresJobRequest,
        node_gres: &GresInventory,
        node_usage: &GresUsage,
        sockets: u32,
    ) -> Option<Vec<SocketGres>> {
        if job_gres.is_empty() {
            return Some((0..sockets as usize).map(|s| SocketGres { socket: s, available: BTreeMap::new() }).collect());
        }
        let mut any_usable = false;
        let mut result = Vec::with_capacity(sockets as usize);
        for s in 0..sockets as usize {
            let mut available = BTreeMap::new();
            for req in &job_gres.requests {
                let total = node_gres.sockets.get(s).and_then(|m| m.get(&req.name)).copied().unwrap_or(0);
                let used = node_usage.used(s, &req.name);
                let free = total.saturating_sub(used);
                if free > 0 {
                    available.insert(req.name.clone(), free);
                    any_usable = true;
                }
            }
            result.push(SocketGres { socket: s, available });
        }
        if any_usable {
            Some(result)
        } else {
            None
        }
    }

    fn core_filter_stage2(
        &self,
        sock_gres: &[SocketGres],
        _avail_mem_mb: u64,
        _max_cpus: u32,
        enforce_binding: bool,
        core_bitmap: &mut CoreBitmap,
        cores_per_socket: u32,
    ) -> (u32, u32) {
        let gpu_count: u32 = sock_gres.iter().flat_map(|sg| sg.available.values()).sum();
        if enforce_binding {
            // Clear cores on sockets that carry no usable GRES at all.
            for sg in sock_gres {
                if sg.available.is_empty() {
                    let base = sg.socket as usize * cores_per_socket as usize;
                    for c in base..base + cores_per_socket as usize {
                        if c < core_bitmap.len() {
                            core_bitmap.clear(c);
                        }
                    }
                }
            }
        }
        let near_gpu_count = sock_gres.iter().filter(|sg| !sg.available.is_empty()).count() as u32;
        (gpu_count, near_gpu_count)
    }

    fn core_filter_stage3(
        &self,
        _sock_gres: &[SocketGres],
        _avail_cores_per_socket: &[u16],
        _min_tasks: u32,
        max_tasks: u32,
        _enforce_binding: bool,
    ) -> u32 {
        max_tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory_with(sockets: usize, name: &str, per_socket: u32) -> GresInventory {
        let mut inv = GresInventory::none(sockets);
        for s in &mut inv.sockets {
            s.insert(name.to_string(), per_socket);
        }
        inv
    }

    #[test]
    fn null_plugin_rejects_any_gres_request() {
        let plugin = NullGresPlugin;
        let req = GresJobRequest {
            requests: vec![crate::model::GresTypeRequest {
                name: "gpu".into(),
                count_per_node: 1,
                enforce_binding: false,
            }],
        };
        let inv = GresInventory::none(2);
        let usage = GresUsage::none(2);
        assert!(plugin.job_test_per_node(&req, &inv, &usage, 2).is_none());
    }

    #[test]
    fn null_plugin_accepts_job_without_gres() {
        let plugin = NullGresPlugin;
        let req = GresJobRequest::default();
        let inv = GresInventory::none(2);
        let usage = GresUsage::none(2);
        assert!(plugin.job_test_per_node(&req, &inv, &usage, 2).is_some());
    }

    #[test]
    fn static_plugin_finds_free_gres_on_one_socket() {
        let plugin = StaticGresPlugin;
        let inv = inventory_with(2, "gpu", 2);
        let mut usage = GresUsage::none(2);
        usage.add(0, "gpu", 2); // socket 0 fully used
        let req = GresJobRequest {
            requests: vec![crate::model::GresTypeRequest {
                name: "gpu".into(),
                count_per_node: 1,
                enforce_binding: true,
            }],
        };
        let result = plugin.job_test_per_node(&req, &inv, &usage, 2).unwrap();
        assert!(result[0].available.is_empty());
        assert_eq!(result[1].available["gpu"], 2);
    }

    #[test]
    fn schedule_accumulator_tracks_quota() {
        let mut acc = GresScheduleAccumulator::default();
        let sock_gres = vec![SocketGres {
            socket: 0,
            available: BTreeMap::from([("gpu".to_string(), 2)]),
        }];
        acc.add(&sock_gres);
        let req = GresJobRequest {
            requests: vec![crate::model::GresTypeRequest {
                name: "gpu".into(),
                count_per_node: 2,
                enforce_binding: false,
            }],
        };
        assert!(NullGresPlugin.job_sched_sufficient(&req, &acc));
    }
}
