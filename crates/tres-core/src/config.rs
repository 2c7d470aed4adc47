//! Engine-wide tunables. In the source these are a mix of compile-time
//! constants and `SchedulerParameters` config; here they are one
//! `serde`-deserializable struct parsed from TOML, the same `serde` +
//! `toml` pairing `rshogi-csa-server-tcp` depends on for its own
//! configuration.

use serde::Deserialize;

/// Core-selection granularity (§4.3 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrType {
    /// Allocate individual cores.
    Core,
    /// Entire-socket mode: any socket with one used core is zeroed for
    /// this job (all-or-nothing per socket).
    Socket,
}

impl Default for CrType {
    fn default() -> Self {
        CrType::Core
    }
}

/// Tuning for the will-run / preemption batching loop (§4.6).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WillRunTuning {
    pub initial_window_secs: u64,
    pub window_scale_factor: f64,
    pub wall_clock_budget_secs: u64,
}

impl Default for WillRunTuning {
    fn default() -> Self {
        Self {
            initial_window_secs: 30,
            window_scale_factor: 2.0,
            wall_clock_budget_secs: 2,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cr_type: CrType,
    /// Whether partitions are oversubscribable (extra preemption overlay
    /// row) unless overridden per-partition.
    pub default_oversubscribe: bool,
    pub will_run: WillRunTuning,
    /// Upper bound on `choose_nodes`'s knapsack-pruning threshold loop
    /// (`k = 1, 2, ..., max_res_cnt`), capping retries on pathological
    /// inputs.
    pub max_choose_nodes_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cr_type: CrType::default(),
            default_oversubscribe: false,
            will_run: WillRunTuning::default(),
            max_choose_nodes_retries: 64,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
