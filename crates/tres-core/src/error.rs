//! Error kinds the engine returns to its caller, and the narrower
//! vocabularies the bitmap/GRES boundaries use internally.

use crate::model::NodeId;

/// One caller-visible outcome per §7's error table.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no feasible placement exists under the current exclusions")]
    NoFit,

    #[error("placement blocked by higher priority or non-preemptible partitions")]
    HigherPriorityBusy,

    #[error("required node {0:?} was filtered out and cannot be honored")]
    RequiredNodeUnfit(NodeId),

    #[error("best-fit network topology is not yet available")]
    SwitchesPending,

    #[error("job has no assigned partition")]
    Invalid,

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

pub type PlacementResult<T> = Result<T, PlacementError>;
