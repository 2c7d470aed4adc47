//! Read-only entity types and the mutable records the engine produces,
//! per spec §3.1.

mod avail_res;
mod gres;
mod ids;
mod job;
mod node;
mod partition;

pub use avail_res::{AvailRes, INLINE_SOCKETS};
pub use gres::{GresInventory, GresJobRequest, GresTypeRequest, GresUsage, SocketGres};
pub use ids::{JobId, NodeId, PartitionId, RowId};
pub use job::{Contiguity, JobRequest, JobResources, MemRequirement, PreemptMode, SockCoreRep};
pub use node::{Node, NodeState, NodeUsage};
pub use partition::{Partition, PartitionOccupancy, Row};
