//! Bitmap primitives for the TRES job placement engine.
//!
//! - [`Bitset`]: a dense, `u64`-word backed bit vector.
//! - [`CoreBitmap`]: one bit per physical core on a single node.
//! - [`NodeBitmap`]: one bit per node in a cluster snapshot.
//! - [`array`]: bulk logical operations over a per-node array of
//!   `CoreBitmap`s (the source's `bitstr_t **` helpers).

mod array;
mod bitset;

pub use array::{clear_core_array, core_array_and, core_array_and_not, core_array_or, count_core_array_set};
pub use bitset::Bitset;

/// Bits indexed by physical core within one node.
pub type CoreBitmap = Bitset;

/// Bits indexed by node within a cluster snapshot.
pub type NodeBitmap = Bitset;
