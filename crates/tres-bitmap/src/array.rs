//! Operations over a per-node array of [`CoreBitmap`]s — one entry per
//! node in the cluster, each sized to that node's physical core count.
//!
//! These mirror the source's `core_array_and` / `core_array_or` /
//! `core_array_and_not` / `clear_core_array` / `count_core_array_set`
//! free functions, which operate on `bitstr_t **` indexed by node.

use crate::CoreBitmap;

/// `a[i] &= b[i]` for every node present in both arrays.
pub fn core_array_and(a: &mut [CoreBitmap], b: &[CoreBitmap]) {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        x.and_assign(y);
    }
}

/// `a[i] |= b[i]` for every node present in both arrays.
pub fn core_array_or(a: &mut [CoreBitmap], b: &[CoreBitmap]) {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        x.or_assign(y);
    }
}

/// `a[i] &= !b[i]` for every node present in both arrays.
pub fn core_array_and_not(a: &mut [CoreBitmap], b: &[CoreBitmap]) {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        x.and_not_assign(y);
    }
}

/// Clear every bitmap in the array.
pub fn clear_core_array(a: &mut [CoreBitmap]) {
    for x in a.iter_mut() {
        x.clear_all();
    }
}

/// Total set-bit count across every node's bitmap.
pub fn count_core_array_set(a: &[CoreBitmap]) -> usize {
    a.iter().map(|x| x.count_ones()).sum()
}
