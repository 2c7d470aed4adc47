//! C1 — the occupancy model: packing job core allocations into partition
//! rows, testing fit, and rebuilding a row's bitmap from its job list
//! after a removal (§4.1).

use tracing::{debug, warn};
use tres_bitmap::{core_array_and_not, core_array_or, CoreBitmap};

use crate::model::{JobResources, PartitionOccupancy, Row};

/// Whether `job`'s core bitmap is disjoint from every node's committed
/// bits in `row` (invariant 2). A job with no cores on a given node
/// trivially clears that node.
pub fn row_fits_job(row: &Row, job_core_bitmap: &[CoreBitmap]) -> bool {
    row.core_bitmap
        .iter()
        .zip(job_core_bitmap.iter())
        .all(|(row_bits, job_bits)| row_bits.is_disjoint(job_bits))
}

/// Packs `job`'s per-node core bitmap into `row` and appends its id to
/// the row's job list. Caller must have already verified
/// [`row_fits_job`] (or be deliberately targeting the oversubscription
/// overlay row, which is exempt from the disjointness requirement).
pub fn add_job_to_row(row: &mut Row, job: &JobResources) {
    core_array_or(&mut row.core_bitmap, &job.core_bitmap_per_node());
    row.jobs.push(job.job_id);
}

/// Removes `job_core_bitmap` from `row`'s bits and drops `job_id` from
/// its job list. When `job_id` is not present this is a no-op on the
/// bitmap (defensive against a double-remove), matching invariant 4's
/// spirit of a removal on data no longer present being harmless.
pub fn remove_job_from_row(row: &mut Row, job_id: crate::model::JobId, job_core_bitmap: &[CoreBitmap]) {
    let before = row.jobs.len();
    row.jobs.retain(|&j| j != job_id);
    if row.jobs.len() == before {
        debug!(%job_id, "remove_job_from_row: job not present in row, bitmap unchanged");
        return;
    }
    core_array_and_not(&mut row.core_bitmap, job_core_bitmap);
}

/// Rebuilds a row's bitmap from scratch by OR-ing together the core
/// bitmaps of every job still listed in it, after first clearing every
/// bit. Used when a removal could have desynchronized the row bitmap
/// from its job list (e.g. restoring a snapshot after a failed
/// will-run simulation).
///
/// Jobs are folded in strictly ascending `JobId` order regardless of
/// the order they appear in `row.jobs`, so two rebuilds of the same job
/// set always produce byte-identical bitmaps (Open Question: "rebuild
/// order" — resolved to a strict total order, not insertion order).
pub fn rebuild_row(row: &mut Row, node_core_counts: &[u32], job_lookup: impl Fn(crate::model::JobId) -> Option<CoreBitmapSet>) {
    for (bits, &count) in row.core_bitmap.iter_mut().zip(node_core_counts.iter()) {
        *bits = CoreBitmap::new(count as usize);
    }
    let mut ordered = row.jobs.clone();
    ordered.sort_unstable_by_key(|j| j.0);
    for job_id in ordered {
        match job_lookup(job_id) {
            Some(bits) => core_array_or(&mut row.core_bitmap, &bits.0),
            None => warn!(%job_id, "rebuild_row: job listed in row but missing from lookup, skipping"),
        }
    }
}

/// Thin newtype so `rebuild_row`'s lookup closure has an unambiguous
/// return type distinct from a bare `Vec<CoreBitmap>` (which would be
/// easy to confuse with a single node's bitmap at a call site).
pub struct CoreBitmapSet(pub Vec<CoreBitmap>);

/// Records `job` into the partition occupancy: the primary rows first
/// (lowest index first, matching the source's row-fill-before-split
/// policy), falling back to opening a new row when no existing row has
/// room. Returns the index of the row the job landed in.
pub fn add_job(occ: &mut PartitionOccupancy, job: &JobResources, node_core_counts: &[u32]) -> usize {
    let job_bits = job.core_bitmap_per_node();
    for (i, row) in occ.rows.iter_mut().enumerate() {
        if row_fits_job(row, &job_bits) {
            add_job_to_row(row, job);
            return i;
        }
    }
    let mut row = Row::empty(node_core_counts);
    add_job_to_row(&mut row, job);
    occ.rows.push(row);
    occ.rows.len() - 1
}

/// Removes `job` from whichever row of `occ` holds it, if any. Returns
/// `true` when the job was found and removed.
pub fn remove_job(occ: &mut PartitionOccupancy, job_id: crate::model::JobId, job_core_bitmap: &[CoreBitmap]) -> bool {
    for row in &mut occ.rows {
        if row.jobs.contains(&job_id) {
            remove_job_from_row(row, job_id, job_core_bitmap);
            return true;
        }
    }
    if let Some(overlay) = &mut occ.overlay_row {
        if overlay.jobs.contains(&job_id) {
            remove_job_from_row(overlay, job_id, job_core_bitmap);
            return true;
        }
    }
    false
}

/// Cross-row rebuild for a whole partition, run after a removal per
/// §3.3/§4.1: collect every job from every row, clear all rows, re-sort
/// by `(first_node_index, −ncpus)` ascending, and greedily reinsert with
/// the same first-fit-or-open-a-row policy as [`add_job`]. Falls back to
/// restoring the pre-rebuild snapshot and recomputing each row's bitmap
/// from its surviving job list (via [`rebuild_row`]) if the job table is
/// missing a record for any job the rows still list — a first-fit repack
/// that grows rows on demand otherwise always has somewhere to put a job.
pub fn rebuild_partition(occ: &mut PartitionOccupancy, node_core_counts: &[u32], job_lookup: impl Fn(crate::model::JobId) -> Option<JobResources>) {
    let snapshot_rows = occ.rows.clone();
    let job_ids: Vec<crate::model::JobId> = occ.rows.iter().flat_map(|row| row.jobs.iter().copied()).collect();

    let mut resolved = Vec::with_capacity(job_ids.len());
    let mut all_resolved = true;
    for id in job_ids {
        match job_lookup(id) {
            Some(res) => resolved.push(res),
            None => {
                warn!(%id, "rebuild_partition: job listed in a row but missing from lookup, aborting repack");
                all_resolved = false;
            }
        }
    }

    if !all_resolved {
        occ.rows = snapshot_rows;
        for row in &mut occ.rows {
            rebuild_row(row, node_core_counts, &job_lookup);
        }
        return;
    }

    resolved.sort_unstable_by_key(|res| {
        let first_node = res.node_ids.iter().map(|n| n.index()).min().unwrap_or(0);
        (first_node, std::cmp::Reverse(res.total_cpus))
    });

    let mut new_rows: Vec<Row> = Vec::new();
    for res in &resolved {
        let job_bits = res.core_bitmap_per_node();
        if let Some(row) = new_rows.iter_mut().find(|row| row_fits_job(row, &job_bits)) {
            add_job_to_row(row, res);
        } else {
            let mut row = Row::empty(node_core_counts);
            add_job_to_row(&mut row, res);
            new_rows.push(row);
        }
    }
    if new_rows.is_empty() {
        new_rows.push(Row::empty(node_core_counts));
    }
    occ.rows = new_rows;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobId, NodeId, NodeState, PartitionId, SockCoreRep};
    use tres_bitmap::NodeBitmap;

    fn make_job(id: u64, node_count: usize, cores: usize, set_bits: &[usize]) -> JobResources {
        let mut bm = CoreBitmap::new(cores);
        for &b in set_bits {
            bm.set(b);
        }
        JobResources {
            job_id: JobId(id),
            node_bitmap: NodeBitmap::new(node_count),
            node_ids: (0..node_count).map(|i| NodeId(i as u32)).collect(),
            cpus_per_node: vec![cores as u32; node_count],
            memory_per_node_mb: vec![0; node_count],
            core_bitmap: bm,
            cores_per_node: vec![cores as u32; node_count],
            sock_core_rep: vec![SockCoreRep { sockets_per_node: 1, cores_per_socket: cores as u32, rep_count: node_count as u32 }],
            node_req: NodeState::Available,
            whole_node: false,
            total_cpus: cores as u32,
        }
    }

    #[test]
    fn disjoint_jobs_share_one_row() {
        let mut occ = PartitionOccupancy::new(PartitionId(0), &[8]);
        let a = make_job(1, 1, 8, &[0, 1, 2, 3]);
        let b = make_job(2, 1, 8, &[4, 5, 6, 7]);
        let row_a = add_job(&mut occ, &a, &[8]);
        let row_b = add_job(&mut occ, &b, &[8]);
        assert_eq!(row_a, 0);
        assert_eq!(row_b, 0);
        assert_eq!(occ.rows.len(), 1);
    }

    #[test]
    fn overlapping_jobs_open_a_new_row() {
        let mut occ = PartitionOccupancy::new(PartitionId(0), &[8]);
        let a = make_job(1, 1, 8, &[0, 1, 2, 3]);
        let b = make_job(2, 1, 8, &[2, 3, 4]);
        add_job(&mut occ, &a, &[8]);
        let row_b = add_job(&mut occ, &b, &[8]);
        assert_eq!(row_b, 1);
        assert_eq!(occ.rows.len(), 2);
    }

    #[test]
    fn remove_then_rebuild_clears_bits() {
        let mut occ = PartitionOccupancy::new(PartitionId(0), &[8]);
        let a = make_job(1, 1, 8, &[0, 1]);
        let b = make_job(2, 1, 8, &[2, 3]);
        add_job(&mut occ, &a, &[8]);
        add_job(&mut occ, &b, &[8]);
        assert!(remove_job(&mut occ, JobId(1), &a.core_bitmap_per_node()));
        let lookup = |id: JobId| if id == JobId(2) { Some(CoreBitmapSet(b.core_bitmap_per_node())) } else { None };
        rebuild_row(&mut occ.rows[0], &[8], lookup);
        assert!(!occ.rows[0].core_bitmap[0].test(0));
        assert!(occ.rows[0].core_bitmap[0].test(2));
    }
}
