//! QA/QC: enforce monotonic trip progression over the snapped fixes.
//!
//! GPS jitter around overlapping route sections produces brief
//! back-steps in `stop_sequence` or `seg_index`. A three-pass filter at
//! decreasing lookback orders removes them without eroding legitimate
//! near-stationary sequences; single-pass filtering at order 1 would let
//! a two-row excursion anchor itself.

use log::debug;

use crate::SnappedFix;

/// Outcome of filtering one route.
#[derive(Debug)]
pub struct QaqcOutcome {
    pub kept: Vec<SnappedFix>,
    pub input: usize,
    /// kept / input, 1.0 for an empty input
    pub retention: f64,
    pub dropped_duplicates: usize,
    pub dropped_backsteps: usize,
}

/// Filter one route's snapped fixes. Input must be sorted by
/// `(trip_id, timestamp, barcode)`.
pub fn filter_route(mut fixes: Vec<SnappedFix>) -> QaqcOutcome {
    let input = fixes.len();

    fixes.sort_by(|a, b| {
        a.trip_id
            .cmp(&b.trip_id)
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.barcode.cmp(&b.barcode))
    });

    // Exact duplicates: same trip, timestamp, and segment.
    let mut dropped_duplicates = 0usize;
    let mut deduped: Vec<SnappedFix> = Vec::with_capacity(fixes.len());
    for fix in fixes {
        if deduped.last().map_or(false, |prev: &SnappedFix| {
            prev.trip_id == fix.trip_id
                && prev.timestamp == fix.timestamp
                && prev.seg_index == fix.seg_index
        }) {
            dropped_duplicates += 1;
            continue;
        }
        deduped.push(fix);
    }

    // Three passes at lookback orders 3, 2, 1. Each pass compares every
    // row with the k-th prior row of the same trip retained by the
    // previous passes; drops are applied after the pass scan.
    let mut rows = deduped;
    let mut dropped_backsteps = 0usize;
    for order in [3usize, 2, 1] {
        let mut keep = vec![true; rows.len()];
        let mut trip_start = 0usize;
        for i in 0..rows.len() {
            if i > 0 && rows[i].trip_id != rows[i - 1].trip_id {
                trip_start = i;
            }
            if i < trip_start + order {
                continue;
            }
            let prior = &rows[i - order];
            let stop_diff =
                i64::from(rows[i].stop_sequence) - i64::from(prior.stop_sequence);
            let seg_diff = i64::from(rows[i].seg_index) - i64::from(prior.seg_index);
            if stop_diff < 0 || seg_diff < 0 {
                keep[i] = false;
            }
        }
        let before = rows.len();
        let mut i = 0;
        rows.retain(|_| {
            let k = keep[i];
            i += 1;
            k
        });
        dropped_backsteps += before - rows.len();
    }

    let retention = if input == 0 {
        1.0
    } else {
        rows.len() as f64 / input as f64
    };
    if dropped_duplicates + dropped_backsteps > 0 {
        debug!(
            "qaqc dropped {} duplicates, {} back-steps ({} -> {} rows)",
            dropped_duplicates,
            dropped_backsteps,
            input,
            rows.len()
        );
    }

    QaqcOutcome {
        kept: rows,
        input,
        retention,
        dropped_duplicates,
        dropped_backsteps,
    }
}
