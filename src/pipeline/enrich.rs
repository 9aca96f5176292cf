//! Enrichment: attach schedule and per-pair travel features to the
//! cleaned fixes and classify each pair's mobility state.
//!
//! The tentative status (from segment/stop deltas alone) and the final
//! status (after the 20 m distance confirmation) are one logical step:
//! the distance delta is only measured for pairs whose tentative state
//! still needs it, and a failed confirmation reclassifies the pair as
//! Movement.

use log::debug;

use crate::catalog::{RouteCatalog, ScheduleClock};
use crate::geometry::SpatialRef;
use crate::{EnrichedRow, MobilityStatus, PipelineConfig, SnappedFix};

/// Outcome of enriching one route.
#[derive(Debug)]
pub struct EnrichOutcome {
    pub rows: Vec<EnrichedRow>,
    /// Rows removed by the per-stop segment monotony sweep
    pub dropped_sweep: usize,
}

/// Enrich one route's cleaned fixes. Input must be sorted by
/// `(trip_id, timestamp, barcode)` and already QA/QC filtered.
pub fn enrich_route(
    fixes: Vec<SnappedFix>,
    catalog: &RouteCatalog,
    clock: &ScheduleClock,
    config: &PipelineConfig,
) -> EnrichOutcome {
    let sref = SpatialRef::new(config.wkid);
    let before = fixes.len();
    let fixes = sweep_segment_monotony(fixes);
    let dropped_sweep = before - fixes.len();
    if dropped_sweep > 0 {
        debug!("{}: monotony sweep dropped {} rows", catalog.key, dropped_sweep);
    }

    let mut rows = Vec::with_capacity(fixes.len());
    let mut trip_start = 0usize;
    for i in 0..fixes.len() {
        if fixes[i].trip_id != fixes[trip_start].trip_id {
            enrich_trip(
                &fixes[trip_start..i],
                catalog,
                clock,
                sref,
                config,
                &mut rows,
            );
            trip_start = i;
        }
    }
    if trip_start < fixes.len() {
        enrich_trip(
            &fixes[trip_start..],
            catalog,
            clock,
            sref,
            config,
            &mut rows,
        );
    }

    EnrichOutcome { rows, dropped_sweep }
}

/// Final monotony sweep: within a `(trip, stop_sequence)` group the
/// segment index must not decrease. QA/QC compares whole rows across
/// passes; this catches residual jitter inside a single stop chain.
fn sweep_segment_monotony(fixes: Vec<SnappedFix>) -> Vec<SnappedFix> {
    let mut kept: Vec<SnappedFix> = Vec::with_capacity(fixes.len());
    let mut group: Option<(String, u32, u32)> = None; // (trip, stop_seq, last seg)
    for fix in fixes {
        match &mut group {
            Some((trip, stop, last_seg))
                if *trip == fix.trip_id && *stop == fix.stop_sequence =>
            {
                if fix.seg_index < *last_seg {
                    continue;
                }
                *last_seg = fix.seg_index;
            }
            _ => {
                group = Some((fix.trip_id.clone(), fix.stop_sequence, fix.seg_index));
            }
        }
        kept.push(fix);
    }
    kept
}

fn enrich_trip(
    trip: &[SnappedFix],
    catalog: &RouteCatalog,
    clock: &ScheduleClock,
    sref: SpatialRef,
    config: &PipelineConfig,
    out: &mut Vec<EnrichedRow>,
) {
    let max_stop = catalog.max_stop_sequence;
    let max_seg = catalog.max_seg_index;

    // First pass: classify every pair. The status of row i describes the
    // pair (i, i+1); the last row's label falls back to its position.
    let mut statuses = Vec::with_capacity(trip.len());
    let mut delta_dists: Vec<Option<f64>> = Vec::with_capacity(trip.len());
    for i in 0..trip.len() {
        let a = &trip[i];
        let b = trip.get(i + 1);

        let tentative = if a.stop_sequence >= max_stop {
            MobilityStatus::Terminus
        } else {
            match b {
                Some(b) if b.stop_sequence == a.stop_sequence && b.seg_index == a.seg_index => {
                    MobilityStatus::Stationary
                }
                _ => MobilityStatus::Movement,
            }
        };

        // The distance delta confirms (or refutes) a stationary call; it
        // is undefined for every other pair.
        let delta_dist = match (tentative, b) {
            (MobilityStatus::Stationary, Some(b)) => Some(sref.distance_m(
                geo::Coord { x: a.x, y: a.y },
                geo::Coord { x: b.x, y: b.y },
            )),
            _ => None,
        };
        let status = match (tentative, delta_dist) {
            (MobilityStatus::Stationary, Some(d)) if d > config.stationary_threshold_m => {
                MobilityStatus::Movement
            }
            _ => tentative,
        };

        statuses.push(status);
        delta_dists.push(delta_dist.filter(|_| status == MobilityStatus::Stationary));
    }

    for i in 0..trip.len() {
        let a = &trip[i];
        let b = trip.get(i + 1);
        let stp_left = max_stop.saturating_sub(a.stop_sequence);
        let idx_left = max_seg.saturating_sub(a.seg_index);

        let schedule = catalog.schedule(&a.trip_id, a.stop_sequence);

        out.push(EnrichedRow {
            trip_id: a.trip_id.clone(),
            idx: (i + 1) as u32,
            barcode: a.barcode,
            status: statuses[i],
            stat_next: statuses.get(i + 1).copied(),
            stop_id: a.stop_id.clone(),
            stop_sequence: a.stop_sequence,
            max_stop_sequence: max_stop,
            max_stop_seq_validated: catalog.max_stop_seq_validated,
            stp_left,
            stp_diff: b.map(|b| {
                i64::from(max_stop.saturating_sub(b.stop_sequence)) - i64::from(stp_left)
            }),
            seg_index: a.seg_index,
            max_seg_index: max_seg,
            idx_left,
            idx_diff: b.map(|b| {
                i64::from(max_seg.saturating_sub(b.seg_index)) - i64::from(idx_left)
            }),
            x: a.x,
            y: a.y,
            timestamp: a.timestamp,
            delta_time_s: b.map(|b| (b.timestamp - a.timestamp).num_seconds()),
            delta_dist_m: delta_dists[i],
            sched_arr: schedule.map(|s| clock.to_utc(s.arrival_s)),
            sched_dep: schedule.map(|s| clock.to_utc(s.departure_s)),
        });
    }
}
