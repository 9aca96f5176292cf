//! Post-interpolation cleanup: remove rows the interpolation itself
//! cannot reject, because they only become visible with the whole trip
//! in hand.
//!
//! Three filters: illogical projected speed, extreme arrival
//! differences, and loop wrap-arounds where a trip's `stop_sequence`
//! drops again after the terminus was reached.

use log::debug;

use crate::{InterpolatedRow, PipelineConfig};

/// Outcome of refining one route.
#[derive(Debug, Default)]
pub struct RefineStats {
    pub input: usize,
    pub dropped_speed: usize,
    pub dropped_arrdif: usize,
    pub dropped_wrap: usize,
}

/// Filter one route's interpolated rows. Rows must be grouped by trip
/// in emission order.
pub fn refine_route(
    rows: Vec<InterpolatedRow>,
    max_stop_sequence: u32,
    config: &PipelineConfig,
) -> (Vec<InterpolatedRow>, RefineStats) {
    let mut stats = RefineStats {
        input: rows.len(),
        ..Default::default()
    };

    let mut kept = Vec::with_capacity(rows.len());
    let mut current_trip: Option<String> = None;
    let mut reached_terminus = false;

    for row in rows {
        if current_trip.as_deref() != Some(row.trip_id.as_str()) {
            current_trip = Some(row.trip_id.clone());
            reached_terminus = false;
        }

        if row.proj_speed_kmh > config.max_speed_kmh {
            stats.dropped_speed += 1;
            continue;
        }
        if let Some(diff) = row.off_arrdif_s {
            if diff.abs() > config.max_arrdif_s {
                stats.dropped_arrdif += 1;
                continue;
            }
        }
        // Once the trip has exceeded max_stop_sequence - 1, a lower
        // stop_sequence is the loop wrapping onto its own start.
        if row.stop_sequence >= max_stop_sequence {
            reached_terminus = true;
        } else if reached_terminus {
            stats.dropped_wrap += 1;
            continue;
        }
        kept.push(row);
    }

    let dropped = stats.dropped_speed + stats.dropped_arrdif + stats.dropped_wrap;
    if dropped > 0 {
        debug!(
            "refine dropped {} rows (speed {}, arrdif {}, wrap {})",
            dropped, stats.dropped_speed, stats.dropped_arrdif, stats.dropped_wrap
        );
    }
    (kept, stats)
}
