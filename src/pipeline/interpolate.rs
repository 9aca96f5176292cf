//! Spatiotemporal interpolation: reconstruct stop-by-stop arrival
//! estimates from consecutive fix pairs and classify on-time
//! performance.
//!
//! Each pair (A, B) of the same trip is classified into a travel type
//! and emits one or more rows, one per stop traversed between the two
//! fixes. Distances are partitioned along the undissolved chains, so
//! the per-leg distances always sum to the pair total. The last row of
//! a group is anchored at B and carries the future leg to B's upcoming
//! stop; downstream accounting uses it as the final projected
//! observation per (trip, idx).

use chrono::{DateTime, Duration, Utc};
use geo::Coord;
use log::debug;

use crate::catalog::{RouteCatalog, ScheduleClock};
use crate::geometry::SpatialRef;
use crate::{
    EnrichedRow, InterpolatedRow, MobilityStatus, PerfRate, PipelineConfig, TravelType,
};

/// Outcome of interpolating one route.
#[derive(Debug, Default)]
pub struct InterpOutcome {
    pub rows: Vec<InterpolatedRow>,
    pub pairs: usize,
    /// Pairs skipped for a non-positive time delta or backward stop
    /// progression
    pub anomalies: usize,
}

struct Interp<'a> {
    catalog: &'a RouteCatalog,
    clock: &'a ScheduleClock,
    config: &'a PipelineConfig,
    sref: SpatialRef,
}

/// Interpolate one route's enriched rows. Input must be grouped by trip
/// in timestamp order.
pub fn interpolate_route(
    rows: &[EnrichedRow],
    catalog: &RouteCatalog,
    clock: &ScheduleClock,
    config: &PipelineConfig,
) -> InterpOutcome {
    let interp = Interp {
        catalog,
        clock,
        config,
        sref: SpatialRef::new(config.wkid),
    };
    let mut outcome = InterpOutcome::default();

    let mut trip_start = 0usize;
    for i in 0..=rows.len() {
        let boundary = i == rows.len() || rows[i].trip_id != rows[trip_start].trip_id;
        if boundary && i > trip_start {
            interp.trip(&rows[trip_start..i], &mut outcome);
            trip_start = i;
        }
    }
    outcome
}

impl<'a> Interp<'a> {
    fn trip(&self, trip: &[EnrichedRow], outcome: &mut InterpOutcome) {
        for i in 0..trip.len() {
            let a = &trip[i];
            match trip.get(i + 1) {
                None => {
                    if trip.len() == 1 {
                        // A single-fix trip has nothing to interpolate;
                        // it still yields one observation.
                        if a.status == MobilityStatus::Terminus {
                            outcome.rows.push(self.terminus_row(a));
                        } else {
                            outcome.rows.push(self.stationary_row(a, None));
                        }
                    } else if a.status == MobilityStatus::Terminus {
                        outcome.rows.push(self.terminus_row(a));
                    }
                }
                Some(b) => {
                    outcome.pairs += 1;
                    let dt = a.delta_time_s.unwrap_or(0);
                    if dt <= 0 {
                        debug!(
                            "trip {} idx {}: non-positive time delta, pair skipped",
                            a.trip_id, a.idx
                        );
                        outcome.anomalies += 1;
                        continue;
                    }
                    let stop_step = i64::from(b.stop_sequence) - i64::from(a.stop_sequence);
                    if stop_step < 0 {
                        // Backward progression past QA/QC: a loop wrap
                        // artefact. The refine stage removes the residue.
                        debug!(
                            "trip {} idx {}: stop_sequence steps back, pair skipped",
                            a.trip_id, a.idx
                        );
                        outcome.anomalies += 1;
                        continue;
                    }

                    if a.status == MobilityStatus::Stationary {
                        outcome.rows.push(self.stationary_row(a, Some(b)));
                    } else if stop_step >= 1 {
                        let mut rows = self.movement_rows(a, b, dt, stop_step >= 2);
                        outcome.rows.append(&mut rows);
                    } else {
                        let same_seg = a.seg_index == b.seg_index;
                        outcome.rows.push(self.same_stop_row(a, b, dt, same_seg));
                    }
                }
            }
        }
    }

    fn point(row: &EnrichedRow) -> Coord {
        Coord { x: row.x, y: row.y }
    }

    fn sched_arr(&self, trip_id: &str, stop_sequence: u32) -> Option<DateTime<Utc>> {
        self.catalog
            .schedule(trip_id, stop_sequence)
            .map(|s| self.clock.to_utc(s.arrival_s))
    }

    fn sched_dep(&self, trip_id: &str, stop_sequence: u32) -> Option<DateTime<Utc>> {
        self.catalog
            .schedule(trip_id, stop_sequence)
            .map(|s| self.clock.to_utc(s.departure_s))
    }

    /// Seconds to cover `dist_m` at `speed_kmh`; undefined at zero speed.
    fn travel_s(dist_m: f64, speed_kmh: f64) -> Option<f64> {
        if speed_kmh > f64::EPSILON {
            Some((dist_m / 1000.0) / speed_kmh * 3600.0)
        } else {
            None
        }
    }

    fn add_seconds(t: DateTime<Utc>, s: f64) -> DateTime<Utc> {
        t + Duration::milliseconds((s * 1000.0).round() as i64)
    }

    fn blank_row(&self, a: &EnrichedRow, stop_sequence: u32, stop_id: String) -> InterpolatedRow {
        InterpolatedRow {
            route_id: self.catalog.key.route_id.clone(),
            direction: self.catalog.key.direction,
            trip_id: a.trip_id.clone(),
            idx: a.idx,
            stop_id,
            stop_sequence,
            status: a.status,
            travel_type: TravelType::Stationary,
            proj_speed_kmh: 0.0,
            x: None,
            y: None,
            tot_dist_m: 0.0,
            dist_m: 0.0,
            dist_futr_m: None,
            proj_travel_s: None,
            futr_travel_s: None,
            curr_time: None,
            est_arr: None,
            off_earr: None,
            sched_arr: self.sched_arr(&a.trip_id, stop_sequence),
            sched_dep: self.sched_dep(&a.trip_id, stop_sequence),
            off_arrdif_s: None,
            perc_chge: None,
            perf_rate: None,
        }
    }

    /// Fill the schedule comparison once `off_earr` is known.
    fn finish_row(&self, row: &mut InterpolatedRow) {
        if let (Some(sched), Some(off)) = (row.sched_arr, row.off_earr) {
            let diff = (sched - off).num_seconds();
            row.off_arrdif_s = Some(diff);
            row.perf_rate = Some(PerfRate::classify(diff, self.config));
        }
    }

    /// Percent change of the arrival difference along a group; undefined
    /// for the first row.
    fn fill_perc_chge(rows: &mut [InterpolatedRow]) {
        for i in 1..rows.len() {
            if let (Some(prev), Some(cur)) = (rows[i - 1].off_arrdif_s, rows[i].off_arrdif_s) {
                if prev != 0 {
                    rows[i].perc_chge =
                        Some((cur - prev) as f64 / prev.abs() as f64 * 100.0);
                }
            }
        }
    }

    /// OneStop / BtwnStops: partition the pair distance into legs, one
    /// per traversed stop, and accumulate arrival estimates from A.
    fn movement_rows(
        &self,
        a: &EnrichedRow,
        b: &EnrichedRow,
        dt: i64,
        multi: bool,
    ) -> Vec<InterpolatedRow> {
        let travel_type = if multi {
            TravelType::BtwnStops
        } else {
            TravelType::OneStop
        };

        // Legs: A to its stop, each unrecorded stop's full chain, then
        // what B has covered past its previous stop.
        let mut legs: Vec<(u32, String, f64)> = Vec::new();
        legs.push((
            a.stop_sequence,
            a.stop_id.clone(),
            self.catalog.chain_remaining_m(
                self.sref,
                a.stop_sequence,
                a.seg_index,
                Self::point(a),
            ),
        ));
        for seq in (a.stop_sequence + 1)..b.stop_sequence {
            match self.catalog.chain_stop_id(seq) {
                Some(stop_id) => legs.push((
                    seq,
                    stop_id.to_string(),
                    self.catalog.chain_length_m(self.sref, seq),
                )),
                // A gap in the static data; compensate by bridging over it.
                None => debug!(
                    "{}: no chain for stop_sequence {}, bridged",
                    self.catalog.key, seq
                ),
            }
        }
        legs.push((
            b.stop_sequence,
            b.stop_id.clone(),
            self.catalog.chain_covered_m(
                self.sref,
                b.stop_sequence,
                b.seg_index,
                Self::point(b),
            ),
        ));

        let tot_dist: f64 = legs.iter().map(|l| l.2).sum();
        let speed = (tot_dist / dt as f64) * 3.6;
        let dist_futr = self.catalog.chain_remaining_m(
            self.sref,
            b.stop_sequence,
            b.seg_index,
            Self::point(b),
        );
        let futr_travel = Self::travel_s(dist_futr, speed);

        let n = legs.len();
        let mut out = Vec::with_capacity(n);
        let mut cum_s = 0.0;
        for (j, (seq, stop_id, dist)) in legs.into_iter().enumerate() {
            let last = j == n - 1;
            let mut row = self.blank_row(a, seq, stop_id);
            row.travel_type = travel_type;
            row.proj_speed_kmh = speed;
            row.tot_dist_m = tot_dist;
            row.dist_m = dist;
            row.status = if j == 0 {
                a.status
            } else if last {
                a.stat_next.unwrap_or(MobilityStatus::Movement)
            } else {
                MobilityStatus::Movement
            };

            if last {
                row.x = Some(b.x);
                row.y = Some(b.y);
                row.curr_time = Some(b.timestamp);
                row.dist_futr_m = Some(dist_futr);
                row.futr_travel_s = futr_travel;
                // The final projected observation: B plus its future leg
                row.off_earr = futr_travel.map(|s| Self::add_seconds(b.timestamp, s));
            } else {
                if j == 0 {
                    row.x = Some(a.x);
                    row.y = Some(a.y);
                    row.curr_time = Some(a.timestamp);
                }
                row.proj_travel_s = Self::travel_s(dist, speed);
                if let Some(t) = row.proj_travel_s {
                    cum_s += t;
                    row.est_arr = Some(Self::add_seconds(a.timestamp, cum_s));
                }
                row.off_earr = row.est_arr;
            }
            self.finish_row(&mut row);
            out.push(row);
        }
        Self::fill_perc_chge(&mut out);
        out
    }

    /// SameStop (same or different segment): one synthesized row anchored
    /// at B, with the future leg to the shared upcoming stop.
    fn same_stop_row(
        &self,
        a: &EnrichedRow,
        b: &EnrichedRow,
        dt: i64,
        same_seg: bool,
    ) -> InterpolatedRow {
        let dist = if same_seg {
            self.sref.distance_m(Self::point(a), Self::point(b))
        } else {
            // A to the end of its segment, full segments in between, then
            // the start of B's segment to B.
            match (
                self.catalog.segment(a.seg_index),
                self.catalog.segment(b.seg_index),
            ) {
                (Some(sa), Some(sb)) => {
                    self.sref.distance_m(Self::point(a), sa.end)
                        + self.catalog.chain_between_m(
                            self.sref,
                            b.stop_sequence,
                            a.seg_index,
                            b.seg_index,
                        )
                        + self.sref.distance_m(sb.start, Self::point(b))
                }
                _ => self.sref.distance_m(Self::point(a), Self::point(b)),
            }
        };

        let speed = (dist / dt as f64) * 3.6;
        let dist_futr = self.catalog.chain_remaining_m(
            self.sref,
            b.stop_sequence,
            b.seg_index,
            Self::point(b),
        );
        // At walking-distance-of-zero speed the projection only makes
        // sense when the vehicle is already dwelling at its stop.
        let futr_travel = Self::travel_s(dist_futr, speed).or_else(|| {
            (dist_futr <= self.config.stationary_threshold_m).then_some(0.0)
        });

        let mut row = self.blank_row(a, b.stop_sequence, b.stop_id.clone());
        row.travel_type = if same_seg {
            TravelType::SameStopSameSeg
        } else {
            TravelType::SameStopDiffSeg
        };
        row.status = a.status;
        row.proj_speed_kmh = speed;
        row.tot_dist_m = dist;
        row.dist_m = dist;
        row.dist_futr_m = Some(dist_futr);
        row.futr_travel_s = futr_travel;
        row.x = Some(b.x);
        row.y = Some(b.y);
        row.curr_time = Some(b.timestamp);
        row.off_earr = futr_travel.map(|s| Self::add_seconds(b.timestamp, s));
        row.est_arr = row.off_earr;
        self.finish_row(&mut row);
        row
    }

    /// Stationary: a single row, no interpolation. The arrival estimate
    /// is defined only for a dwell at the stop itself.
    fn stationary_row(&self, a: &EnrichedRow, b: Option<&EnrichedRow>) -> InterpolatedRow {
        let anchor = b.unwrap_or(a);
        let dist = a.delta_dist_m.unwrap_or(0.0);
        let dist_futr = self.catalog.chain_remaining_m(
            self.sref,
            anchor.stop_sequence,
            anchor.seg_index,
            Self::point(anchor),
        );
        let at_stop = dist_futr <= self.config.stationary_threshold_m;

        let mut row = self.blank_row(a, a.stop_sequence, a.stop_id.clone());
        row.travel_type = TravelType::Stationary;
        row.status = MobilityStatus::Stationary;
        row.tot_dist_m = dist;
        row.dist_m = dist;
        row.dist_futr_m = Some(dist_futr);
        row.x = Some(a.x);
        row.y = Some(a.y);
        row.curr_time = Some(a.timestamp);
        if at_stop {
            row.futr_travel_s = Some(0.0);
            row.off_earr = Some(anchor.timestamp);
        }
        self.finish_row(&mut row);
        row
    }

    /// Trailing terminus: echo the last state; the vehicle has arrived.
    fn terminus_row(&self, a: &EnrichedRow) -> InterpolatedRow {
        let mut row = self.blank_row(a, a.stop_sequence, a.stop_id.clone());
        row.travel_type = TravelType::Terminus;
        row.status = MobilityStatus::Terminus;
        row.x = Some(a.x);
        row.y = Some(a.y);
        row.curr_time = Some(a.timestamp);
        row.off_earr = Some(a.timestamp);
        self.finish_row(&mut row);
        row
    }
}
