//! Aggregation: three reductions over the cleaned interpolated table.
//!
//! Level 1 counts, per (route, trip, stop, scheduled arrival), how
//! often the projected classification was Late / On-Time / Early — a
//! measure of how stable the projection was while the vehicle worked
//! its way toward the stop. Levels 2 and 3 roll level 1 up per hour and
//! per day, keeping both unweighted means (each trip counts once) and
//! observation-weighted means (each trip weighted by how often it was
//! seen).

use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::collections::BTreeMap;

use crate::catalog::{Direction, ScheduleClock};
use crate::{DailyAggregate, HourlyAggregate, InterpolatedRow, PerfRate, TripStopAggregate};

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

// ============================================================================
// Level 1: per (route, trip, stop_sequence, stop_id, sched_arr)
// ============================================================================

struct TripStopAccum {
    route_id: String,
    direction: Direction,
    late: u32,
    on_time: u32,
    early: u32,
    /// Last (speed, arrdif) per contributing pair index; the per-group
    /// averages weight each pair once, not each row
    per_idx: BTreeMap<u32, (f64, i64)>,
    spd_list: Vec<f64>,
    arrdif_list: Vec<i64>,
    last_idx: u32,
    last_off_earr: Option<DateTime<Utc>>,
    last_perf: PerfRate,
    last_x: Option<f64>,
    last_y: Option<f64>,
}

/// Reduce one route's cleaned rows to level-1 aggregates. Only rows
/// carrying a performance classification participate, which keeps
/// `satis + unsatis == total_obs`.
pub fn aggregate_trip_stop(
    rows: &[InterpolatedRow],
    clock: &ScheduleClock,
) -> Vec<TripStopAggregate> {
    let mut groups: BTreeMap<(String, u32, String, DateTime<Utc>), TripStopAccum> =
        BTreeMap::new();

    for row in rows {
        let (Some(perf), Some(sched_arr)) = (row.perf_rate, row.sched_arr) else {
            continue;
        };
        let key = (
            row.trip_id.clone(),
            row.stop_sequence,
            row.stop_id.clone(),
            sched_arr,
        );
        let entry = groups.entry(key).or_insert_with(|| TripStopAccum {
            route_id: row.route_id.clone(),
            direction: row.direction,
            late: 0,
            on_time: 0,
            early: 0,
            per_idx: BTreeMap::new(),
            spd_list: Vec::new(),
            arrdif_list: Vec::new(),
            last_idx: row.idx,
            last_off_earr: None,
            last_perf: perf,
            last_x: None,
            last_y: None,
        });

        match perf {
            PerfRate::Late => entry.late += 1,
            PerfRate::OnTime => entry.on_time += 1,
            PerfRate::Early => entry.early += 1,
        }
        if let Some(diff) = row.off_arrdif_s {
            entry.per_idx.insert(row.idx, (row.proj_speed_kmh, diff));
            entry.spd_list.push(row.proj_speed_kmh);
            entry.arrdif_list.push(diff);
        }
        entry.last_idx = row.idx;
        entry.last_off_earr = row.off_earr;
        entry.last_perf = perf;
        entry.last_x = row.x;
        entry.last_y = row.y;
    }

    groups
        .into_iter()
        .map(|((trip_id, stop_sequence, stop_id, sched_arr), accum)| {
            let total_obs = accum.late + accum.on_time + accum.early;
            let satis = accum.on_time;
            let unsatis = accum.late + accum.early;
            let pct = |n: u32| {
                if total_obs == 0 {
                    0.0
                } else {
                    f64::from(n) / f64::from(total_obs) * 100.0
                }
            };
            TripStopAggregate {
                route_id: accum.route_id,
                direction: accum.direction,
                trip_id,
                stop_sequence,
                stop_id,
                sched_arr,
                off_earr: accum.last_off_earr,
                lprfrte: accum.last_perf,
                ref_hr: clock.local_hour(sched_arr),
                avg_spd: mean(accum.per_idx.values().map(|v| v.0)),
                avg_arrdif: mean(accum.per_idx.values().map(|v| v.1 as f64)),
                idx: accum.last_idx,
                total_obs,
                late: accum.late,
                on_time: accum.on_time,
                early: accum.early,
                satis,
                unsatis,
                prc_obs_sat: pct(satis),
                prc_obs_uns: pct(unsatis),
                spd_list: accum.spd_list,
                arrdif_list: accum.arrdif_list,
                x: accum.last_x,
                y: accum.last_y,
            }
        })
        .collect()
}

// ============================================================================
// Levels 2 and 3: per (route, stop, hour) and per (route, stop, day)
// ============================================================================

struct GroupSummary {
    cnt_trip_ids: u32,
    all_obs: u32,
    avg_spd: f64,
    spd_w: f64,
    avg_arrdif: f64,
    arrd_w: f64,
    prc_obs_sat: f64,
    prc_obs_uns: f64,
    prcw_sat: f64,
    prcw_uns: f64,
    act_sat_p: f64,
    act_uns_p: f64,
    x: Option<f64>,
    y: Option<f64>,
}

/// Shared level-2/level-3 arithmetic over a set of level-1 rows.
///
/// The unweighted means give every trip the same voice (service
/// reliability); the weighted means weight each trip by its observation
/// count (observed stability). `act_*` uses only the final projected
/// classification per trip.
fn summarize(rows: &[&TripStopAggregate]) -> GroupSummary {
    let all_obs: u32 = rows.iter().map(|r| r.total_obs).sum();
    let weighted = |f: fn(&TripStopAggregate) -> f64| {
        if all_obs == 0 {
            0.0
        } else {
            rows.iter()
                .map(|r| f(r) * f64::from(r.total_obs))
                .sum::<f64>()
                / f64::from(all_obs)
        }
    };

    // Final classification per trip: the last level-1 row wins.
    let mut final_per_trip: BTreeMap<&str, PerfRate> = BTreeMap::new();
    for r in rows {
        final_per_trip.insert(r.trip_id.as_str(), r.lprfrte);
    }
    let trips = final_per_trip.len();
    let act_sat = final_per_trip
        .values()
        .filter(|p| **p == PerfRate::OnTime)
        .count();
    let act_sat_p = if trips == 0 {
        0.0
    } else {
        act_sat as f64 / trips as f64 * 100.0
    };

    GroupSummary {
        cnt_trip_ids: rows.iter().map(|r| r.trip_id.as_str()).unique().count() as u32,
        all_obs,
        avg_spd: mean(rows.iter().map(|r| r.avg_spd)),
        spd_w: weighted(|r| r.avg_spd),
        avg_arrdif: mean(rows.iter().map(|r| r.avg_arrdif)),
        arrd_w: weighted(|r| r.avg_arrdif),
        prc_obs_sat: mean(rows.iter().map(|r| r.prc_obs_sat)),
        prc_obs_uns: mean(rows.iter().map(|r| r.prc_obs_uns)),
        prcw_sat: weighted(|r| r.prc_obs_sat),
        prcw_uns: weighted(|r| r.prc_obs_uns),
        act_sat_p,
        act_uns_p: 100.0 - act_sat_p,
        x: rows.last().and_then(|r| r.x),
        y: rows.last().and_then(|r| r.y),
    }
}

/// Level 2: reduce level-1 rows per (route, stop, hour).
pub fn aggregate_hourly(level1: &[TripStopAggregate]) -> Vec<HourlyAggregate> {
    let mut groups: BTreeMap<(String, Direction, u32, String, u32), Vec<&TripStopAggregate>> =
        BTreeMap::new();
    for row in level1 {
        groups
            .entry((
                row.route_id.clone(),
                row.direction,
                row.stop_sequence,
                row.stop_id.clone(),
                row.ref_hr,
            ))
            .or_default()
            .push(row);
    }

    groups
        .into_iter()
        .map(|((route_id, direction, stop_sequence, stop_id, ref_hr), rows)| {
            let s = summarize(&rows);
            HourlyAggregate {
                route_id,
                direction,
                stop_id,
                stop_sequence,
                ref_hr,
                cnt_trip_ids: s.cnt_trip_ids,
                all_obs: s.all_obs,
                avg_spd: s.avg_spd,
                spd_w: s.spd_w,
                avg_arrdif: s.avg_arrdif,
                arrd_w: s.arrd_w,
                prc_obs_sat: s.prc_obs_sat,
                prc_obs_uns: s.prc_obs_uns,
                prcw_sat: s.prcw_sat,
                prcw_uns: s.prcw_uns,
                act_sat_p: s.act_sat_p,
                act_uns_p: s.act_uns_p,
                x: s.x,
                y: s.y,
            }
        })
        .collect()
}

/// Level 3: reduce level-1 rows per (route, stop), over the whole day.
pub fn aggregate_daily(level1: &[TripStopAggregate]) -> Vec<DailyAggregate> {
    let mut groups: BTreeMap<(String, Direction, u32, String), Vec<&TripStopAggregate>> =
        BTreeMap::new();
    for row in level1 {
        groups
            .entry((
                row.route_id.clone(),
                row.direction,
                row.stop_sequence,
                row.stop_id.clone(),
            ))
            .or_default()
            .push(row);
    }

    groups
        .into_iter()
        .map(|((route_id, direction, stop_sequence, stop_id), rows)| {
            let s = summarize(&rows);
            let list_refhr: Vec<u32> = rows.iter().map(|r| r.ref_hr).unique().sorted().collect();
            DailyAggregate {
                route_id,
                direction,
                stop_id,
                stop_sequence,
                agglength: list_refhr.len() as u32,
                list_refhr,
                cnt_trip_ids: s.cnt_trip_ids,
                all_obs: s.all_obs,
                avg_spd: s.avg_spd,
                spd_w: s.spd_w,
                avg_arrdif: s.avg_arrdif,
                arrd_w: s.arrd_w,
                prc_obs_sat: s.prc_obs_sat,
                prc_obs_uns: s.prc_obs_uns,
                prcw_sat: s.prcw_sat,
                prcw_uns: s.prcw_uns,
                act_sat_p: s.act_sat_p,
                act_uns_p: s.act_uns_p,
                x: s.x,
                y: s.y,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Direction;
    use crate::{MobilityStatus, TravelType};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn clock() -> ScheduleClock {
        ScheduleClock::new(NaiveDate::from_ymd_opt(2021, 11, 20).unwrap(), 0)
    }

    fn row(
        trip: &str,
        idx: u32,
        stop: u32,
        sched_hr: u32,
        perf: PerfRate,
        speed: f64,
        arrdif: i64,
    ) -> InterpolatedRow {
        let sched = Utc
            .with_ymd_and_hms(2021, 11, 20, sched_hr, 15, 0)
            .unwrap();
        InterpolatedRow {
            route_id: "10".to_string(),
            direction: Direction::Outbound,
            trip_id: trip.to_string(),
            idx,
            stop_id: format!("S{}", stop),
            stop_sequence: stop,
            status: MobilityStatus::Movement,
            travel_type: TravelType::OneStop,
            proj_speed_kmh: speed,
            x: Some(-114.09),
            y: Some(51.05),
            tot_dist_m: 100.0,
            dist_m: 100.0,
            dist_futr_m: None,
            proj_travel_s: None,
            futr_travel_s: None,
            curr_time: Some(sched),
            est_arr: Some(sched),
            off_earr: Some(sched - chrono::Duration::seconds(arrdif)),
            sched_arr: Some(sched),
            sched_dep: None,
            off_arrdif_s: Some(arrdif),
            perc_chge: None,
            perf_rate: Some(perf),
        }
    }

    #[test]
    fn test_level1_counts_and_percentages() {
        let rows = vec![
            row("t1", 1, 3, 6, PerfRate::OnTime, 30.0, 50),
            row("t1", 2, 3, 6, PerfRate::OnTime, 40.0, 80),
            row("t1", 3, 3, 6, PerfRate::Late, 20.0, -200),
        ];
        let agg = aggregate_trip_stop(&rows, &clock());
        assert_eq!(agg.len(), 1);
        let a = &agg[0];
        assert_eq!(a.total_obs, 3);
        assert_eq!(a.satis, 2);
        assert_eq!(a.unsatis, 1);
        assert_eq!(a.satis + a.unsatis, a.total_obs);
        assert!((a.prc_obs_sat + a.prc_obs_uns - 100.0).abs() < 0.01);
        assert_eq!(a.lprfrte, PerfRate::Late);
        assert_eq!(a.ref_hr, 6);
        assert_eq!(a.idx, 3);
        assert_eq!(a.spd_list.len(), 3);
    }

    #[test]
    fn test_level1_skips_unclassified_rows() {
        let mut unclassified = row("t1", 1, 3, 6, PerfRate::OnTime, 30.0, 50);
        unclassified.perf_rate = None;
        let rows = vec![unclassified, row("t1", 2, 3, 6, PerfRate::OnTime, 30.0, 50)];
        let agg = aggregate_trip_stop(&rows, &clock());
        assert_eq!(agg[0].total_obs, 1);
    }

    #[test]
    fn test_level1_averages_weight_each_pair_once() {
        // idx 1 contributes two rows; the average uses its last value only.
        let rows = vec![
            row("t1", 1, 3, 6, PerfRate::OnTime, 10.0, 100),
            row("t1", 1, 3, 6, PerfRate::OnTime, 20.0, 40),
            row("t1", 2, 3, 6, PerfRate::OnTime, 40.0, 80),
        ];
        let agg = aggregate_trip_stop(&rows, &clock());
        assert!((agg[0].avg_spd - 30.0).abs() < 1e-9);
        assert!((agg[0].avg_arrdif - 60.0).abs() < 1e-9);
        // The raw lists keep every observation
        assert_eq!(agg[0].spd_list, vec![10.0, 20.0, 40.0]);
    }

    #[test]
    fn test_hourly_weighted_and_unweighted_means() {
        // Two trips at the same stop and hour: t1 with 3 observations,
        // t2 with 1.
        let rows = vec![
            row("t1", 1, 3, 6, PerfRate::OnTime, 30.0, 60),
            row("t1", 2, 3, 6, PerfRate::OnTime, 30.0, 60),
            row("t1", 3, 3, 6, PerfRate::OnTime, 30.0, 60),
            row("t2", 1, 3, 6, PerfRate::Late, 60.0, -400),
        ];
        let level1 = aggregate_trip_stop(&rows, &clock());
        assert_eq!(level1.len(), 2);
        let hourly = aggregate_hourly(&level1);
        assert_eq!(hourly.len(), 1);
        let h = &hourly[0];
        assert_eq!(h.cnt_trip_ids, 2);
        assert_eq!(h.all_obs, 4);
        // Unweighted: (30 + 60) / 2
        assert!((h.avg_spd - 45.0).abs() < 1e-9);
        // Weighted by observations: (30*3 + 60*1) / 4
        assert!((h.spd_w - 37.5).abs() < 1e-9);
        // Final classifications: one On-Time of two trips
        assert!((h.act_sat_p - 50.0).abs() < 1e-9);
        assert!((h.act_uns_p - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_daily_rollup_tracks_hours() {
        let rows = vec![
            row("t1", 1, 3, 6, PerfRate::OnTime, 30.0, 60),
            row("t2", 1, 3, 7, PerfRate::OnTime, 30.0, 60),
            row("t3", 1, 3, 9, PerfRate::Late, 30.0, -300),
            row("t4", 1, 3, 7, PerfRate::OnTime, 30.0, 60),
        ];
        let level1 = aggregate_trip_stop(&rows, &clock());
        let daily = aggregate_daily(&level1);
        assert_eq!(daily.len(), 1);
        let d = &daily[0];
        assert_eq!(d.agglength, 3);
        assert_eq!(d.list_refhr, vec![6, 7, 9]);
        assert_eq!(d.cnt_trip_ids, 4);
        assert_eq!(d.all_obs, 4);
        // 3 of 4 trips finished On-Time
        assert!((d.act_sat_p - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate_trip_stop(&[], &clock()).is_empty());
        assert!(aggregate_hourly(&[]).is_empty());
        assert!(aggregate_daily(&[]).is_empty());
    }
}
