//! End-to-end pipeline scenarios over a synthetic day of fixes.
//!
//! The fixture is a straight east-west route at 51.0525N with ten
//! ~70 m segments and five stops (two segments per stop chain), staged
//! in the conventional folder layout. Distances quoted in the
//! assertions come from ~70 m per 0.001 degree of longitude at this
//! latitude.

use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};

use transit_otp::{run_day, write_outputs, PerfRate, PipelineConfig};

const LAT: f64 = 51.0525;
const GTFS_DATE: &str = "2021-11-17";
const RAW_DATE: &str = "2021-11-20";

fn raw_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 11, 20).unwrap()
}

fn fixture_root(name: &str) -> PathBuf {
    let root = std::env::temp_dir()
        .join(format!("transit-otp-it-{}", std::process::id()))
        .join(name);
    if root.exists() {
        fs::remove_dir_all(&root).unwrap();
    }
    root
}

fn write_file(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Stage the geometry artifacts for route 10 Outbound: ten segments,
/// stops 1..=5 at x = -114.098, -114.096, ..., -114.090.
fn write_route_artifacts(root: &Path, claimed_max_stop: u32) {
    let staging = root.join("2_staging").join(GTFS_DATE);

    let mut undissolved = String::from(
        "seg_index,objectid,stop_id,stop_sequence,x_start,y_start,x_end,y_end,wkid\n",
    );
    for i in 0..10u32 {
        let x0 = -114.100 + f64::from(i) * 0.001;
        undissolved.push_str(&format!(
            "{},{},S{},{},{:.6},{:.6},{:.6},{:.6},4326\n",
            i,
            i + 1,
            i / 2 + 1,
            i / 2 + 1,
            x0,
            LAT,
            x0 + 0.001,
            LAT
        ));
    }
    write_file(
        &staging.join("Route").join("10_Outbound_undissolved.csv"),
        &undissolved,
    );

    let mut dissolved = String::from("vertex_index,x,y,wkid\n");
    for i in 0..=10u32 {
        let x = -114.100 + f64::from(i) * 0.001;
        dissolved.push_str(&format!("{},{:.6},{:.6},4326\n", i, x, LAT));
    }
    write_file(
        &staging.join("Route").join("10_Outbound_dissolved.csv"),
        &dissolved,
    );

    let mut stops = String::from("stop_id,stop_sequence,x,y,wkid\n");
    for s in 1..=claimed_max_stop.min(5) {
        let x = -114.100 + f64::from(2 * s) * 0.001;
        stops.push_str(&format!("S{},{},{:.6},{:.6},4326\n", s, s, x, LAT));
    }
    if claimed_max_stop > 5 {
        // The stop list claims a terminus the polyline never reaches.
        stops.push_str(&format!("S{0},{0},-114.085,{1:.6},4326\n", claimed_max_stop, LAT));
    }
    write_file(&staging.join("Stops").join("10_Outbound.csv"), &stops);
}

fn write_gtfs_tables(root: &Path, trips: &[(&str, &str)], schedule_hours: &[(&str, u32)]) {
    let gtfs = root.join("0_external").join("GTFS").join(GTFS_DATE);

    let mut trips_txt =
        String::from("route_id,service_id,trip_id,trip_headsign,direction_id,shape_id\n");
    for (route, trip) in trips {
        trips_txt.push_str(&format!("{},WKDY,{},Downtown,0,sh{}\n", route, trip, route));
    }
    write_file(&gtfs.join("trips.txt"), &trips_txt);

    // Stop 1 at :42, stop 2 at :44, then one minute per stop.
    let mut stop_times =
        String::from("trip_id,arrival_time,departure_time,stop_id,stop_sequence\n");
    for (trip, hour) in schedule_hours {
        for s in 1..=5u32 {
            let minute = if s == 1 { 42 } else { 42 + s };
            stop_times.push_str(&format!(
                "{},{:02}:{:02}:00,{:02}:{:02}:20,S{},{}\n",
                trip, hour, minute, hour, minute, s, s
            ));
        }
    }
    write_file(&gtfs.join("stop_times.txt"), &stop_times);
}

/// A trip moving stop 2 -> 5 on schedule, one fix per minute plus a
/// final fix near the terminus.
fn on_schedule_fixes(trip: &str, hour: u32) -> Vec<String> {
    [
        (42, 42, -114.0975), // seg 2, to stop 2
        (43, 42, -114.0955), // seg 4, to stop 3
        (44, 42, -114.0935), // seg 6, to stop 4
        (45, 42, -114.0915), // seg 8, to stop 5
        (46, 12, -114.0905), // seg 9, still to stop 5
    ]
    .iter()
    .map(|(m, s, x)| {
        format!(
            "{},2021-11-20T{:02}:{:02}:{:02}Z,{:.6},{:.6},veh-1",
            trip, hour, m, s, LAT, x
        )
    })
    .collect()
}

fn write_fix_table(root: &Path, rows: &[String]) {
    let mut csv = String::from("trip_id,timestamp,lat,lon,vehicle_id\n");
    for row in rows {
        csv.push_str(row);
        csv.push('\n');
    }
    write_file(
        &root
            .join("0_external")
            .join("GTFS")
            .join(GTFS_DATE)
            .join(format!("GTFSRT_{}.csv", RAW_DATE)),
        &csv,
    );
}

#[test]
fn end_to_end_day_run() {
    let root = fixture_root("day-run");
    write_route_artifacts(&root, 5);
    write_gtfs_tables(&root, &[("10", "ta"), ("10", "tb")], &[("ta", 15), ("tb", 16)]);
    let mut rows = on_schedule_fixes("ta", 15);
    rows.extend(on_schedule_fixes("tb", 16));
    write_fix_table(&root, &rows);

    let config = PipelineConfig::default();
    let output = run_day(&root, GTFS_DATE, raw_date(), &config).unwrap();

    assert_eq!(output.exit_code(), 0);
    assert_eq!(output.manifest.failed_routes, 0);
    assert_eq!(output.manifest.total_fixes, 10);
    assert_eq!(output.manifest.unmatched_fixes, 0);
    assert_eq!(output.manifest.routes.len(), 1);
    assert_eq!(output.manifest.routes[0].retention, 1.0);

    // Each trip is observed en route to stops 2..=5.
    assert_eq!(output.trip_stop.len(), 8);
    for row in &output.trip_stop {
        assert!(row.stop_sequence >= 2 && row.stop_sequence <= 5);
        assert_eq!(row.satis + row.unsatis, row.total_obs);
        assert!((row.prc_obs_sat + row.prc_obs_uns - 100.0).abs() < 0.01);
        // The vehicle runs on schedule throughout.
        assert_eq!(row.lprfrte, PerfRate::OnTime);
    }

    // One hourly row per (stop, hour) and one daily row per stop.
    assert_eq!(output.hourly.len(), 8);
    assert_eq!(output.daily.len(), 4);
    for day in &output.daily {
        assert_eq!(day.agglength, 2);
        assert_eq!(day.list_refhr, vec![15, 16]);
        assert_eq!(day.cnt_trip_ids, 2);
        assert!((day.act_sat_p - 100.0).abs() < 1e-9);
        assert!((day.prc_obs_sat + day.prc_obs_uns - 100.0).abs() < 0.01);
    }

    // The tables land in the conventional folders.
    write_outputs(&output, &root, GTFS_DATE, RAW_DATE).unwrap();
    assert!(root
        .join("6_analyses")
        .join(GTFS_DATE)
        .join("general_aggregation.csv")
        .exists());
    assert!(root
        .join("7_requests")
        .join(GTFS_DATE)
        .join("hourly_aggregation.csv")
        .exists());
    assert!(root
        .join("7_requests")
        .join(GTFS_DATE)
        .join("daily_aggregation.csv")
        .exists());
    assert!(root
        .join("7_requests")
        .join(GTFS_DATE)
        .join("manifest.json")
        .exists());

    fs::remove_dir_all(&root).ok();
}

#[test]
fn pipeline_is_deterministic() {
    let root = fixture_root("determinism");
    write_route_artifacts(&root, 5);
    write_gtfs_tables(&root, &[("10", "ta"), ("10", "tb")], &[("ta", 15), ("tb", 16)]);
    let mut rows = on_schedule_fixes("ta", 15);
    rows.extend(on_schedule_fixes("tb", 16));
    write_fix_table(&root, &rows);

    let config = PipelineConfig::default();
    let first = run_day(&root, GTFS_DATE, raw_date(), &config).unwrap();
    let second = run_day(&root, GTFS_DATE, raw_date(), &config).unwrap();

    let a = serde_json::to_string(&first.trip_stop).unwrap();
    let b = serde_json::to_string(&second.trip_stop).unwrap();
    assert_eq!(a, b);
    let a = serde_json::to_string(&first.daily).unwrap();
    let b = serde_json::to_string(&second.daily).unwrap();
    assert_eq!(a, b);

    fs::remove_dir_all(&root).ok();
}

#[test]
fn qaqc_removes_spurious_backstep() {
    let root = fixture_root("backstep");
    write_route_artifacts(&root, 5);
    write_gtfs_tables(&root, &[("10", "ta")], &[("ta", 15)]);
    let mut rows = on_schedule_fixes("ta", 15);
    // A jittered fix snapping far behind the trip's progression.
    rows.insert(
        3,
        format!(
            "ta,2021-11-20T15:44:30Z,{:.6},{:.6},veh-1",
            LAT, -114.0985
        ),
    );
    write_fix_table(&root, &rows);

    let config = PipelineConfig::default();
    let output = run_day(&root, GTFS_DATE, raw_date(), &config).unwrap();

    let report = &output.manifest.routes[0];
    assert_eq!(report.input_fixes, 6);
    assert!(report.retention < 1.0);
    assert!(report.retention >= 0.8);
    // The surviving rows still classify cleanly.
    assert!(output
        .trip_stop
        .iter()
        .all(|r| r.lprfrte == PerfRate::OnTime));

    fs::remove_dir_all(&root).ok();
}

#[test]
fn terminus_mismatch_is_lowered_to_polyline_max() {
    let root = fixture_root("terminus-mismatch");
    // The stop list claims 63 stops; the polyline tops out at 5.
    write_route_artifacts(&root, 63);
    write_gtfs_tables(&root, &[("10", "ta")], &[("ta", 15)]);
    write_fix_table(&root, &on_schedule_fixes("ta", 15));

    let config = PipelineConfig::default();
    let output = run_day(&root, GTFS_DATE, raw_date(), &config).unwrap();

    assert_eq!(output.manifest.failed_routes, 0);
    assert!(!output.trip_stop.is_empty());
    // No observation is emitted beyond the reachable terminus.
    assert!(output.trip_stop.iter().all(|r| r.stop_sequence <= 5));
    // The terminus fixes still classify (they hit the effective max).
    assert!(output
        .trip_stop
        .iter()
        .any(|r| r.stop_sequence == 5 && r.total_obs > 0));

    fs::remove_dir_all(&root).ok();
}

#[test]
fn failed_route_is_reported_and_job_continues() {
    let root = fixture_root("partial-failure");
    write_route_artifacts(&root, 5);
    // Route 99 has trips and fixes but no staged geometry.
    write_gtfs_tables(
        &root,
        &[("10", "ta"), ("99", "zz")],
        &[("ta", 15), ("zz", 15)],
    );
    let mut rows = on_schedule_fixes("ta", 15);
    rows.push(format!(
        "zz,2021-11-20T15:42:42Z,{:.6},{:.6},veh-9",
        LAT, -114.0975
    ));
    write_fix_table(&root, &rows);

    let config = PipelineConfig::default();
    let output = run_day(&root, GTFS_DATE, raw_date(), &config).unwrap();

    assert_eq!(output.manifest.failed_routes, 1);
    assert_eq!(output.exit_code(), 2);
    let failed = output
        .manifest
        .routes
        .iter()
        .find(|r| r.route_id == "99")
        .unwrap();
    assert!(failed.failed);
    assert!(!failed.errors.is_empty());
    // The healthy route still aggregates.
    assert!(output.trip_stop.iter().all(|r| r.route_id == "10"));
    assert!(!output.trip_stop.is_empty());

    fs::remove_dir_all(&root).ok();
}

#[test]
fn missing_fix_table_aborts_with_input_error() {
    let root = fixture_root("missing-input");
    write_route_artifacts(&root, 5);
    write_gtfs_tables(&root, &[("10", "ta")], &[("ta", 15)]);
    // No GTFSRT csv written.

    let config = PipelineConfig::default();
    let err = run_day(&root, GTFS_DATE, raw_date(), &config).unwrap_err();
    assert_eq!(err.exit_code(), 1);

    fs::remove_dir_all(&root).ok();
}

#[test]
fn intermediates_are_exported_on_request() {
    let root = fixture_root("intermediates");
    write_route_artifacts(&root, 5);
    write_gtfs_tables(&root, &[("10", "ta")], &[("ta", 15)]);
    write_fix_table(&root, &on_schedule_fixes("ta", 15));

    let config = PipelineConfig {
        write_intermediates: true,
        ..PipelineConfig::default()
    };
    let output = run_day(&root, GTFS_DATE, raw_date(), &config).unwrap();
    write_outputs(&output, &root, GTFS_DATE, RAW_DATE).unwrap();

    for (stage, suffix) in [
        ("3_interim", "located"),
        ("3_interim", "cleaned"),
        ("4_processed", "processed"),
        ("5_conformed", "interpolated"),
        ("5_conformed", "interpolated_cleaned"),
    ] {
        let path = root.join(stage).join(GTFS_DATE).join(format!(
            "{}_10-Outbound_{}.csv",
            RAW_DATE, suffix
        ));
        assert!(path.exists(), "missing {}", path.display());
    }

    fs::remove_dir_all(&root).ok();
}
