//! Parallel executor: fan the per-route pipeline out across worker
//! threads and reduce the results into the three aggregate tables.
//!
//! The unit of parallelism is `(route_id, direction)`. Tasks share the
//! immutable catalog and own their slice of the day's fixes; nothing on
//! the hot path takes a lock. A panicking task only fails its own
//! route. Results are reduced in route-key order, so repeated runs over
//! the same inputs produce identical aggregates.

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use log::error;

use crate::catalog::{load_catalogs, load_trip_index, RouteCatalog, RouteKey, ScheduleClock};
use crate::error::Result;
use crate::ingest::{group_by_route, read_fix_table};
use crate::pipeline::{aggregate_daily, aggregate_hourly, process_route, RouteOutcome};
use crate::{
    DailyAggregate, HourlyAggregate, PipelineConfig, RawFix, RunManifest, TripStopAggregate,
};

/// The reduced output of one day's run.
#[derive(Debug)]
pub struct RunOutput {
    pub trip_stop: Vec<TripStopAggregate>,
    pub hourly: Vec<HourlyAggregate>,
    pub daily: Vec<DailyAggregate>,
    pub manifest: RunManifest,
    /// Per-route outcomes, kept for the optional intermediate exports
    pub outcomes: Vec<RouteOutcome>,
}

impl RunOutput {
    /// Worst-outcome exit code: 0 clean, 2 when some routes failed.
    pub fn exit_code(&self) -> i32 {
        if self.manifest.failed_routes > 0 {
            2
        } else {
            0
        }
    }
}

fn run_one(
    key: &RouteKey,
    fixes: &[RawFix],
    catalogs: &HashMap<RouteKey, Arc<RouteCatalog>>,
    load_errors: &HashMap<RouteKey, String>,
    config: &PipelineConfig,
    clock: &ScheduleClock,
    deadline: Option<Instant>,
) -> RouteOutcome {
    if deadline.map_or(false, |d| Instant::now() > d) {
        return RouteOutcome::failed(key.clone(), "global timeout exceeded".to_string());
    }
    let Some(catalog) = catalogs.get(key) else {
        let message = load_errors
            .get(key)
            .cloned()
            .unwrap_or_else(|| "catalog unavailable".to_string());
        error!("{}: {}", key, message);
        return RouteOutcome::failed(key.clone(), message);
    };

    // A worker crash is contained here: the route is reported as failed
    // and every other task keeps running.
    catch_unwind(AssertUnwindSafe(|| {
        process_route(key.clone(), catalog, fixes, config, clock)
    }))
    .unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "worker panicked".to_string());
        error!("{}: task failed: {}", key, message);
        RouteOutcome::failed(key.clone(), format!("task failed: {}", message))
    })
}

#[cfg(feature = "parallel")]
fn run_tasks(
    tasks: &[(RouteKey, Vec<RawFix>)],
    catalogs: &HashMap<RouteKey, Arc<RouteCatalog>>,
    load_errors: &HashMap<RouteKey, String>,
    config: &PipelineConfig,
    clock: &ScheduleClock,
    deadline: Option<Instant>,
) -> Vec<RouteOutcome> {
    use log::warn;
    use rayon::prelude::*;

    let work = |(key, fixes): &(RouteKey, Vec<RawFix>)| {
        run_one(key, fixes, catalogs, load_errors, config, clock, deadline)
    };
    match config.workers {
        Some(n) => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
            Ok(pool) => pool.install(|| tasks.par_iter().map(work).collect()),
            Err(e) => {
                warn!("could not size the worker pool ({}), using default", e);
                tasks.par_iter().map(work).collect()
            }
        },
        None => tasks.par_iter().map(work).collect(),
    }
}

#[cfg(not(feature = "parallel"))]
fn run_tasks(
    tasks: &[(RouteKey, Vec<RawFix>)],
    catalogs: &HashMap<RouteKey, Arc<RouteCatalog>>,
    load_errors: &HashMap<RouteKey, String>,
    config: &PipelineConfig,
    clock: &ScheduleClock,
    deadline: Option<Instant>,
) -> Vec<RouteOutcome> {
    tasks
        .iter()
        .map(|(key, fixes)| run_one(key, fixes, catalogs, load_errors, config, clock, deadline))
        .collect()
}

/// Run one day of fixes against one static GTFS snapshot.
///
/// `main_folder` follows the conventional layout: the fix table and
/// GTFS bundle under `0_external/GTFS/<gtfs_date>/`, staged geometry
/// under `2_staging/<gtfs_date>/`.
pub fn run_day(
    main_folder: &Path,
    gtfs_date: &str,
    raw_date: NaiveDate,
    config: &PipelineConfig,
) -> Result<RunOutput> {
    let clock = ScheduleClock::new(raw_date, config.schedule_utc_offset_s);
    let gtfs_dir = main_folder.join("0_external").join("GTFS").join(gtfs_date);

    let trip_index = load_trip_index(&gtfs_dir)?;
    let fix_path = gtfs_dir.join(format!("GTFSRT_{}.csv", raw_date.format("%Y-%m-%d")));
    let fixes = read_fix_table(&fix_path, &clock)?;
    let total_fixes = fixes.len();

    let (grouped, unmatched_fixes) = group_by_route(fixes, &trip_index);
    let needed: BTreeSet<RouteKey> = grouped.keys().cloned().collect();

    let set = load_catalogs(main_folder, gtfs_date, &needed, trip_index, config.wkid)?;
    let load_errors: HashMap<RouteKey, String> = set
        .load_errors
        .iter()
        .map(|(key, e)| (key.clone(), e.to_string()))
        .collect();

    // Deterministic task order; the reduction below preserves it.
    let mut tasks: Vec<(RouteKey, Vec<RawFix>)> = grouped.into_iter().collect();
    tasks.sort_by(|a, b| a.0.cmp(&b.0));

    let deadline = config
        .global_timeout_s
        .map(|s| Instant::now() + Duration::from_secs(s));
    let mut outcomes = run_tasks(&tasks, &set.routes, &load_errors, config, &clock, deadline);

    let mut trip_stop = Vec::new();
    for outcome in &mut outcomes {
        trip_stop.append(&mut outcome.level1);
    }
    let hourly = aggregate_hourly(&trip_stop);
    let daily = aggregate_daily(&trip_stop);

    let manifest = RunManifest {
        gtfs_date: gtfs_date.to_string(),
        raw_date: raw_date.format("%Y-%m-%d").to_string(),
        total_fixes,
        unmatched_fixes,
        routes: outcomes.iter().map(|o| o.report.clone()).collect(),
        failed_routes: outcomes.iter().filter(|o| o.report.failed).count(),
    };

    Ok(RunOutput {
        trip_stop,
        hourly,
        daily,
        manifest,
        outcomes,
    })
}
