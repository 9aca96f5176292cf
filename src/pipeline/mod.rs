//! The per-route pipeline: geolocate, QA/QC, enrich, interpolate,
//! refine, and the level-1 aggregation. One call processes one
//! `(route_id, direction)` slice of the day's fixes; the executor runs
//! these calls in parallel and reduces their outputs.

pub mod aggregate;
pub mod enrich;
pub mod geolocate;
pub mod interpolate;
pub mod qaqc;
pub mod refine;

pub use aggregate::{aggregate_daily, aggregate_hourly, aggregate_trip_stop};
pub use enrich::enrich_route;
pub use geolocate::Geolocator;
pub use interpolate::interpolate_route;
pub use qaqc::filter_route;
pub use refine::refine_route;

use log::info;

use crate::catalog::{RouteCatalog, RouteKey, ScheduleClock};
use crate::{
    EnrichedRow, InterpolatedRow, PipelineConfig, RawFix, RouteReport, SnappedFix,
    TripStopAggregate,
};

/// Per-route intermediate tables, kept only when the run exports them.
#[derive(Debug, Default)]
pub struct Intermediates {
    pub snapped: Vec<SnappedFix>,
    pub cleaned: Vec<SnappedFix>,
    pub enriched: Vec<EnrichedRow>,
    pub interpolated: Vec<InterpolatedRow>,
    pub refined: Vec<InterpolatedRow>,
}

/// Everything one route task hands back to the reducer.
#[derive(Debug)]
pub struct RouteOutcome {
    pub key: RouteKey,
    pub level1: Vec<TripStopAggregate>,
    pub report: RouteReport,
    pub intermediates: Option<Intermediates>,
}

impl RouteOutcome {
    /// An outcome for a route that could not be processed at all.
    pub fn failed(key: RouteKey, message: String) -> Self {
        let mut report = RouteReport::new(&key);
        report.errors.push(message);
        report.failed = true;
        Self {
            key,
            level1: Vec::new(),
            report,
            intermediates: None,
        }
    }
}

/// Run the full per-route pipeline over one route's fixes.
///
/// The fixes must be sorted by `(trip_id, timestamp)`. Row-level
/// problems are counted in the report and never abort the route; only a
/// missing or unusable polyline fails it.
pub fn process_route(
    key: RouteKey,
    catalog: &RouteCatalog,
    fixes: &[RawFix],
    config: &PipelineConfig,
    clock: &ScheduleClock,
) -> RouteOutcome {
    let mut report = RouteReport::new(&key);
    report.input_fixes = fixes.len();

    let geolocator = match Geolocator::new(catalog, config) {
        Ok(g) => g,
        Err(e) => return RouteOutcome::failed(key, e.to_string()),
    };

    let mut intermediates = config.write_intermediates.then(Intermediates::default);

    // C3: snap
    let geo = geolocator.run(fixes);
    report.geolocated = geo.snapped.len();
    if geo.dropped_far > 0 {
        report
            .errors
            .push(format!("{} fixes beyond the snap bound", geo.dropped_far));
    }
    if geo.dropped_unmatched > 0 {
        report.errors.push(format!(
            "{} snap points matched no segment",
            geo.dropped_unmatched
        ));
    }
    if let Some(dump) = intermediates.as_mut() {
        dump.snapped = geo.snapped.clone();
    }

    // C4: QA/QC
    let qaqc = filter_route(geo.snapped);
    report.retained = qaqc.kept.len();
    report.retention = qaqc.retention;
    if let Some(dump) = intermediates.as_mut() {
        dump.cleaned = qaqc.kept.clone();
    }

    // C5: enrich
    let enriched = enrich_route(qaqc.kept, catalog, clock, config);
    report.enriched = enriched.rows.len();
    if let Some(dump) = intermediates.as_mut() {
        dump.enriched = enriched.rows.clone();
    }

    // C6: interpolate
    let interp = interpolate_route(&enriched.rows, catalog, clock, config);
    report.interpolated_rows = interp.rows.len();
    report.anomalies = interp.anomalies;
    if interp.anomalies > 0 {
        report
            .errors
            .push(format!("{} anomalous pairs skipped", interp.anomalies));
    }
    if let Some(dump) = intermediates.as_mut() {
        dump.interpolated = interp.rows.clone();
    }

    // C7: refine
    let (refined, refine_stats) =
        refine_route(interp.rows, catalog.max_stop_sequence, config);
    report.refined_rows = refined.len();
    report.dropped_refine =
        refine_stats.dropped_speed + refine_stats.dropped_arrdif + refine_stats.dropped_wrap;

    // C8 level 1 runs inside the task so its output is per-route coherent.
    let level1 = aggregate_trip_stop(&refined, clock);
    if let Some(dump) = intermediates.as_mut() {
        dump.refined = refined;
    }

    info!(
        "{}: {} fixes, retention {:.1}%, {} interpolated rows, {} aggregated, {} errors",
        key,
        report.input_fixes,
        report.retention * 100.0,
        report.refined_rows,
        level1.len(),
        report.errors.len()
    );

    RouteOutcome {
        key,
        level1,
        report,
        intermediates,
    }
}
