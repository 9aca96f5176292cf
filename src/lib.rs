//! # transit-otp
//!
//! Vehicle trajectory reconstruction and stop-level on-time performance
//! for one day of GTFS-Realtime vehicle positions.
//!
//! The pipeline snaps noisy GPS fixes to their route polyline, resolves
//! ambiguous matches on self-overlapping loops, enforces monotonic trip
//! progression, classifies mobility state, interpolates missing stop
//! arrivals from sparse consecutive samples, and rolls the results up
//! per trip, per hour, and per day.
//!
//! ## Features
//!
//! - **`parallel`** (default) - per-route fan-out with rayon
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use chrono::NaiveDate;
//! use transit_otp::{run_day, PipelineConfig};
//!
//! let config = PipelineConfig::default();
//! let raw_date = NaiveDate::from_ymd_opt(2021, 11, 20).unwrap();
//! let output = run_day(Path::new("data"), "2021-11-17", raw_date, &config).unwrap();
//! println!("{} hourly rows", output.hourly.len());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// Unified error handling
pub mod error;
pub use error::{OptionExt, OtpError, Result};

// Geometry primitives (projection, containment, metric lengths)
pub mod geometry;
pub use geometry::{
    haversine_distance, point_in_segment, project_point_to_polyline, Projection, SpatialRef,
};

// Route catalog (segments, dissolved polyline, schedule)
pub mod catalog;
pub use catalog::{
    CatalogSet, Direction, RouteCatalog, RouteKey, ScheduleClock, Segment, StopSchedule,
};

// Fix table ingestion
pub mod ingest;
pub use ingest::{group_by_route, read_fix_table};

// Per-route pipeline stages (geolocate -> qaqc -> enrich -> interpolate -> refine -> aggregate)
pub mod pipeline;
pub use pipeline::{process_route, RouteOutcome};

// Parallel executor and reduction
pub mod executor;
pub use executor::{run_day, RunOutput};

// Output tables and run manifest
pub mod output;
pub use output::write_outputs;

// ============================================================================
// Core Types
// ============================================================================

/// A raw GTFS-RT vehicle position sample, as harvested to the daily CSV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFix {
    pub trip_id: String,
    pub timestamp: DateTime<Utc>,
    pub lon: f64,
    pub lat: f64,
    /// Carried through from the feed; unused by the core.
    pub vehicle_id: Option<String>,
}

impl RawFix {
    /// Check that the coordinates are plausible lon/lat values.
    pub fn is_valid(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && self.lat >= -90.0
            && self.lat <= 90.0
            && self.lon >= -180.0
            && self.lon <= 180.0
    }
}

/// A fix snapped onto its route, carrying the resolved segment identity.
#[derive(Debug, Clone, Serialize)]
pub struct SnappedFix {
    pub trip_id: String,
    pub timestamp: DateTime<Utc>,
    /// Per-route insertion counter, assigned before QA/QC. Used as a
    /// tie-break and to make filtered rows visible downstream.
    pub barcode: u64,
    pub seg_index: u32,
    pub objectid: u32,
    pub stop_id: String,
    pub stop_sequence: u32,
    /// Snapped longitude (or projected x)
    pub x: f64,
    /// Snapped latitude (or projected y)
    pub y: f64,
}

/// Mobility state of a consecutive fix pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MobilityStatus {
    Stationary,
    Movement,
    Terminus,
}

impl fmt::Display for MobilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MobilityStatus::Stationary => write!(f, "Stationary"),
            MobilityStatus::Movement => write!(f, "Movement"),
            MobilityStatus::Terminus => write!(f, "Terminus"),
        }
    }
}

/// On-time performance classification of an interpolated arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerfRate {
    Late,
    #[serde(rename = "On-Time")]
    OnTime,
    Early,
}

impl PerfRate {
    /// Classify an arrival-difference in seconds.
    ///
    /// Late when `off_arrdif_s <= late_threshold_s`, Early when
    /// `off_arrdif_s >= early_threshold_s`, On-Time otherwise. The three
    /// classes partition the axis.
    pub fn classify(off_arrdif_s: i64, config: &PipelineConfig) -> Self {
        if off_arrdif_s <= config.late_threshold_s {
            PerfRate::Late
        } else if off_arrdif_s >= config.early_threshold_s {
            PerfRate::Early
        } else {
            PerfRate::OnTime
        }
    }
}

impl fmt::Display for PerfRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerfRate::Late => write!(f, "Late"),
            PerfRate::OnTime => write!(f, "On-Time"),
            PerfRate::Early => write!(f, "Early"),
        }
    }
}

/// How a consecutive pair was interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TravelType {
    Stationary,
    #[serde(rename = "One Stop")]
    OneStop,
    #[serde(rename = "Between Stops")]
    BtwnStops,
    #[serde(rename = "Same Stop - Same Segment")]
    SameStopSameSeg,
    #[serde(rename = "Same Stop - Different Segment")]
    SameStopDiffSeg,
    Terminus,
}

impl fmt::Display for TravelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TravelType::Stationary => write!(f, "Stationary"),
            TravelType::OneStop => write!(f, "One Stop"),
            TravelType::BtwnStops => write!(f, "Between Stops"),
            TravelType::SameStopSameSeg => write!(f, "Same Stop - Same Segment"),
            TravelType::SameStopDiffSeg => write!(f, "Same Stop - Different Segment"),
            TravelType::Terminus => write!(f, "Terminus"),
        }
    }
}

/// A cleaned fix with pair features attached, ready for interpolation.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedRow {
    pub trip_id: String,
    /// Per-trip counter over post-QA/QC rows. Gaps relative to `barcode`
    /// indicate filtered rows and are informational only.
    pub idx: u32,
    pub barcode: u64,
    pub status: MobilityStatus,
    /// Status of the next pair of the same trip, when one exists
    pub stat_next: Option<MobilityStatus>,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub max_stop_sequence: u32,
    pub max_stop_seq_validated: bool,
    /// Stops remaining to the terminus
    pub stp_left: u32,
    /// Forward difference of `stp_left` to the next row
    pub stp_diff: Option<i64>,
    pub seg_index: u32,
    pub max_seg_index: u32,
    /// Segments remaining to the terminus
    pub idx_left: u32,
    /// Forward difference of `idx_left` to the next row
    pub idx_diff: Option<i64>,
    pub x: f64,
    pub y: f64,
    pub timestamp: DateTime<Utc>,
    /// Seconds to the next fix of the same trip
    pub delta_time_s: Option<i64>,
    /// Straight-line meters to the next fix. Only computed for pairs
    /// whose tentative status needs the stationary confirmation.
    pub delta_dist_m: Option<f64>,
    pub sched_arr: Option<DateTime<Utc>>,
    pub sched_dep: Option<DateTime<Utc>>,
}

/// One interpolated observation: a traversed, dwelled-at, or projected stop.
#[derive(Debug, Clone, Serialize)]
pub struct InterpolatedRow {
    pub route_id: String,
    pub direction: Direction,
    pub trip_id: String,
    pub idx: u32,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub status: MobilityStatus,
    pub travel_type: TravelType,
    pub proj_speed_kmh: f64,
    pub x: Option<f64>,
    pub y: Option<f64>,
    /// Total metric distance covered by the pair
    pub tot_dist_m: f64,
    /// Distance attributed to this row's leg
    pub dist_m: f64,
    /// Arc length from the later fix to its upcoming stop
    pub dist_futr_m: Option<f64>,
    pub proj_travel_s: Option<f64>,
    pub futr_travel_s: Option<f64>,
    pub curr_time: Option<DateTime<Utc>>,
    pub est_arr: Option<DateTime<Utc>>,
    /// Official estimated arrival, filled for every row including the
    /// final projected observation of the pair
    pub off_earr: Option<DateTime<Utc>>,
    pub sched_arr: Option<DateTime<Utc>>,
    pub sched_dep: Option<DateTime<Utc>>,
    /// `sched_arr - off_earr` in seconds
    pub off_arrdif_s: Option<i64>,
    /// Percent change of `off_arrdif_s` against the previous row of the group
    pub perc_chge: Option<f64>,
    pub perf_rate: Option<PerfRate>,
}

// ============================================================================
// Aggregate Types
// ============================================================================

/// Level 1: per (route, trip, stop_sequence, stop_id, sched_arr).
#[derive(Debug, Clone, Serialize)]
pub struct TripStopAggregate {
    pub route_id: String,
    pub direction: Direction,
    pub trip_id: String,
    pub stop_sequence: u32,
    pub stop_id: String,
    pub sched_arr: DateTime<Utc>,
    /// Last projected arrival before the trip moved on
    pub off_earr: Option<DateTime<Utc>>,
    /// Last projected on-time classification
    pub lprfrte: PerfRate,
    /// Hour of the scheduled arrival, in schedule-local clock time
    pub ref_hr: u32,
    pub avg_spd: f64,
    pub avg_arrdif: f64,
    /// Last contributing pair index; gaps are informational
    pub idx: u32,
    pub total_obs: u32,
    pub late: u32,
    pub on_time: u32,
    pub early: u32,
    pub satis: u32,
    pub unsatis: u32,
    pub prc_obs_sat: f64,
    pub prc_obs_uns: f64,
    /// Projected speeds in row order
    pub spd_list: Vec<f64>,
    /// Arrival differences in row order
    pub arrdif_list: Vec<i64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
}

/// Level 2: per (route, stop, hour).
#[derive(Debug, Clone, Serialize)]
pub struct HourlyAggregate {
    pub route_id: String,
    pub direction: Direction,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub ref_hr: u32,
    /// Distinct trips observed in the hour
    pub cnt_trip_ids: u32,
    /// Sum of per-trip observation counts
    pub all_obs: u32,
    pub avg_spd: f64,
    pub spd_w: f64,
    pub avg_arrdif: f64,
    pub arrd_w: f64,
    pub prc_obs_sat: f64,
    pub prc_obs_uns: f64,
    pub prcw_sat: f64,
    pub prcw_uns: f64,
    /// Percent of trips whose final classification was On-Time
    pub act_sat_p: f64,
    pub act_uns_p: f64,
    pub x: Option<f64>,
    pub y: Option<f64>,
}

/// Level 3: per (route, stop), over the whole day.
#[derive(Debug, Clone, Serialize)]
pub struct DailyAggregate {
    pub route_id: String,
    pub direction: Direction,
    pub stop_id: String,
    pub stop_sequence: u32,
    /// Number of distinct hours observed
    pub agglength: u32,
    /// Sorted hours observed
    pub list_refhr: Vec<u32>,
    pub cnt_trip_ids: u32,
    pub all_obs: u32,
    pub avg_spd: f64,
    pub spd_w: f64,
    pub avg_arrdif: f64,
    pub arrd_w: f64,
    pub prc_obs_sat: f64,
    pub prc_obs_uns: f64,
    pub prcw_sat: f64,
    pub prcw_uns: f64,
    pub act_sat_p: f64,
    pub act_uns_p: f64,
    pub x: Option<f64>,
    pub y: Option<f64>,
}

// ============================================================================
// Reporting Types
// ============================================================================

/// Per-route processing report, collected into the run manifest.
#[derive(Debug, Clone, Serialize)]
pub struct RouteReport {
    pub route_id: String,
    pub direction: Direction,
    pub input_fixes: usize,
    pub geolocated: usize,
    /// Rows surviving QA/QC
    pub retained: usize,
    /// retained / geolocated
    pub retention: f64,
    pub enriched: usize,
    pub interpolated_rows: usize,
    pub refined_rows: usize,
    pub dropped_refine: usize,
    pub anomalies: usize,
    pub errors: Vec<String>,
    pub failed: bool,
}

impl RouteReport {
    pub fn new(key: &RouteKey) -> Self {
        Self {
            route_id: key.route_id.clone(),
            direction: key.direction,
            input_fixes: 0,
            geolocated: 0,
            retained: 0,
            retention: 0.0,
            enriched: 0,
            interpolated_rows: 0,
            refined_rows: 0,
            dropped_refine: 0,
            anomalies: 0,
            errors: Vec::new(),
            failed: false,
        }
    }
}

/// Whole-job manifest written alongside the aggregate tables.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub gtfs_date: String,
    pub raw_date: String,
    pub total_fixes: usize,
    /// Fixes whose trip_id had no catalog entry
    pub unmatched_fixes: usize,
    pub routes: Vec<RouteReport>,
    pub failed_routes: usize,
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunable thresholds and resources for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Spatial reference of the catalog geometry.
    /// Default: 4326 (WGS84 lon/lat)
    pub wkid: i32,

    /// Fixes farther than this from their route polyline are
    /// non-geolocatable and dropped. Default: 200.0 meters
    pub max_snap_distance_m: f64,

    /// Perpendicular tolerance for point-in-segment containment, in
    /// source units. Default: 1e-7 degrees
    pub containment_tol: f64,

    /// A pair with no segment progress counts as stationary only when it
    /// moved at most this far. Default: 20.0 meters
    pub stationary_threshold_m: f64,

    /// Interpolated rows faster than this are dropped as illogical.
    /// Default: 120.0 km/h
    pub max_speed_kmh: f64,

    /// Interpolated rows with a larger absolute arrival difference are
    /// dropped. Default: 1200 seconds (20 minutes)
    pub max_arrdif_s: i64,

    /// Arrival difference at or below this classifies as Late.
    /// Default: -120 seconds
    pub late_threshold_s: i64,

    /// Arrival difference at or above this classifies as Early.
    /// Default: 300 seconds
    pub early_threshold_s: i64,

    /// Offset of the schedule's local clock from UTC, in seconds.
    /// Fix timestamps without an explicit offset are interpreted in this
    /// clock as well. Default: 0
    pub schedule_utc_offset_s: i32,

    /// Worker threads for the per-route fan-out. `None` uses all cores.
    pub workers: Option<usize>,

    /// Global deadline for the fan-out, in seconds. Routes whose task
    /// has not started when it passes are failed instead of run.
    /// Default: `None` (unlimited)
    pub global_timeout_s: Option<u64>,

    /// Also export the per-route intermediate tables (snapped, cleaned,
    /// enriched, interpolated). Default: false
    pub write_intermediates: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            wkid: 4326,
            max_snap_distance_m: 200.0,
            containment_tol: 1e-7,
            stationary_threshold_m: 20.0,
            max_speed_kmh: 120.0,
            max_arrdif_s: 1200,
            late_threshold_s: -120,
            early_threshold_s: 300,
            schedule_utc_offset_s: 0,
            workers: None,
            global_timeout_s: None,
            write_intermediates: false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
