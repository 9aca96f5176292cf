//! Route catalog: per-route geometry and schedule, loaded once per job
//! and shared immutably across workers.
//!
//! A catalog holds the undissolved segments (one two-point piece per
//! inter-stop span, carrying stop attributes), the dissolved polyline
//! (the same geometry merged for projection), and the schedule rows for
//! every trip of the route. The staged artifacts are produced by the
//! external catalog generator; this module only consumes them.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use geo::Coord;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{OtpError, Result};
use crate::geometry::SpatialRef;

/// Travel direction of a route variant, from GTFS `direction_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn from_gtfs(direction_id: u8) -> Self {
        if direction_id == 1 {
            Direction::Inbound
        } else {
            Direction::Outbound
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "Outbound",
            Direction::Inbound => "Inbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of catalog lookup and of parallelism.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RouteKey {
    pub route_id: String,
    pub direction: Direction,
}

impl RouteKey {
    pub fn new(route_id: impl Into<String>, direction: Direction) -> Self {
        Self {
            route_id: route_id.into(),
            direction,
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.route_id, self.direction)
    }
}

/// One undissolved two-point piece of the route polyline.
///
/// `stop_sequence` is the stop the vehicle is en route to while on this
/// piece; the chain of segments sharing a `stop_sequence` ends at that
/// stop.
#[derive(Debug, Clone)]
pub struct Segment {
    pub seg_index: u32,
    pub objectid: u32,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub start: Coord,
    pub end: Coord,
}

/// Scheduled times at one stop of one trip, in seconds since the
/// service-day midnight. GTFS clock strings may run past 24:00:00 for
/// trips crossing midnight.
#[derive(Debug, Clone)]
pub struct StopSchedule {
    pub stop_id: String,
    pub arrival_s: u32,
    pub departure_s: u32,
}

/// Converts schedule clock seconds and naive local timestamps into the
/// single UTC basis all interpolation arithmetic uses.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleClock {
    pub service_date: NaiveDate,
    pub offset_s: i32,
}

impl ScheduleClock {
    pub fn new(service_date: NaiveDate, offset_s: i32) -> Self {
        Self {
            service_date,
            offset_s,
        }
    }

    /// Materialize a clock time of the service day as a UTC instant.
    /// Hours >= 24 roll into the next day.
    pub fn to_utc(&self, clock_s: u32) -> DateTime<Utc> {
        let midnight = self
            .service_date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid");
        let naive =
            midnight + Duration::seconds(clock_s as i64) - Duration::seconds(self.offset_s as i64);
        DateTime::from_naive_utc_and_offset(naive, Utc)
    }

    /// Interpret a naive local timestamp (no offset in the input) as UTC.
    pub fn naive_local_to_utc(&self, naive: chrono::NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(naive - Duration::seconds(self.offset_s as i64), Utc)
    }

    /// Local clock hour of a UTC instant.
    pub fn local_hour(&self, t: DateTime<Utc>) -> u32 {
        (t + Duration::seconds(self.offset_s as i64)).hour()
    }
}

/// Parse a GTFS `HH:MM:SS` clock string; hours may exceed 23.
pub fn parse_clock_time(s: &str) -> Result<u32> {
    let mut parts = s.trim().splitn(3, ':');
    let field = |p: Option<&str>| -> Result<u32> {
        p.and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| OtpError::Parse {
                message: format!("invalid clock time '{}'", s),
            })
    };
    let h = field(parts.next())?;
    let m = field(parts.next())?;
    let sec = field(parts.next())?;
    if m > 59 || sec > 59 {
        return Err(OtpError::Parse {
            message: format!("invalid clock time '{}'", s),
        });
    }
    Ok(h * 3600 + m * 60 + sec)
}

/// Immutable per-route geometry and schedule.
#[derive(Debug, Clone)]
pub struct RouteCatalog {
    pub key: RouteKey,
    pub wkid: i32,
    /// Undissolved segments, sorted by `seg_index`
    pub segments: Vec<Segment>,
    /// Dissolved polyline vertices in traversal order
    pub dissolved: Vec<Coord>,
    /// Schedule lookup keyed by (trip_id, stop_sequence)
    pub stop_times: HashMap<(String, u32), StopSchedule>,
    /// Maximum stop_sequence claimed by the stop list
    pub stops_max_sequence: u32,
    /// Effective maximum stop_sequence, lowered to the polyline's when
    /// the stop list claims more than the geometry reaches
    pub max_stop_sequence: u32,
    pub max_seg_index: u32,
    /// False when the stop list's terminus was not reachable on the
    /// undissolved polyline
    pub max_stop_seq_validated: bool,
}

impl RouteCatalog {
    /// Assemble and validate a catalog from its parts.
    pub fn new(
        key: RouteKey,
        wkid: i32,
        segments: Vec<Segment>,
        dissolved: Vec<Coord>,
        stop_times: HashMap<(String, u32), StopSchedule>,
        stops_max_sequence: u32,
    ) -> Result<Self> {
        if segments.is_empty() {
            return Err(OtpError::CatalogInvalid {
                route: key.to_string(),
                message: "no undissolved segments".to_string(),
            });
        }
        for w in segments.windows(2) {
            if w[1].seg_index <= w[0].seg_index {
                return Err(OtpError::CatalogInvalid {
                    route: key.to_string(),
                    message: format!(
                        "seg_index not strictly increasing at {} -> {}",
                        w[0].seg_index, w[1].seg_index
                    ),
                });
            }
            if w[1].stop_sequence < w[0].stop_sequence {
                return Err(OtpError::CatalogInvalid {
                    route: key.to_string(),
                    message: format!(
                        "stop_sequence decreases at seg_index {}",
                        w[1].seg_index
                    ),
                });
            }
        }
        if dissolved.len() < 2 {
            return Err(OtpError::CatalogInvalid {
                route: key.to_string(),
                message: "dissolved polyline is empty".to_string(),
            });
        }

        let polyline_max = segments.iter().map(|s| s.stop_sequence).max().unwrap_or(0);
        let max_seg_index = segments.iter().map(|s| s.seg_index).max().unwrap_or(0);

        // The stop list occasionally claims a terminus the geometry never
        // reaches; lower the effective max and flag the mismatch.
        let (max_stop_sequence, validated) = if stops_max_sequence > polyline_max {
            warn!(
                "{}: stop list max {} exceeds polyline max {}, using polyline max",
                key, stops_max_sequence, polyline_max
            );
            (polyline_max, false)
        } else {
            (stops_max_sequence.max(polyline_max), true)
        };

        let missing: Vec<u32> = (1..=max_stop_sequence)
            .filter(|seq| {
                segments
                    .binary_search_by(|s| s.stop_sequence.cmp(seq))
                    .is_err()
            })
            .collect();
        if !missing.is_empty() {
            warn!(
                "{}: {} stop sequences have no segment chain (first: {})",
                key,
                missing.len(),
                missing[0]
            );
        }

        Ok(Self {
            key,
            wkid,
            segments,
            dissolved,
            stop_times,
            stops_max_sequence,
            max_stop_sequence,
            max_seg_index,
            max_stop_seq_validated: validated,
        })
    }

    /// All segments whose chain leads to the given stop, in order.
    pub fn stop_chain(&self, stop_sequence: u32) -> &[Segment] {
        let lo = self
            .segments
            .partition_point(|s| s.stop_sequence < stop_sequence);
        let hi = self
            .segments
            .partition_point(|s| s.stop_sequence <= stop_sequence);
        &self.segments[lo..hi]
    }

    /// Look up a segment by its index.
    pub fn segment(&self, seg_index: u32) -> Option<&Segment> {
        self.segments
            .binary_search_by(|s| s.seg_index.cmp(&seg_index))
            .ok()
            .map(|i| &self.segments[i])
    }

    /// Metric length of a stop's whole chain.
    pub fn chain_length_m(&self, sref: SpatialRef, stop_sequence: u32) -> f64 {
        self.stop_chain(stop_sequence)
            .iter()
            .map(|s| sref.segment_length_m(s.start, s.end))
            .sum()
    }

    /// Metric distance from a point on a chain segment forward to the
    /// chain's end (the stop itself).
    pub fn chain_remaining_m(
        &self,
        sref: SpatialRef,
        stop_sequence: u32,
        seg_index: u32,
        from: Coord,
    ) -> f64 {
        let mut dist = 0.0;
        for seg in self.stop_chain(stop_sequence) {
            if seg.seg_index == seg_index {
                dist += sref.distance_m(from, seg.end);
            } else if seg.seg_index > seg_index {
                dist += sref.segment_length_m(seg.start, seg.end);
            }
        }
        dist
    }

    /// Metric distance from the chain's start backward boundary up to a
    /// point on one of its segments (what the vehicle has already
    /// covered past the previous stop).
    pub fn chain_covered_m(
        &self,
        sref: SpatialRef,
        stop_sequence: u32,
        seg_index: u32,
        to: Coord,
    ) -> f64 {
        let mut dist = 0.0;
        for seg in self.stop_chain(stop_sequence) {
            if seg.seg_index < seg_index {
                dist += sref.segment_length_m(seg.start, seg.end);
            } else if seg.seg_index == seg_index {
                dist += sref.distance_m(seg.start, to);
            }
        }
        dist
    }

    /// Metric length of the chain segments strictly between two segment
    /// indices of the same stop chain.
    pub fn chain_between_m(
        &self,
        sref: SpatialRef,
        stop_sequence: u32,
        after_seg: u32,
        before_seg: u32,
    ) -> f64 {
        self.stop_chain(stop_sequence)
            .iter()
            .filter(|s| s.seg_index > after_seg && s.seg_index < before_seg)
            .map(|s| sref.segment_length_m(s.start, s.end))
            .sum()
    }

    /// The physical stop location: the end of the stop's chain.
    pub fn chain_end(&self, stop_sequence: u32) -> Option<Coord> {
        self.stop_chain(stop_sequence).last().map(|s| s.end)
    }

    /// The stop_id served by a chain.
    pub fn chain_stop_id(&self, stop_sequence: u32) -> Option<&str> {
        self.stop_chain(stop_sequence)
            .first()
            .map(|s| s.stop_id.as_str())
    }

    /// Scheduled times for a trip at a stop sequence.
    pub fn schedule(&self, trip_id: &str, stop_sequence: u32) -> Option<&StopSchedule> {
        self.stop_times
            .get(&(trip_id.to_string(), stop_sequence))
    }
}

// ============================================================================
// Loading
// ============================================================================

#[derive(Debug, Deserialize)]
struct TripRecord {
    route_id: String,
    trip_id: String,
    #[serde(default)]
    direction_id: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct StopTimeRecord {
    trip_id: String,
    arrival_time: String,
    departure_time: String,
    stop_id: String,
    stop_sequence: u32,
}

#[derive(Debug, Deserialize)]
struct UndissolvedRecord {
    seg_index: u32,
    objectid: u32,
    stop_id: String,
    stop_sequence: u32,
    x_start: f64,
    y_start: f64,
    x_end: f64,
    y_end: f64,
    wkid: i32,
}

#[derive(Debug, Deserialize)]
struct DissolvedRecord {
    vertex_index: u32,
    x: f64,
    y: f64,
    wkid: i32,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct StopRecord {
    stop_id: String,
    stop_sequence: u32,
    x: f64,
    y: f64,
    wkid: i32,
}

/// The loaded catalogs for one job, plus the trip index used to slice
/// the day's fixes by route.
pub struct CatalogSet {
    pub trip_index: HashMap<String, RouteKey>,
    pub routes: HashMap<RouteKey, Arc<RouteCatalog>>,
    /// Routes whose artifacts were missing or inconsistent; they are
    /// reported as failed and excluded from aggregation
    pub load_errors: Vec<(RouteKey, OtpError)>,
}

fn open_reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    if !path.exists() {
        return Err(OtpError::InputMissing {
            path: path.display().to_string(),
        });
    }
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| OtpError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

/// Read `trips.txt` into a `trip_id -> RouteKey` index.
pub fn load_trip_index(gtfs_dir: &Path) -> Result<HashMap<String, RouteKey>> {
    let path = gtfs_dir.join("trips.txt");
    let mut reader = open_reader(&path)?;
    let mut index = HashMap::new();
    for record in reader.deserialize::<TripRecord>() {
        let record = record.map_err(|e| OtpError::Parse {
            message: format!("trips.txt: {}", e),
        })?;
        let direction = Direction::from_gtfs(record.direction_id.unwrap_or(0));
        index.insert(record.trip_id, RouteKey::new(record.route_id, direction));
    }
    Ok(index)
}

/// Read `stop_times.txt` and bucket schedule rows per route.
fn load_stop_times(
    gtfs_dir: &Path,
    trip_index: &HashMap<String, RouteKey>,
    needed: &BTreeSet<RouteKey>,
) -> Result<HashMap<RouteKey, HashMap<(String, u32), StopSchedule>>> {
    let path = gtfs_dir.join("stop_times.txt");
    let mut reader = open_reader(&path)?;
    let mut per_route: HashMap<RouteKey, HashMap<(String, u32), StopSchedule>> = HashMap::new();
    for record in reader.deserialize::<StopTimeRecord>() {
        let record = record.map_err(|e| OtpError::Parse {
            message: format!("stop_times.txt: {}", e),
        })?;
        let Some(key) = trip_index.get(&record.trip_id) else {
            continue;
        };
        if !needed.contains(key) {
            continue;
        }
        let arrival_s = parse_clock_time(&record.arrival_time)?;
        let departure_s = parse_clock_time(&record.departure_time)?;
        per_route.entry(key.clone()).or_default().insert(
            (record.trip_id.clone(), record.stop_sequence),
            StopSchedule {
                stop_id: record.stop_id,
                arrival_s,
                departure_s,
            },
        );
    }
    Ok(per_route)
}

fn staged_paths(staging_dir: &Path, key: &RouteKey) -> (PathBuf, PathBuf, PathBuf) {
    let stem = format!("{}_{}", key.route_id, key.direction);
    (
        staging_dir.join("Route").join(format!("{}_undissolved.csv", stem)),
        staging_dir.join("Route").join(format!("{}_dissolved.csv", stem)),
        staging_dir.join("Stops").join(format!("{}.csv", stem)),
    )
}

fn load_one_route(
    staging_dir: &Path,
    key: &RouteKey,
    stop_times: HashMap<(String, u32), StopSchedule>,
    wkid: i32,
) -> Result<RouteCatalog> {
    let (undissolved_path, dissolved_path, stops_path) = staged_paths(staging_dir, key);

    let catalog_invalid = |message: String| OtpError::CatalogInvalid {
        route: key.to_string(),
        message,
    };

    let mut segments = Vec::new();
    let mut reader = open_reader(&undissolved_path)
        .map_err(|e| catalog_invalid(e.to_string()))?;
    for record in reader.deserialize::<UndissolvedRecord>() {
        let record = record.map_err(|e| catalog_invalid(format!("undissolved: {}", e)))?;
        if record.wkid != wkid {
            return Err(catalog_invalid(format!(
                "mixed WKID: expected {}, found {}",
                wkid, record.wkid
            )));
        }
        segments.push(Segment {
            seg_index: record.seg_index,
            objectid: record.objectid,
            stop_id: record.stop_id,
            stop_sequence: record.stop_sequence,
            start: Coord {
                x: record.x_start,
                y: record.y_start,
            },
            end: Coord {
                x: record.x_end,
                y: record.y_end,
            },
        });
    }
    segments.sort_by_key(|s| s.seg_index);

    let mut dissolved = Vec::new();
    let mut reader = open_reader(&dissolved_path)
        .map_err(|e| catalog_invalid(e.to_string()))?;
    let mut vertices: Vec<DissolvedRecord> = Vec::new();
    for record in reader.deserialize::<DissolvedRecord>() {
        let record = record.map_err(|e| catalog_invalid(format!("dissolved: {}", e)))?;
        if record.wkid != wkid {
            return Err(catalog_invalid(format!(
                "mixed WKID: expected {}, found {}",
                wkid, record.wkid
            )));
        }
        vertices.push(record);
    }
    vertices.sort_by_key(|v| v.vertex_index);
    dissolved.extend(vertices.iter().map(|v| Coord { x: v.x, y: v.y }));

    let mut stops_max = 0u32;
    let mut reader = open_reader(&stops_path).map_err(|e| catalog_invalid(e.to_string()))?;
    for record in reader.deserialize::<StopRecord>() {
        let record = record.map_err(|e| catalog_invalid(format!("stops: {}", e)))?;
        if record.wkid != wkid {
            return Err(catalog_invalid(format!(
                "mixed WKID: expected {}, found {}",
                wkid, record.wkid
            )));
        }
        stops_max = stops_max.max(record.stop_sequence);
    }

    RouteCatalog::new(key.clone(), wkid, segments, dissolved, stop_times, stops_max)
}

/// Load catalogs for every route referenced by the day's fixes.
///
/// Global inputs (`trips.txt`, `stop_times.txt`, the staging directory)
/// must exist or the whole job aborts; per-route artifact problems are
/// recorded in `load_errors` and only fail that route.
pub fn load_catalogs(
    main_folder: &Path,
    gtfs_date: &str,
    needed: &BTreeSet<RouteKey>,
    trip_index: HashMap<String, RouteKey>,
    wkid: i32,
) -> Result<CatalogSet> {
    let gtfs_dir = main_folder.join("0_external").join("GTFS").join(gtfs_date);
    let staging_dir = main_folder.join("2_staging").join(gtfs_date);
    if !staging_dir.exists() {
        return Err(OtpError::InputMissing {
            path: staging_dir.display().to_string(),
        });
    }

    let mut per_route_times = load_stop_times(&gtfs_dir, &trip_index, needed)?;

    let mut routes = HashMap::new();
    let mut load_errors = Vec::new();
    for key in needed {
        let stop_times = per_route_times.remove(key).unwrap_or_default();
        match load_one_route(&staging_dir, key, stop_times, wkid) {
            Ok(catalog) => {
                routes.insert(key.clone(), Arc::new(catalog));
            }
            Err(e) => load_errors.push((key.clone(), e)),
        }
    }

    Ok(CatalogSet {
        trip_index,
        routes,
        load_errors,
    })
}
