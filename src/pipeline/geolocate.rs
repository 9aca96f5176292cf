//! Geolocation: snap each raw fix onto its route and resolve which
//! undissolved segment (and therefore which stop) it belongs to.
//!
//! The dissolved polyline is indexed piece-by-piece in an R-tree, so
//! the nearest-projection query is logarithmic instead of linear in the
//! number of segments. On self-overlapping loops several segments can
//! contain the same snap point; the tie is resolved by a trip-local
//! state machine whose only state is the last accepted `seg_index`.

use geo::Coord;
use log::debug;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::catalog::RouteCatalog;
use crate::geometry::{project_point_to_segment, segment_distance_2, SpatialRef};
use crate::{PipelineConfig, RawFix, SnappedFix};

/// One two-point piece of the route, indexed for spatial queries.
#[derive(Debug, Clone)]
struct SegPiece {
    seg_index: u32,
    objectid: u32,
    stop_sequence: u32,
    stop_id: String,
    start: Coord,
    end: Coord,
}

impl RTreeObject for SegPiece {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.start.x.min(self.end.x), self.start.y.min(self.end.y)],
            [self.start.x.max(self.end.x), self.start.y.max(self.end.y)],
        )
    }
}

impl PointDistance for SegPiece {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        segment_distance_2(
            Coord {
                x: point[0],
                y: point[1],
            },
            self.start,
            self.end,
        )
    }
}

/// Outcome of snapping one route's fixes.
#[derive(Debug, Default)]
pub struct GeoOutcome {
    pub snapped: Vec<SnappedFix>,
    /// Fixes farther than the snap bound from the polyline
    pub dropped_far: usize,
    /// Snap points not contained by any candidate segment
    pub dropped_unmatched: usize,
}

/// Per-route snap engine. Built once per route; reused for every fix.
pub struct Geolocator {
    sref: SpatialRef,
    tree: RTree<SegPiece>,
    max_snap_distance_m: f64,
    containment_tol: f64,
}

impl Geolocator {
    /// Build the spatial index over the route geometry. Fails with a
    /// geometric error when the polyline is empty.
    pub fn new(catalog: &RouteCatalog, config: &PipelineConfig) -> crate::Result<Self> {
        if catalog.segments.is_empty() || catalog.dissolved.len() < 2 {
            return Err(crate::OtpError::Geometric {
                message: format!("{}: dissolved polyline is empty", catalog.key),
            });
        }
        let pieces: Vec<SegPiece> = catalog
            .segments
            .iter()
            .map(|s| SegPiece {
                seg_index: s.seg_index,
                objectid: s.objectid,
                stop_sequence: s.stop_sequence,
                stop_id: s.stop_id.clone(),
                start: s.start,
                end: s.end,
            })
            .collect();
        Ok(Self {
            sref: SpatialRef::new(config.wkid),
            tree: RTree::bulk_load(pieces),
            max_snap_distance_m: config.max_snap_distance_m,
            containment_tol: config.containment_tol,
        })
    }

    /// Snap all fixes of one route. The input must be sorted by
    /// `(trip_id, timestamp)`; the trip-local monotonic resolution
    /// depends on it.
    pub fn run(&self, fixes: &[RawFix]) -> GeoOutcome {
        let mut outcome = GeoOutcome::default();
        let mut barcode = 0u64;
        let mut current_trip: Option<&str> = None;
        let mut last_seg: Option<u32> = None;

        for fix in fixes {
            if current_trip != Some(fix.trip_id.as_str()) {
                current_trip = Some(fix.trip_id.as_str());
                last_seg = None;
            }

            let p = Coord {
                x: fix.lon,
                y: fix.lat,
            };
            let Some(nearest) = self.tree.nearest_neighbor(&[p.x, p.y]) else {
                continue;
            };
            let (snap, _) = project_point_to_segment(p, nearest.start, nearest.end);

            if self.sref.distance_m(p, snap) > self.max_snap_distance_m {
                debug!(
                    "trip {}: fix at ({:.6}, {:.6}) beyond snap bound",
                    fix.trip_id, fix.lon, fix.lat
                );
                outcome.dropped_far += 1;
                continue;
            }

            barcode += 1;

            // Every segment containing the snap point is a candidate; on a
            // loop the same point can sit on both the outbound and inbound
            // side of the overlap.
            let tol2 = self.containment_tol * self.containment_tol;
            let mut candidates: Vec<&SegPiece> = self
                .tree
                .locate_within_distance([snap.x, snap.y], tol2)
                .collect();
            if candidates.is_empty() {
                candidates.push(nearest);
            }
            candidates.sort_by_key(|c| c.seg_index);

            let chosen = match last_seg {
                // Keep the trip's seg_index monotonically non-decreasing;
                // fall back to the highest candidate when nothing ahead
                // contains the point (QA/QC removes the back-step).
                Some(last) => candidates
                    .iter()
                    .find(|c| c.seg_index >= last)
                    .or_else(|| candidates.last())
                    .copied(),
                None => candidates.first().copied(),
            };
            let Some(piece) = chosen else {
                outcome.dropped_unmatched += 1;
                continue;
            };

            last_seg = Some(piece.seg_index);
            outcome.snapped.push(SnappedFix {
                trip_id: fix.trip_id.clone(),
                timestamp: fix.timestamp,
                barcode,
                seg_index: piece.seg_index,
                objectid: piece.objectid,
                stop_id: piece.stop_id.clone(),
                stop_sequence: piece.stop_sequence,
                x: snap.x,
                y: snap.y,
            });
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Direction, RouteCatalog, RouteKey, Segment};
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    fn seg(seg_index: u32, stop_sequence: u32, start: Coord, end: Coord) -> Segment {
        Segment {
            seg_index,
            objectid: seg_index + 1,
            stop_id: format!("S{}", stop_sequence),
            stop_sequence,
            start,
            end,
        }
    }

    fn straight_catalog() -> RouteCatalog {
        let step = 0.001; // ~70 m of longitude at this latitude
        let mut segments = Vec::new();
        for i in 0..6u32 {
            let x0 = -114.100 + f64::from(i) * step;
            segments.push(seg(
                i,
                i / 2 + 1,
                c(x0, 51.0525),
                c(x0 + step, 51.0525),
            ));
        }
        let mut dissolved = vec![segments[0].start];
        dissolved.extend(segments.iter().map(|s| s.end));
        RouteCatalog::new(
            RouteKey::new("10", Direction::Outbound),
            4326,
            segments,
            dissolved,
            HashMap::new(),
            3,
        )
        .unwrap()
    }

    /// A loop whose final segment retraces the first one's geometry.
    fn loop_catalog() -> RouteCatalog {
        let segments = vec![
            seg(0, 1, c(-114.100, 51.0525), c(-114.099, 51.0525)),
            seg(1, 2, c(-114.099, 51.0525), c(-114.099, 51.0535)),
            seg(2, 3, c(-114.099, 51.0535), c(-114.100, 51.0535)),
            seg(3, 4, c(-114.100, 51.0535), c(-114.100, 51.0525)),
            seg(4, 5, c(-114.100, 51.0525), c(-114.099, 51.0525)),
        ];
        let mut dissolved = vec![segments[0].start];
        dissolved.extend(segments.iter().map(|s| s.end));
        RouteCatalog::new(
            RouteKey::new("loop", Direction::Outbound),
            4326,
            segments,
            dissolved,
            HashMap::new(),
            5,
        )
        .unwrap()
    }

    fn fix(trip: &str, secs: i64, lon: f64, lat: f64) -> RawFix {
        RawFix {
            trip_id: trip.to_string(),
            timestamp: Utc.with_ymd_and_hms(2021, 11, 20, 15, 0, 0).unwrap()
                + chrono::Duration::seconds(secs),
            lon,
            lat,
            vehicle_id: None,
        }
    }

    #[test]
    fn test_snaps_to_nearest_segment() {
        let catalog = straight_catalog();
        let config = PipelineConfig::default();
        let geo = Geolocator::new(&catalog, &config).unwrap();
        // Slightly north of the middle of seg_index 2
        let outcome = geo.run(&[fix("t1", 0, -114.0975, 51.0527)]);
        assert_eq!(outcome.snapped.len(), 1);
        let s = &outcome.snapped[0];
        assert_eq!(s.seg_index, 2);
        assert_eq!(s.stop_sequence, 2);
        assert!((s.y - 51.0525).abs() < 1e-9);
        assert_eq!(s.barcode, 1);
    }

    #[test]
    fn test_far_fix_is_dropped() {
        let catalog = straight_catalog();
        let config = PipelineConfig::default();
        let geo = Geolocator::new(&catalog, &config).unwrap();
        // ~1.1 km north of the route
        let outcome = geo.run(&[fix("t1", 0, -114.0975, 51.0625)]);
        assert!(outcome.snapped.is_empty());
        assert_eq!(outcome.dropped_far, 1);
    }

    #[test]
    fn test_loop_overlap_resolved_by_progression() {
        let catalog = loop_catalog();
        let config = PipelineConfig::default();
        let geo = Geolocator::new(&catalog, &config).unwrap();

        // Outbound fix on the shared piece, then fixes around the loop,
        // then an inbound fix back on the shared piece.
        let outcome = geo.run(&[
            fix("t1", 0, -114.0995, 51.0525),
            fix("t1", 60, -114.0990, 51.0530),
            fix("t1", 120, -114.0995, 51.0535),
            fix("t1", 180, -114.1000, 51.0530),
            fix("t1", 240, -114.0995, 51.0525),
        ]);
        assert_eq!(outcome.snapped.len(), 5);
        // First fix takes the earliest seg_index on the overlap
        assert_eq!(outcome.snapped[0].seg_index, 0);
        assert_eq!(outcome.snapped[0].stop_sequence, 1);
        // The return to the shared piece resolves to the inbound segment
        assert_eq!(outcome.snapped[4].seg_index, 4);
        assert_eq!(outcome.snapped[4].stop_sequence, 5);
    }

    #[test]
    fn test_trip_state_resets_between_trips() {
        let catalog = loop_catalog();
        let config = PipelineConfig::default();
        let geo = Geolocator::new(&catalog, &config).unwrap();
        let outcome = geo.run(&[
            fix("t1", 0, -114.0995, 51.0525),
            fix("t1", 120, -114.0995, 51.0535),
            // New trip starts back on the overlap: lowest seg_index again
            fix("t2", 300, -114.0995, 51.0525),
        ]);
        assert_eq!(outcome.snapped[2].trip_id, "t2");
        assert_eq!(outcome.snapped[2].seg_index, 0);
    }

    #[test]
    fn test_barcode_counts_all_snapped_fixes() {
        let catalog = straight_catalog();
        let config = PipelineConfig::default();
        let geo = Geolocator::new(&catalog, &config).unwrap();
        let outcome = geo.run(&[
            fix("t1", 0, -114.0999, 51.0525),
            fix("t1", 30, -114.0989, 51.0525),
            fix("t1", 60, -114.0979, 51.0525),
        ]);
        let barcodes: Vec<u64> = outcome.snapped.iter().map(|s| s.barcode).collect();
        assert_eq!(barcodes, vec![1, 2, 3]);
    }
}
