//! Geometry primitives for route polylines and snapped points.
//!
//! All projection work happens in the source coordinate space (the
//! catalog's WKID): the closest point on a polyline is found by
//! minimizing Euclidean distance in source units. Metric lengths are
//! computed afterwards, great-circle for geographic data and planar for
//! projected data, selected by [`SpatialRef`].

use geo::Coord;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance between two lon/lat coordinates, in meters.
pub fn haversine_distance(a: Coord, b: Coord) -> f64 {
    let lat1 = a.y.to_radians();
    let lat2 = b.y.to_radians();
    let dlat = (b.y - a.y).to_radians();
    let dlon = (b.x - a.x).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Spatial reference of the catalog geometry.
///
/// WKID 4326 is lon/lat degrees and measures with the haversine
/// formula; any other WKID is assumed to be a projected system whose
/// units are already meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialRef {
    pub wkid: i32,
}

impl SpatialRef {
    pub fn new(wkid: i32) -> Self {
        Self { wkid }
    }

    pub fn is_geographic(&self) -> bool {
        self.wkid == 4326
    }

    /// Metric distance between two coordinates.
    pub fn distance_m(&self, a: Coord, b: Coord) -> f64 {
        if self.is_geographic() {
            haversine_distance(a, b)
        } else {
            ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt()
        }
    }

    /// Metric length of a two-point segment.
    pub fn segment_length_m(&self, start: Coord, end: Coord) -> f64 {
        self.distance_m(start, end)
    }

    /// Metric length of an entire path.
    pub fn path_length_m(&self, path: &[Coord]) -> f64 {
        path.windows(2)
            .map(|w| self.distance_m(w[0], w[1]))
            .sum()
    }

    /// Metric length of the polyline between two piece indices, inclusive.
    pub fn polyline_length_between(&self, polyline: &[Coord], piece_a: usize, piece_b: usize) -> f64 {
        let (lo, hi) = if piece_a <= piece_b {
            (piece_a, piece_b)
        } else {
            (piece_b, piece_a)
        };
        polyline
            .windows(2)
            .enumerate()
            .filter(|(i, _)| *i >= lo && *i <= hi)
            .map(|(_, w)| self.distance_m(w[0], w[1]))
            .sum()
    }
}

/// Result of projecting a point onto a polyline.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    /// The closest point on the polyline, in source coordinates
    pub point: Coord,
    /// Index of the two-point piece containing the projection
    pub piece_index: usize,
    /// Arc length from the polyline start to the projection, in source units
    pub arc_length: f64,
    /// Straight-line separation between the query point and the projection,
    /// in source units
    pub separation: f64,
}

/// Project a point onto a two-point segment.
///
/// Returns the clamped closest point and the parameter `t` in `[0, 1]`
/// along the segment.
pub fn project_point_to_segment(p: Coord, a: Coord, b: Coord) -> (Coord, f64) {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len2 = dx * dx + dy * dy;
    if len2 == 0.0 {
        return (a, 0.0);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    (
        Coord {
            x: a.x + t * dx,
            y: a.y + t * dy,
        },
        t,
    )
}

/// Squared Euclidean distance from a point to a two-point segment, in
/// source units. Used by the R-tree nearest-neighbour queries.
pub fn segment_distance_2(p: Coord, a: Coord, b: Coord) -> f64 {
    let (proj, _) = project_point_to_segment(p, a, b);
    (p.x - proj.x).powi(2) + (p.y - proj.y).powi(2)
}

/// Project a point onto a polyline, returning the globally closest
/// projection. Returns `None` for polylines with fewer than two vertices.
pub fn project_point_to_polyline(p: Coord, polyline: &[Coord]) -> Option<Projection> {
    if polyline.len() < 2 {
        return None;
    }

    let mut best: Option<Projection> = None;
    let mut cum = 0.0;
    for (i, w) in polyline.windows(2).enumerate() {
        let (proj, t) = project_point_to_segment(p, w[0], w[1]);
        let sep = ((p.x - proj.x).powi(2) + (p.y - proj.y).powi(2)).sqrt();
        let piece_len = ((w[1].x - w[0].x).powi(2) + (w[1].y - w[0].y).powi(2)).sqrt();
        if best.map_or(true, |b| sep < b.separation) {
            best = Some(Projection {
                point: proj,
                piece_index: i,
                arc_length: cum + t * piece_len,
                separation: sep,
            });
        }
        cum += piece_len;
    }
    best
}

/// Check whether a point lies on a two-point segment, within a
/// perpendicular-distance tolerance in source units.
pub fn point_in_segment(p: Coord, start: Coord, end: Coord, tol: f64) -> bool {
    segment_distance_2(p, start, end) <= tol * tol
}
