//! Polygon boolean operations and offsetting.
//!
//! This module provides the polygon operations the influence-area pipeline
//! needs - union, intersection, difference, Minkowski offset with round
//! joins, simplification and convex hulls - implemented on top of the
//! `geo` / `geo-clipper` crates.
//!
//! All public functions take and return scaled integer geometry
//! ([`crate::geometry`]); conversion to the floating-point domain of `geo`
//! happens internally. Offset deltas are scaled `Coord` values (positive =
//! grow, negative = shrink).

use crate::geometry::{ExPolygon, ExPolygons, Point, Polygon};
use crate::{scale, unscale, Coord, CoordF};
use geo::{Coord as GeoCoord, ConvexHull, LineString, MultiPoint, MultiPolygon, Polygon as GeoPolygon};
use geo_clipper::{Clipper, EndType, JoinType};

/// Coordinate blow-up factor handed to the clipper backend. Together with
/// the mm-domain conversion this keeps boolean precision at 1 micron.
const CLIPPER_FACTOR: CoordF = 1000.0;

/// Join type for offset corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetJoinType {
    /// Square corners.
    Square,
    /// Round corners.
    #[default]
    Round,
    /// Mitered corners.
    Miter,
}

impl From<OffsetJoinType> for JoinType {
    fn from(jt: OffsetJoinType) -> Self {
        match jt {
            OffsetJoinType::Square => JoinType::Square,
            OffsetJoinType::Round => JoinType::Round(0.25),
            OffsetJoinType::Miter => JoinType::Miter(2.0),
        }
    }
}

// ============================================================================
// Conversions between scaled integer geometry and geo's f64 domain
// ============================================================================

fn ring_to_geo(points: &[Point]) -> LineString<f64> {
    let mut ring: Vec<GeoCoord<f64>> = points
        .iter()
        .map(|p| GeoCoord {
            x: unscale(p.x),
            y: unscale(p.y),
        })
        .collect();
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
        if first != last {
            ring.push(first);
        }
    }
    LineString::new(ring)
}

fn expolygon_to_geo(expoly: &ExPolygon) -> GeoPolygon<f64> {
    GeoPolygon::new(
        ring_to_geo(expoly.contour.points()),
        expoly.holes.iter().map(|h| ring_to_geo(h.points())).collect(),
    )
}

fn expolygons_to_geo(expolys: &[ExPolygon]) -> MultiPolygon<f64> {
    MultiPolygon::new(expolys.iter().map(expolygon_to_geo).collect())
}

fn geo_ring_to_polygon(ring: &LineString<f64>) -> Polygon {
    let mut points: Vec<Point> = ring
        .coords()
        .map(|c| Point::new(scale(c.x), scale(c.y)))
        .collect();
    // Our Polygon does not store the closing point.
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    Polygon::from_points(points)
}

fn geo_to_expolygon(geo_poly: &GeoPolygon<f64>) -> ExPolygon {
    ExPolygon::with_holes(
        geo_ring_to_polygon(geo_poly.exterior()),
        geo_poly.interiors().iter().map(geo_ring_to_polygon).collect(),
    )
}

fn geo_multi_to_expolygons(multi: &MultiPolygon<f64>) -> ExPolygons {
    multi
        .0
        .iter()
        .map(geo_to_expolygon)
        .filter(|ex| ex.contour.len() >= 3)
        .collect()
}

// ============================================================================
// Boolean operations
// ============================================================================

/// Union of two regions.
pub fn union(subject: &[ExPolygon], clip: &[ExPolygon]) -> ExPolygons {
    if subject.is_empty() && clip.is_empty() {
        return vec![];
    }

    let result = expolygons_to_geo(subject).union(&expolygons_to_geo(clip), CLIPPER_FACTOR);
    geo_multi_to_expolygons(&result)
}

/// Union of a single region with itself, merging overlapping components.
pub fn union_all(polygons: &[ExPolygon]) -> ExPolygons {
    union(polygons, &[])
}

/// Intersection of two regions.
pub fn intersection(subject: &[ExPolygon], clip: &[ExPolygon]) -> ExPolygons {
    if subject.is_empty() || clip.is_empty() {
        return vec![];
    }

    let result = expolygons_to_geo(subject).intersection(&expolygons_to_geo(clip), CLIPPER_FACTOR);
    geo_multi_to_expolygons(&result)
}

/// Difference of two regions (subject minus clip).
pub fn difference(subject: &[ExPolygon], clip: &[ExPolygon]) -> ExPolygons {
    if subject.is_empty() {
        return vec![];
    }
    if clip.is_empty() {
        return subject.to_vec();
    }

    let result = expolygons_to_geo(subject).difference(&expolygons_to_geo(clip), CLIPPER_FACTOR);
    geo_multi_to_expolygons(&result)
}

// ============================================================================
// Offsetting
// ============================================================================

/// Offset a region by `delta` scaled units. Positive grows, negative
/// shrinks; components may split or vanish when shrinking.
pub fn offset(expolygons: &[ExPolygon], delta: Coord, join_type: OffsetJoinType) -> ExPolygons {
    if expolygons.is_empty() {
        return vec![];
    }
    if delta == 0 {
        return expolygons.to_vec();
    }

    let result = expolygons_to_geo(expolygons).offset(
        unscale(delta),
        join_type.into(),
        EndType::ClosedPolygon,
        CLIPPER_FACTOR,
    );
    geo_multi_to_expolygons(&result)
}

/// Offset bare contours by `delta` scaled units, treating each as a
/// hole-free region.
pub fn offset_polygons(polygons: &[Polygon], delta: Coord, join_type: OffsetJoinType) -> ExPolygons {
    let expolys: ExPolygons = polygons.iter().cloned().map(ExPolygon::new).collect();
    offset(&expolys, delta, join_type)
}

// ============================================================================
// Queries and cleanup
// ============================================================================

/// Check whether two regions overlap anywhere.
pub fn overlaps(a: &[ExPolygon], b: &[ExPolygon]) -> bool {
    !intersection(a, b).is_empty()
}

/// Total area of a region in scaled units squared.
pub fn total_area(expolygons: &[ExPolygon]) -> CoordF {
    expolygons.iter().map(|ex| ex.area()).sum()
}

/// Simplify all components to `tolerance` deviation, dropping components
/// whose area degenerates below `tolerance`².
pub fn simplify(expolygons: &[ExPolygon], tolerance: Coord) -> ExPolygons {
    expolygons
        .iter()
        .map(|ex| ex.simplified(tolerance))
        .filter(|ex| !ex.is_empty() && ex.area() > (tolerance as CoordF) * (tolerance as CoordF))
        .collect()
}

/// Drop components smaller than `min_area` (scaled units squared).
pub fn remove_small(expolygons: ExPolygons, min_area: CoordF) -> ExPolygons {
    expolygons
        .into_iter()
        .filter(|ex| ex.area() >= min_area)
        .collect()
}

/// Convex hull of a point set.
pub fn convex_hull(points: &[Point]) -> Polygon {
    if points.len() < 3 {
        return Polygon::from_points(points.to_vec());
    }

    let multi = MultiPoint::new(
        points
            .iter()
            .map(|p| geo::Point::new(unscale(p.x), unscale(p.y)))
            .collect(),
    );
    geo_ring_to_polygon(multi.convex_hull().exterior())
}

/// Fill all holes, keeping only outer contours.
pub fn fill_holes(expolygons: &[ExPolygon]) -> ExPolygons {
    let filled: ExPolygons = expolygons
        .iter()
        .map(|ex| ExPolygon::new(ex.contour.clone()))
        .collect();
    union_all(&filled)
}
