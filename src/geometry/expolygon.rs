//! Polygons with holes.

use super::{Point, Polygon};
use crate::{Coord, CoordF};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A polygon with holes (exterior contour + interior hole contours).
///
/// The contour is the outer boundary (counter-clockwise); the holes are
/// interior boundaries (clockwise).
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExPolygon {
    /// The outer contour of the polygon.
    pub contour: Polygon,
    /// The holes (interior contours) of the polygon.
    pub holes: Vec<Polygon>,
}

/// A collection of `ExPolygon`s treated as a single multi-component region.
pub type ExPolygons = Vec<ExPolygon>;

impl ExPolygon {
    /// Create a new ExPolygon with only a contour and no holes.
    #[inline]
    pub fn new(contour: Polygon) -> Self {
        Self {
            contour,
            holes: Vec::new(),
        }
    }

    /// Create a new ExPolygon with a contour and holes.
    #[inline]
    pub fn with_holes(contour: Polygon, holes: Vec<Polygon>) -> Self {
        Self { contour, holes }
    }

    /// True when the contour has no vertices.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contour.is_empty()
    }

    /// Area of the region: contour area minus hole areas.
    pub fn area(&self) -> CoordF {
        let holes_area: CoordF = self.holes.iter().map(|h| h.area()).sum();
        self.contour.area() - holes_area
    }

    /// Check if a point is inside the region (inside the contour and not
    /// inside any hole).
    pub fn contains_point(&self, p: &Point) -> bool {
        if !self.contour.contains_point(p) {
            return false;
        }
        !self.holes.iter().any(|hole| hole.contains_point(p))
    }

    /// Translate contour and holes by `delta`.
    pub fn translate(&mut self, delta: Point) {
        self.contour.translate(delta);
        for hole in &mut self.holes {
            hole.translate(delta);
        }
    }

    /// Return a copy translated by `delta`.
    pub fn translated(&self, delta: Point) -> Self {
        let mut copy = self.clone();
        copy.translate(delta);
        copy
    }

    /// Simplify contour and holes to the given deviation tolerance,
    /// dropping holes that degenerate.
    pub fn simplified(&self, tolerance: Coord) -> ExPolygon {
        ExPolygon {
            contour: self.contour.simplified(tolerance),
            holes: self
                .holes
                .iter()
                .map(|h| h.simplified(tolerance))
                .filter(|h| h.len() >= 3)
                .collect(),
        }
    }
}

impl From<Polygon> for ExPolygon {
    fn from(contour: Polygon) -> Self {
        Self::new(contour)
    }
}

impl fmt::Debug for ExPolygon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExPolygon({} points, {} holes)",
            self.contour.len(),
            self.holes.len()
        )
    }
}

/// Total area of a multi-component region.
pub fn region_area(expolygons: &[ExPolygon]) -> CoordF {
    expolygons.iter().map(|ex| ex.area()).sum()
}

/// Check if a point is inside any component of a region.
pub fn region_contains_point(expolygons: &[ExPolygon], p: &Point) -> bool {
    expolygons.iter().any(|ex| ex.contains_point(p))
}

/// Return `p` if it lies inside the region, otherwise the closest point
/// on the region boundary. Returns `p` unchanged for empty regions.
pub fn region_move_inside(expolygons: &[ExPolygon], p: &Point) -> Point {
    if expolygons.is_empty() || region_contains_point(expolygons, p) {
        return *p;
    }

    let mut best = *p;
    let mut best_dist = i128::MAX;
    for ex in expolygons {
        let candidate = ex.contour.closest_boundary_point(p);
        let dist = candidate.distance_squared(p);
        if dist < best_dist {
            best_dist = dist;
            best = candidate;
        }
        for hole in &ex.holes {
            let candidate = hole.closest_boundary_point(p);
            let dist = candidate.distance_squared(p);
            if dist < best_dist {
                best_dist = dist;
                best = candidate;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale;

    fn square_mm(size: f64, center: Point) -> Polygon {
        let half = scale(size / 2.0);
        let mut poly = Polygon::from_points(vec![
            Point::new(-half, -half),
            Point::new(half, -half),
            Point::new(half, half),
            Point::new(-half, half),
        ]);
        poly.translate(center);
        poly
    }

    #[test]
    fn test_area_with_hole() {
        let outer = square_mm(10.0, Point::zero());
        let hole = square_mm(4.0, Point::zero());
        let ex = ExPolygon::with_holes(outer, vec![hole]);

        let expected = (scale(10.0) as CoordF).powi(2) - (scale(4.0) as CoordF).powi(2);
        assert!((ex.area() - expected).abs() < expected * 0.001);
    }

    #[test]
    fn test_contains_point_respects_holes() {
        let outer = square_mm(10.0, Point::zero());
        let hole = square_mm(4.0, Point::zero());
        let ex = ExPolygon::with_holes(outer, vec![hole]);

        // Center is inside the hole, so outside the region.
        assert!(!ex.contains_point(&Point::zero()));
        // Between hole edge and outer edge.
        assert!(ex.contains_point(&Point::new_scale(3.5, 0.0)));
        assert!(!ex.contains_point(&Point::new_scale(6.0, 0.0)));
    }

    #[test]
    fn test_translated() {
        let ex = ExPolygon::new(square_mm(2.0, Point::zero()));
        let moved = ex.translated(Point::new_scale(5.0, 0.0));

        assert!(moved.contains_point(&Point::new_scale(5.0, 0.0)));
        assert!(!moved.contains_point(&Point::zero()));
    }
}
