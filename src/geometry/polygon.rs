//! Closed polygon contours.

use super::Point;
use crate::{Coord, CoordF};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed polygon defined by a sequence of points.
///
/// The polygon is implicitly closed - the last point connects back to the
/// first. Points should be ordered counter-clockwise for outer contours
/// (positive area) and clockwise for holes (negative area).
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Polygon {
    points: Vec<Point>,
}

impl Polygon {
    /// Create a new empty polygon.
    #[inline]
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Create a polygon from a vector of points.
    #[inline]
    pub fn from_points(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Create an axis-aligned rectangle from two opposite corners.
    pub fn rectangle(min: Point, max: Point) -> Self {
        Self::from_points(vec![
            Point::new(min.x, min.y),
            Point::new(max.x, min.y),
            Point::new(max.x, max.y),
            Point::new(min.x, max.y),
        ])
    }

    /// Get the points of this polygon.
    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Get a mutable reference to the points.
    #[inline]
    pub fn points_mut(&mut self) -> &mut Vec<Point> {
        &mut self.points
    }

    /// Number of vertices.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when the polygon has no vertices.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Append a vertex.
    #[inline]
    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    /// Signed area via the shoelace formula. Positive for counter-clockwise
    /// contours, negative for clockwise holes.
    pub fn signed_area(&self) -> CoordF {
        if self.points.len() < 3 {
            return 0.0;
        }

        let mut sum: i128 = 0;
        for i in 0..self.points.len() {
            let j = (i + 1) % self.points.len();
            sum += self.points[i].x as i128 * self.points[j].y as i128;
            sum -= self.points[j].x as i128 * self.points[i].y as i128;
        }

        sum as CoordF / 2.0
    }

    /// Unsigned area in scaled units squared.
    #[inline]
    pub fn area(&self) -> CoordF {
        self.signed_area().abs()
    }

    /// Total boundary length in scaled units.
    pub fn perimeter(&self) -> CoordF {
        if self.points.len() < 2 {
            return 0.0;
        }
        let mut total = 0.0;
        for i in 0..self.points.len() {
            let j = (i + 1) % self.points.len();
            total += self.points[i].distance(&self.points[j]);
        }
        total
    }

    /// Point-in-polygon test by ray casting. Boundary points count as inside.
    pub fn contains_point(&self, p: &Point) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }

        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let pi = self.points[i];
            let pj = self.points[j];

            if (pi.y > p.y) != (pj.y > p.y) {
                // Exact crossing test in i128 to avoid overflow.
                let dy = (pj.y - pi.y) as i128;
                let lhs = (p.x - pi.x) as i128 * dy;
                let rhs = (pj.x - pi.x) as i128 * (p.y - pi.y) as i128;
                let crosses = if dy > 0 { lhs < rhs } else { lhs > rhs };
                if crosses {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Area centroid of the contour. Falls back to the vertex average for
    /// degenerate (near-zero-area) contours.
    pub fn centroid(&self) -> Point {
        let n = self.points.len();
        if n == 0 {
            return Point::zero();
        }

        let mut cx = 0.0;
        let mut cy = 0.0;
        let mut area2 = 0.0;
        for i in 0..n {
            let p = self.points[i];
            let q = self.points[(i + 1) % n];
            let cross = p.x as CoordF * q.y as CoordF - q.x as CoordF * p.y as CoordF;
            cx += (p.x as CoordF + q.x as CoordF) * cross;
            cy += (p.y as CoordF + q.y as CoordF) * cross;
            area2 += cross;
        }

        if area2.abs() < 1.0 {
            let sx: i128 = self.points.iter().map(|p| p.x as i128).sum();
            let sy: i128 = self.points.iter().map(|p| p.y as i128).sum();
            return Point::new((sx / n as i128) as Coord, (sy / n as i128) as Coord);
        }

        Point::new(
            (cx / (3.0 * area2)).round() as Coord,
            (cy / (3.0 * area2)).round() as Coord,
        )
    }

    /// Closest point on the polygon boundary to `p`.
    pub fn closest_boundary_point(&self, p: &Point) -> Point {
        let n = self.points.len();
        if n == 0 {
            return *p;
        }
        if n == 1 {
            return self.points[0];
        }

        let mut best = self.points[0];
        let mut best_dist = i128::MAX;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            let candidate = closest_point_on_segment(*p, a, b);
            let dist = candidate.distance_squared(p);
            if dist < best_dist {
                best_dist = dist;
                best = candidate;
            }
        }
        best
    }

    /// Translate all vertices by `delta`.
    pub fn translate(&mut self, delta: Point) {
        for p in &mut self.points {
            *p += delta;
        }
    }

    /// Return a copy translated by `delta`.
    pub fn translated(&self, delta: Point) -> Self {
        let mut copy = self.clone();
        copy.translate(delta);
        copy
    }

    /// Simplify with the Douglas-Peucker algorithm, keeping the maximum
    /// deviation from the original boundary below `tolerance`.
    pub fn simplified(&self, tolerance: Coord) -> Polygon {
        if self.points.len() <= 3 || tolerance <= 0 {
            return self.clone();
        }

        let mut keep = vec![false; self.points.len()];
        keep[0] = true;
        let anchor_end = self.points.len() - 1;
        keep[anchor_end] = true;
        douglas_peucker(&self.points, 0, anchor_end, tolerance as CoordF, &mut keep);

        let simplified: Vec<Point> = self
            .points
            .iter()
            .zip(keep.iter())
            .filter_map(|(p, &k)| if k { Some(*p) } else { None })
            .collect();

        if simplified.len() < 3 {
            self.clone()
        } else {
            Polygon::from_points(simplified)
        }
    }
}

/// Closest point to `p` on the segment from `a` to `b`.
pub fn closest_point_on_segment(p: Point, a: Point, b: Point) -> Point {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let length_sq = dx as i128 * dx as i128 + dy as i128 * dy as i128;

    if length_sq == 0 {
        return a;
    }

    let t = ((p.x - a.x) as i128 * dx as i128 + (p.y - a.y) as i128 * dy as i128) as CoordF
        / length_sq as CoordF;
    let t = t.clamp(0.0, 1.0);

    Point::new(
        a.x + (dx as CoordF * t).round() as Coord,
        a.y + (dy as CoordF * t).round() as Coord,
    )
}

fn douglas_peucker(points: &[Point], start: usize, end: usize, tolerance: CoordF, keep: &mut [bool]) {
    if end <= start + 1 {
        return;
    }

    let mut max_dist = 0.0;
    let mut max_idx = start;
    for i in (start + 1)..end {
        let closest = closest_point_on_segment(points[i], points[start], points[end]);
        let dist = points[i].distance(&closest);
        if dist > max_dist {
            max_dist = dist;
            max_idx = i;
        }
    }

    if max_dist > tolerance {
        keep[max_idx] = true;
        douglas_peucker(points, start, max_idx, tolerance, keep);
        douglas_peucker(points, max_idx, end, tolerance, keep);
    }
}

impl fmt::Debug for Polygon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Polygon({} points)", self.points.len())
    }
}
