//! 2D point type on scaled integer coordinates.

use crate::{scale, unscale, Coord, CoordF};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

/// A 2D point with scaled integer coordinates.
///
/// Points use integer coordinates scaled by `SCALING_FACTOR` to avoid
/// floating-point precision issues in boolean operations.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: Coord,
    pub y: Coord,
}

impl Point {
    /// Create a new point with the given scaled coordinates.
    #[inline]
    pub const fn new(x: Coord, y: Coord) -> Self {
        Self { x, y }
    }

    /// Create a new point from millimeter coordinates, scaling them.
    #[inline]
    pub fn new_scale(x: CoordF, y: CoordF) -> Self {
        Self {
            x: scale(x),
            y: scale(y),
        }
    }

    /// The origin (0, 0).
    #[inline]
    pub const fn zero() -> Self {
        Self { x: 0, y: 0 }
    }

    /// Squared distance to another point. Returns i128 to avoid overflow
    /// with large coordinates.
    #[inline]
    pub fn distance_squared(&self, other: &Point) -> i128 {
        let dx = (other.x - self.x) as i128;
        let dy = (other.y - self.y) as i128;
        dx * dx + dy * dy
    }

    /// Distance to another point in scaled units.
    #[inline]
    pub fn distance(&self, other: &Point) -> CoordF {
        (self.distance_squared(other) as CoordF).sqrt()
    }

    /// Length of this point interpreted as a vector, in scaled units.
    #[inline]
    pub fn length(&self) -> CoordF {
        let x = self.x as CoordF;
        let y = self.y as CoordF;
        (x * x + y * y).sqrt()
    }

    /// Move this point toward `target` by at most `max_step` scaled units.
    /// Reaches `target` exactly when it is closer than `max_step`.
    pub fn step_towards(&self, target: &Point, max_step: Coord) -> Point {
        let dist = self.distance(target);
        if dist <= max_step as CoordF || dist == 0.0 {
            return *target;
        }
        let t = max_step as CoordF / dist;
        Point::new(
            self.x + ((target.x - self.x) as CoordF * t).round() as Coord,
            self.y + ((target.y - self.y) as CoordF * t).round() as Coord,
        )
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}mm, {:.3}mm)", unscale(self.x), unscale(self.y))
    }
}

impl Add for Point {
    type Output = Point;
    #[inline]
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Point {
    #[inline]
    fn add_assign(&mut self, rhs: Point) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Point {
    type Output = Point;
    #[inline]
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Point {
    #[inline]
    fn sub_assign(&mut self, rhs: Point) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl Mul<Coord> for Point {
    type Output = Point;
    #[inline]
    fn mul(self, rhs: Coord) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

impl Neg for Point {
    type Output = Point;
    #[inline]
    fn neg(self) -> Point {
        Point::new(-self.x, -self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_arithmetic() {
        let a = Point::new(10, 20);
        let b = Point::new(3, 4);

        assert_eq!(a + b, Point::new(13, 24));
        assert_eq!(a - b, Point::new(7, 16));
        assert_eq!(-b, Point::new(-3, -4));
        assert_eq!(b * 2, Point::new(6, 8));
    }

    #[test]
    fn test_distance() {
        let a = Point::zero();
        let b = Point::new(3, 4);

        assert_eq!(a.distance_squared(&b), 25);
        assert!((a.distance(&b) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_step_towards_clamps() {
        let a = Point::zero();
        let b = Point::new(1000, 0);

        let stepped = a.step_towards(&b, 300);
        assert_eq!(stepped, Point::new(300, 0));

        // Close targets are reached exactly.
        let stepped = a.step_towards(&b, 5000);
        assert_eq!(stepped, b);
    }

    #[test]
    fn test_new_scale() {
        let p = Point::new_scale(1.0, -0.5);
        assert_eq!(p, Point::new(1_000_000, -500_000));
    }
}
