//! Organic tree-support generation for fused-filament 3D printing.
//!
//! Given a sliced model (per-layer outlines plus the overhang regions that
//! need support), this crate produces a stack of branching, tree-like
//! scaffolding polygons: branches are seeded under overhangs, propagated
//! downward layer by layer as *influence areas*, merged where geometrically
//! sensible, collapsed to centerline points and finally rasterized into
//! per-layer support, roof-interface and floor-interface polygons.
//!
//! The crate is a pure function of its inputs: no I/O, no persisted state.
//! See [`support::TreeSupportGenerator`] for the entry point.
//!
//! # Coordinate system
//!
//! All 2D coordinates are scaled integers (`Coord`), with
//! [`SCALING_FACTOR`] units per millimeter. Use [`scale`] / [`unscale`] to
//! convert from and to floating-point millimeters.

pub mod clipper;
pub mod geometry;
pub mod support;

/// Scaled integer coordinate type.
pub type Coord = i64;

/// Floating-point coordinate type (millimeters).
pub type CoordF = f64;

/// Number of scaled units per millimeter.
pub const SCALING_FACTOR: CoordF = 1_000_000.0;

/// Convert a length in millimeters to scaled units.
#[inline]
pub fn scale(v: CoordF) -> Coord {
    (v * SCALING_FACTOR).round() as Coord
}

/// Convert a length in scaled units to millimeters.
#[inline]
pub fn unscale(v: Coord) -> CoordF {
    v as CoordF / SCALING_FACTOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_round_trip() {
        assert_eq!(scale(1.0), 1_000_000);
        assert_eq!(scale(0.5), 500_000);
        assert!((unscale(scale(1.234)) - 1.234).abs() < 1e-6);
    }

    #[test]
    fn test_scale_negative() {
        assert_eq!(scale(-2.0), -2_000_000);
        assert!((unscale(-500_000) + 0.5).abs() < 1e-9);
    }
}
