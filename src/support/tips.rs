//! Tip generation - seeding branches under overhangs.
//!
//! For every overhang region the generator produces the initial
//! `SupportElement`s at the topmost layer of each branch: the overhang is
//! shrunk by half a support line, sampled into discrete seeds whose
//! spacing guarantees the fully grown tree covers the overhang, and each
//! seed is classified by what it can reach (build plate, model, nothing)
//! before becoming a tip element with a small disk influence area.
//!
//! Tips may be emitted on many layers; the result maps each layer to the
//! elements to inject when propagation reaches it.

use super::element::{SupportElement, SupportElementState};
use super::model_volumes::{AvoidanceType, ModelVolumes};
use super::placement::circle_polygon;
use super::settings::{LayerIndex, TreeSupportSettings};
use crate::clipper::{self, OffsetJoinType};
use crate::geometry::{region_contains_point, ExPolygon, ExPolygons, Point, Polygon};
use crate::Coord;
use std::collections::BTreeMap;

/// What a tip seeded at a given position can reach when descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TipStatus {
    /// Can reach the build plate avoiding holes on the way.
    ToBuildPlateSafe,
    /// Can reach the build plate.
    ToBuildPlate,
    /// Can rest on a flat model surface, avoiding holes.
    ToModelGraciousSafe,
    /// Can rest on a flat model surface.
    ToModelGracious,
    /// Ends on the model, not necessarily on a flat surface.
    ToModel,
    /// No support possible here.
    Invalid,
}

/// Tip elements per layer, to be injected when propagation reaches the
/// layer.
pub type TipsByLayer = BTreeMap<LayerIndex, Vec<SupportElement>>;

/// Generates the initial support elements under overhangs.
pub struct TipGenerator<'a> {
    volumes: &'a ModelVolumes,
    settings: &'a TreeSupportSettings,
}

impl<'a> TipGenerator<'a> {
    pub fn new(volumes: &'a ModelVolumes, settings: &'a TreeSupportSettings) -> Self {
        Self { volumes, settings }
    }

    /// Seed tips for all overhang layers.
    ///
    /// `overhangs[L]` holds the regions of layer `L` that need support
    /// from below; `enforcers[L]` are user-painted support-required
    /// regions unioned into them.
    pub fn generate(&self, overhangs: &[ExPolygons], enforcers: &[ExPolygons]) -> TipsByLayer {
        let mut tips = TipsByLayer::new();

        // The support top must stay z_distance_top_layers below the
        // overhang it carries.
        let z_distance_delta = self.settings.z_distance_top_layers as LayerIndex + 1;
        let connect_length = self.connect_length();

        for (overhang_layer, overhang) in overhangs.iter().enumerate() {
            let overhang_layer = overhang_layer as LayerIndex;
            let mut overhang = overhang.clone();
            if let Some(enforced) = enforcers.get(overhang_layer as usize) {
                if !enforced.is_empty() {
                    overhang = clipper::union(&overhang, enforced);
                }
            }
            if overhang.is_empty() || overhang_layer == 0 {
                continue;
            }

            // Plate-level overhangs still get their (roof-only) tips on
            // layer 0.
            let support_layer = (overhang_layer - z_distance_delta).max(0);

            // Keep the seeds half a line inside the overhang so the tip
            // circles stay under it.
            let shrunk = clipper::offset(
                &overhang,
                -self.settings.support_line_width / 2,
                OffsetJoinType::Round,
            );
            if shrunk.is_empty() {
                continue;
            }

            let supports_roof = self.settings.support_roof_layers > 0;
            for region in &shrunk {
                for seed in sample_region(region, connect_length) {
                    self.try_add_tip(&mut tips, seed, support_layer, supports_roof);
                }
            }
        }

        tips
    }

    /// Spacing between tip seeds, chosen so the fully grown tree covers
    /// the overhang without gaps.
    fn connect_length(&self) -> Coord {
        let top_rate = self.settings.settings.support_tree_top_rate.max(1.0);
        (self.settings.support_line_width as f64 * 100.0 / top_rate) as Coord
            + (2 * self.settings.min_radius - self.settings.support_line_width).max(0)
    }

    fn try_add_tip(
        &self,
        tips: &mut TipsByLayer,
        seed: Point,
        layer: LayerIndex,
        supports_roof: bool,
    ) {
        let status = self.classify(seed, layer);
        if status == TipStatus::Invalid {
            return;
        }

        let mut state = SupportElementState::new_tip(layer, seed);
        state.bits.to_buildplate = matches!(
            status,
            TipStatus::ToBuildPlate | TipStatus::ToBuildPlateSafe
        );
        state.bits.to_model_gracious = matches!(
            status,
            TipStatus::ToModelGracious | TipStatus::ToModelGraciousSafe
        );
        state.bits.can_use_safe_radius = matches!(
            status,
            TipStatus::ToBuildPlateSafe | TipStatus::ToModelGraciousSafe
        );
        state.bits.supports_roof = supports_roof;
        state.bits.use_min_xy_dist = self.settings.use_min_xy_dist;
        // Young branches grow in radius before they are allowed to
        // translate.
        state.dont_move_until = self.settings.tip_layers as u32;
        if supports_roof {
            state.missing_roof_layers = self.settings.support_roof_layers as u32;
        }

        let disk = ExPolygon::new(circle_polygon(seed, self.settings.min_radius));
        let collision = self.volumes.get_collision(
            self.settings.min_radius,
            layer,
            state.bits.use_min_xy_dist,
        );
        let influence = clipper::difference(&[disk], &collision);
        if influence.is_empty() {
            return;
        }

        tips.entry(layer)
            .or_default()
            .push(SupportElement::new(state, influence));
    }

    /// Classify a seed by the best descent it can still make, checking
    /// the cheapest (safest) option first.
    fn classify(&self, seed: Point, layer: LayerIndex) -> TipStatus {
        let radius = self.settings.min_radius;
        let min_xy = self.settings.use_min_xy_dist;

        let safe = self
            .volumes
            .get_avoidance(radius, layer, AvoidanceType::FastSafe, false, min_xy);
        if !region_contains_point(&safe, &seed) {
            return TipStatus::ToBuildPlateSafe;
        }

        let fast = self
            .volumes
            .get_avoidance(radius, layer, AvoidanceType::Fast, false, min_xy);
        if !region_contains_point(&fast, &seed) {
            return TipStatus::ToBuildPlate;
        }

        if self.settings.support_rests_on_model {
            let model_safe =
                self.volumes
                    .get_avoidance(radius, layer, AvoidanceType::FastSafe, true, min_xy);
            if !region_contains_point(&model_safe, &seed) {
                return TipStatus::ToModelGraciousSafe;
            }

            let model =
                self.volumes
                    .get_avoidance(radius, layer, AvoidanceType::Fast, true, min_xy);
            if !region_contains_point(&model, &seed) {
                return TipStatus::ToModelGracious;
            }

            let collision = self.volumes.get_collision(radius, layer, min_xy);
            if !region_contains_point(&collision, &seed) {
                return TipStatus::ToModel;
            }
        }

        TipStatus::Invalid
    }
}

/// Sample a region into seed points: boundary points every `spacing`
/// units plus an interior grid for regions wider than the spacing, so the
/// grown tree covers the whole area.
fn sample_region(region: &ExPolygon, spacing: Coord) -> Vec<Point> {
    let mut points = sample_polygon_boundary(&region.contour, spacing);

    // Interior grid, aligned to the bounding box.
    let contour_points = region.contour.points();
    if let (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) = (
        contour_points.iter().map(|p| p.x).min(),
        contour_points.iter().map(|p| p.x).max(),
        contour_points.iter().map(|p| p.y).min(),
        contour_points.iter().map(|p| p.y).max(),
    ) {
        if max_x - min_x > spacing && max_y - min_y > spacing {
            let mut y = min_y + spacing;
            while y < max_y {
                let mut x = min_x + spacing;
                while x < max_x {
                    let p = Point::new(x, y);
                    if region.contains_point(&p) {
                        points.push(p);
                    }
                    x += spacing;
                }
                y += spacing;
            }
        }
    }

    if points.is_empty() && !contour_points.is_empty() {
        points.push(region.contour.centroid());
    }
    points
}

/// Points along a polygon boundary at the given spacing.
fn sample_polygon_boundary(polygon: &Polygon, spacing: Coord) -> Vec<Point> {
    let pts = polygon.points();
    let mut result = Vec::new();
    if pts.is_empty() || spacing <= 0 {
        return result;
    }

    let mut carried: f64 = 0.0;
    for i in 0..pts.len() {
        let a = pts[i];
        let b = pts[(i + 1) % pts.len()];
        let len = a.distance(&b);
        if len == 0.0 {
            continue;
        }

        let mut pos = spacing as f64 - carried;
        while pos <= len {
            let t = pos / len;
            result.push(Point::new(
                a.x + ((b.x - a.x) as f64 * t).round() as Coord,
                a.y + ((b.y - a.y) as f64 * t).round() as Coord,
            ));
            pos += spacing as f64;
        }
        carried = (carried + len) % spacing as f64;
    }

    if result.is_empty() {
        result.push(pts[0]);
    }
    result
}
