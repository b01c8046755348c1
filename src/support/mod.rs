//! Organic tree-support generation.
//!
//! The influence-area pipeline that decides, layer by layer from top to
//! bottom, where branches exist, how wide they are, where they may move,
//! and when they merge:
//!
//! 1. **Volumes**: per-layer, radius-indexed obstacle fields (collision,
//!    avoidance, placeable) with single-flight caching
//!    ([`model_volumes`]).
//! 2. **Tips**: seeding branches under overhang regions ([`tips`]).
//! 3. **Pathing**: propagating each branch downward as an influence area
//!    and merging branches that meet ([`pathing`]).
//! 4. **Placement**: collapsing each influence area to a centerline point
//!    and rasterizing the final branch polygons ([`placement`]).
//!
//! The generator is a pure function of its inputs: the same layers and
//! settings always produce byte-equal polygon output, regardless of
//! thread interleaving. No files are read or written.
//!
//! ```no_run
//! use tree_support::support::{
//!     CancellationToken, TreeSupportGenerator, TreeSupportInput,
//! };
//! use tree_support::support::settings::TreeSupportSettings;
//!
//! let input = TreeSupportInput::new(Vec::new());
//! let generator =
//!     TreeSupportGenerator::new(TreeSupportSettings::default(), input).unwrap();
//! let layers = generator.generate(&CancellationToken::new()).unwrap();
//! assert!(layers.layers.is_empty());
//! ```

pub mod element;
pub mod model_volumes;
pub mod pathing;
pub mod placement;
pub mod settings;
pub mod tips;

pub use element::{SupportElement, SupportElementState, SupportElementStateBits};
pub use model_volumes::{AvoidanceType, ModelVolumes};
pub use settings::{
    InterfacePreference, LayerIndex, TreeSupportMeshGroupSettings, TreeSupportSettings,
};

use crate::geometry::ExPolygons;
use crate::Coord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Fraction of lost branches above which an aggregate warning is logged.
const LOST_BRANCH_WARN_RATIO: f64 = 0.05;

/// Errors surfaced by the generator.
///
/// Per-element geometric failures are never fatal; affected branches are
/// deleted and reported in aggregate. Only cancellation and internal
/// invariant violations abort a run.
#[derive(Debug, Error)]
pub enum TreeSupportError {
    /// Settings failed consistency checks; no work was started.
    #[error("invalid tree support configuration: {0}")]
    ConfigInvalid(String),
    /// The cancellation token was observed; partial results discarded.
    #[error("tree support generation cancelled")]
    Cancelled,
    /// An internal invariant was violated; the generation is aborted.
    #[error("internal tree support error: {0}")]
    Internal(String),
}

/// Externally settable cancellation flag, polled at layer boundaries and
/// inside long-running cache fills.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observed at the next poll point.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// One input layer from the surrounding slicer.
#[derive(Debug, Clone, Default)]
pub struct TreeSupportLayerInput {
    /// Z of this layer's top in scaled units.
    pub print_z: Coord,
    /// Model slice on this layer.
    pub outlines: ExPolygons,
    /// Regions of this layer that require support from below.
    pub overhangs: ExPolygons,
    /// Upward-facing flat model regions a branch may rest on.
    pub placeable_top_surfaces: ExPolygons,
    /// User-painted "no support here" regions.
    pub blockers: ExPolygons,
    /// User-painted "support required" regions.
    pub enforcers: ExPolygons,
}

/// Complete input of one generation run.
#[derive(Debug, Clone, Default)]
pub struct TreeSupportInput {
    /// Layers, bottom (layer 0) first.
    pub layers: Vec<TreeSupportLayerInput>,
}

impl TreeSupportInput {
    pub fn new(layers: Vec<TreeSupportLayerInput>) -> Self {
        Self { layers }
    }
}

/// Support polygons of one output layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupportLayer {
    /// Layer index.
    pub layer_idx: LayerIndex,
    /// Z of this layer's top in scaled units.
    pub print_z: Coord,
    /// Branch body regions.
    pub support_base: ExPolygons,
    /// Dense interface regions directly under overhangs.
    pub support_roof_interface: ExPolygons,
    /// Dense interface regions above model landings.
    pub support_floor_interface: ExPolygons,
}

impl SupportLayer {
    fn empty(layer_idx: LayerIndex, print_z: Coord) -> Self {
        Self {
            layer_idx,
            print_z,
            ..Default::default()
        }
    }
}

/// Aggregate per-run diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeSupportDiagnostics {
    /// Branches that could not reach their required destination.
    pub lost: usize,
    /// Branches that additionally lost their gracious fallback.
    pub verylost: usize,
}

/// Output of one generation run.
#[derive(Debug, Clone, Default)]
pub struct TreeSupportLayers {
    /// Per-layer support polygons, bottom first.
    pub layers: Vec<SupportLayer>,
    /// Aggregate branch diagnostics.
    pub diagnostics: TreeSupportDiagnostics,
}

/// The tree support generator.
///
/// Construction validates the settings; [`Self::generate`] runs the full
/// pipeline and may be called repeatedly (each run is independent).
pub struct TreeSupportGenerator {
    settings: TreeSupportSettings,
    input: TreeSupportInput,
}

impl TreeSupportGenerator {
    /// Validate settings and bind the input.
    pub fn new(
        mut settings: TreeSupportSettings,
        input: TreeSupportInput,
    ) -> Result<Self, TreeSupportError> {
        settings.validate()?;
        settings.set_actual_z(input.layers.iter().map(|l| l.print_z).collect());
        Ok(Self { settings, input })
    }

    /// Run the full pipeline: tips, pathing, placement, drawing.
    pub fn generate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TreeSupportLayers, TreeSupportError> {
        let layer_count = self.input.layers.len();
        if layer_count == 0 {
            return Ok(TreeSupportLayers::default());
        }

        let volumes = ModelVolumes::new(
            self.settings.clone(),
            self.input.layers.iter().map(|l| l.outlines.clone()).collect(),
            self.input.layers.iter().map(|l| l.blockers.clone()).collect(),
            self.input
                .layers
                .iter()
                .map(|l| l.placeable_top_surfaces.clone())
                .collect(),
            cancel.clone(),
        );

        let overhangs: Vec<ExPolygons> = self
            .input
            .layers
            .iter()
            .map(|l| l.overhangs.clone())
            .collect();
        let enforcers: Vec<ExPolygons> = self
            .input
            .layers
            .iter()
            .map(|l| l.enforcers.clone())
            .collect();

        // Warm the volume caches bottom-up for the radii every branch
        // passes through; later queries mostly hit.
        volumes.precalculate(
            layer_count as LayerIndex - 1,
            &[self.settings.min_radius, self.settings.branch_radius],
        );
        if cancel.is_cancelled() {
            return Err(TreeSupportError::Cancelled);
        }

        let tip_generator = tips::TipGenerator::new(&volumes, &self.settings);
        let tips = tip_generator.generate(&overhangs, &enforcers);
        if cancel.is_cancelled() {
            return Err(TreeSupportError::Cancelled);
        }
        if tips.is_empty() {
            // Nothing needs support; an empty result, not an error.
            return Ok(TreeSupportLayers {
                layers: (0..layer_count)
                    .map(|l| {
                        SupportLayer::empty(
                            l as LayerIndex,
                            self.settings.get_actual_z(l as LayerIndex),
                        )
                    })
                    .collect(),
                diagnostics: TreeSupportDiagnostics::default(),
            });
        }

        let (mut move_bounds, stats) =
            pathing::create_layer_pathing(&volumes, &self.settings, tips, cancel)?;

        if stats.propagated > 0 {
            let ratio = stats.lost as f64 / stats.propagated as f64;
            if ratio > LOST_BRANCH_WARN_RATIO {
                log::warn!(
                    "tree support: {} of {} branch steps lost their path ({}%), supports may be incomplete",
                    stats.lost,
                    stats.propagated,
                    (ratio * 100.0).round()
                );
            }
        }

        placement::set_points_on_areas(&mut move_bounds, &volumes, &self.settings);
        if cancel.is_cancelled() {
            return Err(TreeSupportError::Cancelled);
        }

        let layers = placement::draw_areas(&move_bounds, &volumes, &self.settings, cancel)?;

        Ok(TreeSupportLayers {
            layers,
            diagnostics: TreeSupportDiagnostics {
                lost: stats.lost,
                verylost: stats.verylost,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ExPolygon, Point, Polygon};
    use crate::scale;

    fn square_mm(size: f64, center: Point) -> ExPolygon {
        let half = scale(size / 2.0);
        let mut poly = Polygon::from_points(vec![
            Point::new(-half, -half),
            Point::new(half, -half),
            Point::new(half, half),
            Point::new(-half, half),
        ]);
        poly.translate(center);
        ExPolygon::new(poly)
    }

    fn layer_stack(count: usize) -> Vec<TreeSupportLayerInput> {
        (0..count)
            .map(|i| TreeSupportLayerInput {
                print_z: (i as Coord + 1) * scale(0.2),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_empty_input_empty_output() {
        let generator =
            TreeSupportGenerator::new(TreeSupportSettings::default(), TreeSupportInput::default())
                .unwrap();
        let result = generator.generate(&CancellationToken::new()).unwrap();
        assert!(result.layers.is_empty());
        assert_eq!(result.diagnostics, TreeSupportDiagnostics::default());
    }

    #[test]
    fn test_no_overhangs_empty_layers() {
        let mut layers = layer_stack(5);
        for layer in &mut layers {
            layer.outlines = vec![square_mm(10.0, Point::zero())];
        }

        let generator = TreeSupportGenerator::new(
            TreeSupportSettings::default(),
            TreeSupportInput::new(layers),
        )
        .unwrap();
        let result = generator.generate(&CancellationToken::new()).unwrap();

        assert_eq!(result.layers.len(), 5);
        for layer in &result.layers {
            assert!(layer.support_base.is_empty());
            assert!(layer.support_roof_interface.is_empty());
            assert!(layer.support_floor_interface.is_empty());
        }
    }

    #[test]
    fn test_invalid_settings_rejected_before_work() {
        let mut group = TreeSupportMeshGroupSettings::default();
        group.support_tree_tip_diameter = 0;
        group.support_line_width = 0;

        let result = TreeSupportGenerator::new(
            TreeSupportSettings::new(group),
            TreeSupportInput::default(),
        );
        assert!(matches!(result, Err(TreeSupportError::ConfigInvalid(_))));
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut layers = layer_stack(8);
        layers[7].overhangs = vec![square_mm(6.0, Point::zero())];

        let generator = TreeSupportGenerator::new(
            TreeSupportSettings::default(),
            TreeSupportInput::new(layers),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            generator.generate(&cancel),
            Err(TreeSupportError::Cancelled)
        ));
    }

    #[test]
    fn test_simple_overhang_generates_support() {
        let mut layers = layer_stack(12);
        layers[10].overhangs = vec![square_mm(8.0, Point::zero())];

        let generator = TreeSupportGenerator::new(
            TreeSupportSettings::default(),
            TreeSupportInput::new(layers),
        )
        .unwrap();
        let result = generator.generate(&CancellationToken::new()).unwrap();

        assert_eq!(result.layers.len(), 12);
        let has_support = result
            .layers
            .iter()
            .any(|l| !l.support_base.is_empty() || !l.support_roof_interface.is_empty());
        assert!(has_support);
        // Support reaches the plate.
        assert!(
            !result.layers[0].support_base.is_empty()
                || !result.layers[0].support_roof_interface.is_empty()
        );
        assert_eq!(result.diagnostics.lost, 0);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let mut layers = layer_stack(10);
        layers[8].overhangs = vec![
            square_mm(5.0, Point::new_scale(-4.0, 0.0)),
            square_mm(5.0, Point::new_scale(4.0, 0.0)),
        ];
        layers[6].outlines = vec![square_mm(3.0, Point::new_scale(10.0, 10.0))];

        let generator = TreeSupportGenerator::new(
            TreeSupportSettings::default(),
            TreeSupportInput::new(layers),
        )
        .unwrap();

        let a = generator.generate(&CancellationToken::new()).unwrap();
        let b = generator.generate(&CancellationToken::new()).unwrap();

        assert_eq!(a.layers, b.layers);
        assert_eq!(a.diagnostics, b.diagnostics);
    }
}
