//! Tree support configuration.
//!
//! Raw per-mesh-group options ([`TreeSupportMeshGroupSettings`]) and the
//! derived values the pipeline actually consumes ([`TreeSupportSettings`]):
//! the radius schedule, per-layer move caps, z-clearance layer counts and
//! the actual-z table. Settings are immutable for a generation run; the
//! whole derived struct compares by value so volume caches can be keyed on
//! settings identity.

use super::model_volumes::AvoidanceType;
use super::TreeSupportError;
use crate::{scale, unscale, Coord, CoordF};
use serde::{Deserialize, Serialize};

/// Signed layer index. Layer 0 is the bottom printed layer; negative
/// indices address raft layers below the object.
pub type LayerIndex = i32;

/// The number of vertices used when drawing branch circles.
pub const SUPPORT_TREE_CIRCLE_RESOLUTION: usize = 25;

/// How overlaps between interface areas and support areas are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterfacePreference {
    /// Interface areas are cut out of the support.
    #[default]
    InterfaceAreaOverwritesSupport,
    /// Support areas are cut out of the interface.
    SupportAreaOverwritesInterface,
    /// Both areas are kept; interface lines are drawn last.
    InterfaceLinesOverwriteSupport,
    /// Both areas are kept; support lines are drawn last.
    SupportLinesOverwriteInterface,
    /// Keep both, accept overlap.
    Nothing,
}

/// Infill pattern for the support body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SupportPattern {
    #[default]
    Lines,
    Grid,
    Honeycomb,
}

/// Infill pattern for roof/floor interface layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterfacePattern {
    #[default]
    Lines,
    Concentric,
}

/// Raw user-facing options for one mesh group, before derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSupportMeshGroupSettings {
    /// Height of a single layer in scaled units.
    pub layer_height: Coord,
    /// Maximum allowed deviation when simplifying.
    pub resolution: Coord,
    /// Minimum thickness of any model features.
    pub min_feature_size: Coord,
    /// Width of a single support line.
    pub support_line_width: Coord,
    /// Line width of the support roof.
    pub support_roof_line_width: Coord,
    /// Distance between support infill lines.
    pub support_line_spacing: Coord,
    /// Distance between the lines of the roof.
    pub support_roof_line_distance: Coord,
    /// Offset applied to the support floor area.
    pub support_bottom_offset: Coord,
    /// Number of walls the support area will have.
    pub support_wall_count: usize,
    /// Whether roof interface layers are generated.
    pub support_roof_enable: bool,
    /// Number of roof interface layers under each overhang.
    pub support_roof_layers: usize,
    /// Number of floor interface layers above model landings. 0 disables.
    pub support_bottom_layers: usize,
    /// Support may only rest on the build plate.
    pub support_buildplate_only: bool,
    /// Horizontal clearance between support and model.
    pub support_xy_distance: Coord,
    /// Minimum horizontal clearance; used where the z distance already
    /// separates support from model ("Z overrides XY").
    pub support_xy_min_distance: Coord,
    /// Whether the z distance takes precedence over the xy distance.
    pub support_xy_overrides_z: bool,
    /// Vertical gap above support (to the model it supports).
    pub support_top_distance: Coord,
    /// Vertical gap below support (to the model it rests near).
    pub support_bottom_distance: Coord,
    /// Branch angle in degrees (fast movement).
    pub support_tree_angle: CoordF,
    /// Careful branch angle in degrees (slow movement).
    pub support_tree_angle_slow: CoordF,
    /// Diameter of a branch that has left the tip.
    pub support_tree_branch_diameter: Coord,
    /// Diameter of the branch tip.
    pub support_tree_tip_diameter: Coord,
    /// Angle in degrees governing radius gain below the tip region.
    pub support_tree_branch_diameter_angle: CoordF,
    /// Trunk diameter to aim for at the build plate.
    pub support_tree_bp_diameter: Coord,
    /// Cap on radius gained by a to-model branch merging with
    /// to-buildplate branches.
    pub support_tree_max_diameter_increase_by_merges_when_support_to_model: Coord,
    /// Minimum branch height for landing on the model; shorter branches
    /// are culled.
    pub support_tree_min_height_to_model: Coord,
    /// Percentage rate at which tips reach full branch radius.
    pub support_tree_top_rate: CoordF,
    /// Angles for the roof interface pattern.
    pub support_roof_angles: Vec<CoordF>,
    /// Pattern used in the support roof.
    pub roof_pattern: InterfacePattern,
    /// Pattern used in the support infill.
    pub support_pattern: SupportPattern,
    /// How interface/support overlaps are resolved.
    pub interface_preference: InterfacePreference,
    /// Whether the support material is soluble.
    pub soluble: bool,
    /// Extra raft layer z positions below the object, in millimeters.
    pub raft_layers: Vec<CoordF>,
}

impl Default for TreeSupportMeshGroupSettings {
    fn default() -> Self {
        Self {
            layer_height: scale(0.2),
            resolution: scale(0.025),
            min_feature_size: scale(0.1),
            support_line_width: scale(0.4),
            support_roof_line_width: scale(0.4),
            support_line_spacing: scale(2.0),
            support_roof_line_distance: scale(0.4),
            support_bottom_offset: 0,
            support_wall_count: 1,
            support_roof_enable: true,
            support_roof_layers: 3,
            support_bottom_layers: 2,
            support_buildplate_only: false,
            support_xy_distance: scale(0.8),
            support_xy_min_distance: scale(0.4),
            support_xy_overrides_z: false,
            support_top_distance: scale(0.2),
            support_bottom_distance: scale(0.2),
            support_tree_angle: 40.0,
            support_tree_angle_slow: 25.0,
            support_tree_branch_diameter: scale(2.0),
            support_tree_tip_diameter: scale(0.8),
            support_tree_branch_diameter_angle: 5.0,
            support_tree_bp_diameter: scale(7.5),
            support_tree_max_diameter_increase_by_merges_when_support_to_model: scale(1.0),
            support_tree_min_height_to_model: scale(1.0),
            support_tree_top_rate: 15.0,
            support_roof_angles: vec![0.0],
            roof_pattern: InterfacePattern::default(),
            support_pattern: SupportPattern::default(),
            interface_preference: InterfacePreference::default(),
            soluble: false,
            raft_layers: Vec::new(),
        }
    }
}

/// Settings used to grow an influence area by one layer.
///
/// One candidate of the propagation ladder: which avoidance field to
/// subtract, how far the area may spread, and whether the branch may gain
/// radius or translate while doing so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AreaIncreaseSettings {
    /// Avoidance field to stay out of.
    pub avoidance_type: AvoidanceType,
    /// How far the influence area spreads outward, in scaled units.
    pub increase_speed: Coord,
    /// Whether the branch radius grows this layer.
    pub increase_radius: bool,
    /// Accept degenerate geometry instead of rejecting the candidate.
    pub no_error: bool,
    /// Query the minimum-xy-distance obstacle fields.
    pub use_min_distance: bool,
    /// Whether the area may translate (false = only shrink in place).
    pub allow_move: bool,
}

/// Derived settings consumed by the pipeline.
///
/// Everything here is computed once from [`TreeSupportMeshGroupSettings`]
/// plus the layer table; most functions take only this struct so they do
/// not need to know about meshes.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeSupportSettings {
    angle: CoordF,
    angle_slow: CoordF,
    known_z: Vec<Coord>,
    /// Width of a single line of support.
    pub support_line_width: Coord,
    /// Height of a single layer.
    pub layer_height: Coord,
    /// Radius of a branch when it has left the tip.
    pub branch_radius: Coord,
    /// Smallest allowed radius; even at distance-to-top 0 every circle
    /// must still be printable.
    pub min_radius: Coord,
    /// How far an influence area may move outward per layer at most.
    pub maximum_move_distance: Coord,
    /// How far an influence area moves per layer when being careful.
    pub maximum_move_distance_slow: Coord,
    /// Number of floor interface layers. 0 if disabled.
    pub support_bottom_layers: usize,
    /// Number of effective-DTT increases needed to reach branch radius.
    pub tip_layers: usize,
    /// Radius gained per layer below the tip region, scaled units.
    pub branch_radius_increase_per_layer: CoordF,
    /// Cap on radius a to-model branch may gain by merging with
    /// to-buildplate branches.
    pub max_to_model_radius_increase: Coord,
    /// Branches landing on the model with fewer layers than this are
    /// culled.
    pub min_dtt_to_model: usize,
    /// Radius at which radius-increase attempts stop being forced.
    pub increase_radius_until_radius: Coord,
    /// Distance-to-top at which `increase_radius_until_radius` is reached.
    pub increase_radius_until_layer: usize,
    /// True if branches may rest on the model.
    pub support_rests_on_model: bool,
    /// Horizontal clearance from the model.
    pub xy_distance: Coord,
    /// Trunk radius to aim for at the build plate.
    pub bp_radius: Coord,
    /// Layer below which the trunk may widen toward `bp_radius`.
    pub layer_start_bp_radius: LayerIndex,
    /// Radius gained per layer while widening toward `bp_radius`.
    pub bp_radius_increase_per_layer: CoordF,
    /// Minimum horizontal clearance ("Z overrides XY").
    pub xy_min_distance: Coord,
    /// Whether elements may use the minimum xy distance.
    pub use_min_xy_dist: bool,
    /// Layers of vertical gap above the support.
    pub z_distance_top_layers: usize,
    /// Layers of vertical gap below the support.
    pub z_distance_bottom_layers: usize,
    /// Number of roof interface layers under each overhang. 0 if disabled.
    pub support_roof_layers: usize,
    /// Angles for the roof interface pattern.
    pub support_roof_angles: Vec<CoordF>,
    /// Pattern used in the support roof.
    pub roof_pattern: InterfacePattern,
    /// Pattern used in the support infill.
    pub support_pattern: SupportPattern,
    /// Line width of the support roof.
    pub support_roof_line_width: Coord,
    /// Distance between support infill lines.
    pub support_line_spacing: Coord,
    /// Offset applied to the support floor area.
    pub support_bottom_offset: Coord,
    /// Number of walls around support areas.
    pub support_wall_count: usize,
    /// Maximum allowed deviation when simplifying.
    pub resolution: Coord,
    /// Distance between the lines of the roof.
    pub support_roof_line_distance: Coord,
    /// How interface/support overlaps are resolved.
    pub interface_preference: InterfacePreference,
    /// Minimum thickness of any model features.
    pub min_feature_size: Coord,
    /// Whether the support material is soluble.
    pub soluble: bool,
    /// Extra raft layer z positions below the object, in millimeters.
    pub raft_layers: Vec<CoordF>,
    /// The raw mesh-group settings; kept whole so that settings equality
    /// (and with it cache validity) covers every downstream consumer.
    pub settings: TreeSupportMeshGroupSettings,
}

impl TreeSupportSettings {
    /// Derive pipeline settings from raw mesh-group options.
    pub fn new(settings: TreeSupportMeshGroupSettings) -> Self {
        let layer_height_mm = unscale(settings.layer_height);
        let angle = settings.support_tree_angle.to_radians();
        let angle_slow = settings.support_tree_angle_slow.to_radians();

        let maximum_move_distance = scale(layer_height_mm * angle.tan());
        let maximum_move_distance_slow = scale(layer_height_mm * angle_slow.tan());

        let branch_radius = settings.support_tree_branch_diameter / 2;
        let min_radius = (settings.support_tree_tip_diameter / 2).max(settings.support_line_width / 2);
        let bp_radius = settings.support_tree_bp_diameter / 2;

        // Tips widen from min_radius to branch_radius over `top_rate`
        // effective layers.
        let tip_layers = if min_radius < branch_radius {
            (settings.support_tree_top_rate.max(1.0)).ceil() as usize
        } else {
            1
        };

        // Below the tip the radius widens along the configured angle.
        let branch_radius_increase_per_layer = scale(
            layer_height_mm
                * settings
                    .support_tree_branch_diameter_angle
                    .to_radians()
                    .tan(),
        ) as CoordF;

        // The trunk widens toward bp_radius at 45 degrees.
        let bp_radius_increase_per_layer = settings.layer_height as CoordF;
        let layer_start_bp_radius = if bp_radius > branch_radius {
            ((bp_radius - branch_radius) as CoordF / bp_radius_increase_per_layer).ceil()
                as LayerIndex
        } else {
            0
        };

        let z_distance_top_layers =
            (unscale(settings.support_top_distance) / layer_height_mm).ceil() as usize;
        let z_distance_bottom_layers =
            (unscale(settings.support_bottom_distance) / layer_height_mm).ceil() as usize;

        Self {
            angle,
            angle_slow,
            known_z: Vec::new(),
            support_line_width: settings.support_line_width,
            layer_height: settings.layer_height,
            branch_radius,
            min_radius,
            maximum_move_distance,
            maximum_move_distance_slow,
            support_bottom_layers: settings.support_bottom_layers,
            tip_layers,
            branch_radius_increase_per_layer,
            max_to_model_radius_increase: settings
                .support_tree_max_diameter_increase_by_merges_when_support_to_model,
            min_dtt_to_model: (unscale(settings.support_tree_min_height_to_model)
                / layer_height_mm)
                .ceil() as usize,
            increase_radius_until_radius: branch_radius,
            increase_radius_until_layer: tip_layers,
            support_rests_on_model: !settings.support_buildplate_only,
            xy_distance: settings.support_xy_distance,
            bp_radius,
            layer_start_bp_radius,
            bp_radius_increase_per_layer,
            xy_min_distance: settings.support_xy_min_distance,
            use_min_xy_dist: settings.support_xy_overrides_z,
            z_distance_top_layers,
            z_distance_bottom_layers,
            support_roof_layers: if settings.support_roof_enable {
                settings.support_roof_layers
            } else {
                0
            },
            support_roof_angles: settings.support_roof_angles.clone(),
            roof_pattern: settings.roof_pattern,
            support_pattern: settings.support_pattern,
            support_roof_line_width: settings.support_roof_line_width,
            support_line_spacing: settings.support_line_spacing,
            support_bottom_offset: settings.support_bottom_offset,
            support_wall_count: settings.support_wall_count,
            resolution: settings.resolution,
            support_roof_line_distance: settings.support_roof_line_distance,
            interface_preference: settings.interface_preference,
            min_feature_size: settings.min_feature_size,
            soluble: settings.soluble,
            raft_layers: settings.raft_layers.clone(),
            settings,
        }
    }

    /// Consistency-check the derived settings before any work begins.
    pub fn validate(&self) -> Result<(), TreeSupportError> {
        let mut problems = Vec::new();
        if self.min_radius <= 0 {
            problems.push("tip radius must be positive");
        }
        if self.branch_radius < self.min_radius {
            problems.push("branch radius must not be smaller than the tip radius");
        }
        if self.tip_layers == 0 {
            problems.push("tip layer count must be at least 1");
        }
        if self.layer_height <= 0 {
            problems.push("layer height must be positive");
        }
        if self.maximum_move_distance <= 0 {
            problems.push("branch angle must allow horizontal movement");
        }
        if self.maximum_move_distance_slow > self.maximum_move_distance {
            problems.push("slow branch angle must not exceed the branch angle");
        }
        if self.xy_min_distance > self.xy_distance {
            problems.push("minimum xy distance must not exceed the xy distance");
        }
        if self.resolution <= 0 {
            problems.push("resolution must be positive");
        }
        if self.support_line_width <= 0 {
            problems.push("support line width must be positive");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(TreeSupportError::ConfigInvalid(problems.join("; ")))
        }
    }

    /// The distance-to-top used for radius computation: the actual
    /// distance-to-top is clamped to the tip region until the element has
    /// been allowed to grow past it.
    pub fn effective_dtt(&self, effective_radius_height: u32, distance_to_top: u32) -> usize {
        if (effective_radius_height as usize) < self.increase_radius_until_layer {
            (distance_to_top as usize).min(self.increase_radius_until_layer)
        } else {
            effective_radius_height as usize
        }
    }

    /// The radius of an element with the given effective distance-to-top
    /// and elephant-foot counter.
    pub fn get_radius(&self, distance_to_top: usize, elephant_foot_increases: CoordF) -> Coord {
        let base = if distance_to_top <= self.tip_layers {
            self.min_radius
                + ((self.branch_radius - self.min_radius) as CoordF * distance_to_top as CoordF
                    / self.tip_layers as CoordF) as Coord
        } else {
            self.branch_radius
                + ((distance_to_top - self.tip_layers) as CoordF
                    * self.branch_radius_increase_per_layer) as Coord
        };

        base + (elephant_foot_increases
            * (self.bp_radius_increase_per_layer - self.branch_radius_increase_per_layer).max(0.0))
            as Coord
    }

    /// The radius every element should aim to have at the given layer, to
    /// reach `bp_radius` at the build plate.
    pub fn recommended_min_radius(&self, layer_idx: LayerIndex) -> Coord {
        let num_layers_widened = (self.layer_start_bp_radius - layer_idx) as CoordF;
        if num_layers_widened > 0.0 {
            self.branch_radius + (num_layers_widened * self.bp_radius_increase_per_layer) as Coord
        } else {
            0
        }
    }

    /// The z in scaled units at which the given layer is printed. Layers
    /// beyond the known table extrapolate by whole layer heights from the
    /// last known z.
    pub fn get_actual_z(&self, layer_idx: LayerIndex) -> Coord {
        if layer_idx >= 0 && (layer_idx as usize) < self.known_z.len() {
            return self.known_z[layer_idx as usize];
        }
        match self.known_z.last() {
            Some(&last) => {
                last + (layer_idx + 1 - self.known_z.len() as LayerIndex) as Coord
                    * self.layer_height
            }
            None => (layer_idx + 1) as Coord * self.layer_height,
        }
    }

    /// Set the z every layer is printed at; the vector index is the layer
    /// index.
    pub fn set_actual_z(&mut self, known_z: Vec<Coord>) {
        self.known_z = known_z;
    }
}

impl Default for TreeSupportSettings {
    fn default() -> Self {
        Self::new(TreeSupportMeshGroupSettings::default())
    }
}
