//! Support elements - the nodes of the branch tree.
//!
//! A `SupportElement` is one node on one layer: its mutable per-layer
//! state plus the influence area (the region its centerline may still
//! occupy) and the indices of its parents on the layer above. Elements are
//! stored in a flat arena per layer; `parents` holds indices into the
//! arena of `layer_idx + 1`. Children are always exactly one layer below
//! their parents, so the branch graph is a DAG by construction.

use super::settings::{AreaIncreaseSettings, LayerIndex, TreeSupportSettings};
use crate::geometry::{ExPolygons, Point};
use crate::Coord;
use crate::CoordF;

/// Boolean state of a support element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupportElementStateBits {
    /// The element tries to reach the build plate.
    pub to_buildplate: bool,
    /// The branch can rest completely on a flat surface, be it build
    /// plate or model.
    pub to_model_gracious: bool,
    /// Whether the minimum xy distance may be used for avoidance queries.
    pub use_min_xy_dist: bool,
    /// This element or some parent supports a roof interface.
    pub supports_roof: bool,
    /// The influence area can use the hole-free avoidance: it will not
    /// encounter holes on its way down.
    pub can_use_safe_radius: bool,
    /// Skip the ovalisation to parent and children when drawing the final
    /// circles.
    pub skip_ovalisation: bool,
    /// The branch has landed on the model; no descendants are emitted
    /// below this layer.
    pub landed: bool,
    /// Likely a lost branch, diagnostic information.
    pub lost: bool,
    /// Lost even its gracious fallback, diagnostic information.
    pub verylost: bool,
    /// Not valid anymore, to be deleted.
    pub deleted: bool,
    /// General purpose flag marking a visited element.
    pub marked: bool,
}

/// Per-layer state of a support element, copied and mutated on each
/// downward propagation step.
#[derive(Debug, Clone, PartialEq)]
pub struct SupportElementState {
    /// Boolean flags.
    pub bits: SupportElementStateBits,
    /// The layer this element wants to reach (where its branch started).
    pub target_height: LayerIndex,
    /// The position this element wants to support on `target_height`.
    pub target_position: Point,
    /// The next position this element wants to reach. A suggestion
    /// regarding direction inside the influence area.
    pub next_position: Point,
    /// The layer this state lives on.
    pub layer_idx: LayerIndex,
    /// The effective distance to top regarding radius increases and
    /// collision calculations. Lags `distance_to_top` when the branch was
    /// forced to move without growing.
    pub effective_radius_height: u32,
    /// The number of layers below the topmost layer of this branch.
    pub distance_to_top: u32,
    /// The resulting center point around which a circle will be drawn
    /// later. Set by the centerer.
    pub result_on_layer: Option<Point>,
    /// Extra radius gained from merging with branches that could have
    /// reached the build plate. Only relevant for merging.
    pub increased_to_model_radius: Coord,
    /// Counter of elephant-foot widenings. Can be fractional for merge
    /// reasons.
    pub elephant_foot_increases: CoordF,
    /// The element refuses to move until this distance-to-top is reached.
    /// Set to 0 if the element had to move.
    pub dont_move_until: u32,
    /// Settings used to grow the influence area to its current state.
    pub last_area_increase: AreaIncreaseSettings,
    /// Roof layers still owed because the branch needed to move.
    pub missing_roof_layers: u32,
}

impl SupportElementState {
    /// Create the state of a fresh tip at `layer_idx` aiming at `position`.
    pub fn new_tip(layer_idx: LayerIndex, position: Point) -> Self {
        Self {
            bits: SupportElementStateBits::default(),
            target_height: layer_idx,
            target_position: position,
            next_position: position,
            layer_idx,
            effective_radius_height: 0,
            distance_to_top: 0,
            result_on_layer: None,
            increased_to_model_radius: 0,
            elephant_foot_increases: 0.0,
            dont_move_until: 0,
            last_area_increase: AreaIncreaseSettings::default(),
            missing_roof_layers: 0,
        }
    }

    /// Whether the centerer has placed this element.
    #[inline]
    pub fn result_on_layer_is_set(&self) -> bool {
        self.result_on_layer.is_some()
    }

    /// The element refuses translation while its distance-to-top is below
    /// `dont_move_until`.
    #[inline]
    pub fn locked(&self) -> bool {
        self.distance_to_top < self.dont_move_until
    }

    /// State of the child one layer below: new node, one more layer from
    /// the top, placement cleared.
    pub fn propagate_down(&self) -> Self {
        let mut dst = self.clone();
        dst.distance_to_top += 1;
        dst.layer_idx -= 1;
        dst.result_on_layer = None;
        dst.bits.skip_ovalisation = false;
        dst
    }

    /// The radius this element is drawn with.
    pub fn radius(&self, settings: &TreeSupportSettings) -> Coord {
        settings.get_radius(
            settings.effective_dtt(self.effective_radius_height, self.distance_to_top),
            self.elephant_foot_increases,
        )
    }

    /// The radius used for collision and avoidance queries. Can be smaller
    /// than [`Self::radius`] when the branch was forced to move without
    /// growing.
    pub fn collision_radius(&self, settings: &TreeSupportSettings) -> Coord {
        settings.get_radius(
            self.effective_radius_height as usize,
            self.elephant_foot_increases,
        )
    }
}

/// Stable element id within one layer arena.
pub type ElementIndex = u32;

/// One node of the branch tree: state, parents on the layer above, and the
/// influence area the centerline may occupy.
#[derive(Debug, Clone)]
pub struct SupportElement {
    /// Element state.
    pub state: SupportElementState,
    /// Indices of all elements on the layer above that this element
    /// supports.
    pub parents: Vec<ElementIndex>,
    /// The influence area. Replaced on every propagation step.
    pub influence_area: ExPolygons,
}

impl SupportElement {
    /// Create an element without parents (a tip).
    pub fn new(state: SupportElementState, influence_area: ExPolygons) -> Self {
        Self {
            state,
            parents: Vec::new(),
            influence_area,
        }
    }

    /// Create an element with parents.
    pub fn with_parents(
        state: SupportElementState,
        parents: Vec<ElementIndex>,
        influence_area: ExPolygons,
    ) -> Self {
        Self {
            state,
            parents,
            influence_area,
        }
    }

    /// The radius this element is drawn with.
    pub fn radius(&self, settings: &TreeSupportSettings) -> Coord {
        self.state.radius(settings)
    }

    /// The radius used for collision and avoidance queries.
    pub fn collision_radius(&self, settings: &TreeSupportSettings) -> Coord {
        self.state.collision_radius(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tip() {
        let tip = SupportElementState::new_tip(12, Point::new(100, 200));

        assert_eq!(tip.layer_idx, 12);
        assert_eq!(tip.target_height, 12);
        assert_eq!(tip.target_position, Point::new(100, 200));
        assert_eq!(tip.next_position, Point::new(100, 200));
        assert_eq!(tip.distance_to_top, 0);
        assert!(!tip.result_on_layer_is_set());
    }

    #[test]
    fn test_propagate_down() {
        let mut state = SupportElementState::new_tip(5, Point::zero());
        state.result_on_layer = Some(Point::new(1, 1));
        state.bits.skip_ovalisation = true;

        let child = state.propagate_down();

        assert_eq!(child.layer_idx, 4);
        assert_eq!(child.distance_to_top, 1);
        assert!(!child.result_on_layer_is_set());
        assert!(!child.bits.skip_ovalisation);
        // The source state is untouched.
        assert_eq!(state.layer_idx, 5);
    }

    #[test]
    fn test_locked() {
        let mut state = SupportElementState::new_tip(5, Point::zero());
        state.dont_move_until = 3;

        assert!(state.locked());
        state.distance_to_top = 3;
        assert!(!state.locked());
    }

    #[test]
    fn test_radius_grows_with_dtt() {
        let settings = TreeSupportSettings::default();
        let mut state = SupportElementState::new_tip(20, Point::zero());

        let r_tip = state.radius(&settings);
        assert_eq!(r_tip, settings.min_radius);

        state.distance_to_top = settings.tip_layers as u32;
        state.effective_radius_height = settings.tip_layers as u32;
        assert_eq!(state.radius(&settings), settings.branch_radius);
    }

    #[test]
    fn test_collision_radius_lags_radius() {
        let settings = TreeSupportSettings::default();
        let mut state = SupportElementState::new_tip(20, Point::zero());

        // Branch moved three layers without growing.
        state.distance_to_top = 3;
        state.effective_radius_height = 0;

        assert!(state.collision_radius(&settings) <= state.radius(&settings));
    }
}
