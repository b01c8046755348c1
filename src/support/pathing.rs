//! Layer pathing - downward propagation and merging of influence areas.
//!
//! Layers are processed top-down. For every live element on layer L a
//! sequence of area-increase candidates is tried, ordered from
//! cheapest-most-conservative to most-aggressive; the first candidate
//! producing a non-empty influence area on L-1 wins and defines the child
//! element. Elements that cannot continue either land on the model (when
//! allowed and a placeable surface is in reach) or are dropped and counted
//! as lost.
//!
//! After propagation, elements on the new layer whose influence areas
//! overlap are merged pairwise until a fixed point, under rules that keep
//! the merged branch's descent (to plate or model) viable.
//!
//! Elements of one layer propagate in parallel; merging is the layer-local
//! serial reduction. Iteration orders are stable so thread interleaving
//! never affects the result.

use super::element::{ElementIndex, SupportElement, SupportElementState};
use super::model_volumes::{AvoidanceType, ModelVolumes};
use super::settings::{AreaIncreaseSettings, LayerIndex, TreeSupportSettings};
use super::tips::TipsByLayer;
use super::{CancellationToken, TreeSupportError};
use crate::clipper::{self, OffsetJoinType};
use crate::geometry::{region_move_inside, ExPolygons};
use crate::CoordF;
use rayon::prelude::*;

/// Influence areas smaller than this are degenerate and rejected unless a
/// candidate runs with `no_error` (0.1 mm x 0.1 mm).
const TINY_AREA_THRESHOLD: CoordF = 100_000.0 * 100_000.0;

/// All support elements, indexed by layer.
pub type MoveBounds = Vec<Vec<SupportElement>>;

/// Aggregate diagnostics of a propagation run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathingStats {
    /// Branches that could not reach their required destination.
    pub lost: usize,
    /// Branches that additionally lost their gracious fallback.
    pub verylost: usize,
    /// Total number of branches that were propagated at least once.
    pub propagated: usize,
}

/// How a single element fared on one propagation step.
enum ElementOutcome {
    /// Normal propagation: a child element on the layer below.
    Child(SupportElement),
    /// The branch rests on the model: the element itself becomes terminal
    /// with the given landing footprint; no descendants are emitted.
    Landed(ExPolygons),
    /// No valid area was found; the branch ends here.
    Lost { verylost: bool },
}

/// Propagate all tips down to the build plate.
///
/// Returns the full element arena per layer. Elements keep stable indices
/// within their layer; merged-away elements stay in the arena with the
/// `deleted` bit set so parent references of the layer below remain valid.
pub fn create_layer_pathing(
    volumes: &ModelVolumes,
    settings: &TreeSupportSettings,
    tips: TipsByLayer,
    cancel: &CancellationToken,
) -> Result<(MoveBounds, PathingStats), TreeSupportError> {
    let layer_count = volumes.layer_count();
    let mut move_bounds: MoveBounds = vec![Vec::new(); layer_count];
    for (layer, elements) in tips {
        if layer >= 0 && (layer as usize) < layer_count {
            move_bounds[layer as usize].extend(elements);
        }
    }

    let mut stats = PathingStats::default();

    for layer in (1..layer_count as LayerIndex).rev() {
        if cancel.is_cancelled() {
            return Err(TreeSupportError::Cancelled);
        }
        if move_bounds[layer as usize].is_empty() {
            continue;
        }

        volumes.set_eviction_ceiling(layer);
        check_layer_invariants(&move_bounds, layer)?;

        // Propagate every live element of this layer in parallel; each
        // element only reads the shared volumes.
        let outcomes: Vec<(ElementIndex, ElementOutcome)> = move_bounds[layer as usize]
            .par_iter()
            .enumerate()
            .filter(|(_, element)| {
                !element.state.bits.deleted && !element.state.bits.landed
            })
            .map(|(idx, element)| {
                (
                    idx as ElementIndex,
                    increase_area_one_element(volumes, settings, element, layer - 1),
                )
            })
            .collect();

        let mut children: Vec<SupportElement> = Vec::with_capacity(outcomes.len());
        for (parent_idx, outcome) in outcomes {
            stats.propagated += 1;
            match outcome {
                ElementOutcome::Child(mut child) => {
                    child.parents = vec![parent_idx];
                    children.push(child);
                }
                ElementOutcome::Landed(footprint) => {
                    let element = &mut move_bounds[layer as usize][parent_idx as usize];
                    element.state.bits.landed = true;
                    element.influence_area = footprint;
                }
                ElementOutcome::Lost { verylost } => {
                    stats.lost += 1;
                    if verylost {
                        stats.verylost += 1;
                    }
                    let element = &mut move_bounds[layer as usize][parent_idx as usize];
                    element.state.bits.lost = true;
                    element.state.bits.verylost = verylost;
                }
            }
        }

        // Tips seeded at the layer below join the arena before merging.
        let tips_below = std::mem::take(&mut move_bounds[(layer - 1) as usize]);
        children.extend(tips_below);

        move_bounds[(layer - 1) as usize] =
            merge_influence_areas(volumes, settings, children, layer - 1);
    }

    prune_dead_branches(&mut move_bounds);

    Ok((move_bounds, stats))
}

/// Delete branch chains that end mid-air: every element above layer 0
/// must either have landed or have a live child below. Works bottom-up so
/// deletions cascade to the whole dead chain.
fn prune_dead_branches(move_bounds: &mut MoveBounds) {
    for layer in 1..move_bounds.len() {
        let mut has_live_child = vec![false; move_bounds[layer].len()];
        for child in &move_bounds[layer - 1] {
            if child.state.bits.deleted {
                continue;
            }
            for &parent in &child.parents {
                if (parent as usize) < has_live_child.len() {
                    has_live_child[parent as usize] = true;
                }
            }
        }

        for (idx, element) in move_bounds[layer].iter_mut().enumerate() {
            if !element.state.bits.deleted
                && !element.state.bits.landed
                && !has_live_child[idx]
            {
                element.state.bits.deleted = true;
            }
        }
    }
}

/// Sanity checkpoint before a layer is consumed; violations are internal
/// errors, not recoverable geometry failures.
fn check_layer_invariants(
    move_bounds: &MoveBounds,
    layer: LayerIndex,
) -> Result<(), TreeSupportError> {
    let above_len = move_bounds
        .get((layer + 1) as usize)
        .map(|arena| arena.len())
        .unwrap_or(0);

    for element in &move_bounds[layer as usize] {
        if element.state.layer_idx != layer {
            return Err(TreeSupportError::Internal(format!(
                "element on layer {} believes it is on layer {}",
                layer, element.state.layer_idx
            )));
        }
        if element.state.effective_radius_height > element.state.distance_to_top {
            return Err(TreeSupportError::Internal(format!(
                "effective radius height {} exceeds distance to top {}",
                element.state.effective_radius_height, element.state.distance_to_top
            )));
        }
        if element.parents.iter().any(|&p| p as usize >= above_len) {
            return Err(TreeSupportError::Internal(
                "parent index out of range for layer above".into(),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Single element propagation
// ============================================================================

/// Try all candidates for one element; fall back to landing, demotion or
/// loss.
fn increase_area_one_element(
    volumes: &ModelVolumes,
    settings: &TreeSupportSettings,
    element: &SupportElement,
    child_layer: LayerIndex,
) -> ElementOutcome {
    let state = &element.state;
    let to_model = !state.bits.to_buildplate && settings.support_rests_on_model;

    if let Some(child) = run_candidate_ladder(
        volumes,
        settings,
        state,
        &element.influence_area,
        child_layer,
        to_model,
    ) {
        return ElementOutcome::Child(child);
    }

    // Every candidate was rejected. Landing on the model beats giving
    // up: the element becomes terminal on its own layer when its area
    // already covers a placeable surface.
    if settings.support_rests_on_model {
        if let Some(footprint) = try_land(volumes, settings, state, &element.influence_area) {
            return ElementOutcome::Landed(footprint);
        }
    }

    // A buildplate branch may still demote to resting on the model.
    if state.bits.to_buildplate && settings.support_rests_on_model {
        let mut demoted = state.clone();
        demoted.bits.to_buildplate = false;
        demoted.bits.lost = true;
        if let Some(mut child) = run_candidate_ladder(
            volumes,
            settings,
            &demoted,
            &element.influence_area,
            child_layer,
            true,
        ) {
            child.state.bits.lost = true;
            return ElementOutcome::Child(child);
        }
    }

    ElementOutcome::Lost {
        verylost: !state.bits.to_model_gracious,
    }
}

/// Try the ordered candidate ladder; the first acceptable candidate
/// defines the child.
fn run_candidate_ladder(
    volumes: &ModelVolumes,
    settings: &TreeSupportSettings,
    state: &SupportElementState,
    influence_area: &ExPolygons,
    child_layer: LayerIndex,
    to_model: bool,
) -> Option<SupportElement> {
    for candidate in candidate_ladder(settings, state) {
        if let Some((area, effective_radius_height)) = try_candidate(
            volumes,
            settings,
            state,
            influence_area,
            child_layer,
            to_model,
            candidate,
        ) {
            return Some(build_child(
                settings,
                state,
                child_layer,
                candidate,
                area,
                effective_radius_height,
            ));
        }
    }
    None
}

/// The ordered candidate list, cheapest-most-conservative first.
///
/// Elements that already succeeded with a slow avoidance never regress to
/// the fast one, and elements that latched the safe (hole-free) avoidance
/// never regress to the unsafe one. The final candidate accepts even
/// degenerate geometry.
fn candidate_ladder(
    settings: &TreeSupportSettings,
    state: &SupportElementState,
) -> Vec<AreaIncreaseSettings> {
    let latched_safe = state.bits.can_use_safe_radius;
    let min_xy = state.bits.use_min_xy_dist;
    let slow = settings.maximum_move_distance_slow;
    let fast = settings.maximum_move_distance;

    // (increase_radius, allow_move, increase_speed). Spreading at the
    // careful speed is the norm; losing the radius increase is the first
    // concession, the full-speed move the second. Elements holding their
    // position (dont_move_until) grow in place first and translate only
    // as a forced last resort.
    const MOVING_TIERS: [(bool, bool, u8); 4] = [
        (true, true, 1), // careful move
        (false, true, 1),
        (true, true, 2), // full-speed move
        (false, true, 2),
    ];
    const LOCKED_TIERS: [(bool, bool, u8); 6] = [
        (true, false, 0),  // grow in place
        (false, false, 0), // hold position, keep radius
        (true, true, 1),   // forced careful move
        (false, true, 1),
        (true, true, 2), // forced full-speed move
        (false, true, 2),
    ];
    let tiers: &[(bool, bool, u8)] = if state.locked() {
        &LOCKED_TIERS
    } else {
        &MOVING_TIERS
    };

    let mut ladder = Vec::with_capacity(2 * tiers.len() + 1);
    let families: &[AvoidanceType] = if state.last_area_increase.avoidance_type.is_slow() {
        &[AvoidanceType::Slow]
    } else {
        &[AvoidanceType::Fast, AvoidanceType::Slow]
    };

    for &family in families {
        for &(increase_radius, allow_move, speed) in tiers {
            // Slow avoidance pairs with the careful move budget only.
            if family.is_slow() && speed == 2 {
                continue;
            }
            let increase_speed = match speed {
                0 => 0,
                1 => slow,
                _ => fast,
            };
            let (safe_kind, plain_kind) = match family {
                AvoidanceType::Slow | AvoidanceType::SlowSafe => {
                    (AvoidanceType::SlowSafe, AvoidanceType::Slow)
                }
                _ => (AvoidanceType::FastSafe, AvoidanceType::Fast),
            };

            // Safe first so the latch can engage; unsafe only while the
            // latch is open.
            ladder.push(AreaIncreaseSettings {
                avoidance_type: safe_kind,
                increase_speed,
                increase_radius,
                no_error: false,
                use_min_distance: min_xy,
                allow_move,
            });
            if !latched_safe {
                ladder.push(AreaIncreaseSettings {
                    avoidance_type: plain_kind,
                    increase_speed,
                    increase_radius,
                    no_error: false,
                    use_min_distance: min_xy,
                    allow_move,
                });
            }
        }
    }

    // Last resort: accept degenerate geometry rather than losing the
    // branch outright.
    ladder.push(AreaIncreaseSettings {
        avoidance_type: if latched_safe {
            AvoidanceType::FastSafe
        } else {
            AvoidanceType::Fast
        },
        increase_speed: fast,
        increase_radius: false,
        no_error: true,
        use_min_distance: true,
        allow_move: true,
    });

    ladder
}

/// Evaluate one candidate. Returns the next-layer influence area and the
/// effective radius height it was computed with, or `None` when rejected.
fn try_candidate(
    volumes: &ModelVolumes,
    settings: &TreeSupportSettings,
    state: &SupportElementState,
    influence_area: &ExPolygons,
    child_layer: LayerIndex,
    to_model: bool,
    candidate: AreaIncreaseSettings,
) -> Option<(ExPolygons, u32)> {
    let effective_radius_height = if candidate.increase_radius {
        state.effective_radius_height + 1
    } else {
        state.effective_radius_height
    };
    let radius = settings.get_radius(
        effective_radius_height as usize,
        state.elephant_foot_increases,
    );

    let avoidance = volumes.get_avoidance(
        radius,
        child_layer,
        candidate.avoidance_type,
        to_model,
        candidate.use_min_distance,
    );

    let grown = if candidate.increase_speed > 0 {
        clipper::offset(influence_area, candidate.increase_speed, OffsetJoinType::Round)
    } else {
        influence_area.to_vec()
    };

    let mut area = clipper::difference(&grown, &avoidance);
    if !candidate.allow_move {
        // No translation: the area may only shrink in place.
        area = clipper::intersection(&area, influence_area);
    }

    if area.is_empty() {
        return None;
    }
    if !candidate.no_error && clipper::total_area(&area) < TINY_AREA_THRESHOLD {
        return None;
    }

    Some((area, effective_radius_height))
}

/// Construct the child element for an accepted candidate.
fn build_child(
    settings: &TreeSupportSettings,
    parent: &SupportElementState,
    child_layer: LayerIndex,
    candidate: AreaIncreaseSettings,
    area: ExPolygons,
    effective_radius_height: u32,
) -> SupportElement {
    let mut state = parent.propagate_down();
    state.effective_radius_height = effective_radius_height;
    state.last_area_increase = candidate;
    if candidate.avoidance_type.is_safe() {
        state.bits.can_use_safe_radius = true;
    }

    if candidate.allow_move {
        let cap = if candidate.increase_speed > 0 {
            candidate.increase_speed
        } else {
            settings.maximum_move_distance
        };
        let hint = parent
            .next_position
            .step_towards(&parent.target_position, cap);
        state.next_position = region_move_inside(&area, &hint);
        if parent.locked() {
            // The element was forced to move before its hold expired.
            state.dont_move_until = 0;
        }
    } else {
        state.next_position = region_move_inside(&area, &parent.next_position);
    }

    // Near the plate the trunk widens toward bp_radius; count the layers
    // that still need widening.
    if child_layer < settings.layer_start_bp_radius
        && state.radius(settings) < settings.recommended_min_radius(child_layer)
    {
        state.elephant_foot_increases += 1.0;
    }

    SupportElement::new(state, area)
}

/// Terminal landing: the element's own influence area already covers a
/// placeable model surface. Returns the landing footprint.
fn try_land(
    volumes: &ModelVolumes,
    settings: &TreeSupportSettings,
    state: &SupportElementState,
    influence_area: &ExPolygons,
) -> Option<ExPolygons> {
    // Too-short branches are culled instead of landing.
    if (state.distance_to_top as usize) < settings.min_dtt_to_model {
        return None;
    }

    let radius = settings.get_radius(
        state.effective_radius_height as usize,
        state.elephant_foot_increases,
    );
    let placeable = volumes.get_placeable(radius, state.layer_idx);
    if placeable.is_empty() {
        return None;
    }

    let landing = clipper::intersection(influence_area, &placeable);
    if landing.is_empty() {
        return None;
    }
    Some(landing)
}

// ============================================================================
// Merging
// ============================================================================

/// Merge overlapping influence areas within one layer until no viable
/// pair remains.
///
/// Pairs are processed in a deterministic order (decreasing intersection
/// area, ties by element index). The merged element replaces the
/// lower-index slot; the other slot stays in the arena with the `deleted`
/// bit set so element indices remain stable.
pub fn merge_influence_areas(
    volumes: &ModelVolumes,
    settings: &TreeSupportSettings,
    mut elements: Vec<SupportElement>,
    layer: LayerIndex,
) -> Vec<SupportElement> {
    if elements.len() < 2 {
        return elements;
    }

    loop {
        // Collect all currently viable pairs with their overlap areas.
        let candidates: Vec<(usize, usize)> = {
            let live: Vec<usize> = (0..elements.len())
                .filter(|&i| {
                    !elements[i].state.bits.deleted && !elements[i].state.bits.landed
                })
                .collect();

            let mut pairs: Vec<(CoordF, usize, usize)> = Vec::new();
            for (pos, &i) in live.iter().enumerate() {
                for &j in &live[pos + 1..] {
                    if let Some(overlap) = merge_overlap(settings, &elements[i], &elements[j]) {
                        pairs.push((overlap, i, j));
                    }
                }
            }
            pairs.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.cmp(&b.2))
            });
            pairs.into_iter().map(|(_, i, j)| (i, j)).collect()
        };

        if candidates.is_empty() {
            return elements;
        }

        let mut consumed = vec![false; elements.len()];
        let mut merged_any = false;
        for (i, j) in candidates {
            if consumed[i] || consumed[j] {
                continue;
            }
            if let Some(merged) = try_merge_pair(volumes, settings, &elements[i], &elements[j], layer)
            {
                consumed[i] = true;
                consumed[j] = true;
                elements[j].state.bits.deleted = true;
                elements[i] = merged;
                merged_any = true;
            }
        }

        if !merged_any {
            return elements;
        }
    }
}

/// Quick overlap screen for a pair: ancestry, then intersection of the
/// influence areas inflated by each branch's radius (two trunks merge
/// when their physical circles could touch, not only when their
/// centerline regions already overlap). Returns the overlap area when
/// the pair is worth a full merge attempt.
fn merge_overlap(
    settings: &TreeSupportSettings,
    a: &SupportElement,
    b: &SupportElement,
) -> Option<CoordF> {
    // Elements descending from a common ancestor on the layer above are
    // two arms of the same branch; they do not merge with themselves.
    if a.parents.iter().any(|p| b.parents.contains(p)) {
        return None;
    }

    let intersection = clipper::intersection(
        &clipper::offset(&a.influence_area, a.radius(settings), OffsetJoinType::Round),
        &clipper::offset(&b.influence_area, b.radius(settings), OffsetJoinType::Round),
    );
    if intersection.is_empty() {
        return None;
    }
    Some(clipper::total_area(&intersection))
}

/// Attempt to merge one pair under the combined-radius constraint.
fn try_merge_pair(
    volumes: &ModelVolumes,
    settings: &TreeSupportSettings,
    a: &SupportElement,
    b: &SupportElement,
    layer: LayerIndex,
) -> Option<SupportElement> {
    let sa = &a.state;
    let sb = &b.state;

    let merged_dtt = sa.distance_to_top.max(sb.distance_to_top);
    let merged_elephant = sa.elephant_foot_increases + sb.elephant_foot_increases;
    let merged_radius = settings.get_radius(merged_dtt as usize, merged_elephant);

    // A to-model branch absorbing a to-buildplate branch may only gain a
    // bounded amount of radius.
    let mixing = sa.bits.to_buildplate != sb.bits.to_buildplate;
    let mut increased_to_model_radius = sa.increased_to_model_radius.max(sb.increased_to_model_radius);
    if mixing {
        let gain = merged_radius - a.radius(settings).max(b.radius(settings));
        increased_to_model_radius += gain.max(0);
        if increased_to_model_radius > settings.max_to_model_radius_increase {
            return None;
        }
    }

    let to_buildplate = sa.bits.to_buildplate || sb.bits.to_buildplate;
    let can_use_safe_radius = sa.bits.can_use_safe_radius && sb.bits.can_use_safe_radius;
    let use_min_xy_dist = sa.bits.use_min_xy_dist && sb.bits.use_min_xy_dist;
    let to_model = !to_buildplate && settings.support_rests_on_model;

    // The merged trunk must still fit somewhere in the shared area: the
    // radius-inflated influence areas must overlap outside the avoidance
    // for the combined radius.
    let kind = if can_use_safe_radius {
        AvoidanceType::FastSafe
    } else {
        AvoidanceType::Fast
    };
    let avoidance = volumes.get_avoidance(merged_radius, layer, kind, to_model, use_min_xy_dist);
    let intersection = clipper::intersection(
        &clipper::offset(&a.influence_area, a.radius(settings), OffsetJoinType::Round),
        &clipper::offset(&b.influence_area, b.radius(settings), OffsetJoinType::Round),
    );
    let influence = clipper::difference(&intersection, &avoidance);
    if influence.is_empty() {
        return None;
    }

    // The older branch gives the merged element its identity.
    let (primary, _secondary) = if sa.distance_to_top >= sb.distance_to_top {
        (sa, sb)
    } else {
        (sb, sa)
    };

    let mut state = primary.clone();
    state.distance_to_top = merged_dtt;
    state.effective_radius_height = sa.effective_radius_height.max(sb.effective_radius_height);
    state.elephant_foot_increases = merged_elephant;
    state.increased_to_model_radius = increased_to_model_radius;
    state.bits.to_buildplate = to_buildplate;
    state.bits.to_model_gracious = sa.bits.to_model_gracious && sb.bits.to_model_gracious;
    state.bits.supports_roof = sa.bits.supports_roof || sb.bits.supports_roof;
    state.bits.can_use_safe_radius = can_use_safe_radius;
    state.bits.use_min_xy_dist = use_min_xy_dist;
    state.bits.lost = sa.bits.lost && sb.bits.lost;
    state.missing_roof_layers = sa.missing_roof_layers.max(sb.missing_roof_layers);
    // A merge counts as movement.
    state.dont_move_until = 0;
    state.result_on_layer = None;
    state.next_position = region_move_inside(
        &influence,
        &crate::geometry::Point::new(
            (sa.next_position.x + sb.next_position.x) / 2,
            (sa.next_position.y + sb.next_position.y) / 2,
        ),
    );

    let mut parents: Vec<ElementIndex> = a.parents.clone();
    for p in &b.parents {
        if !parents.contains(p) {
            parents.push(*p);
        }
    }
    parents.sort_unstable();

    Some(SupportElement::with_parents(state, parents, influence))
}
