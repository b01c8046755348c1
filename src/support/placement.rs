//! Center placement and branch drawing.
//!
//! After propagation and merging are complete the element tree is frozen.
//! The centerer collapses each influence area to a single centerline point
//! per layer (`result_on_layer`), working bottom-up so every element stays
//! within the move budget of its already-placed children. The drawer then
//! rasterizes circles around the chosen centers, smooths radii along
//! branches, adds the parent-child ovalisation hulls and splits the result
//! into support, roof-interface and floor-interface regions per layer.

use super::element::SupportElement;
use super::model_volumes::{ModelVolumes, SUPPORT_TREE_COLLISION_RESOLUTION};
use super::pathing::MoveBounds;
use super::settings::{
    InterfacePreference, LayerIndex, TreeSupportSettings, SUPPORT_TREE_CIRCLE_RESOLUTION,
};
use super::{CancellationToken, SupportLayer, TreeSupportError};
use crate::clipper;
use crate::geometry::{region_move_inside, ExPolygon, ExPolygons, Point, Polygon};
use crate::{Coord, CoordF};
use rayon::prelude::*;
use std::collections::HashSet;

/// A regular polygon approximating a circle of `radius` around `center`.
pub(crate) fn circle_polygon(center: Point, radius: Coord) -> Polygon {
    let mut points = Vec::with_capacity(SUPPORT_TREE_CIRCLE_RESOLUTION);
    for i in 0..SUPPORT_TREE_CIRCLE_RESOLUTION {
        let angle =
            2.0 * std::f64::consts::PI * i as f64 / SUPPORT_TREE_CIRCLE_RESOLUTION as f64;
        points.push(Point::new(
            center.x + (radius as CoordF * angle.cos()).round() as Coord,
            center.y + (radius as CoordF * angle.sin()).round() as Coord,
        ));
    }
    Polygon::from_points(points)
}

// ============================================================================
// Centerer
// ============================================================================

/// Choose `result_on_layer` for every live element, bottom-up.
///
/// The chosen point must lie (1) inside the influence area, (2) outside
/// the collision for the element's radius and (3) within the move budget
/// of every child's chosen point. When no point satisfies all three, (3)
/// is relaxed first, then (2); (1) cannot fail by construction.
pub fn set_points_on_areas(
    move_bounds: &mut MoveBounds,
    volumes: &ModelVolumes,
    settings: &TreeSupportSettings,
) {
    let layer_count = move_bounds.len();

    for layer in 0..layer_count {
        // Gather the already-placed child centers per parent index.
        let mut child_centers: Vec<Vec<Point>> = vec![Vec::new(); move_bounds[layer].len()];
        if layer > 0 {
            for child in &move_bounds[layer - 1] {
                if child.state.bits.deleted {
                    continue;
                }
                if let Some(result) = child.state.result_on_layer {
                    for &parent in &child.parents {
                        if (parent as usize) < child_centers.len() {
                            child_centers[parent as usize].push(result);
                        }
                    }
                }
            }
        }

        for idx in 0..move_bounds[layer].len() {
            let element = &move_bounds[layer][idx];
            if element.state.bits.deleted || element.state.result_on_layer_is_set() {
                continue;
            }

            let radius = element.radius(settings);
            let collision =
                volumes.get_collision(radius, layer as LayerIndex, element.state.bits.use_min_xy_dist);

            let influence = element.influence_area.clone();
            let clear = clipper::difference(&influence, &collision);

            // Constrain to the move budget around each child center.
            let mut constrained = clear.clone();
            for child_center in &child_centers[idx] {
                if constrained.is_empty() {
                    break;
                }
                let reach = ExPolygon::new(circle_polygon(
                    *child_center,
                    settings.maximum_move_distance,
                ));
                constrained = clipper::intersection(&constrained, &[reach]);
            }

            let hint = element.state.target_position;
            let (point, relaxed) = if !constrained.is_empty() {
                (choose_center(&constrained, hint), false)
            } else if !clear.is_empty() {
                (choose_center(&clear, hint), true)
            } else {
                (choose_center(&influence, hint), true)
            };

            let element = &mut move_bounds[layer][idx];
            element.state.result_on_layer = Some(point);
            if relaxed {
                // The centerline is discontinuous here; a hull would
                // smear across the gap.
                element.state.bits.skip_ovalisation = true;
            }
        }
    }
}

/// The centroid of the largest component, pulled inside the region if the
/// component is concave; ties resolved by distance to `hint`.
fn choose_center(region: &ExPolygons, hint: Point) -> Point {
    let mut best: Option<(&ExPolygon, CoordF)> = None;
    for component in region {
        let area = component.area();
        let replace = match best {
            None => true,
            Some((current, current_area)) => {
                area > current_area * 1.01
                    || (area > current_area * 0.99
                        && component.contour.centroid().distance(&hint)
                            < current.contour.centroid().distance(&hint))
            }
        };
        if replace {
            best = Some((component, area));
        }
    }

    match best {
        Some((component, _)) => {
            let centroid = component.contour.centroid();
            if component.contains_point(&centroid) {
                centroid
            } else {
                region_move_inside(region, &centroid)
            }
        }
        None => hint,
    }
}

// ============================================================================
// Drawer
// ============================================================================

/// Which output region an element's circle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementRole {
    Support,
    RoofInterface,
    FloorInterface,
}

/// Rasterize all branches into per-layer support, roof-interface and
/// floor-interface polygons.
pub fn draw_areas(
    move_bounds: &MoveBounds,
    volumes: &ModelVolumes,
    settings: &TreeSupportSettings,
    cancel: &CancellationToken,
) -> Result<Vec<SupportLayer>, TreeSupportError> {
    let drawn_radii = smooth_branch_radii(move_bounds, settings);
    let roles = assign_roles(move_bounds, settings);

    let layers: Vec<SupportLayer> = move_bounds
        .par_iter()
        .enumerate()
        .map(|(layer, elements)| {
            if cancel.is_cancelled() {
                return SupportLayer::empty(layer as LayerIndex, 0);
            }
            draw_layer(
                move_bounds,
                volumes,
                settings,
                &drawn_radii,
                &roles,
                layer,
                elements,
            )
        })
        .collect();

    if cancel.is_cancelled() {
        return Err(TreeSupportError::Cancelled);
    }
    Ok(layers)
}

/// Radii for drawing, limited so neighbors along a branch never step more
/// than the widening schedule allows. Merges can make the nominal radius
/// jump; the printed trunk widens gradually instead.
fn smooth_branch_radii(move_bounds: &MoveBounds, settings: &TreeSupportSettings) -> Vec<Vec<Coord>> {
    let max_step = (settings
        .branch_radius_increase_per_layer
        .max(settings.bp_radius_increase_per_layer) as Coord)
        .max(SUPPORT_TREE_COLLISION_RESOLUTION / 2);

    let mut drawn: Vec<Vec<Coord>> = move_bounds
        .iter()
        .map(|elements| {
            elements
                .iter()
                .map(|e| e.radius(settings))
                .collect::<Vec<_>>()
        })
        .collect();

    // Top-down: a child may exceed its widest parent by one step only.
    for layer in (0..move_bounds.len().saturating_sub(1)).rev() {
        for (idx, element) in move_bounds[layer].iter().enumerate() {
            if element.state.bits.deleted || element.parents.is_empty() {
                continue;
            }
            let parent_max = element
                .parents
                .iter()
                .map(|&p| drawn[layer + 1][p as usize])
                .max()
                .unwrap_or(drawn[layer][idx]);
            drawn[layer][idx] = drawn[layer][idx].min(parent_max + max_step);
        }
    }
    drawn
}

/// Classify every element as support, roof interface or floor interface.
fn assign_roles(move_bounds: &MoveBounds, settings: &TreeSupportSettings) -> Vec<Vec<ElementRole>> {
    let mut roles: Vec<Vec<ElementRole>> = move_bounds
        .iter()
        .map(|elements| {
            elements
                .iter()
                .map(|e| {
                    if e.state.bits.supports_roof
                        && (e.state.distance_to_top as usize) < settings.support_roof_layers
                    {
                        ElementRole::RoofInterface
                    } else {
                        ElementRole::Support
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect();

    // The bottom-most layers of a branch resting on the model become the
    // floor interface.
    if settings.support_bottom_layers > 0 {
        for layer in 0..move_bounds.len() {
            let mut frontier: HashSet<usize> = move_bounds[layer]
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.state.bits.deleted && e.state.bits.landed)
                .map(|(idx, _)| idx)
                .collect();

            let mut current = layer;
            let mut remaining = settings.support_bottom_layers;
            while remaining > 0 && !frontier.is_empty() {
                let mut next = HashSet::new();
                for &idx in &frontier {
                    roles[current][idx] = ElementRole::FloorInterface;
                    for &parent in &move_bounds[current][idx].parents {
                        next.insert(parent as usize);
                    }
                }
                remaining -= 1;
                current += 1;
                if current >= move_bounds.len() {
                    break;
                }
                frontier = next;
            }
        }
    }
    roles
}

#[allow(clippy::too_many_arguments)]
fn draw_layer(
    move_bounds: &MoveBounds,
    volumes: &ModelVolumes,
    settings: &TreeSupportSettings,
    drawn_radii: &[Vec<Coord>],
    roles: &[Vec<ElementRole>],
    layer: usize,
    elements: &[SupportElement],
) -> SupportLayer {
    let mut support: ExPolygons = Vec::new();
    let mut roof: ExPolygons = Vec::new();
    let mut floor: ExPolygons = Vec::new();

    for (idx, element) in elements.iter().enumerate() {
        if element.state.bits.deleted {
            continue;
        }
        let Some(center) = element.state.result_on_layer else {
            continue;
        };

        let mut pieces: ExPolygons =
            vec![ExPolygon::new(circle_polygon(center, drawn_radii[layer][idx]))];

        // Ovalisation: hull the circle with each parent's circle so the
        // trunk steps smoothly between layers.
        if !element.state.bits.skip_ovalisation && layer + 1 < move_bounds.len() {
            for &parent_idx in &element.parents {
                let parent = &move_bounds[layer + 1][parent_idx as usize];
                if parent.state.bits.skip_ovalisation {
                    continue;
                }
                let Some(parent_center) = parent.state.result_on_layer else {
                    continue;
                };
                let mut hull_points = circle_polygon(center, drawn_radii[layer][idx])
                    .points()
                    .to_vec();
                hull_points.extend(
                    circle_polygon(parent_center, drawn_radii[layer + 1][parent_idx as usize])
                        .points(),
                );
                pieces.push(ExPolygon::new(clipper::convex_hull(&hull_points)));
            }
        }

        match roles[layer][idx] {
            ElementRole::Support => support.extend(pieces),
            ElementRole::RoofInterface => roof.extend(pieces),
            ElementRole::FloorInterface => floor.extend(pieces),
        }
    }

    if support.is_empty() && roof.is_empty() && floor.is_empty() {
        return SupportLayer::empty(
            layer as LayerIndex,
            settings.get_actual_z(layer as LayerIndex),
        );
    }

    // Clip everything back into the valid region: never into the model or
    // its horizontal clearance.
    let forbidden = volumes.get_collision(0, layer as LayerIndex, false);
    let mut support = clipper::difference(&clipper::union_all(&support), &forbidden);
    let mut roof = clipper::difference(&clipper::union_all(&roof), &forbidden);
    let mut floor = clipper::difference(&clipper::union_all(&floor), &forbidden);

    let interface: ExPolygons = clipper::union(&roof, &floor);
    match settings.interface_preference {
        InterfacePreference::InterfaceAreaOverwritesSupport => {
            support = clipper::difference(&support, &interface);
        }
        InterfacePreference::SupportAreaOverwritesInterface => {
            roof = clipper::difference(&roof, &support);
            floor = clipper::difference(&floor, &support);
        }
        // The line-level preferences resolve at pattern generation, after
        // this core; geometrically both regions are kept.
        InterfacePreference::InterfaceLinesOverwriteSupport
        | InterfacePreference::SupportLinesOverwriteInterface
        | InterfacePreference::Nothing => {}
    }

    SupportLayer {
        layer_idx: layer as LayerIndex,
        print_z: settings.get_actual_z(layer as LayerIndex),
        support_base: clipper::simplify(&support, settings.resolution),
        support_roof_interface: clipper::simplify(&roof, settings.resolution),
        support_floor_interface: clipper::simplify(&floor, settings.resolution),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::element::SupportElementState;
    use crate::geometry::region_contains_point;
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

    fn empty_volumes(layers: usize, settings: &TreeSupportSettings) -> ModelVolumes {
        ModelVolumes::new(
            settings.clone(),
            vec![Vec::new(); layers],
            Vec::new(),
            Vec::new(),
            CancellationToken::new(),
        )
    }

    fn element_with_area(
        layer: LayerIndex,
        position: Point,
        area: ExPolygons,
        parents: Vec<u32>,
    ) -> SupportElement {
        let state = SupportElementState::new_tip(layer, position);
        SupportElement::with_parents(state, parents, area)
    }

    #[test]
    fn test_circle_polygon_shape() {
        let circle = circle_polygon(Point::zero(), scale(1.0));
        assert_eq!(circle.len(), SUPPORT_TREE_CIRCLE_RESOLUTION);

        for p in circle.points() {
            let dist = p.distance(&Point::zero());
            assert!((dist - scale(1.0) as CoordF).abs() < scale(1.0) as CoordF * 0.01);
        }
        // Counter-clockwise contour.
        assert!(circle.signed_area() > 0.0);
    }

    #[test]
    fn test_choose_center_prefers_centroid() {
        let region = vec![square_mm(4.0, Point::new_scale(3.0, 3.0))];
        let center = choose_center(&region, Point::zero());
        assert!(center.distance(&Point::new_scale(3.0, 3.0)) < scale(0.05) as CoordF);
    }

    #[test]
    fn test_set_points_within_influence() {
        let settings = TreeSupportSettings::default();
        let volumes = empty_volumes(2, &settings);

        let area = vec![square_mm(2.0, Point::new_scale(1.0, 0.0))];
        let mut move_bounds: MoveBounds = vec![
            vec![element_with_area(0, Point::zero(), area.clone(), Vec::new())],
            Vec::new(),
        ];

        set_points_on_areas(&mut move_bounds, &volumes, &settings);

        let result = move_bounds[0][0].state.result_on_layer.expect("placed");
        assert!(region_contains_point(&area, &result));
    }

    #[test]
    fn test_set_points_respects_children() {
        let settings = TreeSupportSettings::default();
        let volumes = empty_volumes(3, &settings);

        // Child at layer 0 placed on the left edge of the parent's wide
        // influence area: the parent must stay within the move budget.
        let child_area = vec![square_mm(1.0, Point::zero())];
        let parent_area = vec![square_mm(30.0, Point::zero())];

        let mut move_bounds: MoveBounds = vec![
            vec![element_with_area(0, Point::zero(), child_area, vec![0])],
            vec![element_with_area(1, Point::zero(), parent_area, Vec::new())],
            Vec::new(),
        ];

        set_points_on_areas(&mut move_bounds, &volumes, &settings);

        let child_point = move_bounds[0][0].state.result_on_layer.unwrap();
        let parent_point = move_bounds[1][0].state.result_on_layer.unwrap();
        let dist = child_point.distance(&parent_point);
        assert!(
            dist <= settings.maximum_move_distance as CoordF * 1.05,
            "parent strayed {} from its child (budget {})",
            dist,
            settings.maximum_move_distance
        );
    }

    #[test]
    fn test_draw_areas_single_element() {
        let settings = TreeSupportSettings::default();
        let volumes = empty_volumes(1, &settings);

        let mut element =
            element_with_area(0, Point::zero(), vec![square_mm(2.0, Point::zero())], vec![]);
        element.state.result_on_layer = Some(Point::zero());
        let move_bounds: MoveBounds = vec![vec![element]];

        let layers =
            draw_areas(&move_bounds, &volumes, &settings, &CancellationToken::new()).unwrap();
        assert_eq!(layers.len(), 1);
        assert!(!layers[0].support_base.is_empty());
        assert!(region_contains_point(&layers[0].support_base, &Point::zero()));
    }

    #[test]
    fn test_draw_areas_roof_role() {
        let settings = TreeSupportSettings::default();
        assert!(settings.support_roof_layers > 0);
        let volumes = empty_volumes(1, &settings);

        let mut element =
            element_with_area(0, Point::zero(), vec![square_mm(2.0, Point::zero())], vec![]);
        element.state.bits.supports_roof = true; // dtt 0 < roof layers
        element.state.result_on_layer = Some(Point::zero());
        let move_bounds: MoveBounds = vec![vec![element]];

        let layers =
            draw_areas(&move_bounds, &volumes, &settings, &CancellationToken::new()).unwrap();
        assert!(layers[0].support_base.is_empty());
        assert!(!layers[0].support_roof_interface.is_empty());
    }

    #[test]
    fn test_draw_areas_keeps_clear_of_model() {
        let settings = TreeSupportSettings::default();
        let volumes = ModelVolumes::new(
            settings.clone(),
            vec![vec![square_mm(4.0, Point::new_scale(1.0, 0.0))]],
            Vec::new(),
            Vec::new(),
            CancellationToken::new(),
        );

        let mut element =
            element_with_area(0, Point::new_scale(-3.0, 0.0), vec![square_mm(8.0, Point::new_scale(-3.0, 0.0))], vec![]);
        element.state.result_on_layer = Some(Point::new_scale(-3.0, 0.0));
        let move_bounds: MoveBounds = vec![vec![element]];

        let layers =
            draw_areas(&move_bounds, &volumes, &settings, &CancellationToken::new()).unwrap();
        // The model interior stays free of support.
        assert!(!region_contains_point(
            &layers[0].support_base,
            &Point::new_scale(1.0, 0.0)
        ));
    }

    #[test]
    fn test_ovalisation_bridges_offset_circles() {
        let settings = TreeSupportSettings::default();
        let volumes = empty_volumes(2, &settings);

        let mut child = element_with_area(
            0,
            Point::zero(),
            vec![square_mm(6.0, Point::zero())],
            vec![0],
        );
        child.state.result_on_layer = Some(Point::zero());
        child.state.distance_to_top = settings.tip_layers as u32;
        child.state.effective_radius_height = settings.tip_layers as u32;

        let offset_center = Point::new_scale(1.5, 0.0);
        let mut parent = element_with_area(
            1,
            offset_center,
            vec![square_mm(6.0, offset_center)],
            vec![],
        );
        parent.state.result_on_layer = Some(offset_center);
        parent.state.distance_to_top = settings.tip_layers as u32;
        parent.state.effective_radius_height = settings.tip_layers as u32;

        let move_bounds: MoveBounds = vec![vec![child], vec![parent]];
        let layers =
            draw_areas(&move_bounds, &volumes, &settings, &CancellationToken::new()).unwrap();

        // The hull covers the midpoint between the two circles.
        assert!(region_contains_point(
            &layers[0].support_base,
            &Point::new_scale(0.75, 0.0)
        ));
    }

    #[test]
    fn test_smooth_branch_radii_caps_jumps() {
        let settings = TreeSupportSettings::default();

        // Parent thin, child (merged) nominally thick.
        let mut child = element_with_area(0, Point::zero(), Vec::new(), vec![0]);
        child.state.distance_to_top = 40;
        child.state.effective_radius_height = 40;
        child.state.elephant_foot_increases = 10.0;

        let parent = element_with_area(1, Point::zero(), Vec::new(), vec![]);

        let move_bounds: MoveBounds = vec![vec![child], vec![parent]];
        let drawn = smooth_branch_radii(&move_bounds, &settings);

        let nominal = move_bounds[0][0].radius(&settings);
        assert!(drawn[0][0] < nominal);
        assert!(drawn[0][0] >= drawn[1][0]);
    }

    #[test]
    fn test_interface_preference_subtraction() {
        let settings = {
            let mut group = super::super::settings::TreeSupportMeshGroupSettings::default();
            group.interface_preference = InterfacePreference::SupportAreaOverwritesInterface;
            TreeSupportSettings::new(group)
        };
        let volumes = empty_volumes(1, &settings);

        // One roof element and one support element at the same spot.
        let mut roof_elem =
            element_with_area(0, Point::zero(), vec![square_mm(2.0, Point::zero())], vec![]);
        roof_elem.state.bits.supports_roof = true;
        roof_elem.state.result_on_layer = Some(Point::zero());

        let mut support_elem =
            element_with_area(0, Point::zero(), vec![square_mm(2.0, Point::zero())], vec![]);
        support_elem.state.result_on_layer = Some(Point::zero());
        support_elem.state.distance_to_top = (settings.support_roof_layers + 1) as u32;

        let move_bounds: MoveBounds = vec![vec![roof_elem, support_elem]];
        let layers =
            draw_areas(&move_bounds, &volumes, &settings, &CancellationToken::new()).unwrap();

        // Support wins the overlap; roof retreats.
        assert!(!layers[0].support_base.is_empty());
        assert!(!clipper::overlaps(
            &layers[0].support_base,
            &layers[0].support_roof_interface
        ));
    }

    #[test]
    fn test_draw_areas_cancellation() {
        let settings = TreeSupportSettings::default();
        let volumes = empty_volumes(1, &settings);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = draw_areas(&vec![Vec::new()], &volumes, &settings, &cancel);
        assert!(matches!(result, Err(TreeSupportError::Cancelled)));
    }
}
