//! Collision and avoidance volume caches.
//!
//! `ModelVolumes` pre-computes and caches, per layer and per sampled
//! radius, the polygonal obstacle fields the propagation queries:
//!
//! 1. **Collision**: where a branch of radius r may not be on a layer
//!    (model grown by r + clearance, including the z-distance window).
//! 2. **Avoidance**: where a branch of radius r may not be if it still
//!    wants to descend to the build plate (or, for the to-model variants,
//!    to a placeable model surface), accounting for the per-layer move
//!    budget.
//! 3. **Placeable**: flat-enough upward-facing model regions a branch of
//!    radius r may rest on.
//!
//! Radii are quantized to a coarse sampling plus an exponential ladder so
//! the number of distinct cached radii stays bounded; queries round up to
//! the next sampled value. Every `get_*` is total: on a cache miss the
//! value is computed synchronously. Concurrent requests for the same key
//! block until the first fill completes (single flight); distinct keys
//! fill in parallel.

use super::settings::{LayerIndex, TreeSupportSettings};
use super::CancellationToken;
use crate::clipper::{self, OffsetJoinType};
use crate::geometry::ExPolygons;
use crate::Coord;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, RwLock};

/// Resolution of the radius sampling below the exponential ladder.
pub const SUPPORT_TREE_COLLISION_RESOLUTION: Coord = 500_000; // 0.5 mm

/// Radius above which sampling becomes exponential.
pub const SUPPORT_TREE_EXPONENTIAL_THRESHOLD: Coord = 1_500_000; // 1.5 mm

/// Growth factor of the exponential radius ladder.
pub const SUPPORT_TREE_EXPONENTIAL_FACTOR: f64 = 1.5;

/// Whether user-painted support blockers are unioned into all collisions.
pub const SUPPORT_TREE_AVOID_SUPPORT_BLOCKER: bool = true;

/// Entry bound per cached field before LRU eviction kicks in.
const CACHE_CAPACITY: usize = 16 * 1024;

/// Which avoidance field to query.
///
/// `Fast` uses the full per-layer move budget; `Slow` the careful one.
/// The `Safe` variants are computed over hole-free collisions, so a branch
/// staying outside them never hovers over a model hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AvoidanceType {
    #[default]
    Fast,
    FastSafe,
    Slow,
    SlowSafe,
}

impl AvoidanceType {
    /// Whether this variant uses the careful move budget.
    #[inline]
    pub fn is_slow(self) -> bool {
        matches!(self, AvoidanceType::Slow | AvoidanceType::SlowSafe)
    }

    /// Whether this variant is computed over hole-free collisions.
    #[inline]
    pub fn is_safe(self) -> bool {
        matches!(self, AvoidanceType::FastSafe | AvoidanceType::SlowSafe)
    }
}

/// Key of a collision / placeable cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct VolumeKey {
    radius: Coord,
    layer: LayerIndex,
    min_xy: bool,
}

/// Key of an avoidance cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AvoidanceKey {
    radius: Coord,
    layer: LayerIndex,
    kind: AvoidanceType,
    to_model: bool,
    min_xy: bool,
}

trait CacheKey: Eq + Hash + Copy {
    fn layer(&self) -> LayerIndex;
}

impl CacheKey for VolumeKey {
    fn layer(&self) -> LayerIndex {
        self.layer
    }
}

impl CacheKey for AvoidanceKey {
    fn layer(&self) -> LayerIndex {
        self.layer
    }
}

/// A polygon cache with single-flight fills and size-bounded LRU eviction.
///
/// Readers either see a finished value or wait for the in-flight
/// computation of that same key; different keys compute in parallel.
/// Entries at or below the eviction ceiling are pinned: the pipeline
/// still descends toward them.
struct SingleFlightCache<K: CacheKey> {
    ready: RwLock<HashMap<K, Arc<ExPolygons>>>,
    in_flight: Mutex<Vec<K>>,
    fill_done: Condvar,
    lru: Mutex<Vec<K>>,
}

impl<K: CacheKey> SingleFlightCache<K> {
    fn new() -> Self {
        Self {
            ready: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(Vec::new()),
            fill_done: Condvar::new(),
            lru: Mutex::new(Vec::new()),
        }
    }

    fn get(&self, key: &K) -> Option<Arc<ExPolygons>> {
        let value = self.ready.read().unwrap().get(key).cloned();
        if value.is_some() {
            self.touch(key);
        }
        value
    }

    fn contains(&self, key: &K) -> bool {
        self.ready.read().unwrap().contains_key(key)
    }

    /// Return the cached value, or compute it with `fill`. Exactly one
    /// caller computes; the rest block until the value is ready.
    fn get_or_compute(&self, key: K, fill: impl FnOnce() -> ExPolygons) -> Arc<ExPolygons> {
        loop {
            if let Some(value) = self.get(&key) {
                return value;
            }

            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(value) = self.get(&key) {
                return value;
            }
            if !in_flight.contains(&key) {
                in_flight.push(key);
                break;
            }
            // Another worker is filling this key; wait for any fill to
            // finish, then re-check.
            let guard = self.fill_done.wait(in_flight).unwrap();
            drop(guard);
        }

        let value = Arc::new(fill());
        {
            let mut ready = self.ready.write().unwrap();
            ready.insert(key, value.clone());
        }
        self.touch(&key);

        let mut in_flight = self.in_flight.lock().unwrap();
        in_flight.retain(|k| *k != key);
        self.fill_done.notify_all();
        drop(in_flight);

        value
    }

    fn touch(&self, key: &K) {
        let mut lru = self.lru.lock().unwrap();
        lru.retain(|k| k != key);
        lru.push(*key);
    }

    /// Evict least-recently-used entries above the pinned ceiling until
    /// the cache is within capacity.
    fn evict(&self, pinned_at_or_below: LayerIndex) {
        let mut lru = self.lru.lock().unwrap();
        if lru.len() <= CACHE_CAPACITY {
            return;
        }

        let mut ready = self.ready.write().unwrap();
        let mut excess = lru.len() - CACHE_CAPACITY;
        lru.retain(|k| {
            if excess > 0 && k.layer() > pinned_at_or_below {
                ready.remove(k);
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// Pre-computed collision and avoidance volumes shared by all layer
/// workers. Read-mostly; writes happen only at cache fills.
pub struct ModelVolumes {
    settings: TreeSupportSettings,
    /// Model outlines per layer, with blocker polygons already unioned in.
    layer_outlines: Vec<ExPolygons>,
    /// Upward-facing flat model regions per layer.
    placeable_top: Vec<ExPolygons>,
    cancel: CancellationToken,

    collision_cache: SingleFlightCache<VolumeKey>,
    collision_holefree_cache: SingleFlightCache<VolumeKey>,
    avoidance_cache: SingleFlightCache<AvoidanceKey>,
    placeable_cache: SingleFlightCache<VolumeKey>,
}

impl ModelVolumes {
    /// Build volumes over per-layer model outlines.
    ///
    /// `blockers` are user-painted no-support regions; they are unioned
    /// into every collision query when
    /// [`SUPPORT_TREE_AVOID_SUPPORT_BLOCKER`] is set.
    pub fn new(
        settings: TreeSupportSettings,
        outlines: Vec<ExPolygons>,
        blockers: Vec<ExPolygons>,
        placeable_top: Vec<ExPolygons>,
        cancel: CancellationToken,
    ) -> Self {
        let layer_count = outlines.len();
        let layer_outlines = outlines
            .into_iter()
            .enumerate()
            .map(|(idx, outline)| {
                let blocked = blockers.get(idx);
                match blocked {
                    Some(blocker) if SUPPORT_TREE_AVOID_SUPPORT_BLOCKER && !blocker.is_empty() => {
                        clipper::union(&outline, blocker)
                    }
                    _ => outline,
                }
            })
            .collect();

        let mut placeable_top = placeable_top;
        placeable_top.resize(layer_count, Vec::new());

        Self {
            settings,
            layer_outlines,
            placeable_top,
            cancel,
            collision_cache: SingleFlightCache::new(),
            collision_holefree_cache: SingleFlightCache::new(),
            avoidance_cache: SingleFlightCache::new(),
            placeable_cache: SingleFlightCache::new(),
        }
    }

    /// Number of layers covered by the volumes.
    pub fn layer_count(&self) -> usize {
        self.layer_outlines.len()
    }

    /// Pin layers at or below `layer` against eviction. Called by the
    /// pipeline as it descends; everything above has been consumed and may
    /// be dropped under memory pressure.
    pub fn set_eviction_ceiling(&self, layer: LayerIndex) {
        let ceiling = layer;
        self.collision_cache.evict(ceiling);
        self.collision_holefree_cache.evict(ceiling);
        self.avoidance_cache.evict(ceiling);
        self.placeable_cache.evict(ceiling);
    }

    /// Round a radius up to the next sampled value: multiples of
    /// [`SUPPORT_TREE_COLLISION_RESOLUTION`] below the threshold, then an
    /// exponential ladder.
    pub fn ceil_radius(&self, radius: Coord) -> Coord {
        if radius <= 0 {
            return 0;
        }
        if radius <= SUPPORT_TREE_EXPONENTIAL_THRESHOLD {
            let steps =
                (radius + SUPPORT_TREE_COLLISION_RESOLUTION - 1) / SUPPORT_TREE_COLLISION_RESOLUTION;
            return steps * SUPPORT_TREE_COLLISION_RESOLUTION;
        }

        let mut sampled = SUPPORT_TREE_EXPONENTIAL_THRESHOLD as f64;
        while (sampled as Coord) < radius {
            sampled *= SUPPORT_TREE_EXPONENTIAL_FACTOR;
        }
        sampled as Coord
    }

    /// The region a branch of `radius` may not occupy on `layer`.
    pub fn get_collision(
        &self,
        radius: Coord,
        layer: LayerIndex,
        min_xy: bool,
    ) -> Arc<ExPolygons> {
        let key = VolumeKey {
            radius: self.ceil_radius(radius),
            layer,
            min_xy,
        };
        self.collision_cache
            .get_or_compute(key, || self.calculate_collision(key))
    }

    /// Like [`Self::get_collision`] but with all holes filled, so staying
    /// outside also means not hovering over holes.
    pub fn get_collision_holefree(
        &self,
        radius: Coord,
        layer: LayerIndex,
        min_xy: bool,
    ) -> Arc<ExPolygons> {
        let key = VolumeKey {
            radius: self.ceil_radius(radius),
            layer,
            min_xy,
        };
        self.collision_holefree_cache.get_or_compute(key, || {
            let collision = self.get_collision(key.radius, key.layer, key.min_xy);
            clipper::fill_holes(&collision)
        })
    }

    /// The region a branch of `radius` must stay out of on `layer` if it
    /// still wants to reach the build plate (`to_model = false`) or a
    /// placeable model surface (`to_model = true`).
    pub fn get_avoidance(
        &self,
        radius: Coord,
        layer: LayerIndex,
        kind: AvoidanceType,
        to_model: bool,
        min_xy: bool,
    ) -> Arc<ExPolygons> {
        let radius = self.ceil_radius(radius);
        if layer < 0 {
            return Arc::new(Vec::new());
        }

        let key_for = |l: LayerIndex| AvoidanceKey {
            radius,
            layer: l,
            kind,
            to_model,
            min_xy,
        };

        if let Some(cached) = self.avoidance_cache.get(&key_for(layer)) {
            return cached;
        }

        // The recurrence depends on the layer below; walk down to the
        // deepest uncached layer and fill upward so every step finds its
        // predecessor ready.
        let mut start = layer;
        while start > 0 && !self.avoidance_cache.contains(&key_for(start - 1)) {
            start -= 1;
        }

        let mut result = Arc::new(Vec::new());
        for l in start..=layer {
            if self.cancel.is_cancelled() {
                return Arc::new(Vec::new());
            }
            result = self
                .avoidance_cache
                .get_or_compute(key_for(l), || self.calculate_avoidance(key_for(l)));
        }
        result
    }

    /// Regions where a branch element of `radius` on `layer` may rest on
    /// the model: upward-facing flat surfaces whose top lies
    /// `z_distance_bottom_layers + 1` layers below, eroded by the radius.
    pub fn get_placeable(&self, radius: Coord, layer: LayerIndex) -> Arc<ExPolygons> {
        let key = VolumeKey {
            radius: self.ceil_radius(radius),
            layer,
            min_xy: false,
        };
        self.placeable_cache.get_or_compute(key, || {
            let surface_layer = key.layer - self.settings.z_distance_bottom_layers as LayerIndex - 1;
            if surface_layer < 0 || surface_layer as usize >= self.placeable_top.len() {
                return Vec::new();
            }
            let surfaces = &self.placeable_top[surface_layer as usize];
            if key.radius == 0 {
                return surfaces.clone();
            }
            clipper::offset(surfaces, -key.radius, OffsetJoinType::Round)
        })
    }

    /// Fill the caches for a contiguous layer range bottom-up, so the
    /// per-layer pipeline rarely blocks on a fill.
    pub fn precalculate(&self, max_layer: LayerIndex, radii: &[Coord]) {
        let top = max_layer.min(self.layer_count() as LayerIndex - 1);
        for &radius in radii {
            for layer in 0..=top {
                if self.cancel.is_cancelled() {
                    return;
                }
                let _ = self.get_collision(radius, layer, false);
                let _ = self.get_avoidance(radius, layer, AvoidanceType::Fast, false, false);
                let _ = self.get_avoidance(radius, layer, AvoidanceType::FastSafe, false, false);
                if self.settings.support_rests_on_model {
                    let _ = self.get_placeable(radius, layer);
                    let _ = self.get_avoidance(radius, layer, AvoidanceType::Fast, true, false);
                }
            }
        }
    }

    // --- internal calculations ---

    fn calculate_collision(&self, key: VolumeKey) -> ExPolygons {
        let layer_count = self.layer_outlines.len() as LayerIndex;
        if key.layer < 0 || key.layer >= layer_count {
            return Vec::new();
        }

        // The branch must clear the model across the z-distance window,
        // not just its own layer.
        let lo = (key.layer - self.settings.z_distance_bottom_layers as LayerIndex).max(0);
        let hi = (key.layer + self.settings.z_distance_top_layers as LayerIndex)
            .min(layer_count - 1);

        let mut acc: ExPolygons = Vec::new();
        for l in lo..=hi {
            acc = clipper::union(&acc, &self.layer_outlines[l as usize]);
        }

        let xy = if key.min_xy {
            self.settings.xy_min_distance
        } else {
            self.settings.xy_distance
        };

        let grown = clipper::offset(&acc, key.radius + xy, OffsetJoinType::Round);
        clipper::simplify(&grown, self.settings.resolution)
    }

    fn calculate_avoidance(&self, key: AvoidanceKey) -> ExPolygons {
        let collision = if key.kind.is_safe() {
            self.get_collision_holefree(key.radius, key.layer, key.min_xy)
        } else {
            self.get_collision(key.radius, key.layer, key.min_xy)
        };

        let mut avoidance = if key.layer == 0 {
            (*collision).clone()
        } else {
            // The layer below is guaranteed cached by the fill order.
            let below = self.get_avoidance(
                key.radius,
                key.layer - 1,
                key.kind,
                key.to_model,
                key.min_xy,
            );
            let max_move = if key.kind.is_slow() {
                self.settings.maximum_move_distance_slow
            } else {
                self.settings.maximum_move_distance
            };

            // A branch may move at most `max_move` per layer while
            // descending, so obstacles from below erode by that much.
            let propagated = clipper::offset(&below, -max_move, OffsetJoinType::Round);
            clipper::union(&collision, &propagated)
        };

        if key.to_model {
            let placeable = self.get_placeable(key.radius, key.layer);
            if !placeable.is_empty() {
                avoidance = clipper::difference(&avoidance, &placeable);
            }
        }

        clipper::simplify(&avoidance, self.settings.resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{region_contains_point, ExPolygon, Point, Polygon};
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

    fn volumes_with_square(layers: usize) -> ModelVolumes {
        let outline = vec![square_mm(10.0, Point::zero())];
        ModelVolumes::new(
            TreeSupportSettings::default(),
            vec![outline; layers],
            Vec::new(),
            Vec::new(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_ceil_radius_linear_steps() {
        let volumes = volumes_with_square(1);

        assert_eq!(volumes.ceil_radius(0), 0);
        assert_eq!(volumes.ceil_radius(1), SUPPORT_TREE_COLLISION_RESOLUTION);
        assert_eq!(
            volumes.ceil_radius(scale(0.5)),
            SUPPORT_TREE_COLLISION_RESOLUTION
        );
        assert_eq!(
            volumes.ceil_radius(scale(0.6)),
            2 * SUPPORT_TREE_COLLISION_RESOLUTION
        );
    }

    #[test]
    fn test_ceil_radius_exponential_ladder() {
        let volumes = volumes_with_square(1);

        let r1 = volumes.ceil_radius(scale(2.0));
        let r2 = volumes.ceil_radius(r1 + 1);
        assert!(r1 >= scale(2.0));
        assert!(r2 as f64 >= r1 as f64 * SUPPORT_TREE_EXPONENTIAL_FACTOR * 0.999);

        // The ladder keeps the number of distinct radii small.
        let mut distinct = std::collections::HashSet::new();
        for mm in 1..200 {
            distinct.insert(volumes.ceil_radius(scale(mm as f64 * 0.1)));
        }
        assert!(distinct.len() < 20);
    }

    #[test]
    fn test_collision_contains_model_and_clearance() {
        let volumes = volumes_with_square(3);

        let collision = volumes.get_collision(scale(1.0), 1, false);
        // The model interior is forbidden.
        assert!(region_contains_point(&collision, &Point::zero()));
        // A point within radius + xy_distance of the model edge is
        // forbidden too.
        assert!(region_contains_point(
            &collision,
            &Point::new_scale(6.0, 0.0)
        ));
        // Far away is free.
        assert!(!region_contains_point(
            &collision,
            &Point::new_scale(30.0, 0.0)
        ));
    }

    #[test]
    fn test_collision_min_xy_is_tighter() {
        let volumes = volumes_with_square(3);

        let normal = volumes.get_collision(scale(1.0), 1, false);
        let min = volumes.get_collision(scale(1.0), 1, true);
        assert!(clipper::total_area(&min) < clipper::total_area(&normal));
    }

    #[test]
    fn test_collision_out_of_range_is_empty() {
        let volumes = volumes_with_square(3);

        assert!(volumes.get_collision(scale(1.0), -1, false).is_empty());
        assert!(volumes.get_collision(scale(1.0), 10, false).is_empty());
    }

    #[test]
    fn test_avoidance_grows_upward() {
        let volumes = volumes_with_square(5);

        // Avoidance at layer 0 equals the collision footprint; higher
        // layers accumulate eroded obstacles from below, so the area can
        // only shrink going up.
        let a0 = volumes.get_avoidance(scale(1.0), 0, AvoidanceType::Fast, false, false);
        let a4 = volumes.get_avoidance(scale(1.0), 4, AvoidanceType::Fast, false, false);
        assert!(!a0.is_empty());
        assert!(clipper::total_area(&a4) <= clipper::total_area(&a0) * 1.001);
    }

    #[test]
    fn test_avoidance_slow_is_larger() {
        // With a slower per-layer move budget, obstacles erode less, so
        // the slow avoidance is at least as large as the fast one.
        let volumes = volumes_with_square(8);

        let fast = volumes.get_avoidance(scale(1.0), 7, AvoidanceType::Fast, false, false);
        let slow = volumes.get_avoidance(scale(1.0), 7, AvoidanceType::Slow, false, false);
        assert!(clipper::total_area(&slow) >= clipper::total_area(&fast) * 0.999);
    }

    #[test]
    fn test_avoidance_safe_fills_holes() {
        // A model ring: normal collision has a hole, safe avoidance fills
        // it so branches never hover over it.
        let outer = square_mm(10.0, Point::zero());
        let inner = square_mm(4.0, Point::zero());
        let ring = clipper::difference(&[outer], &[inner]);

        let volumes = ModelVolumes::new(
            TreeSupportSettings::default(),
            vec![ring; 3],
            Vec::new(),
            Vec::new(),
            CancellationToken::new(),
        );

        let safe = volumes.get_avoidance(0, 2, AvoidanceType::FastSafe, false, false);
        assert!(region_contains_point(&safe, &Point::zero()));
    }

    #[test]
    fn test_blockers_union_into_collision() {
        let outline = vec![square_mm(4.0, Point::zero())];
        let blocker = vec![square_mm(4.0, Point::new_scale(20.0, 0.0))];

        let volumes = ModelVolumes::new(
            TreeSupportSettings::default(),
            vec![outline; 2],
            vec![blocker; 2],
            Vec::new(),
            CancellationToken::new(),
        );

        let collision = volumes.get_collision(0, 0, false);
        assert!(region_contains_point(
            &collision,
            &Point::new_scale(20.0, 0.0)
        ));
    }

    #[test]
    fn test_placeable_erodes_by_radius() {
        let settings = TreeSupportSettings::default();
        let mut placeable_top = vec![Vec::new(); 6];
        // Surface top on layer 0; a branch element rests on it from
        // z_distance_bottom_layers + 1 layers above.
        placeable_top[0] = vec![square_mm(4.0, Point::zero())];
        let rest_layer = settings.z_distance_bottom_layers as LayerIndex + 1;

        let volumes = ModelVolumes::new(
            settings,
            vec![vec![square_mm(10.0, Point::zero())]; 6],
            Vec::new(),
            placeable_top,
            CancellationToken::new(),
        );

        let placeable_small = volumes.get_placeable(scale(0.5), rest_layer);
        assert!(!placeable_small.is_empty());

        // A branch wider than the plateau cannot rest on it.
        let placeable_large = volumes.get_placeable(scale(3.0), rest_layer);
        assert!(placeable_large.is_empty());

        // The layer directly above the surface is inside the z gap.
        assert!(volumes.get_placeable(scale(0.5), rest_layer - 1).is_empty());
    }

    #[test]
    fn test_cache_returns_same_value() {
        let volumes = volumes_with_square(3);

        let first = volumes.get_collision(scale(1.0), 1, false);
        let second = volumes.get_collision(scale(1.0), 1, false);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_cancelled_fills_return_empty() {
        let cancel = CancellationToken::new();
        let volumes = ModelVolumes::new(
            TreeSupportSettings::default(),
            vec![vec![square_mm(10.0, Point::zero())]; 4],
            Vec::new(),
            Vec::new(),
            cancel.clone(),
        );

        cancel.cancel();
        let avoidance = volumes.get_avoidance(scale(1.0), 3, AvoidanceType::Fast, false, false);
        assert!(avoidance.is_empty());
    }
}
