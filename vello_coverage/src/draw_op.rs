// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The op that draws paths through coverage count masks.
//!
//! A [`DrawPathsOp`] starts out holding a single [`DrawRequest`] and collects more as ops
//! with the same clip and paint are merged into it. During a flush it goes through three
//! phases, each run for every op before the next begins:
//!
//! - [`account_for_own_paths`](DrawPathsOp::account_for_own_paths) decides where each mask
//!   will come from and tallies what that needs in [`PerFlushResourceSpecs`].
//! - [`setup_resources`](DrawPathsOp::setup_resources) binds each request to a place in
//!   an atlas and writes its path instance.
//! - [`execute`](DrawPathsOp::execute) issues one instanced draw per [`InstanceRange`].

use peniko::kurbo::{Affine, Rect};
use peniko::Color;
use smallvec::SmallVec;

use crate::atlas::AtlasKey;
use crate::config::VisibilityPolicy;
use crate::flush::FlushState;
use crate::math::{IntRect, IntVector};
use crate::mesh::{DrawTarget, Mesh};
use crate::op_list::{DrawOp, RequiresDstTexture};
use crate::paint::{Paint, ProcessorSet};
use crate::path_cache::{CacheEntryHandle, MaskKind, MaskTransform, PathCache};
use crate::pipeline::{GeometryProcessor, Pipeline};
use crate::provider::{Caps, ResourceProvider};
use crate::recording::{TextureFormat, TextureProxy};
use crate::resources::{PathInstance, PerFlushResources, PATH_INDICES_PER_INSTANCE};
use crate::shape::Shape;
use crate::specs::PerFlushResourceSpecs;

/// How much of a path's mask is inside the clip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Visibility {
    /// Only a small part is visible. The mask is rendered clipped and never cached.
    Partial,
    /// Clipped, but enough is visible that the mask may be cached.
    MostlyComplete,
    /// Entirely inside the clip.
    Complete,
}

/// Whether masks found in the stashed atlas are copied into a persistent atlas this flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoCopiesToCache {
    No,
    Yes,
}

/// Where a request's mask comes from, as decided during accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawPlan {
    /// Drawn straight from a persistent atlas.
    CacheHit,
    /// Copied from the stashed atlas into a persistent atlas.
    Copy,
    /// Rendered into a new coverage count atlas.
    Render,
}

/// A single path to draw.
#[derive(Clone, Debug)]
pub struct DrawRequest {
    pub transform: Affine,
    pub shape: Shape,
    /// Device bounds of the whole shape, rounded out.
    pub shape_dev_ibounds: IntRect,
    /// The part of the shape that is rasterized or reused.
    pub mask_dev_ibounds: IntRect,
    pub visibility: Visibility,
    pub color: Color,
    pub cache_entry: Option<CacheEntryHandle>,
    /// The persistent atlas of a [`DrawPlan::CacheHit`].
    pub cached_atlas: Option<TextureProxy>,
    /// Integer translation split off the transform when looking up the cache.
    pub cached_mask_shift: IntVector,
    pub plan: Option<DrawPlan>,
}

/// A run of consecutive path instances drawn from one atlas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceRange {
    pub atlas: TextureProxy,
    /// One past the last instance of the range, in the flush's instance buffer.
    pub end_instance_idx: u32,
}

/// Draws paths that share a clip and paint, each with its own color.
#[derive(Debug)]
pub struct DrawPathsOp {
    draws: Vec<DrawRequest>,
    processors: ProcessorSet,
    scissor: Option<IntRect>,
    view_matrix_if_using_local_coords: Affine,
    bounds: Rect,
    instance_ranges: SmallVec<[InstanceRange; 2]>,
    base_instance: Option<u32>,
    finalized: bool,
    absorbed: bool,
    requires_dst_texture: RequiresDstTexture,
}

impl DrawPathsOp {
    /// Creates an op drawing `shape`, or `None` if none of it is inside `clip_ibounds`.
    ///
    /// `dev_bounds` are the device space bounds of the shape drawn with `transform`.
    /// Bounds past the `i32` range are clamped to it; non-finite bounds draw nothing.
    pub fn make(
        clip_ibounds: IntRect,
        transform: Affine,
        shape: Shape,
        dev_bounds: Rect,
        paint: Paint,
        policy: &VisibilityPolicy,
    ) -> Option<Self> {
        if !dev_bounds.is_finite() {
            log::debug!("Dropping a path with non-finite bounds {dev_bounds:?}");
            return None;
        }
        let shape_dev_ibounds = IntRect::round_out(dev_bounds);
        let (mask_dev_ibounds, visibility, scissor) = if clip_ibounds.contains(&shape_dev_ibounds)
        {
            (shape_dev_ibounds, Visibility::Complete, None)
        } else {
            let mask_dev_ibounds = clip_ibounds.intersect(&shape_dev_ibounds)?;
            let visibility =
                policy.classify_clipped(mask_dev_ibounds.area(), shape_dev_ibounds.area());
            (mask_dev_ibounds, visibility, Some(clip_ibounds))
        };
        let view_matrix_if_using_local_coords = if paint.processors.uses_local_coords {
            transform
        } else {
            Affine::IDENTITY
        };
        let draw = DrawRequest {
            transform,
            shape,
            shape_dev_ibounds,
            mask_dev_ibounds,
            visibility,
            color: paint.color,
            cache_entry: None,
            cached_atlas: None,
            cached_mask_shift: IntVector::ZERO,
            plan: None,
        };
        Some(Self {
            draws: vec![draw],
            processors: paint.processors,
            scissor,
            view_matrix_if_using_local_coords,
            bounds: dev_bounds.intersect(clip_ibounds.to_rect()),
            instance_ranges: SmallVec::new(),
            base_instance: None,
            finalized: false,
            absorbed: false,
            requires_dst_texture: RequiresDstTexture::No,
        })
    }

    pub fn draws(&self) -> &[DrawRequest] {
        &self.draws
    }

    pub fn processors(&self) -> &ProcessorSet {
        &self.processors
    }

    pub fn scissor(&self) -> Option<IntRect> {
        self.scissor
    }

    pub fn view_matrix_if_using_local_coords(&self) -> Affine {
        self.view_matrix_if_using_local_coords
    }

    pub fn instance_ranges(&self) -> &[InstanceRange] {
        &self.instance_ranges
    }

    /// Index of the op's first instance in the flush's instance buffer, once set up.
    pub fn base_instance(&self) -> Option<u32> {
        self.base_instance
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Whether this op was merged into another one and must not be drawn on its own.
    pub fn is_absorbed(&self) -> bool {
        self.absorbed
    }

    /// Appends the requests of `other` if both ops can be drawn as one.
    pub fn try_merge(&mut self, other: &mut Self) -> bool {
        if self.finalized || other.finalized {
            debug_assert!(false, "Can't merge ops once they're finalized");
            return false;
        }
        debug_assert!(!self.absorbed && !other.absorbed);
        if self.scissor != other.scissor
            || self.view_matrix_if_using_local_coords != other.view_matrix_if_using_local_coords
            || self.processors != other.processors
        {
            return false;
        }
        self.draws.append(&mut other.draws);
        self.bounds = self.bounds.union(other.bounds);
        other.absorbed = true;
        true
    }

    pub fn finalize(&mut self, caps: &Caps) -> RequiresDstTexture {
        debug_assert!(!self.finalized, "Op finalized twice");
        self.finalized = true;
        self.requires_dst_texture = if self.processors.reads_dst() && !caps.advanced_blend_support
        {
            RequiresDstTexture::Yes
        } else {
            RequiresDstTexture::No
        };
        self.requires_dst_texture
    }

    /// Decides where each request's mask comes from and adds what that needs to `specs`.
    ///
    /// `stashed_atlas_key` identifies the previous flush's coverage count atlas. Masks
    /// stashed anywhere else are gone.
    pub fn account_for_own_paths(
        &mut self,
        mut path_cache: Option<&mut PathCache>,
        provider: &dyn ResourceProvider,
        stashed_atlas_key: Option<AtlasKey>,
        specs: &mut PerFlushResourceSpecs,
    ) {
        debug_assert!(!self.absorbed, "Accounting for an absorbed op");
        let max_mask_size = provider.caps().max_render_target_size;
        for draw in &mut self.draws {
            draw.cache_entry = None;
            draw.cached_atlas = None;
            draw.cached_mask_shift = IntVector::ZERO;
            let kind = draw.shape.kind().index();

            if let Some(cache) = path_cache.as_deref_mut() {
                if draw.visibility != Visibility::Partial {
                    let (mask_transform, shift) = MaskTransform::new(&draw.transform);
                    draw.cached_mask_shift = shift;
                    draw.cache_entry = cache.find(&draw.shape, &mask_transform, true);
                }
                if let Some(handle) = draw.cache_entry {
                    let entry = cache.get(handle);
                    let hit_count = entry.map_or(0, |entry| entry.hit_count());
                    match entry.and_then(|entry| entry.location()).copied() {
                        Some(location) if location.kind == MaskKind::Cached => {
                            if let Some(atlas) = provider.find_atlas_by_key(location.atlas_key) {
                                draw.cached_atlas = Some(atlas);
                                draw.plan = Some(DrawPlan::CacheHit);
                                specs.num_cached_paths += 1;
                                continue;
                            }
                            cache.reset_location(handle);
                        }
                        Some(location) => {
                            if Some(location.atlas_key) == stashed_atlas_key {
                                draw.plan = Some(DrawPlan::Copy);
                                specs.num_copied_paths[kind] += 1;
                                specs.copy_path_stats[kind].stat_path(&draw.shape);
                                specs.copy_atlas_specs.account_for_space(
                                    location.dev_ibounds.width() as u32,
                                    location.dev_ibounds.height() as u32,
                                );
                                continue;
                            }
                            cache.reset_location(handle);
                        }
                        None => {}
                    }
                    // Render the whole shape of paths that keep being drawn, so the mask
                    // can be cached.
                    if draw.visibility == Visibility::MostlyComplete && hit_count > 1 {
                        let ibounds = draw.shape_dev_ibounds;
                        if ibounds.width().max(ibounds.height()) as u32 <= max_mask_size {
                            draw.mask_dev_ibounds = ibounds;
                            draw.visibility = Visibility::Complete;
                        }
                    }
                }
            }

            draw.plan = Some(DrawPlan::Render);
            specs.num_rendered_paths[kind] += 1;
            specs.rendered_path_stats[kind].stat_path(&draw.shape);
            specs.rendered_atlas_specs.account_for_space(
                draw.mask_dev_ibounds.width() as u32,
                draw.mask_dev_ibounds.height() as u32,
            );
        }
    }

    /// Number of requests planned as copies.
    pub fn pending_copy_count(&self) -> usize {
        self.draws
            .iter()
            .filter(|draw| draw.plan == Some(DrawPlan::Copy))
            .count()
    }

    /// Plans every copy as a render instead.
    pub fn convert_copies_to_renders(&mut self) {
        for draw in &mut self.draws {
            if draw.plan == Some(DrawPlan::Copy) {
                draw.plan = Some(DrawPlan::Render);
            }
        }
    }

    /// Binds every request to a place in an atlas, appends its path instance to
    /// `resources` and groups the instances into ranges sharing an atlas.
    ///
    /// Requests that can't be placed are dropped.
    pub fn setup_resources(
        &mut self,
        mut path_cache: Option<&mut PathCache>,
        resources: &mut PerFlushResources,
        do_copies: DoCopiesToCache,
    ) {
        debug_assert!(!self.absorbed, "Setting up an absorbed op");
        if self.base_instance.is_some() {
            debug_assert!(false, "Resources were already set up for this op");
            return;
        }
        if do_copies == DoCopiesToCache::No {
            self.convert_copies_to_renders();
            debug_assert!(
                !resources.has_copy_reservations(),
                "Copies must be converted to renders before resources are allocated"
            );
        }
        let base_instance = resources.next_path_instance_idx();
        for draw in &mut self.draws {
            if draw.plan.is_none() {
                debug_assert!(false, "Setting up a path that wasn't accounted for");
                continue;
            }
            let Some((atlas, instance)) = bind_draw(draw, path_cache.as_deref_mut(), resources)
            else {
                continue;
            };
            let instance_idx = resources.next_path_instance_idx();
            if resources.append_draw_path_instance(instance) {
                Self::record_instance(&mut self.instance_ranges, atlas, instance_idx);
            }
        }
        self.base_instance = Some(base_instance);
    }

    /// Adds an instance to the open range if it shares the range's atlas, or opens a new
    /// range.
    fn record_instance(
        ranges: &mut SmallVec<[InstanceRange; 2]>,
        atlas: TextureProxy,
        instance_idx: u32,
    ) {
        match ranges.last_mut() {
            Some(range) if range.atlas == atlas => {
                debug_assert_eq!(range.end_instance_idx, instance_idx);
                range.end_instance_idx = instance_idx + 1;
            }
            _ => ranges.push(InstanceRange {
                atlas,
                end_instance_idx: instance_idx + 1,
            }),
        }
    }

    /// Issues one instanced draw per instance range.
    pub fn execute(&mut self, state: &mut FlushState<'_>) {
        debug_assert!(!self.absorbed, "Executing an absorbed op");
        let Some(resources) = state.resources() else {
            return;
        };
        let Some(mut start) = self.base_instance else {
            return;
        };
        let pipeline = Pipeline {
            render_target: state.render_target(),
            blend_mode: self.processors.blend_mode,
            scissor: self.scissor,
            dst_texture: self.requires_dst_texture == RequiresDstTexture::Yes,
        };
        for range in &self.instance_ranges {
            let mesh = Mesh::IndexedInstanced {
                index_buffer: resources.path_index_buffer(),
                index_count: PATH_INDICES_PER_INSTANCE,
                instance_buffer: resources.instance_buffer(),
                base_instance: start,
                instance_count: range.end_instance_idx - start,
            };
            let dynamic_state = pipeline.fixed_dynamic_state(&[range.atlas]);
            let geometry = GeometryProcessor::PathCover {
                atlas: range.atlas,
                view_matrix: self.view_matrix_if_using_local_coords,
            };
            state.draw(geometry, &pipeline, dynamic_state.as_ref(), &mesh);
            start = range.end_instance_idx;
        }
    }
}

/// Finds the mask of `draw` and builds its instance, following the plan made during
/// accounting as far as the cache still allows.
fn bind_draw(
    draw: &DrawRequest,
    mut cache: Option<&mut PathCache>,
    resources: &mut PerFlushResources,
) -> Option<(TextureProxy, PathInstance)> {
    let plan = draw.plan?;
    let handle = draw.cache_entry;
    let entry = match (cache.as_deref(), handle) {
        (Some(cache), Some(handle)) => cache.get(handle).cloned(),
        _ => None,
    };
    let location = entry.as_ref().and_then(|entry| entry.location()).copied();
    let shift = draw.cached_mask_shift;

    if plan == DrawPlan::CacheHit {
        if let (Some(atlas), Some(location)) =
            (draw.cached_atlas, location.filter(|l| l.is_cached()))
        {
            let instance = PathInstance::from_mask_location(&location, shift, draw.color, false);
            return Some((atlas, instance));
        }
        log::debug!("Cached path mask went missing, rendering it instead");
    }

    // Already copied or rendered earlier in this flush.
    if let (Some(atlas), Some(location)) = (
        entry.as_ref().and_then(|entry| entry.curr_flush_atlas()),
        location,
    ) {
        let even_odd = atlas.format == TextureFormat::CoverageCount && draw.shape.is_even_odd();
        let instance = PathInstance::from_mask_location(&location, shift, draw.color, even_odd);
        return Some((atlas, instance));
    }

    if plan == DrawPlan::Copy {
        if let (Some(cache), Some(handle), Some(location)) = (
            cache.as_deref_mut(),
            handle,
            location.filter(|l| l.is_stashed()),
        ) {
            if let Some((atlas, atlas_key, atlas_offset)) =
                resources.copy_path_to_cached_atlas(&location, draw.shape.is_even_odd())
            {
                cache.update_to_cached_atlas(handle, atlas_key, atlas_offset);
                cache.set_curr_flush_atlas(handle, atlas);
                let mut copied = location;
                copied.atlas_key = atlas_key;
                copied.kind = MaskKind::Cached;
                copied.atlas_offset = atlas_offset;
                let instance = PathInstance::from_mask_location(&copied, shift, draw.color, false);
                return Some((atlas, instance));
            }
        }
        log::debug!("Couldn't copy a stashed path mask, rendering it instead");
    }

    if let (Some(cache), Some(handle), Some(_)) = (cache.as_deref_mut(), handle, location) {
        cache.reset_location(handle);
    }
    let Some(rendered) =
        resources.render_shape_in_atlas(draw.mask_dev_ibounds, draw.transform, &draw.shape)
    else {
        log::debug!(
            "Dropping a path with mask bounds {:?}",
            draw.mask_dev_ibounds
        );
        return None;
    };

    // Don't stash a mask until its second hit.
    let hit_count = entry.as_ref().map_or(0, |entry| entry.hit_count());
    if let (Some(cache), Some(handle)) = (cache, handle) {
        if draw.visibility == Visibility::Complete
            && hit_count > 1
            && resources.is_next_atlas_to_stash(rendered.atlas_index)
        {
            if let Some(atlas_key) = resources.next_atlas_to_stash_key() {
                cache.init_as_stashed_atlas(
                    handle,
                    atlas_key,
                    rendered.dev_to_atlas_offset,
                    rendered.dev_bounds,
                    rendered.dev_bounds45,
                    rendered.dev_ibounds,
                    shift,
                );
                cache.set_curr_flush_atlas(handle, rendered.atlas);
            }
        }
    }
    let instance = PathInstance::new(
        rendered.dev_bounds,
        rendered.dev_bounds45,
        rendered.dev_to_atlas_offset,
        draw.color,
        draw.shape.is_even_odd(),
    );
    Some((rendered.atlas, instance))
}

impl DrawOp for DrawPathsOp {
    fn name(&self) -> &'static str {
        "DrawPathsOp"
    }

    fn bounds(&self) -> Rect {
        self.bounds
    }

    fn finalize(&mut self, caps: &Caps) -> RequiresDstTexture {
        Self::finalize(self, caps)
    }

    fn combine_if_possible(&mut self, other: &mut Self, _caps: &Caps) -> bool {
        self.try_merge(other)
    }

    fn on_execute(&mut self, state: &mut FlushState<'_>) {
        self.execute(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::AtlasSpecs;
    use crate::config::PathCacheConfig;
    use crate::provider::ResourceCache;
    use crate::recording::{Command, Recording};
    use peniko::kurbo::{BezPath, Shape as _};
    use peniko::{Fill, Mix};

    fn rect_shape(rect: Rect) -> Shape {
        let path: BezPath = rect.to_path(0.1);
        Shape::fill(path, Fill::NonZero)
    }

    fn op(clip: IntRect, rect: Rect, paint: Paint) -> Option<DrawPathsOp> {
        let shape = rect_shape(rect);
        let dev_bounds = shape.device_bounds(Affine::IDENTITY);
        DrawPathsOp::make(
            clip,
            Affine::IDENTITY,
            shape,
            dev_bounds,
            paint,
            &VisibilityPolicy::default(),
        )
    }

    fn red() -> Paint {
        Paint::solid(Color::rgba8(255, 0, 0, 255))
    }

    const CLIP: IntRect = IntRect::new(0, 0, 1000, 1000);

    fn specs(provider: &ResourceCache) -> PerFlushResourceSpecs {
        let caps = provider.caps();
        PerFlushResourceSpecs::new(AtlasSpecs::new(512, caps.max_texture_size, 64))
    }

    #[test]
    fn test_visibility_classification() {
        let inside = op(CLIP, Rect::new(10.0, 10.0, 20.0, 20.0), red()).unwrap();
        assert_eq!(inside.draws()[0].visibility, Visibility::Complete);
        assert_eq!(inside.scissor(), None);

        let mostly = op(CLIP, Rect::new(-10.0, 0.0, 190.0, 200.0), red()).unwrap();
        assert_eq!(mostly.draws()[0].visibility, Visibility::MostlyComplete);
        assert_eq!(mostly.draws()[0].mask_dev_ibounds, IntRect::new(0, 0, 190, 200));
        assert_eq!(mostly.scissor(), Some(CLIP));

        let partial = op(CLIP, Rect::new(-3000.0, 0.0, 100.0, 100.0), red()).unwrap();
        assert_eq!(partial.draws()[0].visibility, Visibility::Partial);

        assert!(op(CLIP, Rect::new(2000.0, 0.0, 2100.0, 100.0), red()).is_none());
    }

    #[test]
    fn test_huge_bounds_are_clipped() {
        let clip = IntRect::new(0, 0, 1024, 1024);
        let mut op = op(clip, Rect::new(-3e9, 0.0, 3e9, 100.0), red()).unwrap();
        let draw = &op.draws()[0];
        assert_eq!(draw.visibility, Visibility::Partial);
        assert_eq!(draw.mask_dev_ibounds, IntRect::new(0, 0, 1024, 100));
        assert_eq!(op.bounds(), Rect::new(0.0, 0.0, 1024.0, 100.0));

        // Seen often enough to be promoted, the whole shape still can't be.
        let mut provider = ResourceCache::default();
        let mut cache = PathCache::new(PathCacheConfig::default());
        let mut specs = specs(&provider);
        op.draws[0].visibility = Visibility::MostlyComplete;
        for _ in 0..2 {
            op.account_for_own_paths(Some(&mut cache), &provider, None, &mut specs);
        }
        assert_eq!(op.draws()[0].visibility, Visibility::MostlyComplete);
        assert_eq!(op.draws()[0].mask_dev_ibounds, IntRect::new(0, 0, 1024, 100));

        let mut specs = self::specs(&provider);
        op.account_for_own_paths(Some(&mut cache), &provider, None, &mut specs);
        let mut resources = PerFlushResources::new(&specs, &mut provider, None).unwrap();
        op.setup_resources(Some(&mut cache), &mut resources, DoCopiesToCache::No);
        assert_eq!(op.instance_ranges().len(), 1);
    }

    #[test]
    fn test_non_finite_bounds_draw_nothing() {
        let shape = rect_shape(Rect::new(0.0, 0.0, 10.0, 10.0));
        let made = DrawPathsOp::make(
            CLIP,
            Affine::IDENTITY,
            shape,
            Rect::new(f64::NAN, 0.0, 10.0, 10.0),
            red(),
            &VisibilityPolicy::default(),
        );
        assert!(made.is_none());
    }

    #[test]
    fn test_merge_keeps_request_order() {
        let blue = Paint::solid(Color::rgba8(0, 0, 255, 255));
        let mut a = op(CLIP, Rect::new(0.0, 0.0, 10.0, 10.0), red()).unwrap();
        let mut b = op(CLIP, Rect::new(20.0, 0.0, 30.0, 10.0), blue).unwrap();
        let mut c = op(CLIP, Rect::new(40.0, 0.0, 50.0, 10.0), red()).unwrap();
        assert!(a.try_merge(&mut b));
        assert!(a.try_merge(&mut c));
        assert!(b.is_absorbed() && c.is_absorbed());
        let colors: Vec<Color> = a.draws().iter().map(|draw| draw.color).collect();
        assert_eq!(colors, [red().color, blue.color, red().color]);
        assert_eq!(a.bounds(), Rect::new(0.0, 0.0, 50.0, 10.0));
    }

    #[test]
    fn test_merge_requires_equal_state() {
        let mut a = op(CLIP, Rect::new(0.0, 0.0, 10.0, 10.0), red()).unwrap();
        let mut multiply = op(
            CLIP,
            Rect::new(0.0, 0.0, 10.0, 10.0),
            red().with_blend_mode(Mix::Multiply),
        )
        .unwrap();
        assert!(!a.try_merge(&mut multiply));
        let mut clipped = op(CLIP, Rect::new(-5.0, 0.0, 10.0, 10.0), red()).unwrap();
        assert!(!a.try_merge(&mut clipped));
        let mut local = op(
            CLIP,
            Rect::new(0.0, 0.0, 10.0, 10.0),
            red().with_local_coords(true),
        )
        .unwrap();
        // Identity transform, so the view matrices agree, but the processors don't.
        assert!(!a.try_merge(&mut local));
        assert_eq!(a.draws().len(), 1);
        assert!(!multiply.is_absorbed());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "finalized"))]
    fn test_merge_after_finalize_is_rejected() {
        let mut a = op(CLIP, Rect::new(0.0, 0.0, 10.0, 10.0), red()).unwrap();
        let mut b = op(CLIP, Rect::new(0.0, 0.0, 10.0, 10.0), red()).unwrap();
        a.finalize(&Caps::default());
        assert!(!a.try_merge(&mut b));
    }

    #[test]
    fn test_advanced_blends_need_dst_without_hardware_support() {
        let mut a = op(
            CLIP,
            Rect::new(0.0, 0.0, 10.0, 10.0),
            red().with_blend_mode(Mix::Screen),
        )
        .unwrap();
        assert_eq!(a.finalize(&Caps::default()), RequiresDstTexture::Yes);
        let mut b = op(
            CLIP,
            Rect::new(0.0, 0.0, 10.0, 10.0),
            red().with_blend_mode(Mix::Screen),
        )
        .unwrap();
        let caps = Caps {
            advanced_blend_support: true,
            ..Default::default()
        };
        assert_eq!(b.finalize(&caps), RequiresDstTexture::No);
    }

    #[test]
    fn test_partial_paths_skip_the_cache() {
        let mut provider = ResourceCache::default();
        let mut cache = PathCache::new(PathCacheConfig::default());
        let mut partial = op(CLIP, Rect::new(-3000.0, 0.0, 100.0, 100.0), red()).unwrap();
        let mut specs = specs(&provider);
        for _ in 0..3 {
            partial.account_for_own_paths(Some(&mut cache), &provider, None, &mut specs);
        }
        assert!(cache.is_empty());
        assert_eq!(partial.draws()[0].plan, Some(DrawPlan::Render));
        assert_eq!(partial.draws()[0].cache_entry, None);

        let mut resources = PerFlushResources::new(&specs, &mut provider, None).unwrap();
        partial.setup_resources(Some(&mut cache), &mut resources, DoCopiesToCache::Yes);
        assert!(cache.is_empty());
        assert_eq!(partial.instance_ranges().len(), 1);
    }

    #[test]
    fn test_single_render_scenario() {
        let mut provider = ResourceCache::default();
        let mut op = op(CLIP, Rect::new(10.0, 10.0, 50.0, 30.0), red()).unwrap();
        op.finalize(provider.caps());
        let mut specs = specs(&provider);
        op.account_for_own_paths(None, &provider, None, &mut specs);
        assert_eq!(specs.num_renders(), 1);
        assert_eq!(specs.rendered_atlas_specs.min_width, 40);
        assert_eq!(specs.rendered_atlas_specs.min_height, 20);

        let mut resources = PerFlushResources::new(&specs, &mut provider, None).unwrap();
        op.setup_resources(None, &mut resources, DoCopiesToCache::No);
        assert_eq!(op.base_instance(), Some(0));
        let atlas = resources.rendered_atlases().atlases()[0].texture();
        assert_eq!(
            op.instance_ranges(),
            &[InstanceRange {
                atlas,
                end_instance_idx: 1
            }]
        );

        let mut recording = Recording::default();
        let target = TextureProxy::new(TextureFormat::Rgba8);
        let mut state =
            FlushState::new(&mut recording, &mut provider, target).with_resources(&resources);
        op.execute(&mut state);
        let draws: Vec<_> = recording.draws().collect();
        assert_eq!(draws.len(), 1);
        assert_eq!(
            draws[0].geometry,
            GeometryProcessor::PathCover {
                atlas,
                view_matrix: Affine::IDENTITY
            }
        );
        assert_eq!(draws[0].draw.index_count(), PATH_INDICES_PER_INSTANCE);
        let dynamic_state = draws[0].dynamic_state.as_ref().unwrap();
        assert_eq!(&dynamic_state.primitive_textures[..], &[atlas]);
    }

    #[test]
    fn test_copies_are_converted_before_binding() {
        let mut provider = ResourceCache::default();
        let mut cache = PathCache::new(PathCacheConfig::default());
        let rect = Rect::new(10.0, 10.0, 50.0, 30.0);

        // Two flushes to get the mask stashed.
        let mut stashed = None;
        for _ in 0..2 {
            let mut op = op(CLIP, rect, red()).unwrap();
            let mut specs = specs(&provider);
            op.account_for_own_paths(Some(&mut cache), &provider, None, &mut specs);
            let mut resources = PerFlushResources::new(&specs, &mut provider, None).unwrap();
            op.setup_resources(Some(&mut cache), &mut resources, DoCopiesToCache::No);
            stashed = resources.take_atlas_to_stash();
            cache.post_flush();
        }
        let stashed = stashed.unwrap();
        let handle = cache_handle(&mut cache, rect);
        assert!(cache.get(handle).unwrap().location().unwrap().is_stashed());

        let mut op = op(CLIP, rect, red()).unwrap();
        let mut specs = specs(&provider);
        op.account_for_own_paths(Some(&mut cache), &provider, Some(stashed.key), &mut specs);
        assert_eq!(op.pending_copy_count(), 1);
        assert_eq!(specs.num_copies(), 1);

        specs.convert_copies_to_renders();
        let mut resources =
            PerFlushResources::new(&specs, &mut provider, Some(stashed.texture)).unwrap();
        op.setup_resources(Some(&mut cache), &mut resources, DoCopiesToCache::No);
        assert_eq!(op.pending_copy_count(), 0);
        assert_eq!(op.instance_ranges().len(), 1);
        assert_eq!(
            op.instance_ranges()[0].atlas.format,
            TextureFormat::CoverageCount
        );
        assert!(resources.copy_atlases().is_empty());
    }

    #[test]
    fn test_mask_stashed_in_another_atlas_is_rendered() {
        let mut provider = ResourceCache::default();
        let mut cache = PathCache::new(PathCacheConfig::default());
        let rect = Rect::new(10.0, 10.0, 50.0, 30.0);
        for _ in 0..2 {
            let mut op = op(CLIP, rect, red()).unwrap();
            let mut specs = specs(&provider);
            op.account_for_own_paths(Some(&mut cache), &provider, None, &mut specs);
            let mut resources = PerFlushResources::new(&specs, &mut provider, None).unwrap();
            op.setup_resources(Some(&mut cache), &mut resources, DoCopiesToCache::No);
            cache.post_flush();
        }
        let handle = cache_handle(&mut cache, rect);
        assert!(cache.get(handle).unwrap().location().unwrap().is_stashed());

        // The atlas that was stashed last is not the one holding the mask.
        let mut op = op(CLIP, rect, red()).unwrap();
        let mut specs = specs(&provider);
        let other_key = Some(AtlasKey::next());
        op.account_for_own_paths(Some(&mut cache), &provider, other_key, &mut specs);
        assert_eq!(op.draws()[0].plan, Some(DrawPlan::Render));
        assert_eq!(specs.num_copies(), 0);
        assert_eq!(specs.num_renders(), 1);
        let handle = op.draws()[0].cache_entry.unwrap();
        assert!(cache.get(handle).unwrap().location().is_none());
    }

    /// Looks up the entry of an identity transformed rect, counting a hit.
    fn cache_handle(cache: &mut PathCache, rect: Rect) -> CacheEntryHandle {
        let (mask_transform, _) = MaskTransform::new(&Affine::IDENTITY);
        cache.find(&rect_shape(rect), &mask_transform, false).unwrap()
    }

    #[test]
    fn test_cache_hit_binds_to_cached_atlas() {
        let mut provider = ResourceCache::default();
        let mut cache = PathCache::new(PathCacheConfig::default());
        let rect = Rect::new(10.0, 10.0, 50.0, 30.0);
        let handle = cache_handle_or_insert(&mut cache, rect);
        let atlas_key = AtlasKey::next();
        let cached_atlas = TextureProxy::new(TextureFormat::Alpha8);
        provider.assign_atlas_key(atlas_key, cached_atlas);
        let ibounds = IntRect::new(10, 10, 50, 30);
        cache.init_as_stashed_atlas(
            handle,
            AtlasKey::next(),
            IntVector::new(-10, -10),
            ibounds.to_rect(),
            ibounds.to_rect(),
            ibounds,
            IntVector::ZERO,
        );
        cache.update_to_cached_atlas(handle, atlas_key, IntVector::new(90, 190));

        let mut op = op(CLIP, rect, red()).unwrap();
        let mut specs = specs(&provider);
        op.account_for_own_paths(Some(&mut cache), &provider, None, &mut specs);
        assert_eq!(op.draws()[0].plan, Some(DrawPlan::CacheHit));
        assert_eq!(specs.num_cached_paths, 1);
        assert!(specs.rendered_atlas_specs.is_empty());

        let mut resources = PerFlushResources::new(&specs, &mut provider, None).unwrap();
        op.setup_resources(Some(&mut cache), &mut resources, DoCopiesToCache::Yes);
        assert!(resources.rendered_atlases().is_empty());
        assert_eq!(
            op.instance_ranges(),
            &[InstanceRange {
                atlas: cached_atlas,
                end_instance_idx: 1
            }]
        );
        assert_eq!(
            resources.path_instances()[0].dev_to_atlas_offset,
            [90, 190]
        );
    }

    fn cache_handle_or_insert(cache: &mut PathCache, rect: Rect) -> CacheEntryHandle {
        let (mask_transform, _) = MaskTransform::new(&Affine::IDENTITY);
        cache.find(&rect_shape(rect), &mask_transform, true).unwrap()
    }

    #[test]
    fn test_purged_cached_atlas_is_a_miss() {
        let provider = ResourceCache::default();
        let mut cache = PathCache::new(PathCacheConfig::default());
        let rect = Rect::new(10.0, 10.0, 50.0, 30.0);
        let handle = cache_handle_or_insert(&mut cache, rect);
        let ibounds = IntRect::new(10, 10, 50, 30);
        cache.init_as_stashed_atlas(
            handle,
            AtlasKey::next(),
            IntVector::ZERO,
            ibounds.to_rect(),
            ibounds.to_rect(),
            ibounds,
            IntVector::ZERO,
        );
        // Never registered with the provider.
        cache.update_to_cached_atlas(handle, AtlasKey::next(), IntVector::ZERO);

        let mut op = op(CLIP, rect, red()).unwrap();
        let mut specs = specs(&provider);
        op.account_for_own_paths(Some(&mut cache), &provider, None, &mut specs);
        assert_eq!(op.draws()[0].plan, Some(DrawPlan::Render));
        assert_eq!(specs.num_cached_paths, 0);
        assert!(cache.get(handle).unwrap().location().is_none());
    }

    #[test]
    fn test_ranges_follow_atlas_changes() {
        let mut ranges = SmallVec::<[InstanceRange; 2]>::new();
        let a = TextureProxy::new(TextureFormat::CoverageCount);
        let b = TextureProxy::new(TextureFormat::Alpha8);
        for (idx, atlas) in [a, a, b, b, b, a].into_iter().enumerate() {
            DrawPathsOp::record_instance(&mut ranges, atlas, idx as u32);
        }
        let ends: Vec<(TextureProxy, u32)> = ranges
            .iter()
            .map(|range| (range.atlas, range.end_instance_idx))
            .collect();
        assert_eq!(ends, [(a, 2), (b, 5), (a, 6)]);
    }

    #[test]
    fn test_execute_without_resources_draws_nothing() {
        let mut provider = ResourceCache::default();
        let mut op = op(CLIP, Rect::new(10.0, 10.0, 50.0, 30.0), red()).unwrap();
        let mut recording = Recording::default();
        let target = TextureProxy::new(TextureFormat::Rgba8);
        let mut state = FlushState::new(&mut recording, &mut provider, target);
        op.execute(&mut state);
        assert!(!recording
            .commands
            .iter()
            .any(|cmd| matches!(cmd, Command::Draw(_))));
    }
}
