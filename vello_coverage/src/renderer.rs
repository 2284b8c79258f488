// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use peniko::kurbo::Affine;

use crate::atlas::{AtlasKey, AtlasSpecs};
use crate::config::CoverageConfig;
use crate::draw_op::{DoCopiesToCache, DrawPathsOp};
use crate::flush::FlushState;
use crate::math::IntRect;
use crate::op_list::DrawOp;
use crate::paint::Paint;
use crate::path_cache::PathCache;
use crate::provider::ResourceProvider;
use crate::recording::{Recording, TextureProxy};
use crate::resources::PerFlushResources;
use crate::shape::Shape;
use crate::specs::PerFlushResourceSpecs;

/// The last coverage count atlas of a flush, kept so the next flush can copy masks out of
/// it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StashedAtlas {
    pub key: AtlasKey,
    pub texture: TextureProxy,
    pub width: u32,
    pub height: u32,
}

/// Draws paths through coverage count masks, keeping the masks of paths that are drawn
/// again and again.
#[derive(Debug)]
pub struct CoverageCountingPathRenderer {
    config: CoverageConfig,
    path_cache: Option<PathCache>,
    stashed_atlas: Option<StashedAtlas>,
    flush_resources: Option<PerFlushResources>,
}

impl CoverageCountingPathRenderer {
    pub fn new(config: CoverageConfig) -> Self {
        Self {
            config,
            path_cache: config.path_cache.map(PathCache::new),
            stashed_atlas: None,
            flush_resources: None,
        }
    }

    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    pub fn path_cache(&self) -> Option<&PathCache> {
        self.path_cache.as_ref()
    }

    pub fn stashed_atlas(&self) -> Option<&StashedAtlas> {
        self.stashed_atlas.as_ref()
    }

    /// Creates an op drawing `shape` within `clip`, or `None` if it lies entirely outside.
    pub fn make_draw_op(
        &self,
        clip: IntRect,
        transform: Affine,
        shape: Shape,
        paint: Paint,
    ) -> Option<DrawPathsOp> {
        let dev_bounds = shape.device_bounds(transform);
        DrawPathsOp::make(
            clip,
            transform,
            shape,
            dev_bounds,
            paint,
            &self.config.visibility,
        )
    }

    /// Plans the flush: accounts for every op, decides on copies, allocates the flush's
    /// resources and binds every op to them.
    pub fn pre_flush(&mut self, ops: &mut [DrawPathsOp], provider: &mut dyn ResourceProvider) {
        self.flush_resources = None;
        let caps = *provider.caps();
        let atlas_specs = AtlasSpecs::new(
            self.config.max_preferred_atlas_size,
            caps.max_texture_size.min(caps.max_render_target_size),
            self.config.min_atlas_size,
        );
        let mut specs = PerFlushResourceSpecs::new(atlas_specs);
        let stashed_atlas_key = self.stashed_atlas.map(|stashed| stashed.key);
        for op in ops.iter_mut().filter(|op| !op.is_absorbed()) {
            op.account_for_own_paths(
                self.path_cache.as_mut(),
                provider,
                stashed_atlas_key,
                &mut specs,
            );
        }
        if specs.is_empty() {
            return;
        }

        let do_copies = specs.copy_decision(&self.config.copy_policy);
        log::debug!(
            "Flushing {} cached, {} copied and {} rendered paths (copies: {do_copies:?})",
            specs.num_cached_paths,
            specs.num_copies(),
            specs.num_renders(),
        );
        if do_copies == DoCopiesToCache::No {
            specs.convert_copies_to_renders();
        }

        let copy_source = self.stashed_atlas.map(|stashed| stashed.texture);
        let mut resources = match PerFlushResources::new(&specs, provider, copy_source) {
            Ok(resources) => resources,
            Err(err) => {
                log::warn!(
                    "Skipping {} paths: {err}",
                    specs.num_path_instances()
                );
                return;
            }
        };
        for op in ops.iter_mut().filter(|op| !op.is_absorbed()) {
            op.setup_resources(self.path_cache.as_mut(), &mut resources, do_copies);
        }
        self.flush_resources = Some(resources);
    }

    /// Records the flush's atlas work followed by every op's draws.
    pub fn execute(
        &mut self,
        ops: &mut [DrawPathsOp],
        provider: &mut dyn ResourceProvider,
        recording: &mut Recording,
        render_target: TextureProxy,
    ) {
        let stashed = self.stashed_atlas.take();
        match self.flush_resources.as_mut() {
            Some(resources) => {
                let mut state = FlushState::new(&mut *recording, &mut *provider, render_target);
                resources.finalize(&mut state, stashed);
            }
            None => {
                if let Some(stashed) = stashed {
                    recording.free_texture(stashed.texture);
                }
            }
        }

        let mut state = FlushState::new(&mut *recording, &mut *provider, render_target);
        if let Some(resources) = &self.flush_resources {
            state = state.with_resources(resources);
        }
        for op in ops.iter_mut().filter(|op| !op.is_absorbed()) {
            op.on_prepare(&mut state);
            op.on_execute(&mut state);
        }
    }

    /// Ends the flush: stashes its last coverage count atlas, frees the others and lets the
    /// path cache purge atlases it no longer needs.
    pub fn post_flush(&mut self, provider: &mut dyn ResourceProvider, recording: &mut Recording) {
        if let Some(stale) = self.stashed_atlas.take() {
            recording.free_texture(stale.texture);
        }
        if let Some(mut resources) = self.flush_resources.take() {
            let stashed = if self.path_cache.is_some() {
                resources.take_atlas_to_stash()
            } else {
                None
            };
            for atlas in resources.rendered_atlases().atlases() {
                if stashed.map(|stashed| stashed.texture) != Some(atlas.texture()) {
                    recording.free_texture(atlas.texture());
                }
            }
            self.stashed_atlas = stashed;
        }
        if let Some(cache) = self.path_cache.as_mut() {
            for key in cache.post_flush() {
                if let Some(texture) = provider.purge_atlas(key) {
                    recording.free_texture(texture);
                }
            }
        }
    }

    /// Runs a whole flush of `ops` into `render_target`.
    pub fn flush(
        &mut self,
        ops: &mut [DrawPathsOp],
        provider: &mut dyn ResourceProvider,
        recording: &mut Recording,
        render_target: TextureProxy,
    ) {
        self.pre_flush(ops, provider);
        self.execute(ops, provider, recording, render_target);
        self.post_flush(provider, recording);
    }
}
