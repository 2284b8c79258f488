// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::atlas::AtlasSpecs;
use crate::config::CopyPolicy;
use crate::draw_op::DoCopiesToCache;
use crate::shape::{PathKind, PathStats};

/// Everything the ops of a flush need, gathered before any resources are allocated.
///
/// Counts and stats are split by [`PathKind`], indexed with [`PathKind::index`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerFlushResourceSpecs {
    /// Paths drawn straight from a persistent atlas.
    pub num_cached_paths: u32,
    /// Paths whose masks are copied forward from the stashed atlas.
    pub num_copied_paths: [u32; PathKind::COUNT],
    pub copy_path_stats: [PathStats; PathKind::COUNT],
    pub copy_atlas_specs: AtlasSpecs,
    /// Paths rendered into a fresh coverage count atlas.
    pub num_rendered_paths: [u32; PathKind::COUNT],
    pub rendered_path_stats: [PathStats; PathKind::COUNT],
    pub rendered_atlas_specs: AtlasSpecs,
}

impl PerFlushResourceSpecs {
    /// Empty specs whose atlases are limited by `atlas_specs`.
    pub fn new(atlas_specs: AtlasSpecs) -> Self {
        Self {
            num_cached_paths: 0,
            num_copied_paths: [0; PathKind::COUNT],
            copy_path_stats: Default::default(),
            copy_atlas_specs: atlas_specs,
            num_rendered_paths: [0; PathKind::COUNT],
            rendered_path_stats: Default::default(),
            rendered_atlas_specs: atlas_specs,
        }
    }

    pub fn num_copies(&self) -> u32 {
        self.num_copied_paths.iter().sum()
    }

    pub fn num_renders(&self) -> u32 {
        self.num_rendered_paths.iter().sum()
    }

    /// Total number of path instances drawn during the flush.
    pub fn num_path_instances(&self) -> u32 {
        self.num_cached_paths + self.num_copies() + self.num_renders()
    }

    pub fn is_empty(&self) -> bool {
        self.num_path_instances() == 0
    }

    /// Whether copying is worth a dedicated atlas, as judged by `policy`.
    pub fn copy_decision(&self, policy: &CopyPolicy) -> DoCopiesToCache {
        policy.decide(self.num_copies(), self.copy_atlas_specs.approx_num_pixels)
    }

    /// Turns every planned copy into a render.
    ///
    /// Ops must then be set up with [`DoCopiesToCache::No`], which makes them render their
    /// copies as well.
    pub fn convert_copies_to_renders(&mut self) {
        for kind in [PathKind::Fill, PathKind::Stroke] {
            let i = kind.index();
            self.num_rendered_paths[i] += self.num_copied_paths[i];
            self.num_copied_paths[i] = 0;
            let copied = std::mem::take(&mut self.copy_path_stats[i]);
            self.rendered_path_stats[i].merge(&copied);
        }
        self.rendered_atlas_specs.absorb(&mut self.copy_atlas_specs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peniko::kurbo::{BezPath, Rect, Shape as _, Stroke};
    use peniko::Fill;

    use crate::shape::Shape;

    #[test]
    fn test_convert_copies_to_renders() {
        let mut specs = PerFlushResourceSpecs::new(AtlasSpecs::new(2048, 8192, 512));
        let path: BezPath = Rect::new(0.0, 0.0, 8.0, 8.0).to_path(0.1);
        let stroke = Shape::stroke(path.clone(), Stroke::new(1.0));
        let fill = Shape::fill(path, Fill::NonZero);

        specs.num_cached_paths += 1;
        specs.num_copied_paths[PathKind::Stroke.index()] += 1;
        specs.copy_path_stats[PathKind::Stroke.index()].stat_path(&stroke);
        specs.copy_atlas_specs.account_for_space(9, 9);
        specs.num_rendered_paths[PathKind::Fill.index()] += 1;
        specs.rendered_path_stats[PathKind::Fill.index()].stat_path(&fill);
        specs.rendered_atlas_specs.account_for_space(8, 8);
        assert_eq!(specs.num_path_instances(), 3);

        specs.convert_copies_to_renders();
        assert_eq!(specs.num_copies(), 0);
        assert_eq!(specs.num_renders(), 2);
        assert_eq!(specs.num_path_instances(), 3);
        assert!(specs.copy_atlas_specs.is_empty());
        assert_eq!(specs.rendered_atlas_specs.num_masks(), 2);
        assert_eq!(specs.rendered_atlas_specs.min_width, 9);
        assert_eq!(
            specs.rendered_path_stats[PathKind::Stroke.index()].num_total_points,
            stroke.num_points()
        );
    }

    #[test]
    fn test_copy_decision_uses_copy_volume() {
        let mut specs = PerFlushResourceSpecs::new(AtlasSpecs::new(2048, 8192, 512));
        let policy = CopyPolicy::default();
        specs.num_copied_paths[PathKind::Fill.index()] = 3;
        specs.copy_atlas_specs.account_for_space(10, 10);
        assert_eq!(specs.copy_decision(&policy), DoCopiesToCache::No);
        specs.copy_atlas_specs.account_for_space(300, 300);
        assert_eq!(specs.copy_decision(&policy), DoCopiesToCache::Yes);
    }
}
