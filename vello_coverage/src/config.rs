// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tunable policy for the coverage counting renderer.
//!
//! None of these values affect correctness, only how much work is done per flush and how
//! much atlas memory stays resident between flushes.

use crate::draw_op::{DoCopiesToCache, Visibility};

/// Decides how visible a clipped path must be for its whole mask to be worth caching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilityPolicy {
    /// Clipped paths showing at least this fraction of their area are `MostlyComplete`.
    pub min_visible_fraction: f64,
    /// Paths whose unclipped area is below this many pixels are always `MostlyComplete`.
    /// Rendering a small mask whole costs next to nothing.
    pub small_path_area: i64,
}

impl Default for VisibilityPolicy {
    fn default() -> Self {
        Self {
            min_visible_fraction: 0.5,
            small_path_area: 100 * 100,
        }
    }
}

impl VisibilityPolicy {
    /// Classifies a path that is partially outside the clip.
    pub fn classify_clipped(&self, clipped_area: i64, unclipped_area: i64) -> Visibility {
        if clipped_area as f64 >= unclipped_area as f64 * self.min_visible_fraction
            || unclipped_area < self.small_path_area
        {
            Visibility::MostlyComplete
        } else {
            Visibility::Partial
        }
    }
}

/// Decides whether masks left in the previous flush's atlas get copied into a persistent
/// atlas, or are simply rendered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPolicy {
    /// Copy when more than this many paths would be copied.
    pub min_copied_paths: u32,
    /// Copy when the copied masks cover more than this many pixels.
    pub min_copied_pixels: u64,
}

impl Default for CopyPolicy {
    fn default() -> Self {
        Self {
            min_copied_paths: 100,
            min_copied_pixels: 256 * 256,
        }
    }
}

impl CopyPolicy {
    pub fn decide(&self, num_copies: u32, copy_pixels: u64) -> DoCopiesToCache {
        if num_copies > self.min_copied_paths || copy_pixels > self.min_copied_pixels {
            DoCopiesToCache::Yes
        } else {
            DoCopiesToCache::No
        }
    }
}

/// Sizing of the path mask cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathCacheConfig {
    /// Least recently used entries beyond this count are evicted after each flush.
    pub max_entries: usize,
    /// Entries not drawn for this many flushes are evicted.
    pub max_entry_age: u64,
}

impl Default for PathCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1 << 16,
            max_entry_age: 64,
        }
    }
}

/// Configuration of a [`CoverageCountingPathRenderer`](crate::CoverageCountingPathRenderer).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageConfig {
    pub visibility: VisibilityPolicy,
    pub copy_policy: CopyPolicy,
    /// Atlases stop growing at this size, unless a single mask needs more room.
    pub max_preferred_atlas_size: u32,
    /// Atlases never start smaller than this.
    pub min_atlas_size: u32,
    /// `None` disables caching of masks across flushes.
    pub path_cache: Option<PathCacheConfig>,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            visibility: VisibilityPolicy::default(),
            copy_policy: CopyPolicy::default(),
            max_preferred_atlas_size: 2048,
            min_atlas_size: 512,
            path_cache: Some(PathCacheConfig::default()),
        }
    }
}
