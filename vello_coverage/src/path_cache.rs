// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cross-flush cache of path masks.
//!
//! Entries are keyed by the shape fingerprint and matched against the transform the path
//! is drawn with. A mask rendered during one flush is first recorded as living in that
//! flush's coverage count atlas, which the renderer stashes. If it is drawn again in the
//! next flush, it is copied into a persistent literal coverage atlas and from then on
//! drawn straight from there.
//!
//! Entries are stored in an arena and handed out as generation checked
//! [`CacheEntryHandle`]s, so an op holding a handle to an evicted entry simply misses.
//! Entries are only ever freed in [`PathCache::post_flush`].

use std::collections::HashMap;

use peniko::kurbo::{Affine, Rect, Vec2};

use crate::atlas::AtlasKey;
use crate::config::PathCacheConfig;
use crate::math::{IntRect, IntVector};
use crate::recording::TextureProxy;
use crate::shape::{Shape, ShapeKey};

/// Subpixel translations closer than this draw with the same mask.
const SUBPIXEL_TOLERANCE: f32 = 1.0 / 256.0;

/// The part of a transform that affects the pixels of a mask.
///
/// Integer translation only moves a mask around, so it is split off and kept with the
/// draw request as its mask shift.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaskTransform {
    pub matrix_2x2: [f32; 4],
    pub subpixel_translate: [f32; 2],
}

impl MaskTransform {
    /// Returns the mask transform of `transform` along with the integer translation that
    /// was split off.
    pub fn new(transform: &Affine) -> (Self, IntVector) {
        let [a, b, c, d, e, f] = transform.as_coeffs();
        let (floor_x, floor_y) = (e.floor(), f.floor());
        let mask_transform = Self {
            matrix_2x2: [a as f32, b as f32, c as f32, d as f32],
            subpixel_translate: [(e - floor_x) as f32, (f - floor_y) as f32],
        };
        (mask_transform, IntVector::new(floor_x as i32, floor_y as i32))
    }

    pub fn fuzzy_eq(&self, other: &Self) -> bool {
        self.matrix_2x2 == other.matrix_2x2
            && self
                .subpixel_translate
                .iter()
                .zip(other.subpixel_translate)
                .all(|(a, b)| (a - b).abs() <= SUBPIXEL_TOLERANCE)
    }
}

/// Which kind of atlas a cached mask lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskKind {
    /// A coverage count atlas rendered during the previous flush. Only good as the source
    /// of a copy.
    Stashed,
    /// A persistent literal coverage atlas.
    Cached,
}

/// Where a cached mask lives.
///
/// Device space values are stored relative to the mask shift of the draw that produced the
/// mask, so any draw with an equal [`MaskTransform`] can reuse it by adding its own shift.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaskLocation {
    pub atlas_key: AtlasKey,
    pub kind: MaskKind,
    /// Translation from shift-normalized device space to atlas space.
    pub atlas_offset: IntVector,
    pub dev_bounds: Rect,
    /// Bounds in the space rotated by 45 degrees, where `(x, y)` maps to `(x + y, y - x)`.
    pub dev_bounds45: Rect,
    pub dev_ibounds: IntRect,
}

impl MaskLocation {
    pub fn is_stashed(&self) -> bool {
        self.kind == MaskKind::Stashed
    }

    pub fn is_cached(&self) -> bool {
        self.kind == MaskKind::Cached
    }

    /// Number of mask pixels this location accounts for in its atlas.
    fn num_pixels(&self) -> u64 {
        self.dev_ibounds.area() as u64
    }
}

/// Offset added to 45 degree bounds when device space is shifted by `shift`.
pub(crate) fn shift45(shift: IntVector) -> Vec2 {
    Vec2::new(f64::from(shift.x + shift.y), f64::from(shift.y - shift.x))
}

#[derive(Clone, Debug)]
pub struct PathCacheEntry {
    key: ShapeKey,
    /// Compared on lookup, since keys are only hashes.
    shape: Shape,
    mask_transform: MaskTransform,
    hit_count: u32,
    last_used: u64,
    location: Option<MaskLocation>,
    /// The atlas this entry's mask was placed in during the current flush.
    curr_flush_atlas: Option<TextureProxy>,
}

impl PathCacheEntry {
    pub fn key(&self) -> ShapeKey {
        self.key
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn mask_transform(&self) -> &MaskTransform {
        &self.mask_transform
    }

    /// How many times this entry was found, including the lookup that created it.
    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    pub fn location(&self) -> Option<&MaskLocation> {
        self.location.as_ref()
    }

    pub fn curr_flush_atlas(&self) -> Option<TextureProxy> {
        self.curr_flush_atlas
    }
}

/// A reference to a [`PathCacheEntry`] that goes stale once the entry is evicted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheEntryHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<PathCacheEntry>,
    /// Replaced by a newer entry for the same shape. Still reachable through handles until
    /// the end of the flush.
    orphaned: bool,
}

/// Pixel bookkeeping for one persistent atlas.
#[derive(Clone, Copy, Debug, Default)]
struct CachedAtlasInfo {
    num_path_pixels: u64,
    num_invalidated_pixels: u64,
}

/// Cache of path masks that outlives individual flushes.
#[derive(Debug)]
pub struct PathCache {
    config: PathCacheConfig,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    map: HashMap<ShapeKey, u32>,
    /// Incremented on every flush.
    serial: u64,
    atlas_info: HashMap<AtlasKey, CachedAtlasInfo>,
}

impl PathCache {
    pub fn new(config: PathCacheConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
            free_slots: Vec::new(),
            map: HashMap::new(),
            serial: 0,
            atlas_info: HashMap::new(),
        }
    }

    /// Number of live entries, including those replaced during the current flush.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the entry for `shape` drawn with `mask_transform`, counting a hit.
    ///
    /// An entry under the same key is replaced if its transform differs, or if its shape
    /// does and the keys merely collide. Handles to it stay valid until the end of the
    /// flush.
    pub fn find(
        &mut self,
        shape: &Shape,
        mask_transform: &MaskTransform,
        create_if_absent: bool,
    ) -> Option<CacheEntryHandle> {
        let key = shape.key();
        if let Some(&index) = self.map.get(&key) {
            let slot = &mut self.slots[index as usize];
            if let Some(entry) = slot.entry.as_mut() {
                if entry.shape.same_shape(shape) && entry.mask_transform.fuzzy_eq(mask_transform)
                {
                    entry.hit_count += 1;
                    entry.last_used = self.serial;
                    return Some(CacheEntryHandle {
                        index,
                        generation: slot.generation,
                    });
                }
            }
            slot.orphaned = true;
            self.map.remove(&key);
        }
        if !create_if_absent {
            return None;
        }
        let entry = PathCacheEntry {
            key,
            shape: shape.clone(),
            mask_transform: *mask_transform,
            hit_count: 1,
            last_used: self.serial,
            location: None,
            curr_flush_atlas: None,
        };
        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        slot.orphaned = false;
        self.map.insert(key, index);
        Some(CacheEntryHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Resolves `handle`, or `None` if its entry was evicted.
    pub fn get(&self, handle: CacheEntryHandle) -> Option<&PathCacheEntry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get_mut(&mut self, handle: CacheEntryHandle) -> Option<&mut PathCacheEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Forgets where the entry's mask lives, after its atlas turned out to be gone.
    pub fn reset_location(&mut self, handle: CacheEntryHandle) {
        let Some(entry) = self.get_mut(handle) else {
            return;
        };
        let location = entry.location.take();
        entry.curr_flush_atlas = None;
        if let Some(location) = location {
            self.invalidate(&location);
        }
    }

    /// Records that the entry's mask was rendered into the coverage count atlas `atlas_key`
    /// that will be stashed at the end of this flush.
    ///
    /// The device space values are those of the draw that rendered the mask, whose mask
    /// shift is `mask_shift`.
    #[allow(clippy::too_many_arguments, reason = "Mirrors the fields of MaskLocation")]
    pub fn init_as_stashed_atlas(
        &mut self,
        handle: CacheEntryHandle,
        atlas_key: AtlasKey,
        atlas_offset: IntVector,
        dev_bounds: Rect,
        dev_bounds45: Rect,
        dev_ibounds: IntRect,
        mask_shift: IntVector,
    ) {
        let Some(entry) = self.get_mut(handle) else {
            return;
        };
        debug_assert!(entry.location.is_none(), "Entry already has a mask");
        let shift = Vec2::new(f64::from(mask_shift.x), f64::from(mask_shift.y));
        entry.location = Some(MaskLocation {
            atlas_key,
            kind: MaskKind::Stashed,
            atlas_offset: atlas_offset + mask_shift,
            dev_bounds: dev_bounds - shift,
            dev_bounds45: dev_bounds45 - shift45(mask_shift),
            dev_ibounds: dev_ibounds.translate(-mask_shift),
        });
    }

    /// Moves the entry's mask from the stashed atlas into the persistent atlas `atlas_key`,
    /// where `atlas_offset` now translates its shift-normalized device space.
    pub fn update_to_cached_atlas(
        &mut self,
        handle: CacheEntryHandle,
        atlas_key: AtlasKey,
        atlas_offset: IntVector,
    ) {
        let Some(entry) = self.get_mut(handle) else {
            return;
        };
        let Some(location) = entry.location.as_mut() else {
            debug_assert!(false, "Only a stashed mask can be moved to a cached atlas");
            return;
        };
        debug_assert!(location.is_stashed());
        location.atlas_key = atlas_key;
        location.kind = MaskKind::Cached;
        location.atlas_offset = atlas_offset;
        let pixels = location.num_pixels();
        self.atlas_info.entry(atlas_key).or_default().num_path_pixels += pixels;
    }

    pub fn set_curr_flush_atlas(&mut self, handle: CacheEntryHandle, atlas: TextureProxy) {
        if let Some(entry) = self.get_mut(handle) {
            entry.curr_flush_atlas = Some(atlas);
        }
    }

    fn invalidate(&mut self, location: &MaskLocation) {
        if !location.is_cached() {
            return;
        }
        if let Some(info) = self.atlas_info.get_mut(&location.atlas_key) {
            info.num_invalidated_pixels += location.num_pixels();
        }
    }

    fn evict(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        let Some(entry) = slot.entry.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        if !slot.orphaned && self.map.get(&entry.key) == Some(&index) {
            self.map.remove(&entry.key);
        }
        slot.orphaned = false;
        self.free_slots.push(index);
        if let Some(location) = entry.location {
            self.invalidate(&location);
        }
    }

    /// Ends a flush: evicts replaced, old and excess entries, and returns the keys of
    /// persistent atlases that are mostly invalidated and should be purged.
    pub fn post_flush(&mut self) -> Vec<AtlasKey> {
        let serial = self.serial;
        self.serial += 1;

        let mut live = Vec::new();
        let mut stale = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(entry) = slot.entry.as_mut() else {
                continue;
            };
            entry.curr_flush_atlas = None;
            if slot.orphaned || serial - entry.last_used > self.config.max_entry_age {
                stale.push(index as u32);
            } else {
                live.push((entry.last_used, index as u32));
            }
        }
        if live.len() > self.config.max_entries {
            live.sort_unstable();
            let excess = live.len() - self.config.max_entries;
            stale.extend(live[..excess].iter().map(|&(_, index)| index));
        }
        for index in stale {
            self.evict(index);
        }

        let mut purged = Vec::new();
        self.atlas_info.retain(|&key, info| {
            if info.num_invalidated_pixels * 2 >= info.num_path_pixels {
                purged.push(key);
                false
            } else {
                true
            }
        });
        if !purged.is_empty() {
            log::debug!("Purging {} invalidated path atlases", purged.len());
        }
        purged
    }
}
