// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Packing of path masks into atlas textures.
//!
//! An atlas starts out just large enough for what the flush is expected to need and
//! doubles its shorter side whenever a mask doesn't fit, up to a maximum size. Once a full
//! atlas can't grow any more, it is retired and the [`AtlasStack`] starts a new one.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use guillotiere::{size2, AtlasAllocator};
use thiserror::Error;

use crate::math::IntVector;
use crate::recording::{TextureFormat, TextureProxy};

/// Empty texels kept between neighboring masks so that filtering never bleeds across them.
pub const ATLAS_PADDING: u32 = 1;

/// Number of buckets in [`AtlasSpecs::size_classes`].
pub const NUM_SIZE_CLASSES: usize = 16;

/// Errors that can occur while placing a mask in an atlas.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtlasError {
    /// The mask is larger than any atlas may become.
    #[error("A {width}x{height} mask doesn't fit in an atlas of at most {max}x{max}")]
    TextureTooLarge { width: u32, height: u32, max: u32 },
    /// The mask has no area.
    #[error("Can't place an empty mask")]
    EmptyRect,
}

/// Identifies an atlas across flushes, after its [`TextureProxy`] has been handed to the
/// resource provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AtlasKey(NonZeroU64);

impl AtlasKey {
    pub fn next() -> Self {
        static KEY_COUNTER: AtomicU64 = AtomicU64::new(1);
        let key = KEY_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(key).unwrap_or(NonZeroU64::MIN))
    }
}

/// What a set of masks requires of the atlases they'll be packed into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AtlasSpecs {
    /// Atlases don't grow past this unless a single mask needs more room.
    pub max_preferred_texture_size: u32,
    /// Hard limit on atlas dimensions.
    pub max_texture_size: u32,
    pub min_texture_size: u32,
    /// Width of the widest mask. If there are 100 masks of 20x10, this is 20.
    pub min_width: u32,
    /// Height of the tallest mask.
    pub min_height: u32,
    /// Total area of all masks, including padding.
    pub approx_num_pixels: u64,
    /// Mask counts by the size of their longer side: class `n` counts sides in
    /// `[2^(n-1), 2^n)`, with the last class collecting everything larger.
    pub size_classes: [u32; NUM_SIZE_CLASSES],
}

impl AtlasSpecs {
    pub fn new(max_preferred_texture_size: u32, max_texture_size: u32, min_texture_size: u32) -> Self {
        let max_preferred_texture_size = max_preferred_texture_size.min(max_texture_size);
        Self {
            max_preferred_texture_size,
            max_texture_size,
            min_texture_size: min_texture_size.min(max_preferred_texture_size),
            ..Default::default()
        }
    }

    /// Adds space for a `width` by `height` mask.
    pub fn account_for_space(&mut self, width: u32, height: u32) {
        self.min_width = self.min_width.max(width);
        self.min_height = self.min_height.max(height);
        let padding = u64::from(ATLAS_PADDING);
        self.approx_num_pixels += (u64::from(width) + padding) * (u64::from(height) + padding);
        self.size_classes[size_class(width.max(height))] += 1;
    }

    /// Moves every mask accounted for in `other` into `self`, leaving `other` empty.
    pub fn absorb(&mut self, other: &mut Self) {
        self.min_width = self.min_width.max(other.min_width);
        self.min_height = self.min_height.max(other.min_height);
        self.approx_num_pixels += other.approx_num_pixels;
        for (class, count) in self.size_classes.iter_mut().zip(other.size_classes) {
            *class += count;
        }
        *other = Self::new(
            other.max_preferred_texture_size,
            other.max_texture_size,
            other.min_texture_size,
        );
    }

    pub fn num_masks(&self) -> u32 {
        self.size_classes.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_masks() == 0
    }

    /// Largest size an atlas for these masks may grow to.
    fn atlas_size_limit(&self) -> u32 {
        self.max_preferred_texture_size
            .max(self.min_width.saturating_add(ATLAS_PADDING))
            .max(self.min_height.saturating_add(ATLAS_PADDING))
            .min(self.max_texture_size)
    }
}

fn size_class(side: u32) -> usize {
    ((u32::BITS - side.leading_zeros()) as usize).min(NUM_SIZE_CLASSES - 1)
}

/// Smallest `n` with `2^n >= x`.
fn next_log2(x: u64) -> u32 {
    if x <= 1 {
        0
    } else {
        u64::BITS - (x - 1).leading_zeros()
    }
}

/// One atlas texture and the allocator packing masks into it.
pub struct Atlas {
    texture: TextureProxy,
    allocator: AtlasAllocator,
    width: u32,
    height: u32,
    max_size: u32,
    /// Extent of the area actually covered by masks.
    draw_bounds: [u32; 2],
    key: Option<AtlasKey>,
}

impl fmt::Debug for Atlas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atlas")
            .field("texture", &self.texture)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("draw_bounds", &self.draw_bounds)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Atlas {
    pub fn new(format: TextureFormat, specs: &AtlasSpecs) -> Self {
        let max_size = specs.atlas_size_limit();
        // Begin with the first pow2 dimensions whose area is theoretically large enough to
        // contain the pending masks, favoring height over width.
        let log2_area = next_log2(specs.approx_num_pixels.max(1)).min(62);
        let mut height = 1_u64 << ((log2_area + 1) / 2);
        let mut width = 1_u64 << (log2_area / 2);
        let lo = u64::from(specs.min_texture_size);
        let hi = u64::from(specs.max_preferred_texture_size.max(specs.min_texture_size));
        width = width.clamp(lo, hi);
        height = height.clamp(lo, hi);
        let (mut width, mut height) = (width as u32, height as u32);
        if width < specs.min_width || height < specs.min_height {
            // A particularly large mask. Start at its size; the atlas grows as needed.
            width = specs.min_width.saturating_add(ATLAS_PADDING).min(max_size);
            height = specs.min_height.saturating_add(ATLAS_PADDING).min(max_size);
        }
        let (width, height) = (width.max(1).min(max_size), height.max(1).min(max_size));
        Self {
            texture: TextureProxy::new(format),
            allocator: AtlasAllocator::new(size2(width as i32, height as i32)),
            width,
            height,
            max_size,
            draw_bounds: [0, 0],
            key: None,
        }
    }

    pub fn texture(&self) -> TextureProxy {
        self.texture
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn draw_bounds(&self) -> [u32; 2] {
        self.draw_bounds
    }

    pub fn key(&self) -> Option<AtlasKey> {
        self.key
    }

    pub fn get_or_assign_key(&mut self) -> AtlasKey {
        *self.key.get_or_insert_with(AtlasKey::next)
    }

    /// Places a mask, growing the atlas if needed. Returns the top-left corner of the
    /// mask's region, or `None` if the atlas is full.
    pub fn add_rect(&mut self, width: u32, height: u32) -> Option<IntVector> {
        let padded = size2(
            (width + ATLAS_PADDING) as i32,
            (height + ATLAS_PADDING) as i32,
        );
        loop {
            if let Some(alloc) = self.allocator.allocate(padded) {
                let (x, y) = (alloc.rectangle.min.x, alloc.rectangle.min.y);
                self.draw_bounds[0] = self.draw_bounds[0].max(x as u32 + width);
                self.draw_bounds[1] = self.draw_bounds[1].max(y as u32 + height);
                return Some(IntVector::new(x, y));
            }
            if !self.grow() {
                return None;
            }
        }
    }

    fn grow(&mut self) -> bool {
        if self.width >= self.max_size && self.height >= self.max_size {
            return false;
        }
        if self.height <= self.width {
            self.height = (self.height * 2).min(self.max_size);
        } else {
            self.width = (self.width * 2).min(self.max_size);
        }
        self.allocator
            .grow(size2(self.width as i32, self.height as i32));
        true
    }
}

/// Where a mask was placed by [`AtlasStack::add_rect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtlasPlacement {
    /// Index of the atlas within its stack.
    pub atlas_index: usize,
    pub texture: TextureProxy,
    /// Top-left corner of the mask's region.
    pub location: IntVector,
    /// Set when the previous atlas ran out of room and was retired to make this placement.
    pub retired: Option<usize>,
}

/// A sequence of atlases of one format, filled one after another.
#[derive(Debug)]
pub struct AtlasStack {
    format: TextureFormat,
    specs: AtlasSpecs,
    atlases: Vec<Atlas>,
}

impl AtlasStack {
    pub fn new(format: TextureFormat, specs: AtlasSpecs) -> Self {
        Self {
            format,
            specs,
            atlases: Vec::new(),
        }
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn add_rect(&mut self, width: u32, height: u32) -> Result<AtlasPlacement, AtlasError> {
        if width == 0 || height == 0 {
            return Err(AtlasError::EmptyRect);
        }
        let max = self.specs.max_texture_size;
        if width.saturating_add(ATLAS_PADDING) > max || height.saturating_add(ATLAS_PADDING) > max
        {
            return Err(AtlasError::TextureTooLarge { width, height, max });
        }
        let mut retired = None;
        let last_index = self.atlases.len().wrapping_sub(1);
        if let Some(current) = self.atlases.last_mut() {
            if let Some(location) = current.add_rect(width, height) {
                return Ok(AtlasPlacement {
                    atlas_index: last_index,
                    texture: current.texture(),
                    location,
                    retired: None,
                });
            }
            log::trace!(
                "Retiring a full {}x{} atlas",
                current.width(),
                current.height()
            );
            retired = Some(last_index);
        }
        // Masks larger than anything accounted for can show up when requests were
        // promoted or converted, so the new atlas is sized for this one as well.
        let mut specs = self.specs;
        specs.min_width = specs.min_width.max(width);
        specs.min_height = specs.min_height.max(height);
        let mut atlas = Atlas::new(self.format, &specs);
        let location = atlas
            .add_rect(width, height)
            .ok_or(AtlasError::TextureTooLarge { width, height, max })?;
        let texture = atlas.texture();
        self.atlases.push(atlas);
        Ok(AtlasPlacement {
            atlas_index: self.atlases.len() - 1,
            texture,
            location,
            retired,
        })
    }

    pub fn current(&self) -> Option<&Atlas> {
        self.atlases.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Atlas> {
        self.atlases.last_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Atlas> {
        self.atlases.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Atlas> {
        self.atlases.get_mut(index)
    }

    pub fn atlases(&self) -> &[Atlas] {
        &self.atlases
    }

    pub fn len(&self) -> usize {
        self.atlases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atlases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> AtlasSpecs {
        AtlasSpecs::new(256, 1024, 64)
    }

    #[test]
    fn test_specs_accounting() {
        let mut specs = specs();
        specs.account_for_space(20, 10);
        specs.account_for_space(5, 40);
        assert_eq!(specs.min_width, 20);
        assert_eq!(specs.min_height, 40);
        assert_eq!(specs.approx_num_pixels, 21 * 11 + 6 * 41);
        assert_eq!(specs.size_classes[size_class(20)], 1);
        assert_eq!(specs.size_classes[size_class(40)], 1);
        assert_eq!(specs.num_masks(), 2);

        let mut other = self::specs();
        other.account_for_space(100, 100);
        specs.absorb(&mut other);
        assert_eq!(specs.min_width, 100);
        assert_eq!(specs.num_masks(), 3);
        assert!(other.is_empty());
        assert_eq!(other.max_preferred_texture_size, 256);
    }

    #[test]
    fn test_initial_size_respects_minimum() {
        let mut specs = specs();
        specs.account_for_space(10, 10);
        let atlas = Atlas::new(TextureFormat::CoverageCount, &specs);
        assert_eq!((atlas.width(), atlas.height()), (64, 64));
    }

    #[test]
    fn test_atlas_grows_before_retiring() {
        let mut specs = specs();
        for _ in 0..4 {
            specs.account_for_space(63, 63);
        }
        let mut stack = AtlasStack::new(TextureFormat::CoverageCount, specs);
        let first = stack.add_rect(63, 63).unwrap();
        assert_eq!(first.location, IntVector::ZERO);
        for _ in 0..3 {
            let placement = stack.add_rect(63, 63).unwrap();
            assert_eq!(placement.atlas_index, 0);
            assert_eq!(placement.retired, None);
        }
        assert_eq!(stack.len(), 1);
        let atlas = stack.current().unwrap();
        assert!(atlas.width() <= 256 && atlas.height() <= 256);
        assert!(atlas.draw_bounds()[0] >= 63);
    }

    #[test]
    fn test_full_atlas_is_retired() {
        let mut stack = AtlasStack::new(TextureFormat::Alpha8, AtlasSpecs::new(128, 128, 64));
        let first = stack.add_rect(100, 100).unwrap();
        let second = stack.add_rect(100, 100).unwrap();
        assert_eq!(first.atlas_index, 0);
        assert_eq!(second.atlas_index, 1);
        assert_eq!(second.retired, Some(0));
        assert_ne!(first.texture, second.texture);
    }

    #[test]
    fn test_oversized_mask_is_an_error() {
        let mut stack = AtlasStack::new(TextureFormat::Alpha8, AtlasSpecs::new(128, 128, 64));
        assert_eq!(
            stack.add_rect(500, 10),
            Err(AtlasError::TextureTooLarge {
                width: 500,
                height: 10,
                max: 128
            })
        );
        assert_eq!(stack.add_rect(0, 10), Err(AtlasError::EmptyRect));
        // Padding must not wrap the size check.
        assert!(matches!(
            stack.add_rect(u32::MAX, 10),
            Err(AtlasError::TextureTooLarge { .. })
        ));
        assert!(stack.is_empty());
    }

    #[test]
    fn keys_are_stable_once_assigned() {
        let mut atlas = Atlas::new(TextureFormat::Alpha8, &specs());
        assert_eq!(atlas.key(), None);
        let key = atlas.get_or_assign_key();
        assert_eq!(atlas.get_or_assign_key(), key);
        assert_ne!(AtlasKey::next(), key);
    }
}
