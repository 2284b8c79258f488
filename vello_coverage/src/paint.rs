// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use peniko::{BlendMode, Color, Compose, Mix};

/// Everything about a paint except its color.
///
/// Ops only merge when their processor sets are equal, so anything that changes how a
/// draw's color reaches the target belongs here rather than in the per-path color.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProcessorSet {
    pub blend_mode: BlendMode,
    /// Whether some processor samples in the path's local coordinate space, such as a
    /// gradient or image brush. Such draws need the view matrix at execution time.
    pub uses_local_coords: bool,
}

impl Default for ProcessorSet {
    fn default() -> Self {
        Self {
            blend_mode: BlendMode::new(Mix::Normal, Compose::SrcOver),
            uses_local_coords: false,
        }
    }
}

impl ProcessorSet {
    /// Whether blending needs to read the destination, which standard blend hardware can't.
    pub fn reads_dst(&self) -> bool {
        !matches!(self.blend_mode.mix, Mix::Normal | Mix::Clip)
    }
}

/// The paint of a path draw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Paint {
    pub color: Color,
    pub processors: ProcessorSet,
}

impl Paint {
    pub fn solid(color: Color) -> Self {
        Self {
            color,
            processors: ProcessorSet::default(),
        }
    }

    pub fn with_blend_mode(mut self, blend_mode: impl Into<BlendMode>) -> Self {
        self.processors.blend_mode = blend_mode.into();
        self
    }

    pub fn with_local_coords(mut self, uses_local_coords: bool) -> Self {
        self.processors.uses_local_coords = uses_local_coords;
        self
    }
}
