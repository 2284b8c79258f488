// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use peniko::kurbo::Affine;
use peniko::BlendMode;
use smallvec::SmallVec;

use crate::math::IntRect;
use crate::recording::TextureProxy;

/// Generates the vertices of a draw and decides what it samples.
#[derive(Clone, Debug, PartialEq)]
pub enum GeometryProcessor {
    /// Covers each path instance with an octagon and resolves coverage from its mask.
    PathCover {
        atlas: TextureProxy,
        /// Applied to device positions to recover local coordinates, when the paint needs
        /// them. Identity otherwise.
        view_matrix: Affine,
    },
    /// Textured quads that copy mask texels out of `source` into the render target.
    AtlasCopy { source: TextureProxy },
}

impl GeometryProcessor {
    /// The texture sampled by this processor.
    pub fn texture(&self) -> TextureProxy {
        match self {
            Self::PathCover { atlas, .. } => *atlas,
            Self::AtlasCopy { source } => *source,
        }
    }
}

/// State that is fixed for all draws of an op.
#[derive(Clone, Debug, PartialEq)]
pub struct Pipeline {
    pub render_target: TextureProxy,
    pub blend_mode: BlendMode,
    pub scissor: Option<IntRect>,
    /// Whether a copy of the destination is bound so blending can read it.
    pub dst_texture: bool,
}

/// State that may change between draws sharing one [`Pipeline`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DynamicState {
    pub scissor_rect: Option<IntRect>,
    pub primitive_textures: SmallVec<[TextureProxy; 1]>,
}

impl Pipeline {
    /// Builds the dynamic state for a draw sampling `textures`.
    ///
    /// Returns `None` when there is nothing to set: no scissor and no textures.
    pub fn fixed_dynamic_state(&self, textures: &[TextureProxy]) -> Option<DynamicState> {
        if self.scissor.is_none() && textures.is_empty() {
            return None;
        }
        Some(DynamicState {
            scissor_rect: self.scissor,
            primitive_textures: textures.iter().copied().collect(),
        })
    }
}
