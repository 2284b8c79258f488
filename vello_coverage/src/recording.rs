// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use peniko::kurbo::Affine;
use peniko::Style;

use crate::math::{IntRect, IntVector};
use crate::mesh::MeshDraw;
use crate::pipeline::{DynamicState, GeometryProcessor, Pipeline};
use crate::shape::Shape;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(pub NonZeroU64);

impl ResourceId {
    pub fn next() -> Self {
        // We initialize with 1 so that the value is never zero.
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }
}

/// Proxy used as a handle to a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferProxy {
    pub size: u64,
    pub id: ResourceId,
    pub name: &'static str,
}

impl BufferProxy {
    pub fn new(size: u64, name: &'static str) -> Self {
        let id = ResourceId::next();
        debug_assert!(size > 0);
        Self { id, size, name }
    }
}

/// Texel formats of the textures this crate draws into or samples from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Signed coverage counts, accumulated with additive blending. Half float.
    CoverageCount,
    /// Resolved coverage, one unorm byte per texel.
    Alpha8,
    /// The color target that paths are finally drawn into.
    Rgba8,
}

impl TextureFormat {
    #[cfg(feature = "wgpu")]
    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            Self::CoverageCount => wgpu::TextureFormat::R16Float,
            Self::Alpha8 => wgpu::TextureFormat::R8Unorm,
            Self::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

/// Proxy used as a handle to a texture.
///
/// Atlases grow while masks are being packed, so a texture's identity is fixed before its
/// size. The size is given when the texture is allocated with
/// [`Command::AllocateTexture`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureProxy {
    pub id: ResourceId,
    pub format: TextureFormat,
}

impl TextureProxy {
    pub fn new(format: TextureFormat) -> Self {
        Self {
            id: ResourceId::next(),
            format,
        }
    }
}

/// One path to be accumulated into a coverage count atlas.
#[derive(Clone, Debug)]
pub struct AtlasPathDraw {
    pub shape: Shape,
    pub transform: Affine,
    /// Translation from device space to the path's location in the atlas.
    pub dev_to_atlas_offset: IntVector,
    /// Atlas-space scissor for paths that were clipped before placement.
    pub scissor: Option<IntRect>,
}

impl AtlasPathDraw {
    pub fn style(&self) -> &Style {
        self.shape.style()
    }
}

/// Every path rendered into one coverage count atlas during a flush.
#[derive(Clone, Debug)]
pub struct CoverageBatch {
    pub atlas: TextureProxy,
    /// The part of the atlas covered by paths; the rest needn't be cleared.
    pub draw_bounds: [u32; 2],
    pub paths: Vec<AtlasPathDraw>,
}

/// A single draw call against a render target.
#[derive(Clone, Debug)]
pub struct DrawCommand {
    pub geometry: GeometryProcessor,
    pub pipeline: Pipeline,
    pub dynamic_state: Option<DynamicState>,
    pub draw: MeshDraw,
}

/// Single command inside a [`Recording`] to get executed by an engine.
#[derive(Clone, Debug)]
pub enum Command {
    /// Commands the data to be uploaded to the given buffer.
    Upload(BufferProxy, Vec<u8>),
    /// Commands a texture to be created for the proxy, with the given width and height.
    AllocateTexture(TextureProxy, [u32; 2]),
    /// Commands the proxy `to` to take over the backing texture of `from`.
    RecycleTexture {
        from: TextureProxy,
        to: TextureProxy,
    },
    /// Commands a coverage count atlas to be cleared and rasterized.
    RenderCoverage(CoverageBatch),
    Draw(DrawCommand),
    /// Commands to free the texture.
    FreeTexture(TextureProxy),
}

/// List of [`Command`]s for an engine to execute in order.
#[derive(Clone, Debug, Default)]
pub struct Recording {
    pub commands: Vec<Command>,
}

impl Recording {
    /// Appends a [`Command`] to the back of the [`Recording`].
    pub fn push(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    /// Commands to upload the given data to a new buffer with the given name.
    /// Returns a [`BufferProxy`] to the buffer.
    pub fn upload(&mut self, name: &'static str, data: impl Into<Vec<u8>>) -> BufferProxy {
        let data = data.into();
        let buf_proxy = BufferProxy::new(data.len() as u64, name);
        self.push(Command::Upload(buf_proxy, data));
        buf_proxy
    }

    /// Commands the data to be uploaded into an existing buffer.
    pub fn upload_into(&mut self, buf: BufferProxy, data: impl Into<Vec<u8>>) {
        let data = data.into();
        debug_assert!(data.len() as u64 <= buf.size);
        self.push(Command::Upload(buf, data));
    }

    /// Queues a zeroed upload of `len` bytes into `buf` and returns the bytes to fill in.
    pub fn stage_upload(&mut self, buf: BufferProxy, len: usize) -> &mut [u8] {
        self.push(Command::Upload(buf, vec![0; len]));
        match self.commands.last_mut() {
            Some(Command::Upload(_, data)) => data.as_mut_slice(),
            _ => unreachable!("an upload was just pushed"),
        }
    }

    pub fn allocate_texture(&mut self, texture: TextureProxy, width: u32, height: u32) {
        self.push(Command::AllocateTexture(texture, [width, height]));
    }

    pub fn recycle_texture(&mut self, from: TextureProxy, to: TextureProxy) {
        self.push(Command::RecycleTexture { from, to });
    }

    pub fn render_coverage(&mut self, batch: CoverageBatch) {
        self.push(Command::RenderCoverage(batch));
    }

    /// Issue a draw call
    pub fn draw(&mut self, cmd: DrawCommand) {
        self.push(Command::Draw(cmd));
    }

    /// Commands to free the given texture.
    pub fn free_texture(&mut self, texture: TextureProxy) {
        self.push(Command::FreeTexture(texture));
    }

    /// Iterates over the draw calls in submission order.
    pub fn draws(&self) -> impl Iterator<Item = &DrawCommand> + '_ {
        self.commands.iter().filter_map(|cmd| match cmd {
            Command::Draw(draw) => Some(draw),
            _ => None,
        })
    }

    /// Returns a [`Vec`] containing all the [`Command`]s in order.
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ids_are_unique() {
        let a = ResourceId::next();
        let b = ResourceId::next();
        assert_ne!(a, b);
        assert_ne!(
            TextureProxy::new(TextureFormat::Alpha8),
            TextureProxy::new(TextureFormat::Alpha8)
        );
    }

    #[test]
    fn staged_upload_is_written_in_place() {
        let mut recording = Recording::default();
        let buf = BufferProxy::new(8, "staging");
        recording.stage_upload(buf, 8)[3] = 7;
        match &recording.commands[..] {
            [Command::Upload(proxy, data)] => {
                assert_eq!(proxy.id, buf.id);
                assert_eq!(data[3], 7);
            }
            _ => panic!("expected a single upload"),
        }
    }
}
