// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Atlases and buffers shared by every op of a flush.

use std::f64::consts::SQRT_2;

use bytemuck::{Pod, Zeroable};
use peniko::kurbo::{Affine, Rect, Vec2};
use peniko::{BlendMode, Color, Compose, Mix};
use static_assertions::const_assert_eq;

use crate::atlas::{AtlasKey, AtlasStack};
use crate::flush::FlushState;
use crate::math::{IntRect, IntVector};
use crate::mesh::QuadHelper;
use crate::path_cache::{shift45, MaskLocation};
use crate::pipeline::{GeometryProcessor, Pipeline};
use crate::provider::ResourceProvider;
use crate::recording::{AtlasPathDraw, BufferProxy, CoverageBatch, TextureFormat, TextureProxy};
use crate::renderer::StashedAtlas;
use crate::shape::Shape;
use crate::specs::PerFlushResourceSpecs;
use crate::{Error, Result};

/// Number of indices drawn per path instance.
pub const PATH_INDICES_PER_INSTANCE: u32 = 18;

/// Triangle fan over the 8 vertices of the octagon that bounds a path instance: the
/// intersection of its device bounds and its 45 degree bounds.
pub(crate) const OCTAGON_INDICES: [u16; PATH_INDICES_PER_INSTANCE as usize] = [
    0, 1, 2, //
    0, 2, 3, //
    0, 3, 4, //
    0, 4, 5, //
    0, 5, 6, //
    0, 6, 7, //
];

/// Per-instance data of a path draw, as laid out in the instance buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct PathInstance {
    pub dev_bounds: [f32; 4],
    pub dev_bounds45: [f32; 4],
    pub dev_to_atlas_offset: [i32; 2],
    /// Premultiplied RGBA, packed little endian.
    pub color: u32,
    pub flags: u32,
}

const_assert_eq!(size_of::<PathInstance>(), 48);

impl PathInstance {
    /// The mask holds coverage counts that resolve with the even-odd rule.
    pub const EVEN_ODD: u32 = 1;

    pub fn new(
        dev_bounds: Rect,
        dev_bounds45: Rect,
        dev_to_atlas_offset: IntVector,
        color: Color,
        even_odd: bool,
    ) -> Self {
        Self {
            dev_bounds: rect_to_f32(dev_bounds),
            dev_bounds45: rect_to_f32(dev_bounds45),
            dev_to_atlas_offset: [dev_to_atlas_offset.x, dev_to_atlas_offset.y],
            color: color.to_premul_u32(),
            flags: if even_odd { Self::EVEN_ODD } else { 0 },
        }
    }

    /// An instance drawing a cached mask with the given mask shift.
    pub fn from_mask_location(
        location: &MaskLocation,
        mask_shift: IntVector,
        color: Color,
        even_odd: bool,
    ) -> Self {
        let shift = Vec2::new(f64::from(mask_shift.x), f64::from(mask_shift.y));
        Self::new(
            location.dev_bounds + shift,
            location.dev_bounds45 + shift45(mask_shift),
            location.atlas_offset - mask_shift,
            color,
            even_odd,
        )
    }

    pub fn is_even_odd(&self) -> bool {
        self.flags & Self::EVEN_ODD != 0
    }
}

fn rect_to_f32(rect: Rect) -> [f32; 4] {
    [rect.x0 as f32, rect.y0 as f32, rect.x1 as f32, rect.y1 as f32]
}

/// A vertex of a quad copying a mask from the stashed atlas into a copy atlas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct CopyVertex {
    /// Position in the copy atlas.
    pub dst: [f32; 2],
    /// Position in the stashed atlas.
    pub src: [f32; 2],
    /// [`PathInstance::EVEN_ODD`] if the counts resolve with the even-odd rule.
    pub flags: u32,
}

#[derive(Clone, Copy, Debug)]
struct CopyQuad {
    src: IntRect,
    dst: IntVector,
    even_odd: bool,
}

impl CopyQuad {
    /// Vertices ordered top-left, top-right, bottom-left, bottom-right.
    fn vertices(&self) -> [CopyVertex; 4] {
        let (w, h) = (self.src.width() as f32, self.src.height() as f32);
        let (dx, dy) = (self.dst.x as f32, self.dst.y as f32);
        let (sx, sy) = (self.src.x0 as f32, self.src.y0 as f32);
        let flags = if self.even_odd {
            PathInstance::EVEN_ODD
        } else {
            0
        };
        [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)].map(|(x, y)| CopyVertex {
            dst: [dx + x, dy + y],
            src: [sx + x, sy + y],
            flags,
        })
    }
}

/// A path mask placed in this flush's coverage count atlas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderedPath {
    pub atlas: TextureProxy,
    /// Index of the atlas within the flush's coverage count atlases.
    pub atlas_index: usize,
    pub dev_bounds: Rect,
    pub dev_bounds45: Rect,
    /// The rendered part of the path, in device space.
    pub dev_ibounds: IntRect,
    pub dev_to_atlas_offset: IntVector,
}

/// Resources allocated once per flush from the aggregated [`PerFlushResourceSpecs`].
#[derive(Debug)]
pub struct PerFlushResources {
    copy_atlas_stack: AtlasStack,
    rendered_atlas_stack: AtlasStack,
    /// Paths to rasterize, indexed like the coverage count atlases.
    rendered_batches: Vec<Vec<AtlasPathDraw>>,
    /// Copies to draw, indexed like the copy atlases.
    copy_batches: Vec<Vec<CopyQuad>>,
    /// Where copies read from: the previous flush's stashed atlas.
    copy_source: Option<TextureProxy>,
    path_instances: Vec<PathInstance>,
    instance_capacity: u32,
    instance_buffer: BufferProxy,
    path_index_buffer: BufferProxy,
    /// Copies that space was reserved for, and how many were made.
    copy_capacity: u32,
    num_copies: u32,
}

impl PerFlushResources {
    /// Allocates the instance buffer and sets up atlas stacks sized by `specs`.
    ///
    /// `copy_source` must be given whenever `specs` plans copies.
    pub fn new(
        specs: &PerFlushResourceSpecs,
        provider: &mut dyn ResourceProvider,
        copy_source: Option<TextureProxy>,
    ) -> Result<Self> {
        let copy_capacity = specs.num_copies();
        if copy_capacity > 0 && copy_source.is_none() {
            return Err(Error::CopySourceMissing);
        }
        let path_index_buffer = provider
            .path_index_buffer()
            .ok_or(Error::IndexBufferUnavailable)?;
        let instance_capacity = specs.num_path_instances().max(1);
        let size = u64::from(instance_capacity) * size_of::<PathInstance>() as u64;
        let instance_buffer = provider
            .make_instance_buffer(size)
            .ok_or(Error::InstanceBufferAllocation { size })?;
        Ok(Self {
            copy_atlas_stack: AtlasStack::new(TextureFormat::Alpha8, specs.copy_atlas_specs),
            rendered_atlas_stack: AtlasStack::new(
                TextureFormat::CoverageCount,
                specs.rendered_atlas_specs,
            ),
            rendered_batches: Vec::new(),
            copy_batches: Vec::new(),
            copy_source,
            path_instances: Vec::with_capacity(instance_capacity as usize),
            instance_capacity,
            instance_buffer,
            path_index_buffer,
            copy_capacity,
            num_copies: 0,
        })
    }

    pub fn instance_buffer(&self) -> BufferProxy {
        self.instance_buffer
    }

    pub fn path_index_buffer(&self) -> BufferProxy {
        self.path_index_buffer
    }

    pub fn next_path_instance_idx(&self) -> u32 {
        self.path_instances.len() as u32
    }

    pub fn path_instances(&self) -> &[PathInstance] {
        &self.path_instances
    }

    /// Appends an instance, or returns `false` if the instance buffer is full.
    pub fn append_draw_path_instance(&mut self, instance: PathInstance) -> bool {
        if self.next_path_instance_idx() >= self.instance_capacity {
            debug_assert!(false, "More path instances than were accounted for");
            return false;
        }
        self.path_instances.push(instance);
        true
    }

    /// Whether space for copies was set aside in this flush.
    pub fn has_copy_reservations(&self) -> bool {
        self.copy_capacity > 0
    }

    /// Reserves room in a copy atlas for the stashed mask at `location`.
    ///
    /// Returns the copy atlas, its key, and the translation from the mask's shift-normalized
    /// device space to its new place.
    pub fn copy_path_to_cached_atlas(
        &mut self,
        location: &MaskLocation,
        even_odd: bool,
    ) -> Option<(TextureProxy, AtlasKey, IntVector)> {
        debug_assert!(location.is_stashed());
        if self.num_copies >= self.copy_capacity {
            debug_assert!(false, "More copies than were accounted for");
            return None;
        }
        let ibounds = location.dev_ibounds;
        let placement = match self
            .copy_atlas_stack
            .add_rect(ibounds.width() as u32, ibounds.height() as u32)
        {
            Ok(placement) => placement,
            Err(err) => {
                log::debug!("Dropping a path copy: {err}");
                return None;
            }
        };
        let atlas = self.copy_atlas_stack.get_mut(placement.atlas_index)?;
        let key = atlas.get_or_assign_key();
        if self.copy_batches.len() <= placement.atlas_index {
            self.copy_batches
                .resize_with(placement.atlas_index + 1, Vec::new);
        }
        self.copy_batches[placement.atlas_index].push(CopyQuad {
            src: ibounds.translate(location.atlas_offset),
            dst: placement.location,
            even_odd,
        });
        self.num_copies += 1;
        Some((placement.texture, key, placement.location - ibounds.origin()))
    }

    /// Places the part of `shape` within `mask_ibounds` in a coverage count atlas and
    /// queues it for rasterization.
    ///
    /// Returns `None`, dropping the path, if no atlas can hold it.
    pub fn render_shape_in_atlas(
        &mut self,
        mask_ibounds: IntRect,
        transform: Affine,
        shape: &Shape,
    ) -> Option<RenderedPath> {
        let placement = match self
            .rendered_atlas_stack
            .add_rect(mask_ibounds.width() as u32, mask_ibounds.height() as u32)
        {
            Ok(placement) => placement,
            Err(err) => {
                log::debug!("Dropping a path render: {err}");
                return None;
            }
        };
        let dev_to_atlas_offset = placement.location - mask_ibounds.origin();
        let dev_bounds = shape.device_bounds(transform);
        let dev_bounds45 = device_bounds45(shape, transform);
        let scissor = (!mask_ibounds.contains(&IntRect::round_out(dev_bounds)))
            .then(|| mask_ibounds.translate(dev_to_atlas_offset));
        if self.rendered_batches.len() <= placement.atlas_index {
            self.rendered_batches
                .resize_with(placement.atlas_index + 1, Vec::new);
        }
        self.rendered_batches[placement.atlas_index].push(AtlasPathDraw {
            shape: shape.clone(),
            transform,
            dev_to_atlas_offset,
            scissor,
        });
        Some(RenderedPath {
            atlas: placement.texture,
            atlas_index: placement.atlas_index,
            dev_bounds,
            dev_bounds45,
            dev_ibounds: mask_ibounds,
            dev_to_atlas_offset,
        })
    }

    /// Whether the coverage count atlas at `atlas_index` is the one that will be stashed at
    /// the end of the flush, as far as is known so far.
    pub fn is_next_atlas_to_stash(&self, atlas_index: usize) -> bool {
        atlas_index + 1 == self.rendered_atlas_stack.len()
    }

    /// Key of the coverage count atlas that will be stashed, assigning one if needed.
    pub fn next_atlas_to_stash_key(&mut self) -> Option<AtlasKey> {
        self.rendered_atlas_stack
            .current_mut()
            .map(|atlas| atlas.get_or_assign_key())
    }

    /// Records everything the ops' draws depend on: instance data, copies into the copy
    /// atlases and rasterization of the coverage count atlases.
    ///
    /// `stashed` is the previous flush's atlas. It is read by the copies, then recycled as
    /// the first coverage count atlas if the dimensions match, or freed.
    pub fn finalize(&mut self, state: &mut FlushState<'_>, stashed: Option<StashedAtlas>) {
        state.upload_pending();
        if !self.path_instances.is_empty() {
            let data: Vec<u8> = bytemuck::cast_slice(&self.path_instances).to_vec();
            state.recording().upload_into(self.instance_buffer, data);
        }

        if let Some(source) = self.copy_source.filter(|_| self.num_copies > 0) {
            for (index, quads) in self.copy_batches.iter().enumerate() {
                let Some(atlas) = self.copy_atlas_stack.get(index) else {
                    continue;
                };
                if quads.is_empty() {
                    continue;
                }
                let texture = atlas.texture();
                state
                    .recording()
                    .allocate_texture(texture, atlas.width(), atlas.height());
                if !draw_copies(state, source, texture, quads) {
                    continue;
                }
                if let Some(key) = atlas.key() {
                    state.provider().assign_atlas_key(key, texture);
                }
            }
        }

        let mut stashed = stashed;
        for (index, atlas) in self.rendered_atlas_stack.atlases().iter().enumerate() {
            let texture = atlas.texture();
            match stashed.take() {
                Some(old) if old.width == atlas.width() && old.height == atlas.height() => {
                    state.recording().recycle_texture(old.texture, texture);
                }
                old => {
                    if let Some(old) = old {
                        state.recording().free_texture(old.texture);
                    }
                    state
                        .recording()
                        .allocate_texture(texture, atlas.width(), atlas.height());
                }
            }
            let paths = self.rendered_batches.get_mut(index).map(std::mem::take);
            state.recording().render_coverage(CoverageBatch {
                atlas: texture,
                draw_bounds: atlas.draw_bounds(),
                paths: paths.unwrap_or_default(),
            });
        }
        if let Some(old) = stashed {
            state.recording().free_texture(old.texture);
        }
    }

    /// Hands over the last coverage count atlas, so masks in it can be copied during the
    /// next flush.
    pub fn take_atlas_to_stash(&mut self) -> Option<StashedAtlas> {
        let atlas = self.rendered_atlas_stack.current_mut()?;
        Some(StashedAtlas {
            key: atlas.get_or_assign_key(),
            texture: atlas.texture(),
            width: atlas.width(),
            height: atlas.height(),
        })
    }

    pub fn rendered_atlases(&self) -> &AtlasStack {
        &self.rendered_atlas_stack
    }

    pub fn copy_atlases(&self) -> &AtlasStack {
        &self.copy_atlas_stack
    }
}

/// Records the quads copying masks out of `source` into `target`.
fn draw_copies(
    state: &mut FlushState<'_>,
    source: TextureProxy,
    target: TextureProxy,
    quads: &[CopyQuad],
) -> bool {
    let Some((helper, vertices)) =
        QuadHelper::new(state, size_of::<CopyVertex>(), quads.len() as u32)
    else {
        log::warn!("Couldn't copy {} paths to a cached atlas", quads.len());
        return false;
    };
    let data: Vec<CopyVertex> = quads.iter().flat_map(CopyQuad::vertices).collect();
    vertices.copy_from_slice(bytemuck::cast_slice(&data));
    let pipeline = Pipeline {
        render_target: target,
        blend_mode: BlendMode::new(Mix::Normal, Compose::Copy),
        scissor: None,
        dst_texture: false,
    };
    let dynamic_state = pipeline.fixed_dynamic_state(&[source]);
    helper.record_draw(
        state,
        GeometryProcessor::AtlasCopy { source },
        &pipeline,
        dynamic_state.as_ref(),
    );
    true
}

/// Bounds of the path in the space rotated by 45 degrees, where `(x, y)` maps to
/// `(x + y, y - x)`.
fn device_bounds45(shape: &Shape, transform: Affine) -> Rect {
    let mut bounds: Option<Rect> = None;
    for point in shape.points() {
        let p = transform * point;
        let p45 = Rect::new(p.x + p.y, p.y - p.x, p.x + p.y, p.y - p.x);
        bounds = Some(match bounds {
            Some(bounds) => bounds.union(p45),
            None => p45,
        });
    }
    let outset = shape.stroke_outset(transform) * SQRT_2;
    bounds.unwrap_or_default().inflate(outset, outset)
}
