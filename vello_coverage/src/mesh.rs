// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Batched submission of repeated geometry.
//!
//! Many draws consist of the same small primitive repeated many times, such as a quad per
//! glyph or per atlas copy. Rather than uploading indices for every repetition, a single
//! shared index buffer holds the pattern repeated as often as it fits, and every draw
//! points into it. When more repetitions are needed than the buffer holds, the mesh is
//! split into several draws that each restart at the beginning of the index buffer.

use crate::pipeline::{DynamicState, GeometryProcessor, Pipeline};
use crate::recording::BufferProxy;

pub const VERTICES_PER_QUAD: u32 = 4;
pub const INDICES_PER_QUAD: u32 = 6;

/// Index pattern of a quad whose vertices are ordered top-left, top-right, bottom-left,
/// bottom-right.
pub const QUAD_INDEX_PATTERN: [u16; INDICES_PER_QUAD as usize] = [0, 1, 2, 2, 1, 3];

/// Vertex storage handed out by a [`DrawTarget`].
#[derive(Debug)]
pub struct VertexSpace<'a> {
    pub buffer: BufferProxy,
    /// Index of the first vertex of `data` within `buffer`.
    pub first_vertex: u32,
    pub data: &'a mut [u8],
}

/// Where meshes get their storage and where their draws go.
pub trait DrawTarget {
    /// Allocates room for `vertex_count` vertices of `stride` bytes each.
    fn make_vertex_space(&mut self, stride: usize, vertex_count: u32) -> Option<VertexSpace<'_>>;

    /// The shared index buffer holding [`QUAD_INDEX_PATTERN`] repeatedly.
    fn quad_index_buffer(&mut self) -> Option<BufferProxy>;

    fn draw(
        &mut self,
        geometry: GeometryProcessor,
        pipeline: &Pipeline,
        dynamic_state: Option<&DynamicState>,
        mesh: &Mesh,
    );
}

/// Geometry of a draw, before it's split into GPU calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mesh {
    /// A pattern of `indices_per_repetition` indices over `vertices_per_repetition`
    /// vertices, repeated `repeat_count` times.
    IndexedPatterned {
        index_buffer: BufferProxy,
        vertex_buffer: BufferProxy,
        base_vertex: u32,
        vertices_per_repetition: u32,
        indices_per_repetition: u32,
        repeat_count: u32,
        /// How many repetitions `index_buffer` holds.
        max_repetitions: u32,
    },
    /// One shared primitive drawn once per instance.
    IndexedInstanced {
        index_buffer: BufferProxy,
        index_count: u32,
        instance_buffer: BufferProxy,
        base_instance: u32,
        instance_count: u32,
    },
}

/// A single GPU draw call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshDraw {
    Patterned {
        index_buffer: BufferProxy,
        vertex_buffer: BufferProxy,
        base_vertex: u32,
        vertices_per_repetition: u32,
        indices_per_repetition: u32,
        repetitions: u32,
    },
    Instanced {
        index_buffer: BufferProxy,
        index_count: u32,
        instance_buffer: BufferProxy,
        base_instance: u32,
        instance_count: u32,
    },
}

impl MeshDraw {
    pub fn index_count(&self) -> u32 {
        match *self {
            Self::Patterned {
                indices_per_repetition,
                repetitions,
                ..
            } => indices_per_repetition * repetitions,
            Self::Instanced { index_count, .. } => index_count,
        }
    }
}

impl Mesh {
    /// The GPU draws that make up this mesh, in order.
    pub fn draws(&self) -> MeshDraws {
        MeshDraws {
            mesh: *self,
            emitted: 0,
        }
    }
}

/// Iterator returned by [`Mesh::draws`].
#[derive(Clone, Debug)]
pub struct MeshDraws {
    mesh: Mesh,
    /// Repetitions or instances covered so far.
    emitted: u32,
}

impl Iterator for MeshDraws {
    type Item = MeshDraw;

    fn next(&mut self) -> Option<MeshDraw> {
        match self.mesh {
            Mesh::IndexedPatterned {
                index_buffer,
                vertex_buffer,
                base_vertex,
                vertices_per_repetition,
                indices_per_repetition,
                repeat_count,
                max_repetitions,
            } => {
                if self.emitted >= repeat_count || max_repetitions == 0 {
                    return None;
                }
                let repetitions = max_repetitions.min(repeat_count - self.emitted);
                let draw = MeshDraw::Patterned {
                    index_buffer,
                    vertex_buffer,
                    base_vertex: base_vertex + self.emitted * vertices_per_repetition,
                    vertices_per_repetition,
                    indices_per_repetition,
                    repetitions,
                };
                self.emitted += repetitions;
                Some(draw)
            }
            Mesh::IndexedInstanced {
                index_buffer,
                index_count,
                instance_buffer,
                base_instance,
                instance_count,
            } => {
                if self.emitted >= instance_count {
                    return None;
                }
                self.emitted = instance_count;
                Some(MeshDraw::Instanced {
                    index_buffer,
                    index_count,
                    instance_buffer,
                    base_instance,
                    instance_count,
                })
            }
        }
    }
}

/// Allocates vertices for a repeated index pattern and records the resulting mesh.
#[derive(Debug)]
pub struct PatternHelper {
    mesh: Mesh,
}

impl PatternHelper {
    /// Returns the helper along with the vertex bytes to fill in, or `None` if the draw
    /// must be skipped.
    pub fn new<'a, T: DrawTarget + ?Sized>(
        target: &'a mut T,
        stride: usize,
        index_buffer: Option<BufferProxy>,
        vertices_per_repetition: u32,
        indices_per_repetition: u32,
        repeat_count: u32,
    ) -> Option<(Self, &'a mut [u8])> {
        let index_buffer = index_buffer?;
        if indices_per_repetition == 0 || vertices_per_repetition == 0 || repeat_count == 0 {
            return None;
        }
        let pattern_size = size_of::<u16>() as u64 * u64::from(indices_per_repetition);
        let max_repetitions = u32::try_from(index_buffer.size / pattern_size).unwrap_or(u32::MAX);
        if max_repetitions == 0 {
            log::warn!(
                "Index buffer '{}' can't hold a single repetition of {indices_per_repetition} indices.",
                index_buffer.name
            );
            return None;
        }
        let Some(vertex_count) = vertices_per_repetition.checked_mul(repeat_count) else {
            log::warn!("Too many vertices requested for instanced rendering.");
            return None;
        };
        let Some(space) = target.make_vertex_space(stride, vertex_count) else {
            log::warn!("Vertices could not be allocated for instanced rendering.");
            return None;
        };
        let mesh = Mesh::IndexedPatterned {
            index_buffer,
            vertex_buffer: space.buffer,
            base_vertex: space.first_vertex,
            vertices_per_repetition,
            indices_per_repetition,
            repeat_count,
            max_repetitions,
        };
        Some((Self { mesh }, space.data))
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn record_draw<T: DrawTarget + ?Sized>(
        &self,
        target: &mut T,
        geometry: GeometryProcessor,
        pipeline: &Pipeline,
        dynamic_state: Option<&DynamicState>,
    ) {
        target.draw(geometry, pipeline, dynamic_state, &self.mesh);
    }
}

/// A [`PatternHelper`] for quads drawn with the target's shared quad index buffer.
#[derive(Debug)]
pub struct QuadHelper {
    pattern: PatternHelper,
}

impl QuadHelper {
    pub fn new<T: DrawTarget + ?Sized>(
        target: &mut T,
        stride: usize,
        quads_to_draw: u32,
    ) -> Option<(Self, &mut [u8])> {
        let Some(index_buffer) = target.quad_index_buffer() else {
            log::warn!("Could not get quad index buffer.");
            return None;
        };
        let (pattern, vertices) = PatternHelper::new(
            target,
            stride,
            Some(index_buffer),
            VERTICES_PER_QUAD,
            INDICES_PER_QUAD,
            quads_to_draw,
        )?;
        Some((Self { pattern }, vertices))
    }

    pub fn mesh(&self) -> &Mesh {
        self.pattern.mesh()
    }

    pub fn record_draw<T: DrawTarget + ?Sized>(
        &self,
        target: &mut T,
        geometry: GeometryProcessor,
        pipeline: &Pipeline,
        dynamic_state: Option<&DynamicState>,
    ) {
        self.pattern
            .record_draw(target, geometry, pipeline, dynamic_state);
    }
}
