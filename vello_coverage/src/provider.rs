// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;

use crate::atlas::AtlasKey;
use crate::mesh::{INDICES_PER_QUAD, QUAD_INDEX_PATTERN, VERTICES_PER_QUAD};
use crate::recording::{BufferProxy, TextureProxy};
use crate::resources::{OCTAGON_INDICES, PATH_INDICES_PER_INSTANCE};

/// Limits of the device being drawn with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caps {
    pub max_render_target_size: u32,
    pub max_texture_size: u32,
    /// Whether the blend hardware implements the non-separable and advanced blend modes.
    pub advanced_blend_support: bool,
}

impl Default for Caps {
    fn default() -> Self {
        Self {
            max_render_target_size: 8192,
            max_texture_size: 8192,
            advanced_blend_support: false,
        }
    }
}

/// Allocation limits of a [`ResourceCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// How many quads the shared quad index buffer holds. Zero disables it.
    pub quads_per_index_buffer: u32,
    pub max_vertex_buffer_size: u64,
    pub max_instance_buffer_size: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            quads_per_index_buffer: 1 << 12,
            max_vertex_buffer_size: 1 << 26,
            max_instance_buffer_size: 1 << 26,
        }
    }
}

/// Supplies buffers and long-lived textures.
pub trait ResourceProvider {
    fn caps(&self) -> &Caps;

    /// Shared index buffer holding the quad pattern repeated as often as it fits.
    fn quad_index_buffer(&mut self) -> Option<BufferProxy>;

    /// Shared index buffer triangulating the octagon that covers a path instance.
    fn path_index_buffer(&mut self) -> Option<BufferProxy>;

    fn make_vertex_buffer(&mut self, size: u64) -> Option<BufferProxy>;

    fn make_instance_buffer(&mut self, size: u64) -> Option<BufferProxy>;

    /// Looks up a texture that was kept alive with [`assign_atlas_key`](Self::assign_atlas_key).
    fn find_atlas_by_key(&self, key: AtlasKey) -> Option<TextureProxy>;

    /// Keeps `atlas` alive across flushes under `key`.
    fn assign_atlas_key(&mut self, key: AtlasKey, atlas: TextureProxy);

    /// Stops keeping the atlas under `key` alive, returning it so it can be freed.
    fn purge_atlas(&mut self, key: AtlasKey) -> Option<TextureProxy>;

    /// Index data of newly created shared buffers, which must be uploaded before use.
    fn take_pending_uploads(&mut self) -> Vec<(BufferProxy, Vec<u8>)> {
        Vec::new()
    }
}

/// A [`ResourceProvider`] that keeps its shared buffers and keyed atlases in memory.
#[derive(Debug, Default)]
pub struct ResourceCache {
    caps: Caps,
    limits: ResourceLimits,
    quad_index_buffer: Option<BufferProxy>,
    path_index_buffer: Option<BufferProxy>,
    keyed_atlases: HashMap<AtlasKey, TextureProxy>,
    pending_uploads: Vec<(BufferProxy, Vec<u8>)>,
}

impl ResourceCache {
    pub fn new(caps: Caps, limits: ResourceLimits) -> Self {
        Self {
            caps,
            limits,
            ..Default::default()
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Number of atlases currently kept alive across flushes.
    pub fn num_keyed_atlases(&self) -> usize {
        self.keyed_atlases.len()
    }
}

/// `pattern` repeated `reps` times, each repetition offset by `vertices_per_rep`.
fn repeated_indices(pattern: &[u16], vertices_per_rep: u32, reps: u32) -> Vec<u8> {
    let mut indices = Vec::with_capacity(pattern.len() * reps as usize);
    for rep in 0..reps {
        let base = (rep * vertices_per_rep) as u16;
        indices.extend(pattern.iter().map(|i| base + i));
    }
    bytemuck::cast_slice(&indices).to_vec()
}

impl ResourceProvider for ResourceCache {
    fn caps(&self) -> &Caps {
        &self.caps
    }

    fn quad_index_buffer(&mut self) -> Option<BufferProxy> {
        if let Some(buf) = self.quad_index_buffer {
            return Some(buf);
        }
        let quads = self.limits.quads_per_index_buffer;
        // Indices are 16 bit.
        if quads == 0 || u64::from(quads) * u64::from(VERTICES_PER_QUAD) > 1 << 16 {
            return None;
        }
        let data = repeated_indices(&QUAD_INDEX_PATTERN, VERTICES_PER_QUAD, quads);
        debug_assert_eq!(data.len(), (quads * INDICES_PER_QUAD) as usize * 2);
        let buf = BufferProxy::new(data.len() as u64, "quad indices");
        self.pending_uploads.push((buf, data));
        self.quad_index_buffer = Some(buf);
        Some(buf)
    }

    fn path_index_buffer(&mut self) -> Option<BufferProxy> {
        if let Some(buf) = self.path_index_buffer {
            return Some(buf);
        }
        let data: Vec<u8> = bytemuck::cast_slice(&OCTAGON_INDICES).to_vec();
        debug_assert_eq!(data.len(), PATH_INDICES_PER_INSTANCE as usize * 2);
        let buf = BufferProxy::new(data.len() as u64, "path indices");
        self.pending_uploads.push((buf, data));
        self.path_index_buffer = Some(buf);
        Some(buf)
    }

    fn make_vertex_buffer(&mut self, size: u64) -> Option<BufferProxy> {
        (size > 0 && size <= self.limits.max_vertex_buffer_size)
            .then(|| BufferProxy::new(size, "vertices"))
    }

    fn make_instance_buffer(&mut self, size: u64) -> Option<BufferProxy> {
        (size > 0 && size <= self.limits.max_instance_buffer_size)
            .then(|| BufferProxy::new(size, "path instances"))
    }

    fn find_atlas_by_key(&self, key: AtlasKey) -> Option<TextureProxy> {
        self.keyed_atlases.get(&key).copied()
    }

    fn assign_atlas_key(&mut self, key: AtlasKey, atlas: TextureProxy) {
        self.keyed_atlases.insert(key, atlas);
    }

    fn purge_atlas(&mut self, key: AtlasKey) -> Option<TextureProxy> {
        self.keyed_atlases.remove(&key)
    }

    fn take_pending_uploads(&mut self) -> Vec<(BufferProxy, Vec<u8>)> {
        std::mem::take(&mut self.pending_uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::TextureFormat;

    #[test]
    fn quad_indices_repeat_the_pattern() {
        let mut cache = ResourceCache::new(
            Caps::default(),
            ResourceLimits {
                quads_per_index_buffer: 3,
                ..Default::default()
            },
        );
        let buf = cache.quad_index_buffer().unwrap();
        assert_eq!(buf.size, 3 * 6 * 2);
        // Created once.
        assert_eq!(cache.quad_index_buffer(), Some(buf));
        let uploads = cache.take_pending_uploads();
        assert_eq!(uploads.len(), 1);
        let indices: Vec<u16> = uploads[0]
            .1
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(&indices[6..12], &[4, 5, 6, 6, 5, 7]);
        assert!(cache.take_pending_uploads().is_empty());
    }

    #[test]
    fn disabled_quad_index_buffer() {
        let mut cache = ResourceCache::new(
            Caps::default(),
            ResourceLimits {
                quads_per_index_buffer: 0,
                ..Default::default()
            },
        );
        assert_eq!(cache.quad_index_buffer(), None);
    }

    #[test]
    fn keyed_atlases_outlive_lookups() {
        let mut cache = ResourceCache::default();
        let key = AtlasKey::next();
        let atlas = TextureProxy::new(TextureFormat::Alpha8);
        assert_eq!(cache.find_atlas_by_key(key), None);
        cache.assign_atlas_key(key, atlas);
        assert_eq!(cache.find_atlas_by_key(key), Some(atlas));
        assert_eq!(cache.purge_atlas(key), Some(atlas));
        assert_eq!(cache.find_atlas_by_key(key), None);
    }

    #[test]
    fn buffer_limits() {
        let mut cache = ResourceCache::new(
            Caps::default(),
            ResourceLimits {
                max_vertex_buffer_size: 64,
                ..Default::default()
            },
        );
        assert!(cache.make_vertex_buffer(64).is_some());
        assert!(cache.make_vertex_buffer(65).is_none());
        assert!(cache.make_instance_buffer(0).is_none());
    }
}
