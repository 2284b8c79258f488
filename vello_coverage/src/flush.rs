// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::mesh::{DrawTarget, Mesh, VertexSpace};
use crate::pipeline::{DynamicState, GeometryProcessor, Pipeline};
use crate::provider::ResourceProvider;
use crate::recording::{BufferProxy, DrawCommand, Recording, TextureProxy};
use crate::resources::PerFlushResources;

/// What ops see of a flush while recording their draws.
pub struct FlushState<'a> {
    recording: &'a mut Recording,
    provider: &'a mut dyn ResourceProvider,
    render_target: TextureProxy,
    resources: Option<&'a PerFlushResources>,
}

impl<'a> FlushState<'a> {
    pub fn new(
        recording: &'a mut Recording,
        provider: &'a mut dyn ResourceProvider,
        render_target: TextureProxy,
    ) -> Self {
        Self {
            recording,
            provider,
            render_target,
            resources: None,
        }
    }

    /// Makes the flush's shared resources available to executing ops.
    pub fn with_resources(mut self, resources: &'a PerFlushResources) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn render_target(&self) -> TextureProxy {
        self.render_target
    }

    /// The flush's shared resources, or `None` if none could be allocated.
    pub fn resources(&self) -> Option<&'a PerFlushResources> {
        self.resources
    }

    pub fn recording(&mut self) -> &mut Recording {
        &mut *self.recording
    }

    pub fn provider(&mut self) -> &mut dyn ResourceProvider {
        &mut *self.provider
    }

    /// Records the uploads of shared buffers the provider created since the last call.
    pub fn upload_pending(&mut self) {
        for (buffer, data) in self.provider.take_pending_uploads() {
            self.recording.upload_into(buffer, data);
        }
    }
}

impl DrawTarget for FlushState<'_> {
    fn make_vertex_space(&mut self, stride: usize, vertex_count: u32) -> Option<VertexSpace<'_>> {
        let size = stride.checked_mul(vertex_count as usize)?;
        let buffer = self.provider.make_vertex_buffer(size as u64)?;
        let data = self.recording.stage_upload(buffer, size);
        Some(VertexSpace {
            buffer,
            first_vertex: 0,
            data,
        })
    }

    fn quad_index_buffer(&mut self) -> Option<BufferProxy> {
        let buffer = self.provider.quad_index_buffer();
        self.upload_pending();
        buffer
    }

    fn draw(
        &mut self,
        geometry: GeometryProcessor,
        pipeline: &Pipeline,
        dynamic_state: Option<&DynamicState>,
        mesh: &Mesh,
    ) {
        for draw in mesh.draws() {
            self.recording.draw(DrawCommand {
                geometry: geometry.clone(),
                pipeline: pipeline.clone(),
                dynamic_state: dynamic_state.cloned(),
                draw,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::QuadHelper;
    use crate::provider::{Caps, ResourceCache, ResourceLimits};
    use crate::recording::{Command, TextureFormat};
    use peniko::{BlendMode, Compose, Mix};

    #[test]
    fn test_quads_upload_indices_before_drawing() {
        let mut provider = ResourceCache::new(
            Caps::default(),
            ResourceLimits {
                quads_per_index_buffer: 2,
                ..Default::default()
            },
        );
        let mut recording = Recording::default();
        let target = TextureProxy::new(TextureFormat::Alpha8);
        let mut state = FlushState::new(&mut recording, &mut provider, target);
        let (helper, vertices) = QuadHelper::new(&mut state, 8, 5).unwrap();
        vertices.fill(1);
        let source = TextureProxy::new(TextureFormat::CoverageCount);
        let pipeline = Pipeline {
            render_target: target,
            blend_mode: BlendMode::new(Mix::Normal, Compose::Copy),
            scissor: None,
            dst_texture: false,
        };
        helper.record_draw(
            &mut state,
            GeometryProcessor::AtlasCopy { source },
            &pipeline,
            None,
        );

        let kinds: Vec<&str> = recording
            .commands
            .iter()
            .map(|cmd| match cmd {
                Command::Upload(..) => "upload",
                Command::Draw(..) => "draw",
                _ => "other",
            })
            .collect();
        // Indices, vertices, then three draws of at most two quads each.
        assert_eq!(kinds, ["upload", "upload", "draw", "draw", "draw"]);
        match &recording.commands[1] {
            Command::Upload(_, data) => assert!(data.iter().all(|&b| b == 1)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_vertex_buffer_limit_skips_draw() {
        let mut provider = ResourceCache::new(
            Caps::default(),
            ResourceLimits {
                max_vertex_buffer_size: 16,
                ..Default::default()
            },
        );
        let mut recording = Recording::default();
        let target = TextureProxy::new(TextureFormat::Alpha8);
        let mut state = FlushState::new(&mut recording, &mut provider, target);
        assert!(QuadHelper::new(&mut state, 8, 5).is_none());
        assert_eq!(recording.draws().count(), 0);
    }
}
