// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Vello Coverage plans GPU draws of vector paths whose coverage masks live in shared atlas
//! textures.
//!
//! Each path is rasterized once, as a coverage count, into an atlas. The draw itself then
//! covers the path's device bounds with an octagon and samples its mask. Masks that keep
//! showing up from flush to flush move into persistent literal-coverage atlases through a
//! [`PathCache`], so later flushes can draw them without rasterizing again.
//!
//! The work of one flush happens in a fixed order:
//!
//! 1. Every [`DrawPathsOp`] reports what its paths need (cache hits, copies forward from the
//!    previous flush's atlas, or fresh renders) into a [`PerFlushResourceSpecs`].
//! 2. Atlases and the instance buffer are allocated once for the whole flush as
//!    [`PerFlushResources`].
//! 3. Every op binds its requests to concrete atlas regions and groups them into
//!    [`InstanceRange`]s, one per contiguous run sharing an atlas.
//! 4. Every op emits one instanced draw per range into a [`Recording`].
//!
//! [`CoverageCountingPathRenderer`] drives these steps and owns the state that outlives a
//! flush: the path cache and the "stashed" atlas of the previous flush.
//!
//! ```
//! use vello_coverage::kurbo::{Affine, BezPath, Rect, Shape as _};
//! use vello_coverage::peniko::{Color, Fill};
//! use vello_coverage::{
//!     CoverageConfig, CoverageCountingPathRenderer, IntRect, OpList, Paint, Recording,
//!     ResourceCache, ResourceProvider, Shape, TextureFormat, TextureProxy,
//! };
//!
//! let mut resources = ResourceCache::default();
//! let mut renderer = CoverageCountingPathRenderer::new(CoverageConfig::default());
//!
//! let path: BezPath = Rect::new(10.0, 10.0, 90.0, 60.0).to_path(0.1);
//! let shape = Shape::fill(path, Fill::NonZero);
//! let clip = IntRect::new(0, 0, 256, 256);
//! let op = renderer
//!     .make_draw_op(clip, Affine::IDENTITY, shape, Paint::solid(Color::rgba8(0, 0, 255, 255)))
//!     .expect("path is visible");
//!
//! let mut ops = OpList::new();
//! ops.record(op, resources.caps());
//! ops.close(resources.caps());
//!
//! let target = TextureProxy::new(TextureFormat::Rgba8);
//! let mut recording = Recording::default();
//! renderer.flush(ops.ops_mut(), &mut resources, &mut recording, target);
//! assert_eq!(recording.draws().count(), 1);
//! ```

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
// The following lints are part of the Linebender standard set,
// but resolving them has been deferred for now.
// Feel free to send a PR that solves one or more of these.
#![allow(
    clippy::cast_possible_truncation,
    clippy::missing_assert_message,
    reason = "Deferred"
)]

mod atlas;
mod config;
mod draw_op;
mod flush;
mod math;
mod mesh;
mod op_list;
mod paint;
mod path_cache;
mod pipeline;
mod provider;
mod recording;
mod renderer;
mod resources;
mod shape;
mod specs;

pub use peniko;
pub use peniko::kurbo;

pub use atlas::{Atlas, AtlasError, AtlasKey, AtlasPlacement, AtlasSpecs, AtlasStack};
pub use config::{CopyPolicy, CoverageConfig, PathCacheConfig, VisibilityPolicy};
pub use draw_op::{DoCopiesToCache, DrawPathsOp, DrawPlan, DrawRequest, InstanceRange, Visibility};
pub use flush::FlushState;
pub use math::{IntRect, IntVector};
pub use mesh::{DrawTarget, Mesh, MeshDraw, PatternHelper, QuadHelper, VertexSpace};
pub use op_list::{DrawOp, OpList, RequiresDstTexture};
pub use paint::{Paint, ProcessorSet};
pub use path_cache::{
    CacheEntryHandle, MaskKind, MaskLocation, MaskTransform, PathCache, PathCacheEntry,
};
pub use pipeline::{DynamicState, GeometryProcessor, Pipeline};
pub use provider::{Caps, ResourceCache, ResourceLimits, ResourceProvider};
pub use recording::{
    AtlasPathDraw, BufferProxy, Command, CoverageBatch, DrawCommand, Recording, ResourceId,
    TextureFormat, TextureProxy,
};
pub use renderer::{CoverageCountingPathRenderer, StashedAtlas};
pub use resources::{
    CopyVertex, PathInstance, PerFlushResources, RenderedPath, PATH_INDICES_PER_INSTANCE,
};
pub use shape::{PathKind, PathStats, Shape, ShapeKey};
pub use specs::PerFlushResourceSpecs;

use thiserror::Error;

/// Errors that can occur while setting up the resources of a flush.
///
/// None of these are fatal: the renderer logs them and skips the affected paths.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The provider could not supply the shared index buffer used to draw path instances.
    #[error("Couldn't get the path index buffer")]
    IndexBufferUnavailable,
    /// The provider refused to allocate the per-flush instance buffer.
    #[error("Couldn't allocate an instance buffer of {size} bytes")]
    InstanceBufferAllocation { size: u64 },
    /// Copies were planned but the atlas they copy from is gone.
    #[error("Copies were planned without a stashed atlas to copy from")]
    CopySourceMissing,
    /// A mask could not be placed in an atlas.
    #[error(transparent)]
    Atlas(#[from] AtlasError),
}

/// Specialization of `Result` for our catch-all error type.
pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
