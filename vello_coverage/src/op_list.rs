// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use peniko::kurbo::Rect;

use crate::flush::FlushState;
use crate::provider::Caps;

/// Whether an op blends by reading a copy of the destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequiresDstTexture {
    No,
    Yes,
}

/// An operation recorded into an [`OpList`].
pub trait DrawOp {
    fn name(&self) -> &'static str;

    /// Device space area the op may touch.
    fn bounds(&self) -> Rect;

    /// Called once the op can no longer be merged into.
    fn finalize(&mut self, caps: &Caps) -> RequiresDstTexture;

    /// Moves the contents of `other` into `self` if both can be drawn as one.
    ///
    /// Returns `false`, leaving both untouched, if they can't.
    fn combine_if_possible(&mut self, other: &mut Self, caps: &Caps) -> bool;

    fn on_prepare(&mut self, _state: &mut FlushState<'_>) {}

    fn on_execute(&mut self, state: &mut FlushState<'_>);
}

/// How many recorded ops are searched for one to merge a new op into.
const MAX_LOOKBACK: usize = 10;

/// Ops of one render target, in drawing order.
#[derive(Debug)]
pub struct OpList<O> {
    ops: Vec<O>,
    closed: bool,
    max_lookback: usize,
}

impl<O> Default for OpList<O> {
    fn default() -> Self {
        Self {
            ops: Vec::new(),
            closed: false,
            max_lookback: MAX_LOOKBACK,
        }
    }
}

impl<O: DrawOp> OpList<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `op`, or merges it into an earlier op if nothing drawn in between overlaps
    /// it.
    pub fn record(&mut self, mut op: O, caps: &Caps) {
        debug_assert!(!self.closed, "Recording into a closed op list");
        let bounds = op.bounds();
        for candidate in self.ops.iter_mut().rev().take(self.max_lookback) {
            if candidate.combine_if_possible(&mut op, caps) {
                log::trace!("Merged {} into an earlier op", op.name());
                return;
            }
            // Merging past an overlapping op would reorder the two.
            if !candidate.bounds().intersect(bounds).is_zero_area() {
                break;
            }
        }
        self.ops.push(op);
    }

    /// Finalizes every op. No more ops can be recorded afterwards.
    ///
    /// Returns whether any op needs a copy of the destination to blend with.
    pub fn close(&mut self, caps: &Caps) -> RequiresDstTexture {
        let mut requires_dst = RequiresDstTexture::No;
        if self.closed {
            return requires_dst;
        }
        for op in &mut self.ops {
            if op.finalize(caps) == RequiresDstTexture::Yes {
                requires_dst = RequiresDstTexture::Yes;
            }
        }
        self.closed = true;
        requires_dst
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn ops(&self) -> &[O] {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut [O] {
        &mut self.ops
    }

    pub fn into_ops(self) -> Vec<O> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
