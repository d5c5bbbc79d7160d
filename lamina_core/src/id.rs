// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pipeline, layer, and texture identity types.

use core::fmt;

/// Sentinel value indicating "no node" in index fields.
pub const INVALID: u32 = u32::MAX;

/// A handle to a pipeline node in a [`PipelineStore`](crate::pipeline::PipelineStore).
///
/// Contains both a slot index and a generation counter so that stale handles
/// can be detected after the node is released and its slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId {
    pub(crate) idx: u32,
    pub(crate) generation: u32,
}

impl PipelineId {
    /// Returns the raw slot index (for diagnostics only).
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.idx
    }

    /// Returns the generation counter.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipelineId({}@gen{})", self.idx, self.generation)
    }
}

/// A handle to a layer node in a [`LayerStore`](crate::layer::LayerStore).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId {
    pub(crate) idx: u32,
    pub(crate) generation: u32,
}

impl LayerId {
    /// Returns the raw slot index (for diagnostics only).
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.idx
    }

    /// Returns the generation counter.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LayerId({}@gen{})", self.idx, self.generation)
    }
}

/// An opaque reference to a texture object.
///
/// Textures are created and owned outside the state tree. Layers only compare
/// handles for equality; the contents are never inspected.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u32);

impl fmt::Debug for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TextureHandle({})", self.0)
    }
}
