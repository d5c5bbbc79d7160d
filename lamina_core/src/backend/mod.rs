// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Backend stage contract and the per-device backend table.
//!
//! A *backend* turns resolved pipeline state into device objects. It is split
//! into three [`PipelineStage`]s that the [`Context`](crate::context::Context)
//! drives in a fixed order for every validation:
//!
//! ```text
//!   vertex:   start ─► add_layer × n ─► end
//!   fragment: start ─► add_layer × n ─► (passthrough if n == 0) ─► end
//!   link:     start ─► add_layer × n ─► end
//! ```
//!
//! Every stage sees the same pipeline-level difference bitmask and one layer
//! bitmask per texture unit. A stage whose relevant bits are all unset reuses
//! the object of the bound pipeline ([`StageContext::bound`]) and returns;
//! that short-circuit is where repeated draws save their work.
//!
//! A hook returning [`StageError::Unsupported`] rejects the pipeline's shape:
//! the context aborts the stages that started and tries the next backend in the
//! [`BackendTable`]. [`StageError::Device`] means the device ran out of
//! resources and fails the draw outright.
//!
//! # Stage masks
//!
//! Which groups a stage depends on is a per-backend table, not something the
//! core infers:
//!
//! | Backend / stage    | Pipeline groups                                    | Layer groups                                      |
//! |--------------------|----------------------------------------------------|---------------------------------------------------|
//! | program / vertex   | `LAYERS`, `VERTEX_SNIPPETS`, `POINT_SIZE`¹         | `TEXTURE_TYPE`, `POINT_SPRITE_COORDS`             |
//! | program / fragment | `LAYERS`, `FRAGMENT_SNIPPETS`, `ALPHA_FUNC`        | `TEXTURE_TYPE`, `COMBINE`, `POINT_SPRITE_COORDS`  |
//! | program / link     | union of vertex and fragment                       | union of vertex and fragment                      |
//! | nop                | none                                               | none                                              |
//!
//! ¹ Only on devices without fixed-function point size.
//!
//! Texture bindings, samplers, matrices and combine constants are bind-time
//! state; they never force a recompile.

pub mod nop;
pub mod program;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::device::{Device, DeviceCaps, DeviceError, DeviceObject};
use crate::id::{LayerId, PipelineId};
use crate::pipeline::PipelineStore;
use crate::state::{LayerState, PipelineState};

/// One of the three stages of a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Vertex processing.
    Vertex,
    /// Fragment processing.
    Fragment,
    /// Program linking and binding.
    Link,
}

impl StageKind {
    /// All stages, in dispatch order.
    pub const ALL: [Self; 3] = [Self::Vertex, Self::Fragment, Self::Link];
}

/// Key under which a stage attaches private objects to a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StageSlot {
    /// Index of the backend in its [`BackendTable`].
    pub backend: usize,
    /// Stage within that backend.
    pub stage: StageKind,
}

impl StageSlot {
    /// Creates a slot key.
    #[must_use]
    pub const fn new(backend: usize, stage: StageKind) -> Self {
        Self { backend, stage }
    }
}

/// Failure signalled by a stage hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// The backend cannot represent this pipeline; try the next one.
    #[error("backend cannot represent this pipeline")]
    Unsupported,
    /// The device ran out of resources while building objects.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// What a stage may touch while it runs.
pub struct StageContext<'a> {
    /// Pipelines and layers, for resolving state and attaching objects.
    pub store: &'a mut PipelineStore,
    /// The device collaborator.
    pub device: &'a mut dyn Device,
    /// Capabilities of `device`.
    pub caps: DeviceCaps,
    /// Index of the backend being run.
    pub backend: usize,
    /// The pipeline `difference` was computed against, if one is bound.
    pub bound: Option<PipelineId>,
}

impl StageContext<'_> {
    /// Returns the private-data slot of `stage` in the running backend.
    #[must_use]
    pub fn slot(&self, stage: StageKind) -> StageSlot {
        StageSlot::new(self.backend, stage)
    }
}

impl fmt::Debug for StageContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("caps", &self.caps)
            .field("backend", &self.backend)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

/// One stage of a backend.
///
/// `start` and `end` are mandatory; the other hooks default to accepting
/// and doing nothing.
pub trait PipelineStage {
    /// Called once per validation before any layer.
    fn start(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
        n_layers: usize,
        difference: PipelineState,
    ) -> Result<(), StageError>;

    /// Called once per layer, in texture-unit order.
    fn add_layer(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
        layer: LayerId,
        unit: usize,
        difference: LayerState,
    ) -> Result<(), StageError> {
        _ = (cx, pipeline, layer, unit, difference);
        Ok(())
    }

    /// Fragment stage only: called instead of any layer when the pipeline
    /// has none. Returns whether the stage took the passthrough path.
    fn passthrough(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
    ) -> Result<bool, StageError> {
        _ = (cx, pipeline);
        Ok(false)
    }

    /// Called once after all layers; finalizes the stage's object.
    fn end(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
        difference: PipelineState,
    ) -> Result<(), StageError>;

    /// Returns whether an object this stage attached to a pipeline is stale
    /// after `change` was applied to that pipeline in place.
    fn pipeline_change_notify(&self, change: PipelineState) -> bool {
        _ = change;
        false
    }

    /// Returns whether an object this stage attached to a layer is stale
    /// after `change` was applied to that layer in place.
    fn layer_change_notify(&self, change: LayerState) -> bool {
        _ = change;
        false
    }

    /// Discards everything produced since the last `start`.
    fn abort(&mut self, cx: &mut StageContext<'_>) {
        _ = cx;
    }

    /// Destroys an object this stage attached, once no node refers to it.
    fn release_private(&mut self, device: &mut dyn Device, object: DeviceObject) {
        _ = (device, object);
    }
}

/// Which family a backend belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Compiles and links programs through the device.
    Program,
    /// Accepts everything and does nothing.
    Nop,
    /// Supplied by the embedder.
    Custom,
}

/// A named set of vertex, fragment, and link stages.
pub struct Backend {
    name: &'static str,
    kind: BackendKind,
    vertex: Box<dyn PipelineStage>,
    fragment: Box<dyn PipelineStage>,
    link: Box<dyn PipelineStage>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Bundles three stages into a backend.
    #[must_use]
    pub fn new(
        name: &'static str,
        kind: BackendKind,
        vertex: Box<dyn PipelineStage>,
        fragment: Box<dyn PipelineStage>,
        link: Box<dyn PipelineStage>,
    ) -> Self {
        Self {
            name,
            kind,
            vertex,
            fragment,
            link,
        }
    }

    /// Returns the backend's name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the backend's family.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Returns one stage.
    #[must_use]
    pub fn stage(&self, kind: StageKind) -> &dyn PipelineStage {
        match kind {
            StageKind::Vertex => &*self.vertex,
            StageKind::Fragment => &*self.fragment,
            StageKind::Link => &*self.link,
        }
    }

    /// Returns one stage mutably.
    pub fn stage_mut(&mut self, kind: StageKind) -> &mut dyn PipelineStage {
        match kind {
            StageKind::Vertex => &mut *self.vertex,
            StageKind::Fragment => &mut *self.fragment,
            StageKind::Link => &mut *self.link,
        }
    }
}

/// Ordered list of backends to try for each validation.
///
/// Chosen once per device. The no-op backend is always last, so a table
/// never runs out of candidates.
#[derive(Debug)]
pub struct BackendTable {
    backends: Vec<Backend>,
}

impl BackendTable {
    /// Builds the standard table for a device: the program backend when the
    /// device can link programs, then the no-op backend.
    #[must_use]
    pub fn for_caps(caps: &DeviceCaps) -> Self {
        let mut backends = Vec::new();
        if caps.linkable_programs {
            backends.push(program::backend());
        }
        Self::new(backends)
    }

    /// Builds a table from `backends`, appending the no-op backend unless it
    /// is already last.
    #[must_use]
    pub fn new(mut backends: Vec<Backend>) -> Self {
        if backends.last().map(Backend::kind) != Some(BackendKind::Nop) {
            backends.push(nop::backend());
        }
        Self { backends }
    }

    /// Returns the number of backends, including the no-op fallback.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always `false`: the no-op fallback is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Returns the backend at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Backend> {
        self.backends.get(index)
    }

    /// Returns the backend at `index` mutably.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Backend> {
        self.backends.get_mut(index)
    }

    /// Iterates backends in fallback order.
    pub fn iter(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    #[test]
    fn headless_table_is_nop_only() {
        let table = BackendTable::for_caps(&DeviceCaps::headless());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0).map(Backend::kind), Some(BackendKind::Nop));
    }

    #[test]
    fn programmable_table_falls_back_to_nop() {
        let table = BackendTable::for_caps(&DeviceCaps::programmable(4));
        let kinds: Vec<_> = table.iter().map(Backend::kind).collect();
        assert_eq!(kinds, [BackendKind::Program, BackendKind::Nop]);
        assert!(!table.is_empty());
    }

    #[test]
    fn custom_table_gets_nop_appended_once() {
        let table = BackendTable::new(vec![nop::backend()]);
        assert_eq!(table.len(), 1);
        let table = BackendTable::new(vec![program::backend()]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).map(Backend::name), Some("nop"));
    }

    #[test]
    fn stage_lookup_matches_kind() {
        let mut backend = nop::backend();
        for kind in StageKind::ALL {
            assert!(!backend.stage(kind).pipeline_change_notify(PipelineState::all()));
            assert!(!backend.stage_mut(kind).layer_change_notify(LayerState::all()));
        }
    }
}
