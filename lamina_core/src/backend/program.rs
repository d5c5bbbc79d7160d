// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The program backend: generated vertex and fragment shaders linked into
//! one program per distinct codegen state.
//!
//! Each stage looks for its object in three places, cheapest first:
//!
//! 1. attached to the pipeline itself,
//! 2. attached to the pipeline's equivalent parent, the oldest ancestor whose
//!    codegen-relevant state resolves to the same values,
//! 3. nowhere, in which case a [`ShaderDesc`] is built from the layers and
//!    compiled at `end`.
//!
//! A freshly built object is attached to both the equivalent parent and the
//! pipeline, so siblings that differ only in bind-time state (color, blend,
//! depth, textures) share one compiled program.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;

use super::{Backend, BackendKind, PipelineStage, StageContext, StageError, StageKind, StageSlot};
use crate::device::{
    Device, DeviceCaps, DeviceObject, LayerKey, ProgramHandle, ShaderDesc, ShaderHandle,
    ShaderStage,
};
use crate::id::{LayerId, PipelineId};
use crate::state::{CompareFunc, LayerState, PipelineState};

/// Pipeline groups that feed vertex code generation on `caps`.
#[must_use]
pub fn vertex_state(caps: &DeviceCaps) -> PipelineState {
    let mut state = PipelineState::LAYERS | PipelineState::VERTEX_SNIPPETS;
    if !caps.builtin_point_size {
        state |= PipelineState::POINT_SIZE;
    }
    state
}

/// Layer groups that feed vertex code generation.
pub const VERTEX_LAYER_STATE: LayerState =
    LayerState::TEXTURE_TYPE.union(LayerState::POINT_SPRITE_COORDS);

/// Pipeline groups that feed fragment code generation.
pub const FRAGMENT_STATE: PipelineState = PipelineState::LAYERS
    .union(PipelineState::FRAGMENT_SNIPPETS)
    .union(PipelineState::ALPHA_FUNC);

/// Layer groups that feed fragment code generation.
pub const FRAGMENT_LAYER_STATE: LayerState = LayerState::TEXTURE_TYPE
    .union(LayerState::COMBINE)
    .union(LayerState::POINT_SPRITE_COORDS);

/// Creates the program backend.
#[must_use]
pub fn backend() -> Backend {
    Backend::new(
        "program",
        BackendKind::Program,
        Box::new(ShaderStageBuilder::vertex()),
        Box::new(ShaderStageBuilder::fragment()),
        Box::new(LinkStage::default()),
    )
}

/// Returns the object the bound pipeline holds in `slot` when `difference`
/// touches none of `state`.
fn shared_with_bound(
    cx: &StageContext<'_>,
    slot: StageSlot,
    state: PipelineState,
    difference: PipelineState,
) -> Option<Rc<DeviceObject>> {
    if difference.intersects(state) {
        return None;
    }
    let bound = cx.bound.filter(|&bound| cx.store.is_alive(bound))?;
    cx.store.private(bound, slot).cloned()
}

// ---------------------------------------------------------------------------
// Shader stages
// ---------------------------------------------------------------------------

/// Vertex or fragment stage of the program backend.
#[derive(Debug)]
pub struct ShaderStageBuilder {
    stage: ShaderStage,
    state: PipelineState,
    layer_state: LayerState,
    /// Descriptor being built; `None` when an existing shader was reused.
    desc: Option<ShaderDesc>,
    authority: Option<PipelineId>,
    /// Nodes this run attached an object to, for `abort`.
    published: Vec<PipelineId>,
}

impl ShaderStageBuilder {
    /// Creates the vertex stage.
    #[must_use]
    pub fn vertex() -> Self {
        Self::new(
            ShaderStage::Vertex,
            vertex_state(&DeviceCaps::programmable(0)),
            VERTEX_LAYER_STATE,
        )
    }

    /// Creates the fragment stage.
    #[must_use]
    pub fn fragment() -> Self {
        Self::new(ShaderStage::Fragment, FRAGMENT_STATE, FRAGMENT_LAYER_STATE)
    }

    fn new(stage: ShaderStage, state: PipelineState, layer_state: LayerState) -> Self {
        Self {
            stage,
            state,
            layer_state,
            desc: None,
            authority: None,
            published: Vec::new(),
        }
    }

    fn kind(&self) -> StageKind {
        match self.stage {
            ShaderStage::Vertex => StageKind::Vertex,
            ShaderStage::Fragment => StageKind::Fragment,
        }
    }

    fn describe(&self, cx: &StageContext<'_>, pipeline: PipelineId) -> ShaderDesc {
        let store = &*cx.store;
        let mut desc = ShaderDesc::new(self.stage);
        match self.stage {
            ShaderStage::Vertex => {
                desc.snippets = store.vertex_snippets(pipeline).to_vec();
                desc.per_vertex_point_size =
                    !cx.caps.builtin_point_size && store.point_size(pipeline) > 0.0;
            }
            ShaderStage::Fragment => {
                desc.snippets = store.fragment_snippets(pipeline).to_vec();
                let alpha = store.alpha_func(pipeline);
                desc.alpha_test = (alpha.func != CompareFunc::Always).then_some(alpha.func);
            }
        }
        desc
    }
}

impl PipelineStage for ShaderStageBuilder {
    fn start(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
        n_layers: usize,
        difference: PipelineState,
    ) -> Result<(), StageError> {
        self.desc = None;
        self.authority = None;
        self.published.clear();
        if self.stage == ShaderStage::Vertex {
            self.state = vertex_state(&cx.caps);
        }
        if n_layers > cx.caps.max_texture_units {
            return Err(StageError::Unsupported);
        }

        let slot = cx.slot(self.kind());
        if cx.store.private(pipeline, slot).is_some() {
            return Ok(());
        }
        if let Some(shared) = shared_with_bound(cx, slot, self.state, difference) {
            cx.store.attach_private(pipeline, slot, shared);
            self.published.push(pipeline);
            return Ok(());
        }
        let authority = cx
            .store
            .find_equivalent_parent(pipeline, self.state, self.layer_state);
        if let Some(shared) = cx.store.private(authority, slot).cloned() {
            cx.store.attach_private(pipeline, slot, shared);
            self.published.push(pipeline);
            return Ok(());
        }
        self.authority = Some(authority);
        self.desc = Some(self.describe(cx, pipeline));
        Ok(())
    }

    fn add_layer(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
        layer: LayerId,
        unit: usize,
        difference: LayerState,
    ) -> Result<(), StageError> {
        _ = (pipeline, difference);
        let Some(desc) = &mut self.desc else {
            return Ok(());
        };
        let layers = cx.store.layers();
        let combine = match self.stage {
            ShaderStage::Vertex => None,
            ShaderStage::Fragment => {
                let combine = layers.combine(layer);
                if !cx.caps.dot3_combine && (combine.rgb.is_dot3() || combine.alpha.is_dot3()) {
                    return Err(StageError::Unsupported);
                }
                Some(combine)
            }
        };
        desc.layers.push(LayerKey {
            unit: u32::try_from(unit).map_err(|_| StageError::Unsupported)?,
            texture_type: layers.texture_type(layer),
            combine,
            point_sprite_coords: layers.point_sprite_coords(layer),
        });
        Ok(())
    }

    fn passthrough(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
    ) -> Result<bool, StageError> {
        _ = (cx, pipeline);
        let Some(desc) = &mut self.desc else {
            return Ok(false);
        };
        if self.stage != ShaderStage::Fragment {
            return Ok(false);
        }
        desc.passthrough = true;
        Ok(true)
    }

    fn end(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
        difference: PipelineState,
    ) -> Result<(), StageError> {
        _ = difference;
        let (Some(desc), Some(authority)) = (self.desc.take(), self.authority.take()) else {
            return Ok(());
        };
        let shader = cx.device.compile_shader(&desc)?;
        let object = Rc::new(DeviceObject::Shader(shader));
        let slot = cx.slot(self.kind());
        cx.store.attach_private(authority, slot, Rc::clone(&object));
        self.published.push(authority);
        if authority != pipeline {
            cx.store.attach_private(pipeline, slot, object);
            self.published.push(pipeline);
        }
        Ok(())
    }

    fn pipeline_change_notify(&self, change: PipelineState) -> bool {
        change.intersects(self.state)
    }

    fn layer_change_notify(&self, change: LayerState) -> bool {
        change.intersects(self.layer_state)
    }

    fn abort(&mut self, cx: &mut StageContext<'_>) {
        self.desc = None;
        self.authority = None;
        let slot = cx.slot(self.kind());
        for id in self.published.drain(..) {
            if cx.store.is_alive(id) {
                cx.store.detach_private(id, slot);
            }
        }
    }

    fn release_private(&mut self, device: &mut dyn Device, object: DeviceObject) {
        if let DeviceObject::Shader(shader) = object {
            device.delete_shader(shader);
        }
    }
}

// ---------------------------------------------------------------------------
// Link stage
// ---------------------------------------------------------------------------

/// Links the two shaders and makes the program current.
#[derive(Debug, Default)]
pub struct LinkStage {
    /// Program bound on the device by the last successful `end`.
    in_use: Option<ProgramHandle>,
    program: Option<ProgramHandle>,
    authority: Option<PipelineId>,
    published: Vec<PipelineId>,
}

fn program_of(object: &DeviceObject) -> Option<ProgramHandle> {
    match *object {
        DeviceObject::Program(program) => Some(program),
        _ => None,
    }
}

fn shader_of(cx: &StageContext<'_>, pipeline: PipelineId, stage: StageKind) -> ShaderHandle {
    match cx.store.private(pipeline, cx.slot(stage)).map(|o| **o) {
        Some(DeviceObject::Shader(shader)) => shader,
        other => panic!("link stage found {other:?} in the {stage:?} slot"),
    }
}

impl PipelineStage for LinkStage {
    fn start(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
        n_layers: usize,
        difference: PipelineState,
    ) -> Result<(), StageError> {
        _ = n_layers;
        self.program = None;
        self.authority = None;
        self.published.clear();

        let slot = cx.slot(StageKind::Link);
        if let Some(existing) = cx.store.private(pipeline, slot) {
            self.program = program_of(existing);
            return Ok(());
        }
        let state = vertex_state(&cx.caps) | FRAGMENT_STATE;
        let layer_state = VERTEX_LAYER_STATE | FRAGMENT_LAYER_STATE;
        if let Some(shared) = shared_with_bound(cx, slot, state, difference) {
            self.program = program_of(&shared);
            cx.store.attach_private(pipeline, slot, shared);
            self.published.push(pipeline);
            return Ok(());
        }
        let authority = cx.store.find_equivalent_parent(pipeline, state, layer_state);
        if let Some(shared) = cx.store.private(authority, slot).cloned() {
            self.program = program_of(&shared);
            cx.store.attach_private(pipeline, slot, shared);
            self.published.push(pipeline);
            return Ok(());
        }
        self.authority = Some(authority);
        Ok(())
    }

    fn end(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
        difference: PipelineState,
    ) -> Result<(), StageError> {
        let program = match (self.program, self.authority.take()) {
            (Some(program), _) => program,
            (None, Some(authority)) => {
                let vertex = shader_of(cx, pipeline, StageKind::Vertex);
                let fragment = shader_of(cx, pipeline, StageKind::Fragment);
                let program = cx.device.link_program(vertex, fragment)?;
                let object = Rc::new(DeviceObject::Program(program));
                let slot = cx.slot(StageKind::Link);
                cx.store.attach_private(authority, slot, Rc::clone(&object));
                self.published.push(authority);
                if authority != pipeline {
                    cx.store.attach_private(pipeline, slot, object);
                    self.published.push(pipeline);
                }
                self.program = Some(program);
                program
            }
            (None, None) => return Err(StageError::Unsupported),
        };
        if self.in_use != Some(program) || difference == PipelineState::all() {
            cx.device.use_program(Some(program));
            self.in_use = Some(program);
        }
        Ok(())
    }

    fn pipeline_change_notify(&self, change: PipelineState) -> bool {
        change.intersects(PipelineState::POINT_SIZE | FRAGMENT_STATE | PipelineState::VERTEX_SNIPPETS)
    }

    fn layer_change_notify(&self, change: LayerState) -> bool {
        change.intersects(VERTEX_LAYER_STATE | FRAGMENT_LAYER_STATE)
    }

    fn abort(&mut self, cx: &mut StageContext<'_>) {
        self.program = None;
        self.authority = None;
        if self.in_use.take().is_some() {
            cx.device.use_program(None);
        }
        let slot = cx.slot(StageKind::Link);
        for id in self.published.drain(..) {
            if cx.store.is_alive(id) {
                cx.store.detach_private(id, slot);
            }
        }
    }

    fn release_private(&mut self, device: &mut dyn Device, object: DeviceObject) {
        if let DeviceObject::Program(program) = object {
            if self.in_use == Some(program) {
                device.use_program(None);
                self.in_use = None;
            }
            device.delete_program(program);
        }
    }
}
