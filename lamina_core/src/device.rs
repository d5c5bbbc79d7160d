// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Device collaborator contract.
//!
//! The state tree never talks to a graphics API directly. Backend stages and
//! the [`Context`](crate::context::Context) go through the [`Device`] trait,
//! which exposes capability flags, shader/program allocation, and the final
//! commit of fixed-function and per-unit state.
//!
//! [`ShaderDesc`] is the structured code-generation key a stage hands to the
//! device. It carries everything that influences generated code and nothing
//! that does not, so two pipelines with equal descriptors can share a
//! compiled object.

use alloc::vec::Vec;

use crate::layer::ResolvedLayer;
use crate::pipeline::FlushState;
use crate::state::{CombineState, CompareFunc, LayerState, PipelineState, SnippetId, TextureType};

/// Capability flags read once per device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Whether the device can compile and link programs.
    pub linkable_programs: bool,
    /// Maximum number of texture units usable by one program.
    pub max_texture_units: usize,
    /// Whether point size is fixed-function state rather than a shader output.
    pub builtin_point_size: bool,
    /// Whether dot-product combine functions are available.
    pub dot3_combine: bool,
}

impl DeviceCaps {
    /// Capabilities of a device with no programmable pipeline.
    #[must_use]
    pub const fn headless() -> Self {
        Self {
            linkable_programs: false,
            max_texture_units: 0,
            builtin_point_size: true,
            dot3_combine: false,
        }
    }

    /// Capabilities of a typical programmable device.
    #[must_use]
    pub const fn programmable(max_texture_units: usize) -> Self {
        Self {
            linkable_programs: true,
            max_texture_units,
            builtin_point_size: false,
            dot3_combine: true,
        }
    }
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self::programmable(8)
    }
}

/// Device-side handle of a compiled shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderHandle(pub u32);

/// Device-side handle of a linked program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u32);

/// A device object owned by a backend stage and attached to a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceObject {
    /// A compiled shader.
    Shader(ShaderHandle),
    /// A linked program.
    Program(ProgramHandle),
    /// Backend-defined payload for stages that are not built in.
    Custom(u32),
}

/// Failure reported by the device when allocating or building objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The device could not allocate the object.
    #[error("device is out of memory")]
    OutOfMemory,
    /// Shader compilation failed.
    #[error("shader compilation failed")]
    CompileFailed,
    /// Program linking failed.
    #[error("program link failed")]
    LinkFailed,
}

/// Which programmable stage a shader targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader.
    Vertex,
    /// Fragment shader.
    Fragment,
}

/// Per-layer part of a [`ShaderDesc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayerKey {
    /// Texture unit the layer is bound to.
    pub unit: u32,
    /// Texture target sampled by the layer.
    pub texture_type: TextureType,
    /// Combine functions (fragment stage only).
    pub combine: Option<CombineState>,
    /// Whether point sprites generate the coordinates.
    pub point_sprite_coords: bool,
}

/// Structured code-generation key for one shader.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderDesc {
    /// Target stage.
    pub stage: ShaderStage,
    /// Layers in texture-unit order.
    pub layers: Vec<LayerKey>,
    /// Hook snippets attached to this stage.
    pub snippets: Vec<SnippetId>,
    /// Alpha test compiled into the fragment shader, if any.
    pub alpha_test: Option<CompareFunc>,
    /// Whether the vertex shader writes point size.
    pub per_vertex_point_size: bool,
    /// Whether the fragment shader passes the interpolated color through.
    pub passthrough: bool,
}

impl ShaderDesc {
    /// Creates an empty descriptor for `stage`.
    #[must_use]
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage,
            layers: Vec::new(),
            snippets: Vec::new(),
            alpha_test: None,
            per_vertex_point_size: false,
            passthrough: false,
        }
    }
}

/// The device/context collaborator.
///
/// Implementations own the real driver handles. Allocation methods return
/// [`DeviceError`] on exhaustion; the commit methods are infallible because
/// they only run after every stage has accepted the pipeline.
pub trait Device {
    /// Returns the device's capability flags.
    fn caps(&self) -> DeviceCaps;

    /// Compiles a shader from a code-generation key.
    fn compile_shader(&mut self, desc: &ShaderDesc) -> Result<ShaderHandle, DeviceError>;

    /// Links a vertex and fragment shader into a program.
    fn link_program(
        &mut self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    ) -> Result<ProgramHandle, DeviceError>;

    /// Makes `program` the active program, or unbinds with `None`.
    fn use_program(&mut self, program: Option<ProgramHandle>);

    /// Destroys a compiled shader.
    fn delete_shader(&mut self, shader: ShaderHandle);

    /// Destroys a linked program.
    fn delete_program(&mut self, program: ProgramHandle);

    /// Commits the resolved pipeline-level state. `difference` names the
    /// groups that changed since the last commit.
    fn flush_common_state(&mut self, state: &FlushState, difference: PipelineState);

    /// Commits the resolved state of the layer bound to texture `unit`.
    fn bind_layer(&mut self, unit: usize, layer: &ResolvedLayer, difference: LayerState);
}
