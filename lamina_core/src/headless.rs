// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A [`Device`] that records calls instead of talking to a driver.
//!
//! Handles are handed out from one sequential counter shared by shaders and
//! programs. Allocations can be made to fail after a budget, which is how
//! tests exercise the resource-exhaustion path.

use alloc::vec::Vec;

use crate::device::{
    Device, DeviceCaps, DeviceError, ProgramHandle, ShaderDesc, ShaderHandle, ShaderStage,
};
use crate::id::TextureHandle;
use crate::layer::ResolvedLayer;
use crate::pipeline::FlushState;
use crate::state::{LayerState, PipelineState};

/// One recorded device call.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCall {
    /// A shader was compiled.
    CompileShader {
        /// Target stage.
        stage: ShaderStage,
        /// Handle returned.
        shader: ShaderHandle,
    },
    /// Two shaders were linked.
    LinkProgram {
        /// Vertex shader.
        vertex: ShaderHandle,
        /// Fragment shader.
        fragment: ShaderHandle,
        /// Handle returned.
        program: ProgramHandle,
    },
    /// The active program changed.
    UseProgram(Option<ProgramHandle>),
    /// A shader was destroyed.
    DeleteShader(ShaderHandle),
    /// A program was destroyed.
    DeleteProgram(ProgramHandle),
    /// Pipeline-level state was committed.
    FlushCommonState {
        /// Groups that changed.
        difference: PipelineState,
        /// Whether blending was enabled.
        blending: bool,
    },
    /// A texture unit was bound.
    BindLayer {
        /// Texture unit.
        unit: usize,
        /// Texture bound to it.
        texture: Option<TextureHandle>,
        /// Layer groups that changed.
        difference: LayerState,
    },
}

/// Recording device for tests and headless validation.
#[derive(Clone, Debug)]
pub struct RecordingDevice {
    caps: DeviceCaps,
    calls: Vec<DeviceCall>,
    next_handle: u32,
    budget: Option<usize>,
    shaders: Vec<(ShaderHandle, ShaderDesc)>,
    programs: Vec<ProgramHandle>,
    bound: Option<ProgramHandle>,
}

impl RecordingDevice {
    /// Creates a device reporting `caps`.
    #[must_use]
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            calls: Vec::new(),
            next_handle: 0,
            budget: None,
            shaders: Vec::new(),
            programs: Vec::new(),
            bound: None,
        }
    }

    /// Returns every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> &[DeviceCall] {
        &self.calls
    }

    /// Returns and clears the recorded calls.
    pub fn take_calls(&mut self) -> Vec<DeviceCall> {
        core::mem::take(&mut self.calls)
    }

    /// Makes every allocation after the next `n` fail with
    /// [`DeviceError::OutOfMemory`].
    pub fn fail_allocations_after(&mut self, n: usize) {
        self.budget = Some(n);
    }

    /// Lifts any allocation limit.
    pub fn clear_allocation_limit(&mut self) {
        self.budget = None;
    }

    /// Returns the number of shaders and programs not yet deleted.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.shaders.len() + self.programs.len()
    }

    /// Iterates descriptors of live shaders in compile order.
    pub fn shader_descs(&self) -> impl Iterator<Item = &ShaderDesc> {
        self.shaders.iter().map(|(_, desc)| desc)
    }

    /// Returns the active program.
    #[must_use]
    pub fn bound_program(&self) -> Option<ProgramHandle> {
        self.bound
    }

    fn allocate(&mut self) -> Result<u32, DeviceError> {
        if let Some(budget) = &mut self.budget {
            if *budget == 0 {
                return Err(DeviceError::OutOfMemory);
            }
            *budget -= 1;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        Ok(handle)
    }
}

impl Device for RecordingDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn compile_shader(&mut self, desc: &ShaderDesc) -> Result<ShaderHandle, DeviceError> {
        let shader = ShaderHandle(self.allocate()?);
        self.shaders.push((shader, desc.clone()));
        self.calls.push(DeviceCall::CompileShader {
            stage: desc.stage,
            shader,
        });
        Ok(shader)
    }

    fn link_program(
        &mut self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    ) -> Result<ProgramHandle, DeviceError> {
        let program = ProgramHandle(self.allocate()?);
        self.programs.push(program);
        self.calls.push(DeviceCall::LinkProgram {
            vertex,
            fragment,
            program,
        });
        Ok(program)
    }

    fn use_program(&mut self, program: Option<ProgramHandle>) {
        self.bound = program;
        self.calls.push(DeviceCall::UseProgram(program));
    }

    fn delete_shader(&mut self, shader: ShaderHandle) {
        self.shaders.retain(|(s, _)| *s != shader);
        self.calls.push(DeviceCall::DeleteShader(shader));
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        assert!(
            self.bound != Some(program),
            "deleted program {program:?} while it was bound"
        );
        self.programs.retain(|p| *p != program);
        self.calls.push(DeviceCall::DeleteProgram(program));
    }

    fn flush_common_state(&mut self, state: &FlushState, difference: PipelineState) {
        self.calls.push(DeviceCall::FlushCommonState {
            difference,
            blending: state.blending,
        });
    }

    fn bind_layer(&mut self, unit: usize, layer: &ResolvedLayer, difference: LayerState) {
        self.calls.push(DeviceCall::BindLayer {
            unit,
            texture: layer.texture,
            difference,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_sequential_across_kinds() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let vs = device.compile_shader(&ShaderDesc::new(ShaderStage::Vertex)).unwrap();
        let fs = device.compile_shader(&ShaderDesc::new(ShaderStage::Fragment)).unwrap();
        let program = device.link_program(vs, fs).unwrap();
        assert_eq!((vs.0, fs.0, program.0), (0, 1, 2));
        assert_eq!(device.live_objects(), 3);
    }

    #[test]
    fn allocation_budget_fails_then_clears() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        device.fail_allocations_after(1);
        let desc = ShaderDesc::new(ShaderStage::Vertex);
        assert!(device.compile_shader(&desc).is_ok());
        assert_eq!(device.compile_shader(&desc), Err(DeviceError::OutOfMemory));
        device.clear_allocation_limit();
        assert!(device.compile_shader(&desc).is_ok());
        assert_eq!(device.calls().len(), 2);
    }

    #[test]
    #[should_panic(expected = "while it was bound")]
    fn deleting_the_bound_program_panics() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let vs = device.compile_shader(&ShaderDesc::new(ShaderStage::Vertex)).unwrap();
        let fs = device.compile_shader(&ShaderDesc::new(ShaderStage::Fragment)).unwrap();
        let program = device.link_program(vs, fs).unwrap();
        device.use_program(Some(program));
        device.delete_program(program);
    }
}
