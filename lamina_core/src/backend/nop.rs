// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The no-op backend: accepts every pipeline and builds nothing.
//!
//! It is always the last entry of a [`BackendTable`](super::BackendTable),
//! so validation can always settle on some backend. Fixed-function state is
//! still committed by the context after it succeeds.

use alloc::boxed::Box;

use super::{Backend, BackendKind, PipelineStage, StageContext, StageError};
use crate::id::PipelineId;
use crate::state::PipelineState;

/// A stage that accepts everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopStage;

impl PipelineStage for NopStage {
    fn start(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
        n_layers: usize,
        difference: PipelineState,
    ) -> Result<(), StageError> {
        _ = (cx, pipeline, n_layers, difference);
        Ok(())
    }

    fn end(
        &mut self,
        cx: &mut StageContext<'_>,
        pipeline: PipelineId,
        difference: PipelineState,
    ) -> Result<(), StageError> {
        _ = (cx, pipeline, difference);
        Ok(())
    }
}

/// Creates the no-op backend.
#[must_use]
pub fn backend() -> Backend {
    Backend::new(
        "nop",
        BackendKind::Nop,
        Box::new(NopStage),
        Box::new(NopStage),
        Box::new(NopStage),
    )
}
