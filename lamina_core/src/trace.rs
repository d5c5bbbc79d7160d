// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tracing and diagnostics for validation.
//!
//! This module provides a [`TraceSink`] trait with per-event methods that the
//! [`Context`](crate::context::Context) calls while it validates pipelines.
//! All method bodies default to no-ops, so implementing only the events you
//! care about is fine.
//!
//! [`Tracer`] wraps an optional `&mut dyn TraceSink`. When the `trace` feature
//! is **off**, every `Tracer` method compiles to nothing (zero overhead). When
//! **on**, each method performs a single `Option` branch before dispatching.
//!
//! # Crate features
//!
//! - `trace` — enables the `Tracer` method bodies (one branch per call).
//! - `trace-rich` (implies `trace`) — gates [`DiffEvent`] and [`LayerDiff`]
//!   events plus the corresponding `TraceSink` methods.

use crate::backend::StageKind;
use crate::device::DeviceObject;
#[cfg(feature = "trace-rich")]
use crate::state::LayerState;
use crate::state::PipelineState;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How one stage hook sequence ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageOutcome {
    /// Every hook accepted the pipeline.
    Accepted,
    /// A hook rejected the pipeline's shape.
    Unsupported,
    /// The device failed to allocate an object.
    DeviceError,
}

/// How a flush ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlushResult {
    /// The bound pipeline was still valid; nothing ran.
    Reused,
    /// A backend accepted the pipeline and state was committed.
    Validated,
    /// Validation failed; nothing was committed.
    Failed,
}

/// Which tree a copy-on-write fork happened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A pipeline was forked.
    Pipeline,
    /// A layer was forked.
    Layer,
}

// ---------------------------------------------------------------------------
// Event structs
// ---------------------------------------------------------------------------

/// Emitted when a flush starts validating a pipeline.
#[derive(Clone, Copy, Debug)]
pub struct FlushBeginEvent {
    /// Monotonic flush counter.
    pub flush_index: u64,
    /// Slot index of the pipeline being flushed.
    pub pipeline: u32,
    /// Number of layers on the pipeline.
    pub n_layers: u32,
    /// Groups that differ from the bound pipeline.
    pub difference: PipelineState,
}

/// Emitted after one stage of one backend ran.
#[derive(Clone, Copy, Debug)]
pub struct StageEvent {
    /// Flush counter.
    pub flush_index: u64,
    /// Backend index in the table.
    pub backend: u32,
    /// Which stage ran.
    pub stage: StageKind,
    /// How it ended.
    pub outcome: StageOutcome,
}

/// Emitted when a backend rejects a pipeline and the next one is tried.
#[derive(Clone, Copy, Debug)]
pub struct BackendFallbackEvent {
    /// Flush counter.
    pub flush_index: u64,
    /// Backend that rejected the pipeline.
    pub from: u32,
    /// Backend tried next.
    pub to: u32,
}

/// Emitted when a flush finishes.
#[derive(Clone, Copy, Debug)]
pub struct FlushEndEvent {
    /// Flush counter.
    pub flush_index: u64,
    /// How the flush ended.
    pub result: FlushResult,
    /// Backend that accepted the pipeline, if any.
    pub backend: Option<u32>,
}

/// Emitted when a state edit forked a shared node.
#[derive(Clone, Copy, Debug)]
pub struct CopyOnWriteEvent {
    /// Which tree.
    pub node: NodeKind,
    /// Slot index of the node that was shared.
    pub from: u32,
    /// Slot index of the new child.
    pub to: u32,
}

/// Emitted when a backend-private object is torn down.
#[derive(Clone, Copy, Debug)]
pub struct PrivateReleasedEvent {
    /// Backend that owned the object.
    pub backend: u32,
    /// Stage that owned the object.
    pub stage: StageKind,
    /// The destroyed object.
    pub object: DeviceObject,
}

/// Cost of the pipeline comparison in a flush.
#[cfg(feature = "trace-rich")]
#[derive(Clone, Copy, Debug)]
pub struct DiffEvent {
    /// Flush counter.
    pub flush_index: u64,
    /// Ancestor nodes visited.
    pub steps: u32,
    /// Resulting difference mask.
    pub difference: PipelineState,
}

/// Layer difference of one texture unit in a flush.
#[cfg(feature = "trace-rich")]
#[derive(Clone, Copy, Debug)]
pub struct LayerDiff {
    /// Texture unit.
    pub unit: u32,
    /// Layer groups to rebind.
    pub difference: LayerState,
}

// ---------------------------------------------------------------------------
// TraceSink trait
// ---------------------------------------------------------------------------

/// Receives trace events from validation.
///
/// All methods have default no-op implementations, so you only need to
/// override the events you care about.
pub trait TraceSink {
    /// Called when a flush starts validating.
    fn on_flush_begin(&mut self, e: &FlushBeginEvent) {
        _ = e;
    }

    /// Called after each stage ran.
    fn on_stage(&mut self, e: &StageEvent) {
        _ = e;
    }

    /// Called when validation falls back to the next backend.
    fn on_backend_fallback(&mut self, e: &BackendFallbackEvent) {
        _ = e;
    }

    /// Called when a flush finishes.
    fn on_flush_end(&mut self, e: &FlushEndEvent) {
        _ = e;
    }

    /// Called when an edit forked a shared node.
    fn on_copy_on_write(&mut self, e: &CopyOnWriteEvent) {
        _ = e;
    }

    /// Called when a device object is destroyed.
    fn on_private_released(&mut self, e: &PrivateReleasedEvent) {
        _ = e;
    }

    /// Called with the comparison cost of a flush (requires `trace-rich`).
    #[cfg(feature = "trace-rich")]
    fn on_diff(&mut self, e: &DiffEvent) {
        _ = e;
    }

    /// Called with per-unit layer differences (requires `trace-rich`).
    #[cfg(feature = "trace-rich")]
    fn on_layer_diffs(&mut self, flush_index: u64, diffs: &[LayerDiff]) {
        _ = (flush_index, diffs);
    }
}

// ---------------------------------------------------------------------------
// NoopSink
// ---------------------------------------------------------------------------

/// A [`TraceSink`] that discards all events.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl TraceSink for NoopSink {}

// ---------------------------------------------------------------------------
// Tracer wrapper
// ---------------------------------------------------------------------------

/// Thin wrapper around an optional [`TraceSink`].
///
/// When the `trace` feature is **off**, every method compiles to nothing. When
/// **on**, each method checks the inner `Option` (one branch) before
/// dispatching to the sink.
pub struct Tracer<'a> {
    #[cfg(feature = "trace")]
    sink: Option<&'a mut dyn TraceSink>,
    #[cfg(not(feature = "trace"))]
    _marker: core::marker::PhantomData<&'a mut dyn TraceSink>,
}

impl core::fmt::Debug for Tracer<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tracer").finish_non_exhaustive()
    }
}

impl<'a> Tracer<'a> {
    /// Creates a tracer that dispatches to the given sink.
    #[inline]
    #[must_use]
    pub fn new(sink: &'a mut dyn TraceSink) -> Self {
        #[cfg(feature = "trace")]
        {
            Self { sink: Some(sink) }
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = sink;
            Self {
                _marker: core::marker::PhantomData,
            }
        }
    }

    /// Creates a tracer that discards all events.
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        #[cfg(feature = "trace")]
        {
            Self { sink: None }
        }
        #[cfg(not(feature = "trace"))]
        {
            Self {
                _marker: core::marker::PhantomData,
            }
        }
    }

    /// Emits a [`FlushBeginEvent`].
    #[inline]
    pub fn flush_begin(&mut self, e: &FlushBeginEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_flush_begin(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }

    /// Emits a [`StageEvent`].
    #[inline]
    pub fn stage(&mut self, e: &StageEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_stage(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }

    /// Emits a [`BackendFallbackEvent`].
    #[inline]
    pub fn backend_fallback(&mut self, e: &BackendFallbackEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_backend_fallback(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }

    /// Emits a [`FlushEndEvent`].
    #[inline]
    pub fn flush_end(&mut self, e: &FlushEndEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_flush_end(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }

    /// Emits a [`CopyOnWriteEvent`].
    #[inline]
    pub fn copy_on_write(&mut self, e: &CopyOnWriteEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_copy_on_write(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }

    /// Emits a [`PrivateReleasedEvent`].
    #[inline]
    pub fn private_released(&mut self, e: &PrivateReleasedEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_private_released(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }

    /// Emits a [`DiffEvent`] (requires `trace-rich` feature).
    #[cfg(feature = "trace-rich")]
    #[inline]
    pub fn diff(&mut self, e: &DiffEvent) {
        if let Some(s) = &mut self.sink {
            s.on_diff(e);
        }
    }

    /// Emits per-unit layer differences (requires `trace-rich` feature).
    #[cfg(feature = "trace-rich")]
    #[inline]
    pub fn layer_diffs(&mut self, flush_index: u64, diffs: &[LayerDiff]) {
        if let Some(s) = &mut self.sink {
            s.on_layer_diffs(flush_index, diffs);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_begin() -> FlushBeginEvent {
        FlushBeginEvent {
            flush_index: 42,
            pipeline: 3,
            n_layers: 1,
            difference: PipelineState::BLEND,
        }
    }

    #[test]
    fn noop_sink_compiles() {
        let mut sink = NoopSink;
        sink.on_flush_begin(&sample_begin());
        sink.on_flush_end(&FlushEndEvent {
            flush_index: 42,
            result: FlushResult::Reused,
            backend: None,
        });
    }

    #[test]
    fn tracer_none_does_nothing() {
        let mut tracer = Tracer::none();
        tracer.flush_begin(&sample_begin());
        tracer.backend_fallback(&BackendFallbackEvent {
            flush_index: 42,
            from: 0,
            to: 1,
        });
    }

    #[cfg(feature = "trace")]
    #[test]
    fn tracer_dispatches_to_sink() {
        use alloc::vec::Vec;

        struct RecordingSink {
            flushes: Vec<u64>,
        }
        impl TraceSink for RecordingSink {
            fn on_flush_begin(&mut self, e: &FlushBeginEvent) {
                self.flushes.push(e.flush_index);
            }
        }

        let mut sink = RecordingSink {
            flushes: Vec::new(),
        };
        let mut tracer = Tracer::new(&mut sink);
        tracer.flush_begin(&sample_begin());
        drop(tracer);
        assert_eq!(sink.flushes, &[42]);
    }
}
