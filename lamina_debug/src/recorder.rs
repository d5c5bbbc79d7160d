// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Compact binary event recording and decoding.
//!
//! [`RecorderSink`] implements [`TraceSink`] and encodes events into a
//! `Vec<u8>` as fixed-size little-endian records. [`decode`] reads them back
//! as an iterator of [`RecordedEvent`].
//!
//! Per-unit layer differences ([`on_layer_diffs`](TraceSink::on_layer_diffs))
//! store only the unit count and the union of the masks.

use lamina_core::backend::StageKind;
use lamina_core::device::{DeviceObject, ProgramHandle, ShaderHandle};
use lamina_core::state::{LayerState, PipelineState};
use lamina_core::trace::{
    BackendFallbackEvent, CopyOnWriteEvent, DiffEvent, FlushBeginEvent, FlushEndEvent,
    FlushResult, LayerDiff, NodeKind, PrivateReleasedEvent, StageEvent, StageOutcome, TraceSink,
};

// ---------------------------------------------------------------------------
// Event type discriminants
// ---------------------------------------------------------------------------

const TAG_FLUSH_BEGIN: u8 = 1;
const TAG_STAGE: u8 = 2;
const TAG_BACKEND_FALLBACK: u8 = 3;
const TAG_FLUSH_END: u8 = 4;
const TAG_COPY_ON_WRITE: u8 = 5;
const TAG_PRIVATE_RELEASED: u8 = 6;
const TAG_DIFF: u8 = 7;
const TAG_LAYER_DIFFS: u8 = 8;

// ---------------------------------------------------------------------------
// RecorderSink
// ---------------------------------------------------------------------------

/// A [`TraceSink`] that encodes events into a compact binary buffer.
#[derive(Debug, Default)]
pub struct RecorderSink {
    buf: Vec<u8>,
}

impl RecorderSink {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a view of the recorded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the recorder and returns the recorded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    // -- encoding helpers --------------------------------------------------

    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_option_u32(&mut self, v: Option<u32>) {
        match v {
            Some(val) => {
                self.write_u8(1);
                self.write_u32(val);
            }
            None => {
                self.write_u8(0);
                self.write_u32(0);
            }
        }
    }

    fn write_stage(&mut self, s: StageKind) {
        self.write_u8(match s {
            StageKind::Vertex => 0,
            StageKind::Fragment => 1,
            StageKind::Link => 2,
        });
    }

    fn write_object(&mut self, o: DeviceObject) {
        let (kind, raw) = match o {
            DeviceObject::Shader(s) => (0, s.0),
            DeviceObject::Program(p) => (1, p.0),
            DeviceObject::Custom(c) => (2, c),
        };
        self.write_u8(kind);
        self.write_u32(raw);
    }
}

impl TraceSink for RecorderSink {
    fn on_flush_begin(&mut self, e: &FlushBeginEvent) {
        self.write_u8(TAG_FLUSH_BEGIN);
        self.write_u64(e.flush_index);
        self.write_u32(e.pipeline);
        self.write_u32(e.n_layers);
        self.write_u32(e.difference.bits());
    }

    fn on_stage(&mut self, e: &StageEvent) {
        self.write_u8(TAG_STAGE);
        self.write_u64(e.flush_index);
        self.write_u32(e.backend);
        self.write_stage(e.stage);
        self.write_u8(match e.outcome {
            StageOutcome::Accepted => 0,
            StageOutcome::Unsupported => 1,
            StageOutcome::DeviceError => 2,
        });
    }

    fn on_backend_fallback(&mut self, e: &BackendFallbackEvent) {
        self.write_u8(TAG_BACKEND_FALLBACK);
        self.write_u64(e.flush_index);
        self.write_u32(e.from);
        self.write_u32(e.to);
    }

    fn on_flush_end(&mut self, e: &FlushEndEvent) {
        self.write_u8(TAG_FLUSH_END);
        self.write_u64(e.flush_index);
        self.write_u8(match e.result {
            FlushResult::Reused => 0,
            FlushResult::Validated => 1,
            FlushResult::Failed => 2,
        });
        self.write_option_u32(e.backend);
    }

    fn on_copy_on_write(&mut self, e: &CopyOnWriteEvent) {
        self.write_u8(TAG_COPY_ON_WRITE);
        self.write_u8(match e.node {
            NodeKind::Pipeline => 0,
            NodeKind::Layer => 1,
        });
        self.write_u32(e.from);
        self.write_u32(e.to);
    }

    fn on_private_released(&mut self, e: &PrivateReleasedEvent) {
        self.write_u8(TAG_PRIVATE_RELEASED);
        self.write_u32(e.backend);
        self.write_stage(e.stage);
        self.write_object(e.object);
    }

    fn on_diff(&mut self, e: &DiffEvent) {
        self.write_u8(TAG_DIFF);
        self.write_u64(e.flush_index);
        self.write_u32(e.steps);
        self.write_u32(e.difference.bits());
    }

    fn on_layer_diffs(&mut self, flush_index: u64, diffs: &[LayerDiff]) {
        self.write_u8(TAG_LAYER_DIFFS);
        self.write_u64(flush_index);
        #[expect(
            clippy::cast_possible_truncation,
            reason = "unit count capped at u32::MAX for recording"
        )]
        self.write_u32(diffs.len().min(u32::MAX as usize) as u32);
        let union = diffs
            .iter()
            .fold(LayerState::empty(), |acc, d| acc | d.difference);
        self.write_u32(union.bits());
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// A decoded event from a binary recording.
#[derive(Clone, Debug)]
pub enum RecordedEvent {
    /// A [`FlushBeginEvent`].
    FlushBegin(FlushBeginEvent),
    /// A [`StageEvent`].
    Stage(StageEvent),
    /// A [`BackendFallbackEvent`].
    BackendFallback(BackendFallbackEvent),
    /// A [`FlushEndEvent`].
    FlushEnd(FlushEndEvent),
    /// A [`CopyOnWriteEvent`].
    CopyOnWrite(CopyOnWriteEvent),
    /// A [`PrivateReleasedEvent`].
    PrivateReleased(PrivateReleasedEvent),
    /// A [`DiffEvent`].
    Diff(DiffEvent),
    /// Summary of the per-unit layer differences of a flush.
    LayerDiffs {
        /// Flush counter.
        flush_index: u64,
        /// Number of texture units.
        units: u32,
        /// Union of every unit's difference.
        union: LayerState,
    },
}

/// Decodes a byte slice produced by [`RecorderSink`] into an iterator of
/// [`RecordedEvent`].
pub fn decode(bytes: &[u8]) -> DecodeIter<'_> {
    DecodeIter {
        data: bytes,
        pos: 0,
    }
}

/// Iterator over decoded events.
#[derive(Debug)]
pub struct DecodeIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl DecodeIter<'_> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_u8(&mut self) -> Option<u8> {
        if self.remaining() < 1 {
            return None;
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Some(v)
    }

    fn read_u32(&mut self) -> Option<u32> {
        if self.remaining() < 4 {
            return None;
        }
        let v = u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().ok()?);
        self.pos += 4;
        Some(v)
    }

    fn read_u64(&mut self) -> Option<u64> {
        if self.remaining() < 8 {
            return None;
        }
        let v = u64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().ok()?);
        self.pos += 8;
        Some(v)
    }

    fn read_option_u32(&mut self) -> Option<Option<u32>> {
        let present = self.read_u8()?;
        let val = self.read_u32()?;
        Some(if present != 0 { Some(val) } else { None })
    }

    fn read_stage(&mut self) -> Option<StageKind> {
        Some(match self.read_u8()? {
            0 => StageKind::Vertex,
            1 => StageKind::Fragment,
            _ => StageKind::Link,
        })
    }

    fn read_object(&mut self) -> Option<DeviceObject> {
        let kind = self.read_u8()?;
        let raw = self.read_u32()?;
        Some(match kind {
            0 => DeviceObject::Shader(ShaderHandle(raw)),
            1 => DeviceObject::Program(ProgramHandle(raw)),
            _ => DeviceObject::Custom(raw),
        })
    }

    fn read_pipeline_state(&mut self) -> Option<PipelineState> {
        Some(PipelineState::from_bits_retain(self.read_u32()?))
    }

    fn decode_flush_begin(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::FlushBegin(FlushBeginEvent {
            flush_index: self.read_u64()?,
            pipeline: self.read_u32()?,
            n_layers: self.read_u32()?,
            difference: self.read_pipeline_state()?,
        }))
    }

    fn decode_stage(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::Stage(StageEvent {
            flush_index: self.read_u64()?,
            backend: self.read_u32()?,
            stage: self.read_stage()?,
            outcome: match self.read_u8()? {
                0 => StageOutcome::Accepted,
                1 => StageOutcome::Unsupported,
                _ => StageOutcome::DeviceError,
            },
        }))
    }

    fn decode_backend_fallback(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::BackendFallback(BackendFallbackEvent {
            flush_index: self.read_u64()?,
            from: self.read_u32()?,
            to: self.read_u32()?,
        }))
    }

    fn decode_flush_end(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::FlushEnd(FlushEndEvent {
            flush_index: self.read_u64()?,
            result: match self.read_u8()? {
                0 => FlushResult::Reused,
                1 => FlushResult::Validated,
                _ => FlushResult::Failed,
            },
            backend: self.read_option_u32()?,
        }))
    }

    fn decode_copy_on_write(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::CopyOnWrite(CopyOnWriteEvent {
            node: match self.read_u8()? {
                0 => NodeKind::Pipeline,
                _ => NodeKind::Layer,
            },
            from: self.read_u32()?,
            to: self.read_u32()?,
        }))
    }

    fn decode_private_released(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::PrivateReleased(PrivateReleasedEvent {
            backend: self.read_u32()?,
            stage: self.read_stage()?,
            object: self.read_object()?,
        }))
    }

    fn decode_diff(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::Diff(DiffEvent {
            flush_index: self.read_u64()?,
            steps: self.read_u32()?,
            difference: self.read_pipeline_state()?,
        }))
    }

    fn decode_layer_diffs(&mut self) -> Option<RecordedEvent> {
        let flush_index = self.read_u64()?;
        let units = self.read_u32()?;
        let union = LayerState::from_bits_retain(self.read_u32()?);
        Some(RecordedEvent::LayerDiffs {
            flush_index,
            units,
            union,
        })
    }
}

impl Iterator for DecodeIter<'_> {
    type Item = RecordedEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let tag = self.read_u8()?;
        match tag {
            TAG_FLUSH_BEGIN => self.decode_flush_begin(),
            TAG_STAGE => self.decode_stage(),
            TAG_BACKEND_FALLBACK => self.decode_backend_fallback(),
            TAG_FLUSH_END => self.decode_flush_end(),
            TAG_COPY_ON_WRITE => self.decode_copy_on_write(),
            TAG_PRIVATE_RELEASED => self.decode_private_released(),
            TAG_DIFF => self.decode_diff(),
            TAG_LAYER_DIFFS => self.decode_layer_diffs(),
            _ => None, // unknown tag → stop iteration
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
