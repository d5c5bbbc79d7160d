// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Human-readable trace output.
//!
//! [`PrettyPrintSink`] implements [`TraceSink`] and writes one line per event
//! to a [`Write`](std::io::Write) destination (default: stderr).

use std::io::Write;

use lamina_core::backend::StageKind;
use lamina_core::device::DeviceObject;
use lamina_core::trace::{
    BackendFallbackEvent, CopyOnWriteEvent, DiffEvent, FlushBeginEvent, FlushEndEvent,
    FlushResult, LayerDiff, NodeKind, PrivateReleasedEvent, StageEvent, StageOutcome, TraceSink,
};

/// Writes human-readable trace lines to a [`Write`](std::io::Write) destination.
pub struct PrettyPrintSink<W: Write = Box<dyn Write>> {
    writer: W,
}

impl<W: Write> std::fmt::Debug for PrettyPrintSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrettyPrintSink").finish_non_exhaustive()
    }
}

impl PrettyPrintSink {
    /// Creates a sink that writes to stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            writer: Box::new(std::io::stderr()),
        }
    }

    /// Creates a sink that writes to a boxed writer.
    #[must_use]
    pub fn new(writer: Box<dyn Write>) -> Self {
        Self { writer }
    }
}

impl<W: Write> PrettyPrintSink<W> {
    /// Creates a sink that writes to the given destination.
    #[must_use]
    pub fn with_writer(writer: W) -> Self {
        Self { writer }
    }

    /// Consumes the sink and returns the destination.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn stage_name(stage: StageKind) -> &'static str {
    match stage {
        StageKind::Vertex => "vertex",
        StageKind::Fragment => "fragment",
        StageKind::Link => "link",
    }
}

fn object_name(object: DeviceObject) -> String {
    match object {
        DeviceObject::Shader(s) => format!("shader#{}", s.0),
        DeviceObject::Program(p) => format!("program#{}", p.0),
        DeviceObject::Custom(c) => format!("custom#{c}"),
    }
}

impl<W: Write> TraceSink for PrettyPrintSink<W> {
    fn on_flush_begin(&mut self, e: &FlushBeginEvent) {
        let _ = writeln!(
            self.writer,
            "[flush] #{} pipeline={} layers={} diff={:?}",
            e.flush_index, e.pipeline, e.n_layers, e.difference,
        );
    }

    fn on_stage(&mut self, e: &StageEvent) {
        let outcome = match e.outcome {
            StageOutcome::Accepted => "ok",
            StageOutcome::Unsupported => "UNSUPPORTED",
            StageOutcome::DeviceError => "DEVICE-ERROR",
        };
        let _ = writeln!(
            self.writer,
            "[stage] #{} backend={} {} {outcome}",
            e.flush_index,
            e.backend,
            stage_name(e.stage),
        );
    }

    fn on_backend_fallback(&mut self, e: &BackendFallbackEvent) {
        let _ = writeln!(
            self.writer,
            "[fallback] #{} backend {} -> {}",
            e.flush_index, e.from, e.to,
        );
    }

    fn on_flush_end(&mut self, e: &FlushEndEvent) {
        let result = match e.result {
            FlushResult::Reused => "reused",
            FlushResult::Validated => "validated",
            FlushResult::Failed => "FAILED",
        };
        let backend = e
            .backend
            .map_or_else(|| "-".to_owned(), |b| b.to_string());
        let _ = writeln!(
            self.writer,
            "[flush:end] #{} {result} backend={backend}",
            e.flush_index,
        );
    }

    fn on_copy_on_write(&mut self, e: &CopyOnWriteEvent) {
        let node = match e.node {
            NodeKind::Pipeline => "pipeline",
            NodeKind::Layer => "layer",
        };
        let _ = writeln!(self.writer, "[cow] {node} {} -> {}", e.from, e.to);
    }

    fn on_private_released(&mut self, e: &PrivateReleasedEvent) {
        let _ = writeln!(
            self.writer,
            "[release] backend={} {} {}",
            e.backend,
            stage_name(e.stage),
            object_name(e.object),
        );
    }

    fn on_diff(&mut self, e: &DiffEvent) {
        let _ = writeln!(
            self.writer,
            "[diff] #{} steps={} diff={:?}",
            e.flush_index, e.steps, e.difference,
        );
    }

    fn on_layer_diffs(&mut self, flush_index: u64, diffs: &[LayerDiff]) {
        let changed = diffs.iter().filter(|d| !d.difference.is_empty()).count();
        let _ = writeln!(
            self.writer,
            "[units] #{flush_index} units={} changed={changed}",
            diffs.len(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamina_core::device::ProgramHandle;
    use lamina_core::state::PipelineState;

    fn output(sink: PrettyPrintSink<Vec<u8>>) -> String {
        String::from_utf8(sink.into_inner()).unwrap()
    }

    #[test]
    fn pretty_print_flush() {
        let mut sink = PrettyPrintSink::with_writer(Vec::<u8>::new());
        sink.on_flush_begin(&FlushBeginEvent {
            flush_index: 1,
            pipeline: 4,
            n_layers: 2,
            difference: PipelineState::DEPTH,
        });
        sink.on_flush_end(&FlushEndEvent {
            flush_index: 1,
            result: FlushResult::Validated,
            backend: Some(0),
        });
        let output = output(sink);
        assert!(output.contains("[flush] #1 pipeline=4"), "got: {output}");
        assert!(output.contains("validated backend=0"), "got: {output}");
    }

    #[test]
    fn pretty_print_fallback_and_release() {
        let mut sink = PrettyPrintSink::with_writer(Vec::<u8>::new());
        sink.on_stage(&StageEvent {
            flush_index: 3,
            backend: 0,
            stage: StageKind::Vertex,
            outcome: StageOutcome::Unsupported,
        });
        sink.on_backend_fallback(&BackendFallbackEvent {
            flush_index: 3,
            from: 0,
            to: 1,
        });
        sink.on_private_released(&PrivateReleasedEvent {
            backend: 0,
            stage: StageKind::Link,
            object: DeviceObject::Program(ProgramHandle(9)),
        });
        let output = output(sink);
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(
            lines,
            [
                "[stage] #3 backend=0 vertex UNSUPPORTED",
                "[fallback] #3 backend 0 -> 1",
                "[release] backend=0 link program#9",
            ]
        );
    }
}
