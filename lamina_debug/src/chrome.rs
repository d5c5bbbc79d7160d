// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Chrome Trace Event Format exporter.
//!
//! [`export`] reads recorded bytes from a [`RecorderSink`](super::recorder::RecorderSink)
//! and writes [Chrome Trace Event Format][spec] JSON to the given writer.
//!
//! Recordings carry no wall-clock time, so each event's `ts` is its ordinal
//! position in the recording. A validated or failed flush becomes a `B`/`E`
//! span with its stages nested inside; a reused flush is a single instant.
//!
//! [spec]: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU

use std::io::{self, Write};

use serde_json::{Value, json};

use lamina_core::trace::FlushResult;

use crate::recorder::{RecordedEvent, decode};

/// Exports recorded events as Chrome Trace Event Format JSON.
///
/// The output is a complete JSON array of trace event objects, suitable for
/// loading into `chrome://tracing` or [Perfetto](https://ui.perfetto.dev/).
pub fn export(bytes: &[u8], writer: &mut dyn Write) -> io::Result<()> {
    let mut events: Vec<Value> = Vec::new();

    for (ts, recorded) in decode(bytes).enumerate() {
        match recorded {
            RecordedEvent::FlushBegin(e) => {
                events.push(json!({
                    "ph": "B",
                    "name": "Flush",
                    "cat": "Validate",
                    "ts": ts,
                    "pid": 0,
                    "tid": 0,
                    "args": {
                        "flush_index": e.flush_index,
                        "pipeline": e.pipeline,
                        "n_layers": e.n_layers,
                        "difference": format!("{:?}", e.difference),
                    }
                }));
            }
            RecordedEvent::Stage(e) => {
                events.push(json!({
                    "ph": "i",
                    "name": format!("{:?}", e.stage),
                    "cat": "Stage",
                    "ts": ts,
                    "pid": 0,
                    "tid": e.backend,
                    "s": "t",
                    "args": {
                        "flush_index": e.flush_index,
                        "outcome": format!("{:?}", e.outcome),
                    }
                }));
            }
            RecordedEvent::BackendFallback(e) => {
                events.push(json!({
                    "ph": "i",
                    "name": "BackendFallback",
                    "cat": "Validate",
                    "ts": ts,
                    "pid": 0,
                    "tid": 0,
                    "s": "p",
                    "args": {
                        "flush_index": e.flush_index,
                        "from": e.from,
                        "to": e.to,
                    }
                }));
            }
            RecordedEvent::FlushEnd(e) => {
                let ph = if e.result == FlushResult::Reused {
                    "i"
                } else {
                    "E"
                };
                let mut event = json!({
                    "ph": ph,
                    "name": "Flush",
                    "cat": "Validate",
                    "ts": ts,
                    "pid": 0,
                    "tid": 0,
                    "args": {
                        "flush_index": e.flush_index,
                        "result": format!("{:?}", e.result),
                        "backend": e.backend,
                    }
                });
                if ph == "i" {
                    event["s"] = json!("t");
                }
                events.push(event);
            }
            RecordedEvent::CopyOnWrite(e) => {
                events.push(json!({
                    "ph": "i",
                    "name": "CopyOnWrite",
                    "cat": "Tree",
                    "ts": ts,
                    "pid": 0,
                    "tid": 0,
                    "s": "t",
                    "args": {
                        "node": format!("{:?}", e.node),
                        "from": e.from,
                        "to": e.to,
                    }
                }));
            }
            RecordedEvent::PrivateReleased(e) => {
                events.push(json!({
                    "ph": "i",
                    "name": "PrivateReleased",
                    "cat": "Device",
                    "ts": ts,
                    "pid": 0,
                    "tid": e.backend,
                    "s": "t",
                    "args": {
                        "stage": format!("{:?}", e.stage),
                        "object": format!("{:?}", e.object),
                    }
                }));
            }
            RecordedEvent::Diff(e) => {
                events.push(json!({
                    "ph": "i",
                    "name": "Diff",
                    "cat": "Rich",
                    "ts": ts,
                    "pid": 0,
                    "tid": 0,
                    "s": "t",
                    "args": {
                        "flush_index": e.flush_index,
                        "steps": e.steps,
                        "difference": format!("{:?}", e.difference),
                    }
                }));
            }
            RecordedEvent::LayerDiffs {
                flush_index,
                units,
                union,
            } => {
                events.push(json!({
                    "ph": "i",
                    "name": "LayerDiffs",
                    "cat": "Rich",
                    "ts": ts,
                    "pid": 0,
                    "tid": 0,
                    "s": "t",
                    "args": {
                        "flush_index": flush_index,
                        "units": units,
                        "union": format!("{union:?}"),
                    }
                }));
            }
        }
    }

    serde_json::to_writer_pretty(writer, &events)?;
    Ok(())
}
