// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Copy-on-write GPU pipeline state with differential backend dispatch.
//!
//! `lamina_core` models drawable GPU state as a tree of immutable-by-default
//! nodes. A pipeline stores only the state groups it overrides and inherits
//! the rest from its ancestors; layers (per-texture-unit state) form a second
//! tree with the same shape. It is `no_std` compatible (with `alloc`) and uses
//! struct-of-arrays storage with generational index handles.
//!
//! # Architecture
//!
//! ```text
//!   PipelineStore::derive / set_state        (copy-on-write edits)
//!       │
//!       ▼
//!   Context::flush(pipeline)
//!       │  compare_differences(bound, pipeline)   O(distance to common ancestor)
//!       ▼
//!   BackendTable: program ──Unsupported──► … ──► nop
//!       │  vertex ─► fragment ─► link
//!       ▼
//!   Device::flush_common_state / bind_layer
//! ```
//!
//! **[`state`]** — State group bitmasks and their value types.
//!
//! **[`pipeline`]** — Pipeline nodes, the mutate-or-fork rule, resolution,
//! and the difference engine.
//!
//! **[`layer`]** — Layer nodes with the same copy-on-write rules.
//!
//! **[`backend`]** — The [`PipelineStage`](backend::PipelineStage) contract,
//! the program and no-op backends, and the per-device
//! [`BackendTable`](backend::BackendTable).
//!
//! **[`context`]** — The validation state machine that picks a backend,
//! runs its stages, and commits state through the [`Device`](device::Device).
//!
//! **[`device`]** — The device collaborator trait and capability flags.
//!
//! **[`headless`]** — A recording [`Device`](device::Device) for tests and
//! headless validation.
//!
//! **[`trace`]** — [`TraceSink`](trace::TraceSink) trait and event types for
//! validation instrumentation, with zero-overhead [`Tracer`](trace::Tracer)
//! wrapper.
//!
//! # Crate features
//!
//! - `std` (disabled by default): Enables `std` support in dependencies.
//! - `trace` (disabled by default): Enables `Tracer` method bodies (one branch
//!   per call site).
//! - `trace-rich` (disabled by default, implies `trace`): Gates difference
//!   cost and per-unit layer difference events.

#![no_std]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate alloc;

pub mod backend;
pub mod context;
pub mod device;
pub mod headless;
pub mod id;
pub mod layer;
mod node;
pub mod pipeline;
pub mod state;
pub mod trace;
