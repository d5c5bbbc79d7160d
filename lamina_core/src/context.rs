// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Validation and commit of the pipeline used for a draw.
//!
//! [`Context`] owns the pipeline store, the backend table, and the device.
//! Before every draw the caller hands it a pipeline through
//! [`flush`](Context::flush), which runs the validation state machine:
//!
//! ```text
//!   Unvalidated ──flush──► Validating ──backend accepts──► Valid
//!        ▲                     │                             │
//!        └──device error───────┘                             │
//!        └────────────────────────invalidate()───────────────┘
//! ```
//!
//! While validating, the difference between the bound pipeline and the new
//! one is computed once through the tree, then every backend stage sees the
//! same mask. Backends are tried in table order starting at the one that
//! last accepted the pipeline; the no-op backend at the end always accepts.
//!
//! In-place edits are recorded by the stores and applied here lazily: at
//! the start of the next flush each edited node's backend-private objects
//! are offered to the owning stage's change hook and detached when stale.
//! Detached objects are destroyed once no node refers to them.

use alloc::rc::Rc;
use alloc::vec::Vec;

use crate::backend::{
    BackendTable, PipelineStage, StageContext, StageError, StageKind, StageSlot,
};
use crate::device::{Device, DeviceCaps, DeviceError};
use crate::id::{LayerId, PipelineId, TextureHandle};
use crate::node::ReleasedPrivate;
use crate::pipeline::{Mutation, PipelineStore};
use crate::state::{LayerState, LayerValue, PipelineState, PipelineValue};
#[cfg(feature = "trace-rich")]
use crate::trace::{DiffEvent, LayerDiff};
use crate::trace::{
    BackendFallbackEvent, CopyOnWriteEvent, FlushBeginEvent, FlushEndEvent, FlushResult,
    NodeKind, PrivateReleasedEvent, StageEvent, StageOutcome, Tracer,
};

/// Where the context is in the validation state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValidationState {
    /// Device state is unknown; the next flush treats every group as changed.
    Unvalidated,
    /// A flush is running backend stages.
    Validating,
    /// The bound pipeline's state is committed on the device.
    Valid,
}

/// What a successful flush did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The pipeline was already bound and nothing changed.
    Reused,
    /// A backend accepted the pipeline and its state was committed.
    Validated {
        /// Index of the accepting backend.
        backend: usize,
        /// Groups that differed from the previously bound pipeline.
        difference: PipelineState,
    },
}

/// Why a flush failed. Nothing was committed and nothing new stays bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidateError {
    /// No backend in the table accepted the pipeline.
    #[error("no backend can represent the pipeline")]
    Unsupported,
    /// The device ran out of resources while a backend built its objects.
    #[error("backend {backend} failed to build device objects")]
    Device {
        /// Backend that was running.
        backend: usize,
        /// Device failure.
        source: DeviceError,
    },
}

/// Last layer committed to one texture unit.
#[derive(Clone, Copy, Debug, Default)]
struct TextureUnit {
    layer: Option<LayerId>,
    /// Groups to rebind even if the layer did not change.
    changes: LayerState,
}

/// Owns the state tree, the backends, and the device they drive.
#[derive(Debug)]
pub struct Context<D> {
    store: PipelineStore,
    backends: BackendTable,
    device: D,
    caps: DeviceCaps,
    state: ValidationState,
    current: Option<PipelineId>,
    units: Vec<TextureUnit>,
    flush_index: u64,
}

fn index_u32(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

impl<D: Device> Context<D> {
    /// Creates a context with the standard backend table for `device`.
    #[must_use]
    pub fn new(device: D) -> Self {
        let backends = BackendTable::for_caps(&device.caps());
        Self::with_backends(device, backends)
    }

    /// Creates a context with an explicit backend table.
    #[must_use]
    pub fn with_backends(device: D, backends: BackendTable) -> Self {
        Self {
            store: PipelineStore::new(),
            backends,
            caps: device.caps(),
            device,
            state: ValidationState::Unvalidated,
            current: None,
            units: Vec::new(),
            flush_index: 0,
        }
    }

    // -- Accessors --

    /// Returns the pipeline store.
    #[must_use]
    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    /// Returns the pipeline store mutably.
    pub fn store_mut(&mut self) -> &mut PipelineStore {
        &mut self.store
    }

    /// Returns the device.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Returns the device mutably.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Returns the backend table.
    #[must_use]
    pub fn backends(&self) -> &BackendTable {
        &self.backends
    }

    /// Returns the validation state.
    #[must_use]
    pub fn state(&self) -> ValidationState {
        self.state
    }

    /// Returns the pipeline committed by the last successful flush.
    #[must_use]
    pub fn current(&self) -> Option<PipelineId> {
        self.current
    }

    /// Returns the number of live pipelines, including the root.
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.store.live_count()
    }

    /// Returns the number of live layers, including the root.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.store.layers().live_count()
    }

    // -- Editing --

    /// Sets one group on `id` and returns the handle the caller should keep.
    ///
    /// Forks are reported to `tracer`.
    pub fn set_state(
        &mut self,
        id: PipelineId,
        value: PipelineValue,
        tracer: &mut Tracer<'_>,
    ) -> PipelineId {
        let mutation = self.store.mutate_or_fork(id, value);
        if let Mutation::Forked { from, to } = mutation {
            tracer.copy_on_write(&CopyOnWriteEvent {
                node: NodeKind::Pipeline,
                from: from.index(),
                to: to.index(),
            });
        }
        mutation.id()
    }

    /// Sets one group on the layer at `index` of `id`'s layer list.
    pub fn set_layer_state(
        &mut self,
        id: PipelineId,
        index: usize,
        value: LayerValue,
        tracer: &mut Tracer<'_>,
    ) -> PipelineId {
        let layer = self.store.layers_of(id).get(index).copied();
        let result = self.store.set_layer_state(id, index, value);
        if result != id {
            tracer.copy_on_write(&CopyOnWriteEvent {
                node: NodeKind::Pipeline,
                from: id.index(),
                to: result.index(),
            });
        }
        if let (Some(from), Some(&to)) = (layer, self.store.layers_of(result).get(index)) {
            if from != to {
                tracer.copy_on_write(&CopyOnWriteEvent {
                    node: NodeKind::Layer,
                    from: from.index(),
                    to: to.index(),
                });
            }
        }
        result
    }

    /// Forgets what is committed on the device; the next flush rebuilds
    /// every group.
    pub fn invalidate(&mut self) {
        self.state = ValidationState::Unvalidated;
    }

    /// Notes that the storage behind `texture` was reallocated. Units whose
    /// committed layer samples it are rebound by the next flush.
    pub fn texture_storage_changed(&mut self, texture: TextureHandle) {
        let layers = self.store.layers();
        for unit in &mut self.units {
            if let Some(layer) = unit.layer {
                if layers.texture(layer) == Some(texture) {
                    unit.changes |= LayerState::TEXTURE;
                }
            }
        }
    }

    /// Destroys device objects no node refers to anymore.
    pub fn collect_released(&mut self, tracer: &mut Tracer<'_>) {
        self.drain_changes();
        self.drain_released(tracer);
    }

    // -- Validation --

    /// Validates `pipeline` and commits its state for the next draw.
    ///
    /// # Errors
    ///
    /// [`ValidateError::Device`] when the device runs out of resources; the
    /// context is left [`Unvalidated`](ValidationState::Unvalidated) and the
    /// previously bound pipeline stays current.
    ///
    /// # Panics
    ///
    /// Panics if `pipeline` is stale.
    pub fn flush(
        &mut self,
        pipeline: PipelineId,
        tracer: &mut Tracer<'_>,
    ) -> Result<FlushOutcome, ValidateError> {
        self.drain_changes();
        self.drain_released(tracer);
        self.flush_index += 1;
        let flush_index = self.flush_index;

        let layers = self.store.layers_of(pipeline).to_vec();
        if self.state == ValidationState::Valid
            && self.current == Some(pipeline)
            && self.units.iter().all(|u| u.changes.is_empty())
        {
            tracer.flush_end(&FlushEndEvent {
                flush_index,
                result: FlushResult::Reused,
                backend: self.store.last_backend(pipeline).map(index_u32),
            });
            return Ok(FlushOutcome::Reused);
        }

        let known = self.state != ValidationState::Unvalidated;
        self.state = ValidationState::Validating;
        let (difference, steps) = match self.current {
            Some(bound) if known => self.store.compare_differences_counted(bound, pipeline),
            _ => (PipelineState::all(), 0),
        };
        let layer_diffs = self.layer_differences(&layers, known);

        tracer.flush_begin(&FlushBeginEvent {
            flush_index,
            pipeline: pipeline.index(),
            n_layers: index_u32(layers.len()),
            difference,
        });
        #[cfg(feature = "trace-rich")]
        {
            tracer.diff(&DiffEvent {
                flush_index,
                steps,
                difference,
            });
            let diffs: Vec<_> = layer_diffs
                .iter()
                .enumerate()
                .map(|(unit, &difference)| LayerDiff {
                    unit: index_u32(unit),
                    difference,
                })
                .collect();
            tracer.layer_diffs(flush_index, &diffs);
        }
        #[cfg(not(feature = "trace-rich"))]
        {
            _ = steps;
        }

        let last = self.backends.len().saturating_sub(1);
        let mut backend = self.store.last_backend(pipeline).unwrap_or(0).min(last);
        loop {
            match self.run_backend(backend, pipeline, &layers, difference, &layer_diffs, flush_index, tracer) {
                Ok(()) => break,
                Err(StageFailure {
                    error: StageError::Unsupported,
                    started,
                }) => {
                    self.abort_backend(backend, started);
                    if backend >= last {
                        self.state = ValidationState::Unvalidated;
                        self.drain_released(tracer);
                        Self::trace_failure(tracer, flush_index);
                        return Err(ValidateError::Unsupported);
                    }
                    tracer.backend_fallback(&BackendFallbackEvent {
                        flush_index,
                        from: index_u32(backend),
                        to: index_u32(backend + 1),
                    });
                    backend += 1;
                }
                Err(StageFailure {
                    error: StageError::Device(source),
                    started,
                }) => {
                    self.abort_backend(backend, started);
                    self.state = ValidationState::Unvalidated;
                    self.drain_released(tracer);
                    Self::trace_failure(tracer, flush_index);
                    return Err(ValidateError::Device { backend, source });
                }
            }
        }

        self.commit(pipeline, &layers, difference, &layer_diffs);
        self.store.set_last_backend(pipeline, backend);
        self.state = ValidationState::Valid;
        self.drain_released(tracer);
        tracer.flush_end(&FlushEndEvent {
            flush_index,
            result: FlushResult::Validated,
            backend: Some(index_u32(backend)),
        });
        Ok(FlushOutcome::Validated {
            backend,
            difference,
        })
    }

    fn trace_failure(tracer: &mut Tracer<'_>, flush_index: u64) {
        tracer.flush_end(&FlushEndEvent {
            flush_index,
            result: FlushResult::Failed,
            backend: None,
        });
    }

    /// Per-unit layer differences against what each unit last committed.
    fn layer_differences(&self, layers: &[LayerId], known: bool) -> Vec<LayerState> {
        let store = self.store.layers();
        layers
            .iter()
            .enumerate()
            .map(|(unit, &layer)| match self.units.get(unit) {
                Some(TextureUnit {
                    layer: Some(previous),
                    changes,
                }) if known => store.compare_differences(*previous, layer) | *changes,
                _ => LayerState::all(),
            })
            .collect()
    }

    fn run_backend(
        &mut self,
        backend: usize,
        pipeline: PipelineId,
        layers: &[LayerId],
        difference: PipelineState,
        layer_diffs: &[LayerState],
        flush_index: u64,
        tracer: &mut Tracer<'_>,
    ) -> Result<(), StageFailure> {
        let Self {
            store,
            backends,
            device,
            caps,
            current,
            ..
        } = self;
        let Some(entry) = backends.get_mut(backend) else {
            return Err(StageFailure {
                error: StageError::Unsupported,
                started: 0,
            });
        };
        let mut cx = StageContext {
            store,
            device,
            caps: *caps,
            backend,
            bound: *current,
        };
        for (started, kind) in (1..).zip(StageKind::ALL) {
            let result = run_stage(
                entry.stage_mut(kind),
                &mut cx,
                kind,
                pipeline,
                layers,
                difference,
                layer_diffs,
            );
            tracer.stage(&StageEvent {
                flush_index,
                backend: index_u32(backend),
                stage: kind,
                outcome: match result {
                    Ok(()) => StageOutcome::Accepted,
                    Err(StageError::Unsupported) => StageOutcome::Unsupported,
                    Err(StageError::Device(_)) => StageOutcome::DeviceError,
                },
            });
            result.map_err(|error| StageFailure { error, started })?;
        }
        Ok(())
    }

    /// Aborts the first `started` stages of `backend`. Later stages still
    /// hold what they built for the last committed flush.
    fn abort_backend(&mut self, backend: usize, started: usize) {
        let Self {
            store,
            backends,
            device,
            caps,
            current,
            ..
        } = self;
        let Some(entry) = backends.get_mut(backend) else {
            return;
        };
        let mut cx = StageContext {
            store,
            device,
            caps: *caps,
            backend,
            bound: *current,
        };
        for kind in StageKind::ALL.into_iter().take(started) {
            entry.stage_mut(kind).abort(&mut cx);
        }
    }

    /// Commits fixed-function and per-unit state and takes over the
    /// references that keep them alive.
    fn commit(
        &mut self,
        pipeline: PipelineId,
        layers: &[LayerId],
        difference: PipelineState,
        layer_diffs: &[LayerState],
    ) {
        let flush_state = self.store.flush_state(pipeline);
        self.device.flush_common_state(&flush_state, difference);
        for (unit, (&layer, &changed)) in layers.iter().zip(layer_diffs).enumerate() {
            if !changed.is_empty() {
                let resolved = self.store.layers().resolved(layer);
                self.device.bind_layer(unit, &resolved, changed);
            }
        }

        let root = self.store.root();
        if pipeline != root {
            self.store.retain(pipeline);
        }
        if let Some(previous) = self.current.replace(pipeline) {
            if previous != root {
                self.store.release(previous);
            }
        }

        let layer_store = self.store.layers_mut();
        for &layer in layers {
            layer_store.retain_listed(layer);
        }
        for unit in self.units.drain(..) {
            if let Some(layer) = unit.layer {
                layer_store.release_listed(layer);
            }
        }
        self.units.extend(layers.iter().map(|&layer| TextureUnit {
            layer: Some(layer),
            changes: LayerState::empty(),
        }));
    }

    // -- Deferred work --

    /// Offers every in-place edit to the stages that may have cached objects
    /// on the edited node, and detaches the stale ones.
    fn drain_changes(&mut self) {
        for (id, change) in self.store.take_pending_changes() {
            if !self.store.is_alive(id) {
                continue;
            }
            for (index, backend) in self.backends.iter().enumerate() {
                for kind in StageKind::ALL {
                    if backend.stage(kind).pipeline_change_notify(change) {
                        self.store.detach_private(id, StageSlot::new(index, kind));
                    }
                }
            }
        }

        let layer_changes = self.store.layers_mut().take_pending_changes();
        for (id, change) in layer_changes {
            for unit in &mut self.units {
                if unit.layer == Some(id) {
                    unit.changes |= change;
                }
            }
            let layers = self.store.layers_mut();
            if !layers.is_alive(id) {
                continue;
            }
            for (index, backend) in self.backends.iter().enumerate() {
                for kind in StageKind::ALL {
                    if backend.stage(kind).layer_change_notify(change) {
                        layers.detach_private(id, StageSlot::new(index, kind));
                    }
                }
            }
        }
    }

    /// Destroys detached objects whose last holder is gone.
    fn drain_released(&mut self, tracer: &mut Tracer<'_>) {
        for ReleasedPrivate { slot, object } in self.store.take_released() {
            let Ok(object) = Rc::try_unwrap(object) else {
                continue;
            };
            let Some(backend) = self.backends.get_mut(slot.backend) else {
                continue;
            };
            backend
                .stage_mut(slot.stage)
                .release_private(&mut self.device, object);
            tracer.private_released(&PrivateReleasedEvent {
                backend: index_u32(slot.backend),
                stage: slot.stage,
                object,
            });
        }
    }
}

/// A stage error plus how many stages had started when it happened.
struct StageFailure {
    error: StageError,
    started: usize,
}

fn run_stage(
    stage: &mut dyn PipelineStage,
    cx: &mut StageContext<'_>,
    kind: StageKind,
    pipeline: PipelineId,
    layers: &[LayerId],
    difference: PipelineState,
    layer_diffs: &[LayerState],
) -> Result<(), StageError> {
    stage.start(cx, pipeline, layers.len(), difference)?;
    for (unit, (&layer, &changed)) in layers.iter().zip(layer_diffs).enumerate() {
        stage.add_layer(cx, pipeline, layer, unit, changed)?;
    }
    if kind == StageKind::Fragment && layers.is_empty() {
        stage.passthrough(cx, pipeline)?;
    }
    stage.end(cx, pipeline, difference)
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec;

    use super::*;
    use crate::backend::{Backend, BackendKind, nop};
    use crate::device::ShaderStage;
    use crate::headless::{DeviceCall, RecordingDevice};
    use crate::state::{AlphaFuncState, CompareFunc, DepthState};

    /// Accepts pipelines with at most `max_layers` layers.
    struct LayerLimit {
        max_layers: usize,
    }

    impl PipelineStage for LayerLimit {
        fn start(
            &mut self,
            _cx: &mut StageContext<'_>,
            _pipeline: PipelineId,
            n_layers: usize,
            _difference: PipelineState,
        ) -> Result<(), StageError> {
            if n_layers > self.max_layers {
                Err(StageError::Unsupported)
            } else {
                Ok(())
            }
        }

        fn end(
            &mut self,
            _cx: &mut StageContext<'_>,
            _pipeline: PipelineId,
            _difference: PipelineState,
        ) -> Result<(), StageError> {
            Ok(())
        }
    }

    fn limited(max_layers: usize) -> Backend {
        Backend::new(
            "limit",
            BackendKind::Custom,
            Box::new(LayerLimit { max_layers }),
            Box::new(nop::NopStage),
            Box::new(nop::NopStage),
        )
    }

    fn programmable() -> Context<RecordingDevice> {
        Context::new(RecordingDevice::new(DeviceCaps::programmable(4)))
    }

    fn with_layers(cx: &mut Context<RecordingDevice>, n: usize) -> PipelineId {
        let store = cx.store_mut();
        let mut p = store.new_pipeline();
        for _ in 0..n {
            let layer = store.layers_mut().new_layer();
            p = store.add_layer(p, layer);
            store.layers_mut().release(layer);
        }
        p
    }

    fn count(device: &RecordingDevice, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        device.calls().iter().filter(|c| pred(c)).count()
    }

    fn compiles(device: &RecordingDevice) -> usize {
        count(device, |c| matches!(c, DeviceCall::CompileShader { .. }))
    }

    #[test]
    fn too_many_layers_falls_back_to_next_backend() {
        let table = BackendTable::new(vec![limited(2)]);
        let mut cx = Context::with_backends(RecordingDevice::new(DeviceCaps::headless()), table);
        let small = with_layers(&mut cx, 2);
        let large = with_layers(&mut cx, 3);

        let outcome = cx.flush(small, &mut Tracer::none()).unwrap();
        assert!(matches!(outcome, FlushOutcome::Validated { backend: 0, .. }));
        let outcome = cx.flush(large, &mut Tracer::none()).unwrap();
        assert!(matches!(outcome, FlushOutcome::Validated { backend: 1, .. }));
        assert_eq!(cx.store().last_backend(large), Some(1));
        assert_eq!(cx.store().last_backend(small), Some(0));
    }

    #[test]
    fn nop_backend_is_the_last_resort() {
        let table = BackendTable::new(vec![limited(0), limited(0)]);
        let mut cx = Context::with_backends(RecordingDevice::new(DeviceCaps::headless()), table);
        assert_eq!(cx.backends().len(), 3);
        let p = with_layers(&mut cx, 1);
        let outcome = cx.flush(p, &mut Tracer::none()).unwrap();
        assert!(matches!(outcome, FlushOutcome::Validated { backend: 2, .. }));
        assert_eq!(cx.state(), ValidationState::Valid);
    }

    #[test]
    fn program_backend_rejects_past_unit_count() {
        let mut cx = Context::new(RecordingDevice::new(DeviceCaps::programmable(2)));
        let p = with_layers(&mut cx, 3);
        let outcome = cx.flush(p, &mut Tracer::none()).unwrap();
        assert!(matches!(outcome, FlushOutcome::Validated { backend: 1, .. }));
        assert_eq!(compiles(cx.device()), 0);
    }

    #[test]
    fn first_flush_commits_everything() {
        let mut cx = programmable();
        let p = with_layers(&mut cx, 1);
        let outcome = cx.flush(p, &mut Tracer::none()).unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Validated {
                backend: 0,
                difference: PipelineState::all(),
            }
        );
        assert_eq!(cx.current(), Some(p));
        assert_eq!(cx.store().ref_count(p), 2);
        let device = cx.device();
        assert_eq!(compiles(device), 2);
        assert_eq!(
            count(device, |c| matches!(c, DeviceCall::BindLayer { unit: 0, .. })),
            1
        );
        assert!(device.bound_program().is_some());
    }

    #[test]
    fn unchanged_pipeline_is_reused() {
        let mut cx = programmable();
        let p = with_layers(&mut cx, 1);
        cx.flush(p, &mut Tracer::none()).unwrap();
        let calls = cx.device().calls().len();
        assert_eq!(cx.flush(p, &mut Tracer::none()), Ok(FlushOutcome::Reused));
        assert_eq!(cx.device().calls().len(), calls);
    }

    #[test]
    fn switching_commits_only_the_difference() {
        let mut cx = programmable();
        let p1 = cx.store_mut().new_pipeline();
        let p2 = cx.store_mut().derive(p1);
        let p2 = cx.set_state(
            p2,
            PipelineValue::Depth(DepthState {
                test_enabled: true,
                ..DepthState::default()
            }),
            &mut Tracer::none(),
        );
        cx.flush(p1, &mut Tracer::none()).unwrap();
        let outcome = cx.flush(p2, &mut Tracer::none()).unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Validated {
                backend: 0,
                difference: PipelineState::DEPTH,
            }
        );
        assert_eq!(
            cx.device().calls().last(),
            Some(&DeviceCall::FlushCommonState {
                difference: PipelineState::DEPTH,
                blending: false,
            })
        );
        // Depth is bind-time state: no new program and no rebind.
        assert_eq!(compiles(cx.device()), 2);
        assert_eq!(count(cx.device(), |c| matches!(c, DeviceCall::UseProgram(_))), 1);
    }

    #[test]
    fn reordered_layers_rebind_both_units() {
        let mut cx = programmable();
        let store = cx.store_mut();
        let l1 = store.layers_mut().new_layer();
        let l1 = store.layers_mut().set_state(l1, LayerValue::Texture(Some(TextureHandle(1))));
        let l2 = store.layers_mut().new_layer();
        let l2 = store.layers_mut().set_state(l2, LayerValue::Texture(Some(TextureHandle(2))));
        let a = store.new_pipeline();
        let a = store.set_layers(a, &[l1, l2]);
        let b = store.new_pipeline();
        let b = store.set_layers(b, &[l2, l1]);

        cx.flush(a, &mut Tracer::none()).unwrap();
        cx.device_mut().take_calls();
        let outcome = cx.flush(b, &mut Tracer::none()).unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Validated {
                backend: 0,
                difference: PipelineState::LAYERS,
            }
        );
        let binds: Vec<_> = cx
            .device()
            .calls()
            .iter()
            .filter_map(|c| match c {
                DeviceCall::BindLayer {
                    unit,
                    texture,
                    difference,
                } => Some((*unit, *texture, *difference)),
                _ => None,
            })
            .collect();
        assert_eq!(
            binds,
            [
                (0, Some(TextureHandle(2)), LayerState::TEXTURE),
                (1, Some(TextureHandle(1)), LayerState::TEXTURE),
            ]
        );
    }

    #[test]
    fn device_error_leaves_nothing_bound() {
        let mut cx = programmable();
        cx.device_mut().fail_allocations_after(2);
        let p = with_layers(&mut cx, 1);

        let err = cx.flush(p, &mut Tracer::none()).unwrap_err();
        assert_eq!(
            err,
            ValidateError::Device {
                backend: 0,
                source: DeviceError::OutOfMemory,
            }
        );
        assert_eq!(cx.state(), ValidationState::Unvalidated);
        assert_eq!(cx.current(), None);
        assert_eq!(cx.store().last_backend(p), None);
        assert_eq!(cx.store().ref_count(p), 1);
        let device = cx.device();
        assert_eq!(device.live_objects(), 0);
        assert_eq!(device.bound_program(), None);
        assert_eq!(
            count(device, |c| matches!(c, DeviceCall::FlushCommonState { .. })),
            0
        );

        cx.device_mut().clear_allocation_limit();
        let outcome = cx.flush(p, &mut Tracer::none()).unwrap();
        assert!(matches!(outcome, FlushOutcome::Validated { backend: 0, .. }));
        assert_eq!(cx.device().live_objects(), 3);
    }

    #[test]
    fn device_error_keeps_the_committed_objects() {
        let mut cx = programmable();
        let first = with_layers(&mut cx, 1);
        let second = with_layers(&mut cx, 2);
        cx.flush(first, &mut Tracer::none()).unwrap();
        let program = cx.device().bound_program();
        assert!(program.is_some());

        // The vertex shader builds, the fragment shader does not.
        cx.device_mut().fail_allocations_after(1);
        let err = cx.flush(second, &mut Tracer::none()).unwrap_err();
        assert!(matches!(err, ValidateError::Device { backend: 0, .. }));
        assert_eq!(cx.device().live_objects(), 3);
        assert_eq!(cx.device().bound_program(), program);
        for kind in StageKind::ALL {
            assert!(cx.store().private(first, StageSlot::new(0, kind)).is_some());
            assert!(cx.store().private(second, StageSlot::new(0, kind)).is_none());
        }

        cx.device_mut().clear_allocation_limit();
        cx.flush(first, &mut Tracer::none()).unwrap();
        assert_eq!(compiles(cx.device()), 3);
        assert_eq!(cx.device().bound_program(), program);
    }

    #[test]
    fn fallback_keeps_the_committed_objects() {
        let mut cx = Context::new(RecordingDevice::new(DeviceCaps::programmable(1)));
        let plain = cx.store_mut().new_pipeline();
        let layered = with_layers(&mut cx, 2);
        cx.flush(plain, &mut Tracer::none()).unwrap();
        assert_eq!(compiles(cx.device()), 2);

        let outcome = cx.flush(layered, &mut Tracer::none()).unwrap();
        assert!(matches!(outcome, FlushOutcome::Validated { backend: 1, .. }));
        for kind in StageKind::ALL {
            assert!(cx.store().private(plain, StageSlot::new(0, kind)).is_some());
        }
        assert_eq!(cx.device().live_objects(), 3);

        let outcome = cx.flush(plain, &mut Tracer::none()).unwrap();
        assert!(matches!(outcome, FlushOutcome::Validated { backend: 0, .. }));
        assert_eq!(compiles(cx.device()), 2);
        assert_eq!(
            count(cx.device(), |c| matches!(c, DeviceCall::LinkProgram { .. })),
            1
        );
    }

    #[test]
    fn root_layer_in_a_list_is_never_counted() {
        let mut cx = programmable();
        let store = cx.store_mut();
        let root_layer = store.layers().root();
        let p = store.new_pipeline();
        let p = store.add_layer(p, root_layer);
        cx.flush(p, &mut Tracer::none()).unwrap();

        let q = cx.store_mut().new_pipeline();
        cx.flush(q, &mut Tracer::none()).unwrap();
        cx.store_mut().release(p);
        cx.collect_released(&mut Tracer::none());
        assert_eq!(cx.pipeline_count(), 2);
        assert_eq!(cx.layer_count(), 1);
    }

    #[test]
    fn siblings_share_a_program() {
        let mut cx = programmable();
        let base = with_layers(&mut cx, 1);
        let store = cx.store_mut();
        let a = store.derive(base);
        let a = store.set_state(a, PipelineValue::Color(crate::state::Color::BLACK));
        let b = store.derive(base);
        let b = store.set_state(b, PipelineValue::Color(crate::state::Color::TRANSPARENT));

        cx.flush(a, &mut Tracer::none()).unwrap();
        let outcome = cx.flush(b, &mut Tracer::none()).unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Validated {
                backend: 0,
                difference: PipelineState::COLOR,
            }
        );
        let device = cx.device();
        assert_eq!(compiles(device), 2);
        assert_eq!(count(device, |c| matches!(c, DeviceCall::LinkProgram { .. })), 1);
        assert_eq!(count(device, |c| matches!(c, DeviceCall::UseProgram(_))), 1);
    }

    #[test]
    fn in_place_edit_drops_stale_objects() {
        let mut cx = programmable();
        let q = cx.store_mut().new_pipeline();
        let other = cx.store_mut().new_pipeline();
        cx.flush(q, &mut Tracer::none()).unwrap();
        cx.flush(other, &mut Tracer::none()).unwrap();
        assert_eq!(cx.store().uniqueness(q), crate::pipeline::Uniqueness::Unique);

        let q = cx.set_state(
            q,
            PipelineValue::AlphaFunc(AlphaFuncState {
                func: CompareFunc::Greater,
                reference: 0.5,
            }),
            &mut Tracer::none(),
        );
        cx.flush(q, &mut Tracer::none()).unwrap();

        let device = cx.device();
        assert_eq!(compiles(device), 3);
        assert_eq!(count(device, |c| matches!(c, DeviceCall::LinkProgram { .. })), 2);
        let last_fragment = device
            .shader_descs()
            .filter(|d| d.stage == ShaderStage::Fragment)
            .last()
            .map(|d| d.alpha_test);
        assert_eq!(last_fragment, Some(Some(CompareFunc::Greater)));
    }

    #[test]
    fn released_pipelines_free_their_objects() {
        let mut cx = programmable();
        let a = with_layers(&mut cx, 1);
        let b = with_layers(&mut cx, 2);
        cx.flush(a, &mut Tracer::none()).unwrap();
        cx.flush(b, &mut Tracer::none()).unwrap();
        assert_eq!(cx.device().live_objects(), 6);

        cx.store_mut().release(a);
        cx.collect_released(&mut Tracer::none());
        assert_eq!(cx.device().live_objects(), 3);
        assert_eq!(cx.pipeline_count(), 2);
        assert_eq!(cx.layer_count(), 3);
    }

    #[test]
    fn texture_storage_change_rebinds_unit() {
        let mut cx = programmable();
        let store = cx.store_mut();
        let layer = store.layers_mut().new_layer();
        let layer = store
            .layers_mut()
            .set_state(layer, LayerValue::Texture(Some(TextureHandle(7))));
        let p = store.new_pipeline();
        let p = store.add_layer(p, layer);

        cx.flush(p, &mut Tracer::none()).unwrap();
        assert_eq!(cx.flush(p, &mut Tracer::none()), Ok(FlushOutcome::Reused));

        cx.texture_storage_changed(TextureHandle(9));
        assert_eq!(cx.flush(p, &mut Tracer::none()), Ok(FlushOutcome::Reused));

        cx.texture_storage_changed(TextureHandle(7));
        let outcome = cx.flush(p, &mut Tracer::none()).unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Validated {
                backend: 0,
                difference: PipelineState::empty(),
            }
        );
        assert_eq!(
            cx.device().calls().last(),
            Some(&DeviceCall::BindLayer {
                unit: 0,
                texture: Some(TextureHandle(7)),
                difference: LayerState::TEXTURE,
            })
        );
        assert_eq!(cx.flush(p, &mut Tracer::none()), Ok(FlushOutcome::Reused));
    }

    #[test]
    fn invalidate_forces_full_difference() {
        let mut cx = programmable();
        let p = with_layers(&mut cx, 1);
        cx.flush(p, &mut Tracer::none()).unwrap();
        cx.invalidate();
        assert_eq!(cx.state(), ValidationState::Unvalidated);
        let outcome = cx.flush(p, &mut Tracer::none()).unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Validated {
                backend: 0,
                difference: PipelineState::all(),
            }
        );
        // The program object is reused, but bound again.
        assert_eq!(compiles(cx.device()), 2);
        assert_eq!(count(cx.device(), |c| matches!(c, DeviceCall::UseProgram(_))), 2);
    }

    #[test]
    fn editing_the_bound_pipeline_forks() {
        let mut cx = programmable();
        let p = cx.store_mut().new_pipeline();
        cx.flush(p, &mut Tracer::none()).unwrap();
        let edited = cx.set_state(
            p,
            PipelineValue::PointSize(2.0),
            &mut Tracer::none(),
        );
        assert_ne!(edited, p);
        assert_eq!(cx.store().point_size(p), 0.0);
        assert_eq!(cx.store().point_size(edited), 2.0);
        assert_eq!(cx.flush(p, &mut Tracer::none()), Ok(FlushOutcome::Reused));
    }

    #[cfg(feature = "trace")]
    #[test]
    fn trace_reports_fallback_and_forks() {
        use crate::trace::TraceSink;

        #[derive(Default)]
        struct Sink {
            fallbacks: Vec<(u32, u32)>,
            forks: Vec<NodeKind>,
            ends: Vec<FlushResult>,
        }
        impl TraceSink for Sink {
            fn on_backend_fallback(&mut self, e: &BackendFallbackEvent) {
                self.fallbacks.push((e.from, e.to));
            }
            fn on_copy_on_write(&mut self, e: &CopyOnWriteEvent) {
                self.forks.push(e.node);
            }
            fn on_flush_end(&mut self, e: &FlushEndEvent) {
                self.ends.push(e.result);
            }
        }

        let table = BackendTable::new(vec![limited(0)]);
        let mut cx = Context::with_backends(RecordingDevice::new(DeviceCaps::headless()), table);
        let p = with_layers(&mut cx, 1);
        let mut sink = Sink::default();
        let mut tracer = Tracer::new(&mut sink);
        cx.flush(p, &mut tracer).unwrap();
        cx.flush(p, &mut tracer).unwrap();
        cx.set_state(p, PipelineValue::PointSize(3.0), &mut tracer);
        drop(tracer);

        assert_eq!(sink.fallbacks, [(0, 1)]);
        assert_eq!(sink.forks, [NodeKind::Pipeline]);
        assert_eq!(sink.ends, [FlushResult::Validated, FlushResult::Reused]);
    }
}
