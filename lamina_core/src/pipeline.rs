// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pipeline nodes and the difference engine.
//!
//! A pipeline is a node in a copy-on-write tree. It stores only the groups it
//! overrides; everything else resolves through its ancestors up to the root,
//! which holds the defaults. The tree shape is what makes comparison cheap:
//! two pipelines can only differ in groups overridden somewhere between them
//! and their lowest common ancestor, so
//! [`compare_differences`](PipelineStore::compare_differences) never looks
//! above that ancestor.
//!
//! # Ownership
//!
//! Handles are counted references. [`derive`](PipelineStore::derive) and
//! [`new_pipeline`](PipelineStore::new_pipeline) hand the caller one
//! reference; [`release`](PipelineStore::release) drops it. A derived node
//! keeps its parent alive, and the node overriding
//! [`LAYERS`](PipelineState::LAYERS) keeps every listed layer alive.
//!
//! # Mutation
//!
//! [`mutate_or_fork`](PipelineStore::mutate_or_fork) is the single decision
//! point for edits. A node that only the caller references, and that nothing
//! was derived from, is edited in place. Anything else is left untouched and
//! the edit lands on a new child; the caller's reference moves to that child.
//! Either way no other node's resolved state changes.

use alloc::rc::Rc;
use alloc::vec::Vec;

use crate::backend::StageSlot;
use crate::device::DeviceObject;
use crate::id::{LayerId, PipelineId};
use crate::layer::LayerStore;
use crate::node::{NodeValue, ROOT, ReleasedPrivate, Tree};
use crate::state::{
    AlphaFuncState, BlendEnable, BlendState, Color, ColorMask, CullFaceState, DepthState,
    LayerState, LayerValue, PipelineState, PipelineValue, SnippetId,
};

impl NodeValue for PipelineValue {
    fn group_bit(&self) -> u32 {
        self.group().bits()
    }
}

macro_rules! resolved {
    ($store:expr, $id:expr, $group:ident, $variant:ident) => {
        match $store.resolve($id, PipelineState::$group) {
            PipelineValue::$variant(value) => value,
            other => unreachable!("{:?} resolved to {other:?}", PipelineState::$group),
        }
    };
}

/// Whether a node may be edited in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Uniqueness {
    /// The caller holds the only reference and nothing was derived from it.
    Unique,
    /// Another owner or a derived child could observe an in-place edit.
    Shared,
}

/// Outcome of a [`mutate_or_fork`](PipelineStore::mutate_or_fork) call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mutation<Id> {
    /// The node already resolved to the requested value.
    Unchanged(Id),
    /// The node was edited in place.
    InPlace(Id),
    /// The edit was applied to a new child of `from`; the caller's reference
    /// now belongs to `to`.
    Forked {
        /// Node the caller passed in.
        from: Id,
        /// New node carrying the edit.
        to: Id,
    },
}

impl<Id: Copy> Mutation<Id> {
    /// Returns the handle the caller should hold after the call.
    #[must_use]
    pub fn id(self) -> Id {
        match self {
            Self::Unchanged(id) | Self::InPlace(id) => id,
            Self::Forked { to, .. } => to,
        }
    }
}

/// Resolved pipeline-level state, as committed to the device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlushState {
    /// Constant color.
    pub color: Color,
    /// Whether blending is actually enabled after resolving
    /// [`BlendEnable::Automatic`].
    pub blending: bool,
    /// Blend configuration.
    pub blend: BlendState,
    /// Alpha test.
    pub alpha_func: AlphaFuncState,
    /// Depth test.
    pub depth: DepthState,
    /// Face culling.
    pub cull_face: CullFaceState,
    /// Color write mask.
    pub color_mask: ColorMask,
    /// Point size.
    pub point_size: f32,
}

/// Storage for every pipeline node, and the layers they reference.
#[derive(Debug)]
pub struct PipelineStore {
    pub(crate) tree: Tree<PipelineValue>,
    pub(crate) layers: LayerStore,
    pub(crate) last_backend: Vec<Option<usize>>,
    pub(crate) pending_changes: Vec<(PipelineId, PipelineState)>,
}

impl Default for PipelineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStore {
    /// Creates a store holding only the default root pipeline and root layer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: Tree::new(
                "pipeline",
                PipelineValue::defaults(),
                PipelineState::all().bits(),
            ),
            layers: LayerStore::new(),
            last_backend: alloc::vec![None],
            pending_changes: Vec::new(),
        }
    }

    fn handle(&self, idx: u32) -> PipelineId {
        PipelineId {
            idx,
            generation: self.tree.generation[idx as usize],
        }
    }

    #[inline]
    fn validate(&self, id: PipelineId) {
        self.tree.validate(id.idx, id.generation);
    }

    /// Returns the layer store.
    #[must_use]
    pub fn layers(&self) -> &LayerStore {
        &self.layers
    }

    /// Returns the layer store mutably.
    pub fn layers_mut(&mut self) -> &mut LayerStore {
        &mut self.layers
    }

    // -- Lifecycle --

    /// Returns the root pipeline, which holds the default value of every
    /// group.
    #[must_use]
    pub fn root(&self) -> PipelineId {
        self.handle(ROOT)
    }

    /// Returns the number of live pipelines, including the root.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.tree.live as usize
    }

    /// Returns whether the handle refers to a live pipeline.
    #[must_use]
    pub fn is_alive(&self, id: PipelineId) -> bool {
        self.tree.is_alive(id.idx, id.generation)
    }

    /// Creates a pipeline that inherits everything, layers included, from
    /// `parent`. O(1).
    ///
    /// The caller owns the returned reference.
    pub fn derive(&mut self, parent: PipelineId) -> PipelineId {
        self.validate(parent);
        let idx = self.tree.alloc(parent.idx);
        let i = idx as usize;
        if i < self.last_backend.len() {
            self.last_backend[i] = None;
        } else {
            self.last_backend.push(None);
        }
        self.handle(idx)
    }

    /// Creates a pipeline with default state.
    pub fn new_pipeline(&mut self) -> PipelineId {
        self.derive(self.root())
    }

    /// Takes an additional reference to `id`.
    pub fn retain(&mut self, id: PipelineId) {
        self.validate(id);
        self.tree.retain(id.idx);
    }

    /// Drops one reference to `id`.
    ///
    /// When the count reaches zero the node's layer references are dropped,
    /// its backend-private objects are queued for teardown, and its
    /// reference to the parent is dropped by the same rule.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale or names the root.
    pub fn release(&mut self, id: PipelineId) {
        self.validate(id);
        assert!(id.idx != ROOT, "cannot release the root pipeline");
        let layers = &mut self.layers;
        self.tree.release(id.idx, |values| {
            for value in values {
                if let PipelineValue::Layers(list) = value {
                    for layer in list {
                        layers.release_listed(layer);
                    }
                }
            }
        });
    }

    /// Returns the current strong reference count.
    #[must_use]
    pub fn ref_count(&self, id: PipelineId) -> u32 {
        self.validate(id);
        self.tree.refs[id.idx as usize]
    }

    /// Returns the pipeline this one was derived from.
    #[must_use]
    pub fn parent(&self, id: PipelineId) -> Option<PipelineId> {
        self.validate(id);
        self.tree.parent_of(id.idx).map(|p| self.handle(p))
    }

    /// Returns the number of in-place mutations applied to `id`.
    #[must_use]
    pub fn age(&self, id: PipelineId) -> u32 {
        self.validate(id);
        self.tree.age[id.idx as usize]
    }

    // -- Mutation --

    /// Reports whether [`mutate_or_fork`](Self::mutate_or_fork) would edit
    /// `id` in place.
    #[must_use]
    pub fn uniqueness(&self, id: PipelineId) -> Uniqueness {
        self.validate(id);
        if self.tree.is_unique(id.idx) {
            Uniqueness::Unique
        } else {
            Uniqueness::Shared
        }
    }

    /// Sets one group on `id`, in place when [`Uniqueness::Unique`],
    /// otherwise on a new child that takes over the caller's reference.
    ///
    /// The root is never edited; setting state on it returns a new pipeline.
    pub fn mutate_or_fork(&mut self, id: PipelineId, value: PipelineValue) -> Mutation<PipelineId> {
        self.validate(id);
        let group = value.group();
        if self.tree.resolve(id.idx, group.bits()) == &value {
            return Mutation::Unchanged(id);
        }
        if self.tree.is_unique(id.idx) {
            self.install(id.idx, value);
            self.note_in_place(id, group);
            return Mutation::InPlace(id);
        }
        let fork = self.derive(id);
        self.install(fork.idx, value);
        if id.idx != ROOT {
            self.release(id);
        }
        Mutation::Forked { from: id, to: fork }
    }

    /// Sets one group and returns the handle the caller should keep.
    pub fn set_state(&mut self, id: PipelineId, value: PipelineValue) -> PipelineId {
        self.mutate_or_fork(id, value).id()
    }

    fn install(&mut self, idx: u32, value: PipelineValue) {
        if let PipelineValue::Layers(list) = &value {
            for &layer in list {
                self.layers.retain_listed(layer);
            }
        }
        if let Some(PipelineValue::Layers(old)) = self.tree.set_value(idx, value) {
            for layer in old {
                self.layers.release_listed(layer);
            }
        }
    }

    fn note_in_place(&mut self, id: PipelineId, change: PipelineState) {
        self.last_backend[id.idx as usize] = None;
        self.pending_changes.push((id, change));
    }

    // -- Layers --

    /// Replaces the layer list.
    pub fn set_layers(&mut self, id: PipelineId, layers: &[LayerId]) -> PipelineId {
        self.set_state(id, PipelineValue::Layers(layers.to_vec()))
    }

    /// Appends `layer` as the next texture unit.
    pub fn add_layer(&mut self, id: PipelineId, layer: LayerId) -> PipelineId {
        let mut list = self.layers_of(id).to_vec();
        list.push(layer);
        self.set_state(id, PipelineValue::Layers(list))
    }

    /// Removes the layer at `index`; later layers shift down one unit.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn remove_layer(&mut self, id: PipelineId, index: usize) -> PipelineId {
        let mut list = self.layers_of(id).to_vec();
        assert!(index < list.len(), "layer index {index} out of range");
        list.remove(index);
        self.set_state(id, PipelineValue::Layers(list))
    }

    /// Replaces the layer at `index` with `layer`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn replace_layer(&mut self, id: PipelineId, index: usize, layer: LayerId) -> PipelineId {
        let mut list = self.layers_of(id).to_vec();
        assert!(index < list.len(), "layer index {index} out of range");
        list[index] = layer;
        self.set_state(id, PipelineValue::Layers(list))
    }

    /// Drops every layer past the first `n`.
    pub fn prune_to_n_layers(&mut self, id: PipelineId, n: usize) -> PipelineId {
        let list = self.layers_of(id);
        if list.len() <= n {
            return id;
        }
        let list = list[..n].to_vec();
        self.set_state(id, PipelineValue::Layers(list))
    }

    /// Sets one group on the layer at `index`.
    ///
    /// When the pipeline owns its layer list exclusively and the layer is
    /// referenced only by that list, the layer is edited in place. Otherwise
    /// the layer is forked and the fork replaces it in the pipeline's list,
    /// which itself follows the [`mutate_or_fork`](Self::mutate_or_fork)
    /// rules.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set_layer_state(&mut self, id: PipelineId, index: usize, value: LayerValue) -> PipelineId {
        let mut list = self.layers_of(id).to_vec();
        assert!(index < list.len(), "layer index {index} out of range");
        let layer = list[index];
        if self.layers.resolve(layer, value.group()) == &value {
            return id;
        }

        let owns_list = self.tree.authority(id.idx, PipelineState::LAYERS.bits()) == id.idx;
        if owns_list && self.tree.is_unique(id.idx) && self.layers.tree.is_unique(layer.idx) {
            self.layers.mutate_or_fork(layer, value);
            self.tree.age[id.idx as usize] = self.tree.age[id.idx as usize].wrapping_add(1);
            self.note_in_place(id, PipelineState::LAYERS);
            return id;
        }

        let fork = self.layers.derive(layer);
        self.layers.tree.set_value(fork.idx, value);
        list[index] = fork;
        let result = self.set_state(id, PipelineValue::Layers(list));
        self.layers.release(fork);
        result
    }

    // -- Resolution --

    /// Returns the effective value of `group` for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `group` is not exactly one group.
    #[must_use]
    pub fn resolve(&self, id: PipelineId, group: PipelineState) -> &PipelineValue {
        self.validate(id);
        self.tree.resolve(id.idx, group.bits())
    }

    /// Returns the nearest pipeline (starting at `id`) that overrides any
    /// group in `mask`.
    #[must_use]
    pub fn authority(&self, id: PipelineId, mask: PipelineState) -> PipelineId {
        self.validate(id);
        self.handle(self.tree.authority(id.idx, mask.bits()))
    }

    /// Returns the groups `id` itself overrides.
    #[must_use]
    pub fn differences(&self, id: PipelineId) -> PipelineState {
        self.validate(id);
        PipelineState::from_bits_retain(self.tree.differences[id.idx as usize])
    }

    /// Returns the constant color.
    #[must_use]
    pub fn color(&self, id: PipelineId) -> Color {
        *resolved!(self, id, COLOR, Color)
    }

    /// Returns the blend-enable policy.
    #[must_use]
    pub fn blend_enable(&self, id: PipelineId) -> BlendEnable {
        *resolved!(self, id, BLEND_ENABLE, BlendEnable)
    }

    /// Returns the ordered layer list.
    #[must_use]
    pub fn layers_of(&self, id: PipelineId) -> &[LayerId] {
        resolved!(self, id, LAYERS, Layers)
    }

    /// Returns the number of layers.
    #[must_use]
    pub fn n_layers(&self, id: PipelineId) -> usize {
        self.layers_of(id).len()
    }

    /// Returns the alpha test.
    #[must_use]
    pub fn alpha_func(&self, id: PipelineId) -> AlphaFuncState {
        *resolved!(self, id, ALPHA_FUNC, AlphaFunc)
    }

    /// Returns the blend configuration.
    #[must_use]
    pub fn blend(&self, id: PipelineId) -> BlendState {
        *resolved!(self, id, BLEND, Blend)
    }

    /// Returns the depth test.
    #[must_use]
    pub fn depth(&self, id: PipelineId) -> DepthState {
        *resolved!(self, id, DEPTH, Depth)
    }

    /// Returns the point size.
    #[must_use]
    pub fn point_size(&self, id: PipelineId) -> f32 {
        *resolved!(self, id, POINT_SIZE, PointSize)
    }

    /// Returns the face culling configuration.
    #[must_use]
    pub fn cull_face(&self, id: PipelineId) -> CullFaceState {
        *resolved!(self, id, CULL_FACE, CullFace)
    }

    /// Returns the color write mask.
    #[must_use]
    pub fn color_mask(&self, id: PipelineId) -> ColorMask {
        *resolved!(self, id, COLOR_MASK, ColorMask)
    }

    /// Returns the vertex hook snippets.
    #[must_use]
    pub fn vertex_snippets(&self, id: PipelineId) -> &[SnippetId] {
        resolved!(self, id, VERTEX_SNIPPETS, VertexSnippets)
    }

    /// Returns the fragment hook snippets.
    #[must_use]
    pub fn fragment_snippets(&self, id: PipelineId) -> &[SnippetId] {
        resolved!(self, id, FRAGMENT_SNIPPETS, FragmentSnippets)
    }

    /// Returns whether drawing with `id` needs blending enabled.
    ///
    /// [`BlendEnable::Automatic`] turns blending off when it cannot change
    /// the result: a replace blend, or source-over with nothing that could
    /// produce translucent output.
    #[must_use]
    pub fn needs_blending(&self, id: PipelineId) -> bool {
        match self.blend_enable(id) {
            BlendEnable::Enabled => true,
            BlendEnable::Disabled => false,
            BlendEnable::Automatic => {
                let blend = self.blend(id);
                if blend.is_replace() {
                    return false;
                }
                if !blend.is_source_over() {
                    return true;
                }
                // Snippets can write any alpha.
                !self.color(id).is_opaque()
                    || !self.fragment_snippets(id).is_empty()
                    || self
                        .layers_of(id)
                        .iter()
                        .any(|&layer| self.layers.may_be_translucent(layer))
            }
        }
    }

    /// Resolves the pipeline-level state committed by a flush.
    #[must_use]
    pub fn flush_state(&self, id: PipelineId) -> FlushState {
        FlushState {
            color: self.color(id),
            blending: self.needs_blending(id),
            blend: self.blend(id),
            alpha_func: self.alpha_func(id),
            depth: self.depth(id),
            cull_face: self.cull_face(id),
            color_mask: self.color_mask(id),
            point_size: self.point_size(id),
        }
    }

    // -- Difference engine --

    /// Returns the groups that may differ between `a` and `b`.
    ///
    /// Identical handles short-circuit to the empty set. Otherwise only the
    /// nodes strictly between each side and the lowest common ancestor are
    /// visited. The result is symmetric.
    #[must_use]
    pub fn compare_differences(&self, a: PipelineId, b: PipelineId) -> PipelineState {
        self.compare_differences_counted(a, b).0
    }

    /// Like [`compare_differences`](Self::compare_differences), also
    /// returning how many ancestor nodes were visited.
    #[must_use]
    pub fn compare_differences_counted(&self, a: PipelineId, b: PipelineId) -> (PipelineState, u32) {
        self.validate(a);
        self.validate(b);
        let (mask, steps) = self.tree.compare(a.idx, b.idx);
        (PipelineState::from_bits_retain(mask), steps)
    }

    /// Returns the oldest ancestor of `id` that resolves every group in
    /// `state` and every layer group in `layer_state` to the same values.
    ///
    /// Layers are compared by count and by their `layer_state` values, not
    /// by identity. Objects cached on the returned node can be reused by any
    /// pipeline that maps to it, which is how siblings differing only in
    /// unrelated state share compiled programs.
    #[must_use]
    pub fn find_equivalent_parent(
        &self,
        id: PipelineId,
        state: PipelineState,
        layer_state: LayerState,
    ) -> PipelineId {
        self.validate(id);
        let mask = (state | PipelineState::LAYERS).bits();
        let mut current = self.tree.authority(id.idx, mask);
        while let Some(parent) = self.tree.parent_of(current) {
            let candidate = self.tree.authority(parent, mask);
            if !self.state_equal(current, candidate, state, layer_state) {
                break;
            }
            current = candidate;
        }
        self.handle(current)
    }

    fn state_equal(&self, a: u32, b: u32, state: PipelineState, layer_state: LayerState) -> bool {
        let plain = state - PipelineState::LAYERS;
        if !plain
            .iter()
            .all(|group| self.tree.resolve(a, group.bits()) == self.tree.resolve(b, group.bits()))
        {
            return false;
        }
        let (PipelineValue::Layers(la), PipelineValue::Layers(lb)) = (
            self.tree.resolve(a, PipelineState::LAYERS.bits()),
            self.tree.resolve(b, PipelineState::LAYERS.bits()),
        ) else {
            unreachable!("LAYERS resolved to a non-layer value");
        };
        la.len() == lb.len()
            && la
                .iter()
                .zip(lb)
                .all(|(&x, &y)| self.layers.state_equal(x, y, layer_state))
    }

    // -- Backend-private data --

    /// Returns the object attached to `id` under `slot`.
    #[must_use]
    pub fn private(&self, id: PipelineId, slot: StageSlot) -> Option<&Rc<DeviceObject>> {
        self.validate(id);
        self.tree.private(id.idx, slot)
    }

    /// Attaches `object` to `id` under `slot`, replacing any previous one.
    pub fn attach_private(&mut self, id: PipelineId, slot: StageSlot, object: Rc<DeviceObject>) {
        self.validate(id);
        self.tree.attach_private(id.idx, slot, object);
    }

    /// Detaches the object under `slot`, returning whether one was attached.
    pub fn detach_private(&mut self, id: PipelineId, slot: StageSlot) -> bool {
        self.validate(id);
        self.tree.detach_private(id.idx, slot)
    }

    /// Returns the backend that last validated `id`, if any.
    #[must_use]
    pub fn last_backend(&self, id: PipelineId) -> Option<usize> {
        self.validate(id);
        self.last_backend[id.idx as usize]
    }

    pub(crate) fn set_last_backend(&mut self, id: PipelineId, backend: usize) {
        self.last_backend[id.idx as usize] = Some(backend);
    }

    pub(crate) fn take_pending_changes(&mut self) -> Vec<(PipelineId, PipelineState)> {
        core::mem::take(&mut self.pending_changes)
    }

    /// Drains objects detached from pipelines and layers.
    pub(crate) fn take_released(&mut self) -> Vec<ReleasedPrivate> {
        let mut released = self.tree.take_released();
        released.extend(self.layers.take_released());
        released
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::id::TextureHandle;
    use crate::state::{BlendFactor, CombineFunc, CombineState, CompareFunc, TextureType};

    fn depth_on() -> PipelineValue {
        PipelineValue::Depth(DepthState {
            test_enabled: true,
            ..DepthState::default()
        })
    }

    fn additive() -> PipelineValue {
        PipelineValue::Blend(BlendState {
            dst_rgb: BlendFactor::One,
            dst_alpha: BlendFactor::One,
            ..BlendState::default()
        })
    }

    #[test]
    fn diff_of_node_with_itself_is_empty_without_traversal() {
        let mut store = PipelineStore::new();
        let p = store.new_pipeline();
        let p = store.set_state(p, depth_on());
        let q = store.derive(p);
        assert_eq!(store.compare_differences_counted(q, q), (PipelineState::empty(), 0));
        let root = store.root();
        assert_eq!(store.compare_differences_counted(root, root), (PipelineState::empty(), 0));
    }

    #[test]
    fn diff_is_symmetric() {
        let mut store = PipelineStore::new();
        let base = store.new_pipeline();
        let a = store.derive(base);
        let a = store.set_state(a, PipelineValue::Color(Color::BLACK));
        let b = store.derive(base);
        let b = store.set_state(b, depth_on());
        let c = store.derive(b);
        let c = store.set_state(c, PipelineValue::PointSize(4.0));
        for (x, y) in [(a, b), (a, c), (b, c), (base, c), (store.root(), a)] {
            assert_eq!(store.compare_differences(x, y), store.compare_differences(y, x));
        }
        assert_eq!(
            store.compare_differences(a, c),
            PipelineState::COLOR | PipelineState::DEPTH | PipelineState::POINT_SIZE
        );
    }

    #[test]
    fn end_to_end_blend_then_depth() {
        let mut store = PipelineStore::new();
        let r = store.root();
        let p1 = store.derive(r);
        let p1 = store.set_state(p1, additive());
        let p2 = store.derive(p1);
        let p2 = store.set_state(p2, depth_on());
        assert_eq!(store.compare_differences(p1, p2), PipelineState::DEPTH);
        assert_eq!(
            store.compare_differences(r, p2),
            PipelineState::BLEND | PipelineState::DEPTH
        );
    }

    #[test]
    fn diff_cost_is_bounded_by_distance_to_common_ancestor() {
        let mut store = PipelineStore::new();
        let mut deep = store.new_pipeline();
        for i in 0..64 {
            let child = store.derive(deep);
            deep = store.set_state(child, PipelineValue::PointSize(i as f32));
        }
        let a = store.derive(deep);
        let a = store.set_state(a, PipelineValue::Color(Color::BLACK));
        let b = store.derive(deep);
        let b = store.set_state(b, depth_on());
        let (mask, steps) = store.compare_differences_counted(a, b);
        assert_eq!(mask, PipelineState::COLOR | PipelineState::DEPTH);
        assert_eq!(steps, 2);
    }

    #[test]
    fn resolve_returns_nearest_override() {
        let mut store = PipelineStore::new();
        let p1 = store.new_pipeline();
        let p1 = store.set_state(p1, PipelineValue::PointSize(2.0));
        let p2 = store.derive(p1);
        let p3 = store.derive(p2);
        let p3 = store.set_state(p3, PipelineValue::Color(Color::BLACK));
        assert_eq!(store.point_size(p3), 2.0);
        assert_eq!(store.color(p3), Color::BLACK);
        assert_eq!(store.color(p2), Color::WHITE);
        assert_eq!(store.depth(p3), DepthState::default());
        assert_eq!(store.authority(p3, PipelineState::POINT_SIZE), p1);
        assert_eq!(store.authority(p3, PipelineState::DEPTH), store.root());
    }

    #[test]
    fn copy_on_write_protects_children() {
        let mut store = PipelineStore::new();
        let p1 = store.new_pipeline();
        let p2 = store.derive(p1);
        assert_eq!(store.uniqueness(p1), Uniqueness::Shared);

        let m = store.mutate_or_fork(p1, PipelineValue::Color(Color::BLACK));
        let Mutation::Forked { from, to } = m else {
            panic!("expected a fork, got {m:?}");
        };
        assert_eq!(from, p1);
        assert_eq!(store.color(p2), Color::WHITE);
        assert_eq!(store.color(p1), Color::WHITE);
        assert_eq!(store.color(to), Color::BLACK);
        // `p1` is still alive through `p2`, but the caller no longer owns it.
        assert_eq!(store.ref_count(p1), 2);
        assert_eq!(store.parent(to), Some(p1));
    }

    #[test]
    fn unique_node_is_mutated_in_place() {
        let mut store = PipelineStore::new();
        let p = store.new_pipeline();
        assert_eq!(store.uniqueness(p), Uniqueness::Unique);
        let m = store.mutate_or_fork(p, depth_on());
        assert_eq!(m, Mutation::InPlace(p));
        assert_eq!(store.age(p), 1);
        assert_eq!(store.differences(p), PipelineState::DEPTH);
        assert_eq!(store.take_pending_changes(), [(p, PipelineState::DEPTH)]);
    }

    #[test]
    fn setting_resolved_value_changes_nothing() {
        let mut store = PipelineStore::new();
        let p = store.new_pipeline();
        let q = store.derive(p);
        let m = store.mutate_or_fork(q, PipelineValue::Color(Color::WHITE));
        assert_eq!(m, Mutation::Unchanged(q));
        assert_eq!(store.live_count(), 3);
    }

    #[test]
    fn root_is_never_mutated() {
        let mut store = PipelineStore::new();
        let root = store.root();
        let p = store.set_state(root, depth_on());
        assert_ne!(p, root);
        assert_eq!(store.depth(root), DepthState::default());
        assert_eq!(store.ref_count(root), 2);
    }

    #[test]
    fn layer_order_is_significant() {
        let mut store = PipelineStore::new();
        let l1 = store.layers_mut().new_layer();
        let l2 = store.layers_mut().new_layer();
        let base = store.new_pipeline();
        let a = store.derive(base);
        let a = store.set_layers(a, &[l1, l2]);
        let b = store.derive(base);
        let b = store.set_layers(b, &[l2, l1]);
        assert!(store.compare_differences(a, b).contains(PipelineState::LAYERS));
        assert_eq!(store.layers_of(a), [l1, l2]);
        assert_eq!(store.layers_of(b), [l2, l1]);
    }

    #[test]
    fn layers_are_shared_with_derived_pipelines() {
        let mut store = PipelineStore::new();
        let l = store.layers_mut().new_layer();
        let p = store.new_pipeline();
        let p = store.add_layer(p, l);
        let q = store.derive(p);
        assert_eq!(store.layers_of(q), [l]);
        // The caller's reference plus one held by `p`'s list.
        assert_eq!(store.layers().ref_count(l), 2);
    }

    #[test]
    fn release_drops_layer_references_and_parents() {
        let mut store = PipelineStore::new();
        let l = store.layers_mut().new_layer();
        let p = store.new_pipeline();
        let p = store.add_layer(p, l);
        store.layers_mut().release(l);
        let q = store.derive(p);
        store.release(p);
        assert!(store.is_alive(p));
        assert!(store.layers().is_alive(l));
        store.release(q);
        assert!(!store.is_alive(p));
        assert!(!store.layers().is_alive(l));
        assert_eq!(store.live_count(), 1);
        assert_eq!(store.layers().live_count(), 1);
    }

    #[test]
    fn in_place_layer_list_edit_releases_replaced_layers() {
        let mut store = PipelineStore::new();
        let l1 = store.layers_mut().new_layer();
        let l2 = store.layers_mut().new_layer();
        let p = store.new_pipeline();
        let p = store.set_layers(p, &[l1]);
        store.layers_mut().release(l1);
        let p = store.replace_layer(p, 0, l2);
        assert!(!store.layers().is_alive(l1));
        assert_eq!(store.layers_of(p), [l2]);
        let p = store.remove_layer(p, 0);
        assert_eq!(store.n_layers(p), 0);
        assert_eq!(store.layers().ref_count(l2), 1);
    }

    #[test]
    fn root_layer_can_be_listed() {
        let mut store = PipelineStore::new();
        let root_layer = store.layers().root();
        let p = store.new_pipeline();
        let p = store.add_layer(p, root_layer);
        assert_eq!(store.layers_of(p), [root_layer]);

        let l = store.layers_mut().new_layer();
        let p = store.replace_layer(p, 0, l);
        store.layers_mut().release(l);
        let p = store.set_layers(p, &[root_layer, root_layer]);
        assert!(!store.layers().is_alive(l));

        let child = store.derive(p);
        store.release(p);
        store.release(child);
        assert_eq!(store.live_count(), 1);
        assert_eq!(store.layers().live_count(), 1);
    }

    #[test]
    fn prune_keeps_leading_layers() {
        let mut store = PipelineStore::new();
        let ls: Vec<_> = (0..3).map(|_| store.layers_mut().new_layer()).collect();
        let p = store.new_pipeline();
        let p = store.set_layers(p, &ls);
        let p = store.prune_to_n_layers(p, 5);
        assert_eq!(store.n_layers(p), 3);
        let p = store.prune_to_n_layers(p, 1);
        assert_eq!(store.layers_of(p), [ls[0]]);
    }

    #[test]
    fn set_layer_state_forks_shared_layers() {
        let mut store = PipelineStore::new();
        let l = store.layers_mut().new_layer();
        let p = store.new_pipeline();
        let p = store.add_layer(p, l);
        let other = store.derive(p);

        let p2 = store.set_layer_state(p, 0, LayerValue::Texture(Some(TextureHandle(9))));
        assert_ne!(p2, p);
        let forked = store.layers_of(p2)[0];
        assert_ne!(forked, l);
        assert_eq!(store.layers().texture(forked), Some(TextureHandle(9)));
        assert_eq!(store.layers().texture(l), None);
        assert_eq!(store.layers_of(other), [l]);
        assert_eq!(store.layers().parent(forked), Some(l));
    }

    #[test]
    fn set_layer_state_edits_exclusive_layer_in_place() {
        let mut store = PipelineStore::new();
        let l = store.layers_mut().new_layer();
        let p = store.new_pipeline();
        let p = store.add_layer(p, l);
        store.layers_mut().release(l);
        let _ = store.take_pending_changes();

        let same = store.set_layer_state(p, 0, LayerValue::TextureType(TextureType::Tex3d));
        assert_eq!(same, p);
        assert_eq!(store.layers_of(p), [l]);
        assert_eq!(store.layers().texture_type(l), TextureType::Tex3d);
        assert_eq!(store.take_pending_changes(), [(p, PipelineState::LAYERS)]);
        assert_eq!(
            store.layers_mut().take_pending_changes(),
            [(l, LayerState::TEXTURE_TYPE)]
        );
    }

    #[test]
    fn equivalent_parent_skips_unrelated_overrides() {
        let mut store = PipelineStore::new();
        let base = store.new_pipeline();
        let base = store.set_state(
            base,
            PipelineValue::AlphaFunc(AlphaFuncState {
                func: CompareFunc::Greater,
                reference: 0.5,
            }),
        );
        let tinted = store.derive(base);
        let tinted = store.set_state(tinted, PipelineValue::Color(Color::BLACK));

        let codegen = PipelineState::ALPHA_FUNC | PipelineState::FRAGMENT_SNIPPETS;
        assert_eq!(
            store.find_equivalent_parent(tinted, codegen, LayerState::COMBINE),
            base
        );
        // Nothing in the mask differs from the root for a plain pipeline.
        let plain = store.new_pipeline();
        assert_eq!(
            store.find_equivalent_parent(plain, codegen, LayerState::COMBINE),
            store.root()
        );
    }

    #[test]
    fn equivalent_parent_compares_layers_by_state() {
        let mut store = PipelineStore::new();
        let l1 = store.layers_mut().new_layer();
        let l1 = store.layers_mut().set_state(l1, LayerValue::Texture(Some(TextureHandle(1))));
        let l2 = store.layers_mut().new_layer();
        let l2 = store.layers_mut().set_state(l2, LayerValue::Texture(Some(TextureHandle(2))));

        let base = store.new_pipeline();
        let base = store.set_layers(base, &[l1]);
        let swapped = store.derive(base);
        let swapped = store.set_layers(swapped, &[l2]);

        // Different textures, same codegen-relevant layer state.
        let found = store.find_equivalent_parent(swapped, PipelineState::LAYERS, LayerState::COMBINE);
        assert_eq!(found, base);
        // Comparing textures too stops at the pipeline itself.
        let found = store.find_equivalent_parent(swapped, PipelineState::LAYERS, LayerState::TEXTURE);
        assert_eq!(found, swapped);

        let modulate_add = store.derive(base);
        let modulate_add = store.set_layer_state(
            modulate_add,
            0,
            LayerValue::Combine(CombineState {
                rgb: CombineFunc::Add,
                alpha: CombineFunc::Modulate,
            }),
        );
        let found =
            store.find_equivalent_parent(modulate_add, PipelineState::LAYERS, LayerState::COMBINE);
        assert_eq!(found, modulate_add);
    }

    #[test]
    fn automatic_blending_follows_translucency() {
        let mut store = PipelineStore::new();
        let p = store.new_pipeline();
        assert!(!store.needs_blending(p));
        let p = store.set_state(p, PipelineValue::Color(Color::new(1.0, 1.0, 1.0, 0.5)));
        assert!(store.needs_blending(p));
        let p = store.set_state(p, PipelineValue::Blend(BlendState::REPLACE));
        assert!(!store.needs_blending(p));
        let p = store.set_state(p, PipelineValue::BlendEnable(BlendEnable::Enabled));
        assert!(store.needs_blending(p));

        let q = store.new_pipeline();
        let q = store.set_state(q, additive());
        assert!(store.needs_blending(q));
        let q = store.set_state(q, PipelineValue::BlendEnable(BlendEnable::Disabled));
        assert!(!store.needs_blending(q));
        assert!(!store.flush_state(q).blending);
    }

    #[test]
    fn snippets_resolve_in_order() {
        let mut store = PipelineStore::new();
        let p = store.new_pipeline();
        let p = store.set_state(
            p,
            PipelineValue::FragmentSnippets(vec![SnippetId(2), SnippetId(1)]),
        );
        assert_eq!(store.fragment_snippets(p), [SnippetId(2), SnippetId(1)]);
        assert!(store.vertex_snippets(p).is_empty());
        assert!(store.needs_blending(p));
    }

    #[test]
    #[should_panic(expected = "stale pipeline handle")]
    fn stale_pipeline_handle_panics() {
        let mut store = PipelineStore::new();
        let p = store.new_pipeline();
        store.release(p);
        let _ = store.color(p);
    }

    #[test]
    #[should_panic(expected = "cannot release the root pipeline")]
    fn releasing_root_pipeline_panics() {
        let mut store = PipelineStore::new();
        let root = store.root();
        store.release(root);
    }
}
