// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Layer nodes: per-texture-unit state.
//!
//! Layers follow the same copy-on-write tree pattern as pipelines. A layer
//! is shared, not copied, when a pipeline is derived, and two unrelated
//! pipelines may list the same layer. Editing a layer that anything else
//! references forks it instead.

use alloc::rc::Rc;
use alloc::vec::Vec;

use kurbo::Affine;

use crate::backend::StageSlot;
use crate::device::DeviceObject;
use crate::id::{LayerId, TextureHandle};
use crate::node::{NodeValue, ROOT, ReleasedPrivate, Tree};
use crate::pipeline::{Mutation, Uniqueness};
use crate::state::{
    Color, CombineFunc, CombineState, LayerState, LayerValue, SamplerState, TextureType,
};

impl NodeValue for LayerValue {
    fn group_bit(&self) -> u32 {
        self.group().bits()
    }
}

macro_rules! resolved {
    ($store:expr, $id:expr, $group:ident, $variant:ident) => {
        match $store.resolve($id, LayerState::$group) {
            LayerValue::$variant(value) => value,
            other => unreachable!("{:?} resolved to {other:?}", LayerState::$group),
        }
    };
}

/// Fully resolved state of one layer, as committed to a texture unit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedLayer {
    /// Texture target type.
    pub texture_type: TextureType,
    /// Bound texture, if any.
    pub texture: Option<TextureHandle>,
    /// Filtering and wrap modes.
    pub sampler: SamplerState,
    /// Combine functions.
    pub combine: CombineState,
    /// Combine constant.
    pub combine_constant: Color,
    /// Texture-coordinate transform.
    pub matrix: Affine,
    /// Whether point sprites generate the coordinates.
    pub point_sprite_coords: bool,
}

/// Storage for every layer node.
#[derive(Debug)]
pub struct LayerStore {
    pub(crate) tree: Tree<LayerValue>,
    pub(crate) pending_changes: Vec<(LayerId, LayerState)>,
}

impl Default for LayerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerStore {
    /// Creates a store holding only the default root layer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: Tree::new("layer", LayerValue::defaults(), LayerState::all().bits()),
            pending_changes: Vec::new(),
        }
    }

    fn handle(&self, idx: u32) -> LayerId {
        LayerId {
            idx,
            generation: self.tree.generation[idx as usize],
        }
    }

    #[inline]
    fn validate(&self, id: LayerId) {
        self.tree.validate(id.idx, id.generation);
    }

    // -- Lifecycle --

    /// Returns the root layer, which holds the default value of every group.
    #[must_use]
    pub fn root(&self) -> LayerId {
        self.handle(ROOT)
    }

    /// Returns the number of live layers, including the root.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.tree.live as usize
    }

    /// Returns whether the handle refers to a live layer.
    #[must_use]
    pub fn is_alive(&self, id: LayerId) -> bool {
        self.tree.is_alive(id.idx, id.generation)
    }

    /// Creates a layer that inherits everything from `parent`.
    ///
    /// The caller owns the returned reference.
    pub fn derive(&mut self, parent: LayerId) -> LayerId {
        self.validate(parent);
        let idx = self.tree.alloc(parent.idx);
        self.handle(idx)
    }

    /// Creates a layer with default state.
    pub fn new_layer(&mut self) -> LayerId {
        self.derive(self.root())
    }

    /// Takes an additional reference to `id`.
    pub fn retain(&mut self, id: LayerId) {
        self.validate(id);
        self.tree.retain(id.idx);
    }

    /// Drops one reference to `id`, freeing it (and any ancestors it kept
    /// alive) when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale or names the root.
    pub fn release(&mut self, id: LayerId) {
        self.validate(id);
        assert!(id.idx != ROOT, "cannot release the root layer");
        self.tree.release(id.idx, |_| {});
    }

    /// Takes a reference on behalf of a layer list. The root is shared by
    /// every list and is never counted.
    pub(crate) fn retain_listed(&mut self, id: LayerId) {
        if id.idx != ROOT {
            self.retain(id);
        }
    }

    /// Drops a reference taken by [`retain_listed`](Self::retain_listed).
    pub(crate) fn release_listed(&mut self, id: LayerId) {
        if id.idx != ROOT {
            self.release(id);
        }
    }

    /// Returns the current strong reference count.
    #[must_use]
    pub fn ref_count(&self, id: LayerId) -> u32 {
        self.validate(id);
        self.tree.refs[id.idx as usize]
    }

    /// Returns the layer this one was derived from.
    #[must_use]
    pub fn parent(&self, id: LayerId) -> Option<LayerId> {
        self.validate(id);
        self.tree.parent_of(id.idx).map(|p| self.handle(p))
    }

    /// Returns the number of in-place mutations applied to `id`.
    #[must_use]
    pub fn age(&self, id: LayerId) -> u32 {
        self.validate(id);
        self.tree.age[id.idx as usize]
    }

    // -- Mutation --

    /// Reports whether [`mutate_or_fork`](Self::mutate_or_fork) would edit
    /// `id` in place.
    #[must_use]
    pub fn uniqueness(&self, id: LayerId) -> Uniqueness {
        self.validate(id);
        if self.tree.is_unique(id.idx) {
            Uniqueness::Unique
        } else {
            Uniqueness::Shared
        }
    }

    /// Sets one group on `id`, in place when the caller is the only owner,
    /// otherwise on a new layer derived from it.
    ///
    /// On the fork path the caller's reference to `id` is transferred to the
    /// new layer. The root is never edited; setting state on it returns a
    /// new layer.
    pub fn mutate_or_fork(&mut self, id: LayerId, value: LayerValue) -> Mutation<LayerId> {
        self.validate(id);
        let group = value.group();
        if self.tree.resolve(id.idx, group.bits()) == &value {
            return Mutation::Unchanged(id);
        }
        if self.tree.is_unique(id.idx) {
            self.tree.set_value(id.idx, value);
            self.pending_changes.push((id, group));
            return Mutation::InPlace(id);
        }
        let fork = self.derive(id);
        self.tree.set_value(fork.idx, value);
        if id.idx != ROOT {
            self.release(id);
        }
        Mutation::Forked { from: id, to: fork }
    }

    /// Sets one group and returns the handle the caller should keep.
    pub fn set_state(&mut self, id: LayerId, value: LayerValue) -> LayerId {
        self.mutate_or_fork(id, value).id()
    }

    // -- Resolution --

    /// Returns the effective value of `group` for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `group` is not exactly one group.
    #[must_use]
    pub fn resolve(&self, id: LayerId, group: LayerState) -> &LayerValue {
        self.validate(id);
        self.tree.resolve(id.idx, group.bits())
    }

    /// Returns the nearest layer (starting at `id`) that overrides `group`.
    #[must_use]
    pub fn authority(&self, id: LayerId, group: LayerState) -> LayerId {
        self.validate(id);
        self.handle(self.tree.authority(id.idx, group.bits()))
    }

    /// Returns the groups `id` itself overrides.
    #[must_use]
    pub fn differences(&self, id: LayerId) -> LayerState {
        self.validate(id);
        LayerState::from_bits_retain(self.tree.differences[id.idx as usize])
    }

    /// Returns the groups that may differ between two layers.
    #[must_use]
    pub fn compare_differences(&self, a: LayerId, b: LayerId) -> LayerState {
        self.compare_differences_counted(a, b).0
    }

    /// Like [`compare_differences`](Self::compare_differences), also
    /// returning how many ancestor nodes were visited.
    #[must_use]
    pub fn compare_differences_counted(&self, a: LayerId, b: LayerId) -> (LayerState, u32) {
        self.validate(a);
        self.validate(b);
        let (mask, steps) = self.tree.compare(a.idx, b.idx);
        (LayerState::from_bits_retain(mask), steps)
    }

    /// Returns whether `a` and `b` resolve to equal values for every group
    /// in `mask`.
    #[must_use]
    pub fn state_equal(&self, a: LayerId, b: LayerId, mask: LayerState) -> bool {
        a == b || mask.iter().all(|group| self.resolve(a, group) == self.resolve(b, group))
    }

    // -- Typed getters --

    /// Returns the texture target type.
    #[must_use]
    pub fn texture_type(&self, id: LayerId) -> TextureType {
        *resolved!(self, id, TEXTURE_TYPE, TextureType)
    }

    /// Returns the bound texture.
    #[must_use]
    pub fn texture(&self, id: LayerId) -> Option<TextureHandle> {
        *resolved!(self, id, TEXTURE, Texture)
    }

    /// Returns the sampler state.
    #[must_use]
    pub fn sampler(&self, id: LayerId) -> SamplerState {
        *resolved!(self, id, SAMPLER, Sampler)
    }

    /// Returns the combine functions.
    #[must_use]
    pub fn combine(&self, id: LayerId) -> CombineState {
        *resolved!(self, id, COMBINE, Combine)
    }

    /// Returns the combine constant.
    #[must_use]
    pub fn combine_constant(&self, id: LayerId) -> Color {
        *resolved!(self, id, COMBINE_CONSTANT, CombineConstant)
    }

    /// Returns the texture-coordinate transform.
    #[must_use]
    pub fn matrix(&self, id: LayerId) -> Affine {
        *resolved!(self, id, MATRIX, Matrix)
    }

    /// Returns whether point sprites generate the coordinates.
    #[must_use]
    pub fn point_sprite_coords(&self, id: LayerId) -> bool {
        *resolved!(self, id, POINT_SPRITE_COORDS, PointSpriteCoords)
    }

    /// Resolves every group of `id`.
    #[must_use]
    pub fn resolved(&self, id: LayerId) -> ResolvedLayer {
        ResolvedLayer {
            texture_type: self.texture_type(id),
            texture: self.texture(id),
            sampler: self.sampler(id),
            combine: self.combine(id),
            combine_constant: self.combine_constant(id),
            matrix: self.matrix(id),
            point_sprite_coords: self.point_sprite_coords(id),
        }
    }

    /// Returns whether this layer can lower the alpha of its input.
    ///
    /// Texture contents are opaque to the tree, so only the combine constant
    /// is considered.
    #[must_use]
    pub fn may_be_translucent(&self, id: LayerId) -> bool {
        let combine = self.combine(id);
        let uses_constant = combine.rgb == CombineFunc::Interpolate
            || combine.alpha == CombineFunc::Interpolate;
        uses_constant && !self.combine_constant(id).is_opaque()
    }

    // -- Backend-private data --

    /// Returns the object attached to `id` under `slot`.
    #[must_use]
    pub fn private(&self, id: LayerId, slot: StageSlot) -> Option<&Rc<DeviceObject>> {
        self.validate(id);
        self.tree.private(id.idx, slot)
    }

    /// Attaches `object` to `id` under `slot`, replacing any previous one.
    pub fn attach_private(&mut self, id: LayerId, slot: StageSlot, object: Rc<DeviceObject>) {
        self.validate(id);
        self.tree.attach_private(id.idx, slot, object);
    }

    /// Detaches the object under `slot`, returning whether one was attached.
    pub fn detach_private(&mut self, id: LayerId, slot: StageSlot) -> bool {
        self.validate(id);
        self.tree.detach_private(id.idx, slot)
    }

    pub(crate) fn take_released(&mut self) -> Vec<ReleasedPrivate> {
        self.tree.take_released()
    }

    pub(crate) fn take_pending_changes(&mut self) -> Vec<(LayerId, LayerState)> {
        core::mem::take(&mut self.pending_changes)
    }
}
