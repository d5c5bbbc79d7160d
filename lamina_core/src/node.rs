// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Struct-of-arrays node arena shared by pipelines and layers.
//!
//! Both trees have the same shape: each node has a counted reference to its
//! parent, a mask of the groups it overrides, the values for exactly those
//! groups, and any backend-private objects attached to it. The root overrides
//! every group, so resolution always terminates.
//!
//! Nodes are addressed by raw slot indices here. The typed stores on top
//! ([`PipelineStore`](crate::pipeline::PipelineStore),
//! [`LayerStore`](crate::layer::LayerStore)) wrap them in generational
//! handles and validate before every access.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::mem;

use crate::backend::StageSlot;
use crate::device::DeviceObject;
use crate::id::INVALID;

/// Slot index of the root node. The root is created with the tree and never
/// freed.
pub(crate) const ROOT: u32 = 0;

/// A value stored in a node, tagged with the bit of the group it belongs to.
pub(crate) trait NodeValue: Clone + PartialEq {
    fn group_bit(&self) -> u32;
}

/// A backend-private object detached from a node, waiting for teardown.
///
/// The object may still be shared with other nodes; teardown only happens
/// once the last [`Rc`] is gone.
#[derive(Debug)]
pub(crate) struct ReleasedPrivate {
    pub(crate) slot: StageSlot,
    pub(crate) object: Rc<DeviceObject>,
}

/// Struct-of-arrays storage for one tree of state nodes.
#[derive(Debug)]
pub(crate) struct Tree<V> {
    // -- Topology --
    pub(crate) parent: Vec<u32>,
    pub(crate) depth: Vec<u32>,
    pub(crate) children: Vec<u32>,

    // -- Ownership --
    pub(crate) refs: Vec<u32>,

    // -- State --
    pub(crate) differences: Vec<u32>,
    pub(crate) values: Vec<Vec<V>>,
    pub(crate) age: Vec<u32>,

    // -- Backend-private data --
    pub(crate) private: Vec<Vec<(StageSlot, Rc<DeviceObject>)>>,
    pub(crate) released: Vec<ReleasedPrivate>,

    // -- Allocation --
    pub(crate) generation: Vec<u32>,
    pub(crate) free_list: Vec<u32>,
    pub(crate) len: u32,
    pub(crate) live: u32,

    kind: &'static str,
}

impl<V: NodeValue> Tree<V> {
    /// Creates a tree whose root holds `defaults`.
    ///
    /// # Panics
    ///
    /// Panics if `defaults` does not cover every bit of `all` exactly once.
    pub(crate) fn new(kind: &'static str, mut defaults: Vec<V>, all: u32) -> Self {
        defaults.sort_by_key(V::group_bit);
        let mut mask = 0;
        for value in &defaults {
            let bit = value.group_bit();
            assert!(mask & bit == 0, "duplicate default for {kind} group {bit:#x}");
            mask |= bit;
        }
        assert!(mask == all, "root {kind} must override every state group");

        Self {
            parent: alloc::vec![INVALID],
            depth: alloc::vec![0],
            children: alloc::vec![0],
            refs: alloc::vec![1],
            differences: alloc::vec![all],
            values: alloc::vec![defaults],
            age: alloc::vec![0],
            private: alloc::vec![Vec::new()],
            released: Vec::new(),
            generation: alloc::vec![0],
            free_list: Vec::new(),
            len: 1,
            live: 1,
            kind,
        }
    }

    // -- Allocation --

    /// Allocates a child of `parent` with no own state and one reference.
    pub(crate) fn alloc(&mut self, parent: u32) -> u32 {
        let p = parent as usize;
        let depth = self.depth[p] + 1;
        self.refs[p] += 1;
        self.children[p] += 1;

        let idx = if let Some(idx) = self.free_list.pop() {
            let i = idx as usize;
            self.parent[i] = parent;
            self.depth[i] = depth;
            self.children[i] = 0;
            self.refs[i] = 1;
            self.differences[i] = 0;
            self.values[i].clear();
            self.age[i] = 0;
            self.private[i].clear();
            idx
        } else {
            let idx = self.len;
            self.len += 1;
            self.parent.push(parent);
            self.depth.push(depth);
            self.children.push(0);
            self.refs.push(1);
            self.differences.push(0);
            self.values.push(Vec::new());
            self.age.push(0);
            self.private.push(Vec::new());
            self.generation.push(0);
            idx
        };
        self.live += 1;
        idx
    }

    /// Returns whether `idx` names a live node of the given generation.
    pub(crate) fn is_alive(&self, idx: u32, generation: u32) -> bool {
        idx < self.len
            && self.generation[idx as usize] == generation
            && self.refs[idx as usize] > 0
    }

    /// Panics if the handle is stale.
    #[inline]
    pub(crate) fn validate(&self, idx: u32, generation: u32) {
        assert!(self.is_alive(idx, generation), "stale {} handle", self.kind);
    }

    pub(crate) fn retain(&mut self, idx: u32) {
        self.refs[idx as usize] += 1;
    }

    /// Drops one reference to `idx`. Nodes reaching zero are freed, which in
    /// turn drops their reference to the parent.
    ///
    /// `on_free` receives the own values of every freed node so the owner can
    /// release references held inside them.
    pub(crate) fn release(&mut self, mut idx: u32, mut on_free: impl FnMut(Vec<V>)) {
        loop {
            let i = idx as usize;
            assert!(self.refs[i] > 0, "{} reference count underflow", self.kind);
            self.refs[i] -= 1;
            if self.refs[i] > 0 {
                return;
            }
            assert!(idx != ROOT, "the root {} was released", self.kind);
            assert!(
                self.children[i] == 0,
                "{} freed while children still point at it",
                self.kind
            );

            let values = mem::take(&mut self.values[i]);
            for (slot, object) in self.private[i].drain(..) {
                self.released.push(ReleasedPrivate { slot, object });
            }
            let parent = self.parent[i];
            self.parent[i] = INVALID;
            self.differences[i] = 0;
            // Bump generation so old handles immediately fail validation.
            self.generation[i] += 1;
            self.free_list.push(idx);
            self.live -= 1;

            on_free(values);

            self.children[parent as usize] -= 1;
            idx = parent;
        }
    }

    /// A node may be mutated in place only when the caller holds the sole
    /// reference and nothing was derived from it.
    pub(crate) fn is_unique(&self, idx: u32) -> bool {
        idx != ROOT && self.refs[idx as usize] == 1 && self.children[idx as usize] == 0
    }

    pub(crate) fn parent_of(&self, idx: u32) -> Option<u32> {
        let p = self.parent[idx as usize];
        (p != INVALID).then_some(p)
    }

    // -- State --

    /// Stores `value` as an override on `idx`, returning the override it
    /// replaced, if any.
    pub(crate) fn set_value(&mut self, idx: u32, value: V) -> Option<V> {
        let i = idx as usize;
        let bit = value.group_bit();
        let values = &mut self.values[i];
        let prev = match values.binary_search_by_key(&bit, V::group_bit) {
            Ok(pos) => Some(mem::replace(&mut values[pos], value)),
            Err(pos) => {
                values.insert(pos, value);
                None
            }
        };
        self.differences[i] |= bit;
        self.age[i] = self.age[i].wrapping_add(1);
        prev
    }

    pub(crate) fn own_value(&self, idx: u32, bit: u32) -> Option<&V> {
        let values = &self.values[idx as usize];
        values
            .binary_search_by_key(&bit, V::group_bit)
            .ok()
            .map(|pos| &values[pos])
    }

    /// Returns the nearest node (starting at `idx`) overriding any group in
    /// `mask`.
    pub(crate) fn authority(&self, idx: u32, mask: u32) -> u32 {
        let mut i = idx;
        while self.differences[i as usize] & mask == 0 {
            i = self.parent[i as usize];
            assert!(i != INVALID, "root {} does not override every group", self.kind);
        }
        i
    }

    /// Returns the effective value of the single group `bit` at `idx`.
    pub(crate) fn resolve(&self, idx: u32, bit: u32) -> &V {
        assert!(
            bit.count_ones() == 1,
            "resolve expects exactly one {} state group",
            self.kind
        );
        let authority = self.authority(idx, bit);
        match self.own_value(authority, bit) {
            Some(value) => value,
            None => panic!(
                "{} differences mask disagrees with stored values",
                self.kind
            ),
        }
    }

    /// Returns the groups that may differ between `a` and `b`, and the number
    /// of nodes visited to find out.
    ///
    /// Both sides climb toward their lowest common ancestor: the deeper side
    /// first, then both in lockstep. Only nodes strictly below the ancestor
    /// contribute.
    pub(crate) fn compare(&self, a: u32, b: u32) -> (u32, u32) {
        if a == b {
            return (0, 0);
        }
        let mut mask = 0;
        let mut steps = 0;
        let (mut x, mut y) = (a, b);
        while self.depth[x as usize] > self.depth[y as usize] {
            mask |= self.differences[x as usize];
            x = self.parent[x as usize];
            steps += 1;
        }
        while self.depth[y as usize] > self.depth[x as usize] {
            mask |= self.differences[y as usize];
            y = self.parent[y as usize];
            steps += 1;
        }
        while x != y {
            mask |= self.differences[x as usize] | self.differences[y as usize];
            x = self.parent[x as usize];
            y = self.parent[y as usize];
            steps += 2;
        }
        (mask, steps)
    }

    // -- Backend-private data --

    pub(crate) fn private(&self, idx: u32, slot: StageSlot) -> Option<&Rc<DeviceObject>> {
        self.private[idx as usize]
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, object)| object)
    }

    /// Attaches `object` under `slot`, queueing any object it replaces.
    pub(crate) fn attach_private(&mut self, idx: u32, slot: StageSlot, object: Rc<DeviceObject>) {
        let entries = &mut self.private[idx as usize];
        if let Some(entry) = entries.iter_mut().find(|(s, _)| *s == slot) {
            let old = mem::replace(&mut entry.1, object);
            self.released.push(ReleasedPrivate { slot, object: old });
        } else {
            entries.push((slot, object));
        }
    }

    /// Detaches whatever is attached under `slot` and queues it for teardown.
    pub(crate) fn detach_private(&mut self, idx: u32, slot: StageSlot) -> bool {
        let entries = &mut self.private[idx as usize];
        let Some(pos) = entries.iter().position(|(s, _)| *s == slot) else {
            return false;
        };
        let (slot, object) = entries.swap_remove(pos);
        self.released.push(ReleasedPrivate { slot, object });
        true
    }

    pub(crate) fn take_released(&mut self) -> Vec<ReleasedPrivate> {
        mem::take(&mut self.released)
    }
}
