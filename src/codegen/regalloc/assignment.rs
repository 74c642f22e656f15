//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::ArenaKey;
use crate::codegen::regalloc::WorkId;
use crate::codegen::{PerGroup, RegGroup, RegMask};
use std::fmt;

const NO_WORK: u32 = u32::MAX;
const NO_PHYS: u8 = u8::MAX;

/// The fixed geometry of an assignment: where each group's registers start
/// in the flattened physical index space, and how many work registers
/// exist.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AssignLayout {
    phys_index: PerGroup<u32>,
    phys_count: PerGroup<u32>,
    phys_total: u32,
    work_count: u32,
}

impl AssignLayout {
    /// Builds the layout from per-group physical register counts and the
    /// number of work registers.
    pub fn new(phys_count: PerGroup<u32>, work_count: u32) -> Self {
        let mut phys_index = PerGroup::default();
        let mut total = 0;

        for group in RegGroup::ALL {
            phys_index[group] = total;
            total += phys_count[group];
        }

        Self {
            phys_index,
            phys_count,
            phys_total: total,
            work_count,
        }
    }

    /// The flattened index of physical register `id` of `group`.
    #[inline]
    fn flat(&self, group: RegGroup, id: u8) -> usize {
        debug_assert!(u32::from(id) < self.phys_count[group]);

        (self.phys_index[group] + u32::from(id)) as usize
    }

    /// Total physical registers across all groups.
    #[inline]
    pub fn phys_total(&self) -> u32 {
        self.phys_total
    }

    /// The number of work registers this layout covers.
    #[inline]
    pub fn work_count(&self) -> u32 {
        self.work_count
    }
}

/// A concrete register assignment: which work register inhabits which
/// physical register, with O(1) lookup in both directions.
///
/// The `dirty` mask tracks registers whose value is newer than the work
/// register's stack home; spilling a clean register needs no store.
/// Cloning is O(registers + work registers), which is what block entry
/// snapshots rely on.
#[derive(Clone)]
pub struct RAAssignment {
    layout: AssignLayout,
    phys_to_work: Vec<u32>,
    work_to_phys: Vec<u8>,
    assigned: PerGroup<RegMask>,
    dirty: PerGroup<RegMask>,
}

impl RAAssignment {
    /// Creates an assignment with nothing assigned.
    pub fn new(layout: AssignLayout) -> Self {
        Self {
            layout,
            phys_to_work: vec![NO_WORK; layout.phys_total() as usize],
            work_to_phys: vec![NO_PHYS; layout.work_count() as usize],
            assigned: PerGroup::default(),
            dirty: PerGroup::default(),
        }
    }

    /// The geometry this assignment was built for.
    #[inline]
    pub fn layout(&self) -> AssignLayout {
        self.layout
    }

    /// The work register held by `id` of `group`, if any.
    #[inline]
    pub fn work_at(&self, group: RegGroup, id: u8) -> Option<WorkId> {
        let w = self.phys_to_work[self.layout.flat(group, id)];

        (w != NO_WORK).then(|| WorkId::key_new(w as usize))
    }

    /// The physical id `work` currently lives in, if any.
    #[inline]
    pub fn phys_of(&self, work: WorkId) -> Option<u8> {
        let p = self.work_to_phys[work.key_index()];

        (p != NO_PHYS).then_some(p)
    }

    /// The registers of `group` currently holding a work register.
    #[inline]
    pub fn assigned_mask(&self, group: RegGroup) -> RegMask {
        self.assigned[group]
    }

    /// The registers of `group` whose value is newer than its stack home.
    #[inline]
    pub fn dirty_mask(&self, group: RegGroup) -> RegMask {
        self.dirty[group]
    }

    /// Checks whether `id` of `group` is dirty.
    #[inline]
    pub fn is_dirty(&self, group: RegGroup, id: u8) -> bool {
        self.dirty[group].contains(id)
    }

    /// Binds `work` to `id` of `group`. The register must be free and the
    /// work register must be homeless.
    pub fn assign(&mut self, group: RegGroup, work: WorkId, id: u8, dirty: bool) {
        debug_assert!(self.work_at(group, id).is_none(), "register already held");
        debug_assert!(self.phys_of(work).is_none(), "work register already placed");

        self.phys_to_work[self.layout.flat(group, id)] = work.key_index() as u32;
        self.work_to_phys[work.key_index()] = id;
        self.assigned[group].insert(id);

        if dirty {
            self.dirty[group].insert(id);
        }
    }

    /// Moves `work` from `src` to `dst` within `group`, carrying the dirty
    /// bit along.
    pub fn reassign(&mut self, group: RegGroup, work: WorkId, dst: u8, src: u8) {
        debug_assert_eq!(self.phys_of(work), Some(src));
        debug_assert!(self.work_at(group, dst).is_none(), "register already held");

        let dirty = self.dirty[group].contains(src);

        self.unassign(group, work, src);
        self.assign(group, work, dst, dirty);
    }

    /// Exchanges the homes of `a` (in `a_id`) and `b` (in `b_id`),
    /// exchanging their dirty bits with them.
    pub fn swap(&mut self, group: RegGroup, a: WorkId, a_id: u8, b: WorkId, b_id: u8) {
        debug_assert_eq!(self.work_at(group, a_id), Some(a));
        debug_assert_eq!(self.work_at(group, b_id), Some(b));

        let a_dirty = self.dirty[group].contains(a_id);
        let b_dirty = self.dirty[group].contains(b_id);

        self.phys_to_work[self.layout.flat(group, a_id)] = b.key_index() as u32;
        self.phys_to_work[self.layout.flat(group, b_id)] = a.key_index() as u32;
        self.work_to_phys[a.key_index()] = b_id;
        self.work_to_phys[b.key_index()] = a_id;

        for (id, dirty) in [(a_id, b_dirty), (b_id, a_dirty)] {
            if dirty {
                self.dirty[group].insert(id);
            } else {
                self.dirty[group].remove(id);
            }
        }
    }

    /// Unbinds `work` from `id` of `group`.
    pub fn unassign(&mut self, group: RegGroup, work: WorkId, id: u8) {
        debug_assert_eq!(self.work_at(group, id), Some(work));

        self.phys_to_work[self.layout.flat(group, id)] = NO_WORK;
        self.work_to_phys[work.key_index()] = NO_PHYS;
        self.assigned[group].remove(id);
        self.dirty[group].remove(id);
    }

    /// Marks `id` of `group` dirty.
    #[inline]
    pub fn make_dirty(&mut self, group: RegGroup, id: u8) {
        debug_assert!(self.assigned[group].contains(id));

        self.dirty[group].insert(id);
    }

    /// Marks `id` of `group` clean (its stack home is current).
    #[inline]
    pub fn make_clean(&mut self, group: RegGroup, id: u8) {
        self.dirty[group].remove(id);
    }

    /// Checks whether two assignments place every work register
    /// identically, ignoring dirty bits.
    pub fn same_placement(&self, other: &RAAssignment) -> bool {
        self.phys_to_work == other.phys_to_work
    }

    /// Checks full equality, dirty bits included.
    pub fn equals(&self, other: &RAAssignment) -> bool {
        self.same_placement(other) && self.dirty == other.dirty
    }

    /// Iterates over `(work, id)` pairs assigned within `group`.
    pub fn assigned_of(&self, group: RegGroup) -> impl Iterator<Item = (WorkId, u8)> + '_ {
        self.assigned[group]
            .iter()
            .map(move |id| (self.work_at(group, id).unwrap(), id))
    }
}

impl fmt::Debug for RAAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();

        for group in RegGroup::ALL {
            for (work, id) in self.assigned_of(group) {
                map.entry(&(group, id), &work);
            }
        }

        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> AssignLayout {
        let mut counts = PerGroup::default();
        counts[RegGroup::Gp] = 4;
        counts[RegGroup::Vec] = 2;

        AssignLayout::new(counts, 3)
    }

    fn w(id: usize) -> WorkId {
        WorkId::key_new(id)
    }

    #[test]
    fn both_directions_agree() {
        let mut a = RAAssignment::new(layout());

        a.assign(RegGroup::Gp, w(0), 2, true);
        a.assign(RegGroup::Vec, w(1), 0, false);

        assert_eq!(a.work_at(RegGroup::Gp, 2), Some(w(0)));
        assert_eq!(a.phys_of(w(0)), Some(2));
        assert_eq!(a.work_at(RegGroup::Vec, 0), Some(w(1)));
        assert_eq!(a.work_at(RegGroup::Gp, 0), None);
        assert!(a.is_dirty(RegGroup::Gp, 2));
        assert!(!a.is_dirty(RegGroup::Vec, 0));
    }

    #[test]
    fn reassign_carries_dirty() {
        let mut a = RAAssignment::new(layout());

        a.assign(RegGroup::Gp, w(0), 0, true);
        a.reassign(RegGroup::Gp, w(0), 3, 0);

        assert_eq!(a.work_at(RegGroup::Gp, 0), None);
        assert_eq!(a.phys_of(w(0)), Some(3));
        assert!(a.is_dirty(RegGroup::Gp, 3));
        assert!(!a.is_dirty(RegGroup::Gp, 0));
    }

    #[test]
    fn swap_exchanges_homes_and_dirty() {
        let mut a = RAAssignment::new(layout());

        a.assign(RegGroup::Gp, w(0), 0, true);
        a.assign(RegGroup::Gp, w(1), 1, false);
        a.swap(RegGroup::Gp, w(0), 0, w(1), 1);

        assert_eq!(a.phys_of(w(0)), Some(1));
        assert_eq!(a.phys_of(w(1)), Some(0));
        assert!(a.is_dirty(RegGroup::Gp, 1));
        assert!(!a.is_dirty(RegGroup::Gp, 0));
    }

    #[test]
    fn clone_is_independent() {
        let mut a = RAAssignment::new(layout());

        a.assign(RegGroup::Gp, w(0), 0, false);

        let snapshot = a.clone();

        a.unassign(RegGroup::Gp, w(0), 0);
        a.assign(RegGroup::Gp, w(0), 1, false);

        assert_eq!(snapshot.phys_of(w(0)), Some(0));
        assert!(!snapshot.same_placement(&a));
    }

    #[test]
    fn groups_do_not_collide() {
        let mut a = RAAssignment::new(layout());

        // same numeric id, different groups
        a.assign(RegGroup::Gp, w(0), 1, false);
        a.assign(RegGroup::Vec, w(1), 1, false);

        assert_eq!(a.work_at(RegGroup::Gp, 1), Some(w(0)));
        assert_eq!(a.work_at(RegGroup::Vec, 1), Some(w(1)));
    }
}
