//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::codegen::regalloc::SlotId;
use crate::codegen::{RegGroup, RegMask, VirtId};
use crate::dense_arena_key;
use bitflags::bitflags;
use smallvec::SmallVec;
use std::fmt;

dense_arena_key! {
    /// The pass-internal identity of a virtual register that the function
    /// actually uses. Work ids are dense: `0..work_reg_count`.
    pub struct WorkId;
}

/// A half-open interval `[start, end)` of instruction positions during
/// which a work register is live.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LiveSpan {
    /// First position of the span (inclusive).
    pub start: u32,
    /// End position of the span (exclusive).
    pub end: u32,
}

impl LiveSpan {
    /// Creates a span covering `[start, end)`.
    #[inline]
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start < end);

        Self { start, end }
    }

    /// The number of positions the span covers.
    #[inline]
    pub fn len(self) -> u32 {
        self.end - self.start
    }

    /// Checks whether the span covers zero positions. Spans are never
    /// constructed empty, this exists for completeness.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.start >= self.end
    }

    /// Checks whether two spans share at least one position.
    #[inline]
    pub fn overlaps(self, other: LiveSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Debug for LiveSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Checks whether two sorted, non-overlapping span lists intersect, with a
/// linear merge.
pub(super) fn spans_intersect(a: &[LiveSpan], b: &[LiveSpan]) -> bool {
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        if a[i].overlaps(b[j]) {
            return true;
        }

        if a[i].end <= b[j].start {
            i += 1;
        } else {
            j += 1;
        }
    }

    false
}

/// Merges `extra` (sorted) into `into` (sorted), keeping the result sorted.
/// The caller guarantees the two lists don't overlap.
pub(super) fn merge_spans(into: &mut Vec<LiveSpan>, extra: &[LiveSpan]) {
    into.extend_from_slice(extra);
    into.sort_unstable();
}

bitflags! {
    /// State bits carried by a [`WorkReg`].
    pub struct WorkRegFlags: u32 {
        /// Some instruction references this register with a fixed physical
        /// id constraint.
        const FIXED = 1;
        /// A stack slot was created for this register.
        const STACK_USED = 2;
    }
}

/// The pass's view of one used virtual register.
///
/// Created on first use during CFG construction and immortal for the rest
/// of the pass. Everything the allocators learn about the register
/// accumulates here: the constraint-narrowed allocable mask, the live
/// spans, the binpack statistics, the global home and the spill slot.
pub struct WorkReg {
    virt: VirtId,
    group: RegGroup,
    flags: WorkRegFlags,
    allocable: RegMask,
    size: u32,
    align: u32,
    refs: SmallVec<[u32; 8]>,
    spans: SmallVec<[LiveSpan; 4]>,
    width: u32,
    priority: u64,
    home_id: Option<u8>,
    slot: Option<SlotId>,
}

impl WorkReg {
    /// Creates a fresh work register for `virt` with every register of the
    /// group's available set as a candidate. `size` and `align` come from
    /// the virtual register and shape the spill slot, should one be needed.
    pub fn new(virt: VirtId, group: RegGroup, allocable: RegMask, size: u32, align: u32) -> Self {
        Self {
            virt,
            group,
            flags: WorkRegFlags::empty(),
            allocable,
            size,
            align,
            refs: SmallVec::new(),
            spans: SmallVec::new(),
            width: 0,
            priority: 0,
            home_id: None,
            slot: None,
        }
    }

    /// The byte size of the value, for spill slot creation.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The stack alignment of the value, for spill slot creation.
    #[inline]
    pub fn align(&self) -> u32 {
        self.align
    }

    /// The virtual register this work register stands for.
    #[inline]
    pub fn virt(&self) -> VirtId {
        self.virt
    }

    /// The register group allocation happens in.
    #[inline]
    pub fn group(&self) -> RegGroup {
        self.group
    }

    /// The state bits.
    #[inline]
    pub fn flags(&self) -> WorkRegFlags {
        self.flags
    }

    /// Adds state bits.
    #[inline]
    pub fn add_flags(&mut self, flags: WorkRegFlags) {
        self.flags |= flags;
    }

    /// The physical registers this work register may legally occupy,
    /// intersected across every tied-register constraint seen so far.
    #[inline]
    pub fn allocable(&self) -> RegMask {
        self.allocable
    }

    /// Narrows the allocable set.
    #[inline]
    pub fn restrict_allocable(&mut self, mask: RegMask) {
        self.allocable &= mask;
    }

    /// Records a read of this register at `position`. The CFG builder
    /// calls this in stream order, so the list stays sorted.
    #[inline]
    pub fn push_ref(&mut self, position: u32) {
        self.refs.push(position);
    }

    /// Every position at which this register is read, in stream order.
    #[inline]
    pub fn refs(&self) -> &[u32] {
        &self.refs
    }

    /// The ordered, non-overlapping live spans, in instruction positions.
    #[inline]
    pub fn spans(&self) -> &[LiveSpan] {
        &self.spans
    }

    /// Records a raw (possibly unsorted) span. [`Self::finish_spans`] must
    /// run before anyone reads [`Self::spans`].
    pub fn push_span(&mut self, span: LiveSpan, block_weight: u32) {
        self.priority += u64::from(span.len()) * u64::from(block_weight + 1);
        self.spans.push(span);
    }

    /// Sorts the recorded spans and fuses the ones that touch or overlap,
    /// which is what joins liveness across fall-through edges.
    pub fn finish_spans(&mut self) {
        self.spans.sort_unstable();

        let mut merged: SmallVec<[LiveSpan; 4]> = SmallVec::new();

        for &span in self.spans.iter() {
            match merged.last_mut() {
                Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
                _ => merged.push(span),
            }
        }

        self.spans = merged;
        self.width = self.spans.iter().map(|s| s.len()).sum();
    }

    /// Total number of positions covered by the live spans.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// The binpack ordering key: span length scaled by loop weight.
    #[inline]
    pub fn priority(&self) -> u64 {
        self.priority
    }

    /// The physical register the global allocator picked, if it found one.
    #[inline]
    pub fn home_id(&self) -> Option<u8> {
        self.home_id
    }

    /// Records the global allocator's pick.
    #[inline]
    pub fn set_home_id(&mut self, id: u8) {
        self.home_id = Some(id);
    }

    /// The stack slot backing this register, if one was ever needed.
    #[inline]
    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    /// Records the lazily created stack slot.
    #[inline]
    pub fn set_slot(&mut self, slot: SlotId) {
        self.slot = Some(slot);
        self.flags |= WorkRegFlags::STACK_USED;
    }

    /// The first position after `pos` where this register is read again,
    /// or `u32::MAX` if it never is. This is what the `Complex` strategy
    /// ranks spill victims by.
    pub fn next_use_after(&self, pos: u32) -> u32 {
        match self.refs.iter().find(|&&r| r > pos) {
            Some(&r) => r,
            None => u32::MAX,
        }
    }
}
