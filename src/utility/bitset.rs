//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use std::fmt;

const WORD_BITS: usize = u64::BITS as usize;

/// A dense, fixed-width bitset backed by a word vector.
///
/// This is the representation used for every per-block liveness set
/// (`in`/`out`/`gen`/`kill`), all sized to the number of work registers in
/// the function. The only way to grow one is [`BitVector::resize`], which is
/// called exactly once per pass when the work register count is known.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BitVector {
    words: Vec<u64>,
    len: usize,
}

impl BitVector {
    /// Creates an empty bitset with zero width.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bitset that can hold `len` bits, all starting cleared.
    pub fn with_len(len: usize) -> Self {
        Self {
            words: vec![0; (len + WORD_BITS - 1) / WORD_BITS],
            len,
        }
    }

    /// The number of bits this set holds.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks whether the set holds zero bits of storage.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grows (or shrinks) the set to hold exactly `len` bits. New bits
    /// start cleared.
    pub fn resize(&mut self, len: usize) {
        self.words.resize((len + WORD_BITS - 1) / WORD_BITS, 0);
        self.len = len;

        // clear any stale bits past the new length in the last word
        if len % WORD_BITS != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << (len % WORD_BITS)) - 1;
            }
        }
    }

    /// Reads the bit at `index`.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len);

        (self.words[index / WORD_BITS] >> (index % WORD_BITS)) & 1 != 0
    }

    /// Sets the bit at `index`.
    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);

        self.words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
    }

    /// Clears the bit at `index`.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len);

        self.words[index / WORD_BITS] &= !(1u64 << (index % WORD_BITS));
    }

    /// Clears every bit without changing the width.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Computes `self |= other`, returning whether any bit of `self` changed.
    ///
    /// Both sets must have the same width.
    pub fn union_with(&mut self, other: &BitVector) -> bool {
        debug_assert_eq!(self.len, other.len);

        let mut changed = false;

        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            let next = *dst | *src;

            changed |= next != *dst;
            *dst = next;
        }

        changed
    }

    /// Computes `self &= !other` (set subtraction). Both sets must have the
    /// same width.
    pub fn difference_with(&mut self, other: &BitVector) {
        debug_assert_eq!(self.len, other.len);

        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            *dst &= !*src;
        }
    }

    /// Overwrites `self` with a copy of `other`. Both sets must have the
    /// same width.
    pub fn copy_from(&mut self, other: &BitVector) {
        debug_assert_eq!(self.len, other.len);

        self.words.copy_from_slice(&other.words);
    }

    /// Counts the set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates over the indices of every set bit, in increasing order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut w = word;

            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }

                let bit = w.trailing_zeros() as usize;
                w &= w - 1;

                Some(i * WORD_BITS + bit)
            })
        })
    }
}

impl fmt::Debug for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter_ones()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_clear() {
        let mut bv = BitVector::with_len(130);

        assert!(!bv.get(0));
        assert!(!bv.get(129));

        bv.set(0);
        bv.set(64);
        bv.set(129);

        assert!(bv.get(0));
        assert!(bv.get(64));
        assert!(bv.get(129));
        assert!(!bv.get(1));

        bv.clear(64);
        assert!(!bv.get(64));
        assert_eq!(bv.count_ones(), 2);
    }

    #[test]
    fn union_reports_change() {
        let mut a = BitVector::with_len(70);
        let mut b = BitVector::with_len(70);

        b.set(3);
        b.set(69);

        assert!(a.union_with(&b));
        assert!(!a.union_with(&b));
        assert!(a.get(3) && a.get(69));
    }

    #[test]
    fn difference_subtracts() {
        let mut a = BitVector::with_len(16);
        let mut b = BitVector::with_len(16);

        a.set(1);
        a.set(2);
        b.set(2);

        a.difference_with(&b);

        assert!(a.get(1));
        assert!(!a.get(2));
    }

    #[test]
    fn iter_ones_in_order() {
        let mut a = BitVector::with_len(200);

        for i in [0usize, 63, 64, 65, 127, 199] {
            a.set(i);
        }

        let ones: Vec<usize> = a.iter_ones().collect();
        assert_eq!(ones, vec![0, 63, 64, 65, 127, 199]);
    }

    #[test]
    fn resize_clears_tail() {
        let mut a = BitVector::with_len(10);

        a.set(9);
        a.resize(9);
        a.resize(10);

        assert!(!a.get(9));
    }
}
