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
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// This is meant to act as a primary mapping of `K -> V`, where `K` is some
/// key type and `V` is the value being stored. Other mappings that use the
/// same key as an existing [`ArenaMap`] should use
/// [`SecondaryMap`](super::SecondaryMap) instead.
///
/// This is effectively a typed wrapper around `Vec<T>`, the main advantage is
/// that it does not implicitly convert into array types (i.e. it actually
/// acts like a map instead of a sequence) and it only allows indexing with
/// the correct type.
///
/// ```
/// # use opal::arena_key;
/// # use opal::arena::ArenaMap;
/// arena_key! {
///     struct Name;
/// }
///
/// let mut blocks = ArenaMap::new();
/// let bb: Name = blocks.insert("Hello!");
///
/// assert_eq!(blocks[bb], "Hello!");
/// ```
#[derive(Clone)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArenaMap<K: ArenaKey, V> {
    slots: Vec<V>,
    _unused: PhantomData<fn() -> K>,
}

impl<K: ArenaKey, V> ArenaMap<K, V> {
    /// Creates a new, empty arena.
    #[inline]
    pub fn new() -> Self {
        Self {
            slots: Vec::default(),
            _unused: PhantomData,
        }
    }

    /// Creates an empty arena with an initial capacity.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            _unused: PhantomData,
        }
    }

    /// Checks if the arena contains a given key, i.e. whether a given key
    /// has been returned from [`Self::insert`] at some point.
    #[inline]
    pub fn contains(&self, key: K) -> bool {
        key.key_index() < self.slots.len()
    }

    /// Gets the value associated with a given key, if it exists.
    #[inline]
    pub fn get(&self, key: K) -> Option<&V> {
        self.slots.get(key.key_index())
    }

    /// Gets a mutable reference to the value associated with a given key,
    /// if it exists.
    #[inline]
    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.slots.get_mut(key.key_index())
    }

    /// Inserts a value into the arena and returns the key it can be
    /// accessed with.
    #[inline]
    pub fn insert(&mut self, value: V) -> K {
        let key = self.next_key();

        self.slots.push(value);

        key
    }

    /// Returns the key that the next call to [`Self::insert`] will
    /// associate with the inserted value.
    #[inline]
    pub fn next_key(&self) -> K {
        K::key_new(self.slots.len())
    }

    /// The number of values in the arena.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Checks whether the arena holds zero values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterates over the keys of the arena in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        (0..self.slots.len()).map(K::key_new)
    }

    /// Iterates over `(key, &value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, v)| (K::key_new(i), v))
    }

    /// Iterates over `(key, &mut value)` pairs in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut V)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(i, v)| (K::key_new(i), v))
    }

    /// Iterates over the values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.slots.iter()
    }

    /// Removes every value, invalidating all previously returned keys.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

impl<K: ArenaKey, V> Default for ArenaMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, V> Index<K> for ArenaMap<K, V> {
    type Output = V;

    #[inline]
    fn index(&self, key: K) -> &V {
        &self.slots[key.key_index()]
    }
}

impl<K: ArenaKey, V> IndexMut<K> for ArenaMap<K, V> {
    #[inline]
    fn index_mut(&mut self, key: K) -> &mut V {
        &mut self.slots[key.key_index()]
    }
}

impl<K: ArenaKey, V: Debug> Debug for ArenaMap<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense_arena_key;

    dense_arena_key! { struct E; }

    #[test]
    fn insert_then_read() {
        let mut map = ArenaMap::<E, i32>::new();
        let a = map.insert(1);
        let b = map.insert(2);

        assert_eq!(map[a], 1);
        assert_eq!(map[b], 2);
        assert_eq!(map.len(), 2);
        assert!(map.contains(a));
        assert!(!map.contains(map.next_key()));
    }

    #[test]
    fn keys_in_insertion_order() {
        let mut map = ArenaMap::<E, i32>::new();
        let keys: Vec<E> = (0..4).map(|i| map.insert(i)).collect();
        let listed: Vec<E> = map.keys().collect();

        assert_eq!(keys, listed);
    }
}
