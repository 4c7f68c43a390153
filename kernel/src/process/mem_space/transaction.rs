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

//! Implementation of memory space transactions to modify [`MemSpaceState`] atomically.

use super::{MemSpaceState, gap::MemGap, mapping::MemMapping};
use crate::{
	memory::{VirtAddr, vmem::VMem},
	sync::mutex::MutexGuard,
};
use core::{alloc::AllocError, hash::Hash, mem};
use utils::{
	TryClone,
	collections::{
		btreemap::BTreeMap,
		hashmap::{Entry, HashMap},
		hashset::HashSet,
	},
	errno::{AllocResult, EResult},
	limits::PAGE_SIZE,
};

/// Applies the difference in `complement` to rollback operations.
///
/// If the complement does not correspond to `on`, the function might panic.
fn rollback<K: Ord + Hash, V>(on: &mut BTreeMap<K, V>, complement: HashMap<K, Option<V>>) {
	for (key, value) in complement {
		rollback_impl(on, key, value);
	}
}

#[cold]
fn rollback_impl<K: Ord + Hash, V>(on: &mut BTreeMap<K, V>, key: K, value: Option<V>) {
	let _ = match value {
		// Insertion cannot fail since `on` is guaranteed to already contain the key
		Some(value) => on.insert(key, value).unwrap(),
		None => on.remove(&key),
	};
}

/// Inserts an element in the [`BTreeMap`] `on`, together with rollback data.
///
/// `complement` is the complement used for rollback.
///
/// The `discard` list is also updated to avoid discarding an element that is being replaced by
/// the insertion.
fn insert<K: Clone + Ord + Hash, V>(
	key: K,
	value: V,
	on: &mut BTreeMap<K, V>,
	complement: &mut HashMap<K, Option<V>>,
	discard: &mut HashSet<K>,
) -> AllocResult<()> {
	let old = on.insert(key.clone(), value)?;
	if let Entry::Vacant(entry) = complement.entry(key.clone()) {
		let Ok(val) = entry.insert(None) else {
			complement.remove(&key);
			rollback_impl(on, key, old);
			return Err(AllocError);
		};
		*val = old;
	}
	discard.remove(&key);
	Ok(())
}

/// A transaction to be performed on a memory space.
///
/// Since mapping or unmapping memory requires separate insert and remove operations, and insert
/// operations can fail, it is necessary to ensure every operation is performed, or to roll back
/// to avoid leaving the state inconsistent.
#[must_use = "A transaction must be committed, or its result is discarded"]
pub(super) struct MemSpaceTransaction<'m> {
	// It is important that `vmem` is placed before `state` since fields are dropped in
	// declaration order. This matters for interrupt masking.
	/// The virtual memory context.
	pub vmem: MutexGuard<'m, VMem<false>, false>,
	/// The memory space state the transaction applies to.
	pub state: MutexGuard<'m, MemSpaceState, false>,

	/// The complement used to restore `gaps` on rollback.
	gaps_complement: HashMap<VirtAddr, Option<MemGap>>,
	/// The complement used to restore `mappings` on rollback.
	mappings_complement: HashMap<VirtAddr, Option<MemMapping>>,

	/// The set of gaps that must be discarded on commit.
	gaps_discard: HashSet<VirtAddr>,
	/// The set of mappings that must be discarded on commit.
	mappings_discard: HashSet<VirtAddr>,

	/// The new value for the `vmem_usage` field.
	vmem_usage: usize,
}

impl<'m> MemSpaceTransaction<'m> {
	/// Begins a new transaction, locking `state` then `vmem`.
	pub fn new(
		state: MutexGuard<'m, MemSpaceState, false>,
		vmem: MutexGuard<'m, VMem<false>, false>,
	) -> Self {
		let vmem_usage = state.vmem_usage;
		Self {
			vmem,
			state,

			gaps_complement: Default::default(),
			mappings_complement: Default::default(),

			gaps_discard: Default::default(),
			mappings_discard: Default::default(),

			vmem_usage,
		}
	}

	/// Inserts the given gap into the state.
	///
	/// On failure, the transaction is dropped and rolled back.
	pub fn insert_gap(&mut self, gap: MemGap) -> AllocResult<()> {
		insert(
			gap.get_begin(),
			gap,
			&mut self.state.gaps,
			&mut self.gaps_complement,
			&mut self.gaps_discard,
		)
	}

	/// Removes the gap beginning at the given address from the state.
	///
	/// On failure, the transaction is dropped and rolled back.
	pub fn remove_gap(&mut self, gap_begin: VirtAddr) -> AllocResult<()> {
		if self.state.gaps.get(&gap_begin).is_some() {
			self.gaps_discard.insert(gap_begin)?;
		}
		Ok(())
	}

	/// Inserts the given mapping into the state.
	///
	/// If an already-present mapping immediately precedes or follows it and is mergeable under
	/// I2's coalescing rule, the two are merged into a single mapping instead of kept separate.
	///
	/// On failure, the transaction is dropped and rolled back.
	pub fn insert_mapping(&mut self, mapping: MemMapping) -> AllocResult<()> {
		let new_pages = mapping.size.get();
		let mut mapping = mapping;
		if !mapping.addr.is_null() {
			let left_end = mapping.addr;
			if let Some(left) = self
				.state
				.get_mapping_for_addr(left_end - PAGE_SIZE)
				.filter(|left| left.addr + left.size.get() * PAGE_SIZE == left_end)
				.filter(|left| left.mergeable_with(&mapping))
			{
				let mut left = left.try_clone()?;
				left.merge(mapping)?;
				mapping = left;
			}
		}
		let end = mapping.addr + mapping.size.get() * PAGE_SIZE;
		let mut absorbed_right = None;
		if let Some(right) = self
			.state
			.get_mapping_for_addr(end)
			.filter(|right| right.addr == end)
			.filter(|right| mapping.mergeable_with(right))
		{
			mapping.merge(right.try_clone()?)?;
			absorbed_right = Some(right.addr);
		}
		insert(
			mapping.addr,
			mapping,
			&mut self.state.mappings,
			&mut self.mappings_complement,
			&mut self.mappings_discard,
		)?;
		if let Some(addr) = absorbed_right {
			self.mappings_discard.insert(addr)?;
		}
		self.vmem_usage += new_pages;
		Ok(())
	}

	/// Removes the mapping beginning at the given address from the state.
	///
	/// Syncs the mapping's dirty pages to its v-node, notifies a non-cached v-node (e.g. a
	/// character device) that its pages are being torn down, then removes it from the MMU. On
	/// failure, the transaction is dropped and rolled back.
	pub fn remove_mapping(&mut self, mapping_begin: VirtAddr) -> EResult<()> {
		if let Some(mapping) = self.state.mappings.get(&mapping_begin) {
			self.mappings_discard.insert(mapping_begin)?;
			mapping.sync(true)?;
			mapping.notify_unmap(&self.vmem);
			// No rollback needed: the next access simply re-faults and re-installs the mapping.
			self.vmem.unmap_range(mapping.addr, mapping.size.get());
			self.vmem_usage -= mapping.size.get();
		}
		Ok(())
	}

	/// Commits the transaction.
	pub fn commit(mut self) {
		self.gaps_complement = Default::default();
		self.mappings_complement = Default::default();
		for addr in self.gaps_discard.iter() {
			self.state.gaps.remove(addr);
		}
		for addr in self.mappings_discard.iter() {
			self.state.mappings.remove(addr);
		}
		self.state.vmem_usage = self.vmem_usage;
	}
}

impl Drop for MemSpaceTransaction<'_> {
	fn drop(&mut self) {
		// If the transaction was not committed, rollback
		let gaps_complement = mem::take(&mut self.gaps_complement);
		rollback(&mut self.state.gaps, gaps_complement);
		let mappings_complement = mem::take(&mut self.mappings_complement);
		rollback(&mut self.state.mappings, mappings_complement);
	}
}
