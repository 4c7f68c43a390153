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

//! The v-node: a reference-counted file object with an operations vtable.
//!
//! A node is shared by every open file description and every memory mapping pointing at the same
//! underlying object (tracked by [`Arc`] strong count); there is no separate VFS dentry cache in
//! this scope (path resolution and mount points are external collaborators).

use crate::{
	file::fs::{FileType, NodeOps, Stat},
	memory::cache::PageCache,
};
use crate::sync::IntMutex;
use alloc::boxed::Box;
use utils::errno::EResult;

/// A filesystem node.
///
/// The `size` field is the v-node's size lock (spec vocabulary: `vnode.sizelock`): VFS-io holds
/// it for the entire duration of a read or write so a concurrent truncate or extending write
/// cannot produce a result inconsistent with any single observed size.
pub struct Node {
	/// The node's type; determines whether I/O is routed through the page cache.
	pub node_type: FileType,
	/// The node's current size in bytes, protected by the size lock.
	size: IntMutex<u64>,
	/// Handle to the operations implementing this node's behavior.
	pub ops: Box<dyn NodeOps>,
	/// The node's page cache. Only populated for regular files and block devices.
	pub cache: PageCache,
}

impl Node {
	/// Creates a new node of the given type and initial size.
	pub fn new(node_type: FileType, ops: Box<dyn NodeOps>, size: u64) -> Self {
		Self {
			node_type,
			size: IntMutex::new(size),
			ops,
			cache: PageCache::default(),
		}
	}

	/// Tells whether I/O on this node is routed through the page cache.
	#[inline]
	pub fn is_cached(&self) -> bool {
		matches!(self.node_type, FileType::Regular | FileType::BlockDevice)
	}

	/// Returns the node's current size, without taking the size lock for longer than the read.
	pub fn size(&self) -> u64 {
		*self.size.lock()
	}

	/// Acquires the size lock and runs `f` with mutable access to the size, for the entire
	/// duration of a read or write (per the concurrency model, the lock must be held across the
	/// whole operation, not just the size check).
	pub fn with_size_lock<T>(&self, f: impl FnOnce(&mut u64) -> EResult<T>) -> EResult<T> {
		let mut size = self.size.lock();
		f(&mut size)
	}

	/// Returns the node's metadata.
	pub fn getattr(&self) -> EResult<Stat> {
		self.ops.getattr(self)
	}
}
