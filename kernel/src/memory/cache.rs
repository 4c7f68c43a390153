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

//! The page cache avoids unnecessary disk I/O by keeping recently-used frames of file data in
//! memory.
//!
//! Unlike a full LRU-driven cache, pages are reclaimed only on explicit [`PageCache::evict`] or
//! [`PageCache::truncate`]; there is no background writeback daemon or shrink-under-pressure path
//! (read-ahead/write-behind beyond explicit sync is out of scope). [`PageCache::sync_range`] is
//! how a caller (e.g. `fsync`) forces dirty pages back to their owner.

use crate::{
	file::vfs::node::Node,
	memory::{PhysAddr, VirtAddr, buddy, buddy::FrameOrder},
};
use core::{
	fmt,
	fmt::Formatter,
	marker::PhantomData,
	mem::size_of,
	ops::Deref,
	slice,
	sync::atomic::{AtomicBool, Ordering::{Acquire, Release}},
};
use utils::{
	bytes::AnyRepr,
	collections::btreemap::BTreeMap,
	errno::{AllocResult, EResult},
	limits::PAGE_SIZE,
	math::pow2,
	ptr::arc::Arc,
	range_cmp,
};
use crate::sync::IntMutex;

/// The node or device a cached frame's data comes from.
#[derive(Clone, Debug)]
pub enum FrameOwner {
	/// No owner: the frame is anonymous memory, never written back.
	Anon,
	/// Owned by a filesystem node.
	Node(Arc<Node>),
}

#[derive(Debug)]
struct RcFrameInner {
	/// Starting physical address of the frame.
	addr: PhysAddr,
	/// The order of the buddy allocation backing the frame.
	order: FrameOrder,
	/// The node the data originates from.
	owner: FrameOwner,
	/// The offset of the frame within the owner, in pages.
	off: u64,
	/// Whether the frame holds data that has not yet been written back to its owner.
	dirty: AtomicBool,
}

impl Drop for RcFrameInner {
	fn drop(&mut self) {
		unsafe {
			buddy::free(self.addr.0 as _, self.order);
		}
	}
}

/// A reference-counted, cached physical memory frame.
///
/// When the last reference is dropped, the frame is returned to the allocator. A new reference
/// is obtained with [`Clone`].
#[derive(Clone, Debug)]
pub struct RcFrame(Arc<RcFrameInner>);

impl RcFrame {
	/// Allocates a new, *uninitialized* frame.
	pub fn new(order: FrameOrder, flags: buddy::Flags, owner: FrameOwner, off: u64) -> AllocResult<Self> {
		let addr = PhysAddr(buddy::alloc(order, flags)?.as_ptr() as usize);
		Ok(Self(Arc::new(RcFrameInner {
			addr,
			order,
			owner,
			off,
			dirty: AtomicBool::new(false),
		})?))
	}

	/// Allocates a new, zeroed frame.
	pub fn new_zeroed(order: FrameOrder, owner: FrameOwner, off: u64) -> AllocResult<Self> {
		let frame = Self::new(order, buddy::FLAG_ZONE_TYPE_KERNEL, owner, off)?;
		unsafe {
			frame.slice_mut::<u8>().fill(0);
		}
		Ok(frame)
	}

	/// Returns the frame's physical address.
	#[inline]
	pub fn phys_addr(&self) -> PhysAddr {
		self.0.addr
	}

	/// Returns the frame's virtual (kernel-mapped) address.
	#[inline]
	pub fn virt_addr(&self) -> VirtAddr {
		self.phys_addr().kernel_to_virtual().unwrap()
	}

	/// Returns an immutable view of the frame.
	pub fn slice<T: AnyRepr>(&self) -> &[T] {
		let ptr = self.virt_addr().as_ptr::<T>();
		let len = buddy::get_frame_size(self.0.order) / size_of::<T>();
		unsafe { slice::from_raw_parts(ptr, len) }
	}

	/// Returns a mutable view of the frame.
	///
	/// # Safety
	///
	/// The caller must ensure no other reference is used concurrently.
	#[inline]
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn slice_mut<T: AnyRepr>(&self) -> &mut [T] {
		let ptr = self.virt_addr().as_ptr::<T>();
		let len = buddy::get_frame_size(self.0.order) / size_of::<T>();
		unsafe { slice::from_raw_parts_mut(ptr, len) }
	}

	/// Tells whether references to this frame exist besides its owner's own and `self`.
	#[inline]
	pub fn is_shared(&self) -> bool {
		let ref_count = Arc::strong_count(&self.0);
		match &self.0.owner {
			// No owning collection holds a reference: any other reference is a sharer.
			FrameOwner::Anon => ref_count > 1,
			// The node's `PageCache` itself holds one reference besides `self`.
			FrameOwner::Node(_) => ref_count > 2,
		}
	}

	/// Returns the order of the frame.
	#[inline]
	pub fn order(&self) -> FrameOrder {
		self.0.order
	}

	/// Returns the number of pages the frame spans.
	#[inline]
	pub fn pages_count(&self) -> usize {
		pow2(self.order() as usize)
	}

	/// Returns the size of the frame in bytes.
	#[inline]
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.pages_count() * PAGE_SIZE
	}

	/// Returns the offset of the frame within its owner, in pages.
	#[inline]
	pub fn offset(&self) -> u64 {
		self.0.off
	}

	/// Marks the frame as dirty: its data differs from what its owner has on storage.
	pub fn mark_dirty(&self) {
		self.0.dirty.store(true, Release);
	}

	/// Tells whether the frame is dirty.
	pub fn is_dirty(&self) -> bool {
		self.0.dirty.load(Acquire)
	}

	/// Writes the frame back to its owner if dirty, clearing the dirty flag on success.
	pub fn writeback(&self) -> EResult<()> {
		if !self.0.dirty.swap(false, Acquire) {
			return Ok(());
		}
		match &self.0.owner {
			FrameOwner::Anon => {}
			FrameOwner::Node(node) => node.ops.putpage(node, self)?,
		}
		Ok(())
	}
}

/// A view over a `T`-typed value living on a cached frame.
///
/// Useful to return a reference into the page cache from a function without exposing the whole
/// frame.
pub struct RcFrameVal<T: AnyRepr> {
	frame: RcFrame,
	off: usize,
	_phantom: PhantomData<T>,
}

impl<T: AnyRepr> RcFrameVal<T> {
	/// Creates a new value view at byte offset `off` on `frame`.
	pub fn new(frame: RcFrame, off: usize) -> Self {
		Self {
			frame,
			off,
			_phantom: PhantomData,
		}
	}

	/// Returns a mutable reference to the value.
	///
	/// # Safety
	///
	/// The caller must ensure no other reference to the value lives concurrently.
	#[inline]
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn as_mut(&self) -> &mut T {
		&mut self.frame.slice_mut()[self.off]
	}

	/// Marks the frame holding this value as dirty.
	pub fn mark_dirty(&self) {
		self.frame.mark_dirty();
	}
}

impl<T: AnyRepr> Deref for RcFrameVal<T> {
	type Target = T;

	#[inline]
	fn deref(&self) -> &Self::Target {
		&self.frame.slice()[self.off]
	}
}

impl<T: AnyRepr + fmt::Debug> fmt::Debug for RcFrameVal<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self.deref(), f)
	}
}

/// A per-node page cache.
#[derive(Debug, Default)]
pub struct PageCache {
	/// Cached frames, keyed by offset in pages from the start of the node.
	pages: IntMutex<BTreeMap<u64, RcFrame>>,
}

impl PageCache {
	/// Returns the frame covering offset `off` (in pages), reading it in with `init` on a cache
	/// miss.
	pub fn get_page<Init: FnOnce() -> EResult<RcFrame>>(
		&self,
		off: u64,
		order: FrameOrder,
		init: Init,
	) -> EResult<RcFrame> {
		let mut pages = self.pages.lock();
		let frame = pages.cmp_get(|frame_off, frame| range_cmp(*frame_off, frame.pages_count() as u64, off));
		if let Some(frame) = frame {
			return Ok(frame.clone());
		}
		let frame = init()?;
		pages.insert(off, frame.clone())?;
		let _ = order;
		Ok(frame)
	}

	/// Marks the frame at offset `off` as dirty, if present.
	pub fn make_dirty(&self, off: u64) {
		if let Some(frame) = self.pages.lock().get(&off) {
			frame.mark_dirty();
		}
	}

	/// Writes the frame at offset `off` back if dirty, then drops it from the cache.
	pub fn evict(&self, off: u64) -> EResult<()> {
		let frame = self.pages.lock().remove(&off);
		if let Some(frame) = frame {
			frame.writeback()?;
		}
		Ok(())
	}

	/// Removes, without writing back, every cached frame at or past offset `off` (in pages).
	pub fn truncate(&self, off: u64) {
		self.pages.lock().retain(|o, _| *o < off);
	}

	/// Writes every dirty frame whose offset (in pages) falls in `[start, end)` back to the
	/// owner. `end` of `u64::MAX` means "to the end".
	pub fn sync_range(&self, start: u64, end: u64) -> EResult<()> {
		let pages = self.pages.lock();
		for (off, frame) in pages.iter() {
			if *off < start || *off >= end {
				continue;
			}
			frame.writeback()?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test_case]
	fn rcframe_zeroed() {
		let frame = RcFrame::new_zeroed(0, FrameOwner::Anon, 0).unwrap();
		assert!(frame.slice::<u8>().iter().all(|b| *b == 0));
	}

	#[test_case]
	fn page_cache_insert_hit() {
		let cache = PageCache::default();
		let mut inits = 0;
		let a = cache
			.get_page(0, 0, || {
				inits += 1;
				RcFrame::new_zeroed(0, FrameOwner::Anon, 0)
			})
			.unwrap();
		let b = cache
			.get_page(0, 0, || {
				inits += 1;
				RcFrame::new_zeroed(0, FrameOwner::Anon, 0)
			})
			.unwrap();
		assert_eq!(inits, 1);
		assert_eq!(a.phys_addr(), b.phys_addr());
	}

	#[test_case]
	fn page_cache_truncate() {
		let cache = PageCache::default();
		for off in 0..4 {
			cache
				.get_page(off, 0, || RcFrame::new_zeroed(0, FrameOwner::Anon, off))
				.unwrap();
		}
		cache.truncate(2);
		assert!(cache.pages.lock().get(&0).is_some());
		assert!(cache.pages.lock().get(&2).is_none());
	}
}
