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

//! A range is a region of virtual memory a context can access: anonymous, file-backed or a
//! direct mapping of physical memory.
//!
//! Ranges may be created at context creation (the initial brk/executable mappings) or by the
//! owning thread through the public `map`/`unmap` interface.

use super::gap::MemGap;
use crate::{
	arch::x86::paging,
	file::File,
	memory::{
		PhysAddr, VirtAddr,
		buddy::FLAG_ZONE_TYPE_USER,
		cache::{FrameOwner, RcFrame},
		vmem::VMem,
	},
	process::mem_space::{PROT_EXEC, PROT_WRITE, RANGE_FILE, RANGE_PHYSICAL, RANGE_SHARED, Page},
	sync::Spin,
};
use core::{mem, num::NonZeroUsize, ops::Range};
use utils::{
	TryClone,
	collections::vec::Vec,
	errno::{AllocResult, EResult},
	limits::PAGE_SIZE,
	ptr::arc::Arc,
};

/// Returns the physical address of the shared zero page: a single kernel-allocated, zero-filled
/// frame reused by every anonymous demand-paged range until the first write.
fn zeroed_page() -> PhysAddr {
	#[repr(align(4096))]
	struct ZeroPage(Page);
	static ZERO_PAGE: ZeroPage = ZeroPage([0; PAGE_SIZE]);
	VirtAddr::from(ZERO_PAGE.0.as_ptr())
		.kernel_to_physical()
		.unwrap()
}

/// Returns the AMMU flags to map a page with, given the range's protection.
///
/// `force_ro` strips `WRITE` regardless of `prot`: used for the zero page and for freshly
/// installed file pages, which are always mapped read-only (see [`MemMapping::map`]).
fn vmem_flags(prot: u8, force_ro: bool) -> usize {
	let mut flags = paging::FLAG_USER;
	if !force_ro && prot & PROT_WRITE != 0 {
		flags |= paging::FLAG_WRITE;
	}
	#[cfg(target_arch = "x86_64")]
	if prot & PROT_EXEC == 0 {
		flags |= paging::FLAG_XD;
	}
	flags
}

/// Allocates a fresh page, filling it with `src`'s content (or zeroes if `None`).
fn init_page(src: Option<&RcFrame>, off: u64) -> AllocResult<RcFrame> {
	let page = RcFrame::new(0, FLAG_ZONE_TYPE_USER, FrameOwner::Anon, off)?;
	unsafe {
		match src {
			Some(src) => page.slice_mut::<u8>().copy_from_slice(src.slice::<u8>()),
			None => page.slice_mut::<u8>().fill(0),
		}
	}
	Ok(page)
}

/// Clones the `range` sub-slice of `pages` into a freshly allocated vector.
fn clone_pages(pages: &[Option<RcFrame>], range: Range<usize>) -> AllocResult<Vec<Option<RcFrame>>> {
	let mut out = Vec::new();
	for page in &pages[range] {
		out.push(page.clone())?;
	}
	Ok(out)
}

/// A range of virtual memory owned by an address space.
#[derive(Debug)]
pub struct MemMapping {
	/// Address of the beginning of the range.
	pub addr: VirtAddr,
	/// The size of the range in pages.
	pub size: NonZeroUsize,
	/// MMU protection (`PROT_*`).
	pub prot: u8,
	/// The permanent subset of range flags (`RANGE_FILE`, `RANGE_SHARED`, `RANGE_PHYSICAL`).
	pub range_flags: u32,

	/// The mapped file, set iff `RANGE_FILE` is set.
	pub file: Option<Arc<File>>,
	/// The page-aligned byte offset into `file`. Only meaningful if `file` is set.
	pub off: u64,
	/// The physical base address for a `RANGE_PHYSICAL` range.
	pub phys_base: Option<PhysAddr>,

	/// The frame installed at each page of the range.
	///
	/// Unused (stays all-`None`) for `RANGE_PHYSICAL` ranges: those identity-map caller-supplied
	/// memory the range does not itself own, so there is no PMM reference to track per page.
	pub(super) pages: Spin<Vec<Option<RcFrame>>>,
}

impl MemMapping {
	/// Creates a new range.
	///
	/// `addr` must be page-aligned. `size` is in pages.
	pub(super) fn new(
		addr: VirtAddr,
		size: NonZeroUsize,
		prot: u8,
		range_flags: u32,
		file: Option<Arc<File>>,
		off: u64,
		phys_base: Option<PhysAddr>,
	) -> AllocResult<Self> {
		debug_assert!(addr.is_aligned_to(PAGE_SIZE));
		let mut pages = Vec::new();
		for _ in 0..size.get() {
			pages.push(None)?;
		}
		Ok(Self {
			addr,
			size,
			prot,
			range_flags,

			file,
			off,
			phys_base,

			pages: Spin::new(pages),
		})
	}

	/// Installs the mapping for the page at offset `offset` of the range, onto `vmem`.
	///
	/// `write` tells whether the access being resolved is a write.
	///
	/// If no underlying physical memory exists yet for this offset, the function may allocate
	/// it (anonymous ranges, or a private copy of a file/shared page under copy-on-write).
	///
	/// If a file is mapped, the page cache's content is used, populating it on a miss by calling
	/// into the v-node's own `getpage`.
	pub(super) fn map(&self, vmem: &mut VMem<false>, offset: usize, write: bool) -> EResult<()> {
		let virtaddr = self.addr + offset * PAGE_SIZE;
		if self.range_flags & RANGE_PHYSICAL != 0 {
			let phys = self.phys_base.unwrap() + offset * PAGE_SIZE;
			vmem.map(phys, virtaddr, vmem_flags(self.prot, false));
			return Ok(());
		}
		let mut pages = self.pages.lock();
		if let Some(page) = &pages[offset] {
			// A frame is already installed: either upgrade in place (shared) or COW (private).
			let shared = self.range_flags & RANGE_SHARED != 0;
			let mut phys_addr = page.phys_addr();
			if !shared && page.is_shared() {
				let page = init_page(Some(page), page.offset())?;
				phys_addr = page.phys_addr();
				pages[offset] = Some(page);
			}
			vmem.map(phys_addr, virtaddr, vmem_flags(self.prot, false));
			return Ok(());
		}
		match &self.file {
			// Anonymous mapping.
			None => {
				let phys_addr = if write {
					let page = init_page(None, offset as u64)?;
					let phys_addr = page.phys_addr();
					pages[offset] = Some(page);
					phys_addr
				} else {
					// Lazy: map the shared zero page, read-only, until the first write.
					zeroed_page()
				};
				vmem.map(phys_addr, virtaddr, vmem_flags(self.prot, !write));
			}
			// File-backed mapping, routed through the node's page cache.
			Some(file) if file.node().unwrap().is_cached() => {
				let node = file.node().unwrap();
				let file_off = self.off / PAGE_SIZE as u64 + offset as u64;
				let mut page = node
					.cache
					.get_page(file_off, 0, || node.ops.getpage(node, file_off))?;
				if self.range_flags & RANGE_SHARED == 0 {
					// Private: the page cache's frame must not be written through.
					page = init_page(Some(&page), file_off)?;
				}
				let phys_addr = page.phys_addr();
				pages[offset] = Some(page);
				// A freshly mapped file page is always installed read-only, even for a
				// writable range: the next write fault upgrades it and marks it dirty.
				vmem.map(phys_addr, virtaddr, vmem_flags(self.prot, true));
			}
			// Other v-node type (e.g. a character device): no page cache, delegate to the
			// v-node's own mmap, which installs whatever mapping it sees fit itself.
			Some(file) => {
				let node = file.node().unwrap();
				node.ops.mmap(node, virtaddr, write)?;
			}
		}
		Ok(())
	}

	/// Notifies a mapped character-device-like v-node (one with no page cache) that its currently
	/// installed pages are being torn down.
	///
	/// A no-op for anonymous, physical, and cached (regular file or block device) mappings.
	pub(super) fn notify_unmap(&self, vmem: &VMem<false>) {
		let Some(file) = &self.file else {
			return;
		};
		let node = file.node().unwrap();
		if node.is_cached() {
			return;
		}
		for i in 0..self.size.get() {
			let vaddr = self.addr + i * PAGE_SIZE;
			if vmem.translate(vaddr).is_some() {
				node.ops.munmap(node, vaddr);
			}
		}
	}

	/// Tells whether `self`, assumed to immediately precede `next`, could be coalesced into a
	/// single range with it (I2): same protection and permanent flags, and, for a `FILE` or
	/// `RANGE_PHYSICAL` range, a contiguous backing resource.
	pub(super) fn mergeable_with(&self, next: &Self) -> bool {
		if self.prot != next.prot || self.range_flags != next.range_flags {
			return false;
		}
		if self.range_flags & RANGE_FILE != 0 {
			let same_node = match (&self.file, &next.file) {
				(Some(a), Some(b)) => a.node() == b.node(),
				_ => false,
			};
			let contiguous = self.off + self.size.get() as u64 * PAGE_SIZE as u64 == next.off;
			if !same_node || !contiguous {
				return false;
			}
		}
		if self.range_flags & RANGE_PHYSICAL != 0 {
			let contiguous = matches!(
				(self.phys_base, next.phys_base),
				(Some(a), Some(b)) if a + self.size.get() * PAGE_SIZE == b
			);
			if !contiguous {
				return false;
			}
		}
		true
	}

	/// Merges `next`, which must immediately follow `self` and satisfy [`Self::mergeable_with`],
	/// into `self`.
	pub(super) fn merge(&mut self, next: Self) -> AllocResult<()> {
		debug_assert!(self.mergeable_with(&next));
		self.size = self.size.checked_add(next.size.get()).unwrap();
		let next_pages = mem::take(&mut *next.pages.lock());
		let mut pages = self.pages.lock();
		for page in next_pages {
			pages.push(page)?;
		}
		Ok(())
	}

	/// Splits the range around the `[begin, begin + size)` page interval, producing up to two
	/// remaining ranges and the gap left in between.
	///
	/// If `begin` is `0`, there is no left remainder. If `begin + size` reaches the end of the
	/// range, there is no right remainder.
	pub(super) fn split(
		&self,
		begin: usize,
		size: usize,
	) -> AllocResult<(Option<Self>, Option<MemGap>, Option<Self>)> {
		let pages = self.pages.lock();
		let prev = NonZeroUsize::new(begin)
			.map(|size| {
				Ok(Self {
					addr: self.addr,
					size,
					prot: self.prot,
					range_flags: self.range_flags,

					file: self.file.clone(),
					off: self.off,
					phys_base: self.phys_base,

					pages: Spin::new(clone_pages(&pages, 0..size.get())?),
				})
			})
			.transpose()?;
		let gap = NonZeroUsize::new(size).map(|size| MemGap::new(self.addr + begin * PAGE_SIZE, size));
		let end = begin + size;
		let next = self
			.size
			.get()
			.checked_sub(end)
			.and_then(NonZeroUsize::new)
			.map(|size| {
				Ok(Self {
					addr: self.addr + end * PAGE_SIZE,
					size,
					prot: self.prot,
					range_flags: self.range_flags,

					file: self.file.clone(),
					// The split-right file offset advances by exactly the hole's page count.
					off: self.off + (end as u64) * PAGE_SIZE as u64,
					phys_base: self.phys_base.map(|p| p + end * PAGE_SIZE),

					pages: Spin::new(clone_pages(&pages, end..self.size.get())?),
				})
			})
			.transpose()?;
		Ok((prev, gap, next))
	}

	/// Writes the range's dirty pages back to the underlying v-node.
	///
	/// Does nothing for anonymous, private, or `RANGE_PHYSICAL` ranges, or if `sync` is `false`.
	pub(super) fn sync(&self, sync: bool) -> EResult<()> {
		if !sync || self.range_flags & RANGE_SHARED == 0 || self.file.is_none() {
			return Ok(());
		}
		let pages = self.pages.lock();
		for frame in pages.iter().flatten() {
			frame.writeback()?;
		}
		Ok(())
	}
}

impl TryClone for MemMapping {
	type Error = core::alloc::AllocError;

	fn try_clone(&self) -> AllocResult<Self> {
		let pages = self.pages.lock();
		Ok(Self {
			addr: self.addr,
			size: self.size,
			prot: self.prot,
			range_flags: self.range_flags,

			file: self.file.clone(),
			off: self.off,
			phys_base: self.phys_base,

			pages: Spin::new(pages.try_clone()?),
		})
	}
}
