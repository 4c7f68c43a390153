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

//! The architecture MMU wrapper (AMMU): [`VMem`] exposes page table manipulation in an
//! architecture-independent way, on top of `arch::x86::paging`.
//!
//! The const parameter `KERNEL` marks the one context mapping the kernel's own address space: it
//! is never unbound while dropped (doing so would be a kernel bug, not a recoverable error) and
//! is the one every other [`VMem`] shares its top-level kernelspace tables with.

use crate::arch::x86::{
	self,
	paging::{FLAG_GLOBAL, FLAG_WRITE},
};
use crate::sync::mutex::Mutex;
use core::ptr::NonNull;
use utils::limits::PAGE_SIZE;

use crate::memory::{PhysAddr, VirtAddr};

/// A virtual memory context.
///
/// `KERNEL` is `true` for the single context that owns the kernel's own mappings, `false` for
/// every per-process address space.
pub struct VMem<const KERNEL: bool> {
	/// The root paging object.
	table: NonNull<x86::paging::Table>,
}

impl<const KERNEL: bool> VMem<KERNEL> {
	/// Creates a new virtual memory context.
	///
	/// The kernelspace half of the address space is mapped in by default, shared with every other
	/// context.
	///
	/// # Safety
	///
	/// Modifying kernel mappings might result in undefined behaviour. It is the caller's
	/// responsibility to ensure code and data (including stacks) remain accessible.
	pub unsafe fn new() -> Self {
		Self {
			table: x86::paging::alloc(),
		}
	}

	/// Returns an immutable reference to the architecture-dependent inner representation.
	pub fn inner(&self) -> &x86::paging::Table {
		unsafe { self.table.as_ref() }
	}

	/// Returns a mutable reference to the architecture-dependent inner representation.
	pub fn inner_mut(&mut self) -> &mut x86::paging::Table {
		unsafe { self.table.as_mut() }
	}

	/// Translates the given virtual address `addr` to the corresponding physical address.
	///
	/// Returns `None` if the address is not mapped.
	pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
		x86::paging::translate(self.inner(), addr)
	}

	/// Maps a single page of virtual memory at `virtaddr` to the physical page at `physaddr`.
	///
	/// `flags` is the set of architecture-dependent flags to use for the mapping.
	#[inline]
	pub fn map(&mut self, physaddr: PhysAddr, virtaddr: VirtAddr, flags: usize) {
		unsafe {
			x86::paging::map(self.inner_mut(), physaddr, virtaddr, flags);
		}
		invalidate_page(virtaddr);
	}

	/// Like [`Self::map`] but on a range of `pages` pages.
	pub fn map_range(&mut self, physaddr: PhysAddr, virtaddr: VirtAddr, pages: usize, flags: usize) {
		for i in 0..pages {
			let physaddr = physaddr + i * PAGE_SIZE;
			let virtaddr = virtaddr + i * PAGE_SIZE;
			unsafe {
				x86::paging::map(self.inner_mut(), physaddr, virtaddr, flags);
			}
		}
		invalidate_range(virtaddr, pages);
	}

	/// Unmaps a single page of virtual memory at `virtaddr`.
	#[inline]
	pub fn unmap(&mut self, virtaddr: VirtAddr) {
		unsafe {
			x86::paging::unmap(self.inner_mut(), virtaddr);
		}
		invalidate_page(virtaddr);
	}

	/// Like [`Self::unmap`] but on a range of `pages` pages.
	pub fn unmap_range(&mut self, virtaddr: VirtAddr, pages: usize) {
		for i in 0..pages {
			let virtaddr = virtaddr + i * PAGE_SIZE;
			unsafe {
				x86::paging::unmap(self.inner_mut(), virtaddr);
			}
		}
		invalidate_range(virtaddr, pages);
	}

	/// Polls and clears the dirty flag on the range of `pages` pages starting at `addr`.
	///
	/// Returns, for each mapped page in the range, its physical address and whether it was dirty
	/// since the last poll. Unmapped pages are skipped.
	pub fn poll_dirty(&self, addr: VirtAddr, pages: usize) -> impl Iterator<Item = (VirtAddr, PhysAddr, bool)> + '_ {
		(0..pages).filter_map(move |n| {
			let addr = addr + n * PAGE_SIZE;
			let (phys, dirty) = x86::paging::poll_dirty(self.inner(), addr)?;
			Some((addr, phys, dirty))
		})
	}

	/// Binds the virtual memory context to the current CPU.
	pub fn bind(&self) {
		let phys_addr = VirtAddr::from(self.table.as_ptr())
			.kernel_to_physical()
			.unwrap();
		unsafe {
			x86::paging::bind(phys_addr);
		}
	}

	/// Tells whether the context is bound to the current CPU.
	pub fn is_bound(&self) -> bool {
		x86::paging::is_bound(self.table)
	}
}

impl<const KERNEL: bool> Drop for VMem<KERNEL> {
	fn drop(&mut self) {
		if self.is_bound() {
			panic!("dropping a virtual memory context while it is bound");
		}
		unsafe {
			x86::paging::free(self.table);
		}
	}
}

/// Invalidates the page at `addr` from the TLB on the current CPU.
#[inline]
pub fn invalidate_page(addr: VirtAddr) {
	x86::paging::invlpg(addr);
}

/// Invalidates the range of `count` pages starting at `addr` on the current CPU.
pub fn invalidate_range(addr: VirtAddr, count: usize) {
	for i in 0..count {
		invalidate_page(addr + i * PAGE_SIZE);
	}
}

/// Flushes the Translation Lookaside Buffer (TLB) on the current CPU.
///
/// Expensive; only use after a batch of modifications that [`invalidate_page`]/
/// [`invalidate_range`] cannot cover precisely.
#[inline]
pub fn flush() {
	x86::paging::flush();
}

/// The kernel's virtual memory context, mapping every identity-mapped physical page plus the
/// kernel's own code and data.
///
/// SMP shootdown and ACPI/firmware memory-map discovery are external collaborators: [`init`] maps
/// the regions it is handed, and only ever runs on one core.
pub static KERNEL_VMEM: Mutex<Option<VMem<true>>, false> = Mutex::new(None);

/// Initializes the kernel's virtual memory context, identity-mapping every physical page in
/// `regions` and marking the kernel's own code read-only.
///
/// `regions` is an iterator of `(physical address, length in bytes)` usable memory spans, and
/// `code` is the `(physical address, length in bytes)` of the kernel's own `.text` section.
///
/// # Safety
///
/// Must be called exactly once, before any other core starts running, with memory map
/// information describing this very system.
pub unsafe fn init(regions: impl Iterator<Item = (PhysAddr, usize)>, code: (PhysAddr, usize)) {
	let mut kernel_vmem = unsafe { VMem::<true>::new() };
	for (addr, len) in regions {
		let Some(virt) = addr.kernel_to_virtual() else {
			continue;
		};
		kernel_vmem.map_range(addr, virt, len.div_ceil(PAGE_SIZE), FLAG_WRITE | FLAG_GLOBAL);
	}
	let (code_phys, code_len) = code;
	if let Some(code_virt) = code_phys.kernel_to_virtual() {
		kernel_vmem.map_range(code_phys, code_virt, code_len.div_ceil(PAGE_SIZE), FLAG_GLOBAL);
	}
	kernel_vmem.bind();
	*KERNEL_VMEM.lock() = Some(kernel_vmem);
}

#[cfg(test)]
mod test {
	use super::*;

	#[test_case]
	fn vmem_basic0() {
		let vmem = unsafe { VMem::<false>::new() };
		for i in (0..0x1000000).step_by(PAGE_SIZE) {
			assert_eq!(vmem.translate(VirtAddr(i)), None);
		}
	}

	#[test_case]
	fn vmem_map0() {
		let mut vmem = unsafe { VMem::<false>::new() };
		vmem.map(PhysAddr(0x100000), VirtAddr(0x100000), 0);
		for i in (0..0x1000000).step_by(PAGE_SIZE) {
			let res = vmem.translate(VirtAddr(i));
			if (0x100000..0x101000).contains(&i) {
				assert_eq!(res, Some(PhysAddr(i)));
			} else {
				assert_eq!(res, None);
			}
		}
	}

	#[test_case]
	fn vmem_map1() {
		let mut vmem = unsafe { VMem::<false>::new() };
		vmem.map(PhysAddr(0x100000), VirtAddr(0x100000), 0);
		vmem.map(PhysAddr(0x200000), VirtAddr(0x100000), 0);
		for i in (0..0x1000000).step_by(PAGE_SIZE) {
			let res = vmem.translate(VirtAddr(i));
			if (0x100000..0x101000).contains(&i) {
				assert_eq!(res, Some(PhysAddr(0x100000 + i)));
			} else {
				assert_eq!(res, None);
			}
		}
	}

	#[test_case]
	fn vmem_unmap0() {
		let mut vmem = unsafe { VMem::<false>::new() };
		vmem.map(PhysAddr(0x100000), VirtAddr(0x100000), 0);
		vmem.unmap(VirtAddr(0x100000));
		for i in (0..0x1000000).step_by(PAGE_SIZE) {
			assert_eq!(vmem.translate(VirtAddr(i)), None);
		}
	}
}
