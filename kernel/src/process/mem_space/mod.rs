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

//! A memory space is the virtual memory handler for a context (a user process or the kernel
//! itself). It holds two structures modelling the same address space: a range list, used for
//! range lookup and manipulation, and the architecture MMU table ([`VMem`]), used as a cache the
//! range list corrects on demand through page faults.
//!
//! The range list contains two kinds of entries:
//! - A mapping ([`MemMapping`]): a chunk of virtual memory backing actual (or demand-paged)
//!   content.
//! - A gap ([`MemGap`]): a chunk of virtual memory available for a new mapping.

mod gap;
mod mapping;
mod range_alloc;
mod transaction;

use crate::{
	arch::x86::{cli, is_interrupt_enabled, paging::{PAGE_FAULT_INSTRUCTION, PAGE_FAULT_WRITE}, sti},
	file::{File, vfs},
	memory::{PROCESS_END, PhysAddr, VirtAddr, cache::RcFrame, vmem::VMem},
	sync::IntMutex,
};
use core::{alloc::AllocError, cmp::min, fmt, hint::unlikely, mem, num::NonZeroUsize};
use gap::MemGap;
use mapping::MemMapping;
use transaction::MemSpaceTransaction;
use utils::{
	TryClone,
	collections::{btreemap::BTreeMap, vec::Vec},
	errno,
	errno::{AllocResult, EResult},
	limits::PAGE_SIZE,
	ptr::arc::Arc,
	range_cmp,
};

/// Page can be read.
pub const PROT_READ: u8 = 0x1;
/// Page can be written.
pub const PROT_WRITE: u8 = 0x2;
/// Page can be executed.
pub const PROT_EXEC: u8 = 0x4;

/// The range maps a v-node; `off` and `file` are meaningful.
pub const RANGE_FILE: u32 = 0x01;
/// Writes are visible through the v-node and to every other mapper of the same range.
pub const RANGE_SHARED: u32 = 0x02;
/// The range is a direct mapping of physical memory; it owns no frame reference.
pub const RANGE_PHYSICAL: u32 = 0x04;
/// Request-only: let the kernel pick the address.
pub const RANGE_ALLOCATE: u32 = 0x08;
/// Request-only: `addr` must be honored exactly, or the call fails.
pub const RANGE_EXACT: u32 = 0x10;
/// Request-only: an existing mapping overlapping `addr` is unmapped first.
pub const RANGE_REPLACE: u32 = 0x20;
/// Request-only: round `size` up to a whole page, even if it already is the unit `map` counts in.
pub const RANGE_PAGESIZE: u32 = 0x40;

/// The subset of range flags that survives into the stored descriptor; the rest only affects the
/// policy `map` follows to place the range.
const RANGE_PERMANENT_MASK: u32 = RANGE_FILE | RANGE_SHARED | RANGE_PHYSICAL;

/// Type representing a memory page.
pub type Page = [u8; PAGE_SIZE];

/// Tells whether the `[addr, addr + n)` range lies entirely in valid userspace.
pub fn bound_check(addr: usize, n: usize) -> bool {
	addr >= PAGE_SIZE && addr.saturating_add(n) <= PROCESS_END.0
}

/// Removes gaps in `transaction`'s state over `[start, start + size * PAGE_SIZE)`, splitting the
/// gaps at the boundary as needed. Used to clear room for a `RANGE_EXACT` mapping.
fn remove_gaps_in_range(
	transaction: &mut MemSpaceTransaction,
	start: VirtAddr,
	size: usize,
) -> AllocResult<()> {
	let search_start = transaction
		.state
		.get_gap_for_addr(start)
		.map(MemGap::get_begin)
		.unwrap_or(start);
	let end = start + size * PAGE_SIZE;
	let mut gaps = Vec::new();
	for (begin, gap) in transaction.state.gaps.iter() {
		if *begin >= search_start && *begin < end {
			gaps.push(gap.clone())?;
		}
	}
	for gap in gaps {
		let gap_begin = gap.get_begin();
		let gap_end = gap.get_end();
		let off = start.0.saturating_sub(gap_begin.0) / PAGE_SIZE;
		let clamp_end = end.0.clamp(gap_begin.0, gap_end.0) / PAGE_SIZE;
		let (prev, next) = gap.consume(off, clamp_end - off);
		transaction.remove_gap(gap_begin)?;
		if let Some(g) = prev {
			transaction.insert_gap(g)?;
		}
		if let Some(g) = next {
			transaction.insert_gap(g)?;
		}
	}
	Ok(())
}

/// Inner state of a memory space: the model the MMU table is kept in sync with.
#[derive(Default, Debug)]
struct MemSpaceState {
	/// The list of free spans, ready for a new mapping. Keyed by beginning address.
	gaps: BTreeMap<VirtAddr, MemGap>,
	/// The list of mappings. Keyed by beginning address.
	mappings: BTreeMap<VirtAddr, MemMapping>,

	/// The initial pointer for the `[s]brk` system calls.
	brk_init: VirtAddr,
	/// The current pointer for the `[s]brk` system calls.
	brk: VirtAddr,

	/// The number of virtual memory pages in use.
	vmem_usage: usize,
}

impl MemSpaceState {
	/// Returns a gap of at least `size` pages, if any.
	fn get_gap(&self, size: NonZeroUsize) -> Option<&MemGap> {
		self.gaps.iter().map(|(_, g)| g).find(|g| g.get_size() >= size)
	}

	/// Returns the gap containing `addr`, if any.
	fn get_gap_for_addr(&self, addr: VirtAddr) -> Option<&MemGap> {
		self.gaps.cmp_get(|key, value| {
			range_cmp(key.0 as u64, value.get_size().get() as u64 * PAGE_SIZE as u64, addr.0 as u64)
		})
	}

	/// Returns the mapping containing `addr`, if any.
	fn get_mapping_for_addr(&self, addr: VirtAddr) -> Option<&MemMapping> {
		self.mappings.cmp_get(|key, value| {
			range_cmp(key.0 as u64, value.size.get() as u64 * PAGE_SIZE as u64, addr.0 as u64)
		})
	}

	/// Returns the mapping containing `addr`, if any, mutably.
	fn get_mut_mapping_for_addr(&mut self, addr: VirtAddr) -> Option<&mut MemMapping> {
		self.mappings.cmp_get_mut(|key, value| {
			range_cmp(key.0 as u64, value.size.get() as u64 * PAGE_SIZE as u64, addr.0 as u64)
		})
	}
}

impl TryClone for MemSpaceState {
	type Error = AllocError;

	fn try_clone(&self) -> AllocResult<Self> {
		Ok(Self {
			gaps: self.gaps.try_clone()?,
			mappings: self.mappings.try_clone()?,

			brk_init: self.brk_init,
			brk: self.brk,

			vmem_usage: self.vmem_usage,
		})
	}
}

/// Executable program information attached to a memory space.
#[derive(Clone)]
pub struct ExeInfo {
	/// The v-node of the program loaded on this memory space.
	pub exe: Arc<vfs::Entry>,

	/// Address of the beginning of the program's argument vector.
	pub argv_begin: VirtAddr,
	/// Address of the end of the program's argument vector.
	pub argv_end: VirtAddr,
	/// Address of the beginning of the program's environment.
	pub envp_begin: VirtAddr,
	/// Address of the end of the program's environment.
	pub envp_end: VirtAddr,
}

/// A virtual address space: a process's, or the kernel's own.
pub struct MemSpace {
	/// The range list, used as the model for `vmem`.
	state: IntMutex<MemSpaceState>,
	/// The architecture MMU table.
	///
	/// Used as a cache which may lag the range list; a page fault corrects it on demand.
	vmem: IntMutex<VMem<false>>,

	/// Information about the executable loaded on this memory space.
	pub exe_info: ExeInfo,
}

/// The memory space currently bound on this core.
///
/// The scheduler would normally own a per-CPU "current context" slot; it is an external
/// collaborator out of scope for this crate, so this global stands in for it.
static CURRENT: IntMutex<Option<Arc<MemSpace>>> = IntMutex::new(None);

impl MemSpace {
	/// Creates a new, empty memory space for `exe`.
	pub fn new(exe: Arc<vfs::Entry>) -> AllocResult<Arc<Self>> {
		let s = Self {
			state: Default::default(),
			vmem: IntMutex::new(unsafe { VMem::new() }),

			exe_info: ExeInfo {
				exe,

				argv_begin: Default::default(),
				argv_end: Default::default(),
				envp_begin: Default::default(),
				envp_end: Default::default(),
			},
		};
		let begin = VirtAddr(PAGE_SIZE);
		let end = PROCESS_END;
		let size = (end.0 - begin.0) / PAGE_SIZE;
		let gap = MemGap::new(begin, NonZeroUsize::new(size).unwrap());
		{
			let state = s.state.lock();
			let vmem = s.vmem.lock();
			let mut transaction = MemSpaceTransaction::new(state, vmem);
			transaction.insert_gap(gap)?;
			transaction.commit();
		}
		Arc::new(s)
	}

	/// Returns the number of virtual memory pages in use.
	#[inline]
	pub fn get_vmem_usage(&self) -> usize {
		self.state.lock().vmem_usage
	}

	/// Shared implementation for [`Self::map`] and [`Self::map_special`]/`brk`: places a new
	/// mapping per `range_flags`, without installing any page.
	fn map_impl(
		transaction: &mut MemSpaceTransaction,
		addr: VirtAddr,
		size: NonZeroUsize,
		prot: u8,
		range_flags: u32,
		file: Option<Arc<File>>,
		off: u64,
		phys_base: Option<PhysAddr>,
	) -> EResult<MemMapping> {
		if unlikely(!addr.is_aligned_to(PAGE_SIZE)) {
			return Err(errno::errno!(EINVAL));
		}
		let stored_flags = range_flags & RANGE_PERMANENT_MASK;
		if range_flags & RANGE_EXACT == 0 {
			// Use `addr` as a hint if it fits in the gap it lands in; otherwise, search.
			let (gap, gap_off) = transaction
				.state
				.get_gap_for_addr(addr)
				.and_then(|gap| {
					let off = gap.get_page_offset_for(addr);
					let end = off.checked_add(size.get())?;
					(end <= gap.get_size().get()).then_some((gap.clone(), off))
				})
				.or_else(|| {
					let gap = transaction.state.get_gap(size)?;
					Some((gap.clone(), 0))
				})
				.ok_or(AllocError)?;
			let (left_gap, right_gap) = gap.consume(gap_off, size.get());
			transaction.remove_gap(gap.get_begin())?;
			if let Some(g) = left_gap {
				transaction.insert_gap(g)?;
			}
			if let Some(g) = right_gap {
				transaction.insert_gap(g)?;
			}
			let addr = gap.get_begin() + gap_off * PAGE_SIZE;
			Ok(MemMapping::new(addr, size, prot, stored_flags, file, off, phys_base)?)
		} else {
			if range_flags & RANGE_REPLACE != 0 {
				Self::unmap_impl(transaction, addr, size, true)?;
			}
			remove_gaps_in_range(transaction, addr, size.get())?;
			Ok(MemMapping::new(addr, size, prot, stored_flags, file, off, phys_base)?)
		}
	}

	/// Maps a chunk of memory.
	///
	/// `size` is in pages. `range_flags` is a combination of the `RANGE_*` constants: exactly one
	/// of `RANGE_ALLOCATE`, `RANGE_EXACT` or `RANGE_REPLACE` selects the placement policy.
	/// `phys_base` is the physical base address for a `RANGE_PHYSICAL` range; ignored otherwise.
	///
	/// The underlying physical memory is not allocated eagerly for `FILE` or purely anonymous
	/// ranges: it is demand-paged on the first access.
	pub fn map(
		&self,
		addr: VirtAddr,
		size: NonZeroUsize,
		prot: u8,
		range_flags: u32,
		file: Option<Arc<File>>,
		off: u64,
		phys_base: Option<PhysAddr>,
	) -> EResult<VirtAddr> {
		let state = self.state.lock();
		let vmem = self.vmem.lock();
		let mut transaction = MemSpaceTransaction::new(state, vmem);
		let map = Self::map_impl(&mut transaction, addr, size, prot, range_flags, file, off, phys_base)?;
		let addr = map.addr;
		transaction.insert_mapping(map)?;
		transaction.commit();
		Ok(addr)
	}

	/// Maps a chunk of memory pre-populated with `pages`, eagerly installing every page. Used for
	/// kernel-special mappings the caller already owns frames for.
	pub fn map_special(&self, prot: u8, range_flags: u32, pages: &[RcFrame]) -> AllocResult<VirtAddr> {
		let Some(len) = NonZeroUsize::new(pages.len()) else {
			return Err(AllocError);
		};
		let state = self.state.lock();
		let vmem = self.vmem.lock();
		let mut transaction = MemSpaceTransaction::new(state, vmem);
		let map = Self::map_impl(
			&mut transaction,
			VirtAddr::default(),
			len,
			prot,
			range_flags | RANGE_ALLOCATE,
			None,
			0,
			None,
		)
		.map_err(|_| AllocError)?;
		{
			let mut map_pages = map.pages.lock();
			for (dst, src) in map_pages.iter_mut().zip(pages.iter().cloned()) {
				*dst = Some(src);
			}
		}
		let addr = map.addr;
		transaction.insert_mapping(map)?;
		transaction.commit();
		Ok(addr)
	}

	/// Shared implementation for [`Self::unmap`] and `brk`'s shrink path.
	///
	/// If `nogap` is `true`, no gap is created in place of the removed mappings (the caller will
	/// either replace them immediately, or intentionally shrink the address space).
	fn unmap_impl(
		transaction: &mut MemSpaceTransaction,
		addr: VirtAddr,
		size: NonZeroUsize,
		nogap: bool,
	) -> EResult<()> {
		let mut i = 0;
		while i < size.get() {
			let page_addr = addr + i * PAGE_SIZE;
			let Some(mapping) = transaction.state.get_mapping_for_addr(page_addr) else {
				i += 1;
				continue;
			};
			let mapping_begin = mapping.addr;
			let inner_off = (page_addr.0 - mapping_begin.0) / PAGE_SIZE;
			let pages = min(size.get() - i, mapping.size.get() - inner_off);
			i += pages;
			let (prev, gap, next) = mapping.split(inner_off, pages)?;
			transaction.remove_mapping(mapping_begin)?;
			if let Some(m) = prev {
				transaction.insert_mapping(m)?;
			}
			if let Some(m) = next {
				transaction.insert_mapping(m)?;
			}
			if nogap {
				continue;
			}
			if let Some(mut gap) = gap {
				let prev_gap = (!gap.get_begin().is_null())
					.then(|| {
						let prev_gap_ptr = gap.get_begin() - 1;
						transaction.state.get_gap_for_addr(prev_gap_ptr)
					})
					.flatten()
					.cloned();
				if let Some(p) = prev_gap {
					transaction.remove_gap(p.get_begin())?;
					gap.merge(&p);
				}
				let next_gap = transaction.state.get_gap_for_addr(gap.get_end()).cloned();
				if let Some(n) = next_gap {
					transaction.remove_gap(n.get_begin())?;
					gap.merge(&n);
				}
				transaction.insert_gap(gap)?;
			}
		}
		Ok(())
	}

	/// Unmaps `[addr, addr + size * PAGE_SIZE)`.
	///
	/// Every mapping overlapping the range is split or removed as needed; pages are torn down and
	/// released (unless shared by another mapping, or `RANGE_PHYSICAL`). After this call, the
	/// range is revoked: a subsequent access faults.
	pub fn unmap(&self, addr: VirtAddr, size: NonZeroUsize) -> EResult<()> {
		if unlikely(!addr.is_aligned_to(PAGE_SIZE)) {
			return Err(errno::errno!(EINVAL));
		}
		let state = self.state.lock();
		let vmem = self.vmem.lock();
		let mut transaction = MemSpaceTransaction::new(state, vmem);
		Self::unmap_impl(&mut transaction, addr, size, false)?;
		transaction.commit();
		Ok(())
	}

	/// Binds the memory space's table to the current CPU and records it as the current context.
	pub fn bind(this: &Arc<Self>) {
		this.vmem.lock().bind();
		*CURRENT.lock() = Some(this.clone());
	}

	/// Temporarily switches to `this` to execute `f`, then restores the previously bound space.
	///
	/// Interrupts are disabled for the duration: were the scheduler to preempt this thread while
	/// `this` is bound, it might resume this thread on another core still expecting its own
	/// context.
	///
	/// # Safety
	///
	/// The caller must ensure that the stack is accessible in both the current and `this`'s
	/// virtual memory contexts.
	pub unsafe fn switch<F: FnOnce() -> T, T>(this: &Arc<Self>, f: F) -> T {
		let restore = is_interrupt_enabled();
		cli();
		this.vmem.lock().bind();
		let old = CURRENT.lock().replace(this.clone());
		let res = f();
		if let Some(old) = &old {
			old.vmem.lock().bind();
		}
		*CURRENT.lock() = old;
		if restore {
			sti();
		}
		res
	}

	/// Clones the memory space for context forking.
	///
	/// Mappings are duplicated with their page references (bumping each frame's refcount, the
	/// copy-on-write precondition); the source's MMU table is then unmapped over those ranges so
	/// both sides re-fault and reinstall their pages non-writable.
	pub fn fork(&self) -> EResult<MemSpace> {
		let state = self.state.lock();
		let mut vmem = self.vmem.lock();
		let mappings = state.mappings.try_clone()?;
		for (_, m) in state.mappings.iter() {
			vmem.unmap_range(m.addr, m.size.get());
		}
		Ok(Self {
			state: IntMutex::new(MemSpaceState {
				gaps: state.gaps.try_clone()?,
				mappings,

				brk_init: state.brk_init,
				brk: state.brk,

				vmem_usage: state.vmem_usage,
			}),
			vmem: IntMutex::new(unsafe { VMem::new() }),

			exe_info: self.exe_info.clone(),
		})
	}

	/// Sets the initial pointer for the `[s]brk` system calls.
	///
	/// Must be called only once, before the program starts running. `addr` must be page-aligned.
	pub fn set_brk_init(&self, addr: VirtAddr) {
		debug_assert!(addr.is_aligned_to(PAGE_SIZE));
		let mut state = self.state.lock();
		state.brk_init = addr;
		state.brk = addr;
	}

	/// Performs the `brk` system call: grows or shrinks the heap to end at `addr`.
	///
	/// On failure, does nothing and returns the current break address.
	pub fn brk(&self, addr: VirtAddr) -> VirtAddr {
		let state = self.state.lock();
		let vmem = self.vmem.lock();
		let mut transaction = MemSpaceTransaction::new(state, vmem);
		let old = transaction.state.brk;
		if addr >= old {
			if unlikely(addr > PROCESS_END) {
				return old;
			}
			let begin = old.align_to(PAGE_SIZE);
			let pages = (addr.0 - begin.0).div_ceil(PAGE_SIZE);
			let Some(pages) = NonZeroUsize::new(pages) else {
				return old;
			};
			let res = Self::map_impl(
				&mut transaction,
				begin,
				pages,
				PROT_READ | PROT_WRITE | PROT_EXEC,
				RANGE_EXACT,
				None,
				0,
				None,
			)
			.and_then(|map| Ok(transaction.insert_mapping(map)?));
			if res.is_err() {
				return old;
			}
		} else {
			if unlikely(addr < transaction.state.brk_init) {
				return old;
			}
			let begin = addr.align_to(PAGE_SIZE);
			let pages = (begin.0 - addr.0).div_ceil(PAGE_SIZE);
			let Some(pages) = NonZeroUsize::new(pages) else {
				return old;
			};
			if Self::unmap_impl(&mut transaction, begin, pages, true).is_err() {
				return old;
			}
		}
		transaction.state.brk = addr;
		transaction.commit();
		addr
	}

	/// Synchronizes the dirty pages of every mapping in `[addr, addr + pages * PAGE_SIZE)` back to
	/// their v-node.
	pub fn sync(&self, addr: VirtAddr, pages: usize, sync: bool) -> EResult<()> {
		let state = self.state.lock();
		let mut i = 0;
		while i < pages {
			let mapping = state.get_mapping_for_addr(addr + i * PAGE_SIZE).ok_or(AllocError)?;
			mapping.sync(sync)?;
			i += mapping.size.get();
		}
		Ok(())
	}

	/// Resolves a page fault at `addr`.
	///
	/// `code` is the architecture page-fault error code. Returns `true` if the fault was
	/// resolved and the faulting instruction may be retried, `false` if the access was actually
	/// invalid (the caller should deliver `SIGSEGV`).
	pub fn handle_page_fault(&self, addr: VirtAddr, code: u32) -> EResult<bool> {
		let mut state = self.state.lock();
		let mut vmem = self.vmem.lock();
		let Some(mapping) = state.get_mut_mapping_for_addr(addr) else {
			return Ok(false);
		};
		let write = code & PAGE_FAULT_WRITE != 0;
		if unlikely(write && mapping.prot & PROT_WRITE == 0) {
			return Ok(false);
		}
		if unlikely(code & PAGE_FAULT_INSTRUCTION != 0 && mapping.prot & PROT_EXEC == 0) {
			return Ok(false);
		}
		let page_offset = (addr.0 - mapping.addr.0) / PAGE_SIZE;
		mapping.map(&mut vmem, page_offset, write)?;
		Ok(true)
	}
}

impl fmt::Debug for MemSpace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&self.state, f)
	}
}

impl Drop for MemSpace {
	fn drop(&mut self) {
		let mut state = self.state.lock();
		let vmem = self.vmem.lock();
		let mappings = mem::take(&mut state.mappings);
		for (_, m) in mappings {
			// Best-effort: errors writing back on teardown are not actionable.
			let _ = m.sync(true);
			m.notify_unmap(&vmem);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::file::{
		fs::{FileType, NodeOps, Stat},
		perm::{Gid, Uid},
		vfs::node::Node,
	};
	use alloc::boxed::Box;

	#[test_case]
	fn bound_check_rejects_null_page() {
		assert!(!bound_check(0, 1));
		assert!(bound_check(PAGE_SIZE, 1));
	}

	/// A v-node with no storage behind it: only good enough to stand in for the executable a
	/// test [`MemSpace`] is attached to.
	struct NoOps;

	impl NodeOps for NoOps {
		fn getattr(&self, _node: &Node) -> EResult<Stat> {
			Ok(Stat {
				file_type: FileType::Regular,
				mode: 0o755,
				uid: 0 as Uid,
				gid: 0 as Gid,
				size: 0,
				nlink: 1,
			})
		}

		fn setattr(&self, _node: &Node, _mode: Option<u16>, _uid: Option<Uid>) -> EResult<()> {
			Ok(())
		}

		fn resize(&self, _node: &Node, _new_size: u64) -> EResult<()> {
			Ok(())
		}

		fn read(&self, _node: &Node, _off: u64, _buf: &mut [u8]) -> EResult<usize> {
			Ok(0)
		}

		fn write(&self, _node: &Node, _off: u64, _buf: &[u8]) -> EResult<usize> {
			Ok(0)
		}

		fn poll(&self, _node: &Node, mask: u32) -> EResult<u32> {
			Ok(mask)
		}

		fn sync(&self, _node: &Node) -> EResult<()> {
			Ok(())
		}

		fn ioctl(&self, _node: &Node, _request: u32, _arg: usize) -> EResult<usize> {
			Err(errno::errno!(ENOTTY))
		}

		fn mmap(&self, _node: &Node, _addr: VirtAddr, _write: bool) -> EResult<()> {
			Ok(())
		}

		fn munmap(&self, _node: &Node, _addr: VirtAddr) {}

		fn getpage(&self, _node: &Node, _off: u64) -> EResult<RcFrame> {
			Err(errno::errno!(ENXIO))
		}

		fn putpage(&self, _node: &Node, _frame: &RcFrame) -> EResult<()> {
			Ok(())
		}
	}

	fn test_space() -> Arc<MemSpace> {
		let node = Arc::new(Node::new(FileType::Regular, Box::new(NoOps), 0)).unwrap();
		let entry = Arc::new(vfs::Entry::new(node)).unwrap();
		MemSpace::new(entry).unwrap()
	}

	#[test_case]
	fn new_space_has_one_gap_spanning_the_user_range() {
		let space = test_space();
		let state = space.state.lock();
		assert_eq!(state.gaps.len(), 1);
		assert_eq!(state.mappings.len(), 0);
		let (begin, gap) = state.gaps.iter().next().unwrap();
		assert_eq!(*begin, VirtAddr(PAGE_SIZE));
		assert_eq!(gap.get_end(), PROCESS_END);
	}

	#[test_case]
	fn anonymous_map_then_unmap_is_balanced_and_coalesces() {
		let space = test_space();
		let addr = space
			.map(VirtAddr::default(), NonZeroUsize::new(4).unwrap(), PROT_READ | PROT_WRITE, RANGE_ALLOCATE, None, 0, None)
			.unwrap();
		assert_eq!(space.get_vmem_usage(), 4);
		{
			let state = space.state.lock();
			assert_eq!(state.mappings.len(), 1);
			// One mapping carved a hole out of the initial gap: at most two gaps remain.
			assert!(state.gaps.len() <= 2);
		}
		space.unmap(addr, NonZeroUsize::new(4).unwrap()).unwrap();
		assert_eq!(space.get_vmem_usage(), 0);
		let state = space.state.lock();
		assert_eq!(state.mappings.len(), 0);
		// Gap coalescing (P2) must have merged the freed span back into a single gap. Mapping-level
		// coalescing (I2) is exercised separately by `adjacent_anonymous_mappings_coalesce`.
		assert_eq!(state.gaps.len(), 1);
		let (begin, gap) = state.gaps.iter().next().unwrap();
		assert_eq!(*begin, VirtAddr(PAGE_SIZE));
		assert_eq!(gap.get_end(), PROCESS_END);
	}

	#[test_case]
	fn adjacent_anonymous_mappings_coalesce() {
		let space = test_space();
		let addr = VirtAddr(0x300_000);
		let size = NonZeroUsize::new(2).unwrap();
		space.map(addr, size, PROT_READ | PROT_WRITE, RANGE_EXACT, None, 0, None).unwrap();
		let addr2 = addr + 2 * PAGE_SIZE;
		space.map(addr2, size, PROT_READ | PROT_WRITE, RANGE_EXACT, None, 0, None).unwrap();
		let state = space.state.lock();
		// Two adjacent ranges with identical protection and flags merge into one (I2/P2), rather
		// than staying two separate mappings forever.
		assert_eq!(state.mappings.len(), 1);
		let mapping = state.mappings.get(&addr).unwrap();
		assert_eq!(mapping.size.get(), 4);
	}

	#[test_case]
	fn page_fault_denies_write_on_read_only_mapping() {
		let space = test_space();
		let addr = space
			.map(VirtAddr::default(), NonZeroUsize::new(1).unwrap(), PROT_READ, RANGE_ALLOCATE, None, 0, None)
			.unwrap();
		let resolved = space.handle_page_fault(addr, PAGE_FAULT_WRITE).unwrap();
		assert!(!resolved);
	}

	#[test_case]
	fn fork_shares_frames_until_the_first_write() {
		let space = test_space();
		let addr = space
			.map(VirtAddr::default(), NonZeroUsize::new(1).unwrap(), PROT_READ | PROT_WRITE, RANGE_ALLOCATE, None, 0, None)
			.unwrap();
		// Demand-page the parent's frame in before forking (a read fault would only install the
		// shared zero page, never recorded in `pages`).
		space.handle_page_fault(addr, PAGE_FAULT_WRITE).unwrap();
		let child = space.fork().unwrap();
		{
			let parent_state = space.state.lock();
			let child_state = child.state.lock();
			let parent_frame = parent_state.get_mapping_for_addr(addr).unwrap().pages.lock()[0].clone();
			let child_frame = child_state.get_mapping_for_addr(addr).unwrap().pages.lock()[0].clone();
			// The same physical frame backs both sides until either writes (P5's COW precondition).
			assert_eq!(parent_frame.unwrap().phys_addr(), child_frame.unwrap().phys_addr());
		}
		// A write on the child's side must copy-on-write rather than write through the frame still
		// shared with the parent (P5).
		child.handle_page_fault(addr, PAGE_FAULT_WRITE).unwrap();
		let parent_state = space.state.lock();
		let child_state = child.state.lock();
		let parent_frame = parent_state.get_mapping_for_addr(addr).unwrap().pages.lock()[0].clone();
		let child_frame = child_state.get_mapping_for_addr(addr).unwrap().pages.lock()[0].clone();
		assert_ne!(parent_frame.unwrap().phys_addr(), child_frame.unwrap().phys_addr());
	}

	#[test_case]
	fn exact_replace_swaps_the_mapping_in_place() {
		let space = test_space();
		let addr = VirtAddr(0x100_000);
		let size = NonZeroUsize::new(2).unwrap();
		space.map(addr, size, PROT_READ | PROT_WRITE, RANGE_EXACT, None, 0, None).unwrap();
		space.map(addr, size, PROT_READ, RANGE_REPLACE | RANGE_EXACT, None, 0, None).unwrap();
		let state = space.state.lock();
		assert_eq!(state.mappings.len(), 1);
		let mapping = state.mappings.get(&addr).unwrap();
		assert_eq!(mapping.prot, PROT_READ);
		assert_eq!(space.get_vmem_usage(), 2);
	}
}
