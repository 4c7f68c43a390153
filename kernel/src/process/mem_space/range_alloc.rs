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

//! The range allocator (RA): a slab allocator handing out fixed-size range descriptors
//! ([`MemGap`](super::gap::MemGap), [`MemMapping`](super::mapping::MemMapping)) from whole
//! physical pages.
//!
//! Each slab is one kernel page: a header (free count, first-free hint, pointer to the next
//! slab, a lock) followed by a flat array of slots. A slot is either free or holds one live `T`.
//! Allocation locks the first slab with room, takes the hint slot (linearly searching forward
//! for the first free one), and returns it; if every existing slab is full, a new one is
//! allocated from the PMM and linked after the last.
//!
//! There is one allocator instance per descriptor type, shared by every address space: range
//! descriptors are kernel-wide state, not per-space.

use crate::{memory::buddy, sync::IntMutex};
use core::{
	marker::PhantomData,
	mem::{MaybeUninit, size_of},
	ops::{Deref, DerefMut},
	ptr, ptr::NonNull,
};
use utils::{errno::AllocResult, limits::PAGE_SIZE};

struct Slot<T> {
	used: bool,
	value: MaybeUninit<T>,
}

struct SlabHeader<T> {
	free_count: usize,
	first_free: usize,
	next: Option<NonNull<SlabHeader<T>>>,
	_marker: PhantomData<T>,
}

impl<T> SlabHeader<T> {
	/// The number of slots a slab page can hold after the header.
	const SLOTS: usize = (PAGE_SIZE - size_of::<SlabHeader<T>>()) / size_of::<Slot<T>>();

	/// Returns a pointer to the slab's slot array.
	fn slots(this: NonNull<Self>) -> NonNull<Slot<T>> {
		unsafe { this.add(1).cast() }
	}
}

/// A slab-backed allocator of fixed-size `T` descriptors.
pub struct RangeAllocator<T> {
	first_slab: IntMutex<Option<NonNull<SlabHeader<T>>>>,
}

unsafe impl<T: Send> Send for RangeAllocator<T> {}
unsafe impl<T: Send> Sync for RangeAllocator<T> {}

impl<T> RangeAllocator<T> {
	/// Creates a new, empty allocator. No slab is allocated until the first [`Self::alloc`].
	pub const fn new() -> Self {
		Self {
			first_slab: IntMutex::new(None),
		}
	}

	/// Allocates a new slab page and links it after `tail`. Returns the new slab.
	fn new_slab(tail: Option<NonNull<SlabHeader<T>>>) -> AllocResult<NonNull<SlabHeader<T>>> {
		let mut page = buddy::alloc_kernel(0)?.cast::<SlabHeader<T>>();
		unsafe {
			page.write(SlabHeader {
				free_count: SlabHeader::<T>::SLOTS,
				first_free: 0,
				next: None,
				_marker: PhantomData,
			});
			let slots = SlabHeader::slots(page);
			for i in 0..SlabHeader::<T>::SLOTS {
				slots.add(i).as_ptr().write(Slot {
					used: false,
					value: MaybeUninit::uninit(),
				});
			}
			if let Some(mut tail) = tail {
				tail.as_mut().next = Some(page);
			}
		}
		Ok(page)
	}

	/// Allocates and initializes a new descriptor holding `value`.
	pub fn alloc(&self, value: T) -> AllocResult<RangeBox<T>> {
		let mut head = self.first_slab.lock();
		let mut slab = match *head {
			Some(s) => s,
			None => {
				let s = Self::new_slab(None)?;
				*head = Some(s);
				s
			}
		};
		loop {
			let header = unsafe { slab.as_mut() };
			if header.free_count > 0 {
				let slots = SlabHeader::slots(slab);
				let mut idx = header.first_free;
				while unsafe { slots.add(idx).as_ref().used } {
					idx += 1;
				}
				unsafe {
					let slot = slots.add(idx).as_mut();
					slot.used = true;
					slot.value.write(value);
				}
				header.free_count -= 1;
				header.first_free = idx + 1;
				return Ok(RangeBox {
					slot: unsafe { slots.add(idx) },
					_marker: PhantomData,
				});
			}
			match header.next {
				Some(next) => slab = next,
				None => {
					let new_slab = Self::new_slab(Some(slab))?;
					unsafe {
						slab.as_mut().next = Some(new_slab);
					}
					slab = new_slab;
				}
			}
		}
	}

	/// Frees the slot backing `ptr`, dropping its value.
	///
	/// # Safety
	///
	/// `ptr` must have been returned by this same allocator and not already freed.
	unsafe fn free(&self, ptr: NonNull<Slot<T>>) {
		let page = (ptr.as_ptr() as usize) & !(PAGE_SIZE - 1);
		let mut header = NonNull::new(page as *mut SlabHeader<T>).unwrap();
		let slots = SlabHeader::slots(header);
		let idx = unsafe { ptr.offset_from(slots) } as usize;
		unsafe {
			let slot = ptr.as_mut();
			debug_assert!(slot.used);
			ptr::drop_in_place(slot.value.as_mut_ptr());
			slot.used = false;
		}
		let header = unsafe { header.as_mut() };
		header.free_count += 1;
		header.first_free = header.first_free.min(idx);
	}
}

impl<T> Default for RangeAllocator<T> {
	fn default() -> Self {
		Self::new()
	}
}

/// An owned range descriptor allocated from a [`RangeAllocator`].
pub struct RangeBox<T> {
	slot: NonNull<Slot<T>>,
	_marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for RangeBox<T> {}

impl<T> RangeBox<T> {
	/// Returns the allocator this descriptor must be freed through.
	fn allocator() -> &'static RangeAllocator<T>
	where
		T: Descriptor,
	{
		T::allocator()
	}
}

/// Implemented by the two descriptor kinds to name their global [`RangeAllocator`].
pub trait Descriptor: Sized {
	/// Returns the global allocator for this descriptor kind.
	fn allocator() -> &'static RangeAllocator<Self>;
}

impl<T> Deref for RangeBox<T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { self.slot.as_ref().value.assume_init_ref() }
	}
}

impl<T> DerefMut for RangeBox<T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { self.slot.as_mut().value.assume_init_mut() }
	}
}

impl<T: Descriptor> Drop for RangeBox<T> {
	fn drop(&mut self) {
		unsafe {
			Self::allocator().free(self.slot);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[derive(Debug, PartialEq, Eq)]
	struct Dummy(usize);

	static ALLOC: RangeAllocator<Dummy> = RangeAllocator::new();

	impl Descriptor for Dummy {
		fn allocator() -> &'static RangeAllocator<Dummy> {
			&ALLOC
		}
	}

	#[test_case]
	fn range_alloc_basic() {
		let a = ALLOC.alloc(Dummy(1)).unwrap();
		let b = ALLOC.alloc(Dummy(2)).unwrap();
		assert_eq!(*a, Dummy(1));
		assert_eq!(*b, Dummy(2));
	}

	#[test_case]
	fn range_alloc_reuse_after_free() {
		let many: utils::collections::vec::Vec<_> = (0..(PAGE_SIZE / size_of::<Slot<Dummy>>() + 8))
			.map(|i| ALLOC.alloc(Dummy(i)).unwrap())
			.collect();
		drop(many);
		let a = ALLOC.alloc(Dummy(42)).unwrap();
		assert_eq!(*a, Dummy(42));
	}
}
