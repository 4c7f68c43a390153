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

//! Mutual exclusion synchronization primitive.
//!
//! [`Mutex`] keeps the type shape of a scheduler-integrated sleeping mutex (contended waiters
//! normally block instead of spinning), but the scheduler itself is an external collaborator of
//! this crate: acquiring here always spins. Code written against this API ports unchanged once a
//! real scheduler backs it.

use core::{
	cell::UnsafeCell,
	fmt,
	fmt::Formatter,
	hint,
	ops::{Deref, DerefMut},
	sync::atomic::{
		AtomicBool,
		Ordering::{Acquire, Release},
	},
};

/// Unlocks the associated [`Mutex`] when dropped.
pub struct MutexGuard<'m, T: ?Sized, const INT: bool> {
	mutex: &'m Mutex<T, INT>,
}

impl<T: ?Sized, const INT: bool> Deref for MutexGuard<'_, T, INT> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		unsafe { &*self.mutex.data.get() }
	}
}

impl<T: ?Sized, const INT: bool> DerefMut for MutexGuard<'_, T, INT> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		unsafe { &mut *self.mutex.data.get() }
	}
}

impl<T: ?Sized, const INT: bool> !Send for MutexGuard<'_, T, INT> {}

unsafe impl<T: ?Sized + Sync, const INT: bool> Sync for MutexGuard<'_, T, INT> {}

impl<T: ?Sized + fmt::Debug, const INT: bool> fmt::Debug for MutexGuard<'_, T, INT> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self.deref(), f)
	}
}

impl<T: ?Sized, const INT: bool> Drop for MutexGuard<'_, T, INT> {
	fn drop(&mut self) {
		unsafe {
			self.mutex.unlock();
		}
	}
}

/// Mutex. `INT` tells whether, once a scheduler backs this type, acquiring it would be
/// interruptible by a signal; it otherwise has no effect.
pub struct Mutex<T: ?Sized, const INT: bool> {
	locked: AtomicBool,
	data: UnsafeCell<T>,
}

impl<T: Default, const INT: bool> Default for Mutex<T, INT> {
	fn default() -> Self {
		Self::new(Default::default())
	}
}

impl<T, const INT: bool> Mutex<T, INT> {
	/// Creates a new instance wrapping the given `data`.
	pub const fn new(data: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			data: UnsafeCell::new(data),
		}
	}

	/// Acquires the mutex, consumes it and returns the inner value.
	pub fn into_inner(self) -> T {
		self.data.into_inner()
	}
}

impl<T: ?Sized, const INT: bool> Mutex<T, INT> {
	/// Releases the mutex.
	///
	/// # Safety
	///
	/// This function should not be used directly since it is called when the guard is dropped.
	///
	/// If the mutex is not locked, the behaviour is undefined.
	pub unsafe fn unlock(&self) {
		self.locked.store(false, Release);
	}

	/// Acquires the mutex.
	///
	/// If the mutex is already acquired, the caller spins until it becomes available.
	///
	/// The function returns a [`MutexGuard`] associated with `self`. When dropped, the mutex
	/// is unlocked.
	pub fn lock(&self) -> MutexGuard<T, INT> {
		while self.locked.swap(true, Acquire) {
			hint::spin_loop();
		}
		MutexGuard {
			mutex: self,
		}
	}
}

unsafe impl<T, const INT: bool> Sync for Mutex<T, INT> {}

impl<T: ?Sized + fmt::Debug, const INT: bool> fmt::Debug for Mutex<T, INT> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		let guard = self.lock();
		fmt::Debug::fmt(&*guard, f)
	}
}
