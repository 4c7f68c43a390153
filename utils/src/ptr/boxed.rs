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

//! A uniquely-owning heap pointer whose allocation can be observed to fail.

use alloc::boxed::Box as StdBox;
use core::alloc::{AllocError, Layout};
use core::fmt;
use core::mem::MaybeUninit;
use core::ops::{Deref, DerefMut};

/// A uniquely-owning pointer to a heap-allocated `T`.
pub struct Box<T: ?Sized>(StdBox<T>);

impl<T> Box<T> {
	/// Allocates space for `value` and moves it there, reporting failure instead of aborting.
	pub fn new(value: T) -> Result<Self, AllocError> {
		let layout = Layout::new::<T>();
		if layout.size() == 0 {
			return Ok(Self(StdBox::new(value)));
		}
		let mut uninit = StdBox::<MaybeUninit<T>>::try_new_uninit().map_err(|_| AllocError)?;
		uninit.write(value);
		// SAFETY: `uninit` was just fully initialized by `write`.
		let inner = unsafe {
			let raw = StdBox::into_raw(uninit) as *mut T;
			StdBox::from_raw(raw)
		};
		Ok(Self(inner))
	}

	/// Consumes this wrapper, returning the underlying standard-library `Box`.
	pub fn into_std(this: Self) -> StdBox<T> {
		this.0
	}

	/// Consumes the box, returning the owned value.
	pub fn into_inner(this: Self) -> T {
		*this.0
	}
}

impl<T: ?Sized> Deref for Box<T> {
	type Target = T;

	fn deref(&self) -> &T {
		&self.0
	}
}

impl<T: ?Sized> DerefMut for Box<T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut self.0
	}
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Box<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&*self.0, f)
	}
}
