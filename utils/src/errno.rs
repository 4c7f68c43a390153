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

//! POSIX-flavored error codes and the fallible-operation result types built on top of them.

use core::alloc::AllocError;
use core::fmt;

/// An error code, modeled after the POSIX `errno` values relevant to this kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(i32)]
pub enum Errno {
	/// Operation not permitted.
	EPERM = 1,
	/// No such file or directory.
	ENOENT = 2,
	/// Interrupted system call.
	EINTR = 4,
	/// I/O error.
	EIO = 5,
	/// Bad file descriptor.
	EBADF = 9,
	/// Resource temporarily unavailable.
	EAGAIN = 11,
	/// Out of memory.
	ENOMEM = 12,
	/// Permission denied.
	EACCES = 13,
	/// Bad address.
	EFAULT = 14,
	/// Device or resource busy.
	EBUSY = 16,
	/// File exists.
	EEXIST = 17,
	/// Not a directory.
	ENOTDIR = 20,
	/// Is a directory.
	EISDIR = 21,
	/// Invalid argument.
	EINVAL = 22,
	/// No space left on device.
	ENOSPC = 28,
	/// Invalid seek (past the end of a device/file that does not support it).
	ESPIPE = 29,
	/// Device does not support the requested I/O control.
	ENOTTY = 25,
	/// No such device or address (e.g. a hole in a sparse file mapped as shared).
	ENXIO = 6,
	/// Function not implemented.
	ENOSYS = 38,
	/// Operation caused a bus error (used to turn an I/O failure into `SIGBUS` at a page fault).
	EBUSFAULT = 1000,
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{self:?}")
	}
}

/// Builds an [`Errno`] wrapped for use with `?`-propagation through [`EResult`].
///
/// ```ignore
/// return Err(errno!(ENOMEM));
/// ```
#[macro_export]
macro_rules! errno {
	($variant:ident) => {
		$crate::errno::Errno::$variant
	};
}

/// The result of an operation which can fail with an [`Errno`].
pub type EResult<T> = Result<T, Errno>;

/// The result of an operation which can only fail because of memory exhaustion.
pub type AllocResult<T> = Result<T, AllocError>;

impl From<AllocError> for Errno {
	fn from(_: AllocError) -> Self {
		Errno::ENOMEM
	}
}
