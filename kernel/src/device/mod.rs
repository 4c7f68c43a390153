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

//! Device I/O contract.
//!
//! Concrete storage drivers (AHCI/NVMe/virtio-blk, etc.) are external collaborators: this module
//! only defines the [`DeviceIO`] interface the page cache and the unified VFS I/O path address,
//! plus the serial port used for kernel logging.

pub mod serial;

use core::num::NonZeroU64;
use utils::errno::EResult;

/// Device I/O interface.
///
/// Implementations use interior mutability to allow concurrent access, since the page cache may
/// issue reads for distinct offsets of the same device from different contexts.
pub trait DeviceIO {
	/// Returns the granularity of I/O for the device, in bytes. This is the page cache's unit of
	/// transfer for this device.
	fn block_size(&self) -> NonZeroU64;
	/// Returns the number of blocks on the device.
	fn blocks_count(&self) -> u64;

	/// Reads a single block at block offset `off` into `buf`.
	///
	/// `buf` must be exactly [`Self::block_size`] bytes long.
	fn read(&self, off: u64, buf: &mut [u8]) -> EResult<()>;

	/// Writes a single block at block offset `off` from `buf`.
	///
	/// `buf` must be exactly [`Self::block_size`] bytes long.
	fn write(&self, off: u64, buf: &[u8]) -> EResult<()>;
}
