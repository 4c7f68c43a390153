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

//! The node operations vtable: every concrete filesystem (tmpfs, devfs, a disk filesystem) is out
//! of scope here, but the core addresses every v-node uniformly through [`NodeOps`].

use crate::{
	file::{perm::Uid, vfs::node::Node},
	memory::cache::RcFrame,
};
use utils::errno::EResult;

/// A v-node's file type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
	/// A regular file.
	Regular,
	/// A directory.
	Directory,
	/// A symbolic link.
	Symlink,
	/// A character device.
	CharDevice,
	/// A block device.
	BlockDevice,
	/// A named pipe.
	Fifo,
	/// A UNIX socket.
	Socket,
}

/// The `ioctl` request a block device answers with its capacity in bytes (`blocks_count *
/// block_size`).
pub const IOCTL_BLKGETSIZE: u32 = 1;

/// Node metadata, as returned by [`NodeOps::getattr`].
#[derive(Clone, Debug)]
pub struct Stat {
	/// The file type.
	pub file_type: FileType,
	/// Access mode bits.
	pub mode: u16,
	/// Owner user ID.
	pub uid: Uid,
	/// Owner group ID.
	pub gid: crate::file::perm::Gid,
	/// File size in bytes; for a block device, `blocks_count * block_size`.
	pub size: u64,
	/// Number of hard links.
	pub nlink: u16,
}

/// Operations a filesystem implements to expose a node to the core.
///
/// `getpage`/`putpage` are the page cache's only contact with backing storage: `getpage`
/// populates a physical frame with the node's data at a page-aligned offset and is the one
/// operation allowed to block on I/O; `putpage` is its inverse, called to write a dirty frame
/// back, and is a no-op for cache-only filesystems.
pub trait NodeOps: Send + Sync {
	/// Returns the node's metadata.
	fn getattr(&self, node: &Node) -> EResult<Stat>;

	/// Applies metadata changes (mode, ownership, timestamps).
	fn setattr(&self, node: &Node, mode: Option<u16>, uid: Option<Uid>) -> EResult<()>;

	/// Sets the node's size, truncating or extending the backing object, and evicts the page
	/// cache's frames past the new size.
	fn resize(&self, node: &Node, new_size: u64) -> EResult<()>;

	/// Forwards a read directly to the node, for v-node types that do not go through the page
	/// cache (directories, symlinks, FIFOs, sockets, character devices).
	fn read(&self, node: &Node, off: u64, buf: &mut [u8]) -> EResult<usize>;

	/// Forwards a write directly to the node. See [`Self::read`].
	fn write(&self, node: &Node, off: u64, buf: &[u8]) -> EResult<usize>;

	/// Returns the subset of `mask` (readable/writable/error) currently ready.
	fn poll(&self, node: &Node, mask: u32) -> EResult<u32>;

	/// Flushes any node-level state (not page-cache frames) to stable storage.
	fn sync(&self, node: &Node) -> EResult<()>;

	/// Device/filesystem-specific control request. Block devices answer
	/// [`IOCTL_BLKGETSIZE`](super::IOCTL_BLKGETSIZE) with their capacity in bytes.
	fn ioctl(&self, node: &Node, request: u32, arg: usize) -> EResult<usize>;

	/// Handles a page fault for a mapping of a v-node whose type is not regular file or block
	/// device (namely character devices): installs whatever mapping the device requires.
	fn mmap(&self, node: &Node, addr: crate::memory::VirtAddr, write: bool) -> EResult<()>;

	/// The inverse of [`Self::mmap`], called while tearing down a range.
	fn munmap(&self, node: &Node, addr: crate::memory::VirtAddr);

	/// Populates `frame` (already allocated, zero-filled) with the node's data at page offset
	/// `off`. Returns [`utils::errno::Errno::EFAULT`]-flavoured error on out-of-range offsets
	/// which the caller turns into a bus fault.
	fn getpage(&self, node: &Node, off: u64) -> EResult<RcFrame>;

	/// Writes `frame`'s data back to the node at its own recorded offset. A no-op for
	/// cache-only filesystems.
	fn putpage(&self, node: &Node, frame: &RcFrame) -> EResult<()>;
}
