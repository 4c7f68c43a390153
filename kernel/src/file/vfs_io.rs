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

//! The unified read/write path.
//!
//! Regular files and block devices fold onto the same state machine: both are addressed by the
//! page cache in page-aligned chunks and reached with page-sized memcpys; everything else
//! (directories, symlinks, FIFOs, sockets, character devices) is forwarded verbatim to the
//! node's own `read`/`write`. This is what lets "write to a file" and "read a block device
//! sector" share one implementation instead of two.

use super::{File, fs::FileType, fs::IOCTL_BLKGETSIZE, flags::O_NOCACHE, vfs::node::Node};
use utils::{errno, errno::EResult, limits::PAGE_SIZE, ptr::arc::Arc};

/// Returns the node's current size for I/O clamping: `getattr` for a regular file, the device's
/// advertised capacity (via ioctl) for a block device.
fn io_size(node: &Node) -> EResult<u64> {
	match node.node_type {
		FileType::Regular => Ok(node.getattr()?.size),
		FileType::BlockDevice => node
			.ops
			.ioctl(node, IOCTL_BLKGETSIZE, 0)
			.map(|size| size as u64),
		_ => unreachable!("io_size is only called for cached node types"),
	}
}

/// Reads at most `buf.len()` bytes from `node` at byte offset `off`, returning the number of
/// bytes actually read (`0` at or past end-of-file).
pub fn read_at(node: &Arc<Node>, off: u64, buf: &mut [u8]) -> EResult<usize> {
	if !node.is_cached() {
		return node.ops.read(node, off, buf);
	}
	node.with_size_lock(|_| {
		let size = io_size(node)?;
		if off >= size {
			return Ok(0);
		}
		let count = (buf.len() as u64).min(size - off) as usize;
		let mut done = 0;
		while done < count {
			let cur_off = off + done as u64;
			let page_off = cur_off / PAGE_SIZE as u64;
			let in_page = (cur_off % PAGE_SIZE as u64) as usize;
			let chunk = (PAGE_SIZE - in_page).min(count - done);
			let frame = node
				.cache
				.get_page(page_off, 0, || node.ops.getpage(node, page_off))?;
			buf[done..done + chunk].copy_from_slice(&frame.slice::<u8>()[in_page..in_page + chunk]);
			done += chunk;
		}
		Ok(done)
	})
}

/// Writes `buf` to `node` at byte offset `off`, returning the number of bytes written.
///
/// For a regular file, extends the node first via `resize` if the write reaches past the
/// current size. For a block device, the write is clamped to the device's capacity.
pub fn write_at(node: &Arc<Node>, off: u64, buf: &[u8], io_flags: i32) -> EResult<usize> {
	if !node.is_cached() {
		return node.ops.write(node, off, buf);
	}
	node.with_size_lock(|size_slot| {
		let end = off
			.checked_add(buf.len() as u64)
			.ok_or(errno::errno!(EINVAL))?;
		let count = match node.node_type {
			FileType::Regular => {
				if end > *size_slot {
					node.ops.resize(node, end)?;
					*size_slot = end;
				}
				buf.len()
			}
			FileType::BlockDevice => {
				let capacity = io_size(node)?;
				if off >= capacity {
					return Ok(0);
				}
				(buf.len() as u64).min(capacity - off) as usize
			}
			_ => unreachable!(),
		};
		let mut done = 0;
		while done < count {
			let cur_off = off + done as u64;
			let page_off = cur_off / PAGE_SIZE as u64;
			let in_page = (cur_off % PAGE_SIZE as u64) as usize;
			let chunk = (PAGE_SIZE - in_page).min(count - done);
			let frame = node
				.cache
				.get_page(page_off, 0, || node.ops.getpage(node, page_off))?;
			unsafe {
				frame.slice_mut::<u8>()[in_page..in_page + chunk]
					.copy_from_slice(&buf[done..done + chunk]);
			}
			node.cache.make_dirty(page_off);
			if io_flags & O_NOCACHE != 0 {
				match node.node_type {
					FileType::Regular => node.ops.sync(node)?,
					FileType::BlockDevice => node.cache.sync_range(page_off, page_off + 1)?,
					_ => unreachable!(),
				}
				let _ = node.cache.evict(page_off);
			}
			done += chunk;
		}
		Ok(done)
	})
}

/// Reads from `file` at its current cursor, advancing it by the number of bytes read.
pub fn read(file: &File, buf: &mut [u8]) -> EResult<usize> {
	let node = file.node().ok_or(errno::errno!(EBADF))?;
	let n = read_at(node, file.pos(), buf)?;
	file.set_pos(file.pos() + n as u64);
	Ok(n)
}

/// Writes to `file` at its current cursor, advancing it by the number of bytes written.
pub fn write(file: &File, buf: &[u8], io_flags: i32) -> EResult<usize> {
	let node = file.node().ok_or(errno::errno!(EBADF))?;
	let n = write_at(node, file.pos(), buf, io_flags)?;
	file.set_pos(file.pos() + n as u64);
	Ok(n)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{file::fs::{NodeOps, Stat}, memory::cache::{FrameOwner, RcFrame}};
	use alloc::vec::Vec;

	struct MemBacked {
		data: crate::sync::IntMutex<Vec<u8>>,
	}

	impl NodeOps for MemBacked {
		fn getattr(&self, _node: &Node) -> EResult<Stat> {
			Ok(Stat {
				file_type: FileType::Regular,
				mode: 0o644,
				uid: 0,
				gid: 0,
				size: self.data.lock().len() as u64,
				nlink: 1,
			})
		}

		fn setattr(&self, _node: &Node, _mode: Option<u16>, _uid: Option<u16>) -> EResult<()> {
			Ok(())
		}

		fn resize(&self, _node: &Node, new_size: u64) -> EResult<()> {
			self.data.lock().resize(new_size as usize, 0);
			Ok(())
		}

		fn read(&self, _node: &Node, _off: u64, _buf: &mut [u8]) -> EResult<usize> {
			unreachable!()
		}

		fn write(&self, _node: &Node, _off: u64, _buf: &[u8]) -> EResult<usize> {
			unreachable!()
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

		fn mmap(&self, _node: &Node, _addr: crate::memory::VirtAddr, _write: bool) -> EResult<()> {
			Ok(())
		}

		fn munmap(&self, _node: &Node, _addr: crate::memory::VirtAddr) {}

		fn getpage(&self, _node: &Node, off: u64) -> EResult<RcFrame> {
			let frame = RcFrame::new_zeroed(0, FrameOwner::Anon, off)?;
			let data = self.data.lock();
			let start = (off as usize) * PAGE_SIZE;
			let avail = data.len().saturating_sub(start).min(PAGE_SIZE);
			if avail > 0 {
				unsafe {
					frame.slice_mut::<u8>()[..avail].copy_from_slice(&data[start..start + avail]);
				}
			}
			Ok(frame)
		}

		fn putpage(&self, _node: &Node, frame: &RcFrame) -> EResult<()> {
			let mut data = self.data.lock();
			let start = (frame.offset() as usize) * PAGE_SIZE;
			if data.len() < start + PAGE_SIZE {
				data.resize(start + PAGE_SIZE, 0);
			}
			data[start..start + PAGE_SIZE].copy_from_slice(frame.slice::<u8>());
			Ok(())
		}
	}

	fn make_node(initial: &[u8]) -> Arc<Node> {
		let ops = MemBacked {
			data: crate::sync::IntMutex::new(Vec::from(initial)),
		};
		Arc::new(Node::new(
			FileType::Regular,
			alloc::boxed::Box::new(ops),
			initial.len() as u64,
		))
		.unwrap()
	}

	#[test_case]
	fn write_then_read_back() {
		let node = make_node(b"AAAA");
		let n = write_at(&node, 0, b"B", 0).unwrap();
		assert_eq!(n, 1);
		let mut buf = [0u8; 4];
		let n = read_at(&node, 0, &mut buf).unwrap();
		assert_eq!(n, 4);
		assert_eq!(&buf, b"BAAA");
	}

	#[test_case]
	fn read_past_eof_is_empty() {
		let node = make_node(b"hello");
		let mut buf = [0u8; 8];
		let n = read_at(&node, 5, &mut buf).unwrap();
		assert_eq!(n, 0);
	}

	#[test_case]
	fn extending_write_grows_size() {
		let node = make_node(b"");
		write_at(&node, 0, b"hello world", 0).unwrap();
		assert_eq!(node.getattr().unwrap().size, 11);
	}
}
