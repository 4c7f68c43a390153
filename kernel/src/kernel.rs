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

//! Tethys is a preemptive, SMP, POSIX-flavored kernel for x86-64.
//!
//! This crate scopes down to the kernel's virtual memory manager and the page-cache-backed
//! unified I/O path that sits between it and the virtual filesystem: the address space
//! (gaps, mappings, page fault resolution, fork, context switch), the physical frame and
//! architecture page table allocators it relies on, the page cache, and the v-node layer that
//! both the VMM and the unified read/write path address.
//!
//! Every other kernel subsystem a full system would need (scheduler, signal delivery, socket
//! and network stack, syscall dispatch, concrete storage drivers) is represented here only by
//! the minimal contract the in-scope code calls against; see [`process`] and [`device`].

#![no_std]
#![no_main]
#![feature(allocator_api)]
#![feature(custom_test_frameworks)]
#![feature(negative_impls)]
#![feature(pointer_is_aligned_to)]
#![deny(missing_docs)]
#![allow(clippy::tabs_in_doc_comments)]
#![allow(internal_features)]
#![allow(unsafe_op_in_unsafe_fn)]
#![test_runner(crate::selftest::runner)]
#![reexport_test_harness_main = "kernel_selftest"]

extern crate alloc;

pub mod arch;
#[macro_use]
pub mod config;
pub mod device;
pub mod file;
pub mod logger;
pub mod memory;
#[macro_use]
pub mod panic;
#[macro_use]
pub mod print;
pub mod process;
pub mod selftest;
pub mod sync;

pub use utils;

/// The kernel's name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
/// Current kernel version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Performs early architecture and memory-management bring-up, then hands off to the kernel's
/// self-tests when built under `#[cfg(test)]`.
///
/// The caller (the architecture's boot stub) must have already left the CPU in a state where
/// normal Rust code can run: a stack is set up and the kernel's own code/data are mapped.
fn kernel_main_inner() {
	println!("Boot {NAME} version {VERSION}");
	println!("Setup memory management");
	// Discovering the platform's usable memory map and the kernel's own load address is the
	// boot loader handoff's job, out of scope for this crate (see `memory::vmem::init`'s
	// contract): the boot stub is expected to call it directly with that information before
	// reaching this point.
	#[cfg(test)]
	kernel_selftest();
}

/// Kernel entry point, called from the architecture's boot stub.
///
/// # Safety
///
/// The CPU must be in a state where the kernel's statically-linked code and data are mapped and
/// a valid stack is set up.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main() -> ! {
	kernel_main_inner();
	loop {
		unsafe {
			core::arch::asm!("hlt");
		}
	}
}
