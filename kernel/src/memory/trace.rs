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

//! Allocator tracing, enabled by the `memtrace` feature.
//!
//! Each instrumented allocator (see [`macros::instrument_allocator`]) reports its operations
//! here. This is a thin ring buffer; nothing consumes it yet beyond letting the kernel be built
//! with tracing wired up for future tooling to read out of the log.

use crate::{println, sync::mutex::IntMutex};

/// One recorded allocator event.
#[derive(Clone, Copy)]
struct Event {
	allocator: &'static str,
	/// `0`: alloc, `1`: realloc, `2`: free.
	op: u8,
	ptr: *const core::ffi::c_void,
	size: usize,
}

unsafe impl Send for Event {}

const TRACE_LEN: usize = 256;

struct Trace {
	events: [Option<Event>; TRACE_LEN],
	next: usize,
}

static TRACE: IntMutex<Trace> = IntMutex::new(Trace {
	events: [None; TRACE_LEN],
	next: 0,
});

/// Records one allocator event.
pub fn sample(allocator: &'static str, op: u8, ptr: *const core::ffi::c_void, size: usize) {
	let mut trace = TRACE.lock();
	let next = trace.next;
	trace.events[next] = Some(Event {
		allocator,
		op,
		ptr,
		size,
	});
	trace.next = (next + 1) % TRACE_LEN;
	let kind = match op {
		0 => "alloc",
		1 => "realloc",
		_ => "free",
	};
	println!("[memtrace] {allocator} {kind} ptr={ptr:?} size={size}");
}
