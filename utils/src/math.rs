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

//! Small integer helpers used throughout the allocators.

/// Returns `2^n`.
#[inline]
pub fn pow2(n: usize) -> usize {
	1usize << n
}

/// Returns the smallest multiple of `n` (a power of two) greater than or equal to `val`.
#[inline]
pub fn ceil_align(val: usize, n: usize) -> usize {
	(val + n - 1) & !(n - 1)
}

/// Returns the largest multiple of `n` (a power of two) less than or equal to `val`.
#[inline]
pub fn floor_align(val: usize, n: usize) -> usize {
	val & !(n - 1)
}

/// Returns the number of blocks of size `blk_size` needed to fit `val` bytes.
#[inline]
pub fn ceil_div(val: usize, blk_size: usize) -> usize {
	val.div_ceil(blk_size)
}
