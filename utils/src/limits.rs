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

//! System-wide limits and constants.

/// The size in bytes of a memory page on the target architecture.
pub const PAGE_SIZE: usize = 0x1000;

/// Maximum number of symlinks dereferenced while resolving a single path, beyond which path
/// resolution fails with `ELOOP`.
pub const MAXLINKDEPTH: usize = 64;
