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

//! Synchronization primitives.
//!
//! This is the kernel's own lock layer, distinct from [`utils::lock`]: the [`spin`] and [`mutex`]
//! types here are parameterized over whether they mask interrupts, matching the shape the rest of
//! the kernel (and the address space's two-level locking discipline) is written against.

pub mod atomic;
pub mod mutex;
pub mod once;
pub mod spin;

pub use mutex::Mutex;
/// A [`Mutex`] which masks interrupts while held.
pub type IntMutex<T> = Mutex<T, false>;
pub use spin::Spin;
/// A [`Spin`] which masks interrupts while held.
pub type IntSpin<T> = Spin<T, false>;
