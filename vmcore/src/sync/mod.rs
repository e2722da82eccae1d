// SPDX-License-Identifier: MPL-2.0

//! Synchronization primitives.

mod rwlock;
mod wait;

pub use rwlock::{
    ArcRwLockReadGuard, ArcRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
pub use wait::WaitQueue;

/// A spin lock for short critical sections.
pub type SpinLock<T> = spin::Mutex<T>;
/// The guard of a [`SpinLock`].
pub type SpinLockGuard<'a, T> = spin::MutexGuard<'a, T>;
