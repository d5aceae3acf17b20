//! Synchronization primitives with loom support.
//!
//! Under normal compilation, re-exports from std and parking_lot.
//! Under `cfg(loom)`, uses loom's equivalents for deterministic testing.
//!
//! # Usage
//!
//! Instead of importing directly from `std::sync::atomic` or `parking_lot`,
//! import from this module:
//!
//! ```ignore
//! use crate::sync::{fence, AtomicUsize, Mutex, Ordering};
//! ```
//!
//! Only the page latch and the page bytes are routed through here. The tree-level
//! bookkeeping (root, generations, writer) never runs inside a loom model.

// Allow unused items - some are only used under loom cfg
#![allow(unused)]

// ===========================================================================
// Atomic Primitives
// ===========================================================================

#[cfg(not(loom))]
pub use std::sync::atomic::{fence, AtomicU8, AtomicUsize, Ordering};

#[cfg(loom)]
pub use loom::sync::atomic::{fence, AtomicU8, AtomicUsize, Ordering};

// ===========================================================================
// Mutex
// ===========================================================================

// parking_lot::Mutex and loom::sync::Mutex have different APIs: loom returns a
// LockResult from lock(). The wrapper below gives loom the parking_lot shape.

#[cfg(not(loom))]
pub use parking_lot::{Mutex, MutexGuard};

#[cfg(loom)]
mod loom_mutex {
	//! Wrapper type for loom's Mutex to match parking_lot's API.

	use loom::sync::{Mutex as LoomMutex, MutexGuard as LoomMutexGuard};

	/// A wrapper around loom's Mutex that provides a parking_lot-compatible API.
	pub struct Mutex<T>(LoomMutex<T>);

	impl<T> Mutex<T> {
		/// Creates a new Mutex.
		pub fn new(value: T) -> Self {
			Mutex(LoomMutex::new(value))
		}

		/// Acquires the lock, blocking until available.
		pub fn lock(&self) -> MutexGuard<'_, T> {
			MutexGuard(self.0.lock().unwrap())
		}

		/// Attempts to acquire the lock without blocking.
		pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
			self.0.try_lock().ok().map(MutexGuard)
		}
	}

	/// Wrapper around loom's mutex guard.
	pub struct MutexGuard<'a, T>(LoomMutexGuard<'a, T>);

	impl<'a, T> std::ops::Deref for MutexGuard<'a, T> {
		type Target = T;
		fn deref(&self) -> &T {
			&self.0
		}
	}

	impl<'a, T> std::ops::DerefMut for MutexGuard<'a, T> {
		fn deref_mut(&mut self) -> &mut T {
			&mut self.0
		}
	}
}

#[cfg(loom)]
pub use loom_mutex::{Mutex, MutexGuard};

// ===========================================================================
// Spin / Yield
// ===========================================================================

/// Hints the scheduler while spinning on a latch held by a writer.
///
/// Under loom every spin must be a yield point, otherwise the model checker
/// cannot make progress on the writer thread.
#[inline]
pub fn spin_hint() {
	#[cfg(not(loom))]
	std::hint::spin_loop();
	#[cfg(loom)]
	loom::thread::yield_now();
}

/// Yields the current thread.
#[inline]
pub fn yield_now() {
	#[cfg(not(loom))]
	std::thread::yield_now();
	#[cfg(loom)]
	loom::thread::yield_now();
}
