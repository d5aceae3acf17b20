//! Implementation of a version latch for optimistic page reads, based on the LeanStore paper.
//!
//! The key difference from a standard `RwLock` is that readers never write to memory. A reader
//! captures the latch version, reads the protected data, and then validates that the version is
//! unchanged. Writers serialize on a mutex and bump the version to an odd value for the duration
//! of the write, so a reader that overlapped with a write always fails validation.
//!
//! Unlike a lock-based latch, the protected data must tolerate concurrent reads and writes by
//! itself. Pages store their bytes in atomics, so a torn optimistic read is never undefined
//! behavior, only garbage that validation rejects.
//!
//! ```text
//! version:   4        5 ........ 6
//!            │ writer locks      │ writer unlocks
//! reader A:  ├─ capture 4 ── read ── validate (6 != 4) ──► retry
//! reader B:                        capture 6 ── read ── validate (6 == 6) ──► ok
//! ```

use crate::sync::{fence, spin_hint, yield_now, AtomicUsize, Mutex, MutexGuard, Ordering};

/// Simple spin wait implementation
struct SpinWait {
	counter: u32,
}

impl SpinWait {
	fn new() -> Self {
		SpinWait {
			counter: 0,
		}
	}

	fn spin(&mut self) -> bool {
		if self.counter < 10 {
			self.counter += 1;
			spin_hint();
			true
		} else if self.counter < 20 {
			self.counter += 1;
			yield_now();
			true
		} else {
			yield_now();
			false
		}
	}

	fn reset(&mut self) {
		self.counter = 0;
	}
}

/// A latch that uses versioning to enable optimistic or exclusive access to the underlying data.
///
/// `T` must provide its own interior mutability through atomics; the latch only orders writes
/// against validated reads.
pub struct PageLatch<T> {
	version: AtomicUsize,
	lock: Mutex<()>,
	data: T,
}

impl<T> PageLatch<T> {
	/// Creates a new instance of a `PageLatch<T>` which is unlocked.
	#[inline]
	pub fn new(data: T) -> PageLatch<T> {
		PageLatch {
			version: AtomicUsize::new(0),
			lock: Mutex::new(()),
			data,
		}
	}

	/// Locks this `PageLatch` with exclusive write access, blocking the thread until it can be
	/// acquired.
	///
	/// Returns an RAII guard which will release the exclusive access when dropped. Every
	/// optimistic reader that overlaps with the guard's lifetime fails validation.
	#[inline]
	pub fn exclusive(&self) -> ExclusiveGuard<'_, T> {
		let guard = self.lock.lock();
		let version = self.version.load(Ordering::Relaxed) + 1;
		self.version.store(version, Ordering::Relaxed);
		// Orders the odd version before any data store made through the guard.
		fence(Ordering::Release);
		ExclusiveGuard {
			latch: self,
			_guard: guard,
			version,
		}
	}

	/// Acquires optimistic read access from this `PageLatch`, spinning while a writer holds it.
	///
	/// Optimistic access must be validated before acting on anything read through it. See
	/// [`OptimisticGuard::recheck`] for the details.
	#[inline(never)]
	pub fn optimistic_or_spin(&self) -> OptimisticGuard<'_, T> {
		OptimisticGuard {
			latch: self,
			version: self.stable_version(),
		}
	}

	/// Returns the current version, waiting for any writer to finish.
	fn stable_version(&self) -> usize {
		let mut version = self.version.load(Ordering::Acquire);
		if (version & 1) == 1 {
			let mut spinwait = SpinWait::new();
			loop {
				version = self.version.load(Ordering::Acquire);
				if (version & 1) == 1 {
					let result = spinwait.spin();
					if !result {
						spinwait.reset();
					}
					continue;
				} else {
					break;
				}
			}
		}
		version
	}

	/// Returns `true` if a writer currently holds the latch.
	#[inline]
	pub fn is_write_locked(&self) -> bool {
		(self.version.load(Ordering::Acquire) & 1) == 1
	}

	/// Direct access to the data, bypassing validation.
	///
	/// Only meaningful to the single writer, which knows nobody else writes.
	#[inline]
	pub fn data(&self) -> &T {
		&self.data
	}
}

/// Structure used to perform optimistic accesses and validation.
pub struct OptimisticGuard<'a, T> {
	latch: &'a PageLatch<T>,
	version: usize,
}

impl<'a, T> OptimisticGuard<'a, T> {
	/// Validates all previous optimistic accesses since the creation (or last
	/// [`restart`](Self::restart)) of the guard.
	///
	/// Returns `false` if a writer may have modified the data in between, in which case
	/// everything read through this guard must be discarded.
	#[inline]
	pub fn recheck(&self) -> bool {
		// Orders the data loads before the version load below.
		fence(Ordering::Acquire);
		self.version == self.latch.version.load(Ordering::Relaxed)
	}

	/// Captures a fresh version, waiting for any writer to finish, so that the reads can
	/// be redone.
	#[inline]
	pub fn restart(&mut self) {
		self.version = self.latch.stable_version();
	}

	/// The version captured by this guard.
	#[inline]
	pub fn version(&self) -> usize {
		self.version
	}
}

impl<'a, T> std::ops::Deref for OptimisticGuard<'a, T> {
	type Target = T;

	fn deref(&self) -> &T {
		&self.latch.data
	}
}

/// RAII structure used to release the exclusive write access of a latch when dropped.
pub struct ExclusiveGuard<'a, T> {
	latch: &'a PageLatch<T>,
	_guard: MutexGuard<'a, ()>,
	version: usize,
}

impl<'a, T> Drop for ExclusiveGuard<'a, T> {
	#[inline]
	fn drop(&mut self) {
		let new_version = self.version + 1;
		self.latch.version.store(new_version, Ordering::Release);
	}
}

impl<'a, T> std::ops::Deref for ExclusiveGuard<'a, T> {
	type Target = T;

	#[inline]
	fn deref(&self) -> &T {
		&self.latch.data
	}
}
