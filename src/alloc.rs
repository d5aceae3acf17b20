//! Allocation tracking for tests.
//!
//! Seek cursors read keys and values into buffers they allocate once, up front. This module
//! provides a counting global allocator so tests can check that a scan does not allocate per
//! entry, and that dropping a tree hands its pages back.
//!
//! # Usage
//!
//! ```ignore
//! use pagetree::alloc::{AllocationScope, TrackingAllocator};
//!
//! #[global_allocator]
//! static ALLOC: TrackingAllocator = TrackingAllocator;
//!
//! #[test]
//! fn scan_does_not_allocate() {
//!     let mut cursor = tree.seek(0, 10_000).unwrap();
//!     let scope = AllocationScope::start();
//!     while cursor.next().unwrap() {}
//!     assert_eq!(scope.finish().allocations, 0);
//! }
//! ```
//!
//! Counters are kept per thread, so a measurement only sees the allocations of the thread
//! that takes it. Memory freed on another thread shows up as a leak on the allocating thread.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

struct Counters {
	allocations: Cell<usize>,
	deallocations: Cell<usize>,
	live_bytes: Cell<isize>,
}

// No destructor, so touching it from inside the allocator never allocates.
thread_local! {
	static COUNTERS: Counters = const {
		Counters {
			allocations: Cell::new(0),
			deallocations: Cell::new(0),
			live_bytes: Cell::new(0),
		}
	};
}

fn record(allocations: usize, deallocations: usize, bytes: isize) {
	// Fails only while the thread is being torn down.
	let _ = COUNTERS.try_with(|c| {
		c.allocations.set(c.allocations.get() + allocations);
		c.deallocations.set(c.deallocations.get() + deallocations);
		c.live_bytes.set(c.live_bytes.get() + bytes);
	});
}

/// Counts every allocation made through it before handing it to [`System`].
pub struct TrackingAllocator;

unsafe impl GlobalAlloc for TrackingAllocator {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		record(1, 0, layout.size() as isize);
		System.alloc(layout)
	}

	unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
		record(1, 0, layout.size() as isize);
		System.alloc_zeroed(layout)
	}

	unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
		record(0, 1, -(layout.size() as isize));
		System.dealloc(ptr, layout)
	}

	unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
		// A grow or shrink counts as one allocation: it may move the block.
		record(1, 1, new_size as isize - layout.size() as isize);
		System.realloc(ptr, layout, new_size)
	}
}

/// Counter values at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStats {
	/// Allocations (including reallocations) made.
	pub allocations: usize,
	/// Deallocations (including reallocations) made.
	pub deallocations: usize,
	/// Bytes currently allocated. Differences can be negative.
	pub live_bytes: isize,
}

impl AllocationStats {
	/// Current counters of the calling thread.
	pub fn now() -> Self {
		COUNTERS.with(|c| AllocationStats {
			allocations: c.allocations.get(),
			deallocations: c.deallocations.get(),
			live_bytes: c.live_bytes.get(),
		})
	}

	fn since(self, start: AllocationStats) -> Self {
		AllocationStats {
			allocations: self.allocations - start.allocations,
			deallocations: self.deallocations - start.deallocations,
			live_bytes: self.live_bytes - start.live_bytes,
		}
	}
}

/// Measures allocation activity between [`start`](Self::start) and [`finish`](Self::finish).
#[derive(Debug)]
pub struct AllocationScope {
	start: AllocationStats,
}

impl AllocationScope {
	pub fn start() -> Self {
		AllocationScope {
			start: AllocationStats::now(),
		}
	}

	/// Activity since the scope started.
	pub fn finish(self) -> AllocationStats {
		AllocationStats::now().since(self.start)
	}
}

/// Runs `f` and returns its result together with the allocation activity it caused.
pub fn measure<T>(f: impl FnOnce() -> T) -> (T, AllocationStats) {
	let scope = AllocationScope::start();
	let result = f();
	(result, scope.finish())
}
