//! Stable/unstable generation pair.
//!
//! Every structural write is stamped with the current *unstable* generation. A checkpoint makes
//! everything written so far *stable* and opens a new unstable generation:
//!
//! ```text
//! checkpoint:      0            1            2
//! stable:          1            2            3
//! unstable:        2            3            4
//! ```
//!
//! Readers take a [`Generation`] snapshot when a seek starts and refresh it only when a pointer
//! read disagrees with it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::latch::PageLatch;

/// Smallest generation ever used for a stable checkpoint.
pub const MIN_STABLE_GENERATION: u64 = 1;

/// A (stable, unstable) generation snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
	/// Generation of the last completed checkpoint.
	pub stable: u64,
	/// Generation stamped on everything written since.
	pub unstable: u64,
}

impl Generation {
	/// The generation of a freshly created tree.
	pub const INITIAL: Generation = Generation {
		stable: MIN_STABLE_GENERATION,
		unstable: MIN_STABLE_GENERATION + 1,
	};

	/// Creates a snapshot. `stable` must be lower than `unstable`.
	pub fn new(stable: u64, unstable: u64) -> Self {
		debug_assert!(stable < unstable);
		Generation {
			stable,
			unstable,
		}
	}

	/// The generation pair after one more checkpoint.
	pub fn next_checkpoint(self) -> Self {
		Generation {
			stable: self.unstable,
			unstable: self.unstable + 1,
		}
	}
}

impl Default for Generation {
	fn default() -> Self {
		Generation::INITIAL
	}
}

impl fmt::Display for Generation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "(stable={}, unstable={})", self.stable, self.unstable)
	}
}

/// Where seek cursors get their generation snapshots from.
pub trait GenerationSource: Send + Sync {
	/// The current generation pair.
	fn current(&self) -> Generation;
}

/// Process-wide generation source advanced by checkpoints.
///
/// Both halves sit behind one [`PageLatch`], so a reader never observes a stable generation from
/// one checkpoint and an unstable one from another, and neither half is narrowed to fit a word.
/// Readers validate optimistically and never block a checkpoint.
pub struct GenerationKeeper {
	latch: PageLatch<[AtomicU64; 2]>,
}

impl GenerationKeeper {
	/// Starts at [`Generation::INITIAL`].
	pub fn new() -> Self {
		Self::starting_at(Generation::INITIAL)
	}

	/// Starts at an arbitrary generation.
	pub fn starting_at(generation: Generation) -> Self {
		GenerationKeeper {
			latch: PageLatch::new([
				AtomicU64::new(generation.stable),
				AtomicU64::new(generation.unstable),
			]),
		}
	}

	/// Advances to the next checkpoint and returns the new pair.
	pub fn checkpoint(&self) -> Generation {
		let pair = self.latch.exclusive();
		let next = Generation {
			stable: pair[0].load(Ordering::Relaxed),
			unstable: pair[1].load(Ordering::Relaxed),
		}
		.next_checkpoint();
		pair[0].store(next.stable, Ordering::Relaxed);
		pair[1].store(next.unstable, Ordering::Relaxed);
		next
	}
}

impl Default for GenerationKeeper {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for GenerationKeeper {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("GenerationKeeper").field(&self.current()).finish()
	}
}

impl GenerationSource for GenerationKeeper {
	fn current(&self) -> Generation {
		let mut pair = self.latch.optimistic_or_spin();
		loop {
			let generation = Generation {
				stable: pair[0].load(Ordering::Relaxed),
				unstable: pair[1].load(Ordering::Relaxed),
			};
			if pair.recheck() {
				return generation;
			}
			pair.restart();
		}
	}
}
