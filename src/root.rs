//! Root resolution.
//!
//! A seek cursor that loses its way asks a [`RootCatchup`] for the current root and descends again.
//! Checkpoints and root splits may replace the root at any time, so the answer is only a starting
//! point: the descent itself revalidates everything it reads.

use std::cell::Cell;

use parking_lot::RwLock;

use crate::error::{Error, Result, SeekDiagnostics};
use crate::page::{PageId, NO_NODE};

/// Root page of a tree and the generation of the pointer to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
	pub id: PageId,
	pub generation: u64,
}

impl Root {
	pub fn new(id: PageId, generation: u64) -> Self {
		Root {
			id,
			generation,
		}
	}
}

/// Supplies the current root to a cursor that needs to restart its descent.
pub trait RootCatchup {
	/// Returns the current root. `hint` is the page the cursor was on when it gave up.
	fn catchup(&self, hint: PageId) -> Result<Root>;
}

impl<F> RootCatchup for F
where
	F: Fn(PageId) -> Result<Root>,
{
	fn catchup(&self, hint: PageId) -> Result<Root> {
		self(hint)
	}
}

/// The root of a tree, swapped atomically by the writer.
#[derive(Debug)]
pub struct SharedRoot {
	root: RwLock<Root>,
}

impl SharedRoot {
	pub fn new(root: Root) -> Self {
		SharedRoot {
			root: RwLock::new(root),
		}
	}

	pub fn get(&self) -> Root {
		*self.root.read()
	}

	pub fn set(&self, root: Root) {
		*self.root.write() = root;
	}
}

impl RootCatchup for SharedRoot {
	fn catchup(&self, _hint: PageId) -> Result<Root> {
		Ok(self.get())
	}
}

/// Root catch-up that gives up after too many consecutive trips for the same page.
///
/// Each cursor gets its own instance. A cursor that keeps getting lost on the same page is looking
/// at a broken tree, not at a race, and fails with [`Error::TreeInconsistency`] instead of looping.
pub struct TripCountingRootCatchup<'a> {
	root: &'a SharedRoot,
	limit: usize,
	last_hint: Cell<PageId>,
	trips: Cell<usize>,
}

impl<'a> TripCountingRootCatchup<'a> {
	pub fn new(root: &'a SharedRoot, limit: usize) -> Self {
		TripCountingRootCatchup {
			root,
			limit,
			last_hint: Cell::new(0),
			trips: Cell::new(0),
		}
	}

	/// Consecutive trips recorded for the last hint.
	pub fn trips(&self) -> usize {
		self.trips.get()
	}
}

impl RootCatchup for TripCountingRootCatchup<'_> {
	fn catchup(&self, hint: PageId) -> Result<Root> {
		// Fresh descents (new cursors, reinitialization) are not trips.
		if hint == NO_NODE {
			self.last_hint.set(NO_NODE);
			self.trips.set(0);
			return Ok(self.root.get());
		}
		let trips = if self.last_hint.get() == hint {
			self.trips.get() + 1
		} else {
			1
		};
		self.last_hint.set(hint);
		self.trips.set(trips);
		if trips > self.limit {
			return Err(Error::inconsistency(
				format!("root catch-up requested {trips} times in a row from page {hint}"),
				SeekDiagnostics {
					page_id: hint,
					restarts: trips,
					..Default::default()
				},
			));
		}
		Ok(self.root.get())
	}
}
