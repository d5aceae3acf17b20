//! # Error Types for the Paged B+ Tree
//!
//! This module defines the errors that cross the seek cursor's boundary.
//!
//! ## Error Handling Strategy
//!
//! Readers never take locks. They read pages optimistically and ask the page
//! cursor afterwards whether a writer interfered. Everything that can be fixed
//! by reading again is absorbed inside the seek cursor and never shows up here:
//!
//! ```text
//! Read page group
//!      │
//!      ▼
//! should_retry()? ──── yes ───► discard, read again
//!      │ no
//!      ▼
//! Validate header / generations
//!      │
//!      ├── reused / torn / stale ───► restart from root (bounded)
//!      │
//!      ▼ (ok)
//! Produce results
//! ```
//!
//! Only three kinds of failure surface to callers:
//!
//! - [`Error::TreeInconsistency`]: the cursor exhausted its retries and the tree
//!   still looks broken. Carries a [`SeekDiagnostics`] snapshot.
//! - Usage errors ([`Error::CursorClosed`], [`Error::NoCurrentEntry`],
//!   [`Error::CursorEnded`]): the caller drove the cursor incorrectly.
//! - [`Error::Io`]: the page accessor failed. Never retried.

use std::fmt;

use thiserror::Error;

use crate::page::PageId;

/// Errors that can occur while reading or writing the tree.
#[derive(Error, Debug)]
pub enum Error {
	/// The tree could not be traversed even after retrying and restarting from
	/// the root. The cursor cannot make progress and will not fabricate results.
	#[error("tree inconsistency: {reason} [{diagnostics}]")]
	TreeInconsistency {
		/// What check failed last.
		reason: String,
		/// State of the cursor when it gave up.
		diagnostics: Box<SeekDiagnostics>,
	},

	/// The cursor was used after [`close`](crate::seek::SeekCursor::close).
	#[error("seek cursor is closed")]
	CursorClosed,

	/// `key()` or `value()` was called without a preceding successful `next()`.
	#[error("no current entry, next() has not returned true")]
	NoCurrentEntry,

	/// The cursor already reached the end of its range.
	#[error("seek cursor has already ended")]
	CursorEnded,

	/// A configuration value cannot be used for the given layout.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	/// An argument passed to a tree operation is out of its accepted domain.
	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	/// The underlying page storage failed.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl Error {
	/// Builds a [`Error::TreeInconsistency`] from a reason and diagnostics.
	pub(crate) fn inconsistency(reason: impl Into<String>, diagnostics: SeekDiagnostics) -> Self {
		Error::TreeInconsistency {
			reason: reason.into(),
			diagnostics: Box::new(diagnostics),
		}
	}

	/// Returns `true` for errors caused by driving a cursor incorrectly.
	pub fn is_usage_error(&self) -> bool {
		matches!(self, Error::CursorClosed | Error::NoCurrentEntry | Error::CursorEnded)
	}
}

/// A Result type alias using our custom Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Snapshot of a seek cursor's position, attached to fatal inconsistencies.
///
/// Every field is a raw observation, none of it is trusted. A value of `None`
/// means the cursor never got far enough to observe it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeekDiagnostics {
	/// Page the cursor was on.
	pub page_id: PageId,
	/// Raw node type byte read from the page.
	pub node_type: Option<u8>,
	/// Node generation read from the page.
	pub generation: Option<u64>,
	/// Generation of the pointer that led to the page.
	pub expected_generation: Option<u64>,
	/// Successor pointer read from the page.
	pub successor: Option<PageId>,
	/// Raw key count read from the page.
	pub key_count: Option<u32>,
	/// Position returned by the last binary search.
	pub search_position: Option<usize>,
	/// Whether the last binary search was an exact hit.
	pub search_hit: Option<bool>,
	/// Position the scan would have continued from.
	pub position: Option<usize>,
	/// Last pointer followed, with its generation.
	pub pointer_followed: Option<(PageId, u64)>,
	/// Stable generation of the cursor's snapshot.
	pub stable_generation: u64,
	/// Unstable generation of the cursor's snapshot.
	pub unstable_generation: u64,
	/// Depth of the page below the root.
	pub depth: usize,
	/// Restarts from root since the last produced result.
	pub restarts: usize,
}

impl fmt::Display for SeekDiagnostics {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"page={} depth={} generation=(stable={}, unstable={}) restarts={}",
			self.page_id,
			self.depth,
			self.stable_generation,
			self.unstable_generation,
			self.restarts
		)?;
		if let Some(node_type) = self.node_type {
			write!(f, " node_type={node_type}")?;
		}
		if let Some(generation) = self.generation {
			write!(f, " node_generation={generation}")?;
		}
		if let Some(expected) = self.expected_generation {
			write!(f, " expected_generation={expected}")?;
		}
		if let Some(successor) = self.successor {
			write!(f, " successor={successor}")?;
		}
		if let Some(key_count) = self.key_count {
			write!(f, " key_count={key_count}")?;
		}
		if let (Some(pos), Some(hit)) = (self.search_position, self.search_hit) {
			write!(f, " search=({pos}, hit={hit})")?;
		}
		if let Some(pos) = self.position {
			write!(f, " position={pos}")?;
		}
		if let Some((pointer, generation)) = self.pointer_followed {
			write!(f, " pointer_followed=({pointer}, {generation})")?;
		}
		Ok(())
	}
}
