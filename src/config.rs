//! Configuration structures for trees and seeks.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::HEADER_SIZE;
use crate::page::MIN_NODE_ID;
use crate::pointer::PAIR_SIZE;

/// Default number of entries read from a node in one optimistic pass.
pub const DEFAULT_READ_AHEAD: usize = 20;

/// Tree configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
	/// Page size in bytes.
	pub page_size: usize,
	/// Number of pages in the page file.
	pub max_pages: usize,
	/// Read-ahead used by [`Tree::seek`](crate::Tree::seek).
	pub read_ahead: usize,
	/// Consecutive root catch-ups from the same page before a cursor gives up.
	pub root_catchup_trip_limit: usize,
}

impl Default for TreeConfig {
	fn default() -> Self {
		Self {
			page_size: 8192,
			max_pages: 65536, // 512 MB with 8 KB pages
			read_ahead: DEFAULT_READ_AHEAD,
			root_catchup_trip_limit: 64,
		}
	}
}

impl TreeConfig {
	/// Checks that pages of this size hold at least two entries of the given sizes per node.
	pub fn validate(&self, key_size: usize, value_size: usize) -> Result<()> {
		if key_size == 0 {
			return Err(Error::InvalidConfig("key size must not be zero".into()));
		}
		let body = self.page_size.saturating_sub(HEADER_SIZE);
		let leaf_keys = body / (key_size + value_size);
		let internal_keys = body.saturating_sub(PAIR_SIZE) / (key_size + PAIR_SIZE);
		if leaf_keys < 2 || internal_keys < 2 {
			return Err(Error::InvalidConfig(format!(
				"page size {} holds {leaf_keys} leaf and {internal_keys} internal keys, need at least 2",
				self.page_size
			)));
		}
		if self.max_pages <= MIN_NODE_ID as usize {
			return Err(Error::InvalidConfig(format!(
				"max_pages must exceed {MIN_NODE_ID}, got {}",
				self.max_pages
			)));
		}
		if self.read_ahead == 0 {
			return Err(Error::InvalidConfig("read_ahead must be at least 1".into()));
		}
		if self.root_catchup_trip_limit == 0 {
			return Err(Error::InvalidConfig("root_catchup_trip_limit must be at least 1".into()));
		}
		Ok(())
	}
}

/// Level a seek descends to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekLevel {
	/// The leaves.
	#[default]
	Leaf,
	/// Nodes at this depth below the root (root is depth 0). Stops early at a leaf.
	Depth(usize),
}

/// Per-seek options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekOptions {
	/// Entries read per optimistic pass. Exact-match seeks always use 1.
	pub read_ahead: usize,
	/// Level to seek on.
	pub target_level: SeekLevel,
	/// Consecutive restarts from root without producing a result before giving up.
	pub max_restarts: usize,
	/// Attempts at crossing to the left sibling before restarting from root.
	pub max_crossing_attempts: usize,
}

impl Default for SeekOptions {
	fn default() -> Self {
		Self {
			read_ahead: DEFAULT_READ_AHEAD,
			target_level: SeekLevel::Leaf,
			max_restarts: 128,
			max_crossing_attempts: 16,
		}
	}
}

impl SeekOptions {
	pub fn with_read_ahead(mut self, read_ahead: usize) -> Self {
		self.read_ahead = read_ahead;
		self
	}

	pub fn with_target_level(mut self, target_level: SeekLevel) -> Self {
		self.target_level = target_level;
		self
	}

	pub fn with_max_restarts(mut self, max_restarts: usize) -> Self {
		self.max_restarts = max_restarts;
		self
	}

	pub fn validate(&self) -> Result<()> {
		if self.read_ahead == 0 {
			return Err(Error::InvalidConfig("read_ahead must be at least 1".into()));
		}
		if self.max_crossing_attempts == 0 {
			return Err(Error::InvalidConfig("max_crossing_attempts must be at least 1".into()));
		}
		Ok(())
	}
}
