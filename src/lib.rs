//! # Pagetree: Lock-Free Seeks over a Paged B+ Tree
//!
//! This crate provides a B+ tree stored in fixed-size pages together with a **seek cursor** that
//! scans key ranges in either direction without taking any lock, while a single writer keeps
//! inserting, splitting nodes and recycling pages underneath it.
//!
//! ## Design Overview
//!
//! The cursor never trusts what it reads. Every group of page reads is validated afterwards and
//! redone if a writer interfered, and every structural fact (node type, generation, key count,
//! sibling links) is cross-checked before it is acted upon.
//!
//! ### Key Concepts
//!
//! **Optimistic page reads**: pages sit behind a [`latch::PageLatch`], a version-stamped seqlock.
//! Readers capture the version, read, and ask [`PageCursor::should_retry`] whether the version
//! moved. Writers never wait for readers.
//!
//! **Generations**: the tree carries a `(stable, unstable)` generation pair advanced by
//! checkpoints. Every node records the generation it was written in and every pointer records
//! the generation it was written at. A node newer than the pointer that led to it has been freed
//! and reused, and the cursor starts over from the root.
//!
//! **Generation-safe pointer pairs**: every pointer is stored twice, in two checksummed slots,
//! and updated by overwriting the slot that is not the newest stable one. See [`pointer`].
//!
//! **Successors**: a node written before the current unstable generation is never modified in
//! place. The writer copies it to a successor page and links it from the old one; the cursor
//! follows successor links transparently.
//!
//! **B-link siblings**: leaves and internal nodes are chained left and right. Splits always move
//! keys to a new right sibling, so a cursor that misses a split finds its keys by moving right.
//!
//! ### Tree Structure
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │   SharedRoot    │  <- (page id, generation) of the root
//!                    └────────┬────────┘
//!                             │
//!                             ▼
//!                    ┌─────────────────┐
//!                    │  Internal Node  │  <- keys and generation-safe child pointers
//!                    └────────┬────────┘
//!                             │
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!        ┌──────────┐  ┌──────────┐  ┌──────────┐
//!        │   Leaf   │◄─►   Leaf   │◄─►   Leaf   │  <- keys and values, linked both ways
//!        └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! ## Basic Usage
//!
//! ```
//! use pagetree::{Tree, TreeConfig, U64Layout};
//!
//! let tree = Tree::new(U64Layout::new(), TreeConfig::default()).unwrap();
//! for k in 0..1000u64 {
//!     tree.insert(k, k * 10).unwrap();
//! }
//!
//! // `from` is inclusive, `to` is exclusive.
//! let mut cursor = tree.seek(10, 20).unwrap();
//! let mut seen = Vec::new();
//! while cursor.next().unwrap() {
//!     seen.push((*cursor.key().unwrap(), *cursor.value().unwrap()));
//! }
//! assert_eq!(seen.len(), 10);
//! assert_eq!(seen[0], (10, 100));
//!
//! // A reversed range scans backwards.
//! let mut cursor = tree.seek(20, 10).unwrap();
//! assert!(cursor.next().unwrap());
//! assert_eq!(*cursor.key().unwrap(), 20);
//!
//! assert_eq!(tree.get(&42).unwrap(), Some(420));
//! ```
//!
//! ## Thread Safety
//!
//! The tree can be shared across threads via `Arc<Tree<L>>`. Writes are serialized by an internal
//! mutex; any number of cursors read concurrently. Each cursor belongs to one thread.

use std::cmp::Ordering as KeyOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

pub mod config;
pub mod error;
pub mod generation;
pub mod latch;
pub mod layout;
pub mod monitor;
pub mod node;
pub mod page;
pub mod pointer;
pub mod root;
pub mod seek;

mod sync;
mod writer;

#[cfg(any(test, feature = "test-utils"))]
pub mod alloc;
#[cfg(any(test, feature = "test-utils"))]
pub mod util;

pub use config::{SeekLevel, SeekOptions, TreeConfig};
pub use error::{Error, Result, SeekDiagnostics};
pub use generation::{Generation, GenerationKeeper, GenerationSource};
pub use layout::{Layout, U64Layout};
pub use monitor::{NoopMonitor, SeekMonitor, NO_MONITOR};
pub use page::{MemoryPageCursor, MemoryPageFile, PageCursor, PageId};
pub use root::{Root, RootCatchup, SharedRoot, TripCountingRootCatchup};
pub use seek::{Direction, SeekCursor, SeekRange};

use writer::{FreeList, TreeWriter};

/// A seek cursor over a [`Tree`].
pub type TreeCursor<'t, L> = SeekCursor<'t, L, MemoryPageCursor<'t>>;

// ---------------------------------------------------------------------------
// Core Tree Structure
// ---------------------------------------------------------------------------

/// A B+ tree in an in-memory page file with a single writer and lock-free seeks.
///
/// # Type Parameters
///
/// - `L`: The [`Layout`] describing key and value types, their on-page size and their order.
pub struct Tree<L: Layout> {
	layout: L,
	config: TreeConfig,
	file: MemoryPageFile,
	root: SharedRoot,
	generations: GenerationKeeper,
	/// Number of levels, a lone root leaf being height 1. Only the writer changes it, and only
	/// after the new root is published.
	height: AtomicUsize,
	/// Writer lock. The free list lives inside it because only the writer allocates.
	writer: Mutex<FreeList>,
}

impl<L: Layout> Tree<L> {
	/// Creates an empty tree: a single root leaf in a fresh page file.
	pub fn new(layout: L, config: TreeConfig) -> Result<Self> {
		config.validate(layout.key_size(), layout.value_size())?;
		let file = MemoryPageFile::new(config.page_size, config.max_pages);
		let generations = GenerationKeeper::new();
		let root = {
			let node = node::TreeNode::new(&layout, file.page_size());
			writer::create_root(&node, &file, generations.current())?
		};
		Ok(Self::from_parts(layout, config, file, generations, root, 1))
	}

	pub(crate) fn from_parts(
		layout: L,
		config: TreeConfig,
		file: MemoryPageFile,
		generations: GenerationKeeper,
		root: Root,
		height: usize,
	) -> Self {
		Tree {
			layout,
			config,
			file,
			root: SharedRoot::new(root),
			generations,
			height: AtomicUsize::new(height),
			writer: Mutex::new(FreeList::default()),
		}
	}

	// -----------------------------------------------------------------------
	// Accessors
	// -----------------------------------------------------------------------

	pub fn layout(&self) -> &L {
		&self.layout
	}

	pub fn config(&self) -> &TreeConfig {
		&self.config
	}

	/// The page file backing this tree.
	pub fn file(&self) -> &MemoryPageFile {
		&self.file
	}

	/// The current root.
	pub fn root(&self) -> Root {
		self.root.get()
	}

	/// The current generation pair.
	pub fn generation(&self) -> Generation {
		self.generations.current()
	}

	/// Number of levels in the tree. A tree holding only a root leaf has height 1.
	pub fn height(&self) -> usize {
		self.height.load(Ordering::Acquire)
	}

	/// Pages freed by the writer and not yet reused.
	pub fn free_pages(&self) -> usize {
		self.writer.lock().len()
	}

	// -----------------------------------------------------------------------
	// Writes
	// -----------------------------------------------------------------------

	/// Inserts `key`, replacing and returning the previous value if the key was present.
	pub fn insert(&self, key: L::Key, value: L::Value) -> Result<Option<L::Value>> {
		let mut free = self.writer.lock();
		let snapshot = self.generations.current();
		TreeWriter::new(&self.layout, &self.file, &self.root, &self.height, &mut free, snapshot)
			.insert(&key, &value)
	}

	/// Ends the current unstable generation. Everything written so far becomes stable and is
	/// copied before it is modified again; pages freed before this point become reusable.
	pub fn checkpoint(&self) -> Generation {
		let _writer = self.writer.lock();
		let generation = self.generations.checkpoint();
		debug!(%generation, "checkpoint");
		generation
	}

	// -----------------------------------------------------------------------
	// Seeks
	// -----------------------------------------------------------------------

	/// Seeks the leaves over `[from, to)`, backwards if `from > to`. An exact match if
	/// `from == to`.
	pub fn seek(&self, from: L::Key, to: L::Key) -> Result<TreeCursor<'_, L>> {
		let options = SeekOptions::default().with_read_ahead(self.config.read_ahead);
		self.seek_with(SeekRange::new(from, to), options)
	}

	/// Seeks with explicit options.
	pub fn seek_with(
		&self,
		range: SeekRange<L::Key>,
		options: SeekOptions,
	) -> Result<TreeCursor<'_, L>> {
		self.seek_monitored(range, options, &NO_MONITOR)
	}

	/// Seeks with explicit options, reporting visited nodes to `monitor`.
	pub fn seek_monitored<'t>(
		&'t self,
		range: SeekRange<L::Key>,
		options: SeekOptions,
		monitor: &'t dyn SeekMonitor,
	) -> Result<TreeCursor<'t, L>> {
		let catchup = TripCountingRootCatchup::new(&self.root, self.config.root_catchup_trip_limit);
		SeekCursor::new(
			self.file.read_cursor(),
			&self.layout,
			Box::new(catchup),
			&self.generations,
			monitor,
			range,
			options,
		)
	}

	/// Looks up a single key.
	pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
		let mut cursor = self.seek(key.clone(), key.clone())?;
		if cursor.next()? {
			return Ok(Some(cursor.value()?.clone()));
		}
		Ok(None)
	}

	/// Splits `[from, to)` into at most `desired_partitions` disjoint, adjacent ranges of
	/// roughly equal key count, using the separators of the level above the leaves.
	///
	/// Only forward ranges can be partitioned.
	pub fn partitioned_seek(
		&self,
		from: L::Key,
		to: L::Key,
		desired_partitions: usize,
	) -> Result<Vec<SeekRange<L::Key>>> {
		if desired_partitions == 0 {
			return Err(Error::InvalidArgument("desired_partitions must be at least 1".into()));
		}
		match self.layout.compare(&from, &to) {
			KeyOrdering::Greater => {
				return Err(Error::InvalidArgument(
					"partitioned seeks require from <= to".into(),
				))
			}
			KeyOrdering::Equal => return Ok(vec![SeekRange::exclusive(from, to)]),
			KeyOrdering::Less => {}
		}

		let height = self.height();
		if desired_partitions == 1 || height < 2 {
			return Ok(vec![SeekRange::exclusive(from, to)]);
		}

		let options = SeekOptions::default()
			.with_read_ahead(self.config.read_ahead)
			.with_target_level(SeekLevel::Depth(height - 2));
		let mut separators = Vec::new();
		let mut cursor = self.seek_with(SeekRange::exclusive(from.clone(), to.clone()), options)?;
		while cursor.next()? {
			let key = cursor.key()?;
			if self.layout.compare(key, &from) == KeyOrdering::Greater {
				separators.push(key.clone());
			}
		}
		cursor.close();

		let boundaries: Vec<L::Key> = if separators.len() < desired_partitions {
			separators
		} else {
			let count = separators.len();
			(1..desired_partitions)
				.map(|i| separators[i * count / desired_partitions].clone())
				.collect()
		};

		let mut ranges = Vec::with_capacity(boundaries.len() + 1);
		let mut lower = from;
		for boundary in boundaries {
			if self.layout.compare(&boundary, &lower) != KeyOrdering::Greater {
				continue;
			}
			ranges.push(SeekRange::exclusive(lower, boundary.clone()));
			lower = boundary;
		}
		ranges.push(SeekRange::exclusive(lower, to));
		Ok(ranges)
	}
}

impl<L: Layout> std::fmt::Debug for Tree<L> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Tree")
			.field("root", &self.root())
			.field("height", &self.height())
			.field("generation", &self.generation())
			.finish_non_exhaustive()
	}
}

// ===========================================================================
// Test-Only Validation Module
// ===========================================================================

/// Invariant validation for testing.
#[cfg(any(test, feature = "test-utils"))]
impl<L: Layout> Tree<L> {
	/// Validates all tree invariants. Panics with diagnostic info if any invariant is violated.
	///
	/// Must not run concurrently with the writer.
	///
	/// # Invariants Checked
	///
	/// 1. Height consistency: all leaves at depth `height - 1`
	/// 2. Node type consistency: internal nodes above, leaves at the bottom
	/// 3. Key ordering: keys strictly increasing within each node
	/// 4. Separator bounds: keys of a subtree lie in `[lower, upper)` set by its parent
	/// 5. Generations: every reachable node is live (no successor) and no newer than the pointer
	///    leading to it
	/// 6. Sibling symmetry: each level is a doubly linked list in key order
	pub fn assert_invariants(&self) {
		let node = node::TreeNode::new(&self.layout, self.file.page_size());
		let snapshot = self.generation();
		let root = self.root();
		let height = self.height();
		assert!(height >= 1, "height must be at least 1");

		let mut levels: Vec<Vec<PageId>> = vec![Vec::new(); height];
		self.validate_node(&node, snapshot, root.id, root.generation, 0, None, None, &mut levels);

		// Invariant 6: Sibling symmetry
		for (depth, pages) in levels.iter().enumerate() {
			for (i, &page_id) in pages.iter().enumerate() {
				let mut view = self.file.peek(page_id).expect("reachable page");
				let left = node.left_sibling(&mut view, snapshot).expect("readable left sibling");
				let right = node.right_sibling(&mut view, snapshot).expect("readable right sibling");
				let expected_left = if i == 0 {
					page::NO_NODE
				} else {
					pages[i - 1]
				};
				let expected_right = pages.get(i + 1).copied().unwrap_or(page::NO_NODE);
				assert_eq!(
					left.pointer, expected_left,
					"page {page_id} at depth {depth}: left sibling mismatch"
				);
				assert_eq!(
					right.pointer, expected_right,
					"page {page_id} at depth {depth}: right sibling mismatch"
				);
			}
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn validate_node(
		&self,
		node: &node::TreeNode<'_, L>,
		snapshot: Generation,
		page_id: PageId,
		pointer_generation: u64,
		depth: usize,
		lower: Option<&L::Key>,
		upper: Option<&L::Key>,
		levels: &mut Vec<Vec<PageId>>,
	) {
		let height = levels.len();
		let mut view = self.file.peek(page_id).expect("reachable page");
		let header = node.read_header(&mut view);
		assert_eq!(header.page_type, node::PAGE_TYPE_TREE_NODE, "page {page_id} is not a tree node");

		// Invariant 5: Generations
		assert!(
			header.generation >= 1 && header.generation <= pointer_generation,
			"page {page_id}: generation {} not in 1..={pointer_generation}",
			header.generation
		);
		assert!(header.generation <= snapshot.unstable);
		let successor = node.successor(&mut view, snapshot).expect("readable successor");
		assert!(successor.is_none(), "reachable page {page_id} has successor {}", successor.pointer);

		// Invariants 1 and 2: Height and node type consistency
		let node_type = node::NodeType::from_u8(header.node_type).expect("known node type");
		let is_leaf_level = depth == height - 1;
		assert_eq!(
			node_type == node::NodeType::Leaf,
			is_leaf_level,
			"page {page_id}: {node_type:?} at depth {depth} (height={height})"
		);
		assert!(node.key_count_in_bounds(node_type, header.key_count));
		levels[depth].push(page_id);

		// Invariants 3 and 4: Key ordering and separator bounds
		let key_count = header.key_count as usize;
		let mut keys = Vec::with_capacity(key_count);
		for i in 0..key_count {
			let mut key = self.layout.new_key();
			node.key_at(&mut view, i, &mut key);
			if let Some(previous) = keys.last() {
				assert_eq!(
					self.layout.compare(previous, &key),
					KeyOrdering::Less,
					"page {page_id}: keys out of order at {i}"
				);
			}
			if let Some(lower) = lower {
				assert_ne!(
					self.layout.compare(&key, lower),
					KeyOrdering::Less,
					"page {page_id}: key {key:?} below lower bound {lower:?}"
				);
			}
			if let Some(upper) = upper {
				assert_eq!(
					self.layout.compare(&key, upper),
					KeyOrdering::Less,
					"page {page_id}: key {key:?} not below upper bound {upper:?}"
				);
			}
			keys.push(key);
		}

		if node_type == node::NodeType::Internal {
			for i in 0..=key_count {
				let child = node.child_at(&mut view, i, snapshot).expect("readable child pointer");
				let child_lower = if i == 0 {
					lower
				} else {
					Some(&keys[i - 1])
				};
				let child_upper = if i == key_count {
					upper
				} else {
					Some(&keys[i])
				};
				self.validate_node(
					node,
					snapshot,
					child.pointer,
					child.generation,
					depth + 1,
					child_lower,
					child_upper,
					levels,
				);
			}
		}
	}
}
