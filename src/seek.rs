//! Seek cursor: ordered range reads over a tree that changes underneath the reader.
//!
//! A [`SeekCursor`] never takes a lock. Every group of page reads is repeated until the page
//! cursor reports it consistent, and everything read is then checked against the cursor's
//! [`Generation`] snapshot before it is trusted. When a check fails the cursor either reads the
//! node again, follows the pointer that explains the change, or starts over from the root,
//! resuming just past the last key it returned.
//!
//! ```text
//!              ┌──────────────────────────── restart from root ◄─────────────────────┐
//!              ▼                                                                      │
//!        Descending ──► Scanning ◄──► FollowingSibling                      any failed check
//!                          ▲  │
//!                          │  └──► FollowingSuccessor ──┐
//!                          └────────────────────────────┘
//!                          │
//!                          ▼
//!                        Ended              Closed (from anywhere)
//! ```
//!
//! ## Backward seeks
//!
//! Splits move keys to the right. A forward reader simply follows right siblings and sees moved
//! keys again, never skipping any. A backward reader can have keys moved past it, into the gap
//! between the node it is leaving and the node it is moving to. Before crossing to a left sibling
//! the cursor therefore *scouts* it through a linked page cursor: the scouted node must still
//! point back at the node being left, and its last key must not change between the scout and the
//! read after moving. Otherwise the crossing is retried from the node being left.
//!
//! When a backward reader re-reads a node and finds that its target key has moved to the right,
//! it moves right first and picks the moved keys up from there.

use std::cmp::Ordering;
use std::fmt;

use tracing::{debug, trace, warn};

use crate::config::{SeekLevel, SeekOptions};
use crate::error::{Error, Result, SeekDiagnostics};
use crate::generation::{Generation, GenerationSource};
use crate::layout::Layout;
use crate::monitor::SeekMonitor;
use crate::node::{NodeHeader, NodeType, TreeNode, PAGE_TYPE_TREE_NODE};
use crate::page::{is_node, PageCursor, PageId, PageRead, NO_NODE};
use crate::pointer::GenerationSafePointer;
use crate::root::{Root, RootCatchup};

/// Generation catch-ups tolerated on one node before restarting from root.
const MAX_CATCHUPS_PER_NODE: usize = 8;

/// Direction of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Forward,
	Reverse,
}

/// Key range of a seek.
///
/// `from` is inclusive and `to` exclusive. The seek runs forward if `from <= to` and backward
/// otherwise, in which case keys are returned in descending order from `from` down to, but
/// excluding, `to`.
#[derive(Debug, Clone)]
pub struct SeekRange<K> {
	pub from: K,
	pub to: K,
	exact_match: Option<bool>,
}

impl<K> SeekRange<K> {
	/// A range that is an exact match if `from == to`.
	pub fn new(from: K, to: K) -> Self {
		SeekRange {
			from,
			to,
			exact_match: None,
		}
	}

	/// A range that is never an exact match, so `from == to` is empty.
	pub fn exclusive(from: K, to: K) -> Self {
		SeekRange {
			from,
			to,
			exact_match: Some(false),
		}
	}
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Range with direction and exact-match resolved.
struct ResolvedRange<K> {
	from: K,
	to: K,
	exact_match: bool,
	direction: Direction,
}

impl<K> ResolvedRange<K> {
	fn resolve<L: Layout<Key = K>>(layout: &L, range: SeekRange<K>) -> Self {
		let order = layout.compare(&range.from, &range.to);
		let exact_match = range.exact_match.unwrap_or(order == Ordering::Equal);
		let direction = if order != Ordering::Greater {
			Direction::Forward
		} else {
			Direction::Reverse
		};
		ResolvedRange {
			from: range.from,
			to: range.to,
			exact_match,
			direction,
		}
	}

	#[inline]
	fn forward(&self) -> bool {
		self.direction == Direction::Forward
	}

	/// `key` has not passed the end of the range.
	#[inline]
	fn in_range<L: Layout<Key = K>>(&self, layout: &L, key: &K) -> bool {
		let order = layout.compare(key, &self.to);
		match (self.direction, self.exact_match) {
			(Direction::Forward, false) => order == Ordering::Less,
			(Direction::Forward, true) => order != Ordering::Greater,
			(Direction::Reverse, false) => order == Ordering::Greater,
			(Direction::Reverse, true) => order != Ordering::Less,
		}
	}

	/// `key` lies ahead of what the cursor already returned, or inside the start of the range if
	/// nothing was returned yet.
	#[inline]
	fn still_ahead<L: Layout<Key = K>>(&self, layout: &L, key: &K, previous: Option<&K>) -> bool {
		match previous {
			None => {
				let order = layout.compare(key, &self.from);
				if self.forward() {
					order != Ordering::Less
				} else {
					order != Ordering::Greater
				}
			}
			Some(previous) => {
				let order = layout.compare(key, previous);
				if self.forward() {
					order == Ordering::Greater
				} else {
					order == Ordering::Less
				}
			}
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	Descending,
	Scanning,
	FollowingSibling(GenerationSafePointer, Direction),
	FollowingSuccessor(GenerationSafePointer),
	RestartingFromRoot,
	Ended,
	Closed,
}

/// How the cursor arrived at the node it is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
	Descent,
	Rescan,
	MovedRight,
	CrossedRight,
	CrossedLeft,
}

/// The node the cursor is on and the pointer that led to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Location {
	page_id: PageId,
	generation: u64,
	depth: usize,
	node_type: Option<NodeType>,
}

impl Location {
	fn root(root: Root) -> Self {
		Location {
			page_id: root.id,
			generation: root.generation,
			depth: 0,
			node_type: None,
		}
	}

	fn sibling(&self, pointer: GenerationSafePointer) -> Self {
		Location {
			page_id: pointer.pointer,
			generation: pointer.generation,
			..*self
		}
	}
}

/// Fixed-capacity buffer of entries read in one pass.
struct ReadAheadBatch<K, V> {
	keys: Vec<K>,
	values: Vec<V>,
	capacity: usize,
	len: usize,
	next: usize,
}

impl<K, V> ReadAheadBatch<K, V> {
	fn new<L: Layout<Key = K, Value = V>>(layout: &L, size: usize) -> Self {
		ReadAheadBatch {
			keys: (0..size).map(|_| layout.new_key()).collect(),
			values: (0..size).map(|_| layout.new_value()).collect(),
			capacity: size,
			len: 0,
			next: 0,
		}
	}

	fn resize(&mut self, capacity: usize) {
		self.capacity = capacity.min(self.keys.len());
		self.clear();
	}

	#[inline]
	fn clear(&mut self) {
		self.len = 0;
		self.next = 0;
	}

	#[inline]
	fn is_full(&self) -> bool {
		self.len >= self.capacity
	}

	#[inline]
	fn key_slot(&mut self) -> &mut K {
		&mut self.keys[self.len]
	}

	#[inline]
	fn value_slot(&mut self) -> &mut V {
		&mut self.values[self.len]
	}

	#[inline]
	fn commit(&mut self) {
		self.len += 1;
	}

	#[inline]
	fn advance(&mut self) -> Option<usize> {
		if self.next < self.len {
			self.next += 1;
			Some(self.next - 1)
		} else {
			None
		}
	}
}

/// Why a scan pass stopped filling the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchEnd {
	Full,
	RangeEnded,
	NodeExhausted,
}

/// A consistent scan pass over one node.
#[derive(Debug, Clone, Copy)]
struct ScanPass {
	end: BatchEnd,
	right: GenerationSafePointer,
	left: GenerationSafePointer,
	has_last_key: bool,
	target_past_end: bool,
}

enum ScanOutcome {
	Invalid(&'static str),
	CatchUp,
	Successor(GenerationSafePointer),
	Filled(ScanPass),
}

enum DescentOutcome {
	Invalid(&'static str),
	CatchUp,
	Successor(GenerationSafePointer),
	Child {
		child: GenerationSafePointer,
		right: GenerationSafePointer,
		key_count: usize,
		past_end: bool,
	},
	Target {
		node_type: NodeType,
		key_count: usize,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
	First,
	Last,
}

enum ScoutOutcome {
	Invalid(&'static str),
	CatchUp,
	Node {
		right: GenerationSafePointer,
		has_key: bool,
	},
}

enum LeftRead {
	Invalid(&'static str),
	CatchUp,
	Pointer(GenerationSafePointer),
}

enum Crossing {
	Done,
	Retry(&'static str),
	Restart(&'static str),
}

/// Outcomes that say whether the page turned out not to be what the reader expected.
trait Checked {
	fn is_invalid(&self) -> bool;
}

macro_rules! impl_checked {
	($($ty:ident),*) => {
		$(impl Checked for $ty {
			fn is_invalid(&self) -> bool {
				matches!(self, $ty::Invalid(_))
			}
		})*
	};
}

impl_checked!(ScanOutcome, DescentOutcome, ScoutOutcome, LeftRead);

/// Runs `read` until the page cursor reports it consistent.
///
/// Out-of-bounds reads on a page that turned out not to be a valid node are expected and
/// dropped; on a valid node they are an I/O error.
fn read_with_retry<C, T, F>(page: &mut C, mut read: F) -> Result<T>
where
	C: PageCursor,
	T: Checked,
	F: FnMut(&mut C) -> T,
{
	loop {
		let outcome = read(page);
		if page.should_retry()? {
			continue;
		}
		if outcome.is_invalid() {
			page.clear_cursor_exception();
		} else {
			page.check_and_clear_cursor_exception()?;
		}
		return Ok(outcome);
	}
}

/// Header checks shared by every pass. Returns the decoded node type.
fn check_header<L: Layout>(
	node: &TreeNode<'_, L>,
	header: &NodeHeader,
	pointer_generation: u64,
	expected_type: Option<NodeType>,
	observed: &mut SeekDiagnostics,
) -> std::result::Result<NodeType, &'static str> {
	observed.node_type = Some(header.node_type);
	observed.generation = Some(header.generation);
	observed.expected_generation = Some(pointer_generation);
	observed.key_count = Some(header.key_count);
	if header.page_type != PAGE_TYPE_TREE_NODE {
		return Err("page is not a tree node");
	}
	let node_type = NodeType::from_u8(header.node_type).ok_or("unknown node type")?;
	if expected_type.is_some_and(|expected| expected != node_type) {
		return Err("node type differs from its level");
	}
	if !node.key_count_in_bounds(node_type, header.key_count) {
		return Err("key count out of bounds");
	}
	if header.generation == 0 || header.generation > pointer_generation {
		return Err("node is newer than the pointer that led to it");
	}
	Ok(node_type)
}

struct ScanContext<'k, K> {
	range: &'k ResolvedRange<K>,
	previous: Option<&'k K>,
	snapshot: Generation,
	location: Location,
}

fn scan_pass<L: Layout, P: PageRead + ?Sized>(
	node: &TreeNode<'_, L>,
	page: &mut P,
	scan: &ScanContext<'_, L::Key>,
	batch: &mut ReadAheadBatch<L::Key, L::Value>,
	scratch: &mut L::Key,
	last_key: &mut L::Key,
	observed: &mut SeekDiagnostics,
) -> ScanOutcome {
	batch.clear();
	let layout = node.layout();
	let header = node.read_header(page);
	let expected = scan.location.node_type;
	let node_type = match check_header(node, &header, scan.location.generation, expected, observed) {
		Ok(node_type) => node_type,
		Err(reason) => return ScanOutcome::Invalid(reason),
	};
	let Ok(successor) = node.successor(page, scan.snapshot) else {
		return ScanOutcome::CatchUp;
	};
	observed.successor = Some(successor.pointer);
	if !successor.is_none() {
		return ScanOutcome::Successor(successor);
	}
	let Ok(right) = node.right_sibling(page, scan.snapshot) else {
		return ScanOutcome::CatchUp;
	};
	let forward = scan.range.forward();
	let left = if forward {
		GenerationSafePointer::NONE
	} else {
		match node.left_sibling(page, scan.snapshot) {
			Ok(left) => left,
			Err(_) => return ScanOutcome::CatchUp,
		}
	};

	let key_count = header.key_count as usize;
	let has_last_key = key_count > 0;
	if has_last_key {
		node.key_at(page, key_count - 1, last_key);
	}

	let target = scan.previous.unwrap_or(&scan.range.from);
	let search = node.search(page, node_type, key_count, target, scratch);
	observed.search_position = Some(search.pos);
	observed.search_hit = Some(search.hit);

	let mut end = BatchEnd::NodeExhausted;
	if forward {
		let start = if scan.previous.is_some() && search.hit {
			search.pos + 1
		} else {
			search.pos
		};
		observed.position = Some(start);
		for pos in start..key_count {
			node.key_at(page, pos, batch.key_slot());
			if !scan.range.in_range(layout, &batch.keys[batch.len]) {
				end = BatchEnd::RangeEnded;
				break;
			}
			if !scan.range.still_ahead(layout, &batch.keys[batch.len], scan.previous) {
				continue;
			}
			if node_type == NodeType::Leaf {
				node.value_at(page, pos, batch.value_slot());
			}
			batch.commit();
			if batch.is_full() {
				if pos + 1 < key_count {
					end = BatchEnd::Full;
				}
				break;
			}
		}
	} else {
		let start = if scan.previous.is_none() && search.hit {
			Some(search.pos)
		} else {
			search.pos.checked_sub(1)
		};
		observed.position = start;
		if let Some(start) = start {
			for pos in (0..=start.min(key_count.saturating_sub(1))).rev() {
				node.key_at(page, pos, batch.key_slot());
				if !scan.range.in_range(layout, &batch.keys[batch.len]) {
					end = BatchEnd::RangeEnded;
					break;
				}
				if !scan.range.still_ahead(layout, &batch.keys[batch.len], scan.previous) {
					continue;
				}
				if node_type == NodeType::Leaf {
					node.value_at(page, pos, batch.value_slot());
				}
				batch.commit();
				if batch.is_full() {
					if pos > 0 {
						end = BatchEnd::Full;
					}
					break;
				}
			}
		}
	}

	ScanOutcome::Filled(ScanPass {
		end,
		right,
		left,
		has_last_key,
		target_past_end: key_count > 0 && search.pos >= key_count,
	})
}

#[allow(clippy::too_many_arguments)]
fn descent_pass<L: Layout, P: PageRead + ?Sized>(
	node: &TreeNode<'_, L>,
	page: &mut P,
	snapshot: Generation,
	location: Location,
	at_target_depth: bool,
	target: &L::Key,
	scratch: &mut L::Key,
	observed: &mut SeekDiagnostics,
) -> DescentOutcome {
	let header = node.read_header(page);
	let node_type = match check_header(node, &header, location.generation, None, observed) {
		Ok(node_type) => node_type,
		Err(reason) => return DescentOutcome::Invalid(reason),
	};
	let Ok(successor) = node.successor(page, snapshot) else {
		return DescentOutcome::CatchUp;
	};
	observed.successor = Some(successor.pointer);
	if !successor.is_none() {
		return DescentOutcome::Successor(successor);
	}
	let key_count = header.key_count as usize;
	if node_type == NodeType::Leaf || at_target_depth {
		return DescentOutcome::Target {
			node_type,
			key_count,
		};
	}

	let search = node.search(page, node_type, key_count, target, scratch);
	observed.search_position = Some(search.pos);
	observed.search_hit = Some(search.hit);
	let position = search.child_position();
	observed.position = Some(position);
	let Ok(child) = node.child_at(page, position, snapshot) else {
		return DescentOutcome::CatchUp;
	};
	if child.is_none() {
		return DescentOutcome::Invalid("child pointer is empty");
	}
	let past_end = search.pos >= key_count;
	let right = if past_end {
		match node.right_sibling(page, snapshot) {
			Ok(right) => right,
			Err(_) => return DescentOutcome::CatchUp,
		}
	} else {
		GenerationSafePointer::NONE
	};
	DescentOutcome::Child {
		child,
		right,
		key_count,
		past_end,
	}
}

#[allow(clippy::too_many_arguments)]
fn scout_pass<L: Layout, P: PageRead + ?Sized>(
	node: &TreeNode<'_, L>,
	page: &mut P,
	snapshot: Generation,
	target: GenerationSafePointer,
	expected_type: Option<NodeType>,
	edge: Edge,
	into: &mut L::Key,
	observed: &mut SeekDiagnostics,
) -> ScoutOutcome {
	let header = node.read_header(page);
	// A scouted node of an unexpected type fails the scout; it never fails the seek.
	if let Err(reason) = check_header(node, &header, target.generation, expected_type, observed) {
		return ScoutOutcome::Invalid(reason);
	}
	match node.successor(page, snapshot) {
		Ok(successor) if successor.is_none() => {}
		Ok(_) => return ScoutOutcome::Invalid("scouted node was replaced"),
		Err(_) => return ScoutOutcome::CatchUp,
	}
	let Ok(right) = node.right_sibling(page, snapshot) else {
		return ScoutOutcome::CatchUp;
	};
	let key_count = header.key_count as usize;
	let has_key = key_count > 0;
	if has_key {
		let pos = match edge {
			Edge::First => 0,
			Edge::Last => key_count - 1,
		};
		node.key_at(page, pos, into);
	}
	ScoutOutcome::Node {
		right,
		has_key,
	}
}

fn left_sibling_pass<L: Layout, P: PageRead + ?Sized>(
	node: &TreeNode<'_, L>,
	page: &mut P,
	snapshot: Generation,
	location: Location,
	observed: &mut SeekDiagnostics,
) -> LeftRead {
	let header = node.read_header(page);
	if let Err(reason) =
		check_header(node, &header, location.generation, location.node_type, observed)
	{
		return LeftRead::Invalid(reason);
	}
	match node.successor(page, snapshot) {
		Ok(successor) if successor.is_none() => {}
		Ok(_) => return LeftRead::Invalid("node was replaced while crossing"),
		Err(_) => return LeftRead::CatchUp,
	}
	match node.left_sibling(page, snapshot) {
		Ok(left) => LeftRead::Pointer(left),
		Err(_) => LeftRead::CatchUp,
	}
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// A lock-free cursor over a key range.
///
/// Keys come back strictly increasing (forward) or strictly decreasing (backward), without
/// duplicates or gaps, while a concurrent writer splits nodes, replaces them with successors and
/// reuses freed pages. References returned by [`key`](Self::key) and [`value`](Self::value) are
/// valid until the next call to [`next`](Self::next).
pub struct SeekCursor<'a, L: Layout, C: PageCursor> {
	node: TreeNode<'a, L>,
	cursor: C,
	scout: Option<C>,
	root_catchup: Box<dyn RootCatchup + 'a>,
	generations: &'a dyn GenerationSource,
	monitor: &'a dyn SeekMonitor,
	options: SeekOptions,

	range: ResolvedRange<L::Key>,
	snapshot: Generation,
	state: State,
	location: Location,
	arrival: Arrival,
	batch: ReadAheadBatch<L::Key, L::Value>,

	previous_key: L::Key,
	first_result_seen: bool,
	has_current: bool,
	ended: bool,

	scratch: L::Key,
	last_key: L::Key,
	scout_key: L::Key,
	catchups: usize,
	restarts: usize,
	total_restarts: usize,
	restart_reason: &'static str,
	observed: SeekDiagnostics,
}

impl<'a, L: Layout, C: PageCursor> SeekCursor<'a, L, C> {
	/// Creates a cursor over `range` and performs the initial descent.
	pub fn new(
		cursor: C,
		layout: &'a L,
		root_catchup: Box<dyn RootCatchup + 'a>,
		generations: &'a dyn GenerationSource,
		monitor: &'a dyn SeekMonitor,
		range: SeekRange<L::Key>,
		options: SeekOptions,
	) -> Result<Self> {
		options.validate()?;
		let node = TreeNode::new(layout, cursor.page_size());
		let range = ResolvedRange::resolve(layout, range);
		// One pass never reads past the end of a node.
		let batch_size = options.read_ahead.min(node.max_leaf_keys().max(node.max_internal_keys()));
		let batch = ReadAheadBatch::new(layout, batch_size);
		let mut seek = SeekCursor {
			node,
			cursor,
			scout: None,
			root_catchup,
			generations,
			monitor,
			options,
			range,
			snapshot: generations.current(),
			state: State::Descending,
			location: Location::root(Root::new(NO_NODE, 0)),
			arrival: Arrival::Descent,
			batch,
			previous_key: layout.new_key(),
			first_result_seen: false,
			has_current: false,
			ended: false,
			scratch: layout.new_key(),
			last_key: layout.new_key(),
			scout_key: layout.new_key(),
			catchups: 0,
			restarts: 0,
			total_restarts: 0,
			restart_reason: "",
			observed: SeekDiagnostics::default(),
		};
		seek.initialize()?;
		Ok(seek)
	}

	fn initialize(&mut self) -> Result<()> {
		self.snapshot = self.generations.current();
		let size = if self.range.exact_match {
			1
		} else {
			self.options.read_ahead
		};
		self.batch.resize(size);
		self.first_result_seen = false;
		self.has_current = false;
		self.ended = false;
		self.catchups = 0;
		self.restarts = 0;
		let root = self.root_catchup.catchup(NO_NODE)?;
		self.location = Location::root(root);
		self.arrival = Arrival::Descent;
		self.state = State::Descending;
		self.run(|seek| seek.state == State::Descending)
	}

	/// Direction of the current range.
	pub fn direction(&self) -> Direction {
		self.range.direction
	}

	/// Restarts from root since the cursor was created.
	pub fn restarts(&self) -> usize {
		self.total_restarts
	}

	/// Advances to the next entry. Returns `false` once the range is exhausted.
	pub fn next(&mut self) -> Result<bool> {
		if self.state == State::Closed {
			return Err(Error::CursorClosed);
		}
		if self.ended {
			return Ok(false);
		}
		loop {
			if let Some(index) = self.batch.advance() {
				self.node.layout().copy_key(&self.batch.keys[index], &mut self.previous_key);
				self.first_result_seen = true;
				self.has_current = true;
				self.restarts = 0;
				if self.range.exact_match {
					self.state = State::Ended;
				}
				return Ok(true);
			}
			self.has_current = false;
			if self.state == State::Ended {
				self.ended = true;
				return Ok(false);
			}
			self.step()?;
		}
	}

	/// Key of the current entry.
	pub fn key(&self) -> Result<&L::Key> {
		self.current().map(|index| &self.batch.keys[index])
	}

	/// Value of the current entry. Meaningless when seeking an internal level.
	pub fn value(&self) -> Result<&L::Value> {
		self.current().map(|index| &self.batch.values[index])
	}

	fn current(&self) -> Result<usize> {
		if self.state == State::Closed {
			return Err(Error::CursorClosed);
		}
		if !self.has_current {
			return Err(Error::NoCurrentEntry);
		}
		Ok(self.batch.next - 1)
	}

	/// Releases the page cursors. Idempotent.
	pub fn close(&mut self) {
		if let Some(mut scout) = self.scout.take() {
			scout.close();
		}
		self.cursor.close();
		self.batch.clear();
		self.has_current = false;
		self.state = State::Closed;
	}

	/// Starts over on a new range, keeping read-ahead, target level and buffers.
	pub fn reinitialize_to_new_range(&mut self, from: L::Key, to: L::Key) -> Result<()> {
		self.reinitialize(SeekRange::new(from, to))
	}

	/// Like [`reinitialize_to_new_range`](Self::reinitialize_to_new_range) with an explicit
	/// [`SeekRange`].
	pub fn reinitialize(&mut self, range: SeekRange<L::Key>) -> Result<()> {
		match self.state {
			State::Closed => return Err(Error::CursorClosed),
			_ if self.ended => return Err(Error::CursorEnded),
			_ => {}
		}
		self.range = ResolvedRange::resolve(self.node.layout(), range);
		self.initialize()
	}

	// -----------------------------------------------------------------------
	// State machine
	// -----------------------------------------------------------------------

	/// Steps the state machine while `keep_going` holds.
	fn run(&mut self, keep_going: impl Fn(&Self) -> bool) -> Result<()> {
		while keep_going(self) || self.state == State::RestartingFromRoot {
			self.step()?;
		}
		Ok(())
	}

	fn step(&mut self) -> Result<()> {
		match self.state {
			State::Descending => self.descend(),
			State::Scanning => {
				let outcome = self.scan_current()?;
				self.process_scan(outcome)
			}
			State::FollowingSibling(pointer, Direction::Forward) => {
				let arrival = if self.range.forward() {
					Arrival::CrossedRight
				} else {
					Arrival::MovedRight
				};
				self.move_to(self.location.sibling(pointer), arrival)
			}
			State::FollowingSibling(pointer, Direction::Reverse) => self.cross_backward(pointer),
			State::FollowingSuccessor(pointer) => {
				trace!(from = self.location.page_id, to = pointer.pointer, "following successor");
				self.move_to(self.location.sibling(pointer), self.arrival)
			}
			State::RestartingFromRoot => self.restart_from_root(),
			State::Ended | State::Closed => Ok(()),
		}
	}

	fn move_to(&mut self, location: Location, arrival: Arrival) -> Result<()> {
		if !is_node(location.page_id) {
			self.begin_restart("pointer does not name a tree node");
			return Ok(());
		}
		self.cursor.next(location.page_id)?;
		self.location = location;
		self.arrival = arrival;
		self.catchups = 0;
		self.observed.pointer_followed = Some((location.page_id, location.generation));
		self.state = State::Scanning;
		Ok(())
	}

	fn begin_restart(&mut self, reason: &'static str) {
		trace!(page = self.location.page_id, reason, "seek lost its position");
		self.restart_reason = reason;
		self.batch.clear();
		self.state = State::RestartingFromRoot;
	}

	fn catch_up(&mut self) -> bool {
		self.catchups += 1;
		if self.catchups > MAX_CATCHUPS_PER_NODE {
			self.begin_restart("generation catch-up did not settle");
			return false;
		}
		let previous = self.snapshot;
		self.snapshot = self.generations.current();
		debug!(
			page = self.location.page_id,
			from = %previous,
			to = %self.snapshot,
			"generation catch-up"
		);
		true
	}

	fn restart_from_root(&mut self) -> Result<()> {
		self.restarts += 1;
		self.total_restarts += 1;
		if self.restarts > self.options.max_restarts {
			let diagnostics = self.diagnostics();
			warn!(%diagnostics, reason = self.restart_reason, "seek gave up on tree");
			self.state = State::Ended;
			self.ended = true;
			return Err(Error::inconsistency(self.restart_reason, diagnostics));
		}
		debug!(
			page = self.location.page_id,
			reason = self.restart_reason,
			restarts = self.restarts,
			"restarting seek from root"
		);
		self.snapshot = self.generations.current();
		let root = match self.root_catchup.catchup(self.location.page_id) {
			Ok(root) => root,
			Err(err) => {
				self.state = State::Ended;
				self.ended = true;
				return Err(err);
			}
		};
		self.location = Location::root(root);
		self.arrival = Arrival::Descent;
		self.catchups = 0;
		self.state = State::Descending;
		Ok(())
	}

	/// Snapshot of the cursor for error reports.
	pub fn diagnostics(&self) -> SeekDiagnostics {
		SeekDiagnostics {
			page_id: self.location.page_id,
			stable_generation: self.snapshot.stable,
			unstable_generation: self.snapshot.unstable,
			depth: self.location.depth,
			restarts: self.restarts,
			..self.observed.clone()
		}
	}

	// -----------------------------------------------------------------------
	// Descent
	// -----------------------------------------------------------------------

	fn descend(&mut self) -> Result<()> {
		let mut location = self.location;
		loop {
			if !is_node(location.page_id) {
				self.location = location;
				self.begin_restart("pointer does not name a tree node");
				return Ok(());
			}
			self.cursor.next(location.page_id)?;
			self.observed.pointer_followed = Some((location.page_id, location.generation));
			let at_target_depth = match self.options.target_level {
				SeekLevel::Leaf => false,
				SeekLevel::Depth(depth) => location.depth >= depth,
			};
			let target = if self.first_result_seen {
				&self.previous_key
			} else {
				&self.range.from
			};
			let snapshot = self.snapshot;
			let outcome = read_with_retry(&mut self.cursor, |page| {
				descent_pass(
					&self.node,
					page,
					snapshot,
					location,
					at_target_depth,
					target,
					&mut self.scratch,
					&mut self.observed,
				)
			})?;
			self.location = location;

			match outcome {
				DescentOutcome::Invalid(reason) => {
					self.begin_restart(reason);
					return Ok(());
				}
				DescentOutcome::CatchUp => {
					if !self.catch_up() {
						return Ok(());
					}
				}
				DescentOutcome::Successor(successor) => {
					trace!(page = location.page_id, successor = successor.pointer, "descent follows successor");
					location = location.sibling(successor);
				}
				DescentOutcome::Child {
					child,
					right,
					key_count,
					past_end,
				} => {
					self.catchups = 0;
					if past_end && !right.is_none() && self.right_covers_target(location, right)? {
						trace!(page = location.page_id, right = right.pointer, "descent moves right");
						location = location.sibling(right);
						continue;
					}
					self.monitor.internal_node(location.depth, key_count);
					trace!(page = location.page_id, depth = location.depth, child = child.pointer, "descending");
					location = Location {
						page_id: child.pointer,
						generation: child.generation,
						depth: location.depth + 1,
						node_type: None,
					};
				}
				DescentOutcome::Target {
					node_type,
					key_count,
				} => {
					self.monitor.leaf_node(location.depth, key_count);
					self.catchups = 0;
					self.location = Location {
						node_type: Some(node_type),
						..location
					};
					self.arrival = Arrival::Descent;
					self.state = State::Scanning;
					return Ok(());
				}
			}
		}
	}

	/// Scouts the first key of `right` and reports whether the descent target belongs there.
	fn right_covers_target(&mut self, location: Location, right: GenerationSafePointer) -> Result<bool> {
		let outcome = self.scout(right, location.node_type, Edge::First)?;
		let ScoutOutcome::Node {
			has_key: true,
			..
		} = outcome
		else {
			return Ok(false);
		};
		let layout = self.node.layout();
		let target = if self.first_result_seen {
			&self.previous_key
		} else {
			&self.range.from
		};
		Ok(layout.compare(target, &self.scout_key) != Ordering::Less)
	}

	fn scout(
		&mut self,
		target: GenerationSafePointer,
		expected_type: Option<NodeType>,
		edge: Edge,
	) -> Result<ScoutOutcome> {
		if !is_node(target.pointer) {
			return Ok(ScoutOutcome::Invalid("pointer does not name a tree node"));
		}
		let mut scout = match self.scout.take() {
			Some(scout) => scout,
			None => self.cursor.open_linked_cursor()?,
		};
		let snapshot = self.snapshot;
		let outcome = match scout.next(target.pointer) {
			Ok(()) => read_with_retry(&mut scout, |page| {
				scout_pass(
					&self.node,
					page,
					snapshot,
					target,
					expected_type,
					edge,
					&mut self.scout_key,
					&mut self.observed,
				)
			}),
			Err(err) => Err(err),
		};
		self.scout = Some(scout);
		outcome
	}

	// -----------------------------------------------------------------------
	// Scanning
	// -----------------------------------------------------------------------

	fn scan_current(&mut self) -> Result<ScanOutcome> {
		let scan = ScanContext {
			range: &self.range,
			previous: self.first_result_seen.then_some(&self.previous_key),
			snapshot: self.snapshot,
			location: self.location,
		};
		read_with_retry(&mut self.cursor, |page| {
			scan_pass(
				&self.node,
				page,
				&scan,
				&mut self.batch,
				&mut self.scratch,
				&mut self.last_key,
				&mut self.observed,
			)
		})
	}

	fn process_scan(&mut self, outcome: ScanOutcome) -> Result<()> {
		match outcome {
			ScanOutcome::Invalid(reason) => self.begin_restart(reason),
			// On failure the cursor is already restarting; otherwise the node is scanned again.
			ScanOutcome::CatchUp => {
				self.catch_up();
			}
			ScanOutcome::Successor(successor) => self.state = State::FollowingSuccessor(successor),
			ScanOutcome::Filled(pass) => {
				self.catchups = 0;
				if !self.range.forward()
					&& self.arrival != Arrival::CrossedLeft
					&& pass.target_past_end
					&& !pass.right.is_none()
				{
					let moved = self.keys_moved_right(pass.right)?;
					if self.state == State::RestartingFromRoot {
						return Ok(());
					}
					if moved {
						trace!(page = self.location.page_id, right = pass.right.pointer, "keys moved right");
						self.batch.clear();
						self.state = State::FollowingSibling(pass.right, Direction::Forward);
						return Ok(());
					}
				}
				self.apply_pass(pass);
			}
		}
		Ok(())
	}

	fn apply_pass(&mut self, pass: ScanPass) {
		self.state = match pass.end {
			BatchEnd::Full => {
				self.arrival = Arrival::Rescan;
				State::Scanning
			}
			BatchEnd::RangeEnded => State::Ended,
			BatchEnd::NodeExhausted => {
				let sibling = match self.range.direction {
					Direction::Forward => pass.right,
					Direction::Reverse => pass.left,
				};
				if sibling.is_none() {
					State::Ended
				} else {
					State::FollowingSibling(sibling, self.range.direction)
				}
			}
		};
	}

	/// Backward seeks only: whether keys the cursor still has to return now live to the right.
	fn keys_moved_right(&mut self, right: GenerationSafePointer) -> Result<bool> {
		match self.scout(right, self.location.node_type, Edge::First)? {
			ScoutOutcome::Node {
				has_key,
				..
			} => {
				if !has_key {
					return Ok(false);
				}
				let previous = self.first_result_seen.then_some(&self.previous_key);
				Ok(self.range.still_ahead(self.node.layout(), &self.scout_key, previous))
			}
			// Moving right is always safe, just slower.
			ScoutOutcome::Invalid(_) => Ok(true),
			// A failed catch-up has already sent the cursor back to the root.
			ScoutOutcome::CatchUp => Ok(self.catch_up()),
		}
	}

	// -----------------------------------------------------------------------
	// Backward crossing
	// -----------------------------------------------------------------------

	fn cross_backward(&mut self, left: GenerationSafePointer) -> Result<()> {
		let from = self.location;
		let mut left = left;
		for attempt in 1..=self.options.max_crossing_attempts {
			let reason = match self.try_cross_backward(from, left)? {
				Crossing::Done => return Ok(()),
				Crossing::Restart(reason) => {
					self.begin_restart(reason);
					return Ok(());
				}
				Crossing::Retry(reason) => reason,
			};
			debug!(from = from.page_id, left = left.pointer, attempt, reason, "retrying backward crossing");
			self.batch.clear();
			match self.reread_left_sibling(from)? {
				Some(pointer) if pointer.is_none() => {
					self.location = from;
					self.state = State::Ended;
					return Ok(());
				}
				Some(pointer) => left = pointer,
				None => return Ok(()),
			}
		}
		self.location = from;
		self.begin_restart("backward crossing did not settle");
		Ok(())
	}

	fn try_cross_backward(&mut self, from: Location, left: GenerationSafePointer) -> Result<Crossing> {
		if !is_node(left.pointer) {
			return Ok(Crossing::Restart("pointer does not name a tree node"));
		}
		let scouted_has_key = match self.scout(left, from.node_type, Edge::Last)? {
			ScoutOutcome::Invalid(reason) => return Ok(Crossing::Retry(reason)),
			ScoutOutcome::CatchUp => {
				if !self.catch_up() {
					return Ok(Crossing::Restart("generation catch-up did not settle"));
				}
				return Ok(Crossing::Retry("pointer generation ahead while scouting"));
			}
			ScoutOutcome::Node {
				right,
				has_key,
			} => {
				if right.pointer != from.page_id {
					return Ok(Crossing::Retry("left sibling does not point back"));
				}
				has_key
			}
		};

		self.cursor.next(left.pointer)?;
		self.location = from.sibling(left);
		self.arrival = Arrival::CrossedLeft;
		self.observed.pointer_followed = Some((left.pointer, left.generation));
		let pass = match self.scan_current()? {
			ScanOutcome::Filled(pass) => pass,
			ScanOutcome::CatchUp => {
				if !self.catch_up() {
					return Ok(Crossing::Restart("generation catch-up did not settle"));
				}
				return Ok(Crossing::Retry("pointer generation ahead after crossing"));
			}
			ScanOutcome::Successor(_) => return Ok(Crossing::Retry("left sibling was replaced")),
			ScanOutcome::Invalid(reason) => return Ok(Crossing::Retry(reason)),
		};
		let unchanged = pass.has_last_key == scouted_has_key
			&& (!scouted_has_key
				|| self.node.layout().compare(&self.last_key, &self.scout_key) == Ordering::Equal);
		if !unchanged {
			return Ok(Crossing::Retry("left sibling changed while crossing"));
		}
		self.catchups = 0;
		self.apply_pass(pass);
		Ok(Crossing::Done)
	}

	/// Goes back to `from` and reads its left sibling again. `None` means the cursor restarts.
	fn reread_left_sibling(&mut self, from: Location) -> Result<Option<GenerationSafePointer>> {
		self.location = from;
		self.cursor.next(from.page_id)?;
		loop {
			let snapshot = self.snapshot;
			let outcome = read_with_retry(&mut self.cursor, |page| {
				left_sibling_pass(&self.node, page, snapshot, from, &mut self.observed)
			})?;
			match outcome {
				LeftRead::Pointer(pointer) => return Ok(Some(pointer)),
				LeftRead::Invalid(reason) => {
					self.begin_restart(reason);
					return Ok(None);
				}
				LeftRead::CatchUp => {
					if !self.catch_up() {
						return Ok(None);
					}
				}
			}
		}
	}
}

impl<L: Layout, C: PageCursor> fmt::Debug for SeekCursor<'_, L, C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SeekCursor")
			.field("state", &self.state)
			.field("direction", &self.range.direction)
			.field("exact_match", &self.range.exact_match)
			.field("page_id", &self.location.page_id)
			.field("depth", &self.location.depth)
			.field("snapshot", &self.snapshot)
			.field("restarts", &self.total_restarts)
			.finish()
	}
}

impl<L: Layout, C: PageCursor> Drop for SeekCursor<'_, L, C> {
	fn drop(&mut self) {
		if self.state != State::Closed {
			self.close();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::layout::U64Layout;

	fn range(from: u64, to: u64) -> ResolvedRange<u64> {
		ResolvedRange::resolve(&U64Layout::new(), SeekRange::new(from, to))
	}

	#[test]
	fn direction_and_exact_match_follow_bounds() {
		assert_eq!(range(1, 5).direction, Direction::Forward);
		assert!(!range(1, 5).exact_match);
		assert_eq!(range(5, 1).direction, Direction::Reverse);
		assert!(range(3, 3).exact_match);
		let exclusive = ResolvedRange::resolve(&U64Layout::new(), SeekRange::exclusive(3u64, 3));
		assert!(!exclusive.exact_match);
		assert_eq!(exclusive.direction, Direction::Forward);
	}

	#[test]
	fn forward_predicates() {
		let layout = U64Layout::new();
		let r = range(10, 20);
		assert!(r.in_range(&layout, &19));
		assert!(!r.in_range(&layout, &20));
		assert!(r.still_ahead(&layout, &10, None));
		assert!(!r.still_ahead(&layout, &9, None));
		assert!(r.still_ahead(&layout, &13, Some(&12)));
		assert!(!r.still_ahead(&layout, &12, Some(&12)));
	}

	#[test]
	fn backward_predicates() {
		let layout = U64Layout::new();
		let r = range(20, 10);
		assert!(r.in_range(&layout, &11));
		assert!(!r.in_range(&layout, &10));
		assert!(r.still_ahead(&layout, &20, None));
		assert!(!r.still_ahead(&layout, &21, None));
		assert!(r.still_ahead(&layout, &14, Some(&15)));
		assert!(!r.still_ahead(&layout, &15, Some(&15)));
	}

	#[test]
	fn exact_match_includes_upper_bound() {
		let layout = U64Layout::new();
		let r = range(7, 7);
		assert!(r.in_range(&layout, &7));
		assert!(!r.in_range(&layout, &8));
	}

	#[test]
	fn batch_drains_in_order() {
		let layout = U64Layout::new();
		let mut batch = ReadAheadBatch::new(&layout, 3);
		for key in [4u64, 5, 6] {
			*batch.key_slot() = key;
			batch.commit();
		}
		assert!(batch.is_full());
		let mut drained = Vec::new();
		while let Some(index) = batch.advance() {
			drained.push(batch.keys[index]);
		}
		assert_eq!(drained, vec![4, 5, 6]);

		batch.resize(1);
		assert!(!batch.is_full());
		*batch.key_slot() = 9;
		batch.commit();
		assert!(batch.is_full());
	}
}
