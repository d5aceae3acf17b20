//! On-page node format.
//!
//! ```text
//! ┌──────┬──────┬────────────┬───────────┬───────────┬───────────┬───────────┬──────────────┐
//! │ page │ node │ generation │   right   │   left    │ successor │ key count │     body     │
//! │ type │ type │    u64     │ GSPP (36) │ GSPP (36) │ GSPP (36) │    u32    │              │
//! └──────┴──────┴────────────┴───────────┴───────────┴───────────┴───────────┴──────────────┘
//!  0      1      2            10          46          82          118         122
//!
//! leaf body:      key[0] .. key[max_leaf-1]          value[0] .. value[max_leaf-1]
//! internal body:  key[0] .. key[max_internal-1]      child[0] .. child[max_internal] (GSPPs)
//! ```
//!
//! In an internal node `child[i]` holds keys `< key[i]` and `child[i + 1]` keys `>= key[i]`.
//!
//! Readers go through [`TreeNode`] with any [`PageRead`], including optimistic cursors over pages
//! that may not be nodes at all. Nothing here validates the page; callers check the header and
//! the page cursor's retry signal.

use std::cmp::Ordering;

use crate::generation::Generation;
use crate::layout::Layout;
use crate::page::{PageId, PageRead, PageWrite};
use crate::pointer::{self, GenerationSafePointer, PointerFailure, PAIR_SIZE};

pub const PAGE_TYPE_OFFSET: usize = 0;
pub const NODE_TYPE_OFFSET: usize = 1;
pub const GENERATION_OFFSET: usize = 2;
pub const RIGHT_SIBLING_OFFSET: usize = 10;
pub const LEFT_SIBLING_OFFSET: usize = RIGHT_SIBLING_OFFSET + PAIR_SIZE;
pub const SUCCESSOR_OFFSET: usize = LEFT_SIBLING_OFFSET + PAIR_SIZE;
pub const KEY_COUNT_OFFSET: usize = SUCCESSOR_OFFSET + PAIR_SIZE;
pub const HEADER_SIZE: usize = KEY_COUNT_OFFSET + 4;

/// Page type byte of a tree node.
pub const PAGE_TYPE_TREE_NODE: u8 = 1;

/// Kind of tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
	Leaf = 1,
	Internal = 2,
}

impl NodeType {
	/// Decodes a node type byte.
	pub fn from_u8(raw: u8) -> Option<NodeType> {
		match raw {
			1 => Some(NodeType::Leaf),
			2 => Some(NodeType::Internal),
			_ => None,
		}
	}
}

/// Raw header fields, exactly as read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
	pub page_type: u8,
	pub node_type: u8,
	pub generation: u64,
	pub key_count: u32,
}

/// Result of a binary search over a node's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
	/// Position of the first key `>= target`.
	pub pos: usize,
	/// The key at `pos` equals the target.
	pub hit: bool,
}

impl SearchResult {
	/// Child to descend into in an internal node.
	#[inline]
	pub fn child_position(&self) -> usize {
		if self.hit {
			self.pos + 1
		} else {
			self.pos
		}
	}
}

/// Node accessors for a given layout and page size.
pub struct TreeNode<'a, L: Layout> {
	layout: &'a L,
	page_size: usize,
	max_leaf_keys: usize,
	max_internal_keys: usize,
}

impl<'a, L: Layout> TreeNode<'a, L> {
	pub fn new(layout: &'a L, page_size: usize) -> Self {
		let body = page_size.saturating_sub(HEADER_SIZE);
		let max_leaf_keys = body / (layout.key_size() + layout.value_size());
		let max_internal_keys = body.saturating_sub(PAIR_SIZE) / (layout.key_size() + PAIR_SIZE);
		TreeNode {
			layout,
			page_size,
			max_leaf_keys,
			max_internal_keys,
		}
	}

	#[inline]
	pub fn layout(&self) -> &'a L {
		self.layout
	}

	#[inline]
	pub fn page_size(&self) -> usize {
		self.page_size
	}

	#[inline]
	pub fn max_leaf_keys(&self) -> usize {
		self.max_leaf_keys
	}

	#[inline]
	pub fn max_internal_keys(&self) -> usize {
		self.max_internal_keys
	}

	/// Maximum key count for a node of the given type.
	#[inline]
	pub fn max_key_count(&self, node_type: NodeType) -> usize {
		match node_type {
			NodeType::Leaf => self.max_leaf_keys,
			NodeType::Internal => self.max_internal_keys,
		}
	}

	/// Returns `true` if `key_count` is possible for a node of `node_type`.
	#[inline]
	pub fn key_count_in_bounds(&self, node_type: NodeType, key_count: u32) -> bool {
		(key_count as usize) <= self.max_key_count(node_type)
	}

	// -----------------------------------------------------------------------
	// Header
	// -----------------------------------------------------------------------

	pub fn read_header<P: PageRead + ?Sized>(&self, page: &mut P) -> NodeHeader {
		NodeHeader {
			page_type: page.get_u8(PAGE_TYPE_OFFSET),
			node_type: page.get_u8(NODE_TYPE_OFFSET),
			generation: page.get_u64(GENERATION_OFFSET),
			key_count: page.get_u32(KEY_COUNT_OFFSET),
		}
	}

	#[inline]
	pub fn key_count<P: PageRead + ?Sized>(&self, page: &mut P) -> u32 {
		page.get_u32(KEY_COUNT_OFFSET)
	}

	#[inline]
	pub fn generation<P: PageRead + ?Sized>(&self, page: &mut P) -> u64 {
		page.get_u64(GENERATION_OFFSET)
	}

	#[inline]
	pub fn node_type<P: PageRead + ?Sized>(&self, page: &mut P) -> Option<NodeType> {
		NodeType::from_u8(page.get_u8(NODE_TYPE_OFFSET))
	}

	pub fn right_sibling<P: PageRead + ?Sized>(
		&self,
		page: &mut P,
		snapshot: Generation,
	) -> Result<GenerationSafePointer, PointerFailure> {
		pointer::read(page, RIGHT_SIBLING_OFFSET, snapshot)
	}

	pub fn left_sibling<P: PageRead + ?Sized>(
		&self,
		page: &mut P,
		snapshot: Generation,
	) -> Result<GenerationSafePointer, PointerFailure> {
		pointer::read(page, LEFT_SIBLING_OFFSET, snapshot)
	}

	pub fn successor<P: PageRead + ?Sized>(
		&self,
		page: &mut P,
		snapshot: Generation,
	) -> Result<GenerationSafePointer, PointerFailure> {
		pointer::read(page, SUCCESSOR_OFFSET, snapshot)
	}

	// -----------------------------------------------------------------------
	// Body
	// -----------------------------------------------------------------------

	#[inline]
	fn key_offset(&self, pos: usize) -> usize {
		HEADER_SIZE + pos * self.layout.key_size()
	}

	#[inline]
	fn value_offset(&self, pos: usize) -> usize {
		HEADER_SIZE + self.max_leaf_keys * self.layout.key_size() + pos * self.layout.value_size()
	}

	#[inline]
	fn child_offset(&self, pos: usize) -> usize {
		HEADER_SIZE + self.max_internal_keys * self.layout.key_size() + pos * PAIR_SIZE
	}

	pub fn key_at<P: PageRead + ?Sized>(&self, page: &mut P, pos: usize, into: &mut L::Key) {
		self.layout.read_key(page, self.key_offset(pos), into);
	}

	pub fn value_at<P: PageRead + ?Sized>(&self, page: &mut P, pos: usize, into: &mut L::Value) {
		self.layout.read_value(page, self.value_offset(pos), into);
	}

	pub fn key_value_at<P: PageRead + ?Sized>(
		&self,
		page: &mut P,
		pos: usize,
		key: &mut L::Key,
		value: &mut L::Value,
	) {
		self.key_at(page, pos, key);
		self.value_at(page, pos, value);
	}

	pub fn child_at<P: PageRead + ?Sized>(
		&self,
		page: &mut P,
		pos: usize,
		snapshot: Generation,
	) -> Result<GenerationSafePointer, PointerFailure> {
		pointer::read(page, self.child_offset(pos), snapshot)
	}

	/// Binary search for `target` among the first `key_count` keys, reading keys into `scratch`.
	///
	/// `key_count` is clamped to what the node type allows so a garbage count cannot walk off
	/// the page.
	pub fn search<P: PageRead + ?Sized>(
		&self,
		page: &mut P,
		node_type: NodeType,
		key_count: usize,
		target: &L::Key,
		scratch: &mut L::Key,
	) -> SearchResult {
		let mut lower = 0;
		let mut upper = key_count.min(self.max_key_count(node_type));
		while lower < upper {
			let mid = lower + (upper - lower) / 2;
			self.key_at(page, mid, scratch);
			match self.layout.compare(scratch, target) {
				Ordering::Less => lower = mid + 1,
				Ordering::Greater => upper = mid,
				Ordering::Equal => {
					return SearchResult {
						pos: mid,
						hit: true,
					}
				}
			}
		}
		SearchResult {
			pos: lower,
			hit: false,
		}
	}

	// -----------------------------------------------------------------------
	// Writer side
	// -----------------------------------------------------------------------

	/// Formats the page as an empty node.
	pub fn initialize<P: PageWrite + ?Sized>(&self, page: &mut P, node_type: NodeType, generation: u64) {
		page.put_u8(PAGE_TYPE_OFFSET, PAGE_TYPE_TREE_NODE);
		page.put_u8(NODE_TYPE_OFFSET, node_type as u8);
		page.put_u64(GENERATION_OFFSET, generation);
		pointer::initialize(page, RIGHT_SIBLING_OFFSET);
		pointer::initialize(page, LEFT_SIBLING_OFFSET);
		pointer::initialize(page, SUCCESSOR_OFFSET);
		page.put_u32(KEY_COUNT_OFFSET, 0);
	}

	pub fn set_generation<P: PageWrite + ?Sized>(&self, page: &mut P, generation: u64) {
		page.put_u64(GENERATION_OFFSET, generation);
	}

	pub fn set_key_count<P: PageWrite + ?Sized>(&self, page: &mut P, key_count: usize) {
		page.put_u32(KEY_COUNT_OFFSET, key_count as u32);
	}

	pub fn set_right_sibling<P: PageRead + PageWrite + ?Sized>(
		&self,
		page: &mut P,
		target: PageId,
		snapshot: Generation,
	) -> Result<(), PointerFailure> {
		pointer::write(page, RIGHT_SIBLING_OFFSET, target, snapshot)
	}

	pub fn set_left_sibling<P: PageRead + PageWrite + ?Sized>(
		&self,
		page: &mut P,
		target: PageId,
		snapshot: Generation,
	) -> Result<(), PointerFailure> {
		pointer::write(page, LEFT_SIBLING_OFFSET, target, snapshot)
	}

	pub fn set_successor<P: PageRead + PageWrite + ?Sized>(
		&self,
		page: &mut P,
		target: PageId,
		snapshot: Generation,
	) -> Result<(), PointerFailure> {
		pointer::write(page, SUCCESSOR_OFFSET, target, snapshot)
	}

	pub fn set_key_at<P: PageWrite + ?Sized>(&self, page: &mut P, pos: usize, key: &L::Key) {
		self.layout.write_key(page, self.key_offset(pos), key);
	}

	pub fn set_value_at<P: PageWrite + ?Sized>(&self, page: &mut P, pos: usize, value: &L::Value) {
		self.layout.write_value(page, self.value_offset(pos), value);
	}

	/// Replaces the child pointer at `pos`, keeping the pair's other slot intact.
	pub fn set_child_at<P: PageRead + PageWrite + ?Sized>(
		&self,
		page: &mut P,
		pos: usize,
		child: PageId,
		snapshot: Generation,
	) -> Result<(), PointerFailure> {
		pointer::write(page, self.child_offset(pos), child, snapshot)
	}

	/// Installs a child pointer in a slot whose previous content is meaningless.
	pub fn init_child_at<P: PageRead + PageWrite + ?Sized>(
		&self,
		page: &mut P,
		pos: usize,
		child: PageId,
		snapshot: Generation,
	) -> Result<(), PointerFailure> {
		let offset = self.child_offset(pos);
		pointer::initialize(page, offset);
		pointer::write(page, offset, child, snapshot)
	}

	/// Copies the raw pointer pair of child `from` in `src` to child `to` in `dst`.
	pub fn copy_child<S: PageRead + ?Sized, D: PageWrite + ?Sized>(
		&self,
		src: &mut S,
		from: usize,
		dst: &mut D,
		to: usize,
	) {
		let mut raw = [0u8; PAIR_SIZE];
		src.get_bytes(self.child_offset(from), &mut raw);
		dst.put_bytes(self.child_offset(to), &raw);
	}

	/// Inserts a key/value pair at `pos` in a leaf holding `key_count` entries.
	pub fn insert_key_value_at<P: PageRead + PageWrite + ?Sized>(
		&self,
		page: &mut P,
		pos: usize,
		key: &L::Key,
		value: &L::Value,
		key_count: usize,
	) {
		let mut k = self.layout.new_key();
		let mut v = self.layout.new_value();
		for i in (pos..key_count).rev() {
			self.key_value_at(page, i, &mut k, &mut v);
			self.set_key_at(page, i + 1, &k);
			self.set_value_at(page, i + 1, &v);
		}
		self.set_key_at(page, pos, key);
		self.set_value_at(page, pos, value);
		self.set_key_count(page, key_count + 1);
	}

	/// Inserts `key` at `pos` and `right_child` at child position `pos + 1` in an internal node
	/// holding `key_count` keys.
	pub fn insert_key_child_at<P: PageRead + PageWrite + ?Sized>(
		&self,
		page: &mut P,
		pos: usize,
		key: &L::Key,
		right_child: PageId,
		key_count: usize,
		snapshot: Generation,
	) -> Result<(), PointerFailure> {
		let mut k = self.layout.new_key();
		for i in (pos..key_count).rev() {
			self.key_at(page, i, &mut k);
			self.set_key_at(page, i + 1, &k);
		}
		for i in (pos + 1..=key_count).rev() {
			let mut raw = [0u8; PAIR_SIZE];
			page.get_bytes(self.child_offset(i), &mut raw);
			page.put_bytes(self.child_offset(i + 1), &raw);
		}
		self.set_key_at(page, pos, key);
		self.init_child_at(page, pos + 1, right_child, snapshot)?;
		self.set_key_count(page, key_count + 1);
		Ok(())
	}
}
