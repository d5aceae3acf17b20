//! The single writer.
//!
//! Mutations follow two rules that let readers go without locks:
//!
//! 1. A node is only modified in place if it was written in the current unstable generation.
//!    Anything older is first copied to a *successor* page stamped with the unstable generation.
//!    The copy is linked from its parent and siblings before the old node's successor pointer is
//!    set, and the old page is freed. Pointer pairs are the exception: they are crash-safe to
//!    update in place, which is how the siblings of a replaced or split node learn about it.
//! 2. Structural changes are ordered so that every key stays reachable by walking right:
//!
//! ```text
//! split of L (keys a..z) into L (a..l) and R (m..z):
//!
//!   1. write R fully             L ──► RR       R ──► RR   (R not yet linked)
//!   2. RR.left  = R              L ◄── RR  ──►  R
//!   3. L.right  = R, truncate L  L ──► R ──► RR
//!   4. insert m into the parent
//! ```
//!
//! Freed pages are reused only once the generation they were freed in has become stable, and
//! reuse stamps them with the current unstable generation. A reader still holding a pointer to
//! the old node sees a node generation newer than its pointer and starts over.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use smallvec::SmallVec;
use tracing::trace;

use crate::error::{Error, Result, SeekDiagnostics};
use crate::generation::Generation;
use crate::layout::Layout;
use crate::node::{NodeType, TreeNode, SUCCESSOR_OFFSET};
use crate::page::{MemoryPageFile, PageId, PageRead, PageWrite};
use crate::pointer::{self, GenerationSafePointer, PointerFailure};
use crate::root::{Root, SharedRoot};

/// Pages waiting to be reused, in the order they were freed.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
	pages: VecDeque<(PageId, u64)>,
}

impl FreeList {
	pub(crate) fn len(&self) -> usize {
		self.pages.len()
	}

	fn push(&mut self, page_id: PageId, generation: u64) {
		self.pages.push_back((page_id, generation));
	}

	/// Pages [`pop_reusable`](Self::pop_reusable) would hand out right now.
	fn reusable(&self, stable: u64) -> usize {
		self.pages.iter().take_while(|&&(_, freed)| freed <= stable).count()
	}

	/// Takes the oldest page freed at or before `stable`.
	fn pop_reusable(&mut self, stable: u64) -> Option<PageId> {
		match self.pages.front() {
			Some(&(page_id, freed)) if freed <= stable => {
				self.pages.pop_front();
				Some(page_id)
			}
			_ => None,
		}
	}
}

/// A step on the path from the root to the leaf being modified.
#[derive(Debug, Clone, Copy)]
struct PathEntry {
	page_id: PageId,
	child_pos: usize,
}

fn corrupt(page_id: PageId, reason: impl Into<String>) -> Error {
	Error::inconsistency(
		reason,
		SeekDiagnostics {
			page_id,
			..Default::default()
		},
	)
}

fn pointer_error(page_id: PageId, failure: PointerFailure) -> Error {
	corrupt(page_id, format!("writer could not resolve pointer: {failure}"))
}

/// Formats a fresh root leaf and returns it.
pub(crate) fn create_root<L: Layout>(
	node: &TreeNode<'_, L>,
	file: &MemoryPageFile,
	generation: Generation,
) -> Result<Root> {
	let page_id = file.allocate()?;
	let mut page = file.write(page_id)?;
	page.clear();
	node.initialize(&mut page, NodeType::Leaf, generation.unstable);
	Ok(Root::new(page_id, generation.unstable))
}

/// Mutates a tree on behalf of the (single) writer.
pub(crate) struct TreeWriter<'t, L: Layout> {
	node: TreeNode<'t, L>,
	file: &'t MemoryPageFile,
	root: &'t SharedRoot,
	height: &'t AtomicUsize,
	free: &'t mut FreeList,
	snapshot: Generation,
}

impl<'t, L: Layout> TreeWriter<'t, L> {
	pub(crate) fn new(
		layout: &'t L,
		file: &'t MemoryPageFile,
		root: &'t SharedRoot,
		height: &'t AtomicUsize,
		free: &'t mut FreeList,
		snapshot: Generation,
	) -> Self {
		TreeWriter {
			node: TreeNode::new(layout, file.page_size()),
			file,
			root,
			height,
			free,
			snapshot,
		}
	}

	/// Inserts or replaces `key`. Returns the replaced value.
	pub(crate) fn insert(&mut self, key: &L::Key, value: &L::Value) -> Result<Option<L::Value>> {
		let layout = self.node.layout();
		let mut path: SmallVec<[PathEntry; 16]> = SmallVec::new();
		let mut scratch = layout.new_key();
		let mut page_id = self.unstable_root()?;

		loop {
			let mut view = self.file.peek(page_id)?;
			let node_type = self
				.node
				.node_type(&mut view)
				.ok_or_else(|| corrupt(page_id, "writer found a page that is not a node"))?;
			if node_type == NodeType::Leaf {
				break;
			}
			let key_count = self.node.key_count(&mut view) as usize;
			let child_pos = self
				.node
				.search(&mut view, node_type, key_count, key, &mut scratch)
				.child_position();
			let child = self
				.node
				.child_at(&mut view, child_pos, self.snapshot)
				.map_err(|failure| pointer_error(page_id, failure))?;
			let child = self.ensure_unstable(
				child.pointer,
				Some(PathEntry {
					page_id,
					child_pos,
				}),
			)?;
			path.push(PathEntry {
				page_id,
				child_pos,
			});
			page_id = child;
		}

		let mut page = self.file.write(page_id)?;
		let key_count = self.node.key_count(&mut page) as usize;
		let found = self.node.search(&mut page, NodeType::Leaf, key_count, key, &mut scratch);
		if found.hit {
			let mut previous = layout.new_value();
			self.node.value_at(&mut page, found.pos, &mut previous);
			self.node.set_value_at(&mut page, found.pos, value);
			return Ok(Some(previous));
		}
		if key_count < self.node.max_leaf_keys() {
			self.node.insert_key_value_at(&mut page, found.pos, key, value, key_count);
			return Ok(None);
		}
		drop(page);
		// Nothing is written until every page the split may take is known to be available.
		let needed = self.pages_for_split(&path)?;
		self.reserve(needed)?;
		self.split_leaf(page_id, found.pos, key, value, &mut path)?;
		Ok(None)
	}

	// -----------------------------------------------------------------------
	// Successors and allocation
	// -----------------------------------------------------------------------

	fn allocate(&mut self) -> Result<PageId> {
		match self.free.pop_reusable(self.snapshot.stable) {
			Some(page_id) => {
				trace!(page = page_id, "reusing freed page");
				Ok(page_id)
			}
			None => self.file.allocate(),
		}
	}

	/// Pages a leaf split takes: the new leaf, one per full ancestor, and a new root if every
	/// ancestor is full.
	fn pages_for_split(&self, path: &[PathEntry]) -> Result<usize> {
		let mut needed = 1;
		for entry in path.iter().rev() {
			let key_count = self.node.key_count(&mut self.file.peek(entry.page_id)?) as usize;
			if key_count < self.node.max_internal_keys() {
				return Ok(needed);
			}
			needed += 1;
		}
		Ok(needed + 1)
	}

	fn reserve(&self, needed: usize) -> Result<()> {
		let available = self.free.reusable(self.snapshot.stable) + self.file.unallocated();
		if available < needed {
			trace!(needed, available, "not enough pages to split");
			return Err(self.file.full());
		}
		Ok(())
	}

	fn unstable_root(&mut self) -> Result<PageId> {
		let root = self.root.get();
		self.ensure_unstable(root.id, None)
	}

	/// Returns `page_id` if it may be modified in place, otherwise a fresh successor copy.
	fn ensure_unstable(&mut self, page_id: PageId, parent: Option<PathEntry>) -> Result<PageId> {
		let generation = self.node.generation(&mut self.file.peek(page_id)?);
		if generation == self.snapshot.unstable {
			return Ok(page_id);
		}
		self.create_successor(page_id, parent)
	}

	fn create_successor(&mut self, old: PageId, parent: Option<PathEntry>) -> Result<PageId> {
		let unstable = self.snapshot.unstable;
		let new = self.allocate()?;
		trace!(old, new, generation = unstable, "creating successor");

		let mut bytes = vec![0u8; self.file.page_size()];
		self.file.peek(old)?.get_bytes(0, &mut bytes);
		{
			let mut page = self.file.write(new)?;
			page.put_bytes(0, &bytes);
			self.node.set_generation(&mut page, unstable);
			pointer::initialize(&mut page, SUCCESSOR_OFFSET);
		}

		match parent {
			Some(entry) => {
				let mut page = self.file.write(entry.page_id)?;
				self.node
					.set_child_at(&mut page, entry.child_pos, new, self.snapshot)
					.map_err(|failure| pointer_error(entry.page_id, failure))?;
			}
			None => self.root.set(Root::new(new, unstable)),
		}

		let (left, right) = self.siblings(old)?;
		if !left.is_none() {
			let mut page = self.file.write(left.pointer)?;
			self.node
				.set_right_sibling(&mut page, new, self.snapshot)
				.map_err(|failure| pointer_error(left.pointer, failure))?;
		}
		if !right.is_none() {
			let mut page = self.file.write(right.pointer)?;
			self.node
				.set_left_sibling(&mut page, new, self.snapshot)
				.map_err(|failure| pointer_error(right.pointer, failure))?;
		}

		{
			let mut page = self.file.write(old)?;
			self.node
				.set_successor(&mut page, new, self.snapshot)
				.map_err(|failure| pointer_error(old, failure))?;
		}
		self.free.push(old, unstable);
		Ok(new)
	}

	fn siblings(&self, page_id: PageId) -> Result<(GenerationSafePointer, GenerationSafePointer)> {
		let mut view = self.file.peek(page_id)?;
		let left = self
			.node
			.left_sibling(&mut view, self.snapshot)
			.map_err(|failure| pointer_error(page_id, failure))?;
		let right = self
			.node
			.right_sibling(&mut view, self.snapshot)
			.map_err(|failure| pointer_error(page_id, failure))?;
		Ok((left, right))
	}

	/// Points the left sibling pointer of `right` at `page_id`, if `right` exists.
	fn relink_left(&mut self, right: GenerationSafePointer, page_id: PageId) -> Result<()> {
		if right.is_none() {
			return Ok(());
		}
		let mut page = self.file.write(right.pointer)?;
		self.node
			.set_left_sibling(&mut page, page_id, self.snapshot)
			.map_err(|failure| pointer_error(right.pointer, failure))
	}

	// -----------------------------------------------------------------------
	// Splits
	// -----------------------------------------------------------------------

	fn split_leaf(
		&mut self,
		page_id: PageId,
		pos: usize,
		key: &L::Key,
		value: &L::Value,
		path: &mut SmallVec<[PathEntry; 16]>,
	) -> Result<()> {
		let layout = self.node.layout();
		let max = self.node.max_leaf_keys();
		let mut keys = Vec::with_capacity(max + 1);
		let mut values = Vec::with_capacity(max + 1);
		{
			let mut view = self.file.peek(page_id)?;
			for i in 0..max {
				let mut k = layout.new_key();
				let mut v = layout.new_value();
				self.node.key_value_at(&mut view, i, &mut k, &mut v);
				keys.push(k);
				values.push(v);
			}
		}
		keys.insert(pos, key.clone());
		values.insert(pos, value.clone());

		let left_count = keys.len() / 2;
		let (_, old_right) = self.siblings(page_id)?;
		let right_id = self.allocate()?;
		trace!(left = page_id, right = right_id, "splitting leaf");

		{
			let mut page = self.file.write(right_id)?;
			page.clear();
			self.node.initialize(&mut page, NodeType::Leaf, self.snapshot.unstable);
			for (i, (k, v)) in keys[left_count..].iter().zip(&values[left_count..]).enumerate() {
				self.node.set_key_at(&mut page, i, k);
				self.node.set_value_at(&mut page, i, v);
			}
			self.node.set_key_count(&mut page, keys.len() - left_count);
			self.link_new_node(&mut page, right_id, page_id, old_right)?;
		}
		self.relink_left(old_right, right_id)?;
		{
			let mut page = self.file.write(page_id)?;
			for (i, (k, v)) in keys[..left_count].iter().zip(&values[..left_count]).enumerate() {
				self.node.set_key_at(&mut page, i, k);
				self.node.set_value_at(&mut page, i, v);
			}
			self.node.set_key_count(&mut page, left_count);
			self.node
				.set_right_sibling(&mut page, right_id, self.snapshot)
				.map_err(|failure| pointer_error(page_id, failure))?;
		}

		let separator = keys.swap_remove(left_count);
		self.insert_into_parent(path, page_id, separator, right_id)
	}

	fn split_internal(
		&mut self,
		page_id: PageId,
		pos: usize,
		key: L::Key,
		right_child: PageId,
		path: &mut SmallVec<[PathEntry; 16]>,
	) -> Result<()> {
		let layout = self.node.layout();
		let max = self.node.max_internal_keys();
		let mut keys = Vec::with_capacity(max + 1);
		let mut children = Vec::with_capacity(max + 2);
		{
			let mut view = self.file.peek(page_id)?;
			for i in 0..max {
				let mut k = layout.new_key();
				self.node.key_at(&mut view, i, &mut k);
				keys.push(k);
			}
			for i in 0..=max {
				let child = self
					.node
					.child_at(&mut view, i, self.snapshot)
					.map_err(|failure| pointer_error(page_id, failure))?;
				children.push(child.pointer);
			}
		}
		keys.insert(pos, key);
		children.insert(pos + 1, right_child);

		let mid = keys.len() / 2;
		let (_, old_right) = self.siblings(page_id)?;
		let right_id = self.allocate()?;
		trace!(left = page_id, right = right_id, "splitting internal node");

		{
			let mut page = self.file.write(right_id)?;
			page.clear();
			self.node.initialize(&mut page, NodeType::Internal, self.snapshot.unstable);
			self.write_internal(&mut page, right_id, &keys[mid + 1..], &children[mid + 1..])?;
			self.link_new_node(&mut page, right_id, page_id, old_right)?;
		}
		self.relink_left(old_right, right_id)?;
		{
			let mut page = self.file.write(page_id)?;
			self.write_internal(&mut page, page_id, &keys[..mid], &children[..=mid])?;
			self.node
				.set_right_sibling(&mut page, right_id, self.snapshot)
				.map_err(|failure| pointer_error(page_id, failure))?;
		}

		let promoted = keys.swap_remove(mid);
		self.insert_into_parent(path, page_id, promoted, right_id)
	}

	fn write_internal<P: PageRead + PageWrite>(
		&self,
		page: &mut P,
		page_id: PageId,
		keys: &[L::Key],
		children: &[PageId],
	) -> Result<()> {
		for (i, k) in keys.iter().enumerate() {
			self.node.set_key_at(page, i, k);
		}
		for (i, child) in children.iter().enumerate() {
			self.node
				.init_child_at(page, i, *child, self.snapshot)
				.map_err(|failure| pointer_error(page_id, failure))?;
		}
		self.node.set_key_count(page, keys.len());
		Ok(())
	}

	fn link_new_node<P: PageRead + PageWrite>(
		&self,
		page: &mut P,
		page_id: PageId,
		left: PageId,
		right: GenerationSafePointer,
	) -> Result<()> {
		self.node
			.set_left_sibling(page, left, self.snapshot)
			.map_err(|failure| pointer_error(page_id, failure))?;
		if !right.is_none() {
			self.node
				.set_right_sibling(page, right.pointer, self.snapshot)
				.map_err(|failure| pointer_error(page_id, failure))?;
		}
		Ok(())
	}

	fn insert_into_parent(
		&mut self,
		path: &mut SmallVec<[PathEntry; 16]>,
		left: PageId,
		separator: L::Key,
		right: PageId,
	) -> Result<()> {
		let Some(entry) = path.pop() else {
			return self.grow_root(left, separator, right);
		};
		let mut page = self.file.write(entry.page_id)?;
		let key_count = self.node.key_count(&mut page) as usize;
		if key_count < self.node.max_internal_keys() {
			return self
				.node
				.insert_key_child_at(
					&mut page,
					entry.child_pos,
					&separator,
					right,
					key_count,
					self.snapshot,
				)
				.map_err(|failure| pointer_error(entry.page_id, failure));
		}
		drop(page);
		self.split_internal(entry.page_id, entry.child_pos, separator, right, path)
	}

	fn grow_root(&mut self, left: PageId, separator: L::Key, right: PageId) -> Result<()> {
		let root_id = self.allocate()?;
		{
			let mut page = self.file.write(root_id)?;
			page.clear();
			self.node.initialize(&mut page, NodeType::Internal, self.snapshot.unstable);
			self.write_internal(&mut page, root_id, std::slice::from_ref(&separator), &[left, right])?;
		}
		self.root.set(Root::new(root_id, self.snapshot.unstable));
		let height = self.height.fetch_add(1, Ordering::AcqRel) + 1;
		trace!(root = root_id, height, "tree grew");
		Ok(())
	}
}
