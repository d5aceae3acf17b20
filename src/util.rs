//! Test utilities for loading sample trees from JSON fixtures.
//!
//! A fixture describes the node structure directly, so tests can start from shapes the writer
//! would take many inserts to produce:
//!
//! ```json
//! {
//!   "page_size": 512,
//!   "root": {
//!     "edges": [{ "key": 10, "child": { "values": [{ "key": 1, "value": 1 }] } }],
//!     "upper_edge": { "values": [{ "key": 10, "value": 10 }] }
//!   }
//! }
//! ```
//!
//! Every node is written in generation 1, which is stable from the start: the first insert into
//! a fixture tree goes through successor creation.

use serde::Deserialize;

use crate::config::TreeConfig;
use crate::generation::{Generation, GenerationKeeper, GenerationSource};
use crate::layout::U64Layout;
use crate::node::{NodeType, TreeNode};
use crate::page::{MemoryPageFile, PageId};
use crate::root::Root;
use crate::Tree;

#[derive(Deserialize, Debug)]
struct Edge {
	key: u64,
	child: FixtureNode,
}

#[derive(Deserialize, Debug)]
struct Value {
	key: u64,
	value: u64,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum FixtureNode {
	Internal {
		edges: Vec<Edge>,
		upper_edge: Box<FixtureNode>,
	},
	Leaf {
		values: Vec<Value>,
	},
}

#[derive(Deserialize, Debug)]
struct SampleTree {
	#[serde(default = "default_fixture_page_size")]
	page_size: usize,
	#[serde(default)]
	key_padding: usize,
	root: FixtureNode,
}

fn default_fixture_page_size() -> usize {
	512
}

/// Writes fixture nodes depth first, remembering each level's pages left to right.
struct Builder<'a> {
	node: TreeNode<'a, U64Layout>,
	file: &'a MemoryPageFile,
	generation: u64,
	levels: Vec<Vec<PageId>>,
}

impl Builder<'_> {
	fn translate(&mut self, fixture: FixtureNode, depth: usize) -> PageId {
		let snapshot = Generation::INITIAL;
		let page_id = self.file.allocate().expect("fixture does not fit in the page file");
		if self.levels.len() <= depth {
			self.levels.resize_with(depth + 1, Vec::new);
		}
		self.levels[depth].push(page_id);

		match fixture {
			FixtureNode::Internal {
				edges,
				upper_edge,
			} => {
				let mut keys = Vec::with_capacity(edges.len());
				let mut children = Vec::with_capacity(edges.len() + 1);
				for edge in edges {
					keys.push(edge.key);
					children.push(self.translate(edge.child, depth + 1));
				}
				children.push(self.translate(*upper_edge, depth + 1));

				let mut page = self.file.write(page_id).unwrap();
				self.node.initialize(&mut page, NodeType::Internal, self.generation);
				for (i, key) in keys.iter().enumerate() {
					self.node.set_key_at(&mut page, i, key);
				}
				for (i, child) in children.iter().enumerate() {
					self.node.init_child_at(&mut page, i, *child, snapshot).unwrap();
				}
				self.node.set_key_count(&mut page, keys.len());
			}
			FixtureNode::Leaf {
				values,
			} => {
				let mut page = self.file.write(page_id).unwrap();
				self.node.initialize(&mut page, NodeType::Leaf, self.generation);
				for (i, entry) in values.iter().enumerate() {
					self.node.set_key_at(&mut page, i, &entry.key);
					self.node.set_value_at(&mut page, i, &entry.value);
				}
				self.node.set_key_count(&mut page, values.len());
			}
		}
		page_id
	}

	fn link_siblings(&self) {
		let snapshot = Generation::INITIAL;
		for level in &self.levels {
			for pair in level.windows(2) {
				let mut left = self.file.write(pair[0]).unwrap();
				self.node.set_right_sibling(&mut left, pair[1], snapshot).unwrap();
				drop(left);
				let mut right = self.file.write(pair[1]).unwrap();
				self.node.set_left_sibling(&mut right, pair[0], snapshot).unwrap();
			}
		}
	}
}

/// Builds a tree from a JSON fixture string.
pub fn sample_tree_from_str(json: &str) -> Tree<U64Layout> {
	let sample: SampleTree = serde_json::from_str(json).unwrap();
	let layout = U64Layout::with_key_padding(sample.key_padding);
	let config = TreeConfig {
		page_size: sample.page_size,
		..Default::default()
	};
	config.validate(8 + sample.key_padding, 8).unwrap();

	let file = MemoryPageFile::new(config.page_size, config.max_pages);
	let generations = GenerationKeeper::new();
	let stable = generations.current().stable;
	let (root_id, height) = {
		let mut builder = Builder {
			node: TreeNode::new(&layout, file.page_size()),
			file: &file,
			generation: stable,
			levels: Vec::new(),
		};
		let root_id = builder.translate(sample.root, 0);
		builder.link_siblings();
		(root_id, builder.levels.len())
	};
	Tree::from_parts(layout, config, file, generations, Root::new(root_id, stable), height)
}

/// Builds a tree from a JSON fixture file.
pub fn sample_tree<P: AsRef<std::path::Path>>(path: P) -> Tree<U64Layout> {
	let json = std::fs::read_to_string(path).expect("failed to find file");
	sample_tree_from_str(&json)
}
