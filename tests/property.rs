//! # Property-Based Tests for Pagetree
//!
//! This module contains property-based tests using proptest to systematically
//! discover edge cases through randomized testing.
//!
//! ## Test Properties
//!
//! - Oracle comparison: every seek matches a `BTreeMap` range query
//! - Read-ahead independence: batch size never changes what a seek returns
//! - Interleaving: a cursor that keeps reading while the same thread writes never
//!   repeats or skips a key that existed throughout
//! - Structure: invariants hold after any sequence of inserts and checkpoints

use std::collections::BTreeMap;

use pagetree::{SeekOptions, SeekRange, Tree, TreeConfig, U64Layout};
use proptest::prelude::*;

// ===========================================================================
// Strategy Helpers
// ===========================================================================

/// Writer operations.
#[derive(Debug, Clone)]
enum Op {
	Insert(u64, u64),
	Checkpoint,
}

fn operations(max_ops: usize, key_space: u64) -> impl Strategy<Value = Vec<Op>> {
	prop::collection::vec(
		prop_oneof![
			20 => (0..key_space, any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
			1 => Just(Op::Checkpoint),
		],
		0..max_ops,
	)
}

fn new_tree(padding: usize) -> Tree<U64Layout> {
	let config = TreeConfig {
		page_size: 512,
		max_pages: 65_536,
		..Default::default()
	};
	Tree::new(U64Layout::with_key_padding(padding), config).unwrap()
}

fn apply(tree: &Tree<U64Layout>, oracle: &mut BTreeMap<u64, u64>, ops: &[Op]) {
	for op in ops {
		match op {
			Op::Insert(k, v) => {
				let previous = tree.insert(*k, *v).unwrap();
				assert_eq!(previous, oracle.insert(*k, *v));
			}
			Op::Checkpoint => {
				tree.checkpoint();
			}
		}
	}
}

fn seek(tree: &Tree<U64Layout>, from: u64, to: u64, read_ahead: usize) -> Vec<(u64, u64)> {
	let options = SeekOptions::default().with_read_ahead(read_ahead);
	let mut cursor = tree.seek_with(SeekRange::new(from, to), options).unwrap();
	let mut out = Vec::new();
	while cursor.next().unwrap() {
		out.push((*cursor.key().unwrap(), *cursor.value().unwrap()));
	}
	out
}

fn expected(oracle: &BTreeMap<u64, u64>, from: u64, to: u64) -> Vec<(u64, u64)> {
	use std::cmp::Ordering::*;
	match from.cmp(&to) {
		Less => oracle.range(from..to).map(|(k, v)| (*k, *v)).collect(),
		Greater => oracle.range(to + 1..=from).rev().map(|(k, v)| (*k, *v)).collect(),
		Equal => oracle.get(&from).map(|v| vec![(from, *v)]).unwrap_or_default(),
	}
}

// ===========================================================================
// Oracle Comparison
// ===========================================================================

proptest! {
	#![proptest_config(ProptestConfig::with_cases(64))]

	/// Property: seeks over any range agree with a BTreeMap
	#[test]
	fn seeks_match_btreemap(
		ops in operations(1500, 5000),
		ranges in prop::collection::vec((0..5100u64, 0..5100u64, 1..40usize), 1..20),
	) {
		let tree = new_tree(0);
		let mut oracle = BTreeMap::new();
		apply(&tree, &mut oracle, &ops);

		for (from, to, read_ahead) in ranges {
			prop_assert_eq!(seek(&tree, from, to, read_ahead), expected(&oracle, from, to));
		}
	}

	/// Property: deep, narrow trees behave like wide ones
	#[test]
	fn deep_trees_match_btreemap(
		ops in operations(600, 2000),
		from in 0..2100u64,
		to in 0..2100u64,
	) {
		let tree = new_tree(100);
		let mut oracle = BTreeMap::new();
		apply(&tree, &mut oracle, &ops);

		prop_assert_eq!(seek(&tree, from, to, 3), expected(&oracle, from, to));
		tree.assert_invariants();
	}

	/// Property: read-ahead never changes results
	#[test]
	fn read_ahead_is_invisible(
		keys in prop::collection::btree_set(0..10_000u64, 0..800),
		from in 0..10_000u64,
		to in 0..10_000u64,
	) {
		let tree = new_tree(0);
		for k in &keys {
			tree.insert(*k, k + 1).unwrap();
		}
		let reference = seek(&tree, from, to, 1);
		for read_ahead in [2, 5, 24, 100] {
			prop_assert_eq!(&seek(&tree, from, to, read_ahead), &reference);
		}
	}

	/// Property: invariants hold after any insert/checkpoint sequence
	#[test]
	fn invariants_hold(ops in operations(2000, 100_000)) {
		let tree = new_tree(0);
		let mut oracle = BTreeMap::new();
		apply(&tree, &mut oracle, &ops);
		tree.assert_invariants();
		prop_assert_eq!(seek(&tree, 0, 100_000, 20).len(), oracle.len());
	}
}

// ===========================================================================
// Interleaved Reads and Writes
// ===========================================================================

proptest! {
	#![proptest_config(ProptestConfig::with_cases(48))]

	/// Property: a cursor that is advanced between writes returns every key that existed for
	/// the whole scan exactly once, in order, in both directions
	#[test]
	fn interleaved_scan_has_no_duplicates_or_gaps(
		initial in prop::collection::btree_set(0..4000u64, 1..600),
		writes in prop::collection::vec(prop::collection::vec(operations(40, 4000), 0..3), 1..60),
		forward in any::<bool>(),
		read_ahead in 1..30usize,
	) {
		let tree = new_tree(0);
		let mut oracle = BTreeMap::new();
		for k in &initial {
			tree.insert(*k, *k).unwrap();
			oracle.insert(*k, *k);
		}

		let (from, to) = if forward { (0, 4000) } else { (3999, 0) };
		let options = SeekOptions::default().with_read_ahead(read_ahead);
		let mut cursor = tree.seek_with(SeekRange::new(from, to), options).unwrap();
		let mut seen = Vec::new();
		let mut rounds = writes.into_iter();
		loop {
			if !cursor.next().unwrap() {
				break;
			}
			seen.push(*cursor.key().unwrap());
			if let Some(batch) = rounds.next() {
				for ops in batch {
					apply(&tree, &mut oracle, &ops);
				}
			}
		}

		for pair in seen.windows(2) {
			if forward {
				prop_assert!(pair[0] < pair[1], "{} then {}", pair[0], pair[1]);
			} else {
				prop_assert!(pair[0] > pair[1], "{} then {}", pair[0], pair[1]);
			}
		}
		// Keys present from the start are never removed, so all must have been seen.
		for k in initial.iter().filter(|k| **k > 0 || forward) {
			prop_assert!(seen.binary_search_by(|s| if forward { s.cmp(k) } else { k.cmp(s) }).is_ok(),
				"key {} skipped", k);
		}
		tree.assert_invariants();
	}
}
