//! # Integration Tests for Pagetree
//!
//! This module contains end-to-end integration tests that exercise the tree
//! and its seek cursors through the public API with realistic workloads.

use std::sync::atomic::{AtomicUsize, Ordering};

use pagetree::{
	Direction, Error, SeekLevel, SeekMonitor, SeekOptions, SeekRange, Tree, TreeConfig, U64Layout,
};
use rand::prelude::*;

fn small_pages() -> TreeConfig {
	TreeConfig {
		page_size: 512,
		max_pages: 16_384,
		..Default::default()
	}
}

fn tree_with(keys: impl IntoIterator<Item = u64>) -> Tree<U64Layout> {
	let tree = Tree::new(U64Layout::new(), small_pages()).unwrap();
	for k in keys {
		tree.insert(k, k * 10).unwrap();
	}
	tree
}

fn drain(tree: &Tree<U64Layout>, range: SeekRange<u64>, options: SeekOptions) -> Vec<(u64, u64)> {
	let mut cursor = tree.seek_with(range, options).unwrap();
	let mut out = Vec::new();
	while cursor.next().unwrap() {
		out.push((*cursor.key().unwrap(), *cursor.value().unwrap()));
	}
	out
}

fn keys(tree: &Tree<U64Layout>, from: u64, to: u64) -> Vec<u64> {
	drain(tree, SeekRange::new(from, to), SeekOptions::default()).into_iter().map(|(k, _)| k).collect()
}

// ===========================================================================
// Order and Completeness
// ===========================================================================

#[test]
fn forward_seek_returns_every_key_in_order() {
	let tree = tree_with((0..10_000).map(|k| k * 3));
	tree.assert_invariants();

	let seen = drain(&tree, SeekRange::new(0, 30_000), SeekOptions::default());
	assert_eq!(seen.len(), 10_000);
	for (i, (k, v)) in seen.iter().enumerate() {
		assert_eq!(*k, i as u64 * 3);
		assert_eq!(*v, k * 10);
	}
}

#[test]
fn backward_seek_returns_every_key_in_reverse() {
	let tree = tree_with((0..10_000).map(|k| k * 3));

	let seen = keys(&tree, 29_997, 0);
	let expected: Vec<u64> = (1..10_000).rev().map(|k| k * 3).collect();
	assert_eq!(seen, expected);
}

#[test]
fn bounds_between_keys() {
	let tree = tree_with((0..1000).map(|k| k * 10));

	assert_eq!(keys(&tree, 15, 45), vec![20, 30, 40]);
	assert_eq!(keys(&tree, 45, 15), vec![40, 30, 20]);
	// `from` inclusive, `to` exclusive in both directions.
	assert_eq!(keys(&tree, 20, 50), vec![20, 30, 40]);
	assert_eq!(keys(&tree, 50, 20), vec![50, 40, 30]);
}

#[test]
fn ranges_past_either_end() {
	let tree = tree_with(100..200);

	assert_eq!(keys(&tree, 0, 103), vec![100, 101, 102]);
	assert_eq!(keys(&tree, 197, 1_000), vec![197, 198, 199]);
	assert_eq!(keys(&tree, 1_000, 197), vec![199, 198]);
	assert_eq!(keys(&tree, 102, 0), vec![102, 101, 100]);
	assert!(keys(&tree, 500, 600).is_empty());
	assert!(keys(&tree, 0, 50).is_empty());
}

#[test]
fn every_read_ahead_gives_the_same_answer() {
	let tree = tree_with((0..3000).map(|k| k * 2));
	let expected = keys(&tree, 100, 5000);
	let expected_rev = keys(&tree, 5000, 100);

	for read_ahead in [1, 2, 3, 7, 20, 64, 500] {
		let options = SeekOptions::default().with_read_ahead(read_ahead);
		let forward: Vec<u64> =
			drain(&tree, SeekRange::new(100, 5000), options.clone()).into_iter().map(|(k, _)| k).collect();
		let backward: Vec<u64> =
			drain(&tree, SeekRange::new(5000, 100), options).into_iter().map(|(k, _)| k).collect();
		assert_eq!(forward, expected, "read_ahead={read_ahead}");
		assert_eq!(backward, expected_rev, "read_ahead={read_ahead}");
	}
}

#[test]
fn oversized_read_ahead_is_capped_at_a_node() {
	let tree = tree_with((0..3000).map(|k| k * 2));
	for read_ahead in [1 << 32, usize::MAX / 8, usize::MAX] {
		let options = SeekOptions::default().with_read_ahead(read_ahead);
		assert!(options.validate().is_ok());
		let forward = drain(&tree, SeekRange::new(0, 10), options.clone());
		assert_eq!(forward, vec![(0, 0), (2, 20), (4, 40), (6, 60), (8, 80)]);
		let backward = drain(&tree, SeekRange::new(5000, 0), options);
		assert_eq!(backward.len(), 2500, "read_ahead={read_ahead}");
	}
}

#[test]
fn random_ranges_match_a_sorted_vec() {
	let mut rng = StdRng::seed_from_u64(7);
	let mut all: Vec<u64> = (0..5000).map(|_| rng.random_range(0..100_000)).collect();
	let tree = tree_with(all.iter().copied());
	all.sort_unstable();
	all.dedup();

	for _ in 0..200 {
		let a = rng.random_range(0..100_000);
		let b = rng.random_range(0..100_000);
		let got = keys(&tree, a, b);
		let expected: Vec<u64> = if a <= b {
			all.iter().copied().filter(|k| *k >= a && *k < b).collect()
		} else {
			all.iter().rev().copied().filter(|k| *k <= a && *k > b).collect()
		};
		if a == b {
			// Exact match.
			assert_eq!(got, all.binary_search(&a).map(|_| vec![a]).unwrap_or_default());
		} else {
			assert_eq!(got, expected, "range {a}..{b}");
		}
	}
}

#[test]
fn deep_trees_from_padded_keys() {
	let config = TreeConfig {
		page_size: 512,
		max_pages: 65_536,
		..Default::default()
	};
	let tree = Tree::new(U64Layout::with_key_padding(120), config).unwrap();
	for k in 0..4000u64 {
		tree.insert(k, k).unwrap();
	}
	tree.assert_invariants();
	assert!(tree.height() >= 5, "height {}", tree.height());
	assert_eq!(keys(&tree, 0, 4000).len(), 4000);
	assert_eq!(keys(&tree, 3999, 0).len(), 3999);
}

// ===========================================================================
// Exact Match and Lookups
// ===========================================================================

#[test]
fn exact_match_returns_at_most_one_entry() {
	let tree = tree_with((0..500).map(|k| k * 2));

	assert_eq!(keys(&tree, 84, 84), vec![84]);
	assert!(keys(&tree, 85, 85).is_empty());
	assert_eq!(tree.get(&84).unwrap(), Some(840));
	assert_eq!(tree.get(&85).unwrap(), None);
}

#[test]
fn exclusive_range_with_equal_bounds_is_empty() {
	let tree = tree_with(0..100);
	let seen = drain(&tree, SeekRange::exclusive(50, 50), SeekOptions::default());
	assert!(seen.is_empty());
}

#[test]
fn overwrite_is_visible_to_new_cursors() {
	let tree = tree_with(0..100);
	assert_eq!(tree.insert(42, 7).unwrap(), Some(420));
	assert_eq!(tree.get(&42).unwrap(), Some(7));
	assert_eq!(keys(&tree, 0, 100).len(), 100);
}

// ===========================================================================
// Empty Tree and Empty Range
// ===========================================================================

#[test]
fn empty_tree_yields_nothing() {
	let tree = Tree::new(U64Layout::new(), small_pages()).unwrap();
	tree.assert_invariants();

	for (from, to) in [(0, 100), (100, 0), (5, 5), (0, u64::MAX)] {
		let mut cursor = tree.seek(from, to).unwrap();
		assert!(!cursor.next().unwrap());
		assert!(!cursor.next().unwrap(), "next() after the end stays false");
	}
	assert_eq!(tree.get(&3).unwrap(), None);
}

#[test]
fn empty_range_in_populated_tree() {
	let tree = tree_with((0..1000).map(|k| k * 10));
	assert!(keys(&tree, 11, 19).is_empty());
	assert!(keys(&tree, 19, 11).is_empty());
}

// ===========================================================================
// Cursor State and Usage Errors
// ===========================================================================

#[test]
fn key_before_next_is_a_usage_error() {
	let tree = tree_with(0..10);
	let cursor = tree.seek(0, 10).unwrap();
	assert!(matches!(cursor.key(), Err(Error::NoCurrentEntry)));
	assert!(matches!(cursor.value(), Err(Error::NoCurrentEntry)));
}

#[test]
fn key_after_end_is_a_usage_error() {
	let tree = tree_with(0..3);
	let mut cursor = tree.seek(0, 10).unwrap();
	while cursor.next().unwrap() {}
	assert!(matches!(cursor.key(), Err(Error::NoCurrentEntry)));
}

#[test]
fn closed_cursor_rejects_everything() {
	let tree = tree_with(0..100);
	let mut cursor = tree.seek(0, 100).unwrap();
	assert!(cursor.next().unwrap());
	assert_eq!(*cursor.key().unwrap(), 0);

	cursor.close();
	cursor.close();

	assert!(matches!(cursor.next(), Err(Error::CursorClosed)));
	assert!(matches!(cursor.key(), Err(Error::CursorClosed)));
	assert!(matches!(cursor.value(), Err(Error::CursorClosed)));
	assert!(matches!(cursor.reinitialize_to_new_range(0, 5), Err(Error::CursorClosed)));
	assert!(cursor.next().unwrap_err().is_usage_error());
}

#[test]
fn direction_follows_the_bounds() {
	let tree = tree_with(0..10);
	assert_eq!(tree.seek(1, 5).unwrap().direction(), Direction::Forward);
	assert_eq!(tree.seek(5, 1).unwrap().direction(), Direction::Reverse);
}

// ===========================================================================
// Reinitialization
// ===========================================================================

#[test]
fn reinitialize_matches_a_fresh_cursor() {
	let tree = tree_with((0..5000).map(|k| k * 2));

	let mut cursor = tree.seek(0, 10_000).unwrap();
	for _ in 0..37 {
		assert!(cursor.next().unwrap());
	}
	cursor.reinitialize_to_new_range(3001, 4001).unwrap();
	let mut reused = Vec::new();
	while cursor.next().unwrap() {
		reused.push(*cursor.key().unwrap());
	}

	assert_eq!(reused, keys(&tree, 3001, 4001));
}

#[test]
fn reinitialize_can_flip_direction() {
	let tree = tree_with(0..1000);

	let mut cursor = tree.seek(0, 1000).unwrap();
	assert!(cursor.next().unwrap());
	cursor.reinitialize_to_new_range(600, 590).unwrap();
	assert_eq!(cursor.direction(), Direction::Reverse);
	let mut seen = Vec::new();
	while cursor.next().unwrap() {
		seen.push(*cursor.key().unwrap());
	}
	assert_eq!(seen, (591..=600).rev().collect::<Vec<_>>());
}

#[test]
fn paginated_scan_with_reinitialize() {
	let tree = tree_with(0..2000);
	let page = 150;

	let mut cursor = tree.seek(0, 2000).unwrap();
	let mut all = Vec::new();
	loop {
		let mut last = None;
		for _ in 0..page {
			if !cursor.next().unwrap() {
				break;
			}
			last = Some(*cursor.key().unwrap());
			all.push(last.unwrap());
		}
		match last {
			Some(k) if all.len() % page == 0 => cursor.reinitialize_to_new_range(k + 1, 2000).unwrap(),
			_ => break,
		}
	}
	assert_eq!(all, (0..2000).collect::<Vec<_>>());
}

#[test]
fn reinitialize_after_the_end_is_rejected() {
	let tree = tree_with(0..5);
	let mut cursor = tree.seek(0, 5).unwrap();
	while cursor.next().unwrap() {}
	assert!(matches!(cursor.reinitialize_to_new_range(0, 5), Err(Error::CursorEnded)));
}

// ===========================================================================
// Level Seeks and Monitoring
// ===========================================================================

#[derive(Default)]
struct CountingMonitor {
	internal: AtomicUsize,
	leaves: AtomicUsize,
	deepest: AtomicUsize,
}

impl SeekMonitor for CountingMonitor {
	fn internal_node(&self, _depth: usize, key_count: usize) {
		assert!(key_count > 0);
		self.internal.fetch_add(1, Ordering::Relaxed);
	}

	fn leaf_node(&self, depth: usize, _key_count: usize) {
		self.leaves.fetch_add(1, Ordering::Relaxed);
		self.deepest.fetch_max(depth, Ordering::Relaxed);
	}
}

#[test]
fn monitor_sees_one_descent() {
	let tree = tree_with(0..5000);
	let monitor = CountingMonitor::default();

	let mut cursor =
		tree.seek_monitored(SeekRange::new(100, 200), SeekOptions::default(), &monitor).unwrap();
	while cursor.next().unwrap() {}

	assert_eq!(monitor.internal.load(Ordering::Relaxed), tree.height() - 1);
	assert_eq!(monitor.leaves.load(Ordering::Relaxed), 1);
	assert_eq!(monitor.deepest.load(Ordering::Relaxed), tree.height() - 1);
}

#[test]
fn seeking_an_internal_level_yields_separators() {
	let tree = tree_with(0..5000);
	let height = tree.height();
	assert!(height >= 3);

	let options = SeekOptions::default().with_target_level(SeekLevel::Depth(height - 2));
	let separators: Vec<u64> =
		drain(&tree, SeekRange::exclusive(0, 5000), options).into_iter().map(|(k, _)| k).collect();

	// Roughly one separator per leaf, strictly increasing, all inside the range.
	assert!(separators.len() > 10);
	assert!(separators.windows(2).all(|w| w[0] < w[1]));
	assert!(separators.iter().all(|k| *k < 5000));
}

#[test]
fn depth_beyond_the_leaves_stops_at_the_leaves() {
	let tree = tree_with(0..100);
	let options = SeekOptions::default().with_target_level(SeekLevel::Depth(40));
	let seen = drain(&tree, SeekRange::new(10, 20), options);
	assert_eq!(seen.len(), 10);
}

// ===========================================================================
// Configuration
// ===========================================================================

#[test]
fn pages_too_small_for_the_layout_are_rejected() {
	let config = TreeConfig {
		page_size: 256,
		..Default::default()
	};
	let err = Tree::new(U64Layout::with_key_padding(100), config).unwrap_err();
	assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn invalid_seek_options_are_rejected() {
	let tree = tree_with(0..10);
	let result = tree.seek_with(SeekRange::new(0, 5), SeekOptions::default().with_read_ahead(0));
	assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn config_from_json() {
	let config: TreeConfig =
		serde_json::from_str(r#"{ "page_size": 1024, "root_catchup_trip_limit": 8 }"#).unwrap();
	let tree = Tree::new(U64Layout::new(), config).unwrap();
	for k in 0..1000 {
		tree.insert(k, k).unwrap();
	}
	assert_eq!(keys(&tree, 0, 1000).len(), 1000);
}

#[test]
fn running_out_of_pages_is_an_io_error() {
	for max_pages in 4..40 {
		let config = TreeConfig {
			page_size: 512,
			max_pages,
			..Default::default()
		};
		let tree = Tree::new(U64Layout::new(), config).unwrap();
		let mut inserted = Vec::new();
		let failed = loop {
			let k = inserted.len() as u64;
			match tree.insert(k, k) {
				Ok(_) => inserted.push(k),
				Err(err) => break (k, err),
			}
			assert!(k < 100_000, "max_pages={max_pages}: page file never filled up");
		};
		assert!(matches!(failed.1, Error::Io(_)), "max_pages={max_pages}: {:?}", failed.1);

		// The failed insert left no trace: the key is absent and the structure is intact.
		tree.assert_invariants();
		assert_eq!(keys(&tree, 0, u64::MAX), inserted, "max_pages={max_pages}");
		assert_eq!(tree.get(&failed.0).unwrap(), None);

		// Retrying fails the same way, and keys that fit without a split still go in.
		let height = tree.height();
		assert!(matches!(tree.insert(failed.0, failed.0), Err(Error::Io(_))));
		assert_eq!(tree.height(), height);
		assert_eq!(tree.insert(0, 7).unwrap(), Some(0));
		tree.assert_invariants();
	}
}
