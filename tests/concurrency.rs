//! # Concurrency Tests for Pagetree
//!
//! One writer inserts, splits, checkpoints and recycles pages while reader
//! threads scan. Readers never lock, so every test checks the same contract:
//!
//! - keys come back strictly ordered in the scan direction (no duplicates)
//! - every key present for the whole scan is returned (no gaps)
//! - values always belong to the key they are returned with
//!
//! ## Test Categories
//!
//! - Basic concurrent tests: moderate workloads, always run
//! - Stress tests: heavier workloads, marked with `#[ignore]` - run with `cargo test -- --ignored`

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use pagetree::{SeekOptions, SeekRange, Tree, TreeConfig, U64Layout};
use rand::prelude::*;

// ===========================================================================
// Helpers
// ===========================================================================

fn config() -> TreeConfig {
	TreeConfig {
		page_size: 512,
		max_pages: 65_536,
		root_catchup_trip_limit: 10_000,
		..Default::default()
	}
}

fn options(read_ahead: usize) -> SeekOptions {
	SeekOptions::default().with_read_ahead(read_ahead).with_max_restarts(100_000)
}

/// Value stored for `key` by writer round `round`.
fn value_for(key: u64, round: u64) -> u64 {
	key * 1_000 + round
}

/// Tree holding the even keys below `2 * n`.
fn even_tree(n: u64) -> Tree<U64Layout> {
	let tree = Tree::new(U64Layout::new(), config()).unwrap();
	for k in 0..n {
		tree.insert(k * 2, value_for(k * 2, 0)).unwrap();
	}
	tree
}

/// Scans `[from, to)` and checks order, value ownership, and that every even key below `limit`
/// in range is present. Returns the number of entries seen.
fn checked_scan(tree: &Tree<U64Layout>, limit: u64, from: u64, to: u64, read_ahead: usize) -> usize {
	let forward = from <= to;
	let mut cursor = tree.seek_with(SeekRange::new(from, to), options(read_ahead)).unwrap();
	let mut previous: Option<u64> = None;
	let mut evens = 0usize;
	let mut seen = 0usize;
	while cursor.next().unwrap() {
		let key = *cursor.key().unwrap();
		let value = *cursor.value().unwrap();
		assert_eq!(value / 1_000, key, "value {value} returned with key {key}");
		if let Some(previous) = previous {
			if forward {
				assert!(key > previous, "forward scan went from {previous} to {key}");
			} else {
				assert!(key < previous, "backward scan went from {previous} to {key}");
			}
		}
		previous = Some(key);
		if key % 2 == 0 {
			evens += 1;
		}
		seen += 1;
	}

	let (low, high) = if forward {
		(from, to)
	} else {
		(to + 1, from + 1)
	};
	let high = high.min(limit);
	let expected_evens = high.div_ceil(2).saturating_sub(low.div_ceil(2)) as usize;
	assert_eq!(evens, expected_evens, "gap in scan {from}..{to}");
	seen
}

/// Inserts the odd keys below `2 * n` in random order, checkpointing every `checkpoint_every`.
fn insert_odds(tree: &Tree<U64Layout>, n: u64, checkpoint_every: usize, seed: u64) {
	let mut rng = StdRng::seed_from_u64(seed);
	let mut odds: Vec<u64> = (0..n).map(|k| k * 2 + 1).collect();
	odds.shuffle(&mut rng);
	for (i, k) in odds.into_iter().enumerate() {
		tree.insert(k, value_for(k, 0)).unwrap();
		if checkpoint_every > 0 && i % checkpoint_every == checkpoint_every - 1 {
			tree.checkpoint();
		}
	}
}

fn run_readers(
	tree: &Tree<U64Layout>,
	readers: usize,
	done: &AtomicBool,
	scan: impl Fn(&Tree<U64Layout>, &mut StdRng) + Sync,
) -> usize {
	let scans = AtomicUsize::new(0);
	thread::scope(|s| {
		for r in 0..readers {
			let scans = &scans;
			let scan = &scan;
			s.spawn(move || {
				let mut rng = StdRng::seed_from_u64(r as u64);
				// At least one full pass even if the writer finishes first.
				loop {
					scan(tree, &mut rng);
					scans.fetch_add(1, Ordering::Relaxed);
					if done.load(Ordering::Acquire) {
						break;
					}
				}
			});
		}
	});
	scans.into_inner()
}

// ===========================================================================
// Single Writer, Many Readers
// ===========================================================================

#[test]
fn forward_scans_during_inserts() {
	let n = 4_000;
	let tree = even_tree(n);
	let done = AtomicBool::new(false);

	thread::scope(|s| {
		s.spawn(|| {
			insert_odds(&tree, n, 0, 1);
			done.store(true, Ordering::Release);
		});
		let scans = run_readers(&tree, 3, &done, |tree, _| {
			checked_scan(tree, 2 * n, 0, 2 * n, 16);
		});
		assert!(scans >= 3);
	});

	tree.assert_invariants();
	assert_eq!(checked_scan(&tree, 2 * n, 0, 2 * n, 20), 2 * n as usize);
}

#[test]
fn backward_scans_during_inserts() {
	let n = 4_000;
	let tree = even_tree(n);
	let done = AtomicBool::new(false);

	thread::scope(|s| {
		s.spawn(|| {
			insert_odds(&tree, n, 0, 2);
			done.store(true, Ordering::Release);
		});
		run_readers(&tree, 3, &done, |tree, _| {
			checked_scan(tree, 2 * n, 2 * n, 0, 16);
		});
	});

	tree.assert_invariants();
	assert_eq!(checked_scan(&tree, 2 * n, 2 * n, 0, 20), 2 * n as usize - 1);
}

#[test]
fn random_ranges_during_inserts_and_checkpoints() {
	let n = 4_000;
	let tree = even_tree(n);
	let done = AtomicBool::new(false);

	thread::scope(|s| {
		s.spawn(|| {
			insert_odds(&tree, n, 50, 3);
			done.store(true, Ordering::Release);
		});
		run_readers(&tree, 4, &done, |tree, rng| {
			let a = rng.random_range(0..2 * n);
			let b = rng.random_range(0..2 * n);
			if a != b {
				checked_scan(tree, 2 * n, a, b, *[1, 3, 20].choose(rng).unwrap());
			}
		});
	});

	tree.assert_invariants();
}

#[test]
fn single_entry_batches_interleave_with_splits() {
	let n = 2_000;
	let tree = even_tree(n);
	let done = AtomicBool::new(false);

	thread::scope(|s| {
		s.spawn(|| {
			insert_odds(&tree, n, 25, 4);
			done.store(true, Ordering::Release);
		});
		run_readers(&tree, 2, &done, |tree, rng| {
			if rng.random_bool(0.5) {
				checked_scan(tree, 2 * n, 0, 2 * n, 1);
			} else {
				checked_scan(tree, 2 * n, 2 * n, 0, 1);
			}
		});
	});
}

#[test]
fn readers_follow_root_growth() {
	// Start from a single leaf so the root splits while readers are descending.
	let n = 3_000;
	let tree = even_tree(8);
	let done = AtomicBool::new(false);

	thread::scope(|s| {
		s.spawn(|| {
			for k in 8..n {
				tree.insert(k * 2, value_for(k * 2, 0)).unwrap();
				if k % 100 == 0 {
					tree.checkpoint();
				}
			}
			done.store(true, Ordering::Release);
		});
		run_readers(&tree, 3, &done, |tree, _| {
			checked_scan(tree, 16, 0, 16, 4);
			checked_scan(tree, 16, 15, 0, 4);
		});
	});

	tree.assert_invariants();
	assert!(tree.height() >= 3);
}

// ===========================================================================
// Page Reuse
// ===========================================================================

#[test]
fn overwrites_with_frequent_checkpoints_recycle_pages_safely() {
	// The key set never changes, only values do. Every checkpoint makes the next write to each
	// node copy it, and pages freed two checkpoints ago get reused for unrelated nodes.
	let n = 3_000;
	let tree = even_tree(n);
	let done = AtomicBool::new(false);

	thread::scope(|s| {
		s.spawn(|| {
			let mut rng = StdRng::seed_from_u64(5);
			for round in 1..=20u64 {
				for _ in 0..300 {
					let k = rng.random_range(0..n) * 2;
					tree.insert(k, value_for(k, round)).unwrap();
				}
				tree.checkpoint();
			}
			done.store(true, Ordering::Release);
		});
		run_readers(&tree, 3, &done, |tree, rng| {
			let seen = if rng.random_bool(0.5) {
				checked_scan(tree, 2 * n, 0, 2 * n, 8)
			} else {
				checked_scan(tree, 2 * n, 2 * n - 1, 0, 8)
			};
			assert!(seen == n as usize || seen == n as usize - 1);
		});
	});

	tree.assert_invariants();
	// The writer allocated far fewer pages than it copied.
	assert!(tree.file().high_water_mark() < 3 * (n / 10 + 50));
}

#[test]
fn lookups_during_overwrites() {
	let n = 1_000;
	let tree = even_tree(n);
	let done = AtomicBool::new(false);

	thread::scope(|s| {
		s.spawn(|| {
			for round in 1..=10u64 {
				for k in 0..n {
					tree.insert(k * 2, value_for(k * 2, round)).unwrap();
				}
				tree.checkpoint();
			}
			done.store(true, Ordering::Release);
		});
		run_readers(&tree, 3, &done, |tree, rng| {
			let k = rng.random_range(0..n) * 2;
			let value = tree.get(&k).unwrap().expect("present key");
			assert_eq!(value / 1_000, k);
			assert_eq!(tree.get(&(k + 1)).unwrap(), None);
		});
	});
}

// ===========================================================================
// Stress Tests
// ===========================================================================

#[test]
#[ignore]
fn stress_mixed_readers_and_writer() {
	let n = 50_000;
	let tree = even_tree(n);
	let done = AtomicBool::new(false);

	thread::scope(|s| {
		s.spawn(|| {
			insert_odds(&tree, n, 1_000, 6);
			done.store(true, Ordering::Release);
		});
		run_readers(&tree, 8, &done, |tree, rng| {
			let a = rng.random_range(0..2 * n);
			let b = rng.random_range(0..2 * n);
			if a != b {
				checked_scan(tree, 2 * n, a, b, rng.random_range(1..64));
			}
		});
	});

	tree.assert_invariants();
}
