//! # Concurrency Tests for the Concurrent AVL Set
//!
//! This module contains multi-threaded tests to verify the correctness
//! of the hand-over-hand locking protocol and the background rebalancer
//! under various contention scenarios.
//!
//! ## Test Categories
//!
//! - Basic concurrent tests: Lower contention, always run
//! - Stress tests: Higher contention, marked with `#[ignore]` - run with `cargo test -- --ignored`
//!
//! ## What can be asserted
//!
//! Mutations hold the balance gate shared, so their returned bools are
//! linearizable even while background passes run; those bools drive the
//! reconciliation checks below. Lookups take no gate at all and may
//! transiently miss a value whose ancestors are mid-rotation, so reader
//! threads never assert on individual lookups - misses are collected and
//! re-checked once the set is quiescent, which distinguishes a harmless
//! transient from an actual lost value.

use alderset::AvlSet;
use rand::prelude::*;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ===========================================================================
// Basic Concurrent Insert Tests
// ===========================================================================

#[test]
fn concurrent_insert_disjoint_ranges() {
	let set = Arc::new(AvlSet::new());
	let num_threads = 4i64;
	let values_per_thread = 250i64;

	let handles: Vec<_> = (0..num_threads)
		.map(|t| {
			let set = Arc::clone(&set);
			thread::spawn(move || {
				for i in 0..values_per_thread {
					let value = t * values_per_thread + i;
					assert!(set.insert(value), "Value {} inserted twice", value);
				}
			})
		})
		.collect();

	for h in handles {
		h.join().unwrap();
	}

	set.close();

	assert_eq!(set.len(), (num_threads * values_per_thread) as usize);
	assert!(set.check_integrity());
	for value in 0..num_threads * values_per_thread {
		assert!(set.contains(value), "Missing value {}", value);
	}
}

#[test]
fn concurrent_duplicate_inserts_agree() {
	let set = Arc::new(AvlSet::new());
	let num_threads = 4;
	let iterations = 100;

	// All threads repeatedly insert the same ten values; each value must
	// admit exactly one winning insert across all threads.
	let handles: Vec<_> = (0..num_threads)
		.map(|_| {
			let set = Arc::clone(&set);
			thread::spawn(move || {
				let mut won = 0usize;
				for i in 0..iterations {
					if set.insert(i % 10) {
						won += 1;
					}
				}
				won
			})
		})
		.collect();

	let total_wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

	set.close();

	assert_eq!(total_wins, 10, "Each value must be claimed exactly once");
	assert_eq!(set.len(), 10);
	for value in 0..10 {
		assert!(set.contains(value));
	}
}

#[test]
fn concurrent_inserts_trigger_background_rebalance() {
	let set = Arc::new(AvlSet::with_rebalance_threshold(128));
	let num_threads = 4i64;
	let values_per_thread = 256i64;

	let handles: Vec<_> = (0..num_threads)
		.map(|t| {
			let set = Arc::clone(&set);
			thread::spawn(move || {
				// Ascending within each disjoint range keeps the tree skewed.
				for i in 0..values_per_thread {
					set.insert(t * values_per_thread + i);
				}
			})
		})
		.collect();

	for h in handles {
		h.join().unwrap();
	}

	// The final threshold crossing happened at some point during the run;
	// the worker must restore balance without further help.
	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	while !set.is_height_balanced() {
		assert!(std::time::Instant::now() < deadline, "Background rebalance never caught up");
		thread::sleep(Duration::from_millis(1));
	}

	set.close();
	assert!(set.is_height_balanced());
	assert_eq!(set.len(), (num_threads * values_per_thread) as usize);
}

// ===========================================================================
// Concurrent Reader Tests
// ===========================================================================

#[test]
fn many_concurrent_readers() {
	let set = Arc::new(AvlSet::new());
	let num_readers = 4;
	let values = 1000i64;

	for i in 0..values {
		set.insert(i);
	}

	// The 1000 inserts crossed the default threshold, so a background pass
	// may be rotating while the readers run; misses must be transient.
	let handles: Vec<_> = (0..num_readers)
		.map(|_| {
			let set = Arc::clone(&set);
			thread::spawn(move || {
				let mut missed = Vec::new();
				for i in 0..values {
					if !set.contains(i) {
						missed.push(i);
					}
				}
				missed
			})
		})
		.collect();

	let missed: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();

	set.close();

	for value in missed {
		assert!(set.contains(value), "Value {} was permanently lost", value);
	}
	assert_eq!(set.len(), values as usize);
}

#[test]
fn readers_survive_rebalancer_churn() {
	// An aggressive threshold keeps the worker rotating almost constantly.
	let set = Arc::new(AvlSet::with_rebalance_threshold(16));
	let stable = 100i64;

	for i in 0..stable {
		set.insert(i);
	}

	let churner = {
		let set = Arc::clone(&set);
		thread::spawn(move || {
			// Churn a disjoint range; every pass still restructures the
			// whole tree, including the stable values' ancestors.
			for round in 0..50 {
				for i in 1000..1200 {
					set.insert(i + round);
				}
				for i in 1000..1200 {
					set.remove(i + round);
				}
			}
		})
	};

	let readers: Vec<_> = (0..4)
		.map(|_| {
			let set = Arc::clone(&set);
			thread::spawn(move || {
				let mut missed = Vec::new();
				for _ in 0..200 {
					for i in 0..stable {
						if !set.contains(i) {
							missed.push(i);
						}
					}
				}
				missed
			})
		})
		.collect();

	churner.join().unwrap();
	let missed: Vec<i64> = readers.into_iter().flat_map(|h| h.join().unwrap()).collect();

	set.close();

	// Transient misses during a rotation are tolerated; the stable values
	// themselves must all have survived untouched.
	for value in missed {
		assert!(set.contains(value), "Stable value {} was permanently lost", value);
	}
	for i in 0..stable {
		assert!(set.contains(i), "Stable value {} missing after churn", i);
	}
	assert!(set.check_integrity());
}

// ===========================================================================
// Mixed Operation Tests
// ===========================================================================

#[test]
fn concurrent_mixed_operations_reconcile() {
	let set = Arc::new(AvlSet::new());
	let key_range = 128i64;
	let num_threads = 8;
	let ops_per_thread = 500;

	// Per-value net effect: +1 for each winning insert, -1 for each
	// winning remove. Linearizability forces the transitions for one value
	// to alternate, so each delta ends in {0, 1} and decides membership.
	let deltas: Arc<Vec<AtomicIsize>> =
		Arc::new((0..key_range).map(|_| AtomicIsize::new(0)).collect());

	let handles: Vec<_> = (0..num_threads)
		.map(|_| {
			let set = Arc::clone(&set);
			let deltas = Arc::clone(&deltas);
			thread::spawn(move || {
				let mut rng = rand::rng();
				for _ in 0..ops_per_thread {
					let value = rng.random_range(0..key_range);
					match rng.random_range(0..3u8) {
						0 => {
							if set.insert(value) {
								deltas[value as usize].fetch_add(1, Ordering::Relaxed);
							}
						}
						1 => {
							if set.remove(value) {
								deltas[value as usize].fetch_sub(1, Ordering::Relaxed);
							}
						}
						2 => {
							set.contains(value);
						}
						_ => unreachable!(),
					}
				}
			})
		})
		.collect();

	for h in handles {
		h.join().unwrap();
	}

	set.close();

	let mut expected_len = 0usize;
	for value in 0..key_range {
		let delta = deltas[value as usize].load(Ordering::Relaxed);
		assert!(
			delta == 0 || delta == 1,
			"Value {} has impossible transition count {}",
			value,
			delta
		);
		assert_eq!(
			set.contains(value),
			delta == 1,
			"Membership of {} disagrees with its transitions",
			value
		);
		expected_len += delta as usize;
	}
	assert_eq!(set.len(), expected_len);
	assert!(set.check_integrity());
}

#[test]
fn concurrent_removes_disjoint() {
	let set = Arc::new(AvlSet::new());
	let values = 1000i64;

	for i in 0..values {
		set.insert(i);
	}

	let num_threads = 4i64;
	let per_thread = values / num_threads;

	let handles: Vec<_> = (0..num_threads)
		.map(|t| {
			let set = Arc::clone(&set);
			thread::spawn(move || {
				let mut removed = 0usize;
				for i in 0..per_thread {
					if set.remove(t * per_thread + i) {
						removed += 1;
					}
				}
				removed
			})
		})
		.collect();

	for h in handles {
		assert_eq!(h.join().unwrap(), per_thread as usize);
	}

	set.close();
	assert!(set.is_empty());
}

#[test]
fn concurrent_removes_same_range() {
	let set = Arc::new(AvlSet::new());
	let values = 100i64;

	// Insert out of order so interior nodes with two children are common
	// and contended removals exercise the successor hand-over-hand path.
	let mut order: Vec<i64> = (0..values).collect();
	order.shuffle(&mut rand::rng());
	for v in order {
		set.insert(v);
	}

	let handles: Vec<_> = (0..4)
		.map(|_| {
			let set = Arc::clone(&set);
			thread::spawn(move || {
				let mut removed = 0usize;
				for i in 0..values {
					if set.remove(i) {
						removed += 1;
					}
				}
				removed
			})
		})
		.collect();

	let total_removed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

	set.close();

	assert_eq!(total_removed, values as usize, "Each value must be removed exactly once");
	assert!(set.is_empty());
}

#[test]
fn removals_with_concurrent_readers() {
	let set = Arc::new(AvlSet::new());

	for i in 0..400 {
		set.insert(i);
	}

	let removers: Vec<_> = (0..2)
		.map(|t| {
			let set = Arc::clone(&set);
			thread::spawn(move || {
				for i in (100..300).filter(move |i| i % 2 == t) {
					set.remove(i);
				}
			})
		})
		.collect();

	let readers: Vec<_> = (0..2)
		.map(|_| {
			let set = Arc::clone(&set);
			thread::spawn(move || {
				let mut missed = Vec::new();
				for _ in 0..100 {
					for i in 0..100 {
						if !set.contains(i) {
							missed.push(i);
						}
					}
				}
				missed
			})
		})
		.collect();

	for h in removers {
		h.join().unwrap();
	}
	let missed: Vec<i64> = readers.into_iter().flat_map(|h| h.join().unwrap()).collect();

	set.close();

	for value in missed {
		assert!(set.contains(value), "Untouched value {} was lost", value);
	}
	for i in 0..100 {
		assert!(set.contains(i));
	}
	for i in 100..300 {
		assert!(!set.contains(i), "Value {} should have been removed", i);
	}
	for i in 300..400 {
		assert!(set.contains(i));
	}
}

// ===========================================================================
// Stress Tests (ignored by default - run with `cargo test -- --ignored`)
// ===========================================================================

/// Hot-value contention: every thread fights over sixteen values.
#[test]
#[ignore]
fn stress_high_contention_hot_values() {
	let set = Arc::new(AvlSet::new());
	let key_range = 16i64;
	let num_threads = 8;
	let ops_per_thread = 10_000;

	let deltas: Arc<Vec<AtomicIsize>> =
		Arc::new((0..key_range).map(|_| AtomicIsize::new(0)).collect());

	let handles: Vec<_> = (0..num_threads)
		.map(|_| {
			let set = Arc::clone(&set);
			let deltas = Arc::clone(&deltas);
			thread::spawn(move || {
				let mut rng = rand::rng();
				for _ in 0..ops_per_thread {
					let value = rng.random_range(0..key_range);
					if rng.random_bool(0.5) {
						if set.insert(value) {
							deltas[value as usize].fetch_add(1, Ordering::Relaxed);
						}
					} else if set.remove(value) {
						deltas[value as usize].fetch_sub(1, Ordering::Relaxed);
					}
				}
			})
		})
		.collect();

	for h in handles {
		h.join().unwrap();
	}

	set.close();

	for value in 0..key_range {
		let delta = deltas[value as usize].load(Ordering::Relaxed);
		assert_eq!(set.contains(value), delta == 1, "Membership of {} drifted", value);
	}
	assert!(set.check_integrity());
}

/// Sustained mixed operations for a fixed wall-clock duration.
#[test]
#[ignore]
fn stress_sustained_mixed_operations() {
	let set = Arc::new(AvlSet::new());
	let num_threads = 8;
	let duration_ms = 500;

	let running = Arc::new(AtomicUsize::new(1));

	let handles: Vec<_> = (0..num_threads)
		.map(|_| {
			let set = Arc::clone(&set);
			let running = Arc::clone(&running);
			thread::spawn(move || {
				let mut rng = rand::rng();
				let mut ops = 0u64;

				while running.load(Ordering::Relaxed) == 1 {
					let value: i64 = rng.random_range(0..1000);
					match rng.random_range(0..10u8) {
						0..=3 => {
							set.insert(value);
						}
						4..=5 => {
							set.remove(value);
						}
						6..=9 => {
							set.contains(value);
						}
						_ => unreachable!(),
					}
					ops += 1;
				}

				ops
			})
		})
		.collect();

	thread::sleep(Duration::from_millis(duration_ms));
	running.store(0, Ordering::Relaxed);

	let total_ops: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
	assert!(total_ops > 100, "Only {} operations performed", total_ops);

	set.close();
	assert!(set.check_integrity());
	assert!(set.len() <= 1000);
}

/// Mutators racing a rebalancer that fires on nearly every mutation.
#[test]
#[ignore]
fn stress_rebalancer_vs_mutators() {
	let set = Arc::new(AvlSet::with_rebalance_threshold(4));
	let num_threads = 8;
	let ops_per_thread = 5000;

	let handles: Vec<_> = (0..num_threads)
		.map(|_| {
			let set = Arc::clone(&set);
			thread::spawn(move || {
				let mut rng = rand::rng();
				for _ in 0..ops_per_thread {
					let value: i64 = rng.random_range(0..512);
					if rng.random_bool(0.6) {
						set.insert(value);
					} else {
						set.remove(value);
					}
				}
			})
		})
		.collect();

	for h in handles {
		h.join().unwrap();
	}

	set.close();

	let values = set.in_order_values();
	assert!(values.windows(2).all(|w| w[0] < w[1]), "Order violated after pass storm");
	assert_eq!(set.len(), values.len());
	assert!(set.check_integrity());
}
