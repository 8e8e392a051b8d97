//! # Alderset: A Concurrent AVL-Tree Integer Set
//!
//! This crate provides a concurrent ordered set of `i64` values backed by a
//! binary search tree with **deferred AVL rebalancing**: lookups run without
//! taking any locks, updates lock only the two or three nodes they edit, and
//! the work of keeping the tree balanced is pushed off the operation path
//! onto a background thread.
//!
//! ## Design Overview
//!
//! ### Key Concepts
//!
//! **Lock-free descents**: Every operation first walks the tree without
//! locks, producing a *window* - the last three nodes it visited
//! (grandparent, parent, child). Because nothing was locked, the window may
//! be stale by the time it is used; operations lock the window's nodes,
//! repeat the descent, and compare the result by pointer identity before
//! trusting it. A mismatch releases the locks and retries from the top.
//!
//! **Fine-grained update locking**: Insert locks the grandparent and parent
//! of the insertion point; remove locks the parent and the target, extending
//! hand over hand down the right subtree when a two-child removal has to
//! find its successor. Disjoint updates proceed in parallel.
//!
//! **The balance gate**: A [`gate::BalanceGate`] (read/write lock plus a
//! version stamp) arbitrates between point operations, which hold it shared,
//! and whole-tree rebalancing, which holds it exclusively. Lookups skip the
//! gate entirely and instead detect an in-flight rotation through per-node
//! `balancing` flags.
//!
//! **Deferred balancing**: Updates leave heights untouched, so the tree
//! drifts out of AVL shape as mutations accumulate. Each committed mutation
//! bumps a counter; when the counter crosses a threshold (default 500) a
//! request flag is armed and a background worker runs a rebalance pass over
//! the whole tree (post-order sweeps repeated to a fixpoint), restoring
//! exact heights and the AVL balance bound everywhere.
//!
//! ### Tree Structure
//!
//! ```text
//!            ┌──────────────┐
//!            │   Sentinel   │  <- value = i64::MIN, never removed,
//!            │ left: always │     owned by the set itself
//!            │        null  │
//!            └──────┬───────┘
//!                   │ right
//!                   ▼
//!            ┌──────────────┐
//!            │     Root     │  <- first real node (null when empty)
//!            └──┬────────┬──┘
//!               ▼        ▼
//!           ┌──────┐ ┌──────┐
//!           │ Left │ │ Right│  <- value/height/parent + per-node mutex
//!           └──────┘ └──────┘
//! ```
//!
//! The sentinel gives every real node a non-null parent, which removes all
//! root special cases from the update protocol: removing the real root is
//! just a removal whose parent happens to be the sentinel. The sentinel's
//! value is `i64::MIN`, so that value can never be stored;
//! [`AvlSet::insert`], [`AvlSet::remove`] and [`AvlSet::contains`] all
//! return `false` for it.
//!
//! ## Basic Usage
//!
//! ```
//! use alderset::AvlSet;
//!
//! let set = AvlSet::new();
//!
//! set.insert(2);
//! set.insert(1);
//! set.insert(3);
//!
//! assert!(set.contains(2));
//! assert!(set.remove(2));
//! assert!(!set.contains(2));
//! assert_eq!(set.in_order_values(), vec![1, 3]);
//! ```
//!
//! ## Thread Safety
//!
//! The set is fully thread-safe and is shared across threads via
//! `Arc<AvlSet>`:
//!
//! ```
//! use alderset::AvlSet;
//! use std::sync::Arc;
//!
//! let set = Arc::new(AvlSet::new());
//!
//! let handles: Vec<_> = (0..4i64)
//! 	.map(|t| {
//! 		let set = Arc::clone(&set);
//! 		std::thread::spawn(move || {
//! 			for i in 0..100 {
//! 				set.insert(t * 100 + i);
//! 			}
//! 		})
//! 	})
//! 	.collect();
//!
//! for handle in handles {
//! 	handle.join().unwrap();
//! }
//!
//! assert_eq!(set.len(), 400);
//! ```
//!
//! ## Memory Reclamation
//!
//! Lookups may still be standing on a node while another thread unlinks it,
//! so removed nodes cannot be freed immediately. The crate uses epoch-based
//! reclamation (`crossbeam-epoch`): every operation pins the current epoch,
//! unlinked nodes are handed to `defer_destroy`, and the memory is reclaimed
//! once every thread that could have seen the node has moved on.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::{Mutex, MutexGuard};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

pub mod error;
pub mod gate;

mod maintenance;
mod rebalance;

use gate::BalanceGate;

/// Committed mutations between automatic rebalance passes.
///
/// Tunable per set through [`AvlSet::with_rebalance_threshold`].
pub(crate) const DEFAULT_REBALANCE_THRESHOLD: usize = 500;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A tree node.
///
/// All fields that lock-free descents read are atomics: descents race with
/// updates by design and resolve the races by re-validating under the node
/// mutexes, but the individual loads must still be well defined.
///
/// `left` and `right` own their subtrees by convention - a node is retired
/// exactly once, when it is unlinked. `parent` is a non-owning back edge and
/// is never destroyed through; epoch reclamation keeps it safe to follow
/// even when the parent was concurrently retired.
pub(crate) struct Node {
	value: AtomicI64,
	/// Cached subtree height. Zero on creation and only corrected by a
	/// rebalance pass, so it is stale by design between passes.
	height: AtomicUsize,
	left: Atomic<Node>,
	right: Atomic<Node>,
	parent: Atomic<Node>,
	/// Structural lock. Guards the node's links and its slot in the parent
	/// by protocol, not by ownership: updates lock the window they edit.
	mutex: Mutex<()>,
	/// Set on a node and its parent while a rotation is rewiring them.
	/// Lookups treat a raised flag as "this window cannot be trusted".
	balancing: AtomicBool,
}

impl Node {
	fn new(value: i64, parent: Shared<'_, Node>) -> Node {
		Node {
			value: AtomicI64::new(value),
			height: AtomicUsize::new(0),
			left: Atomic::null(),
			right: Atomic::null(),
			parent: Atomic::from(parent),
			mutex: Mutex::new(()),
			balancing: AtomicBool::new(false),
		}
	}

	/// The header node: value `i64::MIN`, no parent.
	fn sentinel() -> Node {
		Node::new(i64::MIN, Shared::null())
	}

	#[inline]
	pub(crate) fn value(&self) -> i64 {
		self.value.load(Ordering::Acquire)
	}

	#[inline]
	pub(crate) fn set_value(&self, value: i64) {
		self.value.store(value, Ordering::Release);
	}

	#[inline]
	pub(crate) fn height(&self) -> usize {
		self.height.load(Ordering::Relaxed)
	}

	#[inline]
	pub(crate) fn set_height(&self, height: usize) {
		self.height.store(height, Ordering::Relaxed);
	}

	#[inline]
	pub(crate) fn left<'g>(&self, eg: &'g Guard) -> Shared<'g, Node> {
		self.left.load(Ordering::Acquire, eg)
	}

	#[inline]
	pub(crate) fn right<'g>(&self, eg: &'g Guard) -> Shared<'g, Node> {
		self.right.load(Ordering::Acquire, eg)
	}

	#[inline]
	pub(crate) fn parent<'g>(&self, eg: &'g Guard) -> Shared<'g, Node> {
		self.parent.load(Ordering::Acquire, eg)
	}

	#[inline]
	pub(crate) fn set_left(&self, node: Shared<'_, Node>) {
		self.left.store(node, Ordering::Release);
	}

	#[inline]
	pub(crate) fn set_right(&self, node: Shared<'_, Node>) {
		self.right.store(node, Ordering::Release);
	}

	#[inline]
	pub(crate) fn set_parent(&self, node: Shared<'_, Node>) {
		self.parent.store(node, Ordering::Release);
	}

	#[inline]
	pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
		self.mutex.lock()
	}

	#[inline]
	pub(crate) fn is_balancing(&self) -> bool {
		self.balancing.load(Ordering::Acquire)
	}

	#[inline]
	pub(crate) fn set_balancing(&self, on: bool) {
		self.balancing.store(on, Ordering::Release);
	}
}

/// Locks a node's structural mutex if the pointer is non-null.
///
/// The guard borrows the node through the epoch lifetime, so it remains
/// valid even if the node is unlinked while the lock is held.
#[inline]
fn lock_node<'g>(node: Shared<'g, Node>) -> Option<MutexGuard<'g, ()>> {
	// SAFETY: non-null pointers produced by a descent are protected by the
	// epoch guard the descent ran under.
	unsafe { node.as_ref() }.map(Node::lock)
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// The last three nodes a descent visited: grandparent, parent and child.
///
/// `child` is null when the value was not found; `parent` is at least the
/// sentinel; `grandparent` is null while the descent is still at the top.
/// Windows are snapshots - they carry no locks and are re-validated by
/// running the descent again and comparing pointer identity.
#[derive(Clone, Copy)]
struct Window<'g> {
	grandparent: Shared<'g, Node>,
	parent: Shared<'g, Node>,
	child: Shared<'g, Node>,
}

impl<'g> Window<'g> {
	/// Pointer-identity comparison of the full triple.
	#[inline]
	fn same_triple(&self, other: &Window<'_>) -> bool {
		self.grandparent.as_raw() == other.grandparent.as_raw()
			&& self.parent.as_raw() == other.parent.as_raw()
			&& self.child.as_raw() == other.child.as_raw()
	}

	/// Pointer-identity comparison of the (parent, child) pair.
	#[inline]
	fn same_pair(&self, other: &Window<'_>) -> bool {
		self.parent.as_raw() == other.parent.as_raw()
			&& self.child.as_raw() == other.child.as_raw()
	}
}

// ---------------------------------------------------------------------------
// Shared tree state
// ---------------------------------------------------------------------------

/// The tree itself plus the coordination state shared with the maintenance
/// worker. Lives inside an `Arc` so the worker can outlive individual
/// borrows of the owning [`AvlSet`]; the `Arc` also pins the sentinel's
/// address, which parent pointers of root nodes rely on.
pub(crate) struct Inner {
	/// Header node; its right child is the real root.
	sentinel: Node,
	gate: BalanceGate,
	/// Committed mutations since the last rebalance pass.
	updates: AtomicUsize,
	/// Armed by `note_update` at the threshold, consumed by the worker.
	rebalance_requested: AtomicBool,
	shutdown: AtomicBool,
	threshold: usize,
}

impl Inner {
	fn new(threshold: usize) -> Inner {
		Inner {
			sentinel: Node::sentinel(),
			gate: BalanceGate::new(),
			updates: AtomicUsize::new(0),
			rebalance_requested: AtomicBool::new(false),
			shutdown: AtomicBool::new(false),
			// A threshold of zero would re-arm the request inside the pass
			// that just cleared it, so it is treated as one.
			threshold: threshold.max(1),
		}
	}

	/// The sentinel as a `Shared`, for parent comparisons and as the parent
	/// argument of a root-level rebalance.
	#[inline]
	fn sentinel_ptr<'g>(&self, _eg: &'g Guard) -> Shared<'g, Node> {
		Shared::from(&self.sentinel as *const Node)
	}

	#[inline]
	fn root<'g>(&self, eg: &'g Guard) -> Shared<'g, Node> {
		self.sentinel.right(eg)
	}

	// -----------------------------------------------------------------------
	// Descent
	// -----------------------------------------------------------------------

	/// Lock-free descent for `value`, starting at the sentinel's right
	/// child with the sentinel as the initial parent.
	///
	/// Stops on an exact match or on a null slot; either way the returned
	/// window frames the location where `value` is or would be. The descent
	/// tolerates concurrent edits: it may follow a pointer into a subtree
	/// that has already moved, which is exactly what the callers' lock and
	/// re-descend step exists to catch.
	fn locate<'g>(&self, value: i64, eg: &'g Guard) -> Window<'g> {
		let mut grandparent = Shared::null();
		let mut parent = self.sentinel_ptr(eg);
		let mut child = self.sentinel.right(eg);

		// SAFETY: the epoch guard keeps every reachable (or recently
		// unlinked) node alive for the duration of the descent.
		while let Some(node) = unsafe { child.as_ref() } {
			let v = node.value();
			if v == value {
				break;
			}
			grandparent = parent;
			parent = child;
			child = if value < v { node.left(eg) } else { node.right(eg) };
		}

		Window {
			grandparent,
			parent,
			child,
		}
	}

	// -----------------------------------------------------------------------
	// Insert
	// -----------------------------------------------------------------------

	fn insert(&self, value: i64, eg: &Guard) -> bool {
		let gate = self.gate.shared();

		let inserted = loop {
			let perform = || {
				let window = self.locate(value, eg);
				if !window.child.is_null() {
					return error::Result::Ok(false);
				}

				// Lock the edit site top down. The grandparent lock shields
				// the parent's own slot from a concurrent splice while we
				// publish under it.
				let _grandparent_lock = lock_node(window.grandparent);
				let _parent_lock = lock_node(window.parent);

				let current = self.locate(value, eg);
				if !current.same_triple(&window) {
					return Err(error::Error::Stale);
				}
				gate.recheck()?;

				// SAFETY: `parent` is at least the sentinel, which lives as
				// long as this Inner; real nodes are epoch-protected.
				let parent = unsafe { window.parent.deref() };

				// The slot is picked from the parent's current value, not
				// the descent's memory of it: a concurrent value swap would
				// otherwise misplace the new node.
				if value < parent.value() && parent.left(eg).is_null() {
					let node = Owned::new(Node::new(value, window.parent)).into_shared(eg);
					parent.set_left(node);
				} else if value > parent.value() && parent.right(eg).is_null() {
					let node = Owned::new(Node::new(value, window.parent)).into_shared(eg);
					parent.set_right(node);
				} else {
					return Err(error::Error::Stale);
				}

				Ok(true)
			};

			match perform() {
				Ok(done) => break done,
				Err(_) => {
					// Validation failed - retry with a fresh descent
					continue;
				}
			}
		};

		drop(gate);
		if inserted {
			self.note_update();
		}
		inserted
	}

	// -----------------------------------------------------------------------
	// Remove
	// -----------------------------------------------------------------------

	fn remove(&self, value: i64, eg: &Guard) -> bool {
		let gate = self.gate.shared();

		let removed = loop {
			let perform = || {
				let window = self.locate(value, eg);
				if window.child.is_null() {
					return error::Result::Ok(false);
				}

				// SAFETY: parent is at least the sentinel; the child is a
				// real node protected by the epoch guard.
				let parent = unsafe { window.parent.deref() };
				let target = unsafe { window.child.deref() };
				let _parent_lock = parent.lock();
				let _target_lock = target.lock();

				let current = self.locate(value, eg);
				if !current.same_pair(&window) {
					return Err(error::Error::Stale);
				}

				let left = target.left(eg);
				let right = target.right(eg);

				if left.is_null() && right.is_null() {
					// Leaf: empty out the parent's slot.
					if parent.left(eg).as_raw() == window.child.as_raw() {
						parent.set_left(Shared::null());
					} else {
						parent.set_right(Shared::null());
					}
					// SAFETY: the node is unlinked; readers still standing
					// on it are protected by their epoch guards.
					unsafe { eg.defer_destroy(window.child) };
					return Ok(true);
				}

				if left.is_null() || right.is_null() {
					// One child: splice the lone subtree into the parent's
					// slot and repoint its back edge.
					let lone = if left.is_null() { right } else { left };
					if parent.left(eg).as_raw() == window.child.as_raw() {
						parent.set_left(lone);
					} else {
						parent.set_right(lone);
					}
					// SAFETY: non-null by the branch condition.
					unsafe { lone.deref() }.set_parent(window.parent);
					target.set_left(Shared::null());
					target.set_right(Shared::null());
					// SAFETY: fully unlinked now.
					unsafe { eg.defer_destroy(window.child) };
					return Ok(true);
				}

				self.remove_via_successor(&window, target, right, eg)
			};

			match perform() {
				Ok(done) => break done,
				Err(_) => {
					// Validation failed - retry with a fresh descent
					continue;
				}
			}
		};

		drop(gate);
		if removed {
			self.note_update();
		}
		removed
	}

	/// Two-child removal: walk to the minimum of the right subtree hand
	/// over hand, swap values with the target and unlink the successor.
	///
	/// The target and its parent are locked by the caller. On the first
	/// step the target doubles as the successor's parent; its lock is
	/// already held, so the walk starts with `succ_parent_guard` empty
	/// instead of re-locking it.
	fn remove_via_successor<'g>(
		&self,
		window: &Window<'g>,
		target: &'g Node,
		right: Shared<'g, Node>,
		eg: &'g Guard,
	) -> error::Result<bool> {
		let mut succ_parent = window.child;
		let mut succ_parent_guard: Option<MutexGuard<'g, ()>> = None;
		let mut succ = right;
		// SAFETY: the right child is non-null in the two-child case and the
		// epoch guard protects it.
		let mut succ_ref = unsafe { succ.deref() };
		let mut succ_guard = succ_ref.lock();

		loop {
			let next = succ_ref.left(eg);
			if next.is_null() {
				break;
			}
			// Slide both locks one level down. Overwriting the parent guard
			// releases the old parent while the successor lock is still
			// held, so the chain stays covered.
			succ_parent = succ;
			succ_parent_guard = Some(succ_guard);
			succ = next;
			// SAFETY: non-null by the loop condition, epoch-protected.
			succ_ref = unsafe { succ.deref() };
			succ_guard = succ_ref.lock();
		}
		// Quiet the "never read" lint: the guard's job is purely to hold
		// the lock until the splice below is published.
		let _ = &succ_parent_guard;

		// The successor was reached through pointers that were live at
		// unknown times; confirm a fresh descent on its value lands on the
		// same (parent, child) pair before editing anything.
		let succ_value = succ_ref.value();
		let check = self.locate(succ_value, eg);
		if check.parent.as_raw() != succ_parent.as_raw() || check.child.as_raw() != succ.as_raw()
		{
			return Err(error::Error::Stale);
		}

		// Logical removal: the target takes the successor's value. The
		// swap runs both directions so the successor node carries the
		// removed value while it is being unlinked.
		let target_value = target.value();
		target.set_value(succ_value);
		succ_ref.set_value(target_value);

		if succ.as_raw() == right.as_raw() {
			// The successor is the target's immediate right child: its
			// right subtree moves up under the target.
			let promoted = succ_ref.right(eg);
			target.set_right(promoted);
			// SAFETY: epoch-protected when non-null.
			if let Some(promoted_ref) = unsafe { promoted.as_ref() } {
				promoted_ref.set_parent(window.child);
			}
		} else {
			// Deep successor: it is its parent's left child, and its right
			// subtree (possibly empty) takes its place.
			let promoted = succ_ref.right(eg);
			// SAFETY: a deep successor hangs below a real node that we hold
			// locked through `succ_parent_guard`.
			let succ_parent_ref = unsafe { succ_parent.deref() };
			succ_parent_ref.set_left(promoted);
			// SAFETY: epoch-protected when non-null.
			if let Some(promoted_ref) = unsafe { promoted.as_ref() } {
				promoted_ref.set_parent(succ_parent);
			}
		}

		succ_ref.set_left(Shared::null());
		succ_ref.set_right(Shared::null());
		// SAFETY: the successor is fully unlinked.
		unsafe { eg.defer_destroy(succ) };
		Ok(true)
	}

	// -----------------------------------------------------------------------
	// Contains
	// -----------------------------------------------------------------------

	/// Lock-free lookup with a locked re-check on a hit.
	///
	/// Does not touch the balance gate: a lookup that lands on a window
	/// while a rotation is rewiring it rejects the window through the
	/// `balancing` flags or the parent back-edge mismatch, then retries.
	fn contains(&self, value: i64, eg: &Guard) -> bool {
		loop {
			let window = self.locate(value, eg);
			if window.child.is_null() {
				return false;
			}

			// SAFETY: parent is at least the sentinel; the child is
			// epoch-protected.
			let parent = unsafe { window.parent.deref() };
			let child = unsafe { window.child.deref() };

			// Cheap rejection before locking: a parent back edge that
			// disagrees with the descent, or a rotation in flight at either
			// node, means this window cannot be trusted.
			if child.parent(eg).as_raw() != window.parent.as_raw()
				|| child.is_balancing()
				|| parent.is_balancing()
			{
				continue;
			}

			let _parent_lock = parent.lock();
			let _child_lock = child.lock();

			let current = self.locate(value, eg);
			if current.same_pair(&window) {
				return true;
			}
			// The window moved while the locks were being taken, look again.
		}
	}

	// -----------------------------------------------------------------------
	// Maintenance hooks
	// -----------------------------------------------------------------------

	/// Counts a committed mutation and arms the rebalance request once the
	/// threshold is crossed. Runs after the gate guard is dropped so the
	/// worker never contends with the caller's own critical section.
	fn note_update(&self) {
		let committed = self.updates.fetch_add(1, Ordering::Relaxed) + 1;
		if committed >= self.threshold {
			self.rebalance_requested.store(true, Ordering::Release);
		}
	}

	/// Runs one whole-tree rebalance pass under exclusive gate access and
	/// resets the update counter.
	///
	/// A pass repeats post-order sweeps until one completes without
	/// rotating; a sweep applies at most one rotation per node, which on a
	/// badly skewed tree leaves residual imbalance a level further down.
	/// The republished root is stored after every sweep so that lock-free
	/// descents racing the pass never start below a retired link.
	pub(crate) fn run_rebalance_pass(&self) {
		let eg = &epoch::pin();
		let gate = self.gate.exclusive();

		loop {
			let mut rotated = false;
			let root = self.root(eg);
			let new_root =
				rebalance::rebalance_subtree(self.sentinel_ptr(eg), root, &mut rotated, eg);
			self.sentinel.set_right(new_root);
			if !rotated {
				break;
			}
		}

		self.updates.store(0, Ordering::Relaxed);
		drop(gate);
	}

	#[inline]
	pub(crate) fn rebalance_requested(&self) -> bool {
		self.rebalance_requested.load(Ordering::Acquire)
	}

	#[inline]
	pub(crate) fn clear_rebalance_request(&self) {
		self.rebalance_requested.store(false, Ordering::Release);
	}

	#[inline]
	pub(crate) fn shutting_down(&self) -> bool {
		self.shutdown.load(Ordering::Acquire)
	}

	#[inline]
	fn signal_shutdown(&self) {
		self.shutdown.store(true, Ordering::Release);
	}

	#[inline]
	pub(crate) fn is_empty(&self) -> bool {
		let eg = &epoch::pin();
		self.root(eg).is_null()
	}

	// -----------------------------------------------------------------------
	// Whole-tree operations
	// -----------------------------------------------------------------------

	/// Detaches the entire tree and retires every node.
	///
	/// Takes the gate exclusively, so gated updates drain before the
	/// detach and their retries observe the empty tree.
	fn clear(&self) {
		let eg = &epoch::pin();
		let gate = self.gate.exclusive();
		let detached = self.sentinel.right.swap(Shared::null(), Ordering::AcqRel, eg);
		drop(gate);

		// Retire the detached subtree outside the gate; lookups still
		// descending into it hold epoch guards that keep the memory alive.
		let mut stack = vec![detached];
		while let Some(node) = stack.pop() {
			if node.is_null() {
				continue;
			}
			// SAFETY: children are read before the node is scheduled, and
			// destruction is deferred past every active epoch guard.
			unsafe {
				stack.push(node.deref().left(eg));
				stack.push(node.deref().right(eg));
				eg.defer_destroy(node);
			}
		}
	}

	/// Counts nodes by full traversal.
	fn len(&self, eg: &Guard) -> usize {
		let mut count = 0;
		let mut stack = vec![self.root(eg)];
		while let Some(node) = stack.pop() {
			// SAFETY: epoch-protected (see locate).
			if let Some(node_ref) = unsafe { node.as_ref() } {
				count += 1;
				stack.push(node_ref.left(eg));
				stack.push(node_ref.right(eg));
			}
		}
		count
	}

	/// In-order traversal into a vector.
	fn in_order_values(&self, eg: &Guard) -> Vec<i64> {
		let mut out = Vec::new();
		let mut stack: Vec<Shared<'_, Node>> = Vec::new();
		let mut cursor = self.root(eg);
		loop {
			// SAFETY: epoch-protected (see locate).
			while let Some(node_ref) = unsafe { cursor.as_ref() } {
				stack.push(cursor);
				cursor = node_ref.left(eg);
			}
			let Some(node) = stack.pop() else { break };
			// SAFETY: only non-null pointers are pushed above.
			let node_ref = unsafe { node.deref() };
			out.push(node_ref.value());
			cursor = node_ref.right(eg);
		}
		out
	}

	/// Structural walk checking parent back edges and local ordering.
	fn check_integrity(&self, eg: &Guard) -> bool {
		let root = self.root(eg);
		// SAFETY: epoch-protected (see locate).
		if let Some(root_ref) = unsafe { root.as_ref() } {
			if root_ref.parent(eg).as_raw() != self.sentinel_ptr(eg).as_raw() {
				return false;
			}
		}

		let mut stack = vec![root];
		while let Some(node) = stack.pop() {
			// SAFETY: epoch-protected (see locate).
			let Some(node_ref) = (unsafe { node.as_ref() }) else {
				continue;
			};
			let value = node_ref.value();

			let left = node_ref.left(eg);
			// SAFETY: epoch-protected (see locate).
			if let Some(left_ref) = unsafe { left.as_ref() } {
				if left_ref.parent(eg).as_raw() != node.as_raw() || left_ref.value() >= value {
					return false;
				}
				stack.push(left);
			}

			let right = node_ref.right(eg);
			// SAFETY: epoch-protected (see locate).
			if let Some(right_ref) = unsafe { right.as_ref() } {
				if right_ref.parent(eg).as_raw() != node.as_raw() || right_ref.value() <= value {
					return false;
				}
				stack.push(right);
			}
		}
		true
	}

	/// Verifies exact cached heights and the AVL balance bound everywhere.
	///
	/// Only meaningful right after a rebalance pass; between passes heights
	/// are stale by design and this returns `false` for any non-leaf shape
	/// that has drifted.
	fn is_height_balanced(&self, eg: &Guard) -> bool {
		fn check(node: Shared<'_, Node>, eg: &Guard) -> Option<usize> {
			// SAFETY: epoch-protected (see locate).
			let Some(node_ref) = (unsafe { node.as_ref() }) else {
				return Some(0);
			};
			let left = check(node_ref.left(eg), eg)?;
			let right = check(node_ref.right(eg), eg)?;
			if left.abs_diff(right) > 1 {
				return None;
			}
			let height = 1 + left.max(right);
			if node_ref.height() != height {
				return None;
			}
			Some(height)
		}
		check(self.root(eg), eg).is_some()
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		// The owning handle joins the worker before releasing its Arc, so
		// by the time the last Arc drops nothing else can reach the tree
		// and an unprotected guard is sound.
		let eg = unsafe { epoch::unprotected() };
		let mut stack = vec![self.sentinel.right(eg)];
		while let Some(node) = stack.pop() {
			if node.is_null() {
				continue;
			}
			// SAFETY: exclusive access during drop; both children are read
			// before the node itself is freed.
			unsafe {
				stack.push(node.deref().left(eg));
				stack.push(node.deref().right(eg));
				drop(node.into_owned());
			}
		}
	}
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A concurrent ordered set of `i64` values.
///
/// Lookups are lock-free; inserts and removes lock only the nodes around
/// the edit; a background thread restores AVL balance once enough mutations
/// have accumulated. See the crate docs for the full protocol.
///
/// `i64::MIN` is reserved as the sentinel value and cannot be stored; all
/// operations report it absent.
pub struct AvlSet {
	inner: Arc<Inner>,
	worker: Mutex<Option<maintenance::Worker>>,
}

impl AvlSet {
	/// Creates an empty set with the default rebalance threshold (500
	/// committed mutations) and spawns its maintenance worker.
	///
	/// # Example
	///
	/// ```
	/// use alderset::AvlSet;
	///
	/// let set = AvlSet::new();
	/// assert!(set.is_empty());
	/// ```
	pub fn new() -> AvlSet {
		Self::with_rebalance_threshold(DEFAULT_REBALANCE_THRESHOLD)
	}

	/// Creates an empty set that requests a background rebalance pass after
	/// `threshold` committed mutations.
	///
	/// A threshold of zero behaves as one. Lower thresholds keep the tree
	/// closer to AVL shape at the cost of more frequent exclusive passes.
	///
	/// # Example
	///
	/// ```
	/// use alderset::AvlSet;
	///
	/// let set = AvlSet::with_rebalance_threshold(100);
	/// for i in 0..50 {
	/// 	set.insert(i);
	/// }
	/// assert_eq!(set.len(), 50);
	/// ```
	pub fn with_rebalance_threshold(threshold: usize) -> AvlSet {
		let inner = Arc::new(Inner::new(threshold));
		let worker = maintenance::spawn(Arc::clone(&inner));
		AvlSet {
			inner,
			worker: Mutex::new(Some(worker)),
		}
	}

	/// Adds a value to the set.
	///
	/// Returns `true` if the value was not already present. `i64::MIN` is
	/// reserved and is always rejected.
	///
	/// # Example
	///
	/// ```
	/// use alderset::AvlSet;
	///
	/// let set = AvlSet::new();
	///
	/// assert!(set.insert(7));
	/// assert!(!set.insert(7)); // Already present
	/// ```
	pub fn insert(&self, value: i64) -> bool {
		if value == i64::MIN {
			return false;
		}
		let eg = &epoch::pin();
		self.inner.insert(value, eg)
	}

	/// Removes a value from the set.
	///
	/// Returns `true` if the value was present.
	///
	/// # Example
	///
	/// ```
	/// use alderset::AvlSet;
	///
	/// let set = AvlSet::new();
	/// set.insert(7);
	///
	/// assert!(set.remove(7));
	/// assert!(!set.remove(7)); // Already gone
	/// ```
	pub fn remove(&self, value: i64) -> bool {
		if value == i64::MIN {
			return false;
		}
		let eg = &epoch::pin();
		self.inner.remove(value, eg)
	}

	/// Returns `true` if the set contains the value.
	///
	/// Never blocks behind a rebalance pass; see the crate docs for how
	/// in-flight rotations are detected instead.
	///
	/// # Example
	///
	/// ```
	/// use alderset::AvlSet;
	///
	/// let set = AvlSet::new();
	/// set.insert(7);
	///
	/// assert!(set.contains(7));
	/// assert!(!set.contains(8));
	/// ```
	pub fn contains(&self, value: i64) -> bool {
		if value == i64::MIN {
			return false;
		}
		let eg = &epoch::pin();
		self.inner.contains(value, eg)
	}

	/// Removes all values from the set.
	///
	/// Concurrent updates drain first (the detach holds the gate
	/// exclusively); detached nodes are reclaimed once every thread that
	/// could still see them has moved on. Callers that need a precise
	/// before/after boundary relative to concurrent mutators must serialize
	/// externally.
	///
	/// # Example
	///
	/// ```
	/// use alderset::AvlSet;
	///
	/// let set = AvlSet::new();
	/// set.insert(1);
	/// set.insert(2);
	///
	/// set.clear();
	/// assert!(set.is_empty());
	/// ```
	pub fn clear(&self) {
		self.inner.clear();
	}

	/// Returns the number of values in the set by full traversal.
	///
	/// O(n); intended as a quiescent diagnostic, not an operation counter.
	/// Concurrent mutations make the result a snapshot of no particular
	/// instant.
	///
	/// # Example
	///
	/// ```
	/// use alderset::AvlSet;
	///
	/// let set = AvlSet::new();
	/// set.insert(1);
	/// set.insert(2);
	///
	/// assert_eq!(set.len(), 2);
	/// ```
	pub fn len(&self) -> usize {
		let eg = &epoch::pin();
		self.inner.len(eg)
	}

	/// Returns `true` if the set holds no values. O(1).
	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}

	/// Runs one rebalance pass synchronously on the calling thread.
	///
	/// Blocks until in-flight updates drain, then restores exact heights
	/// and the AVL balance bound everywhere, exactly as the background
	/// worker would. Also disarms any pending background request.
	///
	/// # Example
	///
	/// ```
	/// use alderset::AvlSet;
	///
	/// let set = AvlSet::new();
	/// for i in 0..32 {
	/// 	set.insert(i); // Ascending: degenerates into a chain
	/// }
	///
	/// set.rebalance();
	/// assert!(set.is_height_balanced());
	/// ```
	pub fn rebalance(&self) {
		self.inner.run_rebalance_pass();
		self.inner.clear_rebalance_request();
	}

	/// Stops the maintenance worker and waits for it to exit.
	///
	/// Idempotent; also runs on drop. The set remains usable afterwards,
	/// but nothing triggers background passes any more, so a long-lived set
	/// kept open after `close` should call [`AvlSet::rebalance`] itself.
	pub fn close(&self) {
		self.inner.signal_shutdown();
		let worker = self.worker.lock().take();
		if let Some(worker) = worker {
			worker.join();
		}
	}

	/// Returns every value in ascending order.
	///
	/// Quiescent diagnostic: concurrent mutations may or may not appear.
	///
	/// # Example
	///
	/// ```
	/// use alderset::AvlSet;
	///
	/// let set = AvlSet::new();
	/// for value in [3, 1, 2] {
	/// 	set.insert(value);
	/// }
	///
	/// assert_eq!(set.in_order_values(), vec![1, 2, 3]);
	/// ```
	pub fn in_order_values(&self) -> Vec<i64> {
		let eg = &epoch::pin();
		self.inner.in_order_values(eg)
	}

	/// Walks the whole tree checking parent back edges and search order.
	///
	/// Returns `false` on the first inconsistency. Quiescent diagnostic.
	pub fn check_integrity(&self) -> bool {
		let eg = &epoch::pin();
		self.inner.check_integrity(eg)
	}

	/// Returns `true` if every cached height is exact and every node's
	/// balance factor is within the AVL bound.
	///
	/// Heights drift between rebalance passes by design, so this is only
	/// expected to hold right after [`AvlSet::rebalance`] or an observed
	/// background pass. Quiescent diagnostic.
	pub fn is_height_balanced(&self) -> bool {
		let eg = &epoch::pin();
		self.inner.is_height_balanced(eg)
	}
}

impl Default for AvlSet {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for AvlSet {
	fn drop(&mut self) {
		self.close();
	}
}

/// Invariant validation for testing. Panics with diagnostic info if any
/// structural invariant is violated.
#[cfg(any(test, feature = "test-utils"))]
impl AvlSet {
	/// Validates the search-order and linkage invariants:
	///
	/// 1. Sentinel shape: no left child, value `i64::MIN`
	/// 2. Search order: every value lies strictly inside the open interval
	///    its position implies
	/// 3. Parent consistency: every child points back at its parent
	///
	/// Heights are deliberately not checked here - they are stale by design
	/// between rebalance passes. Use [`AvlSet::is_height_balanced`] after a
	/// pass for the height invariants.
	pub fn assert_invariants(&self) {
		let eg = &epoch::pin();
		let inner = &self.inner;

		assert!(
			inner.sentinel.left(eg).is_null(),
			"sentinel must never have a left child"
		);
		assert_eq!(
			inner.sentinel.value(),
			i64::MIN,
			"sentinel value must stay i64::MIN"
		);

		// (node, expected parent, exclusive lower bound, exclusive upper bound)
		type Frame<'g> = (Shared<'g, Node>, Shared<'g, Node>, Option<i64>, Option<i64>);
		let mut stack: Vec<Frame<'_>> = vec![(inner.root(eg), inner.sentinel_ptr(eg), None, None)];

		while let Some((node, parent, low, high)) = stack.pop() {
			// SAFETY: epoch-protected (see locate).
			let Some(node_ref) = (unsafe { node.as_ref() }) else {
				continue;
			};
			let value = node_ref.value();

			assert_ne!(value, i64::MIN, "sentinel value stored in a real node");
			if let Some(low) = low {
				assert!(value > low, "value {value} at or below ancestor bound {low}");
			}
			if let Some(high) = high {
				assert!(value < high, "value {value} at or above ancestor bound {high}");
			}
			assert_eq!(
				node_ref.parent(eg).as_raw(),
				parent.as_raw(),
				"node {value} does not point back at its parent"
			);

			stack.push((node_ref.left(eg), node, low, Some(value)));
			stack.push((node_ref.right(eg), node, Some(value), high));
		}
	}
}
