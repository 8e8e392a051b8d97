//! Whole-tree AVL restructuring.
//!
//! Everything here runs while the balance gate is held exclusively, so no
//! point mutation holds any node lock concurrently. Lookups do run
//! concurrently - they take no gate - and are warned off a window that is
//! mid-rotation through the per-node `balancing` flags, which are raised on
//! a node and its parent around every rotation.
//!
//! A sweep is a post-order walk: each node's subtrees are settled first,
//! its height is recomputed from its children, and one rotation (single or
//! double, picked by the classic balance-factor table) is applied if the
//! node leaves the AVL bound. A single rotation can push residual imbalance
//! into the demoted child, so one sweep over a badly skewed tree does not
//! restore the bound everywhere; the caller repeats sweeps until one
//! completes without rotating. At that fixpoint every node satisfies
//! `|height(left) - height(right)| <= 1` and every cached height equals
//! `1 + max(child heights)`.
//!
//! ```text
//! Right rotation around `a`        Left rotation around `a`
//!
//!         a                                a
//!       /                                    \
//!     b        ->      b                       b      ->      b
//!   /                /   \                       \          /   \
//! c                 c     a                        c       a     c
//! ```

use crossbeam_epoch::{Guard, Shared};

use crate::Node;

/// Height of a possibly-empty subtree, from its root's cached height.
#[inline]
fn height(node: Shared<'_, Node>) -> usize {
	// SAFETY: the exclusive gate keeps every node linked below the sentinel
	// alive and unaliased by mutators for the whole pass.
	match unsafe { node.as_ref() } {
		Some(node_ref) => node_ref.height(),
		None => 0,
	}
}

#[inline]
fn balance_factor(node: &Node, eg: &Guard) -> isize {
	height(node.left(eg)) as isize - height(node.right(eg)) as isize
}

#[inline]
fn max_height(node: &Node, eg: &Guard) -> usize {
	height(node.left(eg)).max(height(node.right(eg)))
}

/// Single right rotation around `a`; returns the new subtree root.
fn rotate_right<'g>(a: Shared<'g, Node>, eg: &'g Guard) -> Shared<'g, Node> {
	// SAFETY: callers only rotate right when the left child exists, and the
	// exclusive gate pins the subtree for the duration.
	let a_ref = unsafe { a.deref() };
	let b = a_ref.left(eg);
	let b_ref = unsafe { b.deref() };
	let b_right = b_ref.right(eg);

	a_ref.set_left(b_right);
	// SAFETY: epoch-protected when non-null.
	if let Some(b_right_ref) = unsafe { b_right.as_ref() } {
		b_right_ref.set_parent(a);
	}

	b_ref.set_right(a);
	a_ref.set_parent(b);

	// Fix up the two involved heights after the links have moved.
	a_ref.set_height(max_height(a_ref, eg) + 1);
	b_ref.set_height(max_height(b_ref, eg) + 1);

	b
}

/// Single left rotation around `a`; returns the new subtree root.
fn rotate_left<'g>(a: Shared<'g, Node>, eg: &'g Guard) -> Shared<'g, Node> {
	// SAFETY: callers only rotate left when the right child exists, and the
	// exclusive gate pins the subtree for the duration.
	let a_ref = unsafe { a.deref() };
	let b = a_ref.right(eg);
	let b_ref = unsafe { b.deref() };
	let b_left = b_ref.left(eg);

	a_ref.set_right(b_left);
	// SAFETY: epoch-protected when non-null.
	if let Some(b_left_ref) = unsafe { b_left.as_ref() } {
		b_left_ref.set_parent(a);
	}

	b_ref.set_left(a);
	a_ref.set_parent(b);

	a_ref.set_height(max_height(a_ref, eg) + 1);
	b_ref.set_height(max_height(b_ref, eg) + 1);

	b
}

/// Left rotation around the left child, then right rotation around `a`
/// (the left-right case).
fn rotate_left_right<'g>(a: Shared<'g, Node>, eg: &'g Guard) -> Shared<'g, Node> {
	// SAFETY: only reached when the left child exists.
	let a_ref = unsafe { a.deref() };
	let new_left = rotate_left(a_ref.left(eg), eg);
	a_ref.set_left(new_left);
	// SAFETY: rotation results are real nodes.
	unsafe { new_left.deref() }.set_parent(a);

	rotate_right(a, eg)
}

/// Right rotation around the right child, then left rotation around `a`
/// (the right-left case).
fn rotate_right_left<'g>(a: Shared<'g, Node>, eg: &'g Guard) -> Shared<'g, Node> {
	// SAFETY: only reached when the right child exists.
	let a_ref = unsafe { a.deref() };
	let new_right = rotate_right(a_ref.right(eg), eg);
	a_ref.set_right(new_right);
	// SAFETY: rotation results are real nodes.
	unsafe { new_right.deref() }.set_parent(a);

	rotate_left(a, eg)
}

/// One post-order sweep over the subtree rooted at `node`.
///
/// Settles both subtrees, recomputes the node's height, and applies at most
/// one rotation chosen by the balance-factor table, raising the `balancing`
/// flags on the node and its parent around it. Sets `rotated` whenever a
/// rotation was performed so the caller knows another sweep is needed.
///
/// Returns the (possibly new) subtree root with its parent link already
/// pointing at `parent`; the caller stores it into the matching child slot.
pub(crate) fn rebalance_subtree<'g>(
	parent: Shared<'g, Node>,
	node: Shared<'g, Node>,
	rotated: &mut bool,
	eg: &'g Guard,
) -> Shared<'g, Node> {
	// SAFETY: exclusive gate, see module docs.
	let Some(node_ref) = (unsafe { node.as_ref() }) else {
		return node;
	};

	let new_left = rebalance_subtree(node, node_ref.left(eg), rotated, eg);
	node_ref.set_left(new_left);
	let new_right = rebalance_subtree(node, node_ref.right(eg), rotated, eg);
	node_ref.set_right(new_right);

	node_ref.set_height(max_height(node_ref, eg) + 1);
	let bf = balance_factor(node_ref, eg);

	// SAFETY: parent is at least the sentinel.
	let parent_ref = unsafe { parent.deref() };
	parent_ref.set_balancing(true);
	node_ref.set_balancing(true);

	let new_root = if bf > 1 {
		// SAFETY: bf > 1 means height(left) >= 2, so the left child exists
		// (children were settled above, their heights are exact).
		let left_ref = unsafe { node_ref.left(eg).deref() };
		Some(if balance_factor(left_ref, eg) >= 0 {
			rotate_right(node, eg)
		} else {
			rotate_left_right(node, eg)
		})
	} else if bf < -1 {
		// SAFETY: bf < -1 means height(right) >= 2, so the right child
		// exists.
		let right_ref = unsafe { node_ref.right(eg).deref() };
		Some(if balance_factor(right_ref, eg) <= 0 {
			rotate_left(node, eg)
		} else {
			rotate_right_left(node, eg)
		})
	} else {
		None
	};

	parent_ref.set_balancing(false);
	node_ref.set_balancing(false);

	// Fix up the parent link if we performed any rotation.
	match new_root {
		Some(new_root) => {
			*rotated = true;
			// SAFETY: rotation results are real nodes.
			unsafe { new_root.deref() }.set_parent(parent);
			new_root
		}
		None => node,
	}
}
