//! Coordination between point operations and whole-tree rebalancing.
//!
//! The [`BalanceGate`] is a read/write lock paired with a version counter,
//! the versioning half of a hybrid latch. Insert, remove and the value swap
//! inside a two-child removal hold the gate in shared mode, so any number of
//! them run concurrently, each relying on per-node locks for mutual
//! exclusion at the edit site. A rebalance pass holds the gate exclusively,
//! which drains and blocks every gated operation for the duration of the
//! pass and lets the pass edit heights and subtree roots without taking any
//! node locks.
//!
//! The version counter is incremented when exclusive access is acquired and
//! again when it is released, so the version is odd exactly while a pass is
//! running. A shared guard records the version at entry; [`SharedGuard::recheck`]
//! fails with [`error::Error::Invalidated`] if the version has moved, which
//! tells the caller its descent may have watched a rotation in progress and
//! must be retried. Insert validates its stamp before publishing a new node.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error;

/// A versioned read/write gate arbitrating local edits against global
/// restructuring.
pub struct BalanceGate {
	version: AtomicUsize,
	lock: RwLock<()>,
}

impl BalanceGate {
	/// Creates a new unlocked gate at version zero.
	#[inline]
	pub fn new() -> BalanceGate {
		BalanceGate {
			version: AtomicUsize::new(0),
			lock: RwLock::new(()),
		}
	}

	/// Acquires the gate in shared mode, blocking while a rebalance pass
	/// holds it exclusively.
	///
	/// Returns an RAII guard carrying the version stamp observed at entry.
	#[inline]
	pub fn shared(&self) -> SharedGuard<'_> {
		let guard = self.lock.read();
		let version = self.version.load(Ordering::Relaxed);
		SharedGuard {
			gate: self,
			guard,
			version,
		}
	}

	/// Acquires the gate exclusively, blocking until all shared holders
	/// have drained.
	///
	/// Bumps the version to odd for the duration of the hold; the matching
	/// even bump happens when the returned guard drops.
	#[inline]
	pub fn exclusive(&self) -> ExclusiveGuard<'_> {
		let guard = self.lock.write();
		let version = self.version.load(Ordering::Relaxed) + 1;
		self.version.store(version, Ordering::Release);
		ExclusiveGuard {
			gate: self,
			guard,
			version,
		}
	}
}

impl Default for BalanceGate {
	fn default() -> Self {
		Self::new()
	}
}

/// RAII structure holding the gate in shared mode.
pub struct SharedGuard<'a> {
	gate: &'a BalanceGate,
	#[allow(dead_code)]
	guard: RwLockReadGuard<'a, ()>,
	version: usize,
}

impl<'a> SharedGuard<'a> {
	/// Validates the stamp recorded when this guard was acquired.
	///
	/// While the shared hold is in place no exclusive acquisition can
	/// complete, so for a correctly sequenced operation this is a sanity
	/// check; it is still performed before publishing an insert so that a
	/// protocol regression surfaces as a retry instead of a lost update.
	///
	/// If validation fails it returns [`error::Error::Invalidated`].
	#[inline]
	pub fn recheck(&self) -> error::Result<()> {
		if self.version != self.gate.version.load(Ordering::Acquire) {
			return Err(error::Error::Invalidated);
		}
		Ok(())
	}
}

/// RAII structure holding the gate exclusively for a rebalance pass.
pub struct ExclusiveGuard<'a> {
	gate: &'a BalanceGate,
	#[allow(dead_code)]
	guard: RwLockWriteGuard<'a, ()>,
	version: usize,
}

impl<'a> ExclusiveGuard<'a> {
	/// A sanity assertion, exclusive guards do not need to be validated.
	#[inline]
	pub fn recheck(&self) {
		assert!(self.version == self.gate.version.load(Ordering::Relaxed));
	}
}

impl<'a> Drop for ExclusiveGuard<'a> {
	#[inline]
	fn drop(&mut self) {
		let new_version = self.version + 1;
		self.gate.version.store(new_version, Ordering::Release);
	}
}
