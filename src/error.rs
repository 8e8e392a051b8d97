//! # Error Types for the Concurrent AVL Set
//!
//! This module defines error types used internally by the set for handling
//! validation failures in its lock-coupled update protocol.
//!
//! ## Error Handling Strategy
//!
//! Descents through the tree hold no locks, so the location they produce may
//! be stale by the time an operation locks it. Operations therefore lock the
//! nodes they intend to edit, repeat the descent, and compare what they find
//! against what they locked. When the comparison fails, operations don't
//! panic - they return errors that signal the caller to retry.
//!
//! ## Error Flow
//!
//! ```text
//! Operation starts
//!      │
//!      ▼
//! Lock-free descent to a window
//!      │
//!      ▼
//! Lock the window's nodes
//!      │
//!      ▼
//! Re-descend and compare ──────► Err(Stale) ────────► Retry operation
//!      │
//!      ▼ (same window)
//! Validate the gate stamp ─────► Err(Invalidated) ──► Retry operation
//!      │
//!      ▼ (Ok)
//! Publish the edit
//!      │
//!      ▼
//! Return success
//! ```
//!
//! ## Common Patterns
//!
//! Update operations follow this pattern:
//!
//! ```ignore
//! loop {
//!     let perform = || {
//!         let window = self.locate(value, eg);     // Lock-free, may be stale
//!         let _locks = lock_window(&window);
//!         self.revalidate(&window, eg)?;           // May return Stale
//!         gate_guard.recheck()?;                   // May return Invalidated
//!         Ok(self.publish(&window, eg))
//!     };
//!
//!     match perform() {
//!         Ok(result) => return result,
//!         Err(Error::Stale) => continue,           // Retry
//!         Err(Error::Invalidated) => continue,     // Retry
//!     }
//! }
//! ```

use thiserror::Error;

/// Errors that can occur during set operations.
///
/// These errors are used for internal flow control in the lock-coupled
/// update protocol. They always cause operations to retry rather than
/// fail permanently, and are never surfaced through the public API.
#[derive(Error, Debug)]
pub enum Error {
	/// The locked window no longer matches the tree.
	///
	/// This error occurs when:
	/// - A concurrent insert filled the slot this operation targeted
	/// - A concurrent remove spliced out one of the locked nodes
	/// - A rebalance rotation moved the child under a different parent
	///
	/// # Response
	///
	/// Release all node locks (by dropping their guards), discard the
	/// window, and run a fresh descent. The retry observes the current
	/// shape of the tree and either succeeds or concludes the operation
	/// is a no-op (value already present / already absent).
	#[error("descent window no longer matches the tree")]
	Stale,

	/// The balance gate stamp failed validation.
	///
	/// A rebalance pass acquired the gate exclusively after this
	/// operation recorded its stamp, so heights and subtree roots may
	/// have moved wholesale. The window cannot be trusted even if the
	/// locked nodes still compare equal.
	///
	/// # Difference from Stale
	///
	/// - `Stale`: "This particular location changed, look again"
	/// - `Invalidated`: "The whole tree may have been restructured"
	#[error("balance gate stamp failed validation")]
	Invalidated,
}

/// A Result type alias using our custom Error type.
///
/// Used throughout the crate for operations that can fail validation and
/// need to unwind to a retry point.
pub type Result<T> = std::result::Result<T, Error>;
