//! Background maintenance worker.
//!
//! One worker thread per set polls the shared state roughly every
//! millisecond. When the mutation counter has crossed the threshold the
//! point operations arm a request flag; the worker observes the flag, runs
//! a whole-tree rebalance pass under the exclusive gate, then disarms the
//! flag. An armed flag on an empty tree is left armed: there is nothing to
//! rebalance until a mutation puts nodes back, and that mutation re-arms
//! nothing the flag does not already say.
//!
//! Shutdown is cooperative. [`Worker::join`] sends a shutdown command to
//! wake the worker out of its poll and then joins the thread; the worker
//! also exits if the channel disconnects or the shared shutdown flag is
//! raised, so dropping the set never leaves the thread behind.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::Inner;

/// How long the worker parks between looks at the request flag.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

enum Command {
	Shutdown,
}

/// Handle to a running maintenance thread.
pub(crate) struct Worker {
	tx: mpsc::Sender<Command>,
	handle: thread::JoinHandle<()>,
}

impl Worker {
	/// Wakes the worker and blocks until it has exited.
	pub(crate) fn join(self) {
		// Send fails only when the worker already exited; either way the
		// join below observes a finished thread.
		let _ = self.tx.send(Command::Shutdown);
		let _ = self.handle.join();
	}
}

/// Spawns the maintenance thread for `inner`.
pub(crate) fn spawn(inner: Arc<Inner>) -> Worker {
	let (tx, rx) = mpsc::channel();
	let handle = thread::spawn(move || run(inner, rx));
	Worker { tx, handle }
}

fn run(inner: Arc<Inner>, rx: mpsc::Receiver<Command>) {
	loop {
		match rx.recv_timeout(POLL_INTERVAL) {
			Ok(Command::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
			Err(mpsc::RecvTimeoutError::Timeout) => {}
		}

		if inner.shutting_down() {
			break;
		}
		if !inner.rebalance_requested() {
			continue;
		}
		if inner.is_empty() {
			// Leave the request armed for whenever values come back.
			continue;
		}

		inner.run_rebalance_pass();
		inner.clear_rebalance_request();
	}
}
