//! Observation hook for seek descents.

/// Notified once per node visited while descending. Must not influence the seek.
pub trait SeekMonitor: Sync {
	/// An internal node at `depth` holding `key_count` keys was passed through.
	fn internal_node(&self, depth: usize, key_count: usize) {
		let _ = (depth, key_count);
	}

	/// The descent reached its target node at `depth`, holding `key_count` keys.
	fn leaf_node(&self, depth: usize, key_count: usize) {
		let _ = (depth, key_count);
	}
}

/// Monitor that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl SeekMonitor for NoopMonitor {}

/// Shared no-op monitor.
pub static NO_MONITOR: NoopMonitor = NoopMonitor;
