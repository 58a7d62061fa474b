//! C7: Operation Spooler.
//!
//! A bounded-concurrency FIFO queue driving request/send/delete/mkdir
//! operations, with special-directory priority, remote-full backpressure,
//! retry-by-redispatch, and EMA-based ETA.

use crate::handle::Handle;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Operations are retried up to this many consecutive timeouts for the same
/// handle before being abandoned, per spec.md §7's transient-IO retry cap.
pub const ABANDON_AFTER_CONSECUTIVE_FAILURES: u32 = 10;

/// Directory whose traffic is dispatched ahead of bulk content, so PDIL
/// updates propagate before the data they might suppress (spec.md §4.4, §9).
pub const SPECIAL_DIR_PREFIX: &str = ".cloud_cache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
	Request(Handle),
	Send(Handle),
	DeleteFile { handle: Handle, mtime: u32 },
	DeleteDir(Handle),
	Mkdir(String),
}

impl OpKind {
	fn relative_path_hint(&self) -> Option<&str> {
		match self {
			OpKind::Mkdir(path) => Some(path.as_str()),
			_ => None,
		}
	}

	pub fn handle(&self) -> Option<Handle> {
		match self {
			OpKind::Request(h) | OpKind::Send(h) | OpKind::DeleteDir(h) => Some(*h),
			OpKind::DeleteFile { handle, .. } => Some(*handle),
			OpKind::Mkdir(_) => None,
		}
	}

	fn is_outbound_to_peer(&self) -> bool {
		matches!(self, OpKind::Send(_) | OpKind::Mkdir(_))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
	pub kind: OpKind,
	pub peer_id: String,
	pub attempts: u32,
	/// Relative path this operation concerns, when the caller has one handy
	/// at enqueue time. `Mkdir` always carries it in `OpKind` itself; `Send`
	/// needs it passed in explicitly (the handle alone doesn't reveal a
	/// path), which matters for PDIL files under `.cloud_cache` — the only
	/// other operation kind this priority rule needs to see.
	relative_path_hint: Option<String>,
}

impl QueueEntry {
	pub fn new(kind: OpKind, peer_id: impl Into<String>) -> Self {
		let relative_path_hint = kind.relative_path_hint().map(|s| s.to_string());
		QueueEntry { kind, peer_id: peer_id.into(), attempts: 0, relative_path_hint }
	}

	/// Same as `new`, but with an explicit relative-path hint for priority
	/// purposes (used for `Send` ops, where the caller already has the path
	/// on hand from its own content map lookup).
	pub fn with_path_hint(kind: OpKind, peer_id: impl Into<String>, relative_path: impl Into<String>) -> Self {
		QueueEntry { kind, peer_id: peer_id.into(), attempts: 0, relative_path_hint: Some(relative_path.into()) }
	}

	fn is_special(&self) -> bool {
		self.relative_path_hint.as_deref().map(|p| p.starts_with(SPECIAL_DIR_PREFIX)).unwrap_or(false)
	}
}

struct SpoolerState {
	priority_queue: VecDeque<QueueEntry>,
	normal_queue: VecDeque<QueueEntry>,
	remote_full: HashMap<String, bool>,
	consecutive_failures: HashMap<Handle, u32>,
	rate_ema_bytes_per_sec: f64,
}

/// Bounded-concurrency operation queue. One instance per sync engine;
/// operations for all peers share the concurrency bound, matching spec.md
/// §5's "at most MAX_CONCURRENT_OPERATIONS outstanding transfers".
pub struct Spooler {
	state: Mutex<SpoolerState>,
	semaphore: Arc<Semaphore>,
}

impl Spooler {
	pub fn new(max_concurrent_operations: usize) -> Self {
		Spooler {
			state: Mutex::new(SpoolerState {
				priority_queue: VecDeque::new(),
				normal_queue: VecDeque::new(),
				remote_full: HashMap::new(),
				consecutive_failures: HashMap::new(),
				rate_ema_bytes_per_sec: 0.0,
			}),
			semaphore: Arc::new(Semaphore::new(max_concurrent_operations)),
		}
	}

	pub async fn enqueue(&self, entry: QueueEntry) {
		let mut state = self.state.lock().await;
		if entry.is_special() {
			state.priority_queue.push_back(entry);
		} else {
			state.normal_queue.push_back(entry);
		}
	}

	pub async fn set_remote_full(&self, peer_id: &str, full: bool) {
		let mut state = self.state.lock().await;
		state.remote_full.insert(peer_id.to_string(), full);
	}

	/// Acquire a concurrency permit and pop the next eligible entry: special
	/// directory traffic first, then normal FIFO order, skipping `Send`/
	/// `Mkdir` operations toward a peer currently signalling `FullSpace`.
	pub async fn try_dispatch(&self) -> Option<(QueueEntry, OwnedSemaphorePermit)> {
		let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
		let mut state = self.state.lock().await;
		let SpoolerState { priority_queue, normal_queue, remote_full, .. } = &mut *state;
		if let Some(entry) = Self::pop_eligible(priority_queue, remote_full) {
			return Some((entry, permit));
		}
		if let Some(entry) = Self::pop_eligible(normal_queue, remote_full) {
			return Some((entry, permit));
		}
		None
	}

	fn pop_eligible(
		queue: &mut VecDeque<QueueEntry>,
		remote_full: &HashMap<String, bool>,
	) -> Option<QueueEntry> {
		let idx = queue.iter().position(|entry| {
			!(entry.kind.is_outbound_to_peer() && *remote_full.get(&entry.peer_id).unwrap_or(&false))
		})?;
		queue.remove(idx)
	}

	/// Put a failed operation back for the next "execute next" tick,
	/// tracking consecutive failures per handle. Returns `true` if the
	/// operation should be abandoned instead (caller drops it and logs).
	pub async fn requeue_or_abandon(&self, mut entry: QueueEntry) -> bool {
		let mut state = self.state.lock().await;
		if let Some(handle) = entry.kind.handle() {
			let count = state.consecutive_failures.entry(handle).or_insert(0);
			*count += 1;
			if *count >= ABANDON_AFTER_CONSECUTIVE_FAILURES {
				state.consecutive_failures.remove(&handle);
				return true;
			}
		}
		entry.attempts += 1;
		if entry.is_special() {
			state.priority_queue.push_back(entry);
		} else {
			state.normal_queue.push_back(entry);
		}
		false
	}

	/// Clear the failure streak for a handle on success.
	pub async fn record_success(&self, handle: Handle) {
		let mut state = self.state.lock().await;
		state.consecutive_failures.remove(&handle);
	}

	/// Update the bytes/sec exponential moving average after a completed
	/// chunk, alpha chosen for a ~10-sample half-life.
	pub async fn record_chunk_completed(&self, bytes: u64, elapsed: Duration) {
		if elapsed.is_zero() {
			return;
		}
		let instantaneous = bytes as f64 / elapsed.as_secs_f64();
		let alpha = 0.2;
		let mut state = self.state.lock().await;
		state.rate_ema_bytes_per_sec = if state.rate_ema_bytes_per_sec == 0.0 {
			instantaneous
		} else {
			alpha * instantaneous + (1.0 - alpha) * state.rate_ema_bytes_per_sec
		};
	}

	pub async fn eta(&self, pending_bytes: u64) -> Duration {
		let state = self.state.lock().await;
		if state.rate_ema_bytes_per_sec <= 0.0 {
			return Duration::MAX;
		}
		Duration::from_secs_f64(pending_bytes as f64 / state.rate_ema_bytes_per_sec)
	}

	pub async fn len(&self) -> usize {
		let state = self.state.lock().await;
		state.priority_queue.len() + state.normal_queue.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}
}

/// State machine of one `Send` operation, documented per spec.md §4.4.
/// `Spooler` itself only needs the terminal outcome (success vs. requeue);
/// callers driving a single op through CTE track these states explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpState {
	Queued,
	Dispatching,
	Chunk(u32),
	AwaitingAck,
	Completed,
	Failed,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::handle::EntryKind;

	fn h(name: &str) -> Handle {
		Handle::derive(name, EntryKind::File)
	}

	#[tokio::test]
	async fn special_directory_dispatches_before_bulk() {
		let spooler = Spooler::new(4);
		spooler.enqueue(QueueEntry::new(OpKind::Send(h("bulk.bin")), "peer1")).await;
		spooler.enqueue(QueueEntry::new(OpKind::Mkdir(".cloud_cache".into()), "peer1")).await;

		let (entry, _permit) = spooler.try_dispatch().await.unwrap();
		assert_eq!(entry.kind, OpKind::Mkdir(".cloud_cache".into()));
	}

	#[tokio::test]
	async fn concurrency_is_bounded() {
		let spooler = Spooler::new(1);
		spooler.enqueue(QueueEntry::new(OpKind::Send(h("a")), "peer1")).await;
		spooler.enqueue(QueueEntry::new(OpKind::Send(h("b")), "peer1")).await;

		let first = spooler.try_dispatch().await;
		assert!(first.is_some());
		let second = spooler.try_dispatch().await;
		assert!(second.is_none());

		drop(first);
		let third = spooler.try_dispatch().await;
		assert!(third.is_some());
	}

	#[tokio::test]
	async fn full_space_suspends_send_and_mkdir_only() {
		let spooler = Spooler::new(4);
		spooler.set_remote_full("peer1", true).await;
		spooler.enqueue(QueueEntry::new(OpKind::Send(h("a")), "peer1")).await;
		spooler.enqueue(QueueEntry::new(OpKind::Request(h("b")), "peer1")).await;

		let (entry, _permit) = spooler.try_dispatch().await.unwrap();
		assert_eq!(entry.kind, OpKind::Request(h("b")));
		assert!(spooler.try_dispatch().await.is_none());

		spooler.set_remote_full("peer1", false).await;
		let (entry, _permit) = spooler.try_dispatch().await.unwrap();
		assert_eq!(entry.kind, OpKind::Send(h("a")));
	}

	#[tokio::test]
	async fn repeated_failure_triggers_abandonment() {
		let spooler = Spooler::new(4);
		let mut entry = QueueEntry::new(OpKind::Send(h("flaky")), "peer1");
		let mut abandoned = false;
		for _ in 0..ABANDON_AFTER_CONSECUTIVE_FAILURES {
			abandoned = spooler.requeue_or_abandon(entry.clone()).await;
			entry.attempts += 1;
		}
		assert!(abandoned);
	}

	#[tokio::test]
	async fn eta_uses_moving_average_rate() {
		let spooler = Spooler::new(4);
		spooler.record_chunk_completed(1_000_000, Duration::from_secs(1)).await;
		let eta = spooler.eta(1_000_000).await;
		assert!(eta <= Duration::from_secs(2));
	}
}

// vim: ts=4
