//! A reschedulable deadline primitive.
//!
//! Several subsystems need "fire once, `duration` after the last reset":
//! PDIL debounced persistence, the Directory Watcher's quiet-period
//! coalescing, and the Sync Engine's `TimerStartClientSynchronization`. This
//! is the single implementation all of them share instead of four ad hoc
//! `tokio::time::sleep` loops.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

type Callback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A timer that fires `duration` after its most recent `schedule()` call,
/// restarting the wait on every subsequent call (debounce), and that can be
/// cancelled idempotently.
pub struct Deadline {
	handle: Mutex<Option<JoinHandle<()>>>,
	callback: Callback,
}

impl Deadline {
	pub fn new<F, Fut>(callback: F) -> Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		Deadline { handle: Mutex::new(None), callback: Arc::new(move || Box::pin(callback())) }
	}

	/// (Re)schedule the deadline to fire `duration` from now, cancelling any
	/// previously pending fire.
	pub async fn schedule(self: &Arc<Self>, duration: Duration) {
		let mut guard = self.handle.lock().await;
		if let Some(old) = guard.take() {
			old.abort();
		}
		let this = Arc::clone(self);
		*guard = Some(tokio::spawn(async move {
			tokio::time::sleep(duration).await;
			(this.callback)().await;
		}));
	}

	/// Cancel a pending fire. Idempotent: cancelling twice, or cancelling
	/// when nothing is scheduled, is a no-op.
	pub async fn cancel(&self) {
		let mut guard = self.handle.lock().await;
		if let Some(old) = guard.take() {
			old.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[tokio::test]
	async fn fires_once_after_duration() {
		let count = Arc::new(AtomicUsize::new(0));
		let c = Arc::clone(&count);
		let deadline = Arc::new(Deadline::new(move || {
			let c = Arc::clone(&c);
			async move {
				c.fetch_add(1, Ordering::SeqCst);
			}
		}));
		deadline.schedule(Duration::from_millis(20)).await;
		tokio::time::sleep(Duration::from_millis(60)).await;
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn reschedule_debounces() {
		let count = Arc::new(AtomicUsize::new(0));
		let c = Arc::clone(&count);
		let deadline = Arc::new(Deadline::new(move || {
			let c = Arc::clone(&c);
			async move {
				c.fetch_add(1, Ordering::SeqCst);
			}
		}));
		for _ in 0..5 {
			deadline.schedule(Duration::from_millis(30)).await;
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		tokio::time::sleep(Duration::from_millis(80)).await;
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn cancel_prevents_fire() {
		let count = Arc::new(AtomicUsize::new(0));
		let c = Arc::clone(&count);
		let deadline = Arc::new(Deadline::new(move || {
			let c = Arc::clone(&c);
			async move {
				c.fetch_add(1, Ordering::SeqCst);
			}
		}));
		deadline.schedule(Duration::from_millis(20)).await;
		deadline.cancel().await;
		tokio::time::sleep(Duration::from_millis(60)).await;
		assert_eq!(count.load(Ordering::SeqCst), 0);
	}
}

// vim: ts=4
