//! C4: Directory Watcher.
//!
//! Filesystem-event ingestion, debounced into coalesced sync requests, plus
//! the "deleted-by-remote-request" ring that prevents a peer-requested
//! delete from echoing back into this replica's own deleted list.

use crate::error::WatcherError;
use crate::handle::EntryKind;
use crate::logging::*;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Debounce window from the last filesystem event to the first dispatch,
/// per spec.md §4.6 (`PAUSE_BEFORE_SYNCING`).
pub const PAUSE_BEFORE_SYNCING: Duration = Duration::from_secs(10);

/// Cap on the "deleted-by-remote-request" ring, per spec.md §5.
pub const DELETED_RING_CAP: usize = 1000;

/// A classified filesystem change, relative to the cloud root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DwEvent {
	Create { relative_path: String, kind: EntryKind },
	Change { relative_path: String },
	Delete { relative_path: String },
	Rename { old_relative_path: String, new_relative_path: String },
}

/// Bounded FIFO of handles this replica deleted on the peer's behalf. A
/// matching local delete event within the ring's lifetime is an echo, not a
/// new user-initiated deletion, and must not be appended to the PDIL.
#[derive(Default)]
pub struct DeletedByRemoteRing {
	entries: Mutex<VecDeque<String>>,
}

impl DeletedByRemoteRing {
	pub fn new() -> Self {
		DeletedByRemoteRing { entries: Mutex::new(VecDeque::new()) }
	}

	pub fn mark(&self, relative_path: &str) {
		let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
		guard.push_back(relative_path.to_string());
		while guard.len() > DELETED_RING_CAP {
			guard.pop_front();
		}
	}

	/// Returns true and consumes the entry if `relative_path` was marked by
	/// a prior remote-requested delete (suppress the echo).
	pub fn consume_if_present(&self, relative_path: &str) -> bool {
		let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(pos) = guard.iter().position(|p| p == relative_path) {
			guard.remove(pos);
			true
		} else {
			false
		}
	}
}

fn relative_path_of<'a>(cloud_root: &Path, absolute: &'a Path) -> Option<String> {
	absolute.strip_prefix(cloud_root).ok().map(|p| p.to_string_lossy().replace('\\', "/"))
}

fn classify(cloud_root: &Path, event: Event) -> Vec<DwEvent> {
	match event.kind {
		EventKind::Create(_) => event
			.paths
			.into_iter()
			.filter_map(|p| {
				let relative_path = relative_path_of(cloud_root, &p)?;
				let kind = if p.is_dir() { EntryKind::Dir } else { EntryKind::File };
				Some(DwEvent::Create { relative_path, kind })
			})
			.collect(),
		EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
			let old_relative_path = relative_path_of(cloud_root, &event.paths[0]);
			let new_relative_path = relative_path_of(cloud_root, &event.paths[1]);
			match (old_relative_path, new_relative_path) {
				(Some(old_relative_path), Some(new_relative_path)) => {
					vec![DwEvent::Rename { old_relative_path, new_relative_path }]
				}
				_ => Vec::new(),
			}
		}
		EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
			.paths
			.into_iter()
			.filter_map(|p| relative_path_of(cloud_root, &p))
			.map(|relative_path| DwEvent::Delete { relative_path })
			.collect(),
		EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
			.paths
			.into_iter()
			.filter_map(|p| {
				let relative_path = relative_path_of(cloud_root, &p)?;
				let kind = if p.is_dir() { EntryKind::Dir } else { EntryKind::File };
				Some(DwEvent::Create { relative_path, kind })
			})
			.collect(),
		EventKind::Modify(_) => event
			.paths
			.into_iter()
			.filter_map(|p| relative_path_of(cloud_root, &p))
			.map(|relative_path| DwEvent::Change { relative_path })
			.collect(),
		EventKind::Remove(_) => event
			.paths
			.into_iter()
			.filter_map(|p| relative_path_of(cloud_root, &p))
			.map(|relative_path| DwEvent::Delete { relative_path })
			.collect(),
		_ => Vec::new(),
	}
}

/// Watches `cloud_root` and forwards classified events on `events_tx`,
/// debouncing consecutive activity into `sync_requested` pulses.
pub struct DirectoryWatcher {
	_inner: RecommendedWatcher,
	pub ring: Arc<DeletedByRemoteRing>,
}

impl DirectoryWatcher {
	/// Start watching. `events_tx` receives every classified event
	/// immediately (the caller applies ICM/PDIL mutation); `sync_requested_tx`
	/// receives one pulse per debounce window, `PAUSE_BEFORE_SYNCING` after
	/// the last event.
	pub fn start(
		cloud_root: PathBuf,
		events_tx: mpsc::UnboundedSender<DwEvent>,
		sync_requested_tx: mpsc::UnboundedSender<()>,
	) -> Result<Self, WatcherError> {
		let ring = Arc::new(DeletedByRemoteRing::new());
		let root_for_classify = cloud_root.clone();
		let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();

		let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
			Ok(event) => {
				let _ = raw_tx.send(event);
			}
			Err(e) => warn!("watcher backend error: {}", e),
		})
		.map_err(|e| WatcherError::BackendFailed { message: e.to_string() })?;

		watcher
			.watch(&cloud_root, RecursiveMode::Recursive)
			.map_err(|e| WatcherError::BackendFailed { message: e.to_string() })?;

		tokio::spawn(async move {
			let mut last_activity: Option<tokio::time::Instant> = None;
			loop {
				tokio::select! {
					event = raw_rx.recv() => {
						let Some(event) = event else { break };
						for dw_event in classify(&root_for_classify, event) {
							let _ = events_tx.send(dw_event);
						}
						last_activity = Some(tokio::time::Instant::now());
					}
					_ = tokio::time::sleep(Duration::from_millis(250)), if last_activity.is_some() => {
						if let Some(last) = last_activity {
							if last.elapsed() >= PAUSE_BEFORE_SYNCING {
								let _ = sync_requested_tx.send(());
								last_activity = None;
							}
						}
					}
				}
			}
		});

		Ok(DirectoryWatcher { _inner: watcher, ring })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ring_suppresses_echo_once() {
		let ring = DeletedByRemoteRing::new();
		ring.mark("docs/a.txt");
		assert!(ring.consume_if_present("docs/a.txt"));
		assert!(!ring.consume_if_present("docs/a.txt"));
	}

	#[test]
	fn ring_is_bounded() {
		let ring = DeletedByRemoteRing::new();
		for i in 0..(DELETED_RING_CAP + 50) {
			ring.mark(&format!("f{}", i));
		}
		assert!(!ring.consume_if_present("f0"));
		assert!(ring.consume_if_present(&format!("f{}", DELETED_RING_CAP + 49)));
	}

	#[test]
	fn relative_path_strips_root() {
		let root = Path::new("/cloud");
		let abs = Path::new("/cloud/docs/a.txt");
		assert_eq!(relative_path_of(root, abs), Some("docs/a.txt".to_string()));
	}

	#[test]
	fn paired_rename_event_classifies_as_rename() {
		let root = Path::new("/cloud");
		let event = Event {
			kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
			paths: vec![root.join("docs/old.txt"), root.join("docs/new.txt")],
			attrs: Default::default(),
		};
		let events = classify(root, event);
		assert_eq!(
			events,
			vec![DwEvent::Rename { old_relative_path: "docs/old.txt".to_string(), new_relative_path: "docs/new.txt".to_string() }]
		);
	}

	#[test]
	fn unpaired_rename_from_classifies_as_delete() {
		let root = Path::new("/cloud");
		let event = Event {
			kind: EventKind::Modify(ModifyKind::Name(RenameMode::From)),
			paths: vec![root.join("docs/old.txt")],
			attrs: Default::default(),
		};
		let events = classify(root, event);
		assert_eq!(events, vec![DwEvent::Delete { relative_path: "docs/old.txt".to_string() }]);
	}
}

// vim: ts=4
