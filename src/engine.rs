//! C9: Sync Engine — the top-level orchestrator binding the content map,
//! deleted list, watcher, spooler, session manager, and chunk transfer
//! engine to an external [`Transport`].

use crate::chunk::{has_room, ChunkReceiver, ChunkSender, MIN_RESERVE_BYTES};
use crate::config::{Config, Role};
use crate::content_map::{Entry, IndexedContentMap};
use crate::deadline::Deadline;
use crate::deleted_list::{FileId, PersistentDeletedList};
use crate::error::SyncError;
use crate::handle::{mtime_to_u32, EntryKind, Handle};
use crate::logging::*;
use crate::protocol::diff::{diff_structures, DiffOp};
use crate::protocol::{code, Command, Notice};
use crate::session::{SecretStore, SessionManager};
use crate::spooler::{OpKind, QueueEntry, Spooler};
use crate::transport::{CommandSink, Frames, Transport};
use crate::watcher::{DeletedByRemoteRing, DirectoryWatcher, DwEvent};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// If `relative_path` is `.cloud_cache/<id>.Deleted` for some `id` other
/// than `own_user_id`, returns that id — the PDIL-reload trigger from
/// spec.md §4.6.
fn foreign_pdil_user_id(relative_path: &str, own_user_id: &str) -> Option<String> {
	let name = relative_path.strip_prefix(".cloud_cache/")?;
	if name.contains('/') {
		return None;
	}
	let user_id = name.strip_suffix(".Deleted")?;
	if user_id.is_empty() || user_id == own_user_id {
		return None;
	}
	Some(user_id.to_string())
}

struct PeerState {
	remote_full: bool,
	pending_sends: HashMap<Handle, ChunkSender>,
	pending_receives: HashMap<Handle, ChunkReceiver>,
}

impl PeerState {
	fn new() -> Self {
		PeerState { remote_full: false, pending_sends: HashMap::new(), pending_receives: HashMap::new() }
	}
}

/// Binds every other component to one running sync session for a single
/// cloud root. One `SyncEngine` is created per configured pairing; a
/// process that syncs several roots runs several engines.
pub struct SyncEngine {
	config: Config,
	content_map: Mutex<IndexedContentMap>,
	deleted_list: Mutex<PersistentDeletedList>,
	/// Other users' PDILs, learned from `.cloud_cache/<userId>.Deleted` files
	/// that arrive as ordinary synced content. Consulted alongside this
	/// replica's own `deleted_list` so a handle another peer deleted isn't
	/// re-offered back to them.
	foreign_deleted_lists: Mutex<HashMap<String, PersistentDeletedList>>,
	/// Peers whose `SendHashStructure` is currently being diffed into queue
	/// entries. Guards against a second Structure for the same peer starting
	/// processing before the first finishes producing its operations.
	structure_in_progress: Mutex<HashSet<String>>,
	spooler: Arc<Spooler>,
	sessions: Arc<SessionManager>,
	transport: Arc<dyn Transport>,
	deleted_ring: Mutex<Option<Arc<DeletedByRemoteRing>>>,
	watcher: Mutex<Option<DirectoryWatcher>>,
	peers: Mutex<HashMap<String, PeerState>>,
	suspended: AtomicBool,
	last_sweep_failed: AtomicBool,
	sync_start_deadline: OnceLock<Arc<Deadline>>,
	secret_store: OnceLock<Arc<dyn SecretStore>>,
	pending_login_pins: Mutex<HashMap<String, String>>,
	/// Bytes read from `config.master_key_path` at construction, if
	/// configured; `None` runs the Chunk Transfer Engine in plain mode.
	encryption_key: Option<Vec<u8>>,
	/// Weak handle back to the `Arc<SyncEngine>` this instance lives in, set
	/// once at construction. `CommandSink::on_command` only hands handlers
	/// `&self`, but dispatch (`drain_spooler`) needs to hand `execute` an
	/// owned `Arc<Self>` to move into `tokio::spawn`; this recovers one
	/// without changing the trait signature.
	self_ref: OnceLock<Weak<SyncEngine>>,
}

impl SyncEngine {
	pub fn new(config: Config, transport: Arc<dyn Transport>) -> Arc<Self> {
		let content_map = IndexedContentMap::new(config.cloud_root.clone());
		let deleted_list = PersistentDeletedList::with_cap(config.user_id.clone(), config.pdil_cap);
		let spooler = Arc::new(Spooler::new(config.max_concurrent_operations));
		let sessions = Arc::new(SessionManager::new(config.role));
		let encryption_key = config.master_key_path.as_ref().and_then(|path| match std::fs::read(path) {
			Ok(bytes) => Some(bytes),
			Err(e) => {
				warn!(path = %path.display(), error = %e, "failed to read master encryption key, running unencrypted");
				None
			}
		});
		let engine = Arc::new(SyncEngine {
			config,
			content_map: Mutex::new(content_map),
			deleted_list: Mutex::new(deleted_list),
			foreign_deleted_lists: Mutex::new(HashMap::new()),
			structure_in_progress: Mutex::new(HashSet::new()),
			spooler,
			sessions,
			transport,
			deleted_ring: Mutex::new(None),
			watcher: Mutex::new(None),
			peers: Mutex::new(HashMap::new()),
			suspended: AtomicBool::new(false),
			last_sweep_failed: AtomicBool::new(false),
			sync_start_deadline: OnceLock::new(),
			secret_store: OnceLock::new(),
			pending_login_pins: Mutex::new(HashMap::new()),
			encryption_key,
			self_ref: OnceLock::new(),
		});
		let _ = engine.self_ref.set(Arc::downgrade(&engine));
		engine
	}

	/// Recover the `Arc<Self>` set by `new`. Only called from contexts where
	/// the engine is known to still be alive (handling a command implies
	/// something is holding the `Arc` that received it).
	fn self_arc(&self) -> Arc<Self> {
		self.self_ref.get().and_then(Weak::upgrade).expect("self_ref set in SyncEngine::new")
	}

	/// External suspension switch (e.g. "pause syncing" in a UI), independent
	/// of the mount-presence check the engine runs itself.
	pub fn set_suspended(&self, suspended: bool) {
		self.suspended.store(suspended, Ordering::SeqCst);
	}

	/// Wire in the PIN store used to verify `Authentication` proofs when this
	/// engine plays the server role. A no-op if called more than once; the
	/// first store wins.
	pub fn set_secret_store(&self, store: Arc<dyn SecretStore>) {
		let _ = self.secret_store.set(store);
	}

	/// Client side: begin a login to `peer_id` using `pin`, stashing it so
	/// the challenge that comes back can be answered without the caller
	/// staying on the line.
	pub async fn begin_login(&self, peer_id: &str, host: &str, pin: &str) -> Result<(), SyncError> {
		self.pending_login_pins.lock().await.insert(peer_id.to_string(), pin.to_string());
		self.send(peer_id, Command::RequestOfAuthentication { host: host.to_string(), user_agent: None }).await
	}

	async fn handle_authentication(&self, peer_id: &str, payload: Vec<u8>) {
		match self.config.role {
			Role::Server => {
				let Some(store) = self.secret_store.get() else {
					warn!(peer = peer_id, "authentication attempted with no secret store configured");
					let _ = self.send(peer_id, Command::Notification(Notice::LoginError)).await;
					return;
				};
				match self.sessions.verify_proof(peer_id, &payload, store.as_ref()).await {
					Ok(()) => {
						let _ = self.send(peer_id, Command::Notification(Notice::LoginSuccessful)).await;
					}
					Err(e) => {
						warn!(peer = peer_id, error = %e, "login failed");
						let _ = self.send(peer_id, Command::Notification(Notice::LoginError)).await;
					}
				}
			}
			Role::Client => {
				let pin = self.pending_login_pins.lock().await.remove(peer_id);
				if let Some(pin) = pin {
					let proof = SessionManager::compute_proof(&payload, &pin).to_vec();
					let _ = self.send(peer_id, Command::Authentication(proof)).await;
				}
			}
		}
	}

	fn is_suspended(&self) -> bool {
		self.suspended.load(Ordering::SeqCst) || !self.config.cloud_root.exists()
	}

	/// Load on-disk state, start the directory watcher, and spawn the three
	/// timer loops. Consumes nothing; the returned `Arc` keeps the engine
	/// alive for as long as the caller holds it.
	pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
		{
			let mut map = self.content_map.lock().await;
			let index_path = self.config.cloud_root.join(".cloud_cache").join("index.HashFileTable");
			map.load(&index_path)?;
			if map.load_failure() {
				map.rebuild_from_tree()?;
			}
		}
		{
			let mut list = self.deleted_list.lock().await;
			list.load(&self.config.cloud_root)?;
		}
		self.load_foreign_pdils_from_disk().await;

		let this = Arc::clone(self);
		let deadline = Arc::new(Deadline::new(move || {
			let this = Arc::clone(&this);
			async move { this.sweep_all_peers().await; }
		}));
		let _ = self.sync_start_deadline.set(deadline);

		let (events_tx, mut events_rx) = mpsc::unbounded_channel();
		let (sync_requested_tx, mut sync_requested_rx) = mpsc::unbounded_channel();
		let watcher = DirectoryWatcher::start(self.config.cloud_root.clone(), events_tx, sync_requested_tx)?;
		*self.deleted_ring.lock().await = Some(Arc::clone(&watcher.ring));
		*self.watcher.lock().await = Some(watcher);

		let this = Arc::clone(self);
		tokio::spawn(async move {
			while let Some(event) = events_rx.recv().await {
				this.apply_local_event(event).await;
			}
		});

		let this = Arc::clone(self);
		tokio::spawn(async move {
			while sync_requested_rx.recv().await.is_some() {
				if !this.is_suspended() {
					this.sweep_all_peers().await;
				}
			}
		});

		self.spawn_periodic_sync();
		self.spawn_mount_check();
		Ok(())
	}

	fn spawn_periodic_sync(self: &Arc<Self>) {
		let this = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				let interval = if this.last_sweep_failed.load(Ordering::SeqCst) {
					Duration::from_secs(this.config.periodic_sync_after_failure_secs)
				} else {
					Duration::from_secs(this.config.periodic_sync_secs)
				};
				tokio::time::sleep(interval).await;
				if !this.is_suspended() {
					this.sweep_all_peers().await;
				}
			}
		});
	}

	fn spawn_mount_check(self: &Arc<Self>) {
		let this = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(Duration::from_secs(this.config.mount_check_secs)).await;
				if !this.config.cloud_root.exists() {
					warn!(root = %this.config.cloud_root.display(), "cloud root mount point disappeared, suspending");
				}
			}
		});
	}

	/// Apply a watcher event to the in-memory model and schedule (debounced)
	/// propagation to peers.
	async fn apply_local_event(self: &Arc<Self>, event: DwEvent) {
		match &event {
			DwEvent::Create { relative_path, .. } => self.reindex_path(relative_path).await,
			DwEvent::Change { relative_path } => {
				self.reindex_path(relative_path).await;
				if let Some(peer_user_id) = foreign_pdil_user_id(relative_path, &self.config.user_id) {
					self.reload_foreign_pdil(&peer_user_id).await;
				}
			}
			DwEvent::Delete { relative_path } => self.apply_local_delete(relative_path).await,
			// spec.md §4.6: a rename is Delete(old) + Create(new), so the old
			// path's content-map entry is dropped (and its deletion recorded
			// in the PDIL) rather than left behind as a stale entry once the
			// new path is indexed.
			DwEvent::Rename { old_relative_path, new_relative_path } => {
				self.apply_local_delete(old_relative_path).await;
				self.reindex_path(new_relative_path).await;
				if let Some(peer_user_id) = foreign_pdil_user_id(new_relative_path, &self.config.user_id) {
					self.reload_foreign_pdil(&peer_user_id).await;
				}
			}
		}

		if let Some(deadline) = self.sync_start_deadline.get() {
			deadline.schedule(Duration::from_secs(self.config.pause_before_syncing_secs)).await;
		}
	}

	/// Reload one other user's PDIL from disk, then trigger an immediate
	/// sweep — per spec.md §4.6, a change to a peer's `.cloud_cache` entry
	/// means new delete knowledge arrived and should propagate right away
	/// rather than wait out the normal debounce window.
	async fn reload_foreign_pdil(self: &Arc<Self>, peer_user_id: &str) {
		let mut lists = self.foreign_deleted_lists.lock().await;
		let list = lists
			.entry(peer_user_id.to_string())
			.or_insert_with(|| PersistentDeletedList::with_cap(peer_user_id, self.config.pdil_cap));
		if let Err(e) = list.load(&self.config.cloud_root) {
			warn!(user = peer_user_id, "failed to reload foreign PDIL: {}", e);
		}
		drop(lists);
		if !self.is_suspended() {
			self.sweep_all_peers().await;
		}
	}

	/// Pick up any peer PDILs already present under `.cloud_cache` on disk at
	/// startup, so a restarted replica doesn't have to wait for a live
	/// filesystem change before it honors deletions it already learned about
	/// in a prior run.
	async fn load_foreign_pdils_from_disk(&self) {
		let cache_dir = self.config.cloud_root.join(".cloud_cache");
		let read_dir = match std::fs::read_dir(&cache_dir) {
			Ok(rd) => rd,
			Err(_) => return,
		};
		let mut lists = self.foreign_deleted_lists.lock().await;
		for entry in read_dir.flatten() {
			let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else { continue };
			let Some(peer_user_id) = foreign_pdil_user_id(&format!(".cloud_cache/{}", name), &self.config.user_id) else { continue };
			let mut list = PersistentDeletedList::with_cap(peer_user_id.clone(), self.config.pdil_cap);
			if list.load(&self.config.cloud_root).is_ok() {
				lists.insert(peer_user_id, list);
			}
		}
	}

	fn own_pdil_relative_path(&self) -> String {
		format!(".cloud_cache/{}.Deleted", self.config.user_id)
	}

	/// Flush this replica's own deleted list to its `.cloud_cache` file and
	/// fold that file into the content map, so the deletion rides the
	/// ordinary structure/chunk pipeline out to peers alongside everything
	/// else (spec.md §9's "PDIL files are synced as ordinary cloud content").
	async fn persist_own_deleted_list(&self) {
		{
			let mut list = self.deleted_list.lock().await;
			if let Err(e) = list.persist(&self.config.cloud_root) {
				warn!("failed to persist deleted list: {}", e);
				return;
			}
		}
		let relative_path = self.own_pdil_relative_path();
		self.reindex_path(&relative_path).await;
	}

	async fn reindex_path(&self, relative_path: &str) {
		let absolute = self.config.cloud_root.join(relative_path);
		let meta = match std::fs::metadata(&absolute) {
			Ok(m) => m,
			Err(_) => return,
		};
		let kind = if meta.is_dir() { EntryKind::Dir } else { EntryKind::File };
		let handle = Handle::derive(relative_path, kind);
		let mtime = if kind == EntryKind::Dir { 0 } else { mtime_to_u32(meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH)) };
		let allocated_size = if kind == EntryKind::Dir { 0 } else { meta.len() as i64 };
		let mut map = self.content_map.lock().await;
		let _ = map.add(Entry { handle, relative_path: relative_path.to_string(), mtime, allocated_size, kind });
		let mut list = self.deleted_list.lock().await;
		list.remove_by_handle(handle);
	}

	async fn apply_local_delete(&self, relative_path: &str) {
		let ring = self.deleted_ring.lock().await.clone();
		if let Some(ring) = ring {
			if ring.consume_if_present(relative_path) {
				// this delete was requested by a peer; it already knows.
				return;
			}
		}
		let mut map = self.content_map.lock().await;
		let removed = if let Some(entry) = map.get_by_path(relative_path).cloned() {
			map.remove(entry.handle);
			Some(entry)
		} else {
			None
		};
		drop(map);
		if let Some(entry) = removed {
			{
				let mut list = self.deleted_list.lock().await;
				list.append(FileId::new(entry.handle, entry.mtime));
			}
			self.persist_own_deleted_list().await;
		}
	}

	/// Ask every known peer for its root hash. Real peer discovery lives
	/// outside this crate; the engine is handed peer ids as they connect via
	/// [`CommandSink::on_command`], so "every known peer" is whoever has an
	/// entry in `peers`.
	async fn sweep_all_peers(self: &Arc<Self>) {
		let peer_ids: Vec<String> = self.peers.lock().await.keys().cloned().collect();
		let mut any_failed = false;
		for peer_id in peer_ids {
			if self.request_synchronization(&peer_id).await.is_err() {
				any_failed = true;
			}
		}
		self.last_sweep_failed.store(any_failed, Ordering::SeqCst);
	}

	pub async fn request_synchronization(&self, peer_id: &str) -> Result<(), SyncError> {
		let root = self.content_map.lock().await.root_hash();
		self.send(peer_id, Command::SendHashRoot(root)).await
	}

	async fn send(&self, peer_id: &str, command: Command) -> Result<(), SyncError> {
		let (code, frames) = command.encode();
		self.transport.send(peer_id, code, frames).await.map_err(SyncError::Io)
	}

	fn peer_entry<'a>(peers: &'a mut HashMap<String, PeerState>, peer_id: &str) -> &'a mut PeerState {
		peers.entry(peer_id.to_string()).or_insert_with(PeerState::new)
	}

	async fn handle_send_hash_root(&self, peer_id: &str, remote_root: u64) {
		let local_root = self.content_map.lock().await.root_hash();
		if local_root != remote_root {
			let _ = self.send(peer_id, Command::RequestHashStructure).await;
		}
	}

	async fn handle_request_hash_structure(&self, peer_id: &str) {
		let structure = self.content_map.lock().await.structure_hash();
		let _ = self.send(peer_id, Command::SendHashStructure(structure)).await;
	}

	async fn handle_send_hash_structure(&self, peer_id: &str, buf: Vec<u8>) {
		if !self.structure_in_progress.lock().await.insert(peer_id.to_string()) {
			warn!(peer = peer_id, "dropping structure update: still producing operations for the prior one");
			return;
		}
		self.diff_and_enqueue_structure(peer_id, &buf).await;
		self.structure_in_progress.lock().await.remove(peer_id);
		self.self_arc().drain_spooler(peer_id).await;
	}

	/// Body of `handle_send_hash_structure`, split out so the reentry guard
	/// has a single, early-return-free block to wrap.
	async fn diff_and_enqueue_structure(&self, peer_id: &str, buf: &[u8]) {
		let remote = IndexedContentMap::parse_structure(buf);
		let map = self.content_map.lock().await;
		let local: HashMap<Handle, u32> = map.keys_with_mtimes().into_iter().collect();
		let deleted_list = self.deleted_list.lock().await;
		let foreign_deleted = self.foreign_deleted_lists.lock().await;
		let ops = diff_structures(&local, &remote, |h| {
			deleted_list.contains_handle(h) || foreign_deleted.values().any(|list| list.contains_handle(h))
		});
		drop(foreign_deleted);
		drop(deleted_list);

		// `Send(h)` only ever fires for handles this side holds locally, so the
		// content map always has the kind on hand here; a directory becomes a
		// `Mkdir` announcement instead of a chunk transfer. `DeleteOnPeer`
		// fires for handles we've already forgotten (they live in the deleted
		// list, not the content map), so kind has to be read back off the
		// remote's own structure entry instead: directories always carry
		// mtime 0 there, per the data model.
		let mut queued = Vec::with_capacity(ops.len());
		for op in ops {
			match op {
				DiffOp::Request(handle) => queued.push(QueueEntry::new(OpKind::Request(handle), peer_id)),
				DiffOp::Send(handle) => match map.get(handle) {
					Some(entry) if entry.kind == EntryKind::Dir => {
						queued.push(QueueEntry::new(OpKind::Mkdir(entry.relative_path.clone()), peer_id))
					}
					// The spooler needs the path to prioritize PDIL files under
					// `.cloud_cache` ahead of bulk sends; a bare handle can't
					// give it that, so it rides along on the queue entry.
					Some(entry) => {
						queued.push(QueueEntry::with_path_hint(OpKind::Send(handle), peer_id, entry.relative_path.clone()))
					}
					None => queued.push(QueueEntry::new(OpKind::Send(handle), peer_id)),
				},
				DiffOp::DeleteOnPeer { handle, mtime } if mtime == 0 => {
					queued.push(QueueEntry::new(OpKind::DeleteDir(handle), peer_id));
				}
				DiffOp::DeleteOnPeer { handle, mtime } => {
					queued.push(QueueEntry::new(OpKind::DeleteFile { handle, mtime }, peer_id));
				}
			}
		}
		drop(map);

		for entry in queued {
			self.spooler.enqueue(entry).await;
		}
	}

	/// Dispatch as many eligible queued operations as the concurrency bound
	/// allows. Each dispatched operation drives itself to completion and
	/// releases its permit on drop; this is a best-effort pump, not a loop
	/// that blocks until the queue is empty.
	async fn drain_spooler(self: &Arc<Self>, _peer_id: &str) {
		while let Some((entry, permit)) = self.spooler.try_dispatch().await {
			let this = Arc::clone(self);
			tokio::spawn(async move {
				let _permit = permit;
				this.execute(entry).await;
			});
		}
	}

	async fn execute(self: Arc<Self>, entry: QueueEntry) {
		let result = match &entry.kind {
			OpKind::Request(handle) => self.send(&entry.peer_id, Command::RequestChunkFile { handle: *handle, part: 1 }).await,
			OpKind::Send(handle) => self.begin_send(&entry.peer_id, *handle).await,
			OpKind::DeleteFile { handle, mtime } => {
				self.send(&entry.peer_id, Command::DeleteFile { handle: *handle, mtime: *mtime }).await
			}
			OpKind::DeleteDir(handle) => self.send(&entry.peer_id, Command::DeleteDirectory { handle: *handle }).await,
			OpKind::Mkdir(relative_path) => {
				self.send(&entry.peer_id, Command::CreateDirectory { relative_path: relative_path.clone() }).await
			}
		};
		match result {
			Ok(()) => self.spooler.record_success(entry.kind.handle().unwrap_or(Handle(0))).await,
			Err(e) => {
				warn!(peer = %entry.peer_id, error = %e, "operation failed, requeueing");
				let abandon = self.spooler.requeue_or_abandon(entry.clone()).await;
				if abandon {
					warn!(peer = %entry.peer_id, "operation abandoned after repeated failures");
				}
			}
		}
	}

	async fn begin_send(&self, peer_id: &str, handle: Handle) -> Result<(), SyncError> {
		let map = self.content_map.lock().await;
		let entry = map.get(handle).cloned().ok_or(SyncError::Aborted)?;
		drop(map);
		let absolute = self.config.cloud_root.join(&entry.relative_path);
		let mut sender = ChunkSender::open(
			handle,
			&absolute,
			entry.relative_path.clone(),
			entry.mtime,
			self.config.chunk_size,
			self.encryption_key.as_deref(),
		)?;
		let chunk = sender.next_chunk()?.ok_or(SyncError::Aborted)?;
		let mut peers = self.peers.lock().await;
		let peer_state = Self::peer_entry(&mut peers, peer_id);
		if chunk.final_meta.is_none() {
			peer_state.pending_sends.insert(handle, sender);
		}
		drop(peers);
		self.send(
			peer_id,
			Command::SendChunkFile { handle, part: chunk.part, total: chunk.total, data: chunk.data, final_meta: chunk.final_meta },
		)
		.await
	}

	async fn handle_request_chunk_file(&self, peer_id: &str, handle: Handle, part: u32) {
		let mut peers = self.peers.lock().await;
		let peer_state = Self::peer_entry(&mut peers, peer_id);
		let sender = match peer_state.pending_sends.get_mut(&handle) {
			Some(s) => s,
			None => {
				drop(peers);
				if part == 1 {
					// The requester only knows the handle, not its kind; if we
					// recognize it as a directory, answer with `CreateDirectory`
					// instead of attempting to open it as a chunk source.
					let dir_path = self.content_map.lock().await.get(handle).and_then(|entry| {
						(entry.kind == EntryKind::Dir).then(|| entry.relative_path.clone())
					});
					match dir_path {
						Some(relative_path) => {
							let _ = self.send(peer_id, Command::CreateDirectory { relative_path }).await;
						}
						None => {
							let _ = self.begin_send(peer_id, handle).await;
						}
					}
				}
				return;
			}
		};
		let chunk = match sender.next_chunk() {
			Ok(Some(c)) => c,
			_ => {
				peer_state.pending_sends.remove(&handle);
				return;
			}
		};
		if chunk.final_meta.is_some() {
			peer_state.pending_sends.remove(&handle);
		}
		drop(peers);
		let _ = self
			.send(
				peer_id,
				Command::SendChunkFile { handle, part: chunk.part, total: chunk.total, data: chunk.data, final_meta: chunk.final_meta },
			)
			.await;
	}

	async fn handle_send_chunk_file(
		&self,
		peer_id: &str,
		handle: Handle,
		part: u32,
		data: Vec<u8>,
		final_meta: Option<crate::chunk::FinalChunkMeta>,
	) {
		if !has_room(&self.config.cloud_root, data.len() as u64, self.config.min_reserve_bytes.max(MIN_RESERVE_BYTES)) {
			let _ = self.send(peer_id, Command::Notification(Notice::FullSpace)).await;
			return;
		}

		let temp_dir = self.config.cloud_root.join(".cloud_cache").join("tmp");
		let _ = std::fs::create_dir_all(&temp_dir);

		let mut peers = self.peers.lock().await;
		let peer_state = Self::peer_entry(&mut peers, peer_id);
		let receiver = peer_state
			.pending_receives
			.entry(handle)
			.or_insert_with(|| {
				ChunkReceiver::new(ChunkReceiver::stage_path(&temp_dir, peer_id, handle), self.config.chunk_size, self.encryption_key.as_deref())
			});

		if receiver.append(part, &data).is_err() {
			peer_state.pending_receives.remove(&handle);
			drop(peers);
			let _ = self.send(peer_id, Command::RequestChunkFile { handle, part: 1 }).await;
			return;
		}

		let Some(meta) = final_meta else {
			return;
		};
		let final_path = self.config.cloud_root.join(&meta.relative_path);
		let mut receiver = peer_state.pending_receives.remove(&handle).expect("just inserted above");
		drop(peers);

		match receiver.finalize(&meta, &final_path) {
			Ok(()) => {
				let mut map = self.content_map.lock().await;
				let _ = map.add(Entry {
					handle,
					relative_path: meta.relative_path,
					mtime: meta.mtime,
					allocated_size: meta.length as i64,
					kind: EntryKind::File,
				});
			}
			Err(e) => warn!(peer = %peer_id, error = %e, "chunk transfer finalize failed"),
		}
	}

	async fn handle_delete_file(&self, handle: Handle, mtime: u32) {
		let entry = {
			let mut map = self.content_map.lock().await;
			map.remove(handle)
		};
		if let Some(entry) = entry {
			if let Some(ring) = self.deleted_ring.lock().await.clone() {
				ring.mark(&entry.relative_path);
			}
			let _ = std::fs::remove_file(self.config.cloud_root.join(&entry.relative_path));
			{
				let mut list = self.deleted_list.lock().await;
				list.append(FileId::new(handle, mtime));
			}
			self.persist_own_deleted_list().await;
		}
	}

	async fn handle_delete_directory(&self, handle: Handle) {
		let mut map = self.content_map.lock().await;
		if let Some(entry) = map.get(handle).cloned() {
			let removed = map.remove_subtree(&entry.relative_path);
			drop(map);
			if let Some(ring) = self.deleted_ring.lock().await.clone() {
				for e in &removed {
					ring.mark(&e.relative_path);
				}
			}
			let _ = std::fs::remove_dir_all(self.config.cloud_root.join(&entry.relative_path));
			{
				let mut list = self.deleted_list.lock().await;
				for e in &removed {
					list.append(FileId::new(e.handle, e.mtime));
				}
			}
			self.persist_own_deleted_list().await;
		}
	}

	async fn handle_create_directory(&self, relative_path: String) {
		let absolute = self.config.cloud_root.join(&relative_path);
		if std::fs::create_dir_all(&absolute).is_ok() {
			let handle = Handle::derive(&relative_path, EntryKind::Dir);
			let mut map = self.content_map.lock().await;
			let _ = map.add(Entry { handle, relative_path, mtime: 0, allocated_size: 0, kind: EntryKind::Dir });
		}
	}

	async fn handle_status_notification(&self, peer_id: &str, status: crate::protocol::Status) {
		use crate::protocol::Status;
		match status {
			Status::Busy => self.spooler.set_remote_full(peer_id, true).await,
			Status::Ready => self.spooler.set_remote_full(peer_id, false).await,
		}
	}

	async fn handle_notification(&self, peer_id: &str, notice: Notice) {
		match notice {
			Notice::FullSpace => self.spooler.set_remote_full(peer_id, true).await,
			Notice::FullSpaceOff => self.spooler.set_remote_full(peer_id, false).await,
			Notice::LoginSuccessful => {
				self.sessions.mark_authenticated(peer_id).await;
				let _ = self.request_synchronization(peer_id).await;
			}
			Notice::LoginError => warn!(peer = peer_id, "login rejected by peer"),
			_ => {}
		}
	}

	pub fn cloud_root(&self) -> &PathBuf {
		&self.config.cloud_root
	}

	pub fn sessions(&self) -> &Arc<SessionManager> {
		&self.sessions
	}
}

#[async_trait]
impl CommandSink for SyncEngine {
	async fn on_command(&self, peer_id: &str, command: u16, frames: Frames) {
		let decoded = match Command::decode(command, &frames) {
			Ok(c) => c,
			Err(e) => {
				warn!(peer = peer_id, error = %e, "dropping malformed frame");
				return;
			}
		};

		if !self.sessions.is_authenticated(peer_id).await
			&& !matches!(
				decoded,
				Command::RequestOfAuthentication { .. } | Command::Authentication(_) | Command::Notification(_)
			)
		{
			warn!(peer = peer_id, "command from unauthenticated peer, ignoring");
			return;
		}

		match decoded {
			Command::RequestOfAuthentication { .. } => {
				if let Ok(challenge) = self.sessions.begin_login(peer_id).await {
					let _ = self.send(peer_id, Command::Authentication(challenge.to_vec())).await;
				}
			}
			Command::Authentication(proof) => self.handle_authentication(peer_id, proof).await,
			Command::SendHashRoot(root) => self.handle_send_hash_root(peer_id, root).await,
			Command::RequestHashStructure => self.handle_request_hash_structure(peer_id).await,
			Command::SendHashStructure(buf) => self.handle_send_hash_structure(peer_id, buf).await,
			Command::RequestChunkFile { handle, part } => self.handle_request_chunk_file(peer_id, handle, part).await,
			Command::SendChunkFile { handle, part, data, final_meta, .. } => {
				self.handle_send_chunk_file(peer_id, handle, part, data, final_meta).await
			}
			Command::DeleteFile { handle, mtime } => self.handle_delete_file(handle, mtime).await,
			Command::DeleteDirectory { handle } => self.handle_delete_directory(handle).await,
			Command::CreateDirectory { relative_path } => self.handle_create_directory(relative_path).await,
			Command::StatusNotification(status) => self.handle_status_notification(peer_id, status).await,
			Command::Notification(notice) => self.handle_notification(peer_id, notice).await,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Role;
	use std::sync::Mutex as StdMutex;
	use tempfile::tempdir;

	struct RecordingTransport {
		sent: StdMutex<Vec<(String, u16, Frames)>>,
	}

	#[async_trait]
	impl Transport for RecordingTransport {
		async fn send(&self, peer_id: &str, command: u16, frames: Frames) -> std::io::Result<()> {
			self.sent.lock().unwrap().push((peer_id.to_string(), command, frames));
			Ok(())
		}
	}

	fn test_config(root: PathBuf) -> Config {
		Config {
			cloud_root: root,
			user_id: "u1".into(),
			role: Role::Server,
			..Config::default()
		}
	}

	#[test]
	fn foreign_pdil_user_id_recognizes_peer_delete_files() {
		assert_eq!(foreign_pdil_user_id(".cloud_cache/bob.Deleted", "alice"), Some("bob".to_string()));
		assert_eq!(foreign_pdil_user_id(".cloud_cache/alice.Deleted", "alice"), None);
		assert_eq!(foreign_pdil_user_id(".cloud_cache/index.HashFileTable", "alice"), None);
		assert_eq!(foreign_pdil_user_id("docs/bob.Deleted", "alice"), None);
		assert_eq!(foreign_pdil_user_id(".cloud_cache/tmp/bob.Deleted", "alice"), None);
	}

	#[tokio::test]
	async fn concurrent_structure_for_same_peer_drops_the_second() {
		let dir = tempdir().unwrap();
		let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
		let engine = SyncEngine::new(test_config(dir.path().to_path_buf()), transport);

		engine.structure_in_progress.lock().await.insert("peer1".to_string());
		// A second Structure for the same peer arriving while the first is
		// still "in flight" (simulated by pre-marking the guard) must bail
		// out immediately rather than diff a second time.
		engine.handle_send_hash_structure("peer1", Vec::new()).await;
		assert!(engine.structure_in_progress.lock().await.contains("peer1"));

		engine.structure_in_progress.lock().await.remove("peer1");
		engine.handle_send_hash_structure("peer1", Vec::new()).await;
		assert!(!engine.structure_in_progress.lock().await.contains("peer1"));
	}

	#[tokio::test]
	async fn differing_root_hash_triggers_structure_request() {
		let dir = tempdir().unwrap();
		let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
		let engine = SyncEngine::new(test_config(dir.path().to_path_buf()), transport.clone());
		engine.handle_send_hash_root("peer1", 0xDEAD).await;
		let sent = transport.sent.lock().unwrap();
		assert_eq!(sent.last().unwrap().1, code::REQUEST_HASH_STRUCTURE);
	}

	#[tokio::test]
	async fn matching_root_hash_sends_nothing() {
		let dir = tempdir().unwrap();
		let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
		let engine = SyncEngine::new(test_config(dir.path().to_path_buf()), transport.clone());
		let root = engine.content_map.lock().await.root_hash();
		engine.handle_send_hash_root("peer1", root).await;
		assert!(transport.sent.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn create_directory_command_makes_directory_and_entry() {
		let dir = tempdir().unwrap();
		let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
		let engine = SyncEngine::new(test_config(dir.path().to_path_buf()), transport);
		engine.handle_create_directory("docs".into()).await;
		assert!(dir.path().join("docs").is_dir());
		let map = engine.content_map.lock().await;
		assert!(map.get_by_path("docs").is_some());
	}

	#[tokio::test]
	async fn delete_file_command_removes_entry_and_marks_ring() {
		let dir = tempdir().unwrap();
		std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
		let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
		let engine = SyncEngine::new(test_config(dir.path().to_path_buf()), transport);
		let handle = Handle::derive("a.txt", EntryKind::File);
		{
			let mut map = engine.content_map.lock().await;
			map.add(Entry { handle, relative_path: "a.txt".into(), mtime: 1, allocated_size: 2, kind: EntryKind::File }).unwrap();
		}
		*engine.deleted_ring.lock().await = Some(Arc::new(DeletedByRemoteRing::new()));
		engine.handle_delete_file(handle, 1).await;
		assert!(engine.content_map.lock().await.get(handle).is_none());
		assert!(!dir.path().join("a.txt").exists());
	}

	use crate::session::SecretStore;

	struct FixedStore(&'static str);
	impl SecretStore for FixedStore {
		fn active_pins(&self, _peer_user_id: &str) -> Vec<String> {
			vec![self.0.to_string()]
		}
		fn consume_pin(&self, _peer_user_id: &str, _pin: &str) {}
	}

	#[tokio::test]
	async fn server_replies_login_successful_for_correct_proof() {
		let dir = tempdir().unwrap();
		let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
		let engine = SyncEngine::new(test_config(dir.path().to_path_buf()), transport.clone());
		engine.set_secret_store(Arc::new(FixedStore("424242")));

		let challenge = engine.sessions.begin_login("client1").await.unwrap();
		let proof = SessionManager::compute_proof(&challenge, "424242").to_vec();
		engine.handle_authentication("client1", proof).await;

		assert!(engine.sessions.is_authenticated("client1").await);
		let sent = transport.sent.lock().unwrap();
		assert_eq!(sent.last().unwrap().1, code::NOTIFICATION);
	}

	#[tokio::test]
	async fn server_replies_login_error_for_wrong_proof() {
		let dir = tempdir().unwrap();
		let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
		let engine = SyncEngine::new(test_config(dir.path().to_path_buf()), transport.clone());
		engine.set_secret_store(Arc::new(FixedStore("424242")));

		engine.sessions.begin_login("client1").await.unwrap();
		engine.handle_authentication("client1", vec![0u8; 32]).await;

		assert!(!engine.sessions.is_authenticated("client1").await);
	}

	#[tokio::test]
	async fn client_answers_challenge_with_stashed_pin() {
		let dir = tempdir().unwrap();
		let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
		let mut config = test_config(dir.path().to_path_buf());
		config.role = Role::Client;
		let engine = SyncEngine::new(config, transport.clone());

		engine.begin_login("server1", "syncr-core", "123456").await.unwrap();
		let challenge = vec![1u8; 16];
		engine.handle_authentication("server1", challenge.clone()).await;

		let sent = transport.sent.lock().unwrap();
		let (_, code, frames) = sent.last().unwrap();
		assert_eq!(*code, code::AUTHENTICATION);
		assert_eq!(frames[0], SessionManager::compute_proof(&challenge, "123456").to_vec());
	}
}

// vim: ts=4
