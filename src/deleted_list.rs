//! C3: Persistent Deleted-ID List (PDIL).
//!
//! Per-user, per-scope bounded FIFO of `FileId`s, persisted under
//! `CloudRoot/.cloud_cache/<userId>.Deleted` and synced as ordinary cloud
//! content so peers learn each other's delete sets.

use crate::handle::Handle;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Identity of a file version at a moment: a handle plus the mtime it had
/// when deleted. Directory FileIds always carry `mtime = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
	pub handle: Handle,
	pub mtime: u32,
}

impl FileId {
	pub fn new(handle: Handle, mtime: u32) -> Self {
		FileId { handle, mtime }
	}

	fn to_bytes(self) -> [u8; 12] {
		let mut buf = [0u8; 12];
		buf[0..8].copy_from_slice(&self.handle.as_u64().to_le_bytes());
		buf[8..12].copy_from_slice(&self.mtime.to_le_bytes());
		buf
	}

	fn from_bytes(b: &[u8]) -> FileId {
		let handle = u64::from_le_bytes(b[0..8].try_into().unwrap());
		let mtime = u32::from_le_bytes(b[8..12].try_into().unwrap());
		FileId { handle: Handle(handle), mtime }
	}
}

/// Bound on entries per `(user, scope)`, per spec.md §3.
pub const PDIL_CAP: usize = 1000;

/// FIFO-bounded, append-mostly list of deleted `FileId`s for one user.
pub struct PersistentDeletedList {
	user_id: String,
	cap: usize,
	entries: VecDeque<FileId>,
	dirty: bool,
}

impl PersistentDeletedList {
	pub fn new(user_id: impl Into<String>) -> Self {
		PersistentDeletedList { user_id: user_id.into(), cap: PDIL_CAP, entries: VecDeque::new(), dirty: false }
	}

	pub fn with_cap(user_id: impl Into<String>, cap: usize) -> Self {
		PersistentDeletedList { user_id: user_id.into(), cap, entries: VecDeque::new(), dirty: false }
	}

	pub fn user_id(&self) -> &str {
		&self.user_id
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	/// Append a deletion, evicting the oldest entry if the cap is exceeded.
	pub fn append(&mut self, file_id: FileId) {
		self.entries.push_back(file_id);
		while self.entries.len() > self.cap {
			self.entries.pop_front();
		}
		self.dirty = true;
	}

	/// Remove a matching entry, used when a file reappears (recovery from
	/// trash). Removes by handle alone: any mtime at which it was deleted is
	/// superseded by the file's reappearance.
	pub fn remove_by_handle(&mut self, handle: Handle) -> bool {
		let before = self.entries.len();
		self.entries.retain(|f| f.handle != handle);
		let removed = self.entries.len() != before;
		if removed {
			self.dirty = true;
		}
		removed
	}

	pub fn contains_handle(&self, handle: Handle) -> bool {
		self.entries.iter().any(|f| f.handle == handle)
	}

	pub fn iter(&self) -> impl Iterator<Item = &FileId> {
		self.entries.iter()
	}

	/// Path convention from spec.md §6: `<userId>.Deleted` under
	/// `CloudRoot/.cloud_cache`.
	pub fn path_for(cloud_root: &Path, user_id: &str) -> PathBuf {
		cloud_root.join(".cloud_cache").join(format!("{}.Deleted", user_id))
	}

	pub fn persist(&mut self, cloud_root: &Path) -> std::io::Result<()> {
		let path = Self::path_for(cloud_root, &self.user_id);
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let tmp_path = path.with_extension("tmp");
		{
			let mut file = std::fs::File::create(&tmp_path)?;
			for entry in &self.entries {
				file.write_all(&entry.to_bytes())?;
			}
			file.sync_all()?;
		}
		std::fs::rename(&tmp_path, &path)?;
		self.dirty = false;
		Ok(())
	}

	pub fn load(&mut self, cloud_root: &Path) -> std::io::Result<()> {
		let path = Self::path_for(cloud_root, &self.user_id);
		if !path.exists() {
			return Ok(());
		}
		let mut file = std::fs::File::open(&path)?;
		let mut buf = Vec::new();
		file.read_to_end(&mut buf)?;
		self.entries = buf.chunks_exact(12).map(FileId::from_bytes).collect();
		while self.entries.len() > self.cap {
			self.entries.pop_front();
		}
		self.dirty = false;
		Ok(())
	}
}


// vim: ts=4
