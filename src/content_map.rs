//! C2: Indexed Content Map.
//!
//! A keyed, persistable map from a 64-bit content handle to filesystem
//! entries, with used-space accounting and crash-safe persistence.

use crate::error::ContentMapError;
use crate::handle::{mtime_to_u32, EntryKind, Handle};
use crate::logging::*;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Directory names excluded from `rebuild_from_tree`, case-insensitive.
const EXCLUDED_DIR_NAMES: &[&str] = &["bin", "obj", ".vs", "packages", "apppackages"];

/// File/directory names hidden from sync content regardless of dotfile
/// status.
const HIDDEN_NAMES: &[&str] = &["desktop.ini"];

/// Extensions hidden from sync content.
const HIDDEN_EXTENSIONS: &[&str] = &["desktop"];

/// Cache directory created hidden under the cloud root. Excluded from sync
/// content except for the peers' PDIL files, which ride along as ordinary
/// entries so peers learn each other's delete sets.
const CLOUD_CACHE_DIR: &str = ".cloud_cache";

const PDIL_SUFFIX: &str = ".Deleted";

fn is_pdil_file_name(name: &str) -> bool {
	name.len() > PDIL_SUFFIX.len() && name.ends_with(PDIL_SUFFIX)
}

/// True for `.cloud_cache/<user_id>.Deleted`, the one path shape allowed
/// through the otherwise-blanket `.cloud_cache` exclusion.
fn is_pdil_relative_path(relative_path: &str) -> bool {
	match relative_path.strip_prefix(CLOUD_CACHE_DIR).and_then(|rest| rest.strip_prefix('/')) {
		Some(rest) => !rest.is_empty() && !rest.contains('/') && is_pdil_file_name(rest),
		None => false,
	}
}

fn is_visible_name(name: &str) -> bool {
	if name.starts_with('.') || name.starts_with('_') {
		return false;
	}
	let lower = name.to_ascii_lowercase();
	if HIDDEN_NAMES.contains(&lower.as_str()) {
		return false;
	}
	if let Some(ext) = Path::new(&lower).extension().and_then(|e| e.to_str()) {
		if HIDDEN_EXTENSIONS.contains(&ext) {
			return false;
		}
	}
	true
}

fn is_excluded_dir(name: &str) -> bool {
	let lower = name.to_ascii_lowercase();
	EXCLUDED_DIR_NAMES.contains(&lower.as_str())
}

/// A tracked filesystem entry. Directories always carry `mtime = 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
	pub handle: Handle,
	pub relative_path: String,
	pub mtime: u32,
	pub allocated_size: i64,
	pub kind: EntryKind,
}

/// `Handle -> Entry`, with aggregate used-space accounting.
///
/// Invariant: `used_space == entries.values().map(|e| e.allocated_size).sum()`,
/// maintained incrementally by `add`/`remove` rather than recomputed.
pub struct IndexedContentMap {
	cloud_root: PathBuf,
	entries: HashMap<Handle, Entry>,
	path_index: HashMap<String, Handle>,
	used_space: i64,
	load_failure: bool,
}

impl IndexedContentMap {
	pub fn new(cloud_root: PathBuf) -> Self {
		IndexedContentMap {
			cloud_root,
			entries: HashMap::new(),
			path_index: HashMap::new(),
			used_space: 0,
			load_failure: false,
		}
	}

	pub fn used_space(&self) -> i64 {
		self.used_space
	}

	pub fn load_failure(&self) -> bool {
		self.load_failure
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Insert or replace an entry. Rejects paths outside the cloud root or
	/// that fail the visibility rules, without mutating state on rejection.
	pub fn add(&mut self, entry: Entry) -> Result<(), ContentMapError> {
		if !is_pdil_relative_path(&entry.relative_path) {
			for component in entry.relative_path.split('/') {
				if component.is_empty() {
					continue;
				}
				if !is_visible_name(component) {
					return Err(ContentMapError::Hidden { path: entry.relative_path.clone() });
				}
			}
		}
		if entry.relative_path.starts_with("..") || entry.relative_path.starts_with('/') {
			return Err(ContentMapError::OutsideRoot { path: entry.relative_path.clone() });
		}

		let delta = if let Some(old) = self.entries.get(&entry.handle) {
			entry.allocated_size - old.allocated_size
		} else {
			entry.allocated_size
		};

		self.path_index.insert(entry.relative_path.clone(), entry.handle);
		self.entries.insert(entry.handle, entry);
		self.used_space += delta;
		Ok(())
	}

	pub fn remove(&mut self, handle: Handle) -> Option<Entry> {
		let entry = self.entries.remove(&handle)?;
		self.used_space -= entry.allocated_size;
		self.path_index.remove(&entry.relative_path);
		Some(entry)
	}

	pub fn get(&self, handle: Handle) -> Option<&Entry> {
		self.entries.get(&handle)
	}

	pub fn get_by_path(&self, relative_path: &str) -> Option<&Entry> {
		self.path_index.get(relative_path).and_then(|h| self.entries.get(h))
	}

	pub fn contains(&self, handle: Handle) -> bool {
		self.entries.contains_key(&handle)
	}

	/// Remove every entry whose relative path lies under `dir_path`
	/// (inclusive of `dir_path` itself). Returns the removed entries.
	pub fn remove_subtree(&mut self, dir_path: &str) -> Vec<Entry> {
		let prefix = format!("{}/", dir_path.trim_end_matches('/'));
		let handles: Vec<Handle> = self
			.entries
			.values()
			.filter(|e| e.relative_path == dir_path || e.relative_path.starts_with(&prefix))
			.map(|e| e.handle)
			.collect();
		handles.into_iter().filter_map(|h| self.remove(h)).collect()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Entry> {
		self.entries.values()
	}

	pub fn keys_with_mtimes(&self) -> Vec<(Handle, u32)> {
		self.entries.values().map(|e| (e.handle, e.mtime)).collect()
	}

	/// XOR-fold of all handles XOR-folded with all mtimes. Order-independent
	/// by construction; two replicas with identical visible content always
	/// agree regardless of insertion order.
	pub fn root_hash(&self) -> u64 {
		self.entries.values().fold(0u64, |acc, e| acc ^ e.handle.as_u64() ^ (e.mtime as u64))
	}

	/// `(handle:u64 LE, mtime:u32 LE)` per entry, concatenated. Transport
	/// format for the structure phase; order is stable within one call but
	/// not semantically meaningful.
	pub fn structure_hash(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(self.entries.len() * 12);
		for entry in self.entries.values() {
			buf.extend_from_slice(&entry.handle.as_u64().to_le_bytes());
			buf.extend_from_slice(&entry.mtime.to_le_bytes());
		}
		buf
	}

	/// Inverse of `structure_hash`: parse a wire structure buffer into
	/// `(handle, mtime)` pairs.
	pub fn parse_structure(buf: &[u8]) -> Vec<(Handle, u32)> {
		buf.chunks_exact(12)
			.map(|rec| {
				let handle = u64::from_le_bytes(rec[0..8].try_into().unwrap());
				let mtime = u32::from_le_bytes(rec[8..12].try_into().unwrap());
				(Handle(handle), mtime)
			})
			.collect()
	}

	/// Persist to `<user_id>_<root_id>.HashFileTable`-style path. Atomic via
	/// tmp-file + rename so a crash mid-write never corrupts the prior file.
	pub fn persist(&self, path: &Path) -> Result<(), ContentMapError> {
		let tmp_path = path.with_extension("tmp");
		{
			let mut file = std::fs::File::create(&tmp_path)?;
			file.write_all(&self.used_space.to_le_bytes())?;
			for entry in self.entries.values() {
				let path_bytes = entry.relative_path.as_bytes();
				file.write_all(&entry.handle.as_u64().to_le_bytes())?;
				file.write_all(&(path_bytes.len() as u16).to_le_bytes())?;
				file.write_all(path_bytes)?;
				file.write_all(&entry.mtime.to_le_bytes())?;
				file.write_all(&entry.allocated_size.to_le_bytes())?;
			}
			file.sync_all()?;
		}
		std::fs::rename(&tmp_path, path)?;
		Ok(())
	}

	/// Load from disk. On any IO error or structural corruption, the file is
	/// removed and the map restarts empty (`load_failure` is set).
	pub fn load(&mut self, path: &Path) -> Result<(), ContentMapError> {
		match self.try_load(path) {
			Ok(()) => {
				self.load_failure = false;
				Ok(())
			}
			Err(e) => {
				warn!("content map load failed, rebuilding empty: {}", e);
				let _ = std::fs::remove_file(path);
				self.entries.clear();
				self.path_index.clear();
				self.used_space = 0;
				self.load_failure = true;
				Ok(())
			}
		}
	}

	fn try_load(&mut self, path: &Path) -> Result<(), ContentMapError> {
		if !path.exists() {
			return Ok(());
		}
		let mut file = std::fs::File::open(path)?;
		let mut buf = Vec::new();
		file.read_to_end(&mut buf)?;
		if buf.len() < 8 {
			return Err(ContentMapError::Corrupt { message: "truncated header".into() });
		}
		let declared_used_space = i64::from_le_bytes(buf[0..8].try_into().unwrap());

		self.entries.clear();
		self.path_index.clear();
		self.used_space = 0;

		let mut cursor = 8usize;
		while cursor < buf.len() {
			if cursor + 10 > buf.len() {
				return Err(ContentMapError::Corrupt { message: "truncated record header".into() });
			}
			let handle = u64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap());
			let path_len = u16::from_le_bytes(buf[cursor + 8..cursor + 10].try_into().unwrap()) as usize;
			cursor += 10;
			if cursor + path_len + 12 > buf.len() {
				return Err(ContentMapError::Corrupt { message: "truncated record body".into() });
			}
			let relative_path = String::from_utf8(buf[cursor..cursor + path_len].to_vec())
				.map_err(|_| ContentMapError::Corrupt { message: "non-utf8 path".into() })?;
			cursor += path_len;
			let mtime = u32::from_le_bytes(buf[cursor..cursor + 4].try_into().unwrap());
			cursor += 4;
			let allocated_size = i64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap());
			cursor += 8;

			let kind = if mtime == 0 && allocated_size == 0 { EntryKind::Dir } else { EntryKind::File };
			let entry = Entry { handle: Handle(handle), relative_path: relative_path.clone(), mtime, allocated_size, kind };
			self.path_index.insert(relative_path, Handle(handle));
			self.entries.insert(Handle(handle), entry);
			self.used_space += allocated_size;
		}

		if self.used_space != declared_used_space {
			return Err(ContentMapError::Corrupt {
				message: format!(
					"used-space header {} disagrees with record sum {}",
					declared_used_space, self.used_space
				),
			});
		}
		Ok(())
	}

	/// Walk `cloud_root`, skipping excluded directory names and invisible
	/// entries, and replace the in-memory map with what the filesystem
	/// actually contains. Used on ICM corruption and on first run.
	pub fn rebuild_from_tree(&mut self) -> Result<(), ContentMapError> {
		self.entries.clear();
		self.path_index.clear();
		self.used_space = 0;
		let root = self.cloud_root.clone();
		self.walk(&root, "")?;
		Ok(())
	}

	fn walk(&mut self, dir: &Path, relative_prefix: &str) -> Result<(), ContentMapError> {
		let read_dir = match std::fs::read_dir(dir) {
			Ok(rd) => rd,
			Err(e) => {
				warn!("rebuild_from_tree: cannot read {}: {}", dir.display(), e);
				return Ok(());
			}
		};
		for entry in read_dir.flatten() {
			let name = entry.file_name();
			let name_str = match name.to_str() {
				Some(n) => n,
				None => continue,
			};
			let is_cloud_cache_root = relative_prefix.is_empty() && name_str == CLOUD_CACHE_DIR;
			let in_cloud_cache = relative_prefix == CLOUD_CACHE_DIR;
			if !is_cloud_cache_root && !in_cloud_cache && !is_visible_name(name_str) {
				continue;
			}
			let meta = match entry.metadata() {
				Ok(m) => m,
				Err(_) => continue,
			};
			let relative_path = if relative_prefix.is_empty() {
				name_str.to_string()
			} else {
				format!("{}/{}", relative_prefix, name_str)
			};

			if meta.is_dir() {
				if is_cloud_cache_root {
					// `.cloud_cache` itself is never indexed as a directory
					// entry; only the PDIL files directly inside it are
					// synced content. Its `tmp/` staging subdirectory and
					// anything else nested is skipped entirely below.
					self.walk(&entry.path(), &relative_path)?;
					continue;
				}
				if in_cloud_cache || is_excluded_dir(name_str) {
					continue;
				}
				let handle = Handle::derive(&relative_path, EntryKind::Dir);
				let _ = self.add(Entry {
					handle,
					relative_path: relative_path.clone(),
					mtime: 0,
					allocated_size: 0,
					kind: EntryKind::Dir,
				});
				self.walk(&entry.path(), &relative_path)?;
			} else if meta.is_file() {
				if in_cloud_cache && !is_pdil_file_name(name_str) {
					continue;
				}
				let handle = Handle::derive(&relative_path, EntryKind::File);
				let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
				let _ = self.add(Entry {
					handle,
					relative_path,
					mtime: mtime_to_u32(mtime),
					allocated_size: meta.len() as i64,
					kind: EntryKind::File,
				});
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::handle::EntryKind;
	use tempfile::tempdir;

	fn file_entry(path: &str, mtime: u32, size: i64) -> Entry {
		Entry {
			handle: Handle::derive(path, EntryKind::File),
			relative_path: path.to_string(),
			mtime,
			allocated_size: size,
			kind: EntryKind::File,
		}
	}

	#[test]
	fn used_space_tracks_sum_of_sizes() {
		let mut map = IndexedContentMap::new(PathBuf::from("/tmp"));
		map.add(file_entry("a.txt", 100, 10)).unwrap();
		map.add(file_entry("b.txt", 100, 20)).unwrap();
		assert_eq!(map.used_space(), 30);
		let h = Handle::derive("a.txt", EntryKind::File);
		map.remove(h);
		assert_eq!(map.used_space(), 20);
	}

	#[test]
	fn idempotent_add_is_a_noop_on_used_space() {
		let mut map = IndexedContentMap::new(PathBuf::from("/tmp"));
		let e = file_entry("a.txt", 100, 10);
		map.add(e.clone()).unwrap();
		map.add(e).unwrap();
		assert_eq!(map.used_space(), 10);
	}

	#[test]
	fn hidden_paths_are_rejected() {
		let mut map = IndexedContentMap::new(PathBuf::from("/tmp"));
		let result = map.add(file_entry(".hidden/a.txt", 0, 10));
		assert!(result.is_err());
	}

	#[test]
	fn pdil_file_under_cloud_cache_is_admitted() {
		let mut map = IndexedContentMap::new(PathBuf::from("/tmp"));
		let result = map.add(file_entry(".cloud_cache/bob.Deleted", 1700000000, 120));
		assert!(result.is_ok());
		assert!(map.get_by_path(".cloud_cache/bob.Deleted").is_some());
	}

	#[test]
	fn non_pdil_entries_under_cloud_cache_stay_hidden() {
		let mut map = IndexedContentMap::new(PathBuf::from("/tmp"));
		assert!(map.add(file_entry(".cloud_cache/index.HashFileTable", 1, 10)).is_err());
		assert!(map.add(file_entry(".cloud_cache/tmp/partial.bin", 1, 10)).is_err());
	}

	#[test]
	fn rebuild_from_tree_picks_up_pdil_files_but_not_cache_internals() {
		let dir = tempdir().unwrap();
		let cache_dir = dir.path().join(".cloud_cache");
		std::fs::create_dir(&cache_dir).unwrap();
		std::fs::write(cache_dir.join("bob.Deleted"), b"deleted-records").unwrap();
		std::fs::write(cache_dir.join("index.HashFileTable"), b"not synced").unwrap();
		std::fs::create_dir(cache_dir.join("tmp")).unwrap();
		std::fs::write(cache_dir.join("tmp").join("partial.bin"), b"staging").unwrap();

		let mut map = IndexedContentMap::new(dir.path().to_path_buf());
		map.rebuild_from_tree().unwrap();

		assert!(map.get_by_path(".cloud_cache/bob.Deleted").is_some());
		assert!(map.get_by_path(".cloud_cache").is_none());
		assert!(map.get_by_path(".cloud_cache/index.HashFileTable").is_none());
		assert!(map.get_by_path(".cloud_cache/tmp/partial.bin").is_none());
	}

	#[test]
	fn root_hash_is_order_independent() {
		let mut a = IndexedContentMap::new(PathBuf::from("/tmp"));
		a.add(file_entry("a.txt", 1, 1)).unwrap();
		a.add(file_entry("b.txt", 2, 2)).unwrap();

		let mut b = IndexedContentMap::new(PathBuf::from("/tmp"));
		b.add(file_entry("b.txt", 2, 2)).unwrap();
		b.add(file_entry("a.txt", 1, 1)).unwrap();

		assert_eq!(a.root_hash(), b.root_hash());
	}

	#[test]
	fn empty_map_root_hash_is_zero() {
		let map = IndexedContentMap::new(PathBuf::from("/tmp"));
		assert_eq!(map.root_hash(), 0);
	}

	#[test]
	fn structure_round_trips_through_parse() {
		let mut map = IndexedContentMap::new(PathBuf::from("/tmp"));
		map.add(file_entry("a.txt", 111, 5)).unwrap();
		map.add(file_entry("b.txt", 222, 7)).unwrap();

		let buf = map.structure_hash();
		let mut parsed = IndexedContentMap::parse_structure(&buf);
		let mut expected = map.keys_with_mtimes();
		parsed.sort();
		expected.sort();
		assert_eq!(parsed, expected);
	}

	#[test]
	fn remove_subtree_removes_nested_entries() {
		let mut map = IndexedContentMap::new(PathBuf::from("/tmp"));
		map.add(Entry {
			handle: Handle::derive("docs", EntryKind::Dir),
			relative_path: "docs".into(),
			mtime: 0,
			allocated_size: 0,
			kind: EntryKind::Dir,
		})
		.unwrap();
		map.add(file_entry("docs/a.txt", 1, 5)).unwrap();
		map.add(file_entry("other.txt", 1, 5)).unwrap();

		let removed = map.remove_subtree("docs");
		assert_eq!(removed.len(), 2);
		assert_eq!(map.len(), 1);
		assert_eq!(map.used_space(), 5);
	}

	#[test]
	fn persist_then_load_round_trips() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("user_root.HashFileTable");

		let mut map = IndexedContentMap::new(dir.path().to_path_buf());
		map.add(file_entry("a.txt", 1700000000, 2_500_000)).unwrap();
		map.add(file_entry("docs/b.txt", 42, 10)).unwrap();
		map.persist(&path).unwrap();

		let mut reloaded = IndexedContentMap::new(dir.path().to_path_buf());
		reloaded.load(&path).unwrap();
		assert!(!reloaded.load_failure());
		assert_eq!(reloaded.used_space(), map.used_space());
		assert_eq!(reloaded.root_hash(), map.root_hash());
	}

	#[test]
	fn corrupt_file_triggers_rebuild_flag_and_is_removed() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("corrupt.HashFileTable");
		std::fs::write(&path, b"not a valid table").unwrap();

		let mut map = IndexedContentMap::new(dir.path().to_path_buf());
		map.load(&path).unwrap();
		assert!(map.load_failure());
		assert!(map.is_empty());
		assert!(!path.exists());
	}
}

// vim: ts=4
