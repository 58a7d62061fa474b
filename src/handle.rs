//! C1: Hash/Identity utilities.
//!
//! Stable 64-bit content handles derived from cloud-relative paths, the
//! rolling CRC used by the Chunk Transfer Engine, and timestamp conversion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use twox_hash::XxHash64;
use std::hash::Hasher;

/// Seed for directory handles. Distinct from `FILE_SEED` so the two kinds
/// never collide on the same relative path, and so the low bit of a handle
/// is a cheap (not guaranteed, but practically reliable) kind discriminant.
const DIR_SEED: u64 = 0x5A4E_0000_0000_0001;

/// Seed for file handles.
const FILE_SEED: u64 = 0xF11E_0000_0000_0000;

/// Kind of filesystem entry a handle was derived for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
	File,
	Dir,
}

/// A stable 64-bit identifier for a relative path plus kind.
///
/// `Handle::derive` is pure: the same `(relative_path, kind)` pair always
/// yields the same handle, and handles are order-independent so they can be
/// XOR-folded into a root digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl Handle {
	/// Derive a handle from a cloud-relative path and its entry kind.
	///
	/// Hashes the UTF-16LE encoding of the path (not UTF-8) seeded by a
	/// fixed per-kind constant, per the data model's `Hash64` definition.
	pub fn derive(relative_path: &str, kind: EntryKind) -> Handle {
		let seed = match kind {
			EntryKind::Dir => DIR_SEED,
			EntryKind::File => FILE_SEED,
		};
		let mut hasher = XxHash64::with_seed(seed);
		for unit in relative_path.encode_utf16() {
			hasher.write_u16(unit);
		}
		Handle(hasher.finish())
	}

	pub fn as_u64(self) -> u64 {
		self.0
	}
}

impl std::fmt::LowerHex for Handle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:016x}", self.0)
	}
}

/// Convert a `SystemTime` to the truncated unix-seconds representation used
/// throughout the data model. Directories are always represented as 0.
pub fn mtime_to_u32(time: SystemTime) -> u32 {
	time.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

pub fn u32_to_system_time(secs: u32) -> SystemTime {
	UNIX_EPOCH + std::time::Duration::from_secs(secs as u64)
}

/// Fixed seed for the chunk-transfer rolling CRC, per §4.5.
const CRC_SEED: u32 = 0x2D02_EF8D;

/// Rolling CRC accumulated across the chunks of one file transfer.
///
/// Spec.md carries this as a 64-bit wire field; the accumulator itself is a
/// standard CRC-32 (there is no 64-bit CRC in the teacher's or pack's crate
/// set), zero-extended to 64 bits for the `crc_u64` frame.
#[derive(Clone)]
pub struct RollingCrc {
	hasher: crc32fast::Hasher,
}

impl RollingCrc {
	pub fn new() -> Self {
		RollingCrc { hasher: crc32fast::Hasher::new_with_initial(CRC_SEED) }
	}

	pub fn update(&mut self, chunk: &[u8]) {
		self.hasher.update(chunk);
	}

	pub fn finish(self) -> u64 {
		self.hasher.finalize() as u64
	}

	/// Value without consuming the accumulator, for the final chunk where
	/// the cumulative CRC is reported but transfer bookkeeping continues.
	pub fn snapshot(&self) -> u64 {
		self.clone().finish()
	}
}

impl Default for RollingCrc {
	fn default() -> Self {
		Self::new()
	}
}

/// Process-wide instance counter, used only to uniquify temp-file names
/// (spec.md §6 Environment: "no global process state ... beyond a
/// process-wide instance counter").
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn next_instance_id() -> u64 {
	INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn handle_is_deterministic() {
		let a = Handle::derive("docs/a.txt", EntryKind::File);
		let b = Handle::derive("docs/a.txt", EntryKind::File);
		assert_eq!(a, b);
	}

	#[test]
	fn handle_differs_by_kind() {
		let file = Handle::derive("docs", EntryKind::File);
		let dir = Handle::derive("docs", EntryKind::Dir);
		assert_ne!(file, dir);
	}

	#[test]
	fn handle_differs_by_path() {
		let a = Handle::derive("docs/a.txt", EntryKind::File);
		let b = Handle::derive("docs/b.txt", EntryKind::File);
		assert_ne!(a, b);
	}

	#[test]
	fn rolling_crc_matches_across_chunking() {
		let data = b"the quick brown fox jumps over the lazy dog, repeated for length";
		let mut whole = RollingCrc::new();
		whole.update(data);
		let whole_crc = whole.finish();

		let mut chunked = RollingCrc::new();
		for chunk in data.chunks(7) {
			chunked.update(chunk);
		}
		assert_eq!(whole_crc, chunked.finish());
	}

	#[test]
	fn instance_ids_are_unique() {
		let a = next_instance_id();
		let b = next_instance_id();
		assert_ne!(a, b);
	}
}

// vim: ts=4
