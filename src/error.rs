//! Error types for syncr-core operations

use std::error::Error;
use std::fmt;
use std::io;

/// Helper to reduce `Box::new()` boilerplate when wrapping errors into a
/// `Box<dyn Error + Send + Sync>` for an error variant field.
#[inline]
pub fn boxed_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
	Box::new(e)
}

/// Errors raised by the Indexed Content Map (C2).
#[derive(Debug)]
pub enum ContentMapError {
	OutsideRoot { path: String },
	Hidden { path: String },
	Io(io::Error),
	Corrupt { message: String },
}

impl fmt::Display for ContentMapError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ContentMapError::OutsideRoot { path } => {
				write!(f, "path outside cloud root: {}", path)
			}
			ContentMapError::Hidden { path } => write!(f, "path fails visibility rules: {}", path),
			ContentMapError::Io(e) => write!(f, "content map I/O error: {}", e),
			ContentMapError::Corrupt { message } => write!(f, "content map corrupt: {}", message),
		}
	}
}

impl Error for ContentMapError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			ContentMapError::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for ContentMapError {
	fn from(e: io::Error) -> Self {
		ContentMapError::Io(e)
	}
}

/// Errors raised by the Chunk Transfer Engine (C5).
#[derive(Debug)]
pub enum ChunkError {
	Io(io::Error),
	LengthMismatch { expected: u64, actual: u64 },
	CrcMismatch { expected: u64, actual: u64 },
	DiskFull { needed: u64, available: u64 },
	OutOfOrder { expected_part: u32, got_part: u32 },
}

impl fmt::Display for ChunkError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ChunkError::Io(e) => write!(f, "chunk I/O error: {}", e),
			ChunkError::LengthMismatch { expected, actual } => {
				write!(f, "staged file length {} does not match expected {}", actual, expected)
			}
			ChunkError::CrcMismatch { expected, actual } => {
				write!(f, "crc mismatch: expected {:#x}, got {:#x}", expected, actual)
			}
			ChunkError::DiskFull { needed, available } => {
				write!(f, "disk admission failed: need {} bytes, {} available", needed, available)
			}
			ChunkError::OutOfOrder { expected_part, got_part } => {
				write!(f, "out of order chunk: expected part {}, got {}", expected_part, got_part)
			}
		}
	}
}

impl Error for ChunkError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			ChunkError::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for ChunkError {
	fn from(e: io::Error) -> Self {
		ChunkError::Io(e)
	}
}

/// Errors raised while decoding or applying protocol frames (C6).
#[derive(Debug)]
pub enum ProtocolError {
	UnknownCommand(u16),
	MalformedFrame { command: u16, message: String },
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolError::UnknownCommand(code) => write!(f, "unknown command code {}", code),
			ProtocolError::MalformedFrame { command, message } => {
				write!(f, "malformed frame for command {}: {}", command, message)
			}
		}
	}
}

impl Error for ProtocolError {}

/// Errors raised by the Session & Role Manager (C8).
#[derive(Debug)]
pub enum SessionError {
	Unauthenticated,
	ChallengeExpired,
	BadProof,
	CooldownActive { remaining_secs: u64 },
}

impl fmt::Display for SessionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SessionError::Unauthenticated => write!(f, "peer session is not authenticated"),
			SessionError::ChallengeExpired => write!(f, "authentication challenge expired"),
			SessionError::BadProof => write!(f, "authentication proof did not match"),
			SessionError::CooldownActive { remaining_secs } => {
				write!(f, "brute-force cooldown active, {} s remaining", remaining_secs)
			}
		}
	}
}

impl Error for SessionError {}

/// Errors raised by the Directory Watcher (C4).
#[derive(Debug)]
pub enum WatcherError {
	Io(io::Error),
	BackendFailed { message: String },
}

impl fmt::Display for WatcherError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			WatcherError::Io(e) => write!(f, "watcher I/O error: {}", e),
			WatcherError::BackendFailed { message } => write!(f, "watcher backend failed: {}", message),
		}
	}
}

impl Error for WatcherError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			WatcherError::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for WatcherError {
	fn from(e: io::Error) -> Self {
		WatcherError::Io(e)
	}
}

/// Top-level error type for the sync engine.
///
/// Mirrors the error kinds enumerated in the error handling design: transient
/// IO is retried below this layer and never surfaces here except as a final
/// abandonment.
#[derive(Debug)]
pub enum SyncError {
	Io(io::Error),
	InvalidConfig { message: String },
	LockFailed { message: String },
	Aborted,

	ContentMap(ContentMapError),
	Chunk(ChunkError),
	Protocol(ProtocolError),
	Session(SessionError),
	Watcher(WatcherError),
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::InvalidConfig { message } => write!(f, "invalid configuration: {}", message),
			SyncError::LockFailed { message } => write!(f, "lock failed: {}", message),
			SyncError::Aborted => write!(f, "operation aborted"),
			SyncError::ContentMap(e) => write!(f, "{}", e),
			SyncError::Chunk(e) => write!(f, "{}", e),
			SyncError::Protocol(e) => write!(f, "{}", e),
			SyncError::Session(e) => write!(f, "{}", e),
			SyncError::Watcher(e) => write!(f, "{}", e),
		}
	}
}

impl Error for SyncError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			SyncError::Io(e) => Some(e),
			SyncError::ContentMap(e) => Some(e),
			SyncError::Chunk(e) => Some(e),
			SyncError::Protocol(e) => Some(e),
			SyncError::Session(e) => Some(e),
			SyncError::Watcher(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<ContentMapError> for SyncError {
	fn from(e: ContentMapError) -> Self {
		SyncError::ContentMap(e)
	}
}

impl From<ChunkError> for SyncError {
	fn from(e: ChunkError) -> Self {
		SyncError::Chunk(e)
	}
}

impl From<ProtocolError> for SyncError {
	fn from(e: ProtocolError) -> Self {
		SyncError::Protocol(e)
	}
}

impl From<SessionError> for SyncError {
	fn from(e: SessionError) -> Self {
		SyncError::Session(e)
	}
}

impl From<WatcherError> for SyncError {
	fn from(e: WatcherError) -> Self {
		SyncError::Watcher(e)
	}
}

// vim: ts=4
