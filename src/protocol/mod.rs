//! C6: Differential Sync Protocol — command codes and frame codec.
//!
//! The wire format is the binary command set from spec.md §6: a u16 command
//! code plus a small number of opaque byte frames. Diffing logic (root →
//! structure → chunk) lives in [`diff`]; this module only knows how to turn
//! typed [`Command`] values into frames and back.

pub mod diff;

use crate::chunk::FinalChunkMeta;
use crate::error::ProtocolError;
use crate::handle::Handle;

fn encode_utf16le(s: &str) -> Vec<u8> {
	s.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

fn decode_utf16le(bytes: &[u8]) -> Result<String, ProtocolError> {
	if bytes.len() % 2 != 0 {
		return Err(ProtocolError::MalformedFrame {
			command: 0,
			message: "utf16le frame has odd length".into(),
		});
	}
	let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
	String::from_utf16(&units)
		.map_err(|e| ProtocolError::MalformedFrame { command: 0, message: e.to_string() })
}

/// Small peer-to-peer status enumeration carried inside `Notification`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Notice {
	Authentication = 0,
	LoginSuccessful = 1,
	LoginError = 2,
	Synchronized = 3,
	LoggedOut = 4,
	FullSpace = 5,
	FullSpaceOff = 6,
	OperationCompleted = 7,
}

impl TryFrom<u8> for Notice {
	type Error = ProtocolError;
	fn try_from(v: u8) -> Result<Self, Self::Error> {
		Ok(match v {
			0 => Notice::Authentication,
			1 => Notice::LoginSuccessful,
			2 => Notice::LoginError,
			3 => Notice::Synchronized,
			4 => Notice::LoggedOut,
			5 => Notice::FullSpace,
			6 => Notice::FullSpaceOff,
			7 => Notice::OperationCompleted,
			other => {
				return Err(ProtocolError::MalformedFrame {
					command: 0,
					message: format!("unknown notice {}", other),
				})
			}
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
	Ready = 0,
	Busy = 1,
}

impl TryFrom<u8> for Status {
	type Error = ProtocolError;
	fn try_from(v: u8) -> Result<Self, Self::Error> {
		match v {
			0 => Ok(Status::Ready),
			1 => Ok(Status::Busy),
			other => {
				Err(ProtocolError::MalformedFrame { command: 11, message: format!("unknown status {}", other) })
			}
		}
	}
}

/// u16 command codes, stable ordering required across peers (spec.md §6).
pub mod code {
	pub const NOTIFICATION: u16 = 0;
	pub const REQUEST_OF_AUTHENTICATION: u16 = 1;
	pub const AUTHENTICATION: u16 = 2;
	pub const SEND_HASH_STRUCTURE: u16 = 3;
	pub const REQUEST_HASH_STRUCTURE: u16 = 4;
	pub const SEND_HASH_ROOT: u16 = 5;
	pub const REQUEST_CHUNK_FILE: u16 = 6;
	pub const SEND_CHUNK_FILE: u16 = 7;
	pub const DELETE_FILE: u16 = 8;
	pub const CREATE_DIRECTORY: u16 = 9;
	pub const DELETE_DIRECTORY: u16 = 10;
	pub const STATUS_NOTIFICATION: u16 = 11;
}

/// A typed, decoded protocol command.
#[derive(Debug, Clone)]
pub enum Command {
	Notification(Notice),
	RequestOfAuthentication { host: String, user_agent: Option<String> },
	Authentication(Vec<u8>),
	SendHashStructure(Vec<u8>),
	RequestHashStructure,
	SendHashRoot(u64),
	RequestChunkFile { handle: Handle, part: u32 },
	SendChunkFile { handle: Handle, part: u32, total: u32, data: Vec<u8>, final_meta: Option<FinalChunkMeta> },
	DeleteFile { handle: Handle, mtime: u32 },
	CreateDirectory { relative_path: String },
	DeleteDirectory { handle: Handle },
	StatusNotification(Status),
}

impl Command {
	/// Encode to the `(command_u16, frames)` shape the `Transport` trait's
	/// `send` expects.
	pub fn encode(&self) -> (u16, Vec<Vec<u8>>) {
		match self {
			Command::Notification(notice) => (code::NOTIFICATION, vec![vec![*notice as u8]]),
			Command::RequestOfAuthentication { host, user_agent } => {
				let mut frames = vec![host.as_bytes().to_vec()];
				if let Some(ua) = user_agent {
					frames.push(ua.as_bytes().to_vec());
				}
				(code::REQUEST_OF_AUTHENTICATION, frames)
			}
			Command::Authentication(bytes) => (code::AUTHENTICATION, vec![bytes.clone()]),
			Command::SendHashStructure(bytes) => (code::SEND_HASH_STRUCTURE, vec![bytes.clone()]),
			Command::RequestHashStructure => (code::REQUEST_HASH_STRUCTURE, vec![]),
			Command::SendHashRoot(root) => (code::SEND_HASH_ROOT, vec![root.to_le_bytes().to_vec()]),
			Command::RequestChunkFile { handle, part } => (
				code::REQUEST_CHUNK_FILE,
				vec![handle.as_u64().to_le_bytes().to_vec(), part.to_le_bytes().to_vec()],
			),
			Command::SendChunkFile { handle, part, total, data, final_meta } => {
				let mut frames = vec![
					handle.as_u64().to_le_bytes().to_vec(),
					part.to_le_bytes().to_vec(),
					total.to_le_bytes().to_vec(),
					data.clone(),
				];
				if let Some(meta) = final_meta {
					frames.push(meta.mtime.to_le_bytes().to_vec());
					frames.push(meta.length.to_le_bytes().to_vec());
					frames.push(encode_utf16le(&meta.relative_path));
					frames.push(meta.crc.to_le_bytes().to_vec());
				}
				(code::SEND_CHUNK_FILE, frames)
			}
			Command::DeleteFile { handle, mtime } => (
				code::DELETE_FILE,
				vec![handle.as_u64().to_le_bytes().to_vec(), mtime.to_le_bytes().to_vec()],
			),
			Command::CreateDirectory { relative_path } => {
				(code::CREATE_DIRECTORY, vec![encode_utf16le(relative_path)])
			}
			Command::DeleteDirectory { handle } => {
				(code::DELETE_DIRECTORY, vec![handle.as_u64().to_le_bytes().to_vec()])
			}
			Command::StatusNotification(status) => (code::STATUS_NOTIFICATION, vec![vec![*status as u8]]),
		}
	}

	/// Decode from a received `(command_u16, frames)` pair. Unknown commands
	/// or malformed frames return a `ProtocolError`; per spec.md §7 the
	/// caller drops these silently and increments a peer metric, it does not
	/// propagate as a fatal error.
	pub fn decode(command: u16, frames: &[Vec<u8>]) -> Result<Command, ProtocolError> {
		fn frame<'a>(frames: &'a [Vec<u8>], idx: usize, command: u16) -> Result<&'a [u8], ProtocolError> {
			frames.get(idx).map(|f| f.as_slice()).ok_or_else(|| ProtocolError::MalformedFrame {
				command,
				message: format!("missing frame {}", idx),
			})
		}
		fn u32_le(b: &[u8], command: u16) -> Result<u32, ProtocolError> {
			b.try_into()
				.map(u32::from_le_bytes)
				.map_err(|_| ProtocolError::MalformedFrame { command, message: "expected 4 bytes".into() })
		}
		fn u64_le(b: &[u8], command: u16) -> Result<u64, ProtocolError> {
			b.try_into()
				.map(u64::from_le_bytes)
				.map_err(|_| ProtocolError::MalformedFrame { command, message: "expected 8 bytes".into() })
		}

		match command {
			code::NOTIFICATION => {
				let b = frame(frames, 0, command)?;
				let notice = Notice::try_from(*b.first().ok_or(ProtocolError::MalformedFrame {
					command,
					message: "empty notice frame".into(),
				})?)?;
				Ok(Command::Notification(notice))
			}
			code::REQUEST_OF_AUTHENTICATION => {
				let host = String::from_utf8_lossy(frame(frames, 0, command)?).into_owned();
				let user_agent = frames.get(1).map(|f| String::from_utf8_lossy(f).into_owned());
				Ok(Command::RequestOfAuthentication { host, user_agent })
			}
			code::AUTHENTICATION => Ok(Command::Authentication(frame(frames, 0, command)?.to_vec())),
			code::SEND_HASH_STRUCTURE => Ok(Command::SendHashStructure(frame(frames, 0, command)?.to_vec())),
			code::REQUEST_HASH_STRUCTURE => Ok(Command::RequestHashStructure),
			code::SEND_HASH_ROOT => Ok(Command::SendHashRoot(u64_le(frame(frames, 0, command)?, command)?)),
			code::REQUEST_CHUNK_FILE => Ok(Command::RequestChunkFile {
				handle: Handle(u64_le(frame(frames, 0, command)?, command)?),
				part: u32_le(frame(frames, 1, command)?, command)?,
			}),
			code::SEND_CHUNK_FILE => {
				let handle = Handle(u64_le(frame(frames, 0, command)?, command)?);
				let part = u32_le(frame(frames, 1, command)?, command)?;
				let total = u32_le(frame(frames, 2, command)?, command)?;
				let data = frame(frames, 3, command)?.to_vec();
				let final_meta = if frames.len() > 4 {
					Some(FinalChunkMeta {
						mtime: u32_le(frame(frames, 4, command)?, command)?,
						length: u32_le(frame(frames, 5, command)?, command)?,
						relative_path: decode_utf16le(frame(frames, 6, command)?)?,
						crc: u64_le(frame(frames, 7, command)?, command)?,
					})
				} else {
					None
				};
				Ok(Command::SendChunkFile { handle, part, total, data, final_meta })
			}
			code::DELETE_FILE => Ok(Command::DeleteFile {
				handle: Handle(u64_le(frame(frames, 0, command)?, command)?),
				mtime: u32_le(frame(frames, 1, command)?, command)?,
			}),
			code::CREATE_DIRECTORY => {
				Ok(Command::CreateDirectory { relative_path: decode_utf16le(frame(frames, 0, command)?)? })
			}
			code::DELETE_DIRECTORY => {
				Ok(Command::DeleteDirectory { handle: Handle(u64_le(frame(frames, 0, command)?, command)?) })
			}
			code::STATUS_NOTIFICATION => {
				let b = frame(frames, 0, command)?;
				let status = Status::try_from(*b.first().ok_or(ProtocolError::MalformedFrame {
					command,
					message: "empty status frame".into(),
				})?)?;
				Ok(Command::StatusNotification(status))
			}
			other => Err(ProtocolError::UnknownCommand(other)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::handle::EntryKind;

	#[test]
	fn round_trips_send_hash_root() {
		let cmd = Command::SendHashRoot(0xDEAD_BEEF_CAFE_BABE);
		let (code, frames) = cmd.encode();
		let decoded = Command::decode(code, &frames).unwrap();
		match decoded {
			Command::SendHashRoot(v) => assert_eq!(v, 0xDEAD_BEEF_CAFE_BABE),
			_ => panic!("wrong variant"),
		}
	}

	#[test]
	fn round_trips_send_chunk_file_with_final_meta() {
		let handle = Handle::derive("docs/a.txt", EntryKind::File);
		let cmd = Command::SendChunkFile {
			handle,
			part: 3,
			total: 3,
			data: vec![1, 2, 3],
			final_meta: Some(FinalChunkMeta {
				mtime: 1700000000,
				length: 2_500_000,
				relative_path: "docs/a.txt".into(),
				crc: 12345,
			}),
		};
		let (code, frames) = cmd.encode();
		let decoded = Command::decode(code, &frames).unwrap();
		match decoded {
			Command::SendChunkFile { handle: h, part, total, data, final_meta } => {
				assert_eq!(h, handle);
				assert_eq!(part, 3);
				assert_eq!(total, 3);
				assert_eq!(data, vec![1, 2, 3]);
				let meta = final_meta.unwrap();
				assert_eq!(meta.relative_path, "docs/a.txt");
				assert_eq!(meta.crc, 12345);
			}
			_ => panic!("wrong variant"),
		}
	}

	#[test]
	fn unknown_command_is_reported_not_panicked() {
		let result = Command::decode(9999, &[]);
		assert!(matches!(result, Err(ProtocolError::UnknownCommand(9999))));
	}

	#[test]
	fn create_directory_round_trips_unicode_path() {
		let cmd = Command::CreateDirectory { relative_path: "déjà-vu/café".into() };
		let (code, frames) = cmd.encode();
		let decoded = Command::decode(code, &frames).unwrap();
		match decoded {
			Command::CreateDirectory { relative_path } => assert_eq!(relative_path, "déjà-vu/café"),
			_ => panic!("wrong variant"),
		}
	}
}

// vim: ts=4
