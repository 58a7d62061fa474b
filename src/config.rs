//! Unified configuration for syncr-core.
//!
//! Priority chain, lowest to highest:
//! 1. Built-in defaults (`Config::default()`)
//! 2. Config file (`~/.config/syncr-core/config.toml`)
//! 3. Environment variables (`SYNCRC_*` prefix)
//! 4. CLI flags (applied by `main.rs` after `Config::load()`)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which side of a sync pairing this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	Client,
	Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Absolute path to the synchronized directory root.
	pub cloud_root: PathBuf,

	/// Identifier of the local user owning this replica.
	pub user_id: String,

	/// Client or Server.
	pub role: Role,

	/// Fixed chunk size used by the Chunk Transfer Engine, in bytes.
	pub chunk_size: u32,

	/// Max simultaneous active operations in the Spooler.
	pub max_concurrent_operations: usize,

	/// Cap on the Persistent Deleted-ID List, per (user, scope).
	pub pdil_cap: usize,

	/// Minimum free space the receiver must keep in reserve.
	pub min_reserve_bytes: u64,

	/// Debounce window from last filesystem event to first dispatch.
	pub pause_before_syncing_secs: u64,

	/// Periodic safety-net resync interval.
	pub periodic_sync_secs: u64,

	/// Shortened periodic resync interval after a failed cycle.
	pub periodic_sync_after_failure_secs: u64,

	/// Interval for the mount-point presence probe.
	pub mount_check_secs: u64,

	/// Listen address (server) or connect address (client); opaque to this
	/// crate, interpreted by whatever `Transport` implementation is wired in.
	pub address: Option<String>,

	/// Optional master encryption key path; absent means plain mode.
	pub master_key_path: Option<PathBuf>,

	/// Master PIN (4-8 decimal digits) accepted by the Session & Role
	/// Manager for any peer, in addition to bounded ephemeral PINs issued
	/// at runtime. Absent means no master PIN is configured.
	pub master_pin: Option<String>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			cloud_root: PathBuf::from("."),
			user_id: String::new(),
			role: Role::Client,
			chunk_size: 1_024_000,
			max_concurrent_operations: 4,
			pdil_cap: 1000,
			min_reserve_bytes: 1 << 30,
			pause_before_syncing_secs: 10,
			periodic_sync_secs: 3600,
			periodic_sync_after_failure_secs: 300,
			mount_check_secs: 30,
			address: None,
			master_key_path: None,
			master_pin: None,
		}
	}
}

impl Config {
	/// Load configuration following the priority chain: defaults, then the
	/// config file if present, then environment variable overrides.
	///
	/// CLI flags are applied on top by the caller (see `main.rs`).
	pub fn load(config_path: Option<&std::path::Path>) -> Result<Self, crate::error::SyncError> {
		let mut config = Config::default();

		let path = match config_path {
			Some(p) => Some(p.to_path_buf()),
			None => dirs_config_path(),
		};

		if let Some(path) = path {
			if path.exists() {
				let text = std::fs::read_to_string(&path)?;
				config = toml::from_str(&text).map_err(|e| crate::error::SyncError::InvalidConfig {
					message: format!("failed to parse {}: {}", path.display(), e),
				})?;
			}
		}

		config.apply_env();
		Ok(config)
	}

	fn apply_env(&mut self) {
		if let Ok(v) = std::env::var("SYNCRC_CLOUD_ROOT") {
			self.cloud_root = PathBuf::from(v);
		}
		if let Ok(v) = std::env::var("SYNCRC_USER_ID") {
			self.user_id = v;
		}
		if let Ok(v) = std::env::var("SYNCRC_ROLE") {
			self.role = match v.to_lowercase().as_str() {
				"server" => Role::Server,
				_ => Role::Client,
			};
		}
		if let Ok(v) = std::env::var("SYNCRC_CHUNK_SIZE") {
			if let Ok(n) = v.parse() {
				self.chunk_size = n;
			}
		}
		if let Ok(v) = std::env::var("SYNCRC_ADDRESS") {
			self.address = Some(v);
		}
		if let Ok(v) = std::env::var("SYNCRC_MASTER_PIN") {
			self.master_pin = Some(v);
		}
	}
}

fn dirs_config_path() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(|home| {
		PathBuf::from(home).join(".config").join("syncr-core").join("config.toml")
	})
}


// vim: ts=4
