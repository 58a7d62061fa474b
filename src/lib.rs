//! # syncr-core - peer-to-peer encrypted file synchronization engine
//!
//! Indexes a directory tree into stable content handles, diffs that index
//! against a peer's, and moves the difference over a caller-supplied
//! [`transport::Transport`] in fixed-size chunks.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use syncr_core::config::Config;
//! use syncr_core::engine::SyncEngine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let engine = SyncEngine::new(config, my_transport);
//!     engine.start().await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(dead_code)]

pub mod chunk;
pub mod config;
pub mod content_map;
pub mod crypto;
pub mod deadline;
pub mod deleted_list;
pub mod engine;
pub mod error;
pub mod handle;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod spooler;
pub mod transport;
pub mod watcher;

pub use config::{Config, Role};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use handle::Handle;
pub use transport::{CommandSink, Transport};

// vim: ts=4
