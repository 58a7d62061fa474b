//! Boundary between the sync engine and whatever carries bytes between
//! peers (TCP, TLS, a test double). Mirrors the trait-as-seam shape the
//! protocol layer itself uses one level further out.

use async_trait::async_trait;

/// A single outbound or inbound protocol frame list tagged with the command
/// code it belongs to, as laid out in spec.md §6.
pub type Frames = Vec<Vec<u8>>;

/// Implemented by whatever moves frames between peers. The sync engine
/// never opens sockets itself; it calls `send` and is called back through
/// `on_command`.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, peer_id: &str, command: u16, frames: Frames) -> std::io::Result<()>;
}

/// Implemented by the sync engine (or a test harness) to receive frames
/// dispatched by a `Transport`.
#[async_trait]
pub trait CommandSink: Send + Sync {
	async fn on_command(&self, peer_id: &str, command: u16, frames: Frames);
}


// vim: ts=4
