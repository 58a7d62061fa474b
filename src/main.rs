use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use syncr_core::config::{Config, Role};
use syncr_core::engine::SyncEngine;
use syncr_core::logging::{init_tracing, info, warn};
use syncr_core::session::MasterPinStore;
use syncr_core::transport::{CommandSink, Frames, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

#[derive(Parser)]
#[command(name = "syncr-core", version, about = "Peer-to-peer encrypted directory synchronizer")]
struct Cli {
	/// Path to a TOML config file; defaults to ~/.config/syncr-core/config.toml.
	#[arg(short, long)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Listen for incoming peer connections and sync `dir`.
	Serve {
		dir: PathBuf,
		#[arg(long)]
		user_id: String,
		#[arg(long, default_value = "0.0.0.0:7878")]
		listen: String,
		/// Master PIN accepted from any connecting peer.
		#[arg(long)]
		pin: String,
	},
	/// Connect to a peer and sync `dir` against it.
	Connect {
		dir: PathBuf,
		#[arg(long)]
		user_id: String,
		#[arg(long)]
		address: String,
		/// PIN to present when the peer challenges this connection.
		#[arg(long)]
		pin: String,
	},
}

/// Length-prefixed frame transport: `command:u16 LE | frame_count:u8 | (len:u32 LE, bytes)*`.
/// One outbound channel per connected peer; a reader task per socket feeds
/// decoded frames into the engine's `CommandSink`.
struct TcpTransport {
	outbound: Mutex<HashMap<String, mpsc::UnboundedSender<(u16, Frames)>>>,
}

impl TcpTransport {
	fn new() -> Self {
		TcpTransport { outbound: Mutex::new(HashMap::new()) }
	}

	async fn register(&self, peer_id: &str, socket: TcpStream) {
		let (read_half, mut write_half) = socket.into_split();
		let (tx, mut rx) = mpsc::unbounded_channel::<(u16, Frames)>();
		self.outbound.lock().await.insert(peer_id.to_string(), tx);

		tokio::spawn(async move {
			while let Some((command, frames)) = rx.recv().await {
				if write_frame(&mut write_half, command, &frames).await.is_err() {
					break;
				}
			}
		});

		let peer_id = peer_id.to_string();
		tokio::spawn(async move {
			read_loop(peer_id, read_half).await;
		});
	}
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
	async fn send(&self, peer_id: &str, command: u16, frames: Frames) -> std::io::Result<()> {
		let outbound = self.outbound.lock().await;
		match outbound.get(peer_id) {
			Some(tx) => tx
				.send((command, frames))
				.map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer channel closed")),
			None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, format!("unknown peer {}", peer_id))),
		}
	}
}

async fn write_frame(
	socket: &mut tokio::net::tcp::OwnedWriteHalf,
	command: u16,
	frames: &Frames,
) -> std::io::Result<()> {
	socket.write_all(&command.to_le_bytes()).await?;
	socket.write_all(&[frames.len() as u8]).await?;
	for frame in frames {
		socket.write_all(&(frame.len() as u32).to_le_bytes()).await?;
		socket.write_all(frame).await?;
	}
	socket.flush().await
}

/// Global registry the reader loop dispatches into, set once `main` has
/// constructed the engine. A single process runs one engine per invocation.
static ENGINE: tokio::sync::OnceCell<Arc<SyncEngine>> = tokio::sync::OnceCell::const_new();

async fn read_loop(peer_id: String, mut socket: tokio::net::tcp::OwnedReadHalf) {
	loop {
		let mut header = [0u8; 3];
		if socket.read_exact(&mut header).await.is_err() {
			break;
		}
		let command = u16::from_le_bytes([header[0], header[1]]);
		let frame_count = header[2] as usize;
		let mut frames = Vec::with_capacity(frame_count);
		let mut malformed = false;
		for _ in 0..frame_count {
			let mut len_buf = [0u8; 4];
			if socket.read_exact(&mut len_buf).await.is_err() {
				malformed = true;
				break;
			}
			let len = u32::from_le_bytes(len_buf) as usize;
			let mut buf = vec![0u8; len];
			if socket.read_exact(&mut buf).await.is_err() {
				malformed = true;
				break;
			}
			frames.push(buf);
		}
		if malformed {
			break;
		}
		if let Some(engine) = ENGINE.get() {
			engine.on_command(&peer_id, command, frames).await;
		}
	}
	warn!(peer = peer_id.as_str(), "connection closed");
}

fn config_from_args(config_path: Option<&PathBuf>, dir: PathBuf, user_id: String, role: Role) -> Config {
	let mut config = Config::load(config_path.map(|p| p.as_path())).unwrap_or_default();
	config.cloud_root = dir;
	config.user_id = user_id;
	config.role = role;
	config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	init_tracing();
	let cli = Cli::parse();
	let transport = Arc::new(TcpTransport::new());

	match cli.command {
		Commands::Serve { dir, user_id, listen, pin } => {
			let config = config_from_args(cli.config.as_ref(), dir, user_id, Role::Server);
			let engine = SyncEngine::new(config, transport.clone());
			engine.set_secret_store(Arc::new(MasterPinStore::new(Some(pin))));
			ENGINE.set(engine.clone()).ok();
			engine.start().await?;

			let listener = TcpListener::bind(&listen).await?;
			info!(listen = listen.as_str(), "listening for peers");
			loop {
				let (socket, addr) = listener.accept().await?;
				let peer_id = addr.to_string();
				info!(peer = peer_id.as_str(), "peer connected");
				transport.register(&peer_id, socket).await;
			}
		}
		Commands::Connect { dir, user_id, address, pin } => {
			let config = config_from_args(cli.config.as_ref(), dir, user_id, Role::Client);
			let engine = SyncEngine::new(config, transport.clone());
			ENGINE.set(engine.clone()).ok();
			engine.start().await?;

			let socket = TcpStream::connect(&address).await?;
			transport.register(&address, socket).await;
			engine.begin_login(&address, "syncr-core", &pin).await?;

			// keep the process alive; the reader/writer tasks and engine
			// timers run for as long as this future is pending.
			std::future::pending::<()>().await;
			Ok(())
		}
	}
}

// vim: ts=4
