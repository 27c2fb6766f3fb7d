//! Push channel client.
//!
//! Connects once to the backend's websocket and republishes every inbound
//! message as a [`ChannelFrame`]. Consumers either follow the ordered stream
//! ([`PushChannel::subscribe`]) or just look at the most recent frame
//! ([`PushChannel::latest`]). The connection is not retried.

use async_trait::async_trait;
use chrono::Utc;
use obclaim_config::ChannelConfig;
use obclaim_types::ChannelFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod implementations {
	pub mod memory;
	pub mod websocket;
}

pub use implementations::memory::MemoryTransport;
pub use implementations::websocket::WebSocketTransport;

#[derive(Debug, Error)]
pub enum ChannelError {
	/// Error that occurs while connecting to the push endpoint.
	#[error("Connection error: {0}")]
	Connection(String),
	/// Error that occurs when the socket breaks mid-stream.
	#[error("Protocol error: {0}")]
	Protocol(String),
	/// A single frame could not be decoded. The connection stays usable.
	#[error("Invalid frame: {0}")]
	InvalidFrame(String),
	/// `start` was called on a channel that already has a reader task.
	#[error("Channel already started")]
	AlreadyStarted,
}

/// A source of raw channel messages.
#[async_trait]
pub trait ChannelTransport: Send {
	/// Waits for the next message. `None` means the peer closed the stream.
	async fn next_message(&mut self) -> Option<Result<String, ChannelError>>;

	async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Connection state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
	Connecting,
	Open,
	Closed,
}

impl ChannelStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Connecting => "connecting",
			Self::Open => "open",
			Self::Closed => "closed",
		}
	}
}

struct Shared {
	frames: broadcast::Sender<ChannelFrame>,
	latest: watch::Sender<Option<ChannelFrame>>,
	status: watch::Sender<ChannelStatus>,
	next_seq: AtomicU64,
}

struct Reader {
	handle: JoinHandle<()>,
	shutdown: oneshot::Sender<()>,
}

/// Process-wide push channel.
pub struct PushChannel {
	shared: Arc<Shared>,
	reader: Mutex<Option<Reader>>,
}

impl PushChannel {
	/// Creates an unstarted channel buffering up to `capacity` frames per
	/// subscriber.
	pub fn new(capacity: usize) -> Self {
		let (frames, _) = broadcast::channel(capacity);
		let (latest, _) = watch::channel(None);
		let (status, _) = watch::channel(ChannelStatus::Connecting);
		Self {
			shared: Arc::new(Shared {
				frames,
				latest,
				status,
				next_seq: AtomicU64::new(1),
			}),
			reader: Mutex::new(None),
		}
	}

	/// Starts reading from `transport` in a background task.
	pub async fn start<T>(&self, transport: T) -> Result<(), ChannelError>
	where
		T: ChannelTransport + 'static,
	{
		let mut reader = self.reader.lock().await;
		if reader.as_ref().is_some_and(|r| !r.handle.is_finished()) {
			return Err(ChannelError::AlreadyStarted);
		}

		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		self.shared.status.send_replace(ChannelStatus::Open);
		info!("WebSocket connected");

		let handle = tokio::spawn(read_loop(transport, shutdown_rx, self.shared.clone()));
		*reader = Some(Reader {
			handle,
			shutdown: shutdown_tx,
		});
		Ok(())
	}

	/// Ordered stream of every frame received from now on.
	pub fn subscribe(&self) -> broadcast::Receiver<ChannelFrame> {
		self.shared.frames.subscribe()
	}

	/// The most recently received frame.
	pub fn latest(&self) -> watch::Receiver<Option<ChannelFrame>> {
		self.shared.latest.subscribe()
	}

	pub fn status(&self) -> ChannelStatus {
		*self.shared.status.borrow()
	}

	pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
		self.shared.status.subscribe()
	}

	/// Closes the connection and waits for the reader to finish.
	///
	/// Stopping a channel that never started, or already stopped, is a no-op.
	pub async fn stop(&self) {
		let reader = self.reader.lock().await.take();
		if let Some(reader) = reader {
			let _ = reader.shutdown.send(());
			if let Err(e) = reader.handle.await {
				warn!(error = %e, "Push channel reader ended abnormally");
			}
		}
		self.shared.status.send_replace(ChannelStatus::Closed);
	}
}

async fn read_loop<T: ChannelTransport>(
	mut transport: T,
	mut shutdown: oneshot::Receiver<()>,
	shared: Arc<Shared>,
) {
	loop {
		tokio::select! {
			_ = &mut shutdown => {
				if let Err(e) = transport.close().await {
					warn!(error = %e, "Failed to close push channel");
				}
				break;
			}
			message = transport.next_message() => match message {
				Some(Ok(payload)) => {
					let frame = ChannelFrame {
						seq: shared.next_seq.fetch_add(1, Ordering::Relaxed),
						received_at: Utc::now(),
						payload,
					};
					debug!(seq = frame.seq, payload = %frame.payload, "Received channel message");
					let _ = shared.frames.send(frame.clone());
					shared.latest.send_replace(Some(frame));
				}
				Some(Err(ChannelError::InvalidFrame(reason))) => {
					warn!(%reason, "Dropping undecodable channel frame");
				}
				Some(Err(e)) => {
					warn!(error = %e, "WebSocket error");
					break;
				}
				None => break,
			}
		}
	}

	shared.status.send_replace(ChannelStatus::Closed);
	info!("WebSocket disconnected");
}

/// Connects to the configured websocket and starts reading from it.
///
/// The returned receiver is subscribed before the first frame can arrive.
pub async fn connect(
	config: &ChannelConfig,
) -> Result<(PushChannel, broadcast::Receiver<ChannelFrame>), ChannelError> {
	let channel = PushChannel::new(config.capacity);
	let frames = channel.subscribe();
	let transport = WebSocketTransport::connect(&config.websocket_url).await?;
	channel.start(transport).await?;
	Ok((channel, frames))
}
