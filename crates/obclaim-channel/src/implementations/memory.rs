//! In-process transport fed through an mpsc channel.

use crate::{ChannelError, ChannelTransport};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub struct MemoryTransport {
	receiver: mpsc::Receiver<String>,
}

impl MemoryTransport {
	/// Creates a transport and the sender that feeds it. Dropping the
	/// sender ends the stream.
	pub fn channel(capacity: usize) -> (mpsc::Sender<String>, Self) {
		let (sender, receiver) = mpsc::channel(capacity);
		(sender, Self { receiver })
	}
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
	async fn next_message(&mut self) -> Option<Result<String, ChannelError>> {
		self.receiver.recv().await.map(Ok)
	}

	async fn close(&mut self) -> Result<(), ChannelError> {
		self.receiver.close();
		Ok(())
	}
}
