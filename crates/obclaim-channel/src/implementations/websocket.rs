//! Websocket transport over tokio-tungstenite.

use crate::{ChannelError, ChannelTransport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub struct WebSocketTransport {
	stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketTransport {
	pub async fn connect(url: &str) -> Result<Self, ChannelError> {
		debug!(%url, "Connecting to push channel");
		let (stream, _response) = connect_async(url)
			.await
			.map_err(|e| ChannelError::Connection(e.to_string()))?;
		Ok(Self { stream })
	}
}

#[async_trait]
impl ChannelTransport for WebSocketTransport {
	async fn next_message(&mut self) -> Option<Result<String, ChannelError>> {
		loop {
			let message = match self.stream.next().await? {
				Ok(message) => message,
				Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
					return None
				}
				Err(e) => return Some(Err(ChannelError::Protocol(e.to_string()))),
			};

			match message {
				Message::Text(text) => return Some(Ok(text)),
				Message::Binary(bytes) => {
					return Some(
						String::from_utf8(bytes)
							.map_err(|e| ChannelError::InvalidFrame(e.to_string())),
					)
				}
				Message::Close(frame) => {
					debug!(?frame, "Push channel closed by peer");
					return None;
				}
				// Pongs are queued by tungstenite itself.
				Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
			}
		}
	}

	async fn close(&mut self) -> Result<(), ChannelError> {
		match self.stream.close(None).await {
			Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
				Ok(())
			}
			Err(e) => Err(ChannelError::Protocol(e.to_string())),
		}
	}
}
