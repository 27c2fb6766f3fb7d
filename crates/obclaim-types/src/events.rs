//! Flow events and the bus they travel on.
//!
//! The orchestrator publishes every visible state change as a [`FlowEvent`]
//! so that the service layer, loggers and tests can follow a session
//! without reaching into it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{Commitment, FlowStep, SessionId};

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
	Success,
	Error,
}

/// A message shown to the user, the equivalent of a toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
	pub level: NotificationLevel,
	pub message: String,
	pub at: DateTime<Utc>,
}

impl Notification {
	pub fn success(message: impl Into<String>) -> Self {
		Self {
			level: NotificationLevel::Success,
			message: message.into(),
			at: Utc::now(),
		}
	}

	pub fn error(message: impl Into<String>) -> Self {
		Self {
			level: NotificationLevel::Error,
			message: message.into(),
			at: Utc::now(),
		}
	}
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
	/// Closed by the user, or replaced by a newly opened session.
	Dismissed,
	/// Closed automatically after a confirmed claim.
	Completed,
	/// Closed because the engine is shutting down.
	Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
	SessionOpened {
		session_id: SessionId,
		commitment: Commitment,
	},
	StepChanged {
		session_id: SessionId,
		from: FlowStep,
		to: FlowStep,
		cause: String,
	},
	Notified {
		session_id: SessionId,
		notification: Notification,
	},
	LedgerUpdated {
		commitment: Commitment,
		balance: u128,
	},
	WalletCredited {
		amount: u128,
		private_balance: u128,
	},
	SessionClosed {
		session_id: SessionId,
		reason: CloseReason,
	},
}

/// Broadcast bus for [`FlowEvent`]s.
///
/// Publishing never blocks. Subscribers that fall behind by more than the
/// channel capacity lose the oldest events.
pub struct EventBus {
	sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Subscribes to all events published from now on.
	pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
		self.sender.subscribe()
	}

	/// Publishes an event. Having no subscribers is not an error here.
	pub fn publish(&self, event: FlowEvent) {
		let _ = self.sender.send(event);
	}
}

impl Clone for EventBus {
	fn clone(&self) -> Self {
		Self {
			sender: self.sender.clone(),
		}
	}
}
