//! Payment session types.
//!
//! A session is one pass through the payment flow for a single counterpart
//! position. Its progress is a [`FlowStep`]; everything the user can see of
//! it is captured in a [`SessionSnapshot`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Commitment, Notification};

/// Unique identifier of a payment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	/// Form sent to the bank as `EndToEndIdentification` (32 hex digits,
	/// within the field's 35 character limit).
	pub fn correlation_key(&self) -> String {
		self.0.simple().to_string()
	}

	/// Whether an echoed correlation id refers to this session. Accepts the
	/// compact and the hyphenated form.
	pub fn matches(&self, correlation_id: &str) -> bool {
		Uuid::parse_str(correlation_id.trim()).is_ok_and(|id| id == self.0)
	}
}

impl Default for SessionId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Step of the payment flow, in the order a successful flow visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FlowStep {
	Idle,
	Authorizing,
	ProviderConfirmed,
	PaymentInitiated,
	ReadyToClaim,
	Claiming,
}

impl FlowStep {
	/// Integer tag of the step, `-1` for [`FlowStep::Idle`] through `4`.
	pub fn index(&self) -> i8 {
		match self {
			Self::Idle => -1,
			Self::Authorizing => 0,
			Self::ProviderConfirmed => 1,
			Self::PaymentInitiated => 2,
			Self::ReadyToClaim => 3,
			Self::Claiming => 4,
		}
	}

	/// Whether moving from `self` to `next` is an edge of the flow.
	///
	/// Allowed edges are each step's immediate successor and the rollback
	/// from any step up to [`FlowStep::PaymentInitiated`] back to
	/// [`FlowStep::Authorizing`].
	pub fn can_transition_to(&self, next: FlowStep) -> bool {
		next.index() == self.index() + 1
			|| (next == Self::Authorizing
				&& matches!(self, Self::ProviderConfirmed | Self::PaymentInitiated))
	}
}

impl fmt::Display for FlowStep {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Idle => "Idle",
			Self::Authorizing => "Authorizing",
			Self::ProviderConfirmed => "ProviderConfirmed",
			Self::PaymentInitiated => "PaymentInitiated",
			Self::ReadyToClaim => "ReadyToClaim",
			Self::Claiming => "Claiming",
		};
		f.write_str(name)
	}
}

/// One entry of a session's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTransition {
	pub from: FlowStep,
	pub to: FlowStep,
	pub cause: String,
	pub at: DateTime<Utc>,
}

/// The single action button of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionView {
	pub label: String,
	pub loading: bool,
	pub enabled: bool,
}

/// Progress of one checklist line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistState {
	Done,
	Current,
	Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
	pub label: String,
	pub state: ChecklistState,
}

/// Everything an observer can see of a session at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
	pub id: SessionId,
	/// Ledger entry the payment is made against
	pub commitment: Commitment,
	/// Heading shown above the flow, e.g. `Sending $25.00 dollars`
	pub title: String,
	/// Amount exactly as entered
	pub amount: String,
	pub step: FlowStep,
	/// Numeric step, `-1` before the flow begins
	pub step_index: i8,
	/// An effect for the current step is in flight
	pub loading: bool,
	/// Reason Begin was refused, cleared when the amount changes
	pub input_error: Option<String>,
	/// The single action button, absent once claimed
	pub action: Option<ActionView>,
	/// Progress lines, empty while idle
	pub checklist: Vec<ChecklistItem>,
	/// Consent URL of the current attempt
	pub authorization_url: Option<String>,
	pub popup_open: bool,
	/// Proof inputs are cached and a claim can be submitted
	pub proof_ready: bool,
	pub claimed: bool,
	/// Every step change in order
	pub history: Vec<StepTransition>,
	/// Toasts raised so far
	pub notifications: Vec<Notification>,
}
