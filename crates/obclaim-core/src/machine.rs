//! The payment flow state machine.
//!
//! [`PaymentSession`] is pure: it never performs I/O. Every input, including
//! the completion of an effect and the expiry of a timer, is fed to
//! [`PaymentSession::handle`], which updates the session and returns the
//! [`Command`]s the engine must execute. Effects carry the session's
//! `attempt` so that a completion belonging to an abandoned attempt can be
//! recognised and dropped.

use chrono::Utc;
use obclaim_types::{
	parse_transfer_amount, ActionView, AmountError, ChannelFrame, ChannelMessage, ChecklistItem,
	ChecklistState, CloseReason, Commitment, FlowStep, LedgerEntry, Notification, PaymentIntent,
	PaymentReceipt, PopupHandle, ProofInputs, SessionId, SessionSnapshot, StepTransition,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const AUTHORIZATION_ERROR: &str = "Error processing authorization";
pub const PAYMENT_FAILED: &str = "Payment failed";
pub const PROOF_ERROR: &str = "Error preparing payment proof";
pub const CLAIM_ERROR: &str = "Error claiming tokens";
pub const CLAIM_SUCCESS: &str = "Successfully claimed tokens";

const INVALID_AMOUNT: &str = "Amount must be a numeric value with two decimals";
const AMOUNT_EXCEEDS_BALANCE: &str = "Amount exceeds the creditor balance";

const CHECKLIST: [&str; 4] = [
	"Authorize Revolut",
	"Initiating Payment on Revolut",
	"Payment sent. Awaiting confirmation",
	"Prove Payment on Aztec",
];

/// Errors returned when an input does not fit the session's state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
	/// Claim pressed before proof inputs were cached.
	#[error("Claim requested without proof inputs")]
	MissingProofInputs,
	/// The amount was changed after Begin.
	#[error("Amount can only be changed before the flow begins (step {0})")]
	AmountLocked(FlowStep),
	/// The amount could not be turned into ledger units.
	#[error("Invalid amount: {0}")]
	InvalidAmount(#[from] AmountError),
	/// A transition outside the flow's edges was attempted.
	#[error("Illegal transition from {from} to {to}")]
	IllegalTransition { from: FlowStep, to: FlowStep },
}

/// Delays the machine schedules for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTimings {
	/// Wait before checking that the popup left the blank page.
	pub popup_check: Duration,
	/// Provider settlement latency after `Payment initiated`.
	pub settle: Duration,
	/// Wait before a claimed session closes itself.
	pub auto_close: Duration,
}

impl Default for FlowTimings {
	fn default() -> Self {
		Self {
			popup_check: Duration::from_millis(2000),
			settle: Duration::from_millis(2500),
			auto_close: Duration::from_millis(2500),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
	Settlement { attempt: u32 },
	AutoClose,
}

/// Everything that can happen to a session.
#[derive(Debug, Clone)]
pub enum Input {
	SetAmount(String),
	PressAction,
	Channel(ChannelFrame),
	AuthorizationCompleted {
		attempt: u32,
		result: Result<PopupHandle, String>,
	},
	PopupChecked {
		attempt: u32,
		popup: Uuid,
		blank: bool,
	},
	ProofPrepared {
		attempt: u32,
		result: Result<ProofInputs, String>,
	},
	ClaimCompleted {
		attempt: u32,
		result: Result<(), String>,
	},
	Timer(Timer),
}

/// Effects requested by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
	RequestAuthorization {
		intent: PaymentIntent,
		attempt: u32,
	},
	ClosePopup(PopupHandle),
	/// Report whether `handle` is still blank once `after` has passed.
	CheckPopup {
		handle: PopupHandle,
		attempt: u32,
		after: Duration,
	},
	PrepareProof {
		receipt: PaymentReceipt,
		attempt: u32,
	},
	StartTimer {
		timer: Timer,
		after: Duration,
	},
	SubmitClaim {
		inputs: ProofInputs,
		attempt: u32,
	},
	/// Debit the escrow position and credit the wallet by `amount_units`.
	CommitClaim {
		commitment: Commitment,
		amount_units: u128,
	},
	Notify(Notification),
	Close(CloseReason),
}

/// One pass through the payment flow for a single ledger entry.
#[derive(Debug, Clone)]
pub struct PaymentSession {
	id: SessionId,
	creditor: LedgerEntry,
	timings: FlowTimings,
	amount: String,
	step: FlowStep,
	loading: bool,
	input_error: Option<String>,
	popup: Option<PopupHandle>,
	authorization_url: Option<String>,
	proof_inputs: Option<ProofInputs>,
	last_applied: Option<String>,
	attempt: u32,
	settled: bool,
	claimed: bool,
	history: Vec<StepTransition>,
	notifications: Vec<Notification>,
}

impl PaymentSession {
	pub fn new(creditor: LedgerEntry, timings: FlowTimings) -> Self {
		Self {
			id: SessionId::new(),
			creditor,
			timings,
			amount: String::new(),
			step: FlowStep::Idle,
			loading: false,
			input_error: None,
			popup: None,
			authorization_url: None,
			proof_inputs: None,
			last_applied: None,
			attempt: 0,
			settled: false,
			claimed: false,
			history: Vec::new(),
			notifications: Vec::new(),
		}
	}

	pub fn id(&self) -> SessionId {
		self.id
	}

	pub fn step(&self) -> FlowStep {
		self.step
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	pub fn amount(&self) -> &str {
		&self.amount
	}

	pub fn creditor(&self) -> &LedgerEntry {
		&self.creditor
	}

	pub fn popup(&self) -> Option<&PopupHandle> {
		self.popup.as_ref()
	}

	pub fn proof_inputs(&self) -> Option<&ProofInputs> {
		self.proof_inputs.as_ref()
	}

	pub fn history(&self) -> &[StepTransition] {
		&self.history
	}

	pub fn notifications(&self) -> &[Notification] {
		&self.notifications
	}

	pub fn is_claimed(&self) -> bool {
		self.claimed
	}

	/// Applies one input and returns the effects to execute, in order.
	pub fn handle(&mut self, input: Input) -> Result<Vec<Command>, FlowError> {
		match input {
			Input::SetAmount(amount) => self.set_amount(amount),
			Input::PressAction => self.press_action(),
			Input::Channel(frame) => self.on_frame(frame),
			Input::AuthorizationCompleted { attempt, result } => {
				Ok(self.on_authorization(attempt, result))
			}
			Input::PopupChecked {
				attempt,
				popup,
				blank,
			} => Ok(self.on_popup_checked(attempt, popup, blank)),
			Input::ProofPrepared { attempt, result } => self.on_proof(attempt, result),
			Input::ClaimCompleted { attempt, result } => self.on_claim(attempt, result),
			Input::Timer(timer) => self.on_timer(timer),
		}
	}

	/// Effects that release what the session still holds when it is discarded.
	pub fn teardown(&mut self) -> Vec<Command> {
		self.popup.take().map(Command::ClosePopup).into_iter().collect()
	}

	fn set_amount(&mut self, amount: String) -> Result<Vec<Command>, FlowError> {
		if self.step != FlowStep::Idle {
			return Err(FlowError::AmountLocked(self.step));
		}
		self.amount = amount;
		self.input_error = None;
		Ok(Vec::new())
	}

	fn press_action(&mut self) -> Result<Vec<Command>, FlowError> {
		let enabled = self.action().is_some_and(|action| action.enabled);
		if !enabled {
			debug!(session_id = %self.id, step = %self.step, "Ignoring press on disabled action");
			return Ok(Vec::new());
		}

		match self.step {
			FlowStep::Idle => {
				let units = match parse_transfer_amount(&self.amount) {
					Ok(units) => units,
					Err(e) => {
						debug!(session_id = %self.id, error = %e, "Rejected amount");
						self.input_error = Some(INVALID_AMOUNT.to_string());
						return Ok(Vec::new());
					}
				};
				if units > self.creditor.balance {
					self.input_error = Some(AMOUNT_EXCEEDS_BALANCE.to_string());
					return Ok(Vec::new());
				}
				self.input_error = None;
				self.transition(FlowStep::Authorizing, "begin payment flow")?;
				Ok(Vec::new())
			}
			FlowStep::Authorizing => {
				let amount_units = parse_transfer_amount(&self.amount)?;
				let mut commands = self.teardown();
				// A retry after `Payment failed` may legitimately repeat it.
				self.last_applied = None;
				self.loading = true;
				commands.push(Command::RequestAuthorization {
					intent: PaymentIntent {
						session_id: self.id,
						creditor: self.creditor.clone(),
						amount_units,
					},
					attempt: self.attempt,
				});
				Ok(commands)
			}
			FlowStep::ReadyToClaim | FlowStep::Claiming => {
				let inputs = self
					.proof_inputs
					.clone()
					.ok_or(FlowError::MissingProofInputs)?;
				if self.step == FlowStep::ReadyToClaim {
					self.transition(FlowStep::Claiming, "claim submitted")?;
				}
				self.loading = true;
				Ok(vec![Command::SubmitClaim {
					inputs,
					attempt: self.attempt,
				}])
			}
			FlowStep::ProviderConfirmed | FlowStep::PaymentInitiated => Ok(Vec::new()),
		}
	}

	fn on_frame(&mut self, frame: ChannelFrame) -> Result<Vec<Command>, FlowError> {
		if self.last_applied.as_deref() == Some(frame.payload.as_str()) {
			debug!(session_id = %self.id, seq = frame.seq, "Ignoring repeated channel message");
			return Ok(Vec::new());
		}

		let message = match ChannelMessage::parse(&frame.payload) {
			Ok(message) => message,
			Err(e) => {
				warn!(session_id = %self.id, seq = frame.seq, error = %e, "Ignoring malformed channel message");
				return Ok(Vec::new());
			}
		};

		if let Some(correlation_id) = message.correlation_id() {
			if !self.id.matches(correlation_id) {
				debug!(session_id = %self.id, %correlation_id, "Ignoring message for another session");
				return Ok(Vec::new());
			}
		}

		let commands = match (&message, self.step) {
			(ChannelMessage::AuthorizationSuccessful { .. }, FlowStep::Authorizing) => {
				self.transition(FlowStep::ProviderConfirmed, message.kind())?;
				self.teardown()
			}
			(ChannelMessage::PaymentInitiated { payment_response, .. }, FlowStep::ProviderConfirmed) => {
				let receipt = match payment_response.receipt() {
					Ok(receipt) => receipt,
					Err(e) => {
						warn!(session_id = %self.id, error = %e, "Ignoring unusable payment response");
						return Ok(Vec::new());
					}
				};
				self.transition(FlowStep::PaymentInitiated, message.kind())?;
				self.settled = false;
				self.proof_inputs = None;
				vec![
					Command::PrepareProof {
						receipt,
						attempt: self.attempt,
					},
					Command::StartTimer {
						timer: Timer::Settlement {
							attempt: self.attempt,
						},
						after: self.timings.settle,
					},
				]
			}
			(
				ChannelMessage::PaymentFailed { .. },
				FlowStep::Authorizing | FlowStep::ProviderConfirmed | FlowStep::PaymentInitiated,
			) => {
				let mut commands = self.teardown();
				if self.step != FlowStep::Authorizing {
					self.transition(FlowStep::Authorizing, message.kind())?;
				}
				self.attempt += 1;
				self.loading = false;
				self.settled = false;
				self.proof_inputs = None;
				commands.push(self.notify(Notification::error(PAYMENT_FAILED)));
				commands
			}
			(ChannelMessage::Unknown, _) => {
				debug!(session_id = %self.id, "Ignoring unknown channel message");
				return Ok(Vec::new());
			}
			(_, step) => {
				debug!(session_id = %self.id, message = message.kind(), %step, "Channel message does not apply at this step");
				return Ok(Vec::new());
			}
		};

		self.last_applied = Some(frame.payload);
		Ok(commands)
	}

	fn on_authorization(&mut self, attempt: u32, result: Result<PopupHandle, String>) -> Vec<Command> {
		if attempt != self.attempt {
			return result.map(Command::ClosePopup).into_iter().collect();
		}
		self.loading = false;

		match result {
			Err(e) => {
				warn!(session_id = %self.id, error = %e, "Authorization failed");
				if self.step == FlowStep::Authorizing {
					vec![self.notify(Notification::error(AUTHORIZATION_ERROR))]
				} else {
					Vec::new()
				}
			}
			Ok(handle) if self.step == FlowStep::Authorizing => {
				self.authorization_url = Some(handle.url.clone());
				self.popup = Some(handle.clone());
				vec![Command::CheckPopup {
					handle,
					attempt,
					after: self.timings.popup_check,
				}]
			}
			// The provider confirmed before the popup was even reported open.
			Ok(handle) => vec![Command::ClosePopup(handle)],
		}
	}

	fn on_popup_checked(&mut self, attempt: u32, popup: Uuid, blank: bool) -> Vec<Command> {
		let current = self.popup.as_ref().map(|handle| handle.id);
		if attempt != self.attempt || current != Some(popup) || !blank {
			return Vec::new();
		}
		if self.step != FlowStep::Authorizing {
			return Vec::new();
		}

		warn!(session_id = %self.id, "Authorization popup never left the blank page");
		let mut commands = self.teardown();
		commands.push(self.notify(Notification::error(AUTHORIZATION_ERROR)));
		commands
	}

	fn on_proof(
		&mut self,
		attempt: u32,
		result: Result<ProofInputs, String>,
	) -> Result<Vec<Command>, FlowError> {
		if attempt != self.attempt || self.step != FlowStep::PaymentInitiated {
			return Ok(Vec::new());
		}

		match result {
			Ok(inputs) => {
				self.proof_inputs = Some(inputs);
				self.advance_when_ready()?;
				Ok(Vec::new())
			}
			Err(e) => {
				warn!(session_id = %self.id, error = %e, "Proof preparation failed");
				Ok(vec![self.notify(Notification::error(PROOF_ERROR))])
			}
		}
	}

	fn on_claim(&mut self, attempt: u32, result: Result<(), String>) -> Result<Vec<Command>, FlowError> {
		if attempt != self.attempt || self.step != FlowStep::Claiming || self.claimed {
			return Ok(Vec::new());
		}
		self.loading = false;

		match result {
			Ok(()) => {
				let amount_units = parse_transfer_amount(&self.amount)?;
				self.claimed = true;
				Ok(vec![
					Command::CommitClaim {
						commitment: self.creditor.commitment.clone(),
						amount_units,
					},
					self.notify(Notification::success(CLAIM_SUCCESS)),
					Command::StartTimer {
						timer: Timer::AutoClose,
						after: self.timings.auto_close,
					},
				])
			}
			Err(e) => {
				warn!(session_id = %self.id, error = %e, "Claim failed");
				Ok(vec![self.notify(Notification::error(CLAIM_ERROR))])
			}
		}
	}

	fn on_timer(&mut self, timer: Timer) -> Result<Vec<Command>, FlowError> {
		match timer {
			Timer::Settlement { attempt } => {
				if attempt == self.attempt && self.step == FlowStep::PaymentInitiated {
					self.settled = true;
					self.advance_when_ready()?;
				}
				Ok(Vec::new())
			}
			Timer::AutoClose if self.claimed => Ok(vec![Command::Close(CloseReason::Completed)]),
			Timer::AutoClose => Ok(Vec::new()),
		}
	}

	fn advance_when_ready(&mut self) -> Result<(), FlowError> {
		if self.step == FlowStep::PaymentInitiated && self.settled && self.proof_inputs.is_some() {
			self.transition(FlowStep::ReadyToClaim, "payment settled")?;
		}
		Ok(())
	}

	fn transition(&mut self, to: FlowStep, cause: &str) -> Result<(), FlowError> {
		if !self.step.can_transition_to(to) {
			return Err(FlowError::IllegalTransition {
				from: self.step,
				to,
			});
		}
		self.history.push(StepTransition {
			from: self.step,
			to,
			cause: cause.to_string(),
			at: Utc::now(),
		});
		self.step = to;
		Ok(())
	}

	fn notify(&mut self, notification: Notification) -> Command {
		self.notifications.push(notification.clone());
		Command::Notify(notification)
	}

	/// The action button, `None` once the claim is confirmed.
	pub fn action(&self) -> Option<ActionView> {
		if self.claimed {
			return None;
		}
		let has_amount = !self.amount.trim().is_empty();
		let (label, loading, enabled) = match self.step {
			FlowStep::Idle => ("Begin Payment Flow", self.loading, has_amount && !self.loading),
			FlowStep::Authorizing => ("Authorize Revolut", self.loading, has_amount && !self.loading),
			FlowStep::ProviderConfirmed => ("Initiating Payment...", true, false),
			FlowStep::PaymentInitiated => ("Confirming payment...", true, false),
			FlowStep::ReadyToClaim | FlowStep::Claiming if self.loading => {
				("Claiming tokens", true, false)
			}
			FlowStep::ReadyToClaim | FlowStep::Claiming => ("Claim tokens on Aztec", false, true),
		};
		Some(ActionView {
			label: label.to_string(),
			loading,
			enabled,
		})
	}

	pub fn title(&self) -> String {
		match self.step {
			FlowStep::Idle => "Prepare payment".to_string(),
			_ => format!("Sending ${} dollars", self.amount),
		}
	}

	/// Progress lines, empty before the flow begins.
	pub fn checklist(&self) -> Vec<ChecklistItem> {
		if self.step == FlowStep::Idle {
			return Vec::new();
		}
		let current = self.step.index();
		CHECKLIST
			.iter()
			.zip(0i8..)
			.map(|(label, index)| ChecklistItem {
				label: label.to_string(),
				state: if index < current {
					ChecklistState::Done
				} else if index == current {
					ChecklistState::Current
				} else {
					ChecklistState::Pending
				},
			})
			.collect()
	}

	pub fn snapshot(&self) -> SessionSnapshot {
		SessionSnapshot {
			id: self.id,
			commitment: self.creditor.commitment.clone(),
			title: self.title(),
			amount: self.amount.clone(),
			step: self.step,
			step_index: self.step.index(),
			loading: self.loading,
			input_error: self.input_error.clone(),
			action: self.action(),
			checklist: self.checklist(),
			authorization_url: self.authorization_url.clone(),
			popup_open: self.popup.is_some(),
			proof_ready: self.proof_inputs.is_some(),
			claimed: self.claimed,
			history: self.history.clone(),
			notifications: self.notifications.clone(),
		}
	}
}
