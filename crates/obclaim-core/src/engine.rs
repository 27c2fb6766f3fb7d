//! The engine task.
//!
//! A single task owns the open [`PaymentSession`] and multiplexes three
//! inputs: requests from [`EngineHandle`]s, push channel frames in arrival
//! order, and completions of the effects it spawned. Session state is never
//! shared, so nothing here takes a lock.

use crate::ledger::{LedgerCommand, OrderLedger};
use crate::machine::{Command, FlowError, FlowTimings, Input, PaymentSession};
use crate::{namespaces, EngineError};
use obclaim_authorization::AuthorizationLauncher;
use obclaim_claim::ClaimService;
use obclaim_proof::ProofService;
use obclaim_storage::StorageService;
use obclaim_types::{
	format_units, ChannelFrame, CloseReason, Commitment, EventBus, FlowEvent, LedgerEntry,
	NotificationLevel, SessionId, SessionSnapshot, WalletBalance,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum EngineCommand {
	OpenSession {
		commitment: Commitment,
		reply: Reply<Result<SessionSnapshot, EngineError>>,
	},
	SetAmount {
		amount: String,
		reply: Reply<Result<SessionSnapshot, EngineError>>,
	},
	PressAction {
		reply: Reply<Result<SessionSnapshot, EngineError>>,
	},
	CloseSession {
		reply: Reply<()>,
	},
	Snapshot {
		reply: Reply<Option<SessionSnapshot>>,
	},
	Orders {
		reply: Reply<Vec<LedgerEntry>>,
	},
	Wallet {
		reply: Reply<WalletBalance>,
	},
	Shutdown {
		reply: Reply<()>,
	},
}

pub(crate) struct Components {
	pub launcher: Arc<AuthorizationLauncher>,
	pub proof: Arc<ProofService>,
	pub claim: Arc<ClaimService>,
	pub storage: Arc<StorageService>,
}

/// Tasks spawned on behalf of one session. Dropping the scope aborts them.
#[derive(Default)]
struct SessionScope {
	tasks: Vec<JoinHandle<()>>,
}

impl SessionScope {
	fn spawn<F>(&mut self, task: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		self.tasks.retain(|task| !task.is_finished());
		self.tasks.push(tokio::spawn(task));
	}
}

impl Drop for SessionScope {
	fn drop(&mut self) {
		for task in self.tasks.drain(..) {
			task.abort();
		}
	}
}

struct ActiveSession {
	session: PaymentSession,
	scope: SessionScope,
}

/// Outcome of a spawned effect, tagged with the session that spawned it.
struct Completion {
	session_id: SessionId,
	input: Input,
}

pub struct PaymentEngine {
	launcher: Arc<AuthorizationLauncher>,
	proof: Arc<ProofService>,
	claim: Arc<ClaimService>,
	storage: Arc<StorageService>,
	event_bus: EventBus,
	timings: FlowTimings,
	ledger: OrderLedger,
	wallet: WalletBalance,
	commands: mpsc::Receiver<EngineCommand>,
	completions_tx: mpsc::UnboundedSender<Completion>,
	completions_rx: mpsc::UnboundedReceiver<Completion>,
	active: Option<ActiveSession>,
}

impl PaymentEngine {
	pub(crate) fn new(
		components: Components,
		event_bus: EventBus,
		timings: FlowTimings,
		ledger: OrderLedger,
		wallet: WalletBalance,
		commands: mpsc::Receiver<EngineCommand>,
	) -> Self {
		let (completions_tx, completions_rx) = mpsc::unbounded_channel();
		Self {
			launcher: components.launcher,
			proof: components.proof,
			claim: components.claim,
			storage: components.storage,
			event_bus,
			timings,
			ledger,
			wallet,
			commands,
			completions_tx,
			completions_rx,
			active: None,
		}
	}

	pub fn event_bus(&self) -> &EventBus {
		&self.event_bus
	}

	/// Runs until shut down through a handle or until every handle is gone.
	pub async fn run(mut self, mut frames: broadcast::Receiver<ChannelFrame>) {
		info!(orders = self.ledger.open_orders().len(), "Payment engine started");
		let mut frames_open = true;

		loop {
			tokio::select! {
				command = self.commands.recv() => match command {
					Some(EngineCommand::Shutdown { reply }) => {
						self.close_session(CloseReason::Shutdown).await;
						let _ = reply.send(());
						break;
					}
					Some(command) => self.handle_command(command).await,
					None => {
						self.close_session(CloseReason::Shutdown).await;
						break;
					}
				},

				frame = frames.recv(), if frames_open => match frame {
					Ok(frame) => self.handle_frame(frame).await,
					Err(RecvError::Lagged(skipped)) => {
						warn!(skipped, "Engine fell behind the push channel");
					}
					Err(RecvError::Closed) => {
						info!("Push channel closed");
						frames_open = false;
					}
				},

				Some(completion) = self.completions_rx.recv() => {
					self.handle_completion(completion).await;
				}
			}
		}

		info!("Payment engine stopped");
	}

	async fn handle_command(&mut self, command: EngineCommand) {
		match command {
			EngineCommand::OpenSession { commitment, reply } => {
				let _ = reply.send(self.open_session(commitment).await);
			}
			EngineCommand::SetAmount { amount, reply } => {
				let _ = reply.send(self.apply_user(Input::SetAmount(amount)).await);
			}
			EngineCommand::PressAction { reply } => {
				let _ = reply.send(self.apply_user(Input::PressAction).await);
			}
			EngineCommand::CloseSession { reply } => {
				self.close_session(CloseReason::Dismissed).await;
				let _ = reply.send(());
			}
			EngineCommand::Snapshot { reply } => {
				let _ = reply.send(self.active.as_ref().map(|a| a.session.snapshot()));
			}
			EngineCommand::Orders { reply } => {
				let _ = reply.send(self.ledger.open_orders());
			}
			EngineCommand::Wallet { reply } => {
				let _ = reply.send(self.wallet);
			}
			EngineCommand::Shutdown { reply } => {
				// Handled by the run loop.
				let _ = reply.send(());
			}
		}
	}

	async fn open_session(&mut self, commitment: Commitment) -> Result<SessionSnapshot, EngineError> {
		let creditor = self
			.ledger
			.get(&commitment)
			.cloned()
			.ok_or_else(|| EngineError::UnknownCommitment(commitment.clone()))?;

		self.close_session(CloseReason::Dismissed).await;

		let session = PaymentSession::new(creditor, self.timings);
		let session_id = session.id();
		info!(
			%session_id,
			commitment = %commitment.short(),
			balance = %format_units(session.creditor().balance),
			"Opened payment session"
		);
		self.event_bus.publish(FlowEvent::SessionOpened {
			session_id,
			commitment,
		});

		let snapshot = session.snapshot();
		self.active = Some(ActiveSession {
			session,
			scope: SessionScope::default(),
		});
		Ok(snapshot)
	}

	async fn close_session(&mut self, reason: CloseReason) {
		let Some(active) = self.active.take() else {
			debug!(?reason, "No session to close");
			return;
		};
		let ActiveSession { mut session, scope } = active;
		drop(scope);

		for command in session.teardown() {
			if let Command::ClosePopup(handle) = command {
				self.launcher.close(Some(&handle)).await;
			}
		}

		let session_id = session.id();
		let snapshot = session.snapshot();
		if let Err(e) = self
			.storage
			.store(namespaces::SESSIONS, &session_id.to_string(), &snapshot)
			.await
		{
			warn!(%session_id, error = %e, "Failed to store session record");
		}

		info!(%session_id, ?reason, step = %snapshot.step, "Closed payment session");
		self.event_bus
			.publish(FlowEvent::SessionClosed { session_id, reason });
	}

	async fn apply_user(&mut self, input: Input) -> Result<SessionSnapshot, EngineError> {
		if self.active.is_none() {
			return Err(EngineError::NoSession);
		}
		if let Err(e) = self.apply(input).await {
			if matches!(e, FlowError::MissingProofInputs | FlowError::IllegalTransition { .. }) {
				error!(error = %e, "Flow invariant violated");
			}
			return Err(e.into());
		}
		self.active
			.as_ref()
			.map(|a| a.session.snapshot())
			.ok_or(EngineError::NoSession)
	}

	/// Feeds `input` to the open session and executes what it asks for.
	async fn apply(&mut self, input: Input) -> Result<(), FlowError> {
		let Some(active) = self.active.as_mut() else {
			return Ok(());
		};
		let session_id = active.session.id();
		let recorded = active.session.history().len();
		let result = active.session.handle(input);

		for transition in &active.session.history()[recorded..] {
			info!(
				%session_id,
				from = %transition.from,
				to = %transition.to,
				cause = %transition.cause,
				"Step changed"
			);
			self.event_bus.publish(FlowEvent::StepChanged {
				session_id,
				from: transition.from,
				to: transition.to,
				cause: transition.cause.clone(),
			});
		}

		let commands = result?;
		self.execute(session_id, commands).await;
		Ok(())
	}

	async fn execute(&mut self, session_id: SessionId, commands: Vec<Command>) {
		for command in commands {
			match command {
				Command::RequestAuthorization { intent, attempt } => {
					let launcher = self.launcher.clone();
					debug!(%session_id, attempt, amount = %format_units(intent.amount_units), "Requesting authorization");
					self.spawn(session_id, async move {
						let result = launcher.launch(&intent).await.map_err(|e| e.to_string());
						Input::AuthorizationCompleted { attempt, result }
					});
				}
				Command::ClosePopup(handle) => {
					self.launcher.close(Some(&handle)).await;
				}
				Command::CheckPopup {
					handle,
					attempt,
					after,
				} => {
					let launcher = self.launcher.clone();
					self.spawn(session_id, async move {
						tokio::time::sleep(after).await;
						let blank = launcher.is_blank(&handle).await;
						Input::PopupChecked {
							attempt,
							popup: handle.id,
							blank,
						}
					});
				}
				Command::PrepareProof { receipt, attempt } => {
					let proof = self.proof.clone();
					self.spawn(session_id, async move {
						let result = proof.prepare(&receipt).await.map_err(|e| e.to_string());
						Input::ProofPrepared { attempt, result }
					});
				}
				Command::StartTimer { timer, after } => {
					self.spawn(session_id, async move {
						tokio::time::sleep(after).await;
						Input::Timer(timer)
					});
				}
				Command::SubmitClaim { inputs, attempt } => {
					let claim = self.claim.clone();
					info!(%session_id, timeout_secs = claim.timeout().as_secs(), "Submitting claim");
					self.spawn(session_id, async move {
						let result = claim
							.claim(&inputs)
							.await
							.map(|receipt| {
								info!(%session_id, tx_hash = %receipt.hash.short(), "Claim included");
							})
							.map_err(|e| e.to_string());
						Input::ClaimCompleted { attempt, result }
					});
				}
				Command::CommitClaim {
					commitment,
					amount_units,
				} => {
					self.commit_claim(commitment, amount_units).await;
				}
				Command::Notify(notification) => {
					match notification.level {
						NotificationLevel::Success => {
							info!(%session_id, message = %notification.message, "Notification")
						}
						NotificationLevel::Error => {
							warn!(%session_id, message = %notification.message, "Notification")
						}
					}
					self.event_bus.publish(FlowEvent::Notified {
						session_id,
						notification,
					});
				}
				Command::Close(reason) => {
					self.close_session(reason).await;
					return;
				}
			}
		}
	}

	/// Spawns `task` in the scope of `session_id` and routes its output back
	/// to the engine.
	fn spawn<F>(&mut self, session_id: SessionId, task: F)
	where
		F: Future<Output = Input> + Send + 'static,
	{
		let Some(active) = self
			.active
			.as_mut()
			.filter(|active| active.session.id() == session_id)
		else {
			return;
		};
		let completions = self.completions_tx.clone();
		active.scope.spawn(async move {
			let input = task.await;
			let _ = completions.send(Completion { session_id, input });
		});
	}

	async fn handle_completion(&mut self, completion: Completion) {
		let current = self.active.as_ref().map(|a| a.session.id());
		if current != Some(completion.session_id) {
			debug!(session_id = %completion.session_id, "Dropping completion of a closed session");
			if let Input::AuthorizationCompleted {
				result: Ok(handle), ..
			} = completion.input
			{
				self.launcher.close(Some(&handle)).await;
			}
			return;
		}

		if let Err(e) = self.apply(completion.input).await {
			error!(session_id = %completion.session_id, error = %e, "Flow invariant violated");
		}
	}

	async fn handle_frame(&mut self, frame: ChannelFrame) {
		debug!(seq = frame.seq, payload = %frame.payload, "Channel message");
		if self.active.is_none() {
			debug!(seq = frame.seq, "No open session for channel message");
			return;
		}
		if let Err(e) = self.apply(Input::Channel(frame)).await {
			error!(error = %e, "Flow invariant violated");
		}
	}

	async fn commit_claim(&mut self, commitment: Commitment, amount: u128) {
		match LedgerCommand::debit(commitment.clone(), amount).and_then(|c| self.ledger.apply(&c)) {
			Ok(ledger) => {
				self.ledger = ledger;
				let balance = self
					.ledger
					.get(&commitment)
					.map(|e| e.balance)
					.unwrap_or_default();
				info!(
					commitment = %commitment.short(),
					balance = %format_units(balance),
					"Debited escrow position"
				);
				self.event_bus.publish(FlowEvent::LedgerUpdated {
					commitment,
					balance,
				});
			}
			Err(e) => {
				error!(commitment = %commitment.short(), error = %e, "Failed to debit escrow position");
			}
		}

		self.wallet.private = self.wallet.private.saturating_add(amount);
		info!(
			amount = %format_units(amount),
			private_balance = %format_units(self.wallet.private),
			"Credited wallet"
		);
		self.event_bus.publish(FlowEvent::WalletCredited {
			amount,
			private_balance: self.wallet.private,
		});

		self.persist().await;
	}

	async fn persist(&self) {
		if let Err(e) = self
			.storage
			.store(namespaces::LEDGER, namespaces::LEDGER_ID, &self.ledger.entries())
			.await
		{
			warn!(error = %e, "Failed to persist ledger");
		}
		if let Err(e) = self
			.storage
			.store(namespaces::WALLET, namespaces::WALLET_ID, &self.wallet)
			.await
		{
			warn!(error = %e, "Failed to persist wallet");
		}
	}
}

/// Cloneable handle for talking to a running [`PaymentEngine`].
#[derive(Clone)]
pub struct EngineHandle {
	commands: mpsc::Sender<EngineCommand>,
	event_bus: EventBus,
}

impl EngineHandle {
	pub(crate) fn new(commands: mpsc::Sender<EngineCommand>, event_bus: EventBus) -> Self {
		Self {
			commands,
			event_bus,
		}
	}

	async fn request<T>(
		&self,
		command: impl FnOnce(Reply<T>) -> EngineCommand,
	) -> Result<T, EngineError> {
		let (reply, response) = oneshot::channel();
		self.commands
			.send(command(reply))
			.await
			.map_err(|_| EngineError::Stopped)?;
		response.await.map_err(|_| EngineError::Stopped)
	}

	/// Opens a session for `commitment`, discarding any session already open.
	pub async fn open_session(&self, commitment: Commitment) -> Result<SessionSnapshot, EngineError> {
		self.request(|reply| EngineCommand::OpenSession { commitment, reply })
			.await?
	}

	pub async fn set_amount(&self, amount: impl Into<String>) -> Result<SessionSnapshot, EngineError> {
		let amount = amount.into();
		self.request(|reply| EngineCommand::SetAmount { amount, reply })
			.await?
	}

	/// Presses the session's action button.
	pub async fn press_action(&self) -> Result<SessionSnapshot, EngineError> {
		self.request(|reply| EngineCommand::PressAction { reply })
			.await?
	}

	/// Closes the open session. Closing when none is open is not an error.
	pub async fn close_session(&self) -> Result<(), EngineError> {
		self.request(|reply| EngineCommand::CloseSession { reply })
			.await
	}

	pub async fn snapshot(&self) -> Result<Option<SessionSnapshot>, EngineError> {
		self.request(|reply| EngineCommand::Snapshot { reply }).await
	}

	/// Ledger positions that still hold funds.
	pub async fn orders(&self) -> Result<Vec<LedgerEntry>, EngineError> {
		self.request(|reply| EngineCommand::Orders { reply }).await
	}

	pub async fn wallet(&self) -> Result<WalletBalance, EngineError> {
		self.request(|reply| EngineCommand::Wallet { reply }).await
	}

	pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
		self.event_bus.subscribe()
	}

	/// Closes the open session and stops the engine.
	pub async fn shutdown(&self) -> Result<(), EngineError> {
		self.request(|reply| EngineCommand::Shutdown { reply })
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::machine::{AUTHORIZATION_ERROR, CLAIM_ERROR, PAYMENT_FAILED, PROOF_ERROR};
	use crate::EngineBuilder;
	use async_trait::async_trait;
	use chrono::Utc;
	use obclaim_authorization::{AuthorizationBackend, AuthorizationError, PopupInterface};
	use obclaim_claim::{ClaimError, ClaimHash, ClaimInterface, ClaimReceipt, TxStatus};
	use obclaim_config::ConfigLoader;
	use obclaim_proof::{ProofError, ProofInterface};
	use obclaim_storage::implementations::memory::MemoryStorage;
	use obclaim_storage::{StorageError, StorageInterface};
	use obclaim_types::{
		BoundedPayload, ClaimArguments, CurrencyCode, FieldValue, FlowStep, PaymentIntent,
		PaymentReceipt, PopupGeometry, PopupHandle, ProofInputs, ScreenSize, BLANK_LOCATION,
	};
	use std::collections::HashMap;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Mutex;
	use std::time::Duration;
	use tokio::time::Instant;
	use uuid::Uuid;

	const COMMITMENT: &str = "0x0d1f6a2b9c3e";

	const CONFIG: &str = r#"
[service]

[backend]
server_url = "http://localhost:8000"

[channel]
websocket_url = "ws://localhost:8000/ws"

[claim]
implementation = "rpc"

[[ledger.entries]]
commitment = "0x0d1f6a2b9c3e"
balance = "400.35"
currency = "GBP"
sort_code = "04-00-75"

[[ledger.entries]]
commitment = "0x2a7e1c4b8d9f"
balance = "1250"
currency = "GBP"
sort_code = "20-32-06"
"#;

	const AUTHORIZED: &str = r#"{"message":"Authorization successful"}"#;
	const FAILED: &str = r#"{"message":"Payment failed"}"#;
	const INITIATED: &str = r#"{"message":"Payment initiated","paymentResponse":{"Data":{"Status":"AcceptedSettlementInProcess","DomesticPaymentId":"p-81"},"jwsSignature":"eyJhbGciOiJQUzI1NiJ9..c2ln"}}"#;

	struct StaticBackend {
		delay: Duration,
	}

	#[async_trait]
	impl AuthorizationBackend for StaticBackend {
		async fn initialize_payment(
			&self,
			intent: &PaymentIntent,
		) -> Result<String, AuthorizationError> {
			tokio::time::sleep(self.delay).await;
			Ok(format!(
				"https://bank.example/consent?e2e={}",
				intent.session_id
			))
		}
	}

	#[derive(Clone, Default)]
	struct Windows {
		open: Arc<Mutex<HashMap<Uuid, String>>>,
		opened: Arc<AtomicUsize>,
		stay_blank: bool,
	}

	impl Windows {
		fn open_count(&self) -> usize {
			self.open.lock().unwrap().len()
		}

		fn opened(&self) -> usize {
			self.opened.load(Ordering::SeqCst)
		}
	}

	#[async_trait]
	impl PopupInterface for Windows {
		async fn open(
			&self,
			url: &str,
			geometry: PopupGeometry,
		) -> Result<PopupHandle, AuthorizationError> {
			let handle = PopupHandle {
				id: Uuid::new_v4(),
				url: url.to_string(),
				geometry,
			};
			let location = if self.stay_blank {
				BLANK_LOCATION.to_string()
			} else {
				url.to_string()
			};
			self.open.lock().unwrap().insert(handle.id, location);
			self.opened.fetch_add(1, Ordering::SeqCst);
			Ok(handle)
		}

		async fn location(&self, handle: &PopupHandle) -> Option<String> {
			self.open.lock().unwrap().get(&handle.id).cloned()
		}

		async fn close(&self, handle: &PopupHandle) {
			self.open.lock().unwrap().remove(&handle.id);
		}
	}

	fn inputs() -> ProofInputs {
		ProofInputs {
			modulus_limbs: vec![FieldValue::from(11), FieldValue::from(12)],
			redc_limbs: vec![FieldValue::from(13)],
			signature_limbs: vec![FieldValue::from(14)],
			partial_hash_start: vec![FieldValue::from(1779033703)],
			header_delimiter_index: FieldValue::from(87),
			payload: BoundedPayload {
				storage: vec![FieldValue::from(123), FieldValue::from(34)],
				len: FieldValue::from(2),
			},
		}
	}

	struct FakeProof {
		fail: bool,
		delay: Duration,
		calls: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl ProofInterface for FakeProof {
		async fn prepare(&self, receipt: &PaymentReceipt) -> Result<ProofInputs, ProofError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			assert_eq!(receipt.signature, "eyJhbGciOiJQUzI1NiJ9..c2ln");
			tokio::time::sleep(self.delay).await;
			if self.fail {
				return Err(ProofError::Backend {
					status: 500,
					body: "modulus lookup failed".to_string(),
				});
			}
			Ok(inputs())
		}
	}

	struct FakeChain {
		confirm: bool,
		submissions: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl ClaimInterface for FakeChain {
		async fn submit(
			&self,
			_account: &str,
			args: &ClaimArguments,
		) -> Result<ClaimHash, ClaimError> {
			assert_eq!(args.payload_length, FieldValue::from(2));
			let n = self.submissions.fetch_add(1, Ordering::SeqCst);
			Ok(ClaimHash(format!("0x2f9ab3c4d5e6f7{:02}", n)))
		}

		async fn receipt(&self, hash: &ClaimHash) -> Result<Option<ClaimReceipt>, ClaimError> {
			if !self.confirm {
				return Ok(None);
			}
			Ok(Some(ClaimReceipt {
				hash: hash.clone(),
				status: TxStatus::Success,
				block_number: Some(4411),
			}))
		}
	}

	struct SharedStorage(Arc<MemoryStorage>);

	#[async_trait]
	impl StorageInterface for SharedStorage {
		async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
			self.0.get_bytes(key).await
		}

		async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
			self.0.set_bytes(key, value).await
		}

		async fn delete(&self, key: &str) -> Result<(), StorageError> {
			self.0.delete(key).await
		}

		async fn exists(&self, key: &str) -> Result<bool, StorageError> {
			self.0.exists(key).await
		}
	}

	#[derive(Default)]
	struct Options {
		stay_blank: bool,
		authorization_delay: Duration,
		proof_fails: bool,
		proof_delay: Duration,
		claim_never_confirms: bool,
		storage: Option<Arc<MemoryStorage>>,
	}

	struct Harness {
		handle: EngineHandle,
		frames: broadcast::Sender<ChannelFrame>,
		windows: Windows,
		proof_calls: Arc<AtomicUsize>,
		submissions: Arc<AtomicUsize>,
		storage: Arc<MemoryStorage>,
		engine: JoinHandle<()>,
		seq: u64,
	}

	impl Harness {
		async fn start(options: Options) -> Self {
			let config = ConfigLoader::new()
				.with_env_prefix("OBCLAIM_ENGINE_TEST_")
				.load_from_str(CONFIG)
				.unwrap();

			let windows = Windows {
				stay_blank: options.stay_blank,
				..Windows::default()
			};
			let launcher = AuthorizationLauncher::new(
				Box::new(StaticBackend {
					delay: options.authorization_delay,
				}),
				Box::new(windows.clone()),
				PopupGeometry::centered(
					ScreenSize {
						width: 1920,
						height: 1080,
					},
					600,
					600,
				),
			);

			let proof_calls = Arc::new(AtomicUsize::new(0));
			let proof = ProofService::new(
				Box::new(FakeProof {
					fail: options.proof_fails,
					delay: options.proof_delay,
					calls: proof_calls.clone(),
				}),
				Duration::from_secs(30),
			);

			let submissions = Arc::new(AtomicUsize::new(0));
			let claim = ClaimService::new(
				Box::new(FakeChain {
					confirm: !options.claim_never_confirms,
					submissions: submissions.clone(),
				}),
				"0xaccount",
				Duration::from_secs(60),
				Duration::from_secs(1),
			);

			let storage = options
				.storage
				.unwrap_or_else(|| Arc::new(MemoryStorage::new()));
			let (engine, handle) = EngineBuilder::new(config)
				.with_launcher(launcher)
				.with_proof_service(proof)
				.with_claim_service(claim)
				.with_storage(Box::new(SharedStorage(storage.clone())))
				.build()
				.await
				.unwrap();

			let (frames, frames_rx) = broadcast::channel(16);
			let engine = tokio::spawn(engine.run(frames_rx));

			Self {
				handle,
				frames,
				windows,
				proof_calls,
				submissions,
				storage,
				engine,
				seq: 0,
			}
		}

		fn push(&mut self, payload: &str) {
			self.seq += 1;
			self.frames
				.send(ChannelFrame {
					seq: self.seq,
					received_at: Utc::now(),
					payload: payload.to_string(),
				})
				.unwrap();
		}

		/// Polls snapshots until `predicate` holds, advancing time 1ms per poll.
		async fn wait_for(&self, predicate: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
			for _ in 0..10_000 {
				if let Some(snapshot) = self.handle.snapshot().await.unwrap() {
					if predicate(&snapshot) {
						return snapshot;
					}
				}
				tokio::time::sleep(Duration::from_millis(1)).await;
			}
			panic!("session never reached the expected state");
		}

		/// Opens a session and presses Begin and Authorize.
		async fn authorize(&self, amount: &str) -> SessionSnapshot {
			self.handle
				.open_session(Commitment::new(COMMITMENT))
				.await
				.unwrap();
			self.handle.set_amount(amount).await.unwrap();
			let begun = self.handle.press_action().await.unwrap();
			assert_eq!(begun.step, FlowStep::Authorizing);
			self.handle.press_action().await.unwrap()
		}

		async fn ready_to_claim(&mut self) -> SessionSnapshot {
			self.authorize("25.00").await;
			self.wait_for(|s| s.popup_open).await;
			self.push(AUTHORIZED);
			self.wait_for(|s| s.step == FlowStep::ProviderConfirmed).await;
			self.push(INITIATED);
			self.wait_for(|s| s.step == FlowStep::ReadyToClaim).await
		}

		fn store(&self) -> StorageService {
			StorageService::new(Box::new(SharedStorage(self.storage.clone())))
		}
	}

	async fn next_event(
		events: &mut broadcast::Receiver<FlowEvent>,
		predicate: impl Fn(&FlowEvent) -> bool,
	) -> FlowEvent {
		tokio::time::timeout(Duration::from_secs(3600), async {
			loop {
				let event = events.recv().await.unwrap();
				if predicate(&event) {
					return event;
				}
			}
		})
		.await
		.unwrap()
	}

	fn has_notification(snapshot: &SessionSnapshot, message: &str) -> bool {
		snapshot.notifications.iter().any(|n| n.message == message)
	}

	#[tokio::test(start_paused = true)]
	async fn test_successful_payment_and_claim() {
		let mut h = Harness::start(Options::default()).await;
		let mut events = h.handle.subscribe();

		let opened = h
			.handle
			.open_session(Commitment::new(COMMITMENT))
			.await
			.unwrap();
		assert_eq!(opened.step, FlowStep::Idle);
		assert_eq!(opened.title, "Prepare payment");

		h.handle.set_amount("25.00").await.unwrap();
		h.handle.press_action().await.unwrap();
		let authorizing = h.handle.press_action().await.unwrap();
		assert!(authorizing.loading);

		let snapshot = h.wait_for(|s| s.popup_open).await;
		assert!(snapshot
			.authorization_url
			.unwrap()
			.ends_with(&snapshot.id.to_string()));
		assert_eq!(h.windows.open_count(), 1);

		h.push(AUTHORIZED);
		let confirmed = h.wait_for(|s| s.step == FlowStep::ProviderConfirmed).await;
		assert!(!confirmed.popup_open);
		assert_eq!(h.windows.open_count(), 0);

		let initiated_at = Instant::now();
		h.push(INITIATED);
		h.wait_for(|s| s.step == FlowStep::PaymentInitiated).await;
		let ready = h.wait_for(|s| s.step == FlowStep::ReadyToClaim).await;
		assert!(initiated_at.elapsed() >= Duration::from_millis(2500));
		assert!(ready.proof_ready);
		assert_eq!(h.proof_calls.load(Ordering::SeqCst), 1);

		let claiming = h.handle.press_action().await.unwrap();
		assert_eq!(claiming.step, FlowStep::Claiming);

		next_event(&mut events, |e| matches!(e, FlowEvent::WalletCredited { .. })).await;
		let credited_at = Instant::now();
		let orders = h.handle.orders().await.unwrap();
		assert_eq!(orders[0].commitment, Commitment::new(COMMITMENT));
		assert_eq!(orders[0].balance, 375_350_000);
		assert_eq!(h.handle.wallet().await.unwrap().private, 25_000_000);

		let claimed = h.handle.snapshot().await.unwrap().unwrap();
		assert!(claimed.claimed);
		assert!(claimed.action.is_none());
		assert!(has_notification(&claimed, "Successfully claimed tokens"));

		let closed = next_event(&mut events, |e| {
			matches!(e, FlowEvent::SessionClosed { .. })
		})
		.await;
		assert!(matches!(
			closed,
			FlowEvent::SessionClosed {
				reason: CloseReason::Completed,
				..
			}
		));
		assert!(credited_at.elapsed() >= Duration::from_secs(2));
		assert!(h.handle.snapshot().await.unwrap().is_none());

		let store = h.store();
		let entries: Vec<LedgerEntry> = store
			.retrieve(namespaces::LEDGER, namespaces::LEDGER_ID)
			.await
			.unwrap();
		assert_eq!(entries[0].balance, 375_350_000);
		let wallet: WalletBalance = store
			.retrieve(namespaces::WALLET, namespaces::WALLET_ID)
			.await
			.unwrap();
		assert_eq!(wallet.private, 25_000_000);
		let record: SessionSnapshot = store
			.retrieve(namespaces::SESSIONS, &claimed.id.to_string())
			.await
			.unwrap();
		assert!(record.claimed);
		assert_eq!(record.history.len(), 5);
	}

	#[tokio::test(start_paused = true)]
	async fn test_payment_failed_after_confirmation_rolls_back() {
		let mut h = Harness::start(Options::default()).await;
		h.authorize("25.00").await;
		h.wait_for(|s| s.popup_open).await;
		h.push(AUTHORIZED);
		h.wait_for(|s| s.step == FlowStep::ProviderConfirmed).await;

		h.push(FAILED);
		let rolled_back = h
			.wait_for(|s| s.step == FlowStep::Authorizing && has_notification(s, PAYMENT_FAILED))
			.await;
		assert_eq!(rolled_back.amount, "25.00");
		assert!(!rolled_back.popup_open);
		assert!(!rolled_back.loading);
		assert_eq!(h.windows.open_count(), 0);

		let action = rolled_back.action.unwrap();
		assert_eq!(action.label, "Authorize Revolut");
		assert!(action.enabled);

		// Authorizing again starts a fresh attempt.
		h.handle.press_action().await.unwrap();
		h.wait_for(|s| s.popup_open).await;
		assert_eq!(h.windows.opened(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_payment_failed_while_authorizing_closes_popup() {
		let mut h = Harness::start(Options::default()).await;
		h.authorize("25.00").await;
		h.wait_for(|s| s.popup_open).await;

		h.push(FAILED);
		let snapshot = h.wait_for(|s| has_notification(s, PAYMENT_FAILED)).await;
		assert_eq!(snapshot.step, FlowStep::Authorizing);
		assert!(!snapshot.popup_open);
		assert_eq!(h.windows.open_count(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_proof_failure_stays_at_payment_initiated() {
		let mut h = Harness::start(Options {
			proof_fails: true,
			..Options::default()
		})
		.await;
		h.authorize("25.00").await;
		h.wait_for(|s| s.popup_open).await;
		h.push(AUTHORIZED);
		h.wait_for(|s| s.step == FlowStep::ProviderConfirmed).await;
		h.push(INITIATED);

		h.wait_for(|s| has_notification(s, PROOF_ERROR)).await;
		tokio::time::sleep(Duration::from_secs(5)).await;

		let snapshot = h.handle.snapshot().await.unwrap().unwrap();
		assert_eq!(snapshot.step, FlowStep::PaymentInitiated);
		assert!(!snapshot.proof_ready);
		assert!(!snapshot.action.unwrap().enabled);
		assert_eq!(h.proof_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_claim_timeout_keeps_inputs_for_retry() {
		let mut h = Harness::start(Options {
			claim_never_confirms: true,
			..Options::default()
		})
		.await;
		let mut events = h.handle.subscribe();
		h.ready_to_claim().await;

		let submitted_at = Instant::now();
		h.handle.press_action().await.unwrap();
		next_event(&mut events, |e| {
			matches!(e, FlowEvent::Notified { notification, .. } if notification.message == CLAIM_ERROR)
		})
		.await;
		assert!(submitted_at.elapsed() >= Duration::from_secs(60));

		let snapshot = h.handle.snapshot().await.unwrap().unwrap();
		assert_eq!(snapshot.step, FlowStep::Claiming);
		assert!(snapshot.proof_ready);
		assert!(!snapshot.claimed);
		let action = snapshot.action.unwrap();
		assert_eq!(action.label, "Claim tokens on Aztec");
		assert!(action.enabled);
		assert_eq!(h.handle.wallet().await.unwrap().private, 0);

		h.handle.press_action().await.unwrap();
		h.wait_for(|_| h.submissions.load(Ordering::SeqCst) == 2)
			.await;
	}

	#[tokio::test(start_paused = true)]
	async fn test_duplicate_failure_applies_once() {
		let mut h = Harness::start(Options::default()).await;
		h.authorize("25.00").await;
		h.wait_for(|s| s.popup_open).await;

		h.push(FAILED);
		h.push(FAILED);
		tokio::time::sleep(Duration::from_millis(10)).await;

		let failures = |snapshot: &SessionSnapshot| {
			snapshot
				.notifications
				.iter()
				.filter(|n| n.message == PAYMENT_FAILED)
				.count()
		};
		let snapshot = h.handle.snapshot().await.unwrap().unwrap();
		assert_eq!(failures(&snapshot), 1);

		h.handle.press_action().await.unwrap();
		h.wait_for(|s| s.popup_open).await;
		h.push(AUTHORIZED);

		let snapshot = h.wait_for(|s| s.step == FlowStep::ProviderConfirmed).await;
		assert_eq!(failures(&snapshot), 1);
		assert_eq!(h.windows.opened(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_reopen_resets_session() {
		let h = Harness::start(Options::default()).await;
		let mut events = h.handle.subscribe();
		let first = h.authorize("25.00").await;
		h.wait_for(|s| s.popup_open).await;

		let reopened = h
			.handle
			.open_session(Commitment::new(COMMITMENT))
			.await
			.unwrap();
		assert_ne!(reopened.id, first.id);
		assert_eq!(reopened.step, FlowStep::Idle);
		assert_eq!(reopened.amount, "");
		assert!(!reopened.loading);
		assert!(reopened.history.is_empty());
		assert_eq!(h.windows.open_count(), 0);

		let closed = next_event(&mut events, |e| {
			matches!(e, FlowEvent::SessionClosed { .. })
		})
		.await;
		assert_eq!(
			closed,
			FlowEvent::SessionClosed {
				session_id: first.id,
				reason: CloseReason::Dismissed
			}
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_close_is_idempotent() {
		let h = Harness::start(Options::default()).await;
		h.handle.close_session().await.unwrap();

		h.authorize("25.00").await;
		h.wait_for(|s| s.popup_open).await;
		h.handle.close_session().await.unwrap();
		h.handle.close_session().await.unwrap();

		assert!(h.handle.snapshot().await.unwrap().is_none());
		assert_eq!(h.windows.open_count(), 0);
		assert!(matches!(
			h.handle.press_action().await,
			Err(EngineError::NoSession)
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_closing_aborts_pending_authorization() {
		let h = Harness::start(Options {
			authorization_delay: Duration::from_secs(1),
			..Options::default()
		})
		.await;
		h.authorize("25.00").await;
		h.handle.close_session().await.unwrap();

		tokio::time::sleep(Duration::from_secs(5)).await;
		assert_eq!(h.windows.opened(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_stale_proof_does_not_reach_reopened_session() {
		let mut h = Harness::start(Options {
			proof_delay: Duration::from_secs(10),
			..Options::default()
		})
		.await;
		h.authorize("25.00").await;
		h.wait_for(|s| s.popup_open).await;
		h.push(AUTHORIZED);
		h.wait_for(|s| s.step == FlowStep::ProviderConfirmed).await;
		h.push(INITIATED);
		h.wait_for(|s| s.step == FlowStep::PaymentInitiated).await;
		h.wait_for(|_| h.proof_calls.load(Ordering::SeqCst) == 1).await;

		h.handle.close_session().await.unwrap();
		let reopened = h
			.handle
			.open_session(Commitment::new(COMMITMENT))
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_secs(20)).await;
		let snapshot = h.handle.snapshot().await.unwrap().unwrap();
		assert_eq!(snapshot.id, reopened.id);
		assert_eq!(snapshot.step, FlowStep::Idle);
		assert!(!snapshot.proof_ready);
		assert!(snapshot.notifications.is_empty());
		assert!(snapshot.history.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_blank_popup_reports_authorization_error() {
		let h = Harness::start(Options {
			stay_blank: true,
			..Options::default()
		})
		.await;
		h.authorize("25.00").await;
		h.wait_for(|s| s.popup_open).await;

		let snapshot = h
			.wait_for(|s| has_notification(s, AUTHORIZATION_ERROR))
			.await;
		assert_eq!(snapshot.step, FlowStep::Authorizing);
		assert!(!snapshot.popup_open);
		assert_eq!(h.windows.open_count(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_user_errors() {
		let h = Harness::start(Options::default()).await;

		assert!(matches!(
			h.handle.set_amount("1").await,
			Err(EngineError::NoSession)
		));
		assert!(matches!(
			h.handle.open_session(Commitment::new("0x99")).await,
			Err(EngineError::UnknownCommitment(_))
		));

		h.handle
			.open_session(Commitment::new(COMMITMENT))
			.await
			.unwrap();
		h.handle.set_amount("12.5x").await.unwrap();
		let rejected = h.handle.press_action().await.unwrap();
		assert_eq!(rejected.step, FlowStep::Idle);
		assert_eq!(
			rejected.input_error.as_deref(),
			Some("Amount must be a numeric value with two decimals")
		);

		h.handle.set_amount("12.50").await.unwrap();
		h.handle.press_action().await.unwrap();
		assert!(matches!(
			h.handle.set_amount("99").await,
			Err(EngineError::Flow(FlowError::AmountLocked(FlowStep::Authorizing)))
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_frames_without_session_are_ignored() {
		let mut h = Harness::start(Options::default()).await;
		h.push(AUTHORIZED);
		h.push("garbage");

		let opened = h
			.handle
			.open_session(Commitment::new(COMMITMENT))
			.await
			.unwrap();
		assert_eq!(opened.step, FlowStep::Idle);
		assert_eq!(h.handle.orders().await.unwrap().len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_ledger_restored_from_storage() {
		let storage = Arc::new(MemoryStorage::new());
		let persisted = vec![LedgerEntry {
			commitment: Commitment::new(COMMITMENT),
			balance: 10_000_000,
			currency: CurrencyCode::Gbp,
			sort_code: "04-00-75".to_string(),
		}];
		StorageService::new(Box::new(SharedStorage(storage.clone())))
			.store(namespaces::LEDGER, namespaces::LEDGER_ID, &persisted)
			.await
			.unwrap();

		let h = Harness::start(Options {
			storage: Some(storage),
			..Options::default()
		})
		.await;
		assert_eq!(h.handle.orders().await.unwrap(), persisted);

		h.handle
			.open_session(Commitment::new(COMMITMENT))
			.await
			.unwrap();
		h.handle.set_amount("25.00").await.unwrap();
		let snapshot = h.handle.press_action().await.unwrap();
		assert_eq!(snapshot.step, FlowStep::Idle);
		assert_eq!(
			snapshot.input_error.as_deref(),
			Some("Amount exceeds the creditor balance")
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_shutdown_closes_session_and_stops() {
		let h = Harness::start(Options::default()).await;
		h.authorize("25.00").await;
		h.wait_for(|s| s.popup_open).await;

		h.handle.shutdown().await.unwrap();
		h.engine.await.unwrap();

		assert_eq!(h.windows.open_count(), 0);
		assert!(matches!(h.handle.snapshot().await, Err(EngineError::Stopped)));
	}
}
