//! Payment orchestration.
//!
//! [`machine`] holds the pure payment flow state machine, [`ledger`] the
//! escrow order ledger and [`engine`] the task that drives both: it owns the
//! single open session, runs the effects the machine asks for and feeds
//! their outcomes back in.

use obclaim_authorization::AuthorizationLauncher;
use obclaim_claim::ClaimService;
use obclaim_config::Config;
use obclaim_proof::ProofService;
use obclaim_storage::{StorageError, StorageInterface, StorageService};
use obclaim_types::{Commitment, EventBus, LedgerEntry, WalletBalance};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

pub mod engine;
pub mod ledger;
pub mod machine;

pub use engine::{EngineHandle, PaymentEngine};
pub use ledger::{LedgerCommand, LedgerError, OrderLedger};
pub use machine::{Command, FlowError, FlowTimings, Input, PaymentSession, Timer};

/// Storage namespaces used by the engine.
pub mod namespaces {
	pub const LEDGER: &str = "ledger";
	pub const LEDGER_ID: &str = "entries";
	pub const WALLET: &str = "wallet";
	pub const WALLET_ID: &str = "balance";
	pub const SESSIONS: &str = "sessions";
}

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("No session is open")]
	NoSession,
	#[error("Unknown commitment: {0}")]
	UnknownCommitment(Commitment),
	#[error(transparent)]
	Flow(#[from] FlowError),
	#[error(transparent)]
	Ledger(#[from] LedgerError),
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("{0} not provided")]
	MissingComponent(&'static str),
	#[error("Engine stopped")]
	Stopped,
}

/// Assembles a [`PaymentEngine`] from configuration and its collaborators.
pub struct EngineBuilder {
	config: Config,
	launcher: Option<AuthorizationLauncher>,
	proof: Option<ProofService>,
	claim: Option<ClaimService>,
	storage: Option<Box<dyn StorageInterface>>,
}

impl EngineBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			launcher: None,
			proof: None,
			claim: None,
			storage: None,
		}
	}

	pub fn with_launcher(mut self, launcher: AuthorizationLauncher) -> Self {
		self.launcher = Some(launcher);
		self
	}

	pub fn with_proof_service(mut self, proof: ProofService) -> Self {
		self.proof = Some(proof);
		self
	}

	pub fn with_claim_service(mut self, claim: ClaimService) -> Self {
		self.claim = Some(claim);
		self
	}

	pub fn with_storage(mut self, storage: Box<dyn StorageInterface>) -> Self {
		self.storage = Some(storage);
		self
	}

	/// Builds the engine and the handle used to talk to it.
	///
	/// The ledger and wallet are restored from storage when a previous run
	/// persisted them, otherwise they are seeded from configuration.
	pub async fn build(self) -> Result<(PaymentEngine, EngineHandle), EngineError> {
		let launcher = self
			.launcher
			.ok_or(EngineError::MissingComponent("Authorization launcher"))?;
		let proof = self
			.proof
			.ok_or(EngineError::MissingComponent("Proof service"))?;
		let claim = self
			.claim
			.ok_or(EngineError::MissingComponent("Claim service"))?;
		let storage = StorageService::new(
			self.storage
				.ok_or(EngineError::MissingComponent("Storage backend"))?,
		);

		let entries = match storage
			.retrieve_optional::<Vec<LedgerEntry>>(namespaces::LEDGER, namespaces::LEDGER_ID)
			.await?
		{
			Some(entries) => {
				info!(entries = entries.len(), "Restored ledger from storage");
				entries
			}
			None => self
				.config
				.ledger
				.to_entries()
				.map_err(|e| EngineError::Config(e.to_string()))?,
		};

		let wallet = match storage
			.retrieve_optional::<WalletBalance>(namespaces::WALLET, namespaces::WALLET_ID)
			.await?
		{
			Some(wallet) => wallet,
			None => self
				.config
				.wallet
				.to_balance()
				.map_err(|e| EngineError::Config(e.to_string()))?,
		};

		let timings = FlowTimings {
			popup_check: self.config.authorization.check_delay(),
			settle: self.config.flow.settle_delay(),
			auto_close: self.config.flow.auto_close_delay(),
		};
		let event_bus = EventBus::new(self.config.flow.event_capacity);
		let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);

		let engine = PaymentEngine::new(
			engine::Components {
				launcher: Arc::new(launcher),
				proof: Arc::new(proof),
				claim: Arc::new(claim),
				storage: Arc::new(storage),
			},
			event_bus.clone(),
			timings,
			OrderLedger::new(entries),
			wallet,
			command_rx,
		);
		let handle = EngineHandle::new(command_tx, event_bus);

		Ok((engine, handle))
	}
}
