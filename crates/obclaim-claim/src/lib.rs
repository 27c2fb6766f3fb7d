//! On-chain claim submission.
//!
//! Submits `prove_payment_and_claim` to the escrow contract and waits, for a
//! bounded time, until the network includes or rejects the transaction.

use async_trait::async_trait;
use obclaim_config::ClaimConfig;
use obclaim_types::{ClaimArguments, ProofInputs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod implementations {
	pub mod rpc;
}

pub use implementations::rpc::RpcClaimSubmitter;

#[derive(Debug, Error)]
pub enum ClaimError {
	/// Error that occurs when the relay cannot be reached.
	#[error("Network error: {0}")]
	Network(String),
	/// The relay returned a JSON-RPC error object.
	#[error("RPC error {code}: {message}")]
	Rpc { code: i64, message: String },
	/// The relay answered with a result of the wrong shape.
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
	/// The claim was mined but failed.
	#[error("Claim {hash} reverted: {status}")]
	Reverted { hash: ClaimHash, status: String },
	/// The network discarded the claim before inclusion.
	#[error("Claim {0} dropped")]
	Dropped(ClaimHash),
	/// The claim was submitted but not confirmed in time.
	#[error("Timed out after {}s waiting for claim {hash}", .timeout.as_secs())]
	Timeout { hash: ClaimHash, timeout: Duration },
	/// Submission itself used up the whole timeout.
	#[error("Timed out after {}s submitting claim", .0.as_secs())]
	SubmitTimeout(Duration),
	/// Error in the submitter configuration.
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Unknown claim implementation: {0}")]
	UnknownImplementation(String),
}

/// Transaction hash of a submitted claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimHash(pub String);

impl ClaimHash {
	/// First ten characters of the hash, for logs.
	pub fn short(&self) -> &str {
		match self.0.char_indices().nth(10) {
			Some((idx, _)) => &self.0[..idx],
			None => &self.0,
		}
	}
}

impl fmt::Display for ClaimHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Inclusion status of a submitted claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
	/// Known to the network but not yet included.
	Pending,
	/// Included and executed.
	Success,
	/// Evicted without being included.
	Dropped,
	/// Any terminal failure status reported by the network.
	Reverted(String),
}

impl TxStatus {
	pub fn parse(status: &str) -> Self {
		match status {
			"pending" => Self::Pending,
			"success" => Self::Success,
			"dropped" => Self::Dropped,
			other => Self::Reverted(other.to_string()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimReceipt {
	pub hash: ClaimHash,
	pub status: TxStatus,
	pub block_number: Option<u64>,
}

#[async_trait]
pub trait ClaimInterface: Send + Sync {
	/// Sends the claim transaction from `account`.
	async fn submit(&self, account: &str, args: &ClaimArguments)
		-> Result<ClaimHash, ClaimError>;

	/// Receipt of a submitted claim, `None` while the network does not know it.
	async fn receipt(&self, hash: &ClaimHash) -> Result<Option<ClaimReceipt>, ClaimError>;
}

/// Submits claims and waits for their inclusion.
pub struct ClaimService {
	implementation: Box<dyn ClaimInterface>,
	account: String,
	timeout: Duration,
	poll_interval: Duration,
}

impl ClaimService {
	pub fn new(
		implementation: Box<dyn ClaimInterface>,
		account: impl Into<String>,
		timeout: Duration,
		poll_interval: Duration,
	) -> Self {
		Self {
			implementation,
			account: account.into(),
			timeout,
			poll_interval,
		}
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Submits the claim for `inputs` and waits until it is included.
	///
	/// Submission and confirmation share one deadline of `timeout`.
	pub async fn claim(&self, inputs: &ProofInputs) -> Result<ClaimReceipt, ClaimError> {
		let started = tokio::time::Instant::now();
		let args = ClaimArguments::from(inputs);

		let hash = tokio::time::timeout(
			self.timeout,
			self.implementation.submit(&self.account, &args),
		)
		.await
		.map_err(|_| ClaimError::SubmitTimeout(self.timeout))??;
		info!(tx_hash = %hash.short(), timeout_secs = self.timeout.as_secs(), "Submitted claim");

		let remaining = self.timeout.saturating_sub(started.elapsed());
		match tokio::time::timeout(remaining, self.wait_for_inclusion(&hash)).await {
			Ok(result) => result,
			Err(_) => {
				warn!(tx_hash = %hash.short(), "Claim confirmation timed out");
				Err(ClaimError::Timeout {
					hash,
					timeout: self.timeout,
				})
			}
		}
	}

	async fn wait_for_inclusion(&self, hash: &ClaimHash) -> Result<ClaimReceipt, ClaimError> {
		let mut attempts = 0u32;
		loop {
			attempts += 1;
			let receipt = self.implementation.receipt(hash).await?;

			if let Some(receipt) = receipt {
				match &receipt.status {
					TxStatus::Success => {
						info!(
							tx_hash = %hash.short(),
							block = ?receipt.block_number,
							attempts,
							"Claim confirmed"
						);
						return Ok(receipt);
					}
					TxStatus::Dropped => return Err(ClaimError::Dropped(hash.clone())),
					TxStatus::Reverted(status) => {
						return Err(ClaimError::Reverted {
							hash: hash.clone(),
							status: status.clone(),
						})
					}
					TxStatus::Pending => {}
				}
			}

			debug!(tx_hash = %hash.short(), attempts, "Claim not yet included");
			tokio::time::sleep(self.poll_interval).await;
		}
	}
}

/// Creates the claim service from configuration.
///
/// Recognised implementations: `rpc`.
pub fn create_claim_service(config: &ClaimConfig) -> Result<ClaimService, ClaimError> {
	let account = config
		.config
		.get("account")
		.and_then(|v| v.as_str())
		.ok_or_else(|| ClaimError::Config("claim.config.account is required".to_string()))?
		.to_string();

	let implementation: Box<dyn ClaimInterface> = match config.implementation.as_str() {
		"rpc" => Box::new(RpcClaimSubmitter::from_config(&config.config)?),
		other => return Err(ClaimError::UnknownImplementation(other.to_string())),
	};

	Ok(ClaimService::new(
		implementation,
		account,
		config.timeout(),
		config.poll_interval(),
	))
}
