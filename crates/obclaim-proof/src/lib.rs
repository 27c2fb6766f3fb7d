//! Proof input preparation.
//!
//! Turns a signed payment receipt into the structured inputs the claim
//! circuit needs. The heavy lifting happens in the backend; this crate only
//! transports the receipt there and validates what comes back.

use async_trait::async_trait;
use obclaim_config::BackendConfig;
use obclaim_types::{PaymentReceipt, ProofInputs};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub mod implementations {
	pub mod http;
}

pub use implementations::http::HttpProofPreparer;

#[derive(Debug, Error)]
pub enum ProofError {
	/// Error that occurs when the proof backend cannot be reached.
	#[error("Request failed: {0}")]
	Request(String),
	/// The proof backend answered with a non-success status.
	#[error("Backend returned {status}: {body}")]
	Backend { status: u16, body: String },
	/// The response body did not contain well-formed inputs.
	#[error("Invalid proof inputs: {0}")]
	InvalidResponse(String),
	/// The backend did not answer within the request timeout.
	#[error("Proof preparation timed out after {0:?}")]
	Timeout(Duration),
}

#[async_trait]
pub trait ProofInterface: Send + Sync {
	async fn prepare(&self, receipt: &PaymentReceipt) -> Result<ProofInputs, ProofError>;
}

/// Bounds a [`ProofInterface`] implementation with a timeout.
pub struct ProofService {
	implementation: Box<dyn ProofInterface>,
	timeout: Duration,
}

impl ProofService {
	pub fn new(implementation: Box<dyn ProofInterface>, timeout: Duration) -> Self {
		Self {
			implementation,
			timeout,
		}
	}

	pub async fn prepare(&self, receipt: &PaymentReceipt) -> Result<ProofInputs, ProofError> {
		debug!(payload_bytes = receipt.raw_payload.len(), "Preparing proof inputs");
		match tokio::time::timeout(self.timeout, self.implementation.prepare(receipt)).await {
			Ok(result) => result,
			Err(_) => {
				warn!(timeout = ?self.timeout, "Proof preparation timed out");
				Err(ProofError::Timeout(self.timeout))
			}
		}
	}
}

/// Creates the proof service talking to the configured backend.
pub fn create_proof_service(backend: &BackendConfig) -> Result<ProofService, ProofError> {
	let preparer = HttpProofPreparer::new(backend)?;
	Ok(ProofService::new(
		Box::new(preparer),
		backend.request_timeout(),
	))
}
