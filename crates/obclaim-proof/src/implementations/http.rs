//! Proof inputs from the backend's `/noir-inputs` endpoint.

use crate::{ProofError, ProofInterface};
use async_trait::async_trait;
use obclaim_config::BackendConfig;
use obclaim_types::{PaymentReceipt, ProofInputs, ProofInputsRequest, ProofInputsResponse};

pub struct HttpProofPreparer {
	client: reqwest::Client,
	endpoint: String,
}

impl HttpProofPreparer {
	pub fn new(backend: &BackendConfig) -> Result<Self, ProofError> {
		let client = reqwest::Client::builder()
			.timeout(backend.request_timeout())
			.build()
			.map_err(|e| ProofError::Request(e.to_string()))?;

		Ok(Self {
			client,
			endpoint: format!("{}/noir-inputs", backend.server_url.trim_end_matches('/')),
		})
	}
}

#[async_trait]
impl ProofInterface for HttpProofPreparer {
	async fn prepare(&self, receipt: &PaymentReceipt) -> Result<ProofInputs, ProofError> {
		let response = self
			.client
			.post(&self.endpoint)
			.json(&ProofInputsRequest::from(receipt))
			.send()
			.await
			.map_err(|e| ProofError::Request(e.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(ProofError::Backend {
				status: status.as_u16(),
				body,
			});
		}

		let parsed: ProofInputsResponse = response
			.json()
			.await
			.map_err(|e| ProofError::InvalidResponse(e.to_string()))?;

		validate(&parsed.inputs)?;
		Ok(parsed.inputs)
	}
}

fn validate(inputs: &ProofInputs) -> Result<(), ProofError> {
	let limbs = [
		("modulus_limbs", inputs.modulus_limbs.len()),
		("redc_limbs", inputs.redc_limbs.len()),
		("signature_limbs", inputs.signature_limbs.len()),
		("payload.storage", inputs.payload.storage.len()),
	];
	match limbs.iter().find(|(_, len)| *len == 0) {
		Some((name, _)) => Err(ProofError::InvalidResponse(format!("{} is empty", name))),
		None => Ok(()),
	}
}
