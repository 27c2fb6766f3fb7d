//! Proof input types.
//!
//! These mirror the structured numeric material the input backend derives
//! from a signed payment receipt, and the parameter struct the escrow
//! contract's claim entrypoint expects.

use serde::{Deserialize, Serialize};

/// Signed payment receipt as received from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
	/// JSON-encoded receipt body the signature covers.
	pub raw_payload: String,
	/// Detached provider signature.
	pub signature: String,
}

/// A single circuit input value.
///
/// The backend emits limbs either as JSON numbers or as (hex or decimal)
/// strings; both are kept exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
	Number(serde_json::Number),
	Text(String),
}

impl From<u64> for FieldValue {
	fn from(value: u64) -> Self {
		Self::Number(value.into())
	}
}

/// Receipt payload packed into a fixed-capacity byte array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundedPayload {
	pub storage: Vec<FieldValue>,
	pub len: FieldValue,
}

/// Structured inputs for constructing the zero-knowledge claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofInputs {
	pub modulus_limbs: Vec<FieldValue>,
	pub redc_limbs: Vec<FieldValue>,
	pub signature_limbs: Vec<FieldValue>,
	pub partial_hash_start: Vec<FieldValue>,
	pub header_delimiter_index: FieldValue,
	pub payload: BoundedPayload,
}

/// Request body of the input backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofInputsRequest {
	pub raw_payload: String,
	pub signature: String,
}

impl From<&PaymentReceipt> for ProofInputsRequest {
	fn from(receipt: &PaymentReceipt) -> Self {
		Self {
			raw_payload: receipt.raw_payload.clone(),
			signature: receipt.signature.clone(),
		}
	}
}

/// Response body of the input backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofInputsResponse {
	pub inputs: ProofInputs,
}

/// Arguments of `prove_payment_and_claim`, with the payload flattened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimArguments {
	pub modulus_limbs: Vec<FieldValue>,
	pub redc_limbs: Vec<FieldValue>,
	pub signature_limbs: Vec<FieldValue>,
	pub partial_hash_start: Vec<FieldValue>,
	pub header_delimiter_index: FieldValue,
	pub payload: Vec<FieldValue>,
	pub payload_length: FieldValue,
}

impl From<&ProofInputs> for ClaimArguments {
	fn from(inputs: &ProofInputs) -> Self {
		Self {
			modulus_limbs: inputs.modulus_limbs.clone(),
			redc_limbs: inputs.redc_limbs.clone(),
			signature_limbs: inputs.signature_limbs.clone(),
			partial_hash_start: inputs.partial_hash_start.clone(),
			header_delimiter_index: inputs.header_delimiter_index.clone(),
			payload: inputs.payload.storage.clone(),
			payload_length: inputs.payload.len.clone(),
		}
	}
}
