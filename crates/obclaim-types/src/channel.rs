//! Push channel message types.
//!
//! The backend watching the banking provider reports payment lifecycle
//! events as JSON envelopes discriminated by their `message` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::proof::PaymentReceipt;

/// One inbound frame as received from the push channel.
///
/// `seq` is assigned by the channel client and strictly increases, so two
/// frames with identical payloads still have distinct identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFrame {
	pub seq: u64,
	pub received_at: DateTime<Utc>,
	pub payload: String,
}

/// Payment lifecycle events, keyed by the `message` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum ChannelMessage {
	#[serde(rename = "Payment initiated", rename_all = "camelCase")]
	PaymentInitiated {
		payment_response: PaymentResponse,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		correlation_id: Option<String>,
	},
	#[serde(rename = "Authorization successful", rename_all = "camelCase")]
	AuthorizationSuccessful {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		correlation_id: Option<String>,
	},
	#[serde(rename = "Payment failed", rename_all = "camelCase")]
	PaymentFailed {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		correlation_id: Option<String>,
	},
	/// Any discriminator this client does not understand.
	#[serde(other)]
	Unknown,
}

impl ChannelMessage {
	pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(payload)
	}

	/// Correlation key echoed back by the provider, when present.
	pub fn correlation_id(&self) -> Option<&str> {
		match self {
			Self::PaymentInitiated { correlation_id, .. }
			| Self::AuthorizationSuccessful { correlation_id }
			| Self::PaymentFailed { correlation_id } => correlation_id.as_deref(),
			Self::Unknown => None,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Self::PaymentInitiated { .. } => "Payment initiated",
			Self::AuthorizationSuccessful { .. } => "Authorization successful",
			Self::PaymentFailed { .. } => "Payment failed",
			Self::Unknown => "unknown",
		}
	}
}

/// Provider payment response carried by `Payment initiated`.
///
/// The provider signs the response body minus the detached `jwsSignature`,
/// so the remaining fields are kept verbatim and in their original order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentResponse {
	#[serde(rename = "jwsSignature")]
	pub jws_signature: String,
	#[serde(flatten)]
	pub payload: Map<String, Value>,
}

impl PaymentResponse {
	/// Splits the response into the signed payload and its signature.
	pub fn receipt(&self) -> Result<PaymentReceipt, serde_json::Error> {
		Ok(PaymentReceipt {
			raw_payload: serde_json::to_string(&self.payload)?,
			signature: self.jws_signature.clone(),
		})
	}
}
