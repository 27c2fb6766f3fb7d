//! JSON-RPC claim submitter.
//!
//! Talks to a wallet relay that holds the account keys and forwards
//! contract calls to the network.

use crate::{ClaimError, ClaimHash, ClaimInterface, ClaimReceipt, TxStatus};
use async_trait::async_trait;
use obclaim_types::ClaimArguments;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct RpcRequest<'a, P> {
	jsonrpc: &'static str,
	id: u64,
	method: &'a str,
	params: P,
}

#[derive(Deserialize)]
struct RpcResponse<R> {
	result: Option<R>,
	error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
	code: i64,
	message: String,
}

#[derive(Serialize)]
struct ClaimParams<'a> {
	contract: &'a str,
	account: &'a str,
	args: &'a ClaimArguments,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptBody {
	status: String,
	block_number: Option<u64>,
}

pub struct RpcClaimSubmitter {
	client: reqwest::Client,
	rpc_url: String,
	contract: String,
	next_id: AtomicU64,
}

impl RpcClaimSubmitter {
	pub fn new(
		rpc_url: impl Into<String>,
		contract: impl Into<String>,
		timeout: Duration,
	) -> Result<Self, ClaimError> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| ClaimError::Network(e.to_string()))?;
		Ok(Self {
			client,
			rpc_url: rpc_url.into(),
			contract: contract.into(),
			next_id: AtomicU64::new(1),
		})
	}

	/// Configuration parameters:
	/// - `rpc_url`: relay endpoint (required)
	/// - `contract`: escrow contract address (required)
	/// - `request_timeout_secs`: per request timeout (default: 30)
	pub fn from_config(config: &toml::Value) -> Result<Self, ClaimError> {
		let required = |key: &str| {
			config
				.get(key)
				.and_then(|v| v.as_str())
				.map(str::to_string)
				.ok_or_else(|| ClaimError::Config(format!("claim.config.{} is required", key)))
		};

		let timeout_secs = config
			.get("request_timeout_secs")
			.and_then(|v| v.as_integer())
			.unwrap_or(30)
			.max(1) as u64;

		Self::new(
			required("rpc_url")?,
			required("contract")?,
			Duration::from_secs(timeout_secs),
		)
	}

	async fn call<P: Serialize, R: DeserializeOwned>(
		&self,
		method: &str,
		params: P,
	) -> Result<Option<R>, ClaimError> {
		let request = RpcRequest {
			jsonrpc: "2.0",
			id: self.next_id.fetch_add(1, Ordering::Relaxed),
			method,
			params,
		};
		debug!(method, id = request.id, "Calling wallet relay");

		let response = self
			.client
			.post(&self.rpc_url)
			.json(&request)
			.send()
			.await
			.map_err(|e| ClaimError::Network(e.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			return Err(ClaimError::Network(format!(
				"Relay returned HTTP {}",
				status.as_u16()
			)));
		}

		let body: RpcResponse<R> = response
			.json()
			.await
			.map_err(|e| ClaimError::InvalidResponse(e.to_string()))?;

		if let Some(error) = body.error {
			return Err(ClaimError::Rpc {
				code: error.code,
				message: error.message,
			});
		}
		Ok(body.result)
	}
}

#[async_trait]
impl ClaimInterface for RpcClaimSubmitter {
	async fn submit(
		&self,
		account: &str,
		args: &ClaimArguments,
	) -> Result<ClaimHash, ClaimError> {
		let params = ClaimParams {
			contract: &self.contract,
			account,
			args,
		};
		let hash: Option<String> = self.call("prove_payment_and_claim", params).await?;
		match hash {
			Some(hash) if !hash.is_empty() => Ok(ClaimHash(hash)),
			_ => Err(ClaimError::InvalidResponse(
				"prove_payment_and_claim returned no transaction hash".to_string(),
			)),
		}
	}

	async fn receipt(&self, hash: &ClaimHash) -> Result<Option<ClaimReceipt>, ClaimError> {
		let body: Option<ReceiptBody> = self.call("get_tx_receipt", [&hash.0]).await?;
		Ok(body.map(|body| ClaimReceipt {
			hash: hash.clone(),
			status: TxStatus::parse(&body.status),
			block_number: body.block_number,
		}))
	}
}
