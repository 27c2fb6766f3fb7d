//! Configuration types for the claim service.

use obclaim_types::{
	to_ledger_units, AmountError, Commitment, CurrencyCode, LedgerEntry, ScreenSize,
	WalletBalance,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Service identity and HTTP settings
	pub service: ServiceSettings,
	/// Backend that initiates payments and prepares proof inputs
	pub backend: BackendConfig,
	/// Push channel endpoint
	pub channel: ChannelConfig,
	/// Authorization popup and payment initiation template
	#[serde(default)]
	pub authorization: AuthorizationConfig,
	/// Flow timers
	#[serde(default)]
	pub flow: FlowConfig,
	/// On-chain claim submission
	pub claim: ClaimConfig,
	/// Ledger persistence
	#[serde(default)]
	pub storage: StorageConfig,
	/// Escrow positions known at startup
	#[serde(default)]
	pub ledger: LedgerConfig,
	/// Wallet balances known at startup
	#[serde(default)]
	pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSettings {
	/// Service name for logging
	#[serde(default = "default_service_name")]
	pub name: String,
	/// Address the HTTP API binds to
	#[serde(default = "default_http_host")]
	pub http_host: String,
	#[serde(default = "default_http_port")]
	pub http_port: u16,
	#[serde(default = "default_log_level")]
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
	/// Base URL of the payment backend, e.g. `https://api.example.org`
	pub server_url: String,
	/// Timeout applied to every backend request
	#[serde(default = "default_request_timeout_secs")]
	pub request_timeout_secs: u64,
}

impl BackendConfig {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
	/// Websocket endpoint reporting payment lifecycle events
	pub websocket_url: String,
	/// Buffered frames per subscriber before the oldest are dropped
	#[serde(default = "default_channel_capacity")]
	pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthorizationConfig {
	/// Popup implementation name
	#[serde(default = "default_popup_implementation")]
	pub popup: String,
	#[serde(default = "default_popup_size")]
	pub popup_width: u32,
	#[serde(default = "default_popup_size")]
	pub popup_height: u32,
	#[serde(default = "default_screen_width")]
	pub screen_width: u32,
	#[serde(default = "default_screen_height")]
	pub screen_height: u32,
	/// Delay before checking that the popup left the blank page
	#[serde(default = "default_check_delay_ms")]
	pub check_delay_ms: u64,
	#[serde(default)]
	pub payment: PaymentTemplate,
}

impl AuthorizationConfig {
	pub fn screen(&self) -> ScreenSize {
		ScreenSize {
			width: self.screen_width,
			height: self.screen_height,
		}
	}

	pub fn check_delay(&self) -> Duration {
		Duration::from_millis(self.check_delay_ms)
	}
}

impl Default for AuthorizationConfig {
	fn default() -> Self {
		Self {
			popup: default_popup_implementation(),
			popup_width: default_popup_size(),
			popup_height: default_popup_size(),
			screen_width: default_screen_width(),
			screen_height: default_screen_height(),
			check_delay_ms: default_check_delay_ms(),
			payment: PaymentTemplate::default(),
		}
	}
}

/// Static parts of the Open Banking initiation request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PaymentTemplate {
	pub instruction_identification: String,
	pub scheme_name: String,
	/// Fixed creditor account identification. When unset, the creditor's
	/// sort code digits are used.
	pub creditor_identification: Option<String>,
	pub creditor_name: String,
	pub remittance: String,
	pub payment_context_code: String,
	pub merchant_category_code: String,
	pub merchant_customer_identification: String,
	pub delivery_address: DeliveryAddressConfig,
}

impl Default for PaymentTemplate {
	fn default() -> Self {
		Self {
			instruction_identification: "ID412".to_string(),
			scheme_name: "UK.OBIE.SortCodeAccountNumber".to_string(),
			creditor_identification: None,
			creditor_name: "Receiver Co.".to_string(),
			remittance: "Shipment fee".to_string(),
			payment_context_code: "EcommerceGoods".to_string(),
			merchant_category_code: "5967".to_string(),
			merchant_customer_identification: "1238808123123".to_string(),
			delivery_address: DeliveryAddressConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryAddressConfig {
	pub address_line: Vec<String>,
	pub street_name: String,
	pub building_number: String,
	pub post_code: String,
	pub town_name: String,
	pub country: String,
}

impl Default for DeliveryAddressConfig {
	fn default() -> Self {
		Self {
			address_line: vec!["7".to_string()],
			street_name: "Apple Street".to_string(),
			building_number: "1".to_string(),
			post_code: "E2 7AA".to_string(),
			town_name: "London".to_string(),
			country: "UK".to_string(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowConfig {
	/// Provider settlement latency between `Payment initiated` and claim
	#[serde(default = "default_settle_delay_ms")]
	pub settle_delay_ms: u64,
	/// Delay before a completed session closes itself
	#[serde(default = "default_auto_close_delay_ms")]
	pub auto_close_delay_ms: u64,
	/// Capacity of the flow event bus
	#[serde(default = "default_event_capacity")]
	pub event_capacity: usize,
}

impl FlowConfig {
	pub fn settle_delay(&self) -> Duration {
		Duration::from_millis(self.settle_delay_ms)
	}

	pub fn auto_close_delay(&self) -> Duration {
		Duration::from_millis(self.auto_close_delay_ms)
	}
}

impl Default for FlowConfig {
	fn default() -> Self {
		Self {
			settle_delay_ms: default_settle_delay_ms(),
			auto_close_delay_ms: default_auto_close_delay_ms(),
			event_capacity: default_event_capacity(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaimConfig {
	/// Claim submitter implementation name
	#[serde(default = "default_claim_implementation")]
	pub implementation: String,
	/// Whether the target network is the public testnet
	#[serde(default)]
	pub testnet: bool,
	/// Overrides the network-derived confirmation timeout
	pub timeout_secs: Option<u64>,
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
	/// Implementation specific settings
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

impl ClaimConfig {
	/// Bounded wait for on-chain confirmation.
	pub fn timeout(&self) -> Duration {
		let default_secs = if self.testnet { 600 } else { 60 };
		Duration::from_secs(self.timeout_secs.unwrap_or(default_secs))
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Storage backend: "memory" or "file"
	#[serde(default = "default_storage_backend")]
	pub backend: String,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			backend: default_storage_backend(),
			config: empty_table(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LedgerConfig {
	#[serde(default)]
	pub entries: Vec<LedgerSeedEntry>,
}

impl LedgerConfig {
	pub fn to_entries(&self) -> Result<Vec<LedgerEntry>, AmountError> {
		self.entries.iter().map(LedgerSeedEntry::to_entry).collect()
	}
}

/// An escrow position as written in the configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerSeedEntry {
	pub commitment: String,
	/// Decimal balance, e.g. `"400.35"`
	pub balance: String,
	pub currency: CurrencyCode,
	pub sort_code: String,
}

impl LedgerSeedEntry {
	pub fn to_entry(&self) -> Result<LedgerEntry, AmountError> {
		Ok(LedgerEntry {
			commitment: Commitment::new(self.commitment.clone()),
			balance: to_ledger_units(&self.balance)?,
			currency: self.currency,
			sort_code: self.sort_code.clone(),
		})
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WalletConfig {
	pub private_balance: String,
	pub public_balance: String,
}

impl Default for WalletConfig {
	fn default() -> Self {
		Self {
			private_balance: "0".to_string(),
			public_balance: "0".to_string(),
		}
	}
}

impl WalletConfig {
	pub fn to_balance(&self) -> Result<WalletBalance, AmountError> {
		Ok(WalletBalance {
			private: to_ledger_units(&self.private_balance)?,
			public: to_ledger_units(&self.public_balance)?,
		})
	}
}

fn default_service_name() -> String {
	"obclaim".to_string()
}

fn default_http_host() -> String {
	"127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
	3000
}

fn default_log_level() -> String {
	"info".to_string()
}

fn default_request_timeout_secs() -> u64 {
	30
}

fn default_channel_capacity() -> usize {
	64
}

fn default_popup_implementation() -> String {
	"probe".to_string()
}

fn default_popup_size() -> u32 {
	600
}

fn default_screen_width() -> u32 {
	1920
}

fn default_screen_height() -> u32 {
	1080
}

fn default_check_delay_ms() -> u64 {
	2000
}

fn default_settle_delay_ms() -> u64 {
	2500
}

fn default_auto_close_delay_ms() -> u64 {
	2500
}

fn default_event_capacity() -> usize {
	256
}

fn default_claim_implementation() -> String {
	"rpc".to_string()
}

fn default_poll_interval_ms() -> u64 {
	1000
}

fn default_storage_backend() -> String {
	"memory".to_string()
}

fn empty_table() -> toml::Value {
	toml::Value::Table(toml::Table::new())
}
