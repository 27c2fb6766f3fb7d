//! Configuration loading for the claim service.
//!
//! Configuration is read from a TOML file. `${VAR}` placeholders are
//! substituted from the environment before parsing, and a handful of
//! `OBCLAIM_*` variables override individual settings afterwards.

use std::collections::HashSet;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub mod types;

pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

/// Configuration loader with environment variable substitution
pub struct ConfigLoader {
	file_path: Option<String>,
	env_prefix: String,
}

impl Default for ConfigLoader {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: "OBCLAIM_".to_string(),
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_string_lossy().to_string());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	pub async fn load(&self) -> Result<Config, ConfigError> {
		let file_path = self.file_path.as_ref().ok_or_else(|| {
			ConfigError::FileNotFound("No configuration file specified".to_string())
		})?;

		if !Path::new(file_path).exists() {
			return Err(ConfigError::FileNotFound(file_path.clone()));
		}

		debug!(path = %file_path, "Loading configuration");
		let content = tokio::fs::read_to_string(file_path).await?;
		self.load_from_str(&content)
	}

	/// Substitutes, parses, overrides and validates configuration text.
	pub fn load_from_str(&self, content: &str) -> Result<Config, ConfigError> {
		let substituted_content = self.substitute_env_vars(content)?;

		let mut config: Config = toml::from_str(&substituted_content)
			.map_err(|e| ConfigError::ParseError(e.to_string()))?;

		self.apply_env_overrides(&mut config)?;
		validate_config(&config)?;

		Ok(config)
	}

	fn substitute_env_vars(&self, content: &str) -> Result<String, ConfigError> {
		let mut result = content.to_string();

		// Find and replace ${VAR_NAME} patterns
		let re = regex::Regex::new(r"\$\{([^}]+)\}")
			.map_err(|e| ConfigError::ParseError(e.to_string()))?;

		for cap in re.captures_iter(content) {
			let full_match = &cap[0];
			let var_name = &cap[1];

			let env_value = env::var(var_name)
				.map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;

			result = result.replace(full_match, &env_value);
		}

		Ok(result)
	}

	fn apply_env_overrides(&self, config: &mut Config) -> Result<(), ConfigError> {
		if let Ok(log_level) = env::var(format!("{}LOG_LEVEL", self.env_prefix)) {
			config.service.log_level = log_level;
		}

		if let Ok(http_port) = env::var(format!("{}HTTP_PORT", self.env_prefix)) {
			config.service.http_port = http_port
				.parse()
				.map_err(|e| ConfigError::ValidationError(format!("Invalid HTTP port: {}", e)))?;
		}

		if let Ok(server_url) = env::var(format!("{}SERVER_URL", self.env_prefix)) {
			config.backend.server_url = server_url;
		}

		if let Ok(websocket_url) = env::var(format!("{}WEBSOCKET_URL", self.env_prefix)) {
			config.channel.websocket_url = websocket_url;
		}

		Ok(())
	}
}

/// Checks cross-field constraints serde cannot express.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
	let server_url = &config.backend.server_url;
	if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
		return Err(ConfigError::ValidationError(format!(
			"backend.server_url must be an http(s) URL, got '{}'",
			server_url
		)));
	}

	let websocket_url = &config.channel.websocket_url;
	if !(websocket_url.starts_with("ws://") || websocket_url.starts_with("wss://")) {
		return Err(ConfigError::ValidationError(format!(
			"channel.websocket_url must be a ws(s) URL, got '{}'",
			websocket_url
		)));
	}

	if config.channel.capacity == 0 || config.flow.event_capacity == 0 {
		return Err(ConfigError::ValidationError(
			"Channel and event capacities must be greater than zero".to_string(),
		));
	}

	let authorization = &config.authorization;
	if authorization.popup_width == 0 || authorization.popup_height == 0 {
		return Err(ConfigError::ValidationError(
			"Popup dimensions must be greater than zero".to_string(),
		));
	}
	if authorization.popup_width > authorization.screen_width
		|| authorization.popup_height > authorization.screen_height
	{
		return Err(ConfigError::ValidationError(format!(
			"Popup {}x{} does not fit on a {}x{} screen",
			authorization.popup_width,
			authorization.popup_height,
			authorization.screen_width,
			authorization.screen_height
		)));
	}

	let delays = [
		("authorization.check_delay_ms", authorization.check_delay_ms),
		("flow.settle_delay_ms", config.flow.settle_delay_ms),
		("flow.auto_close_delay_ms", config.flow.auto_close_delay_ms),
		("claim.poll_interval_ms", config.claim.poll_interval_ms),
	];
	if let Some((name, _)) = delays.iter().find(|(_, value)| *value == 0) {
		return Err(ConfigError::ValidationError(format!(
			"{} must be greater than zero",
			name
		)));
	}

	match config.storage.backend.as_str() {
		"memory" | "file" => {}
		other => {
			return Err(ConfigError::ValidationError(format!(
				"Unknown storage backend '{}'",
				other
			)))
		}
	}

	let mut seen = HashSet::new();
	for entry in &config.ledger.entries {
		entry.to_entry().map_err(|e| {
			ConfigError::ValidationError(format!(
				"Invalid balance for ledger entry {}: {}",
				entry.commitment, e
			))
		})?;
		if !seen.insert(entry.commitment.as_str()) {
			return Err(ConfigError::ValidationError(format!(
				"Duplicate ledger entry {}",
				entry.commitment
			)));
		}
	}

	config
		.wallet
		.to_balance()
		.map_err(|e| ConfigError::ValidationError(format!("Invalid wallet balance: {}", e)))?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use std::time::Duration;
	use tempfile::NamedTempFile;

	const MINIMAL: &str = r#"
[service]
name = "test-claim"

[backend]
server_url = "http://localhost:8000"

[channel]
websocket_url = "ws://localhost:8000/ws"

[claim]
testnet = false
"#;

	fn loader(prefix: &str) -> ConfigLoader {
		ConfigLoader::new().with_env_prefix(prefix)
	}

	#[test]
	fn test_minimal_config_defaults() {
		let config = loader("OBCLAIM_TEST_MINIMAL_").load_from_str(MINIMAL).unwrap();

		assert_eq!(config.service.name, "test-claim");
		assert_eq!(config.service.http_port, 3000);
		assert_eq!(config.authorization.popup_width, 600);
		assert_eq!(config.authorization.check_delay(), Duration::from_secs(2));
		assert_eq!(config.flow.settle_delay(), Duration::from_millis(2500));
		assert_eq!(config.claim.timeout(), Duration::from_secs(60));
		assert_eq!(config.storage.backend, "memory");
		assert!(config.ledger.entries.is_empty());
	}

	#[test]
	fn test_testnet_claim_timeout() {
		let content = MINIMAL.replace("testnet = false", "testnet = true");
		let config = loader("OBCLAIM_TEST_TESTNET_").load_from_str(&content).unwrap();
		assert_eq!(config.claim.timeout(), Duration::from_secs(600));

		let content = MINIMAL.replace("testnet = false", "testnet = true\ntimeout_secs = 5");
		let config = loader("OBCLAIM_TEST_TESTNET_").load_from_str(&content).unwrap();
		assert_eq!(config.claim.timeout(), Duration::from_secs(5));
	}

	#[test]
	fn test_env_var_substitution() {
		env::set_var("OBCLAIM_TEST_BACKEND_HOST", "backend.internal");
		let content = MINIMAL.replace("localhost:8000\"", "${OBCLAIM_TEST_BACKEND_HOST}\"");

		let config = loader("OBCLAIM_TEST_SUBST_").load_from_str(&content).unwrap();
		assert_eq!(config.backend.server_url, "http://backend.internal");
	}

	#[test]
	fn test_missing_env_var() {
		let content = MINIMAL.replace("localhost:8000\"", "${OBCLAIM_TEST_UNSET_VARIABLE}\"");
		let result = loader("OBCLAIM_TEST_UNSET_").load_from_str(&content);
		assert!(matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "OBCLAIM_TEST_UNSET_VARIABLE"));
	}

	#[test]
	fn test_env_overrides() {
		env::set_var("OBCLAIM_TEST_OVERRIDE_HTTP_PORT", "4100");
		env::set_var("OBCLAIM_TEST_OVERRIDE_LOG_LEVEL", "debug");
		env::set_var("OBCLAIM_TEST_OVERRIDE_WEBSOCKET_URL", "wss://push.example.org");

		let config = loader("OBCLAIM_TEST_OVERRIDE_").load_from_str(MINIMAL).unwrap();
		assert_eq!(config.service.http_port, 4100);
		assert_eq!(config.service.log_level, "debug");
		assert_eq!(config.channel.websocket_url, "wss://push.example.org");
	}

	#[test]
	fn test_invalid_port_override() {
		env::set_var("OBCLAIM_TEST_BADPORT_HTTP_PORT", "not-a-port");
		let result = loader("OBCLAIM_TEST_BADPORT_").load_from_str(MINIMAL);
		assert!(matches!(result, Err(ConfigError::ValidationError(_))));
	}

	#[test]
	fn test_rejects_non_websocket_channel() {
		let content = MINIMAL.replace("ws://localhost:8000/ws", "http://localhost:8000/ws");
		let result = loader("OBCLAIM_TEST_WS_").load_from_str(&content);
		assert!(matches!(result, Err(ConfigError::ValidationError(_))));
	}

	#[test]
	fn test_ledger_entries() {
		let content = format!(
			r#"{}
[[ledger.entries]]
commitment = "0x0d1f"
balance = "400.35"
currency = "GBP"
sort_code = "04-00-75"
"#,
			MINIMAL
		);
		let config = loader("OBCLAIM_TEST_LEDGER_").load_from_str(&content).unwrap();
		let entries = config.ledger.to_entries().unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].balance, 400_350_000);

		let duplicated = format!(
			r#"{}
[[ledger.entries]]
commitment = "0x0d1f"
balance = "1"
currency = "GBP"
sort_code = "04-00-75"
"#,
			content
		);
		let result = loader("OBCLAIM_TEST_LEDGER_").load_from_str(&duplicated);
		assert!(matches!(result, Err(ConfigError::ValidationError(msg)) if msg.contains("Duplicate")));
	}

	#[test]
	fn test_invalid_ledger_balance() {
		let content = format!(
			r#"{}
[[ledger.entries]]
commitment = "0x0d1f"
balance = "lots"
currency = "GBP"
sort_code = "04-00-75"
"#,
			MINIMAL
		);
		let result = loader("OBCLAIM_TEST_BADBAL_").load_from_str(&content);
		assert!(matches!(result, Err(ConfigError::ValidationError(_))));
	}

	#[test]
	fn test_rejects_oversized_popup_and_zero_delay() {
		let content = format!(
			"{}\n[authorization]\npopup_width = 2000\nscreen_width = 1920\n",
			MINIMAL
		);
		let result = loader("OBCLAIM_TEST_POPUP_").load_from_str(&content);
		assert!(matches!(result, Err(ConfigError::ValidationError(msg)) if msg.contains("does not fit")));

		let content = format!("{}\n[flow]\nsettle_delay_ms = 0\n", MINIMAL);
		let result = loader("OBCLAIM_TEST_DELAY_").load_from_str(&content);
		assert!(matches!(result, Err(ConfigError::ValidationError(msg)) if msg.contains("settle_delay_ms")));
	}

	#[test]
	fn test_unknown_storage_backend() {
		let content = format!("{}\n[storage]\nbackend = \"redis\"\n", MINIMAL);
		let result = loader("OBCLAIM_TEST_STORAGE_").load_from_str(&content);
		assert!(matches!(result, Err(ConfigError::ValidationError(_))));
	}

	#[tokio::test]
	async fn test_load_from_file() {
		let mut file = NamedTempFile::new().unwrap();
		file.write_all(MINIMAL.as_bytes()).unwrap();

		let config = loader("OBCLAIM_TEST_FILE_")
			.with_file(file.path())
			.load()
			.await
			.unwrap();
		assert_eq!(config.channel.websocket_url, "ws://localhost:8000/ws");
	}

	#[tokio::test]
	async fn test_missing_file() {
		let result = ConfigLoader::new()
			.with_file("/definitely/not/here.toml")
			.load()
			.await;
		assert!(matches!(result, Err(ConfigError::FileNotFound(_))));

		let result = ConfigLoader::new().load().await;
		assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
	}
}
