use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use obclaim_authorization::create_launcher;
use obclaim_claim::create_claim_service;
use obclaim_config::{Config, ConfigLoader};
use obclaim_core::EngineBuilder;
use obclaim_proof::create_proof_service;
use obclaim_storage::create_storage;
use obclaim_types::format_units;
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;

#[derive(Parser)]
#[command(name = "obclaim")]
#[command(about = "Open banking payment claim service", long_about = None)]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,

	#[arg(short, long, value_name = "FILE", default_value = "config/local.toml")]
	config: PathBuf,

	/// Overrides `[service] log_level` and `OBCLAIM_LOG_LEVEL`
	#[arg(long, value_name = "LEVEL")]
	log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the claim service
	Start,
	/// Validate the configuration file
	Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let config = load_config(&cli).await?;

	setup_tracing(log_level(&cli, &config))?;

	match cli.command {
		Some(Commands::Start) | None => start_service(cli, config).await,
		Some(Commands::Validate) => validate_config(cli, config),
	}
}

/// Level handed to the log filter when `RUST_LOG` is unset.
fn log_level<'a>(cli: &'a Cli, config: &'a Config) -> &'a str {
	cli.log_level.as_deref().unwrap_or(&config.service.log_level)
}

async fn load_config(cli: &Cli) -> Result<Config> {
	ConfigLoader::new()
		.with_file(&cli.config)
		.load()
		.await
		.with_context(|| format!("Failed to load configuration from {}", cli.config.display()))
}

async fn start_service(cli: Cli, config: Config) -> Result<()> {
	info!(config = %cli.config.display(), "Starting obclaim service");
	info!(
		name = %config.service.name,
		backend = %config.backend.server_url,
		claim_timeout_secs = config.claim.timeout().as_secs(),
		"Configuration loaded"
	);

	let launcher = create_launcher(&config.authorization, &config.backend)
		.context("Failed to create authorization launcher")?;
	let proof = create_proof_service(&config.backend).context("Failed to create proof service")?;
	let claim = create_claim_service(&config.claim).context("Failed to create claim service")?;
	let storage = create_storage(&config.storage.backend, &config.storage.config)
		.context("Failed to create storage backend")?;

	let (engine, handle) = EngineBuilder::new(config.clone())
		.with_launcher(launcher)
		.with_proof_service(proof)
		.with_claim_service(claim)
		.with_storage(storage)
		.build()
		.await
		.context("Failed to build payment engine")?;

	let (channel, frames) = obclaim_channel::connect(&config.channel)
		.await
		.with_context(|| format!("Failed to connect to {}", config.channel.websocket_url))?;

	let engine_task = tokio::spawn(engine.run(frames));

	let address = format!("{}:{}", config.service.http_host, config.service.http_port);
	let listener = tokio::net::TcpListener::bind(&address)
		.await
		.with_context(|| format!("Failed to bind {}", address))?;
	info!(%address, "API server listening");

	axum::serve(listener, api::router(handle.clone()))
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("API server failed")?;

	info!("Shutdown signal received, stopping services...");

	handle
		.shutdown()
		.await
		.context("Failed to shut down payment engine")?;
	engine_task.await.context("Payment engine task failed")?;
	channel.stop().await;

	info!("obclaim service stopped");
	Ok(())
}

fn validate_config(cli: Cli, config: Config) -> Result<()> {
	info!(config = %cli.config.display(), "Configuration is valid");
	info!(
		implementation = %config.claim.implementation,
		testnet = config.claim.testnet,
		timeout_secs = config.claim.timeout().as_secs(),
		"Claim submitter"
	);
	info!(backend = %config.storage.backend, "Storage");

	let entries = config
		.ledger
		.to_entries()
		.context("Invalid ledger entry")?;
	for entry in &entries {
		info!(
			commitment = %entry.commitment.short(),
			balance = %format_units(entry.balance),
			currency = %entry.currency,
			"Ledger entry"
		);
	}

	Ok(())
}

fn setup_tracing(log_level: &str) -> Result<()> {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

	tracing_subscriber::registry()
		.with(env_filter)
		.with(tracing_subscriber::fmt::layer())
		.init();

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c()
			.await
			.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install signal handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const CONFIG: &str = r#"
[service]
log_level = "debug"

[backend]
server_url = "http://127.0.0.1:9"

[channel]
websocket_url = "ws://127.0.0.1:9/ws"

[claim]
implementation = "rpc"
"#;

	fn config() -> Config {
		ConfigLoader::new()
			.with_env_prefix("OBCLAIM_MAIN_TEST_")
			.load_from_str(CONFIG)
			.unwrap()
	}

	#[test]
	fn test_log_level_from_config() {
		let cli = Cli::parse_from(["obclaim", "validate"]);
		assert_eq!(log_level(&cli, &config()), "debug");
	}

	#[test]
	fn test_log_level_flag_overrides_config() {
		let cli = Cli::parse_from(["obclaim", "--log-level", "warn", "start"]);
		assert_eq!(log_level(&cli, &config()), "warn");
	}
}
