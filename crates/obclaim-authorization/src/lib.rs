//! Payment authorization.
//!
//! The launcher asks the backend to initiate a payment with the banking
//! provider, receives the provider's consent URL and opens it in a popup.
//! The popup is an abstraction: whatever implements [`PopupInterface`] can
//! stand in for a browser window.

use async_trait::async_trait;
use obclaim_config::{AuthorizationConfig, BackendConfig};
use obclaim_types::{PaymentIntent, PopupGeometry, PopupHandle, BLANK_LOCATION};
use thiserror::Error;
use tracing::{debug, info};

pub mod implementations {
	pub mod http;
	pub mod probe;
}

pub use implementations::http::{initiation_request, HttpAuthorizationBackend};
pub use implementations::probe::ProbePopup;

#[derive(Debug, Error)]
pub enum AuthorizationError {
	/// Error that occurs when the backend cannot be reached.
	#[error("Request failed: {0}")]
	Request(String),
	/// The backend answered with a non-success status.
	#[error("Backend returned {status}: {body}")]
	Backend { status: u16, body: String },
	/// The backend answered without a usable `authUrl`.
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
	/// The popup window could not be created.
	#[error("Popup error: {0}")]
	Popup(String),
	/// Configuration names a popup implementation that does not exist.
	#[error("Unknown popup implementation: {0}")]
	UnknownImplementation(String),
}

/// Backend endpoint that turns a payment intent into a consent URL.
#[async_trait]
pub trait AuthorizationBackend: Send + Sync {
	/// Initiates the payment and returns the provider's authorization URL.
	async fn initialize_payment(&self, intent: &PaymentIntent)
		-> Result<String, AuthorizationError>;
}

/// A window that can show the provider's consent page.
#[async_trait]
pub trait PopupInterface: Send + Sync {
	async fn open(
		&self,
		url: &str,
		geometry: PopupGeometry,
	) -> Result<PopupHandle, AuthorizationError>;

	/// Current location of the popup, `None` once it is closed.
	async fn location(&self, handle: &PopupHandle) -> Option<String>;

	/// Closes the popup. Closing an already closed popup does nothing.
	async fn close(&self, handle: &PopupHandle);
}

pub struct AuthorizationLauncher {
	backend: Box<dyn AuthorizationBackend>,
	popup: Box<dyn PopupInterface>,
	geometry: PopupGeometry,
}

impl AuthorizationLauncher {
	pub fn new(
		backend: Box<dyn AuthorizationBackend>,
		popup: Box<dyn PopupInterface>,
		geometry: PopupGeometry,
	) -> Self {
		Self {
			backend,
			popup,
			geometry,
		}
	}

	pub fn geometry(&self) -> PopupGeometry {
		self.geometry
	}

	/// Requests a consent URL for `intent` and opens it.
	pub async fn launch(&self, intent: &PaymentIntent) -> Result<PopupHandle, AuthorizationError> {
		let url = self.backend.initialize_payment(intent).await?;
		info!(session_id = %intent.session_id, %url, "Opening authorization popup");
		self.popup.open(&url, self.geometry).await
	}

	/// Whether the popup is still open on the blank page it started on.
	pub async fn is_blank(&self, handle: &PopupHandle) -> bool {
		self.popup.location(handle).await.as_deref() == Some(BLANK_LOCATION)
	}

	pub async fn is_open(&self, handle: &PopupHandle) -> bool {
		self.popup.location(handle).await.is_some()
	}

	/// Closes the popup if there is one and it is still open.
	pub async fn close(&self, handle: Option<&PopupHandle>) {
		let Some(handle) = handle else {
			return;
		};
		if self.is_open(handle).await {
			debug!(popup = %handle.id, "Closing authorization popup");
			self.popup.close(handle).await;
		}
	}
}

/// Creates the launcher from configuration.
///
/// Recognised popup implementations: `probe`.
pub fn create_launcher(
	authorization: &AuthorizationConfig,
	backend: &BackendConfig,
) -> Result<AuthorizationLauncher, AuthorizationError> {
	let http_backend = HttpAuthorizationBackend::new(backend, authorization.payment.clone())?;

	let popup: Box<dyn PopupInterface> = match authorization.popup.as_str() {
		"probe" => Box::new(ProbePopup::new(backend.request_timeout())?),
		other => return Err(AuthorizationError::UnknownImplementation(other.to_string())),
	};

	let geometry = PopupGeometry::centered(
		authorization.screen(),
		authorization.popup_width,
		authorization.popup_height,
	);

	Ok(AuthorizationLauncher::new(
		Box::new(http_backend),
		popup,
		geometry,
	))
}
