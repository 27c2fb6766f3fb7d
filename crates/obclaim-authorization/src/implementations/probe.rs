//! Headless popup that probes the consent URL.
//!
//! Each window starts on `about:blank` and moves to the consent page once
//! an HTTP GET of it succeeds, mirroring a browser popup that only leaves
//! the blank page when the provider answers.

use crate::{AuthorizationError, PopupInterface};
use async_trait::async_trait;
use dashmap::DashMap;
use obclaim_types::{PopupGeometry, PopupHandle, BLANK_LOCATION};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Window {
	location: String,
	navigation: Option<JoinHandle<()>>,
}

pub struct ProbePopup {
	client: reqwest::Client,
	windows: Arc<DashMap<Uuid, Window>>,
}

impl ProbePopup {
	pub fn new(timeout: Duration) -> Result<Self, AuthorizationError> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| AuthorizationError::Popup(e.to_string()))?;
		Ok(Self {
			client,
			windows: Arc::new(DashMap::new()),
		})
	}

	/// Number of windows currently open.
	pub fn open_windows(&self) -> usize {
		self.windows.len()
	}
}

#[async_trait]
impl PopupInterface for ProbePopup {
	async fn open(
		&self,
		url: &str,
		geometry: PopupGeometry,
	) -> Result<PopupHandle, AuthorizationError> {
		let handle = PopupHandle {
			id: Uuid::new_v4(),
			url: url.to_string(),
			geometry,
		};
		info!(popup = %handle.id, %url, features = %geometry.features(), "Open this URL to authorize the payment");

		self.windows.insert(
			handle.id,
			Window {
				location: BLANK_LOCATION.to_string(),
				navigation: None,
			},
		);

		let client = self.client.clone();
		let windows = self.windows.clone();
		let id = handle.id;
		let target = handle.url.clone();
		let navigation = tokio::spawn(async move {
			match client.get(&target).send().await {
				Ok(response) if response.status().is_success() => {
					if let Some(mut window) = windows.get_mut(&id) {
						window.location = response.url().to_string();
						debug!(popup = %id, location = %window.location, "Popup navigated");
					}
				}
				Ok(response) => {
					warn!(popup = %id, status = %response.status(), "Consent page did not load");
				}
				Err(e) => {
					warn!(popup = %id, error = %e, "Consent page unreachable");
				}
			}
		});

		match self.windows.get_mut(&handle.id) {
			Some(mut window) => window.navigation = Some(navigation),
			None => navigation.abort(),
		}

		Ok(handle)
	}

	async fn location(&self, handle: &PopupHandle) -> Option<String> {
		self.windows
			.get(&handle.id)
			.map(|window| window.location.clone())
	}

	async fn close(&self, handle: &PopupHandle) {
		if let Some((_, window)) = self.windows.remove(&handle.id) {
			if let Some(navigation) = window.navigation {
				navigation.abort();
			}
			debug!(popup = %handle.id, "Popup closed");
		}
	}
}
