//! Payment authorization types.
//!
//! Covers the payment intent handed to the authorization launcher, the Open
//! Banking initiation request it posts to the backend, and the popup window
//! it opens for the provider's consent page.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{LedgerEntry, SessionId};

/// What the orchestrator asks the launcher to authorize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
	/// Session requesting the payment, echoed back as correlation key.
	pub session_id: SessionId,
	/// Counterpart position being paid.
	pub creditor: LedgerEntry,
	/// Amount in ledger units.
	pub amount_units: u128,
}

/// Open Banking domestic payment initiation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PaymentInitiationRequest {
	pub data: InitiationData,
	pub risk: PaymentRisk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitiationData {
	pub initiation: Initiation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Initiation {
	pub instruction_identification: String,
	pub end_to_end_identification: String,
	pub instructed_amount: InstructedAmount,
	pub creditor_account: CreditorAccount,
	pub remittance_information: RemittanceInformation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstructedAmount {
	pub amount: String,
	pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreditorAccount {
	pub scheme_name: String,
	pub identification: String,
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemittanceInformation {
	pub unstructured: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PaymentRisk {
	pub payment_context_code: String,
	pub merchant_category_code: String,
	pub merchant_customer_identification: String,
	pub delivery_address: DeliveryAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeliveryAddress {
	pub address_line: Vec<String>,
	pub street_name: String,
	pub building_number: String,
	pub post_code: String,
	pub town_name: String,
	pub country: String,
}

/// Backend answer to a payment initiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationUrlResponse {
	pub auth_url: String,
}

/// Dimensions of the screen the popup is centered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
	pub width: u32,
	pub height: u32,
}

/// Size and position of the authorization popup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupGeometry {
	pub width: u32,
	pub height: u32,
	pub left: u32,
	pub top: u32,
}

impl PopupGeometry {
	/// Centers a `width` x `height` window on `screen`.
	pub fn centered(screen: ScreenSize, width: u32, height: u32) -> Self {
		Self {
			width,
			height,
			left: screen.width.saturating_sub(width) / 2,
			top: screen.height.saturating_sub(height) / 2,
		}
	}

	/// Window feature string, e.g. `width=600,height=600,top=240,left=660`.
	pub fn features(&self) -> String {
		format!(
			"width={},height={},top={},left={}",
			self.width, self.height, self.top, self.left
		)
	}
}

/// Reference to an opened authorization popup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupHandle {
	pub id: Uuid,
	pub url: String,
	pub geometry: PopupGeometry,
}

/// Location of a popup that has not navigated anywhere yet.
pub const BLANK_LOCATION: &str = "about:blank";
