//! Payment initiation through the backend's `/api/initialize-payment`.

use crate::{AuthorizationBackend, AuthorizationError};
use async_trait::async_trait;
use obclaim_config::{BackendConfig, PaymentTemplate};
use obclaim_types::{
	format_decimal, AuthorizationUrlResponse, CreditorAccount, DeliveryAddress, InitiationData,
	Initiation, InstructedAmount, PaymentInitiationRequest, PaymentIntent, PaymentRisk,
	RemittanceInformation,
};
use tracing::debug;

pub struct HttpAuthorizationBackend {
	client: reqwest::Client,
	endpoint: String,
	template: PaymentTemplate,
}

impl HttpAuthorizationBackend {
	pub fn new(
		backend: &BackendConfig,
		template: PaymentTemplate,
	) -> Result<Self, AuthorizationError> {
		let client = reqwest::Client::builder()
			.timeout(backend.request_timeout())
			.build()
			.map_err(|e| AuthorizationError::Request(e.to_string()))?;

		Ok(Self {
			client,
			endpoint: format!(
				"{}/api/initialize-payment",
				backend.server_url.trim_end_matches('/')
			),
			template,
		})
	}
}

#[async_trait]
impl AuthorizationBackend for HttpAuthorizationBackend {
	async fn initialize_payment(
		&self,
		intent: &PaymentIntent,
	) -> Result<String, AuthorizationError> {
		let request = initiation_request(intent, &self.template);
		debug!(session_id = %intent.session_id, endpoint = %self.endpoint, "Initializing payment");

		let response = self
			.client
			.post(&self.endpoint)
			.json(&request)
			.send()
			.await
			.map_err(|e| AuthorizationError::Request(e.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(AuthorizationError::Backend {
				status: status.as_u16(),
				body,
			});
		}

		let parsed: AuthorizationUrlResponse = response
			.json()
			.await
			.map_err(|e| AuthorizationError::InvalidResponse(e.to_string()))?;

		if parsed.auth_url.is_empty() {
			return Err(AuthorizationError::InvalidResponse(
				"authUrl is empty".to_string(),
			));
		}

		Ok(parsed.auth_url)
	}
}

/// Builds the Open Banking initiation request for `intent`.
///
/// The session id travels as `EndToEndIdentification` so the provider's
/// lifecycle messages can be matched back to the session.
pub fn initiation_request(
	intent: &PaymentIntent,
	template: &PaymentTemplate,
) -> PaymentInitiationRequest {
	let identification = template.creditor_identification.clone().unwrap_or_else(|| {
		intent
			.creditor
			.sort_code
			.chars()
			.filter(char::is_ascii_digit)
			.collect()
	});
	let address = &template.delivery_address;

	PaymentInitiationRequest {
		data: InitiationData {
			initiation: Initiation {
				instruction_identification: template.instruction_identification.clone(),
				end_to_end_identification: intent.session_id.correlation_key(),
				instructed_amount: InstructedAmount {
					amount: format_decimal(intent.amount_units, 2),
					currency: intent.creditor.currency.as_str().to_string(),
				},
				creditor_account: CreditorAccount {
					scheme_name: template.scheme_name.clone(),
					identification,
					name: template.creditor_name.clone(),
				},
				remittance_information: RemittanceInformation {
					unstructured: template.remittance.clone(),
				},
			},
		},
		risk: PaymentRisk {
			payment_context_code: template.payment_context_code.clone(),
			merchant_category_code: template.merchant_category_code.clone(),
			merchant_customer_identification: template.merchant_customer_identification.clone(),
			delivery_address: DeliveryAddress {
				address_line: address.address_line.clone(),
				street_name: address.street_name.clone(),
				building_number: address.building_number.clone(),
				post_code: address.post_code.clone(),
				town_name: address.town_name.clone(),
				country: address.country.clone(),
			},
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use obclaim_types::{Commitment, CurrencyCode, LedgerEntry, SessionId};
	use serde_json::json;
	use wiremock::matchers::{body_partial_json, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn intent() -> PaymentIntent {
		PaymentIntent {
			session_id: SessionId::new(),
			creditor: LedgerEntry {
				commitment: Commitment::new("0x0d1f"),
				balance: 400_350_000,
				currency: CurrencyCode::Gbp,
				sort_code: "04-00-75".to_string(),
			},
			amount_units: 25_000_000,
		}
	}

	fn backend_config(server_url: String) -> BackendConfig {
		BackendConfig {
			server_url,
			request_timeout_secs: 5,
		}
	}

	#[test]
	fn test_initiation_request_shape() {
		let intent = intent();
		let request = initiation_request(&intent, &PaymentTemplate::default());
		let value = serde_json::to_value(&request).unwrap();

		let initiation = &value["Data"]["Initiation"];
		assert_eq!(initiation["InstructionIdentification"], "ID412");
		let end_to_end = initiation["EndToEndIdentification"].as_str().unwrap();
		assert_eq!(end_to_end, intent.session_id.correlation_key());
		assert!(end_to_end.len() <= 35);
		assert_eq!(initiation["InstructedAmount"]["Amount"], "25.00");
		assert_eq!(initiation["InstructedAmount"]["Currency"], "GBP");
		assert_eq!(initiation["CreditorAccount"]["Identification"], "040075");
		assert_eq!(
			initiation["CreditorAccount"]["SchemeName"],
			"UK.OBIE.SortCodeAccountNumber"
		);
		assert_eq!(value["Risk"]["DeliveryAddress"]["PostCode"], "E2 7AA");
		assert_eq!(value["Risk"]["DeliveryAddress"]["AddressLine"], json!(["7"]));
	}

	#[test]
	fn test_fixed_creditor_identification() {
		let template = PaymentTemplate {
			creditor_identification: Some("11223321325698".to_string()),
			..PaymentTemplate::default()
		};
		let request = initiation_request(&intent(), &template);
		assert_eq!(
			request.data.initiation.creditor_account.identification,
			"11223321325698"
		);
	}

	#[tokio::test]
	async fn test_initialize_payment() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/initialize-payment"))
			.and(body_partial_json(json!({
				"Data": { "Initiation": { "InstructedAmount": { "Amount": "25.00" } } }
			})))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(json!({ "authUrl": "https://bank.example/consent?id=1" })),
			)
			.expect(1)
			.mount(&server)
			.await;

		let backend =
			HttpAuthorizationBackend::new(&backend_config(server.uri()), PaymentTemplate::default())
				.unwrap();
		let url = backend.initialize_payment(&intent()).await.unwrap();
		assert_eq!(url, "https://bank.example/consent?id=1");
	}

	#[tokio::test]
	async fn test_backend_error_status() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/initialize-payment"))
			.respond_with(ResponseTemplate::new(500).set_body_string("consent service down"))
			.mount(&server)
			.await;

		let backend =
			HttpAuthorizationBackend::new(&backend_config(server.uri()), PaymentTemplate::default())
				.unwrap();
		let result = backend.initialize_payment(&intent()).await;
		assert!(matches!(
			result,
			Err(AuthorizationError::Backend { status: 500, body }) if body == "consent service down"
		));
	}

	#[tokio::test]
	async fn test_malformed_response() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/initialize-payment"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "url": "nope" })))
			.mount(&server)
			.await;

		let backend = HttpAuthorizationBackend::new(
			&backend_config(format!("{}/", server.uri())),
			PaymentTemplate::default(),
		)
		.unwrap();
		let result = backend.initialize_payment(&intent()).await;
		assert!(matches!(result, Err(AuthorizationError::InvalidResponse(_))));
	}
}
