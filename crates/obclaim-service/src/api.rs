//! HTTP API in front of the payment engine.

use axum::{
	extract::State,
	http::StatusCode,
	response::{IntoResponse, Json, Response},
	routing::{get, post, put},
	Router,
};
use obclaim_core::{EngineError, EngineHandle, FlowError};
use obclaim_types::{format_units, Commitment, CurrencyCode, LedgerEntry, SessionSnapshot};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn router(engine: EngineHandle) -> Router {
	Router::new()
		.route("/health", get(health_check))
		.route("/orders", get(list_orders))
		.route("/wallet", get(get_wallet))
		.route(
			"/session",
			post(open_session).get(get_session).delete(close_session),
		)
		.route("/session/amount", put(set_amount))
		.route("/session/action", post(press_action))
		.with_state(engine)
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(CorsLayer::permissive()),
		)
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
	fn from(error: EngineError) -> Self {
		Self(error)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self.0 {
			EngineError::NoSession | EngineError::UnknownCommitment(_) => StatusCode::NOT_FOUND,
			EngineError::Flow(FlowError::InvalidAmount(_)) => StatusCode::BAD_REQUEST,
			EngineError::Flow(_) => StatusCode::CONFLICT,
			EngineError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let body = serde_json::json!({ "error": self.0.to_string() });
		(status, Json(body)).into_response()
	}
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
struct OrderView {
	commitment: Commitment,
	balance: String,
	display_balance: String,
	currency: CurrencyCode,
	sort_code: String,
}

impl From<LedgerEntry> for OrderView {
	fn from(entry: LedgerEntry) -> Self {
		Self {
			balance: format_units(entry.balance),
			display_balance: entry.display_balance(),
			commitment: entry.commitment,
			currency: entry.currency,
			sort_code: entry.sort_code,
		}
	}
}

#[derive(Serialize)]
struct WalletView {
	private_balance: String,
	public_balance: String,
}

#[derive(Deserialize)]
struct OpenSessionRequest {
	commitment: Commitment,
}

#[derive(Deserialize)]
struct SetAmountRequest {
	amount: String,
}

async fn health_check() -> Json<serde_json::Value> {
	Json(serde_json::json!({ "status": "ok" }))
}

async fn list_orders(State(engine): State<EngineHandle>) -> ApiResult<Vec<OrderView>> {
	let orders = engine.orders().await?;
	Ok(Json(orders.into_iter().map(OrderView::from).collect()))
}

async fn get_wallet(State(engine): State<EngineHandle>) -> ApiResult<WalletView> {
	let wallet = engine.wallet().await?;
	Ok(Json(WalletView {
		private_balance: format_units(wallet.private),
		public_balance: format_units(wallet.public),
	}))
}

async fn open_session(
	State(engine): State<EngineHandle>,
	Json(request): Json<OpenSessionRequest>,
) -> ApiResult<SessionSnapshot> {
	Ok(Json(engine.open_session(request.commitment).await?))
}

async fn get_session(State(engine): State<EngineHandle>) -> ApiResult<SessionSnapshot> {
	engine
		.snapshot()
		.await?
		.map(Json)
		.ok_or(ApiError(EngineError::NoSession))
}

async fn close_session(State(engine): State<EngineHandle>) -> Result<StatusCode, ApiError> {
	engine.close_session().await?;
	Ok(StatusCode::NO_CONTENT)
}

async fn set_amount(
	State(engine): State<EngineHandle>,
	Json(request): Json<SetAmountRequest>,
) -> ApiResult<SessionSnapshot> {
	Ok(Json(engine.set_amount(request.amount).await?))
}

async fn press_action(State(engine): State<EngineHandle>) -> ApiResult<SessionSnapshot> {
	Ok(Json(engine.press_action().await?))
}
