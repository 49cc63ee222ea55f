//! HTTP API consumed by the faucet front end

use crate::config::ApiConfig;
use crate::error::{RefillError, RefillResult};
use crate::refill::{RefillCoordinator, StartOutcome};
use crate::state::{Asset, AttemptView, FaucetOverview, RefillView, StateManager};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, H256};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RefillCoordinator>,
    /// Present when snapshots live in PostgreSQL
    pub database: Option<Arc<StateManager>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/refills", get(get_refills))
        .route("/refills/:asset", get(get_refill).post(start_refill))
        .route("/refills/:asset/dismiss", post(dismiss_refill))
        .route("/refills/:asset/escalate", post(escalate_refill))
        .route("/faucet", get(get_faucet))
        .route("/faucet/claims/:address", get(get_claims))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RefillResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RefillError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RefillError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Error surfaced to clients as `{ "error": message }`
struct ApiError(RefillError);

impl From<RefillError> for ApiError {
    fn from(e: RefillError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RefillError::Unauthorized => StatusCode::FORBIDDEN,
            RefillError::UnknownAsset(_) => StatusCode::NOT_FOUND,
            RefillError::Config(_) => StatusCode::BAD_REQUEST,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.database {
        Some(db) => Some(db.health_check().await.is_ok()),
        None => None,
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
    })
}

async fn get_refills(State(state): State<AppState>) -> Json<RefillView> {
    Json(state.coordinator.board().view().await)
}

async fn get_refill(
    State(state): State<AppState>,
    Path(asset): Path<String>,
) -> ApiResult<Json<AttemptView>> {
    let asset: Asset = asset.parse()?;
    let board = state.coordinator.board();
    Ok(Json(board.attempt_view(board.get(asset).await)))
}

async fn start_refill(
    State(state): State<AppState>,
    Path(asset): Path<String>,
) -> ApiResult<(StatusCode, Json<StartResponse>)> {
    let asset: Asset = asset.parse()?;
    let outcome = state.coordinator.start(asset).await?;
    let board = state.coordinator.board();

    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            outcome,
            attempt: board.attempt_view(board.get(asset).await),
        }),
    ))
}

async fn dismiss_refill(
    State(state): State<AppState>,
    Path(asset): Path<String>,
) -> ApiResult<Json<AttemptView>> {
    let asset: Asset = asset.parse()?;
    let attempt = state.coordinator.reset(asset).await?;
    Ok(Json(state.coordinator.board().attempt_view(attempt)))
}

async fn escalate_refill(
    State(state): State<AppState>,
    Path(asset): Path<String>,
) -> ApiResult<Json<EscalateResponse>> {
    let asset: Asset = asset.parse()?;
    let escalation = state.coordinator.escalate(asset).await?;

    Ok(Json(EscalateResponse {
        force_clear_tx: escalation.force_clear_tx,
        attempt: state.coordinator.board().attempt_view(escalation.attempt),
    }))
}

async fn get_faucet(State(state): State<AppState>) -> ApiResult<Json<FaucetResponse>> {
    let overview = state.coordinator.refresh_overview().await?;
    let cooldown_secs = state.coordinator.chains().faucet.cooldown().await?;

    Ok(Json(FaucetResponse {
        overview,
        cooldown_secs,
    }))
}

async fn get_claims(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<ClaimsResponse>> {
    let user: Address = address
        .parse()
        .map_err(|_| RefillError::Config(format!("invalid address {}", address)))?;
    let faucet = &state.coordinator.chains().faucet;
    let cooldown_secs = faucet.cooldown().await?;

    let mut claims = Vec::with_capacity(Asset::ALL.len());
    for asset in Asset::ALL {
        let last_claim = faucet.last_claim(user, asset).await?;
        claims.push(ClaimStatus {
            asset,
            last_claim,
            next_claim: if last_claim == 0 {
                0
            } else {
                last_claim.saturating_add(cooldown_secs)
            },
        });
    }

    Ok(Json(ClaimsResponse {
        address: user,
        cooldown_secs,
        claims,
    }))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: Option<bool>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct StartResponse {
    outcome: StartOutcome,
    attempt: AttemptView,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EscalateResponse {
    force_clear_tx: Option<H256>,
    attempt: AttemptView,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FaucetResponse {
    #[serde(flatten)]
    overview: FaucetOverview,
    cooldown_secs: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimStatus {
    asset: Asset,
    last_claim: u64,
    /// Earliest claim time, 0 if never claimed
    next_claim: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimsResponse {
    address: Address,
    cooldown_secs: u64,
    claims: Vec<ClaimStatus>,
}
