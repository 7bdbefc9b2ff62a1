use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::arm_service::{ArmError, ArmRequest, ArmService};
use crate::auto_return::AutoReturnOverride;
use crate::config::AutoReturnConfig;
use crate::telemetry::Telemetry;

#[derive(Clone)]
pub struct AppState {
    pub arm: Arc<ArmService>,
    pub telemetry: Telemetry,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ArmError> for ApiError {
    fn from(e: ArmError) -> Self {
        match e {
            ArmError::BadRequest(msg) => ApiError::BadRequest(msg),
            ArmError::WalletNotFound => ApiError::NotFound("wallet not found".into()),
            ArmError::InvalidPassphrase => ApiError::Unauthorized("invalid passphrase".into()),
            ArmError::NotArmed => ApiError::BadRequest("not armed".into()),
            ArmError::CryptoFailure(msg) => ApiError::Internal(msg),
            ArmError::Storage(msg) => ApiError::Internal(msg),
        }
    }
}

/// Authenticated user id, injected by the upstream auth middleware.
fn user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| ApiError::Unauthorized("missing user identity".into()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutoReturnOverrideBody {
    enabled: Option<bool>,
    dest_pubkey: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmBody {
    wallet_id: String,
    passphrase: String,
    #[serde(default)]
    ttl_minutes: u64,
    #[serde(default)]
    apply_to_all: bool,
    passphrase_hint: Option<String>,
    #[serde(default)]
    force_overwrite: bool,
    auto_return: Option<AutoReturnOverrideBody>,
}

impl ArmBody {
    fn into_request(self) -> ArmRequest {
        ArmRequest {
            wallet_id: self.wallet_id,
            passphrase: self.passphrase,
            ttl_minutes: self.ttl_minutes,
            apply_to_all: self.apply_to_all,
            passphrase_hint: self.passphrase_hint,
            force_overwrite: self.force_overwrite,
            auto_return: self.auto_return.map(|o| AutoReturnOverride {
                enabled: o.enabled,
                dest_pubkey: o.dest_pubkey,
            }),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArmResponse {
    ok: bool,
    wallet_id: String,
    armed_for_minutes: u64,
    migrated: bool,
}

async fn arm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ArmBody>,
) -> Result<Json<ArmResponse>, ApiError> {
    let user = user_id(&headers)?;
    let request = body.into_request();
    let wallet_id = request.wallet_id.clone();
    let outcome = state.arm.arm(&user, &request).await?;
    Ok(Json(ArmResponse {
        ok: true,
        wallet_id,
        armed_for_minutes: outcome.armed_for_minutes,
        migrated: outcome.migrated,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendBody {
    wallet_id: String,
    ttl_minutes: u64,
}

async fn extend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExtendBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers)?;
    let minutes = state.arm.extend(&user, &body.wallet_id, body.ttl_minutes).await?;
    Ok(Json(json!({ "extendedToMinutes": minutes })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletBody {
    wallet_id: String,
}

async fn disarm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WalletBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers)?;
    state.arm.disarm(&user, &body.wallet_id).await?;
    Ok(Json(json!({ "disarmed": true })))
}

#[derive(Deserialize)]
struct StatusQuery {
    guardian: Option<String>,
}

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(wallet_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers)?;
    let include_guardian = query.guardian.as_deref() == Some("1");
    let outcome = state.arm.status(&user, &wallet_id, include_guardian)?;

    let mut body = json!({
        "armed": outcome.armed,
        "msLeft": outcome.ms_left,
    });
    if outcome.auto_return_triggered {
        body["autoReturnTriggered"] = json!(true);
    }
    if let Some(hint) = outcome.passphrase_hint {
        body["passphraseHint"] = json!(hint);
    }
    if let Some(guardian) = outcome.guardian {
        body["guardian"] = json!({
            "openTrades": guardian.open_trades,
            "activeRules": guardian.active_rules,
            "armedSessions": guardian.armed_sessions,
        });
    }
    Ok(Json(body))
}

async fn setup_protection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ArmBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers)?;
    let migrated = state.arm.setup_protection(&user, &body.into_request())?;
    Ok(Json(json!({ "migrated": migrated })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveProtectionBody {
    wallet_id: String,
    passphrase: String,
}

async fn remove_protection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RemoveProtectionBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers)?;
    state.arm.remove_protection(&user, &body.wallet_id, &body.passphrase).await?;
    Ok(Json(json!({ "removed": true })))
}

#[derive(Deserialize)]
struct RequireArmBody {
    required: bool,
}

async fn require_arm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RequireArmBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers)?;
    state.arm.set_require_arm(&user, body.required)?;
    Ok(Json(json!({ "ok": true })))
}

async fn auto_return_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AutoReturnConfig>, ApiError> {
    let user = user_id(&headers)?;
    Ok(Json(state.arm.auto_return_settings(&user)?))
}

async fn set_auto_return_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<AutoReturnConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_id(&headers)?;
    state.arm.set_auto_return_settings(&user, &config)?;
    Ok(Json(json!({ "ok": true })))
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> Result<String, ApiError> {
    state.telemetry.render().map_err(|e| ApiError::Internal(format!("{e:#}")))
}

/// Full engine router: the arm surface plus health and metrics.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let arm_routes = Router::new()
        .route("/arm", post(arm))
        .route("/extend", post(extend))
        .route("/disarm", post(disarm))
        .route("/status/{walletId}", get(status))
        .route("/setup-protection", post(setup_protection))
        .route("/remove-protection", post(remove_protection))
        .route("/require-arm", post(require_arm))
        .route("/auto-return/settings", get(auto_return_settings).post(set_auto_return_settings))
        .route("/auto-return/setup", post(set_auto_return_settings));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .nest("/api/arm-encryption", arm_routes)
        .layer(cors)
        .with_state(state)
}
