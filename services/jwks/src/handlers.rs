//! JWKS Service REST API Handlers

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use jwks_hsm::jwk::private_key_id;
use jwks_hsm::{Algorithm, KeyManager, KeyManagerError, KeySet, OpaqueSigner, PublicJwkSet, Usage};

pub type AppState = Arc<dyn KeyManager>;

/// Request to generate a key pair in a set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateKeyRequest {
    /// Key id; a random one is assigned when absent
    #[serde(default)]
    pub kid: Option<String>,
    /// JWA algorithm name (RS256, ES256, ES512)
    pub alg: String,
    /// JWK `use`, defaults to `sig`
    #[serde(rename = "use", default)]
    pub usage: Option<String>,
}

/// Request to sign data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    /// Data to sign (base64url, unpadded)
    pub data: String,
}

/// Response containing a signature
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    pub kid: String,
    pub alg: Algorithm,
    /// Signature (base64url, unpadded)
    pub signature: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

// ==================== Error Handling ====================

pub struct ApiError(pub StatusCode, pub Json<ErrorResponse>);

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError(
            StatusCode::NOT_FOUND,
            Json(ErrorResponse { error: msg.into() }),
        )
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError(
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: msg.into() }),
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError(
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: msg.into() }),
        )
    }
}

impl From<KeyManagerError> for ApiError {
    fn from(e: KeyManagerError) -> Self {
        match &e {
            KeyManagerError::NotFound(_) => ApiError::not_found(e.to_string()),
            KeyManagerError::UnsupportedAlgorithm(_)
            | KeyManagerError::UnsupportedUsage(_)
            | KeyManagerError::PreGeneratedKeysOnly => ApiError::bad_request(e.to_string()),
            _ => {
                error!("Key manager failure: {}", e);
                ApiError::internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

fn random_kid() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

// ==================== Handlers ====================

/// Health check
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Generate a key pair in a set and return its public entry
pub async fn generate_key(
    State(manager): State<AppState>,
    Path(set): Path<String>,
    Json(request): Json<GenerateKeyRequest>,
) -> Result<(StatusCode, Json<PublicJwkSet>), ApiError> {
    let kid = match request.kid {
        Some(kid) if kid.is_empty() => return Err(ApiError::bad_request("Kid cannot be empty")),
        Some(kid) => kid,
        None => random_kid(),
    };

    let usage = match request.usage.as_deref() {
        Some(usage) => usage.parse::<Usage>()?,
        None => Usage::Signature,
    };

    let keys = manager
        .generate_key_set(&set, &kid, &request.alg, usage)
        .await?;

    Ok((StatusCode::CREATED, Json(keys.public_jwks()?)))
}

/// Get the public JWKS for a set
pub async fn get_key_set(
    State(manager): State<AppState>,
    Path(set): Path<String>,
) -> Result<Json<PublicJwkSet>, ApiError> {
    let keys = manager.get_key_set(&set).await?;
    Ok(Json(keys.public_jwks()?))
}

/// Get the public entry for one key
pub async fn get_key(
    State(manager): State<AppState>,
    Path((set, kid)): Path<(String, String)>,
) -> Result<Json<PublicJwkSet>, ApiError> {
    let keys = manager.get_key(&set, &kid).await?;
    Ok(Json(keys.public_jwks()?))
}

/// Delete every key in a set
pub async fn delete_key_set(
    State(manager): State<AppState>,
    Path(set): Path<String>,
) -> Result<StatusCode, ApiError> {
    manager.delete_key_set(&set).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Delete one key
pub async fn delete_key(
    State(manager): State<AppState>,
    Path((set, kid)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    manager.delete_key(&set, &kid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Replace a set with supplied key material. Always refused: keys are only
/// ever generated on the device, so the body is not inspected.
pub async fn update_key_set(
    State(manager): State<AppState>,
    Path(set): Path<String>,
) -> Result<StatusCode, ApiError> {
    manager.update_key_set(&set, &KeySet::default()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Sign data with a key's private entry
pub async fn sign(
    State(manager): State<AppState>,
    Path((set, kid)): Path<(String, String)>,
    Json(request): Json<SignRequest>,
) -> Result<Json<SignResponse>, ApiError> {
    let data = URL_SAFE_NO_PAD
        .decode(&request.data)
        .map_err(|e| ApiError::bad_request(format!("Invalid base64url data: {}", e)))?;

    let keys = manager.get_key(&set, &kid).await?;
    let signer = keys
        .key(&private_key_id(&kid))
        .and_then(|entry| entry.signer())
        .ok_or_else(|| ApiError::internal(format!("Key {} has no private entry", kid)))?;

    let signature = signer.sign_payload(&data).await?;

    Ok(Json(SignResponse {
        kid,
        alg: signer.algorithm(),
        signature: URL_SAFE_NO_PAD.encode(signature),
    }))
}
