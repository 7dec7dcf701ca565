use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::info;
use uuid::Uuid;

use lobby_db::Store;
use lobby_gateway::{Gateway, IdentityVerifier, SessionRegistry};
use lobby_types::api::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::error::{ApiError, ApiResult};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: Store,
    pub verifier: IdentityVerifier,
    pub registry: SessionRegistry,
}

impl AppStateInner {
    /// Share the gateway's store, token keys and live registry with REST.
    pub fn from_gateway(gateway: &Gateway) -> AppState {
        Arc::new(Self {
            store: gateway.store.clone(),
            verifier: gateway.verifier.clone(),
            registry: gateway.registry.clone(),
        })
    }
}

/// Usernames end up in direct-room links (`link_<a>_<b>`), so underscores
/// are not allowed: they would make two different pairs share a link.
fn valid_username(username: &str) -> bool {
    (3..=32).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    if !valid_username(&req.username) {
        return Err(ApiError::BadRequest(
            "username must be 3-32 letters, digits, '.' or '-'".into(),
        ));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest("password must be at least 8 characters".into()));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .to_string();

    let user_id = Uuid::new_v4();
    let username = req.username;
    let identity = state
        .store
        .call(move |db| db.create_user(user_id, &username, &password_hash))
        .await?;

    let token = state.verifier.issue(&identity)?;
    info!("Registered user {}", identity.username);

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let username = req.username;
    let user = state
        .store
        .call(move |db| db.get_user_by_username(&username))
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let parsed_hash =
        PasswordHash::new(&user.password_hash).map_err(|e| ApiError::Internal(e.to_string()))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized)?;

    let identity = user.identity();
    let token = state.verifier.issue(&identity)?;

    Ok(Json(LoginResponse {
        user_id: identity.id,
        username: identity.username,
        token,
    }))
}
