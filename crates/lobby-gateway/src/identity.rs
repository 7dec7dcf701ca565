use std::sync::Arc;

use axum::http::{HeaderMap, header};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use lobby_db::{Store, StoreError};
use lobby_types::api::Claims;
use lobby_types::models::UserIdentity;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no bearer token")]
    Missing,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token expired")]
    Expired,

    #[error("token subject {0} does not exist")]
    UnknownSubject(Uuid),

    #[error("could not issue token: {0}")]
    Issue(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Issues and verifies bearer tokens, resolving their subject to a stored user.
#[derive(Clone)]
pub struct IdentityVerifier {
    keys: Arc<Keys>,
    ttl: chrono::Duration,
    store: Store,
}

impl IdentityVerifier {
    pub fn new(secret: &str, ttl: chrono::Duration, store: Store) -> Self {
        Self {
            keys: Arc::new(Keys {
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: DecodingKey::from_secret(secret.as_bytes()),
            }),
            ttl,
            store,
        }
    }

    pub fn issue(&self, identity: &UserIdentity) -> Result<String, AuthError> {
        let claims = Claims {
            sub: identity.id,
            username: identity.username.clone(),
            exp: (chrono::Utc::now() + self.ttl).timestamp() as usize,
        };

        encode(&Header::default(), &claims, &self.keys.encoding)
            .map_err(|e| AuthError::Issue(e.to_string()))
    }

    /// Validate `token` and resolve its subject. No side effects.
    pub async fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let data = decode::<Claims>(token, &self.keys.decoding, &Validation::default())
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Malformed(e.to_string()),
            })?;

        let sub = data.claims.sub;
        let user = self.store.call(move |db| db.get_user_by_id(sub)).await?;

        user.map(|row| row.identity())
            .ok_or(AuthError::UnknownSubject(sub))
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
