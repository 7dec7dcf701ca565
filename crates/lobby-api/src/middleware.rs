use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use lobby_gateway::identity::bearer_token;

use crate::auth::AppState;
use crate::error::ApiError;

/// Resolve the bearer token to a `UserIdentity` and attach it to the request.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers()).ok_or(ApiError::Unauthorized)?;
    let identity = state.verifier.verify(&token).await?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
