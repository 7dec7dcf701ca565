use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::debug;

use lobby_db::NewMessage;
use lobby_types::api::{SendMessageRequest, UpdateMessageRequest};
use lobby_types::events::ServerEvent;
use lobby_types::models::{Message, MessageId, UserIdentity};

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};
use crate::rooms::visible_room;

pub async fn get_messages(
    State(state): State<AppState>,
    Path(link): Path<String>,
    Extension(identity): Extension<UserIdentity>,
) -> ApiResult<Json<Vec<Message>>> {
    let room = visible_room(&state, &identity, link).await?;
    let room_id = room.id;
    let messages = state.store.call(move |db| db.list_messages(room_id)).await?;
    Ok(Json(messages))
}

/// Persist a message, then fan it out to the room's live sessions exactly
/// as if it had arrived over a chat connection.
pub async fn send_message(
    State(state): State<AppState>,
    Path(link): Path<String>,
    Extension(identity): Extension<UserIdentity>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let room = visible_room(&state, &identity, link).await?;

    let new = NewMessage {
        author_id: identity.id,
        room_id: room.id,
        kind: req.message_type,
        content: req.content,
        file: req.file,
        parent_id: req.parent,
    };
    let message = state.store.call(move |db| db.create_message(new)).await?;

    let recipients = state
        .registry
        .broadcast(room.id, ServerEvent::chat_message(&message));
    debug!("REST message {} in {} reached {} sessions", message.id, room.link, recipients);

    Ok((StatusCode::CREATED, Json(message)))
}

async fn own_message(state: &AppState, identity: &UserIdentity, id: MessageId) -> ApiResult<Message> {
    let message = state.store.call(move |db| db.get_message(id)).await?;
    if message.author_id != identity.id {
        return Err(ApiError::Forbidden("Only the author may change this message."));
    }
    Ok(message)
}

pub async fn update_message(
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
    Extension(identity): Extension<UserIdentity>,
    Json(req): Json<UpdateMessageRequest>,
) -> ApiResult<Json<Message>> {
    own_message(&state, &identity, id).await?;
    let updated = state
        .store
        .call(move |db| db.update_message_content(id, &req.content))
        .await?;
    Ok(Json(updated))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
    Extension(identity): Extension<UserIdentity>,
) -> ApiResult<StatusCode> {
    own_message(&state, &identity, id).await?;
    state.store.call(move |db| db.delete_message(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
