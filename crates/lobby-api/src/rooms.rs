use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use lobby_db::NewRoom;
use lobby_gateway::gate::may_join;
use lobby_types::api::{CreateRoomRequest, CreateRoomResponse};
use lobby_types::models::{Role, Room, RoomKind, UserIdentity};

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

/// Load a room the caller is allowed to see: any public room, or a private
/// or direct room they belong to.
pub(crate) async fn visible_room(state: &AppState, identity: &UserIdentity, link: String) -> ApiResult<Room> {
    let room = state.store.call(move |db| db.get_room_by_link(&link)).await?;

    if !may_join(&state.store, identity, &room).await? {
        return Err(ApiError::Forbidden("You do not have permission to view this room."));
    }
    Ok(room)
}

pub async fn create_room(
    State(state): State<AppState>,
    Extension(identity): Extension<UserIdentity>,
    Json(req): Json<CreateRoomRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.room_type == RoomKind::Direct {
        return Err(ApiError::BadRequest(
            "direct rooms are created by connecting to a user".into(),
        ));
    }

    let new = NewRoom {
        name: req.name,
        description: req.description,
        kind: req.room_type,
        link: req.link,
    };
    let creator = identity.id;
    let room = state.store.call(move |db| db.create_room(new, Some(creator))).await?;

    info!("{} created {} room {}", identity.username, room.kind, room.link);

    Ok((
        StatusCode::CREATED,
        Json(CreateRoomResponse {
            message: "Room created successfully",
            room,
            admin: identity.username,
        }),
    ))
}

pub async fn list_public_rooms(State(state): State<AppState>) -> ApiResult<Json<Vec<Room>>> {
    let rooms = state.store.call(|db| db.list_public_rooms()).await?;
    Ok(Json(rooms))
}

pub async fn list_direct_rooms(
    State(state): State<AppState>,
    Extension(identity): Extension<UserIdentity>,
) -> ApiResult<Json<Vec<Room>>> {
    let user_id = identity.id;
    let rooms = state.store.call(move |db| db.list_direct_rooms_for(user_id)).await?;
    Ok(Json(rooms))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(link): Path<String>,
    Extension(identity): Extension<UserIdentity>,
) -> ApiResult<Json<Room>> {
    Ok(Json(visible_room(&state, &identity, link).await?))
}

/// Join a public or private room as a plain member.
pub async fn join_room(
    State(state): State<AppState>,
    Path(link): Path<String>,
    Extension(identity): Extension<UserIdentity>,
) -> ApiResult<impl IntoResponse> {
    let room = state.store.call(move |db| db.get_room_by_link(&link)).await?;
    if room.kind == RoomKind::Direct {
        return Err(ApiError::Forbidden("Direct rooms cannot be joined."));
    }

    let (user_id, room_id) = (identity.id, room.id);
    let membership = state
        .store
        .call(move |db| db.add_member(user_id, room_id, Role::Member))
        .await?;

    info!("{} joined room {}", identity.username, room.link);
    Ok((StatusCode::CREATED, Json(membership)))
}
