use lobby_db::{Store, StoreError};
use lobby_types::models::{Room, UserIdentity};

/// May `identity` join `room`? Public rooms admit any authenticated user;
/// private and direct rooms require a stored membership.
pub async fn may_join(store: &Store, identity: &UserIdentity, room: &Room) -> Result<bool, StoreError> {
    if room.is_public() {
        return Ok(true);
    }

    let (user_id, room_id) = (identity.id, room.id);
    store.call(move |db| db.is_member(user_id, room_id)).await
}
