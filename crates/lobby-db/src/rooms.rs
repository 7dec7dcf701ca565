use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use lobby_types::models::{Membership, Role, Room, RoomId, RoomKind, UserIdentity};

use crate::convert;
use crate::error::{is_foreign_key_violation, is_unique_violation};
use crate::links::{self, PRIVATE_LINK_ATTEMPTS};
use crate::{Database, StoreError};

const ROOM_COLUMNS: &str = "id, link, name, description, kind, created_at, updated_at";

/// Input for room creation through the directory.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub name: String,
    pub description: Option<String>,
    pub kind: RoomKind,
    /// Required for public rooms, ignored for private ones.
    pub link: Option<String>,
}

impl Database {
    pub fn get_room_by_link(&self, link: &str) -> Result<Room, StoreError> {
        self.with_conn(|conn| query_room_by_link(conn, link))?
            .ok_or(StoreError::NotFound("room"))
    }

    /// Create a public or private room. When `creator` is given it is
    /// enrolled as admin in the same transaction.
    pub fn create_room(&self, new: NewRoom, creator: Option<Uuid>) -> Result<Room, StoreError> {
        self.create_room_with(new, creator, links::random_private_link)
    }

    pub(crate) fn create_room_with<G>(
        &self,
        new: NewRoom,
        creator: Option<Uuid>,
        mut generate_link: G,
    ) -> Result<Room, StoreError>
    where
        G: FnMut() -> String,
    {
        if new.name.trim().is_empty() {
            return Err(StoreError::Validation("room name must not be empty".into()));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let link = match new.kind {
                RoomKind::Public => {
                    let link = new.link.clone().unwrap_or_default();
                    if !links::is_valid_public_link(&link) {
                        return Err(StoreError::Validation(
                            "The provided link format is invalid.".into(),
                        ));
                    }
                    if link_exists(&tx, &link)? {
                        return Err(StoreError::Validation(
                            "The provided link is already in use.".into(),
                        ));
                    }
                    link
                }
                RoomKind::Private => {
                    let mut attempts = 0;
                    loop {
                        if attempts == PRIVATE_LINK_ATTEMPTS {
                            return Err(StoreError::ResourceExhausted(format!(
                                "no free private link after {PRIVATE_LINK_ATTEMPTS} attempts"
                            )));
                        }
                        attempts += 1;

                        let candidate = generate_link();
                        if !link_exists(&tx, &candidate)? {
                            break candidate;
                        }
                        debug!("Private link collision on attempt {}", attempts);
                    }
                }
                RoomKind::Direct => {
                    return Err(StoreError::Validation(
                        "direct rooms are created by opening a direct chat".into(),
                    ));
                }
            };

            let room = insert_room(&tx, &link, &new.name, new.description.as_deref(), new.kind)?;
            if let Some(creator) = creator {
                insert_membership(&tx, creator, room.id, Role::Admin)?;
            }
            tx.commit()?;

            info!("Created {} room {} ({})", room.kind, room.link, room.name);
            Ok(room)
        })
    }

    /// Idempotently resolve the direct room between two users, creating it
    /// and both memberships when missing.
    pub fn get_or_create_direct_room(
        &self,
        a: &UserIdentity,
        b: &UserIdentity,
    ) -> Result<Room, StoreError> {
        if a.id == b.id {
            return Err(StoreError::Validation(
                "a direct room needs two different users".into(),
            ));
        }

        let link = links::direct_link(&a.username, &b.username);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let room = match query_room_by_link(&tx, &link)? {
                Some(room) if room.kind == RoomKind::Direct => room,
                Some(room) => {
                    return Err(StoreError::Validation(format!(
                        "link {} belongs to a {} room",
                        room.link, room.kind
                    )));
                }
                None => {
                    let room = insert_room(&tx, &link, &link, None, RoomKind::Direct)?;
                    info!("Created new direct room with link: {}", link);
                    room
                }
            };

            let joined_at = convert::format_timestamp(Utc::now());
            for user in [a, b] {
                tx.execute(
                    "INSERT OR IGNORE INTO memberships (user_id, room_id, role, joined_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![user.id.to_string(), room.id, Role::Member.as_str(), joined_at],
                )?;
            }
            tx.commit()?;

            Ok(room)
        })
    }

    pub fn list_public_rooms(&self) -> Result<Vec<Room>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE kind = 'PUBLIC' ORDER BY id");
            let rooms = conn
                .prepare(&sql)?
                .query_map([], map_room)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rooms)
        })
    }

    pub fn list_direct_rooms_for(&self, user_id: Uuid) -> Result<Vec<Room>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.link, r.name, r.description, r.kind, r.created_at, r.updated_at
                 FROM rooms r
                 JOIN memberships m ON m.room_id = r.id
                 WHERE r.kind = 'DIRECT' AND m.user_id = ?1
                 ORDER BY r.id",
            )?;
            let rooms = stmt
                .query_map([user_id.to_string()], map_room)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rooms)
        })
    }

    // -- Memberships --

    pub fn is_member(&self, user_id: Uuid, room_id: RoomId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM memberships WHERE user_id = ?1 AND room_id = ?2",
                    params![user_id.to_string(), room_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Enroll a user. Fails with `Conflict` if they already hold a membership.
    pub fn add_member(
        &self,
        user_id: Uuid,
        room_id: RoomId,
        role: Role,
    ) -> Result<Membership, StoreError> {
        self.with_conn_mut(|conn| insert_membership(conn, user_id, room_id, role))
    }

    pub fn memberships_for_room(&self, room_id: RoomId) -> Result<Vec<Membership>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, room_id, role, joined_at FROM memberships
                 WHERE room_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([room_id], map_membership)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn link_exists(conn: &Connection, link: &str) -> Result<bool, StoreError> {
    let found = conn
        .query_row("SELECT 1 FROM rooms WHERE link = ?1", [link], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn query_room_by_link(conn: &Connection, link: &str) -> Result<Option<Room>, StoreError> {
    let sql = format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE link = ?1");
    let room = conn.prepare(&sql)?.query_row([link], map_room).optional()?;
    Ok(room)
}

fn insert_room(
    conn: &Connection,
    link: &str,
    name: &str,
    description: Option<&str>,
    kind: RoomKind,
) -> Result<Room, StoreError> {
    let now = Utc::now();
    let ts = convert::format_timestamp(now);

    conn.execute(
        "INSERT INTO rooms (link, name, description, kind, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![link, name, description, kind.as_str(), ts],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("link {link} is already in use"))
        } else {
            e.into()
        }
    })?;

    // Re-read so timestamps carry the stored precision.
    query_room_by_link(conn, link)?.ok_or(StoreError::NotFound("room"))
}

fn insert_membership(
    conn: &Connection,
    user_id: Uuid,
    room_id: RoomId,
    role: Role,
) -> Result<Membership, StoreError> {
    let joined_at = convert::format_timestamp(Utc::now());
    conn.execute(
        "INSERT INTO memberships (user_id, room_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
        params![user_id.to_string(), room_id, role.as_str(), joined_at],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict("User is already a member of this room.".into())
        } else if is_foreign_key_violation(&e) {
            StoreError::NotFound("room or user")
        } else {
            e.into()
        }
    })?;

    let membership = conn.query_row(
        "SELECT id, user_id, room_id, role, joined_at FROM memberships WHERE id = ?1",
        [conn.last_insert_rowid()],
        map_membership,
    )?;
    Ok(membership)
}

fn map_room(row: &Row<'_>) -> rusqlite::Result<Room> {
    Ok(Room {
        id: row.get(0)?,
        link: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        kind: convert::variant(row, 4)?,
        created_at: convert::timestamp(row, 5)?,
        updated_at: convert::timestamp(row, 6)?,
    })
}

fn map_membership(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        id: row.get(0)?,
        user_id: convert::uuid(row, 1)?,
        room_id: row.get(2)?,
        role: convert::variant(row, 3)?,
        joined_at: convert::timestamp(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(db: &Database, name: &str) -> UserIdentity {
        db.create_user(Uuid::new_v4(), name, "hash").unwrap()
    }

    fn public(name: &str, link: &str) -> NewRoom {
        NewRoom {
            name: name.into(),
            description: None,
            kind: RoomKind::Public,
            link: Some(link.into()),
        }
    }

    fn private(name: &str) -> NewRoom {
        NewRoom {
            name: name.into(),
            description: Some("secret".into()),
            kind: RoomKind::Private,
            link: None,
        }
    }

    #[test]
    fn test_public_link_accepted_iff_valid_and_unused() {
        let db = Database::open_in_memory().unwrap();

        let cases = [
            ("general", true),
            ("general", false), // taken now
            ("rust_lang", true),
            ("bad link", false),
            ("bad-link", false),
            ("", false),
            ("Room42", true),
        ];
        for (link, ok) in cases {
            let result = db.create_room(public("room", link), None);
            assert_eq!(result.is_ok(), ok, "link {link:?}");
            if let Err(err) = result {
                assert!(err.is_validation(), "link {link:?}: {err}");
            }
        }

        let err = db
            .create_room(
                NewRoom {
                    link: None,
                    ..public("room", "")
                },
                None,
            )
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_creator_enrolled_as_admin() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");

        let room = db.create_room(public("General", "general"), Some(alice.id)).unwrap();
        let members = db.memberships_for_room(room.id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, alice.id);
        assert_eq!(members[0].role, Role::Admin);
    }

    #[test]
    fn test_private_link_generated() {
        let db = Database::open_in_memory().unwrap();
        let room = db.create_room(private("Hideout"), None).unwrap();

        assert_eq!(room.kind, RoomKind::Private);
        assert_eq!(room.link.len(), links::PRIVATE_LINK_LEN);
        assert_eq!(db.get_room_by_link(&room.link).unwrap().id, room.id);
    }

    #[test]
    fn test_private_link_ignores_caller_link() {
        let db = Database::open_in_memory().unwrap();
        let room = db
            .create_room(
                NewRoom {
                    link: Some("chosen".into()),
                    ..private("Hideout")
                },
                None,
            )
            .unwrap();
        assert_ne!(room.link, "chosen");
    }

    #[test]
    fn test_private_link_regenerated_on_collision() {
        let db = Database::open_in_memory().unwrap();
        db.create_room(public("taken", "taken_link"), None).unwrap();

        let mut candidates = vec!["fresh_link".to_string(), "taken_link".to_string()];
        let room = db
            .create_room_with(private("Hideout"), None, || candidates.pop().unwrap())
            .unwrap();
        assert_eq!(room.link, "fresh_link");
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_private_link_retry_is_capped() {
        let db = Database::open_in_memory().unwrap();
        db.create_room(public("taken", "taken_link"), None).unwrap();

        let mut calls = 0;
        let err = db
            .create_room_with(private("Hideout"), None, || {
                calls += 1;
                "taken_link".to_string()
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::ResourceExhausted(_)));
        assert_eq!(calls, PRIVATE_LINK_ATTEMPTS);
    }

    #[test]
    fn test_direct_kind_rejected_by_create_room() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .create_room(
                NewRoom {
                    kind: RoomKind::Direct,
                    ..public("dm", "link_a_b")
                },
                None,
            )
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_direct_room_created_with_both_members() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");

        let room = db.get_or_create_direct_room(&alice, &bob).unwrap();
        assert_eq!(room.link, "link_alice_bob");
        assert_eq!(room.kind, RoomKind::Direct);

        let members = db.memberships_for_room(room.id).unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.role == Role::Member));
        assert!(db.is_member(alice.id, room.id).unwrap());
        assert!(db.is_member(bob.id, room.id).unwrap());
    }

    #[test]
    fn test_direct_room_commutative_and_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");

        let first = db.get_or_create_direct_room(&alice, &bob).unwrap();
        let second = db.get_or_create_direct_room(&bob, &alice).unwrap();
        let third = db.get_or_create_direct_room(&alice, &bob).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.id, third.id);

        assert_eq!(db.memberships_for_room(first.id).unwrap().len(), 2);
        assert_eq!(db.list_direct_rooms_for(alice.id).unwrap().len(), 1);
        assert_eq!(db.list_direct_rooms_for(bob.id).unwrap().len(), 1);
    }

    #[test]
    fn test_direct_room_with_self_rejected() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        assert!(db.get_or_create_direct_room(&alice, &alice).unwrap_err().is_validation());
    }

    #[test]
    fn test_public_room_cannot_squat_direct_link() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");

        let err = db.create_room(public("squatter", "link_alice_bob"), None).unwrap_err();
        assert!(err.is_validation());

        let room = db.get_or_create_direct_room(&alice, &bob).unwrap();
        assert_eq!(room.kind, RoomKind::Direct);
        assert_eq!(room.link, "link_alice_bob");
    }

    #[test]
    fn test_direct_link_held_by_other_kind() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        // rows written before the prefix was reserved
        db.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO rooms (link, name, kind, created_at, updated_at)
                 VALUES ('link_alice_bob', 'legacy', 'PUBLIC', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        assert!(db.get_or_create_direct_room(&alice, &bob).unwrap_err().is_validation());
    }

    #[test]
    fn test_add_member_conflicts_on_repeat() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let room = db.create_room(private("Hideout"), None).unwrap();

        assert!(!db.is_member(alice.id, room.id).unwrap());
        let membership = db.add_member(alice.id, room.id, Role::Member).unwrap();
        assert_eq!(membership.role, Role::Member);
        assert!(db.is_member(alice.id, room.id).unwrap());

        let err = db.add_member(alice.id, room.id, Role::Member).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_list_public_rooms_excludes_others() {
        let db = Database::open_in_memory().unwrap();
        db.create_room(public("a", "a"), None).unwrap();
        db.create_room(private("b"), None).unwrap();
        db.create_room(public("c", "c"), None).unwrap();

        let links: Vec<String> = db.list_public_rooms().unwrap().into_iter().map(|r| r.link).collect();
        assert_eq!(links, vec!["a", "c"]);
    }

    #[test]
    fn test_missing_room_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_room_by_link("nope").unwrap_err(),
            StoreError::NotFound("room")
        ));
    }
}
