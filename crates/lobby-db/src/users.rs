use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use lobby_types::models::UserIdentity;

use crate::convert;
use crate::error::is_unique_violation;
use crate::{Database, StoreError};

/// Database row for a user. The password hash never leaves the store
/// except for verification at login.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl UserRow {
    pub fn identity(&self) -> UserIdentity {
        UserIdentity {
            id: self.id,
            username: self.username.clone(),
        }
    }
}

impl Database {
    pub fn create_user(
        &self,
        id: Uuid,
        username: &str,
        password_hash: &str,
    ) -> Result<UserIdentity, StoreError> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                (
                    id.to_string(),
                    username,
                    password_hash,
                    convert::format_timestamp(Utc::now()),
                ),
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!("username {username} is taken"))
                } else {
                    e.into()
                }
            })?;

            Ok(UserIdentity {
                id,
                username: username.to_string(),
            })
        })
    }

    pub fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user(conn, "id", &id.to_string()))
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>, StoreError> {
    let sql = format!("SELECT id, username, password, created_at FROM users WHERE {column} = ?1");
    let row = conn
        .prepare(&sql)?
        .query_row([value], map_user)
        .optional()?;

    Ok(row)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: convert::uuid(row, 0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        created_at: convert::timestamp(row, 3)?,
    })
}
