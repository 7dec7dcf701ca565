use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;
use uuid::Uuid;

use lobby_types::models::{Message, MessageId, MessageKind, RoomId};

use crate::convert;
use crate::{Database, StoreError};

const MESSAGE_SELECT: &str = "SELECT m.id, m.room_id, m.author_id, u.username, m.kind, m.content, m.file,
        m.parent_id, m.created_at, m.updated_at
     FROM messages m
     JOIN users u ON m.author_id = u.id";

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub author_id: Uuid,
    pub room_id: RoomId,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub file: Option<String>,
    pub parent_id: Option<MessageId>,
}

impl NewMessage {
    pub fn text(author_id: Uuid, room_id: RoomId, content: impl Into<String>) -> Self {
        Self {
            author_id,
            room_id,
            kind: MessageKind::Text,
            content: Some(content.into()),
            file: None,
            parent_id: None,
        }
    }

    /// Text needs content, image and file messages need a file reference.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.kind == MessageKind::Text && is_blank(&self.content) {
            return Err(StoreError::Validation(
                "Text message must contain content.".into(),
            ));
        }
        if self.kind.needs_file() && is_blank(&self.file) {
            return Err(StoreError::Validation(
                "Image/File message must contain a file.".into(),
            ));
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(str::is_empty)
}

/// Next timestamp for a room: never earlier than now and always strictly
/// after the room's latest message.
fn next_timestamp(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match last {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}

impl Database {
    /// Persist a message. The creation timestamp is assigned here, under the
    /// writer lock, so per-room order follows completion order.
    pub fn create_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        new.validate()?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let room_exists = tx
                .query_row("SELECT 1 FROM rooms WHERE id = ?1", [new.room_id], |_| Ok(()))
                .optional()?
                .is_some();
            if !room_exists {
                return Err(StoreError::NotFound("room"));
            }

            if let Some(parent_id) = new.parent_id {
                let parent_room: Option<RoomId> = tx
                    .query_row("SELECT room_id FROM messages WHERE id = ?1", [parent_id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                if parent_room != Some(new.room_id) {
                    return Err(StoreError::Validation(
                        "parent message must belong to the same room".into(),
                    ));
                }
            }

            let last: Option<String> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE room_id = ?1",
                [new.room_id],
                |row| row.get(0),
            )?;
            let last = last
                .map(|raw| convert::parse_timestamp(&raw))
                .transpose()
                .map_err(|e| convert::conversion_error(0, e))?;
            let created_at = convert::format_timestamp(next_timestamp(last, Utc::now()));

            tx.execute(
                "INSERT INTO messages (room_id, author_id, kind, content, file, parent_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    new.room_id,
                    new.author_id.to_string(),
                    new.kind.as_str(),
                    new.content,
                    new.file,
                    new.parent_id,
                    created_at,
                ],
            )?;
            let id = tx.last_insert_rowid();
            let message = query_message(&tx, id)?.ok_or(StoreError::NotFound("message"))?;
            tx.commit()?;

            debug!("Message {} stored in room {}", message.id, message.room_id);
            Ok(message)
        })
    }

    /// All messages of a room, oldest first.
    pub fn list_messages(&self, room_id: RoomId) -> Result<Vec<Message>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("{MESSAGE_SELECT} WHERE m.room_id = ?1 ORDER BY m.created_at ASC, m.id ASC");
            let rows = conn
                .prepare(&sql)?
                .query_map([room_id], map_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message, StoreError> {
        self.with_conn(|conn| query_message(conn, id))?
            .ok_or(StoreError::NotFound("message"))
    }

    pub fn update_message_content(
        &self,
        id: MessageId,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.with_conn_mut(|conn| {
            let current = query_message(conn, id)?.ok_or(StoreError::NotFound("message"))?;
            if current.kind == MessageKind::Text && content.is_empty() {
                return Err(StoreError::Validation(
                    "Text message must contain content.".into(),
                ));
            }

            conn.execute(
                "UPDATE messages SET content = ?1, updated_at = ?2 WHERE id = ?3",
                params![content, convert::format_timestamp(Utc::now()), id],
            )?;
            query_message(conn, id)?.ok_or(StoreError::NotFound("message"))
        })
    }

    /// Delete a message. Replies keep existing with their parent cleared.
    pub fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            if removed == 0 {
                return Err(StoreError::NotFound("message"));
            }
            Ok(())
        })
    }
}

fn query_message(conn: &Connection, id: MessageId) -> Result<Option<Message>, StoreError> {
    let sql = format!("{MESSAGE_SELECT} WHERE m.id = ?1");
    let message = conn.prepare(&sql)?.query_row([id], map_message).optional()?;
    Ok(message)
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        room_id: row.get(1)?,
        author_id: convert::uuid(row, 2)?,
        author_username: row.get(3)?,
        kind: convert::variant(row, 4)?,
        content: row.get(5)?,
        file: row.get(6)?,
        parent_id: row.get(7)?,
        created_at: convert::timestamp(row, 8)?,
        updated_at: convert::timestamp(row, 9)?,
    })
}
