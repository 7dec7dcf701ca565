use rusqlite::Connection;
use tracing::info;

use crate::StoreError;

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            link        TEXT NOT NULL UNIQUE,
            name        TEXT NOT NULL,
            description TEXT,
            kind        TEXT NOT NULL DEFAULT 'PUBLIC'
                        CHECK (kind IN ('PUBLIC', 'PRIVATE', 'DIRECT')),
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memberships (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            room_id     INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            role        TEXT NOT NULL DEFAULT 'MEMBER'
                        CHECK (role IN ('ADMIN', 'MEMBER')),
            joined_at   TEXT NOT NULL,
            UNIQUE(user_id, room_id)
        );

        CREATE INDEX IF NOT EXISTS idx_memberships_room
            ON memberships(room_id);

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id     INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            author_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            kind        TEXT NOT NULL DEFAULT 'TEXT'
                        CHECK (kind IN ('TEXT', 'IMAGE', 'FILE')),
            content     TEXT,
            file        TEXT,
            parent_id   INTEGER REFERENCES messages(id) ON DELETE SET NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
