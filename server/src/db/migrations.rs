use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking, so no migration table is needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: Initial schema

CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip TEXT NOT NULL UNIQUE,
    username TEXT,
    last_seen TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_users_last_seen ON users(last_seen);

-- user_id carries no foreign key: the inactivity sweep deletes users while
-- their message history stays.
CREATE TABLE messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    kind INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_messages_created_at ON messages(created_at);
",
        ),
        M::up(
            "-- Migration 2: Recall status and file attachments

ALTER TABLE messages ADD COLUMN status INTEGER NOT NULL DEFAULT 0;
ALTER TABLE messages ADD COLUMN file_name TEXT;
ALTER TABLE messages ADD COLUMN file_size INTEGER;
",
        ),
    ])
}
