//! SQLite-backed store.
//!
//! One connection behind `Arc<Mutex>`; every call takes the lock for the
//! duration of its statements, so a find-or-create is atomic with respect to
//! other callers.

use chrono::Duration;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::{Arc, MutexGuard};

use super::{PersistenceGateway, StoreError, UserLookup};
use crate::clock::Clock;
use crate::db::models::{
    MessageKind, MessageStatus, NewMessage, Statistics, StoredMessage, User,
};
use crate::db::{format_timestamp, parse_timestamp, DbPool};

const MESSAGE_COLUMNS: &str = "m.id, m.user_id, u.username, m.content, m.kind, m.status, m.file_name, m.file_size, m.created_at";

pub struct SqliteStore {
    db: DbPool,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn new(db: DbPool, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::Lock)
    }

    fn now(&self) -> String {
        format_timestamp(self.clock.now())
    }
}

/// Convert a malformed timestamp column into a rusqlite conversion error.
fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp: {raw}").into(),
        )
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        ip: row.get(1)?,
        username: row.get(2)?,
        last_seen: timestamp_column(row, 3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let kind_code: i64 = row.get(4)?;
    let kind = MessageKind::from_code(kind_code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Integer,
            format!("unknown message kind: {kind_code}").into(),
        )
    })?;

    Ok(StoredMessage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        content: row.get(3)?,
        kind,
        status: MessageStatus::from_code(row.get(5)?),
        file_name: row.get(6)?,
        file_size: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
    })
}

impl PersistenceGateway for SqliteStore {
    fn find_or_create_user_by_origin(&self, origin: &str) -> Result<UserLookup, StoreError> {
        let now = self.now();
        let conn = self.conn()?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM users WHERE ip = ?1",
                params![origin],
                |row| row.get(0),
            )
            .optional()?;

        let created = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE users SET last_seen = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                false
            }
            None => {
                conn.execute(
                    "INSERT INTO users (ip, username, last_seen, created_at) VALUES (?1, NULL, ?2, ?2)",
                    params![origin, now],
                )?;
                true
            }
        };

        let user = conn.query_row(
            "SELECT id, ip, username, last_seen FROM users WHERE ip = ?1",
            params![origin],
            user_from_row,
        )?;

        Ok(UserLookup { user, created })
    }

    fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, ip, username, last_seen FROM users WHERE id = ?1",
                params![user_id],
                user_from_row,
            )
            .optional()?)
    }

    fn touch_last_seen(&self, user_id: i64) -> Result<(), StoreError> {
        let now = self.now();
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE users SET last_seen = ?1 WHERE id = ?2",
            params![now, user_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let now = self.now();
        let conn = self.conn()?;

        let (file_name, file_size) = match &message.file {
            Some(file) => (Some(file.name.as_str()), Some(file.size)),
            None => (None, None),
        };

        conn.execute(
            "INSERT INTO messages (user_id, content, kind, status, file_name, file_size, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)",
            params![
                message.user_id,
                message.content,
                message.kind.code(),
                file_name,
                file_size,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(conn.query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m LEFT JOIN users u ON m.user_id = u.id WHERE m.id = ?1"
            ),
            params![id],
            message_from_row,
        )?)
    }

    fn get_message(&self, message_id: i64) -> Result<Option<StoredMessage>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m LEFT JOIN users u ON m.user_id = u.id WHERE m.id = ?1"
                ),
                params![message_id],
                message_from_row,
            )
            .optional()?)
    }

    fn set_message_recalled(&self, message_id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2",
            params![MessageStatus::Recalled.code(), message_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn rename_user(&self, user_id: i64, username: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE users SET username = ?1 WHERE id = ?2",
            params![username, user_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn list_recently_seen_users(&self, within: Duration) -> Result<Vec<User>, StoreError> {
        let threshold = format_timestamp(self.clock.now() - within);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, ip, username, last_seen FROM users WHERE last_seen > ?1 ORDER BY last_seen DESC",
        )?;
        let users = stmt
            .query_map(params![threshold], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn delete_inactive_users(&self, older_than: Duration) -> Result<usize, StoreError> {
        let threshold = format_timestamp(self.clock.now() - older_than);
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM users WHERE last_seen < ?1",
            params![threshold],
        )?)
    }

    fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m LEFT JOIN users u ON m.user_id = u.id
             ORDER BY m.id DESC LIMIT ?1"
        ))?;
        let mut messages = stmt
            .query_map(params![limit as i64], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m LEFT JOIN users u ON m.user_id = u.id
             WHERE m.content LIKE ?1 ESCAPE '\\'
                OR u.username LIKE ?1 ESCAPE '\\'
                OR m.file_name LIKE ?1 ESCAPE '\\'
             ORDER BY m.id DESC LIMIT ?2"
        ))?;
        let messages = stmt
            .query_map(params![like_pattern(query), limit as i64], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn statistics(&self) -> Result<Statistics, StoreError> {
        let conn = self.conn()?;
        let user_count = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let message_count =
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(Statistics {
            user_count,
            message_count,
        })
    }
}

/// Substring pattern for `LIKE .. ESCAPE '\'` that matches `query` literally.
/// SQLite's LIKE folds ASCII case only, same as the memory store.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}
