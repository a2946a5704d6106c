pub mod migrations;
pub mod models;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::store::StoreError;

/// Type alias for the shared database connection.
/// rusqlite is synchronous; we wrap in Arc<Mutex> for thread safety
/// with tokio::task::spawn_blocking for DB operations.
pub type DbPool = Arc<Mutex<Connection>>;

/// Initialize the SQLite database: create data directory if needed,
/// open (or create) the database file, enable WAL mode, and run migrations.
pub fn init_db(data_dir: &str) -> Result<DbPool, StoreError> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("lanchat.db");
    let mut conn = Connection::open(&db_path)?;

    // Enable WAL mode for better concurrent read performance
    conn.pragma_update(None, "journal_mode", "WAL")?;

    migrations::migrations().to_latest(&mut conn)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

/// Fixed-width UTC timestamp so TEXT columns compare chronologically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let earlier = Utc::now();
        let later = earlier + Duration::milliseconds(1500);
        assert!(format_timestamp(earlier) < format_timestamp(later));
    }

    #[test]
    fn test_timestamp_roundtrip_keeps_micros() {
        let at = parse_timestamp("2026-10-19T04:02:00.123456Z").unwrap();
        assert_eq!(format_timestamp(at), "2026-10-19T04:02:00.123456Z");
    }

    #[test]
    fn test_init_db_creates_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested");
        let db = init_db(dir.to_str().unwrap()).unwrap();
        assert!(dir.join("lanchat.db").exists());

        let conn = db.lock().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'messages')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}
