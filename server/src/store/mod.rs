//! Persistence gateway consumed by the chat core.
//!
//! The core never builds SQL; it only calls [`PersistenceGateway`]. Two
//! interchangeable implementations exist and one is picked at startup:
//! [`memory::MemoryStore`] and [`sqlite::SqliteStore`].

pub mod memory;
pub mod sqlite;

use chrono::Duration;
use std::sync::Arc;

use crate::db::models::{NewMessage, Statistics, StoredMessage, User};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Lock,
    #[error("record not found")]
    NotFound,
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of resolving a connection's origin address to a user.
#[derive(Debug, Clone)]
pub struct UserLookup {
    pub user: User,
    /// True when this origin had never been seen before.
    pub created: bool,
}

pub type Store = Arc<dyn PersistenceGateway>;

/// Storage operations used by sessions, the router and the sweep.
///
/// Implementations provide their own internal synchronization; callers issue
/// independent calls and never hold a transaction across them.
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Returns the user for `origin`, creating one on first sight. Existing
    /// users get their last-seen timestamp refreshed.
    fn find_or_create_user_by_origin(&self, origin: &str) -> Result<UserLookup, StoreError>;

    fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError>;

    fn touch_last_seen(&self, user_id: i64) -> Result<(), StoreError>;

    /// Persists a message, assigning its id and creation time.
    fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    fn get_message(&self, message_id: i64) -> Result<Option<StoredMessage>, StoreError>;

    /// Idempotent status flip to recalled.
    fn set_message_recalled(&self, message_id: i64) -> Result<(), StoreError>;

    fn rename_user(&self, user_id: i64, username: &str) -> Result<(), StoreError>;

    /// Users whose last-seen falls within `within` of now, most recent first.
    fn list_recently_seen_users(&self, within: Duration) -> Result<Vec<User>, StoreError>;

    /// Deletes users idle for longer than `older_than`. Returns the count removed.
    fn delete_inactive_users(&self, older_than: Duration) -> Result<usize, StoreError>;

    /// Last `limit` messages, oldest first.
    fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;

    /// Case-insensitive substring match on content, username and file name, newest first.
    fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;

    fn statistics(&self) -> Result<Statistics, StoreError>;
}

/// Run a store call on the blocking pool so SQLite I/O never stalls the
/// async workers.
pub async fn run_blocking<T, F>(store: &Store, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn PersistenceGateway) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref())).await?
}
