//! In-memory store used when no database is configured or SQLite is unavailable.

use chrono::Duration;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{PersistenceGateway, StoreError, UserLookup};
use crate::clock::Clock;
use crate::db::models::{MessageStatus, NewMessage, Statistics, StoredMessage, User};

#[derive(Default)]
struct Inner {
    users: BTreeMap<i64, User>,
    by_origin: HashMap<String, i64>,
    messages: BTreeMap<i64, StoredMessage>,
    last_user_id: i64,
    last_message_id: i64,
}

impl Inner {
    fn username_of(&self, user_id: i64) -> Option<String> {
        self.users.get(&user_id).and_then(|u| u.username.clone())
    }

    /// Stored messages keep the name captured at write time; refresh from the
    /// live user record when it still exists.
    fn with_current_username(&self, message: &StoredMessage) -> StoredMessage {
        let mut message = message.clone();
        if let Some(user) = self.users.get(&message.user_id) {
            message.username = user.username.clone();
        }
        message
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Lock)
    }
}

/// Literal substring match folding ASCII case only, like SQLite's LIKE.
fn contains_ignore_case(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_ascii_lowercase().contains(needle_lower)
}

impl PersistenceGateway for MemoryStore {
    fn find_or_create_user_by_origin(&self, origin: &str) -> Result<UserLookup, StoreError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;

        if let Some(id) = inner.by_origin.get(origin).copied() {
            if let Some(user) = inner.users.get_mut(&id) {
                user.last_seen = now;
                return Ok(UserLookup {
                    user: user.clone(),
                    created: false,
                });
            }
        }

        inner.last_user_id += 1;
        let user = User {
            id: inner.last_user_id,
            ip: origin.to_string(),
            username: None,
            last_seen: now,
        };
        inner.by_origin.insert(origin.to_string(), user.id);
        inner.users.insert(user.id, user.clone());

        Ok(UserLookup {
            user,
            created: true,
        })
    }

    fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    fn touch_last_seen(&self, user_id: i64) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let user = inner.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        user.last_seen = now;
        Ok(())
    }

    fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;

        inner.last_message_id += 1;
        let (file_name, file_size) = match message.file {
            Some(file) => (Some(file.name), Some(file.size)),
            None => (None, None),
        };
        let stored = StoredMessage {
            id: inner.last_message_id,
            user_id: message.user_id,
            username: inner.username_of(message.user_id),
            content: message.content,
            kind: message.kind,
            status: MessageStatus::Normal,
            file_name,
            file_size,
            created_at: now,
        };
        inner.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn get_message(&self, message_id: i64) -> Result<Option<StoredMessage>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .get(&message_id)
            .map(|m| inner.with_current_username(m)))
    }

    fn set_message_recalled(&self, message_id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or(StoreError::NotFound)?;
        message.status = MessageStatus::Recalled;
        Ok(())
    }

    fn rename_user(&self, user_id: i64, username: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let user = inner.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        user.username = Some(username.to_string());
        Ok(())
    }

    fn list_recently_seen_users(&self, within: Duration) -> Result<Vec<User>, StoreError> {
        let threshold = self.clock.now() - within;
        let inner = self.lock()?;
        let mut users: Vec<User> = inner
            .users
            .values()
            .filter(|u| u.last_seen > threshold)
            .cloned()
            .collect();
        users.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(users)
    }

    fn delete_inactive_users(&self, older_than: Duration) -> Result<usize, StoreError> {
        let threshold = self.clock.now() - older_than;
        let mut inner = self.lock()?;

        let stale: Vec<(i64, String)> = inner
            .users
            .values()
            .filter(|u| u.last_seen < threshold)
            .map(|u| (u.id, u.ip.clone()))
            .collect();

        for (id, ip) in &stale {
            inner.users.remove(id);
            inner.by_origin.remove(ip);
        }

        Ok(stale.len())
    }

    fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.lock()?;
        let mut messages: Vec<StoredMessage> = inner
            .messages
            .values()
            .rev()
            .take(limit)
            .map(|m| inner.with_current_username(m))
            .collect();
        messages.reverse();
        Ok(messages)
    }

    fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let needle = query.to_ascii_lowercase();
        let inner = self.lock()?;
        Ok(inner
            .messages
            .values()
            .rev()
            .map(|m| inner.with_current_username(m))
            .filter(|m| {
                contains_ignore_case(&m.content, &needle)
                    || m.username
                        .as_deref()
                        .is_some_and(|n| contains_ignore_case(n, &needle))
                    || m.file_name
                        .as_deref()
                        .is_some_and(|n| contains_ignore_case(n, &needle))
            })
            .take(limit)
            .collect())
    }

    fn statistics(&self) -> Result<Statistics, StoreError> {
        let inner = self.lock()?;
        Ok(Statistics {
            user_count: inner.users.len() as i64,
            message_count: inner.messages.len() as i64,
        })
    }
}
