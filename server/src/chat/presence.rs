//! Server-side presence tracking.
//!
//! Presence answers "does this user hold an open session right now". It is
//! driven only by hub registration and deregistration, never by a timer, and
//! is distinct from the durable last-seen timestamp in storage.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::db::models::User;

/// Open-session count per user id. A user with two tabs open stays active
/// until both are gone.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    sessions: Arc<DashMap<i64, usize>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the hub when a session is registered.
    pub fn mark_active(&self, user_id: i64) {
        *self.sessions.entry(user_id).or_insert(0) += 1;
    }

    /// Called by the hub when a session leaves the registry.
    pub fn mark_inactive(&self, user_id: i64) {
        if let Entry::Occupied(mut entry) = self.sessions.entry(user_id) {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }

    pub fn is_active(&self, user_id: i64) -> bool {
        self.sessions.contains_key(&user_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Filter durable "recently seen" users down to those with an open session.
    pub fn snapshot(&self, candidates: Vec<User>) -> Vec<User> {
        candidates
            .into_iter()
            .filter(|user| self.is_active(user.id))
            .collect()
    }
}
