//! Message router: turns a decoded client frame into the ordered list of
//! outbound messages to fan out.
//!
//! The router never touches sockets. The session hands it a frame together
//! with the connection's identity and broadcasts whatever comes back, in
//! order. Errors are returned for the session to report; nothing is
//! broadcast for a frame that fails.

use chrono::Duration;
use std::sync::Arc;

use crate::chat::presence::PresenceTracker;
use crate::clock::Clock;
use crate::config::ChatConfig;
use crate::db::models::{FileMeta, MessageKind, MessageStatus, NewMessage, User};
use crate::store::{run_blocking, Store, StoreError};
use crate::ws::hub::SessionId;
use crate::ws::protocol::{ChatMessage, InboundMessage, OutboundMessage, Sender};

/// Server-side identity of the connection a frame arrived on.
#[derive(Debug, Clone)]
pub struct Origin {
    pub session_id: SessionId,
    pub user_id: i64,
    pub ip: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecallError {
    #[error("message not found")]
    NotFound,
    #[error("you can only recall your own messages")]
    NotOwner,
    #[error("the recall window for this message has passed")]
    WindowElapsed,
    #[error("message lookup failed: {0}")]
    Lookup(#[source] StoreError),
    #[error("failed to recall message: {0}")]
    Update(#[source] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("username is empty")]
    EmptyUsername,
    #[error("recall request has no message id")]
    MissingMessageId,
    #[error(transparent)]
    Recall(#[from] RecallError),
    #[error("failed to rename user: {0}")]
    Rename(#[source] StoreError),
}

pub struct MessageRouter {
    store: Store,
    presence: PresenceTracker,
    clock: Arc<dyn Clock>,
    recall_window: Duration,
    online_window: Duration,
}

impl MessageRouter {
    pub fn new(
        store: Store,
        presence: PresenceTracker,
        clock: Arc<dyn Clock>,
        chat: &ChatConfig,
    ) -> Self {
        Self {
            store,
            presence,
            clock,
            recall_window: chat.recall_window(),
            online_window: chat.online_window(),
        }
    }

    pub async fn route(
        &self,
        origin: &Origin,
        message: InboundMessage,
    ) -> Result<Vec<OutboundMessage>, RouteError> {
        match message {
            InboundMessage::Chat { kind, content } => {
                self.handle_chat(origin, kind.stored_kind(), content, None)
                    .await
            }
            InboundMessage::File { content, file } => {
                self.handle_chat(origin, MessageKind::File, content, Some(file))
                    .await
            }
            InboundMessage::Recall { message_id } => self.handle_recall(origin, message_id).await,
            InboundMessage::Rename { username } => self.handle_rename(origin, username).await,
        }
    }

    /// Resolve how a connection is shown to others. Falls back to the origin
    /// address if the user record is missing or unreadable.
    pub async fn sender(&self, origin: &Origin) -> Sender {
        let user_id = origin.user_id;
        let user = match run_blocking(&self.store, move |s| s.get_user(user_id)).await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(user_id = user_id, error = %e, "User lookup failed");
                None
            }
        };
        Sender {
            user_id,
            username: user
                .as_ref()
                .map(|u| u.display_name().to_string())
                .unwrap_or_else(|| origin.ip.clone()),
            ip: origin.ip.clone(),
        }
    }

    /// Users seen within the online window that also hold an open session.
    pub async fn presence_snapshot(&self) -> Result<Vec<User>, StoreError> {
        let within = self.online_window;
        let candidates =
            run_blocking(&self.store, move |s| s.list_recently_seen_users(within)).await?;
        Ok(self.presence.snapshot(candidates))
    }

    async fn handle_chat(
        &self,
        origin: &Origin,
        kind: MessageKind,
        content: String,
        file: Option<FileMeta>,
    ) -> Result<Vec<OutboundMessage>, RouteError> {
        if content.is_empty() {
            return Err(RouteError::EmptyContent);
        }

        let sender = self.sender(origin).await;
        let chat = ChatMessage {
            kind,
            sender,
            content: content.clone(),
            file: file.clone(),
            message_id: None,
            status: MessageStatus::Normal,
            created_at: self.clock.now(),
        };

        let new_message = NewMessage {
            user_id: origin.user_id,
            kind,
            content,
            file,
        };

        // A failed write still reaches the room, just without an id
        let chat = match run_blocking(&self.store, move |s| s.create_message(new_message)).await {
            Ok(stored) => chat.persisted(&stored),
            Err(e) => {
                tracing::error!(
                    user_id = origin.user_id,
                    kind = kind.as_str(),
                    error = %e,
                    "Failed to persist message, broadcasting without id"
                );
                chat
            }
        };

        Ok(vec![OutboundMessage::Chat(chat)])
    }

    async fn handle_recall(
        &self,
        origin: &Origin,
        message_id: i64,
    ) -> Result<Vec<OutboundMessage>, RouteError> {
        if message_id == 0 {
            return Err(RouteError::MissingMessageId);
        }

        let stored = run_blocking(&self.store, move |s| s.get_message(message_id))
            .await
            .map_err(RecallError::Lookup)?
            .ok_or(RecallError::NotFound)?;

        if stored.user_id != origin.user_id {
            return Err(RecallError::NotOwner.into());
        }

        let now = self.clock.now();
        if now - stored.created_at > self.recall_window {
            return Err(RecallError::WindowElapsed.into());
        }

        run_blocking(&self.store, move |s| s.set_message_recalled(message_id))
            .await
            .map_err(RecallError::Update)?;

        let sender = self.sender(origin).await;
        tracing::info!(
            message_id = message_id,
            user_id = origin.user_id,
            "Message recalled"
        );

        Ok(vec![
            OutboundMessage::Recall {
                message_id,
                user_id: origin.user_id,
                username: sender.username.clone(),
                created_at: now,
            },
            OutboundMessage::system(format!("{} recalled a message", sender.username), now),
        ])
    }

    async fn handle_rename(
        &self,
        origin: &Origin,
        username: String,
    ) -> Result<Vec<OutboundMessage>, RouteError> {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(RouteError::EmptyUsername);
        }

        let previous = self.sender(origin).await.username;

        let user_id = origin.user_id;
        let new_name = username.clone();
        run_blocking(&self.store, move |s| s.rename_user(user_id, &new_name))
            .await
            .map_err(RouteError::Rename)?;

        tracing::info!(user_id = user_id, from = %previous, to = %username, "User renamed");

        let mut outbound = vec![
            OutboundMessage::UserRename {
                user_id,
                username: username.clone(),
            },
            OutboundMessage::system(
                format!("{previous} is now known as {username}"),
                self.clock.now(),
            ),
        ];

        match self.presence_snapshot().await {
            Ok(users) => outbound.push(OutboundMessage::PresenceList(users)),
            Err(e) => tracing::warn!(error = %e, "Failed to build presence list after rename"),
        }

        Ok(outbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::models::{Statistics, StoredMessage};
    use crate::store::{MemoryStore, PersistenceGateway, UserLookup};
    use crate::ws::hub::Hub;
    use crate::ws::protocol::ChatKind;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Memory store with switchable failures.
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
        fail_lookups: AtomicBool,
    }

    impl FlakyStore {
        fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                inner: MemoryStore::new(clock),
                fail_writes: AtomicBool::new(false),
                fail_lookups: AtomicBool::new(false),
            }
        }

        fn check(flag: &AtomicBool) -> Result<(), StoreError> {
            if flag.load(Ordering::SeqCst) {
                Err(StoreError::Lock)
            } else {
                Ok(())
            }
        }
    }

    impl PersistenceGateway for FlakyStore {
        fn find_or_create_user_by_origin(&self, origin: &str) -> Result<UserLookup, StoreError> {
            self.inner.find_or_create_user_by_origin(origin)
        }
        fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
            self.inner.get_user(user_id)
        }
        fn touch_last_seen(&self, user_id: i64) -> Result<(), StoreError> {
            self.inner.touch_last_seen(user_id)
        }
        fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
            Self::check(&self.fail_writes)?;
            self.inner.create_message(message)
        }
        fn get_message(&self, message_id: i64) -> Result<Option<StoredMessage>, StoreError> {
            Self::check(&self.fail_lookups)?;
            self.inner.get_message(message_id)
        }
        fn set_message_recalled(&self, message_id: i64) -> Result<(), StoreError> {
            Self::check(&self.fail_writes)?;
            self.inner.set_message_recalled(message_id)
        }
        fn rename_user(&self, user_id: i64, username: &str) -> Result<(), StoreError> {
            Self::check(&self.fail_writes)?;
            self.inner.rename_user(user_id, username)
        }
        fn list_recently_seen_users(&self, within: Duration) -> Result<Vec<User>, StoreError> {
            self.inner.list_recently_seen_users(within)
        }
        fn delete_inactive_users(&self, older_than: Duration) -> Result<usize, StoreError> {
            self.inner.delete_inactive_users(older_than)
        }
        fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
            self.inner.recent_messages(limit)
        }
        fn search_messages(
            &self,
            query: &str,
            limit: usize,
        ) -> Result<Vec<StoredMessage>, StoreError> {
            self.inner.search_messages(query, limit)
        }
        fn statistics(&self) -> Result<Statistics, StoreError> {
            self.inner.statistics()
        }
    }

    struct Harness {
        router: MessageRouter,
        store: Arc<FlakyStore>,
        presence: PresenceTracker,
        clock: Arc<ManualClock>,
        hub: Hub,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap(),
            ));
            let store = Arc::new(FlakyStore::new(clock.clone()));
            let presence = PresenceTracker::new();
            let (hub, server) = Hub::new(PresenceTracker::new());
            tokio::spawn(server.run());
            let router = MessageRouter::new(
                store.clone(),
                presence.clone(),
                clock.clone(),
                &ChatConfig::default(),
            );
            Self {
                router,
                store,
                presence,
                clock,
                hub,
            }
        }

        /// Create the user for `ip` and an open session for it.
        async fn connect(&mut self, ip: &str) -> Origin {
            let lookup = self.store.find_or_create_user_by_origin(ip).unwrap();
            self.presence.mark_active(lookup.user.id);
            let (tx, _rx) = mpsc::channel(1);
            let session_id = self.hub.register(lookup.user.id, tx).await.session_id;
            Origin {
                session_id,
                user_id: lookup.user.id,
                ip: ip.to_string(),
            }
        }
    }

    fn text(content: &str) -> InboundMessage {
        InboundMessage::Chat {
            kind: ChatKind::Text,
            content: content.to_string(),
        }
    }

    async fn send_text(h: &Harness, origin: &Origin, content: &str) -> i64 {
        let out = h.router.route(origin, text(content)).await.unwrap();
        match &out[0] {
            OutboundMessage::Chat(chat) => chat.message_id.unwrap(),
            other => panic!("expected chat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_text_is_persisted_and_carries_id() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;

        let out = h.router.route(&a, text("hello")).await.unwrap();
        assert_eq!(out.len(), 1);
        let OutboundMessage::Chat(chat) = &out[0] else {
            panic!("expected chat message");
        };
        assert_eq!(chat.content, "hello");
        assert_eq!(chat.sender.username, "10.0.0.1");
        assert_eq!(chat.sender.user_id, a.user_id);
        let id = chat.message_id.expect("persisted id");
        assert!(id > 0);

        let stored = h.store.get_message(id).unwrap().unwrap();
        assert_eq!(stored.content, "hello");
        assert_eq!(stored.kind, MessageKind::Text);
    }

    #[tokio::test]
    async fn test_file_message_keeps_metadata() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;

        let out = h
            .router
            .route(
                &a,
                InboundMessage::File {
                    content: "/uploads/a.txt".to_string(),
                    file: FileMeta {
                        name: "a.txt".to_string(),
                        size: 42,
                    },
                },
            )
            .await
            .unwrap();
        let OutboundMessage::Chat(chat) = &out[0] else {
            panic!("expected chat message");
        };
        assert_eq!(chat.kind, MessageKind::File);
        let stored = h.store.get_message(chat.message_id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.file_name.as_deref(), Some("a.txt"));
        assert_eq!(stored.file_size, Some(42));
    }

    #[tokio::test]
    async fn test_persistence_failure_still_broadcasts_without_id() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        h.store.fail_writes.store(true, Ordering::SeqCst);

        let out = h.router.route(&a, text("still here")).await.unwrap();
        let OutboundMessage::Chat(chat) = &out[0] else {
            panic!("expected chat message");
        };
        assert_eq!(chat.message_id, None);
        assert_eq!(chat.content, "still here");
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        assert!(matches!(
            h.router.route(&a, text("")).await,
            Err(RouteError::EmptyContent)
        ));
    }

    #[tokio::test]
    async fn test_recall_own_message_within_window() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        let id = send_text(&h, &a, "oops").await;

        h.clock.advance(Duration::hours(7));
        let out = h
            .router
            .route(&a, InboundMessage::Recall { message_id: id })
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0],
            OutboundMessage::Recall { message_id, user_id, .. }
                if *message_id == id && *user_id == a.user_id
        ));
        assert!(matches!(
            &out[1],
            OutboundMessage::System { content, .. } if content == "10.0.0.1 recalled a message"
        ));
        let stored = h.store.get_message(id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Recalled);
    }

    #[tokio::test]
    async fn test_recall_rejects_other_users_message() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        let b = h.connect("10.0.0.2").await;
        let id = send_text(&h, &a, "mine").await;

        let err = h
            .router
            .route(&b, InboundMessage::Recall { message_id: id })
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Recall(RecallError::NotOwner)));
        assert_eq!(
            h.store.get_message(id).unwrap().unwrap().status,
            MessageStatus::Normal
        );
    }

    #[tokio::test]
    async fn test_recall_rejects_after_window() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        let id = send_text(&h, &a, "old news").await;

        h.clock.advance(Duration::hours(9));
        let err = h
            .router
            .route(&a, InboundMessage::Recall { message_id: id })
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Recall(RecallError::WindowElapsed)));
        assert_eq!(
            h.store.get_message(id).unwrap().unwrap().status,
            MessageStatus::Normal
        );
    }

    #[tokio::test]
    async fn test_recall_exactly_at_window_edge_succeeds() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        let id = send_text(&h, &a, "edge").await;

        h.clock.advance(Duration::hours(8));
        assert!(h
            .router
            .route(&a, InboundMessage::Recall { message_id: id })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_recall_missing_and_unknown_ids() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;

        assert!(matches!(
            h.router
                .route(&a, InboundMessage::Recall { message_id: 0 })
                .await,
            Err(RouteError::MissingMessageId)
        ));
        assert!(matches!(
            h.router
                .route(&a, InboundMessage::Recall { message_id: 999 })
                .await,
            Err(RouteError::Recall(RecallError::NotFound))
        ));
    }

    #[tokio::test]
    async fn test_recall_fails_closed_on_lookup_error() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        let id = send_text(&h, &a, "x").await;
        h.store.fail_lookups.store(true, Ordering::SeqCst);

        let err = h
            .router
            .route(&a, InboundMessage::Recall { message_id: id })
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Recall(RecallError::Lookup(_))));
    }

    #[tokio::test]
    async fn test_rename_emits_user_system_users_in_order() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        let _b = h.connect("10.0.0.2").await;

        let out = h
            .router
            .route(
                &a,
                InboundMessage::Rename {
                    username: "  Bob ".to_string(),
                },
            )
            .await
            .unwrap();

        let kinds: Vec<_> = out.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["user", "system", "users"]);
        assert!(matches!(
            &out[0],
            OutboundMessage::UserRename { username, .. } if username == "Bob"
        ));
        assert!(matches!(
            &out[1],
            OutboundMessage::System { content, .. } if content == "10.0.0.1 is now known as Bob"
        ));
        let OutboundMessage::PresenceList(users) = &out[2] else {
            panic!("expected presence list");
        };
        assert_eq!(users.len(), 2);
        assert!(users
            .iter()
            .any(|u| u.id == a.user_id && u.username.as_deref() == Some("Bob")));
    }

    #[tokio::test]
    async fn test_rename_rejects_blank_name() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        assert!(matches!(
            h.router
                .route(
                    &a,
                    InboundMessage::Rename {
                        username: "   ".to_string()
                    }
                )
                .await,
            Err(RouteError::EmptyUsername)
        ));
        assert_eq!(h.store.get_user(a.user_id).unwrap().unwrap().username, None);
    }

    #[tokio::test]
    async fn test_rename_store_failure_broadcasts_nothing() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        h.store.fail_writes.store(true, Ordering::SeqCst);

        assert!(matches!(
            h.router
                .route(
                    &a,
                    InboundMessage::Rename {
                        username: "Bob".to_string()
                    }
                )
                .await,
            Err(RouteError::Rename(_))
        ));
    }

    #[tokio::test]
    async fn test_presence_snapshot_excludes_disconnected_users() {
        let mut h = Harness::new();
        let a = h.connect("10.0.0.1").await;
        let b = h.connect("10.0.0.2").await;
        h.presence.mark_inactive(b.user_id);

        let users = h.router.presence_snapshot().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, a.user_id);
    }
}
