use std::sync::Arc;
use tokio::sync::RwLock;

use crate::chat::presence::PresenceTracker;
use crate::chat::router::MessageRouter;
use crate::clock::Clock;
use crate::config::ChatConfig;
use crate::store::Store;
use crate::ws::hub::Hub;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Persistence gateway (SQLite or in-memory)
    pub store: Store,
    /// Handle to the connection registry task
    pub hub: Hub,
    /// Which users hold an open session
    pub presence: PresenceTracker,
    pub router: Arc<MessageRouter>,
    pub clock: Arc<dyn Clock>,
    /// Chat policy constants
    pub chat: ChatConfig,
    /// Room title, changeable at runtime
    pub chat_title: Arc<RwLock<String>>,
    /// Take the origin address from X-Forwarded-For
    pub trust_forwarded_for: bool,
}

impl AppState {
    /// Wire up the chat core around a store and clock. The caller must spawn
    /// the returned hub task.
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        chat: ChatConfig,
        chat_title: String,
        trust_forwarded_for: bool,
    ) -> (Self, crate::ws::hub::HubServer) {
        let presence = PresenceTracker::new();
        let (hub, hub_server) = Hub::new(presence.clone());
        let router = Arc::new(MessageRouter::new(
            store.clone(),
            presence.clone(),
            clock.clone(),
            &chat,
        ));

        let state = Self {
            store,
            hub,
            presence,
            router,
            clock,
            chat,
            chat_title: Arc::new(RwLock::new(chat_title)),
            trust_forwarded_for,
        };
        (state, hub_server)
    }
}
