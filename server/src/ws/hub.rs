//! Connection registry.
//!
//! A single [`HubServer`] task owns the set of live sessions and processes
//! register, unregister and broadcast commands one at a time, so membership
//! and presence never change underneath a fan-out. [`Hub`] is the cloneable
//! handle the rest of the server talks to.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};

use super::protocol::OutboundMessage;
use super::{Frame, OutboundTx};
use crate::chat::presence::PresenceTracker;

/// Registry identity of one connection. A user id can hold several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
enum Command {
    Register {
        session_id: SessionId,
        user_id: i64,
        tx: OutboundTx,
        evicted: Arc<Notify>,
        res_tx: oneshot::Sender<()>,
    },
    Unregister {
        session_id: SessionId,
        res_tx: oneshot::Sender<bool>,
    },
    Broadcast {
        frame: Frame,
        res_tx: oneshot::Sender<usize>,
    },
    SendTo {
        session_id: SessionId,
        frame: Frame,
        res_tx: oneshot::Sender<bool>,
    },
    Count {
        res_tx: oneshot::Sender<usize>,
    },
}

enum Slot {
    Live {
        user_id: i64,
        tx: OutboundTx,
        evicted: Arc<Notify>,
    },
    /// Dropped for falling behind. Kept until the session unregisters so the
    /// session still owns its own teardown exactly once.
    Evicted,
}

/// What a session gets back from [`Hub::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub session_id: SessionId,
    /// Notified once if the hub drops this session for falling behind. The
    /// session should stop reading and run its teardown.
    pub evicted: Arc<Notify>,
}

/// Handle to the registry task.
#[derive(Clone)]
pub struct Hub {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

/// The registry task. Spawn [`HubServer::run`] once per process.
pub struct HubServer {
    sessions: HashMap<SessionId, Slot>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    presence: PresenceTracker,
}

impl Hub {
    pub fn new(presence: PresenceTracker) -> (Self, HubServer) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let hub = Self {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let server = HubServer {
            sessions: HashMap::new(),
            cmd_rx,
            presence,
        };
        (hub, server)
    }

    /// Add a session whose send loop drains `tx`'s receiver. The user is
    /// marked active in the same step.
    pub async fn register(&self, user_id: i64, tx: OutboundTx) -> Registration {
        let session_id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let evicted = Arc::new(Notify::new());
        let (res_tx, res_rx) = oneshot::channel();
        self.send(Command::Register {
            session_id,
            user_id,
            tx,
            evicted: evicted.clone(),
            res_tx,
        });
        let _ = res_rx.await;
        Registration {
            session_id,
            evicted,
        }
    }

    /// Remove a session and close its outbound queue.
    ///
    /// Returns true only for the first call after registration (including
    /// the first call after an eviction); the caller that gets true owns
    /// the departure. Later calls are no-ops returning false.
    pub async fn unregister(&self, session_id: SessionId) -> bool {
        let (res_tx, res_rx) = oneshot::channel();
        self.send(Command::Unregister { session_id, res_tx });
        res_rx.await.unwrap_or(false)
    }

    /// Encode once and enqueue on every live session. Returns how many
    /// sessions accepted the frame.
    pub async fn broadcast(&self, message: &OutboundMessage) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };
        let (res_tx, res_rx) = oneshot::channel();
        self.send(Command::Broadcast { frame, res_tx });
        res_rx.await.unwrap_or(0)
    }

    /// Enqueue on a single session, e.g. a failure reply meant only for the requester.
    pub async fn send_to(&self, session_id: SessionId, message: &OutboundMessage) -> bool {
        let Some(frame) = encode(message) else {
            return false;
        };
        let (res_tx, res_rx) = oneshot::channel();
        self.send(Command::SendTo {
            session_id,
            frame,
            res_tx,
        });
        res_rx.await.unwrap_or(false)
    }

    /// Number of live (non-evicted) sessions.
    pub async fn connection_count(&self) -> usize {
        let (res_tx, res_rx) = oneshot::channel();
        self.send(Command::Count { res_tx });
        res_rx.await.unwrap_or(0)
    }

    fn send(&self, command: Command) {
        if self.cmd_tx.send(command).is_err() {
            tracing::error!("Hub task is not running");
        }
    }
}

fn encode(message: &OutboundMessage) -> Option<Frame> {
    match message.encode() {
        Ok(json) => Some(Frame::from(json)),
        Err(e) => {
            tracing::error!(kind = message.kind(), error = %e, "Failed to encode outbound message");
            None
        }
    }
}

impl HubServer {
    /// Process commands until every [`Hub`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.cmd_rx.recv().await {
            self.handle(command);
        }
        tracing::debug!("Hub task stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                session_id,
                user_id,
                tx,
                evicted,
                res_tx,
            } => {
                self.sessions.insert(
                    session_id,
                    Slot::Live {
                        user_id,
                        tx,
                        evicted,
                    },
                );
                self.presence.mark_active(user_id);
                tracing::debug!(
                    session_id = %session_id,
                    user_id = user_id,
                    sessions = self.sessions.len(),
                    "Session registered"
                );
                let _ = res_tx.send(());
            }
            Command::Unregister { session_id, res_tx } => {
                let removed = match self.sessions.remove(&session_id) {
                    Some(Slot::Live { user_id, tx, .. }) => {
                        drop(tx);
                        self.presence.mark_inactive(user_id);
                        tracing::debug!(session_id = %session_id, user_id = user_id, "Session unregistered");
                        true
                    }
                    Some(Slot::Evicted) => true,
                    None => false,
                };
                let _ = res_tx.send(removed);
            }
            Command::Broadcast { frame, res_tx } => {
                let delivered = self.fan_out(&frame);
                let _ = res_tx.send(delivered);
            }
            Command::SendTo {
                session_id,
                frame,
                res_tx,
            } => {
                let delivered = match self.sessions.get(&session_id) {
                    Some(Slot::Live { tx, .. }) => match tx.try_send(frame) {
                        Ok(()) => true,
                        Err(_) => {
                            self.evict(session_id);
                            false
                        }
                    },
                    _ => false,
                };
                let _ = res_tx.send(delivered);
            }
            Command::Count { res_tx } => {
                let live = self
                    .sessions
                    .values()
                    .filter(|slot| matches!(slot, Slot::Live { .. }))
                    .count();
                let _ = res_tx.send(live);
            }
        }
    }

    /// Non-blocking enqueue on every live session. A full queue means the
    /// consumer has stalled; that session is evicted instead of holding up
    /// everyone else.
    fn fan_out(&mut self, frame: &Frame) -> usize {
        let mut delivered = 0;
        let mut stalled = Vec::new();

        for (session_id, slot) in &self.sessions {
            let Slot::Live { tx, .. } = slot else {
                continue;
            };
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(session_id = %session_id, "Outbound queue full, evicting session");
                    stalled.push(*session_id);
                }
                Err(TrySendError::Closed(_)) => stalled.push(*session_id),
            }
        }

        for session_id in stalled {
            self.evict(session_id);
        }

        delivered
    }

    fn evict(&mut self, session_id: SessionId) {
        if let Some(slot) = self.sessions.get_mut(&session_id) {
            if let Slot::Live {
                user_id, evicted, ..
            } = std::mem::replace(slot, Slot::Evicted)
            {
                self.presence.mark_inactive(user_id);
                // Stores a permit, so a session that is busy routing a frame
                // still sees it on its next wait.
                evicted.notify_one();
            }
        }
    }
}
