use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

use crate::chat::router::{Origin, RouteError};
use crate::state::AppState;
use crate::store::{run_blocking, Store, UserLookup};
use crate::ws::protocol::{InboundMessage, OutboundMessage};
use crate::ws::Frame;

/// Server sends a WebSocket ping this often so dead peers surface as write errors.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long teardown waits for the send loop to flush its close frame.
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// A single socket write that takes longer than this means the peer stopped reading.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One client connection.
struct ClientSession {
    origin: Origin,
    state: SessionState,
}

impl ClientSession {
    fn transition(&mut self, next: SessionState) {
        tracing::debug!(
            session_id = %self.origin.session_id,
            user_id = self.origin.user_id,
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
    }
}

/// Run a connection from registration to teardown.
///
/// The socket is split: a send loop owns the sink and drains the bounded
/// outbound queue the hub writes into, while this task reads client frames
/// and routes them one at a time. Whichever side stops first ends the
/// session, as does eviction by the hub.
pub async fn run_session(socket: WebSocket, state: AppState, lookup: UserLookup) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Frame>(state.chat.outbound_queue_capacity.max(1));

    let user = lookup.user;
    let registration = state.hub.register(user.id, tx).await;
    let session_id = registration.session_id;
    let mut session = ClientSession {
        origin: Origin {
            session_id,
            user_id: user.id,
            ip: user.ip.clone(),
        },
        state: SessionState::Connecting,
    };

    let mut writer = tokio::spawn(send_loop(ws_sender, rx, state.chat.coalesce_frames));
    let liveness = spawn_liveness(
        state.store.clone(),
        user.id,
        state.chat.liveness_interval(),
    );

    session.transition(SessionState::Open);
    tracing::info!(
        session_id = %session_id,
        user_id = user.id,
        origin = %user.ip,
        new_user = lookup.created,
        "WebSocket session started"
    );

    announce_arrival(&state, &session.origin, lookup.created).await;

    let mut writer_done = false;
    loop {
        tokio::select! {
            biased;

            _ = registration.evicted.notified() => {
                tracing::warn!(
                    session_id = %session_id,
                    user_id = user.id,
                    "Session evicted for falling behind"
                );
                break;
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, &session.origin, text.as_str()).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!(session_id = %session_id, "Ignoring binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(
                        session_id = %session_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
                // Ping/pong replies are handled by the protocol layer
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
                None => {
                    tracing::info!(session_id = %session_id, "WebSocket stream ended");
                    break;
                }
            },
            _ = &mut writer => {
                tracing::debug!(session_id = %session_id, "Send loop finished");
                writer_done = true;
                break;
            }
        }
    }

    session.transition(SessionState::Closing);
    liveness.abort();

    if state.hub.unregister(session_id).await {
        announce_departure(&state, &session.origin).await;
    }

    if !writer_done && timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    session.transition(SessionState::Closed);
    tracing::info!(
        session_id = %session_id,
        user_id = user.id,
        "WebSocket session stopped"
    );
}

/// Decode, route and fan out one client frame. Bad frames are logged and dropped.
async fn handle_frame(state: &AppState, origin: &Origin, text: &str) {
    let message = match InboundMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(
                session_id = %origin.session_id,
                error = %e,
                "Dropping client frame"
            );
            return;
        }
    };

    match state.router.route(origin, message).await {
        Ok(outbound) => {
            for message in &outbound {
                state.hub.broadcast(message).await;
            }
        }
        Err(RouteError::Recall(e)) => {
            tracing::info!(
                session_id = %origin.session_id,
                user_id = origin.user_id,
                error = %e,
                "Recall rejected"
            );
            let reply = OutboundMessage::system(e.to_string(), state.clock.now());
            state.hub.send_to(origin.session_id, &reply).await;
        }
        Err(e) => {
            tracing::warn!(
                session_id = %origin.session_id,
                user_id = origin.user_id,
                error = %e,
                "Client frame rejected"
            );
        }
    }
}

async fn announce_arrival(state: &AppState, origin: &Origin, created: bool) {
    if created {
        let notice = OutboundMessage::system(
            format!("{} joined the chat", origin.ip),
            state.clock.now(),
        );
        state.hub.broadcast(&notice).await;
    }
    broadcast_presence(state).await;
}

async fn announce_departure(state: &AppState, origin: &Origin) {
    let user_id = origin.user_id;
    if let Err(e) = run_blocking(&state.store, move |s| s.touch_last_seen(user_id)).await {
        tracing::warn!(user_id = user_id, error = %e, "Failed to record last seen");
    }

    let name = state.router.sender(origin).await.username;
    let notice = OutboundMessage::system(format!("{name} left the chat"), state.clock.now());
    state.hub.broadcast(&notice).await;
    broadcast_presence(state).await;
}

async fn broadcast_presence(state: &AppState) {
    match state.router.presence_snapshot().await {
        Ok(users) => {
            state.hub.broadcast(&OutboundMessage::PresenceList(users)).await;
        }
        Err(e) => tracing::warn!(error = %e, "Failed to build presence list"),
    }
}

/// Keep last-seen fresh while the session is open so the sweep leaves it alone.
fn spawn_liveness(store: Store, user_id: i64, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = run_blocking(&store, move |s| s.touch_last_seen(user_id)).await {
                tracing::warn!(user_id = user_id, error = %e, "Liveness touch failed");
            }
        }
    })
}

/// Forward queued frames to the socket until the hub closes the queue or a
/// write fails.
async fn send_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
    coalesce: bool,
) {
    let mut ping_timer = interval(PING_INTERVAL);
    ping_timer.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    // Unregistered or evicted
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "".into(),
                    }));
                    write(&mut ws_sender, close).await;
                    break;
                };
                let payload = if coalesce {
                    coalesce_pending(frame, &mut rx)
                } else {
                    frame.to_string()
                };
                if !write(&mut ws_sender, Message::Text(payload.into())).await {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if !write(&mut ws_sender, Message::Ping(Bytes::from_static(b"ping"))).await {
                    break;
                }
            }
        }
    }
}

/// Write one message, giving up after [`WRITE_TIMEOUT`]. Returns false when
/// the socket is no longer usable.
async fn write(ws_sender: &mut SplitSink<WebSocket, Message>, message: Message) -> bool {
    match timeout(WRITE_TIMEOUT, ws_sender.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "WebSocket write failed");
            false
        }
        Err(_) => {
            tracing::warn!("WebSocket write timed out, peer is not reading");
            false
        }
    }
}

/// Join `first` with every frame already waiting in the queue, newline separated.
fn coalesce_pending(first: Frame, rx: &mut mpsc::Receiver<Frame>) -> String {
    let mut payload = first.to_string();
    while let Ok(next) = rx.try_recv() {
        payload.push('\n');
        payload.push_str(&next);
    }
    payload
}
