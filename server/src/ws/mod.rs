pub mod handler;
pub mod hub;
pub mod protocol;
pub mod session;

use std::sync::Arc;
use tokio::sync::mpsc;

/// One encoded JSON frame, shared by every queue it is fanned out to.
pub type Frame = Arc<str>;

/// Sender half of a connection's bounded outbound queue. Only the hub holds
/// it, so dropping it from the registry is what closes the queue.
pub type OutboundTx = mpsc::Sender<Frame>;
