use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::common::types::UserId;

/// Why a session stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// The server closed with a code that must not be retried.
    Rejected { code: u16, reason: String },
    /// Reconnect attempts ran out.
    ReconnectExhausted,
    /// The server does not offer our encryption mode.
    UnsupportedMode,
}

/// Everything a session reports to subscribers. Steady-state errors only
/// ever surface here, never as `Err` values.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    Ready { ssrc: u32 },
    Resumed,
    /// Control-channel heartbeat round trip.
    Ping { latency: Duration },
    /// UDP keepalive round trip.
    UdpPing { latency: Duration },
    UserJoined { user_id: UserId, ssrc: Option<u32> },
    UserLeft { user_id: UserId },
    Speaking { user_id: UserId, ssrc: u32, speaking: bool },
    SocketClosed { code: u16, reason: String },
    Reconnecting { resume: bool, delay: Duration },
    Diagnostic { message: String },
    Disconnected { reason: DisconnectReason },
}

/// Per-session broadcast bus. Dropping a receiver unsubscribes it.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VoiceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: VoiceEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn diagnostic(&self, message: impl Into<String>) {
        self.emit(VoiceEvent::Diagnostic {
            message: message.into(),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A decrypted media frame as delivered to the collaborator.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub ssrc: u32,
    /// Resolved from Speaking / client-connect messages when known.
    pub user_id: Option<UserId>,
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Receives decoded frames from the receiver loop. Called inline on the
/// receive path, so implementations must not block.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: InboundFrame);
}

impl<F> FrameHandler for F
where
    F: Fn(InboundFrame) + Send + Sync,
{
    fn on_frame(&self, frame: InboundFrame) {
        self(frame)
    }
}
