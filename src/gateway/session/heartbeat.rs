use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle, time::Instant};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::{
    common::types::GuildId,
    gateway::{constants::MIN_HEARTBEAT_INTERVAL, protocol::VoiceGatewayMessage},
};

/// Send time of the last heartbeat, for RTT on the matching ack.
pub struct HeartbeatState {
    started: Instant,
    last_sent: Mutex<Option<Instant>>,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_sent: Mutex::new(None),
        }
    }

    /// Marks a heartbeat as sent and returns its nonce (ms since start).
    pub fn record_sent(&self) -> u64 {
        let now = Instant::now();
        *self.last_sent.lock() = Some(now);
        now.duration_since(self.started).as_millis() as u64
    }

    /// RTT of the outstanding heartbeat, if any. Each send is acked once.
    pub fn acknowledge(&self) -> Option<Duration> {
        self.last_sent.lock().take().map(|sent| sent.elapsed())
    }
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends Op 3 right away and then every `interval` until cancelled or the
/// write channel closes. Intervals below 1 ms are raised to 1 ms.
pub fn spawn_heartbeat(
    guild_id: GuildId,
    tx: UnboundedSender<Message>,
    state: Arc<HeartbeatState>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(MIN_HEARTBEAT_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let nonce = state.record_sent();
            let json = match VoiceGatewayMessage::heartbeat(nonce).to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("[{}] Failed to encode heartbeat: {}", guild_id, e);
                    break;
                }
            };
            if tx.send(Message::Text(json.into())).is_err() {
                error!("[{}] Heartbeat send failed: control socket is gone", guild_id);
                break;
            }
            trace!("[{}] Heartbeat sent (nonce {})", guild_id, nonce);
        }
    })
}
