use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::{
    common::{
        errors::GatewayResult,
        types::{ChannelId, GuildId},
    },
    configs::GatewayConfig,
    gateway::{
        constants::SESSION_SHUTDOWN_MS,
        credentials::{CredentialsProvider, SessionCredentials},
        events::{FrameHandler, VoiceEvent},
        queue::{FrameSink, frame_queue},
        session::{
            VoiceGateway,
            shared::{ConnectionStats, SessionShared, ms_to_duration},
        },
        state::ConnectionState,
    },
};

/// Handle to one running voice session.
///
/// Dropping the handle stops the session; `disconnect` additionally waits
/// for every task to wind down.
pub struct VoiceConnection {
    guild_id: GuildId,
    channel_id: ChannelId,
    shared: Arc<SessionShared>,
    sink: FrameSink,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceConnection {
    /// Starts the session task. Credentials must already be validated.
    pub fn spawn(
        channel_id: ChannelId,
        credentials: SessionCredentials,
        provider: Arc<dyn CredentialsProvider>,
        config: Arc<GatewayConfig>,
        frame_handler: Arc<dyn FrameHandler>,
    ) -> Self {
        let guild_id = credentials.guild_id;
        let (sink, source) = frame_queue(config.queue_capacity);
        let shared = Arc::new(SessionShared::new(guild_id, config, source, frame_handler));
        let cancel = CancellationToken::new();

        let gateway = VoiceGateway::new(
            shared.clone(),
            provider,
            channel_id,
            credentials,
            cancel.clone(),
        );
        let task = tokio::spawn(gateway.run().instrument(info_span!("voice", guild = %guild_id)));

        Self {
            guild_id,
            channel_id,
            shared,
            sink,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Producer handle for encoded frames.
    pub fn transmit_sink(&self) -> FrameSink {
        self.sink.clone()
    }

    pub async fn enqueue(&self, frame: impl Into<Bytes>) -> GatewayResult<()> {
        self.sink.enqueue(frame).await
    }

    pub async fn wait_until_ready(&self, limit: Duration) -> GatewayResult<()> {
        self.shared.state.wait_until_ready(limit).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Last control-channel RTT.
    pub fn ping(&self) -> Option<Duration> {
        ms_to_duration(self.shared.ping.load(Ordering::Relaxed))
    }

    /// Last UDP keepalive RTT.
    pub fn udp_ping(&self) -> Option<Duration> {
        ms_to_duration(self.shared.udp_ping.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats.snapshot()
    }

    /// Stops the session and waits for it to finish. Queued frames are
    /// discarded.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            let limit = Duration::from_millis(SESSION_SHUTDOWN_MS);
            if tokio::time::timeout(limit, &mut task).await.is_err() {
                warn!(
                    "[{}] Session did not stop within {:?}, aborting",
                    self.guild_id, limit
                );
                task.abort();
                self.shared.state.set(ConnectionState::Closed);
            }
        }
        let dropped = self.shared.frames.close();
        debug!(
            "[{}] Disconnected ({} frames discarded)",
            self.guild_id, dropped
        );
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
