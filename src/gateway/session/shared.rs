use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::RwLock;
use crate::{
    common::types::{GuildId, UserId},
    configs::GatewayConfig,
    gateway::{
        encryption::{CryptoError, MediaCipher},
        events::EventBus, events::FrameHandler, queue::FrameSource,
        state::StateCell,
    },
};

/// Counters shared by the media loops.
#[derive(Default)]
pub struct LinkStats {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub send_failures: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub decrypt_failures: u64,
    pub send_failures: u64,
}

impl LinkStats {
    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// State that outlives individual connections of one session.
pub struct SessionShared {
    pub guild_id: GuildId,
    pub config: Arc<GatewayConfig>,
    pub state: StateCell,
    pub events: EventBus,
    /// Control RTT in ms, `-1` until measured.
    pub ping: AtomicI64,
    /// UDP keepalive RTT in ms, `-1` until measured.
    pub udp_ping: AtomicI64,
    cipher: RwLock<Option<Arc<MediaCipher>>>,
    pub frames: FrameSource,
    pub frame_handler: Arc<dyn FrameHandler>,
    /// SSRC to user, fed by Speaking and client-connect messages.
    pub users: DashMap<u32, UserId>,
    pub stats: LinkStats,
}

impl SessionShared {
    pub fn new(
        guild_id: GuildId,
        config: Arc<GatewayConfig>,
        frames: FrameSource,
        frame_handler: Arc<dyn FrameHandler>,
    ) -> Self {
        Self {
            guild_id,
            events: EventBus::new(config.event_capacity),
            config,
            state: StateCell::new(),
            ping: AtomicI64::new(-1),
            udp_ping: AtomicI64::new(-1),
            cipher: RwLock::new(None),
            frames,
            frame_handler,
            users: DashMap::new(),
            stats: LinkStats::default(),
        }
    }

    pub fn cipher(&self) -> Result<Arc<MediaCipher>, CryptoError> {
        self.cipher.read().clone().ok_or(CryptoError::MissingKey)
    }

    pub fn set_cipher(&self, cipher: MediaCipher) {
        *self.cipher.write() = Some(Arc::new(cipher));
    }

    pub fn clear_cipher(&self) {
        *self.cipher.write() = None;
    }

    pub fn record_ping(&self, latency: Duration) {
        self.ping.store(latency.as_millis() as i64, Ordering::Relaxed);
    }

    pub fn record_udp_ping(&self, latency: Duration) {
        self.udp_ping.store(latency.as_millis() as i64, Ordering::Relaxed);
    }

    pub fn user_for(&self, ssrc: u32) -> Option<UserId> {
        self.users.get(&ssrc).map(|u| *u)
    }

    pub fn forget_user(&self, user_id: UserId) {
        self.users.retain(|_, u| *u != user_id);
    }
}

pub(crate) fn ms_to_duration(value: i64) -> Option<Duration> {
    u64::try_from(value).ok().map(Duration::from_millis)
}
