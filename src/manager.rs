use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::{
    common::{
        errors::{GatewayError, GatewayResult},
        types::{ChannelId, GuildId},
    },
    configs::GatewayConfig,
    gateway::{CredentialsProvider, FrameHandler, VoiceConnection},
};

/// Registry of live voice sessions, at most one per guild.
pub struct VoiceManager {
    sessions: DashMap<GuildId, Arc<VoiceConnection>>,
    provider: Arc<dyn CredentialsProvider>,
    config: Arc<GatewayConfig>,
}

impl VoiceManager {
    pub fn new(provider: Arc<dyn CredentialsProvider>, config: GatewayConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            provider,
            config: Arc::new(config),
        }
    }

    /// Joins `channel_id` in `guild_id` and resolves once media can flow.
    ///
    /// An existing session for the guild is replaced. If the session does
    /// not become ready within `ready_timeout_ms` it is torn down and the
    /// error returned.
    pub async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        frame_handler: Arc<dyn FrameHandler>,
    ) -> GatewayResult<Arc<VoiceConnection>> {
        if channel_id.0 == 0 {
            return Err(GatewayError::InvalidChannel(channel_id.0));
        }
        self.config.validate()?;

        let credentials = self.provider.credentials(guild_id, channel_id).await?;
        credentials.validate()?;

        if let Some((_, previous)) = self.sessions.remove(&guild_id) {
            info!("[{}] Replacing existing voice session", guild_id);
            previous.disconnect().await;
        }

        let connection = Arc::new(VoiceConnection::spawn(
            channel_id,
            credentials,
            self.provider.clone(),
            self.config.clone(),
            frame_handler,
        ));
        // A concurrent connect for the same guild may have inserted since
        // the removal above; whoever inserts last keeps the slot.
        if let Some(displaced) = self.sessions.insert(guild_id, connection.clone()) {
            warn!("[{}] Concurrent connect replaced a starting session", guild_id);
            displaced.disconnect().await;
        }

        if let Err(e) = connection.wait_until_ready(self.config.ready_timeout()).await {
            warn!("[{}] Voice session failed to become ready: {}", guild_id, e);
            self.sessions
                .remove_if(&guild_id, |_, c| Arc::ptr_eq(c, &connection));
            connection.disconnect().await;
            return Err(e);
        }

        Ok(connection)
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<VoiceConnection>> {
        self.sessions.get(&guild_id).map(|c| c.clone())
    }

    /// Tears down the guild's session. Returns whether one existed.
    pub async fn disconnect(&self, guild_id: GuildId) -> bool {
        match self.sessions.remove(&guild_id) {
            Some((_, connection)) => {
                connection.disconnect().await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.sessions.iter().map(|e| *e.key()).collect();
        for guild_id in guilds {
            self.disconnect(guild_id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::{Either, select};

    use super::*;
    use crate::{
        common::types::{SessionId, UserId},
        gateway::{ConnectionState, InboundFrame, SessionCredentials, StaticCredentials},
    };

    fn manager(endpoint: &str) -> VoiceManager {
        manager_with(
            endpoint,
            GatewayConfig {
                ready_timeout_ms: 200,
                max_reconnect_attempts: 1,
                ..Default::default()
            },
        )
    }

    fn manager_with(endpoint: &str, config: GatewayConfig) -> VoiceManager {
        let creds = SessionCredentials {
            guild_id: GuildId(10),
            user_id: UserId(20),
            session_id: SessionId::from("sess"),
            token: "tok".into(),
            endpoint: endpoint.into(),
        };
        VoiceManager::new(Arc::new(StaticCredentials::new(creds)), config)
    }

    fn noop() -> Arc<dyn FrameHandler> {
        Arc::new(|_: InboundFrame| {})
    }

    #[tokio::test]
    async fn channel_zero_is_rejected() {
        let m = manager("127.0.0.1:1");
        assert!(matches!(
            m.connect(GuildId(10), ChannelId(0), noop()).await,
            Err(GatewayError::InvalidChannel(0))
        ));
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn empty_endpoint_is_rejected_before_spawning() {
        let m = manager("");
        assert!(matches!(
            m.connect(GuildId(10), ChannelId(1), noop()).await,
            Err(GatewayError::Config(_))
        ));
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_times_out_and_is_removed() {
        let m = manager("ws://127.0.0.1:9");
        assert!(m.connect(GuildId(10), ChannelId(1), noop()).await.is_err());
        assert!(m.get(GuildId(10)).is_none());
        assert!(!m.disconnect(GuildId(10)).await);
    }

    #[tokio::test]
    async fn racing_connects_leave_exactly_one_session() {
        // Nothing listens on port 9, so sessions keep retrying and never
        // become ready on their own.
        let m = Arc::new(manager_with(
            "ws://127.0.0.1:9",
            GatewayConfig {
                ready_timeout_ms: 3_000,
                max_reconnect_attempts: 50,
                ..Default::default()
            },
        ));
        let start = |m: Arc<VoiceManager>| {
            tokio::spawn(async move { m.connect(GuildId(10), ChannelId(1), noop()).await })
        };

        let existing = start(m.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(m.len(), 1);

        let a = start(m.clone());
        let b = start(m.clone());

        let first = tokio::time::timeout(Duration::from_secs(1), select(a, b))
            .await
            .expect("neither connect displaced the other");
        let (displaced, survivor) = match first {
            Either::Left(pair) | Either::Right(pair) => pair,
        };
        assert!(matches!(displaced.unwrap(), Err(GatewayError::Closed)));
        assert!(matches!(existing.await.unwrap(), Err(GatewayError::Closed)));

        assert_eq!(m.len(), 1);
        let live = m.get(GuildId(10)).unwrap();
        assert_ne!(live.state(), ConnectionState::Closed);

        m.shutdown().await;
        assert!(survivor.await.unwrap().is_err());
        assert!(m.is_empty());
    }
}
