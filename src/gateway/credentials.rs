use async_trait::async_trait;

use crate::common::{
    errors::{GatewayError, GatewayResult},
    types::{ChannelId, GuildId, SessionId, UserId},
};

/// Everything needed to open (or resume) a voice session.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,
    /// Host (optionally with port) of the voice server, as handed out by the
    /// main gateway.
    pub endpoint: String,
}

impl SessionCredentials {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.token.is_empty() {
            return Err(GatewayError::Credentials("token is empty".into()));
        }
        if self.session_id.is_empty() {
            return Err(GatewayError::Credentials("session id is empty".into()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(GatewayError::config("voice endpoint is empty"));
        }
        Ok(())
    }

    /// WebSocket URL of the voice control channel.
    pub fn gateway_url(&self, version: u8) -> String {
        let endpoint = self.endpoint.trim().trim_end_matches('/');
        if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            format!("{}/?v={}", endpoint, version)
        } else {
            format!("wss://{}/?v={}", endpoint, version)
        }
    }
}

/// Source of fresh credentials. Asked once per session and again before
/// every fresh Identify, since the server may have rotated the session.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> GatewayResult<SessionCredentials>;
}

/// Provider that always hands back the same credentials.
pub struct StaticCredentials {
    creds: SessionCredentials,
}

impl StaticCredentials {
    pub fn new(creds: SessionCredentials) -> Self {
        Self { creds }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(
        &self,
        guild_id: GuildId,
        _channel_id: ChannelId,
    ) -> GatewayResult<SessionCredentials> {
        if guild_id != self.creds.guild_id {
            return Err(GatewayError::Credentials(format!(
                "no credentials for guild {}",
                guild_id
            )));
        }
        Ok(self.creds.clone())
    }
}
