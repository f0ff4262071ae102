use serde::{Deserialize, Serialize};

use crate::{
    common::types::{ChannelId, GuildId, SessionId, UserId},
    gateway::SessionCredentials,
};

/// Static voice credentials, as forwarded from a main-gateway
/// VOICE_STATE_UPDATE / VOICE_SERVER_UPDATE pair.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,
    pub endpoint: String,
}

impl SessionConfig {
    pub fn credentials(&self) -> SessionCredentials {
        SessionCredentials {
            guild_id: self.guild_id,
            user_id: self.user_id,
            session_id: self.session_id.clone(),
            token: self.token.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}
