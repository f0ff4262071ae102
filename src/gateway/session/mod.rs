use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{
    Utf8Bytes,
    protocol::{CloseFrame, Message, frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    common::{
        errors::GatewayResult,
        types::{ChannelId, GuildId},
    },
    configs::GatewayConfig,
    gateway::{
        constants::{RECONNECT_DELAY_FRESH_MS, VOICE_GATEWAY_VERSION, WRITE_TASK_SHUTDOWN_MS},
        credentials::{CredentialsProvider, SessionCredentials},
        events::{DisconnectReason, VoiceEvent},
        state::ConnectionState,
    },
};

pub mod backoff;
pub mod handler;
pub mod heartbeat;
pub mod keepalive;
pub mod media;
pub mod receiver;
pub mod sender;
pub mod shared;
pub mod types;

use self::{
    backoff::Backoff,
    media::MediaLink,
    shared::SessionShared,
    types::{CloseAction, SessionOutcome, classify_close, close_code},
};

/// Drives one voice session: connects the control channel, performs the
/// handshake, and reconnects (resume or fresh identify) until told to stop.
pub struct VoiceGateway {
    shared: Arc<SessionShared>,
    provider: Arc<dyn CredentialsProvider>,
    channel_id: ChannelId,
    credentials: SessionCredentials,
    cancel_token: CancellationToken,
}

impl Drop for VoiceGateway {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl VoiceGateway {
    pub fn new(
        shared: Arc<SessionShared>,
        provider: Arc<dyn CredentialsProvider>,
        channel_id: ChannelId,
        credentials: SessionCredentials,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            shared,
            provider,
            channel_id,
            credentials,
            cancel_token,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.shared.guild_id
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    pub fn credentials(&self) -> &SessionCredentials {
        &self.credentials
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub async fn run(mut self) {
        let guild_id = self.guild_id();
        let mut backoff = Backoff::new(self.config().max_reconnect_attempts);
        let mut link: Option<MediaLink> = None;
        let mut is_resume = false;

        let reason = loop {
            if self.cancel_token.is_cancelled() {
                break DisconnectReason::Requested;
            }

            let outcome = match self.connect(is_resume, &mut link, &mut backoff).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("[{}] Voice gateway connection error: {}", guild_id, e);
                    self.shared
                        .events
                        .diagnostic(format!("connection error: {}", e));
                    SessionOutcome::Resume
                }
            };

            let delay = match outcome {
                SessionOutcome::Shutdown(reason) => break reason,
                _ if backoff.is_exhausted() => {
                    error!(
                        "[{}] Giving up after {} reconnect attempts",
                        guild_id,
                        backoff.attempt()
                    );
                    break DisconnectReason::ReconnectExhausted;
                }
                SessionOutcome::Resume if link.as_ref().is_some_and(|l| l.is_running()) => {
                    is_resume = true;
                    backoff.next()
                }
                SessionOutcome::Resume => {
                    // Nothing to resume; a plain retry with the same credentials.
                    is_resume = false;
                    self.teardown_data_plane(&mut link).await;
                    backoff.next()
                }
                SessionOutcome::Identify => {
                    is_resume = false;
                    backoff.next();
                    self.teardown_data_plane(&mut link).await;
                    self.refresh_credentials().await;
                    Duration::from_millis(RECONNECT_DELAY_FRESH_MS)
                }
            };

            debug!(
                "[{}] Reconnecting in {:?} (resume={})",
                guild_id, delay, is_resume
            );
            self.shared.events.emit(VoiceEvent::Reconnecting {
                resume: is_resume,
                delay,
            });

            tokio::select! {
                _ = self.cancel_token.cancelled() => break DisconnectReason::Requested,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.shared.state.set(ConnectionState::Closing);
        self.teardown_data_plane(&mut link).await;
        let discarded = self.shared.frames.close();
        self.shared.state.set(ConnectionState::Closed);

        info!(
            "[{}] Voice session closed ({:?}, {} queued frames discarded)",
            guild_id, reason, discarded
        );
        self.shared.events.emit(VoiceEvent::Disconnected { reason });
    }

    async fn teardown_data_plane(&self, link: &mut Option<MediaLink>) {
        if let Some(link) = link.take() {
            link.shutdown().await;
        }
        self.shared.clear_cipher();
        self.shared.users.clear();
    }

    async fn refresh_credentials(&mut self) {
        match self
            .provider
            .credentials(self.guild_id(), self.channel_id)
            .await
            .and_then(|c| c.validate().map(|_| c))
        {
            Ok(creds) => self.credentials = creds,
            Err(e) => {
                warn!(
                    "[{}] Could not refresh credentials, reusing previous: {}",
                    self.guild_id(),
                    e
                );
                self.shared
                    .events
                    .diagnostic(format!("credential refresh failed: {}", e));
            }
        }
    }

    async fn connect(
        &self,
        is_resume: bool,
        link: &mut Option<MediaLink>,
        backoff: &mut Backoff,
    ) -> GatewayResult<SessionOutcome> {
        let guild_id = self.guild_id();
        self.shared.state.set(ConnectionState::Connecting);

        let url = self.credentials.gateway_url(VOICE_GATEWAY_VERSION);
        debug!("[{}] Connecting to voice gateway: {}", guild_id, url);

        let (ws_stream, _) = tokio::select! {
            _ = self.cancel_token.cancelled() => {
                return Ok(SessionOutcome::Shutdown(DisconnectReason::Requested));
            }
            res = tokio_tungstenite::connect_async(url.as_str()) => res?,
        };
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let mut write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    warn!("[{}] WS write error: {}", guild_id, e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        self.shared.state.set(ConnectionState::AwaitingHello);

        let conn_cancel = self.cancel_token.child_token();
        let mut state =
            handler::SessionState::new(self, tx.clone(), link, is_resume, conn_cancel.clone());

        let outcome = loop {
            let deadline = state.deadline();
            let handshake_timeout = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            let fault = state.link_fault();
            let link_fault = async move {
                match fault {
                    Some(token) => token.cancelled_owned().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    let _ = tx.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(close_code::NORMAL),
                        reason: Utf8Bytes::from_static("disconnect"),
                    })));
                    break SessionOutcome::Shutdown(DisconnectReason::Requested);
                }
                _ = link_fault => {
                    warn!("[{}] Media socket unusable, starting a fresh session", guild_id);
                    break SessionOutcome::Identify;
                }
                _ = handshake_timeout => {
                    warn!(
                        "[{}] Handshake stalled in {:?}",
                        guild_id,
                        self.shared.state.get()
                    );
                    self.shared
                        .events
                        .diagnostic("voice handshake timed out");
                    break SessionOutcome::Identify;
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("[{}] WS read error: {}", guild_id, e);
                            self.emit_close_event(1006, format!("IO error: {}", e));
                            break SessionOutcome::Resume;
                        }
                        None => {
                            debug!("[{}] WS stream ended", guild_id);
                            self.emit_close_event(1006, "Stream ended".into());
                            break SessionOutcome::Resume;
                        }
                    };

                    match msg {
                        Message::Text(text) => {
                            if let Some(outcome) = state.handle_text(text.as_str()).await {
                                break outcome;
                            }
                        }
                        Message::Close(frame) => {
                            let (code, reason) = frame
                                .map(|cf| (u16::from(cf.code), cf.reason.as_str().to_string()))
                                .unwrap_or((1005, String::new()));

                            info!(
                                "[{}] WS closed: code={}, reason='{}'",
                                guild_id, code, reason
                            );
                            self.emit_close_event(code, reason.clone());

                            break match classify_close(code) {
                                CloseAction::Resume => SessionOutcome::Resume,
                                CloseAction::Identify => SessionOutcome::Identify,
                                CloseAction::Fatal => SessionOutcome::Shutdown(
                                    DisconnectReason::Rejected { code, reason },
                                ),
                            };
                        }
                        _ => {}
                    }
                }
            }
        };

        if state.established() {
            backoff.reset();
        }
        drop(state);
        conn_cancel.cancel();
        drop(tx);

        if tokio::time::timeout(
            Duration::from_millis(WRITE_TASK_SHUTDOWN_MS),
            &mut write_task,
        )
        .await
        .is_err()
        {
            write_task.abort();
        }

        Ok(outcome)
    }

    fn emit_close_event(&self, code: u16, reason: String) {
        self.shared
            .events
            .emit(VoiceEvent::SocketClosed { code, reason });
    }
}
