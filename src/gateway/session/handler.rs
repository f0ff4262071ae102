use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    VoiceGateway,
    heartbeat::{HeartbeatState, spawn_heartbeat},
    media::MediaLink,
    types::SessionOutcome,
};
use crate::{
    common::errors::{GatewayError, GatewayResult},
    gateway::{
        constants::ENCRYPTION_MODE,
        encryption::MediaCipher,
        events::{DisconnectReason, VoiceEvent},
        protocol::{
            ClientConnect, ClientDisconnect, ReadyPayload, SessionDescription, SpeakingPayload,
            VoiceGatewayMessage, VoiceOp,
        },
        state::ConnectionState,
    },
};

/// Per-connection view of the control channel. Handles one decoded message
/// at a time, in arrival order.
pub struct SessionState<'a> {
    gateway: &'a VoiceGateway,
    tx: UnboundedSender<Message>,
    link: &'a mut Option<MediaLink>,
    is_resume: bool,
    conn_cancel: CancellationToken,
    heartbeat: Arc<HeartbeatState>,
    heartbeat_handle: Option<JoinHandle<()>>,
    heartbeat_interval: Option<Duration>,
    deadline: Option<Instant>,
    established: bool,
}

impl<'a> SessionState<'a> {
    pub fn new(
        gateway: &'a VoiceGateway,
        tx: UnboundedSender<Message>,
        link: &'a mut Option<MediaLink>,
        is_resume: bool,
        conn_cancel: CancellationToken,
    ) -> Self {
        let deadline = Some(Instant::now() + gateway.config().session_description_timeout());
        Self {
            gateway,
            tx,
            link,
            is_resume,
            conn_cancel,
            heartbeat: Arc::new(HeartbeatState::new()),
            heartbeat_handle: None,
            heartbeat_interval: None,
            deadline,
            established: false,
        }
    }

    /// When the current handshake step must have completed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fault signal of the current media link, if one is bound.
    pub fn link_fault(&self) -> Option<CancellationToken> {
        self.link.as_ref().map(|l| l.fault())
    }

    /// Whether this connection reached Ready or Resumed.
    pub fn established(&self) -> bool {
        self.established
    }

    pub async fn handle_text(&mut self, text: &str) -> Option<SessionOutcome> {
        let guild_id = self.gateway.guild_id();
        let op = match VoiceOp::decode(text) {
            Ok(op) => op,
            Err(e) => {
                warn!(
                    "[{}] Dropping malformed voice gateway message: {} - Text: {}",
                    guild_id, e, text
                );
                return None;
            }
        };

        trace!("[{}] Received {}", guild_id, op.name());
        match op {
            VoiceOp::Hello { heartbeat_interval } => self.handle_hello(heartbeat_interval),
            VoiceOp::Ready(ready) => self.handle_ready(ready).await,
            VoiceOp::SessionDescription(sd) => self.handle_session_description(sd),
            VoiceOp::HeartbeatAck => self.handle_heartbeat_ack(),
            VoiceOp::Resumed => self.handle_resumed(),
            VoiceOp::Speaking(speaking) => self.handle_speaking(speaking),
            VoiceOp::ClientConnect(c) => self.handle_client_connect(c),
            VoiceOp::ClientDisconnect(c) => self.handle_client_disconnect(c),
            VoiceOp::Unknown { op, d } => {
                debug!("[{}] Received voice op {}: {:?}", guild_id, op, d);
                None
            }
        }
    }

    fn handle_hello(&mut self, interval: Duration) -> Option<SessionOutcome> {
        let guild_id = self.gateway.guild_id();
        if self.state() != ConnectionState::AwaitingHello {
            debug!("[{}] Ignoring repeated Hello", guild_id);
            return None;
        }

        debug!("[{}] Heartbeat interval set to {:?}", guild_id, interval);
        let creds = self.gateway.credentials();
        let (msg, next) = if self.is_resume {
            (VoiceGatewayMessage::resume(creds), ConnectionState::Resuming)
        } else {
            (VoiceGatewayMessage::identify(creds), ConnectionState::Identifying)
        };
        if let Err(e) = self.send(msg) {
            error!("[{}] Failed to send handshake: {}", guild_id, e);
            return Some(SessionOutcome::Resume);
        }

        // Identify/Resume must be on the wire before the first heartbeat.
        self.heartbeat_interval = Some(interval);
        self.restart_heartbeat();

        self.set_state(next);
        self.deadline = Some(Instant::now() + self.gateway.config().session_description_timeout());
        None
    }

    async fn handle_ready(&mut self, ready: ReadyPayload) -> Option<SessionOutcome> {
        let guild_id = self.gateway.guild_id();
        if self.state() != ConnectionState::Identifying {
            debug!("[{}] Ignoring Ready outside of identify", guild_id);
            return None;
        }

        if !ready.modes.is_empty() && !ready.modes.iter().any(|m| m == ENCRYPTION_MODE) {
            error!(
                "[{}] Server offers none of our encryption modes: {:?}",
                guild_id, ready.modes
            );
            return Some(SessionOutcome::Shutdown(DisconnectReason::UnsupportedMode));
        }

        debug!(
            "[{}] Ready! IP: {}, Port: {}, SSRC: {}",
            guild_id, ready.ip, ready.port, ready.ssrc
        );

        if let Some(old) = self.link.take() {
            old.shutdown().await;
        }

        match self.open_transport(&ready).await {
            Ok(()) => {
                self.set_state(ConnectionState::AwaitingSessionDescription);
                self.deadline =
                    Some(Instant::now() + self.gateway.config().session_description_timeout());
                None
            }
            Err(GatewayError::Closed) => {
                Some(SessionOutcome::Shutdown(DisconnectReason::Requested))
            }
            Err(e) => {
                error!("[{}] Transport setup failed: {}", guild_id, e);
                self.gateway
                    .shared()
                    .events
                    .diagnostic(format!("transport setup failed: {}", e));
                Some(SessionOutcome::Identify)
            }
        }
    }

    async fn open_transport(&mut self, ready: &ReadyPayload) -> GatewayResult<()> {
        let shared = self.gateway.shared();
        let remote = resolve(&ready.ip, ready.port).await?;
        let link = MediaLink::bind(remote, ready.ssrc, shared, self.gateway.cancel_token()).await?;

        self.set_state(ConnectionState::DiscoveringTransport);
        let discovered = tokio::select! {
            _ = self.gateway.cancel_token().cancelled() => return Err(GatewayError::Closed),
            res = link.discover(shared) => res?,
        };
        debug!(
            "[{}] Discovered external address {}:{}",
            shared.guild_id, discovered.ip, discovered.port
        );

        *self.link = Some(link);
        self.send(VoiceGatewayMessage::select_protocol(&discovered, ENCRYPTION_MODE))
    }

    fn handle_session_description(&mut self, sd: SessionDescription) -> Option<SessionOutcome> {
        let guild_id = self.gateway.guild_id();
        if self.state() != ConnectionState::AwaitingSessionDescription {
            debug!("[{}] Ignoring unsolicited SessionDescription", guild_id);
            return None;
        }
        if sd.mode != ENCRYPTION_MODE {
            error!("[{}] Server selected unsupported mode {}", guild_id, sd.mode);
            return Some(SessionOutcome::Shutdown(DisconnectReason::UnsupportedMode));
        }

        let shared = self.gateway.shared();
        shared.set_cipher(MediaCipher::new(&sd.secret_key));
        debug!(
            "[{}] Session description: mode {}, audio codec {}",
            guild_id,
            sd.mode,
            sd.audio_codec.as_deref().unwrap_or("unspecified")
        );

        let Some(link) = self.link.as_mut() else {
            warn!("[{}] SessionDescription without a media link", guild_id);
            return Some(SessionOutcome::Identify);
        };
        link.start(shared);
        let ssrc = link.ssrc();

        if let Err(e) = self.send(VoiceGatewayMessage::speaking(ssrc, true)) {
            warn!("[{}] Failed to send speaking state: {}", guild_id, e);
        }

        self.set_state(ConnectionState::Ready);
        self.deadline = None;
        self.established = true;
        info!("[{}] Voice session ready (ssrc {})", guild_id, ssrc);
        shared.events.emit(VoiceEvent::Ready { ssrc });
        None
    }

    fn handle_heartbeat_ack(&self) -> Option<SessionOutcome> {
        if self.heartbeat_interval.is_none() {
            return None;
        }
        if let Some(latency) = self.heartbeat.acknowledge() {
            let shared = self.gateway.shared();
            shared.record_ping(latency);
            shared.events.emit(VoiceEvent::Ping { latency });
        }
        None
    }

    fn handle_resumed(&mut self) -> Option<SessionOutcome> {
        let guild_id = self.gateway.guild_id();
        if self.state() != ConnectionState::Resuming {
            debug!("[{}] Ignoring unsolicited Resumed", guild_id);
            return None;
        }

        let running = self.link.as_ref().is_some_and(|l| l.is_running());
        if !running {
            warn!("[{}] Resumed without a live media link, identifying", guild_id);
            return Some(SessionOutcome::Identify);
        }

        self.restart_heartbeat();
        self.set_state(ConnectionState::Ready);
        self.deadline = None;
        self.established = true;
        info!("[{}] Voice session resumed successfully", guild_id);
        self.gateway.shared().events.emit(VoiceEvent::Resumed);
        None
    }

    fn handle_speaking(&self, speaking: SpeakingPayload) -> Option<SessionOutcome> {
        let shared = self.gateway.shared();
        shared.users.insert(speaking.ssrc, speaking.user_id);
        shared.events.emit(VoiceEvent::Speaking {
            user_id: speaking.user_id,
            ssrc: speaking.ssrc,
            speaking: speaking.speaking != 0,
        });
        None
    }

    fn handle_client_connect(&self, c: ClientConnect) -> Option<SessionOutcome> {
        let shared = self.gateway.shared();
        if let Some(ssrc) = c.audio_ssrc.filter(|s| *s != 0) {
            shared.users.insert(ssrc, c.user_id);
        }
        debug!("[{}] User {} joined", shared.guild_id, c.user_id);
        shared.events.emit(VoiceEvent::UserJoined {
            user_id: c.user_id,
            ssrc: c.audio_ssrc,
        });
        None
    }

    fn handle_client_disconnect(&self, c: ClientDisconnect) -> Option<SessionOutcome> {
        let shared = self.gateway.shared();
        shared.forget_user(c.user_id);
        debug!("[{}] User {} left", shared.guild_id, c.user_id);
        shared.events.emit(VoiceEvent::UserLeft { user_id: c.user_id });
        None
    }

    fn restart_heartbeat(&mut self) {
        let Some(interval) = self.heartbeat_interval else {
            return;
        };
        if let Some(h) = self.heartbeat_handle.take() {
            h.abort();
        }
        self.heartbeat = Arc::new(HeartbeatState::new());
        self.heartbeat_handle = Some(spawn_heartbeat(
            self.gateway.guild_id(),
            self.tx.clone(),
            self.heartbeat.clone(),
            interval,
            self.conn_cancel.child_token(),
        ));
    }

    fn state(&self) -> ConnectionState {
        self.gateway.shared().state.get()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.gateway.shared().state.set(next);
        debug!(
            "[{}] State {:?} -> {:?}",
            self.gateway.guild_id(),
            prev,
            next
        );
    }

    fn send(&self, msg: VoiceGatewayMessage) -> GatewayResult<()> {
        let json = msg.to_json()?;
        self.tx
            .send(Message::Text(json.into()))
            .map_err(|_| GatewayError::Closed)
    }
}

impl<'a> Drop for SessionState<'a> {
    fn drop(&mut self) {
        if let Some(h) = self.heartbeat_handle.take() {
            h.abort();
        }
    }
}

async fn resolve(host: &str, port: u16) -> GatewayResult<SocketAddr> {
    if let Ok(ip) = host.parse() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| GatewayError::protocol(format!("could not resolve media host {}", host)))
}
