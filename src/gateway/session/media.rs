use std::{net::SocketAddr, sync::Arc};

use tokio::{net::UdpSocket, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug};

use crate::{
    common::errors::{GatewayError, GatewayResult},
    gateway::{
        discovery::{DiscoveredAddress, discover_ip},
        session::{
            keepalive::{KeepaliveTracker, keepalive_loop},
            receiver::receive_loop,
            sender::speak_loop,
            shared::SessionShared,
        },
    },
};

/// The data plane of one session: a UDP socket plus the sender, receiver
/// and keepalive tasks that run on it. Survives control-channel resumes.
pub struct MediaLink {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    ssrc: u32,
    cancel: CancellationToken,
    /// Cancelled by the sender once this socket stops accepting sends.
    fault: CancellationToken,
    tracker: Arc<KeepaliveTracker>,
    tasks: Vec<JoinHandle<()>>,
}

impl MediaLink {
    pub async fn bind(
        remote: SocketAddr,
        ssrc: u32,
        shared: &SessionShared,
        parent: &CancellationToken,
    ) -> GatewayResult<Self> {
        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        let config = &shared.config;

        Ok(Self {
            socket: Arc::new(socket),
            remote,
            ssrc,
            cancel: parent.child_token(),
            fault: CancellationToken::new(),
            tracker: Arc::new(KeepaliveTracker::new(
                config.keepalive_ledger_capacity,
                config.keepalive_ledger_ttl(),
            )),
            tasks: Vec::new(),
        })
    }

    /// One discovery exchange. Must run before [`MediaLink::start`], while
    /// nothing else reads from the socket.
    pub async fn discover(&self, shared: &SessionShared) -> GatewayResult<DiscoveredAddress> {
        if self.is_running() {
            return Err(GatewayError::protocol("discovery after media loops started"));
        }
        Ok(discover_ip(
            &self.socket,
            self.remote,
            self.ssrc,
            shared.config.discovery_timeout(),
        )
        .await?)
    }

    pub fn start(&mut self, shared: &Arc<SessionShared>) {
        if self.is_running() {
            return;
        }

        self.tasks.push(tokio::spawn(speak_loop(
            self.socket.clone(),
            self.remote,
            self.ssrc,
            shared.clone(),
            self.cancel.clone(),
            self.fault.clone(),
        )
        .in_current_span()));
        self.tasks.push(tokio::spawn(receive_loop(
            self.socket.clone(),
            self.remote,
            self.tracker.clone(),
            shared.clone(),
            self.cancel.clone(),
        )
        .in_current_span()));
        self.tasks.push(tokio::spawn(keepalive_loop(
            self.socket.clone(),
            self.remote,
            self.tracker.clone(),
            shared.clone(),
            self.cancel.clone(),
        )
        .in_current_span()));
        debug!(
            "[{}] Media loops started (ssrc {}, remote {})",
            shared.guild_id, self.ssrc, self.remote
        );
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty() && !self.cancel.is_cancelled() && !self.fault.is_cancelled()
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Fault signal scoped to this link; a replacement link starts clean.
    pub fn fault(&self) -> CancellationToken {
        self.fault.clone()
    }

    /// Stops every loop and waits for them to release the socket.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for MediaLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
