use std::{
    net::SocketAddr,
    sync::{Arc, atomic::Ordering},
};

use bytes::Bytes;
use tokio::{net::UdpSocket, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::gateway::{
    buffer::packet_pool,
    constants::{KEEPALIVE_PACKET_SIZE, MIN_MEDIA_PACKET_SIZE, UDP_RECV_BUF_SIZE},
    events::{InboundFrame, VoiceEvent},
    rtp::{RtpHeader, strip_extension},
    session::{keepalive::KeepaliveTracker, shared::SessionShared},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram {
    KeepaliveAck,
    Media,
    Runt,
}

pub fn classify(packet: &[u8]) -> Datagram {
    match packet.len() {
        KEEPALIVE_PACKET_SIZE => Datagram::KeepaliveAck,
        n if n >= MIN_MEDIA_PACKET_SIZE => Datagram::Media,
        _ => Datagram::Runt,
    }
}

pub(super) async fn receive_loop(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    tracker: Arc<KeepaliveTracker>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
) {
    let guild_id = shared.guild_id;
    let mut buf = vec![0u8; UDP_RECV_BUF_SIZE];

    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(r) => r,
                Err(e) => {
                    warn!("[{}] UDP receive failed: {}", guild_id, e);
                    continue;
                }
            },
        };

        if from != remote {
            trace!("[{}] Ignoring datagram from unknown peer {}", guild_id, from);
            continue;
        }

        let packet = &buf[..n];
        match classify(packet) {
            Datagram::KeepaliveAck => {
                if let Some(rtt) = tracker.acknowledge(packet, Instant::now()) {
                    shared.record_udp_ping(rtt);
                    shared.events.emit(VoiceEvent::UdpPing { latency: rtt });
                }
            }
            Datagram::Media => handle_media(&shared, packet),
            Datagram::Runt => trace!("[{}] Dropping {} byte datagram", guild_id, n),
        }
    }

    debug!("[{}] Receiver loop stopped", guild_id);
}

fn handle_media(shared: &SessionShared, packet: &[u8]) {
    if !shared.state.get().is_ready() {
        shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let Some(header) = RtpHeader::parse(packet) else {
        shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };
    let Ok(cipher) = shared.cipher() else {
        shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let mut plain = packet_pool().acquire();
    if let Err(e) = cipher.open_packet(packet, header.len(), &mut plain) {
        shared.stats.decrypt_failures.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[{}] Dropping packet seq {} from ssrc {}: {}",
            shared.guild_id, header.sequence, header.ssrc, e
        );
        return;
    }

    let payload = if header.extension {
        strip_extension(&plain)
    } else {
        &plain[..]
    };

    shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
    shared.frame_handler.on_frame(InboundFrame {
        ssrc: header.ssrc,
        user_id: shared.user_for(header.ssrc),
        sequence: header.sequence,
        timestamp: header.timestamp,
        payload: Bytes::copy_from_slice(payload),
    });
}
