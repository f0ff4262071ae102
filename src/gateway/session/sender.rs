use std::{
    net::SocketAddr,
    sync::{Arc, atomic::Ordering},
};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::gateway::{session::shared::SessionShared, udp_link::UdpBackend};

/// Drains the outbound queue onto the media socket.
///
/// Frames are only transmitted while the session is `Ready`; otherwise the
/// current frame is held until it is. After too many failed sends in a row
/// `fault` is cancelled and the loop exits, leaving queued frames for the
/// next link.
pub(super) async fn speak_loop(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    ssrc: u32,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    fault: CancellationToken,
) {
    let guild_id = shared.guild_id;
    let config = shared.config.clone();
    let mut backend = UdpBackend::new(socket, remote, ssrc, config.frame_samples);
    let mut state_rx = shared.state.watch();

    let pacing = config.frame_duration();
    let mut ticker = (!pacing.is_zero()).then(|| {
        let mut t = tokio::time::interval(pacing);
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        t
    });

    let mut consecutive_failures: u32 = 0;

    loop {
        let frame: Bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = shared.frames.next() => match frame {
                Some(f) => f,
                None => break,
            },
        };

        if !shared.state.get().is_ready() {
            trace!("[{}] Holding frame until the session is ready", guild_id);
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = async { state_rx.wait_for(|s| s.is_ready()).await.map(|_| ()) } => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(t) = ticker.as_mut() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = t.tick() => {}
            }
        }

        let cipher = match shared.cipher() {
            Ok(cipher) => cipher,
            Err(e) => {
                shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("[{}] Dropping frame: {}", guild_id, e);
                continue;
            }
        };

        match backend.send_frame(&cipher, &frame).await {
            Ok(_) => {
                consecutive_failures = 0;
                shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                consecutive_failures += 1;
                shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[{}] Failed to send media frame ({} in a row): {}",
                    guild_id, consecutive_failures, e
                );
                if consecutive_failures >= config.max_consecutive_send_failures {
                    shared.events.diagnostic(format!(
                        "media socket unusable after {} failed sends",
                        consecutive_failures
                    ));
                    fault.cancel();
                    break;
                }
            }
        }
    }

    debug!(
        "[{}] Sender loop stopped at sequence {}",
        guild_id,
        backend.packetizer().sequence()
    );
}
