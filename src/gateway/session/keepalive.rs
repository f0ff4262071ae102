use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use byteorder::{ByteOrder, LittleEndian};
use dashmap::DashMap;
use tokio::{net::UdpSocket, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::{constants::KEEPALIVE_PACKET_SIZE, session::shared::SessionShared};

/// Outstanding UDP keepalives and the RTT they measure.
pub struct KeepaliveTracker {
    ledger: DashMap<u64, Instant>,
    next_id: AtomicU64,
    capacity: usize,
    ttl: Duration,
}

impl KeepaliveTracker {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            ledger: DashMap::new(),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Records a new keepalive sent at `now` and returns its wire form.
    pub fn issue(&self, now: Instant) -> [u8; KEEPALIVE_PACKET_SIZE] {
        self.ledger
            .retain(|_, sent| now.saturating_duration_since(*sent) < self.ttl);

        while self.ledger.len() >= self.capacity {
            let oldest = self.ledger.iter().map(|e| *e.key()).min();
            match oldest {
                Some(id) => {
                    self.ledger.remove(&id);
                }
                None => break,
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.ledger.insert(id, now);

        let mut packet = [0u8; KEEPALIVE_PACKET_SIZE];
        LittleEndian::write_u64(&mut packet, id);
        packet
    }

    /// Consumes the ledger entry for an echoed keepalive. Unknown or already
    /// consumed ids yield nothing.
    pub fn acknowledge(&self, packet: &[u8], now: Instant) -> Option<Duration> {
        if packet.len() != KEEPALIVE_PACKET_SIZE {
            return None;
        }
        let id = LittleEndian::read_u64(packet);
        let (_, sent) = self.ledger.remove(&id)?;
        Some(now.saturating_duration_since(sent))
    }

    pub fn pending(&self) -> usize {
        self.ledger.len()
    }
}

pub(super) async fn keepalive_loop(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    tracker: Arc<KeepaliveTracker>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
) {
    let guild_id = shared.guild_id;
    let mut interval = tokio::time::interval(shared.config.keepalive_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let packet = tracker.issue(Instant::now());
                if let Err(e) = socket.send_to(&packet, remote).await {
                    warn!("[{}] UDP keepalive send failed: {}", guild_id, e);
                }
            }
        }
    }
    debug!("[{}] Keepalive loop stopped", guild_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ack_yields_rtt_once() {
        let tracker = KeepaliveTracker::new(8, Duration::from_secs(30));
        let sent_at = Instant::now();
        let packet = tracker.issue(sent_at);
        assert_eq!(LittleEndian::read_u64(&packet), 0);

        tokio::time::advance(Duration::from_millis(42)).await;
        let rtt = tracker.acknowledge(&packet, Instant::now()).unwrap();
        assert_eq!(rtt, Duration::from_millis(42));
        assert!(tracker.acknowledge(&packet, Instant::now()).is_none());
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let tracker = KeepaliveTracker::new(8, Duration::from_secs(30));
        tracker.issue(Instant::now());
        assert!(tracker.acknowledge(&99u64.to_le_bytes(), Instant::now()).is_none());
        assert!(tracker.acknowledge(&[0u8; 4], Instant::now()).is_none());
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn ledger_is_bounded_and_drops_oldest() {
        let tracker = KeepaliveTracker::new(4, Duration::from_secs(30));
        let now = Instant::now();
        let first = tracker.issue(now);
        for _ in 0..10 {
            tracker.issue(now);
        }
        assert_eq!(tracker.pending(), 4);
        assert!(tracker.acknowledge(&first, now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_expire() {
        let tracker = KeepaliveTracker::new(32, Duration::from_secs(30));
        let old = tracker.issue(Instant::now());
        tokio::time::advance(Duration::from_secs(31)).await;
        tracker.issue(Instant::now());
        assert_eq!(tracker.pending(), 1);
        assert!(tracker.acknowledge(&old, Instant::now()).is_none());
    }
}
