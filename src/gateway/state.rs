use std::time::Duration;

use tokio::sync::watch;

use crate::common::errors::{GatewayError, GatewayResult};

/// Handshake and lifecycle position of one voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    DiscoveringTransport,
    AwaitingSessionDescription,
    Ready,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Single source of truth for the session state, observable from any task.
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Connecting);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Moves to `next`. `Closed` is final; later transitions are ignored.
    pub fn set(&self, next: ConnectionState) -> ConnectionState {
        let mut previous = next;
        self.tx.send_if_modified(|current| {
            previous = *current;
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
        previous
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Resolves once the session is `Ready`, fails if it closes first or
    /// `limit` elapses.
    pub async fn wait_until_ready(&self, limit: Duration) -> GatewayResult<()> {
        let mut rx = self.watch();
        let wait = rx.wait_for(|s| s.is_ready() || *s == ConnectionState::Closed);
        match tokio::time::timeout(limit, wait).await {
            Ok(Ok(state)) if state.is_ready() => Ok(()),
            Ok(_) => Err(GatewayError::Closed),
            Err(_) => Err(GatewayError::Timeout("session ready", limit)),
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
