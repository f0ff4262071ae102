//! Bounded outbound frame queue between the external encoder and the sender
//! loop. `enqueue` suspends while the queue is full; nothing is ever dropped
//! to make room.

use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};
use tokio_util::sync::CancellationToken;

use crate::common::errors::{GatewayError, GatewayResult};

pub fn frame_queue(capacity: usize) -> (FrameSink, FrameSource) {
    let (tx, rx) = flume::bounded(capacity);
    let closed = CancellationToken::new();
    (
        FrameSink {
            tx,
            closed: closed.clone(),
        },
        FrameSource { rx, closed },
    )
}

/// Producer half handed to the media pipeline.
#[derive(Clone)]
pub struct FrameSink {
    tx: Sender<Bytes>,
    closed: CancellationToken,
}

impl FrameSink {
    /// Queues one encoded frame, waiting for space if the queue is full.
    /// Fails once the session has been torn down.
    pub async fn enqueue(&self, frame: impl Into<Bytes>) -> GatewayResult<()> {
        if self.closed.is_cancelled() {
            return Err(GatewayError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(GatewayError::Closed),
            res = self.tx.send_async(frame.into()) => res.map_err(|_| GatewayError::Closed),
        }
    }

    /// Non-suspending variant; hands the frame back when the queue is full.
    pub fn try_enqueue(&self, frame: impl Into<Bytes>) -> Result<(), Bytes> {
        if self.closed.is_cancelled() {
            return Err(frame.into());
        }
        match self.tx.try_send(frame.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(f)) | Err(TrySendError::Disconnected(f)) => Err(f),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_disconnected()
    }
}

/// Consumer half, owned by whichever sender loop is currently live.
#[derive(Clone)]
pub struct FrameSource {
    rx: Receiver<Bytes>,
    closed: CancellationToken,
}

impl FrameSource {
    pub async fn next(&self) -> Option<Bytes> {
        self.rx.recv_async().await.ok()
    }

    /// Throws away everything queued; returns how many frames were dropped.
    pub fn discard(&self) -> usize {
        self.rx.drain().count()
    }

    /// Refuses further frames, wakes suspended producers with `Closed` and
    /// drops whatever is queued.
    pub fn close(&self) -> usize {
        self.closed.cancel();
        self.discard()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
