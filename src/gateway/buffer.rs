use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use crate::gateway::constants::{MAX_POOLED_BUFFERS, UDP_PACKET_BUF_CAPACITY};

/// Free list of packet-sized byte buffers shared by the media loops.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
    max_buffers: usize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_buffers)),
            buffer_capacity,
            max_buffers,
        })
    }

    /// Hands out an empty buffer that goes back to the pool when dropped,
    /// whichever way the holder exits.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let mut vec = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity));

        vec.clear();

        PooledBuffer {
            vec,
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently sitting idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, mut vec: Vec<u8>) {
        // Buffers that grew past a jumbo packet are not worth keeping.
        if vec.capacity() > self.buffer_capacity * 4 {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_buffers {
            vec.clear();
            free.push(vec);
        }
    }
}

pub struct PooledBuffer {
    vec: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.vec
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.vec
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let vec = std::mem::take(&mut self.vec);
        self.pool.release(vec);
    }
}

static PACKET_POOL: OnceLock<Arc<BufferPool>> = OnceLock::new();

/// Process-wide pool of UDP packet buffers.
pub fn packet_pool() -> Arc<BufferPool> {
    PACKET_POOL
        .get_or_init(|| BufferPool::new(UDP_PACKET_BUF_CAPACITY, MAX_POOLED_BUFFERS))
        .clone()
}
