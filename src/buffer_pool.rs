//! Recycling pool for frame buffers on the ingress path.
//!
//! The switch handles Ethernet-sized datagrams, so the pool keeps a single stash of
//! MTU-sized `Vec<u8>` buffers that are reused via RAII. Ingress leases a buffer,
//! reads a datagram into it, and freezes the lease into a shared [`FrameRef`] that
//! egress can clone without copying payload bytes. Oversized datagrams fall back to
//! a dedicated heap allocation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Largest frame the pool recycles: MTU plus the switch header.
pub const FRAME_BUFFER_SIZE: usize = 2048;
const POOL_DEPTH: usize = 128;

static POOL: OnceLock<Mutex<Vec<Vec<u8>>>> = OnceLock::new();
static POOL_MISSES: AtomicU64 = AtomicU64::new(0);

fn pool() -> &'static Mutex<Vec<Vec<u8>>> {
    POOL.get_or_init(|| {
        let mut buffers = Vec::with_capacity(POOL_DEPTH);
        for _ in 0..POOL_DEPTH {
            buffers.push(vec![0u8; FRAME_BUFFER_SIZE]);
        }
        Mutex::new(buffers)
    })
}

fn acquire(len_hint: usize) -> Vec<u8> {
    if len_hint > FRAME_BUFFER_SIZE {
        // Jumbo datagram: dedicated allocation.
        POOL_MISSES.fetch_add(1, Ordering::Relaxed);
        return vec![0u8; len_hint];
    }
    pool().lock().pop().unwrap_or_else(|| {
        POOL_MISSES.fetch_add(1, Ordering::Relaxed);
        vec![0u8; FRAME_BUFFER_SIZE]
    })
}

fn release(mut buffer: Vec<u8>) {
    if buffer.capacity() < FRAME_BUFFER_SIZE {
        return;
    }
    buffer.clear();
    buffer.resize(FRAME_BUFFER_SIZE, 0);
    let mut guard = pool().lock();
    if guard.len() < POOL_DEPTH {
        guard.push(buffer);
    }
}

/// Number of times the pool was empty (or the datagram oversized) and a fresh
/// allocation was made. Monotone, for diagnostics.
pub fn pool_misses() -> u64 {
    POOL_MISSES.load(Ordering::Relaxed)
}

/// Exclusive, writable hold on a pooled buffer, taken before the datagram is read.
/// Dropping an unfrozen lease returns the buffer to the pool.
pub struct FrameLease {
    data: Option<Vec<u8>>,
}

impl FrameLease {
    /// Writable view for the socket read.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data
            .as_mut()
            .expect("frame lease already consumed")
            .as_mut_slice()
    }

    /// Seal the first `len` bytes into a shared, immutable [`FrameRef`].
    pub fn freeze(mut self, len: usize) -> FrameRef {
        let data = self.data.take().expect("frame lease already consumed");
        let valid = len.min(data.len());
        FrameRef {
            inner: Arc::new(PooledBytes {
                data: Some(data),
                valid,
            }),
        }
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            release(data);
        }
    }
}

struct PooledBytes {
    data: Option<Vec<u8>>,
    valid: usize,
}

impl Drop for PooledBytes {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            release(data);
        }
    }
}

/// Shared read-only handle to a pooled frame buffer. Cloning is reference
/// counting; the buffer returns to the pool when the last clone drops.
#[derive(Clone)]
pub struct FrameRef {
    inner: Arc<PooledBytes>,
}

impl FrameRef {
    pub fn as_slice(&self) -> &[u8] {
        let data = self.inner.data.as_deref().unwrap_or_default();
        &data[..self.inner.valid.min(data.len())]
    }

    pub fn len(&self) -> usize {
        self.inner.valid
    }

    pub fn is_empty(&self) -> bool {
        self.inner.valid == 0
    }
}

impl std::fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRef").field("len", &self.len()).finish()
    }
}

/// Lease a buffer large enough for `len_hint` bytes.
pub fn lease(len_hint: usize) -> FrameLease {
    FrameLease {
        data: Some(acquire(len_hint)),
    }
}
