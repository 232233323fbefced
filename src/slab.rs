//! Shared read buffers.
//!
//! Incoming bytes land in a fixed-size slab owned by the stream and written
//! by the device driver. The contract is strict: the driver may not start the
//! next read cycle until the stream has copied the previous chunk out. That
//! rule is enforced here as a fill/take handshake instead of being left as a
//! convention between threads.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct SlabState {
    buf: Box<[u8]>,
    pending: usize,
    poisoned: bool,
}

struct SlabInner {
    state: Mutex<SlabState>,
    released: Condvar,
}

/// Fixed-size read buffer shared between a stream and its device driver.
#[derive(Clone)]
pub struct ReadSlab {
    inner: Arc<SlabInner>,
}

impl ReadSlab {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SlabInner {
                state: Mutex::new(SlabState {
                    buf: vec![0u8; capacity].into_boxed_slice(),
                    pending: 0,
                    poisoned: false,
                }),
                released: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().buf.len()
    }

    /// Driver side. Blocks until the previous chunk has been taken, then
    /// runs `f` against the buffer. `f` returns the number of bytes written
    /// (or a negative status, which leaves the slab empty). Returns `None`
    /// once the slab has been poisoned by teardown.
    pub fn fill(&self, f: impl FnOnce(&mut [u8]) -> isize) -> Option<isize> {
        let mut state = self.inner.state.lock();
        while state.pending > 0 && !state.poisoned {
            self.inner.released.wait(&mut state);
        }
        if state.poisoned {
            return None;
        }
        let n = f(&mut state.buf);
        if n > 0 {
            state.pending = n as usize;
        }
        Some(n)
    }

    /// Stream side. Copies the pending chunk out into an owned buffer and
    /// releases the slab for the next read cycle.
    pub fn take(&self, len: usize) -> Vec<u8> {
        let mut state = self.inner.state.lock();
        let len = len.min(state.buf.len());
        let chunk = state.buf[..len].to_vec();
        state.pending = 0;
        drop(state);
        self.inner.released.notify_one();
        chunk
    }

    /// Unblocks any filler and makes future fills fail. Called when the
    /// device closes.
    pub fn poison(&self) {
        let mut state = self.inner.state.lock();
        state.poisoned = true;
        drop(state);
        self.inner.released.notify_all();
    }

    fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.pending = 0;
        state.poisoned = false;
    }
}

/// A fixed set of equally sized slabs leased out to streams, for callers
/// that want read buffers carved from a pre-sized allocation instead of one
/// fresh allocation per stream.
pub struct SlabPool {
    slab_capacity: usize,
    free: Mutex<Vec<ReadSlab>>,
}

impl SlabPool {
    pub fn new(slab_capacity: usize, count: usize) -> Arc<Self> {
        let free = (0..count)
            .map(|_| ReadSlab::with_capacity(slab_capacity))
            .collect();
        Arc::new(Self {
            slab_capacity,
            free: Mutex::new(free),
        })
    }

    pub fn slab_capacity(&self) -> usize {
        self.slab_capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Takes a slab out of the pool, or `None` when all are in use.
    pub fn lease(&self) -> Option<ReadSlab> {
        self.free.lock().pop()
    }

    /// Returns a slab once the owning stream has fully closed.
    pub fn give_back(&self, slab: ReadSlab) {
        slab.reset();
        self.free.lock().push(slab);
    }
}
