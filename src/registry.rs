//! Process-wide liveness tracking for open streams.
//!
//! Streams register their device handle at construction and deregister the
//! moment teardown starts. Whatever is still registered when the process
//! shuts down gets force-closed so no device handle leaks. The registry is
//! an ordinary value passed into stream construction, which keeps it
//! testable without a real process exit.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::driver::DeviceHandle;

struct Entry {
    handle: Weak<dyn DeviceHandle>,
    closing: Arc<AtomicBool>,
}

/// Set of live streams, keyed by registration id.
pub struct StreamRegistry {
    streams: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        handle: &Arc<dyn DeviceHandle>,
        closing: Arc<AtomicBool>,
    ) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().insert(
            id,
            Entry {
                handle: Arc::downgrade(handle),
                closing,
            },
        );
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    fn deregister(&self, id: u64) {
        self.streams.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force-closes every stream that is still registered. Each close is
    /// issued at most once, coordinated with the owning stream through its
    /// shared closing flag. Returns the number of handles closed.
    pub fn shutdown(&self) -> usize {
        let entries: Vec<Entry> = self.streams.lock().drain().map(|(_, entry)| entry).collect();
        let mut closed = 0;
        for entry in entries {
            let Some(handle) = entry.handle.upgrade() else {
                continue;
            };
            if entry.closing.swap(true, Ordering::SeqCst) {
                continue;
            }
            tracing::debug!("force-closing stream left open at shutdown");
            handle.close();
            closed += 1;
        }
        closed
    }
}

/// Membership ticket held by a stream; consumed when teardown starts.
pub struct Registration {
    registry: Arc<StreamRegistry>,
    id: u64,
}

impl Registration {
    pub(crate) fn deregister(self) {
        self.registry.deregister(self.id);
    }
}

/// Runs [`StreamRegistry::shutdown`] when the process receives a
/// termination signal.
pub struct ExitGuard {
    handle: signal_hook::iterator::Handle,
    thread: thread::JoinHandle<()>,
}

impl ExitGuard {
    pub fn install(registry: Arc<StreamRegistry>) -> io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let handle = signals.handle();
        let thread = thread::spawn(move || {
            for signal in signals.forever() {
                let closed = registry.shutdown();
                tracing::debug!(signal, closed, "force-closed streams on signal");
            }
        });
        Ok(Self { handle, thread })
    }

    pub fn stop(self) {
        self.handle.close();
        let _ = self.thread.join();
    }
}
