//! The device driver contract.
//!
//! A stream never touches the operating system itself. It drives an opaque
//! handle through a small command set (`open`/`resume`/`pause`/`writev`/
//! `end`/`close`) and the handle reports completions asynchronously as
//! [`HandleEvent`]s over a channel. [`unix::UnixDriver`] is the default
//! implementation; tests plug in their own.

pub mod unix;

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::StreamError;
use crate::mode::TermMode;
use crate::slab::ReadSlab;

/// The device a stream is bound to.
#[derive(Debug, Clone)]
pub enum DeviceTarget {
    /// An already-open descriptor; the device counts as connected from the
    /// start.
    Fd(RawFd),
    /// A filesystem path (named socket) reached through an asynchronous
    /// connect.
    Path(PathBuf),
}

/// Completion events delivered by a device handle.
///
/// Statuses follow the driver convention: zero or positive is success
/// (positive is a byte count for `Read`), negative maps through
/// [`DeviceError`](crate::error::DeviceError).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleEvent {
    /// Asynchronous open resolved. Fires exactly once for path targets.
    Connect(i32),
    /// A read cycle finished; positive counts refer to bytes now pending in
    /// the shared slab, zero is end-of-input.
    Read(i32),
    /// The in-flight write batch completed. Exactly one per `writev`.
    Write(i32),
    /// The end-of-output request completed. Exactly one per `end`.
    Final(i32),
    /// The handle is gone. Always the last event.
    Close,
}

/// Sending half of the completion channel handed to a driver at init.
#[derive(Clone)]
pub struct EventSender {
    tx: UnboundedSender<HandleEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, UnboundedReceiver<HandleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Delivers a completion. A dropped receiver means the stream is already
    /// gone, so the event is discarded.
    pub fn emit(&self, event: HandleEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(?event, "completion dropped, stream gone");
        }
    }
}

/// One open device. Command methods return immediately; completions arrive
/// as [`HandleEvent`]s. Implementations serialize internally, so every
/// method takes `&self`.
pub trait DeviceHandle: Send + Sync {
    /// Starts the asynchronous connect for a path-bound device. Triggers
    /// exactly one [`HandleEvent::Connect`].
    fn open(&self, path: &Path) -> Result<(), StreamError>;

    /// Arms read delivery. [`HandleEvent::Read`] fires zero or more times
    /// while armed.
    fn resume(&self);

    /// Disarms read delivery. No further `Read` events after the pause is
    /// observed.
    fn pause(&self);

    /// Writes a batch of buffers. Triggers exactly one
    /// [`HandleEvent::Write`].
    fn writev(&self, buffers: Vec<Vec<u8>>);

    /// Ends the output side. Triggers exactly one [`HandleEvent::Final`].
    fn end(&self);

    /// Tears the device down. Triggers exactly one [`HandleEvent::Close`];
    /// never reports failure.
    fn close(&self);

    /// Synchronous terminal mode change.
    fn set_mode(&self, mode: TermMode) -> Result<(), StreamError>;

    /// Synchronous window size query, `(columns, rows)`. Never cached.
    fn window_size(&self) -> Result<(u16, u16), StreamError>;
}

/// Factory for device handles; the init slot of the driver contract.
pub trait DeviceDriver {
    fn init(
        &self,
        target: &DeviceTarget,
        slab: ReadSlab,
        events: EventSender,
    ) -> Result<Arc<dyn DeviceHandle>, StreamError>;
}
