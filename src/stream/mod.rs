//! The duplex stream and its construction surface.
//!
//! A [`TtyStream`] binds one device handle for its whole life and drives it
//! through five coupled sub-protocols: connect, read with backpressure,
//! batched write, half-close, and teardown. The asynchronous half of the
//! machine (the event pump and the `AsyncRead`/`AsyncWrite` impls) lives in
//! `io.rs`; this file holds state, construction, and the synchronous control
//! surface.

mod io;

use std::collections::VecDeque;
use std::future::poll_fn;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Poll, Waker};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::driver::unix::{is_tty, UnixDriver};
use crate::driver::{DeviceDriver, DeviceHandle, DeviceTarget, EventSender, HandleEvent};
use crate::error::StreamError;
use crate::mode::TermMode;
use crate::registry::{Registration, StreamRegistry};
use crate::slab::{ReadSlab, SlabPool};

pub const DEFAULT_READ_BUFFER_SIZE: usize = 65536;
pub const DEFAULT_HIGH_WATER_MARK: usize = 16384;

/// Stream construction options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Size of the shared read buffer.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// When false, end-of-input from the peer also ends the local output
    /// side.
    #[serde(default = "default_allow_half_open")]
    pub allow_half_open: bool,
    /// Queued-byte threshold past which the reader is paused.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_allow_half_open() -> bool {
    true
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            allow_half_open: true,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Connecting,
    Connected,
    Failed,
}

/// Per-role parked tasks. Each slot stands in for the single outstanding
/// completion continuation of the matching sub-protocol.
#[derive(Default)]
pub(crate) struct Wakers {
    pub(crate) read: Option<Waker>,
    pub(crate) write: Option<Waker>,
    pub(crate) open: Option<Waker>,
    pub(crate) close: Option<Waker>,
}

impl Wakers {
    pub(crate) fn wake_read(&mut self) {
        if let Some(waker) = self.read.take() {
            waker.wake();
        }
    }

    pub(crate) fn wake_write(&mut self) {
        if let Some(waker) = self.write.take() {
            waker.wake();
        }
    }

    pub(crate) fn wake_open(&mut self) {
        if let Some(waker) = self.open.take() {
            waker.wake();
        }
    }

    pub(crate) fn wake_all(&mut self) {
        self.wake_read();
        self.wake_write();
        self.wake_open();
        if let Some(waker) = self.close.take() {
            waker.wake();
        }
    }
}

/// Builder for [`TtyStream`]; pick a target with [`open_fd`](Self::open_fd)
/// or [`connect`](Self::connect).
pub struct StreamBuilder<D = UnixDriver> {
    driver: D,
    options: StreamOptions,
    registry: Option<Arc<StreamRegistry>>,
    pool: Option<Arc<SlabPool>>,
}

impl StreamBuilder<UnixDriver> {
    pub fn new() -> Self {
        Self {
            driver: UnixDriver,
            options: StreamOptions::default(),
            registry: None,
            pool: None,
        }
    }
}

impl Default for StreamBuilder<UnixDriver> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeviceDriver> StreamBuilder<D> {
    /// Swaps in a different device driver.
    pub fn driver<E: DeviceDriver>(self, driver: E) -> StreamBuilder<E> {
        StreamBuilder {
            driver,
            options: self.options,
            registry: self.registry,
            pool: self.pool,
        }
    }

    pub fn options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.options.read_buffer_size = size;
        self
    }

    pub fn allow_half_open(mut self, allow: bool) -> Self {
        self.options.allow_half_open = allow;
        self
    }

    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.options.high_water_mark = bytes;
        self
    }

    /// Tracks the stream in `registry` for exit-time cleanup.
    pub fn registry(mut self, registry: Arc<StreamRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Leases the read buffer from `pool` instead of allocating one.
    pub fn slab_pool(mut self, pool: Arc<SlabPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Opens a stream over an already-connected descriptor.
    pub fn open_fd(self, fd: RawFd) -> Result<TtyStream, StreamError> {
        self.build(DeviceTarget::Fd(fd))
    }

    /// Opens a stream over a named socket; the connect resolves
    /// asynchronously.
    pub fn connect(self, path: impl Into<PathBuf>) -> Result<TtyStream, StreamError> {
        self.build(DeviceTarget::Path(path.into()))
    }

    fn build(self, target: DeviceTarget) -> Result<TtyStream, StreamError> {
        let slab = match &self.pool {
            Some(pool) => pool.lease().ok_or(StreamError::NoBuffer)?,
            None => ReadSlab::with_capacity(self.options.read_buffer_size),
        };
        let (events, rx) = EventSender::channel();
        let handle = self.driver.init(&target, slab.clone(), events)?;

        let (connection, tty) = match &target {
            DeviceTarget::Fd(fd) => (ConnectionState::Connected, is_tty(*fd)),
            DeviceTarget::Path(path) => {
                if let Err(err) = handle.open(path) {
                    handle.close();
                    return Err(err);
                }
                (ConnectionState::Connecting, false)
            }
        };

        let closing = Arc::new(AtomicBool::new(false));
        let registration = self
            .registry
            .as_ref()
            .map(|registry| registry.register(&handle, Arc::clone(&closing)));

        Ok(TtyStream {
            handle: Some(handle),
            events: rx,
            slab,
            pool: self.pool,
            allow_half_open: self.options.allow_half_open,
            high_water_mark: self.options.high_water_mark,
            connection,
            tty,
            reading: false,
            closing,
            closed: false,
            ended_input: false,
            ending_output: false,
            final_result: None,
            read_queue: VecDeque::new(),
            queued_bytes: 0,
            fatal: None,
            write_in_flight: false,
            write_error: None,
            registration,
            wakers: Wakers::default(),
        })
    }
}

/// A duplex byte stream over one terminal or pipe device.
pub struct TtyStream {
    // cleared only when the close completion fires, never reused
    pub(crate) handle: Option<Arc<dyn DeviceHandle>>,
    pub(crate) events: UnboundedReceiver<HandleEvent>,
    pub(crate) slab: ReadSlab,
    pub(crate) pool: Option<Arc<SlabPool>>,
    pub(crate) allow_half_open: bool,
    pub(crate) high_water_mark: usize,
    pub(crate) connection: ConnectionState,
    tty: bool,
    // true while the device has a live read request armed
    pub(crate) reading: bool,
    // shared with the registry so force-close and destroy race to exactly
    // one native close
    pub(crate) closing: Arc<AtomicBool>,
    pub(crate) closed: bool,
    pub(crate) ended_input: bool,
    pub(crate) ending_output: bool,
    pub(crate) final_result: Option<Result<(), StreamError>>,
    pub(crate) read_queue: VecDeque<Vec<u8>>,
    pub(crate) queued_bytes: usize,
    pub(crate) fatal: Option<StreamError>,
    pub(crate) write_in_flight: bool,
    pub(crate) write_error: Option<StreamError>,
    pub(crate) registration: Option<Registration>,
    pub(crate) wakers: Wakers,
}

impl std::fmt::Debug for TtyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtyStream")
            .field("allow_half_open", &self.allow_half_open)
            .field("high_water_mark", &self.high_water_mark)
            .field("connection", &self.connection)
            .field("tty", &self.tty)
            .field("reading", &self.reading)
            .field("closed", &self.closed)
            .field("ended_input", &self.ended_input)
            .field("ending_output", &self.ending_output)
            .field("queued_bytes", &self.queued_bytes)
            .finish_non_exhaustive()
    }
}

impl TtyStream {
    /// Opens a stream over an already-connected descriptor with default
    /// options and the default driver.
    pub fn from_fd(fd: RawFd) -> Result<Self, StreamError> {
        StreamBuilder::new().open_fd(fd)
    }

    /// Connects a stream to a named socket with default options.
    pub fn connect(path: impl Into<PathBuf>) -> Result<Self, StreamError> {
        StreamBuilder::new().connect(path)
    }

    pub fn stdin() -> Result<Self, StreamError> {
        Self::from_fd(0)
    }

    pub fn stdout() -> Result<Self, StreamError> {
        Self::from_fd(1)
    }

    pub fn stderr() -> Result<Self, StreamError> {
        Self::from_fd(2)
    }

    /// True when the underlying descriptor was an interactive terminal at
    /// construction time.
    pub fn is_tty(&self) -> bool {
        self.tty
    }

    /// True once teardown has started, whether from destroy, a fatal read
    /// error, or a registry force-close.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// True once the device's close completion has fired.
    pub fn is_destroyed(&self) -> bool {
        self.closed
    }

    /// The device handle, for collaborators like
    /// [`ResizeWatcher`](crate::resize::ResizeWatcher). `None` once
    /// destroyed.
    pub fn device_handle(&self) -> Option<Arc<dyn DeviceHandle>> {
        self.handle.clone()
    }

    pub fn set_mode(&self, mode: TermMode) -> Result<(), StreamError> {
        self.device()?.set_mode(mode)
    }

    pub fn set_raw_mode(&self, raw: bool) -> Result<(), StreamError> {
        self.set_mode(if raw { TermMode::Raw } else { TermMode::Normal })
    }

    /// Live `(columns, rows)` query against the device.
    pub fn window_size(&self) -> Result<(u16, u16), StreamError> {
        self.device()?.window_size()
    }

    pub fn columns(&self) -> Result<u16, StreamError> {
        self.window_size().map(|(columns, _)| columns)
    }

    pub fn rows(&self) -> Result<u16, StreamError> {
        self.window_size().map(|(_, rows)| rows)
    }

    fn device(&self) -> Result<&Arc<dyn DeviceHandle>, StreamError> {
        self.handle.as_ref().ok_or(StreamError::Destroyed)
    }

    /// Waits until the connect protocol has resolved. Immediate for
    /// fd-bound streams; fails with the mapped connect error for a
    /// path-bound stream whose connect came back negative.
    pub async fn ready(&mut self) -> Result<(), StreamError> {
        poll_fn(|cx| {
            self.pump(cx);
            match self.connection {
                ConnectionState::Connected => Poll::Ready(Ok(())),
                ConnectionState::Failed => Poll::Ready(Err(self
                    .fatal
                    .clone()
                    .unwrap_or(StreamError::NotConnected))),
                ConnectionState::Connecting => {
                    self.wakers.open = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Tears the stream down. If this call is the one that initiates the
    /// close, it waits for the device's close completion; when teardown was
    /// already under way the call resolves immediately. Idempotent, and
    /// never an error: close failures are not surfaced.
    pub async fn destroy(&mut self) {
        if !self.begin_close() {
            return;
        }
        poll_fn(|cx| {
            self.pump(cx);
            if self.closed {
                Poll::Ready(())
            } else {
                self.wakers.close = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .await;
    }
}

impl Drop for TtyStream {
    fn drop(&mut self) {
        // Fire-and-forget close; the driver cleans up on its own threads.
        self.begin_close();
    }
}
