//! Mock device driver for exercising the stream state machine without an
//! operating system underneath.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ttyflow::{
    DeviceDriver, DeviceHandle, DeviceTarget, EventSender, HandleEvent, ReadSlab, StreamError,
    TermMode,
};

#[derive(Clone)]
struct Link {
    slab: ReadSlab,
    events: EventSender,
}

/// Shared recording state. Tests keep an `Arc` and hand a
/// [`MockState::driver`] to the stream builder.
pub struct MockState {
    resumes: AtomicUsize,
    pauses: AtomicUsize,
    ends: AtomicUsize,
    closes: AtomicUsize,
    written: Mutex<Vec<Vec<u8>>>,
    last_mode: Mutex<Option<TermMode>>,
    window: Mutex<(u16, u16)>,
    // auto-acknowledge flags; disable to hold a completion back
    ack_writes: AtomicBool,
    ack_end: AtomicBool,
    ack_close: AtomicBool,
    link: Mutex<Option<Link>>,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            resumes: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
            last_mode: Mutex::new(None),
            window: Mutex::new((80, 24)),
            ack_writes: AtomicBool::new(true),
            ack_end: AtomicBool::new(true),
            ack_close: AtomicBool::new(true),
            link: Mutex::new(None),
        })
    }

    pub fn driver(self: &Arc<Self>) -> MockDriver {
        MockDriver {
            state: Arc::clone(self),
        }
    }

    pub fn hold_write_acks(&self) {
        self.ack_writes.store(false, Ordering::SeqCst);
    }

    pub fn hold_end_acks(&self) {
        self.ack_end.store(false, Ordering::SeqCst);
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn written_bytes(&self) -> Vec<u8> {
        self.written.lock().concat()
    }

    pub fn last_mode(&self) -> Option<TermMode> {
        *self.last_mode.lock()
    }

    pub fn set_window(&self, columns: u16, rows: u16) {
        *self.window.lock() = (columns, rows);
    }

    fn link(&self) -> Link {
        self.link.lock().clone().expect("driver not initialized")
    }

    fn emit(&self, event: HandleEvent) {
        self.link().events.emit(event);
    }

    /// Copies `data` into the shared slab and delivers the read completion.
    pub fn push_read(&self, data: &[u8]) {
        let link = self.link();
        let n = link
            .slab
            .fill(|buf| {
                buf[..data.len()].copy_from_slice(data);
                data.len() as isize
            })
            .expect("slab poisoned");
        link.events.emit(HandleEvent::Read(n as i32));
    }

    pub fn push_eof(&self) {
        self.emit(HandleEvent::Read(0));
    }

    pub fn push_read_error(&self, status: i32) {
        self.emit(HandleEvent::Read(status));
    }

    pub fn complete_connect(&self, status: i32) {
        self.emit(HandleEvent::Connect(status));
    }

    pub fn complete_write(&self, status: i32) {
        self.emit(HandleEvent::Write(status));
    }

    pub fn complete_end(&self, status: i32) {
        self.emit(HandleEvent::Final(status));
    }

    pub fn complete_close(&self) {
        self.emit(HandleEvent::Close);
    }
}

pub struct MockDriver {
    state: Arc<MockState>,
}

impl DeviceDriver for MockDriver {
    fn init(
        &self,
        _target: &DeviceTarget,
        slab: ReadSlab,
        events: EventSender,
    ) -> Result<Arc<dyn DeviceHandle>, StreamError> {
        *self.state.link.lock() = Some(Link { slab, events });
        Ok(Arc::new(MockHandle {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockHandle {
    state: Arc<MockState>,
}

impl DeviceHandle for MockHandle {
    fn open(&self, _path: &Path) -> Result<(), StreamError> {
        // The test script resolves the connect explicitly.
        Ok(())
    }

    fn resume(&self) {
        self.state.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn pause(&self) {
        self.state.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn writev(&self, buffers: Vec<Vec<u8>>) {
        self.state.written.lock().extend(buffers);
        if self.state.ack_writes.load(Ordering::SeqCst) {
            self.state.emit(HandleEvent::Write(0));
        }
    }

    fn end(&self) {
        self.state.ends.fetch_add(1, Ordering::SeqCst);
        if self.state.ack_end.load(Ordering::SeqCst) {
            self.state.emit(HandleEvent::Final(0));
        }
    }

    fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        if self.state.ack_close.load(Ordering::SeqCst) {
            self.state.emit(HandleEvent::Close);
        }
    }

    fn set_mode(&self, mode: TermMode) -> Result<(), StreamError> {
        *self.state.last_mode.lock() = Some(mode);
        Ok(())
    }

    fn window_size(&self) -> Result<(u16, u16), StreamError> {
        Ok(*self.state.window.lock())
    }
}
