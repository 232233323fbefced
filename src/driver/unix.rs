//! Default device driver for Unix descriptors and named sockets.
//!
//! One command thread per handle executes open/writev/end/close requests and
//! emits the matching completion events; one reader thread, parked while the
//! stream is paused, waits on `poll(2)` and fills the shared slab. A
//! self-pipe lets `pause` and `close` interrupt a pending wait. Fd-bound
//! targets are `dup`ed so closing the handle never closes the caller's
//! descriptor.

use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::driver::{DeviceDriver, DeviceHandle, DeviceTarget, EventSender, HandleEvent};
use crate::error::{DeviceError, StreamError};
use crate::mode::TermMode;
use crate::slab::ReadSlab;

/// Returns true when `fd` refers to an interactive terminal.
pub fn is_tty(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Driver for fd-bound and path-bound Unix devices.
pub struct UnixDriver;

impl DeviceDriver for UnixDriver {
    fn init(
        &self,
        target: &DeviceTarget,
        slab: ReadSlab,
        events: EventSender,
    ) -> Result<Arc<dyn DeviceHandle>, StreamError> {
        match target {
            DeviceTarget::Fd(fd) => {
                let dup = unsafe { libc::dup(*fd) };
                if dup < 0 {
                    return Err(StreamError::Device(DeviceError::from_errno(last_errno())));
                }
                UnixHandle::start(dup, false, slab, events)
            }
            DeviceTarget::Path(_) => UnixHandle::start(-1, true, slab, events),
        }
    }
}

enum Cmd {
    Open(PathBuf),
    Writev(Vec<Vec<u8>>),
    End,
    Close,
}

struct Shared {
    fd: AtomicI32,
    socket: bool,
    shutdown: AtomicBool,
    // true while read delivery is armed
    gate: Mutex<bool>,
    arm: Condvar,
    wake_r: RawFd,
    wake_w: RawFd,
    slab: ReadSlab,
    events: EventSender,
    saved_termios: Mutex<Option<libc::termios>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_r);
            libc::close(self.wake_w);
        }
    }
}

pub struct UnixHandle {
    shared: Arc<Shared>,
    cmds: Mutex<Sender<Cmd>>,
}

impl UnixHandle {
    fn start(
        fd: RawFd,
        socket: bool,
        slab: ReadSlab,
        events: EventSender,
    ) -> Result<Arc<dyn DeviceHandle>, StreamError> {
        let mut wake = [0 as RawFd; 2];
        if unsafe { libc::pipe(wake.as_mut_ptr()) } < 0 {
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
            return Err(StreamError::Device(DeviceError::from_errno(last_errno())));
        }

        let shared = Arc::new(Shared {
            fd: AtomicI32::new(fd),
            socket,
            shutdown: AtomicBool::new(false),
            gate: Mutex::new(false),
            arm: Condvar::new(),
            wake_r: wake[0],
            wake_w: wake[1],
            slab,
            events,
            saved_termios: Mutex::new(None),
        });

        let (tx, rx) = channel();
        let commands = Arc::clone(&shared);
        thread::spawn(move || command_loop(commands, rx));

        if fd >= 0 {
            let reader = Arc::clone(&shared);
            thread::spawn(move || read_loop(reader));
        }

        Ok(Arc::new(UnixHandle {
            shared,
            cmds: Mutex::new(tx),
        }))
    }

    fn send(&self, cmd: Cmd) -> Result<(), StreamError> {
        self.cmds.lock().send(cmd).map_err(|_| StreamError::Destroyed)
    }
}

impl DeviceHandle for UnixHandle {
    fn open(&self, path: &Path) -> Result<(), StreamError> {
        self.send(Cmd::Open(path.to_path_buf()))
    }

    fn resume(&self) {
        let mut armed = self.shared.gate.lock();
        if !*armed {
            *armed = true;
            self.shared.arm.notify_all();
        }
    }

    fn pause(&self) {
        let mut armed = self.shared.gate.lock();
        if *armed {
            *armed = false;
            drop(armed);
            wake(&self.shared);
        }
    }

    fn writev(&self, buffers: Vec<Vec<u8>>) {
        if self.send(Cmd::Writev(buffers)).is_err() {
            self.shared.events.emit(HandleEvent::Write(-libc::EBADF));
        }
    }

    fn end(&self) {
        if self.send(Cmd::End).is_err() {
            self.shared.events.emit(HandleEvent::Final(-libc::EBADF));
        }
    }

    fn close(&self) {
        let _ = self.send(Cmd::Close);
    }

    fn set_mode(&self, mode: TermMode) -> Result<(), StreamError> {
        set_mode_fd(&self.shared, mode)
    }

    fn window_size(&self) -> Result<(u16, u16), StreamError> {
        let fd = self.shared.fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(StreamError::NotConnected);
        }
        if !is_tty(fd) {
            return Err(StreamError::Unsupported { op: "window_size" });
        }
        let mut size: libc::winsize = unsafe { std::mem::zeroed() };
        if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut size) } < 0 {
            return Err(StreamError::Device(DeviceError::from_errno(last_errno())));
        }
        Ok((size.ws_col, size.ws_row))
    }
}

impl Drop for UnixHandle {
    fn drop(&mut self) {
        if !self.shared.shutdown.load(Ordering::SeqCst) {
            let _ = self.cmds.lock().send(Cmd::Close);
        }
    }
}

fn wake(shared: &Shared) {
    let byte = 1u8;
    let _ = unsafe { libc::write(shared.wake_w, &byte as *const u8 as *const libc::c_void, 1) };
}

fn command_loop(shared: Arc<Shared>, cmds: Receiver<Cmd>) {
    while let Ok(cmd) = cmds.recv() {
        match cmd {
            Cmd::Open(path) => match UnixStream::connect(&path) {
                Ok(sock) => {
                    let fd = sock.into_raw_fd();
                    shared.fd.store(fd, Ordering::SeqCst);
                    let reader = Arc::clone(&shared);
                    thread::spawn(move || read_loop(reader));
                    tracing::debug!(?path, fd, "socket connected");
                    shared.events.emit(HandleEvent::Connect(0));
                }
                Err(err) => {
                    let errno = err.raw_os_error().unwrap_or(libc::EIO);
                    tracing::debug!(?path, errno, "socket connect failed");
                    shared.events.emit(HandleEvent::Connect(-errno));
                }
            },
            Cmd::Writev(buffers) => {
                let status = write_all(&shared, &buffers);
                shared.events.emit(HandleEvent::Write(status));
            }
            Cmd::End => {
                let fd = shared.fd.load(Ordering::SeqCst);
                let status = if shared.socket && fd >= 0 {
                    if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
                        -last_errno()
                    } else {
                        0
                    }
                } else {
                    // Plain descriptors have no half-close; nothing to flush
                    // either, writes are synchronous on this thread.
                    0
                };
                shared.events.emit(HandleEvent::Final(status));
            }
            Cmd::Close => {
                close_device(&shared);
                shared.events.emit(HandleEvent::Close);
                break;
            }
        }
    }
}

fn write_all(shared: &Shared, buffers: &[Vec<u8>]) -> i32 {
    let fd = shared.fd.load(Ordering::SeqCst);
    if fd < 0 {
        return -libc::EBADF;
    }
    for buffer in buffers {
        let mut offset = 0;
        while offset < buffer.len() {
            let n = unsafe {
                libc::write(
                    fd,
                    buffer[offset..].as_ptr() as *const libc::c_void,
                    buffer.len() - offset,
                )
            };
            if n < 0 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return -errno;
            }
            offset += n as usize;
        }
    }
    0
}

fn close_device(shared: &Shared) {
    shared.shutdown.store(true, Ordering::SeqCst);
    shared.slab.poison();
    {
        let mut armed = shared.gate.lock();
        *armed = false;
        shared.arm.notify_all();
    }
    wake(shared);
    let fd = shared.fd.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        restore_termios(shared, fd);
        unsafe { libc::close(fd) };
    }
    tracing::debug!(fd, "device closed");
}

fn read_loop(shared: Arc<Shared>) {
    loop {
        {
            let mut armed = shared.gate.lock();
            while !*armed && !shared.shutdown.load(Ordering::SeqCst) {
                shared.arm.wait(&mut armed);
            }
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let fd = shared.fd.load(Ordering::SeqCst);
        if fd < 0 {
            break;
        }
        if !wait_readable(&shared, fd) {
            continue;
        }
        if !*shared.gate.lock() {
            // Paused between the poll and the read; deliver nothing.
            continue;
        }

        let filled = shared.slab.fill(|buf| {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                -(last_errno() as isize)
            } else {
                n
            }
        });
        let Some(n) = filled else {
            // Slab poisoned by close.
            break;
        };

        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if n < 0 {
            let errno = (-n) as i32;
            if errno == libc::EINTR || errno == libc::EAGAIN {
                continue;
            }
            shared.events.emit(HandleEvent::Read(-errno));
            break;
        }
        if n == 0 {
            // End of input: disarm until the stream explicitly resumes.
            *shared.gate.lock() = false;
            shared.events.emit(HandleEvent::Read(0));
            continue;
        }
        shared.events.emit(HandleEvent::Read(n as i32));
    }
}

/// Waits for the device or the wake pipe. Returns true when the device has
/// data (or hung up); false means "re-check the gate".
fn wait_readable(shared: &Shared, fd: RawFd) -> bool {
    let mut fds = [
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: shared.wake_r,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
    if rc < 0 {
        return false;
    }
    if fds[1].revents != 0 {
        let mut sink = [0u8; 64];
        let _ = unsafe {
            libc::read(
                shared.wake_r,
                sink.as_mut_ptr() as *mut libc::c_void,
                sink.len(),
            )
        };
        return false;
    }
    fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
}

fn set_mode_fd(shared: &Shared, mode: TermMode) -> Result<(), StreamError> {
    let fd = shared.fd.load(Ordering::SeqCst);
    if fd < 0 {
        return Err(StreamError::NotConnected);
    }
    if !is_tty(fd) {
        return Err(StreamError::Unsupported { op: "set_mode" });
    }
    let mut saved = shared.saved_termios.lock();
    match mode {
        TermMode::Normal => {
            if let Some(orig) = saved.take() {
                if unsafe { libc::tcsetattr(fd, libc::TCSADRAIN, &orig) } < 0 {
                    return Err(StreamError::Device(DeviceError::from_errno(last_errno())));
                }
            }
            Ok(())
        }
        TermMode::Raw | TermMode::RawIo => {
            let mut current: libc::termios = unsafe { std::mem::zeroed() };
            if unsafe { libc::tcgetattr(fd, &mut current) } < 0 {
                return Err(StreamError::Device(DeviceError::from_errno(last_errno())));
            }
            if saved.is_none() {
                *saved = Some(current);
            }
            let mut raw = current;
            unsafe { libc::cfmakeraw(&mut raw) };
            if mode == TermMode::Raw {
                // Keep signal generation so Ctrl-C still interrupts.
                raw.c_lflag |= libc::ISIG;
            }
            if unsafe { libc::tcsetattr(fd, libc::TCSADRAIN, &raw) } < 0 {
                return Err(StreamError::Device(DeviceError::from_errno(last_errno())));
            }
            Ok(())
        }
    }
}

fn restore_termios(shared: &Shared, fd: RawFd) {
    if let Some(orig) = shared.saved_termios.lock().take() {
        if unsafe { libc::tcsetattr(fd, libc::TCSADRAIN, &orig) } < 0 {
            tracing::warn!(fd, "failed to restore terminal mode on close");
        }
    }
}
