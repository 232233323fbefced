use std::io;
use std::sync::Arc;
use std::thread;

use signal_hook::consts::signal::SIGWINCH;
use signal_hook::iterator::Signals;

use crate::driver::DeviceHandle;

/// Invokes a callback with the fresh window size on every SIGWINCH.
pub struct ResizeWatcher {
    handle: signal_hook::iterator::Handle,
    thread: thread::JoinHandle<()>,
}

impl ResizeWatcher {
    pub fn start<F>(device: Arc<dyn DeviceHandle>, on_resize: F) -> io::Result<Self>
    where
        F: Fn(u16, u16) + Send + 'static,
    {
        let mut signals = Signals::new([SIGWINCH])?;
        let handle = signals.handle();
        let thread = thread::spawn(move || {
            for _ in signals.forever() {
                let (columns, rows) = match device.window_size() {
                    Ok(size) => size,
                    Err(err) => {
                        tracing::warn!(%err, "window size query failed on resize");
                        continue;
                    }
                };
                on_resize(columns, rows);
            }
        });
        Ok(Self { handle, thread })
    }

    pub fn stop(self) {
        self.handle.close();
        let _ = self.thread.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::mode::TermMode;
    use std::path::Path;
    use std::sync::mpsc;
    use std::time::Duration;

    struct FixedSize;

    impl DeviceHandle for FixedSize {
        fn open(&self, _path: &Path) -> Result<(), StreamError> {
            Ok(())
        }
        fn resume(&self) {}
        fn pause(&self) {}
        fn writev(&self, _buffers: Vec<Vec<u8>>) {}
        fn end(&self) {}
        fn close(&self) {}
        fn set_mode(&self, _mode: TermMode) -> Result<(), StreamError> {
            Ok(())
        }
        fn window_size(&self) -> Result<(u16, u16), StreamError> {
            Ok((100, 40))
        }
    }

    #[test]
    fn reports_fresh_size_on_sigwinch() {
        let (tx, rx) = mpsc::channel();
        let watcher = ResizeWatcher::start(Arc::new(FixedSize), move |columns, rows| {
            let _ = tx.send((columns, rows));
        })
        .unwrap();

        unsafe { libc::raise(libc::SIGWINCH) };
        let size = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(size, (100, 40));

        watcher.stop();
    }
}
