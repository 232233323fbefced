//! Event pump and the `AsyncRead`/`AsyncWrite` state machine.

use std::io;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{ConnectionState, TtyStream};
use crate::driver::HandleEvent;
use crate::error::{DeviceError, StreamError};

impl TtyStream {
    /// Drains every completion the device has delivered so far. Called at
    /// the top of every poll; the channel wakes whichever task polled last,
    /// and the dispatch handlers re-wake the role a completion belongs to.
    pub(crate) fn pump(&mut self, cx: &mut Context<'_>) {
        loop {
            match self.events.poll_recv(cx) {
                Poll::Ready(Some(event)) => self.dispatch(event),
                Poll::Ready(None) => {
                    // Driver dropped the channel without a close completion;
                    // treat it as closed so nothing hangs.
                    if !self.closed {
                        self.dispatch(HandleEvent::Close);
                    }
                    break;
                }
                Poll::Pending => break,
            }
        }
    }

    fn dispatch(&mut self, event: HandleEvent) {
        match event {
            HandleEvent::Connect(status) => {
                if status < 0 {
                    let err = DeviceError::from_status(status);
                    tracing::debug!(%err, status, "connect failed");
                    self.connection = ConnectionState::Failed;
                    self.fatal = Some(StreamError::Connect(err));
                } else {
                    tracing::debug!("connected");
                    self.connection = ConnectionState::Connected;
                }
                self.wakers.wake_open();
                self.wakers.wake_write();
                self.wakers.wake_read();
            }
            HandleEvent::Read(status) => self.on_read(status),
            HandleEvent::Write(status) => {
                self.write_in_flight = false;
                if status < 0 {
                    self.write_error = Some(StreamError::Write(DeviceError::from_status(status)));
                }
                self.wakers.wake_write();
            }
            HandleEvent::Final(status) => {
                self.final_result = Some(if status < 0 {
                    Err(StreamError::End(DeviceError::from_status(status)))
                } else {
                    Ok(())
                });
                self.wakers.wake_write();
            }
            HandleEvent::Close => {
                tracing::debug!("device closed");
                self.closed = true;
                self.handle = None;
                if let Some(pool) = &self.pool {
                    pool.give_back(self.slab.clone());
                }
                self.wakers.wake_all();
            }
        }
    }

    fn on_read(&mut self, status: i32) {
        if status < 0 {
            let err = StreamError::Read(DeviceError::from_status(status));
            tracing::debug!(%err, status, "read failed, destroying stream");
            self.reading = false;
            self.fatal = Some(err);
            // Read errors are fatal: tear down without waiting for the
            // consumer.
            self.begin_close();
            self.wakers.wake_read();
            self.wakers.wake_write();
            return;
        }
        if status == 0 {
            tracing::debug!("end of input");
            self.reading = false;
            self.ended_input = true;
            if !self.allow_half_open {
                // End is requested immediately; the driver orders it after
                // any write it already has in flight.
                self.start_end();
            }
            self.wakers.wake_read();
            return;
        }

        let chunk = self.slab.take(status as usize);
        tracing::trace!(len = chunk.len(), "read chunk");
        self.queued_bytes += chunk.len();
        self.read_queue.push_back(chunk);
        if self.queued_bytes > self.high_water_mark && !self.is_closing() {
            tracing::debug!(queued = self.queued_bytes, "over high water mark, pausing");
            if let Some(handle) = &self.handle {
                handle.pause();
            }
            self.reading = false;
        }
        self.wakers.wake_read();
    }

    /// Starts teardown: flips the shared closing flag, leaves the registry,
    /// and issues the device close. Returns false when teardown had already
    /// begun (including via a registry force-close, which issues the device
    /// close itself).
    pub(crate) fn begin_close(&mut self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!("closing stream");
        if let Some(registration) = self.registration.take() {
            registration.deregister();
        }
        if let Some(handle) = &self.handle {
            handle.close();
        }
        true
    }

    fn start_end(&mut self) {
        if self.ending_output || self.final_result.is_some() || self.is_closing() {
            return;
        }
        if let Some(handle) = &self.handle {
            self.ending_output = true;
            handle.end();
        }
    }

    /// The pull hook: arms the device reader unless it is already armed or
    /// the stream cannot read anymore.
    fn maybe_resume(&mut self) {
        if self.reading
            || self.ended_input
            || self.is_closing()
            || self.connection != ConnectionState::Connected
        {
            return;
        }
        if let Some(handle) = &self.handle {
            handle.resume();
            self.reading = true;
        }
    }
}

impl AsyncRead for TtyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.pump(cx);

        if let Some(chunk) = this.read_queue.pop_front() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            if n < chunk.len() {
                this.read_queue.push_front(chunk[n..].to_vec());
            }
            this.queued_bytes -= n;
            if this.read_queue.is_empty() {
                this.maybe_resume();
            }
            return Poll::Ready(Ok(()));
        }

        if let Some(err) = &this.fatal {
            return Poll::Ready(Err(err.clone().into()));
        }
        if this.ended_input {
            // Zero-byte read: end of input.
            return Poll::Ready(Ok(()));
        }
        if this.is_closing() || this.closed {
            return Poll::Ready(Err(StreamError::Destroyed.into()));
        }

        this.maybe_resume();
        this.wakers.read = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for TtyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.pump(cx);
        match this.poll_write_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => return Poll::Pending,
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let Some(handle) = &this.handle else {
            return Poll::Ready(Err(StreamError::Destroyed.into()));
        };
        handle.writev(vec![buf.to_vec()]);
        this.write_in_flight = true;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.pump(cx);
        match this.poll_write_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => return Poll::Pending,
        }
        let batch: Vec<Vec<u8>> = bufs
            .iter()
            .filter(|slice| !slice.is_empty())
            .map(|slice| slice.to_vec())
            .collect();
        let total: usize = batch.iter().map(Vec::len).sum();
        if total == 0 {
            return Poll::Ready(Ok(0));
        }
        let Some(handle) = &this.handle else {
            return Poll::Ready(Err(StreamError::Destroyed.into()));
        };
        handle.writev(batch);
        this.write_in_flight = true;
        Poll::Ready(Ok(total))
    }

    fn is_write_vectored(&self) -> bool {
        true
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.pump(cx);
        if let Some(err) = this.write_error.take() {
            return Poll::Ready(Err(err.into()));
        }
        if let Some(err) = &this.fatal {
            return Poll::Ready(Err(err.clone().into()));
        }
        if this.write_in_flight {
            // Close is the last event; a completion for this batch can no
            // longer arrive once teardown has started.
            if this.is_closing() || this.closed {
                return Poll::Ready(Err(StreamError::Destroyed.into()));
            }
            this.wakers.write = Some(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.pump(cx);
        if let Some(err) = this.write_error.take() {
            return Poll::Ready(Err(err.into()));
        }
        if let Some(err) = &this.fatal {
            return Poll::Ready(Err(err.clone().into()));
        }
        if this.connection == ConnectionState::Connecting {
            this.wakers.write = Some(cx.waker().clone());
            return Poll::Pending;
        }
        // Shutdown implies flush: wait out the in-flight batch first. Once
        // teardown has started that completion can no longer arrive.
        if this.write_in_flight {
            if this.is_closing() || this.closed {
                return Poll::Ready(Err(StreamError::Destroyed.into()));
            }
            this.wakers.write = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if let Some(result) = &this.final_result {
            return Poll::Ready(result.clone().map_err(Into::into));
        }
        if this.is_closing() || this.closed {
            return Poll::Ready(Err(StreamError::Destroyed.into()));
        }
        this.start_end();
        if !this.ending_output {
            return Poll::Ready(Err(StreamError::Destroyed.into()));
        }
        this.wakers.write = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl TtyStream {
    /// Common gate for both write entry points: connect must have resolved,
    /// nothing may be ending or torn down, and at most one batch is in
    /// flight.
    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(err) = self.write_error.take() {
            return Poll::Ready(Err(err.into()));
        }
        if let Some(err) = &self.fatal {
            return Poll::Ready(Err(err.clone().into()));
        }
        if self.is_closing() || self.closed {
            return Poll::Ready(Err(StreamError::Destroyed.into()));
        }
        if self.ending_output || self.final_result.is_some() {
            return Poll::Ready(Err(StreamError::Ended.into()));
        }
        match self.connection {
            ConnectionState::Connecting => {
                self.wakers.write = Some(cx.waker().clone());
                Poll::Pending
            }
            ConnectionState::Failed => {
                Poll::Ready(Err(StreamError::NotConnected.into()))
            }
            ConnectionState::Connected => {
                if self.write_in_flight {
                    self.wakers.write = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}
