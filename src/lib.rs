//! Duplex byte streams over terminal and pipe file descriptors.
//!
//! A [`TtyStream`] wraps one device — an already-open descriptor or a named
//! socket reached by path — behind `AsyncRead`/`AsyncWrite`, with the
//! terminal extras those devices need: raw-mode switching, live window-size
//! queries, and half-open handling. The actual I/O happens in a pluggable
//! [`DeviceDriver`]; the stream itself is the lifecycle machine that
//! sequences connect, read backpressure, batched writes, half-close, and
//! teardown over the driver's completion events.
//!
//! ```no_run
//! use tokio::io::AsyncWriteExt;
//! use ttyflow::TtyStream;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut out = TtyStream::stdout()?;
//! out.write_all(b"hello from pipe\n").await?;
//! out.shutdown().await?;
//! out.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod error;
pub mod mode;
pub mod registry;
pub mod resize;
pub mod slab;
pub mod stream;

pub use driver::unix::{is_tty, UnixDriver};
pub use driver::{DeviceDriver, DeviceHandle, DeviceTarget, EventSender, HandleEvent};
pub use error::{DeviceError, StreamError};
pub use mode::TermMode;
pub use registry::{ExitGuard, StreamRegistry};
pub use resize::ResizeWatcher;
pub use slab::{ReadSlab, SlabPool};
pub use stream::{StreamBuilder, StreamOptions, TtyStream};
