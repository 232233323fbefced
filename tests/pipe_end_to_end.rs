//! Exercises the real Unix driver against pipes, sockets, and (when the
//! test runner has one) a terminal.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixListener;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use ttyflow::{is_tty, StreamError, StreamOptions, TermMode, TtyStream};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_reach_the_pipe() {
    init_logging();
    let (read_fd, write_fd) = pipe();

    let mut stream = TtyStream::from_fd(write_fd).unwrap();
    // The stream holds a dup; drop the original so EOF is observable.
    drop(unsafe { File::from_raw_fd(write_fd) });

    stream.write_all(b"hello from pipe\n").await.unwrap();
    stream.flush().await.unwrap();
    stream.shutdown().await.unwrap();
    stream.destroy().await;
    assert!(stream.is_destroyed());

    let mut received = Vec::new();
    let mut reader = unsafe { File::from_raw_fd(read_fd) };
    reader.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"hello from pipe\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_flow_until_eof() {
    init_logging();
    let (read_fd, write_fd) = pipe();

    let mut stream = TtyStream::from_fd(read_fd).unwrap();
    drop(unsafe { File::from_raw_fd(read_fd) });

    let mut writer = unsafe { File::from_raw_fd(write_fd) };
    writer.write_all(b"ping").unwrap();

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");

    // Closing the write end is end-of-input, not an error.
    drop(writer);
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("EOF must arrive")
        .unwrap();
    assert_eq!(n, 0);

    stream.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn socket_connect_roundtrip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ttyflow.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let mut stream = TtyStream::connect(&path).unwrap();
    stream.ready().await.unwrap();

    let (mut server, _) = listener.accept().unwrap();
    server.write_all(b"hello").unwrap();

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");

    stream.write_all(b"pong").await.unwrap();
    stream.flush().await.unwrap();
    let mut reply = [0u8; 4];
    server.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"pong");

    // Half-close: the server sees EOF after shutdown.
    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    stream.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_to_missing_path_fails_with_enoent() {
    init_logging();
    let mut stream = TtyStream::connect("/definitely/not/a/socket").unwrap();
    let err = stream.ready().await.unwrap_err();
    assert!(err.to_string().contains("ENOENT"), "got: {err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_operations_are_unsupported_on_pipes() {
    init_logging();
    let (read_fd, write_fd) = pipe();
    let mut stream = TtyStream::from_fd(write_fd).unwrap();
    drop(unsafe { File::from_raw_fd(read_fd) });
    drop(unsafe { File::from_raw_fd(write_fd) });

    assert!(!stream.is_tty());
    let err = stream.set_mode(TermMode::Raw).unwrap_err();
    assert!(matches!(err, StreamError::Unsupported { op: "set_mode" }));
    let err = stream.window_size().unwrap_err();
    assert!(matches!(err, StreamError::Unsupported { op: "window_size" }));

    stream.destroy().await;
}

#[tokio::test]
async fn window_size_on_a_real_terminal() {
    // Only meaningful when the runner is interactive.
    if !is_tty(1) {
        return;
    }
    let stream = TtyStream::stdout().unwrap();
    assert!(stream.is_tty());
    let (columns, rows) = stream.window_size().unwrap();
    assert!(columns > 0);
    assert!(rows > 0);
}

#[test]
fn options_deserialize_with_defaults() {
    let options: StreamOptions = serde_json::from_str("{}").unwrap();
    assert_eq!(options.read_buffer_size, 65536);
    assert!(options.allow_half_open);
    assert_eq!(options.high_water_mark, 16384);

    let options: StreamOptions =
        serde_json::from_str(r#"{"read_buffer_size": 1024, "allow_half_open": false}"#).unwrap();
    assert_eq!(options.read_buffer_size, 1024);
    assert!(!options.allow_half_open);
    assert_eq!(options.high_water_mark, 16384);
}
