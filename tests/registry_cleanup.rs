mod common;

use common::MockState;
use std::io::ErrorKind;
use tokio::io::AsyncWriteExt;
use ttyflow::{StreamBuilder, StreamRegistry};

#[tokio::test]
async fn registry_tracks_live_streams() {
    let registry = StreamRegistry::new();

    let first_state = MockState::new();
    let mut first = StreamBuilder::new()
        .driver(first_state.driver())
        .registry(registry.clone())
        .open_fd(0)
        .unwrap();

    let second_state = MockState::new();
    let second = StreamBuilder::new()
        .driver(second_state.driver())
        .registry(registry.clone())
        .open_fd(1)
        .unwrap();

    assert_eq!(registry.len(), 2);

    // Teardown leaves the registry the moment it starts.
    first.destroy().await;
    assert_eq!(registry.len(), 1);

    drop(second);
    assert!(registry.is_empty());
    assert_eq!(second_state.closes(), 1);
}

#[tokio::test]
async fn shutdown_force_closes_forgotten_streams() {
    let registry = StreamRegistry::new();
    let state = MockState::new();
    let mut stream = StreamBuilder::new()
        .driver(state.driver())
        .registry(registry.clone())
        .open_fd(0)
        .unwrap();

    assert_eq!(registry.shutdown(), 1);
    assert_eq!(state.closes(), 1);
    assert!(stream.is_closing());

    // The stream observes the force-close: operations fail, and its own
    // destroy does not issue a second close.
    let err = stream.write_all(b"x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    stream.destroy().await;
    assert_eq!(state.closes(), 1);
}

#[tokio::test]
async fn destroyed_streams_do_not_count_against_shutdown() {
    let registry = StreamRegistry::new();
    let state = MockState::new();
    let mut stream = StreamBuilder::new()
        .driver(state.driver())
        .registry(registry.clone())
        .open_fd(0)
        .unwrap();

    stream.destroy().await;
    assert_eq!(registry.shutdown(), 0);
    assert_eq!(state.closes(), 1);
}
