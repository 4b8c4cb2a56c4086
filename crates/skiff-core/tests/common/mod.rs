//! Common test utilities for Skiff integration tests.
//!
//! These tests drive real `Server` instances over 127.0.0.1 with ephemeral
//! ports, so they run fine in CI.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use skiff_core::config::ServerConfig;
use skiff_core::events::{EventKind, ServerEvent};
use skiff_core::server::Server;
use skiff_core::Result;

/// A server with its pump running and a private temp directory.
pub struct TestPeer {
    /// The server under test
    pub server: Arc<Server>,
    /// The running pump; resolves when the server stops
    pub pump: JoinHandle<Result<()>>,
    /// Owns the peer's transfer folder
    pub dir: tempfile::TempDir,
}

impl TestPeer {
    /// The address other peers should connect to.
    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// A path inside this peer's transfer folder.
    pub fn transfer_path(&self, name: &str) -> PathBuf {
        self.server.transfer_folder().join(name)
    }
}

/// Bind a server, start its pump, and wait until it is listening.
pub async fn spawn_peer(name: &str, stall_timeout: Duration) -> TestPeer {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let config = ServerConfig {
        name: name.to_string(),
        port: 0,
        transfer_folder: dir.path().join("transfer"),
        buffer_size: 1024,
        stall_timeout,
        ..ServerConfig::default()
    };

    let server = Server::bind(config).await.expect("Failed to bind server");
    let pump = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    let flags = server.flags();
    wait_for("server to start listening", || {
        flags.listening.load(std::sync::atomic::Ordering::SeqCst)
    })
    .await;

    TestPeer { server, pump, dir }
}

/// Create a test file with the given content.
pub fn create_test_file(path: &std::path::Path, content: &[u8]) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(path, content).expect("Failed to write test file");
    path.to_path_buf()
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &std::path::Path, path2: &std::path::Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// Poll a condition until it holds or five seconds pass.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait for the next event matching the predicate.
pub async fn await_event<F>(
    rx: &mut broadcast::Receiver<ServerEvent>,
    what: &str,
    mut pred: F,
) -> ServerEvent
where
    F: FnMut(&EventKind) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event.kind) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event channel closed while waiting for {what}")
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
