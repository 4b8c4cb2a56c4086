//! File transfer pipelines.
//!
//! Both directions move raw, unframed file bytes over the connection that
//! carried the transfer request. The sender streams chunks of at most one
//! buffer and checks the peer-stall flag between chunks; the receiver
//! drains exactly the announced byte count, with a stall monitor on an
//! independent timer watching for a quiet stream, and finishes with the
//! raw `handshake` confirmation.
//!
//! These pipelines own the byte movement only. Connection setup, the
//! accept/reject exchange, and the retry conversation live in
//! [`crate::server`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};

/// Transfer state, as exposed through the progress channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// No transfer in flight
    Idle,
    /// Request sent, waiting for the peer to accept or reject
    AwaitingResponse,
    /// Sending file bytes
    Streaming,
    /// Receiving file bytes
    Receiving,
    /// The transfer stalled; a retry may follow
    Stalled,
    /// The peer rejected the transfer
    Rejected,
    /// All bytes moved and the handshake completed
    Completed,
    /// The transfer failed
    Failed,
}

/// Progress snapshot for the transfer in flight.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Current state
    pub state: TransferState,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// Total bytes in the file
    pub total_bytes: u64,
}

impl TransferProgress {
    /// An idle snapshot.
    pub const fn idle() -> Self {
        Self {
            state: TransferState::Idle,
            bytes_transferred: 0,
            total_bytes: 0,
        }
    }

    /// Progress as a percentage (0.0 - 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Knobs the pipelines need, cut down from the full server configuration.
#[derive(Debug, Clone, Copy)]
pub struct TransferSettings {
    /// Chunk size for both directions
    pub buffer_size: usize,
    /// No-progress interval after which an inbound transfer is stalled
    pub stall_timeout: Duration,
    /// Fraction of the file that must arrive between progress events
    pub update_interval: f64,
}

impl From<&ServerConfig> for TransferSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            stall_timeout: config.stall_timeout,
            update_interval: config.transfer_update_interval,
        }
    }
}

fn publish(
    progress: &watch::Sender<TransferProgress>,
    state: TransferState,
    bytes_transferred: u64,
    total_bytes: u64,
) {
    let _ = progress.send(TransferProgress {
        state,
        bytes_transferred,
        total_bytes,
    });
}

/// Stream a file's bytes to the peer, one buffer at a time.
///
/// `stalled_by_peer` is set by the request pump when a `FileTransferStalled`
/// message arrives; it is checked between chunks and aborts the stream with
/// a recoverable error. The function does not wait for the completion
/// handshake; the caller does.
pub(crate) async fn stream_file<S>(
    conn: &mut Connection<S>,
    path: &Path,
    file_size: u64,
    settings: &TransferSettings,
    stalled_by_peer: &AtomicBool,
    cancel: &AtomicBool,
    events: &EventBus,
    progress: &watch::Sender<TransferProgress>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    events.emit(EventKind::SendFileBytesStarted {
        file_path: path.to_path_buf(),
        file_size,
        remote_addr: conn.peer_addr(),
    });
    publish(progress, TransferState::Streaming, 0, file_size);

    if file_size > 0 {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;

        let mut buf = vec![0u8; settings.buffer_size];
        let mut bytes_remaining = file_size;

        while bytes_remaining > 0 {
            if cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if stalled_by_peer.load(Ordering::SeqCst) {
                tracing::warn!(
                    "peer reported a stalled transfer; aborting send of {}",
                    path.display()
                );
                publish(progress, TransferState::Stalled, file_size - bytes_remaining, file_size);
                return Err(Error::StalledByPeer);
            }

            let n = usize::try_from(bytes_remaining.min(settings.buffer_size as u64))
                .unwrap_or(settings.buffer_size);
            file.read_exact(&mut buf[..n]).await?;
            conn.send_all(&buf[..n]).await?;

            bytes_remaining -= n as u64;
            publish(
                progress,
                TransferState::Streaming,
                file_size - bytes_remaining,
                file_size,
            );
        }
    }

    events.emit(EventKind::SendFileBytesComplete {
        file_path: path.to_path_buf(),
        file_size,
    });
    Ok(())
}

/// Drain exactly `file_size` bytes from the connection into `path`.
///
/// The carry buffer is consumed before any fresh socket read: when the
/// sender coalesced the transfer request with the head of the file body,
/// those bytes are already parked there. A zero-size file skips the stream
/// phase entirely.
///
/// On a stall the partial file is removed (a retry re-sends from the
/// start, and a leftover partial would trip the file-exists rejection) and
/// `inbound_stalled` is left set for the server to act on.
pub(crate) async fn receive_file<S>(
    conn: &mut Connection<S>,
    path: &Path,
    file_size: u64,
    settings: &TransferSettings,
    inbound_stalled: Arc<AtomicBool>,
    cancel: &AtomicBool,
    events: &EventBus,
    progress: &watch::Sender<TransferProgress>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    events.emit(EventKind::ReceiveFileBytesStarted {
        local_path: path.to_path_buf(),
        file_size,
    });
    publish(progress, TransferState::Receiving, 0, file_size);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;

    if file_size == 0 {
        file.flush().await?;
        events.emit(EventKind::ReceiveFileBytesComplete {
            local_path: path.to_path_buf(),
            file_size,
        });
        publish(progress, TransferState::Completed, 0, 0);
        return Ok(());
    }

    let emit_read_events = file_size <= crate::DEBUG_EVENT_BUFFER_MULTIPLE * settings.buffer_size as u64;
    let received = Arc::new(AtomicU64::new(0));

    let mut buf = vec![0u8; settings.buffer_size];
    let mut total: u64 = 0;
    let mut last_reported: f64 = 0.0;

    // The sender may have coalesced the head of the file body with its
    // request frame; those bytes sit in the carry buffer and must reach
    // the file before any fresh socket read.
    let carry = conn.take_unread();
    if !carry.is_empty() {
        let take = usize::try_from(file_size.min(carry.len() as u64)).unwrap_or(carry.len());
        file.write_all(&carry[..take]).await?;
        total = take as u64;
        received.store(total, Ordering::SeqCst);

        if emit_read_events {
            events.emit(EventKind::ReceivedFileBytesFromSocket {
                bytes_received: take,
                total_received: total,
                file_size,
            });
        }
        let fraction = total as f64 / file_size as f64;
        if fraction - last_reported > settings.update_interval {
            last_reported = fraction;
            events.emit(EventKind::UpdateFileTransferProgress {
                percent_complete: fraction * 100.0,
            });
        }
        publish(progress, TransferState::Receiving, total, file_size);
    }

    let monitor = StallMonitor::start(
        settings.stall_timeout,
        Arc::clone(&received),
        inbound_stalled,
    );

    while total < file_size {
        if cancel.load(Ordering::SeqCst) {
            monitor.stop();
            drop(file);
            let _ = tokio::fs::remove_file(path).await;
            publish(progress, TransferState::Idle, total, file_size);
            return Err(Error::Cancelled);
        }

        let want = usize::try_from((file_size - total).min(settings.buffer_size as u64))
            .unwrap_or(settings.buffer_size);

        let n = tokio::select! {
            result = conn.read_chunk_no_deadline(&mut buf[..want]) => {
                match result {
                    Ok(n) => n,
                    Err(e) => {
                        monitor.stop();
                        drop(file);
                        let _ = tokio::fs::remove_file(path).await;
                        publish(progress, TransferState::Failed, total, file_size);
                        return Err(e);
                    }
                }
            }
            () = monitor.stalled() => {
                events.emit(EventKind::FileTransferStalled {
                    bytes_received: total,
                    file_size,
                });
                tracing::warn!(
                    "no bytes for {:?} while receiving {}; transfer stalled at {total}/{file_size}",
                    settings.stall_timeout,
                    path.display(),
                );
                drop(file);
                let _ = tokio::fs::remove_file(path).await;
                publish(progress, TransferState::Stalled, total, file_size);
                return Err(Error::TransferStalled(
                    u64::try_from(settings.stall_timeout.as_millis()).unwrap_or(u64::MAX),
                ));
            }
        };

        file.write_all(&buf[..n]).await?;
        total += n as u64;
        received.store(total, Ordering::SeqCst);

        if emit_read_events {
            events.emit(EventKind::ReceivedFileBytesFromSocket {
                bytes_received: n,
                total_received: total,
                file_size,
            });
        }

        let fraction = total as f64 / file_size as f64;
        if fraction - last_reported > settings.update_interval {
            last_reported = fraction;
            events.emit(EventKind::UpdateFileTransferProgress {
                percent_complete: fraction * 100.0,
            });
        }
        publish(progress, TransferState::Receiving, total, file_size);
    }

    monitor.stop();
    file.flush().await?;

    events.emit(EventKind::ReceiveFileBytesComplete {
        local_path: path.to_path_buf(),
        file_size,
    });
    publish(progress, TransferState::Completed, total, file_size);
    Ok(())
}

/// Watches a byte counter on an independent timer and fires once when a
/// full interval passes with no growth.
struct StallMonitor {
    notify: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl StallMonitor {
    fn start(interval: Duration, received: Arc<AtomicU64>, stalled_flag: Arc<AtomicBool>) -> Self {
        let notify = Arc::new(Notify::new());
        let notify_task = Arc::clone(&notify);

        let handle = tokio::spawn(async move {
            let mut last = received.load(Ordering::SeqCst);
            loop {
                tokio::time::sleep(interval).await;
                let now = received.load(Ordering::SeqCst);
                if now == last {
                    let _ = stalled_flag.compare_exchange(
                        false,
                        true,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    // notify_one stores a permit, so the receive loop sees
                    // the stall even if it is mid-write right now.
                    notify_task.notify_one();
                    return;
                }
                last = now;
            }
        });

        Self { notify, handle }
    }

    async fn stalled(&self) {
        self.notify.notified().await;
    }

    fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SocketConfig;
    use std::net::SocketAddr;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:52550".parse().unwrap()
    }

    fn settings(buffer_size: usize, stall_ms: u64) -> TransferSettings {
        TransferSettings {
            buffer_size,
            stall_timeout: Duration::from_millis(stall_ms),
            update_interval: crate::DEFAULT_TRANSFER_UPDATE_INTERVAL,
        }
    }

    fn socket_config(buffer_size: usize) -> SocketConfig {
        SocketConfig {
            buffer_size,
            ..SocketConfig::default()
        }
    }

    async fn roundtrip(content: &[u8], buffer_size: usize) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        std::fs::write(&src, content).unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut sender = Connection::new(client, test_addr(), socket_config(buffer_size));
        let mut receiver = Connection::new(server, test_addr(), socket_config(buffer_size));

        let size = content.len() as u64;
        let send_settings = settings(buffer_size, 5000);
        let recv_settings = send_settings;

        let events = EventBus::new();
        let (tx, _rx) = watch::channel(TransferProgress::idle());
        let stalled = AtomicBool::new(false);
        let cancel = AtomicBool::new(false);

        let send_src = src.clone();
        let send_task = async {
            stream_file(
                &mut sender,
                &send_src,
                size,
                &send_settings,
                &stalled,
                &cancel,
                &events,
                &tx,
            )
            .await
        };

        let recv_events = EventBus::new();
        let (recv_tx, _recv_rx) = watch::channel(TransferProgress::idle());
        let recv_flag = Arc::new(AtomicBool::new(false));
        let recv_cancel = AtomicBool::new(false);
        let recv_dst = dst.clone();
        let recv_task = async {
            receive_file(
                &mut receiver,
                &recv_dst,
                size,
                &recv_settings,
                recv_flag,
                &recv_cancel,
                &recv_events,
                &recv_tx,
            )
            .await
        };

        let (sent, received) = tokio::join!(send_task, recv_task);
        sent.unwrap();
        received.unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), content);
    }

    #[tokio::test]
    async fn test_roundtrip_small_file() {
        roundtrip(&[0x01, 0x02, 0x03], 64).await;
    }

    #[tokio::test]
    async fn test_roundtrip_zero_byte_file() {
        roundtrip(&[], 64).await;
    }

    #[tokio::test]
    async fn test_roundtrip_at_buffer_boundaries() {
        use rand::RngCore;
        for size in [63usize, 64, 65, 640] {
            let mut content = vec![0u8; size];
            rand::thread_rng().fill_bytes(&mut content);
            roundtrip(&content, 64).await;
        }
    }

    #[tokio::test]
    async fn test_receive_consumes_carried_file_head() {
        use crate::protocol::{encode_frame, Payload, ReplyTo};

        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst.bin");

        let (mut client, server) = tokio::io::duplex(8192);
        let mut receiver = Connection::new(server, test_addr(), socket_config(4096));

        // Request frame and the whole file body arrive in one write, so
        // the frame decode parks the body in the carry buffer.
        let request = Payload::InboundFileTransfer {
            local_path: dst.clone(),
            file_size: 8,
            sender: ReplyTo::new("127.0.0.1", 52550),
        };
        let mut wire = encode_frame(&request);
        wire.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        client.write_all(&wire).await.unwrap();

        receiver.read_frame().await.unwrap();
        assert_eq!(receiver.unread_len(), 8);

        let events = EventBus::new();
        let (tx, _rx) = watch::channel(TransferProgress::idle());
        receive_file(
            &mut receiver,
            &dst,
            8,
            &settings(4096, 5000),
            Arc::new(AtomicBool::new(false)),
            &AtomicBool::new(false),
            &events,
            &tx,
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_receive_detects_stall_and_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst.bin");

        let (mut client, server) = tokio::io::duplex(4096);
        let mut receiver = Connection::new(server, test_addr(), socket_config(64));

        // Half the announced bytes arrive, then the stream goes quiet.
        client.write_all(&[0xAA; 64]).await.unwrap();

        let events = EventBus::new();
        let (tx, _rx) = watch::channel(TransferProgress::idle());
        let flag = Arc::new(AtomicBool::new(false));

        let result = receive_file(
            &mut receiver,
            &dst,
            128,
            &settings(64, 100),
            Arc::clone(&flag),
            &AtomicBool::new(false),
            &events,
            &tx,
        )
        .await;

        assert!(matches!(result, Err(Error::TransferStalled(100))));
        assert!(flag.load(Ordering::SeqCst));
        assert!(!dst.exists(), "partial file must be removed after a stall");
    }

    #[tokio::test]
    async fn test_stream_aborts_when_peer_reports_stall() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, vec![0u8; 1024]).unwrap();

        let (client, _server) = tokio::io::duplex(64 * 1024);
        let mut sender = Connection::new(client, test_addr(), socket_config(64));

        let events = EventBus::new();
        let (tx, _rx) = watch::channel(TransferProgress::idle());
        let stalled = AtomicBool::new(true);

        let result = stream_file(
            &mut sender,
            &src,
            1024,
            &settings(64, 5000),
            &stalled,
            &AtomicBool::new(false),
            &events,
            &tx,
        )
        .await;

        assert!(matches!(result, Err(Error::StalledByPeer)));
    }

    #[tokio::test]
    async fn test_stream_aborts_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, vec![0u8; 1024]).unwrap();

        let (client, _server) = tokio::io::duplex(64 * 1024);
        let mut sender = Connection::new(client, test_addr(), socket_config(64));

        let events = EventBus::new();
        let (tx, _rx) = watch::channel(TransferProgress::idle());

        let result = stream_file(
            &mut sender,
            &src,
            1024,
            &settings(64, 5000),
            &AtomicBool::new(false),
            &AtomicBool::new(true),
            &events,
            &tx,
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_receive_peer_close_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst.bin");

        let (mut client, server) = tokio::io::duplex(4096);
        let mut receiver = Connection::new(server, test_addr(), socket_config(64));

        client.write_all(&[0x55; 10]).await.unwrap();
        drop(client);

        let events = EventBus::new();
        let (tx, _rx) = watch::channel(TransferProgress::idle());
        let flag = Arc::new(AtomicBool::new(false));

        let result = receive_file(
            &mut receiver,
            &dst,
            100,
            &settings(64, 5000),
            flag,
            &AtomicBool::new(false),
            &events,
            &tx,
        )
        .await;

        assert!(matches!(result, Err(Error::PeerClosed)));
        assert!(!dst.exists());
    }

    #[test]
    fn test_progress_percentage() {
        let progress = TransferProgress {
            state: TransferState::Receiving,
            bytes_transferred: 25,
            total_bytes: 100,
        };
        assert!((progress.percentage() - 25.0).abs() < f64::EPSILON);
        assert!((TransferProgress::idle().percentage() - 100.0).abs() < f64::EPSILON);
    }
}
