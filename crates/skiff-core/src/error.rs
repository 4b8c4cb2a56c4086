//! Error types for Skiff.
//!
//! One unified error type covers socket failures, protocol violations,
//! transfer-semantic refusals, and request-queue misuse. Handlers surface
//! these to the event stream; only listener and shutdown errors abort the
//! request pump.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// A specialized `Result` type for Skiff operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Skiff.
#[derive(Error, Debug)]
pub enum Error {
    /// A socket operation exceeded its deadline
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// The peer is not listening on the requested endpoint
    #[error("connection refused by {0}")]
    ConnectionRefused(SocketAddr),

    /// The peer reset the connection mid-operation
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A receive returned zero bytes; the peer closed the socket
    #[error("peer closed the connection")]
    PeerClosed,

    /// Fewer than four bytes were available where a length prefix was expected
    #[error("truncated length prefix: {0} of 4 bytes")]
    TruncatedLength(usize),

    /// The peer closed the stream before the full payload arrived
    #[error("truncated payload: received {received} of {expected} bytes")]
    TruncatedPayload {
        /// Bytes collected before the stream ended
        received: usize,
        /// Declared payload length
        expected: usize,
    },

    /// The leading type code is outside the message enum
    #[error("unknown message type code: {0}")]
    UnknownMessageType(u32),

    /// A payload field did not decode as declared
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The completion handshake did not match the expected text
    #[error("unexpected transfer confirmation: {0:?}")]
    UnexpectedConfirmation(Vec<u8>),

    /// The peer refused an inbound transfer because the file already exists
    #[error("transfer rejected by peer")]
    TransferRejected,

    /// The peer signalled a stalled inbound transfer
    #[error("transfer stalled by peer")]
    StalledByPeer,

    /// The inbound byte stream made no progress within the stall timeout
    #[error("inbound transfer stalled: no bytes for {0} ms")]
    TransferStalled(u64),

    /// Another transfer is already in flight
    #[error("a file transfer is already in progress")]
    TransferInProgress,

    /// No previous outbound transfer is remembered for a retry
    #[error("no outbound transfer available to retry")]
    NothingToRetry,

    /// The requested file does not exist on this server
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The requested folder does not exist on the peer
    #[error("requested folder does not exist on peer")]
    RemoteFolderMissing,

    /// The requested folder on the peer holds no files
    #[error("no files available for download from peer")]
    NoFilesAvailable,

    /// The server is shutting down; the operation stopped at its next
    /// suspension point
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// `process_request_by_id` was called while another request is active
    #[error("request pump is busy; another request is being processed")]
    PumpBusy,

    /// The request id was already processed and archived
    #[error("request {0} has already been processed")]
    AlreadyProcessed(u32),

    /// The request id is not in the queue or the archive
    #[error("invalid request id: {0}")]
    InvalidRequestId(u32),

    /// The peer never answered a metadata request
    #[error("no response from peer at {0}")]
    NoResponse(SocketAddr),

    /// Invalid address or CIDR text supplied by the caller
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns whether this error is recoverable (the transfer can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::ConnectionRefused(_)
                | Self::ConnectionReset
                | Self::StalledByPeer
                | Self::TransferStalled(_)
                | Self::NoResponse(_)
        )
    }

    /// Map an I/O error from a socket call into the typed socket set.
    pub(crate) fn from_socket(err: io::Error, peer: SocketAddr) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(peer),
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Self::ConnectionReset,
            io::ErrorKind::UnexpectedEof => Self::PeerClosed,
            _ => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Timeout(5000).is_recoverable());
        assert!(Error::ConnectionReset.is_recoverable());
        assert!(Error::StalledByPeer.is_recoverable());
        assert!(!Error::TransferRejected.is_recoverable());
        assert!(!Error::UnknownMessageType(99).is_recoverable());
    }

    #[test]
    fn test_socket_error_mapping() {
        let peer: SocketAddr = "127.0.0.1:52550".parse().unwrap();
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            Error::from_socket(refused, peer),
            Error::ConnectionRefused(_)
        ));

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(Error::from_socket(reset, peer), Error::ConnectionReset));

        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(matches!(Error::from_socket(eof, peer), Error::PeerClosed));
    }
}
