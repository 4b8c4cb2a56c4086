//! Server events.
//!
//! Everything observable that happens inside the engine is described by one
//! tagged [`EventKind`]. Events flow to two sinks: the event log of the
//! request being processed (so a log can be sliced per request) and a
//! broadcast channel for observers. Fields are plain values; observers
//! never need the engine's internal types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use tokio::sync::broadcast;

use crate::file::FileEntry;
use crate::protocol::MessageType;

/// Capacity of the observer channel; slow observers lose oldest events.
const OBSERVER_CHANNEL_CAPACITY: usize = 256;

/// One observable event.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    /// When the event was generated
    pub timestamp: SystemTime,
    /// Id of the request being processed when this was emitted, if any
    pub request_id: Option<u32>,
    /// What happened
    pub kind: EventKind,
}

/// What happened. Field bags are sparse: each variant carries only what
/// that event type uses.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// The listener is bound and accepting connections
    ServerStartedListening { local_addr: SocketAddr },
    /// The accept loop has exited
    ServerStoppedListening,
    /// A peer connected to the listener
    ConnectionAccepted { remote_addr: SocketAddr },
    /// A framed message was read and assigned an id
    ReceivedMessage {
        id: u32,
        message_type: MessageType,
        remote_addr: SocketAddr,
    },
    /// A deferred message is waiting for explicit processing
    QueuedMessage { id: u32, message_type: MessageType },
    /// A handler started for a request
    ProcessingRequestStarted { id: u32, message_type: MessageType },
    /// The handler for a request returned
    ProcessingRequestComplete { id: u32 },

    /// A text message arrived
    ReceivedTextMessage {
        text: String,
        remote_ip: String,
        remote_port: u16,
    },
    /// A text message was sent to a peer
    SentTextMessage { remote_addr: SocketAddr },

    /// A peer announced it will push a file to this server
    ReceivedInboundFileTransferRequest {
        local_path: PathBuf,
        file_size: u64,
        remote_ip: String,
        remote_port: u16,
    },
    /// A peer asked this server to send it a file
    ReceivedOutboundFileTransferRequest {
        file_path: PathBuf,
        remote_ip: String,
        remote_port: u16,
    },
    /// This server told the sender to go ahead
    AcceptedInboundFileTransfer { remote_addr: SocketAddr },
    /// This server refused a push because the file already exists
    RejectedInboundFileTransfer { remote_addr: SocketAddr },
    /// The peer accepted a transfer this server offered
    ClientAcceptedFileTransfer { remote_addr: SocketAddr },
    /// The peer rejected a transfer this server offered
    ClientRejectedFileTransfer { remote_addr: SocketAddr },

    /// The receive loop is about to drain the byte stream
    ReceiveFileBytesStarted {
        local_path: PathBuf,
        file_size: u64,
    },
    /// One socket read of file bytes (emitted for small files only)
    ReceivedFileBytesFromSocket {
        bytes_received: usize,
        total_received: u64,
        file_size: u64,
    },
    /// Transfer progressed past the reporting interval
    UpdateFileTransferProgress { percent_complete: f64 },
    /// The byte stream drained completely
    ReceiveFileBytesComplete {
        local_path: PathBuf,
        file_size: u64,
    },
    /// The send loop is about to stream the file
    SendFileBytesStarted {
        file_path: PathBuf,
        file_size: u64,
        remote_addr: SocketAddr,
    },
    /// The file streamed completely
    SendFileBytesComplete {
        file_path: PathBuf,
        file_size: u64,
    },
    /// The completion handshake arrived intact
    ReceivedConfirmationMessage,
    /// The completion handshake was sent to the sender
    SentConfirmationMessage,

    /// No bytes arrived within the stall timeout
    FileTransferStalled { bytes_received: u64, file_size: u64 },
    /// This server told the sender the transfer stalled
    SentStalledNotification { remote_addr: SocketAddr },
    /// The peer reported the transfer this server is streaming stalled
    OutboundTransferStalledByPeer { remote_ip: String, remote_port: u16 },
    /// A peer asked for a stalled transfer to be re-sent
    ReceivedRetryRequest { remote_ip: String, remote_port: u16 },

    /// A folder listing arrived
    ReceivedFileList {
        folder: PathBuf,
        entries: Vec<FileEntry>,
        remote_ip: String,
        remote_port: u16,
    },
    /// The peer has no files in the requested folder
    ReceivedNotificationNoFilesToDownload { remote_ip: String },
    /// The requested folder does not exist on the peer
    ReceivedNotificationFolderDoesNotExist { remote_ip: String },
    /// Peer metadata arrived
    ReceivedServerInfo {
        local_ip: String,
        port: u16,
        public_ip: String,
        transfer_folder: PathBuf,
    },
    /// A shutdown command was honored
    ShutdownRequested,

    /// A handler or pipeline failed; the pump keeps running
    ErrorOccurred { message: String },
}

/// Shared event sink: broadcasts to observers and collects the log of the
/// request currently being processed.
#[derive(Debug)]
pub struct EventBus {
    observers: broadcast::Sender<ServerEvent>,
    active: Mutex<Option<ActiveRequest>>,
}

#[derive(Debug)]
struct ActiveRequest {
    id: u32,
    log: Vec<ServerEvent>,
}

impl EventBus {
    /// Create an event bus with the default observer capacity.
    pub fn new() -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CHANNEL_CAPACITY);
        Self {
            observers,
            active: Mutex::new(None),
        }
    }

    /// Subscribe to the observer channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.observers.subscribe()
    }

    /// Mark `id` as the request currently being processed. Events emitted
    /// until [`EventBus::end_request`] are tagged with it and collected.
    pub fn begin_request(&self, id: u32) {
        let mut active = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *active = Some(ActiveRequest {
            id,
            log: Vec::new(),
        });
    }

    /// Close out the active request and take its collected log.
    pub fn end_request(&self) -> Vec<ServerEvent> {
        let mut active = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        active.take().map(|a| a.log).unwrap_or_default()
    }

    /// Emit an event to the observers and, when a request is active, into
    /// its log.
    pub fn emit(&self, kind: EventKind) {
        let mut active = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let event = ServerEvent {
            timestamp: SystemTime::now(),
            request_id: active.as_ref().map(|a| a.id),
            kind,
        };
        if let Some(a) = active.as_mut() {
            a.log.push(event.clone());
        }
        drop(active);
        // Nobody listening is fine.
        let _ = self.observers.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
