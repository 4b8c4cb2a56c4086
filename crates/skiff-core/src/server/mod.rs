//! The Skiff server: listener, request pump, dispatcher, and operations.
//!
//! One server is both sides of the protocol. Its pump accepts one peer at a
//! time, frames a single message off the wire, enqueues it, and either
//! dispatches it immediately or leaves it queued for explicit processing.
//! The operations API is the other half of the symmetry: it opens outbound
//! connections to send text, push files, request files, and ask for
//! metadata, then waits for the answers the pump collects.
//!
//! A handler failure never stops the pump; it is reported on the event
//! channel and the peer socket is closed. Only accept-loop failures and an
//! honored shutdown command end [`Server::run`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot, watch};

use crate::config::ServerConfig;
use crate::connection::{Connection, SocketConfig};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind, ServerEvent};
use crate::file::FileEntry;
use crate::protocol::{Payload, ReplyTo};
use crate::queue::{Message, RequestQueue};
use crate::transfer::{self, TransferProgress, TransferSettings, TransferState};

/// Identity of a peer (or of this server).
///
/// `session_ip` is whichever address was observed on the last accepted
/// connection; `local_ip` and `public_ip` are learned through metadata
/// exchange and may lag behind reality.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Display name, empty until learned
    pub name: String,
    /// Source address of the most recently accepted connection
    pub session_ip: Option<IpAddr>,
    /// LAN address the peer reports for itself
    pub local_ip: Option<IpAddr>,
    /// Public address the peer reports for itself
    pub public_ip: Option<IpAddr>,
    /// Listener port
    pub port: u16,
    /// Transfer folder path on the peer
    pub transfer_folder: PathBuf,
}

impl PartialEq for ServerInfo {
    /// Two peers are the same server when their session address and port
    /// match; the learned fields are advisory.
    fn eq(&self, other: &Self) -> bool {
        self.session_ip == other.session_ip && self.port == other.port
    }
}

/// Cross-task state flags.
///
/// Each flag is read and written with compare-exchange semantics so the
/// stall monitor and the pipelines can signal each other while the pump is
/// suspended in a handler. `inbound_stalled` is shared with the stall
/// monitor task and therefore reference-counted.
#[derive(Debug)]
pub struct ServerFlags {
    /// The server has bound its listener
    pub initialized: AtomicBool,
    /// The accept loop is running
    pub listening: AtomicBool,
    /// No request handler is currently active
    pub idle: AtomicBool,
    /// A file transfer is in flight, either direction
    pub transfer_in_progress: AtomicBool,
    /// The inbound byte stream made no progress within the stall timeout
    pub inbound_stalled: Arc<AtomicBool>,
    /// The peer reported that the transfer this server streams stalled
    pub outbound_stalled: AtomicBool,
    /// A shutdown command was honored; the pump is exiting
    pub shutdown_initiated: AtomicBool,
    /// A retry of the previous outbound transfer is in flight
    pub retry_previous_transfer: AtomicBool,
    /// The last file-list request found no files
    pub no_files_available: AtomicBool,
    /// The last file-list request named a missing folder
    pub requested_folder_missing: AtomicBool,
}

impl Default for ServerFlags {
    fn default() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            idle: AtomicBool::new(true),
            transfer_in_progress: AtomicBool::new(false),
            inbound_stalled: Arc::new(AtomicBool::new(false)),
            outbound_stalled: AtomicBool::new(false),
            shutdown_initiated: AtomicBool::new(false),
            retry_previous_transfer: AtomicBool::new(false),
            no_files_available: AtomicBool::new(false),
            requested_folder_missing: AtomicBool::new(false),
        }
    }
}

/// Scratch fields for the transfer in flight. Reset at the start of each
/// inbound or outbound transfer.
#[derive(Debug, Default)]
struct ServerState {
    incoming_file_path: Option<PathBuf>,
    incoming_file_size: u64,
    outgoing_file_path: Option<PathBuf>,
    outgoing_file_size: u64,
    last_bytes_received: u64,
    last_bytes_sent: u64,
}

/// The peer's answer to an offered transfer.
#[derive(Debug)]
enum TransferResponse {
    Accepted(SocketAddr),
    Rejected(SocketAddr),
}

/// The peer's answer to a file-list request.
#[derive(Debug)]
enum FileListReply {
    Entries(Vec<FileEntry>),
    NoFilesAvailable,
    FolderDoesNotExist,
}

/// Callers blocked on a peer response, fired by the pump when the matching
/// message arrives.
#[derive(Debug, Default)]
struct PendingReplies {
    transfer_response: Option<oneshot::Sender<TransferResponse>>,
    server_info: Option<oneshot::Sender<ServerInfo>>,
    file_list: Option<oneshot::Sender<FileListReply>>,
}

/// A peer-to-peer file transfer server.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    socket_config: SocketConfig,
    transfer_settings: TransferSettings,
    local_ip: Ipv4Addr,
    port: u16,
    listener: Mutex<Option<TcpListener>>,
    flags: ServerFlags,
    state: Mutex<ServerState>,
    queue: Mutex<RequestQueue>,
    events: EventBus,
    remote_info: Mutex<Option<ServerInfo>>,
    pending: Mutex<PendingReplies>,
    progress_tx: watch::Sender<TransferProgress>,
    progress_rx: watch::Receiver<TransferProgress>,
    shutdown_tx: broadcast::Sender<()>,
    weak_self: Weak<Self>,
}

impl Server {
    /// Bind the listener and prepare a server.
    ///
    /// The listener is bound here, not in [`Server::run`], so the actual
    /// port is known immediately even when the configured port is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the transfer folder
    /// cannot be created.
    pub async fn bind(config: ServerConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let port = listener.local_addr()?.port();
        let local_ip = crate::net::local_ipv4(config.local_network_cidr.as_deref());

        tokio::fs::create_dir_all(&config.transfer_folder).await?;

        let socket_config = SocketConfig::from(&config);
        let transfer_settings = TransferSettings::from(&config);
        let (progress_tx, progress_rx) = watch::channel(TransferProgress::idle());
        let (shutdown_tx, _) = broadcast::channel(1);

        let flags = ServerFlags::default();
        flags.initialized.store(true, Ordering::SeqCst);

        tracing::info!("server '{}' bound on {local_ip}:{port}", config.name);

        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            socket_config,
            transfer_settings,
            local_ip,
            port,
            listener: Mutex::new(Some(listener)),
            flags,
            state: Mutex::new(ServerState::default()),
            queue: Mutex::new(RequestQueue::new()),
            events: EventBus::new(),
            remote_info: Mutex::new(None),
            pending: Mutex::new(PendingReplies::default()),
            progress_tx,
            progress_rx,
            shutdown_tx,
            weak_self: weak_self.clone(),
        }))
    }

    /// The port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The local IPv4 address this server reports to peers.
    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// The address peers should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.local_ip), self.port)
    }

    /// The folder this server serves from and receives into.
    pub fn transfer_folder(&self) -> &Path {
        &self.config.transfer_folder
    }

    /// Cross-task state flags.
    pub fn flags(&self) -> &ServerFlags {
        &self.flags
    }

    /// Subscribe to the observer event channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// A receiver for transfer progress snapshots.
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress_rx.clone()
    }

    /// Identity of the most recently seen peer.
    pub fn remote_server_info(&self) -> Option<ServerInfo> {
        self.remote_info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of requests awaiting processing.
    pub fn queued_request_count(&self) -> usize {
        self.lock_queue().queued_len()
    }

    /// Number of processed requests.
    pub fn archived_request_count(&self) -> usize {
        self.lock_queue().archived_len()
    }

    /// Ids awaiting processing, in receipt order.
    pub fn queued_request_ids(&self) -> Vec<u32> {
        self.lock_queue().queued_ids()
    }

    /// The event log collected while the given request was processed.
    pub fn archived_event_log(&self, id: u32) -> Option<Vec<ServerEvent>> {
        self.lock_queue().archived(id).map(|m| m.event_log.clone())
    }

    /// The most recently archived request.
    pub fn last_archived_request(&self) -> Option<Message> {
        self.lock_queue().last_archived().cloned()
    }

    // ------------------------------------------------------------------
    // Request pump
    // ------------------------------------------------------------------

    /// Run the accept loop until a shutdown command is honored or the
    /// listener fails.
    ///
    /// # Errors
    ///
    /// Returns listener failures; handler failures are reported as
    /// `ErrorOccurred` events and do not end the loop.
    pub async fn run(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Config("server is already running".to_string()))?;

        self.flags.listening.store(true, Ordering::SeqCst);
        self.events.emit(EventKind::ServerStartedListening {
            local_addr: listener.local_addr()?,
        });
        tracing::info!("listening on port {}", self.port);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let result = loop {
            if self.flags.shutdown_initiated.load(Ordering::SeqCst) {
                break Ok(());
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break Ok(()),
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        // Accept-loop failures are fatal.
                        Err(e) => break Err(Error::Io(e)),
                    };
                    self.events.emit(EventKind::ConnectionAccepted { remote_addr });
                    tracing::debug!("connection accepted from {remote_addr}");

                    let mut conn =
                        Connection::accepted(stream, remote_addr, self.socket_config);
                    if let Err(e) = self.pump_one(&mut conn).await {
                        self.events.emit(EventKind::ErrorOccurred {
                            message: e.to_string(),
                        });
                        tracing::warn!("request from {remote_addr} failed: {e}");
                    }
                    // The peer socket closes here on every path.
                }
            }
        };

        self.flags.listening.store(false, Ordering::SeqCst);
        self.events.emit(EventKind::ServerStoppedListening);
        tracing::info!("stopped listening");
        result
    }

    /// Frame one message off an accepted connection, enqueue it, and
    /// dispatch it when its type demands immediate processing.
    async fn pump_one(&self, conn: &mut Connection) -> Result<()> {
        let frame = conn.read_frame().await?;
        let payload = frame.payload()?;
        let message_type = frame.message_type;
        let remote_addr = conn.peer_addr();

        self.note_session(remote_addr, payload.reply_to());

        let id = self
            .lock_queue()
            .enqueue(message_type, frame.data, payload, remote_addr);
        self.events.emit(EventKind::ReceivedMessage {
            id,
            message_type,
            remote_addr,
        });
        tracing::debug!("received {message_type:?} from {remote_addr} as request {id}");

        if message_type.must_process_immediately() {
            self.process_queued(id, Some(conn)).await
        } else {
            self.events.emit(EventKind::QueuedMessage { id, message_type });
            Ok(())
        }
    }

    /// Process the request at the head of the queue, if any.
    ///
    /// # Errors
    ///
    /// `PumpBusy` while another handler is active; otherwise the handler's
    /// own result.
    pub async fn process_next_request(&self) -> Result<Option<u32>> {
        self.claim_idle()?;
        let Some(message) = self.lock_queue().take_next() else {
            self.flags.idle.store(true, Ordering::SeqCst);
            return Ok(None);
        };
        let id = message.id;
        let result = self.process_message(message, None).await;
        self.flags.idle.store(true, Ordering::SeqCst);
        result.map(|()| Some(id))
    }

    /// Process a specific queued request.
    ///
    /// # Errors
    ///
    /// `PumpBusy` while another handler is active, `AlreadyProcessed` for
    /// an archived id, `InvalidRequestId` for an unknown one.
    pub async fn process_request_by_id(&self, id: u32) -> Result<()> {
        self.process_queued(id, None).await
    }

    async fn process_queued(
        &self,
        id: u32,
        conn: Option<&mut Connection>,
    ) -> Result<()> {
        self.claim_idle()?;
        let message = match self.lock_queue().take_by_id(id) {
            Ok(message) => message,
            Err(e) => {
                self.flags.idle.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };
        let result = self.process_message(message, conn).await;
        self.flags.idle.store(true, Ordering::SeqCst);
        result
    }

    fn claim_idle(&self) -> Result<()> {
        self.flags
            .idle
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::PumpBusy)?;
        Ok(())
    }

    /// Run the dispatcher for a dequeued message and archive it with the
    /// events its handler generated.
    async fn process_message(
        &self,
        message: Message,
        conn: Option<&mut Connection>,
    ) -> Result<()> {
        self.events.begin_request(message.id);
        self.events.emit(EventKind::ProcessingRequestStarted {
            id: message.id,
            message_type: message.message_type,
        });

        let result = self.dispatch(&message, conn).await;

        if let Err(e) = &result {
            self.events.emit(EventKind::ErrorOccurred {
                message: e.to_string(),
            });
            tracing::warn!("handler for request {} failed: {e}", message.id);
        }
        self.events
            .emit(EventKind::ProcessingRequestComplete { id: message.id });

        let event_log = self.events.end_request();
        self.lock_queue().archive(message, event_log);
        result
    }

    /// Map a request to its handler.
    async fn dispatch(
        &self,
        message: &Message,
        conn: Option<&mut Connection>,
    ) -> Result<()> {
        match &message.payload {
            Payload::Text { sender, text } => {
                self.handle_text_message(sender, text);
                Ok(())
            }
            Payload::InboundFileTransfer {
                local_path,
                file_size,
                sender,
            } => {
                self.handle_inbound_file_transfer(local_path, *file_size, sender, conn)
                    .await
            }
            Payload::OutboundFileTransfer {
                file_path,
                sender,
                remote_folder,
                ..
            } => {
                self.handle_outbound_file_request(file_path, sender, remote_folder)
                    .await
            }
            Payload::FileTransferAccepted { sender } => self.handle_transfer_accepted(sender),
            Payload::FileTransferRejected { sender } => self.handle_transfer_rejected(sender),
            Payload::FileTransferStalled { sender } => self.handle_transfer_stalled(sender),
            Payload::RetryOutboundFileTransfer { sender, folder } => {
                self.handle_retry_request(sender, folder)
            }
            Payload::FileListRequest { sender, folder } => {
                self.handle_file_list_request(sender, folder).await
            }
            Payload::FileListResponse {
                sender,
                folder,
                entries,
            } => {
                self.handle_file_list_response(sender, folder, entries);
                Ok(())
            }
            Payload::NoFilesAvailableForDownload { sender } => {
                self.handle_no_files_available(sender);
                Ok(())
            }
            Payload::RequestedFolderDoesNotExist { sender } => {
                self.handle_folder_does_not_exist(sender);
                Ok(())
            }
            Payload::ServerInfoRequest { sender } => self.handle_server_info_request(sender).await,
            Payload::ServerInfoResponse {
                local_ip,
                port,
                public_ip,
                folder,
            } => {
                self.handle_server_info_response(
                    local_ip,
                    *port,
                    public_ip,
                    folder,
                    message.remote_addr,
                );
                Ok(())
            }
            Payload::ShutdownServerCommand { sender } => {
                self.handle_shutdown_command(sender);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    fn handle_text_message(&self, sender: &ReplyTo, text: &str) {
        tracing::info!("text message from {sender}: {text}");
        self.events.emit(EventKind::ReceivedTextMessage {
            text: text.to_string(),
            remote_ip: sender.ip.clone(),
            remote_port: sender.port,
        });
    }

    /// Receiver side of a push: reject when the file exists, otherwise
    /// accept and drain the byte stream from the request's own connection.
    async fn handle_inbound_file_transfer(
        &self,
        local_path: &Path,
        file_size: u64,
        sender: &ReplyTo,
        conn: Option<&mut Connection>,
    ) -> Result<()> {
        let Some(conn) = conn else {
            return Err(Error::InvalidInput(
                "an inbound file transfer must be processed on its originating connection"
                    .to_string(),
            ));
        };

        self.events.emit(EventKind::ReceivedInboundFileTransferRequest {
            local_path: local_path.to_path_buf(),
            file_size,
            remote_ip: sender.ip.clone(),
            remote_port: sender.port,
        });

        {
            let mut state = self.lock_state();
            state.incoming_file_path = Some(local_path.to_path_buf());
            state.incoming_file_size = file_size;
            state.last_bytes_received = 0;
        }

        let reply_addr = sender.socket_addr()?;

        if tokio::fs::try_exists(local_path).await? {
            tracing::info!(
                "rejecting transfer: {} already exists",
                local_path.display()
            );
            self.send_single_frame(
                reply_addr,
                &Payload::FileTransferRejected {
                    sender: self.reply_to(),
                },
            )
            .await?;
            self.events
                .emit(EventKind::RejectedInboundFileTransfer { remote_addr: reply_addr });
            return Ok(());
        }

        if self
            .flags
            .transfer_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("rejecting transfer: another transfer is in progress");
            self.send_single_frame(
                reply_addr,
                &Payload::FileTransferRejected {
                    sender: self.reply_to(),
                },
            )
            .await?;
            self.events
                .emit(EventKind::RejectedInboundFileTransfer { remote_addr: reply_addr });
            return Ok(());
        }

        self.flags.inbound_stalled.store(false, Ordering::SeqCst);

        let accepted = self
            .send_single_frame(
                reply_addr,
                &Payload::FileTransferAccepted {
                    sender: self.reply_to(),
                },
            )
            .await;
        if let Err(e) = accepted {
            self.flags.transfer_in_progress.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.events
            .emit(EventKind::AcceptedInboundFileTransfer { remote_addr: reply_addr });

        let received = transfer::receive_file(
            conn,
            local_path,
            file_size,
            &self.transfer_settings,
            Arc::clone(&self.flags.inbound_stalled),
            &self.flags.shutdown_initiated,
            &self.events,
            &self.progress_tx,
        )
        .await;
        self.flags.transfer_in_progress.store(false, Ordering::SeqCst);

        match received {
            Ok(()) => {
                conn.send_all(crate::CONFIRMATION_MESSAGE).await?;
                self.events.emit(EventKind::SentConfirmationMessage);
                self.lock_state().last_bytes_received = file_size;
                Ok(())
            }
            // Shutdown mid-receive: the pump closes the socket on return.
            Err(Error::Cancelled) => Ok(()),
            Err(Error::TransferStalled(ms)) => {
                self.send_single_frame(
                    reply_addr,
                    &Payload::FileTransferStalled {
                        sender: self.reply_to(),
                    },
                )
                .await?;
                self.events
                    .emit(EventKind::SentStalledNotification { remote_addr: reply_addr });
                Err(Error::TransferStalled(ms))
            }
            Err(e) => Err(e),
        }
    }

    /// Responder side of a requested download: start the push on its own
    /// task so the pump stays free to process the acceptance that the push
    /// will wait for.
    async fn handle_outbound_file_request(
        &self,
        file_path: &Path,
        sender: &ReplyTo,
        remote_folder: &Path,
    ) -> Result<()> {
        self.events.emit(EventKind::ReceivedOutboundFileTransferRequest {
            file_path: file_path.to_path_buf(),
            remote_ip: sender.ip.clone(),
            remote_port: sender.port,
        });

        if !tokio::fs::try_exists(file_path).await? {
            // Nothing goes back to the requestor; the failure is local.
            return Err(Error::FileNotFound(file_path.to_path_buf()));
        }

        let requestor = sender.socket_addr()?;
        let Some(server) = self.weak_self.upgrade() else {
            return Ok(());
        };
        let file_path = file_path.to_path_buf();
        let remote_folder = remote_folder.to_path_buf();
        tokio::spawn(async move {
            match server.send_file(requestor, &file_path, &remote_folder).await {
                Ok(()) | Err(Error::Cancelled) => {}
                Err(e) => {
                    server.events.emit(EventKind::ErrorOccurred {
                        message: format!(
                            "requested transfer of {} failed: {e}",
                            file_path.display()
                        ),
                    });
                    tracing::warn!("requested transfer of {} failed: {e}", file_path.display());
                }
            }
        });
        Ok(())
    }

    fn handle_transfer_accepted(&self, sender: &ReplyTo) -> Result<()> {
        let addr = sender.socket_addr()?;
        self.events
            .emit(EventKind::ClientAcceptedFileTransfer { remote_addr: addr });
        self.fire_transfer_response(TransferResponse::Accepted(addr));
        Ok(())
    }

    fn handle_transfer_rejected(&self, sender: &ReplyTo) -> Result<()> {
        let addr = sender.socket_addr()?;
        self.events
            .emit(EventKind::ClientRejectedFileTransfer { remote_addr: addr });
        // The remembered outgoing path survives a rejection; a later retry
        // or a new request supersedes it.
        self.fire_transfer_response(TransferResponse::Rejected(addr));
        Ok(())
    }

    fn handle_transfer_stalled(&self, sender: &ReplyTo) -> Result<()> {
        self.flags.outbound_stalled.store(true, Ordering::SeqCst);
        self.events.emit(EventKind::OutboundTransferStalledByPeer {
            remote_ip: sender.ip.clone(),
            remote_port: sender.port,
        });
        tracing::warn!("peer {sender} reported the outbound transfer stalled");
        Ok(())
    }

    /// Original-sender side of a retry: re-enter the send pipeline with the
    /// remembered outgoing path.
    fn handle_retry_request(&self, sender: &ReplyTo, folder: &Path) -> Result<()> {
        self.events.emit(EventKind::ReceivedRetryRequest {
            remote_ip: sender.ip.clone(),
            remote_port: sender.port,
        });

        let file_path = self
            .lock_state()
            .outgoing_file_path
            .clone()
            .ok_or(Error::NothingToRetry)?;
        let requestor = sender.socket_addr()?;
        let folder = folder.to_path_buf();

        self.flags.outbound_stalled.store(false, Ordering::SeqCst);
        self.flags
            .retry_previous_transfer
            .store(true, Ordering::SeqCst);

        let Some(server) = self.weak_self.upgrade() else {
            return Ok(());
        };
        tokio::spawn(async move {
            let result = server.send_file(requestor, &file_path, &folder).await;
            server
                .flags
                .retry_previous_transfer
                .store(false, Ordering::SeqCst);
            match result {
                Ok(()) | Err(Error::Cancelled) => {}
                Err(e) => {
                    server.events.emit(EventKind::ErrorOccurred {
                        message: format!("retry of {} failed: {e}", file_path.display()),
                    });
                    tracing::warn!("retry of {} failed: {e}", file_path.display());
                }
            }
        });
        Ok(())
    }

    async fn handle_file_list_request(&self, sender: &ReplyTo, folder: &Path) -> Result<()> {
        let reply_addr = sender.socket_addr()?;
        tracing::info!("file list of {} requested by {sender}", folder.display());

        let reply = if folder.is_dir() {
            let entries = crate::file::list_folder(folder).await?;
            if entries.is_empty() {
                Payload::NoFilesAvailableForDownload {
                    sender: self.reply_to(),
                }
            } else {
                Payload::FileListResponse {
                    sender: self.reply_to(),
                    folder: folder.to_path_buf(),
                    entries,
                }
            }
        } else {
            Payload::RequestedFolderDoesNotExist {
                sender: self.reply_to(),
            }
        };

        self.send_single_frame(reply_addr, &reply).await
    }

    fn handle_file_list_response(&self, sender: &ReplyTo, folder: &Path, entries: &[FileEntry]) {
        self.events.emit(EventKind::ReceivedFileList {
            folder: folder.to_path_buf(),
            entries: entries.to_vec(),
            remote_ip: sender.ip.clone(),
            remote_port: sender.port,
        });
        self.fire_file_list_reply(FileListReply::Entries(entries.to_vec()));
    }

    fn handle_no_files_available(&self, sender: &ReplyTo) {
        self.flags.no_files_available.store(true, Ordering::SeqCst);
        self.events
            .emit(EventKind::ReceivedNotificationNoFilesToDownload {
                remote_ip: sender.ip.clone(),
            });
        self.fire_file_list_reply(FileListReply::NoFilesAvailable);
    }

    fn handle_folder_does_not_exist(&self, sender: &ReplyTo) {
        self.flags
            .requested_folder_missing
            .store(true, Ordering::SeqCst);
        self.events
            .emit(EventKind::ReceivedNotificationFolderDoesNotExist {
                remote_ip: sender.ip.clone(),
            });
        self.fire_file_list_reply(FileListReply::FolderDoesNotExist);
    }

    async fn handle_server_info_request(&self, sender: &ReplyTo) -> Result<()> {
        let reply_addr = sender.socket_addr()?;
        let response = Payload::ServerInfoResponse {
            local_ip: self.local_ip.to_string(),
            port: self.port,
            public_ip: String::new(),
            folder: self.config.transfer_folder.clone(),
        };
        self.send_single_frame(reply_addr, &response).await
    }

    fn handle_server_info_response(
        &self,
        local_ip: &str,
        port: u16,
        public_ip: &str,
        folder: &Path,
        remote_addr: SocketAddr,
    ) {
        let info = ServerInfo {
            name: String::new(),
            session_ip: Some(remote_addr.ip()),
            local_ip: local_ip.parse().ok(),
            public_ip: public_ip.parse().ok(),
            port,
            transfer_folder: folder.to_path_buf(),
        };

        self.events.emit(EventKind::ReceivedServerInfo {
            local_ip: local_ip.to_string(),
            port,
            public_ip: public_ip.to_string(),
            transfer_folder: folder.to_path_buf(),
        });

        *self
            .remote_info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(info.clone());

        let waiter = self
            .lock_pending()
            .server_info
            .take();
        if let Some(tx) = waiter {
            let _ = tx.send(info);
        }
    }

    fn handle_shutdown_command(&self, sender: &ReplyTo) {
        if !self.is_self(sender) {
            tracing::warn!("ignoring shutdown command from {sender}");
            return;
        }
        self.flags.shutdown_initiated.store(true, Ordering::SeqCst);
        self.events.emit(EventKind::ShutdownRequested);
        tracing::info!("shutdown command accepted");
        let _ = self.shutdown_tx.send(());
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Resolve a peer given as `IP` or `IP:PORT` text, applying the
    /// default Skiff port when none is given. The other operations take
    /// the resolved address.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the text does not parse.
    pub fn resolve_peer(&self, host: &str) -> Result<SocketAddr> {
        crate::net::parse_host_address(host, crate::DEFAULT_PORT)
    }

    /// Send a text message to a peer.
    ///
    /// # Errors
    ///
    /// Returns connection and socket errors.
    pub async fn send_text_message(&self, peer: SocketAddr, text: &str) -> Result<()> {
        self.send_single_frame(
            peer,
            &Payload::Text {
                sender: self.reply_to(),
                text: text.to_string(),
            },
        )
        .await?;
        self.events
            .emit(EventKind::SentTextMessage { remote_addr: peer });
        Ok(())
    }

    /// Push a file to a peer's folder.
    ///
    /// Sends the transfer request and keeps the connection open: the file
    /// bytes follow on it once the peer's acceptance arrives (on a separate
    /// inbound connection), and the completion handshake comes back on it
    /// afterwards.
    ///
    /// # Errors
    ///
    /// `TransferRejected` when the peer refuses, `StalledByPeer` when the
    /// peer reports a stall mid-stream, `NoResponse` when no answer
    /// arrives, plus connection and socket errors.
    pub async fn send_file(
        &self,
        peer: SocketAddr,
        file_path: &Path,
        remote_folder: &Path,
    ) -> Result<()> {
        let metadata = tokio::fs::metadata(file_path)
            .await
            .map_err(|_| Error::FileNotFound(file_path.to_path_buf()))?;
        let file_size = metadata.len();

        let file_name = file_path
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("not a file path: {}", file_path.display())))?;
        let destination = remote_folder.join(file_name);

        self.flags
            .transfer_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::TransferInProgress)?;
        self.flags.outbound_stalled.store(false, Ordering::SeqCst);

        {
            let mut state = self.lock_state();
            state.outgoing_file_path = Some(file_path.to_path_buf());
            state.outgoing_file_size = file_size;
            state.last_bytes_sent = 0;
        }

        let result = self
            .send_file_inner(peer, file_path, &destination, file_size)
            .await;
        self.flags.transfer_in_progress.store(false, Ordering::SeqCst);

        if result.is_ok() {
            self.lock_state().last_bytes_sent = file_size;
        }
        result
    }

    async fn send_file_inner(
        &self,
        peer: SocketAddr,
        file_path: &Path,
        destination: &Path,
        file_size: u64,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.lock_pending().transfer_response = Some(tx);

        let mut conn = Connection::open(peer, self.socket_config).await?;
        conn.write_frame(&Payload::InboundFileTransfer {
            local_path: destination.to_path_buf(),
            file_size,
            sender: self.reply_to(),
        })
        .await?;
        tracing::info!(
            "offered {} ({file_size} bytes) to {peer}",
            file_path.display()
        );

        let _ = self.progress_tx.send(TransferProgress {
            state: TransferState::AwaitingResponse,
            bytes_transferred: 0,
            total_bytes: file_size,
        });

        let response = tokio::time::timeout(self.config.receive_timeout, rx)
            .await
            .map_err(|_| Error::NoResponse(peer))?
            .map_err(|_| Error::NoResponse(peer))?;

        match response {
            TransferResponse::Rejected(_) => {
                let _ = self.progress_tx.send(TransferProgress {
                    state: TransferState::Rejected,
                    bytes_transferred: 0,
                    total_bytes: file_size,
                });
                Err(Error::TransferRejected)
            }
            TransferResponse::Accepted(_) => {
                transfer::stream_file(
                    &mut conn,
                    file_path,
                    file_size,
                    &self.transfer_settings,
                    &self.flags.outbound_stalled,
                    &self.flags.shutdown_initiated,
                    &self.events,
                    &self.progress_tx,
                )
                .await?;

                let confirmation = conn.read_exact(crate::CONFIRMATION_MESSAGE.len()).await?;
                if confirmation != crate::CONFIRMATION_MESSAGE {
                    let _ = self.progress_tx.send(TransferProgress {
                        state: TransferState::Failed,
                        bytes_transferred: file_size,
                        total_bytes: file_size,
                    });
                    return Err(Error::UnexpectedConfirmation(confirmation));
                }
                self.events.emit(EventKind::ReceivedConfirmationMessage);
                let _ = self.progress_tx.send(TransferProgress {
                    state: TransferState::Completed,
                    bytes_transferred: file_size,
                    total_bytes: file_size,
                });
                tracing::info!("transfer of {} confirmed by peer", file_path.display());
                Ok(())
            }
        }
    }

    /// Ask a peer to send one of its files into `destination_folder` on
    /// this server.
    ///
    /// The transfer itself arrives through the pump as a normal inbound
    /// push; observe it on the event channel.
    ///
    /// # Errors
    ///
    /// Returns connection and socket errors from delivering the request.
    pub async fn request_file(
        &self,
        peer: SocketAddr,
        remote_file_path: &Path,
        destination_folder: &Path,
    ) -> Result<()> {
        self.send_single_frame(
            peer,
            &Payload::OutboundFileTransfer {
                file_path: remote_file_path.to_path_buf(),
                file_size: 0,
                sender: self.reply_to(),
                remote_folder: destination_folder.to_path_buf(),
            },
        )
        .await
    }

    /// Ask the peer that stalled an inbound transfer to re-send it into
    /// this server's transfer folder.
    ///
    /// # Errors
    ///
    /// Returns connection and socket errors.
    pub async fn retry_stalled_transfer(&self, peer: SocketAddr) -> Result<()> {
        self.flags.inbound_stalled.store(false, Ordering::SeqCst);
        self.send_single_frame(
            peer,
            &Payload::RetryOutboundFileTransfer {
                sender: self.reply_to(),
                folder: self.config.transfer_folder.clone(),
            },
        )
        .await
    }

    /// Request a folder listing from a peer and wait for the reply.
    ///
    /// # Errors
    ///
    /// `NoFilesAvailable` / `RemoteFolderMissing` reflect the peer's typed
    /// notifications (and set the matching flags); `NoResponse` when no
    /// reply arrives in time.
    pub async fn request_file_list(
        &self,
        peer: SocketAddr,
        folder: &Path,
    ) -> Result<Vec<FileEntry>> {
        self.flags.no_files_available.store(false, Ordering::SeqCst);
        self.flags
            .requested_folder_missing
            .store(false, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.lock_pending().file_list = Some(tx);

        self.send_single_frame(
            peer,
            &Payload::FileListRequest {
                sender: self.reply_to(),
                folder: folder.to_path_buf(),
            },
        )
        .await?;

        let reply = tokio::time::timeout(self.config.receive_timeout, rx)
            .await
            .map_err(|_| Error::NoResponse(peer))?
            .map_err(|_| Error::NoResponse(peer))?;

        match reply {
            FileListReply::Entries(entries) => Ok(entries),
            FileListReply::NoFilesAvailable => Err(Error::NoFilesAvailable),
            FileListReply::FolderDoesNotExist => Err(Error::RemoteFolderMissing),
        }
    }

    /// Request a peer's metadata and wait for the reply.
    ///
    /// # Errors
    ///
    /// `NoResponse` when no reply arrives in time, plus connection and
    /// socket errors.
    pub async fn request_server_info(&self, peer: SocketAddr) -> Result<ServerInfo> {
        let (tx, rx) = oneshot::channel();
        self.lock_pending().server_info = Some(tx);

        self.send_single_frame(
            peer,
            &Payload::ServerInfoRequest {
                sender: self.reply_to(),
            },
        )
        .await?;

        tokio::time::timeout(self.config.receive_timeout, rx)
            .await
            .map_err(|_| Error::NoResponse(peer))?
            .map_err(|_| Error::NoResponse(peer))
    }

    /// Ask this server to shut down, by sending the shutdown command to its
    /// own listener. The pump honors the command and [`Server::run`]
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns connection and socket errors.
    pub async fn shutdown(&self) -> Result<()> {
        let own = SocketAddr::from(([127, 0, 0, 1], self.port));
        self.send_single_frame(
            own,
            &Payload::ShutdownServerCommand {
                sender: ReplyTo::new("127.0.0.1", self.port),
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Open a connection to `peer`, send one frame, and close.
    async fn send_single_frame(&self, peer: SocketAddr, payload: &Payload) -> Result<()> {
        let mut conn = Connection::open(peer, self.socket_config).await?;
        conn.write_frame(payload).await
    }

    /// The endpoint peers should answer to, as carried in message bodies.
    fn reply_to(&self) -> ReplyTo {
        ReplyTo::new(self.local_ip.to_string(), self.port)
    }

    /// Whether a message body endpoint names this server.
    fn is_self(&self, sender: &ReplyTo) -> bool {
        if sender.port != self.port {
            return false;
        }
        match sender.ip.parse::<IpAddr>() {
            Ok(ip) => ip.is_loopback() || ip == IpAddr::V4(self.local_ip),
            Err(_) => false,
        }
    }

    /// Record the session identity of the active peer.
    fn note_session(&self, remote_addr: SocketAddr, reply_to: Option<&ReplyTo>) {
        let mut guard = self
            .remote_info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let info = guard.get_or_insert_with(ServerInfo::default);
        info.session_ip = Some(remote_addr.ip());
        if let Some(reply_to) = reply_to {
            info.port = reply_to.port;
            if info.local_ip.is_none() {
                info.local_ip = reply_to.ip.parse().ok();
            }
        }
    }

    fn fire_transfer_response(&self, response: TransferResponse) {
        let waiter = self.lock_pending().transfer_response.take();
        if let Some(tx) = waiter {
            let _ = tx.send(response);
        } else {
            tracing::debug!("transfer response arrived with no caller waiting");
        }
    }

    fn fire_file_list_reply(&self, reply: FileListReply) {
        let waiter = self.lock_pending().file_list.take();
        if let Some(tx) = waiter {
            let _ = tx.send(reply);
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, RequestQueue> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingReplies> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
