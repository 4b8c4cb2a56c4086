//! Skiff wire protocol.
//!
//! Every logical message on the wire is one frame:
//!
//! ```text
//! ┌────────────┬──────────────────────────────────────┐
//! │   Length   │               Payload                │
//! │  4 bytes   │           (Length bytes)             │
//! ├────────────┼────────────┬─────────────────────────┤
//! │            │    Type    │      Body (typed)       │
//! │            │  4 bytes   │                         │
//! └────────────┴────────────┴─────────────────────────┘
//! ```
//!
//! All integers are little-endian. Strings are UTF-8 prefixed by a 4-byte
//! byte length (`str16` in the layout tables below). File sizes travel as
//! signed 64-bit values.
//!
//! Raw file bytes are NOT framed: after a transfer request is accepted, the
//! sender streams the file body on the same connection with no per-chunk
//! header, and the receiver reads exactly the announced size.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::file::FileEntry;

/// Maximum accepted payload size (16 MB). File bytes are unframed, so real
/// payloads stay tiny; anything near this limit is a corrupt stream.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Size of the length prefix and of the type code, in bytes.
pub const PREFIX_SIZE: usize = 4;

/// Message types in the Skiff protocol. Wire codes are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Plain text message
    TextMessage = 1,
    /// A file is about to be pushed to this server
    InboundFileTransferRequest = 2,
    /// The peer asks this server to send it a file
    OutboundFileTransferRequest = 3,
    /// The receiver accepted a pending file transfer
    FileTransferAccepted = 4,
    /// The receiver rejected a pending file transfer
    FileTransferRejected = 5,
    /// The receiver detected a stalled inbound transfer
    FileTransferStalled = 6,
    /// The peer asks the original sender to retry a stalled transfer
    RetryOutboundFileTransfer = 7,
    /// Request for a folder listing
    FileListRequest = 8,
    /// Folder listing response
    FileListResponse = 9,
    /// The requested folder holds no files
    NoFilesAvailableForDownload = 10,
    /// The requested folder does not exist
    RequestedFolderDoesNotExist = 11,
    /// Request for server metadata
    ServerInfoRequest = 12,
    /// Server metadata response
    ServerInfoResponse = 13,
    /// Orderly shutdown command (honored only from the server itself)
    ShutdownServerCommand = 14,
}

impl MessageType {
    /// Parse a message type from its wire code.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::TextMessage),
            2 => Some(Self::InboundFileTransferRequest),
            3 => Some(Self::OutboundFileTransferRequest),
            4 => Some(Self::FileTransferAccepted),
            5 => Some(Self::FileTransferRejected),
            6 => Some(Self::FileTransferStalled),
            7 => Some(Self::RetryOutboundFileTransfer),
            8 => Some(Self::FileListRequest),
            9 => Some(Self::FileListResponse),
            10 => Some(Self::NoFilesAvailableForDownload),
            11 => Some(Self::RequestedFolderDoesNotExist),
            12 => Some(Self::ServerInfoRequest),
            13 => Some(Self::ServerInfoResponse),
            14 => Some(Self::ShutdownServerCommand),
            _ => None,
        }
    }

    /// Whether the request pump must dispatch this message as soon as it is
    /// framed. Deferred types wait in the queue for explicit processing.
    pub const fn must_process_immediately(self) -> bool {
        !matches!(self, Self::TextMessage | Self::FileListRequest)
    }
}

/// The listener endpoint of the peer that sent a message, as carried in the
/// message body. This is where replies connect to, not the ephemeral source
/// port of the connection the message arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTo {
    /// IPv4 address text
    pub ip: String,
    /// Listener port
    pub port: u16,
}

impl ReplyTo {
    /// Build from an IP string and port.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// The socket address this endpoint names.
    ///
    /// # Errors
    ///
    /// Returns an error if the IP text does not parse.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .ip
            .parse()
            .map_err(|_| Error::MalformedPayload(format!("bad sender ip: {}", self.ip)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl std::fmt::Display for ReplyTo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// `str16 sender_ip, u32 sender_port, str16 text`
    Text {
        /// Sender listener endpoint
        sender: ReplyTo,
        /// Message text
        text: String,
    },
    /// `str16 local_path, i64 file_size, str16 sender_ip, u32 sender_port`
    ///
    /// `local_path` is the destination path on the RECEIVING server.
    InboundFileTransfer {
        /// Destination path on the receiver
        local_path: PathBuf,
        /// Announced file size in bytes
        file_size: u64,
        /// Sender listener endpoint
        sender: ReplyTo,
    },
    /// `str16 file_path, i64 file_size, str16 sender_ip, u32 sender_port,
    /// str16 remote_folder`
    ///
    /// `file_path` names a file on the server receiving this request;
    /// `remote_folder` is where the requestor wants it delivered.
    OutboundFileTransfer {
        /// Requested file on the responding server
        file_path: PathBuf,
        /// File size if the requestor knows it, zero otherwise
        file_size: u64,
        /// Requestor listener endpoint
        sender: ReplyTo,
        /// Destination folder on the requestor
        remote_folder: PathBuf,
    },
    /// `str16 sender_ip, u32 sender_port`
    FileTransferAccepted {
        /// Accepting server's listener endpoint
        sender: ReplyTo,
    },
    /// `str16 sender_ip, u32 sender_port`
    FileTransferRejected {
        /// Rejecting server's listener endpoint
        sender: ReplyTo,
    },
    /// `str16 sender_ip, u32 sender_port`
    FileTransferStalled {
        /// Stalled receiver's listener endpoint
        sender: ReplyTo,
    },
    /// `str16 sender_ip, u32 sender_port, str16 folder`
    RetryOutboundFileTransfer {
        /// Requestor listener endpoint
        sender: ReplyTo,
        /// Destination folder on the requestor
        folder: PathBuf,
    },
    /// `str16 sender_ip, u32 sender_port, str16 folder`
    FileListRequest {
        /// Requestor listener endpoint
        sender: ReplyTo,
        /// Folder to enumerate on the responding server
        folder: PathBuf,
    },
    /// `str16 sender_ip, u32 sender_port, str16 folder, str16 list`
    FileListResponse {
        /// Responder listener endpoint
        sender: ReplyTo,
        /// Folder that was enumerated
        folder: PathBuf,
        /// Listed files with sizes
        entries: Vec<FileEntry>,
    },
    /// `str16 sender_ip, u32 sender_port`
    NoFilesAvailableForDownload {
        /// Responder listener endpoint
        sender: ReplyTo,
    },
    /// `str16 sender_ip, u32 sender_port`
    RequestedFolderDoesNotExist {
        /// Responder listener endpoint
        sender: ReplyTo,
    },
    /// `str16 sender_ip, u32 sender_port`
    ServerInfoRequest {
        /// Requestor listener endpoint
        sender: ReplyTo,
    },
    /// `str16 local_ip, u32 port, str16 public_ip, str16 folder`
    ServerInfoResponse {
        /// Responder's LAN address
        local_ip: String,
        /// Responder's listener port
        port: u16,
        /// Responder's public address, empty if unknown
        public_ip: String,
        /// Responder's transfer folder
        folder: PathBuf,
    },
    /// `str16 sender_ip, u32 sender_port`
    ShutdownServerCommand {
        /// Sender listener endpoint; must name the server itself
        sender: ReplyTo,
    },
}

impl Payload {
    /// The wire type of this payload.
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Text { .. } => MessageType::TextMessage,
            Self::InboundFileTransfer { .. } => MessageType::InboundFileTransferRequest,
            Self::OutboundFileTransfer { .. } => MessageType::OutboundFileTransferRequest,
            Self::FileTransferAccepted { .. } => MessageType::FileTransferAccepted,
            Self::FileTransferRejected { .. } => MessageType::FileTransferRejected,
            Self::FileTransferStalled { .. } => MessageType::FileTransferStalled,
            Self::RetryOutboundFileTransfer { .. } => MessageType::RetryOutboundFileTransfer,
            Self::FileListRequest { .. } => MessageType::FileListRequest,
            Self::FileListResponse { .. } => MessageType::FileListResponse,
            Self::NoFilesAvailableForDownload { .. } => MessageType::NoFilesAvailableForDownload,
            Self::RequestedFolderDoesNotExist { .. } => MessageType::RequestedFolderDoesNotExist,
            Self::ServerInfoRequest { .. } => MessageType::ServerInfoRequest,
            Self::ServerInfoResponse { .. } => MessageType::ServerInfoResponse,
            Self::ShutdownServerCommand { .. } => MessageType::ShutdownServerCommand,
        }
    }

    /// The `ReplyTo` endpoint carried in the body, if the type has one.
    pub const fn reply_to(&self) -> Option<&ReplyTo> {
        match self {
            Self::Text { sender, .. }
            | Self::InboundFileTransfer { sender, .. }
            | Self::OutboundFileTransfer { sender, .. }
            | Self::FileTransferAccepted { sender }
            | Self::FileTransferRejected { sender }
            | Self::FileTransferStalled { sender }
            | Self::RetryOutboundFileTransfer { sender, .. }
            | Self::FileListRequest { sender, .. }
            | Self::FileListResponse { sender, .. }
            | Self::NoFilesAvailableForDownload { sender }
            | Self::RequestedFolderDoesNotExist { sender }
            | Self::ServerInfoRequest { sender }
            | Self::ShutdownServerCommand { sender } => Some(sender),
            Self::ServerInfoResponse { .. } => None,
        }
    }
}

/// Incremental writer for little-endian payload fields.
struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    fn new(message_type: MessageType) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&(message_type as u32).to_le_bytes());
        Self { buf }
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn put_path(&mut self, value: &std::path::Path) {
        self.put_str(&value.to_string_lossy());
    }

    fn put_reply_to(&mut self, endpoint: &ReplyTo) {
        self.put_str(&endpoint.ip);
        self.put_u32(u32::from(endpoint.port));
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Incremental reader for little-endian payload fields.
struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len());
        let Some(end) = end else {
            return Err(Error::MalformedPayload(format!(
                "field overruns payload: need {n} bytes at offset {}",
                self.pos
            )));
        };
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn file_size(&mut self) -> Result<u64> {
        let value = self.i64()?;
        u64::try_from(value)
            .map_err(|_| Error::MalformedPayload(format!("negative file size: {value}")))
    }

    fn str16(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::MalformedPayload("string field is not UTF-8".to_string()))
    }

    fn path(&mut self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.str16()?))
    }

    fn port(&mut self) -> Result<u16> {
        let value = self.u32()?;
        u16::try_from(value)
            .map_err(|_| Error::MalformedPayload(format!("port out of range: {value}")))
    }

    fn reply_to(&mut self) -> Result<ReplyTo> {
        let ip = self.str16()?;
        let port = self.port()?;
        Ok(ReplyTo { ip, port })
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(Error::MalformedPayload(format!(
                "{} trailing bytes after last field",
                self.data.len() - self.pos
            )))
        }
    }
}

/// Encode a payload into its body bytes: type code followed by fields.
pub fn encode_payload(payload: &Payload) -> Vec<u8> {
    let mut w = FieldWriter::new(payload.message_type());
    match payload {
        Payload::Text { sender, text } => {
            w.put_reply_to(sender);
            w.put_str(text);
        }
        Payload::InboundFileTransfer {
            local_path,
            file_size,
            sender,
        } => {
            w.put_path(local_path);
            w.put_i64(*file_size as i64);
            w.put_reply_to(sender);
        }
        Payload::OutboundFileTransfer {
            file_path,
            file_size,
            sender,
            remote_folder,
        } => {
            w.put_path(file_path);
            w.put_i64(*file_size as i64);
            w.put_reply_to(sender);
            w.put_path(remote_folder);
        }
        Payload::FileTransferAccepted { sender }
        | Payload::FileTransferRejected { sender }
        | Payload::FileTransferStalled { sender }
        | Payload::NoFilesAvailableForDownload { sender }
        | Payload::RequestedFolderDoesNotExist { sender }
        | Payload::ServerInfoRequest { sender }
        | Payload::ShutdownServerCommand { sender } => {
            w.put_reply_to(sender);
        }
        Payload::RetryOutboundFileTransfer { sender, folder }
        | Payload::FileListRequest { sender, folder } => {
            w.put_reply_to(sender);
            w.put_path(folder);
        }
        Payload::FileListResponse {
            sender,
            folder,
            entries,
        } => {
            w.put_reply_to(sender);
            w.put_path(folder);
            w.put_str(&crate::file::encode_file_list(entries));
        }
        Payload::ServerInfoResponse {
            local_ip,
            port,
            public_ip,
            folder,
        } => {
            w.put_str(local_ip);
            w.put_u32(u32::from(*port));
            w.put_str(public_ip);
            w.put_path(folder);
        }
    }
    w.finish()
}

/// Decode a message body (type code plus fields) into a typed payload.
///
/// # Errors
///
/// Returns `UnknownMessageType` for a code outside the enum and
/// `MalformedPayload` when a field does not decode as declared.
pub fn decode_payload(data: &[u8]) -> Result<Payload> {
    let mut r = FieldReader::new(data);
    let code = r
        .u32()
        .map_err(|_| Error::MalformedPayload("payload shorter than type code".to_string()))?;
    let message_type = MessageType::from_code(code).ok_or(Error::UnknownMessageType(code))?;

    let payload = match message_type {
        MessageType::TextMessage => {
            let sender = r.reply_to()?;
            let text = r.str16()?;
            Payload::Text { sender, text }
        }
        MessageType::InboundFileTransferRequest => {
            let local_path = r.path()?;
            let file_size = r.file_size()?;
            let sender = r.reply_to()?;
            Payload::InboundFileTransfer {
                local_path,
                file_size,
                sender,
            }
        }
        MessageType::OutboundFileTransferRequest => {
            let file_path = r.path()?;
            let file_size = r.file_size()?;
            let sender = r.reply_to()?;
            let remote_folder = r.path()?;
            Payload::OutboundFileTransfer {
                file_path,
                file_size,
                sender,
                remote_folder,
            }
        }
        MessageType::FileTransferAccepted => Payload::FileTransferAccepted {
            sender: r.reply_to()?,
        },
        MessageType::FileTransferRejected => Payload::FileTransferRejected {
            sender: r.reply_to()?,
        },
        MessageType::FileTransferStalled => Payload::FileTransferStalled {
            sender: r.reply_to()?,
        },
        MessageType::RetryOutboundFileTransfer => {
            let sender = r.reply_to()?;
            let folder = r.path()?;
            Payload::RetryOutboundFileTransfer { sender, folder }
        }
        MessageType::FileListRequest => {
            let sender = r.reply_to()?;
            let folder = r.path()?;
            Payload::FileListRequest { sender, folder }
        }
        MessageType::FileListResponse => {
            let sender = r.reply_to()?;
            let folder = r.path()?;
            let list = r.str16()?;
            let entries = crate::file::decode_file_list(&list)?;
            Payload::FileListResponse {
                sender,
                folder,
                entries,
            }
        }
        MessageType::NoFilesAvailableForDownload => Payload::NoFilesAvailableForDownload {
            sender: r.reply_to()?,
        },
        MessageType::RequestedFolderDoesNotExist => Payload::RequestedFolderDoesNotExist {
            sender: r.reply_to()?,
        },
        MessageType::ServerInfoRequest => Payload::ServerInfoRequest {
            sender: r.reply_to()?,
        },
        MessageType::ServerInfoResponse => {
            let local_ip = r.str16()?;
            let port = r.port()?;
            let public_ip = r.str16()?;
            let folder = r.path()?;
            Payload::ServerInfoResponse {
                local_ip,
                port,
                public_ip,
                folder,
            }
        }
        MessageType::ShutdownServerCommand => Payload::ShutdownServerCommand {
            sender: r.reply_to()?,
        },
    };

    r.expect_end()?;
    Ok(payload)
}

/// Encode a payload into a complete frame: length prefix plus body.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_frame(payload: &Payload) -> Vec<u8> {
    let body = encode_payload(payload);
    let mut frame = Vec::with_capacity(PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ReplyTo {
        ReplyTo::new("192.168.1.12", 52550)
    }

    fn all_payloads() -> Vec<Payload> {
        vec![
            Payload::Text {
                sender: endpoint(),
                text: "hello".to_string(),
            },
            Payload::InboundFileTransfer {
                local_path: PathBuf::from("/tmp/in/a.bin"),
                file_size: 3,
                sender: endpoint(),
            },
            Payload::OutboundFileTransfer {
                file_path: PathBuf::from("/srv/files/report.pdf"),
                file_size: 0,
                sender: endpoint(),
                remote_folder: PathBuf::from("/tmp/in"),
            },
            Payload::FileTransferAccepted { sender: endpoint() },
            Payload::FileTransferRejected { sender: endpoint() },
            Payload::FileTransferStalled { sender: endpoint() },
            Payload::RetryOutboundFileTransfer {
                sender: endpoint(),
                folder: PathBuf::from("/tmp/in"),
            },
            Payload::FileListRequest {
                sender: endpoint(),
                folder: PathBuf::from("/srv/files"),
            },
            Payload::FileListResponse {
                sender: endpoint(),
                folder: PathBuf::from("/srv/files"),
                entries: vec![
                    FileEntry::new("/srv/files/a.txt", 12),
                    FileEntry::new("/srv/files/b.bin", 4096),
                ],
            },
            Payload::NoFilesAvailableForDownload { sender: endpoint() },
            Payload::RequestedFolderDoesNotExist { sender: endpoint() },
            Payload::ServerInfoRequest { sender: endpoint() },
            Payload::ServerInfoResponse {
                local_ip: "192.168.1.12".to_string(),
                port: 52550,
                public_ip: "203.0.113.9".to_string(),
                folder: PathBuf::from("/srv/files"),
            },
            Payload::ShutdownServerCommand { sender: endpoint() },
        ]
    }

    #[test]
    fn test_roundtrip_every_type() {
        for payload in all_payloads() {
            let body = encode_payload(&payload);
            let decoded = decode_payload(&body).expect("decode");
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn test_wire_codes_stable() {
        assert_eq!(MessageType::TextMessage as u32, 1);
        assert_eq!(MessageType::InboundFileTransferRequest as u32, 2);
        assert_eq!(MessageType::OutboundFileTransferRequest as u32, 3);
        assert_eq!(MessageType::FileTransferAccepted as u32, 4);
        assert_eq!(MessageType::FileTransferRejected as u32, 5);
        assert_eq!(MessageType::FileTransferStalled as u32, 6);
        assert_eq!(MessageType::RetryOutboundFileTransfer as u32, 7);
        assert_eq!(MessageType::FileListRequest as u32, 8);
        assert_eq!(MessageType::FileListResponse as u32, 9);
        assert_eq!(MessageType::NoFilesAvailableForDownload as u32, 10);
        assert_eq!(MessageType::RequestedFolderDoesNotExist as u32, 11);
        assert_eq!(MessageType::ServerInfoRequest as u32, 12);
        assert_eq!(MessageType::ServerInfoResponse as u32, 13);
        assert_eq!(MessageType::ShutdownServerCommand as u32, 14);

        for code in 1..=14 {
            assert_eq!(MessageType::from_code(code).unwrap() as u32, code);
        }
        assert!(MessageType::from_code(0).is_none());
        assert!(MessageType::from_code(15).is_none());
    }

    #[test]
    fn test_frame_layout() {
        let payload = Payload::Text {
            sender: endpoint(),
            text: "hi".to_string(),
        };
        let frame = encode_frame(&payload);
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - PREFIX_SIZE);

        let code = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        assert_eq!(code, MessageType::TextMessage as u32);
    }

    #[test]
    fn test_str16_layout() {
        // str16 = u32 byte length || utf8 bytes, little-endian
        let payload = Payload::ServerInfoRequest {
            sender: ReplyTo::new("10.0.0.1", 9000),
        };
        let body = encode_payload(&payload);
        let ip_len = u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
        assert_eq!(ip_len, 8);
        assert_eq!(&body[8..16], b"10.0.0.1");
        let port = u32::from_le_bytes([body[16], body[17], body[18], body[19]]);
        assert_eq!(port, 9000);
    }

    #[test]
    fn test_unknown_type_code() {
        let mut body = Vec::new();
        body.extend_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            decode_payload(&body),
            Err(Error::UnknownMessageType(99))
        ));
    }

    #[test]
    fn test_short_field_is_malformed() {
        let payload = Payload::Text {
            sender: endpoint(),
            text: "hello".to_string(),
        };
        let body = encode_payload(&payload);
        assert!(matches!(
            decode_payload(&body[..body.len() - 2]),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let payload = Payload::ServerInfoRequest { sender: endpoint() };
        let mut body = encode_payload(&payload);
        body.push(0);
        assert!(matches!(
            decode_payload(&body),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_negative_file_size_rejected() {
        let mut w = Vec::new();
        w.extend_from_slice(&(MessageType::InboundFileTransferRequest as u32).to_le_bytes());
        w.extend_from_slice(&4u32.to_le_bytes());
        w.extend_from_slice(b"/a/b");
        w.extend_from_slice(&(-1i64).to_le_bytes());
        assert!(matches!(
            decode_payload(&w),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_immediate_flags() {
        assert!(!MessageType::TextMessage.must_process_immediately());
        assert!(!MessageType::FileListRequest.must_process_immediately());
        assert!(MessageType::InboundFileTransferRequest.must_process_immediately());
        assert!(MessageType::FileTransferAccepted.must_process_immediately());
        assert!(MessageType::ServerInfoResponse.must_process_immediately());
        assert!(MessageType::ShutdownServerCommand.must_process_immediately());
    }
}
