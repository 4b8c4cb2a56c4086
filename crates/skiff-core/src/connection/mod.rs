//! Peer connections: socket I/O with per-call deadlines and frame decoding
//! with a carry buffer.
//!
//! A socket read may return more or fewer bytes than the current framing
//! boundary needs. Whatever a read returns beyond the boundary is parked in
//! the `unread` carry buffer and consumed, strictly before any fresh socket
//! read, by the next decode step. After a complete frame is decoded the
//! carry buffer is either empty or holds the verbatim head of whatever
//! follows on the stream: the next frame, or the leading bytes of a file
//! body that the sender coalesced with its transfer request.
//!
//! Every socket call maps failures into the typed set in [`crate::error`]:
//! deadline overruns become `Timeout`, a zero-byte read at a frame boundary
//! becomes `PeerClosed`, and a close mid-frame becomes `TruncatedLength` or
//! `TruncatedPayload`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::protocol::{self, MessageType, Payload, MAX_PAYLOAD_SIZE, PREFIX_SIZE};

/// Socket parameters shared by every connection a server opens or accepts.
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    /// Read size and carry-buffer bound
    pub buffer_size: usize,
    /// Deadline for connect calls
    pub connect_timeout: Duration,
    /// Deadline for each send call
    pub send_timeout: Duration,
    /// Deadline for each receive call
    pub receive_timeout: Duration,
}

impl From<&ServerConfig> for SocketConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            connect_timeout: config.connect_timeout,
            send_timeout: config.send_timeout,
            receive_timeout: config.receive_timeout,
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            connect_timeout: Duration::from_millis(crate::DEFAULT_SOCKET_TIMEOUT_MS),
            send_timeout: Duration::from_millis(crate::DEFAULT_SOCKET_TIMEOUT_MS),
            receive_timeout: Duration::from_millis(crate::DEFAULT_SOCKET_TIMEOUT_MS),
        }
    }
}

/// One framed message as read off the wire.
///
/// `data` is the full payload as framed: the type code followed by the
/// body, without the 4-byte length prefix.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded wire type
    pub message_type: MessageType,
    /// Full payload bytes
    pub data: Vec<u8>,
}

impl Frame {
    /// Decode the typed body.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` when a field does not decode as declared.
    pub fn payload(&self) -> Result<Payload> {
        protocol::decode_payload(&self.data)
    }
}

/// A connection to a peer with framing state.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: S,
    peer_addr: SocketAddr,
    unread: VecDeque<u8>,
    config: SocketConfig,
}

impl Connection<TcpStream> {
    /// Open a connection to a peer within the connect deadline.
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `ConnectionRefused`, or an I/O error.
    pub async fn open(peer: SocketAddr, config: SocketConfig) -> Result<Self> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(peer))
            .await?
            .map_err(|e| Error::from_socket(e, peer))?;
        crate::net::configure_tcp_keepalive(&stream)?;
        Ok(Self::new(stream, peer, config))
    }

    /// Wrap a socket accepted by the listener.
    pub fn accepted(stream: TcpStream, peer: SocketAddr, config: SocketConfig) -> Self {
        if let Err(e) = crate::net::configure_tcp_keepalive(&stream) {
            tracing::debug!("could not enable keep-alive for {peer}: {e}");
        }
        Self::new(stream, peer, config)
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an arbitrary byte stream. Used directly by tests; production
    /// code goes through [`Connection::open`] / [`Connection::accepted`].
    pub fn new(stream: S, peer_addr: SocketAddr, config: SocketConfig) -> Self {
        Self {
            stream,
            peer_addr,
            unread: VecDeque::new(),
            config,
        }
    }

    /// The remote endpoint of this connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Bytes currently parked in the carry buffer. Inspection only; the
    /// framing and chunk reads manage the buffer themselves. Tests use it
    /// to pin the carry invariants.
    pub fn unread_len(&self) -> usize {
        self.unread.len()
    }

    /// Take every carried byte out of the buffer.
    ///
    /// The receive pipeline calls this before its first fresh socket read:
    /// when the sender coalesced the transfer request with the head of the
    /// file body, those bytes are already here and belong in the file.
    pub fn take_unread(&mut self) -> Vec<u8> {
        self.unread.drain(..).collect()
    }

    /// Read one complete frame.
    ///
    /// # Errors
    ///
    /// `PeerClosed` on a clean close at a frame boundary, `TruncatedLength`
    /// / `TruncatedPayload` on a close mid-frame, `Timeout` when a read
    /// misses its deadline, and `UnknownMessageType` for a foreign type
    /// code.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let prefix = self.collect(PREFIX_SIZE, Boundary::LengthPrefix).await?;
        let length = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

        if length < PREFIX_SIZE || length > MAX_PAYLOAD_SIZE {
            return Err(Error::MalformedPayload(format!(
                "implausible frame length: {length}"
            )));
        }

        let data = self.collect(length, Boundary::Payload).await?;
        let code = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let message_type =
            MessageType::from_code(code).ok_or(Error::UnknownMessageType(code))?;

        Ok(Frame { message_type, data })
    }

    /// Encode and send one frame within the send deadline.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or a mapped socket error.
    pub async fn write_frame(&mut self, payload: &Payload) -> Result<()> {
        let frame = protocol::encode_frame(payload);
        self.send_all(&frame).await
    }

    /// Send an entire buffer, looping past partial writes, within the send
    /// deadline.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or a mapped socket error.
    pub async fn send_all(&mut self, buf: &[u8]) -> Result<()> {
        timeout(self.config.send_timeout, async {
            self.stream
                .write_all(buf)
                .await
                .map_err(|e| Error::from_socket(e, self.peer_addr))?;
            self.stream
                .flush()
                .await
                .map_err(|e| Error::from_socket(e, self.peer_addr))
        })
        .await?
    }

    /// Read up to `buf.len()` raw bytes, draining the carry buffer first.
    ///
    /// Used by the receive pipeline for the unframed file body.
    ///
    /// # Errors
    ///
    /// Returns `PeerClosed` when the stream ends, `Timeout` when the read
    /// misses its deadline.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.unread.is_empty() {
            let n = self.unread.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.unread.pop_front().unwrap_or_default();
            }
            return Ok(n);
        }

        let n = timeout(self.config.receive_timeout, self.stream.read(buf))
            .await?
            .map_err(|e| Error::from_socket(e, self.peer_addr))?;
        if n == 0 {
            return Err(Error::PeerClosed);
        }
        Ok(n)
    }

    /// Like [`Connection::read_chunk`] but without a per-call deadline.
    ///
    /// The receive pipeline supplies its own deadline: the stall monitor
    /// decides when a quiet stream counts as dead, which may be longer or
    /// shorter than the socket receive timeout.
    ///
    /// # Errors
    ///
    /// Returns `PeerClosed` when the stream ends.
    pub async fn read_chunk_no_deadline(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.unread.is_empty() {
            let n = self.unread.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.unread.pop_front().unwrap_or_default();
            }
            return Ok(n);
        }

        let n = self
            .stream
            .read(buf)
            .await
            .map_err(|e| Error::from_socket(e, self.peer_addr))?;
        if n == 0 {
            return Err(Error::PeerClosed);
        }
        Ok(n)
    }

    /// Read exactly `n` raw bytes. Used for the completion handshake.
    ///
    /// # Errors
    ///
    /// Returns `PeerClosed` / `TruncatedPayload` / `Timeout` as
    /// [`Connection::read_frame`] does.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        self.collect(n, Boundary::Payload).await
    }

    /// Collect exactly `need` bytes: drain the carry buffer first, then
    /// append socket reads, parking any excess back in the carry buffer.
    async fn collect(&mut self, need: usize, boundary: Boundary) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(need);

        while out.len() < need {
            if self.unread.is_empty() {
                let got = self.fill().await?;
                if got == 0 {
                    return Err(boundary.closed_early(out.len(), need));
                }
            }
            let take = self.unread.len().min(need - out.len());
            out.extend(self.unread.drain(..take));
        }

        Ok(out)
    }

    /// One socket read into the carry buffer. The buffer is always empty
    /// here, so it never grows past `buffer_size`.
    async fn fill(&mut self) -> Result<usize> {
        debug_assert!(self.unread.is_empty());
        let mut buf = vec![0u8; self.config.buffer_size];
        let n = timeout(self.config.receive_timeout, self.stream.read(&mut buf))
            .await?
            .map_err(|e| Error::from_socket(e, self.peer_addr))?;
        self.unread.extend(&buf[..n]);
        Ok(n)
    }
}

/// Which framing boundary a close-mid-read violated.
#[derive(Clone, Copy)]
enum Boundary {
    LengthPrefix,
    Payload,
}

impl Boundary {
    fn closed_early(self, received: usize, expected: usize) -> Error {
        match self {
            Self::LengthPrefix if received == 0 => Error::PeerClosed,
            Self::LengthPrefix => Error::TruncatedLength(received),
            Self::Payload => Error::TruncatedPayload { received, expected },
        }
    }
}

async fn timeout<F: std::future::Future>(duration: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Error::Timeout(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReplyTo;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:52550".parse().unwrap()
    }

    fn small_config() -> SocketConfig {
        SocketConfig {
            buffer_size: 64,
            ..SocketConfig::default()
        }
    }

    fn text_payload(text: &str) -> Payload {
        Payload::Text {
            sender: ReplyTo::new("127.0.0.1", 52550),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_single_frame_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = Connection::new(client, test_addr(), small_config());
        let mut reader = Connection::new(server, test_addr(), small_config());

        let payload = text_payload("hello");
        writer.write_frame(&payload).await.unwrap();

        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.message_type, MessageType::TextMessage);
        assert_eq!(frame.payload().unwrap(), payload);
        assert_eq!(reader.unread_len(), 0);
    }

    #[tokio::test]
    async fn test_stream_associativity() {
        // Decoding N frames then one more from the carry buffer equals
        // decoding all N+1 in one pass, however the bytes arrive.
        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let mut reader = Connection::new(server, test_addr(), small_config());

        let payloads: Vec<Payload> = (0..5)
            .map(|i| text_payload(&format!("message number {i}")))
            .collect();

        let mut wire = Vec::new();
        for p in &payloads {
            wire.extend_from_slice(&protocol::encode_frame(p));
        }
        client.write_all(&wire).await.unwrap();
        drop(client);

        for expected in &payloads {
            let frame = reader.read_frame().await.unwrap();
            assert_eq!(&frame.payload().unwrap(), expected);
        }
        assert_eq!(reader.unread_len(), 0);
        assert!(matches!(reader.read_frame().await, Err(Error::PeerClosed)));
    }

    #[tokio::test]
    async fn test_carry_holds_head_of_file_body() {
        // A sender may coalesce the transfer request with the first file
        // bytes; after the frame decodes, the carry buffer holds them.
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = Connection::new(server, test_addr(), small_config());

        let request = Payload::InboundFileTransfer {
            local_path: "/tmp/in/a.bin".into(),
            file_size: 3,
            sender: ReplyTo::new("127.0.0.1", 52550),
        };
        let mut wire = protocol::encode_frame(&request);
        wire.extend_from_slice(&[0x01, 0x02, 0x03]);
        client.write_all(&wire).await.unwrap();

        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.message_type, MessageType::InboundFileTransferRequest);
        assert_eq!(reader.take_unread(), vec![0x01, 0x02, 0x03]);
        assert_eq!(reader.unread_len(), 0);
    }

    #[tokio::test]
    async fn test_payload_filling_first_read_leaves_no_carry() {
        // Length prefix plus payload exactly fill one read buffer.
        let config = small_config();
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = Connection::new(server, test_addr(), config);

        let body_len = config.buffer_size - PREFIX_SIZE;
        let mut body = Vec::with_capacity(body_len);
        body.extend_from_slice(&(MessageType::TextMessage as u32).to_le_bytes());
        let sender = ReplyTo::new("1.2.3.4", 1);
        // sender ip (4 + 7) + port (4) + text length prefix (4)
        let text_len = body_len - body.len() - 4 - 7 - 4 - 4;
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(sender.ip.as_bytes());
        body.extend_from_slice(&u32::from(sender.port).to_le_bytes());
        body.extend_from_slice(&(u32::try_from(text_len).unwrap()).to_le_bytes());
        body.extend(std::iter::repeat(b'x').take(text_len));
        assert_eq!(body.len(), body_len);

        let mut wire = Vec::new();
        wire.extend_from_slice(&(u32::try_from(body_len).unwrap()).to_le_bytes());
        wire.extend_from_slice(&body);
        client.write_all(&wire).await.unwrap();

        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.data.len(), body_len);
        assert_eq!(reader.unread_len(), 0);
    }

    #[tokio::test]
    async fn test_truncated_length_prefix() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = Connection::new(server, test_addr(), small_config());

        client.write_all(&[0x10, 0x00]).await.unwrap();
        drop(client);

        assert!(matches!(
            reader.read_frame().await,
            Err(Error::TruncatedLength(2))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = Connection::new(server, test_addr(), small_config());

        let frame = protocol::encode_frame(&text_payload("this will be cut short"));
        client.write_all(&frame[..frame.len() - 5]).await.unwrap();
        drop(client);

        assert!(matches!(
            reader.read_frame().await,
            Err(Error::TruncatedPayload { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_code() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = Connection::new(server, test_addr(), small_config());

        let mut wire = Vec::new();
        wire.extend_from_slice(&4u32.to_le_bytes());
        wire.extend_from_slice(&999u32.to_le_bytes());
        client.write_all(&wire).await.unwrap();

        assert!(matches!(
            reader.read_frame().await,
            Err(Error::UnknownMessageType(999))
        ));
    }

    #[tokio::test]
    async fn test_read_chunk_drains_carry_first() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = Connection::new(server, test_addr(), small_config());

        let mut wire = protocol::encode_frame(&text_payload("hi"));
        wire.extend_from_slice(b"FILEBYTES");
        client.write_all(&wire).await.unwrap();

        reader.read_frame().await.unwrap();
        assert_eq!(reader.unread_len(), 9);

        let mut buf = [0u8; 4];
        let n = reader.read_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"FILE");

        let mut rest = [0u8; 16];
        let n = reader.read_chunk(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b"BYTES");
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let config = SocketConfig {
            receive_timeout: Duration::from_millis(50),
            ..small_config()
        };
        let (_client, server) = tokio::io::duplex(4096);
        let mut reader = Connection::new(server, test_addr(), config);

        assert!(matches!(reader.read_frame().await, Err(Error::Timeout(50))));
    }

    #[tokio::test]
    async fn test_carry_never_exceeds_buffer_size() {
        let config = small_config();
        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let mut reader = Connection::new(server, test_addr(), config);

        let mut wire = protocol::encode_frame(&text_payload("tiny"));
        wire.extend(std::iter::repeat(0xABu8).take(4 * config.buffer_size));
        client.write_all(&wire).await.unwrap();

        reader.read_frame().await.unwrap();
        assert!(reader.unread_len() <= config.buffer_size);
    }
}
