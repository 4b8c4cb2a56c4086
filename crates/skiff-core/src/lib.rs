//! # Skiff Core Library
//!
//! `skiff-core` is the request-processing engine of Skiff, a peer-to-peer
//! file transfer server. Two instances connect to each other symmetrically:
//! each accepts inbound connections, sends text messages, pushes files,
//! requests files, requests folder listings, exchanges server metadata, and
//! recovers from stalled transfers via an in-band retry signal.
//!
//! ## Modules
//!
//! - [`config`] - Server configuration (ports, folders, timeouts)
//! - [`connection`] - Socket I/O with deadlines and carry-buffer framing
//! - [`events`] - Tagged server events and the observer channel
//! - [`mod@file`] - Transfer-folder listing and the file-list wire text
//! - [`net`] - Address parsing and local IPv4 selection
//! - [`protocol`] - Wire message types and payload codecs
//! - [`queue`] - Request queue, archive, and per-request event logs
//! - [`server`] - The listener, request pump, dispatcher, and operations
//! - [`transfer`] - File send/receive pipelines and stall control
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use skiff_core::config::ServerConfig;
//! use skiff_core::server::Server;
//!
//! let server = Server::bind(ServerConfig::default()).await?;
//! let pump = tokio::spawn({
//!     let server = Arc::clone(&server);
//!     async move { server.run().await }
//! });
//! server.send_text_message("192.168.1.20:52550".parse()?, "hello").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod file;
pub mod net;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default listen port
pub const DEFAULT_PORT: u16 = 52550;

/// Default socket buffer size in bytes; also the transfer chunk size
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default per-call socket deadline
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 5000;

/// Default no-progress interval after which an inbound transfer is stalled
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 5000;

/// Default fraction of a file that must arrive between progress events (0.25%)
pub const DEFAULT_TRANSFER_UPDATE_INTERVAL: f64 = 0.0025;

/// Completion handshake sent raw (unframed) after a successful receive
pub const CONFIRMATION_MESSAGE: &[u8] = b"handshake";

/// Files no larger than this many buffers also emit a per-read debug event
pub const DEBUG_EVENT_BUFFER_MULTIPLE: u64 = 10;
