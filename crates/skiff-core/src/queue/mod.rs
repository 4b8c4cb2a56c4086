//! The request queue and archive.
//!
//! Every framed message is enqueued on receipt and assigned the next id;
//! ids start at 1, increase strictly, and are never reused. When a
//! message's handler returns, the message moves to the archive with its
//! collected event log attached. A message is never in both places.
//!
//! The queue itself is not synchronized; the server owns one behind a lock
//! and is the only mutator.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::events::ServerEvent;
use crate::protocol::{MessageType, Payload};

/// A received message, from framing until archival.
#[derive(Debug, Clone)]
pub struct Message {
    /// Monotonic id assigned on receipt
    pub id: u32,
    /// Wire type
    pub message_type: MessageType,
    /// Full payload as framed (type code plus body, no length prefix)
    pub data: Vec<u8>,
    /// Decoded body
    pub payload: Payload,
    /// Source address of the connection the message arrived on
    pub remote_addr: SocketAddr,
    /// When the message was framed
    pub timestamp: SystemTime,
    /// Events collected while the handler ran; empty until archived
    pub event_log: Vec<ServerEvent>,
}

/// Ordered messages awaiting processing, plus the archive of processed
/// ones.
#[derive(Debug, Default)]
pub struct RequestQueue {
    next_id: u32,
    queue: VecDeque<Message>,
    archive: Vec<Message>,
}

impl RequestQueue {
    /// Create an empty queue. The first assigned id is 1.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            queue: VecDeque::new(),
            archive: Vec::new(),
        }
    }

    /// Append a freshly framed message and assign its id.
    pub fn enqueue(
        &mut self,
        message_type: MessageType,
        data: Vec<u8>,
        payload: Payload,
        remote_addr: SocketAddr,
    ) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(Message {
            id,
            message_type,
            data,
            payload,
            remote_addr,
            timestamp: SystemTime::now(),
            event_log: Vec::new(),
        });
        id
    }

    /// Remove and return the head of the queue.
    pub fn take_next(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    /// Remove and return the message with the given id.
    ///
    /// # Errors
    ///
    /// `AlreadyProcessed` if the id is archived, `InvalidRequestId` if it
    /// was never assigned to a queued message.
    pub fn take_by_id(&mut self, id: u32) -> Result<Message> {
        if let Some(pos) = self.queue.iter().position(|m| m.id == id) {
            if let Some(message) = self.queue.remove(pos) {
                return Ok(message);
            }
        }
        if self.archive.iter().any(|m| m.id == id) {
            return Err(Error::AlreadyProcessed(id));
        }
        Err(Error::InvalidRequestId(id))
    }

    /// Move a processed message into the archive with its event log.
    pub fn archive(&mut self, mut message: Message, event_log: Vec<ServerEvent>) {
        debug_assert!(self.queue.iter().all(|m| m.id != message.id));
        message.event_log = event_log;
        self.archive.push(message);
    }

    /// Number of messages awaiting processing.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of processed messages.
    pub fn archived_len(&self) -> usize {
        self.archive.len()
    }

    /// Ids currently awaiting processing, in queue order.
    pub fn queued_ids(&self) -> Vec<u32> {
        self.queue.iter().map(|m| m.id).collect()
    }

    /// The archived message with the given id, if any.
    pub fn archived(&self, id: u32) -> Option<&Message> {
        self.archive.iter().find(|m| m.id == id)
    }

    /// The most recently archived message, if any.
    pub fn last_archived(&self) -> Option<&Message> {
        self.archive.last()
    }
}
