use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::types::{ConnectionId, PeerMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// `num_bytes` were copied into the buffer
    Ok,
    /// Nothing queued for this connection
    NoMessage,
    /// The next message needs `num_bytes`; it stays queued
    InsufficientBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveResult {
    pub num_bytes: usize,
    pub state: ReceiveState,
}

impl ReceiveResult {
    pub fn ok(num_bytes: usize) -> Self {
        Self {
            num_bytes,
            state: ReceiveState::Ok,
        }
    }

    pub fn no_message() -> Self {
        Self {
            num_bytes: 0,
            state: ReceiveState::NoMessage,
        }
    }

    pub fn insufficient_buffer(needed: usize) -> Self {
        Self {
            num_bytes: needed,
            state: ReceiveState::InsufficientBuffer,
        }
    }
}

/// Invoked by the carrier once a reliable send is acknowledged
pub type AckCallback = Box<dyn FnOnce() + Send>;

/// The transport the replica manager sends through. Implementations own
/// fragmentation, reliability and congestion control; the manager only
/// hands over whole buffers.
pub trait Carrier: Send {
    /// Copy the next queued message from `connection` into `buffer`
    fn receive(&mut self, buffer: &mut [u8], connection: ConnectionId, channel: u8) -> ReceiveResult;

    fn send_with_callback(
        &mut self,
        data: &[u8],
        callback: Option<AckCallback>,
        connection: ConnectionId,
        reliability: Reliability,
        priority: Priority,
        channel: u8,
    );

    fn send(&mut self, data: &[u8], connection: ConnectionId, reliability: Reliability, channel: u8) {
        self.send_with_callback(data, None, connection, reliability, Priority::Normal, channel);
    }

    /// Largest message the carrier sends without fragmenting
    fn message_mtu(&self) -> usize;

    /// Minimum interval between sends, in milliseconds
    fn max_send_rate(&self) -> u32;

    /// Session network time, in milliseconds
    fn time(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        connection: ConnectionId,
        mode: PeerMode,
    },
    Disconnected {
        connection: ConnectionId,
    },
}

/// Thread-safe queue for connection notifications raised outside the tick
/// thread. The manager drains it at the start of every `unmarshal()`.
#[derive(Clone, Default)]
pub struct ConnectionEvents {
    queue: Arc<Mutex<VecDeque<ConnectionEvent>>>,
}

impl ConnectionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_connected(&self, connection: ConnectionId, mode: PeerMode) {
        self.queue
            .lock()
            .push_back(ConnectionEvent::Connected { connection, mode });
    }

    pub fn push_disconnected(&self, connection: ConnectionId) {
        self.queue
            .lock()
            .push_back(ConnectionEvent::Disconnected { connection });
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn drain(&self) -> Vec<ConnectionEvent> {
        let mut queue = self.queue.lock();
        queue.drain(..).collect()
    }
}
