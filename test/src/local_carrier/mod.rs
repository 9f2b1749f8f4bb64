/// In-memory carrier for testing.
/// Routes buffers between managers in the same process, with a shared
/// clock the test advances by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::debug;
use replica::{
    AckCallback, Carrier, ConnectionId, Priority, ReceiveResult, Reliability,
};

pub const LOCAL_MTU: usize = 1200;

#[derive(Default)]
struct HubState {
    now: u32,
    next_connection: ConnectionId,
    // sending side -> receiving side
    routes: HashMap<ConnectionId, ConnectionId>,
    // receiving side -> queued buffers
    queues: HashMap<ConnectionId, VecDeque<Vec<u8>>>,
    sends: HashMap<ConnectionId, usize>,
    dropped: HashMap<ConnectionId, usize>,
}

/// Shared switchboard. Every `LocalCarrier` made from one hub can reach
/// every other through the links the hub creates.
#[derive(Clone, Default)]
pub struct LocalCarrierHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalCarrierHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn carrier(&self) -> Box<LocalCarrier> {
        Box::new(LocalCarrier {
            state: self.state.clone(),
            max_send_rate: 0,
        })
    }

    /// Carrier that refuses send intervals shorter than `max_send_rate` ms
    pub fn carrier_with_send_rate(&self, max_send_rate: u32) -> Box<LocalCarrier> {
        Box::new(LocalCarrier {
            state: self.state.clone(),
            max_send_rate,
        })
    }

    /// Create a two-way link. Returns the connection id each side uses.
    pub fn link(&self) -> (ConnectionId, ConnectionId) {
        let mut state = self.state.lock().unwrap();
        state.next_connection += 1;
        let a = state.next_connection;
        state.next_connection += 1;
        let b = state.next_connection;
        state.routes.insert(a, b);
        state.routes.insert(b, a);
        state.queues.entry(a).or_default();
        state.queues.entry(b).or_default();
        (a, b)
    }

    /// Cut a link in both directions. Anything in flight is lost.
    pub fn cut(&self, connection: ConnectionId) {
        let mut state = self.state.lock().unwrap();
        if let Some(other) = state.routes.remove(&connection) {
            state.routes.remove(&other);
            state.queues.remove(&other);
        }
        state.queues.remove(&connection);
    }

    pub fn advance(&self, ms: u32) {
        let mut state = self.state.lock().unwrap();
        state.now = state.now.wrapping_add(ms);
    }

    pub fn now(&self) -> u32 {
        self.state.lock().unwrap().now
    }

    /// Buffers sent from this side of a link
    pub fn sends_on(&self, connection: ConnectionId) -> usize {
        self.state
            .lock()
            .unwrap()
            .sends
            .get(&connection)
            .copied()
            .unwrap_or(0)
    }

    /// Buffers sent on a link that no longer exists
    pub fn dropped_on(&self, connection: ConnectionId) -> usize {
        self.state
            .lock()
            .unwrap()
            .dropped
            .get(&connection)
            .copied()
            .unwrap_or(0)
    }

    /// Buffers waiting to be received on this side of a link
    pub fn pending_on(&self, connection: ConnectionId) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(&connection)
            .map_or(0, |queue| queue.len())
    }

    /// Queue raw bytes as if the other side of the link had sent them
    pub fn inject(&self, connection: ConnectionId, bytes: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.queues.entry(connection).or_default().push_back(bytes);
    }
}

pub struct LocalCarrier {
    state: Arc<Mutex<HubState>>,
    max_send_rate: u32,
}

impl Carrier for LocalCarrier {
    fn receive(&mut self, buffer: &mut [u8], connection: ConnectionId, _channel: u8) -> ReceiveResult {
        let mut state = self.state.lock().unwrap();
        let Some(queue) = state.queues.get_mut(&connection) else {
            return ReceiveResult::no_message();
        };
        let Some(next) = queue.front() else {
            return ReceiveResult::no_message();
        };
        if next.len() > buffer.len() {
            return ReceiveResult::insufficient_buffer(next.len());
        }
        let Some(bytes) = queue.pop_front() else {
            return ReceiveResult::no_message();
        };
        buffer[..bytes.len()].copy_from_slice(&bytes);
        ReceiveResult::ok(bytes.len())
    }

    fn send_with_callback(
        &mut self,
        bytes: &[u8],
        callback: Option<AckCallback>,
        connection: ConnectionId,
        _reliability: Reliability,
        _priority: Priority,
        _channel: u8,
    ) {
        {
            let mut state = self.state.lock().unwrap();
            match state.routes.get(&connection).copied() {
                Some(receiver) => {
                    state
                        .queues
                        .entry(receiver)
                        .or_default()
                        .push_back(bytes.to_vec());
                    *state.sends.entry(connection).or_default() += 1;
                }
                None => {
                    debug!("LocalCarrier: dropped {} bytes on cut connection {}", bytes.len(), connection);
                    *state.dropped.entry(connection).or_default() += 1;
                    return;
                }
            }
        }
        // delivery is instant and lossless
        if let Some(callback) = callback {
            callback();
        }
    }

    fn message_mtu(&self) -> usize {
        LOCAL_MTU
    }

    fn max_send_rate(&self) -> u32 {
        self.max_send_rate
    }

    fn time(&self) -> u32 {
        self.state.lock().unwrap().now
    }
}
