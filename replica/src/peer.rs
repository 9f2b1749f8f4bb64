use std::collections::{BTreeMap, HashMap};

use log::warn;

use replica_serde::{ByteWriter, Marker, Serde, UnsignedVariableInteger};

use crate::{
    carrier::{Carrier, Priority, Reliability},
    config::DebugConfig,
    send_allowance::SendAllowance,
    types::{ConnectionId, PeerId, PeerKey, PeerMode, ReplicaId, CMD_HEARTBEAT, INVALID_PEER_ID},
};

/// An outgoing buffer with its frame header slots reserved up front
pub(crate) struct OutBuffer {
    writer: ByteWriter,
    checksum: Option<Marker>,
    timestamp: Marker,
}

impl OutBuffer {
    fn new() -> Self {
        let mut writer = ByteWriter::new();
        let (checksum, timestamp) = Self::reserve_header(&mut writer);
        Self {
            writer,
            checksum,
            timestamp,
        }
    }

    fn reserve_header(writer: &mut ByteWriter) -> (Option<Marker>, Marker) {
        let checksum = if FRAME_CHECKSUM {
            Some(writer.insert_marker())
        } else {
            None
        };
        (checksum, writer.insert_marker())
    }

    pub(crate) fn reset(&mut self) {
        self.writer.clear();
        let (checksum, timestamp) = Self::reserve_header(&mut self.writer);
        self.checksum = checksum;
        self.timestamp = timestamp;
    }

    pub(crate) fn writer(&mut self) -> &mut ByteWriter {
        &mut self.writer
    }

    /// Bytes written after the frame header
    pub(crate) fn payload_len(&self) -> usize {
        self.writer.len() - self.timestamp.end()
    }

    pub(crate) fn has_data(&self) -> bool {
        self.payload_len() > 0
    }

    fn total_len(&self) -> usize {
        self.writer.len()
    }

    /// Fill in the header and return the finished frame
    fn finalize(&mut self, timestamp: u32) -> &[u8] {
        self.writer.patch_u32(self.timestamp, timestamp);
        if let Some(checksum) = self.checksum {
            let crc = frame_checksum(&self.writer.as_slice()[checksum.end()..]);
            self.writer.patch_u32(checksum, crc);
        }
        self.writer.as_slice()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "msg_checksum")] {
        pub(crate) const FRAME_CHECKSUM: bool = true;

        pub(crate) fn frame_checksum(bytes: &[u8]) -> u32 {
            crc32c::crc32c(bytes)
        }
    } else {
        pub(crate) const FRAME_CHECKSUM: bool = false;

        pub(crate) fn frame_checksum(_bytes: &[u8]) -> u32 {
            0
        }
    }
}

/// A remote endpoint as seen by the replica manager, or the local peer
pub struct ReplicaPeer {
    key: PeerKey,
    peer_id: PeerId,
    connection: Option<ConnectionId>,
    mode: PeerMode,
    is_new: bool,
    is_accepted: bool,
    is_sync_host: bool,
    is_orphan: bool,
    pub(crate) removal_scheduled: bool,
    // replica -> insertion order, and the reverse for ordered iteration
    objects: HashMap<ReplicaId, u64>,
    object_order: BTreeMap<u64, ReplicaId>,
    next_order: u64,
    pub(crate) reliable: OutBuffer,
    pub(crate) unreliable: OutBuffer,
    pub(crate) allowance: SendAllowance,
    pub(crate) ticks_since_receive: u32,
}

impl ReplicaPeer {
    pub(crate) fn new(key: PeerKey, connection: Option<ConnectionId>, mode: PeerMode) -> Self {
        Self {
            key,
            peer_id: INVALID_PEER_ID,
            connection,
            mode,
            is_new: false,
            is_accepted: false,
            is_sync_host: false,
            is_orphan: false,
            removal_scheduled: false,
            objects: HashMap::new(),
            object_order: BTreeMap::new(),
            next_order: 0,
            reliable: OutBuffer::new(),
            unreliable: OutBuffer::new(),
            allowance: SendAllowance::new(),
            ticks_since_receive: 0,
        }
    }

    pub(crate) fn new_local(peer_id: PeerId) -> Self {
        let mut peer = Self::new(PeerKey::LOCAL, None, PeerMode::Client);
        peer.peer_id = peer_id;
        peer
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn id(&self) -> PeerId {
        self.peer_id
    }

    pub(crate) fn set_id(&mut self, peer_id: PeerId) {
        self.peer_id = peer_id;
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn mode(&self) -> PeerMode {
        self.mode
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub(crate) fn set_new(&mut self, is_new: bool) {
        self.is_new = is_new;
    }

    pub fn is_accepted(&self) -> bool {
        self.is_accepted
    }

    pub fn is_sync_host(&self) -> bool {
        self.is_sync_host
    }

    pub(crate) fn set_sync_host(&mut self, is_sync_host: bool) {
        self.is_sync_host = is_sync_host;
    }

    pub fn is_orphan(&self) -> bool {
        self.is_orphan
    }

    /// Lose the connection but keep the replica records
    pub(crate) fn make_orphan(&mut self) {
        self.is_orphan = true;
        self.connection = None;
        self.reliable.reset();
        self.unreliable.reset();
    }

    /// Has a live connection
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn accept(&mut self) {
        self.is_new = true;
        self.is_accepted = true;
    }

    // Objects

    pub(crate) fn add(&mut self, id: ReplicaId) {
        if self.objects.contains_key(&id) {
            return;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.objects.insert(id, order);
        self.object_order.insert(order, id);
    }

    /// Returns false if the replica was not held by this peer
    pub(crate) fn remove(&mut self, id: ReplicaId) -> bool {
        let Some(order) = self.objects.remove(&id) else {
            return false;
        };
        self.object_order.remove(&order);
        true
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Held replicas in the order they were added
    pub fn objects(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.object_order.values().copied()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn has_objects(&self) -> bool {
        !self.objects.is_empty()
    }

    pub(crate) fn clear_objects(&mut self) {
        self.objects.clear();
        self.object_order.clear();
    }

    // Sending

    /// Bytes waiting in both buffers, headers excluded
    pub(crate) fn pending_bytes(&self) -> usize {
        self.reliable.payload_len() + self.unreliable.payload_len()
    }

    pub(crate) fn has_pending_data(&self) -> bool {
        self.reliable.has_data() || self.unreliable.has_data()
    }

    /// Stamp and send whatever is buffered, then reset both buffers
    pub(crate) fn send_buffer(
        &mut self,
        carrier: &mut dyn Carrier,
        channel: u8,
        timestamp: u32,
        debug: &DebugConfig,
    ) {
        let Some(connection) = self.connection else {
            self.reliable.reset();
            self.unreliable.reset();
            return;
        };

        if debug.send_heartbeats {
            let buffer = if self.reliable.has_data() {
                &mut self.reliable
            } else {
                &mut self.unreliable
            };
            UnsignedVariableInteger::from(CMD_HEARTBEAT).ser(buffer.writer());
        }

        if self.reliable.has_data() {
            let frame = self.reliable.finalize(timestamp);
            carrier.send_with_callback(
                frame,
                None,
                connection,
                Reliability::Reliable,
                Priority::Normal,
                channel,
            );
        }

        if self.unreliable.has_data() {
            let mtu = carrier.message_mtu();
            if self.unreliable.total_len() > mtu {
                warn!(
                    "Unreliable payload of {} bytes to peer {} exceeds the carrier MTU of {}",
                    self.unreliable.total_len(),
                    self.peer_id,
                    mtu
                );
            }
            let frame = self.unreliable.finalize(timestamp);
            carrier.send_with_callback(
                frame,
                None,
                connection,
                Reliability::Unreliable,
                Priority::Normal,
                channel,
            );
        }

        self.reliable.reset();
        self.unreliable.reset();
    }
}
