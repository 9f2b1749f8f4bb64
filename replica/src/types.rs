/// Identifies a replica across every peer in the session
pub type ReplicaId = u32;
/// Identifies a peer across the session. Zero means "not yet greeted".
pub type PeerId = u32;
/// The carrier's handle for one connection
pub type ConnectionId = u32;
/// First id of a block of `REPIDS_PER_BLOCK` replica ids
pub type RepIdSeed = u32;

pub const INVALID_PEER_ID: PeerId = 0;
pub const INVALID_REPLICA_ID: ReplicaId = 0;

/// Number of replica ids in one block handed out by the sync host
pub const REPIDS_PER_BLOCK: u32 = 1024;

// Command headers. Everything below `CMD_COUNT` is a command.

pub const CMD_INVALID: u32 = 0;
pub const CMD_GREETINGS: u32 = 1;
pub const CMD_HEARTBEAT: u32 = 2;
pub const CMD_NEW_OWNER: u32 = 3;
pub const CMD_NEW_PROXY: u32 = 4;
pub const CMD_DESTROY_PROXY: u32 = 5;
pub const CMD_SUSPEND_UPSTREAM: u32 = 6;
pub const CMD_ACK_UPSTREAM_SUSPENDED: u32 = 7;
pub const CMD_HAND_OFF: u32 = 8;
pub const CMD_ACK_DOWNSTREAM: u32 = 9;
pub const CMD_REQUEST_ID_BLOCK: u32 = 10;
pub const CMD_GRANT_ID_BLOCK: u32 = 11;
pub const CMD_PEER_LOST: u32 = 12;
pub const CMD_COUNT: u32 = 13;

/// Reserved id of the session info system object
pub const REPLICA_ID_SESSION_INFO: ReplicaId = CMD_COUNT;

/// Headers below this value are commands or system objects; the first id
/// block starts here.
pub const MAX_RESERVED_CMD_OR_ID: u32 = 32;

/// Local handle for a peer record. Stable for the lifetime of the record,
/// unlike `PeerId` which is only known after the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(u32);

impl PeerKey {
    /// The local peer
    pub const LOCAL: PeerKey = PeerKey(0);

    pub(crate) fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn is_local(&self) -> bool {
        *self == Self::LOCAL
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// How a remote endpoint participates in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// Talks to the sync host only; everything it sees is relayed by the host
    Client,
    /// Part of a full mesh; exchanges its own replicas with every other peer
    Peer,
}

/// Network time of the current tick, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeContext {
    /// Carrier time
    pub real_time: u32,
    /// Carrier time minus the session's local lag
    pub local_time: u32,
}
