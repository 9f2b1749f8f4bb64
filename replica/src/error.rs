use thiserror::Error;

use replica_serde::SerdeErr;

use crate::types::{PeerId, ReplicaId};

/// Errors raised by the id allocator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdAllocError {
    /// Every granted block has been used up
    #[error("No replica ids available. Request a new id block from the sync host before adding primaries")]
    Exhausted,

    /// The block would cover reserved ids or run past the end of the id space
    #[error("Id block {seed} is out of range")]
    BlockOutOfRange { seed: u32 },

    /// The block overlaps one already held
    #[error("Id block {seed} overlaps a block already granted")]
    BlockOverlap { seed: u32 },
}

/// Protocol anomalies found while reading a peer's buffer. Any of these
/// aborts the rest of that buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnmarshalError {
    /// The bytes could not be decoded
    #[error("Malformed buffer: {source}")]
    Malformed {
        #[from]
        source: SerdeErr,
    },

    /// Header value 0, or a command this build does not know
    #[error("Invalid command header {header}")]
    InvalidCommand { header: u32 },

    /// Checksum did not match the buffer contents
    #[error("Checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// A peer sent a second greeting after it was identified
    #[error("Peer {peer_id} sent a second greeting")]
    DuplicateGreeting { peer_id: PeerId },

    /// A greeting claimed an id that already belongs to another connection
    #[error("Peer id {peer_id} is already in use by another connection")]
    PeerIdInUse { peer_id: PeerId },

    /// A second host announced itself
    #[error("Peer {peer_id} claims to be the sync host but a valid host already exists")]
    DuplicateHost { peer_id: PeerId },

    /// A command was received from a peer that has not greeted yet
    #[error("Command {header} received before greeting")]
    NotGreeted { header: u32 },

    /// A command only the sync host may answer was sent to a non-host
    #[error("Command {header} can only be processed by the sync host")]
    NotSyncHost { header: u32 },

    /// An id block arrived that was not asked for, or not from the sync host
    #[error("Peer {peer_id} sent id block {seed} that was not requested from it")]
    UnsolicitedIdBlock { peer_id: PeerId, seed: u32 },

    /// An id block could not be taken or handed out
    #[error("Id block rejected: {source}")]
    IdBlock {
        #[from]
        source: IdAllocError,
    },

    /// Strict source validation rejected the sender
    #[error("Peer {peer_id} is not allowed to send command {header} for replica {replica_id}")]
    UnauthorizedSource {
        peer_id: PeerId,
        header: u32,
        replica_id: ReplicaId,
    },
}

/// Errors raised by manager operations that have a non-panicking variant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaManagerError {
    /// Operation needs `init()` first
    #[error("ReplicaManager is not initialized")]
    NotInitialized,

    /// `init()` was called twice
    #[error("ReplicaManager is already initialized")]
    AlreadyInitialized,

    /// A non-zero local peer id is required
    #[error("Local peer id must be non-zero")]
    InvalidPeerId,

    /// Promotion requested while a valid host is connected
    #[error("Cannot promote: a valid sync host already exists")]
    HostExists,

    /// Host-only operation invoked on a non-host
    #[error("Operation is only available on the sync host")]
    NotSyncHost,

    /// No local ids left
    #[error(transparent)]
    IdAlloc(#[from] IdAllocError),
}
