//! # Replica
//! Keeps application objects in sync across a session of networked peers.
//! Each object has one authoritative copy (the primary) and read-only
//! copies (proxies) on every other peer; ownership can move between peers
//! at runtime.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

pub use replica_serde::{ByteReader, ByteWriter, Serde, SerdeErr, UnsignedVariableInteger};

mod carrier;
mod command;
mod config;
mod error;
mod events;
mod fixed_time_step;
mod id_allocator;
mod manager;
mod migration;
mod peer;
mod registry;
mod replica;
mod send_allowance;
mod session_info;
mod task_queue;
mod types;
mod wrapping_number;

pub use carrier::{
    AckCallback, Carrier, ConnectionEvent, ConnectionEvents, Priority, ReceiveResult,
    ReceiveState, Reliability,
};
pub use config::{DebugConfig, ReplicaManagerConfig, Roles, SecurityOptions};
pub use error::{IdAllocError, ReplicaManagerError, UnmarshalError};
pub use events::{
    NewPeerEvent, OwnershipChangedEvent, PeerRemovedEvent, ReplicaCreatedEvent,
    ReplicaDestroyedEvent, ReplicaEvent, ReplicaEvents,
};
pub use id_allocator::IdAllocator;
pub use manager::ReplicaManager;
pub use migration::{MigrationSequence, MigrationState};
pub use peer::ReplicaPeer;
pub use replica::{
    AsAny, MarshalMode, MarshalOutput, Replica, ReplicaContext, ReplicaFactory, ReplicaHandler,
    ReplicaOptions, ReplicaTarget,
};
pub use send_allowance::{SendAllowance, SendLimit};
pub use session_info::SessionInfo;
pub use task_queue::{TaskHandle, TaskQueue};
pub use types::{
    ConnectionId, PeerId, PeerKey, PeerMode, RepIdSeed, ReplicaId, TimeContext,
    CMD_ACK_DOWNSTREAM, CMD_ACK_UPSTREAM_SUSPENDED, CMD_COUNT, CMD_DESTROY_PROXY,
    CMD_GRANT_ID_BLOCK, CMD_GREETINGS, CMD_HAND_OFF, CMD_HEARTBEAT, CMD_INVALID, CMD_NEW_OWNER,
    CMD_NEW_PROXY, CMD_PEER_LOST, CMD_REQUEST_ID_BLOCK, CMD_SUSPEND_UPSTREAM, INVALID_PEER_ID,
    INVALID_REPLICA_ID, MAX_RESERVED_CMD_OR_ID, REPIDS_PER_BLOCK, REPLICA_ID_SESSION_INFO,
};
pub use wrapping_number::{sequence_greater_than, sequence_less_than, wrapping_diff};
