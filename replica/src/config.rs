use std::{default::Default, ops::BitOr};

use crate::types::PeerId;

/// Capabilities a node brings to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roles(u8);

impl Roles {
    pub const NONE: Roles = Roles(0);
    /// Eligible to act as the sync host. A node started with this role
    /// promotes itself during `init()`.
    pub const SYNC_HOST: Roles = Roles(1);

    pub fn contains(&self, other: Roles) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Roles {
    type Output = Roles;

    fn bitor(self, rhs: Self) -> Self::Output {
        Roles(self.0 | rhs.0)
    }
}

/// Checks applied to incoming traffic
#[derive(Debug, Clone, Default)]
pub struct SecurityOptions {
    /// Only accept ownership changes from the sync host, and only accept
    /// state for a replica from the peer it is currently received through
    pub enable_strict_source_validation: bool,
}

/// Diagnostics, off by default
#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// Append a heartbeat command to every flushed buffer
    pub send_heartbeats: bool,
    /// Count ticks without traffic per peer and warn past `max_ticks_per_heartbeat`
    pub track_heartbeats: bool,
    pub max_ticks_per_heartbeat: u32,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            send_heartbeats: false,
            track_heartbeats: false,
            max_ticks_per_heartbeat: 100,
        }
    }
}

/// Contains Config properties which will be used by the ReplicaManager
#[derive(Debug, Clone)]
pub struct ReplicaManagerConfig {
    /// This node's id in the session. Must be non-zero.
    pub my_peer_id: PeerId,
    pub roles: Roles,
    /// Interval between flushes, in milliseconds. Raised to the carrier's
    /// maximum send rate if lower.
    pub target_send_time_ms: u32,
    /// Outgoing bytes per second per peer; 0 is unlimited
    pub target_send_limit_bytes: u32,
    /// How many seconds of unused allowance may accumulate
    pub target_send_limit_burst_sec: f32,
    /// Carrier channel used for all replica traffic
    pub comm_channel: u8,
    /// Broadcast every primary to every accepted peer
    pub auto_broadcast: bool,
    /// How long a destroyed id keeps rejecting late updates
    pub tombstone_expiration_ms: u32,
    /// When set, `update_from_replicas` advances network time in fixed steps
    pub fixed_time_steps_per_second: Option<u32>,
    /// Delay applied to local time across the session. Only the sync host's
    /// value is used; it is replicated with the session info.
    pub local_lag_ms: u32,
    pub security: SecurityOptions,
    pub debug: DebugConfig,
}

impl Default for ReplicaManagerConfig {
    fn default() -> Self {
        Self {
            my_peer_id: 0,
            roles: Roles::NONE,
            target_send_time_ms: 10,
            target_send_limit_bytes: 0,
            target_send_limit_burst_sec: 10.0,
            comm_channel: 0,
            auto_broadcast: true,
            tombstone_expiration_ms: 5000,
            fixed_time_steps_per_second: None,
            local_lag_ms: 0,
            security: SecurityOptions::default(),
            debug: DebugConfig::default(),
        }
    }
}
