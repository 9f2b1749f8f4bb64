use log::debug;

use crate::types::{PeerId, ReplicaId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Requested,
    UpstreamSuspendPending,
    UpstreamSuspended,
    DownstreamPending,
    Complete,
}

/// Where the replica's state currently comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upstream {
    /// Primary on this node
    Local,
    /// Held by a peer whose connection dropped
    Orphan,
    Connected(PeerId),
}

/// How to reach the peer that should end up owning the replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NewOwner {
    Local,
    Connected(PeerId),
    /// Not connected (or gone); the migration cannot finish
    Unreachable,
}

/// Snapshot of the manager state a sequence needs to advance
#[derive(Debug, Clone, Copy)]
pub(crate) struct MigrationView {
    pub replica_exists: bool,
    pub upstream: Upstream,
    pub new_owner: NewOwner,
}

/// Work the manager must carry out for a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MigrationAction {
    /// Stop marshaling the local primary
    SuspendLocal,
    /// Ask the upstream peer to stop forwarding updates
    RequestSuspend { peer: PeerId, time: u32 },
    /// Become the owner
    TakeOwnership,
    /// Tell the new owner to take over
    HandOff { peer: PeerId, time: u32 },
    /// The sequence was abandoned; release any local suspension
    Abort,
}

/// Drives one replica through the two-step ownership hand-off. Each step
/// completes when an acknowledgment carrying the current request time
/// arrives; acknowledgments for older requests are ignored.
#[derive(Debug)]
pub struct MigrationSequence {
    replica_id: ReplicaId,
    new_owner: PeerId,
    request_time: u32,
    state: MigrationState,
    upstream_acked: bool,
    downstream_acked: bool,
}

impl MigrationSequence {
    pub(crate) fn new(replica_id: ReplicaId, new_owner: PeerId, request_time: u32) -> Self {
        Self {
            replica_id,
            new_owner,
            request_time,
            state: MigrationState::Requested,
            upstream_acked: false,
            downstream_acked: false,
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn new_owner(&self) -> PeerId {
        self.new_owner
    }

    pub fn request_time(&self) -> u32 {
        self.request_time
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == MigrationState::Complete
    }

    /// Point the sequence at a different owner and start the handshake over
    pub(crate) fn modify_new_owner(&mut self, new_owner: PeerId, request_time: u32) {
        if self.is_complete() {
            return;
        }
        self.new_owner = new_owner;
        self.request_time = request_time;
        self.state = MigrationState::Requested;
        self.upstream_acked = false;
        self.downstream_acked = false;
    }

    pub fn on_ack_upstream_suspended(&mut self, from: PeerId, time: u32) {
        if time != self.request_time {
            debug!(
                "Ignoring stale upstream ack for replica {} from peer {} (time {}, expecting {})",
                self.replica_id, from, time, self.request_time
            );
            return;
        }
        self.upstream_acked = true;
    }

    pub fn on_ack_downstream(&mut self, from: PeerId, time: u32) {
        if time != self.request_time {
            debug!(
                "Ignoring stale downstream ack for replica {} from peer {} (time {}, expecting {})",
                self.replica_id, from, time, self.request_time
            );
            return;
        }
        self.downstream_acked = true;
    }

    /// Advance as far as the current acknowledgments allow
    pub(crate) fn update(&mut self, view: MigrationView) -> Vec<MigrationAction> {
        let mut actions = Vec::new();
        if self.is_complete() {
            return actions;
        }
        if !view.replica_exists {
            self.state = MigrationState::Complete;
            return actions;
        }

        loop {
            match self.state {
                MigrationState::Requested => {
                    match view.upstream {
                        Upstream::Local => {
                            actions.push(MigrationAction::SuspendLocal);
                            self.upstream_acked = true;
                        }
                        Upstream::Orphan => {
                            self.upstream_acked = true;
                        }
                        Upstream::Connected(peer) => {
                            actions.push(MigrationAction::RequestSuspend {
                                peer,
                                time: self.request_time,
                            });
                        }
                    }
                    self.state = MigrationState::UpstreamSuspendPending;
                }
                MigrationState::UpstreamSuspendPending => {
                    if !self.upstream_acked {
                        break;
                    }
                    self.state = MigrationState::UpstreamSuspended;
                }
                MigrationState::UpstreamSuspended => {
                    match view.new_owner {
                        NewOwner::Local => {
                            actions.push(MigrationAction::TakeOwnership);
                            self.downstream_acked = true;
                        }
                        NewOwner::Connected(peer) => {
                            actions.push(MigrationAction::HandOff {
                                peer,
                                time: self.request_time,
                            });
                        }
                        NewOwner::Unreachable => {
                            actions.push(MigrationAction::Abort);
                            self.state = MigrationState::Complete;
                            break;
                        }
                    }
                    self.state = MigrationState::DownstreamPending;
                }
                MigrationState::DownstreamPending => {
                    if !self.downstream_acked {
                        if view.new_owner == NewOwner::Unreachable {
                            actions.push(MigrationAction::Abort);
                            self.state = MigrationState::Complete;
                        }
                        break;
                    }
                    self.state = MigrationState::Complete;
                }
                MigrationState::Complete => break,
            }
        }

        actions
    }
}
