use std::{mem, vec::IntoIter};

use crate::types::{PeerId, ReplicaId};

/// Notifications raised during a tick, drained by the application
pub struct ReplicaEvents {
    new_peers: Vec<PeerId>,
    removed_peers: Vec<PeerId>,
    created: Vec<(ReplicaId, bool)>,
    destroyed: Vec<ReplicaId>,
    ownership_changes: Vec<(ReplicaId, bool)>,

    empty: bool,
}

impl ReplicaEvents {
    pub(crate) fn new() -> Self {
        Self {
            new_peers: Vec::new(),
            removed_peers: Vec::new(),
            created: Vec::new(),
            destroyed: Vec::new(),
            ownership_changes: Vec::new(),

            empty: true,
        }
    }

    // Public

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn read<V: ReplicaEvent>(&mut self) -> V::Iter {
        V::iter(self)
    }

    pub fn has<V: ReplicaEvent>(&self) -> bool {
        V::has(self)
    }

    // Crate-public

    pub(crate) fn push_new_peer(&mut self, peer_id: PeerId) {
        self.new_peers.push(peer_id);
        self.empty = false;
    }

    pub(crate) fn push_peer_removed(&mut self, peer_id: PeerId) {
        self.removed_peers.push(peer_id);
        self.empty = false;
    }

    pub(crate) fn push_replica_created(&mut self, id: ReplicaId, is_primary: bool) {
        self.created.push((id, is_primary));
        self.empty = false;
    }

    pub(crate) fn push_replica_destroyed(&mut self, id: ReplicaId) {
        self.destroyed.push(id);
        self.empty = false;
    }

    pub(crate) fn push_ownership_changed(&mut self, id: ReplicaId, is_primary: bool) {
        self.ownership_changes.push((id, is_primary));
        self.empty = false;
    }
}

impl Default for ReplicaEvents {
    fn default() -> Self {
        Self::new()
    }
}

// Event Trait
pub trait ReplicaEvent {
    type Iter;

    fn iter(events: &mut ReplicaEvents) -> Self::Iter;

    fn has(events: &ReplicaEvents) -> bool;
}

// NewPeerEvent
/// A peer was accepted into the session
pub struct NewPeerEvent;
impl ReplicaEvent for NewPeerEvent {
    type Iter = IntoIter<PeerId>;

    fn iter(events: &mut ReplicaEvents) -> Self::Iter {
        let list = mem::take(&mut events.new_peers);
        IntoIterator::into_iter(list)
    }

    fn has(events: &ReplicaEvents) -> bool {
        !events.new_peers.is_empty()
    }
}

// PeerRemovedEvent
/// A peer record was destroyed, after any orphaned replicas were dealt with
pub struct PeerRemovedEvent;
impl ReplicaEvent for PeerRemovedEvent {
    type Iter = IntoIter<PeerId>;

    fn iter(events: &mut ReplicaEvents) -> Self::Iter {
        let list = mem::take(&mut events.removed_peers);
        IntoIterator::into_iter(list)
    }

    fn has(events: &ReplicaEvents) -> bool {
        !events.removed_peers.is_empty()
    }
}

// ReplicaCreatedEvent
/// `(id, is_primary)` for each replica activated this tick
pub struct ReplicaCreatedEvent;
impl ReplicaEvent for ReplicaCreatedEvent {
    type Iter = IntoIter<(ReplicaId, bool)>;

    fn iter(events: &mut ReplicaEvents) -> Self::Iter {
        let list = mem::take(&mut events.created);
        IntoIterator::into_iter(list)
    }

    fn has(events: &ReplicaEvents) -> bool {
        !events.created.is_empty()
    }
}

// ReplicaDestroyedEvent
pub struct ReplicaDestroyedEvent;
impl ReplicaEvent for ReplicaDestroyedEvent {
    type Iter = IntoIter<ReplicaId>;

    fn iter(events: &mut ReplicaEvents) -> Self::Iter {
        let list = mem::take(&mut events.destroyed);
        IntoIterator::into_iter(list)
    }

    fn has(events: &ReplicaEvents) -> bool {
        !events.destroyed.is_empty()
    }
}

// OwnershipChangedEvent
/// `(id, is_primary)` after a migration moved authority to or away from us
pub struct OwnershipChangedEvent;
impl ReplicaEvent for OwnershipChangedEvent {
    type Iter = IntoIter<(ReplicaId, bool)>;

    fn iter(events: &mut ReplicaEvents) -> Self::Iter {
        let list = mem::take(&mut events.ownership_changes);
        IntoIterator::into_iter(list)
    }

    fn has(events: &ReplicaEvents) -> bool {
        !events.ownership_changes.is_empty()
    }
}
