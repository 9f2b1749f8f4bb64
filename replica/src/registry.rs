use std::collections::{HashMap, VecDeque};

use log::debug;

use crate::{
    replica::Replica,
    types::ReplicaId,
    wrapping_number::wrapping_diff,
};

/// Owns every live replica, the dirty worklist and the tombstones of
/// destroyed ids. Everything else refers to replicas by id.
pub(crate) struct ReplicaRegistry {
    replicas: HashMap<ReplicaId, Replica>,
    dirty: VecDeque<ReplicaId>,
    // destroyed id -> network time of destruction
    tombstones: HashMap<ReplicaId, u32>,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self {
            replicas: HashMap::new(),
            dirty: VecDeque::new(),
            tombstones: HashMap::new(),
        }
    }

    /// # Panics
    ///
    /// Panics if the id is already registered
    pub fn insert(&mut self, replica: Replica) {
        let id = replica.id();
        if self.replicas.contains_key(&id) {
            panic!("Replica {} is already registered", id);
        }
        self.replicas.insert(id, replica);
    }

    /// Remove a replica, taking it off the dirty list
    pub fn remove(&mut self, id: ReplicaId) -> Option<Replica> {
        let mut replica = self.replicas.remove(&id)?;
        if replica.is_dirty {
            replica.is_dirty = false;
            self.dirty.retain(|dirty_id| *dirty_id != id);
        }
        Some(replica)
    }

    pub fn get(&self, id: ReplicaId) -> Option<&Replica> {
        self.replicas.get(&id)
    }

    pub fn get_mut(&mut self, id: ReplicaId) -> Option<&mut Replica> {
        self.replicas.get_mut(&id)
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        self.replicas.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn ids(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self.replicas.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        self.replicas.values_mut()
    }

    // Dirty list

    /// Queue an active replica for marshaling. Returns false if it was
    /// already queued or is inactive.
    pub fn mark_dirty(&mut self, id: ReplicaId) -> bool {
        let Some(replica) = self.replicas.get_mut(&id) else {
            return false;
        };
        if replica.is_dirty || !replica.is_active {
            return false;
        }
        replica.is_dirty = true;
        self.dirty.push_back(id);
        true
    }

    pub fn pop_dirty(&mut self) -> Option<ReplicaId> {
        while let Some(id) = self.dirty.pop_front() {
            if let Some(replica) = self.replicas.get_mut(&id) {
                if replica.is_dirty {
                    replica.is_dirty = false;
                    return Some(id);
                }
            }
        }
        None
    }

    // Tombstones

    pub fn tombstone(&mut self, id: ReplicaId, now: u32) {
        self.tombstones.insert(id, now);
    }

    pub fn is_tombstoned(&self, id: ReplicaId) -> bool {
        self.tombstones.contains_key(&id)
    }

    #[cfg(test)]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Forget tombstones older than `expiration_ms`
    pub fn expire_tombstones(&mut self, now: u32, expiration_ms: u32) {
        self.tombstones.retain(|id, destroyed_at| {
            let age = wrapping_diff(*destroyed_at, now);
            let keep = age < 0 || (age as u32) < expiration_ms;
            if !keep {
                debug!("Tombstone for replica {} expired", id);
            }
            keep
        });
    }

    pub fn clear(&mut self) {
        self.replicas.clear();
        self.dirty.clear();
        self.tombstones.clear();
    }
}
