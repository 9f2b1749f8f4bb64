use log::{debug, info};

use crate::{
    command::{write_hand_off, write_migration_step},
    migration::{MigrationAction, MigrationSequence, MigrationView, NewOwner, Upstream},
    types::{PeerId, PeerKey, ReplicaId, CMD_SUSPEND_UPSTREAM},
};

use super::ReplicaManager;

impl ReplicaManager {
    /// Start moving ownership of a replica to `new_owner`. Calling it again
    /// for the same replica redirects the running migration.
    pub fn migrate_replica(&mut self, id: ReplicaId, new_owner: PeerId) {
        let Some(replica) = self.registry.get(id) else {
            debug!("migrate_replica: unknown replica {}", id);
            return;
        };
        if !replica.is_migratable() {
            debug!("migrate_replica: replica {} is not migratable", id);
            return;
        }
        if replica.is_primary() && new_owner == self.local.id() && !self.active_migrations.contains_key(&id) {
            return;
        }

        let request_time = self.network_time();
        match self.active_migrations.get_mut(&id) {
            Some(sequence) => {
                if sequence.new_owner() != new_owner {
                    sequence.modify_new_owner(new_owner, request_time);
                }
            }
            None => {
                info!("Migrating replica {} to peer {}", id, new_owner);
                self.active_migrations
                    .insert(id, MigrationSequence::new(id, new_owner, request_time));
            }
        }
    }

    /// The upstream peer confirmed it stopped forwarding the replica
    pub fn ack_upstream_suspended(&mut self, id: ReplicaId, from: PeerId, time: u32) {
        if let Some(sequence) = self.active_migrations.get_mut(&id) {
            sequence.on_ack_upstream_suspended(from, time);
        }
    }

    /// The new owner confirmed it took over the replica
    pub fn ack_downstream(&mut self, id: ReplicaId, from: PeerId, time: u32) {
        if let Some(sequence) = self.active_migrations.get_mut(&id) {
            sequence.on_ack_downstream(from, time);
        }
    }

    pub fn active_migration(&self, id: ReplicaId) -> Option<&MigrationSequence> {
        self.active_migrations.get(&id)
    }

    pub fn active_migration_count(&self) -> usize {
        self.active_migrations.len()
    }

    /// Advance every running migration, then forget the finished ones
    pub(super) fn update_migrations(&mut self) {
        let ids: Vec<ReplicaId> = self.active_migrations.keys().copied().collect();
        for id in ids {
            let view = self.migration_view(id);
            let actions = match self.active_migrations.get_mut(&id) {
                Some(sequence) => match view {
                    Some(view) => sequence.update(view),
                    None => sequence.update(MigrationView {
                        replica_exists: false,
                        upstream: Upstream::Orphan,
                        new_owner: NewOwner::Unreachable,
                    }),
                },
                None => continue,
            };
            for action in actions {
                self.apply_migration_action(id, action);
            }
        }
        self.active_migrations
            .retain(|_, sequence| !sequence.is_complete());
    }

    fn migration_view(&self, id: ReplicaId) -> Option<MigrationView> {
        let sequence = self.active_migrations.get(&id)?;
        let replica = self.registry.get(id)?;

        let upstream = match replica.upstream() {
            None => Upstream::Local,
            Some(key) => match self.peers.get(&key) {
                Some(peer) if peer.is_connected() => Upstream::Connected(peer.id()),
                _ => Upstream::Orphan,
            },
        };
        let new_owner = if sequence.new_owner() == self.local.id() {
            NewOwner::Local
        } else {
            match self.find_peer_key(sequence.new_owner()).and_then(|key| self.peers.get(&key)) {
                Some(peer) if peer.is_connected() => NewOwner::Connected(peer.id()),
                _ => NewOwner::Unreachable,
            }
        };

        Some(MigrationView {
            replica_exists: true,
            upstream,
            new_owner,
        })
    }

    fn apply_migration_action(&mut self, id: ReplicaId, action: MigrationAction) {
        match action {
            MigrationAction::SuspendLocal => {
                if let Some(replica) = self.registry.get_mut(id) {
                    replica.upstream_suspended = true;
                }
            }
            MigrationAction::RequestSuspend { peer, time } => {
                if let Some(key) = self.find_peer_key(peer) {
                    if let Some(peer) = self.peers.get_mut(&key) {
                        write_migration_step(peer.reliable.writer(), CMD_SUSPEND_UPSTREAM, id, time);
                    }
                }
            }
            MigrationAction::TakeOwnership => {
                let is_primary = self
                    .registry
                    .get(id)
                    .is_some_and(|replica| replica.is_primary());
                if is_primary {
                    // already ours, only the suspension has to go
                    if let Some(replica) = self.registry.get_mut(id) {
                        replica.upstream_suspended = false;
                    }
                } else {
                    self.change_replica_ownership(id, PeerKey::LOCAL);
                }
            }
            MigrationAction::HandOff { peer, time } => {
                let owner_seq = self
                    .registry
                    .get(id)
                    .map(|replica| replica.owner_seq())
                    .unwrap_or_default();
                if let Some(key) = self.find_peer_key(peer) {
                    if let Some(peer) = self.peers.get_mut(&key) {
                        write_hand_off(peer.reliable.writer(), id, owner_seq, time);
                    }
                }
            }
            MigrationAction::Abort => {
                debug!("Migration of replica {} abandoned", id);
                if let Some(replica) = self.registry.get_mut(id) {
                    replica.upstream_suspended = false;
                }
            }
        }
    }

    /// Move a replica to a different peer's set and run the migrated path
    pub(super) fn change_replica_ownership(&mut self, id: ReplicaId, new_owner: PeerKey) {
        let Some(old_owner) = self.registry.get(id).map(|replica| replica.owner) else {
            return;
        };
        if old_owner == new_owner {
            self.on_replica_migrated(id, new_owner.is_local());
            return;
        }

        if let Some(replica) = self.registry.get_mut(id) {
            replica.owner = new_owner;
        }
        if let Some(peer) = self.peer_mut(new_owner) {
            peer.add(id);
        }
        self.on_replica_migrated(id, new_owner.is_local());
        self.remove_from_peer(old_owner, id);
    }

    pub(super) fn on_replica_migrated(&mut self, id: ReplicaId, is_owner: bool) {
        let is_sync_host = self.is_sync_host;
        let time = self.time;
        let Some(replica) = self.registry.get_mut(id) else {
            return;
        };

        if is_owner {
            let owner_seq = replica.owner_seq().wrapping_add(1);
            replica.set_owner_seq(owner_seq);
            replica.upstream_suspended = false;
            replica.changed_owner = true;
        } else if is_sync_host {
            // forward the new owner's announcement to everyone else
            replica.changed_owner = true;
            replica.upstream_suspended = false;
        } else {
            replica.changed_owner = false;
            replica.upstream_suspended = false;
        }

        let context = replica.context(time, None);
        replica.handler_mut().on_change_ownership(&context);
        let is_primary = replica.is_primary();
        self.events.push_ownership_changed(id, is_primary);

        self.update_replica_targets(id);
        self.on_replica_changed(id);
    }
}
