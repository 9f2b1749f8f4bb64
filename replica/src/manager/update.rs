use log::{debug, info};

use crate::types::ReplicaId;

use super::{PeerTask, ReplicaManager, UpdateTask};

impl ReplicaManager {
    /// Let proxies react to the state that arrived this tick, and finish
    /// off replicas and peers that were scheduled for removal
    pub fn update_from_replicas(&mut self) {
        if !self.is_initialized {
            return;
        }
        self.is_processing = true;

        if let Some(carrier) = self.carrier.as_deref() {
            self.carrier_time = carrier.time();
        }
        if let Some(step) = self.fixed_time_step.as_mut() {
            let steps = step.advance(self.carrier_time);
            if steps > 0 {
                debug!("Advanced {} fixed steps to {}", steps, step.current_time());
            }
        }

        while let Some((handle, task)) = self.update_tasks.pop() {
            match task {
                UpdateTask::Update(id) => {
                    if let Some(replica) = self.registry.get_mut(id) {
                        if replica.update_task == Some(handle) {
                            replica.update_task = None;
                        }
                    }
                    self.run_update_task(id);
                }
                UpdateTask::DestroyedProxy(id) => {
                    if let Some(replica) = self.registry.get_mut(id) {
                        if replica.update_task == Some(handle) {
                            replica.update_task = None;
                        }
                    }
                    self.destroy_proxy(id);
                }
            }
        }

        while let Some((_, task)) = self.peer_update_tasks.pop() {
            match task {
                PeerTask::DestroyPeer(key) => {
                    if let Some(peer) = self.peers.remove(&key) {
                        info!("Peer {} removed", peer.id());
                        self.events.push_peer_removed(peer.id());
                    }
                }
            }
        }

        self.is_processing = false;
    }

    fn run_update_task(&mut self, id: ReplicaId) {
        let Some(replica) = self.registry.get(id) else {
            return;
        };
        let orphan_owner = replica.upstream().filter(|key| {
            self.peers
                .get(key)
                .map_or(true, |peer| peer.is_orphan())
        });

        match orphan_owner {
            Some(owner) => {
                if !self.is_sync_host {
                    return;
                }
                if replica.is_migratable() {
                    let local_id = self.local.id();
                    self.migrate_replica(id, local_id);
                } else {
                    self.remove_replica_from_downstream(id);
                    self.registry.tombstone(id, self.time.real_time);
                    self.remove_from_peer(owner, id);
                }
            }
            None => {
                let time = self.time;
                if let Some(replica) = self.registry.get_mut(id) {
                    let context = replica.context(time, None);
                    replica.handler_mut().update_from_replica(&context);
                }
            }
        }
    }

    fn destroy_proxy(&mut self, id: ReplicaId) {
        let Some(owner) = self.registry.get(id).map(|replica| replica.owner) else {
            return;
        };
        self.remove_replica_from_downstream(id);
        self.remove_from_peer(owner, id);
    }

    /// Tick every primary, advance migrations and expire old tombstones
    pub fn update_replicas(&mut self) {
        if !self.is_initialized {
            return;
        }
        self.is_processing = true;

        let time = self.time;
        let ids: Vec<ReplicaId> = self.local.objects().collect();
        for id in ids {
            let changed = match self.registry.get_mut(id) {
                Some(replica) if replica.is_primary() && replica.is_active() => {
                    let context = replica.context(time, None);
                    replica.handler_mut().update(&context)
                }
                _ => false,
            };
            if changed {
                self.on_replica_changed(id);
            }
        }

        self.update_migrations();

        let expiration = self.config.tombstone_expiration_ms;
        self.registry.expire_tombstones(time.real_time, expiration);

        self.is_processing = false;
    }
}
