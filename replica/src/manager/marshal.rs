use log::trace;

use crate::{
    command::{write_destroy_proxy, write_new_replica, write_update, ReplicaHeader},
    replica::{MarshalMode, MarshalOutput, Replica},
    types::{PeerKey, ReplicaId},
    wrapping_number::sequence_less_than,
};

use super::{MarshalTask, ReplicaManager};

impl ReplicaManager {
    /// Write every dirty replica into its targets' buffers and flush the
    /// buffers. Runs at most once per send interval.
    pub fn marshal(&mut self) {
        if !self.is_ready() {
            return;
        }

        if let Some(carrier) = self.carrier.as_deref() {
            self.carrier_time = carrier.time();
        }
        let now = self.carrier_time;
        let dt = now.wrapping_sub(self.last_check_time);
        self.last_check_time = now;
        if sequence_less_than(now.wrapping_add(dt), self.next_send_time) {
            return;
        }
        self.next_send_time = self
            .next_send_time
            .wrapping_add(self.config.target_send_time_ms);

        self.is_processing = true;

        while let Some(id) = self.registry.pop_dirty() {
            let Some(replica) = self.registry.get_mut(id) else {
                continue;
            };
            if replica.marshal_task.is_none() {
                let priority = replica.priority();
                replica.marshal_task = Some(self.marshal_tasks.push(MarshalTask::Marshal(id), priority));
            }
        }

        while let Some((_, task)) = self.marshal_tasks.pop() {
            match task {
                MarshalTask::Marshal(id) => self.marshal_replica(id),
                MarshalTask::Zombie(replica) => self.marshal_zombie(&replica),
            }
        }

        self.flush_peers();

        self.is_processing = false;
    }

    fn marshal_replica(&mut self, id: ReplicaId) {
        let Some(replica) = self.registry.get_mut(id) else {
            return;
        };
        replica.marshal_task = None;
        if replica.is_primary() && replica.is_upstream_suspended() {
            return;
        }
        if replica.targets.is_empty() {
            replica.changed_owner = false;
            return;
        }

        let announce_owner = replica.changed_owner;
        let targets: Vec<(PeerKey, bool)> = replica
            .targets
            .iter()
            .filter(|target| {
                self.peers
                    .get(&target.peer)
                    .is_some_and(|peer| peer.is_connected() && !peer.removal_scheduled)
            })
            .map(|target| (target.peer, target.synced && !announce_owner))
            .collect();

        let needs_delta = targets.iter().any(|(_, synced)| *synced);
        let needs_full = targets.iter().any(|(_, synced)| !*synced);

        let delta = needs_delta.then(|| {
            let mut output = MarshalOutput::new(MarshalMode::Delta);
            replica.handler_mut().marshal(&mut output);
            output.into_parts()
        });
        let full = needs_full.then(|| {
            let mut output = MarshalOutput::new(MarshalMode::Full);
            replica.handler_mut().marshal(&mut output);
            output.into_parts().0
        });
        let header = ReplicaHeader {
            sync_stage: replica.options().sync_stage,
            migratable: replica.is_migratable(),
            create_time: replica.create_time(),
            owner_seq: replica.owner_seq(),
            id,
        };

        for (key, synced) in &targets {
            let Some(peer) = self.peers.get_mut(key) else {
                continue;
            };
            if *synced {
                if let Some((reliable, unreliable)) = &delta {
                    if !reliable.is_empty() {
                        write_update(peer.reliable.writer(), id, reliable);
                    }
                    if !unreliable.is_empty() {
                        write_update(peer.unreliable.writer(), id, unreliable);
                    }
                }
            } else if let Some(full) = &full {
                write_new_replica(peer.reliable.writer(), announce_owner, &header, full);
            }
        }

        let Some(replica) = self.registry.get_mut(id) else {
            return;
        };
        for target in replica.targets.iter_mut() {
            if targets.iter().any(|(key, _)| *key == target.peer) {
                target.synced = true;
            }
        }
        replica.changed_owner = false;
        trace!("Marshaled replica {} to {} peers", id, targets.len());
    }

    /// Tell everyone that had the removed replica that it is gone
    fn marshal_zombie(&mut self, replica: &Replica) {
        for target in replica.targets() {
            if !target.synced {
                continue;
            }
            if let Some(peer) = self.peers.get_mut(&target.peer) {
                if peer.is_connected() && !peer.removal_scheduled {
                    write_destroy_proxy(peer.reliable.writer(), replica.id());
                }
            }
        }
    }

    fn flush_peers(&mut self) {
        let now = self.carrier_time;
        let timestamp = self.network_time();
        let channel = self.config.comm_channel;
        let Some(carrier) = self.carrier.as_deref_mut() else {
            return;
        };

        for peer in self.peers.values_mut() {
            if peer.is_orphan() || peer.removal_scheduled {
                peer.set_new(false);
                continue;
            }
            if !peer.has_pending_data() && !self.config.debug.send_heartbeats {
                peer.set_new(false);
                continue;
            }
            if !peer
                .allowance
                .try_spend(now, peer.pending_bytes(), &self.send_limit)
            {
                trace!("Send allowance to peer {} used up, deferring", peer.id());
                continue;
            }
            peer.send_buffer(carrier, channel, timestamp, &self.config.debug);
            peer.set_new(false);
        }
    }
}
