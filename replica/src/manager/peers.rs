use std::collections::HashSet;

use log::{debug, info, warn};

use crate::{
    carrier::{ConnectionEvent, ConnectionEvents},
    command::{write_grant_id_block, write_greetings, write_peer_lost, write_request_id_block},
    error::{IdAllocError, ReplicaManagerError, UnmarshalError},
    peer::ReplicaPeer,
    types::{
        ConnectionId, PeerId, PeerKey, PeerMode, RepIdSeed, ReplicaId, INVALID_PEER_ID,
        REPIDS_PER_BLOCK, REPLICA_ID_SESSION_INFO,
    },
};

use super::{PeerTask, ReplicaManager, PEER_TASK_PRIORITY};

impl ReplicaManager {
    // Connections

    /// Start tracking a new connection. A non-host introduces itself right
    /// away; the host answers once the remote side has greeted.
    ///
    /// # Panics
    ///
    /// Panics if not initialized, or if `Client` mode is used on a node
    /// that is not the sync host
    pub fn add_peer(&mut self, connection: ConnectionId, mode: PeerMode) -> PeerKey {
        if !self.is_initialized {
            panic!("ReplicaManager must be initialized before adding peers");
        }
        if mode == PeerMode::Client && !self.is_sync_host {
            panic!("Client connections can only be added on the sync host");
        }
        if let Some(key) = self.peer_key_by_connection(connection) {
            warn!("Connection {} is already tracked", connection);
            return key;
        }

        self.next_peer_key += 1;
        let key = PeerKey::new(self.next_peer_key);
        let mut peer = ReplicaPeer::new(key, Some(connection), mode);
        let greets_first = !self.is_sync_host;
        if greets_first {
            write_greetings(peer.reliable.writer(), self.local.id(), None);
        }
        self.peers.insert(key, peer);
        if greets_first {
            self.send_peer_buffer(key);
        }

        info!("Connection {} added as {:?} peer", connection, mode);
        key
    }

    /// Forget a connection. The peer record stays around as an orphan until
    /// everything it held has been migrated or removed.
    pub fn remove_peer(&mut self, connection: ConnectionId) {
        let Some(key) = self.peer_key_by_connection(connection) else {
            debug!("remove_peer: connection {} is not tracked", connection);
            return;
        };

        let (peer_id, was_greeted) = match self.peers.get(&key) {
            Some(peer) => (peer.id(), peer.id() != INVALID_PEER_ID),
            None => return,
        };

        if !was_greeted {
            if let Some(peer) = self.peers.get_mut(&key) {
                peer.make_orphan();
            }
            self.on_peer_ready_to_remove(key);
            return;
        }

        // replicas that cannot change owner die with their peer
        let doomed: Vec<ReplicaId> = match self.peers.get(&key) {
            Some(peer) => peer
                .objects()
                .filter(|id| {
                    self.registry
                        .get(*id)
                        .is_some_and(|replica| !replica.is_migratable())
                })
                .collect(),
            None => Vec::new(),
        };
        for id in doomed {
            self.remove_replica_from_downstream(id);
            if let Some(peer) = self.peers.get_mut(&key) {
                peer.remove(id);
            }
        }

        if let Some(peer) = self.peers.get_mut(&key) {
            peer.make_orphan();
        }
        info!("Lost connection to peer {}", peer_id);

        if self.is_sync_host {
            if let Some(session_info) = self.session_info_mut() {
                session_info.remove_peer(peer_id);
            }
            self.on_replica_changed(REPLICA_ID_SESSION_INFO);
            self.void_peer_reports(peer_id);
            self.request_peer_migration(peer_id);
        } else {
            if let Some(host) = self.host_key() {
                if let Some(peer) = self.peers.get_mut(&host) {
                    write_peer_lost(peer.reliable.writer(), peer_id);
                }
            }
            let is_empty = self.peers.get(&key).is_some_and(|peer| !peer.has_objects());
            if is_empty {
                self.on_peer_ready_to_remove(key);
            }
        }
    }

    /// Drop every replica an orphaned peer still holds, then the peer itself
    pub fn discard_orphans(&mut self, peer_id: PeerId) {
        let Some(key) = self
            .peers
            .iter()
            .find(|(_, peer)| peer.id() == peer_id && peer.is_orphan() && !peer.removal_scheduled)
            .map(|(key, _)| *key)
        else {
            return;
        };

        self.pending_peer_reports.remove(&peer_id);
        let ids: Vec<ReplicaId> = match self.peers.get(&key) {
            Some(peer) => peer.objects().collect(),
            None => return,
        };
        for id in ids {
            self.remove_replica_from_downstream(id);
            self.remove_from_peer(key, id);
        }
        let still_listed = self
            .peers
            .get(&key)
            .is_some_and(|peer| !peer.removal_scheduled);
        if still_listed {
            self.on_peer_ready_to_remove(key);
        }
    }

    pub(super) fn process_connection_events(&mut self) {
        for event in self.connection_events.drain() {
            match event {
                ConnectionEvent::Connected { connection, mode } => {
                    if mode == PeerMode::Client && !self.is_sync_host {
                        warn!(
                            "Ignoring client connection {}: only the sync host takes clients",
                            connection
                        );
                        continue;
                    }
                    self.add_peer(connection, mode);
                }
                ConnectionEvent::Disconnected { connection } => {
                    self.remove_peer(connection);
                }
            }
        }
    }

    /// Handle for carrier callbacks running on other threads
    pub fn connection_events(&self) -> ConnectionEvents {
        self.connection_events.clone()
    }

    /// Record the rate a connection actually achieves and throttle every
    /// peer to the slowest one
    pub fn update_connection_rate(&mut self, bytes_per_sec: u32, connection: ConnectionId) {
        self.connection_rates.insert(connection, bytes_per_sec);
        let slowest = self
            .connection_rates
            .values()
            .copied()
            .min()
            .unwrap_or(bytes_per_sec);
        self.set_send_limit(slowest);
        self.send_limit.burst_sec = 1.0;
        self.config.target_send_limit_burst_sec = 1.0;
    }

    // Lookup

    pub fn find_peer(&self, peer_id: PeerId) -> Option<&ReplicaPeer> {
        if peer_id == INVALID_PEER_ID {
            return None;
        }
        if peer_id == self.local.id() {
            return Some(&self.local);
        }
        self.peers
            .values()
            .find(|peer| peer.id() == peer_id && !peer.removal_scheduled)
    }

    /// Every remote peer record, orphans included
    pub fn peers(&self) -> impl Iterator<Item = &ReplicaPeer> {
        self.peers.values()
    }

    pub(super) fn find_peer_key(&self, peer_id: PeerId) -> Option<PeerKey> {
        if peer_id == INVALID_PEER_ID {
            return None;
        }
        if peer_id == self.local.id() {
            return Some(PeerKey::LOCAL);
        }
        self.peers
            .iter()
            .find(|(_, peer)| peer.id() == peer_id && !peer.removal_scheduled)
            .map(|(key, _)| *key)
    }

    pub(super) fn peer_key_by_connection(&self, connection: ConnectionId) -> Option<PeerKey> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.connection() == Some(connection))
            .map(|(key, _)| *key)
    }

    /// The connected remote peer acting as sync host
    pub(super) fn host_key(&self) -> Option<PeerKey> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.is_sync_host() && peer.is_connected())
            .map(|(key, _)| *key)
    }

    pub(super) fn send_peer_buffer(&mut self, key: PeerKey) {
        let timestamp = self.network_time();
        let channel = self.config.comm_channel;
        let Some(carrier) = self.carrier.as_deref_mut() else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.send_buffer(carrier, channel, timestamp, &self.config.debug);
        }
    }

    // Acceptance

    /// Let a greeted peer's traffic through. Returns false while the peer
    /// has to wait for the host's word.
    pub(super) fn accept_peer(&mut self, key: PeerKey) -> bool {
        let (peer_id, peer_is_host) = match self.peers.get(&key) {
            Some(peer) if peer.is_accepted() => return true,
            Some(peer) if peer.id() == INVALID_PEER_ID || peer.is_orphan() => return false,
            Some(peer) => (peer.id(), peer.is_sync_host()),
            None => return false,
        };

        if self.is_sync_host {
            let seed = match self.try_reserve_id_block(peer_id) {
                Ok(seed) => seed,
                Err(err) => {
                    warn!("Cannot accept peer {}: {}", peer_id, err);
                    return false;
                }
            };
            if let Some(session_info) = self.session_info_mut() {
                session_info.accept_peer(peer_id);
            }
            self.on_replica_changed(REPLICA_ID_SESSION_INFO);
            let local_id = self.local.id();
            if let Some(peer) = self.peers.get_mut(&key) {
                write_greetings(peer.reliable.writer(), local_id, Some(seed));
            }
        } else {
            let listed = self
                .session_info()
                .is_some_and(|session_info| session_info.is_accepted(peer_id));
            if !listed && !peer_is_host {
                return false;
            }
        }

        if let Some(peer) = self.peers.get_mut(&key) {
            peer.accept();
        }
        self.on_peer_accepted(key);
        true
    }

    fn on_peer_accepted(&mut self, key: PeerKey) {
        let Some(peer_id) = self.peers.get(&key).map(|peer| peer.id()) else {
            return;
        };
        info!("Peer {} accepted", peer_id);
        self.events.push_new_peer(peer_id);

        for id in self.registry.ids() {
            self.update_replica_targets(id);
            self.on_replica_changed(id);
        }
    }

    /// Tell the new host about every peer this node has lost
    pub(super) fn report_orphans_to_host(&mut self) {
        let Some(host) = self.host_key() else {
            return;
        };
        let lost: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| {
                peer.is_orphan() && !peer.removal_scheduled && peer.id() != INVALID_PEER_ID
            })
            .map(|peer| peer.id())
            .collect();
        if let Some(peer) = self.peers.get_mut(&host) {
            for peer_id in lost {
                write_peer_lost(peer.reliable.writer(), peer_id);
            }
        }
    }

    // Removal

    pub(super) fn on_peer_ready_to_remove(&mut self, key: PeerKey) {
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        if peer.removal_scheduled {
            return;
        }
        peer.removal_scheduled = true;
        peer.clear_objects();
        for replica in self.registry.iter_mut() {
            replica.remove_target(key);
        }
        self.peer_update_tasks
            .push(PeerTask::DestroyPeer(key), PEER_TASK_PRIORITY);
    }

    /// Host side: wait until every other peer confirms it lost `peer_id`
    /// too, then take over the peer's replicas
    pub(super) fn request_peer_migration(&mut self, peer_id: PeerId) {
        if !self.is_sync_host {
            return;
        }
        let local_id = self.local.id();
        let accepted: Vec<PeerId> = self
            .session_info()
            .map(|session_info| session_info.accepted_peers().to_vec())
            .unwrap_or_default();
        let early = self.early_peer_reports.remove(&peer_id).unwrap_or_default();

        let reporters: HashSet<PeerId> = accepted
            .into_iter()
            .filter(|reporter| *reporter != local_id && *reporter != peer_id)
            .filter(|reporter| !early.contains(reporter))
            .filter(|reporter| {
                self.find_peer(*reporter)
                    .is_some_and(|peer| peer.is_connected() && peer.mode() == PeerMode::Peer)
            })
            .collect();

        if reporters.is_empty() {
            self.on_migrate_peer(peer_id);
        } else {
            debug!(
                "Waiting for {} peers to report the loss of peer {}",
                reporters.len(),
                peer_id
            );
            self.pending_peer_reports.insert(peer_id, reporters);
        }
    }

    pub(super) fn on_peer_lost_report(&mut self, reporter: PeerId, lost: PeerId) {
        match self.pending_peer_reports.get_mut(&lost) {
            Some(pending) => {
                pending.remove(&reporter);
                if pending.is_empty() {
                    self.pending_peer_reports.remove(&lost);
                    self.on_migrate_peer(lost);
                }
            }
            None => {
                self.early_peer_reports.entry(lost).or_default().insert(reporter);
            }
        }
    }

    /// A peer that dropped can no longer report anything
    fn void_peer_reports(&mut self, reporter: PeerId) {
        let mut ready = Vec::new();
        for (lost, pending) in self.pending_peer_reports.iter_mut() {
            if pending.remove(&reporter) && pending.is_empty() {
                ready.push(*lost);
            }
        }
        for lost in ready {
            self.pending_peer_reports.remove(&lost);
            self.on_migrate_peer(lost);
        }
        for early in self.early_peer_reports.values_mut() {
            early.remove(&reporter);
        }
    }

    /// Schedule every replica of the lost peer; the update pass migrates
    /// or removes each one
    fn on_migrate_peer(&mut self, peer_id: PeerId) {
        let Some(key) = self
            .peers
            .iter()
            .find(|(_, peer)| peer.id() == peer_id && peer.is_orphan() && !peer.removal_scheduled)
            .map(|(key, _)| *key)
        else {
            return;
        };
        let ids: Vec<ReplicaId> = match self.peers.get(&key) {
            Some(peer) => peer.objects().collect(),
            None => return,
        };
        info!("Migrating {} replicas of lost peer {}", ids.len(), peer_id);
        if ids.is_empty() {
            self.on_peer_ready_to_remove(key);
            return;
        }
        for id in ids {
            self.enqueue_update_task(id);
        }
    }

    // Id blocks

    /// Hand out the next id block. Only the sync host may do this.
    ///
    /// # Panics
    ///
    /// Panics if this node is not the sync host or the id space is used up.
    /// `try_reserve_id_block` reports both as errors instead.
    pub fn reserve_id_block(&mut self, requestor: PeerId) -> RepIdSeed {
        match self.try_reserve_id_block(requestor) {
            Ok(seed) => seed,
            Err(err) => panic!("ReplicaManager::reserve_id_block failed: {}", err),
        }
    }

    pub fn try_reserve_id_block(
        &mut self,
        requestor: PeerId,
    ) -> Result<RepIdSeed, ReplicaManagerError> {
        if !self.is_sync_host {
            return Err(ReplicaManagerError::NotSyncHost);
        }
        let Some(session_info) = self.session_info_mut() else {
            return Err(ReplicaManagerError::NotSyncHost);
        };
        let seed = session_info.next_available_id_block();
        let Some(next) = seed.checked_add(REPIDS_PER_BLOCK) else {
            return Err(IdAllocError::Exhausted.into());
        };
        session_info.set_next_available_id_block(next);
        self.on_replica_changed(REPLICA_ID_SESSION_INFO);
        debug!("Reserved id block {} for peer {}", seed, requestor);
        Ok(seed)
    }

    /// Ids are never reused, so released blocks are not tracked
    pub fn release_id_block(&mut self, _seed: RepIdSeed) -> RepIdSeed {
        0
    }

    /// Ask for another block of replica ids. The host grants itself one
    /// directly; everyone else asks the host.
    pub fn request_id_block(&mut self) {
        if self.is_sync_host {
            if let Err(err) = self.grant_self_id_block() {
                warn!("Cannot grant an id block to the sync host: {}", err);
            }
            return;
        }
        if self.id_block_requested {
            return;
        }
        let Some(host) = self.host_key() else {
            warn!("Cannot request an id block without a sync host");
            return;
        };
        if let Some(peer) = self.peers.get_mut(&host) {
            write_request_id_block(peer.reliable.writer());
            self.id_block_requested = true;
        }
    }

    pub(super) fn grant_self_id_block(&mut self) -> Result<(), ReplicaManagerError> {
        let seed = self.try_reserve_id_block(self.local.id())?;
        self.id_allocator.try_add_block(seed)?;
        Ok(())
    }

    pub(super) fn grant_id_block(
        &mut self,
        key: PeerKey,
        requestor: PeerId,
        header: u32,
    ) -> Result<(), UnmarshalError> {
        let seed = match self.try_reserve_id_block(requestor) {
            Ok(seed) => seed,
            Err(ReplicaManagerError::IdAlloc(source)) => {
                return Err(UnmarshalError::IdBlock { source })
            }
            Err(_) => return Err(UnmarshalError::NotSyncHost { header }),
        };
        if let Some(peer) = self.peers.get_mut(&key) {
            write_grant_id_block(peer.reliable.writer(), seed);
        }
        Ok(())
    }

    // Targets

    /// Recompute which peers a replica is forwarded to. Targets that are
    /// kept retain their synced flag.
    pub(super) fn update_replica_targets(&mut self, id: ReplicaId) {
        let Some(replica) = self.registry.get(id) else {
            return;
        };
        let broadcast = self.should_broadcast(replica);
        let is_primary = replica.is_primary();
        let source = replica.upstream();
        let source_mode = source
            .and_then(|key| self.peers.get(&key))
            .map(|peer| peer.mode());

        let eligible: Vec<PeerKey> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.is_accepted() && !peer.is_orphan() && !peer.removal_scheduled)
            .filter(|(key, peer)| {
                if is_primary {
                    return true;
                }
                if !self.is_sync_host || Some(**key) == source {
                    return false;
                }
                // full mesh peers already talk to each other
                !(source_mode == Some(PeerMode::Peer) && peer.mode() == PeerMode::Peer)
            })
            .map(|(key, _)| *key)
            .collect();

        let Some(replica) = self.registry.get_mut(id) else {
            return;
        };
        replica.targets.retain(|target| eligible.contains(&target.peer));
        if broadcast {
            for key in eligible {
                replica.add_target(key);
            }
        }
    }
}
