use std::mem;

use log::{debug, trace, warn};

use replica_serde::{ByteReader, Serde};

use crate::{
    carrier::ReceiveState,
    command::{write_migration_step, Command, ReplicaHeader},
    error::UnmarshalError,
    peer::{frame_checksum, FRAME_CHECKSUM},
    replica::{MarshalMode, Replica, ReplicaHandler, ReplicaOptions},
    session_info::SessionInfo,
    types::{
        PeerId, PeerKey, RepIdSeed, ReplicaId, TimeContext, CMD_ACK_DOWNSTREAM,
        CMD_ACK_UPSTREAM_SUSPENDED, INVALID_PEER_ID, MAX_RESERVED_CMD_OR_ID,
        REPLICA_ID_SESSION_INFO,
    },
};

use super::{ReplicaManager, UpdateTask, SESSION_INFO_PRIORITY};

impl ReplicaManager {
    /// Read everything the carrier has queued for each peer and apply it
    pub fn unmarshal(&mut self) {
        if !self.is_initialized {
            return;
        }
        self.is_processing = true;

        self.process_connection_events();
        self.latch_time();

        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            self.receive_from_peer(key);
        }

        if self.config.debug.track_heartbeats {
            self.track_heartbeats();
        }

        self.is_processing = false;
    }

    fn latch_time(&mut self) {
        if let Some(carrier) = self.carrier.as_deref() {
            self.carrier_time = carrier.time();
        }
        let real_time = self.network_time();
        let local_lag = self
            .session_info()
            .map(|session_info| session_info.local_lag_ms())
            .unwrap_or(self.config.local_lag_ms);
        // no lag until the session is older than the lag itself
        let local_time = if real_time < local_lag {
            real_time
        } else {
            real_time - local_lag
        };
        self.time = TimeContext {
            real_time,
            local_time,
        };
    }

    fn receive_from_peer(&mut self, key: PeerKey) {
        loop {
            let connection = match self.peers.get(&key) {
                Some(peer) if peer.is_orphan() || peer.removal_scheduled => return,
                Some(peer) => match peer.connection() {
                    Some(connection) => connection,
                    None => return,
                },
                None => return,
            };
            let needs_accept = self
                .peers
                .get(&key)
                .is_some_and(|peer| peer.id() != INVALID_PEER_ID && !peer.is_accepted());
            if needs_accept && !self.accept_peer(key) {
                // leave the rest queued until the host vouches for this peer
                return;
            }

            let channel = self.config.comm_channel;
            let Some(carrier) = self.carrier.as_deref_mut() else {
                return;
            };
            let mut result = carrier.receive(&mut self.receive_buffer, connection, channel);
            if result.state == ReceiveState::InsufficientBuffer {
                self.receive_buffer.resize(result.num_bytes, 0);
                result = carrier.receive(&mut self.receive_buffer, connection, channel);
            }
            match result.state {
                ReceiveState::Ok => {}
                ReceiveState::NoMessage => return,
                ReceiveState::InsufficientBuffer => {
                    warn!(
                        "Receive buffer of {} bytes still too small for connection {}",
                        self.receive_buffer.len(),
                        connection
                    );
                    return;
                }
            }

            if let Some(peer) = self.peers.get_mut(&key) {
                peer.ticks_since_receive = 0;
            }

            let buffer = mem::take(&mut self.receive_buffer);
            let length = result.num_bytes.min(buffer.len());
            if let Err(err) = self.unmarshal_frame(key, &buffer[..length]) {
                let peer_id = self.peers.get(&key).map(|peer| peer.id()).unwrap_or(INVALID_PEER_ID);
                warn!("Dropping rest of buffer from peer {}: {}", peer_id, err);
            }
            self.receive_buffer = buffer;
        }
    }

    fn unmarshal_frame(&mut self, key: PeerKey, bytes: &[u8]) -> Result<(), UnmarshalError> {
        let mut reader = ByteReader::new(bytes);
        if FRAME_CHECKSUM {
            let expected = u32::de(&mut reader)?;
            let computed = frame_checksum(reader.remaining_slice());
            if expected != computed {
                return Err(UnmarshalError::ChecksumMismatch { expected, computed });
            }
        }
        let sent_at = u32::de(&mut reader)?;

        while !reader.is_empty() {
            let (header, command) = Command::read(&mut reader)?;
            self.on_command(key, header, command, sent_at)?;

            let accepted = match self.peers.get(&key) {
                Some(peer) => peer.id() == INVALID_PEER_ID || peer.is_accepted(),
                None => return Ok(()),
            };
            if !accepted && !self.accept_peer(key) {
                debug!("Peer is not accepted yet; discarding the rest of its buffer");
                return Ok(());
            }
        }
        Ok(())
    }

    fn on_command(
        &mut self,
        key: PeerKey,
        header: u32,
        command: Command,
        sent_at: u32,
    ) -> Result<(), UnmarshalError> {
        let peer_id = self.peers.get(&key).map(|peer| peer.id()).unwrap_or(INVALID_PEER_ID);
        if peer_id == INVALID_PEER_ID && !matches!(command, Command::Greetings { .. }) {
            return Err(UnmarshalError::NotGreeted { header });
        }

        match command {
            Command::Greetings { peer_id, host_seed } => self.on_greetings(key, peer_id, host_seed),
            Command::Heartbeat => {
                trace!("Heartbeat from peer {}", peer_id);
                Ok(())
            }
            Command::NewReplica {
                new_owner,
                header: replica_header,
                payload,
            } => self.on_new_replica(key, header, new_owner, replica_header, payload, sent_at),
            Command::DestroyProxy { id } => self.on_destroy_proxy(key, header, id),
            Command::SuspendUpstream { id, time } => {
                self.on_suspend_upstream(key, id, time);
                Ok(())
            }
            Command::AckUpstreamSuspended { id, time } => {
                self.ack_upstream_suspended(id, peer_id, time);
                Ok(())
            }
            Command::HandOff {
                id,
                owner_seq,
                time,
            } => {
                self.on_hand_off(key, id, owner_seq, time);
                Ok(())
            }
            Command::AckDownstream { id, time } => {
                self.ack_downstream(id, peer_id, time);
                Ok(())
            }
            Command::RequestIdBlock => {
                if !self.is_sync_host {
                    return Err(UnmarshalError::NotSyncHost { header });
                }
                self.grant_id_block(key, peer_id, header)
            }
            Command::GrantIdBlock { seed } => {
                let from_host = self.peers.get(&key).is_some_and(|peer| peer.is_sync_host());
                if !from_host || !self.id_block_requested {
                    return Err(UnmarshalError::UnsolicitedIdBlock { peer_id, seed });
                }
                self.id_allocator.try_add_block(seed)?;
                self.id_block_requested = false;
                debug!("Peer {} granted id block {}", peer_id, seed);
                Ok(())
            }
            Command::PeerLost { peer_id: lost } => {
                if !self.is_sync_host {
                    return Err(UnmarshalError::NotSyncHost { header });
                }
                self.on_peer_lost_report(peer_id, lost);
                Ok(())
            }
            Command::Update { id, payload } => self.on_update(key, header, id, payload, sent_at),
        }
    }

    fn on_greetings(
        &mut self,
        key: PeerKey,
        peer_id: PeerId,
        host_seed: Option<RepIdSeed>,
    ) -> Result<(), UnmarshalError> {
        let current = self.peers.get(&key).map(|peer| peer.id()).unwrap_or(INVALID_PEER_ID);
        if current != INVALID_PEER_ID {
            return Err(UnmarshalError::DuplicateGreeting { peer_id: current });
        }
        if peer_id == INVALID_PEER_ID || self.find_peer(peer_id).is_some() {
            return Err(UnmarshalError::PeerIdInUse { peer_id });
        }
        if host_seed.is_some() && self.has_valid_host() {
            return Err(UnmarshalError::DuplicateHost { peer_id });
        }
        if let Some(seed) = host_seed {
            self.id_allocator.try_add_block(seed)?;
        }

        if let Some(peer) = self.peers.get_mut(&key) {
            peer.set_id(peer_id);
            if host_seed.is_some() {
                peer.set_sync_host(true);
            }
        }
        debug!("Peer {} greeted (host: {})", peer_id, host_seed.is_some());
        Ok(())
    }

    fn on_new_replica(
        &mut self,
        key: PeerKey,
        command: u32,
        new_owner: bool,
        header: ReplicaHeader,
        mut payload: ByteReader,
        sent_at: u32,
    ) -> Result<(), UnmarshalError> {
        let id = header.id;
        let (peer_id, sender_is_host) = match self.peers.get(&key) {
            Some(peer) => (peer.id(), peer.is_sync_host()),
            None => return Ok(()),
        };

        if self.config.security.enable_strict_source_validation
            && new_owner
            && !sender_is_host
            && !(id == REPLICA_ID_SESSION_INFO && !self.has_valid_host())
        {
            return Err(UnmarshalError::UnauthorizedSource {
                peer_id,
                header: command,
                replica_id: id,
            });
        }

        if self.registry.is_tombstoned(id) {
            debug!("Skipping replica {} from peer {}: already destroyed", id, peer_id);
            return Ok(());
        }

        let time = self.time;
        if let Some(replica) = self.registry.get_mut(id) {
            let local_seq = replica.owner_seq();
            let stale = header.owner_seq < local_seq
                || (replica.is_primary() && header.owner_seq <= local_seq);
            if stale {
                debug!(
                    "Skipping stale ownership data for replica {} from peer {} (seq {} < {})",
                    id, peer_id, header.owner_seq, local_seq
                );
                return Ok(());
            }
            if self.config.security.enable_strict_source_validation
                && !new_owner
                && replica.upstream() != Some(key)
            {
                return Err(UnmarshalError::UnauthorizedSource {
                    peer_id,
                    header: command,
                    replica_id: id,
                });
            }

            let mut context = replica.context(time, Some(peer_id));
            context.sent_at = Some(sent_at);
            replica
                .handler_mut()
                .unmarshal(MarshalMode::Full, &mut payload, &context)?;

            if new_owner {
                replica.set_owner_seq(header.owner_seq);
                if replica.owner == key {
                    self.on_replica_migrated(id, false);
                } else {
                    self.change_replica_ownership(id, key);
                }
                if id == REPLICA_ID_SESSION_INFO {
                    self.on_new_host(key);
                }
            } else {
                self.on_replica_unmarshaled(id);
            }
            return Ok(());
        }

        if id < MAX_RESERVED_CMD_OR_ID && id != REPLICA_ID_SESSION_INFO {
            warn!("Peer {} sent unknown system replica {}", peer_id, id);
            return Ok(());
        }

        let handler: Option<Box<dyn ReplicaHandler>> = if id == REPLICA_ID_SESSION_INFO {
            Some(Box::new(SessionInfo::new(MAX_RESERVED_CMD_OR_ID, 0)))
        } else {
            self.factory.create_replica(id, &mut payload.clone())
        };
        let Some(handler) = handler else {
            warn!("No handler could be created for replica {} from peer {}", id, peer_id);
            return Ok(());
        };

        let mut options = ReplicaOptions {
            migratable: header.migratable,
            sync_stage: header.sync_stage,
            ..ReplicaOptions::default()
        };
        if id == REPLICA_ID_SESSION_INFO {
            options.broadcast = true;
            options.priority = SESSION_INFO_PRIORITY;
        }
        let mut replica = Replica::new(id, handler, options, key, header.owner_seq, header.create_time);
        let mut context = replica.context(time, Some(peer_id));
        context.sent_at = Some(sent_at);
        replica
            .handler_mut()
            .unmarshal(MarshalMode::Full, &mut payload, &context)?;

        if let Some(peer) = self.peers.get_mut(&key) {
            peer.add(id);
        }
        self.register_replica(replica, Some(peer_id));
        self.enqueue_update_task(id);

        if new_owner && id == REPLICA_ID_SESSION_INFO {
            self.on_new_host(key);
        }
        Ok(())
    }

    /// The session info changed hands: its sender is now the host
    fn on_new_host(&mut self, key: PeerKey) {
        for (peer_key, peer) in self.peers.iter_mut() {
            peer.set_sync_host(*peer_key == key);
        }
        self.report_orphans_to_host();
    }

    fn on_destroy_proxy(
        &mut self,
        key: PeerKey,
        command: u32,
        id: ReplicaId,
    ) -> Result<(), UnmarshalError> {
        let (peer_id, sender_is_host) = match self.peers.get(&key) {
            Some(peer) => (peer.id(), peer.is_sync_host()),
            None => return Ok(()),
        };
        let now = self.time.real_time;

        let Some(replica) = self.registry.get(id) else {
            // the create may still be in flight
            debug!("DestroyProxy for unknown replica {} from peer {}", id, peer_id);
            self.registry.tombstone(id, now);
            return Ok(());
        };
        if replica.is_primary() {
            debug!("Ignoring DestroyProxy for primary {} from peer {}", id, peer_id);
            return Ok(());
        }
        if self.config.security.enable_strict_source_validation
            && !sender_is_host
            && replica.upstream() != Some(key)
        {
            return Err(UnmarshalError::UnauthorizedSource {
                peer_id,
                header: command,
                replica_id: id,
            });
        }

        self.registry.tombstone(id, now);
        let Some(replica) = self.registry.get_mut(id) else {
            return Ok(());
        };
        if let Some(handle) = replica.update_task.take() {
            self.update_tasks.cancel(handle);
        }
        let priority = replica.priority();
        replica.update_task = Some(
            self.update_tasks
                .push(UpdateTask::DestroyedProxy(id), priority),
        );
        Ok(())
    }

    fn on_suspend_upstream(&mut self, key: PeerKey, id: ReplicaId, time: u32) {
        match self.registry.get_mut(id) {
            Some(replica) => replica.upstream_suspended = true,
            None => debug!("SuspendUpstream for unknown replica {}", id),
        }
        if let Some(peer) = self.peers.get_mut(&key) {
            write_migration_step(peer.reliable.writer(), CMD_ACK_UPSTREAM_SUSPENDED, id, time);
        }
    }

    fn on_hand_off(&mut self, key: PeerKey, id: ReplicaId, owner_seq: u32, time: u32) {
        let Some(replica) = self.registry.get_mut(id) else {
            warn!("HandOff for unknown replica {}", id);
            return;
        };
        if !replica.is_primary() {
            let seq = replica.owner_seq().max(owner_seq);
            replica.set_owner_seq(seq);
            self.change_replica_ownership(id, PeerKey::LOCAL);
        }
        if let Some(peer) = self.peers.get_mut(&key) {
            write_migration_step(peer.reliable.writer(), CMD_ACK_DOWNSTREAM, id, time);
        }
    }

    fn on_update(
        &mut self,
        key: PeerKey,
        command: u32,
        id: ReplicaId,
        mut payload: ByteReader,
        sent_at: u32,
    ) -> Result<(), UnmarshalError> {
        let peer_id = self.peers.get(&key).map(|peer| peer.id()).unwrap_or(INVALID_PEER_ID);
        let is_tombstoned = self.registry.is_tombstoned(id);
        let time = self.time;

        let Some(replica) = self.registry.get_mut(id) else {
            if is_tombstoned {
                debug!("Update for destroyed replica {} from peer {}", id, peer_id);
            } else {
                warn!("Update for unknown replica {} from peer {}", id, peer_id);
            }
            return Ok(());
        };
        if replica.is_primary() {
            debug!("Ignoring update for primary {} from peer {}", id, peer_id);
            return Ok(());
        }
        if self.config.security.enable_strict_source_validation && replica.upstream() != Some(key) {
            return Err(UnmarshalError::UnauthorizedSource {
                peer_id,
                header: command,
                replica_id: id,
            });
        }

        let mut context = replica.context(time, Some(peer_id));
        context.sent_at = Some(sent_at);
        replica
            .handler_mut()
            .unmarshal(MarshalMode::Delta, &mut payload, &context)?;
        self.on_replica_unmarshaled(id);
        Ok(())
    }

    fn track_heartbeats(&mut self) {
        let max_ticks = self.config.debug.max_ticks_per_heartbeat;
        for peer in self.peers.values_mut() {
            if !peer.is_connected() || !peer.is_accepted() {
                continue;
            }
            peer.ticks_since_receive += 1;
            if peer.ticks_since_receive == max_ticks + 1 {
                warn!(
                    "No traffic from peer {} for {} ticks",
                    peer.id(),
                    peer.ticks_since_receive
                );
            }
        }
    }
}
