mod marshal;
mod migration;
mod peers;
mod unmarshal;
mod update;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    mem,
};

use log::{info, warn};

use crate::{
    carrier::{Carrier, ConnectionEvents},
    config::{ReplicaManagerConfig, Roles, SecurityOptions},
    error::ReplicaManagerError,
    events::ReplicaEvents,
    fixed_time_step::FixedTimeStep,
    id_allocator::IdAllocator,
    migration::MigrationSequence,
    peer::ReplicaPeer,
    registry::ReplicaRegistry,
    replica::{Replica, ReplicaFactory, ReplicaHandler, ReplicaOptions},
    send_allowance::SendLimit,
    session_info::SessionInfo,
    task_queue::TaskQueue,
    types::{
        ConnectionId, PeerId, PeerKey, ReplicaId, TimeContext, INVALID_PEER_ID,
        MAX_RESERVED_CMD_OR_ID, REPLICA_ID_SESSION_INFO,
    },
};

pub(crate) enum MarshalTask {
    Marshal(ReplicaId),
    /// A replica already removed from the registry whose targets still
    /// need to be told it is gone
    Zombie(Box<Replica>),
}

pub(crate) enum UpdateTask {
    Update(ReplicaId),
    DestroyedProxy(ReplicaId),
}

pub(crate) enum PeerTask {
    DestroyPeer(PeerKey),
}

const SESSION_INFO_PRIORITY: u32 = u32::MAX;
const PEER_TASK_PRIORITY: u32 = 0;

/// Keeps replicas in sync between this node and every connected peer.
///
/// Call once per tick, in order: `unmarshal`, `update_from_replicas`,
/// `update_replicas`, `marshal`.
pub struct ReplicaManager {
    config: ReplicaManagerConfig,
    carrier: Option<Box<dyn Carrier>>,
    factory: Box<dyn ReplicaFactory>,
    is_initialized: bool,
    is_processing: bool,
    is_terminating: bool,
    is_sync_host: bool,
    // Peers
    local: ReplicaPeer,
    peers: BTreeMap<PeerKey, ReplicaPeer>,
    next_peer_key: u32,
    connection_events: ConnectionEvents,
    connection_rates: HashMap<ConnectionId, u32>,
    // lost peer -> peers that still have to report losing it
    pending_peer_reports: HashMap<PeerId, HashSet<PeerId>>,
    // lost peer -> reports that arrived before we saw the loss ourselves
    early_peer_reports: HashMap<PeerId, HashSet<PeerId>>,
    // Replicas
    registry: ReplicaRegistry,
    id_allocator: IdAllocator,
    id_block_requested: bool,
    active_migrations: BTreeMap<ReplicaId, MigrationSequence>,
    // Tasks
    marshal_tasks: TaskQueue<MarshalTask>,
    update_tasks: TaskQueue<UpdateTask>,
    peer_update_tasks: TaskQueue<PeerTask>,
    // Events
    events: ReplicaEvents,
    // Time
    receive_buffer: Vec<u8>,
    time: TimeContext,
    carrier_time: u32,
    fixed_time_step: Option<FixedTimeStep>,
    last_check_time: u32,
    next_send_time: u32,
    send_limit: SendLimit,
}

impl ReplicaManager {
    /// Create a manager. `factory` builds handlers for replicas created by
    /// other peers.
    pub fn new<F: ReplicaFactory + 'static>(factory: F) -> Self {
        let config = ReplicaManagerConfig::default();
        let send_limit = SendLimit {
            bytes_per_sec: config.target_send_limit_bytes,
            burst_sec: config.target_send_limit_burst_sec,
        };
        Self {
            config,
            carrier: None,
            factory: Box::new(factory),
            is_initialized: false,
            is_processing: false,
            is_terminating: false,
            is_sync_host: false,
            local: ReplicaPeer::new_local(INVALID_PEER_ID),
            peers: BTreeMap::new(),
            next_peer_key: 0,
            connection_events: ConnectionEvents::new(),
            connection_rates: HashMap::new(),
            pending_peer_reports: HashMap::new(),
            early_peer_reports: HashMap::new(),
            registry: ReplicaRegistry::new(),
            id_allocator: IdAllocator::new(),
            id_block_requested: false,
            active_migrations: BTreeMap::new(),
            marshal_tasks: TaskQueue::new(),
            update_tasks: TaskQueue::new(),
            peer_update_tasks: TaskQueue::new(),
            events: ReplicaEvents::new(),
            receive_buffer: Vec::new(),
            time: TimeContext::default(),
            carrier_time: 0,
            fixed_time_step: None,
            last_check_time: 0,
            next_send_time: 0,
            send_limit,
        }
    }

    // Lifecycle

    /// Bind the carrier and start participating in the session
    ///
    /// # Panics
    ///
    /// Panics if already initialized or the local peer id is zero
    pub fn init(&mut self, config: ReplicaManagerConfig, carrier: Box<dyn Carrier>) {
        if let Err(err) = self.try_init(config, carrier) {
            panic!("ReplicaManager::init failed: {}", err);
        }
    }

    pub fn try_init(
        &mut self,
        mut config: ReplicaManagerConfig,
        carrier: Box<dyn Carrier>,
    ) -> Result<(), ReplicaManagerError> {
        if self.is_initialized {
            return Err(ReplicaManagerError::AlreadyInitialized);
        }
        if config.my_peer_id == INVALID_PEER_ID {
            return Err(ReplicaManagerError::InvalidPeerId);
        }

        let max_send_rate = carrier.max_send_rate();
        if config.target_send_time_ms < max_send_rate {
            config.target_send_time_ms = max_send_rate;
        }

        self.receive_buffer = vec![0; carrier.message_mtu().max(1)];
        self.local = ReplicaPeer::new_local(config.my_peer_id);
        self.send_limit = SendLimit {
            bytes_per_sec: config.target_send_limit_bytes,
            burst_sec: config.target_send_limit_burst_sec.max(1.0),
        };

        let now = carrier.time();
        self.carrier_time = now;
        self.time = TimeContext {
            real_time: now,
            local_time: now,
        };
        self.last_check_time = now;
        self.next_send_time = now.wrapping_add(config.target_send_time_ms);
        self.fixed_time_step = config
            .fixed_time_steps_per_second
            .map(|steps| FixedTimeStep::new(steps, now));

        let roles = config.roles;
        info!(
            "ReplicaManager initialized as peer {} (send interval {}ms)",
            config.my_peer_id, config.target_send_time_ms
        );
        self.config = config;
        self.carrier = Some(carrier);
        self.is_initialized = true;
        self.is_terminating = false;

        if roles.contains(Roles::SYNC_HOST) {
            self.promote();
        }
        Ok(())
    }

    /// Deactivate every replica, drop every peer and release the carrier
    ///
    /// # Panics
    ///
    /// Panics if called from inside a tick, or if replicas survive teardown
    pub fn shutdown(&mut self) {
        if self.is_processing {
            panic!("ReplicaManager::shutdown called in the middle of a tick");
        }
        if !self.is_initialized || self.is_terminating {
            return;
        }
        self.is_terminating = true;

        self.active_migrations.clear();

        for task in self.update_tasks.drain() {
            if let UpdateTask::DestroyedProxy(id) = task {
                self.unregister_replica(id);
            }
        }

        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            let ids: Vec<ReplicaId> = match self.peers.get(&key) {
                Some(peer) => peer.objects().collect(),
                None => continue,
            };
            for id in ids {
                self.unregister_replica(id);
            }
        }
        self.peers.clear();

        let ids: Vec<ReplicaId> = self.local.objects().collect();
        for id in ids {
            self.unregister_replica(id);
        }
        self.local.clear_objects();

        self.marshal_tasks.drain();
        self.peer_update_tasks.drain();

        if !self.registry.is_empty() {
            panic!(
                "ReplicaManager::shutdown left {} replicas registered",
                self.registry.len()
            );
        }
        self.registry.clear();

        self.connection_rates.clear();
        self.pending_peer_reports.clear();
        self.early_peer_reports.clear();
        self.id_allocator = IdAllocator::new();
        self.id_block_requested = false;
        self.is_sync_host = false;
        self.carrier = None;
        self.is_initialized = false;

        info!("ReplicaManager shut down");
    }

    /// Become the sync host. Creates the session info when no session
    /// exists yet, otherwise takes it over from the departed host.
    ///
    /// # Panics
    ///
    /// Panics if not initialized or if a valid host already exists
    pub fn promote(&mut self) {
        if !self.is_initialized {
            panic!("ReplicaManager must be initialized before promotion");
        }
        if self.has_valid_host() {
            panic!("Cannot promote peer {}: a valid sync host already exists", self.local.id());
        }

        self.is_sync_host = true;
        self.local.set_sync_host(true);
        for peer in self.peers.values_mut() {
            peer.set_sync_host(false);
        }

        match self.registry.get(REPLICA_ID_SESSION_INFO).map(|replica| replica.owner) {
            None => {
                let mut session_info =
                    SessionInfo::new(MAX_RESERVED_CMD_OR_ID, self.config.local_lag_ms);
                if self.id_allocator.available() == 0 {
                    let seed = session_info.next_available_id_block();
                    session_info.set_next_available_id_block(seed + crate::types::REPIDS_PER_BLOCK);
                    self.id_allocator.add_block(seed);
                }
                let options = ReplicaOptions {
                    migratable: true,
                    broadcast: true,
                    priority: SESSION_INFO_PRIORITY,
                    sync_stage: false,
                };
                let replica = Replica::new(
                    REPLICA_ID_SESSION_INFO,
                    Box::new(session_info),
                    options,
                    PeerKey::LOCAL,
                    1,
                    self.network_time(),
                );
                self.local.add(REPLICA_ID_SESSION_INFO);
                self.register_replica(replica, None);
            }
            Some(owner) => {
                if let Some(peer) = self.peers.get(&owner) {
                    if !peer.is_orphan() {
                        panic!(
                            "Cannot take over session info from peer {} while it is connected",
                            peer.id()
                        );
                    }
                }
                self.change_replica_ownership(REPLICA_ID_SESSION_INFO, PeerKey::LOCAL);
                if self.id_allocator.available() == 0 {
                    if let Err(err) = self.grant_self_id_block() {
                        warn!("Promoted without replica ids: {}", err);
                    }
                }
            }
        }

        let mut accepted = vec![self.local.id()];
        let mut orphans = Vec::new();
        for peer in self.peers.values() {
            if peer.id() == INVALID_PEER_ID || peer.removal_scheduled {
                continue;
            }
            if peer.is_orphan() {
                orphans.push(peer.id());
            } else {
                accepted.push(peer.id());
            }
        }
        if let Some(session_info) = self.session_info_mut() {
            session_info.set_accepted_peers(accepted);
        }
        self.on_replica_changed(REPLICA_ID_SESSION_INFO);

        for peer_id in orphans {
            self.request_peer_migration(peer_id);
        }

        info!("Peer {} promoted to sync host", self.local.id());
    }

    // Replicas

    /// Register a new primary owned by this node
    ///
    /// # Panics
    ///
    /// Panics if no replica ids are available
    pub fn add_primary<H: ReplicaHandler + 'static>(&mut self, handler: H) -> ReplicaId {
        self.add_primary_with(handler, ReplicaOptions::default())
    }

    pub fn add_primary_with<H: ReplicaHandler + 'static>(
        &mut self,
        handler: H,
        options: ReplicaOptions,
    ) -> ReplicaId {
        match self.try_add_primary_with(handler, options) {
            Ok(id) => id,
            Err(err) => panic!("ReplicaManager::add_primary failed: {}", err),
        }
    }

    pub fn try_add_primary_with<H: ReplicaHandler + 'static>(
        &mut self,
        handler: H,
        options: ReplicaOptions,
    ) -> Result<ReplicaId, ReplicaManagerError> {
        if !self.is_initialized {
            return Err(ReplicaManagerError::NotInitialized);
        }
        let id = self.id_allocator.try_alloc()?;
        let replica = Replica::new(
            id,
            Box::new(handler),
            options,
            PeerKey::LOCAL,
            1,
            self.network_time(),
        );
        self.local.add(id);
        self.register_replica(replica, None);
        Ok(id)
    }

    /// Destroy a replica held by this node and tell every peer that has it.
    /// Returns false if the replica is not held locally.
    pub fn destroy(&mut self, id: ReplicaId) -> bool {
        if !self.local.contains(id) {
            return false;
        }
        if id == REPLICA_ID_SESSION_INFO {
            warn!("The session info cannot be destroyed");
            return false;
        }
        self.remove_replica_from_downstream(id);
        self.registry.tombstone(id, self.time.real_time);
        self.local.remove(id);
        true
    }

    /// Queue a replica for marshaling after an application-side change
    pub fn mark_dirty(&mut self, id: ReplicaId) {
        self.on_replica_changed(id);
    }

    /// Change a replica's priority, re-ordering its queued tasks
    pub fn set_replica_priority(&mut self, id: ReplicaId, priority: u32) {
        let Some(replica) = self.registry.get_mut(id) else {
            return;
        };
        replica.options_mut().priority = priority;
        if let Some(handle) = replica.marshal_task {
            self.marshal_tasks.set_priority(handle, priority);
        }
        if let Some(handle) = replica.update_task {
            self.update_tasks.set_priority(handle, priority);
        }
    }

    pub fn find_replica(&self, id: ReplicaId) -> Option<&Replica> {
        self.registry.get(id)
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&Replica> {
        self.registry.get(id)
    }

    pub fn replica_mut(&mut self, id: ReplicaId) -> Option<&mut Replica> {
        self.registry.get_mut(id)
    }

    pub fn replica_count(&self) -> usize {
        self.registry.len()
    }

    /// Ids of every registered replica, ascending
    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        self.registry.ids()
    }

    pub fn is_tombstoned(&self, id: ReplicaId) -> bool {
        self.registry.is_tombstoned(id)
    }

    pub fn has_marshal_task(&self, id: ReplicaId) -> bool {
        self.registry
            .get(id)
            .and_then(|replica| replica.marshal_task)
            .is_some_and(|handle| self.marshal_tasks.contains(handle))
    }

    pub fn marshal_task_count(&self) -> usize {
        self.marshal_tasks.len()
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.registry
            .get(REPLICA_ID_SESSION_INFO)
            .and_then(|replica| replica.handler_as::<SessionInfo>())
    }

    fn session_info_mut(&mut self) -> Option<&mut SessionInfo> {
        self.registry
            .get_mut(REPLICA_ID_SESSION_INFO)
            .and_then(|replica| replica.handler_as_mut::<SessionInfo>())
    }

    // State

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    /// Initialized and part of a session
    pub fn is_ready(&self) -> bool {
        self.is_initialized && !self.is_terminating && self.registry.contains(REPLICA_ID_SESSION_INFO)
    }

    pub fn is_sync_host(&self) -> bool {
        self.is_sync_host
    }

    /// This node, or a connected peer, is the sync host
    pub fn has_valid_host(&self) -> bool {
        self.is_sync_host
            || self
                .peers
                .values()
                .any(|peer| peer.is_sync_host() && peer.is_connected())
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local.id()
    }

    pub fn local_peer(&self) -> &ReplicaPeer {
        &self.local
    }

    pub fn time(&self) -> TimeContext {
        self.time
    }

    pub fn available_ids(&self) -> u32 {
        self.id_allocator.available()
    }

    // Events

    pub fn events(&mut self) -> &mut ReplicaEvents {
        &mut self.events
    }

    pub fn take_events(&mut self) -> ReplicaEvents {
        mem::take(&mut self.events)
    }

    // Settings

    pub fn config(&self) -> &ReplicaManagerConfig {
        &self.config
    }

    /// Milliseconds between flushes, never below the carrier's send rate
    pub fn set_send_time_interval(&mut self, interval_ms: u32) {
        let minimum = self
            .carrier
            .as_deref()
            .map(|carrier| carrier.max_send_rate())
            .unwrap_or(0);
        self.config.target_send_time_ms = interval_ms.max(minimum);
    }

    pub fn send_time_interval(&self) -> u32 {
        self.config.target_send_time_ms
    }

    /// Outgoing bytes per second per peer; 0 is unlimited
    pub fn set_send_limit(&mut self, bytes_per_sec: u32) {
        self.send_limit.bytes_per_sec = bytes_per_sec;
        self.config.target_send_limit_bytes = bytes_per_sec;
    }

    pub fn send_limit(&self) -> u32 {
        self.send_limit.bytes_per_sec
    }

    /// Seconds of unused allowance a peer may bank, at least 1.0
    pub fn set_send_limit_burst_range(&mut self, seconds: f32) {
        let seconds = seconds.max(1.0);
        self.send_limit.burst_sec = seconds;
        self.config.target_send_limit_burst_sec = seconds;
    }

    pub fn send_limit_burst_range(&self) -> f32 {
        self.send_limit.burst_sec
    }

    pub fn set_auto_broadcast(&mut self, enabled: bool) {
        if self.config.auto_broadcast == enabled {
            return;
        }
        self.config.auto_broadcast = enabled;
        for id in self.registry.ids() {
            self.update_replica_targets(id);
            self.on_replica_changed(id);
        }
    }

    /// Set the session-wide local lag. Only the sync host may do this.
    pub fn set_local_lag_amt(&mut self, lag_ms: u32) -> Result<(), ReplicaManagerError> {
        if !self.is_sync_host {
            return Err(ReplicaManagerError::NotSyncHost);
        }
        self.config.local_lag_ms = lag_ms;
        if let Some(session_info) = self.session_info_mut() {
            session_info.set_local_lag_ms(lag_ms);
        }
        self.on_replica_changed(REPLICA_ID_SESSION_INFO);
        Ok(())
    }

    pub fn set_security_options(&mut self, security: SecurityOptions) {
        self.config.security = security;
    }

    pub fn security_options(&self) -> &SecurityOptions {
        &self.config.security
    }

    // Internals

    /// Time stamped on outgoing buffers and migration requests
    fn network_time(&self) -> u32 {
        match &self.fixed_time_step {
            Some(step) => step.current_time(),
            None => self.carrier_time,
        }
    }

    fn should_broadcast(&self, replica: &Replica) -> bool {
        self.config.auto_broadcast || replica.is_broadcast()
    }

    fn peer_mut(&mut self, key: PeerKey) -> Option<&mut ReplicaPeer> {
        if key.is_local() {
            Some(&mut self.local)
        } else {
            self.peers.get_mut(&key)
        }
    }

    fn register_replica(&mut self, replica: Replica, from: Option<PeerId>) {
        let id = replica.id();
        let is_primary = replica.is_primary();
        self.registry.insert(replica);

        let time = self.time;
        if let Some(replica) = self.registry.get_mut(id) {
            let context = replica.context(time, from);
            replica.handler_mut().on_activate(&context);
            replica.is_active = true;
        }
        self.events.push_replica_created(id, is_primary);

        self.update_replica_targets(id);
        self.on_replica_changed(id);
    }

    /// Deactivate and drop a replica without telling anyone
    fn unregister_replica(&mut self, id: ReplicaId) {
        self.cancel_tasks(id);
        let Some(mut replica) = self.registry.remove(id) else {
            return;
        };
        if replica.is_active {
            let context = replica.context(self.time, None);
            replica.handler_mut().on_deactivate(&context);
            replica.is_active = false;
        }
    }

    /// Deactivate and unregister a replica, then tell its targets
    fn remove_replica_from_downstream(&mut self, id: ReplicaId) {
        self.cancel_tasks(id);
        let Some(mut replica) = self.registry.remove(id) else {
            return;
        };
        if replica.is_active {
            let context = replica.context(self.time, None);
            replica.handler_mut().on_deactivate(&context);
            replica.is_active = false;
            self.events.push_replica_destroyed(id);
        }
        let priority = replica.priority();
        self.marshal_tasks
            .push(MarshalTask::Zombie(Box::new(replica)), priority);
    }

    fn cancel_tasks(&mut self, id: ReplicaId) {
        let Some(replica) = self.registry.get_mut(id) else {
            return;
        };
        if let Some(handle) = replica.marshal_task.take() {
            self.marshal_tasks.cancel(handle);
        }
        if let Some(handle) = replica.update_task.take() {
            self.update_tasks.cancel(handle);
        }
    }

    fn on_replica_changed(&mut self, id: ReplicaId) {
        self.registry.mark_dirty(id);
    }

    fn on_replica_unmarshaled(&mut self, id: ReplicaId) {
        if self.is_sync_host {
            self.on_replica_changed(id);
        }
        self.enqueue_update_task(id);
    }

    fn enqueue_update_task(&mut self, id: ReplicaId) {
        let Some(replica) = self.registry.get_mut(id) else {
            return;
        };
        if replica.update_task.is_some() {
            return;
        }
        let priority = replica.priority();
        replica.update_task = Some(self.update_tasks.push(UpdateTask::Update(id), priority));
    }

    /// Take a replica out of a peer's set. An orphan that loses its last
    /// replica is scheduled for removal.
    fn remove_from_peer(&mut self, key: PeerKey, id: ReplicaId) {
        let Some(peer) = self.peer_mut(key) else {
            return;
        };
        peer.remove(id);
        if key.is_local() || !peer.is_orphan() || peer.has_objects() {
            return;
        }
        let peer_id = peer.id();
        if self.pending_peer_reports.contains_key(&peer_id) {
            return;
        }
        self.on_peer_ready_to_remove(key);
    }
}
