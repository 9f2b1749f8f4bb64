use std::any::Any;

use replica_serde::{ByteReader, ByteWriter, SerdeErr};

use crate::{
    task_queue::TaskHandle,
    types::{PeerId, PeerKey, ReplicaId, TimeContext},
};

/// Lets the manager recover a concrete handler type from a boxed one
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalMode {
    /// Everything a peer needs to construct the replica from nothing
    Full,
    /// Changes since the previous `Delta` marshal
    Delta,
}

/// Where a handler writes its state. In `Full` mode both streams are the
/// same reliable buffer.
pub struct MarshalOutput {
    mode: MarshalMode,
    reliable: ByteWriter,
    unreliable: ByteWriter,
}

impl MarshalOutput {
    pub(crate) fn new(mode: MarshalMode) -> Self {
        Self {
            mode,
            reliable: ByteWriter::new(),
            unreliable: ByteWriter::with_capacity(0),
        }
    }

    pub fn mode(&self) -> MarshalMode {
        self.mode
    }

    pub fn reliable(&mut self) -> &mut ByteWriter {
        &mut self.reliable
    }

    pub fn unreliable(&mut self) -> &mut ByteWriter {
        match self.mode {
            MarshalMode::Full => &mut self.reliable,
            MarshalMode::Delta => &mut self.unreliable,
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.reliable.to_bytes(), self.unreliable.to_bytes())
    }
}

/// What a handler hook can know about the replica it is attached to
#[derive(Debug, Clone, Copy)]
pub struct ReplicaContext {
    pub id: ReplicaId,
    pub time: TimeContext,
    pub is_primary: bool,
    /// Peer the triggering data came from, when there is one
    pub from: Option<PeerId>,
    /// Sender's network time for data being unmarshaled
    pub sent_at: Option<u32>,
}

/// Application side of a replica: owns the replicated state and turns it
/// into bytes and back. The manager never looks inside the payload.
pub trait ReplicaHandler: AsAny + Send {
    fn on_activate(&mut self, _context: &ReplicaContext) {}

    fn on_deactivate(&mut self, _context: &ReplicaContext) {}

    /// The replica became primary (`context.is_primary`) or stopped being it
    fn on_change_ownership(&mut self, _context: &ReplicaContext) {}

    /// Simulate a primary for one tick. Return true if its state changed and
    /// needs to be sent.
    fn update(&mut self, _context: &ReplicaContext) -> bool {
        false
    }

    /// Runs from the update queue after new state arrived for a proxy
    fn update_from_replica(&mut self, _context: &ReplicaContext) {}

    fn marshal(&mut self, output: &mut MarshalOutput);

    fn unmarshal(
        &mut self,
        mode: MarshalMode,
        reader: &mut ByteReader,
        context: &ReplicaContext,
    ) -> Result<(), SerdeErr>;
}

/// Builds handlers for replicas first seen on the wire. `reader` is a copy
/// positioned at the start of the full-state payload, so a factory can peek
/// at a type tag; the handler's `unmarshal` still sees the whole payload.
pub trait ReplicaFactory: Send {
    fn create_replica(
        &mut self,
        id: ReplicaId,
        reader: &mut ByteReader,
    ) -> Option<Box<dyn ReplicaHandler>>;
}

impl<F> ReplicaFactory for F
where
    F: FnMut(ReplicaId, &mut ByteReader) -> Option<Box<dyn ReplicaHandler>> + Send,
{
    fn create_replica(
        &mut self,
        id: ReplicaId,
        reader: &mut ByteReader,
    ) -> Option<Box<dyn ReplicaHandler>> {
        self(id, reader)
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    /// May move to another peer; non-migratable replicas die with their owner
    pub migratable: bool,
    /// Send to every accepted peer even when auto-broadcast is off
    pub broadcast: bool,
    /// Higher values are marshaled first
    pub priority: u32,
    pub sync_stage: bool,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            migratable: true,
            broadcast: false,
            priority: 100,
            sync_stage: false,
        }
    }
}

/// A peer this replica is forwarded to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaTarget {
    pub peer: PeerKey,
    /// The peer has been sent the full state
    pub synced: bool,
}

pub struct Replica {
    id: ReplicaId,
    handler: Box<dyn ReplicaHandler>,
    options: ReplicaOptions,
    owner_seq: u32,
    create_time: u32,
    pub(crate) owner: PeerKey,
    pub(crate) targets: Vec<ReplicaTarget>,
    pub(crate) is_active: bool,
    pub(crate) is_dirty: bool,
    pub(crate) changed_owner: bool,
    pub(crate) upstream_suspended: bool,
    pub(crate) marshal_task: Option<TaskHandle>,
    pub(crate) update_task: Option<TaskHandle>,
}

impl Replica {
    pub(crate) fn new(
        id: ReplicaId,
        handler: Box<dyn ReplicaHandler>,
        options: ReplicaOptions,
        owner: PeerKey,
        owner_seq: u32,
        create_time: u32,
    ) -> Self {
        Self {
            id,
            handler,
            options,
            owner_seq,
            create_time,
            owner,
            targets: Vec::new(),
            is_active: false,
            is_dirty: false,
            changed_owner: false,
            upstream_suspended: false,
            marshal_task: None,
            update_task: None,
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Held by the local peer, and therefore authoritative
    pub fn is_primary(&self) -> bool {
        self.owner.is_local()
    }

    pub fn is_proxy(&self) -> bool {
        !self.is_primary()
    }

    /// The peer this replica's state arrives through; `None` for primaries
    pub fn upstream(&self) -> Option<PeerKey> {
        if self.owner.is_local() {
            None
        } else {
            Some(self.owner)
        }
    }

    pub fn owner_seq(&self) -> u32 {
        self.owner_seq
    }

    pub(crate) fn set_owner_seq(&mut self, owner_seq: u32) {
        self.owner_seq = owner_seq;
    }

    pub fn create_time(&self) -> u32 {
        self.create_time
    }

    pub fn options(&self) -> &ReplicaOptions {
        &self.options
    }

    pub(crate) fn options_mut(&mut self) -> &mut ReplicaOptions {
        &mut self.options
    }

    pub fn is_migratable(&self) -> bool {
        self.options.migratable
    }

    pub fn is_broadcast(&self) -> bool {
        self.options.broadcast
    }

    pub fn priority(&self) -> u32 {
        self.options.priority
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn is_upstream_suspended(&self) -> bool {
        self.upstream_suspended
    }

    pub fn targets(&self) -> &[ReplicaTarget] {
        &self.targets
    }

    pub fn has_target(&self, peer: PeerKey) -> bool {
        self.targets.iter().any(|target| target.peer == peer)
    }

    pub(crate) fn add_target(&mut self, peer: PeerKey) {
        if !self.has_target(peer) {
            self.targets.push(ReplicaTarget {
                peer,
                synced: false,
            });
        }
    }

    pub(crate) fn remove_target(&mut self, peer: PeerKey) {
        self.targets.retain(|target| target.peer != peer);
    }

    pub fn handler(&self) -> &dyn ReplicaHandler {
        self.handler.as_ref()
    }

    pub fn handler_mut(&mut self) -> &mut dyn ReplicaHandler {
        self.handler.as_mut()
    }

    /// Downcast the handler to its concrete type
    pub fn handler_as<T: ReplicaHandler + Any>(&self) -> Option<&T> {
        self.handler().as_any().downcast_ref::<T>()
    }

    pub fn handler_as_mut<T: ReplicaHandler + Any>(&mut self) -> Option<&mut T> {
        self.handler_mut().as_any_mut().downcast_mut::<T>()
    }

    pub(crate) fn context(&self, time: TimeContext, from: Option<PeerId>) -> ReplicaContext {
        ReplicaContext {
            id: self.id,
            time,
            is_primary: self.is_primary(),
            from,
            sent_at: None,
        }
    }
}
