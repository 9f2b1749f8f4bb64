use replica_serde::{ByteReader, Serde, SerdeErr};

use crate::{
    replica::{MarshalMode, MarshalOutput, ReplicaContext, ReplicaHandler},
    types::{PeerId, RepIdSeed},
};

/// Session-wide state owned by the sync host and replicated to every peer
/// under the reserved id `REPLICA_ID_SESSION_INFO`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionInfo {
    accepted_peers: Vec<PeerId>,
    next_available_id_block: RepIdSeed,
    local_lag_ms: u32,
}

impl SessionInfo {
    pub(crate) fn new(next_available_id_block: RepIdSeed, local_lag_ms: u32) -> Self {
        Self {
            accepted_peers: Vec::new(),
            next_available_id_block,
            local_lag_ms,
        }
    }

    pub fn accepted_peers(&self) -> &[PeerId] {
        &self.accepted_peers
    }

    pub fn is_accepted(&self, peer_id: PeerId) -> bool {
        self.accepted_peers.contains(&peer_id)
    }

    /// Returns false if the peer was already listed
    pub(crate) fn accept_peer(&mut self, peer_id: PeerId) -> bool {
        if self.is_accepted(peer_id) {
            return false;
        }
        self.accepted_peers.push(peer_id);
        true
    }

    pub(crate) fn remove_peer(&mut self, peer_id: PeerId) -> bool {
        let before = self.accepted_peers.len();
        self.accepted_peers.retain(|accepted| *accepted != peer_id);
        before != self.accepted_peers.len()
    }

    pub(crate) fn set_accepted_peers(&mut self, accepted_peers: Vec<PeerId>) {
        self.accepted_peers = accepted_peers;
    }

    pub fn next_available_id_block(&self) -> RepIdSeed {
        self.next_available_id_block
    }

    pub(crate) fn set_next_available_id_block(&mut self, seed: RepIdSeed) {
        self.next_available_id_block = seed;
    }

    pub fn local_lag_ms(&self) -> u32 {
        self.local_lag_ms
    }

    pub(crate) fn set_local_lag_ms(&mut self, local_lag_ms: u32) {
        self.local_lag_ms = local_lag_ms;
    }
}

impl ReplicaHandler for SessionInfo {
    // small enough to always send whole
    fn marshal(&mut self, output: &mut MarshalOutput) {
        let writer = output.reliable();
        self.accepted_peers.ser(writer);
        self.next_available_id_block.ser(writer);
        self.local_lag_ms.ser(writer);
    }

    fn unmarshal(
        &mut self,
        _mode: MarshalMode,
        reader: &mut ByteReader,
        _context: &ReplicaContext,
    ) -> Result<(), SerdeErr> {
        let accepted_peers = Vec::<PeerId>::de(reader)?;
        let next_available_id_block = RepIdSeed::de(reader)?;
        let local_lag_ms = u32::de(reader)?;

        self.accepted_peers = accepted_peers;
        self.next_available_id_block = next_available_id_block;
        self.local_lag_ms = local_lag_ms;
        Ok(())
    }
}
