use replica_serde::{ByteReader, ByteWriter, PackedSize, Serde, SerdeErr, UnsignedVariableInteger};

use crate::{
    error::UnmarshalError,
    types::{
        PeerId, RepIdSeed, ReplicaId, CMD_ACK_DOWNSTREAM, CMD_ACK_UPSTREAM_SUSPENDED, CMD_COUNT,
        CMD_DESTROY_PROXY, CMD_GRANT_ID_BLOCK, CMD_GREETINGS, CMD_HAND_OFF, CMD_HEARTBEAT,
        CMD_NEW_OWNER, CMD_NEW_PROXY, CMD_PEER_LOST, CMD_REQUEST_ID_BLOCK, CMD_SUSPEND_UPSTREAM,
    },
};

/// Identity and ownership of a replica, sent ahead of its full state
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplicaHeader {
    pub sync_stage: bool,
    pub migratable: bool,
    pub create_time: u32,
    pub owner_seq: u32,
    pub id: ReplicaId,
}

impl Serde for ReplicaHeader {
    fn ser(&self, writer: &mut ByteWriter) {
        self.sync_stage.ser(writer);
        self.migratable.ser(writer);
        self.create_time.ser(writer);
        self.owner_seq.ser(writer);
        UnsignedVariableInteger::from(self.id).ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, SerdeErr> {
        let sync_stage = bool::de(reader)?;
        let migratable = bool::de(reader)?;
        let create_time = u32::de(reader)?;
        let owner_seq = u32::de(reader)?;
        let id = read_id(reader)?;
        Ok(Self {
            sync_stage,
            migratable,
            create_time,
            owner_seq,
            id,
        })
    }

    fn byte_length(&self) -> usize {
        2 + 4 + 4 + UnsignedVariableInteger::from(self.id).byte_length()
    }
}

fn read_id(reader: &mut ByteReader) -> Result<u32, SerdeErr> {
    UnsignedVariableInteger::de(reader)?.try_to()
}

fn read_payload<'b>(reader: &mut ByteReader<'b>) -> Result<ByteReader<'b>, SerdeErr> {
    let length: usize = PackedSize::de(reader)?.try_to()?;
    reader.sub_reader(length)
}

/// One decoded entry of a peer's buffer
pub(crate) enum Command<'b> {
    Greetings {
        peer_id: PeerId,
        host_seed: Option<RepIdSeed>,
    },
    Heartbeat,
    NewReplica {
        new_owner: bool,
        header: ReplicaHeader,
        payload: ByteReader<'b>,
    },
    DestroyProxy {
        id: ReplicaId,
    },
    SuspendUpstream {
        id: ReplicaId,
        time: u32,
    },
    AckUpstreamSuspended {
        id: ReplicaId,
        time: u32,
    },
    HandOff {
        id: ReplicaId,
        owner_seq: u32,
        time: u32,
    },
    AckDownstream {
        id: ReplicaId,
        time: u32,
    },
    RequestIdBlock,
    GrantIdBlock {
        seed: RepIdSeed,
    },
    PeerLost {
        peer_id: PeerId,
    },
    Update {
        id: ReplicaId,
        payload: ByteReader<'b>,
    },
}

impl<'b> Command<'b> {
    /// Read the header value and the command it introduces
    pub fn read(reader: &mut ByteReader<'b>) -> Result<(u32, Self), UnmarshalError> {
        let header = read_id(reader)?;
        let command = match header {
            CMD_GREETINGS => {
                let peer_id = PeerId::de(reader)?;
                let is_host = bool::de(reader)?;
                let host_seed = if is_host {
                    Some(RepIdSeed::de(reader)?)
                } else {
                    None
                };
                Command::Greetings { peer_id, host_seed }
            }
            CMD_HEARTBEAT => Command::Heartbeat,
            CMD_NEW_OWNER | CMD_NEW_PROXY => {
                let replica_header = ReplicaHeader::de(reader)?;
                let payload = read_payload(reader)?;
                Command::NewReplica {
                    new_owner: header == CMD_NEW_OWNER,
                    header: replica_header,
                    payload,
                }
            }
            CMD_DESTROY_PROXY => Command::DestroyProxy {
                id: read_id(reader)?,
            },
            CMD_SUSPEND_UPSTREAM => Command::SuspendUpstream {
                id: read_id(reader)?,
                time: u32::de(reader)?,
            },
            CMD_ACK_UPSTREAM_SUSPENDED => Command::AckUpstreamSuspended {
                id: read_id(reader)?,
                time: u32::de(reader)?,
            },
            CMD_HAND_OFF => Command::HandOff {
                id: read_id(reader)?,
                owner_seq: u32::de(reader)?,
                time: u32::de(reader)?,
            },
            CMD_ACK_DOWNSTREAM => Command::AckDownstream {
                id: read_id(reader)?,
                time: u32::de(reader)?,
            },
            CMD_REQUEST_ID_BLOCK => Command::RequestIdBlock,
            CMD_GRANT_ID_BLOCK => Command::GrantIdBlock {
                seed: RepIdSeed::de(reader)?,
            },
            CMD_PEER_LOST => Command::PeerLost {
                peer_id: PeerId::de(reader)?,
            },
            header if header < CMD_COUNT => {
                return Err(UnmarshalError::InvalidCommand { header });
            }
            id => Command::Update {
                id,
                payload: read_payload(reader)?,
            },
        };
        Ok((header, command))
    }
}

// Writers

fn write_header(writer: &mut ByteWriter, header: u32) {
    UnsignedVariableInteger::from(header).ser(writer);
}

fn write_payload(writer: &mut ByteWriter, payload: &[u8]) {
    PackedSize::from(payload.len()).ser(writer);
    writer.write_bytes(payload);
}

pub(crate) fn write_greetings(writer: &mut ByteWriter, peer_id: PeerId, host_seed: Option<RepIdSeed>) {
    write_header(writer, CMD_GREETINGS);
    peer_id.ser(writer);
    host_seed.is_some().ser(writer);
    if let Some(seed) = host_seed {
        seed.ser(writer);
    }
}

pub(crate) fn write_new_replica(
    writer: &mut ByteWriter,
    new_owner: bool,
    header: &ReplicaHeader,
    payload: &[u8],
) {
    write_header(writer, if new_owner { CMD_NEW_OWNER } else { CMD_NEW_PROXY });
    header.ser(writer);
    write_payload(writer, payload);
}

pub(crate) fn write_destroy_proxy(writer: &mut ByteWriter, id: ReplicaId) {
    write_header(writer, CMD_DESTROY_PROXY);
    write_header(writer, id);
}

/// `SuspendUpstream`, `AckUpstreamSuspended` and `AckDownstream` share a layout
pub(crate) fn write_migration_step(writer: &mut ByteWriter, command: u32, id: ReplicaId, time: u32) {
    debug_assert!(matches!(
        command,
        CMD_SUSPEND_UPSTREAM | CMD_ACK_UPSTREAM_SUSPENDED | CMD_ACK_DOWNSTREAM
    ));
    write_header(writer, command);
    write_header(writer, id);
    time.ser(writer);
}

pub(crate) fn write_hand_off(writer: &mut ByteWriter, id: ReplicaId, owner_seq: u32, time: u32) {
    write_header(writer, CMD_HAND_OFF);
    write_header(writer, id);
    owner_seq.ser(writer);
    time.ser(writer);
}

pub(crate) fn write_request_id_block(writer: &mut ByteWriter) {
    write_header(writer, CMD_REQUEST_ID_BLOCK);
}

pub(crate) fn write_grant_id_block(writer: &mut ByteWriter, seed: RepIdSeed) {
    write_header(writer, CMD_GRANT_ID_BLOCK);
    seed.ser(writer);
}

pub(crate) fn write_peer_lost(writer: &mut ByteWriter, peer_id: PeerId) {
    write_header(writer, CMD_PEER_LOST);
    peer_id.ser(writer);
}

pub(crate) fn write_update(writer: &mut ByteWriter, id: ReplicaId, payload: &[u8]) {
    write_header(writer, id);
    write_payload(writer, payload);
}
