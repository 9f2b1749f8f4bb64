/// Misbehaving or malicious peers: malformed buffers, commands out of
/// order, impersonation, and strict source validation.

use replica::{
    ConnectionId, PeerMode, ReplicaId, ReplicaManager, Roles, SecurityOptions, CMD_INVALID,
    MAX_RESERVED_CMD_OR_ID, REPIDS_PER_BLOCK,
};
use replica_test::{
    connect, new_manager, settle, tick, FrameBuilder, LocalCarrierHub, TestHandler,
};

fn value_of(manager: &ReplicaManager, id: ReplicaId) -> Option<u32> {
    manager
        .replica(id)
        .and_then(|replica| replica.handler_as::<TestHandler>())
        .map(|handler| handler.value())
}

/// Host with one client holding a proxy of `id`
fn client_with_proxy(
    hub: &LocalCarrierHub,
) -> (ReplicaManager, ReplicaManager, ConnectionId, ReplicaId) {
    let mut host = new_manager(hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(hub, 2, Roles::NONE);
    let (_, client_connection) =
        connect(hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(hub, &mut [&mut host, &mut client]);
    let id = host.add_primary(TestHandler::new(10));
    tick(hub, &mut [&mut host, &mut client]);
    (host, client, client_connection, id)
}

#[test]
fn invalid_command_drops_rest_of_buffer_only() {
    let hub = LocalCarrierHub::new();
    let (_host, mut client, client_connection, id) = client_with_proxy(&hub);

    hub.inject(
        client_connection,
        FrameBuilder::new(0).header(CMD_INVALID).update(id, 50).build(),
    );
    client.unmarshal();
    assert_eq!(value_of(&client, id), Some(10));

    // the connection keeps working
    hub.inject(client_connection, FrameBuilder::new(0).update(id, 51).build());
    client.unmarshal();
    assert_eq!(value_of(&client, id), Some(51));
}

#[test]
fn truncated_buffers_are_rejected() {
    let hub = LocalCarrierHub::new();
    let (_host, mut client, client_connection, id) = client_with_proxy(&hub);

    let mut bytes = FrameBuilder::new(0).update(id, 52).build();
    bytes.truncate(bytes.len() - 2);
    hub.inject(client_connection, bytes);
    hub.inject(client_connection, vec![1, 2]);
    client.unmarshal();

    assert_eq!(value_of(&client, id), Some(10));
    assert!(client.is_ready());
}

#[test]
fn host_only_commands_are_refused_by_clients() {
    let hub = LocalCarrierHub::new();
    let (_host, mut client, client_connection, id) = client_with_proxy(&hub);
    let available = client.available_ids();

    hub.inject(
        client_connection,
        FrameBuilder::new(0).request_id_block().update(id, 60).build(),
    );
    hub.inject(
        client_connection,
        FrameBuilder::new(0).peer_lost(5).build(),
    );
    client.unmarshal();

    // the update behind the refused command was dropped with it
    assert_eq!(value_of(&client, id), Some(10));
    assert_eq!(client.available_ids(), available);
}

#[test]
fn traffic_before_greeting_is_refused() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let (host_connection, _) = hub.link();
    host.add_peer(host_connection, PeerMode::Client);

    hub.inject(
        host_connection,
        FrameBuilder::new(0).new_replica(false, 5000, 1, 1).build(),
    );
    host.unmarshal();
    assert!(host.replica(5000).is_none());
    assert!(host.peers().all(|peer| !peer.is_accepted()));

    hub.inject(host_connection, FrameBuilder::new(0).greetings(9, None).build());
    host.unmarshal();
    assert!(host.find_peer(9).is_some_and(|peer| peer.is_accepted()));
    assert!(host
        .session_info()
        .is_some_and(|session_info| session_info.is_accepted(9)));
}

#[test]
fn second_greeting_is_refused() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let (host_connection, _) = hub.link();
    host.add_peer(host_connection, PeerMode::Client);

    hub.inject(host_connection, FrameBuilder::new(0).greetings(9, None).build());
    hub.inject(host_connection, FrameBuilder::new(0).greetings(8, None).build());
    host.unmarshal();

    assert!(host.find_peer(9).is_some());
    assert!(host.find_peer(8).is_none());
}

#[test]
fn greeting_with_taken_peer_id_is_refused() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);

    let (impostor_connection, _) = hub.link();
    host.add_peer(impostor_connection, PeerMode::Client);
    hub.inject(impostor_connection, FrameBuilder::new(0).greetings(2, None).build());
    host.unmarshal();

    let impostors = host
        .peers()
        .filter(|peer| peer.connection() == Some(impostor_connection))
        .filter(|peer| peer.id() != 0)
        .count();
    assert_eq!(impostors, 0);
    assert_eq!(
        host.session_info().map(|info| info.accepted_peers().to_vec()),
        Some(vec![1, 2])
    );
}

#[test]
fn second_host_is_refused() {
    let hub = LocalCarrierHub::new();
    let (_host, mut client, _, _) = client_with_proxy(&hub);
    let available = client.available_ids();

    let (rogue_connection, _) = hub.link();
    client.add_peer(rogue_connection, PeerMode::Peer);
    hub.inject(
        rogue_connection,
        FrameBuilder::new(0).greetings(7, Some(90_000)).build(),
    );
    client.unmarshal();

    assert!(client.find_peer(7).is_none());
    assert_eq!(client.available_ids(), available);
    assert!(client.find_peer(1).is_some_and(|peer| peer.is_sync_host()));
}

#[test]
fn id_blocks_from_non_host_are_refused() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    let (host_connection, _) =
        connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);
    let available = host.available_ids();

    // the host already holds the first block
    hub.inject(
        host_connection,
        FrameBuilder::new(0).grant_id_block(MAX_RESERVED_CMD_OR_ID).build(),
    );
    hub.inject(host_connection, FrameBuilder::new(0).grant_id_block(90_000).build());
    host.unmarshal();

    assert_eq!(host.available_ids(), available);
    assert!(host.is_ready());
}

#[test]
fn unrequested_id_block_is_refused() {
    let hub = LocalCarrierHub::new();
    let (_host, mut client, client_connection, _) = client_with_proxy(&hub);
    let available = client.available_ids();

    hub.inject(client_connection, FrameBuilder::new(0).grant_id_block(90_000).build());
    client.unmarshal();

    assert_eq!(client.available_ids(), available);
}

#[test]
fn overlapping_id_block_keeps_request_open() {
    let hub = LocalCarrierHub::new();
    let (mut host, mut client, client_connection, _) = client_with_proxy(&hub);
    let own_block = MAX_RESERVED_CMD_OR_ID + REPIDS_PER_BLOCK;
    let available = client.available_ids();

    client.request_id_block();
    hub.inject(client_connection, FrameBuilder::new(0).grant_id_block(own_block).build());
    hub.inject(
        client_connection,
        FrameBuilder::new(0).grant_id_block(own_block + 10).build(),
    );
    hub.inject(client_connection, FrameBuilder::new(0).grant_id_block(u32::MAX - 5).build());
    client.unmarshal();
    assert_eq!(client.available_ids(), available);

    // the real grant still lands
    tick(&hub, &mut [&mut host, &mut client]);
    tick(&hub, &mut [&mut host, &mut client]);
    assert_eq!(client.available_ids(), available + REPIDS_PER_BLOCK);
}

#[test]
fn greeting_with_reserved_id_block_is_refused() {
    let hub = LocalCarrierHub::new();
    let mut client = new_manager(&hub, 2, Roles::NONE);
    let (rogue_connection, _) = hub.link();
    client.add_peer(rogue_connection, PeerMode::Peer);

    hub.inject(rogue_connection, FrameBuilder::new(0).greetings(7, Some(5)).build());
    client.unmarshal();

    assert!(client.find_peer(7).is_none());
    assert_eq!(client.available_ids(), 0);
    assert!(!client.has_valid_host());
}

struct Mesh {
    hub: LocalCarrierHub,
    p1: ReplicaManager,
    p2: ReplicaManager,
    p3: ReplicaManager,
    // p3's side of its link to p2
    p3_from_p2: ConnectionId,
    owned_by_p1: ReplicaId,
}

fn mesh() -> Mesh {
    let hub = LocalCarrierHub::new();
    let mut p1 = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut p2 = new_manager(&hub, 2, Roles::NONE);
    let mut p3 = new_manager(&hub, 3, Roles::NONE);
    connect(&hub, &mut p1, PeerMode::Peer, &mut p2, PeerMode::Peer);
    connect(&hub, &mut p1, PeerMode::Peer, &mut p3, PeerMode::Peer);
    let (_, p3_from_p2) = connect(&hub, &mut p2, PeerMode::Peer, &mut p3, PeerMode::Peer);
    settle(&hub, &mut [&mut p1, &mut p2, &mut p3], 2);
    let owned_by_p1 = p1.add_primary(TestHandler::new(1));
    settle(&hub, &mut [&mut p1, &mut p2, &mut p3], 2);
    Mesh {
        hub,
        p1,
        p2,
        p3,
        p3_from_p2,
        owned_by_p1,
    }
}

#[test]
fn strict_validation_rejects_updates_from_wrong_peer() {
    let Mesh {
        hub,
        mut p3,
        p3_from_p2,
        owned_by_p1: id,
        ..
    } = mesh();
    p3.set_security_options(SecurityOptions {
        enable_strict_source_validation: true,
    });

    hub.inject(p3_from_p2, FrameBuilder::new(0).update(id, 66).build());
    p3.unmarshal();

    assert_eq!(value_of(&p3, id), Some(1));
}

#[test]
fn strict_validation_rejects_ownership_claims_from_non_host() {
    let Mesh {
        hub,
        mut p3,
        p3_from_p2,
        owned_by_p1: id,
        ..
    } = mesh();
    p3.set_security_options(SecurityOptions {
        enable_strict_source_validation: true,
    });
    let upstream = p3.replica(id).and_then(|replica| replica.upstream());

    hub.inject(
        p3_from_p2,
        FrameBuilder::new(0).new_replica(true, id, 2, 66).build(),
    );
    hub.inject(p3_from_p2, FrameBuilder::new(0).destroy_proxy(id).build());
    p3.unmarshal();
    p3.update_from_replicas();

    let replica = p3.replica(id).expect("not destroyed");
    assert_eq!(replica.upstream(), upstream);
    assert_eq!(replica.owner_seq(), 1);
    assert_eq!(value_of(&p3, id), Some(1));
}

#[test]
fn lenient_validation_accepts_any_sender() {
    let Mesh {
        hub,
        mut p3,
        p3_from_p2,
        owned_by_p1: id,
        ..
    } = mesh();
    assert!(!p3.security_options().enable_strict_source_validation);

    hub.inject(p3_from_p2, FrameBuilder::new(0).update(id, 66).build());
    p3.unmarshal();

    assert_eq!(value_of(&p3, id), Some(66));
}

#[test]
fn strict_validation_allows_legitimate_traffic() {
    let Mesh {
        hub,
        mut p1,
        mut p2,
        mut p3,
        owned_by_p1: id,
        ..
    } = mesh();
    p3.set_security_options(SecurityOptions {
        enable_strict_source_validation: true,
    });

    if let Some(handler) = p1
        .replica_mut(id)
        .and_then(|replica| replica.handler_as_mut::<TestHandler>())
    {
        handler.set(2);
    }
    p1.mark_dirty(id);
    let from_p2 = p2.add_primary(TestHandler::new(20));
    settle(&hub, &mut [&mut p1, &mut p2, &mut p3], 2);

    assert_eq!(value_of(&p3, id), Some(2));
    assert_eq!(value_of(&p3, from_p2), Some(20));
}
