/// Destroyed ids and out-of-date ownership data must not bring replicas
/// back.

use replica::{ConnectionId, PeerMode, ReplicaId, ReplicaManager, Roles};
use replica_test::{connect, new_manager, tick, FrameBuilder, LocalCarrierHub, TestHandler};

struct Session {
    hub: LocalCarrierHub,
    host: ReplicaManager,
    client: ReplicaManager,
    host_connection: ConnectionId,
    client_connection: ConnectionId,
}

fn session() -> Session {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    let (host_connection, client_connection) =
        connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);
    Session {
        hub,
        host,
        client,
        host_connection,
        client_connection,
    }
}

fn value_of(manager: &ReplicaManager, id: ReplicaId) -> Option<u32> {
    manager
        .replica(id)
        .and_then(|replica| replica.handler_as::<TestHandler>())
        .map(|handler| handler.value())
}

#[test]
fn late_traffic_for_destroyed_replica_is_ignored() {
    let Session {
        hub,
        mut host,
        mut client,
        client_connection,
        ..
    } = session();
    let id = host.add_primary(TestHandler::new(1));
    tick(&hub, &mut [&mut host, &mut client]);
    assert!(host.destroy(id));
    tick(&hub, &mut [&mut host, &mut client]);
    assert!(client.is_tombstoned(id));

    hub.inject(client_connection, FrameBuilder::new(0).update(id, 9).build());
    hub.inject(
        client_connection,
        FrameBuilder::new(0).new_replica(false, id, 5, 9).build(),
    );
    client.unmarshal();
    client.update_from_replicas();

    assert!(client.replica(id).is_none());
}

#[test]
fn destroy_is_idempotent() {
    let Session {
        hub,
        mut host,
        mut client,
        ..
    } = session();
    let id = host.add_primary(TestHandler::new(1));
    tick(&hub, &mut [&mut host, &mut client]);

    assert!(host.destroy(id));
    assert!(!host.destroy(id));
    tick(&hub, &mut [&mut host, &mut client]);

    // a proxy cannot be destroyed locally
    let other = host.add_primary(TestHandler::new(2));
    tick(&hub, &mut [&mut host, &mut client]);
    assert!(!client.destroy(other));
    assert!(client.replica(other).is_some());
}

#[test]
fn destroy_for_unknown_replica_still_tombstones() {
    let Session {
        mut client,
        hub,
        client_connection,
        ..
    } = session();

    hub.inject(client_connection, FrameBuilder::new(0).destroy_proxy(4000).build());
    client.unmarshal();
    assert!(client.is_tombstoned(4000));

    // the create that raced the destroy stays dead
    hub.inject(
        client_connection,
        FrameBuilder::new(0).new_replica(false, 4000, 1, 3).build(),
    );
    client.unmarshal();
    assert!(client.replica(4000).is_none());
}

#[test]
fn tombstones_expire() {
    let Session {
        hub,
        mut host,
        mut client,
        ..
    } = session();
    let id = host.add_primary(TestHandler::new(1));
    tick(&hub, &mut [&mut host, &mut client]);
    assert!(host.destroy(id));
    tick(&hub, &mut [&mut host, &mut client]);
    assert!(client.is_tombstoned(id));

    let expiration = client.config().tombstone_expiration_ms;
    hub.advance(expiration - 1);
    client.unmarshal();
    client.update_replicas();
    assert!(client.is_tombstoned(id));

    hub.advance(1);
    client.unmarshal();
    client.update_replicas();
    assert!(!client.is_tombstoned(id));
}

#[test]
fn stale_ownership_data_is_skipped() {
    let Session {
        hub,
        mut host,
        mut client,
        client_connection,
        ..
    } = session();
    let id = host.add_primary(TestHandler::new(5));
    tick(&hub, &mut [&mut host, &mut client]);
    assert_eq!(client.replica(id).map(|replica| replica.owner_seq()), Some(1));

    hub.inject(
        client_connection,
        FrameBuilder::new(0).new_replica(false, id, 0, 77).build(),
    );
    client.unmarshal();
    assert_eq!(value_of(&client, id), Some(5));

    // the same owner generation is still current
    hub.inject(
        client_connection,
        FrameBuilder::new(0).new_replica(false, id, 1, 78).build(),
    );
    client.unmarshal();
    assert_eq!(value_of(&client, id), Some(78));
}

#[test]
fn primary_ignores_equal_ownership_claims() {
    let Session {
        hub,
        mut host,
        mut client,
        host_connection,
        ..
    } = session();
    let id = host.add_primary(TestHandler::new(5));
    tick(&hub, &mut [&mut host, &mut client]);

    hub.inject(
        host_connection,
        FrameBuilder::new(0).new_replica(true, id, 1, 99).build(),
    );
    host.unmarshal();

    let replica = host.replica(id).expect("still held");
    assert!(replica.is_primary());
    assert_eq!(value_of(&host, id), Some(5));
}

#[test]
fn unknown_replicas_are_created_through_the_factory() {
    let Session {
        hub,
        mut client,
        client_connection,
        ..
    } = session();

    hub.inject(
        client_connection,
        FrameBuilder::new(0).new_replica(false, 5000, 1, 3).build(),
    );
    // reserved ids other than the session info are never created
    hub.inject(
        client_connection,
        FrameBuilder::new(0).new_replica(false, 20, 1, 3).build(),
    );
    client.unmarshal();

    let replica = client.replica(5000).expect("created");
    assert!(replica.is_proxy());
    assert_eq!(value_of(&client, 5000), Some(3));
    assert!(client.replica(20).is_none());
}
