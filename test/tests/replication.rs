/// Basic replication between a sync host and its clients: creation,
/// incremental updates, host relaying and destruction.

use replica::{
    NewPeerEvent, PeerMode, ReplicaCreatedEvent, ReplicaDestroyedEvent, ReplicaManager,
    ReplicaOptions, Roles,
};
use replica_test::{connect, new_manager, settle, tick, LocalCarrierHub, TestHandler};

fn value_of(manager: &ReplicaManager, id: u32) -> Option<u32> {
    manager
        .replica(id)
        .and_then(|replica| replica.handler_as::<TestHandler>())
        .map(|handler| handler.value())
}

fn set_value(manager: &mut ReplicaManager, id: u32, value: u32) {
    manager
        .replica_mut(id)
        .and_then(|replica| replica.handler_as_mut::<TestHandler>())
        .expect("replica should exist")
        .set(value);
    manager.mark_dirty(id);
}

#[test]
fn client_joins_and_receives_session() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    assert!(host.is_ready());
    assert!(!client.is_ready());

    connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);

    assert!(client.is_ready());
    assert!(client.has_valid_host());
    assert!(!client.is_sync_host());
    assert_eq!(client.available_ids(), replica::REPIDS_PER_BLOCK);

    let session_info = client.session_info().expect("session info replicated");
    assert_eq!(session_info.accepted_peers(), &[1, 2]);

    let new_peers: Vec<u32> = host.events().read::<NewPeerEvent>().collect();
    assert_eq!(new_peers, vec![2]);
    let new_peers: Vec<u32> = client.events().read::<NewPeerEvent>().collect();
    assert_eq!(new_peers, vec![1]);
}

#[test]
fn replicate_and_destroy() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);
    client.take_events();

    let id = host.add_primary(TestHandler::new(5));
    tick(&hub, &mut [&mut host, &mut client]);

    let proxy = client.replica(id).expect("proxy created");
    assert!(proxy.is_proxy());
    assert_eq!(proxy.owner_seq(), 1);
    assert_eq!(value_of(&client, id), Some(5));
    let created: Vec<(u32, bool)> = client.events().read::<ReplicaCreatedEvent>().collect();
    assert_eq!(created, vec![(id, false)]);

    assert!(host.destroy(id));
    assert!(host.replica(id).is_none());
    assert!(host.is_tombstoned(id));
    tick(&hub, &mut [&mut host, &mut client]);

    assert!(client.replica(id).is_none());
    assert!(client.is_tombstoned(id));
    let destroyed: Vec<u32> = client.events().read::<ReplicaDestroyedEvent>().collect();
    assert_eq!(destroyed, vec![id]);
}

#[test]
fn deltas_follow_full_state() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);

    let id = host.add_primary(TestHandler::new(1));
    tick(&hub, &mut [&mut host, &mut client]);
    set_value(&mut host, id, 2);
    tick(&hub, &mut [&mut host, &mut client]);

    let handler = client
        .replica(id)
        .and_then(|replica| replica.handler_as::<TestHandler>())
        .expect("proxy exists");
    assert_eq!(handler.value(), 2);
    assert_eq!(handler.full_received, 1);
    assert_eq!(handler.deltas_received, 1);
    assert!(handler.updates_from_replica >= 1);
}

#[test]
fn primaries_tick_through_update() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);

    let mut handler = TestHandler::new(0);
    handler.auto_increment = true;
    let id = host.add_primary(handler);
    settle(&hub, &mut [&mut host, &mut client], 3);

    assert_eq!(value_of(&host, id), Some(3));
    assert_eq!(value_of(&client, id), Some(3));
}

#[test]
fn client_primary_reaches_host_and_other_clients() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut alice = new_manager(&hub, 2, Roles::NONE);
    let mut bob = new_manager(&hub, 3, Roles::NONE);
    connect(&hub, &mut host, PeerMode::Client, &mut alice, PeerMode::Peer);
    connect(&hub, &mut host, PeerMode::Client, &mut bob, PeerMode::Peer);
    settle(&hub, &mut [&mut host, &mut alice, &mut bob], 2);

    let id = alice.add_primary(TestHandler::new(40));
    settle(&hub, &mut [&mut host, &mut alice, &mut bob], 2);

    assert_eq!(value_of(&host, id), Some(40));
    assert_eq!(value_of(&bob, id), Some(40));
    // bob only knows the host; the relayed copy comes through it
    let host_key = bob.find_peer(1).map(|peer| peer.key());
    assert_eq!(bob.replica(id).and_then(|replica| replica.upstream()), host_key);

    set_value(&mut alice, id, 41);
    settle(&hub, &mut [&mut host, &mut alice, &mut bob], 2);
    assert_eq!(value_of(&bob, id), Some(41));
}

#[test]
fn ids_are_unique_across_the_session() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut alice = new_manager(&hub, 2, Roles::NONE);
    let mut bob = new_manager(&hub, 3, Roles::NONE);
    connect(&hub, &mut host, PeerMode::Client, &mut alice, PeerMode::Peer);
    connect(&hub, &mut host, PeerMode::Client, &mut bob, PeerMode::Peer);
    settle(&hub, &mut [&mut host, &mut alice, &mut bob], 2);

    let mut ids = Vec::new();
    for value in 0..20 {
        ids.push(host.add_primary(TestHandler::new(value)));
        ids.push(alice.add_primary(TestHandler::new(value)));
        ids.push(bob.add_primary(TestHandler::new(value)));
    }
    settle(&hub, &mut [&mut host, &mut alice, &mut bob], 3);

    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());

    for manager in [&host, &alice, &bob] {
        for id in &ids {
            assert!(manager.replica(*id).is_some(), "replica {} missing", id);
        }
    }
}

#[test]
fn shutdown_deactivates_everything_once() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);

    host.add_primary(TestHandler::new(1));
    client.add_primary(TestHandler::new(2));
    settle(&hub, &mut [&mut host, &mut client], 2);
    assert_eq!(client.replica_count(), 3);

    client.shutdown();
    assert!(!client.is_initialized());
    assert_eq!(client.replica_count(), 0);

    // a second call is a no-op
    client.shutdown();
}

#[test]
fn repeated_changes_marshal_once() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);
    let id = host.add_primary(TestHandler::new(1));
    tick(&hub, &mut [&mut host, &mut client]);

    set_value(&mut host, id, 2);
    set_value(&mut host, id, 3);
    host.mark_dirty(id);
    tick(&hub, &mut [&mut host, &mut client]);

    assert_eq!(host.marshal_task_count(), 0);
    assert!(!host.has_marshal_task(id));
    let handler = client
        .replica(id)
        .and_then(|replica| replica.handler_as::<TestHandler>())
        .expect("proxy exists");
    assert_eq!(handler.value(), 3);
    assert_eq!(handler.deltas_received, 1);
}

#[test]
fn priority_changes_stick() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let id = host.add_primary(TestHandler::new(1));
    host.mark_dirty(id);

    host.set_replica_priority(id, 7);
    assert_eq!(host.replica(id).map(|replica| replica.priority()), Some(7));

    // unknown ids are ignored
    host.set_replica_priority(9999, 1);
    assert!(host.replica(9999).is_none());
}

#[test]
fn auto_broadcast_off_sends_only_broadcast_replicas() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    host.set_auto_broadcast(false);
    connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);
    // the session info always broadcasts
    assert!(client.is_ready());

    let quiet = host.add_primary(TestHandler::new(1));
    let loud = host.add_primary_with(
        TestHandler::new(2),
        ReplicaOptions {
            broadcast: true,
            ..ReplicaOptions::default()
        },
    );
    settle(&hub, &mut [&mut host, &mut client], 2);
    assert!(client.replica(quiet).is_none());
    assert_eq!(value_of(&client, loud), Some(2));

    host.set_auto_broadcast(true);
    settle(&hub, &mut [&mut host, &mut client], 2);
    assert_eq!(value_of(&client, quiet), Some(1));
}
