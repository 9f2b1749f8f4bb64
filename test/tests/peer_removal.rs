/// What happens to a peer's replicas when its connection goes away.

use std::thread;

use replica::{
    PeerMode, PeerRemovedEvent, ReplicaDestroyedEvent, ReplicaOptions, Roles,
    REPLICA_ID_SESSION_INFO,
};
use replica_test::{connect, new_manager, settle, tick, LocalCarrierHub, TestHandler};

#[test]
fn host_adopts_migratable_replicas_of_lost_client() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut alice = new_manager(&hub, 2, Roles::NONE);
    let mut bob = new_manager(&hub, 3, Roles::NONE);
    let (host_to_alice, _) = connect(&hub, &mut host, PeerMode::Client, &mut alice, PeerMode::Peer);
    connect(&hub, &mut host, PeerMode::Client, &mut bob, PeerMode::Peer);
    settle(&hub, &mut [&mut host, &mut alice, &mut bob], 2);

    let adopted = alice.add_primary(TestHandler::new(7));
    let pinned = alice.add_primary_with(
        TestHandler::new(8),
        ReplicaOptions {
            migratable: false,
            ..ReplicaOptions::default()
        },
    );
    settle(&hub, &mut [&mut host, &mut alice, &mut bob], 2);
    assert!(bob.replica(adopted).is_some() && bob.replica(pinned).is_some());
    bob.take_events();

    hub.cut(host_to_alice);
    host.remove_peer(host_to_alice);
    drop(alice);
    assert!(host.replica(pinned).is_none());
    assert!(host
        .session_info()
        .is_some_and(|session_info| !session_info.is_accepted(2)));

    settle(&hub, &mut [&mut host, &mut bob], 2);

    let on_host = host.replica(adopted).expect("host adopted it");
    assert!(on_host.is_primary());
    assert_eq!(on_host.owner_seq(), 2);
    let on_bob = bob.replica(adopted).expect("bob keeps a proxy");
    assert!(on_bob.is_proxy());
    assert_eq!(on_bob.owner_seq(), 2);
    assert_eq!(
        on_bob
            .handler_as::<TestHandler>()
            .map(|handler| handler.value()),
        Some(7)
    );

    assert!(bob.replica(pinned).is_none());
    let destroyed: Vec<u32> = bob.events().read::<ReplicaDestroyedEvent>().collect();
    assert_eq!(destroyed, vec![pinned]);
    assert_eq!(
        bob.session_info().map(|info| info.accepted_peers().to_vec()),
        Some(vec![1, 3])
    );

    let removed: Vec<u32> = host.events().read::<PeerRemovedEvent>().collect();
    assert_eq!(removed, vec![2]);
    assert!(host.find_peer(2).is_none());
}

#[test]
fn client_discards_orphans_of_lost_host() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    let (host_to_client, client_to_host) =
        connect(&hub, &mut host, PeerMode::Client, &mut client, PeerMode::Peer);
    tick(&hub, &mut [&mut host, &mut client]);
    let from_host = host.add_primary(TestHandler::new(1));
    let own = client.add_primary(TestHandler::new(2));
    settle(&hub, &mut [&mut host, &mut client], 2);
    client.take_events();

    hub.cut(host_to_client);
    client.remove_peer(client_to_host);

    // the records survive until someone decides their fate
    assert!(client.replica(from_host).is_some());
    assert!(client.find_peer(1).is_some_and(|peer| peer.is_orphan()));
    assert!(!client.has_valid_host());

    client.discard_orphans(1);
    assert!(client.replica(from_host).is_none());
    assert!(client.replica(REPLICA_ID_SESSION_INFO).is_none());
    assert!(client.replica(own).is_some_and(|replica| replica.is_primary()));
    assert!(!client.is_ready());

    client.update_from_replicas();
    let removed: Vec<u32> = client.events().read::<PeerRemovedEvent>().collect();
    assert_eq!(removed, vec![1]);
    let mut destroyed: Vec<u32> = client.events().read::<ReplicaDestroyedEvent>().collect();
    destroyed.sort_unstable();
    let mut expected = vec![REPLICA_ID_SESSION_INFO, from_host];
    expected.sort_unstable();
    assert_eq!(destroyed, expected);
}

#[test]
fn ungreeted_connection_is_dropped_at_once() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let (connection, _) = hub.link();
    host.add_peer(connection, PeerMode::Client);
    assert_eq!(host.peers().count(), 1);

    host.remove_peer(connection);
    host.update_from_replicas();

    assert_eq!(host.peers().count(), 0);
}

#[test]
fn removing_unknown_connection_is_harmless() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);

    host.remove_peer(404);
    host.update_from_replicas();

    assert!(host.is_ready());
}

#[test]
fn connection_events_arrive_from_other_threads() {
    let hub = LocalCarrierHub::new();
    let mut host = new_manager(&hub, 1, Roles::SYNC_HOST);
    let mut client = new_manager(&hub, 2, Roles::NONE);
    let (host_connection, client_connection) = hub.link();
    client.add_peer(client_connection, PeerMode::Peer);

    let events = host.connection_events();
    thread::spawn(move || events.push_connected(host_connection, PeerMode::Client))
        .join()
        .expect("event thread");

    tick(&hub, &mut [&mut host, &mut client]);
    assert!(host.find_peer(2).is_some_and(|peer| peer.is_accepted()));
    assert!(client.is_ready());

    let events = host.connection_events();
    thread::spawn(move || events.push_disconnected(host_connection))
        .join()
        .expect("event thread");
    hub.cut(host_connection);

    settle(&hub, &mut [&mut host], 2);
    assert!(host.find_peer(2).is_none());
    let removed: Vec<u32> = host.events().read::<PeerRemovedEvent>().collect();
    assert_eq!(removed, vec![2]);
}

#[test]
fn queued_client_connection_is_skipped_by_non_host() {
    let hub = LocalCarrierHub::new();
    let mut client = new_manager(&hub, 2, Roles::NONE);
    let (connection, _) = hub.link();

    client
        .connection_events()
        .push_connected(connection, PeerMode::Client);
    client.unmarshal();

    assert_eq!(client.peers().count(), 0);
    assert!(client.connection_events().is_empty());
}
