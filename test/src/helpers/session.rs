use replica::{ConnectionId, PeerId, PeerMode, ReplicaManager, ReplicaManagerConfig, Roles};

use crate::{helpers::test_factory, local_carrier::LocalCarrierHub};

/// Clock advance per tick; longer than the default send interval so every
/// tick flushes
pub const TICK_MS: u32 = 20;

pub fn new_manager(hub: &LocalCarrierHub, peer_id: PeerId, roles: Roles) -> ReplicaManager {
    let config = ReplicaManagerConfig {
        my_peer_id: peer_id,
        roles,
        ..ReplicaManagerConfig::default()
    };
    let mut manager = ReplicaManager::new(test_factory());
    manager.init(config, hub.carrier());
    manager
}

/// Link two managers. Returns the connection id each side uses for the
/// other.
pub fn connect(
    hub: &LocalCarrierHub,
    a: &mut ReplicaManager,
    a_mode: PeerMode,
    b: &mut ReplicaManager,
    b_mode: PeerMode,
) -> (ConnectionId, ConnectionId) {
    let (a_connection, b_connection) = hub.link();
    a.add_peer(a_connection, a_mode);
    b.add_peer(b_connection, b_mode);
    (a_connection, b_connection)
}

/// Advance the clock and run one full tick on every manager, in order
pub fn tick(hub: &LocalCarrierHub, managers: &mut [&mut ReplicaManager]) {
    hub.advance(TICK_MS);
    for manager in managers.iter_mut() {
        manager.unmarshal();
        manager.update_from_replicas();
        manager.update_replicas();
        manager.marshal();
    }
}

pub fn settle(hub: &LocalCarrierHub, managers: &mut [&mut ReplicaManager], ticks: usize) {
    for _ in 0..ticks {
        tick(hub, managers);
    }
}
