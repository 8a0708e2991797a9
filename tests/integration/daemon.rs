use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wallet_sentinel::connection::{BackoffConfig, ConnectionState};
use wallet_sentinel::daemon::{ConnectionsDaemon, Links};
use wallet_sentinel::traffic::{ControlTarget, Resource};

use crate::mocks::{MockLink, MockNetwork};

#[tokio::test(start_paused = true)]
async fn test_daemon_follows_votes_and_network() {
    let peer = MockLink::new("peer");
    let electrum = MockLink::new("electrum");
    let http = MockLink::new("http");
    let network = MockNetwork::new(true);
    let daemon = ConnectionsDaemon::start(
        Links {
            peer: peer.clone(),
            electrum: electrum.clone(),
            http: http.clone(),
        },
        &network,
        BackoffConfig::default(),
        CancellationToken::new(),
    );

    let connections = daemon
        .wait_until_established(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(connections.global, ConnectionState::Established);
    assert_eq!(http.current(), ConnectionState::Established);

    let vote = daemon.traffic().hold_disconnected(ControlTarget::PEER);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(peer.current(), ConnectionState::Closed);
    assert_eq!(daemon.connections().borrow().global, ConnectionState::Closed);
    assert_eq!(electrum.current(), ConnectionState::Established);

    // Reset drops the vote but keeps the network state.
    daemon.reset();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(peer.current(), ConnectionState::Established);
    let control = daemon.traffic().gate(Resource::Peer).settled().await;
    assert_eq!(control.disconnect_votes, 0);
    assert!(control.network_available);
    // The reset already dropped the vote, releasing it changes nothing.
    vote.release();
    assert_eq!(
        daemon
            .traffic()
            .gate(Resource::Peer)
            .settled()
            .await
            .disconnect_votes,
        0
    );

    network.set_available(false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(peer.current(), ConnectionState::Closed);
    assert_eq!(electrum.current(), ConnectionState::Closed);
    assert_eq!(http.current(), ConnectionState::Closed);
    assert!(daemon
        .wait_until_established(Duration::from_secs(1))
        .await
        .is_err());

    network.set_available(true);
    daemon
        .wait_until_established(Duration::from_secs(5))
        .await
        .unwrap();

    daemon.stop().await;
    assert_eq!(peer.current(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_connect_vote_held_across_reset() {
    let peer = MockLink::new("peer");
    let electrum = MockLink::new("electrum");
    let network = MockNetwork::new(false);
    let daemon = ConnectionsDaemon::start(
        Links {
            peer: peer.clone(),
            electrum: electrum.clone(),
            http: MockLink::new("http"),
        },
        &network,
        BackoffConfig::default(),
        CancellationToken::new(),
    );
    let vote = daemon.traffic().hold_connected(ControlTarget::ELECTRUM);
    tokio::time::sleep(Duration::from_millis(10)).await;

    daemon.reset();
    network.set_available(true);
    vote.release();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let control = daemon.traffic().gate(Resource::Electrum).settled().await;
    assert_eq!(control.disconnect_votes, 0);
    assert!(control.should_connect());
    assert_eq!(electrum.current(), ConnectionState::Established);
    daemon.stop().await;
}
