use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::debug;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::ConnectionState;
use crate::network::NetworkState;
use crate::prometheus;

/// Latest state of every connection the wallet depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connections {
    pub peer: ConnectionState,
    pub electrum: ConnectionState,
    pub internet: ConnectionState,
    /// The worst of the three.
    pub global: ConnectionState,
}

impl Connections {
    pub fn new(
        peer: ConnectionState,
        electrum: ConnectionState,
        internet: ConnectionState,
    ) -> Connections {
        Connections {
            peer,
            electrum,
            internet,
            global: peer.min(electrum).min(internet),
        }
    }
}

impl Default for Connections {
    fn default() -> Self {
        Connections::new(
            ConnectionState::Closed,
            ConnectionState::Closed,
            ConnectionState::Closed,
        )
    }
}

impl fmt::Display for Connections {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "global={} peer={} electrum={} internet={}",
            self.global, self.peer, self.electrum, self.internet
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionInput {
    Peer(ConnectionState),
    Electrum(ConnectionState),
    Internet(ConnectionState),
}

/// Memo of the latest inputs, recomputed on every change.
#[derive(Debug, Default)]
pub struct ConnectionsAggregator {
    latest: Connections,
}

impl ConnectionsAggregator {
    pub fn new() -> ConnectionsAggregator {
        ConnectionsAggregator::default()
    }

    pub fn latest(&self) -> Connections {
        self.latest
    }

    /// Returns the new status when the input changed anything.
    pub fn update(&mut self, input: ConnectionInput) -> Option<Connections> {
        let Connections {
            mut peer,
            mut electrum,
            mut internet,
            ..
        } = self.latest;
        match input {
            ConnectionInput::Peer(state) => peer = state,
            ConnectionInput::Electrum(state) => electrum = state,
            ConnectionInput::Internet(state) => internet = state,
        }
        let next = Connections::new(peer, electrum, internet);
        if next == self.latest {
            return None;
        }
        self.latest = next;
        Some(next)
    }
}

/// Output of [`aggregate`].
///
/// [`Self::subscribe`] yields every recomputed status in order. [`Self::latest`]
/// only keeps the most recent one, for readers that poll or wait on a condition.
#[derive(Clone)]
pub struct ConnectionsFeed {
    latest: watch::Receiver<Connections>,
    subscriptions: mpsc::UnboundedSender<mpsc::UnboundedSender<Connections>>,
}

impl ConnectionsFeed {
    pub fn latest(&self) -> watch::Receiver<Connections> {
        self.latest.clone()
    }

    /// Every status from now on, starting with the current one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Connections> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Err(mpsc::error::SendError(sender)) = self.subscriptions.send(sender) {
            // aggregator stopped, hand out the final status only
            let _ = sender.send(*self.latest.borrow());
        }
        receiver
    }
}

/// Spawns a task combining the three sources into one [`Connections`] stream.
pub fn aggregate(
    mut peer: watch::Receiver<ConnectionState>,
    mut electrum: watch::Receiver<ConnectionState>,
    mut network: watch::Receiver<NetworkState>,
    cancel: CancellationToken,
) -> ConnectionsFeed {
    let mut aggregator = ConnectionsAggregator::new();
    aggregator.update(ConnectionInput::Peer(*peer.borrow_and_update()));
    aggregator.update(ConnectionInput::Electrum(*electrum.borrow_and_update()));
    aggregator.update(ConnectionInput::Internet(
        network.borrow_and_update().connection_state(),
    ));
    let (sender, latest) = watch::channel(aggregator.latest());
    let (subscriptions, mut subscription_rx) = mpsc::unbounded_channel::<mpsc::UnboundedSender<Connections>>();
    prometheus::record_connections(&aggregator.latest());

    tokio::spawn(async move {
        let mut subscribers: Vec<mpsc::UnboundedSender<Connections>> = Vec::new();
        loop {
            let input = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(subscriber) = subscription_rx.recv() => {
                    if subscriber.send(aggregator.latest()).is_ok() {
                        subscribers.push(subscriber);
                    }
                    continue;
                }
                changed = peer.changed() => match changed {
                    Ok(()) => ConnectionInput::Peer(*peer.borrow_and_update()),
                    Err(_) => break,
                },
                changed = electrum.changed() => match changed {
                    Ok(()) => ConnectionInput::Electrum(*electrum.borrow_and_update()),
                    Err(_) => break,
                },
                changed = network.changed() => match changed {
                    Ok(()) => ConnectionInput::Internet(network.borrow_and_update().connection_state()),
                    Err(_) => break,
                },
            };
            if let Some(connections) = aggregator.update(input) {
                debug!("connections changed: {connections}");
                prometheus::record_connections(&connections);
                sender.send_replace(connections);
                subscribers.retain(|subscriber| subscriber.send(connections).is_ok());
            }
        }
        debug!("connections aggregator stopped");
    });
    ConnectionsFeed {
        latest,
        subscriptions,
    }
}

/// Waits, at most `timeout`, for every connection to be established.
pub async fn wait_until_established(
    connections: &mut watch::Receiver<Connections>,
    timeout: Duration,
) -> Result<Connections> {
    match tokio::time::timeout(
        timeout,
        connections.wait_for(|c| c.global == ConnectionState::Established),
    )
    .await
    {
        Ok(Ok(connections)) => Ok(*connections),
        Ok(Err(_)) => Err(anyhow!("connections are no longer monitored")),
        Err(_) => Err(anyhow!("connections not established after {timeout:?}")),
    }
}
