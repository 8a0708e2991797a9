//! Wires the traffic controls, the connection supervisors and the network
//! monitor of one wallet together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{
    aggregate, wait_until_established, BackoffConfig, ConnectionLink, ConnectionSupervisor,
    Connections, ConnectionsFeed, SupervisorState,
};
use crate::network::{NetworkMonitor, NetworkState};
use crate::traffic::{Resource, TrafficControls};

/// The links the daemon keeps connected.
pub struct Links {
    pub peer: Arc<dyn ConnectionLink>,
    pub electrum: Arc<dyn ConnectionLink>,
    pub http: Arc<dyn ConnectionLink>,
}

pub struct ConnectionsDaemon {
    traffic: Arc<TrafficControls>,
    network: watch::Receiver<NetworkState>,
    connections: ConnectionsFeed,
    supervisors: Vec<(Resource, ConnectionSupervisor)>,
    forwarder: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ConnectionsDaemon {
    /// Must be called from within a tokio runtime.
    pub fn start(
        links: Links,
        monitor: &dyn NetworkMonitor,
        backoff: BackoffConfig,
        cancel: CancellationToken,
    ) -> ConnectionsDaemon {
        let traffic = Arc::new(TrafficControls::new());
        let connections = aggregate(
            links.peer.state(),
            links.electrum.state(),
            monitor.network_state(),
            cancel.child_token(),
        );
        let supervisors = [
            (Resource::Peer, links.peer),
            (Resource::Electrum, links.electrum),
            (Resource::Http, links.http),
        ]
        .into_iter()
        .map(|(resource, link)| {
            let supervisor = ConnectionSupervisor::start(
                link,
                traffic.gate(resource),
                backoff,
                cancel.child_token(),
            );
            (resource, supervisor)
        })
        .collect();
        let forwarder = tokio::spawn(forward_network(
            monitor.network_state(),
            traffic.clone(),
            cancel.child_token(),
        ));
        info!("connections daemon started");
        ConnectionsDaemon {
            traffic,
            network: monitor.network_state(),
            connections,
            supervisors,
            forwarder,
            cancel,
        }
    }

    pub fn traffic(&self) -> Arc<TrafficControls> {
        self.traffic.clone()
    }

    /// Most recent aggregate status.
    pub fn connections(&self) -> watch::Receiver<Connections> {
        self.connections.latest()
    }

    /// Every aggregate status from now on, starting with the current one.
    pub fn subscribe_connections(&self) -> mpsc::UnboundedReceiver<Connections> {
        self.connections.subscribe()
    }

    pub fn supervisor_state(&self, resource: Resource) -> Option<watch::Receiver<SupervisorState>> {
        self.supervisors
            .iter()
            .find(|(r, _)| *r == resource)
            .map(|(_, supervisor)| supervisor.state())
    }

    pub async fn wait_until_established(&self, timeout: Duration) -> Result<Connections> {
        let mut connections = self.connections();
        wait_until_established(&mut connections, timeout).await
    }

    /// Drops every vote and config change, keeping the network state.
    pub fn reset(&self) {
        info!("resetting traffic controls");
        self.traffic.reset();
        let available = self.network.borrow().is_available();
        self.traffic.set_network_available(available);
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        for (_, supervisor) in self.supervisors {
            supervisor.stop().await;
        }
        let _ = self.forwarder.await;
        info!("connections daemon stopped");
    }
}

async fn forward_network(
    mut network: watch::Receiver<NetworkState>,
    traffic: Arc<TrafficControls>,
    cancel: CancellationToken,
) {
    loop {
        let available = network.borrow_and_update().is_available();
        traffic.set_network_available(available);
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = network.changed() => if changed.is_err() {
                break;
            },
        }
    }
    debug!("network forwarding stopped");
}
