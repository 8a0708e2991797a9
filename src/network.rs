//! Network reachability, fed into every traffic control gate.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkState {
    Available,
    NotAvailable,
}

impl NetworkState {
    pub fn is_available(&self) -> bool {
        *self == NetworkState::Available
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self {
            NetworkState::Available => ConnectionState::Established,
            NetworkState::NotAvailable => ConnectionState::Closed,
        }
    }
}

pub trait NetworkMonitor: Send + Sync {
    fn network_state(&self) -> watch::Receiver<NetworkState>;
}

/// Derives network availability from periodic TCP connections to a well known address.
pub struct ProbeNetworkMonitor {
    state: Arc<watch::Sender<NetworkState>>,
}

impl ProbeNetworkMonitor {
    pub fn start(
        address: String,
        interval: Duration,
        cancel: CancellationToken,
    ) -> ProbeNetworkMonitor {
        let (state, _) = watch::channel(NetworkState::NotAvailable);
        let state = Arc::new(state);
        let sender = state.clone();
        tokio::spawn(async move {
            let probe_timeout = interval.min(Duration::from_secs(5));
            loop {
                let next = match tokio::time::timeout(probe_timeout, TcpStream::connect(&address))
                    .await
                {
                    Ok(Ok(_)) => NetworkState::Available,
                    Ok(Err(e)) => {
                        debug!("network probe to {address} failed: {e}");
                        NetworkState::NotAvailable
                    }
                    Err(_) => {
                        debug!("network probe to {address} timed out");
                        NetworkState::NotAvailable
                    }
                };
                if sender.send_if_modified(|current| {
                    let changed = *current != next;
                    *current = next;
                    changed
                }) {
                    info!("internet is available = {}", next.is_available());
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        ProbeNetworkMonitor { state }
    }
}

impl NetworkMonitor for ProbeNetworkMonitor {
    fn network_state(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }
}
