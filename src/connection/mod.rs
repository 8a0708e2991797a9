mod aggregator;
mod supervisor;
mod tcp_link;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

pub use aggregator::{
    aggregate, wait_until_established, ConnectionInput, Connections, ConnectionsAggregator,
    ConnectionsFeed,
};
pub use supervisor::{
    connect_timeout, BackoffConfig, ConnectionSupervisor, RetryState, SupervisorState,
};
pub use tcp_link::TcpLink;

/// Connection state of a remote resource, ordered from worst to best.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Closed,
    Establishing,
    Established,
}

impl ConnectionState {
    pub fn as_i64(&self) -> i64 {
        match self {
            ConnectionState::Closed => 0,
            ConnectionState::Establishing => 1,
            ConnectionState::Established => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Establishing => "establishing",
            ConnectionState::Established => "established",
        })
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("could not reach {name} at {address}: {source}")]
    Io {
        name: String,
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} connection aborted: {1}")]
    Aborted(String, String),
}

/// Something the wallet can be connected to: the peer socket, the chain
/// indexer socket, the http capability.
#[async_trait]
pub trait ConnectionLink: Send + Sync {
    fn name(&self) -> &str;

    /// Current state, updated by the link as the connection progresses.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Attempt a connection. `attempt` counts consecutive failed attempts
    /// plus one, implementations may use more lax parameters as it grows.
    async fn connect(&self, attempt: u32) -> Result<(), LinkError>;

    async fn disconnect(&self);
}
