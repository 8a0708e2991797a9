//! Connection traffic control.
//!
//! Many unrelated parts of the wallet want a say in whether a remote resource
//! should be connected: the foreground UI, push notification handlers,
//! background jobs. Each of them casts a "disconnect vote" and must later undo
//! it, a bit like a retain count:
//!
//! - `disconnect_votes > 0` forces a disconnect and prevents new attempts.
//! - `disconnect_votes <= 0` connects whenever the network is available.
//!
//! Votes are only ever applied through a [`TrafficControlGate`], which
//! serialises every mutation through a single task. Resetting a gate starts a
//! new epoch: votes cast before it are dropped and undoing them is a no-op.

mod controls;
mod gate;

use std::fmt;
use std::ops::BitOr;

pub use controls::{TrafficControls, Vote, VoteKind};
pub use gate::TrafficControlGate;

/// A remote resource whose connection is arbitrated by a gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Peer,
    Electrum,
    Http,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Peer, Resource::Electrum, Resource::Http];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Peer => "peer",
            Resource::Electrum => "electrum",
            Resource::Http => "http",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The arbitration state of one resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficControl {
    pub network_available: bool,
    pub disconnect_votes: i32,
    /// Bumped to force the connection loop to restart from scratch.
    pub config_version: u32,
    /// Bumped by every reset.
    pub reset_epoch: u32,
}

impl TrafficControl {
    pub fn should_connect(&self) -> bool {
        self.network_available && self.disconnect_votes <= 0
    }

    pub fn with_vote(self, delta: i32) -> TrafficControl {
        TrafficControl {
            disconnect_votes: self.disconnect_votes.saturating_add(delta),
            ..self
        }
    }

    pub fn increment_disconnect(self) -> TrafficControl {
        self.with_vote(1)
    }

    pub fn decrement_disconnect(self) -> TrafficControl {
        self.with_vote(-1)
    }

    pub fn with_network_available(self, network_available: bool) -> TrafficControl {
        TrafficControl {
            network_available,
            ..self
        }
    }

    pub fn bump_config_version(self) -> TrafficControl {
        TrafficControl {
            config_version: self.config_version.wrapping_add(1),
            ..self
        }
    }

    /// Fresh state in a new epoch.
    pub fn reset(self) -> TrafficControl {
        TrafficControl {
            reset_epoch: self.reset_epoch.wrapping_add(1),
            ..TrafficControl::default()
        }
    }
}

impl fmt::Display for TrafficControl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "should_connect={} votes={} network={} config={}",
            if self.should_connect() { "YES" } else { "NO" },
            self.disconnect_votes,
            if self.network_available { "OK" } else { "NOK" },
            self.config_version
        )
    }
}

/// Bitmask selecting the gates a vote applies to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ControlTarget(u8);

impl ControlTarget {
    pub const NONE: ControlTarget = ControlTarget(0);
    pub const PEER: ControlTarget = ControlTarget(0b001);
    pub const ELECTRUM: ControlTarget = ControlTarget(0b010);
    pub const HTTP: ControlTarget = ControlTarget(0b100);
    pub const ALL: ControlTarget = ControlTarget(0b111);

    pub fn contains(&self, resource: Resource) -> bool {
        self.0 & ControlTarget::from(resource).0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Selected resources, always in peer, electrum, http order.
    pub fn resources(self) -> impl Iterator<Item = Resource> {
        Resource::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

impl From<Resource> for ControlTarget {
    fn from(resource: Resource) -> Self {
        match resource {
            Resource::Peer => ControlTarget::PEER,
            Resource::Electrum => ControlTarget::ELECTRUM,
            Resource::Http => ControlTarget::HTTP,
        }
    }
}

impl BitOr for ControlTarget {
    type Output = ControlTarget;

    fn bitor(self, rhs: ControlTarget) -> ControlTarget {
        ControlTarget(self.0 | rhs.0)
    }
}

impl fmt::Display for ControlTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.resources().map(|r| r.as_str()).collect();
        f.write_str(&names.join("+"))
    }
}
