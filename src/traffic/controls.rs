use log::warn;

use super::gate::VoteEpoch;
use super::{ControlTarget, Resource, TrafficControlGate};

/// The gates of every managed resource.
pub struct TrafficControls {
    peer: TrafficControlGate,
    electrum: TrafficControlGate,
    http: TrafficControlGate,
}

impl TrafficControls {
    pub fn new() -> TrafficControls {
        TrafficControls {
            peer: TrafficControlGate::new(Resource::Peer),
            electrum: TrafficControlGate::new(Resource::Electrum),
            http: TrafficControlGate::new(Resource::Http),
        }
    }

    pub fn gate(&self, resource: Resource) -> &TrafficControlGate {
        match resource {
            Resource::Peer => &self.peer,
            Resource::Electrum => &self.electrum,
            Resource::Http => &self.http,
        }
    }

    fn gates(&self, target: ControlTarget) -> impl Iterator<Item = &TrafficControlGate> {
        target.resources().map(|resource| self.gate(resource))
    }

    /// Vote to disconnect the target.
    pub fn increment_disconnect(&self, target: ControlTarget) {
        self.gates(target).for_each(|gate| gate.increment_disconnect())
    }

    /// Vote to connect the target.
    pub fn decrement_disconnect(&self, target: ControlTarget) {
        self.gates(target).for_each(|gate| gate.decrement_disconnect())
    }

    pub fn set_network_available(&self, available: bool) {
        self.gates(ControlTarget::ALL)
            .for_each(|gate| gate.set_network_available(available))
    }

    pub fn force_reconnect(&self, target: ControlTarget) {
        self.gates(target).for_each(|gate| gate.force_reconnect())
    }

    pub(crate) fn reset(&self) {
        self.gates(ControlTarget::ALL).for_each(|gate| gate.reset())
    }

    /// Vote to stay connected until the returned vote is released.
    pub fn hold_connected(&self, target: ControlTarget) -> Vote {
        Vote::cast(self, target, VoteKind::Connect)
    }

    /// Vote to stay disconnected until the returned vote is released.
    pub fn hold_disconnected(&self, target: ControlTarget) -> Vote {
        Vote::cast(self, target, VoteKind::Disconnect)
    }
}

impl Default for TrafficControls {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteKind {
    Connect,
    Disconnect,
}

/// A vote cast on one or more gates, undone exactly once.
///
/// [`Vote::release`] undoes it explicitly. A vote dropped while still held is
/// undone as well, so an abandoned task cannot leak it. Gates reset while the
/// vote was held already forgot it and are left untouched.
#[must_use = "dropping a vote undoes it immediately"]
pub struct Vote {
    gates: Vec<(TrafficControlGate, VoteEpoch)>,
    target: ControlTarget,
    kind: VoteKind,
}

impl Vote {
    fn cast(controls: &TrafficControls, target: ControlTarget, kind: VoteKind) -> Vote {
        let delta = kind.delta();
        let gates = controls
            .gates(target)
            .map(|gate| (gate.clone(), gate.cast_vote(delta)))
            .collect();
        Vote {
            gates,
            target,
            kind,
        }
    }

    pub fn target(&self) -> ControlTarget {
        self.target
    }

    pub fn kind(&self) -> VoteKind {
        self.kind
    }

    pub fn release(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        let delta = self.kind.delta();
        for (gate, epoch) in self.gates.drain(..) {
            gate.undo_vote(delta, epoch);
        }
    }
}

impl VoteKind {
    fn delta(self) -> i32 {
        match self {
            VoteKind::Connect => -1,
            VoteKind::Disconnect => 1,
        }
    }
}

impl Drop for Vote {
    fn drop(&mut self) {
        if !self.gates.is_empty() {
            warn!(
                "{:?} vote on {} dropped without release, undoing it",
                self.kind, self.target
            );
            self.undo();
        }
    }
}
