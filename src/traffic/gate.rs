use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch};

use super::{Resource, TrafficControl};
use crate::prometheus;

type Transform = Box<dyn FnOnce(TrafficControl) -> TrafficControl + Send>;

enum Command {
    Apply(Transform),
    Subscribe(mpsc::UnboundedSender<TrafficControl>),
    Settle(oneshot::Sender<TrafficControl>),
}

/// Reset epoch a vote was applied in, recorded by the gate task.
#[derive(Clone, Debug, Default)]
pub(crate) struct VoteEpoch(Arc<AtomicU32>);

/// Single writer for the [`TrafficControl`] of one resource.
///
/// Callers enqueue pure transforms which a dedicated task applies in order, so
/// concurrent votes are never lost. Subscribers receive every state the gate
/// goes through, in the order the mutations were applied.
#[derive(Clone)]
pub struct TrafficControlGate {
    resource: Resource,
    commands: mpsc::UnboundedSender<Command>,
    current: watch::Receiver<TrafficControl>,
}

impl TrafficControlGate {
    /// Must be called from within a tokio runtime.
    pub fn new(resource: Resource) -> TrafficControlGate {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (current_tx, current) = watch::channel(TrafficControl::default());
        tokio::spawn(run_gate(resource, receiver, current_tx));
        TrafficControlGate {
            resource,
            commands,
            current,
        }
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// Vote to disconnect. Must be balanced by one [`Self::decrement_disconnect`].
    pub fn increment_disconnect(&self) {
        self.apply_vote(1)
    }

    /// Vote to connect, or undo a previous disconnect vote.
    pub fn decrement_disconnect(&self) {
        self.apply_vote(-1)
    }

    fn apply_vote(&self, delta: i32) {
        self.apply(move |control| control.with_vote(delta))
    }

    /// Applies `delta` and remembers the epoch it landed in, see [`Self::undo_vote`].
    pub(crate) fn cast_vote(&self, delta: i32) -> VoteEpoch {
        let epoch = VoteEpoch::default();
        let applied = epoch.clone();
        self.apply(move |control| {
            applied.0.store(control.reset_epoch, Ordering::SeqCst);
            control.with_vote(delta)
        });
        epoch
    }

    /// Reverts a vote of [`Self::cast_vote`]. A reset since then already dropped it.
    pub(crate) fn undo_vote(&self, delta: i32, epoch: VoteEpoch) {
        let resource = self.resource;
        self.apply(move |control| {
            if control.reset_epoch == epoch.0.load(Ordering::SeqCst) {
                control.with_vote(delta.saturating_neg())
            } else {
                debug!("{resource} vote was cast before the last reset, nothing to undo");
                control
            }
        })
    }

    pub fn set_network_available(&self, available: bool) {
        self.apply(move |control| control.with_network_available(available))
    }

    /// Restart the connection loop without touching the votes.
    pub fn force_reconnect(&self) {
        self.apply(TrafficControl::bump_config_version)
    }

    /// Back to the state of a freshly created gate, used when a wallet session is torn down.
    /// Votes cast before are forgotten.
    pub(crate) fn reset(&self) {
        self.apply(TrafficControl::reset)
    }

    /// Stream of every state applied from now on, starting with the current one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TrafficControl> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if self.commands.send(Command::Subscribe(sender)).is_err() {
            warn!("{} traffic control is closed, subscription dropped", self.resource);
        }
        receiver
    }

    /// Latest applied state. Mutations still queued are not reflected.
    pub fn current(&self) -> TrafficControl {
        *self.current.borrow()
    }

    pub fn should_connect(&self) -> bool {
        self.current().should_connect()
    }

    /// State once every mutation enqueued before this call has been applied.
    pub async fn settled(&self) -> TrafficControl {
        let (sender, receiver) = oneshot::channel();
        if self.commands.send(Command::Settle(sender)).is_err() {
            return self.current();
        }
        receiver.await.unwrap_or_else(|_| self.current())
    }

    fn apply(&self, change: impl FnOnce(TrafficControl) -> TrafficControl + Send + 'static) {
        if self.commands.send(Command::Apply(Box::new(change))).is_err() {
            warn!("{} traffic control is closed, change dropped", self.resource);
        }
    }
}

async fn run_gate(
    resource: Resource,
    mut commands: mpsc::UnboundedReceiver<Command>,
    current: watch::Sender<TrafficControl>,
) {
    let mut state = TrafficControl::default();
    let mut subscribers: Vec<mpsc::UnboundedSender<TrafficControl>> = Vec::new();
    prometheus::record_traffic(resource, &state);
    while let Some(command) = commands.recv().await {
        match command {
            Command::Apply(change) => {
                let next = change(state);
                if next == state {
                    continue;
                }
                state = next;
                debug!("{resource} {state}");
                prometheus::record_traffic(resource, &state);
                current.send_replace(state);
                subscribers.retain(|subscriber| subscriber.send(state).is_ok());
            }
            Command::Subscribe(subscriber) => {
                if subscriber.send(state).is_ok() {
                    subscribers.push(subscriber);
                }
            }
            Command::Settle(reply) => {
                let _ = reply.send(state);
            }
        }
    }
    debug!("{resource} traffic control stopped");
}
